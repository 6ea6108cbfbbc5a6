// logtail - app/page_cache.rs
//
// Paged read cache in front of a slow upstream.
//
// Reads are answered from resident pages only and never block on the
// upstream: a miss returns default rows marked NotCached and queues the page.
// The tick fetches queued pages (most recently requested first, at most
// `max_pages` per tick), evicts the least recently used pages beyond
// `max_pages`, forwards upstream modifications and then reports which
// sections became readable.
//
// Upstream invalidations drop or truncate the affected pages immediately.
// A fetch that raced with an invalidation is discarded (generation check).

use crate::app::listeners::Listeners;
use crate::app::scheduler::TaskScheduler;
use crate::app::source::{LogSource, LogSourceListener, Tick, Ticker};
use crate::core::changes::Coalescer;
use crate::core::column::{columns, ColumnDescriptor, RetrievalState, Value};
use crate::core::model::{LogBuffer, LogEntry, Modification, Section};
use crate::core::property::{PropertyDescriptor, PropertySet};
use crate::platform::config::CacheConfig;
use crate::util::constants::DEFAULT_LISTENER_MAX_WAIT_MS;
use crate::util::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Page {
    rows: Vec<LogEntry>,
    last_used: u64,
}

struct CacheState {
    page_size: usize,
    pages: HashMap<usize, Page>,
    /// Access counter for LRU.
    clock: u64,
    /// Requested pages, most recent first.
    fetch_queue: VecDeque<usize>,
    /// Bumped by every invalidation.
    generation: u64,
    /// Upstream count as of the last upstream notification.
    upstream_count: usize,
    /// Count reported to our own listeners.
    visible_count: usize,
    /// Upstream modifications not yet forwarded.
    pending: Vec<Modification>,
}

impl CacheState {
    fn invalidate_from(&mut self, row: usize) {
        self.generation += 1;
        let page_size = self.page_size;
        self.pages.retain(|&page, cached| {
            let start = page * page_size;
            if start >= row {
                return false;
            }
            cached.rows.truncate(row - start);
            true
        });
    }

    fn request(&mut self, page: usize, limit: usize) {
        if self.fetch_queue.front() == Some(&page) {
            return;
        }
        self.fetch_queue.retain(|&p| p != page);
        self.fetch_queue.push_front(page);
        self.fetch_queue.truncate(limit);
    }

    fn evict(&mut self, max_pages: usize) {
        while self.pages.len() > max_pages {
            let Some(oldest) = self
                .pages
                .iter()
                .min_by_key(|(_, p)| p.last_used)
                .map(|(&index, _)| index)
            else {
                break;
            };
            self.pages.remove(&oldest);
            tracing::trace!(page = oldest, "Page evicted");
        }
    }
}

/// Applies upstream invalidations to the cache as soon as they happen.
struct UpstreamListener {
    state: Arc<Mutex<CacheState>>,
}

impl LogSourceListener for UpstreamListener {
    fn on_modified(&self, _source: &dyn LogSource, modification: Modification) {
        let mut state = self.state.lock();
        match modification {
            Modification::Reset => {
                state.generation += 1;
                state.pages.clear();
                state.fetch_queue.clear();
            }
            Modification::Removed(section) => state.invalidate_from(section.index),
            Modification::Appended(_) => {}
        }
        state.upstream_count = modification.apply(state.upstream_count);
        state.pending.push(modification);
    }
}

/// A page-cached view of an upstream source.
pub struct PageBufferedLogSource {
    upstream: Arc<dyn LogSource>,
    upstream_listener: Arc<UpstreamListener>,
    config: CacheConfig,
    owns_upstream: bool,
    state: Arc<Mutex<CacheState>>,
    listeners: Listeners,
    ticker: Ticker,
    disposed: AtomicBool,
}

impl PageBufferedLogSource {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        upstream: Arc<dyn LogSource>,
        config: CacheConfig,
        owns_upstream: bool,
    ) -> Arc<Self> {
        let state = Arc::new(Mutex::new(CacheState {
            page_size: config.page_size.max(1),
            pages: HashMap::new(),
            clock: 0,
            fetch_queue: VecDeque::new(),
            generation: 0,
            upstream_count: 0,
            visible_count: 0,
            pending: Vec::new(),
        }));
        let upstream_listener = Arc::new(UpstreamListener {
            state: state.clone(),
        });
        let period = config.poll_interval;
        let cache = Arc::new(Self {
            upstream: upstream.clone(),
            upstream_listener,
            config,
            owns_upstream,
            state,
            listeners: Listeners::new(),
            ticker: Ticker::new(scheduler),
            disposed: AtomicBool::new(false),
        });
        upstream.add_listener(
            cache.upstream_listener.clone(),
            Duration::from_millis(DEFAULT_LISTENER_MAX_WAIT_MS),
            cache.config.page_size.max(1),
        );
        cache.ticker.start(&cache, "page cache".to_string(), period);
        cache
    }

    /// Number of resident pages.
    pub fn cached_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    fn page_size(&self) -> usize {
        self.config.page_size.max(1)
    }

    fn max_pages(&self) -> usize {
        self.config.max_pages.max(1)
    }

    /// Fetch one page from upstream and store it unless an invalidation
    /// raced with the read. Returns the section now readable.
    fn fetch(&self, page: usize, upstream_columns: &[ColumnDescriptor]) -> Option<Section> {
        let (generation, upstream_count) = {
            let state = self.state.lock();
            (state.generation, state.upstream_count)
        };
        let start = page * self.page_size();
        let end = upstream_count.min(start + self.page_size());
        if end <= start {
            return None;
        }
        let rows: Vec<LogEntry> = self
            .upstream
            .get_entries(Section::new(start, end - start), upstream_columns)
            .into_entries()
            .into_iter()
            .take_while(|row| row.index().is_some())
            .collect();
        if rows.is_empty() {
            return None;
        }

        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::trace!(page, "Fetched page discarded; upstream changed meanwhile");
            return None;
        }
        state.clock += 1;
        let fetched = Section::new(start, rows.len());
        let last_used = state.clock;
        state.pages.insert(page, Page { rows, last_used });
        state.evict(self.max_pages());
        Some(fetched)
    }
}

impl Tick for PageBufferedLogSource {
    fn tick(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        let (pending, requests, old_visible) = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            let take = state.fetch_queue.len().min(self.max_pages());
            let requests: Vec<usize> = state.fetch_queue.drain(..take).collect();
            (pending, requests, state.visible_count)
        };

        let mut coalescer = Coalescer::new(old_visible);
        coalescer.extend(pending);
        let changes = coalescer.modifications();
        let visible = coalescer.count();
        self.state.lock().visible_count = visible;

        let mut retrieved = Vec::new();
        if !requests.is_empty() {
            let upstream_columns = self.upstream.columns();
            for page in requests {
                if let Some(section) = self.fetch(page, &upstream_columns) {
                    retrieved.push(section);
                }
            }
            tracing::trace!(pages = retrieved.len(), "Pages fetched");
        }

        let mut notifications = self.listeners.changed(&changes, visible, true);
        for section in retrieved {
            let end = section.end().min(visible);
            if end > section.index {
                notifications.append(
                    self.listeners
                        .retrieved(Section::new(section.index, end - section.index)),
                );
            }
        }
        notifications.deliver(self);
        Ok(())
    }
}

impl LogSource for PageBufferedLogSource {
    fn columns(&self) -> Vec<ColumnDescriptor> {
        let mut out = self.upstream.columns();
        if !out.contains(&columns::RETRIEVAL_STATE) {
            out.push(columns::RETRIEVAL_STATE);
        }
        out
    }

    fn properties(&self) -> Vec<PropertyDescriptor> {
        self.upstream.properties()
    }

    fn count(&self) -> usize {
        self.state.lock().visible_count
    }

    fn get_all_properties(&self, destination: &mut PropertySet) {
        self.upstream.get_all_properties(destination);
    }

    fn get_entries_at(&self, indices: &[usize], wanted: &[ColumnDescriptor]) -> LogBuffer {
        let page_size = self.page_size();
        let queue_limit = self.max_pages() * 2;
        let mut buffer = LogBuffer::with_capacity(wanted, indices.len());
        let mut state = self.state.lock();
        state.clock += 1;
        let now = state.clock;
        for &index in indices {
            let page = index / page_size;
            let resident = if index < state.visible_count {
                state.pages.get_mut(&page).and_then(|cached| {
                    cached.last_used = now;
                    cached.rows.get(index - page * page_size)
                })
            } else {
                None
            };
            let mut entry = match resident {
                Some(row) => {
                    let mut entry = row.project(wanted);
                    if entry.contains(&columns::RETRIEVAL_STATE) {
                        entry.set(
                            columns::RETRIEVAL_STATE,
                            Value::RetrievalState(RetrievalState::Retrieved),
                        );
                    }
                    buffer.push(&entry);
                    continue;
                }
                None => LogEntry::with_defaults(wanted),
            };
            if index < state.visible_count {
                state.request(page, queue_limit);
                if entry.contains(&columns::RETRIEVAL_STATE) {
                    entry.set(
                        columns::RETRIEVAL_STATE,
                        Value::RetrievalState(RetrievalState::NotCached),
                    );
                }
            }
            buffer.push(&entry);
        }
        buffer
    }

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        min_lines_before_flush: usize,
    ) {
        self.listeners.add(listener, max_wait, min_lines_before_flush);
    }

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) -> bool {
        self.listeners.remove(listener)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ticker.stop();
        self.listeners.clear();
        let listener: Arc<dyn LogSourceListener> = self.upstream_listener.clone();
        self.upstream.remove_listener(&listener);
        {
            let mut state = self.state.lock();
            state.pages.clear();
            state.fetch_queue.clear();
        }
        if self.owns_upstream {
            self.upstream.dispose();
        }
        tracing::debug!(owns_upstream = self.owns_upstream, "Page cache disposed");
    }
}
