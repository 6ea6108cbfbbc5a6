// logtail - app/proxy.rs
//
// A stable handle in front of a replaceable source.
//
// Consumers register with the proxy once. Swapping the inner source (for
// example a filter built from a new predicate) queues a reset; the next
// tick forwards it and re-reports the new inner's rows, so every listener
// replays to the new count without re-subscribing. Changes still queued
// from the previous inner are dropped with its listener.

use crate::app::listeners::Listeners;
use crate::app::scheduler::TaskScheduler;
use crate::app::source::{LogSource, LogSourceListener, Tick, Ticker};
use crate::core::column::ColumnDescriptor;
use crate::core::model::{LogBuffer, Modification, Section};
use crate::core::property::{PropertyDescriptor, PropertySet};
use crate::util::constants::{DEFAULT_LISTENER_BATCH_LINES, DEFAULT_LISTENER_MAX_WAIT_MS};
use crate::util::error::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Queues what one inner source reports. Replaced on every swap.
#[derive(Default)]
struct InnerListener {
    modifications: Mutex<Vec<Modification>>,
    retrieved: Mutex<Vec<Section>>,
}

impl InnerListener {
    fn starting_with(modification: Modification) -> Arc<Self> {
        Arc::new(Self {
            modifications: Mutex::new(vec![modification]),
            retrieved: Mutex::new(Vec::new()),
        })
    }
}

impl LogSourceListener for InnerListener {
    fn on_modified(&self, _source: &dyn LogSource, modification: Modification) {
        self.modifications.lock().push(modification);
    }

    fn on_retrieved(&self, _source: &dyn LogSource, section: Section) {
        self.retrieved.lock().push(section);
    }
}

struct Inner {
    source: Option<Arc<dyn LogSource>>,
    listener: Arc<InnerListener>,
    /// Bumped on every swap.
    generation: u64,
}

/// A source that forwards to a replaceable inner source.
pub struct LogSourceProxy {
    inner: Mutex<Inner>,
    /// Row count last reported to listeners.
    visible_count: Mutex<usize>,
    listeners: Listeners,
    ticker: Ticker,
    disposed: AtomicBool,
}

impl LogSourceProxy {
    /// Front `inner` (or nothing yet) and forward its changes every `period`.
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        inner: Option<Arc<dyn LogSource>>,
        period: Duration,
    ) -> Arc<Self> {
        let listener = Arc::new(InnerListener::default());
        if let Some(source) = &inner {
            Self::subscribe(source, &listener);
        }
        let proxy = Arc::new(Self {
            inner: Mutex::new(Inner {
                source: inner,
                listener,
                generation: 0,
            }),
            visible_count: Mutex::new(0),
            listeners: Listeners::new(),
            ticker: Ticker::new(scheduler),
            disposed: AtomicBool::new(false),
        });
        proxy.ticker.start(&proxy, "proxy".to_string(), period);
        proxy
    }

    fn subscribe(source: &Arc<dyn LogSource>, listener: &Arc<InnerListener>) {
        source.add_listener(
            listener.clone(),
            Duration::from_millis(DEFAULT_LISTENER_MAX_WAIT_MS),
            DEFAULT_LISTENER_BATCH_LINES,
        );
    }

    fn current(&self) -> Option<Arc<dyn LogSource>> {
        self.inner.lock().source.clone()
    }

    /// Replace the inner source and return the previous one. The previous
    /// source is not disposed; that is up to the caller.
    pub fn set_inner(&self, source: Option<Arc<dyn LogSource>>) -> Option<Arc<dyn LogSource>> {
        let listener = InnerListener::starting_with(Modification::Reset);
        let (previous, old_listener, generation) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            let old_listener = std::mem::replace(&mut inner.listener, listener.clone());
            let previous = std::mem::replace(&mut inner.source, source.clone());
            (previous, old_listener, inner.generation)
        };

        if let Some(old) = &previous {
            let old_listener: Arc<dyn LogSourceListener> = old_listener;
            old.remove_listener(&old_listener);
        }
        if let Some(new) = &source {
            Self::subscribe(new, &listener);
        }
        tracing::debug!(generation, has_inner = source.is_some(), "Proxy inner source replaced");
        previous
    }

    pub fn inner(&self) -> Option<Arc<dyn LogSource>> {
        self.current()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}

impl Tick for LogSourceProxy {
    fn tick(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        let (source, listener) = {
            let inner = self.inner.lock();
            (inner.source.clone(), inner.listener.clone())
        };
        let changes = std::mem::take(&mut *listener.modifications.lock());
        let retrieved = std::mem::take(&mut *listener.retrieved.lock());
        let count = source.as_ref().map_or(0, |s| s.count());
        *self.visible_count.lock() = count;

        let mut notifications = self.listeners.changed(&changes, count, true);
        for section in retrieved {
            let end = section.end().min(count);
            if end > section.index {
                notifications.append(self.listeners.retrieved(Section::new(section.index, end - section.index)));
            }
        }
        notifications.deliver(self);
        Ok(())
    }
}

impl LogSource for LogSourceProxy {
    fn columns(&self) -> Vec<ColumnDescriptor> {
        self.current().map_or_else(Vec::new, |s| s.columns())
    }

    fn properties(&self) -> Vec<PropertyDescriptor> {
        self.current().map_or_else(Vec::new, |s| s.properties())
    }

    fn count(&self) -> usize {
        *self.visible_count.lock()
    }

    fn get_all_properties(&self, destination: &mut PropertySet) {
        if let Some(source) = self.current() {
            source.get_all_properties(destination);
        }
    }

    fn get_entries_at(&self, indices: &[usize], columns: &[ColumnDescriptor]) -> LogBuffer {
        match self.current() {
            Some(source) => source.get_entries_at(indices, columns),
            None => {
                let mut buffer = LogBuffer::with_capacity(columns, indices.len());
                for _ in indices {
                    buffer.push_default();
                }
                buffer
            }
        }
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

    /// Stops forwarding and disposes the current inner source.
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ticker.stop();
        self.listeners.clear();
        if let Some(source) = self.set_inner(None) {
            source.dispose();
        }
        tracing::debug!("Proxy disposed");
    }
}
