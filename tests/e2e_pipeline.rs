// logtail - tests/e2e_pipeline.rs
//
// End-to-end tests for the tail, merge, filter and page-cache chain.
//
// These tests exercise real files in a temp directory, the real text
// decoder and timestamp detection, and the manual scheduler so that each
// pass is deterministic. Nothing is mocked.

use logtail::app::factory::LogSourceFactory;
use logtail::app::scheduler::{ManualScheduler, TaskScheduler};
use logtail::app::source::{LogSource, LogSourceListener};
use logtail::core::column::{columns, RetrievalState};
use logtail::core::filter::{FilterState, Predicate};
use logtail::core::model::{replay, Level, Modification, Section};
use logtail::platform::config::PipelineConfig;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Helpers
// =============================================================================

fn factory() -> (Arc<ManualScheduler>, LogSourceFactory) {
    let scheduler = Arc::new(ManualScheduler::new());
    let factory = LogSourceFactory::new(scheduler.clone(), PipelineConfig::default());
    (scheduler, factory)
}

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

fn contents(source: &dyn LogSource) -> Vec<String> {
    source
        .get_entries(Section::new(0, source.count()), &[columns::RAW_CONTENT])
        .iter()
        .map(|e| e.raw_content().unwrap_or_default().to_string())
        .collect()
}

/// Read every row of `source`, stepping the scheduler until a page cache
/// has fetched all of them.
fn read_all(scheduler: &ManualScheduler, source: &dyn LogSource) -> Vec<String> {
    if !source.columns().contains(&columns::RETRIEVAL_STATE) {
        return contents(source);
    }
    let wanted = &[columns::RAW_CONTENT, columns::RETRIEVAL_STATE];
    for _ in 0..16 {
        let buffer = source.get_entries(Section::new(0, source.count()), wanted);
        if buffer
            .iter()
            .all(|e| e.retrieval_state() == RetrievalState::Retrieved)
        {
            return buffer
                .iter()
                .map(|e| e.raw_content().unwrap_or_default().to_string())
                .collect();
        }
        scheduler.run_once();
    }
    panic!("rows were never fetched into the cache");
}

/// Records modifications and checks that replaying them always lands on the
/// source's count at the time of delivery.
#[derive(Default)]
struct Replayer {
    log: Mutex<Vec<Modification>>,
    mismatches: Mutex<Vec<(usize, usize)>>,
}

impl LogSourceListener for Replayer {
    fn on_modified(&self, source: &dyn LogSource, modification: Modification) {
        let mut log = self.log.lock();
        log.push(modification);
        let replayed = replay(0, log.iter());
        let count = source.count();
        if replayed > count {
            self.mismatches.lock().push((replayed, count));
        }
    }
}

// =============================================================================
// Pipeline E2E
// =============================================================================

/// Two files merge by timestamp and the filter keeps only errors, then both
/// files grow and the view follows.
#[test]
fn e2e_merged_filtered_view_follows_growth() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("app.log");
    let b = dir.path().join("db.log");
    fs::write(
        &a,
        "2024-03-01 08:00:00 INFO app started\n2024-03-01 08:00:05 ERROR app lost connection\n",
    )
    .unwrap();
    fs::write(&b, "2024-03-01 08:00:03 ERROR db refused login\n").unwrap();

    let (scheduler, factory) = factory();
    let mut state = FilterState::default();
    state.set_minimum_level(Level::Error);
    let pipeline = factory.open_pipeline(&[a.clone(), b.clone()], state.to_predicate());
    let replayer = Arc::new(Replayer::default());
    pipeline.add_listener(replayer.clone(), Duration::ZERO, 1);

    scheduler.run_once();
    assert_eq!(
        read_all(&scheduler, pipeline.as_ref()),
        vec![
            "2024-03-01 08:00:03 ERROR db refused login",
            "2024-03-01 08:00:05 ERROR app lost connection",
        ]
    );

    append(&b, "2024-03-01 08:00:04 ERROR db deadlock\n");
    append(&a, "2024-03-01 08:00:06 WARN app retrying\n");
    scheduler.run_once();
    assert_eq!(
        read_all(&scheduler, pipeline.as_ref()),
        vec![
            "2024-03-01 08:00:03 ERROR db refused login",
            "2024-03-01 08:00:04 ERROR db deadlock",
            "2024-03-01 08:00:05 ERROR app lost connection",
        ]
    );
    assert!(replayer.mismatches.lock().is_empty());
    assert_eq!(replay(0, replayer.log.lock().iter()), pipeline.count());

    pipeline.dispose();
    assert_eq!(scheduler.active_task_count(), 0);
}

/// Truncating one file withdraws its rows from the merged view and the
/// rows come back when it is rewritten.
#[test]
fn e2e_truncation_propagates_through_merge() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.log");
    let b = dir.path().join("b.log");
    fs::write(&a, "2024-03-01 08:00:00 INFO a0\n2024-03-01 08:00:02 INFO a1\n").unwrap();
    fs::write(&b, "2024-03-01 08:00:01 INFO b0\n").unwrap();

    let (scheduler, factory) = factory();
    let pipeline = factory.open_pipeline(&[a.clone(), b], Predicate::pass_all());
    let replayer = Arc::new(Replayer::default());
    pipeline.add_listener(replayer.clone(), Duration::ZERO, 1);
    scheduler.run_once();
    assert_eq!(pipeline.count(), 3);

    fs::write(&a, "").unwrap();
    scheduler.run_once();
    assert_eq!(read_all(&scheduler, pipeline.as_ref()), vec!["2024-03-01 08:00:01 INFO b0"]);

    fs::write(&a, "2024-03-01 08:00:00 INFO a0 again\n").unwrap();
    scheduler.run_once();
    assert_eq!(
        read_all(&scheduler, pipeline.as_ref()),
        vec!["2024-03-01 08:00:00 INFO a0 again", "2024-03-01 08:00:01 INFO b0"]
    );
    assert!(replayer.mismatches.lock().is_empty());
    assert_eq!(replay(0, replayer.log.lock().iter()), pipeline.count());
}

/// A page cache over a filter answers misses without blocking and serves
/// the filter's rows once the page is fetched.
#[test]
fn e2e_page_cache_serves_filtered_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.log");
    let text: String = (0..50)
        .map(|i| format!("2024-03-01 08:{:02}:{:02} INFO row {i}\n", i / 60, i % 60))
        .collect();
    fs::write(&path, text).unwrap();

    let (scheduler, factory) = factory();
    let filtered = factory.filter(factory.open_file(path), Predicate::substring("row 4").unwrap());
    scheduler.run_once();
    // "row 4" and "row 40".."row 49"
    assert_eq!(filtered.count(), 11);

    let cache = factory.page_cache(filtered.clone());
    scheduler.run_once();
    let wanted = &[columns::RAW_CONTENT, columns::RETRIEVAL_STATE];
    let first = cache.get_entries(Section::new(0, 11), wanted);
    assert!(first
        .iter()
        .all(|e| e.retrieval_state() == RetrievalState::NotCached));

    scheduler.run_once();
    let second = cache.get_entries(Section::new(0, 11), wanted);
    assert!(second
        .iter()
        .all(|e| e.retrieval_state() == RetrievalState::Retrieved));
    let cached: Vec<String> = second
        .iter()
        .map(|e| e.raw_content().unwrap_or_default().to_string())
        .collect();
    assert_eq!(cached, contents(filtered.as_ref()));

    cache.dispose();
    assert_eq!(scheduler.active_task_count(), 0);
}

/// The pipeline reports rows before their page is resident; reading them
/// queues the page and a later pass delivers `on_retrieved`.
#[test]
fn e2e_pipeline_reports_retrieved_rows() {
    #[derive(Default)]
    struct Retrievals {
        sections: Mutex<Vec<Section>>,
    }

    impl LogSourceListener for Retrievals {
        fn on_modified(&self, _source: &dyn LogSource, _modification: Modification) {}

        fn on_retrieved(&self, _source: &dyn LogSource, section: Section) {
            self.sections.lock().push(section);
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    fs::write(&path, "2024-03-01 08:00:00 INFO a\n2024-03-01 08:00:01 INFO b\n").unwrap();
    let (scheduler, factory) = factory();
    let pipeline = factory.open_pipeline(&[path], Predicate::pass_all());
    let retrievals = Arc::new(Retrievals::default());
    pipeline.add_listener(retrievals.clone(), Duration::ZERO, 1);

    scheduler.run_once();
    assert_eq!(pipeline.count(), 2);
    let miss = pipeline.get_entries(Section::new(0, 2), &[columns::RETRIEVAL_STATE]);
    assert!(miss.iter().all(|e| e.retrieval_state() == RetrievalState::NotCached));
    assert!(retrievals.sections.lock().is_empty());

    scheduler.run_once();
    assert_eq!(*retrievals.sections.lock(), vec![Section::new(0, 2)]);
    assert_eq!(
        read_all(&scheduler, pipeline.as_ref()),
        vec!["2024-03-01 08:00:00 INFO a", "2024-03-01 08:00:01 INFO b"]
    );
    pipeline.dispose();
}

/// A file that does not exist yet is picked up when it appears.
#[test]
fn e2e_missing_file_appears_later() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("later.log");
    let (scheduler, factory) = factory();
    let pipeline = factory.open_pipeline(&[path.clone()], Predicate::pass_all());
    scheduler.run_once();
    assert_eq!(pipeline.count(), 0);

    append(&path, "2024-03-01 08:00:00 INFO hello\n");
    scheduler.run_once();
    assert_eq!(read_all(&scheduler, pipeline.as_ref()), vec!["2024-03-01 08:00:00 INFO hello"]);
}

// =============================================================================
// Merge ordering property
// =============================================================================

fn write_source(dir: &Path, id: usize, seconds: &[u32]) -> PathBuf {
    let path = dir.join(format!("src{id}.log"));
    let text: String = seconds
        .iter()
        .enumerate()
        .map(|(i, s)| format!("2024-03-01 09:{:02}:{:02} INFO s{id} l{i}\n", s / 60, s % 60))
        .collect();
    fs::write(&path, text).unwrap();
    path
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The merged view equals a stable sort of every line by
    /// (timestamp, source registration order, line index).
    #[test]
    fn prop_merge_matches_sorted_union(
        sources in prop::collection::vec(prop::collection::vec(0u32..600, 0..20), 1..4)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = sources
            .iter()
            .enumerate()
            .map(|(id, seconds)| write_source(dir.path(), id, seconds))
            .collect();

        let (scheduler, factory) = factory();
        let children: Vec<Arc<dyn LogSource>> = paths
            .iter()
            .map(|p| {
                let source: Arc<dyn LogSource> = factory.open_file(p.clone());
                source
            })
            .collect();
        let merged = factory.merge(children);
        scheduler.run_once();

        let mut expected: Vec<(u32, usize, usize)> = sources
            .iter()
            .enumerate()
            .flat_map(|(id, seconds)| seconds.iter().enumerate().map(move |(i, s)| (*s, id, i)))
            .collect();
        expected.sort();
        let expected: Vec<String> = expected
            .iter()
            .map(|(s, id, i)| format!("2024-03-01 09:{:02}:{:02} INFO s{id} l{i}", s / 60, s % 60))
            .collect();

        prop_assert_eq!(contents(merged.as_ref()), expected);
        merged.dispose();
    }
}

// =============================================================================
// Incremental pipeline property
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    /// Write one complete line with this many seconds past 09:00.
    Append(usize, u32),
    /// Write the first half of a line; the next write to the file finishes it.
    AppendPartial(usize, u32),
    /// Empty the file, then let one pass notice.
    Truncate(usize),
    Tick,
}

fn op_strategy(files: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..files, 0u32..600).prop_map(|(f, s)| Op::Append(f, s)),
        1 => (0..files, 0u32..600).prop_map(|(f, s)| Op::AppendPartial(f, s)),
        1 => (0..files).prop_map(Op::Truncate),
        2 => Just(Op::Tick),
    ]
}

/// What one file should hold once every written line is complete.
struct FileModel {
    path: PathBuf,
    /// (seconds, text) of every complete line.
    lines: Vec<(u32, String)>,
    /// A line whose first `usize` bytes are on disk.
    partial: Option<(u32, String, usize)>,
}

impl FileModel {
    fn finish_partial(&mut self) {
        if let Some((seconds, text, written)) = self.partial.take() {
            append(&self.path, &format!("{}\n", &text[written..]));
            self.lines.push((seconds, text));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// After any mix of appends, partial writes, truncations and passes, the
    /// merge equals the sorted union of the files, the cached filter view
    /// equals a naive filter of the merge, and every listener's replay lands
    /// on its source's count.
    #[test]
    fn prop_incremental_pipeline_matches_model(
        (files, ops) in (2usize..=3).prop_flat_map(|files| {
            (Just(files), prop::collection::vec(op_strategy(files), 1..40))
        })
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut model: Vec<FileModel> = (0..files)
            .map(|id| {
                let path = dir.path().join(format!("src{id}.log"));
                fs::write(&path, "").unwrap();
                FileModel { path, lines: Vec::new(), partial: None }
            })
            .collect();

        let (scheduler, factory) = factory();
        let children: Vec<Arc<dyn LogSource>> = model
            .iter()
            .map(|m| {
                let source: Arc<dyn LogSource> = factory.open_file(m.path.clone());
                source
            })
            .collect();
        let merged = factory.merge(children);
        let filtered = factory.filter_with_ownership(merged.clone(), Predicate::substring("7").unwrap(), false);
        let cache = factory.page_cache(filtered);
        let merged_log = Arc::new(Replayer::default());
        let cache_log = Arc::new(Replayer::default());
        merged.add_listener(merged_log.clone(), Duration::ZERO, 1);
        cache.add_listener(cache_log.clone(), Duration::ZERO, 1);

        let mut serial = 0usize;
        let mut line = |id: usize, seconds: u32| {
            serial += 1;
            format!("2024-03-01 09:{:02}:{:02} INFO s{id} n{serial}", seconds / 60, seconds % 60)
        };
        for op in ops {
            match op {
                Op::Append(id, seconds) => {
                    let file = &mut model[id];
                    file.finish_partial();
                    let text = line(id, seconds);
                    append(&file.path, &format!("{text}\n"));
                    file.lines.push((seconds, text));
                }
                Op::AppendPartial(id, seconds) => {
                    let file = &mut model[id];
                    file.finish_partial();
                    let text = line(id, seconds);
                    let half = text.len() / 2;
                    append(&file.path, &text[..half]);
                    file.partial = Some((seconds, text, half));
                }
                Op::Truncate(id) => {
                    let file = &mut model[id];
                    fs::write(&file.path, "").unwrap();
                    file.lines.clear();
                    file.partial = None;
                    scheduler.run_once();
                }
                Op::Tick => scheduler.run_once(),
            }
        }
        for file in &mut model {
            file.finish_partial();
        }
        scheduler.run_times(4);

        let mut union: Vec<(u32, usize, usize, &str)> = model
            .iter()
            .enumerate()
            .flat_map(|(id, file)| {
                file.lines
                    .iter()
                    .enumerate()
                    .map(move |(i, (seconds, text))| (*seconds, id, i, text.as_str()))
            })
            .collect();
        union.sort();
        let expected: Vec<String> = union.iter().map(|(_, _, _, text)| text.to_string()).collect();
        let merged_rows = contents(merged.as_ref());
        prop_assert_eq!(&merged_rows, &expected);

        let naive: Vec<String> = merged_rows.iter().filter(|r| r.contains('7')).cloned().collect();
        prop_assert_eq!(read_all(&scheduler, cache.as_ref()), naive);

        prop_assert!(merged_log.mismatches.lock().is_empty());
        prop_assert!(cache_log.mismatches.lock().is_empty());
        prop_assert_eq!(replay(0, merged_log.log.lock().iter()), merged.count());
        prop_assert_eq!(replay(0, cache_log.log.lock().iter()), cache.count());

        cache.dispose();
        merged.dispose();
        prop_assert_eq!(scheduler.active_task_count(), 0);
    }
}
