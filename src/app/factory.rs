// logtail - app/factory.rs
//
// Builds pipeline stages with an injected scheduler and configuration.
// There is no process-wide registry: everything a stage needs comes from
// the factory that created it.

use crate::app::file_source::TextLogSource;
use crate::app::filtered::FilteredLogSource;
use crate::app::merged::MergedLogSource;
use crate::app::page_cache::PageBufferedLogSource;
use crate::app::proxy::LogSourceProxy;
use crate::app::scheduler::TaskScheduler;
use crate::app::source::LogSource;
use crate::core::filter::Predicate;
use crate::platform::config::PipelineConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// Creates sources that share one scheduler and configuration.
pub struct LogSourceFactory {
    scheduler: Arc<dyn TaskScheduler>,
    config: PipelineConfig,
}

impl LogSourceFactory {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, config: PipelineConfig) -> Self {
        Self { scheduler, config }
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Tail one text file.
    pub fn open_file(&self, path: impl Into<PathBuf>) -> Arc<TextLogSource> {
        TextLogSource::open(self.scheduler.clone(), path, self.config.tail.clone())
    }

    /// Merge `sources` by timestamp. Ownership of the children follows
    /// `[merge] owns_sources`.
    pub fn merge(&self, sources: Vec<Arc<dyn LogSource>>) -> Arc<MergedLogSource> {
        MergedLogSource::new(self.scheduler.clone(), sources, self.config.merge.clone())
    }

    /// Filter `upstream` by `predicate`, owning the upstream.
    pub fn filter(&self, upstream: Arc<dyn LogSource>, predicate: Predicate) -> Arc<FilteredLogSource> {
        self.filter_with_ownership(upstream, predicate, true)
    }

    /// Filter `upstream`; with `owns_upstream == false` the upstream
    /// outlives the filter's disposal.
    pub fn filter_with_ownership(
        &self,
        upstream: Arc<dyn LogSource>,
        predicate: Predicate,
        owns_upstream: bool,
    ) -> Arc<FilteredLogSource> {
        FilteredLogSource::new(
            self.scheduler.clone(),
            upstream,
            predicate,
            self.config.filter.clone(),
            owns_upstream,
        )
    }

    /// Page-cache `upstream`, owning it.
    pub fn page_cache(&self, upstream: Arc<dyn LogSource>) -> Arc<PageBufferedLogSource> {
        self.page_cache_with_ownership(upstream, true)
    }

    pub fn page_cache_with_ownership(
        &self,
        upstream: Arc<dyn LogSource>,
        owns_upstream: bool,
    ) -> Arc<PageBufferedLogSource> {
        PageBufferedLogSource::new(
            self.scheduler.clone(),
            upstream,
            self.config.cache.clone(),
            owns_upstream,
        )
    }

    /// A replaceable front for `inner`, forwarding at the filter's pace.
    pub fn proxy(&self, inner: Option<Arc<dyn LogSource>>) -> Arc<LogSourceProxy> {
        LogSourceProxy::new(self.scheduler.clone(), inner, self.config.filter.poll_interval)
    }

    /// The usual chain: files, merged when there is more than one, filtered
    /// unless `predicate` passes everything, behind a page cache.
    ///
    /// Reads from the returned source never block: rows not cached yet come
    /// back as defaults marked `NotCached` and arrive through
    /// `on_retrieved` after a later tick. The returned source owns every
    /// stage below it, so one `dispose()` tears the whole chain down.
    pub fn open_pipeline(&self, paths: &[PathBuf], predicate: Predicate) -> Arc<dyn LogSource> {
        let mut files: Vec<Arc<dyn LogSource>> = paths
            .iter()
            .map(|p| {
                let source: Arc<dyn LogSource> = self.open_file(p.clone());
                source
            })
            .collect();
        let merged: Arc<dyn LogSource> = match files.len() {
            1 => files.remove(0),
            _ => {
                let mut config = self.config.merge.clone();
                config.owns_sources = true;
                MergedLogSource::new(self.scheduler.clone(), files, config)
            }
        };
        let filtered: Arc<dyn LogSource> = if predicate.is_pass_all() {
            merged
        } else {
            self.filter(merged, predicate)
        };
        self.page_cache(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::scheduler::ManualScheduler;
    use crate::core::column::{columns, RetrievalState};
    use crate::core::model::Section;

    #[test]
    fn test_pipeline_over_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        std::fs::write(&a, "2024-01-01 10:00:00 INFO alpha\n2024-01-01 10:00:02 ERROR alpha\n").unwrap();
        std::fs::write(&b, "2024-01-01 10:00:01 ERROR beta\n").unwrap();

        let scheduler = Arc::new(ManualScheduler::new());
        let factory = LogSourceFactory::new(scheduler.clone(), PipelineConfig::default());
        let pipeline = factory.open_pipeline(&[a, b], Predicate::substring("error").unwrap());
        scheduler.run_once();
        assert_eq!(pipeline.count(), 2);
        assert!(pipeline.columns().contains(&columns::RETRIEVAL_STATE));

        let wanted = &[columns::RAW_CONTENT, columns::RETRIEVAL_STATE];
        let miss = pipeline.get_entries(Section::new(0, 2), wanted);
        assert!(miss.iter().all(|e| e.retrieval_state() == RetrievalState::NotCached));

        // The miss queued the page; the next pass fetches it.
        scheduler.run_once();
        let rows: Vec<String> = pipeline
            .get_entries(Section::new(0, pipeline.count()), wanted)
            .iter()
            .map(|e| {
                assert_eq!(e.retrieval_state(), RetrievalState::Retrieved);
                e.raw_content().unwrap_or_default().to_string()
            })
            .collect();
        assert_eq!(
            rows,
            vec!["2024-01-01 10:00:01 ERROR beta", "2024-01-01 10:00:02 ERROR alpha"]
        );

        // files + merge + filter + cache
        assert_eq!(scheduler.active_task_count(), 5);
        pipeline.dispose();
        assert_eq!(scheduler.active_task_count(), 0);
    }

    #[test]
    fn test_single_file_pass_all_is_file_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("only.log");
        let scheduler = Arc::new(ManualScheduler::new());
        let factory = LogSourceFactory::new(scheduler.clone(), PipelineConfig::default());
        let pipeline = factory.open_pipeline(&[path], Predicate::pass_all());
        assert_eq!(scheduler.active_task_count(), 2);
        pipeline.dispose();
        assert_eq!(scheduler.active_task_count(), 0);
    }

    #[test]
    fn test_proxy_fronts_a_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.log");
        std::fs::write(&path, "2024-01-01 10:00:00 INFO a\n").unwrap();
        let scheduler = Arc::new(ManualScheduler::new());
        let factory = LogSourceFactory::new(scheduler.clone(), PipelineConfig::default());
        let proxy = factory.proxy(Some(factory.open_pipeline(&[path], Predicate::pass_all())));
        scheduler.run_once();
        assert_eq!(proxy.count(), 1);
        proxy.dispose();
        assert_eq!(scheduler.active_task_count(), 0);
    }
}
