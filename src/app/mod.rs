// logtail - app/mod.rs
//
// Application layer: the scheduler and the pipeline stages built on it.
// Dependencies: core, platform (config and file access), util.

pub mod factory;
pub mod file_source;
pub mod filtered;
pub mod listeners;
pub mod merged;
pub mod page_cache;
pub mod proxy;
pub mod scheduler;
pub mod source;
