// logtail - lib.rs
//
// Library entry point. The binary in `main.rs` is a thin consumer of this
// surface; integration tests use it directly.

pub mod app;
pub mod core;
pub mod platform;
pub mod util;
