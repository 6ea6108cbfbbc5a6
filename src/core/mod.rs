// logtail - core/mod.rs
//
// Core logic layer: data model, text decoding, timestamp/level extraction,
// filter predicates and the merge ordering index.
// Dependencies: util only.
// Must NOT depend on: platform, app, or perform any I/O.

pub mod changes;
pub mod column;
pub mod encoding;
pub mod expression;
pub mod filter;
pub mod merge_index;
pub mod model;
pub mod property;
pub mod text;
pub mod timestamp;
