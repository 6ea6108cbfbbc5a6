// logtail - platform/mod.rs
//
// Platform abstraction layer: config directories, config.toml, file access.
// Dependencies: util, core (plain data types), directories crate.
// Must NOT depend on: app.

pub mod config;
pub mod fs;
