//! pst, a live process dashboard
//!
//! The ingestion core lives in [`proctrace`]; this crate merges its streams with the process
//! table ([`process_cache`], [`open_log`]), schedules redraws ([`coalescer`]) and renders the
//! dashboard ([`ui`]).

pub mod app;
pub mod coalescer;
pub mod config;
pub mod crash;
pub mod helpers;
pub mod inspect;
pub mod local_logger;
pub mod open_log;
pub mod proc_table;
pub mod process_cache;
pub mod sources;
pub mod ui;

mod prelude;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
