//! Live process tracing primitives for pst
//!
//! This crate provides the ingestion side of the dashboard:
//! - Process identifiers and tracer line parsing
//! - bpftrace programs for exec, open and chdir events
//! - A generic event source that supervises one tracer subprocess and keeps
//!   a point cache of the last value seen for every pid

pub mod command;
pub mod error;
pub mod events;
pub mod pid;
pub mod programs;
pub mod source;

pub use command::CommandBuilder;
pub use error::TraceError;
pub use events::{ChdirData, ExecData, OpenData, TraceEvent, TraceKind};
pub use pid::Pid;
pub use source::{EventSource, EventStream, LineParser, Probe, SourceOptions, Traced};
