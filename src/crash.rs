use crate::prelude::*;
use std::backtrace::Backtrace;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// What is known about a panic when it happens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub message: String,
    /// `file:line:col`
    pub location: Option<String>,
    pub thread_name: Option<String>,
    pub backtrace: String,
}

impl CrashReport {
    pub fn render(&self) -> String {
        let mut dump = String::new();
        let _ = writeln!(dump, "pst {} panicked", crate::VERSION);
        let _ = writeln!(dump, "message: {}", self.message);
        if let Some(location) = &self.location {
            let _ = writeln!(dump, "location: {location}");
        }
        let _ = writeln!(
            dump,
            "thread: {}",
            self.thread_name.as_deref().unwrap_or("<unnamed>")
        );
        let _ = writeln!(dump, "\nbacktrace:\n{}", self.backtrace);
        dump
    }
}

/// Write `report` to `path`, replacing any previous dump
pub fn write_crash_dump(path: &Path, report: &CrashReport) -> Result<()> {
    std::fs::write(path, report.render())
        .with_context(|| format!("Failed to write the crash dump to {}", path.display()))
}

/// Install a panic hook writing every panic to `path`.
///
/// The terminal belongs to the dashboard, so nothing is printed. The terminal itself is restored
/// by the dashboard while unwinding.
pub fn install_crash_hook(path: PathBuf) {
    std::panic::set_hook(Box::new(move |info| {
        let backtrace = Backtrace::force_capture();

        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let report = CrashReport {
            message,
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column())),
            thread_name: std::thread::current().name().map(String::from),
            backtrace: backtrace.to_string(),
        };

        error!(
            "Panic at {}: {}",
            report.location.as_deref().unwrap_or("unknown location"),
            report.message
        );
        if let Err(e) = write_crash_dump(&path, &report) {
            error!("{e:#}");
        }
    }));
}
