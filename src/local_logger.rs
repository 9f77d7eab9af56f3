use std::{env, fs::File, path::Path};

use crate::prelude::*;
use simplelog::{CombinedLogger, ConfigBuilder, SharedLogger, WriteLogger};

/// Environment variable holding the log level filter
pub const LOG_LEVEL_ENV: &str = "PST_LOG";

pub fn get_log_level() -> log::LevelFilter {
    parse_log_level(env::var(LOG_LEVEL_ENV).ok().as_deref())
}

fn parse_log_level(value: Option<&str>) -> log::LevelFilter {
    value
        .and_then(|log_level| log_level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info)
}

/// Build a logger appending to `path`.
///
/// The terminal belongs to the dashboard while it runs, so records never go to stdout or stderr.
pub fn get_file_logger(path: &Path) -> Result<Box<dyn SharedLogger>> {
    let file = File::options()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open the log file {}", path.display()))?;

    let config = ConfigBuilder::new()
        .set_target_level(log::LevelFilter::Error)
        .set_thread_level(log::LevelFilter::Off)
        .build();

    Ok(WriteLogger::new(get_log_level(), config, file))
}

/// Install the global logger when a log file is requested, otherwise records are dropped
pub fn init_local_logger(log_file: Option<&Path>) -> Result<()> {
    let Some(path) = log_file else {
        return Ok(());
    };

    CombinedLogger::init(vec![get_file_logger(path)?])?;
    info!("pst {} started, logging to {}", crate::VERSION, path.display());
    Ok(())
}
