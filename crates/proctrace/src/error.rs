use crate::pid::Pid;

/// Errors surfaced by the tracing layer
///
/// Parse errors never leave an [`EventSource`](crate::EventSource): the reader drops the
/// offending line and keeps going. They are still typed so parsers can be tested directly.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("invalid pid '{0}'")]
    InvalidPid(String),

    #[error("unable to parse '{line}': {reason}")]
    Parse { line: String, reason: &'static str },

    #[error("failed to spawn tracer `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("PID[{0}] does not exist")]
    NotFound(Pid),
}

impl TraceError {
    pub(crate) fn parse(line: &str, reason: &'static str) -> Self {
        TraceError::Parse {
            line: line.to_owned(),
            reason,
        }
    }
}
