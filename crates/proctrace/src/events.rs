use crate::error::TraceError;
use crate::pid::Pid;
use crate::programs;
use serde::{Deserialize, Serialize};

/// Suffix appended to paths the tracer had to cut at its string limit
pub const TRUNCATED_MARKER: &str = "<...>";

/// The kind of kernel event a tracer subprocess reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Exec,
    Open,
    Chdir,
}

impl TraceKind {
    pub const ALL: [TraceKind; 3] = [TraceKind::Exec, TraceKind::Open, TraceKind::Chdir];

    /// Number of space separated tokens in one event line
    pub fn arity(self) -> usize {
        match self {
            TraceKind::Exec | TraceKind::Open => 3,
            TraceKind::Chdir => 2,
        }
    }

    /// The bpftrace program emitting this kind of event
    pub fn program(self) -> &'static str {
        match self {
            TraceKind::Exec => programs::EXEC_TRACE,
            TraceKind::Open => programs::OPEN_TRACE,
            TraceKind::Chdir => programs::CHDIR_TRACE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TraceKind::Exec => "exec",
            TraceKind::Open => "open",
            TraceKind::Chdir => "chdir",
        }
    }
}

impl std::str::FromStr for TraceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TraceKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = TraceKind::ALL.iter().map(|kind| kind.name()).collect();
                format!("unknown trace kind `{s}`, expected one of {}", names.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExecData {
    /// `None` when the tracer reported the idle task as parent
    pub ppid: Option<Pid>,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OpenData {
    pub fd: i32,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChdirData {
    pub cwd: String,
}

/// One parsed tracer line
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TraceEvent {
    Exec { pid: Pid, data: ExecData },
    Open { pid: Pid, data: OpenData },
    Chdir { pid: Pid, data: ChdirData },
}

impl TraceEvent {
    /// Parse a line of the given kind, `None` if it does not match the grammar
    pub fn parse(kind: TraceKind, line: &str, strlen: usize) -> Option<Self> {
        let event = match kind {
            TraceKind::Exec => parse_exec(line).map(|(pid, data)| TraceEvent::Exec { pid, data }),
            TraceKind::Open => {
                parse_open(line, strlen).map(|(pid, data)| TraceEvent::Open { pid, data })
            }
            TraceKind::Chdir => {
                parse_chdir(line).map(|(pid, data)| TraceEvent::Chdir { pid, data })
            }
        };
        event.ok()
    }

    pub fn pid(&self) -> Pid {
        match self {
            TraceEvent::Exec { pid, .. }
            | TraceEvent::Open { pid, .. }
            | TraceEvent::Chdir { pid, .. } => *pid,
        }
    }
}

/// Split a trimmed line into exactly `arity` tokens, the last one keeping its inner spaces
fn tokens(line: &str, arity: usize) -> Result<Vec<&str>, TraceError> {
    let tokens: Vec<&str> = line.trim().splitn(arity, ' ').collect();
    if tokens.len() != arity {
        return Err(TraceError::parse(line, "wrong token count"));
    }
    Ok(tokens)
}

/// `<pid> <ppid> <argv0>`
pub fn parse_exec(line: &str) -> Result<(Pid, ExecData), TraceError> {
    let t = tokens(line, TraceKind::Exec.arity())?;
    let pid = t[0].parse()?;
    let ppid = match t[1] {
        "0" => None,
        raw => Some(raw.parse()?),
    };
    Ok((
        pid,
        ExecData {
            ppid,
            command: t[2].to_owned(),
        },
    ))
}

/// `<pid> <fd> <path>`, failed opens (`fd == -1`) are rejected
pub fn parse_open(line: &str, strlen: usize) -> Result<(Pid, OpenData), TraceError> {
    let t = tokens(line, TraceKind::Open.arity())?;
    let pid = t[0].parse()?;
    let fd: i32 = t[1]
        .parse()
        .map_err(|_| TraceError::parse(line, "invalid file descriptor"))?;
    if fd < 0 {
        return Err(TraceError::parse(line, "open failed"));
    }

    let mut path = t[2].to_owned();
    if strlen > 0 && path.len() == strlen - 1 {
        path.push_str(TRUNCATED_MARKER);
    }

    Ok((pid, OpenData { fd, path }))
}

/// `<pid> <cwd>`
pub fn parse_chdir(line: &str) -> Result<(Pid, ChdirData), TraceError> {
    let t = tokens(line, TraceKind::Chdir.arity())?;
    let pid = t[0].parse()?;
    Ok((
        pid,
        ChdirData {
            cwd: t[1].to_owned(),
        },
    ))
}
