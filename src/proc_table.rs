//! Point-in-time view of the host process table.
//!
//! [`ProcessTable`] is the seam between the caches and the operating system: the caches only
//! ever ask it for one fact at a time, and tests substitute an in-memory table.

use crate::prelude::*;
use proctrace::Pid;
use serde::Serialize;
use std::path::PathBuf;

/// One `KEY=value` entry of a process environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvVar {
    pub key: String,
    /// `None` when the entry has no `=`
    pub value: Option<String>,
}

/// An open file descriptor and what it points to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenFd {
    pub fd: i32,
    pub target: String,
}

pub trait ProcessTable: Send + Sync {
    /// Every live process id
    fn all_pids(&self) -> Result<Vec<Pid>>;

    /// Short command name of a process, `None` when it cannot be read
    fn command(&self, pid: Pid) -> Option<String>;

    /// Children of every thread of the process
    fn children(&self, pid: Pid) -> Result<Vec<Pid>>;

    fn environ(&self, pid: Pid) -> Result<Vec<EnvVar>>;

    fn cwd(&self, pid: Pid) -> Option<PathBuf>;

    fn open_fds(&self, pid: Pid) -> Result<Vec<OpenFd>>;

    fn is_alive(&self, pid: Pid) -> bool;
}

/// Split a raw `/proc/<pid>/environ` buffer into its entries
pub fn parse_environ(raw: &[u8]) -> Vec<EnvVar> {
    raw.split(|byte| *byte == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            match entry.split_once('=') {
                Some((key, value)) => EnvVar {
                    key: key.to_owned(),
                    value: Some(value.to_owned()),
                },
                None => EnvVar {
                    key: entry.into_owned(),
                    value: None,
                },
            }
        })
        .collect()
}

#[cfg(target_os = "linux")]
pub use procfs_table::ProcFs;

#[cfg(target_os = "linux")]
mod procfs_table {
    use super::*;
    use procfs::process::{FDTarget, Process};

    /// [`ProcessTable`] backed by `/proc`
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ProcFs;

    impl ProcFs {
        fn process(pid: Pid) -> Result<Process> {
            Process::new(pid.as_raw()).with_context(|| format!("PID[{pid}] is not readable"))
        }
    }

    impl ProcessTable for ProcFs {
        fn all_pids(&self) -> Result<Vec<Pid>> {
            let processes =
                procfs::process::all_processes().context("Failed to enumerate /proc")?;
            Ok(processes
                .filter_map(|process| process.ok())
                .filter_map(|process| Pid::try_from(process.pid).ok())
                .collect())
        }

        fn command(&self, pid: Pid) -> Option<String> {
            let stat = Self::process(pid).ok()?.stat().ok()?;
            Some(stat.comm.trim().to_owned())
        }

        fn children(&self, pid: Pid) -> Result<Vec<Pid>> {
            let process = Self::process(pid)?;
            let mut children = Vec::new();
            for task in process.tasks()?.flatten() {
                // A thread may exit between listing and reading
                let Ok(task_children) = task.children() else {
                    continue;
                };
                children.extend(task_children.into_iter().filter_map(Pid::new));
            }
            children.sort_unstable();
            children.dedup();
            Ok(children)
        }

        fn environ(&self, pid: Pid) -> Result<Vec<EnvVar>> {
            let path = format!("/proc/{pid}/environ");
            let raw = std::fs::read(&path).with_context(|| format!("Failed to read {path}"))?;
            Ok(parse_environ(&raw))
        }

        fn cwd(&self, pid: Pid) -> Option<PathBuf> {
            Self::process(pid).ok()?.cwd().ok()
        }

        fn open_fds(&self, pid: Pid) -> Result<Vec<OpenFd>> {
            let process = Self::process(pid)?;
            let mut fds: Vec<OpenFd> = process
                .fd()?
                .flatten()
                .map(|info| OpenFd {
                    fd: info.fd,
                    target: describe_target(&info.target),
                })
                .collect();
            fds.sort_by_key(|fd| fd.fd);
            Ok(fds)
        }

        fn is_alive(&self, pid: Pid) -> bool {
            Self::process(pid).is_ok_and(|process| process.is_alive())
        }
    }

    /// Render a descriptor target the way `ls -l /proc/<pid>/fd` does
    fn describe_target(target: &FDTarget) -> String {
        match target {
            FDTarget::Path(path) => path.display().to_string(),
            FDTarget::Socket(inode) => format!("socket:[{inode}]"),
            FDTarget::Net(inode) => format!("net:[{inode}]"),
            FDTarget::Pipe(inode) => format!("pipe:[{inode}]"),
            FDTarget::AnonInode(kind) => format!("anon_inode:{kind}"),
            FDTarget::MemFD(name) => format!("/memfd:{name}"),
            FDTarget::Other(kind, inode) => format!("{kind}:[{inode}]"),
        }
    }

}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_environ() {
        let raw = b"HOME=/root\0EMPTY=\0NOEQUALS\0URL=a=b\0\0";
        insta::assert_yaml_snapshot!(parse_environ(raw), @r#"
        - key: HOME
          value: /root
        - key: EMPTY
          value: ""
        - key: NOEQUALS
          value: ~
        - key: URL
          value: a=b
        "#);
    }

    #[test]
    fn test_parse_empty_environ() {
        assert!(parse_environ(b"").is_empty());
    }
}
