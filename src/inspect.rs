use crate::prelude::*;
use crate::proc_table::{EnvVar, OpenFd, ProcessTable};
use crate::process_cache::{ProcessCache, ProcessRecord};
use crate::sources::Sources;
use nix::sys::signal::{Signal, kill as send_signal};
use proctrace::{OpenData, Pid};
use std::process::Command;
use std::sync::Arc;

/// Everything the detail panes show about one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDetails {
    pub record: ProcessRecord,
    /// Output of `ps`, or why it failed
    pub info: String,
    pub cwd: Option<String>,
    pub environ: Result<Vec<EnvVar>, String>,
    pub fds: Result<Vec<OpenFd>, String>,
    /// Files opened since pst started, oldest first
    pub opens: Vec<OpenData>,
}

/// Assembles [`ProcessDetails`], cheap to clone into blocking tasks
#[derive(Clone)]
pub struct DetailLoader {
    processes: Arc<ProcessCache>,
    sources: Arc<Sources>,
    table: Arc<dyn ProcessTable>,
    ps_args: String,
}

impl DetailLoader {
    pub fn new(sources: Arc<Sources>, table: Arc<dyn ProcessTable>, ps_args: String) -> Self {
        Self {
            processes: Arc::clone(&sources.processes),
            sources,
            table,
            ps_args,
        }
    }

    /// Gather the details of `pid`. Blocking, runs `ps` and reads `/proc`.
    pub fn load(&self, pid: Pid) -> ProcessDetails {
        ProcessDetails {
            record: self.processes.get_process(pid),
            info: ps_info(&self.ps_args, pid),
            cwd: self.sources.cwd(pid),
            environ: self.table.environ(pid).map_err(|e| format!("{e:#}")),
            fds: self.table.open_fds(pid).map_err(|e| format!("{e:#}")),
            opens: self.sources.opens.get(pid),
        }
    }
}

/// Output of `ps -o <ps_args> -p <pid>`, the error output when it fails
pub fn ps_info(ps_args: &str, pid: Pid) -> String {
    let output = Command::new("ps")
        .args(["-o", ps_args, "-p", &pid.to_string()])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim_end().to_owned()
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            if message.is_empty() {
                format!("ps exited with {}, PID[{pid}] may be gone", output.status)
            } else {
                message.to_owned()
            }
        }
        Err(e) => format!("Failed to run ps: {e}"),
    }
}

/// Send SIGKILL to `pid`
pub fn kill(pid: Pid) -> Result<()> {
    send_signal(nix::unistd::Pid::from_raw(pid.as_raw()), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill PID[{pid}]"))?;
    info!("Killed PID[{pid}]");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ps_info_of_self() {
        let me = Pid::new(std::process::id()).unwrap();
        let info = ps_info("pid,comm", me);
        let mut lines = info.lines();
        assert!(lines.next().is_some_and(|header| header.contains("PID")), "{info}");
        assert!(
            lines.next().is_some_and(|row| row.trim_start().starts_with(&me.to_string())),
            "{info}"
        );
    }

    #[test]
    fn test_ps_info_of_missing_process() {
        // Highest pid the kernel can hand out, unlikely to be in use
        let missing = Pid::new(4_194_303).unwrap();
        let info = ps_info("pid", missing);
        assert!(
            !info.lines().any(|line| line.trim_start().starts_with("4194303")),
            "{info}"
        );
    }

    #[test]
    fn test_kill() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::new(child.id()).unwrap();

        kill(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());

        let err = kill(pid).unwrap_err();
        assert!(err.to_string().contains(&pid.to_string()));
    }
}
