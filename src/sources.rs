use crate::config::{PstConfig, TracerConfig};
use crate::helpers::sudo::wrap_with_sudo;
use crate::open_log::OpenLog;
use crate::prelude::*;
use crate::proc_table::ProcessTable;
use crate::process_cache::ProcessCache;
use proctrace::events::{parse_chdir, parse_exec, parse_open};
use proctrace::{
    ChdirData, CommandBuilder, EventSource, ExecData, LineParser, OpenData, Pid, Probe,
    SourceOptions, TraceKind,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long [`Sources::shutdown`] waits for the tracers to exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Build the command running the tracer of `kind`
///
/// The program is resolved on `PATH` first: once wrapped with sudo, a missing tracer would only
/// show up as sudo exiting.
pub fn tracer_command(config: &TracerConfig, kind: TraceKind) -> Result<CommandBuilder> {
    let program = which::which(&config.program)
        .with_context(|| format!("Failed to find the tracer `{}`", config.program))?;

    let mut command = CommandBuilder::new(program);
    command
        .args(["-e", kind.program()])
        .env("BPFTRACE_STRLEN", config.strlen.to_string());

    if config.sudo {
        command = wrap_with_sudo(command)?;
    }
    Ok(command)
}

/// The three tracers and the caches they feed
pub struct Sources {
    exec: Arc<EventSource<ExecData>>,
    open: Arc<EventSource<OpenData>>,
    chdir: Arc<EventSource<ChdirData>>,
    pub processes: Arc<ProcessCache>,
    pub opens: Arc<OpenLog>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sources {
    /// Spawn the tracers, take the process snapshot and start the background tasks
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &PstConfig, table: Arc<dyn ProcessTable>) -> Result<Self> {
        let options = SourceOptions {
            channel_capacity: config.tracer.channel_capacity,
            ..SourceOptions::default()
        };
        let strlen = config.tracer.strlen;

        // Started before the snapshot so that no exec falls between the two
        let exec_parser: LineParser<ExecData> = Box::new(parse_exec);
        let (exec, exec_stream) = EventSource::spawn(
            TraceKind::Exec.name(),
            &tracer_command(&config.tracer, TraceKind::Exec)?,
            exec_parser,
            None,
            &options,
        )?;

        let open_parser: LineParser<OpenData> = Box::new(move |line: &str| parse_open(line, strlen));
        let (open, open_stream) = EventSource::spawn(
            TraceKind::Open.name(),
            &tracer_command(&config.tracer, TraceKind::Open)?,
            open_parser,
            None,
            &options,
        )?;

        let cwd_table = Arc::clone(&table);
        let chdir_probe: Probe<ChdirData> = Box::new(move |pid: Pid| {
            cwd_table.cwd(pid).map(|cwd| ChdirData {
                cwd: cwd.display().to_string(),
            })
        });
        let chdir_parser: LineParser<ChdirData> = Box::new(parse_chdir);
        // Nothing consumes the chdir stream, the point cache is all the dashboard needs
        let (chdir, _) = EventSource::spawn(
            TraceKind::Chdir.name(),
            &tracer_command(&config.tracer, TraceKind::Chdir)?,
            chdir_parser,
            Some(chdir_probe),
            &options,
        )?;

        let processes = Arc::new(ProcessCache::new(Arc::clone(&table))?);
        let opens = Arc::new(OpenLog::new(config.cache.open_log_capacity));
        let mut tasks = vec![processes.subscribe(exec_stream), opens.subscribe(open_stream)];

        let exec = Arc::new(exec);
        let open = Arc::new(open);
        let chdir = Arc::new(chdir);
        let cancel = CancellationToken::new();

        if let Some(period) = config.reap_interval() {
            let forget = {
                let (exec, open, chdir) = (exec.clone(), open.clone(), chdir.clone());
                move |exited: &[Pid]| {
                    exec.forget(exited);
                    open.forget(exited);
                    chdir.forget(exited);
                }
            };
            tasks.push(tokio::spawn(reap_periodically(
                period,
                table,
                processes.clone(),
                opens.clone(),
                forget,
                cancel.clone(),
            )));
        }

        info!("Tracing started, {} processes in the snapshot", processes.len());
        Ok(Self {
            exec,
            open,
            chdir,
            processes,
            opens,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Current working directory of `pid`, from the chdir tracer or `/proc`
    pub fn cwd(&self, pid: Pid) -> Option<String> {
        self.chdir.get(pid).ok().map(|chdir| chdir.cwd)
    }

    /// Names of the tracers that stopped producing events
    pub fn stopped_tracers(&self) -> Vec<&str> {
        [
            (self.exec.name(), self.exec.is_running()),
            (self.open.name(), self.open.is_running()),
            (self.chdir.name(), self.chdir.is_running()),
        ]
        .into_iter()
        .filter(|(_, running)| !running)
        .map(|(name, _)| name)
        .collect()
    }

    /// Stop the background tasks and terminate the tracers
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.exec.shutdown();
        self.open.shutdown();
        self.chdir.shutdown();

        let exited = async {
            tokio::join!(self.exec.exited(), self.open.exited(), self.chdir.exited());
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, exited).await.is_err() {
            warn!("Tracers did not exit within {SHUTDOWN_TIMEOUT:?}");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        debug!("Sources stopped");
    }
}

/// Drop everything known about processes that exited, every `period`
async fn reap_periodically<F>(
    period: Duration,
    table: Arc<dyn ProcessTable>,
    processes: Arc<ProcessCache>,
    opens: Arc<OpenLog>,
    forget: F,
    cancel: CancellationToken,
) where
    F: Fn(&[Pid]) + Send + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let processes = Arc::clone(&processes);
        let opens = Arc::clone(&opens);
        let table = Arc::clone(&table);
        let reaped = tokio::task::spawn_blocking(move || {
            let exited = processes.reap_exited();
            opens.retain_pids(|pid| !exited.contains(&pid) && table.is_alive(pid));
            exited
        })
        .await;

        match reaped {
            Ok(exited) if !exited.is_empty() => forget(&exited),
            Ok(_) => {}
            Err(e) => warn!("Reaping exited processes failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc_table::testing::{FakeProcess, FakeProcessTable, pid};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// A stand-in for bpftrace, answering according to the program it is given
    const FAKE_BPFTRACE: &str = r#"#!/bin/sh
echo "Attaching probes for $BPFTRACE_STRLEN"
case "$2" in
  *sys_enter_exec*) printf '100 1 bash\n101 100 vim\n' ;;
  *sys_enter_open*) printf '101 3 /etc/hosts\t\n101 -1 /missing\t\n101 4 /etc/passwd\t\n' ;;
  *sys_enter_chdir*) printf '101 /srv\n' ;;
esac
sleep 1000
"#;

    fn fake_bpftrace(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("bpftrace");
        std::fs::write(&path, FAKE_BPFTRACE).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_for(program: &Path) -> PstConfig {
        let mut config = PstConfig::default();
        config.tracer.program = program.display().to_string();
        config.tracer.sudo = false;
        config.cache.reap_interval_secs = 0;
        config
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[test]
    fn test_tracer_command_without_sudo() {
        let config = TracerConfig {
            program: "sh".into(),
            sudo: false,
            strlen: 64,
            ..TracerConfig::default()
        };
        let command = tracer_command(&config, TraceKind::Chdir).unwrap();
        let sh = which::which("sh").unwrap();
        assert_eq!(
            command.as_command_line(),
            format!(
                "BPFTRACE_STRLEN=64 {}",
                command_line(&[
                    &sh.display().to_string(),
                    "-e",
                    TraceKind::Chdir.program()
                ])
            )
        );
    }

    #[test]
    fn test_tracer_command_unknown_program() {
        let config = TracerConfig {
            program: "pst-no-such-tracer".into(),
            sudo: true,
            ..TracerConfig::default()
        };
        let err = tracer_command(&config, TraceKind::Exec).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to find the tracer `pst-no-such-tracer`"
        );
    }

    fn command_line(parts: &[&str]) -> String {
        let mut builder = CommandBuilder::new(parts[0]);
        builder.args(&parts[1..]);
        builder.as_command_line()
    }

    #[test_log::test(tokio::test)]
    async fn test_sources_feed_the_caches() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&fake_bpftrace(&dir));
        let table = Arc::new(FakeProcessTable::with_commands(&[(1, "init"), (100, "sh")]));
        table.insert(
            pid(7),
            FakeProcess {
                command: "daemon".into(),
                cwd: Some(PathBuf::from("/var/lib/daemon")),
                ..Default::default()
            },
        );

        let sources = Sources::start(&config, table).unwrap();

        eventually(|| sources.processes.get_process(pid(101)).command == "vim").await;
        assert_eq!(sources.processes.get_process(pid(100)).command, "bash");
        assert_eq!(sources.processes.get_process(pid(1)).command, "init");

        eventually(|| sources.opens.get(pid(101)).len() == 2).await;
        let paths: Vec<String> = sources
            .opens
            .get(pid(101))
            .into_iter()
            .map(|open| open.path)
            .collect();
        assert_eq!(paths, ["/etc/hosts", "/etc/passwd"]);

        eventually(|| sources.cwd(pid(101)).as_deref() == Some("/srv")).await;
        assert_eq!(sources.cwd(pid(7)).as_deref(), Some("/var/lib/daemon"));
        assert_eq!(sources.cwd(pid(4242)), None);
        assert!(sources.stopped_tracers().is_empty());

        tokio::time::timeout(Duration::from_secs(10), sources.shutdown())
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_reaper_forgets_exited_processes() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&fake_bpftrace(&dir));
        config.cache.reap_interval_secs = 1;
        let table = Arc::new(FakeProcessTable::with_commands(&[(1, "init"), (2, "old")]));

        let sources = Sources::start(&config, table.clone()).unwrap();
        eventually(|| sources.opens.get(pid(101)).len() == 2).await;

        // 100 and 101 only exist in the tracer output, they are not alive in the table
        table.remove(pid(2));
        eventually(|| sources.processes.len() == 1 && sources.opens.is_empty()).await;
        assert_eq!(sources.processes.get_processes("").len(), 1);
        assert_eq!(sources.processes.get_process(pid(1)).command, "init");

        sources.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_tracer_fails_to_start() {
        let config = config_for(Path::new("/nonexistent/bpftrace"));
        let table = Arc::new(FakeProcessTable::default());
        let err = Sources::start(&config, table).err().expect("start should fail");
        assert!(format!("{err:#}").contains("/nonexistent/bpftrace"), "{err:#}");
    }
}
