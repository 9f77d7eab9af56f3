use crate::command::CommandBuilder;
use crate::error::TraceError;
use crate::pid::Pid;
use log::{debug, trace, warn};
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Parses one tracer line into the pid it concerns and its payload
pub type LineParser<T> = Box<dyn Fn(&str) -> Result<(Pid, T), TraceError> + Send + Sync>;

/// Synchronous lookup used when the point cache has never seen a pid
pub type Probe<T> = Box<dyn Fn(Pid) -> Option<T> + Send + Sync>;

/// Receiving end of an [`EventSource`], in tracer emission order
pub type EventStream<T> = mpsc::Receiver<Traced<T>>;

/// A parsed event along with the pid it concerns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traced<T> {
    pub pid: Pid,
    pub value: T,
}

#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Capacity of the event channel, the reader waits when it is full
    pub channel_capacity: usize,
    /// Lines printed by the tracer before its first event (attach banner)
    pub banner_lines: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 500,
            banner_lines: 1,
        }
    }
}

type PointCache<T> = Arc<RwLock<HashMap<Pid, T>>>;

/// One tracer subprocess turned into a typed stream plus a "last known value per pid" cache.
///
/// Two background tasks are spawned on the current tokio runtime:
/// - the reader parses stdout line by line, updates the point cache and forwards events
/// - the supervisor owns the subprocess and kills its process group on shutdown
///
/// When the tracer exits the stream closes and the point cache keeps answering with the last
/// values it saw.
pub struct EventSource<T> {
    name: String,
    cache: PointCache<T>,
    probe: Option<Probe<T>>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    exited: CancellationToken,
}

impl<T> EventSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Spawn the tracer and start ingesting its output
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        command: &CommandBuilder,
        parser: LineParser<T>,
        probe: Option<Probe<T>>,
        options: &SourceOptions,
    ) -> Result<(Self, EventStream<T>), TraceError> {
        let name = name.into();
        let command_line = command.as_command_line();
        debug!("Starting {name} tracer: {command_line}");

        let mut cmd = command.build();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| TraceError::Spawn {
            command: command_line.clone(),
            source,
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(TraceError::Spawn {
                command: command_line,
                source: std::io::Error::other("tracer output is not captured"),
            });
        };

        let cache: PointCache<T> = Arc::new(RwLock::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let exited = CancellationToken::new();
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

        tokio::spawn(read_events(
            name.clone(),
            stdout,
            parser,
            cache.clone(),
            tx,
            options.banner_lines,
            running.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(log_stderr(name.clone(), stderr));
        tokio::spawn(supervise(
            name.clone(),
            child,
            shutdown.clone(),
            exited.clone(),
        ));

        Ok((
            Self {
                name,
                cache,
                probe,
                running,
                shutdown,
                exited,
            },
            rx,
        ))
    }

    /// Last known value for `pid`, falling back to the probe on a miss
    pub fn get(&self, pid: Pid) -> Result<T, TraceError> {
        let cached = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned();
        if let Some(value) = cached {
            return Ok(value);
        }

        let probe = self.probe.as_ref().ok_or(TraceError::NotFound(pid))?;
        let probed = probe(pid).ok_or(TraceError::NotFound(pid))?;

        // The reader may have raced us, its value is newer than the probe's
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.entry(pid).or_insert(probed).clone())
    }

    /// Drop point cache entries, used once the pids are known to be gone
    pub fn forget(&self, pids: &[Pid]) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        for pid in pids {
            cache.remove(pid);
        }
    }

    pub fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> EventSource<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the tracer output is still being read
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the supervisor to terminate the tracer
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the tracer subprocess has been reaped
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }
}

impl<T> Drop for EventSource<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_events<T, R>(
    name: String,
    output: R,
    parser: LineParser<T>,
    cache: PointCache<T>,
    tx: mpsc::Sender<Traced<T>>,
    mut banner_lines: usize,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
) where
    T: Clone + Send + Sync + 'static,
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    let mut buffer = Vec::new();
    let mut tx = Some(tx);
    let mut forwarded = 0usize;

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => {
                debug!("{name} tracer closed its output after {forwarded} events");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("{name} tracer read error: {e}");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buffer).into_owned();

        if banner_lines > 0 {
            banner_lines -= 1;
            trace!("{name} tracer banner: {}", line.trim_end());
            continue;
        }

        let (pid, value) = match parser(line.as_str()) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("{name}: dropping line: {e}");
                continue;
            }
        };

        cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, value.clone());

        if let Some(sender) = &tx {
            if sender.send(Traced { pid, value }).await.is_err() {
                debug!("{name} stream has no subscriber, keeping the point cache only");
                tx = None;
            } else {
                forwarded += 1;
            }
        }
    }

    running.store(false, Ordering::Release);
    shutdown.cancel();
}

async fn log_stderr<R: AsyncRead + Unpin>(name: String, stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!("[{name} stderr] {line}");
    }
}

async fn supervise(
    name: String,
    mut child: Child,
    shutdown: CancellationToken,
    exited: CancellationToken,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => debug!("{name} tracer exited with {status}"),
            Err(e) => warn!("Failed to wait for the {name} tracer: {e}"),
        },
        _ = shutdown.cancelled() => terminate(&name, &mut child).await,
    }
    exited.cancel();
}

/// How long a tracer gets to exit after SIGTERM before it is killed
const TERM_GRACE: Duration = Duration::from_secs(2);

fn signal_group(name: &str, child: &Child, signal: Signal) {
    let Some(id) = child.id() else {
        return;
    };
    let group = nix::unistd::Pid::from_raw(id as libc::pid_t);
    if let Err(e) = nix::sys::signal::killpg(group, signal) {
        debug!("Failed to send {signal} to the {name} tracer process group: {e}");
    }
}

/// SIGTERM the process group, SIGKILL it if it outlives [`TERM_GRACE`].
///
/// A tracer run through sudo is owned by root: the signal reaches it through sudo relaying it,
/// so the group gets time to exit on its own.
async fn terminate(name: &str, child: &mut Child) {
    signal_group(name, child, Signal::SIGTERM);

    let status = match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("{name} tracer still running {TERM_GRACE:?} after SIGTERM, killing it");
            signal_group(name, child, Signal::SIGKILL);
            if let Err(e) = child.start_kill() {
                debug!("Failed to kill the {name} tracer: {e}");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => debug!("{name} tracer terminated with {status}"),
        Err(e) => warn!("Failed to reap the {name} tracer: {e}"),
    }
}
