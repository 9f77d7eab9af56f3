//! Debouncing of selection changes.
//!
//! Moving the cursor through the process list fires a notification per row. The detail panes
//! are only refreshed once the selection has been stable for a short window, and never twice in
//! a row for the same process.

use crate::prelude::*;
use proctrace::Pid;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Called with the selected pid once the selection settles
pub type RedrawFn = Box<dyn FnMut(Pid) + Send>;

/// The debounce state machine, driven by explicit instants
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DebounceState {
    pending: Option<Pid>,
    last_rendered: Option<Pid>,
    deadline: Option<Instant>,
}

impl DebounceState {
    /// Record `pid` as the latest selection and push the deadline to `now + window`
    pub fn notify(&mut self, pid: Pid, now: Instant, window: Duration) {
        self.pending = Some(pid);
        self.deadline = Some(now + window);
    }

    /// When the pending selection is due, `None` when idle
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarm and return the pid to render, unless it is already on screen
    pub fn fire(&mut self) -> Option<Pid> {
        self.deadline = None;
        let pid = self.pending.take()?;
        if self.last_rendered == Some(pid) {
            return None;
        }
        self.last_rendered = Some(pid);
        Some(pid)
    }

    /// The last render did not complete, the next notification for it must render again
    pub fn render_failed(&mut self) {
        self.last_rendered = None;
    }

    pub fn last_rendered(&self) -> Option<Pid> {
        self.last_rendered
    }
}

/// Background task owning a [`DebounceState`] and calling the redraw callback on deadlines
pub struct SelectionCoalescer {
    tx: mpsc::UnboundedSender<Pid>,
    cancel: CancellationToken,
}

impl SelectionCoalescer {
    /// Must be called from within a tokio runtime.
    pub fn spawn(window: Duration, redraw: RedrawFn) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run(window, redraw, rx, cancel.clone()));
        Self { tx, cancel }
    }

    /// The selection moved to `pid`
    pub fn notify(&self, pid: Pid) {
        if self.tx.send(pid).is_err() {
            trace!("Selection of {pid} ignored, the coalescer is stopped");
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SelectionCoalescer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    window: Duration,
    mut redraw: RedrawFn,
    mut rx: mpsc::UnboundedReceiver<Pid>,
    cancel: CancellationToken,
) {
    let mut state = DebounceState::default();

    loop {
        let deadline = state.deadline();
        tokio::select! {
            _ = cancel.cancelled() => break,
            selected = rx.recv() => match selected {
                Some(pid) => state.notify(pid, Instant::now(), window),
                None => break,
            },
            // The future is built even when disabled, hence the fallback instant
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let Some(pid) = state.fire() else {
                    continue;
                };
                if catch_unwind(AssertUnwindSafe(|| redraw(pid))).is_err() {
                    error!("Redrawing the details of {pid} panicked");
                    state.render_failed();
                }
            }
        }
    }
    debug!("Selection coalescer stopped");
}
