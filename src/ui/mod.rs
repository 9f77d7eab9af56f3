//! The terminal dashboard.
//!
//! One task owns the terminal and the [`App`] state. Key presses mutate the state directly,
//! selection changes go through the [`SelectionCoalescer`]. Process list and detail loads run
//! on the blocking pool and report back over a channel.

pub mod render;
pub mod state;
pub mod tree;

use crate::coalescer::SelectionCoalescer;
use crate::config::PstConfig;
use crate::inspect::{self, DetailLoader, ProcessDetails};
use crate::prelude::*;
use crate::sources::Sources;
use crossterm::event::{Event, EventStream};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use futures::StreamExt;
use proctrace::Pid;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use state::{Action, App, LoadedRows};
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often the process list is reloaded from the cache
const LIST_REFRESH: Duration = Duration::from_secs(2);

enum UiEvent {
    /// The selection settled on this process
    Redraw(Pid),
    Details(ProcessDetails),
    Rows(LoadedRows),
}

/// Raw mode and the alternate screen, left when dropped, panics included
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<(Self, Terminal<CrosstermBackend<Stdout>>)> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        let guard = TerminalGuard;
        execute!(io::stdout(), EnterAlternateScreen)?;
        let terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
        Ok((guard, terminal))
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
    }
}

pub async fn run(
    sources: Arc<Sources>,
    loader: DetailLoader,
    config: &PstConfig,
    filter: String,
) -> Result<()> {
    let mut app = App::new(Arc::clone(&sources.processes), filter);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let coalescer = {
        let tx = tx.clone();
        SelectionCoalescer::spawn(
            config.debounce(),
            Box::new(move |pid| {
                let _ = tx.send(UiEvent::Redraw(pid));
            }),
        )
    };
    if let Some(pid) = app.selected_pid() {
        coalescer.notify(pid);
    }

    let (_guard, mut terminal) = TerminalGuard::enter()?;
    let mut events = EventStream::new();
    let mut refresh = tokio::time::interval(LIST_REFRESH);
    // Detail loads may complete out of order, only the last requested one is shown
    let mut requested: Option<Pid> = None;

    loop {
        let stopped_tracers = sources.stopped_tracers();
        terminal.draw(|frame| render::render(frame, &app, &stopped_tracers))?;

        tokio::select! {
            _ = refresh.tick() => reload_rows(&app, &tx),
            Some(event) = rx.recv() => match event {
                UiEvent::Redraw(pid) => {
                    requested = Some(pid);
                    let loader = loader.clone();
                    let tx = tx.clone();
                    tokio::task::spawn_blocking(move || {
                        let _ = tx.send(UiEvent::Details(loader.load(pid)));
                    });
                }
                UiEvent::Details(details) => {
                    if requested == Some(details.record.pid) {
                        app.set_details(details);
                    }
                }
                UiEvent::Rows(rows) => {
                    if app.apply_rows(rows) {
                        if let Some(pid) = app.selected_pid() {
                            coalescer.notify(pid);
                        }
                    }
                }
            },
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) => match app.handle_key(key) {
                    Action::None => {}
                    Action::Quit => break,
                    Action::Select(pid) => coalescer.notify(pid),
                    Action::Reload => reload_rows(&app, &tx),
                    Action::Kill(pid) => {
                        let result = inspect::kill(pid);
                        if let Err(e) = &result {
                            warn!("{e:#}");
                        }
                        app.after_kill(result);
                        if let Some(pid) = app.selected_pid() {
                            coalescer.notify(pid);
                        }
                    }
                },
                // Resizes only need the redraw at the top of the loop
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("Failed to read terminal events"),
                None => break,
            },
        }
    }

    coalescer.shutdown();
    Ok(())
}

/// Load the process list on the blocking pool, listing reads the children of every process
fn reload_rows(app: &App, tx: &mpsc::UnboundedSender<UiEvent>) {
    let request = app.rows_request();
    let tx = tx.clone();
    tokio::task::spawn_blocking(move || {
        let _ = tx.send(UiEvent::Rows(request.load()));
    });
}
