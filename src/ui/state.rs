use crate::inspect::ProcessDetails;
use crate::process_cache::{ProcessCache, ProcessRecord};
use crate::ui::tree::{NodeRef, ProcessTree};
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use proctrace::Pid;
use std::sync::Arc;

/// Focusable panels, in Tab order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Filter,
    Processes,
    Info,
    Files,
    Env,
    Tree,
}

impl Panel {
    pub const ALL: [Panel; 6] = [
        Panel::Filter,
        Panel::Processes,
        Panel::Info,
        Panel::Files,
        Panel::Env,
        Panel::Tree,
    ];

    fn position(self) -> usize {
        Panel::ALL
            .iter()
            .position(|panel| *panel == self)
            .unwrap_or_default()
    }

    pub fn next(self) -> Panel {
        Panel::ALL[(self.position() + 1) % Panel::ALL.len()]
    }

    pub fn previous(self) -> Panel {
        Panel::ALL[(self.position() + Panel::ALL.len() - 1) % Panel::ALL.len()]
    }

    /// Key help shown in the navigation bar
    pub fn help(self) -> &'static str {
        match self {
            Panel::Filter => "type: filter by command  enter: processes  esc: quit",
            Panel::Processes => "j/k: move  g/G: top/bottom  K: kill  esc: quit",
            Panel::Info | Panel::Files | Panel::Env => "j/k: scroll  g: top",
            Panel::Tree => "j/k: move  enter: toggle  l/h: expand/collapse  K: kill",
        }
    }
}

/// What the event loop has to do after a key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Quit,
    /// The selection moved to this process
    Select(Pid),
    /// The kill was confirmed
    Kill(Pid),
    /// The filter changed, the process list has to be reloaded
    Reload,
}

/// A process list load, detached from the [`App`] so that it can run off the UI task
pub struct RowsRequest {
    processes: Arc<ProcessCache>,
    filter: String,
}

impl RowsRequest {
    /// Reads the children of every listed process from the process table
    pub fn load(self) -> LoadedRows {
        LoadedRows {
            rows: self.processes.get_processes(&self.filter),
            filter: self.filter,
        }
    }
}

/// The process list for the filter it was loaded with
#[derive(Debug)]
pub struct LoadedRows {
    filter: String,
    rows: Vec<ProcessRecord>,
}

/// The kill confirmation dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillPrompt {
    pub pid: Pid,
    /// Focus is on the kill button rather than on cancel
    pub confirm: bool,
}

/// Everything the dashboard shows, mutated by key presses and loaded details
pub struct App {
    processes: Arc<ProcessCache>,
    pub filter: String,
    pub rows: Vec<ProcessRecord>,
    pub selected_row: usize,
    pub focus: Panel,
    pub details: Option<ProcessDetails>,
    pub tree: ProcessTree,
    pub kill_prompt: Option<KillPrompt>,
    /// Scroll offsets of the info, files and env panes
    pub scroll: [u16; 3],
    pub status: Option<String>,
}

impl App {
    pub fn new(processes: Arc<ProcessCache>, filter: String) -> Self {
        let mut app = Self {
            processes,
            filter,
            rows: Vec::new(),
            selected_row: 0,
            focus: Panel::Processes,
            details: None,
            tree: ProcessTree::default(),
            kill_prompt: None,
            scroll: [0; 3],
            status: None,
        };
        app.tree.clear("no process selected");
        app.refresh_rows();
        app
    }

    pub fn selected_pid(&self) -> Option<Pid> {
        self.rows.get(self.selected_row).map(|row| row.pid)
    }

    /// Reload the process list in place
    pub fn refresh_rows(&mut self) {
        let loaded = self.rows_request().load();
        self.apply_rows(loaded);
    }

    pub fn rows_request(&self) -> RowsRequest {
        RowsRequest {
            processes: Arc::clone(&self.processes),
            filter: self.filter.clone(),
        }
    }

    /// Show a loaded process list, keeping the selected process when it is still listed.
    ///
    /// A list loaded for a filter that has changed since is dropped, returns whether it was shown.
    pub fn apply_rows(&mut self, loaded: LoadedRows) -> bool {
        if loaded.filter != self.filter {
            return false;
        }
        let selected = self.selected_pid();
        self.rows = loaded.rows;
        self.selected_row = selected
            .and_then(|pid| self.rows.iter().position(|row| row.pid == pid))
            .unwrap_or_else(|| self.selected_row.min(self.rows.len().saturating_sub(1)));
        true
    }

    /// Show freshly loaded details. The tree follows the selection unless it has the focus.
    pub fn set_details(&mut self, details: ProcessDetails) {
        if self.focus != Panel::Tree {
            self.tree.set_root(&self.processes, details.record.pid);
        }
        if self.details.as_ref().map(|d| d.record.pid) != Some(details.record.pid) {
            self.scroll = [0; 3];
        }
        self.details = Some(details);
    }

    /// A process was killed, reload what may show it
    pub fn after_kill(&mut self, result: anyhow::Result<()>) {
        self.status = Some(match result {
            Ok(()) => "process killed".to_owned(),
            Err(e) => format!("{e:#}"),
        });
        self.refresh_rows();
        if let Some(root) = self.tree.root_pid() {
            self.tree.rebuild(&self.processes, root);
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Action {
        if key.kind == KeyEventKind::Release {
            return Action::None;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Action::Quit;
        }
        if let Some(prompt) = self.kill_prompt {
            return self.handle_prompt_key(prompt, key);
        }

        match key.code {
            KeyCode::Tab => {
                self.focus = self.focus.next();
                return Action::None;
            }
            KeyCode::BackTab => {
                self.focus = self.focus.previous();
                return Action::None;
            }
            _ => {}
        }
        self.status = None;

        match self.focus {
            Panel::Filter => self.handle_filter_key(key),
            Panel::Processes => self.handle_processes_key(key),
            Panel::Info => self.scroll_pane(0, key),
            Panel::Files => self.scroll_pane(1, key),
            Panel::Env => self.scroll_pane(2, key),
            Panel::Tree => self.handle_tree_key(key),
        }
    }

    fn handle_prompt_key(&mut self, prompt: KillPrompt, key: KeyEvent) -> Action {
        match key.code {
            KeyCode::Left | KeyCode::Right | KeyCode::Tab | KeyCode::BackTab => {
                self.kill_prompt = Some(KillPrompt {
                    confirm: !prompt.confirm,
                    ..prompt
                });
                Action::None
            }
            KeyCode::Enter if prompt.confirm => {
                self.kill_prompt = None;
                Action::Kill(prompt.pid)
            }
            KeyCode::Char('y') => {
                self.kill_prompt = None;
                Action::Kill(prompt.pid)
            }
            KeyCode::Enter | KeyCode::Esc | KeyCode::Char('n') => {
                self.kill_prompt = None;
                Action::None
            }
            _ => Action::None,
        }
    }

    fn handle_filter_key(&mut self, key: KeyEvent) -> Action {
        match key.code {
            KeyCode::Esc => return Action::Quit,
            KeyCode::Enter => {
                self.focus = Panel::Processes;
                return Action::None;
            }
            KeyCode::Backspace => {
                if self.filter.pop().is_none() {
                    return Action::None;
                }
            }
            KeyCode::Char(c) => self.filter.push(c),
            _ => return Action::None,
        }
        Action::Reload
    }

    fn handle_processes_key(&mut self, key: KeyEvent) -> Action {
        let last = self.rows.len().saturating_sub(1);
        let target = match key.code {
            KeyCode::Esc => return Action::Quit,
            KeyCode::Char('K') => {
                self.open_kill_prompt(self.selected_pid());
                return Action::None;
            }
            KeyCode::Down | KeyCode::Char('j') => (self.selected_row + 1).min(last),
            KeyCode::Up | KeyCode::Char('k') => self.selected_row.saturating_sub(1),
            KeyCode::PageDown => (self.selected_row + 10).min(last),
            KeyCode::PageUp => self.selected_row.saturating_sub(10),
            KeyCode::Home | KeyCode::Char('g') => 0,
            KeyCode::End | KeyCode::Char('G') => last,
            _ => return Action::None,
        };
        if target == self.selected_row {
            return Action::None;
        }
        self.selected_row = target;
        self.selected_pid().map_or(Action::None, Action::Select)
    }

    fn handle_tree_key(&mut self, key: KeyEvent) -> Action {
        let moved = match key.code {
            KeyCode::Down | KeyCode::Char('j') => self.tree.select_next(),
            KeyCode::Up | KeyCode::Char('k') => self.tree.select_previous(),
            KeyCode::Enter => {
                self.tree.toggle_selected(&self.processes);
                false
            }
            KeyCode::Char('l') => {
                self.tree.expand_selected(&self.processes);
                false
            }
            KeyCode::Char('h') => {
                self.tree.collapse_selected();
                false
            }
            KeyCode::Char('K') => {
                if let NodeRef::Process(pid) = self.tree.selected() {
                    self.open_kill_prompt(Some(pid));
                }
                false
            }
            _ => false,
        };

        match self.tree.selected() {
            NodeRef::Process(pid) if moved => Action::Select(pid),
            _ => Action::None,
        }
    }

    fn scroll_pane(&mut self, pane: usize, key: KeyEvent) -> Action {
        let offset = &mut self.scroll[pane];
        match key.code {
            KeyCode::Down | KeyCode::Char('j') => *offset = offset.saturating_add(1),
            KeyCode::Up | KeyCode::Char('k') => *offset = offset.saturating_sub(1),
            KeyCode::PageDown => *offset = offset.saturating_add(10),
            KeyCode::PageUp => *offset = offset.saturating_sub(10),
            KeyCode::Home | KeyCode::Char('g') => *offset = 0,
            _ => {}
        }
        Action::None
    }

    fn open_kill_prompt(&mut self, pid: Option<Pid>) {
        if let Some(pid) = pid {
            self.kill_prompt = Some(KillPrompt {
                pid,
                confirm: true,
            });
        }
    }
}
