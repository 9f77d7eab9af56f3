use crate::inspect::ProcessDetails;
use crate::ui::state::{App, KillPrompt, Panel};
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{
    Block, Borders, Cell, Clear, List, ListItem, ListState, Paragraph, Row, Table, TableState,
};

const PROCESS_LIST_WIDTH: u16 = 30;

pub fn render(frame: &mut Frame, app: &App, stopped_tracers: &[&str]) {
    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(0),
            Constraint::Length(2),
        ])
        .split(frame.size());

    render_filter(frame, app, outer[0]);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(PROCESS_LIST_WIDTH), Constraint::Min(0)])
        .split(outer[1]);
    render_processes(frame, app, body[0]);

    let panes = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Ratio(1, 4); 4])
        .split(body[1]);
    let details = app.details.as_ref();
    render_text_pane(frame, app, Panel::Info, panes[0], info_text(details));
    render_text_pane(frame, app, Panel::Files, panes[1], files_text(details));
    render_text_pane(frame, app, Panel::Env, panes[2], env_text(details));
    render_tree(frame, app, panes[3]);

    render_navi(frame, app, stopped_tracers, outer[2]);

    if let Some(prompt) = app.kill_prompt {
        render_kill_prompt(frame, prompt);
    }
}

fn panel_block(app: &App, panel: Panel, title: &'static str) -> Block<'static> {
    let border = if app.focus == panel {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    };
    Block::default()
        .borders(Borders::ALL)
        .border_style(border)
        .title(title)
}

fn header_style() -> Style {
    Style::default().fg(Color::Yellow)
}

fn render_filter(frame: &mut Frame, app: &App, area: Rect) {
    let label = "cmd name:";
    let line = Line::from(vec![
        Span::styled(label, header_style()),
        Span::raw(app.filter.as_str()),
    ]);
    frame.render_widget(Paragraph::new(line), area);

    if app.focus == Panel::Filter && app.kill_prompt.is_none() {
        let x = area.x + (label.len() + app.filter.chars().count()) as u16;
        frame.set_cursor(x.min(area.right().saturating_sub(1)), area.y);
    }
}

fn render_processes(frame: &mut Frame, app: &App, area: Rect) {
    let header = Row::new(["Pid", "PPid", "Cmd"].map(Cell::from)).style(header_style());
    let rows = app.rows.iter().map(|record| {
        Row::new([
            Cell::from(record.pid.to_string()),
            Cell::from(record.ppid.map(|ppid| ppid.to_string()).unwrap_or_default()),
            Cell::from(record.command.clone()),
        ])
    });
    let widths = [
        Constraint::Length(7),
        Constraint::Length(7),
        Constraint::Min(0),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(panel_block(app, Panel::Processes, "processes"))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));

    let mut state = TableState::default();
    if !app.rows.is_empty() {
        state.select(Some(app.selected_row));
    }
    frame.render_stateful_widget(table, area, &mut state);
}

fn render_text_pane(frame: &mut Frame, app: &App, panel: Panel, area: Rect, text: Text<'static>) {
    let (title, offset) = match panel {
        Panel::Info => ("process info", app.scroll[0]),
        Panel::Files => ("process open files", app.scroll[1]),
        _ => ("process environments", app.scroll[2]),
    };
    let paragraph = Paragraph::new(text)
        .block(panel_block(app, panel, title))
        .scroll((offset, 0));
    frame.render_widget(paragraph, area);
}

/// `ps` output with its header highlighted, then the working directory
pub fn info_text(details: Option<&ProcessDetails>) -> Text<'static> {
    let Some(details) = details else {
        return Text::default();
    };

    let mut lines = Vec::new();
    let mut ps_lines = details.info.lines();
    match (ps_lines.next(), ps_lines.next()) {
        (Some(header), Some(row)) => {
            lines.push(Line::styled(header.to_owned(), header_style()));
            lines.push(Line::raw(row.to_owned()));
        }
        (Some(only), None) => lines.push(Line::raw(only.to_owned())),
        _ => {}
    }
    if let Some(cwd) = &details.cwd {
        lines.push(Line::from(vec![
            Span::styled("cwd ", header_style()),
            Span::raw(cwd.clone()),
        ]));
    }
    Text::from(lines)
}

/// Descriptors open right now, then every file traced since pst started
pub fn files_text(details: Option<&ProcessDetails>) -> Text<'static> {
    let Some(details) = details else {
        return Text::default();
    };

    let mut lines = vec![Line::styled("FD   TARGET", header_style())];
    match &details.fds {
        Ok(fds) => lines.extend(
            fds.iter()
                .map(|fd| Line::raw(format!("{:<4} {}", fd.fd, fd.target))),
        ),
        Err(e) => lines.push(Line::styled(e.clone(), Style::default().fg(Color::Red))),
    }

    lines.push(Line::raw(""));
    lines.push(Line::styled(
        format!("OPENED SINCE START ({})", details.opens.len()),
        header_style(),
    ));
    lines.extend(
        details
            .opens
            .iter()
            .map(|open| Line::raw(format!("{:<4} {}", open.fd, open.path))),
    );
    Text::from(lines)
}

pub fn env_text(details: Option<&ProcessDetails>) -> Text<'static> {
    let Some(details) = details else {
        return Text::default();
    };

    match &details.environ {
        Ok(environ) => Text::from(
            environ
                .iter()
                .map(|var| match &var.value {
                    Some(value) => Line::from(vec![
                        Span::styled(var.key.clone(), header_style()),
                        Span::raw("  "),
                        Span::raw(value.clone()),
                    ]),
                    None => Line::styled(var.key.clone(), Style::default().fg(Color::Magenta)),
                })
                .collect::<Vec<_>>(),
        ),
        Err(e) => Text::styled(e.clone(), Style::default().fg(Color::Red)),
    }
}

fn render_tree(frame: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .tree
        .visible_rows()
        .iter()
        .map(|row| {
            let marker = match (row.node.has_children, row.node.expanded) {
                (true, true) => "▾ ",
                (true, false) => "▸ ",
                (false, _) => "  ",
            };
            let style = if row.node.has_children {
                Style::default().fg(Color::Green)
            } else {
                Style::default()
            };
            ListItem::new(Line::styled(
                format!("{}{marker}{}", "  ".repeat(row.depth), row.node.label),
                style,
            ))
        })
        .collect();

    let mut highlight = Style::default();
    if app.focus == Panel::Tree {
        highlight = highlight.add_modifier(Modifier::REVERSED);
    }
    let list = List::new(items)
        .block(panel_block(app, Panel::Tree, "process tree"))
        .highlight_style(highlight);

    let mut state = ListState::default();
    state.select(Some(app.tree.selected_index()));
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_navi(frame: &mut Frame, app: &App, stopped_tracers: &[&str], area: Rect) {
    let mut lines = vec![Line::from(vec![
        Span::styled("tab/shift-tab: panels  ", header_style()),
        Span::raw(app.focus.help()),
    ])];

    let mut notes = Vec::new();
    if let Some(status) = &app.status {
        notes.push(Span::raw(status.clone()));
    }
    if !stopped_tracers.is_empty() {
        if !notes.is_empty() {
            notes.push(Span::raw("  "));
        }
        notes.push(Span::styled(
            format!("stopped tracers: {}", stopped_tracers.join(", ")),
            Style::default().fg(Color::Red),
        ));
    }
    lines.push(Line::from(notes));

    frame.render_widget(Paragraph::new(lines), area);
}

fn render_kill_prompt(frame: &mut Frame, prompt: KillPrompt) {
    let area = centered_rect(50, 7, frame.size());
    let button = |label: &'static str, focused: bool| {
        let style = if focused {
            Style::default().add_modifier(Modifier::REVERSED)
        } else {
            Style::default()
        };
        Span::styled(format!("[ {label} ]"), style)
    };

    let text = Text::from(vec![
        Line::raw("Do you want to kill this process?"),
        Line::styled(format!("PID[{}]", prompt.pid), header_style()),
        Line::raw(""),
        Line::from(vec![
            button("kill", prompt.confirm),
            Span::raw("  "),
            button("Cancel", !prompt.confirm),
        ]),
    ]);

    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(text)
            .alignment(ratatui::layout::Alignment::Center)
            .block(Block::default().borders(Borders::ALL)),
        area,
    );
}

/// A `width` x `height` rectangle centered in `area`
fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}
