//! Ratatui interface for logscope.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::layout::{Constraint, Direction, Layout, Position, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Frame;
use smol_str::SmolStr;
use thiserror::Error;

use crate::colors::level_color_name;
use crate::logscope_core::{LogEntry, Status};
use crate::logscope_window::ScrollState;
use crate::sanitize::{sanitize_message, summary_line};

pub const MAX_QUERY_LEN: usize = 512;
const SUMMARY_LIMIT: usize = 240;
const SIDE_BY_SIDE_MIN_WIDTH: u16 = 110;

/// Key handling modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Search,
}

/// What the event loop has to do after a key press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewAction {
    None,
    Quit,
    SubmitQuery(String),
    ToggleStream,
    /// The scroll position changed.
    Scrolled,
}

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("terminal io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Input buffer with a cursor (byte offset, always on a char boundary).
#[derive(Debug, Clone, Default)]
pub struct InputState {
    pub buffer: String,
    pub cursor: usize,
}

impl InputState {
    pub fn new(value: &str) -> Self {
        Self { buffer: value.to_string(), cursor: value.len() }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    pub fn insert_char(&mut self, ch: char) {
        self.buffer.insert(self.cursor, ch);
        self.cursor += ch.len_utf8();
    }

    pub fn backspace(&mut self) {
        let Some((idx, _)) = self.buffer[..self.cursor].char_indices().next_back() else {
            return;
        };
        self.buffer.remove(idx);
        self.cursor = idx;
    }

    pub fn move_left(&mut self) {
        if let Some((idx, _)) = self.buffer[..self.cursor].char_indices().next_back() {
            self.cursor = idx;
        }
    }

    pub fn move_right(&mut self) {
        if let Some(ch) = self.buffer[self.cursor..].chars().next() {
            self.cursor += ch.len_utf8();
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }
}

/// Everything the footer shows, gathered before drawing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub status: Status,
    pub streaming: bool,
    pub malformed: u64,
    pub notice: Option<String>,
}

#[derive(Debug)]
pub struct LogView {
    pub mode: Mode,
    pub query: InputState,
    pub selected: usize,
    pub show_detail: bool,
    selected_id: Option<SmolStr>,
}

impl LogView {
    pub fn new(query: &str) -> Self {
        Self {
            mode: Mode::Normal,
            query: InputState::new(query),
            selected: 0,
            show_detail: true,
            selected_id: None,
        }
    }

    pub fn handle_key(
        &mut self,
        key: KeyEvent,
        scroll: &mut ScrollState,
        entries: &[LogEntry],
    ) -> ViewAction {
        match self.mode {
            Mode::Normal => self.handle_normal(key, scroll, entries),
            Mode::Search => self.handle_search(key),
        }
    }

    /// Keeps the selection on the same entry after the list changed. While the
    /// newest row is selected at the top, the selection stays on the newest.
    pub fn reanchor(&mut self, scroll: &mut ScrollState, entries: &[LogEntry]) {
        let following = self.selected == 0 && scroll.offset == 0;
        if !following {
            if let Some(id) = &self.selected_id {
                if let Some(position) = entries.iter().position(|entry| &entry.id == id) {
                    self.selected = position;
                }
            }
        }
        self.select(self.selected.min(entries.len().saturating_sub(1)), entries);
        scroll.follow(self.selected, entries.len());
    }

    pub fn reset(&mut self, scroll: &mut ScrollState) {
        self.selected = 0;
        self.selected_id = None;
        scroll.scroll_to_top();
    }

    pub fn render(
        &mut self,
        frame: &mut Frame<'_>,
        entries: &[LogEntry],
        scroll: &mut ScrollState,
        footer: &StatusLine,
    ) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(1)])
            .split(frame.area());

        self.render_query(frame, chunks[0]);
        let (list_area, detail_area) = self.main_areas(chunks[1]);
        self.render_list(frame, list_area, entries, scroll);
        if let Some(detail_area) = detail_area {
            self.render_detail(frame, detail_area, entries);
        }
        render_footer(frame, chunks[2], entries.len(), footer);
    }

    fn handle_normal(&mut self, key: KeyEvent, scroll: &mut ScrollState, entries: &[LogEntry]) -> ViewAction {
        let total = entries.len();
        let page = scroll.visible_rows().max(1) as isize;
        let delta: isize = match key {
            KeyEvent { code: KeyCode::Char('c'), modifiers, .. }
                if modifiers.contains(KeyModifiers::CONTROL) =>
            {
                return ViewAction::Quit;
            }
            KeyEvent { code: KeyCode::Char('q'), .. } => return ViewAction::Quit,
            KeyEvent { code: KeyCode::Char('/'), .. } => {
                self.mode = Mode::Search;
                return ViewAction::None;
            }
            KeyEvent { code: KeyCode::Char('s'), .. } => return ViewAction::ToggleStream,
            KeyEvent { code: KeyCode::Enter, .. } | KeyEvent { code: KeyCode::Char('d'), .. } => {
                self.show_detail = !self.show_detail;
                return ViewAction::None;
            }
            KeyEvent { code: KeyCode::Char('j'), .. } | KeyEvent { code: KeyCode::Down, .. } => 1,
            KeyEvent { code: KeyCode::Char('k'), .. } | KeyEvent { code: KeyCode::Up, .. } => -1,
            KeyEvent { code: KeyCode::PageDown, .. } => page,
            KeyEvent { code: KeyCode::PageUp, .. } => -page,
            KeyEvent { code: KeyCode::Char('g'), .. } | KeyEvent { code: KeyCode::Home, .. } => {
                -(self.selected as isize)
            }
            KeyEvent { code: KeyCode::Char('G'), .. } | KeyEvent { code: KeyCode::End, .. } => {
                total.saturating_sub(1) as isize - self.selected as isize
            }
            _ => return ViewAction::None,
        };
        if total == 0 {
            return ViewAction::None;
        }
        let target = (self.selected as isize + delta).clamp(0, total as isize - 1) as usize;
        self.select(target, entries);
        scroll.follow(self.selected, total);
        ViewAction::Scrolled
    }

    fn handle_search(&mut self, key: KeyEvent) -> ViewAction {
        match key {
            KeyEvent { code: KeyCode::Esc, .. } => {
                self.mode = Mode::Normal;
                ViewAction::None
            }
            KeyEvent { code: KeyCode::Enter, .. } => {
                self.mode = Mode::Normal;
                ViewAction::SubmitQuery(self.query.buffer.trim().to_string())
            }
            KeyEvent { code: KeyCode::Backspace, .. } => {
                self.query.backspace();
                ViewAction::None
            }
            KeyEvent { code: KeyCode::Left, .. } => {
                self.query.move_left();
                ViewAction::None
            }
            KeyEvent { code: KeyCode::Right, .. } => {
                self.query.move_right();
                ViewAction::None
            }
            KeyEvent { code: KeyCode::Char('u'), modifiers, .. }
                if modifiers.contains(KeyModifiers::CONTROL) =>
            {
                self.query.clear();
                ViewAction::None
            }
            KeyEvent { code: KeyCode::Char(c), modifiers, .. }
                if !modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
            {
                if self.query.buffer.len() < MAX_QUERY_LEN {
                    self.query.insert_char(c);
                }
                ViewAction::None
            }
            _ => ViewAction::None,
        }
    }

    fn select(&mut self, index: usize, entries: &[LogEntry]) {
        self.selected = index;
        self.selected_id = entries.get(index).map(|entry| entry.id.clone());
    }

    fn main_areas(&self, area: Rect) -> (Rect, Option<Rect>) {
        if !self.show_detail {
            return (area, None);
        }
        let direction =
            if area.width >= SIDE_BY_SIDE_MIN_WIDTH { Direction::Horizontal } else { Direction::Vertical };
        let chunks = Layout::default()
            .direction(direction)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(area);
        (chunks[0], Some(chunks[1]))
    }

    fn render_query(&self, frame: &mut Frame<'_>, area: Rect) {
        let searching = self.mode == Mode::Search;
        let border = if searching { Style::default().fg(Color::Green) } else { Style::default() };
        let block = Block::default().borders(Borders::ALL).title(" Query ").border_style(border);
        let inner = block.inner(area);
        let text = if self.query.buffer.is_empty() && !searching {
            Line::from(Span::styled("press / to search", dimmed()))
        } else {
            Line::from(self.query.buffer.as_str())
        };
        frame.render_widget(Paragraph::new(text).block(block), area);
        if searching {
            let column = self.query.buffer[..self.query.cursor].chars().count() as u16;
            let x = inner.x.saturating_add(column).min(inner.right().saturating_sub(1));
            frame.set_cursor_position(Position::new(x, inner.y));
        }
    }

    fn render_list(&self, frame: &mut Frame<'_>, area: Rect, entries: &[LogEntry], scroll: &mut ScrollState) {
        let total = entries.len();
        let position = if total == 0 { 0 } else { self.selected + 1 };
        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Logs ")
            .title_bottom(Line::from(format!(" {position} of {total} ")).right_aligned());
        let inner = block.inner(area);
        frame.render_widget(block, area);

        scroll.set_viewport_height(inner.height as usize);
        scroll.follow(self.selected, total);
        let window = scroll.window(total);

        let width = inner.width as usize;
        let items: Vec<ListItem> = entries[window.start..window.end]
            .iter()
            .map(|entry| ListItem::new(format_row(entry, width)))
            .collect();
        let offset = scroll.first_visible_row().saturating_sub(window.start);
        let mut state = ListState::default().with_offset(offset);
        if total > 0 && (window.start..window.end).contains(&self.selected) {
            state.select(Some(self.selected - window.start));
        }
        let list = List::new(items).highlight_style(Style::default().add_modifier(Modifier::REVERSED));
        frame.render_stateful_widget(list, inner, &mut state);
    }

    fn render_detail(&self, frame: &mut Frame<'_>, area: Rect, entries: &[LogEntry]) {
        let block = Block::default().borders(Borders::ALL).title(" Detail ");
        let Some(entry) = entries.get(self.selected) else {
            frame.render_widget(Paragraph::new("").block(block), area);
            return;
        };

        let mut lines = vec![
            Line::from(vec![Span::styled("id        ", dimmed()), Span::raw(entry.id.to_string())]),
            Line::from(vec![Span::styled("timestamp ", dimmed()), Span::raw(entry.timestamp.to_string())]),
            Line::from(vec![
                Span::styled("level     ", dimmed()),
                Span::styled(entry.level.as_str(), level_style(entry)),
            ]),
        ];
        for prop in &entry.props {
            lines.push(Line::from(vec![
                Span::styled(format!("{} = ", prop.key), dimmed()),
                Span::raw(sanitize_message(&prop.value).into_owned()),
            ]));
        }
        lines.push(Line::default());
        for line in sanitize_message(&entry.msg).lines() {
            lines.push(Line::from(line.to_string()));
        }
        let paragraph = Paragraph::new(Text::from(lines)).block(block).wrap(Wrap { trim: false });
        frame.render_widget(paragraph, area);
    }
}

fn render_footer(frame: &mut Frame<'_>, area: Rect, total: usize, footer: &StatusLine) {
    let status_style = match footer.status {
        Status::Error(_) => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        Status::Fetching => Style::default().fg(Color::Yellow),
        _ => dimmed(),
    };
    let mut spans = vec![
        Span::styled(footer.status.label().to_string(), status_style),
        Span::raw(format!(" · {total} entries · ")),
        if footer.streaming {
            Span::styled("live", Style::default().fg(Color::Green))
        } else {
            Span::styled("paused", dimmed())
        },
    ];
    if footer.malformed > 0 {
        spans.push(Span::raw(format!(" · {} malformed dropped", footer.malformed)));
    }
    if let Some(notice) = &footer.notice {
        spans.push(Span::raw(" · "));
        spans.push(Span::styled(notice.clone(), Style::default().fg(Color::Yellow)));
    }
    spans.push(Span::styled("  / search · s stream · d detail · q quit", dimmed()));
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn format_row(entry: &LogEntry, width: usize) -> Line<'static> {
    let timestamp = entry.timestamp.to_string();
    let used = timestamp.chars().count() + 7;
    let summary = summary_line(&entry.msg, width.saturating_sub(used).clamp(1, SUMMARY_LIMIT));
    Line::from(vec![
        Span::styled(timestamp, dimmed()),
        Span::raw(" "),
        Span::styled(format!("{:<5}", entry.level.as_str()), level_style(entry)),
        Span::raw(" "),
        Span::raw(summary),
    ])
}

fn level_style(entry: &LogEntry) -> Style {
    Style::default().fg(color_from_name(level_color_name(entry.level)))
}

fn color_from_name(value: &str) -> Color {
    match value {
        "green" => Color::Green,
        "yellow" => Color::Yellow,
        "red" => Color::Red,
        "purple" => Color::Magenta,
        "blue" => Color::Blue,
        _ => Color::DarkGray,
    }
}

fn dimmed() -> Style {
    Style::default().fg(Color::DarkGray)
}
