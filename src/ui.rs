use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::debug;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};
use std::{io, time::Duration};
use textwrap::wrap;
use tui_input::{backend::crossterm::EventHandler, Input};

use parley::models::{ConnectionState, Conversation, Direction as MessageDirection, LoadState};
use parley::InboxSnapshot;

// Export types needed by main module
pub use ratatui::Terminal;
pub use ratatui::backend::CrosstermBackend;

/// What the main loop should do after a key press
#[derive(Debug, Clone, PartialEq)]
pub enum UiAction {
    Quit,
    Select(String),
    RetryLoad,
}

pub struct InboxUI {
    snapshot: InboxSnapshot,
    cursor: usize,
    cursor_phone: Option<String>, // Keeps the highlight on a conversation while the list reorders
    filter: Input,
    filtering: bool,
    help_visible: bool,
}

impl InboxUI {
    pub fn new(snapshot: InboxSnapshot) -> Self {
        let mut ui = InboxUI {
            snapshot,
            cursor: 0,
            cursor_phone: None,
            filter: Input::default(),
            filtering: false,
            help_visible: false,
        };
        ui.sync_cursor();
        ui
    }

    pub fn update(&mut self, snapshot: InboxSnapshot) {
        self.snapshot = snapshot;
        self.sync_cursor();
    }

    /// Conversations matching the filter, in list order
    fn visible(&self) -> Vec<&Conversation> {
        let needle = self.filter.value().trim().to_lowercase();
        self.snapshot
            .conversations
            .iter()
            .filter(|c| {
                needle.is_empty()
                    || c.display_name.to_lowercase().contains(&needle)
                    || c.phone.contains(&needle)
            })
            .collect()
    }

    fn sync_cursor(&mut self) {
        let visible: Vec<String> = self.visible().iter().map(|c| c.phone.clone()).collect();
        if visible.is_empty() {
            self.cursor = 0;
            self.cursor_phone = None;
            return;
        }
        if let Some(index) = self
            .cursor_phone
            .as_ref()
            .and_then(|phone| visible.iter().position(|p| p == phone))
        {
            self.cursor = index;
        } else {
            self.cursor = self.cursor.min(visible.len() - 1);
            self.cursor_phone = Some(visible[self.cursor].clone());
        }
    }

    fn move_cursor(&mut self, delta: isize) {
        let len = self.visible().len();
        if len == 0 {
            return;
        }
        let next = (self.cursor as isize + delta).clamp(0, len as isize - 1) as usize;
        self.cursor = next;
        self.cursor_phone = self.visible().get(next).map(|c| c.phone.clone());
    }

    pub fn handle_input(&mut self) -> Result<Option<UiAction>> {
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(self.handle_key(key));
                }
            }
        }
        Ok(None)
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Option<UiAction> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Some(UiAction::Quit);
        }

        if self.filtering {
            match key.code {
                KeyCode::Esc => {
                    self.filter.reset();
                    self.filtering = false;
                }
                KeyCode::Enter => self.filtering = false,
                _ => {
                    self.filter.handle_event(&Event::Key(key));
                }
            }
            self.sync_cursor();
            return None;
        }

        if self.help_visible {
            // Any key closes help
            self.help_visible = false;
            return None;
        }

        match key.code {
            KeyCode::Esc | KeyCode::Char('q') => Some(UiAction::Quit),
            KeyCode::Up | KeyCode::Char('k') => {
                self.move_cursor(-1);
                None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.move_cursor(1);
                None
            }
            KeyCode::Home => {
                self.move_cursor(isize::MIN / 2);
                None
            }
            KeyCode::End => {
                self.move_cursor(isize::MAX / 2);
                None
            }
            KeyCode::Enter => self.cursor_phone.clone().map(UiAction::Select),
            KeyCode::Char('/') => {
                self.filtering = true;
                None
            }
            KeyCode::Char('r') if matches!(self.snapshot.load, LoadState::Failed(_)) => {
                Some(UiAction::RetryLoad)
            }
            KeyCode::Char('?') => {
                self.help_visible = true;
                None
            }
            other => {
                debug!("UI: unhandled key {:?}", other);
                None
            }
        }
    }

    pub fn draw<B: Backend>(&self, frame: &mut Frame<B>) {
        let size = frame.size();

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(3),    // Body
                Constraint::Length(1), // Status line
            ])
            .split(size);

        match &self.snapshot.load {
            LoadState::Failed(reason) => draw_load_error(frame, reason, rows[0]),
            LoadState::Loading if self.snapshot.conversations.is_empty() => {
                let loading = Paragraph::new("Loading conversations...")
                    .block(Block::default().title("Inbox").borders(Borders::ALL));
                frame.render_widget(loading, rows[0]);
            }
            _ => self.draw_body(frame, rows[0]),
        }

        self.draw_status(frame, rows[1]);

        if self.help_visible {
            draw_help(frame, size);
        }
    }

    fn draw_body<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(35), // Conversation list
                Constraint::Percentage(65), // Detail panel
            ])
            .split(area);

        let visible = self.visible();
        let selected = self.snapshot.selected.as_deref();

        let items: Vec<ListItem> = visible
            .iter()
            .map(|c| {
                let arrow = match c.last_direction {
                    MessageDirection::Incoming => "<",
                    MessageDirection::Outgoing => ">",
                };
                let marker = if Some(c.phone.as_str()) == selected { "*" } else { " " };
                let mut spans = vec![
                    Span::raw(format!("{}{} ", marker, arrow)),
                    Span::styled(c.display_name.clone(), Style::default().add_modifier(Modifier::BOLD)),
                ];
                if c.unread_count > 0 {
                    spans.push(Span::styled(
                        format!(" ({})", c.unread_count),
                        Style::default().fg(Color::Green),
                    ));
                }
                ListItem::new(Line::from(spans))
            })
            .collect();

        let title = if self.filter.value().is_empty() {
            format!("Conversations ({})", visible.len())
        } else {
            format!("Conversations ({}) /{}", visible.len(), self.filter.value())
        };

        let mut list_state = ListState::default();
        if !items.is_empty() {
            list_state.select(Some(self.cursor));
        }
        let list = List::new(items)
            .block(Block::default().title(title).borders(Borders::ALL))
            .highlight_style(Style::default().fg(Color::Yellow))
            .highlight_symbol("> ");
        frame.render_stateful_widget(list, columns[0], &mut list_state);

        let detail = visible.get(self.cursor).copied();
        draw_detail(frame, detail, columns[1]);
    }

    fn draw_status<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let connection = self.snapshot.connection;
        let connection_style = match connection {
            ConnectionState::Open => Style::default().fg(Color::Green),
            ConnectionState::Connecting => Style::default().fg(Color::Yellow),
            ConnectionState::Closed | ConnectionState::Error => Style::default().fg(Color::Red),
        };
        let connection_text = match connection {
            ConnectionState::Open => "live".to_string(),
            ConnectionState::Closed | ConnectionState::Error => "disconnected, retrying".to_string(),
            other => other.to_string(),
        };

        let mut spans = vec![
            Span::styled(format!("[{}]", connection_text), connection_style),
            Span::raw(format!(" unread {} ", self.snapshot.total_unread())),
        ];
        if self.filtering {
            spans.push(Span::styled(
                format!("filter: {}_ ", self.filter.value()),
                Style::default().fg(Color::Yellow),
            ));
        }
        spans.push(Span::styled(
            "| q quit | Enter open | / filter | ? help",
            Style::default().fg(Color::Gray),
        ));
        frame.render_widget(Paragraph::new(Line::from(spans)), area);
    }
}

fn draw_detail<B: Backend>(f: &mut Frame<B>, conversation: Option<&Conversation>, area: Rect) {
    let block = Block::default().title("Conversation").borders(Borders::ALL);
    let Some(c) = conversation else {
        f.render_widget(Paragraph::new("No conversations").block(block), area);
        return;
    };

    let when = c
        .parsed_timestamp()
        .map(|ts| ts.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| c.last_message_timestamp.clone());
    let direction = match c.last_direction {
        MessageDirection::Incoming => "received",
        MessageDirection::Outgoing => "sent",
    };

    let mut lines = vec![
        Line::from(Span::styled(c.display_name.clone(), Style::default().add_modifier(Modifier::BOLD))),
        Line::from(format!("+{}", c.phone)),
        Line::from(format!(
            "{} messages this session | {} unread",
            c.message_count, c.unread_count
        )),
        Line::from(format!("Last message {} {}", direction, when)),
        Line::from(""),
    ];

    let wrap_width = area.width.saturating_sub(2).max(1) as usize; // Account for borders
    lines.extend(
        wrap(&c.last_message_text, wrap_width)
            .into_iter()
            .map(|l| Line::from(l.into_owned())),
    );

    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_load_error<B: Backend>(f: &mut Frame<B>, reason: &str, area: Rect) {
    let text = vec![
        Line::from(Span::styled(
            "Could not load conversations",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from(reason.to_string()),
        Line::from(""),
        Line::from("Press r to retry, q to quit"),
    ];
    let error = Paragraph::new(text)
        .block(Block::default().title("Inbox").borders(Borders::ALL))
        .wrap(Wrap { trim: true });
    f.render_widget(error, area);
}

fn draw_help<B: Backend>(f: &mut Frame<B>, area: Rect) {
    let popup_width = 44.min(area.width.saturating_sub(4));
    let popup_height = 11.min(area.height.saturating_sub(2));
    let popup = Rect::new(
        area.x + (area.width.saturating_sub(popup_width)) / 2,
        area.y + (area.height.saturating_sub(popup_height)) / 2,
        popup_width,
        popup_height,
    );

    let help = vec![
        Line::from("Up/Down, j/k   move"),
        Line::from("Home/End       first/last"),
        Line::from("Enter          open conversation"),
        Line::from("/              filter by name or phone"),
        Line::from("r              retry a failed load"),
        Line::from("q, Esc         quit"),
        Line::from(""),
        Line::from(Span::styled("Press any key to close", Style::default().fg(Color::Gray))),
    ];

    f.render_widget(Clear, popup);
    f.render_widget(
        Paragraph::new(help).block(Block::default().title("Help").borders(Borders::ALL)),
        popup,
    );
}

pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

pub fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
