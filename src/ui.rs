use crate::chat::{ChatController, ChatEvent};
use crate::conversation::{Role, Turn, TurnId, TurnStatus};
use crate::editor::TextBuffer;
use crate::markdown::{classify_lines, preferred_snippet, LineKind, SpanStyle};
use crate::preview::{render_document, PreviewHandle};
use crossterm::event::{
    self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use std::io;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;
type UiResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const INPUT_HEIGHT: u16 = 5;
const STREAM_CURSOR: &str = "▍";
const EDITOR_PLACEHOLDER: &str = "// начни творить здесь...";
const INPUT_PLACEHOLDER: &str = "спроси что-нибудь...";
const EMPTY_REPLY: &str = "(пустой ответ)";

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Self {
        Self
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), DisableBracketedPaste, LeaveAlternateScreen);
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Editor,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewMode {
    Code,
    Preview,
}

fn span_style(kind: LineKind, inline: SpanStyle) -> Style {
    let mut style = match kind {
        LineKind::Prose => Style::default().fg(Color::Yellow),
        LineKind::Heading => Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
        LineKind::Fence => Style::default().fg(Color::DarkGray),
        LineKind::Code => Style::default().fg(Color::Gray),
    };
    if inline.code {
        style = style.fg(Color::Cyan);
    }
    if inline.strong {
        style = style.add_modifier(Modifier::BOLD);
    }
    if inline.italic {
        style = style.add_modifier(Modifier::ITALIC);
    }
    if inline.strike {
        style = style.add_modifier(Modifier::CROSSED_OUT);
    }
    style
}

fn turn_lines(turn: &Turn) -> Vec<Line<'static>> {
    match turn.role() {
        Role::User => {
            let header_style = Style::default()
                .fg(Color::Blue)
                .add_modifier(Modifier::BOLD);
            let body_style = Style::default().fg(Color::Blue);
            let mut lines = vec![Line::styled("you:", header_style)];
            for line in turn.content().lines() {
                lines.push(Line::styled(format!("  {}", line), body_style));
            }
            lines
        }
        Role::Assistant => {
            let header_style = Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD);
            let mut lines = vec![Line::styled("кодъ:", header_style)];

            if turn.content().is_empty() {
                if turn.status() == TurnStatus::Complete {
                    lines.push(Line::styled(
                        format!("  {}", EMPTY_REPLY),
                        Style::default()
                            .fg(Color::DarkGray)
                            .add_modifier(Modifier::ITALIC),
                    ));
                }
            } else {
                for line in classify_lines(turn.content()) {
                    let gutter = match line.kind {
                        LineKind::Code => Span::styled("  │ ", Style::default().fg(Color::DarkGray)),
                        _ => Span::raw("  "),
                    };
                    let mut spans = vec![gutter];
                    spans.extend(line.spans.into_iter().map(|span| {
                        Span::styled(span.text, span_style(line.kind, span.style))
                    }));
                    lines.push(Line::from(spans));
                }
            }

            if turn.status() == TurnStatus::Failed {
                if let Some(last) = lines.last_mut() {
                    for span in last.spans.iter_mut() {
                        span.style = span.style.fg(Color::Red);
                    }
                }
            }

            if turn.is_streaming() {
                if lines.len() > 1 {
                    if let Some(last) = lines.last_mut() {
                        last.spans.push(Span::raw(STREAM_CURSOR));
                    }
                } else {
                    lines.push(Line::styled(
                        format!("  {}", STREAM_CURSOR),
                        Style::default().fg(Color::White),
                    ));
                }
            }
            lines
        }
    }
}

pub struct App {
    chat: ChatController,
    editor: TextBuffer,
    input: TextBuffer,
    focus: Focus,
    view: ViewMode,
    sidebar_open: bool,
    // Lines scrolled up from the bottom of the chat; zero follows new output.
    scroll_back: u16,
    notice: Option<String>,
    should_quit: bool,
    running: Option<(TurnId, JoinHandle<()>)>,
    sender: mpsc::UnboundedSender<ChatEvent>,
    receiver: mpsc::UnboundedReceiver<ChatEvent>,
    preview: PreviewHandle,
}

impl App {
    pub fn new(chat: ChatController, preview: PreviewHandle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            chat,
            editor: TextBuffer::new(),
            input: TextBuffer::new(),
            focus: Focus::Chat,
            view: ViewMode::Code,
            sidebar_open: true,
            scroll_back: 0,
            notice: None,
            should_quit: false,
            running: None,
            sender,
            receiver,
            preview,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let [header, main] =
            Layout::vertical([Constraint::Length(1), Constraint::Min(3)]).areas(f.area());
        self.draw_header(f, header);

        if self.sidebar_open {
            let [work, sidebar] =
                Layout::horizontal([Constraint::Percentage(60), Constraint::Percentage(40)])
                    .areas(main);
            self.draw_workspace(f, work);
            self.draw_chat(f, sidebar);
        } else {
            self.draw_workspace(f, main);
        }
    }

    fn draw_header(&self, f: &mut Frame, area: Rect) {
        let dim = Style::default().fg(Color::DarkGray);
        let mut spans = vec![
            Span::styled(
                " кодъ ",
                Style::default()
                    .fg(Color::White)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!(" {} ", self.chat.model()), dim),
        ];
        if let Some(url) = self.preview.url() {
            spans.push(Span::styled(format!(" preview: {} ", url), dim));
        }
        if let Some(notice) = &self.notice {
            spans.push(Span::styled(
                format!(" {} ", notice),
                Style::default().fg(Color::Cyan),
            ));
        }
        f.render_widget(Paragraph::new(Line::from(spans)), area);
    }

    fn view_tabs(&self) -> Line<'static> {
        let active = Style::default()
            .fg(Color::Black)
            .bg(Color::White)
            .add_modifier(Modifier::BOLD);
        let idle = Style::default().fg(Color::Gray);
        let (code, preview) = match self.view {
            ViewMode::Code => (active, idle),
            ViewMode::Preview => (idle, active),
        };
        Line::from(vec![
            Span::raw(" "),
            Span::styled(" code ", code),
            Span::raw(" "),
            Span::styled(" preview ", preview),
            Span::raw(" "),
        ])
    }

    fn border_style(&self, focus: Focus) -> Style {
        if self.focus == focus {
            Style::default().fg(Color::Gray)
        } else {
            Style::default().fg(Color::DarkGray)
        }
    }

    fn draw_workspace(&self, f: &mut Frame, area: Rect) {
        let block = Block::default()
            .borders(Borders::ALL)
            .title(self.view_tabs())
            .border_style(self.border_style(Focus::Editor));

        match self.view {
            ViewMode::Code => {
                let block = block.title_bottom(
                    Line::from(format!(" {} chars ", self.editor.char_count())).right_aligned(),
                );
                let inner = block.inner(area);
                let (cursor_x, cursor_y) = self.editor.cursor();
                let scroll_y = (cursor_y as u16).saturating_sub(inner.height.saturating_sub(1));
                let scroll_x = (cursor_x as u16).saturating_sub(inner.width.saturating_sub(1));

                let paragraph = Paragraph::new(self.editor.render(EDITOR_PLACEHOLDER))
                    .block(block)
                    .scroll((scroll_y, scroll_x));
                f.render_widget(paragraph, area);

                if self.focus == Focus::Editor {
                    f.set_cursor_position((
                        inner.x + cursor_x as u16 - scroll_x,
                        inner.y + cursor_y as u16 - scroll_y,
                    ));
                }
            }
            ViewMode::Preview => {
                let location = self
                    .preview
                    .url()
                    .unwrap_or_else(|| "preview server off".to_string());
                let block = block.title_bottom(Line::from(format!(" {} ", location)).right_aligned());
                let code = self.editor.text();
                let document = render_document(&code);
                let paragraph = Paragraph::new(Text::styled(
                    document.into_owned(),
                    Style::default().fg(Color::Gray),
                ))
                .block(block)
                .wrap(Wrap { trim: false });
                f.render_widget(paragraph, area);
            }
        }
    }

    fn draw_chat(&self, f: &mut Frame, area: Rect) {
        let [messages_area, input_area] =
            Layout::vertical([Constraint::Min(3), Constraint::Length(INPUT_HEIGHT)]).areas(area);

        let streaming = self.chat.is_streaming();
        let title = if streaming {
            " помощникъ ● "
        } else {
            " помощникъ "
        };
        let block = Block::default()
            .borders(Borders::ALL)
            .title(title)
            .border_style(self.border_style(Focus::Chat));
        let inner = block.inner(messages_area);

        let mut lines = Vec::new();
        for turn in self.chat.conversation().turns() {
            lines.extend(turn_lines(turn));
            lines.push(Line::default());
        }
        let messages = Paragraph::new(Text::from(lines)).wrap(Wrap { trim: false });
        // Word wrapping can take more rows than chars / width.
        let total = messages.line_count(inner.width).min(u16::MAX as usize) as u16;
        let max_scroll = total.saturating_sub(inner.height);
        let offset = max_scroll.saturating_sub(self.scroll_back);

        let messages = messages.block(block).scroll((offset, 0));
        f.render_widget(messages, messages_area);

        let input_title = if streaming {
            " Esc to stop "
        } else {
            " Enter to send · Tab to switch · Esc to quit "
        };
        let input_block = Block::default()
            .borders(Borders::ALL)
            .title(input_title)
            .border_style(self.border_style(Focus::Chat));
        let input_inner = input_block.inner(input_area);
        let input = Paragraph::new(self.input.render(INPUT_PLACEHOLDER))
            .block(input_block)
            .wrap(Wrap { trim: false });
        f.render_widget(input, input_area);

        if self.focus == Focus::Chat {
            let (cursor_x, cursor_y) = self.input.cursor();
            let x = (input_inner.x + cursor_x as u16)
                .min(input_inner.x + input_inner.width.saturating_sub(1));
            let y = (input_inner.y + cursor_y as u16)
                .min(input_inner.y + input_inner.height.saturating_sub(1));
            f.set_cursor_position((x, y));
        }
    }

    fn submit_input(&mut self) {
        let Some(job) = self.chat.submit(&self.input.text()) else {
            return;
        };
        self.input.clear();
        self.scroll_back = 0;
        self.notice = None;

        let sender = self.sender.clone();
        let turn = job.turn();
        tracing::debug!(%turn, "spawning send");
        self.running = Some((turn, tokio::spawn(job.run(sender))));
    }

    /// Loads the newest previewable snippet from the assistant into the editor.
    fn apply_snippet(&mut self) -> bool {
        let snippet = self
            .chat
            .conversation()
            .turns()
            .iter()
            .rev()
            .filter(|turn| turn.role() == Role::Assistant && !turn.is_streaming())
            .find_map(|turn| preferred_snippet(turn.content()));

        match snippet {
            Some(snippet) => {
                self.editor.set_text(&snippet);
                self.editor_changed();
                self.notice = Some("snippet applied".to_string());
                true
            }
            None => {
                self.notice = Some("no snippet yet".to_string());
                false
            }
        }
    }

    fn editor_changed(&self) {
        self.preview.publish(&self.editor.text());
    }

    fn drain_chat_events(&mut self) {
        // Checked before draining: a task that has ended already queued its
        // last event.
        let ended = self
            .running
            .as_ref()
            .is_some_and(|(_, handle)| handle.is_finished());

        while let Ok(event) = self.receiver.try_recv() {
            if let ChatEvent::Finished { result: Err(err), .. } = &event {
                self.notice = Some(err.to_string());
            }
            self.chat.apply(event);
        }

        if ended {
            if let Some((turn, _)) = self.running.take() {
                if self.chat.abandon(turn) {
                    self.notice = Some("reply task ended unexpectedly".to_string());
                }
            }
        }
    }

    fn handle_events(&mut self) -> UiResult<bool> {
        self.drain_chat_events();

        if event::poll(Duration::from_millis(50))? {
            match event::read()? {
                Event::Key(key) if key.kind != KeyEventKind::Release => self.handle_key(key),
                Event::Paste(text) => match self.focus {
                    Focus::Editor => {
                        self.editor.insert_str(&text);
                        self.editor_changed();
                    }
                    Focus::Chat => self.input.insert_str(&text),
                },
                _ => {}
            }
        }

        Ok(!self.should_quit)
    }

    fn handle_key(&mut self, key: KeyEvent) {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);

        match key.code {
            KeyCode::Char('c') if ctrl => {
                self.chat.cancel();
                self.should_quit = true;
                return;
            }
            KeyCode::Esc => {
                if self.chat.cancel() {
                    self.notice = Some("stopping...".to_string());
                } else {
                    self.should_quit = true;
                }
                return;
            }
            KeyCode::Char('b') if ctrl => {
                self.sidebar_open = !self.sidebar_open;
                self.focus = if self.sidebar_open {
                    Focus::Chat
                } else {
                    Focus::Editor
                };
                return;
            }
            KeyCode::Char('y') if ctrl => {
                self.apply_snippet();
                return;
            }
            KeyCode::F(2) => {
                self.view = match self.view {
                    ViewMode::Code => ViewMode::Preview,
                    ViewMode::Preview => ViewMode::Code,
                };
                return;
            }
            KeyCode::Tab | KeyCode::BackTab => {
                if self.sidebar_open {
                    self.focus = match self.focus {
                        Focus::Editor => Focus::Chat,
                        Focus::Chat => Focus::Editor,
                    };
                }
                return;
            }
            KeyCode::PageUp => {
                self.scroll_back = self.scroll_back.saturating_add(5);
                return;
            }
            KeyCode::PageDown => {
                self.scroll_back = self.scroll_back.saturating_sub(5);
                return;
            }
            _ => {}
        }

        if ctrl {
            return;
        }

        match self.focus {
            Focus::Chat => self.handle_chat_key(key),
            Focus::Editor => {
                if self.view == ViewMode::Code && edit_buffer(&mut self.editor, key) {
                    self.editor_changed();
                }
            }
        }
    }

    fn handle_chat_key(&mut self, key: KeyEvent) {
        if key.code == KeyCode::Enter
            && !key
                .modifiers
                .intersects(KeyModifiers::SHIFT | KeyModifiers::ALT)
        {
            self.submit_input();
        } else {
            edit_buffer(&mut self.input, key);
        }
    }
}

/// Applies an editing key to `buffer`; returns whether the text changed.
fn edit_buffer(buffer: &mut TextBuffer, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Enter => buffer.new_line(),
        KeyCode::Char(c) => buffer.insert_char(c),
        KeyCode::Backspace => buffer.delete_char(),
        KeyCode::Left => {
            buffer.move_left();
            return false;
        }
        KeyCode::Right => {
            buffer.move_right();
            return false;
        }
        KeyCode::Up => {
            buffer.move_up();
            return false;
        }
        KeyCode::Down => {
            buffer.move_down();
            return false;
        }
        KeyCode::Home => {
            buffer.move_home();
            return false;
        }
        KeyCode::End => {
            buffer.move_end();
            return false;
        }
        _ => return false,
    }
    true
}

pub fn run_tui(chat: ChatController, preview: PreviewHandle) -> UiResult<()> {
    enable_raw_mode()?;
    let _guard = TerminalGuard::new();

    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableBracketedPaste)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal: TuiTerminal = Terminal::new(backend)?;
    terminal.clear()?;

    let mut app = App::new(chat, preview);

    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events()? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}
