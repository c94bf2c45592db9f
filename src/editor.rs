use ratatui::style::{Color, Style};
use ratatui::text::{Line, Span, Text};

/// Multi-line text with a cursor. Columns count characters, not bytes.
#[derive(Debug, Clone)]
pub struct TextBuffer {
    lines: Vec<String>,
    cursor_x: usize,
    cursor_y: usize,
}

fn byte_index(line: &str, column: usize) -> usize {
    line.char_indices()
        .nth(column)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len())
}

fn char_len(line: &str) -> usize {
    line.chars().count()
}

impl TextBuffer {
    pub fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.cursor_x, self.cursor_y)
    }

    pub fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    /// Replaces the whole text and parks the cursor at its end.
    pub fn set_text(&mut self, text: &str) {
        self.lines = text.split('\n').map(str::to_string).collect();
        self.cursor_y = self.lines.len() - 1;
        self.cursor_x = char_len(&self.lines[self.cursor_y]);
    }

    pub fn insert_char(&mut self, c: char) {
        if c == '\n' {
            self.new_line();
            return;
        }
        let line = &mut self.lines[self.cursor_y];
        let idx = byte_index(line, self.cursor_x);
        line.insert(idx, c);
        self.cursor_x += 1;
    }

    pub fn insert_str(&mut self, text: &str) {
        for c in text.replace("\r\n", "\n").chars() {
            match c {
                '\r' => self.new_line(),
                '\t' => {
                    for _ in 0..4 {
                        self.insert_char(' ');
                    }
                }
                c => self.insert_char(c),
            }
        }
    }

    pub fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            let line = &mut self.lines[self.cursor_y];
            let idx = byte_index(line, self.cursor_x - 1);
            line.remove(idx);
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            let prev_line = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = char_len(&self.lines[self.cursor_y]);
            self.lines[self.cursor_y].push_str(&prev_line);
        }
    }

    pub fn new_line(&mut self) {
        let line = &mut self.lines[self.cursor_y];
        let idx = byte_index(line, self.cursor_x);
        let remaining = line.split_off(idx);
        self.lines.insert(self.cursor_y + 1, remaining);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    pub fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = char_len(&self.lines[self.cursor_y]);
        }
    }

    pub fn move_right(&mut self) {
        let line_len = char_len(&self.lines[self.cursor_y]);
        if self.cursor_x < line_len {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    pub fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(char_len(&self.lines[self.cursor_y]));
        }
    }

    pub fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(char_len(&self.lines[self.cursor_y]));
        }
    }

    pub fn move_home(&mut self) {
        self.cursor_x = 0;
    }

    pub fn move_end(&mut self) {
        self.cursor_x = char_len(&self.lines[self.cursor_y]);
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn char_count(&self) -> usize {
        self.lines.iter().map(|line| char_len(line)).sum::<usize>() + self.lines.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    pub fn render(&self, placeholder: &str) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                placeholder.to_string(),
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

impl Default for TextBuffer {
    fn default() -> Self {
        Self::new()
    }
}
