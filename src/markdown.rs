//! Assistant replies as styled terminal lines, plus fenced snippet extraction.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Prose,
    Heading,
    Fence,
    Code,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanStyle {
    pub strong: bool,
    pub italic: bool,
    pub strike: bool,
    pub code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownSpan {
    pub text: String,
    pub style: SpanStyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownLine {
    pub kind: LineKind,
    pub spans: Vec<MarkdownSpan>,
}

impl MarkdownLine {
    pub fn text(&self) -> String {
        self.spans.iter().map(|span| span.text.as_str()).collect()
    }

    fn is_blank(&self) -> bool {
        self.kind == LineKind::Prose && self.spans.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub lang: Option<String>,
    pub body: String,
}

fn parser(text: &str) -> Parser<'_> {
    Parser::new_ext(text, Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS)
}

fn language(info: &str) -> Option<String> {
    info.split_whitespace()
        .next()
        .map(|lang| lang.to_ascii_lowercase())
}

/// Whether the source of a fenced block ends with a closing fence. The parser
/// closes an unterminated fence at the end of input, which is the normal state
/// of a reply still streaming in.
fn fence_closed(source: &str) -> bool {
    let strip = |line: &str| {
        line.trim_start_matches(|c: char| c == '>' || c.is_whitespace())
            .trim_end()
            .to_string()
    };
    let mut lines = source.trim_end().lines();
    let Some(opening) = lines.next().map(strip) else {
        return false;
    };
    let Some(marker) = opening.chars().next() else {
        return false;
    };
    let width = opening.chars().take_while(|&c| c == marker).count();

    lines.last().map(strip).is_some_and(|closing| {
        closing.chars().count() >= width && closing.chars().all(|c| c == marker)
    })
}

struct OpenCode {
    body: String,
    closed: bool,
}

#[derive(Default)]
struct LineBuilder {
    lines: Vec<MarkdownLine>,
    current: Vec<MarkdownSpan>,
    kind: Option<LineKind>,
    strong: u32,
    italic: u32,
    strike: u32,
    quotes: usize,
    lists: Vec<Option<u64>>,
    code: Option<OpenCode>,
}

impl LineBuilder {
    fn inline_style(&self) -> SpanStyle {
        SpanStyle {
            strong: self.strong > 0,
            italic: self.italic > 0,
            strike: self.strike > 0,
            code: false,
        }
    }

    fn push_span(&mut self, text: &str, style: SpanStyle) {
        if text.is_empty() {
            return;
        }
        if self.current.is_empty() && self.quotes > 0 {
            self.current.push(MarkdownSpan {
                text: "> ".repeat(self.quotes),
                style: SpanStyle::default(),
            });
        }
        match self.current.last_mut() {
            Some(last) if last.style == style => last.text.push_str(text),
            _ => self.current.push(MarkdownSpan {
                text: text.to_string(),
                style,
            }),
        }
    }

    fn push_text_lines(&mut self, text: &str, style: SpanStyle) {
        let mut pieces = text.split('\n').peekable();
        while let Some(piece) = pieces.next() {
            self.push_span(piece, style);
            if pieces.peek().is_some() {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        let kind = self.kind.take().unwrap_or(LineKind::Prose);
        if !self.current.is_empty() {
            let spans = std::mem::take(&mut self.current);
            self.lines.push(MarkdownLine { kind, spans });
        }
    }

    fn push_line(&mut self, kind: LineKind, text: &str) {
        self.flush();
        let spans = if text.is_empty() {
            Vec::new()
        } else {
            vec![MarkdownSpan {
                text: text.to_string(),
                style: SpanStyle::default(),
            }]
        };
        self.lines.push(MarkdownLine { kind, spans });
    }

    fn blank(&mut self) {
        self.flush();
        if self.lines.last().is_some_and(|line| !line.is_blank()) {
            self.lines.push(MarkdownLine {
                kind: LineKind::Prose,
                spans: Vec::new(),
            });
        }
    }

    fn start_item(&mut self) {
        self.flush();
        let indent = "  ".repeat(self.lists.len().saturating_sub(1));
        let marker = match self.lists.last_mut() {
            Some(Some(number)) => {
                let marker = format!("{}. ", number);
                *number += 1;
                marker
            }
            _ => "• ".to_string(),
        };
        self.push_span(&format!("{}{}", indent, marker), SpanStyle::default());
    }

    fn event(&mut self, event: Event<'_>, source: &str) {
        match event {
            Event::Start(Tag::Heading { .. }) => {
                self.flush();
                self.kind = Some(LineKind::Heading);
            }
            Event::End(TagEnd::Heading(_)) => self.blank(),
            Event::End(TagEnd::Paragraph) => {
                if self.lists.is_empty() {
                    self.blank();
                } else {
                    self.flush();
                }
            }
            Event::Start(Tag::BlockQuote(_)) => {
                self.flush();
                self.quotes += 1;
            }
            Event::End(TagEnd::BlockQuote(_)) => {
                self.flush();
                self.quotes = self.quotes.saturating_sub(1);
            }
            Event::Start(Tag::List(start)) => {
                self.flush();
                self.lists.push(start);
            }
            Event::End(TagEnd::List(_)) => {
                self.lists.pop();
                if self.lists.is_empty() {
                    self.blank();
                } else {
                    self.flush();
                }
            }
            Event::Start(Tag::Item) => self.start_item(),
            Event::End(TagEnd::Item) => self.flush(),
            Event::Start(Tag::Strong) => self.strong += 1,
            Event::End(TagEnd::Strong) => self.strong = self.strong.saturating_sub(1),
            Event::Start(Tag::Emphasis) => self.italic += 1,
            Event::End(TagEnd::Emphasis) => self.italic = self.italic.saturating_sub(1),
            Event::Start(Tag::Strikethrough) => self.strike += 1,
            Event::End(TagEnd::Strikethrough) => self.strike = self.strike.saturating_sub(1),
            Event::Start(Tag::CodeBlock(kind)) => {
                self.flush();
                let closed = match &kind {
                    CodeBlockKind::Fenced(info) => {
                        self.push_line(LineKind::Fence, &format!("```{}", info));
                        fence_closed(source)
                    }
                    CodeBlockKind::Indented => false,
                };
                self.code = Some(OpenCode {
                    body: String::new(),
                    closed,
                });
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some(code) = self.code.take() {
                    for line in code.body.lines() {
                        self.push_line(LineKind::Code, line);
                    }
                    if code.closed {
                        self.push_line(LineKind::Fence, "```");
                    }
                }
                self.blank();
            }
            Event::Text(text) => match self.code.as_mut() {
                Some(code) => code.body.push_str(&text),
                None => self.push_text_lines(&text, self.inline_style()),
            },
            Event::Code(text) => {
                let style = SpanStyle {
                    code: true,
                    ..self.inline_style()
                };
                self.push_span(&text, style);
            }
            Event::Html(html) => self.push_text_lines(&html, SpanStyle::default()),
            Event::InlineHtml(html) => self.push_span(&html, self.inline_style()),
            Event::SoftBreak | Event::HardBreak => self.flush(),
            Event::Rule => {
                self.push_line(LineKind::Fence, "───");
                self.blank();
            }
            Event::TaskListMarker(done) => {
                self.push_span(if done { "[x] " } else { "[ ] " }, SpanStyle::default());
            }
            _ => {}
        }
    }

    fn finish(mut self) -> Vec<MarkdownLine> {
        self.flush();
        while self.lines.last().is_some_and(MarkdownLine::is_blank) {
            self.lines.pop();
        }
        self.lines
    }
}

/// Lays `text` out as terminal lines with inline styling. An unclosed fence
/// (common mid-stream) marks the rest of the text as code.
pub fn classify_lines(text: &str) -> Vec<MarkdownLine> {
    let mut builder = LineBuilder::default();
    for (event, range) in parser(text).into_offset_iter() {
        builder.event(event, &text[range]);
    }
    builder.finish()
}

/// Closed fenced blocks of `text`, in order.
pub fn code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<(Option<String>, String)> = None;

    for (event, range) in parser(text).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                if fence_closed(&text[range]) {
                    open = Some((language(&info), String::new()));
                }
            }
            Event::Text(chunk) => {
                if let Some((_, body)) = open.as_mut() {
                    body.push_str(&chunk);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((lang, mut body)) = open.take() {
                    if body.ends_with('\n') {
                        body.pop();
                    }
                    blocks.push(CodeBlock { lang, body });
                }
            }
            _ => {}
        }
    }

    blocks
}

/// The snippet worth previewing: the last `html` block, else the last block.
pub fn preferred_snippet(text: &str) -> Option<String> {
    let blocks = code_blocks(text);
    blocks
        .iter()
        .rev()
        .find(|block| block.lang.as_deref() == Some("html"))
        .or_else(|| blocks.last())
        .map(|block| block.body.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "вот так:\n\n```css\nbody { margin: 0 }\n```\n\n```html\n<p>hi</p>\n<p>there</p>\n```\n\nи всё.";

    fn texts(text: &str) -> Vec<String> {
        classify_lines(text).iter().map(MarkdownLine::text).collect()
    }

    #[test]
    fn extracts_closed_blocks_with_language() {
        let blocks = code_blocks(REPLY);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].lang.as_deref(), Some("css"));
        assert_eq!(blocks[1].body, "<p>hi</p>\n<p>there</p>");
    }

    #[test]
    fn prefers_html_over_later_blocks() {
        let text = "```HTML\n<main></main>\n```\n```js\nconsole.log(1)\n```";
        assert_eq!(preferred_snippet(text).as_deref(), Some("<main></main>"));
    }

    #[test]
    fn falls_back_to_last_block() {
        let text = "```\nfirst\n```\n```rust\nfn main() {}\n```";
        assert_eq!(preferred_snippet(text).as_deref(), Some("fn main() {}"));
    }

    #[test]
    fn ignores_unclosed_fence() {
        let text = "```html\n<div>still streaming";
        assert!(code_blocks(text).is_empty());
        assert_eq!(preferred_snippet(text), None);
    }

    #[test]
    fn classifies_fences_and_code() {
        let kinds: Vec<LineKind> = classify_lines("intro\n```js\nlet a;\n```\noutro")
            .into_iter()
            .filter(|line| !line.is_blank())
            .map(|line| line.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                LineKind::Prose,
                LineKind::Fence,
                LineKind::Code,
                LineKind::Fence,
                LineKind::Prose
            ]
        );
    }

    #[test]
    fn unclosed_fence_turns_the_rest_into_code() {
        let lines = classify_lines("look:\n```html\n<div>\n  <p>half");
        let last = lines.last().unwrap();
        assert_eq!(last.kind, LineKind::Code);
        assert_eq!(last.text(), "  <p>half");
        assert_eq!(
            lines.iter().filter(|line| line.kind == LineKind::Fence).count(),
            1
        );
    }

    #[test]
    fn inline_code_and_emphasis_get_their_own_spans() {
        let lines = classify_lines("use `let` and **bold** *it*");
        assert_eq!(lines.len(), 1);
        let spans = &lines[0].spans;

        let code = spans.iter().find(|span| span.text == "let").unwrap();
        assert!(code.style.code);
        let bold = spans.iter().find(|span| span.text == "bold").unwrap();
        assert!(bold.style.strong && !bold.style.code);
        let italic = spans.iter().find(|span| span.text == "it").unwrap();
        assert!(italic.style.italic);
        assert_eq!(lines[0].text(), "use let and bold it");
    }

    #[test]
    fn lists_get_markers() {
        assert_eq!(
            texts("- one\n- two\n\n1. first\n2. second"),
            vec!["• one", "• two", "", "1. first", "2. second"]
        );
    }

    #[test]
    fn headings_are_marked() {
        let lines = classify_lines("# Title\n\nbody");
        assert_eq!(lines[0].kind, LineKind::Heading);
        assert_eq!(lines[0].text(), "Title");
        assert_eq!(lines.last().unwrap().text(), "body");
    }
}
