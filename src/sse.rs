/// Incremental decoder for a `text/event-stream` body.
///
/// Bytes are buffered until a blank line closes an event, so multi-byte
/// characters split across network chunks survive intact.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feeds one network chunk and returns the `data` payloads of every event
    /// it completed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some((end, delimiter_len)) = find_event_end(&self.buffer) {
            let raw_event: Vec<u8> = self.buffer.drain(..end + delimiter_len).collect();
            let raw_event = String::from_utf8_lossy(&raw_event[..end]);
            if let Some(data) = extract_sse_data(&raw_event) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flushes an event left unterminated at end of stream.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw_event = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        extract_sse_data(&raw_event)
    }
}

fn find_event_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|idx| (idx, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|idx| (idx, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
