use bytes::Bytes;

/// Terminal sentinel of OpenAI-style streams.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Frame the caller receives at the end of every relayed stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

/// Wraps one payload as a `data:` frame. Multi-line payloads get one `data:`
/// line each so the frame stays a single SSE event.
pub fn encode_data_frame(data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 8);
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Incremental SSE decoder.
///
/// Bytes may arrive split anywhere, including inside a multi-byte UTF-8
/// sequence; incomplete tails are held until the next chunk.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let valid_up_to = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => {
                // Not a split sequence: the stream is corrupt, keep what decodes.
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                return self.push_str(&text);
            }
        };
        let rest = self.pending.split_off(valid_up_to);
        let head = std::mem::replace(&mut self.pending, rest);
        match String::from_utf8(head) {
            Ok(text) => self.push_str(&text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }
            self.apply_line(&line);
        }

        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.buffer.push_str(&tail);
        }
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.apply_line(&line);
        }
        self.finish_event(&mut events);
        events
    }

    fn apply_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            return;
        }
        if line == "event" {
            self.event = None;
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
            return;
        }
        if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_and_data_only_events() {
        let mut parser = SseParser::new();
        let events = parser.push_str(
            "event: message_start\ndata: {\"a\":1}\n\n: keepalive\ndata: [DONE]\n\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn holds_split_lines_and_utf8_sequences() {
        let mut parser = SseParser::new();
        let frame = "data: {\"text\":\"héllo\"}\n\n".as_bytes();
        // Split inside the two-byte 'é'.
        let split = frame.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(
            parser
                .push_bytes(&Bytes::copy_from_slice(&frame[..split]))
                .is_empty()
        );
        let events = parser.push_bytes(&Bytes::copy_from_slice(&frame[split..]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"text\":\"héllo\"}");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: {\"x\":1}").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn multi_line_payload_round_trips_as_one_event() {
        let frame = encode_data_frame("line one\nline two");
        assert_eq!(frame, "data: line one\ndata: line two\n\n");
        let mut parser = SseParser::new();
        let events = parser.push_str(&frame);
        assert_eq!(events[0].data, "line one\nline two");
    }
}
