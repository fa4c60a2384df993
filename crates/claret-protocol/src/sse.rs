use bytes::Bytes;

/// One server-sent event: optional event name plus joined data lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Feed it chunks as they arrive; complete events
/// come back as soon as their terminating blank line is seen. Bytes that are
/// not valid UTF-8 are dropped rather than aborting the stream.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(line) = self.take_line() {
            if line.is_empty() {
                self.flush_into(&mut out);
            } else {
                self.feed_line(&line);
            }
        }
        out
    }

    /// Drain whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            self.feed_line(tail.trim_end_matches('\r'));
        }
        self.flush_into(&mut out);
        out
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buffer.find('\n')?;
        let mut line: String = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    fn feed_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_into(&mut self, out: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data.is_empty() {
            return;
        }
        out.push(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        });
    }
}
