//! Minimal Server-Sent Events parser for streaming completions.
//!
//! Only the `data:` field matters for chat-completion streams; event
//! types and ids are ignored. Feed raw response bytes, get back complete
//! data payloads, and watch for the `[DONE]` sentinel.

/// Incremental SSE data-line parser.
#[derive(Debug, Default)]
pub struct SseParser {
    line_buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of response bytes; returns completed data payloads.
    ///
    /// Multi-line `data:` fields within one event are joined with `\n`
    /// per the SSE spec. Comment lines and unknown fields are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(chunk);
        let mut payloads = Vec::new();

        for ch in text.chars() {
            if ch != '\n' {
                self.line_buffer.push(ch);
                continue;
            }
            let line = std::mem::take(&mut self.line_buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data_lines
                    .push(value.strip_prefix(' ').unwrap_or(value).to_owned());
            }
            // Comments (`:`) and other fields (`event:`, `id:`) are ignored.
        }

        payloads
    }

    /// Flush a trailing event that never saw its terminating blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines
                    .push(value.strip_prefix(' ').unwrap_or(value).to_owned());
            }
        }
        if self.data_lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.data_lines).join("\n"))
        }
    }
}

/// Whether a payload is the stream-end sentinel.
pub fn is_done(payload: &str) -> bool {
    payload.trim() == "[DONE]"
}
