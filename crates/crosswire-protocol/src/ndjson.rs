//! Incremental splitter for newline-delimited JSON upstream streams.
//!
//! Chunk boundaries do not align with frame boundaries; the parser buffers
//! partial lines across `push` calls and `finish` flushes whatever remains
//! when the stream closes.

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct NdjsonParser {
    buffer: String,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            // Some upstreams prefix frames with an SSE-style "data:" marker.
            let line = line
                .strip_prefix("data:")
                .map(|rest| rest.trim_start().to_string())
                .unwrap_or(line);

            if line.is_empty() {
                continue;
            }
            frames.push(line);
        }

        frames
    }

    pub fn finish(&mut self) -> Option<String> {
        let mut line = std::mem::take(&mut self.buffer);
        if line.ends_with('\r') {
            line.pop();
        }
        let line = line
            .strip_prefix("data:")
            .map(|rest| rest.trim_start().to_string())
            .unwrap_or(line);
        if line.is_empty() { None } else { Some(line) }
    }
}
