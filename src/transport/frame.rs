//! Line-oriented event framing.
//!
//! A frame is an optional `event: <name>` line, one or more `data: <text>`
//! lines, and a terminating blank line. The decoder accepts bytes split at
//! arbitrary boundaries (including inside a UTF-8 sequence) and only yields
//! frames once their blank line has arrived.

/// One decoded frame.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Frame {
    /// Event name, if an `event:` line was present.
    pub event: Option<String>,
    /// Data lines joined with `\n`.
    pub data: String,
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        // Held bytes never contain a line terminator.
        let mut cursor = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut line_start = 0;
        while let Some(offset) = self.buffer[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            let raw = &self.buffer[line_start..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let line = String::from_utf8_lossy(raw).into_owned();
            if let Some(frame) = self.accept_line(&line) {
                frames.push(frame);
            }
            line_start = end + 1;
            cursor = line_start;
        }
        self.buffer.drain(..line_start);
        frames
    }

    /// Flush a trailing frame when the byte stream ends without a blank line.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.accept_line(line) {
                return Some(frame);
            }
        }
        self.take_frame()
    }

    fn accept_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.take_frame();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn take_frame(&mut self) -> Option<Frame> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let frame = Frame {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_split_across_reads_is_held() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: st").is_empty());
        assert!(decoder.push(b"art\ndata: {\"a\"").is_empty());
        assert!(decoder.push(b":1}\n").is_empty());

        let frames = decoder.push(b"\n");
        assert_eq!(
            frames,
            vec![Frame {
                event: Some("start".to_string()),
                data: "{\"a\":1}".to_string(),
            }]
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let bytes = "event: delta\ndata: héllo ✓\n\n".as_bytes();
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in bytes {
            frames.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "héllo ✓");
    }

    #[test]
    fn test_several_frames_in_one_read_and_crlf() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b": keep-alive\r\n\r\ndata: one\r\n\r\nevent: e\r\ndata: two\r\n\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].data, "one");
        assert_eq!(frames[1].event.as_deref(), Some("e"));
        assert_eq!(frames[1].data, "two");
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        let frame = decoder.finish().unwrap();
        assert_eq!(frame.data, "[DONE]");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_many_frames_in_one_large_read() {
        let wire = "data: chunk\n\n".repeat(10_000);
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(wire.as_bytes());
        assert_eq!(frames.len(), 10_000);
        assert!(frames.iter().all(|frame| frame.data == "chunk"));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_partial_line_is_kept_after_complete_ones() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"data: one\n\ndata: tw");
        assert_eq!(frames.len(), 1);
        let frames = decoder.push(b"o\n\n");
        assert_eq!(frames[0].data, "two");
    }
}
