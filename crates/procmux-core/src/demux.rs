//! Chunk-to-line reassembly for one output stream.

/// Stateful splitter turning arbitrary byte chunks into complete text lines.
///
/// Pipes deliver whatever the kernel buffered, so a single read may carry
/// half a line, several lines, or a tail with no newline at all. One
/// `LineDemuxer` belongs to exactly one stream; feeding it chunks from two
/// streams would interleave their bytes.
///
/// Decoding is lossy UTF-8: invalid sequences become replacement characters
/// rather than errors. A `\r` immediately before the newline is stripped.
#[derive(Debug, Default)]
pub struct LineDemuxer {
    buf: Vec<u8>,
}

impl LineDemuxer {
    /// Creates an empty demuxer.
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Appends `bytes` and returns every newline-terminated line now
    /// complete. The unterminated tail is retained for the next feed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let Some(last_newline) = self.buf.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let tail = self.buf.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buf, tail);
        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(decode_line)
            .collect()
    }

    /// Takes the retained remainder, if any.
    ///
    /// Used at stream EOF so a final line without a trailing newline is
    /// never dropped.
    pub fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buf);
        Some(decode_line(&tail))
    }

    /// Number of bytes currently held back waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
