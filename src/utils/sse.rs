use bytes::BytesMut;

const MAX_BUFFER_BYTES: usize = 1024 * 1024;
const TAIL_BYTES: usize = 64 * 1024;

/// Incremental splitter turning raw SSE bytes into `data:` payloads.
///
/// The buffer is capped; an oversized event without a delimiter is cut down
/// to its tail so a misbehaving upstream cannot grow it unbounded.
#[derive(Debug, Default)]
pub struct SseDataBuffer {
    buffer: BytesMut,
}

impl SseDataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every complete event's data payload.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some((pos, delimiter_len)) = find_sse_delimiter(self.buffer.as_ref()) {
            let event_bytes = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            if let Some(data) = extract_sse_data(event_bytes.as_ref()) {
                out.push(data);
            }
        }

        if self.buffer.len() > MAX_BUFFER_BYTES {
            let keep_from = self.buffer.len().saturating_sub(TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
        out
    }

    /// Data of a trailing event the upstream closed without a blank line.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = self.buffer.split();
        extract_sse_data(rest.as_ref())
    }
}

fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < 2 {
        return None;
    }

    // Single forward scan so mixed newline styles split at the earliest boundary.
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len()
            && buf[idx] == b'\r'
            && buf[idx + 1] == b'\n'
            && buf[idx + 2] == b'\r'
            && buf[idx + 3] == b'\n'
        {
            return Some((idx, 4));
        }
        idx += 1;
    }

    None
}

fn extract_sse_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(rest);
    }
    (!out.is_empty()).then_some(out)
}

pub fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}
