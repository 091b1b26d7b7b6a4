/// Newline-delimited framing for the upstream Stratum byte stream
///
/// TCP gives us arbitrary chunk boundaries; a single read may carry a
/// partial frame, one frame, or several. The framer buffers the trailing
/// partial line across chunks and hands back only complete lines.

use bytes::BytesMut;

pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Feed one chunk; returns every line the chunk completes, in order.
    /// A trailing CR (CRLF endings) is stripped from each line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let mut end = raw.len() - 1;
            if end > 0 && raw[end - 1] == b'\r' {
                end -= 1;
            }
            lines.push(String::from_utf8_lossy(&raw[..end]).into_owned());
        }
        lines
    }

    /// Discard buffered input. Called on disconnect so bytes from one
    /// connection can never complete a line on the next.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
