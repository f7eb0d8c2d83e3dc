use super::{ChunkError, Chunks};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Chunks(ChunkError),
    InvalidPayload,
}

/// Reads the `data` payloads of server-sent events from a chunk stream.
///
/// Bytes are buffered until a whole event has arrived, so multi-byte
/// characters split across network chunks decode correctly.
pub struct Sse {
    buf: Vec<u8>,
    // Bytes before this offset are known to hold no event boundary.
    scan_from: usize,
    chunks: Chunks,
    eof: bool,
}

impl Sse {
    #[inline]
    pub fn new(chunks: Chunks) -> Self {
        Self {
            buf: Vec::new(),
            scan_from: 0,
            chunks,
            eof: false,
        }
    }

    /// Returns the data of the next event, or `None` once the stream ends.
    ///
    /// An unterminated event at the end of the stream is dropped.
    pub async fn next_event(&mut self) -> Result<Option<String>, Error> {
        loop {
            if let Some(data) = self.try_parse_event()? {
                return Ok(Some(data));
            }
            if self.eof {
                return Ok(None);
            }
            match self.chunks.next_chunk().await.map_err(Error::Chunks)? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => self.eof = true,
            }
        }
    }

    fn try_parse_event(&mut self) -> Result<Option<String>, Error> {
        // event       = *( comment / field ) end-of-line
        // field       = 1*name-char [ colon [ space ] *any-char ] end-of-line
        // end-of-line = ( cr lf / lf )
        loop {
            let Some((end, sep_len)) =
                find_event_boundary(&self.buf, self.scan_from)
            else {
                // A separator is at most 4 bytes, so only its first 3 can
                // already be buffered.
                self.scan_from = self.buf.len().saturating_sub(3);
                return Ok(None);
            };
            self.scan_from = 0;
            let raw: Vec<u8> = self.buf.drain(..end + sep_len).take(end).collect();
            let block =
                String::from_utf8(raw).map_err(|_| Error::InvalidPayload)?;

            let mut data_lines = Vec::new();
            for line in block.lines() {
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let (field, value) = match line.split_once(':') {
                    Some((field, value)) => {
                        (field, value.strip_prefix(' ').unwrap_or(value))
                    }
                    None => (line, ""),
                };
                // `event`, `id` and `retry` carry nothing we use.
                if field == "data" {
                    data_lines.push(value);
                }
            }

            if !data_lines.is_empty() {
                return Ok(Some(data_lines.join("\n")));
            }
        }
    }
}

/// Finds the first blank line at or after `from`, returning its offset and
/// length.
fn find_event_boundary(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    const SEPARATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\r\n", b"\n\n"];
    (from..buf.len()).find_map(|idx| {
        SEPARATORS
            .iter()
            .find(|sep| buf[idx..].starts_with(sep))
            .map(|sep| (idx, sep.len()))
    })
}
