//! `Transfer-Encoding: chunked` decoding.
//!
//! Works on a buffer that may hold only part of the message: the decoder
//! reports `Ok(None)` until the terminating zero-size chunk and trailer
//! section have arrived.

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkError {
    /// Chunk size line is not valid hex
    InvalidSize,
    /// Chunk data not followed by CRLF
    MissingDelimiter,
    /// Decoded body exceeds the caller's limit
    TooLarge,
}

/// Decodes a chunked body from the start of `buf`.
///
/// Returns the decoded body and the number of bytes of `buf` consumed
/// (trailers included), or `None` if more input is needed.
pub fn decode(buf: &[u8], limit: usize) -> Result<Option<(Vec<u8>, usize)>, ChunkError> {
    Decoder::new().feed(buf, limit)
}

/// Resumable chunked decoder.
///
/// Remembers how far the buffer has been decoded, so a body arriving over
/// many reads is walked once. Every call must pass the same buffer, grown
/// at the end, starting at the first chunk-size line.
#[derive(Debug, Default)]
pub struct Decoder {
    pos: usize,
    body: Vec<u8>,
    in_trailers: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues decoding `buf`. Returns the body and the bytes consumed
    /// once the terminating chunk and trailer section are complete.
    pub fn feed(&mut self, buf: &[u8], limit: usize) -> Result<Option<(Vec<u8>, usize)>, ChunkError> {
        loop {
            if self.in_trailers {
                // Trailer fields end with an empty line.
                let Some(line_end) = find_crlf(&buf[self.pos..]) else {
                    return Ok(None);
                };
                self.pos += line_end + 2;
                if line_end == 0 {
                    return Ok(Some((std::mem::take(&mut self.body), self.pos)));
                }
                continue;
            }

            let Some(line_end) = find_crlf(&buf[self.pos..]) else {
                return Ok(None);
            };
            let size = parse_size(&buf[self.pos..self.pos + line_end])?;
            let data_start = self.pos + line_end + 2;

            if size == 0 {
                self.pos = data_start;
                self.in_trailers = true;
                continue;
            }

            if self.body.len().saturating_add(size) > limit {
                return Err(ChunkError::TooLarge);
            }
            if buf.len() < data_start + size + 2 {
                return Ok(None);
            }
            self.body.extend_from_slice(&buf[data_start..data_start + size]);
            if &buf[data_start + size..data_start + size + 2] != b"\r\n" {
                return Err(ChunkError::MissingDelimiter);
            }
            self.pos = data_start + size + 2;
        }
    }
}

fn parse_size(line: &[u8]) -> Result<usize, ChunkError> {
    let line = std::str::from_utf8(line).map_err(|_| ChunkError::InvalidSize)?;
    // Chunk extensions follow a ';'.
    let digits = line.split(';').next().unwrap_or("").trim();
    if digits.is_empty() {
        return Err(ChunkError::InvalidSize);
    }
    usize::from_str_radix(digits, 16).map_err(|_| ChunkError::InvalidSize)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_complete_body() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (body, used) = decode(raw, 1024).unwrap().unwrap();

        assert_eq!(body, b"Wikipedia");
        assert_eq!(used, raw.len());
    }

    #[test]
    fn waits_for_terminator() {
        assert_eq!(decode(b"4\r\nWiki\r\n", 1024), Ok(None));
        assert_eq!(decode(b"4\r\nWi", 1024), Ok(None));
        assert_eq!(decode(b"0\r\n", 1024), Ok(None));
    }

    #[test]
    fn skips_extensions_and_trailers() {
        let raw = b"3;name=x\r\nabc\r\n0\r\nX-Trailer: 1\r\n\r\nextra";
        let (body, used) = decode(raw, 1024).unwrap().unwrap();

        assert_eq!(body, b"abc");
        assert_eq!(&raw[used..], b"extra");
    }

    #[test]
    fn resumes_across_partial_buffers() {
        let raw = b"4\r\nWiki\r\n5;x=y\r\npedia\r\n0\r\nX-T: 1\r\n\r\nnext";

        for split in 0..raw.len() {
            let mut decoder = Decoder::new();
            let first = decoder.feed(&raw[..split], 1024).unwrap();
            let (body, used) = match first {
                Some(done) => done,
                None => decoder.feed(raw, 1024).unwrap().unwrap(),
            };

            assert_eq!(body, b"Wikipedia", "split at {split}");
            assert_eq!(&raw[used..], b"next", "split at {split}");
        }
    }

    #[test]
    fn limit_applies_across_feeds() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.feed(b"3\r\nabc\r\n", 5), Ok(None));
        assert_eq!(
            decoder.feed(b"3\r\nabc\r\n3\r\ndef\r\n", 5),
            Err(ChunkError::TooLarge)
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(decode(b"zz\r\n", 1024), Err(ChunkError::InvalidSize));
        assert_eq!(decode(b"3\r\nabcX\r\n", 1024), Err(ChunkError::MissingDelimiter));
        assert_eq!(decode(b"a\r\n0123456789\r\n0\r\n\r\n", 4), Err(ChunkError::TooLarge));
    }
}
