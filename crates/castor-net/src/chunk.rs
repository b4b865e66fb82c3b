use bytes::{Buf, BytesMut};

use crate::NetError;

#[derive(Clone, Copy, Debug)]
enum ChunkState {
    /// Waiting for the hex size line.
    Size,
    /// Copying payload bytes of the current chunk.
    Data { remaining: usize },
    /// Waiting for the CRLF that closes a chunk.
    DataEnd,
    /// Last chunk seen, consuming trailer lines until the empty one.
    Trailer,
    Done,
}

/// Incremental decoder for HTTP/1.1 chunked transfer encoding.
///
/// Decodes whatever is available and leaves incomplete framing in the
/// raw buffer, so it can be fed from a non-blocking socket.
pub(crate) struct ChunkDecoder {
    state: ChunkState,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self { state: ChunkState::Size }
    }

    pub fn decode(&mut self, raw: &mut BytesMut, out: &mut BytesMut) -> Result<(), NetError> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = take_line(raw) else { return Ok(()) };
                    // chunk extensions after ';' are ignored
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| NetError::Chunk("invalid chunk size"))?;
                    self.state =
                        if size == 0 { ChunkState::Trailer } else { ChunkState::Data { remaining: size } };
                }
                ChunkState::Data { remaining } => {
                    if raw.is_empty() {
                        return Ok(());
                    }
                    let n = remaining.min(raw.len());
                    out.extend_from_slice(&raw[..n]);
                    raw.advance(n);
                    if n == remaining {
                        self.state = ChunkState::DataEnd;
                    } else {
                        self.state = ChunkState::Data { remaining: remaining - n };
                        return Ok(());
                    }
                }
                ChunkState::DataEnd => {
                    if raw.is_empty() {
                        return Ok(());
                    }
                    if raw[0] == b'\n' {
                        raw.advance(1);
                    } else if raw[0] == b'\r' {
                        if raw.len() < 2 {
                            return Ok(());
                        }
                        if raw[1] != b'\n' {
                            return Err(NetError::Chunk("missing chunk terminator"));
                        }
                        raw.advance(2);
                    } else {
                        return Err(NetError::Chunk("missing chunk terminator"));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(line) = take_line(raw) else { return Ok(()) };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(()),
            }
        }
    }
}

/// Splits one LF-terminated line off `raw`, stripping the CR LF.
fn take_line(raw: &mut BytesMut) -> Option<String> {
    let pos = raw.iter().position(|&b| b == b'\n')?;
    let mut line = raw.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        let end = line.len() - 1;
        line.truncate(end);
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(dec: &mut ChunkDecoder, input: &[u8]) -> Result<Vec<u8>, NetError> {
        let mut raw = BytesMut::from(input);
        let mut out = BytesMut::new();
        dec.decode(&mut raw, &mut out)?;
        Ok(out.to_vec())
    }

    #[test]
    fn single_chunk() {
        let mut dec = ChunkDecoder::new();
        let out = decode_all(&mut dec, b"5\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello");
        assert!(matches!(dec.state, ChunkState::Done));
    }

    #[test]
    fn multiple_chunks_and_extensions() {
        let mut dec = ChunkDecoder::new();
        let out = decode_all(&mut dec, b"3;ext=1\r\nfoo\r\n4\r\nbar\n\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"foobar\n");
    }

    #[test]
    fn split_across_feeds() {
        let mut dec = ChunkDecoder::new();
        let mut raw = BytesMut::new();
        let mut out = BytesMut::new();

        for piece in [&b"6\r"[..], b"\nab", b"cdef", b"\r\n0\r\n", b"\r\n"] {
            raw.extend_from_slice(piece);
            dec.decode(&mut raw, &mut out).unwrap();
        }
        assert_eq!(&out[..], b"abcdef");
        assert!(matches!(dec.state, ChunkState::Done));
    }

    #[test]
    fn trailer_headers_are_discarded() {
        let mut dec = ChunkDecoder::new();
        let out =
            decode_all(&mut dec, b"2\r\nhi\r\n0\r\nExpires: never\r\n\r\n").unwrap();
        assert_eq!(out, b"hi");
        assert!(matches!(dec.state, ChunkState::Done));
    }

    #[test]
    fn rejects_bad_size() {
        let mut dec = ChunkDecoder::new();
        assert!(decode_all(&mut dec, b"xyz\r\n").is_err());
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut dec = ChunkDecoder::new();
        assert!(decode_all(&mut dec, b"2\r\nhiXX").is_err());
    }
}
