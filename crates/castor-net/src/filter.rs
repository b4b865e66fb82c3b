use bytes::{Bytes, BytesMut};

use crate::{NetError, chunk::ChunkDecoder};

/// Inbound byte buffer feeding the session one line (or one raw run)
/// at a time, with transparent chunked-transfer decoding once armed.
pub(crate) struct InputFilter {
    raw: BytesMut,
    decoded: BytesMut,
    chunking: Option<ChunkDecoder>,
}

impl InputFilter {
    pub fn new() -> Self {
        Self { raw: BytesMut::new(), decoded: BytesMut::new(), chunking: None }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<(), NetError> {
        self.raw.extend_from_slice(data);
        self.run()
    }

    /// Arms chunked decoding. Body bytes that arrived with the headers
    /// have already passed the plain path; they are rerouted through
    /// the decoder before anything newer.
    pub fn set_chunked(&mut self) -> Result<(), NetError> {
        if self.chunking.is_none() {
            self.chunking = Some(ChunkDecoder::new());
            if !self.decoded.is_empty() {
                let mut framed = self.decoded.split();
                framed.extend_from_slice(&self.raw);
                self.raw = framed;
            }
        }
        self.run()
    }

    fn run(&mut self) -> Result<(), NetError> {
        match &mut self.chunking {
            Some(dec) => dec.decode(&mut self.raw, &mut self.decoded),
            None => {
                if !self.raw.is_empty() {
                    self.decoded.extend_from_slice(&self.raw);
                    self.raw.clear();
                }
                Ok(())
            }
        }
    }

    /// Next complete line, CR LF (or bare LF) stripped.
    pub fn read_line(&mut self) -> Option<String> {
        let pos = self.decoded.iter().position(|&b| b == b'\n')?;
        let mut line = self.decoded.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            let end = line.len() - 1;
            line.truncate(end);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Drains everything decoded so far.
    pub fn take(&mut self) -> Bytes {
        self.decoded.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.decoded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_crlf_and_lf_lines() {
        let mut f = InputFilter::new();
        f.feed(b"one\r\ntwo\nthr").unwrap();
        assert_eq!(f.read_line().as_deref(), Some("one"));
        assert_eq!(f.read_line().as_deref(), Some("two"));
        assert_eq!(f.read_line(), None);
        f.feed(b"ee\r\n").unwrap();
        assert_eq!(f.read_line().as_deref(), Some("three"));
    }

    #[test]
    fn chunked_body_decodes_before_the_line_reader() {
        let mut f = InputFilter::new();
        f.set_chunked().unwrap();
        f.feed(b"4\r\nSTR;\r\n10\r\nENDSOURCETABLE\r\n\r\n0\r\n\r\n").unwrap();
        assert_eq!(f.read_line().as_deref(), Some("STR;ENDSOURCETABLE"));
        assert_eq!(f.read_line(), None);
    }

    #[test]
    fn arming_chunked_reroutes_buffered_body_bytes() {
        // headers and the start of the chunked body land in one segment
        let mut f = InputFilter::new();
        f.feed(b"Transfer-Encoding: chunked\r\n\r\n6\r\nhello\n\r\n0\r\n\r\n").unwrap();
        assert_eq!(f.read_line().as_deref(), Some("Transfer-Encoding: chunked"));
        assert_eq!(f.read_line().as_deref(), Some(""));

        f.set_chunked().unwrap();
        assert_eq!(f.read_line().as_deref(), Some("hello"));
        assert_eq!(f.read_line(), None);
        assert_eq!(f.len(), 0);
    }

    #[test]
    fn take_drains_decoded() {
        let mut f = InputFilter::new();
        f.feed(b"abc").unwrap();
        assert_eq!(f.len(), 3);
        assert_eq!(&f.take()[..], b"abc");
        assert_eq!(f.len(), 0);
    }
}
