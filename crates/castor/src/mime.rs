use std::borrow::Cow;

use bytes::Bytes;

/// A unit of outbound payload with its content type.
///
/// The payload is refcounted, so handing it to the transport never
/// copies and the bytes are released exactly once.
#[derive(Debug, Clone)]
pub struct MimeItem {
    data: Bytes,
    mime_type: Cow<'static, str>,
}

impl MimeItem {
    pub fn new(data: impl Into<Bytes>, mime_type: impl Into<Cow<'static, str>>) -> Self {
        Self { data: data.into(), mime_type: mime_type.into() }
    }

    pub fn json(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, "application/json")
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }
}
