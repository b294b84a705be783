//! Opaque application frames.

use std::fmt;
use std::str::Utf8Error;

use bytes::Bytes;

/// UTF-8 text held in a shared [`Bytes`] buffer.
///
/// The buffer is validated once when the payload is built. Cloning shares the
/// buffer, and [`TextPayload::into_bytes`] hands it on without copying.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct TextPayload(Bytes);

impl TextPayload {
    /// The underlying buffer.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Give up the payload, keeping the shared buffer.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// The text. Validation already happened at construction, so this never
    /// yields the empty fallback for a payload built through this type.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Bytes> for TextPayload {
    type Error = Utf8Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let _ = std::str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }
}

impl From<String> for TextPayload {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&str> for TextPayload {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl fmt::Debug for TextPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for TextPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discrete message unit exchanged over a connection.
///
/// Both payload kinds live in reference-counted buffers, so handing the same
/// frame to every subscriber of a session never copies the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text message.
    Text(TextPayload),
    /// A binary message, relayed byte for byte.
    Binary(Bytes),
}

impl Frame {
    /// Text frame from anything convertible to a [`TextPayload`].
    pub fn text(s: impl Into<TextPayload>) -> Self {
        Self::Text(s.into())
    }

    /// Text frame over an existing buffer, rejecting invalid UTF-8.
    pub fn text_from_bytes(bytes: Bytes) -> Result<Self, Utf8Error> {
        TextPayload::try_from(bytes).map(Self::Text)
    }

    /// Binary frame.
    pub fn binary(b: impl Into<Bytes>) -> Self {
        Self::Binary(b.into())
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Binary(b) => b.len(),
        }
    }

    /// `true` for a zero-length payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
        }
    }

    /// The payload buffer, whatever the kind.
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Text(t) => t.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}
