//! HTTP bodies.

pub(crate) mod streaming;

use std::collections::VecDeque;
use std::fmt::Debug;
use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use edgecache_sys::body::BodyReader;

pub use streaming::StreamingBody;

enum Part {
    Bytes(Bytes),
    Stream(Box<dyn BodyReader>),
}

/// An HTTP body that can be read from, written to, or appended to another body.
///
/// A body is a sequence of buffered bytes and streams. Streams are typically cached objects being
/// read out of the cache, possibly while they are still being written; reading such a body waits
/// for the writer to catch up.
pub struct Body {
    parts: VecDeque<Part>,
}

impl Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<opaque Body>")
    }
}

impl Body {
    /// Get a new, empty HTTP body.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Body {
            parts: VecDeque::new(),
        }
    }

    /// Create a body that reads from a stream.
    pub fn from_reader(reader: Box<dyn BodyReader>) -> Self {
        let mut body = Body::new();
        body.parts.push_back(Part::Stream(reader));
        body
    }

    /// Read the next chunk of this body, or `None` once it is exhausted.
    ///
    /// Returns an error if a streamed part of the body ends abnormally, for example because the
    /// cache insertion feeding it was abandoned.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        while let Some(part) = self.parts.front_mut() {
            match part {
                Part::Bytes(bytes) => {
                    let bytes = std::mem::take(bytes);
                    self.parts.pop_front();
                    if !bytes.is_empty() {
                        return Ok(Some(bytes));
                    }
                }
                Part::Stream(reader) => match reader.read_chunk().await? {
                    Some(bytes) => return Ok(Some(bytes)),
                    None => {
                        self.parts.pop_front();
                    }
                },
            }
        }
        Ok(None)
    }

    /// Read the entirety of the body into a byte vector.
    pub async fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.to_vec())
    }

    /// Read the entirety of the body into a `String`, interpreting the bytes as UTF-8.
    ///
    /// Fails with [`io::ErrorKind::InvalidData`] if the body is not valid UTF-8.
    pub async fn into_string(self) -> io::Result<String> {
        String::from_utf8(self.into_bytes().await?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Append another body onto the end of this body.
    pub fn append(&mut self, other: Body) {
        self.parts.extend(other.parts);
    }

    /// Write a slice of bytes to the end of this body, and return the number of bytes written.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        self.parts
            .push_back(Part::Bytes(Bytes::copy_from_slice(bytes)));
        bytes.len()
    }

    /// Write a string slice to the end of this body, and return the number of bytes written.
    pub fn write_str(&mut self, string: &str) -> usize {
        self.write_bytes(string.as_ref())
    }

    /// The total length of the body, if every part of it has a known length.
    pub fn known_length(&self) -> Option<u64> {
        self.parts.iter().try_fold(0, |total, part| match part {
            Part::Bytes(bytes) => Some(total + bytes.len() as u64),
            Part::Stream(reader) => reader.known_length().map(|len| total + len),
        })
    }
}

#[async_trait]
impl BodyReader for Body {
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        Body::read_chunk(self).await
    }

    fn known_length(&self) -> Option<u64> {
        Body::known_length(self)
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        let mut body = Body::new();
        body.parts.push_back(Part::Bytes(bytes));
        body
    }
}

impl From<&[u8]> for Body {
    fn from(s: &[u8]) -> Self {
        Body::from(Bytes::copy_from_slice(s))
    }
}

impl From<Vec<u8>> for Body {
    fn from(s: Vec<u8>) -> Self {
        Body::from(Bytes::from(s))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::from(s.as_bytes())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::from(s.into_bytes())
    }
}
