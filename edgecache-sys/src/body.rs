use std::io;

use async_trait::async_trait;
use bytes::Bytes;

use crate::CacheStatus;

/// The read half of a cached object's body.
///
/// Each reader owns an independent cursor; several readers may follow the same object while it
/// is still being written.
#[async_trait]
pub trait BodyReader: Send {
    /// Read the next chunk of the body, or `None` at the end of the stream.
    ///
    /// Returns an error if the writer abandoned the object before finishing it.
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>>;

    /// The number of bytes this reader will produce, if already known.
    fn known_length(&self) -> Option<u64> {
        None
    }
}

/// The write half of a cached object's body.
///
/// Bytes become visible to readers as soon as they are written. A writer must end with either
/// [`finish`](BodyWriter::finish) or [`abandon`](BodyWriter::abandon); dropping one without
/// finishing counts as abandoning it.
pub trait BodyWriter: Send {
    fn write(&mut self, buf: &[u8]) -> Result<(), CacheStatus>;

    /// Mark the object complete.
    fn finish(self: Box<Self>) -> Result<(), CacheStatus>;

    /// Mark the object incomplete. Readers past the written bytes observe an error.
    fn abandon(self: Box<Self>);
}
