use super::Body;
use edgecache_shared::CacheStatus;
use edgecache_sys::body::BodyWriter;
use std::io::{self, Write};

/// A streaming body that writes into a cache object, visible to readers as it is written.
///
/// The most convenient way to write the body is through the [`Write`] implementation; writes are
/// passed to the cache unbuffered. [`append()`][Self::append()] copies another body, including
/// one that is itself streaming out of the cache.
///
/// The cache object is complete only once [`finish()`][Self::finish()] succeeds. A streaming body
/// that goes out of scope without being finished is abandoned, and readers observe an error
/// rather than a truncated object.
#[must_use = "streaming bodies must be `.finish()`ed"]
pub struct StreamingBody {
    writer: Option<Box<dyn BodyWriter>>,
}

fn status_to_io(status: CacheStatus) -> io::Error {
    let kind = match status {
        CacheStatus::INVAL => io::ErrorKind::InvalidInput,
        CacheStatus::BADF => io::ErrorKind::BrokenPipe,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, status)
}

impl StreamingBody {
    pub(crate) fn new(writer: Box<dyn BodyWriter>) -> Self {
        StreamingBody {
            writer: Some(writer),
        }
    }

    fn writer(&mut self) -> io::Result<&mut Box<dyn BodyWriter>> {
        self.writer
            .as_mut()
            .ok_or_else(|| status_to_io(CacheStatus::BADF))
    }

    /// Finish writing to the streaming body, marking the cache object complete.
    ///
    /// Fails if a length was declared for the object and a different number of bytes was written;
    /// the object is abandoned in that case.
    pub fn finish(mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(writer) => writer.finish().map_err(status_to_io),
            None => Err(status_to_io(CacheStatus::BADF)),
        }
    }

    /// Stop writing to the streaming body, marking the cache object incomplete.
    pub fn abandon(mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abandon();
        }
    }

    /// Append a body onto the end of this streaming body.
    ///
    /// This reads `other` to completion, so it waits for any stream within it.
    pub async fn append(&mut self, mut other: Body) -> io::Result<()> {
        while let Some(chunk) = other.read_chunk().await? {
            self.write_all(&chunk)?;
        }
        Ok(())
    }

    /// Write a string slice to the end of this streaming body.
    pub fn write_str(&mut self, string: &str) -> io::Result<()> {
        self.write_all(string.as_bytes())
    }
}

impl Write for StreamingBody {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self.writer()?;
        BodyWriter::write(writer.as_mut(), buf).map_err(status_to_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            tracing::debug!("streaming body dropped without finishing; abandoning");
            writer.abandon();
        }
    }
}
