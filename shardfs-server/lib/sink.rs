use std::io;
use std::io::Write;

/// A writer that forwards data until the inner writer fails and discards everything after.
///
/// Used to keep consuming a payload from a connection after the local destination failed, so
/// that the connection stays in sync with the framing.
pub struct DrainOnError<W> {
    inner: W,
    error: Option<io::Error>,
}

impl<W: Write> DrainOnError<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, error: None }
    }

    /// Returns the inner writer, or the first error it produced.
    pub fn into_result(self) -> io::Result<W> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.inner),
        }
    }
}

impl<W: Write> Write for DrainOnError<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.error.is_none()
            && let Err(err) = self.inner.write_all(buf)
        {
            self.error = Some(err);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.error.is_none()
            && let Err(err) = self.inner.flush()
        {
            self.error = Some(err);
        }
        Ok(())
    }
}
