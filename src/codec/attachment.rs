use std::fmt;
use std::io::{self, Read};

/// The bytes that follow the JSON object of a binary envelope.
///
/// Nothing is read until the holder asks for it, so a large attachment can
/// be streamed straight through to its destination.
pub struct Attachment<R> {
    reader: R,
}

impl<R: Read> Attachment<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Returns the underlying reader, positioned on the first attachment byte.
    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn read_to_vec(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl<R: Read> Read for Attachment<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<R> fmt::Debug for Attachment<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment").finish_non_exhaustive()
    }
}
