//! File interfaces consumed by the log and table code.
//!
//! The engine is embedded and does not own a filesystem abstraction; it
//! only consumes these two shapes. The std-backed implementations below
//! are what production code and tests run on.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::Result;

/// An append-only file. Appends are buffered; `flush` pushes the buffer to
/// the OS and `sync` makes the data durable.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// A file readable at arbitrary offsets, shareable across threads.
pub trait RandomAccessFile: Send + Sync {
    /// Reads up to `len` bytes at `offset`. A shorter result means end of
    /// file; callers decide whether that is corruption.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn size(&self) -> Result<u64>;
}

/// [`WritableFile`] over a buffered `std::fs::File`.
pub struct FileWriter {
    writer: BufWriter<File>,
}

impl FileWriter {
    pub fn new(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }

    /// Creates (truncating) the file at `path` for appending.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(File::create(path)?))
    }
}

impl WritableFile for FileWriter {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// [`RandomAccessFile`] over a `std::fs::File` using positional reads, so
/// concurrent readers never contend on a seek cursor.
pub struct FileReader {
    file: File,
}

impl FileReader {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(File::open(path)?))
    }
}

impl RandomAccessFile for FileReader {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}
