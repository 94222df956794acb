use byteorder::{ByteOrder, LittleEndian};

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::checksum;
use crate::env::WritableFile;
use crate::error::Result;

/// Appends logical records to a log file, fragmenting them across blocks.
pub struct Writer<W: WritableFile> {
    dest: W,
    /// Write position within the current block.
    block_offset: usize,
}

impl<W: WritableFile> Writer<W> {
    /// A writer for a fresh log file.
    pub fn new(dest: W) -> Self {
        Self {
            dest,
            block_offset: 0,
        }
    }

    /// A writer resuming a log that already holds `dest_length` bytes.
    pub fn with_dest_length(dest: W, dest_length: u64) -> Self {
        Self {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Appends one logical record. An empty payload still emits one
    /// zero-length `Full` fragment so the record survives a round trip.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mut left = payload;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    // Zero-fill the trailer; readers skip it.
                    self.dest.append(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.len().min(available);
            let end = fragment_length == left.len();
            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &left[..fragment_length])?;
            left = &left[fragment_length..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    /// Makes everything appended so far durable.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.sync()
    }

    fn emit_physical_record(&mut self, record_type: RecordType, fragment: &[u8]) -> Result<()> {
        debug_assert!(fragment.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + fragment.len() <= BLOCK_SIZE);

        let crc = checksum::mask(checksum::value_of_parts(&[
            &[record_type as u8],
            fragment,
        ]));
        let mut header = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], crc);
        LittleEndian::write_u16(&mut header[4..6], fragment.len() as u16);
        header[6] = record_type as u8;

        self.dest.append(&header)?;
        self.dest.append(fragment)?;
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + fragment.len();
        Ok(())
    }
}
