use byteorder::{ByteOrder, LittleEndian};

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::checksum;
use crate::env::RandomAccessFile;
use crate::error::Result;

/// Receives notice of log regions the reader had to drop. The reader
/// resynchronizes at the next block boundary after reporting.
pub trait Reporter {
    fn corruption(&mut self, bytes: usize, reason: &str);
}

/// Outcome of decoding one physical record.
enum Physical {
    Record {
        record_type: RecordType,
        fragment: Vec<u8>,
        offset: u64,
    },
    /// Clean end of log, including a trailing partial write from a crash.
    Eof,
    /// A corrupt region was reported and skipped.
    Bad,
}

/// Reassembles logical records from a framed log file.
pub struct Reader<F: RandomAccessFile> {
    file: F,
    reporter: Option<Box<dyn Reporter>>,
    /// File offset the next block will be read from.
    next_block_offset: u64,
    /// File offset of the block currently buffered.
    buffer_offset: u64,
    buffer: Vec<u8>,
    /// Consumed prefix of `buffer`.
    pos: usize,
    eof: bool,
    last_record_offset: u64,
}

impl<F: RandomAccessFile> Reader<F> {
    pub fn new(file: F, reporter: Option<Box<dyn Reporter>>) -> Self {
        Self {
            file,
            reporter,
            next_block_offset: 0,
            buffer_offset: 0,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
            last_record_offset: 0,
        }
    }

    /// File offset of the start of the last record returned.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Returns the next logical record, or `None` at the end of the log.
    /// Corrupt regions are reported and skipped rather than ending the
    /// read; IO errors end it.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Offset of the First fragment of the record being assembled.
        let mut prospective_offset = 0u64;

        loop {
            match self.read_physical_record()? {
                Physical::Record {
                    record_type,
                    fragment,
                    offset,
                } => match record_type {
                    RecordType::Full => {
                        if in_fragmented_record {
                            self.report(scratch.len(), "partial record without end");
                        }
                        self.last_record_offset = offset;
                        return Ok(Some(fragment));
                    }
                    RecordType::First => {
                        if in_fragmented_record {
                            self.report(scratch.len(), "partial record without end");
                        }
                        prospective_offset = offset;
                        scratch = fragment;
                        in_fragmented_record = true;
                    }
                    RecordType::Middle => {
                        if !in_fragmented_record {
                            self.report(fragment.len(), "missing start of fragmented record");
                        } else {
                            scratch.extend_from_slice(&fragment);
                        }
                    }
                    RecordType::Last => {
                        if !in_fragmented_record {
                            self.report(fragment.len(), "missing start of fragmented record");
                        } else {
                            scratch.extend_from_slice(&fragment);
                            self.last_record_offset = prospective_offset;
                            return Ok(Some(scratch));
                        }
                    }
                    // Filtered out by read_physical_record.
                    RecordType::Zero => unreachable!(),
                },
                Physical::Eof => {
                    // A record cut off by a crash mid-write is not corruption.
                    return Ok(None);
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Physical> {
        loop {
            if self.buffer.len() - self.pos < HEADER_SIZE {
                if self.eof {
                    // A truncated header at the end of the log means the
                    // writer died mid-record; silently done.
                    self.buffer.clear();
                    self.pos = 0;
                    return Ok(Physical::Eof);
                }
                // Skip the zero-filled block trailer and buffer the next
                // block.
                self.pos = 0;
                self.buffer_offset = self.next_block_offset;
                self.buffer = self.file.read(self.next_block_offset, BLOCK_SIZE)?;
                self.next_block_offset += self.buffer.len() as u64;
                if self.buffer.len() < BLOCK_SIZE {
                    self.eof = true;
                }
                if self.buffer.is_empty() {
                    return Ok(Physical::Eof);
                }
                continue;
            }

            let header = &self.buffer[self.pos..self.pos + HEADER_SIZE];
            let stored_crc = checksum::unmask(LittleEndian::read_u32(&header[0..4]));
            let length = LittleEndian::read_u16(&header[4..6]) as usize;
            let tag = header[6];

            if self.pos + HEADER_SIZE + length > self.buffer.len() {
                let dropped = self.buffer.len() - self.pos;
                self.buffer.clear();
                self.pos = 0;
                if self.eof {
                    // The writer died while appending the payload.
                    return Ok(Physical::Eof);
                }
                self.report(dropped, "bad record length");
                return Ok(Physical::Bad);
            }

            let payload_start = self.pos + HEADER_SIZE;
            let actual_crc = checksum::value_of_parts(&[
                &[tag],
                &self.buffer[payload_start..payload_start + length],
            ]);
            if actual_crc != stored_crc {
                // The length field itself may be garbage, so nothing after
                // this point in the block can be trusted.
                let dropped = self.buffer.len() - self.pos;
                self.buffer.clear();
                self.pos = 0;
                self.report(dropped, "checksum mismatch");
                return Ok(Physical::Bad);
            }

            match RecordType::from_u8(tag) {
                Some(RecordType::Zero) | None => {
                    let dropped = self.buffer.len() - self.pos;
                    self.buffer.clear();
                    self.pos = 0;
                    self.report(dropped, &format!("unexpected record type {tag}"));
                    return Ok(Physical::Bad);
                }
                Some(record_type) => {
                    let offset = self.buffer_offset + self.pos as u64;
                    let fragment = self.buffer[payload_start..payload_start + length].to_vec();
                    self.pos = payload_start + length;
                    return Ok(Physical::Record {
                        record_type,
                        fragment,
                        offset,
                    });
                }
            }
        }
    }

    fn report(&mut self, bytes: usize, reason: &str) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.corruption(bytes, reason);
        }
    }
}
