//! Immutable sorted table files.
//!
//! A table is written once, sequentially, and then read with random
//! access:
//!
//! ```text
//! +--------------------+
//! | data block 1       |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | data block N       |
//! +--------------------+
//! | filter block       |   (when a filter policy is configured)
//! +--------------------+
//! | metaindex block    |   filter.<policy> → filter block handle
//! +--------------------+
//! | index block        |   separator key → data block handle
//! +--------------------+
//! | footer (48 bytes)  |   metaindex + index handles, magic
//! +--------------------+
//! ```
//!
//! Every block is followed by a 5-byte trailer: a compression tag and the
//! masked CRC-32C of the payload plus tag.

pub mod block;
pub mod builder;
pub mod filter_block;
pub mod table;

use crate::checksum;
use crate::config::{CompressionType, ReadOptions};
use crate::encoding::{decode_fixed32, get_varint64, put_fixed32, put_varint64};
use crate::env::RandomAccessFile;
use crate::error::{Error, Result};

/// u8 compression tag plus fixed32 masked checksum.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Two varint-packed handles, zero padding, then the magic as two fixed32s.
pub const FOOTER_SIZE: usize = 48;

pub const TABLE_MAGIC_NUMBER: u64 = 0xdb4775248b80fb57;

/// Locates a block within a table file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn encoded(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(20);
        self.encode_to(&mut dst);
        dst
    }

    pub fn decode_from(input: &mut &[u8]) -> Result<Self> {
        let offset = get_varint64(input)
            .ok_or_else(|| Error::Corruption("bad block handle".to_string()))?;
        let size = get_varint64(input)
            .ok_or_else(|| Error::Corruption("bad block handle".to_string()))?;
        Ok(Self { offset, size })
    }
}

/// The fixed-size tail of every table file.
#[derive(Debug, Clone, Copy, Default)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        dst.resize(start + FOOTER_SIZE - 8, 0);
        put_fixed32(dst, (TABLE_MAGIC_NUMBER & 0xffff_ffff) as u32);
        put_fixed32(dst, (TABLE_MAGIC_NUMBER >> 32) as u32);
        debug_assert_eq!(dst.len() - start, FOOTER_SIZE);
    }

    pub fn decode_from(input: &[u8]) -> Result<Self> {
        if input.len() < FOOTER_SIZE {
            return Err(Error::Corruption(format!(
                "footer needs {FOOTER_SIZE} bytes, got {}",
                input.len()
            )));
        }
        let magic_lo = decode_fixed32(&input[FOOTER_SIZE - 8..]) as u64;
        let magic_hi = decode_fixed32(&input[FOOTER_SIZE - 4..]) as u64;
        let magic = (magic_hi << 32) | magic_lo;
        if magic != TABLE_MAGIC_NUMBER {
            return Err(Error::Corruption(
                "not a table file (bad magic number)".to_string(),
            ));
        }
        let mut rest = &input[..FOOTER_SIZE - 8];
        let metaindex_handle = BlockHandle::decode_from(&mut rest)?;
        let index_handle = BlockHandle::decode_from(&mut rest)?;
        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Reads the raw block at `handle`, checks its trailer, and undoes block
/// compression. Returns the uncompressed payload.
pub fn read_block(
    file: &dyn RandomAccessFile,
    options: &ReadOptions,
    handle: &BlockHandle,
) -> Result<Vec<u8>> {
    let n = handle.size as usize;
    let mut data = file.read(handle.offset, n + BLOCK_TRAILER_SIZE)?;
    if data.len() != n + BLOCK_TRAILER_SIZE {
        return Err(Error::Corruption(format!(
            "truncated block read at offset {}",
            handle.offset
        )));
    }

    if options.verify_checksums {
        let stored = checksum::unmask(decode_fixed32(&data[n + 1..n + 5]));
        let actual = checksum::value(&data[..n + 1]);
        if stored != actual {
            return Err(Error::Corruption(format!(
                "block checksum mismatch at offset {}",
                handle.offset
            )));
        }
    }

    match CompressionType::from_u8(data[n]) {
        Some(CompressionType::None) => {
            data.truncate(n);
            Ok(data)
        }
        Some(CompressionType::Snappy) => snap::raw::Decoder::new()
            .decompress_vec(&data[..n])
            .map_err(|err| {
                Error::Corruption(format!(
                    "corrupted snappy block at offset {}: {err}",
                    handle.offset
                ))
            }),
        None => Err(Error::Corruption(format!(
            "unknown block compression tag {}",
            data[n]
        ))),
    }
}
