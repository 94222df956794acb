//! Table construction.
//!
//! The builder consumes ascending keys, cuts data blocks at the target
//! size, and finishes by writing the filter block, the metaindex, the
//! index, and the footer. Index entries are emitted one block late so the
//! separator key can be shortened against the first key of the next
//! block.

use byteorder::{ByteOrder, LittleEndian};

use super::block::BlockBuilder;
use super::filter_block::FilterBlockBuilder;
use super::{BlockHandle, Footer, BLOCK_TRAILER_SIZE};
use crate::checksum;
use crate::config::{CompressionType, Options};
use crate::env::WritableFile;
use crate::error::Result;

pub struct TableBuilder<W: WritableFile> {
    options: Options,
    file: W,
    offset: u64,
    num_entries: u64,
    closed: bool,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    filter_block: Option<FilterBlockBuilder>,
    /// A finished data block whose index entry has not been written yet.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
    status: Result<()>,
}

impl<W: WritableFile> TableBuilder<W> {
    pub fn new(options: Options, file: W) -> Self {
        let filter_block = options.filter_policy.clone().map(|policy| {
            let mut builder = FilterBlockBuilder::new(policy);
            builder.start_block(0);
            builder
        });
        let data_restart_interval = options.block_restart_interval;
        Self {
            options,
            file,
            offset: 0,
            num_entries: 0,
            closed: false,
            data_block: BlockBuilder::new(data_restart_interval),
            // Index entries are never prefix-compressed; every one is a
            // restart point.
            index_block: BlockBuilder::new(1),
            last_key: Vec::new(),
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
            status: Ok(()),
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        self.status.clone()?;
        debug_assert!(
            self.num_entries == 0
                || self.options.comparator.compare(key, &self.last_key)
                    == std::cmp::Ordering::Greater,
            "keys added out of order"
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            self.index_block
                .add(&self.last_key, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Cuts the current data block, records its handle for the next index
    /// entry, and opens a new filter region.
    pub fn flush(&mut self) -> Result<()> {
        debug_assert!(!self.closed);
        self.status.clone()?;
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let raw = self.data_block.finish().to_vec();
        self.data_block.reset();
        let handle = self.write_block(raw)?;
        self.pending_handle = handle;
        self.pending_index_entry = true;

        if let Err(err) = self.file.flush() {
            self.status = Err(err.clone());
            return Err(err);
        }
        if let Some(filter_block) = &mut self.filter_block {
            filter_block.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes the tail sections and completes the file image. No further
    /// adds are allowed.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        debug_assert!(!self.closed);
        self.closed = true;

        // Filter block, always uncompressed.
        let filter_contents = self.filter_block.as_mut().map(|fb| fb.finish().to_vec());
        let mut filter_handle = None;
        if let Some(contents) = filter_contents {
            filter_handle = Some(self.write_raw_block(&contents, CompressionType::None)?);
        }

        // Metaindex: one entry mapping the filter policy to its block.
        let mut metaindex_block = BlockBuilder::new(self.options.block_restart_interval);
        if let (Some(handle), Some(policy)) = (filter_handle, &self.options.filter_policy) {
            let key = format!("filter.{}", policy.name());
            metaindex_block.add(key.as_bytes(), &handle.encoded());
        }
        let metaindex_contents = metaindex_block.finish().to_vec();
        let metaindex_handle = self.write_block(metaindex_contents)?;

        // The last data block's index entry, keyed past every stored key.
        if self.pending_index_entry {
            self.options.comparator.find_short_successor(&mut self.last_key);
            self.index_block
                .add(&self.last_key, &self.pending_handle.encoded());
            self.pending_index_entry = false;
        }
        let index_contents = self.index_block.finish().to_vec();
        let index_handle = self.write_block(index_contents)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let mut footer_encoding = Vec::new();
        footer.encode_to(&mut footer_encoding);
        let write = self
            .file
            .append(&footer_encoding)
            .and_then(|_| self.file.flush());
        if let Err(err) = write {
            self.status = Err(err.clone());
            return Err(err);
        }
        self.offset += footer_encoding.len() as u64;
        Ok(())
    }

    /// Discards buffered state; the file contents are undefined. For use
    /// when the caller is abandoning the table.
    pub fn abandon(&mut self) {
        debug_assert!(!self.closed);
        self.closed = true;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// File bytes written so far; equals the final file size after
    /// `finish`.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    pub fn status(&self) -> Result<()> {
        self.status.clone()
    }

    /// Compresses (when configured and worthwhile) and writes one block.
    fn write_block(&mut self, raw: Vec<u8>) -> Result<BlockHandle> {
        let (contents, compression) = match self.options.compression {
            CompressionType::Snappy => match snap::raw::Encoder::new().compress_vec(&raw) {
                // Compression must save at least 1/8th to be worth the
                // decompression cost on every future read.
                Ok(compressed) if compressed.len() < raw.len() - raw.len() / 8 => {
                    (compressed, CompressionType::Snappy)
                }
                _ => (raw, CompressionType::None),
            },
            CompressionType::None => (raw, CompressionType::None),
        };
        self.write_raw_block(&contents, compression)
    }

    fn write_raw_block(
        &mut self,
        contents: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);

        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = compression as u8;
        let crc = checksum::mask(checksum::value_of_parts(&[contents, &[compression as u8]]));
        LittleEndian::write_u32(&mut trailer[1..5], crc);

        let write = self
            .file
            .append(contents)
            .and_then(|_| self.file.append(&trailer));
        if let Err(err) = write {
            self.status = Err(err.clone());
            return Err(err);
        }
        self.offset += (contents.len() + BLOCK_TRAILER_SIZE) as u64;
        Ok(handle)
    }
}
