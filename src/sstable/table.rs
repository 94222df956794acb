//! Table reading.
//!
//! Opening a table parses the footer and pins the index block in memory;
//! data blocks are fetched on demand, through the shared block cache when
//! one is configured. Point lookups consult the filter block first so a
//! definitive "not here" costs no data-block read.

use std::sync::Arc;

use xxhash_rust::xxh32::xxh32;

use super::block::{Block, BlockIterator};
use super::filter_block::FilterBlockReader;
use super::{read_block, BlockHandle, Footer, FOOTER_SIZE};
use crate::cache;
use crate::comparator::BytewiseComparator;
use crate::config::{Options, ReadOptions};
use crate::encoding::put_fixed64;
use crate::env::RandomAccessFile;
use crate::error::{Error, Result};
use crate::iterator::StorageIterator;

pub struct Table {
    options: Options,
    file: Arc<dyn RandomAccessFile>,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
    /// Prefix for this table's block-cache keys.
    cache_id: u64,
}

impl Table {
    /// Opens a table file of `size` bytes. The index block is validated
    /// eagerly; a missing or broken filter block only disables filtering.
    pub fn open(
        options: Options,
        file: Arc<dyn RandomAccessFile>,
        size: u64,
    ) -> Result<Arc<Table>> {
        if size < FOOTER_SIZE as u64 {
            return Err(Error::Corruption(
                "file is too short to be a table".to_string(),
            ));
        }
        let footer_data = file.read(size - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        if footer_data.len() < FOOTER_SIZE {
            return Err(Error::Corruption("truncated footer read".to_string()));
        }
        let footer = Footer::decode_from(&footer_data)?;

        let checked = ReadOptions::new().verify_checksums(true);
        let index_contents = read_block(file.as_ref(), &checked, &footer.index_handle)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let cache_id = options
            .block_cache
            .as_ref()
            .map_or(0, |cache| cache.new_id());

        let mut table = Table {
            options,
            file,
            index_block,
            filter: None,
            cache_id,
        };
        table.read_meta(&footer);
        Ok(Arc::new(table))
    }

    /// Loads the filter block via the metaindex. Failures here lose the
    /// filter, not the table.
    fn read_meta(&mut self, footer: &Footer) {
        let policy = match &self.options.filter_policy {
            Some(policy) => policy.clone(),
            None => return,
        };
        let checked = ReadOptions::new().verify_checksums(true);
        let Ok(meta_contents) = read_block(self.file.as_ref(), &checked, &footer.metaindex_handle)
        else {
            return;
        };
        let Ok(meta_block) = Block::new(meta_contents) else {
            return;
        };

        // Metaindex keys are plain strings regardless of the table's
        // comparator.
        let meta_block = Arc::new(meta_block);
        let mut iter = meta_block.iter(Arc::new(BytewiseComparator));
        let key = format!("filter.{}", policy.name());
        iter.seek(key.as_bytes());
        if iter.valid() && iter.key() == key.as_bytes() {
            let mut input = iter.value();
            if let Ok(handle) = BlockHandle::decode_from(&mut input) {
                if let Ok(filter_data) = read_block(self.file.as_ref(), &checked, &handle) {
                    self.filter = Some(FilterBlockReader::new(policy, filter_data));
                }
            }
        }
    }

    /// Fetches the data block named by an index-entry value, through the
    /// block cache when configured.
    fn read_data_block(
        &self,
        read_options: &ReadOptions,
        index_value: &[u8],
    ) -> Result<Arc<Block>> {
        let mut input = index_value;
        let handle = BlockHandle::decode_from(&mut input)?;

        let cache = match &self.options.block_cache {
            Some(cache) => cache,
            None => {
                let contents = read_block(self.file.as_ref(), read_options, &handle)?;
                return Ok(Arc::new(Block::new(contents)?));
            }
        };

        let mut cache_key = Vec::with_capacity(16);
        put_fixed64(&mut cache_key, self.cache_id);
        put_fixed64(&mut cache_key, handle.offset);
        let hash = xxh32(&cache_key, 0);

        if let Some(cache_handle) = cache.lookup(&cache_key, hash) {
            let block = cache_handle
                .value::<Arc<Block>>()
                .cloned()
                .ok_or_else(|| Error::Corruption("block cache holds a foreign value".to_string()));
            cache.release(cache_handle);
            return block;
        }

        let contents = read_block(self.file.as_ref(), read_options, &handle)?;
        let block = Arc::new(Block::new(contents)?);
        if read_options.fill_cache {
            let charge = block.size();
            let cache_handle = cache.insert(
                &cache_key,
                hash,
                Box::new(block.clone()) as cache::Value,
                charge,
                None,
            );
            cache.release(cache_handle);
        }
        Ok(block)
    }

    /// Point lookup: returns the first entry at or after `key` inside the
    /// candidate data block, or `None` when the table cannot contain the
    /// key.
    pub fn internal_get(
        &self,
        read_options: &ReadOptions,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index_block.iter(self.options.comparator.clone());
        index_iter.seek(key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let index_value = index_iter.value().to_vec();
        if let Some(filter) = &self.filter {
            let mut input = index_value.as_slice();
            if let Ok(handle) = BlockHandle::decode_from(&mut input) {
                if !filter.key_may_match(handle.offset, key) {
                    return Ok(None);
                }
            }
        }

        let block = self.read_data_block(read_options, &index_value)?;
        let mut block_iter = block.iter(self.options.comparator.clone());
        block_iter.seek(key);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }
        let entry = (block_iter.key().to_vec(), block_iter.value().to_vec());
        block_iter.status()?;
        Ok(Some(entry))
    }

    /// Full scan access; a two-level cursor over index and data blocks.
    pub fn iter(self: &Arc<Self>, read_options: ReadOptions) -> TableIterator {
        TableIterator {
            index_iter: self
                .index_block
                .iter(self.options.comparator.clone()),
            table: self.clone(),
            read_options,
            data_iter: None,
            data_index_value: Vec::new(),
            status: Ok(()),
        }
    }
}

/// Iterates a table by walking the index block and lazily opening the
/// data block each index entry points at.
pub struct TableIterator {
    table: Arc<Table>,
    read_options: ReadOptions,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
    /// Index value that produced `data_iter`, to skip redundant loads.
    data_index_value: Vec<u8>,
    status: Result<()>,
}

impl TableIterator {
    /// Aligns `data_iter` with the index iterator's current entry.
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let index_value = self.index_iter.value();
        if self.data_iter.is_some() && self.data_index_value == index_value {
            // Already positioned in this block.
            return;
        }
        let index_value = index_value.to_vec();
        match self.table.read_data_block(&self.read_options, &index_value) {
            Ok(block) => {
                self.data_iter = Some(block.iter(self.table.options.comparator.clone()));
                self.data_index_value = index_value;
            }
            Err(err) => {
                if self.status.is_ok() {
                    self.status = Err(err);
                }
                self.data_iter = None;
                self.data_index_value.clear();
            }
        }
    }

    /// Empty or unreadable data blocks are skipped until an entry or the
    /// end of the index is found.
    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |it| !it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_last();
            }
        }
    }
}

impl StorageIterator for TableIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|it| it.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.next();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.prev();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().expect("valid iterator").key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().expect("valid iterator").value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(data_iter) = &self.data_iter {
            data_iter.status()?;
        }
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::CompressionType;
    use crate::env::{FileReader, FileWriter};
    use crate::filter::BloomFilterPolicy;
    use crate::sstable::builder::TableBuilder;

    fn build_table(
        dir: &tempfile::TempDir,
        name: &str,
        options: &Options,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> Arc<Table> {
        let path = dir.path().join(name);
        let mut builder = TableBuilder::new(
            options.clone(),
            FileWriter::create(&path).expect("Failed to create table file"),
        );
        for (key, value) in entries {
            builder.add(key, value).expect("Add failed");
        }
        builder.finish().expect("Finish failed");
        assert_eq!(builder.num_entries() as usize, entries.len());

        let file = Arc::new(FileReader::open(&path).expect("Failed to open table file"));
        let size = file.size().expect("Failed to stat table file");
        assert_eq!(size, builder.file_size());
        Table::open(options.clone(), file, size).expect("Failed to open table")
    }

    fn keyed_entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| (format!("key{:06}", i).into_bytes(), b"v".to_vec()))
            .collect()
    }

    fn test_options() -> Options {
        // Small blocks force a deep index; bloom + cache exercise the full
        // read path.
        Options::new()
            .block_size(256)
            .filter_policy(Arc::new(BloomFilterPolicy::new(10)))
            .block_cache(Arc::new(Cache::new(64 * 1024)))
    }

    #[test]
    fn test_point_lookups() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let entries = keyed_entries(5000);
        let options = test_options();
        let table = build_table(&dir, "000001.ldb", &options, &entries);

        let read_options = ReadOptions::new().verify_checksums(true);
        let found = table
            .internal_get(&read_options, b"key002500")
            .expect("Lookup failed")
            .expect("Missing key");
        assert_eq!(found.0, b"key002500");
        assert_eq!(found.1, b"v");

        assert!(table
            .internal_get(&read_options, b"key999999")
            .expect("Lookup failed")
            .is_none());
    }

    #[test]
    fn test_full_scan_reproduces_input() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let entries = keyed_entries(5000);
        let options = test_options();
        let table = build_table(&dir, "000002.ldb", &options, &entries);

        let mut iter = table.iter(ReadOptions::default());
        iter.seek_to_first();
        for (key, value) in &entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_slice());
            assert_eq!(iter.value(), value.as_slice());
            iter.next();
        }
        assert!(!iter.valid());
        iter.status().expect("Scan failed");

        // And backwards.
        iter.seek_to_last();
        for (key, _) in entries.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_slice());
            iter.prev();
        }
        assert!(!iter.valid());
        iter.status().expect("Scan failed");
    }

    #[test]
    fn test_seek_across_blocks() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let entries = keyed_entries(1000);
        let options = test_options();
        let table = build_table(&dir, "000003.ldb", &options, &entries);

        let mut iter = table.iter(ReadOptions::default());
        for probe in [0usize, 1, 137, 500, 999] {
            let target = format!("key{:06}", probe).into_bytes();
            iter.seek(&target);
            assert!(iter.valid());
            assert_eq!(iter.key(), target);
        }

        // Between-key probes land on the successor, crossing a block
        // boundary when needed.
        iter.seek(b"key000137x");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000138");

        // Walking backward from a seek crosses block boundaries too.
        iter.prev();
        assert_eq!(iter.key(), b"key000137");

        iter.seek(b"zzz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_block_cache_is_populated() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let cache = Arc::new(Cache::new(1 << 20));
        let options = Options::new()
            .block_size(256)
            .block_cache(cache.clone());
        let entries = keyed_entries(500);
        let table = build_table(&dir, "000004.ldb", &options, &entries);

        assert_eq!(cache.total_charge(), 0);
        let mut iter = table.iter(ReadOptions::default());
        iter.seek_to_first();
        while iter.valid() {
            iter.next();
        }
        let after_scan = cache.total_charge();
        assert!(after_scan > 0);

        // A rescan reuses cached blocks rather than growing the cache.
        let mut iter = table.iter(ReadOptions::default());
        iter.seek_to_first();
        while iter.valid() {
            iter.next();
        }
        assert_eq!(cache.total_charge(), after_scan);

        // fill_cache(false) leaves no new residue.
        cache.prune();
        assert_eq!(cache.total_charge(), 0);
        let mut iter = table.iter(ReadOptions::new().fill_cache(false));
        iter.seek_to_first();
        while iter.valid() {
            iter.next();
        }
        assert_eq!(cache.total_charge(), 0);
    }

    #[test]
    fn test_uncompressed_tables_read_back() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let options = Options::new()
            .block_size(512)
            .compression(CompressionType::None);
        let entries = keyed_entries(300);
        let table = build_table(&dir, "000005.ldb", &options, &entries);

        let read_options = ReadOptions::new().verify_checksums(true);
        for (key, value) in &entries {
            let found = table
                .internal_get(&read_options, key)
                .expect("Lookup failed")
                .expect("Missing key");
            assert_eq!(&found.0, key);
            assert_eq!(&found.1, value);
        }
    }

    #[test]
    fn test_corrupt_footer_is_rejected() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("000006.ldb");
        let mut builder = TableBuilder::new(
            Options::default(),
            FileWriter::create(&path).expect("Failed to create table file"),
        );
        builder.add(b"a", b"1").expect("Add failed");
        builder.finish().expect("Finish failed");

        let mut data = std::fs::read(&path).expect("Failed to read table file");
        let n = data.len();
        data[n - 1] ^= 0xff;
        std::fs::write(&path, &data).expect("Failed to rewrite");

        let file = Arc::new(FileReader::open(&path).expect("Failed to open table file"));
        let size = file.size().expect("Failed to stat");
        assert!(matches!(
            Table::open(Options::default(), file, size),
            Err(Error::Corruption(_))
        ));
    }
}
