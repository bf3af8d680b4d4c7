//! Range iteration over a [`crate::engine::EmbedDb`] instance: optional key and value
//! bounds, narrowed by the spline (for the starting page) and by the secondary index's
//! bitmap zone maps (for skipping whole pages whose value range cannot match).
//!
//! Records stream out of the backing data ring oldest-first and finish with whatever is
//! currently sitting in the write buffer, so a scan reaches every record resident at the
//! time each `next` call runs, not just those present when the iterator was created.

use crate::bitmap::BitmapIndex;
use crate::engine::EmbedDb;
use crate::error::{Error, Result};
use crate::io::PageStorage;
use crate::key::Key;
use crate::value::Value;
use crate::vardata::{VarDataStream, NO_VAR_DATA};

/// A range scan in progress. Set bounds with [`EmbedDbIterator::min_key`] and friends
/// before the first call to [`EmbedDbIterator::next`]; bounds are fixed once iteration
/// starts.
pub struct EmbedDbIterator<'e, K, V, B, S> {
    db: &'e mut EmbedDb<K, V, B, S>,
    min_key: Option<K>,
    max_key: Option<K>,
    min_value: Option<V>,
    max_value: Option<V>,
    query_bitmap: Option<Vec<u8>>,
    next_data_page: u32,
    next_data_rec: u32,
    started: bool,
    ended: bool,
}

impl<'e, K, V, B, S> EmbedDbIterator<'e, K, V, B, S>
where
    K: Key,
    V: Value,
    B: BitmapIndex<V>,
    S: PageStorage,
{
    pub(crate) fn new(db: &'e mut EmbedDb<K, V, B, S>) -> Self {
        EmbedDbIterator {
            db,
            min_key: None,
            max_key: None,
            min_value: None,
            max_value: None,
            query_bitmap: None,
            next_data_page: 0,
            next_data_rec: 0,
            started: false,
            ended: false,
        }
    }

    /// Only return records with `key >= min_key`.
    pub fn min_key(mut self, key: K) -> Self {
        self.min_key = Some(key);
        self
    }

    /// Stop iteration once a record with `key > max_key` is reached.
    pub fn max_key(mut self, key: K) -> Self {
        self.max_key = Some(key);
        self
    }

    /// Only return records with `value >= min_value`.
    pub fn min_value(mut self, value: V) -> Self {
        self.min_value = Some(value);
        self
    }

    /// Only return records with `value <= max_value`.
    pub fn max_value(mut self, value: V) -> Self {
        self.max_value = Some(value);
        self
    }

    fn ensure_started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        if self.db.config.use_bitmap
            && self.db.config.use_index
            && (self.min_value.is_some() || self.max_value.is_some())
        {
            let mut bitmap = vec![0u8; B::BITMAP_SIZE];
            B::build_range(&mut bitmap, self.min_value.as_ref(), self.max_value.as_ref());
            self.query_bitmap = Some(bitmap);
        }

        self.next_data_page = match (self.db.spline.as_ref(), self.min_key) {
            (Some(spline), Some(min_key)) => match spline.find(min_key) {
                Some((low, _high)) => low.max(self.db.data_ring.min_logical),
                None => self.db.data_ring.min_logical,
            },
            _ => self.db.data_ring.min_logical,
        };
    }

    /// `true` if the data page at `self.next_data_page` can be skipped entirely because
    /// its bitmap doesn't overlap the query bitmap. Pages whose secondary-index coverage
    /// has already wrapped away are never skipped, since there is no zone-map information
    /// left to rule them out.
    fn page_should_skip(&mut self) -> Result<bool> {
        if self.query_bitmap.is_none() || !self.db.config.use_index {
            return Ok(false);
        }
        let index_layout = *self.db.index_layout.as_ref().unwrap();
        if index_layout.max_records_per_page == 0 {
            return Ok(false);
        }
        let idx_logical = self.next_data_page / index_layout.max_records_per_page;

        let physical = {
            let index_ring = self.db.index_ring.as_ref().unwrap();
            if !index_ring.contains(idx_logical) {
                return Ok(false);
            }
            index_ring.physical(idx_logical)
        };

        {
            let storage = self.db.index.as_mut().unwrap();
            let buf = self.db.buffers.index_read.as_mut().unwrap();
            storage.read(physical, buf)?;
        }
        self.db.stats.num_idx_reads += 1;

        let buf = self.db.buffers.index_read.as_ref().unwrap();
        let min_data_page = index_layout.min_data_page(buf);
        let count = index_layout.record_count(buf) as u32;
        if self.next_data_page < min_data_page || self.next_data_page - min_data_page >= count {
            return Ok(false);
        }
        let slot = self.next_data_page - min_data_page;
        let page_bitmap = index_layout.bitmap(buf, slot);
        let query_bitmap = self.query_bitmap.as_ref().unwrap();
        Ok(!B::overlaps(query_bitmap, page_bitmap))
    }

    /// Advance to (and return) the next matching record, along with its raw var-data
    /// pointer (`None` when `use_var_data` is off, `Some(NO_VAR_DATA)` when the record
    /// carries none).
    fn advance(&mut self) -> Result<Option<(K, V, Option<u32>)>> {
        self.ensure_started();
        if self.ended {
            return Ok(None);
        }

        loop {
            let resident_next = self.db.data_ring.next_logical;
            if self.next_data_page > resident_next {
                self.ended = true;
                return Ok(None);
            }

            let from_buffer = self.next_data_page == resident_next;
            let count = if from_buffer {
                self.db.page_layout.record_count(&self.db.buffers.data_write) as u32
            } else {
                if self.next_data_page < self.db.data_ring.min_logical {
                    self.next_data_page = self.db.data_ring.min_logical;
                    self.next_data_rec = 0;
                    continue;
                }
                if self.next_data_rec == 0 {
                    if self.page_should_skip()? {
                        self.next_data_page += 1;
                        continue;
                    }
                    let physical = self.db.data_physical(self.next_data_page);
                    self.db.data.read(physical, &mut self.db.buffers.data_read)?;
                    self.db.stats.num_reads += 1;
                }
                self.db.page_layout.record_count(&self.db.buffers.data_read) as u32
            };

            if self.next_data_rec >= count {
                self.next_data_page += 1;
                self.next_data_rec = 0;
                continue;
            }

            let key: K = if from_buffer {
                self.db.page_layout.read_record_key(&self.db.buffers.data_write, self.next_data_rec)
            } else {
                self.db.page_layout.read_record_key(&self.db.buffers.data_read, self.next_data_rec)
            };

            if let Some(max_key) = self.max_key {
                if key.to_u64() > max_key.to_u64() {
                    self.ended = true;
                    return Ok(None);
                }
            }

            let value: V = if from_buffer {
                self.db.page_layout.read_record_value(&self.db.buffers.data_write, self.next_data_rec)
            } else {
                self.db.page_layout.read_record_value(&self.db.buffers.data_read, self.next_data_rec)
            };
            let var_offset = self.db.config.use_var_data.then(|| {
                if from_buffer {
                    self.db.page_layout.read_record_var_offset(&self.db.buffers.data_write, self.next_data_rec)
                } else {
                    self.db.page_layout.read_record_var_offset(&self.db.buffers.data_read, self.next_data_rec)
                }
            });

            self.next_data_rec += 1;

            if let Some(min_key) = self.min_key {
                if key.to_u64() < min_key.to_u64() {
                    continue;
                }
            }
            if let Some(min_value) = self.min_value {
                if value.compare(&min_value) == core::cmp::Ordering::Less {
                    continue;
                }
            }
            if let Some(max_value) = self.max_value {
                if value.compare(&max_value) == core::cmp::Ordering::Greater {
                    continue;
                }
            }

            return Ok(Some((key, value, var_offset)));
        }
    }

    /// Advance to the next matching `(key, value)` pair, or `None` at end of scan.
    pub fn next(&mut self) -> Result<Option<(K, V)>> {
        Ok(self.advance()?.map(|(k, v, _)| (k, v)))
    }

    /// Advance to the next matching record, also resolving its variable-length payload
    /// (`None` when the record has none). Requires `use_var_data`.
    pub fn next_var(&mut self) -> Result<Option<(K, V, Option<VarDataStream>)>> {
        if !self.db.config.use_var_data {
            return Err(Error::FeatureDisabled);
        }
        match self.advance()? {
            None => Ok(None),
            Some((key, value, var_offset)) => {
                let var_offset = var_offset.unwrap();
                if var_offset == NO_VAR_DATA {
                    return Ok(Some((key, value, None)));
                }
                let stream = self.db.resolve_var_stream(key, var_offset)?;
                Ok(Some((key, value, Some(stream))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::bitmap::LinearBucketBitmap;
    use crate::config::EmbedDbConfig;
    use crate::engine::EmbedDb;
    use crate::io::{MemPageFile, OpenMode};

    type Db = EmbedDb<u32, u32, LinearBucketBitmap, MemPageFile>;

    fn open(config: EmbedDbConfig) -> Db {
        let mut data = MemPageFile::new(config.page_size, config.num_data_pages);
        data.open(OpenMode::Create).unwrap();
        let index = if config.use_index {
            let mut f = MemPageFile::new(config.page_size, config.num_index_pages);
            f.open(OpenMode::Create).unwrap();
            Some(f)
        } else {
            None
        };
        Db::open(config, data, index, None).unwrap()
    }

    #[test]
    fn plain_scan_returns_every_record_in_order() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 16,
            erase_size_in_pages: 4,
            ..Default::default()
        };
        let mut db = open(config);
        for i in 0..200u32 {
            db.put(i, &(i % 100)).unwrap();
        }
        db.flush().unwrap();

        let mut it = db.iter();
        let mut seen = Vec::new();
        while let Some((k, v)) = it.next().unwrap() {
            seen.push((k, v));
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(seen[0], (0, 0));
        assert_eq!(seen[199], (199, 99));
    }

    #[test]
    fn bounded_scan_respects_min_max_key() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 16,
            erase_size_in_pages: 4,
            ..Default::default()
        };
        let mut db = open(config);
        for i in 0..200u32 {
            db.put(i, &i).unwrap();
        }
        db.flush().unwrap();

        let mut it = db.iter().min_key(50).max_key(60);
        let mut seen = Vec::new();
        while let Some((k, _)) = it.next().unwrap() {
            seen.push(k);
        }
        assert_eq!(seen, (50..=60).collect::<Vec<_>>());
    }

    #[test]
    fn bitmap_filtered_scan_with_index_skips_disjoint_pages() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 32,
            num_index_pages: 8,
            erase_size_in_pages: 4,
            use_index: true,
            use_bitmap: true,
            buffer_size_in_blocks: 4,
            ..Default::default()
        };
        let mut db = open(config);
        for i in 0..1000u32 {
            db.put(i, &(i % 100)).unwrap();
        }
        db.flush().unwrap();

        let mut it = db.iter().min_key(32).min_value(23).max_value(38);
        let mut seen = Vec::new();
        while let Some((k, v)) = it.next().unwrap() {
            seen.push((k, v));
        }
        let expected: Vec<_> = (32..1000u32).filter(|i| (23..=38).contains(&(i % 100))).map(|i| (i, i % 100)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn sees_write_buffer_tail_without_flush() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 16,
            erase_size_in_pages: 4,
            ..Default::default()
        };
        let mut db = open(config);
        for i in 0..5u32 {
            db.put(i, &i).unwrap();
        }

        let mut it = db.iter();
        let mut count = 0;
        while it.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
