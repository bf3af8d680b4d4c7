//! Public API: `EmbedDb<K, V, B, S>` ties the ring-file manager, spline index, secondary
//! index, var-data ring and record-level-consistency staging together behind
//! `open`/`put`/`get`/`put_var`/`get_var`/`flush`/`close`.

use core::marker::PhantomData;

use crate::bitmap::BitmapIndex;
use crate::buffer::BufferSet;
use crate::config::{DerivedLayout, EmbedDbConfig, KeyLookupStrategy};
use crate::error::{Error, Result};
use crate::index::IndexPageLayout;
use crate::io::{OpenMode, PageStorage};
use crate::key::Key;
use crate::page::PageLayout;
use crate::ring::{self, RingCursor};
use crate::rlc::{self, RlcState};
use crate::spline::Spline;
use crate::value::Value;
use crate::vardata::{VarDataLayout, VarDataStream, VarWriter, NO_VAR_DATA};

#[cfg(feature = "tracing")]
macro_rules! log_trace { ($($arg:tt)*) => { tracing::trace!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! log_trace { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! log_debug { ($($arg:tt)*) => { tracing::debug!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! log_debug { ($($arg:tt)*) => {} }

/// Running counters for page I/O and buffer-hit rates, surfaced to the host for
/// observability instead of printed directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub num_reads: u64,
    pub num_writes: u64,
    pub num_idx_reads: u64,
    pub num_idx_writes: u64,
    pub num_var_reads: u64,
    pub num_var_writes: u64,
    /// Records served directly out of the in-memory write buffer without a ring read.
    pub buffer_hits: u64,
    /// Largest `|estimate - actual|` page distance observed by the spline lookup so far.
    pub max_observed_error: u32,
}

/// Narrows a [`PageStorage`] backend to a contiguous sub-range of its physical pages,
/// so the data ring and the record-level-consistency staging region can share one
/// backend without either needing to know about the other's offset.
struct Window<'a, S: PageStorage> {
    inner: &'a mut S,
    base: u32,
    len: u32,
}

impl<'a, S: PageStorage> PageStorage for Window<'a, S> {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn page_count(&self) -> u32 {
        self.len
    }

    fn open(&mut self, _mode: OpenMode) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, page: u32, buffer: &mut [u8]) -> Result<()> {
        self.inner.read(self.base + page, buffer)
    }

    fn write(&mut self, page: u32, buffer: &[u8]) -> Result<()> {
        self.inner.write(self.base + page, buffer)
    }

    fn erase(&mut self, start: u32, end: u32) -> Result<()> {
        self.inner.erase(self.base + start, self.base + end)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

/// The embedded time-series key-value storage engine.
///
/// `K`/`V` are the record's key and value types, `B` supplies the bitmap zone-map coding
/// strategy, and `S` is the host-supplied page storage backend type. A host with three
/// separate media (three files, three flash regions, ...) opens three `S` instances, one
/// each for the data, secondary-index and var-data rings, and passes them all in.
pub struct EmbedDb<K, V, B, S> {
    pub(crate) config: EmbedDbConfig,
    pub(crate) layout: DerivedLayout,
    pub(crate) page_layout: PageLayout,
    pub(crate) index_layout: Option<IndexPageLayout>,
    pub(crate) var_layout: Option<VarDataLayout>,

    pub(crate) data: S,
    pub(crate) index: Option<S>,
    pub(crate) var: Option<S>,

    pub(crate) data_ring: RingCursor,
    /// Physical pages permanently reserved at the front of `data` for record-level
    /// consistency staging (`2 * erase_size_in_pages`, or `0` when disabled). The data
    /// ring's own addressable space starts just past this region.
    pub(crate) rlc_reserved: u32,
    pub(crate) rlc: Option<RlcState>,

    pub(crate) index_ring: Option<RingCursor>,
    pub(crate) var_writer: Option<VarWriter>,

    pub(crate) spline: Option<Spline<K>>,
    pub(crate) buffers: BufferSet,

    pub(crate) last_key: Option<K>,
    pub(crate) stats: Stats,

    pub(crate) _marker: PhantomData<(V, B)>,
}

impl<K, V, B, S> EmbedDb<K, V, B, S>
where
    K: Key,
    V: Value,
    B: BitmapIndex<V>,
    S: PageStorage,
{
    fn data_window(data: &mut S, base: u32, len: u32) -> Window<'_, S> {
        Window { inner: data, base, len }
    }

    /// Open (or recover) an instance over the given backends, per `config`. Pass `index`/
    /// `var` backends only when `config.use_index`/`config.use_var_data` are set.
    pub fn open(config: EmbedDbConfig, mut data: S, mut index: Option<S>, mut var: Option<S>) -> Result<Self> {
        let layout = config.build()?;

        if config.use_index && index.is_none() {
            return Err(Error::Config("use_index is set but no index backend was provided"));
        }
        if config.use_var_data && var.is_none() {
            return Err(Error::Config("use_var_data is set but no var-data backend was provided"));
        }
        if config.bitmap_size as usize != B::BITMAP_SIZE {
            return Err(Error::Config("config.bitmap_size does not match the BitmapIndex implementation"));
        }

        let page_layout = PageLayout {
            key_size: config.key_size,
            data_size: config.data_size,
            bitmap_size: config.bitmap_size,
            use_max_min: config.use_max_min,
            header_size: layout.header_size,
            record_size: layout.record_size,
            max_records_per_page: layout.max_records_per_page,
        };
        let index_layout = config.use_index.then(|| IndexPageLayout {
            bitmap_size: config.bitmap_size,
            max_records_per_page: layout.max_idx_records_per_page,
        });
        let var_layout = config.use_var_data.then(|| VarDataLayout { key_size: config.key_size });

        let open_mode = if config.reset_data { OpenMode::Create } else { OpenMode::Recover };
        data.open(open_mode)?;
        if let Some(idx) = index.as_mut() {
            idx.open(open_mode)?;
        }
        if let Some(v) = var.as_mut() {
            v.open(open_mode)?;
        }

        let rlc_reserved = if config.record_level_consistency { 2 * config.erase_size_in_pages } else { 0 };
        let data_region_pages = config.num_data_pages - rlc_reserved;

        let mut buffers = BufferSet::new(config.page_size, config.use_index, config.use_var_data);
        let mut data_ring = RingCursor::fresh(data_region_pages, config.erase_size_in_pages, 0);
        let mut index_ring = config
            .use_index
            .then(|| RingCursor::fresh(config.num_index_pages, config.erase_size_in_pages, 0));
        let mut var_writer = config.use_var_data.then(|| {
            VarWriter::new(
                var_layout.unwrap(),
                config.page_size as u32,
                config.num_var_pages,
                config.erase_size_in_pages,
            )
        });
        let mut spline = (config.lookup_strategy == KeyLookupStrategy::Spline)
            .then(|| Spline::<K>::new(config.num_spline_points as usize, config.index_max_error));
        let mut last_key: Option<K> = None;
        let mut rlc = config
            .record_level_consistency
            .then(|| RlcState::new(config.erase_size_in_pages, config.num_data_pages, 0));

        if !config.reset_data {
            let read_id = |buf: &[u8]| page_layout.page_id(buf);
            let read_count = |buf: &[u8]| page_layout.record_count(buf) as u32;

            let recovery = {
                let mut w = Self::data_window(&mut data, rlc_reserved, data_region_pages);
                ring::recover(&mut w, data_region_pages, config.erase_size_in_pages, layout.max_records_per_page, read_id, read_count)?
            };
            data_ring.next_logical = recovery.next_logical;
            data_ring.min_logical = recovery.min_logical;
            data_ring.num_avail = recovery.num_avail;

            if recovery.has_data {
                let mut buf = vec![0u8; config.page_size];
                for logical in recovery.min_logical..recovery.next_logical {
                    let physical = data_ring.physical(logical);
                    let mut w = Self::data_window(&mut data, rlc_reserved, data_region_pages);
                    w.read(physical, &mut buf)?;

                    let count = page_layout.record_count(&buf) as u32;
                    if count == 0 {
                        continue;
                    }
                    if let Some(spl) = spline.as_mut() {
                        let min_key: K = if page_layout.use_max_min {
                            page_layout.min_key(&buf)
                        } else {
                            page_layout.read_record_key(&buf, 0)
                        };
                        spl.add(min_key, logical);
                    }
                    last_key = Some(page_layout.read_record_key::<K>(&buf, count - 1));
                }
                if let Some(spl) = spline.as_mut() {
                    spl.finish_pending();
                }
            }

            if let Some(rlc_state) = rlc.as_mut() {
                let has_permanent_data = recovery.has_data;
                let max_logical_page_id = if has_permanent_data { data_ring.next_logical - 1 } else { 0 };
                let staging = rlc::recover_staging(
                    &mut data,
                    0,
                    config.erase_size_in_pages,
                    config.num_data_pages,
                    max_logical_page_id,
                    has_permanent_data,
                    read_id,
                    read_count,
                )?;
                rlc_state.next_physical = staging.next_physical;
                if let Some(page) = staging.recovered_page {
                    let count = page_layout.record_count(&page) as u32;
                    if count > 0 {
                        buffers.data_write.copy_from_slice(&page);
                        data_ring.next_logical = page_layout.page_id(&page);
                        last_key = Some(page_layout.read_record_key::<K>(&page, count - 1));
                        log_debug!(logical = data_ring.next_logical, "recovered staged record-level-consistency page");
                    }
                }
            }

            if let Some(index_ring) = index_ring.as_mut() {
                let idx = index.as_mut().unwrap();
                let read_id = |buf: &[u8]| u32::from_le_bytes(buf[0..4].try_into().unwrap());
                let read_count = |buf: &[u8]| u16::from_le_bytes(buf[4..6].try_into().unwrap()) as u32;
                let recovery = ring::recover(idx, config.num_index_pages, config.erase_size_in_pages, layout.max_idx_records_per_page, read_id, read_count)?;
                index_ring.next_logical = recovery.next_logical;
                index_ring.min_logical = recovery.min_logical;
                index_ring.num_avail = recovery.num_avail;
            }

            if let (Some(writer), Some(v)) = (var_writer.as_mut(), var.as_mut()) {
                let layout = writer.layout;
                let read_id = |buf: &[u8]| layout.page_id(buf);
                let read_count = |_buf: &[u8]| 1u32;
                let recovery = ring::recover(v, config.num_var_pages, config.erase_size_in_pages, 1, read_id, read_count)?;
                writer.ring.next_logical = recovery.next_logical;
                writer.ring.min_logical = recovery.min_logical;
                writer.ring.num_avail = recovery.num_avail;

                if recovery.has_data {
                    // `recovery.min_logical` is the var ring's own oldest-surviving logical
                    // id, read off the stamped header of its oldest physical page. If it is
                    // still `0`, the var ring has never wrapped and nothing has been
                    // overwritten, so `minVarRecordId` is the smallest key anywhere in the
                    // store (the data file's own min key) rather than anything stamped in
                    // the var ring. Only once the var ring has actually wrapped does its
                    // oldest surviving page's stamped "largest key on this page" field (plus
                    // one) become the right floor.
                    if recovery.min_logical == 0 {
                        let min_key: K = if rlc.is_some() && data_ring.next_logical == 0 {
                            if page_layout.use_max_min {
                                page_layout.min_key(&buffers.data_write)
                            } else {
                                page_layout.read_record_key(&buffers.data_write, 0)
                            }
                        } else {
                            let mut buf = vec![0u8; config.page_size];
                            let physical = data_ring.physical(data_ring.min_logical);
                            let mut w = Self::data_window(&mut data, rlc_reserved, data_region_pages);
                            w.read(physical, &mut buf)?;
                            if page_layout.use_max_min {
                                page_layout.min_key(&buf)
                            } else {
                                page_layout.read_record_key(&buf, 0)
                            }
                        };
                        writer.min_var_record_id = Some(min_key.to_u64());
                    } else {
                        let mut buf = vec![0u8; config.page_size];
                        let oldest_physical = writer.ring.physical(recovery.min_logical);
                        v.read(oldest_physical, &mut buf)?;
                        let mut key_buf = [0u8; 8];
                        let key_size = layout.key_size as usize;
                        key_buf[..key_size].copy_from_slice(layout.last_key_bytes(&buf));
                        writer.min_var_record_id = Some(u64::from_le_bytes(key_buf) + 1);
                    }

                    // The exact in-page write offset at crash time is only ever tracked in
                    // RAM and isn't recoverable without re-parsing every length-prefixed
                    // record in the last page. Start the next append on a fresh page
                    // instead of risking a corrupt splice.
                    writer.current_loc = (recovery.next_logical) * config.page_size as u32 + layout.header_size() as u32;
                }
            }
        }

        Ok(EmbedDb {
            config,
            layout,
            page_layout,
            index_layout,
            var_layout,
            data,
            index,
            var,
            data_ring,
            rlc_reserved,
            rlc,
            index_ring,
            var_writer,
            spline,
            buffers,
            last_key,
            stats: Stats::default(),
            _marker: PhantomData,
        })
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    pub(crate) fn data_physical(&self, logical: u32) -> u32 {
        self.rlc_reserved + self.data_ring.physical(logical)
    }

    pub(crate) fn search_in_page(&self, buf: &[u8], count: u32, key: K) -> Option<u32> {
        if count == 0 {
            return None;
        }
        let mut lo: i64 = 0;
        let mut hi: i64 = count as i64 - 1;
        while lo <= hi {
            let mid = (lo + hi) / 2;
            let candidate: K = self.page_layout.read_record_key(buf, mid as u32);
            match candidate.to_u64().cmp(&key.to_u64()) {
                core::cmp::Ordering::Less => lo = mid + 1,
                core::cmp::Ordering::Greater => hi = mid - 1,
                core::cmp::Ordering::Equal => return Some(mid as u32),
            }
        }
        None
    }

    /// Read logical page `logical` into `self.buffers.data_read` and report whether `key`
    /// falls within its stamped min/max range. When the page layout carries no min/max
    /// (`use_max_min` disabled), there is nothing to check against, so the first page read
    /// is trusted outright.
    fn read_and_straddles(&mut self, logical: u32, key: K) -> Result<bool> {
        let physical = self.data_physical(logical);
        self.data.read(physical, &mut self.buffers.data_read)?;
        self.stats.num_reads += 1;

        if !self.page_layout.use_max_min {
            return Ok(true);
        }
        let page_min: K = self.page_layout.min_key(&self.buffers.data_read);
        let page_max: K = self.page_layout.max_key(&self.buffers.data_read);
        Ok(key.to_u64() >= page_min.to_u64() && key.to_u64() <= page_max.to_u64())
    }

    /// Locate the ring page that would contain `key`, reading it into `self.buffers.data_read`
    /// on success. A bracket is estimated (from the spline, or the whole resident range for
    /// plain binary search), scanned directly, and then — since the estimate is only ever a
    /// bound on the error, not a guarantee — expanded outward past whichever edge the key
    /// overshot (decrementing below `lo` for an underflowing key, incrementing past `hi` for
    /// an overflowing one) until a page straddles `key` or the resident range is exhausted.
    fn locate_page(&mut self, key: K) -> Result<Option<u32>> {
        if self.data_ring.next_logical == self.data_ring.min_logical {
            return Ok(None);
        }
        let resident_lo = self.data_ring.min_logical;
        let resident_hi = self.data_ring.next_logical - 1;

        let (mut lo, mut hi) = match self.spline.as_ref().and_then(|spl| spl.find(key)) {
            Some((lo, hi)) => (lo, hi),
            None => (resident_lo, resident_hi),
        };
        lo = lo.max(resident_lo);
        hi = hi.min(resident_hi);
        if lo > hi {
            lo = resident_lo;
            hi = resident_hi;
        }

        let mut best_error = 0u32;
        let mut lo_min: Option<K> = None;
        let mut hi_max: Option<K> = None;

        for logical in lo..=hi {
            if self.read_and_straddles(logical, key)? {
                self.stats.max_observed_error = self.stats.max_observed_error.max(best_error);
                return Ok(Some(logical));
            }
            best_error = best_error.max((logical as i64 - lo as i64).unsigned_abs() as u32);
            if self.page_layout.use_max_min {
                if logical == lo {
                    lo_min = Some(self.page_layout.min_key(&self.buffers.data_read));
                }
                if logical == hi {
                    hi_max = Some(self.page_layout.max_key(&self.buffers.data_read));
                }
            }
        }

        if !self.page_layout.use_max_min {
            return Ok(None);
        }

        if let Some(hi_max) = hi_max {
            if key.to_u64() > hi_max.to_u64() {
                for logical in (hi + 1)..=resident_hi {
                    best_error = best_error.max(logical - lo);
                    if self.read_and_straddles(logical, key)? {
                        self.stats.max_observed_error = self.stats.max_observed_error.max(best_error);
                        return Ok(Some(logical));
                    }
                }
                return Ok(None);
            }
        }
        if let Some(lo_min) = lo_min {
            if key.to_u64() < lo_min.to_u64() {
                for logical in (resident_lo..lo).rev() {
                    best_error = best_error.max(hi - logical);
                    if self.read_and_straddles(logical, key)? {
                        self.stats.max_observed_error = self.stats.max_observed_error.max(best_error);
                        return Ok(Some(logical));
                    }
                }
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// Retrieve the value stored for `key`, checking the live write buffer first.
    pub fn get(&mut self, key: K) -> Result<Option<V>> {
        let buffered_count = self.page_layout.record_count(&self.buffers.data_write) as u32;
        if let Some(idx) = self.search_in_page(&self.buffers.data_write, buffered_count, key) {
            self.stats.buffer_hits += 1;
            return Ok(Some(self.page_layout.read_record_value(&self.buffers.data_write, idx)));
        }

        match self.locate_page(key)? {
            None => Ok(None),
            Some(_logical) => {
                let count = self.page_layout.record_count(&self.buffers.data_read) as u32;
                match self.search_in_page(&self.buffers.data_read, count, key) {
                    Some(idx) => Ok(Some(self.page_layout.read_record_value(&self.buffers.data_read, idx))),
                    None => Ok(None),
                }
            }
        }
    }

    /// Insert `key`/`value`. Keys must be strictly greater than every previously inserted
    /// key; violating this returns [`Error::OutOfOrder`] and the engine's state is left
    /// unchanged.
    pub fn put(&mut self, key: K, value: &V) -> Result<()> {
        self.put_record(key, value, None)
    }

    /// Insert `key`/`value` plus a variable-length payload. Requires `config.use_var_data`.
    pub fn put_var(&mut self, key: K, value: &V, data: &[u8]) -> Result<()> {
        if !self.config.use_var_data {
            return Err(Error::FeatureDisabled);
        }
        let var_offset = {
            let writer = self.var_writer.as_mut().unwrap();
            let storage = self.var.as_mut().unwrap();
            let write_buf = self.buffers.var_write.as_mut().unwrap();
            writer.append::<K, S>(storage, write_buf, key, data)?
        };
        self.stats.num_var_writes += 1;
        self.put_record(key, value, Some(var_offset))?;

        // With record-level consistency enabled, stage the partial var page durably on
        // every insert, exactly as the fixed-record write buffer is staged. This makes a
        // var blob immediately recoverable at the cost of burning a whole var page per
        // insert instead of amortizing writes across a full page.
        if self.rlc.is_some() {
            let writer = self.var_writer.as_mut().unwrap();
            let storage = self.var.as_mut().unwrap();
            let write_buf = self.buffers.var_write.as_mut().unwrap();
            writer.flush_current(storage, write_buf)?;
            self.stats.num_var_writes += 1;
            storage.flush()?;
            log_trace!("staged record-level-consistency var page");
        }
        Ok(())
    }

    fn put_record(&mut self, key: K, value: &V, var_offset: Option<u32>) -> Result<()> {
        if let Some(last) = self.last_key {
            if key.to_u64() <= last.to_u64() {
                return Err(Error::OutOfOrder);
            }
        }

        let count = self.page_layout.record_count(&self.buffers.data_write) as u32;
        if count >= self.page_layout.max_records_per_page {
            self.write_current_page()?;
        }

        // `put` (as opposed to `put_var`) passes `None` here; when the page layout still
        // reserves a var-offset field, it must be stamped with the sentinel rather than
        // left as whatever garbage previously occupied that slot, or `get_var` would try
        // to resolve a bogus stream for a record that was never given variable data.
        let var_offset = if self.config.use_var_data { Some(var_offset.unwrap_or(NO_VAR_DATA)) } else { None };

        let count = self.page_layout.record_count(&self.buffers.data_write) as u32;
        self.page_layout.write_record(&mut self.buffers.data_write, count, key, value, var_offset);
        self.page_layout.set_record_count(&mut self.buffers.data_write, (count + 1) as u16);

        if count == 0 {
            if self.page_layout.use_max_min {
                self.page_layout.set_min_key(&mut self.buffers.data_write, key);
                self.page_layout.set_min_value(&mut self.buffers.data_write, value);
            }
        }
        if self.page_layout.use_max_min {
            self.page_layout.set_max_key(&mut self.buffers.data_write, key);
            self.page_layout.set_max_value(&mut self.buffers.data_write, value);
        }
        if self.config.use_bitmap {
            let bitmap = self.page_layout.bitmap_mut(&mut self.buffers.data_write);
            B::update(bitmap, value);
        }

        if let Some(rlc) = self.rlc.as_mut() {
            let logical = self.data_ring.next_logical;
            self.page_layout.set_page_id(&mut self.buffers.data_write, logical);
            rlc.stage(&mut self.data, &self.buffers.data_write)?;
            log_trace!(logical, "staged record-level-consistency page");
        }

        self.last_key = Some(key);
        Ok(())
    }

    /// Write the current (possibly partial) data write-buffer page out to the ring, update
    /// the secondary index and spline, and start a fresh buffer page.
    fn write_current_page(&mut self) -> Result<()> {
        let count = self.page_layout.record_count(&self.buffers.data_write) as u32;
        if count == 0 {
            return Ok(());
        }

        let logical = self.data_ring.next_logical;
        self.page_layout.set_page_id(&mut self.buffers.data_write, logical);

        let min_key: K = if self.page_layout.use_max_min {
            self.page_layout.min_key(&self.buffers.data_write)
        } else {
            self.page_layout.read_record_key(&self.buffers.data_write, 0)
        };

        let erased = {
            let mut w = Self::data_window(&mut self.data, self.rlc_reserved, self.config.num_data_pages - self.rlc_reserved);
            let (logical_out, physical, erased) = self.data_ring.allocate(&mut w)?;
            debug_assert_eq!(logical_out, logical);
            w.write(physical, &self.buffers.data_write)?;
            erased
        };
        self.stats.num_writes += 1;
        self.data.flush()?;

        if erased.is_some() {
            if !self.config.disable_spline_clean {
                if let Some(spl) = self.spline.as_mut() {
                    // The new oldest surviving page's min key is the floor below which no
                    // key can ever be queried again.
                    let oldest_physical = self.data_physical(self.data_ring.min_logical);
                    self.data.read(oldest_physical, &mut self.buffers.data_read)?;
                    let floor: K = if self.page_layout.use_max_min {
                        self.page_layout.min_key(&self.buffers.data_read)
                    } else {
                        self.page_layout.read_record_key(&self.buffers.data_read, 0)
                    };
                    spl.evict_before(floor);
                }
            }
            log_debug!(min_logical = self.data_ring.min_logical, "data ring wrapped, erased oldest block");
        }

        if let Some(spl) = self.spline.as_mut() {
            spl.add(min_key, logical);
        }

        if let Some(rlc) = self.rlc.as_mut() {
            if self.data_physical(logical) % self.config.erase_size_in_pages == 0 {
                rlc.shift(&mut self.data)?;
            }
        }

        if self.config.use_index {
            self.append_to_index_page(logical)?;
        }

        self.buffers.reset_data_write();
        Ok(())
    }

    fn append_to_index_page(&mut self, data_logical: u32) -> Result<()> {
        let index_layout = *self.index_layout.as_ref().unwrap();
        let bitmap = self.page_layout.bitmap(&self.buffers.data_write).to_vec();

        let write_buf = self.buffers.index_write.as_mut().unwrap();
        if !index_layout.append(write_buf, data_logical, &bitmap) {
            self.flush_index_page()?;
            let write_buf = self.buffers.index_write.as_mut().unwrap();
            index_layout.append(write_buf, data_logical, &bitmap);
        }
        Ok(())
    }

    fn flush_index_page(&mut self) -> Result<()> {
        let index_layout = *self.index_layout.as_ref().unwrap();
        let ring = self.index_ring.as_mut().unwrap();
        let storage = self.index.as_mut().unwrap();
        let write_buf = self.buffers.index_write.as_mut().unwrap();

        if index_layout.record_count(write_buf) == 0 {
            return Ok(());
        }
        let logical = ring.next_logical;
        index_layout.set_page_id(write_buf, logical);
        let (_, physical, _) = ring.allocate(storage)?;
        storage.write(physical, write_buf)?;
        storage.flush()?;
        self.stats.num_idx_writes += 1;

        self.buffers.reset_index_write();
        Ok(())
    }

    /// Retrieve `key`'s fixed value plus a stream over its variable-length payload.
    /// Returns `Ok(None)` only when `key` itself is absent; a present record with no
    /// variable data attached still returns its value, paired with `None` in place of a
    /// stream. Returns [`Error::VarDataDeleted`] if the fixed record survives but its var
    /// bytes have already been overwritten by ring wraparound.
    pub fn get_var(&mut self, key: K) -> Result<Option<(V, Option<VarDataStream>)>> {
        if !self.config.use_var_data {
            return Err(Error::FeatureDisabled);
        }

        let buffered_count = self.page_layout.record_count(&self.buffers.data_write) as u32;
        let (value, var_offset) = if let Some(idx) = self.search_in_page(&self.buffers.data_write, buffered_count, key) {
            self.stats.buffer_hits += 1;
            (
                self.page_layout.read_record_value(&self.buffers.data_write, idx),
                self.page_layout.read_record_var_offset(&self.buffers.data_write, idx),
            )
        } else {
            match self.locate_page(key)? {
                None => return Ok(None),
                Some(_) => {
                    let count = self.page_layout.record_count(&self.buffers.data_read) as u32;
                    match self.search_in_page(&self.buffers.data_read, count, key) {
                        None => return Ok(None),
                        Some(idx) => (
                            self.page_layout.read_record_value(&self.buffers.data_read, idx),
                            self.page_layout.read_record_var_offset(&self.buffers.data_read, idx),
                        ),
                    }
                }
            }
        };

        if var_offset == NO_VAR_DATA {
            return Ok(Some((value, None)));
        }

        let stream = self.resolve_var_stream(key, var_offset)?;
        Ok(Some((value, Some(stream))))
    }

    /// Build a [`VarDataStream`] for the blob referenced by `var_offset`, belonging to
    /// `key`. Shared by `get_var` and the iterator's `next_var`.
    pub(crate) fn resolve_var_stream(&mut self, key: K, var_offset: u32) -> Result<VarDataStream> {
        let writer = self.var_writer.as_ref().unwrap();
        let header_size = writer.layout.header_size() as u32;
        if let Some(min_id) = writer.min_var_record_id {
            if key.to_u64() < min_id {
                return Err(Error::VarDataDeleted);
            }
        }

        let storage = self.var.as_mut().unwrap();
        let mut len_buf = [0u8; 4];
        read_flat(storage, var_offset, writer.page_size, writer.num_var_pages, header_size, &mut len_buf)?;
        let total_bytes = u32::from_le_bytes(len_buf);
        self.stats.num_var_reads += 1;

        Ok(VarDataStream {
            total_bytes,
            bytes_read: 0,
            data_start: var_offset + 4,
            page_size: writer.page_size,
            num_var_pages: writer.num_var_pages,
            header_size,
        })
    }

    /// Read the next chunk of a [`VarDataStream`] obtained from `get_var` or the
    /// iterator's `next_var`. `stream` tracks its own cursor, so repeated calls walk the
    /// whole blob a chunk at a time.
    pub fn read_var(&mut self, stream: &mut VarDataStream, out: &mut [u8]) -> Result<usize> {
        let storage = self.var.as_mut().ok_or(Error::FeatureDisabled)?;
        stream.read(storage, out)
    }

    /// Flush the in-progress data, index and var write-buffer pages. Safe to call even
    /// with nothing buffered.
    pub fn flush(&mut self) -> Result<()> {
        self.write_current_page()?;
        if let Some(spl) = self.spline.as_mut() {
            spl.finish_pending();
        }
        if self.config.use_index {
            self.flush_index_page()?;
        }
        if let (Some(writer), Some(storage)) = (self.var_writer.as_mut(), self.var.as_mut()) {
            let write_buf = self.buffers.var_write.as_mut().unwrap();
            if writer.page_offset() != writer.layout.header_size() as u32 {
                writer.flush_current(storage, write_buf)?;
                self.stats.num_var_writes += 1;
                storage.flush()?;
            }
        }
        self.data.flush()?;
        Ok(())
    }

    /// Start a range scan. See [`crate::iter::EmbedDbIterator`] for the bounds that can be
    /// set before the first call to `next`.
    pub fn iter(&mut self) -> crate::iter::EmbedDbIterator<'_, K, V, B, S> {
        crate::iter::EmbedDbIterator::new(self)
    }

    /// Flush then release all backends.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.data.close()?;
        if let Some(idx) = self.index.as_mut() {
            idx.close()?;
        }
        if let Some(v) = self.var.as_mut() {
            v.close()?;
        }
        Ok(())
    }
}

/// Read `out.len()` bytes (here, always the 4-byte length prefix) starting at
/// flat-address-space offset `loc`, wrapping across a var page boundary if needed.
fn read_flat<S: PageStorage>(
    storage: &mut S,
    loc: u32,
    page_size: u32,
    num_var_pages: u32,
    _header_size: u32,
    out: &mut [u8],
) -> Result<()> {
    let physical = (loc / page_size) % num_var_pages;
    let offset = (loc % page_size) as usize;
    let mut page = vec![0u8; page_size as usize];
    storage.read(physical, &mut page)?;

    let room = page_size as usize - offset;
    if room >= out.len() {
        out.copy_from_slice(&page[offset..offset + out.len()]);
    } else {
        out[..room].copy_from_slice(&page[offset..]);
        let physical_next = (physical + 1) % num_var_pages;
        storage.read(physical_next, &mut page)?;
        let remaining = out.len() - room;
        out[room..].copy_from_slice(&page[..remaining]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::LinearBucketBitmap;
    use crate::config::KeyLookupStrategy;
    use crate::io::{MemPageFile, OpenMode};

    type TestDb = EmbedDb<u32, u32, LinearBucketBitmap, MemPageFile>;

    fn open(config: EmbedDbConfig) -> TestDb {
        let mut data = MemPageFile::new(config.page_size, config.num_data_pages);
        data.open(OpenMode::Create).unwrap();
        let index = if config.use_index {
            let mut f = MemPageFile::new(config.page_size, config.num_index_pages);
            f.open(OpenMode::Create).unwrap();
            Some(f)
        } else {
            None
        };
        TestDb::open(config, data, index, None).unwrap()
    }

    #[test]
    fn out_of_order_put_is_rejected_without_mutating_state() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 16,
            erase_size_in_pages: 4,
            ..Default::default()
        };
        let mut db = open(config);
        db.put(10, &1).unwrap();
        assert!(matches!(db.put(10, &2), Err(Error::OutOfOrder)));
        assert!(matches!(db.put(5, &2), Err(Error::OutOfOrder)));
        assert_eq!(db.get(10).unwrap(), Some(1));
    }

    #[test]
    fn put_var_and_get_var_require_use_var_data() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 16,
            erase_size_in_pages: 4,
            ..Default::default()
        };
        let mut db = open(config);
        assert!(matches!(db.put_var(1, &1, b"x"), Err(Error::FeatureDisabled)));
        assert!(matches!(db.get_var(1), Err(Error::FeatureDisabled)));
    }

    #[test]
    fn get_on_write_buffer_performs_zero_page_reads() {
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
            db.put(i, &(i * 10)).unwrap();
        }
        db.reset_stats();
        assert_eq!(db.get(3).unwrap(), Some(30));
        assert_eq!(db.stats().num_reads, 0);
        assert_eq!(db.stats().buffer_hits, 1);
    }

    #[test]
    fn put_flushes_page_at_exactly_max_records_per_page() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 16,
            erase_size_in_pages: 4,
            ..Default::default()
        };
        let mut db = open(config);
        let max_per_page = db.page_layout.max_records_per_page;
        for i in 0..max_per_page {
            db.put(i, &i).unwrap();
        }
        assert_eq!(db.stats().num_writes, 0, "buffer should still be unflushed at exactly a full page");
        db.put(max_per_page, &max_per_page).unwrap();
        assert_eq!(db.stats().num_writes, 1, "inserting past a full page flushes it");
    }

    #[test]
    fn binary_search_strategy_finds_every_key_without_a_spline() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 64,
            erase_size_in_pages: 4,
            lookup_strategy: KeyLookupStrategy::BinarySearch,
            ..Default::default()
        };
        let mut db = open(config);
        assert!(db.spline.is_none());
        for i in 0..300u32 {
            db.put(i, &(i * 2)).unwrap();
        }
        db.flush().unwrap();
        for i in 0..300u32 {
            assert_eq!(db.get(i).unwrap(), Some(i * 2));
        }
    }

    #[test]
    fn reset_data_discards_prior_content_on_reopen() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 16,
            erase_size_in_pages: 4,
            ..Default::default()
        };
        let mut data = MemPageFile::new(config.page_size, config.num_data_pages);
        data.open(OpenMode::Create).unwrap();
        {
            let mut db: TestDb = EmbedDb::open(config.clone(), data, None, None).unwrap();
            for i in 0..5u32 {
                db.put(i, &i).unwrap();
            }
            db.flush().unwrap();
            data = db.data;
        }

        let reset_config = EmbedDbConfig { reset_data: true, ..config };
        let mut db2: TestDb = EmbedDb::open(reset_config, data, None, None).unwrap();
        assert_eq!(db2.get(0).unwrap(), None);
        db2.put(0, &99).unwrap();
        assert_eq!(db2.get(0).unwrap(), Some(99));
    }

    #[test]
    fn get_var_distinguishes_absent_key_from_no_var_data() {
        let config = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 16,
            num_var_pages: 16,
            erase_size_in_pages: 4,
            use_var_data: true,
            ..Default::default()
        };
        let mut data = MemPageFile::new(config.page_size, config.num_data_pages);
        data.open(OpenMode::Create).unwrap();
        let mut var = MemPageFile::new(config.page_size, config.num_var_pages);
        var.open(OpenMode::Create).unwrap();
        let mut db: EmbedDb<u32, u32, LinearBucketBitmap, MemPageFile> =
            EmbedDb::open(config, data, None, Some(var)).unwrap();

        db.put(1, &10).unwrap();
        db.put_var(2, &20, b"payload").unwrap();

        assert!(db.get_var(0).unwrap().is_none(), "key never written");

        let (value, stream) = db.get_var(1).unwrap().expect("record written without var data");
        assert_eq!(value, 10);
        assert!(stream.is_none(), "put() without put_var leaves no var stream");

        let (value, stream) = db.get_var(2).unwrap().expect("record written with var data");
        assert_eq!(value, 20);
        assert!(stream.is_some());
    }
}
