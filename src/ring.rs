//! Ring-file manager: allocates physical pages for an ever-increasing logical page id,
//! wrapping around a fixed-size region and erasing whole blocks ahead of the write cursor
//! as it catches up to the oldest surviving data.
//!
//! `RingCursor` owns the bookkeeping (`next_logical`, `min_logical`, pages available
//! before an erase is due); it does not own storage, so the same type drives the data
//! ring, the index ring and the var-data ring, each against its own [`crate::io::PageStorage`]
//! instance.

use crate::error::Result;
use crate::io::PageStorage;

/// Allocation cursor over a ring of `num_pages` physical pages, erased
/// `erase_size_in_pages` at a time.
#[derive(Debug, Clone, Copy)]
pub struct RingCursor {
    pub num_pages: u32,
    pub erase_size_in_pages: u32,
    /// Next logical page id to be handed out by [`RingCursor::allocate`].
    pub next_logical: u32,
    /// Logical id of the oldest page still readable on the ring.
    pub min_logical: u32,
    /// Writable physical pages left before the next allocation must erase a block.
    pub num_avail: u32,
}

impl RingCursor {
    /// A fresh ring: no data written yet, `reserved` pages held back at the front (used
    /// by the data ring when record-level consistency reserves its staging region).
    pub fn fresh(num_pages: u32, erase_size_in_pages: u32, reserved: u32) -> Self {
        RingCursor {
            num_pages,
            erase_size_in_pages,
            next_logical: 0,
            min_logical: 0,
            num_avail: num_pages - reserved,
        }
    }

    /// Maps a logical page id onto its physical slot.
    pub fn physical(&self, logical: u32) -> u32 {
        logical % self.num_pages
    }

    /// `true` if `logical` is still resident (within `[min_logical, next_logical)`).
    pub fn contains(&self, logical: u32) -> bool {
        logical >= self.min_logical && logical < self.next_logical
    }

    /// Reserve the next logical/physical page pair, erasing a block first if the ring
    /// has run out of headroom. Returns `(logical, physical, erased_logical_range)`; the
    /// erased range (if any) is the half-open `[min_logical, min_logical + erase_size)`
    /// that the caller must treat as gone (evict spline points, advance the var-data
    /// overwrite floor, etc.) before trusting the new `min_logical` on `self`.
    pub fn allocate<S: PageStorage>(&mut self, storage: &mut S) -> Result<(u32, u32, Option<(u32, u32)>)> {
        let logical = self.next_logical;
        let physical = self.physical(logical);

        let mut erased = None;
        if self.num_avail == 0 {
            let erase_start = physical;
            let erase_end = erase_start + self.erase_size_in_pages;
            storage.erase(erase_start, erase_end)?;
            erased = Some((self.min_logical, self.min_logical + self.erase_size_in_pages));
            self.min_logical += self.erase_size_in_pages;
            self.num_avail += self.erase_size_in_pages;
        }

        self.next_logical += 1;
        self.num_avail -= 1;

        Ok((logical, physical, erased))
    }
}

/// Outcome of scanning an existing ring on `open` to recover `next_logical`/`min_logical`
/// without a stored "head" pointer.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryResult {
    pub next_logical: u32,
    pub min_logical: u32,
    pub num_avail: u32,
    /// `true` if any valid page was found at all; `false` means the ring is empty and
    /// the caller should start fresh rather than trust the other fields.
    pub has_data: bool,
}

/// Scans a ring front-to-back to recover its logical write cursor after a restart.
///
/// A page is "valid" if `read_id(page) % num_pages == physical_slot` and its declared
/// record count is in `1..=max_records_per_page`; everything else is erased-but-unwritten
/// flash or a torn write from before a crash. The scan walks forward one erase block at a
/// time looking for the first valid page, then walks page-by-page while logical ids stay
/// contiguous, then locates the wrap boundary to recover `min_logical`.
pub fn recover<S: PageStorage>(
    storage: &mut S,
    num_pages: u32,
    erase_size_in_pages: u32,
    max_records_per_page: u32,
    read_id: impl Fn(&[u8]) -> u32,
    read_count: impl Fn(&[u8]) -> u32,
) -> Result<RecoveryResult> {
    let page_size = storage.page_size();
    let mut buf = vec![0u8; page_size];

    let is_valid = |buf: &[u8], physical: u32| -> bool {
        let count = read_count(buf);
        read_id(buf) % num_pages == physical && count > 0 && count <= max_records_per_page
    };

    let mut physical = 0u32;
    let mut count = 0u32;
    let mut max_logical = 0u32;
    let mut has_data = false;

    // Find the first valid page, skipping whole erase blocks of junk.
    while count < num_pages {
        if storage.read(physical, &mut buf).is_err() {
            break;
        }
        if is_valid(&buf, physical) {
            has_data = true;
            max_logical = read_id(&buf);
            physical += 1;
            count += 1;
            break;
        }
        physical += erase_size_in_pages;
        count += erase_size_in_pages;
    }

    if !has_data {
        return Ok(RecoveryResult {
            next_logical: 0,
            min_logical: 0,
            num_avail: num_pages,
            has_data: false,
        });
    }

    // Walk forward while logical ids stay contiguous.
    while count < num_pages {
        if storage.read(physical, &mut buf).is_err() {
            break;
        }
        let logical = read_id(&buf);
        if logical % num_pages == physical && logical == max_logical + 1 {
            max_logical = logical;
            physical += 1;
            count += 1;
        } else {
            break;
        }
    }

    // If the ring is full, the wrap boundary is wherever the oldest surviving page sits;
    // otherwise the oldest page is physical slot 0.
    let mut physical_of_oldest = 0u32;
    if count < num_pages {
        let to_block_boundary = erase_size_in_pages - (count % erase_size_in_pages);
        let candidate = (physical + to_block_boundary) % num_pages;
        if storage.read(candidate, &mut buf).is_ok() {
            let logical = read_id(&buf);
            if logical % num_pages == candidate {
                physical_of_oldest = candidate;
            }
        }
    }

    storage.read(physical_of_oldest, &mut buf)?;
    let min_logical = read_id(&buf);
    let next_logical = max_logical + 1;
    let num_avail = num_pages + min_logical - next_logical;

    Ok(RecoveryResult {
        next_logical,
        min_logical,
        num_avail,
        has_data: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemPageFile, OpenMode};

    fn write_page(storage: &mut MemPageFile, physical: u32, logical: u32, count: u16) {
        let mut buf = vec![0u8; storage.page_size()];
        buf[0..4].copy_from_slice(&logical.to_le_bytes());
        buf[4..6].copy_from_slice(&count.to_le_bytes());
        storage.write(physical, &buf).unwrap();
    }

    #[test]
    fn allocate_erases_once_headroom_is_exhausted() {
        let mut storage = MemPageFile::new(64, 8);
        storage.open(OpenMode::Create).unwrap();
        let mut cursor = RingCursor::fresh(8, 4, 0);
        cursor.num_avail = 1;
        cursor.next_logical = 7;
        cursor.min_logical = 3;

        let (logical, physical, erased) = cursor.allocate(&mut storage).unwrap();
        assert_eq!(logical, 7);
        assert_eq!(physical, 7);
        assert!(erased.is_none());

        let (logical, physical, erased) = cursor.allocate(&mut storage).unwrap();
        assert_eq!(logical, 8);
        assert_eq!(physical, 0);
        assert_eq!(erased, Some((3, 7)));
        assert_eq!(cursor.min_logical, 7);
    }

    #[test]
    fn recover_on_empty_ring_starts_fresh() {
        let mut storage = MemPageFile::new(64, 8);
        storage.open(OpenMode::Create).unwrap();

        let result = recover(
            &mut storage,
            8,
            4,
            10,
            |b| u32::from_le_bytes(b[0..4].try_into().unwrap()),
            |b| u16::from_le_bytes(b[4..6].try_into().unwrap()) as u32,
        )
        .unwrap();

        assert!(!result.has_data);
        assert_eq!(result.next_logical, 0);
    }

    #[test]
    fn recover_finds_contiguous_unwrapped_ring() {
        let mut storage = MemPageFile::new(64, 8);
        storage.open(OpenMode::Create).unwrap();
        for i in 0..5u32 {
            write_page(&mut storage, i, i, 3);
        }

        let result = recover(
            &mut storage,
            8,
            4,
            10,
            |b| u32::from_le_bytes(b[0..4].try_into().unwrap()),
            |b| u16::from_le_bytes(b[4..6].try_into().unwrap()) as u32,
        )
        .unwrap();

        assert!(result.has_data);
        assert_eq!(result.next_logical, 5);
        assert_eq!(result.min_logical, 0);
    }
}
