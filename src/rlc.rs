//! Record-level consistency: a reserved 2-erase-block staging region at the front of the
//! data ring that every insert is mirrored into immediately, so a crash between inserts
//! loses at most the records not yet folded into a full, durably written data page,
//! rather than the whole in-progress page.

use crate::error::Result;
use crate::io::PageStorage;

/// Tracks the record-level-consistency staging region: a fixed `2 * erase_size_in_pages`
/// window of physical data-ring pages, starting at `starting_page`, into which every
/// insert's current in-progress page is restaged.
pub struct RlcState {
    pub erase_size_in_pages: u32,
    pub num_data_pages: u32,
    pub starting_page: u32,
    pub next_physical: u32,
}

impl RlcState {
    pub fn new(erase_size_in_pages: u32, num_data_pages: u32, starting_page: u32) -> Self {
        RlcState {
            erase_size_in_pages,
            num_data_pages,
            starting_page,
            next_physical: starting_page,
        }
    }

    /// Stage `buffer` (the in-progress data write-buffer page, already stamped with the
    /// next logical data page id) into the staging region, wrapping and pre-erasing the
    /// far staging block when the write cursor is about to enter it.
    pub fn stage<S: PageStorage>(&mut self, storage: &mut S, buffer: &[u8]) -> Result<()> {
        self.next_physical %= self.num_data_pages;

        let next_page = self.next_physical
            + if self.next_physical < self.starting_page {
                self.num_data_pages
            } else {
                0
            };
        if next_page - self.starting_page >= self.erase_size_in_pages * 2 {
            self.next_physical = self.starting_page;
        }

        if self.next_physical % self.erase_size_in_pages == 1 {
            let mut erase_start = self.starting_page;
            if self.next_physical == erase_start + 1 {
                erase_start = (erase_start + self.erase_size_in_pages) % self.num_data_pages;
            }
            let erase_end = erase_start + self.erase_size_in_pages;
            storage.erase(erase_start, erase_end)?;
        }

        storage.write(self.next_physical, buffer)?;
        self.next_physical += 1;
        Ok(())
    }

    /// Erase whichever of the staging region's two blocks is not the one `next_physical`
    /// currently falls in, called every time the data ring's write cursor crosses an
    /// erase-block boundary. The data page just durably written there makes every staged
    /// copy still sitting in the region stale, so there is nothing left worth preserving in
    /// the other block either.
    ///
    /// Unlike the fixed records it mirrors, the staging region never moves: it is a
    /// permanent `2 * erase_size_in_pages` window reserved at the front of the data file,
    /// disjoint from the data ring's own addressable range (see `EmbedDb::rlc_reserved`).
    /// `starting_page` stays put; only the window's internal read/write cursor rotates.
    pub fn shift<S: PageStorage>(&mut self, storage: &mut S) -> Result<()> {
        let window_len = self.erase_size_in_pages * 2;
        let offset = (self.next_physical - self.starting_page) % window_len;
        let active_block = offset / self.erase_size_in_pages;
        let stale_start = self.starting_page + (1 - active_block) * self.erase_size_in_pages;
        storage.erase(stale_start, stale_start + self.erase_size_in_pages)
    }
}

/// Outcome of scanning the record-level-consistency staging region on `open`: the most
/// complete staged page found, if any, to be folded back in as the current in-progress
/// write buffer.
#[derive(Debug, Clone)]
pub struct RlcRecovery {
    pub starting_page: u32,
    pub next_physical: u32,
    /// The most-complete staged page found in the region, to restore as the live
    /// write-buffer page (its declared record count was the largest of any candidate).
    pub recovered_page: Option<Vec<u8>>,
}

/// Scans the `2 * erase_size_in_pages` staging region starting at `region_start` for the
/// most-complete staged page following `max_logical_page_id` (or following logical id
/// `0` if `has_permanent_data` is false, since an empty ring still stages its very first
/// page there).
pub fn recover_staging<S: PageStorage>(
    storage: &mut S,
    region_start: u32,
    erase_size_in_pages: u32,
    num_data_pages: u32,
    max_logical_page_id: u32,
    has_permanent_data: bool,
    read_id: impl Fn(&[u8]) -> u32,
    read_count: impl Fn(&[u8]) -> u32,
) -> Result<RlcRecovery> {
    let page_size = storage.page_size();
    let mut buf = vec![0u8; page_size];
    let pages_to_read = erase_size_in_pages * 2;

    let mut best_count: Option<u32> = None;
    let mut best_page: Option<u32> = None;
    let mut physical = region_start;

    for read_so_far in 0..pages_to_read {
        if storage.read(physical, &mut buf).is_err() {
            break;
        }
        let logical = read_id(&buf);
        let is_candidate = logical == max_logical_page_id + 1 || (logical == 0 && !has_permanent_data);
        if is_candidate {
            let count = read_count(&buf);
            if best_count.map_or(true, |b| count > b) {
                best_count = Some(count);
                best_page = Some(read_so_far);
            }
        }
        physical = (physical + 1) % num_data_pages;
    }

    let (next_physical, recovered_page) = match best_page {
        None => (region_start, None),
        Some(offset) => {
            let page_physical = (region_start + offset) % num_data_pages;
            storage.read(page_physical, &mut buf)?;
            (
                (region_start + offset + 1) % num_data_pages,
                Some(buf.clone()),
            )
        }
    };

    Ok(RlcRecovery {
        starting_page: region_start,
        next_physical,
        recovered_page,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemPageFile, OpenMode};

    fn stamped_page(page_size: usize, id: u32, count: u16) -> Vec<u8> {
        let mut buf = vec![0u8; page_size];
        buf[0..4].copy_from_slice(&id.to_le_bytes());
        buf[4..6].copy_from_slice(&count.to_le_bytes());
        buf
    }

    #[test]
    fn stage_then_erase_on_second_page_of_block() {
        let mut storage = MemPageFile::new(32, 16);
        storage.open(OpenMode::Create).unwrap();
        let mut rlc = RlcState::new(4, 16, 0);

        rlc.stage(&mut storage, &stamped_page(32, 0, 1)).unwrap();
        assert_eq!(rlc.next_physical, 1);

        rlc.stage(&mut storage, &stamped_page(32, 0, 2)).unwrap();
        assert_eq!(rlc.next_physical, 2);
    }

    #[test]
    fn recover_staging_picks_highest_record_count() {
        let mut storage = MemPageFile::new(32, 16);
        storage.open(OpenMode::Create).unwrap();
        storage.write(0, &stamped_page(32, 6, 2)).unwrap();
        storage.write(1, &stamped_page(32, 6, 5)).unwrap();
        storage.write(2, &stamped_page(32, 6, 3)).unwrap();

        let recovery = recover_staging(
            &mut storage,
            0,
            4,
            16,
            5,
            true,
            |b| u32::from_le_bytes(b[0..4].try_into().unwrap()),
            |b| u16::from_le_bytes(b[4..6].try_into().unwrap()) as u32,
        )
        .unwrap();

        let page = recovery.recovered_page.unwrap();
        assert_eq!(u16::from_le_bytes(page[4..6].try_into().unwrap()), 5);
    }
}
