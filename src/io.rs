//! Page storage ABI: the seam a host implements to give the engine a block device, file,
//! or raw memory region to read, write, and erase pages on.
//!
//! `erase` is split out as its own method rather than folded into `write`: flash/SD
//! backends need to distinguish "overwrite a page in place" from "erase a whole block"
//! for wear and timing reasons.

use crate::error::{IoError, Result};

/// How a [`PageStorage`] backend should prepare its underlying storage on `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create fresh storage, discarding any previous content.
    Create,
    /// Open existing storage, preserving its content for recovery.
    Recover,
}

/// A page-addressed storage backend.
///
/// Pages are numbered from `0`; a "logical" page number is whatever the caller passes in,
/// it is the caller's job (the ring-file manager) to map logical ids onto physical page
/// numbers that wrap around a fixed-size region. `erase` operates on a contiguous physical
/// range and is expected to align to whatever erase-block granularity the medium has; the
/// engine only ever erases whole erase-size blocks.
pub trait PageStorage {
    /// Size in bytes of every page this backend serves.
    fn page_size(&self) -> usize;

    /// Total number of pages the backend has reserved.
    fn page_count(&self) -> u32;

    /// Prepare the backend for use. Must be called exactly once before any other method.
    fn open(&mut self, mode: OpenMode) -> Result<()>;

    /// Read physical page `page` into `buffer`, which must be at least [`Self::page_size`]
    /// long.
    fn read(&mut self, page: u32, buffer: &mut [u8]) -> Result<()>;

    /// Write `buffer` (exactly [`Self::page_size`] bytes) to physical page `page`.
    fn write(&mut self, page: u32, buffer: &[u8]) -> Result<()>;

    /// Erase the physical page range `start..end`. `end` is exclusive.
    fn erase(&mut self, start: u32, end: u32) -> Result<()>;

    /// Flush any buffered writes to the medium.
    fn flush(&mut self) -> Result<()>;

    /// Release the backend. Default no-op; backends with an explicit close step override
    /// this.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory [`PageStorage`] backend, for tests and quick prototyping without a
/// filesystem.
///
/// Erase resets pages to `0xff` bytes, matching the erased state of NOR/NAND flash, so
/// recovery-scan code that checks for "never written" pages behaves the same as it would
/// against real flash.
pub struct MemPageFile {
    page_size: usize,
    pages: Vec<u8>,
    page_count: u32,
    opened: bool,
}

impl MemPageFile {
    pub fn new(page_size: usize, page_count: u32) -> Self {
        MemPageFile {
            page_size,
            pages: vec![0xffu8; page_size * page_count as usize],
            page_count,
            opened: false,
        }
    }

    fn offset(&self, page: u32) -> usize {
        page as usize * self.page_size
    }
}

impl PageStorage for MemPageFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        if mode == OpenMode::Create {
            self.pages.iter_mut().for_each(|b| *b = 0xff);
        }
        self.opened = true;
        Ok(())
    }

    fn read(&mut self, page: u32, buffer: &mut [u8]) -> Result<()> {
        if page >= self.page_count {
            return Err(IoError::Read(page).into());
        }
        let off = self.offset(page);
        buffer[..self.page_size].copy_from_slice(&self.pages[off..off + self.page_size]);
        Ok(())
    }

    fn write(&mut self, page: u32, buffer: &[u8]) -> Result<()> {
        if page >= self.page_count {
            return Err(IoError::Write(page).into());
        }
        let off = self.offset(page);
        self.pages[off..off + self.page_size].copy_from_slice(&buffer[..self.page_size]);
        Ok(())
    }

    fn erase(&mut self, start: u32, end: u32) -> Result<()> {
        if start >= end || end > self.page_count {
            return Err(IoError::Erase(start, end).into());
        }
        let from = self.offset(start);
        let to = self.offset(end);
        self.pages[from..to].iter_mut().for_each(|b| *b = 0xff);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [`PageStorage`] backend over a memory-mapped flat file, for desktop hosts.
///
/// The file is sized to `page_size * page_count` bytes up front; reads and writes are
/// plain slice copies into the mapping, relying on the OS page cache for buffering
/// (flushed explicitly on [`PageStorage::flush`]).
pub struct MmapPageFile {
    page_size: usize,
    page_count: u32,
    file: std::fs::File,
    map: Option<memmap2::MmapMut>,
}

impl MmapPageFile {
    pub fn new(file: std::fs::File, page_size: usize, page_count: u32) -> Self {
        MmapPageFile {
            page_size,
            page_count,
            file,
            map: None,
        }
    }

    fn map(&mut self) -> Result<&mut memmap2::MmapMut> {
        self.map.as_mut().ok_or(IoError::Open.into())
    }
}

impl PageStorage for MmapPageFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn open(&mut self, mode: OpenMode) -> Result<()> {
        let len = self.page_size as u64 * self.page_count as u64;
        self.file.set_len(len).map_err(|e| IoError::Os(e))?;

        let mut map = unsafe { memmap2::MmapMut::map_mut(&self.file) }.map_err(|e| IoError::Os(e))?;
        if mode == OpenMode::Create {
            map.iter_mut().for_each(|b| *b = 0xff);
        }
        self.map = Some(map);
        Ok(())
    }

    fn read(&mut self, page: u32, buffer: &mut [u8]) -> Result<()> {
        if page >= self.page_count {
            return Err(IoError::Read(page).into());
        }
        let page_size = self.page_size;
        let map = self.map()?;
        let off = page as usize * page_size;
        buffer[..page_size].copy_from_slice(&map[off..off + page_size]);
        Ok(())
    }

    fn write(&mut self, page: u32, buffer: &[u8]) -> Result<()> {
        if page >= self.page_count {
            return Err(IoError::Write(page).into());
        }
        let page_size = self.page_size;
        let map = self.map()?;
        let off = page as usize * page_size;
        map[off..off + page_size].copy_from_slice(&buffer[..page_size]);
        Ok(())
    }

    fn erase(&mut self, start: u32, end: u32) -> Result<()> {
        if start >= end || end > self.page_count {
            return Err(IoError::Erase(start, end).into());
        }
        let page_size = self.page_size;
        let map = self.map()?;
        let from = start as usize * page_size;
        let to = end as usize * page_size;
        map[from..to].iter_mut().for_each(|b| *b = 0xff);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.map()?.flush().map_err(|e| IoError::Os(e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_resets_to_flash_erased_state() {
        let mut f = MemPageFile::new(64, 4);
        f.open(OpenMode::Create).unwrap();
        f.write(1, &[0u8; 64]).unwrap();
        f.erase(0, 2).unwrap();

        let mut buf = [0u8; 64];
        f.read(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xff));
    }

    #[test]
    fn out_of_range_page_is_an_error() {
        let mut f = MemPageFile::new(64, 4);
        f.open(OpenMode::Create).unwrap();
        assert!(f.read(4, &mut [0u8; 64]).is_err());
        assert!(f.write(10, &[0u8; 64]).is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut f = MemPageFile::new(16, 2);
        f.open(OpenMode::Create).unwrap();
        let page = [7u8; 16];
        f.write(0, &page).unwrap();

        let mut out = [0u8; 16];
        f.read(0, &mut out).unwrap();
        assert_eq!(out, page);
    }
}
