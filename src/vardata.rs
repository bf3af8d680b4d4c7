//! Variable-length data ring-file.
//!
//! Var page header layout: `[ id:4 ][ lastKeyOnPage:key_size ]`. Record bytes are packed
//! back to back across consecutive var pages as a flat byte stream: a 4-byte length
//! prefix followed by that many content bytes, wrapping to the next page's body (just
//! past its header) whenever a page fills up. `VarDataLayout::header_size` is `4 +
//! key_size`.

use crate::io::PageStorage;
use crate::key::{encode_key, Key};
use crate::ring::RingCursor;

#[derive(Debug, Clone, Copy)]
pub struct VarDataLayout {
    pub key_size: u8,
}

impl VarDataLayout {
    pub fn header_size(&self) -> usize {
        4 + self.key_size as usize
    }

    pub fn page_id(&self, page: &[u8]) -> u32 {
        u32::from_le_bytes(page[0..4].try_into().unwrap())
    }

    pub fn set_page_id(&self, page: &mut [u8], id: u32) {
        page[0..4].copy_from_slice(&id.to_le_bytes());
    }

    pub fn last_key_bytes<'a>(&self, page: &'a [u8]) -> &'a [u8] {
        &page[4..4 + self.key_size as usize]
    }

    pub fn set_last_key<K: Key>(&self, page: &mut [u8], key: K) {
        encode_key(key, self.key_size, &mut page[4..])
    }
}

/// Sentinel var-data pointer stored in a fixed record when it carries no variable data.
pub const NO_VAR_DATA: u32 = u32::MAX;

/// Owns the var-data ring's write cursor: which page is being filled, and at what byte
/// offset within the flat `num_var_pages * page_size` address space the next byte goes.
pub struct VarWriter {
    pub layout: VarDataLayout,
    pub page_size: u32,
    pub num_var_pages: u32,
    pub ring: RingCursor,
    /// Byte offset into the flat address space; `% page_size` gives the offset within
    /// the current write-buffer page.
    pub current_loc: u32,
    /// Smallest key id for which variable data is still retained, or `None` if no data
    /// has been written yet.
    pub min_var_record_id: Option<u64>,
}

impl VarWriter {
    pub fn new(layout: VarDataLayout, page_size: u32, num_var_pages: u32, erase_size_in_pages: u32) -> Self {
        VarWriter {
            ring: RingCursor::fresh(num_var_pages, erase_size_in_pages, 0),
            layout,
            page_size,
            num_var_pages,
            current_loc: layout.header_size() as u32,
            min_var_record_id: None,
        }
    }

    pub fn page_offset(&self) -> u32 {
        self.current_loc % self.page_size
    }

    /// Flush whatever has been written to the current page so far, even if it is not
    /// full, and advance past it. Called by `flush`/`close` so a clean shutdown doesn't
    /// strand the last partial page unread.
    pub fn flush_current<S: PageStorage>(&mut self, storage: &mut S, write_buf: &mut [u8]) -> crate::error::Result<()> {
        self.flush_page(storage, write_buf)?;
        write_buf.iter_mut().for_each(|b| *b = 0);
        let room = self.page_size - self.page_offset();
        self.current_loc += room + self.layout.header_size() as u32;
        Ok(())
    }

    /// Flush `write_buf` (the in-progress page) to storage, rolling the ring forward and
    /// erasing a block first if needed. Reads the oldest surviving page's last key before
    /// erasing it so `min_var_record_id` always reflects exactly what remains readable.
    fn flush_page<S: PageStorage>(&mut self, storage: &mut S, write_buf: &mut [u8]) -> crate::error::Result<()> {
        if self.ring.num_avail == 0 {
            let erase_start = self.ring.physical(self.ring.next_logical);
            let last_erased_physical = (erase_start + self.ring.erase_size_in_pages - 1) % self.num_var_pages;

            let mut scratch = vec![0u8; self.page_size as usize];
            storage.read(last_erased_physical, &mut scratch)?;
            let mut key_buf = [0u8; 8];
            let key_size = self.layout.key_size as usize;
            key_buf[..key_size].copy_from_slice(self.layout.last_key_bytes(&scratch));
            let last_key = u64::from_le_bytes(key_buf);
            self.min_var_record_id = Some(last_key + 1);
        }

        let (logical, physical, _) = self.ring.allocate(storage)?;
        self.layout.set_page_id(write_buf, logical);
        storage.write(physical, write_buf)?;
        Ok(())
    }

    /// Append one record's variable-length payload, returning the flat-address-space
    /// offset to store in the fixed record (`currentVarLoc` at the moment the length
    /// prefix was written), for the caller to stash as the record's var pointer.
    pub fn append<K: Key, S: PageStorage>(
        &mut self,
        storage: &mut S,
        write_buf: &mut [u8],
        key: K,
        data: &[u8],
    ) -> crate::error::Result<u32> {
        // Roll to a fresh page if there isn't room left even for the 4-byte length prefix.
        if self.page_offset() > self.page_size - 4 {
            self.flush_page(storage, write_buf)?;
            write_buf.iter_mut().for_each(|b| *b = 0);
            self.current_loc += self.page_size - self.page_offset() + self.layout.header_size() as u32;
        }

        if self.min_var_record_id.is_none() {
            self.min_var_record_id = Some(key.to_u64());
        }

        self.layout.set_last_key(write_buf, key);

        let start = self.current_loc;
        let len = data.len() as u32;
        self.write_bytes(storage, write_buf, &len.to_le_bytes(), key)?;
        self.write_bytes(storage, write_buf, data, key)?;

        Ok(start)
    }

    fn write_bytes<K: Key, S: PageStorage>(
        &mut self,
        storage: &mut S,
        write_buf: &mut [u8],
        mut bytes: &[u8],
        key: K,
    ) -> crate::error::Result<()> {
        while !bytes.is_empty() {
            let offset = self.page_offset() as usize;
            let room = self.page_size as usize - offset;
            let n = room.min(bytes.len());
            write_buf[offset..offset + n].copy_from_slice(&bytes[..n]);
            self.current_loc += n as u32;
            bytes = &bytes[n..];

            if self.page_offset() == 0 {
                self.flush_page(storage, write_buf)?;
                write_buf.iter_mut().for_each(|b| *b = 0);
                self.layout.set_last_key(write_buf, key);
                self.current_loc += self.layout.header_size() as u32;
            }
        }
        Ok(())
    }
}

/// Streaming reader over one record's variable-length bytes, returned by `get_var` and
/// advanced a chunk at a time so the caller never needs a buffer as large as the whole
/// record.
pub struct VarDataStream {
    pub total_bytes: u32,
    pub bytes_read: u32,
    /// Flat address-space offset of the first content byte (just past the length
    /// prefix).
    pub data_start: u32,
    pub page_size: u32,
    pub num_var_pages: u32,
    pub header_size: u32,
}

impl VarDataStream {
    pub fn remaining(&self) -> u32 {
        self.total_bytes - self.bytes_read
    }

    /// Read up to `out.len()` more bytes, wrapping across var pages as needed. Returns
    /// the number of bytes actually read (`0` once the stream is exhausted).
    pub fn read<S: PageStorage>(&mut self, storage: &mut S, out: &mut [u8]) -> crate::error::Result<usize> {
        let mut written = 0usize;
        while written < out.len() && self.bytes_read < self.total_bytes {
            let loc = self.data_start + self.bytes_read;
            let physical = (loc / self.page_size) % self.num_var_pages;
            let in_page_offset = loc % self.page_size;

            let mut page = vec![0u8; self.page_size as usize];
            storage.read(physical, &mut page)?;

            let room_in_page = self.page_size - in_page_offset;
            let want = (out.len() - written) as u32;
            let remaining_record = self.remaining();
            let n = room_in_page.min(want).min(remaining_record) as usize;

            out[written..written + n].copy_from_slice(&page[in_page_offset as usize..in_page_offset as usize + n]);
            written += n;
            self.bytes_read += n as u32;

            // Crossing a page boundary lands just past the next page's header.
            if in_page_offset as usize + n == self.page_size as usize {
                self.data_start += self.header_size;
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemPageFile, OpenMode};

    #[test]
    fn append_then_stream_round_trips_within_one_page() {
        let layout = VarDataLayout { key_size: 4 };
        let page_size = 64u32;
        let mut storage = MemPageFile::new(page_size as usize, 8);
        storage.open(OpenMode::Create).unwrap();

        let mut writer = VarWriter::new(layout, page_size, 8, 4);
        let mut write_buf = vec![0u8; page_size as usize];

        let payload = b"hello";
        let start = writer.append::<u32, _>(&mut storage, &mut write_buf, 1u32, payload).unwrap();
        storage.write(writer.ring.physical(writer.ring.next_logical), &write_buf).unwrap();

        let mut stream = VarDataStream {
            total_bytes: payload.len() as u32,
            bytes_read: 0,
            data_start: start + 4,
            page_size,
            num_var_pages: 8,
            header_size: layout.header_size() as u32,
        };

        let mut out = vec![0u8; payload.len()];
        let n = stream.read(&mut storage, &mut out).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&out, payload);
    }
}
