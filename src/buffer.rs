//! Page buffer pool: the fixed-purpose read/write buffers each ring needs, sized once at
//! `open` and reused for the life of the instance instead of allocating a page at a time.
//!
//! Each buffer is its own `Vec<u8>` field; the index and var slots only exist when those
//! subsystems are enabled.

/// The data, (optional) index, and (optional) var-data read/write page buffers.
pub struct BufferSet {
    pub data_write: Vec<u8>,
    pub data_read: Vec<u8>,
    pub index_write: Option<Vec<u8>>,
    pub index_read: Option<Vec<u8>>,
    pub var_write: Option<Vec<u8>>,
    pub var_read: Option<Vec<u8>>,
}

impl BufferSet {
    pub fn new(page_size: usize, use_index: bool, use_var_data: bool) -> Self {
        BufferSet {
            data_write: vec![0u8; page_size],
            data_read: vec![0u8; page_size],
            index_write: use_index.then(|| vec![0u8; page_size]),
            index_read: use_index.then(|| vec![0u8; page_size]),
            var_write: use_var_data.then(|| vec![0u8; page_size]),
            var_read: use_var_data.then(|| vec![0u8; page_size]),
        }
    }

    /// Required number of page buffers this configuration claims, for comparison against
    /// `EmbedDbConfig::buffer_size_in_blocks`.
    pub fn required_blocks(use_index: bool, use_var_data: bool) -> u8 {
        2 + if use_index { 2 } else { 0 } + if use_var_data { 2 } else { 0 }
    }

    pub fn reset_data_write(&mut self) {
        self.data_write.iter_mut().for_each(|b| *b = 0);
    }

    pub fn reset_index_write(&mut self) {
        if let Some(buf) = self.index_write.as_mut() {
            buf.iter_mut().for_each(|b| *b = 0);
        }
    }

    pub fn reset_var_write(&mut self) {
        if let Some(buf) = self.var_write.as_mut() {
            buf.iter_mut().for_each(|b| *b = 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omits_optional_buffers_when_disabled() {
        let buffers = BufferSet::new(64, false, false);
        assert!(buffers.index_write.is_none());
        assert!(buffers.var_write.is_none());
    }

    #[test]
    fn required_blocks_matches_enabled_subsystems() {
        assert_eq!(BufferSet::required_blocks(false, false), 2);
        assert_eq!(BufferSet::required_blocks(true, false), 4);
        assert_eq!(BufferSet::required_blocks(true, true), 6);
    }
}
