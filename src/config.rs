//! Engine configuration: parameter flags, ring sizing, and the derived layout constants
//! computed once at `open` instead of recomputed ad hoc on every call.

use crate::error::{Error, Result};

/// Whether the spline learned index or a plain binary search over each page's stamped
/// min/max key is used to locate the page a key would live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLookupStrategy {
    Spline,
    BinarySearch,
}

/// Builder for an [`crate::engine::EmbedDb`] instance.
///
/// Groups every tunable into a struct validated once by [`EmbedDbConfig::build`] rather
/// than left to the caller to get right by hand.
#[derive(Debug, Clone)]
pub struct EmbedDbConfig {
    /// Width of a key in bytes, 1..=8.
    pub key_size: u8,
    /// Width of a fixed-size value in bytes.
    pub data_size: u8,
    /// Backing page size in bytes, as reported by the `PageStorage` backend.
    pub page_size: usize,
    /// Pages reserved for the data ring. Must be a multiple of `erase_size_in_pages`.
    pub num_data_pages: u32,
    /// Pages reserved for the secondary index ring. Ignored unless `use_index` is set.
    pub num_index_pages: u32,
    /// Pages reserved for the variable-length data ring. Ignored unless `use_var_data`
    /// is set.
    pub num_var_pages: u32,
    /// Erase-block granularity, in pages.
    pub erase_size_in_pages: u32,
    /// Number of page buffers available; each enabled subsystem claims two (a read and a
    /// write buffer).
    pub buffer_size_in_blocks: u8,
    /// Maintain the secondary index ring.
    pub use_index: bool,
    /// Stamp per-page min/max key and value in the header.
    pub use_max_min: bool,
    /// Maintain the bitmap zone map. Requires `use_max_min` semantics to be meaningful
    /// but is tracked independently.
    pub use_bitmap: bool,
    /// Enable `put_var`/`get_var`.
    pub use_var_data: bool,
    /// Stage every insert into the record-level-consistency region before it is batched
    /// into a full page write.
    pub record_level_consistency: bool,
    /// Skip the recovery scan and start every ring fresh, discarding prior content.
    pub reset_data: bool,
    /// Never call `Spline::evict_before` on data-ring wraparound.
    pub disable_spline_clean: bool,
    /// Number of points the spline index retains (ignored when using binary search).
    pub num_spline_points: u32,
    /// Initial max allowed interpolation error for the spline.
    pub index_max_error: u32,
    /// Which lookup strategy locates the page containing a key.
    pub lookup_strategy: KeyLookupStrategy,
    /// Number of bytes the bitmap zone map occupies per page. Must match
    /// `B::BITMAP_SIZE` for whatever `BitmapIndex` implementation is in use.
    pub bitmap_size: u8,
}

impl Default for EmbedDbConfig {
    fn default() -> Self {
        EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 0,
            num_index_pages: 0,
            num_var_pages: 0,
            erase_size_in_pages: 4,
            buffer_size_in_blocks: 4,
            use_index: false,
            use_max_min: true,
            use_bitmap: false,
            use_var_data: false,
            record_level_consistency: false,
            reset_data: false,
            disable_spline_clean: false,
            num_spline_points: 32,
            index_max_error: 1,
            lookup_strategy: KeyLookupStrategy::Spline,
            bitmap_size: 8,
        }
    }
}

impl EmbedDbConfig {
    /// Derived, validated layout parameters (header size, record size, records per page),
    /// computed once at `open` time.
    pub fn build(&self) -> Result<DerivedLayout> {
        if self.key_size == 0 || self.key_size > 8 {
            return Err(Error::Config("key size must be between 1 and 8 bytes"));
        }
        if self.erase_size_in_pages == 0 {
            return Err(Error::Config("erase size in pages must be nonzero"));
        }
        if self.num_data_pages % self.erase_size_in_pages != 0 {
            return Err(Error::Config(
                "number of allocated data pages must be divisible by the erase size in pages",
            ));
        }

        let min_data_pages = if self.record_level_consistency { 4 } else { 2 } * self.erase_size_in_pages;
        if self.num_data_pages < min_data_pages {
            return Err(Error::Config(
                "minimum number of data pages is twice the erase size in pages, or four times when using record-level consistency",
            ));
        }

        if self.use_bitmap && !self.use_index {
            return Err(Error::Config(
                "bitmap zone maps require the secondary index to be enabled (the bitmap is only reserved in the page header alongside it)",
            ));
        }

        let mut record_size = self.key_size as u32 + self.data_size as u32;
        if self.use_var_data {
            if self.num_var_pages % self.erase_size_in_pages != 0 {
                return Err(Error::Config(
                    "number of allocated variable data pages must be divisible by the erase size in pages",
                ));
            }
            // 4-byte offset into the var ring stored alongside the fixed record.
            record_size += 4;
        }

        let mut header_size: u32 = 6;
        if self.use_index {
            if self.num_index_pages % self.erase_size_in_pages != 0 {
                return Err(Error::Config(
                    "number of allocated index pages must be divisible by the erase size in pages",
                ));
            }
            header_size += self.bitmap_size as u32;
        }
        if self.use_max_min {
            header_size += self.key_size as u32 * 2 + self.data_size as u32 * 2;
        }

        if self.page_size <= header_size as usize {
            return Err(Error::Config("page size must be larger than the computed header size"));
        }
        let max_records_per_page = (self.page_size as u32 - header_size) / record_size;
        if max_records_per_page == 0 {
            return Err(Error::Config("page size is too small to hold a single record"));
        }

        let index_multiplier = if self.use_index { 2 } else { 0 } + 2;
        if self.num_data_pages < index_multiplier * self.erase_size_in_pages {
            return Err(Error::Config(
                "number of data pages must be at least twice the erase block size, or four times when using indexing",
            ));
        }

        if self.lookup_strategy == KeyLookupStrategy::Spline && self.num_spline_points < 4 {
            return Err(Error::Config("spline index requires at least 4 points"));
        }

        if self.use_index && self.buffer_size_in_blocks < 4 {
            return Err(Error::Config("using the secondary index requires at least 4 page buffers"));
        }
        let min_var_buffers = 4 + if self.use_index { 2 } else { 0 };
        if self.use_var_data && self.buffer_size_in_blocks < min_var_buffers {
            return Err(Error::Config(
                "using variable-length records requires at least 4 page buffers (6 with the secondary index)",
            ));
        }

        const IDX_HEADER_SIZE: u32 = 16;
        let max_idx_records_per_page = if self.use_index {
            (self.page_size as u32 - IDX_HEADER_SIZE) / self.bitmap_size as u32
        } else {
            0
        };

        Ok(DerivedLayout {
            record_size,
            header_size,
            max_records_per_page,
            max_idx_records_per_page,
        })
    }
}

/// Layout constants derived from an [`EmbedDbConfig`] at `open` time.
#[derive(Debug, Clone, Copy)]
pub struct DerivedLayout {
    pub record_size: u32,
    pub header_size: u32,
    pub max_records_per_page: u32,
    pub max_idx_records_per_page: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_key_size_over_eight_bytes() {
        let cfg = EmbedDbConfig {
            key_size: 9,
            num_data_pages: 8,
            ..Default::default()
        };
        assert!(matches!(cfg.build(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_data_pages_not_divisible_by_erase_size() {
        let cfg = EmbedDbConfig {
            num_data_pages: 7,
            erase_size_in_pages: 4,
            ..Default::default()
        };
        assert!(matches!(cfg.build(), Err(Error::Config(_))));
    }

    #[test]
    fn record_level_consistency_needs_four_erase_blocks() {
        let cfg = EmbedDbConfig {
            num_data_pages: 8,
            erase_size_in_pages: 4,
            record_level_consistency: true,
            ..Default::default()
        };
        assert!(matches!(cfg.build(), Err(Error::Config(_))));

        let cfg = EmbedDbConfig {
            num_data_pages: 16,
            erase_size_in_pages: 4,
            record_level_consistency: true,
            ..Default::default()
        };
        assert!(cfg.build().is_ok());
    }

    #[test]
    fn computes_max_records_per_page() {
        let cfg = EmbedDbConfig {
            key_size: 4,
            data_size: 4,
            page_size: 512,
            num_data_pages: 8,
            erase_size_in_pages: 4,
            use_max_min: true,
            ..Default::default()
        };
        let layout = cfg.build().unwrap();
        // header = 6 + 2*4 + 2*4 = 22, record = 8 -> (512-22)/8 = 61
        assert_eq!(layout.header_size, 22);
        assert_eq!(layout.max_records_per_page, 61);
    }

    #[test]
    fn index_requires_four_buffers() {
        let cfg = EmbedDbConfig {
            num_data_pages: 8,
            erase_size_in_pages: 4,
            use_index: true,
            num_index_pages: 4,
            buffer_size_in_blocks: 2,
            ..Default::default()
        };
        assert!(matches!(cfg.build(), Err(Error::Config(_))));
    }
}
