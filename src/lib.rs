//! `emberkv` is an embedded time-series key-value storage engine for devices with
//! kilobytes of RAM and flash- or SD-card-class block storage. Records are fixed-size
//! `(key, value)` pairs inserted in strictly ascending key order, optionally paired with
//! a variable-length blob; queries retrieve by exact key, by key range, or by a
//! value-range predicate over a host-supplied zone map.
//!
//! The engine is generic over:
//! - [`key::Key`] — the record's fixed-width key type.
//! - [`value::Value`] — the record's fixed-width value type, compared by a host-supplied
//!   [`value::Value::compare`].
//! - [`bitmap::BitmapIndex`] — the value-to-bitmap coding strategy backing range-scan
//!   page skipping; [`bitmap::LinearBucketBitmap`] is a ready-made bucket-hash
//!   implementation for integer-like values.
//! - [`io::PageStorage`] — the page-addressed backend a host supplies for each of the
//!   up to three ring files (data, secondary index, variable-length data);
//!   [`io::MmapPageFile`] backs it with a memory-mapped flat file, [`io::MemPageFile`]
//!   with a plain in-memory buffer for tests.
//!
//! [`engine::EmbedDb`] ties these together behind `open`/`put`/`get`/`put_var`/
//! `get_var`/`flush`/`close`, plus [`engine::EmbedDb::iter`] for range scans.

pub mod bitmap;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod io;
pub mod iter;
pub mod key;
pub mod page;
pub mod ring;
pub mod rlc;
pub mod spline;
pub mod value;
pub mod vardata;

pub use bitmap::{BitmapIndex, BucketValue, LinearBucketBitmap};
pub use config::{EmbedDbConfig, KeyLookupStrategy};
pub use engine::{EmbedDb, Stats};
pub use error::{Error, IoError, Result};
pub use io::{MemPageFile, MmapPageFile, OpenMode, PageStorage};
pub use iter::EmbedDbIterator;
pub use key::Key;
pub use value::Value;
pub use vardata::VarDataStream;
