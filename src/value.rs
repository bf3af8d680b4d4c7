//! Fixed-size record payloads, compared via a host-supplied comparator.

use core::cmp::Ordering;
use core::fmt::Debug;

/// A record's fixed-size, opaque-to-the-core payload.
///
/// `compare` stands in for a host-supplied comparison function; built-in numeric impls
/// compare numerically.
pub trait Value: Copy + Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
    fn compare(&self, other: &Self) -> Ordering;
}

macro_rules! impl_value_int {
    ($($t:ty),*) => {
        $(
            impl Value for $t {
                const SIZE: usize = core::mem::size_of::<$t>();

                #[inline]
                fn encode(&self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; core::mem::size_of::<$t>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    Self::from_le_bytes(buf)
                }

                #[inline]
                fn compare(&self, other: &Self) -> Ordering {
                    self.cmp(other)
                }
            }
        )*
    };
}

impl_value_int!(u8, u16, u32, u64, i8, i16, i32, i64);

macro_rules! impl_value_float {
    ($($t:ty),*) => {
        $(
            impl Value for $t {
                const SIZE: usize = core::mem::size_of::<$t>();

                #[inline]
                fn encode(&self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn decode(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; core::mem::size_of::<$t>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    Self::from_le_bytes(buf)
                }

                #[inline]
                fn compare(&self, other: &Self) -> Ordering {
                    // NaN has no defined bucket or ordering for a zone map; treat it as
                    // larger than everything so it always sorts to one side consistently.
                    self.partial_cmp(other).unwrap_or(Ordering::Greater)
                }
            }
        )*
    };
}

impl_value_float!(f32, f64);
