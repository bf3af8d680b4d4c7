//! Fixed-width, strictly-ascending record keys.
//!
//! Keys are logically unsigned integers, but only `key_size` (1..=8) of their
//! little-endian bytes are ever written to a page. `Key` lets the engine stay generic
//! over the caller's preferred integer width instead of assuming `u64` everywhere, while
//! still allowing it to do the arithmetic the spline and interpolation search need by
//! routing through `u64`.

use core::fmt::Debug;

/// A record key. See the module docs for the width/`u64` relationship.
pub trait Key: Copy + Ord + Debug + Send + Sync + 'static {
    /// Widen to `u64` for arithmetic (slope calculations, interpolation search).
    fn to_u64(self) -> u64;
    /// Narrow back down from `u64`. Must invert `to_u64` for every in-range value.
    fn from_u64(v: u64) -> Self;
}

macro_rules! impl_key {
    ($($t:ty),*) => {
        $(
            impl Key for $t {
                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn from_u64(v: u64) -> Self {
                    v as $t
                }
            }
        )*
    };
}

impl_key!(u8, u16, u32, u64);

/// Encode `key` into the low `width` bytes of `out` (little-endian). `out` must be at
/// least `width` bytes.
pub fn encode_key<K: Key>(key: K, width: u8, out: &mut [u8]) {
    let bytes = key.to_u64().to_le_bytes();
    out[..width as usize].copy_from_slice(&bytes[..width as usize]);
}

/// Decode a key from the low `width` bytes of `bytes` (little-endian).
pub fn decode_key<K: Key>(width: u8, bytes: &[u8]) -> K {
    let mut buf = [0u8; 8];
    buf[..width as usize].copy_from_slice(&bytes[..width as usize]);
    K::from_u64(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_truncated_width() {
        let mut buf = [0u8; 8];
        encode_key(0x1122_3344u32, 3, &mut buf);
        let back: u32 = decode_key(3, &buf);
        assert_eq!(back, 0x0022_3344);
    }

    #[test]
    fn full_width_u64_round_trips() {
        let mut buf = [0u8; 8];
        encode_key(0xdead_beef_0011_2233u64, 8, &mut buf);
        let back: u64 = decode_key(8, &buf);
        assert_eq!(back, 0xdead_beef_0011_2233);
    }
}
