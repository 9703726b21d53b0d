//! Little-endian load/store helpers.
//!
//! Every wire packet and every flash record in this system is a packed
//! little-endian structure; these helpers are the only place the byte order
//! is spelled out.

/// Load a little-endian `u32` from the first four bytes of `bytes`.
///
/// # Panics
///
/// Panics if `bytes` is shorter than four bytes. Callers operate on
/// fixed-size packets whose lengths are checked at the dispatcher boundary.
#[inline]
pub fn load_le32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Load a little-endian `u64` from the first eight bytes of `bytes`.
///
/// # Panics
///
/// Panics if `bytes` is shorter than eight bytes.
#[inline]
pub fn load_le64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Store `word` into the first four bytes of `out`, little-endian.
#[inline]
pub fn store_le32(word: u32, out: &mut [u8]) {
    out[..4].copy_from_slice(&word.to_le_bytes());
}

/// Store `word` into the first eight bytes of `out`, little-endian.
#[inline]
pub fn store_le64(word: u64, out: &mut [u8]) {
    out[..8].copy_from_slice(&word.to_le_bytes());
}

/// XOR `src` into `dst` byte-by-byte.
///
/// # Panics
///
/// Panics if the slices differ in length.
#[inline]
pub fn xor_bytes(src: &[u8], dst: &mut [u8]) {
    assert_eq!(src.len(), dst.len(), "slice length mismatch");
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le32_roundtrip() {
        let mut buf = [0u8; 4];
        store_le32(0xDEAD_BEEF, &mut buf);
        assert_eq!(buf, [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(load_le32(&buf), 0xDEAD_BEEF);
    }

    #[test]
    fn le64_roundtrip() {
        let mut buf = [0u8; 8];
        store_le64(0x0123_4567_89AB_CDEF, &mut buf);
        assert_eq!(load_le64(&buf), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn loads_ignore_trailing_bytes() {
        let buf = [1u8, 0, 0, 0, 0xFF, 0xFF];
        assert_eq!(load_le32(&buf), 1);
    }

    #[test]
    fn xor_is_self_inverse() {
        let src = [0x5Au8; 16];
        let mut dst = [0xA5u8; 16];
        xor_bytes(&src, &mut dst);
        assert_eq!(dst, [0xFFu8; 16]);
        xor_bytes(&src, &mut dst);
        assert_eq!(dst, [0xA5u8; 16]);
    }
}
