//! Constant-time comparison.
//!
//! Comparisons whose timing could leak key material go through this module.
//! All operations are mask-based selections from the audited `subtle` crate;
//! there are no secret-dependent branches or memory accesses.

use subtle::ConstantTimeEq;

/// Constant-time equality comparison for byte slices.
///
/// Returns `true` if and only if `a` and `b` have the same length and
/// contents. The comparison time depends only on the length, never on where
/// the first difference occurs. The length check itself is public
/// information.
#[inline]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_slices() {
        assert!(ct_eq(&[1, 2, 3, 4], &[1, 2, 3, 4]));
    }

    #[test]
    fn unequal_slices() {
        assert!(!ct_eq(&[1, 2, 3, 4], &[1, 2, 3, 5]));
        assert!(!ct_eq(&[1, 2, 3, 4], &[4, 3, 2, 1]));
    }

    #[test]
    fn length_mismatch() {
        assert!(!ct_eq(&[1, 2, 3], &[1, 2, 3, 0]));
        assert!(ct_eq(&[], &[]));
    }
}
