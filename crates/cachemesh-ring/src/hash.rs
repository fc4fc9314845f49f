//! Resource-name hashing.
//!
//! Both functions are part of the wire-level contract: every balancer
//! replica must map the same name to the same ring position, so the
//! exact algorithms are pinned here and covered by fixed test vectors.

use cachemesh_core::HashFunctionId;

/// 32-bit FNV-1a over the input's UTF-8 bytes.
pub fn fnv1a32(name: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in name.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// The last four bytes of the MD5 digest, interpreted big-endian.
pub fn md5_low32(name: &str) -> u32 {
    let digest = md5::compute(name.as_bytes());
    u32::from_be_bytes([digest[12], digest[13], digest[14], digest[15]])
}

/// Map a resource name to a position on a ring of `ring_size` slots.
///
/// `ring_size` must be a power of two; the modulo reduces to a mask.
pub fn ring_position(name: &str, hash_fn: HashFunctionId, ring_size: u32) -> u32 {
    debug_assert!(ring_size.is_power_of_two());
    let hash = match hash_fn {
        HashFunctionId::Fnv1a32 => fnv1a32(name),
        HashFunctionId::Md5Low32 => md5_low32(name),
    };
    hash & (ring_size - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vectors from the FNV specification.
    #[test]
    fn fnv1a32_known_vectors() {
        assert_eq!(fnv1a32(""), 0x811c_9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c_292c);
        assert_eq!(fnv1a32("foobar"), 0xbf9c_f968);
    }

    // md5("") = d41d8cd98f00b204e9800998ecf8427e,
    // md5("abc") = 900150983cd24fb0d6963f7d28e17f72.
    #[test]
    fn md5_low32_known_vectors() {
        assert_eq!(md5_low32(""), 0xecf8_427e);
        assert_eq!(md5_low32("abc"), 0x28e1_7f72);
    }

    #[test]
    fn ring_position_stays_in_range() {
        let ring_size = 1 << 16;
        for name in ["", "a", "foo", "bar", "resource-123"] {
            assert!(ring_position(name, HashFunctionId::Fnv1a32, ring_size) < ring_size);
            assert!(ring_position(name, HashFunctionId::Md5Low32, ring_size) < ring_size);
        }
    }

    #[test]
    fn ring_position_masks_low_bits() {
        let ring_size = 1 << 16;
        assert_eq!(
            ring_position("foobar", HashFunctionId::Fnv1a32, ring_size),
            0xbf9c_f968 & 0xffff
        );
    }
}
