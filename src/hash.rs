//! `NameHash`: a deterministic, 8-hex-digit, label-safe derivation of a
//! resource name.
//!
//! Kubernetes label values are capped at 63 characters, but resource names
//! can be longer (up to 253 for most kinds). Selectors and adoption lookups
//! need a label value that is always safe to use regardless of the source
//! name's length, so every label that is "derived from a name" uses this
//! hash instead of the raw name. Collisions are tolerated — labels are
//! informational, `uid` is the source of truth for identity — but the
//! function must never vary between processes or versions.
//!
//! FNV-1a was chosen over a cryptographic hash for speed and because no
//! collision resistance guarantee is needed here.

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Derive the stable 8-hex-digit hash of a resource name.
pub fn name_hash(name: &str) -> String {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_hash_vector_from_spec() {
        // Pinned test vector: this value must never change.
        assert_eq!(name_hash("sandbox-name"), "ab179450");
    }

    #[test]
    fn test_name_hash_is_deterministic() {
        assert_eq!(name_hash("my-claim"), name_hash("my-claim"));
    }

    #[test]
    fn test_name_hash_is_eight_hex_digits() {
        let h = name_hash("x");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_name_hash_differs_for_different_names() {
        assert_ne!(name_hash("a"), name_hash("b"));
    }

    #[test]
    fn test_name_hash_empty_string() {
        // Must not panic, must still produce 8 hex digits.
        let h = name_hash("");
        assert_eq!(h.len(), 8);
    }

    #[test]
    fn test_name_hash_handles_long_names() {
        let long_name = "a".repeat(300);
        let h = name_hash(&long_name);
        assert_eq!(h.len(), 8);
    }
}
