use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Hash used to pick a bucket (in [`Table`][crate::table::Table]) or a
/// trie path (in [`SharingMap`][crate::sharing_map::SharingMap]).
///
/// Must be deterministic across runs so that trie shapes, and therefore
/// delta-view costs, are reproducible.
pub trait MyHash {
    fn hash(&self) -> u64;
}

/// Deterministic Fx hash of any [`Hash`] value.
pub fn fx_hash<T>(value: &T) -> u64
where
    T: Hash + ?Sized,
{
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fx_hash_is_deterministic() {
        assert_eq!(fx_hash("x"), fx_hash("x"));
        assert_eq!(fx_hash(&(1u32, 2u32)), fx_hash(&(1u32, 2u32)));
        assert_ne!(fx_hash("x"), fx_hash("y"));
    }
}
