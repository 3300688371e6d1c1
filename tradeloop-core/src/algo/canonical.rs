use crate::types::{CanonicalId, CycleStep};
use blake2::{Blake2b512, Digest};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

const CYCLE_DOMAIN: &[u8] = b"TRADELOOP_CYCLE_V1";

/// Rotate a step ring so its wallet sequence is lexicographically smallest.
///
/// Applying this twice is the identity, and every rotation of the same ring
/// maps to the same result, so all representations of one cycle agree on the
/// canonical id.
pub fn canonicalize_steps(steps: Vec<CycleStep>) -> Vec<CycleStep> {
    let offset = canonical_rotation(&steps);
    if offset == 0 {
        return steps;
    }
    let mut rotated = steps;
    rotated.rotate_left(offset);
    rotated
}

fn canonical_rotation(steps: &[CycleStep]) -> usize {
    let len = steps.len();
    let mut best = 0;
    for candidate in 1..len {
        for i in 0..len {
            let a = &steps[(candidate + i) % len].from;
            let b = &steps[(best + i) % len].from;
            match a.cmp(b) {
                std::cmp::Ordering::Less => {
                    best = candidate;
                    break;
                }
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Equal => {}
            }
        }
    }
    best
}

/// Collision-resistant id over the rotation-normalized wallet and NFT
/// sequences.
pub fn canonical_id(steps: &[CycleStep]) -> CanonicalId {
    let mut hasher = Blake2b512::new();
    hasher.update(CYCLE_DOMAIN);
    for step in steps {
        hasher.update(b"|w:");
        hasher.update(step.from.as_bytes());
    }
    for step in steps {
        hasher.update(b"|n:");
        hasher.update(step.nft.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..32])
}

/// Domain-separated digest over a list of parts, used for discovery
/// fingerprints.
pub fn digest_hex<I, P>(domain: &[u8], parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Blake2b512::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(b"|");
        hasher.update(part.as_ref());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..32])
}

/// Fixed-size Bloom filter over an atomic bit region.
///
/// Writers only ever set bits, so concurrent inserts from parallel SCC
/// workers need no lock. False positives fall through to the exact set.
pub struct BloomFilter {
    bits: Vec<AtomicU64>,
    n_bits: u64,
    n_hashes: u32,
}

impl BloomFilter {
    const BITS_PER_ENTRY: usize = 10;
    const HASHES: u32 = 4;

    /// Capacity-sized constructor: `expected` entries at ~1% false positives
    pub fn with_capacity(expected: usize) -> Self {
        let n_bits = (expected.max(1) * Self::BITS_PER_ENTRY).next_power_of_two() as u64;
        let words = (n_bits / 64).max(1) as usize;
        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            n_bits,
            n_hashes: Self::HASHES,
        }
    }

    /// Set the entry's bits; returns true when every bit was already set,
    /// i.e. the entry was possibly seen before.
    pub fn insert(&self, key: &str) -> bool {
        let (h1, h2) = self.hash_pair(key);
        let mut seen = true;
        for i in 0..self.n_hashes {
            let bit = (h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.n_bits;
            let word = (bit / 64) as usize;
            let mask = 1u64 << (bit % 64);
            let previous = self.bits[word].fetch_or(mask, Ordering::Relaxed);
            if previous & mask == 0 {
                seen = false;
            }
        }
        seen
    }

    fn hash_pair(&self, key: &str) -> (u64, u64) {
        let mut hasher = Blake2b512::new();
        hasher.update(b"TRADELOOP_BLOOM");
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let h1 = u64::from_le_bytes(digest[..8].try_into().expect("digest is 64 bytes"));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("digest is 64 bytes"))
            | 1; // odd stride
        (h1, h2)
    }
}

/// Per-run cycle deduplication: a Bloom pre-filter in front of a sharded
/// exact set. Exact duplicates are dropped and counted.
pub struct CycleDeduper {
    bloom: Option<BloomFilter>,
    exact: DashMap<CanonicalId, ()>,
    duplicates: AtomicU64,
}

impl CycleDeduper {
    pub fn new(expected_cycles: usize, enable_bloom: bool) -> Self {
        let capacity = (expected_cycles * 3 / 2).max(2_000);
        Self {
            bloom: enable_bloom.then(|| BloomFilter::with_capacity(capacity)),
            exact: DashMap::new(),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Returns true when the id was not seen before in this run.
    pub fn insert(&self, id: &str) -> bool {
        if let Some(bloom) = &self.bloom {
            if !bloom.insert(id) {
                // Definitely new; record it in the exact set for later hits.
                self.exact.insert(id.to_string(), ());
                return true;
            }
        }
        let new = self.exact.insert(id.to_string(), ()).is_none();
        if !new {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        new
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EdgeKind;

    fn ring(wallets: &[&str]) -> Vec<CycleStep> {
        let len = wallets.len();
        (0..len)
            .map(|i| CycleStep {
                from: wallets[i].to_string(),
                to: wallets[(i + 1) % len].to_string(),
                nft: format!("nft-of-{}", wallets[i]),
                kind: EdgeKind::Direct,
            })
            .collect()
    }

    #[test]
    fn test_rotations_share_canonical_form() {
        let base = ring(&["a", "b", "c"]);
        let mut rotated = base.clone();
        rotated.rotate_left(1);
        let mut rotated_twice = base.clone();
        rotated_twice.rotate_left(2);

        let canonical = canonicalize_steps(base.clone());
        assert_eq!(canonicalize_steps(rotated), canonical);
        assert_eq!(canonicalize_steps(rotated_twice), canonical);
        assert_eq!(canonical[0].from, "a");
    }

    #[test]
    fn test_canonicalization_is_idempotent() {
        let mut steps = ring(&["m", "d", "z", "b"]);
        steps.rotate_left(2);
        let once = canonicalize_steps(steps);
        let twice = canonicalize_steps(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_ids_differ_for_different_nfts() {
        let a = ring(&["a", "b"]);
        let mut b = ring(&["a", "b"]);
        b[0].nft = "other".to_string();
        assert_ne!(canonical_id(&a), canonical_id(&b));
    }

    #[test]
    fn test_id_stable_across_rotations() {
        let base = ring(&["x", "a", "q"]);
        let mut rotated = base.clone();
        rotated.rotate_left(2);
        assert_eq!(
            canonical_id(&canonicalize_steps(base)),
            canonical_id(&canonicalize_steps(rotated))
        );
    }

    #[test]
    fn test_bloom_negative_then_positive() {
        let bloom = BloomFilter::with_capacity(1_000);
        assert!(!bloom.insert("cycle-1"));
        assert!(bloom.insert("cycle-1"));
    }

    #[test]
    fn test_deduper_drops_duplicates() {
        let deduper = CycleDeduper::new(100, true);
        assert!(deduper.insert("id-1"));
        assert!(!deduper.insert("id-1"));
        assert!(deduper.insert("id-2"));
        assert_eq!(deduper.duplicates(), 1);
    }

    #[test]
    fn test_deduper_without_bloom() {
        let deduper = CycleDeduper::new(100, false);
        assert!(deduper.insert("id-1"));
        assert!(!deduper.insert("id-1"));
    }
}
