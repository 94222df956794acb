//! Filter policies.
//!
//! A filter summarizes a set of keys so a reader can skip a data block
//! without touching it. "No match" is definitive, "may match" is not.

use xxhash_rust::xxh32::xxh32;

/// Builds and probes per-block key summaries.
pub trait FilterPolicy: Send + Sync {
    /// Identifies the policy. The table's metaindex records the filter
    /// block under `filter.<name>`, and a reader that does not recognize
    /// the name ignores the filter.
    fn name(&self) -> &'static str;

    /// Appends a filter summarizing `keys` to `dst`.
    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>);

    /// Probes a filter previously produced by `create_filter`. Must return
    /// true for every key the filter was built from; may return true for
    /// others.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

const BLOOM_HASH_SEED: u32 = 0xbc9f1d34;

fn bloom_hash(key: &[u8]) -> u32 {
    xxh32(key, BLOOM_HASH_SEED)
}

/// A bloom filter with a configurable number of bits per key. Probe
/// positions derive from one base hash by repeated rotation, so each key
/// is hashed once regardless of the probe count.
pub struct BloomFilterPolicy {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilterPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        // bits_per_key * ln(2) probes minimizes the false-positive rate.
        let k = (bits_per_key as f64 * 0.69) as usize;
        Self {
            bits_per_key,
            k: k.clamp(1, 30),
        }
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "emberdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]], dst: &mut Vec<u8>) {
        // Round up to at least 64 bits: small key sets would otherwise
        // produce filters that are almost always wrong.
        let mut bits = keys.len() * self.bits_per_key;
        if bits < 64 {
            bits = 64;
        }
        let bytes = (bits + 7) / 8;
        bits = bytes * 8;

        let init_len = dst.len();
        dst.resize(init_len + bytes, 0);
        dst.push(self.k as u8);
        let array = &mut dst[init_len..init_len + bytes];

        for key in keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit = (h as usize) % bits;
                array[bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let bits = (filter.len() - 1) * 8;
        let k = filter[filter.len() - 1] as usize;
        if k > 30 {
            // Reserved for future encodings: treat as a match.
            return true;
        }
        let array = &filter[..filter.len() - 1];

        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit = (h as usize) % bits;
            if array[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(policy: &BloomFilterPolicy, keys: &[&[u8]]) -> Vec<u8> {
        let mut filter = Vec::new();
        policy.create_filter(keys, &mut filter);
        filter
    }

    #[test]
    fn test_empty_filter() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&policy, &[]);
        assert!(!policy.key_may_match(b"hello", &filter));
        assert!(!policy.key_may_match(b"world", &filter));
    }

    #[test]
    fn test_small_filter() {
        let policy = BloomFilterPolicy::new(10);
        let filter = build(&policy, &[b"hello", b"world"]);
        assert!(policy.key_may_match(b"hello", &filter));
        assert!(policy.key_may_match(b"world", &filter));
        assert!(!policy.key_may_match(b"x", &filter));
        assert!(!policy.key_may_match(b"foo", &filter));
    }

    #[test]
    fn test_false_positive_rate() {
        let policy = BloomFilterPolicy::new(10);

        for len in [1usize, 10, 100, 1000] {
            let keys: Vec<Vec<u8>> = (0..len as u32).map(|i| i.to_le_bytes().to_vec()).collect();
            let key_refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
            let filter = build(&policy, &key_refs);

            // No false negatives, ever.
            for key in &keys {
                assert!(
                    policy.key_may_match(key, &filter),
                    "missing key in filter of {len} keys"
                );
            }

            // False positives should stay near the theoretical ~1%.
            let mut hits = 0;
            for i in 0..10000u32 {
                let probe = (i + 1_000_000_000).to_le_bytes();
                if policy.key_may_match(&probe, &filter) {
                    hits += 1;
                }
            }
            assert!(
                hits < 300,
                "false positive rate {}/10000 too high at {len} keys",
                hits
            );
        }
    }
}
