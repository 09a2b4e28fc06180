//! Bloom filter proxy
//!
//! A probabilistic "might-exist" gate in front of knowledge ingestion. The
//! filter is sized from a fixed capacity and a target false-positive rate;
//! fingerprints are SHA-256 over `(entity, normalized fact)` reduced to two
//! 64-bit halves for double hashing.
//!
//! Callers must treat `might_contain == false` as a definitive miss (ingest
//! without further checks) and `true` as "probably present" (fall through to
//! semantic comparison).

use std::sync::Mutex;

use sha2::{Digest, Sha256};

// ============================================================================
// FINGERPRINT
// ============================================================================

/// Deterministic fingerprint of `(entity, normalized fact)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    h1: u64,
    h2: u64,
}

impl Fingerprint {
    /// Hash an entity/fact pair. The fact is normalized first so trivial
    /// formatting differences fingerprint identically.
    pub fn of(entity: &str, fact: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(entity.trim().to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_fact(fact).as_bytes());
        let digest = hasher.finalize();
        let h1 = u64::from_le_bytes(digest[0..8].try_into().expect("digest is 32 bytes"));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("digest is 32 bytes"));
        Self { h1, h2 }
    }

    /// The i-th derived hash (Kirsch-Mitzenmacher double hashing).
    fn nth(&self, i: u64) -> u64 {
        self.h1.wrapping_add(i.wrapping_mul(self.h2 | 1))
    }
}

/// Lowercase, collapse whitespace runs, strip surrounding punctuation noise.
pub fn normalize_fact(fact: &str) -> String {
    let mut out = String::with_capacity(fact.len());
    let mut pending_space = false;
    for c in fact.trim().chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        for lower in c.to_lowercase() {
            out.push(lower);
        }
    }
    out
}

// ============================================================================
// METRICS
// ============================================================================

/// Ingestion gate counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomMetrics {
    /// Definitive misses: the filter proved the fact was never seen
    pub bloom_rejections: u64,
    /// Positives confirmed as duplicates by semantic comparison
    pub semantic_confirmations: u64,
    /// Positives the semantic comparison disproved
    pub false_positive_count: u64,
}

// ============================================================================
// FILTER
// ============================================================================

struct Bits {
    words: Vec<u64>,
    inserted: u64,
}

/// Fixed-capacity Bloom filter with a configurable target false-positive rate
pub struct BloomProxy {
    bits: Mutex<Bits>,
    metrics: Mutex<BloomMetrics>,
    num_bits: u64,
    num_hashes: u32,
    capacity: usize,
}

impl BloomProxy {
    /// Size the filter for `capacity` fingerprints at `fp_rate` target
    /// false-positive probability.
    ///
    /// m = -n·ln(p)/ln(2)², k = (m/n)·ln(2), both floored at sane minimums.
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let p = fp_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let k = ((m as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;
        let words = vec![0u64; m.div_ceil(64) as usize];
        Self {
            bits: Mutex::new(Bits { words, inserted: 0 }),
            metrics: Mutex::new(BloomMetrics::default()),
            num_bits: m,
            num_hashes: k,
            capacity: capacity.max(1),
        }
    }

    /// True when the fingerprint was *possibly* inserted before. False is
    /// definitive: the fingerprint was never inserted.
    pub fn might_contain(&self, fp: Fingerprint) -> bool {
        let bits = self.bits.lock().unwrap_or_else(|p| p.into_inner());
        (0..self.num_hashes as u64).all(|i| {
            let bit = fp.nth(i) % self.num_bits;
            bits.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    /// Register a fingerprint.
    pub fn insert(&self, fp: Fingerprint) {
        let mut bits = self.bits.lock().unwrap_or_else(|p| p.into_inner());
        for i in 0..self.num_hashes as u64 {
            let bit = fp.nth(i) % self.num_bits;
            bits.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        bits.inserted += 1;
        if bits.inserted as usize == self.capacity + 1 {
            tracing::warn!(
                capacity = self.capacity,
                "bloom filter past sized capacity, false-positive rate degrades"
            );
        }
    }

    /// Clear every bit and the insert counter. Metrics survive.
    pub fn reset(&self) {
        let mut bits = self.bits.lock().unwrap_or_else(|p| p.into_inner());
        bits.words.fill(0);
        bits.inserted = 0;
    }

    /// Number of fingerprints inserted since the last reset.
    pub fn inserted(&self) -> u64 {
        self.bits.lock().unwrap_or_else(|p| p.into_inner()).inserted
    }

    /// Sized capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current gate counters.
    pub fn metrics(&self) -> BloomMetrics {
        *self.metrics.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a definitive miss (fast-path ingest).
    pub fn record_rejection(&self) {
        self.metrics.lock().unwrap_or_else(|p| p.into_inner()).bloom_rejections += 1;
    }

    /// Record a positive confirmed as a duplicate.
    pub fn record_confirmation(&self) {
        self.metrics.lock().unwrap_or_else(|p| p.into_inner()).semantic_confirmations += 1;
    }

    /// Record a positive the semantic comparison disproved.
    pub fn record_false_positive(&self) {
        self.metrics.lock().unwrap_or_else(|p| p.into_inner()).false_positive_count += 1;
    }
}

impl Default for BloomProxy {
    fn default() -> Self {
        Self::new(100_000, 0.01)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_noise() {
        assert_eq!(normalize_fact("  WAL   is\tfast \n"), "wal is fast");
        assert_eq!(
            Fingerprint::of("Arch", "WAL   is fast"),
            Fingerprint::of("arch", "wal is fast")
        );
        assert_ne!(Fingerprint::of("arch", "wal"), Fingerprint::of("arch", "fsync"));
    }

    #[test]
    fn empty_filter_rejects_everything() {
        let bloom = BloomProxy::new(1_000, 0.01);
        for i in 0..1_000 {
            let fp = Fingerprint::of("entity", &format!("fact number {i}"));
            assert!(!bloom.might_contain(fp));
        }
        // Soundness: everything inserted must be found
        let fp = Fingerprint::of("entity", "inserted fact");
        bloom.insert(fp);
        assert!(bloom.might_contain(fp));
    }

    #[test]
    fn inserted_fingerprints_always_match() {
        let bloom = BloomProxy::new(10_000, 0.01);
        let fps: Vec<Fingerprint> =
            (0..5_000).map(|i| Fingerprint::of("e", &format!("fact {i}"))).collect();
        for fp in &fps {
            bloom.insert(*fp);
        }
        assert!(fps.iter().all(|fp| bloom.might_contain(*fp)));
        assert_eq!(bloom.inserted(), 5_000);
    }

    #[test]
    fn false_positive_rate_is_near_target() {
        let bloom = BloomProxy::new(10_000, 0.01);
        for i in 0..10_000 {
            bloom.insert(Fingerprint::of("e", &format!("member {i}")));
        }
        let trials = 20_000;
        let fp_count = (0..trials)
            .filter(|i| bloom.might_contain(Fingerprint::of("e", &format!("stranger {i}"))))
            .count();
        let rate = fp_count as f64 / trials as f64;
        // Comfortably below 5x the 1% target
        assert!(rate < 0.05, "false positive rate {rate} too high");
    }

    #[test]
    fn reset_clears_membership() {
        let bloom = BloomProxy::new(100, 0.01);
        let fp = Fingerprint::of("e", "f");
        bloom.insert(fp);
        assert!(bloom.might_contain(fp));
        bloom.reset();
        assert!(!bloom.might_contain(fp));
        assert_eq!(bloom.inserted(), 0);
    }

    #[test]
    fn metrics_accumulate() {
        let bloom = BloomProxy::default();
        bloom.record_rejection();
        bloom.record_rejection();
        bloom.record_confirmation();
        bloom.record_false_positive();
        let m = bloom.metrics();
        assert_eq!((m.bloom_rejections, m.semantic_confirmations, m.false_positive_count), (2, 1, 1));
    }
}
