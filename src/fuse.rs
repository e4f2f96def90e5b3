//! Binary fuse filter: approximate membership over 64-bit keys.
//!
//! # Overview
//!
//! A 3-wise binary fuse filter stores one fingerprint per cell and answers
//! `contains(key)` with no false negatives and a false-positive rate of
//! about `2^-bits` for the chosen fingerprint width (`u8`, `u16`, `u32`).
//! Construction peels a 3-uniform hypergraph: every key maps to three cells,
//! cells with exactly one remaining key are peeled in turn, and fingerprints
//! are assigned in reverse peel order so that for every inserted key
//!
//! ```text
//! fingerprint(hash) ^ fp[h0] ^ fp[h1] ^ fp[h2] == 0
//! ```
//!
//! # Invariants
//! - `segment_length` is a power of two, at most `2^18`.
//! - `fingerprints.len() == (segment_count + 2) * segment_length`.
//! - After a successful `populate`, every inserted key is contained.
//! - The filter is immutable after construction; concurrent reads are
//!   unrestricted.
//!
//! # Construction notes
//!
//! Cells track `{count, signature}` packed as: key degree in the upper six
//! bits of a byte, XOR of the key's slot indices (0, 1, 2) in the low two
//! bits, and the XOR of the keys' hashes in a parallel `u64` array. Two
//! identical hashes in one cell cancel their signatures; that shows up as a
//! zero signature with degree two and is handled by un-adding the second
//! copy and counting it as a duplicate. A failed peel re-seeds the hash via
//! `splitmix64` and retries from scratch, which is why key iteration must be
//! restartable (`Clone + ExactSizeIterator`); after 100 failed seeds the
//! build reports [`FilterError::KeysLikelyNotUnique`].
//!
//! Transient build arrays are `O(capacity)` and scoped to the populate call;
//! they are allocated fallibly so an oversized build surfaces
//! [`FilterError::OutOfMemory`] instead of aborting.

use std::ops::BitXor;

const ARITY: u32 = 3;
const MAX_ITERATIONS: u32 = 100;

/// Fixed starting point for the seed walk so identical key sets build
/// identical filters.
const DEFAULT_BUILD_SEED: u64 = 0x33d2_7c5e_1a90_7b46;

/// Errors surfaced by filter construction.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum FilterError {
    /// A transient construction array could not be allocated.
    OutOfMemory,
    /// 100 seeds failed to peel; the key set almost certainly contains more
    /// than two copies of some key.
    KeysLikelyNotUnique,
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "filter construction allocation failed"),
            Self::KeysLikelyNotUnique => {
                write!(f, "filter construction failed; keys are likely not unique")
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// Fingerprint storage width. Implemented for `u8`, `u16`, and `u32`,
/// giving false-positive rates of roughly `2^-8`, `2^-16`, and `2^-32`.
pub trait Fingerprint: Copy + Default + Eq + BitXor<Output = Self> {
    /// Folds a 64-bit hash into the fingerprint width.
    fn fold(hash: u64) -> Self;
}

impl Fingerprint for u8 {
    #[inline]
    fn fold(hash: u64) -> Self {
        (hash ^ (hash >> 32)) as u8
    }
}

impl Fingerprint for u16 {
    #[inline]
    fn fold(hash: u64) -> Self {
        (hash ^ (hash >> 32)) as u16
    }
}

impl Fingerprint for u32 {
    #[inline]
    fn fold(hash: u64) -> Self {
        (hash ^ (hash >> 32)) as u32
    }
}

/// 3-wise binary fuse filter with fingerprint width `F`.
///
/// Build once with [`populate`](Self::populate), then query read-only from
/// any number of threads.
///
/// # Examples
///
/// ```
/// use stdx::fuse::BinaryFuse8;
///
/// let keys: Vec<u64> = (0..10_000).collect();
/// let filter = BinaryFuse8::populate(&keys).unwrap();
/// assert!(keys.iter().all(|&k| filter.contains(k)));
/// ```
pub struct BinaryFuse<F> {
    seed: u64,
    segment_length: u32,
    segment_length_mask: u32,
    segment_count: u32,
    segment_count_length: u32,
    fingerprints: Box<[F]>,
}

/// ~0.39% false-positive rate.
pub type BinaryFuse8 = BinaryFuse<u8>;
/// ~0.0015% false-positive rate.
pub type BinaryFuse16 = BinaryFuse<u16>;
/// Negligible false-positive rate at four bytes per key slot.
pub type BinaryFuse32 = BinaryFuse<u32>;

impl<F: Fingerprint> BinaryFuse<F> {
    /// Builds a filter over `keys`. At most two copies of any key are
    /// tolerated; see [`FilterError::KeysLikelyNotUnique`].
    pub fn populate(keys: &[u64]) -> Result<Self, FilterError> {
        Self::populate_iter(keys.iter().copied())
    }

    /// Builds a filter from a restartable key iterator.
    ///
    /// The construction loop walks the keys once per seed attempt; `Clone`
    /// is the restartability contract and `ExactSizeIterator` sizes the
    /// filter up front. Every pass must yield the same sequence.
    pub fn populate_iter<I>(keys: I) -> Result<Self, FilterError>
    where
        I: Iterator<Item = u64> + ExactSizeIterator + Clone,
    {
        Self::populate_with_seed(keys, DEFAULT_BUILD_SEED)
    }

    /// Builds with an explicit PRNG seed for the construction's seed walk.
    ///
    /// Two builds over the same keys and the same `rng_seed` produce
    /// identical fingerprint arrays.
    pub fn populate_with_seed<I>(keys: I, rng_seed: u64) -> Result<Self, FilterError>
    where
        I: Iterator<Item = u64> + ExactSizeIterator + Clone,
    {
        let size = keys.len();
        assert!(size <= u32::MAX as usize, "key count exceeds u32 range");
        let size = size as u32;

        let mut filter = Self::with_size(size)?;
        let array_len = filter.fingerprints.len();

        // Transient peeling state, released on return.
        let mut t2count: Vec<u8> = try_zeroed(array_len)?;
        let mut t2hash: Vec<u64> = try_zeroed(array_len)?;
        let mut alone: Vec<u32> = try_with_capacity(array_len)?;
        let mut reverse_order: Vec<u64> = try_with_capacity(size as usize)?;
        let mut reverse_h: Vec<u8> = try_with_capacity(size as usize)?;

        let mut rng = rng_seed;
        filter.seed = splitmix64(&mut rng);

        for _ in 0..MAX_ITERATIONS {
            let mut duplicates = 0u32;
            let mut degree_overflow = false;
            let mut counted = 0usize;

            for key in keys.clone() {
                counted += 1;
                let hash = mix(key, filter.seed);
                let (h0, h1, h2) = filter.cells(hash);
                let (h0, h1, h2) = (h0 as usize, h1 as usize, h2 as usize);

                t2count[h0] = t2count[h0].wrapping_add(4);
                t2hash[h0] ^= hash;
                t2count[h1] = t2count[h1].wrapping_add(4);
                t2count[h1] ^= 1;
                t2hash[h1] ^= hash;
                t2count[h2] = t2count[h2].wrapping_add(4);
                t2count[h2] ^= 2;
                t2hash[h2] ^= hash;

                // Two copies of one hash cancel their signatures. A zero
                // signature at degree two identifies the pair; un-add the
                // second copy so the peel sees each hash once.
                if t2hash[h0] & t2hash[h1] & t2hash[h2] == 0 {
                    if (t2hash[h0] == 0 && t2count[h0] >> 2 == 2)
                        || (t2hash[h1] == 0 && t2count[h1] >> 2 == 2)
                        || (t2hash[h2] == 0 && t2count[h2] >> 2 == 2)
                    {
                        duplicates += 1;
                        t2count[h0] = t2count[h0].wrapping_sub(4);
                        t2hash[h0] ^= hash;
                        t2count[h1] = t2count[h1].wrapping_sub(4);
                        t2count[h1] ^= 1;
                        t2hash[h1] ^= hash;
                        t2count[h2] = t2count[h2].wrapping_sub(4);
                        t2count[h2] ^= 2;
                        t2hash[h2] ^= hash;
                    }
                }

                // A cell degree past 63 wraps the packed counter.
                degree_overflow |= t2count[h0] < 4 || t2count[h1] < 4 || t2count[h2] < 4;
            }
            debug_assert_eq!(
                counted, size as usize,
                "key iterator must be restartable and yield len() items"
            );

            if !degree_overflow {
                alone.clear();
                for (i, &count) in t2count.iter().enumerate() {
                    if count >> 2 == 1 {
                        alone.push(i as u32);
                    }
                }

                reverse_order.clear();
                reverse_h.clear();
                while let Some(index) = alone.pop() {
                    let index = index as usize;
                    if t2count[index] >> 2 != 1 {
                        continue;
                    }
                    // The last remaining key's hash is the cell signature,
                    // and the low bits name which of its three cells this is.
                    let hash = t2hash[index];
                    let found = t2count[index] & 3;
                    reverse_h.push(found);
                    reverse_order.push(hash);

                    let (h0, h1, h2) = filter.cells(hash);
                    let h012 = [h0, h1, h2, h0, h1];
                    for off in 1..=2u8 {
                        let other = h012[(found + off) as usize] as usize;
                        if t2count[other] >> 2 == 2 {
                            alone.push(other as u32);
                        }
                        t2count[other] = t2count[other].wrapping_sub(4);
                        t2count[other] ^= mod3(found + off);
                        t2hash[other] ^= hash;
                    }
                }

                if reverse_order.len() as u32 + duplicates == size {
                    // Assign fingerprints in reverse peel order: each key's
                    // own cell absorbs whatever its two other cells hold.
                    for i in (0..reverse_order.len()).rev() {
                        let hash = reverse_order[i];
                        let found = reverse_h[i];
                        let fp = F::fold(hash);
                        let (h0, h1, h2) = filter.cells(hash);
                        let h012 = [h0, h1, h2, h0, h1];
                        let cell = h012[found as usize] as usize;
                        let other1 = h012[(found + 1) as usize] as usize;
                        let other2 = h012[(found + 2) as usize] as usize;
                        filter.fingerprints[cell] =
                            fp ^ filter.fingerprints[other1] ^ filter.fingerprints[other2];
                    }
                    return Ok(filter);
                }
            }

            // Failed peel: new seed, clean slate.
            filter.seed = splitmix64(&mut rng);
            t2count.fill(0);
            t2hash.fill(0);
        }

        Err(FilterError::KeysLikelyNotUnique)
    }

    /// Returns true when `key` may be in the set; never false for an
    /// inserted key.
    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        let hash = mix(key, self.seed);
        let (h0, h1, h2) = self.cells(hash);
        let fp = F::fold(hash)
            ^ self.fingerprints[h0 as usize]
            ^ self.fingerprints[h1 as usize]
            ^ self.fingerprints[h2 as usize];
        fp == F::default()
    }

    /// Total memory footprint: the fingerprint array plus the struct itself.
    pub fn size_in_bytes(&self) -> usize {
        self.fingerprints.len() * std::mem::size_of::<F>() + std::mem::size_of::<Self>()
    }

    /// Number of fingerprint cells.
    pub fn fingerprint_count(&self) -> usize {
        self.fingerprints.len()
    }

    /// Seed the successful build settled on.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Sizes an empty filter for `size` keys and allocates zeroed
    /// fingerprints.
    fn with_size(size: u32) -> Result<Self, FilterError> {
        let segment_length = segment_length_for(size).clamp(4, 1 << 18);

        let size_factor = if size <= 1 { 0.0 } else { size_factor_for(size) };
        let capacity = if size <= 1 {
            0
        } else {
            (size as f64 * size_factor).round() as u32
        };

        // Two rounding passes pin down the segment count: first from the
        // padded capacity, then re-derived from the aligned array length.
        let init_segment_count =
            ((capacity + segment_length - 1) / segment_length).saturating_sub(ARITY - 1);
        let array_length = (init_segment_count + ARITY - 1) * segment_length;
        let mut segment_count = (array_length + segment_length - 1) / segment_length;
        segment_count = if segment_count <= ARITY - 1 {
            1
        } else {
            segment_count - (ARITY - 1)
        };
        let array_length = (segment_count + ARITY - 1) * segment_length;
        let segment_count_length = segment_count * segment_length;

        let fingerprints: Vec<F> = try_zeroed(array_length as usize)?;

        Ok(Self {
            seed: 0,
            segment_length,
            segment_length_mask: segment_length - 1,
            segment_count,
            segment_count_length,
            fingerprints: fingerprints.into_boxed_slice(),
        })
    }

    /// The three cells for a hash, one per consecutive segment window.
    #[inline]
    fn cells(&self, hash: u64) -> (u32, u32, u32) {
        let hi = mulhi(hash, self.segment_count_length as u64) as u32;
        let h0 = hi;
        let mut h1 = h0 + self.segment_length;
        let mut h2 = h1 + self.segment_length;
        h1 ^= ((hash >> 18) as u32) & self.segment_length_mask;
        h2 ^= (hash as u32) & self.segment_length_mask;
        (h0, h1, h2)
    }

    /// Single-cell variant of [`cells`](Self::cells); `index` must be 0, 1,
    /// or 2 (the shift below is only defined for those).
    #[inline]
    #[allow(dead_code)]
    fn cell_index(&self, index: u32, hash: u64) -> u32 {
        debug_assert!(index < ARITY);
        let mut h = mulhi(hash, self.segment_count_length as u64);
        h += (index * self.segment_length) as u64;
        let hh = hash & ((1u64 << 36) - 1);
        h ^= (hh >> (36 - 18 * index)) & self.segment_length_mask as u64;
        h as u32
    }
}

impl<F: Fingerprint> std::fmt::Debug for BinaryFuse<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryFuse")
            .field("seed", &self.seed)
            .field("segment_length", &self.segment_length)
            .field("segment_count", &self.segment_count)
            .field("fingerprints", &self.fingerprints.len())
            .finish()
    }
}

/// `2^floor(ln(size) / ln(3.33) + 2.25)`, before clamping.
fn segment_length_for(size: u32) -> u32 {
    if size == 0 {
        return 4;
    }
    let exponent = ((size as f64).ln() / 3.33f64.ln() + 2.25).floor();
    if exponent >= 31.0 {
        // Unreachable for u32 sizes; the clamp would cap it anyway.
        return 1 << 18;
    }
    1u32 << exponent as u32
}

/// `max(1.125, 0.875 + 0.25 * ln(1e6) / ln(size))`.
fn size_factor_for(size: u32) -> f64 {
    let factor = 0.875 + 0.25 * 1_000_000f64.ln() / (size as f64).ln();
    factor.max(1.125)
}

/// High 64 bits of the 128-bit product; maps a hash into `[0, p)` without
/// division.
#[inline]
fn mulhi(a: u64, b: u64) -> u64 {
    (((a as u128) * (b as u128)) >> 64) as u64
}

/// 64-bit finalizer over `key + seed`.
#[inline]
fn mix(key: u64, seed: u64) -> u64 {
    let mut h = key.wrapping_add(seed);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

#[inline]
fn mod3(x: u8) -> u8 {
    if x > 2 {
        x - 3
    } else {
        x
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn try_zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>, FilterError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| FilterError::OutOfMemory)?;
    v.resize(len, T::default());
    Ok(v)
}

fn try_with_capacity<T>(cap: usize) -> Result<Vec<T>, FilterError> {
    let mut v = Vec::new();
    v.try_reserve_exact(cap).map_err(|_| FilterError::OutOfMemory)?;
    Ok(v)
}
