//! Deterministic selection randomness.
//!
//! Every honest member must derive the same participant subsets without
//! talking to each other, whichever client it runs. The generator is the
//! additive lagged Fibonacci source of Go's `math/rand`, with its seeding,
//! `Int63`, `Uint32`, `int31n`, `Int63n` and `Shuffle` reproduced value for
//! value. It is never used for key material or nonces.

mod cooked;

use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};

use crate::types::RunId;

use cooked::COOKED;

const REGISTER_LEN: usize = 607;
const REGISTER_TAP: usize = 273;
const INT63_MASK: u64 = (1 << 63) - 1;
const INT32_MAX: i64 = (1 << 31) - 1;

/// Seed shared by every attempt of a run: the first 8 bytes of
/// SHA-256(run id) read as a big-endian signed integer.
pub fn attempt_seed(run_id: &RunId) -> i64 {
    let digest = Sha256::digest(run_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(head)
}

/// Park-Miller step, `x * 48271 mod (2^31 - 1)` without overflow
fn seed_step(x: i64) -> i64 {
    const A: i64 = 48271;
    const Q: i64 = 44488;
    const R: i64 = 3399;

    let hi = x / Q;
    let lo = x % Q;
    let x = A * lo - R * hi;
    if x < 0 {
        x + INT32_MAX
    } else {
        x
    }
}

/// Seeded generator used only for participant selection
#[derive(Clone)]
pub struct SelectionRng {
    register: [u64; REGISTER_LEN],
    tap: usize,
    feed: usize,
}

impl std::fmt::Debug for SelectionRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionRng")
            .field("tap", &self.tap)
            .field("feed", &self.feed)
            .finish_non_exhaustive()
    }
}

impl SelectionRng {
    pub fn new(seed: i64) -> Self {
        let mut seed = seed % INT32_MAX;
        if seed < 0 {
            seed += INT32_MAX;
        }
        if seed == 0 {
            seed = 89_482_311;
        }

        let mut register = [0u64; REGISTER_LEN];
        let mut x = seed;
        for i in -20..REGISTER_LEN as i64 {
            x = seed_step(x);
            if i >= 0 {
                let mut u = (x as u64) << 40;
                x = seed_step(x);
                u ^= (x as u64) << 20;
                x = seed_step(x);
                u ^= x as u64;
                u ^= COOKED[i as usize] as u64;
                register[i as usize] = u;
            }
        }

        Self {
            register,
            tap: 0,
            feed: REGISTER_LEN - REGISTER_TAP,
        }
    }

    fn step(&mut self) -> u64 {
        self.tap = self.tap.checked_sub(1).unwrap_or(REGISTER_LEN - 1);
        self.feed = self.feed.checked_sub(1).unwrap_or(REGISTER_LEN - 1);
        let x = self.register[self.feed].wrapping_add(self.register[self.tap]);
        self.register[self.feed] = x;
        x
    }

    /// Non-negative 63-bit value
    pub fn int63(&mut self) -> i64 {
        (self.step() & INT63_MASK) as i64
    }

    /// Uniform value in `0..n` for `0 < n <= i32::MAX`, by multiply and
    /// reject
    pub fn int31n(&mut self, n: u32) -> u32 {
        debug_assert!(n > 0 && n <= INT32_MAX as u32);
        let n = u64::from(n);
        let mut product = u64::from(self.next_u32()) * n;
        let mut low = product & 0xffff_ffff;
        if low < n {
            let threshold = ((1u64 << 32) - n) % n;
            while low < threshold {
                product = u64::from(self.next_u32()) * n;
                low = product & 0xffff_ffff;
            }
        }
        (product >> 32) as u32
    }

    /// Uniform value in `0..n` for `n > 0`, by modulo and reject
    pub fn int63n(&mut self, n: i64) -> i64 {
        debug_assert!(n > 0);
        if n & (n - 1) == 0 {
            return self.int63() & (n - 1);
        }
        let max = (INT63_MASK - (1u64 << 63) % n as u64) as i64;
        let mut v = self.int63();
        while v > max {
            v = self.int63();
        }
        v % n
    }

    /// Fisher-Yates shuffle, walking from the back
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = if i >= INT32_MAX as usize {
                self.int63n(i as i64 + 1) as usize
            } else {
                self.int31n(i as u32 + 1) as usize
            };
            items.swap(i, j);
        }
    }
}

impl RngCore for SelectionRng {
    fn next_u32(&mut self) -> u32 {
        (self.int63() >> 31) as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.step()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for SelectionRng {
    /// Big-endian signed seed
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Self {
        Self::new(i64::from_be_bytes(seed))
    }

    fn seed_from_u64(state: u64) -> Self {
        Self::new(state as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_seed_is_deterministic() {
        let run = RunId::from_u64(100);
        assert_eq!(attempt_seed(&run), attempt_seed(&RunId::from_u64(100)));
        assert_ne!(attempt_seed(&run), attempt_seed(&RunId::from_u64(101)));
    }

    #[test]
    fn test_attempt_seed_reads_digest_prefix() {
        let run = RunId::from_u64(100);
        let digest = Sha256::digest([100u8]);
        let expected = i64::from_be_bytes(digest[..8].try_into().unwrap());
        assert_eq!(attempt_seed(&run), expected);
        assert_eq!(attempt_seed(&run), 1_777_864_617_686_472_329);
    }

    #[test]
    fn test_seed_one_output() {
        let mut rng = SelectionRng::new(1);
        assert_eq!(rng.int63(), 5_577_006_791_947_779_410);
        assert_eq!(rng.int63(), 8_674_665_223_082_153_551);
    }

    #[test]
    fn test_zero_seed_is_remapped() {
        let mut zero = SelectionRng::new(0);
        let mut remapped = SelectionRng::new(89_482_311);
        assert_eq!(zero.int63(), 8_717_895_732_742_165_505);
        assert_eq!(remapped.int63(), 8_717_895_732_742_165_505);
    }

    #[test]
    fn test_seeds_reduce_modulo_int32_max() {
        let mut a = SelectionRng::new(5);
        let mut b = SelectionRng::new(5 + INT32_MAX);
        assert_eq!(a.int63(), b.int63());
    }

    #[test]
    fn test_int31n_sequence() {
        let mut rng = SelectionRng::new(7);
        let drawn: Vec<u32> = [1, 2, 3, 10, 100, 1000]
            .iter()
            .map(|n| rng.int31n(*n))
            .collect();
        assert_eq!(drawn, vec![0, 0, 0, 9, 69, 146]);
    }

    #[test]
    fn test_shuffle_with_negative_seed() {
        let mut items: Vec<u32> = (0..10).collect();
        SelectionRng::new(-42).shuffle(&mut items);
        assert_eq!(items, vec![4, 2, 1, 0, 7, 9, 5, 3, 8, 6]);
    }

    #[test]
    fn test_same_seed_same_shuffle() {
        let mut a: Vec<u32> = (0..50).collect();
        let mut b = a.clone();
        SelectionRng::new(-42).shuffle(&mut a);
        SelectionRng::new(-42).shuffle(&mut b);
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_int63n_stays_in_range() {
        let mut rng = SelectionRng::new(11);
        for n in [1i64, 2, 3, 7, 64, 1000, i64::MAX] {
            let v = rng.int63n(n);
            assert!((0..n).contains(&v));
        }
    }

    #[test]
    fn test_seedable_from_be_bytes() {
        let mut a = SelectionRng::from_seed((-42i64).to_be_bytes());
        let mut b = SelectionRng::new(-42);
        assert_eq!(a.next_u64(), b.next_u64());
        assert_eq!(a.next_u32(), b.next_u32());
    }

    #[test]
    fn test_shuffle_trivial_slices() {
        let mut rng = SelectionRng::new(0);
        let mut empty: [u8; 0] = [];
        rng.shuffle(&mut empty);
        let mut one = [9u8];
        rng.shuffle(&mut one);
        assert_eq!(one, [9]);
    }
}
