use rand::{rngs::StdRng, Error, Rng as _, RngCore, SeedableRng};
use serde::Serialize;

/// A seeded generator that remembers its seed.
///
/// Every worker owns one of these, so drawing never needs a lock.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Rng {
    seed: u64,
    #[serde(skip_serializing)]
    rng: StdRng,
}

impl Rng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw from `0..bound`. `bound` must be non-zero.
    pub fn below(&mut self, bound: usize) -> usize {
        self.rng.gen_range(0..bound)
    }
}

/// Derives the seed of thread `thread_id` from the experiment seed.
///
/// splitmix64 finalizer, so neighbouring thread ids get unrelated streams.
pub fn thread_seed(seed: u64, thread_id: usize) -> u64 {
    let mut z = seed.wrapping_add((thread_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl RngCore for Rng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.rng.try_fill_bytes(dest)
    }
}

impl Clone for Rng {
    fn clone(&self) -> Self {
        Self::from_seed(self.seed)
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::{thread_seed, Rng};

    #[test]
    fn test_rng_clone() {
        let mut rng = Rng::from_seed(0x42);
        let a = rng.next_u64();
        let mut cloned_rng = rng.clone();
        let b = cloned_rng.next_u64();
        assert_eq!(a, b, "Cloned Rng should start with the same seed");
    }

    #[test]
    fn test_below_in_range() {
        let mut rng = Rng::from_seed(7);
        for bound in 1..50 {
            assert!(rng.below(bound) < bound);
        }
    }

    #[test]
    fn test_thread_seeds_differ() {
        let seeds: Vec<u64> = (0..8).map(|t| thread_seed(1234, t)).collect();
        for (i, a) in seeds.iter().enumerate() {
            for b in &seeds[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(thread_seed(1234, 3), thread_seed(1234, 3));
    }
}
