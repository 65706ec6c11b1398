use rand::Rng;
use rand_distr::{Distribution, Uniform};
use rand_pcg::Pcg64Mcg;

pub type RngGen = Pcg64Mcg;

/// Picks lookup keys uniformly from `[1, record_count]`.
///
/// Each worker owns its own generator, so no synchronization is needed.
pub struct KeyGenerator {
    gen: RngGen,
    ids: Uniform<i64>,
}

impl KeyGenerator {
    /// Creates a generator seeded from the thread's RNG.
    ///
    /// `record_count` must not be zero (guaranteed by configuration
    /// validation).
    pub fn new(record_count: u64) -> Self {
        Self::with_seed(record_count, rand::thread_rng().gen())
    }

    pub fn with_seed(record_count: u64, seed: u128) -> Self {
        debug_assert!(record_count >= 1);
        Self {
            gen: RngGen::new(seed),
            ids: Uniform::new_inclusive(1, record_count.max(1) as i64),
        }
    }

    pub fn next_id(&mut self) -> i64 {
        self.ids.sample(&mut self.gen)
    }
}
