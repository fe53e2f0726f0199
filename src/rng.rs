//! Randomness for retransmission jitter.
//!
//! Seeded through [`Config::rng_seed`](crate::Config::rng_seed) the resend
//! schedule is reproducible. Key material never comes from here; it is always
//! drawn from the operating system.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(crate) struct SeededRng {
    inner: StdRng,
    seeded: bool,
}

impl SeededRng {
    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => SeededRng {
                inner: StdRng::seed_from_u64(seed),
                seeded: true,
            },
            None => SeededRng {
                inner: StdRng::from_entropy(),
                seeded: false,
            },
        }
    }

    /// Uniform value in `[0, 1)`.
    pub fn unit(&mut self) -> f32 {
        self.inner.gen()
    }
}

impl fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededRng")
            .field("seeded", &self.seeded)
            .finish_non_exhaustive()
    }
}
