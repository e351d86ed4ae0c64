use rand::{rngs::StdRng, Rng, SeedableRng};

/// Source of variant choices for new assignments.
///
/// The default is [`RandomChoice`], which picks uniformly at random. Tests can supply a closure to
/// get deterministic outcomes:
///
/// ```
/// # use clutch::ClientConfig;
/// let config = ClientConfig::from_app_key("app-key").choice_source(|_num_choices: usize| 0);
/// ```
pub trait ChoiceSource {
    /// Pick a variant index in `0..num_choices`. `num_choices` is always at least 1.
    fn choose(&mut self, num_choices: usize) -> usize;
}

/// Uniform random choice. Not cryptographically strong: fairness across installations is the
/// goal, not resistance to prediction.
pub struct RandomChoice<R = StdRng> {
    rng: R,
}

impl RandomChoice {
    /// Seeded from operating system entropy, once per process.
    pub fn from_entropy() -> RandomChoice {
        RandomChoice {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded with a fixed value, for reproducible sequences.
    pub fn seeded(seed: u64) -> RandomChoice {
        RandomChoice {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<R: Rng> RandomChoice<R> {
    /// Use the provided generator.
    pub fn with_rng(rng: R) -> RandomChoice<R> {
        RandomChoice { rng }
    }
}

impl<R: Rng> ChoiceSource for RandomChoice<R> {
    fn choose(&mut self, num_choices: usize) -> usize {
        self.rng.gen_range(0..num_choices)
    }
}

impl<T: FnMut(usize) -> usize> ChoiceSource for T {
    fn choose(&mut self, num_choices: usize) -> usize {
        self(num_choices)
    }
}
