//! Models module.
use failure::Fail;
use serde::Serialize;

use crate::data::CompressedInteractions;

pub mod factorization;

pub use self::factorization::FactorizationModel;

/// Fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// The training matrix has no users, no items, or no interactions.
    #[fail(display = "Empty training set: no interactions to fit on.")]
    EmptyTrainingSet,
    /// The worker pool could not be started.
    #[fail(display = "Unable to start training threads: {}", _0)]
    ThreadPool(String),
    /// User and item factors disagree on the latent dimensionality.
    #[fail(
        display = "Factor dimensionality mismatch: users have {}, items have {}.",
        _0, _1
    )]
    DimensionMismatch(usize, usize),
}

/// Hyperparameter validation errors.
#[derive(Debug, Fail)]
pub enum HyperparameterError {
    /// A hyperparameter is outside its admissible range.
    #[fail(display = "Invalid {}: {} ({})", name, value, expected)]
    OutOfRange {
        /// Hyperparameter name.
        name: &'static str,
        /// The rejected value.
        value: String,
        /// The admissible range.
        expected: &'static str,
    },
}

/// One point of the hyperparameter grid.
///
/// Validated at construction and immutable afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HyperparameterConfig {
    factors: usize,
    iterations: usize,
    regularization: f32,
    learning_rate: f32,
}

impl HyperparameterConfig {
    /// Build a new configuration.
    ///
    /// `factors` and `iterations` must be positive, `regularization` finite
    /// and non-negative, `learning_rate` finite and positive.
    pub fn new(
        factors: usize,
        iterations: usize,
        regularization: f32,
        learning_rate: f32,
    ) -> Result<Self, HyperparameterError> {
        if factors == 0 {
            return Err(out_of_range("factors", factors, "> 0"));
        }
        if iterations == 0 {
            return Err(out_of_range("iterations", iterations, "> 0"));
        }
        if !(regularization.is_finite() && regularization >= 0.0) {
            return Err(out_of_range("regularization", regularization, ">= 0"));
        }
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(out_of_range("learning rate", learning_rate, "> 0"));
        }

        Ok(HyperparameterConfig {
            factors,
            iterations,
            regularization,
            learning_rate,
        })
    }

    /// Latent dimensionality.
    pub fn factors(&self) -> usize {
        self.factors
    }

    /// Number of passes over the training interactions.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// L2 penalty.
    pub fn regularization(&self) -> f32 {
        self.regularization
    }

    /// SGD step size.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

fn out_of_range<T: ToString>(
    name: &'static str,
    value: T,
    expected: &'static str,
) -> HyperparameterError {
    HyperparameterError::OutOfRange {
        name,
        value: value.to_string(),
        expected,
    }
}

/// Resolve a thread-count setting into a positive number of workers.
///
/// Positive values are taken as is, `0` means every core, and negative
/// values count back from the number of cores: `-1` is every core, `-2`
/// every core but one, never going below one thread.
pub fn resolve_num_threads(num_threads: isize, num_cores: usize) -> usize {
    let num_cores = num_cores.max(1) as isize;

    let resolved = match num_threads {
        n if n > 0 => n,
        0 => num_cores,
        n => num_cores + 1 + n,
    };

    resolved.max(1) as usize
}

/// Settings of the trainer that are not searched over.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrainerOptions {
    verify_negative_samples: bool,
    num_threads: isize,
    seed: Option<u64>,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        TrainerOptions {
            verify_negative_samples: true,
            num_threads: 1,
            seed: None,
        }
    }
}

impl TrainerOptions {
    /// Whether to reject sampled negatives the user actually interacted
    /// with.
    pub fn verify_negative_samples(mut self, verify: bool) -> Self {
        self.verify_negative_samples = verify;
        self
    }

    /// Set number of threads to be used, see [`resolve_num_threads`].
    pub fn num_threads(mut self, num_threads: isize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Seed the initialisation and sampling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Whether negatives are verified.
    pub fn verifies_negative_samples(&self) -> bool {
        self.verify_negative_samples
    }

    /// Number of worker threads on this machine.
    pub fn resolved_num_threads(&self) -> usize {
        let num_cores = std::thread::available_parallelism()
            .map(|x| x.get())
            .unwrap_or(1);

        resolve_num_threads(self.num_threads, num_cores)
    }

    /// The configured seed, if any.
    pub fn seed_value(&self) -> Option<u64> {
        self.seed
    }
}

/// A latent-factor learning algorithm.
///
/// Implementations must not keep state between calls, so one instance can
/// fit several configurations, possibly concurrently.
pub trait Factorizer: Sync {
    /// Fit a fresh model on `interactions` under `config`.
    fn fit(
        &self,
        interactions: &CompressedInteractions,
        config: &HyperparameterConfig,
    ) -> Result<FactorizationModel, FittingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(HyperparameterConfig::new(2, 50, 0.0, 0.01).is_ok());
        assert!(HyperparameterConfig::new(0, 50, 0.01, 0.01).is_err());
        assert!(HyperparameterConfig::new(2, 0, 0.01, 0.01).is_err());
        assert!(HyperparameterConfig::new(2, 50, -0.1, 0.01).is_err());
        assert!(HyperparameterConfig::new(2, 50, 0.01, 0.0).is_err());
        assert!(HyperparameterConfig::new(2, 50, 0.01, f32::NAN).is_err());
    }

    #[test]
    fn thread_resolution() {
        assert_eq!(resolve_num_threads(3, 8), 3);
        assert_eq!(resolve_num_threads(0, 8), 8);
        assert_eq!(resolve_num_threads(-1, 8), 8);
        assert_eq!(resolve_num_threads(-2, 8), 7);
        assert_eq!(resolve_num_threads(-2, 1), 1);
        assert_eq!(resolve_num_threads(-20, 8), 1);
    }
}
