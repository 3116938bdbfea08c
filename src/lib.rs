#![deny(missing_docs)]
//! # cosmotion
//!
//! `cosmotion` turns pairwise interaction events between accounts into an
//! implicit-feedback factorization model and exports the learned item
//! embeddings: every account that shows up as an interaction target gets a
//! latent vector, and accounts with similar counterparties end up close
//! together.
//!
//! The pipeline is: index the raw keys, build a sparse interaction matrix,
//! hold out a test set, search a hyperparameter grid with a BPR model scored
//! by AUC@K, and write the winning item factors to aligned TSV files.
//!
//! ## Example
//!
//! ```rust
//! # use rand::SeedableRng;
//! use cosmotion::data::{train_test_split, DuplicatePolicy, MatrixBuilder, RawInteraction};
//! use cosmotion::evaluation::AucAtK;
//! use cosmotion::models::factorization::BprFactorizer;
//! use cosmotion::models::{HyperparameterConfig, TrainerOptions};
//! use cosmotion::search::{SearchOptions, SearchSpace};
//! use cosmotion::RankingModel;
//!
//! let mut events = Vec::new();
//! for user in 0..20 {
//!     for item in 0..5 {
//!         events.push(RawInteraction::new(
//!             format!("user-{}", user),
//!             format!("item-{}", (user + item) % 12),
//!             1.0,
//!         ));
//!     }
//! }
//!
//! let mut builder = MatrixBuilder::default();
//! builder.extend(events, DuplicatePolicy::Accumulate).unwrap();
//! let (data, indices, _summary) = builder.finish();
//!
//! let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(42);
//! let (train, test) = train_test_split(&data, &mut rng, 0.2).unwrap();
//! let (train, test) = (train.to_compressed(), test.to_compressed());
//!
//! let space = SearchSpace::single(HyperparameterConfig::new(8, 20, 0.01, 0.05).unwrap());
//! let trainer = BprFactorizer::new(TrainerOptions::default().num_threads(1).seed(7));
//! let evaluator = AucAtK::new(5);
//!
//! let outcome = space
//!     .search(&trainer, &evaluator, &train, &test, &SearchOptions::default())
//!     .unwrap();
//!
//! assert_eq!(outcome.best.model.num_items(), indices.items.len());
//! ```
pub mod config;
pub mod data;
pub mod evaluation;
pub mod events;
pub mod export;
pub mod index;
pub mod models;
pub mod pipeline;
pub mod projection;
pub mod search;

use failure::Fail;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;
/// Alias for timestamps, in seconds since the Unix epoch.
pub type Timestamp = i64;

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// The user is outside the model's user range.
    #[fail(display = "Unknown user index: {}", _0)]
    UnknownUser(UserId),
    /// An item is outside the model's item range.
    #[fail(display = "Unknown item index: {}", _0)]
    UnknownItem(ItemId),
}

/// Trait describing models that can score items for a known user.
pub trait RankingModel {
    /// Number of users the model holds representations for.
    fn num_users(&self) -> usize;
    /// Number of items the model holds representations for.
    fn num_items(&self) -> usize;
    /// Score `item_ids` for `user_id`: higher means a stronger predicted
    /// affinity.
    fn predict(&self, user_id: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError>;
}
