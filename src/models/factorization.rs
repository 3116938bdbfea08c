//! Bayesian personalised ranking (BPR) matrix factorization.
//!
//! Every user and item gets a latent vector; the affinity of a user for an
//! item is the dot product of the two. Training repeatedly samples an
//! observed (user, positive item) pair together with a random negative item
//! and minimises
//!
//! ```text
//! sigmoid(x_uj - x_ui)
//! ```
//!
//! with SGD and an L2 penalty on the touched rows. The factors live in
//! `wyrm` hogwild parameters: every worker thread builds its own graph over
//! the shared embeddings and updates them without locking.
use std::sync::Arc;

use ndarray::Array2;
use rand::distributions::{Distribution, Uniform};
use rand::{thread_rng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use tracing::debug;
use wyrm::optim::Optimizer;
use wyrm::DataInput;

use super::{Factorizer, FittingError, HyperparameterConfig, TrainerOptions};
use crate::data::CompressedInteractions;
use crate::{ItemId, PredictionError, RankingModel, UserId};

fn embedding_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> wyrm::Arr {
    let scale = 1.0 / cols as f32;
    wyrm::Arr::zeros((rows, cols)).map(|_| rng.sample::<f32, _>(StandardNormal) * scale)
}

fn to_array(parameter: &wyrm::HogwildParameter, rows: usize, cols: usize) -> Array2<f32> {
    let values = parameter.value();
    Array2::from_shape_fn((rows, cols), |index| values[index])
}

#[derive(Clone, Copy, Debug, Default)]
struct EpochStats {
    samples: usize,
    correct: usize,
    skipped: usize,
}

impl EpochStats {
    fn merge(self, other: EpochStats) -> EpochStats {
        EpochStats {
            samples: self.samples + other.samples,
            correct: self.correct + other.correct,
            skipped: self.skipped + other.skipped,
        }
    }

    fn correct_fraction(&self) -> f32 {
        self.correct as f32 / self.samples.max(1) as f32
    }

    fn skipped_fraction(&self) -> f32 {
        self.skipped as f32 / (self.samples + self.skipped).max(1) as f32
    }
}

/// A fitted factorization: one latent vector per user and per item, rows
/// aligned with the user and item indices.
#[derive(Clone, Debug)]
pub struct FactorizationModel {
    config: HyperparameterConfig,
    user_factors: Array2<f32>,
    item_factors: Array2<f32>,
}

impl FactorizationModel {
    /// Assemble a model from existing factor matrices.
    pub fn new(
        config: HyperparameterConfig,
        user_factors: Array2<f32>,
        item_factors: Array2<f32>,
    ) -> Result<Self, FittingError> {
        if user_factors.ncols() != item_factors.ncols() {
            return Err(FittingError::DimensionMismatch(
                user_factors.ncols(),
                item_factors.ncols(),
            ));
        }

        Ok(FactorizationModel {
            config,
            user_factors,
            item_factors,
        })
    }

    /// The configuration the model was trained with.
    pub fn config(&self) -> &HyperparameterConfig {
        &self.config
    }

    /// User factors, `num_users x factors`.
    pub fn user_factors(&self) -> &Array2<f32> {
        &self.user_factors
    }

    /// Item factors, `num_items x factors`.
    pub fn item_factors(&self) -> &Array2<f32> {
        &self.item_factors
    }

    /// Scores of every item for `user_id`, in item index order.
    pub fn predict_all(&self, user_id: UserId) -> Result<Vec<f32>, PredictionError> {
        if user_id >= self.user_factors.nrows() {
            return Err(PredictionError::UnknownUser(user_id));
        }

        let user = self.user_factors.row(user_id);
        let predictions = self.item_factors.dot(&user);

        if predictions.iter().all(|x| x.is_finite()) {
            Ok(predictions.to_vec())
        } else {
            Err(PredictionError::InvalidPredictionValue)
        }
    }
}

impl RankingModel for FactorizationModel {
    fn num_users(&self) -> usize {
        self.user_factors.nrows()
    }

    fn num_items(&self) -> usize {
        self.item_factors.nrows()
    }

    fn predict(&self, user_id: UserId, item_ids: &[ItemId]) -> Result<Vec<f32>, PredictionError> {
        if user_id >= self.user_factors.nrows() {
            return Err(PredictionError::UnknownUser(user_id));
        }

        let user = self.user_factors.row(user_id);

        item_ids
            .iter()
            .map(|&item_id| {
                if item_id >= self.item_factors.nrows() {
                    return Err(PredictionError::UnknownItem(item_id));
                }

                let prediction = self.item_factors.row(item_id).dot(&user);

                if prediction.is_finite() {
                    Ok(prediction)
                } else {
                    Err(PredictionError::InvalidPredictionValue)
                }
            })
            .collect()
    }
}

/// Trains [`FactorizationModel`]s with BPR and hogwild SGD over `wyrm`
/// parameters.
#[derive(Clone, Debug, Default)]
pub struct BprFactorizer {
    options: TrainerOptions,
}

impl BprFactorizer {
    /// Build a new trainer.
    pub fn new(options: TrainerOptions) -> Self {
        BprFactorizer { options }
    }

    /// The trainer settings.
    pub fn options(&self) -> &TrainerOptions {
        &self.options
    }

    fn run_worker<R: Rng>(
        &self,
        interactions: &CompressedInteractions,
        user_factors: &Arc<wyrm::HogwildParameter>,
        item_factors: &Arc<wyrm::HogwildParameter>,
        config: &HyperparameterConfig,
        num_samples: usize,
        rng: &mut R,
    ) -> EpochStats {
        let verify = self.options.verifies_negative_samples();

        let sample_range = Uniform::new(0, interactions.nnz());
        let negative_item_range = Uniform::new(0, interactions.num_items());

        let user_embeddings = wyrm::ParameterNode::shared(user_factors.clone());
        let item_embeddings = wyrm::ParameterNode::shared(item_factors.clone());

        let user_idx = wyrm::IndexInputNode::new(&[0]);
        let positive_idx = wyrm::IndexInputNode::new(&[0]);
        let negative_idx = wyrm::IndexInputNode::new(&[0]);

        let user = user_embeddings.index(&user_idx);
        let positive = item_embeddings.index(&positive_idx);
        let negative = item_embeddings.index(&negative_idx);

        let mut loss = (user.vector_dot(&negative) - user.vector_dot(&positive)).sigmoid();

        let optimizer = wyrm::optim::SGD::new()
            .learning_rate(config.learning_rate())
            .l2_penalty(config.regularization());

        let mut stats = EpochStats::default();

        for _ in 0..num_samples {
            let (user_id, positive_id) = interactions.entry(sample_range.sample(rng));
            let negative_id = negative_item_range.sample(rng);

            if verify && interactions.contains(user_id, negative_id) {
                stats.skipped += 1;
                continue;
            }

            user_idx.set_value(user_id);
            positive_idx.set_value(positive_id);
            negative_idx.set_value(negative_id);

            loss.forward();

            if loss.value().scalar_sum() < 0.5 {
                stats.correct += 1;
            }

            loss.backward(1.0);
            optimizer.step(loss.parameters());
            loss.zero_gradient();

            stats.samples += 1;
        }

        stats
    }
}

impl Factorizer for BprFactorizer {
    fn fit(
        &self,
        interactions: &CompressedInteractions,
        config: &HyperparameterConfig,
    ) -> Result<FactorizationModel, FittingError> {
        let (num_users, num_items) = interactions.shape();
        let nnz = interactions.nnz();

        if num_users == 0 || num_items == 0 || nnz == 0 {
            return Err(FittingError::EmptyTrainingSet);
        }

        let mut rng = match self.options.seed_value() {
            Some(seed) => XorShiftRng::seed_from_u64(seed),
            None => XorShiftRng::seed_from_u64(thread_rng().gen()),
        };

        let user_factors = Arc::new(wyrm::HogwildParameter::new(embedding_init(
            num_users,
            config.factors(),
            &mut rng,
        )));
        let item_factors = Arc::new(wyrm::HogwildParameter::new(embedding_init(
            num_items,
            config.factors(),
            &mut rng,
        )));

        let num_threads = self.options.resolved_num_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|err| FittingError::ThreadPool(err.to_string()))?;

        let mut last = EpochStats::default();

        for epoch in 0..config.iterations() {
            let seeds: Vec<u64> = (0..num_threads).map(|_| rng.gen()).collect();

            let stats = pool.install(|| {
                seeds
                    .par_iter()
                    .enumerate()
                    .map(|(worker, &seed)| {
                        let num_samples =
                            nnz / num_threads + if worker < nnz % num_threads { 1 } else { 0 };
                        let mut thread_rng = XorShiftRng::seed_from_u64(seed);

                        self.run_worker(
                            interactions,
                            &user_factors,
                            &item_factors,
                            config,
                            num_samples,
                            &mut thread_rng,
                        )
                    })
                    .reduce(EpochStats::default, EpochStats::merge)
            });

            debug!(
                epoch,
                correct = stats.correct_fraction(),
                skipped = stats.skipped_fraction(),
                "BPR epoch"
            );

            last = stats;
        }

        debug!(
            users = num_users,
            items = num_items,
            factors = config.factors(),
            threads = num_threads,
            correct = last.correct_fraction(),
            "Fitted BPR model"
        );

        FactorizationModel::new(
            *config,
            to_array(&user_factors, num_users, config.factors()),
            to_array(&item_factors, num_items, config.factors()),
        )
    }
}
