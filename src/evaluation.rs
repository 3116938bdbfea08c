//! Held-out ranking evaluation.
use std::cmp::Ordering;

use failure::Fail;

use super::{ItemId, PredictionError, RankingModel};
use crate::data::CompressedInteractions;
use crate::models::FactorizationModel;

/// Evaluation error types.
#[derive(Debug, Fail)]
pub enum EvaluationError {
    /// K was zero.
    #[fail(display = "Invalid K: must be at least 1.")]
    InvalidK,
    /// Train and test matrices have different dimensions.
    #[fail(display = "Train and test shapes differ: {:?} and {:?}.", _0, _1)]
    ShapeMismatch((usize, usize), (usize, usize)),
    /// The model could not score a user.
    #[fail(display = "Prediction failed: {}", _0)]
    Prediction(#[cause] PredictionError),
}

impl From<PredictionError> for EvaluationError {
    fn from(err: PredictionError) -> Self {
        EvaluationError::Prediction(err)
    }
}

/// The K used when none is configured: an eighth of the users, at least 1.
pub fn default_k(num_users: usize) -> usize {
    ((num_users as f64 / 8.0).round() as usize).max(1)
}

/// Compute AUC@K of `model` on `test`.
///
/// For every user with at least one test interaction, items the user
/// interacted with in `train` are removed and the rest are ranked by
/// predicted score. Within the top K, each negative is credited with the
/// number of test positives ranked above it; negatives outside the top K are
/// assumed to sit below every retrieved positive and level with every
/// missed one. The per-user score is normalised by the number of
/// positive/negative pairs and averaged over users.
///
/// Users without test interactions are left out of the average. K larger
/// than the number of rankable items is clamped. Returns NaN when no user
/// can be scored, or when the model produces a non-finite prediction: a
/// diverged model ranks nothing.
pub fn auc_at_k<T: RankingModel>(
    model: &T,
    train: &CompressedInteractions,
    test: &CompressedInteractions,
    k: usize,
) -> Result<f32, EvaluationError> {
    if k == 0 {
        return Err(EvaluationError::InvalidK);
    }

    if train.shape() != test.shape() {
        return Err(EvaluationError::ShapeMismatch(train.shape(), test.shape()));
    }

    let num_items = test.num_items();
    let item_ids: Vec<ItemId> = (0..num_items).collect();

    let mut total = 0.0;
    let mut num_users = 0;

    for test_user in test.iter_users().filter(|user| !user.is_empty()) {
        let num_positives = test_user.len();
        let num_negatives = num_items - num_positives;

        if num_negatives == 0 {
            continue;
        }

        let predictions = match model.predict(test_user.user_id, &item_ids) {
            Ok(predictions) => predictions,
            Err(PredictionError::InvalidPredictionValue) => return Ok(f32::NAN),
            Err(err) => return Err(err.into()),
        };

        let mut ranked: Vec<(ItemId, f32)> = match train.get_user(test_user.user_id) {
            Some(train_user) => predictions
                .into_iter()
                .enumerate()
                .filter(|&(item_id, _)| !train_user.contains(item_id))
                .collect(),
            None => predictions.into_iter().enumerate().collect(),
        };

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let cutoff = k.min(ranked.len());

        let mut hits = 0;
        let mut auc = 0.0;

        for &(item_id, _) in &ranked[..cutoff] {
            if test_user.contains(item_id) {
                hits += 1;
            } else {
                auc += hits as f64;
            }
        }

        let negatives_below = num_negatives.saturating_sub(cutoff - hits);
        auc += (hits + num_positives) as f64 / 2.0 * negatives_below as f64;

        total += auc / (num_positives * num_negatives) as f64;
        num_users += 1;
    }

    if num_users == 0 {
        return Ok(f32::NAN);
    }

    Ok((total / num_users as f64) as f32)
}

/// Scores a trained model against held-out data.
pub trait RankingEvaluator: Sync {
    /// Score `model`: higher is better.
    fn score(
        &self,
        model: &FactorizationModel,
        train: &CompressedInteractions,
        test: &CompressedInteractions,
    ) -> Result<f32, EvaluationError>;
}

/// [`auc_at_k`] with a fixed K.
#[derive(Clone, Copy, Debug)]
pub struct AucAtK {
    k: usize,
}

impl AucAtK {
    /// Build a new evaluator.
    pub fn new(k: usize) -> Self {
        AucAtK { k }
    }

    /// The cutoff.
    pub fn k(&self) -> usize {
        self.k
    }
}

impl RankingEvaluator for AucAtK {
    fn score(
        &self,
        model: &FactorizationModel,
        train: &CompressedInteractions,
        test: &CompressedInteractions,
    ) -> Result<f32, EvaluationError> {
        auc_at_k(model, train, test, self.k)
    }
}
