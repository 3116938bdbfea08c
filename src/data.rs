//! Interaction data: raw events, the indexed interaction matrix, and the
//! train/test split.
use std::collections::HashMap;

use failure::Fail;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::index::Indices;
use super::{ItemId, Timestamp, UserId};

/// Data error types.
#[derive(Debug, Fail)]
pub enum DataError {
    /// An interaction carried a non-positive or non-finite weight.
    #[fail(
        display = "Invalid weight {} on interaction record {}: weights must be positive and finite.",
        weight, record
    )]
    InvalidWeight {
        /// Zero-based position of the record across all consumed streams.
        record: usize,
        /// The offending weight.
        weight: f32,
    },
    /// The holdout fraction is outside `[0, 1)`.
    #[fail(display = "Invalid holdout fraction {}: must be in [0, 1).", _0)]
    InvalidHoldout(f32),
}

/// A single event between two raw entity keys.
#[derive(Clone, Debug, PartialEq)]
pub struct RawInteraction {
    user: String,
    item: String,
    weight: f32,
    timestamp: Option<Timestamp>,
}

impl RawInteraction {
    /// Build a new interaction.
    pub fn new<U: Into<String>, I: Into<String>>(user: U, item: I, weight: f32) -> Self {
        RawInteraction {
            user: user.into(),
            item: item.into(),
            weight,
            timestamp: None,
        }
    }

    /// Attach the time the event happened.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The source entity key.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The target entity key.
    pub fn item(&self) -> &str {
        &self.item
    }

    /// The interaction strength.
    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// The event time, if known.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }
}

/// How repeated (user, item) pairs within a stream are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Sum the weights, e.g. for transfer totals or repeated activity.
    Accumulate,
    /// Keep the most recent weight, e.g. for derived ratings.
    LastWrite,
}

/// What to do with an interaction whose weight is invalid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidWeightPolicy {
    /// Stop the build with [`DataError::InvalidWeight`].
    Abort,
    /// Drop the record, count it, and carry on.
    Skip,
}

impl Default for InvalidWeightPolicy {
    fn default() -> Self {
        InvalidWeightPolicy::Abort
    }
}

/// An indexed interaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    user_id: UserId,
    item_id: ItemId,
    weight: f32,
}

impl Interaction {
    /// Build a new indexed interaction.
    pub fn new(user_id: UserId, item_id: ItemId, weight: f32) -> Self {
        Interaction {
            user_id,
            item_id,
            weight,
        }
    }

    /// The user (column) index.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The item (row) index.
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// The stored weight.
    pub fn weight(&self) -> f32 {
        self.weight
    }
}

/// Sparse item-by-user interaction matrix in coordinate form.
///
/// Rows are items and columns are users; [`Interactions::to_compressed`]
/// transposes it into the user-major layout used for training. Each
/// (item, user) cell is stored at most once.
#[derive(Clone, Debug)]
pub struct Interactions {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Build an empty matrix with the given dimensions.
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Interactions {
            num_users,
            num_items,
            interactions: Vec::new(),
        }
    }

    /// Build a matrix from indexed interactions, growing the dimensions to
    /// fit the largest index seen.
    pub fn from_parts(num_users: usize, num_items: usize, data: Vec<Interaction>) -> Self {
        let num_users = data
            .iter()
            .map(|x| x.user_id() + 1)
            .max()
            .unwrap_or(0)
            .max(num_users);
        let num_items = data
            .iter()
            .map(|x| x.item_id() + 1)
            .max()
            .unwrap_or(0)
            .max(num_items);

        Interactions {
            num_users,
            num_items,
            interactions: data,
        }
    }

    /// The stored cells.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of stored cells.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether there are no stored cells.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Number of users (columns).
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items (rows).
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(rows, columns)`, i.e. `(num_items, num_users)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_items, self.num_users)
    }

    /// Convert into the user-major compressed layout.
    pub fn to_compressed(&self) -> CompressedInteractions {
        CompressedInteractions::from(self)
    }

    fn with_data(&self, interactions: Vec<Interaction>) -> Self {
        Interactions {
            num_users: self.num_users,
            num_items: self.num_items,
            interactions,
        }
    }
}

/// Counters collected while building a matrix.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSummary {
    /// Records that made it into the matrix, including merged duplicates.
    pub accepted: usize,
    /// Records dropped for an invalid weight.
    pub rejected: usize,
    /// Records combined into an already existing cell.
    pub merged: usize,
    /// Number of real (non-synthetic) items: every item index below this
    /// is a real entity.
    pub real_items: usize,
}

/// Single-pass builder for an [`Interactions`] matrix.
///
/// Keys are indexed as records are consumed, so several streams fed into
/// the same builder resolve a key to one index regardless of the stream it
/// first appeared in.
#[derive(Debug, Default)]
pub struct MatrixBuilder {
    indices: Indices,
    cells: HashMap<(ItemId, UserId), usize>,
    interactions: Vec<Interaction>,
    invalid_weights: InvalidWeightPolicy,
    synthetic_boundary: Option<usize>,
    records: usize,
    summary: BuildSummary,
}

impl MatrixBuilder {
    /// Build a new builder with the given invalid-weight policy.
    pub fn new(invalid_weights: InvalidWeightPolicy) -> Self {
        MatrixBuilder {
            invalid_weights,
            ..Default::default()
        }
    }

    /// Consume one stream of interactions, combining duplicates according to
    /// `duplicates`. Returns the number of records accepted from this stream.
    pub fn extend<T: IntoIterator<Item = RawInteraction>>(
        &mut self,
        stream: T,
        duplicates: DuplicatePolicy,
    ) -> Result<usize, DataError> {
        let mut accepted = 0;

        for interaction in stream {
            if self.push(&interaction, duplicates)? {
                accepted += 1;
            }
        }

        debug!(
            accepted,
            users = self.indices.users.len(),
            items = self.indices.items.len(),
            "Consumed interaction stream"
        );

        Ok(accepted)
    }

    /// Consume a single interaction. Returns `false` when the record was
    /// skipped for an invalid weight.
    pub fn push(
        &mut self,
        interaction: &RawInteraction,
        duplicates: DuplicatePolicy,
    ) -> Result<bool, DataError> {
        let record = self.records;
        self.records += 1;

        let weight = interaction.weight();

        if !(weight.is_finite() && weight > 0.0) {
            match self.invalid_weights {
                InvalidWeightPolicy::Abort => {
                    return Err(DataError::InvalidWeight { record, weight });
                }
                InvalidWeightPolicy::Skip => {
                    self.summary.rejected += 1;
                    return Ok(false);
                }
            }
        }

        let user_id = self.indices.users.index_of(&interaction.user);
        let item_id = self.indices.items.index_of(&interaction.item);

        match self.cells.get(&(item_id, user_id)) {
            Some(&position) => {
                let cell = &mut self.interactions[position];
                cell.weight = match duplicates {
                    DuplicatePolicy::Accumulate => cell.weight + weight,
                    DuplicatePolicy::LastWrite => weight,
                };
                self.summary.merged += 1;
            }
            None => {
                self.cells.insert((item_id, user_id), self.interactions.len());
                self.interactions
                    .push(Interaction::new(user_id, item_id, weight));
            }
        }

        self.summary.accepted += 1;

        Ok(true)
    }

    /// Record the current item count as the end of the real items. Items
    /// first seen after this call are synthetic pseudo-items.
    pub fn mark_synthetic_boundary(&mut self) {
        self.synthetic_boundary = Some(self.indices.items.len());
    }

    /// The indices built so far.
    pub fn indices(&self) -> &Indices {
        &self.indices
    }

    /// Finish building, returning the matrix, the indices and the counters.
    pub fn finish(self) -> (Interactions, Indices, BuildSummary) {
        let num_items = self.indices.items.len();
        let mut summary = self.summary;
        summary.real_items = self.synthetic_boundary.unwrap_or(num_items);

        if summary.rejected > 0 {
            warn!(
                rejected = summary.rejected,
                "Dropped interactions with invalid weights"
            );
        }

        let interactions = Interactions {
            num_users: self.indices.users.len(),
            num_items,
            interactions: self.interactions,
        };

        (interactions, self.indices, summary)
    }
}

/// Split `interactions` into `(train, test)`, holding out roughly
/// `holdout_fraction` of the cells.
///
/// A cell is only moved to the test set if its user and its item each keep
/// at least one other cell in the training set, so evaluation never meets a
/// user or item the model was not trained on. When that constraint binds,
/// fewer cells than requested are held out. The result is deterministic for
/// a seeded `rng`.
pub fn train_test_split<R: Rng>(
    interactions: &Interactions,
    rng: &mut R,
    holdout_fraction: f32,
) -> Result<(Interactions, Interactions), DataError> {
    if !(0.0..1.0).contains(&holdout_fraction) {
        return Err(DataError::InvalidHoldout(holdout_fraction));
    }

    let mut data = interactions.data().to_owned();
    data.shuffle(rng);

    let mut user_counts = vec![0usize; interactions.num_users()];
    let mut item_counts = vec![0usize; interactions.num_items()];

    for datum in &data {
        user_counts[datum.user_id()] += 1;
        item_counts[datum.item_id()] += 1;
    }

    let target = (holdout_fraction * data.len() as f32) as usize;

    let mut train = Vec::with_capacity(data.len() - target);
    let mut test = Vec::with_capacity(target);

    for datum in data {
        let (user_id, item_id) = (datum.user_id(), datum.item_id());

        if test.len() < target && user_counts[user_id] > 1 && item_counts[item_id] > 1 {
            user_counts[user_id] -= 1;
            item_counts[item_id] -= 1;
            test.push(datum);
        } else {
            train.push(datum);
        }
    }

    if test.len() < target {
        debug!(
            requested = target,
            held_out = test.len(),
            "Holdout reduced to keep every test user and item in train"
        );
    }

    Ok((interactions.with_data(train), interactions.with_data(test)))
}

/// User-major compressed sparse layout of an interaction matrix.
///
/// Item ids within each user are sorted, so membership checks are a binary
/// search.
#[derive(Clone, Debug)]
pub struct CompressedInteractions {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    user_ids: Vec<UserId>,
    item_ids: Vec<ItemId>,
    weights: Vec<f32>,
}

impl<'a> From<&'a Interactions> for CompressedInteractions {
    fn from(interactions: &Interactions) -> CompressedInteractions {
        let mut data = interactions.data().to_owned();

        data.sort_by_key(|x| (x.user_id(), x.item_id()));

        let mut user_pointers = vec![0; interactions.num_users + 1];
        let mut user_ids = Vec::with_capacity(data.len());
        let mut item_ids = Vec::with_capacity(data.len());
        let mut weights = Vec::with_capacity(data.len());

        for datum in &data {
            user_ids.push(datum.user_id());
            item_ids.push(datum.item_id());
            weights.push(datum.weight());

            user_pointers[datum.user_id() + 1] += 1;
        }

        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        CompressedInteractions {
            num_users: interactions.num_users,
            num_items: interactions.num_items,
            user_pointers,
            user_ids,
            item_ids,
            weights,
        }
    }
}

impl CompressedInteractions {
    /// Iterate over all users, including those without interactions.
    pub fn iter_users(&self) -> CompressedInteractionsUserIterator {
        CompressedInteractionsUserIterator {
            interactions: self,
            idx: 0,
        }
    }

    /// The interactions of a single user.
    pub fn get_user(&self, user_id: UserId) -> Option<CompressedInteractionsUser> {
        if user_id >= self.num_users {
            return None;
        }

        let start = self.user_pointers[user_id];
        let stop = self.user_pointers[user_id + 1];

        Some(CompressedInteractionsUser {
            user_id,
            item_ids: &self.item_ids[start..stop],
            weights: &self.weights[start..stop],
        })
    }

    /// The `(user, item)` pair stored at position `idx`.
    pub fn entry(&self, idx: usize) -> (UserId, ItemId) {
        (self.user_ids[idx], self.item_ids[idx])
    }

    /// Whether `user_id` interacted with `item_id`.
    pub fn contains(&self, user_id: UserId, item_id: ItemId) -> bool {
        self.get_user(user_id)
            .map(|user| user.contains(item_id))
            .unwrap_or(false)
    }

    /// Number of stored interactions.
    pub fn nnz(&self) -> usize {
        self.item_ids.len()
    }

    /// Number of users.
    pub fn num_users(&self) -> usize {
        self.num_users
    }

    /// Number of items.
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// `(num_users, num_items)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }
}

/// Iterator over the users of a [`CompressedInteractions`].
pub struct CompressedInteractionsUserIterator<'a> {
    interactions: &'a CompressedInteractions,
    idx: usize,
}

/// The interactions of one user.
#[derive(Debug)]
pub struct CompressedInteractionsUser<'a> {
    /// The user.
    pub user_id: UserId,
    /// Sorted item ids the user interacted with.
    pub item_ids: &'a [ItemId],
    /// Weights aligned with `item_ids`.
    pub weights: &'a [f32],
}

impl<'a> CompressedInteractionsUser<'a> {
    /// Number of interactions.
    pub fn len(&self) -> usize {
        self.item_ids.len()
    }

    /// Whether the user has no interactions.
    pub fn is_empty(&self) -> bool {
        self.item_ids.is_empty()
    }

    /// Whether the user interacted with `item_id`.
    pub fn contains(&self, item_id: ItemId) -> bool {
        self.item_ids.binary_search(&item_id).is_ok()
    }
}

impl<'a> Iterator for CompressedInteractionsUserIterator<'a> {
    type Item = CompressedInteractionsUser<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = self.interactions.get_user(self.idx);

        self.idx += 1;

        value
    }
}
