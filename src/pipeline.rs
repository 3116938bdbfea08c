//! A full run: load events, build the matrix, search, export.
use std::collections::HashMap;
use std::fs::create_dir_all;
use std::path::Path;

use rand::{thread_rng, Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use serde::Deserialize;
use tracing::info;

use crate::config::PipelineConfig;
use crate::data::{
    train_test_split, BuildSummary, DuplicatePolicy, MatrixBuilder, RawInteraction,
};
use crate::evaluation::{default_k, AucAtK};
use crate::events::{activity_buckets, symmetric, transfer_ratings, Activity, Transfer};
use crate::export::{write_exports, write_search_results, ExportSummary, SEARCH_RESULTS_FILE};
use crate::models::factorization::BprFactorizer;
use crate::models::{Factorizer, FittingError};
use crate::projection::{Projector, Tsne};

/// Weight of one activity event in its time bucket.
pub const ACTIVITY_WEIGHT: f32 = 5.0;

#[derive(Debug, Deserialize)]
struct InteractionRecord {
    user: String,
    item: String,
    #[serde(default)]
    weight: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct LabelRecord {
    address: String,
    label: String,
}

/// Read `user,item[,weight]` rows. A missing weight counts as 1.
///
/// With `undirected`, every row becomes two interactions of weight 1, one in
/// each direction.
pub fn load_interactions(
    path: &Path,
    undirected: bool,
) -> Result<Vec<RawInteraction>, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let records: Vec<InteractionRecord> = reader.deserialize().collect::<Result<Vec<_>, _>>()?;

    if undirected {
        return Ok(symmetric(records.into_iter().map(|x| (x.user, x.item))));
    }

    Ok(records
        .into_iter()
        .map(|x| RawInteraction::new(x.user, x.item, x.weight.unwrap_or(1.0)))
        .collect())
}

/// Read `from,to,amount` rows.
pub fn load_transfers(path: &Path) -> Result<Vec<Transfer>, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    Ok(reader.deserialize().collect::<Result<Vec<_>, _>>()?)
}

/// Read `account,timestamp` rows.
pub fn load_activity(path: &Path) -> Result<Vec<Activity>, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    Ok(reader.deserialize().collect::<Result<Vec<_>, _>>()?)
}

/// Read `address,label` rows. Later rows win.
pub fn load_labels(path: &Path) -> Result<HashMap<String, String>, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut labels = HashMap::new();

    for record in reader.deserialize() {
        let record: LabelRecord = record?;
        labels.insert(record.address, record.label);
    }

    Ok(labels)
}

/// What a run did.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Matrix build counters.
    pub build: BuildSummary,
    /// Number of trials run.
    pub trials: usize,
    /// Number of the winning trial.
    pub best_trial: usize,
    /// AUC@K of the winning trial.
    pub best_score: f32,
    /// The K used for scoring.
    pub k: usize,
    /// Export counters.
    pub export: ExportSummary,
}

/// One pipeline run.
#[derive(Clone, Debug)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Build a new pipeline.
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline { config }
    }

    /// The run settings.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run all stages. Nothing is written unless training succeeds.
    pub fn run(&self) -> Result<RunSummary, failure::Error> {
        let config = &self.config;

        info!("Loading interactions");

        let mut builder = MatrixBuilder::new(config.invalid_weights);

        if let Some(path) = &config.transfers {
            builder.extend(transfer_ratings(load_transfers(path)?), DuplicatePolicy::LastWrite)?;
        }
        if let Some(path) = &config.interactions {
            builder.extend(
                load_interactions(path, config.symmetric)?,
                DuplicatePolicy::Accumulate,
            )?;
        }
        if let Some(path) = &config.activity {
            builder.mark_synthetic_boundary();
            builder.extend(
                activity_buckets(load_activity(path)?, config.bucket_width, ACTIVITY_WEIGHT),
                DuplicatePolicy::Accumulate,
            )?;
        }

        let (data, indices, build) = builder.finish();

        info!(
            users = data.num_users(),
            items = data.num_items(),
            real_items = build.real_items,
            interactions = data.len(),
            "Built interaction matrix"
        );

        if data.is_empty() {
            return Err(FittingError::EmptyTrainingSet.into());
        }

        let mut rng = match config.seed {
            Some(seed) => XorShiftRng::seed_from_u64(seed),
            None => XorShiftRng::seed_from_u64(thread_rng().gen()),
        };

        let (train, test) = train_test_split(&data, &mut rng, config.holdout)?;
        let (train, test) = (train.to_compressed(), test.to_compressed());

        let k = config.k.unwrap_or_else(|| default_k(data.num_users()));

        info!(
            train = train.nnz(),
            test = test.nnz(),
            k,
            trials = config.search_space.len(),
            "Searching hyperparameters"
        );

        let trainer = BprFactorizer::new(config.trainer.clone());
        let evaluator = AucAtK::new(k);

        let outcome =
            config
                .search_space
                .search(&trainer, &evaluator, &train, &test, &config.search)?;

        let best = outcome.best;

        info!(
            trial = best.number,
            auc = best.score,
            factors = best.config().factors(),
            iterations = best.config().iterations(),
            regularization = best.config().regularization(),
            learning_rate = best.config().learning_rate(),
            "Best configuration"
        );

        let model = if config.refit {
            info!("Refitting on all interactions");
            trainer.fit(&data.to_compressed(), best.config())?
        } else {
            best.model
        };

        create_dir_all(&config.output_dir)?;
        write_search_results(&config.output_dir.join(SEARCH_RESULTS_FILE), &outcome.trials)?;

        let labels = match &config.labels {
            Some(path) => load_labels(path)?,
            None => HashMap::new(),
        };

        let tsne = match config.seed {
            Some(seed) => Tsne::default().seed(seed),
            None => Tsne::default(),
        };
        let projector: Option<&dyn Projector> = if config.project { Some(&tsne) } else { None };

        let export = write_exports(
            &config.output_dir,
            &model,
            &indices.items,
            build.real_items,
            &labels,
            &config.export,
            projector,
        )?;

        info!(
            rejected = build.rejected,
            merged = build.merged,
            trials = outcome.trials.len(),
            exported = export.written,
            "Done"
        );

        Ok(RunSummary {
            build,
            trials: outcome.trials.len(),
            best_trial: best.number,
            best_score: best.score,
            k,
            export,
        })
    }
}
