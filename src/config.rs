//! Command line and environment settings.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use failure::Fail;

use crate::data::InvalidWeightPolicy;
use crate::events::DEFAULT_BUCKET_WIDTH;
use crate::export::ExportOptions;
use crate::models::TrainerOptions;
use crate::search::{SearchError, SearchOptions, SearchSpace};

/// Configuration error types.
#[derive(Debug, Fail)]
pub enum ConfigError {
    /// A required setting was not provided.
    #[fail(display = "Missing setting: {}", _0)]
    Missing(&'static str),
    /// A setting has an unusable value.
    #[fail(display = "Invalid {}: {}", name, reason)]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

fn invalid<T: ToString>(name: &'static str, reason: T) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

/// Raw settings, read from flags or `COSMOTION_*` environment variables.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Settings {
    /// CSV of `user,item[,weight]` interactions
    #[arg(long, env = "COSMOTION_INTERACTIONS")]
    pub interactions: Option<PathBuf>,

    /// Treat every interaction as an undirected pair of weight 1
    #[arg(long, env = "COSMOTION_SYMMETRIC")]
    pub symmetric: bool,

    /// CSV of `from,to,amount` transfers, turned into 1-5 ratings
    #[arg(long, env = "COSMOTION_TRANSFERS")]
    pub transfers: Option<PathBuf>,

    /// CSV of `account,timestamp` activity, turned into time-bucket items
    #[arg(long, env = "COSMOTION_ACTIVITY")]
    pub activity: Option<PathBuf>,

    /// CSV of `address,label` item labels
    #[arg(long, env = "COSMOTION_LABELS")]
    pub labels: Option<PathBuf>,

    /// Directory the output tables are written to
    #[arg(long, env = "COSMOTION_OUTPUT_DIR", default_value = "data")]
    pub output_dir: PathBuf,

    /// Training threads: 0 for every core, -1 for every core, -2 for all but one
    #[arg(
        long,
        env = "COSMOTION_NUM_THREADS",
        default_value_t = 1,
        allow_hyphen_values = true
    )]
    pub num_threads: isize,

    /// Candidate latent dimensionalities
    #[arg(long, env = "COSMOTION_FACTORS", value_delimiter = ',', default_values_t = [127, 255, 512])]
    pub factors: Vec<usize>,

    /// Candidate numbers of passes
    #[arg(long, env = "COSMOTION_ITERATIONS", value_delimiter = ',', default_values_t = [127, 256, 512])]
    pub iterations: Vec<usize>,

    /// Candidate L2 penalties
    #[arg(
        long,
        env = "COSMOTION_REGULARIZATION",
        value_delimiter = ',',
        default_values_t = [0.01, 0.02, 0.05, 0.005, 0.001]
    )]
    pub regularization: Vec<f32>,

    /// Candidate learning rates
    #[arg(
        long,
        env = "COSMOTION_LEARNING_RATES",
        value_delimiter = ',',
        default_values_t = [0.01, 0.02, 0.05, 0.005, 0.001]
    )]
    pub learning_rates: Vec<f32>,

    /// Whether to reject sampled negatives the user interacted with
    #[arg(
        long,
        env = "COSMOTION_VERIFY_NEGATIVE_SAMPLES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub verify_negative_samples: bool,

    /// Fraction of interactions held out for evaluation
    #[arg(long, env = "COSMOTION_HOLDOUT", default_value_t = 0.2)]
    pub holdout: f32,

    /// AUC cutoff, an eighth of the users when unset
    #[arg(long, env = "COSMOTION_K")]
    pub k: Option<usize>,

    /// Also write a 3-dimensional t-SNE projection of the factors
    #[arg(long, env = "COSMOTION_PROJECT")]
    pub project: bool,

    /// Only export items that have a label
    #[arg(long, env = "COSMOTION_REQUIRE_LABELS")]
    pub require_labels: bool,

    /// Width of activity buckets in seconds
    #[arg(long, env = "COSMOTION_BUCKET_WIDTH", default_value_t = DEFAULT_BUCKET_WIDTH)]
    pub bucket_width: i64,

    /// What to do with non-positive weights: abort or skip
    #[arg(long, env = "COSMOTION_INVALID_WEIGHTS", default_value = "abort")]
    pub invalid_weights: String,

    /// Seed for splitting, initialisation and sampling
    #[arg(long, env = "COSMOTION_SEED")]
    pub seed: Option<u64>,

    /// Stop starting new trials after this many seconds
    #[arg(long, env = "COSMOTION_TIME_BUDGET")]
    pub time_budget: Option<u64>,

    /// Run trials concurrently
    #[arg(long, env = "COSMOTION_PARALLEL_TRIALS")]
    pub parallel_trials: bool,

    /// Retrain the winning configuration on all interactions before export
    #[arg(long, env = "COSMOTION_REFIT")]
    pub refit: bool,
}

/// Validated settings of a pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Interaction CSV.
    pub interactions: Option<PathBuf>,
    /// Whether interactions are undirected pairs.
    pub symmetric: bool,
    /// Transfer CSV.
    pub transfers: Option<PathBuf>,
    /// Activity CSV.
    pub activity: Option<PathBuf>,
    /// Label CSV.
    pub labels: Option<PathBuf>,
    /// Output directory.
    pub output_dir: PathBuf,
    /// The hyperparameter grid.
    pub search_space: SearchSpace,
    /// Search settings.
    pub search: SearchOptions,
    /// Trainer settings.
    pub trainer: TrainerOptions,
    /// Holdout fraction.
    pub holdout: f32,
    /// AUC cutoff.
    pub k: Option<usize>,
    /// Whether to write the projected factors.
    pub project: bool,
    /// Export filter.
    pub export: ExportOptions,
    /// Activity bucket width in seconds.
    pub bucket_width: i64,
    /// Invalid weight handling.
    pub invalid_weights: InvalidWeightPolicy,
    /// RNG seed.
    pub seed: Option<u64>,
    /// Whether to refit on all data.
    pub refit: bool,
}

impl Settings {
    /// Validate the settings.
    pub fn into_config(self) -> Result<PipelineConfig, ConfigError> {
        if self.interactions.is_none() && self.transfers.is_none() {
            return Err(ConfigError::Missing("--interactions or --transfers"));
        }

        if !(0.0..1.0).contains(&self.holdout) {
            return Err(invalid("holdout", "must be in [0, 1)"));
        }

        if self.k == Some(0) {
            return Err(invalid("k", "must be at least 1"));
        }

        if self.bucket_width <= 0 {
            return Err(invalid("bucket width", "must be positive"));
        }

        let invalid_weights = match self.invalid_weights.to_lowercase().as_str() {
            "abort" => InvalidWeightPolicy::Abort,
            "skip" => InvalidWeightPolicy::Skip,
            other => {
                return Err(invalid(
                    "invalid weight policy",
                    format!("{} (expected abort or skip)", other),
                ))
            }
        };

        let search_space = SearchSpace::new(
            &self.factors,
            &self.iterations,
            &self.regularization,
            &self.learning_rates,
        )
        .map_err(|err| match err {
            SearchError::NoCandidates(name) => ConfigError::Missing(name),
            other => invalid("hyperparameter grid", other),
        })?;

        let mut search = SearchOptions::default().parallel(self.parallel_trials);
        if let Some(seconds) = self.time_budget {
            search = search.time_budget(Duration::from_secs(seconds));
        }

        let mut trainer = TrainerOptions::default()
            .num_threads(self.num_threads)
            .verify_negative_samples(self.verify_negative_samples);
        if let Some(seed) = self.seed {
            trainer = trainer.seed(seed);
        }

        Ok(PipelineConfig {
            interactions: self.interactions,
            symmetric: self.symmetric,
            transfers: self.transfers,
            activity: self.activity,
            labels: self.labels,
            output_dir: self.output_dir,
            search_space,
            search,
            trainer,
            holdout: self.holdout,
            k: self.k,
            project: self.project,
            export: ExportOptions::default().require_labels(self.require_labels),
            bucket_width: self.bucket_width,
            invalid_weights,
            seed: self.seed,
            refit: self.refit,
        })
    }
}
