//! Exhaustive grid search over hyperparameters.
//!
//! Every configuration in the grid is trained on the training split and
//! scored on the test split. Only the best model seen so far is kept; the
//! model of every other trial is dropped as soon as it has been scored.
use std::sync::Mutex;
use std::time::{Duration, Instant};

use failure::Fail;
use itertools::iproduct;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::data::CompressedInteractions;
use crate::evaluation::{EvaluationError, RankingEvaluator};
use crate::models::{
    FactorizationModel, Factorizer, FittingError, HyperparameterConfig, HyperparameterError,
};

/// Search error types.
#[derive(Debug, Fail)]
pub enum SearchError {
    /// A candidate list is empty.
    #[fail(display = "No candidate values for {}.", _0)]
    NoCandidates(&'static str),
    /// The search finished without completing any trial.
    #[fail(display = "No trial completed.")]
    NoTrialCompleted,
    /// A candidate value is invalid.
    #[fail(display = "{}", _0)]
    Hyperparameter(#[cause] HyperparameterError),
    /// Training failed.
    #[fail(display = "Trial {} failed to fit: {}", trial, cause)]
    Fitting {
        /// Trial number.
        trial: usize,
        /// The underlying error.
        #[cause]
        cause: FittingError,
    },
    /// Evaluation failed.
    #[fail(display = "Trial {} failed to evaluate: {}", trial, cause)]
    Evaluation {
        /// Trial number.
        trial: usize,
        /// The underlying error.
        #[cause]
        cause: EvaluationError,
    },
}

impl From<HyperparameterError> for SearchError {
    fn from(err: HyperparameterError) -> Self {
        SearchError::Hyperparameter(err)
    }
}

/// The grid of candidate hyperparameters.
#[derive(Clone, Debug)]
pub struct SearchSpace {
    configs: Vec<HyperparameterConfig>,
}

impl SearchSpace {
    /// Build the Cartesian product of the candidate lists.
    ///
    /// Trials are numbered with factors varying slowest, then iterations,
    /// then regularization, with the learning rate varying fastest.
    pub fn new(
        factors: &[usize],
        iterations: &[usize],
        regularization: &[f32],
        learning_rates: &[f32],
    ) -> Result<Self, SearchError> {
        for (name, len) in &[
            ("factors", factors.len()),
            ("iterations", iterations.len()),
            ("regularization", regularization.len()),
            ("learning rate", learning_rates.len()),
        ] {
            if *len == 0 {
                return Err(SearchError::NoCandidates(*name));
            }
        }

        let configs = iproduct!(factors, iterations, regularization, learning_rates)
            .map(|(&factors, &iterations, &regularization, &learning_rate)| {
                HyperparameterConfig::new(factors, iterations, regularization, learning_rate)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SearchSpace { configs })
    }

    /// A grid with a single configuration.
    pub fn single(config: HyperparameterConfig) -> Self {
        SearchSpace {
            configs: vec![config],
        }
    }

    /// The configurations in trial order.
    pub fn configs(&self) -> &[HyperparameterConfig] {
        &self.configs
    }

    /// Number of trials.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the grid is empty. Never true for a constructed space.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Train and evaluate every configuration, returning the best.
    pub fn search<F: Factorizer, E: RankingEvaluator>(
        &self,
        trainer: &F,
        evaluator: &E,
        train: &CompressedInteractions,
        test: &CompressedInteractions,
        options: &SearchOptions,
    ) -> Result<SearchOutcome, SearchError> {
        let runner = TrialRunner {
            trainer,
            evaluator,
            train,
            test,
            total: self.len(),
        };

        let (best, mut trials) = if options.parallel {
            self.search_parallel(&runner, options)?
        } else {
            self.search_sequential(&runner, options)?
        };

        trials.sort_by_key(|trial| trial.number);

        match best {
            Some(best) => {
                info!(
                    trial = best.number,
                    auc = best.score,
                    trials_run = trials.len(),
                    "Search finished"
                );
                Ok(SearchOutcome { best, trials })
            }
            None => Err(SearchError::NoTrialCompleted),
        }
    }

    fn search_sequential<F: Factorizer, E: RankingEvaluator>(
        &self,
        runner: &TrialRunner<F, E>,
        options: &SearchOptions,
    ) -> Result<(Option<Trial>, Vec<TrialRecord>), SearchError> {
        let start = Instant::now();

        let mut best: Option<Trial> = None;
        let mut trials = Vec::with_capacity(self.len());

        for (idx, config) in self.configs.iter().enumerate() {
            if best.is_some() && options.budget_exhausted(start) {
                info!(
                    trials_run = idx,
                    total = self.len(),
                    "Time budget exhausted"
                );
                break;
            }

            let trial = runner.run(idx + 1, config)?;
            trials.push(trial.record());

            if best.as_ref().map_or(true, |current| trial.beats(current)) {
                info!("New best AUC: {}", trial.score);
                best = Some(trial);
            }
        }

        Ok((best, trials))
    }

    fn search_parallel<F: Factorizer, E: RankingEvaluator>(
        &self,
        runner: &TrialRunner<F, E>,
        options: &SearchOptions,
    ) -> Result<(Option<Trial>, Vec<TrialRecord>), SearchError> {
        let start = Instant::now();

        let best: Mutex<Option<Trial>> = Mutex::new(None);
        let trials = Mutex::new(Vec::with_capacity(self.len()));

        self.configs
            .par_iter()
            .enumerate()
            .try_for_each(|(idx, config)| -> Result<(), SearchError> {
                if options.budget_exhausted(start) && lock(&best).is_some() {
                    return Ok(());
                }

                let trial = runner.run(idx + 1, config)?;
                lock(&trials).push(trial.record());

                let mut slot = lock(&best);
                if slot.as_ref().map_or(true, |current| trial.beats(current)) {
                    info!("New best AUC: {} (trial {})", trial.score, trial.number);
                    *slot = Some(trial);
                }

                Ok(())
            })?;

        let best = best.into_inner().unwrap_or_else(|err| err.into_inner());
        let trials = trials.into_inner().unwrap_or_else(|err| err.into_inner());

        Ok((best, trials))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// Search settings.
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    time_budget: Option<Duration>,
    parallel: bool,
}

impl SearchOptions {
    /// Stop starting new trials once this much time has passed. At least
    /// one trial always runs.
    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    /// Run trials concurrently. The selected trial is the same as in a
    /// sequential run with the same scores.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn budget_exhausted(&self, start: Instant) -> bool {
        self.time_budget
            .map_or(false, |budget| start.elapsed() >= budget)
    }
}

struct TrialRunner<'a, F: 'a, E: 'a> {
    trainer: &'a F,
    evaluator: &'a E,
    train: &'a CompressedInteractions,
    test: &'a CompressedInteractions,
    total: usize,
}

impl<'a, F: Factorizer, E: RankingEvaluator> TrialRunner<'a, F, E> {
    fn run(&self, number: usize, config: &HyperparameterConfig) -> Result<Trial, SearchError> {
        let start = Instant::now();

        let model = self
            .trainer
            .fit(self.train, config)
            .map_err(|cause| SearchError::Fitting {
                trial: number,
                cause,
            })?;
        let score = self
            .evaluator
            .score(&model, self.train, self.test)
            .map_err(|cause| SearchError::Evaluation {
                trial: number,
                cause,
            })?;

        info!(
            "[{} of {}] ({}) Factors: {}, Iterations: {}, Regularization: {}, Learning rate: {}",
            number,
            self.total,
            score,
            config.factors(),
            config.iterations(),
            config.regularization(),
            config.learning_rate()
        );

        if score.is_nan() {
            warn!(
                trial = number,
                "AUC is NaN: the model diverged or no test user could be scored"
            );
        } else if score == 0.5 {
            warn!(
                trial = number,
                "Degenerate AUC {}: too few test interactions or an untrained model", score
            );
        }

        Ok(Trial {
            number,
            score,
            elapsed: start.elapsed(),
            model,
        })
    }
}

/// A scored trial together with its model.
#[derive(Debug)]
pub struct Trial {
    /// One-based position in the grid.
    pub number: usize,
    /// AUC@K on the test split.
    pub score: f32,
    /// Wall-clock time to fit and score.
    pub elapsed: Duration,
    /// The fitted model.
    pub model: FactorizationModel,
}

impl Trial {
    /// The configuration the trial was run with.
    pub fn config(&self) -> &HyperparameterConfig {
        self.model.config()
    }

    /// Whether this trial should replace `other` as the best one: a strictly
    /// higher score wins, NaN loses to any number, and ties go to the trial
    /// that comes first in the grid.
    pub fn beats(&self, other: &Trial) -> bool {
        match (self.score.is_nan(), other.score.is_nan()) {
            (false, true) => true,
            (true, false) => false,
            (true, true) => self.number < other.number,
            (false, false) => {
                self.score > other.score
                    || (self.score == other.score && self.number < other.number)
            }
        }
    }

    /// The model-free summary of the trial.
    pub fn record(&self) -> TrialRecord {
        TrialRecord {
            number: self.number,
            score: self.score,
            elapsed: self.elapsed,
            hyperparameters: *self.config(),
        }
    }
}

/// Serializable summary of one trial.
#[derive(Clone, Debug, Serialize)]
pub struct TrialRecord {
    /// One-based position in the grid.
    pub number: usize,
    /// AUC@K on the test split.
    pub score: f32,
    /// Wall-clock time to fit and score.
    pub elapsed: Duration,
    /// The configuration.
    pub hyperparameters: HyperparameterConfig,
}

/// The result of a search.
#[derive(Debug)]
pub struct SearchOutcome {
    /// The winning trial.
    pub best: Trial,
    /// Summaries of every trial that ran, in grid order.
    pub trials: Vec<TrialRecord>,
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::data::{train_test_split, Interaction, Interactions};
    use crate::evaluation::AucAtK;
    use crate::models::factorization::BprFactorizer;
    use crate::models::TrainerOptions;

    struct ZeroTrainer;

    impl Factorizer for ZeroTrainer {
        fn fit(
            &self,
            interactions: &CompressedInteractions,
            config: &HyperparameterConfig,
        ) -> Result<FactorizationModel, FittingError> {
            FactorizationModel::new(
                *config,
                Array2::zeros((interactions.num_users(), config.factors())),
                Array2::zeros((interactions.num_items(), config.factors())),
            )
        }
    }

    /// Scores a model purely from its configuration.
    struct ConfigScore(fn(&HyperparameterConfig) -> f32);

    impl RankingEvaluator for ConfigScore {
        fn score(
            &self,
            model: &FactorizationModel,
            _: &CompressedInteractions,
            _: &CompressedInteractions,
        ) -> Result<f32, EvaluationError> {
            Ok((self.0)(model.config()))
        }
    }

    fn data() -> CompressedInteractions {
        Interactions::from_parts(
            2,
            2,
            vec![Interaction::new(0, 0, 1.0), Interaction::new(1, 1, 1.0)],
        )
        .to_compressed()
    }

    fn grid() -> SearchSpace {
        SearchSpace::new(&[2, 4], &[1, 2], &[0.0, 0.1], &[0.01, 0.05]).unwrap()
    }

    fn run(
        space: &SearchSpace,
        score: fn(&HyperparameterConfig) -> f32,
        options: SearchOptions,
    ) -> SearchOutcome {
        let data = data();
        space
            .search(&ZeroTrainer, &ConfigScore(score), &data, &data, &options)
            .unwrap()
    }

    #[test]
    fn enumeration_order() {
        let space = grid();
        let configs = space.configs();

        assert_eq!(space.len(), 16);
        assert_eq!(configs[0].factors(), 2);
        assert_eq!(configs[1].learning_rate(), 0.05);
        assert_eq!(configs[2].regularization(), 0.1);
        assert_eq!(configs[4].iterations(), 2);
        assert_eq!(configs[8].factors(), 4);
    }

    #[test]
    fn empty_candidates_are_rejected() {
        assert!(SearchSpace::new(&[], &[1], &[0.0], &[0.1]).is_err());
        assert!(SearchSpace::new(&[2], &[1], &[-1.0], &[0.1]).is_err());
    }

    #[test]
    fn single_trial_is_returned_regardless_of_score() {
        let space = SearchSpace::single(HyperparameterConfig::new(3, 1, 0.0, 0.1).unwrap());
        let outcome = run(&space, |_| f32::NAN, SearchOptions::default());

        assert_eq!(outcome.best.number, 1);
        assert_eq!(outcome.best.config().factors(), 3);
        assert_eq!(outcome.trials.len(), 1);
    }

    #[test]
    fn selects_highest_scoring_configuration() {
        let outcome = run(
            &grid(),
            |config| {
                let favoured = config.factors() == 4
                    && config.regularization() == 0.1
                    && config.iterations() == 1;
                if favoured {
                    0.9 + config.learning_rate()
                } else {
                    0.6
                }
            },
            SearchOptions::default(),
        );

        let best = outcome.best.config();
        assert_eq!(best.factors(), 4);
        assert_eq!(best.iterations(), 1);
        assert_eq!(best.regularization(), 0.1);
        assert_eq!(best.learning_rate(), 0.05);
        assert_eq!(outcome.trials.len(), 16);
    }

    #[test]
    fn ties_keep_the_first_trial() {
        let outcome = run(
            &grid(),
            |config| if config.factors() == 4 { 0.7 } else { 0.6 },
            SearchOptions::default(),
        );

        assert_eq!(outcome.best.number, 9);
    }

    #[test]
    fn nan_never_beats_a_number() {
        let outcome = run(
            &grid(),
            |config| if config.iterations() == 2 { 0.51 } else { f32::NAN },
            SearchOptions::default(),
        );

        assert_eq!(outcome.best.number, 5);
        assert_eq!(outcome.best.score, 0.51);
    }

    #[test]
    fn parallel_matches_sequential() {
        let score: fn(&HyperparameterConfig) -> f32 =
            |config| if config.regularization() == 0.1 { 0.8 } else { 0.3 };

        let sequential = run(&grid(), score, SearchOptions::default());
        let parallel = run(&grid(), score, SearchOptions::default().parallel(true));

        assert_eq!(sequential.best.number, 3);
        assert_eq!(parallel.best.number, sequential.best.number);
        assert_eq!(
            parallel.trials.iter().map(|x| x.number).collect::<Vec<_>>(),
            (1..=16).collect::<Vec<_>>()
        );
    }

    #[test]
    fn exhausted_budget_runs_one_trial() {
        let outcome = run(
            &grid(),
            |_| 0.6,
            SearchOptions::default().time_budget(Duration::from_secs(0)),
        );

        assert_eq!(outcome.trials.len(), 1);
        assert_eq!(outcome.best.number, 1);
    }

    #[test]
    fn exhausted_budget_with_parallel_trials_still_selects_a_best() {
        let outcome = run(
            &grid(),
            |config| config.learning_rate() + config.factors() as f32,
            SearchOptions::default()
                .time_budget(Duration::from_secs(0))
                .parallel(true),
        );

        assert!(!outcome.trials.is_empty());
        assert!(outcome.trials.len() <= grid().len());

        let top = outcome
            .trials
            .iter()
            .map(|trial| trial.score)
            .fold(f32::MIN, f32::max);
        let first_top = outcome
            .trials
            .iter()
            .find(|trial| trial.score == top)
            .map(|trial| trial.number);

        assert_eq!(outcome.best.score, top);
        assert_eq!(Some(outcome.best.number), first_top);
    }

    #[test]
    fn diverging_trial_scores_nan_and_the_search_goes_on() {
        let mut data = Vec::new();
        for user in 0..20 {
            let group = user / 10;
            for item in 0..5 {
                data.push(Interaction::new(user, group * 5 + item, 1.0));
            }
        }
        let data = Interactions::from_parts(20, 10, data);
        let mut rng = XorShiftRng::seed_from_u64(8);
        let (train, test) = train_test_split(&data, &mut rng, 0.2).unwrap();
        let (train, test) = (train.to_compressed(), test.to_compressed());

        let space = SearchSpace::new(&[4], &[50], &[1.0], &[0.01, 1e30]).unwrap();
        let trainer = BprFactorizer::new(TrainerOptions::default().num_threads(1).seed(2));

        let outcome = space
            .search(
                &trainer,
                &AucAtK::new(5),
                &train,
                &test,
                &SearchOptions::default(),
            )
            .unwrap();

        assert_eq!(outcome.trials.len(), 2);
        assert!(outcome.trials[0].score.is_finite());
        assert!(outcome.trials[1].score.is_nan());
        assert_eq!(outcome.best.number, 1);
    }

    #[test]
    fn a_search_without_trials_is_an_error() {
        let space = SearchSpace {
            configs: Vec::new(),
        };
        let data = data();

        for options in &[
            SearchOptions::default(),
            SearchOptions::default().parallel(true),
        ] {
            match space.search(&ZeroTrainer, &ConfigScore(|_| 0.5), &data, &data, options) {
                Err(SearchError::NoTrialCompleted) => {}
                other => panic!("Expected no completed trial, got {:?}", other),
            }
        }
    }

    #[test]
    fn fitting_errors_name_the_trial() {
        let empty = Interactions::new(2, 2).to_compressed();
        let space = SearchSpace::single(HyperparameterConfig::new(2, 1, 0.0, 0.1).unwrap());

        let result = space.search(
            &BprFactorizer::default(),
            &ConfigScore(|_| 0.5),
            &empty,
            &empty,
            &SearchOptions::default(),
        );

        match result {
            Err(SearchError::Fitting {
                trial: 1,
                cause: FittingError::EmptyTrainingSet,
            }) => {}
            other => panic!("Expected a fitting error, got {:?}", other),
        }
    }
}
