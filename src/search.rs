//! Hyperparameter search driver.
//!
//! A [`Study`] runs an objective over a number of trials. Each trial draws
//! its parameters from a declarative settings map
//! (`{name: {"function": ..., "kwargs": {...}}}`), reports an intermediate
//! value and may be pruned by the median rule. Sampling is uniform over each
//! distribution and seeded per trial number, so a study with a fixed seed
//! proposes the same parameter sets however its trials are scheduled.

use crate::error::{ForecastError, Result};
use crate::objective::TrialOutcome;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Number of completed trials before the median pruner starts pruning.
pub const PRUNER_STARTUP_TRIALS: usize = 5;

/// One entry of the search settings map. Extra keyword arguments (such as
/// a repeated `name`) are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", content = "kwargs", rename_all = "snake_case")]
pub enum ParamDistribution {
    SuggestFloat {
        low: f64,
        high: f64,
        #[serde(default)]
        log: bool,
    },
    SuggestUniform {
        low: f64,
        high: f64,
    },
    SuggestLoguniform {
        low: f64,
        high: f64,
    },
    SuggestInt {
        low: i64,
        high: i64,
    },
    SuggestCategorical {
        choices: Vec<Value>,
    },
}

impl ParamDistribution {
    pub fn sample<R: Rng + ?Sized>(&self, name: &str, rng: &mut R) -> Result<Value> {
        let invalid = |why: &str| ForecastError::Config(format!("search setting '{name}': {why}"));
        let uniform = |low: f64, high: f64, rng: &mut R| -> Result<f64> {
            if !(low <= high) {
                return Err(invalid("low must not exceed high"));
            }
            Ok(if low == high { low } else { rng.gen_range(low..high) })
        };
        let log_uniform = |low: f64, high: f64, rng: &mut R| -> Result<f64> {
            if !(low > 0.0) {
                return Err(invalid("log scale needs low > 0"));
            }
            Ok(uniform(low.ln(), high.ln(), rng)?.exp())
        };

        let value = match self {
            ParamDistribution::SuggestFloat { low, high, log: false }
            | ParamDistribution::SuggestUniform { low, high } => Value::from(uniform(*low, *high, rng)?),
            ParamDistribution::SuggestFloat { low, high, log: true }
            | ParamDistribution::SuggestLoguniform { low, high } => Value::from(log_uniform(*low, *high, rng)?),
            ParamDistribution::SuggestInt { low, high } => {
                if low > high {
                    return Err(invalid("low must not exceed high"));
                }
                Value::from(rng.gen_range(*low..=*high))
            }
            ParamDistribution::SuggestCategorical { choices } => {
                if choices.is_empty() {
                    return Err(invalid("no choices"));
                }
                choices[rng.gen_range(0..choices.len())].clone()
            }
        };
        Ok(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    Running,
    Completed,
    Pruned,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrialRecord {
    pub number: usize,
    pub params: BTreeMap<String, Value>,
    pub value: Option<f64>,
    pub status: TrialStatus,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BestTrial {
    pub number: usize,
    pub value: f64,
    pub params: BTreeMap<String, Value>,
}

/// Prunes a trial whose reported value is worse than the median of the
/// completed trials, once `startup_trials` trials have completed.
#[derive(Clone, Copy, Debug)]
pub struct MedianPruner {
    pub startup_trials: usize,
}

impl Default for MedianPruner {
    fn default() -> Self {
        Self {
            startup_trials: PRUNER_STARTUP_TRIALS,
        }
    }
}

impl MedianPruner {
    pub fn should_prune(&self, reported: f64, completed: &[f64]) -> bool {
        if completed.len() < self.startup_trials || completed.is_empty() {
            return false;
        }
        if reported.is_nan() {
            return true;
        }
        let mut sorted = completed.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        reported > median
    }
}

/// The handle an objective uses to draw parameters and report progress.
pub struct Trial<'a> {
    number: usize,
    rng: StdRng,
    params: BTreeMap<String, Value>,
    reported: Option<f64>,
    study: &'a Study,
}

impl Trial<'_> {
    pub fn number(&self) -> usize {
        self.number
    }

    /// Draws a value for `name` and records it in the trial's parameters.
    pub fn suggest(&mut self, name: &str, distribution: &ParamDistribution) -> Result<Value> {
        let value = distribution.sample(name, &mut self.rng)?;
        self.params.insert(name.to_string(), value.clone());
        Ok(value)
    }

    /// Draws a value for every entry of `settings`.
    pub fn suggest_all(&mut self, settings: &BTreeMap<String, ParamDistribution>) -> Result<BTreeMap<String, Value>> {
        settings
            .iter()
            .map(|(name, dist)| Ok((name.clone(), self.suggest(name, dist)?)))
            .collect()
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn report(&mut self, value: f64) {
        self.reported = Some(value);
    }

    pub fn should_prune(&self) -> bool {
        match self.reported {
            Some(value) => self.study.pruner.should_prune(value, &self.study.completed_values()),
            None => false,
        }
    }
}

/// Trial bookkeeping shared by all workers of one search.
pub struct Study {
    seed: u64,
    pruner: MedianPruner,
    trials: Mutex<Vec<TrialRecord>>,
}

impl Study {
    pub fn new(seed: u64) -> Self {
        Self::with_pruner(seed, MedianPruner::default())
    }

    pub fn with_pruner(seed: u64, pruner: MedianPruner) -> Self {
        Self {
            seed,
            pruner,
            trials: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TrialRecord>> {
        // A worker that panicked cannot leave the list half-updated.
        self.trials.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn completed_values(&self) -> Vec<f64> {
        self.lock()
            .iter()
            .filter(|t| t.status == TrialStatus::Completed)
            .filter_map(|t| t.value)
            .collect()
    }

    pub fn trials(&self) -> Vec<TrialRecord> {
        self.lock().clone()
    }

    pub fn best_trial(&self) -> Option<BestTrial> {
        self.lock()
            .iter()
            .filter(|t| t.status == TrialStatus::Completed)
            .filter_map(|t| t.value.map(|v| (t, v)))
            .filter(|(_, v)| !v.is_nan())
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(t, value)| BestTrial {
                number: t.number,
                value,
                params: t.params.clone(),
            })
    }

    fn run_trial<F>(&self, number: usize, objective: &F) -> Result<()>
    where
        F: Fn(&mut Trial<'_>) -> Result<TrialOutcome> + Sync,
    {
        let mut trial = Trial {
            number,
            rng: StdRng::seed_from_u64(self.seed.wrapping_add(number as u64)),
            params: BTreeMap::new(),
            reported: None,
            study: self,
        };
        let index = {
            let mut trials = self.lock();
            trials.push(TrialRecord {
                number,
                params: BTreeMap::new(),
                value: None,
                status: TrialStatus::Running,
            });
            trials.len() - 1
        };

        let result = objective(&mut trial);
        let (status, value) = match &result {
            Ok(TrialOutcome::Completed(v)) => {
                info!("Trial {} finished with value {:.6}", number, v);
                (TrialStatus::Completed, Some(*v))
            }
            Ok(TrialOutcome::Pruned) => {
                info!("Trial {} pruned", number);
                (TrialStatus::Pruned, trial.reported)
            }
            Err(e) => {
                warn!("Trial {} failed: {}", number, e);
                (TrialStatus::Failed, None)
            }
        };
        {
            let mut trials = self.lock();
            let record = &mut trials[index];
            record.params = trial.params;
            record.status = status;
            record.value = value;
        }
        match result {
            Err(ForecastError::Interrupted) => Err(ForecastError::Interrupted),
            _ => Ok(()),
        }
    }

    /// Runs up to `n_trials` trials of `objective` and returns the best
    /// completed one.
    ///
    /// No trial starts once `timeout` has elapsed. With `parallel_jobs > 1`
    /// trials run on a dedicated thread pool. An interrupted objective stops
    /// the search; other objective errors only fail their own trial.
    pub fn optimize<F>(
        &self,
        objective: F,
        n_trials: usize,
        timeout: Option<Duration>,
        parallel_jobs: Option<usize>,
    ) -> Result<BestTrial>
    where
        F: Fn(&mut Trial<'_>) -> Result<TrialOutcome> + Sync,
    {
        let started = Instant::now();
        let timed_out = || timeout.is_some_and(|t| started.elapsed() >= t);
        let offset = self.lock().len();

        let jobs = parallel_jobs.unwrap_or(1).max(1);
        info!("Starting search: {} trials, {} parallel job(s), timeout {:?}", n_trials, jobs, timeout);

        if jobs == 1 {
            for i in 0..n_trials {
                if timed_out() {
                    info!("Search timeout reached after {} trials", i);
                    break;
                }
                self.run_trial(offset + i, &objective)?;
            }
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(jobs)
                .build()
                .map_err(|e| ForecastError::Search(format!("could not start worker pool: {e}")))?;
            pool.install(|| {
                (0..n_trials).into_par_iter().try_for_each(|i| {
                    if timed_out() {
                        return Ok(());
                    }
                    self.run_trial(offset + i, &objective)
                })
            })?;
        }

        let best = self
            .best_trial()
            .ok_or_else(|| ForecastError::Search("no trial completed".into()))?;
        info!("Best trial {} with value {:.6}: {:?}", best.number, best.value, best.params);
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> BTreeMap<String, ParamDistribution> {
        serde_json::from_value(json!({
            "learning_rate": {"function": "suggest_loguniform", "kwargs": {"name": "learning_rate", "low": 1e-5, "high": 1e-2}},
            "core_layers": {"function": "suggest_int", "kwargs": {"low": 1, "high": 3}},
            "dropout_fc": {"function": "suggest_float", "kwargs": {"low": 0.0, "high": 0.5}},
            "optimizer_name": {"function": "suggest_categorical", "kwargs": {"choices": ["adam", "sgd"]}}
        }))
        .unwrap()
    }

    #[test]
    fn test_settings_parse() {
        let s = settings();
        assert_eq!(s.len(), 4);
        assert_eq!(
            s["core_layers"],
            ParamDistribution::SuggestInt { low: 1, high: 3 }
        );
        let bad = serde_json::from_value::<ParamDistribution>(json!({"function": "suggest_normal", "kwargs": {}}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_samples_stay_in_range() {
        let s = settings();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..200 {
            let lr = s["learning_rate"].sample("learning_rate", &mut rng).unwrap().as_f64().unwrap();
            assert!((1e-5..=1e-2).contains(&lr));
            let layers = s["core_layers"].sample("core_layers", &mut rng).unwrap().as_i64().unwrap();
            assert!((1..=3).contains(&layers));
            let opt = s["optimizer_name"].sample("optimizer_name", &mut rng).unwrap();
            assert!(opt == json!("adam") || opt == json!("sgd"));
        }
        let inverted = ParamDistribution::SuggestUniform { low: 2.0, high: 1.0 };
        assert!(inverted.sample("x", &mut rng).is_err());
    }

    #[test]
    fn test_median_pruner() {
        let pruner = MedianPruner { startup_trials: 3 };
        assert!(!pruner.should_prune(100.0, &[1.0, 2.0]));
        assert!(pruner.should_prune(2.5, &[1.0, 2.0, 3.0, 2.0]));
        assert!(!pruner.should_prune(1.5, &[1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_optimize_finds_minimum() {
        let study = Study::new(10);
        let dist = ParamDistribution::SuggestUniform { low: -2.0, high: 2.0 };
        let best = study
            .optimize(
                |trial| {
                    let x = trial.suggest("x", &dist)?.as_f64().unwrap_or(0.0);
                    Ok(TrialOutcome::Completed((x - 0.5).powi(2)))
                },
                100,
                None,
                None,
            )
            .unwrap();
        assert!(best.value < 0.05);
        let x = best.params["x"].as_f64().unwrap();
        assert!((x - 0.5).abs() < 0.25);
        assert_eq!(study.trials().len(), 100);
    }

    #[test]
    fn test_same_seed_same_proposals_in_parallel() {
        let dist = ParamDistribution::SuggestUniform { low: 0.0, high: 1.0 };
        let run = |jobs: Option<usize>| {
            let study = Study::new(3);
            study
                .optimize(
                    |trial| Ok(TrialOutcome::Completed(trial.suggest("x", &dist)?.as_f64().unwrap_or(1.0))),
                    8,
                    None,
                    jobs,
                )
                .unwrap()
        };
        let serial = run(None);
        let parallel = run(Some(4));
        assert_eq!(serial.params, parallel.params);
        assert_eq!(serial.number, parallel.number);
    }

    #[test]
    fn test_pruned_trials_are_not_best() {
        let study = Study::with_pruner(0, MedianPruner { startup_trials: 2 });
        let values = [5.0, 4.0, 9.0, 1.0];
        let best = study
            .optimize(
                |trial| {
                    let v = values[trial.number()];
                    trial.report(v);
                    if trial.should_prune() {
                        return Ok(TrialOutcome::Pruned);
                    }
                    Ok(TrialOutcome::Completed(v))
                },
                4,
                None,
                None,
            )
            .unwrap();
        let statuses: Vec<TrialStatus> = study.trials().iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![TrialStatus::Completed, TrialStatus::Completed, TrialStatus::Pruned, TrialStatus::Completed]
        );
        assert_eq!(best.value, 1.0);
    }

    #[test]
    fn test_timeout_stops_new_trials() {
        let study = Study::new(0);
        let best = study
            .optimize(
                |_| {
                    std::thread::sleep(Duration::from_millis(30));
                    Ok(TrialOutcome::Completed(1.0))
                },
                1000,
                Some(Duration::from_millis(50)),
                None,
            )
            .unwrap();
        assert_eq!(best.value, 1.0);
        assert!(study.trials().len() < 10);
    }

    #[test]
    fn test_interrupt_aborts_search() {
        let study = Study::new(0);
        let result = study.optimize(|_| Err(ForecastError::Interrupted), 5, None, None);
        assert!(matches!(result, Err(ForecastError::Interrupted)));
        assert_eq!(study.trials().len(), 1);
    }

    #[test]
    fn test_all_failed_is_an_error() {
        let study = Study::new(0);
        let result = study.optimize(|_| Err(ForecastError::Config("bad".into())), 3, None, None);
        assert!(matches!(result, Err(ForecastError::Search(_))));
        assert!(study.trials().iter().all(|t| t.status == TrialStatus::Failed));
    }
}
