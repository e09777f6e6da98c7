use crate::config::{read_tuning_config, resolve_path, write_config, CoreNet, RunConfig};
use crate::data::Table;
use crate::error::{ForecastError, Result};
use crate::metrics::Loss;
use crate::model_artifacts::{
    append_csv_rows, load_prior_model, model_path, run_log_path, stage_model_snapshot, write_atomically, PriorModel,
};
use crate::models::ForecastModel;
use crate::objective::TrialObjective;
use crate::optim::OptimizerName;
use crate::search::{Study, TrialStatus};
use crate::train::{
    evaluate_metrics, performance_test, train_from_config, LiveLogObserver, TracingObserver, TrainObserver, TrainOutcome,
    TrainedModel,
};
use anyhow::Context;
use candle_core::Device;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Policy and environment of a run. Everything the run decides on that is
/// not part of the persisted configuration lives here.
pub struct RunOptions {
    pub loss: Loss,
    /// Replace the stored hyperparameters when a search beats `best_loss`.
    pub auto_accept_improvements: bool,
    pub work_dir: PathBuf,
    /// Where the configuration is rewritten after an improvement.
    pub config_path: PathBuf,
    pub live_log: bool,
    pub device: Device,
}

/// What a run did. `config` is the configuration in effect afterwards: the
/// updated one when the model improved, the input otherwise.
#[derive(Debug)]
pub struct RunReport {
    pub config: RunConfig,
    pub improved: bool,
    pub score: Option<f64>,
    pub baseline_score: Option<f64>,
    /// Reported metrics of the new model on the test split.
    pub test_metrics: BTreeMap<String, f64>,
    pub interrupted: bool,
    pub model_path: PathBuf,
}

/// One row of the run log per completed final training: the hyperparameters
/// it ran with and what it achieved.
#[derive(Debug, Serialize)]
struct RunLogRow {
    time: String,
    model_name: String,
    loss: String,
    history_horizon: usize,
    forecast_horizon: usize,
    batch_size: usize,
    max_epochs: usize,
    learning_rate: f64,
    optimizer_name: OptimizerName,
    core_net: CoreNet,
    core_layers: usize,
    rel_core_hidden_size: f64,
    rel_linear_hidden_size: f64,
    relu_leak: f64,
    dropout_fc: f64,
    dropout_core: f64,
    patience: usize,
    early_stopping_margin: f64,
    seed: u64,
    epochs_run: usize,
    train_loss: f64,
    min_val_loss: f64,
    score: f64,
    baseline_score: Option<f64>,
    improved: bool,
    elapsed_secs: f64,
}

impl RunLogRow {
    fn new(config: &RunConfig, loss: &Loss, outcome: &TrainOutcome) -> Self {
        Self {
            time: Utc::now().to_rfc3339(),
            model_name: config.model_name.clone(),
            loss: loss.name().to_string(),
            history_horizon: config.history_horizon,
            forecast_horizon: config.forecast_horizon,
            batch_size: config.batch_size,
            max_epochs: config.max_epochs,
            learning_rate: config.learning_rate,
            optimizer_name: config.optimizer_name,
            core_net: config.core_net,
            core_layers: config.core_layers,
            rel_core_hidden_size: config.rel_core_hidden_size,
            rel_linear_hidden_size: config.rel_linear_hidden_size,
            relu_leak: config.relu_leak,
            dropout_fc: config.dropout_fc,
            dropout_core: config.dropout_core,
            patience: config.patience,
            early_stopping_margin: config.early_stopping_margin,
            seed: config.seed,
            epochs_run: outcome.epochs_run,
            train_loss: outcome.train_loss,
            min_val_loss: outcome.min_val_loss,
            score: outcome.score,
            baseline_score: None,
            improved: false,
            elapsed_secs: outcome.elapsed.as_secs_f64(),
        }
    }
}

struct Execution {
    config: RunConfig,
    improved: bool,
    score: f64,
    baseline_score: Option<f64>,
    test_metrics: BTreeMap<String, f64>,
}

/// A strictly lower finite score replaces the baseline; ties keep the old model.
pub fn is_improvement(score: f64, baseline: Option<f64>) -> bool {
    score.is_finite() && baseline.is_none_or(|b| score < b)
}

/// Drives one run: optional search, final training, comparison against the
/// previously saved model and persistence of the winner.
pub struct RunController {
    options: RunOptions,
    interrupt: Arc<AtomicBool>,
}

impl RunController {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag polled by training and search; raising it stops the run at the
    /// next batch.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn run(&self, config: &RunConfig) -> anyhow::Result<RunReport> {
        config.validate().context("invalid run configuration")?;
        let data_path = resolve_path(&self.options.work_dir, &config.data_path);
        let table = Table::read_csv(&data_path).with_context(|| format!("failed to read {}", data_path.display()))?;
        self.run_on_table(config, &table, Vec::new())
    }

    /// Runs on an already loaded table. `extra_sinks` receive the final
    /// training's progress next to the built-in ones.
    pub fn run_on_table(
        &self,
        config: &RunConfig,
        table: &Table,
        extra_sinks: Vec<Box<dyn TrainObserver + Send>>,
    ) -> anyhow::Result<RunReport> {
        for column in config.required_columns() {
            table
                .column(&column)
                .with_context(|| format!("data for model '{}' is incomplete", config.model_name))?;
        }
        let mut sinks: Vec<Box<dyn TrainObserver + Send>> = vec![Box::new(TracingObserver::new())];
        if self.options.live_log {
            let log_dir = resolve_path(&self.options.work_dir, &config.log_path);
            sinks.push(Box::new(LiveLogObserver::create(&log_dir, "train")?));
        }
        sinks.extend(extra_sinks);

        let mut log_row = None;
        let result = self.execute(config, table, &mut sinks, &mut log_row);

        // Written whenever the final training finished, even if a later step failed.
        let log_path = run_log_path(&self.options.work_dir, config);
        let logged = match &log_row {
            Some(row) => {
                let written = append_csv_rows(&log_path, std::slice::from_ref(row));
                match &written {
                    Ok(()) => info!("Run log written to {}", log_path.display()),
                    Err(e) => warn!("Could not write run log {}: {}", log_path.display(), e),
                }
                written
            }
            None => Ok(()),
        };

        let model_path = model_path(&self.options.work_dir, config);
        match result {
            Ok(execution) => {
                logged.context("failed to write run log")?;
                Ok(RunReport {
                    config: execution.config,
                    improved: execution.improved,
                    score: Some(execution.score),
                    baseline_score: execution.baseline_score,
                    test_metrics: execution.test_metrics,
                    interrupted: false,
                    model_path,
                })
            }
            Err(ForecastError::Interrupted) => {
                warn!("Run interrupted; keeping the previously saved model and configuration");
                Ok(RunReport {
                    config: config.clone(),
                    improved: false,
                    score: None,
                    baseline_score: None,
                    test_metrics: BTreeMap::new(),
                    interrupted: true,
                    model_path,
                })
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("run for model '{}' failed", config.model_name))),
        }
    }

    fn execute(
        &self,
        stored: &RunConfig,
        table: &Table,
        observer: &mut dyn TrainObserver,
        log_row: &mut Option<RunLogRow>,
    ) -> Result<Execution> {
        let opts = &self.options;
        let candidate = self.search(stored, table)?;

        info!("Final training for model '{}'", candidate.model_name);
        let trained = train_from_config(table, &candidate, &opts.loss, &opts.device, observer, &self.interrupt)?;
        let score = trained.outcome.score;
        let row = log_row.insert(RunLogRow::new(&candidate, &opts.loss, &trained.outcome));

        let baseline_score = self.baseline_score(stored, &candidate, &trained)?;
        row.baseline_score = baseline_score;
        let test_metrics = self.report_metrics(&candidate, &trained);

        if !is_improvement(score, baseline_score) {
            info!(
                "Existing model did not improve (score {:.6} vs {:.6}); discarding the new model",
                score,
                baseline_score.unwrap_or(f64::NAN)
            );
            return Ok(Execution {
                config: stored.clone(),
                improved: false,
                score,
                baseline_score,
                test_metrics,
            });
        }

        let mut updated = candidate;
        updated.best_score = Some(score);
        updated.best_loss = Some(trained.outcome.min_val_loss);
        updated.model_loss = Some(opts.loss.clone());
        self.persist(stored, &updated, &trained)?;
        row.improved = true;

        Ok(Execution {
            config: updated,
            improved: true,
            score,
            baseline_score,
            test_metrics,
        })
    }

    /// Writes the new model and the configuration describing it. The snapshot
    /// only replaces the old one after the configuration was written; if that
    /// last step fails the previous configuration file is put back.
    fn persist(&self, stored: &RunConfig, updated: &RunConfig, trained: &TrainedModel) -> Result<()> {
        let opts = &self.options;
        let staged = stage_model_snapshot(trained.model.varmap(), &model_path(&opts.work_dir, stored))?;
        info!(
            "Model improvement achieved (score {:.6}); saving {}",
            updated.best_score.unwrap_or(f64::NAN),
            staged.path().display()
        );

        let previous = match fs::read(&opts.config_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        write_config(updated, &opts.config_path)?;

        if let Err(e) = staged.commit() {
            warn!(
                "Could not move the new model into place ({}); restoring {}",
                e,
                opts.config_path.display()
            );
            match previous {
                Some(bytes) => write_atomically(&opts.config_path, |w| Ok(w.write_all(&bytes)?))?,
                None => fs::remove_file(&opts.config_path)?,
            }
            return Err(e);
        }
        Ok(())
    }

    /// Reported metrics of the new model. They are informational only, so a
    /// failure here is logged and does not cost the trained model.
    fn report_metrics(&self, config: &RunConfig, trained: &TrainedModel) -> BTreeMap<String, f64> {
        let opts = &self.options;
        match evaluate_metrics(&trained.model, &trained.loaders, &config.target_id, &opts.loss, config.score_alpha) {
            Ok(report) => {
                let metrics: BTreeMap<String, f64> = report
                    .into_iter()
                    .filter_map(|(name, values)| values.first().map(|v| (name, *v)))
                    .collect();
                for (name, value) in &metrics {
                    info!("Test {}: {:.6}", name, value);
                }
                metrics
            }
            Err(e) => {
                warn!("Could not compute test metrics: {}", e);
                BTreeMap::new()
            }
        }
    }

    /// Runs the hyperparameter search when `exploration` is on and returns
    /// the configuration the final training should use.
    fn search(&self, stored: &RunConfig, table: &Table) -> Result<RunConfig> {
        if !stored.exploration {
            return Ok(stored.clone());
        }
        let opts = &self.options;
        let settings_path = stored
            .exploration_path
            .as_ref()
            .ok_or_else(|| ForecastError::Config("exploration is enabled but exploration_path is not set".into()))?;
        let tuning = read_tuning_config(&resolve_path(&opts.work_dir, settings_path))?;
        let timeout = tuning
            .timeout
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(|e| ForecastError::Config(format!("invalid search timeout: {e}")))?;

        let objective = TrialObjective {
            table,
            base: stored,
            settings: &tuning.settings,
            loss: &opts.loss,
            device: &opts.device,
            interrupt: &self.interrupt,
        };
        let study = Study::new(tuning.seed);
        let best = study.optimize(
            |trial| objective.run(trial),
            tuning.number_of_tests,
            timeout,
            tuning.parallel_jobs,
        )?;
        let trials = study.trials();
        let count = |status: TrialStatus| trials.iter().filter(|t| t.status == status).count();
        info!(
            "Search finished: {} completed, {} pruned, {} failed",
            count(TrialStatus::Completed),
            count(TrialStatus::Pruned),
            count(TrialStatus::Failed)
        );

        let stored_loss = stored.best_loss.unwrap_or(f64::INFINITY);
        if best.value >= stored_loss {
            info!(
                "Search best {:.6} does not beat stored best_loss {:.6}; keeping stored hyperparameters",
                best.value, stored_loss
            );
            return Ok(stored.clone());
        }
        if !opts.auto_accept_improvements {
            info!(
                "Search best {:.6} beats stored best_loss {:.6}, but improvements are not auto-accepted; \
                 training with hyperparameters from the configuration",
                best.value, stored_loss
            );
            return Ok(stored.clone());
        }
        info!("Accepting searched hyperparameters: {:?}", best.params);
        stored.with_overrides(&best.params)
    }

    /// Scores the previously saved model on the new test split. A missing
    /// snapshot, or one that cannot stand in for the current loss and
    /// architecture, means there is no baseline.
    fn baseline_score(&self, stored: &RunConfig, candidate: &RunConfig, trained: &TrainedModel) -> Result<Option<f64>> {
        let opts = &self.options;
        let path = model_path(&opts.work_dir, stored);
        let test = &trained.loaders.test;
        let prior = load_prior_model(
            &path,
            stored,
            &opts.loss,
            test.number_features1(),
            test.number_features2(),
            &opts.device,
        );
        match prior {
            PriorModel::Missing => {
                info!("No previous model at {}; any finite score is an improvement", path.display());
                Ok(None)
            }
            PriorModel::Unusable(reason) => {
                warn!(
                    "An older model was found at {} but cannot serve as baseline ({}); continuing without baseline",
                    path.display(),
                    reason
                );
                Ok(None)
            }
            PriorModel::Loaded(model) => {
                let score = performance_test(&model, test, &opts.loss, candidate.score_alpha)?;
                info!("Previous model scores {:.6} on the current test split", score);
                Ok(Some(score))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::read_config;
    use crate::data::mock_table;
    use crate::train::EpochReport;
    use std::path::Path;
    use std::sync::atomic::Ordering;

    fn base_config() -> RunConfig {
        let mut config = RunConfig::new("station", "unused.csv", "y", &["x", "y"], &["z"]);
        config.history_horizon = 4;
        config.forecast_horizon = 2;
        config.batch_size = 8;
        config.max_epochs = 3;
        config.learning_rate = 1e-2;
        config
    }

    fn table() -> Table {
        mock_table(120, &["x", "z", "y"], |c, r| (r as f64 / 6.0).sin() * (c + 1) as f64)
    }

    fn controller_with(work_dir: &Path, auto_accept: bool, loss: Loss) -> RunController {
        RunController::new(RunOptions {
            loss,
            auto_accept_improvements: auto_accept,
            work_dir: work_dir.to_path_buf(),
            config_path: work_dir.join("station.json"),
            live_log: false,
            device: Device::Cpu,
        })
    }

    fn controller(work_dir: &Path, auto_accept: bool) -> RunController {
        controller_with(work_dir, auto_accept, Loss::Nllg)
    }

    fn log_records(work_dir: &Path, config: &RunConfig) -> Vec<BTreeMap<String, String>> {
        let path = run_log_path(work_dir, config);
        if !path.exists() {
            return Vec::new();
        }
        csv::Reader::from_path(path)
            .unwrap()
            .deserialize()
            .collect::<std::result::Result<_, _>>()
            .unwrap()
    }

    /// Raises the interrupt flag once `after` epochs have been reported.
    struct InterruptAfter {
        flag: Arc<AtomicBool>,
        after: usize,
    }

    impl TrainObserver for InterruptAfter {
        fn on_epoch(&mut self, report: &EpochReport) {
            if report.epoch >= self.after {
                self.flag.store(true, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_strictly_lower_score_wins() {
        assert!(is_improvement(1.0, None));
        assert!(is_improvement(1.0, Some(1.5)));
        assert!(!is_improvement(1.5, Some(1.5)));
        assert!(!is_improvement(2.0, Some(1.5)));
        assert!(!is_improvement(f64::NAN, None));
        assert!(!is_improvement(f64::INFINITY, None));
    }

    #[test]
    fn test_first_run_persists_model_and_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = base_config();
        let report = controller(dir.path(), false).run_on_table(&config, &table(), Vec::new())?;

        assert!(report.improved);
        assert!(!report.interrupted);
        assert!(report.baseline_score.is_none());
        assert!(report.model_path.exists());
        assert!(report.test_metrics.contains_key("mse"));
        assert!(report.test_metrics["picp"] >= 0.0);
        assert!(report.test_metrics.contains_key("picp_loss"));

        let written = read_config(&dir.path().join("station.json"))?;
        assert_eq!(written, report.config);
        assert_eq!(written.best_score, report.score);
        assert!(written.best_loss.is_some());
        assert_eq!(written.model_loss, Some(Loss::Nllg));

        let rows = log_records(dir.path(), &config);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["learning_rate"], "0.01");
        assert_eq!(rows[0]["optimizer_name"], "adam");
        assert_eq!(rows[0]["epochs_run"], config.max_epochs.to_string());
        assert_eq!(rows[0]["improved"], "true");
        assert_eq!(rows[0]["baseline_score"], "");
        assert!(rows[0]["elapsed_secs"].parse::<f64>()? >= 0.0);
        Ok(())
    }

    #[test]
    fn test_second_run_compares_against_saved_model() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = table();
        let first = controller(dir.path(), false).run_on_table(&base_config(), &table, Vec::new())?;
        let saved = fs::read(&first.model_path)?;

        let second = controller(dir.path(), false).run_on_table(&first.config, &table, Vec::new())?;
        let baseline = second.baseline_score.expect("saved model should be rescored");
        let first_score = first.score.unwrap();
        assert!((baseline - first_score).abs() < 1e-6 * first_score.abs().max(1.0));

        let score = second.score.unwrap();
        assert_eq!(second.improved, score < baseline);
        if !second.improved {
            assert_eq!(fs::read(&second.model_path)?, saved);
            assert_eq!(second.config, first.config);
        }
        let rows = log_records(dir.path(), &first.config);
        assert_eq!(rows.len(), 2);
        assert!(!rows[1]["baseline_score"].is_empty());
        Ok(())
    }

    #[test]
    fn test_model_from_other_loss_is_no_baseline() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let table = table();
        let first = controller_with(dir.path(), false, Loss::Mis { alpha: 0.05 }).run_on_table(
            &base_config(),
            &table,
            Vec::new(),
        )?;
        assert!(first.improved);
        assert_eq!(first.config.model_loss, Some(Loss::Mis { alpha: 0.05 }));

        let second = controller(dir.path(), false).run_on_table(&first.config, &table, Vec::new())?;
        assert!(second.baseline_score.is_none());
        assert!(second.improved);
        assert_eq!(second.config.model_loss, Some(Loss::Nllg));
        Ok(())
    }

    #[test]
    fn test_corrupt_prior_model_means_no_baseline() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = base_config();
        config.model_loss = Some(Loss::Nllg);
        let path = model_path(dir.path(), &config);
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(&path, b"garbage")?;

        let report = controller(dir.path(), false).run_on_table(&config, &table(), Vec::new())?;
        assert!(report.baseline_score.is_none());
        assert!(report.improved);
        assert_ne!(fs::read(&path)?, b"garbage".to_vec());
        Ok(())
    }

    #[test]
    fn test_interrupt_skips_model_and_log_row() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = base_config();
        config.max_epochs = 10;
        let controller = controller(dir.path(), false);
        let sink = InterruptAfter {
            flag: controller.interrupt_flag(),
            after: 2,
        };

        let report = controller.run_on_table(&config, &table(), vec![Box::new(sink)])?;
        assert!(report.interrupted);
        assert!(!report.improved);
        assert_eq!(report.config, config);
        assert!(!report.model_path.exists());
        assert!(!dir.path().join("station.json").exists());
        assert!(log_records(dir.path(), &config).is_empty());
        Ok(())
    }

    #[test]
    fn test_failing_metric_report_keeps_trained_model() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = base_config();
        config.batch_size = 1;
        config.max_epochs = 2;
        // 30 rows: the test split holds 6 rows, a single window, too few for MASE
        let table = mock_table(30, &["x", "z", "y"], |c, r| (r as f64 / 4.0).cos() + c as f64);

        let report = controller(dir.path(), false).run_on_table(&config, &table, Vec::new())?;
        assert!(report.test_metrics.is_empty());
        assert!(report.improved);
        assert!(report.model_path.exists());
        assert!(dir.path().join("station.json").exists());
        Ok(())
    }

    #[test]
    fn test_failed_snapshot_move_restores_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = base_config();
        let config_path = dir.path().join("station.json");
        write_config(&config, &config_path)?;
        let before = fs::read(&config_path)?;
        // a directory where the snapshot belongs makes the final rename fail
        let snapshot = model_path(dir.path(), &config);
        fs::create_dir_all(&snapshot)?;

        let result = controller(dir.path(), false).run_on_table(&config, &table(), Vec::new());
        assert!(result.is_err());
        assert_eq!(fs::read(&config_path)?, before);
        assert!(snapshot.is_dir());
        assert_eq!(fs::read_dir(snapshot.parent().unwrap())?.count(), 1);

        let rows = log_records(dir.path(), &config);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["improved"], "false");
        Ok(())
    }

    #[test]
    fn test_failed_config_write_leaves_no_snapshot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = base_config();
        fs::create_dir_all(dir.path().join("station.json"))?;

        let result = controller(dir.path(), false).run_on_table(&config, &table(), Vec::new());
        assert!(result.is_err());
        let snapshot = model_path(dir.path(), &config);
        assert!(!snapshot.exists());
        assert_eq!(fs::read_dir(snapshot.parent().unwrap())?.count(), 0);
        Ok(())
    }

    fn write_tuning(dir: &Path) -> PathBuf {
        let path = dir.join("tuning.json");
        fs::write(
            &path,
            r#"{
                "number_of_tests": 2,
                "settings": {
                    "learning_rate": {"function": "suggest_loguniform", "kwargs": {"low": 0.001, "high": 0.005}}
                }
            }"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_search_results_accepted_only_with_flag() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = base_config();
        config.max_epochs = 2;
        config.exploration = true;
        config.exploration_path = Some(write_tuning(dir.path()));

        let declined = controller(dir.path(), false).run_on_table(&config, &table(), Vec::new())?;
        assert_eq!(declined.config.learning_rate, config.learning_rate);

        let other = tempfile::tempdir()?;
        let accepted = controller(other.path(), true).run_on_table(&config, &table(), Vec::new())?;
        assert!(accepted.improved);
        assert!((0.001..=0.005).contains(&accepted.config.learning_rate));
        Ok(())
    }

    #[test]
    fn test_exploration_without_settings_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config();
        config.exploration = true;
        let result = controller(dir.path(), true).run_on_table(&config, &table(), Vec::new());
        assert!(result.is_err());
    }
}
