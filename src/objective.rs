use crate::config::RunConfig;
use crate::data::Table;
use crate::error::Result;
use crate::metrics::Loss;
use crate::search::{ParamDistribution, Trial};
use crate::train::{train_from_config, TracingObserver};
use candle_core::Device;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use tracing::info;

/// Result of one search trial. A pruned trial carries no value, so it can
/// never be mistaken for a score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrialOutcome {
    Completed(f64),
    Pruned,
}

/// One training run as a search objective: sample the settings, merge them
/// into a copy of the base config, train a fresh model on fresh splits and
/// return its minimum validation loss.
pub struct TrialObjective<'a> {
    pub table: &'a Table,
    pub base: &'a RunConfig,
    pub settings: &'a BTreeMap<String, ParamDistribution>,
    pub loss: &'a Loss,
    pub device: &'a Device,
    pub interrupt: &'a AtomicBool,
}

impl TrialObjective<'_> {
    pub fn run(&self, trial: &mut Trial<'_>) -> Result<TrialOutcome> {
        let overrides = trial.suggest_all(self.settings)?;
        let config = self.base.with_overrides(&overrides)?;
        info!("Trial {} parameters: {}", trial.number(), serde_json::to_string(trial.params())?);

        let trained = train_from_config(
            self.table,
            &config,
            self.loss,
            self.device,
            &mut TracingObserver::new(),
            self.interrupt,
        )?;
        let val_loss = trained.outcome.min_val_loss;
        trial.report(val_loss);
        if trial.should_prune() {
            return Ok(TrialOutcome::Pruned);
        }
        Ok(TrialOutcome::Completed(val_loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::mock_table;
    use crate::error::ForecastError;
    use crate::search::Study;
    use serde_json::json;

    fn base_config() -> RunConfig {
        let mut config = RunConfig::new("trial", "trial.csv", "y", &["x"], &["z"]);
        config.history_horizon = 4;
        config.forecast_horizon = 2;
        config.batch_size = 8;
        config.max_epochs = 2;
        config
    }

    fn table() -> Table {
        mock_table(120, &["x", "z", "y"], |c, r| (r as f64 / 5.0).sin() + c as f64)
    }

    #[test]
    fn test_trials_return_searched_parameters() {
        let table = table();
        let base = base_config();
        let settings: BTreeMap<String, ParamDistribution> = serde_json::from_value(json!({
            "learning_rate": {"function": "suggest_loguniform", "kwargs": {"low": 1e-4, "high": 1e-2}},
            "optimizer_name": {"function": "suggest_categorical", "kwargs": {"choices": ["adam", "rmsprop"]}}
        }))
        .unwrap();
        let interrupt = AtomicBool::new(false);
        let objective = TrialObjective {
            table: &table,
            base: &base,
            settings: &settings,
            loss: &Loss::Nllg,
            device: &Device::Cpu,
            interrupt: &interrupt,
        };

        let study = Study::new(10);
        let best = study.optimize(|trial| objective.run(trial), 2, None, None).unwrap();
        assert!(best.value.is_finite());
        assert!(best.params.contains_key("learning_rate"));
        assert!(best.params.contains_key("optimizer_name"));
        let merged = base.with_overrides(&best.params).unwrap();
        assert_ne!(merged.learning_rate, base.learning_rate);
    }

    #[test]
    fn test_unknown_setting_fails_the_trial() {
        let table = table();
        let base = base_config();
        let settings: BTreeMap<String, ParamDistribution> = serde_json::from_value(json!({
            "hidden_units": {"function": "suggest_int", "kwargs": {"low": 1, "high": 4}}
        }))
        .unwrap();
        let interrupt = AtomicBool::new(false);
        let objective = TrialObjective {
            table: &table,
            base: &base,
            settings: &settings,
            loss: &Loss::Nllg,
            device: &Device::Cpu,
            interrupt: &interrupt,
        };

        let study = Study::new(0);
        let result = study.optimize(|trial| objective.run(trial), 1, None, None);
        assert!(matches!(result, Err(ForecastError::Search(_))));
    }
}
