use crate::error::{ForecastError, Result};
use crate::metrics::Loss;
use crate::optim::OptimizerName;
use crate::search::ParamDistribution;
use candle_core::Device;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub const HISTORY_HORIZON: usize = 24;
pub const FORECAST_HORIZON: usize = 24;
pub const TRAIN_SPLIT: f64 = 0.6;
pub const VALIDATION_SPLIT: f64 = 0.8;
pub const BATCH_SIZE: usize = 32;
pub const MAX_EPOCHS: usize = 50;
pub const LEARNING_RATE: f64 = 1e-4;
pub const CORE_LAYERS: usize = 1;
pub const REL_CORE_HIDDEN_SIZE: f64 = 1.0;
pub const REL_LINEAR_HIDDEN_SIZE: f64 = 1.0;
pub const RELU_LEAK: f64 = 0.01;
pub const PATIENCE: usize = 7;
/// Significance level of the prediction interval scored after training.
pub const SCORE_ALPHA: f64 = 0.05;
pub const SEED: u64 = 1;
/// Global gradient norm ceiling applied before every optimizer step.
pub const MAX_GRAD_NORM: f64 = 1.0;
/// Half-width of the uniform distribution used to reset parameters.
pub const INIT_RANGE: f32 = 0.08;

pub const NUMBER_OF_TESTS: usize = 10;
pub const SEARCH_SEED: u64 = 10;

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

pub fn get_device(use_cuda: bool, cuda_id: Option<usize>) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            let ordinal = cuda_id.unwrap_or(0);
            match Device::new_cuda(ordinal) {
                Ok(device) => {
                    info!("Using CUDA device {}", ordinal);
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            let _ = cuda_id;
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }

    #[cfg(feature = "mkl")]
    info!("Using CPU device with Intel MKL BLAS acceleration");

    #[cfg(not(feature = "mkl"))]
    info!("Using CPU device");

    Device::Cpu
}

/// Resolves `path` against the working directory unless it is absolute.
pub fn resolve_path(work_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        work_dir.join(path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreNet {
    Lstm,
    Gru,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalerKind {
    Standard,
    Minmax,
}

/// Columns scaled together with one scaler kind. Columns in no group are
/// passed through unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureGroup {
    pub name: String,
    #[serde(default)]
    pub scaler: Option<ScalerKind>,
    pub features: Vec<String>,
}

/// Everything one run needs, read from the station's JSON config.
///
/// The value is never mutated in place: searched hyperparameters are merged
/// with [`RunConfig::with_overrides`] and the run controller hands back an
/// updated copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub model_name: String,
    pub data_path: PathBuf,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default)]
    pub exploration: bool,
    #[serde(default)]
    pub exploration_path: Option<PathBuf>,

    pub target_id: String,
    pub encoder_features: Vec<String>,
    pub decoder_features: Vec<String>,
    #[serde(default)]
    pub feature_groups: Vec<FeatureGroup>,

    #[serde(default = "default_history_horizon")]
    pub history_horizon: usize,
    #[serde(default = "default_forecast_horizon")]
    pub forecast_horizon: usize,
    #[serde(default = "default_train_split")]
    pub train_split: f64,
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_true")]
    pub drop_last: bool,

    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_optimizer")]
    pub optimizer_name: OptimizerName,

    #[serde(default = "default_core_net")]
    pub core_net: CoreNet,
    #[serde(default = "default_core_layers")]
    pub core_layers: usize,
    #[serde(default = "default_rel_core_hidden_size")]
    pub rel_core_hidden_size: f64,
    #[serde(default = "default_rel_linear_hidden_size")]
    pub rel_linear_hidden_size: f64,
    #[serde(default = "default_relu_leak")]
    pub relu_leak: f64,
    #[serde(default)]
    pub dropout_fc: f64,
    #[serde(default)]
    pub dropout_core: f64,

    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub early_stopping_margin: f64,
    #[serde(default = "default_score_alpha")]
    pub score_alpha: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub cuda_id: Option<usize>,

    #[serde(default)]
    pub best_loss: Option<f64>,
    #[serde(default)]
    pub best_score: Option<f64>,
    /// Loss the saved model was trained with. A saved model is only
    /// comparable with a new one trained under the same loss.
    #[serde(default)]
    pub model_loss: Option<Loss>,
}

fn default_output_path() -> PathBuf {
    PathBuf::from("oracles")
}
fn default_log_path() -> PathBuf {
    PathBuf::from("logs")
}
fn default_history_horizon() -> usize {
    HISTORY_HORIZON
}
fn default_forecast_horizon() -> usize {
    FORECAST_HORIZON
}
fn default_train_split() -> f64 {
    TRAIN_SPLIT
}
fn default_validation_split() -> f64 {
    VALIDATION_SPLIT
}
fn default_batch_size() -> usize {
    BATCH_SIZE
}
fn default_true() -> bool {
    true
}
fn default_max_epochs() -> usize {
    MAX_EPOCHS
}
fn default_learning_rate() -> f64 {
    LEARNING_RATE
}
fn default_optimizer() -> OptimizerName {
    OptimizerName::Adam
}
fn default_core_net() -> CoreNet {
    CoreNet::Lstm
}
fn default_core_layers() -> usize {
    CORE_LAYERS
}
fn default_rel_core_hidden_size() -> f64 {
    REL_CORE_HIDDEN_SIZE
}
fn default_rel_linear_hidden_size() -> f64 {
    REL_LINEAR_HIDDEN_SIZE
}
fn default_relu_leak() -> f64 {
    RELU_LEAK
}
fn default_patience() -> usize {
    PATIENCE
}
fn default_score_alpha() -> f64 {
    SCORE_ALPHA
}
fn default_seed() -> u64 {
    SEED
}

impl RunConfig {
    /// Minimal config for the given columns; every other field takes its default.
    #[cfg(test)]
    pub fn new(
        model_name: &str,
        data_path: impl Into<PathBuf>,
        target_id: &str,
        encoder_features: &[&str],
        decoder_features: &[&str],
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            data_path: data_path.into(),
            output_path: default_output_path(),
            log_path: default_log_path(),
            exploration: false,
            exploration_path: None,
            target_id: target_id.to_string(),
            encoder_features: encoder_features.iter().map(|s| s.to_string()).collect(),
            decoder_features: decoder_features.iter().map(|s| s.to_string()).collect(),
            feature_groups: Vec::new(),
            history_horizon: HISTORY_HORIZON,
            forecast_horizon: FORECAST_HORIZON,
            train_split: TRAIN_SPLIT,
            validation_split: VALIDATION_SPLIT,
            batch_size: BATCH_SIZE,
            shuffle: true,
            drop_last: true,
            max_epochs: MAX_EPOCHS,
            learning_rate: LEARNING_RATE,
            optimizer_name: OptimizerName::Adam,
            core_net: CoreNet::Lstm,
            core_layers: CORE_LAYERS,
            rel_core_hidden_size: REL_CORE_HIDDEN_SIZE,
            rel_linear_hidden_size: REL_LINEAR_HIDDEN_SIZE,
            relu_leak: RELU_LEAK,
            dropout_fc: 0.0,
            dropout_core: 0.0,
            patience: PATIENCE,
            early_stopping_margin: 0.0,
            score_alpha: SCORE_ALPHA,
            seed: SEED,
            cuda_id: None,
            best_loss: None,
            best_score: None,
            model_loss: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ForecastError::Config(msg));

        if self.history_horizon == 0 || self.forecast_horizon == 0 {
            return fail("history_horizon and forecast_horizon must be positive".into());
        }
        if self.batch_size == 0 {
            return fail("batch_size must be positive".into());
        }
        if !(0.0 < self.train_split
            && self.train_split < self.validation_split
            && self.validation_split < 1.0)
        {
            return fail(format!(
                "splits must satisfy 0 < train_split ({}) < validation_split ({}) < 1",
                self.train_split, self.validation_split
            ));
        }
        if self.encoder_features.is_empty() || self.decoder_features.is_empty() {
            return fail("encoder_features and decoder_features must not be empty".into());
        }
        if !(self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if self.core_layers == 0 {
            return fail("core_layers must be at least 1".into());
        }
        if self.rel_core_hidden_size <= 0.0 || self.rel_linear_hidden_size <= 0.0 {
            return fail("relative hidden sizes must be positive".into());
        }
        for (name, p) in [("dropout_fc", self.dropout_fc), ("dropout_core", self.dropout_core)] {
            if !(0.0..1.0).contains(&p) {
                return fail(format!("{name} must lie in [0, 1), got {p}"));
            }
        }
        if !(self.score_alpha > 0.0 && self.score_alpha < 1.0) {
            return fail(format!("score_alpha must lie in (0, 1), got {}", self.score_alpha));
        }
        if self.patience == 0 {
            return fail("patience must be at least 1".into());
        }
        Ok(())
    }

    /// Returns a copy with `overrides` merged in. Keys that are not fields of
    /// the config, or values of the wrong type, are configuration errors.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, serde_json::Value>) -> Result<Self> {
        let mut value = serde_json::to_value(self)?;
        let fields = value
            .as_object_mut()
            .ok_or_else(|| ForecastError::Config("config did not serialize to an object".into()))?;
        for (key, v) in overrides {
            if !fields.contains_key(key) {
                return Err(ForecastError::Config(format!("unknown hyperparameter '{key}'")));
            }
            fields.insert(key.clone(), v.clone());
        }
        let merged: RunConfig = serde_json::from_value(value)
            .map_err(|e| ForecastError::Config(format!("invalid hyperparameter value: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }

    /// Encoder, decoder and target columns without duplicates, in first-seen order.
    pub fn required_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        for c in self
            .encoder_features
            .iter()
            .chain(self.decoder_features.iter())
            .chain(std::iter::once(&self.target_id))
        {
            if !columns.contains(c) {
                columns.push(c.clone());
            }
        }
        columns
    }
}

/// Search settings file (`exploration_path`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TuningConfig {
    #[serde(default = "default_number_of_tests")]
    pub number_of_tests: usize,
    /// Wall-clock budget in seconds after which no new trial is started.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub parallel_jobs: Option<usize>,
    #[serde(default = "default_search_seed")]
    pub seed: u64,
    pub settings: BTreeMap<String, ParamDistribution>,
}

fn default_number_of_tests() -> usize {
    NUMBER_OF_TESTS
}
fn default_search_seed() -> u64 {
    SEARCH_SEED
}

pub fn read_config(path: &Path) -> Result<RunConfig> {
    let raw = std::fs::read_to_string(path)?;
    let config: RunConfig = serde_json::from_str(&raw)
        .map_err(|e| ForecastError::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

pub fn read_tuning_config(path: &Path) -> Result<TuningConfig> {
    let raw = std::fs::read_to_string(path)?;
    let tuning: TuningConfig = serde_json::from_str(&raw)
        .map_err(|e| ForecastError::Config(format!("{}: {e}", path.display())))?;
    if tuning.settings.is_empty() {
        return Err(ForecastError::Config(format!(
            "{}: search settings are empty",
            path.display()
        )));
    }
    Ok(tuning)
}

pub fn write_config(config: &RunConfig, path: &Path) -> Result<()> {
    crate::model_artifacts::write_atomically(path, |w| {
        serde_json::to_writer_pretty(&mut *w, config)?;
        Ok(())
    })?;
    info!("Configuration written to {}", path.display());
    Ok(())
}
