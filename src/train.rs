use crate::config::{RunConfig, INIT_RANGE, MAX_GRAD_NORM};
use crate::data::{prepare_loaders, DataLoaders, Table};
use crate::early_stopping::EarlyStopping;
use crate::error::{ForecastError, Result};
use crate::metrics::{self, Loss};
use crate::models::encoder_decoder::EncoderDecoder;
use crate::models::ForecastModel;
use crate::optim::{clip_grad_norm, ForecastOptimizer};
use crate::tensorloader::TensorLoader;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Serialize)]
pub struct EpochLogEntry {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EarlyStopped,
    MaxEpochs,
}

/// What one training run produced. The model passed to [`train`] holds the
/// best-validation parameters when this is returned.
#[derive(Clone, Debug)]
pub struct TrainOutcome {
    pub min_val_loss: f64,
    pub train_loss: f64,
    pub score: f64,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

pub struct RunStart<'a> {
    pub model_name: &'a str,
    pub loss: &'a str,
    pub max_epochs: usize,
    pub train_batches: usize,
    pub val_batches: usize,
}

pub struct EpochReport {
    pub epoch: usize,
    pub max_epochs: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub best_val_loss: f64,
    pub batches_per_sec: f64,
    pub elapsed: Duration,
}

/// Progress sink for the training loop. Observers only watch: nothing they
/// do feeds back into training.
pub trait TrainObserver {
    fn on_start(&mut self, _start: &RunStart<'_>) {}
    fn on_epoch(&mut self, _report: &EpochReport) {}
    fn on_end(&mut self, _outcome: &TrainOutcome) {}
}

impl TrainObserver for Vec<Box<dyn TrainObserver + Send>> {
    fn on_start(&mut self, start: &RunStart<'_>) {
        self.iter_mut().for_each(|o| o.on_start(start));
    }
    fn on_epoch(&mut self, report: &EpochReport) {
        self.iter_mut().for_each(|o| o.on_epoch(report));
    }
    fn on_end(&mut self, outcome: &TrainOutcome) {
        self.iter_mut().for_each(|o| o.on_end(outcome));
    }
}

/// Per-epoch progress through `tracing`, with a trend line every ten epochs.
#[derive(Default)]
pub struct TracingObserver {
    history: Vec<EpochLogEntry>,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn compute_window_trend(epoch_metrics: &[EpochLogEntry], window: usize) -> Option<(f64, f64, f64, f64)> {
    if epoch_metrics.len() < window || window < 2 {
        return None;
    }
    let slice = &epoch_metrics[epoch_metrics.len() - window..];
    let train_avg = slice.iter().map(|e| e.train_loss).sum::<f64>() / window as f64;
    let val_avg = slice.iter().map(|e| e.val_loss).sum::<f64>() / window as f64;
    let train_slope = (slice[window - 1].train_loss - slice[0].train_loss) / (window as f64 - 1.0);
    let val_slope = (slice[window - 1].val_loss - slice[0].val_loss) / (window as f64 - 1.0);
    Some((train_avg, val_avg, train_slope, val_slope))
}

impl TrainObserver for TracingObserver {
    fn on_start(&mut self, start: &RunStart<'_>) {
        self.history.clear();
        info!(
            "Training {} with {} loss: {} train batches, {} val batches per epoch, up to {} epochs",
            start.model_name, start.loss, start.train_batches, start.val_batches, start.max_epochs
        );
    }

    fn on_epoch(&mut self, r: &EpochReport) {
        info!(
            "Epoch {}/{}: Train Loss = {:.6}, Val Loss = {:.6}, {:.1} batches/s, elapsed {:.1}s",
            r.epoch,
            r.max_epochs,
            r.train_loss,
            r.val_loss,
            r.batches_per_sec,
            r.elapsed.as_secs_f64()
        );
        self.history.push(EpochLogEntry {
            epoch: r.epoch,
            train_loss: r.train_loss,
            val_loss: r.val_loss,
        });
        if r.epoch % 10 == 0 {
            if let Some((train_avg, val_avg, train_slope, val_slope)) = compute_window_trend(&self.history, 10) {
                info!(
                    "Trend@{} (last 10): train_avg={:.6}, val_avg={:.6}, train_slope={:+.6}/epoch, val_slope={:+.6}/epoch",
                    r.epoch, train_avg, val_avg, train_slope, val_slope
                );
            }
        }
    }

    fn on_end(&mut self, outcome: &TrainOutcome) {
        info!(
            "Training complete after {} epochs ({:?}). Best val loss: {:.6}, test score: {:.6}",
            outcome.epochs_run, outcome.stop_reason, outcome.min_val_loss, outcome.score
        );
    }
}

#[derive(Serialize)]
struct RealtimeLogEvent {
    event: String,
    timestamp: String,
    run_type: String,
    epoch: Option<usize>,
    train_loss: Option<f64>,
    val_loss: Option<f64>,
    best_val_loss: Option<f64>,
    message: Option<String>,
}

impl RealtimeLogEvent {
    fn new(event: &str, run_type: &str) -> Self {
        Self {
            event: event.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            run_type: run_type.to_string(),
            epoch: None,
            train_loss: None,
            val_loss: None,
            best_val_loss: None,
            message: None,
        }
    }
}

fn create_realtime_log_file(log_dir: &Path, run_type: &str) -> Result<PathBuf> {
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    let file_name = format!(
        "training_live_{}_{}_{}.jsonl",
        run_type,
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    );
    let file_path = log_dir.join(file_name);
    std::fs::File::create(&file_path)?;
    Ok(file_path)
}

fn append_realtime_event(log_path: &Path, event: &RealtimeLogEvent) -> Result<()> {
    let mut f = std::fs::OpenOptions::new().append(true).open(log_path)?;
    let line = serde_json::to_string(event)?;
    writeln!(f, "{}", line)?;
    Ok(())
}

/// Appends one JSON line per start/epoch/end event to a live log file.
pub struct LiveLogObserver {
    path: PathBuf,
    run_type: String,
}

impl LiveLogObserver {
    pub fn create(log_dir: &Path, run_type: &str) -> Result<Self> {
        let path = create_realtime_log_file(log_dir, run_type)?;
        info!("Realtime training log: {}", path.display());
        Ok(Self {
            path,
            run_type: run_type.to_string(),
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: RealtimeLogEvent) {
        if let Err(e) = append_realtime_event(&self.path, &event) {
            warn!("Failed to append realtime log: {}", e);
        }
    }
}

impl TrainObserver for LiveLogObserver {
    fn on_start(&mut self, start: &RunStart<'_>) {
        let mut event = RealtimeLogEvent::new("start", &self.run_type);
        event.message = Some(format!("training_started model={} loss={}", start.model_name, start.loss));
        self.append(event);
    }

    fn on_epoch(&mut self, r: &EpochReport) {
        let mut event = RealtimeLogEvent::new("epoch", &self.run_type);
        event.epoch = Some(r.epoch);
        event.train_loss = Some(r.train_loss);
        event.val_loss = Some(r.val_loss);
        event.best_val_loss = Some(r.best_val_loss);
        self.append(event);
    }

    fn on_end(&mut self, outcome: &TrainOutcome) {
        let mut event = RealtimeLogEvent::new("end", &self.run_type);
        event.epoch = Some(outcome.epochs_run);
        event.train_loss = Some(outcome.train_loss);
        event.best_val_loss = Some(outcome.min_val_loss);
        event.message = Some(format!("{:?} score={:.6}", outcome.stop_reason, outcome.score));
        self.append(event);
    }
}

/// Overwrites every variable with `U(-range, range)` draws from `rng`,
/// visiting variables in name order so equal seeds give equal weights.
pub fn reset_parameters<R: Rng + ?Sized>(varmap: &VarMap, rng: &mut R, range: f32) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var = &data[name];
        let values: Vec<f32> = (0..var.elem_count()).map(|_| rng.gen_range(-range..=range)).collect();
        let fresh = Tensor::from_vec(values, var.shape(), var.device())?.to_dtype(var.dtype())?;
        var.set(&fresh)?;
    }
    Ok(())
}

fn check_interrupt(interrupt: &AtomicBool) -> Result<()> {
    if interrupt.load(Ordering::Relaxed) {
        return Err(ForecastError::Interrupted);
    }
    Ok(())
}

/// Mean loss over one pass of `loader` with learning disabled.
pub fn evaluate_loss(model: &dyn ForecastModel, loader: &TensorLoader, loss: &Loss) -> Result<f64> {
    let mut rng = StdRng::seed_from_u64(0);
    let mut total = 0.0;
    for batch in loader.iter(&mut rng) {
        let batch = batch?;
        let (predictions, _) = model.forward(&batch.encoder, &batch.decoder, false)?;
        total += metrics::scalar(&loss.compute(&batch.target, &predictions)?)?;
    }
    Ok(total / loader.len().max(1) as f64)
}

/// Mean interval score of the model's `1 - alpha` prediction interval over
/// one pass of `loader`, learning disabled.
pub fn performance_test(model: &dyn ForecastModel, loader: &TensorLoader, loss: &Loss, alpha: f64) -> Result<f64> {
    let mut rng = StdRng::seed_from_u64(0);
    let mut total = 0.0;
    for batch in loader.iter(&mut rng) {
        let batch = batch?;
        let (predictions, _) = model.forward(&batch.encoder, &batch.decoder, false)?;
        let (upper, lower) = loss.interval(&predictions, alpha)?;
        total += metrics::scalar(&metrics::mis(&batch.target, &[upper, lower], alpha, true)?)?;
    }
    Ok(total / loader.len().max(1) as f64)
}

/// Collects predictions over the test split and computes the reported
/// metric set in the target's original units.
pub fn evaluate_metrics(
    model: &dyn ForecastModel,
    loaders: &DataLoaders,
    target_id: &str,
    loss: &Loss,
    alpha: f64,
) -> Result<BTreeMap<String, Vec<f64>>> {
    let mut rng = StdRng::seed_from_u64(0);
    let (mut targets, mut expected, mut uppers, mut lowers) = (vec![], vec![], vec![], vec![]);
    for batch in loaders.test.iter(&mut rng) {
        let batch = batch?;
        let (predictions, _) = model.forward(&batch.encoder, &batch.decoder, false)?;
        let (upper, lower) = loss.interval(&predictions, alpha)?;
        expected.push(loss.expected_value(&predictions)?);
        uppers.push(upper);
        lowers.push(lower);
        targets.push(batch.target);
    }
    if targets.is_empty() {
        return Ok(BTreeMap::new());
    }
    let (scale, offset) = loaders.scaler.inverse_affine(target_id);
    let unscale = |parts: &[Tensor]| -> Result<Tensor> { Ok(Tensor::cat(parts, 0)?.affine(scale, offset)?) };
    metrics::fetch_metrics(
        &unscale(&targets)?,
        &unscale(&expected)?,
        &unscale(&uppers)?,
        &unscale(&lowers)?,
        &metrics::REPORTED_METRICS,
        alpha,
        true,
    )
}

/// Trains `model` on `loaders` and scores it on the test split.
///
/// Parameters are re-initialised from `rng` first. The loop stops at
/// `max_epochs` or when early stopping fires; either way the best validation
/// checkpoint is loaded back before the test score is taken. `interrupt` is
/// polled between batches.
pub fn train(
    model: &dyn ForecastModel,
    loaders: &DataLoaders,
    config: &RunConfig,
    loss: &Loss,
    rng: &mut StdRng,
    observer: &mut dyn TrainObserver,
    interrupt: &AtomicBool,
) -> Result<TrainOutcome> {
    let started = Instant::now();
    let varmap = model.varmap();

    reset_parameters(varmap, rng, INIT_RANGE)?;
    let vars = varmap.all_vars();
    let mut opt = ForecastOptimizer::new(config.optimizer_name, vars.clone(), config.learning_rate)?;
    let mut early_stopping = EarlyStopping::new(config.patience, config.early_stopping_margin)?;
    debug!("Optimizer {} with learning rate {}", config.optimizer_name, opt.learning_rate());

    let num_train_batches = loaders.train.len();
    observer.on_start(&RunStart {
        model_name: &config.model_name,
        loss: loss.name(),
        max_epochs: config.max_epochs,
        train_batches: num_train_batches,
        val_batches: loaders.validation.len(),
    });

    let mut epoch_metrics: Vec<EpochLogEntry> = Vec::with_capacity(config.max_epochs);

    for epoch in 0..config.max_epochs {
        let epoch_start = Instant::now();
        let mut total_train_loss = 0.0;

        for batch in loaders.train.iter(rng) {
            check_interrupt(interrupt)?;
            let batch = batch?;
            let (predictions, _) = model.forward(&batch.encoder, &batch.decoder, true)?;
            let batch_loss = loss.compute(&batch.target, &predictions)?;
            let mut grads = batch_loss.backward()?;
            let norm = clip_grad_norm(&vars, &mut grads, MAX_GRAD_NORM)?;
            if !norm.is_finite() {
                debug!("Non-finite gradient norm at epoch {}", epoch + 1);
            }
            opt.step(&grads)?;
            total_train_loss += metrics::scalar(&batch_loss)?;
        }
        let avg_train_loss = total_train_loss / num_train_batches.max(1) as f64;

        check_interrupt(interrupt)?;
        let avg_val_loss = evaluate_loss(model, &loaders.validation, loss)?;
        epoch_metrics.push(EpochLogEntry {
            epoch: epoch + 1,
            train_loss: avg_train_loss,
            val_loss: avg_val_loss,
        });

        let epoch_secs = epoch_start.elapsed().as_secs_f64();
        observer.on_epoch(&EpochReport {
            epoch: epoch + 1,
            max_epochs: config.max_epochs,
            train_loss: avg_train_loss,
            val_loss: avg_val_loss,
            best_val_loss: early_stopping.best_loss().min(avg_val_loss),
            batches_per_sec: num_train_batches as f64 / epoch_secs.max(1e-9),
            elapsed: started.elapsed(),
        });

        if early_stopping.update(avg_val_loss, varmap)? {
            break;
        }
        if early_stopping.counter() > 0 {
            debug!(
                "No validation improvement for {}/{} epochs",
                early_stopping.counter(),
                config.patience
            );
        }
    }
    let stop_reason = if early_stopping.stopped() {
        StopReason::EarlyStopped
    } else {
        StopReason::MaxEpochs
    };

    if early_stopping.restore(varmap)? {
        debug!("Restored checkpoint with val loss {:.6}", early_stopping.best_loss());
    }

    check_interrupt(interrupt)?;
    let score = performance_test(model, &loaders.test, loss, config.score_alpha)?;

    let outcome = TrainOutcome {
        min_val_loss: early_stopping.best_loss(),
        train_loss: epoch_metrics.last().map(|e| e.train_loss).unwrap_or(f64::NAN),
        score,
        epochs_run: epoch_metrics.len(),
        stop_reason,
        elapsed: started.elapsed(),
    };
    observer.on_end(&outcome);
    Ok(outcome)
}

/// A freshly built and trained model together with the splits it saw.
pub struct TrainedModel {
    pub model: EncoderDecoder,
    pub loaders: DataLoaders,
    pub outcome: TrainOutcome,
}

/// Builds splits and a model from `config` and trains it with a generator
/// seeded from `config.seed`.
pub fn train_from_config(
    table: &Table,
    config: &RunConfig,
    loss: &Loss,
    device: &Device,
    observer: &mut dyn TrainObserver,
    interrupt: &AtomicBool,
) -> Result<TrainedModel> {
    let loaders = prepare_loaders(table, config, device)?;
    let model = EncoderDecoder::new(
        config,
        loaders.train.number_features1(),
        loaders.train.number_features2(),
        loss.num_outputs(),
        device,
    )?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let outcome = train(&model, &loaders, config, loss, &mut rng, observer, interrupt)?;
    Ok(TrainedModel { model, loaders, outcome })
}
