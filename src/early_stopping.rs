use crate::error::Result;
use candle_nn::VarMap;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{debug, info};

const CHECKPOINT_FILE: &str = "checkpoint.safetensors";

/// Stops training once the validation loss has not improved by more than
/// `margin` for `patience` consecutive epochs.
///
/// Every improvement writes the model variables to a checkpoint in a scratch
/// directory owned by the controller; the directory is removed on drop.
#[derive(Debug)]
pub struct EarlyStopping {
    patience: usize,
    margin: f64,
    best_loss: f64,
    counter: usize,
    stopped: bool,
    scratch: TempDir,
    has_checkpoint: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, margin: f64) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("loadcast-checkpoint").tempdir()?;
        Ok(Self {
            patience,
            margin,
            best_loss: f64::INFINITY,
            counter: 0,
            stopped: false,
            scratch,
            has_checkpoint: false,
        })
    }

    /// Feeds one epoch's validation loss. Returns `true` when training
    /// should stop.
    pub fn update(&mut self, val_loss: f64, varmap: &VarMap) -> Result<bool> {
        if val_loss < self.best_loss - self.margin {
            debug!(
                "Validation loss improved {:.6} -> {:.6}, saving checkpoint",
                self.best_loss, val_loss
            );
            self.best_loss = val_loss;
            self.counter = 0;
            varmap.save(self.checkpoint_path())?;
            self.has_checkpoint = true;
        } else {
            self.counter += 1;
            debug!("EarlyStopping counter: {} out of {}", self.counter, self.patience);
            if self.counter >= self.patience {
                info!(
                    "Early stopping: no improvement for {} epochs (best loss: {:.6})",
                    self.patience, self.best_loss
                );
                self.stopped = true;
            }
        }
        Ok(self.stopped)
    }

    /// Loads the best checkpoint back into `varmap`. Without a checkpoint
    /// (no epoch ever improved on +inf) the variables are left untouched.
    pub fn restore(&self, varmap: &VarMap) -> Result<bool> {
        if !self.has_checkpoint {
            return Ok(false);
        }
        let mut target = varmap.clone();
        target.load(self.checkpoint_path())?;
        Ok(true)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.scratch.path().join(CHECKPOINT_FILE)
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }
}
