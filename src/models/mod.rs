pub mod encoder_decoder;

use candle_core::{Result, Tensor};
use candle_nn::VarMap;

/// A sequence-to-sequence forecaster as seen by the training loop.
///
/// `forward` maps `encoder [B, history, F_enc]` and `decoder
/// [B, forecast, F_dec]` to a list of `[B, forecast, 1]` predictions (as
/// many as the loss asks for) plus an auxiliary tensor. `train` switches
/// dropout on. All parameters live in the returned `VarMap`, which is also
/// what gets checkpointed.
pub trait ForecastModel: Send + Sync {
    fn forward(&self, encoder: &Tensor, decoder: &Tensor, train: bool) -> Result<(Vec<Tensor>, Tensor)>;

    fn varmap(&self) -> &VarMap;
}
