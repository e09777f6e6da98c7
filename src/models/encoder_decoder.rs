use crate::config::{CoreNet, RunConfig};
use crate::models::ForecastModel;
use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{GRUConfig, LSTMConfig, Linear, VarBuilder, VarMap, GRU, LSTM, RNN};

// ── Dropout helper ─────────────────────────────────────────────────────────────
/// Inverted dropout: during training, randomly zeros elements with probability `p`
/// and scales the rest by 1/(1-p). At inference the input is returned unchanged.
pub fn dropout(x: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if !train || p <= 0.0 || p >= 1.0 {
        return Ok(x.clone());
    }
    let rand_t = Tensor::rand(0.0f32, 1.0f32, x.shape(), x.device())?;
    let threshold = Tensor::full(p as f32, x.shape(), x.device())?;
    let mask = rand_t.ge(&threshold)?.to_dtype(DType::F32)?;
    let scale = 1.0 / (1.0 - p);
    (x.mul(&mask))?.affine(scale, 0.0)
}

fn leaky_relu(x: &Tensor, leak: f64) -> Result<Tensor> {
    x.relu()?.sub(&x.neg()?.relu()?.affine(leak, 0.0)?)
}

/// Runs a stack of recurrent layers over `[B, T, F]`, feeding each layer's
/// hidden sequence to the next. Layer `i` starts from `init[i]` when given.
/// Returns the top layer's hidden sequence and every layer's final state.
fn run_stack<R: RNN>(
    layers: &[R],
    input: &Tensor,
    init: Option<&[R::State]>,
    dropout_rate: f64,
    train: bool,
) -> Result<(Tensor, Vec<R::State>)> {
    let mut current = input.clone();
    let mut finals = Vec::with_capacity(layers.len());
    for (i, layer) in layers.iter().enumerate() {
        let states = match init {
            Some(init) => layer.seq_init(&current, &init[i])?,
            None => layer.seq(&current)?,
        };
        let last = states
            .last()
            .ok_or_else(|| candle_core::Error::Msg("Empty recurrent sequence".into()))?
            .clone();
        finals.push(last);
        current = layer.states_to_tensor(&states)?;
        if i + 1 < layers.len() {
            current = dropout(&current, dropout_rate, train)?;
        }
    }
    Ok((current, finals))
}

enum Core {
    Lstm { encoder: Vec<LSTM>, decoder: Vec<LSTM> },
    Gru { encoder: Vec<GRU>, decoder: Vec<GRU> },
}

/// One output head: hidden state → linear → leaky ReLU → dropout → linear.
struct Head {
    hidden: Linear,
    out: Linear,
}

/// Encoder/decoder recurrent forecaster. The encoder reads the history
/// window, its final per-layer state seeds the decoder, which reads the
/// known future features; one head per requested output turns the decoder
/// sequence into a `[B, forecast, 1]` prediction.
pub struct EncoderDecoder {
    varmap: VarMap,
    core: Core,
    heads: Vec<Head>,
    relu_leak: f64,
    dropout_fc: f64,
    dropout_core: f64,
}

impl EncoderDecoder {
    pub fn new(
        config: &RunConfig,
        enc_size: usize,
        dec_size: usize,
        num_outputs: usize,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let total_features = (enc_size + dec_size) as f64;
        let core_hidden = ((config.rel_core_hidden_size * total_features).round() as usize).max(1);
        let linear_hidden = ((config.rel_linear_hidden_size * total_features).round() as usize).max(1);

        let core = match config.core_net {
            CoreNet::Lstm => {
                let stack = |prefix: &str, input_dim: usize| -> Result<Vec<LSTM>> {
                    (0..config.core_layers)
                        .map(|i| {
                            let in_dim = if i == 0 { input_dim } else { core_hidden };
                            let cfg = LSTMConfig {
                                layer_idx: i,
                                ..Default::default()
                            };
                            candle_nn::lstm(in_dim, core_hidden, cfg, vb.pp(format!("{prefix}_{i}")))
                        })
                        .collect()
                };
                Core::Lstm {
                    encoder: stack("encoder", enc_size)?,
                    decoder: stack("decoder", dec_size)?,
                }
            }
            CoreNet::Gru => {
                let stack = |prefix: &str, input_dim: usize| -> Result<Vec<GRU>> {
                    (0..config.core_layers)
                        .map(|i| {
                            let in_dim = if i == 0 { input_dim } else { core_hidden };
                            candle_nn::gru(in_dim, core_hidden, GRUConfig::default(), vb.pp(format!("{prefix}_{i}")))
                        })
                        .collect()
                };
                Core::Gru {
                    encoder: stack("encoder", enc_size)?,
                    decoder: stack("decoder", dec_size)?,
                }
            }
        };

        let heads = (0..num_outputs)
            .map(|k| {
                let vb = vb.pp(format!("head_{k}"));
                Ok(Head {
                    hidden: candle_nn::linear(core_hidden, linear_hidden, vb.pp("hidden"))?,
                    out: candle_nn::linear(linear_hidden, 1, vb.pp("out"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            varmap,
            core,
            heads,
            relu_leak: config.relu_leak,
            dropout_fc: config.dropout_fc,
            dropout_core: config.dropout_core,
        })
    }
}

impl ForecastModel for EncoderDecoder {
    fn forward(&self, encoder: &Tensor, decoder: &Tensor, train: bool) -> Result<(Vec<Tensor>, Tensor)> {
        let (hidden_seq, context) = match &self.core {
            Core::Lstm { encoder: enc, decoder: dec } => {
                let (_, states) = run_stack(enc, encoder, None, self.dropout_core, train)?;
                let context = states
                    .last()
                    .map(|s| s.h.clone())
                    .ok_or_else(|| candle_core::Error::Msg("No recurrent layers".into()))?;
                let (seq, _) = run_stack(dec, decoder, Some(states.as_slice()), self.dropout_core, train)?;
                (seq, context)
            }
            Core::Gru { encoder: enc, decoder: dec } => {
                let (_, states) = run_stack(enc, encoder, None, self.dropout_core, train)?;
                let context = states
                    .last()
                    .map(|s| s.h.clone())
                    .ok_or_else(|| candle_core::Error::Msg("No recurrent layers".into()))?;
                let (seq, _) = run_stack(dec, decoder, Some(states.as_slice()), self.dropout_core, train)?;
                (seq, context)
            }
        };

        let outputs = self
            .heads
            .iter()
            .map(|head| {
                let x = head.hidden.forward(&hidden_seq)?;
                let x = leaky_relu(&x, self.relu_leak)?;
                let x = dropout(&x, self.dropout_fc, train)?;
                head.out.forward(&x)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((outputs, context))
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}
