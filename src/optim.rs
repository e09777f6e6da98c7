use crate::error::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerName {
    Adagrad,
    Adam,
    Adamax,
    Adamw,
    Rmsprop,
    Sgd,
}

impl OptimizerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerName::Adagrad => "adagrad",
            OptimizerName::Adam => "adam",
            OptimizerName::Adamax => "adamax",
            OptimizerName::Adamw => "adamw",
            OptimizerName::Rmsprop => "rmsprop",
            OptimizerName::Sgd => "sgd",
        }
    }
}

impl fmt::Display for OptimizerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weight decay of the `adamw` choice; `adam` is the same update without it.
pub const ADAMW_WEIGHT_DECAY: f64 = 0.01;

#[derive(Clone, Copy, Debug)]
pub struct ParamsAdagrad {
    pub lr: f64,
    pub eps: f64,
}

impl Default for ParamsAdagrad {
    fn default() -> Self {
        Self { lr: 0.01, eps: 1e-10 }
    }
}

/// Adagrad: per-parameter step sizes shrink with the accumulated squared
/// gradient.
#[derive(Debug)]
pub struct Adagrad {
    vars: Vec<(Var, Var)>,
    params: ParamsAdagrad,
}

impl Optimizer for Adagrad {
    type Config = ParamsAdagrad;

    fn new(vars: Vec<Var>, params: ParamsAdagrad) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .map(|v| {
                let sum = Var::zeros(v.shape(), v.dtype(), v.device())?;
                Ok((v, sum))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, sum) in self.vars.iter() {
            if let Some(g) = grads.get(var) {
                let next_sum = sum.add(&g.sqr()?)?;
                let denom = next_sum.sqrt()?.affine(1.0, self.params.eps)?;
                var.set(&var.sub(&g.div(&denom)?.affine(self.params.lr, 0.0)?)?)?;
                sum.set(&next_sum)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ParamsAdamax {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdamax {
    fn default() -> Self {
        Self {
            lr: 0.002,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Adamax: Adam with the second moment replaced by an exponentially
/// weighted infinity norm.
#[derive(Debug)]
pub struct Adamax {
    vars: Vec<(Var, Var, Var)>,
    step_t: usize,
    params: ParamsAdamax,
}

impl Optimizer for Adamax {
    type Config = ParamsAdamax;

    fn new(vars: Vec<Var>, params: ParamsAdamax) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .map(|v| {
                let m = Var::zeros(v.shape(), v.dtype(), v.device())?;
                let u = Var::zeros(v.shape(), v.dtype(), v.device())?;
                Ok((v, m, u))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let p = self.params;
        let step_size = p.lr / (1.0 - p.beta1.powi(self.step_t as i32));
        for (var, m, u) in self.vars.iter() {
            if let Some(g) = grads.get(var) {
                let next_m = m.affine(p.beta1, 0.0)?.add(&g.affine(1.0 - p.beta1, 0.0)?)?;
                let next_u = u.affine(p.beta2, 0.0)?.maximum(&g.abs()?.affine(1.0, p.eps)?)?;
                let delta = next_m.div(&next_u)?.affine(step_size, 0.0)?;
                var.set(&var.sub(&delta)?)?;
                m.set(&next_m)?;
                u.set(&next_u)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub alpha: f64,
    pub eps: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 0.01,
            alpha: 0.99,
            eps: 1e-8,
        }
    }
}

#[derive(Debug)]
pub struct RmsProp {
    vars: Vec<(Var, Var)>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .map(|v| {
                let square_avg = Var::zeros(v.shape(), v.dtype(), v.device())?;
                Ok((v, square_avg))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let p = self.params;
        for (var, square_avg) in self.vars.iter() {
            if let Some(g) = grads.get(var) {
                let next = square_avg
                    .affine(p.alpha, 0.0)?
                    .add(&g.sqr()?.affine(1.0 - p.alpha, 0.0)?)?;
                let denom = next.sqrt()?.affine(1.0, p.eps)?;
                var.set(&var.sub(&g.div(&denom)?.affine(p.lr, 0.0)?)?)?;
                square_avg.set(&next)?;
            }
        }
        Ok(())
    }
}

/// The optimizer chosen by `optimizer_name`.
///
/// Gradients come from a fresh `GradStore` per backward pass, so there is
/// nothing to zero between steps.
pub enum ForecastOptimizer {
    Adagrad(Adagrad),
    Adam(AdamW),
    Adamax(Adamax),
    AdamW(AdamW),
    RmsProp(RmsProp),
    Sgd(SGD),
}

impl ForecastOptimizer {
    pub fn new(name: OptimizerName, vars: Vec<Var>, lr: f64) -> Result<Self> {
        let opt = match name {
            OptimizerName::Adagrad => Self::Adagrad(Adagrad::new(vars, ParamsAdagrad { lr, ..Default::default() })?),
            OptimizerName::Adam => Self::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
            OptimizerName::Adamax => Self::Adamax(Adamax::new(vars, ParamsAdamax { lr, ..Default::default() })?),
            OptimizerName::Adamw => Self::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: ADAMW_WEIGHT_DECAY,
                    ..Default::default()
                },
            )?),
            OptimizerName::Rmsprop => Self::RmsProp(RmsProp::new(vars, ParamsRmsProp { lr, ..Default::default() })?),
            OptimizerName::Sgd => Self::Sgd(SGD::new(vars, lr)?),
        };
        Ok(opt)
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Adagrad(o) => o.step(grads)?,
            Self::Adam(o) | Self::AdamW(o) => o.step(grads)?,
            Self::Adamax(o) => o.step(grads)?,
            Self::RmsProp(o) => o.step(grads)?,
            Self::Sgd(o) => o.step(grads)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adagrad(o) => o.learning_rate(),
            Self::Adam(o) | Self::AdamW(o) => o.learning_rate(),
            Self::Adamax(o) => o.learning_rate(),
            Self::RmsProp(o) => o.learning_rate(),
            Self::Sgd(o) => o.learning_rate(),
        }
    }
}

/// Rescales the gradients of `vars` in place so that their global L2 norm
/// is at most `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut squared = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            squared += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = squared.sqrt();
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for var in vars {
            let scaled: Option<Tensor> = match grads.get(var) {
                Some(g) => Some(g.affine(coef, 0.0)?),
                None => None,
            };
            if let Some(g) = scaled {
                grads.insert(var, g);
            }
        }
    }
    Ok(norm)
}
