//! Losses and evaluation metrics over `[batch, horizon, targets]` tensors.
//!
//! Every function takes the target and a list of prediction tensors. With
//! `total = true` the result is a scalar tensor (mean over batch and
//! horizon); with `total = false` it is `[horizon, targets]`, averaged over
//! the batch only. Metrics that have no per-horizon form return
//! [`ForecastError::Unsupported`] instead.

use crate::error::{ForecastError, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::{PI, SQRT_2};

fn check_count(metric: &'static str, predictions: &[Tensor], expected: usize) -> Result<()> {
    if predictions.len() != expected {
        return Err(ForecastError::InvalidPredictions {
            metric,
            expected,
            got: predictions.len(),
        });
    }
    Ok(())
}

fn check_shape(metric: &'static str, target: &Tensor, prediction: &Tensor) -> Result<()> {
    if target.dims() != prediction.dims() {
        return Err(ForecastError::ShapeMismatch {
            metric,
            expected: target.dims().to_vec(),
            got: prediction.dims().to_vec(),
        });
    }
    Ok(())
}

fn scalar_only(metric: &'static str, total: bool) -> Result<()> {
    if !total {
        return Err(ForecastError::Unsupported(format!(
            "{metric} does not support results over the horizon"
        )));
    }
    Ok(())
}

fn reduce(values: &Tensor, total: bool) -> Result<Tensor> {
    Ok(if total {
        values.mean_all()?
    } else {
        values.mean(0)?
    })
}

fn point<'a>(metric: &'static str, target: &Tensor, predictions: &'a [Tensor]) -> Result<&'a Tensor> {
    check_count(metric, predictions, 1)?;
    check_shape(metric, target, &predictions[0])?;
    Ok(&predictions[0])
}

fn interval<'a>(
    metric: &'static str,
    target: Option<&Tensor>,
    predictions: &'a [Tensor],
) -> Result<(&'a Tensor, &'a Tensor)> {
    check_count(metric, predictions, 2)?;
    let (upper, lower) = (&predictions[0], &predictions[1]);
    check_shape(metric, upper, lower)?;
    if let Some(target) = target {
        check_shape(metric, target, upper)?;
    }
    Ok((upper, lower))
}

/// Gaussian negative log likelihood of `target` under `N(μ, e^{logσ²})`,
/// dropping the constant term. `predictions = [μ, logσ²]`.
pub fn nll_gauss(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    check_count("nll_gauss", predictions, 2)?;
    let (mu, log_variance) = (&predictions[0], &predictions[1]);
    check_shape("nll_gauss", target, mu)?;
    check_shape("nll_gauss", target, log_variance)?;

    let squared_errors = target.sub(mu)?.sqr()?;
    let values = squared_errors
        .div(&log_variance.exp()?.affine(2.0, 0.0)?)?
        .add(&log_variance.affine(0.5, 0.0)?)?;
    reduce(&values, total)
}

/// Sum over quantiles of the mean pinball loss; `predictions[i]` is the
/// forecast of `quantiles[i]`.
pub fn pinball_loss(target: &Tensor, predictions: &[Tensor], quantiles: &[f64], total: bool) -> Result<Tensor> {
    scalar_only("pinball_loss", total)?;
    check_count("pinball_loss", predictions, quantiles.len())?;

    let mut loss = Tensor::zeros((), target.dtype(), target.device())?;
    for (prediction, &q) in predictions.iter().zip(quantiles) {
        if !(q > 0.0 && q < 1.0) {
            return Err(ForecastError::Config(format!("quantile {q} is outside (0, 1)")));
        }
        check_shape("pinball_loss", target, prediction)?;
        let errors = target.sub(prediction)?;
        let lost = errors.affine(q, 0.0)?.maximum(&errors.affine(q - 1.0, 0.0)?)?;
        loss = loss.add(&lost.mean_all()?)?;
    }
    Ok(loss)
}

/// Pinball loss over `quantiles` plus the RMSE of the prediction that
/// follows the quantile forecasts (the expected value).
pub fn quantile_score(target: &Tensor, predictions: &[Tensor], quantiles: &[f64], total: bool) -> Result<Tensor> {
    scalar_only("quantile_score", total)?;
    check_count("quantile_score", predictions, quantiles.len() + 1)?;
    let pinball = pinball_loss(target, &predictions[..quantiles.len()], quantiles, true)?;
    let expected = &predictions[quantiles.len()];
    let spread = rmse(target, std::slice::from_ref(expected), true)?;
    Ok(pinball.add(&spread)?)
}

/// Closed form CRPS of a normal forecast `[μ, logσ²]`.
pub fn crps_gaussian(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    scalar_only("crps_gaussian", total)?;
    check_count("crps_gaussian", predictions, 2)?;
    let (mu, log_variance) = (&predictions[0], &predictions[1]);
    check_shape("crps_gaussian", target, mu)?;
    check_shape("crps_gaussian", target, log_variance)?;

    let sigma = log_variance.affine(0.5, 0.0)?.exp()?;
    let z = target.sub(mu)?.div(&sigma)?;
    let pdf = z.sqr()?.affine(-0.5, 0.0)?.exp()?.affine(1.0 / (2.0 * PI).sqrt(), 0.0)?;
    let cdf = z.affine(1.0 / SQRT_2, 0.0)?.erf()?.affine(0.5, 0.5)?;
    let crps = z
        .mul(&cdf.affine(2.0, -1.0)?)?
        .add(&pdf.affine(2.0, -1.0 / PI.sqrt())?)?
        .mul(&sigma)?;
    Ok(crps.mean_all()?)
}

/// Mean signed error `target - prediction`.
pub fn residuals(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    let prediction = point("residuals", target, predictions)?;
    reduce(&target.sub(prediction)?, total)
}

pub fn mse(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    let prediction = point("mse", target, predictions)?;
    reduce(&target.sub(prediction)?.sqr()?, total)
}

pub fn rmse(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    Ok(mse(target, predictions, total)?.sqrt()?)
}

pub fn mae(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    scalar_only("mae", total)?;
    let prediction = point("mae", target, predictions)?;
    Ok(target.sub(prediction)?.abs()?.mean_all()?)
}

/// Mean absolute percentage error, in percent. Zero targets yield inf/NaN.
pub fn mape(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    scalar_only("mape", total)?;
    let prediction = point("mape", target, predictions)?;
    let ratio = target.sub(prediction)?.div(target)?.abs()?;
    Ok(ratio.mean_all()?.affine(100.0, 0.0)?)
}

/// Mean absolute scaled error against a seasonal naive forecast.
///
/// The naive forecast at sample `t` is the target at `t - freq` along the
/// sample axis, or `insample_target` when given. The first `freq` samples
/// are left out of both means.
pub fn mase(
    target: &Tensor,
    predictions: &[Tensor],
    freq: usize,
    insample_target: Option<&Tensor>,
    total: bool,
) -> Result<Tensor> {
    scalar_only("mase", total)?;
    let prediction = point("mase", target, predictions)?;
    let n = target.dim(0)?;
    if freq >= n {
        return Err(ForecastError::Config(format!(
            "mase: seasonal frequency {freq} needs more than {n} samples"
        )));
    }

    let actual = target.narrow(0, freq, n - freq)?;
    let naive = match insample_target {
        Some(insample) => {
            check_shape("mase", target, insample)?;
            insample.narrow(0, freq, n - freq)?
        }
        None => target.narrow(0, 0, n - freq)?,
    };
    let scale = actual.sub(&naive)?.abs()?.mean_all()?;
    let error = actual.sub(&prediction.narrow(0, freq, n - freq)?)?.abs()?.mean_all()?;
    Ok(error.div(&scale)?)
}

/// Forecast MAE relative to the MAE of predicting the target mean.
pub fn rae(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    scalar_only("rae", total)?;
    let prediction = point("rae", target, predictions)?;
    let naive = target.broadcast_sub(&target.mean_all()?)?.abs()?.mean_all()?;
    let error = target.sub(prediction)?.abs()?.mean_all()?;
    Ok(error.div(&naive)?)
}

/// Mean width of the interval `[upper, lower]`.
pub fn sharpness(predictions: &[Tensor], total: bool) -> Result<Tensor> {
    let (upper, lower) = interval("sharpness", None, predictions)?;
    reduce(&upper.sub(lower)?, total)
}

/// Prediction interval coverage probability in percent: the share of
/// targets with `lower < target <= upper`.
pub fn picp(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    let (upper, lower) = interval("picp", Some(target), predictions)?;
    let dtype = target.dtype();
    let covered = target
        .gt(lower)?
        .to_dtype(dtype)?
        .mul(&target.le(upper)?.to_dtype(dtype)?)?;
    let horizon = covered.mean(0)?.affine(100.0, 0.0)?;
    Ok(if total { horizon.mean_all()? } else { horizon })
}

/// Uncovered fraction, `1 - picp / 100`.
pub fn picp_loss(target: &Tensor, predictions: &[Tensor], total: bool) -> Result<Tensor> {
    Ok(picp(target, predictions, total)?.affine(-0.01, 1.0)?)
}

/// Mean interval score: width plus `2/alpha` times the distance by which the
/// target falls outside the interval, summed over the batch and divided by
/// the batch size.
pub fn mis(target: &Tensor, predictions: &[Tensor], alpha: f64, total: bool) -> Result<Tensor> {
    let (upper, lower) = interval("mis", Some(target), predictions)?;
    if alpha <= 0.0 {
        return Err(ForecastError::Config(format!("mis: alpha must be positive, got {alpha}")));
    }
    let width = upper.sub(lower)?;
    let under = lower.sub(target)?.relu()?;
    let over = target.sub(upper)?.relu()?;
    let score = width.add(&under.add(&over)?.affine(2.0 / alpha, 0.0)?)?;
    let horizon = score.mean(0)?;
    Ok(if total { horizon.mean_all()? } else { horizon })
}

/// Inverse CDF of the standard normal (Acklam's rational approximation,
/// relative error below 1.2e-9).
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239e0,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838e0,
        -2.549732539343734e0,
        4.374664141464968e0,
        2.938163982698783e0,
    ];
    const E: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996e0,
        3.754408661907416e0,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((E[0] * q + E[1]) * q + E[2]) * q + E[3]) * q + 1.0)
    };
    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

/// Training criterion. Knows how many prediction tensors the model has to
/// emit and how to turn them into an expected value and an interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "name")]
pub enum Loss {
    Nllg,
    Crps,
    Pinball { quantiles: Vec<f64> },
    QuantileScore { quantiles: Vec<f64> },
    Mse,
    Rmse,
    Mape,
    Mis { alpha: f64 },
}

impl Loss {
    /// Builds a loss from its command-line name.
    pub fn from_name(name: &str, quantiles: &[f64], alpha: f64) -> Result<Self> {
        let loss = match name {
            "nllg" | "nll_gauss" => Loss::Nllg,
            "crps" | "crps_gaussian" => Loss::Crps,
            "pinball" | "pinball_loss" => Loss::Pinball {
                quantiles: quantiles.to_vec(),
            },
            "quantile-score" | "quantile_score" => Loss::QuantileScore {
                quantiles: quantiles.to_vec(),
            },
            "mse" => Loss::Mse,
            "rmse" => Loss::Rmse,
            "mape" => Loss::Mape,
            "mis" => Loss::Mis { alpha },
            other => return Err(ForecastError::Config(format!("unknown loss '{other}'"))),
        };
        if let Loss::Pinball { quantiles } | Loss::QuantileScore { quantiles } = &loss {
            if quantiles.is_empty() {
                return Err(ForecastError::Config(format!("loss '{name}' needs at least one quantile")));
            }
        }
        Ok(loss)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Loss::Nllg => "nllg",
            Loss::Crps => "crps",
            Loss::Pinball { .. } => "pinball",
            Loss::QuantileScore { .. } => "quantile-score",
            Loss::Mse => "mse",
            Loss::Rmse => "rmse",
            Loss::Mape => "mape",
            Loss::Mis { .. } => "mis",
        }
    }

    /// Number of `[batch, horizon, 1]` tensors the model has to predict.
    pub fn num_outputs(&self) -> usize {
        match self {
            Loss::Nllg | Loss::Crps | Loss::Mis { .. } => 2,
            Loss::Pinball { quantiles } => quantiles.len(),
            Loss::QuantileScore { quantiles } => quantiles.len() + 1,
            Loss::Mse | Loss::Rmse | Loss::Mape => 1,
        }
    }

    /// Scalar loss value, differentiable with respect to the predictions.
    pub fn compute(&self, target: &Tensor, predictions: &[Tensor]) -> Result<Tensor> {
        check_count(self.name(), predictions, self.num_outputs())?;
        match self {
            Loss::Nllg => nll_gauss(target, predictions, true),
            Loss::Crps => crps_gaussian(target, predictions, true),
            Loss::Pinball { quantiles } => pinball_loss(target, predictions, quantiles, true),
            Loss::QuantileScore { quantiles } => quantile_score(target, predictions, quantiles, true),
            Loss::Mse => mse(target, predictions, true),
            Loss::Rmse => rmse(target, predictions, true),
            Loss::Mape => mape(target, predictions, true),
            Loss::Mis { alpha } => mis(target, predictions, *alpha, true),
        }
    }

    pub fn expected_value(&self, predictions: &[Tensor]) -> Result<Tensor> {
        check_count(self.name(), predictions, self.num_outputs())?;
        Ok(match self {
            Loss::QuantileScore { quantiles } => predictions[quantiles.len()].clone(),
            Loss::Pinball { quantiles } => predictions[QuantileOrder::of(quantiles).median].clone(),
            Loss::Mis { .. } => predictions[0].add(&predictions[1])?.affine(0.5, 0.0)?,
            _ => predictions[0].clone(),
        })
    }

    /// `(upper, lower)` bounds of the central `1 - alpha` prediction interval.
    /// Quantile losses use their outermost quantiles as bounds.
    pub fn interval(&self, predictions: &[Tensor], alpha: f64) -> Result<(Tensor, Tensor)> {
        check_count(self.name(), predictions, self.num_outputs())?;
        match self {
            Loss::Nllg | Loss::Crps => {
                let z = normal_quantile(1.0 - alpha / 2.0);
                let sigma = predictions[1].affine(0.5, 0.0)?.exp()?;
                let upper = predictions[0].add(&sigma.affine(z, 0.0)?)?;
                let lower = predictions[0].sub(&sigma.affine(z, 0.0)?)?;
                Ok((upper, lower))
            }
            Loss::Pinball { quantiles } | Loss::QuantileScore { quantiles } if quantiles.len() >= 2 => {
                let order = QuantileOrder::of(quantiles);
                let (high, low) = (&predictions[order.highest], &predictions[order.lowest]);
                // crossing quantile forecasts still give a well-formed interval
                Ok((high.maximum(low)?, high.minimum(low)?))
            }
            Loss::Mis { .. } => Ok((predictions[0].clone(), predictions[1].clone())),
            _ => {
                let value = self.expected_value(predictions)?;
                Ok((value.clone(), value))
            }
        }
    }
}

/// Positions of the lowest, highest and most central quantile in a
/// quantile list.
struct QuantileOrder {
    lowest: usize,
    highest: usize,
    median: usize,
}

impl QuantileOrder {
    fn of(quantiles: &[f64]) -> Self {
        let argmin = |key: &dyn Fn(f64) -> f64| {
            quantiles
                .iter()
                .enumerate()
                .min_by(|a, b| key(*a.1).total_cmp(&key(*b.1)))
                .map_or(0, |(i, _)| i)
        };
        Self {
            lowest: argmin(&|q| q),
            highest: argmin(&|q| -q),
            median: argmin(&|q| (q - 0.5).abs()),
        }
    }
}

/// Metrics reported for a finished model on the test split.
pub const REPORTED_METRICS: [&str; 10] = [
    "mse", "rmse", "mae", "sharpness", "picp", "picp_loss", "mis", "mase", "rae", "mape",
];

/// Seasonal frequency used for MASE on hourly data (one week).
pub const MASE_FREQUENCY: usize = 7 * 24;

/// Computes the named metrics. With `total = false` only metrics with a
/// per-horizon form are reported, flattened over `[horizon, targets]`.
pub fn fetch_metrics(
    target: &Tensor,
    expected_values: &Tensor,
    upper: &Tensor,
    lower: &Tensor,
    names: &[&str],
    alpha: f64,
    total: bool,
) -> Result<BTreeMap<String, Vec<f64>>> {
    let expected = std::slice::from_ref(expected_values);
    let bounds = [upper.clone(), lower.clone()];
    let mut results = BTreeMap::new();

    for &name in names {
        let value = match name {
            "mse" => mse(target, expected, total)?,
            "rmse" => rmse(target, expected, total)?,
            "residuals" => residuals(target, expected, total)?,
            "sharpness" => sharpness(&bounds, total)?,
            "picp" => picp(target, &bounds, total)?,
            "picp_loss" => picp_loss(target, &bounds, total)?,
            "mis" => mis(target, &bounds, alpha, total)?,
            _ if !total => continue,
            "mae" => mae(target, expected, true)?,
            "rae" => rae(target, expected, true)?,
            "mape" => mape(target, expected, true)?,
            "mase" => {
                let freq = MASE_FREQUENCY.min(target.dim(0)?.saturating_sub(1)).max(1);
                mase(target, expected, freq, None, true)?
            }
            other => return Err(ForecastError::Config(format!("unknown metric '{other}'"))),
        };
        let values = value.flatten_all()?.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?;
        results.insert(name.to_string(), values);
    }
    Ok(results)
}

/// Reads a scalar tensor as `f64`.
pub fn scalar(value: &Tensor) -> Result<f64> {
    Ok(value.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
}

/// Reads a per-horizon result as one value per forecast step.
#[cfg(test)]
pub fn horizon_values(value: &Tensor) -> Result<Vec<f64>> {
    Ok(value.mean(candle_core::D::Minus1)?.to_dtype(candle_core::DType::F64)?.to_vec1::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(values: &[f32], batch: usize, horizon: usize) -> Tensor {
        Tensor::from_slice(values, (batch, horizon, 1), &Device::Cpu).unwrap()
    }

    fn value(t: Result<Tensor>) -> f64 {
        scalar(&t.unwrap()).unwrap()
    }

    #[test]
    fn test_mse_of_target_is_zero() {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 2);
        assert_eq!(value(mse(&t, &[t.clone()], true)), 0.0);
        assert_eq!(value(rmse(&t, &[t.clone()], true)), 0.0);
    }

    #[test]
    fn test_rmse_is_sqrt_of_mse() {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let p = tensor(&[2.0, 0.0, 3.5, 1.0], 2, 2);
        let m = value(mse(&t, &[p.clone()], true));
        assert!((m - (1.0 + 4.0 + 0.25 + 9.0) / 4.0).abs() < 1e-6);
        assert!((value(rmse(&t, &[p], true)) - m.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_per_horizon_shape() -> Result<()> {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        let p = tensor(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0], 2, 3);
        let per_step = mse(&t, &[p], false)?;
        assert_eq!(per_step.dims(), &[3, 1]);
        // step 0: (0 + 9) / 2, step 1: (1 + 16) / 2, step 2: (4 + 25) / 2
        assert_eq!(horizon_values(&per_step)?, vec![4.5, 8.5, 14.5]);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let p = tensor(&[1.0, 2.0, 3.0, 4.0], 4, 1);
        match mse(&t, &[p], true) {
            Err(ForecastError::ShapeMismatch { metric, expected, got }) => {
                assert_eq!(metric, "mse");
                assert_eq!(expected, vec![2, 2, 1]);
                assert_eq!(got, vec![4, 1, 1]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_prediction_is_reported() {
        let t = tensor(&[1.0, 2.0], 1, 2);
        let result = nll_gauss(&t, &[t.clone()], true);
        assert!(matches!(result, Err(ForecastError::InvalidPredictions { expected: 2, got: 1, .. })));
    }

    #[test]
    fn test_surplus_predictions_are_reported() {
        let t = tensor(&[1.0, 2.0], 1, 2);
        let zero = t.zeros_like().unwrap();
        assert!(matches!(
            nll_gauss(&t, &[t.clone(), zero.clone(), t.clone()], true),
            Err(ForecastError::InvalidPredictions { expected: 2, got: 3, .. })
        ));
        assert!(matches!(
            mse(&t, &[t.clone(), t.clone()], true),
            Err(ForecastError::InvalidPredictions { expected: 1, got: 2, .. })
        ));
        assert!(matches!(
            mis(&t, &[t.clone(), t.clone(), t.clone()], 0.05, true),
            Err(ForecastError::InvalidPredictions { expected: 2, got: 3, .. })
        ));
        assert!(matches!(
            pinball_loss(&t, &[t.clone(), t.clone()], &[0.5], true),
            Err(ForecastError::InvalidPredictions { expected: 1, got: 2, .. })
        ));
        assert!(matches!(
            Loss::Mse.compute(&t, &[t.clone(), zero.clone()]),
            Err(ForecastError::InvalidPredictions { .. })
        ));
        assert!(Loss::Nllg.expected_value(&[t.clone(), zero.clone(), zero.clone()]).is_err());
        assert!(Loss::Mis { alpha: 0.05 }.interval(&[t.clone(), zero.clone(), zero], 0.05).is_err());
    }

    #[test]
    fn test_scalar_only_metrics_reject_horizon() {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let zero = t.zeros_like().unwrap();
        assert!(matches!(
            pinball_loss(&t, &[t.clone()], &[0.5], false),
            Err(ForecastError::Unsupported(_))
        ));
        assert!(matches!(
            crps_gaussian(&t, &[t.clone(), zero], false),
            Err(ForecastError::Unsupported(_))
        ));
        assert!(matches!(mape(&t, &[t.clone()], false), Err(ForecastError::Unsupported(_))));
    }

    #[test]
    fn test_nll_gauss_with_unit_variance() {
        let t = tensor(&[1.0, 3.0], 1, 2);
        let mu = tensor(&[0.0, 1.0], 1, 2);
        let log_var = mu.zeros_like().unwrap();
        // ((1)^2 / 2 + (2)^2 / 2) / 2
        assert!((value(nll_gauss(&t, &[mu, log_var], true)) - 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_pinball_loss() {
        let t = tensor(&[1.0, 1.0], 1, 2);
        let p = tensor(&[0.0, 2.0], 1, 2);
        // q = 0.9: error +1 costs 0.9, error -1 costs 0.1
        assert!((value(pinball_loss(&t, &[p.clone()], &[0.9], true)) - 0.5).abs() < 1e-6);
        assert!(matches!(
            pinball_loss(&t, &[p], &[1.5], true),
            Err(ForecastError::Config(_))
        ));
    }

    #[test]
    fn test_quantile_score_adds_rmse_of_expected_value() {
        let t = tensor(&[1.0, 1.0], 1, 2);
        let upper = tensor(&[2.0, 2.0], 1, 2);
        let lower = tensor(&[0.0, 0.0], 1, 2);
        let expected = tensor(&[2.0, 2.0], 1, 2);
        let quantiles = [0.975, 0.025];
        let pinball = value(pinball_loss(&t, &[upper.clone(), lower.clone()], &quantiles, true));
        let score = value(quantile_score(&t, &[upper, lower, expected], &quantiles, true));
        assert!((score - pinball - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crps_of_perfect_forecast() {
        let t = tensor(&[0.5, -1.0], 1, 2);
        let log_var = t.zeros_like().unwrap();
        // z = 0: sigma * (2 * phi(0) - 1 / sqrt(pi)) = (sqrt(2) - 1) / sqrt(pi)
        let expected = (2.0 / (2.0 * PI).sqrt()) - 1.0 / PI.sqrt();
        let got = value(crps_gaussian(&t, &[t.clone(), log_var], true));
        assert!((got - expected).abs() < 1e-5);
    }

    #[test]
    fn test_sharpness_is_mean_width() {
        let upper = tensor(&[3.0, 5.0, 2.0, 8.0], 2, 2);
        let lower = tensor(&[1.0, 4.0, 2.0, 0.0], 2, 2);
        assert!((value(sharpness(&[upper, lower], true)) - 11.0 / 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_picp_bounds() -> Result<()> {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let upper = tensor(&[2.0, 3.0, 4.0, 5.0], 2, 2);
        let lower = tensor(&[0.0, 1.0, 2.0, 3.0], 2, 2);
        assert_eq!(value(picp(&t, &[upper.clone(), lower.clone()], true)), 100.0);
        assert!(value(picp_loss(&t, &[upper.clone(), lower.clone()], true)).abs() < 1e-6);

        // lower bound is exclusive, upper bound inclusive
        assert_eq!(value(picp(&t, &[t.clone(), t.clone()], true)), 0.0);
        let half = tensor(&[1.0, 2.0, 0.0, 0.0], 2, 2);
        let per_step = picp(&t, &[half, lower], false)?;
        assert_eq!(horizon_values(&per_step)?, vec![50.0, 50.0]);
        Ok(())
    }

    #[test]
    fn test_mis_shrinks_with_tighter_interval() {
        let t = tensor(&[1.0, 2.0, 3.0], 1, 3);
        let mut previous = f64::INFINITY;
        for half_width in [2.0f32, 1.0, 0.5, 0.1] {
            let upper = t.affine(1.0, half_width as f64).unwrap();
            let lower = t.affine(1.0, -(half_width as f64) + 0.01).unwrap();
            let score = value(mis(&t, &[upper, lower], 0.05, true));
            assert!(score >= 0.0);
            assert!(score < previous);
            previous = score;
        }
    }

    #[test]
    fn test_mis_penalises_misses() -> Result<()> {
        let t = tensor(&[0.0, 0.0], 2, 1);
        let upper = tensor(&[1.0, -1.0], 2, 1);
        let lower = tensor(&[-1.0, -2.0], 2, 1);
        // widths 2 + 1, second target misses by 1: (3 + 40 * 1) / 2
        let per_step = mis(&t, &[upper, lower], 0.05, false)?;
        assert!((horizon_values(&per_step)?[0] - 21.5).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_mase_and_rae() {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0, 5.0], 5, 1);
        let p = tensor(&[1.0, 2.5, 3.5, 4.5, 5.5], 5, 1);
        // naive error is 1 everywhere after the first sample, forecast error 0.5
        assert!((value(mase(&t, &[p.clone()], 1, None, true)) - 0.5).abs() < 1e-6);
        // mean |t - 3| = 1.2, forecast MAE = 0.4
        assert!((value(rae(&t, &[p.clone()], true)) - 0.4 / 1.2).abs() < 1e-6);
        assert!(matches!(mase(&t, &[p], 5, None, true), Err(ForecastError::Config(_))));
    }

    #[test]
    fn test_mape_in_percent() {
        let t = tensor(&[2.0, 4.0], 1, 2);
        let p = tensor(&[1.0, 5.0], 1, 2);
        assert!((value(mape(&t, &[p], true)) - 37.5).abs() < 1e-5);
    }

    #[test]
    fn test_normal_quantile() {
        assert!((normal_quantile(0.975) - 1.959964).abs() < 1e-5);
        assert!((normal_quantile(0.5)).abs() < 1e-12);
        assert!((normal_quantile(0.01) + 2.326348).abs() < 1e-5);
    }

    #[test]
    fn test_gaussian_interval_is_symmetric() -> Result<()> {
        let mu = tensor(&[1.0, 2.0], 1, 2);
        let log_var = mu.zeros_like()?;
        let (upper, lower) = Loss::Nllg.interval(&[mu, log_var], 0.05)?;
        let width = value(sharpness(&[upper, lower], true));
        assert!((width - 2.0 * 1.959964).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_quantile_interval_uses_outermost_quantiles() -> Result<()> {
        let low = tensor(&[0.0, 0.0], 1, 2);
        let mid = tensor(&[5.0, 5.0], 1, 2);
        let high = tensor(&[10.0, 10.0], 1, 2);
        let read = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let pinball = Loss::Pinball { quantiles: vec![0.05, 0.5, 0.95] };
        let outputs = [low.clone(), mid.clone(), high.clone()];
        let (upper, lower) = pinball.interval(&outputs, 0.05)?;
        assert_eq!(read(&upper), vec![10.0, 10.0]);
        assert_eq!(read(&lower), vec![0.0, 0.0]);
        assert_eq!(read(&pinball.expected_value(&outputs)?), vec![5.0, 5.0]);

        // order of the quantile list does not matter
        let shuffled = Loss::Pinball { quantiles: vec![0.95, 0.05, 0.5] };
        let outputs = [high.clone(), low.clone(), mid.clone()];
        let (upper, lower) = shuffled.interval(&outputs, 0.05)?;
        assert_eq!(read(&upper), vec![10.0, 10.0]);
        assert_eq!(read(&lower), vec![0.0, 0.0]);
        assert_eq!(read(&shuffled.expected_value(&outputs)?), vec![5.0, 5.0]);

        let score = Loss::QuantileScore { quantiles: vec![0.05, 0.5, 0.95] };
        let trailing = tensor(&[4.0, 4.0], 1, 2);
        let outputs = [low, mid, high, trailing];
        let (upper, lower) = score.interval(&outputs, 0.05)?;
        assert_eq!(read(&upper), vec![10.0, 10.0]);
        assert_eq!(read(&lower), vec![0.0, 0.0]);
        assert_eq!(read(&score.expected_value(&outputs)?), vec![4.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_loss_from_name() {
        assert_eq!(Loss::from_name("nllg", &[], 0.05).unwrap().num_outputs(), 2);
        let q = Loss::from_name("quantile-score", &[0.9, 0.1], 0.05).unwrap();
        assert_eq!(q.num_outputs(), 3);
        assert!(Loss::from_name("pinball", &[], 0.05).is_err());
        assert!(Loss::from_name("huber", &[], 0.05).is_err());
    }

    #[test]
    fn test_fetch_metrics_skips_scalar_only_per_horizon() -> Result<()> {
        let t = tensor(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let upper = t.affine(1.0, 1.0)?;
        let lower = t.affine(1.0, -1.0)?;
        let per_step = fetch_metrics(&t, &t, &upper, &lower, &REPORTED_METRICS, 0.05, false)?;
        assert!(per_step.contains_key("picp"));
        assert!(!per_step.contains_key("mase"));
        assert_eq!(per_step["mis"].len(), 2);

        let totals = fetch_metrics(&t, &t, &upper, &lower, &["mse", "mae", "mase"], 0.05, true)?;
        assert_eq!(totals["mse"], vec![0.0]);
        assert_eq!(totals["mae"], vec![0.0]);
        Ok(())
    }
}
