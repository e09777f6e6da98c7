use crate::data::Table;
use crate::error::{ForecastError, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

/// Three row-aligned tensors cut from a table with a sliding window:
/// encoder inputs `[N, history, F_enc]`, decoder inputs `[N, forecast, F_dec]`
/// and targets `[N, forecast, 1]`. Window `i` of the decoder and target
/// starts `history` rows after window `i` of the encoder.
#[derive(Clone, Debug)]
pub struct WindowedDataset {
    pub encoder: Tensor,
    pub decoder: Tensor,
    pub targets: Tensor,
}

fn extract(columns: &[&[f64]], first_row: usize, windows: usize, width: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(windows * width * columns.len());
    for i in 0..windows {
        for r in 0..width {
            for column in columns {
                out.push(column[first_row + i + r] as f32);
            }
        }
    }
    out
}

impl WindowedDataset {
    pub fn from_table(
        table: &Table,
        target_id: &str,
        encoder_features: &[String],
        decoder_features: &[String],
        history_horizon: usize,
        forecast_horizon: usize,
        device: &Device,
    ) -> Result<Self> {
        let rows = table.len();
        if rows < history_horizon + forecast_horizon {
            return Err(ForecastError::Config(format!(
                "{} rows cannot hold a window of {} history + {} forecast steps",
                rows, history_horizon, forecast_horizon
            )));
        }

        let lookup = |names: &[String]| -> Result<Vec<&[f64]>> {
            names.iter().map(|n| table.column(n)).collect()
        };
        let enc_cols = lookup(encoder_features)?;
        let dec_cols = lookup(decoder_features)?;
        let target_col = [table.column(target_id)?];

        // Encoder windows come from the table without its last `forecast` rows,
        // decoder/target windows from the table without its first `history` rows.
        let enc_windows = rows - forecast_horizon - history_horizon + 1;
        let dec_windows = (rows - history_horizon) - forecast_horizon + 1;
        // The longer side loses its surplus: encoder at the tail, decoder at the head.
        let n = enc_windows.min(dec_windows);
        let dec_first = history_horizon + (dec_windows - n);

        let encoder = Tensor::from_vec(
            extract(&enc_cols, 0, n, history_horizon),
            (n, history_horizon, enc_cols.len()),
            device,
        )?;
        let decoder = Tensor::from_vec(
            extract(&dec_cols, dec_first, n, forecast_horizon),
            (n, forecast_horizon, dec_cols.len()),
            device,
        )?;
        let targets = Tensor::from_vec(
            extract(&target_col, dec_first, n, forecast_horizon),
            (n, forecast_horizon, 1),
            device,
        )?;

        Ok(Self {
            encoder,
            decoder,
            targets,
        })
    }

    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }
}

/// One mini-batch: `(encoder, decoder, target)` slices of a [`WindowedDataset`].
#[derive(Clone, Debug)]
pub struct Batch {
    pub encoder: Tensor,
    pub decoder: Tensor,
    pub target: Tensor,
}

/// Mini-batch iterator over a [`WindowedDataset`]. Only full batches are
/// produced; the trailing partial batch is always dropped.
#[derive(Clone, Debug)]
pub struct TensorLoader {
    dataset: WindowedDataset,
    batch_size: usize,
    shuffle: bool,
}

impl TensorLoader {
    /// Fails when `drop_last` is false: partial batches are not supported.
    pub fn new(dataset: WindowedDataset, batch_size: usize, shuffle: bool, drop_last: bool) -> Result<Self> {
        if !drop_last {
            return Err(ForecastError::Unsupported(
                "partial batches (drop_last = false) are not implemented".into(),
            ));
        }
        if batch_size == 0 {
            return Err(ForecastError::Config("batch_size must be positive".into()));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
        })
    }

    /// Number of full batches per pass.
    pub fn len(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_windows(&self) -> usize {
        self.dataset.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn number_features1(&self) -> usize {
        self.dataset.encoder.dims()[2]
    }

    pub fn number_features2(&self) -> usize {
        self.dataset.decoder.dims()[2]
    }

    /// Starts a new pass. With shuffling the window order is a permutation
    /// drawn from `rng`, so equal RNG states give equal orderings.
    pub fn iter<R: Rng + ?Sized>(&self, rng: &mut R) -> Batches<'_> {
        let n = self.dataset.len();
        let mut order: Vec<u32> = (0..n as u32).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        order.truncate(self.len() * self.batch_size);
        Batches {
            loader: self,
            order,
            position: 0,
        }
    }
}

pub struct Batches<'a> {
    loader: &'a TensorLoader,
    order: Vec<u32>,
    position: usize,
}

impl Batches<'_> {
    /// Window indices of the whole pass in yield order.
    #[cfg(test)]
    pub fn order(&self) -> &[u32] {
        &self.order
    }

    fn slice(&self, start: usize) -> Result<Batch> {
        let size = self.loader.batch_size;
        let ds = &self.loader.dataset;
        let ids = Tensor::from_slice(&self.order[start..start + size], size, ds.targets.device())?;
        Ok(Batch {
            encoder: ds.encoder.index_select(&ids, 0)?,
            decoder: ds.decoder.index_select(&ids, 0)?,
            target: ds.targets.index_select(&ids, 0)?,
        })
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.position * self.loader.batch_size;
        if start >= self.order.len() {
            return None;
        }
        self.position += 1;
        Some(self.slice(start))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.loader.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}
