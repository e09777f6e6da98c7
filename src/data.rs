use crate::config::{FeatureGroup, RunConfig, ScalerKind};
use crate::error::{ForecastError, Result};
use crate::tensorloader::{TensorLoader, WindowedDataset};
use candle_core::Device;
use std::path::Path;
use tracing::{info, warn};

/// A time-ordered table: one text index (timestamps) and named numeric
/// columns. Values are stored column-major.
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub index: Vec<String>,
    pub columns: Vec<String>,
    values: Vec<Vec<f64>>,
}

impl Table {
    pub fn from_columns(index: Vec<String>, columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let rows = index.len();
        let mut names = Vec::with_capacity(columns.len());
        let mut values = Vec::with_capacity(columns.len());
        for (name, column) in columns {
            if column.len() != rows {
                return Err(ForecastError::Config(format!(
                    "column '{}' has {} rows, index has {}",
                    name,
                    column.len(),
                    rows
                )));
            }
            if names.contains(&name) {
                return Err(ForecastError::Config(format!("duplicate column '{name}'")));
            }
            names.push(name);
            values.push(column);
        }
        Ok(Self {
            index,
            columns: names,
            values,
        })
    }

    /// Reads a semicolon-delimited table whose first column is the time index.
    /// Empty or non-numeric cells become missing values and are filled.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .trim(csv::Trim::All)
            .from_path(path)?;

        let headers = reader.headers()?.clone();
        if headers.len() < 2 {
            return Err(ForecastError::Config(format!(
                "{}: expected an index column and at least one data column",
                path.display()
            )));
        }
        let columns: Vec<String> = headers.iter().skip(1).map(|h| h.to_string()).collect();

        let mut index = Vec::new();
        let mut values: Vec<Vec<f64>> = vec![Vec::new(); columns.len()];
        for record in reader.records() {
            let record = record?;
            index.push(record.get(0).unwrap_or_default().to_string());
            for (j, column) in values.iter_mut().enumerate() {
                let cell = record.get(j + 1).unwrap_or_default();
                column.push(cell.parse::<f64>().unwrap_or(f64::NAN));
            }
        }

        let mut table = Self::from_columns(index, columns.into_iter().zip(values).collect())?;
        if table.is_empty() {
            return Err(ForecastError::Config(format!("{}: no data rows", path.display())));
        }
        let filled = table.fill_if_missing()?;
        if filled > 0 {
            warn!("{}: filled {} missing values", path.display(), filled);
        }
        info!(
            "Loaded {} rows x {} columns from {}",
            table.len(),
            table.columns.len(),
            path.display()
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column(&self, name: &str) -> Result<&[f64]> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| self.values[i].as_slice())
            .ok_or_else(|| ForecastError::Config(format!("column '{name}' not found in table")))
    }

    fn column_mut(&mut self, name: &str) -> Result<&mut Vec<f64>> {
        match self.columns.iter().position(|c| c == name) {
            Some(i) => Ok(&mut self.values[i]),
            None => Err(ForecastError::Config(format!("column '{name}' not found in table"))),
        }
    }

    /// Rows `[start, end)` as a new table.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.len());
        let start = start.min(end);
        Self {
            index: self.index[start..end].to_vec(),
            columns: self.columns.clone(),
            values: self.values.iter().map(|c| c[start..end].to_vec()).collect(),
        }
    }

    /// Forward-fills missing values, then back-fills a missing head.
    /// Returns the number of filled cells.
    pub fn fill_if_missing(&mut self) -> Result<usize> {
        let mut filled = 0;
        for (name, column) in self.columns.iter().zip(self.values.iter_mut()) {
            let Some(first_valid) = column.iter().copied().find(|v| v.is_finite()) else {
                if column.is_empty() {
                    continue;
                }
                return Err(ForecastError::Config(format!("column '{name}' has no numeric values")));
            };
            let mut last = first_valid;
            for v in column.iter_mut() {
                if v.is_finite() {
                    last = *v;
                } else {
                    *v = last;
                    filled += 1;
                }
            }
        }
        Ok(filled)
    }

    /// Splits rows into train / validation / test at the given fractions.
    pub fn split(&self, train_split: f64, validation_split: f64) -> (Self, Self, Self) {
        let n = self.len();
        let train_end = (n as f64 * train_split) as usize;
        let validation_end = ((n as f64 * validation_split) as usize).max(train_end);
        (
            self.slice_rows(0, train_end),
            self.slice_rows(train_end, validation_end),
            self.slice_rows(validation_end, n),
        )
    }
}

#[derive(Clone, Debug)]
struct ColumnScale {
    column: String,
    offset: f64,
    scale: f64,
}

/// Per-column affine scalers for a set of feature groups, fitted once and
/// applied to every split.
#[derive(Clone, Debug, Default)]
pub struct MultiScaler {
    scales: Vec<ColumnScale>,
}

impl MultiScaler {
    pub fn fit(groups: &[FeatureGroup], table: &Table) -> Result<Self> {
        let mut scales = Vec::new();
        for group in groups {
            let Some(kind) = group.scaler else {
                continue;
            };
            for column in &group.features {
                let values = table.column(column)?;
                if values.is_empty() {
                    return Err(ForecastError::Config(format!(
                        "cannot fit {:?} scaler for '{}' on an empty table",
                        kind, column
                    )));
                }
                let (offset, scale) = match kind {
                    ScalerKind::Standard => {
                        let n = values.len() as f64;
                        let mean = values.iter().sum::<f64>() / n;
                        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                        (mean, var.sqrt())
                    }
                    ScalerKind::Minmax => {
                        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                        (min, max - min)
                    }
                };
                let scale = if scale > f64::EPSILON { scale } else { 1.0 };
                scales.push(ColumnScale {
                    column: column.clone(),
                    offset,
                    scale,
                });
            }
        }
        Ok(Self { scales })
    }

    pub fn transform(&self, table: &Table) -> Result<Table> {
        let mut out = table.clone();
        for s in &self.scales {
            for v in out.column_mut(&s.column)?.iter_mut() {
                *v = (*v - s.offset) / s.scale;
            }
        }
        Ok(out)
    }

    /// `(scale, offset)` mapping scaled values of `column` back to original
    /// units; the identity for columns that are not scaled.
    pub fn inverse_affine(&self, column: &str) -> (f64, f64) {
        self.scales
            .iter()
            .find(|s| s.column == column)
            .map_or((1.0, 0.0), |s| (s.scale, s.offset))
    }
}

/// Batch iterators for the three splits of one run.
pub struct DataLoaders {
    pub train: TensorLoader,
    pub validation: TensorLoader,
    pub test: TensorLoader,
    pub scaler: MultiScaler,
}

/// Splits, scales (scalers fitted on the training rows) and windows a table
/// according to `config`. Only the training loader shuffles.
pub fn prepare_loaders(table: &Table, config: &RunConfig, device: &Device) -> Result<DataLoaders> {
    let (train_df, validation_df, test_df) = table.split(config.train_split, config.validation_split);

    let scaler = MultiScaler::fit(&config.feature_groups, &train_df)?;
    let make = |df: &Table, shuffle: bool, split: &str| -> Result<TensorLoader> {
        let scaled = scaler.transform(df)?;
        let dataset = WindowedDataset::from_table(
            &scaled,
            &config.target_id,
            &config.encoder_features,
            &config.decoder_features,
            config.history_horizon,
            config.forecast_horizon,
            device,
        )
        .map_err(|e| match e {
            ForecastError::Config(msg) => ForecastError::Config(format!("{split} split: {msg}")),
            other => other,
        })?;
        let loader = TensorLoader::new(dataset, config.batch_size, shuffle, config.drop_last)?;
        if loader.is_empty() {
            return Err(ForecastError::Config(format!(
                "{} split yields no full batch ({} windows, batch_size {})",
                split,
                loader.num_windows(),
                loader.batch_size()
            )));
        }
        Ok(loader)
    };

    let train = make(&train_df, config.shuffle, "train")?;
    let validation = make(&validation_df, false, "validation")?;
    let test = make(&test_df, false, "test")?;

    info!(
        "Windows: {} train / {} validation / {} test ({} / {} / {} batches)",
        train.num_windows(),
        validation.num_windows(),
        test.num_windows(),
        train.len(),
        validation.len(),
        test.len()
    );

    Ok(DataLoaders {
        train,
        validation,
        test,
        scaler,
    })
}

/// Synthetic table used by tests: `rows` hourly rows of the given columns,
/// each produced by `f(column_index, row)`.
#[cfg(test)]
pub fn mock_table(rows: usize, columns: &[&str], f: impl Fn(usize, usize) -> f64) -> Table {
    let index = (0..rows).map(|r| format!("2021-01-01 {:05}:00", r)).collect();
    let columns = columns
        .iter()
        .enumerate()
        .map(|(c, name)| (name.to_string(), (0..rows).map(|r| f(c, r)).collect()))
        .collect();
    Table::from_columns(index, columns).unwrap()
}
