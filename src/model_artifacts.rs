use crate::config::{resolve_path, RunConfig};
use crate::error::Result;
use crate::metrics::Loss;
use crate::models::encoder_decoder::EncoderDecoder;
use crate::models::ForecastModel;
use candle_core::Device;
use candle_nn::VarMap;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const SNAPSHOT_EXTENSION: &str = "safetensors";

/// `<output_path>/<model_name>.safetensors`, relative to `work_dir`.
pub fn model_path(work_dir: &Path, config: &RunConfig) -> PathBuf {
    resolve_path(work_dir, &config.output_path).join(format!("{}.{}", config.model_name, SNAPSHOT_EXTENSION))
}

/// `<log_path>/<model_name>/<model_name>_training.csv`, relative to `work_dir`.
pub fn run_log_path(work_dir: &Path, config: &RunConfig) -> PathBuf {
    resolve_path(work_dir, &config.log_path)
        .join(&config.model_name)
        .join(format!("{}_training.csv", config.model_name))
}

fn parent_dir(path: &Path) -> Result<&Path> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    Ok(dir)
}

/// Writes `path` through a temporary sibling that is renamed into place once
/// `write` succeeded, so readers see either the old or the new content.
pub fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dir = parent_dir(path)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut out = BufWriter::new(tmp.as_file_mut());
        write(&mut out)?;
        out.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// A model snapshot written next to its destination but not yet visible
/// there. Dropping it without [`StagedSnapshot::commit`] removes the file.
pub struct StagedSnapshot {
    file: NamedTempFile,
    path: PathBuf,
}

impl StagedSnapshot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Moves the snapshot into place, replacing any older one.
    pub fn commit(self) -> Result<()> {
        self.file.persist(&self.path).map_err(|e| e.error)?;
        info!("Saved model snapshot: {}", self.path.display());
        Ok(())
    }
}

/// Writes every model variable as a safetensors snapshot beside `path`.
pub fn stage_model_snapshot(varmap: &VarMap, path: &Path) -> Result<StagedSnapshot> {
    let dir = parent_dir(path)?;
    let file = tempfile::Builder::new()
        .prefix(".snapshot")
        .suffix(&format!(".{SNAPSHOT_EXTENSION}"))
        .tempfile_in(dir)?;
    varmap.save(file.path())?;
    debug!("Staged model snapshot {}", file.path().display());
    Ok(StagedSnapshot {
        file,
        path: path.to_path_buf(),
    })
}

/// Appends `rows` to the CSV log at `path`. The header is only written when
/// the file is new or empty.
pub fn append_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let existing = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    write_atomically(path, |w| {
        w.write_all(&existing)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(existing.is_empty())
            .from_writer(w);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    })
}

/// A previously saved model, if one exists and fits the current architecture.
pub enum PriorModel {
    Missing,
    Unusable(String),
    Loaded(EncoderDecoder),
}

/// Rebuilds the architecture described by `config` for `loss` and loads the
/// snapshot at `path` into it. A snapshot trained under another loss, or
/// under an unrecorded one, is unusable: its outputs mean something else.
pub fn load_prior_model(
    path: &Path,
    config: &RunConfig,
    loss: &Loss,
    enc_size: usize,
    dec_size: usize,
    device: &Device,
) -> PriorModel {
    if !path.exists() {
        return PriorModel::Missing;
    }
    match &config.model_loss {
        Some(trained) if trained == loss => {}
        Some(trained) => {
            return PriorModel::Unusable(format!(
                "it was trained with the {} loss, this run uses {}",
                trained.name(),
                loss.name()
            ));
        }
        None => return PriorModel::Unusable("the loss it was trained with is not recorded".into()),
    }
    let model = match EncoderDecoder::new(config, enc_size, dec_size, loss.num_outputs(), device) {
        Ok(model) => model,
        Err(e) => return PriorModel::Unusable(e.to_string()),
    };
    let mut varmap = model.varmap().clone();
    match varmap.load(path) {
        Ok(()) => PriorModel::Loaded(model),
        Err(e) => PriorModel::Unusable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Row {
        epoch: usize,
        loss: f64,
        score: Option<f64>,
    }

    fn config() -> RunConfig {
        let mut config = RunConfig::new("station", "data.csv", "y", &["a", "b"], &["c"]);
        config.history_horizon = 4;
        config.forecast_horizon = 2;
        config.model_loss = Some(Loss::Nllg);
        config
    }

    fn save(model: &EncoderDecoder, path: &Path) -> Result<()> {
        stage_model_snapshot(model.varmap(), path)?.commit()
    }

    #[test]
    fn test_paths_follow_model_name() {
        let config = config();
        let work = Path::new("/work");
        assert_eq!(model_path(work, &config), Path::new("/work/oracles/station.safetensors"));
        assert_eq!(run_log_path(work, &config), Path::new("/work/logs/station/station_training.csv"));
    }

    #[test]
    fn test_write_atomically_replaces_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("config.json");
        write_atomically(&path, |w| Ok(w.write_all(b"first")?))?;
        write_atomically(&path, |w| Ok(w.write_all(b"second")?))?;
        assert_eq!(fs::read_to_string(&path)?, "second");
        assert_eq!(fs::read_dir(path.parent().unwrap())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_failed_write_keeps_previous_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        write_atomically(&path, |w| Ok(w.write_all(b"good")?))?;
        let failed = write_atomically(&path, |w| {
            w.write_all(b"half")?;
            Err(crate::error::ForecastError::Interrupted)
        });
        assert!(failed.is_err());
        assert_eq!(fs::read_to_string(&path)?, "good");
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_csv_rows_append_with_single_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log.csv");
        append_csv_rows(&path, &[Row { epoch: 1, loss: 0.5, score: None }])?;
        append_csv_rows(
            &path,
            &[
                Row { epoch: 1, loss: 0.4, score: None },
                Row { epoch: 2, loss: 0.3, score: Some(1.5) },
            ],
        )?;
        append_csv_rows::<Row>(&path, &[])?;

        let text = fs::read_to_string(&path)?;
        assert_eq!(text.lines().filter(|l| l.starts_with("epoch")).count(), 1);
        let rows: Vec<Row> = csv::Reader::from_path(&path)?
            .deserialize()
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].score, Some(1.5));
        Ok(())
    }

    #[test]
    fn test_prior_model_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("station.safetensors");
        let config = config();

        assert!(matches!(
            load_prior_model(&path, &config, &Loss::Nllg, 2, 1, &Device::Cpu),
            PriorModel::Missing
        ));

        let model = EncoderDecoder::new(&config, 2, 1, 2, &Device::Cpu)?;
        save(&model, &path)?;
        let loaded = match load_prior_model(&path, &config, &Loss::Nllg, 2, 1, &Device::Cpu) {
            PriorModel::Loaded(m) => m,
            _ => panic!("snapshot should load"),
        };
        let saved = model.varmap().data().lock().unwrap();
        let restored = loaded.varmap().data().lock().unwrap();
        for (name, var) in saved.iter() {
            let a = var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
            let b = restored[name].as_tensor().flatten_all()?.to_vec1::<f32>()?;
            assert_eq!(a, b, "{name}");
        }
        Ok(())
    }

    #[test]
    fn test_incompatible_or_corrupt_prior_is_unusable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("station.safetensors");
        let config = config();
        let model = EncoderDecoder::new(&config, 2, 1, 2, &Device::Cpu)?;
        save(&model, &path)?;

        let mut deeper = config.clone();
        deeper.core_layers = 2;
        assert!(matches!(
            load_prior_model(&path, &deeper, &Loss::Nllg, 2, 1, &Device::Cpu),
            PriorModel::Unusable(_)
        ));

        fs::write(&path, b"not a snapshot")?;
        assert!(matches!(
            load_prior_model(&path, &config, &Loss::Nllg, 2, 1, &Device::Cpu),
            PriorModel::Unusable(_)
        ));
        Ok(())
    }

    #[test]
    fn test_prior_model_from_other_loss_is_unusable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("station.safetensors");
        let mut config = config();
        config.model_loss = Some(Loss::Mis { alpha: 0.05 });
        // same output count as nllg, so the weights alone would load
        let model = EncoderDecoder::new(&config, 2, 1, 2, &Device::Cpu)?;
        save(&model, &path)?;

        assert!(matches!(
            load_prior_model(&path, &config, &Loss::Mis { alpha: 0.05 }, 2, 1, &Device::Cpu),
            PriorModel::Loaded(_)
        ));
        match load_prior_model(&path, &config, &Loss::Nllg, 2, 1, &Device::Cpu) {
            PriorModel::Unusable(reason) => assert!(reason.contains("mis"), "{reason}"),
            _ => panic!("a model trained with another loss must not be rescored"),
        }

        config.model_loss = None;
        assert!(matches!(
            load_prior_model(&path, &config, &Loss::Nllg, 2, 1, &Device::Cpu),
            PriorModel::Unusable(_)
        ));
        Ok(())
    }

    #[test]
    fn test_staged_snapshot_is_invisible_until_commit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("station.safetensors");
        let model = EncoderDecoder::new(&config(), 2, 1, 2, &Device::Cpu)?;

        let dropped = stage_model_snapshot(model.varmap(), &path)?;
        assert_eq!(dropped.path(), path.as_path());
        drop(dropped);
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);

        stage_model_snapshot(model.varmap(), &path)?.commit()?;
        assert!(path.exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }
}
