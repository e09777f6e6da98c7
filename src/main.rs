mod config;
mod data;
mod early_stopping;
mod error;
mod metrics;
mod model_artifacts;
mod models;
mod objective;
mod optim;
mod run;
mod search;
mod tensorloader;
mod train;

use anyhow::Context;
use clap::Parser;
use metrics::Loss;
use run::{RunController, RunOptions};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "loadcast: train encoder/decoder load forecasting models",
    after_help = "EXAMPLES:
    # Train with the settings of a model config
    cargo run --release -- --config targets/opsd/config.json

    # Quantile regression, keep searched hyperparameters automatically
    cargo run --release -- --config targets/opsd/config.json --loss pinball --quantiles 0.05,0.5,0.95 --auto-accept

    # Train on GPU
    cargo run --release --features cuda -- --config targets/opsd/config.json --cuda"
)]
struct Args {
    /// Model configuration (JSON), relative to --work-dir
    #[arg(long)]
    config: PathBuf,

    /// Directory all relative paths are resolved against
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Training loss: nllg, crps, pinball, quantile-score, mse, rmse, mape, mis
    #[arg(long, default_value = "nllg")]
    loss: String,

    /// Quantiles for the pinball and quantile-score losses
    #[arg(long, value_delimiter = ',', default_values_t = [0.025, 0.975])]
    quantiles: Vec<f64>,

    /// Interval significance for the mis loss
    #[arg(long, default_value_t = config::SCORE_ALPHA)]
    alpha: f64,

    /// Take over searched hyperparameters when they beat the stored best loss
    #[arg(long)]
    auto_accept: bool,

    /// Write a JSONL event log of the final training under the log path
    #[arg(long)]
    live_log: bool,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,

    /// Override max_epochs from the configuration for this run
    #[arg(long)]
    max_epochs: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_cpu_parallelism();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loadcast=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let args = Args::parse();

    if args.cuda && !cfg!(feature = "cuda") {
        error!(
            "--cuda was requested, but this binary was compiled without CUDA support. Re-run with: cargo run --release --features cuda -- --cuda"
        );
        return Ok(());
    }

    let config_path = config::resolve_path(&args.work_dir, &args.config);
    let mut run_config = config::read_config(&config_path)
        .with_context(|| format!("failed to load configuration {}", config_path.display()))?;
    if let Some(max_epochs) = args.max_epochs {
        run_config.max_epochs = max_epochs;
    }
    let loss = Loss::from_name(&args.loss, &args.quantiles, args.alpha)?;
    info!("Model '{}' with loss {}", run_config.model_name, loss.name());

    let controller = RunController::new(RunOptions {
        loss,
        auto_accept_improvements: args.auto_accept,
        work_dir: args.work_dir.clone(),
        config_path,
        live_log: args.live_log,
        device: config::get_device(args.cuda, run_config.cuda_id),
    });

    let interrupt = controller.interrupt_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Manual interrupt, finishing the current batch");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let report = tokio::task::spawn_blocking(move || controller.run(&run_config))
        .await
        .context("training task panicked")??;

    if !report.test_metrics.is_empty() {
        let summary: Vec<String> = report.test_metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect();
        info!("Test metrics: {}", summary.join(" "));
    }
    if report.interrupted {
        info!("Run stopped early by user");
    } else if report.improved {
        info!(
            "Saved improved model to {} (best_score {:.6}, best_loss {:.6})",
            report.model_path.display(),
            report.config.best_score.unwrap_or(f64::NAN),
            report.config.best_loss.unwrap_or(f64::NAN)
        );
    } else {
        info!(
            "Kept existing model (new score {:.6}, previous {:.6})",
            report.score.unwrap_or(f64::NAN),
            report.baseline_score.unwrap_or(f64::NAN)
        );
    }
    Ok(())
}
