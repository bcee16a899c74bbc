mod checkpoint;
mod config;
mod dataset;
mod generator;
mod model;
mod train;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if cfg!(debug_assertions) {
        tracing::warn!(
            "Running a debug build. Training can be much slower. Use `cargo run --release ...`."
        );
    }

    let cfg = config::TrainConfig::parse();
    let kind = match model_kind_or_exit_code(&cfg) {
        Ok(kind) => kind,
        Err(code) => std::process::exit(code),
    };
    train::run_training(&cfg, kind)
}

/// Exit status used when `--model` names no known architecture.
const UNKNOWN_MODEL_EXIT: i32 = -1;

/// Resolves the architecture before any dataset or artifact I/O. On an
/// unknown name the message goes to stderr and the exit status is returned.
fn model_kind_or_exit_code(cfg: &config::TrainConfig) -> Result<model::ModelKind, i32> {
    cfg.model_kind().map_err(|err| {
        eprintln!("{err}");
        UNKNOWN_MODEL_EXIT
    })
}
