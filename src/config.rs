use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;

use crate::model::{ModelConfig, ModelError, ModelKind};

#[derive(Debug, Clone, Serialize, Parser)]
#[command(
    name = "steering-trainer-rs",
    about = "Train a steering-angle regression CNN on driving-simulator recordings using Candle"
)]
pub struct TrainConfig {
    #[arg(default_value_t = 0, help = "Choose trainingset (reads <runs-dir>/runNN)")]
    pub trainingset: u32,

    #[arg(
        long = "steering_corr",
        default_value_t = 0.2,
        help = "Steering correction applied to left and right camera images"
    )]
    pub steering_corr: f32,

    #[arg(long, default_value_t = 20, help = "Number of epochs for training")]
    pub epochs: usize,

    #[arg(long, default_value_t = 256, help = "Batchsize for training")]
    pub batchsize: usize,

    #[arg(
        long,
        default_value = "commaAI",
        help = "Choose between models: commaAI, nvidia"
    )]
    pub model: String,

    #[arg(long, default_value = "..", help = "Directory holding the runNN recordings")]
    pub runs_dir: String,

    #[arg(long, default_value = ".", help = "Directory for weights, model and history files")]
    pub output_dir: String,

    #[arg(long, default_value_t = 0.2)]
    pub val_fraction: f32,

    #[arg(long, default_value_t = 0.2)]
    pub dropout: f32,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,

    #[arg(long, default_value_t = 3)]
    pub patience: usize,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, default_value = "auto")]
    pub device: String,

    #[arg(long, default_value_t = 160)]
    pub height: usize,

    #[arg(long, default_value_t = 320)]
    pub width: usize,

    #[arg(long, default_value_t = 50)]
    pub crop_top: usize,

    #[arg(long, default_value_t = 20)]
    pub crop_bottom: usize,
}

impl TrainConfig {
    /// Resolves `--model` without touching the filesystem.
    pub fn model_kind(&self) -> Result<ModelKind, ModelError> {
        self.model.parse()
    }

    pub fn dataset_root(&self) -> PathBuf {
        PathBuf::from(&self.runs_dir).join(format!("run{:02}", self.trainingset))
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            input_height: self.height,
            input_width: self.width,
            crop_top: self.crop_top,
            crop_bottom: self.crop_bottom,
            dropout: self.dropout,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
            anyhow::bail!(
                "--val-fraction must be in (0, 1), got {}",
                self.val_fraction
            );
        }
        if !self.steering_corr.is_finite() {
            anyhow::bail!("--steering_corr must be finite");
        }
        if self.batchsize == 0 {
            anyhow::bail!("--batchsize must be > 0");
        }
        if self.epochs == 0 {
            anyhow::bail!("--epochs must be > 0");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("--dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.lr <= 0.0 {
            anyhow::bail!("--lr must be > 0");
        }
        if self.height == 0 || self.width == 0 {
            anyhow::bail!("--height and --width must be > 0");
        }
        if self.crop_top + self.crop_bottom >= self.height {
            anyhow::bail!(
                "--crop-top + --crop-bottom ({}) must leave rows of a {}-row frame",
                self.crop_top + self.crop_bottom,
                self.height
            );
        }
        Ok(())
    }
}
