use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{load_model, load_weights, save_model, save_weights, ArtifactPaths};
use crate::config::TrainConfig;
use crate::dataset::{read_driving_log, split_samples, DrivingSample};
use crate::generator::{BatchGenerator, GeneratorConfig, FRAMES_PER_SAMPLE};
use crate::model::{ModelKind, SteeringModel};

#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub loss: f64,
    pub val_loss: f64,
    pub checkpointed: bool,
    pub epoch_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
struct TrainingReport<'a> {
    config: &'a TrainConfig,
    model: ModelKind,
    model_source: ModelSource,
    effective_batch_size: usize,
    train_samples: usize,
    validation_samples: usize,
    stopped_early: bool,
    best_loss: f64,
    history: &'a [EpochSummary],
}

/// Where the weights of the model being trained came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Pretrained,
    Weights,
    Scratch,
}

/// Stops once the monitored loss has not strictly improved for `patience`
/// consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn should_stop(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        self.wait >= self.patience
    }
}

/// Tracks the lowest loss seen; `improved` is true when a new snapshot is due.
#[derive(Debug, Clone)]
pub struct BestLossCheckpoint {
    best: f64,
}

impl Default for BestLossCheckpoint {
    fn default() -> Self {
        Self {
            best: f64::INFINITY,
        }
    }
}

impl BestLossCheckpoint {
    pub fn improved(&mut self, loss: f64) -> bool {
        if loss < self.best {
            self.best = loss;
            return true;
        }
        false
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

struct FitPlan {
    epochs: usize,
    train_steps: usize,
    val_steps: usize,
    patience: usize,
}

struct FitOutcome {
    history: Vec<EpochSummary>,
    stopped_early: bool,
    best_loss: f64,
}

pub fn run_training(cfg: &TrainConfig, kind: ModelKind) -> anyhow::Result<()> {
    cfg.validate()?;

    let dataset_root = cfg.dataset_root();
    let output_dir = cfg.output_dir();
    let paths = ArtifactPaths::new(&output_dir, kind);

    let samples = read_driving_log(&dataset_root)?;
    if samples.len() < 2 {
        anyhow::bail!(
            "Need at least two samples in {} to create train/validation splits",
            dataset_root.display()
        );
    }

    log_recording_stats(&dataset_root, &samples);

    let device = resolve_device(&cfg.device)?;
    info!("Using device: {device:?}");

    let (model, model_source) = resolve_model(kind, cfg, &paths, &device)?;

    let (train_samples, val_samples) = split_samples(samples, cfg.val_fraction, cfg.seed)?;
    let train_len = train_samples.len();
    let val_len = val_samples.len();
    info!("Samples in training set:   {train_len}");
    info!("Samples in validation set: {val_len}");

    let batch_size = effective_batch_size(val_len, cfg.batchsize)?;
    if batch_size != cfg.batchsize {
        warn!("Batchsize too high for dataset, changed batchsize to {batch_size}");
    }
    if batch_size < FRAMES_PER_SAMPLE {
        warn!(
            "Batchsize {batch_size} is below {FRAMES_PER_SAMPLE} and cannot hold one sample per step"
        );
    }

    let plan = FitPlan {
        epochs: cfg.epochs,
        train_steps: train_len / batch_size,
        val_steps: val_len / batch_size,
        patience: cfg.patience,
    };
    if plan.train_steps == 0 {
        anyhow::bail!(
            "Training set of {train_len} samples is smaller than batchsize {batch_size}"
        );
    }

    let mut train_generator = BatchGenerator::new(
        train_samples,
        GeneratorConfig {
            dataset_root: dataset_root.clone(),
            batch_size,
            steering_correction: cfg.steering_corr,
        },
        generator_rng(cfg.seed, 1),
    )?;
    let mut val_generator = BatchGenerator::new(
        val_samples,
        GeneratorConfig {
            dataset_root,
            batch_size,
            steering_correction: cfg.steering_corr,
        },
        generator_rng(cfg.seed, 2),
    )?;

    info!(
        "Batchsize {batch_size}: {} samples ({} frames) per step, {} train / {} validation steps",
        train_generator.samples_per_step(),
        train_generator.samples_per_step() * FRAMES_PER_SAMPLE,
        plan.train_steps,
        plan.val_steps
    );
    info!("{}", model.summary());

    fs::create_dir_all(&output_dir).with_context(|| {
        format!("Failed creating output directory: {}", output_dir.display())
    })?;

    let adam_params = ParamsAdamW {
        lr: cfg.lr,
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(model.trainable_vars(), adam_params)?;

    let outcome = fit(
        &model,
        &mut optimizer,
        &mut train_generator,
        &mut val_generator,
        &plan,
        &paths,
        &device,
    )?;

    save_weights(&model, &paths.weights)?;
    save_model(&model, &paths)?;

    let report = TrainingReport {
        config: cfg,
        model: kind,
        model_source,
        effective_batch_size: batch_size,
        train_samples: train_len,
        validation_samples: val_len,
        stopped_early: outcome.stopped_early,
        best_loss: outcome.best_loss,
        history: &outcome.history,
    };
    write_report(&paths.history, &report)?;

    info!(
        "Best training loss {:.5}; weights in {}, model in {}",
        outcome.best_loss,
        paths.weights.display(),
        paths.model.display()
    );
    Ok(())
}

/// Halves the batch size until the validation set fills at least one batch.
pub fn effective_batch_size(validation_len: usize, requested: usize) -> anyhow::Result<usize> {
    if validation_len == 0 {
        anyhow::bail!("Validation set is empty; provide more samples or raise --val-fraction");
    }
    let mut batch_size = requested;
    while batch_size > 0 && validation_len / batch_size == 0 {
        batch_size /= 2;
    }
    if batch_size == 0 {
        anyhow::bail!("--batchsize must be > 0");
    }
    Ok(batch_size)
}

/// Pretrained full model first, then fresh weights from the weights file,
/// then from scratch. Only a missing file moves on to the next option.
pub fn resolve_model(
    kind: ModelKind,
    cfg: &TrainConfig,
    paths: &ArtifactPaths,
    device: &Device,
) -> anyhow::Result<(SteeringModel, ModelSource)> {
    match load_model(paths, kind, device) {
        Ok(model) => {
            info!("Loaded pretrained {kind} model from {}", paths.model.display());
            return Ok((model, ModelSource::Pretrained));
        }
        Err(err) if err.is_absent() => {}
        Err(err) => return Err(err.into()),
    }

    let model = SteeringModel::new(kind, cfg.model_config(), device)?;
    match load_weights(&model, &paths.weights) {
        Ok(()) => {
            info!("Loaded weights for {kind} model from {}", paths.weights.display());
            Ok((model, ModelSource::Weights))
        }
        Err(err) if err.is_absent() => {
            warn!(
                "Could not load weights for {kind} model from file {}! Starting training from scratch!",
                paths.weights.display()
            );
            Ok((model, ModelSource::Scratch))
        }
        Err(err) => Err(err.into()),
    }
}

fn fit(
    model: &SteeringModel,
    optimizer: &mut AdamW,
    train_generator: &mut BatchGenerator,
    val_generator: &mut BatchGenerator,
    plan: &FitPlan,
    paths: &ArtifactPaths,
    device: &Device,
) -> anyhow::Result<FitOutcome> {
    let mut early_stopping = EarlyStopping::new(plan.patience);
    let mut checkpoint = BestLossCheckpoint::default();
    let mut history = Vec::with_capacity(plan.epochs);
    let mut stopped_early = false;

    for epoch in 1..=plan.epochs {
        let epoch_started = Instant::now();

        let loss = run_epoch(
            model,
            train_generator,
            plan.train_steps,
            device,
            Some(&mut *optimizer),
        )?;
        let val_loss = run_epoch(model, val_generator, plan.val_steps, device, None)?;

        let checkpointed = checkpoint.improved(loss);
        if checkpointed {
            save_weights(model, &paths.weights)?;
            info!(
                "Epoch {epoch}: loss improved to {loss:.5}, saved weights to {}",
                paths.weights.display()
            );
        }

        let epoch_seconds = epoch_started.elapsed().as_secs_f64();
        info!(
            "Epoch {epoch}/{}: loss={loss:.5} val_loss={val_loss:.5} ({epoch_seconds:.1}s)",
            plan.epochs
        );
        debug!(
            "Epoch {epoch}: train generator on pass {}, validation generator on pass {}",
            train_generator.passes(),
            val_generator.passes()
        );
        history.push(EpochSummary {
            epoch,
            loss,
            val_loss,
            checkpointed,
            epoch_seconds,
        });

        if early_stopping.should_stop(loss) {
            info!("Epoch {epoch}: early stopping");
            stopped_early = true;
            break;
        }
    }

    Ok(FitOutcome {
        history,
        stopped_early,
        best_loss: checkpoint.best(),
    })
}

/// Runs `steps` batches and returns the mean MSE. Weights are only updated
/// when an optimizer is given; dropout follows the same switch.
fn run_epoch(
    model: &SteeringModel,
    generator: &mut BatchGenerator,
    steps: usize,
    device: &Device,
    mut optimizer: Option<&mut AdamW>,
) -> anyhow::Result<f64> {
    if steps == 0 {
        anyhow::bail!("Epoch phase has no steps");
    }
    let is_training = optimizer.is_some();
    let label = if is_training { "train" } else { "val" };

    let progress = ProgressBar::new(steps as u64);
    progress.set_style(progress_style());

    let mut total_loss = 0f64;
    for _ in 0..steps {
        let batch = generator
            .next()
            .context("Batch generator stopped producing batches")??;
        if let Some(frame) = batch.images.first() {
            model.check_frame_size(frame.height, frame.width)?;
        }
        let (images, angles) = batch.to_tensors(device)?;

        let predictions = if is_training {
            model.forward_t(&images, true)?
        } else {
            model.predict(&images)?
        };
        let loss = candle_nn::loss::mse(&predictions, &angles)?;
        if let Some(opt) = optimizer.as_deref_mut() {
            opt.backward_step(&loss)?;
        }

        let batch_loss = f64::from(loss.to_scalar::<f32>()?);
        total_loss += batch_loss;
        progress.set_message(format!("{label} loss={batch_loss:.4}"));
        progress.inc(1);
    }
    progress.finish_and_clear();

    Ok(total_loss / steps as f64)
}

fn log_recording_stats(dataset_root: &Path, samples: &[DrivingSample]) {
    let steering = samples.iter().map(|s| s.steering).sum::<f32>() / samples.len().max(1) as f32;
    info!(
        "Read {} samples from {}: mean steering {:.3}, throttle {:.3}, brake {:.3}, speed {:.1}",
        samples.len(),
        dataset_root.display(),
        steering,
        mean_present(samples, |s| s.throttle),
        mean_present(samples, |s| s.brake),
        mean_present(samples, |s| s.speed)
    );
}

/// Mean over the rows where the signal was recorded; NaN when none were.
fn mean_present(samples: &[DrivingSample], field: fn(&DrivingSample) -> Option<f32>) -> f32 {
    let (sum, count) = samples
        .iter()
        .filter_map(field)
        .fold((0.0f32, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        f32::NAN
    } else {
        sum / count as f32
    }
}

fn write_report(path: &Path, report: &TrainingReport<'_>) -> anyhow::Result<()> {
    fs::write(path, serde_json::to_string_pretty(report)?)
        .with_context(|| format!("Failed writing training history: {}", path.display()))
}

fn generator_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_os_rng(),
    }
}

fn resolve_device(device_arg: &str) -> anyhow::Result<Device> {
    match device_arg {
        "auto" => match Device::cuda_if_available(0) {
            Ok(device) => Ok(device),
            Err(_) => Ok(Device::Cpu),
        },
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0)
            .context("CUDA requested with --device cuda, but CUDA is not available"),
        other => anyhow::bail!("Unsupported --device value: {other} (expected auto|cpu|cuda)"),
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::small_config;
    use clap::Parser;

    fn config_for(runs_dir: &Path, output_dir: &Path, extra: &[&str]) -> TrainConfig {
        let height = if extra.contains(&"--height") { None } else { Some("64") };
        let mut args = vec![
            "steering-trainer-rs".to_string(),
            "0".to_string(),
            "--runs-dir".to_string(),
            runs_dir.display().to_string(),
            "--output-dir".to_string(),
            output_dir.display().to_string(),
            "--width".to_string(),
            "64".to_string(),
            "--crop-top".to_string(),
            "8".to_string(),
            "--crop-bottom".to_string(),
            "8".to_string(),
            "--device".to_string(),
            "cpu".to_string(),
            "--seed".to_string(),
            "7".to_string(),
        ];
        if let Some(height) = height {
            args.extend(["--height".to_string(), height.to_string()]);
        }
        args.extend(extra.iter().map(|arg| arg.to_string()));
        TrainConfig::parse_from(args)
    }

    fn write_recording(run_dir: &Path, rows: usize) {
        let img_dir = run_dir.join("IMG");
        fs::create_dir_all(&img_dir).unwrap();
        for (name, value) in [("left.png", 60u8), ("center.png", 120), ("right.png", 180)] {
            image::RgbImage::from_fn(64, 64, |x, y| {
                image::Rgb([value, (x * 3) as u8, (y * 3) as u8])
            })
            .save(img_dir.join(name))
            .unwrap();
        }

        let mut log = String::from("center,left,right,steering,throttle,brake,speed\n");
        for idx in 0..rows {
            let angle = (idx as f32 / rows as f32) - 0.5;
            // Some recordings leave the speed column empty.
            let speed = if idx % 4 == 3 { "" } else { "30" };
            log.push_str(&format!(
                "IMG/center.png, IMG/left.png, IMG/right.png, {angle}, 0.8, 0, {speed}\n"
            ));
        }
        fs::write(run_dir.join("driving_log.csv"), log).unwrap();
    }

    #[test]
    fn batch_size_halves_until_validation_fits() {
        assert_eq!(effective_batch_size(5, 256).unwrap(), 4);
        assert_eq!(effective_batch_size(100, 256).unwrap(), 64);
        assert_eq!(effective_batch_size(600, 256).unwrap(), 256);
        assert_eq!(effective_batch_size(1, 256).unwrap(), 1);
        assert!(effective_batch_size(0, 256).is_err());
    }

    #[test]
    fn control_means_skip_missing_signals() {
        let row = |speed: Option<f32>| DrivingSample {
            center_path: "c.jpg".into(),
            left_path: "l.jpg".into(),
            right_path: "r.jpg".into(),
            steering: 0.0,
            throttle: None,
            brake: Some(0.0),
            speed,
        };
        let samples = vec![row(Some(20.0)), row(None), row(Some(30.0))];
        assert_eq!(mean_present(&samples, |s| s.speed), 25.0);
        assert_eq!(mean_present(&samples, |s| s.brake), 0.0);
        assert!(mean_present(&samples, |s| s.throttle).is_nan());
    }

    #[test]
    fn early_stopping_waits_for_patience() {
        let mut stopper = EarlyStopping::new(3);
        let losses = [1.0, 0.9, 0.95, 0.91, 0.92];
        let decisions: Vec<bool> = losses.iter().map(|l| stopper.should_stop(*l)).collect();
        assert_eq!(decisions, vec![false, false, false, false, true]);

        let mut stopper = EarlyStopping::new(3);
        let losses = [1.0, 1.0, 1.0, 0.5, 0.6, 0.6];
        let decisions: Vec<bool> = losses.iter().map(|l| stopper.should_stop(*l)).collect();
        assert_eq!(decisions, vec![false, false, false, false, false, false]);
    }

    #[test]
    fn checkpoint_fires_on_strict_improvement_only() {
        let mut checkpoint = BestLossCheckpoint::default();
        assert!(checkpoint.improved(0.5));
        assert!(!checkpoint.improved(0.5));
        assert!(!checkpoint.improved(0.7));
        assert!(checkpoint.improved(0.2));
        assert_eq!(checkpoint.best(), 0.2);
    }

    #[test]
    fn model_resolution_falls_back_only_on_absent_files() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config_for(tmp.path(), tmp.path(), &[]);
        let paths = ArtifactPaths::new(tmp.path(), ModelKind::CommaAi);

        let (model, source) =
            resolve_model(ModelKind::CommaAi, &cfg, &paths, &Device::Cpu).unwrap();
        assert_eq!(source, ModelSource::Scratch);

        save_weights(&model, &paths.weights).unwrap();
        let (_, source) = resolve_model(ModelKind::CommaAi, &cfg, &paths, &Device::Cpu).unwrap();
        assert_eq!(source, ModelSource::Weights);

        save_model(&model, &paths).unwrap();
        let (loaded, source) =
            resolve_model(ModelKind::CommaAi, &cfg, &paths, &Device::Cpu).unwrap();
        assert_eq!(source, ModelSource::Pretrained);
        assert_eq!(loaded.config(), &small_config());

        fs::remove_file(&paths.model).unwrap();
        fs::remove_file(&paths.manifest).unwrap();
        fs::write(&paths.weights, b"garbage").unwrap();
        assert!(resolve_model(ModelKind::CommaAi, &cfg, &paths, &Device::Cpu).is_err());
    }

    #[test]
    fn missing_recording_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config_for(tmp.path(), tmp.path(), &[]);
        let err = run_training(&cfg, ModelKind::CommaAi).unwrap_err();
        assert!(err.to_string().contains("run00"));
    }

    #[test]
    fn trains_end_to_end_and_resumes() {
        let tmp = tempfile::tempdir().unwrap();
        let runs_dir = tmp.path().join("runs");
        let output_dir = tmp.path().join("out");
        write_recording(&runs_dir.join("run00"), 20);

        let cfg = config_for(&runs_dir, &output_dir, &["--epochs", "2", "--batchsize", "9"]);
        run_training(&cfg, ModelKind::CommaAi).unwrap();

        let paths = ArtifactPaths::new(&output_dir, ModelKind::CommaAi);
        assert!(paths.weights.exists());
        assert!(paths.model.exists());
        assert!(paths.manifest.exists());

        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.history).unwrap()).unwrap();
        // 20 samples -> 4 for validation, so batchsize 9 shrinks to 4.
        assert_eq!(report["effective_batch_size"], 4);
        assert_eq!(report["validation_samples"], 4);
        assert_eq!(report["model_source"], "scratch");
        let history = report["history"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["checkpointed"], true);
        assert!(history[0]["loss"].as_f64().unwrap().is_finite());

        let (_, source) = resolve_model(ModelKind::CommaAi, &cfg, &paths, &Device::Cpu).unwrap();
        assert_eq!(source, ModelSource::Pretrained);
    }

    #[test]
    fn mismatched_frames_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let runs_dir = tmp.path().join("runs");
        write_recording(&runs_dir.join("run00"), 20);

        let cfg = config_for(
            &runs_dir,
            &tmp.path().join("out"),
            &["--epochs", "1", "--height", "80"],
        );
        let err = run_training(&cfg, ModelKind::CommaAi).unwrap_err();
        assert!(err.to_string().contains("expects 80x64"));
    }
}
