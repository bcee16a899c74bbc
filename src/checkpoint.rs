use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::Device;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ModelConfig, ModelKind, SteeringModel};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no artifact at {}", path.display())]
    Absent { path: PathBuf },

    #[error("artifact {} is unreadable: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("artifact {} does not fit this model: {reason}", path.display())]
    IncompatibleArchitecture { path: PathBuf, reason: String },
}

impl ArtifactError {
    pub fn is_absent(&self) -> bool {
        matches!(self, ArtifactError::Absent { .. })
    }
}

/// Architecture description stored next to a full-model snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub architecture: ModelKind,
    pub config: ModelConfig,
    pub parameter_count: usize,
    pub saved_at: String,
}

/// File names used for one model name inside the output directory.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub weights: PathBuf,
    pub model: PathBuf,
    pub manifest: PathBuf,
    pub history: PathBuf,
}

impl ArtifactPaths {
    pub fn new(output_dir: &Path, kind: ModelKind) -> Self {
        let name = kind.name();
        Self {
            weights: output_dir.join(format!("{name}-weights.safetensors")),
            model: output_dir.join(format!("{name}-model.safetensors")),
            manifest: output_dir.join(format!("{name}-model.json")),
            history: output_dir.join(format!("{name}-history.json")),
        }
    }
}

pub fn save_weights(model: &SteeringModel, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    model
        .varmap()
        .save(path)
        .with_context(|| format!("Failed writing weights: {}", path.display()))
}

/// Copies every tensor of a safetensors file into the model. Nothing is
/// written unless all names and shapes match.
pub fn load_weights(model: &SteeringModel, path: &Path) -> Result<(), ArtifactError> {
    if !path.exists() {
        return Err(ArtifactError::Absent {
            path: path.to_path_buf(),
        });
    }
    let corrupt = |reason: String| ArtifactError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let incompatible = |reason: String| ArtifactError::IncompatibleArchitecture {
        path: path.to_path_buf(),
        reason,
    };

    let stored = candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|err| corrupt(err.to_string()))?;

    let vars = model
        .varmap()
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    for (name, var) in vars.iter() {
        let tensor = stored
            .get(name)
            .ok_or_else(|| incompatible(format!("missing tensor {name}")))?;
        if tensor.dims() != var.dims() {
            return Err(incompatible(format!(
                "tensor {name} has shape {:?}, expected {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
    }
    if let Some(extra) = stored.keys().find(|name| !vars.contains_key(*name)) {
        return Err(incompatible(format!("unexpected tensor {extra}")));
    }

    for (name, var) in vars.iter() {
        let tensor = stored[name]
            .to_dtype(var.dtype())
            .and_then(|tensor| tensor.to_device(var.device()))
            .map_err(|err| corrupt(err.to_string()))?;
        var.set(&tensor).map_err(|err| corrupt(err.to_string()))?;
    }
    Ok(())
}

/// Writes the weights plus a JSON manifest describing the architecture.
pub fn save_model(model: &SteeringModel, paths: &ArtifactPaths) -> anyhow::Result<()> {
    save_weights(model, &paths.model)?;
    let manifest = ModelManifest {
        architecture: model.kind(),
        config: *model.config(),
        parameter_count: model.parameter_count(),
        saved_at: Utc::now().to_rfc3339(),
    };
    fs::write(&paths.manifest, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("Failed writing model manifest: {}", paths.manifest.display()))
}

/// Rebuilds a model from its manifest and loads the stored weights.
pub fn load_model(
    paths: &ArtifactPaths,
    expected: ModelKind,
    device: &Device,
) -> Result<SteeringModel, ArtifactError> {
    let has_weights = paths.model.exists();
    let has_manifest = paths.manifest.exists();
    if !has_weights && !has_manifest {
        return Err(ArtifactError::Absent {
            path: paths.model.clone(),
        });
    }
    if !has_manifest {
        return Err(ArtifactError::Corrupt {
            path: paths.model.clone(),
            reason: format!("manifest {} is missing", paths.manifest.display()),
        });
    }
    if !has_weights {
        return Err(ArtifactError::Corrupt {
            path: paths.model.clone(),
            reason: "weights file is missing".to_string(),
        });
    }

    let raw = fs::read_to_string(&paths.manifest).map_err(|err| ArtifactError::Corrupt {
        path: paths.manifest.clone(),
        reason: err.to_string(),
    })?;
    let manifest: ModelManifest =
        serde_json::from_str(&raw).map_err(|err| ArtifactError::Corrupt {
            path: paths.manifest.clone(),
            reason: err.to_string(),
        })?;

    if manifest.architecture != expected {
        return Err(ArtifactError::IncompatibleArchitecture {
            path: paths.manifest.clone(),
            reason: format!(
                "stored architecture is {}, requested {expected}",
                manifest.architecture
            ),
        });
    }

    let model = SteeringModel::new(manifest.architecture, manifest.config, device).map_err(
        |err| ArtifactError::IncompatibleArchitecture {
            path: paths.manifest.clone(),
            reason: err.to_string(),
        },
    )?;
    load_weights(&model, &paths.model)?;
    Ok(model)
}
