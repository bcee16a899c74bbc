use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{
    conv2d, linear, Conv2d, Conv2dConfig, Dropout, Linear, Module, ModuleT, VarBuilder, VarMap,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KERNEL: usize = 3;
const ELU_ALPHA: f64 = 1.0;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model '{0}' not known!")]
    UnknownModel(String),

    #[error("the {0} architecture only defines its input stage and cannot be trained")]
    Unimplemented(ModelKind),

    #[error("input of {height}x{width} after cropping is too small for the {kind} convolutions")]
    InputTooSmall {
        kind: ModelKind,
        height: usize,
        width: usize,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "commaAI")]
    CommaAi,
    #[serde(rename = "nvidia")]
    Nvidia,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::CommaAi => "commaAI",
            ModelKind::Nvidia => "nvidia",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commaAI" => Ok(ModelKind::CommaAi),
            "nvidia" => Ok(ModelKind::Nvidia),
            other => Err(ModelError::UnknownModel(other.to_string())),
        }
    }
}

/// Input geometry and regularisation shared by every architecture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub input_height: usize,
    pub input_width: usize,
    pub crop_top: usize,
    pub crop_bottom: usize,
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_height: 160,
            input_width: 320,
            crop_top: 50,
            crop_bottom: 20,
            dropout: 0.2,
        }
    }
}

impl ModelConfig {
    pub fn cropped_height(&self) -> usize {
        self.input_height
            .saturating_sub(self.crop_top + self.crop_bottom)
    }
}

/// Normalises raw `[0, 255]` NHWC frames to `[-0.5, 0.5]` NCHW and drops the
/// sky and hood rows.
#[derive(Debug, Clone, Copy)]
pub struct InputStage {
    crop_top: usize,
    cropped_height: usize,
}

impl InputStage {
    pub fn new(cfg: &ModelConfig) -> Self {
        Self {
            crop_top: cfg.crop_top,
            cropped_height: cfg.cropped_height(),
        }
    }

    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let x = x.permute((0, 3, 1, 2))?;
        let x = x.affine(1.0 / 255.0, -0.5)?;
        x.narrow(2, self.crop_top, self.cropped_height)?.contiguous()
    }
}

fn conv_out(len: usize, stride: usize) -> Option<usize> {
    len.checked_sub(KERNEL).map(|rest| rest / stride + 1)
}

#[derive(Debug)]
pub struct CommaAiNet {
    input: InputStage,
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    dropout: Dropout,
    fc1: Linear,
    head: Linear,
}

impl CommaAiNet {
    const STRIDES: [usize; 3] = [4, 2, 2];
    const CHANNELS: [usize; 3] = [16, 32, 64];
    const HIDDEN: usize = 512;

    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let too_small = || ModelError::InputTooSmall {
            kind: ModelKind::CommaAi,
            height: cfg.cropped_height(),
            width: cfg.input_width,
        };
        let (mut h, mut w) = (cfg.cropped_height(), cfg.input_width);
        for stride in Self::STRIDES {
            h = conv_out(h, stride).ok_or_else(too_small)?;
            w = conv_out(w, stride).ok_or_else(too_small)?;
        }
        let flat = Self::CHANNELS[2] * h * w;

        let conv = |in_c: usize, out_c: usize, stride: usize, name: &str| {
            let conv_cfg = Conv2dConfig {
                stride,
                ..Default::default()
            };
            conv2d(in_c, out_c, KERNEL, conv_cfg, vb.pp(name))
        };
        let [c1, c2, c3] = Self::CHANNELS;
        let [s1, s2, s3] = Self::STRIDES;

        Ok(Self {
            input: InputStage::new(cfg),
            conv1: conv(3, c1, s1, "conv1")?,
            conv2: conv(c1, c2, s2, "conv2")?,
            conv3: conv(c2, c3, s3, "conv3")?,
            dropout: Dropout::new(cfg.dropout),
            fc1: linear(flat, Self::HIDDEN, vb.pp("fc1"))?,
            head: linear(Self::HIDDEN, 1, vb.pp("head"))?,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let x = self.input.forward(x)?;
        let x = self.conv1.forward(&x)?.elu(ELU_ALPHA)?;
        let x = self.conv2.forward(&x)?.elu(ELU_ALPHA)?;
        let x = self.dropout.forward_t(&x, train)?;
        let x = self.conv3.forward(&x)?.elu(ELU_ALPHA)?;
        let x = x.flatten_from(1)?;
        let x = self.fc1.forward(&x)?.elu(ELU_ALPHA)?;
        let x = self.dropout.forward_t(&x, train)?;
        self.head.forward(&x)
    }
}

/// A trainable steering regressor together with the variables backing it.
pub struct SteeringModel {
    kind: ModelKind,
    cfg: ModelConfig,
    varmap: VarMap,
    net: CommaAiNet,
}

impl fmt::Debug for SteeringModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SteeringModel")
            .field("kind", &self.kind)
            .field("cfg", &self.cfg)
            .field("parameters", &self.parameter_count())
            .finish_non_exhaustive()
    }
}

impl SteeringModel {
    pub fn new(
        kind: ModelKind,
        cfg: ModelConfig,
        device: &Device,
    ) -> Result<Self, ModelError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = match kind {
            ModelKind::CommaAi => CommaAiNet::new(&cfg, vb)?,
            // Only the shared input stage is defined for nvidia.
            ModelKind::Nvidia => return Err(ModelError::Unimplemented(kind)),
        };
        Ok(Self {
            kind,
            cfg,
            varmap,
            net,
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Input: `(N, H, W, 3)` raw pixels. Output: `(N, 1)` steering angles.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.net.forward_t(x, train)
    }

    pub fn predict(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_t(x, false)
    }

    pub fn check_frame_size(&self, height: usize, width: usize) -> anyhow::Result<()> {
        if height != self.cfg.input_height || width != self.cfg.input_width {
            anyhow::bail!(
                "Camera frames are {height}x{width} but the {} model expects {}x{} (see --height/--width)",
                self.kind,
                self.cfg.input_height,
                self.cfg.input_width
            );
        }
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        self.trainable_vars().iter().map(|var| var.elem_count()).sum()
    }

    pub fn summary(&self) -> String {
        let mut rows: Vec<(String, Vec<usize>)> = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, var)| (name.clone(), var.dims().to_vec()))
            .collect();
        rows.sort();

        let mut out = format!(
            "{} (input {}x{}x3, crop top={} bottom={}, dropout={})\n",
            self.kind,
            self.cfg.input_height,
            self.cfg.input_width,
            self.cfg.crop_top,
            self.cfg.crop_bottom,
            self.cfg.dropout
        );
        for (name, dims) in rows {
            let count: usize = dims.iter().product();
            out.push_str(&format!("  {name:<16} {:<20} {count}\n", format!("{dims:?}")));
        }
        out.push_str(&format!("  total params: {}", self.parameter_count()));
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn small_config() -> ModelConfig {
        ModelConfig {
            input_height: 64,
            input_width: 64,
            crop_top: 8,
            crop_bottom: 8,
            dropout: 0.2,
        }
    }

    #[test]
    fn parses_known_model_names() {
        assert_eq!("commaAI".parse::<ModelKind>().unwrap(), ModelKind::CommaAi);
        assert_eq!("nvidia".parse::<ModelKind>().unwrap(), ModelKind::Nvidia);
        assert!(matches!(
            "resnet".parse::<ModelKind>(),
            Err(ModelError::UnknownModel(_))
        ));
        assert_eq!(ModelKind::CommaAi.to_string(), "commaAI");
    }

    #[test]
    fn model_names_match_exactly() {
        for name in ["comma-ai", "commaai", "CommaAI", "Nvidia", " nvidia"] {
            assert!(
                matches!(name.parse::<ModelKind>(), Err(ModelError::UnknownModel(ref n)) if n == name),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn debug_output_names_the_architecture() {
        let model = SteeringModel::new(ModelKind::CommaAi, small_config(), &Device::Cpu).unwrap();
        let text = format!("{model:?}");
        assert!(text.starts_with("SteeringModel"));
        assert!(text.contains("CommaAi"));
        assert!(text.contains(&format!("parameters: {}", model.parameter_count())));
    }

    #[test]
    fn nvidia_is_reported_unimplemented() {
        let result = SteeringModel::new(ModelKind::Nvidia, small_config(), &Device::Cpu);
        assert!(matches!(
            result,
            Err(ModelError::Unimplemented(ModelKind::Nvidia))
        ));
    }

    #[test]
    fn comma_ai_predicts_one_angle_per_frame() {
        let model = SteeringModel::new(ModelKind::CommaAi, small_config(), &Device::Cpu).unwrap();
        let x = Tensor::full(128f32, (5, 64, 64, 3), &Device::Cpu).unwrap();
        let y = model.forward_t(&x, true).unwrap();
        assert_eq!(y.dims(), &[5, 1]);
        let y = model.predict(&x).unwrap();
        assert_eq!(y.dims(), &[5, 1]);
    }

    #[test]
    fn default_geometry_flattens_to_expected_width() {
        // 90x320 -> 22x80 -> 10x39 -> 4x19 with 64 channels.
        let model =
            SteeringModel::new(ModelKind::CommaAi, ModelConfig::default(), &Device::Cpu).unwrap();
        let data = model.varmap().data().lock().unwrap();
        assert_eq!(data["fc1.weight"].dims(), &[512, 64 * 4 * 19]);
        assert_eq!(data["conv1.weight"].dims(), &[16, 3, 3, 3]);
        assert_eq!(data["head.weight"].dims(), &[1, 512]);
    }

    #[test]
    fn input_stage_normalises_and_crops() {
        let cfg = ModelConfig {
            input_height: 6,
            input_width: 2,
            crop_top: 2,
            crop_bottom: 1,
            dropout: 0.0,
        };
        let x = Tensor::full(255f32, (1, 6, 2, 3), &Device::Cpu).unwrap();
        let y = InputStage::new(&cfg).forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 3, 3, 2]);
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn tiny_frames_are_rejected() {
        let cfg = ModelConfig {
            input_height: 20,
            input_width: 20,
            crop_top: 5,
            crop_bottom: 5,
            dropout: 0.2,
        };
        assert!(matches!(
            SteeringModel::new(ModelKind::CommaAi, cfg, &Device::Cpu),
            Err(ModelError::InputTooSmall { .. })
        ));
    }

    #[test]
    fn frame_size_mismatch_is_reported() {
        let model = SteeringModel::new(ModelKind::CommaAi, small_config(), &Device::Cpu).unwrap();
        assert!(model.check_frame_size(64, 64).is_ok());
        assert!(model.check_frame_size(160, 320).is_err());
        assert!(model.summary().contains("total params"));
    }
}
