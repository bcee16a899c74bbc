use std::path::PathBuf;

use anyhow::Context;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::dataset::{
    load_rgb_as_hwc, resolve_image_path, CameraFrame, DataError, DrivingSample,
};

/// Each logical sample contributes one frame per camera.
pub const FRAMES_PER_SAMPLE: usize = 3;

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    pub dataset_root: PathBuf,
    pub batch_size: usize,
    pub steering_correction: f32,
}

/// Frames and steering angles of one step, index aligned.
#[derive(Debug)]
pub struct Batch {
    pub images: Vec<CameraFrame>,
    pub angles: Vec<f32>,
}

impl Batch {
    /// Stacks into `(N, H, W, 3)` images and `(N, 1)` targets.
    pub fn to_tensors(&self, device: &Device) -> anyhow::Result<(Tensor, Tensor)> {
        let Some(first) = self.images.first() else {
            anyhow::bail!("Cannot build tensors from an empty batch");
        };
        let dims = first.dims();

        let cpu = Device::Cpu;
        let mut image_tensors = Vec::with_capacity(self.images.len());
        for frame in &self.images {
            if frame.dims() != dims {
                anyhow::bail!(
                    "Frames in one batch differ in size: {:?} vs {:?}",
                    frame.dims(),
                    dims
                );
            }
            let tensor = Tensor::from_vec(frame.data.clone(), dims, &cpu)
                .context("Failed to build image tensor")?;
            image_tensors.push(tensor);
        }

        let image_refs: Vec<&Tensor> = image_tensors.iter().collect();
        let images = Tensor::stack(&image_refs, 0)?;
        let angles = Tensor::from_vec(self.angles.clone(), (self.angles.len(), 1), &cpu)
            .context("Failed to build angle tensor")?;

        Ok((images.to_device(device)?, angles.to_device(device)?))
    }
}

/// Steering targets for the left, center and right frames of one sample,
/// in that order.
pub fn camera_angles(center: f32, correction: f32) -> [f32; FRAMES_PER_SAMPLE] {
    [center + correction, center, center - correction]
}

/// Endless cyclic stream of batches over a sample set.
///
/// Every step takes the next `batch_size / 3` samples (floor) and expands
/// each into its left, center and right frames, so a step yields at most
/// `3 * (batch_size / 3)` pairs. The last slice of a pass may be shorter.
/// Once a pass is exhausted the samples are reshuffled in place and the
/// offset restarts at zero; the iterator never returns `None`, so callers
/// bound it by a step count.
pub struct BatchGenerator {
    samples: Vec<DrivingSample>,
    cfg: GeneratorConfig,
    rng: StdRng,
    samples_per_step: usize,
    offset: usize,
    passes: usize,
}

impl BatchGenerator {
    pub fn new(
        samples: Vec<DrivingSample>,
        cfg: GeneratorConfig,
        rng: StdRng,
    ) -> anyhow::Result<Self> {
        if samples.is_empty() {
            anyhow::bail!("No samples were provided");
        }
        let samples_per_step = cfg.batch_size / FRAMES_PER_SAMPLE;
        if samples_per_step == 0 {
            anyhow::bail!(
                "Batch size {} yields no samples per step (needs at least {FRAMES_PER_SAMPLE})",
                cfg.batch_size
            );
        }

        let mut generator = Self {
            samples,
            cfg,
            rng,
            samples_per_step,
            offset: 0,
            passes: 0,
        };
        generator.start_pass();
        Ok(generator)
    }

    pub fn samples_per_step(&self) -> usize {
        self.samples_per_step
    }

    /// Number of passes over the samples started so far, counting the
    /// current one.
    pub fn passes(&self) -> usize {
        self.passes
    }

    fn start_pass(&mut self) {
        self.samples.shuffle(&mut self.rng);
        self.offset = 0;
        self.passes += 1;
    }

    fn next_batch(&mut self) -> Result<Batch, DataError> {
        if self.offset >= self.samples.len() {
            self.start_pass();
        }
        let end = (self.offset + self.samples_per_step).min(self.samples.len());
        let slice = self.offset..end;
        self.offset = end;

        let mut images = Vec::with_capacity(slice.len() * FRAMES_PER_SAMPLE);
        let mut angles = Vec::with_capacity(slice.len() * FRAMES_PER_SAMPLE);
        for sample in &self.samples[slice] {
            let (frames, sample_angles) = self.expand_sample(sample)?;
            images.extend(frames);
            angles.extend(sample_angles);
        }

        let mut order: Vec<usize> = (0..angles.len()).collect();
        order.shuffle(&mut self.rng);
        let mut images: Vec<Option<CameraFrame>> = images.into_iter().map(Some).collect();
        let images = order
            .iter()
            .filter_map(|&idx| images[idx].take())
            .collect();
        let angles = order.iter().map(|&idx| angles[idx]).collect();

        Ok(Batch { images, angles })
    }

    fn expand_sample(
        &self,
        sample: &DrivingSample,
    ) -> Result<([CameraFrame; FRAMES_PER_SAMPLE], [f32; FRAMES_PER_SAMPLE]), DataError> {
        let root = &self.cfg.dataset_root;
        let center = load_rgb_as_hwc(&resolve_image_path(root, &sample.center_path))?;
        let left = load_rgb_as_hwc(&resolve_image_path(root, &sample.left_path))?;
        let right = load_rgb_as_hwc(&resolve_image_path(root, &sample.right_path))?;

        Ok((
            [left, center, right],
            camera_angles(sample.steering, self.cfg.steering_correction),
        ))
    }
}

impl Iterator for BatchGenerator {
    type Item = Result<Batch, DataError>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}
