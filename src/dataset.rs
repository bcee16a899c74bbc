use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

pub const DRIVING_LOG_FILE: &str = "driving_log.csv";
pub const IMAGE_DIR: &str = "IMG";

const LOG_COLUMNS: usize = 7;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("missing file or directory: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("failed to read driving log {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("malformed row at line {line} of {}: {reason}", path.display())]
    MalformedRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("failed to load image {}: {source}", path.display())]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// One row of the driving log: three camera views and the control signals
/// recorded at the same timestep. Only the steering angle is required to be
/// numeric; the other signals are `None` when blank or unparsable.
#[derive(Clone, Debug, PartialEq)]
pub struct DrivingSample {
    pub center_path: String,
    pub left_path: String,
    pub right_path: String,
    pub steering: f32,
    pub throttle: Option<f32>,
    pub brake: Option<f32>,
    pub speed: Option<f32>,
}

/// An RGB frame in height x width x channel order, values as stored on disk.
#[derive(Clone, Debug)]
pub struct CameraFrame {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl CameraFrame {
    pub const CHANNELS: usize = 3;

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.height, self.width, Self::CHANNELS)
    }
}

/// Reads `<dataset_root>/driving_log.csv`. The first row is treated as a
/// header and skipped without inspection.
pub fn read_driving_log(dataset_root: &Path) -> Result<Vec<DrivingSample>, DataError> {
    if !dataset_root.is_dir() {
        return Err(DataError::MissingFile {
            path: dataset_root.to_path_buf(),
        });
    }
    let log_path = dataset_root.join(DRIVING_LOG_FILE);
    if !log_path.is_file() {
        return Err(DataError::MissingFile { path: log_path });
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(&log_path)
        .map_err(|source| DataError::Csv {
            path: log_path.clone(),
            source,
        })?;

    let mut samples = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.map_err(|source| DataError::Csv {
            path: log_path.clone(),
            source,
        })?;
        // Header is line 1.
        let line = row_idx + 2;
        samples.push(parse_record(&record, &log_path, line)?);
    }

    Ok(samples)
}

fn parse_record(
    record: &csv::StringRecord,
    log_path: &Path,
    line: usize,
) -> Result<DrivingSample, DataError> {
    if record.len() < LOG_COLUMNS {
        return Err(DataError::MalformedRow {
            path: log_path.to_path_buf(),
            line,
            reason: format!("expected {LOG_COLUMNS} columns, found {}", record.len()),
        });
    }

    let raw_steering = &record[3];
    let steering = raw_steering
        .parse::<f32>()
        .map_err(|_| DataError::MalformedRow {
            path: log_path.to_path_buf(),
            line,
            reason: format!("steering is not a number: {raw_steering:?}"),
        })?;
    let signal = |idx: usize| record[idx].parse::<f32>().ok();

    Ok(DrivingSample {
        center_path: record[0].to_string(),
        left_path: record[1].to_string(),
        right_path: record[2].to_string(),
        steering,
        throttle: signal(4),
        brake: signal(5),
        speed: signal(6),
    })
}

/// Shuffles and splits into `(train, validation)`. The training side gets
/// `round(n * (1 - val_fraction))` samples.
pub fn split_samples(
    mut samples: Vec<DrivingSample>,
    val_fraction: f32,
    seed: Option<u64>,
) -> anyhow::Result<(Vec<DrivingSample>, Vec<DrivingSample>)> {
    if !(0.0..1.0).contains(&val_fraction) {
        anyhow::bail!("--val-fraction must be in [0, 1), got {val_fraction}");
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    samples.shuffle(&mut rng);

    let len = samples.len();
    let train_count = ((len as f64) * (1.0 - f64::from(val_fraction))).round() as usize;
    let val_samples = samples.split_off(train_count.min(len));
    Ok((samples, val_samples))
}

/// Maps a path recorded by the simulator (possibly from another machine or
/// OS) onto `<dataset_root>/IMG/<file name>`.
pub fn resolve_image_path(dataset_root: &Path, recorded: &str) -> PathBuf {
    let file_name = recorded.rsplit(['/', '\\']).next().unwrap_or(recorded);
    dataset_root.join(IMAGE_DIR).join(file_name)
}

pub fn load_rgb_as_hwc(path: &Path) -> Result<CameraFrame, DataError> {
    let rgb = image::open(path)
        .map_err(|source| DataError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let data = rgb.into_raw().into_iter().map(f32::from).collect();
    Ok(CameraFrame {
        height: height as usize,
        width: width as usize,
        data,
    })
}
