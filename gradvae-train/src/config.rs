//! Experiment configuration.
//!
//! An experiment is described by one JSON file:
//!
//! ```json
//! {
//!   "model": { "n_channels": 64, "ch_mult": [1, 2, 2, 2] },
//!   "train": { "exp_dir": "runs/gradvae", "learning_rate": 1e-4, "batch_size": 2,
//!              "train_steps": 100000, "log_every": 50, "ckpt_every": 5000,
//!              "image_every": 1000, "val_every": 5000 },
//!   "dataset": { "train": { "path": "data/train" }, "val": { "path": "data/val" } }
//! }
//! ```
//!
//! Every field except the dataset paths and `exp_dir` has a default.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use candle::DType;
use gradvae_models::models::autoencoder::AutoencoderConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default)]
    pub model: AutoencoderConfig,
    pub train: TrainParams,
    pub dataset: DatasetConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainParams {
    /// Output folder for summaries and `checkpoints/`.
    pub exp_dir: PathBuf,

    /// AdamW learning rate (default: 1e-4).
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// AdamW decoupled weight decay (default: 0.01).
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Volumes per batch (default: 1).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Threads used to read samples of a batch (default: 1).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Total optimisation steps (default: 100000).
    #[serde(default = "default_train_steps")]
    pub train_steps: usize,

    /// Steps between averaged training loss summaries (default: 50).
    #[serde(default = "default_log_every")]
    pub log_every: usize,

    /// Steps between checkpoints (default: 5000).
    #[serde(default = "default_ckpt_every")]
    pub ckpt_every: usize,

    /// Steps between reconstruction slice images (default: 1000).
    #[serde(default = "default_image_every")]
    pub image_every: usize,

    /// Steps between validation passes (default: 5000).
    #[serde(default = "default_val_every")]
    pub val_every: usize,

    /// Seed for shuffling, crops and device rngs (default: 231).
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Length of the crop taken along the last volume axis (default: 128).
    #[serde(default = "default_crop_len")]
    pub crop_len: usize,

    /// Training crops start uniformly in `[0, crop_max_offset)` (default: 32).
    #[serde(default = "default_crop_max_offset")]
    pub crop_max_offset: usize,

    /// Fixed crop start used for validation (default: 16).
    #[serde(default = "default_val_crop_offset")]
    pub val_crop_offset: usize,

    /// Weight of the KL term; 0 trains on reconstruction only (default: 0).
    #[serde(default)]
    pub kl_weight: f64,

    /// Decode a posterior sample instead of the mean during training (default: false).
    #[serde(default)]
    pub sample_posterior: bool,

    /// Parameter dtype: "f32" or "f64" (default: "f32").
    #[serde(default = "default_precision")]
    pub precision: String,

    /// Initial weights; a leading `vae.` on tensor names is stripped.
    #[serde(default)]
    pub init_from: Option<PathBuf>,

    /// Resume from this checkpoint step in `exp_dir/checkpoints`; `Some(0)` picks the latest.
    #[serde(default)]
    pub resume_from: Option<usize>,
}

fn default_learning_rate() -> f64 {
    1e-4
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_batch_size() -> usize {
    1
}
fn default_num_workers() -> usize {
    1
}
fn default_train_steps() -> usize {
    100_000
}
fn default_log_every() -> usize {
    50
}
fn default_ckpt_every() -> usize {
    5000
}
fn default_image_every() -> usize {
    1000
}
fn default_val_every() -> usize {
    5000
}
fn default_seed() -> u64 {
    231
}
fn default_crop_len() -> usize {
    128
}
fn default_crop_max_offset() -> usize {
    32
}
fn default_val_crop_offset() -> usize {
    16
}
fn default_precision() -> String {
    "f32".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub train: DatasetSource,
    pub val: DatasetSource,
}

/// Directory of `.npy` volumes stored channels-last (`H, W, Z[, C]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSource {
    pub path: PathBuf,
}

impl TrainParams {
    pub fn dtype(&self) -> Result<DType> {
        let dtype = DType::from_str(&self.precision)
            .map_err(|e| anyhow!("invalid precision '{}': {e}", self.precision))?;
        match dtype {
            DType::F32 | DType::F64 => Ok(dtype),
            DType::BF16 | DType::F16 => bail!(
                "precision '{}' is not supported: group norm statistics and the AdamW moments need f32 or f64",
                self.precision
            ),
            other => bail!("precision must be a float dtype, got {other:?}"),
        }
    }

    pub fn ckpt_dir(&self) -> PathBuf {
        self.exp_dir.join("checkpoints")
    }
}

impl TrainConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate().map_err(|e| anyhow!("invalid model config: {e}"))?;
        let t = &self.train;
        for (name, value) in [
            ("batch_size", t.batch_size),
            ("num_workers", t.num_workers),
            ("log_every", t.log_every),
            ("ckpt_every", t.ckpt_every),
            ("image_every", t.image_every),
            ("val_every", t.val_every),
            ("crop_len", t.crop_len),
        ] {
            if value == 0 {
                bail!("train.{name} must be positive")
            }
        }
        if !(t.learning_rate > 0.0) {
            bail!("train.learning_rate must be positive, got {}", t.learning_rate)
        }
        if t.kl_weight < 0.0 {
            bail!("train.kl_weight must not be negative")
        }
        t.dtype()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() -> Result<()> {
        let config: TrainConfig = serde_json::from_str(
            r#"{
                "train": { "exp_dir": "runs/a" },
                "dataset": { "train": { "path": "d/train" }, "val": { "path": "d/val" } }
            }"#,
        )?;
        config.validate()?;
        assert_eq!(config.model, AutoencoderConfig::mri());
        assert_eq!(config.train.seed, 231);
        assert_eq!(config.train.crop_len, 128);
        assert_eq!(config.train.crop_max_offset, 32);
        assert_eq!(config.train.val_crop_offset, 16);
        assert_eq!(config.train.dtype()?, DType::F32);
        assert_eq!(config.train.ckpt_dir(), PathBuf::from("runs/a/checkpoints"));
        Ok(())
    }

    #[test]
    fn test_rejects_zero_interval() -> Result<()> {
        let config: TrainConfig = serde_json::from_str(
            r#"{
                "train": { "exp_dir": "runs/a", "log_every": 0 },
                "dataset": { "train": { "path": "d" }, "val": { "path": "d" } }
            }"#,
        )?;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_every"));
        Ok(())
    }

    #[test]
    fn test_rejects_half_precision() -> Result<()> {
        for precision in ["bf16", "f16"] {
            let config: TrainConfig = serde_json::from_value(serde_json::json!({
                "train": { "exp_dir": "runs/a", "precision": precision },
                "dataset": { "train": { "path": "d" }, "val": { "path": "d" } }
            }))?;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("not supported"), "{err}");
        }
        let mut params = serde_json::from_str::<TrainParams>(r#"{ "exp_dir": "runs/a" }"#)?;
        params.precision = "f64".to_string();
        assert_eq!(params.dtype()?, DType::F64);
        Ok(())
    }

    #[test]
    fn test_rejects_integer_precision() -> Result<()> {
        let config: TrainConfig = serde_json::from_str(
            r#"{
                "train": { "exp_dir": "runs/a", "precision": "u8" },
                "dataset": { "train": { "path": "d" }, "val": { "path": "d" } }
            }"#,
        )?;
        assert!(config.validate().is_err());
        Ok(())
    }
}
