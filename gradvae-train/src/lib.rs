//! Training pipeline for the volumetric AutoencoderKL.
//!
//! - [`config`]: JSON experiment configuration
//! - [`data`]: volume datasets and the batching loader
//! - [`metrics`]: MSE / PSNR and slice visualisations
//! - [`summary`]: scalar and image summaries written to the experiment folder
//! - [`checkpoint`]: weights, optimizer state and resumption
//! - [`trainer`]: the optimisation loop
//! - [`common`]: device and tracing setup shared by the CLI subcommands

pub mod checkpoint;
pub mod common;
pub mod config;
pub mod data;
pub mod metrics;
pub mod summary;
pub mod trainer;

pub use config::{DatasetConfig, TrainConfig, TrainParams};
pub use trainer::{TrainSummary, Trainer};
