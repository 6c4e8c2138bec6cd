//! gradvae: train and run the volumetric AutoencoderKL.
//!
//! # Usage
//!
//! ```bash
//! # Train from a JSON experiment config
//! cargo run --release -p gradvae-train -- train --config configs/gradvae.json
//!
//! # Reconstruct one volume with trained weights
//! cargo run --release -p gradvae-train -- reconstruct \
//!     --weights runs/gradvae/checkpoints/0100000_gradvae.safetensors \
//!     --input subject.npy --output subject_recon.npy
//!
//! # Encode volumes to latents for a diffusion model, and decode them back
//! cargo run --release -p gradvae-train -- encode --weights w.safetensors --output-dir latents a.npy b.npy
//! cargo run --release -p gradvae-train -- decode --weights w.safetensors --input latents/a_latent.npy --output a.npy
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use clap::{Parser, Subcommand};
use gradvae_models::models::autoencoder::{AutoencoderConfig, AutoencoderKL, DecoderOnly, EncoderOnly};
use gradvae_train::checkpoint::{strip_prefix, WRAPPED_PREFIX};
use gradvae_train::common::{save_image, setup_device, setup_tracing, to_pixels};
use gradvae_train::data::{read_volume, to_channels_first, NpyVolumeDataset};
use gradvae_train::metrics::{psnr, slice_grids};
use gradvae_train::{TrainConfig, Trainer};

#[derive(Parser)]
#[command(
    name = "gradvae",
    about = "Volumetric AutoencoderKL for MRI volumes",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run on CPU instead of GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Enable Chrome tracing profiler.
    #[arg(long, global = true)]
    tracing: bool,

    /// Random seed; overrides `train.seed` when training.
    #[arg(long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Train the autoencoder.
    Train {
        /// JSON experiment config.
        #[arg(long)]
        config: PathBuf,

        /// Resume from this checkpoint step (0 picks the latest).
        #[arg(long)]
        resume_from: Option<usize>,
    },

    /// Encode and decode one `.npy` volume.
    Reconstruct {
        /// Model weights (safetensors).
        #[arg(long)]
        weights: PathBuf,

        /// Model config JSON; defaults to the MRI configuration.
        #[arg(long)]
        model_config: Option<PathBuf>,

        /// Channels-last `.npy` volume.
        #[arg(long)]
        input: PathBuf,

        /// Output `.npy`; middle slice grids are written next to it.
        #[arg(long, default_value = "reconstruction.npy")]
        output: PathBuf,
    },

    /// Encode `.npy` volumes (or every volume of a folder) to latent means.
    Encode {
        #[arg(long)]
        weights: PathBuf,

        #[arg(long)]
        model_config: Option<PathBuf>,

        /// Folder receiving `<name>_latent.npy` files.
        #[arg(long, default_value = "latents")]
        output_dir: PathBuf,

        /// Volumes or folders of volumes.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Decode a latent `.npy` of shape `(embed_dim, d, h, w)` to a volume.
    Decode {
        #[arg(long)]
        weights: PathBuf,

        #[arg(long)]
        model_config: Option<PathBuf>,

        #[arg(long)]
        input: PathBuf,

        #[arg(long, default_value = "decoded.npy")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_tracing(cli.tracing);

    match cli.command {
        Command::Train { config, resume_from } => {
            let mut config = TrainConfig::load(&config)?;
            if let Some(seed) = cli.seed {
                config.train.seed = seed;
            }
            if resume_from.is_some() {
                config.train.resume_from = resume_from;
            }
            let device = setup_device(cli.cpu, Some(config.train.seed))?;
            let mut trainer = Trainer::from_config(config, &device)?;
            let summary = trainer.train()?;
            tracing::info!(
                "finished at step {} after {} epochs, last loss {:?}, last validation {:?}",
                summary.global_step,
                summary.epochs,
                summary.last_loss,
                summary.last_val
            );
        }
        Command::Reconstruct {
            weights,
            model_config,
            input,
            output,
        } => {
            let device = setup_device(cli.cpu, cli.seed)?;
            let config = load_model_config(model_config.as_deref())?;
            let vb = load_weights(&weights, &device)?;
            let model = AutoencoderKL::new(&config, vb)?;

            let x = to_channels_first(&read_volume(&input)?.unsqueeze(0)?)?.to_device(&device)?;
            let z = model.encode(&x)?;
            let pred = model.decode(&z)?;
            if pred.dims() == x.dims() {
                println!("psnr: {:.3} dB", psnr(&pred, &x, 0)?);
            } else {
                tracing::warn!("reconstruction shape {:?} differs from input {:?}", pred.dims(), x.dims());
            }
            write_volume(&pred, &output)?;
            if pred.dims() == x.dims() {
                for (axis, grid) in ["x", "y", "z"].iter().zip(slice_grids(&pred, &x)?.iter()) {
                    let path = output.with_extension(format!("{axis}.png"));
                    save_image(&to_pixels(grid)?, &path)?;
                }
            }
            println!("reconstruction saved to {}", output.display());
        }
        Command::Encode {
            weights,
            model_config,
            output_dir,
            inputs,
        } => {
            let device = setup_device(cli.cpu, cli.seed)?;
            let config = load_model_config(model_config.as_deref())?;
            let vb = load_weights(&weights, &device)?;
            let encoder = EncoderOnly::new(&config, vb)?;
            std::fs::create_dir_all(&output_dir)?;

            let mut files = Vec::new();
            for input in inputs {
                if input.is_dir() {
                    files.extend(NpyVolumeDataset::new(&input)?.files().iter().cloned());
                } else {
                    files.push(input);
                }
            }
            for file in files {
                let x = to_channels_first(&read_volume(&file)?.unsqueeze(0)?)?.to_device(&device)?;
                let z = encoder.encode(&x)?.squeeze(0)?.to_device(&Device::Cpu)?;
                let stem = match file.file_stem().and_then(|s| s.to_str()) {
                    Some(stem) => stem.to_string(),
                    None => bail!("cannot name the latent of {}", file.display()),
                };
                let path = output_dir.join(format!("{stem}_latent.npy"));
                z.write_npy(&path)?;
                println!("{} -> {} {:?}", file.display(), path.display(), z.dims());
            }
        }
        Command::Decode {
            weights,
            model_config,
            input,
            output,
        } => {
            let device = setup_device(cli.cpu, cli.seed)?;
            let config = load_model_config(model_config.as_deref())?;
            let vb = load_weights(&weights, &device)?;
            let decoder = DecoderOnly::new(&config, vb)?;

            let z = Tensor::read_npy(&input)
                .with_context(|| format!("failed to read latent {}", input.display()))?;
            if z.rank() != 4 || z.dim(0)? != config.embed_dim {
                bail!("expected a latent of shape ({}, d, h, w), got {:?}", config.embed_dim, z.shape())
            }
            let z = z.to_dtype(DType::F32)?.unsqueeze(0)?.to_device(&device)?;
            let volume = decoder.reconstruct_ldm_outputs(&z)?;
            write_volume(&volume, &output)?;
            println!("decoded volume saved to {}", output.display());
        }
    }
    Ok(())
}

fn load_model_config(path: Option<&Path>) -> Result<AutoencoderConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)?
        }
        None => AutoencoderConfig::mri(),
    };
    config.validate()?;
    Ok(config)
}

/// Weights for inference; a wrapper `vae.` prefix is dropped.
fn load_weights(path: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let tensors = candle::safetensors::load(path, device)
        .with_context(|| format!("failed to read weights {}", path.display()))?;
    let tensors = strip_prefix(tensors, WRAPPED_PREFIX);
    Ok(VarBuilder::from_tensors(tensors, DType::F32, device))
}

/// Writes a `(1, C, H, W, Z)` batch as a channels-last `(H, W, Z, C)` `.npy`.
fn write_volume(x: &Tensor, path: &Path) -> Result<()> {
    let volume = x
        .squeeze(0)?
        .permute((1, 2, 3, 0))?
        .contiguous()?
        .to_device(&Device::Cpu)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    volume.write_npy(path)?;
    Ok(())
}
