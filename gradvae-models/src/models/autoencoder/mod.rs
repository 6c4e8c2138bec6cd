//! Volumetric AutoencoderKL for MRI-like volumes.
//!
//! The model compresses a `[B, 1, D, H, W]` volume into a small Gaussian latent
//! that a latent-diffusion model can be trained on, and decodes latents back to
//! voxel space.
//!
//! # Architecture
//!
//! ```text
//!   volume ─▶ conv_in ─▶ [ResBlock × n ─▶ Downsample] × (L-1) ─▶ ResBlock × n
//!          ─▶ GroupNorm ─▶ conv_out ─▶ quant_conv_mu / quant_conv_log_sigma
//!                                            │
//!                                      latent (mu, sigma)
//!                                            │
//!   volume ◀─ conv_out ◀─ GroupNorm ◀─ [ResBlock × n ◀─ Upsample] × (L-1)
//!          ◀─ ResBlock × n ◀─ conv_in ◀─ post_quant_conv
//! ```
//!
//! Residual blocks use GroupNorm + SiLU before each 3x3x3 convolution.
//! Downsampling pads one voxel at the end of every axis and applies a stride-2
//! convolution; upsampling is nearest-neighbour followed by a convolution.

pub mod blocks;
pub mod config;
pub mod debug;
pub mod vae;

pub use blocks::{Downsample, ResBlock, Upsample};
pub use config::AutoencoderConfig;
pub use vae::{AutoencoderKL, Decoder, DecoderOnly, DiagonalGaussian, Encoder, EncoderOnly};
