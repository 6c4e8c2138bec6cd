//! Volumetric building blocks for candle.
//!
//! candle ships 1D and 2D convolutions with autograd support. This crate adds
//! what a 3D autoencoder needs on top of them:
//!
//! - [`conv`]: a differentiable 3D convolution expressed as a sum of 2D
//!   convolutions over the depth taps of the kernel, plus a [`Conv3d`] module.
//! - [`ops`]: nearest-neighbour 3D upsampling and the trailing zero padding
//!   used before strided downsampling convolutions.
//! - [`optim`]: AdamW whose moment estimates can be saved and restored, so
//!   that training can resume from a checkpoint.

pub mod conv;
pub mod ops;
pub mod optim;

pub use conv::{conv3d, conv3d_no_bias, Conv3d, Conv3dConfig};
pub use ops::{pad_trailing3d, upsample_nearest3d};
pub use optim::{AdamW, ParamsAdamW};
