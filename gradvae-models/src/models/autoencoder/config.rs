//! Configuration for the 3D AutoencoderKL.

use candle::{bail, Result};
use serde::{Deserialize, Serialize};

/// Hyper-parameters of the encoder/decoder stacks and the latent heads.
///
/// Defaults reproduce the volumetric autoencoder used for 1-channel MRI
/// volumes: 64 base channels, multipliers `[1, 2, 2, 2]` (three 2x
/// downsampling stages) and a 3-channel latent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoencoderConfig {
    /// Channels of the input volume (default: 1).
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Channels of the reconstructed volume (default: 1).
    #[serde(default = "default_in_channels")]
    pub out_channels: usize,

    /// Base channel width multiplied by `ch_mult` at each level (default: 64).
    #[serde(default = "default_n_channels")]
    pub n_channels: usize,

    /// Channels produced by the encoder stack before the latent heads (default: 3).
    #[serde(default = "default_z_channels")]
    pub z_channels: usize,

    /// Channels of the latent tensor (default: 3).
    #[serde(default = "default_z_channels")]
    pub embed_dim: usize,

    /// Channel multipliers per resolution level (default: [1, 2, 2, 2]).
    #[serde(default = "default_ch_mult")]
    pub ch_mult: Vec<usize>,

    /// Residual blocks per resolution level (default: 2).
    #[serde(default = "default_num_res_blocks")]
    pub num_res_blocks: usize,

    /// Groups used by every GroupNorm (default: 32).
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,

    /// GroupNorm epsilon (default: 1e-6).
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
}

fn default_in_channels() -> usize {
    1
}
fn default_n_channels() -> usize {
    64
}
fn default_z_channels() -> usize {
    3
}
fn default_ch_mult() -> Vec<usize> {
    vec![1, 2, 2, 2]
}
fn default_num_res_blocks() -> usize {
    2
}
fn default_norm_num_groups() -> usize {
    32
}
fn default_norm_eps() -> f64 {
    1e-6
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self::mri()
    }
}

impl AutoencoderConfig {
    /// Configuration of the MRI volume autoencoder.
    pub fn mri() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            n_channels: 64,
            z_channels: 3,
            embed_dim: 3,
            ch_mult: vec![1, 2, 2, 2],
            num_res_blocks: 2,
            norm_num_groups: 32,
            norm_eps: 1e-6,
        }
    }

    /// Number of 2x downsampling stages in the encoder.
    pub fn num_downsamples(&self) -> usize {
        self.ch_mult.len().saturating_sub(1)
    }

    /// Spatial compression per axis (8 for the default configuration).
    pub fn compression_ratio(&self) -> usize {
        1 << self.num_downsamples()
    }

    /// Latent shape `(embed_dim, d, h, w)` for an input volume of `(d, h, w)` voxels.
    ///
    /// Each stage pads by one voxel and applies a k3 s2 convolution, so an axis of
    /// length `n` becomes `(n - 2) / 2 + 1`.
    pub fn latent_shape(&self, d: usize, h: usize, w: usize) -> (usize, usize, usize, usize) {
        let down = |mut n: usize| {
            for _ in 0..self.num_downsamples() {
                n = n.saturating_sub(2) / 2 + 1;
            }
            n
        };
        (self.embed_dim, down(d), down(h), down(w))
    }

    /// Channel width at resolution level `i`.
    pub fn level_channels(&self, i: usize) -> usize {
        self.n_channels * self.ch_mult[i]
    }

    pub fn validate(&self) -> Result<()> {
        if self.ch_mult.is_empty() {
            bail!("ch_mult must have at least one level")
        }
        if self.in_channels == 0
            || self.out_channels == 0
            || self.n_channels == 0
            || self.z_channels == 0
            || self.embed_dim == 0
        {
            bail!("channel counts must be positive: {self:?}")
        }
        if self.norm_num_groups == 0 {
            bail!("norm_num_groups must be positive")
        }
        for (i, &m) in self.ch_mult.iter().enumerate() {
            let ch = self.n_channels * m;
            if ch == 0 || ch % self.norm_num_groups != 0 {
                bail!(
                    "level {i} has {ch} channels, which is not a positive multiple of {} norm groups",
                    self.norm_num_groups
                )
            }
        }
        Ok(())
    }
}
