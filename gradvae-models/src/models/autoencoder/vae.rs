//! 3D AutoencoderKL for volumetric images.
//!
//! ```text
//! Encoder: volume [B,1,D,H,W] -> [B,z,D/8,H/8,W/8] -> mu, log_var [B,e,D/8,H/8,W/8]
//! Decoder: latent [B,e,D/8,H/8,W/8] -> volume [B,1,D,H,W]
//! ```
//!
//! Both stacks are flat lists of blocks stored under `blocks.{i}`, so weights
//! exported from the reference PyTorch module load without renaming.

use candle::{Module, Result, Tensor};
use candle_nn::{GroupNorm, VarBuilder};
use gradvae_nn::{conv3d, Conv3d};

use super::blocks::{normalize, Downsample, ResBlock, Upsample, POINTWISE, SAME_PADDING};
use super::config::AutoencoderConfig;
use super::debug::debug_tensor;

#[derive(Debug, Clone)]
enum Block {
    Conv(Conv3d),
    Res(ResBlock),
    Down(Downsample),
    Up(Upsample),
    Norm(GroupNorm),
}

impl Module for Block {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Block::Conv(m) => m.forward(x),
            Block::Res(m) => m.forward(x),
            Block::Down(m) => m.forward(x),
            Block::Up(m) => m.forward(x),
            Block::Norm(m) => m.forward(x),
        }
    }
}

fn run_blocks(blocks: &[Block], x: &Tensor, stack: &str) -> Result<Tensor> {
    let mut x = x.clone();
    for (i, block) in blocks.iter().enumerate() {
        x = block.forward(&x)?;
        debug_tensor(&format!("{stack}.blocks.{i}"), &x);
    }
    Ok(x)
}

/// Downsampling residual stack mapping a volume to `z_channels` feature maps.
#[derive(Debug, Clone)]
pub struct Encoder {
    blocks: Vec<Block>,
    span: tracing::Span,
}

impl Encoder {
    pub fn new(config: &AutoencoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let vb = vb.pp("blocks");
        let mut blocks: Vec<Block> = Vec::new();
        blocks.push(Block::Conv(conv3d(
            config.in_channels,
            config.n_channels,
            3,
            SAME_PADDING,
            vb.pp(0),
        )?));

        // Level i widens from n_channels * ch_mult[i - 1] to n_channels * ch_mult[i].
        let num_levels = config.ch_mult.len();
        let mut block_in = config.n_channels;
        for i in 0..num_levels {
            let block_out = config.level_channels(i);
            for _ in 0..config.num_res_blocks {
                let idx = blocks.len();
                blocks.push(Block::Res(ResBlock::new(block_in, block_out, config, vb.pp(idx))?));
                block_in = block_out;
            }
            if i != num_levels - 1 {
                let idx = blocks.len();
                blocks.push(Block::Down(Downsample::new(block_in, vb.pp(idx))?));
            }
        }

        let idx = blocks.len();
        blocks.push(Block::Norm(normalize(block_in, config, vb.pp(idx))?));
        let idx = blocks.len();
        blocks.push(Block::Conv(conv3d(
            block_in,
            config.z_channels,
            3,
            SAME_PADDING,
            vb.pp(idx),
        )?));

        let span = tracing::span!(tracing::Level::TRACE, "encoder");
        Ok(Self { blocks, span })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl Module for Encoder {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        run_blocks(&self.blocks, x, "encoder")
    }
}

/// Upsampling residual stack mapping `z_channels` feature maps back to a volume.
#[derive(Debug, Clone)]
pub struct Decoder {
    blocks: Vec<Block>,
    span: tracing::Span,
}

impl Decoder {
    pub fn new(config: &AutoencoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let vb = vb.pp("blocks");
        let mut blocks: Vec<Block> = Vec::new();
        let num_levels = config.ch_mult.len();

        let mut block_in = config.level_channels(num_levels - 1);
        blocks.push(Block::Conv(conv3d(
            config.z_channels,
            block_in,
            3,
            SAME_PADDING,
            vb.pp(blocks.len()),
        )?));

        for i in (0..num_levels).rev() {
            let block_out = config.level_channels(i);
            for _ in 0..config.num_res_blocks {
                let idx = blocks.len();
                blocks.push(Block::Res(ResBlock::new(block_in, block_out, config, vb.pp(idx))?));
                block_in = block_out;
            }
            if i != 0 {
                let idx = blocks.len();
                blocks.push(Block::Up(Upsample::new(block_in, vb.pp(idx))?));
            }
        }

        let idx = blocks.len();
        blocks.push(Block::Norm(normalize(block_in, config, vb.pp(idx))?));
        let idx = blocks.len();
        blocks.push(Block::Conv(conv3d(
            block_in,
            config.out_channels,
            3,
            SAME_PADDING,
            vb.pp(idx),
        )?));

        let span = tracing::span!(tracing::Level::TRACE, "decoder");
        Ok(Self { blocks, span })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl Module for Decoder {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        run_blocks(&self.blocks, x, "decoder")
    }
}

/// Diagonal Gaussian over the latent space.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian {
    mean: Tensor,
    log_var: Tensor,
    std: Tensor,
}

impl DiagonalGaussian {
    /// Builds the distribution from the mean and log-variance heads.
    ///
    /// The log-variance is clamped to `[-30, 20]` before exponentiation.
    pub fn new(mean: Tensor, log_var: &Tensor) -> Result<Self> {
        let log_var = log_var.clamp(-30f32, 20f32)?;
        let std = (&log_var * 0.5)?.exp()?;
        Ok(Self { mean, log_var, std })
    }

    /// Draws `mean + std * eps` with `eps ~ N(0, 1)` (reparameterisation trick).
    pub fn sample(&self) -> Result<Tensor> {
        AutoencoderKL::sampling(&self.mean, &self.std)
    }

    pub fn mode(&self) -> &Tensor {
        &self.mean
    }

    pub fn std(&self) -> &Tensor {
        &self.std
    }

    pub fn log_var(&self) -> &Tensor {
        &self.log_var
    }

    /// KL divergence to `N(0, I)`, summed over latent voxels and averaged over the batch.
    pub fn kl(&self) -> Result<Tensor> {
        let b = self.mean.dim(0)?;
        let var = self.log_var.exp()?;
        let kl = ((self.mean.sqr()? + var)? - 1.0)?;
        let kl = (kl - &self.log_var)?;
        kl.sum_all()? * (0.5 / b as f64)
    }
}

/// Volumetric AutoencoderKL: encoder, Gaussian latent heads and decoder.
#[derive(Debug, Clone)]
pub struct AutoencoderKL {
    encoder: Encoder,
    decoder: Decoder,
    quant_conv_mu: Conv3d,
    quant_conv_log_sigma: Conv3d,
    post_quant_conv: Conv3d,
    config: AutoencoderConfig,
}

impl AutoencoderKL {
    pub fn new(config: &AutoencoderConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        let quant_conv_mu = conv3d(
            config.z_channels,
            config.embed_dim,
            1,
            POINTWISE,
            vb.pp("quant_conv_mu"),
        )?;
        let quant_conv_log_sigma = conv3d(
            config.z_channels,
            config.embed_dim,
            1,
            POINTWISE,
            vb.pp("quant_conv_log_sigma"),
        )?;
        let post_quant_conv = conv3d(
            config.embed_dim,
            config.z_channels,
            1,
            POINTWISE,
            vb.pp("post_quant_conv"),
        )?;
        Ok(Self {
            encoder,
            decoder,
            quant_conv_mu,
            quant_conv_log_sigma,
            post_quant_conv,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &AutoencoderConfig {
        &self.config
    }

    /// Encodes a `[B, C, D, H, W]` volume to the latent mean.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.encoder.forward(x)?;
        self.quant_conv_mu.forward(&h)
    }

    /// Encodes a volume to the full latent distribution.
    pub fn encode_distribution(&self, x: &Tensor) -> Result<DiagonalGaussian> {
        let h = self.encoder.forward(x)?;
        let mu = self.quant_conv_mu.forward(&h)?;
        let log_var = self.quant_conv_log_sigma.forward(&h)?;
        DiagonalGaussian::new(mu, &log_var)
    }

    /// `z_mu + eps * z_sigma` with `eps` drawn from a standard normal.
    pub fn sampling(z_mu: &Tensor, z_sigma: &Tensor) -> Result<Tensor> {
        let eps = z_sigma.randn_like(0., 1.)?;
        z_mu + eps.mul(z_sigma)?
    }

    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        let z = self.post_quant_conv.forward(z)?;
        self.decoder.forward(&z)
    }

    /// Decodes latents produced by a latent diffusion model.
    pub fn reconstruct_ldm_outputs(&self, z: &Tensor) -> Result<Tensor> {
        self.decode(z)
    }

    /// Full pass returning the reconstruction and the posterior.
    ///
    /// With `sample_posterior` the decoder sees a reparameterised sample,
    /// otherwise it decodes the mean.
    pub fn forward(&self, x: &Tensor, sample_posterior: bool) -> Result<(Tensor, DiagonalGaussian)> {
        let posterior = self.encode_distribution(x)?;
        let z = if sample_posterior {
            posterior.sample()?
        } else {
            posterior.mode().clone()
        };
        let recon = self.decode(&z)?;
        Ok((recon, posterior))
    }
}

/// Encoder half of [`AutoencoderKL`], loadable from the same weights.
#[derive(Debug, Clone)]
pub struct EncoderOnly {
    encoder: Encoder,
    quant_conv_mu: Conv3d,
}

impl EncoderOnly {
    pub fn new(config: &AutoencoderConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let quant_conv_mu = conv3d(
            config.z_channels,
            config.embed_dim,
            1,
            POINTWISE,
            vb.pp("quant_conv_mu"),
        )?;
        Ok(Self {
            encoder,
            quant_conv_mu,
        })
    }

    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.encoder.forward(x)?;
        self.quant_conv_mu.forward(&h)
    }
}

/// Decoder half of [`AutoencoderKL`], loadable from the same weights.
#[derive(Debug, Clone)]
pub struct DecoderOnly {
    decoder: Decoder,
    post_quant_conv: Conv3d,
}

impl DecoderOnly {
    pub fn new(config: &AutoencoderConfig, vb: VarBuilder) -> Result<Self> {
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        let post_quant_conv = conv3d(
            config.embed_dim,
            config.z_channels,
            1,
            POINTWISE,
            vb.pp("post_quant_conv"),
        )?;
        Ok(Self {
            decoder,
            post_quant_conv,
        })
    }

    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        let z = self.post_quant_conv.forward(z)?;
        self.decoder.forward(&z)
    }

    pub fn reconstruct_ldm_outputs(&self, z: &Tensor) -> Result<Tensor> {
        self.decode(z)
    }
}
