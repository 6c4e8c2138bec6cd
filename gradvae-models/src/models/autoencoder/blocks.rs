//! Residual and resampling blocks shared by the encoder and decoder.

use candle::{Module, Result, Tensor};
use candle_nn::{GroupNorm, VarBuilder};
use gradvae_nn::{conv3d, pad_trailing3d, upsample_nearest3d, Conv3d, Conv3dConfig};

use super::config::AutoencoderConfig;

pub(crate) const SAME_PADDING: Conv3dConfig = Conv3dConfig {
    padding: 1,
    stride: 1,
    dilation: 1,
    groups: 1,
};

pub(crate) const POINTWISE: Conv3dConfig = Conv3dConfig {
    padding: 0,
    stride: 1,
    dilation: 1,
    groups: 1,
};

const STRIDED: Conv3dConfig = Conv3dConfig {
    padding: 0,
    stride: 2,
    dilation: 1,
    groups: 1,
};

/// Affine GroupNorm with the configured group count and epsilon.
pub(crate) fn normalize(channels: usize, config: &AutoencoderConfig, vb: VarBuilder) -> Result<GroupNorm> {
    candle_nn::group_norm(config.norm_num_groups, channels, config.norm_eps, vb)
}

/// Pre-activation residual block: `x + conv2(silu(norm2(conv1(silu(norm1(x))))))`.
///
/// A 1x1x1 `nin_shortcut` projects the skip path when the channel count changes.
#[derive(Debug, Clone)]
pub struct ResBlock {
    norm1: GroupNorm,
    conv1: Conv3d,
    norm2: GroupNorm,
    conv2: Conv3d,
    nin_shortcut: Option<Conv3d>,
    span: tracing::Span,
}

impl ResBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        config: &AutoencoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm1 = normalize(in_channels, config, vb.pp("norm1"))?;
        let conv1 = conv3d(in_channels, out_channels, 3, SAME_PADDING, vb.pp("conv1"))?;
        let norm2 = normalize(out_channels, config, vb.pp("norm2"))?;
        let conv2 = conv3d(out_channels, out_channels, 3, SAME_PADDING, vb.pp("conv2"))?;
        let nin_shortcut = if in_channels != out_channels {
            Some(conv3d(in_channels, out_channels, 1, POINTWISE, vb.pp("nin_shortcut"))?)
        } else {
            None
        };
        let span = tracing::span!(tracing::Level::TRACE, "res-block");
        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            nin_shortcut,
            span,
        })
    }
}

impl Module for ResBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let h = self.norm1.forward(x)?.silu()?;
        let h = self.conv1.forward(&h)?;
        let h = self.norm2.forward(&h)?.silu()?;
        let h = self.conv2.forward(&h)?;
        let x = match &self.nin_shortcut {
            Some(shortcut) => shortcut.forward(x)?,
            None => x.clone(),
        };
        x + h
    }
}

/// Halves every spatial axis: trailing zero pad of one voxel, then a k3 s2 convolution.
#[derive(Debug, Clone)]
pub struct Downsample {
    conv: Conv3d,
}

impl Downsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv = conv3d(channels, channels, 3, STRIDED, vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for Downsample {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = pad_trailing3d(x, 1)?;
        self.conv.forward(&x)
    }
}

/// Doubles every spatial axis with nearest interpolation, then a k3 convolution.
#[derive(Debug, Clone)]
pub struct Upsample {
    conv: Conv3d,
}

impl Upsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let conv = conv3d(channels, channels, 3, SAME_PADDING, vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl Module for Upsample {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = upsample_nearest3d(x, 2)?;
        self.conv.forward(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> AutoencoderConfig {
        AutoencoderConfig {
            n_channels: 4,
            norm_num_groups: 2,
            ..AutoencoderConfig::mri()
        }
    }

    #[test]
    fn test_res_block_shapes_and_shortcut() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let config = tiny_config();

        let same = ResBlock::new(4, 4, &config, vb.pp("same"))?;
        let widen = ResBlock::new(4, 8, &config, vb.pp("widen"))?;
        let x = Tensor::randn(0f32, 1., (1, 4, 4, 4, 4), &dev)?;
        assert_eq!(same.forward(&x)?.dims(), [1, 4, 4, 4, 4]);
        assert_eq!(widen.forward(&x)?.dims(), [1, 8, 4, 4, 4]);

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("widen.nin_shortcut.weight"));
        assert!(!data.contains_key("same.nin_shortcut.weight"));
        assert!(data.contains_key("same.norm1.weight"));
        assert!(data.contains_key("same.conv2.bias"));
        Ok(())
    }

    #[test]
    fn test_resampling_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let down = Downsample::new(2, vb.pp("down"))?;
        let up = Upsample::new(2, vb.pp("up"))?;
        let x = Tensor::randn(0f32, 1., (1, 2, 8, 6, 4), &dev)?;
        let y = down.forward(&x)?;
        assert_eq!(y.dims(), [1, 2, 4, 3, 2]);
        assert_eq!(up.forward(&y)?.dims(), [1, 2, 8, 6, 4]);
        Ok(())
    }
}
