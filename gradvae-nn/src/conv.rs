//! 3D convolution layers.
//!
//! The convolution is computed as `sum_k conv2d(slab_k, kernel[:, :, k])` where
//! `slab_k` gathers, for every output depth index, the input depth slice that
//! kernel tap `k` lands on. Depth is folded into the batch axis so each tap is a
//! single `conv2d` call, and the whole computation stays on candle's autograd
//! graph.
use candle::{bail, Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv3dConfig {
    pub padding: usize,
    pub stride: usize,
    pub dilation: usize,
    pub groups: usize,
}

impl Default for Conv3dConfig {
    fn default() -> Self {
        Self {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
        }
    }
}

impl Conv3dConfig {
    /// Output extent along one axis for an input of size `len` and a kernel of size `k`.
    pub fn out_dim(&self, len: usize, k: usize) -> Option<usize> {
        if k == 0 || self.stride == 0 {
            return None;
        }
        let padded = len + 2 * self.padding;
        let extent = self.dilation * (k - 1) + 1;
        if padded < extent {
            None
        } else {
            Some((padded - extent) / self.stride + 1)
        }
    }
}

/// Gathers `len` depth slices starting at `start` with the given step.
fn depth_slab(xs: &Tensor, start: usize, len: usize, step: usize) -> Result<Tensor> {
    if step == 1 {
        return xs.narrow(2, start, len);
    }
    let idx: Vec<u32> = (0..len).map(|i| (start + i * step) as u32).collect();
    let idx = Tensor::new(idx.as_slice(), xs.device())?;
    xs.index_select(&idx, 2)
}

/// Applies a 3D convolution over a `[batch, c_in, depth, height, width]` input.
///
/// The kernel has shape `[c_out, c_in / groups, k_d, k_h, k_w]`. Padding, stride
/// and dilation are shared by the three spatial axes.
pub fn conv3d_forward(xs: &Tensor, kernel: &Tensor, cfg: &Conv3dConfig) -> Result<Tensor> {
    let (b_size, c_in, i_d, i_h, i_w) = xs.dims5()?;
    let (c_out, c_in_k, k_d, k_h, k_w) = kernel.dims5()?;
    if cfg.groups == 0 || cfg.stride == 0 || cfg.dilation == 0 {
        bail!("conv3d: groups, stride and dilation must be positive, got {cfg:?}")
    }
    if c_in != c_in_k * cfg.groups {
        bail!(
            "conv3d: the number of in-channels on the input ({c_in}) doesn't match the kernel ({c_in_k} x {} groups)",
            cfg.groups
        )
    }
    let mut out = [0usize; 3];
    for (o, (axis, len, k)) in out
        .iter_mut()
        .zip([("depth", i_d, k_d), ("height", i_h, k_h), ("width", i_w, k_w)])
    {
        *o = match cfg.out_dim(len, k) {
            Some(o) => o,
            None => bail!(
                "conv3d: {axis} {len} with padding {} is smaller than the kernel extent {k}",
                cfg.padding
            ),
        };
    }
    let [d_out, o_h, o_w] = out;

    // conv2d must see an exact fit: its backward derives the output padding
    // from the height axis only.
    let mut xs = xs.clone();
    for axis in 2..5 {
        if cfg.padding > 0 {
            xs = xs.pad_with_zeros(axis, cfg.padding, cfg.padding)?;
        }
    }
    let used = |o: usize, k: usize| (o - 1) * cfg.stride + cfg.dilation * (k - 1) + 1;
    let xs = xs.narrow(3, 0, used(o_h, k_h))?.narrow(4, 0, used(o_w, k_w))?;

    let mut acc: Option<Tensor> = None;
    for tap in 0..k_d {
        let slab = depth_slab(&xs, tap * cfg.dilation, d_out, cfg.stride)?;
        let (_, _, _, h, w) = slab.dims5()?;
        let slab = slab
            .permute((0, 2, 1, 3, 4))?
            .reshape((b_size * d_out, c_in, h, w))?;
        let k = kernel.narrow(2, tap, 1)?.squeeze(2)?.contiguous()?;
        let ys = slab.conv2d(&k, 0, cfg.stride, cfg.dilation, cfg.groups)?;
        acc = Some(match acc {
            None => ys,
            Some(acc) => (acc + ys)?,
        });
    }
    let ys = match acc {
        Some(ys) => ys,
        None => bail!("conv3d: empty kernel depth"),
    };
    ys.reshape((b_size, d_out, c_out, o_h, o_w))?
        .permute((0, 2, 1, 3, 4))?
        .contiguous()
}

#[derive(Clone, Debug)]
pub struct Conv3d {
    weight: Tensor,
    bias: Option<Tensor>,
    config: Conv3dConfig,
    span: tracing::Span,
}

impl Conv3d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: Conv3dConfig) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "conv3d");
        Self {
            weight,
            bias,
            config,
            span,
        }
    }

    pub fn config(&self) -> &Conv3dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl Module for Conv3d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = conv3d_forward(x, &self.weight, &self.config)?;
        match &self.bias {
            None => Ok(x),
            Some(bias) => {
                let b = bias.dims1()?;
                let bias = bias.reshape((1, b, 1, 1, 1))?;
                x.broadcast_add(&bias)
            }
        }
    }
}

fn conv3d_weight(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: &Conv3dConfig,
    vb: &VarBuilder,
) -> Result<Tensor> {
    let init_ws = candle_nn::init::DEFAULT_KAIMING_NORMAL;
    vb.get_with_hints(
        (
            out_channels,
            in_channels / cfg.groups,
            kernel_size,
            kernel_size,
            kernel_size,
        ),
        "weight",
        init_ws,
    )
}

/// Builds a [`Conv3d`] with a cubic kernel, loading or initialising `weight` and `bias`.
pub fn conv3d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv3dConfig,
    vb: VarBuilder,
) -> Result<Conv3d> {
    let ws = conv3d_weight(in_channels, out_channels, kernel_size, &cfg, &vb)?;
    let fan_in = (in_channels / cfg.groups) * kernel_size * kernel_size * kernel_size;
    let bound = 1. / (fan_in as f64).sqrt();
    let init_bs = Init::Uniform {
        lo: -bound,
        up: bound,
    };
    let bs = vb.get_with_hints(out_channels, "bias", init_bs)?;
    Ok(Conv3d::new(ws, Some(bs), cfg))
}

pub fn conv3d_no_bias(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv3dConfig,
    vb: VarBuilder,
) -> Result<Conv3d> {
    let ws = conv3d_weight(in_channels, out_channels, kernel_size, &cfg, &vb)?;
    Ok(Conv3d::new(ws, None, cfg))
}
