//! Resampling helpers for `[batch, channels, depth, height, width]` tensors.
use candle::{bail, Result, Tensor};

/// Repeats every element of `dim` `factor` times in place (`aabbcc` for `abc`).
fn repeat_interleave(xs: &Tensor, dim: usize, factor: usize) -> Result<Tensor> {
    let mut out_dims = xs.dims().to_vec();
    out_dims[dim] *= factor;
    let xs = xs.unsqueeze(dim + 1)?;
    let mut expanded = xs.dims().to_vec();
    expanded[dim + 1] = factor;
    xs.broadcast_as(expanded)?.reshape(out_dims)
}

/// Nearest-neighbour upsampling of the three spatial axes by an integer factor.
///
/// Equivalent to `F.interpolate(x, scale_factor=factor, mode="nearest")` on a
/// 5D tensor.
pub fn upsample_nearest3d(xs: &Tensor, factor: usize) -> Result<Tensor> {
    let _ = xs.dims5()?;
    if factor == 0 {
        bail!("upsample_nearest3d: scale factor must be positive")
    }
    if factor == 1 {
        return Ok(xs.clone());
    }
    let xs = repeat_interleave(xs, 2, factor)?;
    let xs = repeat_interleave(&xs, 3, factor)?;
    repeat_interleave(&xs, 4, factor)
}

/// Zero pads the end of each spatial axis by `amount`.
///
/// This is the `(0, 1, 0, 1, 0, 1)` constant pad that precedes a stride-2
/// convolution with no padding of its own.
pub fn pad_trailing3d(xs: &Tensor, amount: usize) -> Result<Tensor> {
    let _ = xs.dims5()?;
    if amount == 0 {
        return Ok(xs.clone());
    }
    xs.pad_with_zeros(2, 0, amount)?
        .pad_with_zeros(3, 0, amount)?
        .pad_with_zeros(4, 0, amount)
}
