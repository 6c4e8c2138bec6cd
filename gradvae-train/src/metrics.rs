//! Reconstruction metrics and slice visualisations.

use anyhow::{bail, Result};
use candle::{DType, Device, Tensor};

/// Mean squared error over every element.
pub fn mse(a: &Tensor, b: &Tensor) -> Result<f64> {
    if a.shape() != b.shape() {
        bail!("shape mismatch: {:?} vs {:?}", a.shape(), b.shape())
    }
    let a = a.to_dtype(DType::F64)?;
    let b = b.to_dtype(DType::F64)?;
    Ok((a - b)?.sqr()?.mean_all()?.to_scalar::<f64>()?)
}

/// Peak signal-to-noise ratio for signals with unit peak, in f64.
///
/// `crop_border` voxels are dropped on both ends of axes 2 and 3. The squared
/// error is averaged over axes 1, 2 and 3, so a 5-D `(B, C, H, W, Z)` input
/// yields one value per `(b, z)`; the result is the mean of those values.
pub fn psnr(pred: &Tensor, gt: &Tensor, crop_border: usize) -> Result<f64> {
    if pred.shape() != gt.shape() {
        bail!("image shapes are different: {:?}, {:?}", pred.shape(), gt.shape())
    }
    if pred.rank() < 4 {
        bail!("psnr expects at least (N, C, H, W), got {:?}", pred.shape())
    }
    let (mut pred, mut gt) = (pred.clone(), gt.clone());
    if crop_border != 0 {
        for axis in [2, 3] {
            let size = pred.dim(axis)?;
            if size <= 2 * crop_border {
                bail!("crop_border {crop_border} leaves nothing of axis {axis} (size {size})")
            }
            pred = pred.narrow(axis, crop_border, size - 2 * crop_border)?;
            gt = gt.narrow(axis, crop_border, size - 2 * crop_border)?;
        }
    }
    let pred = pred.to_dtype(DType::F64)?;
    let gt = gt.to_dtype(DType::F64)?;
    let err = (pred - gt)?.sqr()?.mean((1, 2, 3))?;
    let err = err.flatten_all()?.to_vec1::<f64>()?;
    let total: f64 = err
        .iter()
        .map(|mse| 10. * (1. / (mse + 1e-8)).log10())
        .sum();
    Ok(total / err.len() as f64)
}

/// Middle slice of a `(D, H, W)` volume along each axis.
pub fn middle_slices(volume: &Tensor) -> Result<[Tensor; 3]> {
    if volume.rank() != 3 {
        bail!("expected a (D, H, W) volume, got {:?}", volume.shape())
    }
    let slice = |axis: usize| -> Result<Tensor> {
        let mid = volume.dim(axis)? / 2;
        Ok(volume.narrow(axis, mid, 1)?.squeeze(axis)?)
    };
    Ok([slice(0)?, slice(1)?, slice(2)?])
}

/// Tiles images into a grid of `nrow` columns separated by `padding` pixels of
/// -1, which render black on the `[-1, 1]` image scale.
///
/// Tiles are `(H, W)`, `(1, H, W)` or `(3, H, W)` and must share a shape;
/// single channel tiles are repeated to RGB. A lone tile is returned as is.
/// The result is a `(3, rows, cols)` f32 tensor on the CPU.
pub fn make_grid(tiles: &[Tensor], nrow: usize, padding: usize) -> Result<Tensor> {
    let first = match tiles.first() {
        Some(t) => t,
        None => bail!("make_grid needs at least one tile"),
    };
    let rgb = tiles
        .iter()
        .map(|t| {
            if t.shape() != first.shape() {
                bail!("tile shapes differ: {:?} vs {:?}", t.shape(), first.shape())
            }
            let t = t.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
            let t = match t.rank() {
                2 => t.unsqueeze(0)?,
                3 => t,
                _ => bail!("expected a (C, H, W) tile, got {:?}", t.shape()),
            };
            match t.dim(0)? {
                1 => Ok(t.repeat((3, 1, 1))?),
                3 => Ok(t),
                c => bail!("tiles must have 1 or 3 channels, got {c}"),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    if rgb.len() == 1 {
        return Ok(rgb[0].clone());
    }

    let (_, h, w) = rgb[0].dims3()?;
    let ncols = nrow.max(1).min(rgb.len());
    let nrows = rgb.len().div_ceil(ncols);
    let cell_h = h + padding;
    let cell_w = w + padding;
    let grid_h = cell_h * nrows + padding;
    let grid_w = cell_w * ncols + padding;

    let mut grid = vec![-1f32; 3 * grid_h * grid_w];
    for (k, tile) in rgb.iter().enumerate() {
        let top = (k / ncols) * cell_h + padding;
        let left = (k % ncols) * cell_w + padding;
        let data = tile.flatten_all()?.to_vec1::<f32>()?;
        for c in 0..3 {
            for y in 0..h {
                let src = (c * h + y) * w;
                let dst = (c * grid_h + top + y) * grid_w + left;
                grid[dst..dst + w].copy_from_slice(&data[src..src + w]);
            }
        }
    }
    Ok(Tensor::from_vec(grid, (3, grid_h, grid_w), &Device::Cpu)?)
}

/// Side-by-side grids of the middle slices of `pred` and `gt`, one per axis.
///
/// Both inputs are `(B, C, D, H, W)` batches; the first channel of the first
/// sample is visualised.
pub fn slice_grids(pred: &Tensor, gt: &Tensor) -> Result<[Tensor; 3]> {
    let first = |t: &Tensor| -> Result<Tensor> {
        if t.rank() != 5 {
            bail!("expected a (B, C, D, H, W) batch, got {:?}", t.shape())
        }
        Ok(t.get(0)?.get(0)?.to_dtype(DType::F32)?.to_device(&Device::Cpu)?)
    };
    let [px, py, pz] = middle_slices(&first(pred)?)?;
    let [gx, gy, gz] = middle_slices(&first(gt)?)?;
    Ok([
        make_grid(&[px, gx], 3, 2)?,
        make_grid(&[py, gy], 3, 2)?,
        make_grid(&[pz, gz], 3, 2)?,
    ])
}
