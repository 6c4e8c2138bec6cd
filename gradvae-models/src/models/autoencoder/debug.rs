//! Tensor statistics for debugging the autoencoder stages.
//!
//! Set `GRADVAE_DEBUG=1` to log mean/std/min/max of the activations after each
//! block at `debug` level.

use candle::{DType, Result, Tensor};
use std::sync::OnceLock;

static DEBUG_MODE: OnceLock<bool> = OnceLock::new();

/// Check if debug mode is enabled (via the `GRADVAE_DEBUG` environment variable).
pub fn is_debug_mode() -> bool {
    *DEBUG_MODE.get_or_init(|| std::env::var("GRADVAE_DEBUG").is_ok())
}

/// Compute `(mean, std, min, max)` of a tensor in f32.
pub fn tensor_stats(t: &Tensor) -> Result<(f32, f32, f32, f32)> {
    let t_f32 = t.to_dtype(DType::F32)?.flatten_all()?;
    let mean = t_f32.mean_all()?;
    let var = t_f32.broadcast_sub(&mean)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
    let min = t_f32.min(0)?.to_scalar::<f32>()?;
    let max = t_f32.max(0)?.to_scalar::<f32>()?;
    Ok((mean.to_scalar::<f32>()?, var.sqrt(), min, max))
}

pub fn debug_tensor(name: &str, t: &Tensor) {
    if !is_debug_mode() {
        return;
    }
    match tensor_stats(t) {
        Ok((mean, std, min, max)) => tracing::debug!(
            "[VAE] {name}: shape={:?}, mean={mean:.6}, std={std:.6}, min={min:.6}, max={max:.6}",
            t.dims()
        ),
        Err(e) => tracing::debug!("[VAE] {name}: shape={:?}, stats error: {e}", t.dims()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn test_tensor_stats() -> Result<()> {
        let t = Tensor::new(&[1f32, 2., 3., 4.], &Device::Cpu)?;
        let (mean, std, min, max) = tensor_stats(&t)?;
        assert!((mean - 2.5).abs() < 1e-6);
        assert!((std - 1.25f32.sqrt()).abs() < 1e-6);
        assert_eq!((min, max), (1., 4.));
        Ok(())
    }
}
