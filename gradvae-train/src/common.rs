//! Device, tracing and file helpers shared by the `gradvae` subcommands.

use std::path::Path;

use anyhow::{bail, Result};
use candle::utils::{cuda_is_available, metal_is_available};
use candle::{DType, Device, Tensor};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber: a fmt layer filtered by `RUST_LOG`
/// (default `info`) and, when `chrome` is set, a Chrome trace layer.
///
/// The returned guard must be kept alive until the trace should be flushed.
pub fn setup_tracing(chrome: bool) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    if chrome {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(chrome_layer)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
        None
    }
}

/// Picks CUDA, then Metal, then the CPU.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        tracing::info!("running on CPU, to run on GPU(metal), build with `--features metal`");
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        tracing::info!("running on CPU, to run on GPU, build with `--features cuda`");
        Ok(Device::Cpu)
    }
}

/// Selects the device and seeds its generator.
///
/// Only CUDA and Metal devices can be seeded; CPU randomness in the pipeline
/// comes from seeded `StdRng`s instead.
pub fn setup_device(cpu: bool, seed: Option<u64>) -> Result<Device> {
    let device = device(cpu)?;
    if let Some(seed) = seed {
        if !matches!(device, Device::Cpu) {
            device.set_seed(seed)?;
        }
    }
    Ok(device)
}

/// Maps values in `[-1, 1]` to `u8` pixels.
pub fn to_pixels(t: &Tensor) -> Result<Tensor> {
    let t = t.to_dtype(DType::F32)?;
    let t = ((t.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    Ok(t.round()?.to_dtype(DType::U8)?)
}

/// Saves a `(3, height, width)` u8 tensor as an image.
pub fn save_image<P: AsRef<Path>>(img: &Tensor, p: P) -> Result<()> {
    let p = p.as_ref();
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        bail!("save_image expects an input of shape (3, height, width), got {channel} channels")
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let image: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        match image::ImageBuffer::from_raw(width as u32, height as u32, pixels) {
            Some(image) => image,
            None => bail!("error saving image {p:?}"),
        };
    image.save(p).map_err(candle::Error::wrap)?;
    Ok(())
}
