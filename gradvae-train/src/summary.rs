//! Scalar and image summaries for an experiment folder.
//!
//! Summaries are TensorBoard event files (`events.out.tfevents.*`) written in
//! the experiment folder, so a run can be followed with `tensorboard --logdir`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle::Tensor;

use crate::common::to_pixels;

/// File name prefix of the event files TensorBoard reads.
pub const EVENTS_PREFIX: &str = "events.out.tfevents";

pub struct SummaryWriter {
    log_dir: PathBuf,
    inner: Option<tensorboard_rs::summary_writer::SummaryWriter>,
}

impl SummaryWriter {
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        let inner = tensorboard_rs::summary_writer::SummaryWriter::new(&log_dir);
        Ok(Self {
            log_dir,
            inner: Some(inner),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn writer(&mut self) -> Result<&mut tensorboard_rs::summary_writer::SummaryWriter> {
        match self.inner.as_mut() {
            Some(w) => Ok(w),
            None => bail!("summary writer is closed"),
        }
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.writer()?.add_scalar(tag, value as f32, step);
        tracing::trace!(tag, step, value, "scalar");
        Ok(())
    }

    /// Writes a `(C, H, W)` image with values in `[-1, 1]`; one channel is expanded to RGB.
    pub fn add_image(&mut self, tag: &str, img: &Tensor, step: usize) -> Result<()> {
        let img = match img.dims() {
            [1, h, w] if *h > 0 && *w > 0 => img.repeat((3, 1, 1))?,
            [3, h, w] if *h > 0 && *w > 0 => img.clone(),
            dims => bail!("add_image expects a non-empty (1|3, H, W) image, got {dims:?}"),
        };
        let (_, h, w) = img.dims3()?;
        let pixels = to_pixels(&img)?.flatten_all()?.to_vec1::<u8>()?;
        self.writer()?.add_image(tag, &pixels, &[3, h, w], step);
        tracing::trace!(tag, step, h, w, "image");
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(w) = self.inner.as_mut() {
            w.flush();
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.inner = None;
        Ok(())
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!("failed to flush summaries: {err}");
        }
    }
}

/// Event files of a summary folder, oldest name first.
pub fn event_files<P: AsRef<Path>>(log_dir: P) -> Result<Vec<PathBuf>> {
    let log_dir = log_dir.as_ref();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(log_dir)
        .with_context(|| format!("failed to list {}", log_dir.display()))?
    {
        let path = entry?.path();
        let is_events = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(EVENTS_PREFIX));
        if path.is_file() && is_events {
            files.push(path)
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device};

    fn count(haystack: &[u8], needle: &str) -> usize {
        haystack
            .windows(needle.len())
            .filter(|w| *w == needle.as_bytes())
            .count()
    }

    fn events(dir: &Path) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for file in event_files(dir)? {
            bytes.extend(std::fs::read(file)?);
        }
        Ok(bytes)
    }

    #[test]
    fn test_scalars_go_to_an_event_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = SummaryWriter::new(dir.path())?;
        w.add_scalar("loss/loss_simple_step", 0.5, 10)?;
        w.add_scalar("loss/loss_simple_step", 0.25, 20)?;
        w.add_scalar("val/psnr", 31.25, 20)?;
        w.close()?;
        assert!(w.add_scalar("val/psnr", 1., 30).is_err());

        assert_eq!(event_files(dir.path())?.len(), 1);
        let bytes = events(dir.path())?;
        assert_eq!(count(&bytes, "loss/loss_simple_step"), 2);
        assert_eq!(count(&bytes, "val/psnr"), 1);
        Ok(())
    }

    #[test]
    fn test_images_are_validated_before_writing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut w = SummaryWriter::new(dir.path())?;
        let img = Tensor::zeros((1, 6, 10), DType::F32, &Device::Cpu)?;
        w.add_image("slice/x", &img, 1)?;
        let rgb = Tensor::ones((3, 4, 4), DType::F32, &Device::Cpu)?;
        w.add_image("slice/y", &rgb, 1)?;

        let bad = Tensor::zeros((2, 6, 10), DType::F32, &Device::Cpu)?;
        assert!(w.add_image("slice/z", &bad, 2).is_err());
        let empty = Tensor::zeros((1, 0, 10), DType::F32, &Device::Cpu)?;
        assert!(w.add_image("slice/z", &empty, 2).is_err());
        w.close()?;

        let bytes = events(dir.path())?;
        assert_eq!(count(&bytes, "slice/x"), 1);
        assert_eq!(count(&bytes, "slice/y"), 1);
        assert_eq!(count(&bytes, "slice/z"), 0);
        Ok(())
    }
}
