//! Volume datasets and the batching loader.
//!
//! Samples are channels-last `(H, W, Z, C)` f32 tensors on the CPU. Batches are
//! stacked to `(B, H, W, Z, C)`; [`to_channels_first`] turns them into the
//! `(B, C, H, W, Z)` layout the autoencoder consumes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use candle::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

pub trait VolumeDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns sample `index` as a channels-last `(H, W, Z, C)` f32 tensor.
    fn get(&self, index: usize) -> Result<Tensor>;
}

/// Every `*.npy` file of a directory, in file name order.
#[derive(Debug, Clone)]
pub struct NpyVolumeDataset {
    files: Vec<PathBuf>,
}

impl NpyVolumeDataset {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to list dataset directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "npy") {
                files.push(path)
            }
        }
        files.sort();
        tracing::debug!(dir = %dir.display(), n = files.len(), "indexed npy volumes");
        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

/// Reads one volume, appending a channel axis to rank-3 arrays.
pub fn read_volume<P: AsRef<Path>>(path: P) -> Result<Tensor> {
    let path = path.as_ref();
    let t = Tensor::read_npy(path)
        .with_context(|| format!("failed to read volume {}", path.display()))?;
    let t = match t.rank() {
        3 => t.unsqueeze(3)?,
        4 => t,
        r => bail!("{}: expected a rank 3 or 4 volume, got rank {r}", path.display()),
    };
    Ok(t.to_dtype(DType::F32)?)
}

impl VolumeDataset for NpyVolumeDataset {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<Tensor> {
        match self.files.get(index) {
            Some(path) => read_volume(path),
            None => bail!("index {index} out of range for {} volumes", self.files.len()),
        }
    }
}

/// Volumes already held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    volumes: Vec<Tensor>,
}

impl InMemoryDataset {
    pub fn new(volumes: Vec<Tensor>) -> Result<Self> {
        for (i, v) in volumes.iter().enumerate() {
            if v.rank() != 4 {
                bail!("volume {i}: expected (H, W, Z, C), got {:?}", v.shape())
            }
        }
        Ok(Self { volumes })
    }
}

impl VolumeDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.volumes.len()
    }

    fn get(&self, index: usize) -> Result<Tensor> {
        match self.volumes.get(index) {
            Some(v) => Ok(v.to_dtype(DType::F32)?.to_device(&Device::Cpu)?),
            None => bail!("index {index} out of range for {} volumes", self.volumes.len()),
        }
    }
}

pub struct DataLoader {
    dataset: Arc<dyn VolumeDataset>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: usize,
    pool: rayon::ThreadPool,
}

/// Seed of the rngs used during `epoch`, so a resumed run draws what an
/// uninterrupted one would.
pub fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ (epoch as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// A training crop start, uniform in `[0, max_offset)`; 0 when `max_offset` is 0.
pub fn crop_start<R: Rng>(rng: &mut R, max_offset: usize) -> usize {
    match max_offset {
        0 => 0,
        n => rng.random_range(0..n),
    }
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn VolumeDataset>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch_size must be positive")
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("gradvae-loader-{i}"))
            .build()?;
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            drop_last,
            seed,
            epoch: 0,
            pool,
        })
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Epoch whose order the next [`DataLoader::epoch_indices`] call returns.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// Sample indices of every batch of the next epoch.
    ///
    /// With shuffling enabled the order depends only on the seed and the epoch
    /// number, which advances with every call.
    pub fn epoch_indices(&mut self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(epoch_seed(self.seed, self.epoch));
            order.shuffle(&mut rng);
        }
        self.epoch += 1;
        let mut batches: Vec<Vec<usize>> = order
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        if self.drop_last && batches.last().is_some_and(|b| b.len() < self.batch_size) {
            batches.pop();
        }
        batches
    }

    /// Starts a new epoch, loading batches lazily.
    pub fn epoch(&mut self) -> Batches<'_> {
        let batches = self.epoch_indices();
        Batches {
            loader: self,
            batches: batches.into_iter(),
        }
    }

    /// Loads the given samples in parallel and stacks them along a new batch axis.
    pub fn load_batch(&self, indices: &[usize]) -> Result<Tensor> {
        let dataset = &self.dataset;
        let samples = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&i| dataset.get(i))
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(Tensor::stack(&samples, 0)?)
    }
}

pub struct Batches<'a> {
    loader: &'a DataLoader,
    batches: std::vec::IntoIter<Vec<usize>>,
}

impl Iterator for Batches<'_> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.batches.next()?;
        Some(self.loader.load_batch(&indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.batches.size_hint()
    }
}

/// `b h w z c -> b c h w z`
pub fn to_channels_first(batch: &Tensor) -> Result<Tensor> {
    if batch.rank() != 5 {
        bail!("expected a (B, H, W, Z, C) batch, got {:?}", batch.shape())
    }
    Ok(batch.permute((0, 4, 1, 2, 3))?.contiguous()?)
}

/// `x[..., start..start + len]`
pub fn crop_last_axis(x: &Tensor, start: usize, len: usize) -> Result<Tensor> {
    let axis = x.rank().saturating_sub(1);
    let size = x.dim(axis)?;
    if start + len > size {
        bail!("crop {start}..{} exceeds the last axis of size {size}", start + len)
    }
    Ok(x.narrow(axis, start, len)?)
}
