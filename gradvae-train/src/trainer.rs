//! The optimisation loop.
//!
//! Every step permutes a batch to channels-first, takes a random crop along
//! the last axis, reconstructs it through the autoencoder and minimises the
//! MSE with AdamW. Summaries, checkpoints and validation passes run at the
//! intervals configured in [`TrainParams`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use candle::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use gradvae_models::models::autoencoder::AutoencoderKL;
use gradvae_nn::{AdamW, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::checkpoint::{self, CheckpointState, WRAPPED_PREFIX};
use crate::config::{TrainConfig, TrainParams};
use crate::data::{
    crop_last_axis, crop_start, epoch_seed, to_channels_first, DataLoader, NpyVolumeDataset, VolumeDataset,
};
use crate::metrics::{psnr, slice_grids};
use crate::summary::SummaryWriter;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub global_step: usize,
    pub epochs: usize,
    /// Loss of the last optimisation step.
    pub last_loss: Option<f64>,
    /// `(loss, psnr)` of the last validation pass.
    pub last_val: Option<(f64, f64)>,
}

struct StepOutput {
    loss: f64,
    pred: Tensor,
    gt: Tensor,
}

pub struct Trainer {
    params: TrainParams,
    device: Device,
    dtype: DType,
    varmap: VarMap,
    model: AutoencoderKL,
    optimizer: AdamW,
    train_loader: DataLoader,
    val_loader: DataLoader,
    writer: SummaryWriter,
    rng: StdRng,
    global_step: usize,
    epoch: usize,
    batch: usize,
    step_loss: Vec<f64>,
    epoch_loss: Vec<f64>,
    last_loss: Option<f64>,
    last_val: Option<(f64, f64)>,
}

impl Trainer {
    /// Builds a trainer reading `.npy` volumes from the configured dataset folders.
    pub fn from_config(config: TrainConfig, device: &Device) -> Result<Self> {
        let train = NpyVolumeDataset::new(&config.dataset.train.path)?;
        let val = NpyVolumeDataset::new(&config.dataset.val.path)?;
        Self::new(config, Arc::new(train), Arc::new(val), device)
    }

    pub fn new(
        config: TrainConfig,
        train: Arc<dyn VolumeDataset>,
        val: Arc<dyn VolumeDataset>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let TrainConfig { model: model_config, train: params, .. } = config;
        let dtype = params.dtype()?;

        let ckpt_dir = params.ckpt_dir();
        std::fs::create_dir_all(&ckpt_dir)?;
        tracing::info!("experiment directory created at {}", params.exp_dir.display());

        let train_loader = DataLoader::new(
            train.clone(),
            params.batch_size,
            true,
            true,
            params.num_workers,
            params.seed,
        )?;
        let val_loader = DataLoader::new(
            val.clone(),
            params.batch_size,
            false,
            false,
            params.num_workers,
            params.seed,
        )?;
        if train_loader.is_empty() {
            bail!(
                "training set of {} volumes yields no batch of size {}",
                train_loader.dataset_len(),
                params.batch_size
            )
        }
        if val_loader.is_empty() {
            bail!("validation set is empty")
        }
        tracing::info!("dataset contains {} volumes", train_loader.dataset_len());

        let ratio = model_config.compression_ratio();
        if params.crop_len % ratio != 0 {
            bail!(
                "train.crop_len {} must be a multiple of the autoencoder compression ratio {ratio}",
                params.crop_len
            )
        }
        for (name, dataset) in [("training", &train), ("validation", &val)] {
            let (h, w, _, _) = dataset.get(0)?.dims4()?;
            if h % ratio != 0 || w % ratio != 0 {
                bail!(
                    "{name} volumes of {h}x{w} voxels need height and width divisible by the \
                     autoencoder compression ratio {ratio}"
                )
            }
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let model = AutoencoderKL::new(&model_config, vb)?;
        if let Some(path) = &params.init_from {
            checkpoint::load_pretrained(&varmap, path, Some(WRAPPED_PREFIX))?;
        }

        let adamw = ParamsAdamW {
            lr: params.learning_rate,
            weight_decay: params.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::from_varmap(&varmap, adamw)?;
        tracing::info!(
            "model has {} parameter tensors, {:.2}M values",
            optimizer.num_params(),
            varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>() as f64 / 1e6
        );

        let mut state = CheckpointState::default();
        if let Some(step) = params.resume_from {
            let step = match step {
                0 => match checkpoint::latest_step(&ckpt_dir)? {
                    Some(step) => step,
                    None => bail!("no checkpoint to resume from in {}", ckpt_dir.display()),
                },
                step => step,
            };
            state = checkpoint::resume(&ckpt_dir, step, &varmap, &mut optimizer)?;
        }

        let writer = SummaryWriter::new(&params.exp_dir)?;
        let rng = StdRng::seed_from_u64(epoch_seed(params.seed, state.epoch));
        Ok(Self {
            params,
            device: device.clone(),
            dtype,
            varmap,
            model,
            optimizer,
            train_loader,
            val_loader,
            writer,
            rng,
            global_step: state.global_step,
            epoch: state.epoch,
            batch: state.batch,
            step_loss: Vec::new(),
            epoch_loss: Vec::new(),
            last_loss: None,
            last_val: None,
        })
    }

    pub fn model(&self) -> &AutoencoderKL {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Runs until `train_steps` optimisation steps have been taken.
    pub fn train(&mut self) -> Result<TrainSummary> {
        let max_steps = self.params.train_steps;
        tracing::info!("training for {max_steps} steps");
        while self.global_step < max_steps {
            self.train_loader.set_epoch(self.epoch);
            self.rng = StdRng::seed_from_u64(epoch_seed(self.params.seed, self.epoch));
            let batches = self.train_loader.epoch_indices();
            let num_batches = batches.len();
            // batches of a resumed epoch that ran before the checkpoint
            let done = std::mem::take(&mut self.batch);
            for _ in 0..done.min(num_batches) {
                crop_start(&mut self.rng, self.params.crop_max_offset);
            }
            for (i, indices) in batches.iter().enumerate().skip(done) {
                let _span = tracing::span!(tracing::Level::TRACE, "train-step").entered();
                let batch = self.train_loader.load_batch(indices)?;
                let out = self.train_step(&batch)?;

                self.global_step += 1;
                self.batch = i + 1;
                let step = self.global_step;
                self.step_loss.push(out.loss);
                self.epoch_loss.push(out.loss);
                self.last_loss = Some(out.loss);
                tracing::debug!(
                    "Epoch: {:04}, Global Step: {step:07}, Batch: {}/{num_batches}, Loss: {:.6}",
                    self.epoch,
                    i + 1,
                    out.loss
                );

                if step % self.params.log_every == 0 {
                    let avg = mean(&self.step_loss);
                    self.step_loss.clear();
                    self.writer.add_scalar("loss/loss_simple_step", avg, step)?;
                    tracing::info!(
                        "Epoch: {:04}, Global Step: {step:07}, Loss: {avg:.6}",
                        self.epoch
                    );
                }

                if step % self.params.ckpt_every == 0 {
                    self.save_checkpoint()?;
                }

                if step % self.params.image_every == 0 || step == 1 {
                    log_slices(&mut self.writer, "slice", &out.pred, &out.gt, step)?;
                }

                if step % self.params.val_every == 0 {
                    let (loss, psnr) = self.validate()?;
                    self.writer.add_scalar("val/loss", loss, step)?;
                    self.writer.add_scalar("val/psnr", psnr, step)?;
                    tracing::info!("Global Step: {step:07}, val/loss: {loss:.6}, val/psnr: {psnr:.3}");
                    self.last_val = Some((loss, psnr));
                }

                if step == max_steps {
                    break;
                }
            }
            self.epoch += 1;
            self.batch = 0;
            if !self.epoch_loss.is_empty() {
                let avg = mean(&self.epoch_loss);
                self.epoch_loss.clear();
                self.writer
                    .add_scalar("loss/loss_simple_epoch", avg, self.global_step)?;
            }
            self.writer.flush()?;
        }
        tracing::info!("done!");
        self.writer.close()?;
        Ok(TrainSummary {
            global_step: self.global_step,
            epochs: self.epoch,
            last_loss: self.last_loss,
            last_val: self.last_val,
        })
    }

    /// Moves a stacked `(B, H, W, Z, C)` batch to the device as `(B, C, H, W, Z)`.
    fn prepare(&self, batch: &Tensor) -> Result<Tensor> {
        let x = to_channels_first(batch)?;
        Ok(x.to_device(&self.device)?.to_dtype(self.dtype)?)
    }

    fn train_step(&mut self, batch: &Tensor) -> Result<StepOutput> {
        let x = self.prepare(batch)?;
        let start = crop_start(&mut self.rng, self.params.crop_max_offset);
        let gt = crop_last_axis(&x, start, self.params.crop_len)?;

        let kl_weight = self.params.kl_weight;
        let (pred, loss) = if kl_weight > 0. || self.params.sample_posterior {
            let (pred, posterior) = self.model.forward(&gt, self.params.sample_posterior)?;
            let mut loss = candle_nn::loss::mse(&pred, &gt)?;
            if kl_weight > 0. {
                loss = (loss + (posterior.kl()? * kl_weight)?)?;
            }
            (pred, loss)
        } else {
            let z = self.model.encode(&gt)?;
            let pred = self.model.decode(&z)?;
            let loss = candle_nn::loss::mse(&pred, &gt)?;
            (pred, loss)
        };

        let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if !value.is_finite() {
            bail!("loss became {value} at step {}", self.global_step + 1)
        }
        self.optimizer.backward_step(&loss)?;
        Ok(StepOutput {
            loss: value,
            pred: pred.detach(),
            gt,
        })
    }

    /// Runs the validation set once with a fixed crop and returns the mean loss and PSNR.
    ///
    /// Slice grids of the first batch are written under `val/`.
    pub fn validate(&mut self) -> Result<(f64, f64)> {
        let _span = tracing::span!(tracing::Level::TRACE, "validate").entered();
        let mut losses = Vec::new();
        let mut psnrs = Vec::new();
        for (i, batch) in self.val_loader.epoch().enumerate() {
            let x = to_channels_first(&batch?)?
                .to_device(&self.device)?
                .to_dtype(self.dtype)?;
            let gt = crop_last_axis(&x, self.params.val_crop_offset, self.params.crop_len)?;
            let z = self.model.encode(&gt)?;
            let pred = self.model.decode(&z)?.detach();
            let loss = candle_nn::loss::mse(&pred, &gt)?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            losses.push(loss);
            psnrs.push(psnr(&pred, &gt, 0)?);
            if i == 0 {
                log_slices(&mut self.writer, "val", &pred, &gt, self.global_step)?;
            }
        }
        Ok((mean(&losses), mean(&psnrs)))
    }

    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let state = CheckpointState {
            global_step: self.global_step,
            epoch: self.epoch,
            batch: self.batch,
        };
        checkpoint::save(&self.params.ckpt_dir(), &self.varmap, &self.optimizer, &state)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

fn log_slices(writer: &mut SummaryWriter, prefix: &str, pred: &Tensor, gt: &Tensor, step: usize) -> Result<()> {
    let grids = slice_grids(pred, gt)?;
    for (axis, grid) in ["x", "y", "z"].iter().zip(grids.iter()) {
        writer.add_image(&format!("{prefix}/{axis}"), grid, step)?;
    }
    Ok(())
}
