//! Checkpoints of the model weights, optimizer moments and loop counters.
//!
//! A checkpoint at step `s` in a folder is three files:
//! `{s:07}_gradvae.safetensors`, `{s:07}_optimizer.safetensors` and
//! `{s:07}_state.json`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle::{Device, Tensor};
use candle_nn::VarMap;
use gradvae_nn::AdamW;
use serde::{Deserialize, Serialize};

/// Prefix carried by weights exported from a wrapper module.
pub const WRAPPED_PREFIX: &str = "vae.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub global_step: usize,
    pub epoch: usize,
    /// Batches of `epoch` already taken; a resumed run skips them.
    #[serde(default)]
    pub batch: usize,
}

pub fn weights_path(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("{step:07}_gradvae.safetensors"))
}

pub fn optimizer_path(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("{step:07}_optimizer.safetensors"))
}

pub fn state_path(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("{step:07}_state.json"))
}

/// Writes the three checkpoint files for `state.global_step` and returns the weights path.
pub fn save(dir: &Path, varmap: &VarMap, optimizer: &AdamW, state: &CheckpointState) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let step = state.global_step;
    let weights = weights_path(dir, step);
    varmap
        .save(&weights)
        .with_context(|| format!("failed to write {}", weights.display()))?;
    optimizer.save(optimizer_path(dir, step))?;
    std::fs::write(state_path(dir, step), serde_json::to_string_pretty(state)?)?;
    tracing::info!(step, path = %weights.display(), "saved checkpoint");
    Ok(weights)
}

fn varmap_device(varmap: &VarMap) -> Device {
    varmap
        .all_vars()
        .first()
        .map(|v| v.device().clone())
        .unwrap_or(Device::Cpu)
}

/// Strips `prefix` from every name that carries it.
pub fn strip_prefix(tensors: HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    tensors
        .into_iter()
        .map(|(k, v)| match k.strip_prefix(prefix) {
            Some(stripped) => (stripped.to_string(), v),
            None => (k, v),
        })
        .collect()
}

/// Strictly loads safetensors weights into every variable of `varmap`.
///
/// Names starting with `prefix` have it removed first. Missing or unexpected
/// names and shape mismatches are all reported in one error.
pub fn load_pretrained<P: AsRef<Path>>(varmap: &VarMap, path: P, prefix: Option<&str>) -> Result<()> {
    let path = path.as_ref();
    let device = varmap_device(varmap);
    let tensors = candle::safetensors::load(path, &device)
        .with_context(|| format!("failed to read weights {}", path.display()))?;
    let tensors = match prefix {
        Some(prefix) => strip_prefix(tensors, prefix),
        None => tensors,
    };

    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("variable map lock poisoned"))?;
    let expected: BTreeSet<&str> = data.keys().map(|k| k.as_str()).collect();
    let found: BTreeSet<&str> = tensors.keys().map(|k| k.as_str()).collect();
    let missing: Vec<&str> = expected.difference(&found).copied().collect();
    let unexpected: Vec<&str> = found.difference(&expected).copied().collect();
    let mut mismatched = Vec::new();
    for (name, var) in data.iter() {
        if let Some(t) = tensors.get(name) {
            if t.shape() != var.shape() {
                mismatched.push(format!("{name}: expected {:?}, got {:?}", var.shape(), t.shape()))
            }
        }
    }
    if !missing.is_empty() || !unexpected.is_empty() || !mismatched.is_empty() {
        bail!(
            "error loading {}:\n  missing keys: {missing:?}\n  unexpected keys: {unexpected:?}\n  shape mismatches: {mismatched:?}",
            path.display()
        )
    }
    for (name, var) in data.iter() {
        if let Some(t) = tensors.get(name) {
            var.set(&t.to_dtype(var.dtype())?)?;
        }
    }
    tracing::info!(path = %path.display(), n = data.len(), "loaded weights");
    Ok(())
}

pub fn load_state(dir: &Path, step: usize) -> Result<CheckpointState> {
    let path = state_path(dir, step);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

/// Restores weights, optimizer moments and counters saved at `step`.
pub fn resume(dir: &Path, step: usize, varmap: &VarMap, optimizer: &mut AdamW) -> Result<CheckpointState> {
    load_pretrained(varmap, weights_path(dir, step), None)?;
    optimizer.load(optimizer_path(dir, step))?;
    let state = load_state(dir, step)?;
    if state.global_step != step {
        bail!("checkpoint {step} records global step {}", state.global_step)
    }
    tracing::info!(step, epoch = state.epoch, batch = state.batch, "resumed training state");
    Ok(state)
}

/// Newest step with all three checkpoint files present.
pub fn latest_step(dir: &Path) -> Result<Option<usize>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut latest = None;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let step = match name
            .to_str()
            .and_then(|n| n.strip_suffix("_gradvae.safetensors"))
            .and_then(|s| s.parse::<usize>().ok())
        {
            Some(step) => step,
            None => continue,
        };
        if optimizer_path(dir, step).exists() && state_path(dir, step).exists() {
            latest = latest.max(Some(step));
        }
    }
    Ok(latest)
}
