//! AdamW with persistable moment estimates.
//!
//! Follows the update rule of `torch.optim.AdamW` (decoupled weight decay,
//! bias-corrected moments). Unlike `candle_nn::AdamW`, parameters are named so
//! the optimizer state can be written next to a model checkpoint and read back
//! when training resumes.
use std::collections::HashMap;
use std::path::Path;

use candle::backprop::GradStore;
use candle::{bail, DType, Result, Tensor, Var};
use candle_nn::{Optimizer, VarMap};

#[derive(Clone, Debug, PartialEq)]
pub struct ParamsAdamW {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdamW {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

#[derive(Debug)]
struct NamedVar {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

impl NamedVar {
    fn new(name: String, var: Var) -> Result<Self> {
        let dtype = var.dtype();
        let shape = var.shape();
        let device = var.device();
        let first_moment = Var::zeros(shape, dtype, device)?;
        let second_moment = Var::zeros(shape, dtype, device)?;
        Ok(Self {
            name,
            var,
            first_moment,
            second_moment,
        })
    }
}

#[derive(Debug)]
pub struct AdamW {
    vars: Vec<NamedVar>,
    step_t: usize,
    params: ParamsAdamW,
}

const STEP_KEY: &str = "__step__";

impl AdamW {
    /// Creates an optimizer over every variable of `varmap`, ordered by name.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let data = varmap.data().lock().map_err(|e| candle::Error::Msg(e.to_string()))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        drop(data);
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Self::from_named(named, params)
    }

    pub fn from_named(named: Vec<(String, Var)>, params: ParamsAdamW) -> Result<Self> {
        let vars = named
            .into_iter()
            .map(|(name, var)| NamedVar::new(name, var))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    pub fn params(&self) -> &ParamsAdamW {
        &self.params
    }

    /// Number of optimizer steps taken so far.
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn num_params(&self) -> usize {
        self.vars.len()
    }

    /// Writes both moments of every parameter and the step count to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::with_capacity(2 * self.vars.len() + 1);
        for v in self.vars.iter() {
            tensors.insert(
                format!("{}.exp_avg", v.name),
                v.first_moment.as_tensor().clone(),
            );
            tensors.insert(
                format!("{}.exp_avg_sq", v.name),
                v.second_moment.as_tensor().clone(),
            );
        }
        let device = match self.vars.first() {
            Some(v) => v.var.device().clone(),
            None => candle::Device::Cpu,
        };
        tensors.insert(
            STEP_KEY.to_string(),
            Tensor::new(&[self.step_t as i64], &device)?,
        );
        candle::safetensors::save(&tensors, path)
    }

    /// Restores the state written by [`AdamW::save`].
    ///
    /// Every parameter must have both moments in the file with a matching shape.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let device = match self.vars.first() {
            Some(v) => v.var.device().clone(),
            None => candle::Device::Cpu,
        };
        let tensors = candle::safetensors::load(path, &device)?;
        for v in self.vars.iter() {
            for (suffix, moment) in [("exp_avg", &v.first_moment), ("exp_avg_sq", &v.second_moment)] {
                let key = format!("{}.{suffix}", v.name);
                let t = match tensors.get(&key) {
                    Some(t) => t,
                    None => bail!("optimizer state is missing {key}"),
                };
                if t.shape() != moment.shape() {
                    bail!(
                        "optimizer state shape mismatch for {key}: expected {:?}, got {:?}",
                        moment.shape(),
                        t.shape()
                    )
                }
                moment.set(&t.to_dtype(moment.dtype())?)?;
            }
        }
        let step = match tensors.get(STEP_KEY) {
            Some(t) => t.to_dtype(DType::I64)?.to_vec1::<i64>()?,
            None => bail!("optimizer state is missing the step count"),
        };
        self.step_t = step.first().copied().unwrap_or(0).max(0) as usize;
        Ok(())
    }
}

impl Optimizer for AdamW {
    type Config = ParamsAdamW;

    fn new(vars: Vec<Var>, params: ParamsAdamW) -> Result<Self> {
        let named = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .enumerate()
            .map(|(i, var)| (format!("param.{i}"), var))
            .collect();
        Self::from_named(named, params)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let lr = self.params.lr;
        let lr_lambda = lr * self.params.weight_decay;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for var in self.vars.iter() {
            let theta = &var.var;
            let m = &var.first_moment;
            let v = &var.second_moment;
            if let Some(g) = grads.get(theta) {
                let next_m = ((m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
                let next_v = ((v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let v_hat = (&next_v * scale_v)?;
                let next_theta = (theta.as_tensor() * (1f64 - lr_lambda))?;
                let adjusted_grad = (m_hat / (v_hat.sqrt()? + self.params.eps)?)?;
                let next_theta = (next_theta - (adjusted_grad * lr)?)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
                theta.set(&next_theta)?;
            }
        }
        Ok(())
    }
}
