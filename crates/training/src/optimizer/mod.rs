use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScalePolicy, ScaleAdjustment};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Named set of parameters sharing one learning rate.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub name: String,
    pub learning_rate: f64,
    pub params: Vec<(String, Var)>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainerOptimizerOptions {
    pub clip_global_norm: Option<f64>,
    pub weight_decay_exclude: Vec<String>,
}

/// AdamW with decoupled weight decay over named parameter groups.
///
/// Reduced-precision parameters are updated through an F32 master copy.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    groups: Vec<GroupSlot>,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug, Clone)]
struct GroupSlot {
    name: String,
    learning_rate: f64,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    group: usize,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        groups: Vec<ParamGroup>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        let mut group_slots = Vec::with_capacity(groups.len());
        let mut params = Vec::new();
        for group in groups {
            if group.params.is_empty() {
                continue;
            }
            if !(group.learning_rate > 0.0) {
                return Err(TrainingError::configuration(format!(
                    "learning rate of group '{}' must be positive",
                    group.name
                )));
            }
            let group_index = group_slots.len();
            for (name, var) in group.params {
                params.push(ParameterSlot::new(
                    name,
                    group_index,
                    var,
                    &options.weight_decay_exclude,
                )?);
            }
            group_slots.push(GroupSlot {
                name: group.name,
                learning_rate: group.learning_rate,
            });
        }

        if params.is_empty() {
            return Err(TrainingError::configuration(
                "optimizer requires at least one trainable parameter",
            ));
        }

        Ok(Self {
            config,
            groups: group_slots,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// `(group name, learning rate)` for every non-empty group.
    pub fn learning_rates(&self) -> Vec<(&str, f64)> {
        self.groups
            .iter()
            .map(|g| (g.name.as_str(), g.learning_rate))
            .collect()
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.params.iter().map(|slot| slot.name.as_str())
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();

        for (idx, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient {
                index: idx,
                grad,
                norm,
            });
        }

        if processed.is_empty() {
            return Ok(());
        }

        if let Some(max_norm) = self.clip_global_norm {
            let total_norm = processed
                .iter()
                .map(|g| g.norm * g.norm)
                .sum::<f64>()
                .sqrt();
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
            }
        }

        self.step += 1;
        self.step_adamw(processed)
    }

    fn step_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];
            let learning_rate = self.groups[slot.group].learning_rate;

            let new_m = (slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                + item.grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;
            let new_v = (slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                + grad_sq.affine(1.0 - cfg.beta2, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            slot.write_param(&next)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    /// Snapshot of step count, group learning rates, moments and master weights.
    pub fn state(&self) -> OptimizerState {
        let parameters = self
            .params
            .iter()
            .map(|slot| ParameterState {
                name: slot.name.clone(),
                first_moment: slot.first_moment.clone(),
                second_moment: slot.second_moment.clone(),
                master: slot.master.as_ref().map(|m| m.as_tensor().clone()),
            })
            .collect();
        OptimizerState {
            step: self.step,
            groups: self
                .groups
                .iter()
                .map(|g| GroupState {
                    name: g.name.clone(),
                    learning_rate: g.learning_rate,
                })
                .collect(),
            parameters,
        }
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        for group in &state.groups {
            let known = self.groups.iter().any(|g| g.name == group.name);
            if !known {
                return Err(TrainingError::runtime(format!(
                    "optimizer state contains unknown group '{}'",
                    group.name
                )));
            }
        }

        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims().to_vec();
            let device = slot.param.as_tensor().device().clone();
            let restore = |tensor: Tensor, what: &str| -> Result<Tensor, TrainingError> {
                if tensor.dims() != dims.as_slice() {
                    return Err(TrainingError::runtime(format!(
                        "optimizer {what} shape mismatch for '{}'",
                        slot.name
                    )));
                }
                tensor
                    .to_dtype(DType::F32)
                    .and_then(|t| t.to_device(&device))
                    .map_err(to_runtime_error)
            };
            let first = restore(saved.first_moment, "first moment")?;
            let second = restore(saved.second_moment, "second moment")?;
            let master = match (&slot.master, saved.master) {
                (Some(_), Some(values)) => Some(restore(values, "master weight")?),
                (None, None) => None,
                (Some(_), None) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state contains master weights for '{}' but optimizer is not using them",
                        slot.name
                    )))
                }
            };

            if let (Some(var), Some(values)) = (slot.master.as_ref(), master.as_ref()) {
                var.set(values).map_err(to_runtime_error)?;
                slot.write_param(values)?;
            }
            slot.first_moment = first;
            slot.second_moment = second;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        for group in state.groups {
            if let Some(slot) = self.groups.iter_mut().find(|g| g.name == group.name) {
                slot.learning_rate = group.learning_rate;
            }
        }
        self.step = state.step;
        Ok(())
    }
}

impl ParameterSlot {
    fn new(
        name: String,
        group: usize,
        var: Var,
        weight_decay_exclude: &[String],
    ) -> Result<Self, TrainingError> {
        let tensor = var.as_tensor();
        if !tensor.dtype().is_float() {
            return Err(TrainingError::configuration(format!(
                "optimizer received non-floating parameter '{name}'"
            )));
        }
        let device = tensor.device();
        let shape = tensor.dims().to_vec();
        let dtype = tensor.dtype();

        let first_moment =
            Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
        let second_moment =
            Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
        let master = if dtype != DType::F32 {
            let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
            Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
        } else {
            None
        };
        let apply_weight_decay = !weight_decay_exclude
            .iter()
            .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()));

        Ok(Self {
            name,
            group,
            param: var,
            dtype,
            master,
            first_moment,
            second_moment,
            apply_weight_decay,
        })
    }

    fn write_param(&self, value: &Tensor) -> Result<(), TrainingError> {
        let cast = if self.dtype == DType::F32 {
            value.clone()
        } else {
            value.to_dtype(self.dtype).map_err(to_runtime_error)?
        };
        self.param.set(&cast).map_err(to_runtime_error)
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

/// In-memory optimizer snapshot. Tensors are persisted by the checkpoint
/// manager; [`OptimizerMetadata`] carries the rest.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub groups: Vec<GroupState>,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub name: String,
    pub learning_rate: f64,
}

#[derive(Debug, Clone)]
pub struct ParameterState {
    pub name: String,
    pub first_moment: Tensor,
    pub second_moment: Tensor,
    pub master: Option<Tensor>,
}

/// JSON-serializable part of [`OptimizerState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerMetadata {
    pub step: usize,
    pub groups: Vec<GroupState>,
    pub parameters: Vec<String>,
    pub with_master: Vec<String>,
}

const FIRST_MOMENT_SUFFIX: &str = "::exp_avg";
const SECOND_MOMENT_SUFFIX: &str = "::exp_avg_sq";
const MASTER_SUFFIX: &str = "::master";

impl OptimizerState {
    /// Splits the state into JSON metadata and a flat tensor map.
    pub fn into_parts(self) -> (OptimizerMetadata, HashMap<String, Tensor>) {
        let mut tensors = HashMap::with_capacity(self.parameters.len() * 2);
        let mut names = Vec::with_capacity(self.parameters.len());
        let mut with_master = Vec::new();
        for param in self.parameters {
            tensors.insert(format!("{}{FIRST_MOMENT_SUFFIX}", param.name), param.first_moment);
            tensors.insert(format!("{}{SECOND_MOMENT_SUFFIX}", param.name), param.second_moment);
            if let Some(master) = param.master {
                tensors.insert(format!("{}{MASTER_SUFFIX}", param.name), master);
                with_master.push(param.name.clone());
            }
            names.push(param.name);
        }
        (
            OptimizerMetadata {
                step: self.step,
                groups: self.groups,
                parameters: names,
                with_master,
            },
            tensors,
        )
    }

    pub fn from_parts(
        metadata: OptimizerMetadata,
        mut tensors: HashMap<String, Tensor>,
    ) -> Result<Self, TrainingError> {
        let mut take = |key: String| {
            tensors
                .remove(&key)
                .ok_or_else(|| TrainingError::runtime(format!("optimizer tensor '{key}' missing")))
        };
        let mut parameters = Vec::with_capacity(metadata.parameters.len());
        for name in metadata.parameters {
            let first_moment = take(format!("{name}{FIRST_MOMENT_SUFFIX}"))?;
            let second_moment = take(format!("{name}{SECOND_MOMENT_SUFFIX}"))?;
            let master = if metadata.with_master.contains(&name) {
                Some(take(format!("{name}{MASTER_SUFFIX}"))?)
            } else {
                None
            };
            parameters.push(ParameterState {
                name,
                first_moment,
                second_moment,
                master,
            });
        }
        Ok(Self {
            step: metadata.step,
            groups: metadata.groups,
            parameters,
        })
    }
}
