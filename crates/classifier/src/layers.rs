//! Building blocks shared by the trunk and the head.
//!
//! Every layer stores its tensors as [`Param`]s that know their own
//! [`ParamId`]. During the forward pass a [`ForwardContext`] decides per
//! parameter whether the storage enters the autograd graph or is detached,
//! which is how the trainable partition is enforced.

use candle_core::{DType, Result, Tensor, Var, D};

use crate::{
    init::{LinearInit, ParamInit},
    lora::LoraBranch,
    registry::{ParamId, ParameterRegistry, TrainablePartition},
};

/// Per-call view of the training mode and the installed partition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForwardContext<'a> {
    pub partition: &'a TrainablePartition,
    pub training: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Param {
    id: ParamId,
    var: Var,
}

impl Param {
    pub(crate) fn new(id: ParamId, var: Var) -> Self {
        Self { id, var }
    }

    pub(crate) fn id(&self) -> ParamId {
        self.id
    }

    /// Storage handle; frozen parameters are detached from the graph.
    pub(crate) fn tensor(&self, ctx: &ForwardContext<'_>) -> Tensor {
        if ctx.partition.contains(&self.id) {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        }
    }

    pub(crate) fn register(&self, registry: &mut ParameterRegistry) {
        registry.insert(self.id, &self.var);
    }
}

/// Dense projection `y = x W^T + b`, optionally composed with a low-rank branch.
#[derive(Debug, Clone)]
pub(crate) struct Linear {
    in_dim: usize,
    out_dim: usize,
    weight: Param,
    bias: Option<Param>,
    adapter: Option<LoraBranch>,
}

impl Linear {
    pub(crate) fn new(
        init: &mut ParamInit,
        in_dim: usize,
        out_dim: usize,
        weight_id: ParamId,
        bias_id: Option<ParamId>,
        policy: LinearInit,
    ) -> Result<Self> {
        let weight = Param::new(weight_id, init.linear(out_dim, in_dim, policy)?);
        let bias = match bias_id {
            Some(id) => Some(Param::new(id, init.zeros(out_dim)?)),
            None => None,
        };
        Ok(Self {
            in_dim,
            out_dim,
            weight,
            bias,
            adapter: None,
        })
    }

    /// Same as [`Linear::new`] but with a bias drawn from `U(-1/sqrt(in), 1/sqrt(in))`.
    pub(crate) fn with_uniform_bias(
        init: &mut ParamInit,
        in_dim: usize,
        out_dim: usize,
        weight_id: ParamId,
        bias_id: ParamId,
    ) -> Result<Self> {
        let mut linear = Self::new(init, in_dim, out_dim, weight_id, None, LinearInit::DEFAULT_LINEAR)?;
        let bound = 1.0 / (in_dim.max(1) as f64).sqrt();
        linear.bias = Some(Param::new(bias_id, init.uniform(out_dim, bound)?));
        Ok(linear)
    }

    pub(crate) fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub(crate) fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub(crate) fn bias_id(&self) -> Option<ParamId> {
        self.bias.as_ref().map(Param::id)
    }

    pub(crate) fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    pub(crate) fn attach_adapter(&mut self, adapter: LoraBranch) {
        self.adapter = Some(adapter);
    }

    pub(crate) fn forward(&self, hidden: &Tensor, ctx: &ForwardContext<'_>) -> Result<Tensor> {
        let dims = hidden.dims().to_vec();
        let rows: usize = dims[..dims.len().saturating_sub(1)].iter().product();
        let flat = hidden.reshape((rows, self.in_dim))?;

        let weight = self.weight.tensor(ctx);
        let mut out = flat.matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            out = out.broadcast_add(&bias.tensor(ctx))?;
        }
        if let Some(adapter) = &self.adapter {
            out = (out + adapter.forward(&flat, ctx)?)?;
        }

        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = self.out_dim;
        }
        out.reshape(out_dims)
    }

    pub(crate) fn register(&self, registry: &mut ParameterRegistry) {
        self.weight.register(registry);
        if let Some(bias) = &self.bias {
            bias.register(registry);
        }
        if let Some(adapter) = &self.adapter {
            adapter.register(registry);
        }
    }
}

/// Root mean square norm matching LLaMA-style blocks. Statistics are always
/// computed in F32.
#[derive(Debug, Clone)]
pub(crate) struct RmsNorm {
    weight: Param,
    eps: f64,
}

impl RmsNorm {
    pub(crate) fn new(init: &ParamInit, hidden: usize, id: ParamId, eps: f64) -> Result<Self> {
        Ok(Self {
            weight: Param::new(id, init.ones(hidden)?),
            eps,
        })
    }

    pub(crate) fn forward(&self, hidden: &Tensor, ctx: &ForwardContext<'_>) -> Result<Tensor> {
        let dtype = hidden.dtype();
        let hidden_f32 = hidden.to_dtype(DType::F32)?;
        let mean_sq = hidden_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = mean_sq.affine(1.0, self.eps)?.sqrt()?;
        let normed = hidden_f32.broadcast_div(&rms)?.to_dtype(dtype)?;
        normed.broadcast_mul(&self.weight.tensor(ctx))
    }

    pub(crate) fn register(&self, registry: &mut ParameterRegistry) {
        self.weight.register(registry);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Embedding {
    weight: Param,
    hidden: usize,
}

impl Embedding {
    pub(crate) fn new(init: &mut ParamInit, vocab: usize, hidden: usize, id: ParamId) -> Result<Self> {
        Ok(Self {
            weight: Param::new(id, init.uniform((vocab, hidden), 0.02)?),
            hidden,
        })
    }

    pub(crate) fn forward(&self, input_ids: &Tensor, ctx: &ForwardContext<'_>) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let ids = input_ids.flatten_all()?;
        self.weight
            .tensor(ctx)
            .index_select(&ids, 0)?
            .reshape((batch, seq, self.hidden))
    }

    pub(crate) fn register(&self, registry: &mut ParameterRegistry) {
        self.weight.register(registry);
    }
}
