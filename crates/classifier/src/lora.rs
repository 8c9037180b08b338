use candle_core::{Result, Tensor};
use candle_nn::ops;

use crate::{
    init::{LinearInit, ParamInit},
    layers::{ForwardContext, Param},
    registry::{ParamId, ParamRole, ParameterRegistry},
};

/// Shape and scaling of a low-rank branch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoraSettings {
    pub rank: usize,
    pub alpha: f64,
    /// Dropout applied to the branch input in training mode.
    pub dropout: f32,
}

impl LoraSettings {
    /// Multiplier applied to the branch output, `alpha / rank`.
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

/// Trainable side path `scaling * B (A dropout(x))` added to a frozen projection.
///
/// `A` has shape `(rank, in)` and `B` has shape `(out, rank)`. `B` starts at
/// zero so attaching a branch leaves the projection output unchanged.
#[derive(Debug, Clone)]
pub(crate) struct LoraBranch {
    a: Param,
    b: Param,
    scaling: f64,
    dropout: Option<f32>,
}

impl LoraBranch {
    pub(crate) fn new(
        init: &mut ParamInit,
        base_weight: ParamId,
        in_dim: usize,
        out_dim: usize,
        settings: &LoraSettings,
    ) -> Result<Self> {
        let a_id = ParamId::new(base_weight.component, ParamRole::LoraA);
        let b_id = ParamId::new(base_weight.component, ParamRole::LoraB);
        let a = init.linear(settings.rank, in_dim, LinearInit::DEFAULT_LINEAR)?;
        let b = init.zeros((out_dim, settings.rank))?;
        Ok(Self {
            a: Param::new(a_id, a),
            b: Param::new(b_id, b),
            scaling: settings.scaling(),
            dropout: (settings.dropout > 0.0).then_some(settings.dropout),
        })
    }

    /// Expects a flattened `(rows, in)` input and returns `(rows, out)`.
    pub(crate) fn forward(&self, flat: &Tensor, ctx: &ForwardContext<'_>) -> Result<Tensor> {
        let input = match self.dropout {
            Some(p) if ctx.training => ops::dropout(flat, p)?,
            _ => flat.clone(),
        };
        let a = self.a.tensor(ctx);
        let b = self.b.tensor(ctx);
        input
            .matmul(&a.t()?)?
            .matmul(&b.t()?)?
            .affine(self.scaling, 0.0)
    }

    pub(crate) fn register(&self, registry: &mut ParameterRegistry) {
        self.a.register(registry);
        self.b.register(registry);
    }
}
