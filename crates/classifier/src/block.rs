use std::fmt;

use candle_core::{DType, Error, Result, Tensor};
use candle_nn::ops;

use crate::{
    config::BackboneConfig,
    init::{LinearInit, ParamInit},
    layers::{ForwardContext, Linear, RmsNorm},
    lora::{LoraBranch, LoraSettings},
    registry::{BlockModule, ParamId, ParamRole, ParameterRegistry, Projection},
};

/// Pre-norm decoder block: causal self-attention followed by a gated SiLU MLP,
/// each wrapped in a residual connection.
#[derive(Clone)]
pub struct DecoderBlock {
    index: usize,
    heads: usize,
    head_dim: usize,
    input_norm: RmsNorm,
    post_attention_norm: RmsNorm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl fmt::Debug for DecoderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderBlock")
            .field("index", &self.index)
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .finish()
    }
}

impl DecoderBlock {
    pub(crate) fn new(index: usize, config: &BackboneConfig, init: &mut ParamInit) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let norm_id = |module| ParamId::block(index, module, ParamRole::Weight);

        let mut projection = |proj: Projection, in_dim: usize, out_dim: usize, bias: bool| {
            let weight = ParamId::projection(index, proj, ParamRole::Weight);
            let bias = bias.then(|| ParamId::projection(index, proj, ParamRole::Bias));
            Linear::new(init, in_dim, out_dim, weight, bias, LinearInit::DEFAULT_LINEAR)
        };

        let attn_bias = config.attention_bias;
        let q_proj = projection(Projection::Query, hidden, hidden, attn_bias)?;
        let k_proj = projection(Projection::Key, hidden, hidden, attn_bias)?;
        let v_proj = projection(Projection::Value, hidden, hidden, attn_bias)?;
        let o_proj = projection(Projection::Output, hidden, hidden, false)?;
        let gate_proj = projection(Projection::Gate, hidden, inter, false)?;
        let up_proj = projection(Projection::Up, hidden, inter, false)?;
        let down_proj = projection(Projection::Down, inter, hidden, false)?;

        let input_norm = RmsNorm::new(
            init,
            hidden,
            norm_id(BlockModule::InputNorm),
            config.rms_norm_eps,
        )?;
        let post_attention_norm = RmsNorm::new(
            init,
            hidden,
            norm_id(BlockModule::PostAttentionNorm),
            config.rms_norm_eps,
        )?;

        Ok(Self {
            index,
            heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            input_norm,
            post_attention_norm,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn projection(&self, proj: Projection) -> &Linear {
        match proj {
            Projection::Query => &self.q_proj,
            Projection::Key => &self.k_proj,
            Projection::Value => &self.v_proj,
            Projection::Output => &self.o_proj,
            Projection::Gate => &self.gate_proj,
            Projection::Up => &self.up_proj,
            Projection::Down => &self.down_proj,
        }
    }

    fn projection_mut(&mut self, proj: Projection) -> &mut Linear {
        match proj {
            Projection::Query => &mut self.q_proj,
            Projection::Key => &mut self.k_proj,
            Projection::Value => &mut self.v_proj,
            Projection::Output => &mut self.o_proj,
            Projection::Gate => &mut self.gate_proj,
            Projection::Up => &mut self.up_proj,
            Projection::Down => &mut self.down_proj,
        }
    }

    pub(crate) fn attach_adapter(
        &mut self,
        proj: Projection,
        settings: &LoraSettings,
        init: &mut ParamInit,
    ) -> Result<()> {
        let index = self.index;
        let linear = self.projection_mut(proj);
        if linear.has_adapter() {
            return Err(Error::Msg(format!(
                "layer {index} {proj} already carries an adapter"
            )));
        }
        let weight_id = ParamId::projection(index, proj, ParamRole::Weight);
        let branch = LoraBranch::new(init, weight_id, linear.in_dim(), linear.out_dim(), settings)?;
        linear.attach_adapter(branch);
        Ok(())
    }

    /// `hidden` is `(batch, seq, hidden)`; `attention_bias` is additive and
    /// broadcastable to `(batch, heads, seq, seq)`.
    pub(crate) fn forward(
        &self,
        hidden: &Tensor,
        attention_bias: &Tensor,
        ctx: &ForwardContext<'_>,
    ) -> Result<Tensor> {
        let normed = self.input_norm.forward(hidden, ctx)?;
        let attn = self.attention(&normed, attention_bias, ctx)?;
        let hidden = (hidden + attn)?;

        let normed = self.post_attention_norm.forward(&hidden, ctx)?;
        let gate = self.gate_proj.forward(&normed, ctx)?.silu()?;
        let up = self.up_proj.forward(&normed, ctx)?;
        let mlp = self.down_proj.forward(&(gate * up)?, ctx)?;
        hidden + mlp
    }

    fn attention(
        &self,
        hidden: &Tensor,
        attention_bias: &Tensor,
        ctx: &ForwardContext<'_>,
    ) -> Result<Tensor> {
        let (batch, seq, width) = hidden.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch, seq, self.heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(self.q_proj.forward(hidden, ctx)?)?;
        let k = split(self.k_proj.forward(hidden, ctx)?)?;
        let v = split(self.v_proj.forward(hidden, ctx)?)?;

        let dtype = q.dtype();
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .to_dtype(DType::F32)?
            .broadcast_add(attention_bias)?;
        let probs = ops::softmax_last_dim(&scores)?.to_dtype(dtype)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, width))?;
        self.o_proj.forward(&context, ctx)
    }

    pub(crate) fn register(&self, registry: &mut ParameterRegistry) {
        self.input_norm.register(registry);
        self.post_attention_norm.register(registry);
        for proj in Projection::ALL {
            self.projection(proj).register(registry);
        }
    }
}
