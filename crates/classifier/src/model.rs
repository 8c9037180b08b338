use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicBool, Ordering},
};

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::ops;

use crate::{
    block::DecoderBlock,
    config::ClassifierConfig,
    init::ParamInit,
    layers::{Embedding, ForwardContext, Linear, RmsNorm},
    lora::LoraSettings,
    registry::{Component, ParamId, ParamRole, ParameterRegistry, Projection, TrainablePartition},
};

const MASKED_SCORE: f32 = -1e9;

/// Pretrained decoder trunk with a sequence classification head.
///
/// Parameters are addressed through the [`ParameterRegistry`] returned by
/// [`ClassifierModel::registry`]. Until a [`TrainablePartition`] is installed
/// every parameter is frozen.
pub struct ClassifierModel {
    config: ClassifierConfig,
    embedding: Embedding,
    blocks: Vec<DecoderBlock>,
    final_norm: RmsNorm,
    head: Linear,
    registry: ParameterRegistry,
    partition: TrainablePartition,
    adapter_seed: u64,
    training: AtomicBool,
}

impl ClassifierModel {
    /// Builds the model with deterministic weights derived from `config.seed`.
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        let backbone = &config.backbone;
        let mut init = ParamInit::new(config.seed, config.dtype, &config.device);

        let embedding = Embedding::new(
            &mut init,
            backbone.vocab_size,
            backbone.hidden_size,
            ParamId::new(Component::Embedding, ParamRole::Weight),
        )?;

        let mut blocks = Vec::with_capacity(backbone.num_hidden_layers);
        for layer in 0..backbone.num_hidden_layers {
            blocks.push(DecoderBlock::new(layer, backbone, &mut init)?);
        }

        let final_norm = RmsNorm::new(
            &init,
            backbone.hidden_size,
            ParamId::new(Component::FinalNorm, ParamRole::Weight),
            backbone.rms_norm_eps,
        )?;

        let head = Linear::with_uniform_bias(
            &mut init,
            backbone.hidden_size,
            config.num_classes,
            ParamId::new(Component::Head, ParamRole::Weight),
            ParamId::new(Component::Head, ParamRole::Bias),
        )?;

        let adapter_seed = config.seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut model = Self {
            config,
            embedding,
            blocks,
            final_norm,
            head,
            registry: ParameterRegistry::new(),
            partition: TrainablePartition::new(),
            adapter_seed,
            training: AtomicBool::new(false),
        };
        model.rebuild_registry();
        Ok(model)
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.config.device
    }

    pub fn dtype(&self) -> DType {
        self.config.dtype
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    pub fn pad_token_id(&self) -> u32 {
        self.config.backbone.pad_token_id
    }

    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    pub fn partition(&self) -> &TrainablePartition {
        &self.partition
    }

    /// Parameters paired with their canonical names.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        self.registry.named()
    }

    /// Trainable parameters in registry order.
    pub fn trainable_parameters(&self) -> Vec<(ParamId, Var)> {
        self.registry
            .iter()
            .filter(|(id, _)| self.partition.contains(id))
            .map(|(id, var)| (*id, var.clone()))
            .collect()
    }

    /// Bias identifier of a block projection, if the projection has one.
    pub fn projection_bias(&self, block: usize, proj: Projection) -> Option<ParamId> {
        self.blocks
            .get(block)
            .and_then(|b| b.projection(proj).bias_id())
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Composes a low-rank branch onto `proj` of every decoder block and
    /// returns the identifiers of the new parameters.
    ///
    /// Branches are initialised from a seed derived from the model seed, so
    /// replicas built from the same configuration stay identical.
    pub fn attach_adapters(
        &mut self,
        targets: &[Projection],
        settings: &LoraSettings,
    ) -> Result<Vec<ParamId>> {
        if settings.rank == 0 {
            return Err(Error::Msg("adapter rank must be greater than zero".into()));
        }
        let mut init = ParamInit::new(self.adapter_seed, self.config.dtype, &self.config.device);
        let mut added = Vec::new();
        for block in &mut self.blocks {
            for &proj in targets {
                block.attach_adapter(proj, settings, &mut init)?;
                let index = block.index();
                added.push(ParamId::projection(index, proj, ParamRole::LoraA));
                added.push(ParamId::projection(index, proj, ParamRole::LoraB));
            }
        }
        self.adapter_seed = self.adapter_seed.wrapping_add(1);
        self.rebuild_registry();
        Ok(added)
    }

    /// Installs the set of parameters that receive gradients.
    pub fn install_partition(&mut self, partition: TrainablePartition) -> Result<()> {
        if let Some(unknown) = partition.iter().find(|id| !self.registry.contains(id)) {
            return Err(Error::Msg(format!(
                "trainable partition names unknown parameter {unknown}"
            )));
        }
        self.partition = partition;
        Ok(())
    }

    /// Produces class logits shaped `(batch, num_classes)`.
    ///
    /// `input_ids` and `attention_mask` are `(batch, seq)` u32 tensors with
    /// right padding; each row is pooled at its last attended position.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        if attention_mask.dims2()? != (batch, seq) {
            return Err(Error::Msg(format!(
                "attention mask {:?} does not match input ids {:?}",
                attention_mask.dims(),
                input_ids.dims()
            )));
        }
        if seq == 0 {
            return Err(Error::Msg("sequence length must be non-zero".into()));
        }

        let training = self.is_training();
        let ctx = ForwardContext {
            partition: &self.partition,
            training,
        };
        let bias = build_attention_bias(attention_mask, seq, self.device())?;

        let mut hidden = self.embedding.forward(input_ids, &ctx)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden, &bias, &ctx)?;
        }
        let hidden = self.final_norm.forward(&hidden, &ctx)?;

        let pooled = pool_last_token(&hidden, attention_mask)?;
        let pooled = match self.config.head_dropout {
            Some(p) if training => ops::dropout(&pooled, p)?,
            _ => pooled,
        };
        self.head.forward(&pooled, &ctx)
    }

    /// Snapshot of every parameter keyed by canonical name.
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        self.registry
            .iter()
            .map(|(id, var)| (id.path(), var.as_tensor().clone()))
            .collect()
    }

    /// Overwrites parameters from `tensors`. With `strict`, every registered
    /// parameter must be present and no extra tensors are allowed.
    pub fn load_state_dict(&self, tensors: HashMap<String, Tensor>, strict: bool) -> Result<()> {
        self.load_with_prefix(tensors, "", strict, |_| true)
    }

    /// Loads pretrained trunk weights whose names omit the `trunk.` prefix.
    /// Adapter parameters are never read from pretrained files.
    pub fn load_trunk_weights(&self, tensors: HashMap<String, Tensor>) -> Result<()> {
        self.load_with_prefix(tensors, "trunk.", false, |id| {
            id.is_trunk() && !id.is_adapter()
        })
    }

    fn load_with_prefix(
        &self,
        mut tensors: HashMap<String, Tensor>,
        prefix: &str,
        strict: bool,
        select: impl Fn(&ParamId) -> bool,
    ) -> Result<()> {
        let mut missing = Vec::new();
        for (id, var) in self.registry.iter().filter(|(id, _)| select(id)) {
            let path = id.path();
            let key = path.strip_prefix(prefix).unwrap_or(&path);
            let Some(tensor) = tensors.remove(key) else {
                missing.push(path);
                continue;
            };
            if tensor.dims() != var.as_tensor().dims() {
                return Err(Error::Msg(format!(
                    "shape mismatch for {path}: expected {:?}, found {:?}",
                    var.as_tensor().dims(),
                    tensor.dims()
                )));
            }
            let tensor = tensor
                .to_dtype(var.as_tensor().dtype())?
                .to_device(var.as_tensor().device())?;
            var.set(&tensor)?;
        }

        if !missing.is_empty() {
            return Err(Error::Msg(format!(
                "missing parameters: {}",
                missing.join(", ")
            )));
        }
        if strict && !tensors.is_empty() {
            let mut extra: Vec<_> = tensors.into_keys().collect();
            extra.sort();
            return Err(Error::Msg(format!(
                "unexpected parameters: {}",
                extra.join(", ")
            )));
        }
        Ok(())
    }

    /// Parameter counts split by trainability and component.
    pub fn summary(&self) -> ModelSummary {
        let mut summary = ModelSummary::default();
        for (id, var) in self.registry.iter() {
            let count = var.as_tensor().elem_count();
            summary.total += count;
            if self.partition.contains(id) {
                summary.trainable += count;
            }
            let group = match id.component {
                _ if id.is_adapter() => "adapters",
                Component::Embedding => "embedding",
                Component::Block { .. } => "blocks",
                Component::FinalNorm => "final_norm",
                Component::Head => "head",
            };
            *summary.per_component.entry(group).or_default() += count;
        }
        summary
    }

    fn rebuild_registry(&mut self) {
        let mut registry = ParameterRegistry::new();
        self.embedding.register(&mut registry);
        for block in &self.blocks {
            block.register(&mut registry);
        }
        self.final_norm.register(&mut registry);
        self.head.register(&mut registry);
        self.registry = registry;
    }
}

/// Aggregate parameter counts for console reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSummary {
    pub total: usize,
    pub trainable: usize,
    pub per_component: BTreeMap<&'static str, usize>,
}

impl ModelSummary {
    pub fn frozen(&self) -> usize {
        self.total - self.trainable
    }

    pub fn trainable_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trainable as f64 / self.total as f64
        }
    }
}

/// Additive attention bias of shape `(batch, 1, seq, seq)` combining the
/// causal structure with key padding.
fn build_attention_bias(attention_mask: &Tensor, seq: usize, device: &Device) -> Result<Tensor> {
    let causal: Vec<f32> = (0..seq)
        .flat_map(|i| (0..seq).map(move |j| if j > i { MASKED_SCORE } else { 0.0 }))
        .collect();
    let causal = Tensor::from_vec(causal, (1, 1, seq, seq), device)?;

    let keys = attention_mask
        .to_dtype(DType::F32)?
        .affine(-1.0, 1.0)?
        .affine(MASKED_SCORE as f64, 0.0)?
        .unsqueeze(1)?
        .unsqueeze(1)?;
    causal.broadcast_add(&keys)
}

/// Selects the hidden state at the last attended position of every row.
fn pool_last_token(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, _seq, width) = hidden.dims3()?;
    let lengths = attention_mask
        .to_dtype(DType::F32)?
        .sum(1)?
        .affine(1.0, -1.0)?
        .clamp(0f32, f32::MAX)?
        .to_dtype(DType::U32)?;
    let index = lengths
        .reshape((batch, 1, 1))?
        .broadcast_as((batch, 1, width))?
        .contiguous()?;
    hidden.gather(&index, 1)?.squeeze(1)
}
