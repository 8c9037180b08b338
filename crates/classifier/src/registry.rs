//! Typed parameter addressing for the composed classifier.
//!
//! Every trainable tensor in the model is reachable through a [`ParamId`], a
//! structural identifier built from the position of the tensor in the model
//! tree rather than from attribute names. The [`ParameterRegistry`] is the
//! result of a single traversal of the model and is the only place that maps
//! identifiers to storage. Trainability is expressed as a separate
//! [`TrainablePartition`] computed once and installed into the model.

use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::fmt;

use candle_core::Var;

/// Linear projections inside a decoder block that adapters may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Projection {
    Query,
    Key,
    Value,
    Output,
    Gate,
    Up,
    Down,
}

impl Projection {
    pub const ALL: [Projection; 7] = [
        Projection::Query,
        Projection::Key,
        Projection::Value,
        Projection::Output,
        Projection::Gate,
        Projection::Up,
        Projection::Down,
    ];

    /// Conventional module name, e.g. `q_proj`.
    pub fn name(self) -> &'static str {
        match self {
            Projection::Query => "q_proj",
            Projection::Key => "k_proj",
            Projection::Value => "v_proj",
            Projection::Output => "o_proj",
            Projection::Gate => "gate_proj",
            Projection::Up => "up_proj",
            Projection::Down => "down_proj",
        }
    }

    /// Resolves a module name such as `v_proj` back to its projection.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|proj| proj.name() == name)
    }

    fn parent(self) -> &'static str {
        match self {
            Projection::Query | Projection::Key | Projection::Value | Projection::Output => {
                "self_attn"
            }
            Projection::Gate | Projection::Up | Projection::Down => "mlp",
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockModule {
    InputNorm,
    PostAttentionNorm,
    Projection(Projection),
}

/// Structural position of a parameter inside the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    Embedding,
    Block { index: usize, module: BlockModule },
    FinalNorm,
    Head,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamRole {
    Weight,
    Bias,
    LoraA,
    LoraB,
}

impl ParamRole {
    fn suffix(self) -> &'static str {
        match self {
            ParamRole::Weight => "weight",
            ParamRole::Bias => "bias",
            ParamRole::LoraA => "lora_a",
            ParamRole::LoraB => "lora_b",
        }
    }
}

/// Stable identifier of a single parameter tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId {
    pub component: Component,
    pub role: ParamRole,
}

impl ParamId {
    pub const fn new(component: Component, role: ParamRole) -> Self {
        Self { component, role }
    }

    pub const fn block(index: usize, module: BlockModule, role: ParamRole) -> Self {
        Self::new(Component::Block { index, module }, role)
    }

    pub const fn projection(index: usize, projection: Projection, role: ParamRole) -> Self {
        Self::block(index, BlockModule::Projection(projection), role)
    }

    /// Canonical dotted name used for checkpoints and optimizer slots.
    pub fn path(&self) -> String {
        let suffix = self.role.suffix();
        match self.component {
            Component::Embedding => format!("trunk.embed_tokens.{suffix}"),
            Component::FinalNorm => format!("trunk.norm.{suffix}"),
            Component::Head => format!("head.{suffix}"),
            Component::Block { index, module } => match module {
                BlockModule::InputNorm => format!("trunk.layers.{index}.input_layernorm.{suffix}"),
                BlockModule::PostAttentionNorm => {
                    format!("trunk.layers.{index}.post_attention_layernorm.{suffix}")
                }
                BlockModule::Projection(proj) => format!(
                    "trunk.layers.{index}.{}.{}.{suffix}",
                    proj.parent(),
                    proj.name()
                ),
            },
        }
    }

    pub fn is_head(&self) -> bool {
        matches!(self.component, Component::Head)
    }

    pub fn is_trunk(&self) -> bool {
        !self.is_head()
    }

    pub fn is_adapter(&self) -> bool {
        matches!(self.role, ParamRole::LoraA | ParamRole::LoraB)
    }

    pub fn is_norm(&self) -> bool {
        matches!(
            self.component,
            Component::FinalNorm
                | Component::Block {
                    module: BlockModule::InputNorm | BlockModule::PostAttentionNorm,
                    ..
                }
        )
    }

    pub fn block_index(&self) -> Option<usize> {
        match self.component {
            Component::Block { index, .. } => Some(index),
            _ => None,
        }
    }

    pub fn projection_kind(&self) -> Option<Projection> {
        match self.component {
            Component::Block {
                module: BlockModule::Projection(proj),
                ..
            } => Some(proj),
            _ => None,
        }
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Identifier to storage mapping produced by walking the model structure.
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    entries: BTreeMap<ParamId, Var>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, id: ParamId, var: &Var) {
        self.entries.insert(id, var.clone());
    }

    pub fn get(&self, id: &ParamId) -> Option<&Var> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ParamId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ParamId, Var> {
        self.entries.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParamId> + '_ {
        self.entries.keys()
    }

    /// Parameters paired with their canonical names, in registry order.
    pub fn named(&self) -> Vec<(String, Var)> {
        self.entries
            .iter()
            .map(|(id, var)| (id.path(), var.clone()))
            .collect()
    }

    /// Number of scalar elements across every registered tensor.
    pub fn element_count(&self) -> usize {
        self.entries
            .values()
            .map(|var| var.as_tensor().elem_count())
            .sum()
    }
}

/// Explicit set of parameters that receive gradients during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainablePartition {
    trainable: BTreeSet<ParamId>,
}

impl TrainablePartition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ParamId) -> bool {
        self.trainable.insert(id)
    }

    pub fn contains(&self, id: &ParamId) -> bool {
        self.trainable.contains(id)
    }

    pub fn len(&self) -> usize {
        self.trainable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trainable.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamId> + '_ {
        self.trainable.iter()
    }
}

impl FromIterator<ParamId> for TrainablePartition {
    fn from_iter<T: IntoIterator<Item = ParamId>>(iter: T) -> Self {
        Self {
            trainable: iter.into_iter().collect(),
        }
    }
}

impl Extend<ParamId> for TrainablePartition {
    fn extend<T: IntoIterator<Item = ParamId>>(&mut self, iter: T) {
        self.trainable.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_module_layout() {
        let q_bias = ParamId::projection(3, Projection::Query, ParamRole::Bias);
        assert_eq!(q_bias.path(), "trunk.layers.3.self_attn.q_proj.bias");

        let down_a = ParamId::projection(0, Projection::Down, ParamRole::LoraA);
        assert_eq!(down_a.path(), "trunk.layers.0.mlp.down_proj.lora_a");

        let norm = ParamId::block(1, BlockModule::PostAttentionNorm, ParamRole::Weight);
        assert_eq!(norm.path(), "trunk.layers.1.post_attention_layernorm.weight");
        assert!(norm.is_norm());

        let head = ParamId::new(Component::Head, ParamRole::Weight);
        assert_eq!(head.to_string(), "head.weight");
        assert!(head.is_head() && !head.is_trunk());
    }

    #[test]
    fn projection_names_round_trip() {
        for proj in Projection::ALL {
            assert_eq!(Projection::from_name(proj.name()), Some(proj));
        }
        assert_eq!(Projection::from_name("qkv_proj"), None);
    }
}
