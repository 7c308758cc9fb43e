//! Hybrid text/graph model.
//!
//! A text encoder produces a dense row per document, a linear head turns that
//! row into a fast "skip" prediction, and a propagation layer runs over the
//! whole graph using the embedding cache. The two predictions are blended by
//! a fixed convex mix.
//!
//! Parameters live in three `VarMap`s (encoder, classifier head, propagation)
//! so that they can be optimized with separate learning rates and restored
//! independently from a checkpoint.

pub mod encoder;
pub mod gat;
pub mod gcn;
pub mod hybrid;
pub mod mix;
pub mod propagation;

pub use encoder::{PooledTextEncoder, TextEncoder};
pub use gat::GatPropagation;
pub use gcn::GcnPropagation;
pub use hybrid::{HybridModel, Prediction};
pub use mix::ConvexMix;
pub use propagation::{PropagationKind, PropagationLayer};

use std::collections::{BTreeMap, HashMap};

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{TrainError, TrainResult};

/// Whether a forward pass may use stochastic layers and fresh encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    pub fn is_train(self) -> bool {
        self == Self::Train
    }
}

/// One of the three independently stored parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Encoder,
    Classifier,
    Propagation,
}

impl Component {
    pub const ALL: [Component; 3] = [Self::Encoder, Self::Classifier, Self::Propagation];

    /// Name prefix used for this component in checkpoint files.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Encoder => "encoder",
            Self::Classifier => "classifier",
            Self::Propagation => "propagation",
        }
    }
}

/// Trainable parameters of a [`HybridModel`], grouped by component.
pub struct ModelParams {
    encoder: VarMap,
    classifier: VarMap,
    propagation: VarMap,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelParams {
    pub fn new() -> Self {
        Self {
            encoder: VarMap::new(),
            classifier: VarMap::new(),
            propagation: VarMap::new(),
        }
    }

    pub fn varmap(&self, component: Component) -> &VarMap {
        match component {
            Component::Encoder => &self.encoder,
            Component::Classifier => &self.classifier,
            Component::Propagation => &self.propagation,
        }
    }

    /// Variables of one component, sorted by name.
    pub fn named_vars(&self, component: Component) -> TrainResult<Vec<(String, Var)>> {
        let data = self
            .varmap(component)
            .data()
            .lock()
            .map_err(|_| TrainError::Config("parameter store lock poisoned".into()))?;
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// Tensors of one component keyed `"<prefix>.<name>"`.
    pub fn named_tensors(&self, component: Component) -> TrainResult<Vec<(String, Tensor)>> {
        Ok(self
            .named_vars(component)?
            .into_iter()
            .map(|(name, var)| {
                (
                    format!("{}.{}", component.prefix(), name),
                    var.as_tensor().detach(),
                )
            })
            .collect())
    }

    /// Overwrite one component from prefixed tensors. Every variable must be present.
    pub fn load_component(
        &self,
        component: Component,
        tensors: &HashMap<String, Tensor>,
    ) -> TrainResult<usize> {
        self.load_components(&[component], tensors)
    }

    /// Overwrite several components together.
    ///
    /// Every key and shape is checked before the first variable is written, so
    /// a failed load leaves all parameters as they were.
    pub fn load_components(
        &self,
        components: &[Component],
        tensors: &HashMap<String, Tensor>,
    ) -> TrainResult<usize> {
        let mut updates = Vec::new();
        for &component in components {
            for (name, var) in self.named_vars(component)? {
                let key = format!("{}.{}", component.prefix(), name);
                let tensor = tensors
                    .get(&key)
                    .ok_or_else(|| TrainError::Config(format!("missing tensor '{}'", key)))?;
                if tensor.dims() != var.dims() {
                    return Err(TrainError::Config(format!(
                        "tensor '{}' has shape {:?}, expected {:?}",
                        key,
                        tensor.dims(),
                        var.dims()
                    )));
                }
                let value = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
                updates.push((var, value));
            }
        }
        for (var, value) in &updates {
            var.set(value)?;
        }
        Ok(updates.len())
    }

    /// Host copy of every parameter, keyed like [`named_tensors`](Self::named_tensors).
    pub fn snapshot(&self) -> TrainResult<BTreeMap<String, Vec<f32>>> {
        let mut out = BTreeMap::new();
        for component in Component::ALL {
            for (name, tensor) in self.named_tensors(component)? {
                out.insert(name, tensor.flatten_all()?.to_vec1::<f32>()?);
            }
        }
        Ok(out)
    }

    pub fn parameter_count(&self) -> TrainResult<usize> {
        let mut total = 0;
        for component in Component::ALL {
            for (_, var) in self.named_vars(component)? {
                total += var.elem_count();
            }
        }
        Ok(total)
    }
}
