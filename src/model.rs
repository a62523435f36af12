//! Model-facing traits for editing
//!
//! The editor never loads or runs a transformer itself. A backend exposes its
//! weights by name and the activations around a named module; the editor
//! drives everything else.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::Tensor;

use crate::hparams::{EditHyperParams, FactToken};
use crate::request::EditRequest;
use crate::templates::ContextTemplates;

/// Named access to a model's weight tensors
pub trait WeightStore {
    /// Identity used to key cached statistics (e.g. `"gpt2-xl"`)
    fn model_name(&self) -> &str;

    /// Current value of a weight
    fn weight(&self, name: &str) -> Result<Tensor>;

    /// Replace a weight. The new value must keep the shape and dtype.
    fn set_weight(&mut self, name: &str, value: Tensor) -> Result<()>;
}

/// A causal LM backend the editor can read activations from.
///
/// Every forward-pass hook takes a [`WeightOverlay`]: weights present in the
/// overlay replace the model's own for that call. This is how later layers
/// observe the staged edits of earlier layers without the model being
/// mutated.
pub trait EditableModel: WeightStore {
    /// Input and output activations of `module` at the word position chosen
    /// by `fact_token`, one row per context.
    ///
    /// `contexts[i]` contains a `{}` placeholder that is filled with
    /// `words[i]`. Returns `(inputs [n, d_in], outputs [n, d_out])`.
    fn module_io_at_words(
        &self,
        module: &str,
        contexts: &[String],
        words: &[String],
        fact_token: FactToken,
        overlay: &WeightOverlay,
    ) -> Result<(Tensor, Tensor)>;

    /// Sample `n_gen_per_prompt` continuations of each prefix, at most
    /// `max_out_len` tokens long (prefix included)
    fn generate(
        &self,
        prefixes: &[&str],
        n_gen_per_prompt: usize,
        max_out_len: usize,
    ) -> Result<Vec<String>>;
}

/// Desired hidden state for one request at the target layer
#[derive(Debug, Clone)]
pub struct TargetRepresentation {
    /// `[d_out]` target vector
    pub z: Tensor,
    /// Norm of the optimised change applied to the initial representation
    pub delta_norm: f64,
    /// Norm of the representation before optimisation
    pub init_norm: f64,
}

/// Computes the target representation of a request
pub trait TargetProvider<M: EditableModel + ?Sized> {
    fn compute_target(
        &self,
        model: &M,
        request: &EditRequest,
        hparams: &EditHyperParams,
        layer: usize,
        templates: &ContextTemplates,
    ) -> Result<TargetRepresentation>;
}

/// Weights staged on top of a model for the duration of a computation
#[derive(Debug, Clone, Default)]
pub struct WeightOverlay {
    weights: HashMap<String, Tensor>,
}

impl WeightOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a weight, replacing any previously staged value
    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) {
        self.weights.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.weights.get(name)
    }

    /// Staged value if any, otherwise the store's current weight
    pub fn resolve<S: WeightStore + ?Sized>(&self, store: &S, name: &str) -> Result<Tensor> {
        match self.weights.get(name) {
            Some(t) => Ok(t.clone()),
            None => store.weight(name),
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::WeightMap;
    use candle_core::{DType, Device};

    #[test]
    fn test_overlay_shadows_store() {
        let mut store = WeightMap::new("toy");
        let base = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        store.insert("w", base);

        let mut overlay = WeightOverlay::new();
        assert!(overlay.is_empty());

        let resolved = overlay.resolve(&store, "w").unwrap();
        assert_eq!(resolved.to_vec2::<f32>().unwrap(), vec![vec![0.0; 2]; 2]);

        overlay.insert("w", Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap());
        let resolved = overlay.resolve(&store, "w").unwrap();
        assert_eq!(resolved.to_vec2::<f32>().unwrap(), vec![vec![1.0; 2]; 2]);
        assert_eq!(overlay.len(), 1);

        // The store itself is untouched
        let stored = store.weight("w").unwrap();
        assert_eq!(stored.to_vec2::<f32>().unwrap(), vec![vec![0.0; 2]; 2]);

        assert!(overlay.resolve(&store, "missing").is_err());
    }
}
