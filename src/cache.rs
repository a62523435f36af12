//! Session caches for the update computation
//!
//! Three independent stores live here:
//!
//! - context templates (one slot, filled once)
//! - covariance statistics per `(model, layer)` with their preserved keys
//! - sequential edit history (`Σ K Kᵀ`) per layer
//!
//! The store is owned by an edit session and passed by reference; nothing is
//! process-global, so independent runs never see each other's state.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::templates::ContextTemplates;

/// Cached second-moment statistics for one layer
#[derive(Debug, Clone)]
pub struct CovarianceEntry {
    /// `[d_in, d_in]` second moment, stored as F32 on the host
    pub mom2: Tensor,
    /// `[n_preserved, d_in]` reference keys for preservation diagnostics
    pub preserved_keys: Tensor,
}

/// Caches shared by every batch of an edit session
#[derive(Debug, Default)]
pub struct EditCache {
    context_templates: Option<ContextTemplates>,
    covariance: HashMap<(String, String), CovarianceEntry>,
    history: HashMap<String, Tensor>,
}

impl EditCache {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Context templates ---

    pub fn context_templates(&self) -> Option<&ContextTemplates> {
        self.context_templates.as_ref()
    }

    /// Return the cached templates, building them on first use
    pub fn context_templates_or_try_insert_with<F>(&mut self, build: F) -> Result<&ContextTemplates>
    where
        F: FnOnce() -> Result<ContextTemplates>,
    {
        let templates = match self.context_templates.take() {
            Some(templates) => templates,
            None => build()?,
        };
        Ok(self.context_templates.insert(templates))
    }

    // --- Covariance ---

    pub fn covariance(&self, model_name: &str, layer_name: &str) -> Option<&CovarianceEntry> {
        self.covariance
            .get(&(model_name.to_string(), layer_name.to_string()))
    }

    /// Store statistics for a layer, replacing any previous entry.
    ///
    /// The second moment is kept as F32 on the host.
    pub fn insert_covariance(
        &mut self,
        model_name: &str,
        layer_name: &str,
        mom2: &Tensor,
        preserved_keys: Tensor,
    ) -> Result<&CovarianceEntry> {
        let entry = CovarianceEntry {
            mom2: mom2.to_dtype(DType::F32)?.to_device(&Device::Cpu)?,
            preserved_keys,
        };
        let key = (model_name.to_string(), layer_name.to_string());
        self.covariance.insert(key.clone(), entry);
        Ok(&self.covariance[&key])
    }

    pub fn n_covariance_entries(&self) -> usize {
        self.covariance.len()
    }

    // --- Sequential history ---

    /// Accumulated `Σ K Kᵀ` for a layer, if any batch touched it
    pub fn history(&self, layer_name: &str) -> Option<&Tensor> {
        self.history.get(layer_name)
    }

    /// Add a batch's key outer product into the layer's history.
    ///
    /// Creates the entry when absent. Stored on the host.
    pub fn record_history(&mut self, layer_name: &str, outer: &Tensor) -> Result<()> {
        let outer = outer.to_device(&Device::Cpu)?;
        let updated = match self.history.get(layer_name) {
            Some(prev) => prev.add(&outer.to_dtype(prev.dtype())?)?,
            None => outer,
        };
        self.history.insert(layer_name.to_string(), updated);
        Ok(())
    }

    pub fn n_history_entries(&self) -> usize {
        self.history.len()
    }

    /// Forget all sequential history
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Drop every cached value
    pub fn reset(&mut self) {
        self.context_templates = None;
        self.covariance.clear();
        self.history.clear();
    }

    /// Estimate memory held by cached tensors in bytes
    pub fn memory_usage(&self) -> usize {
        let cov_mem: usize = self
            .covariance
            .values()
            .map(|e| tensor_bytes(&e.mom2) + tensor_bytes(&e.preserved_keys))
            .sum();
        let history_mem: usize = self.history.values().map(tensor_bytes).sum();
        cov_mem + history_mem
    }
}

fn tensor_bytes(t: &Tensor) -> usize {
    t.elem_count() * t.dtype().size_in_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cache_is_empty() {
        let cache = EditCache::new();
        assert!(cache.context_templates().is_none());
        assert_eq!(cache.n_covariance_entries(), 0);
        assert_eq!(cache.n_history_entries(), 0);
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn test_templates_built_once() {
        let mut cache = EditCache::new();
        let mut calls = 0;
        for _ in 0..3 {
            cache
                .context_templates_or_try_insert_with(|| {
                    calls += 1;
                    Ok(ContextTemplates::new(vec![vec!["{}".to_string()]]))
                })
                .unwrap();
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.context_templates().unwrap().n_templates(), 1);
    }

    #[test]
    fn test_covariance_stored_as_host_f32() {
        let mut cache = EditCache::new();
        let mom2 = Tensor::eye(3, DType::F64, &Device::Cpu).unwrap();
        let keys = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        cache.insert_covariance("gpt2", "h.1.mlp", &mom2, keys).unwrap();

        let entry = cache.covariance("gpt2", "h.1.mlp").unwrap();
        assert_eq!(entry.mom2.dtype(), DType::F32);
        assert!(cache.covariance("gpt2", "h.2.mlp").is_none());
        assert_eq!(cache.memory_usage(), 9 * 4 + 6 * 4);
    }

    #[test]
    fn test_history_accumulates() {
        let mut cache = EditCache::new();
        let a = Tensor::new(&[[1.0f64, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[2.0f64, 1.0], [1.0, 2.0]], &Device::Cpu).unwrap();

        cache.record_history("l", &a).unwrap();
        cache.record_history("l", &b).unwrap();

        let h = cache.history("l").unwrap().to_vec2::<f64>().unwrap();
        assert_eq!(h, vec![vec![3.0, 1.0], vec![1.0, 3.0]]);

        cache.clear_history();
        assert!(cache.history("l").is_none());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut cache = EditCache::new();
        cache
            .context_templates_or_try_insert_with(|| Ok(ContextTemplates::plain()))
            .unwrap();
        let eye = Tensor::eye(2, DType::F32, &Device::Cpu).unwrap();
        cache
            .insert_covariance("m", "l", &eye, eye.clone())
            .unwrap();
        cache.record_history("l", &eye).unwrap();

        cache.reset();
        assert!(cache.context_templates().is_none());
        assert_eq!(cache.n_covariance_entries(), 0);
        assert_eq!(cache.n_history_entries(), 0);
    }
}
