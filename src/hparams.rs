//! Hyperparameters for a MEMIT edit session
//!
//! Loaded from the same JSON layout the reference hyperparameter files use,
//! e.g.
//!
//! ```json
//! {
//!   "layers": [4, 5, 6, 7, 8],
//!   "fact_token": "subject_last",
//!   "clamp_norm_factor": 4,
//!   "rewrite_module_tmp": "transformer.h.{}.mlp.c_proj",
//!   "layer_module_tmp": "transformer.h.{}",
//!   "mom2_dataset": "wikipedia",
//!   "mom2_n_samples": 100000,
//!   "mom2_dtype": "float32",
//!   "mom2_update_weight": 15000
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Share of weight elements touched by the sparse insertion step
pub const DEFAULT_SPARSE_FRACTION: f64 = 0.4;

/// Strategy for locating the token whose activation is read for a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactToken {
    /// First token of the subject
    SubjectFirst,
    /// Last token of the subject
    #[default]
    SubjectLast,
    /// Last token of the whole prompt
    Last,
}

/// Hyperparameters consumed by the editor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditHyperParams {
    /// Layer indices to edit, in edit order. The last one is the target layer.
    pub layers: Vec<usize>,
    #[serde(default)]
    pub fact_token: FactToken,
    /// Norm clamp used by the target provider; also part of the cache file name
    #[serde(default = "default_clamp_norm_factor")]
    pub clamp_norm_factor: f64,
    /// Name template of the edited linear module, `{}` = layer index
    pub rewrite_module_tmp: String,
    /// Name template of the whole transformer block, `{}` = layer index
    pub layer_module_tmp: String,
    pub mom2_dataset: String,
    pub mom2_n_samples: usize,
    #[serde(default = "default_mom2_dtype")]
    pub mom2_dtype: String,
    #[serde(default = "default_mom2_update_weight")]
    pub mom2_update_weight: f64,
    /// Remember the key statistics of previous batches
    #[serde(default)]
    pub sequential: bool,
    /// Fold remembered key statistics into the covariance
    #[serde(default)]
    pub add_prev_edits: bool,
    /// Compute singular-value spectra during insertion (O(n^3))
    #[serde(default)]
    pub calculate_norms: bool,
    /// Compute preservation and edit distances per layer
    #[serde(default)]
    pub calculate_objective_value: bool,
    #[serde(default = "default_sparse_fraction")]
    pub sparse_fraction: f64,
}

fn default_clamp_norm_factor() -> f64 {
    4.0
}

fn default_mom2_dtype() -> String {
    "float32".to_string()
}

fn default_mom2_update_weight() -> f64 {
    1.0
}

fn default_sparse_fraction() -> f64 {
    DEFAULT_SPARSE_FRACTION
}

impl EditHyperParams {
    /// Load and validate hyperparameters from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hyperparameters {}", path.display()))?;
        let hparams: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse hyperparameters {}", path.display()))?;
        hparams.validate()?;
        Ok(hparams)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.layers.is_empty(), "At least one layer must be edited");
        for (i, layer) in self.layers.iter().enumerate() {
            anyhow::ensure!(
                !self.layers[..i].contains(layer),
                "Layer {layer} appears more than once in the edit order"
            );
        }
        anyhow::ensure!(
            self.rewrite_module_tmp.contains("{}"),
            "rewrite_module_tmp must contain a {{}} placeholder"
        );
        anyhow::ensure!(
            self.layer_module_tmp.contains("{}"),
            "layer_module_tmp must contain a {{}} placeholder"
        );
        anyhow::ensure!(
            self.mom2_update_weight.is_finite() && self.mom2_update_weight > 0.0,
            "mom2_update_weight must be positive, got {}",
            self.mom2_update_weight
        );
        anyhow::ensure!(
            self.sparse_fraction > 0.0 && self.sparse_fraction <= 1.0,
            "sparse_fraction must be in (0, 1], got {}",
            self.sparse_fraction
        );
        parse_dtype(&self.mom2_dtype)?;
        Ok(())
    }

    /// Layer whose output the targets are computed for
    pub fn z_layer(&self) -> Result<usize> {
        self.layers
            .last()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("No layers configured"))
    }

    /// Name of the edited module at `layer`
    pub fn rewrite_module(&self, layer: usize) -> String {
        fill_template(&self.rewrite_module_tmp, layer)
    }

    /// Name of the edited weight tensor at `layer`
    pub fn weight_name(&self, layer: usize) -> String {
        format!("{}.weight", self.rewrite_module(layer))
    }

    /// Name of the transformer block at `layer`
    pub fn layer_module(&self, layer: usize) -> String {
        fill_template(&self.layer_module_tmp, layer)
    }

    /// Precision the covariance statistics are accumulated in
    pub fn mom2_dtype(&self) -> Result<DType> {
        parse_dtype(&self.mom2_dtype)
    }
}

/// Substitute every `{}` in a module name template
pub fn fill_template(template: &str, value: impl std::fmt::Display) -> String {
    template.replace("{}", &value.to_string())
}

/// Map a precision name to a candle dtype
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name {
        "float32" | "f32" | "float" => Ok(DType::F32),
        "float64" | "f64" | "double" => Ok(DType::F64),
        "float16" | "f16" | "half" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        other => anyhow::bail!("Unsupported mom2_dtype: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "layers": [3, 4, 5],
            "fact_token": "subject_last",
            "rewrite_module_tmp": "transformer.h.{}.mlp.c_proj",
            "layer_module_tmp": "transformer.h.{}",
            "mom2_dataset": "wikipedia",
            "mom2_n_samples": 1000,
            "mom2_update_weight": 15000
        }"#
    }

    #[test]
    fn test_defaults_and_names() {
        let hparams: EditHyperParams = serde_json::from_str(sample_json()).unwrap();
        hparams.validate().unwrap();

        assert_eq!(hparams.z_layer().unwrap(), 5);
        assert_eq!(hparams.weight_name(4), "transformer.h.4.mlp.c_proj.weight");
        assert_eq!(hparams.layer_module(5), "transformer.h.5");
        assert_eq!(hparams.fact_token, FactToken::SubjectLast);
        assert!(!hparams.sequential);
        assert!(!hparams.add_prev_edits);
        assert!((hparams.sparse_fraction - 0.4).abs() < 1e-12);
        assert_eq!(hparams.mom2_dtype().unwrap(), DType::F32);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut hparams: EditHyperParams = serde_json::from_str(sample_json()).unwrap();
        hparams.layers = vec![3, 4, 3];
        assert!(hparams.validate().is_err());

        hparams.layers = vec![];
        assert!(hparams.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut hparams: EditHyperParams = serde_json::from_str(sample_json()).unwrap();
        hparams.sparse_fraction = 0.0;
        assert!(hparams.validate().is_err());
        hparams.sparse_fraction = 1.5;
        assert!(hparams.validate().is_err());
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!(parse_dtype("float64").unwrap(), DType::F64);
        assert_eq!(parse_dtype("bf16").unwrap(), DType::BF16);
        assert!(parse_dtype("int8").is_err());
    }
}
