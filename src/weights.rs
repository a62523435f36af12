//! Weight access and delta insertion
//!
//! # Sparse insertion
//!
//! A delta is not added densely. For an update `U` against weight `W` the
//! relative impact of each element is
//!
//! ```text
//! rel = |U / (W + 1e-8)|
//! ```
//!
//! and only the `fraction` share of elements with the largest `rel` is
//! written (`W[mask] += U[mask]`). Every other element keeps its exact value.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::SafeTensors;
use tracing::info;

use crate::hparams::EditHyperParams;
use crate::model::WeightStore;
use crate::solver::LayerDelta;

/// Guards the relative-magnitude division against zero weights
pub const RELATIVE_EPSILON: f64 = 1e-8;

/// Named weight tensors held in memory
#[derive(Debug, Clone)]
pub struct WeightMap {
    model_name: String,
    tensors: HashMap<String, Tensor>,
}

impl WeightMap {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            tensors: HashMap::new(),
        }
    }

    /// Load every tensor of a safetensors file
    pub fn from_safetensors(
        model_name: impl Into<String>,
        path: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let data =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to parse safetensors {}", path.display()))?;

        let mut tensors = HashMap::new();
        for (name, view) in st.tensors() {
            tensors.insert(name, tensor_from_view(&view, device)?);
        }
        info!("Loaded {} tensors from {}", tensors.len(), path.display());

        Ok(Self {
            model_name: model_name.into(),
            tensors,
        })
    }

    /// Write every tensor to a safetensors file
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        candle_core::safetensors::save(&self.tensors, path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Add or replace a tensor without shape checks
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl WeightStore for WeightMap {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn weight(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Weight {name} not found in {}", self.model_name))
    }

    fn set_weight(&mut self, name: &str, value: Tensor) -> Result<()> {
        let current = self
            .tensors
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("Weight {name} not found in {}", self.model_name))?;
        anyhow::ensure!(
            current.dims() == value.dims(),
            "Weight {name}: new shape {:?} does not match {:?}",
            value.dims(),
            current.dims()
        );
        anyhow::ensure!(
            current.dtype() == value.dtype(),
            "Weight {name}: new dtype {:?} does not match {:?}",
            value.dtype(),
            current.dtype()
        );
        *current = value;
        Ok(())
    }
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        other => anyhow::bail!("Unsupported weight dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

/// Orient an update to a weight's shape.
///
/// Some architectures store linear weights as `[d_in, d_out]`, others as
/// `[d_out, d_in]`. Returns `matrix` or its transpose, whichever matches;
/// fails if neither does.
pub fn upd_matrix_match_shape(matrix: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let (rows, cols) = matrix.dims2()?;
    if shape == [rows, cols] {
        Ok(matrix.clone())
    } else if shape == [cols, rows] {
        Ok(matrix.t()?.contiguous()?)
    } else {
        anyhow::bail!(
            "Update matrix of shape {:?} does not match weight shape {shape:?} in either orientation",
            matrix.dims()
        )
    }
}

/// Number of elements the sparse insertion writes
pub fn sparse_keep_count(numel: usize, fraction: f64) -> usize {
    ((numel as f64 * fraction).round() as usize).min(numel)
}

/// Write the `fraction` share of `update` with the largest relative impact.
///
/// `update` must already have the weight's shape. Returns the new weight in
/// the weight's dtype; unselected elements are bit-identical to `weight`.
pub fn sparse_update(weight: &Tensor, update: &Tensor, fraction: f64) -> Result<Tensor> {
    anyhow::ensure!(
        fraction > 0.0 && fraction <= 1.0,
        "Sparse fraction must be in (0, 1], got {fraction}"
    );
    anyhow::ensure!(
        weight.dims() == update.dims(),
        "Update shape {:?} does not match weight shape {:?}",
        update.dims(),
        weight.dims()
    );

    let update = update.to_device(weight.device())?;
    let w64 = weight.to_dtype(DType::F64)?;
    let rel = update
        .to_dtype(DType::F64)?
        .div(&w64.affine(1.0, RELATIVE_EPSILON)?)?
        .abs()?;

    let keep = sparse_keep_count(rel.elem_count(), fraction);
    if keep == 0 {
        return Ok(weight.clone());
    }

    let mut values: Vec<f64> = rel.flatten_all()?.to_vec1()?;
    let nth = keep - 1;
    let (_, threshold, _) = values.select_nth_unstable_by(nth, |a, b| b.total_cmp(a));
    let threshold = *threshold;

    let mask = rel.ge(&Tensor::full(threshold, rel.dims(), rel.device())?)?;
    let candidate = weight.add(&update.to_dtype(weight.dtype())?)?;
    Ok(mask.where_cond(&candidate, weight)?)
}

/// Apply a `(key_mat, val_mat)` delta sparsely.
///
/// The full update is `key_mat @ val_matᵀ`, oriented to the weight's shape
/// by [`delta_update_matrix`].
pub fn apply_delta_sparse(
    weight: &Tensor,
    key_mat: &Tensor,
    val_mat: &Tensor,
    fraction: f64,
) -> Result<Tensor> {
    let update = delta_update_matrix(key_mat, val_mat, weight)?;
    sparse_update(weight, &update, fraction)
}

/// Dense update from a `(key_mat, val_mat)` delta, oriented like `weight`.
///
/// Built as `(key_mat @ val_matᵀ)ᵀ = val_mat @ key_matᵀ`, i.e. laid out
/// `[d_out, d_in]` like the solver's update, so a square weight is read the
/// same way by both.
pub fn delta_update_matrix(key_mat: &Tensor, val_mat: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let key_mat = key_mat.to_device(weight.device())?.to_dtype(DType::F64)?;
    let val_mat = val_mat.to_device(weight.device())?.to_dtype(DType::F64)?;
    let update = val_mat.matmul(&key_mat.t()?.contiguous()?)?;
    upd_matrix_match_shape(&update, weight.dims())
}

fn delta_tensor_name(weight_name: &str, part: &str) -> String {
    format!("{weight_name}::{part}")
}

/// Persist deltas as `<weight>::adj_k` / `<weight>::resid` pairs
pub fn save_deltas(deltas: &[LayerDelta], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut tensors = HashMap::new();
    for delta in deltas {
        tensors.insert(
            delta_tensor_name(&delta.weight_name, "adj_k"),
            delta.adj_keys.clone(),
        );
        tensors.insert(
            delta_tensor_name(&delta.weight_name, "resid"),
            delta.resid.clone(),
        );
    }
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("Failed to write deltas to {}", path.display()))?;
    info!("Saved {} deltas to {}", deltas.len(), path.display());
    Ok(())
}

/// Load deltas written by [`save_deltas`], in edit order.
///
/// Diagnostics are not persisted, so the loaded deltas carry none.
pub fn load_deltas(hparams: &EditHyperParams, path: impl AsRef<Path>) -> Result<Vec<LayerDelta>> {
    let path = path.as_ref();
    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("Failed to read deltas from {}", path.display()))?;

    let mut deltas = Vec::with_capacity(hparams.layers.len());
    for &layer in &hparams.layers {
        let weight_name = hparams.weight_name(layer);
        let mut take = |part: &str| {
            let name = delta_tensor_name(&weight_name, part);
            tensors
                .remove(&name)
                .ok_or_else(|| anyhow::anyhow!("{} has no tensor {name}", path.display()))
        };
        let adj_keys = take("adj_k")?;
        let resid = take("resid")?;
        deltas.push(LayerDelta {
            layer,
            weight_name,
            adj_keys,
            resid,
            distances: None,
            inside_norms: None,
        });
    }
    anyhow::ensure!(
        tensors.is_empty(),
        "{} holds deltas for layers not in the edit order",
        path.display()
    );
    Ok(deltas)
}
