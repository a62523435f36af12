//! Norms, spectra and distances reported for each edited layer

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Serialize;

use crate::linalg;

/// Mean L2 norm of the columns of a 2-D tensor
pub fn mean_column_norm(tensor: &Tensor) -> Result<f64> {
    Ok(tensor
        .to_dtype(DType::F64)?
        .sqr()?
        .sum(0)?
        .sqrt()?
        .mean_all()?
        .to_scalar::<f64>()?)
}

/// Mean L2 norm of the rows of a 2-D tensor
pub fn mean_row_norm(tensor: &Tensor) -> Result<f64> {
    Ok(tensor
        .to_dtype(DType::F64)?
        .sqr()?
        .sum(1)?
        .sqrt()?
        .mean_all()?
        .to_scalar::<f64>()?)
}

/// Frobenius norm
pub fn frobenius_norm(tensor: &Tensor) -> Result<f64> {
    Ok(tensor
        .to_dtype(DType::F64)?
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_scalar::<f64>()?)
}

/// Singular values, largest first. Full SVD, O(n³).
pub fn singular_values(tensor: &Tensor) -> Result<Vec<f64>> {
    linalg::singular_values(tensor)
}

/// Norms of the intermediate quantities of one layer's solve
#[derive(Debug, Clone, Default, Serialize)]
pub struct InsideNorms {
    pub zs_norm: f64,
    pub cur_zs_norm: f64,
    pub layer_ks_norm: f64,
    pub adj_norm: f64,
    pub residual_norm: f64,
    pub inside_update_norm: f64,
    pub cov: f64,
}

/// How far an update moved preserved and edited projections
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EditDistances {
    /// Mean norm of the change in preserved-key outputs
    pub preservation_distance: f64,
    /// Mean distance of edited outputs from their targets after the update
    pub new_edit_distance: f64,
    /// Same distance before the update
    pub old_edit_distance: f64,
}

/// Compare a weight before and after an update.
///
/// Weights are read as `[d_out, d_in]` maps (transposed if stored the
/// other way round). `keys` is `[d_in, n]`, `targets` `[d_out, n]`,
/// `preserved_keys` `[n_preserved, d_in]`.
pub fn calculate_distances(
    original: &Tensor,
    updated: &Tensor,
    keys: &Tensor,
    targets: &Tensor,
    preserved_keys: &Tensor,
) -> Result<EditDistances> {
    let (d_in, _) = keys.dims2()?;
    let (d_out, _) = targets.dims2()?;
    let orient = |w: &Tensor| -> Result<Tensor> {
        let w = w.to_dtype(DType::F64)?;
        if w.dims() == [d_out, d_in] {
            Ok(w)
        } else if w.dims() == [d_in, d_out] {
            Ok(w.t()?.contiguous()?)
        } else {
            anyhow::bail!(
                "Weight shape {:?} does not map {d_in} inputs to {d_out} outputs",
                w.dims()
            )
        }
    };
    let w_old = orient(original)?;
    let w_new = orient(updated)?;

    let keys = keys.to_device(w_old.device())?.to_dtype(DType::F64)?;
    let targets = targets.to_device(w_old.device())?.to_dtype(DType::F64)?;
    let preserved = preserved_keys
        .to_device(w_old.device())?
        .to_dtype(DType::F64)?
        .t()?
        .contiguous()?;

    let preserved_shift = w_new.sub(&w_old)?.matmul(&preserved)?;
    let new_gap = w_new.matmul(&keys)?.sub(&targets)?;
    let old_gap = w_old.matmul(&keys)?.sub(&targets)?;

    Ok(EditDistances {
        preservation_distance: mean_column_norm(&preserved_shift)?,
        new_edit_distance: mean_column_norm(&new_gap)?,
        old_edit_distance: mean_column_norm(&old_gap)?,
    })
}

/// Norms recorded for a request whose target was computed (not loaded)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZNorms {
    pub delta: f64,
    pub init_norm: f64,
    pub final_norm: f64,
}

/// Per-layer insertion report
#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub weight_name: String,
    pub distances: Option<EditDistances>,
    pub delta_norm: f64,
    pub new_weights_norm: f64,
    pub original_weights_norm: f64,
    pub inside_norms: Option<InsideNorms>,
    pub svd_final: Option<Vec<f64>>,
    pub svd_upd: Option<Vec<f64>>,
}

/// Everything measured during one `apply_edits` call
#[derive(Debug, Clone, Default, Serialize)]
pub struct DistancesReport {
    /// Keyed by request position in the batch
    pub z_norms: BTreeMap<usize, ZNorms>,
    /// Keyed by layer index
    pub layers: BTreeMap<usize, LayerReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_norms() {
        // Columns (3, 4) and (0, 0): norms 5 and 0
        let t = Tensor::new(&[[3.0f32, 0.0], [4.0, 0.0]], &Device::Cpu).unwrap();
        assert!((mean_column_norm(&t).unwrap() - 2.5).abs() < 1e-12);
        // Rows (3, 0) and (4, 0): norms 3 and 4
        assert!((mean_row_norm(&t).unwrap() - 3.5).abs() < 1e-12);
        assert!((frobenius_norm(&t).unwrap() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_distances_for_exact_edit() {
        let dev = Device::Cpu;
        let original = Tensor::zeros((2, 3), DType::F32, &dev).unwrap();
        // Maps e0 -> (1, 2), leaves e2 untouched
        let updated = Tensor::new(&[[1.0f32, 0.0, 0.0], [2.0, 0.0, 0.0]], &dev).unwrap();
        let keys = Tensor::new(&[[1.0f64], [0.0], [0.0]], &dev).unwrap();
        let targets = Tensor::new(&[[1.0f64], [2.0]], &dev).unwrap();
        let preserved = Tensor::new(&[[0.0f32, 0.0, 1.0]], &dev).unwrap();

        let d = calculate_distances(&original, &updated, &keys, &targets, &preserved).unwrap();
        assert!(d.preservation_distance.abs() < 1e-12);
        assert!(d.new_edit_distance.abs() < 1e-12);
        assert!((d.old_edit_distance - 5.0f64.sqrt()).abs() < 1e-12);

        // Transposed storage gives the same answer
        let d_t = calculate_distances(
            &original.t().unwrap(),
            &updated.t().unwrap(),
            &keys,
            &targets,
            &preserved,
        )
        .unwrap();
        assert_eq!(d, d_t);
    }

    #[test]
    fn test_distances_reject_wrong_shape() {
        let dev = Device::Cpu;
        let w = Tensor::zeros((4, 4), DType::F32, &dev).unwrap();
        let keys = Tensor::zeros((3, 1), DType::F64, &dev).unwrap();
        let targets = Tensor::zeros((2, 1), DType::F64, &dev).unwrap();
        let preserved = Tensor::zeros((1, 3), DType::F32, &dev).unwrap();
        assert!(calculate_distances(&w, &w, &keys, &targets, &preserved).is_err());
    }
}
