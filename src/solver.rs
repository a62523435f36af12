//! Per-layer closed-form update
//!
//! For keys `K` (`[d_in, n]`), residual targets `R` (`[d_out, n]`) and the
//! key covariance `C` of layer `i` out of `L` edited layers:
//!
//! ```text
//! adj_K = (C + K Kᵀ)⁻¹ K          (LU solve, never an explicit inverse)
//! resid = R / (L - i)
//! upd   = resid adj_Kᵀ            ([d_out, d_in])
//! ```
//!
//! The `1 / (L - i)` shares are not renormalised: the last layer takes the
//! whole remaining residual, which by then has been shrunk by the earlier
//! layers' edits.

use anyhow::Result;
use candle_core::Tensor;
use tracing::debug;

use crate::cache::EditCache;
use crate::diagnostics::{EditDistances, InsideNorms};
use crate::hparams::EditHyperParams;
use crate::linalg;
use crate::weights::delta_update_matrix;

/// Delta computed for one layer, returned to the caller for insertion
#[derive(Debug, Clone)]
pub struct LayerDelta {
    pub layer: usize,
    pub weight_name: String,
    /// `[d_in, n]` regularised key directions, F64 on the host
    pub adj_keys: Tensor,
    /// `[d_out, n]` residual share assigned to this layer, F64 on the host
    pub resid: Tensor,
    pub distances: Option<EditDistances>,
    pub inside_norms: Option<InsideNorms>,
}

impl LayerDelta {
    /// Dense update `resid @ adj_keysᵀ` oriented like `weight`
    pub fn update_matrix(&self, weight: &Tensor) -> Result<Tensor> {
        delta_update_matrix(&self.adj_keys, &self.resid, weight)
    }
}

/// Share of the remaining residual assigned to the layer at `position`
pub fn residual_fraction(n_layers: usize, position: usize) -> f64 {
    1.0 / (n_layers - position) as f64
}

/// Repeat target columns so each key column has one.
///
/// With several keys per request (one per template) the targets of a
/// request are repeated in place.
pub fn align_targets(targets: &Tensor, n_keys: usize) -> Result<Tensor> {
    let (_, n_targets) = targets.dims2()?;
    anyhow::ensure!(n_targets > 0, "No targets to align");
    anyhow::ensure!(
        n_keys % n_targets == 0,
        "{n_keys} keys cannot be split evenly across {n_targets} targets"
    );
    linalg::repeat_interleave_columns(targets, n_keys / n_targets)
}

/// Covariance actually used in the solve for one layer.
///
/// Scales `cov` by `mom2_update_weight`, folds in the layer's edit history
/// when both `sequential` and `add_prev_edits` are set, then records this
/// batch's `K Kᵀ` in the history. The recording happens whatever the
/// options say.
pub fn prepare_covariance(
    cache: &mut EditCache,
    layer_name: &str,
    cov: &Tensor,
    keys: &Tensor,
    hparams: &EditHyperParams,
) -> Result<Tensor> {
    let mut cov = if (hparams.mom2_update_weight - 1.0).abs() > f64::EPSILON {
        cov.affine(hparams.mom2_update_weight, 0.0)?
    } else {
        cov.clone()
    };

    if hparams.sequential && hparams.add_prev_edits {
        if let Some(history) = cache.history(layer_name) {
            debug!("Folding previous edits into covariance of {layer_name}");
            let history = history.to_device(cov.device())?.to_dtype(cov.dtype())?;
            cov = cov.add(&history)?;
        }
    }

    let outer = key_outer_product(keys)?;
    cache.record_history(layer_name, &outer)?;

    Ok(cov)
}

/// `K Kᵀ`
pub fn key_outer_product(keys: &Tensor) -> Result<Tensor> {
    Ok(keys.matmul(&keys.t()?.contiguous()?)?)
}

/// `(C + K Kᵀ)⁻¹ K` by direct solve
pub fn solve_adjusted_keys(cov: &Tensor, keys: &Tensor) -> Result<Tensor> {
    let system = cov.add(&key_outer_product(keys)?)?;
    linalg::solve(&system, keys)
}

/// Intermediate results of one layer's solve
#[derive(Debug, Clone)]
pub struct LayerUpdate {
    /// `[d_in, n]`
    pub adj_keys: Tensor,
    /// `[d_out, n]`
    pub resid: Tensor,
    /// `[d_out, d_in]`, before orientation to the weight
    pub upd: Tensor,
}

/// Solve one layer. All inputs are expected in solve precision.
pub fn compute_layer_update(
    keys: &Tensor,
    targets: &Tensor,
    cov: &Tensor,
    position: usize,
    n_layers: usize,
) -> Result<LayerUpdate> {
    anyhow::ensure!(
        position < n_layers,
        "Layer position {position} out of range for {n_layers} layers"
    );
    let (_, n_keys) = keys.dims2()?;
    let (_, n_targets) = targets.dims2()?;
    anyhow::ensure!(
        n_keys == n_targets,
        "{n_keys} keys but {n_targets} targets after alignment"
    );

    let adj_keys = solve_adjusted_keys(cov, keys)?;
    let resid = targets.affine(residual_fraction(n_layers, position), 0.0)?;
    let upd = resid.matmul(&adj_keys.t()?.contiguous()?)?;

    Ok(LayerUpdate {
        adj_keys,
        resid,
        upd,
    })
}
