//! Edit session: target computation, per-layer solve and insertion
//!
//! [`MemitEditor`] owns the session state (hyperparameters, device policy,
//! caches) and drives a batch of requests through the pipeline:
//!
//! 1. targets `Z` at the last edited layer, optionally served from disk
//! 2. for each edited layer, keys and residuals from the model as seen
//!    through the edits staged so far, then the closed-form update
//! 3. (in [`MemitEditor::apply_edits`]) sparse insertion into the model
//!
//! [`MemitEditor::execute`] only reads the model. Staged weights live in a
//! [`WeightOverlay`] that is dropped when the call returns.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use candle_core::Tensor;
use tracing::{debug, info};

use crate::cache::EditCache;
use crate::context::ComputeContext;
use crate::covariance::{get_covariance, StatsProvider, StatsQuery};
use crate::diagnostics::{
    calculate_distances, frobenius_norm, mean_column_norm, singular_values, DistancesReport,
    InsideNorms, LayerReport, ZNorms,
};
use crate::hparams::EditHyperParams;
use crate::keys::compute_ks;
use crate::model::{EditableModel, TargetProvider, WeightOverlay, WeightStore};
use crate::request::EditRequest;
use crate::solver::{align_targets, compute_layer_update, prepare_covariance, LayerDelta};
use crate::target_cache::TargetCache;
use crate::templates::{get_context_templates, ContextTemplates};
use crate::weights::{sparse_update, upd_matrix_match_shape};

/// Number of requests echoed to the log before a batch
const LOGGED_REQUESTS: usize = 10;

/// Result of [`MemitEditor::execute`]
#[derive(Debug, Clone)]
pub struct EditComputation {
    /// One delta per edited layer, in edit order
    pub deltas: Vec<LayerDelta>,
    /// Keyed by request position; only requests whose target was computed
    pub z_norms: BTreeMap<usize, ZNorms>,
    pub z_computation_time: Duration,
    /// Summed per-layer time from layer start until the update is formed
    pub insertion_time: Duration,
}

/// Result of [`MemitEditor::apply_edits`]
#[derive(Debug, Clone)]
pub struct EditOutcome {
    /// Pre-edit values of the changed weights, empty unless requested
    pub weights_copy: HashMap<String, Tensor>,
    pub distances: DistancesReport,
    pub z_computation_time: Duration,
    pub insertion_time: Duration,
}

/// Weights written by [`insert_deltas`]
#[derive(Debug, Clone, Default)]
pub struct Insertion {
    pub weights_copy: HashMap<String, Tensor>,
    /// Keyed by layer index
    pub layers: BTreeMap<usize, LayerReport>,
}

/// A MEMIT edit session
pub struct MemitEditor {
    hparams: EditHyperParams,
    ctx: ComputeContext,
    cache: EditCache,
    target_cache: Option<TargetCache>,
}

impl MemitEditor {
    pub fn new(hparams: EditHyperParams, ctx: ComputeContext) -> Result<Self> {
        hparams.validate()?;
        Ok(Self {
            hparams,
            ctx,
            cache: EditCache::new(),
            target_cache: None,
        })
    }

    /// Read and write computed targets through a file-name template
    pub fn with_target_cache(mut self, target_cache: TargetCache) -> Self {
        self.target_cache = Some(target_cache);
        self
    }

    pub fn hparams(&self) -> &EditHyperParams {
        &self.hparams
    }

    pub fn context(&self) -> &ComputeContext {
        &self.ctx
    }

    pub fn cache(&self) -> &EditCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut EditCache {
        &mut self.cache
    }

    /// Compute the per-layer deltas for a batch without touching the model
    pub fn execute<M: EditableModel + ?Sized>(
        &mut self,
        model: &M,
        targets: &dyn TargetProvider<M>,
        stats: &dyn StatsProvider,
        requests: &[EditRequest],
    ) -> Result<EditComputation> {
        anyhow::ensure!(!requests.is_empty(), "No edit requests given");
        let hparams = self.hparams.clone();

        let requests: Vec<EditRequest> = requests.iter().map(EditRequest::normalized).collect();
        for request in requests.iter().take(LOGGED_REQUESTS) {
            info!(
                "MEMIT request sample: [{}] -> [{}]",
                request.rendered_prompt(),
                request.target_new.text
            );
        }

        // Fail on a missing weight before any expensive work
        let weight_names: Vec<String> = hparams
            .layers
            .iter()
            .map(|&layer| hparams.weight_name(layer))
            .collect();
        for name in &weight_names {
            model
                .weight(name)
                .with_context(|| format!("Edited weight {name} is not available"))?;
        }

        let templates = get_context_templates(&mut self.cache, model)?.clone();
        let z_layer = hparams.z_layer()?;

        let start = Instant::now();
        let (zs, z_norms) = self.compute_targets(model, targets, &requests, z_layer, &templates)?;
        let z_computation_time = start.elapsed();

        let prompts: Vec<String> = requests.iter().map(|r| r.prompt.clone()).collect();
        let subjects: Vec<String> = requests.iter().map(|r| r.subject.clone()).collect();

        let mut overlay = WeightOverlay::new();
        let mut deltas = Vec::with_capacity(hparams.layers.len());
        let mut insertion_time = Duration::ZERO;

        for (i, &layer) in hparams.layers.iter().enumerate() {
            let layer_start = Instant::now();
            info!("LAYER {layer}");

            let layer_ks = compute_ks(model, &requests, &hparams, layer, &templates, &overlay)?;
            let layer_ks = self.ctx.to_solve(&layer_ks.t()?.contiguous()?)?;
            let (_, n_keys) = layer_ks.dims2()?;
            info!("Writing {n_keys} key/value pair(s) into layer {layer}");

            let (_, cur_zs) = model.module_io_at_words(
                &hparams.layer_module(z_layer),
                &prompts,
                &subjects,
                hparams.fact_token,
                &overlay,
            )?;
            let cur_zs = self.ctx.to_solve(&cur_zs.t()?.contiguous()?)?;
            anyhow::ensure!(
                cur_zs.dims() == zs.dims(),
                "Layer output {:?} does not match targets {:?}",
                cur_zs.dims(),
                zs.dims()
            );
            let residual = zs.sub(&cur_zs)?;
            debug!("z error {}", mean_column_norm(&residual)?);
            let residual = align_targets(&residual, n_keys)?;

            let layer_name = hparams.rewrite_module(layer);
            let query = StatsQuery {
                model_name: model.model_name().to_string(),
                layer_name: layer_name.clone(),
                dataset: hparams.mom2_dataset.clone(),
                sample_size: hparams.mom2_n_samples,
                dtype: hparams.mom2_dtype.clone(),
            };
            let (cov, preserved_keys) =
                get_covariance(&mut self.cache, stats, &query, false, self.ctx.device())?;
            let cov = self.ctx.to_solve(&cov)?;
            let cov = prepare_covariance(&mut self.cache, &layer_name, &cov, &layer_ks, &hparams)?;

            let update = compute_layer_update(&layer_ks, &residual, &cov, i, hparams.layers.len())
                .with_context(|| format!("Failed to solve for layer {layer}"))?;
            insertion_time += layer_start.elapsed();

            let inside_norms = InsideNorms {
                zs_norm: mean_column_norm(&zs)?,
                cur_zs_norm: mean_column_norm(&cur_zs)?,
                layer_ks_norm: mean_column_norm(&layer_ks)?,
                adj_norm: mean_column_norm(&update.adj_keys)?,
                residual_norm: mean_column_norm(&update.resid)?,
                inside_update_norm: frobenius_norm(&update.upd)?,
                cov: frobenius_norm(&cov)?,
            };

            let weight_name = hparams.weight_name(layer);
            let original = model.weight(&weight_name)?;
            let upd = upd_matrix_match_shape(&update.upd, original.dims())?;
            debug!("orig norm {}", frobenius_norm(&original)?);
            debug!("upd norm {}", frobenius_norm(&upd)?);
            let staged = original.add(
                &upd.to_device(original.device())?
                    .to_dtype(original.dtype())?,
            )?;

            let distances = if hparams.calculate_objective_value {
                let edit_values = align_targets(&zs, n_keys)?;
                Some(calculate_distances(
                    &original,
                    &staged,
                    &layer_ks,
                    &edit_values,
                    &preserved_keys,
                )?)
            } else {
                None
            };
            overlay.insert(weight_name.clone(), staged);

            deltas.push(LayerDelta {
                layer,
                weight_name,
                adj_keys: self.ctx.to_host(&update.adj_keys)?,
                resid: self.ctx.to_host(&update.resid)?,
                distances,
                inside_norms: Some(inside_norms),
            });

            drop((layer_ks, cur_zs, residual, cov, update));
        }

        info!("Deltas successfully computed for {weight_names:?}");

        Ok(EditComputation {
            deltas,
            z_norms,
            z_computation_time,
            insertion_time,
        })
    }

    /// Compute the deltas for a batch and insert them into `model`
    pub fn apply_edits<M: EditableModel + ?Sized>(
        &mut self,
        model: &mut M,
        targets: &dyn TargetProvider<M>,
        stats: &dyn StatsProvider,
        requests: &[EditRequest],
        return_orig_weights: bool,
    ) -> Result<EditOutcome> {
        let computation = self.execute(&*model, targets, stats, requests)?;
        let insertion = insert_deltas(model, &computation.deltas, &self.hparams, return_orig_weights)?;

        Ok(EditOutcome {
            weights_copy: insertion.weights_copy,
            distances: DistancesReport {
                z_norms: computation.z_norms,
                layers: insertion.layers,
            },
            z_computation_time: computation.z_computation_time,
            insertion_time: computation.insertion_time,
        })
    }

    /// Stacked targets `[d_out, n]` in solve precision, with the norms of
    /// the ones that had to be computed
    fn compute_targets<M: EditableModel + ?Sized>(
        &self,
        model: &M,
        targets: &dyn TargetProvider<M>,
        requests: &[EditRequest],
        z_layer: usize,
        templates: &ContextTemplates,
    ) -> Result<(Tensor, BTreeMap<usize, ZNorms>)> {
        let mut z_list = Vec::with_capacity(requests.len());
        let mut z_norms = BTreeMap::new();

        for (i, request) in requests.iter().enumerate() {
            let cache_path = self.target_cache.as_ref().map(|cache| {
                cache.path_for(z_layer, self.hparams.clamp_norm_factor, &request.case_id)
            });

            let cached = match (&self.target_cache, &cache_path) {
                (Some(cache), Some(path)) => cache.load(path, self.ctx.device()),
                _ => None,
            };
            if let Some(z) = cached {
                debug!("Loaded target for case {} from cache", request.case_id);
                z_list.push(z);
                continue;
            }

            let target = targets
                .compute_target(model, request, &self.hparams, z_layer, templates)
                .with_context(|| format!("Failed to compute target for case {}", request.case_id))?;
            z_norms.insert(
                i,
                ZNorms {
                    delta: target.delta_norm,
                    init_norm: target.init_norm,
                    final_norm: frobenius_norm(&target.z)?,
                },
            );

            if let (Some(cache), Some(path)) = (&self.target_cache, &cache_path) {
                cache.store(path, &target.z)?;
            }
            z_list.push(target.z);
        }

        let z_list = z_list
            .iter()
            .map(|z| self.ctx.to_solve(&z.flatten_all()?))
            .collect::<Result<Vec<Tensor>>>()?;
        let zs = Tensor::stack(&z_list, 1)?;
        Ok((zs, z_norms))
    }
}

/// Sparsely insert deltas into a weight store.
///
/// With `return_orig_weights` the pre-edit value of each changed weight is
/// kept (first occurrence wins).
pub fn insert_deltas<S: WeightStore + ?Sized>(
    store: &mut S,
    deltas: &[LayerDelta],
    hparams: &EditHyperParams,
    return_orig_weights: bool,
) -> Result<Insertion> {
    let mut insertion = Insertion::default();

    for delta in deltas {
        let weight = store.weight(&delta.weight_name)?;
        let upd = delta.update_matrix(&weight)?;

        if return_orig_weights && !insertion.weights_copy.contains_key(&delta.weight_name) {
            insertion
                .weights_copy
                .insert(delta.weight_name.clone(), weight.copy()?);
        }

        let original_weights_norm = frobenius_norm(&weight)?;
        let new_weight = sparse_update(&weight, &upd, hparams.sparse_fraction)?;

        let (svd_upd, svd_final) = if hparams.calculate_norms {
            let start = Instant::now();
            let spectra = (singular_values(&upd)?, singular_values(&new_weight)?);
            debug!("svd calculation time: {:?}", start.elapsed());
            (Some(spectra.0), Some(spectra.1))
        } else {
            (None, None)
        };

        let report = LayerReport {
            weight_name: delta.weight_name.clone(),
            distances: delta.distances,
            delta_norm: frobenius_norm(&upd)?,
            new_weights_norm: frobenius_norm(&new_weight)?,
            original_weights_norm,
            inside_norms: delta.inside_norms.clone(),
            svd_final,
            svd_upd,
        };
        store.set_weight(&delta.weight_name, new_weight)?;
        insertion.layers.insert(delta.layer, report);
    }

    let names: Vec<&str> = deltas.iter().map(|d| d.weight_name.as_str()).collect();
    info!("New weights successfully inserted into {names:?}");
    Ok(insertion)
}
