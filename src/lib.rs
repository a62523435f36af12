// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64 intentional in norms and fractions
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // k, v, w, z standard in the update equations
#![allow(clippy::similar_names)] // related variables like `cov`/`cur_zs`
#![allow(clippy::module_name_repetitions)] // EditCache in cache.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! memit-rs: mass editing of factual associations in transformer weights
//!
//! Computes closed-form, covariance-regularised updates to the MLP output
//! projections of a range of layers so that a batch of
//! `(prompt, subject) -> target` associations is written into the model,
//! then inserts them with a sparse rule that touches only the elements with
//! the largest relative change.
//!
//! ## Architecture
//!
//! - `hparams`: Edit hyperparameters loaded from JSON
//! - `request`: Edit requests and their normalisation
//! - `model`: Traits a model backend implements (weights, activations, targets)
//! - `context`: Device and precision policy for the solve
//! - `cache`: EditCache for templates, covariance and sequential history
//! - `templates`: Context templates generated from the model
//! - `keys`: Key extraction averaged over context templates
//! - `covariance`: Second-moment statistics and their cache
//! - `linalg`: Dense solve and SVD through nalgebra
//! - `solver`: Per-layer closed-form update
//! - `target_cache`: On-disk cache of target representations
//! - `weights`: Weight storage, shape reconciliation and sparse insertion
//! - `diagnostics`: Norms, spectra and distances for reports
//! - `editor`: MemitEditor coordinating a full edit batch

pub mod cache;
pub mod context;
pub mod covariance;
pub mod diagnostics;
pub mod editor;
pub mod hparams;
pub mod keys;
pub mod linalg;
pub mod model;
pub mod request;
pub mod solver;
pub mod target_cache;
pub mod templates;
pub mod weights;

pub use cache::{CovarianceEntry, EditCache};
pub use context::ComputeContext;
pub use covariance::{
    get_covariance, LayerStats, SampleStats, SecondMoment, StatsProvider, StatsQuery,
};
pub use diagnostics::{
    calculate_distances, DistancesReport, EditDistances, InsideNorms, LayerReport, ZNorms,
};
pub use editor::{insert_deltas, EditComputation, EditOutcome, Insertion, MemitEditor};
pub use hparams::{EditHyperParams, FactToken, DEFAULT_SPARSE_FRACTION};
pub use keys::compute_ks;
pub use model::{EditableModel, TargetProvider, TargetRepresentation, WeightOverlay, WeightStore};
pub use request::{load_requests, CaseId, EditRequest, TargetText};
pub use solver::{compute_layer_update, residual_fraction, LayerDelta, LayerUpdate};
pub use target_cache::TargetCache;
pub use templates::{get_context_templates, ContextTemplates};
pub use weights::{
    apply_delta_sparse, load_deltas, save_deltas, sparse_update, upd_matrix_match_shape, WeightMap,
};
