//! Key extraction: edited-module inputs averaged over context templates

use anyhow::Result;
use candle_core::Tensor;

use crate::hparams::EditHyperParams;
use crate::model::{EditableModel, WeightOverlay};
use crate::request::EditRequest;
use crate::templates::ContextTemplates;

/// Keys for every request at `layer`, shape `[n_requests, d_in]`.
///
/// Each request is run through every template. Activations are averaged
/// within a template group, then the group means are averaged.
pub fn compute_ks<M: EditableModel + ?Sized>(
    model: &M,
    requests: &[EditRequest],
    hparams: &EditHyperParams,
    layer: usize,
    templates: &ContextTemplates,
    overlay: &WeightOverlay,
) -> Result<Tensor> {
    anyhow::ensure!(!requests.is_empty(), "compute_ks: empty request batch");
    let context_len = templates.n_templates();
    anyhow::ensure!(context_len > 0, "compute_ks: no context templates");

    let mut contexts = Vec::with_capacity(requests.len() * context_len);
    let mut words = Vec::with_capacity(requests.len() * context_len);
    for request in requests {
        for group in templates.groups() {
            for template in group {
                contexts.push(template.replace("{}", &request.prompt));
                words.push(request.subject.clone());
            }
        }
    }

    let (layer_ks, _) = model.module_io_at_words(
        &hparams.rewrite_module(layer),
        &contexts,
        &words,
        hparams.fact_token,
        overlay,
    )?;
    let (n_rows, _) = layer_ks.dims2()?;
    anyhow::ensure!(
        n_rows == contexts.len(),
        "compute_ks: backend returned {n_rows} rows for {} contexts",
        contexts.len()
    );

    let mut group_means = Vec::with_capacity(templates.n_groups());
    let mut start = 0;
    for group in templates.groups() {
        let len = group.len();
        anyhow::ensure!(len > 0, "compute_ks: empty context template group");
        let per_request = (0..requests.len())
            .map(|r| Ok(layer_ks.narrow(0, r * context_len + start, len)?.mean(0)?))
            .collect::<Result<Vec<Tensor>>>()?;
        group_means.push(Tensor::stack(&per_request, 0)?);
        start += len;
    }

    Ok(Tensor::stack(&group_means, 0)?.mean(0)?)
}
