//! Context templates used to average key activations over prefixes

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::EditCache;
use crate::model::EditableModel;

/// Prefixes the generated templates start from
pub const TEMPLATE_PREFIXES: [&str; 5] = ["The", "Therefore", "Because", "I", "You"];

/// `(max_out_len, n_gen)` for each generated template group
pub const TEMPLATE_GROUPS: [(usize, usize); 1] = [(10, 7)];

/// Groups of templates, each containing one `{}` placeholder for a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTemplates(Vec<Vec<String>>);

impl ContextTemplates {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        Self(groups)
    }

    /// A single group holding the identity template
    pub fn plain() -> Self {
        Self(vec![vec!["{}".to_string()]])
    }

    pub fn groups(&self) -> &[Vec<String>] {
        &self.0
    }

    pub fn n_groups(&self) -> usize {
        self.0.len()
    }

    /// Total number of templates across groups
    pub fn n_templates(&self) -> usize {
        self.0.iter().map(Vec::len).sum()
    }
}

/// Turn a generated continuation into a template.
///
/// Braces are blanked so the text cannot introduce extra placeholders.
pub fn template_from_generation(text: &str) -> String {
    format!("{}. {{}}", text.replace(['{', '}'], " "))
}

/// Build the template set: the identity group followed by generated groups
pub fn build_context_templates<M: EditableModel + ?Sized>(model: &M) -> Result<ContextTemplates> {
    let mut groups = vec![vec!["{}".to_string()]];
    for (length, n_gen) in TEMPLATE_GROUPS {
        let generated = model.generate(&TEMPLATE_PREFIXES, n_gen / TEMPLATE_PREFIXES.len(), length)?;
        groups.push(
            generated
                .iter()
                .map(|text| template_from_generation(text))
                .collect(),
        );
    }
    Ok(ContextTemplates::new(groups))
}

/// Cached templates, generated on first use
pub fn get_context_templates<'a, M: EditableModel + ?Sized>(
    cache: &'a mut EditCache,
    model: &M,
) -> Result<&'a ContextTemplates> {
    cache.context_templates_or_try_insert_with(|| {
        let templates = build_context_templates(model)?;
        info!("Cached context templates {:?}", templates.groups());
        Ok(templates)
    })
}
