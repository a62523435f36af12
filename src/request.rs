//! Edit requests and request-file loading

use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Identifier of an edit request in its source dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaseId {
    Number(u64),
    Text(String),
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseId::Number(n) => write!(f, "{n}"),
            CaseId::Text(s) => f.write_str(s),
        }
    }
}

/// New object string of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetText {
    #[serde(rename = "str")]
    pub text: String,
}

/// A single factual-association edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub case_id: CaseId,
    /// Prompt with a `{}` placeholder for the subject
    pub prompt: String,
    pub subject: String,
    pub target_new: TargetText,
}

impl EditRequest {
    pub fn new(
        case_id: CaseId,
        prompt: impl Into<String>,
        subject: impl Into<String>,
        target_new: impl Into<String>,
    ) -> Self {
        Self {
            case_id,
            prompt: prompt.into(),
            subject: subject.into(),
            target_new: TargetText {
                text: target_new.into(),
            },
        }
    }

    /// Return a copy whose target starts with a space, as the tokenizer expects
    pub fn normalized(&self) -> Self {
        let mut request = self.clone();
        if !request.target_new.text.starts_with(' ') {
            request.target_new.text.insert(0, ' ');
        }
        request
    }

    /// Prompt with the subject filled in
    pub fn rendered_prompt(&self) -> String {
        self.prompt.replace("{}", &self.subject)
    }
}

/// Load a JSON array of requests
pub fn load_requests(path: &str) -> Result<Vec<EditRequest>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read requests {path}"))?;
    let requests: Vec<EditRequest> =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse requests {path}"))?;
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_single_space() {
        let request = EditRequest::new(CaseId::Number(7), "{} plays", "Danielle Darrieux", "golf");
        let normalized = request.normalized();
        assert_eq!(normalized.target_new.text, " golf");
        // Already-normalized targets are left alone
        assert_eq!(normalized.normalized().target_new.text, " golf");
    }

    #[test]
    fn test_rendered_prompt() {
        let request = EditRequest::new(
            CaseId::Text("a".into()),
            "The mother tongue of {} is",
            "Danielle Darrieux",
            "English",
        );
        assert_eq!(
            request.rendered_prompt(),
            "The mother tongue of Danielle Darrieux is"
        );
    }

    #[test]
    fn test_case_id_forms() {
        let json = r#"[
            {"case_id": 0, "prompt": "{} is", "subject": "A", "target_new": {"str": "x"}},
            {"case_id": "b-1", "prompt": "{} was", "subject": "B", "target_new": {"str": " y"}}
        ]"#;
        let requests: Vec<EditRequest> = serde_json::from_str(json).unwrap();
        assert_eq!(requests[0].case_id, CaseId::Number(0));
        assert_eq!(requests[1].case_id.to_string(), "b-1");
        assert_eq!(requests[1].target_new.text, " y");
    }
}
