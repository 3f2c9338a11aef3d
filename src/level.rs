use serde::{Deserialize, Serialize};

/// Severity of a reported diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[serde(rename = "warning", alias = "warn")]
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warn => "warning",
            Severity::Error => "error",
        }
    }

    /// Severity of analysis findings under the configured policy.
    pub fn for_findings(treat_as_fatal: bool) -> Self {
        if treat_as_fatal {
            Severity::Error
        } else {
            Severity::Warn
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Warn
    }
}
