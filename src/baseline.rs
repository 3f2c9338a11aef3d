//! Baseline of accepted diagnostics.
//!
//! Existing code bases usually start with violations that cannot all be fixed
//! before the checker gates the build. A baseline records the fingerprints
//! of the diagnostics present at one point in time; `check --baseline` then
//! drops those, so only new violations fail the build.
//!
//! ```bash
//! # Record the current state
//! capcheck baseline program.json --output capcheck-baseline.json
//!
//! # Only report what is new since then
//! capcheck check program.json --baseline capcheck-baseline.json
//! ```
//!
//! Fingerprints ignore block and statement indices, so unrelated edits that
//! reshape a function's CFG do not invalidate its entries.

use crate::diagnostics::Diagnostic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const BASELINE_VERSION: &str = "1.0";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("failed to read baseline: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse baseline: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported baseline version `{0}`")]
    Version(String),
}

// ============================================================================
// Entries
// ============================================================================

/// Stable identifier of a diagnostic.
pub fn fingerprint(diag: &Diagnostic) -> String {
    let mut hasher = Sha256::new();
    hasher.update(diag.location.unit.as_bytes());
    hasher.update([0]);
    hasher.update(diag.location.function.as_bytes());
    hasher.update([0]);
    hasher.update(diag.kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(diag.instance.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(diag.message.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub kind: String,
    pub unit: String,
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub message: String,
    /// When the diagnostic was first recorded.
    pub first_seen: DateTime<Utc>,
}

impl BaselineEntry {
    fn from_diagnostic(diag: &Diagnostic) -> Self {
        Self {
            kind: diag.kind.as_str().to_string(),
            unit: diag.location.unit.clone(),
            function: diag.location.function.clone(),
            instance: diag.instance.clone(),
            message: diag.message.clone(),
            first_seen: Utc::now(),
        }
    }
}

// ============================================================================
// Baseline
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub version: String,
    pub updated_at: DateTime<Utc>,
    /// Entries keyed by fingerprint.
    pub entries: BTreeMap<String, BaselineEntry>,
}

impl Default for Baseline {
    fn default() -> Self {
        Self::new()
    }
}

impl Baseline {
    pub fn new() -> Self {
        Self {
            version: BASELINE_VERSION.to_string(),
            updated_at: Utc::now(),
            entries: BTreeMap::new(),
        }
    }

    /// Load a baseline; a missing file is an empty baseline.
    pub fn load(path: &Path) -> Result<Self, BaselineError> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let contents = fs::read_to_string(path)?;
        let baseline: Self = serde_json::from_str(&contents)?;
        if baseline.version != BASELINE_VERSION {
            return Err(BaselineError::Version(baseline.version));
        }
        Ok(baseline)
    }

    pub fn save(&mut self, path: &Path) -> Result<(), BaselineError> {
        self.updated_at = Utc::now();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Replace the entries with the analysis findings in `diags`, keeping
    /// the first-seen time of entries that are still present.
    pub fn record(&mut self, diags: &[Diagnostic]) {
        let mut entries = BTreeMap::new();
        for diag in diags.iter().filter(|d| d.kind.is_analysis_finding()) {
            let id = fingerprint(diag);
            let mut entry = BaselineEntry::from_diagnostic(diag);
            if let Some(existing) = self.entries.get(&id) {
                entry.first_seen = existing.first_seen;
            }
            entries.insert(id, entry);
        }
        self.entries = entries;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop the analysis findings this baseline covers. Usage and
    /// declaration errors are always kept.
    pub fn filter(&self, diags: Vec<Diagnostic>) -> BaselineFilter {
        let mut matched = HashSet::new();
        let mut kept = Vec::new();
        let mut suppressed = 0usize;

        for diag in diags {
            let id = fingerprint(&diag);
            if diag.kind.is_analysis_finding() && self.entries.contains_key(&id) {
                matched.insert(id);
                suppressed += 1;
            } else {
                kept.push(diag);
            }
        }

        let stale = self
            .entries
            .keys()
            .filter(|id| !matched.contains(*id))
            .cloned()
            .collect();
        BaselineFilter {
            kept,
            suppressed,
            stale,
        }
    }
}

/// Outcome of applying a baseline.
#[derive(Debug, Default)]
pub struct BaselineFilter {
    pub kept: Vec<Diagnostic>,
    pub suppressed: usize,
    /// Fingerprints of entries no current diagnostic matches.
    pub stale: Vec<String>,
}

// ============================================================================
// Tests
// ============================================================================
