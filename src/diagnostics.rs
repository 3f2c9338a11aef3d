use crate::contract::DeclarationError;
use crate::environment::ViolationKind;
use crate::level::Severity;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Category of a reported problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    NotHeld,
    StillHeld,
    Excluded,
    ContractMismatch,
    UnbalancedSuppression,
    Declaration,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        self.descriptor().name
    }

    /// Violations found by the analysis, as opposed to usage and
    /// declaration errors, which always break the build.
    pub fn is_analysis_finding(&self) -> bool {
        !matches!(
            self,
            DiagnosticKind::UnbalancedSuppression | DiagnosticKind::Declaration
        )
    }

    pub fn descriptor(&self) -> &'static KindDescriptor {
        let idx = match self {
            DiagnosticKind::NotHeld => 0,
            DiagnosticKind::StillHeld => 1,
            DiagnosticKind::Excluded => 2,
            DiagnosticKind::ContractMismatch => 3,
            DiagnosticKind::UnbalancedSuppression => 4,
            DiagnosticKind::Declaration => 5,
        };
        &KINDS[idx]
    }
}

impl From<ViolationKind> for DiagnosticKind {
    fn from(kind: ViolationKind) -> Self {
        match kind {
            ViolationKind::NotHeld => DiagnosticKind::NotHeld,
            ViolationKind::StillHeld => DiagnosticKind::StillHeld,
            ViolationKind::Excluded => DiagnosticKind::Excluded,
            ViolationKind::ContractMismatch => DiagnosticKind::ContractMismatch,
        }
    }
}

/// Static description of a diagnostic kind, used by `list-kinds` and `explain`.
#[derive(Debug)]
pub struct KindDescriptor {
    pub kind: DiagnosticKind,
    pub name: &'static str,
    pub summary: &'static str,
    pub explanation: &'static str,
}

pub static KINDS: [KindDescriptor; 6] = [
    KindDescriptor {
        kind: DiagnosticKind::NotHeld,
        name: "not_held",
        summary: "a capability is required but not provably held",
        explanation: "A call to a function declared with `__must_hold`, a release, or an access \
                      to a `__guarded_by` member happens on a path where the capability is not \
                      held in the required mode. A capability that is held on some incoming \
                      paths only counts as not held.",
    },
    KindDescriptor {
        kind: DiagnosticKind::StillHeld,
        name: "still_held",
        summary: "a capability is still held when the function returns",
        explanation: "The function returns while holding a capability that its contract does \
                      not declare with `__acquires` or `__must_hold`. Either release it on every \
                      path or declare the acquisition.",
    },
    KindDescriptor {
        kind: DiagnosticKind::Excluded,
        name: "excluded",
        summary: "a capability is held where it must not be",
        explanation: "A function declared with `__must_not_hold` is called, or a capability is \
                      acquired, while the capability is (or may be) already held.",
    },
    KindDescriptor {
        kind: DiagnosticKind::ContractMismatch,
        name: "contract_mismatch",
        summary: "the function body does not implement its declared contract",
        explanation: "At a return, a capability declared with `__acquires` or `__must_hold` is \
                      not held, a try-acquire returns a value that disagrees with the capability \
                      state, or a capability is released in a mode other than the one it is \
                      held in.",
    },
    KindDescriptor {
        kind: DiagnosticKind::UnbalancedSuppression,
        name: "unbalanced_suppression",
        summary: "analysis suppression markers do not match",
        explanation: "`enable_capability_analysis()` without a preceding \
                      `disable_capability_analysis()`, a return with analysis still disabled, or \
                      paths that merge with different suppression depths.",
    },
    KindDescriptor {
        kind: DiagnosticKind::Declaration,
        name: "declaration",
        summary: "a capability annotation is invalid",
        explanation: "A contract contradicts itself, two declarations of a function carry \
                      different contracts, an annotation names something that is not a \
                      capability, or a capability type is declared twice with different kinds. \
                      Declaration errors always fail the build and the affected translation \
                      unit is not analyzed.",
    },
];

pub fn find_kind(name: &str) -> Option<&'static KindDescriptor> {
    let normalized = name.trim().replace('-', "_").to_ascii_lowercase();
    KINDS.iter().find(|d| d.name == normalized)
}

/// Position of a diagnostic. Field order is the report order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Location {
    pub unit: String,
    /// Function, or the declaration a declaration error is attached to.
    pub function: String,
    /// Basic block; `None` for function-scope diagnostics.
    pub block: Option<usize>,
    pub stmt: Option<usize>,
    pub line: Option<u32>,
}

impl Location {
    pub fn function(unit: &str, function: &str) -> Self {
        Self {
            unit: unit.to_string(),
            function: function.to_string(),
            block: None,
            stmt: None,
            line: None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.function)?;
        match (self.block, self.stmt) {
            (Some(block), Some(stmt)) => write!(f, ":bb{block}.{stmt}")?,
            (Some(block), None) => write!(f, ":bb{block}")?,
            _ => {}
        }
        if let Some(line) = self.line {
            write!(f, " (line {line})")?;
        }
        Ok(())
    }
}

/// A single reported problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[must_use]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub location: Location,
    pub instance: Option<String>,
    pub message: String,
    /// The violated contract clause as written.
    pub contract: Option<String>,
}

impl Diagnostic {
    pub fn from_declaration_error(err: &DeclarationError) -> Self {
        Self {
            kind: DiagnosticKind::Declaration,
            severity: Severity::Error,
            location: Location::function(&err.unit, &err.item),
            instance: None,
            message: format!("{}: {}", err.kind.as_str(), err.message),
            contract: None,
        }
    }

    /// Human readable rendering, one or two lines.
    pub fn pretty(&self) -> String {
        let mut out = format!(
            "{}: {}[{}]: {}",
            self.location,
            self.severity.as_str(),
            self.kind.as_str(),
            self.message
        );
        if let Some(contract) = &self.contract {
            out.push_str(&format!("\n  = contract: `{contract}`"));
        }
        out
    }
}

/// Collects diagnostics, dropping repeats of the same (location, instance,
/// kind) and ordering the result by position.
#[derive(Debug, Default)]
pub struct Reporter {
    seen: HashSet<(Location, Option<String>, DiagnosticKind)>,
    diagnostics: Vec<Diagnostic>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if an equivalent diagnostic was already reported.
    pub fn push(&mut self, diag: Diagnostic) -> bool {
        let key = (diag.location.clone(), diag.instance.clone(), diag.kind);
        if !self.seen.insert(key) {
            return false;
        }
        self.diagnostics.push(diag);
        true
    }

    pub fn extend(&mut self, diags: impl IntoIterator<Item = Diagnostic>) {
        for diag in diags {
            self.push(diag);
        }
    }

    pub fn finish(mut self) -> Vec<Diagnostic> {
        self.diagnostics.sort_by(|a, b| {
            (&a.location, a.kind, &a.instance, &a.message).cmp(&(
                &b.location,
                b.kind,
                &b.instance,
                &b.message,
            ))
        });
        self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(block: Option<usize>, stmt: Option<usize>, instance: &str) -> Diagnostic {
        Diagnostic {
            kind: DiagnosticKind::NotHeld,
            severity: Severity::Warn,
            location: Location {
                block,
                stmt,
                ..Location::function("a.c", "f")
            },
            instance: Some(instance.to_string()),
            message: format!("`{instance}` is not held"),
            contract: None,
        }
    }

    #[test]
    fn test_reporter_dedupes_and_orders() {
        let mut reporter = Reporter::new();
        assert!(reporter.push(diag(Some(2), Some(0), "a")));
        assert!(reporter.push(diag(Some(0), Some(3), "a")));
        assert!(!reporter.push(diag(Some(2), Some(0), "a")));
        assert!(reporter.push(diag(Some(2), Some(0), "b")));
        assert!(reporter.push(diag(None, None, "a")));

        let positions: Vec<_> = reporter
            .finish()
            .into_iter()
            .map(|d| (d.location.block, d.location.stmt, d.instance.unwrap()))
            .collect();
        assert_eq!(
            positions,
            vec![
                (None, None, "a".to_string()),
                (Some(0), Some(3), "a".to_string()),
                (Some(2), Some(0), "a".to_string()),
                (Some(2), Some(0), "b".to_string()),
            ]
        );
    }

    #[test]
    fn test_kind_lookup() {
        assert_eq!(find_kind("still-held").unwrap().kind, DiagnosticKind::StillHeld);
        assert_eq!(find_kind("NOT_HELD").unwrap().kind, DiagnosticKind::NotHeld);
        assert!(find_kind("deadlock").is_none());
        for d in &KINDS {
            assert_eq!(d.kind.descriptor().name, d.name);
        }
    }

    #[test]
    fn test_pretty_rendering() {
        let mut d = diag(Some(1), Some(2), "f->lock");
        d.location.line = Some(14);
        d.contract = Some("__must_hold(&f->lock)".to_string());
        assert_eq!(
            d.pretty(),
            "a.c:f:bb1.2 (line 14): warning[not_held]: `f->lock` is not held\n  = contract: `__must_hold(&f->lock)`"
        );
    }
}
