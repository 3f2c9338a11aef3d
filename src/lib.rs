//! Static capability-holding checker.
//!
//! The crate consumes an already-parsed program (translation units with
//! declarations and per-function control-flow graphs), builds the table of
//! declared capability contracts once, and checks every function body
//! against it with a forward dataflow analysis.

#![allow(clippy::too_many_arguments)] // Analyzer helpers thread the same context through every check
#![allow(clippy::new_without_default)]

pub mod analyzer;
pub mod annotations;
pub mod baseline;
pub mod capability;
pub mod cli;
pub mod config;
pub mod contract;
pub mod diagnostics;
pub mod environment;
pub mod error;
pub mod expr;
pub mod level;
pub mod program;
pub mod suppression;
pub mod telemetry;

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::analyzer::FunctionAnalysis;
use crate::config::{AnalysisConfig, Scope};
use crate::contract::AnnotationTable;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Reporter};
use crate::error::{CapCheckError, CapCheckResult};
use crate::level::Severity;
use crate::program::{Program, TranslationUnit};

/// Analysis policy, from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct CheckSettings {
    pub enabled: bool,
    pub scope: Scope,
    pub treat_as_fatal: bool,
    /// Worker threads; 0 uses the available parallelism.
    pub jobs: usize,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

impl CheckSettings {
    pub fn from_config(cfg: &AnalysisConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            scope: cfg.scope,
            treat_as_fatal: cfg.treat_as_fatal,
            jobs: cfg.jobs,
        }
    }

    pub fn with_treat_as_fatal(mut self, treat_as_fatal: bool) -> Self {
        self.treat_as_fatal |= treat_as_fatal;
        self
    }

    pub fn with_scope(mut self, scope: Option<Scope>) -> Self {
        if let Some(scope) = scope {
            self.scope = scope;
        }
        self
    }

    pub fn with_jobs(mut self, jobs: Option<usize>) -> Self {
        if let Some(jobs) = jobs {
            self.jobs = jobs;
        }
        self
    }

    fn worker_count(&self, units: usize) -> usize {
        let jobs = match self.jobs {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };
        jobs.clamp(1, units.max(1))
    }
}

/// Counts for the build gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub functions_analyzed: usize,
    pub violations: usize,
    pub declaration_errors: usize,
    pub usage_errors: usize,
    /// No diagnostic has error severity.
    pub passed: bool,
}

impl Summary {
    pub fn tally(functions_analyzed: usize, diagnostics: &[Diagnostic]) -> Self {
        let mut summary = Self {
            functions_analyzed,
            passed: true,
            ..Self::default()
        };
        for diag in diagnostics {
            match diag.kind {
                DiagnosticKind::Declaration => summary.declaration_errors += 1,
                DiagnosticKind::UnbalancedSuppression => summary.usage_errors += 1,
                _ => summary.violations += 1,
            }
            summary.passed &= diag.severity != Severity::Error;
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub diagnostics: Vec<Diagnostic>,
    pub summary: Summary,
}

struct UnitOutcome {
    diagnostics: Vec<Diagnostic>,
    functions_analyzed: usize,
}

/// Engine orchestrates checking: builds the annotation table, then analyzes
/// every in-scope translation unit.
pub struct CheckEngine {
    settings: CheckSettings,
}

impl CheckEngine {
    pub fn new(settings: CheckSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CheckSettings {
        &self.settings
    }

    /// Check a whole program. Malformed input aborts the pass.
    pub fn check(&self, program: &Program) -> CapCheckResult<Report> {
        if !self.settings.enabled {
            return Ok(Report {
                diagnostics: Vec::new(),
                summary: Summary::tally(0, &[]),
            });
        }

        let table = instrument_block!("declarations", {
            AnnotationTable::build(program)
        })?;

        let mut reporter = Reporter::new();
        reporter.extend(
            table
                .declaration_errors()
                .iter()
                .map(Diagnostic::from_declaration_error),
        );

        let units: Vec<&TranslationUnit> = program
            .units
            .iter()
            .filter(|unit| self.in_scope(unit, &table))
            .collect();

        let mut functions_analyzed = 0;
        for outcome in self.run_units(&units, &table)? {
            functions_analyzed += outcome.functions_analyzed;
            reporter.extend(outcome.diagnostics);
        }

        let diagnostics = reporter.finish();
        let summary = Summary::tally(functions_analyzed, &diagnostics);
        Ok(Report {
            diagnostics,
            summary,
        })
    }

    fn in_scope(&self, unit: &TranslationUnit, table: &AnnotationTable) -> bool {
        if self.settings.scope == Scope::OptedIn && !unit.opted_in {
            capcheck_debug!(unit = %unit.name, "unit did not opt in; skipped");
            return false;
        }
        if !table.unit_is_clean(&unit.name) {
            capcheck_debug!(unit = %unit.name, "unit has declaration errors; skipped");
            return false;
        }
        true
    }

    /// Analyze units on scoped workers; results come back in unit order.
    fn run_units(
        &self,
        units: &[&TranslationUnit],
        table: &AnnotationTable,
    ) -> CapCheckResult<Vec<UnitOutcome>> {
        let workers = self.settings.worker_count(units.len());
        let severity = Severity::for_findings(self.settings.treat_as_fatal);

        if workers == 1 {
            return units
                .iter()
                .map(|unit| analyze_unit(table, unit, severity))
                .collect();
        }

        let next = AtomicUsize::new(0);
        let mut results: Vec<(usize, CapCheckResult<UnitOutcome>)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let next = &next;
                    s.spawn(move || {
                        let mut done = Vec::new();
                        loop {
                            let idx = next.fetch_add(1, Ordering::Relaxed);
                            let Some(unit) = units.get(idx) else {
                                break;
                            };
                            done.push((idx, analyze_unit(table, unit, severity)));
                        }
                        done
                    })
                })
                .collect();

            let mut all = Vec::with_capacity(units.len());
            for handle in handles {
                match handle.join() {
                    Ok(done) => all.extend(done),
                    Err(_) => all.push((
                        usize::MAX,
                        Err(CapCheckError::other("analysis worker panicked")),
                    )),
                }
            }
            all
        });

        results.sort_by_key(|(idx, _)| *idx);
        results.into_iter().map(|(_, result)| result).collect()
    }
}

fn analyze_unit(
    table: &AnnotationTable,
    unit: &TranslationUnit,
    severity: Severity,
) -> CapCheckResult<UnitOutcome> {
    instrument_block!("unit", unit.name, {
        analyze_functions(table, unit, severity)
    })
}

fn analyze_functions(
    table: &AnnotationTable,
    unit: &TranslationUnit,
    severity: Severity,
) -> CapCheckResult<UnitOutcome> {
    let mut outcome = UnitOutcome {
        diagnostics: Vec::new(),
        functions_analyzed: 0,
    };

    for decl in &unit.functions {
        let Some(body) = &decl.body else {
            continue;
        };
        if table.contract_for(&unit.name, &decl.name).no_analysis {
            capcheck_debug!(function = %decl.name, "analysis disabled by annotation");
            continue;
        }

        let analysis = FunctionAnalysis::new(table, &unit.name, decl, body, severity);
        let result = instrument_block!("function", decl.name, { analysis.analyze() })?;
        outcome.functions_analyzed += 1;
        outcome.diagnostics.extend(result.diagnostics);
    }

    Ok(outcome)
}

/// Construct a `CheckEngine` with the default settings.
pub fn create_default_engine() -> CheckEngine {
    CheckEngine::new(CheckSettings::default())
}
