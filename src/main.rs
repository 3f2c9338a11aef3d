use anyhow::Context;
use capcheck::CheckEngine;
use capcheck::CheckSettings;
use capcheck::Report;
use capcheck::baseline::Baseline;
use capcheck::cli::{Args, BaselineArgs, CheckArgs, Command, OutputFormat};
use capcheck::config::{self, CapCheckConfig};
use capcheck::diagnostics::{Diagnostic, KINDS, find_kind};
use capcheck::level::Severity;
use capcheck::program::Program;
use clap::Parser;
use itertools::Itertools;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_BASELINE_FILE: &str = "capcheck-baseline.json";

fn main() -> ExitCode {
    capcheck::telemetry::init_tracing();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    match args.command {
        Some(Command::ListKinds) => {
            list_kinds();
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Explain { kind }) => {
            explain_kind(&kind)?;
            Ok(ExitCode::SUCCESS)
        }
        Some(Command::Check(check)) => check_command(check),
        Some(Command::Baseline(baseline)) => baseline_command(baseline),
        None => check_command(args.check),
    }
}

fn list_kinds() {
    for d in &KINDS {
        println!("{}\t{}", d.name, d.summary);
    }
}

fn explain_kind(kind: &str) -> anyhow::Result<()> {
    let Some(d) = find_kind(kind) else {
        anyhow::bail!("unknown diagnostic kind: {kind}");
    };

    println!("name: {}", d.name);
    println!("summary: {}", d.summary);
    println!();
    println!("{}", d.explanation.split_whitespace().join(" "));
    Ok(())
}

/// Settings and baseline after merging the config file with CLI flags.
struct Resolved {
    settings: CheckSettings,
    baseline: Option<PathBuf>,
}

fn resolve(args: &CheckArgs) -> anyhow::Result<Resolved> {
    let start_dir = infer_start_dir(args)?;
    let loaded = config::load_config(args.config.as_deref(), &start_dir)?;

    let (settings, baseline) = match loaded {
        Some((_path, CapCheckConfig { analysis, output })) => {
            (CheckSettings::from_config(&analysis), output.baseline)
        }
        None => (CheckSettings::default(), None),
    };

    Ok(Resolved {
        settings: settings
            .with_treat_as_fatal(args.treat_as_fatal)
            .with_scope(args.scope)
            .with_jobs(args.jobs),
        // CLI flag takes precedence over config
        baseline: args.baseline.clone().or(baseline),
    })
}

fn load_program(paths: &[PathBuf]) -> anyhow::Result<Program> {
    if paths.is_empty() {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read program from stdin")?;
        return Program::from_json(&raw).context("failed to parse program from stdin");
    }

    let mut program = Program::default();
    for path in paths {
        let part = Program::load(path).with_context(|| format!("failed to load {}", path.display()))?;
        program.merge(part);
    }
    Ok(program)
}

fn check_command(args: CheckArgs) -> anyhow::Result<ExitCode> {
    let resolved = resolve(&args)?;
    let program = load_program(&args.paths)?;
    let engine = CheckEngine::new(resolved.settings);
    let mut report = engine.check(&program)?;

    let mut baseline_suppressed = 0usize;
    let mut baseline_stale = 0usize;
    if let Some(path) = &resolved.baseline {
        let baseline = Baseline::load(path)
            .with_context(|| format!("failed to load baseline {}", path.display()))?;
        let filtered = baseline.filter(std::mem::take(&mut report.diagnostics));
        baseline_suppressed = filtered.suppressed;
        baseline_stale = filtered.stale.len();
        report.summary = capcheck::Summary::tally(report.summary.functions_analyzed, &filtered.kept);
        report.diagnostics = filtered.kept;
    }

    match args.format {
        OutputFormat::Json => {
            let out = JsonReport {
                report: &report,
                baseline_suppressed,
                baseline_stale,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Pretty => {
            for diag in &report.diagnostics {
                println!("{}", diag.pretty());
            }
            eprintln!("{}", summary_line(&report, baseline_suppressed, baseline_stale));
        }
        OutputFormat::Github => {
            for diag in &report.diagnostics {
                println!("{}", github_annotation(diag, args.deny_warnings));
            }
        }
    }

    let has_error = !report.summary.passed;
    if has_error || (args.deny_warnings && !report.diagnostics.is_empty()) {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn baseline_command(args: BaselineArgs) -> anyhow::Result<ExitCode> {
    let resolved = resolve(&args.check)?;
    let program = load_program(&args.check.paths)?;
    let report = CheckEngine::new(resolved.settings).check(&program)?;

    let output = args
        .output
        .or(resolved.baseline)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BASELINE_FILE));
    let mut baseline = Baseline::load(&output)
        .with_context(|| format!("failed to load baseline {}", output.display()))?;
    baseline.record(&report.diagnostics);
    baseline
        .save(&output)
        .with_context(|| format!("failed to write baseline {}", output.display()))?;

    eprintln!(
        "recorded {} diagnostic(s) in {}",
        baseline.len(),
        output.display()
    );
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    report: &'a Report,
    baseline_suppressed: usize,
    baseline_stale: usize,
}

fn summary_line(report: &Report, baseline_suppressed: usize, baseline_stale: usize) -> String {
    let s = &report.summary;
    let mut line = format!(
        "checked {} function(s): {} violation(s), {} declaration error(s), {} usage error(s)",
        s.functions_analyzed, s.violations, s.declaration_errors, s.usage_errors
    );
    if baseline_suppressed > 0 {
        line.push_str(&format!(", {baseline_suppressed} in baseline"));
    }
    if baseline_stale > 0 {
        line.push_str(&format!(
            ", {baseline_stale} stale baseline entr{} (rerun `capcheck baseline` to prune)",
            if baseline_stale == 1 { "y" } else { "ies" }
        ));
    }
    line
}

fn github_annotation(diag: &Diagnostic, deny_warnings: bool) -> String {
    let kind = if diag.severity == Severity::Error || deny_warnings {
        "error"
    } else {
        "warning"
    };
    let mut msg = format!("{}: {}", diag.location.function, diag.message);
    if let Some(contract) = &diag.contract {
        msg.push_str(&format!("\ncontract: {contract}"));
    }
    format!(
        "::{} file={},line={},col=1,title={}::{}",
        kind,
        github_escape(&diag.location.unit),
        diag.location.line.unwrap_or(1),
        diag.kind.as_str(),
        github_escape(&msg)
    )
}

fn github_escape(s: &str) -> String {
    s.replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn infer_start_dir(args: &CheckArgs) -> anyhow::Result<PathBuf> {
    let base = match args.paths.first() {
        Some(p) => p.clone(),
        None => std::env::current_dir()?,
    };

    let base = if base.is_file() {
        base.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        base
    };

    Ok(base)
}
