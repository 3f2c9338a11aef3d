//! Recognition of capability attribute spellings.
//!
//! Declarations carry their attributes as written in source, e.g.
//! `__must_hold(&f->lock)` or `__cond_acquires(1, lock)`. This module maps
//! every spelling of the annotation header onto a [`CapAnnotation`]:
//!
//! - `__must_hold` / `__requires_cap` and the `_shared` variants
//! - `__must_not_hold` / `__excludes_cap`
//! - `__acquires` / `__acquires_cap`, `__releases` / `__releases_cap` and
//!   their `_shared` variants
//! - `__cond_acquires`, `__try_acquires_cap` and their `_shared` variants
//! - `__asserts_cap`, `__asserts_shared_cap`, `__returns_cap`
//! - `__no_capability_analysis`
//! - `__guarded_by` / `__var_guarded_by`, `__pt_guarded_by` / `__ref_guarded_by`
//!
//! Attributes that are not capability annotations (`__always_inline`,
//! `__cold`, ...) are ignored.

use crate::capability::Mode;
use crate::expr::{Expr, ExprError, parse_expr, split_args};
use thiserror::Error;

/// A recognized capability annotation with parsed argument expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapAnnotation {
    Requires { mode: Mode, args: Vec<Expr> },
    Excludes { args: Vec<Expr> },
    Acquires { mode: Mode, args: Vec<Expr> },
    Releases { mode: Mode, args: Vec<Expr> },
    /// Acquires `args` when the function returns a value whose truthiness
    /// equals `success`.
    TryAcquires { mode: Mode, success: bool, args: Vec<Expr> },
    Asserts { mode: Mode, args: Vec<Expr> },
    Returns { arg: Expr },
    NoAnalysis,
    GuardedBy { arg: Expr },
    PtGuardedBy { arg: Expr },
}

impl CapAnnotation {
    /// Whether the annotation belongs on a function declaration.
    pub fn is_function_annotation(&self) -> bool {
        !matches!(
            self,
            CapAnnotation::GuardedBy { .. } | CapAnnotation::PtGuardedBy { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnnotationError {
    #[error("`{attr}` expects {expected}")]
    Arity { attr: String, expected: &'static str },
    #[error("`{attr}`: invalid try-acquire return value `{value}` (expected 0, 1, true or false)")]
    ReturnValue { attr: String, value: String },
    #[error("`{attr}`: {source}")]
    Expr {
        attr: String,
        #[source]
        source: ExprError,
    },
}

/// Split `name(args)` into the attribute name and raw argument text.
fn split_attribute(text: &str) -> (&str, Option<&str>) {
    let trimmed = text.trim();
    let Some(open) = trimmed.find('(') else {
        return (trimmed, None);
    };
    let name = trimmed[..open].trim();
    let rest = &trimmed[open + 1..];
    let inner = rest.strip_suffix(')').unwrap_or(rest);
    (name, Some(inner))
}

/// Parse a single attribute. Returns `Ok(None)` for attributes that are not
/// capability annotations.
pub fn parse_attribute(text: &str) -> Result<Option<CapAnnotation>, AnnotationError> {
    let (name, raw_args) = split_attribute(text);
    let raw: Vec<String> = raw_args.map(split_args).unwrap_or_default();

    let exprs = |raw: &[String]| -> Result<Vec<Expr>, AnnotationError> {
        raw.iter()
            .map(|a| {
                parse_expr(a).map_err(|source| AnnotationError::Expr {
                    attr: text.to_string(),
                    source,
                })
            })
            .collect()
    };
    let at_least_one = |raw: &[String]| -> Result<Vec<Expr>, AnnotationError> {
        if raw.is_empty() {
            return Err(AnnotationError::Arity {
                attr: text.to_string(),
                expected: "at least one capability expression",
            });
        }
        exprs(raw)
    };
    let exactly_one = |raw: &[String]| -> Result<Expr, AnnotationError> {
        if raw.len() != 1 {
            return Err(AnnotationError::Arity {
                attr: text.to_string(),
                expected: "exactly one capability expression",
            });
        }
        Ok(exprs(raw)?.remove(0))
    };

    let ann = match name {
        "__must_hold" | "__requires_cap" => CapAnnotation::Requires {
            mode: Mode::Exclusive,
            args: at_least_one(&raw)?,
        },
        "__must_hold_shared" | "__requires_shared_cap" => CapAnnotation::Requires {
            mode: Mode::Shared,
            args: at_least_one(&raw)?,
        },
        "__must_not_hold" | "__excludes_cap" => CapAnnotation::Excludes {
            args: at_least_one(&raw)?,
        },
        "__acquires" | "__acquires_cap" => CapAnnotation::Acquires {
            mode: Mode::Exclusive,
            args: at_least_one(&raw)?,
        },
        "__acquires_shared" | "__acquires_shared_cap" => CapAnnotation::Acquires {
            mode: Mode::Shared,
            args: at_least_one(&raw)?,
        },
        "__releases" | "__releases_cap" => CapAnnotation::Releases {
            mode: Mode::Exclusive,
            args: at_least_one(&raw)?,
        },
        "__releases_shared" | "__releases_shared_cap" => CapAnnotation::Releases {
            mode: Mode::Shared,
            args: at_least_one(&raw)?,
        },
        "__cond_acquires" => try_acquires(text, Mode::Exclusive, &raw, false, &exprs)?,
        "__cond_acquires_shared" => try_acquires(text, Mode::Shared, &raw, false, &exprs)?,
        "__try_acquires_cap" => try_acquires(text, Mode::Exclusive, &raw, true, &exprs)?,
        "__try_acquires_shared_cap" => try_acquires(text, Mode::Shared, &raw, true, &exprs)?,
        "__asserts_cap" => CapAnnotation::Asserts {
            mode: Mode::Exclusive,
            args: at_least_one(&raw)?,
        },
        "__asserts_shared_cap" => CapAnnotation::Asserts {
            mode: Mode::Shared,
            args: at_least_one(&raw)?,
        },
        "__returns_cap" => CapAnnotation::Returns {
            arg: exactly_one(&raw)?,
        },
        "__no_capability_analysis" => CapAnnotation::NoAnalysis,
        "__guarded_by" | "__var_guarded_by" => CapAnnotation::GuardedBy {
            arg: exactly_one(&raw)?,
        },
        "__pt_guarded_by" | "__ref_guarded_by" => CapAnnotation::PtGuardedBy {
            arg: exactly_one(&raw)?,
        },
        _ => return Ok(None),
    };

    Ok(Some(ann))
}

/// `__cond_acquires(x)` succeeds on a true return; the two-argument forms
/// spell the success value first: `__cond_acquires(0, x)`.
fn try_acquires(
    text: &str,
    mode: Mode,
    raw: &[String],
    value_required: bool,
    exprs: &dyn Fn(&[String]) -> Result<Vec<Expr>, AnnotationError>,
) -> Result<CapAnnotation, AnnotationError> {
    let (success, caps) = match raw {
        [] => {
            return Err(AnnotationError::Arity {
                attr: text.to_string(),
                expected: "a capability expression",
            });
        }
        [single] if !value_required => (true, std::slice::from_ref(single)),
        [_] => {
            return Err(AnnotationError::Arity {
                attr: text.to_string(),
                expected: "a return value and a capability expression",
            });
        }
        [value, rest @ ..] => (parse_success_value(text, value)?, rest),
    };

    Ok(CapAnnotation::TryAcquires {
        mode,
        success,
        args: exprs(caps)?,
    })
}

fn parse_success_value(attr: &str, value: &str) -> Result<bool, AnnotationError> {
    match parse_expr(value).ok().and_then(|e| e.as_int()) {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(AnnotationError::ReturnValue {
            attr: attr.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Effect-only helper calls that the analysis understands without a
/// declaration (`__acquire(x)`, `__release(x)`, `__cond_acquire(x, c)`,
/// `__assert_cap(x)`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    Acquire(Mode),
    Release(Mode),
    /// Acquires when the second argument (also the return value) is true.
    TryAcquire(Mode),
    Assert(Mode),
}

pub fn intrinsic(callee: &str) -> Option<Intrinsic> {
    let intrinsic = match callee {
        "__acquire" | "__acquire_cap" => Intrinsic::Acquire(Mode::Exclusive),
        "__acquire_shared" | "__acquire_shared_cap" => Intrinsic::Acquire(Mode::Shared),
        "__release" | "__release_cap" => Intrinsic::Release(Mode::Exclusive),
        "__release_shared" | "__release_shared_cap" => Intrinsic::Release(Mode::Shared),
        "__cond_acquire" | "__try_acquire_cap" => Intrinsic::TryAcquire(Mode::Exclusive),
        "__cond_acquire_shared" | "__try_acquire_shared_cap" => {
            Intrinsic::TryAcquire(Mode::Shared)
        }
        "__assert_cap" => Intrinsic::Assert(Mode::Exclusive),
        "__assert_shared_cap" => Intrinsic::Assert(Mode::Shared),
        _ => return None,
    };
    Some(intrinsic)
}
