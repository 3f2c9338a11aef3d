use capcheck::diagnostics::{Diagnostic, DiagnosticKind};
use capcheck::error::CapCheckError;
use capcheck::level::Severity;
use capcheck::program::Program;
use capcheck::{CheckEngine, CheckSettings, Report, create_default_engine};

const PRELUDE: &str = r#"
    "capability_types": [{"name": "spinlock_t"}, {"name": "rwlock_t"}],
    "structs": [{"name": "foo", "fields": [
        {"name": "lock", "ty": "spinlock_t"},
        {"name": "rw", "ty": "rwlock_t"},
        {"name": "counter", "ty": "int", "attrs": ["__guarded_by(&lock)"]},
        {"name": "stats", "ty": "int", "attrs": ["__guarded_by(&rw)"]},
        {"name": "data", "ty": "int *", "attrs": ["__pt_guarded_by(&lock)"]}
    ]}],
    "globals": [
        {"name": "big_lock", "ty": "spinlock_t"},
        {"name": "total", "ty": "long", "attrs": ["__guarded_by(&big_lock)"]}
    ]
"#;

const LOCK_API: &str = r#"
    {"name": "spin_lock", "params": [{"name": "l", "ty": "spinlock_t *"}], "attrs": ["__acquires(l)"]},
    {"name": "spin_unlock", "params": [{"name": "l", "ty": "spinlock_t *"}], "attrs": ["__releases(l)"]},
    {"name": "spin_trylock", "params": [{"name": "l", "ty": "spinlock_t *"}], "attrs": ["__cond_acquires(l)"]},
    {"name": "read_lock", "params": [{"name": "l", "ty": "rwlock_t *"}], "attrs": ["__acquires_shared(l)"]},
    {"name": "read_unlock", "params": [{"name": "l", "ty": "rwlock_t *"}], "attrs": ["__releases_shared(l)"]}
"#;

fn unit(name: &str, functions: &str) -> String {
    format!(
        r#"{{"name": "{name}", {PRELUDE}, "functions": [{LOCK_API}, {functions}]}}"#
    )
}

fn program(units: &[String]) -> Program {
    let json = format!(r#"{{"units": [{}]}}"#, units.join(", "));
    Program::from_json(&json).expect("program should parse")
}

fn check(functions: &str) -> Report {
    create_default_engine()
        .check(&program(&[unit("foo.c", functions)]))
        .expect("check should succeed")
}

/// `(kind, function, block, stmt)` of every diagnostic, in report order.
fn positions(diags: &[Diagnostic]) -> Vec<(DiagnosticKind, &str, Option<usize>, Option<usize>)> {
    diags
        .iter()
        .map(|d| {
            (
                d.kind,
                d.location.function.as_str(),
                d.location.block,
                d.location.stmt,
            )
        })
        .collect()
}

const F: &str = r#""params": [{"name": "f", "ty": "struct foo *"}]"#;

#[test]
fn balanced_acquire_release_is_clean() {
    let report = check(&format!(
        r#"{{"name": "foo_inc", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}},
            {{"write": "f->counter"}},
            {{"read": "f->counter"}},
            {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
        ]}}]}}}}"#
    ));

    assert!(report.diagnostics.is_empty(), "{:#?}", report.diagnostics);
    assert_eq!(report.summary.functions_analyzed, 1);
    assert!(report.summary.passed);
}

#[test]
fn release_requires_prior_hold() {
    let report = check(&format!(
        r#"{{"name": "foo_put", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}, "line": 9}}
        ]}}]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "foo_put", Some(0), Some(0))]
    );
    let diag = &report.diagnostics[0];
    assert_eq!(diag.message, "`spin_unlock` releases `f->lock`, but it is not held");
    assert_eq!(diag.contract.as_deref(), Some("__releases(l)"));
    assert_eq!(diag.location.line, Some(9));
}

#[test]
fn exclusive_hold_satisfies_shared_but_not_the_reverse() {
    let report = check(&format!(
        r#"{{"name": "reader", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}},
            {{"read": "f->counter"}},
            {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
        ]}}]}}}},
        {{"name": "writer", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "read_lock", "args": ["&f->rw"]}}}},
            {{"read": "f->stats"}},
            {{"write": "f->stats"}},
            {{"call": {{"callee": "read_unlock", "args": ["&f->rw"]}}}}
        ]}}]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "writer", Some(0), Some(2))]
    );
    assert_eq!(
        report.diagnostics[0].message,
        "writing `f->stats` requires `f->rw` held exclusively, but it is held shared"
    );
}

#[test]
fn merge_of_disagreeing_paths_is_not_held() {
    let report = check(&format!(
        r#"{{"name": "maybe", {F}, "body": {{"blocks": [
            {{"term": {{"branch": {{"cond": "opaque", "then": 1, "else": 2}}}}}},
            {{"stmts": [{{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}],
              "term": {{"goto": 2}}}},
            {{"stmts": [{{"write": "f->counter"}}], "term": "return"}}
        ]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![
            (DiagnosticKind::NotHeld, "maybe", Some(2), Some(0)),
            (DiagnosticKind::StillHeld, "maybe", Some(2), Some(1)),
        ]
    );
    assert!(report.diagnostics[0].message.ends_with("but it is possibly not held"));
    assert_eq!(
        report.diagnostics[1].message,
        "`f->lock` is possibly still held when `maybe` returns"
    );
}

#[test]
fn exit_after_merge_reports_possible_holds() {
    let report = check(&format!(
        r#"{{"name": "put", {F}, "attrs": ["__releases(&f->lock)"], "body": {{"blocks": [
            {{"term": {{"branch": {{"cond": "opaque", "then": 1, "else": 2}}}}}},
            {{"stmts": [{{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}],
              "term": {{"goto": 2}}}},
            {{"term": "return"}}
        ]}}}},
        {{"name": "maybe_unlock", {F}, "body": {{"blocks": [
            {{"stmts": [{{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}],
              "term": {{"branch": {{"cond": "opaque", "then": 1, "else": 2}}}}}},
            {{"stmts": [{{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}],
              "term": {{"goto": 2}}}},
            {{"term": "return"}}
        ]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![
            (DiagnosticKind::StillHeld, "maybe_unlock", Some(2), Some(0)),
            (DiagnosticKind::ContractMismatch, "put", Some(2), Some(0)),
        ]
    );
    assert_eq!(
        report.diagnostics[0].message,
        "`f->lock` is possibly still held when `maybe_unlock` returns"
    );
    assert_eq!(
        report.diagnostics[1].message,
        "`put` releases `f->lock`, but it is possibly still held on return"
    );
    assert_eq!(report.diagnostics[1].contract.as_deref(), Some("__releases(&f->lock)"));
}

#[test]
fn try_lock_splits_environment_at_branch() {
    let report = check(&format!(
        r#"{{"name": "try_inc", {F}, "locals": [{{"name": "ret", "ty": "int"}}],
            "body": {{"blocks": [
                {{"stmts": [{{"call": {{"callee": "spin_trylock", "args": ["&f->lock"], "dest": "ret"}}}}],
                  "term": {{"branch": {{"cond": {{"local": "ret"}}, "then": 1, "else": 2}}}}}},
                {{"stmts": [
                    {{"write": "f->counter"}},
                    {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
                 ], "term": "return"}},
                {{"term": "return"}}
            ]}}}},
        {{"name": "try_wrong_arm", {F}, "locals": [{{"name": "ret", "ty": "int"}}],
            "body": {{"blocks": [
                {{"stmts": [{{"call": {{"callee": "spin_trylock", "args": ["&f->lock"], "dest": "ret"}}}}],
                  "term": {{"branch": {{"cond": {{"not": "ret"}}, "then": 1, "else": 2}}}}}},
                {{"stmts": [{{"write": "f->counter"}}], "term": "return"}},
                {{"stmts": [{{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}], "term": "return"}}
            ]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "try_wrong_arm", Some(1), Some(0))]
    );
    assert!(report.diagnostics[0].message.ends_with("but it is not held"));
}

#[test]
fn intrinsic_try_acquire_with_constant_resolves_immediately() {
    let report = check(&format!(
        r#"{{"name": "always", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "__cond_acquire", "args": ["&f->lock", "1"]}}}},
            {{"write": "f->counter"}},
            {{"call": {{"callee": "__release", "args": ["&f->lock"]}}}}
        ]}}]}}}}"#
    ));

    assert!(report.diagnostics.is_empty(), "{:#?}", report.diagnostics);
}

#[test]
fn suppressed_region_passes_environment_through() {
    let report = check(&format!(
        r#"{{"name": "markers", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "disable_capability_analysis"}}}},
            {{"write": "f->counter"}},
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}},
            {{"call": {{"callee": "enable_capability_analysis"}}}},
            {{"write": "f->counter"}}
        ]}}]}}}},
        {{"name": "scoped", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}},
            {{"unsafe": [{{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}]}},
            {{"write": "f->counter"}},
            {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
        ]}}]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "markers", Some(0), Some(4))]
    );
}

#[test]
fn unbalanced_markers_are_usage_errors() {
    let report = check(&format!(
        r#"{{"name": "stray_enable", {F}, "body": {{"blocks": [{{"stmts": [
            {{"suppress_end": null}}
        ]}}]}}}},
        {{"name": "open_at_return", {F}, "body": {{"blocks": [{{"stmts": [
            {{"suppress_begin": null}},
            {{"write": "f->counter"}}
        ]}}]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![
            (DiagnosticKind::UnbalancedSuppression, "open_at_return", None, None),
            (DiagnosticKind::UnbalancedSuppression, "stray_enable", None, None),
        ]
    );
    assert_eq!(report.summary.usage_errors, 2);
    assert!(report.diagnostics.iter().all(|d| d.severity == Severity::Error));
    assert!(!report.summary.passed);
}

#[test]
fn deeply_nested_marker_regions_balance() {
    let begin = vec![r#"{"suppress_begin": null}"#; 17].join(", ");
    let end = vec![r#"{"suppress_end": null}"#; 17].join(", ");
    let report = check(&format!(
        r#"{{"name": "nested", {F}, "body": {{"blocks": [{{"stmts": [
            {begin}, {{"write": "f->counter"}}, {end}, {{"write": "f->counter"}}
        ]}}]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "nested", Some(0), Some(35))]
    );
    assert_eq!(report.summary.usage_errors, 0);
}

#[test]
fn region_opened_every_iteration_converges() {
    let report = check(&format!(
        r#"{{"name": "spin", {F}, "body": {{"blocks": [
            {{"stmts": [], "term": {{"goto": 1}}}},
            {{"stmts": [{{"suppress_begin": null}}, {{"write": "f->counter"}}],
              "term": {{"branch": {{"cond": "opaque", "then": 2, "else": 3}}}}}},
            {{"stmts": [], "term": {{"backedge": 1}}}},
            {{"stmts": [], "term": "return"}}
        ]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::UnbalancedSuppression, "spin", None, None)]
    );
}

#[test]
fn loop_backedge_forces_conservative_state() {
    // The lock is dropped inside the loop on some iterations only.
    let report = check(&format!(
        r#"{{"name": "drain", {F}, "body": {{"blocks": [
            {{"stmts": [{{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}],
              "term": {{"goto": 1}}}},
            {{"stmts": [{{"write": "f->counter"}}],
              "term": {{"branch": {{"cond": "opaque", "then": 2, "else": 3}}}}}},
            {{"stmts": [{{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}],
              "term": {{"backedge": 1}}}},
            {{"stmts": [{{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}],
              "term": "return"}}
        ]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![
            (DiagnosticKind::NotHeld, "drain", Some(1), Some(0)),
            (DiagnosticKind::NotHeld, "drain", Some(2), Some(0)),
            (DiagnosticKind::NotHeld, "drain", Some(3), Some(0)),
        ]
    );
}

#[test]
fn constant_branch_only_follows_taken_arm() {
    let report = check(&format!(
        r#"{{"name": "debug_only", {F}, "locals": [{{"name": "dbg", "ty": "int"}}],
            "body": {{"blocks": [
                {{"stmts": [{{"assign": {{"dest": "dbg", "value": "0"}}}}],
                  "term": {{"branch": {{"cond": {{"local": "dbg"}}, "then": 1, "else": 2}}}}}},
                {{"stmts": [{{"write": "f->counter"}}], "term": "return"}},
                {{"term": "return"}}
            ]}}}}"#
    ));

    assert!(report.diagnostics.is_empty(), "{:#?}", report.diagnostics);
}

#[test]
fn function_exit_is_checked_against_own_contract() {
    let report = check(&format!(
        r#"{{"name": "lock_foo", {F}, "attrs": ["__acquires(&f->lock)"], "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}
        ]}}]}}}},
        {{"name": "forget_lock", {F}, "attrs": ["__acquires(&f->lock)"], "body": {{"blocks": [{{}}]}}}},
        {{"name": "unlock_foo", {F}, "attrs": ["__releases(&f->lock)"], "body": {{"blocks": [{{"stmts": [
            {{"write": "f->counter"}},
            {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
        ]}}]}}}},
        {{"name": "drops_required", {F}, "attrs": ["__must_hold(&f->lock)"], "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
        ]}}]}}}},
        {{"name": "leak", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}
        ]}}]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![
            (DiagnosticKind::ContractMismatch, "drops_required", Some(0), Some(1)),
            (DiagnosticKind::ContractMismatch, "forget_lock", Some(0), Some(0)),
            (DiagnosticKind::StillHeld, "leak", Some(0), Some(1)),
        ]
    );
    let messages: Vec<_> = report.diagnostics.iter().map(|d| d.message.as_str()).collect();
    assert_eq!(
        messages,
        vec![
            "`drops_required` is called with `f->lock` held and must return with it held exclusively, but it is not held",
            "`forget_lock` must return with `f->lock` held exclusively, but it is not held",
            "`f->lock` is still held exclusively when `leak` returns",
        ]
    );
}

#[test]
fn call_sites_check_callee_requirements() {
    let report = check(&format!(
        r#"{{"name": "foo_update", {F}, "attrs": ["__must_hold(&f->lock)"]}},
        {{"name": "foo_sleep", {F}, "attrs": ["__must_not_hold(&f->lock)"]}},
        {{"name": "unlocked_update", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "foo_update", "args": ["f"]}}}}
        ]}}]}}}},
        {{"name": "sleep_locked", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}},
            {{"call": {{"callee": "foo_update", "args": ["f"]}}}},
            {{"call": {{"callee": "foo_sleep", "args": ["f"]}}}},
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}},
            {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
        ]}}]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![
            (DiagnosticKind::Excluded, "sleep_locked", Some(0), Some(2)),
            (DiagnosticKind::Excluded, "sleep_locked", Some(0), Some(3)),
            (DiagnosticKind::NotHeld, "unlocked_update", Some(0), Some(0)),
        ]
    );
    assert_eq!(
        report.diagnostics[0].message,
        "calling `foo_sleep` requires `f->lock` not held, but it is held exclusively"
    );
    assert_eq!(
        report.diagnostics[1].message,
        "`spin_lock` acquires `f->lock`, but it is already held exclusively"
    );
    assert_eq!(
        report.diagnostics[2].message,
        "calling `foo_update` requires `f->lock` held exclusively, but it is not held"
    );
}

#[test]
fn returned_capability_binds_the_result_local() {
    let report = check(&format!(
        r#"{{"name": "foo_lock_of", {F}, "attrs": ["__returns_cap(&f->lock)"]}},
        {{"name": "via_accessor", {F}, "locals": [{{"name": "l", "ty": "spinlock_t *"}}],
            "body": {{"blocks": [{{"stmts": [
                {{"call": {{"callee": "foo_lock_of", "args": ["f"], "dest": "l"}}}},
                {{"call": {{"callee": "spin_lock", "args": ["l"]}}}},
                {{"write": "f->counter"}},
                {{"call": {{"callee": "spin_unlock", "args": ["l"]}}}}
            ]}}]}}}}"#
    ));

    assert!(report.diagnostics.is_empty(), "{:#?}", report.diagnostics);
}

#[test]
fn pointer_locals_alias_their_target() {
    let report = check(&format!(
        r#"{{"name": "via_local", {F}, "locals": [{{"name": "l", "ty": "spinlock_t *"}}],
            "body": {{"blocks": [{{"stmts": [
                {{"assign": {{"dest": "l", "value": "&f->lock"}}}},
                {{"call": {{"callee": "spin_lock", "args": ["l"]}}}},
                {{"write": "f->counter"}},
                {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
            ]}}]}}}}"#
    ));

    assert!(report.diagnostics.is_empty(), "{:#?}", report.diagnostics);
}

#[test]
fn assertions_establish_holds_without_reports() {
    let report = check(&format!(
        r#"{{"name": "asserted", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "__assert_cap", "args": ["&f->lock"]}}}},
            {{"write": "f->counter"}}
        ]}}]}}}}"#
    ));

    assert!(report.diagnostics.is_empty(), "{:#?}", report.diagnostics);
}

#[test]
fn guarded_globals() {
    let report = check(
        r#"{"name": "bump_total", "body": {"blocks": [{"stmts": [
            {"write": "total"}
        ]}]}},
        {"name": "bump_total_locked", "body": {"blocks": [{"stmts": [
            {"call": {"callee": "spin_lock", "args": ["&big_lock"]}},
            {"assign": {"dest": "total", "value": "0"}},
            {"call": {"callee": "spin_unlock", "args": ["&big_lock"]}}
        ]}]}}"#,
    );

    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "bump_total", Some(0), Some(0))]
    );
    assert_eq!(report.diagnostics[0].instance.as_deref(), Some("big_lock"));
    assert_eq!(
        report.diagnostics[0].message,
        "writing `total` requires `big_lock` held exclusively, but it is not held"
    );
}

#[test]
fn pointee_guard_covers_the_target_not_the_pointer() {
    let report = check(&format!(
        r#"{{"name": "peek_unlocked", {F}, "body": {{"blocks": [{{"stmts": [
            {{"read": "*f->data"}}
        ]}}]}}}},
        {{"name": "peek_locked", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}},
            {{"read": "*f->data"}},
            {{"write": "*f->data"}},
            {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
        ]}}]}}}},
        {{"name": "repoint", {F}, "body": {{"blocks": [{{"stmts": [
            {{"write": "f->data"}},
            {{"read": "f->data"}}
        ]}}]}}}}"#
    ));

    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "peek_unlocked", Some(0), Some(0))]
    );
    assert_eq!(report.diagnostics[0].instance.as_deref(), Some("f->lock"));
    assert_eq!(
        report.diagnostics[0].message,
        "reading `*(f->data)` requires `f->lock` held (at least shared), but it is not held"
    );
    assert_eq!(
        report.diagnostics[0].contract.as_deref(),
        Some("__pt_guarded_by(&lock)")
    );
}

#[test]
fn no_analysis_functions_are_skipped_but_keep_contracts() {
    let report = check(&format!(
        r#"{{"name": "raw_update", {F}, "attrs": ["__no_capability_analysis", "__must_hold(&f->lock)"],
            "body": {{"blocks": [{{"stmts": [{{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}]}}]}}}},
        {{"name": "caller", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "raw_update", "args": ["f"]}}}}
        ]}}]}}}}"#
    ));

    assert_eq!(report.summary.functions_analyzed, 1);
    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "caller", Some(0), Some(0))]
    );
}

#[test]
fn treat_as_fatal_promotes_violations() {
    let leak = format!(
        r#"{{"name": "leak", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}
        ]}}]}}}}"#
    );
    let prog = program(&[unit("foo.c", &leak)]);

    let lenient = create_default_engine().check(&prog).unwrap();
    assert_eq!(lenient.diagnostics[0].severity, Severity::Warn);
    assert!(lenient.summary.passed);

    let strict = CheckEngine::new(CheckSettings::default().with_treat_as_fatal(true))
        .check(&prog)
        .unwrap();
    assert_eq!(strict.diagnostics[0].severity, Severity::Error);
    assert_eq!(strict.summary.violations, 1);
    assert!(!strict.summary.passed);
}

#[test]
fn declaration_errors_skip_only_their_unit() {
    let broken = unit(
        "a.c",
        &format!(
            r#"{{"name": "bad", {F}, "attrs": ["__must_hold(&f->lock)", "__acquires(&f->lock)"],
                "body": {{"blocks": [{{}}]}}}}"#
        ),
    );
    let fine = unit(
        "b.c",
        &format!(
            r#"{{"name": "leak", {F}, "body": {{"blocks": [{{"stmts": [
                {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}
            ]}}]}}}}"#
        ),
    );

    let report = create_default_engine()
        .check(&program(&[broken, fine]))
        .unwrap();

    let found: Vec<_> = report
        .diagnostics
        .iter()
        .map(|d| (d.location.unit.as_str(), d.kind, d.severity))
        .collect();
    assert_eq!(
        found,
        vec![
            ("a.c", DiagnosticKind::Declaration, Severity::Error),
            ("b.c", DiagnosticKind::StillHeld, Severity::Warn),
        ]
    );
    assert_eq!(report.summary.functions_analyzed, 1);
    assert_eq!(report.summary.declaration_errors, 1);
    assert!(!report.summary.passed);
}

#[test]
fn static_helpers_keep_their_own_unit_contract() {
    let locking = unit(
        "a.c",
        &format!(
            r#"{{"name": "grab", "static": true, {F}, "attrs": ["__acquires(&f->lock)"]}},
            {{"name": "bump", {F}, "body": {{"blocks": [{{"stmts": [
                {{"call": {{"callee": "grab", "args": ["f"]}}}},
                {{"write": "f->counter"}},
                {{"call": {{"callee": "spin_unlock", "args": ["&f->lock"]}}}}
            ]}}]}}}}"#
        ),
    );
    let checking = unit(
        "b.c",
        &format!(
            r#"{{"name": "grab", "static": true, {F}, "attrs": ["__must_hold(&f->lock)"]}},
            {{"name": "peek", {F}, "body": {{"blocks": [{{"stmts": [
                {{"call": {{"callee": "grab", "args": ["f"]}}}}
            ]}}]}}}}"#
        ),
    );

    let report = create_default_engine()
        .check(&program(&[locking, checking]))
        .unwrap();

    assert_eq!(report.summary.declaration_errors, 0);
    assert_eq!(
        positions(&report.diagnostics),
        vec![(DiagnosticKind::NotHeld, "peek", Some(0), Some(0))]
    );
    assert_eq!(report.diagnostics[0].location.unit, "b.c");
}

#[test]
fn contract_naming_unknown_parameter_is_fatal() {
    let prog = program(&[unit(
        "foo.c",
        &format!(r#"{{"name": "typo", {F}, "attrs": ["__must_hold(&g->lock)"]}}"#),
    )]);

    let err = create_default_engine().check(&prog).unwrap_err();
    assert!(matches!(err, CapCheckError::Malformed(_)), "{err}");
}

#[test]
fn edge_to_missing_block_is_fatal() {
    let prog = program(&[unit(
        "foo.c",
        r#"{"name": "broken", "body": {"blocks": [{"term": {"goto": 3}}]}}"#,
    )]);

    let err = create_default_engine().check(&prog).unwrap_err();
    assert!(matches!(err, CapCheckError::Malformed(_)), "{err}");
}

#[test]
fn opted_in_scope_skips_other_units() {
    let leak = format!(
        r#"{{"name": "leak", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}
        ]}}]}}}}"#
    );
    let opted_out = unit("legacy.c", &leak).replacen('{', r#"{"opted_in": false, "#, 1);
    let prog = program(&[opted_out, unit("new.c", &leak)]);

    let settings = CheckSettings::default().with_scope(Some(capcheck::config::Scope::OptedIn));
    let report = CheckEngine::new(settings).check(&prog).unwrap();

    assert_eq!(report.summary.functions_analyzed, 1);
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].location.unit, "new.c");
}

#[test]
fn results_do_not_depend_on_worker_count() {
    let body = format!(
        r#"{{"name": "maybe", {F}, "body": {{"blocks": [
            {{"term": {{"branch": {{"cond": "opaque", "then": 1, "else": 2}}}}}},
            {{"stmts": [{{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}],
              "term": {{"goto": 2}}}},
            {{"stmts": [{{"write": "f->counter"}}], "term": "return"}}
        ]}}}}"#
    );
    let units: Vec<String> = (0..6).map(|i| unit(&format!("u{i}.c"), &body)).collect();
    let prog = program(&units);

    let render = |jobs: usize| {
        let report = CheckEngine::new(CheckSettings::default().with_jobs(Some(jobs)))
            .check(&prog)
            .unwrap();
        serde_json::to_string(&report).unwrap()
    };

    let sequential = render(1);
    assert_eq!(sequential, render(4));
    assert_eq!(sequential, render(0));
    assert_eq!(sequential, render(1));
}

#[test]
fn disabled_checker_reports_nothing() {
    let leak = format!(
        r#"{{"name": "leak", {F}, "body": {{"blocks": [{{"stmts": [
            {{"call": {{"callee": "spin_lock", "args": ["&f->lock"]}}}}
        ]}}]}}}}"#
    );
    let mut settings = CheckSettings::default();
    settings.enabled = false;

    let report = CheckEngine::new(settings)
        .check(&program(&[unit("foo.c", &leak)]))
        .unwrap();
    assert!(report.diagnostics.is_empty());
    assert!(report.summary.passed);
}
