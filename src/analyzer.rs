//! Intraprocedural capability analysis.
//!
//! Forward dataflow over one function's control-flow graph. Block entry
//! environments are computed with a worklist in reverse postorder until they
//! stop changing; only then is every reachable block walked once more, from
//! its stable entry environment, to record diagnostics. Transient states seen
//! while iterating are never reported.

use crate::annotations::{Intrinsic, intrinsic};
use crate::capability::{Instance, InstanceError, InstanceRef, Lowered, Mode, RootResolver, lower};
use crate::contract::{Access, AnnotationTable, CType, ContractCap, FunctionContract, GuardSpec, TypeError};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Location};
use crate::environment::{
    BoundCap, BoundContract, CallResult, Environment, HeldState, Violation, apply_effects,
    apply_requires, held_phrase,
};
use crate::error::CapCheckResult;
use crate::expr::{Expr, parse_expr};
use crate::level::Severity;
use crate::program::{
    AssignStmt, Block, Body, BranchTerm, CallStmt, Condition, FunctionDecl, Statement,
    StatementKind, Terminator,
};
use crate::suppression::{Marker, SuppressionScope, marker_for_call};
use crate::{capcheck_bail, capcheck_debug, capcheck_ensure};
use std::collections::{BTreeSet, HashMap};

/// Bound on entry-state changes per block; the lattice is finite, so hitting
/// it means the input is pathological.
const MAX_STATE_UPDATES_PER_BLOCK: usize = 512;

/// Result of analyzing one function.
#[derive(Debug, Default)]
pub struct FunctionOutcome {
    pub diagnostics: Vec<Diagnostic>,
    /// Blocks visited before the fixed point was reached.
    pub iterations: usize,
    pub reachable_blocks: usize,
}

/// Statement position used for diagnostics.
#[derive(Debug, Clone, Copy)]
struct Site {
    block: usize,
    stmt: usize,
    line: Option<u32>,
}

/// Diagnostics are kept only during the recording pass.
struct Sink {
    recording: bool,
    diagnostics: Vec<Diagnostic>,
}

impl Sink {
    fn muted() -> Self {
        Self {
            recording: false,
            diagnostics: Vec::new(),
        }
    }

    fn recording() -> Self {
        Self {
            recording: true,
            diagnostics: Vec::new(),
        }
    }
}

/// What an assignment teaches about the destination local.
enum Tracked {
    Nothing,
    Constant(bool),
    Binding(InstanceRef),
    Copy(String),
}

pub struct FunctionAnalysis<'a> {
    table: &'a AnnotationTable,
    unit: &'a str,
    decl: &'a FunctionDecl,
    body: &'a Body,
    vars: HashMap<&'a str, CType>,
    /// The function's own contract bound to its parameters.
    own: BoundContract,
    severity: Severity,
}

/// Resolves identifiers inside a function body.
struct BodyRoots<'r, 'a> {
    analysis: &'r FunctionAnalysis<'a>,
    env: &'r Environment,
}

impl RootResolver for BodyRoots<'_, '_> {
    fn resolve_root(&self, ident: &str) -> Result<Lowered, InstanceError> {
        if let Some(target) = self.env.binding(ident) {
            return Ok(Lowered::Address(target.clone()));
        }
        if self.analysis.vars.contains_key(ident) {
            return Ok(Lowered::Place(InstanceRef::Variable(ident.to_string())));
        }
        self.analysis
            .table
            .global_root(ident)
            .ok_or_else(|| InstanceError::UnknownName(ident.to_string()))
    }
}

impl<'a> FunctionAnalysis<'a> {
    pub fn new(
        table: &'a AnnotationTable,
        unit: &'a str,
        decl: &'a FunctionDecl,
        body: &'a Body,
        severity: Severity,
    ) -> Self {
        let vars = decl
            .params
            .iter()
            .chain(&decl.locals)
            .map(|v| (v.name.as_str(), CType::parse(&v.ty)))
            .collect();
        let own = bind_contract(&decl.name, table.contract_for(unit, &decl.name), &|root| match root {
            InstanceRef::Param(idx) => decl
                .params
                .get(*idx)
                .map(|p| Lowered::Place(InstanceRef::Variable(p.name.clone()))),
            _ => None,
        });

        Self {
            table,
            unit,
            decl,
            body,
            vars,
            own,
            severity,
        }
    }

    /// Run the analysis to its fixed point and record diagnostics.
    pub fn analyze(&self) -> CapCheckResult<FunctionOutcome> {
        let blocks = &self.body.blocks;
        let entry = self.body.entry;
        capcheck_ensure!(
            entry < blocks.len(),
            "{}: `{}`: entry block {entry} does not exist",
            self.unit,
            self.decl.name
        );
        for (idx, block) in blocks.iter().enumerate() {
            for succ in block.term.successors() {
                capcheck_ensure!(
                    succ < blocks.len(),
                    "{}: `{}`: bb{idx} jumps to nonexistent block {succ}",
                    self.unit,
                    self.decl.name
                );
            }
        }

        let rpo = reverse_postorder(entry, blocks);
        let mut position = vec![usize::MAX; blocks.len()];
        for (pos, &idx) in rpo.iter().enumerate() {
            position[idx] = pos;
        }

        let mut in_states: Vec<Option<Environment>> = vec![None; blocks.len()];
        in_states[entry] = Some(self.entry_environment());
        let mut worklist = BTreeSet::from([position[entry]]);
        let mut updates = vec![0usize; blocks.len()];
        let mut iterations = 0usize;
        let mut muted = Sink::muted();

        while let Some(pos) = worklist.pop_first() {
            let idx = rpo[pos];
            let Some(env) = in_states[idx].clone() else {
                continue;
            };
            iterations += 1;

            for (succ, out) in self.run_block(idx, env, &mut muted) {
                let (merged, changed) = match in_states[succ].take() {
                    None => (out, true),
                    Some(old) => {
                        let joined = old.join(&out);
                        let changed = joined != old;
                        (joined, changed)
                    }
                };
                in_states[succ] = Some(merged);
                if changed {
                    updates[succ] += 1;
                    if updates[succ] > MAX_STATE_UPDATES_PER_BLOCK {
                        capcheck_bail!(
                            "{}: `{}`: analysis of bb{succ} did not converge",
                            self.unit,
                            self.decl.name
                        );
                    }
                    worklist.insert(position[succ]);
                }
            }
        }

        capcheck_debug!(
            function = %self.decl.name,
            iterations,
            blocks = rpo.len(),
            "fixed point reached"
        );

        let mut sink = Sink::recording();
        for &idx in &rpo {
            if let Some(env) = in_states[idx].clone() {
                self.run_block(idx, env, &mut sink);
            }
        }

        Ok(FunctionOutcome {
            diagnostics: sink.diagnostics,
            iterations,
            reachable_blocks: rpo.len(),
        })
    }

    /// Requires and releases are held on entry.
    fn entry_environment(&self) -> Environment {
        let mut env = Environment::new();
        for cap in self.own.requires.iter().chain(&self.own.releases) {
            env.set(&cap.instance, HeldState::held(cap.mode));
        }
        env
    }

    // ========================================================================
    // Blocks and statements
    // ========================================================================

    fn run_block(
        &self,
        idx: usize,
        mut env: Environment,
        sink: &mut Sink,
    ) -> Vec<(usize, Environment)> {
        let block = &self.body.blocks[idx];
        if env.suppression_conflict() {
            self.emit(
                sink,
                None,
                DiagnosticKind::UnbalancedSuppression,
                None,
                "paths with different capability-analysis suppression depths merge".to_string(),
                None,
            );
        }

        let scope = SuppressionScope::new();
        for (stmt_idx, stmt) in block.stmts.iter().enumerate() {
            let site = Site {
                block: idx,
                stmt: stmt_idx,
                line: stmt.line,
            };
            self.statement(&mut env, stmt, site, &scope, sink);
        }

        let site = Site {
            block: idx,
            stmt: block.stmts.len(),
            line: None,
        };
        self.terminator(env, &block.term, site, sink)
    }

    fn statement(
        &self,
        env: &mut Environment,
        stmt: &Statement,
        site: Site,
        scope: &SuppressionScope,
        sink: &mut Sink,
    ) {
        let site = Site {
            line: stmt.line.or(site.line),
            ..site
        };

        if let StatementKind::Call(call) = &stmt.kind
            && let Some(marker) = marker_for_call(&call.callee)
        {
            self.marker(env, marker, sink);
            return;
        }

        match &stmt.kind {
            StatementKind::Plain(_) => {}
            StatementKind::SuppressBegin => self.marker(env, Marker::Begin, sink),
            StatementKind::SuppressEnd => self.marker(env, Marker::End, sink),
            StatementKind::Unsafe(nested) => {
                let depth = env.suppression_depth();
                {
                    let _guard = scope.enter();
                    for inner in nested {
                        self.statement(env, inner, site, scope, sink);
                    }
                }
                if env.suppression_depth() != depth {
                    self.emit(
                        sink,
                        None,
                        DiagnosticKind::UnbalancedSuppression,
                        None,
                        "suppression markers inside `capability_unsafe` do not match".to_string(),
                        None,
                    );
                    env.restore_suppression(depth);
                }
            }
            _ if !scope.checks_enabled(env.suppression_depth()) => {}
            StatementKind::Call(call) => self.call(env, call, site, sink),
            StatementKind::Read(path) => self.access(env, path, Access::Read, site, sink),
            StatementKind::Write(path) => self.access(env, path, Access::Write, site, sink),
            StatementKind::Assign(assign) => self.assign(env, assign, site, sink),
        }
    }

    fn marker(&self, env: &mut Environment, marker: Marker, sink: &mut Sink) {
        match marker {
            Marker::Begin => env.enter_suppression(),
            Marker::End => {
                if !env.leave_suppression() {
                    self.emit(
                        sink,
                        None,
                        DiagnosticKind::UnbalancedSuppression,
                        None,
                        "`enable_capability_analysis()` without a matching \
                         `disable_capability_analysis()`"
                            .to_string(),
                        None,
                    );
                }
            }
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn call(&self, env: &mut Environment, call: &CallStmt, site: Site, sink: &mut Sink) {
        let dest = call.dest.as_deref();

        let (bound, value, correlate) = if let Some(intr) = intrinsic(&call.callee) {
            let (bound, value, arg_local) = self.bind_intrinsic(env, &call.callee, intr, &call.args);
            (bound, value, dest.map(str::to_string).or(arg_local))
        } else {
            let contract = self.table.contract_for(self.unit, &call.callee);
            let bound = self.bind_call(env, &call.callee, contract, &call.args);
            if let Err(violations) = apply_requires(env, &bound) {
                for violation in violations {
                    self.emit_violation(sink, site, violation);
                }
            }
            (bound, None, dest.map(str::to_string))
        };

        if let Some(dest) = dest {
            env.rebind_local(dest);
        }
        let result = CallResult {
            local: correlate.as_deref(),
            value,
        };
        apply_effects(env, &bound, result, self.table.capabilities());

        if let (Some(dest), Some(ret)) = (dest, bound.returns) {
            env.bind(dest, ret.instance.reference);
        }
    }

    fn bind_call(
        &self,
        env: &Environment,
        callee: &str,
        contract: &FunctionContract,
        args: &[String],
    ) -> BoundContract {
        let values: Vec<Option<Lowered>> = args.iter().map(|a| self.lower_text(env, a)).collect();
        bind_contract(callee, contract, &|root| match root {
            InstanceRef::Param(idx) => values.get(*idx).cloned().flatten(),
            _ => None,
        })
    }

    /// Intrinsics carry their capability as the first argument. The second
    /// argument of a conditional acquire is its return value.
    fn bind_intrinsic(
        &self,
        env: &Environment,
        callee: &str,
        intr: Intrinsic,
        args: &[String],
    ) -> (BoundContract, Option<bool>, Option<String>) {
        let mut bound = BoundContract {
            callee: callee.to_string(),
            ..Default::default()
        };
        let clause = format!("{callee}({})", args.join(", "));
        let instance = args.first().and_then(|arg| self.body_instance(env, arg));
        let cap = |instance: Instance, mode: Mode| BoundCap {
            instance,
            mode,
            clause: clause.clone(),
        };

        let mut value = None;
        let mut local = None;
        match (intr, instance) {
            (Intrinsic::Release(_), None) => bound.unresolved_releases.push(None),
            (_, None) => {}
            (Intrinsic::Acquire(mode), Some(instance)) => bound.acquires.push(cap(instance, mode)),
            (Intrinsic::Release(mode), Some(instance)) => bound.releases.push(cap(instance, mode)),
            (Intrinsic::Assert(mode), Some(instance)) => bound.asserts.push(cap(instance, mode)),
            (Intrinsic::TryAcquire(mode), Some(instance)) => {
                bound.try_acquires.push((cap(instance, mode), true));
                if let Some(Ok(expr)) = args.get(1).map(|arg| parse_expr(arg)) {
                    if let Some(n) = expr.as_int() {
                        value = Some(n != 0);
                    } else if let Some(name) = expr.as_ident() {
                        value = env.constant(name);
                        local = Some(name.to_string());
                    }
                }
            }
        }
        (bound, value, local)
    }

    // ========================================================================
    // Member accesses and assignments
    // ========================================================================

    fn access(&self, env: &Environment, path: &str, access: Access, site: Site, sink: &mut Sink) {
        match parse_expr(path) {
            Ok(expr) => self.access_expr(env, &expr, access, site, sink),
            Err(err) => {
                capcheck_debug!(function = %self.decl.name, %err, "unparsable access path; check skipped");
            }
        }
    }

    fn access_expr(&self, env: &Environment, expr: &Expr, access: Access, site: Site, sink: &mut Sink) {
        let roots = BodyRoots {
            analysis: self,
            env,
        };
        match lower(expr, &roots, true) {
            Ok(lowered) => self.check_place(env, &lowered.into_object(), access, site, sink),
            Err(err) => {
                capcheck_debug!(function = %self.decl.name, %expr, %err, "unresolved access path; check skipped");
            }
        }
    }

    /// Check every guarded member along `place`. Embedded members share the
    /// access; anything reached through a pointer only reads the pointer.
    fn check_place(
        &self,
        env: &Environment,
        place: &InstanceRef,
        access: Access,
        site: Site,
        sink: &mut Sink,
    ) {
        match place {
            InstanceRef::FieldOfObject { base, field } => {
                match self.place_type(base) {
                    Ok(ty) if ty.pointers == 0 => {
                        if let Some(guard) = self.table.guard_for(&ty.base, field) {
                            self.check_guard(env, guard, Some(base), place, access, site, sink);
                        }
                    }
                    Ok(ty) => {
                        capcheck_debug!(member = %place, %ty, "member base is a pointer; guard check skipped");
                    }
                    Err(err) => {
                        capcheck_debug!(member = %place, %err, "member base type unknown; guard check skipped");
                    }
                }
                self.check_place(env, base, access, site, sink);
            }
            InstanceRef::Deref(inner) => {
                match inner.as_ref() {
                    InstanceRef::FieldOfObject { base, field } => {
                        if let Ok(ty) = self.place_type(base)
                            && ty.pointers == 0
                            && let Some(guard) = self.table.pt_guard_for(&ty.base, field)
                        {
                            self.check_guard(env, guard, Some(base), place, access, site, sink);
                        }
                    }
                    InstanceRef::GlobalToken(name) => {
                        if let Some(guard) = self.table.pt_guard_for_global(name) {
                            self.check_guard(env, guard, None, place, access, site, sink);
                        }
                    }
                    _ => {}
                }
                self.check_place(env, inner, Access::Read, site, sink);
            }
            InstanceRef::GlobalToken(name) => {
                if let Some(guard) = self.table.guard_for_global(name) {
                    self.check_guard(env, guard, None, place, access, site, sink);
                }
            }
            InstanceRef::Variable(_) | InstanceRef::SelfObject | InstanceRef::Param(_) => {}
        }
    }

    fn check_guard(
        &self,
        env: &Environment,
        guard: &GuardSpec,
        object: Option<&InstanceRef>,
        member: &InstanceRef,
        access: Access,
        site: Site,
        sink: &mut Sink,
    ) {
        let bound = match object {
            Some(object) => guard.template.instantiate(&|root| {
                matches!(root, InstanceRef::SelfObject).then(|| Lowered::Place(object.clone()))
            }),
            None => Ok(guard.template.clone()),
        };
        let reference = match bound {
            Ok(reference) => reference,
            Err(err) => {
                capcheck_debug!(member = %member, %err, "guard does not bind; check skipped");
                return;
            }
        };

        let mode = guard.mode_for(access);
        let state = env.state(&reference);
        if state.satisfies(mode) {
            return;
        }
        let verb = match access {
            Access::Read => "reading",
            Access::Write => "writing",
        };
        self.emit(
            sink,
            Some(site),
            DiagnosticKind::NotHeld,
            Some(reference.to_string()),
            format!(
                "{verb} `{member}` requires `{reference}` {}, but it is {}",
                held_phrase(mode),
                state.describe()
            ),
            Some(guard.clause.clone()),
        );
    }

    fn assign(&self, env: &mut Environment, assign: &AssignStmt, site: Site, sink: &mut Sink) {
        let value = match parse_expr(&assign.value) {
            Ok(expr) => Some(expr),
            Err(err) => {
                capcheck_debug!(function = %self.decl.name, %err, "unparsable assigned value");
                None
            }
        };

        if let Some(expr) = &value
            && self.reads_member(expr)
        {
            self.access_expr(env, expr, Access::Read, site, sink);
        }

        let dest = assign.dest.as_str();
        if !self.vars.contains_key(dest) {
            self.access(env, dest, Access::Write, site, sink);
            return;
        }

        let tracked = match &value {
            None => Tracked::Nothing,
            Some(expr) => self.track_value(env, dest, expr),
        };
        env.rebind_local(dest);
        match tracked {
            Tracked::Nothing => {}
            Tracked::Constant(value) => env.set_constant(dest, value),
            Tracked::Binding(target) => env.bind(dest, target),
            Tracked::Copy(from) => env.copy_local(dest, &from),
        }
    }

    fn reads_member(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Field { .. } | Expr::Deref(_) | Expr::Index { .. } => true,
            Expr::Ident(name) => !self.vars.contains_key(name.as_str()),
            Expr::Int(_) | Expr::AddrOf(_) => false,
        }
    }

    fn track_value(&self, env: &Environment, dest: &str, expr: &Expr) -> Tracked {
        if let Some(n) = expr.as_int() {
            return Tracked::Constant(n != 0);
        }

        let roots = BodyRoots {
            analysis: self,
            env,
        };
        let target = lower(expr, &roots, false)
            .ok()
            .and_then(|lowered| match lowered {
                Lowered::Address(target) => Some(target),
                Lowered::Place(place) if self.place_type(&place).is_ok_and(|t| t.pointers > 0) => {
                    Some(InstanceRef::deref(place))
                }
                Lowered::Place(_) => None,
            })
            .filter(|target| target.root_variable() != Some(dest));

        match (target, expr.as_ident()) {
            (Some(target), _) => Tracked::Binding(target),
            (None, Some(name)) if name != dest && self.vars.contains_key(name) => {
                Tracked::Copy(name.to_string())
            }
            _ => Tracked::Nothing,
        }
    }

    // ========================================================================
    // Terminators and exit checks
    // ========================================================================

    fn terminator(
        &self,
        env: Environment,
        term: &Terminator,
        site: Site,
        sink: &mut Sink,
    ) -> Vec<(usize, Environment)> {
        match term {
            Terminator::Goto(target) => vec![(*target, env)],
            Terminator::Branch(branch) => self.branch(env, branch),
            Terminator::Return => {
                self.exit(&env, None, site, sink);
                Vec::new()
            }
            Terminator::ReturnValue(value) => {
                self.exit(&env, Some(value), site, sink);
                Vec::new()
            }
            Terminator::Unreachable => Vec::new(),
        }
    }

    fn branch(&self, env: Environment, branch: &BranchTerm) -> Vec<(usize, Environment)> {
        let (local, then_truth) = match &branch.cond {
            Condition::Local(local) => (local, true),
            Condition::Not(local) => (local, false),
            Condition::Opaque => {
                return vec![(branch.then, env.clone()), (branch.otherwise, env)];
            }
        };

        if let Some(value) = env.constant(local) {
            let target = if value == then_truth {
                branch.then
            } else {
                branch.otherwise
            };
            return vec![(target, env)];
        }

        vec![
            (branch.then, env.refine(local, then_truth)),
            (branch.otherwise, env.refine(local, !then_truth)),
        ]
    }

    /// Compare the environment at a return against the function's contract.
    fn exit(&self, env: &Environment, returned: Option<&str>, site: Site, sink: &mut Sink) {
        if !sink.recording {
            return;
        }
        if env.suppression_depth() > 0 {
            self.emit(
                sink,
                None,
                DiagnosticKind::UnbalancedSuppression,
                None,
                "returns with capability analysis disabled".to_string(),
                None,
            );
            return;
        }

        let name = &self.decl.name;
        let own = &self.own;

        for acq in &own.acquires {
            let state = env.state(&acq.instance.reference);
            if !state.satisfies(acq.mode) {
                self.emit_cap(
                    sink,
                    site,
                    DiagnosticKind::ContractMismatch,
                    acq,
                    format!(
                        "`{name}` must return with `{}` {}, but it is {}",
                        acq.instance,
                        held_phrase(acq.mode),
                        state.describe()
                    ),
                );
            }
        }

        let released = |cap: &BoundCap| own.releases.iter().any(|r| r.instance == cap.instance);
        for req in own.requires.iter().filter(|req| !released(req)) {
            let state = env.state(&req.instance.reference);
            if !state.satisfies(req.mode) {
                self.emit_cap(
                    sink,
                    site,
                    DiagnosticKind::ContractMismatch,
                    req,
                    format!(
                        "`{name}` is called with `{}` held and must return with it {}, but it is {}",
                        req.instance,
                        held_phrase(req.mode),
                        state.describe()
                    ),
                );
            }
        }

        for rel in &own.releases {
            let state = env.state(&rel.instance.reference);
            if state.mode().is_some() {
                self.emit_cap(
                    sink,
                    site,
                    DiagnosticKind::StillHeld,
                    rel,
                    format!(
                        "`{name}` releases `{}`, but it is still {} on return",
                        rel.instance,
                        state.describe()
                    ),
                );
            } else if state == HeldState::Unknown {
                self.emit_cap(
                    sink,
                    site,
                    DiagnosticKind::ContractMismatch,
                    rel,
                    format!(
                        "`{name}` releases `{}`, but it is possibly still held on return",
                        rel.instance
                    ),
                );
            }
        }

        let returned_value = returned
            .and_then(|text| parse_expr(text).ok())
            .and_then(|expr| {
                expr.as_int()
                    .map(|n| n != 0)
                    .or_else(|| expr.as_ident().and_then(|local| env.constant(local)))
            });
        if let Some(value) = returned_value {
            for (cap, success) in &own.try_acquires {
                let state = env.state(&cap.instance.reference);
                if value == *success && !state.satisfies(cap.mode) {
                    self.emit_cap(
                        sink,
                        site,
                        DiagnosticKind::ContractMismatch,
                        cap,
                        format!(
                            "`{name}` returns {} (acquired) but `{}` is {}",
                            u8::from(value),
                            cap.instance,
                            state.describe()
                        ),
                    );
                } else if value != *success && state.mode().is_some() {
                    self.emit_cap(
                        sink,
                        site,
                        DiagnosticKind::StillHeld,
                        cap,
                        format!(
                            "`{name}` returns {} (not acquired) but `{}` is still {}",
                            u8::from(value),
                            cap.instance,
                            state.describe()
                        ),
                    );
                }
            }
        }

        let declared: Vec<&InstanceRef> = own
            .acquires
            .iter()
            .chain(&own.requires)
            .chain(&own.releases)
            .chain(own.try_acquires.iter().map(|(cap, _)| cap))
            .map(|cap| &cap.instance.reference)
            .collect();
        for (reference, fact) in env.facts() {
            if fact.state == HeldState::NotHeld
                || env.is_asserted(reference)
                || declared.contains(&reference)
            {
                continue;
            }
            let held = match fact.state.mode() {
                Some(_) => format!("still {}", fact.state.describe()),
                None => "possibly still held".to_string(),
            };
            self.emit(
                sink,
                Some(site),
                DiagnosticKind::StillHeld,
                Some(reference.to_string()),
                format!("`{reference}` is {held} when `{name}` returns"),
                None,
            );
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn root_type(&self, root: &InstanceRef) -> Option<CType> {
        match root {
            InstanceRef::Variable(name) => self.vars.get(name.as_str()).cloned(),
            _ => None,
        }
    }

    fn place_type(&self, place: &InstanceRef) -> Result<CType, TypeError> {
        self.table.type_of_place(place, &|root| self.root_type(root))
    }

    fn lower_text(&self, env: &Environment, text: &str) -> Option<Lowered> {
        let expr = parse_expr(text).ok()?;
        let roots = BodyRoots {
            analysis: self,
            env,
        };
        match lower(&expr, &roots, false) {
            Ok(lowered) => Some(lowered),
            Err(err) => {
                capcheck_debug!(function = %self.decl.name, %err, "argument does not name an object");
                None
            }
        }
    }

    /// Capability instance named by an intrinsic argument. Without a known
    /// type the argument is taken to be a pointer to the capability.
    fn body_instance(&self, env: &Environment, text: &str) -> Option<Instance> {
        let lowered = self.lower_text(env, text)?;
        let ty = self
            .table
            .type_of_lowered(&lowered, &|root| self.root_type(root))
            .ok();
        let cap = ty.as_ref().and_then(|t| self.table.capability_of(t));
        let indirect = ty.as_ref().is_none_or(|t| t.pointers > 0);
        let reference = if indirect {
            lowered.into_pointee()
        } else {
            lowered.into_object()
        };
        Some(Instance { reference, ty: cap })
    }

    fn emit(
        &self,
        sink: &mut Sink,
        site: Option<Site>,
        kind: DiagnosticKind,
        instance: Option<String>,
        message: String,
        contract: Option<String>,
    ) {
        if !sink.recording {
            return;
        }
        let severity = if kind.is_analysis_finding() {
            self.severity
        } else {
            Severity::Error
        };
        sink.diagnostics.push(Diagnostic {
            kind,
            severity,
            location: Location {
                unit: self.unit.to_string(),
                function: self.decl.name.clone(),
                block: site.map(|s| s.block),
                stmt: site.map(|s| s.stmt),
                line: site.and_then(|s| s.line),
            },
            instance,
            message,
            contract: contract.filter(|c| !c.is_empty()),
        });
    }

    fn emit_cap(&self, sink: &mut Sink, site: Site, kind: DiagnosticKind, cap: &BoundCap, message: String) {
        self.emit(
            sink,
            Some(site),
            kind,
            Some(cap.instance.to_string()),
            message,
            Some(cap.clause.clone()),
        );
    }

    fn emit_violation(&self, sink: &mut Sink, site: Site, violation: Violation) {
        self.emit(
            sink,
            Some(site),
            violation.kind.into(),
            Some(violation.instance.to_string()),
            violation.message,
            Some(violation.clause),
        );
    }
}

/// Bind every clause of `contract` with `binder`. Clauses whose parameters
/// do not bind are dropped; a dropped release is kept as unresolved so that
/// held capabilities of its type become unknown.
fn bind_contract(
    callee: &str,
    contract: &FunctionContract,
    binder: &dyn Fn(&InstanceRef) -> Option<Lowered>,
) -> BoundContract {
    let bind = |cap: &ContractCap| -> Option<BoundCap> {
        match cap.template.instantiate(binder) {
            Ok(reference) if !matches!(template_root(&reference), InstanceRef::Param(_)) => {
                Some(BoundCap {
                    instance: Instance {
                        reference,
                        ty: Some(cap.ty),
                    },
                    mode: cap.mode,
                    clause: cap.clause.clone(),
                })
            }
            Ok(_) => {
                capcheck_debug!(callee, clause = %cap.clause, "argument does not bind; clause skipped");
                None
            }
            Err(err) => {
                capcheck_debug!(callee, clause = %cap.clause, %err, "clause does not bind");
                None
            }
        }
    };
    let all = |caps: &[ContractCap]| caps.iter().filter_map(bind).collect::<Vec<_>>();

    let mut releases = Vec::new();
    let mut unresolved_releases = Vec::new();
    for rel in &contract.releases {
        match bind(rel) {
            Some(bound) => releases.push(bound),
            None => unresolved_releases.push(Some(rel.ty)),
        }
    }

    BoundContract {
        callee: callee.to_string(),
        requires: all(&contract.requires),
        excludes: all(&contract.excludes),
        acquires: all(&contract.acquires),
        releases,
        try_acquires: contract
            .try_acquires
            .iter()
            .filter_map(|t| bind(&t.cap).map(|cap| (cap, t.success)))
            .collect(),
        asserts: all(&contract.asserts),
        returns: contract.returns.as_ref().and_then(bind),
        unresolved_releases,
    }
}

fn template_root(reference: &InstanceRef) -> &InstanceRef {
    match reference {
        InstanceRef::Deref(inner) => template_root(inner),
        InstanceRef::FieldOfObject { base, .. } => template_root(base),
        other => other,
    }
}

fn reverse_postorder(entry: usize, blocks: &[Block]) -> Vec<usize> {
    let mut visited = vec![false; blocks.len()];
    let mut post = Vec::with_capacity(blocks.len());
    let mut stack = vec![(entry, 0usize)];
    visited[entry] = true;

    while let Some(top) = stack.len().checked_sub(1) {
        let (block, next) = stack[top];
        let succs = blocks[block].term.successors();
        if let Some(&succ) = succs.get(next) {
            stack[top].1 += 1;
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            post.push(block);
            stack.pop();
        }
    }

    post.reverse();
    post
}
