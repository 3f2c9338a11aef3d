//! Annotation table: declared contracts of functions and guarded members.
//!
//! The table is built once from every declaration in the program (a
//! single-writer phase), then frozen and shared read-only with the analysis
//! workers. Contract clauses are stored as templates: instance paths rooted
//! at positional parameters (`Param(i)`), at `SelfObject` for member guards,
//! or at globals. They are bound to concrete instances at each use.

use crate::annotations::{CapAnnotation, parse_attribute};
use crate::capability::{
    CapabilityKind, CapabilityModel, CapabilityTypeId, InstanceError, InstanceRef, Lowered, Mode,
    RootResolver, lower,
};
use crate::capcheck_bail;
use crate::error::CapCheckResult;
use crate::expr::Expr;
use crate::program::{FunctionDecl, Program, TranslationUnit};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

// ============================================================================
// C types
// ============================================================================

/// Declared type reduced to what the analysis needs: the base type name with
/// qualifiers stripped and the number of pointer levels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CType {
    pub base: String,
    pub pointers: u8,
}

const TYPE_QUALIFIERS: &[&str] = &[
    "const", "volatile", "restrict", "struct", "union", "enum", "__rcu", "__percpu", "__iomem",
];

impl CType {
    pub fn parse(text: &str) -> Self {
        let pointers = text.chars().filter(|c| *c == '*').count() as u8;
        let spaced = text.replace('*', " ");
        let base = spaced
            .split_whitespace()
            .filter(|word| !TYPE_QUALIFIERS.contains(word))
            .collect::<Vec<_>>()
            .join(" ");
        Self { base, pointers }
    }

    pub fn object(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            pointers: 0,
        }
    }

    pub fn pointee(&self) -> Option<CType> {
        (self.pointers > 0).then(|| CType {
            base: self.base.clone(),
            pointers: self.pointers - 1,
        })
    }

    pub fn address_of(&self) -> CType {
        CType {
            base: self.base.clone(),
            pointers: self.pointers.saturating_add(1),
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        if self.pointers > 0 {
            write!(f, " {}", "*".repeat(self.pointers as usize))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("`{ty}` has no member `{field}`")]
    UnknownField { ty: String, field: String },
    #[error("`{0}` is not a struct object")]
    NotAStruct(String),
    #[error("`{0}` is not a pointer")]
    NotAPointer(String),
    #[error("type of `{0}` is unknown")]
    Unresolved(String),
}

// ============================================================================
// Contracts and guards
// ============================================================================

/// Read or write of a guarded member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

/// One capability named by a contract clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCap {
    pub template: InstanceRef,
    pub ty: CapabilityTypeId,
    pub mode: Mode,
    /// The attribute as written, for diagnostics.
    pub clause: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryAcquire {
    pub cap: ContractCap,
    /// Return value truthiness on which the capability is held.
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionContract {
    pub requires: Vec<ContractCap>,
    pub excludes: Vec<ContractCap>,
    pub acquires: Vec<ContractCap>,
    pub releases: Vec<ContractCap>,
    pub try_acquires: Vec<TryAcquire>,
    pub asserts: Vec<ContractCap>,
    pub returns: Option<ContractCap>,
    pub no_analysis: bool,
}

type Obligation<'a> = (u8, &'a InstanceRef, CapabilityTypeId, Mode, bool);

impl FunctionContract {
    /// Whether the contract names any capability.
    pub fn has_obligations(&self) -> bool {
        !self.obligations().is_empty()
    }

    fn obligations(&self) -> Vec<Obligation<'_>> {
        fn tagged(tag: u8, caps: &[ContractCap]) -> impl Iterator<Item = Obligation<'_>> {
            caps.iter().map(move |c| (tag, &c.template, c.ty, c.mode, false))
        }
        let mut out = Vec::new();
        out.extend(tagged(0, &self.requires));
        out.extend(tagged(1, &self.excludes));
        out.extend(tagged(2, &self.acquires));
        out.extend(tagged(3, &self.releases));
        out.extend(
            self.try_acquires
                .iter()
                .map(|t| (4, &t.cap.template, t.cap.ty, t.cap.mode, t.success)),
        );
        out.extend(tagged(5, &self.asserts));
        out.extend(tagged(6, self.returns.as_slice()));
        out.sort();
        out.dedup();
        out
    }

    /// Two declarations agree when they name the same obligations, whatever
    /// order or spelling they use.
    pub fn same_obligations(&self, other: &FunctionContract) -> bool {
        self.obligations() == other.obligations()
    }

    fn take_obligations_from(&mut self, other: FunctionContract) {
        let no_analysis = self.no_analysis || other.no_analysis;
        *self = other;
        self.no_analysis = no_analysis;
    }

    /// Contract clauses that contradict each other.
    fn contradictions(&self) -> Vec<String> {
        let mut found = Vec::new();
        for req in &self.requires {
            for acq in self.acquires.iter().filter(|a| a.template == req.template) {
                found.push(format!(
                    "`{}` and `{}` both name the same capability (required and acquired)",
                    req.clause, acq.clause
                ));
            }
            for exc in self.excludes.iter().filter(|e| e.template == req.template) {
                found.push(format!(
                    "`{}` and `{}` both name the same capability (required and excluded)",
                    req.clause, exc.clause
                ));
            }
        }
        for (what, caps) in [("required", &self.requires), ("acquired", &self.acquires)] {
            for (i, a) in caps.iter().enumerate() {
                for b in &caps[i + 1..] {
                    if a.template == b.template && a.mode != b.mode {
                        found.push(format!(
                            "`{}` and `{}` name the same capability {what} as both {} and {}",
                            a.clause,
                            b.clause,
                            a.mode.as_str(),
                            b.mode.as_str()
                        ));
                    }
                }
            }
        }
        found
    }
}

/// Guard of a member: `__guarded_by` protects the member itself,
/// `__pt_guarded_by` the data it points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSpec {
    pub template: InstanceRef,
    pub ty: CapabilityTypeId,
    pub pointee: bool,
    pub clause: String,
}

impl GuardSpec {
    pub fn mode_for(&self, access: Access) -> Mode {
        match access {
            Access::Read => Mode::Shared,
            Access::Write => Mode::Exclusive,
        }
    }
}

/// A struct field or global variable.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub ty: CType,
    pub guard: Option<GuardSpec>,
    pub pt_guard: Option<GuardSpec>,
}

impl MemberInfo {
    fn new(ty: &str) -> Self {
        Self {
            ty: CType::parse(ty),
            guard: None,
            pt_guard: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StructInfo {
    pub fields: HashMap<String, MemberInfo>,
}

// ============================================================================
// Declaration errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationErrorKind {
    Contradiction,
    ContractMismatch,
    UnknownCapabilityType,
    TypeCollision,
    InvalidAnnotation,
    Misplaced,
}

impl DeclarationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclarationErrorKind::Contradiction => "contradiction",
            DeclarationErrorKind::ContractMismatch => "contract_mismatch",
            DeclarationErrorKind::UnknownCapabilityType => "unknown_capability_type",
            DeclarationErrorKind::TypeCollision => "type_collision",
            DeclarationErrorKind::InvalidAnnotation => "invalid_annotation",
            DeclarationErrorKind::Misplaced => "misplaced",
        }
    }
}

/// Build-breaking problem with a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclarationError {
    pub unit: String,
    /// Function, struct member or global the error is attached to.
    pub item: String,
    pub kind: DeclarationErrorKind,
    pub message: String,
}

enum ResolveError {
    /// Reference to a nonexistent parameter, field or global.
    Fatal(String),
    UnknownType(String),
    Invalid(String),
}

// ============================================================================
// Annotation table
// ============================================================================

#[derive(Debug, Default)]
pub struct AnnotationTable {
    capabilities: CapabilityModel,
    structs: HashMap<String, StructInfo>,
    globals: HashMap<String, MemberInfo>,
    tokens: HashMap<String, CapabilityTypeId>,
    contracts: HashMap<String, FunctionContract>,
    /// Contracts of internal-linkage functions, per unit.
    static_contracts: HashMap<String, HashMap<String, FunctionContract>>,
    empty: FunctionContract,
    declaration_errors: Vec<DeclarationError>,
    broken_units: HashSet<String>,
}

#[derive(Clone, Copy)]
enum Scope<'a> {
    Function(&'a FunctionDecl),
    Struct(&'a str),
    Global,
}

struct ScopeRoots<'a> {
    table: &'a AnnotationTable,
    scope: Scope<'a>,
}

impl RootResolver for ScopeRoots<'_> {
    fn resolve_root(&self, ident: &str) -> Result<Lowered, InstanceError> {
        match self.scope {
            Scope::Function(decl) => {
                if let Some(idx) = decl.param_index(ident) {
                    return Ok(Lowered::Place(InstanceRef::Param(idx)));
                }
            }
            Scope::Struct(name) => {
                if self
                    .table
                    .structs
                    .get(name)
                    .is_some_and(|s| s.fields.contains_key(ident))
                {
                    return Ok(Lowered::Place(InstanceRef::field(InstanceRef::SelfObject, ident)));
                }
            }
            Scope::Global => {}
        }
        self.table
            .global_root(ident)
            .ok_or_else(|| InstanceError::UnknownName(ident.to_string()))
    }
}

impl Scope<'_> {
    fn root_type(&self, root: &InstanceRef) -> Option<CType> {
        match (self, root) {
            (Scope::Function(decl), InstanceRef::Param(idx)) => {
                decl.params.get(*idx).map(|p| CType::parse(&p.ty))
            }
            (Scope::Struct(name), InstanceRef::SelfObject) => Some(CType::object(*name)),
            _ => None,
        }
    }
}

impl AnnotationTable {
    /// Build the table from every declaration in `program`.
    ///
    /// Declaration errors are collected in the table; only references to
    /// nonexistent names abort.
    pub fn build(program: &Program) -> CapCheckResult<Self> {
        let mut table = Self::default();

        for unit in &program.units {
            table.declare_capabilities(unit);
        }
        for unit in &program.units {
            table.declare_members(unit);
        }

        let mut guarded = HashSet::new();
        for unit in &program.units {
            for decl in &unit.structs {
                if guarded.insert(decl.name.clone()) {
                    for field in &decl.fields {
                        let item = format!("{}::{}", decl.name, field.name);
                        table.attach_guards(unit, &item, Scope::Struct(&decl.name), &field.attrs)?;
                    }
                }
            }
            for global in &unit.globals {
                table.attach_guards(unit, &global.name, Scope::Global, &global.attrs)?;
            }
        }

        for unit in &program.units {
            for decl in &unit.functions {
                let contract = table.build_contract(unit, decl)?;
                table.merge_contract(unit, decl, contract);
            }
        }

        Ok(table)
    }

    fn report(
        &mut self,
        unit: &TranslationUnit,
        item: &str,
        kind: DeclarationErrorKind,
        message: String,
    ) {
        self.broken_units.insert(unit.name.clone());
        self.declaration_errors.push(DeclarationError {
            unit: unit.name.clone(),
            item: item.to_string(),
            kind,
            message,
        });
    }

    fn declare_capabilities(&mut self, unit: &TranslationUnit) {
        for decl in &unit.capability_types {
            let kind = if decl.token {
                CapabilityKind::Token
            } else {
                CapabilityKind::Struct
            };
            match self.capabilities.declare_type(&decl.name, kind) {
                Ok(id) => {
                    if decl.token {
                        self.tokens.insert(decl.name.clone(), id);
                    }
                }
                Err(existing) => self.report(
                    unit,
                    &decl.name,
                    DeclarationErrorKind::TypeCollision,
                    format!(
                        "capability `{}` declared as {} capability, previously as {}",
                        decl.name,
                        kind.as_str(),
                        existing.as_str()
                    ),
                ),
            }
        }

        for decl in &unit.token_instances {
            match self.capabilities.lookup(&decl.capability) {
                Some(id) if self.capabilities.kind(id) == CapabilityKind::Token => {
                    self.tokens.insert(decl.name.clone(), id);
                }
                _ => self.report(
                    unit,
                    &decl.name,
                    DeclarationErrorKind::UnknownCapabilityType,
                    format!("`{}` is not a declared token capability", decl.capability),
                ),
            }
        }
    }

    fn declare_members(&mut self, unit: &TranslationUnit) {
        for decl in &unit.structs {
            self.structs
                .entry(decl.name.clone())
                .or_insert_with(|| StructInfo {
                    fields: decl
                        .fields
                        .iter()
                        .map(|f| (f.name.clone(), MemberInfo::new(&f.ty)))
                        .collect(),
                });
        }
        for decl in &unit.globals {
            self.globals
                .entry(decl.name.clone())
                .or_insert_with(|| MemberInfo::new(&decl.ty));
        }
    }

    fn attach_guards(
        &mut self,
        unit: &TranslationUnit,
        item: &str,
        scope: Scope<'_>,
        attrs: &[String],
    ) -> CapCheckResult<()> {
        for attr in attrs {
            let (arg, pointee) = match parse_attribute(attr) {
                Ok(Some(CapAnnotation::GuardedBy { arg })) => (arg, false),
                Ok(Some(CapAnnotation::PtGuardedBy { arg })) => (arg, true),
                Ok(Some(_)) => {
                    self.report(
                        unit,
                        item,
                        DeclarationErrorKind::Misplaced,
                        format!("`{}` only applies to functions", attr.trim()),
                    );
                    continue;
                }
                Ok(None) => continue,
                Err(err) => {
                    self.report(unit, item, DeclarationErrorKind::InvalidAnnotation, err.to_string());
                    continue;
                }
            };

            let Some((template, ty)) = self.resolve_clause(unit, item, scope, attr, &arg)? else {
                continue;
            };
            let spec = GuardSpec {
                template,
                ty,
                pointee,
                clause: attr.trim().to_string(),
            };

            let member = match scope {
                Scope::Struct(name) => {
                    let field = item.rsplit("::").next().unwrap_or(item);
                    self.structs
                        .get_mut(name)
                        .and_then(|s| s.fields.get_mut(field))
                }
                Scope::Global => self.globals.get_mut(item),
                Scope::Function(_) => None,
            };
            let Some(member) = member else {
                continue;
            };
            if pointee && member.ty.pointers == 0 {
                let message = format!("`{}` on member of non-pointer type `{}`", spec.clause, member.ty);
                self.report(unit, item, DeclarationErrorKind::InvalidAnnotation, message);
                continue;
            }
            if pointee {
                member.pt_guard = Some(spec);
            } else {
                member.guard = Some(spec);
            }
        }
        Ok(())
    }

    fn build_contract(
        &mut self,
        unit: &TranslationUnit,
        decl: &FunctionDecl,
    ) -> CapCheckResult<FunctionContract> {
        let scope = Scope::Function(decl);
        let mut contract = FunctionContract::default();

        for attr in &decl.attrs {
            let ann = match parse_attribute(attr) {
                Ok(Some(ann)) => ann,
                Ok(None) => continue,
                Err(err) => {
                    let message = err.to_string();
                    self.report(unit, &decl.name, DeclarationErrorKind::InvalidAnnotation, message);
                    continue;
                }
            };

            match ann {
                CapAnnotation::Requires { mode, args } => {
                    contract.requires.extend(self.caps(unit, decl, scope, attr, &args, mode)?);
                }
                CapAnnotation::Excludes { args } => {
                    let caps = self.caps(unit, decl, scope, attr, &args, Mode::Exclusive)?;
                    contract.excludes.extend(caps);
                }
                CapAnnotation::Acquires { mode, args } => {
                    contract.acquires.extend(self.caps(unit, decl, scope, attr, &args, mode)?);
                }
                CapAnnotation::Releases { mode, args } => {
                    contract.releases.extend(self.caps(unit, decl, scope, attr, &args, mode)?);
                }
                CapAnnotation::TryAcquires {
                    mode,
                    success,
                    args,
                } => {
                    let caps = self.caps(unit, decl, scope, attr, &args, mode)?;
                    contract
                        .try_acquires
                        .extend(caps.into_iter().map(|cap| TryAcquire { cap, success }));
                }
                CapAnnotation::Asserts { mode, args } => {
                    contract.asserts.extend(self.caps(unit, decl, scope, attr, &args, mode)?);
                }
                CapAnnotation::Returns { arg } => {
                    let caps = self.caps(unit, decl, scope, attr, &[arg], Mode::Exclusive)?;
                    contract.returns = caps.into_iter().next();
                }
                CapAnnotation::NoAnalysis => contract.no_analysis = true,
                CapAnnotation::GuardedBy { .. } | CapAnnotation::PtGuardedBy { .. } => {
                    self.report(
                        unit,
                        &decl.name,
                        DeclarationErrorKind::Misplaced,
                        format!("`{}` only applies to struct members and globals", attr.trim()),
                    );
                }
            }
        }

        for message in contract.contradictions() {
            self.report(unit, &decl.name, DeclarationErrorKind::Contradiction, message);
        }
        Ok(contract)
    }

    fn caps(
        &mut self,
        unit: &TranslationUnit,
        decl: &FunctionDecl,
        scope: Scope<'_>,
        attr: &str,
        args: &[Expr],
        mode: Mode,
    ) -> CapCheckResult<Vec<ContractCap>> {
        let mut caps = Vec::with_capacity(args.len());
        for arg in args {
            if let Some((template, ty)) = self.resolve_clause(unit, &decl.name, scope, attr, arg)? {
                caps.push(ContractCap {
                    template,
                    ty,
                    mode,
                    clause: attr.trim().to_string(),
                });
            }
        }
        Ok(caps)
    }

    /// Resolve one clause argument, reporting declaration errors. `Ok(None)`
    /// means the argument was rejected and reported.
    fn resolve_clause(
        &mut self,
        unit: &TranslationUnit,
        item: &str,
        scope: Scope<'_>,
        attr: &str,
        arg: &Expr,
    ) -> CapCheckResult<Option<(InstanceRef, CapabilityTypeId)>> {
        match self.resolve_cap(arg, scope) {
            Ok(resolved) => Ok(Some(resolved)),
            Err(ResolveError::Fatal(msg)) => {
                capcheck_bail!("{}: `{item}`: `{}`: {msg}", unit.name, attr.trim());
            }
            Err(ResolveError::UnknownType(msg)) => {
                let message = format!("`{}`: {msg}", attr.trim());
                self.report(unit, item, DeclarationErrorKind::UnknownCapabilityType, message);
                Ok(None)
            }
            Err(ResolveError::Invalid(msg)) => {
                let message = format!("`{}`: {msg}", attr.trim());
                self.report(unit, item, DeclarationErrorKind::InvalidAnnotation, message);
                Ok(None)
            }
        }
    }

    fn resolve_cap(
        &self,
        expr: &Expr,
        scope: Scope<'_>,
    ) -> Result<(InstanceRef, CapabilityTypeId), ResolveError> {
        let roots = ScopeRoots { table: self, scope };
        let lowered = lower(expr, &roots, false).map_err(|err| match err {
            InstanceError::UnknownName(_) => ResolveError::Fatal(err.to_string()),
            other => ResolveError::Invalid(other.to_string()),
        })?;
        let ty = self
            .type_of_lowered(&lowered, &|root| scope.root_type(root))
            .map_err(|err| match err {
                TypeError::UnknownField { .. } => ResolveError::Fatal(err.to_string()),
                other => ResolveError::Invalid(other.to_string()),
            })?;
        if ty.pointers > 1 {
            return Err(ResolveError::Invalid(format!(
                "`{expr}` has type `{ty}`, expected a capability or a pointer to one"
            )));
        }
        let cap = self.capabilities.lookup(&ty.base).ok_or_else(|| {
            ResolveError::UnknownType(format!(
                "`{expr}` has type `{ty}`, which is not a declared capability type"
            ))
        })?;
        let instance = self
            .capabilities
            .make_instance(expr, Some(cap), ty.pointers > 0, &roots)
            .map_err(|err| ResolveError::Invalid(err.to_string()))?;
        Ok((instance.reference, cap))
    }

    /// Static functions merge only with declarations in their own unit;
    /// everything else merges program-wide by name.
    fn merge_contract(&mut self, unit: &TranslationUnit, decl: &FunctionDecl, contract: FunctionContract) {
        let name = decl.name.as_str();
        let contracts = if decl.is_static {
            self.static_contracts.entry(unit.name.clone()).or_default()
        } else {
            &mut self.contracts
        };
        let Some(existing) = contracts.get_mut(name) else {
            contracts.insert(name.to_string(), contract);
            return;
        };

        if !contract.has_obligations() {
            existing.no_analysis |= contract.no_analysis;
        } else if !existing.has_obligations() {
            existing.take_obligations_from(contract);
        } else if !existing.same_obligations(&contract) {
            self.report(
                unit,
                name,
                DeclarationErrorKind::ContractMismatch,
                format!("declarations of `{name}` carry different capability contracts"),
            );
        } else {
            existing.no_analysis |= contract.no_analysis;
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn capabilities(&self) -> &CapabilityModel {
        &self.capabilities
    }

    /// Contract of `function` as seen from `unit`: a static declaration in
    /// that unit shadows the external one. The empty contract when undeclared.
    pub fn contract_for(&self, unit: &str, function: &str) -> &FunctionContract {
        self.static_contracts
            .get(unit)
            .and_then(|local| local.get(function))
            .or_else(|| self.contracts.get(function))
            .unwrap_or(&self.empty)
    }

    pub fn guard_for(&self, struct_name: &str, field: &str) -> Option<&GuardSpec> {
        self.member(struct_name, field)?.guard.as_ref()
    }

    pub fn pt_guard_for(&self, struct_name: &str, field: &str) -> Option<&GuardSpec> {
        self.member(struct_name, field)?.pt_guard.as_ref()
    }

    pub fn guard_for_global(&self, name: &str) -> Option<&GuardSpec> {
        self.globals.get(name)?.guard.as_ref()
    }

    pub fn pt_guard_for_global(&self, name: &str) -> Option<&GuardSpec> {
        self.globals.get(name)?.pt_guard.as_ref()
    }

    fn member(&self, struct_name: &str, field: &str) -> Option<&MemberInfo> {
        self.structs.get(struct_name)?.fields.get(field)
    }

    pub fn declaration_errors(&self) -> &[DeclarationError] {
        &self.declaration_errors
    }

    /// Whether the unit is free of declaration errors and may be analyzed.
    pub fn unit_is_clean(&self, unit: &str) -> bool {
        !self.broken_units.contains(unit)
    }

    /// Root of a global name: a token evaluates to the address of its
    /// abstract instance, any other global names its object.
    pub fn global_root(&self, name: &str) -> Option<Lowered> {
        if self.tokens.contains_key(name) {
            Some(Lowered::Address(InstanceRef::GlobalToken(name.to_string())))
        } else if self.globals.contains_key(name) {
            Some(Lowered::Place(InstanceRef::GlobalToken(name.to_string())))
        } else {
            None
        }
    }

    /// Capability type of objects of type `ty`, or of the objects it points to.
    pub fn capability_of(&self, ty: &CType) -> Option<CapabilityTypeId> {
        (ty.pointers <= 1)
            .then(|| self.capabilities.lookup(&ty.base))
            .flatten()
    }

    /// Type of a normalized place. `roots` types the scope-specific roots
    /// (variables, parameters, `SelfObject`).
    pub fn type_of_place(
        &self,
        place: &InstanceRef,
        roots: &dyn Fn(&InstanceRef) -> Option<CType>,
    ) -> Result<CType, TypeError> {
        match place {
            InstanceRef::GlobalToken(name) => {
                if let Some(id) = self.tokens.get(name) {
                    Ok(CType::object(self.capabilities.name(*id)))
                } else if let Some(global) = self.globals.get(name) {
                    Ok(global.ty.clone())
                } else {
                    Err(TypeError::Unresolved(name.clone()))
                }
            }
            InstanceRef::Deref(inner) => self
                .type_of_place(inner, roots)?
                .pointee()
                .ok_or_else(|| TypeError::NotAPointer(inner.to_string())),
            InstanceRef::FieldOfObject { base, field } => {
                let base_ty = self.type_of_place(base, roots)?;
                if base_ty.pointers != 0 {
                    return Err(TypeError::NotAStruct(base.to_string()));
                }
                let info = self
                    .structs
                    .get(&base_ty.base)
                    .ok_or_else(|| TypeError::NotAStruct(base.to_string()))?;
                info.fields
                    .get(field)
                    .map(|member| member.ty.clone())
                    .ok_or_else(|| TypeError::UnknownField {
                        ty: base_ty.to_string(),
                        field: field.clone(),
                    })
            }
            other => roots(other).ok_or_else(|| TypeError::Unresolved(other.to_string())),
        }
    }

    pub fn type_of_lowered(
        &self,
        lowered: &Lowered,
        roots: &dyn Fn(&InstanceRef) -> Option<CType>,
    ) -> Result<CType, TypeError> {
        match lowered {
            Lowered::Place(place) => self.type_of_place(place, roots),
            Lowered::Address(place) => Ok(self.type_of_place(place, roots)?.address_of()),
        }
    }
}
