//! Capability types, access modes and capability instances.
//!
//! Capability types are nominal and interned. Instances are normalized access
//! paths: two expressions name the same instance exactly when their
//! normalized `InstanceRef`s are equal. Anything the normalizer cannot prove
//! distinct is treated as possibly aliasing (see [`CapabilityModel::instances_may_alias`]).

use crate::expr::Expr;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Interned handle of a declared capability type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CapabilityTypeId(u32);

/// How a capability type was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// `struct_with_capability(name)`: instances are objects of the struct.
    Struct,
    /// `token_capability(name)`: abstract, not backed by data.
    Token,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Struct => "struct",
            CapabilityKind::Token => "token",
        }
    }
}

/// Exclusive (write-like) or shared (read-like) access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Shared,
    Exclusive,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Shared => "shared",
            Mode::Exclusive => "exclusive",
        }
    }

    /// Holding `self` satisfies a requirement of `required`.
    pub fn satisfies(self, required: Mode) -> bool {
        self == Mode::Exclusive || required == Mode::Shared
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstanceError {
    #[error("`{0}` is not a declared parameter, local, field or global")]
    UnknownName(String),
    #[error("`{0}` has no stable identity (indexing or computed value)")]
    Unsupported(String),
    #[error("`{0}` takes the address of a non-object")]
    BadAddress(String),
}

/// Normalized capability instance.
///
/// `a->f` is represented as `FieldOfObject(Deref(a), f)`; `*&x` and `&*x`
/// collapse to `x`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceRef {
    /// A named global object or token capability.
    GlobalToken(String),
    /// A parameter or local of the function being analyzed.
    Variable(String),
    /// The object holding a guarded field; only appears in guard templates.
    SelfObject,
    /// Positional parameter; only appears in contract templates so that
    /// prototypes naming their parameters differently compare equal.
    Param(usize),
    Deref(Box<InstanceRef>),
    FieldOfObject { base: Box<InstanceRef>, field: String },
}

impl InstanceRef {
    pub fn field(base: InstanceRef, field: impl Into<String>) -> Self {
        InstanceRef::FieldOfObject {
            base: Box::new(base),
            field: field.into(),
        }
    }

    pub fn deref(inner: InstanceRef) -> Self {
        InstanceRef::Deref(Box::new(inner))
    }

    /// The variable this path starts from, if any.
    pub fn root_variable(&self) -> Option<&str> {
        match self {
            InstanceRef::Variable(name) => Some(name),
            InstanceRef::GlobalToken(_) | InstanceRef::SelfObject | InstanceRef::Param(_) => None,
            InstanceRef::Deref(inner) => inner.root_variable(),
            InstanceRef::FieldOfObject { base, .. } => base.root_variable(),
        }
    }

    /// Replace roots chosen by `binder` and renormalize.
    ///
    /// Used to bind contract templates (rooted at callee parameters) to call
    /// arguments and guard templates (rooted at `SelfObject`) to the accessed
    /// object.
    pub fn instantiate(
        &self,
        binder: &dyn Fn(&InstanceRef) -> Option<Lowered>,
    ) -> Result<InstanceRef, InstanceError> {
        Ok(self.instantiate_lowered(binder)?.into_object())
    }

    fn instantiate_lowered(
        &self,
        binder: &dyn Fn(&InstanceRef) -> Option<Lowered>,
    ) -> Result<Lowered, InstanceError> {
        match self {
            InstanceRef::GlobalToken(_)
            | InstanceRef::Variable(_)
            | InstanceRef::SelfObject
            | InstanceRef::Param(_) => Ok(binder(self).unwrap_or_else(|| Lowered::Place(self.clone()))),
            InstanceRef::Deref(inner) => Ok(inner.instantiate_lowered(binder)?.deref()),
            InstanceRef::FieldOfObject { base, field } => {
                match base.instantiate_lowered(binder)? {
                    Lowered::Place(p) => Ok(Lowered::Place(InstanceRef::field(p, field.clone()))),
                    Lowered::Address(p) => Err(InstanceError::BadAddress(format!("{p}.{field}"))),
                }
            }
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceRef::GlobalToken(name) | InstanceRef::Variable(name) => write!(f, "{name}"),
            InstanceRef::SelfObject => write!(f, "self"),
            InstanceRef::Param(idx) => write!(f, "${idx}"),
            InstanceRef::Deref(inner) => match inner.as_ref() {
                InstanceRef::Deref(_) | InstanceRef::FieldOfObject { .. } => write!(f, "*({inner})"),
                _ => write!(f, "*{inner}"),
            },
            InstanceRef::FieldOfObject { base, field } => match base.as_ref() {
                InstanceRef::Deref(ptr) => match ptr.as_ref() {
                    InstanceRef::Deref(_) => write!(f, "({ptr})->{field}"),
                    _ => write!(f, "{ptr}->{field}"),
                },
                other => write!(f, "{other}.{field}"),
            },
        }
    }
}

/// Result of lowering an expression: either a place (lvalue) or the address
/// of one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lowered {
    Place(InstanceRef),
    Address(InstanceRef),
}

impl Lowered {
    fn deref(self) -> Lowered {
        match self {
            Lowered::Address(p) => Lowered::Place(p),
            Lowered::Place(p) => Lowered::Place(InstanceRef::deref(p)),
        }
    }

    /// The object designated when the value is used as an object expression.
    pub fn into_object(self) -> InstanceRef {
        match self {
            Lowered::Place(p) | Lowered::Address(p) => p,
        }
    }

    /// The object designated when the expression evaluates to a pointer to it.
    pub fn into_pointee(self) -> InstanceRef {
        match self {
            Lowered::Address(p) => p,
            Lowered::Place(p) => InstanceRef::deref(p),
        }
    }
}

/// Maps identifiers to roots in some scope (callee contract, struct, caller body).
pub trait RootResolver {
    fn resolve_root(&self, ident: &str) -> Result<Lowered, InstanceError>;
}

/// Lower an expression to a normalized place or address.
///
/// `allow_index` treats `a[i]` as `*a`; only member-access checking wants
/// that, capability identities reject indexing.
pub fn lower(
    expr: &Expr,
    roots: &dyn RootResolver,
    allow_index: bool,
) -> Result<Lowered, InstanceError> {
    match expr {
        Expr::Ident(name) => roots.resolve_root(name),
        Expr::Int(_) => Err(InstanceError::Unsupported(expr.to_string())),
        Expr::AddrOf(inner) => match lower(inner, roots, allow_index)? {
            Lowered::Place(p) => Ok(Lowered::Address(p)),
            Lowered::Address(_) => Err(InstanceError::BadAddress(expr.to_string())),
        },
        Expr::Deref(inner) => Ok(lower(inner, roots, allow_index)?.deref()),
        Expr::Field { base, field } => match lower(base, roots, allow_index)? {
            Lowered::Place(p) => Ok(Lowered::Place(InstanceRef::field(p, field.clone()))),
            Lowered::Address(_) => Err(InstanceError::BadAddress(expr.to_string())),
        },
        Expr::Index { base, .. } if allow_index => Ok(lower(base, roots, allow_index)?.deref()),
        Expr::Index { .. } => Err(InstanceError::Unsupported(expr.to_string())),
    }
}

/// A capability instance together with its capability type when known.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instance {
    pub reference: InstanceRef,
    pub ty: Option<CapabilityTypeId>,
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reference)
    }
}

/// Registry of capability types.
///
/// Built during the single-writer declaration phase, read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct CapabilityModel {
    types: Vec<(String, CapabilityKind)>,
    by_name: HashMap<String, CapabilityTypeId>,
}

impl CapabilityModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability type. Re-declaring the same name with the same
    /// kind returns the existing id.
    pub fn declare_type(
        &mut self,
        name: &str,
        kind: CapabilityKind,
    ) -> Result<CapabilityTypeId, CapabilityKind> {
        if let Some(&id) = self.by_name.get(name) {
            let existing = self.types[id.0 as usize].1;
            if existing != kind {
                return Err(existing);
            }
            return Ok(id);
        }

        let id = CapabilityTypeId(self.types.len() as u32);
        self.types.push((name.to_string(), kind));
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<CapabilityTypeId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: CapabilityTypeId) -> &str {
        &self.types[id.0 as usize].0
    }

    pub fn kind(&self, id: CapabilityTypeId) -> CapabilityKind {
        self.types[id.0 as usize].1
    }

    /// Build an instance handle for `expr`.
    ///
    /// `indirect` says whether the expression evaluates to a pointer to the
    /// capability (a `spinlock_t *` parameter) rather than naming the object
    /// itself. Both spellings end up at the same handle: `l`, `*l` for a
    /// pointer `l`, and `&s->lock`, `s->lock` for a member.
    pub fn make_instance(
        &self,
        expr: &Expr,
        ty: Option<CapabilityTypeId>,
        indirect: bool,
        roots: &dyn RootResolver,
    ) -> Result<Instance, InstanceError> {
        let lowered = lower(expr, roots, false)?;
        let reference = if indirect {
            lowered.into_pointee()
        } else {
            lowered.into_object()
        };
        Ok(Instance { reference, ty })
    }

    /// Conservative alias test: false only when `a` and `b` are provably
    /// distinct objects.
    pub fn instances_may_alias(&self, a: &Instance, b: &Instance) -> bool {
        if a.reference == b.reference {
            return true;
        }
        if let (Some(x), Some(y)) = (a.ty, b.ty)
            && x != y
        {
            return false;
        }
        refs_may_alias(&a.reference, &b.reference)
    }
}

fn refs_may_alias(a: &InstanceRef, b: &InstanceRef) -> bool {
    use InstanceRef::*;

    if a == b {
        return true;
    }
    match (a, b) {
        // A pointer may reach any object of the right type.
        (Deref(_), _) | (_, Deref(_)) => true,
        (SelfObject | Param(_), _) | (_, SelfObject | Param(_)) => true,
        (FieldOfObject { base: b1, field: f1 }, FieldOfObject { base: b2, field: f2 }) => {
            f1 == f2 && refs_may_alias(b1, b2)
        }
        // Distinct named objects, or a subobject against a whole named object.
        (GlobalToken(_), GlobalToken(_))
        | (Variable(_), Variable(_))
        | (GlobalToken(_), Variable(_))
        | (Variable(_), GlobalToken(_))
        | (FieldOfObject { .. }, GlobalToken(_) | Variable(_))
        | (GlobalToken(_) | Variable(_), FieldOfObject { .. }) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expr;

    struct Params;

    impl RootResolver for Params {
        fn resolve_root(&self, ident: &str) -> Result<Lowered, InstanceError> {
            match ident {
                "big_lock" => Ok(Lowered::Place(InstanceRef::GlobalToken(ident.to_string()))),
                "rcu" => Ok(Lowered::Address(InstanceRef::GlobalToken(ident.to_string()))),
                _ => Ok(Lowered::Place(InstanceRef::Variable(ident.to_string()))),
            }
        }
    }

    fn inst(model: &CapabilityModel, text: &str, indirect: bool) -> Instance {
        model
            .make_instance(&parse_expr(text).unwrap(), None, indirect, &Params)
            .unwrap()
    }

    #[test]
    fn declare_type_is_idempotent() {
        let mut model = CapabilityModel::new();
        let a = model.declare_type("spinlock_t", CapabilityKind::Struct).unwrap();
        let b = model.declare_type("spinlock_t", CapabilityKind::Struct).unwrap();
        assert_eq!(a, b);
        assert_eq!(model.types.len(), 1);
        assert_eq!(
            model.declare_type("spinlock_t", CapabilityKind::Token),
            Err(CapabilityKind::Struct)
        );
    }

    #[test]
    fn equivalent_spellings_share_a_handle() {
        let model = CapabilityModel::new();
        assert_eq!(inst(&model, "&s->lock", true), inst(&model, "s->lock", false));
        assert_eq!(inst(&model, "&(*s).lock", true), inst(&model, "s->lock", false));
        assert_eq!(inst(&model, "l", true), inst(&model, "*l", false));
        assert_eq!(inst(&model, "*&big_lock", false), inst(&model, "&big_lock", true));
        assert_eq!(inst(&model, "rcu", true), inst(&model, "*rcu", false));
        assert_eq!(inst(&model, "&s->lock", true).to_string(), "s->lock");
    }

    #[test]
    fn indexing_has_no_identity() {
        let model = CapabilityModel::new();
        let err = model
            .make_instance(&parse_expr("&locks[i]").unwrap(), None, true, &Params)
            .unwrap_err();
        assert!(matches!(err, InstanceError::Unsupported(_)));
    }

    #[test]
    fn alias_policy() {
        let mut model = CapabilityModel::new();
        let spin = model.declare_type("spinlock_t", CapabilityKind::Struct).unwrap();
        let mutex = model.declare_type("mutex", CapabilityKind::Struct).unwrap();
        let typed = |text: &str, ty| Instance {
            ty: Some(ty),
            ..inst(&model, text, true)
        };

        // pointers with unknown aliasing
        assert!(model.instances_may_alias(&typed("&a->lock", spin), &typed("&b->lock", spin)));
        assert!(model.instances_may_alias(&typed("p", spin), &typed("&big_lock", spin)));
        // different fields of one object
        assert!(!model.instances_may_alias(&typed("&a->lock", spin), &typed("&a->other", spin)));
        // different named globals
        assert!(!model.instances_may_alias(&typed("&big_lock", spin), &typed("rcu", spin)));
        // nominal types never alias
        assert!(!model.instances_may_alias(&typed("p", spin), &typed("q", mutex)));
    }

    #[test]
    fn instantiate_binds_parameters() {
        let model = CapabilityModel::new();
        let template = inst(&model, "&obj->lock", true).reference;
        let arg = Lowered::Address(InstanceRef::field(
            InstanceRef::deref(InstanceRef::Variable("s".into())),
            "inner",
        ));
        let bound = template
            .instantiate(&|root| match root {
                InstanceRef::Variable(n) if n == "obj" => Some(arg.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(bound.to_string(), "s->inner.lock");
    }
}
