//! Capability environment: the per-program-point approximation of which
//! capabilities are held, plus the path-local facts the analyzer tracks.
//!
//! The environment under-approximates guarantees. An instance that is absent
//! is not held; `Unknown` means predecessors or effects disagree and nothing
//! can be asserted either way.

use crate::capability::{CapabilityModel, CapabilityTypeId, Instance, InstanceRef, Mode};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeldState {
    NotHeld,
    HeldShared,
    HeldExclusive,
    Unknown,
}

impl HeldState {
    pub fn held(mode: Mode) -> Self {
        match mode {
            Mode::Shared => HeldState::HeldShared,
            Mode::Exclusive => HeldState::HeldExclusive,
        }
    }

    pub fn mode(self) -> Option<Mode> {
        match self {
            HeldState::HeldShared => Some(Mode::Shared),
            HeldState::HeldExclusive => Some(Mode::Exclusive),
            HeldState::NotHeld | HeldState::Unknown => None,
        }
    }

    /// Provably held in a mode that satisfies `required`.
    pub fn satisfies(self, required: Mode) -> bool {
        self.mode().is_some_and(|held| held.satisfies(required))
    }

    pub fn join(self, other: HeldState) -> HeldState {
        if self == other {
            self
        } else {
            HeldState::Unknown
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            HeldState::NotHeld => "not held",
            HeldState::HeldShared => "held shared",
            HeldState::HeldExclusive => "held exclusively",
            HeldState::Unknown => "possibly not held",
        }
    }
}

/// `held exclusively` / `held (at least shared)`, for messages.
pub fn held_phrase(mode: Mode) -> &'static str {
    match mode {
        Mode::Shared => "held (at least shared)",
        Mode::Exclusive => "held exclusively",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub state: HeldState,
    pub ty: Option<CapabilityTypeId>,
}

/// Pending try-acquire outcome keyed by the local holding the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub instance: Instance,
    pub mode: Mode,
    /// Truthiness of the local on which the capability is held.
    pub success: bool,
    /// State before the attempt, restored on the failure arm.
    pub prior: HeldState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    held: BTreeMap<InstanceRef, Fact>,
    asserted: BTreeSet<InstanceRef>,
    correlations: BTreeMap<String, Vec<Correlation>>,
    bindings: BTreeMap<String, InstanceRef>,
    constants: BTreeMap<String, bool>,
    suppression: u32,
    suppression_conflict: bool,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, instance: &InstanceRef) -> HeldState {
        self.held
            .get(instance)
            .map_or(HeldState::NotHeld, |fact| fact.state)
    }

    pub fn set(&mut self, instance: &Instance, state: HeldState) {
        if state == HeldState::NotHeld {
            self.held.remove(&instance.reference);
        } else {
            let ty = instance
                .ty
                .or_else(|| self.held.get(&instance.reference).and_then(|f| f.ty));
            self.held
                .insert(instance.reference.clone(), Fact { state, ty });
        }
    }

    /// Instances that are held or possibly held.
    pub fn facts(&self) -> impl Iterator<Item = (&InstanceRef, &Fact)> {
        self.held.iter()
    }

    pub fn is_asserted(&self, instance: &InstanceRef) -> bool {
        self.asserted.contains(instance)
    }

    pub fn binding(&self, local: &str) -> Option<&InstanceRef> {
        self.bindings.get(local)
    }

    pub fn bind(&mut self, local: &str, instance: InstanceRef) {
        self.bindings.insert(local.to_string(), instance);
    }

    pub fn constant(&self, local: &str) -> Option<bool> {
        self.constants.get(local).copied()
    }

    pub fn set_constant(&mut self, local: &str, value: bool) {
        self.constants.insert(local.to_string(), value);
    }

    pub fn correlations(&self, local: &str) -> &[Correlation] {
        self.correlations.get(local).map(Vec::as_slice).unwrap_or_default()
    }

    /// Copy what is known about `from` to `to` (`to = from`).
    pub fn copy_local(&mut self, to: &str, from: &str) {
        if let Some(instance) = self.bindings.get(from).cloned() {
            self.bindings.insert(to.to_string(), instance);
        }
        if let Some(value) = self.constants.get(from).copied() {
            self.constants.insert(to.to_string(), value);
        }
        if let Some(cors) = self.correlations.get(from).cloned() {
            self.correlations.insert(to.to_string(), cors);
        }
    }

    /// `local` is assigned: everything reached through its old value is lost.
    /// Held instances rooted at it become `Unknown`.
    pub fn rebind_local(&mut self, local: &str) {
        let rooted = |r: &InstanceRef| r.root_variable() == Some(local);

        for (_, fact) in self.held.iter_mut().filter(|(r, _)| rooted(*r)) {
            fact.state = HeldState::Unknown;
        }
        self.asserted.retain(|r| !rooted(r));
        self.correlations.remove(local);
        for cors in self.correlations.values_mut() {
            cors.retain(|c| !rooted(&c.instance.reference));
        }
        self.correlations.retain(|_, cors| !cors.is_empty());
        self.bindings.remove(local);
        self.bindings.retain(|_, target| !rooted(target));
        self.constants.remove(local);
    }

    // ------------------------------------------------------------------------
    // Suppression depth
    // ------------------------------------------------------------------------

    pub fn suppression_depth(&self) -> u32 {
        self.suppression
    }

    pub fn enter_suppression(&mut self) {
        self.suppression += 1;
    }

    /// Returns false when no region is open.
    pub fn leave_suppression(&mut self) -> bool {
        if self.suppression == 0 {
            return false;
        }
        self.suppression -= 1;
        true
    }

    pub fn restore_suppression(&mut self, depth: u32) {
        self.suppression = depth;
    }

    /// Predecessors reached this point with different suppression depths.
    pub fn suppression_conflict(&self) -> bool {
        self.suppression_conflict
    }

    // ------------------------------------------------------------------------
    // Join and branch refinement
    // ------------------------------------------------------------------------

    /// Conservative merge of two predecessor environments.
    pub fn join(&self, other: &Environment) -> Environment {
        let mut held = BTreeMap::new();
        for key in self.held.keys().chain(other.held.keys()) {
            if held.contains_key(key) {
                continue;
            }
            let (a, b) = (self.held.get(key), other.held.get(key));
            let state_a = a.map_or(HeldState::NotHeld, |f| f.state);
            let state_b = b.map_or(HeldState::NotHeld, |f| f.state);
            let ty = a.and_then(|f| f.ty).or_else(|| b.and_then(|f| f.ty));
            let state = state_a.join(state_b);
            if state != HeldState::NotHeld {
                held.insert(key.clone(), Fact { state, ty });
            }
        }

        Environment {
            held,
            asserted: self.asserted.intersection(&other.asserted).cloned().collect(),
            correlations: agreeing(&self.correlations, &other.correlations),
            bindings: agreeing(&self.bindings, &other.bindings),
            constants: agreeing(&self.constants, &other.constants),
            // The shallower depth wins so checks resume after the merge and a
            // loop that opens a region each iteration still converges.
            suppression: self.suppression.min(other.suppression),
            suppression_conflict: self.suppression_conflict
                || other.suppression_conflict
                || self.suppression != other.suppression,
        }
    }

    /// Environment on the arm where `local` has truthiness `truth`.
    ///
    /// Pending try-acquires stored in `local` resolve: held on the success
    /// arm, back to the prior state on the other.
    pub fn refine(&self, local: &str, truth: bool) -> Environment {
        let mut env = self.clone();
        if let Some(cors) = env.correlations.remove(local) {
            for cor in cors {
                let state = if cor.success == truth {
                    HeldState::held(cor.mode)
                } else {
                    cor.prior
                };
                env.set(&cor.instance, state);
            }
        }
        env.constants.insert(local.to_string(), truth);
        env
    }

    fn forget_correlations(&mut self, instance: &InstanceRef) {
        for cors in self.correlations.values_mut() {
            cors.retain(|c| &c.instance.reference != instance);
        }
        self.correlations.retain(|_, cors| !cors.is_empty());
    }
}

fn agreeing<K: Ord + Clone, V: PartialEq + Clone>(
    a: &BTreeMap<K, V>,
    b: &BTreeMap<K, V>,
) -> BTreeMap<K, V> {
    a.iter()
        .filter(|(k, v)| b.get(*k) == Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ============================================================================
// Bound contracts
// ============================================================================

/// A contract clause bound to a concrete instance at a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundCap {
    pub instance: Instance,
    pub mode: Mode,
    pub clause: String,
}

/// A callee contract with its templates bound to the call's arguments.
#[derive(Debug, Clone, Default)]
pub struct BoundContract {
    pub callee: String,
    pub requires: Vec<BoundCap>,
    pub excludes: Vec<BoundCap>,
    pub acquires: Vec<BoundCap>,
    pub releases: Vec<BoundCap>,
    pub try_acquires: Vec<(BoundCap, bool)>,
    pub asserts: Vec<BoundCap>,
    /// Instance whose address the callee returns.
    pub returns: Option<BoundCap>,
    /// Releases whose instance could not be resolved, by capability type.
    pub unresolved_releases: Vec<Option<CapabilityTypeId>>,
}

/// Where the call's return value goes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallResult<'a> {
    pub local: Option<&'a str>,
    /// Truthiness of the result when statically known.
    pub value: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    NotHeld,
    StillHeld,
    Excluded,
    ContractMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub instance: InstanceRef,
    pub clause: String,
    pub message: String,
}

/// Check the call-site obligations of `contract` against `env`.
pub fn apply_requires(env: &Environment, contract: &BoundContract) -> Result<(), Vec<Violation>> {
    let mut violations = Vec::new();
    let callee = &contract.callee;

    for req in &contract.requires {
        let state = env.state(&req.instance.reference);
        if !state.satisfies(req.mode) {
            violations.push(Violation {
                kind: ViolationKind::NotHeld,
                instance: req.instance.reference.clone(),
                clause: req.clause.clone(),
                message: format!(
                    "calling `{callee}` requires `{}` {}, but it is {}",
                    req.instance,
                    held_phrase(req.mode),
                    state.describe()
                ),
            });
        }
    }

    for exc in &contract.excludes {
        let state = env.state(&exc.instance.reference);
        if state != HeldState::NotHeld {
            let now = if state == HeldState::Unknown {
                "possibly held"
            } else {
                state.describe()
            };
            violations.push(Violation {
                kind: ViolationKind::Excluded,
                instance: exc.instance.reference.clone(),
                clause: exc.clause.clone(),
                message: format!(
                    "calling `{callee}` requires `{}` not held, but it is {now}",
                    exc.instance
                ),
            });
        }
    }

    for rel in &contract.releases {
        let state = env.state(&rel.instance.reference);
        match state.mode() {
            None => violations.push(Violation {
                kind: ViolationKind::NotHeld,
                instance: rel.instance.reference.clone(),
                clause: rel.clause.clone(),
                message: format!(
                    "`{callee}` releases `{}`, but it is {}",
                    rel.instance,
                    state.describe()
                ),
            }),
            Some(held) if held != rel.mode => violations.push(Violation {
                kind: ViolationKind::ContractMismatch,
                instance: rel.instance.reference.clone(),
                clause: rel.clause.clone(),
                message: format!(
                    "`{callee}` releases `{}` as {}, but it is {}",
                    rel.instance,
                    rel.mode.as_str(),
                    state.describe()
                ),
            }),
            Some(_) => {}
        }
    }

    for acq in &contract.acquires {
        let state = env.state(&acq.instance.reference);
        if state.mode().is_some() {
            violations.push(Violation {
                kind: ViolationKind::Excluded,
                instance: acq.instance.reference.clone(),
                clause: acq.clause.clone(),
                message: format!(
                    "`{callee}` acquires `{}`, but it is already {}",
                    acq.instance,
                    state.describe()
                ),
            });
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Apply the effects of `contract`: releases, then acquires, then asserts,
/// then try-acquires.
pub fn apply_effects(
    env: &mut Environment,
    contract: &BoundContract,
    result: CallResult<'_>,
    model: &CapabilityModel,
) {
    for rel in &contract.releases {
        let reference = &rel.instance.reference;
        let tracked = env.held.contains_key(reference);
        env.set(&rel.instance, HeldState::NotHeld);
        env.asserted.remove(reference);
        env.forget_correlations(reference);

        // Held instances are pairwise distinct; only a release of something
        // that was not tracked may hit one of them through an alias.
        if !tracked {
            let aliased: Vec<Instance> = env
                .held
                .iter()
                .map(|(r, f)| Instance {
                    reference: r.clone(),
                    ty: f.ty,
                })
                .filter(|held| model.instances_may_alias(held, &rel.instance))
                .collect();
            for instance in aliased {
                env.set(&instance, HeldState::Unknown);
            }
        }
    }

    for ty in &contract.unresolved_releases {
        for fact in env.held.values_mut() {
            if ty.is_none() || fact.ty.is_none() || fact.ty == *ty {
                fact.state = HeldState::Unknown;
            }
        }
    }

    for acq in &contract.acquires {
        env.set(&acq.instance, HeldState::held(acq.mode));
        env.asserted.remove(&acq.instance.reference);
        env.forget_correlations(&acq.instance.reference);
    }

    for asserted in &contract.asserts {
        let state = env.state(&asserted.instance.reference);
        if !state.satisfies(asserted.mode) {
            env.set(&asserted.instance, HeldState::held(asserted.mode));
        }
        env.asserted.insert(asserted.instance.reference.clone());
    }

    for (cap, success) in &contract.try_acquires {
        let reference = &cap.instance.reference;
        let prior = env.state(reference);
        env.forget_correlations(reference);
        match result.value {
            Some(value) if value == *success => env.set(&cap.instance, HeldState::held(cap.mode)),
            Some(_) => {}
            None => {
                env.set(&cap.instance, HeldState::Unknown);
                if let Some(local) = result.local {
                    env.correlations
                        .entry(local.to_string())
                        .or_default()
                        .push(Correlation {
                            instance: cap.instance.clone(),
                            mode: cap.mode,
                            success: *success,
                            prior,
                        });
                }
            }
        }
    }
}
