//! Regions where capability analysis is switched off.
//!
//! Two forms exist. `capability_unsafe(...)` wraps statements and is walked
//! under a [`SuppressionGuard`], which restores checking on every exit from
//! the walk. The `disable_capability_analysis()` /
//! `enable_capability_analysis()` markers instead change the suppression
//! depth carried in the environment, so they follow control flow.

use std::cell::Cell;

/// Marker calls recognized as statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Begin,
    End,
}

pub fn marker_for_call(callee: &str) -> Option<Marker> {
    match callee {
        "disable_capability_analysis" => Some(Marker::Begin),
        "enable_capability_analysis" => Some(Marker::End),
        _ => None,
    }
}

/// Depth of `capability_unsafe` blocks the statement walker is inside.
#[derive(Debug, Default)]
pub struct SuppressionScope {
    depth: Cell<u32>,
}

impl SuppressionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.depth.get() > 0
    }

    /// Open a region; it closes when the guard is dropped.
    pub fn enter(&self) -> SuppressionGuard<'_> {
        self.depth.set(self.depth.get() + 1);
        SuppressionGuard { scope: self }
    }

    /// Checks run only outside every `capability_unsafe` block and with no
    /// marker region open on the current path.
    pub fn checks_enabled(&self, marker_depth: u32) -> bool {
        !self.is_active() && marker_depth == 0
    }
}

#[must_use = "the region closes as soon as the guard is dropped"]
pub struct SuppressionGuard<'a> {
    scope: &'a SuppressionScope,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.scope.depth.set(self.scope.depth.get().saturating_sub(1));
    }
}
