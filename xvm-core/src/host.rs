//! Host bridge: native callbacks reachable through CALLHOST
//!
//! Registrations are keyed by case-folded name and [`HostScope`]. A script
//! resolves a name against its own scope first, then against Global.

use crate::SlotIndex;
use crate::error::{VmError, VmResult};
use crate::vm::VirtualMachine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Native callback: receives the engine and the calling script's slot
pub type HostFunction = Arc<dyn Fn(&mut VirtualMachine, SlotIndex) -> VmResult<()> + Send + Sync>;

/// Visibility of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostScope {
    /// Callable from every script
    Global,
    /// Callable from one script only
    Script(SlotIndex),
}

impl HostScope {
    fn admits(&self, slot: SlotIndex) -> bool {
        match *self {
            HostScope::Global => true,
            HostScope::Script(owner) => owner == slot,
        }
    }
}

impl fmt::Display for HostScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostScope::Global => write!(f, "global"),
            HostScope::Script(slot) => write!(f, "script {}", slot),
        }
    }
}

struct HostApiEntry {
    name: String,
    scope: HostScope,
    function: HostFunction,
}

/// Fixed-capacity registration table
pub struct HostApiRegistry {
    entries: Vec<HostApiEntry>,
    capacity: usize,
}

impl HostApiRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Register `function` under `name`; an existing registration with the
    /// same name and scope is replaced
    pub fn register(&mut self, name: &str, scope: HostScope, function: HostFunction) -> VmResult<()> {
        let name = name.to_ascii_uppercase();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.scope == scope && e.name == name)
        {
            entry.function = function;
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(VmError::HostApiTableFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(HostApiEntry {
            name,
            scope,
            function,
        });
        Ok(())
    }

    /// Returns false when nothing was registered under that name and scope
    pub fn unregister(&mut self, name: &str, scope: HostScope) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.scope == scope && e.name.eq_ignore_ascii_case(name)));
        self.entries.len() != before
    }

    /// Drop every registration scoped to `slot`
    pub fn remove_scope(&mut self, slot: SlotIndex) {
        self.entries.retain(|e| e.scope != HostScope::Script(slot));
    }

    /// Callback visible to `slot` under `name`, script scope first
    pub fn lookup(&self, name: &str, slot: SlotIndex) -> Option<HostFunction> {
        let matching = |scope_wanted: fn(&HostScope) -> bool| {
            self.entries
                .iter()
                .find(|e| scope_wanted(&e.scope) && e.scope.admits(slot) && e.name.eq_ignore_ascii_case(name))
                .map(|e| Arc::clone(&e.function))
        };
        matching(|s| matches!(s, HostScope::Script(_))).or_else(|| matching(|s| *s == HostScope::Global))
    }

    /// Registered names with their scopes, in registration order
    pub fn names(&self) -> impl Iterator<Item = (&str, HostScope)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.scope))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Debug for HostApiRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostApiRegistry")
            .field("entries", &self.names().collect::<Vec<_>>())
            .field("capacity", &self.capacity)
            .finish()
    }
}
