//! Properties every simulated device must keep, whatever failed on the way.
//!
//! A check runs over a [`SystemSnapshot`] (every device's memory and store
//! view plus the room algorithm history) and reports each violation it finds
//! rather than stopping at the first one. A violation names the device it
//! was found on, so a failing multi-device run points straight at the
//! culprit.
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let snapshot = SystemSnapshot::single(ClientSnapshot::capture(&machine)?);
//! registry.check_all(&snapshot)?;
//! ```

mod checks;
mod snapshot;

use std::fmt;

use keyward_proto::{DeviceId, UserId};

pub use checks::{AlgorithmMonotonicity, IndexResolves, MemoryIsDurable};
pub use snapshot::{ClientSnapshot, RoomSnapshot, SessionRef, StateView, SystemSnapshot};

/// A broken property, optionally pinned to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Device the violation was observed on
    pub device: Option<(UserId, DeviceId)>,
    /// What was observed
    pub message: String,
}

impl Violation {
    /// Violation of `invariant` not tied to a device.
    pub fn new(invariant: &'static str, message: impl Into<String>) -> Self {
        Self { invariant, device: None, message: message.into() }
    }

    /// Pin the violation to a device.
    #[must_use]
    pub fn on(mut self, user_id: &UserId, device_id: &DeviceId) -> Self {
        self.device = Some((user_id.clone(), device_id.clone()));
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device {
            Some((user_id, device_id)) => {
                write!(f, "[{}] {user_id}/{device_id}: {}", self.invariant, self.message)
            },
            None => write!(f, "[{}] {}", self.invariant, self.message),
        }
    }
}

impl std::error::Error for Violation {}

/// A property checked against a system snapshot.
pub trait Invariant: Send + Sync {
    /// Name used in violation reports.
    fn name(&self) -> &'static str;

    /// Push every violation found in `state` onto `found`.
    fn check(&self, state: &SystemSnapshot, found: &mut Vec<Violation>);
}

/// Ordered set of invariants run together.
#[derive(Default)]
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantRegistry {
    /// The invariants every simulation checks:
    /// - [`IndexResolves`]: index pointers name held sessions
    /// - [`AlgorithmMonotonicity`]: encrypted rooms never switch algorithm
    /// - [`MemoryIsDurable`]: a restart loses nothing held in memory
    pub fn standard() -> Self {
        Self::default().with(IndexResolves).with(AlgorithmMonotonicity).with(MemoryIsDurable)
    }

    /// Registry extended with `invariant`.
    #[must_use]
    pub fn with<I: Invariant + 'static>(mut self, invariant: I) -> Self {
        self.invariants.push(Box::new(invariant));
        self
    }

    /// Names of the registered invariants, in run order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.invariants.iter().map(|invariant| invariant.name())
    }

    /// Run every invariant and collect all violations.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let mut found = Vec::new();
        for invariant in &self.invariants {
            invariant.check(state, &mut found);
        }
        if found.is_empty() { Ok(()) } else { Err(found) }
    }

    /// Check all invariants, panicking with every violation.
    #[allow(clippy::panic, reason = "test assertion helper")]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let lines: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("{} violation(s) {context}:\n  {}", lines.len(), lines.join("\n  "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_runs_in_order() {
        let names: Vec<_> = InvariantRegistry::standard().names().collect();
        assert_eq!(names, ["IndexResolves", "AlgorithmMonotonicity", "MemoryIsDurable"]);
    }

    #[test]
    fn empty_snapshot_passes_invariants() {
        let registry = InvariantRegistry::standard();
        assert!(registry.check_all(&SystemSnapshot::empty()).is_ok());
    }

    #[test]
    fn violation_names_its_device() {
        let violation = Violation::new("MemoryIsDurable", "room state differs from store")
            .on(&UserId::from("@alice:sim"), &DeviceId::from("PHONE"));
        assert_eq!(
            violation.to_string(),
            "[MemoryIsDurable] @alice:sim/PHONE: room state differs from store"
        );
    }
}
