//! Admission policy: which (mode, language) pairs may be instantiated.
//!
//! A pure membership test over an ordered, de-duplicated permitted set.
//! Operations that would create a kernel of a forbidden type fail with
//! `PolicyViolation` before any resource is acquired; pool preload entries
//! are filtered through the same predicate before warming begins.

use crate::types::{KernelLanguage, KernelMode, KernelTypeSpec};

/// Ordered set of permitted kernel types.
///
/// The default permits worker mode for every language and forbids in-process
/// mode: in-process kernels share the host thread and are treated as
/// elevated privilege.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    allowed: Vec<KernelTypeSpec>,
}

impl AdmissionPolicy {
    /// Builds a policy from `allowed`, preserving first-seen order and
    /// dropping duplicates.
    pub fn new(allowed: impl IntoIterator<Item = KernelTypeSpec>) -> Self {
        let mut set = Vec::new();
        for spec in allowed {
            if !set.contains(&spec) {
                set.push(spec);
            }
        }
        Self { allowed: set }
    }

    /// Pure membership test.
    pub fn is_allowed(&self, mode: KernelMode, language: KernelLanguage) -> bool {
        self.allowed
            .contains(&KernelTypeSpec::new(mode, language))
    }

    /// Defensive copy of the permitted set, in order.
    pub fn list(&self) -> Vec<KernelTypeSpec> {
        self.allowed.clone()
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::new([
            KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::Python),
            KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::Ts),
            KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::Js),
        ])
    }
}
