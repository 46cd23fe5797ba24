//! Error taxonomy for manager operations.
//!
//! Every public failure is a typed [`ManagerError`] variant, never a
//! free-form string. The enum is serialized with an internally-tagged
//! `"type"` discriminator so JSON consumers can switch on `error.type`
//! without a wrapper object.
//!
//! # Examples (JSON)
//! ```json
//! {"type":"PolicyViolation","mode":"in_process","language":"python"}
//! {"type":"DuplicateId","id":"tenant:kernel-1"}
//! {"type":"NotFound","id":"missing"}
//! {"type":"BuildFailed","reason":"worker exited before READY"}
//! {"type":"KernelDead","id":"tenant:kernel-1"}
//! ```
//!
//! Two taxonomy rows are deliberately absent here: `ForcedTermination` is
//! synthesised as an `EXECUTE_ERROR` event rather than thrown, and an
//! interrupt that fails to stop an execution within a grace window is
//! reported by `interrupt_and_wait` returning `false`, leaving escalation to
//! the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{KernelLanguage, KernelMode};

/// Typed failure surfaced by `KernelManager` operations.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ManagerError {
    /// The requested (mode, language) pair is not in the admission set.
    /// Raised before any resource is acquired.
    #[error("kernel type {mode}-{language} is not permitted by the admission policy")]
    PolicyViolation {
        mode: KernelMode,
        language: KernelLanguage,
    },

    /// A kernel with the caller-supplied id already exists. The existing
    /// kernel is preserved.
    #[error("a kernel with id `{id}` already exists")]
    DuplicateId { id: String },

    /// No kernel with the given id.
    #[error("no kernel with id `{id}`")]
    NotFound { id: String },

    /// The interpreter or worker failed to reach `READY`. Wraps the
    /// underlying cause as a message.
    #[error("kernel build failed: {reason}")]
    BuildFailed { reason: String },

    /// The kernel was disposed between lookup and dispatch, or while a
    /// request was in flight.
    #[error("kernel `{id}` was disposed while the request was in flight")]
    KernelDead { id: String },
}
