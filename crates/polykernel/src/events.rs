//! Event model and per-kernel publish/subscribe bus.
//!
//! ## Envelope
//!
//! [`KernelEvent`] carries the message kinds of the scientific-notebook
//! model: `stream` chunks, rich `display_data`, the `execute_result` of the
//! last expression, structured `execute_error`s, and the supervisor-emitted
//! `execution_stalled` notification.
//!
//! ## Dispatch contract
//!
//! Delivery is synchronous, in enumeration order of registration. The bus
//! snapshots the listener list before dispatching, so:
//! - a listener removing itself (or any other listener) during its own
//!   dispatch is safe and takes effect for the next event;
//! - a panic in one listener is caught and logged, never propagated to the
//!   remaining listeners or back into the transport.
//!
//! Listeners have no stable identity in Rust, so [`EventBus::on`] returns a
//! [`ListenerId`] token and [`EventBus::off`] removes by token. Registering
//! the same closure twice yields two independent tokens.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::types::IdGen;

/// Subscription token returned by [`EventBus::on`].
pub type ListenerId = u64;

/// A MIME-type → payload map, e.g. `{"text/plain": "42"}`.
pub type MimeBundle = serde_json::Map<String, serde_json::Value>;

/// Which output stream a [`KernelEvent::Stream`] chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Event kinds a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Stream,
    DisplayData,
    ExecuteResult,
    ExecuteError,
    ExecutionStalled,
}

/// Structured error payload (`ename` / `evalue` / `traceback`), shared by
/// `execute_error` events and the [`ExecuteOutcome`] of a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

/// One event produced by a kernel (or synthesised by the supervisors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelEvent {
    Stream {
        name: StreamName,
        text: String,
    },
    DisplayData {
        data: MimeBundle,
        metadata: MimeBundle,
    },
    ExecuteResult {
        data: MimeBundle,
        metadata: MimeBundle,
        execution_count: u64,
    },
    ExecuteError {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    ExecutionStalled {
        kernel_id: String,
        execution_id: u64,
        elapsed_ms: u64,
    },
}

impl KernelEvent {
    /// The subscription kind this event is delivered under.
    pub fn kind(&self) -> EventKind {
        match self {
            KernelEvent::Stream { .. } => EventKind::Stream,
            KernelEvent::DisplayData { .. } => EventKind::DisplayData,
            KernelEvent::ExecuteResult { .. } => EventKind::ExecuteResult,
            KernelEvent::ExecuteError { .. } => EventKind::ExecuteError,
            KernelEvent::ExecutionStalled { .. } => EventKind::ExecutionStalled,
        }
    }

    /// The error payload, if this is an `execute_error` event.
    pub fn error_info(&self) -> Option<ErrorInfo> {
        match self {
            KernelEvent::ExecuteError {
                ename,
                evalue,
                traceback,
            } => Some(ErrorInfo {
                ename: ename.clone(),
                evalue: evalue.clone(),
                traceback: traceback.clone(),
            }),
            _ => None,
        }
    }
}

/// Final status of one `execute` call, resolved once the terminal event for
/// the submission has been observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    pub success: bool,
    pub error: Option<ErrorInfo>,
}

impl ExecuteOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            success: false,
            error: Some(error),
        }
    }
}

type Listener = Arc<dyn Fn(&KernelEvent) + Send + Sync + 'static>;

struct Registration {
    id: ListenerId,
    listener: Listener,
}

/// Per-kernel directory of listener sets keyed by event kind.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<HashMap<String, HashMap<EventKind, Vec<Registration>>>>,
    ids: IdGen,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for `kind` events of `kernel_id`.
    ///
    /// Duplicate registration is allowed; each call returns a fresh token.
    pub fn on<F>(&self, kernel_id: &str, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&KernelEvent) + Send + Sync + 'static,
    {
        let id = self.ids.next();
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        inner
            .entry(kernel_id.to_string())
            .or_default()
            .entry(kind)
            .or_default()
            .push(Registration {
                id,
                listener: Arc::new(listener),
            });
        id
    }

    /// Removes the listener registered under `listener_id`.
    ///
    /// Returns `false` when no such registration exists. Safe to call from
    /// within a dispatch; the removal takes effect for the next event.
    pub fn off(&self, kernel_id: &str, kind: EventKind, listener_id: ListenerId) -> bool {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        let Some(kinds) = inner.get_mut(kernel_id) else {
            return false;
        };
        let Some(registrations) = kinds.get_mut(&kind) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != listener_id);
        before != registrations.len()
    }

    /// Delivers `event` to every listener registered for its kind on
    /// `kernel_id`, in registration order.
    ///
    /// The listener list is snapshotted before the first call, and each call
    /// runs under `catch_unwind`: one panicking listener cannot starve the
    /// rest.
    pub fn emit(&self, kernel_id: &str, event: &KernelEvent) {
        let snapshot: Vec<Listener> = {
            let inner = self.inner.lock().expect("event bus mutex poisoned");
            inner
                .get(kernel_id)
                .and_then(|kinds| kinds.get(&event.kind()))
                .map(|registrations| {
                    registrations
                        .iter()
                        .map(|r| Arc::clone(&r.listener))
                        .collect()
                })
                .unwrap_or_default()
        };
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| (*listener)(event))).is_err() {
                tracing::warn!(
                    kernel_id,
                    kind = ?event.kind(),
                    "event listener panicked; continuing delivery"
                );
            }
        }
    }

    /// Drops every registration for `kernel_id`. Called on kernel
    /// destruction so callbacks the host still holds become dead handles.
    pub fn drop_kernel(&self, kernel_id: &str) {
        let mut inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.remove(kernel_id);
    }

    /// Number of live registrations for `kernel_id` across all kinds.
    pub fn listener_count(&self, kernel_id: &str) -> usize {
        let inner = self.inner.lock().expect("event bus mutex poisoned");
        inner
            .get(kernel_id)
            .map(|kinds| kinds.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}
