//! Cooperative interrupt delivery.
//!
//! When the host supports shared memory the coordinator owns a one-byte
//! region ([`InterruptRegion`], an `AtomicU8`): `0` means clear, `2` means
//! interrupt requested. The interpreter polls the region at its safe points
//! (bytecode boundaries for Python, loop back-edges for wrapped TS/JS guest
//! code) and clears it when it honours the request. Without shared memory
//! the coordinator falls back to posting an in-band `INTERRUPT` message,
//! which the interpreter observes by polling its request queue at the same
//! safe points.
//!
//! Interrupt of an idle kernel is a no-op that still reports success, and
//! interrupt never destroys the kernel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::transport::WorkerRequest;

/// Region value: no interrupt pending.
pub const INTERRUPT_CLEAR: u8 = 0;
/// Region value: interrupt requested.
pub const INTERRUPT_REQUESTED: u8 = 2;

/// The shared one-byte interrupt region.
pub type InterruptRegion = Arc<AtomicU8>;

/// Allocates a cleared interrupt region.
pub fn new_region() -> InterruptRegion {
    Arc::new(AtomicU8::new(INTERRUPT_CLEAR))
}

/// `true` iff an interrupt is currently requested in `region`.
/// Engine-side helper for safe-point polling.
pub fn is_requested(region: &InterruptRegion) -> bool {
    region.load(Ordering::SeqCst) == INTERRUPT_REQUESTED
}

/// Clears `region`. Engines call this when starting an execution and when
/// honouring a request.
pub fn clear(region: &InterruptRegion) {
    region.store(INTERRUPT_CLEAR, Ordering::SeqCst);
}

/// Manager-side interrupt delivery for one kernel.
#[derive(Debug, Clone)]
pub struct InterruptController {
    region: Option<InterruptRegion>,
    requests: mpsc::Sender<WorkerRequest>,
}

impl InterruptController {
    /// `region` is `None` when the host provides no shared memory; delivery
    /// then uses the in-band message fallback over `requests`.
    pub fn new(region: Option<InterruptRegion>, requests: mpsc::Sender<WorkerRequest>) -> Self {
        Self { region, requests }
    }

    /// Delivers a cooperative interrupt.
    ///
    /// Returns `true` once the request has been *delivered* (flag written or
    /// message enqueued), not once it has been honoured. `false` means the
    /// transport was already closed, which only happens while the kernel is
    /// being torn down.
    pub async fn signal(&self) -> bool {
        match &self.region {
            Some(region) => {
                region.store(INTERRUPT_REQUESTED, Ordering::SeqCst);
                true
            }
            None => self.requests.send(WorkerRequest::Interrupt).await.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex;

    #[tokio::test]
    async fn test_shared_region_signal_sets_requested_value() {
        let (transport, _endpoint) = duplex();
        let region = new_region();
        let controller = InterruptController::new(Some(Arc::clone(&region)), transport.sender());
        assert!(!is_requested(&region));
        assert!(controller.signal().await);
        assert!(is_requested(&region));
        assert_eq!(region.load(Ordering::SeqCst), INTERRUPT_REQUESTED);
    }

    #[tokio::test]
    async fn test_clear_resets_region() {
        let region = new_region();
        region.store(INTERRUPT_REQUESTED, Ordering::SeqCst);
        clear(&region);
        assert!(!is_requested(&region));
    }

    #[tokio::test]
    async fn test_message_fallback_posts_interrupt_request() {
        let (transport, mut endpoint) = duplex();
        let controller = InterruptController::new(None, transport.sender());
        assert!(controller.signal().await);
        assert_eq!(endpoint.next_request().await, Some(WorkerRequest::Interrupt));
    }

    #[tokio::test]
    async fn test_message_fallback_reports_false_on_closed_transport() {
        let (transport, endpoint) = duplex();
        let controller = InterruptController::new(None, transport.sender());
        drop(endpoint);
        drop(transport);
        assert!(!controller.signal().await);
    }

    #[tokio::test]
    async fn test_signal_is_idempotent() {
        let (transport, _endpoint) = duplex();
        let region = new_region();
        let controller = InterruptController::new(Some(Arc::clone(&region)), transport.sender());
        assert!(controller.signal().await);
        assert!(controller.signal().await);
        assert!(is_requested(&region));
    }
}
