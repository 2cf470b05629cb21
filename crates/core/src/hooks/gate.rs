//! Dispatch gate shared between a hook's manager entry and its detour
//!
//! A detour may be entered on any thread while the hook is being installed
//! or removed. It consults its [`HookGate`] to decide whether to run the
//! interception logic and where to forward the call.
//!
//! Forwarding happens inside an [`InFlight`] guard. Removal waits for the
//! guard count to drain before the trampoline is freed, so a call that
//! picked the trampoline never lands on released memory.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::manager::HookStatus;

struct GateInner {
    original: usize,
    status: AtomicU8,
    trampoline: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Shared, lock-free view of one hook's lifecycle
#[derive(Clone)]
pub struct HookGate(Arc<GateInner>);

impl HookGate {
    pub fn new(original: usize) -> Self {
        Self(Arc::new(GateInner {
            original,
            status: AtomicU8::new(HookStatus::NotInstalled as u8),
            trampoline: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }))
    }

    pub fn original(&self) -> usize {
        self.0.original
    }

    pub fn status(&self) -> HookStatus {
        HookStatus::from_u8(self.0.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: HookStatus) {
        self.0.status.store(status as u8, Ordering::SeqCst);
    }

    pub(crate) fn publish_trampoline(&self, trampoline: usize) {
        self.0.trampoline.store(trampoline, Ordering::SeqCst);
    }

    pub(crate) fn clear_trampoline(&self) {
        self.0.trampoline.store(0, Ordering::SeqCst);
    }

    /// Whether the detour should run its interception logic
    pub fn should_intercept(&self) -> bool {
        self.status() == HookStatus::Active
    }

    /// Address the detour must call to reach the original code
    ///
    /// The trampoline while the patch is live, otherwise the original entry,
    /// which by then has its bytes restored.
    ///
    /// Only stable while an [`InFlight`] guard is held; detours go through
    /// [`InFlight::forward_target`].
    pub fn forward_target(&self) -> usize {
        let trampoline = self.0.trampoline.load(Ordering::SeqCst);
        match self.status() {
            HookStatus::Installing | HookStatus::Active if trampoline != 0 => trampoline,
            _ => self.0.original,
        }
    }

    /// Mark a call as forwarding until the guard drops
    pub fn enter(&self) -> InFlight<'_> {
        self.0.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight { gate: self }
    }

    /// Calls currently between [`HookGate::enter`] and guard drop
    pub fn in_flight(&self) -> usize {
        self.0.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no call is forwarding. False on timeout.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() != 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }
}

/// A detour call that may be running trampoline code
#[must_use]
pub struct InFlight<'g> {
    gate: &'g HookGate,
}

impl InFlight<'_> {
    /// Where to forward; stays callable until this guard drops
    pub fn forward_target(&self) -> usize {
        self.gate.forward_target()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gate.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for HookGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookGate")
            .field("original", &format_args!("{:x}", self.0.original))
            .field("status", &self.status())
            .field(
                "trampoline",
                &format_args!("{:x}", self.0.trampoline.load(Ordering::SeqCst)),
            )
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_lifecycle() {
        let gate = HookGate::new(0x1000);
        assert!(!gate.should_intercept());
        assert_eq!(gate.forward_target(), 0x1000);

        gate.set_status(HookStatus::Installing);
        assert_eq!(gate.forward_target(), 0x1000);
        gate.publish_trampoline(0x2000);
        assert_eq!(gate.forward_target(), 0x2000);
        assert!(!gate.should_intercept());

        gate.set_status(HookStatus::Active);
        assert!(gate.should_intercept());
        assert_eq!(gate.forward_target(), 0x2000);

        // Mid-removal: bytes restored, trampoline not yet cleared
        gate.set_status(HookStatus::Removed);
        assert!(!gate.should_intercept());
        assert_eq!(gate.forward_target(), 0x1000);
    }

    #[test]
    fn test_clones_share_state() {
        let gate = HookGate::new(0x1000);
        let detour_view = gate.clone();
        gate.set_status(HookStatus::Active);
        gate.publish_trampoline(0x3000);
        assert!(detour_view.should_intercept());
        assert_eq!(detour_view.forward_target(), 0x3000);
    }

    #[test]
    fn test_in_flight_guard_counts() {
        let gate = HookGate::new(0x1000);
        gate.set_status(HookStatus::Active);
        gate.publish_trampoline(0x2000);

        let call = gate.enter();
        assert_eq!(call.forward_target(), 0x2000);
        assert_eq!(gate.in_flight(), 1);
        assert!(!gate.wait_idle(Duration::from_millis(5)));

        drop(call);
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.wait_idle(Duration::from_millis(5)));
    }
}
