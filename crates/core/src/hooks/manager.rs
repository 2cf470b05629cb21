//! Hook lifecycle management
//!
//! [`HookSafetyManager`] owns every detour the adapter places. It validates
//! both ends of a hook with the [`MemorySafetyManager`], refuses a second
//! active hook on the same target, and tears hooks down in an order that is
//! safe against calls still in flight:
//!
//! 1. restore the original bytes
//! 2. mark the gate `Removed` (detours now forward to the original)
//! 3. clear the gate's trampoline
//! 4. wait for detours still forwarding through the trampoline
//! 5. free the trampoline
//!
//! If step 4 times out the trampoline is left allocated.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, error, info, warn};

use super::detour::DetourBackend;
use super::gate::HookGate;
use crate::error::{VrError, VrResult};
use crate::memory::MemorySafetyManager;

new_key_type! {
    /// Handle for a managed hook
    pub struct HookKey;
}

/// Lifecycle of a single hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HookStatus {
    NotInstalled = 0,
    Installing = 1,
    Active = 2,
    Failed = 3,
    Removed = 4,
}

impl HookStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => HookStatus::Installing,
            2 => HookStatus::Active,
            3 => HookStatus::Failed,
            4 => HookStatus::Removed,
            _ => HookStatus::NotInstalled,
        }
    }
}

/// Everything known about one hook
#[derive(Debug, Clone, PartialEq)]
pub struct HookInfo {
    /// Entry of the hooked function
    pub original_function: usize,
    /// Entry of the replacement
    pub hook_function: usize,
    /// Address that runs the original code while the hook is active
    pub trampoline: Option<usize>,
    pub status: HookStatus,
    pub function_name: String,
    pub module_name: String,
    /// Thread that installed the hook
    pub owning_thread: Option<ThreadId>,
    /// Successful installs of this record
    pub hook_count: u32,
}

impl HookInfo {
    pub fn new(function_name: &str, module_name: &str, original: usize, hook: usize) -> Self {
        Self {
            original_function: original,
            hook_function: hook,
            trampoline: None,
            status: HookStatus::NotInstalled,
            function_name: function_name.to_string(),
            module_name: module_name.to_string(),
            owning_thread: None,
            hook_count: 0,
        }
    }
}

/// Hook manager settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Require both ends of a hook to be executable
    pub enable_hook_validation: bool,
    /// Remove remaining hooks when the manager is dropped
    pub enable_hook_rollback: bool,
    /// How long removal waits for in-flight calls before leaking the
    /// trampoline instead of freeing it
    pub drain_timeout_ms: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            enable_hook_validation: true,
            enable_hook_rollback: true,
            drain_timeout_ms: 2000,
        }
    }
}

struct HookEntry {
    info: HookInfo,
    gate: HookGate,
}

#[derive(Default)]
struct HookTable {
    entries: SlotMap<HookKey, HookEntry>,
    by_original: HashMap<usize, HookKey>,
}

impl HookTable {
    fn active_key(&self, original: usize) -> Option<HookKey> {
        self.by_original
            .get(&original)
            .copied()
            .filter(|&key| {
                self.entries
                    .get(key)
                    .map(|e| e.info.status == HookStatus::Active)
                    .unwrap_or(false)
            })
    }
}

/// Installs and removes detours with conflict detection and rollback
pub struct HookSafetyManager {
    memory: Arc<MemorySafetyManager>,
    config: HookConfig,
    backend: Mutex<Box<dyn DetourBackend>>,
    table: Mutex<HookTable>,
}

impl HookSafetyManager {
    pub fn new(
        memory: Arc<MemorySafetyManager>,
        config: HookConfig,
        backend: Box<dyn DetourBackend>,
    ) -> Self {
        Self {
            memory,
            config,
            backend: Mutex::new(backend),
            table: Mutex::new(HookTable::default()),
        }
    }

    /// Install a hook with a fresh gate
    ///
    /// # Safety
    /// See [`HookSafetyManager::install_hook_gated`].
    pub unsafe fn install_hook(&self, info: &mut HookInfo) -> VrResult<HookGate> {
        let gate = HookGate::new(info.original_function);
        self.install_hook_gated(info, gate)
    }

    /// Install a hook whose detour already holds `gate`
    ///
    /// On conflict `info` is left untouched. On backend failure it is marked
    /// `Failed`.
    ///
    /// # Safety
    /// `info.original_function` must be a function entry and
    /// `info.hook_function` a function with a compatible signature.
    #[tracing::instrument(skip_all, fields(name = %info.function_name))]
    pub unsafe fn install_hook_gated(
        &self,
        info: &mut HookInfo,
        gate: HookGate,
    ) -> VrResult<HookGate> {
        let original = info.original_function;

        if !self.validate_targets(info) {
            error!(
                target: "vrshim::hooks",
                "Rejected hook '{}': {:x} -> {:x} is not executable",
                info.function_name,
                original,
                info.hook_function
            );
            return Err(VrError::MemoryValidationFailed(format!(
                "hook '{}' endpoints are not executable",
                info.function_name
            )));
        }
        if gate.original() != original {
            return Err(VrError::HookInstallationFailed {
                name: info.function_name.clone(),
                reason: format!("gate belongs to {:x}", gate.original()),
            });
        }

        let mut table = self.table.lock();
        if table.active_key(original).is_some() {
            warn!(
                target: "vrshim::hooks",
                "Hook conflict: '{}' at {:x} is already active",
                info.function_name,
                original
            );
            return Err(VrError::HookConflict {
                name: info.function_name.clone(),
                original,
            });
        }

        // A previous Failed/Removed record for this target is superseded
        if let Some(stale) = table.by_original.remove(&original) {
            table.entries.remove(stale);
        }

        info.status = HookStatus::Installing;
        gate.set_status(HookStatus::Installing);

        let patched = self
            .backend
            .lock()
            .patch(original, info.hook_function);

        let trampoline = match patched {
            Ok(trampoline) => trampoline,
            Err(e) => {
                info.status = HookStatus::Failed;
                gate.set_status(HookStatus::Failed);
                error!(
                    target: "vrshim::hooks",
                    "Failed to install hook '{}' at {:x}: {}",
                    info.function_name,
                    original,
                    e
                );
                return Err(VrError::HookInstallationFailed {
                    name: info.function_name.clone(),
                    reason: e.to_string(),
                });
            }
        };

        gate.publish_trampoline(trampoline);
        gate.set_status(HookStatus::Active);

        info.trampoline = Some(trampoline);
        info.status = HookStatus::Active;
        info.owning_thread = Some(std::thread::current().id());
        info.hook_count += 1;

        let key = table.entries.insert(HookEntry {
            info: info.clone(),
            gate: gate.clone(),
        });
        table.by_original.insert(original, key);

        info!(
            target: "vrshim::hooks",
            "Installed hook '{}' ({}) at {:x}, trampoline {:x}",
            info.function_name,
            info.module_name,
            original,
            trampoline
        );
        Ok(gate)
    }

    /// Remove the active hook on `info.original_function`
    ///
    /// Returns `Ok(false)` when there was nothing active to remove.
    pub fn remove_hook(&self, info: &mut HookInfo) -> VrResult<bool> {
        let mut table = self.table.lock();
        let Some(key) = table.active_key(info.original_function) else {
            return Ok(false);
        };
        self.remove_entry(&mut table, key)?;
        info.status = HookStatus::Removed;
        info.trampoline = None;
        Ok(true)
    }

    fn remove_entry(&self, table: &mut HookTable, key: HookKey) -> VrResult<()> {
        let Some(entry) = table.entries.get(key) else {
            return Ok(());
        };
        let original = entry.info.original_function;
        let name = entry.info.function_name.clone();
        let gate = entry.gate.clone();

        let mut backend = self.backend.lock();
        unsafe { backend.unpatch(original) }.map_err(|e| {
            error!(target: "vrshim::hooks", "Failed to remove hook '{}' at {:x}: {}", name, original, e);
            VrError::HookInstallationFailed {
                name: name.clone(),
                reason: format!("unpatch failed: {e}"),
            }
        })?;

        gate.set_status(HookStatus::Removed);
        gate.clear_trampoline();
        if !gate.wait_idle(Duration::from_millis(self.config.drain_timeout_ms)) {
            warn!(
                target: "vrshim::hooks",
                "'{}' still has {} calls in its trampoline; leaving it allocated",
                name,
                gate.in_flight()
            );
        } else if !backend.release_trampoline(original) {
            warn!(target: "vrshim::hooks", "No trampoline to release for '{}'", name);
        }
        drop(backend);

        table.entries.remove(key);
        table.by_original.remove(&original);
        info!(target: "vrshim::hooks", "Removed hook '{}' at {:x}", name, original);
        Ok(())
    }

    /// Remove every active hook. Returns the number removed.
    pub fn rollback_all_hooks(&self) -> usize {
        let mut table = self.table.lock();
        let active: Vec<HookKey> = table
            .entries
            .iter()
            .filter(|(_, e)| e.info.status == HookStatus::Active)
            .map(|(key, _)| key)
            .collect();

        if active.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for key in active {
            match self.remove_entry(&mut table, key) {
                Ok(()) => removed += 1,
                Err(e) => error!(target: "vrshim::hooks", "Rollback incomplete: {}", e),
            }
        }
        info!(target: "vrshim::hooks", "Rolled back {} hooks", removed);
        removed
    }

    /// Snapshot of all active hooks
    pub fn get_active_hooks(&self) -> Vec<HookInfo> {
        self.table
            .lock()
            .entries
            .values()
            .filter(|e| e.info.status == HookStatus::Active)
            .map(|e| e.info.clone())
            .collect()
    }

    pub fn get_hook_status(&self, original: usize) -> HookStatus {
        let table = self.table.lock();
        table
            .by_original
            .get(&original)
            .and_then(|&key| table.entries.get(key))
            .map(|e| e.info.status)
            .unwrap_or(HookStatus::NotInstalled)
    }

    /// Gate of the hook on `original`, if one is recorded
    pub fn gate(&self, original: usize) -> Option<HookGate> {
        let table = self.table.lock();
        table
            .by_original
            .get(&original)
            .and_then(|&key| table.entries.get(key))
            .map(|e| e.gate.clone())
    }

    /// Whether an active hook already exists on `original`
    pub fn check_hook_conflicts(&self, original: usize) -> bool {
        self.table.lock().active_key(original).is_some()
    }

    /// Whether `info` would pass validation and conflict checks
    pub fn is_hook_safe(&self, info: &HookInfo) -> bool {
        self.validate_targets(info) && !self.check_hook_conflicts(info.original_function)
    }

    fn validate_targets(&self, info: &HookInfo) -> bool {
        if info.original_function == 0 || info.hook_function == 0 {
            return false;
        }
        if !self.config.enable_hook_validation {
            return true;
        }
        self.memory
            .is_safe_to_execute(info.original_function as *const u8)
            && self.memory.is_safe_to_execute(info.hook_function as *const u8)
    }
}

impl Drop for HookSafetyManager {
    fn drop(&mut self) {
        let active = self.get_active_hooks().len();
        if active == 0 {
            return;
        }
        if self.config.enable_hook_rollback {
            warn!(target: "vrshim::hooks", "Hook manager dropped with {} active hooks, rolling back", active);
            self.rollback_all_hooks();
        } else {
            debug!(target: "vrshim::hooks", "Hook manager dropped with {} active hooks left in place", active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::recording::{BackendCall, RecordingBackend};
    use crate::memory::SafetyConfig;

    extern "C" fn target_a() -> u32 {
        1
    }

    extern "C" fn target_b() -> u32 {
        2
    }

    extern "C" fn detour() -> u32 {
        3
    }

    fn manager() -> (HookSafetyManager, RecordingBackend) {
        let backend = RecordingBackend::new();
        let memory = Arc::new(MemorySafetyManager::new(SafetyConfig::default()));
        let mgr = HookSafetyManager::new(memory, HookConfig::default(), Box::new(backend.clone()));
        (mgr, backend)
    }

    fn info_for(f: extern "C" fn() -> u32, name: &str) -> HookInfo {
        HookInfo::new(name, "test.dll", f as usize, detour as usize)
    }

    #[test]
    fn test_install_marks_active() {
        let (mgr, _backend) = manager();
        let mut info = info_for(target_a, "A");
        let gate = unsafe { mgr.install_hook(&mut info) }.unwrap();

        assert_eq!(info.status, HookStatus::Active);
        assert_eq!(info.hook_count, 1);
        assert!(info.trampoline.is_some());
        assert_eq!(info.owning_thread, Some(std::thread::current().id()));
        assert!(gate.should_intercept());
        assert_eq!(gate.forward_target(), info.trampoline.unwrap());
        assert_eq!(mgr.get_hook_status(target_a as usize), HookStatus::Active);
    }

    #[test]
    fn test_conflict_leaves_info_unmodified() {
        let (mgr, _backend) = manager();
        let mut first = info_for(target_a, "A");
        unsafe { mgr.install_hook(&mut first) }.unwrap();

        let mut second = info_for(target_a, "A-again");
        let before = second.clone();
        let err = unsafe { mgr.install_hook(&mut second) }.unwrap_err();

        assert!(matches!(err, VrError::HookConflict { .. }));
        assert_eq!(second, before);
        assert_eq!(mgr.get_active_hooks().len(), 1);
    }

    #[test]
    fn test_non_executable_target_rejected() {
        let (mgr, backend) = manager();
        let data = vec![0u8; 64];
        let mut info = HookInfo::new("heap", "test.dll", data.as_ptr() as usize, detour as usize);

        let err = unsafe { mgr.install_hook(&mut info) }.unwrap_err();
        assert!(matches!(err, VrError::MemoryValidationFailed(_)));
        assert_eq!(info.status, HookStatus::NotInstalled);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_backend_failure_marks_failed() {
        let (mgr, backend) = manager();
        backend.fail_next_patch();
        let mut info = info_for(target_a, "A");

        let err = unsafe { mgr.install_hook(&mut info) }.unwrap_err();
        assert!(matches!(err, VrError::HookInstallationFailed { .. }));
        assert_eq!(info.status, HookStatus::Failed);
        assert!(mgr.get_active_hooks().is_empty());

        // A failed record does not block a retry
        unsafe { mgr.install_hook(&mut info) }.unwrap();
        assert_eq!(info.status, HookStatus::Active);
    }

    #[test]
    fn test_remove_releases_trampoline_once() {
        let (mgr, backend) = manager();
        let mut info = info_for(target_a, "A");
        let gate = unsafe { mgr.install_hook(&mut info) }.unwrap();

        assert!(mgr.remove_hook(&mut info).unwrap());
        assert!(!mgr.remove_hook(&mut info).unwrap());

        assert_eq!(info.status, HookStatus::Removed);
        assert_eq!(info.trampoline, None);
        assert_eq!(gate.status(), HookStatus::Removed);
        assert_eq!(gate.forward_target(), target_a as usize);
        assert_eq!(backend.release_count(target_a as usize), 1);

        let calls = backend.calls();
        let unpatch = calls
            .iter()
            .position(|c| matches!(c, BackendCall::Unpatch(_)))
            .unwrap();
        let release = calls
            .iter()
            .position(|c| matches!(c, BackendCall::Release(_)))
            .unwrap();
        assert!(unpatch < release);
    }

    #[test]
    fn test_rollback_all_is_idempotent() {
        let (mgr, _backend) = manager();
        let mut a = info_for(target_a, "A");
        let mut b = info_for(target_b, "B");
        unsafe {
            mgr.install_hook(&mut a).unwrap();
            mgr.install_hook(&mut b).unwrap();
        }

        assert_eq!(mgr.rollback_all_hooks(), 2);
        assert!(mgr.get_active_hooks().is_empty());
        assert_eq!(mgr.rollback_all_hooks(), 0);
        assert!(mgr.get_active_hooks().is_empty());
    }

    #[test]
    fn test_is_hook_safe() {
        let (mgr, _backend) = manager();
        let mut info = info_for(target_a, "A");
        assert!(mgr.is_hook_safe(&info));
        unsafe { mgr.install_hook(&mut info) }.unwrap();
        assert!(!mgr.is_hook_safe(&info_for(target_a, "A")));
        assert!(mgr.is_hook_safe(&info_for(target_b, "B")));
    }

    #[test]
    fn test_drop_rolls_back() {
        let (mgr, backend) = manager();
        let mut info = info_for(target_a, "A");
        unsafe { mgr.install_hook(&mut info) }.unwrap();
        drop(mgr);
        assert_eq!(backend.release_count(target_a as usize), 1);
        assert!(!backend.is_patched(target_a as usize));
    }

    #[test]
    fn test_remove_waits_for_forwarding_calls() {
        let (mgr, backend) = manager();
        let mut info = info_for(target_a, "A");
        let gate = unsafe { mgr.install_hook(&mut info) }.unwrap();

        let call = gate.enter();
        let trampoline = call.forward_target();
        assert_eq!(Some(trampoline), info.trampoline);

        std::thread::scope(|s| {
            let remover = s.spawn(|| {
                let mut info = info.clone();
                mgr.remove_hook(&mut info).unwrap()
            });
            // Unpatched and marked Removed, but the trampoline is still in use
            while gate.status() != HookStatus::Removed {
                std::thread::yield_now();
            }
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(backend.release_count(target_a as usize), 0);

            drop(call);
            assert!(remover.join().unwrap());
        });

        assert_eq!(backend.release_count(target_a as usize), 1);
        assert_eq!(gate.enter().forward_target(), target_a as usize);
    }

    #[test]
    fn test_stuck_call_leaks_trampoline() {
        let backend = RecordingBackend::new();
        let memory = Arc::new(MemorySafetyManager::new(SafetyConfig::default()));
        let config = HookConfig {
            drain_timeout_ms: 5,
            ..Default::default()
        };
        let mgr = HookSafetyManager::new(memory, config, Box::new(backend.clone()));
        let mut info = info_for(target_a, "A");
        let gate = unsafe { mgr.install_hook(&mut info) }.unwrap();

        let _stuck = gate.enter();
        assert!(mgr.remove_hook(&mut info).unwrap());
        assert_eq!(info.status, HookStatus::Removed);
        assert!(!backend.is_patched(target_a as usize));
        assert_eq!(backend.release_count(target_a as usize), 0);
    }
}
