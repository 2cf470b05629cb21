//! Recording detour backend
//!
//! Patches nothing. Hands out fake trampoline addresses and records every
//! call so hook lifecycles can be checked without touching code pages.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::detour::{DetourBackend, HookError};

/// A call made on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCall {
    Patch { target: usize, detour: usize },
    Unpatch(usize),
    Release(usize),
}

#[derive(Default)]
struct State {
    calls: Vec<BackendCall>,
    patched: HashMap<usize, usize>,
    released: HashMap<usize, u32>,
    fail_next_patch: bool,
    next_trampoline: usize,
}

/// Backend that only records; clones share their log
#[derive(Clone, Default)]
pub struct RecordingBackend {
    state: Arc<Mutex<State>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `patch` fail
    pub fn fail_next_patch(&self) {
        self.state.lock().fail_next_patch = true;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn is_patched(&self, target: usize) -> bool {
        self.state.lock().patched.contains_key(&target)
    }

    /// Trampoline releases seen for `target`
    pub fn release_count(&self, target: usize) -> u32 {
        self.state.lock().released.get(&target).copied().unwrap_or(0)
    }
}

impl DetourBackend for RecordingBackend {
    unsafe fn patch(&mut self, target: usize, detour: usize) -> Result<usize, HookError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Patch { target, detour });
        if std::mem::take(&mut state.fail_next_patch) {
            return Err(HookError::RelocationFailed("injected failure".to_string()));
        }
        if state.patched.contains_key(&target) {
            return Err(HookError::AlreadyPatched(target));
        }
        state.next_trampoline += 0x100;
        let trampoline = 0x7000_0000 + state.next_trampoline;
        state.patched.insert(target, trampoline);
        Ok(trampoline)
    }

    unsafe fn unpatch(&mut self, target: usize) -> Result<(), HookError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Unpatch(target));
        state
            .patched
            .remove(&target)
            .map(|_| ())
            .ok_or(HookError::NotPatched(target))
    }

    fn release_trampoline(&mut self, target: usize) -> bool {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Release(target));
        *state.released.entry(target).or_insert(0) += 1;
        true
    }
}
