//! Memory safety checks
//!
//! Every pointer that crosses from the game into the core passes through
//! [`MemorySafetyManager`] before it is dereferenced. Checks fail closed: an
//! unknown page, a failed query or a partially covered range all answer
//! `false`.
//!
//! Protection comes from the `region` crate (VirtualQuery on Windows,
//! `/proc/self/maps` on Linux). Ranges registered through
//! [`MemorySafetyManager::register_memory_region`] skip the query when they
//! fully cover the request and grant the access.

use std::collections::{BTreeMap, HashMap, HashSet};

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default upper bound for a single checked access (1 MiB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

bitflags! {
    /// Access kinds a region grants
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
    }
}

impl Access {
    fn from_region(region: &region::Region) -> Self {
        let mut access = Access::empty();
        if region.is_readable() {
            access |= Access::READ;
        }
        if region.is_writable() {
            access |= Access::WRITE;
        }
        if region.is_executable() {
            access |= Access::EXECUTE;
        }
        access
    }
}

/// A caller-registered range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub address: usize,
    pub size: usize,
    pub access: Access,
    pub description: String,
}

impl MemoryRegion {
    fn end(&self) -> usize {
        self.address + self.size
    }

    fn covers(&self, address: usize, size: usize) -> bool {
        address >= self.address && address + size <= self.end()
    }
}

/// Memory check settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Query page state. When off only null/size checks apply.
    pub enable_memory_validation: bool,
    /// Largest single access that will be approved
    pub max_buffer_size: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enable_memory_validation: true,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

#[derive(Debug)]
struct AllocationInfo {
    size: usize,
    source: String,
}

#[derive(Default)]
struct SafetyState {
    regions: BTreeMap<usize, MemoryRegion>,
    allocations: HashMap<usize, AllocationInfo>,
    total_allocated: usize,
    reported: HashSet<String>,
}

/// Validates foreign pointers before use
pub struct MemorySafetyManager {
    config: SafetyConfig,
    state: Mutex<SafetyState>,
}

impl MemorySafetyManager {
    pub fn new(config: SafetyConfig) -> Self {
        debug!(
            target: "vrshim::memory",
            "Memory safety manager created (validation={}, max_buffer_size={})",
            config.enable_memory_validation,
            config.max_buffer_size
        );
        Self {
            config,
            state: Mutex::new(SafetyState::default()),
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Whether `size` bytes at `ptr` are committed and readable
    pub fn is_safe_to_read(&self, ptr: *const u8, size: usize) -> bool {
        self.check(ptr as usize, size, Access::READ, "read")
    }

    /// Whether `size` bytes at `ptr` are committed and writable
    pub fn is_safe_to_write(&self, ptr: *const u8, size: usize) -> bool {
        self.check(ptr as usize, size, Access::WRITE, "write")
    }

    /// Whether `ptr` lies in executable memory
    pub fn is_safe_to_execute(&self, ptr: *const u8) -> bool {
        self.check(ptr as usize, 1, Access::EXECUTE, "execute")
    }

    fn check(&self, address: usize, size: usize, access: Access, operation: &str) -> bool {
        if address == 0 {
            self.log_memory_violation(operation, "null pointer", address);
            return false;
        }
        if size == 0 {
            self.log_memory_violation(operation, "zero size", address);
            return false;
        }
        if size > self.config.max_buffer_size {
            self.log_memory_violation(operation, "size exceeds max_buffer_size", address);
            return false;
        }
        if address.checked_add(size).is_none() {
            self.log_memory_violation(operation, "range overflows address space", address);
            return false;
        }
        if !self.config.enable_memory_validation {
            return true;
        }

        if self.registered_grants(address, size, access) {
            return true;
        }

        match query_access(address, size) {
            Some(granted) if granted.contains(access) => true,
            Some(_) => {
                self.log_memory_violation(operation, "protection mismatch", address);
                false
            }
            None => {
                self.log_memory_violation(operation, "unmapped or uncommitted", address);
                false
            }
        }
    }

    fn registered_grants(&self, address: usize, size: usize, access: Access) -> bool {
        let state = self.state.lock();
        state
            .regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region.covers(address, size) && region.access.contains(access))
            .unwrap_or(false)
    }

    /// Pre-authorize a range. Returns false for null, empty or overflowing ranges.
    pub fn register_memory_region(
        &self,
        address: usize,
        size: usize,
        access: Access,
        description: &str,
    ) -> bool {
        if address == 0 || size == 0 || address.checked_add(size).is_none() {
            return false;
        }
        let region = MemoryRegion {
            address,
            size,
            access,
            description: description.to_string(),
        };
        debug!(
            target: "vrshim::memory",
            "Registered region '{}' at {:x} (+{:#x}, {:?})",
            description,
            address,
            size,
            access
        );
        self.state.lock().regions.insert(address, region);
        true
    }

    /// Forget a registered region by its base address
    pub fn unregister_memory_region(&self, address: usize) -> bool {
        self.state.lock().regions.remove(&address).is_some()
    }

    /// The registered region containing `ptr`
    pub fn get_memory_region(&self, ptr: *const u8) -> Option<MemoryRegion> {
        let address = ptr as usize;
        let state = self.state.lock();
        state
            .regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| address < region.end())
            .cloned()
    }

    /// Record an allocation made on behalf of the pipeline
    pub fn track_allocation(&self, ptr: *const u8, size: usize, source: &str) {
        if ptr.is_null() {
            return;
        }
        let mut state = self.state.lock();
        let previous = state.allocations.insert(
            ptr as usize,
            AllocationInfo {
                size,
                source: source.to_string(),
            },
        );
        if let Some(previous) = previous {
            state.total_allocated -= previous.size;
        }
        state.total_allocated += size;
    }

    /// Drop an allocation record. Returns false if `ptr` was not tracked.
    pub fn track_deallocation(&self, ptr: *const u8) -> bool {
        let mut state = self.state.lock();
        match state.allocations.remove(&(ptr as usize)) {
            Some(info) => {
                state.total_allocated -= info.size;
                true
            }
            None => {
                drop(state);
                self.log_memory_violation("free", "untracked allocation", ptr as usize);
                false
            }
        }
    }

    pub fn total_allocated(&self) -> usize {
        self.state.lock().total_allocated
    }

    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Warn once per (operation, reason); later hits only reach debug
    pub fn log_memory_violation(&self, operation: &str, reason: &str, address: usize) {
        let signature = format!("{operation}:{reason}");
        let first = self.state.lock().reported.insert(signature);
        if first {
            warn!(
                target: "vrshim::memory",
                "Memory violation: {} at {:x} rejected ({})",
                operation,
                address,
                reason
            );
        } else {
            debug!(target: "vrshim::memory", "{} at {:x} rejected ({})", operation, address, reason);
        }
    }

    /// Number of distinct violations reported so far
    pub fn violation_count(&self) -> usize {
        self.state.lock().reported.len()
    }
}

impl Default for MemorySafetyManager {
    fn default() -> Self {
        Self::new(SafetyConfig::default())
    }
}

impl Drop for MemorySafetyManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.allocations.is_empty() {
            warn!(
                target: "vrshim::memory",
                "{} tracked allocations ({} bytes) outstanding at teardown",
                state.allocations.len(),
                state.total_allocated
            );
            for (ptr, info) in &state.allocations {
                debug!(target: "vrshim::memory", "  {:x}: {} bytes from {}", ptr, info.size, info.source);
            }
        }
    }
}

/// Access granted to the whole range, or None if any byte is not committed
fn query_access(address: usize, size: usize) -> Option<Access> {
    let end = address + size;
    let regions = region::query_range(address as *const u8, size).ok()?;

    let mut next = address;
    let mut granted = Access::all();
    for region in regions {
        let region = region.ok()?;
        let range = region.as_range();
        if range.start > next || !region.is_committed() || region.is_guarded() {
            return None;
        }
        granted &= Access::from_region(&region);
        next = range.end;
        if next >= end {
            return Some(granted);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MemorySafetyManager {
        MemorySafetyManager::new(SafetyConfig::default())
    }

    #[test]
    fn test_rejects_null_zero_and_oversize() {
        let mgr = manager();
        let data = [0u8; 16];

        assert!(!mgr.is_safe_to_read(std::ptr::null(), 4));
        assert!(!mgr.is_safe_to_read(data.as_ptr(), 0));
        assert!(!mgr.is_safe_to_read(data.as_ptr(), DEFAULT_MAX_BUFFER_SIZE + 1));
        assert!(!mgr.is_safe_to_write(data.as_ptr(), DEFAULT_MAX_BUFFER_SIZE + 1));
        assert!(!mgr.is_safe_to_execute(std::ptr::null()));
    }

    #[test]
    fn test_heap_is_readable_and_writable() {
        let mgr = manager();
        let data = vec![0u8; 256];
        assert!(mgr.is_safe_to_read(data.as_ptr(), data.len()));
        assert!(mgr.is_safe_to_write(data.as_ptr(), data.len()));
    }

    #[test]
    fn test_code_is_executable_and_heap_is_not() {
        let mgr = manager();
        let code = test_code_is_executable_and_heap_is_not as *const u8;
        assert!(mgr.is_safe_to_execute(code));

        let data = vec![0u8; 64];
        assert!(!mgr.is_safe_to_execute(data.as_ptr()));
    }

    #[test]
    fn test_registered_region_short_circuits() {
        let mgr = MemorySafetyManager::new(SafetyConfig::default());
        // Not mapped in user space on any supported platform
        let fake = 0x10usize;
        assert!(!mgr.is_safe_to_read(fake as *const u8, 8));

        assert!(mgr.register_memory_region(fake, 0x100, Access::READ, "fake"));
        assert!(mgr.is_safe_to_read(fake as *const u8, 8));
        assert!(!mgr.is_safe_to_read((fake + 0xFC) as *const u8, 8));

        let region = mgr.get_memory_region((fake + 4) as *const u8).unwrap();
        assert_eq!(region.description, "fake");

        assert!(mgr.unregister_memory_region(fake));
        assert!(mgr.get_memory_region(fake as *const u8).is_none());
    }

    #[test]
    fn test_validation_disabled_only_checks_shape() {
        let mgr = MemorySafetyManager::new(SafetyConfig {
            enable_memory_validation: false,
            ..Default::default()
        });
        assert!(mgr.is_safe_to_read(0x10 as *const u8, 8));
        assert!(!mgr.is_safe_to_read(std::ptr::null(), 8));
        assert!(!mgr.is_safe_to_read(0x10 as *const u8, DEFAULT_MAX_BUFFER_SIZE + 1));
    }

    #[test]
    fn test_violations_logged_once_per_signature() {
        let mgr = manager();
        mgr.is_safe_to_read(std::ptr::null(), 4);
        mgr.is_safe_to_read(std::ptr::null(), 4);
        assert_eq!(mgr.violation_count(), 1);
        mgr.is_safe_to_write(std::ptr::null(), 4);
        assert_eq!(mgr.violation_count(), 2);

        // Distinct bad addresses share one signature
        for address in [0x10usize, 0x20, 0x30] {
            mgr.is_safe_to_read(address as *const u8, 8);
        }
        assert_eq!(mgr.violation_count(), 3);
    }

    #[test]
    fn test_allocation_tracking() {
        let mgr = manager();
        let a = vec![0u8; 32];
        let b = vec![0u8; 64];

        mgr.track_allocation(a.as_ptr(), 32, "staging");
        mgr.track_allocation(b.as_ptr(), 64, "eye target");
        assert_eq!(mgr.total_allocated(), 96);
        assert_eq!(mgr.allocation_count(), 2);

        assert!(mgr.track_deallocation(a.as_ptr()));
        assert_eq!(mgr.total_allocated(), 64);
        assert!(!mgr.track_deallocation(a.as_ptr()));

        assert!(mgr.track_deallocation(b.as_ptr()));
        assert_eq!(mgr.total_allocated(), 0);
    }
}
