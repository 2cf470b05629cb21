//! Inline detours for x86-64
//!
//! The first instructions of the target are decoded with iced-x86 until they
//! cover a 14-byte absolute jump. Those instructions are re-encoded into a
//! trampoline near the target (fixing up RIP-relative operands and
//! branches), followed by a jump back to the first untouched instruction.
//! The target entry is then overwritten with `jmp [rip+0]; dq detour`.

use std::collections::HashMap;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use super::trampoline::Trampoline;

/// `jmp qword ptr [rip+0]` followed by the 8-byte destination
pub const JMP_ABS_LEN: usize = 14;

/// Bytes read from the target when decoding the prologue
const MAX_PROLOGUE: usize = 32;

/// Error type for hook operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Memory protection failed: {0}")]
    MemoryProtection(String),

    #[error("Invalid address: {0:x}")]
    InvalidAddress(usize),

    #[error("Target {0:x} is already patched")]
    AlreadyPatched(usize),

    #[error("Target {0:x} is not patched")]
    NotPatched(usize),

    #[error("No trampoline memory near {0:x}")]
    TrampolineAllocation(usize),

    #[error("Instruction relocation failed: {0}")]
    RelocationFailed(String),
}

/// Places and removes the machine-code patch behind a hook
///
/// The manager drives a backend through `patch`, `unpatch` and
/// `release_trampoline`, strictly in that order per target.
pub trait DetourBackend: Send {
    /// Redirect `target` to `detour` and return the address that runs the
    /// original code
    ///
    /// # Safety
    /// `target` must be the entry of a function and `detour` a function with
    /// a compatible signature.
    unsafe fn patch(&mut self, target: usize, detour: usize) -> Result<usize, HookError>;

    /// Restore the original bytes at `target`; the trampoline stays alive
    ///
    /// # Safety
    /// No thread may be executing the patched bytes.
    unsafe fn unpatch(&mut self, target: usize) -> Result<(), HookError>;

    /// Free the trampoline of an unpatched target
    fn release_trampoline(&mut self, target: usize) -> bool;
}

/// Encode `jmp [rip+0]; dq destination`
pub fn encode_abs_jump(destination: u64) -> [u8; JMP_ABS_LEN] {
    let mut out = [0u8; JMP_ABS_LEN];
    out[0] = 0xFF;
    out[1] = 0x25;
    out[6..].copy_from_slice(&destination.to_le_bytes());
    out
}

/// A prologue re-encoded for a new address
#[derive(Debug)]
pub struct RelocatedPrologue {
    /// Bytes taken from the target
    pub stolen: usize,
    /// Relocated instructions plus the jump back
    pub code: Vec<u8>,
}

/// Relocate enough whole instructions of `code` (located at `ip`) to cover
/// an absolute jump, for execution at `new_ip`
pub fn relocate_prologue(code: &[u8], ip: u64, new_ip: u64) -> Result<RelocatedPrologue, HookError> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut stolen = 0usize;

    while stolen < JMP_ABS_LEN {
        if !decoder.can_decode() {
            return Err(HookError::RelocationFailed(format!(
                "prologue at {ip:x} shorter than {JMP_ABS_LEN} bytes"
            )));
        }
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(HookError::RelocationFailed(format!(
                "invalid instruction at {:x}",
                instr.ip()
            )));
        }
        stolen += instr.len();
        let ends_function = matches!(
            instr.flow_control(),
            FlowControl::Return | FlowControl::Interrupt
        );
        instructions.push(instr);
        if ends_function && stolen < JMP_ABS_LEN {
            return Err(HookError::RelocationFailed(format!(
                "function at {ip:x} ends after {stolen} bytes"
            )));
        }
    }

    let block = InstructionBlock::new(&instructions, new_ip);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map_err(|e| HookError::RelocationFailed(e.to_string()))?;

    let mut relocated = encoded.code_buffer;
    relocated.extend_from_slice(&encode_abs_jump(ip + stolen as u64));

    Ok(RelocatedPrologue {
        stolen,
        code: relocated,
    })
}

struct Patch {
    saved: Vec<u8>,
    trampoline: Trampoline,
    patched: bool,
}

/// Production backend patching live code
#[derive(Default)]
pub struct InlineBackend {
    patches: HashMap<usize, Patch>,
}

impl InlineBackend {
    pub fn new() -> Self {
        Self::default()
    }

    unsafe fn write_code(target: usize, bytes: &[u8]) -> Result<(), HookError> {
        let _guard = region::protect_with_handle(
            target as *const u8,
            bytes.len(),
            region::Protection::READ_WRITE_EXECUTE,
        )
        .map_err(|e| HookError::MemoryProtection(e.to_string()))?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), target as *mut u8, bytes.len());
        Ok(())
    }
}

impl DetourBackend for InlineBackend {
    unsafe fn patch(&mut self, target: usize, detour: usize) -> Result<usize, HookError> {
        if target == 0 {
            return Err(HookError::InvalidAddress(target));
        }
        if self.patches.contains_key(&target) {
            return Err(HookError::AlreadyPatched(target));
        }

        let prologue = std::slice::from_raw_parts(target as *const u8, MAX_PROLOGUE);
        let mut trampoline =
            Trampoline::alloc_near(target).ok_or(HookError::TrampolineAllocation(target))?;
        let relocated = relocate_prologue(prologue, target as u64, trampoline.address() as u64)?;
        if !trampoline.write(&relocated.code) {
            return Err(HookError::RelocationFailed(format!(
                "relocated prologue is {} bytes, slot holds {}",
                relocated.code.len(),
                trampoline.capacity()
            )));
        }

        let saved = prologue[..relocated.stolen].to_vec();
        let mut entry = vec![0xCC; relocated.stolen];
        entry[..JMP_ABS_LEN].copy_from_slice(&encode_abs_jump(detour as u64));
        Self::write_code(target, &entry)?;

        tracing::debug!(
            target: "vrshim::hooks",
            "Patched {:x} -> {:x} ({} bytes relocated to {:x})",
            target,
            detour,
            relocated.stolen,
            trampoline.address()
        );

        let address = trampoline.address();
        self.patches.insert(
            target,
            Patch {
                saved,
                trampoline,
                patched: true,
            },
        );
        Ok(address)
    }

    unsafe fn unpatch(&mut self, target: usize) -> Result<(), HookError> {
        let patch = self
            .patches
            .get_mut(&target)
            .filter(|p| p.patched)
            .ok_or(HookError::NotPatched(target))?;
        Self::write_code(target, &patch.saved)?;
        patch.patched = false;
        tracing::debug!(target: "vrshim::hooks", "Restored {} bytes at {:x}", patch.saved.len(), target);
        Ok(())
    }

    fn release_trampoline(&mut self, target: usize) -> bool {
        match self.patches.get(&target) {
            Some(patch) if patch.patched => {
                tracing::error!(
                    target: "vrshim::hooks",
                    "Refusing to free trampoline {:x} while {:x} is patched",
                    patch.trampoline.address(),
                    target
                );
                false
            }
            Some(_) => self.patches.remove(&target).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_abs_jump() {
        let bytes = encode_abs_jump(0x1122_3344_5566_7788);
        assert_eq!(&bytes[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(&bytes[6..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn test_relocate_rip_relative_prologue() {
        let code = [
            0x48, 0x89, 0x5C, 0x24, 0x08, // mov [rsp+8], rbx
            0x57, // push rdi
            0x48, 0x83, 0xEC, 0x20, // sub rsp, 0x20
            0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00, // mov rax, [rip+0x10]
            0xC3, // ret
        ];
        let relocated = relocate_prologue(&code, 0x1000, 0x2000).unwrap();

        assert_eq!(relocated.stolen, 17);
        assert_eq!(&relocated.code[..10], &code[..10]);

        let mut decoder = Decoder::with_ip(64, &relocated.code, 0x2000, DecoderOptions::NONE);
        let instrs: Vec<Instruction> = (0..4).map(|_| decoder.decode()).collect();
        assert!(instrs[3].is_ip_rel_memory_operand());
        assert_eq!(instrs[3].ip_rel_memory_address(), 0x1000 + 17 + 0x10);

        let tail = &relocated.code[relocated.code.len() - JMP_ABS_LEN..];
        assert_eq!(tail, &encode_abs_jump(0x1000 + 17));
    }

    #[test]
    fn test_relocate_short_branch_far_away() {
        let mut code = vec![0x74, 0x10]; // je +0x10
        code.extend_from_slice(&[0x90; 14]);
        let relocated = relocate_prologue(&code, 0x1000, 0x4000_0000).unwrap();

        let mut decoder = Decoder::with_ip(64, &relocated.code, 0x4000_0000, DecoderOptions::NONE);
        let branch = decoder.decode();
        assert_eq!(branch.near_branch_target(), 0x1012);
    }

    #[test]
    fn test_rejects_short_function() {
        let code = [0x31, 0xC0, 0xC3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC];
        assert!(matches!(
            relocate_prologue(&code, 0x1000, 0x2000),
            Err(HookError::RelocationFailed(_))
        ));
    }

    #[test]
    fn test_release_requires_unpatch() {
        let mut backend = InlineBackend::new();
        assert!(!backend.release_trampoline(0x1000));
        assert!(matches!(
            unsafe { backend.unpatch(0x1000) },
            Err(HookError::NotPatched(0x1000))
        ));
    }
}
