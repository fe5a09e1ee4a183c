// This module defines the TargetInfo descriptor: the immutable per-architecture facts
// that the rest of the back end consumes. Each descriptor records the target's name and
// LLVM triple, the native word size, the stack-pointer register name used by the
// read_register intrinsic, the number of callee-save registers threaded through the
// calling convention, whether the target supports PC-relative addressing (targets
// without it carry an explicit base-pointer argument), the per-runtime-register stack
// offsets (non-zero means the register lives in the stack frame rather than a machine
// register), and the frame offsets of the runtime's call-gc and raise-overflow entry
// thunks. Static instances exist for x86-64 and aarch64; lookup is by name with the
// host architecture as the default. A descriptor is selected once and held for the
// lifetime of a translation context; switching targets means constructing a fresh
// context around a different descriptor.

//! Immutable target-architecture descriptors.

use crate::regs::NUM_REGS;

/// Supported target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

/// Facts about a target architecture and how the runtime's machine model
/// is mapped onto it.
#[derive(Debug)]
pub struct TargetInfo {
    /// Target name; agrees with LLVM's architecture naming.
    pub name: &'static str,
    pub arch: Arch,
    /// Assembly name of the stack pointer, for the read_register intrinsic.
    pub sp_name: &'static str,
    /// Size in bytes of a native word (and of a uniform runtime value).
    pub word_sz_b: u32,
    /// Number of registers used for callee-save values.
    pub num_callee_saves: u32,
    /// True if the target supports PC-relative addressing; targets without
    /// it must thread a base pointer to recover absolute code addresses.
    pub has_pc_rel: bool,
    /// Byte offset from the stack pointer to each runtime register's frame
    /// slot. Non-zero only for registers that are not machine-resident.
    pub stk_offset: [i32; NUM_REGS],
    /// Stack offset of the call-gc entry thunk.
    pub call_gc_offset: i32,
    /// Stack offset of the raise-overflow entry thunk.
    pub raise_ovflw_offset: i32,
    /// Byte size of the allocation slop guaranteed past the heap limit.
    pub alloc_slop_szb: u32,
}

/// On x86-64 the store, exception-handler, and var registers are spilled to
/// fixed slots in the runtime's stack frame; allocation and limit pointers
/// stay in machine registers.
static X86_64: TargetInfo = TargetInfo {
    name: "x86_64",
    arch: Arch::X86_64,
    sp_name: "rsp",
    word_sz_b: 8,
    num_callee_saves: 3,
    has_pc_rel: true,
    stk_offset: [0, 0, 40, 48, 56],
    call_gc_offset: 24,
    raise_ovflw_offset: 32,
    alloc_slop_szb: 1024,
};

/// aarch64 has enough registers to keep every runtime register resident, but
/// its ADR range is too small to rely on for inter-cluster label arithmetic,
/// so it threads the base pointer.
static AARCH64: TargetInfo = TargetInfo {
    name: "aarch64",
    arch: Arch::Aarch64,
    sp_name: "sp",
    word_sz_b: 8,
    num_callee_saves: 3,
    has_pc_rel: false,
    stk_offset: [0, 0, 0, 0, 0],
    call_gc_offset: 24,
    raise_ovflw_offset: 32,
    alloc_slop_szb: 1024,
};

static ALL_TARGETS: [&TargetInfo; 2] = [&X86_64, &AARCH64];

impl TargetInfo {
    /// Look up the descriptor for a target by name.
    pub fn for_name(name: &str) -> Option<&'static TargetInfo> {
        ALL_TARGETS.iter().copied().find(|t| t.name == name)
    }

    /// The descriptor for the host architecture.
    pub fn native() -> &'static TargetInfo {
        if cfg!(target_arch = "aarch64") {
            &AARCH64
        } else {
            &X86_64
        }
    }

    /// Names of all supported targets.
    pub fn names() -> Vec<&'static str> {
        ALL_TARGETS.iter().map(|t| t.name).collect()
    }

    /// The LLVM triple for this target on the host operating system.
    pub fn triple_name(&self) -> String {
        let os = if cfg!(target_os = "macos") {
            "apple-darwin"
        } else {
            "unknown-linux-gnu"
        };
        format!("{}-{}", self.name, os)
    }

    pub fn word_sz_bits(&self) -> u32 {
        8 * self.word_sz_b
    }

    pub fn is_64_bit(&self) -> bool {
        self.word_sz_b == 8
    }

    /// GC roots are std-link, std-clos, std-cont, callee saves, and std-arg.
    pub fn num_gc_roots(&self) -> u32 {
        self.num_callee_saves + 4
    }

    /// Round a byte count up to the next multiple of the word size.
    pub fn round_to_word_sz(&self, n_bytes: u64) -> u64 {
        let mask = u64::from(self.word_sz_b) - 1;
        (n_bytes + mask) & !mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let t = TargetInfo::for_name("x86_64").unwrap();
        assert_eq!(t.word_sz_b, 8);
        assert!(t.has_pc_rel);
        let t = TargetInfo::for_name("aarch64").unwrap();
        assert!(!t.has_pc_rel);
    }

    #[test]
    fn unknown_target_is_none() {
        assert!(TargetInfo::for_name("vax").is_none());
        assert!(TargetInfo::for_name("").is_none());
    }

    #[test]
    fn native_is_listed() {
        let native = TargetInfo::native();
        assert!(TargetInfo::names().contains(&native.name));
    }

    #[test]
    fn word_rounding() {
        let t = TargetInfo::for_name("x86_64").unwrap();
        assert_eq!(t.round_to_word_sz(0), 0);
        assert_eq!(t.round_to_word_sz(1), 8);
        assert_eq!(t.round_to_word_sz(8), 8);
        assert_eq!(t.round_to_word_sz(17), 24);
    }
}
