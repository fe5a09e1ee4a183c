// This module tracks the special runtime registers of the abstract machine (allocation
// pointer, heap-limit pointer, store-list pointer, exception handler, var pointer) and
// their mapping onto the current target. CmRegInfo describes one register: either
// machine-resident, in which case it occupies a parameter slot in the calling
// convention and is threaded through every call, or memory-resident, in which case it
// lives at a fixed stack offset and is loaded/stored explicitly. CmRegs builds the
// per-target table from the TargetInfo stack-offset array and records which registers
// must be passed as extra call arguments. CmRegState is the mutable per-scope state: a
// fixed table from register id to its current LLVM value (None for memory-resident
// registers) plus the base-pointer value used for position-independent label
// arithmetic. The state is snapshotted and restored around fragment boundaries; the
// base pointer is invariant within a cluster and is deliberately not copied.

//! Runtime-register convention state.

use inkwell::values::{BasicValueEnum, IntValue};

use crate::target::TargetInfo;

/// The special runtime registers that are threaded through the environment
/// and through function calls as extra parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmRegId {
    /// Allocation pointer.
    AllocPtr = 0,
    /// Heap-limit pointer.
    LimitPtr,
    /// Points to the list of store records.
    StorePtr,
    /// Current exception handler.
    ExnHndlr,
    /// The var_ptr register.
    VarPtr,
}

/// Number of special runtime registers.
pub const NUM_REGS: usize = 5;

static REG_NAMES: [&str; NUM_REGS] = ["allocPtr", "limitPtr", "storePtr", "exnPtr", "varPtr"];

static REG_IDS: [CmRegId; NUM_REGS] = [
    CmRegId::AllocPtr,
    CmRegId::LimitPtr,
    CmRegId::StorePtr,
    CmRegId::ExnHndlr,
    CmRegId::VarPtr,
];

impl CmRegId {
    pub fn name(self) -> &'static str {
        REG_NAMES[self as usize]
    }

    pub fn all() -> &'static [CmRegId; NUM_REGS] {
        &REG_IDS
    }
}

/// Placement of one runtime register on the current target.
#[derive(Debug, Clone, Copy)]
pub struct CmRegInfo {
    id: CmRegId,
    /// Parameter index in the calling convention for machine-resident
    /// registers; None for memory-resident registers.
    idx: Option<usize>,
    /// Stack offset of the frame slot for memory-resident registers.
    offset: i32,
}

impl CmRegInfo {
    fn machine_reg(id: CmRegId, idx: usize) -> Self {
        CmRegInfo {
            id,
            idx: Some(idx),
            offset: 0,
        }
    }

    fn stack_reg(id: CmRegId, offset: i32) -> Self {
        CmRegInfo {
            id,
            idx: None,
            offset,
        }
    }

    pub fn id(&self) -> CmRegId {
        self.id
    }

    pub fn index(&self) -> Option<usize> {
        self.idx
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    pub fn is_machine_reg(&self) -> bool {
        self.idx.is_some()
    }

    pub fn is_mem_reg(&self) -> bool {
        self.idx.is_none()
    }
}

/// Collective information about the runtime registers for one target.
#[derive(Debug)]
pub struct CmRegs {
    uses_base_ptr: bool,
    info: [CmRegInfo; NUM_REGS],
    /// The registers that are mapped to machine registers and are therefore
    /// passed as extra arguments, in parameter order.
    hw_regs: Vec<CmRegInfo>,
}

impl CmRegs {
    /// Set up the register information for the given target.
    pub fn new(target: &TargetInfo) -> Self {
        let mut hw_regs = Vec::with_capacity(NUM_REGS);
        let mut next_idx = 0;
        let info = core::array::from_fn(|i| {
            let id = REG_IDS[i];
            if target.stk_offset[i] != 0 {
                CmRegInfo::stack_reg(id, target.stk_offset[i])
            } else {
                let info = CmRegInfo::machine_reg(id, next_idx);
                next_idx += 1;
                info
            }
        });
        for r in info.iter().filter(|r| r.is_machine_reg()) {
            hw_regs.push(*r);
        }
        CmRegs {
            uses_base_ptr: !target.has_pc_rel,
            info,
            hw_regs,
        }
    }

    /// Does the target require the base-address register?
    pub fn uses_base_ptr(&self) -> bool {
        self.uses_base_ptr
    }

    pub fn info(&self, id: CmRegId) -> &CmRegInfo {
        &self.info[id as usize]
    }

    /// The number of runtime registers that are machine-resident and must be
    /// passed as extra arguments.
    pub fn num_machine_regs(&self) -> usize {
        self.hw_regs.len()
    }

    pub fn machine_reg(&self, idx: usize) -> &CmRegInfo {
        &self.hw_regs[idx]
    }

    pub fn machine_regs(&self) -> &[CmRegInfo] {
        &self.hw_regs
    }
}

/// The current mapping from runtime registers to LLVM values.
///
/// `None` means the register is memory-resident and must be accessed through
/// its frame slot.
#[derive(Debug, Clone, Default)]
pub struct CmRegState<'ctx> {
    /// Base address of the current cluster's entry; used for computing
    /// position-independent labels. Invariant within a cluster.
    base_ptr: Option<IntValue<'ctx>>,
    vals: [Option<BasicValueEnum<'ctx>>; NUM_REGS],
}

impl<'ctx> CmRegState<'ctx> {
    pub fn new() -> Self {
        CmRegState {
            base_ptr: None,
            vals: [None; NUM_REGS],
        }
    }

    pub fn get(&self, r: CmRegId) -> Option<BasicValueEnum<'ctx>> {
        self.vals[r as usize]
    }

    pub fn set(&mut self, r: CmRegId, v: BasicValueEnum<'ctx>) {
        self.vals[r as usize] = Some(v);
    }

    pub fn base_ptr(&self) -> Option<IntValue<'ctx>> {
        self.base_ptr
    }

    pub fn set_base_ptr(&mut self, v: IntValue<'ctx>) {
        self.base_ptr = Some(v);
    }

    /// Copy the register values from a snapshot. The base pointer is not
    /// copied; it is invariant for the lifetime of the cluster.
    pub fn copy_from(&mut self, cache: &CmRegState<'ctx>) {
        self.vals = cache.vals;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;
    use inkwell::values::BasicValue;

    #[test]
    fn machine_and_mem_split_follows_target() {
        let regs = CmRegs::new(crate::target::TargetInfo::for_name("x86_64").unwrap());
        assert_eq!(regs.num_machine_regs(), 2);
        assert!(regs.info(CmRegId::AllocPtr).is_machine_reg());
        assert!(regs.info(CmRegId::LimitPtr).is_machine_reg());
        assert!(regs.info(CmRegId::StorePtr).is_mem_reg());
        assert_eq!(regs.info(CmRegId::StorePtr).offset(), 40);

        let regs = CmRegs::new(crate::target::TargetInfo::for_name("aarch64").unwrap());
        assert_eq!(regs.num_machine_regs(), NUM_REGS);
        assert!(regs.uses_base_ptr());
    }

    #[test]
    fn machine_reg_indices_are_dense() {
        let regs = CmRegs::new(crate::target::TargetInfo::for_name("x86_64").unwrap());
        for (i, r) in regs.machine_regs().iter().enumerate() {
            assert_eq!(r.index(), Some(i));
        }
    }

    #[test]
    fn save_restore_round_trip() {
        let llvm = Context::create();
        let i64_ty = llvm.i64_type();

        let mut state = CmRegState::new();
        let a = i64_ty.const_int(1, false).as_basic_value_enum();
        let b = i64_ty.const_int(2, false).as_basic_value_enum();
        state.set(CmRegId::AllocPtr, a);
        state.set(CmRegId::LimitPtr, b);

        let mut snapshot = CmRegState::new();
        snapshot.copy_from(&state);

        state.set(CmRegId::AllocPtr, b);
        state.set(CmRegId::VarPtr, a);

        state.copy_from(&snapshot);
        assert_eq!(state.get(CmRegId::AllocPtr), Some(a));
        assert_eq!(state.get(CmRegId::LimitPtr), Some(b));
        assert_eq!(state.get(CmRegId::VarPtr), None);
        assert_eq!(state.get(CmRegId::StorePtr), None);
    }
}
