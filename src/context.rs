// This module provides the CodegenContext, the single stateful object that CFG-node
// translation is written against. It owns the LLVM module being built (through
// inkwell), the IR builder, the target-machine wrapper, the runtime-register
// convention state, and the three label/lvar maps (unit-scoped label->cluster,
// cluster-scoped label->fragment, fragment-scoped lvar->value). It exposes the full
// vocabulary used by node translation: the mirrored createFnTy/createParamTys/
// createArgs trio that keeps call sites and callee signatures structurally compatible
// under the jump-with-arguments convention, register access that transparently falls
// back to stack slots for memory-resident registers, the uniform-value coercions
// (ml value / object pointer / byte pointer / native int), arithmetic and memory
// shorthands with call-site coercions, record allocation against the allocation
// pointer, the fixed-signature garbage-collector call that rebinds live values, the
// per-cluster shared overflow trap block, and position-independent label arithmetic.
// Invariant violations here (module reuse, missing base pointer) panic; reportable
// failures flow out as CodegenError values.

//! The stateful translation context for CFG code generation.
//!
//! One `CodegenContext` is bound to one target descriptor; switching targets
//! means constructing a fresh context. Only one module may be open at a time.

use hashbrown::HashMap;
use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context as LlvmContext;
use inkwell::intrinsics::Intrinsic;
use inkwell::module::{Linkage, Module};
use inkwell::types::{
    BasicMetadataTypeEnum, BasicTypeEnum, FloatType, FunctionType, IntType, PointerType,
};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValue, BasicValueEnum, CallSiteValue, FunctionValue, IntValue,
    MetadataValue, PhiValue, PointerValue,
};
use inkwell::{AddressSpace, FloatPredicate, IntPredicate};
use log::debug;

use crate::cfg::{ArithOp, Frag, FragKind, LVar};
use crate::code_object::CodeObject;
use crate::error::CodegenResult;
use crate::mcgen::McGen;
use crate::regs::{CmRegId, CmRegState, CmRegs};
use crate::target::TargetInfo;

/// The jump-with-arguments convention used by all generated fragments; it
/// lowers onto LLVM's tailcc so that fragment-to-fragment transfers are
/// guaranteed tail calls.
pub const JWA_CC: u32 = 18;

/// The entry block and parameter PHIs of an internal fragment, recorded
/// before any fragment body is translated so forward references resolve.
#[derive(Debug, Clone)]
pub struct FragInfo<'ctx> {
    pub kind: FragKind,
    pub block: BasicBlock<'ctx>,
    pub phis: Vec<PhiValue<'ctx>>,
}

/// Layout of the "extra" prefix that the calling convention adds to every
/// fragment signature.
#[derive(Debug, Clone, Copy)]
struct ArgInfo {
    /// Machine-resident runtime registers passed as leading arguments.
    n_extra: usize,
    /// 1 if a base-pointer argument is threaded, 0 otherwise.
    base_ptr: usize,
    /// Placeholder slots required by the standard-continuation convention so
    /// that all continuations are call-compatible regardless of arity.
    n_unused: usize,
}

impl ArgInfo {
    fn num_args(&self, n: usize) -> usize {
        n + self.n_extra + self.base_ptr + self.n_unused
    }
}

/// Encapsulates the current state of code generation for one target.
pub struct CodegenContext<'ctx> {
    llvm: &'ctx LlvmContext,
    target: &'static TargetInfo,
    builder: Builder<'ctx>,
    mc_gen: McGen,
    module: Option<Module<'ctx>>,

    regs: CmRegs,
    reg_state: CmRegState<'ctx>,

    cur_fn: Option<FunctionValue<'ctx>>,
    /// Per-module map from labels to cluster entry functions.
    cluster_map: HashMap<LVar, FunctionValue<'ctx>>,
    /// Per-cluster map from labels to fragment entries.
    frag_map: HashMap<LVar, FragInfo<'ctx>>,
    /// Per-fragment map from lvars to values.
    v_map: HashMap<LVar, BasicValueEnum<'ctx>>,

    /// The shared overflow trap block for the current cluster, with one PHI
    /// per threaded machine register.
    overflow_bb: Option<BasicBlock<'ctx>>,
    overflow_phis: Vec<PhiValue<'ctx>>,

    /// Cached intrinsic handles, keyed by name and operand bit width;
    /// populated on first request per module.
    intrinsics: HashMap<(&'static str, u32), FunctionValue<'ctx>>,
    gc_fn_ty: Option<FunctionType<'ctx>>,
    raise_overflow_fn_ty: Option<FunctionType<'ctx>>,
    read_reg: Option<FunctionValue<'ctx>>,
    sp_reg_md: Option<MetadataValue<'ctx>>,

    // cached types
    int_ty: IntType<'ctx>,
    ml_value_ty: PointerType<'ctx>,
    obj_ptr_ty: PointerType<'ctx>,
    byte_ptr_ty: PointerType<'ctx>,
}

impl<'ctx> CodegenContext<'ctx> {
    /// Create a translation context bound to the given target.
    pub fn new(llvm: &'ctx LlvmContext, target: &'static TargetInfo) -> CodegenResult<Self> {
        let mc_gen = McGen::new(target)?;
        let int_ty = llvm.custom_width_int_type(target.word_sz_bits());
        // With opaque pointers the three pointer views share one LLVM type;
        // they are kept distinct here to preserve intent at call sites.
        let ptr = llvm.ptr_type(AddressSpace::default());
        Ok(CodegenContext {
            llvm,
            target,
            builder: llvm.create_builder(),
            mc_gen,
            module: None,
            regs: CmRegs::new(target),
            reg_state: CmRegState::new(),
            cur_fn: None,
            cluster_map: HashMap::new(),
            frag_map: HashMap::new(),
            v_map: HashMap::new(),
            overflow_bb: None,
            overflow_phis: Vec::new(),
            intrinsics: HashMap::new(),
            gc_fn_ty: None,
            raise_overflow_fn_ty: None,
            read_reg: None,
            sp_reg_md: None,
            int_ty,
            ml_value_ty: ptr,
            obj_ptr_ty: ptr,
            byte_ptr_ty: ptr,
        })
    }

    /// Create a translation context for a target selected by name.
    pub fn for_target_name(
        llvm: &'ctx LlvmContext,
        name: &str,
    ) -> CodegenResult<Self> {
        let target = TargetInfo::for_name(name).ok_or_else(|| {
            crate::error::CodegenError::UnknownTarget {
                name: name.to_string(),
            }
        })?;
        Self::new(llvm, target)
    }

    /* ===== lifecycle ===== */

    /// Initialize the context for a new module.
    ///
    /// Panics if a module is already open: modules are not reentrant.
    pub fn begin_module(&mut self, src: &str, n_clusters: usize) {
        assert!(self.module.is_none(), "module already open");
        let module = self.llvm.create_module(src);
        self.mc_gen.begin_module(&module);
        self.module = Some(module);
        self.cluster_map.clear();
        self.cluster_map.reserve(n_clusters);
    }

    /// Finish code generation for the module.
    pub fn complete_module(&mut self) {
        debug!(
            "completed module with {} clusters",
            self.cluster_map.len()
        );
    }

    /// Release the module and all per-module caches.
    pub fn end_module(&mut self) {
        self.module = None;
        self.cur_fn = None;
        self.cluster_map.clear();
        self.frag_map.clear();
        self.v_map.clear();
        self.intrinsics.clear();
        self.gc_fn_ty = None;
        self.raise_overflow_fn_ty = None;
        self.read_reg = None;
        self.sp_reg_md = None;
        self.reg_state = CmRegState::new();
        self.mc_gen.end_module();
    }

    /// Mark the beginning of a cluster: `fun` becomes the current function
    /// and the overflow trap block is reset.
    pub fn begin_cluster(&mut self, fun: FunctionValue<'ctx>) {
        self.cur_fn = Some(fun);
        self.frag_map.clear();
        self.overflow_bb = None;
        self.overflow_phis.clear();
    }

    /// Mark the end of a cluster.
    pub fn end_cluster(&mut self) {
        self.frag_map.clear();
        self.overflow_bb = None;
        self.overflow_phis.clear();
    }

    /// Reset the per-fragment value map.
    pub fn begin_frag(&mut self) {
        self.v_map.clear();
    }

    pub fn module(&self) -> &Module<'ctx> {
        self.module.as_ref().expect("no open module")
    }

    pub fn target_info(&self) -> &'static TargetInfo {
        self.target
    }

    pub fn regs(&self) -> &CmRegs {
        &self.regs
    }

    pub fn builder(&self) -> &Builder<'ctx> {
        &self.builder
    }

    /* ===== target parameters ===== */

    /// Size of a target machine word in bytes.
    pub fn word_sz_in_bytes(&self) -> u32 {
        self.target.word_sz_b
    }

    pub fn is_64_bit(&self) -> bool {
        self.target.is_64_bit()
    }

    /// Round a size in bytes up to the nearest multiple of the word size.
    pub fn round_to_word_sz_in_bytes(&self, nb: u64) -> u64 {
        self.target.round_to_word_sz(nb)
    }

    /* ===== cached types ===== */

    /// The native integer type.
    pub fn int_ty(&self) -> IntType<'ctx> {
        self.int_ty
    }

    /// The uniform runtime value type: a pointer-sized tagged slot.
    pub fn ml_value_ty(&self) -> PointerType<'ctx> {
        self.ml_value_ty
    }

    /// Pointer into the heap (a pointer to a runtime value).
    pub fn obj_ptr_ty(&self) -> PointerType<'ctx> {
        self.obj_ptr_ty
    }

    pub fn byte_ptr_ty(&self) -> PointerType<'ctx> {
        self.byte_ptr_ty
    }

    /// Integer type of the given bit size.
    pub fn i_type(&self, sz: u32) -> IntType<'ctx> {
        match sz {
            64 => self.llvm.i64_type(),
            32 => self.llvm.i32_type(),
            16 => self.llvm.i16_type(),
            _ => self.llvm.i8_type(),
        }
    }

    /// Floating-point type of the given bit size.
    pub fn f_type(&self, sz: u32) -> FloatType<'ctx> {
        if sz == 64 {
            self.llvm.f64_type()
        } else {
            self.llvm.f32_type()
        }
    }

    /* ===== constants ===== */

    /// Signed integer constant of the given bit size.
    pub fn i_const_sz(&self, sz: u32, c: i64) -> IntValue<'ctx> {
        self.i_type(sz).const_int(c as u64, true)
    }

    /// Signed constant of native size.
    pub fn i_const(&self, c: i64) -> IntValue<'ctx> {
        self.int_ty.const_int(c as u64, true)
    }

    /// Unsigned constant of native size.
    pub fn u_const(&self, c: u64) -> IntValue<'ctx> {
        self.int_ty.const_int(c, false)
    }

    pub fn i32_const(&self, n: i32) -> IntValue<'ctx> {
        self.llvm.i32_type().const_int(n as u64, true)
    }

    pub fn u32_const(&self, n: u32) -> IntValue<'ctx> {
        self.llvm.i32_type().const_int(u64::from(n), false)
    }

    /// The runtime's unit value (tagged zero) with the uniform value type.
    pub fn unit_value(&self) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_to_ptr(self.i_const(1), self.ml_value_ty, "unit")
            .unwrap()
            .into()
    }

    /* ===== coercions ===== */

    /// Ensure that a value has the uniform runtime value type.
    pub fn as_ml_value(&self, v: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        if v.is_pointer_value() {
            v
        } else {
            self.builder
                .build_int_to_ptr(v.into_int_value(), self.ml_value_ty, "")
                .unwrap()
                .into()
        }
    }

    /// Ensure that a value is a pointer into the heap.
    pub fn as_obj_ptr(&self, v: BasicValueEnum<'ctx>) -> PointerValue<'ctx> {
        if v.is_pointer_value() {
            v.into_pointer_value()
        } else {
            self.builder
                .build_int_to_ptr(v.into_int_value(), self.obj_ptr_ty, "")
                .unwrap()
        }
    }

    /// Ensure that a value is a byte pointer.
    pub fn as_byte_ptr(&self, v: BasicValueEnum<'ctx>) -> PointerValue<'ctx> {
        if v.is_pointer_value() {
            v.into_pointer_value()
        } else {
            self.builder
                .build_int_to_ptr(v.into_int_value(), self.byte_ptr_ty, "")
                .unwrap()
        }
    }

    /// Ensure that a value is a machine-sized integer. Tag bits are never
    /// masked here; tagged-integer arithmetic must do that explicitly.
    pub fn as_int(&self, v: BasicValueEnum<'ctx>) -> IntValue<'ctx> {
        if v.is_pointer_value() {
            self.builder
                .build_ptr_to_int(v.into_pointer_value(), self.int_ty, "")
                .unwrap()
        } else {
            v.into_int_value()
        }
    }

    /// Ensure that a value is an integer of the given bit size.
    pub fn as_int_sz(&self, sz: u32, v: BasicValueEnum<'ctx>) -> IntValue<'ctx> {
        if v.is_pointer_value() {
            self.builder
                .build_ptr_to_int(v.into_pointer_value(), self.i_type(sz), "")
                .unwrap()
        } else {
            v.into_int_value()
        }
    }

    /// Cast a value to the expected target type; the types are assumed to be
    /// different.
    pub fn cast_ty(
        &self,
        tgt_ty: BasicTypeEnum<'ctx>,
        v: BasicValueEnum<'ctx>,
    ) -> BasicValueEnum<'ctx> {
        match (tgt_ty, v) {
            (BasicTypeEnum::PointerType(pt), BasicValueEnum::IntValue(iv)) => self
                .builder
                .build_int_to_ptr(iv, pt, "")
                .unwrap()
                .into(),
            (BasicTypeEnum::IntType(it), BasicValueEnum::PointerValue(pv)) => self
                .builder
                .build_ptr_to_int(pv, it, "")
                .unwrap()
                .into(),
            (BasicTypeEnum::IntType(it), BasicValueEnum::IntValue(iv)) => {
                let src_bits = iv.get_type().get_bit_width();
                if it.get_bit_width() < src_bits {
                    self.builder.build_int_truncate(iv, it, "").unwrap().into()
                } else {
                    self.builder.build_int_s_extend(iv, it, "").unwrap().into()
                }
            }
            (BasicTypeEnum::FloatType(ft), BasicValueEnum::FloatValue(fv)) => self
                .builder
                .build_float_cast(fv, ft, "")
                .unwrap()
                .into(),
            (_, v) => v,
        }
    }

    /* ===== calling convention ===== */

    fn arg_info(&self, kind: FragKind) -> ArgInfo {
        let base_ptr = match kind {
            FragKind::Internal => 0,
            _ => usize::from(self.regs.uses_base_ptr()),
        };
        let n_unused = if kind == FragKind::StdCont { 2 } else { 0 };
        ArgInfo {
            n_extra: self.regs.num_machine_regs(),
            base_ptr,
            n_unused,
        }
    }

    fn push_extra_param_tys(&self, info: &ArgInfo, tys: &mut Vec<BasicTypeEnum<'ctx>>) {
        for _ in 0..info.n_extra {
            tys.push(self.ml_value_ty.into());
        }
        if info.base_ptr != 0 {
            tys.push(self.int_ty.into());
        }
        for _ in 0..info.n_unused {
            tys.push(self.ml_value_ty.into());
        }
    }

    /// Create a function type from a fragment's declared parameter types,
    /// adding the extra parameters required by the calling convention.
    pub fn create_fn_ty(&self, kind: FragKind, tys: &[BasicTypeEnum<'ctx>]) -> FunctionType<'ctx> {
        let info = self.arg_info(kind);
        let mut param_tys = Vec::with_capacity(info.num_args(tys.len()));
        self.push_extra_param_tys(&info, &mut param_tys);
        param_tys.extend_from_slice(tys);
        let meta: Vec<BasicMetadataTypeEnum> =
            param_tys.iter().map(|t| (*t).into()).collect();
        // fragments never return; control leaves via tail transfer
        self.llvm.void_type().fn_type(&meta, false)
    }

    /// Create a parameter-type vector for a fragment with `n` declared
    /// parameters, initialized with the extra-parameter prefix.
    pub fn create_param_tys(&self, kind: FragKind, n: usize) -> Vec<BasicTypeEnum<'ctx>> {
        let info = self.arg_info(kind);
        let mut tys = Vec::with_capacity(info.num_args(n));
        self.push_extra_param_tys(&info, &mut tys);
        tys
    }

    /// Create an argument vector for a call with `n` declared arguments,
    /// initialized with the current values of the extra parameters.
    pub fn create_args(&mut self, kind: FragKind, n: usize) -> Vec<BasicValueEnum<'ctx>> {
        let info = self.arg_info(kind);
        let mut args = Vec::with_capacity(info.num_args(n));
        let ids: Vec<CmRegId> = self.regs.machine_regs().iter().map(|r| r.id()).collect();
        for id in ids {
            let v = self.ml_reg(id);
            args.push(self.as_ml_value(v));
        }
        if info.base_ptr != 0 {
            let bp = self
                .reg_state
                .base_ptr()
                .expect("no base pointer for current cluster");
            args.push(bp.into());
        }
        for _ in 0..info.n_unused {
            args.push(self.ml_value_ty.get_undef().into());
        }
        args
    }

    /// Define a new function for a cluster. `is_first` marks the entry
    /// function of the module, which is the only one that stays external.
    pub fn new_function(
        &self,
        fn_ty: FunctionType<'ctx>,
        name: &str,
        is_first: bool,
    ) -> FunctionValue<'ctx> {
        let linkage = if is_first {
            None
        } else {
            Some(Linkage::Internal)
        };
        let fun = self.module().add_function(name, fn_ty, linkage);
        fun.set_call_conventions(JWA_CC);
        fun
    }

    /// Set up the entry fragment of a cluster: create the entry block and
    /// bind the machine registers, base pointer, and declared parameters from
    /// the function's parameters.
    pub fn setup_std_entry(&mut self, frag: &Frag) {
        let fun = self.cur_fn.expect("setup_std_entry outside cluster");
        let entry = self.llvm.append_basic_block(fun, "entry");
        self.builder.position_at_end(entry);

        let info = self.arg_info(frag.kind);
        let ids: Vec<CmRegId> = self.regs.machine_regs().iter().map(|r| r.id()).collect();
        for (i, id) in ids.into_iter().enumerate() {
            let p = fun.get_nth_param(i as u32).expect("missing register param");
            p.set_name(id.name());
            self.reg_state.set(id, p);
        }
        let mut idx = info.n_extra;
        if info.base_ptr != 0 {
            let bp = fun
                .get_nth_param(idx as u32)
                .expect("missing base pointer param")
                .into_int_value();
            bp.set_name("basePtr");
            self.reg_state.set_base_ptr(bp);
            idx += 1;
        }
        idx += info.n_unused;
        for p in &frag.params {
            let v = fun
                .get_nth_param(idx as u32)
                .expect("missing declared param");
            self.insert_val(p.lvar, v);
            idx += 1;
        }
    }

    /// Set up an internal fragment's entry: rebind the register state and the
    /// fragment's parameters to the PHIs created during fragment init.
    pub fn setup_frag_entry(&mut self, frag: &Frag) {
        let info = self
            .lookup_frag(frag.lab)
            .expect("fragment not initialized")
            .clone();
        self.builder.position_at_end(info.block);
        let n_extra = self.arg_info(FragKind::Internal).n_extra;
        let ids: Vec<CmRegId> = self.regs.machine_regs().iter().map(|r| r.id()).collect();
        for (i, id) in ids.into_iter().enumerate() {
            self.reg_state.set(id, info.phis[i].as_basic_value());
        }
        for (i, p) in frag.params.iter().enumerate() {
            self.insert_val(p.lvar, info.phis[n_extra + i].as_basic_value());
        }
    }

    /* ===== register access ===== */

    /// Get the value of a runtime register. Machine-resident registers are
    /// zero-cost; memory-resident ones are loaded from their frame slot.
    pub fn ml_reg(&mut self, r: CmRegId) -> BasicValueEnum<'ctx> {
        match self.reg_state.get(r) {
            Some(v) => v,
            None => self.load_mem_reg(r),
        }
    }

    /// Assign a value to a runtime register.
    pub fn set_ml_reg(&mut self, r: CmRegId, v: BasicValueEnum<'ctx>) {
        if self.reg_state.get(r).is_some() {
            self.reg_state.set(r, v);
        } else {
            self.store_mem_reg(r, v);
        }
    }

    /// Snapshot the register state.
    pub fn save_reg_state(&self, cache: &mut CmRegState<'ctx>) {
        cache.copy_from(&self.reg_state);
    }

    /// Restore the register state from a snapshot.
    pub fn restore_reg_state(&mut self, cache: &CmRegState<'ctx>) {
        self.reg_state.copy_from(cache);
    }

    pub fn reg_state(&self) -> &CmRegState<'ctx> {
        &self.reg_state
    }

    /// The base pointer of the current cluster as an integer value.
    pub fn base_ptr(&self) -> IntValue<'ctx> {
        self.reg_state
            .base_ptr()
            .expect("no base pointer for current cluster")
    }

    fn load_mem_reg(&mut self, r: CmRegId) -> BasicValueEnum<'ctx> {
        let info = *self.regs.info(r);
        debug_assert!(info.is_mem_reg(), "loading machine register from memory");
        let addr = self.stk_addr(self.obj_ptr_ty, info.offset());
        self.create_load_aligned(
            self.ml_value_ty.into(),
            addr,
            self.target.word_sz_b,
            info.name(),
        )
    }

    fn store_mem_reg(&mut self, r: CmRegId, v: BasicValueEnum<'ctx>) {
        let info = *self.regs.info(r);
        debug_assert!(info.is_mem_reg(), "storing machine register to memory");
        let addr = self.stk_addr(self.obj_ptr_ty, info.offset());
        let v = self.as_ml_value(v);
        self.create_store(v, addr, self.target.word_sz_b);
    }

    /// Compute an address in the runtime's stack frame.
    pub fn stk_addr(&mut self, ptr_ty: PointerType<'ctx>, offset: i32) -> PointerValue<'ctx> {
        if self.read_reg.is_none() {
            self.init_sp_access();
        }
        let read_reg = self.read_reg.unwrap();
        let md = self.sp_reg_md.unwrap();
        let sp = self
            .builder
            .build_call(read_reg, &[BasicMetadataValueEnum::from(md)], "sp")
            .unwrap()
            .try_as_basic_value()
            .basic()
            .unwrap()
            .into_int_value();
        let addr = self
            .builder
            .build_int_add(sp, self.i_const(i64::from(offset)), "")
            .unwrap();
        self.builder
            .build_int_to_ptr(addr, ptr_ty, "stkAddr")
            .unwrap()
    }

    /// Initialize the metadata needed to read the stack pointer.
    fn init_sp_access(&mut self) {
        let intrinsic =
            Intrinsic::find("llvm.read_register").expect("llvm.read_register not found");
        let read_reg = intrinsic
            .get_declaration(self.module.as_ref().expect("no open module"), &[self
                .int_ty
                .into()])
            .expect("unable to declare llvm.read_register");
        let sp_name = self.llvm.metadata_string(self.target.sp_name);
        let md = self.llvm.metadata_node(&[sp_name.into()]);
        self.read_reg = Some(read_reg);
        self.sp_reg_md = Some(md);
    }

    /* ===== label / lvar maps ===== */

    /// Insert a binding into the label-to-cluster map.
    pub fn insert_cluster(&mut self, lab: LVar, fun: FunctionValue<'ctx>) {
        self.cluster_map.insert(lab, fun);
    }

    /// Look up a binding in the label-to-cluster map.
    pub fn lookup_cluster(&self, lab: LVar) -> Option<FunctionValue<'ctx>> {
        self.cluster_map.get(&lab).copied()
    }

    /// Insert a binding into the label-to-fragment map.
    pub fn insert_frag(&mut self, lab: LVar, info: FragInfo<'ctx>) {
        self.frag_map.insert(lab, info);
    }

    /// Look up a binding in the label-to-fragment map.
    pub fn lookup_frag(&self, lab: LVar) -> Option<&FragInfo<'ctx>> {
        self.frag_map.get(&lab)
    }

    /// Insert a binding into the lvar-to-value map.
    pub fn insert_val(&mut self, lv: LVar, v: BasicValueEnum<'ctx>) {
        self.v_map.insert(lv, v);
    }

    /// Look up a binding in the lvar-to-value map.
    pub fn lookup_val(&self, lv: LVar) -> Option<BasicValueEnum<'ctx>> {
        self.v_map.get(&lv).copied()
    }

    /* ===== blocks and insert point ===== */

    /// Create a fresh basic block in the current function.
    pub fn new_bb(&self, name: &str) -> BasicBlock<'ctx> {
        let fun = self.cur_fn.expect("no current function");
        self.llvm.append_basic_block(fun, name)
    }

    pub fn set_insert_point(&self, bb: BasicBlock<'ctx>) {
        self.builder.position_at_end(bb);
    }

    pub fn cur_fn(&self) -> FunctionValue<'ctx> {
        self.cur_fn.expect("no current function")
    }

    pub fn cur_bb(&self) -> BasicBlock<'ctx> {
        self.builder.get_insert_block().expect("no insert block")
    }

    /* ===== label addressing ===== */

    /// A constant expressing `f1 - f2` for two function labels; remains valid
    /// across relocation into the heap.
    pub fn label_diff(
        &self,
        f1: FunctionValue<'ctx>,
        f2: FunctionValue<'ctx>,
    ) -> IntValue<'ctx> {
        let a1 = f1
            .as_global_value()
            .as_pointer_value()
            .const_to_int(self.int_ty);
        let a2 = f2
            .as_global_value()
            .as_pointer_value()
            .const_to_int(self.int_ty);
        a1.const_sub(a2)
    }

    /// A constant expressing `bb - entry` for a block of the current function.
    pub fn block_diff(&self, bb: BasicBlock<'ctx>) -> IntValue<'ctx> {
        let fun = self.cur_fn();
        let block_addr = unsafe { bb.get_address() }.expect("block has no address");
        let entry = fun
            .as_global_value()
            .as_pointer_value()
            .const_to_int(self.int_ty);
        block_addr.const_to_int(self.int_ty).const_sub(entry)
    }

    /// Evaluate a label to an absolute address with the uniform value type.
    pub fn eval_label(&self, fun: FunctionValue<'ctx>) -> BasicValueEnum<'ctx> {
        if self.target.has_pc_rel {
            fun.as_global_value().as_pointer_value().into()
        } else {
            let diff = self.label_diff(fun, self.cur_fn());
            let addr = self
                .builder
                .build_int_add(self.base_ptr(), diff, "labAddr")
                .unwrap();
            self.builder
                .build_int_to_ptr(addr, self.ml_value_ty, "")
                .unwrap()
                .into()
        }
    }

    /* ===== allocation and GC ===== */

    /// The allocation pointer, 8-byte aligned on 32-bit targets so that the
    /// descriptor lands one word before an aligned object address.
    pub fn aligned_alloc_ptr(&mut self) -> PointerValue<'ctx> {
        let alloc = self.ml_reg(CmRegId::AllocPtr);
        if self.is_64_bit() {
            self.as_obj_ptr(alloc)
        } else {
            let biased = self.create_or(alloc, self.u_const(4).into());
            self.as_obj_ptr(biased)
        }
    }

    /// Allocate a record of uniform values: store the descriptor and fields
    /// through the allocation pointer, bump it, and return the object
    /// pointer. No heap-limit check happens here; those are inserted by
    /// cluster-level translation.
    pub fn alloc_record(
        &mut self,
        desc: BasicValueEnum<'ctx>,
        args: &[BasicValueEnum<'ctx>],
    ) -> BasicValueEnum<'ctx> {
        let alloc = self.aligned_alloc_ptr();
        self.create_store_ml(desc, alloc.into());
        for (i, arg) in args.iter().enumerate() {
            let slot = self.create_gep_const(alloc, (i + 1) as i32);
            self.create_store_ml(*arg, slot.into());
        }
        let obj = self.create_gep_const(alloc, 1);
        let bumped = self.create_gep_const(alloc, (args.len() + 1) as i32);
        self.set_ml_reg(CmRegId::AllocPtr, bumped.into());
        self.as_ml_value(obj.into())
    }

    /// Allocate a record with a known-constant descriptor.
    pub fn alloc_record_const(
        &mut self,
        desc: u64,
        args: &[BasicValueEnum<'ctx>],
    ) -> BasicValueEnum<'ctx> {
        let d = self.u_const(desc).into();
        let d = self.as_ml_value(d);
        self.alloc_record(d, args)
    }

    /// The type of the collection entry point: machine registers plus the GC
    /// roots in, a struct of the same shape out.
    fn gc_fn_ty(&mut self) -> FunctionType<'ctx> {
        if let Some(ty) = self.gc_fn_ty {
            return ty;
        }
        let n = self.regs.num_machine_regs() + self.target.num_gc_roots() as usize;
        let field_tys: Vec<BasicTypeEnum> = (0..n).map(|_| self.ml_value_ty.into()).collect();
        let ret_ty = self.llvm.struct_type(&field_tys, false);
        let meta: Vec<BasicMetadataTypeEnum> = field_tys.iter().map(|t| (*t).into()).collect();
        let ty = ret_ty.fn_type(&meta, false);
        self.gc_fn_ty = Some(ty);
        ty
    }

    /// Call the garbage collector with the given root values and rebind the
    /// lvars in `new_roots` (positionally) to the updated values. This is the
    /// one point where the register and lvar maps are invalidated.
    pub fn call_gc(&mut self, roots: &[BasicValueEnum<'ctx>], new_roots: &[LVar]) {
        assert_eq!(
            roots.len(),
            self.target.num_gc_roots() as usize,
            "GC call must pass exactly the convention's root registers"
        );
        assert!(new_roots.len() <= roots.len());

        let fn_ty = self.gc_fn_ty();
        let addr = self.stk_addr(self.obj_ptr_ty, self.target.call_gc_offset);
        let gc_fn = self
            .create_load_aligned(
                self.byte_ptr_ty.into(),
                addr,
                self.target.word_sz_b,
                "callGCFn",
            )
            .into_pointer_value();

        let ids: Vec<CmRegId> = self.regs.machine_regs().iter().map(|r| r.id()).collect();
        let mut args: Vec<BasicMetadataValueEnum> = Vec::with_capacity(ids.len() + roots.len());
        for id in &ids {
            let v = self.ml_reg(*id);
            args.push(self.as_ml_value(v).into());
        }
        for r in roots {
            args.push(self.as_ml_value(*r).into());
        }

        let call = self
            .builder
            .build_indirect_call(fn_ty, gc_fn, &args, "callGC")
            .unwrap();
        call.set_call_convention(JWA_CC);
        let ret = call
            .try_as_basic_value()
            .basic()
            .expect("GC call must return the root struct")
            .into_struct_value();

        for (i, id) in ids.iter().enumerate() {
            let v = self
                .builder
                .build_extract_value(ret, i as u32, id.name())
                .unwrap();
            self.reg_state.set(*id, v);
        }
        let base = ids.len() as u32;
        for (j, lv) in new_roots.iter().enumerate() {
            let v = self
                .builder
                .build_extract_value(ret, base + j as u32, "")
                .unwrap();
            self.insert_val(*lv, v);
        }
    }

    /* ===== overflow handling ===== */

    /// The basic block that raises the overflow exception for the current
    /// cluster. Created lazily on first use; every call adds the caller's
    /// current register values as PHI inputs, so N overflow checks in one
    /// cluster share a single cold block.
    pub fn overflow_block(&mut self) -> BasicBlock<'ctx> {
        let from_bb = self.cur_bb();
        let ids: Vec<CmRegId> = self.regs.machine_regs().iter().map(|r| r.id()).collect();

        if self.overflow_bb.is_none() {
            let fun = self.cur_fn();
            let bb = self.llvm.append_basic_block(fun, "overflow");
            self.builder.position_at_end(bb);

            let phis: Vec<PhiValue<'ctx>> = ids
                .iter()
                .map(|id| self.builder.build_phi(self.ml_value_ty, id.name()).unwrap())
                .collect();

            let fn_ty = self.raise_overflow_fn_ty(ids.len());
            let addr = self.stk_addr(self.obj_ptr_ty, self.target.raise_ovflw_offset);
            let thunk = self
                .create_load_aligned(
                    self.byte_ptr_ty.into(),
                    addr,
                    self.target.word_sz_b,
                    "raiseOverflow",
                )
                .into_pointer_value();
            let args: Vec<BasicMetadataValueEnum> =
                phis.iter().map(|p| p.as_basic_value().into()).collect();
            let call = self
                .builder
                .build_indirect_call(fn_ty, thunk, &args, "")
                .unwrap();
            call.set_call_convention(JWA_CC);
            call.set_tail_call(true);
            self.builder.build_unreachable().unwrap();

            self.overflow_bb = Some(bb);
            self.overflow_phis = phis;
            self.builder.position_at_end(from_bb);
        }

        let phis = self.overflow_phis.clone();
        for (phi, id) in phis.iter().zip(ids) {
            let v = self.ml_reg(id);
            let v = self.as_ml_value(v);
            phi.add_incoming(&[(&v, from_bb)]);
        }
        self.overflow_bb.unwrap()
    }

    /// The overflow trap block and its PHIs, if one has been created for the
    /// current cluster.
    pub fn overflow_trap(&self) -> Option<(BasicBlock<'ctx>, &[PhiValue<'ctx>])> {
        self.overflow_bb.map(|bb| (bb, self.overflow_phis.as_slice()))
    }

    fn raise_overflow_fn_ty(&mut self, n_regs: usize) -> FunctionType<'ctx> {
        if let Some(ty) = self.raise_overflow_fn_ty {
            return ty;
        }
        let meta: Vec<BasicMetadataTypeEnum> =
            (0..n_regs).map(|_| self.ml_value_ty.into()).collect();
        let ty = self.llvm.void_type().fn_type(&meta, false);
        self.raise_overflow_fn_ty = Some(ty);
        ty
    }

    /// Emit an overflow-checked arithmetic operation; on overflow control
    /// branches to the cluster's shared trap block.
    pub fn checked_arith(
        &mut self,
        op: ArithOp,
        sz: u32,
        a: BasicValueEnum<'ctx>,
        b: BasicValueEnum<'ctx>,
    ) -> BasicValueEnum<'ctx> {
        let f = self.overflow_intrinsic(op, sz);
        let a = self.as_int_sz(sz, a);
        let b = self.as_int_sz(sz, b);
        let pair = self
            .builder
            .build_call(f, &[a.into(), b.into()], "")
            .unwrap()
            .try_as_basic_value()
            .basic()
            .unwrap()
            .into_struct_value();
        let res = self.builder.build_extract_value(pair, 0, "").unwrap();
        let ovfl = self
            .builder
            .build_extract_value(pair, 1, "")
            .unwrap()
            .into_int_value();

        let ok_bb = self.new_bb("");
        let trap_bb = self.overflow_block();
        let weights = self.overflow_weights();
        let br = self
            .builder
            .build_conditional_branch(ovfl, trap_bb, ok_bb)
            .unwrap();
        br.set_metadata(weights, self.llvm.get_kind_id("prof"))
            .unwrap();
        self.builder.position_at_end(ok_bb);
        res
    }

    /* ===== intrinsics ===== */

    fn cached_intrinsic(
        &mut self,
        name: &'static str,
        ty: BasicTypeEnum<'ctx>,
        bits: u32,
    ) -> FunctionValue<'ctx> {
        if let Some(f) = self.intrinsics.get(&(name, bits)) {
            return *f;
        }
        let f = Intrinsic::find(name)
            .unwrap_or_else(|| panic!("intrinsic {name} not found"))
            .get_declaration(self.module.as_ref().expect("no open module"), &[ty])
            .unwrap_or_else(|| panic!("unable to declare {name}"));
        self.intrinsics.insert((name, bits), f);
        f
    }

    /// The overflow-checking intrinsic for an arithmetic operation at the
    /// given bit width.
    pub fn overflow_intrinsic(&mut self, op: ArithOp, sz: u32) -> FunctionValue<'ctx> {
        let name = match op {
            ArithOp::Add => "llvm.sadd.with.overflow",
            ArithOp::Sub => "llvm.ssub.with.overflow",
            ArithOp::Mul => "llvm.smul.with.overflow",
        };
        let ty = self.i_type(sz).into();
        self.cached_intrinsic(name, ty, sz)
    }

    fn float_unop(
        &mut self,
        name: &'static str,
        sz: u32,
        v: BasicValueEnum<'ctx>,
    ) -> BasicValueEnum<'ctx> {
        let ty = self.f_type(sz).into();
        let f = self.cached_intrinsic(name, ty, sz);
        self.builder
            .build_call(f, &[v.into()], "")
            .unwrap()
            .try_as_basic_value()
            .basic()
            .unwrap()
    }

    pub fn create_fabs(&mut self, sz: u32, v: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.float_unop("llvm.fabs", sz, v)
    }

    pub fn create_sqrt(&mut self, sz: u32, v: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.float_unop("llvm.sqrt", sz, v)
    }

    pub fn create_copysign(
        &mut self,
        sz: u32,
        a: BasicValueEnum<'ctx>,
        b: BasicValueEnum<'ctx>,
    ) -> BasicValueEnum<'ctx> {
        let ty = self.f_type(sz).into();
        let f = self.cached_intrinsic("llvm.copysign", ty, sz);
        self.builder
            .build_call(f, &[a.into(), b.into()], "")
            .unwrap()
            .try_as_basic_value()
            .basic()
            .unwrap()
    }

    /* ===== branch weights ===== */

    /// Branch-weight metadata where `prob` is the probability of the true
    /// branch in the range 1..=999.
    pub fn branch_prob(&self, prob: u32) -> MetadataValue<'ctx> {
        debug_assert!((1..=999).contains(&prob));
        let name = self.llvm.metadata_string("branch_weights");
        let t = self.u32_const(prob);
        let f = self.u32_const(1000 - prob);
        self.llvm.metadata_node(&[name.into(), t.into(), f.into()])
    }

    /// Branch weights for overflow-trap branches.
    pub fn overflow_weights(&self) -> MetadataValue<'ctx> {
        self.branch_prob(1)
    }

    pub fn prof_kind_id(&self) -> u32 {
        self.llvm.get_kind_id("prof")
    }

    /* ===== integer instructions (with argument coercions) ===== */

    pub fn create_add(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_add(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_sub(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_sub(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_mul(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_mul(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_sdiv(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_signed_div(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_udiv(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_unsigned_div(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_srem(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_signed_rem(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_urem(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_unsigned_rem(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_and(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_and(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_or(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_or(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_xor(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_xor(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_shl(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_left_shift(self.as_int(a), self.as_int(b), "")
            .unwrap()
            .into()
    }

    pub fn create_lshr(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_right_shift(self.as_int(a), self.as_int(b), false, "")
            .unwrap()
            .into()
    }

    pub fn create_ashr(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_right_shift(self.as_int(a), self.as_int(b), true, "")
            .unwrap()
            .into()
    }

    pub fn create_icmp(
        &self,
        cmp: IntPredicate,
        a: BasicValueEnum<'ctx>,
        b: BasicValueEnum<'ctx>,
    ) -> IntValue<'ctx> {
        self.builder
            .build_int_compare(cmp, self.as_int(a), self.as_int(b), "")
            .unwrap()
    }

    pub fn create_sext(&self, v: BasicValueEnum<'ctx>, ty: IntType<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_s_extend(v.into_int_value(), ty, "")
            .unwrap()
            .into()
    }

    pub fn create_zext(&self, v: BasicValueEnum<'ctx>, ty: IntType<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_z_extend(v.into_int_value(), ty, "")
            .unwrap()
            .into()
    }

    pub fn create_trunc(&self, v: BasicValueEnum<'ctx>, ty: IntType<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_int_truncate(v.into_int_value(), ty, "")
            .unwrap()
            .into()
    }

    /* ===== floating-point instructions ===== */

    pub fn create_fadd(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_float_add(a.into_float_value(), b.into_float_value(), "")
            .unwrap()
            .into()
    }

    pub fn create_fsub(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_float_sub(a.into_float_value(), b.into_float_value(), "")
            .unwrap()
            .into()
    }

    pub fn create_fmul(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_float_mul(a.into_float_value(), b.into_float_value(), "")
            .unwrap()
            .into()
    }

    pub fn create_fdiv(&self, a: BasicValueEnum<'ctx>, b: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_float_div(a.into_float_value(), b.into_float_value(), "")
            .unwrap()
            .into()
    }

    pub fn create_fneg(&self, v: BasicValueEnum<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_float_neg(v.into_float_value(), "")
            .unwrap()
            .into()
    }

    pub fn create_fcmp(
        &self,
        cmp: FloatPredicate,
        a: BasicValueEnum<'ctx>,
        b: BasicValueEnum<'ctx>,
    ) -> IntValue<'ctx> {
        self.builder
            .build_float_compare(cmp, a.into_float_value(), b.into_float_value(), "")
            .unwrap()
    }

    pub fn create_si_to_fp(&self, v: BasicValueEnum<'ctx>, ty: FloatType<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_signed_int_to_float(self.as_int(v), ty, "")
            .unwrap()
            .into()
    }

    pub fn create_fp_to_si(&self, v: BasicValueEnum<'ctx>, ty: IntType<'ctx>) -> BasicValueEnum<'ctx> {
        self.builder
            .build_float_to_signed_int(v.into_float_value(), ty, "")
            .unwrap()
            .into()
    }

    /* ===== memory instructions ===== */

    /// Load with the ABI alignment of the loaded type.
    pub fn create_load(
        &self,
        ty: BasicTypeEnum<'ctx>,
        adr: PointerValue<'ctx>,
        name: &str,
    ) -> BasicValueEnum<'ctx> {
        self.builder.build_load(ty, adr, name).unwrap()
    }

    /// Load with an explicit alignment.
    pub fn create_load_aligned(
        &self,
        ty: BasicTypeEnum<'ctx>,
        adr: PointerValue<'ctx>,
        align: u32,
        name: &str,
    ) -> BasicValueEnum<'ctx> {
        let v = self.builder.build_load(ty, adr, name).unwrap();
        v.as_instruction_value()
            .expect("load is an instruction")
            .set_alignment(align)
            .expect("bad load alignment");
        v
    }

    /// Store a uniform runtime value at word alignment.
    pub fn create_store_ml(&self, v: BasicValueEnum<'ctx>, adr: BasicValueEnum<'ctx>) {
        let v = self.as_ml_value(v);
        let adr = self.as_obj_ptr(adr);
        let inst = self.builder.build_store(adr, v).unwrap();
        inst.set_alignment(self.target.word_sz_b)
            .expect("bad store alignment");
    }

    pub fn create_store(&self, v: BasicValueEnum<'ctx>, adr: PointerValue<'ctx>, align: u32) {
        let inst = self.builder.build_store(adr, v).unwrap();
        inst.set_alignment(align).expect("bad store alignment");
    }

    /// In-bounds address of a word-sized record slot.
    pub fn create_gep(&self, base: PointerValue<'ctx>, idx: IntValue<'ctx>) -> PointerValue<'ctx> {
        unsafe {
            self.builder
                .build_in_bounds_gep(self.ml_value_ty, base, &[idx], "")
                .unwrap()
        }
    }

    /// In-bounds address of a word-sized record slot at a constant index.
    pub fn create_gep_const(&self, base: PointerValue<'ctx>, idx: i32) -> PointerValue<'ctx> {
        self.create_gep(base, self.i32_const(idx))
    }

    /// In-bounds address computation over elements of an arbitrary type.
    pub fn create_gep_ty(
        &self,
        ty: BasicTypeEnum<'ctx>,
        base: PointerValue<'ctx>,
        idx: IntValue<'ctx>,
    ) -> PointerValue<'ctx> {
        unsafe {
            self.builder
                .build_in_bounds_gep(ty, base, &[idx], "")
                .unwrap()
        }
    }

    /* ===== control instructions ===== */

    pub fn create_br(&self, bb: BasicBlock<'ctx>) {
        self.builder.build_unconditional_branch(bb).unwrap();
    }

    /// Conditional branch with optional branch-weight metadata.
    pub fn create_cond_br(
        &self,
        cond: IntValue<'ctx>,
        t: BasicBlock<'ctx>,
        f: BasicBlock<'ctx>,
        weights: Option<MetadataValue<'ctx>>,
    ) {
        let br = self.builder.build_conditional_branch(cond, t, f).unwrap();
        if let Some(md) = weights {
            br.set_metadata(md, self.prof_kind_id()).unwrap();
        }
    }

    pub fn create_unreachable(&self) {
        self.builder.build_unreachable().unwrap();
    }

    pub fn create_extract_value(&self, v: inkwell::values::StructValue<'ctx>, i: u32) -> BasicValueEnum<'ctx> {
        self.builder.build_extract_value(v, i, "").unwrap()
    }

    /// A tail call under the jump-with-arguments convention to a known
    /// function.
    pub fn create_jwa_call(
        &self,
        fun: FunctionValue<'ctx>,
        args: &[BasicValueEnum<'ctx>],
    ) -> CallSiteValue<'ctx> {
        let meta: Vec<BasicMetadataValueEnum> = args.iter().map(|a| (*a).into()).collect();
        let call = self.builder.build_call(fun, &meta, "").unwrap();
        call.set_call_convention(JWA_CC);
        call.set_tail_call(true);
        call
    }

    /// A tail call under the jump-with-arguments convention through a code
    /// address.
    pub fn create_jwa_call_ind(
        &self,
        fn_ty: FunctionType<'ctx>,
        fun: PointerValue<'ctx>,
        args: &[BasicValueEnum<'ctx>],
    ) -> CallSiteValue<'ctx> {
        let meta: Vec<BasicMetadataValueEnum> = args.iter().map(|a| (*a).into()).collect();
        let call = self
            .builder
            .build_indirect_call(fn_ty, fun, &meta, "")
            .unwrap();
        call.set_call_convention(JWA_CC);
        call.set_tail_call(true);
        call
    }

    /* ===== code generation ===== */

    /// Dump the current module's IR to stderr.
    pub fn dump_ir(&self) {
        self.module().print_to_stderr();
    }

    /// Run the LLVM verifier; failures are diagnostic, not fatal, so a bad
    /// module can still be dumped for inspection.
    pub fn verify(&self) -> bool {
        match self.module().verify() {
            Ok(()) => true,
            Err(msg) => {
                log::error!("module verification failed: {}", msg.to_string());
                false
            }
        }
    }

    /// Run the optimization pipeline over the module.
    pub fn optimize(&self) -> CodegenResult<()> {
        self.mc_gen.optimize(self.module())
    }

    /// Compile to an in-memory heap code object.
    pub fn compile(&self) -> CodegenResult<CodeObject> {
        let bytes = self.mc_gen.compile(self.module())?;
        Ok(CodeObject::new(self.target, &bytes)?)
    }

    /// Dump assembly to stdout.
    pub fn dump_asm_stdout(&self) -> CodegenResult<()> {
        self.mc_gen.dump_code(self.module(), "-", true)
    }

    /// Dump assembly to `<stem>.s`.
    pub fn dump_asm(&self, stem: &str) -> CodegenResult<()> {
        self.mc_gen.dump_code(self.module(), stem, true)
    }

    /// Dump machine code to `<stem>.o`.
    pub fn dump_obj(&self, stem: &str) -> CodegenResult<()> {
        self.mc_gen.dump_code(self.module(), stem, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Param, Ty};
    use inkwell::context::Context;

    fn entry_frag(n_params: usize, kind: FragKind) -> Frag {
        Frag {
            lab: 100,
            kind,
            params: (0..n_params)
                .map(|i| Param {
                    lvar: 200 + i as LVar,
                    ty: Ty::Ptr,
                })
                .collect(),
            body: crate::cfg::Stm::Halt,
        }
    }

    fn with_cluster<'ctx>(
        cx: &mut CodegenContext<'ctx>,
        kind: FragKind,
        n_params: usize,
    ) -> Frag {
        let frag = entry_frag(n_params, kind);
        let tys: Vec<_> = (0..n_params)
            .map(|_| BasicTypeEnum::from(cx.ml_value_ty()))
            .collect();
        let fn_ty = cx.create_fn_ty(kind, &tys);
        let fun = cx.new_function(fn_ty, "entry100", true);
        cx.begin_cluster(fun);
        cx.begin_frag();
        cx.setup_std_entry(&frag);
        frag
    }

    #[test]
    fn fn_ty_params_args_agree() {
        let llvm = Context::create();
        for name in TargetInfo::names() {
            let target = TargetInfo::for_name(name).unwrap();
            let mut cx = CodegenContext::new(&llvm, target).unwrap();
            cx.begin_module("agree", 1);
            for kind in [FragKind::StdFun, FragKind::StdCont, FragKind::KnownFun] {
                let n = 3;
                with_cluster(&mut cx, kind, n);

                let tys: Vec<_> = (0..n)
                    .map(|_| BasicTypeEnum::from(cx.ml_value_ty()))
                    .collect();
                let fn_ty = cx.create_fn_ty(kind, &tys);
                let mut param_tys = cx.create_param_tys(kind, n);
                param_tys.extend_from_slice(&tys);
                let mut args = cx.create_args(kind, n);
                for _ in 0..n {
                    args.push(cx.unit_value());
                }

                assert_eq!(fn_ty.count_param_types() as usize, param_tys.len());
                assert_eq!(param_tys.len(), args.len());
                for (ty, arg) in param_tys.iter().zip(&args) {
                    assert_eq!(*ty, arg.get_type());
                }
                cx.end_cluster();
            }
            cx.end_module();
        }
    }

    #[test]
    fn save_restore_is_identity() {
        let llvm = Context::create();
        let mut cx = CodegenContext::new(&llvm, TargetInfo::for_name("x86_64").unwrap()).unwrap();
        cx.begin_module("regs", 1);
        with_cluster(&mut cx, FragKind::StdFun, 0);

        let mut snap = CmRegState::new();
        cx.save_reg_state(&mut snap);
        let before: Vec<_> = CmRegId::all()
            .iter()
            .map(|r| cx.reg_state().get(*r))
            .collect();
        cx.restore_reg_state(&snap);
        let after: Vec<_> = CmRegId::all()
            .iter()
            .map(|r| cx.reg_state().get(*r))
            .collect();
        assert_eq!(before, after);
        cx.end_module();
    }

    #[test]
    fn overflow_trap_is_shared() {
        let llvm = Context::create();
        let mut cx = CodegenContext::new(&llvm, TargetInfo::native()).unwrap();
        cx.begin_module("ovflw", 1);
        with_cluster(&mut cx, FragKind::StdFun, 0);

        let n = 4;
        let mut v = cx.unit_value();
        for _ in 0..n {
            v = cx.checked_arith(ArithOp::Add, 64, v, cx.unit_value());
        }
        cx.create_unreachable();

        let (bb, phis) = cx.overflow_trap().expect("trap block created");
        assert_eq!(bb.get_name().to_str().unwrap(), "overflow");
        assert!(!phis.is_empty());
        for phi in phis {
            assert_eq!(phi.count_incoming(), n);
        }
        // only one overflow block exists in the function
        let blocks = cx.cur_fn().get_basic_blocks();
        let traps = blocks
            .iter()
            .filter(|b| b.get_name().to_str().unwrap() == "overflow")
            .count();
        assert_eq!(traps, 1);
        cx.end_module();
    }

    #[test]
    fn mem_resident_registers_round_trip_through_frame() {
        let llvm = Context::create();
        // x86_64 keeps storePtr in the frame
        let mut cx = CodegenContext::new(&llvm, TargetInfo::for_name("x86_64").unwrap()).unwrap();
        cx.begin_module("memreg", 1);
        with_cluster(&mut cx, FragKind::StdFun, 0);

        let v = cx.unit_value();
        cx.set_ml_reg(CmRegId::StorePtr, v);
        let loaded = cx.ml_reg(CmRegId::StorePtr);
        assert!(loaded.is_pointer_value());
        // the loaded value is a fresh load, not the cached value
        assert!(cx.reg_state().get(CmRegId::StorePtr).is_none());
        cx.end_module();
    }

    #[test]
    fn label_diff_is_constant() {
        let llvm = Context::create();
        let mut cx = CodegenContext::new(&llvm, TargetInfo::native()).unwrap();
        cx.begin_module("labels", 2);
        let fn_ty = cx.create_fn_ty(FragKind::StdFun, &[]);
        let f1 = cx.new_function(fn_ty, "entry1", true);
        let f2 = cx.new_function(fn_ty, "fn2", false);
        let diff = cx.label_diff(f1, f2);
        assert!(diff.is_const());
        cx.end_module();
    }
}
