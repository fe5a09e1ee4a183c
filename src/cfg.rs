// This module defines the in-memory compilation unit (the CFG intermediate
// representation) and its translation against the CodegenContext. A unit is an
// ordered sequence of clusters; a cluster is a mutually-recursive group of fragments
// whose first fragment is the cluster entry. The entry fragment becomes an LLVM
// function under the jump-with-arguments convention; the remaining (internal)
// fragments become PHI-headed basic blocks of that function, with one PHI per
// threaded machine register plus one per declared parameter. Translation is two
// passes within each scope so that forward references always resolve: the unit pass
// registers every cluster's function before any body is translated, and the cluster
// pass creates every internal fragment's entry block and PHIs before any fragment
// body is translated. Statements are continuation-shaped; control leaves a cluster
// only through tail transfers (Apply/Throw) or the unreachable Halt, and moves
// between fragments of one cluster by feeding the target's PHIs and branching.
// Branch arms snapshot and restore the register convention state so that register
// mutations on one arm never leak into the other.

//! The CFG compilation-unit model and its translation to LLVM IR.

use inkwell::types::BasicTypeEnum;
use inkwell::values::BasicValueEnum;
use inkwell::IntPredicate;
use log::debug;

use crate::context::{CodegenContext, FragInfo};

/// Lexical-variable identifier; also used for code labels.
pub type LVar = u32;

/// The type of a fragment parameter or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    /// Integer of the given bit size.
    Num(u32),
    /// Float of the given bit size.
    Flt(u32),
    /// A uniform runtime value.
    Ptr,
    /// A code address.
    Lab,
}

impl Ty {
    pub fn to_llvm<'ctx>(self, cx: &CodegenContext<'ctx>) -> BasicTypeEnum<'ctx> {
        match self {
            Ty::Num(sz) => cx.i_type(sz).into(),
            Ty::Flt(sz) => cx.f_type(sz).into(),
            Ty::Ptr | Ty::Lab => cx.ml_value_ty().into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub lvar: LVar,
    pub ty: Ty,
}

/// The convention a fragment is entered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragKind {
    /// Standard escaping function.
    StdFun,
    /// Standard continuation.
    StdCont,
    /// Known function: entered only from sites that see its definition.
    KnownFun,
    /// Internal fragment of a cluster; a PHI-headed block, not a function.
    Internal,
}

/// Overflow-checked arithmetic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
}

/// Pure (unchecked) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PureOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FNeg,
    FAbs,
    FSqrt,
}

/// Comparison operations for branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    SLt,
    SLe,
    SGt,
    SGe,
    ULt,
    ULe,
    UGt,
    UGe,
}

impl CmpOp {
    fn predicate(self) -> IntPredicate {
        match self {
            CmpOp::Eq => IntPredicate::EQ,
            CmpOp::Ne => IntPredicate::NE,
            CmpOp::SLt => IntPredicate::SLT,
            CmpOp::SLe => IntPredicate::SLE,
            CmpOp::SGt => IntPredicate::SGT,
            CmpOp::SGe => IntPredicate::SGE,
            CmpOp::ULt => IntPredicate::ULT,
            CmpOp::ULe => IntPredicate::ULE,
            CmpOp::UGt => IntPredicate::UGT,
            CmpOp::UGe => IntPredicate::UGE,
        }
    }
}

/// Expressions: value-producing, side-effect free.
#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    /// A bound lexical variable.
    Var(LVar),
    /// The address of a cluster entry.
    Label(LVar),
    /// Integer literal of the given bit size.
    Num { sz: u32, v: i64 },
    /// Float literal of the given bit size.
    Real { sz: u32, v: f64 },
    /// An unchecked primitive operation.
    Pure { op: PureOp, sz: u32, args: Vec<Exp> },
    /// Load field `idx` of a record.
    Select { idx: u32, arg: Box<Exp> },
}

/// Statements: continuation-shaped; each fragment body is one statement tree
/// whose leaves are control transfers.
#[derive(Debug, Clone, PartialEq)]
pub enum Stm {
    /// Bind an expression's value.
    Let {
        lvar: LVar,
        exp: Exp,
        cont: Box<Stm>,
    },
    /// Allocate a record with a constant descriptor; no heap-limit check is
    /// inserted here.
    Alloc {
        lvar: LVar,
        desc: u64,
        fields: Vec<Exp>,
        cont: Box<Stm>,
    },
    /// Overflow-checked arithmetic; traps to the cluster's shared overflow
    /// block.
    Arith {
        lvar: LVar,
        op: ArithOp,
        sz: u32,
        a: Exp,
        b: Exp,
        cont: Box<Stm>,
    },
    /// Transfer to an internal fragment of the current cluster.
    Goto { lab: LVar, args: Vec<Exp> },
    /// Tail call to a function under the given convention.
    Apply {
        kind: FragKind,
        f: Exp,
        args: Vec<Exp>,
    },
    /// Tail call to a standard continuation.
    Throw { k: Exp, args: Vec<Exp> },
    /// Two-way branch, optionally annotated with the probability (per mille)
    /// of the true arm.
    Branch {
        cmp: CmpOp,
        a: Exp,
        b: Exp,
        prob: Option<u32>,
        t: Box<Stm>,
        f: Box<Stm>,
    },
    /// Invoke the collector with the given roots; the lvars in `new_roots`
    /// are rebound to the corresponding returned values.
    CallGc {
        roots: Vec<Exp>,
        new_roots: Vec<LVar>,
        cont: Box<Stm>,
    },
    /// Terminal statement with no successor.
    Halt,
}

/// One unit of generated code with its own parameters and entry convention.
#[derive(Debug, Clone, PartialEq)]
pub struct Frag {
    pub lab: LVar,
    pub kind: FragKind,
    pub params: Vec<Param>,
    pub body: Stm,
}

/// A mutually-recursive group of fragments; `frags[0]` is the entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub frags: Vec<Frag>,
}

impl Cluster {
    pub fn entry(&self) -> &Frag {
        &self.frags[0]
    }
}

/// A compilation unit; `clusters[0]` is the unit entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CompUnit {
    pub src_name: String,
    pub clusters: Vec<Cluster>,
}

/* ===== translation ===== */

/// Translate a compilation unit into the context's current module.
///
/// Opens a fresh module; the caller verifies, optimizes, and compiles it and
/// then closes it with `end_module`.
pub fn codegen_unit<'ctx>(cx: &mut CodegenContext<'ctx>, unit: &CompUnit) {
    debug!(
        "codegen unit \"{}\" with {} clusters",
        unit.src_name,
        unit.clusters.len()
    );
    cx.begin_module(&unit.src_name, unit.clusters.len());

    // register every cluster before translating any body, so labels of
    // later clusters resolve from earlier ones
    for (i, cluster) in unit.clusters.iter().enumerate() {
        init_cluster(cx, cluster, i == 0);
    }
    for cluster in &unit.clusters {
        codegen_cluster(cx, cluster);
    }

    cx.complete_module();
}

fn init_cluster<'ctx>(cx: &mut CodegenContext<'ctx>, cluster: &Cluster, is_first: bool) {
    let entry = cluster.entry();
    assert!(
        entry.kind != FragKind::Internal,
        "cluster entry cannot be an internal fragment"
    );
    let tys: Vec<BasicTypeEnum> = entry.params.iter().map(|p| p.ty.to_llvm(cx)).collect();
    let fn_ty = cx.create_fn_ty(entry.kind, &tys);
    let name = format!("fn{}", entry.lab);
    let fun = cx.new_function(fn_ty, &name, is_first);
    cx.insert_cluster(entry.lab, fun);
}

fn codegen_cluster<'ctx>(cx: &mut CodegenContext<'ctx>, cluster: &Cluster) {
    let entry = cluster.entry();
    let fun = cx
        .lookup_cluster(entry.lab)
        .expect("cluster not initialized");
    cx.begin_cluster(fun);

    // the entry block must be first in the function, so it is created before
    // the internal fragments' blocks
    cx.begin_frag();
    cx.setup_std_entry(entry);
    let entry_bb = cx.cur_bb();
    for frag in &cluster.frags[1..] {
        init_frag(cx, frag);
    }

    cx.set_insert_point(entry_bb);
    codegen_stm(cx, &entry.body);

    for frag in &cluster.frags[1..] {
        cx.begin_frag();
        cx.setup_frag_entry(frag);
        codegen_stm(cx, &frag.body);
    }

    cx.end_cluster();
}

/// Create an internal fragment's entry block and PHIs (machine registers
/// first, then declared parameters) before any body is translated.
fn init_frag<'ctx>(cx: &mut CodegenContext<'ctx>, frag: &Frag) {
    assert!(
        frag.kind == FragKind::Internal,
        "non-entry fragment must be internal"
    );
    let bb = cx.new_bb(&format!("frag{}", frag.lab));
    cx.set_insert_point(bb);

    let mut phis = Vec::with_capacity(cx.regs().num_machine_regs() + frag.params.len());
    let names: Vec<&'static str> = cx.regs().machine_regs().iter().map(|r| r.name()).collect();
    for name in names {
        phis.push(cx.builder().build_phi(cx.ml_value_ty(), name).unwrap());
    }
    for p in &frag.params {
        let ty = p.ty.to_llvm(cx);
        phis.push(cx.builder().build_phi(ty, "").unwrap());
    }
    cx.insert_frag(
        frag.lab,
        FragInfo {
            kind: frag.kind,
            block: bb,
            phis,
        },
    );
}

fn codegen_stm<'ctx>(cx: &mut CodegenContext<'ctx>, stm: &Stm) {
    match stm {
        Stm::Let { lvar, exp, cont } => {
            let v = codegen_exp(cx, exp);
            cx.insert_val(*lvar, v);
            codegen_stm(cx, cont);
        }
        Stm::Alloc {
            lvar,
            desc,
            fields,
            cont,
        } => {
            let vals: Vec<BasicValueEnum> = fields
                .iter()
                .map(|f| {
                    let v = codegen_exp(cx, f);
                    cx.as_ml_value(v)
                })
                .collect();
            let obj = cx.alloc_record_const(*desc, &vals);
            cx.insert_val(*lvar, obj);
            codegen_stm(cx, cont);
        }
        Stm::Arith {
            lvar,
            op,
            sz,
            a,
            b,
            cont,
        } => {
            let a = codegen_exp(cx, a);
            let b = codegen_exp(cx, b);
            let v = cx.checked_arith(*op, *sz, a, b);
            cx.insert_val(*lvar, v);
            codegen_stm(cx, cont);
        }
        Stm::Goto { lab, args } => {
            let info = cx
                .lookup_frag(*lab)
                .expect("goto target not initialized")
                .clone();
            // feed the target's PHIs: machine registers, then arguments
            let mut incoming = cx.create_args(FragKind::Internal, args.len());
            for a in args {
                let v = codegen_exp(cx, a);
                incoming.push(v);
            }
            assert_eq!(incoming.len(), info.phis.len(), "goto arity mismatch");
            let from = cx.cur_bb();
            for (phi, v) in info.phis.iter().zip(&incoming) {
                phi.add_incoming(&[(v, from)]);
            }
            cx.create_br(info.block);
        }
        Stm::Apply { kind, f, args } => {
            codegen_tail_call(cx, *kind, f, args);
        }
        Stm::Throw { k, args } => {
            codegen_tail_call(cx, FragKind::StdCont, k, args);
        }
        Stm::Branch {
            cmp,
            a,
            b,
            prob,
            t,
            f,
        } => {
            let a = codegen_exp(cx, a);
            let b = codegen_exp(cx, b);
            let cond = cx.create_icmp(cmp.predicate(), a, b);
            let t_bb = cx.new_bb("");
            let f_bb = cx.new_bb("");
            let weights = prob.map(|p| cx.branch_prob(p));
            cx.create_cond_br(cond, t_bb, f_bb, weights);

            // register mutations on one arm must not leak into the other
            let mut snapshot = crate::regs::CmRegState::new();
            cx.save_reg_state(&mut snapshot);
            cx.set_insert_point(t_bb);
            codegen_stm(cx, t);
            cx.restore_reg_state(&snapshot);
            cx.set_insert_point(f_bb);
            codegen_stm(cx, f);
        }
        Stm::CallGc {
            roots,
            new_roots,
            cont,
        } => {
            let vals: Vec<BasicValueEnum> = roots
                .iter()
                .map(|r| {
                    let v = codegen_exp(cx, r);
                    cx.as_ml_value(v)
                })
                .collect();
            cx.call_gc(&vals, new_roots);
            codegen_stm(cx, cont);
        }
        Stm::Halt => {
            cx.create_unreachable();
        }
    }
}

/// Tail-transfer to a function under the jump-with-arguments convention,
/// directly when the callee is a known cluster label and indirectly through
/// a code address otherwise.
fn codegen_tail_call<'ctx>(cx: &mut CodegenContext<'ctx>, kind: FragKind, f: &Exp, args: &[Exp]) {
    let mut arg_vals = cx.create_args(kind, args.len());
    let n_extra = arg_vals.len();
    for a in args {
        let v = codegen_exp(cx, a);
        arg_vals.push(v);
    }

    if let Exp::Label(lab) = f {
        if let Some(fun) = cx.lookup_cluster(*lab) {
            cx.create_jwa_call(fun, &arg_vals);
            cx.builder().build_return(None).unwrap();
            return;
        }
    }

    let tys: Vec<BasicTypeEnum> = arg_vals[n_extra..].iter().map(|v| v.get_type()).collect();
    let fn_ty = cx.create_fn_ty(kind, &tys);
    let callee = codegen_exp(cx, f);
    let callee = cx.as_byte_ptr(callee);
    cx.create_jwa_call_ind(fn_ty, callee, &arg_vals);
    cx.builder().build_return(None).unwrap();
}

fn codegen_exp<'ctx>(cx: &mut CodegenContext<'ctx>, exp: &Exp) -> BasicValueEnum<'ctx> {
    match exp {
        Exp::Var(lv) => cx.lookup_val(*lv).expect("unbound lvar"),
        Exp::Label(lab) => {
            let fun = cx.lookup_cluster(*lab).expect("unbound label");
            cx.eval_label(fun)
        }
        Exp::Num { sz, v } => cx.i_const_sz(*sz, *v).into(),
        Exp::Real { sz, v } => cx.f_type(*sz).const_float(*v).into(),
        Exp::Pure { op, sz, args } => codegen_pure(cx, *op, *sz, args),
        Exp::Select { idx, arg } => {
            let base = codegen_exp(cx, arg);
            let base = cx.as_obj_ptr(base);
            let slot = cx.create_gep_const(base, *idx as i32);
            cx.create_load_aligned(
                cx.ml_value_ty().into(),
                slot,
                cx.word_sz_in_bytes(),
                "",
            )
        }
    }
}

fn codegen_pure<'ctx>(
    cx: &mut CodegenContext<'ctx>,
    op: PureOp,
    sz: u32,
    args: &[Exp],
) -> BasicValueEnum<'ctx> {
    let vals: Vec<BasicValueEnum> = args.iter().map(|a| codegen_exp(cx, a)).collect();
    match op {
        PureOp::Add => cx.create_add(vals[0], vals[1]),
        PureOp::Sub => cx.create_sub(vals[0], vals[1]),
        PureOp::Mul => cx.create_mul(vals[0], vals[1]),
        PureOp::SDiv => cx.create_sdiv(vals[0], vals[1]),
        PureOp::UDiv => cx.create_udiv(vals[0], vals[1]),
        PureOp::SRem => cx.create_srem(vals[0], vals[1]),
        PureOp::URem => cx.create_urem(vals[0], vals[1]),
        PureOp::And => cx.create_and(vals[0], vals[1]),
        PureOp::Or => cx.create_or(vals[0], vals[1]),
        PureOp::Xor => cx.create_xor(vals[0], vals[1]),
        PureOp::Shl => cx.create_shl(vals[0], vals[1]),
        PureOp::LShr => cx.create_lshr(vals[0], vals[1]),
        PureOp::AShr => cx.create_ashr(vals[0], vals[1]),
        PureOp::FAdd => cx.create_fadd(vals[0], vals[1]),
        PureOp::FSub => cx.create_fsub(vals[0], vals[1]),
        PureOp::FMul => cx.create_fmul(vals[0], vals[1]),
        PureOp::FDiv => cx.create_fdiv(vals[0], vals[1]),
        PureOp::FNeg => cx.create_fneg(vals[0]),
        PureOp::FAbs => cx.create_fabs(sz, vals[0]),
        PureOp::FSqrt => cx.create_sqrt(sz, vals[0]),
    }
}
