// End-to-end tests: build small compilation units, translate them on the host
// target, run the optimizer, and package the result as an in-memory heap code
// object.

use cfgcg::cfg::{Cluster, CompUnit, Exp, Frag, FragKind, Param, Stm, Ty};
use cfgcg::{codegen_unit, CodegenContext, CodegenError, TargetInfo};
use inkwell::context::Context;

/// One cluster whose standard entry allocates a two-field record and throws
/// it to its continuation parameter.
fn record_alloc_unit() -> CompUnit {
    CompUnit {
        src_name: "record.sml".to_string(),
        clusters: vec![Cluster {
            frags: vec![Frag {
                lab: 1,
                kind: FragKind::StdFun,
                params: vec![
                    Param {
                        lvar: 2,
                        ty: Ty::Ptr,
                    },
                    Param {
                        lvar: 3,
                        ty: Ty::Ptr,
                    },
                    Param {
                        lvar: 4,
                        ty: Ty::Ptr,
                    },
                ],
                body: Stm::Alloc {
                    lvar: 5,
                    desc: 0x82,
                    fields: vec![Exp::Var(3), Exp::Var(4)],
                    cont: Box::new(Stm::Throw {
                        k: Exp::Var(2),
                        args: vec![Exp::Var(5)],
                    }),
                },
            }],
        }],
    }
}

#[test]
fn record_allocation_compiles_to_code_object() {
    let llvm = Context::create();
    let mut cx = CodegenContext::new(&llvm, TargetInfo::native()).unwrap();
    codegen_unit(&mut cx, &record_alloc_unit());

    assert!(cx.verify(), "verification must pass before optimization");
    cx.optimize().unwrap();
    assert!(cx.verify(), "verification must pass after optimization");

    let code_obj = cx.compile().unwrap();
    assert!(code_obj.size() > 0);

    // the blob must be at least as large as its text section
    let text = code_obj
        .find_section(".text")
        .or_else(|| code_obj.find_section("__text"))
        .expect("code object has a text section");
    assert!(code_obj.size() >= text.size());

    let mut mem = vec![0u8; code_obj.size()];
    code_obj.get_code(&mut mem).unwrap();
    let mut again = vec![0u8; code_obj.size()];
    code_obj.get_code(&mut again).unwrap();
    assert_eq!(mem, again, "patching must be deterministic");

    cx.end_module();
}

#[test]
fn unknown_target_fails_before_codegen() {
    let llvm = Context::create();
    match CodegenContext::for_target_name(&llvm, "pdp11") {
        Err(CodegenError::UnknownTarget { name }) => assert_eq!(name, "pdp11"),
        Ok(_) => panic!("target selection must fail"),
        Err(e) => panic!("expected unknown-target error, got {e}"),
    };
}

#[test]
fn cross_cluster_call_resolves_labels() {
    // two clusters; the first tail-calls the second by label
    let unit = CompUnit {
        src_name: "pair.sml".to_string(),
        clusters: vec![
            Cluster {
                frags: vec![Frag {
                    lab: 1,
                    kind: FragKind::StdFun,
                    params: vec![Param {
                        lvar: 2,
                        ty: Ty::Ptr,
                    }],
                    body: Stm::Apply {
                        kind: FragKind::KnownFun,
                        f: Exp::Label(10),
                        args: vec![Exp::Var(2)],
                    },
                }],
            },
            Cluster {
                frags: vec![Frag {
                    lab: 10,
                    kind: FragKind::KnownFun,
                    params: vec![Param {
                        lvar: 11,
                        ty: Ty::Ptr,
                    }],
                    body: Stm::Throw {
                        k: Exp::Var(11),
                        args: vec![],
                    },
                }],
            },
        ],
    };

    let llvm = Context::create();
    let mut cx = CodegenContext::new(&llvm, TargetInfo::native()).unwrap();
    codegen_unit(&mut cx, &unit);
    assert!(cx.verify());
    cx.optimize().unwrap();
    assert!(cx.verify());
    let code_obj = cx.compile().unwrap();
    assert!(code_obj.size() > 0);
    cx.end_module();
}

#[test]
fn overflow_checked_unit_compiles() {
    use cfgcg::cfg::ArithOp;
    // two checked additions share one trap block; the unit must still
    // verify, optimize, and compile
    let unit = CompUnit {
        src_name: "ovflw.sml".to_string(),
        clusters: vec![Cluster {
            frags: vec![Frag {
                lab: 1,
                kind: FragKind::StdFun,
                params: vec![
                    Param {
                        lvar: 2,
                        ty: Ty::Ptr,
                    },
                    Param {
                        lvar: 3,
                        ty: Ty::Num(64),
                    },
                ],
                body: Stm::Arith {
                    lvar: 4,
                    op: ArithOp::Add,
                    sz: 64,
                    a: Exp::Var(3),
                    b: Exp::Num { sz: 64, v: 1 },
                    cont: Box::new(Stm::Arith {
                        lvar: 5,
                        op: ArithOp::Mul,
                        sz: 64,
                        a: Exp::Var(4),
                        b: Exp::Var(4),
                        cont: Box::new(Stm::Throw {
                            k: Exp::Var(2),
                            args: vec![Exp::Var(5)],
                        }),
                    }),
                },
            }],
        }],
    };

    let llvm = Context::create();
    let mut cx = CodegenContext::new(&llvm, TargetInfo::native()).unwrap();
    codegen_unit(&mut cx, &unit);
    assert!(cx.verify());
    cx.optimize().unwrap();
    assert!(cx.verify());
    assert!(cx.compile().unwrap().size() > 0);
    cx.end_module();
}
