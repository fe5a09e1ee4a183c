// This module decodes a pickled compilation unit from a byte stream into the CFG
// model of the cfg module. The format is a compact tagged encoding: a four-byte
// magic and a version byte, then the unit tree with LEB128 varints for counts,
// labels, and integer fields (zig-zag for signed values), single tag bytes for
// enum discriminants, raw little-endian bit patterns for float literals, and
// length-prefixed UTF-8 for strings. Decoding is strict and single-pass; every
// failure (bad magic, truncation, unknown tag, out-of-range value, malformed string)
// is a reportable PickleError carrying the byte offset, and the driver treats any of
// them as fatal. Declared counts and lengths are bounded by the remaining input
// before any allocation, so a malformed pickle can never drive an allocation.
// There is no partial decode: a unit either reads completely or not at all.

//! Decoder for pickled compilation units.

use crate::cfg::{
    ArithOp, Cluster, CmpOp, CompUnit, Exp, Frag, FragKind, LVar, Param, PureOp, Stm, Ty,
};
use crate::error::PickleError;

const MAGIC: &[u8; 4] = b"CFGU";
const VERSION: u8 = 1;

/// Decode a compilation unit from its pickled form.
pub fn read(bytes: &[u8]) -> Result<CompUnit, PickleError> {
    let mut rd = Reader { bytes, pos: 0 };
    rd.magic()?;
    let src_name = rd.string()?;
    let n = rd.count()?;
    let mut clusters = Vec::with_capacity(n);
    for _ in 0..n {
        clusters.push(rd.cluster()?);
    }
    Ok(CompUnit { src_name, clusters })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> Result<u8, PickleError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(PickleError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn magic(&mut self) -> Result<(), PickleError> {
        let mut m = [0u8; 4];
        for b in &mut m {
            *b = self.byte().map_err(|_| PickleError::BadMagic)?;
        }
        if &m != MAGIC || self.byte().map_err(|_| PickleError::BadMagic)? != VERSION {
            return Err(PickleError::BadMagic);
        }
        Ok(())
    }

    /// LEB128 unsigned varint.
    fn varint(&mut self) -> Result<u64, PickleError> {
        let mut v: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.byte()?;
            v |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 64 {
                return Err(PickleError::BadTag {
                    what: "varint",
                    tag: b,
                    offset: self.pos - 1,
                });
            }
        }
    }

    /// Zig-zag signed varint.
    fn svarint(&mut self) -> Result<i64, PickleError> {
        let v = self.varint()?;
        Ok((v >> 1) as i64 ^ -((v & 1) as i64))
    }

    /// A declared element count or byte length. Every element takes at least
    /// one byte, so a count exceeding the remaining input is a truncation;
    /// checking here keeps untrusted counts out of `Vec::with_capacity`.
    fn count(&mut self) -> Result<usize, PickleError> {
        let offset = self.pos;
        let n = self.varint()?;
        if n > (self.bytes.len() - self.pos) as u64 {
            return Err(PickleError::Truncated { offset });
        }
        Ok(n as usize)
    }

    fn f64(&mut self) -> Result<f64, PickleError> {
        let mut raw = [0u8; 8];
        for b in &mut raw {
            *b = self.byte()?;
        }
        Ok(f64::from_bits(u64::from_le_bytes(raw)))
    }

    fn lvar(&mut self) -> Result<LVar, PickleError> {
        Ok(self.varint()? as LVar)
    }

    fn string(&mut self) -> Result<String, PickleError> {
        let start = self.pos;
        let len = self.count()?;
        let raw = self.bytes[self.pos..self.pos + len].to_vec();
        self.pos += len;
        String::from_utf8(raw).map_err(|_| PickleError::BadString { offset: start })
    }

    fn cluster(&mut self) -> Result<Cluster, PickleError> {
        let n = self.count()?;
        let mut frags = Vec::with_capacity(n);
        for _ in 0..n {
            frags.push(self.frag()?);
        }
        Ok(Cluster { frags })
    }

    fn frag(&mut self) -> Result<Frag, PickleError> {
        let lab = self.lvar()?;
        let kind = self.frag_kind()?;
        let n = self.count()?;
        let mut params = Vec::with_capacity(n);
        for _ in 0..n {
            let lvar = self.lvar()?;
            let ty = self.ty()?;
            params.push(Param { lvar, ty });
        }
        let body = self.stm()?;
        Ok(Frag {
            lab,
            kind,
            params,
            body,
        })
    }

    fn frag_kind(&mut self) -> Result<FragKind, PickleError> {
        let offset = self.pos;
        let tag = self.byte()?;
        match tag {
            0 => Ok(FragKind::StdFun),
            1 => Ok(FragKind::StdCont),
            2 => Ok(FragKind::KnownFun),
            3 => Ok(FragKind::Internal),
            _ => Err(PickleError::BadTag {
                what: "fragment kind",
                tag,
                offset,
            }),
        }
    }

    fn ty(&mut self) -> Result<Ty, PickleError> {
        let offset = self.pos;
        let tag = self.byte()?;
        match tag {
            0 => Ok(Ty::Num(self.varint()? as u32)),
            1 => Ok(Ty::Flt(self.varint()? as u32)),
            2 => Ok(Ty::Ptr),
            3 => Ok(Ty::Lab),
            _ => Err(PickleError::BadTag {
                what: "type",
                tag,
                offset,
            }),
        }
    }

    fn exp(&mut self) -> Result<Exp, PickleError> {
        let offset = self.pos;
        let tag = self.byte()?;
        match tag {
            0 => Ok(Exp::Var(self.lvar()?)),
            1 => Ok(Exp::Label(self.lvar()?)),
            2 => {
                let sz = self.varint()? as u32;
                let v = self.svarint()?;
                Ok(Exp::Num { sz, v })
            }
            3 => {
                let sz = self.varint()? as u32;
                let v = self.f64()?;
                Ok(Exp::Real { sz, v })
            }
            4 => {
                let op = self.pure_op()?;
                let sz = self.varint()? as u32;
                let args = self.exps()?;
                Ok(Exp::Pure { op, sz, args })
            }
            5 => {
                let idx = self.varint()? as u32;
                let arg = Box::new(self.exp()?);
                Ok(Exp::Select { idx, arg })
            }
            _ => Err(PickleError::BadTag {
                what: "expression",
                tag,
                offset,
            }),
        }
    }

    fn exps(&mut self) -> Result<Vec<Exp>, PickleError> {
        let n = self.count()?;
        let mut args = Vec::with_capacity(n);
        for _ in 0..n {
            args.push(self.exp()?);
        }
        Ok(args)
    }

    fn pure_op(&mut self) -> Result<PureOp, PickleError> {
        let offset = self.pos;
        let tag = self.byte()?;
        let op = match tag {
            0 => PureOp::Add,
            1 => PureOp::Sub,
            2 => PureOp::Mul,
            3 => PureOp::SDiv,
            4 => PureOp::UDiv,
            5 => PureOp::SRem,
            6 => PureOp::URem,
            7 => PureOp::And,
            8 => PureOp::Or,
            9 => PureOp::Xor,
            10 => PureOp::Shl,
            11 => PureOp::LShr,
            12 => PureOp::AShr,
            13 => PureOp::FAdd,
            14 => PureOp::FSub,
            15 => PureOp::FMul,
            16 => PureOp::FDiv,
            17 => PureOp::FNeg,
            18 => PureOp::FAbs,
            19 => PureOp::FSqrt,
            _ => {
                return Err(PickleError::BadTag {
                    what: "pure op",
                    tag,
                    offset,
                })
            }
        };
        Ok(op)
    }

    fn arith_op(&mut self) -> Result<ArithOp, PickleError> {
        let offset = self.pos;
        let tag = self.byte()?;
        match tag {
            0 => Ok(ArithOp::Add),
            1 => Ok(ArithOp::Sub),
            2 => Ok(ArithOp::Mul),
            _ => Err(PickleError::BadTag {
                what: "arith op",
                tag,
                offset,
            }),
        }
    }

    fn cmp_op(&mut self) -> Result<CmpOp, PickleError> {
        let offset = self.pos;
        let tag = self.byte()?;
        let op = match tag {
            0 => CmpOp::Eq,
            1 => CmpOp::Ne,
            2 => CmpOp::SLt,
            3 => CmpOp::SLe,
            4 => CmpOp::SGt,
            5 => CmpOp::SGe,
            6 => CmpOp::ULt,
            7 => CmpOp::ULe,
            8 => CmpOp::UGt,
            9 => CmpOp::UGe,
            _ => {
                return Err(PickleError::BadTag {
                    what: "compare op",
                    tag,
                    offset,
                })
            }
        };
        Ok(op)
    }

    fn stm(&mut self) -> Result<Stm, PickleError> {
        let offset = self.pos;
        let tag = self.byte()?;
        match tag {
            0 => {
                let lvar = self.lvar()?;
                let exp = self.exp()?;
                let cont = Box::new(self.stm()?);
                Ok(Stm::Let { lvar, exp, cont })
            }
            1 => {
                let lvar = self.lvar()?;
                let desc = self.varint()?;
                let fields = self.exps()?;
                let cont = Box::new(self.stm()?);
                Ok(Stm::Alloc {
                    lvar,
                    desc,
                    fields,
                    cont,
                })
            }
            2 => {
                let lvar = self.lvar()?;
                let op = self.arith_op()?;
                let sz = self.varint()? as u32;
                let a = self.exp()?;
                let b = self.exp()?;
                let cont = Box::new(self.stm()?);
                Ok(Stm::Arith {
                    lvar,
                    op,
                    sz,
                    a,
                    b,
                    cont,
                })
            }
            3 => {
                let lab = self.lvar()?;
                let args = self.exps()?;
                Ok(Stm::Goto { lab, args })
            }
            4 => {
                let kind = self.frag_kind()?;
                let f = self.exp()?;
                let args = self.exps()?;
                Ok(Stm::Apply { kind, f, args })
            }
            5 => {
                let k = self.exp()?;
                let args = self.exps()?;
                Ok(Stm::Throw { k, args })
            }
            6 => {
                let cmp = self.cmp_op()?;
                let a = self.exp()?;
                let b = self.exp()?;
                // per-mille probability of the true arm; 0 means unannotated
                let prob_offset = self.pos;
                let prob = match self.varint()? {
                    0 => None,
                    p if (1..=999).contains(&p) => Some(p as u32),
                    p => {
                        return Err(PickleError::OutOfRange {
                            what: "branch probability",
                            value: p,
                            offset: prob_offset,
                        })
                    }
                };
                let t = Box::new(self.stm()?);
                let f = Box::new(self.stm()?);
                Ok(Stm::Branch {
                    cmp,
                    a,
                    b,
                    prob,
                    t,
                    f,
                })
            }
            7 => {
                let roots = self.exps()?;
                let n = self.count()?;
                let mut new_roots = Vec::with_capacity(n);
                for _ in 0..n {
                    new_roots.push(self.lvar()?);
                }
                let cont = Box::new(self.stm()?);
                Ok(Stm::CallGc {
                    roots,
                    new_roots,
                    cont,
                })
            }
            8 => Ok(Stm::Halt),
            _ => Err(PickleError::BadTag {
                what: "statement",
                tag,
                offset,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test-local writer; the production encoder lives in the front end.
    struct Writer {
        out: Vec<u8>,
    }

    impl Writer {
        fn new() -> Self {
            let mut w = Writer { out: Vec::new() };
            w.out.extend_from_slice(MAGIC);
            w.out.push(VERSION);
            w
        }

        fn varint(&mut self, mut v: u64) {
            loop {
                let b = (v & 0x7f) as u8;
                v >>= 7;
                if v == 0 {
                    self.out.push(b);
                    return;
                }
                self.out.push(b | 0x80);
            }
        }

        fn svarint(&mut self, v: i64) {
            self.varint(((v << 1) ^ (v >> 63)) as u64);
        }

        fn string(&mut self, s: &str) {
            self.varint(s.len() as u64);
            self.out.extend_from_slice(s.as_bytes());
        }

        fn frag_kind(&mut self, k: FragKind) {
            self.out.push(match k {
                FragKind::StdFun => 0,
                FragKind::StdCont => 1,
                FragKind::KnownFun => 2,
                FragKind::Internal => 3,
            });
        }

        fn ty(&mut self, t: Ty) {
            match t {
                Ty::Num(sz) => {
                    self.out.push(0);
                    self.varint(u64::from(sz));
                }
                Ty::Flt(sz) => {
                    self.out.push(1);
                    self.varint(u64::from(sz));
                }
                Ty::Ptr => self.out.push(2),
                Ty::Lab => self.out.push(3),
            }
        }

        fn exp(&mut self, e: &Exp) {
            match e {
                Exp::Var(lv) => {
                    self.out.push(0);
                    self.varint(u64::from(*lv));
                }
                Exp::Label(lab) => {
                    self.out.push(1);
                    self.varint(u64::from(*lab));
                }
                Exp::Num { sz, v } => {
                    self.out.push(2);
                    self.varint(u64::from(*sz));
                    self.svarint(*v);
                }
                Exp::Real { sz, v } => {
                    self.out.push(3);
                    self.varint(u64::from(*sz));
                    self.out.extend_from_slice(&v.to_bits().to_le_bytes());
                }
                Exp::Pure { op, sz, args } => {
                    self.out.push(4);
                    self.out.push(*op as u8);
                    self.varint(u64::from(*sz));
                    self.exps(args);
                }
                Exp::Select { idx, arg } => {
                    self.out.push(5);
                    self.varint(u64::from(*idx));
                    self.exp(arg);
                }
            }
        }

        fn exps(&mut self, args: &[Exp]) {
            self.varint(args.len() as u64);
            for a in args {
                self.exp(a);
            }
        }

        fn stm(&mut self, s: &Stm) {
            match s {
                Stm::Let { lvar, exp, cont } => {
                    self.out.push(0);
                    self.varint(u64::from(*lvar));
                    self.exp(exp);
                    self.stm(cont);
                }
                Stm::Alloc {
                    lvar,
                    desc,
                    fields,
                    cont,
                } => {
                    self.out.push(1);
                    self.varint(u64::from(*lvar));
                    self.varint(*desc);
                    self.exps(fields);
                    self.stm(cont);
                }
                Stm::Arith {
                    lvar,
                    op,
                    sz,
                    a,
                    b,
                    cont,
                } => {
                    self.out.push(2);
                    self.varint(u64::from(*lvar));
                    self.out.push(*op as u8);
                    self.varint(u64::from(*sz));
                    self.exp(a);
                    self.exp(b);
                    self.stm(cont);
                }
                Stm::Goto { lab, args } => {
                    self.out.push(3);
                    self.varint(u64::from(*lab));
                    self.exps(args);
                }
                Stm::Apply { kind, f, args } => {
                    self.out.push(4);
                    self.frag_kind(*kind);
                    self.exp(f);
                    self.exps(args);
                }
                Stm::Throw { k, args } => {
                    self.out.push(5);
                    self.exp(k);
                    self.exps(args);
                }
                Stm::Branch {
                    cmp,
                    a,
                    b,
                    prob,
                    t,
                    f,
                } => {
                    self.out.push(6);
                    self.out.push(*cmp as u8);
                    self.exp(a);
                    self.exp(b);
                    self.varint(u64::from(prob.unwrap_or(0)));
                    self.stm(t);
                    self.stm(f);
                }
                Stm::CallGc {
                    roots,
                    new_roots,
                    cont,
                } => {
                    self.out.push(7);
                    self.exps(roots);
                    self.varint(new_roots.len() as u64);
                    for lv in new_roots {
                        self.varint(u64::from(*lv));
                    }
                    self.stm(cont);
                }
                Stm::Halt => self.out.push(8),
            }
        }

        fn unit(&mut self, u: &CompUnit) {
            self.string(&u.src_name);
            self.varint(u.clusters.len() as u64);
            for c in &u.clusters {
                self.varint(c.frags.len() as u64);
                for frag in &c.frags {
                    self.varint(u64::from(frag.lab));
                    self.frag_kind(frag.kind);
                    self.varint(frag.params.len() as u64);
                    for p in &frag.params {
                        self.varint(u64::from(p.lvar));
                        self.ty(p.ty);
                    }
                    self.stm(&frag.body);
                }
            }
        }
    }

    fn sample_unit() -> CompUnit {
        CompUnit {
            src_name: "sample.sml".to_string(),
            clusters: vec![Cluster {
                frags: vec![
                    Frag {
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
                        body: Stm::Let {
                            lvar: 4,
                            exp: Exp::Pure {
                                op: PureOp::Add,
                                sz: 64,
                                args: vec![Exp::Var(3), Exp::Num { sz: 64, v: -7 }],
                            },
                            cont: Box::new(Stm::Alloc {
                                lvar: 5,
                                desc: 0x82,
                                fields: vec![Exp::Var(4), Exp::Select {
                                    idx: 1,
                                    arg: Box::new(Exp::Var(2)),
                                }],
                                cont: Box::new(Stm::Goto {
                                    lab: 10,
                                    args: vec![Exp::Var(5)],
                                }),
                            }),
                        },
                    },
                    Frag {
                        lab: 10,
                        kind: FragKind::Internal,
                        params: vec![Param {
                            lvar: 11,
                            ty: Ty::Ptr,
                        }],
                        body: Stm::Branch {
                            cmp: CmpOp::SLt,
                            a: Exp::Var(11),
                            b: Exp::Num { sz: 64, v: 0 },
                            prob: Some(10),
                            t: Box::new(Stm::Halt),
                            f: Box::new(Stm::Throw {
                                k: Exp::Var(11),
                                args: vec![Exp::Real { sz: 64, v: 2.5 }],
                            }),
                        },
                    },
                ],
            }],
        }
    }

    #[test]
    fn round_trip() {
        let unit = sample_unit();
        let mut w = Writer::new();
        w.unit(&unit);
        let decoded = read(&w.out).unwrap();
        assert_eq!(decoded, unit);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut w = Writer::new();
        w.unit(&sample_unit());
        w.out[0] = b'X';
        assert!(matches!(read(&w.out), Err(PickleError::BadMagic)));
    }

    #[test]
    fn truncation_is_detected() {
        let mut w = Writer::new();
        w.unit(&sample_unit());
        w.out.truncate(w.out.len() - 3);
        match read(&w.out) {
            Err(PickleError::Truncated { .. }) => {}
            other => panic!("expected truncation error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_cluster_count_is_rejected() {
        // a short input claiming u64::MAX clusters must be a decode error,
        // not an allocation of that capacity
        let mut w = Writer::new();
        w.string("u");
        w.varint(u64::MAX);
        match read(&w.out) {
            Err(PickleError::Truncated { .. }) => {}
            other => panic!("expected truncation error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_string_length_is_rejected() {
        let mut w = Writer::new();
        w.varint(1 << 60); // declared source-name length
        match read(&w.out) {
            Err(PickleError::Truncated { .. }) => {}
            other => panic!("expected truncation error, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_branch_probability_is_rejected() {
        let unit = CompUnit {
            src_name: "p.sml".to_string(),
            clusters: vec![Cluster {
                frags: vec![Frag {
                    lab: 1,
                    kind: FragKind::StdFun,
                    params: vec![],
                    body: Stm::Branch {
                        cmp: CmpOp::Eq,
                        a: Exp::Num { sz: 64, v: 0 },
                        b: Exp::Num { sz: 64, v: 0 },
                        prob: Some(1000),
                        t: Box::new(Stm::Halt),
                        f: Box::new(Stm::Halt),
                    },
                }],
            }],
        };
        let mut w = Writer::new();
        w.unit(&unit);
        match read(&w.out) {
            Err(PickleError::OutOfRange { what, value, .. }) => {
                assert_eq!(what, "branch probability");
                assert_eq!(value, 1000);
            }
            other => panic!("expected out-of-range error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut w = Writer::new();
        w.string("u");
        w.varint(1); // one cluster
        w.varint(1); // one fragment
        w.varint(1); // label
        w.out.push(9); // invalid fragment kind
        match read(&w.out) {
            Err(PickleError::BadTag { what, tag, .. }) => {
                assert_eq!(what, "fragment kind");
                assert_eq!(tag, 9);
            }
            other => panic!("expected bad-tag error, got {other:?}"),
        }
    }
}
