//! cfgcg - CFG code generation for a managed-runtime back end.
//!
//! This crate translates a compilation unit in a first-order CFG intermediate
//! representation into native machine code packaged as a heap-loadable code
//! object. Translation builds LLVM IR (through inkwell) under a
//! jump-with-arguments calling convention that threads the runtime's special
//! registers through every transfer; the resulting module is optimized and
//! emitted in memory, and the object file is repackaged into one contiguous,
//! position-independent blob with all relocations resolved.
//!
//! # Usage
//!
//! ```ignore
//! use cfgcg::{codegen_unit, pickle, CodegenContext, TargetInfo};
//! use inkwell::context::Context;
//!
//! let unit = pickle::read(&bytes)?;
//! let llvm = Context::create();
//! let mut cx = CodegenContext::new(&llvm, TargetInfo::native())?;
//! codegen_unit(&mut cx, &unit);
//! cx.optimize()?;
//! let code_obj = cx.compile()?;
//! let mut mem = vec![0u8; code_obj.size()];
//! code_obj.get_code(&mut mem)?;
//! cx.end_module();
//! ```
//!
//! # Architecture
//!
//! - [`target`] - immutable per-architecture descriptors
//! - [`regs`] - runtime-register convention state
//! - [`context`] - the stateful translation context
//! - [`cfg`] - the compilation-unit model and node translation
//! - [`mcgen`] - target machine, optimizer, and code emitter
//! - [`code_object`] - heap code-object construction and relocation patching
//! - [`pickle`] - compilation-unit decoder

pub mod cfg;
pub mod code_object;
pub mod context;
pub mod error;
pub mod mcgen;
pub mod pickle;
pub mod regs;
pub mod target;

pub use cfg::{codegen_unit, CompUnit};
pub use code_object::CodeObject;
pub use context::CodegenContext;
pub use error::{CodegenError, CodegenResult, CodeObjectError, PickleError};
pub use mcgen::McGen;
pub use regs::{CmRegId, CmRegState, CmRegs};
pub use target::TargetInfo;
