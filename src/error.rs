// This module defines the error types for the cfgcg back end using the thiserror crate
// for idiomatic Rust error handling. CodegenError covers the reportable failures of the
// translation context and target-machine wrapper: unknown target names, target-machine
// configuration failures, and code-emission failures. CodeObjectError covers the heap
// code-object builder: object-file parse errors, objects with no usable sections,
// relocations that reference excluded sections or undefined symbols, and relocation
// types the target patcher does not understand. PickleError covers decode failures in
// the compilation-unit reader. Each variant carries enough context (names, offsets,
// raw type codes) to diagnose the failure from the driver's error report alone. True
// invariant violations (module reuse, missing base pointer) are panics, not errors,
// since compilation is deterministic and there is no recovery path inside codegen.

//! Error types for the CFG code generator.
//!
//! Reportable failures are surfaced as `Result` values to the driver;
//! invariant violations inside code generation panic instead.

use thiserror::Error;

/// Errors from the translation context and the target-machine wrapper.
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("unknown target \"{name}\"")]
    UnknownTarget { name: String },

    #[error("unable to find LLVM target for \"{triple}\": {reason}")]
    TargetLookup { triple: String, reason: String },

    #[error("unable to create target machine for \"{triple}\"")]
    TargetMachine { triple: String },

    #[error("code emission failed: {reason}")]
    Emit { reason: String },

    #[error("optimization pipeline failed: {reason}")]
    Optimize { reason: String },

    #[error("unable to write output file '{path}': {reason}")]
    OutputFile { path: String, reason: String },

    #[error(transparent)]
    CodeObject(#[from] CodeObjectError),
}

/// Errors from building a heap code object out of a native object file.
#[derive(Error, Debug)]
pub enum CodeObjectError {
    #[error("unable to parse object file: {0}")]
    Parse(#[from] object::read::Error),

    #[error("no useful sections in object file")]
    NoSections,

    #[error("unsupported architecture/format pair: {arch} / {format}")]
    UnsupportedTarget { arch: String, format: String },

    #[error("relocation at {addr:#x} targets undefined symbol \"{symbol}\"")]
    UndefinedSymbol { addr: u64, symbol: String },

    #[error("relocation at {addr:#x} targets excluded section \"{section}\"")]
    ExcludedSection { addr: u64, section: String },

    #[error("unsupported relocation {name} (type {ty:#x}) at {addr:#x}")]
    UnsupportedRelocation { name: String, ty: u64, addr: u64 },

    #[error("output buffer is {got} bytes; code object needs {need}")]
    BufferTooSmall { got: usize, need: usize },
}

/// Errors from decoding a pickled compilation unit.
#[derive(Error, Debug)]
pub enum PickleError {
    #[error("bad magic number in pickle")]
    BadMagic,

    #[error("truncated pickle at offset {offset}")]
    Truncated { offset: usize },

    #[error("bad tag {tag:#x} for {what} at offset {offset}")]
    BadTag {
        what: &'static str,
        tag: u8,
        offset: usize,
    },

    #[error("value {value} out of range for {what} at offset {offset}")]
    OutOfRange {
        what: &'static str,
        value: u64,
        offset: usize,
    },

    #[error("invalid utf-8 in string at offset {offset}")]
    BadString { offset: usize },
}

/// Result type alias for codegen operations.
pub type CodegenResult<T> = Result<T, CodegenError>;
