// This module wraps the machine-specific parts of the LLVM code generator behind the
// McGen type. Construction initializes the LLVM target backend for the requested
// architecture, looks the target up in the registry by triple, and creates a
// TargetMachine configured for position-independent code at a low optimization level
// (register allocation quality matters more than mid-level optimization here; the
// translation context emits IR that is already close to final shape). beginModule
// attaches the triple and data layout to a fresh module; optimize runs a fixed,
// ordered per-function pass pipeline (simplification, instruction combining,
// re-association, constant propagation, early CSE, GVN, DCE, then repeated
// simplification/combining) via the new pass manager; compile drives the emitter into
// an in-memory object-file buffer; dumpCode writes assembly or an object file to disk,
// choosing the extension by output kind. Per-module optimizer state is scoped between
// beginModule and endModule, and an McGen must never be reused across an architecture
// switch.

//! Wrapper for the low-level machine-specific parts of the code generator.

use inkwell::module::Module;
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{
    CodeModel, FileType, InitializationConfig, RelocMode, Target, TargetMachine, TargetTriple,
};
use inkwell::OptimizationLevel;
use log::debug;

use crate::error::{CodegenError, CodegenResult};
use crate::target::{Arch, TargetInfo};

/// The per-function optimization pipeline. The order is fixed; repeated
/// simplification/combining passes clean up after GVN and DCE.
const OPT_PIPELINE: &str = "function(simplifycfg,instcombine,reassociate,sccp,early-cse,gvn,dce,simplifycfg,instcombine,simplifycfg)";

/// Owns the LLVM target-machine configuration and the per-function optimizer
/// for one target architecture.
pub struct McGen {
    target: &'static TargetInfo,
    machine: TargetMachine,
}

impl McGen {
    /// Configure the code generator for the given target.
    pub fn new(target: &'static TargetInfo) -> CodegenResult<Self> {
        match target.arch {
            Arch::X86_64 => Target::initialize_x86(&InitializationConfig::default()),
            Arch::Aarch64 => Target::initialize_aarch64(&InitializationConfig::default()),
        }

        let triple_name = target.triple_name();
        let triple = TargetTriple::create(&triple_name);
        let llvm_target =
            Target::from_triple(&triple).map_err(|e| CodegenError::TargetLookup {
                triple: triple_name.clone(),
                reason: e.to_string(),
            })?;

        // Tail calls in the fragment calling convention are guaranteed by the
        // convention itself, so no special target options are needed.
        let machine = llvm_target
            .create_target_machine(
                &triple,
                "generic",
                "",
                OptimizationLevel::Less,
                RelocMode::PIC,
                CodeModel::Default,
            )
            .ok_or(CodegenError::TargetMachine {
                triple: triple_name,
            })?;

        Ok(McGen { target, machine })
    }

    pub fn target(&self) -> &'static TargetInfo {
        self.target
    }

    /// Attach the target triple and data layout to a new module.
    pub fn begin_module(&self, module: &Module<'_>) {
        module.set_triple(&self.machine.get_triple());
        module.set_data_layout(&self.machine.get_target_data().get_data_layout());
    }

    /// Release per-module optimizer state.
    pub fn end_module(&self) {
        // The new pass manager holds no state between runs; nothing to drop.
    }

    /// Run the fixed optimization pipeline over every function in the module.
    pub fn optimize(&self, module: &Module<'_>) -> CodegenResult<()> {
        debug!("optimizing module {:?}", module.get_name());
        module
            .run_passes(OPT_PIPELINE, &self.machine, PassBuilderOptions::create())
            .map_err(|e| CodegenError::Optimize {
                reason: e.to_string(),
            })
    }

    /// Compile the module to an in-memory object file.
    pub fn compile(&self, module: &Module<'_>) -> CodegenResult<Vec<u8>> {
        let buf = self
            .machine
            .write_to_memory_buffer(module, FileType::Object)
            .map_err(|e| CodegenError::Emit {
                reason: e.to_string(),
            })?;
        debug!("emitted {} bytes of object file", buf.get_size());
        Ok(buf.as_slice().to_vec())
    }

    /// Write assembly (`.s`) or an object file (`.o`) for the given path
    /// stem. A stem of `-` prints assembly to stdout.
    pub fn dump_code(&self, module: &Module<'_>, stem: &str, asm_code: bool) -> CodegenResult<()> {
        if stem == "-" && asm_code {
            let buf = self
                .machine
                .write_to_memory_buffer(module, FileType::Assembly)
                .map_err(|e| CodegenError::Emit {
                    reason: e.to_string(),
                })?;
            print!("{}", String::from_utf8_lossy(buf.as_slice()));
            return Ok(());
        }

        let out_file = if stem == "-" {
            "out.o".to_string()
        } else if asm_code {
            format!("{stem}.s")
        } else {
            format!("{stem}.o")
        };
        let kind = if asm_code {
            FileType::Assembly
        } else {
            FileType::Object
        };
        self.machine
            .write_to_file(module, kind, out_file.as_ref())
            .map_err(|e| CodegenError::OutputFile {
                path: out_file,
                reason: e.to_string(),
            })
    }
}
