// Command-line driver for the CFG code generator. Reads a pickled compilation unit,
// translates it to LLVM IR, runs verification (diagnostic) and the optimization
// pipeline, and then produces one of four outputs: assembly on stdout (default),
// an assembly file (-S), a native object file (-o), or an in-memory heap code
// object (-c), optionally hex-dumped with --bits. The target architecture is
// selectable by name and defaults to the host; an unknown name is reported before
// any code generation happens.

//! `cfgc` - compile a pickled CFG compilation unit to native code.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use inkwell::context::Context;
use log::{debug, info};

use cfgcg::{codegen_unit, pickle, CodegenContext, TargetInfo};

#[derive(Parser, Debug)]
#[command(name = "cfgc", about = "Compile a pickled CFG compilation unit to native code")]
struct Args {
    /// Write assembly to <stem>.s instead of stdout
    #[arg(short = 'S', conflicts_with_all = ["object", "code_object"])]
    asm: bool,

    /// Write a native object file to <stem>.o
    #[arg(short = 'o', conflicts_with = "code_object")]
    object: bool,

    /// Build the heap code object in memory and report its size
    #[arg(short = 'c')]
    code_object: bool,

    /// Dump the generated LLVM IR before optimization
    #[arg(long = "emit-llvm")]
    emit_llvm: bool,

    /// Hex-dump the patched heap code object (implies -c)
    #[arg(long)]
    bits: bool,

    /// Target architecture (defaults to the host)
    #[arg(long, value_name = "ARCH")]
    target: Option<String>,

    /// The pickled compilation unit
    file: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    // resolve the target before doing any work; an unknown name must not
    // reach code generation
    let target = match &args.target {
        None => TargetInfo::native(),
        Some(name) => match TargetInfo::for_name(name) {
            Some(t) => t,
            None => {
                eprintln!(
                    "cfgc: unknown target \"{}\"; supported targets: {}",
                    name,
                    TargetInfo::names().join(", ")
                );
                return ExitCode::FAILURE;
            }
        },
    };

    let bytes = match std::fs::read(&args.file) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("cfgc: unable to read {}: {e}", args.file.display());
            return ExitCode::FAILURE;
        }
    };
    let unit = match pickle::read(&bytes) {
        Ok(u) => u,
        Err(e) => {
            eprintln!("cfgc: {}: {e}", args.file.display());
            return ExitCode::FAILURE;
        }
    };
    info!(
        "read unit \"{}\" ({} clusters) for target {}",
        unit.src_name,
        unit.clusters.len(),
        target.name
    );

    let stem = args
        .file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());

    match run(&args, target, &unit, &stem) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cfgc: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(
    args: &Args,
    target: &'static TargetInfo,
    unit: &cfgcg::CompUnit,
    stem: &str,
) -> cfgcg::CodegenResult<()> {
    let llvm = Context::create();
    let mut cx = CodegenContext::new(&llvm, target)?;

    codegen_unit(&mut cx, unit);
    if args.emit_llvm {
        cx.dump_ir();
    }
    // verification failures are diagnostic; the module can still be dumped
    cx.verify();
    cx.optimize()?;
    cx.verify();

    if args.code_object || args.bits {
        let code_obj = cx.compile()?;
        println!("code object: {} bytes", code_obj.size());
        if args.bits {
            code_obj.dump(true);
        }
    } else if args.object {
        cx.dump_obj(stem)?;
    } else if args.asm {
        cx.dump_asm(stem)?;
    } else {
        cx.dump_asm_stdout()?;
    }

    debug!("done");
    cx.end_module();
    Ok(())
}
