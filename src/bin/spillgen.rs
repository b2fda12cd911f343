//! Command-line driver: allocate every function of a text IR file.
//!
//! ```text
//! spillgen FILE [--regs LIST] [--check] [--emit] [-v]
//! ```
//!
//! The allocated functions are printed in the input format. `--check` runs
//! the verifier and compares interpreter behaviour before and after
//! allocation; `--emit` also assembles each function and prints the bytes.

use bumpalo::Bump;
use clap::{ArgAction, Parser};
use spillgen::core::{AllocatorConfig, CompilationSession};
use spillgen::ia32::emit_function;
use spillgen::ir::{interp, verify};
use spillgen::spillgen::SpillGen;
use spillgen::test_ir::parse_module;
use std::fs;
use std::path::PathBuf;
use std::process;

/// Per-block constrained register allocator for IA-32.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Arguments {
    /// Text IR file to allocate.
    path: PathBuf,

    /// Allocatable registers: `ALL` or a comma separated list.
    #[arg(long)]
    regs: Option<String>,

    /// Verify the result and compare interpreter traces.
    #[arg(long, action = ArgAction::SetTrue)]
    check: bool,

    /// Assemble the allocated code and print it as hex.
    #[arg(long, action = ArgAction::SetTrue)]
    emit: bool,

    /// Raise the log level; repeat for more detail.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Arguments::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let mut config = AllocatorConfig::from_env()?;
    if let Some(regs) = &args.regs {
        config.regs = regs.clone();
    }

    let text = fs::read_to_string(&args.path)?;
    let mut functions = match parse_module(&text) {
        Ok(functions) => functions,
        Err(e) => {
            eprintln!("{}: {}", args.path.display(), e);
            process::exit(1);
        }
    };

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut failed = false;

    for func in &mut functions {
        let before = if args.check {
            Some(interp::run(func))
        } else {
            None
        };

        let mut allocator = SpillGen::new(&session, &config)?;
        let stats = match allocator.run(func) {
            Ok(stats) => stats,
            Err(e) => {
                eprintln!("Error in {}: {}", func.name, e);
                failed = true;
                continue;
            }
        };
        print!("{func}");
        log::info!(
            "{}: {} moves, {} slots, {} evictions, {} repairs",
            func.name,
            stats.moves,
            stats.slots,
            stats.evictions,
            stats.repairs
        );

        if let Some(before) = before {
            if let Err(e) = verify::verify(func) {
                eprintln!("Error in {}: {}", func.name, e);
                failed = true;
            }
            let after = interp::run(func);
            match (&before, &after) {
                (Ok(b), Ok(a)) if b == a => {}
                (Err(_), _) => log::warn!("{}: original does not run: {:?}", func.name, before),
                _ => {
                    eprintln!(
                        "Error in {}: behaviour changed: {:?} became {:?}",
                        func.name, before, after
                    );
                    failed = true;
                }
            }
        }

        if args.emit {
            match emit_function(func, &arena) {
                Ok(code) => println!("; {} bytes: {}", code.len(), hex(&code)),
                Err(e) => {
                    eprintln!("Error in {}: {}", func.name, e);
                    failed = true;
                }
            }
        }
    }

    if args.verbose > 0 {
        eprint!("{}", session.stats());
        eprint!("{}", session.report_counters());
    }
    if failed {
        process::exit(1);
    }
    Ok(())
}
