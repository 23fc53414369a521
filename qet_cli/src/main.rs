//! qet interpreter command line.
//!
//! `qet` starts a REPL; `qet <path>` runs a script. Exit codes follow
//! the usual sysexits: 64 for usage errors, 65 for compile errors, 70
//! for runtime errors.
//!
//! The collector thread is spawned at startup and runs for the life of
//! the process; the main thread is the sole interpreter mutator.

use qet_vm::{InterpretError, Vm};
use std::io::{BufRead, Write};
use std::process::ExitCode;
use tracing_subscriber::filter::EnvFilter;

const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("QET_LOG").unwrap_or_else(|_| {
            EnvFilter::new("warn")
        }))
        .with_writer(std::io::stderr)
        .init();

    let config = qet_gc::GcConfig::default();
    let log_stats = config.log_stats;
    qet_gc::configure(config);
    qet_gc::collector::spawn();

    qet_gc::enter();
    let mut vm = Vm::new();

    let args: Vec<String> = std::env::args().collect();
    let code = match args.len() {
        1 => repl(&mut vm),
        2 => run_file(&mut vm, &args[1]),
        _ => {
            eprintln!("Usage: qet [path]");
            ExitCode::from(EXIT_USAGE)
        }
    };

    drop(vm);
    if log_stats {
        qet_gc::stats().print_summary();
    }
    qet_gc::leave();
    code
}

fn repl(vm: &mut Vm) -> ExitCode {
    println!("qet {}", qet_core::VERSION);
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                return ExitCode::SUCCESS;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("error reading input: {}", e);
                return ExitCode::SUCCESS;
            }
        }
        if let Err(error) = vm.interpret(&line) {
            eprintln!("{}", error);
        }
        // Give the collector a safepoint between inputs.
        if qet_gc::handshake() {
            vm.shade_roots();
        }
    }
}

fn run_file(vm: &mut Vm, path: &str) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Could not read file \"{}\": {}.", path, e);
            return ExitCode::from(EXIT_USAGE);
        }
    };
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(error)) => {
            eprintln!("{}", error);
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        Err(InterpretError::Runtime(error)) => {
            eprintln!("{}", error);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}
