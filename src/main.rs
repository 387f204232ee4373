// File: src/main.rs
//
// Entry point: argument parsing and dispatch to one-liner / script / REPL
// execution, with the exit codes spec §6/§7 assign to each error kind.

mod chunk;
mod compiler;
mod errors;
mod falcon_map;
mod heap;
mod natives;
mod object;
mod repl;
mod scanner;
mod value;
mod vm;

use clap::Parser as ClapParser;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use errors::ErrorKind;
use vm::Vm;

const EXIT_USAGE: u8 = 1;
const EXIT_COMPILE: u8 = 2;
const EXIT_RUNTIME: u8 = 3;
const EXIT_MEMORY: u8 = 4;
const EXIT_OS: u8 = 5;

/// Falcon: a small dynamically-typed scripting language.
#[derive(ClapParser)]
#[command(name = "falcon", version, about = "Falcon: a small dynamically-typed scripting language", long_about = None)]
struct Cli {
    /// Interpret <code> and exit
    #[arg(short = 'i', value_name = "code")]
    inline: Option<String>,

    /// Script file to run. Starts the REPL when omitted.
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            print!("{}", e);
            let code = if e.exit_code() == 0 { ExitCode::SUCCESS } else { ExitCode::from(EXIT_USAGE) };
            return code;
        }
    };

    if let Some(code) = cli.inline {
        return run_source(&code, "<inline>");
    }

    if let Some(path) = cli.script {
        return run_file(&path);
    }

    match repl::Repl::new() {
        Ok(mut repl) => {
            if let Err(e) = repl.run() {
                eprintln!("REPL error: {}", e);
                return ExitCode::from(EXIT_OS);
            }
        }
        Err(e) => {
            eprintln!("Failed to start REPL: {}", e);
            return ExitCode::from(EXIT_OS);
        }
    }
    ExitCode::SUCCESS
}

fn run_file(path: &PathBuf) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("falcon: cannot open '{}': {}", path.display(), e);
            return ExitCode::from(EXIT_OS);
        }
    };
    run_source(&source, &path.to_string_lossy())
}

fn run_source(source: &str, file_name: &str) -> ExitCode {
    let mut vm = Vm::new(file_name, false);
    natives::register_all(&mut vm);

    let function = match compiler::Compiler::compile(source, file_name, &mut vm.heap, false) {
        Ok(f) => f,
        Err(errs) => {
            for err in &errs {
                eprint!("{}", err);
            }
            return ExitCode::from(EXIT_COMPILE);
        }
    };

    match vm.interpret(function) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", err);
            let code = match err.kind {
                ErrorKind::Compile => EXIT_COMPILE,
                ErrorKind::Runtime => EXIT_RUNTIME,
            };
            ExitCode::from(code)
        }
    }
}

// EXIT_MEMORY (4) is reserved for allocation failure. Stable Rust aborts the
// process on OOM rather than unwinding, so there is no call site for it here;
// it is kept for documentation parity with spec §6's exit-code table.
#[allow(dead_code)]
const _: u8 = EXIT_MEMORY;
