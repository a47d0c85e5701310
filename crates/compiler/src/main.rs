//! fbc CLI.
//!
//! `fbc [flags] input.bas` — compile a BASIC source file to an executable,
//! or stop early at IL / assembly / object stages. Dump flags print a
//! phase's output and exit; the TRACE_* environment variables additionally
//! mirror those dumps onto the diagnostic stream during a normal build.

use clap::{CommandFactory, Parser as ClapParser};
use clap_complete::{Shell, generate};
use fbc::{AnalyzerOptions, CompileError, CompileOptions, Stage, Target};
use std::io;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "fbc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "BASIC compiler targeting the QBE intermediate language", long_about = None)]
struct Cli {
    /// Input .bas source file
    input: Option<PathBuf>,

    /// Output path (defaults to the input stem)
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<PathBuf>,

    /// Stop after emitting IL
    #[arg(short = 'i')]
    stop_il: bool,

    /// Stop after assembly
    #[arg(short = 's')]
    stop_asm: bool,

    /// Stop after the object file
    #[arg(short = 'c')]
    stop_obj: bool,

    /// Dump the AST and exit
    #[arg(short = 'A')]
    dump_ast: bool,

    /// Dump the CFGs and exit
    #[arg(short = 'G')]
    dump_cfg: bool,

    /// Dump the symbol table and exit
    #[arg(short = 'S')]
    dump_symbols: bool,

    /// Verbose diagnostics
    #[arg(short = 'D')]
    verbose: bool,

    /// Backend target
    #[arg(short = 't', value_name = "TARGET")]
    target: Option<String>,

    /// Generate shell completions and exit
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help/version are not usage errors.
            let code = if e.use_stderr() { 1 } else { 0 };
            e.print().ok();
            process::exit(code);
        }
    };

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "fbc", &mut io::stdout());
        process::exit(0);
    }

    init_tracing(cli.verbose);

    let Some(input) = cli.input.clone() else {
        eprintln!("fbc: no input file");
        process::exit(1);
    };

    let target = match &cli.target {
        None => fbc::host_target(),
        Some(name) => match Target::from_name(name) {
            Some(t) => t,
            None => {
                eprintln!(
                    "fbc: unknown target {} (expected arm64_apple, amd64_sysv, amd64_apple, or rv64)",
                    name
                );
                process::exit(1);
            }
        },
    };

    let stage = if cli.stop_il {
        Stage::Il
    } else if cli.stop_asm {
        Stage::Assembly
    } else if cli.stop_obj {
        Stage::Object
    } else {
        Stage::Executable
    };

    let options = CompileOptions {
        target,
        stage,
        output: cli.output.clone(),
        analyzer: AnalyzerOptions::default(),
    };

    let file_name = input.display().to_string();
    let source = match std::fs::read_to_string(&input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("fbc: cannot read {}: {}", file_name, e);
            process::exit(1);
        }
    };

    // Dump-and-exit flags.
    if cli.dump_ast {
        finish_dump(fbc::dump_ast(&source), &file_name);
    }
    if cli.dump_cfg {
        finish_dump(fbc::dump_cfg(&source, &options.analyzer), &file_name);
    }
    if cli.dump_symbols {
        finish_dump(fbc::dump_symbols(&source, &options.analyzer), &file_name);
    }

    // TRACE_* environment switches mirror dumps to stderr during a build.
    if env_enabled("TRACE_AST")
        && let Ok(dump) = fbc::dump_ast(&source)
    {
        eprintln!("{}", dump);
    }
    if env_enabled("TRACE_CFG")
        && let Ok(dump) = fbc::dump_cfg(&source, &options.analyzer)
    {
        eprintln!("{}", dump);
    }
    if env_enabled("TRACE_SYMBOLS")
        && let Ok(dump) = fbc::dump_symbols(&source, &options.analyzer)
    {
        eprintln!("{}", dump);
    }

    match fbc::compile_file(&input, &options) {
        Ok(()) => {}
        Err(err) => {
            eprintln!("{}", err.render(&file_name));
            process::exit(err.exit_code());
        }
    }
}

fn env_enabled(name: &str) -> bool {
    std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}

fn finish_dump(result: Result<String, CompileError>, file_name: &str) -> ! {
    match result {
        Ok(dump) => {
            println!("{}", dump);
            process::exit(0);
        }
        Err(err) => {
            eprintln!("{}", err.render(file_name));
            process::exit(err.exit_code());
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
