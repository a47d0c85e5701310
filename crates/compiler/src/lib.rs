//! fbc compiler library.
//!
//! Pipeline: source text → tokens → AST → semantic analysis → one CFG per
//! unit → typed IL → external backend. The backend stages shell out to the
//! `qbe` assembler-IL compiler and the system C compiler; the runtime
//! static library is embedded into this binary at build time and extracted
//! next to the intermediate files when linking.

pub mod ast;
pub mod cfg;
pub mod codegen;
pub mod diag;
pub mod il;
pub mod lexer;
pub mod parser;
pub mod semantics;
pub mod symbols;
pub mod types;

pub use cfg::{Cfg, build_unit_cfg};
pub use diag::{CompileError, Diagnostic, Diagnostics, ErrorKind};
pub use il::Target;
pub use parser::Parser;
pub use semantics::{AnalyzedProgram, AnalyzerOptions, analyze};
pub use types::{BaseType, Coercion, TypeDescriptor, check_coercion, promote};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use tracing::debug;

/// Embedded runtime library (built by build.rs from the fbc-runtime crate).
static RUNTIME_LIB: &[u8] = include_bytes!(env!("FBC_RUNTIME_LIB_PATH"));

/// How far the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `-i`: stop after IL.
    Il,
    /// `-s`: stop after assembly.
    Assembly,
    /// `-c`: stop after the object file.
    Object,
    /// Link a full executable.
    Executable,
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub target: Target,
    pub stage: Stage,
    pub output: Option<PathBuf>,
    pub analyzer: AnalyzerOptions,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            target: host_target(),
            stage: Stage::Executable,
            output: None,
            analyzer: AnalyzerOptions::default(),
        }
    }
}

/// Best-fitting backend target for the machine the compiler runs on.
pub fn host_target() -> Target {
    if cfg!(target_os = "macos") {
        if cfg!(target_arch = "aarch64") {
            Target::Arm64Apple
        } else {
            Target::Amd64Apple
        }
    } else if cfg!(target_arch = "riscv64") {
        Target::Rv64
    } else {
        Target::Amd64Sysv
    }
}

/// Front end: parse and analyze. Returns the annotated program and any
/// warnings; errors abort with the phase's taxonomy.
pub fn analyze_source(
    source: &str,
    options: &AnalyzerOptions,
) -> Result<(AnalyzedProgram, Vec<Diagnostic>), CompileError> {
    let (program, parse_diags) = Parser::new(source).parse();
    if parse_diags.has_errors() {
        return Err(CompileError::Syntax(parse_diags.into_vec()));
    }
    let mut warnings: Vec<Diagnostic> = parse_diags.into_vec();
    let (analyzed, sem_diags) = analyze(program, *options);
    match analyzed {
        Some(analyzed) => {
            warnings.extend(sem_diags.into_vec());
            Ok((analyzed, warnings))
        }
        None => Err(CompileError::Semantic(sem_diags.into_vec())),
    }
}

/// Compile source text to IL text. No partial IL is produced when any
/// semantic or codegen error is present.
pub fn compile_to_il(source: &str, options: &CompileOptions) -> Result<String, CompileError> {
    let (analyzed, _warnings) = analyze_source(source, &options.analyzer)?;
    let module = codegen::emit_program(
        &analyzed,
        &codegen::CodegenOptions {
            target: options.target,
        },
    )
    .map_err(CompileError::Codegen)?;
    Ok(module.to_string())
}

/// Compile a source file down to the requested stage.
pub fn compile_file(source_path: &Path, options: &CompileOptions) -> Result<(), CompileError> {
    let source = fs::read_to_string(source_path)
        .map_err(|e| CompileError::Usage(format!("cannot read {}: {}", source_path.display(), e)))?;
    let (analyzed, warnings) = analyze_source(&source, &options.analyzer)?;
    let file_name = source_path.display().to_string();
    for warning in &warnings {
        eprintln!("{}", warning.render(&file_name));
    }

    let module = codegen::emit_program(
        &analyzed,
        &codegen::CodegenOptions {
            target: options.target,
        },
    )
    .map_err(CompileError::Codegen)?;
    let il_text = module.to_string();

    let stem = source_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    let work_dir = source_path.parent().unwrap_or(Path::new(".")).to_path_buf();

    let il_path = match (&options.output, options.stage) {
        (Some(path), Stage::Il) => path.clone(),
        _ => work_dir.join(format!("{}.ssa", stem)),
    };
    fs::write(&il_path, &il_text)
        .map_err(|e| CompileError::Backend(format!("cannot write {}: {}", il_path.display(), e)))?;
    debug!(il = %il_path.display(), "IL written");
    if options.stage == Stage::Il {
        return Ok(());
    }

    check_backend_tools()?;

    // qbe: IL -> assembly.
    let asm_path = match (&options.output, options.stage) {
        (Some(path), Stage::Assembly) => path.clone(),
        _ => work_dir.join(format!("{}.s", stem)),
    };
    run_backend_step(
        Command::new("qbe")
            .arg("-t")
            .arg(options.target.name())
            .arg("-o")
            .arg(&asm_path)
            .arg(&il_path),
        "qbe",
    )?;
    fs::remove_file(&il_path).ok();
    if options.stage == Stage::Assembly {
        return Ok(());
    }

    // cc: assembly -> object.
    let obj_path = match (&options.output, options.stage) {
        (Some(path), Stage::Object) => path.clone(),
        _ => work_dir.join(format!("{}.o", stem)),
    };
    run_backend_step(
        Command::new("cc")
            .arg("-c")
            .arg(&asm_path)
            .arg("-o")
            .arg(&obj_path),
        "cc",
    )?;
    fs::remove_file(&asm_path).ok();
    if options.stage == Stage::Object {
        return Ok(());
    }

    // Link with the embedded runtime.
    let runtime_path = std::env::temp_dir().join("libfbc_runtime.a");
    {
        let mut file = fs::File::create(&runtime_path)
            .map_err(|e| CompileError::Backend(format!("cannot create runtime lib: {}", e)))?;
        file.write_all(RUNTIME_LIB)
            .map_err(|e| CompileError::Backend(format!("cannot write runtime lib: {}", e)))?;
    }
    let exe_path = options
        .output
        .clone()
        .unwrap_or_else(|| work_dir.join(&stem));
    let link_result = run_backend_step(
        Command::new("cc")
            .arg(&obj_path)
            .arg(&runtime_path)
            .arg("-lm")
            .arg("-lpthread")
            .arg("-o")
            .arg(&exe_path),
        "cc (link)",
    );
    fs::remove_file(&runtime_path).ok();
    fs::remove_file(&obj_path).ok();
    link_result?;
    debug!(exe = %exe_path.display(), "linked");
    Ok(())
}

/// One-shot availability probe for the external tools, cached per process.
static BACKEND_CHECKED: OnceLock<Result<(), String>> = OnceLock::new();

fn check_backend_tools() -> Result<(), CompileError> {
    BACKEND_CHECKED
        .get_or_init(|| {
            let qbe = Command::new("qbe").arg("-h").output();
            if qbe.is_err() {
                return Err(
                    "qbe not found; install qbe or stop after IL with -i".to_string(),
                );
            }
            let cc = Command::new("cc").arg("--version").output();
            if cc.is_err() {
                return Err("cc not found; a C toolchain is required for -s/-c/linking".to_string());
            }
            Ok(())
        })
        .clone()
        .map_err(CompileError::Backend)
}

fn run_backend_step(command: &mut Command, what: &str) -> Result<(), CompileError> {
    let output = command
        .output()
        .map_err(|e| CompileError::Backend(format!("failed to run {}: {}", what, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CompileError::Backend(format!(
            "{} failed with {:?}:\n{}",
            what,
            output.status.code(),
            stderr
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Dumps (-A, -G, -S and the TRACE_* environment switches)
// ----------------------------------------------------------------------

/// Parsed AST as JSON.
pub fn dump_ast(source: &str) -> Result<String, CompileError> {
    let (program, diags) = Parser::new(source).parse();
    if diags.has_errors() {
        return Err(CompileError::Syntax(diags.into_vec()));
    }
    serde_json::to_string_pretty(&program)
        .map_err(|e| CompileError::Internal(format!("AST dump failed: {}", e)))
}

/// CFG dump for every unit, in the text form the round-trip tests parse.
pub fn dump_cfg(source: &str, options: &AnalyzerOptions) -> Result<String, CompileError> {
    let (analyzed, _) = analyze_source(source, options)?;
    let mut out = String::new();
    for unit in &analyzed.units {
        let cfg = build_unit_cfg(unit).map_err(CompileError::Codegen)?;
        let name = if unit.is_main { "<main>" } else { &unit.name };
        out.push_str(&format!("unit {}\n", name));
        out.push_str(&cfg.dump_text());
    }
    Ok(out)
}

/// Symbol table as JSON.
pub fn dump_symbols(source: &str, options: &AnalyzerOptions) -> Result<String, CompileError> {
    let (analyzed, _) = analyze_source(source, options)?;
    serde_json::to_string_pretty(&analyzed.symbols)
        .map_err(|e| CompileError::Internal(format!("symbol dump failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn il_for(source: &str) -> String {
        compile_to_il(source, &CompileOptions::default()).expect("compiles")
    }

    #[test]
    fn emission_is_deterministic() {
        let src = "DIM s AS INTEGER\ns = 0\nFOR i = 10 TO 1 STEP -1\ns = s + i\nNEXT i\nPRINT s";
        assert_eq!(il_for(src), il_for(src));
    }

    #[test]
    fn no_il_on_semantic_error() {
        let err = compile_to_il("x = nosuchfn(1)", &CompileOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn no_il_on_syntax_error() {
        let err = compile_to_il("FOR = ", &CompileOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn for_negative_step_program_shape() {
        // E1: the FOR header carries the branchless predicate and PRINT
        // widens before calling the 64-bit runtime entry point.
        let il = il_for("10 DIM s AS INTEGER\n20 s = 0\n30 FOR i = 10 TO 1 STEP -1\n40 s = s + i\n50 NEXT i\n60 PRINT s");
        assert!(il.contains("export function w $main()"));
        assert!(il.contains("call $basic_print_int(l"));
        assert!(il.contains("extsw"), "w result sign-extends before print");
        assert!(il.contains("csgew") || il.contains("csgel"), "sign-of-step compare");
    }

    #[test]
    fn sgn_results_are_sign_extended_for_print() {
        // E4.
        let il = il_for("10 PRINT SGN(-5)\n20 PRINT SGN(0)\n30 PRINT SGN(5)");
        let extensions = il.matches("extsw").count();
        assert!(extensions >= 3, "each w result widens to l: {}", il);
    }

    #[test]
    fn gosub_produces_landing_dispatch() {
        // E3: two call sites, so RETURN dispatches over landing ids.
        let il = il_for("10 GOSUB 100\n15 PRINT \"A\"\n20 GOSUB 100\n25 PRINT \"B\"\n30 END\n100 PRINT \"S\"\n110 RETURN");
        assert!(il.contains("csltl"), "binary dispatch compare: {}", il);
        assert!(il.contains("alloc8 512"), "landing id stack in the frame");
    }

    #[test]
    fn string_cow_program_calls_slice_assign() {
        // E5.
        let il = il_for(
            "10 text$ = \"Hello World\"\n20 backup$ = text$\n30 text$(1 TO 5) = \"BASIC\"\n40 PRINT text$\n50 PRINT backup$",
        );
        assert!(il.contains("call $string_retain"));
        assert!(il.contains("call $string_slice_assign"));
        assert!(il.contains("call $string_release"));
    }

    #[test]
    fn on_gosub_out_of_range_falls_through() {
        // E6.
        let il = il_for(
            "10 x = 5\n20 ON x GOSUB 100, 200, 300\n30 PRINT \"after\"\n40 END\n100 PRINT \"1\" : RETURN\n200 PRINT \"2\" : RETURN\n300 PRINT \"3\" : RETURN",
        );
        assert!(il.contains("ceql"), "selector compares");
        assert!(il.contains("call $basic_end"));
    }

    #[test]
    fn power_lowered_through_pow() {
        let il = il_for("DIM a AS DOUBLE\na = 2.0 ^ 10.0\nPRINT a");
        assert!(il.contains("call $pow(d"));
    }

    #[test]
    fn signed_division_by_power_of_two_uses_shifts() {
        let il = il_for("DIM a AS INTEGER\na = -7\nPRINT a \\ 2");
        assert!(il.contains("sar"), "arithmetic shifts: {}", il);
        assert!(il.contains("shr"), "logical bias shift");
        assert!(!il.contains("=w div"), "no divide instruction for 2^k");
    }

    #[test]
    fn cfg_dump_round_trips_counts() {
        let dump = dump_cfg(
            "IF a = 1 THEN\nPRINT 1\nEND IF",
            &AnalyzerOptions::default(),
        )
        .unwrap();
        let header = dump
            .lines()
            .find(|l| l.starts_with("cfg:"))
            .expect("summary line");
        let blocks: usize = header
            .split(" blocks")
            .next()
            .and_then(|s| s.rsplit(' ').next())
            .and_then(|s| s.parse().ok())
            .expect("block count");
        let listed = dump.lines().filter(|l| l.starts_with("block ")).count();
        assert_eq!(blocks, listed);
    }

    #[test]
    fn try_tables_reach_the_module() {
        let il = il_for("TRY\nTHROW 5\nCATCH 5\nPRINT 1\nEND TRY");
        assert!(il.contains("call $basic_try_enter"));
        assert!(il.contains("call $basic_try_leave"));
        assert!(il.contains("data $try_table_main_0"));
    }

    #[test]
    fn data_segment_emitted() {
        let il = il_for("10 DATA 1, 2.5, \"x\"\n20 READ a\n30 PRINT a");
        assert!(il.contains("data $basic_data"));
        assert!(il.contains("call $basic_data_register"));
        assert!(il.contains("call $basic_data_read_int"));
    }

    #[test]
    fn fused_madd_only_on_supporting_targets() {
        let src = "DIM a AS DOUBLE, b AS DOUBLE, c AS DOUBLE\nPRINT c + a * b";
        let arm = compile_to_il(
            src,
            &CompileOptions {
                target: Target::Arm64Apple,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        let amd = compile_to_il(
            src,
            &CompileOptions {
                target: Target::Amd64Sysv,
                ..CompileOptions::default()
            },
        )
        .unwrap();
        assert!(arm.contains("fmadd"));
        assert!(!amd.contains("fmadd"));
    }
}
