//! Diagnostics and the compiler's error taxonomy.
//!
//! Each phase accumulates [`Diagnostic`]s and reports them together; only
//! the CFG builder and IL emitter stop at their first unrecoverable error.
//! The top-level [`CompileError`] carries the phase taxonomy and maps onto
//! the CLI exit codes.

use serde::Serialize;
use std::fmt;

/// What a diagnostic is complaining about. The kind (not the message
/// wording) is the contract; tests assert on kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    // Parse phase
    UnexpectedToken,
    UnterminatedString,
    BadNumber,
    // Semantic phase
    UndeclaredType,
    UndeclaredVariable,
    DuplicateSymbol,
    TypeMismatch,
    UnknownFunction,
    ArityMismatch,
    BadJumpTarget,
    ExitOutsideLoop,
    ContinueOutsideLoop,
    ReturnOutsideGosub,
    InvalidForPairing,
    InvalidTryNesting,
    LossyConversion,
    // Codegen phase
    UnsupportedConstruct,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Kinds print in the diagnostic line, so keep them short and stable.
        let name = match self {
            ErrorKind::UnexpectedToken => "unexpected token",
            ErrorKind::UnterminatedString => "unterminated string",
            ErrorKind::BadNumber => "bad number",
            ErrorKind::UndeclaredType => "undeclared type",
            ErrorKind::UndeclaredVariable => "undeclared variable",
            ErrorKind::DuplicateSymbol => "duplicate symbol",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::UnknownFunction => "unknown function",
            ErrorKind::ArityMismatch => "arity mismatch",
            ErrorKind::BadJumpTarget => "bad jump target",
            ErrorKind::ExitOutsideLoop => "EXIT outside matching construct",
            ErrorKind::ContinueOutsideLoop => "CONTINUE outside matching construct",
            ErrorKind::ReturnOutsideGosub => "RETURN outside GOSUB",
            ErrorKind::InvalidForPairing => "mismatched FOR/NEXT",
            ErrorKind::InvalidTryNesting => "mismatched TRY/CATCH/FINALLY",
            ErrorKind::LossyConversion => "lossy conversion",
            ErrorKind::UnsupportedConstruct => "unsupported construct",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Error,
}

/// One diagnostic with its source line (1-based; 0 when no line applies).
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub line: u32,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    pub fn error(line: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Diagnostic {
            line,
            kind,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(line: u32, kind: ErrorKind, message: impl Into<String>) -> Self {
        Diagnostic {
            line,
            kind,
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    /// Render as `file:line: <kind>: <message>`.
    pub fn render(&self, file: &str) -> String {
        format!("{}:{}: {}: {}", file, self.line, self.kind, self.message)
    }
}

/// Accumulator shared by the parser and the semantic analyzer.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn push(&mut self, d: Diagnostic) {
        self.items.push(d);
    }

    pub fn error(&mut self, line: u32, kind: ErrorKind, message: impl Into<String>) {
        self.push(Diagnostic::error(line, kind, message));
    }

    pub fn warning(&mut self, line: u32, kind: ErrorKind, message: impl Into<String>) {
        self.push(Diagnostic::warning(line, kind, message));
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }

    /// Count diagnostics of a given kind (test helper, also used by -D).
    pub fn count_of(&self, kind: ErrorKind) -> usize {
        self.items.iter().filter(|d| d.kind == kind).count()
    }
}

/// Top-level failure of one compilation, by phase.
#[derive(Debug)]
pub enum CompileError {
    /// Bad invocation (missing input, unknown target).
    Usage(String),
    /// Lex/parse errors.
    Syntax(Vec<Diagnostic>),
    /// Errors from semantic analysis.
    Semantic(Vec<Diagnostic>),
    /// CFG construction or IL emission failed; these stop at the first
    /// unrecoverable error.
    Codegen(Diagnostic),
    /// The external assembler/linker failed.
    Backend(String),
    /// An invariant inside the compiler itself was violated.
    Internal(String),
}

impl CompileError {
    /// CLI exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            CompileError::Usage(_) => 1,
            CompileError::Syntax(_) => 2,
            CompileError::Semantic(_) => 3,
            CompileError::Codegen(_) => 4,
            CompileError::Backend(_) => 5,
            CompileError::Internal(_) => 1,
        }
    }

    /// Render every diagnostic line for the given source file name.
    pub fn render(&self, file: &str) -> String {
        match self {
            CompileError::Usage(m) => format!("fbc: {}", m),
            CompileError::Syntax(ds) | CompileError::Semantic(ds) => ds
                .iter()
                .map(|d| d.render(file))
                .collect::<Vec<_>>()
                .join("\n"),
            CompileError::Codegen(d) => d.render(file),
            CompileError::Backend(m) => format!("{}: backend: {}", file, m),
            CompileError::Internal(m) => format!("fbc: internal error: {}", m),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render("<input>"))
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_classifies() {
        let mut diags = Diagnostics::new();
        diags.warning(3, ErrorKind::LossyConversion, "narrowing INTEGER to BYTE");
        assert!(!diags.has_errors());
        diags.error(7, ErrorKind::TypeMismatch, "cannot assign STRING to INTEGER");
        assert!(diags.has_errors());
        assert_eq!(diags.count_of(ErrorKind::TypeMismatch), 1);
    }

    #[test]
    fn renders_file_line_kind_message() {
        let d = Diagnostic::error(12, ErrorKind::BadJumpTarget, "no line 999");
        assert_eq!(d.render("demo.bas"), "demo.bas:12: bad jump target: no line 999");
    }

    #[test]
    fn exit_codes_follow_phases() {
        assert_eq!(CompileError::Usage(String::new()).exit_code(), 1);
        assert_eq!(CompileError::Syntax(Vec::new()).exit_code(), 2);
        assert_eq!(CompileError::Semantic(Vec::new()).exit_code(), 3);
        assert_eq!(
            CompileError::Codegen(Diagnostic::error(1, ErrorKind::UnsupportedConstruct, "x"))
                .exit_code(),
            4
        );
        assert_eq!(CompileError::Backend(String::new()).exit_code(), 5);
    }
}
