//! Abstract syntax tree for the BASIC dialect.
//!
//! The program is a flat statement stream, the way the source text is: a
//! multi-line IF contributes an `If` statement, then its arm statements,
//! then `EndIf`. Pairing of openers and closers is validated by the
//! semantic analyzer; the CFG builder consumes ranges of this stream.
//!
//! Statements and expressions are single tagged enums with data-bearing
//! payloads. Expressions carry a type annotation slot filled in by the
//! semantic analyzer.

use crate::types::TypeDescriptor;
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

/// One statement with its 1-based source line.
#[derive(Debug, Clone, Serialize)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

impl Stmt {
    pub fn new(line: u32, kind: StmtKind) -> Self {
        Stmt { line, kind }
    }
}

/// Destination of GOTO/GOSUB and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JumpTarget {
    Line(u32),
    Name(String),
}

impl std::fmt::Display for JumpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JumpTarget::Line(n) => write!(f, "{}", n),
            JumpTarget::Name(s) => f.write_str(s),
        }
    }
}

/// Assignment destinations.
#[derive(Debug, Clone, Serialize)]
pub enum LValue {
    Var(String),
    Element { name: String, indices: Vec<Expr> },
    /// `v.field` or `v.field.field` on a record variable.
    Member { base: String, path: Vec<String> },
    /// `s(lo TO hi) = v` string slice assignment.
    Slice { name: String, lo: Expr, hi: Expr },
    /// `MID$(s, pos, len) = v`.
    Mid { name: String, pos: Expr, len: Expr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrintSep {
    /// `;` glues items together.
    Semicolon,
    /// `,` advances to the next print zone.
    Comma,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrintItem {
    pub expr: Expr,
    pub sep: Option<PrintSep>,
}

/// One name declared by DIM/GLOBAL, scalar or array.
#[derive(Debug, Clone, Serialize)]
pub struct DimDecl {
    pub name: String,
    /// Inclusive upper bounds; empty for scalars.
    pub bounds: Vec<Expr>,
    /// `AS` type name, when given. Otherwise the sigil or default decides.
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Param {
    pub name: String,
    pub type_name: Option<String>,
    pub byref: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeField {
    pub name: String,
    pub type_name: String,
}

/// One arm expression of a CASE statement.
#[derive(Debug, Clone, Serialize)]
pub enum CaseArm {
    Value(Expr),
    Range(Expr, Expr),
    /// `CASE IS <op> expr`.
    Is(BinOp, Expr),
}

/// Pre- or post-test of a DO loop; `until` swaps the edge senses instead of
/// negating the condition.
#[derive(Debug, Clone, Serialize)]
pub struct LoopTest {
    pub cond: Expr,
    pub until: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitKind {
    For,
    While,
    Do,
    Function,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContinueKind {
    For,
    While,
    Do,
}

/// A literal in a DATA statement.
#[derive(Debug, Clone, Serialize)]
pub enum DataItem {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Serialize)]
pub enum StmtKind {
    Let {
        target: LValue,
        value: Expr,
    },
    Dim {
        decls: Vec<DimDecl>,
        shared: bool,
    },
    Redim {
        preserve: bool,
        name: String,
        bounds: Vec<Expr>,
    },
    Erase {
        names: Vec<String>,
    },
    Print {
        items: Vec<PrintItem>,
        trailing_newline: bool,
    },
    Input {
        prompt: Option<String>,
        targets: Vec<LValue>,
    },
    /// Single-line `IF c THEN stmts [ELSE stmts]` with inline bodies.
    IfLine {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    /// Opener of a multi-line IF; arms follow in the stream.
    If {
        cond: Expr,
    },
    ElseIf {
        cond: Expr,
    },
    Else,
    EndIf,
    Select {
        expr: Expr,
    },
    Case {
        arms: Vec<CaseArm>,
    },
    CaseElse,
    EndSelect,
    For {
        var: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
    },
    Next {
        var: Option<String>,
    },
    While {
        cond: Expr,
    },
    Wend,
    Do {
        test: Option<LoopTest>,
    },
    Loop {
        test: Option<LoopTest>,
    },
    Repeat,
    Until {
        cond: Expr,
    },
    Goto {
        target: JumpTarget,
    },
    Gosub {
        target: JumpTarget,
    },
    /// GOSUB return.
    Return,
    OnGoto {
        selector: Expr,
        targets: Vec<JumpTarget>,
    },
    OnGosub {
        selector: Expr,
        targets: Vec<JumpTarget>,
    },
    Exit {
        kind: ExitKind,
    },
    Continue {
        kind: ContinueKind,
    },
    Try,
    Catch {
        /// Integer codes; empty means catch-all.
        codes: Vec<Expr>,
    },
    Finally,
    EndTry,
    Throw {
        code: Expr,
    },
    End {
        code: Option<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Sub {
        name: String,
        params: Vec<Param>,
    },
    EndSub,
    Function {
        name: String,
        params: Vec<Param>,
        return_type: Option<String>,
    },
    EndFunction,
    Type {
        name: String,
        fields: Vec<TypeField>,
    },
    /// `SHARED name` inside a procedure re-exposes the module binding.
    Shared {
        names: Vec<String>,
    },
    Constant {
        name: String,
        value: Expr,
    },
    Label {
        name: String,
    },
    Data {
        items: Vec<DataItem>,
    },
    Read {
        targets: Vec<LValue>,
    },
    Restore {
        target: Option<JumpTarget>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    /// `\` integer division, truncating toward zero.
    IntDiv,
    Mod,
    /// `^`, lowered through pow().
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or | BinOp::Xor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnOp {
    Neg,
    Not,
}

/// Built-in functions resolved by the semantic analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Builtin {
    Sgn,
    Abs,
    Int,
    Fix,
    Len,
    Chr,
    Asc,
    Str,
    Val,
    Cint,
    Clng,
    Csng,
    Cdbl,
}

/// What a `name(args)` expression turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallTarget {
    Unresolved,
    ArrayElement,
    UserFunction,
    Builtin(Builtin),
}

#[derive(Debug, Clone, Serialize)]
pub struct Expr {
    pub line: u32,
    pub kind: ExprKind,
    /// Filled in by the semantic analyzer's annotation pass.
    pub ty: Option<TypeDescriptor>,
}

impl Expr {
    pub fn new(line: u32, kind: ExprKind) -> Self {
        Expr {
            line,
            kind,
            ty: None,
        }
    }

    /// The annotated type; panics when annotation has not run. Only the
    /// emitter calls this, and it only runs on annotated trees.
    pub fn descriptor(&self) -> TypeDescriptor {
        self.ty.expect("expression not annotated")
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    Var(String),
    /// `name(args…)`: array element, user function, or builtin, decided by
    /// the analyzer.
    CallOrIndex {
        name: String,
        args: Vec<Expr>,
        target: CallTarget,
    },
    Member {
        base: Box<Expr>,
        field: String,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Iif {
        cond: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    /// Implicit conversion inserted by the semantic analyzer; the node's
    /// `ty` annotation is the conversion target.
    Convert {
        operand: Box<Expr>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_targets_display_like_source() {
        assert_eq!(JumpTarget::Line(100).to_string(), "100");
        assert_eq!(JumpTarget::Name("done".to_string()).to_string(), "done");
    }

    #[test]
    fn expressions_start_unannotated() {
        let e = Expr::new(1, ExprKind::IntLit(42));
        assert!(e.ty.is_none());
    }
}
