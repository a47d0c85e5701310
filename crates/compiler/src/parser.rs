//! Recursive-descent parser for the BASIC dialect.
//!
//! Produces the flat statement stream of [`crate::ast`]. Structured
//! constructs are NOT nested here; `IF` emits an opener and `END IF` emits
//! a closer, and the semantic analyzer validates pairing. The one exception
//! is the single-line `IF c THEN … ELSE …`, whose bodies are inline.
//!
//! Recovery is statement-level: on error the parser records a diagnostic,
//! skips to the end of the source line, and keeps going, so one run can
//! report several syntax errors.

use crate::ast::*;
use crate::diag::{Diagnostics, ErrorKind};
use crate::lexer::{Token, TokenKind, tokenize};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    diags: Diagnostics,
    /// BASIC line number of the current source line, when it has one.
    line_override: Option<u32>,
    /// True until the first statement of a physical line is parsed (labels
    /// are only recognized here).
    at_line_start: bool,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        let (tokens, lex_diags) = tokenize(source);
        let mut diags = Diagnostics::new();
        for d in lex_diags {
            diags.push(d);
        }
        Parser {
            tokens,
            pos: 0,
            diags,
            line_override: None,
            at_line_start: true,
        }
    }

    pub fn parse(mut self) -> (Program, Diagnostics) {
        let mut program = Program::default();
        while !self.is_at_end() {
            if self.eat(&TokenKind::Eol) {
                self.line_override = None;
                self.at_line_start = true;
                continue;
            }
            // A leading integer literal is a BASIC line number.
            if self.at_line_start
                && let TokenKind::Int(n) = self.peek_kind()
            {
                let n = *n;
                self.advance();
                self.line_override = u32::try_from(n).ok().filter(|&v| v > 0);
                if self.line_override.is_none() {
                    self.error_here(ErrorKind::BadNumber, "line number out of range");
                }
                // A bare line number labels the statement that follows.
                if self.check(&TokenKind::Eol) {
                    continue;
                }
            }
            match self.parse_statement() {
                Some(stmt) => {
                    program.statements.push(stmt);
                    self.at_line_start = false;
                    if self.eat(&TokenKind::Colon) {
                        continue;
                    }
                    if !self.check(&TokenKind::Eol) && !self.is_at_end() {
                        self.error_here(ErrorKind::UnexpectedToken, "expected end of statement");
                        self.sync_to_eol();
                    }
                }
                None => self.sync_to_eol(),
            }
        }
        (program, self.diags)
    }

    // ------------------------------------------------------------------
    // Statement dispatch
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Option<Stmt> {
        let line = self.stmt_line();

        // Label: identifier followed by ':' at the start of a line.
        if self.at_line_start
            && let TokenKind::Ident(name) = self.peek_kind()
            && !is_keyword(name)
            && matches!(self.peek_kind_at(1), TokenKind::Colon)
        {
            let name = name.clone();
            self.advance();
            self.advance();
            return Some(Stmt::new(line, StmtKind::Label { name }));
        }

        let word = match self.peek_kind() {
            TokenKind::Ident(_) => self.tokens[self.pos].ident_upper().unwrap(),
            _ => {
                self.error_here(ErrorKind::UnexpectedToken, "expected a statement");
                return None;
            }
        };

        match word.as_str() {
            "LET" => {
                self.advance();
                self.parse_assignment_or_call(line, true)
            }
            "DIM" => {
                self.advance();
                let shared = self.eat_keyword("SHARED");
                self.parse_dim(line, shared)
            }
            "GLOBAL" => {
                self.advance();
                self.parse_dim(line, true)
            }
            "REDIM" => self.parse_redim(line),
            "ERASE" => self.parse_erase(line),
            "PRINT" => self.parse_print(line),
            "INPUT" => self.parse_input(line),
            "IF" => self.parse_if(line),
            "ELSEIF" => {
                self.advance();
                let cond = self.parse_expression()?;
                self.eat_keyword("THEN");
                Some(Stmt::new(line, StmtKind::ElseIf { cond }))
            }
            "ELSE" => {
                self.advance();
                Some(Stmt::new(line, StmtKind::Else))
            }
            "END" => self.parse_end(line),
            "ENDIF" => {
                self.advance();
                Some(Stmt::new(line, StmtKind::EndIf))
            }
            "SELECT" => {
                self.advance();
                if !self.eat_keyword("CASE") {
                    self.error_here(ErrorKind::UnexpectedToken, "expected CASE after SELECT");
                    return None;
                }
                let expr = self.parse_expression()?;
                Some(Stmt::new(line, StmtKind::Select { expr }))
            }
            "CASE" => self.parse_case(line),
            "FOR" => self.parse_for(line),
            "NEXT" => {
                self.advance();
                let var = self.eat_plain_ident();
                Some(Stmt::new(line, StmtKind::Next { var }))
            }
            "WHILE" => {
                self.advance();
                let cond = self.parse_expression()?;
                Some(Stmt::new(line, StmtKind::While { cond }))
            }
            "WEND" => {
                self.advance();
                Some(Stmt::new(line, StmtKind::Wend))
            }
            "DO" => {
                self.advance();
                let test = self.parse_loop_test()?;
                Some(Stmt::new(line, StmtKind::Do { test }))
            }
            "LOOP" => {
                self.advance();
                let test = self.parse_loop_test()?;
                Some(Stmt::new(line, StmtKind::Loop { test }))
            }
            "REPEAT" => {
                self.advance();
                Some(Stmt::new(line, StmtKind::Repeat))
            }
            "UNTIL" => {
                self.advance();
                let cond = self.parse_expression()?;
                Some(Stmt::new(line, StmtKind::Until { cond }))
            }
            "GOTO" => {
                self.advance();
                let target = self.parse_jump_target()?;
                Some(Stmt::new(line, StmtKind::Goto { target }))
            }
            "GOSUB" => {
                self.advance();
                let target = self.parse_jump_target()?;
                Some(Stmt::new(line, StmtKind::Gosub { target }))
            }
            "RETURN" => {
                self.advance();
                Some(Stmt::new(line, StmtKind::Return))
            }
            "ON" => self.parse_on(line),
            "EXIT" => self.parse_exit(line),
            "CONTINUE" => self.parse_continue(line),
            "TRY" => {
                self.advance();
                Some(Stmt::new(line, StmtKind::Try))
            }
            "CATCH" => self.parse_catch(line),
            "FINALLY" => {
                self.advance();
                Some(Stmt::new(line, StmtKind::Finally))
            }
            "THROW" => {
                self.advance();
                let code = self.parse_expression()?;
                Some(Stmt::new(line, StmtKind::Throw { code }))
            }
            "CALL" => {
                self.advance();
                let name = self.expect_plain_ident("procedure name")?;
                let args = if self.eat(&TokenKind::LParen) {
                    self.parse_arg_list()?
                } else {
                    Vec::new()
                };
                Some(Stmt::new(line, StmtKind::Call { name, args }))
            }
            "SUB" => self.parse_sub(line),
            "FUNCTION" => self.parse_function(line),
            "TYPE" => self.parse_type_block(line),
            "SHARED" => {
                self.advance();
                let mut names = vec![self.expect_any_ident("variable name")?];
                while self.eat(&TokenKind::Comma) {
                    names.push(self.expect_any_ident("variable name")?);
                }
                Some(Stmt::new(line, StmtKind::Shared { names }))
            }
            "CONST" | "CONSTANT" => {
                self.advance();
                let name = self.expect_any_ident("constant name")?;
                self.expect(&TokenKind::Eq, "= after constant name")?;
                let value = self.parse_expression()?;
                Some(Stmt::new(line, StmtKind::Constant { name, value }))
            }
            "DATA" => self.parse_data(line),
            "READ" => {
                self.advance();
                let mut targets = vec![self.parse_lvalue()?];
                while self.eat(&TokenKind::Comma) {
                    targets.push(self.parse_lvalue()?);
                }
                Some(Stmt::new(line, StmtKind::Read { targets }))
            }
            "RESTORE" => {
                self.advance();
                let target = if self.check(&TokenKind::Eol) || self.check(&TokenKind::Colon) {
                    None
                } else {
                    Some(self.parse_jump_target()?)
                };
                Some(Stmt::new(line, StmtKind::Restore { target }))
            }
            "MID$" => self.parse_mid_assign(line),
            _ => self.parse_assignment_or_call(line, false),
        }
    }

    fn parse_dim(&mut self, line: u32, shared: bool) -> Option<Stmt> {
        let mut decls = vec![self.parse_dim_decl()?];
        while self.eat(&TokenKind::Comma) {
            decls.push(self.parse_dim_decl()?);
        }
        Some(Stmt::new(line, StmtKind::Dim { decls, shared }))
    }

    fn parse_dim_decl(&mut self) -> Option<DimDecl> {
        let name = self.expect_any_ident("variable name")?;
        let mut bounds = Vec::new();
        if self.eat(&TokenKind::LParen) {
            bounds.push(self.parse_expression()?);
            while self.eat(&TokenKind::Comma) {
                bounds.push(self.parse_expression()?);
            }
            self.expect(&TokenKind::RParen, ") after array bounds")?;
        }
        let type_name = if self.eat_keyword("AS") {
            Some(self.expect_any_ident("type name")?)
        } else {
            None
        };
        Some(DimDecl {
            name,
            bounds,
            type_name,
        })
    }

    fn parse_redim(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let preserve = self.eat_keyword("PRESERVE");
        let name = self.expect_any_ident("array name")?;
        self.expect(&TokenKind::LParen, "( after array name")?;
        let mut bounds = vec![self.parse_expression()?];
        while self.eat(&TokenKind::Comma) {
            bounds.push(self.parse_expression()?);
        }
        self.expect(&TokenKind::RParen, ") after array bounds")?;
        Some(Stmt::new(
            line,
            StmtKind::Redim {
                preserve,
                name,
                bounds,
            },
        ))
    }

    fn parse_erase(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let mut names = vec![self.expect_any_ident("array name")?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.expect_any_ident("array name")?);
        }
        Some(Stmt::new(line, StmtKind::Erase { names }))
    }

    fn parse_print(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let mut items = Vec::new();
        let mut trailing_newline = true;
        while !self.check(&TokenKind::Eol)
            && !self.check(&TokenKind::Colon)
            && !self.at_keyword("ELSE")
            && !self.is_at_end()
        {
            let expr = self.parse_expression()?;
            let sep = if self.eat(&TokenKind::Semicolon) {
                Some(PrintSep::Semicolon)
            } else if self.eat(&TokenKind::Comma) {
                Some(PrintSep::Comma)
            } else {
                None
            };
            let at_end = self.check(&TokenKind::Eol)
                || self.check(&TokenKind::Colon)
                || self.at_keyword("ELSE")
                || self.is_at_end();
            if at_end {
                trailing_newline = sep.is_none();
            }
            items.push(PrintItem { expr, sep });
            if sep.is_none() {
                break;
            }
        }
        Some(Stmt::new(
            line,
            StmtKind::Print {
                items,
                trailing_newline,
            },
        ))
    }

    fn parse_input(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let prompt = if let TokenKind::Str(s) = self.peek_kind() {
            let s = s.clone();
            self.advance();
            if !self.eat(&TokenKind::Semicolon) {
                self.eat(&TokenKind::Comma);
            }
            Some(s)
        } else {
            None
        };
        let mut targets = vec![self.parse_lvalue()?];
        while self.eat(&TokenKind::Comma) {
            targets.push(self.parse_lvalue()?);
        }
        Some(Stmt::new(line, StmtKind::Input { prompt, targets }))
    }

    fn parse_if(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let cond = self.parse_expression()?;
        if !self.eat_keyword("THEN") {
            self.error_here(ErrorKind::UnexpectedToken, "expected THEN after IF condition");
            return None;
        }

        // Multi-line IF: nothing (or a comment) follows THEN.
        if self.check(&TokenKind::Eol) || self.is_at_end() {
            return Some(Stmt::new(line, StmtKind::If { cond }));
        }

        // `IF c THEN 100` is an implicit GOTO.
        let then_body = if let TokenKind::Int(n) = self.peek_kind() {
            let n = *n as u32;
            self.advance();
            vec![Stmt::new(
                line,
                StmtKind::Goto {
                    target: JumpTarget::Line(n),
                },
            )]
        } else {
            self.parse_inline_body(line)?
        };

        let else_body = if self.eat_keyword("ELSE") {
            if let TokenKind::Int(n) = self.peek_kind() {
                let n = *n as u32;
                self.advance();
                vec![Stmt::new(
                    line,
                    StmtKind::Goto {
                        target: JumpTarget::Line(n),
                    },
                )]
            } else {
                self.parse_inline_body(line)?
            }
        } else {
            Vec::new()
        };

        Some(Stmt::new(
            line,
            StmtKind::IfLine {
                cond,
                then_body,
                else_body,
            },
        ))
    }

    /// Colon-separated statements up to ELSE or end of line.
    fn parse_inline_body(&mut self, _line: u32) -> Option<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            let was_line_start = self.at_line_start;
            self.at_line_start = false;
            let stmt = self.parse_statement()?;
            self.at_line_start = was_line_start;
            body.push(stmt);
            if self.eat(&TokenKind::Colon) {
                if self.at_keyword("ELSE") || self.check(&TokenKind::Eol) {
                    break;
                }
                continue;
            }
            break;
        }
        Some(body)
    }

    fn parse_end(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        if self.eat_keyword("IF") {
            return Some(Stmt::new(line, StmtKind::EndIf));
        }
        if self.eat_keyword("SELECT") {
            return Some(Stmt::new(line, StmtKind::EndSelect));
        }
        if self.eat_keyword("TRY") {
            return Some(Stmt::new(line, StmtKind::EndTry));
        }
        if self.eat_keyword("SUB") {
            return Some(Stmt::new(line, StmtKind::EndSub));
        }
        if self.eat_keyword("FUNCTION") {
            return Some(Stmt::new(line, StmtKind::EndFunction));
        }
        let code = if self.check(&TokenKind::Eol)
            || self.check(&TokenKind::Colon)
            || self.at_keyword("ELSE")
            || self.is_at_end()
        {
            None
        } else {
            Some(self.parse_expression()?)
        };
        Some(Stmt::new(line, StmtKind::End { code }))
    }

    fn parse_case(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        if self.eat_keyword("ELSE") {
            return Some(Stmt::new(line, StmtKind::CaseElse));
        }
        let mut arms = vec![self.parse_case_arm()?];
        while self.eat(&TokenKind::Comma) {
            arms.push(self.parse_case_arm()?);
        }
        Some(Stmt::new(line, StmtKind::Case { arms }))
    }

    fn parse_case_arm(&mut self) -> Option<CaseArm> {
        if self.eat_keyword("IS") {
            let op = match self.peek_kind() {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                TokenKind::Eq => BinOp::Eq,
                TokenKind::Ne => BinOp::Ne,
                _ => {
                    self.error_here(ErrorKind::UnexpectedToken, "expected comparison after IS");
                    return None;
                }
            };
            self.advance();
            let expr = self.parse_expression()?;
            return Some(CaseArm::Is(op, expr));
        }
        let first = self.parse_expression()?;
        if self.eat_keyword("TO") {
            let last = self.parse_expression()?;
            return Some(CaseArm::Range(first, last));
        }
        Some(CaseArm::Value(first))
    }

    fn parse_for(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let var = self.expect_any_ident("loop variable")?;
        self.expect(&TokenKind::Eq, "= after loop variable")?;
        let start = self.parse_expression()?;
        if !self.eat_keyword("TO") {
            self.error_here(ErrorKind::UnexpectedToken, "expected TO in FOR");
            return None;
        }
        let end = self.parse_expression()?;
        let step = if self.eat_keyword("STEP") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Some(Stmt::new(
            line,
            StmtKind::For {
                var,
                start,
                end,
                step,
            },
        ))
    }

    fn parse_loop_test(&mut self) -> Option<Option<LoopTest>> {
        if self.eat_keyword("WHILE") {
            let cond = self.parse_expression()?;
            return Some(Some(LoopTest { cond, until: false }));
        }
        if self.eat_keyword("UNTIL") {
            let cond = self.parse_expression()?;
            return Some(Some(LoopTest { cond, until: true }));
        }
        Some(None)
    }

    fn parse_jump_target(&mut self) -> Option<JumpTarget> {
        match self.peek_kind() {
            TokenKind::Int(n) => {
                let n = *n as u32;
                self.advance();
                Some(JumpTarget::Line(n))
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Some(JumpTarget::Name(name))
            }
            _ => {
                self.error_here(ErrorKind::UnexpectedToken, "expected a line number or label");
                None
            }
        }
    }

    fn parse_on(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let selector = self.parse_expression()?;
        let is_gosub = if self.eat_keyword("GOTO") {
            false
        } else if self.eat_keyword("GOSUB") {
            true
        } else {
            self.error_here(ErrorKind::UnexpectedToken, "expected GOTO or GOSUB after ON");
            return None;
        };
        let mut targets = vec![self.parse_jump_target()?];
        while self.eat(&TokenKind::Comma) {
            targets.push(self.parse_jump_target()?);
        }
        let kind = if is_gosub {
            StmtKind::OnGosub { selector, targets }
        } else {
            StmtKind::OnGoto { selector, targets }
        };
        Some(Stmt::new(line, kind))
    }

    fn parse_exit(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let kind = if self.eat_keyword("FOR") {
            ExitKind::For
        } else if self.eat_keyword("WHILE") {
            ExitKind::While
        } else if self.eat_keyword("DO") {
            ExitKind::Do
        } else if self.eat_keyword("FUNCTION") {
            ExitKind::Function
        } else if self.eat_keyword("SUB") {
            ExitKind::Sub
        } else {
            self.error_here(
                ErrorKind::UnexpectedToken,
                "expected FOR, WHILE, DO, FUNCTION, or SUB after EXIT",
            );
            return None;
        };
        Some(Stmt::new(line, StmtKind::Exit { kind }))
    }

    fn parse_continue(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let kind = if self.eat_keyword("FOR") {
            ContinueKind::For
        } else if self.eat_keyword("WHILE") {
            ContinueKind::While
        } else if self.eat_keyword("DO") {
            ContinueKind::Do
        } else {
            self.error_here(
                ErrorKind::UnexpectedToken,
                "expected FOR, WHILE, or DO after CONTINUE",
            );
            return None;
        };
        Some(Stmt::new(line, StmtKind::Continue { kind }))
    }

    fn parse_catch(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let mut codes = Vec::new();
        if !self.check(&TokenKind::Eol) && !self.check(&TokenKind::Colon) && !self.is_at_end() {
            codes.push(self.parse_expression()?);
            while self.eat(&TokenKind::Comma) {
                codes.push(self.parse_expression()?);
            }
        }
        Some(Stmt::new(line, StmtKind::Catch { codes }))
    }

    fn parse_sub(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let name = self.expect_plain_ident("SUB name")?;
        let params = self.parse_params()?;
        Some(Stmt::new(line, StmtKind::Sub { name, params }))
    }

    fn parse_function(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let name = self.expect_any_ident("FUNCTION name")?;
        let params = self.parse_params()?;
        let return_type = if self.eat_keyword("AS") {
            Some(self.expect_any_ident("return type")?)
        } else {
            None
        };
        Some(Stmt::new(
            line,
            StmtKind::Function {
                name,
                params,
                return_type,
            },
        ))
    }

    fn parse_params(&mut self) -> Option<Vec<Param>> {
        let mut params = Vec::new();
        if !self.eat(&TokenKind::LParen) {
            return Some(params);
        }
        if self.eat(&TokenKind::RParen) {
            return Some(params);
        }
        loop {
            let byref = if self.eat_keyword("BYREF") {
                true
            } else {
                self.eat_keyword("BYVAL");
                false
            };
            let name = self.expect_any_ident("parameter name")?;
            let type_name = if self.eat_keyword("AS") {
                Some(self.expect_any_ident("parameter type")?)
            } else {
                None
            };
            params.push(Param {
                name,
                type_name,
                byref,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, ") after parameters")?;
        Some(params)
    }

    /// `TYPE name … END TYPE` is consumed as one statement; record fields
    /// are data, not control flow.
    fn parse_type_block(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let name = self.expect_plain_ident("TYPE name")?;
        self.expect(&TokenKind::Eol, "end of line after TYPE name")?;
        let mut fields = Vec::new();
        loop {
            if self.eat(&TokenKind::Eol) {
                continue;
            }
            if self.is_at_end() {
                self.error_here(ErrorKind::UnexpectedToken, "TYPE without END TYPE");
                return None;
            }
            if self.at_keyword("END") {
                self.advance();
                if !self.eat_keyword("TYPE") {
                    self.error_here(ErrorKind::UnexpectedToken, "expected END TYPE");
                    return None;
                }
                break;
            }
            let fname = self.expect_any_ident("field name")?;
            if !self.eat_keyword("AS") {
                self.error_here(ErrorKind::UnexpectedToken, "expected AS in field declaration");
                return None;
            }
            let tname = self.expect_any_ident("field type")?;
            fields.push(TypeField {
                name: fname,
                type_name: tname,
            });
        }
        Some(Stmt::new(line, StmtKind::Type { name, fields }))
    }

    fn parse_data(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        let mut items = Vec::new();
        loop {
            let negative = self.eat(&TokenKind::Minus);
            let item = match self.peek_kind() {
                TokenKind::Int(n) => {
                    let v = if negative { -n } else { *n };
                    self.advance();
                    DataItem::Int(v)
                }
                TokenKind::Float(x) => {
                    let v = if negative { -x } else { *x };
                    self.advance();
                    DataItem::Float(v)
                }
                TokenKind::Str(s) => {
                    let s = s.clone();
                    self.advance();
                    DataItem::Str(s)
                }
                _ => {
                    self.error_here(ErrorKind::UnexpectedToken, "expected a DATA literal");
                    return None;
                }
            };
            items.push(item);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Some(Stmt::new(line, StmtKind::Data { items }))
    }

    /// `MID$(s, pos, len) = v`
    fn parse_mid_assign(&mut self, line: u32) -> Option<Stmt> {
        self.advance();
        self.expect(&TokenKind::LParen, "( after MID$")?;
        let name = self.expect_any_ident("string variable")?;
        self.expect(&TokenKind::Comma, ", after string variable")?;
        let pos = self.parse_expression()?;
        self.expect(&TokenKind::Comma, ", after position")?;
        let len = self.parse_expression()?;
        self.expect(&TokenKind::RParen, ") after length")?;
        self.expect(&TokenKind::Eq, "= after MID$(…)")?;
        let value = self.parse_expression()?;
        Some(Stmt::new(
            line,
            StmtKind::Let {
                target: LValue::Mid { name, pos, len },
                value,
            },
        ))
    }

    /// Assignment (`x = …`, `a(i) = …`, `p.x = …`, `s(lo TO hi) = …`) or a
    /// bare procedure call.
    fn parse_assignment_or_call(&mut self, line: u32, require_assign: bool) -> Option<Stmt> {
        let name = self.expect_any_ident("identifier")?;

        // Member path.
        if self.check(&TokenKind::Dot) {
            let mut path = Vec::new();
            while self.eat(&TokenKind::Dot) {
                path.push(self.expect_any_ident("field name")?);
            }
            self.expect(&TokenKind::Eq, "= in member assignment")?;
            let value = self.parse_expression()?;
            return Some(Stmt::new(
                line,
                StmtKind::Let {
                    target: LValue::Member { base: name, path },
                    value,
                },
            ));
        }

        if self.eat(&TokenKind::LParen) {
            let first = self.parse_expression()?;
            // `name(lo TO hi) = v` is a string slice assignment.
            if self.eat_keyword("TO") {
                let hi = self.parse_expression()?;
                self.expect(&TokenKind::RParen, ") after slice bounds")?;
                self.expect(&TokenKind::Eq, "= after slice")?;
                let value = self.parse_expression()?;
                return Some(Stmt::new(
                    line,
                    StmtKind::Let {
                        target: LValue::Slice {
                            name,
                            lo: first,
                            hi,
                        },
                        value,
                    },
                ));
            }
            let mut indices = vec![first];
            while self.eat(&TokenKind::Comma) {
                indices.push(self.parse_expression()?);
            }
            self.expect(&TokenKind::RParen, ") after indices")?;
            if self.eat(&TokenKind::Eq) {
                let value = self.parse_expression()?;
                return Some(Stmt::new(
                    line,
                    StmtKind::Let {
                        target: LValue::Element { name, indices },
                        value,
                    },
                ));
            }
            if require_assign {
                self.error_here(ErrorKind::UnexpectedToken, "expected = after LET target");
                return None;
            }
            return Some(Stmt::new(
                line,
                StmtKind::Call {
                    name,
                    args: indices,
                },
            ));
        }

        if self.eat(&TokenKind::Eq) {
            let value = self.parse_expression()?;
            return Some(Stmt::new(
                line,
                StmtKind::Let {
                    target: LValue::Var(name),
                    value,
                },
            ));
        }

        if require_assign {
            self.error_here(ErrorKind::UnexpectedToken, "expected = after LET target");
            return None;
        }
        // Bare call with no arguments.
        Some(Stmt::new(
            line,
            StmtKind::Call {
                name,
                args: Vec::new(),
            },
        ))
    }

    fn parse_lvalue(&mut self) -> Option<LValue> {
        let name = self.expect_any_ident("variable")?;
        if self.check(&TokenKind::Dot) {
            let mut path = Vec::new();
            while self.eat(&TokenKind::Dot) {
                path.push(self.expect_any_ident("field name")?);
            }
            return Some(LValue::Member { base: name, path });
        }
        if self.eat(&TokenKind::LParen) {
            let mut indices = vec![self.parse_expression()?];
            while self.eat(&TokenKind::Comma) {
                indices.push(self.parse_expression()?);
            }
            self.expect(&TokenKind::RParen, ") after indices")?;
            return Some(LValue::Element { name, indices });
        }
        Some(LValue::Var(name))
    }

    // ------------------------------------------------------------------
    // Expressions: precedence climbing
    // ------------------------------------------------------------------

    pub fn parse_expression(&mut self) -> Option<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_and()?;
        loop {
            let op = if self.eat_keyword("OR") {
                BinOp::Or
            } else if self.eat_keyword("XOR") {
                BinOp::Xor
            } else {
                return Some(lhs);
            };
            let rhs = self.parse_and()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat_keyword("AND") {
            let rhs = self.parse_not()?;
            lhs = binary(BinOp::And, lhs, rhs);
        }
        Some(lhs)
    }

    fn parse_not(&mut self) -> Option<Expr> {
        if self.eat_keyword("NOT") {
            let operand = self.parse_not()?;
            let line = operand.line;
            return Some(Expr::new(
                line,
                ExprKind::Unary {
                    op: UnOp::Not,
                    operand: Box::new(operand),
                },
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Eq => BinOp::Eq,
                TokenKind::Ne => BinOp::Ne,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                _ => return Some(lhs),
            };
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => return Some(lhs),
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Backslash => BinOp::IntDiv,
                TokenKind::Ident(s) if s.eq_ignore_ascii_case("MOD") => BinOp::Mod,
                _ => return Some(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        if self.eat(&TokenKind::Minus) {
            let operand = self.parse_unary()?;
            let line = operand.line;
            return Some(Expr::new(
                line,
                ExprKind::Unary {
                    op: UnOp::Neg,
                    operand: Box::new(operand),
                },
            ));
        }
        self.eat(&TokenKind::Plus); // unary plus is a no-op
        self.parse_power()
    }

    fn parse_power(&mut self) -> Option<Expr> {
        let base = self.parse_postfix()?;
        if self.eat(&TokenKind::Caret) {
            // Right-associative: 2 ^ 3 ^ 2 = 2 ^ (3 ^ 2).
            let exponent = self.parse_unary()?;
            return Some(binary(BinOp::Pow, base, exponent));
        }
        Some(base)
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        while self.eat(&TokenKind::Dot) {
            let field = self.expect_any_ident("field name")?;
            let line = expr.line;
            expr = Expr::new(
                line,
                ExprKind::Member {
                    base: Box::new(expr),
                    field,
                },
            );
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let line = self.stmt_line();
        match self.peek_kind().clone() {
            TokenKind::Int(n) => {
                self.advance();
                Some(Expr::new(line, ExprKind::IntLit(n)))
            }
            TokenKind::Float(x) => {
                self.advance();
                Some(Expr::new(line, ExprKind::FloatLit(x)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Some(Expr::new(line, ExprKind::StringLit(s)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(&TokenKind::RParen, ") to close group")?;
                Some(inner)
            }
            TokenKind::Ident(name) => {
                self.advance();
                if self.eat(&TokenKind::LParen) {
                    let args = self.parse_arg_list()?;
                    if name.eq_ignore_ascii_case("IIF") {
                        if args.len() != 3 {
                            self.error_here(
                                ErrorKind::UnexpectedToken,
                                "IIF takes exactly three arguments",
                            );
                            return None;
                        }
                        let mut it = args.into_iter();
                        return Some(Expr::new(
                            line,
                            ExprKind::Iif {
                                cond: Box::new(it.next().unwrap()),
                                then_value: Box::new(it.next().unwrap()),
                                else_value: Box::new(it.next().unwrap()),
                            },
                        ));
                    }
                    return Some(Expr::new(
                        line,
                        ExprKind::CallOrIndex {
                            name,
                            args,
                            target: CallTarget::Unresolved,
                        },
                    ));
                }
                Some(Expr::new(line, ExprKind::Var(name)))
            }
            _ => {
                self.error_here(ErrorKind::UnexpectedToken, "expected an expression");
                None
            }
        }
    }

    fn parse_arg_list(&mut self) -> Option<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Some(args);
        }
        args.push(self.parse_expression()?);
        while self.eat(&TokenKind::Comma) {
            args.push(self.parse_expression()?);
        }
        self.expect(&TokenKind::RParen, ") after arguments")?;
        Some(args)
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn stmt_line(&self) -> u32 {
        self.line_override
            .unwrap_or_else(|| self.tokens.get(self.pos).map(|t| t.line).unwrap_or(0))
    }

    fn peek_kind(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eol)
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eol)
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Ident(s) if s.eq_ignore_ascii_case(word))
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.at_keyword(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Option<()> {
        if self.eat(kind) {
            Some(())
        } else {
            self.error_here(ErrorKind::UnexpectedToken, format!("expected {}", what));
            None
        }
    }

    /// Any identifier, including sigiled ones.
    fn expect_any_ident(&mut self, what: &str) -> Option<String> {
        if let TokenKind::Ident(s) = self.peek_kind() {
            let s = s.clone();
            self.advance();
            Some(s)
        } else {
            self.error_here(ErrorKind::UnexpectedToken, format!("expected {}", what));
            None
        }
    }

    /// Identifier without a type sigil (procedure and type names).
    fn expect_plain_ident(&mut self, what: &str) -> Option<String> {
        let name = self.expect_any_ident(what)?;
        if name.ends_with(['$', '%', '#', '&', '!']) {
            self.error_here(
                ErrorKind::UnexpectedToken,
                format!("{} cannot carry a type sigil", what),
            );
            return None;
        }
        Some(name)
    }

    fn eat_plain_ident(&mut self) -> Option<String> {
        if let TokenKind::Ident(s) = self.peek_kind() {
            let s = s.clone();
            self.advance();
            Some(s)
        } else {
            None
        }
    }

    fn error_here(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let line = self.stmt_line();
        self.diags.error(line, kind, message);
    }

    fn sync_to_eol(&mut self) {
        while !self.is_at_end() && !self.check(&TokenKind::Eol) {
            self.advance();
        }
        self.eat(&TokenKind::Eol);
        self.line_override = None;
        self.at_line_start = true;
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    let line = lhs.line;
    Expr::new(
        line,
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    )
}

/// Words that can never be labels or bare calls.
fn is_keyword(word: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "LET", "DIM", "GLOBAL", "REDIM", "ERASE", "PRINT", "INPUT", "IF", "THEN", "ELSE", "IIF",
        "ELSEIF", "END", "ENDIF", "SELECT", "CASE", "FOR", "NEXT", "TO", "STEP", "WHILE",
        "WEND", "DO", "LOOP", "REPEAT", "UNTIL", "GOTO", "GOSUB", "RETURN", "ON", "EXIT",
        "CONTINUE", "TRY", "CATCH", "FINALLY", "THROW", "CALL", "SUB", "FUNCTION", "TYPE",
        "SHARED", "CONST", "CONSTANT", "DATA", "READ", "RESTORE", "AND", "OR", "XOR", "NOT",
        "MOD", "AS", "BYREF", "BYVAL", "IS", "PRESERVE",
    ];
    KEYWORDS.iter().any(|k| word.eq_ignore_ascii_case(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        let (program, diags) = Parser::new(src).parse();
        assert!(
            !diags.has_errors(),
            "unexpected errors: {:?}",
            diags.into_vec()
        );
        program
    }

    #[test]
    fn numbered_lines_set_statement_lines() {
        let p = parse_ok("10 PRINT 1\n20 PRINT 2");
        assert_eq!(p.statements[0].line, 10);
        assert_eq!(p.statements[1].line, 20);
    }

    #[test]
    fn colon_separates_statements_on_one_line() {
        let p = parse_ok("10 DIM c AS INTEGER : c = 0");
        assert_eq!(p.statements.len(), 2);
        assert!(matches!(p.statements[0].kind, StmtKind::Dim { .. }));
        assert!(matches!(p.statements[1].kind, StmtKind::Let { .. }));
        assert_eq!(p.statements[1].line, 10);
    }

    #[test]
    fn for_with_negative_step() {
        let p = parse_ok("FOR i = 10 TO 1 STEP -1\nNEXT i");
        match &p.statements[0].kind {
            StmtKind::For { var, step, .. } => {
                assert_eq!(var, "i");
                assert!(step.is_some());
            }
            other => panic!("expected FOR, got {:?}", other),
        }
        assert!(matches!(
            p.statements[1].kind,
            StmtKind::Next { var: Some(_) }
        ));
    }

    #[test]
    fn single_line_if_with_inline_bodies() {
        let p = parse_ok("IF x > 0 THEN PRINT 1 : PRINT 2 ELSE PRINT 3");
        match &p.statements[0].kind {
            StmtKind::IfLine {
                then_body,
                else_body,
                ..
            } => {
                assert_eq!(then_body.len(), 2);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("expected IfLine, got {:?}", other),
        }
    }

    #[test]
    fn if_then_line_number_is_goto() {
        let p = parse_ok("IF x = 1 THEN 100");
        match &p.statements[0].kind {
            StmtKind::IfLine { then_body, .. } => {
                assert!(matches!(
                    then_body[0].kind,
                    StmtKind::Goto {
                        target: JumpTarget::Line(100)
                    }
                ));
            }
            other => panic!("expected IfLine, got {:?}", other),
        }
    }

    #[test]
    fn multiline_if_is_flat() {
        let p = parse_ok("IF a = 1 THEN\nPRINT 1\nELSEIF a = 2 THEN\nPRINT 2\nELSE\nPRINT 3\nEND IF");
        let kinds: Vec<_> = p.statements.iter().map(|s| &s.kind).collect();
        assert!(matches!(kinds[0], StmtKind::If { .. }));
        assert!(matches!(kinds[2], StmtKind::ElseIf { .. }));
        assert!(matches!(kinds[4], StmtKind::Else));
        assert!(matches!(kinds[6], StmtKind::EndIf));
    }

    #[test]
    fn select_case_arms() {
        let p = parse_ok("SELECT CASE n\nCASE 1, 3 TO 5, IS > 9\nPRINT 1\nCASE ELSE\nPRINT 0\nEND SELECT");
        match &p.statements[1].kind {
            StmtKind::Case { arms } => {
                assert_eq!(arms.len(), 3);
                assert!(matches!(arms[0], CaseArm::Value(_)));
                assert!(matches!(arms[1], CaseArm::Range(_, _)));
                assert!(matches!(arms[2], CaseArm::Is(BinOp::Gt, _)));
            }
            other => panic!("expected CASE, got {:?}", other),
        }
    }

    #[test]
    fn do_loop_variants() {
        let p = parse_ok("DO WHILE a < 3\nLOOP\nDO\nLOOP UNTIL b = 1");
        match &p.statements[0].kind {
            StmtKind::Do { test: Some(t) } => assert!(!t.until),
            other => panic!("expected DO WHILE, got {:?}", other),
        }
        match &p.statements[3].kind {
            StmtKind::Loop { test: Some(t) } => assert!(t.until),
            other => panic!("expected LOOP UNTIL, got {:?}", other),
        }
    }

    #[test]
    fn on_gosub_targets() {
        let p = parse_ok("ON x GOSUB 100, 200, 300");
        match &p.statements[0].kind {
            StmtKind::OnGosub { targets, .. } => assert_eq!(targets.len(), 3),
            other => panic!("expected ON GOSUB, got {:?}", other),
        }
    }

    #[test]
    fn slice_assignment_target() {
        let p = parse_ok("text$(1 TO 5) = \"BASIC\"");
        match &p.statements[0].kind {
            StmtKind::Let {
                target: LValue::Slice { name, .. },
                ..
            } => assert_eq!(name, "text$"),
            other => panic!("expected slice assignment, got {:?}", other),
        }
    }

    #[test]
    fn mid_assignment_target() {
        let p = parse_ok("MID$(s$, 7, 5) = \"BASIC\"");
        assert!(matches!(
            p.statements[0].kind,
            StmtKind::Let {
                target: LValue::Mid { .. },
                ..
            }
        ));
    }

    #[test]
    fn sub_and_function_declarations() {
        let p = parse_ok(
            "SUB greet(name$ AS STRING)\nPRINT name$\nEND SUB\nFUNCTION add2(a AS INTEGER, BYREF b AS INTEGER) AS INTEGER\nadd2 = a + b\nEND FUNCTION",
        );
        match &p.statements[0].kind {
            StmtKind::Sub { name, params } => {
                assert_eq!(name, "greet");
                assert_eq!(params.len(), 1);
            }
            other => panic!("expected SUB, got {:?}", other),
        }
        match &p.statements[3].kind {
            StmtKind::Function {
                name,
                params,
                return_type,
            } => {
                assert_eq!(name, "add2");
                assert!(params[1].byref);
                assert_eq!(return_type.as_deref(), Some("INTEGER"));
            }
            other => panic!("expected FUNCTION, got {:?}", other),
        }
    }

    #[test]
    fn type_block_collects_fields() {
        let p = parse_ok("TYPE Point\nx AS DOUBLE\ny AS DOUBLE\nEND TYPE");
        match &p.statements[0].kind {
            StmtKind::Type { name, fields } => {
                assert_eq!(name, "Point");
                assert_eq!(fields.len(), 2);
            }
            other => panic!("expected TYPE, got {:?}", other),
        }
    }

    #[test]
    fn try_catch_finally() {
        let p = parse_ok("TRY\nTHROW 5\nCATCH 5, 6\nPRINT 1\nFINALLY\nPRINT 2\nEND TRY");
        let kinds: Vec<_> = p.statements.iter().map(|s| &s.kind).collect();
        assert!(matches!(kinds[0], StmtKind::Try));
        match kinds[2] {
            StmtKind::Catch { codes } => assert_eq!(codes.len(), 2),
            other => panic!("expected CATCH, got {:?}", other),
        }
        assert!(matches!(kinds[4], StmtKind::Finally));
        assert!(matches!(kinds[6], StmtKind::EndTry));
    }

    #[test]
    fn power_is_right_associative_and_binds_over_neg() {
        let p = parse_ok("x = -2 ^ 2");
        match &p.statements[0].kind {
            StmtKind::Let { value, .. } => match &value.kind {
                ExprKind::Unary { op: UnOp::Neg, operand } => {
                    assert!(matches!(
                        operand.kind,
                        ExprKind::Binary { op: BinOp::Pow, .. }
                    ));
                }
                other => panic!("expected -(2^2), got {:?}", other),
            },
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn iif_becomes_ternary() {
        let p = parse_ok("x = IIF(a > b, a, b)");
        match &p.statements[0].kind {
            StmtKind::Let { value, .. } => assert!(matches!(value.kind, ExprKind::Iif { .. })),
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn data_read_restore() {
        let p = parse_ok("DATA 1, 2.5, \"x\", -3\nREAD a, b\nRESTORE 10");
        match &p.statements[0].kind {
            StmtKind::Data { items } => {
                assert_eq!(items.len(), 4);
                assert!(matches!(items[3], DataItem::Int(-3)));
            }
            other => panic!("expected DATA, got {:?}", other),
        }
    }

    #[test]
    fn recovery_reports_multiple_errors() {
        let (_, diags) = Parser::new("IF THEN\nPRINT 1\nFOR = 3\nPRINT 2").parse();
        assert!(diags.has_errors());
        assert!(diags.count_of(ErrorKind::UnexpectedToken) >= 2);
    }

    #[test]
    fn label_at_line_start() {
        let p = parse_ok("again:\nGOTO again");
        assert!(matches!(p.statements[0].kind, StmtKind::Label { .. }));
        assert!(matches!(
            p.statements[1].kind,
            StmtKind::Goto {
                target: JumpTarget::Name(_)
            }
        ));
    }
}
