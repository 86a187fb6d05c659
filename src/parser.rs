//! Recursive-descent parser (spec §4.3) turning a flat, fully macro-
//! expanded token stream into a [`Program`].
//!
//! Grounded on the teacher's `Parser` struct shape: a `tokens`/`pos` cursor
//! with `check`/`advance`/`consume` helpers and `Result`-returning parse
//! methods, generalized from a single flat word list to a full statement/
//! expression grammar with precedence climbing.

use crate::ast::*;
use crate::diagnostics::{CompileError, Span};
use crate::token::{Token, TokenKind};

pub struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

type PResult<T> = Result<T, CompileError>;

impl<'t> Parser<'t> {
    pub fn new(tokens: &'t [Token]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_n(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn last_span(&self) -> Span {
        self.tokens.last().map(|t| t.span).unwrap_or_else(Span::dummy)
    }

    fn here_span(&self) -> Span {
        self.peek().map(|t| t.span).unwrap_or_else(|| self.last_span())
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, text: &str) -> bool {
        self.peek().map(|t| &*t.text == text).unwrap_or(false)
    }

    fn check_kind(&self, kind: TokenKind) -> bool {
        self.peek().map(|t| t.kind == kind).unwrap_or(false)
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, text: &str) -> bool {
        if self.check(text) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, text: &str) -> PResult<Token> {
        if self.check(text) {
            Ok(self.advance().unwrap())
        } else {
            Err(CompileError::Parse {
                span: self.here_span(),
                message: format!(
                    "expected `{}`, found {}",
                    text,
                    self.peek().map(|t| format!("`{}`", t.text)).unwrap_or_else(|| "end of input".into())
                ),
            })
        }
    }

    fn expect_ident(&mut self) -> PResult<Token> {
        if self.check_kind(TokenKind::Ident) {
            Ok(self.advance().unwrap())
        } else {
            Err(CompileError::Parse {
                span: self.here_span(),
                message: format!(
                    "expected identifier, found {}",
                    self.peek().map(|t| format!("`{}`", t.text)).unwrap_or_else(|| "end of input".into())
                ),
            })
        }
    }

    /// Parses the whole token stream as a sequence of top-level global
    /// declarations and function definitions.
    pub fn parse_program(&mut self) -> PResult<Program> {
        let mut program = Program::default();
        while !self.at_eof() {
            if self.check("var") {
                program.globals.push(self.parse_global_decl()?);
            } else if self.check_kind(TokenKind::Ident)
                && self.peek_n(1).map(|t| &*t.text) == Some("(")
            {
                program.functions.push(self.parse_function_def()?);
            } else {
                return Err(CompileError::Parse {
                    span: self.here_span(),
                    message: format!(
                        "expected a global `var` declaration or a function definition, found `{}`",
                        self.peek().map(|t| t.text.to_string()).unwrap_or_default()
                    ),
                });
            }
        }
        Ok(program)
    }

    fn parse_global_decl(&mut self) -> PResult<GlobalVarDecl> {
        let start = self.expect("var")?.span;
        let name = self.expect_ident()?;
        let init = if self.eat("=") { Some(self.parse_expr()?) } else { None };
        self.expect(";")?;
        Ok(GlobalVarDecl {
            name: name.text.to_string(),
            init,
            span: start,
        })
    }

    fn parse_function_def(&mut self) -> PResult<FunctionDef> {
        let name_tok = self.expect_ident()?;
        self.expect("(")?;
        let mut params = Vec::new();
        if !self.check(")") {
            loop {
                let p = self.expect_ident()?;
                params.push(Param {
                    name: p.text.to_string(),
                    span: p.span,
                });
                if !self.eat(",") {
                    break;
                }
            }
        }
        self.expect(")")?;
        let body = self.parse_block_stmts()?;
        Ok(FunctionDef {
            name: name_tok.text.to_string(),
            params,
            body,
            span: name_tok.span,
        })
    }

    fn parse_block_stmts(&mut self) -> PResult<Vec<Stmt>> {
        self.expect("{")?;
        let mut body = Vec::new();
        while !self.check("}") {
            if self.at_eof() {
                return Err(CompileError::Parse {
                    span: self.here_span(),
                    message: "unterminated block, expected `}`".into(),
                });
            }
            body.push(self.parse_stmt()?);
        }
        self.expect("}")?;
        Ok(body)
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let span = self.here_span();
        if self.check("{") {
            let body = self.parse_block_stmts()?;
            return Ok(Stmt::Block { body, span });
        }
        if self.check("var") {
            self.advance();
            let name = self.expect_ident()?;
            let init = if self.eat("=") { Some(self.parse_expr()?) } else { None };
            self.expect(";")?;
            return Ok(Stmt::VarDecl {
                name: name.text.to_string(),
                init,
                span,
            });
        }
        if self.check("if") {
            return self.parse_if();
        }
        if self.check("while") {
            return self.parse_while();
        }
        if self.check("do") {
            return self.parse_do_while();
        }
        if self.check("for") {
            return self.parse_for();
        }
        if self.check("switch") {
            return self.parse_switch();
        }
        if self.check("break") {
            self.advance();
            self.expect(";")?;
            return Ok(Stmt::Break { span });
        }
        if self.check("continue") {
            self.advance();
            self.expect(";")?;
            return Ok(Stmt::Continue { span });
        }
        if self.check("return") {
            self.advance();
            let value = if self.check(";") { None } else { Some(self.parse_expr()?) };
            self.expect(";")?;
            return Ok(Stmt::Return { value, span });
        }
        if self.check("goto") {
            self.advance();
            let label = self.expect_ident()?;
            self.expect(";")?;
            return Ok(Stmt::Goto {
                label: label.text.to_string(),
                span,
            });
        }
        // label: NAME ':' (not followed by another ':' - no ternary/scope ops here)
        if self.check_kind(TokenKind::Ident) && self.peek_n(1).map(|t| &*t.text) == Some(":") {
            let name = self.advance().unwrap();
            self.advance(); // ':'
            return Ok(Stmt::Label {
                name: name.text.to_string(),
                span,
            });
        }

        self.parse_assign_or_expr_stmt()
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let span = self.expect("if")?.span;
        self.expect("(")?;
        let cond = self.parse_expr()?;
        self.expect(")")?;
        let then_branch = Box::new(self.parse_stmt()?);
        let else_branch = if self.eat("else") {
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
            span,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let span = self.expect("while")?.span;
        self.expect("(")?;
        let cond = self.parse_expr()?;
        self.expect(")")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::While { cond, body, span })
    }

    fn parse_do_while(&mut self) -> PResult<Stmt> {
        let span = self.expect("do")?.span;
        let body = Box::new(self.parse_stmt()?);
        self.expect("while")?;
        self.expect("(")?;
        let cond = self.parse_expr()?;
        self.expect(")")?;
        self.expect(";")?;
        Ok(Stmt::DoWhile { body, cond, span })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let span = self.expect("for")?.span;
        self.expect("(")?;
        let init = if self.check(";") {
            None
        } else {
            Some(Box::new(self.parse_assign_or_expr_stmt()?))
        };
        if init.is_none() {
            self.expect(";")?;
        }
        let cond = if self.check(";") { None } else { Some(self.parse_expr()?) };
        self.expect(";")?;
        let step = if self.check(")") {
            None
        } else {
            Some(Box::new(self.parse_bare_assign_or_expr()?))
        };
        self.expect(")")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
            span,
        })
    }

    /// Parses an assignment or expression *without* a trailing `;`, for use
    /// in a `for(...)` step clause.
    fn parse_bare_assign_or_expr(&mut self) -> PResult<Stmt> {
        let span = self.here_span();
        if let Some((target, op)) = self.try_parse_lvalue_and_assign_op()? {
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign { target, op, value, span });
        }
        let expr = self.parse_expr()?;
        Ok(Stmt::ExprStmt { expr, span })
    }

    fn parse_switch(&mut self) -> PResult<Stmt> {
        let span = self.expect("switch")?.span;
        self.expect("(")?;
        let scrutinee = self.parse_expr()?;
        self.expect(")")?;
        self.expect("{")?;
        let mut cases = Vec::new();
        while !self.check("}") {
            let case_span = self.here_span();
            if self.eat("case") {
                let value = self.parse_expr()?;
                self.expect(":")?;
                let body = self.parse_case_body()?;
                cases.push(SwitchCase {
                    value: Some(value),
                    body,
                    span: case_span,
                });
            } else if self.eat("default") {
                self.expect(":")?;
                let body = self.parse_case_body()?;
                cases.push(SwitchCase {
                    value: None,
                    body,
                    span: case_span,
                });
            } else {
                return Err(CompileError::Parse {
                    span: self.here_span(),
                    message: "expected `case` or `default` inside `switch`".into(),
                });
            }
        }
        self.expect("}")?;
        Ok(Stmt::Switch { scrutinee, cases, span })
    }

    fn parse_case_body(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.check("case") && !self.check("default") && !self.check("}") {
            body.push(self.parse_stmt()?);
        }
        Ok(body)
    }

    fn parse_assign_or_expr_stmt(&mut self) -> PResult<Stmt> {
        let span = self.here_span();
        if let Some((target, op)) = self.try_parse_lvalue_and_assign_op()? {
            let value = self.parse_expr()?;
            self.expect(";")?;
            return Ok(Stmt::Assign { target, op, value, span });
        }
        let expr = self.parse_expr()?;
        self.expect(";")?;
        Ok(Stmt::ExprStmt { expr, span })
    }

    /// Looks ahead for `lvalue assign-op`; on match, consumes the lvalue and
    /// operator and returns them. On no match, consumes nothing.
    fn try_parse_lvalue_and_assign_op(&mut self) -> PResult<Option<(LValue, AssignOp)>> {
        let save = self.pos;
        let lvalue = match self.try_parse_lvalue()? {
            Some(l) => l,
            None => return Ok(None),
        };
        let op = match self.peek().map(|t| &*t.text) {
            Some("=") => Some(AssignOp::Assign),
            Some("+=") => Some(AssignOp::AddAssign),
            Some("-=") => Some(AssignOp::SubAssign),
            Some("*=") => Some(AssignOp::MulAssign),
            Some("/=") => Some(AssignOp::DivAssign),
            Some("%=") => Some(AssignOp::ModAssign),
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                Ok(Some((lvalue, op)))
            }
            None => {
                self.pos = save;
                Ok(None)
            }
        }
    }

    fn try_parse_lvalue(&mut self) -> PResult<Option<LValue>> {
        if !self.check_kind(TokenKind::Ident) {
            return Ok(None);
        }
        let name_tok = self.peek().unwrap().clone();
        if let Some(array) = HwArray::from_name(&name_tok.text) {
            if self.peek_n(1).map(|t| &*t.text) == Some("[") {
                self.advance();
                self.advance(); // '['
                let index = Box::new(self.parse_expr()?);
                self.expect("]")?;
                return Ok(Some(LValue::HwIndex {
                    array,
                    index,
                    span: name_tok.span,
                }));
            }
        }
        // A bare ident followed immediately by `(` is a call, not an lvalue.
        if self.peek_n(1).map(|t| &*t.text) == Some("(") {
            return Ok(None);
        }
        self.advance();
        Ok(Some(LValue::Ident {
            name: name_tok.text.to_string(),
            span: name_tok.span,
        }))
    }

    // --- Expressions, precedence-climbing, weakest-binds-first order ---

    pub fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_and()?;
        while self.check("||") {
            let span = self.advance().unwrap().span;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_bitor()?;
        while self.check("&&") {
            let span = self.advance().unwrap().span;
            let rhs = self.parse_bitor()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_bitxor()?;
        while self.check("|") {
            let span = self.advance().unwrap().span;
            let rhs = self.parse_bitxor()?;
            lhs = Expr::Binary {
                op: BinaryOp::BitOr,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_bitxor(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_bitand()?;
        while self.check("^") {
            let span = self.advance().unwrap().span;
            let rhs = self.parse_bitand()?;
            lhs = Expr::Binary {
                op: BinaryOp::BitXor,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.check("&") {
            let span = self.advance().unwrap().span;
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary {
                op: BinaryOp::BitAnd,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                span,
            };
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek().map(|t| &*t.text) {
                Some("==") => BinaryOp::Eq,
                Some("!=") => BinaryOp::Ne,
                _ => break,
            };
            let span = self.advance().unwrap().span;
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek().map(|t| &*t.text) {
                Some("<") => BinaryOp::Lt,
                Some("<=") => BinaryOp::Le,
                Some(">") => BinaryOp::Gt,
                Some(">=") => BinaryOp::Ge,
                _ => break,
            };
            let span = self.advance().unwrap().span;
            let rhs = self.parse_shift()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek().map(|t| &*t.text) {
                Some("<<") => BinaryOp::Shl,
                Some(">>") => BinaryOp::Shr,
                _ => break,
            };
            let span = self.advance().unwrap().span;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &*t.text) {
                Some("+") => BinaryOp::Add,
                Some("-") => BinaryOp::Sub,
                _ => break,
            };
            let span = self.advance().unwrap().span;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|t| &*t.text) {
                Some("*") => BinaryOp::Mul,
                Some("/") => BinaryOp::Div,
                Some("%") => BinaryOp::Mod,
                _ => break,
            };
            let span = self.advance().unwrap().span;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), span };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let op = match self.peek().map(|t| &*t.text) {
            Some("-") => Some(UnaryOp::Neg),
            Some("!") => Some(UnaryOp::Not),
            Some("~") => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.advance().unwrap().span;
            let operand = Box::new(self.parse_unary()?);
            return Ok(Expr::Unary { op, operand, span });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let tok = self.peek().cloned().ok_or_else(|| CompileError::Parse {
            span: self.last_span(),
            message: "unexpected end of expression".into(),
        })?;

        match tok.kind {
            TokenKind::Int => {
                self.advance();
                Ok(Expr::IntLit {
                    value: tok.int_value.unwrap_or(0),
                    span: tok.span,
                })
            }
            TokenKind::Char => {
                self.advance();
                Ok(Expr::IntLit {
                    value: tok.int_value.unwrap_or(0),
                    span: tok.span,
                })
            }
            TokenKind::String => {
                self.advance();
                Ok(Expr::StrLit {
                    value: tok.text.to_string(),
                    span: tok.span,
                })
            }
            TokenKind::Ident => {
                if let Some(array) = HwArray::from_name(&tok.text) {
                    if self.peek_n(1).map(|t| &*t.text) == Some("[") {
                        self.advance();
                        self.advance(); // '['
                        let index = Box::new(self.parse_expr()?);
                        self.expect("]")?;
                        return Ok(Expr::HwIndex { array, index, span: tok.span });
                    }
                }
                if self.peek_n(1).map(|t| &*t.text) == Some("(") {
                    self.advance();
                    self.advance(); // '('
                    let mut args = Vec::new();
                    if !self.check(")") {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(",") {
                                break;
                            }
                        }
                    }
                    self.expect(")")?;
                    return Ok(Expr::Call {
                        callee: tok.text.to_string(),
                        args,
                        span: tok.span,
                    });
                }
                self.advance();
                Ok(Expr::Ident {
                    name: tok.text.to_string(),
                    span: tok.span,
                })
            }
            TokenKind::Punct if &*tok.text == "(" => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(")")?;
                Ok(Expr::Paren {
                    inner: Box::new(inner),
                    span: tok.span,
                })
            }
            _ => Err(CompileError::Parse {
                span: tok.span,
                message: format!("unexpected token `{}` in expression", tok.text),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Tokenizer;

    fn parse(src: &str) -> Program {
        let mut toks = Tokenizer::new(0, src).tokenize().unwrap();
        toks.retain(|t| t.kind != TokenKind::Eof && t.kind != TokenKind::Newline && t.kind != TokenKind::Directive);
        Parser::new(&toks).parse_program().unwrap()
    }

    #[test]
    fn parses_global_and_function() {
        let p = parse("var counter = 0; main() { counter = counter + 1; }");
        assert_eq!(p.globals.len(), 1);
        assert_eq!(p.globals[0].name, "counter");
        assert_eq!(p.functions.len(), 1);
        assert_eq!(p.functions[0].name, "main");
    }

    #[test]
    fn parses_if_while_for_switch() {
        let p = parse(
            r#"
            main() {
                if (1) { echo("a"); } else { echo("b"); }
                while (1) { break; }
                for (var i = 0; i < 10; i = i + 1) { continue; }
                switch (1) { case 1: echo("x"); break; default: echo("y"); }
            }
            "#,
        );
        assert_eq!(p.functions[0].body.len(), 4);
    }

    #[test]
    fn parses_hw_array_index_and_call() {
        let p = parse("main() { sys[1] = 2; echo(ram[0]); }");
        assert_eq!(p.functions[0].body.len(), 2);
    }

    #[test]
    fn parses_label_and_goto() {
        let p = parse("main() { top: goto top; }");
        match &p.functions[0].body[0] {
            Stmt::Label { name, .. } => assert_eq!(name, "top"),
            other => panic!("expected label, got {:?}", other),
        }
    }

    #[test]
    fn preserves_parenthesization_s3() {
        let p = parse("var x = (2*(1+1))*3;");
        match &p.globals[0].init {
            Some(Expr::Binary { lhs, .. }) => {
                assert!(matches!(**lhs, Expr::Paren { .. }));
            }
            other => panic!("expected binary expr, got {:?}", other),
        }
    }
}
