//! Constant-expression evaluator for `#if`/`#elif` conditions (spec §4.2).
//!
//! Operates on the raw token slice of the directive's tail. `defined(X)` and
//! `defined X` are recognized before macro expansion runs (so expansion
//! can't hide or fabricate a `defined` test); everything else is macro-
//! expanded first, then evaluated as a C-style constant integer expression.
//! An identifier that survives expansion unexpanded (not a macro) evaluates
//! to `0`, matching standard preprocessor behavior.

use crate::diagnostics::{CompileError, Span, Warning};
use crate::macros::{Expander, MacroTable};
use crate::token::{Token, TokenKind};

pub fn eval(table: &MacroTable, tokens: &[Token], span: Span, warnings: &mut Vec<Warning>) -> Result<i64, CompileError> {
    let substituted = substitute_defined(table, tokens);
    let mut expander = Expander::new(table);
    let expanded = expander.expand(substituted)?;
    warnings.extend(expander.warnings);

    let mut parser = ExprParser {
        toks: &expanded,
        pos: 0,
        span,
        warnings,
    };
    let value = parser.parse_expr(0)?;
    if parser.pos != parser.toks.len() {
        return Err(CompileError::Preprocessor {
            span,
            message: format!("trailing tokens in #if condition near `{}`", parser.toks[parser.pos].text),
        });
    }
    Ok(value)
}

/// Replaces `defined(NAME)` / `defined NAME` with a literal `1`/`0` token
/// before any macro expansion sees the expression.
fn substitute_defined(table: &MacroTable, tokens: &[Token]) -> Vec<Token> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if &*tokens[i].text == "defined" {
            let (name, consumed) = if tokens.get(i + 1).map(|t| &*t.text) == Some("(") {
                let name = tokens.get(i + 2).map(|t| t.text.to_string());
                (name, 4)
            } else {
                (tokens.get(i + 1).map(|t| t.text.to_string()), 2)
            };
            if let Some(name) = name {
                let value = if table.is_defined(&name) { "1" } else { "0" };
                let mut lit = tokens[i].clone();
                lit.kind = TokenKind::Int;
                lit.text = value.into();
                lit.int_value = Some(if value == "1" { 1 } else { 0 });
                out.push(lit);
                i += consumed;
                continue;
            }
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    out
}

struct ExprParser<'a> {
    toks: &'a [Token],
    pos: usize,
    span: Span,
    warnings: &'a mut Vec<Warning>,
}

/// Binding powers, loosest first, matching C's precedence ladder restricted
/// to what spec.md §4.2 lists for `#if` conditions.
const PREC_LEVELS: &[&[&str]] = &[
    &["||"],
    &["&&"],
    &["|"],
    &["^"],
    &["&"],
    &["==", "!="],
    &["<", "<=", ">", ">="],
    &["<<", ">>"],
    &["+", "-"],
    &["*", "/", "%"],
];

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn parse_expr(&mut self, level: usize) -> Result<i64, CompileError> {
        if level >= PREC_LEVELS.len() {
            return self.parse_unary();
        }
        let mut lhs = self.parse_expr(level + 1)?;
        while let Some(op) = self.peek().map(|t| t.text.to_string()) {
            if !PREC_LEVELS[level].contains(&op.as_str()) {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_expr(level + 1)?;
            lhs = apply_binop(&op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<i64, CompileError> {
        match self.peek().map(|t| &*t.text) {
            Some("!") => {
                self.pos += 1;
                let v = self.parse_unary()?;
                Ok(if v == 0 { 1 } else { 0 })
            }
            Some("-") => {
                self.pos += 1;
                Ok(-self.parse_unary()?)
            }
            Some("~") => {
                self.pos += 1;
                Ok(!self.parse_unary()?)
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<i64, CompileError> {
        let tok = self.peek().cloned().ok_or_else(|| CompileError::Preprocessor {
            span: self.span,
            message: "unexpected end of #if condition".into(),
        })?;
        match tok.kind {
            TokenKind::Int => {
                self.pos += 1;
                Ok(tok.int_value.unwrap_or(0))
            }
            TokenKind::Punct if &*tok.text == "(" => {
                self.pos += 1;
                let v = self.parse_expr(0)?;
                match self.peek() {
                    Some(t) if &*t.text == ")" => {
                        self.pos += 1;
                        Ok(v)
                    }
                    _ => Err(CompileError::Preprocessor {
                        span: tok.span,
                        message: "expected `)` in #if condition".into(),
                    }),
                }
            }
            TokenKind::Ident => {
                self.pos += 1;
                self.warnings.push(Warning {
                    span: tok.span,
                    message: format!("undefined identifier `{}` in #if condition treated as 0", tok.text),
                });
                Ok(0)
            }
            _ => Err(CompileError::Preprocessor {
                span: tok.span,
                message: format!("unexpected token `{}` in #if condition", tok.text),
            }),
        }
    }
}

fn apply_binop(op: &str, a: i64, b: i64) -> i64 {
    match op {
        "||" => {
            if a != 0 || b != 0 {
                1
            } else {
                0
            }
        }
        "&&" => {
            if a != 0 && b != 0 {
                1
            } else {
                0
            }
        }
        "|" => a | b,
        "^" => a ^ b,
        "&" => a & b,
        "==" => (a == b) as i64,
        "!=" => (a != b) as i64,
        "<" => (a < b) as i64,
        "<=" => (a <= b) as i64,
        ">" => (a > b) as i64,
        ">=" => (a >= b) as i64,
        "<<" => a.wrapping_shl(b as u32),
        ">>" => a.wrapping_shr(b as u32),
        "+" => a.wrapping_add(b),
        "-" => a.wrapping_sub(b),
        "*" => a.wrapping_mul(b),
        "/" => {
            if b == 0 {
                0
            } else {
                a.wrapping_div(b)
            }
        }
        "%" => {
            if b == 0 {
                0
            } else {
                a.wrapping_rem(b)
            }
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::{Macro, MacroKind};
    use crate::token::Tokenizer;

    fn toks(src: &str) -> Vec<Token> {
        let mut v = Tokenizer::new(0, src).tokenize().unwrap();
        v.pop();
        v
    }

    #[test]
    fn simple_arithmetic() {
        let table = MacroTable::new();
        let mut warnings = Vec::new();
        let v = eval(&table, &toks("1 + 2 * 3"), Span::dummy(), &mut warnings).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn defined_true_and_false() {
        let mut table = MacroTable::new();
        table.define(Macro {
            name: "FEATURE_X".into(),
            kind: MacroKind::Object,
            replacement: toks("1"),
            defined_at: Span::dummy(),
        });
        let mut warnings = Vec::new();
        assert_eq!(eval(&table, &toks("defined(FEATURE_X)"), Span::dummy(), &mut warnings).unwrap(), 1);
        assert_eq!(eval(&table, &toks("defined(FEATURE_Y)"), Span::dummy(), &mut warnings).unwrap(), 0);
        assert_eq!(eval(&table, &toks("defined FEATURE_X"), Span::dummy(), &mut warnings).unwrap(), 1);
    }

    #[test]
    fn macro_constant_used_in_condition() {
        let mut table = MacroTable::new();
        table.define(Macro {
            name: "VERSION".into(),
            kind: MacroKind::Object,
            replacement: toks("3"),
            defined_at: Span::dummy(),
        });
        let mut warnings = Vec::new();
        let v = eval(&table, &toks("VERSION >= 2"), Span::dummy(), &mut warnings).unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn logical_and_or_short_circuit_value_only() {
        let table = MacroTable::new();
        let mut warnings = Vec::new();
        assert_eq!(eval(&table, &toks("0 && 1"), Span::dummy(), &mut warnings).unwrap(), 0);
        assert_eq!(eval(&table, &toks("0 || 1"), Span::dummy(), &mut warnings).unwrap(), 1);
    }
}
