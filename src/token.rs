//! Source reader and tokenizer.
//!
//! Turns a file's bytes into a stream of [`Token`]s with preserved origin
//! spans. Comments are stripped here; line continuations (`\` at end of
//! line) are joined before punctuation/identifier scanning so multi-line
//! macro bodies see one logical line.

use std::fmt;
use std::rc::Rc;

use crate::diagnostics::{CompileError, ExpansionChain, Span};

/// Index into the driver's file table. Kept distinct from a raw `usize` so
/// spans can't be built against the wrong table by accident.
pub type FileId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Int,
    String,
    Char,
    /// Punctuation, including multi-char operators (`==`, `<<`, `&&`, ...).
    Punct,
    /// A `#`-prefixed directive keyword, e.g. `#define`, `#if`.
    Directive,
    Newline,
    Eof,
}

/// One token. `text` is the literal source slice (for idents/punct) or the
/// already-unescaped payload (for string/char literals).
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: Rc<str>,
    pub span: Span,
    /// Parsed value for `Int` tokens; `None` for all other kinds.
    pub int_value: Option<i64>,
    /// Macro expansion sites this token passed through, innermost first.
    /// Empty for tokens straight out of the tokenizer.
    pub expansion: ExpansionChain,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<Rc<str>>, span: Span) -> Self {
        Token {
            kind,
            text: text.into(),
            span,
            int_value: None,
            expansion: ExpansionChain::empty(),
        }
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Maps byte offsets in a single file's source to 1-based line/column pairs.
pub struct LineIndex {
    /// Byte offset of the start of each line.
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        LineIndex { line_starts }
    }

    /// 1-based (line, column).
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(l) => l,
            Err(l) => l - 1,
        };
        let col = offset - self.line_starts[line];
        (line + 1, col + 1)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

const MULTI_CHAR_PUNCT: &[&str] = &[
    "<<", ">>", "==", "!=", "<=", ">=", "&&", "||", "++", "--", "+=", "-=", "*=", "/=", "%=",
    "##", "...",
];

/// Tokenizes one file's bytes. Line continuations (`\` immediately before a
/// newline) are spliced before scanning begins, so spans reported for
/// tokens inside a continued line point at the *physical* line they
/// actually occur on (the continuation itself is simply elided).
pub struct Tokenizer<'a> {
    file: FileId,
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    lines: LineIndex,
}

impl<'a> Tokenizer<'a> {
    pub fn new(file: FileId, src: &'a str) -> Self {
        Tokenizer {
            file,
            src,
            bytes: src.as_bytes(),
            pos: 0,
            lines: LineIndex::new(src),
        }
    }

    fn span(&self, start: usize, end: usize) -> Span {
        let (sl, sc) = self.lines.line_col(start);
        let (el, ec) = self.lines.line_col(end);
        Span {
            file: self.file,
            start_line: sl,
            start_col: sc,
            end_line: el,
            end_col: ec,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.bytes.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Skip a line-continuation `\` followed immediately by `\n` (or `\r\n`).
    /// Returns true if one was consumed.
    fn try_skip_continuation(&mut self) -> bool {
        if self.peek() == Some(b'\\') {
            let mut p = self.pos + 1;
            if self.bytes.get(p) == Some(&b'\r') {
                p += 1;
            }
            if self.bytes.get(p) == Some(&b'\n') {
                self.pos = p + 1;
                return true;
            }
        }
        false
    }

    fn skip_ws_and_comments(&mut self) -> Result<(), CompileError> {
        loop {
            if self.try_skip_continuation() {
                continue;
            }
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.pos += 1;
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while self.peek().is_some() && self.peek() != Some(b'\n') {
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        match self.peek() {
                            None => {
                                return Err(CompileError::Lexical {
                                    span: self.span(start, self.pos),
                                    message: "unterminated block comment".into(),
                                });
                            }
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.pos += 2;
                                break;
                            }
                            _ => {
                                self.pos += 1;
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Produces the full token stream for this file, ending with `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        let mut out = Vec::new();
        loop {
            self.skip_ws_and_comments()?;
            match self.peek() {
                None => {
                    out.push(Token::new(TokenKind::Eof, "", self.span(self.pos, self.pos)));
                    break;
                }
                Some(b'\n') => {
                    let start = self.pos;
                    self.pos += 1;
                    out.push(Token::new(TokenKind::Newline, "\n", self.span(start, self.pos)));
                }
                Some(b'#') => out.push(self.scan_directive()?),
                Some(b'"') => out.push(self.scan_string()?),
                Some(b'\'') => out.push(self.scan_char()?),
                Some(c) if c.is_ascii_digit() => out.push(self.scan_number()?),
                Some(c) if is_ident_start(c as char) => out.push(self.scan_ident()),
                Some(_) => out.push(self.scan_punct()?),
            }
        }
        Ok(out)
    }

    fn scan_directive(&mut self) -> Result<Token, CompileError> {
        let start = self.pos;
        self.pos += 1; // '#'
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
        let name_start = self.pos;
        while self.peek().map(|c| is_ident_continue(c as char)).unwrap_or(false) {
            self.pos += 1;
        }
        let text = format!("#{}", &self.src[name_start..self.pos]);
        Ok(Token::new(TokenKind::Directive, text, self.span(start, self.pos)))
    }

    fn scan_ident(&mut self) -> Token {
        let start = self.pos;
        while self.peek().map(|c| is_ident_continue(c as char)).unwrap_or(false) {
            self.pos += 1;
        }
        Token::new(TokenKind::Ident, &self.src[start..self.pos], self.span(start, self.pos))
    }

    fn scan_number(&mut self) -> Result<Token, CompileError> {
        let start = self.pos;
        let (radix, digits_start) = if self.peek() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            self.pos += 2;
            (16, self.pos)
        } else if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'b') | Some(b'B')) {
            self.pos += 2;
            (2, self.pos)
        } else {
            (10, self.pos)
        };

        while matches!(self.peek(), Some(c) if (c as char).is_ascii_hexdigit() || c == b'_') {
            self.pos += 1;
        }
        let raw = &self.src[digits_start..self.pos];
        let digits: String = raw.chars().filter(|c| *c != '_').collect();
        if digits.is_empty() {
            return Err(CompileError::Lexical {
                span: self.span(start, self.pos),
                message: "malformed integer literal: no digits".into(),
            });
        }

        let value: i64 = match radix {
            10 => digits.parse::<i64>().map_err(|_| CompileError::Lexical {
                span: self.span(start, self.pos),
                message: format!("decimal literal '{}' does not fit in 32-bit signed range", digits),
            })?,
            16 => {
                let v = u32::from_str_radix(&digits, 16).map_err(|_| CompileError::Lexical {
                    span: self.span(start, self.pos),
                    message: format!("invalid hex literal '0x{}'", digits),
                })?;
                v as i32 as i64
            }
            2 => {
                let v = u32::from_str_radix(&digits, 2).map_err(|_| CompileError::Lexical {
                    span: self.span(start, self.pos),
                    message: format!("invalid binary literal '0b{}'", digits),
                })?;
                v as i32 as i64
            }
            _ => unreachable!(),
        };

        if radix == 10 && (value > i32::MAX as i64 || value < i32::MIN as i64) {
            return Err(CompileError::Lexical {
                span: self.span(start, self.pos),
                message: format!("decimal literal '{}' does not fit in 32-bit signed range", digits),
            });
        }

        let mut tok = Token::new(TokenKind::Int, &self.src[start..self.pos], self.span(start, self.pos));
        tok.int_value = Some(value);
        Ok(tok)
    }

    fn scan_escape(&mut self, start: usize) -> Result<char, CompileError> {
        self.pos += 1; // consume backslash
        let c = self.bump().ok_or_else(|| CompileError::Lexical {
            span: self.span(start, self.pos),
            message: "unterminated escape sequence".into(),
        })?;
        match c {
            b'n' => Ok('\n'),
            b't' => Ok('\t'),
            b'"' => Ok('"'),
            b'\\' => Ok('\\'),
            b'\'' => Ok('\''),
            other => Err(CompileError::Lexical {
                span: self.span(start, self.pos),
                message: format!("invalid escape sequence '\\{}'", other as char),
            }),
        }
    }

    fn scan_string(&mut self) -> Result<Token, CompileError> {
        let start = self.pos;
        self.pos += 1; // opening quote
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    return Err(CompileError::Lexical {
                        span: self.span(start, self.pos),
                        message: "unterminated string literal".into(),
                    });
                }
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => value.push(self.scan_escape(start)?),
                Some(_) => {
                    let ch = self.src[self.pos..].chars().next().unwrap();
                    value.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
        Ok(Token::new(TokenKind::String, value, self.span(start, self.pos)))
    }

    fn scan_char(&mut self) -> Result<Token, CompileError> {
        let start = self.pos;
        self.pos += 1; // opening quote
        let value = match self.peek() {
            Some(b'\\') => self.scan_escape(start)?,
            Some(_) => {
                let ch = self.src[self.pos..].chars().next().unwrap();
                self.pos += ch.len_utf8();
                ch
            }
            None => {
                return Err(CompileError::Lexical {
                    span: self.span(start, self.pos),
                    message: "unterminated character literal".into(),
                });
            }
        };
        if self.peek() != Some(b'\'') {
            return Err(CompileError::Lexical {
                span: self.span(start, self.pos),
                message: "unterminated character literal".into(),
            });
        }
        self.pos += 1;
        let mut tok = Token::new(TokenKind::Char, value.to_string(), self.span(start, self.pos));
        tok.int_value = Some(value as i64);
        Ok(tok)
    }

    fn scan_punct(&mut self) -> Result<Token, CompileError> {
        let start = self.pos;
        for candidate in MULTI_CHAR_PUNCT {
            if self.src[self.pos..].starts_with(candidate) {
                self.pos += candidate.len();
                return Ok(Token::new(TokenKind::Punct, *candidate, self.span(start, self.pos)));
            }
        }
        let ch = self.src[self.pos..].chars().next().unwrap();
        self.pos += ch.len_utf8();
        Ok(Token::new(TokenKind::Punct, ch.to_string(), self.span(start, self.pos)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        Tokenizer::new(0, src).tokenize().unwrap()
    }

    #[test]
    fn decimal_hex_binary_literals() {
        let t = toks("10 0x1F 0b101 0xFF_FF");
        let ints: Vec<i64> = t.iter().filter_map(|t| t.int_value).collect();
        assert_eq!(ints, vec![10, 31, 5, 0xFFFF]);
    }

    #[test]
    fn negative_decimal_out_of_range_is_lexical_error() {
        let err = Tokenizer::new(0, "99999999999").tokenize();
        assert!(err.is_err());
    }

    #[test]
    fn hex_takes_full_32_bit_unsigned_space() {
        let t = toks("0x80000000");
        assert_eq!(t[0].int_value, Some(0x80000000u32 as i32 as i64));
    }

    #[test]
    fn string_escapes() {
        let t = toks(r#""a\nb\t\"c\\""#);
        assert_eq!(&*t[0].text, "a\nb\t\"c\\");
    }

    #[test]
    fn char_literal_is_ascii_code() {
        let t = toks("'A'");
        assert_eq!(t[0].int_value, Some(65));
    }

    #[test]
    fn line_comment_stripped() {
        let t = toks("1 // comment\n2");
        let kinds: Vec<_> = t.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Int,
                TokenKind::Newline,
                TokenKind::Int,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn block_comment_stripped() {
        let t = toks("1 /* multi\nline */ 2");
        let kinds: Vec<_> = t.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::Int, TokenKind::Int, TokenKind::Eof]);
    }

    #[test]
    fn line_continuation_joins_physical_lines() {
        let t = toks("#define FOO 1 + \\\n2\nFOO");
        // directive line stays logically one line; FOO use is on physical line 2
        let ident = t.iter().find(|t| &*t.text == "FOO" && t.kind == TokenKind::Ident).unwrap();
        assert_eq!(ident.span.start_line, 2);
    }

    #[test]
    fn multi_char_punct_recognized() {
        let t = toks("a << b == c");
        let puncts: Vec<&str> = t
            .iter()
            .filter(|t| t.kind == TokenKind::Punct)
            .map(|t| &*t.text)
            .collect();
        assert_eq!(puncts, vec!["<<", "=="]);
    }

    #[test]
    fn directive_token() {
        let t = toks("#define X 1");
        assert_eq!(t[0].kind, TokenKind::Directive);
        assert_eq!(&*t[0].text, "#define");
    }
}
