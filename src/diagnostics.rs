//! Error taxonomy (spec §7) and diagnostic rendering.
//!
//! Every error that can escape a pipeline stage is one variant of
//! [`CompileError`]. Each variant carries a primary [`Span`] and, where the
//! offending token could have originated inside a macro expansion, the
//! chain of expansion sites that produced it (`expanded_from`).

use std::fmt;

use codespan_reporting::diagnostic::{Diagnostic, Label};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term::{self, termcolor::Buffer};

use crate::token::FileId;

/// A source range within a single file. Line/column are 1-based, matching
/// the convention set by `token::LineIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub file: FileId,
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl Span {
    pub fn dummy() -> Self {
        Span {
            file: 0,
            start_line: 0,
            start_col: 0,
            end_line: 0,
            end_col: 0,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start_line, self.start_col)
    }
}

/// One link in a token's macro-expansion history: "this token came from
/// expanding macro `name`, invoked at `site`".
#[derive(Debug, Clone)]
pub struct ExpansionLink {
    pub macro_name: String,
    pub site: Span,
}

/// The full history attached to a token that a diagnostic wants to explain.
#[derive(Debug, Clone, Default)]
pub struct ExpansionChain(pub Vec<ExpansionLink>);

impl ExpansionChain {
    pub fn empty() -> Self {
        ExpansionChain(Vec::new())
    }

    pub fn push(&mut self, link: ExpansionLink) {
        self.0.push(link);
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("{message}")]
    Lexical { span: Span, message: String },

    #[error("{message}")]
    Preprocessor { span: Span, message: String },

    #[error("{message}")]
    Macro {
        span: Span,
        message: String,
        chain: ExpansionChain,
    },

    #[error("{message}")]
    Parse { span: Span, message: String },

    #[error("{message}")]
    Semantic { span: Span, message: String },

    #[error("{message}")]
    Lowering { span: Span, message: String },

    #[error("internal compiler error: {message}")]
    Internal { span: Span, message: String },
}

impl CompileError {
    pub fn span(&self) -> Span {
        match self {
            CompileError::Lexical { span, .. }
            | CompileError::Preprocessor { span, .. }
            | CompileError::Macro { span, .. }
            | CompileError::Parse { span, .. }
            | CompileError::Semantic { span, .. }
            | CompileError::Lowering { span, .. }
            | CompileError::Internal { span, .. } => *span,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CompileError::Internal { .. } => 3,
            _ => 1,
        }
    }
}

/// Non-fatal diagnostics (unknown pragma, overload use site left
/// unexpanded, unresolved `#if` identifier, dead branch with a side
/// effect...) collected during compilation rather than aborting it.
#[derive(Debug, Clone)]
pub struct Warning {
    pub span: Span,
    pub message: String,
}

/// Registry mapping `FileId` to a name and source text, used only to turn
/// a [`CompileError`] into human-readable text at the CLI boundary.
#[derive(Default)]
pub struct FileTable {
    files: SimpleFiles<String, String>,
    ids: Vec<FileId>,
}

impl FileTable {
    pub fn new() -> Self {
        FileTable::default()
    }

    pub fn add(&mut self, id: FileId, name: impl Into<String>, source: impl Into<String>) {
        let idx = self.files.add(name.into(), source.into());
        debug_assert_eq!(idx, self.ids.len());
        self.ids.push(id);
    }

    fn codespan_id(&self, file: FileId) -> usize {
        self.ids.iter().position(|id| *id == file).unwrap_or(0)
    }

    fn byte_offset(&self, file: FileId, line: usize, col: usize) -> usize {
        let idx = self.codespan_id(file);
        let source = self.files.source(idx).map(|s| s.as_str()).unwrap_or("");
        let mut offset = 0;
        for (n, l) in source.split('\n').enumerate() {
            if n + 1 == line {
                return offset + col.saturating_sub(1);
            }
            offset += l.len() + 1;
        }
        offset
    }

    /// Render `err` as a colorized, file:line:col-annotated report, the
    /// same text the CLI writes to stderr on a compilation failure.
    pub fn render(&self, err: &CompileError) -> String {
        let primary = err.span();
        let start = self.byte_offset(primary.file, primary.start_line, primary.start_col);
        let end = self
            .byte_offset(primary.file, primary.end_line, primary.end_col)
            .max(start + 1);

        let mut labels = vec![Label::primary(self.codespan_id(primary.file), start..end)];

        if let CompileError::Macro { chain, .. } = err {
            for link in &chain.0 {
                let s = self.byte_offset(link.site.file, link.site.start_line, link.site.start_col);
                let e = self
                    .byte_offset(link.site.file, link.site.end_line, link.site.end_col)
                    .max(s + 1);
                labels.push(
                    Label::secondary(self.codespan_id(link.site.file), s..e)
                        .with_message(format!("expanded from macro `{}`", link.macro_name)),
                );
            }
        }

        let diagnostic = Diagnostic::error()
            .with_message(err.to_string())
            .with_labels(labels);

        let mut buffer = Buffer::no_color();
        let config = term::Config::default();
        let _ = term::emit(&mut buffer, &config, &self.files, &diagnostic);
        String::from_utf8_lossy(buffer.as_slice()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_primary_span() {
        let mut files = FileTable::new();
        files.add(0, "main.c", "var x;\nbad syntax here;\n");
        let err = CompileError::Parse {
            span: Span {
                file: 0,
                start_line: 2,
                start_col: 1,
                end_line: 2,
                end_col: 4,
            },
            message: "unexpected token".into(),
        };
        let rendered = files.render(&err);
        assert!(rendered.contains("unexpected token"));
        assert!(rendered.contains("main.c"));
    }

    #[test]
    fn macro_error_includes_expansion_chain() {
        let mut files = FileTable::new();
        files.add(0, "main.c", "FOO(1)\n");
        let mut chain = ExpansionChain::empty();
        chain.push(ExpansionLink {
            macro_name: "FOO".into(),
            site: Span {
                file: 0,
                start_line: 1,
                start_col: 1,
                end_line: 1,
                end_col: 4,
            },
        });
        let err = CompileError::Macro {
            span: Span {
                file: 0,
                start_line: 1,
                start_col: 1,
                end_line: 1,
                end_col: 7,
            },
            message: "arity mismatch".into(),
            chain,
        };
        let rendered = files.render(&err);
        assert!(rendered.contains("expanded from macro `FOO`"));
    }

    #[test]
    fn internal_error_exit_code_is_three() {
        let err = CompileError::Internal {
            span: Span::dummy(),
            message: "invariant violated".into(),
        };
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn parse_error_exit_code_is_one() {
        let err = CompileError::Parse {
            span: Span::dummy(),
            message: "x".into(),
        };
        assert_eq!(err.exit_code(), 1);
    }
}
