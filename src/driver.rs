//! Pipeline orchestration (spec §6), used by both `lib.rs`'s entry points
//! and `main.rs`. Grounded on the teacher's `compile_file`/`compile_to_ir`
//! pair in `lib.rs`: one entry point that takes a path and writes a file,
//! one that takes/returns strings for tests, both delegating to the same
//! staged pipeline.
//!
//! Each stage is wrapped in a [`tracing::info_span!`] so `-v` turns the
//! compilation into a structured trace (tokenize → preprocess → parse →
//! semantic → lower → render) instead of ad hoc `eprintln!` noise.

use std::path::{Path, PathBuf};

use crate::diagnostics::{CompileError, FileTable, Span};
use crate::ir::IrProgram;
use crate::pragma::PragmaSet;
use crate::preprocessor::{FileSystem, Preprocessor, RealFs};
use crate::token::{Token, TokenKind};
use crate::{lower, parser, render, semantic};

/// Everything produced by a successful compilation, short of writing it to
/// disk — used directly by tests and by `--emit-ir`.
pub struct CompileResult {
    pub ir: IrProgram,
    pub pragmas: PragmaSet,
    pub rendered: String,
}

#[derive(Default)]
pub struct CompileOptions {
    pub include_paths: Vec<PathBuf>,
    pub pragma_overrides: Vec<(String, Option<String>)>,
}

/// Runs the full pipeline against a file on disk.
pub fn compile_file(path: &Path, options: &CompileOptions) -> Result<CompileResult, CompileError> {
    compile_with_fs(&RealFs, path, options)
}

pub fn compile_with_fs(fs: &dyn FileSystem, path: &Path, options: &CompileOptions) -> Result<CompileResult, CompileError> {
    let tokenize_span = tracing::info_span!("preprocess", file = %path.display());
    let _guard = tokenize_span.enter();

    let mut pp = Preprocessor::new(fs, options.include_paths.clone());
    let mut tokens = pp.process_file(path)?;
    apply_cli_pragma_overrides(&mut pp.pragmas, &options.pragma_overrides)?;
    for w in &pp.warnings {
        tracing::warn!(span = %w.span, "{}", w.message);
    }
    drop(_guard);

    strip_non_semantic(&mut tokens);

    let program = {
        let _g = tracing::info_span!("parse", tokens = tokens.len()).entered();
        parser::Parser::new(&tokens).parse_program()?
    };

    let semantic_result = {
        let _g = tracing::info_span!("semantic", functions = program.functions.len()).entered();
        semantic::analyze(&program, &pp.pragmas)?
    };

    let ir = {
        let _g = tracing::info_span!("lower").entered();
        lower::lower(&program, &semantic_result, &pp.pragmas)?
    };

    let rendered = {
        let _g = tracing::info_span!("render", dialect = ?pp.pragmas.renderer).entered();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("input").to_string();
        render::render(&ir, &pp.pragmas, &name)
    };

    Ok(CompileResult { ir, pragmas: pp.pragmas, rendered })
}

/// Same pipeline, entry point for in-memory source (tests, `compile_to_ir`
/// equivalents) without touching the real filesystem.
pub fn compile_source(source: &str, options: &CompileOptions) -> Result<CompileResult, CompileError> {
    let fs = SingleFileFs { source: source.to_string() };
    compile_with_fs(&fs, Path::new("input.c"), options)
}

struct SingleFileFs {
    source: String,
}

impl FileSystem for SingleFileFs {
    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        if path == Path::new("input.c") {
            Ok(self.source.clone())
        } else {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
        }
    }
    fn exists(&self, path: &Path) -> bool {
        path == Path::new("input.c")
    }
}

fn apply_cli_pragma_overrides(pragmas: &mut PragmaSet, overrides: &[(String, Option<String>)]) -> Result<(), CompileError> {
    for (name, value) in overrides {
        pragmas.apply(name, value.as_deref()).map_err(|message| CompileError::Preprocessor {
            span: Span::dummy(),
            message: format!("--pragma {}: {}", name, message),
        })?;
    }
    Ok(())
}

/// Drops whitespace-only token kinds the parser doesn't want to see:
/// `Newline` (directive-line boundaries only matter to the preprocessor)
/// and any stray `Directive` token that survived because it was inside an
/// inactive-but-malformed conditional region. `Eof` is kept as the
/// parser's own sentinel.
fn strip_non_semantic(tokens: &mut Vec<Token>) {
    tokens.retain(|t| !matches!(t.kind, TokenKind::Newline | TokenKind::Directive));
}

/// Writes a [`CompileResult`] to `output_path`, returning an I/O error
/// (spec §6 exit code 2) on failure rather than a [`CompileError`].
pub fn write_output(result: &CompileResult, output_path: &Path) -> std::io::Result<()> {
    std::fs::write(output_path, &result.rendered)
}

/// Renders `err` against the file table the preprocessor built up while
/// reading the translation unit, for the CLI's stderr report.
pub fn render_error(err: &CompileError, files: &FileTable) -> String {
    files.render(err)
}

/// Builds the [`FileTable`] needed to pretty-print an error, re-running
/// only as much of the pipeline as necessary to know which files were
/// touched and what they contained. Kept separate from `compile_with_fs`
/// so a failed compile can still produce a readable diagnostic.
pub fn build_file_table(fs: &dyn FileSystem, entry: &Path, include_paths: &[PathBuf]) -> FileTable {
    let mut files = FileTable::new();
    let mut pp = Preprocessor::new(fs, include_paths.to_vec());
    let _ = pp.process_file(entry);
    for (id, path) in &pp.file_names {
        let source = fs.read_to_string(path).unwrap_or_default();
        files.add(*id, path.display().to_string(), source);
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_hello_world_end_to_end() {
        let result = compile_source("main() { echo(\"hi\"); }", &CompileOptions::default()).unwrap();
        assert!(result.rendered.contains("main()"));
        assert!(result.rendered.contains("echo(\"hi\");"));
    }

    #[test]
    fn cli_pragma_override_wins_over_default() {
        let mut options = CompileOptions::default();
        options.pragma_overrides.push(("renderer".to_string(), Some("sds2".to_string())));
        let result = compile_source("main() { if (1) { echo(\"a\"); } }", &options).unwrap();
        assert!(result.rendered.contains("{ goto"));
    }

    #[test]
    fn unknown_identifier_after_expansion_is_a_semantic_error() {
        let err = compile_source("main() { undefined_fn(); }", &CompileOptions::default());
        assert!(err.is_err());
    }
}
