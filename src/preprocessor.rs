//! Directive handling, conditional compilation, and the include stack
//! (spec §4.2). Drives the tokenizer and the macro expander.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::diagnostics::{CompileError, ExpansionChain, Span, Warning};
use crate::macros::{parse_params, split_top_level_commas, Expander, Macro, MacroKind, MacroTable};
use crate::pragma::PragmaSet;
use crate::token::{FileId, Token, TokenKind, Tokenizer};

/// Abstraction over file access so `#include` resolution is testable
/// without touching the real filesystem.
pub trait FileSystem {
    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;
    fn exists(&self, path: &Path) -> bool;
}

pub struct RealFs;

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

const DEFAULT_MAX_INCLUDE_DEPTH: usize = 64;

struct CondFrame {
    /// Whether the *immediately enclosing* context allows emission.
    parent_active: bool,
    /// Whether any branch of this `#if`/`#elif`/.../`#endif` group has
    /// already been taken.
    taken: bool,
    /// Whether the branch currently open is itself taken.
    branch_active: bool,
    saw_else: bool,
}

impl CondFrame {
    fn active(&self) -> bool {
        self.parent_active && self.branch_active
    }
}

pub struct Preprocessor<'a> {
    pub table: MacroTable,
    pub pragmas: PragmaSet,
    fs: &'a dyn FileSystem,
    include_paths: Vec<PathBuf>,
    pragma_once_files: HashSet<PathBuf>,
    /// Set by `handle_pragma` when it sees `#pragma once` while processing
    /// the file currently open in `handle_include`; consumed and cleared
    /// there once that file's canonical path is known.
    pragma_once_pending: bool,
    include_depth: usize,
    max_include_depth: usize,
    next_file_id: FileId,
    pub file_names: Vec<(FileId, PathBuf)>,
    pub warnings: Vec<Warning>,
}

impl<'a> Preprocessor<'a> {
    pub fn new(fs: &'a dyn FileSystem, include_paths: Vec<PathBuf>) -> Self {
        Preprocessor {
            table: MacroTable::new(),
            pragmas: PragmaSet::new(),
            fs,
            include_paths,
            pragma_once_files: HashSet::new(),
            pragma_once_pending: false,
            include_depth: 0,
            max_include_depth: DEFAULT_MAX_INCLUDE_DEPTH,
            next_file_id: 0,
            file_names: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn alloc_file_id(&mut self, path: &Path) -> FileId {
        let id = self.next_file_id;
        self.next_file_id += 1;
        self.file_names.push((id, path.to_path_buf()));
        id
    }

    /// Preprocesses the top-level entry file, returning the fully expanded
    /// token stream (no directives, no macro names left resolvable, no
    /// newlines).
    pub fn process_file(&mut self, path: &Path) -> Result<Vec<Token>, CompileError> {
        let source = self.fs.read_to_string(path).map_err(|e| CompileError::Preprocessor {
            span: Span::dummy(),
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let file_id = self.alloc_file_id(path);
        self.process_source(path, file_id, &source)
    }

    fn process_source(&mut self, path: &Path, file_id: FileId, source: &str) -> Result<Vec<Token>, CompileError> {
        let tokens = Tokenizer::new(file_id, source).tokenize()?;
        let lines = split_lines(tokens);

        let mut cond_stack: Vec<CondFrame> = Vec::new();
        let mut output = Vec::new();
        let mut pending: Vec<Token> = Vec::new();

        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let active = cond_stack.last().map(|f| f.active()).unwrap_or(true);

            if line[0].kind == TokenKind::Directive {
                if active || is_conditional_directive(&line[0].text) {
                    match self.handle_directive(&line, &mut cond_stack, &dir)? {
                        DirectiveOutcome::Continue => {}
                        DirectiveOutcome::Include(included) => {
                            // Flush pending plain tokens under the table as
                            // it stood just before this include boundary.
                            self.flush(&mut pending, &mut output)?;
                            output.extend(included);
                        }
                    }
                }
                continue;
            }

            if active {
                pending.extend(line);
            }
        }

        if !cond_stack.is_empty() {
            return Err(CompileError::Preprocessor {
                span: Span::dummy(),
                message: format!("unterminated #if in {}", path.display()),
            });
        }

        self.flush(&mut pending, &mut output)?;
        Ok(output)
    }

    fn flush(&mut self, pending: &mut Vec<Token>, output: &mut Vec<Token>) -> Result<(), CompileError> {
        if pending.is_empty() {
            return Ok(());
        }
        let seg = std::mem::take(pending);
        let mut expander = Expander::new(&self.table);
        let expanded = expander.expand(seg)?;
        self.warnings.extend(std::mem::take(&mut expander.warnings));
        output.extend(expanded);
        Ok(())
    }

    fn handle_directive(
        &mut self,
        line: &[Token],
        cond_stack: &mut Vec<CondFrame>,
        current_dir: &Path,
    ) -> Result<DirectiveOutcome, CompileError> {
        let directive = line[0].text.to_string();
        let rest = &line[1..];

        match directive.as_str() {
            "#define" => {
                self.handle_define(rest)?;
                Ok(DirectiveOutcome::Continue)
            }
            "#undef" => {
                if let Some(name) = rest.first() {
                    self.table.undef(&name.text);
                }
                Ok(DirectiveOutcome::Continue)
            }
            "#include" => {
                let included = self.handle_include(rest, current_dir, line[0].span)?;
                Ok(DirectiveOutcome::Include(included))
            }
            "#pragma" => {
                self.handle_pragma(rest, line[0].span)?;
                Ok(DirectiveOutcome::Continue)
            }
            "#error" => {
                let msg = rest.iter().map(|t| t.text.to_string()).collect::<Vec<_>>().join(" ");
                Err(CompileError::Preprocessor {
                    span: line[0].span,
                    message: format!("#error: {}", msg),
                })
            }
            "#ifdef" | "#ifndef" | "#if" => {
                let parent_active = cond_stack.last().map(|f| f.active()).unwrap_or(true);
                let condition = if !parent_active {
                    // Don't evaluate a condition (which may reference
                    // macros that are only conditionally defined) inside a
                    // branch we're not taking anyway.
                    false
                } else if directive == "#if" {
                    self.eval_constant_expr(rest, line[0].span)? != 0
                } else {
                    let defined = rest.first().map(|t| self.table.is_defined(&t.text)).unwrap_or(false);
                    if directive == "#ifdef" {
                        defined
                    } else {
                        !defined
                    }
                };
                cond_stack.push(CondFrame {
                    parent_active,
                    taken: condition,
                    branch_active: condition,
                    saw_else: false,
                });
                Ok(DirectiveOutcome::Continue)
            }
            "#elif" => {
                let parent_active = cond_stack
                    .last()
                    .ok_or_else(|| CompileError::Preprocessor {
                        span: line[0].span,
                        message: "#elif without matching #if".into(),
                    })?
                    .parent_active;
                let taken = cond_stack.last().unwrap().taken;
                let saw_else = cond_stack.last().unwrap().saw_else;
                if saw_else {
                    return Err(CompileError::Preprocessor {
                        span: line[0].span,
                        message: "#elif after #else".into(),
                    });
                }
                if taken || !parent_active {
                    cond_stack.last_mut().unwrap().branch_active = false;
                } else {
                    let cond = self.eval_constant_expr(rest, line[0].span)? != 0;
                    let frame = cond_stack.last_mut().unwrap();
                    frame.branch_active = cond;
                    frame.taken = cond;
                }
                Ok(DirectiveOutcome::Continue)
            }
            "#else" => {
                let frame = cond_stack.last_mut().ok_or_else(|| CompileError::Preprocessor {
                    span: line[0].span,
                    message: "#else without matching #if".into(),
                })?;
                if frame.saw_else {
                    return Err(CompileError::Preprocessor {
                        span: line[0].span,
                        message: "duplicate #else".into(),
                    });
                }
                frame.saw_else = true;
                frame.branch_active = !frame.taken;
                frame.taken = true;
                Ok(DirectiveOutcome::Continue)
            }
            "#endif" => {
                if cond_stack.pop().is_none() {
                    return Err(CompileError::Preprocessor {
                        span: line[0].span,
                        message: "#endif without matching #if".into(),
                    });
                }
                Ok(DirectiveOutcome::Continue)
            }
            other => {
                self.warnings.push(Warning {
                    span: line[0].span,
                    message: format!("unknown directive `{}` ignored", other),
                });
                Ok(DirectiveOutcome::Continue)
            }
        }
    }

    fn handle_define(&mut self, rest: &[Token]) -> Result<(), CompileError> {
        let name_tok = rest.first().ok_or_else(|| CompileError::Preprocessor {
            span: Span::dummy(),
            message: "#define missing macro name".into(),
        })?;
        let name = name_tok.text.to_string();

        // Shape is determined by immediate adjacency (no intervening
        // whitespace) between the name and `(` / `[`, per spec §4.2.
        let adjacent = |a: &Token, b: &Token| a.span.end_line == b.span.start_line && a.span.end_col == b.span.start_col;

        if rest.len() > 1 && &*rest[1].text == "(" && adjacent(name_tok, &rest[1]) {
            let (param_tokens, consumed) = take_bracketed(&rest[1..], "(", ")")?;
            let i = 1 + consumed;
            let groups = split_top_level_commas(&param_tokens);
            let params = parse_params(groups);
            let replacement = rest[i..].to_vec();
            self.table.define(Macro {
                name,
                kind: MacroKind::Function { params },
                replacement,
                defined_at: name_tok.span,
            });
            return Ok(());
        }

        if rest.len() > 1 && &*rest[1].text == "[" && adjacent(name_tok, &rest[1]) {
            let (param_tokens, consumed) = take_bracketed(&rest[1..], "[", "]")?;
            let i = 1 + consumed;
            let param = param_tokens
                .first()
                .map(|t| t.text.to_string())
                .ok_or_else(|| CompileError::Macro {
                    span: name_tok.span,
                    message: format!("array-like macro `{}` missing index parameter", name),
                    chain: ExpansionChain::empty(),
                })?;
            let replacement = rest[i..].to_vec();
            self.table.define(Macro {
                name,
                kind: MacroKind::Array { param },
                replacement,
                defined_at: name_tok.span,
            });
            return Ok(());
        }

        let replacement = rest[1..].to_vec();
        self.table.define(Macro {
            name,
            kind: MacroKind::Object,
            replacement,
            defined_at: name_tok.span,
        });
        Ok(())
    }

    fn handle_pragma(&mut self, rest: &[Token], span: Span) -> Result<(), CompileError> {
        let name = rest.first().ok_or_else(|| CompileError::Preprocessor {
            span,
            message: "#pragma missing name".into(),
        })?;
        if &*name.text == "once" {
            self.pragma_once_pending = true;
            return Ok(());
        }
        let value = rest.get(1).map(|t| t.text.to_string());
        match self.pragmas.apply(&name.text, value.as_deref()) {
            Ok(()) => Ok(()),
            Err(msg) => {
                self.warnings.push(Warning {
                    span,
                    message: format!("#pragma {}: {}", name.text, msg),
                });
                Ok(())
            }
        }
    }

    fn handle_include(&mut self, rest: &[Token], current_dir: &Path, span: Span) -> Result<Vec<Token>, CompileError> {
        let path_tok = rest.first().ok_or_else(|| CompileError::Preprocessor {
            span,
            message: "#include missing path".into(),
        })?;
        if path_tok.kind != TokenKind::String {
            return Err(CompileError::Preprocessor {
                span,
                message: "#include expects a \"path\"".into(),
            });
        }
        let requested = PathBuf::from(&*path_tok.text);

        // Own include directory first, then `-I` paths in CLI order (see
        // DESIGN.md's include-search-order decision). Paths are not
        // canonicalized against the real filesystem so resolution stays
        // testable against a fake `FileSystem`; the join itself is enough
        // to dedup `#pragma once`/cycle tracking for any single project
        // layout that doesn't mix `..`-relative and absolute spellings of
        // the same file.
        let candidate = current_dir.join(&requested);
        let resolved = if self.fs.exists(&candidate) {
            candidate
        } else {
            self.include_paths
                .iter()
                .map(|base| base.join(&requested))
                .find(|p| self.fs.exists(p))
                .ok_or_else(|| CompileError::Preprocessor {
                    span,
                    message: format!("cannot find include file \"{}\"", requested.display()),
                })?
        };

        if self.pragma_once_files.contains(&resolved) {
            return Ok(Vec::new());
        }

        self.include_depth += 1;
        if self.include_depth > self.max_include_depth {
            self.include_depth -= 1;
            return Err(CompileError::Preprocessor {
                span,
                message: format!(
                    "include depth exceeded {} (possible #include cycle involving \"{}\")",
                    self.max_include_depth,
                    requested.display()
                ),
            });
        }

        let source = self.fs.read_to_string(&resolved).map_err(|e| CompileError::Preprocessor {
            span,
            message: format!("failed to read {}: {}", resolved.display(), e),
        })?;
        let file_id = self.alloc_file_id(&resolved);

        let saved_pending = self.pragma_once_pending;
        self.pragma_once_pending = false;
        let result = self.process_source(&resolved, file_id, &source);
        if self.pragma_once_pending {
            self.pragma_once_files.insert(resolved.clone());
        }
        self.pragma_once_pending = saved_pending;

        self.include_depth -= 1;
        result
    }

    fn eval_constant_expr(&mut self, tokens: &[Token], span: Span) -> Result<i64, CompileError> {
        crate::condexpr::eval(&self.table, tokens, span, &mut self.warnings)
    }
}

enum DirectiveOutcome {
    Continue,
    Include(Vec<Token>),
}

fn is_conditional_directive(name: &str) -> bool {
    matches!(name, "#if" | "#ifdef" | "#ifndef" | "#elif" | "#else" | "#endif")
}

/// Splits a token stream (with `Eof` dropped) into logical lines at
/// `Newline` boundaries. Line continuations were already spliced away by
/// the tokenizer, so each line here is one unbroken logical statement or
/// directive.
fn split_lines(tokens: Vec<Token>) -> Vec<Vec<Token>> {
    let mut lines = Vec::new();
    let mut current = Vec::new();
    for tok in tokens {
        match tok.kind {
            TokenKind::Eof => break,
            TokenKind::Newline => {
                lines.push(std::mem::take(&mut current));
            }
            _ => current.push(tok),
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Consumes a bracketed group starting at `tokens[0]` (which must be
/// `open`), returning its interior tokens and how many tokens (including
/// both brackets) were consumed from the front of `tokens`.
fn take_bracketed(tokens: &[Token], open: &str, close: &str) -> Result<(Vec<Token>, usize), CompileError> {
    debug_assert_eq!(&*tokens[0].text, open);
    let mut depth = 0i32;
    for (i, t) in tokens.iter().enumerate() {
        if &*t.text == open {
            depth += 1;
        } else if &*t.text == close {
            depth -= 1;
            if depth == 0 {
                return Ok((tokens[1..i].to_vec(), i + 1));
            }
        }
    }
    Err(CompileError::Preprocessor {
        span: tokens[0].span,
        message: format!("unterminated `{}`", open),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    struct FakeFs {
        files: RefCell<StdHashMap<PathBuf, String>>,
    }

    impl FakeFs {
        fn new(files: &[(&str, &str)]) -> Self {
            let mut m = StdHashMap::new();
            for (path, content) in files {
                m.insert(PathBuf::from(path), content.to_string());
            }
            FakeFs { files: RefCell::new(m) }
        }
    }

    impl FileSystem for FakeFs {
        fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
            self.files
                .borrow()
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
        }
        fn exists(&self, path: &Path) -> bool {
            self.files.borrow().contains_key(path)
        }
    }

    fn render(tokens: &[Token]) -> String {
        tokens.iter().map(|t| t.text.to_string()).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn object_macro_defined_and_used() {
        let fs = FakeFs::new(&[("/proj/main.c", "#define N 10\nint x = N;\n")]);
        let mut pp = Preprocessor::new(&fs, vec![]);
        let out = pp.process_file(Path::new("/proj/main.c")).unwrap();
        assert_eq!(render(&out), "int x = 10 ;");
    }

    #[test]
    fn ifdef_skips_undefined_branch() {
        let fs = FakeFs::new(&[(
            "/proj/main.c",
            "#ifdef NOT_DEFINED\nint bad;\n#else\nint good;\n#endif\n",
        )]);
        let mut pp = Preprocessor::new(&fs, vec![]);
        let out = pp.process_file(Path::new("/proj/main.c")).unwrap();
        assert_eq!(render(&out), "int good ;");
    }

    #[test]
    fn if_constant_expression_with_macro_constant() {
        let fs = FakeFs::new(&[(
            "/proj/main.c",
            "#define VERSION 3\n#if VERSION >= 2\nint modern;\n#else\nint legacy;\n#endif\n",
        )]);
        let mut pp = Preprocessor::new(&fs, vec![]);
        let out = pp.process_file(Path::new("/proj/main.c")).unwrap();
        assert_eq!(render(&out), "int modern ;");
    }

    #[test]
    fn pragma_once_skips_second_include() {
        let fs = FakeFs::new(&[
            ("/proj/main.c", "#include \"once.c\"\n#include \"once.c\"\n"),
            ("/proj/once.c", "#pragma once\nint once_only;\n"),
        ]);
        let mut pp = Preprocessor::new(&fs, vec![]);
        let out = pp.process_file(Path::new("/proj/main.c")).unwrap();
        assert_eq!(render(&out), "int once_only ;");
    }

    #[test]
    fn classic_guard_prevents_duplicate_body_on_recursive_include() {
        let fs = FakeFs::new(&[
            ("/proj/main.c", "#include \"a.c\"\n#include \"a.c\"\n"),
            (
                "/proj/a.c",
                "#ifndef A_H\n#define A_H\nint guarded;\n#endif\n",
            ),
        ]);
        let mut pp = Preprocessor::new(&fs, vec![]);
        let out = pp.process_file(Path::new("/proj/main.c")).unwrap();
        assert_eq!(render(&out), "int guarded ;");
    }

    #[test]
    fn include_cycle_is_rejected_past_depth_limit() {
        let fs = FakeFs::new(&[("/proj/main.c", "#include \"main.c\"\n")]);
        let mut pp = Preprocessor::new(&fs, vec![]);
        let err = pp.process_file(Path::new("/proj/main.c"));
        assert!(err.is_err());
    }

    #[test]
    fn unknown_pragma_warns_but_does_not_fail() {
        let fs = FakeFs::new(&[("/proj/main.c", "#pragma not_a_real_one 1\nint x;\n")]);
        let mut pp = Preprocessor::new(&fs, vec![]);
        let out = pp.process_file(Path::new("/proj/main.c")).unwrap();
        assert_eq!(render(&out), "int x ;");
        assert!(!pp.warnings.is_empty());
    }
}
