//! Name resolution, function table, reachability, and inlining eligibility
//! (spec §4.4).
//!
//! Grounded on the teacher's `resolver.rs` (duplicate-definition rejection,
//! table-building over a flat definition list), generalized with a Tarjan
//! SCC pass over the call graph to detect recursion, since this language's
//! functions can call each other (the teacher's stack words could not).

use std::collections::{HashMap, HashSet};

use crate::ast::{Expr, FunctionDef, LValue, Program, Stmt};
use crate::builtins;
use crate::diagnostics::{CompileError, Span};
use crate::pragma::PragmaSet;

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub param_count: usize,
    pub use_count: usize,
    pub recursive: bool,
    pub inlineable: bool,
}

/// Canonical, globalized storage name for one declaration site, keyed by
/// that declaration's span (unique per source position).
pub type NameTable = HashMap<Span, String>;

pub struct SemanticResult {
    pub functions: HashMap<String, FunctionInfo>,
    pub names: NameTable,
}

struct LoopSwitchDepth {
    loop_depth: u32,
    switch_depth: u32,
}

pub fn analyze(program: &Program, pragmas: &PragmaSet) -> Result<SemanticResult, CompileError> {
    check_duplicate_functions(program)?;
    check_duplicate_globals(program)?;

    let call_graph = build_call_graph(program)?;
    let sccs = tarjan_scc(&call_graph);
    let recursive: HashSet<&str> = sccs
        .iter()
        .filter(|scc| scc.len() > 1 || has_self_loop(&call_graph, &scc[0]))
        .flat_map(|scc| scc.iter().map(|s| s.as_str()))
        .collect();

    let use_counts = count_call_sites(program);

    let mut functions = HashMap::new();
    for f in &program.functions {
        let use_count = *use_counts.get(&f.name).unwrap_or(&0);
        let is_recursive = recursive.contains(f.name.as_str());
        let inlineable = pragmas.inline_one_use_functions && use_count == 1 && !is_recursive && f.name != "main" && f.name != "init";
        functions.insert(
            f.name.clone(),
            FunctionInfo {
                name: f.name.clone(),
                param_count: f.params.len(),
                use_count,
                recursive: is_recursive,
                inlineable,
            },
        );
    }

    for f in &program.functions {
        check_break_continue_return(f)?;
        check_calls_resolve(f, &functions)?;
    }

    let names = globalize_names(program, pragmas);

    Ok(SemanticResult { functions, names })
}

fn check_duplicate_functions(program: &Program) -> Result<(), CompileError> {
    let mut seen: HashMap<&str, Span> = HashMap::new();
    for f in &program.functions {
        if let Some(prev) = seen.get(f.name.as_str()) {
            return Err(CompileError::Semantic {
                span: f.span,
                message: format!("function `{}` redefined (first defined at {})", f.name, prev),
            });
        }
        seen.insert(&f.name, f.span);
    }
    Ok(())
}

fn check_duplicate_globals(program: &Program) -> Result<(), CompileError> {
    let mut seen: HashMap<&str, Span> = HashMap::new();
    for g in &program.globals {
        if let Some(prev) = seen.get(g.name.as_str()) {
            return Err(CompileError::Semantic {
                span: g.span,
                message: format!("global `{}` redefined (first defined at {})", g.name, prev),
            });
        }
        seen.insert(&g.name, g.span);
    }
    Ok(())
}

/// `caller -> set of user-defined functions it calls` (builtins excluded).
fn build_call_graph(program: &Program) -> Result<HashMap<String, HashSet<String>>, CompileError> {
    let known: HashSet<&str> = program.functions.iter().map(|f| f.name.as_str()).collect();
    let mut graph = HashMap::new();
    for f in &program.functions {
        let mut callees = HashSet::new();
        for s in &f.body {
            walk_stmt_calls(s, &mut |callee| {
                if known.contains(callee) {
                    callees.insert(callee.to_string());
                }
            });
        }
        graph.insert(f.name.clone(), callees);
    }
    Ok(graph)
}

fn count_call_sites(program: &Program) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for f in &program.functions {
        for s in &f.body {
            walk_stmt_calls(s, &mut |callee| {
                *counts.entry(callee.to_string()).or_insert(0) += 1;
            });
        }
    }
    counts
}

fn check_calls_resolve(f: &FunctionDef, functions: &HashMap<String, FunctionInfo>) -> Result<(), CompileError> {
    let mut err = None;
    for s in &f.body {
        walk_stmt_calls(s, &mut |callee| {
            if err.is_none() && !functions.contains_key(callee) && !builtins::is_builtin(callee) {
                err = Some(callee.to_string());
            }
        });
    }
    if let Some(name) = err {
        return Err(CompileError::Semantic {
            span: f.span,
            message: format!("call to unknown function `{}` in `{}`", name, f.name),
        });
    }
    Ok(())
}

fn walk_stmt_calls(stmt: &Stmt, visit: &mut impl FnMut(&str)) {
    match stmt {
        Stmt::Block { body, .. } => body.iter().for_each(|s| walk_stmt_calls(s, visit)),
        Stmt::VarDecl { init, .. } => {
            if let Some(e) = init {
                walk_expr_calls(e, visit);
            }
        }
        Stmt::Assign { target, value, .. } => {
            if let LValue::HwIndex { index, .. } = target {
                walk_expr_calls(index, visit);
            }
            walk_expr_calls(value, visit);
        }
        Stmt::ExprStmt { expr, .. } => walk_expr_calls(expr, visit),
        Stmt::If { cond, then_branch, else_branch, .. } => {
            walk_expr_calls(cond, visit);
            walk_stmt_calls(then_branch, visit);
            if let Some(e) = else_branch {
                walk_stmt_calls(e, visit);
            }
        }
        Stmt::While { cond, body, .. } => {
            walk_expr_calls(cond, visit);
            walk_stmt_calls(body, visit);
        }
        Stmt::DoWhile { body, cond, .. } => {
            walk_stmt_calls(body, visit);
            walk_expr_calls(cond, visit);
        }
        Stmt::For { init, cond, step, body, .. } => {
            if let Some(s) = init {
                walk_stmt_calls(s, visit);
            }
            if let Some(e) = cond {
                walk_expr_calls(e, visit);
            }
            if let Some(s) = step {
                walk_stmt_calls(s, visit);
            }
            walk_stmt_calls(body, visit);
        }
        Stmt::Switch { scrutinee, cases, .. } => {
            walk_expr_calls(scrutinee, visit);
            for c in cases {
                if let Some(v) = &c.value {
                    walk_expr_calls(v, visit);
                }
                c.body.iter().for_each(|s| walk_stmt_calls(s, visit));
            }
        }
        Stmt::Return { value, .. } => {
            if let Some(e) = value {
                walk_expr_calls(e, visit);
            }
        }
        Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Goto { .. } | Stmt::Label { .. } => {}
    }
}

fn walk_expr_calls(expr: &Expr, visit: &mut impl FnMut(&str)) {
    match expr {
        Expr::IntLit { .. } | Expr::StrLit { .. } | Expr::Ident { .. } => {}
        Expr::HwIndex { index, .. } => walk_expr_calls(index, visit),
        Expr::Unary { operand, .. } => walk_expr_calls(operand, visit),
        Expr::Binary { lhs, rhs, .. } => {
            walk_expr_calls(lhs, visit);
            walk_expr_calls(rhs, visit);
        }
        Expr::Call { callee, args, .. } => {
            visit(callee);
            args.iter().for_each(|a| walk_expr_calls(a, visit));
        }
        Expr::Paren { inner, .. } => walk_expr_calls(inner, visit),
    }
}

fn has_self_loop(graph: &HashMap<String, HashSet<String>>, name: &str) -> bool {
    graph.get(name).map(|callees| callees.contains(name)).unwrap_or(false)
}

/// Tarjan's strongly-connected-components algorithm, used to detect
/// recursion (direct or mutual) in the call graph for inlining eligibility.
fn tarjan_scc(graph: &HashMap<String, HashSet<String>>) -> Vec<Vec<String>> {
    struct State {
        index: HashMap<String, usize>,
        lowlink: HashMap<String, usize>,
        on_stack: HashSet<String>,
        stack: Vec<String>,
        next_index: usize,
        sccs: Vec<Vec<String>>,
    }

    fn strongconnect(node: &str, graph: &HashMap<String, HashSet<String>>, st: &mut State) {
        st.index.insert(node.to_string(), st.next_index);
        st.lowlink.insert(node.to_string(), st.next_index);
        st.next_index += 1;
        st.stack.push(node.to_string());
        st.on_stack.insert(node.to_string());

        if let Some(callees) = graph.get(node) {
            for callee in callees {
                if !st.index.contains_key(callee) {
                    strongconnect(callee, graph, st);
                    let callee_low = st.lowlink[callee];
                    let node_low = st.lowlink[node];
                    st.lowlink.insert(node.to_string(), node_low.min(callee_low));
                } else if st.on_stack.contains(callee) {
                    let callee_index = st.index[callee];
                    let node_low = st.lowlink[node];
                    st.lowlink.insert(node.to_string(), node_low.min(callee_index));
                }
            }
        }

        if st.lowlink[node] == st.index[node] {
            let mut component = Vec::new();
            loop {
                let w = st.stack.pop().unwrap();
                st.on_stack.remove(&w);
                let done = w == node;
                component.push(w);
                if done {
                    break;
                }
            }
            st.sccs.push(component);
        }
    }

    let mut st = State {
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashSet::new(),
        stack: Vec::new(),
        next_index: 0,
        sccs: Vec::new(),
    };
    for node in graph.keys() {
        if !st.index.contains_key(node) {
            strongconnect(node, graph, &mut st);
        }
    }
    st.sccs
}

fn check_break_continue_return(f: &FunctionDef) -> Result<(), CompileError> {
    let mut depth = LoopSwitchDepth { loop_depth: 0, switch_depth: 0 };
    for s in &f.body {
        check_stmt_context(s, &mut depth)?;
    }
    Ok(())
}

fn check_stmt_context(stmt: &Stmt, depth: &mut LoopSwitchDepth) -> Result<(), CompileError> {
    match stmt {
        Stmt::Block { body, .. } => body.iter().try_for_each(|s| check_stmt_context(s, depth)),
        Stmt::If { then_branch, else_branch, .. } => {
            check_stmt_context(then_branch, depth)?;
            if let Some(e) = else_branch {
                check_stmt_context(e, depth)?;
            }
            Ok(())
        }
        Stmt::While { body, .. } => {
            depth.loop_depth += 1;
            let r = check_stmt_context(body, depth);
            depth.loop_depth -= 1;
            r
        }
        Stmt::DoWhile { body, .. } => {
            depth.loop_depth += 1;
            let r = check_stmt_context(body, depth);
            depth.loop_depth -= 1;
            r
        }
        Stmt::For { body, .. } => {
            depth.loop_depth += 1;
            let r = check_stmt_context(body, depth);
            depth.loop_depth -= 1;
            r
        }
        Stmt::Switch { cases, span, .. } => {
            depth.switch_depth += 1;
            let _ = span;
            for c in cases {
                for s in &c.body {
                    check_stmt_context(s, depth)?;
                }
            }
            depth.switch_depth -= 1;
            Ok(())
        }
        Stmt::Break { span } => {
            if depth.loop_depth == 0 && depth.switch_depth == 0 {
                return Err(CompileError::Semantic {
                    span: *span,
                    message: "`break` outside loop or switch".into(),
                });
            }
            Ok(())
        }
        Stmt::Continue { span } => {
            if depth.loop_depth == 0 {
                return Err(CompileError::Semantic {
                    span: *span,
                    message: "`continue` outside loop".into(),
                });
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Assigns each local declaration (and parameter) a globalized storage
/// name `__fn<caller>L<ix>_<orig>` (locals) / `__fn<caller>_p_<orig>`
/// (parameters), keyed by the declaring span so lowering can look the name
/// up without re-walking the tree.
///
/// Under `keep_names`, the positional `L<ix>`/`p_` infixes are dropped in
/// favor of `__fn<caller>_<orig>` for both locals and parameters: still
/// scoped per function (this language flattens every local to a global, so
/// some prefix is unavoidable) but otherwise the user's identifier verbatim,
/// trading the guaranteed within-function uniqueness the indexed scheme
/// gives a shadowed redeclaration for output a human can read unaided.
fn globalize_names(program: &Program, pragmas: &PragmaSet) -> NameTable {
    let mut names = NameTable::new();
    for f in &program.functions {
        for p in &f.params {
            let storage = if pragmas.keep_names {
                format!("__fn{}_{}", f.name, p.name)
            } else {
                format!("__fn{}_p_{}", f.name, p.name)
            };
            names.insert(p.span, storage);
        }
        let mut ix = 0usize;
        for s in &f.body {
            globalize_stmt(s, &f.name, &mut ix, &mut names, pragmas);
        }
    }
    names
}

fn globalize_stmt(stmt: &Stmt, fname: &str, ix: &mut usize, names: &mut NameTable, pragmas: &PragmaSet) {
    match stmt {
        Stmt::Block { body, .. } => body.iter().for_each(|s| globalize_stmt(s, fname, ix, names, pragmas)),
        Stmt::VarDecl { name, span, .. } => {
            let storage = if pragmas.keep_names {
                format!("__fn{}_{}", fname, name)
            } else {
                format!("__fn{}L{}_{}", fname, ix, name)
            };
            names.insert(*span, storage);
            *ix += 1;
        }
        Stmt::If { then_branch, else_branch, .. } => {
            globalize_stmt(then_branch, fname, ix, names, pragmas);
            if let Some(e) = else_branch {
                globalize_stmt(e, fname, ix, names, pragmas);
            }
        }
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => globalize_stmt(body, fname, ix, names, pragmas),
        Stmt::For { init, step, body, .. } => {
            if let Some(s) = init {
                globalize_stmt(s, fname, ix, names, pragmas);
            }
            if let Some(s) = step {
                globalize_stmt(s, fname, ix, names, pragmas);
            }
            globalize_stmt(body, fname, ix, names, pragmas);
        }
        Stmt::Switch { cases, .. } => {
            for c in cases {
                c.body.iter().for_each(|s| globalize_stmt(s, fname, ix, names, pragmas));
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::token::{Tokenizer, TokenKind};

    fn analyze_src(src: &str, pragmas: &PragmaSet) -> Result<SemanticResult, CompileError> {
        let mut toks = Tokenizer::new(0, src).tokenize().unwrap();
        toks.retain(|t| !matches!(t.kind, TokenKind::Eof | TokenKind::Newline | TokenKind::Directive));
        let program = Parser::new(&toks).parse_program().unwrap();
        analyze(&program, pragmas)
    }

    #[test]
    fn detects_duplicate_function() {
        let pragmas = PragmaSet::new();
        let err = analyze_src("foo() { } foo() { }", &pragmas);
        assert!(err.is_err());
    }

    #[test]
    fn single_use_function_is_inlineable_when_pragma_on() {
        let mut pragmas = PragmaSet::new();
        pragmas.inline_one_use_functions = true;
        let result = analyze_src("helper() { return 1; } main() { helper(); }", &pragmas).unwrap();
        assert!(result.functions["helper"].inlineable);
    }

    #[test]
    fn recursive_function_is_never_inlineable() {
        let mut pragmas = PragmaSet::new();
        pragmas.inline_one_use_functions = true;
        let result = analyze_src("sum(n) { if (n == 0) { return 0; } return n + sum(n - 1); } main() { sum(5); }", &pragmas).unwrap();
        assert!(result.functions["sum"].recursive);
        assert!(!result.functions["sum"].inlineable);
    }

    #[test]
    fn mutual_recursion_detected_via_scc() {
        let pragmas = PragmaSet::new();
        let result = analyze_src(
            "is_even(n) { if (n == 0) { return 1; } return is_odd(n - 1); } is_odd(n) { if (n == 0) { return 0; } return is_even(n - 1); } main() { is_even(4); }",
            &pragmas,
        )
        .unwrap();
        assert!(result.functions["is_even"].recursive);
        assert!(result.functions["is_odd"].recursive);
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let pragmas = PragmaSet::new();
        let err = analyze_src("main() { break; }", &pragmas);
        assert!(err.is_err());
    }

    #[test]
    fn locals_get_globalized_names() {
        let pragmas = PragmaSet::new();
        let result = analyze_src("main() { var x = 1; var y = 2; }", &pragmas).unwrap();
        let globalized: Vec<&String> = result.names.values().collect();
        assert!(globalized.iter().any(|n| n.as_str() == "__fnmainL0_x"));
        assert!(globalized.iter().any(|n| n.as_str() == "__fnmainL1_y"));
    }

    #[test]
    fn keep_names_drops_positional_infix() {
        let mut pragmas = PragmaSet::new();
        pragmas.keep_names = true;
        let result = analyze_src("helper(n) { var total = n; return total; } main() { helper(1); }", &pragmas).unwrap();
        let globalized: Vec<&String> = result.names.values().collect();
        assert!(globalized.iter().any(|n| n.as_str() == "__fnhelper_n"));
        assert!(globalized.iter().any(|n| n.as_str() == "__fnhelper_total"));
        assert!(!globalized.iter().any(|n| n.contains("_p_") || n.contains('L')));
    }
}
