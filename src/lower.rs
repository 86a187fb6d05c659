//! Lowering pass (spec §4.5): AST → flat labeled-statement IR.
//!
//! Grounded on the teacher's `codegen.rs` tree-walking emitter — a single
//! recursive traversal carrying a label/temp counter in its own context
//! struct (spec §9's "visitor pattern replaces runtime attribute probing")
//! — generalized from "emit text directly" to "build `ir::IrProgram`, then
//! let `render.rs` turn it into text" so the two output dialects share one
//! lowering.
//!
//! L1 (expression flattening), L2 (control flow), L3 (function calls) and
//! L4 (safe-stack instrumentation) are all folded into the one traversal
//! below rather than run as four separate passes, matching how the spec
//! describes them as "layers" of one pass.

use std::collections::HashMap;

use crate::ast::{AssignOp, BinaryOp, Expr, FunctionDef, HwArray, LValue, Program, Stmt, UnaryOp};
use crate::builtins;
use crate::diagnostics::{CompileError, Span};
use crate::ir::{registers, Atom, IrProgram, IrStmt, Operand, RValue};
use crate::pragma::PragmaSet;
use crate::semantic::SemanticResult;

/// Call sites that exceed this many arguments route through the shared
/// push/pop trampoline when that pragma is on (spec §4.5 L3); the
/// threshold drops to 2 under `safe_stack` so overflow checks stay useful.
const DEFAULT_TRAMPOLINE_ARGC: usize = 4;
const SAFE_STACK_TRAMPOLINE_ARGC: usize = 2;

struct LoopLabels {
    continue_label: String,
    break_label: String,
}

/// One call site awaiting its return label, recorded so the callee's
/// epilogue can build the `__ret`-dispatch ladder once all call sites to
/// that function are known.
struct PendingCallSite {
    return_label: String,
}

pub struct Lowerer<'a> {
    program: &'a Program,
    semantic: &'a SemanticResult,
    pragmas: &'a PragmaSet,
    label_counter: u32,
    temp_counter: u32,
    globals: Vec<String>,
    seen_globals: HashMap<String, ()>,
    body: Vec<IrStmt>,
    loop_stack: Vec<LoopLabels>,
    switch_break_stack: Vec<String>,
    /// Call sites recorded per callee, in the order encountered, so the
    /// callee epilogue can emit a `__ret == k goto` dispatch ladder when
    /// there is more than one.
    call_sites: HashMap<String, Vec<PendingCallSite>>,
    current_function: Option<String>,
    trampoline_argc: usize,
    /// When set, a `return` lowers to a `goto` here instead of the normal
    /// `__ret`-dispatch ladder — set while lowering an inlined callee body,
    /// since an inlined `return` only needs to skip the rest of that one
    /// substituted body, not bounce through the caller's call-site table.
    inline_return_label: Option<String>,
    main_end_label: Option<String>,
    /// Per-function exit label, registered before that function's body is
    /// lowered so every `return` inside it (wherever it appears) jumps to
    /// the same point rather than duplicating the return-dispatch ladder
    /// at each `return` site.
    function_exit_labels: HashMap<String, String>,
    /// Each non-inlined function's lowered body (`entry` through `exit`
    /// label), collected in processing order and only spliced into the
    /// program's final statement list once every function has been
    /// lowered — so the return-dispatch epilogue appended after each one
    /// sees every call site in the program, not just the ones lowered
    /// before it (spec §4.5 L3).
    function_irs: Vec<(String, Vec<IrStmt>)>,
    /// Shared per-function push-trampoline bodies (spec §4.5 L3, `#pragma
    /// push_pop_trampolines`): built the first time a qualifying call site
    /// needs one and reused by every other call site to the same
    /// function, appended once at the end alongside `function_irs`.
    push_trampolines: Vec<(String, Vec<IrStmt>)>,
    push_trampoline_seen: HashMap<String, ()>,
}

impl<'a> Lowerer<'a> {
    pub fn new(program: &'a Program, semantic: &'a SemanticResult, pragmas: &'a PragmaSet) -> Self {
        let trampoline_argc = if pragmas.safe_stack {
            SAFE_STACK_TRAMPOLINE_ARGC
        } else {
            DEFAULT_TRAMPOLINE_ARGC
        };
        Lowerer {
            program,
            semantic,
            pragmas,
            label_counter: 0,
            temp_counter: 0,
            globals: Vec::new(),
            seen_globals: HashMap::new(),
            body: Vec::new(),
            loop_stack: Vec::new(),
            switch_break_stack: Vec::new(),
            call_sites: HashMap::new(),
            current_function: None,
            trampoline_argc,
            inline_return_label: None,
            main_end_label: None,
            function_exit_labels: HashMap::new(),
            function_irs: Vec::new(),
            push_trampolines: Vec::new(),
            push_trampoline_seen: HashMap::new(),
        }
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        let k = self.label_counter;
        self.label_counter += 1;
        format!("__{}_{}", prefix, k)
    }

    fn fresh_temp(&mut self) -> String {
        let k = self.temp_counter;
        self.temp_counter += 1;
        let name = format!("__t{}", k);
        self.declare_global(&name);
        name
    }

    fn declare_global(&mut self, name: &str) {
        if self.seen_globals.insert(name.to_string(), ()).is_none() {
            self.globals.push(name.to_string());
        }
    }

    fn emit(&mut self, stmt: IrStmt) {
        self.body.push(stmt);
    }

    /// Runs the whole pipeline: registers, user globals, `init` (if
    /// present) inline at the top of the program, `main`'s body, then every
    /// reachable non-inlined, non-entry function's body behind a `goto`
    /// that skips over it, each ending in its return-dispatch ladder.
    pub fn lower(mut self) -> Result<IrProgram, CompileError> {
        for r in [registers::SP, registers::RVAL, registers::RET] {
            self.declare_global(r);
        }
        if self.pragmas.safe_stack {
            self.declare_global(registers::STACK_START);
            self.declare_global(registers::STACK_END);
            self.emit(IrStmt::Assign {
                dest: Atom::Name(registers::STACK_START.to_string()),
                value: RValue::Operand(Operand::plain(Atom::Int(self.pragmas.stack_start))),
            });
            self.emit(IrStmt::Assign {
                dest: Atom::Name(registers::STACK_END.to_string()),
                value: RValue::Operand(Operand::plain(Atom::Int(self.pragmas.stack_end))),
            });
            // `__sp` starts one window-width above `stack_end` (the window
            // being `stack_end - stack_start`), so a program has to push
            // through that many more slots than the window itself before
            // tripping the overflow check below — matching S5's "pushes
            // exceed the window" framing with `stack_start`/`stack_end`
            // set 100 apart and ~100 recursive calls.
            let window = self.pragmas.stack_end - self.pragmas.stack_start;
            self.emit(IrStmt::Assign {
                dest: Atom::Name(registers::SP.to_string()),
                value: RValue::Operand(Operand::plain(Atom::Int(self.pragmas.stack_end + window))),
            });
        }
        for a in registers::ARG_REGISTERS {
            self.declare_global(a);
        }

        for g in &self.program.globals {
            self.declare_global(&g.name);
            if let Some(init) = &g.init {
                // Global initializers must themselves be constant-ish;
                // lowered the same as any flattened expression, emitted
                // once at program start.
                let rv = self.lower_expr_to_rvalue(init)?;
                self.emit(IrStmt::Assign { dest: Atom::Name(g.name.clone()), value: rv });
            }
        }

        if let Some(init_fn) = self.program.find_init() {
            self.current_function = Some(init_fn.name.clone());
            self.lower_block(&init_fn.body)?;
        }

        let main_fn = self.program.find_main().ok_or_else(|| CompileError::Lowering {
            span: Span::dummy(),
            message: "program has no `main` function".into(),
        })?;

        let main_end = self.fresh_label("main_end");
        self.main_end_label = Some(main_end.clone());
        self.current_function = Some("main".to_string());
        self.lower_block(&main_fn.body)?;
        self.emit(IrStmt::Label { label: main_end.clone() });

        // `main` falling off its own end must not fall through into the
        // function bodies spliced in below — every reachable exit from
        // `main` (explicit `return` or just running out of statements)
        // lands here and jumps straight past the whole function region to
        // the program's terminal spin.
        let program_end = "__program_end".to_string();
        self.emit(IrStmt::Goto { label: program_end.clone() });

        // Emit every user function body that survived lowering as a
        // reachable goto target (direct-call mode) — skipped over at
        // runtime unless entered via a call's `goto`. Inlined and unused
        // functions contribute no body of their own.
        let mut fn_names: Vec<&FunctionDef> = self
            .program
            .functions
            .iter()
            .filter(|f| f.name != "main" && f.name != "init")
            .collect();
        fn_names.sort_by_key(|f| f.name.clone());

        for f in fn_names {
            let info = &self.semantic.functions[&f.name];
            if info.inlineable {
                // Inlined at each (single) call site; no standalone body.
                continue;
            }
            self.lower_function_body(f)?;
        }

        // Every function body is lowered and every call site in the
        // program is now recorded, so it's only safe to splice in the
        // return-dispatch epilogues here — a function called from another
        // function lowered *after* it (alphabetically) would otherwise
        // have its dispatch ladder built before that call site existed.
        let function_irs = std::mem::take(&mut self.function_irs);
        for (fname, body) in function_irs {
            self.body.extend(body);
            self.emit_return_dispatch(&fname);
        }

        // Shared push trampolines are pure fall-in-from-a-goto targets,
        // referenced only by the call sites that route through them; they
        // can be spliced in any order after the functions they push for.
        let push_trampolines = std::mem::take(&mut self.push_trampolines);
        for (_fname, body) in push_trampolines {
            self.body.extend(body);
        }

        // Terminal halt: the device program has nothing left to run once
        // `main` (and, transitively, every function it called) is done.
        self.emit(IrStmt::Label { label: program_end.clone() });
        self.emit(IrStmt::Goto { label: program_end });

        Ok(IrProgram { globals: self.globals, body: self.body })
    }

    fn lower_function_body(&mut self, f: &FunctionDef) -> Result<(), CompileError> {
        let saved_body = std::mem::take(&mut self.body);
        self.current_function = Some(f.name.clone());

        let exit_label = format!("__fn_{}_exit", f.name);
        self.function_exit_labels.insert(f.name.clone(), exit_label.clone());

        let entry = format!("__fn_{}_entry", f.name);
        self.emit(IrStmt::Label { label: entry });

        // Bind argument registers into the function's own globalized
        // parameter storage before any inner call can clobber __a*.
        for (i, p) in f.params.iter().enumerate() {
            let pname = self.param_name(f, p.span, &p.name);
            let reg = registers::ARG_REGISTERS.get(i).ok_or_else(|| CompileError::Lowering {
                span: f.span,
                message: format!("function `{}` has more than {} parameters", f.name, registers::ARG_REGISTERS.len()),
            })?;
            self.declare_global(&pname);
            self.emit(IrStmt::Assign {
                dest: Atom::Name(pname),
                value: RValue::Operand(Operand::plain(Atom::Name(reg.to_string()))),
            });
        }

        self.lower_block(&f.body)?;

        // Fall-through return (no explicit `return`) lands here too: every
        // explicit `return` inside the body jumped straight to this same
        // label instead of dispatching locally, so `__rval`'s "keeps
        // whatever it last held" fallback behavior and the `__ret`-dispatch
        // ladder both happen exactly once, in the deferred epilogue
        // appended after every function body has been lowered.
        self.emit(IrStmt::Label { label: exit_label });

        let produced = std::mem::replace(&mut self.body, saved_body);
        self.function_irs.push((f.name.clone(), produced));
        Ok(())
    }

    /// Builds the `goto`-computed dispatch back to whichever call site is
    /// waiting, keyed by `__ret`. The state that call site's push saved —
    /// `__ret` itself and the callee's parameter storage — is restored at
    /// the call site's own return label (`lower_user_call`), not here:
    /// this dispatch has to read the *current* `__ret` to decide where to
    /// jump, and popping it first would destroy the very value the
    /// dispatch needs. Called only after every function body (and so
    /// every call site in the program) has been lowered.
    fn emit_return_dispatch(&mut self, fname: &str) {
        let sites = self.call_sites.remove(fname).unwrap_or_default();
        if sites.is_empty() {
            return;
        }
        if sites.len() == 1 {
            self.emit(IrStmt::Goto { label: sites[0].return_label.clone() });
            return;
        }
        let table: Vec<(i64, String)> = sites
            .iter()
            .enumerate()
            .map(|(i, s)| (i as i64, s.return_label.clone()))
            .collect();
        self.emit(IrStmt::ReturnDispatch { table });
    }

    fn param_name(&self, f: &FunctionDef, span: Span, orig: &str) -> String {
        self.semantic
            .names
            .get(&span)
            .cloned()
            .unwrap_or_else(|| format!("__fn{}_p_{}", f.name, orig))
    }

    fn local_name(&self, span: Span, orig: &str) -> String {
        self.semantic
            .names
            .get(&span)
            .cloned()
            .unwrap_or_else(|| format!("__local_{}", orig))
    }

    // ---- L2: statements ----------------------------------------------

    fn lower_block(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for s in stmts {
            self.lower_stmt(s)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Block { body, .. } => self.lower_block(body),

            Stmt::VarDecl { name, init, span } => {
                let gname = self.local_name(*span, name);
                self.declare_global(&gname);
                if let Some(e) = init {
                    let rv = self.lower_expr_to_rvalue(e)?;
                    self.emit(IrStmt::Assign { dest: Atom::Name(gname), value: rv });
                }
                Ok(())
            }

            Stmt::Assign { target, op, value, .. } => self.lower_assign(target, *op, value),

            Stmt::ExprStmt { expr, .. } => {
                // A bare call statement; anything else is a no-op once
                // flattened (its side effects, if any, already emitted)
                // and its value is simply discarded.
                self.lower_expr_for_effect(expr)
            }

            Stmt::If { cond, then_branch, else_branch, span } => {
                self.lower_if(cond, then_branch, else_branch.as_deref(), *span)
            }

            Stmt::While { cond, body, .. } => self.lower_while(cond, body),
            Stmt::DoWhile { body, cond, .. } => self.lower_do_while(body, cond),
            Stmt::For { init, cond, step, body, .. } => {
                self.lower_for(init.as_deref(), cond.as_ref(), step.as_deref(), body)
            }
            Stmt::Switch { scrutinee, cases, .. } => self.lower_switch(scrutinee, cases),

            Stmt::Break { span } => {
                let label = self.switch_break_stack.last().or_else(|| {
                    self.loop_stack.last().map(|l| &l.break_label)
                });
                match label {
                    Some(l) => {
                        let l = l.clone();
                        self.emit(IrStmt::Goto { label: l });
                        Ok(())
                    }
                    None => Err(CompileError::Lowering {
                        span: *span,
                        message: "`break` outside loop or switch".into(),
                    }),
                }
            }

            Stmt::Continue { span } => match self.loop_stack.last() {
                Some(l) => {
                    let l = l.continue_label.clone();
                    self.emit(IrStmt::Goto { label: l });
                    Ok(())
                }
                None => Err(CompileError::Lowering {
                    span: *span,
                    message: "`continue` outside loop".into(),
                }),
            },

            Stmt::Return { value, span } => self.lower_return(value.as_ref(), *span),

            Stmt::Goto { label, .. } => {
                self.emit(IrStmt::Goto { label: label.clone() });
                Ok(())
            }

            Stmt::Label { name, .. } => {
                self.emit(IrStmt::Label { label: name.clone() });
                Ok(())
            }
        }
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
        _span: Span,
    ) -> Result<(), CompileError> {
        if self.pragmas.simplify_ifs {
            if let Some(v) = const_eval(cond) {
                // Constant-true/false branches fold away, but only after
                // the condition itself is known side-effect free: a bare
                // literal/identifier expression can never have a side
                // effect, so nothing is dropped silently (spec §8 property
                // 7).
                if v != 0 {
                    return self.lower_stmt(then_branch);
                } else if let Some(e) = else_branch {
                    return self.lower_stmt(e);
                } else {
                    return Ok(());
                }
            }
        }

        let then_label = self.fresh_label("if_then");
        let end_label = self.fresh_label("if_end");
        let cond_rv = self.lower_expr_to_rvalue(cond)?;
        self.emit(IrStmt::IfGoto { cond: cond_rv, label: then_label.clone() });
        if let Some(e) = else_branch {
            self.lower_stmt(e)?;
        }
        self.emit(IrStmt::Goto { label: end_label.clone() });
        self.emit(IrStmt::Label { label: then_label });
        self.lower_stmt(then_branch)?;
        self.emit(IrStmt::Label { label: end_label });
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &Stmt) -> Result<(), CompileError> {
        let top = self.fresh_label("wh");
        let brk = self.fresh_label("wh_break");
        self.emit(IrStmt::Label { label: top.clone() });
        let negated = self.lower_negated_cond(cond)?;
        self.emit(IrStmt::IfGoto { cond: negated, label: brk.clone() });
        self.loop_stack.push(LoopLabels { continue_label: top.clone(), break_label: brk.clone() });
        self.lower_stmt(body)?;
        self.loop_stack.pop();
        self.emit(IrStmt::Goto { label: top });
        self.emit(IrStmt::Label { label: brk });
        Ok(())
    }

    fn lower_do_while(&mut self, body: &Stmt, cond: &Expr) -> Result<(), CompileError> {
        let top = self.fresh_label("do");
        let brk = self.fresh_label("do_break");
        self.emit(IrStmt::Label { label: top.clone() });
        self.loop_stack.push(LoopLabels { continue_label: top.clone(), break_label: brk.clone() });
        self.lower_stmt(body)?;
        self.loop_stack.pop();
        let cond_rv = self.lower_expr_to_rvalue(cond)?;
        self.emit(IrStmt::IfGoto { cond: cond_rv, label: top });
        self.emit(IrStmt::Label { label: brk });
        Ok(())
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        if let Some(s) = init {
            self.lower_stmt(s)?;
        }
        let top = self.fresh_label("for");
        let cont = self.fresh_label("for_cont");
        let brk = self.fresh_label("for_break");
        self.emit(IrStmt::Label { label: top.clone() });
        if let Some(c) = cond {
            let negated = self.lower_negated_cond(c)?;
            self.emit(IrStmt::IfGoto { cond: negated, label: brk.clone() });
        }
        self.loop_stack.push(LoopLabels { continue_label: cont.clone(), break_label: brk.clone() });
        self.lower_stmt(body)?;
        self.loop_stack.pop();
        self.emit(IrStmt::Label { label: cont });
        if let Some(s) = step {
            self.lower_stmt(s)?;
        }
        self.emit(IrStmt::Goto { label: top });
        self.emit(IrStmt::Label { label: brk });
        Ok(())
    }

    /// `switch` lowers to a dispatch table of `if (__sw_k == v) goto
    /// __case_k_v;` built in source order, followed by fall-through bodies
    /// (spec §4.5 L2, S4: a non-constant case expression like
    /// `get_magic()` is evaluated once per switch execution, during
    /// dispatch, in source order — exactly where it appears in the
    /// dispatch table below).
    fn lower_switch(&mut self, scrutinee: &Expr, cases: &[crate::ast::SwitchCase]) -> Result<(), CompileError> {
        let k = self.label_counter;
        let sw_temp = format!("__sw_{}", k);
        self.declare_global(&sw_temp);
        let scrut_rv = self.lower_expr_to_rvalue(scrutinee)?;
        self.emit(IrStmt::Assign { dest: Atom::Name(sw_temp.clone()), value: scrut_rv });

        let end_label = self.fresh_label("sw_end");
        let mut case_labels = Vec::with_capacity(cases.len());
        let mut default_label = None;

        for (i, case) in cases.iter().enumerate() {
            match &case.value {
                Some(v) => {
                    let label = format!("__case_{}_{}", k, i);
                    let value_rv = self.lower_expr_to_rvalue(v)?;
                    let cond = RValue::Binary {
                        op: BinaryOp::Eq,
                        lhs: Operand::plain(Atom::Name(sw_temp.clone())),
                        rhs: flatten_operand(self, value_rv)?,
                    };
                    self.emit(IrStmt::IfGoto { cond, label: label.clone() });
                    case_labels.push(label);
                }
                None => {
                    let label = format!("__case_{}_default", k);
                    default_label = Some(label.clone());
                    case_labels.push(label);
                }
            }
        }
        if let Some(d) = &default_label {
            self.emit(IrStmt::Goto { label: d.clone() });
        } else {
            self.emit(IrStmt::Goto { label: end_label.clone() });
        }

        self.switch_break_stack.push(end_label.clone());
        for (i, case) in cases.iter().enumerate() {
            self.emit(IrStmt::Label { label: case_labels[i].clone() });
            self.lower_block(&case.body)?;
        }
        self.switch_break_stack.pop();
        self.emit(IrStmt::Label { label: end_label });
        Ok(())
    }

    fn lower_return(&mut self, value: Option<&Expr>, span: Span) -> Result<(), CompileError> {
        let fname = self.current_function.clone().ok_or_else(|| CompileError::Lowering {
            span,
            message: "`return` outside any function".into(),
        })?;
        if let Some(e) = value {
            let rv = self.lower_expr_to_rvalue(e)?;
            self.emit(IrStmt::Assign { dest: Atom::Name(registers::RVAL.to_string()), value: rv });
        }
        if let Some(inline_end) = self.inline_return_label.clone() {
            self.emit(IrStmt::Goto { label: inline_end });
        } else if fname == "main" {
            let end = self.main_end_label.clone().unwrap_or_else(|| "__main_end".to_string());
            self.emit(IrStmt::Goto { label: end });
        } else {
            let exit = self
                .function_exit_labels
                .get(&fname)
                .cloned()
                .unwrap_or_else(|| format!("__fn_{}_exit", fname));
            self.emit(IrStmt::Goto { label: exit });
        }
        Ok(())
    }

    // ---- L1: expression flattening ------------------------------------

    /// Negates `cond` for the "skip body" branch of a loop, collapsing a
    /// leading `!` rather than emitting a double negation.
    fn lower_negated_cond(&mut self, cond: &Expr) -> Result<RValue, CompileError> {
        if let Expr::Unary { op: UnaryOp::Not, operand, .. } = cond {
            return self.lower_expr_to_rvalue(operand);
        }
        let rv = self.lower_expr_to_rvalue(cond)?;
        let operand = flatten_operand(self, rv)?;
        Ok(RValue::Unary { op: UnaryOp::Not, operand })
    }

    fn lower_assign(&mut self, target: &LValue, op: AssignOp, value: &Expr) -> Result<(), CompileError> {
        let dest = self.lower_lvalue(target)?;
        let rv = match op {
            AssignOp::Assign => self.lower_expr_to_rvalue(value)?,
            compound => {
                let bin_op = compound_to_binary(compound);
                let cur = self.atom_to_rvalue_operand(&dest);
                let rhs_rv = self.lower_expr_to_rvalue(value)?;
                let rhs = flatten_operand(self, rhs_rv)?;
                RValue::Binary { op: bin_op, lhs: cur, rhs }
            }
        };
        self.emit(IrStmt::Assign { dest, value: rv });
        Ok(())
    }

    fn atom_to_rvalue_operand(&self, atom: &Atom) -> Operand {
        Operand::plain(atom.clone())
    }

    fn lower_lvalue(&mut self, lv: &LValue) -> Result<Atom, CompileError> {
        match lv {
            LValue::Ident { name, span } => {
                let resolved = self.semantic.names.get(span).cloned().unwrap_or_else(|| name.clone());
                Ok(Atom::Name(resolved))
            }
            LValue::HwIndex { array, index, .. } => {
                let idx_rv = self.lower_expr_to_rvalue(index)?;
                let idx_operand = flatten_operand(self, idx_rv)?;
                Ok(Atom::HwIndex { array: *array, index: Box::new(idx_operand.atom) })
            }
        }
    }

    /// Flattens an expression into an [`RValue`] — at most one operation,
    /// its operands already-simple atoms, introducing a temporary for any
    /// operand that is itself non-trivial. Evaluation order is strictly
    /// left to right (spec §4.5 L1).
    fn lower_expr_to_rvalue(&mut self, expr: &Expr) -> Result<RValue, CompileError> {
        match expr {
            Expr::IntLit { value, .. } => Ok(RValue::Operand(Operand::plain(Atom::Int(*value)))),
            Expr::StrLit { value, .. } => Ok(RValue::Operand(Operand::plain(Atom::Str(value.clone())))),
            Expr::Ident { name, span } => {
                let resolved = self.semantic.names.get(span).cloned().unwrap_or_else(|| name.clone());
                Ok(RValue::Operand(Operand::plain(Atom::Name(resolved))))
            }
            Expr::HwIndex { array, index, .. } => {
                let idx_rv = self.lower_expr_to_rvalue(index)?;
                let idx_operand = flatten_operand(self, idx_rv)?;
                Ok(RValue::Operand(Operand::plain(Atom::HwIndex {
                    array: *array,
                    index: Box::new(idx_operand.atom),
                })))
            }
            Expr::Unary { op, operand, .. } => {
                let rv = self.lower_expr_to_rvalue(operand)?;
                let o = flatten_operand(self, rv)?;
                Ok(RValue::Unary { op: *op, operand: o })
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let lhs_rv = self.lower_expr_to_rvalue(lhs)?;
                let lhs_o = flatten_operand(self, lhs_rv)?;
                let rhs_rv = self.lower_expr_to_rvalue(rhs)?;
                let rhs_o = flatten_operand(self, rhs_rv)?;
                Ok(RValue::Binary { op: *op, lhs: lhs_o, rhs: rhs_o })
            }
            Expr::Paren { inner, .. } => self.lower_paren(inner),
            Expr::Call { callee, args, span } => self.lower_call_to_rvalue(callee, args, *span),
        }
    }

    /// Lowers a parenthesized sub-expression. A bare atom in parens (`(x)`,
    /// `(5)`) just sets the operand's `parenthesized` flag. A compound
    /// expression that contains no call is kept inline as `Atom::Grouped`
    /// so the renderer reproduces the exact grouping (S3); one that
    /// contains a call still needs its own temporary (to sequence the
    /// call's side effect correctly), which necessarily discards the
    /// cosmetic parens — the temporary name has no operator around it, so
    /// nothing is lost semantically.
    fn lower_paren(&mut self, inner: &Expr) -> Result<RValue, CompileError> {
        let rv = self.lower_expr_to_rvalue(inner)?;
        match rv {
            RValue::Operand(mut o) => {
                o.parenthesized = true;
                Ok(RValue::Operand(o))
            }
            other if !rvalue_contains_call(&other) => {
                Ok(RValue::Operand(Operand::plain(Atom::Grouped(Box::new(other)))))
            }
            other => {
                let o = flatten_operand(self, other)?;
                Ok(RValue::Operand(o))
            }
        }
    }

    /// Lowers a call used as a value: the callee's result lands in
    /// `__rval`, which the caller must copy out into a fresh temporary
    /// immediately (spec §3: "argument registers are live only across a
    /// single call boundary").
    fn lower_call_to_rvalue(&mut self, callee: &str, args: &[Expr], span: Span) -> Result<RValue, CompileError> {
        if builtins::is_builtin(callee) {
            let mut lowered_args = Vec::with_capacity(args.len());
            for a in args {
                let rv = self.lower_expr_to_rvalue(a)?;
                lowered_args.push(flatten_operand(self, rv)?);
            }
            return Ok(RValue::BuiltinCall { name: callee.to_string(), args: lowered_args });
        }

        self.lower_user_call(callee, args, span)?;
        let temp = self.fresh_temp();
        self.emit(IrStmt::Assign {
            dest: Atom::Name(temp.clone()),
            value: RValue::Operand(Operand::plain(Atom::Name(registers::RVAL.to_string()))),
        });
        Ok(RValue::Operand(Operand::plain(Atom::Name(temp))))
    }

    fn lower_expr_for_effect(&mut self, expr: &Expr) -> Result<(), CompileError> {
        if let Expr::Call { callee, args, span } = expr {
            if builtins::is_builtin(callee) {
                let mut lowered_args = Vec::with_capacity(args.len());
                for a in args {
                    let rv = self.lower_expr_to_rvalue(a)?;
                    lowered_args.push(flatten_operand(self, rv)?);
                }
                self.emit(IrStmt::CallBuiltinStmt { name: callee.clone(), args: lowered_args });
                return Ok(());
            }
            return self.lower_user_call(callee, args, *span);
        }
        // Any other bare expression statement: lower for its side effects
        // (there are none beyond nested calls, already handled above via
        // recursion) and discard the result.
        self.lower_expr_to_rvalue(expr).map(|_| ())
    }

    /// Direct-call (and, above threshold, trampoline) lowering of a call
    /// to a user-defined function (spec §4.5 L3). The software call stack
    /// is not optional machinery reserved for the trampoline pragma: every
    /// direct call pushes the caller's own pending return index and the
    /// callee's parameter storage before jumping in, and restores both
    /// right after the call returns, because both are plain globals that
    /// a recursive (or mutually recursive) reentry would otherwise
    /// overwrite out from under the outer, still-waiting invocation.
    /// `push_pop_trampolines` only changes *where* the push sequence's
    /// code lives — inlined at each call site, or shared once per function
    /// behind a jump — never whether it runs.
    fn lower_user_call(&mut self, callee: &str, args: &[Expr], span: Span) -> Result<(), CompileError> {
        let info = self.semantic.functions.get(callee).ok_or_else(|| CompileError::Lowering {
            span,
            message: format!("call to unknown function `{}`", callee),
        })?;

        if info.inlineable {
            return self.lower_inlined_call(callee, args, span);
        }

        if args.len() > registers::ARG_REGISTERS.len() {
            return Err(CompileError::Lowering {
                span,
                message: format!(
                    "function `{}` called with {} arguments, more than the maximum supported {}",
                    callee,
                    args.len(),
                    registers::ARG_REGISTERS.len()
                ),
            });
        }

        let f = self.program.find_function(callee).ok_or_else(|| CompileError::Lowering {
            span,
            message: format!("call to unknown function `{}`", callee),
        })?;

        // Evaluate every argument that is itself a call into a temporary
        // *before* touching any __a* register, so an inner call can never
        // clobber argument registers mid-setup (spec §4.5 L1).
        let mut arg_atoms = Vec::with_capacity(args.len());
        for a in args {
            let rv = self.lower_expr_to_rvalue(a)?;
            arg_atoms.push(flatten_operand(self, rv)?);
        }
        for (i, operand) in arg_atoms.into_iter().enumerate() {
            self.emit(IrStmt::Assign {
                dest: Atom::Name(registers::ARG_REGISTERS[i].to_string()),
                value: RValue::Operand(operand),
            });
        }

        let use_trampoline = self.pragmas.push_pop_trampolines
            && self.pragmas.safe_stack
            && args.len() >= self.trampoline_argc;

        let return_label = self.fresh_label("call_ret");
        let ret_index = self.call_sites.entry(callee.to_string()).or_default().len() as i64;
        self.call_sites
            .get_mut(callee)
            .unwrap()
            .push(PendingCallSite { return_label: return_label.clone() });

        // Stage the *old* __ret before overwriting it with this call's own
        // index — the push (inline or trampoline) reads the staged copy,
        // not __ret itself, so it doesn't matter which of the two
        // assignments below runs first in the trampoline case.
        self.declare_global(registers::RET_SAVE);
        self.emit(IrStmt::Assign {
            dest: Atom::Name(registers::RET_SAVE.to_string()),
            value: RValue::Operand(Operand::plain(Atom::Name(registers::RET.to_string()))),
        });
        self.emit(IrStmt::Assign {
            dest: Atom::Name(registers::RET.to_string()),
            value: RValue::Operand(Operand::plain(Atom::Int(ret_index))),
        });

        if use_trampoline {
            let label = self.ensure_push_trampoline(callee, f);
            self.emit(IrStmt::Goto { label });
        } else {
            self.emit_call_push(f);
            self.emit(IrStmt::Goto { label: format!("__fn_{}_entry", callee) });
        }

        self.emit(IrStmt::Label { label: return_label });
        self.emit_call_pop(f);
        Ok(())
    }

    /// Builds (the first time it's needed) a shared per-function push
    /// trampoline: the same push sequence `emit_call_push` would inline,
    /// behind one label every qualifying call site to `callee` jumps to
    /// instead of repeating it. Trades a little indirection for less
    /// duplicated code across call sites (spec §4.5 L3, "Trampoline" in
    /// the glossary).
    fn ensure_push_trampoline(&mut self, callee: &str, f: &FunctionDef) -> String {
        let label = format!("__fn_{}_push_tramp", callee);
        if self.push_trampoline_seen.insert(callee.to_string(), ()).is_none() {
            let saved = std::mem::take(&mut self.body);
            self.emit(IrStmt::Label { label: label.clone() });
            self.emit_call_push(f);
            self.emit(IrStmt::Goto { label: format!("__fn_{}_entry", callee) });
            let produced = std::mem::replace(&mut self.body, saved);
            self.push_trampolines.push((callee.to_string(), produced));
        }
        label
    }

    /// Pushes `__ret_save` (the caller's pending return index, staged by
    /// the caller just before this runs) and then `f`'s own parameter
    /// storage onto the software stack, each push individually guarded by
    /// the overflow check under `safe_stack` (spec §4.5 L4 invariant 5).
    /// Must run before the `goto` into `f`'s entry, which is what
    /// overwrites that same parameter storage with the new call's
    /// arguments.
    fn emit_call_push(&mut self, f: &FunctionDef) {
        self.emit_stack_push(RValue::Operand(Operand::plain(Atom::Name(registers::RET_SAVE.to_string()))));
        for p in &f.params {
            let pname = self.param_name(f, p.span, &p.name);
            self.declare_global(&pname);
            self.emit_stack_push(RValue::Operand(Operand::plain(Atom::Name(pname))));
        }
    }

    /// Restores `f`'s parameter storage and `__ret` from the software
    /// stack, in the reverse order `emit_call_push` pushed them in.
    /// Always inlined at the call site's own return label: unlike the
    /// push, the pop can't be shared behind one jump per function, since
    /// each call site resumes its own distinct surrounding code right
    /// after.
    fn emit_call_pop(&mut self, f: &FunctionDef) {
        for p in f.params.iter().rev() {
            let pname = self.param_name(f, p.span, &p.name);
            self.emit_stack_pop(Atom::Name(pname));
        }
        self.emit_stack_pop(Atom::Name(registers::RET.to_string()));
    }

    /// Push path of the software call stack (spec §4.5 L3/L4): stores
    /// `value` at `ram[__sp]`, then decrements `__sp`, branching to the
    /// overflow handler first under `safe_stack` if the push would land
    /// at or past `stack_end`.
    fn emit_stack_push(&mut self, value: RValue) {
        if self.pragmas.safe_stack {
            let handler = self.ensure_overflow_handler();
            let cond = RValue::Binary {
                op: BinaryOp::Le,
                lhs: Operand::plain(Atom::Name(registers::SP.to_string())),
                rhs: Operand::plain(Atom::Name(registers::STACK_END.to_string())),
            };
            self.emit(IrStmt::IfGoto { cond, label: handler });
        }
        self.emit(IrStmt::Assign {
            dest: Atom::HwIndex { array: HwArray::Ram, index: Box::new(Atom::Name(registers::SP.to_string())) },
            value,
        });
        self.emit(IrStmt::Assign {
            dest: Atom::Name(registers::SP.to_string()),
            value: RValue::Binary {
                op: BinaryOp::Sub,
                lhs: Operand::plain(Atom::Name(registers::SP.to_string())),
                rhs: Operand::plain(Atom::Int(1)),
            },
        });
    }

    /// Pop path of the software call stack (spec §4.5 L4 invariant 5):
    /// symmetric with `emit_stack_push`, increments `__sp` and reads
    /// `ram[__sp]` back into `dest`, branching to the underflow handler
    /// first under `safe_stack` if the pop would take `__sp` past
    /// `stack_start`.
    fn emit_stack_pop(&mut self, dest: Atom) {
        if self.pragmas.safe_stack {
            let handler = self.ensure_underflow_handler();
            let cond = RValue::Binary {
                op: BinaryOp::Ge,
                lhs: Operand::plain(Atom::Name(registers::SP.to_string())),
                rhs: Operand::plain(Atom::Name(registers::STACK_START.to_string())),
            };
            self.emit(IrStmt::IfGoto { cond, label: handler });
        }
        self.emit(IrStmt::Assign {
            dest: Atom::Name(registers::SP.to_string()),
            value: RValue::Binary {
                op: BinaryOp::Add,
                lhs: Operand::plain(Atom::Name(registers::SP.to_string())),
                rhs: Operand::plain(Atom::Int(1)),
            },
        });
        self.emit(IrStmt::Assign {
            dest,
            value: RValue::Operand(Operand::plain(Atom::HwIndex {
                array: HwArray::Ram,
                index: Box::new(Atom::Name(registers::SP.to_string())),
            })),
        });
    }

    /// Stable name for the shared overflow handler; its body is appended
    /// once at the very end of the program by `append_overflow_handler`,
    /// so call sites only ever need the name, never the handler itself.
    fn ensure_overflow_handler(&mut self) -> String {
        "__stack_overflow".to_string()
    }

    /// Stable name for the shared underflow handler, appended alongside
    /// the overflow one by `append_overflow_handler` when referenced.
    fn ensure_underflow_handler(&mut self) -> String {
        "__stack_underflow".to_string()
    }

    /// Substitutes `callee`'s body at this call site (spec §4.5 L3
    /// Inlining): each parameter is bound once into a fresh global holding
    /// the corresponding (already-flattened) argument value, and every
    /// local in the callee body resolves through the same globalized
    /// per-declaration names `semantic.rs` assigned, so it can never alias
    /// a same-named local in the caller.
    fn lower_inlined_call(&mut self, callee: &str, args: &[Expr], span: Span) -> Result<(), CompileError> {
        let f = self.program.find_function(callee).ok_or_else(|| CompileError::Lowering {
            span,
            message: format!("inlineable function `{}` has no body", callee),
        })?;

        for (p, a) in f.params.iter().zip(args.iter()) {
            let pname = self.param_name(f, p.span, &p.name);
            self.declare_global(&pname);
            let rv = self.lower_expr_to_rvalue(a)?;
            self.emit(IrStmt::Assign { dest: Atom::Name(pname), value: rv });
        }

        let saved_function = self.current_function.replace(callee.to_string());
        let end_label = self.fresh_label("inline_end");
        let saved_inline_return = self.inline_return_label.replace(end_label.clone());
        self.lower_block(&f.body)?;
        self.inline_return_label = saved_inline_return;
        self.emit(IrStmt::Label { label: end_label });
        self.current_function = saved_function;
        Ok(())
    }
}

/// Flattens an [`RValue`] down to a single [`Operand`], materializing a
/// fresh temporary if it isn't already a bare operand.
fn flatten_operand(lowerer: &mut Lowerer, rv: RValue) -> Result<Operand, CompileError> {
    match rv {
        RValue::Operand(o) => Ok(o),
        other => {
            let temp = lowerer.fresh_temp();
            lowerer.emit(IrStmt::Assign { dest: Atom::Name(temp.clone()), value: other });
            Ok(Operand::plain(Atom::Name(temp)))
        }
    }
}

/// Whether `rv` has a builtin or (already-lowered) user call anywhere
/// inside it. A parenthesized expression containing one cannot be kept
/// inline as `Atom::Grouped` — the call must run through its own
/// temporary so its side effect is sequenced correctly.
fn rvalue_contains_call(rv: &RValue) -> bool {
    match rv {
        RValue::BuiltinCall { .. } => true,
        RValue::Operand(o) => atom_contains_call(&o.atom),
        RValue::Unary { operand, .. } => atom_contains_call(&operand.atom),
        RValue::Binary { lhs, rhs, .. } => atom_contains_call(&lhs.atom) || atom_contains_call(&rhs.atom),
    }
}

fn atom_contains_call(atom: &Atom) -> bool {
    match atom {
        Atom::Grouped(inner) => rvalue_contains_call(inner),
        Atom::HwIndex { index, .. } => atom_contains_call(index),
        _ => false,
    }
}

fn compound_to_binary(op: AssignOp) -> BinaryOp {
    match op {
        AssignOp::AddAssign => BinaryOp::Add,
        AssignOp::SubAssign => BinaryOp::Sub,
        AssignOp::MulAssign => BinaryOp::Mul,
        AssignOp::DivAssign => BinaryOp::Div,
        AssignOp::ModAssign => BinaryOp::Mod,
        AssignOp::Assign => unreachable!("Assign has no binary-op form"),
    }
}

/// Evaluates `expr` as a compile-time constant when it's a bare literal
/// (or a unary/binary combination of literals), for `simplify_ifs`
/// constant-branch folding. Returns `None` for anything that reads a
/// variable or calls a function — those are never folded, since folding
/// them could drop an observable side effect.
fn const_eval(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::IntLit { value, .. } => Some(*value),
        Expr::Paren { inner, .. } => const_eval(inner),
        Expr::Unary { op, operand, .. } => {
            let v = const_eval(operand)?;
            Some(match op {
                UnaryOp::Neg => -v,
                UnaryOp::Not => (v == 0) as i64,
                UnaryOp::BitNot => !v,
            })
        }
        Expr::Binary { op, lhs, rhs, .. } => {
            let l = const_eval(lhs)?;
            let r = const_eval(rhs)?;
            Some(match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div if r != 0 => l / r,
                BinaryOp::Mod if r != 0 => l % r,
                BinaryOp::Eq => (l == r) as i64,
                BinaryOp::Ne => (l != r) as i64,
                BinaryOp::Lt => (l < r) as i64,
                BinaryOp::Le => (l <= r) as i64,
                BinaryOp::Gt => (l > r) as i64,
                BinaryOp::Ge => (l >= r) as i64,
                BinaryOp::And => ((l != 0) && (r != 0)) as i64,
                BinaryOp::Or => ((l != 0) || (r != 0)) as i64,
                BinaryOp::BitAnd => l & r,
                BinaryOp::BitOr => l | r,
                BinaryOp::BitXor => l ^ r,
                BinaryOp::Shl => l << r,
                BinaryOp::Shr => l >> r,
                _ => return None,
            })
        }
        _ => None,
    }
}

pub fn lower(program: &Program, semantic: &SemanticResult, pragmas: &PragmaSet) -> Result<IrProgram, CompileError> {
    let mut ir = Lowerer::new(program, semantic, pragmas).lower()?;
    if pragmas.safe_stack {
        append_overflow_handler(&mut ir, pragmas);
    }
    Ok(ir)
}

/// Appends the shared stack-overflow and stack-underflow handler bodies
/// once, at the very end of the program, for whichever of the two was
/// actually referenced by an emitted push or pop (spec §4.5 L4): each
/// prints its message when `builtin_error_logging` is on, then spins.
fn append_overflow_handler(ir: &mut IrProgram, pragmas: &PragmaSet) {
    append_one_handler(ir, pragmas, "__stack_overflow", "Stack overflow");
    append_one_handler(ir, pragmas, "__stack_underflow", "Stack underflow");
}

fn append_one_handler(ir: &mut IrProgram, pragmas: &PragmaSet, handler: &str, message: &str) {
    let referenced = ir.body.iter().any(|s| matches!(s, IrStmt::IfGoto { label, .. } if label == handler));
    if !referenced {
        return;
    }
    ir.body.push(IrStmt::Label { label: handler.to_string() });
    if pragmas.builtin_error_logging {
        ir.body.push(IrStmt::CallBuiltinStmt {
            name: "echo".to_string(),
            args: vec![Operand::plain(Atom::Str(message.to_string()))],
        });
    }
    let spin = format!("{}_spin", handler);
    ir.body.push(IrStmt::Label { label: spin.clone() });
    ir.body.push(IrStmt::Goto { label: spin });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::token::{Tokenizer, TokenKind};

    fn compile(src: &str, pragmas: &PragmaSet) -> IrProgram {
        let mut toks = Tokenizer::new(0, src).tokenize().unwrap();
        toks.retain(|t| !matches!(t.kind, TokenKind::Eof | TokenKind::Newline | TokenKind::Directive));
        let program = Parser::new(&toks).parse_program().unwrap();
        let semantic = crate::semantic::analyze(&program, pragmas).unwrap();
        lower(&program, &semantic, pragmas).unwrap()
    }

    fn labels(ir: &IrProgram) -> Vec<&str> {
        ir.body
            .iter()
            .filter_map(|s| match s {
                IrStmt::Label { label } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn if_else_lowers_to_labeled_gotos() {
        let ir = compile("main() { if (1) { var x = 1; } else { var y = 2; } }", &PragmaSet::new());
        let ls = labels(&ir);
        assert!(ls.iter().any(|l| l.starts_with("__if_then_")));
        assert!(ls.iter().any(|l| l.starts_with("__if_end_")));
    }

    #[test]
    fn while_loop_has_top_and_break_labels() {
        let ir = compile("main() { while (1) { break; } }", &PragmaSet::new());
        let ls = labels(&ir);
        assert!(ls.iter().any(|l| l.starts_with("__wh_") && !l.contains("break")));
        assert!(ls.iter().any(|l| l.contains("wh_break")));
    }

    #[test]
    fn switch_dispatch_preserves_source_order_s4() {
        let ir = compile(
            "main() { var c = 1; switch (c) { case 7: echo(\"7\"); break; case get_magic(): echo(\"magic\"); case 11: echo(\"o\"); break; default: echo(\"d\"); } } get_magic() { return 1; }",
            &PragmaSet::new(),
        );
        let mut seen_case_7 = false;
        let mut seen_case_call = false;
        for s in &ir.body {
            if let IrStmt::IfGoto { label, .. } = s {
                if label.ends_with("_0") {
                    seen_case_7 = true;
                }
            }
            if let IrStmt::Goto { label } = s {
                if label.starts_with("__fn_get_magic_entry") {
                    // the call dispatch happens after the constant case
                    // check, in source order
                    assert!(seen_case_7);
                    seen_case_call = true;
                }
            }
        }
        assert!(seen_case_call);
    }

    #[test]
    fn direct_call_sets_arg_registers_and_jumps_to_entry() {
        let ir = compile("add(a, b) { return a + b; } main() { var x = add(1, 2); }", &PragmaSet::new());
        let has_a0 = ir.body.iter().any(|s| matches!(s, IrStmt::Assign { dest: Atom::Name(n), .. } if n == "__a0"));
        let has_entry_goto = ir
            .body
            .iter()
            .any(|s| matches!(s, IrStmt::Goto { label } if label == "__fn_add_entry"));
        assert!(has_a0);
        assert!(has_entry_goto);
    }

    #[test]
    fn single_use_function_inlines_when_pragma_on() {
        let mut pragmas = PragmaSet::new();
        pragmas.inline_one_use_functions = true;
        let ir = compile("helper(n) { return n + 1; } main() { var x = helper(5); }", &pragmas);
        let has_entry = ir.body.iter().any(|s| matches!(s, IrStmt::Label { label } if label == "__fn_helper_entry"));
        assert!(!has_entry, "inlined function must not also emit a standalone body");
    }

    /// S5's literal configuration: a single-argument recursive `sum(n)`,
    /// `safe_stack true`, no `push_pop_trampolines` at all. This must
    /// still reference the overflow handler, since the default direct-call
    /// mode already pushes every call's return index and argument onto
    /// the software stack — trampolines are a code-size choice on top of
    /// that, not what makes the stack real.
    #[test]
    fn recursive_call_overflows_in_default_mode_without_trampolines_s5() {
        let mut pragmas = PragmaSet::new();
        pragmas.safe_stack = true;
        pragmas.builtin_error_logging = true;
        pragmas.stack_start = 100;
        pragmas.stack_end = 200;
        let ir = compile(
            "sum(n) { if (n == 0) { return 0; } return n + sum(n - 1); } main() { var r = sum(100); }",
            &pragmas,
        );
        let has_handler = ir.body.iter().any(|s| matches!(s, IrStmt::Label { label } if label == "__stack_overflow"));
        let logs_overflow = ir.body.iter().any(|s| matches!(
            s,
            IrStmt::CallBuiltinStmt { name, args } if name == "echo" && args.iter().any(|a| matches!(&a.atom, Atom::Str(s) if s == "Stack overflow"))
        ));
        assert!(has_handler);
        assert!(logs_overflow);
    }

    /// A direct call pushes its caller's pending return index and the
    /// callee's own parameter storage onto `ram[]` and restores both right
    /// after the call returns — the mechanism recursion actually depends
    /// on, independent of `push_pop_trampolines`.
    #[test]
    fn direct_call_pushes_and_pops_ret_and_params_on_ram() {
        let ir = compile("add(a, b) { return a + b; } main() { var x = add(1, 2); }", &PragmaSet::new());
        let pushes_to_ram = ir.body.iter().any(|s| matches!(
            s,
            IrStmt::Assign { dest: Atom::HwIndex { array: crate::ast::HwArray::Ram, .. }, .. }
        ));
        let restores_a = ir.body.iter().any(|s| matches!(
            s,
            IrStmt::Assign { dest: Atom::Name(n), value: RValue::Operand(Operand { atom: Atom::HwIndex { array: crate::ast::HwArray::Ram, .. }, .. }) }
                if n == "__fnadd_p_a" || n == "__ret"
        ));
        assert!(pushes_to_ram, "call site must push onto ram[__sp]");
        assert!(restores_a, "call site must pop a saved value back out of ram[__sp]");
    }

    /// The program must not fall through from the end of `main` into the
    /// first spliced-in function body — every exit from `main` has to
    /// jump past the whole function region to a terminal halt.
    #[test]
    fn main_end_jumps_over_function_bodies_to_program_end() {
        let ir = compile("add(a, b) { return a + b; } main() { var x = add(1, 2); }", &PragmaSet::new());
        let main_end_pos = ir.body.iter().position(|s| matches!(s, IrStmt::Label { label } if label.starts_with("__main_end"))).unwrap();
        let jumps_to_program_end = matches!(
            &ir.body[main_end_pos + 1],
            IrStmt::Goto { label } if label == "__program_end"
        );
        assert!(jumps_to_program_end, "statement right after __main_end must be `goto __program_end;`");

        let program_end_label_pos = ir
            .body
            .iter()
            .position(|s| matches!(s, IrStmt::Label { label } if label == "__program_end"))
            .expect("__program_end label must be emitted");
        assert!(program_end_label_pos > main_end_pos, "__program_end must come after every spliced function body");
        assert!(
            matches!(&ir.body[program_end_label_pos + 1], IrStmt::Goto { label } if label == "__program_end"),
            "__program_end must spin rather than fall through"
        );
    }

    #[test]
    fn constant_true_if_folds_away_else_under_simplify_ifs() {
        let mut pragmas = PragmaSet::new();
        pragmas.simplify_ifs = true;
        let ir = compile("main() { if (1) { var x = 1; } else { var y = 2; } }", &pragmas);
        let ls = labels(&ir);
        assert!(!ls.iter().any(|l| l.starts_with("__if_")), "constant branch should fold without emitting if-labels");
    }
}
