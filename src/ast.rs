//! AST node types for the reduced C-like language (spec §3).
//!
//! Generalized from the teacher's `Program`/`WordDef`/`Statement` shape (a
//! flat word list over a stack language) into a tree of statements and
//! expressions for a language with real nesting, `if`/`while`/`for`/
//! `switch`, and multi-argument function calls.

use crate::diagnostics::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
}

/// One of the three fixed hardware arrays (spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwArray {
    Sys,
    Ram,
    Text,
}

impl HwArray {
    pub fn name(self) -> &'static str {
        match self {
            HwArray::Sys => "sys",
            HwArray::Ram => "ram",
            HwArray::Text => "text",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sys" => Some(HwArray::Sys),
            "ram" => Some(HwArray::Ram),
            "text" => Some(HwArray::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    IntLit { value: i64, span: Span },
    StrLit { value: String, span: Span },
    Ident { name: String, span: Span },
    HwIndex { array: HwArray, index: Box<Expr>, span: Span },
    Unary { op: UnaryOp, operand: Box<Expr>, span: Span },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr>, span: Span },
    Call { callee: String, args: Vec<Expr>, span: Span },
    /// A parenthesized sub-expression. Kept as a distinct node (rather than
    /// discarded at parse time) so lowering can reproduce the grouping
    /// spec.md §4.5/S3 requires in its output even after flattening.
    Paren { inner: Box<Expr>, span: Span },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::IntLit { span, .. }
            | Expr::StrLit { span, .. }
            | Expr::Ident { span, .. }
            | Expr::HwIndex { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Call { span, .. }
            | Expr::Paren { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LValue {
    Ident { name: String, span: Span },
    HwIndex { array: HwArray, index: Box<Expr>, span: Span },
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    /// `None` marks the `default:` arm.
    pub value: Option<Expr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Block { body: Vec<Stmt>, span: Span },
    VarDecl { name: String, init: Option<Expr>, span: Span },
    Assign { target: LValue, op: AssignOp, value: Expr, span: Span },
    ExprStmt { expr: Expr, span: Span },
    If { cond: Expr, then_branch: Box<Stmt>, else_branch: Option<Box<Stmt>>, span: Span },
    While { cond: Expr, body: Box<Stmt>, span: Span },
    DoWhile { body: Box<Stmt>, cond: Expr, span: Span },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Box<Stmt>,
        span: Span,
    },
    Switch { scrutinee: Expr, cases: Vec<SwitchCase>, span: Span },
    Break { span: Span },
    Continue { span: Span },
    Return { value: Option<Expr>, span: Span },
    Goto { label: String, span: Span },
    Label { name: String, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Block { span, .. }
            | Stmt::VarDecl { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::ExprStmt { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::DoWhile { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Switch { span, .. }
            | Stmt::Break { span }
            | Stmt::Continue { span }
            | Stmt::Return { span, .. }
            | Stmt::Goto { span, .. }
            | Stmt::Label { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct GlobalVarDecl {
    pub name: String,
    pub init: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub globals: Vec<GlobalVarDecl>,
    pub functions: Vec<FunctionDef>,
}

impl Program {
    pub fn find_function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn find_main(&self) -> Option<&FunctionDef> {
        self.find_function("main")
    }

    pub fn find_init(&self) -> Option<&FunctionDef> {
        self.find_function("init")
    }
}
