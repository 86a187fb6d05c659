//! SDSCP — a source-to-source compiler from a structured, preprocessed
//! C-like language down to SDS-C, the flat labels-and-goto dialect run by
//! SDS-C EXE industrial automation devices.
//!
//! The pipeline (spec §2): tokenize → preprocess → parse → semantic
//! analysis → lower → render. Each stage is its own module; [`driver`]
//! wires them together for both the CLI (`main.rs`) and library callers.

pub mod ast;
pub mod builtins;
pub mod condexpr;
pub mod diagnostics;
pub mod driver;
pub mod ir;
pub mod lower;
pub mod macros;
pub mod parser;
pub mod pragma;
pub mod preprocessor;
pub mod render;
pub mod semantic;
pub mod token;

pub use diagnostics::CompileError;
pub use driver::{compile_file, compile_source, CompileOptions, CompileResult};
pub use ir::IrProgram;
pub use pragma::PragmaSet;
