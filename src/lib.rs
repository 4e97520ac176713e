//! `funclang` library crate.
//!
//! High-level layout:
//! - frontend: `lexer` + `parser` produce the AST (`ast`)
//! - `binder` resolves names to slots and validates call sites
//! - `bytecode` lowers the AST to stack-machine instructions
//! - `vm` executes compiled programs over an I/O boundary
pub mod ast;
pub mod binder;
pub mod bytecode;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod vm;
