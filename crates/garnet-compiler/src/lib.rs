//! Garnet compiler - AST to instruction sequence compilation.
//!
//! The compiler turns a [`garnet_ast::Node`] tree into a top-level
//! [`garnet_bytecode::InstructionSequence`], with methods, blocks, class
//! bodies and rescue handlers as nested sequences.

pub mod compiler;
pub mod scope;

pub use compiler::{compile, CompileError, Compiler, CompilerConfig};
pub use scope::{LocalTable, Resolution, ScopeManager};
