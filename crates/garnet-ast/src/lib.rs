//! Garnet AST - the tagged syntax tree consumed by the compiler.
//!
//! Tokenizing and parsing live outside this workspace. A parser hands the
//! compiler a [`Node`] tree, either built in Rust or deserialized from JSON.

pub mod ast;
pub mod build;

pub use ast::*;
