//! Garnet - a bytecode compiler and object runtime for a Ruby-like language.
//!
//! Programs arrive as [`ast::Node`] trees, built in Rust or deserialized
//! from JSON. They compile to instruction sequences and run on a VM with
//! classes, modules, singleton classes and non-local control flow.
//!
//! # Example
//!
//! ```
//! use garnet::ast::build::*;
//!
//! let program = body(vec![
//!     lasgn("x", int(20)),
//!     fcall("puts", vec![call(vcall("x"), "+", vec![int(22)])]),
//! ]);
//! let result = garnet::eval(&program).unwrap();
//! assert_eq!(result.output, "42\n");
//! ```

pub use garnet_ast as ast;
pub use garnet_bytecode as bytecode;
pub use garnet_compiler as compiler;
pub use garnet_vm as vm;

// Re-export commonly used types
pub use garnet_ast::Node;
pub use garnet_bytecode::{Instruction, InstructionSequence};
pub use garnet_compiler::{CompileError, Compiler, CompilerConfig};
pub use garnet_vm::{Registry, Signal, VM, Value, VmConfig, VmError};

use thiserror::Error;

/// Error type for eval operations.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("invalid syntax tree: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("runtime error: {0}")]
    Runtime(#[from] VmError),
}

/// Result of running a program.
#[derive(Debug)]
pub struct Evaluation {
    /// Value of the last top-level expression.
    pub value: Value,
    /// Text written by `puts` and `p`.
    pub output: String,
}

/// Compile and run a program with the default VM configuration.
pub fn eval(program: &Node) -> Result<Evaluation, EvalError> {
    eval_with_config(program, VmConfig::default())
}

/// Compile and run a program on a VM built from `config`.
pub fn eval_with_config(program: &Node, config: VmConfig) -> Result<Evaluation, EvalError> {
    let iseq = garnet_compiler::compile(program)?;
    log::debug!("compiled {} top-level instructions", iseq.instructions.len());

    let mut vm = VM::new(config);
    let value = vm.run(iseq)?;
    Ok(Evaluation {
        value,
        output: vm.take_output(),
    })
}

/// Run a program given as a JSON syntax tree.
///
/// # Example
///
/// ```
/// let json = r#"{"type": "Call", "receiver": {"type": "Integer", "value": 6},
///                "name": "*", "args": [{"type": "Integer", "value": 7}]}"#;
/// let result = garnet::eval_json(json).unwrap();
/// assert_eq!(result.value, garnet::Value::Integer(42));
/// ```
pub fn eval_json(json: &str) -> Result<Evaluation, EvalError> {
    let program: Node = serde_json::from_str(json)?;
    eval(&program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_ast::build::*;

    fn eval_ok(program: Node) -> Evaluation {
        eval(&program).unwrap_or_else(|e| panic!("eval failed for {}: {}", program, e))
    }

    #[test]
    fn test_eval_value_and_output() {
        let result = eval_ok(body(vec![
            fcall("puts", vec![string("hello")]),
            call(int(2), "*", vec![int(21)]),
        ]));
        assert_eq!(result.value, Value::Integer(42));
        assert_eq!(result.output, "hello\n");
    }

    #[test]
    fn test_compile_error_is_reported() {
        let err = eval(&brk(None)).unwrap_err();
        assert!(matches!(err, EvalError::Compile(_)));
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let err = eval(&vcall("undefined_thing")).unwrap_err();
        assert!(matches!(err, EvalError::Runtime(VmError::Uncaught(_))));
        assert!(err.to_string().contains("NoMethodError"));
    }

    #[test]
    fn test_invalid_json() {
        let err = eval_json("{\"type\": \"Nope\"}").unwrap_err();
        assert!(matches!(err, EvalError::Parse(_)));
    }
}
