//! Garnet instruction set.
//!
//! Instructions are typed values rather than packed words. Jump targets are
//! [`Label`]s, resolved through the owning sequence's label table.

use std::fmt;
use std::rc::Rc;

use crate::code::{InstructionSequence, Label};

/// Instructions for the Garnet stack machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    // =========================================================================
    // Stack
    // =========================================================================
    /// No operation.
    Nop,
    /// Discard top of stack.
    Pop,
    /// Duplicate top of stack.
    Dup,
    /// Push nil. Also the "resolve lexically" marker before `GetConstant`.
    PutNil,
    /// Push the current self.
    PutSelf,
    /// Push an immediate literal.
    PutObject(Literal),
    /// Push a fresh string.
    PutString(Rc<str>),
    /// Push a runtime-provided object.
    PutSpecialObject(SpecialObject),
    /// Push a literal instruction sequence for a following `DefineMethod`.
    PutIseq(Rc<InstructionSequence>),
    /// Build an array from the top N values.
    NewArray(usize),

    // =========================================================================
    // Variables
    // =========================================================================
    /// Load a local. `level` counts environments outward (0 = own).
    GetLocal { index: usize, level: usize },
    /// Store a local.
    SetLocal { index: usize, level: usize },
    /// Load an instance variable of self.
    GetInstanceVariable(Rc<str>),
    /// Store an instance variable of self.
    SetInstanceVariable(Rc<str>),
    /// Pop a base (nil = lexical) and push the named constant.
    GetConstant(Rc<str>),
    /// Pop a base and a value; store the value as a constant of the base.
    SetConstant(Rc<str>),

    // =========================================================================
    // Definitions
    // =========================================================================
    /// Pop superclass (or nil) and base; open the class and run its body.
    DefineClass {
        name: Rc<str>,
        iseq: Rc<InstructionSequence>,
        kind: DefineClassKind,
    },
    /// Pop an iseq and a base; install the method.
    DefineMethod { name: Rc<str>, singleton: bool },

    // =========================================================================
    // Calls
    // =========================================================================
    /// Call a method on the receiver below the arguments.
    Send(CallInfo),
    /// Call the next definition of the current method up the ancestor chain.
    InvokeSuper(CallInfo),
    /// Call the block passed to the current method.
    InvokeBlock { argc: usize },
    /// Pop a pattern and a value; push whether the value is a kind of pattern.
    CheckMatch,

    // =========================================================================
    // Control
    // =========================================================================
    /// Unconditional jump.
    Jump(Label),
    /// Pop and jump if truthy.
    BranchIf(Label),
    /// Pop and jump if falsy.
    BranchUnless(Label),
    /// Pop the result and end the activation.
    Leave,
    /// Pop a value and raise it as a signal of the given kind.
    Throw(ThrowKind),
    /// Re-propagate the signal stashed when an ensure handler was entered.
    EndEnsure,
}

impl Instruction {
    /// Values popped and pushed by this instruction.
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Instruction::Nop => (0, 0),
            Instruction::Pop => (1, 0),
            Instruction::Dup => (1, 2),
            Instruction::PutNil
            | Instruction::PutSelf
            | Instruction::PutObject(_)
            | Instruction::PutString(_)
            | Instruction::PutSpecialObject(_)
            | Instruction::PutIseq(_) => (0, 1),
            Instruction::NewArray(n) => (*n, 1),
            Instruction::GetLocal { .. } | Instruction::GetInstanceVariable(_) => (0, 1),
            Instruction::SetLocal { .. } | Instruction::SetInstanceVariable(_) => (1, 0),
            Instruction::GetConstant(_) => (1, 1),
            Instruction::SetConstant(_) => (2, 0),
            Instruction::DefineClass { .. } => (2, 1),
            Instruction::DefineMethod { .. } => (2, 0),
            Instruction::Send(ci) | Instruction::InvokeSuper(ci) => (ci.stack_args() + 1, 1),
            Instruction::InvokeBlock { argc } => (*argc, 1),
            Instruction::CheckMatch => (2, 1),
            Instruction::Jump(_) | Instruction::EndEnsure => (0, 0),
            Instruction::BranchIf(_) | Instruction::BranchUnless(_) => (1, 0),
            Instruction::Leave | Instruction::Throw(_) => (1, 0),
        }
    }

    /// Mnemonic used by the disassembler and trace output.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "nop",
            Instruction::Pop => "pop",
            Instruction::Dup => "dup",
            Instruction::PutNil => "putnil",
            Instruction::PutSelf => "putself",
            Instruction::PutObject(_) => "putobject",
            Instruction::PutString(_) => "putstring",
            Instruction::PutSpecialObject(_) => "putspecialobject",
            Instruction::PutIseq(_) => "putiseq",
            Instruction::NewArray(_) => "newarray",
            Instruction::GetLocal { .. } => "getlocal",
            Instruction::SetLocal { .. } => "setlocal",
            Instruction::GetInstanceVariable(_) => "getinstancevariable",
            Instruction::SetInstanceVariable(_) => "setinstancevariable",
            Instruction::GetConstant(_) => "getconstant",
            Instruction::SetConstant(_) => "setconstant",
            Instruction::DefineClass { .. } => "defineclass",
            Instruction::DefineMethod { .. } => "definemethod",
            Instruction::Send(_) => "send",
            Instruction::InvokeSuper(_) => "invokesuper",
            Instruction::InvokeBlock { .. } => "invokeblock",
            Instruction::CheckMatch => "checkmatch",
            Instruction::Jump(_) => "jump",
            Instruction::BranchIf(_) => "branchif",
            Instruction::BranchUnless(_) => "branchunless",
            Instruction::Leave => "leave",
            Instruction::Throw(_) => "throw",
            Instruction::EndEnsure => "endensure",
        }
    }

    /// Jump target, if this is a branch instruction.
    pub fn target(&self) -> Option<Label> {
        match self {
            Instruction::Jump(l) | Instruction::BranchIf(l) | Instruction::BranchUnless(l) => {
                Some(*l)
            }
            _ => None,
        }
    }

    /// Nested instruction sequence carried as an operand.
    pub fn child_iseq(&self) -> Option<&Rc<InstructionSequence>> {
        match self {
            Instruction::PutIseq(iseq) | Instruction::DefineClass { iseq, .. } => Some(iseq),
            Instruction::Send(ci) | Instruction::InvokeSuper(ci) => ci.block.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.mnemonic();
        match self {
            Instruction::PutObject(lit) => write!(f, "{} {}", name, lit),
            Instruction::PutString(s) => write!(f, "{} {:?}", name, s),
            Instruction::PutSpecialObject(obj) => write!(f, "{} {}", name, obj),
            Instruction::PutIseq(iseq) => write!(f, "{} <ISeq:{}>", name, iseq.name),
            Instruction::NewArray(n) => write!(f, "{} {}", name, n),
            Instruction::GetLocal { index, level } | Instruction::SetLocal { index, level } => {
                write!(f, "{} {}, {}", name, index, level)
            }
            Instruction::GetInstanceVariable(n)
            | Instruction::SetInstanceVariable(n)
            | Instruction::GetConstant(n)
            | Instruction::SetConstant(n) => write!(f, "{} :{}", name, n),
            Instruction::DefineClass {
                name: class_name,
                iseq,
                kind,
            } => write!(f, "{} :{}, <ISeq:{}>, {}", name, class_name, iseq.name, kind),
            Instruction::DefineMethod {
                name: method_name,
                singleton,
            } => write!(f, "{} :{}, {}", name, method_name, singleton),
            Instruction::Send(ci) | Instruction::InvokeSuper(ci) => write!(f, "{} {}", name, ci),
            Instruction::InvokeBlock { argc } => write!(f, "{} {}", name, argc),
            Instruction::Jump(l) | Instruction::BranchIf(l) | Instruction::BranchUnless(l) => {
                write!(f, "{} {}", name, l)
            }
            Instruction::Throw(kind) => write!(f, "{} {}", name, kind),
            _ => write!(f, "{}", name),
        }
    }
}

/// Immediate literal operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Symbol(Rc<str>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(n) => write!(f, "{}", n),
            Literal::Float(n) => write!(f, "{:?}", n),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Symbol(s) => write!(f, ":{}", s),
        }
    }
}

/// Objects supplied by the runtime rather than the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialObject {
    /// Innermost lexically enclosing class: the target of `def` and the base
    /// of unqualified constant assignment.
    CBase,
    /// The root namespace, for `::Foo`.
    Object,
}

impl fmt::Display for SpecialObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialObject::CBase => write!(f, "cbase"),
            SpecialObject::Object => write!(f, "object"),
        }
    }
}

/// What a `DefineClass` opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefineClassKind {
    Class,
    SingletonClass,
    Module,
}

impl DefineClassKind {
    /// Numeric form used in traces.
    pub fn as_u8(self) -> u8 {
        match self {
            DefineClassKind::Class => 0,
            DefineClassKind::SingletonClass => 1,
            DefineClassKind::Module => 2,
        }
    }
}

impl fmt::Display for DefineClassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DefineClassKind::Class => "class",
            DefineClassKind::SingletonClass => "singletonclass",
            DefineClassKind::Module => "module",
        };
        write!(f, "{}", s)
    }
}

/// Kind of signal raised by `Throw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrowKind {
    /// Leave the method that lexically owns the running block.
    Return,
    Break,
    Next,
    Redo,
    Retry,
    /// Re-raise the exception on top of the stack.
    Raise,
}

impl fmt::Display for ThrowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThrowKind::Return => "return",
            ThrowKind::Break => "break",
            ThrowKind::Next => "next",
            ThrowKind::Redo => "redo",
            ThrowKind::Retry => "retry",
            ThrowKind::Raise => "raise",
        };
        write!(f, "{}", s)
    }
}

/// Call-site flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CallFlags {
    /// Receiver was implicit self.
    pub fcall: bool,
    /// Bare identifier that turned out not to be a local.
    pub vcall: bool,
    /// A block value (`&blk`) sits above the arguments.
    pub blockarg: bool,
    /// Bare `super`: forward the current method's arguments.
    pub zsuper: bool,
}

impl fmt::Display for CallFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.fcall {
            parts.push("FCALL");
        }
        if self.vcall {
            parts.push("VCALL");
        }
        if self.blockarg {
            parts.push("ARGS_BLOCKARG");
        }
        if self.zsuper {
            parts.push("ZSUPER");
        }
        write!(f, "{}", parts.join("|"))
    }
}

/// Operands of `Send` and `InvokeSuper`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    pub name: Rc<str>,
    pub argc: usize,
    pub flags: CallFlags,
    /// Literal block attached to the call site.
    pub block: Option<Rc<InstructionSequence>>,
}

impl CallInfo {
    pub fn new(name: &str, argc: usize) -> Self {
        Self {
            name: name.into(),
            argc,
            flags: CallFlags::default(),
            block: None,
        }
    }

    /// Values above the receiver: arguments plus an optional block argument.
    pub fn stack_args(&self) -> usize {
        self.argc + usize::from(self.flags.blockarg)
    }
}

impl fmt::Display for CallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<calldata!mid:{}, argc:{}", self.name, self.argc)?;
        let flags = self.flags.to_string();
        if !flags.is_empty() {
            write!(f, ", {}", flags)?;
        }
        write!(f, ">")?;
        if let Some(block) = &self.block {
            write!(f, ", <ISeq:{}>", block.name)?;
        }
        Ok(())
    }
}
