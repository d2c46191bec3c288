//! Activation records for the Garnet VM.

use std::cell::RefCell;
use std::rc::Rc;

use garnet_bytecode::{InstructionSequence, Label};

use crate::class::RClass;
use crate::object::Value;
use crate::signal::Signal;

/// Unique id of an activation, used as the target of `break` and `return`.
pub type FrameId = usize;

/// Local variable slots of one activation, linked to the enclosing
/// activation's environment for blocks and rescue bodies.
#[derive(Debug)]
pub struct Env {
    slots: RefCell<Vec<Value>>,
    parent: Option<Rc<Env>>,
}

impl Env {
    pub fn new(size: usize, parent: Option<Rc<Env>>) -> Rc<Self> {
        Rc::new(Self {
            slots: RefCell::new(vec![Value::Nil; size]),
            parent,
        })
    }

    fn at_level(self: &Rc<Self>, level: usize) -> Option<Rc<Env>> {
        let mut env = self.clone();
        for _ in 0..level {
            env = env.parent.clone()?;
        }
        Some(env)
    }

    /// Read a slot `level` environments out. Missing slots read as nil.
    pub fn get(self: &Rc<Self>, index: usize, level: usize) -> Value {
        self.at_level(level)
            .and_then(|env| env.slots.borrow().get(index).cloned())
            .unwrap_or(Value::Nil)
    }

    /// Write a slot `level` environments out, growing the slot vector if the
    /// local was declared after the environment was created.
    pub fn set(self: &Rc<Self>, index: usize, level: usize, value: Value) {
        if let Some(env) = self.at_level(level) {
            let mut slots = env.slots.borrow_mut();
            if index >= slots.len() {
                slots.resize(index + 1, Value::Nil);
            }
            slots[index] = value;
        }
    }
}

/// Lexical class nesting: the innermost `class`/`module` body first.
#[derive(Debug)]
pub struct Cref {
    pub class: Rc<RClass>,
    pub parent: Option<Rc<Cref>>,
}

impl Cref {
    pub fn root(class: Rc<RClass>) -> Rc<Self> {
        Rc::new(Self {
            class,
            parent: None,
        })
    }

    pub fn push(self: &Rc<Self>, class: Rc<RClass>) -> Rc<Self> {
        Rc::new(Self {
            class,
            parent: Some(self.clone()),
        })
    }

    /// Enclosing classes, innermost first, excluding the top-level scope.
    pub fn lexical(self: &Rc<Self>) -> impl Iterator<Item = Rc<RClass>> {
        let mut next = Some(self.clone());
        std::iter::from_fn(move || {
            let cref = next.take()?;
            cref.parent.as_ref()?;
            next = cref.parent.clone();
            Some(cref.class.clone())
        })
    }
}

/// The method invocation a frame belongs to: what `super` and `yield`
/// refer to.
#[derive(Debug)]
pub struct MethodContext {
    pub name: Rc<str>,
    /// Chain element the running method was found in.
    pub holder: Rc<RClass>,
    /// Arguments as passed, forwarded by bare `super`.
    pub args: Vec<Value>,
    pub block: Option<Value>,
}

/// A call frame executing one instruction sequence.
pub struct Frame {
    pub id: FrameId,
    pub iseq: Rc<InstructionSequence>,
    pub env: Rc<Env>,
    pub self_value: Value,
    pub cref: Rc<Cref>,
    pub method: Option<Rc<MethodContext>>,
    /// Activation that `return` leaves.
    pub method_frame: FrameId,
    /// Activation that `break` resumes.
    pub break_target: FrameId,
    /// Base of this frame's operand stack region.
    pub bp: usize,
    /// Next instruction.
    pub pc: usize,
    /// Offset of the instruction being executed.
    pub current: usize,
    /// Signals stashed by running ensure handlers, each with the offset its
    /// handler starts at. `endensure` re-raises the innermost.
    pub pending: Vec<(usize, Signal)>,
}

impl Frame {
    pub fn new(
        id: FrameId,
        iseq: Rc<InstructionSequence>,
        env: Rc<Env>,
        self_value: Value,
        cref: Rc<Cref>,
    ) -> Self {
        Self {
            id,
            iseq,
            env,
            self_value,
            cref,
            method: None,
            method_frame: id,
            break_target: id,
            bp: 0,
            pc: 0,
            current: 0,
            pending: Vec::new(),
        }
    }

    /// Block passed to the enclosing method.
    pub fn block(&self) -> Option<&Value> {
        self.method.as_ref().and_then(|m| m.block.as_ref())
    }

    pub fn jump(&mut self, label: Label) {
        self.pc = self.iseq.offset(label);
    }
}
