//! Garnet Virtual Machine - instruction sequence execution engine.

use std::rc::Rc;

use garnet_bytecode::{
    CallInfo, CatchKind, DefineClassKind, Instruction, InstructionSequence, Literal,
    SpecialObject, ThrowKind,
};
use thiserror::Error;

use crate::builtins;
use crate::class::{ClassKind, Method, MethodBody, RClass};
use crate::frame::{Cref, Env, Frame, FrameId};
use crate::object::{IdentityKey, Proc, RObject, Value};
use crate::registry::Registry;
use crate::signal::Signal;

/// Default maximum number of nested activations. Each activation recurses
/// on the host stack, so this must fit a 2 MB thread.
const MAX_FRAME_DEPTH: usize = 256;
/// Default operand stack capacity.
const INITIAL_STACK_CAPACITY: usize = 256;

/// A signal escaped the outermost activation.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("uncaught {0}")]
    Uncaught(Signal),
    #[error("stack level too deep")]
    StackOverflow,
}

impl VmError {
    /// The escaped exception object, if the signal was a raise.
    pub fn exception(&self) -> Option<&Value> {
        match self {
            VmError::Uncaught(signal) => signal.exception(),
            VmError::StackOverflow => None,
        }
    }
}

/// VM configuration options.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Nested activations allowed before `SystemStackError` is raised.
    pub max_frame_depth: usize,
    pub initial_stack_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frame_depth: MAX_FRAME_DEPTH,
            initial_stack_capacity: INITIAL_STACK_CAPACITY,
        }
    }
}

/// Outcome of one instruction.
enum Step {
    Continue,
    Leave(Value),
}

/// Garnet Virtual Machine.
pub struct VM {
    pub(crate) registry: Registry,
    /// Operand stack shared by all activations.
    stack: Vec<Value>,
    config: VmConfig,
    /// Top-level self.
    main: Value,
    next_frame_id: FrameId,
    /// Live activations.
    depth: usize,
    /// Block of the method each live activation belongs to.
    block_stack: Vec<Option<Value>>,
    /// Text written by `puts` and `p`.
    output: String,
    /// Exception raised by the frame-depth guard in the current run.
    overflow: Option<Value>,
    /// Arrays whose `inspect` or `join` is in progress.
    rendering: Vec<IdentityKey>,
}

impl VM {
    /// Create a new VM with the core classes installed.
    pub fn new(config: VmConfig) -> Self {
        let registry = Registry::new();
        builtins::install(&registry);
        let main = Value::Object(Rc::new(RObject::new(registry.object.clone())));
        if let Ok(singleton) = registry.singleton_class_of(&main) {
            builtins::install_main(&singleton);
        }

        Self {
            registry,
            stack: Vec::with_capacity(config.initial_stack_capacity),
            config,
            main,
            next_frame_id: 0,
            depth: 0,
            block_stack: Vec::new(),
            output: String::new(),
            overflow: None,
            rendering: Vec::new(),
        }
    }

    /// Execute a top-level instruction sequence.
    pub fn run(&mut self, iseq: Rc<InstructionSequence>) -> Result<Value, VmError> {
        self.stack.clear();
        self.rendering.clear();
        self.overflow = None;
        let id = self.next_frame_id();
        let env = Env::new(iseq.locals.len(), None);
        let cref = Cref::root(self.registry.object.clone());
        let frame = Frame::new(id, iseq, env, self.main.clone(), cref);
        self.execute(frame).map_err(|signal| self.uncaught(signal))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The top-level self object.
    pub fn main(&self) -> &Value {
        &self.main
    }

    /// Output captured so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    /// Mark `value` as being rendered. False if it already is.
    pub(crate) fn enter_rendering(&mut self, value: &Value) -> bool {
        let key = value.identity();
        if self.rendering.contains(&key) {
            return false;
        }
        self.rendering.push(key);
        true
    }

    pub(crate) fn leave_rendering(&mut self) {
        self.rendering.pop();
    }

    /// Block of the innermost running method.
    pub(crate) fn current_block(&self) -> Option<&Value> {
        self.block_stack.last().and_then(Option::as_ref)
    }

    pub(crate) fn next_frame_id(&mut self) -> FrameId {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        id
    }

    fn uncaught(&self, signal: Signal) -> VmError {
        match (signal.exception(), &self.overflow) {
            (Some(exc), Some(guard)) if exc.same(guard) => VmError::StackOverflow,
            _ => VmError::Uncaught(signal),
        }
    }

    // ===========================================================================
    // Execution
    // ===========================================================================

    /// Run an activation to completion or to a signal it does not handle.
    pub(crate) fn execute(&mut self, mut frame: Frame) -> Result<Value, Signal> {
        if self.depth >= self.config.max_frame_depth {
            let exc = self
                .registry
                .new_exception(&self.registry.system_stack_error, "stack level too deep");
            self.overflow = Some(exc.clone());
            return Err(Signal::Raise(exc));
        }
        self.depth += 1;
        frame.bp = self.stack.len();
        self.block_stack.push(frame.block().cloned());

        let result = self.run_frame(&mut frame);

        self.block_stack.pop();
        self.stack.truncate(frame.bp);
        self.depth -= 1;
        result
    }

    fn run_frame(&mut self, frame: &mut Frame) -> Result<Value, Signal> {
        let iseq = frame.iseq.clone();
        loop {
            let Some(insn) = iseq.instructions.get(frame.pc) else {
                return Ok(Value::Nil);
            };
            frame.current = frame.pc;
            frame.pc += 1;

            match self.step(frame, insn) {
                Ok(Step::Continue) => {}
                Ok(Step::Leave(value)) => return Ok(value),
                Err(signal) => {
                    if let Some(value) = self.unwind(frame, signal)? {
                        return Ok(value);
                    }
                }
            }
        }
    }

    fn step(&mut self, frame: &mut Frame, insn: &Instruction) -> Result<Step, Signal> {
        match insn {
            // Stack
            Instruction::Nop => {}
            Instruction::Pop => {
                self.pop();
            }
            Instruction::Dup => {
                let top = self.peek().clone();
                self.push(top);
            }
            Instruction::PutNil => self.push(Value::Nil),
            Instruction::PutSelf => self.push(frame.self_value.clone()),
            Instruction::PutObject(lit) => self.push(literal(lit)),
            Instruction::PutString(s) => self.push(Value::string(&**s)),
            Instruction::PutSpecialObject(obj) => {
                let value = match obj {
                    SpecialObject::CBase => Value::Class(frame.cref.class.clone()),
                    SpecialObject::Object => Value::Class(self.registry.object.clone()),
                };
                self.push(value);
            }
            Instruction::PutIseq(iseq) => self.push(Value::Iseq(iseq.clone())),
            Instruction::NewArray(n) => {
                let items = self.pop_n(*n);
                self.push(Value::array(items));
            }

            // Variables
            Instruction::GetLocal { index, level } => {
                let value = frame.env.get(*index, *level);
                self.push(value);
            }
            Instruction::SetLocal { index, level } => {
                let value = self.pop();
                frame.env.set(*index, *level, value);
            }
            Instruction::GetInstanceVariable(name) => {
                let value = self.registry.ivar_get(&frame.self_value, name);
                self.push(value);
            }
            Instruction::SetInstanceVariable(name) => {
                let value = self.pop();
                self.registry.ivar_set(&frame.self_value, name, value);
            }
            Instruction::GetConstant(name) => self.op_get_constant(frame, name)?,
            Instruction::SetConstant(name) => {
                let base = self.pop();
                let value = self.pop();
                let namespace = self.namespace(&base)?;
                self.registry.const_set(&namespace, name, value);
            }

            // Definitions
            Instruction::DefineClass { name, iseq, kind } => {
                self.op_define_class(frame, name, iseq, *kind)?
            }
            Instruction::DefineMethod { name, singleton } => {
                self.op_define_method(frame, name, *singleton)?
            }

            // Calls
            Instruction::Send(ci) => self.op_send(frame, ci)?,
            Instruction::InvokeSuper(ci) => self.op_invoke_super(frame, ci)?,
            Instruction::InvokeBlock { argc } => {
                let args = self.pop_n(*argc);
                let block = frame.block().cloned();
                let value = self.yield_to(block.as_ref(), &args)?;
                self.push(value);
            }
            Instruction::CheckMatch => {
                let pattern = self.pop();
                let value = self.pop();
                let matched = self.dispatch(&pattern, "===", &[value], None)?;
                self.push(Value::Bool(matched.is_truthy()));
            }

            // Control
            Instruction::Jump(label) => frame.jump(*label),
            Instruction::BranchIf(label) => {
                if self.pop().is_truthy() {
                    frame.jump(*label);
                }
            }
            Instruction::BranchUnless(label) => {
                if !self.pop().is_truthy() {
                    frame.jump(*label);
                }
            }
            Instruction::Leave => return Ok(Step::Leave(self.pop())),
            Instruction::Throw(kind) => {
                let value = self.pop();
                return Err(match kind {
                    ThrowKind::Return => Signal::Return {
                        target: frame.method_frame,
                        value,
                    },
                    ThrowKind::Break => Signal::Break {
                        target: frame.break_target,
                        value,
                    },
                    ThrowKind::Next => Signal::Next(value),
                    ThrowKind::Redo => Signal::Redo,
                    ThrowKind::Retry => Signal::Retry,
                    ThrowKind::Raise => Signal::Raise(value),
                });
            }
            Instruction::EndEnsure => {
                if let Some((_, signal)) = frame.pending.pop() {
                    return Err(signal);
                }
            }
        }
        Ok(Step::Continue)
    }

    // ===========================================================================
    // Signal Handling
    // ===========================================================================

    /// Search the catch table for an entry covering the faulting instruction.
    ///
    /// Returns `Ok(None)` when execution resumes in this frame and
    /// `Ok(Some(value))` when a `return` ends it.
    fn unwind(&mut self, frame: &mut Frame, mut signal: Signal) -> Result<Option<Value>, Signal> {
        let iseq = frame.iseq.clone();
        let pc = frame.current;

        for entry in &iseq.catch_table {
            let covers = iseq.offset(entry.start) <= pc && pc < iseq.offset(entry.end);
            if !covers || !accepts(frame.id, entry.kind, &signal) {
                continue;
            }
            log::trace!(
                "{} caught by {} entry at {} in {}",
                signal.kind_name(),
                entry.kind,
                pc,
                iseq.name
            );
            self.stack.truncate(frame.bp + entry.sp);
            // Handlers that start after this region are abandoned by the jump.
            let region = iseq.offset(entry.start);
            frame.pending.retain(|(handler, _)| *handler <= region);

            match (entry.kind, signal) {
                (CatchKind::Rescue, Signal::Raise(exc)) => {
                    let Some(handler) = &entry.iseq else {
                        signal = Signal::Raise(exc);
                        continue;
                    };
                    match self.run_rescue(frame, handler, exc) {
                        Ok(value) => self.push(value),
                        Err(next) => {
                            signal = next;
                            continue;
                        }
                    }
                }
                (CatchKind::Ensure, pending) => {
                    frame.pending.push((iseq.offset(entry.cont), pending))
                }
                (CatchKind::Break, Signal::Break { value, .. })
                | (CatchKind::Next, Signal::Next(value)) => self.push(value),
                _ => {}
            }
            frame.jump(entry.cont);
            return Ok(None);
        }

        match signal {
            Signal::Return { target, value } if target == frame.id => Ok(Some(value)),
            other => {
                log::trace!("{} leaves {}", other.kind_name(), iseq.name);
                Err(other)
            }
        }
    }

    /// Run a rescue body with the exception in its first slot.
    fn run_rescue(
        &mut self,
        frame: &Frame,
        handler: &Rc<InstructionSequence>,
        exc: Value,
    ) -> Result<Value, Signal> {
        let env = Env::new(handler.locals.len().max(1), Some(frame.env.clone()));
        env.set(0, 0, exc);

        let id = self.next_frame_id();
        let mut child = Frame::new(
            id,
            handler.clone(),
            env,
            frame.self_value.clone(),
            frame.cref.clone(),
        );
        child.method = frame.method.clone();
        child.method_frame = frame.method_frame;
        child.break_target = frame.break_target;
        self.execute(child)
    }

    // ===========================================================================
    // Stack Operations
    // ===========================================================================

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        debug_assert!(!self.stack.is_empty(), "operand stack underflow");
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }

    fn peek(&self) -> &Value {
        self.stack.last().unwrap_or(&Value::Nil)
    }

    // ===========================================================================
    // Opcode Implementations
    // ===========================================================================

    /// Class or module a constant operation is scoped to.
    fn namespace(&self, base: &Value) -> Result<Rc<RClass>, Signal> {
        match base {
            Value::Class(c) => Ok(c.clone()),
            other => Err(self.registry.error(
                &self.registry.type_error,
                &format!("{} is not a class/module", other.inspect()),
            )),
        }
    }

    fn op_get_constant(&mut self, frame: &Frame, name: &str) -> Result<(), Signal> {
        let base = self.pop();
        let value = match base {
            Value::Nil => self.registry.const_lookup(&frame.cref, name)?,
            other => {
                let namespace = self.namespace(&other)?;
                self.registry.const_get(&namespace, name)?
            }
        };
        self.push(value);
        Ok(())
    }

    fn op_define_class(
        &mut self,
        frame: &Frame,
        name: &str,
        body: &Rc<InstructionSequence>,
        kind: DefineClassKind,
    ) -> Result<(), Signal> {
        let superclass = self.pop();
        let base = self.pop();

        let class = match kind {
            DefineClassKind::Class => {
                let namespace = self.namespace(&base)?;
                let superclass = match superclass {
                    Value::Nil => None,
                    Value::Class(c) if c.kind() == ClassKind::Class => Some(c),
                    other => {
                        return Err(self.registry.error(
                            &self.registry.type_error,
                            &format!("superclass must be a Class ({} given)", other.inspect()),
                        ));
                    }
                };
                self.registry.define_class(name, superclass, &namespace)?
            }
            DefineClassKind::Module => {
                let namespace = self.namespace(&base)?;
                self.registry.define_module(name, &namespace)?
            }
            DefineClassKind::SingletonClass => self.registry.singleton_class_of(&base)?,
        };

        let id = self.next_frame_id();
        let env = Env::new(body.locals.len(), None);
        let cref = frame.cref.push(class.clone());
        let child = Frame::new(id, body.clone(), env, Value::Class(class), cref);
        let value = self.execute(child)?;
        self.push(value);
        Ok(())
    }

    fn op_define_method(&mut self, frame: &Frame, name: &str, singleton: bool) -> Result<(), Signal> {
        let Value::Iseq(iseq) = self.pop() else {
            return Err(self
                .registry
                .error(&self.registry.type_error, "method body is not an instruction sequence"));
        };
        let base = self.pop();
        let method = Method::new(
            name,
            MethodBody::Iseq {
                iseq,
                cref: frame.cref.clone(),
            },
        );

        if singleton {
            return self.registry.define_singleton_method(&base, method);
        }
        let class = self.namespace(&base)?;
        self.registry.define_method(&class, method);
        Ok(())
    }

    /// Pop the arguments of a call site and resolve its block.
    fn pop_call(&mut self, frame: &Frame, ci: &CallInfo) -> (Value, Vec<Value>, Option<Value>) {
        let block_arg = if ci.flags.blockarg {
            Some(self.pop())
        } else {
            None
        };
        let args = self.pop_n(ci.argc);
        let receiver = self.pop();

        let block = match (&ci.block, block_arg) {
            (Some(iseq), _) => Some(self.make_proc(frame, iseq)),
            (None, Some(Value::Nil)) | (None, None) => None,
            (None, Some(value)) => Some(value),
        };
        (receiver, args, block)
    }

    fn op_send(&mut self, frame: &Frame, ci: &CallInfo) -> Result<(), Signal> {
        let (receiver, args, block) = self.pop_call(frame, ci);
        let value = self.dispatch(&receiver, &ci.name, &args, block.as_ref())?;
        self.push(value);
        Ok(())
    }

    fn op_invoke_super(&mut self, frame: &Frame, ci: &CallInfo) -> Result<(), Signal> {
        let (receiver, args, block) = self.pop_call(frame, ci);
        let Some(method) = frame.method.clone() else {
            return Err(self
                .registry
                .error(&self.registry.runtime_error, "super called outside of method"));
        };
        let args = if ci.flags.zsuper {
            method.args.clone()
        } else {
            args
        };
        let block = block.or_else(|| method.block.clone());
        let value = self.call_super(&receiver, &method.holder, &method.name, &args, block.as_ref())?;
        self.push(value);
        Ok(())
    }

    /// Capture a block literal with the current activation's context.
    fn make_proc(&self, frame: &Frame, iseq: &Rc<InstructionSequence>) -> Value {
        Value::Proc(Rc::new(Proc {
            iseq: iseq.clone(),
            env: frame.env.clone(),
            self_value: frame.self_value.clone(),
            cref: frame.cref.clone(),
            method: frame.method.clone(),
            method_frame: frame.method_frame,
            home: frame.id,
        }))
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new(VmConfig::default())
    }
}

fn literal(lit: &Literal) -> Value {
    match lit {
        Literal::Integer(n) => Value::Integer(*n),
        Literal::Float(n) => Value::Float(*n),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Symbol(s) => Value::Symbol(s.clone()),
    }
}

/// Whether a catch entry of `kind` in activation `frame` handles `signal`.
fn accepts(frame: FrameId, kind: CatchKind, signal: &Signal) -> bool {
    match (kind, signal) {
        (CatchKind::Rescue, Signal::Raise(_)) => true,
        (CatchKind::Ensure, _) => true,
        (CatchKind::Retry, Signal::Retry) => true,
        (CatchKind::Next, Signal::Next(_)) | (CatchKind::Redo, Signal::Redo) => true,
        (CatchKind::Break, Signal::Break { target, .. }) => *target == frame,
        _ => false,
    }
}
