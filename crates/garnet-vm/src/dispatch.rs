//! Method dispatch, block invocation and argument binding.

use std::rc::Rc;

use garnet_bytecode::InstructionSequence;

use crate::class::{Method, MethodBody, RClass};
use crate::frame::{Cref, Env, Frame, MethodContext};
use crate::object::{Proc, Value};
use crate::signal::Signal;
use crate::vm::VM;

impl VM {
    /// Send `name` to `receiver`. A missing method is re-sent as
    /// `method_missing` with the selector prepended.
    pub fn dispatch(
        &mut self,
        receiver: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Value>,
    ) -> Result<Value, Signal> {
        let class = self.registry.class_of(receiver);
        match self.registry.find_method(&class, name) {
            Some((method, holder)) => self.invoke(receiver, &method, &holder, args, block),
            None => self.method_missing(&class, receiver, name, args, block),
        }
    }

    /// Call the definition of `name` strictly above `holder`.
    pub fn call_super(
        &mut self,
        receiver: &Value,
        holder: &Rc<RClass>,
        name: &str,
        args: &[Value],
        block: Option<&Value>,
    ) -> Result<Value, Signal> {
        match self.registry.find_super_method(holder, name) {
            Some((method, found)) => self.invoke(receiver, &method, &found, args, block),
            None => {
                let class = self.registry.class_of(receiver);
                self.method_missing(&class, receiver, name, args, block)
            }
        }
    }

    fn method_missing(
        &mut self,
        class: &Rc<RClass>,
        receiver: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Value>,
    ) -> Result<Value, Signal> {
        let Some((method, holder)) = self.registry.find_method(class, "method_missing") else {
            return Err(self.registry.no_method_error(receiver, name));
        };
        let mut forwarded = Vec::with_capacity(args.len() + 1);
        forwarded.push(Value::symbol(name));
        forwarded.extend_from_slice(args);
        self.invoke(receiver, &method, &holder, &forwarded, block)
    }

    /// Run a resolved method after checking its arity.
    pub fn invoke(
        &mut self,
        receiver: &Value,
        method: &Rc<Method>,
        holder: &Rc<RClass>,
        args: &[Value],
        block: Option<&Value>,
    ) -> Result<Value, Signal> {
        let arity = method.arity();
        if !arity.accepts(args.len()) {
            return Err(self.registry.arity_error(args.len(), arity));
        }

        match &method.body {
            MethodBody::Native { func, .. } => func(self, receiver, args, block),
            MethodBody::Iseq { iseq, cref } => {
                let context = MethodContext {
                    name: method.name.clone(),
                    holder: holder.clone(),
                    args: args.to_vec(),
                    block: block.cloned(),
                };
                self.invoke_iseq(receiver, iseq, cref, context)
            }
            MethodBody::AttrReader(ivar) => Ok(self.registry.ivar_get(receiver, ivar)),
            MethodBody::AttrWriter(ivar) => {
                let value = args[0].clone();
                self.registry.ivar_set(receiver, ivar, value.clone());
                Ok(value)
            }
        }
    }

    fn invoke_iseq(
        &mut self,
        receiver: &Value,
        iseq: &Rc<InstructionSequence>,
        cref: &Rc<Cref>,
        context: MethodContext,
    ) -> Result<Value, Signal> {
        let env = Env::new(iseq.locals.len(), None);
        let start = bind_method_args(iseq, &env, &context.args, context.block.as_ref());

        let id = self.next_frame_id();
        let mut frame = Frame::new(id, iseq.clone(), env, receiver.clone(), cref.clone());
        frame.method = Some(Rc::new(context));
        frame.pc = start;
        self.execute(frame)
    }

    /// Run a block with lenient argument binding.
    pub fn call_block(&mut self, block: &Rc<Proc>, args: &[Value]) -> Result<Value, Signal> {
        let iseq = &block.iseq;
        let env = Env::new(iseq.locals.len(), Some(block.env.clone()));
        let start = bind_block_args(iseq, &env, args);

        let id = self.next_frame_id();
        let mut frame = Frame::new(
            id,
            iseq.clone(),
            env,
            block.self_value.clone(),
            block.cref.clone(),
        );
        frame.method = block.method.clone();
        frame.method_frame = block.method_frame;
        frame.break_target = block.home;
        frame.pc = start;
        self.execute(frame)
    }

    /// Call a block value, rejecting anything that is not a proc.
    pub fn yield_to(&mut self, block: Option<&Value>, args: &[Value]) -> Result<Value, Signal> {
        match block {
            Some(Value::Proc(p)) => {
                let p = p.clone();
                self.call_block(&p, args)
            }
            Some(other) => {
                let message = format!(
                    "wrong argument type {} (expected Proc)",
                    self.registry.real_class_of(other).display_name()
                );
                Err(self.registry.error(&self.registry.type_error, &message))
            }
            None => Err(self
                .registry
                .error(&self.registry.local_jump_error, "no block given (yield)")),
        }
    }
}

/// Offset execution starts at: past the defaults of supplied optionals.
fn start_offset(iseq: &InstructionSequence, given: usize) -> usize {
    let args = &iseq.args;
    if args.opt_labels.is_empty() {
        return 0;
    }
    let supplied = given.saturating_sub(args.required).min(args.optional);
    iseq.offset(args.opt_labels[supplied])
}

/// Bind arguments whose count was already checked against the arity.
fn bind_method_args(
    iseq: &InstructionSequence,
    env: &Rc<Env>,
    args: &[Value],
    block: Option<&Value>,
) -> usize {
    let desc = &iseq.args;
    for (slot, value) in args.iter().take(desc.positional()).enumerate() {
        env.set(slot, 0, value.clone());
    }
    if let Some(rest) = desc.rest {
        let extra = args.get(desc.positional()..).unwrap_or_default();
        env.set(rest, 0, Value::array(extra.to_vec()));
    }
    if let Some(slot) = desc.block {
        env.set(slot, 0, block.cloned().unwrap_or(Value::Nil));
    }
    start_offset(iseq, args.len())
}

/// Block arguments: missing ones are nil, extras are dropped, and a single
/// array is spread over several parameters.
fn bind_block_args(iseq: &InstructionSequence, env: &Rc<Env>, args: &[Value]) -> usize {
    let desc = &iseq.args;
    let spreads = desc.positional() > 1 || (desc.rest.is_some() && desc.positional() >= 1);
    let spread;
    let args = match args {
        [Value::Array(items)] if spreads => {
            spread = items.borrow().clone();
            spread.as_slice()
        }
        _ => args,
    };

    for slot in 0..desc.positional() {
        env.set(slot, 0, args.get(slot).cloned().unwrap_or(Value::Nil));
    }
    if let Some(rest) = desc.rest {
        let extra = args.get(desc.positional()..).unwrap_or_default();
        env.set(rest, 0, Value::array(extra.to_vec()));
    }
    if let Some(slot) = desc.block {
        env.set(slot, 0, Value::Nil);
    }
    start_offset(iseq, args.len())
}
