//! Built-in methods for Garnet's core classes.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::class::{Arity, Method, MethodBody, NativeFn, RClass};
use crate::object::{RObject, Value};
use crate::registry::Registry;
use crate::signal::Signal;
use crate::vm::VM;

fn define(class: &Rc<RClass>, name: &str, arity: Arity, func: NativeFn) {
    class.add_method(Method::new(name, MethodBody::Native { func, arity }));
}

/// Install the native methods of every core class.
pub fn install(r: &Registry) {
    install_basic_object(r);
    install_kernel(r);
    install_module(r);
    install_class(r);
    install_numeric(r);
    install_string(r);
    install_symbol(r);
    install_array(r);
    install_nil_and_booleans(r);
    install_proc(r);
    install_exception(r);
}

/// `to_s` and `inspect` of the top-level self.
pub fn install_main(singleton: &Rc<RClass>) {
    define(singleton, "to_s", Arity::exact(0), |_, _, _, _| {
        Ok(Value::string("main"))
    });
    define(singleton, "inspect", Arity::exact(0), |_, _, _, _| {
        Ok(Value::string("main"))
    });
}

// ===========================================================================
// Helpers
// ===========================================================================

fn type_error(vm: &VM, message: &str) -> Signal {
    vm.registry.error(&vm.registry.type_error, message)
}

fn argument_error(vm: &VM, message: &str) -> Signal {
    vm.registry.error(&vm.registry.argument_error, message)
}

fn class_name(vm: &VM, value: &Value) -> String {
    vm.registry.real_class_of(value).display_name()
}

/// Method or ivar name given as a symbol or string.
fn name_arg(vm: &VM, value: &Value) -> Result<Rc<str>, Signal> {
    match value {
        Value::Symbol(s) | Value::String(s) => Ok(s.clone()),
        other => Err(type_error(
            vm,
            &format!("{} is not a symbol nor a string", other.inspect()),
        )),
    }
}

fn class_arg(vm: &VM, value: &Value) -> Result<Rc<RClass>, Signal> {
    match value {
        Value::Class(c) => Ok(c.clone()),
        _ => Err(type_error(vm, "class or module required")),
    }
}

/// `to_s` of a value, through dispatch for anything but strings.
fn stringify(vm: &mut VM, value: &Value) -> Result<String, Signal> {
    if let Value::String(s) = value {
        return Ok(s.to_string());
    }
    let result = vm.dispatch(value, "to_s", &[], None)?;
    Ok(match result {
        Value::String(s) => s.to_string(),
        other => other.to_string(),
    })
}

/// `inspect` of a value, through dispatch.
fn inspect(vm: &mut VM, value: &Value) -> Result<String, Signal> {
    let result = vm.dispatch(value, "inspect", &[], None)?;
    Ok(match result {
        Value::String(s) => s.to_string(),
        other => other.to_string(),
    })
}

/// Equality through dispatch, short-circuiting identical values.
fn equal(vm: &mut VM, a: &Value, b: &Value) -> Result<bool, Signal> {
    if a.same(b) {
        return Ok(true);
    }
    Ok(vm.dispatch(a, "==", &[b.clone()], None)?.is_truthy())
}

fn array_item(items: &Value, index: usize) -> Option<Value> {
    match items {
        Value::Array(items) => items.borrow().get(index).cloned(),
        _ => None,
    }
}

/// Render each element of an array with `render`.
fn render_items(
    vm: &mut VM,
    items: &Value,
    render: fn(&mut VM, &Value) -> Result<String, Signal>,
) -> Result<Vec<String>, Signal> {
    let mut parts = Vec::with_capacity(array_len(items));
    let mut index = 0;
    while let Some(item) = array_item(items, index) {
        parts.push(render(vm, &item)?);
        index += 1;
    }
    Ok(parts)
}

fn array_len(items: &Value) -> usize {
    match items {
        Value::Array(items) => items.borrow().len(),
        _ => 0,
    }
}

// ===========================================================================
// BasicObject and Kernel
// ===========================================================================

fn install_basic_object(r: &Registry) {
    let c = &r.basic_object;

    // initialize - default constructor takes no arguments
    define(c, "initialize", Arity::exact(0), |_, _, _, _| Ok(Value::Nil));

    // method_missing - raise NoMethodError for the selector
    define(c, "method_missing", Arity::at_least(1), |vm, recv, args, _| {
        let name = name_arg(vm, &args[0])?;
        Err(vm.registry.no_method_error(recv, &name))
    });

    define(c, "==", Arity::exact(1), |_, recv, args, _| {
        Ok(Value::Bool(recv.same(&args[0])))
    });
    define(c, "!", Arity::exact(0), |_, recv, _, _| {
        Ok(Value::Bool(!recv.is_truthy()))
    });
}

fn send(vm: &mut VM, recv: &Value, args: &[Value], block: Option<&Value>) -> Result<Value, Signal> {
    let name = name_arg(vm, &args[0])?;
    vm.dispatch(recv, &name, &args[1..], block)
}

fn write_puts(vm: &mut VM, value: &Value) -> Result<(), Signal> {
    if let Value::Array(_) = value {
        if !vm.enter_rendering(value) {
            vm.write_output("[...]\n");
            return Ok(());
        }
        let mut result = Ok(());
        let mut index = 0;
        while let Some(item) = array_item(value, index) {
            result = write_puts(vm, &item);
            if result.is_err() {
                break;
            }
            index += 1;
        }
        vm.leave_rendering();
        return result;
    }
    let mut text = stringify(vm, value)?;
    if !text.ends_with('\n') {
        text.push('\n');
    }
    vm.write_output(&text);
    Ok(())
}

fn install_kernel(r: &Registry) {
    let k = &r.kernel;

    // puts - write each argument's to_s on its own line, flattening arrays
    define(k, "puts", Arity::at_least(0), |vm, _, args, _| {
        if args.is_empty() {
            vm.write_output("\n");
        }
        for arg in args {
            write_puts(vm, arg)?;
        }
        Ok(Value::Nil)
    });

    // p - write each argument's inspect, returning the arguments
    define(k, "p", Arity::at_least(0), |vm, _, args, _| {
        for arg in args {
            let mut text = inspect(vm, arg)?;
            text.push('\n');
            vm.write_output(&text);
        }
        Ok(match args {
            [] => Value::Nil,
            [one] => one.clone(),
            many => Value::array(many.to_vec()),
        })
    });

    // raise - raise a message, an exception class, or an exception object
    define(k, "raise", Arity::range(0, 2), |vm, _, args, _| {
        let exc = match args {
            [] => vm
                .registry
                .new_exception(&vm.registry.runtime_error, "unhandled exception"),
            [Value::String(message)] => vm
                .registry
                .new_exception(&vm.registry.runtime_error, message),
            [Value::Class(class), rest @ ..] => {
                let class = Value::Class(class.clone());
                vm.dispatch(&class, "new", rest, None)?
            }
            [exc] => exc.clone(),
            _ => return Err(type_error(vm, "exception class/object expected")),
        };
        if !vm.registry.is_a(&exc, &vm.registry.exception) {
            return Err(type_error(vm, "exception object expected"));
        }
        Err(Signal::Raise(exc))
    });

    define(k, "class", Arity::exact(0), |vm, recv, _, _| {
        Ok(Value::Class(vm.registry.real_class_of(recv)))
    });
    define(k, "singleton_class", Arity::exact(0), |vm, recv, _, _| {
        Ok(Value::Class(vm.registry.singleton_class_of(recv)?))
    });

    define(k, "is_a?", Arity::exact(1), |vm, recv, args, _| {
        let class = class_arg(vm, &args[0])?;
        Ok(Value::Bool(vm.registry.is_a(recv, &class)))
    });

    define(k, "block_given?", Arity::exact(0), |vm, _, _, _| {
        Ok(Value::Bool(vm.current_block().is_some()))
    });

    define(k, "proc", Arity::exact(0), |vm, _, _, block| {
        block
            .cloned()
            .ok_or_else(|| argument_error(vm, "tried to create Proc object without a block"))
    });

    // loop - call the block until something breaks out of it
    define(k, "loop", Arity::exact(0), |vm, _, _, block| loop {
        vm.yield_to(block, &[])?;
    });

    define(k, "to_s", Arity::exact(0), |vm, recv, _, _| {
        Ok(Value::string(format!("#<{}>", class_name(vm, recv))))
    });

    // inspect - class name plus instance variables, sorted by name
    define(k, "inspect", Arity::exact(0), |vm, recv, _, _| {
        let Value::Object(o) = recv else {
            return Ok(Value::string(recv.inspect()));
        };
        let mut ivars: Vec<(Rc<str>, Value)> = o
            .ivars
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ivars.sort_by(|a, b| a.0.cmp(&b.0));
        let mut parts = Vec::with_capacity(ivars.len());
        for (name, value) in &ivars {
            parts.push(format!("{}={}", name, inspect(vm, value)?));
        }
        let class = class_name(vm, recv);
        Ok(Value::string(if parts.is_empty() {
            format!("#<{}>", class)
        } else {
            format!("#<{} {}>", class, parts.join(", "))
        }))
    });

    define(k, "===", Arity::exact(1), |vm, recv, args, _| {
        Ok(Value::Bool(equal(vm, recv, &args[0])?))
    });

    define(k, "respond_to?", Arity::exact(1), |vm, recv, args, _| {
        let name = name_arg(vm, &args[0])?;
        let class = vm.registry.class_of(recv);
        Ok(Value::Bool(vm.registry.find_method(&class, &name).is_some()))
    });

    define(k, "send", Arity::at_least(1), send);
}

// ===========================================================================
// Module and Class
// ===========================================================================

fn attr(vm: &mut VM, recv: &Value, args: &[Value], reader: bool, writer: bool) -> Result<Value, Signal> {
    let class = class_arg(vm, recv)?;
    for arg in args {
        let name = name_arg(vm, arg)?;
        let ivar: Rc<str> = format!("@{}", name).into();
        if reader {
            let method = Method::new(&name, MethodBody::AttrReader(ivar.clone()));
            vm.registry.define_method(&class, method);
        }
        if writer {
            let method = Method::new(&format!("{}=", name), MethodBody::AttrWriter(ivar));
            vm.registry.define_method(&class, method);
        }
    }
    Ok(Value::Nil)
}

fn install_module(r: &Registry) {
    let m = &r.module;

    // include - splice modules into the receiver's chain, first argument
    // nearest the receiver
    define(m, "include", Arity::at_least(1), |vm, recv, args, _| {
        let class = class_arg(vm, recv)?;
        for arg in args.iter().rev() {
            let module = class_arg(vm, arg)?;
            vm.registry.include_module(&class, &module)?;
        }
        Ok(recv.clone())
    });

    define(m, "ancestors", Arity::exact(0), |vm, recv, _, _| {
        let class = class_arg(vm, recv)?;
        let ancestors = vm.registry.ancestors(&class);
        Ok(Value::array(ancestors.into_iter().map(Value::Class).collect()))
    });

    define(m, "name", Arity::exact(0), |vm, recv, _, _| {
        let class = class_arg(vm, recv)?;
        Ok(class.name().map(Value::String).unwrap_or(Value::Nil))
    });

    fn to_s(vm: &mut VM, recv: &Value, _: &[Value], _: Option<&Value>) -> Result<Value, Signal> {
        let class = class_arg(vm, recv)?;
        Ok(Value::string(class.display_name()))
    }
    define(m, "to_s", Arity::exact(0), to_s);
    define(m, "inspect", Arity::exact(0), to_s);

    define(m, "===", Arity::exact(1), |vm, recv, args, _| {
        let class = class_arg(vm, recv)?;
        Ok(Value::Bool(vm.registry.is_a(&args[0], &class)))
    });

    define(m, "attr_reader", Arity::at_least(0), |vm, recv, args, _| {
        attr(vm, recv, args, true, false)
    });
    define(m, "attr_writer", Arity::at_least(0), |vm, recv, args, _| {
        attr(vm, recv, args, false, true)
    });
    define(m, "attr_accessor", Arity::at_least(0), |vm, recv, args, _| {
        attr(vm, recv, args, true, true)
    });
}

fn install_class(r: &Registry) {
    let c = &r.class;

    // new - allocate and run initialize; Class.new and Module.new build
    // anonymous classes
    define(c, "new", Arity::at_least(0), |vm, recv, args, block| {
        let class = class_arg(vm, recv)?;
        let registry = &vm.registry;

        if Rc::ptr_eq(&class, &registry.class) {
            let superclass = match args {
                [] => None,
                [Value::Class(s)] if !s.is_module() => Some(s.clone()),
                [_] => return Err(type_error(vm, "superclass must be a Class")),
                _ => return Err(vm.registry.arity_error(args.len(), Arity::range(0, 1))),
            };
            return Ok(Value::Class(vm.registry.new_class(superclass)));
        }
        if Rc::ptr_eq(&class, &registry.module) {
            let module = RClass::new(crate::class::ClassKind::Module, None, None);
            module.set_klass(registry.module.clone(), false);
            return Ok(Value::Class(module));
        }
        if registry.inherits(&class, &registry.string) {
            return Ok(match args.first() {
                Some(Value::String(s)) => Value::String(s.clone()),
                _ => Value::string(""),
            });
        }
        if registry.inherits(&class, &registry.array) {
            return Ok(Value::array(Vec::new()));
        }
        let immediates = [
            &registry.integer,
            &registry.float,
            &registry.symbol,
            &registry.nil_class,
            &registry.true_class,
            &registry.false_class,
            &registry.proc_class,
        ];
        if immediates.iter().any(|c| registry.inherits(&class, c)) {
            let message = format!("allocator undefined for {}", class.display_name());
            return Err(type_error(vm, &message));
        }

        let object = Value::Object(Rc::new(RObject::new(class)));
        vm.dispatch(&object, "initialize", args, block)?;
        Ok(object)
    });

    define(c, "superclass", Arity::exact(0), |vm, recv, _, _| {
        let class = class_arg(vm, recv)?;
        Ok(class.real_superclass().map(Value::Class).unwrap_or(Value::Nil))
    });
}

// ===========================================================================
// Numbers
// ===========================================================================

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

fn int_arith(vm: &VM, a: i64, b: i64, op: Arith) -> Result<Value, Signal> {
    let result = match op {
        Arith::Add => a.checked_add(b),
        Arith::Sub => a.checked_sub(b),
        Arith::Mul => a.checked_mul(b),
        Arith::Div | Arith::Mod if b == 0 => {
            return Err(vm
                .registry
                .error(&vm.registry.zero_division_error, "divided by 0"));
        }
        // Division floors and the remainder takes the divisor's sign.
        Arith::Div => a
            .checked_div(b)
            .map(|q| if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }),
        Arith::Mod => a
            .checked_rem(b)
            .map(|m| if m != 0 && (m < 0) != (b < 0) { m + b } else { m }),
    };
    result
        .map(Value::Integer)
        .ok_or_else(|| vm.registry.error(&vm.registry.range_error, "integer overflow"))
}

fn arith(vm: &VM, recv: &Value, arg: &Value, op: Arith) -> Result<Value, Signal> {
    match (recv, arg) {
        (Value::Integer(a), Value::Integer(b)) => int_arith(vm, *a, *b, op),
        _ => Err(type_error(
            vm,
            &format!(
                "{} can't be coerced into {}",
                class_name(vm, arg),
                class_name(vm, recv)
            ),
        )),
    }
}

fn compare(vm: &VM, recv: &Value, arg: &Value, test: fn(Ordering) -> bool) -> Result<Value, Signal> {
    match (recv, arg) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Value::Bool(test(a.cmp(b)))),
        _ => Err(argument_error(
            vm,
            &format!(
                "comparison of {} with {} failed",
                class_name(vm, recv),
                arg.inspect()
            ),
        )),
    }
}

fn install_numeric(r: &Registry) {
    let int = &r.integer;
    define(int, "+", Arity::exact(1), |vm, recv, args, _| {
        arith(vm, recv, &args[0], Arith::Add)
    });
    define(int, "-", Arity::exact(1), |vm, recv, args, _| {
        arith(vm, recv, &args[0], Arith::Sub)
    });
    define(int, "*", Arity::exact(1), |vm, recv, args, _| {
        arith(vm, recv, &args[0], Arith::Mul)
    });
    define(int, "/", Arity::exact(1), |vm, recv, args, _| {
        arith(vm, recv, &args[0], Arith::Div)
    });
    define(int, "%", Arity::exact(1), |vm, recv, args, _| {
        arith(vm, recv, &args[0], Arith::Mod)
    });

    define(int, "<", Arity::exact(1), |vm, recv, args, _| {
        compare(vm, recv, &args[0], Ordering::is_lt)
    });
    define(int, ">", Arity::exact(1), |vm, recv, args, _| {
        compare(vm, recv, &args[0], Ordering::is_gt)
    });
    define(int, "<=", Arity::exact(1), |vm, recv, args, _| {
        compare(vm, recv, &args[0], Ordering::is_le)
    });
    define(int, ">=", Arity::exact(1), |vm, recv, args, _| {
        compare(vm, recv, &args[0], Ordering::is_ge)
    });
    define(int, "==", Arity::exact(1), |_, recv, args, _| {
        Ok(Value::Bool(recv == &args[0]))
    });

    // times - yield 0...n, returning the receiver
    define(int, "times", Arity::exact(0), |vm, recv, _, block| {
        let Value::Integer(n) = recv else {
            return Ok(recv.clone());
        };
        for i in 0..*n {
            vm.yield_to(block, &[Value::Integer(i)])?;
        }
        Ok(recv.clone())
    });

    // Floats are literals only; they render but do no arithmetic.
    for c in [&r.integer, &r.float] {
        fn to_s(_: &mut VM, recv: &Value, _: &[Value], _: Option<&Value>) -> Result<Value, Signal> {
            Ok(Value::string(recv.to_string()))
        }
        define(c, "to_s", Arity::exact(0), to_s);
        define(c, "inspect", Arity::exact(0), to_s);
    }
}

// ===========================================================================
// Strings and Symbols
// ===========================================================================

fn string_of(value: &Value) -> &str {
    match value {
        Value::String(s) | Value::Symbol(s) => s,
        _ => "",
    }
}

fn install_string(r: &Registry) {
    let s = &r.string;

    define(s, "+", Arity::exact(1), |vm, recv, args, _| match &args[0] {
        Value::String(other) => Ok(Value::string(format!("{}{}", string_of(recv), other))),
        other => Err(type_error(
            vm,
            &format!("no implicit conversion of {} into String", class_name(vm, other)),
        )),
    });
    define(s, "*", Arity::exact(1), |vm, recv, args, _| match &args[0] {
        Value::Integer(n) if *n >= 0 => Ok(Value::string(string_of(recv).repeat(*n as usize))),
        _ => Err(argument_error(vm, "negative argument")),
    });
    define(s, "==", Arity::exact(1), |_, recv, args, _| {
        Ok(Value::Bool(matches!(&args[0], Value::String(_)) && recv == &args[0]))
    });

    fn size(_: &mut VM, recv: &Value, _: &[Value], _: Option<&Value>) -> Result<Value, Signal> {
        Ok(Value::Integer(string_of(recv).chars().count() as i64))
    }
    define(s, "size", Arity::exact(0), size);
    define(s, "length", Arity::exact(0), size);

    define(s, "to_s", Arity::exact(0), |_, recv, _, _| Ok(recv.clone()));
    define(s, "inspect", Arity::exact(0), |_, recv, _, _| {
        Ok(Value::string(recv.inspect()))
    });
}

fn install_symbol(r: &Registry) {
    let s = &r.symbol;
    define(s, "to_s", Arity::exact(0), |_, recv, _, _| {
        Ok(Value::string(string_of(recv)))
    });
    define(s, "inspect", Arity::exact(0), |_, recv, _, _| {
        Ok(Value::string(recv.inspect()))
    });
}

// ===========================================================================
// Arrays
// ===========================================================================

fn install_array(r: &Registry) {
    let a = &r.array;

    // each - yield every element; elements pushed during iteration are seen
    define(a, "each", Arity::exact(0), |vm, recv, _, block| {
        let mut index = 0;
        while let Some(item) = array_item(recv, index) {
            vm.yield_to(block, &[item])?;
            index += 1;
        }
        Ok(recv.clone())
    });
    define(a, "map", Arity::exact(0), |vm, recv, _, block| {
        let mut out = Vec::with_capacity(array_len(recv));
        let mut index = 0;
        while let Some(item) = array_item(recv, index) {
            out.push(vm.yield_to(block, &[item])?);
            index += 1;
        }
        Ok(Value::array(out))
    });

    fn push(_: &mut VM, recv: &Value, args: &[Value], _: Option<&Value>) -> Result<Value, Signal> {
        if let Value::Array(items) = recv {
            items.borrow_mut().extend_from_slice(args);
        }
        Ok(recv.clone())
    }
    define(a, "push", Arity::at_least(0), push);
    define(a, "<<", Arity::exact(1), push);

    define(a, "pop", Arity::exact(0), |_, recv, _, _| {
        let Value::Array(items) = recv else {
            return Ok(Value::Nil);
        };
        Ok(items.borrow_mut().pop().unwrap_or(Value::Nil))
    });

    fn size(_: &mut VM, recv: &Value, _: &[Value], _: Option<&Value>) -> Result<Value, Signal> {
        Ok(Value::Integer(array_len(recv) as i64))
    }
    define(a, "size", Arity::exact(0), size);
    define(a, "length", Arity::exact(0), size);

    define(a, "[]", Arity::exact(1), |vm, recv, args, _| {
        let Value::Integer(index) = args[0] else {
            return Err(type_error(
                vm,
                &format!("no implicit conversion of {} into Integer", class_name(vm, &args[0])),
            ));
        };
        let len = array_len(recv) as i64;
        let index = if index < 0 { index + len } else { index };
        if index < 0 {
            return Ok(Value::Nil);
        }
        Ok(array_item(recv, index as usize).unwrap_or(Value::Nil))
    });
    define(a, "==", Arity::exact(1), |_, recv, args, _| {
        Ok(Value::Bool(matches!(&args[0], Value::Array(_)) && recv == &args[0]))
    });

    define(a, "join", Arity::range(0, 1), |vm, recv, args, _| {
        let separator = args.first().map(string_of).unwrap_or("").to_string();
        if !vm.enter_rendering(recv) {
            return Err(argument_error(vm, "recursive array join"));
        }
        let parts = render_items(vm, recv, stringify);
        vm.leave_rendering();
        Ok(Value::string(parts?.join(&separator)))
    });

    fn inspect_array(vm: &mut VM, recv: &Value, _: &[Value], _: Option<&Value>) -> Result<Value, Signal> {
        if !vm.enter_rendering(recv) {
            return Ok(Value::string("[...]"));
        }
        let parts = render_items(vm, recv, inspect);
        vm.leave_rendering();
        Ok(Value::string(format!("[{}]", parts?.join(", "))))
    }
    define(a, "inspect", Arity::exact(0), inspect_array);
    define(a, "to_s", Arity::exact(0), inspect_array);
}

// ===========================================================================
// Nil, booleans and procs
// ===========================================================================

fn install_nil_and_booleans(r: &Registry) {
    let n = &r.nil_class;
    define(n, "to_s", Arity::exact(0), |_, _, _, _| Ok(Value::string("")));
    define(n, "inspect", Arity::exact(0), |_, _, _, _| Ok(Value::string("nil")));

    for c in [&r.true_class, &r.false_class] {
        fn to_s(_: &mut VM, recv: &Value, _: &[Value], _: Option<&Value>) -> Result<Value, Signal> {
            Ok(Value::string(recv.to_string()))
        }
        define(c, "to_s", Arity::exact(0), to_s);
        define(c, "inspect", Arity::exact(0), to_s);
    }
}

fn install_proc(r: &Registry) {
    define(&r.proc_class, "call", Arity::at_least(0), |vm, recv, args, _| {
        vm.yield_to(Some(recv), args)
    });
}

// ===========================================================================
// Exceptions
// ===========================================================================

fn install_exception(r: &Registry) {
    let e = &r.exception;

    define(e, "initialize", Arity::range(0, 1), |vm, recv, args, _| {
        let message = args.first().cloned().unwrap_or(Value::Nil);
        vm.registry.ivar_set(recv, "@message", message);
        Ok(Value::Nil)
    });

    // to_s - the message, or the class name when none was given
    define(e, "to_s", Arity::exact(0), |vm, recv, _, _| {
        let message = vm.registry.ivar_get(recv, "@message");
        if message.is_nil() {
            return Ok(Value::string(class_name(vm, recv)));
        }
        Ok(Value::string(stringify(vm, &message)?))
    });
    define(e, "message", Arity::exact(0), |vm, recv, _, _| {
        vm.dispatch(recv, "to_s", &[], None)
    });
    define(e, "inspect", Arity::exact(0), |vm, recv, _, _| {
        let class = class_name(vm, recv);
        let message = stringify(vm, recv)?;
        Ok(Value::string(if message.is_empty() || message == class {
            class
        } else {
            format!("#<{}: {}>", class, message)
        }))
    });

    define(&r.name_error, "name", Arity::exact(0), |vm, recv, _, _| {
        Ok(vm.registry.ivar_get(recv, "@name"))
    });
    define(&r.no_method_error, "receiver", Arity::exact(0), |vm, recv, _, _| {
        Ok(vm.registry.ivar_get(recv, "@receiver"))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmConfig;
    use garnet_ast::build::*;
    use garnet_ast::{Node, Params};

    fn eval(program: Node) -> (Result<Value, String>, String) {
        let iseq = garnet_compiler::compile(&program).unwrap();
        let mut vm = VM::new(VmConfig::default());
        let result = vm.run(iseq).map_err(|e| e.to_string());
        (result, vm.take_output())
    }

    fn value(program: Node) -> Value {
        eval(program).0.unwrap()
    }

    fn error(program: Node) -> String {
        eval(program).0.unwrap_err()
    }

    #[test]
    fn test_builtins_exist() {
        let r = Registry::new();
        install(&r);
        for (class, name) in [
            (&r.kernel, "puts"),
            (&r.kernel, "raise"),
            (&r.module, "include"),
            (&r.class, "new"),
            (&r.integer, "times"),
            (&r.array, "each"),
            (&r.exception, "message"),
        ] {
            assert!(class.lookup_method(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn test_self_containing_array() {
        let setup = || {
            vec![
                lasgn("a", array(vec![int(1)])),
                call(vcall("a"), "<<", vec![vcall("a")]),
            ]
        };
        let mut program = setup();
        program.push(call(vcall("a"), "inspect", vec![]));
        assert_eq!(value(body(program)), Value::string("[1, [...]]"));

        let mut program = setup();
        program.push(fcall("p", vec![vcall("a")]));
        assert_eq!(eval(body(program)).1, "[1, [...]]\n");

        let mut program = setup();
        program.push(fcall("puts", vec![vcall("a")]));
        assert_eq!(eval(body(program)).1, "1\n[...]\n");

        let mut program = setup();
        program.push(call(vcall("a"), "join", vec![string(",")]));
        assert_eq!(
            error(body(program)),
            "uncaught ArgumentError: recursive array join"
        );

        let mut program = setup();
        program.push(call(vcall("a"), "==", vec![vcall("a")]));
        assert_eq!(value(body(program)), Value::Bool(true));
    }

    #[test]
    fn test_integer_division_floors() {
        let program = array(vec![
            call(int(-7), "/", vec![int(2)]),
            call(int(-7), "%", vec![int(2)]),
            call(int(7), "%", vec![int(-2)]),
        ]);
        assert_eq!(
            value(program),
            Value::array(vec![Value::Integer(-4), Value::Integer(1), Value::Integer(-1)])
        );
    }

    #[test]
    fn test_float_operand_is_not_coerced() {
        assert_eq!(
            error(call(int(7), "/", vec![float(2.0)])),
            "uncaught TypeError: Float can't be coerced into Integer"
        );
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            error(call(int(1), "/", vec![int(0)])),
            "uncaught ZeroDivisionError: divided by 0"
        );
    }

    #[test]
    fn test_overflow_raises() {
        assert_eq!(
            error(call(int(i64::MAX), "+", vec![int(1)])),
            "uncaught RangeError: integer overflow"
        );
    }

    #[test]
    fn test_string_concat_type_error() {
        assert_eq!(
            error(call(string("a"), "+", vec![int(1)])),
            "uncaught TypeError: no implicit conversion of Integer into String"
        );
    }

    #[test]
    fn test_p_and_inspect() {
        let (result, output) = eval(fcall(
            "p",
            vec![array(vec![string("a"), sym("b"), nil(), float(1.5)])],
        ));
        assert!(result.is_ok());
        assert_eq!(output, "[\"a\", :b, nil, 1.5]\n");
    }

    #[test]
    fn test_attr_accessor() {
        let program = body(vec![
            class(
                "Point",
                None,
                vec![
                    fcall("attr_accessor", vec![sym("x")]),
                    def(
                        "initialize",
                        params(&["x"]),
                        vec![iasgn("@x", vcall("x"))],
                    ),
                ],
            ),
            lasgn("pt", call(const_ref("Point"), "new", vec![int(1)])),
            call(vcall("pt"), "x=", vec![int(5)]),
            call(vcall("pt"), "x", vec![]),
        ]);
        assert_eq!(value(program), Value::Integer(5));
    }

    #[test]
    fn test_object_inspect_lists_ivars() {
        let program = body(vec![
            class(
                "Pair",
                None,
                vec![def(
                    "initialize",
                    params(&[]),
                    vec![iasgn("@b", int(2)), iasgn("@a", string("x"))],
                )],
            ),
            call(call(const_ref("Pair"), "new", vec![]), "inspect", vec![]),
        ]);
        assert_eq!(value(program), Value::string("#<Pair @a=\"x\", @b=2>"));
    }

    #[test]
    fn test_class_new_is_named_on_assignment() {
        let program = body(vec![
            casgn(cpath(&["Anon"]), call(const_ref("Class"), "new", vec![])),
            call(const_ref("Anon"), "name", vec![]),
        ]);
        assert_eq!(value(program), Value::string("Anon"));
    }

    #[test]
    fn test_respond_to_and_send() {
        let program = array(vec![
            call(int(1), "respond_to?", vec![sym("times")]),
            call(int(1), "respond_to?", vec![sym("nope")]),
            call(int(2), "send", vec![sym("*"), int(21)]),
        ]);
        assert_eq!(
            value(program),
            Value::array(vec![Value::Bool(true), Value::Bool(false), Value::Integer(42)])
        );
    }

    #[test]
    fn test_block_given() {
        let program = body(vec![
            def("given", params(&[]), vec![fcall("block_given?", vec![])]),
            array(vec![
                fcall("given", vec![]),
                with_block(fcall("given", vec![]), Params::default(), vec![]),
            ]),
        ]);
        assert_eq!(
            value(program),
            Value::array(vec![Value::Bool(false), Value::Bool(true)])
        );
    }

    #[test]
    fn test_raise_forms() {
        assert_eq!(
            error(fcall("raise", vec![])),
            "uncaught RuntimeError: unhandled exception"
        );
        assert_eq!(
            error(fcall("raise", vec![int(1)])),
            "uncaught TypeError: exception object expected"
        );
        assert_eq!(
            error(fcall("raise", vec![const_ref("TypeError")])),
            "uncaught TypeError"
        );
    }

    #[test]
    fn test_allocator_undefined() {
        assert_eq!(
            error(call(const_ref("Integer"), "new", vec![])),
            "uncaught TypeError: allocator undefined for Integer"
        );
    }
}
