//! Garnet runtime values.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use garnet_bytecode::InstructionSequence;

use crate::class::RClass;
use crate::frame::{Cref, Env, FrameId, MethodContext};

/// Instance variable table.
pub type IvarTable = HashMap<Rc<str>, Value>;

/// Runtime values.
///
/// Nil, booleans, numbers and symbols are immediates: they carry no heap
/// identity and cannot own singleton classes.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Symbol(Rc<str>),
    String(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RObject>),
    Class(Rc<RClass>),
    Proc(Rc<Proc>),
    /// Literal instruction sequence pushed by `putiseq`. Never reaches user
    /// code.
    Iseq(Rc<InstructionSequence>),
}

impl Value {
    pub fn symbol(name: &str) -> Self {
        Value::Symbol(name.into())
    }

    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    /// Only nil and false are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Value::Nil | Value::Bool(_) | Value::Integer(_) | Value::Float(_) | Value::Symbol(_)
        )
    }

    /// Identity comparison (`equal?`).
    pub fn same(&self, other: &Value) -> bool {
        self.identity() == other.identity()
    }

    /// Key identifying this value for identity-based tables.
    pub fn identity(&self) -> IdentityKey {
        match self {
            Value::Nil => IdentityKey::Nil,
            Value::Bool(b) => IdentityKey::Bool(*b),
            Value::Integer(n) => IdentityKey::Integer(*n),
            Value::Float(n) => IdentityKey::Float(n.to_bits()),
            Value::Symbol(s) => IdentityKey::Symbol(s.clone()),
            Value::String(s) => IdentityKey::Ptr(Rc::as_ptr(s) as *const u8 as usize),
            Value::Array(a) => IdentityKey::Ptr(Rc::as_ptr(a) as usize),
            Value::Object(o) => IdentityKey::Ptr(Rc::as_ptr(o) as usize),
            Value::Class(c) => IdentityKey::Ptr(Rc::as_ptr(c) as usize),
            Value::Proc(p) => IdentityKey::Ptr(Rc::as_ptr(p) as usize),
            Value::Iseq(i) => IdentityKey::Ptr(Rc::as_ptr(i) as usize),
        }
    }

    pub fn as_class(&self) -> Option<&Rc<RClass>> {
        match self {
            Value::Class(c) => Some(c),
            _ => None,
        }
    }

    /// Human-readable rendering used by `inspect` and `p`.
    pub fn inspect(&self) -> String {
        self.inspect_within(&mut Vec::new())
    }

    /// `open` holds the arrays being rendered; meeting one again prints `[...]`.
    fn inspect_within(&self, open: &mut Vec<usize>) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::String(s) => format!("{:?}", s),
            Value::Symbol(s) => format!(":{}", s),
            Value::Array(items) => {
                let ptr = Rc::as_ptr(items) as usize;
                if open.contains(&ptr) {
                    return "[...]".to_string();
                }
                open.push(ptr);
                let parts: Vec<String> =
                    items.borrow().iter().map(|v| v.inspect_within(open)).collect();
                open.pop();
                format!("[{}]", parts.join(", "))
            }
            other => other.to_string(),
        }
    }
}

/// Rendering used by `to_s` and `puts`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Symbol(s) => write!(f, "{}", s),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(_) => write!(f, "{}", self.inspect()),
            Value::Object(o) => match o.message() {
                Some(message) => write!(f, "{}", message),
                None => write!(f, "#<{}>", o.class.display_name()),
            },
            Value::Class(c) => write!(f, "{}", c.display_name()),
            Value::Proc(p) => write!(f, "#<Proc:{}>", p.iseq.name),
            Value::Iseq(i) => write!(f, "<ISeq:{}>", i.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Object(o) => write!(f, "#<{}>", o.class.display_name()),
            Value::Class(c) => write!(f, "{}", c.display_name()),
            other => write!(f, "{}", other.inspect()),
        }
    }
}

/// Structural equality for data values, identity for everything else.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        values_equal(self, other, &mut Vec::new())
    }
}

/// `open` holds the array pairs under comparison. A pair met again while
/// still open compares equal.
fn values_equal(a: &Value, b: &Value, open: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Integer(x), Value::Float(y)) | (Value::Float(y), Value::Integer(x)) => {
            (*x as f64) == *y
        }
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if open.contains(&pair) {
                return true;
            }
            open.push(pair);
            let (xs, ys) = (x.borrow(), y.borrow());
            let equal = xs.len() == ys.len()
                && xs.iter().zip(ys.iter()).all(|(p, q)| values_equal(p, q, open));
            open.pop();
            equal
        }
        _ => a.same(b),
    }
}

/// Identity of a value, usable as a hash key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(u64),
    Symbol(Rc<str>),
    Ptr(usize),
}

/// A plain object: instance of a user or exception class.
pub struct RObject {
    pub class: Rc<RClass>,
    pub ivars: RefCell<IvarTable>,
    /// Created on first singleton-method definition or `class << obj`.
    pub singleton: RefCell<Option<Rc<RClass>>>,
}

impl RObject {
    pub fn new(class: Rc<RClass>) -> Self {
        Self {
            class,
            ivars: RefCell::new(HashMap::new()),
            singleton: RefCell::new(None),
        }
    }

    pub fn ivar(&self, name: &str) -> Option<Value> {
        self.ivars.borrow().get(name).cloned()
    }

    /// Message of an exception object.
    pub fn message(&self) -> Option<Value> {
        self.ivar("@message").filter(|m| !m.is_nil())
    }
}

/// A block captured with its defining context.
pub struct Proc {
    pub iseq: Rc<InstructionSequence>,
    /// Environment of the defining activation; block locals chain to it.
    pub env: Rc<Env>,
    pub self_value: Value,
    pub cref: Rc<Cref>,
    /// Method the block was written in, for `yield` and `super`.
    pub method: Option<Rc<MethodContext>>,
    /// Activation a `return` inside the block leaves.
    pub method_frame: FrameId,
    /// Activation that created the block; `break` resumes there.
    pub home: FrameId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::string("").is_truthy());
    }

    #[test]
    fn test_equality() {
        assert_eq!(Value::Integer(1), Value::Float(1.0));
        assert_eq!(Value::string("a"), Value::string("a"));
        assert_eq!(
            Value::array(vec![Value::Integer(1), Value::symbol("x")]),
            Value::array(vec![Value::Integer(1), Value::symbol("x")])
        );
        assert_ne!(Value::Nil, Value::Bool(false));
    }

    #[test]
    fn test_identity() {
        let s = Value::string("a");
        assert!(s.same(&s.clone()));
        assert!(!s.same(&Value::string("a")));
        assert!(Value::symbol("a").same(&Value::symbol("a")));
    }

    #[test]
    fn test_rendering() {
        let v = Value::array(vec![Value::string("a"), Value::Nil, Value::Integer(2)]);
        assert_eq!(v.inspect(), r#"["a", nil, 2]"#);
        assert_eq!(Value::Nil.to_string(), "");
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(Value::symbol("a").inspect(), ":a");
    }

    fn push(array: &Value, item: Value) {
        if let Value::Array(items) = array {
            items.borrow_mut().push(item);
        }
    }

    #[test]
    fn test_self_containing_array_renders() {
        let a = Value::array(vec![Value::Integer(1)]);
        push(&a, a.clone());
        assert_eq!(a.inspect(), "[1, [...]]");
        assert_eq!(a.to_string(), "[1, [...]]");

        let outer = Value::array(vec![a.clone(), a.clone()]);
        assert_eq!(outer.inspect(), "[[1, [...]], [1, [...]]]");
    }

    #[test]
    fn test_mutually_containing_arrays_compare() {
        let a = Value::array(vec![Value::Integer(1)]);
        let b = Value::array(vec![Value::Integer(1)]);
        push(&a, b.clone());
        push(&b, a.clone());
        assert_eq!(a, b);

        let c = Value::array(vec![Value::Integer(2)]);
        push(&c, a.clone());
        assert_ne!(a, c);
    }
}
