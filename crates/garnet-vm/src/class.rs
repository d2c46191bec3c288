//! Classes, modules and their method tables.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use garnet_bytecode::InstructionSequence;

use crate::frame::Cref;
use crate::object::{IvarTable, Value};
use crate::signal::Signal;
use crate::vm::VM;

/// Native method implementation: receiver, arguments, block.
pub type NativeFn = fn(&mut VM, &Value, &[Value], Option<&Value>) -> Result<Value, Signal>;

/// Method table shared between a module and its include proxies.
pub type MethodTable = Rc<RefCell<HashMap<Rc<str>, Rc<Method>>>>;

/// Constant table shared between a module and its include proxies.
pub type ConstTable = Rc<RefCell<HashMap<Rc<str>, Value>>>;

/// Accepted argument counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    /// `None` for no upper bound.
    pub max: Option<usize>,
}

impl Arity {
    pub const fn exact(n: usize) -> Self {
        Self {
            min: n,
            max: Some(n),
        }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub const fn at_least(min: usize) -> Self {
        Self { min, max: None }
    }

    pub fn accepts(&self, given: usize) -> bool {
        given >= self.min && self.max.is_none_or(|max| given <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{}", max),
            Some(max) => write!(f, "{}..{}", self.min, max),
            None => write!(f, "{}+", self.min),
        }
    }
}

/// How a method runs.
#[derive(Clone)]
pub enum MethodBody {
    /// Compiled method, with the lexical scope it was defined in.
    Iseq {
        iseq: Rc<InstructionSequence>,
        cref: Rc<Cref>,
    },
    Native { func: NativeFn, arity: Arity },
    /// Generated by `attr_reader`.
    AttrReader(Rc<str>),
    /// Generated by `attr_writer`.
    AttrWriter(Rc<str>),
}

/// An entry of a method table.
pub struct Method {
    pub name: Rc<str>,
    pub body: MethodBody,
}

impl Method {
    pub fn new(name: &str, body: MethodBody) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    pub fn arity(&self) -> Arity {
        match &self.body {
            MethodBody::Iseq { iseq, .. } => {
                let (min, max) = iseq.args.arity();
                Arity { min, max }
            }
            MethodBody::Native { arity, .. } => *arity,
            MethodBody::AttrReader(_) => Arity::exact(0),
            MethodBody::AttrWriter(_) => Arity::exact(1),
        }
    }
}

/// What an [`RClass`] node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Module,
    /// Per-object class, including metaclasses.
    Singleton,
    /// Stand-in for an included module in a superclass chain.
    IncludeProxy,
}

/// A class, module, singleton class or include proxy.
///
/// Superclass chains interleave real classes with include proxies. A proxy
/// holds the same method and constant tables as its module, so later
/// definitions in the module are visible through every includer.
pub struct RClass {
    kind: ClassKind,
    name: RefCell<Option<Rc<str>>>,
    superclass: RefCell<Option<Rc<RClass>>>,
    methods: MethodTable,
    consts: ConstTable,
    ivars: RefCell<IvarTable>,
    /// Class of this class: its metaclass, or `Module`/`Class` until a
    /// singleton is needed.
    klass: RefCell<Option<Rc<RClass>>>,
    /// `klass` is this class's own singleton.
    has_singleton: Cell<bool>,
    /// Included module, for proxies.
    module: Option<Rc<RClass>>,
}

impl RClass {
    pub fn new(kind: ClassKind, name: Option<&str>, superclass: Option<Rc<RClass>>) -> Rc<Self> {
        Rc::new(Self {
            kind,
            name: RefCell::new(name.map(Rc::from)),
            superclass: RefCell::new(superclass),
            methods: Rc::new(RefCell::new(HashMap::new())),
            consts: Rc::new(RefCell::new(HashMap::new())),
            ivars: RefCell::new(HashMap::new()),
            klass: RefCell::new(None),
            has_singleton: Cell::new(false),
            module: None,
        })
    }

    /// Proxy for `module`, sharing its tables.
    pub fn include_proxy(module: &Rc<RClass>, superclass: Option<Rc<RClass>>) -> Rc<Self> {
        let origin = module.origin();
        Rc::new(Self {
            kind: ClassKind::IncludeProxy,
            name: RefCell::new(None),
            superclass: RefCell::new(superclass),
            methods: origin.methods.clone(),
            consts: origin.consts.clone(),
            ivars: RefCell::new(HashMap::new()),
            klass: RefCell::new(None),
            has_singleton: Cell::new(false),
            module: Some(origin),
        })
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn is_module(&self) -> bool {
        self.kind == ClassKind::Module
    }

    pub fn is_singleton(&self) -> bool {
        self.kind == ClassKind::Singleton
    }

    pub fn is_include_proxy(&self) -> bool {
        self.kind == ClassKind::IncludeProxy
    }

    pub fn name(&self) -> Option<Rc<str>> {
        self.name.borrow().clone()
    }

    /// Name a class on its first constant assignment.
    pub fn set_name_if_anonymous(&self, name: &str) {
        let mut slot = self.name.borrow_mut();
        if slot.is_none() {
            *slot = Some(name.into());
        }
    }

    pub fn display_name(&self) -> String {
        match (self.name(), &self.module) {
            (Some(name), _) => name.to_string(),
            (None, Some(module)) => module.display_name(),
            (None, None) => "#<Class>".to_string(),
        }
    }

    pub fn superclass(&self) -> Option<Rc<RClass>> {
        self.superclass.borrow().clone()
    }

    pub fn set_superclass(&self, superclass: Option<Rc<RClass>>) {
        *self.superclass.borrow_mut() = superclass;
    }

    /// Nearest superclass that is not an include proxy.
    pub fn real_superclass(&self) -> Option<Rc<RClass>> {
        let mut next = self.superclass();
        while let Some(c) = next {
            if !c.is_include_proxy() {
                return Some(c);
            }
            next = c.superclass();
        }
        None
    }

    /// The module a proxy stands for, or the class itself.
    pub fn origin(self: &Rc<Self>) -> Rc<RClass> {
        match &self.module {
            Some(module) => module.clone(),
            None => self.clone(),
        }
    }

    pub fn klass(&self) -> Option<Rc<RClass>> {
        self.klass.borrow().clone()
    }

    pub fn set_klass(&self, klass: Rc<RClass>, own_singleton: bool) {
        *self.klass.borrow_mut() = Some(klass);
        self.has_singleton.set(own_singleton);
    }

    /// This class's singleton, if one exists yet.
    pub fn singleton(&self) -> Option<Rc<RClass>> {
        if self.has_singleton.get() {
            self.klass()
        } else {
            None
        }
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn consts(&self) -> &ConstTable {
        &self.consts
    }

    pub fn ivars(&self) -> &RefCell<IvarTable> {
        &self.ivars
    }

    /// Whether `other` shares this node's method table.
    pub fn shares_methods_with(&self, other: &RClass) -> bool {
        Rc::ptr_eq(&self.methods, &other.methods)
    }

    pub fn lookup_method(&self, name: &str) -> Option<Rc<Method>> {
        self.methods.borrow().get(name).cloned()
    }

    pub fn add_method(&self, method: Method) {
        let name = method.name.clone();
        self.methods.borrow_mut().insert(name, Rc::new(method));
    }

    pub fn lookup_const(&self, name: &str) -> Option<Value> {
        self.consts.borrow().get(name).cloned()
    }

    /// The chain starting at this class: itself, then superclasses
    /// interleaved with include proxies.
    pub fn chain(self: &Rc<Self>) -> Chain {
        Chain {
            next: Some(self.clone()),
        }
    }
}

impl fmt::Debug for RClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RClass({:?} {})", self.kind, self.display_name())
    }
}

/// Iterator over a superclass chain.
pub struct Chain {
    next: Option<Rc<RClass>>,
}

impl Iterator for Chain {
    type Item = Rc<RClass>;

    fn next(&mut self) -> Option<Rc<RClass>> {
        let current = self.next.take()?;
        self.next = current.superclass();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity() {
        assert!(Arity::exact(1).accepts(1));
        assert!(!Arity::exact(1).accepts(2));
        assert!(Arity::range(1, 2).accepts(2));
        assert!(Arity::at_least(1).accepts(10));
        assert!(!Arity::at_least(1).accepts(0));

        assert_eq!(Arity::exact(0).to_string(), "0");
        assert_eq!(Arity::range(1, 3).to_string(), "1..3");
        assert_eq!(Arity::at_least(2).to_string(), "2+");
    }

    #[test]
    fn test_proxy_shares_tables() {
        let module = RClass::new(ClassKind::Module, Some("M"), None);
        let proxy = RClass::include_proxy(&module, None);
        assert!(proxy.shares_methods_with(&module));
        assert!(Rc::ptr_eq(&proxy.origin(), &module));

        module.add_method(Method::new("late", MethodBody::AttrReader("@x".into())));
        assert!(proxy.lookup_method("late").is_some());
        assert_eq!(proxy.display_name(), "M");
    }

    #[test]
    fn test_chain_and_real_superclass() {
        let base = RClass::new(ClassKind::Class, Some("Base"), None);
        let module = RClass::new(ClassKind::Module, Some("M"), None);
        let proxy = RClass::include_proxy(&module, Some(base.clone()));
        let child = RClass::new(ClassKind::Class, Some("Child"), Some(proxy));

        let names: Vec<String> = child.chain().map(|c| c.display_name()).collect();
        assert_eq!(names, vec!["Child", "M", "Base"]);
        assert!(Rc::ptr_eq(&child.real_superclass().unwrap(), &base));
    }

    #[test]
    fn test_name_set_once() {
        let class = RClass::new(ClassKind::Class, None, None);
        class.set_name_if_anonymous("A");
        class.set_name_if_anonymous("B");
        assert_eq!(class.name().as_deref(), Some("A"));
    }
}
