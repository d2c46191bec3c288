//! The object model: class hierarchy, method and constant resolution,
//! instance variables.
//!
//! A [`Registry`] is owned by one VM. It bootstraps the core hierarchy
//! (`BasicObject`, `Object`, `Module`, `Class`, `Kernel`, the immediate
//! classes and the exception tree) and answers every lookup the executor
//! needs.

use std::collections::HashMap;
use std::rc::Rc;

use crate::class::{Arity, ClassKind, Method, RClass};
use crate::frame::Cref;
use crate::object::{IdentityKey, IvarTable, RObject, Value};
use crate::signal::Signal;

/// Class hierarchy and per-VM object model state.
pub struct Registry {
    pub basic_object: Rc<RClass>,
    pub object: Rc<RClass>,
    pub module: Rc<RClass>,
    pub class: Rc<RClass>,
    pub kernel: Rc<RClass>,

    pub nil_class: Rc<RClass>,
    pub true_class: Rc<RClass>,
    pub false_class: Rc<RClass>,
    pub integer: Rc<RClass>,
    pub float: Rc<RClass>,
    pub symbol: Rc<RClass>,
    pub string: Rc<RClass>,
    pub array: Rc<RClass>,
    pub proc_class: Rc<RClass>,

    pub exception: Rc<RClass>,
    pub standard_error: Rc<RClass>,
    pub runtime_error: Rc<RClass>,
    pub argument_error: Rc<RClass>,
    pub type_error: Rc<RClass>,
    pub name_error: Rc<RClass>,
    pub no_method_error: Rc<RClass>,
    pub local_jump_error: Rc<RClass>,
    pub range_error: Rc<RClass>,
    pub zero_division_error: Rc<RClass>,
    pub system_stack_error: Rc<RClass>,

    /// Instance variables of values that have no table of their own. The
    /// value is kept alive so its identity stays unique.
    side_ivars: HashMap<IdentityKey, (Value, IvarTable)>,
}

/// Give a freshly created class its metaclass. The metaclass inherits from
/// the superclass's metaclass; the root's inherits from `Class`.
fn attach_metaclass(class: &Rc<RClass>, class_class: &Rc<RClass>) {
    let superclass = class
        .real_superclass()
        .and_then(|s| s.singleton())
        .unwrap_or_else(|| class_class.clone());
    let name = format!("#<Class:{}>", class.display_name());
    let meta = RClass::new(ClassKind::Singleton, Some(&name), Some(superclass));
    meta.set_klass(class_class.clone(), false);
    class.set_klass(meta, true);
}

fn register(namespace: &Rc<RClass>, class: &Rc<RClass>) {
    let name: Rc<str> = class.display_name().into();
    namespace
        .consts()
        .borrow_mut()
        .insert(name, Value::Class(class.clone()));
}

impl Registry {
    pub fn new() -> Self {
        let basic_object = RClass::new(ClassKind::Class, Some("BasicObject"), None);
        let object = RClass::new(ClassKind::Class, Some("Object"), Some(basic_object.clone()));
        let module = RClass::new(ClassKind::Class, Some("Module"), Some(object.clone()));
        let class = RClass::new(ClassKind::Class, Some("Class"), Some(module.clone()));
        for c in [&basic_object, &object, &module, &class] {
            attach_metaclass(c, &class);
            register(&object, c);
        }

        let kernel = RClass::new(ClassKind::Module, Some("Kernel"), None);
        kernel.set_klass(module.clone(), false);
        register(&object, &kernel);
        object.set_superclass(Some(RClass::include_proxy(&kernel, object.superclass())));

        let boot = |name: &str, superclass: &Rc<RClass>| {
            let c = RClass::new(ClassKind::Class, Some(name), Some(superclass.clone()));
            attach_metaclass(&c, &class);
            register(&object, &c);
            c
        };

        let nil_class = boot("NilClass", &object);
        let true_class = boot("TrueClass", &object);
        let false_class = boot("FalseClass", &object);
        let integer = boot("Integer", &object);
        let float = boot("Float", &object);
        let symbol = boot("Symbol", &object);
        let string = boot("String", &object);
        let array = boot("Array", &object);
        let proc_class = boot("Proc", &object);

        let exception = boot("Exception", &object);
        let standard_error = boot("StandardError", &exception);
        let runtime_error = boot("RuntimeError", &standard_error);
        let argument_error = boot("ArgumentError", &standard_error);
        let type_error = boot("TypeError", &standard_error);
        let name_error = boot("NameError", &standard_error);
        let no_method_error = boot("NoMethodError", &name_error);
        let local_jump_error = boot("LocalJumpError", &standard_error);
        let range_error = boot("RangeError", &standard_error);
        let zero_division_error = boot("ZeroDivisionError", &standard_error);
        let system_stack_error = boot("SystemStackError", &exception);

        Self {
            basic_object,
            object,
            module,
            class,
            kernel,
            nil_class,
            true_class,
            false_class,
            integer,
            float,
            symbol,
            string,
            array,
            proc_class,
            exception,
            standard_error,
            runtime_error,
            argument_error,
            type_error,
            name_error,
            no_method_error,
            local_jump_error,
            range_error,
            zero_division_error,
            system_stack_error,
            side_ivars: HashMap::new(),
        }
    }

    // ===========================================================================
    // Definitions
    // ===========================================================================

    /// Full name for a constant `name` defined under `namespace`.
    fn qualified_name(&self, namespace: &Rc<RClass>, name: &str) -> String {
        if Rc::ptr_eq(namespace, &self.object) {
            name.to_string()
        } else {
            format!("{}::{}", namespace.display_name(), name)
        }
    }

    /// Define or reopen class `name` under `namespace`.
    pub fn define_class(
        &self,
        name: &str,
        superclass: Option<Rc<RClass>>,
        namespace: &Rc<RClass>,
    ) -> Result<Rc<RClass>, Signal> {
        if let Some(existing) = namespace.lookup_const(name) {
            return match existing {
                Value::Class(c) if c.kind() == ClassKind::Class => {
                    if let Some(requested) = &superclass {
                        let current = c.real_superclass();
                        if !current.is_some_and(|s| Rc::ptr_eq(&s, requested)) {
                            return Err(self.error(
                                &self.type_error,
                                &format!("superclass mismatch for class {}", name),
                            ));
                        }
                    }
                    Ok(c)
                }
                _ => Err(self.error(&self.type_error, &format!("{} is not a class", name))),
            };
        }

        let superclass = superclass.unwrap_or_else(|| self.object.clone());
        if superclass.kind() != ClassKind::Class {
            return Err(self.error(&self.type_error, "superclass must be a Class"));
        }
        let class = self.new_class(Some(superclass));
        self.const_set(namespace, name, Value::Class(class.clone()));
        log::debug!("defined class {}", class.display_name());
        Ok(class)
    }

    /// Allocate an anonymous class with its metaclass.
    pub fn new_class(&self, superclass: Option<Rc<RClass>>) -> Rc<RClass> {
        let superclass = superclass.unwrap_or_else(|| self.object.clone());
        let class = RClass::new(ClassKind::Class, None, Some(superclass));
        attach_metaclass(&class, &self.class);
        class
    }

    /// Define or reopen module `name` under `namespace`.
    pub fn define_module(&self, name: &str, namespace: &Rc<RClass>) -> Result<Rc<RClass>, Signal> {
        if let Some(existing) = namespace.lookup_const(name) {
            return match existing {
                Value::Class(m) if m.is_module() => Ok(m),
                _ => Err(self.error(&self.type_error, &format!("{} is not a module", name))),
            };
        }
        let module = RClass::new(ClassKind::Module, None, None);
        module.set_klass(self.module.clone(), false);
        self.const_set(namespace, name, Value::Class(module.clone()));
        log::debug!("defined module {}", module.display_name());
        Ok(module)
    }

    /// Splice `module`, and the modules it includes, into `klass`'s chain.
    ///
    /// A module whose table is already present is skipped; when it sits
    /// before the first real superclass the insertion point moves past it, so
    /// ordering among already-included modules is preserved.
    pub fn include_module(&self, klass: &Rc<RClass>, module: &Rc<RClass>) -> Result<(), Signal> {
        if !module.is_module() {
            return Err(self.error(
                &self.type_error,
                &format!(
                    "wrong argument type {} (expected Module)",
                    self.describe_class_kind(module)
                ),
            ));
        }

        let modules: Vec<Rc<RClass>> = module.chain().map(|c| c.origin()).collect();
        let mut insertion = klass.clone();
        for m in modules {
            if klass.shares_methods_with(&m) {
                return Err(self.error(&self.argument_error, "cyclic include detected"));
            }

            let mut superclass_seen = false;
            let mut present = false;
            let mut next = klass.superclass();
            while let Some(c) = next {
                if c.is_include_proxy() {
                    if c.shares_methods_with(&m) {
                        if !superclass_seen {
                            insertion = c.clone();
                        }
                        present = true;
                        break;
                    }
                } else {
                    superclass_seen = true;
                }
                next = c.superclass();
            }
            if present {
                continue;
            }

            let proxy = RClass::include_proxy(&m, insertion.superclass());
            insertion.set_superclass(Some(proxy.clone()));
            insertion = proxy;
            log::debug!(
                "included {} into {}",
                m.display_name(),
                klass.display_name()
            );
        }
        Ok(())
    }

    /// Install a method, replacing any previous definition in `klass`.
    pub fn define_method(&self, klass: &Rc<RClass>, method: Method) {
        log::debug!("defined {}#{}", klass.display_name(), method.name);
        klass.add_method(method);
    }

    /// Install a method on the singleton class of `value`.
    pub fn define_singleton_method(&self, value: &Value, method: Method) -> Result<(), Signal> {
        let singleton = self.singleton_class_of(value)?;
        self.define_method(&singleton, method);
        Ok(())
    }

    /// The singleton class of `value`, created on first use.
    pub fn singleton_class_of(&self, value: &Value) -> Result<Rc<RClass>, Signal> {
        match value {
            Value::Object(o) => {
                if let Some(singleton) = o.singleton.borrow().as_ref() {
                    return Ok(singleton.clone());
                }
                let name = format!("#<Class:#<{}>>", o.class.display_name());
                let singleton =
                    RClass::new(ClassKind::Singleton, Some(&name), Some(o.class.clone()));
                singleton.set_klass(self.class.clone(), false);
                *o.singleton.borrow_mut() = Some(singleton.clone());
                Ok(singleton)
            }
            Value::Class(c) => {
                if let Some(singleton) = c.singleton() {
                    return Ok(singleton);
                }
                let superclass = c.klass().unwrap_or_else(|| self.module.clone());
                let name = format!("#<Class:{}>", c.display_name());
                let singleton = RClass::new(ClassKind::Singleton, Some(&name), Some(superclass));
                singleton.set_klass(self.class.clone(), false);
                c.set_klass(singleton.clone(), true);
                Ok(singleton)
            }
            other => Err(self.error(
                &self.type_error,
                &format!("can't define singleton for {}", other.inspect()),
            )),
        }
    }

    // ===========================================================================
    // Lookup
    // ===========================================================================

    /// Class used for dispatch on `value`, singleton included.
    pub fn class_of(&self, value: &Value) -> Rc<RClass> {
        match value {
            Value::Nil => self.nil_class.clone(),
            Value::Bool(true) => self.true_class.clone(),
            Value::Bool(false) => self.false_class.clone(),
            Value::Integer(_) => self.integer.clone(),
            Value::Float(_) => self.float.clone(),
            Value::Symbol(_) => self.symbol.clone(),
            Value::String(_) => self.string.clone(),
            Value::Array(_) => self.array.clone(),
            Value::Proc(_) => self.proc_class.clone(),
            Value::Iseq(_) => self.object.clone(),
            Value::Object(o) => match o.singleton.borrow().as_ref() {
                Some(singleton) => singleton.clone(),
                None => o.class.clone(),
            },
            Value::Class(c) => c.klass().unwrap_or_else(|| {
                if c.is_module() {
                    self.module.clone()
                } else {
                    self.class.clone()
                }
            }),
        }
    }

    /// Class reported by `obj.class`: singletons and proxies skipped.
    pub fn real_class_of(&self, value: &Value) -> Rc<RClass> {
        let class = self.class_of(value);
        class
            .chain()
            .find(|c| c.kind() == ClassKind::Class)
            .unwrap_or(class)
    }

    /// Find `name` along `klass`'s chain, returning the method and the chain
    /// element holding it.
    pub fn find_method(&self, klass: &Rc<RClass>, name: &str) -> Option<(Rc<Method>, Rc<RClass>)> {
        klass.chain().find_map(|c| {
            let method = c.lookup_method(name)?;
            Some((method, c))
        })
    }

    /// Next definition of `name` strictly above `holder`.
    pub fn find_super_method(
        &self,
        holder: &Rc<RClass>,
        name: &str,
    ) -> Option<(Rc<Method>, Rc<RClass>)> {
        holder
            .superclass()
            .and_then(|superclass| self.find_method(&superclass, name))
    }

    /// Chain of `klass` with proxies reported as their modules.
    pub fn ancestors(&self, klass: &Rc<RClass>) -> Vec<Rc<RClass>> {
        klass.chain().map(|c| c.origin()).collect()
    }

    /// Whether `klass` is `ancestor` or has it in its chain.
    pub fn inherits(&self, klass: &Rc<RClass>, ancestor: &Rc<RClass>) -> bool {
        klass.chain().any(|c| Rc::ptr_eq(&c.origin(), ancestor))
    }

    pub fn is_a(&self, value: &Value, klass: &Rc<RClass>) -> bool {
        self.inherits(&self.class_of(value), klass)
    }

    // ===========================================================================
    // Instance variables
    // ===========================================================================

    pub fn ivar_get(&self, value: &Value, name: &str) -> Value {
        let found = match value {
            Value::Object(o) => o.ivar(name),
            Value::Class(c) => c.ivars().borrow().get(name).cloned(),
            other => self
                .side_ivars
                .get(&other.identity())
                .and_then(|(_, ivars)| ivars.get(name).cloned()),
        };
        found.unwrap_or(Value::Nil)
    }

    pub fn ivar_set(&mut self, value: &Value, name: &str, v: Value) {
        match value {
            Value::Object(o) => {
                o.ivars.borrow_mut().insert(name.into(), v);
            }
            Value::Class(c) => {
                c.ivars().borrow_mut().insert(name.into(), v);
            }
            other => {
                let (_, ivars) = self
                    .side_ivars
                    .entry(other.identity())
                    .or_insert_with(|| (other.clone(), HashMap::new()));
                ivars.insert(name.into(), v);
            }
        }
    }

    // ===========================================================================
    // Constants
    // ===========================================================================

    /// Look `name` up in `base` and its ancestors. `Object` is consulted
    /// last for other bases.
    pub fn const_get(&self, base: &Rc<RClass>, name: &str) -> Result<Value, Signal> {
        let base_is_object = Rc::ptr_eq(base, &self.object);
        for c in base.chain() {
            if !base_is_object && Rc::ptr_eq(&c, &self.object) {
                continue;
            }
            if let Some(value) = c.lookup_const(name) {
                return Ok(value);
            }
        }
        if !base_is_object {
            if let Some(value) = self.object.lookup_const(name) {
                return Ok(value);
            }
        }
        Err(self.uninitialized_constant(base, name))
    }

    /// Resolve an unqualified constant: enclosing class bodies innermost
    /// first, then the innermost class's ancestors, then `Object`.
    pub fn const_lookup(&self, cref: &Rc<Cref>, name: &str) -> Result<Value, Signal> {
        for class in cref.lexical() {
            if let Some(value) = class.lookup_const(name) {
                return Ok(value);
            }
        }
        self.const_get(&cref.class, name)
    }

    /// Assign a constant, naming an anonymous class or module.
    pub fn const_set(&self, base: &Rc<RClass>, name: &str, value: Value) {
        if let Value::Class(c) = &value {
            c.set_name_if_anonymous(&self.qualified_name(base, name));
        }
        base.consts().borrow_mut().insert(name.into(), value);
    }

    fn uninitialized_constant(&self, base: &Rc<RClass>, name: &str) -> Signal {
        let full = self.qualified_name(base, name);
        let exc = self.new_exception(&self.name_error, &format!("uninitialized constant {}", full));
        if let Value::Object(o) = &exc {
            o.ivars
                .borrow_mut()
                .insert("@name".into(), Value::symbol(name));
        }
        Signal::Raise(exc)
    }

    // ===========================================================================
    // Errors
    // ===========================================================================

    /// Allocate an exception with a message.
    pub fn new_exception(&self, class: &Rc<RClass>, message: &str) -> Value {
        let exc = RObject::new(class.clone());
        exc.ivars
            .borrow_mut()
            .insert("@message".into(), Value::string(message));
        Value::Object(Rc::new(exc))
    }

    /// Raise signal for a new exception.
    pub fn error(&self, class: &Rc<RClass>, message: &str) -> Signal {
        Signal::Raise(self.new_exception(class, message))
    }

    pub fn arity_error(&self, given: usize, arity: Arity) -> Signal {
        self.error(
            &self.argument_error,
            &format!(
                "wrong number of arguments (given {}, expected {})",
                given, arity
            ),
        )
    }

    /// `NoMethodError` carrying the selector in `@name`.
    pub fn no_method_error(&self, receiver: &Value, name: &str) -> Signal {
        let message = format!("undefined method '{}' for {}", name, self.describe(receiver));
        let exc = self.new_exception(&self.no_method_error, &message);
        if let Value::Object(o) = &exc {
            let mut ivars = o.ivars.borrow_mut();
            ivars.insert("@name".into(), Value::symbol(name));
            ivars.insert("@receiver".into(), receiver.clone());
        }
        Signal::Raise(exc)
    }

    /// Receiver description used in error messages.
    pub fn describe(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Class(c) => format!("{} {}", self.describe_class_kind(c), c.display_name()),
            other => format!(
                "an instance of {}",
                self.real_class_of(other).display_name()
            ),
        }
    }

    fn describe_class_kind(&self, c: &RClass) -> &'static str {
        if c.is_module() { "module" } else { "class" }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
