//! AST node types for Garnet.
//!
//! The tree is a closed tagged union. Parsers hand it over either as Rust
//! values (see [`crate::build`]) or as a JSON tree tagged with `"type"`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Nodes
// ============================================================================

/// AST node enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Node {
    Body(Body),
    Nil,
    True,
    False,
    SelfRef,
    Integer(IntegerLit),
    Float(FloatLit),
    Str(StrLit),
    Symbol(SymbolLit),
    Array(ArrayLit),
    Call(Box<Call>),
    LocalAssign(Box<LocalAssign>),
    IvarGet(IvarRef),
    IvarAssign(Box<IvarAssign>),
    Const(ConstRef),
    ConstAssign(Box<ConstAssign>),
    Def(Box<Def>),
    Class(Box<ClassDef>),
    Module(Box<ModuleDef>),
    SingletonClass(Box<SingletonClassDef>),
    If(Box<If>),
    Not(Box<Not>),
    Super(Box<Super>),
    Yield(Yield),
    Return(Jump),
    Break(Jump),
    Next(Jump),
    Redo,
    Retry,
    Begin(Box<Begin>),
}

impl Node {
    /// Short node kind name, used in compiler diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Body(_) => "Body",
            Node::Nil => "Nil",
            Node::True => "True",
            Node::False => "False",
            Node::SelfRef => "SelfRef",
            Node::Integer(_) => "Integer",
            Node::Float(_) => "Float",
            Node::Str(_) => "Str",
            Node::Symbol(_) => "Symbol",
            Node::Array(_) => "Array",
            Node::Call(_) => "Call",
            Node::LocalAssign(_) => "LocalAssign",
            Node::IvarGet(_) => "IvarGet",
            Node::IvarAssign(_) => "IvarAssign",
            Node::Const(_) => "Const",
            Node::ConstAssign(_) => "ConstAssign",
            Node::Def(_) => "Def",
            Node::Class(_) => "Class",
            Node::Module(_) => "Module",
            Node::SingletonClass(_) => "SingletonClass",
            Node::If(_) => "If",
            Node::Not(_) => "Not",
            Node::Super(_) => "Super",
            Node::Yield(_) => "Yield",
            Node::Return(_) => "Return",
            Node::Break(_) => "Break",
            Node::Next(_) => "Next",
            Node::Redo => "Redo",
            Node::Retry => "Retry",
            Node::Begin(_) => "Begin",
        }
    }

    /// Whether the node is free of side effects, so that its value can be
    /// dropped without emitting anything.
    pub fn is_pure_literal(&self) -> bool {
        matches!(
            self,
            Node::Nil
                | Node::True
                | Node::False
                | Node::SelfRef
                | Node::Integer(_)
                | Node::Float(_)
                | Node::Str(_)
                | Node::Symbol(_)
        )
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Body(b) => write!(f, "{}", b),
            Node::Nil => write!(f, "nil"),
            Node::True => write!(f, "true"),
            Node::False => write!(f, "false"),
            Node::SelfRef => write!(f, "self"),
            Node::Integer(i) => write!(f, "{}", i.value),
            Node::Float(n) => write!(f, "{:?}", n.value),
            Node::Str(s) => write!(f, "{:?}", s.value),
            Node::Symbol(s) => write!(f, ":{}", s.name),
            Node::Array(a) => {
                let items: Vec<String> = a.items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Node::Call(c) => write!(f, "{}", c),
            Node::LocalAssign(a) => write!(f, "{} = {}", a.name, a.value),
            Node::IvarGet(i) => write!(f, "{}", i.name),
            Node::IvarAssign(a) => write!(f, "{} = {}", a.name, a.value),
            Node::Const(c) => write!(f, "{}", c),
            Node::ConstAssign(a) => write!(f, "{} = {}", a.target, a.value),
            Node::Def(d) => write!(f, "{}", d),
            Node::Class(c) => {
                write!(f, "class {}", c.path)?;
                if let Some(sup) = &c.superclass {
                    write!(f, " < {}", sup)?;
                }
                write!(f, "; {}; end", c.body)
            }
            Node::Module(m) => write!(f, "module {}; {}; end", m.path, m.body),
            Node::SingletonClass(s) => write!(f, "class << {}; {}; end", s.target, s.body),
            Node::If(i) => write!(f, "{}", i),
            Node::Not(n) => write!(f, "!{}", n.value),
            Node::Super(s) => match &s.args {
                Some(args) => {
                    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                    write!(f, "super({})", args.join(", "))
                }
                None => write!(f, "super"),
            },
            Node::Yield(y) => {
                let args: Vec<String> = y.args.iter().map(|a| a.to_string()).collect();
                write!(f, "yield({})", args.join(", "))
            }
            Node::Return(j) => write_jump(f, "return", j),
            Node::Break(j) => write_jump(f, "break", j),
            Node::Next(j) => write_jump(f, "next", j),
            Node::Redo => write!(f, "redo"),
            Node::Retry => write!(f, "retry"),
            Node::Begin(b) => write!(f, "{}", b),
        }
    }
}

fn write_jump(f: &mut fmt::Formatter<'_>, keyword: &str, jump: &Jump) -> fmt::Result {
    match &jump.value {
        Some(v) => write!(f, "{} {}", keyword, v),
        None => write!(f, "{}", keyword),
    }
}

// ============================================================================
// Literals
// ============================================================================

/// A statement sequence. The value of the sequence is its last statement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Body {
    pub stmts: Vec<Node>,
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stmts: Vec<String> = self.stmts.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", stmts.join("; "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegerLit {
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatLit {
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrLit {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolLit {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayLit {
    pub items: Vec<Node>,
}

// ============================================================================
// Calls and blocks
// ============================================================================

/// Method call. A receiverless call without arguments, parens or block may
/// turn out to be a local variable read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub receiver: Option<Node>,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Node>,
    #[serde(default)]
    pub has_parens: bool,
    #[serde(default)]
    pub block: Option<Block>,
    /// `&expr` argument passing an existing proc as the block.
    #[serde(default)]
    pub block_arg: Option<Node>,
}

impl Call {
    /// Whether this call could be a bare identifier.
    pub fn is_vcall(&self) -> bool {
        self.receiver.is_none()
            && self.args.is_empty()
            && !self.has_parens
            && self.block.is_none()
            && self.block_arg.is_none()
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(recv) = &self.receiver {
            write!(f, "{}.", recv)?;
        }
        write!(f, "{}", self.name)?;
        let mut args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        if let Some(b) = &self.block_arg {
            args.push(format!("&{}", b));
        }
        if self.has_parens || !args.is_empty() {
            write!(f, "({})", args.join(", "))?;
        }
        if let Some(block) = &self.block {
            write!(f, " {}", block)?;
        }
        Ok(())
    }
}

/// Block literal attached to a call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub params: Params,
    pub body: Body,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{{ {} }}", self.body)
        } else {
            write!(f, "{{ |{}| {} }}", self.params, self.body)
        }
    }
}

/// Parameter list shared by methods and blocks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<OptionalParam>,
    #[serde(default)]
    pub rest: Option<String>,
    #[serde(default)]
    pub block: Option<String>,
}

impl Params {
    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
            && self.optional.is_empty()
            && self.rest.is_none()
            && self.block.is_none()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.required.clone();
        parts.extend(self.optional.iter().map(|o| format!("{} = {}", o.name, o.default)));
        if let Some(rest) = &self.rest {
            parts.push(format!("*{}", rest));
        }
        if let Some(block) = &self.block {
            parts.push(format!("&{}", block));
        }
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionalParam {
    pub name: String,
    pub default: Node,
}

// ============================================================================
// Variables and constants
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAssign {
    pub name: String,
    pub value: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvarRef {
    /// Name including the leading `@`.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvarAssign {
    pub name: String,
    pub value: Node,
}

/// Where resolution of a constant path starts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ConstScope {
    /// `Foo` - lexical scope, then ancestors, then `Object`.
    #[default]
    Lexical,
    /// `::Foo` - the root namespace.
    Root,
    /// `expr::Foo`
    Expr(Box<Node>),
}

/// A (possibly qualified) constant path such as `A::B::C`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstRef {
    #[serde(default)]
    pub scope: ConstScope,
    pub path: Vec<String>,
}

impl ConstRef {
    /// Last segment of the path.
    pub fn last(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

impl fmt::Display for ConstRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ConstScope::Lexical => {}
            ConstScope::Root => write!(f, "::")?,
            ConstScope::Expr(e) => write!(f, "{}::", e)?,
        }
        write!(f, "{}", self.path.join("::"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstAssign {
    pub target: ConstRef,
    pub value: Node,
}

// ============================================================================
// Definitions
// ============================================================================

/// `def name(params) body end`, or `def recv.name` for singleton methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Def {
    #[serde(default)]
    pub singleton: Option<Node>,
    pub name: String,
    #[serde(default)]
    pub params: Params,
    pub body: Body,
}

impl fmt::Display for Def {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def ")?;
        if let Some(recv) = &self.singleton {
            write!(f, "{}.", recv)?;
        }
        write!(f, "{}({}); {}; end", self.name, self.params, self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub path: ConstRef,
    #[serde(default)]
    pub superclass: Option<Node>,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDef {
    pub path: ConstRef,
    pub body: Body,
}

/// `class << target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingletonClassDef {
    pub target: Node,
    pub body: Body,
}

// ============================================================================
// Control flow
// ============================================================================

/// `if c1 then b1 elsif c2 then b2 else b3 end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct If {
    pub branches: Vec<IfBranch>,
    #[serde(default)]
    pub else_body: Option<Body>,
}

impl fmt::Display for If {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, branch) in self.branches.iter().enumerate() {
            let keyword = if i == 0 { "if" } else { "elsif" };
            write!(f, "{} {} then {}; ", keyword, branch.condition, branch.body)?;
        }
        if let Some(else_body) = &self.else_body {
            write!(f, "else {}; ", else_body)?;
        }
        write!(f, "end")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfBranch {
    pub condition: Node,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Not {
    pub value: Node,
}

/// `super` (args `None`) or `super(...)` (args `Some`, possibly empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Super {
    #[serde(default)]
    pub args: Option<Vec<Node>>,
    #[serde(default)]
    pub block: Option<Block>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Yield {
    #[serde(default)]
    pub args: Vec<Node>,
}

/// Payload of `return`, `break` and `next`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Jump {
    #[serde(default)]
    pub value: Option<Box<Node>>,
}

/// `begin body rescue ... else ... ensure ... end`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Begin {
    pub body: Body,
    #[serde(default)]
    pub rescues: Vec<RescueClause>,
    #[serde(default)]
    pub else_body: Option<Body>,
    #[serde(default)]
    pub ensure_body: Option<Body>,
}

impl fmt::Display for Begin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "begin {}; ", self.body)?;
        for clause in &self.rescues {
            write!(f, "{}; ", clause)?;
        }
        if let Some(else_body) = &self.else_body {
            write!(f, "else {}; ", else_body)?;
        }
        if let Some(ensure_body) = &self.ensure_body {
            write!(f, "ensure {}; ", ensure_body)?;
        }
        write!(f, "end")
    }
}

/// `rescue A, B => e`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescueClause {
    #[serde(default)]
    pub classes: Vec<Node>,
    #[serde(default)]
    pub binding: Option<String>,
    pub body: Body,
}

impl fmt::Display for RescueClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rescue")?;
        if !self.classes.is_empty() {
            let classes: Vec<String> = self.classes.iter().map(|c| c.to_string()).collect();
            write!(f, " {}", classes.join(", "))?;
        }
        if let Some(binding) = &self.binding {
            write!(f, " => {}", binding)?;
        }
        write!(f, " {}", self.body)
    }
}
