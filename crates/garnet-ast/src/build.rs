//! Constructor helpers for assembling trees by hand.
//!
//! ```
//! use garnet_ast::build::*;
//!
//! // a = 1; a
//! let program = body(vec![lasgn("a", int(1)), vcall("a")]);
//! assert_eq!(program.to_string(), "a = 1; a");
//! ```

use crate::ast::*;

pub fn body(stmts: Vec<Node>) -> Node {
    Node::Body(Body { stmts })
}

pub fn stmts(stmts: Vec<Node>) -> Body {
    Body { stmts }
}

pub fn nil() -> Node {
    Node::Nil
}

pub fn int(value: i64) -> Node {
    Node::Integer(IntegerLit { value })
}

pub fn float(value: f64) -> Node {
    Node::Float(FloatLit { value })
}

pub fn string(value: &str) -> Node {
    Node::Str(StrLit {
        value: value.to_string(),
    })
}

pub fn sym(name: &str) -> Node {
    Node::Symbol(SymbolLit {
        name: name.to_string(),
    })
}

pub fn array(items: Vec<Node>) -> Node {
    Node::Array(ArrayLit { items })
}

/// Bare identifier: a local read or a receiverless zero-argument call.
pub fn vcall(name: &str) -> Node {
    Node::Call(Box::new(Call {
        receiver: None,
        name: name.to_string(),
        args: Vec::new(),
        has_parens: false,
        block: None,
        block_arg: None,
    }))
}

/// Receiverless call with explicit parens: `name(args)`.
pub fn fcall(name: &str, args: Vec<Node>) -> Node {
    Node::Call(Box::new(Call {
        receiver: None,
        name: name.to_string(),
        args,
        has_parens: true,
        block: None,
        block_arg: None,
    }))
}

/// `receiver.name(args)`
pub fn call(receiver: Node, name: &str, args: Vec<Node>) -> Node {
    Node::Call(Box::new(Call {
        receiver: Some(receiver),
        name: name.to_string(),
        args,
        has_parens: true,
        block: None,
        block_arg: None,
    }))
}

/// Attach a block literal to a call node. Non-call nodes are returned as is.
pub fn with_block(node: Node, params: Params, block_body: Vec<Node>) -> Node {
    match node {
        Node::Call(mut c) => {
            c.block = Some(Block {
                params,
                body: Body { stmts: block_body },
            });
            Node::Call(c)
        }
        other => other,
    }
}

/// Attach a `&expr` block argument to a call node.
pub fn with_block_arg(node: Node, block_arg: Node) -> Node {
    match node {
        Node::Call(mut c) => {
            c.block_arg = Some(block_arg);
            Node::Call(c)
        }
        other => other,
    }
}

pub fn lasgn(name: &str, value: Node) -> Node {
    Node::LocalAssign(Box::new(LocalAssign {
        name: name.to_string(),
        value,
    }))
}

pub fn ivar(name: &str) -> Node {
    Node::IvarGet(IvarRef {
        name: name.to_string(),
    })
}

pub fn iasgn(name: &str, value: Node) -> Node {
    Node::IvarAssign(Box::new(IvarAssign {
        name: name.to_string(),
        value,
    }))
}

pub fn const_ref(name: &str) -> Node {
    const_path(&[name])
}

pub fn const_path(path: &[&str]) -> Node {
    Node::Const(cpath(path))
}

/// Lexically scoped constant path, as used by class and module headers.
pub fn cpath(path: &[&str]) -> ConstRef {
    ConstRef {
        scope: ConstScope::Lexical,
        path: path.iter().map(|s| s.to_string()).collect(),
    }
}

/// `::A::B`
pub fn root_cpath(path: &[&str]) -> ConstRef {
    ConstRef {
        scope: ConstScope::Root,
        path: path.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn casgn(target: ConstRef, value: Node) -> Node {
    Node::ConstAssign(Box::new(ConstAssign { target, value }))
}

pub fn params(required: &[&str]) -> Params {
    Params {
        required: required.iter().map(|s| s.to_string()).collect(),
        ..Params::default()
    }
}

pub fn opt(name: &str, default: Node) -> OptionalParam {
    OptionalParam {
        name: name.to_string(),
        default,
    }
}

pub fn def(name: &str, params: Params, def_body: Vec<Node>) -> Node {
    Node::Def(Box::new(Def {
        singleton: None,
        name: name.to_string(),
        params,
        body: Body { stmts: def_body },
    }))
}

/// `def receiver.name`
pub fn defs(receiver: Node, name: &str, params: Params, def_body: Vec<Node>) -> Node {
    Node::Def(Box::new(Def {
        singleton: Some(receiver),
        name: name.to_string(),
        params,
        body: Body { stmts: def_body },
    }))
}

pub fn class(name: &str, superclass: Option<Node>, class_body: Vec<Node>) -> Node {
    class_at(cpath(&[name]), superclass, class_body)
}

pub fn class_at(path: ConstRef, superclass: Option<Node>, class_body: Vec<Node>) -> Node {
    Node::Class(Box::new(ClassDef {
        path,
        superclass,
        body: Body { stmts: class_body },
    }))
}

pub fn module(name: &str, module_body: Vec<Node>) -> Node {
    Node::Module(Box::new(ModuleDef {
        path: cpath(&[name]),
        body: Body { stmts: module_body },
    }))
}

pub fn sclass(target: Node, sclass_body: Vec<Node>) -> Node {
    Node::SingletonClass(Box::new(SingletonClassDef {
        target,
        body: Body { stmts: sclass_body },
    }))
}

/// `if`/`elsif` chain; each pair is a condition and its body.
pub fn if_chain(branches: Vec<(Node, Vec<Node>)>, else_body: Option<Vec<Node>>) -> Node {
    Node::If(Box::new(If {
        branches: branches
            .into_iter()
            .map(|(condition, stmts)| IfBranch {
                condition,
                body: Body { stmts },
            })
            .collect(),
        else_body: else_body.map(|stmts| Body { stmts }),
    }))
}

pub fn if_else(condition: Node, then_body: Vec<Node>, else_body: Option<Vec<Node>>) -> Node {
    if_chain(vec![(condition, then_body)], else_body)
}

pub fn not(value: Node) -> Node {
    Node::Not(Box::new(Not { value }))
}

/// `super(args)` with explicit (possibly empty) arguments.
pub fn super_call(args: Vec<Node>) -> Node {
    Node::Super(Box::new(Super {
        args: Some(args),
        block: None,
    }))
}

/// Bare `super`, forwarding the current method's arguments.
pub fn zsuper() -> Node {
    Node::Super(Box::new(Super {
        args: None,
        block: None,
    }))
}

pub fn yield_(args: Vec<Node>) -> Node {
    Node::Yield(Yield { args })
}

fn jump(value: Option<Node>) -> Jump {
    Jump {
        value: value.map(Box::new),
    }
}

pub fn ret(value: Option<Node>) -> Node {
    Node::Return(jump(value))
}

pub fn brk(value: Option<Node>) -> Node {
    Node::Break(jump(value))
}

pub fn next(value: Option<Node>) -> Node {
    Node::Next(jump(value))
}

pub fn rescue(classes: Vec<Node>, binding: Option<&str>, rescue_body: Vec<Node>) -> RescueClause {
    RescueClause {
        classes,
        binding: binding.map(str::to_string),
        body: Body { stmts: rescue_body },
    }
}

pub fn begin(
    begin_body: Vec<Node>,
    rescues: Vec<RescueClause>,
    else_body: Option<Vec<Node>>,
    ensure_body: Option<Vec<Node>>,
) -> Node {
    Node::Begin(Box::new(Begin {
        body: Body { stmts: begin_body },
        rescues,
        else_body: else_body.map(|stmts| Body { stmts }),
        ensure_body: ensure_body.map(|stmts| Body { stmts }),
    }))
}
