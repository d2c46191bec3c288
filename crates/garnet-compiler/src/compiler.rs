//! Single-pass bytecode compiler for Garnet.
//!
//! Walks the AST once, emitting into a builder per instruction sequence and
//! recording catch-table regions as it goes. Nested sequences (methods,
//! blocks, class bodies, rescue handlers) are compiled recursively and
//! finalized before the enclosing sequence continues.

use std::mem;
use std::rc::Rc;

use garnet_ast::*;
use garnet_bytecode::{
    ArgsDescriptor, BuildError, CallFlags, CallInfo, CatchEntry, CatchKind, DefineClassKind,
    Instruction, InstructionSequence, IseqBuilder, IseqKind, Label, Literal, SpecialObject,
    ThrowKind,
};
use thiserror::Error;

use crate::scope::{Resolution, ScopeManager};

/// Compilation errors. Any error aborts the whole unit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("malformed {node}: {message}")]
    Malformed {
        node: &'static str,
        message: String,
    },

    #[error("`{0}` is a reserved word and cannot name a method")]
    ReservedMethodName(String),

    #[error("Invalid {0}")]
    InvalidJump(&'static str),

    #[error("Invalid return in class/module body")]
    InvalidReturn,

    #[error("Invalid retry outside of rescue clause")]
    InvalidRetry,

    #[error(transparent)]
    Build(#[from] BuildError),
}

impl CompileError {
    fn malformed(node: &'static str, message: impl Into<String>) -> Self {
        Self::Malformed {
            node,
            message: message.into(),
        }
    }
}

/// Compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Name of the top-level instruction sequence.
    pub name: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            name: "<main>".to_string(),
        }
    }
}

/// Words that cannot name a method unless listed in [`RESERVED_METHOD_NAMES`].
const RESERVED_WORDS: &[&str] = &[
    "BEGIN", "END", "__ENCODING__", "__FILE__", "__LINE__", "alias", "and", "begin", "break",
    "case", "class", "def", "defined?", "do", "else", "elsif", "end", "ensure", "false", "for",
    "if", "in", "module", "next", "nil", "not", "or", "redo", "rescue", "retry", "return",
    "self", "super", "then", "true", "undef", "unless", "until", "when", "while", "yield",
];

/// Reserved words accepted as method names.
const RESERVED_METHOD_NAMES: &[&str] = &["begin", "class", "end", "next", "then"];

type Result<T> = std::result::Result<T, CompileError>;

/// Per-sequence compilation state.
struct IseqContext {
    builder: IseqBuilder,
    /// Name blocks are reported "in", e.g. the method name.
    owner: String,
    /// Block nesting below the owner.
    block_level: usize,
    /// Ensure regions currently open in this sequence.
    ensure_depth: usize,
}

impl IseqContext {
    fn new(name: impl Into<String>, kind: IseqKind, owner: impl Into<String>) -> Self {
        Self {
            builder: IseqBuilder::new(name, kind),
            owner: owner.into(),
            block_level: 0,
            ensure_depth: 0,
        }
    }
}

/// Bytecode compiler for Garnet.
pub struct Compiler {
    ctx: IseqContext,
    scopes: ScopeManager,
    /// Shared by every sequence in the unit so label names are unique.
    next_label: u32,
}

impl Compiler {
    /// Create a new compiler.
    pub fn new(config: CompilerConfig) -> Self {
        let owner = config.name.clone();
        Self {
            ctx: IseqContext::new(config.name, IseqKind::Top, owner),
            scopes: ScopeManager::new(IseqKind::Top),
            next_label: 0,
        }
    }

    /// Compile a program into its top-level instruction sequence.
    pub fn compile(mut self, program: &Node) -> Result<Rc<InstructionSequence>> {
        self.compile_node(program, true)?;
        self.emit(Instruction::Leave);

        let mut builder = self.ctx.builder;
        builder.locals = self.scopes.exit();
        Ok(Rc::new(builder.finish()?))
    }

    // ===========================================================================
    // Sequences
    // ===========================================================================

    /// Compile a nested sequence with its own builder and local table.
    fn child<F>(&mut self, ctx: IseqContext, f: F) -> Result<Rc<InstructionSequence>>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let kind = ctx.builder.kind;
        let parent = mem::replace(&mut self.ctx, ctx);
        self.scopes.enter(kind);

        let result = f(self);

        let locals = self.scopes.exit();
        let child = mem::replace(&mut self.ctx, parent);
        result?;

        let mut builder = child.builder;
        builder.locals = locals;
        log::trace!("compiled {} sequence {}", kind, builder.name);
        Ok(Rc::new(builder.finish()?))
    }

    fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn kind(&self) -> IseqKind {
        self.ctx.builder.kind
    }

    // ===========================================================================
    // Nodes
    // ===========================================================================

    /// Compile a node. When `used` is false the node leaves nothing on the
    /// stack.
    fn compile_node(&mut self, node: &Node, used: bool) -> Result<()> {
        match node {
            Node::Body(body) => self.compile_body(body, used),
            Node::Nil => {
                if used {
                    self.emit(Instruction::PutNil);
                }
                Ok(())
            }
            Node::True => self.compile_literal(Literal::Bool(true), used),
            Node::False => self.compile_literal(Literal::Bool(false), used),
            Node::SelfRef => {
                if used {
                    self.emit(Instruction::PutSelf);
                }
                Ok(())
            }
            Node::Integer(lit) => self.compile_literal(Literal::Integer(lit.value), used),
            Node::Float(lit) => self.compile_literal(Literal::Float(lit.value), used),
            Node::Str(lit) => {
                if used {
                    self.emit(Instruction::PutString(lit.value.as_str().into()));
                }
                Ok(())
            }
            Node::Symbol(lit) => {
                self.compile_literal(Literal::Symbol(lit.name.as_str().into()), used)
            }
            Node::Array(lit) => self.compile_array(lit, used),
            Node::Call(call) => self.compile_call(call, used),
            Node::LocalAssign(assign) => self.compile_local_assign(assign, used),
            Node::IvarGet(ivar) => {
                self.emit(Instruction::GetInstanceVariable(ivar.name.as_str().into()));
                self.pop_unless(used);
                Ok(())
            }
            Node::IvarAssign(assign) => {
                self.compile_node(&assign.value, true)?;
                if used {
                    self.emit(Instruction::Dup);
                }
                self.emit(Instruction::SetInstanceVariable(assign.name.as_str().into()));
                Ok(())
            }
            Node::Const(cref) => self.compile_const(cref, used),
            Node::ConstAssign(assign) => self.compile_const_assign(assign, used),
            Node::Def(def) => self.compile_def(def, used),
            Node::Class(class) => self.compile_class(class, used),
            Node::Module(module) => self.compile_module(module, used),
            Node::SingletonClass(sclass) => self.compile_singleton_class(sclass, used),
            Node::If(expr) => self.compile_if(expr, used),
            Node::Not(not) => {
                self.compile_node(&not.value, true)?;
                self.emit(Instruction::Send(CallInfo::new("!", 0)));
                self.pop_unless(used);
                Ok(())
            }
            Node::Super(sup) => self.compile_super(sup, used),
            Node::Yield(y) => {
                for arg in &y.args {
                    self.compile_node(arg, true)?;
                }
                self.emit(Instruction::InvokeBlock { argc: y.args.len() });
                self.pop_unless(used);
                Ok(())
            }
            Node::Return(jump) => self.compile_return(jump, used),
            Node::Break(jump) => self.compile_block_jump(jump, ThrowKind::Break, "break", used),
            Node::Next(jump) => self.compile_block_jump(jump, ThrowKind::Next, "next", used),
            Node::Redo => {
                self.check_in_block("redo")?;
                self.emit(Instruction::PutNil);
                self.emit_throw(ThrowKind::Redo, used);
                Ok(())
            }
            Node::Retry => {
                if self.kind() != IseqKind::Rescue {
                    return Err(CompileError::InvalidRetry);
                }
                self.emit(Instruction::PutNil);
                self.emit_throw(ThrowKind::Retry, used);
                Ok(())
            }
            Node::Begin(begin) => self.compile_begin(begin, used),
        }
    }

    /// Compile statements in order; only the last one may leave a value.
    fn compile_body(&mut self, body: &Body, used: bool) -> Result<()> {
        let Some((last, init)) = body.stmts.split_last() else {
            if used {
                self.emit(Instruction::PutNil);
            }
            return Ok(());
        };
        for stmt in init {
            self.compile_node(stmt, false)?;
        }
        self.compile_node(last, used)
    }

    fn compile_literal(&mut self, lit: Literal, used: bool) -> Result<()> {
        if used {
            self.emit(Instruction::PutObject(lit));
        }
        Ok(())
    }

    fn compile_array(&mut self, lit: &ArrayLit, used: bool) -> Result<()> {
        for item in &lit.items {
            self.compile_node(item, true)?;
        }
        self.emit(Instruction::NewArray(lit.items.len()));
        self.pop_unless(used);
        Ok(())
    }

    // ===========================================================================
    // Variables
    // ===========================================================================

    fn compile_local_assign(&mut self, assign: &LocalAssign, used: bool) -> Result<()> {
        if assign.name.is_empty() {
            return Err(CompileError::malformed("LocalAssign", "empty variable name"));
        }
        let res = self.scopes.assign(&assign.name);
        self.compile_node(&assign.value, true)?;
        if used {
            self.emit(Instruction::Dup);
        }
        self.emit(Instruction::SetLocal {
            index: res.index,
            level: res.level,
        });
        Ok(())
    }

    fn get_local(&mut self, res: Resolution) {
        self.emit(Instruction::GetLocal {
            index: res.index,
            level: res.level,
        });
    }

    // ===========================================================================
    // Constants
    // ===========================================================================

    /// Push the base for the first segment of a constant path.
    fn compile_const_scope(&mut self, scope: &ConstScope) -> Result<()> {
        match scope {
            ConstScope::Lexical => {
                self.emit(Instruction::PutNil);
            }
            ConstScope::Root => {
                self.emit(Instruction::PutSpecialObject(SpecialObject::Object));
            }
            ConstScope::Expr(expr) => self.compile_node(expr, true)?,
        }
        Ok(())
    }

    /// Push the namespace a definition or assignment of `cref`'s last segment
    /// targets.
    fn compile_const_base(&mut self, cref: &ConstRef) -> Result<()> {
        let Some((_, prefix)) = cref.path.split_last() else {
            return Err(CompileError::malformed("Const", "empty constant path"));
        };
        if prefix.is_empty() {
            match &cref.scope {
                ConstScope::Lexical => {
                    self.emit(Instruction::PutSpecialObject(SpecialObject::CBase));
                }
                scope => self.compile_const_scope(scope)?,
            }
            return Ok(());
        }
        self.compile_const_scope(&cref.scope)?;
        for segment in prefix {
            self.emit(Instruction::GetConstant(segment.as_str().into()));
        }
        Ok(())
    }

    fn compile_const(&mut self, cref: &ConstRef, used: bool) -> Result<()> {
        if cref.path.is_empty() || cref.path.iter().any(String::is_empty) {
            return Err(CompileError::malformed("Const", "empty constant path"));
        }
        self.compile_const_scope(&cref.scope)?;
        for segment in &cref.path {
            self.emit(Instruction::GetConstant(segment.as_str().into()));
        }
        self.pop_unless(used);
        Ok(())
    }

    fn compile_const_assign(&mut self, assign: &ConstAssign, used: bool) -> Result<()> {
        let name = const_name(&assign.target)?;
        self.compile_node(&assign.value, true)?;
        if used {
            self.emit(Instruction::Dup);
        }
        self.compile_const_base(&assign.target)?;
        self.emit(Instruction::SetConstant(name.into()));
        Ok(())
    }

    // ===========================================================================
    // Conditionals
    // ===========================================================================

    fn compile_if(&mut self, expr: &If, used: bool) -> Result<()> {
        if expr.branches.is_empty() {
            return Err(CompileError::malformed("If", "no branches"));
        }
        let base = self.depth();
        let end = self.new_label();

        for branch in &expr.branches {
            let next = self.new_label();
            self.compile_node(&branch.condition, true)?;
            self.emit(Instruction::BranchUnless(next));
            self.compile_branch_body(Some(&branch.body), used)?;
            self.emit(Instruction::Jump(end));
            self.place(next, base);
        }

        self.compile_branch_body(expr.else_body.as_ref(), used)?;
        self.place(end, base + usize::from(used));
        Ok(())
    }

    /// Every branch leaves a value; an unused conditional pops it per branch.
    fn compile_branch_body(&mut self, body: Option<&Body>, used: bool) -> Result<()> {
        match body {
            Some(body) => self.compile_body(body, true)?,
            None => {
                self.emit(Instruction::PutNil);
            }
        }
        self.pop_unless(used);
        Ok(())
    }

    // ===========================================================================
    // Calls
    // ===========================================================================

    fn compile_call(&mut self, call: &Call, used: bool) -> Result<()> {
        if call.name.is_empty() {
            return Err(CompileError::malformed("Call", "empty method name"));
        }
        if call.is_vcall() {
            if let Some(res) = self.scopes.resolve(&call.name) {
                if used {
                    self.get_local(res);
                }
                return Ok(());
            }
        }

        let sp = self.depth();
        let mut ci = CallInfo::new(&call.name, call.args.len());
        match &call.receiver {
            Some(receiver) => self.compile_node(receiver, true)?,
            None => {
                self.emit(Instruction::PutSelf);
                ci.flags.fcall = true;
                ci.flags.vcall = call.is_vcall();
            }
        }
        for arg in &call.args {
            self.compile_node(arg, true)?;
        }
        if let Some(block_arg) = &call.block_arg {
            self.compile_node(block_arg, true)?;
            ci.flags.blockarg = true;
        }
        if let Some(block) = &call.block {
            ci.block = Some(self.compile_block(block)?);
        }

        self.emit_call(Instruction::Send(ci), sp);
        self.pop_unless(used);
        Ok(())
    }

    fn compile_super(&mut self, sup: &Super, used: bool) -> Result<()> {
        let sp = self.depth();
        self.emit(Instruction::PutSelf);

        let args: &[Node] = sup.args.as_deref().unwrap_or(&[]);
        for arg in args {
            self.compile_node(arg, true)?;
        }
        let mut ci = CallInfo::new("super", args.len());
        ci.flags = CallFlags {
            fcall: true,
            zsuper: sup.args.is_none(),
            ..CallFlags::default()
        };
        if let Some(block) = &sup.block {
            ci.block = Some(self.compile_block(block)?);
        }

        self.emit_call(Instruction::InvokeSuper(ci), sp);
        self.pop_unless(used);
        Ok(())
    }

    /// Emit a call instruction. A call carrying a block literal gets a break
    /// region spanning exactly the call, continuing right after it.
    fn emit_call(&mut self, insn: Instruction, sp: usize) {
        let has_block = matches!(
            &insn,
            Instruction::Send(ci) | Instruction::InvokeSuper(ci) if ci.block.is_some()
        );
        if !has_block {
            self.emit(insn);
            return;
        }
        let start = self.new_label();
        let end = self.new_label();
        self.ctx.builder.place(start);
        self.emit(insn);
        self.ctx.builder.place(end);
        self.ctx
            .builder
            .add_catch_entry(CatchEntry::new(CatchKind::Break, start, end, end, sp));
    }

    fn compile_block(&mut self, block: &Block) -> Result<Rc<InstructionSequence>> {
        let owner = self.ctx.owner.clone();
        let level = self.ctx.block_level + 1;
        let name = if level == 1 {
            format!("block in {}", owner)
        } else {
            format!("block ({} levels) in {}", level, owner)
        };
        let mut ctx = IseqContext::new(name, IseqKind::Block, owner);
        ctx.block_level = level;

        self.child(ctx, |c| {
            c.compile_params(&block.params)?;
            let begin = c.new_label();
            let end = c.new_label();
            c.ctx.builder.place(begin);
            c.compile_body(&block.body, true)?;
            c.ctx.builder.place(end);
            c.emit(Instruction::Leave);

            let b = &mut c.ctx.builder;
            b.add_catch_entry(CatchEntry::new(CatchKind::Redo, begin, end, begin, 0));
            b.add_catch_entry(CatchEntry::new(CatchKind::Next, begin, end, end, 0));
            Ok(())
        })
    }

    // ===========================================================================
    // Definitions
    // ===========================================================================

    fn compile_def(&mut self, def: &Def, used: bool) -> Result<()> {
        check_method_name(&def.name)?;
        match &def.singleton {
            Some(receiver) => self.compile_node(receiver, true)?,
            None => {
                self.emit(Instruction::PutSpecialObject(SpecialObject::CBase));
            }
        }

        let ctx = IseqContext::new(def.name.as_str(), IseqKind::Method, def.name.as_str());
        let iseq = self.child(ctx, |c| {
            c.compile_params(&def.params)?;
            c.compile_body(&def.body, true)?;
            c.emit(Instruction::Leave);
            Ok(())
        })?;

        self.emit(Instruction::PutIseq(iseq));
        self.emit(Instruction::DefineMethod {
            name: def.name.as_str().into(),
            singleton: def.singleton.is_some(),
        });
        if used {
            self.emit(Instruction::PutNil);
        }
        Ok(())
    }

    /// Declare parameters and emit the optional-default prologue.
    fn compile_params(&mut self, params: &Params) -> Result<()> {
        let mut args = ArgsDescriptor {
            required: params.required.len(),
            optional: params.optional.len(),
            ..ArgsDescriptor::default()
        };
        for name in &params.required {
            self.declare_param(name)?;
        }
        let optional: Vec<Resolution> = params
            .optional
            .iter()
            .map(|p| self.declare_param(&p.name))
            .collect::<Result<_>>()?;
        if let Some(rest) = &params.rest {
            args.rest = Some(self.declare_param(rest)?.index);
        }
        if let Some(block) = &params.block {
            args.block = Some(self.declare_param(block)?.index);
        }

        if !params.optional.is_empty() {
            for (param, res) in params.optional.iter().zip(optional) {
                let label = self.new_label();
                self.ctx.builder.place(label);
                args.opt_labels.push(label);
                self.compile_node(&param.default, true)?;
                self.emit(Instruction::SetLocal {
                    index: res.index,
                    level: 0,
                });
            }
            let body = self.new_label();
            self.ctx.builder.place(body);
            args.opt_labels.push(body);
        }

        self.ctx.builder.args = args;
        Ok(())
    }

    fn declare_param(&mut self, name: &str) -> Result<Resolution> {
        if name.is_empty() {
            return Err(CompileError::malformed("Params", "empty parameter name"));
        }
        Ok(self.scopes.declare(name))
    }

    fn compile_class(&mut self, class: &ClassDef, used: bool) -> Result<()> {
        let name = const_name(&class.path)?;
        self.compile_const_base(&class.path)?;
        match &class.superclass {
            Some(superclass) => self.compile_node(superclass, true)?,
            None => {
                self.emit(Instruction::PutNil);
            }
        }
        let owner = format!("<class:{}>", name);
        let iseq = self.compile_class_body(&owner, IseqKind::Class, &class.body)?;
        self.emit(Instruction::DefineClass {
            name: name.into(),
            iseq,
            kind: DefineClassKind::Class,
        });
        self.pop_unless(used);
        Ok(())
    }

    fn compile_module(&mut self, module: &ModuleDef, used: bool) -> Result<()> {
        let name = const_name(&module.path)?;
        self.compile_const_base(&module.path)?;
        self.emit(Instruction::PutNil);
        let owner = format!("<module:{}>", name);
        let iseq = self.compile_class_body(&owner, IseqKind::Class, &module.body)?;
        self.emit(Instruction::DefineClass {
            name: name.into(),
            iseq,
            kind: DefineClassKind::Module,
        });
        self.pop_unless(used);
        Ok(())
    }

    fn compile_singleton_class(&mut self, sclass: &SingletonClassDef, used: bool) -> Result<()> {
        self.compile_node(&sclass.target, true)?;
        self.emit(Instruction::PutNil);
        let iseq =
            self.compile_class_body("singleton class", IseqKind::SingletonClass, &sclass.body)?;
        self.emit(Instruction::DefineClass {
            name: "singletonclass".into(),
            iseq,
            kind: DefineClassKind::SingletonClass,
        });
        self.pop_unless(used);
        Ok(())
    }

    fn compile_class_body(
        &mut self,
        name: &str,
        kind: IseqKind,
        body: &Body,
    ) -> Result<Rc<InstructionSequence>> {
        self.child(IseqContext::new(name, kind, name), |c| {
            c.compile_body(body, false)?;
            c.emit(Instruction::PutNil);
            c.emit(Instruction::Leave);
            Ok(())
        })
    }

    // ===========================================================================
    // Jumps
    // ===========================================================================

    fn compile_return(&mut self, jump: &Jump, used: bool) -> Result<()> {
        let mut through_block = false;
        for kind in self.scopes.kinds() {
            match kind {
                IseqKind::Block | IseqKind::Rescue => through_block = true,
                IseqKind::Method | IseqKind::Top => break,
                IseqKind::Class | IseqKind::SingletonClass => {
                    return Err(CompileError::InvalidReturn);
                }
            }
        }

        self.compile_jump_value(jump)?;
        if through_block || self.ctx.ensure_depth > 0 {
            self.emit_throw(ThrowKind::Return, used);
        } else {
            self.emit(Instruction::Leave);
            self.assume_value(used);
        }
        Ok(())
    }

    fn compile_block_jump(
        &mut self,
        jump: &Jump,
        kind: ThrowKind,
        keyword: &'static str,
        used: bool,
    ) -> Result<()> {
        self.check_in_block(keyword)?;
        self.compile_jump_value(jump)?;
        self.emit_throw(kind, used);
        Ok(())
    }

    fn compile_jump_value(&mut self, jump: &Jump) -> Result<()> {
        match &jump.value {
            Some(value) => self.compile_node(value, true),
            None => {
                self.emit(Instruction::PutNil);
                Ok(())
            }
        }
    }

    /// break, next and redo are only meaningful inside a block, possibly
    /// through rescue bodies.
    fn check_in_block(&self, keyword: &'static str) -> Result<()> {
        for kind in self.scopes.kinds() {
            match kind {
                IseqKind::Rescue => continue,
                IseqKind::Block => return Ok(()),
                _ => break,
            }
        }
        Err(CompileError::InvalidJump(keyword))
    }

    fn emit_throw(&mut self, kind: ThrowKind, used: bool) {
        self.emit(Instruction::Throw(kind));
        self.assume_value(used);
    }

    /// Code after a throw or leave is unreachable; keep the simulated depth
    /// consistent with an expression that produced a value.
    fn assume_value(&mut self, used: bool) {
        if used {
            let depth = self.depth();
            self.ctx.builder.set_depth(depth + 1);
        }
    }

    // ===========================================================================
    // Exceptions
    // ===========================================================================

    fn compile_begin(&mut self, begin: &Begin, used: bool) -> Result<()> {
        if begin.rescues.is_empty() && begin.ensure_body.is_none() {
            match &begin.else_body {
                Some(else_body) => {
                    self.compile_body(&begin.body, false)?;
                    self.compile_body(else_body, used)?;
                }
                None => self.compile_body(&begin.body, used)?,
            }
            return Ok(());
        }

        let base = self.depth();
        let ensure = begin
            .ensure_body
            .as_ref()
            .map(|body| (body, self.new_label(), self.new_label(), self.new_label()));

        if let Some((_, ensure_start, _, _)) = ensure {
            self.ctx.builder.place(ensure_start);
            self.ctx.ensure_depth += 1;
        }

        if begin.rescues.is_empty() {
            self.compile_body(&begin.body, true)?;
            if let Some(else_body) = &begin.else_body {
                self.emit(Instruction::Pop);
                self.compile_body(else_body, true)?;
            }
        } else {
            let rescue_start = self.new_label();
            let rescue_end = self.new_label();
            let rescue_cont = self.new_label();

            self.ctx.builder.place(rescue_start);
            self.compile_body(&begin.body, true)?;
            self.ctx.builder.place(rescue_end);
            if let Some(else_body) = &begin.else_body {
                self.emit(Instruction::Pop);
                self.compile_body(else_body, true)?;
            }
            self.place(rescue_cont, base + 1);

            let handler = self.compile_rescue(&begin.rescues)?;
            let b = &mut self.ctx.builder;
            b.add_catch_entry(
                CatchEntry::new(CatchKind::Rescue, rescue_start, rescue_end, rescue_cont, base)
                    .with_iseq(handler),
            );
            b.add_catch_entry(CatchEntry::new(
                CatchKind::Retry,
                rescue_start,
                rescue_end,
                rescue_start,
                base,
            ));
        }

        if let Some((body, ensure_start, ensure_end, ensure_handler)) = ensure {
            self.ctx.ensure_depth -= 1;
            self.ctx.builder.place(ensure_end);
            self.compile_body(body, true)?;
            self.emit(Instruction::Pop);
            let done = self.new_label();
            self.emit(Instruction::Jump(done));

            self.place(ensure_handler, base);
            self.compile_body(body, true)?;
            self.emit(Instruction::Pop);
            self.emit(Instruction::EndEnsure);
            self.place(done, base + 1);

            self.ctx.builder.add_catch_entry(CatchEntry::new(
                CatchKind::Ensure,
                ensure_start,
                ensure_end,
                ensure_handler,
                base,
            ));
        }

        self.pop_unless(used);
        Ok(())
    }

    /// Build the handler sequence for a list of rescue clauses. The raised
    /// exception arrives in slot 0; no matching clause re-raises it.
    fn compile_rescue(&mut self, clauses: &[RescueClause]) -> Result<Rc<InstructionSequence>> {
        let name = format!("rescue in {}", self.ctx.owner);
        let ctx = IseqContext::new(name, IseqKind::Rescue, self.ctx.owner.clone());
        self.child(ctx, |c| {
            let errinfo = c.scopes.declare("$!");
            c.ctx.builder.args.required = 1;

            for clause in clauses {
                let matched = c.new_label();
                let next = c.new_label();
                if clause.classes.is_empty() {
                    c.get_local(errinfo);
                    c.compile_const(&standard_error(), true)?;
                    c.emit(Instruction::CheckMatch);
                    c.emit(Instruction::BranchIf(matched));
                } else {
                    for class in &clause.classes {
                        c.get_local(errinfo);
                        c.compile_node(class, true)?;
                        c.emit(Instruction::CheckMatch);
                        c.emit(Instruction::BranchIf(matched));
                    }
                }
                c.emit(Instruction::Jump(next));

                c.place(matched, 0);
                if let Some(binding) = &clause.binding {
                    let res = c.scopes.assign(binding);
                    c.get_local(errinfo);
                    c.emit(Instruction::SetLocal {
                        index: res.index,
                        level: res.level,
                    });
                }
                c.compile_body(&clause.body, true)?;
                c.emit(Instruction::Leave);
                c.place(next, 0);
            }

            c.get_local(errinfo);
            c.emit(Instruction::Throw(ThrowKind::Raise));
            Ok(())
        })
    }

    // ===========================================================================
    // Helpers
    // ===========================================================================

    fn emit(&mut self, insn: Instruction) -> usize {
        self.ctx.builder.emit(insn)
    }

    fn pop_unless(&mut self, used: bool) {
        if !used {
            self.emit(Instruction::Pop);
        }
    }

    fn depth(&self) -> usize {
        self.ctx.builder.depth()
    }

    /// Place a label reached by a jump, with the stack depth known there.
    fn place(&mut self, label: Label, depth: usize) {
        self.ctx.builder.place(label);
        self.ctx.builder.set_depth(depth);
    }
}

fn const_name(cref: &ConstRef) -> Result<&str> {
    match cref.last() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(CompileError::malformed("Const", "empty constant path")),
    }
}

fn standard_error() -> ConstRef {
    ConstRef {
        scope: ConstScope::Lexical,
        path: vec!["StandardError".to_string()],
    }
}

fn check_method_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CompileError::malformed("Def", "empty method name"));
    }
    if RESERVED_WORDS.contains(&name) && !RESERVED_METHOD_NAMES.contains(&name) {
        return Err(CompileError::ReservedMethodName(name.to_string()));
    }
    Ok(())
}

/// Compile a program with the default configuration.
pub fn compile(program: &Node) -> Result<Rc<InstructionSequence>> {
    Compiler::new(CompilerConfig::default()).compile(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use garnet_ast::build::*;
    use garnet_bytecode::CatchKind;

    fn compile_ok(program: Node) -> Rc<InstructionSequence> {
        compile(&program).expect("compilation failed")
    }

    fn count(iseq: &InstructionSequence, f: impl Fn(&Instruction) -> bool) -> usize {
        iseq.instructions.iter().filter(|i| f(i)).count()
    }

    fn child<'a>(iseq: &'a InstructionSequence, name: &str) -> &'a InstructionSequence {
        iseq.instructions
            .iter()
            .filter_map(Instruction::child_iseq)
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("no child named {}", name))
    }

    #[test]
    fn test_unused_literal_is_elided() {
        let iseq = compile_ok(body(vec![int(1), int(2)]));
        assert_eq!(
            iseq.instructions,
            vec![Instruction::PutObject(Literal::Integer(2)), Instruction::Leave]
        );
        assert_eq!(iseq.max_stack, 1);
    }

    #[test]
    fn test_local_assign_and_read() {
        let iseq = compile_ok(body(vec![lasgn("a", int(1)), vcall("a")]));
        assert_eq!(
            iseq.instructions,
            vec![
                Instruction::PutObject(Literal::Integer(1)),
                Instruction::SetLocal { index: 0, level: 0 },
                Instruction::GetLocal { index: 0, level: 0 },
                Instruction::Leave,
            ]
        );
        assert_eq!(iseq.locals, vec!["a".to_string()]);
    }

    #[test]
    fn test_unknown_identifier_is_a_call() {
        let iseq = compile_ok(vcall("foo"));
        assert_eq!(iseq.instructions[0], Instruction::PutSelf);
        let Instruction::Send(ci) = &iseq.instructions[1] else {
            panic!("expected send, got {}", iseq.instructions[1]);
        };
        assert_eq!(&*ci.name, "foo");
        assert!(ci.flags.fcall && ci.flags.vcall);
    }

    #[test]
    fn test_unused_call_is_popped() {
        let iseq = compile_ok(body(vec![fcall("foo", vec![]), int(1)]));
        assert_eq!(iseq.instructions[2], Instruction::Pop);
    }

    #[test]
    fn test_if_elsif_else_shape() {
        let program = if_chain(
            vec![
                (vcall("a"), vec![int(1)]),
                (vcall("b"), vec![int(2)]),
                (vcall("c"), vec![int(3)]),
            ],
            Some(vec![int(4)]),
        );
        let iseq = compile_ok(program);
        assert_eq!(count(&iseq, |i| matches!(i, Instruction::BranchUnless(_))), 3);

        let jumps: Vec<Label> = iseq
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Jump(l) => Some(*l),
                _ => None,
            })
            .collect();
        assert_eq!(jumps.len(), 3);
        assert!(jumps.iter().all(|l| *l == jumps[0]));
        assert_eq!(iseq.offset(jumps[0]), iseq.instructions.len() - 1);
        assert_eq!(iseq.max_stack, 1);
    }

    #[test]
    fn test_if_without_else_synthesizes_nil() {
        let iseq = compile_ok(if_else(vcall("a"), vec![int(1)], None));
        let n = iseq.instructions.len();
        assert_eq!(iseq.instructions[n - 2], Instruction::PutNil);
    }

    #[test]
    fn test_unused_if_pops_after_every_branch() {
        let program = body(vec![if_else(vcall("a"), vec![int(1)], Some(vec![int(2)])), nil()]);
        let iseq = compile_ok(program);
        let Instruction::BranchUnless(next) = iseq.instructions[2] else {
            panic!("expected branchunless, got {}", iseq.instructions[2]);
        };
        let Instruction::Jump(end) = iseq.instructions[5] else {
            panic!("expected jump, got {}", iseq.instructions[5]);
        };
        assert_eq!(
            iseq.instructions[3..],
            [
                Instruction::PutObject(Literal::Integer(1)),
                Instruction::Pop,
                Instruction::Jump(end),
                Instruction::PutObject(Literal::Integer(2)),
                Instruction::Pop,
                Instruction::PutNil,
                Instruction::Leave,
            ]
        );
        assert_eq!(iseq.offset(next), 6);
        assert_eq!(iseq.offset(end), 8);
        assert_eq!(iseq.max_stack, 1);
    }

    #[test]
    fn test_unused_if_without_else_pops_synthesized_nil() {
        let program = body(vec![if_else(vcall("a"), vec![int(1)], None), int(3)]);
        let iseq = compile_ok(program);
        assert_eq!(count(&iseq, |i| matches!(i, Instruction::Pop)), 2);
        assert_eq!(count(&iseq, |i| matches!(i, Instruction::PutNil)), 1);
    }

    #[test]
    fn test_constants() {
        let iseq = compile_ok(const_path(&["A", "B"]));
        assert_eq!(
            iseq.instructions,
            vec![
                Instruction::PutNil,
                Instruction::GetConstant("A".into()),
                Instruction::GetConstant("B".into()),
                Instruction::Leave,
            ]
        );

        let iseq = compile_ok(Node::Const(root_cpath(&["A"])));
        assert_eq!(
            iseq.instructions[0],
            Instruction::PutSpecialObject(SpecialObject::Object)
        );
    }

    #[test]
    fn test_constant_assignment() {
        let iseq = compile_ok(casgn(cpath(&["X"]), int(1)));
        assert_eq!(
            iseq.instructions,
            vec![
                Instruction::PutObject(Literal::Integer(1)),
                Instruction::Dup,
                Instruction::PutSpecialObject(SpecialObject::CBase),
                Instruction::SetConstant("X".into()),
                Instruction::Leave,
            ]
        );
    }

    #[test]
    fn test_method_args_descriptor() {
        let mut p = params(&["a", "b"]);
        p.optional = vec![opt("c", int(1)), opt("d", int(2))];
        p.rest = Some("rest".to_string());
        p.block = Some("blk".to_string());
        let iseq = compile_ok(def("foo", p, vec![vcall("a")]));

        let method = child(&iseq, "foo");
        assert_eq!(method.kind, IseqKind::Method);
        assert_eq!(method.args.required, 2);
        assert_eq!(method.args.optional, 2);
        assert_eq!(method.args.rest, Some(4));
        assert_eq!(method.args.block, Some(5));
        assert_eq!(method.args.opt_labels.len(), 3);
        assert_eq!(method.locals, vec!["a", "b", "c", "d", "rest", "blk"]);

        // Each default is preceded by its label; the last marks the body.
        assert_eq!(method.offset(method.args.opt_labels[0]), 0);
        assert_eq!(method.offset(method.args.opt_labels[1]), 2);
        assert_eq!(method.offset(method.args.opt_labels[2]), 4);
    }

    #[test]
    fn test_def_shape() {
        let iseq = compile_ok(def("foo", params(&[]), vec![]));
        assert_eq!(
            iseq.instructions[0],
            Instruction::PutSpecialObject(SpecialObject::CBase)
        );
        assert!(matches!(iseq.instructions[1], Instruction::PutIseq(_)));
        assert_eq!(
            iseq.instructions[2],
            Instruction::DefineMethod {
                name: "foo".into(),
                singleton: false
            }
        );
        assert_eq!(iseq.instructions[3], Instruction::PutNil);
    }

    #[test]
    fn test_reserved_method_names() {
        assert!(compile(&def("end", params(&[]), vec![])).is_ok());
        assert!(compile(&def("then", params(&[]), vec![])).is_ok());
        assert_eq!(
            compile(&def("while", params(&[]), vec![])).unwrap_err(),
            CompileError::ReservedMethodName("while".to_string())
        );
    }

    #[test]
    fn test_method_locals_do_not_leak() {
        let program = body(vec![
            lasgn("a", int(1)),
            def("foo", params(&[]), vec![vcall("a")]),
        ]);
        let iseq = compile_ok(program);
        let method = child(&iseq, "foo");
        assert!(matches!(method.instructions[1], Instruction::Send(_)));
    }

    #[test]
    fn test_class_body() {
        let iseq = compile_ok(class("Foo", None, vec![int(1)]));
        let Instruction::DefineClass { name, iseq: body, kind } = &iseq.instructions[2] else {
            panic!("expected defineclass");
        };
        assert_eq!(&**name, "Foo");
        assert_eq!(*kind, DefineClassKind::Class);
        assert_eq!(body.name, "<class:Foo>");
        assert_eq!(
            body.instructions,
            vec![Instruction::PutNil, Instruction::Leave]
        );
    }

    #[test]
    fn test_nested_class_path() {
        let iseq = compile_ok(class_at(cpath(&["A", "B"]), None, vec![]));
        assert_eq!(iseq.instructions[0], Instruction::PutNil);
        assert_eq!(iseq.instructions[1], Instruction::GetConstant("A".into()));
        assert!(matches!(
            &iseq.instructions[3],
            Instruction::DefineClass { name, .. } if &**name == "B"
        ));
    }

    #[test]
    fn test_block_catch_entries() {
        let program = def(
            "run",
            params(&[]),
            vec![with_block(
                call(vcall("list"), "each", vec![]),
                params(&["x"]),
                vec![with_block(fcall("tap", vec![]), params(&[]), vec![vcall("x")])],
            )],
        );
        let iseq = compile_ok(program);
        let method = child(&iseq, "run");

        // Break region spans exactly the send carrying the block.
        assert_eq!(method.catch_table.len(), 1);
        let entry = &method.catch_table[0];
        assert_eq!(entry.kind, CatchKind::Break);
        assert_eq!(entry.sp, 0);
        let send_at = method.offset(entry.start);
        assert!(matches!(method.instructions[send_at], Instruction::Send(_)));
        assert_eq!(method.offset(entry.end), send_at + 1);
        assert_eq!(entry.cont, entry.end);

        let block = child(method, "block in run");
        assert_eq!(block.kind, IseqKind::Block);
        let kinds: Vec<CatchKind> = block.catch_table.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![CatchKind::Break, CatchKind::Redo, CatchKind::Next]);

        let inner = child(block, "block (2 levels) in run");
        assert_eq!(
            inner.instructions[0],
            Instruction::GetLocal { index: 0, level: 1 }
        );
    }

    #[test]
    fn test_return_placement() {
        let iseq = compile_ok(def("foo", params(&[]), vec![ret(Some(int(1)))]));
        let method = child(&iseq, "foo");
        assert_eq!(method.instructions[1], Instruction::Leave);

        let program = def(
            "foo",
            params(&[]),
            vec![with_block(fcall("each", vec![]), params(&[]), vec![ret(None)])],
        );
        let iseq = compile_ok(program);
        let block = child(child(&iseq, "foo"), "block in foo");
        assert!(block.instructions.contains(&Instruction::Throw(ThrowKind::Return)));

        assert_eq!(
            compile(&class("Foo", None, vec![ret(None)])).unwrap_err(),
            CompileError::InvalidReturn
        );
    }

    #[test]
    fn test_invalid_jumps() {
        assert_eq!(
            compile(&brk(None)).unwrap_err(),
            CompileError::InvalidJump("break")
        );
        assert_eq!(
            compile(&def("f", params(&[]), vec![next(None)])).unwrap_err(),
            CompileError::InvalidJump("next")
        );
        assert_eq!(compile(&Node::Retry).unwrap_err(), CompileError::InvalidRetry);
        assert!(compile(&with_block(fcall("loop", vec![]), params(&[]), vec![brk(None)])).is_ok());
    }

    #[test]
    fn test_super_forms() {
        let iseq = compile_ok(def("foo", params(&["a"]), vec![zsuper()]));
        let method = child(&iseq, "foo");
        assert_eq!(method.instructions[0], Instruction::PutSelf);
        let Instruction::InvokeSuper(ci) = &method.instructions[1] else {
            panic!("expected invokesuper");
        };
        assert!(ci.flags.zsuper);
        assert_eq!(ci.argc, 0);

        let iseq = compile_ok(def("foo", params(&[]), vec![super_call(vec![int(1)])]));
        let Instruction::InvokeSuper(ci) = &child(&iseq, "foo").instructions[2] else {
            panic!("expected invokesuper");
        };
        assert!(!ci.flags.zsuper);
        assert_eq!(ci.argc, 1);
    }

    #[test]
    fn test_begin_rescue_ensure_layout() {
        let program = body(vec![
            begin(
                vec![fcall("risky", vec![])],
                vec![rescue(vec![const_ref("ArgumentError")], Some("e"), vec![vcall("e")])],
                Some(vec![int(2)]),
                Some(vec![fcall("cleanup", vec![])]),
            ),
            nil(),
        ]);
        let iseq = compile_ok(program);

        let kinds: Vec<CatchKind> = iseq.catch_table.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![CatchKind::Rescue, CatchKind::Retry, CatchKind::Ensure]);
        assert!(iseq.catch_table.iter().all(|e| e.sp == 0));

        let rescue = &iseq.catch_table[0];
        let retry = &iseq.catch_table[1];
        assert_eq!(retry.cont, rescue.start);
        assert_eq!((retry.start, retry.end), (rescue.start, rescue.end));

        // The else body sits after the rescued range.
        let else_at = iseq
            .instructions
            .iter()
            .position(|i| *i == Instruction::PutObject(Literal::Integer(2)))
            .unwrap();
        assert!(else_at >= iseq.offset(rescue.end));

        // Ensure body runs inline on the normal path and in the handler.
        assert_eq!(
            count(&iseq, |i| matches!(i, Instruction::Send(ci) if &*ci.name == "cleanup")),
            2
        );
        assert_eq!(count(&iseq, |i| *i == Instruction::EndEnsure), 1);
        let ensure = &iseq.catch_table[2];
        assert!(iseq.offset(ensure.cont) > iseq.offset(ensure.end));
        assert!(matches!(
            iseq.instructions[iseq.offset(ensure.cont) - 1],
            Instruction::Jump(_)
        ));

        let handler = rescue.iseq.as_ref().unwrap();
        assert_eq!(handler.kind, IseqKind::Rescue);
        assert_eq!(handler.name, "rescue in <main>");
        assert_eq!(handler.locals, vec!["$!"]);
        assert!(handler.instructions.contains(&Instruction::CheckMatch));
        assert_eq!(
            handler.instructions[handler.instructions.len() - 1],
            Instruction::Throw(ThrowKind::Raise)
        );
        // `e` is bound in the enclosing scope.
        assert_eq!(iseq.locals, vec!["e"]);
        assert!(handler
            .instructions
            .contains(&Instruction::SetLocal { index: 0, level: 1 }));
    }

    #[test]
    fn test_bare_rescue_matches_standard_error() {
        let iseq = compile_ok(begin(vec![int(1)], vec![rescue(vec![], None, vec![int(2)])], None, None));
        let handler = iseq.catch_table[0].iseq.as_ref().unwrap();
        assert!(handler
            .instructions
            .contains(&Instruction::GetConstant("StandardError".into())));
    }

    #[test]
    fn test_retry_in_rescue() {
        let program = begin(vec![int(1)], vec![rescue(vec![], None, vec![Node::Retry])], None, None);
        let iseq = compile_ok(program);
        let handler = iseq.catch_table[0].iseq.as_ref().unwrap();
        assert!(handler.instructions.contains(&Instruction::Throw(ThrowKind::Retry)));
    }

    #[test]
    fn test_return_inside_ensure_throws() {
        let program = def(
            "foo",
            params(&[]),
            vec![begin(vec![ret(Some(int(1)))], vec![], None, Some(vec![int(2)]))],
        );
        let iseq = compile_ok(program);
        let method = child(&iseq, "foo");
        assert!(method.instructions.contains(&Instruction::Throw(ThrowKind::Return)));
    }

    #[test]
    fn test_malformed_nodes() {
        let empty_if = Node::If(Box::new(If {
            branches: vec![],
            else_body: None,
        }));
        assert!(matches!(
            compile(&empty_if),
            Err(CompileError::Malformed { node: "If", .. })
        ));
        assert!(matches!(
            compile(&const_path(&[])),
            Err(CompileError::Malformed { node: "Const", .. })
        ));
    }

    #[test]
    fn test_labels_are_unique_across_sequences() {
        let program = body(vec![
            if_else(vcall("a"), vec![int(1)], None),
            def("foo", params(&[]), vec![if_else(vcall("b"), vec![int(1)], None)]),
        ]);
        let iseq = compile_ok(program);
        let method = child(&iseq, "foo");
        let outer: Vec<Label> = iseq.instructions.iter().filter_map(Instruction::target).collect();
        let inner: Vec<Label> = method.instructions.iter().filter_map(Instruction::target).collect();
        assert!(outer.iter().all(|l| !inner.contains(l)));
    }
}
