//! Instruction sequences and their builder.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::opcode::Instruction;

/// Symbolic jump target, resolved to an instruction offset at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "label_{}", self.0)
    }
}

/// What an instruction sequence is the body of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IseqKind {
    Top,
    Method,
    Block,
    Class,
    SingletonClass,
    Rescue,
}

impl IseqKind {
    /// Method, class and top-level bodies hide the locals of enclosing scopes.
    pub fn is_gate(self) -> bool {
        matches!(
            self,
            IseqKind::Top | IseqKind::Method | IseqKind::Class | IseqKind::SingletonClass
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IseqKind::Top => "top",
            IseqKind::Method => "method",
            IseqKind::Block => "block",
            IseqKind::Class => "class",
            IseqKind::SingletonClass => "singletonclass",
            IseqKind::Rescue => "rescue",
        }
    }
}

impl fmt::Display for IseqKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of region recorded in a catch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatchKind {
    Rescue,
    Ensure,
    Break,
    Next,
    Redo,
    Retry,
}

impl fmt::Display for CatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CatchKind::Rescue => "rescue",
            CatchKind::Ensure => "ensure",
            CatchKind::Break => "break",
            CatchKind::Next => "next",
            CatchKind::Redo => "redo",
            CatchKind::Retry => "retry",
        };
        f.write_str(s)
    }
}

/// A protected region of an instruction sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchEntry {
    pub kind: CatchKind,
    /// Handler body, for rescue entries.
    pub iseq: Option<Rc<InstructionSequence>>,
    pub start: Label,
    pub end: Label,
    pub cont: Label,
    /// Operand stack depth restored before the handler runs.
    pub sp: usize,
}

impl CatchEntry {
    pub fn new(kind: CatchKind, start: Label, end: Label, cont: Label, sp: usize) -> Self {
        Self {
            kind,
            iseq: None,
            start,
            end,
            cont,
            sp,
        }
    }

    pub fn with_iseq(mut self, iseq: Rc<InstructionSequence>) -> Self {
        self.iseq = Some(iseq);
        self
    }
}

/// Parameter layout of a method or block.
///
/// Required parameters occupy the first local slots, followed by optional
/// ones. When optional parameters exist, `opt_labels` holds one entry per
/// default plus a final entry marking the start of the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgsDescriptor {
    pub required: usize,
    pub optional: usize,
    /// Slot of the `*rest` parameter.
    pub rest: Option<usize>,
    /// Slot of the `&block` parameter.
    pub block: Option<usize>,
    pub opt_labels: Vec<Label>,
}

impl ArgsDescriptor {
    /// Minimum and maximum argument counts; `None` for no upper bound.
    pub fn arity(&self) -> (usize, Option<usize>) {
        let max = match self.rest {
            Some(_) => None,
            None => Some(self.required + self.optional),
        };
        (self.required, max)
    }

    /// Number of leading slots filled from positional arguments.
    pub fn positional(&self) -> usize {
        self.required + self.optional
    }

    /// True when the sequence takes no parameters at all.
    pub fn is_empty(&self) -> bool {
        self.required == 0 && self.optional == 0 && self.rest.is_none() && self.block.is_none()
    }
}

/// Entry of [`InstructionSequence::body`]: labels interleaved with code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyItem<'a> {
    Label(Label),
    Instruction(&'a Instruction),
}

/// Finalized, immutable bytecode for one method, block, class body, rescue
/// handler or top-level program.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionSequence {
    pub name: String,
    pub kind: IseqKind,
    pub max_stack: usize,
    /// Local names in slot order.
    pub locals: Vec<String>,
    pub args: ArgsDescriptor,
    /// Entries are recorded innermost first.
    pub catch_table: Vec<CatchEntry>,
    pub instructions: Vec<Instruction>,
    labels: BTreeMap<Label, usize>,
}

impl InstructionSequence {
    /// Instruction offset a label was placed at.
    ///
    /// Finalization guarantees every label referenced by the sequence is
    /// present, so a miss here is a bug in whoever built the sequence.
    pub fn offset(&self, label: Label) -> usize {
        match self.labels.get(&label) {
            Some(&offset) => offset,
            None => panic!("{} is not placed in {}", label, self.name),
        }
    }

    /// Slot of a named local.
    pub fn local_index(&self, name: &str) -> Option<usize> {
        self.locals.iter().position(|l| l == name)
    }

    /// Labels and instructions in program order.
    pub fn body(&self) -> Vec<BodyItem<'_>> {
        let mut by_offset: Vec<(usize, Label)> =
            self.labels.iter().map(|(&l, &o)| (o, l)).collect();
        by_offset.sort();
        let mut labels = by_offset.into_iter().peekable();
        let mut out = Vec::with_capacity(self.instructions.len() + self.labels.len());
        for (offset, insn) in self.instructions.iter().enumerate() {
            while let Some(&(o, l)) = labels.peek() {
                if o != offset {
                    break;
                }
                out.push(BodyItem::Label(l));
                labels.next();
            }
            out.push(BodyItem::Instruction(insn));
        }
        for (_, l) in labels {
            out.push(BodyItem::Label(l));
        }
        out
    }

    fn disassemble(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== disasm: #<ISeq:{}> ({}) ==", self.name, self.kind)?;
        for entry in &self.catch_table {
            write!(
                f,
                "| catch type: {:<7} st: {:04} ed: {:04} sp: {:04} cont: {:04}",
                entry.kind.to_string(),
                self.offset(entry.start),
                self.offset(entry.end),
                entry.sp,
                self.offset(entry.cont)
            )?;
            if let Some(handler) = &entry.iseq {
                write!(f, " <ISeq:{}>", handler.name)?;
            }
            writeln!(f)?;
        }
        if !self.locals.is_empty() {
            let slots: Vec<String> = self
                .locals
                .iter()
                .enumerate()
                .map(|(i, n)| format!("[{}] {}", i, n))
                .collect();
            writeln!(f, "local table (size: {}) {}", self.locals.len(), slots.join(" "))?;
        }
        for (offset, insn) in self.instructions.iter().enumerate() {
            writeln!(f, "{:04} {}", offset, insn)?;
        }

        for insn in &self.instructions {
            if let Some(child) = insn.child_iseq() {
                writeln!(f)?;
                child.disassemble(f)?;
            }
        }
        for entry in &self.catch_table {
            if let Some(handler) = &entry.iseq {
                writeln!(f)?;
                handler.disassemble(f)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for InstructionSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.disassemble(f)
    }
}

/// Errors detected while finalizing a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("{label} referenced but never placed in {iseq}")]
    UnplacedLabel { iseq: String, label: Label },

    #[error("{label} placed twice in {iseq}")]
    DuplicateLabel { iseq: String, label: Label },
}

/// Mutable sequence builder used during compilation.
///
/// Tracks the simulated operand stack depth so `max_stack` falls out of
/// emission. Branch targets merge control flow, so the compiler resets the
/// depth explicitly when it places a label reached from elsewhere.
#[derive(Debug)]
pub struct IseqBuilder {
    pub name: String,
    pub kind: IseqKind,
    pub locals: Vec<String>,
    pub args: ArgsDescriptor,
    catch_table: Vec<CatchEntry>,
    instructions: Vec<Instruction>,
    labels: BTreeMap<Label, usize>,
    duplicate: Option<Label>,
    depth: usize,
    max_stack: usize,
}

impl IseqBuilder {
    pub fn new(name: impl Into<String>, kind: IseqKind) -> Self {
        Self {
            name: name.into(),
            kind,
            locals: Vec::new(),
            args: ArgsDescriptor::default(),
            catch_table: Vec::new(),
            instructions: Vec::new(),
            labels: BTreeMap::new(),
            duplicate: None,
            depth: 0,
            max_stack: 0,
        }
    }

    /// Append an instruction and return its offset.
    pub fn emit(&mut self, insn: Instruction) -> usize {
        let (pops, pushes) = insn.stack_effect();
        debug_assert!(
            self.depth >= pops,
            "stack underflow emitting {} in {}",
            insn,
            self.name
        );
        self.depth = self.depth.saturating_sub(pops) + pushes;
        self.max_stack = self.max_stack.max(self.depth);
        let offset = self.instructions.len();
        self.instructions.push(insn);
        offset
    }

    /// Bind a label to the next instruction offset.
    pub fn place(&mut self, label: Label) {
        let offset = self.instructions.len();
        if self.labels.insert(label, offset).is_some() {
            self.duplicate.get_or_insert(label);
        }
    }

    /// Current instruction offset.
    pub fn offset(&self) -> usize {
        self.instructions.len()
    }

    /// Simulated operand stack depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
        self.max_stack = self.max_stack.max(depth);
    }

    /// Last emitted instruction.
    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Add a local slot, or return the existing one.
    pub fn add_local(&mut self, name: &str) -> usize {
        if let Some(index) = self.locals.iter().position(|l| l == name) {
            return index;
        }
        self.locals.push(name.to_string());
        self.locals.len() - 1
    }

    pub fn add_catch_entry(&mut self, entry: CatchEntry) {
        self.catch_table.push(entry);
    }

    /// Resolve labels and produce the immutable sequence.
    pub fn finish(self) -> Result<InstructionSequence, BuildError> {
        if let Some(label) = self.duplicate {
            return Err(BuildError::DuplicateLabel {
                iseq: self.name,
                label,
            });
        }

        let referenced = self
            .instructions
            .iter()
            .filter_map(Instruction::target)
            .chain(
                self.catch_table
                    .iter()
                    .flat_map(|e| [e.start, e.end, e.cont]),
            )
            .chain(self.args.opt_labels.iter().copied());
        for label in referenced {
            if !self.labels.contains_key(&label) {
                return Err(BuildError::UnplacedLabel {
                    iseq: self.name,
                    label,
                });
            }
        }

        log::trace!(
            "finalized {} ({}): {} instructions, max_stack {}",
            self.name,
            self.kind,
            self.instructions.len(),
            self.max_stack
        );

        Ok(InstructionSequence {
            name: self.name,
            kind: self.kind,
            max_stack: self.max_stack,
            locals: self.locals,
            args: self.args,
            catch_table: self.catch_table,
            instructions: self.instructions,
            labels: self.labels,
        })
    }
}
