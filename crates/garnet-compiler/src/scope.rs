//! Lexical local-variable scopes used during compilation.
//!
//! Every instruction sequence being compiled owns one [`LocalTable`]. Method,
//! class and top-level tables are gates: lookups stop there. Block and rescue
//! tables are transparent and reach enclosing names by `level`.

use std::mem;

use garnet_bytecode::IseqKind;

/// Where a local lives relative to the current activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Slot in the owning environment.
    pub index: usize,
    /// Environments to walk outward; 0 is the current one.
    pub level: usize,
}

/// Locals declared by one instruction sequence, in slot order.
#[derive(Debug)]
pub struct LocalTable {
    kind: IseqKind,
    names: Vec<String>,
}

impl LocalTable {
    pub fn new(kind: IseqKind) -> Self {
        Self {
            kind,
            names: Vec::new(),
        }
    }

    pub fn kind(&self) -> IseqKind {
        self.kind
    }

    /// Declare a name, reusing its slot if already present.
    pub fn declare(&mut self, name: &str) -> usize {
        if let Some(index) = self.get(name) {
            return index;
        }
        self.names.push(name.to_string());
        self.names.len() - 1
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Stack of local tables, innermost in `current`.
#[derive(Debug)]
pub struct ScopeManager {
    current: LocalTable,
    outer: Vec<LocalTable>,
}

impl ScopeManager {
    /// Start with the table of the outermost sequence.
    pub fn new(kind: IseqKind) -> Self {
        Self {
            current: LocalTable::new(kind),
            outer: Vec::new(),
        }
    }

    pub fn current(&self) -> &LocalTable {
        &self.current
    }

    /// Push a table for a nested sequence.
    pub fn enter(&mut self, kind: IseqKind) {
        let outer = mem::replace(&mut self.current, LocalTable::new(kind));
        self.outer.push(outer);
    }

    /// Pop the innermost table and return its names in slot order.
    pub fn exit(&mut self) -> Vec<String> {
        match self.outer.pop() {
            Some(outer) => mem::replace(&mut self.current, outer).names,
            None => mem::take(&mut self.current.names),
        }
    }

    /// Kinds of the enclosing tables, innermost first.
    pub fn kinds(&self) -> impl Iterator<Item = IseqKind> + '_ {
        std::iter::once(self.current.kind).chain(self.outer.iter().rev().map(|t| t.kind))
    }

    /// Declare a name in the current table.
    pub fn declare(&mut self, name: &str) -> Resolution {
        Resolution {
            index: self.current.declare(name),
            level: 0,
        }
    }

    /// Find a visible local without crossing a gate.
    pub fn resolve(&self, name: &str) -> Option<Resolution> {
        let tables = std::iter::once(&self.current).chain(self.outer.iter().rev());
        for (level, table) in tables.enumerate() {
            if let Some(index) = table.get(name) {
                return Some(Resolution { index, level });
            }
            if table.kind.is_gate() {
                break;
            }
        }
        None
    }

    /// Resolve a name for assignment, declaring it if it is not visible.
    ///
    /// New names land in the nearest table that is not a rescue body, since
    /// rescue clauses share the locals of the code they protect.
    pub fn assign(&mut self, name: &str) -> Resolution {
        if let Some(res) = self.resolve(name) {
            return res;
        }
        let mut level = 0;
        let mut table = &mut self.current;
        let mut outer = self.outer.iter_mut().rev();
        while table.kind == IseqKind::Rescue {
            match outer.next() {
                Some(t) => {
                    table = t;
                    level += 1;
                }
                None => break,
            }
        }
        Resolution {
            index: table.declare(name),
            level,
        }
    }
}
