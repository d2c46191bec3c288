//! Non-local transfers unwound through catch tables.

use std::fmt;

use crate::frame::FrameId;
use crate::object::Value;

/// A raised exception or a control transfer leaving the current activation.
///
/// Every variant travels the same path: out of the executing frame, through
/// the catch table of each caller, until an entry accepts it.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Exception object.
    Raise(Value),
    /// `break` out of a block, resuming after the call in `target`.
    Break { target: FrameId, value: Value },
    /// `next` in a block: finish this iteration with a value.
    Next(Value),
    /// `redo` in a block: restart this iteration.
    Redo,
    /// `retry` in a rescue clause: rerun the protected body.
    Retry,
    /// `return`, leaving the method activation `target`.
    Return { target: FrameId, value: Value },
}

impl Signal {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Signal::Raise(_) => "exception",
            Signal::Break { .. } => "break",
            Signal::Next(_) => "next",
            Signal::Redo => "redo",
            Signal::Retry => "retry",
            Signal::Return { .. } => "return",
        }
    }

    /// The exception carried, if this is a raise.
    pub fn exception(&self) -> Option<&Value> {
        match self {
            Signal::Raise(exc) => Some(exc),
            _ => None,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Raise(Value::Object(exc)) => {
                let class = exc.class.display_name();
                match exc.message() {
                    Some(message) => write!(f, "{}: {}", class, message),
                    None => write!(f, "{}", class),
                }
            }
            Signal::Raise(other) => write!(f, "exception {}", other.inspect()),
            other => write!(f, "{}", other.kind_name()),
        }
    }
}
