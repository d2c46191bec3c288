//! Garnet bytecode - instruction sequences for the Garnet VM.
//!
//! An [`InstructionSequence`] is the unit of compiled code: a method, block,
//! class body, rescue handler or top-level program, together with the catch
//! table describing its exception and control-flow regions.

pub mod code;
pub mod opcode;
pub mod trace;

pub use code::{
    ArgsDescriptor, BodyItem, BuildError, CatchEntry, CatchKind, InstructionSequence, IseqBuilder,
    IseqKind, Label,
};
pub use opcode::{
    CallFlags, CallInfo, DefineClassKind, Instruction, Literal, SpecialObject, ThrowKind,
};
pub use trace::TRACE_MAGIC;
