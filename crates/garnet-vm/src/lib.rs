//! Garnet VM - object model and instruction sequence executor.
//!
//! This crate provides the runtime for Garnet: classes, modules and
//! singleton classes held by a [`Registry`], and a [`VM`] that executes
//! compiled instruction sequences against it.

pub mod builtins;
pub mod class;
pub mod dispatch;
pub mod frame;
pub mod object;
pub mod registry;
pub mod signal;
pub mod vm;

pub use class::{Arity, ClassKind, Method, MethodBody, NativeFn, RClass};
pub use frame::{Cref, Env, Frame, FrameId, MethodContext};
pub use object::{IdentityKey, Proc, RObject, Value};
pub use registry::Registry;
pub use signal::Signal;
pub use vm::{VM, VmConfig, VmError};
