//! qet bytecode interpreter.
//!
//! A stack machine in the classic mold: call frames over a contiguous
//! value stack, open upvalues captured by stack slot, classes as method
//! tables, fields in concurrent hash tables. The interpreter is a
//! collector mutator: it polls a safepoint every
//! [`qet_gc::GcConfig::safepoint_interval`] dispatches and re-shades
//! its roots (stack, frames, open upvalues, globals, the pinned `init`
//! string) whenever a handshake exchanges state.

pub mod debug;
pub mod error;
pub mod vm;

pub use error::{InterpretError, RuntimeError};
pub use vm::Vm;
