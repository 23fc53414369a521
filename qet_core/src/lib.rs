//! Core value and bytecode types for the qet runtime.
//!
//! This crate is the leaf of the workspace: it defines the tagged 64-bit
//! [`Value`] word, the bytecode [`Chunk`] container, and the [`OpCode`]
//! set. Everything above it — the collector, the object model, the
//! compiler, the VM — speaks these types.

pub mod chunk;
pub mod opcodes;
pub mod value;

pub use chunk::Chunk;
pub use opcodes::OpCode;
pub use value::Value;

/// Crate version, surfaced by the CLI banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
