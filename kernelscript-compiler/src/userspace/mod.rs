//! User-space code generation: the loader/orchestrator C translation unit.

pub mod codegen;

pub use codegen::emit_user;
