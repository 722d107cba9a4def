// Library crate for ptrflow
// Exposes the dataflow core modules for checkers and the external walker

#[macro_use]
pub mod debug_macros;

pub mod ast;
pub mod canon;
pub mod state;
pub mod oracle;
pub mod diagnostics;
pub mod hooks;
pub mod checkers;
