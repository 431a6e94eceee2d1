//! Pad-script: the snippet language compiled and run inside the worker.
//!
//! # Pipeline
//!
//! 1. `lexer` turns source into tokens
//! 2. `parser` builds a `Unit` (statements plus an optional trailing result)
//! 3. `compiler` resolves names against references, imports and builtins,
//!    producing diagnostics and a flat `CompiledScript`
//! 4. `vm` runs the program, reporting output through a `ScriptHost`
//!
//! A `CompiledScript` is the executable unit persisted by `CompileAndSave`.

pub mod ast;
pub mod builtins;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod program;
pub mod value;
pub mod vm;

pub use builtins::Builtin;
pub use compiler::{Compilation, CompileOptions, SUBMISSION_NAME, compile};
pub use program::CompiledScript;
pub use value::Value;
pub use vm::{ScriptHost, run};
