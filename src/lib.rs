//! Expression compiler for a Scheme front end.
//!
//! [`compiler`] turns parsed S-expressions into a typed IR, choosing a
//! strategy per call site: inline expansion, direct invocation of known
//! procedures, builtin overloads with constant folding, or a generic call.
//! [`runtime`] holds the values, builtins and evaluator the compiler needs
//! at compile time.

pub mod compiler;
pub mod runtime;

pub use compiler::{CompileError, CompileOptions, CompiledUnit, Compiler, OptimizationLevel};
pub use runtime::{Environment, Machine, RuntimeError, Value};
