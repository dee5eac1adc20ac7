//! Compile-time view of the runtime: values, builtins, the global
//! environment and an evaluator for compiled IR.

pub mod builtins;
pub mod env;
pub mod error;
pub mod eval;
pub mod fuel;
pub mod value;

pub use self::{env::Environment, error::RuntimeError, eval::Machine, fuel::Fuel, value::Value};
