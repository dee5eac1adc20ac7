use crate::compiler::sexpr::Symbol;

#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("unbound variable: {0}")]
    Unbound(Symbol),
    #[error("variable {0} read before it was initialized")]
    Uninitialized(Symbol),
    #[error("not a procedure: {0}")]
    NotAProcedure(String),
    #[error("{procedure}: expected {expected}, got {got}")]
    WrongType {
        procedure: String,
        expected: String,
        got: String,
    },
    #[error("{procedure}: wrong number of arguments: expected {expected}, got {got}")]
    Arity {
        procedure: String,
        expected: String,
        got: usize,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("write to {0} would escape a sealed evaluation")]
    Escape(Symbol),
    #[error("evaluation ran out of fuel")]
    OutOfFuel,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn wrong_type(procedure: &str, expected: &str, got: &super::value::Value) -> Self {
        Self::WrongType {
            procedure: procedure.to_owned(),
            expected: expected.to_owned(),
            got: got.to_string(),
        }
    }
}
