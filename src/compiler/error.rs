use super::sexpr::{Sexpr, SourceSpan};

fn at(span: &Option<SourceSpan>) -> String {
    match span {
        Some(span) => format!("{}: ", span),
        None => String::new(),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CompileError {
    /// User error: malformed input or a call that can never succeed.
    #[error("{}syntax error: {message}: {node} in {form}", at(.span))]
    Syntax {
        message: String,
        node: Sexpr,
        form: Sexpr,
        span: Option<SourceSpan>,
    },
    /// Dispatcher bug. Never caused by user input alone.
    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn syntax(
        message: impl Into<String>,
        node: &Sexpr,
        form: &Sexpr,
        span: Option<SourceSpan>,
    ) -> Self {
        Self::Syntax {
            message: message.into(),
            node: node.clone(),
            form: form.clone(),
            span,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    pub fn span(&self) -> Option<&SourceSpan> {
        match self {
            Self::Syntax { span, .. } => span.as_ref(),
            Self::Internal(_) => None,
        }
    }
}
