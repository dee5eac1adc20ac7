//! Calling conventions for direct invocations of known templates.

use super::{
    error::CompileError,
    scope::{bind, ClosureTemplate, TemplateRef},
    sexpr::{Sexpr, SourceSpan},
    tree_il::{Call, Convention, Entry, Expr, Invoke, RuntimeService, Type},
};

/// Largest argument count with its own entry point. Longer argument lists
/// are passed packed in one object array.
pub const MAX_DIRECT_ARGS: usize = 8;

/// Whether calls to `template` must pass the caller's context first.
pub fn needs_context(template: &ClosureTemplate) -> bool {
    if template.is_closure {
        return true;
    }
    if template.explicit_context {
        return false;
    }
    match template.parent() {
        Some(parent) => !parent.get().is_global,
        None => false,
    }
}

/// Packs `args` when they exceed the direct entry points.
pub fn pack_arguments(args: Vec<Expr>) -> (Vec<Expr>, Entry) {
    if args.len() > MAX_DIRECT_ARGS {
        (vec![Expr::NewArray(Type::Object, args)], Entry::Packed)
    } else {
        let n = args.len();
        (args, Entry::Direct(n))
    }
}

/// Direct invocation of `template` with exactly one argument per parameter.
pub fn call_normal(
    template: &TemplateRef,
    mut args: Vec<Expr>,
    tail: bool,
    span: Option<SourceSpan>,
) -> Result<Expr, CompileError> {
    let params = template.get().parameters.clone();
    if params.len() != args.len() {
        return Err(CompileError::internal(format!(
            "direct call to {} with {} arguments, expected {}",
            template.get().name,
            args.len(),
            params.len()
        )));
    }

    for (param, arg) in params.iter().zip(args.iter()) {
        if arg.ty() == Type::Uninitialized {
            param.get_mut().uninitialized = true;
        }
    }

    bind(template);
    let needs_context = needs_context(&template.get());
    if needs_context {
        args.insert(0, Expr::Context);
    }
    let (args, entry) = pack_arguments(args);

    Ok(Expr::Invoke(Invoke {
        template: template.clone(),
        args,
        needs_context,
        entry,
        tail,
        span,
    }))
}

/// Direct invocation of a template whose last parameter collects the
/// surplus arguments into a list.
pub fn call_var_args(
    template: &TemplateRef,
    mut args: Vec<Expr>,
    tail: bool,
    span: Option<SourceSpan>,
) -> Result<Expr, CompileError> {
    let required = template.get().required();
    if args.len() < required {
        return Err(CompileError::internal(format!(
            "variadic call to {} with {} arguments, needs at least {}",
            template.get().name,
            args.len(),
            required
        )));
    }

    let surplus = args.split_off(required);
    let rest = if surplus.is_empty() {
        Expr::Constant(Sexpr::Null)
    } else {
        Expr::Runtime(RuntimeService::MakeList, surplus)
    };
    args.push(rest);
    call_normal(template, args, tail, span)
}

/// Generic entry for a callee that is only known as a value.
pub fn call_generic(callee: Expr, args: Vec<Expr>, tail: bool, span: Option<SourceSpan>) -> Expr {
    let (args, convention) = if args.len() > MAX_DIRECT_ARGS {
        (vec![Expr::NewArray(Type::Object, args)], Convention::Packed)
    } else {
        let n = args.len();
        (args, Convention::Arity(n))
    };
    Expr::Call(Call {
        callee: Box::new(Expr::Convert(Box::new(callee), Type::Callable)),
        args,
        convention,
        tail,
        span,
    })
}
