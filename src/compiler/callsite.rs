//! Call-site compilation.
//!
//! Every application `(head arg ...)` is dispatched to the first strategy
//! that applies, in this order:
//!
//! 1. a head naming a local that is assigned somewhere skips straight to the
//!    generic call;
//! 2. a known global with a matching fixed arity is inlined or invoked
//!    directly;
//! 3. a known global with a rest parameter is invoked with its surplus
//!    arguments as a list;
//! 4. an overload set picks its first matching entry;
//! 5. `call-with-values` over literal lambdas is rewritten without the
//!    multiple values protocol;
//! 6. inline macros of the active optimization tier;
//! 7. builtins, with an overload chosen statically and constant folding;
//! 8. a generic call through the procedure value.
//!
//! Arguments are compiled once, left to right, before any strategy is
//! tried; strategies that decline leave them untouched.

use super::{
    compile,
    constfold::{fold_builtin, fold_closure},
    convention::{call_generic, call_normal, call_var_args},
    error::CompileError,
    inline::{inline_call, is_inlinable, rewrite_body},
    registry::{Callable, KnownProcedure},
    scope::{add_local, lookup, TemplateRef, VariableKind},
    sexpr::{intern, SourceSpan, Sexpr, Symbol},
    tree_il::{Expr, Native, RuntimeService, Type},
    Cenv,
};

pub fn compile_call(form: &Sexpr, cenv: &Cenv, tail: bool) -> Result<Expr, CompileError> {
    let Some((head, rest)) = form.pair() else {
        return Err(CompileError::internal("call site is not a pair"));
    };
    let Some(arg_forms) = rest.proper_list() else {
        return Err(cenv.syntax_error("improper argument list", form));
    };
    let span = cenv.span_of(form).or_else(|| cenv.span_hint.clone());

    let args = arg_forms
        .iter()
        .map(|arg| compile(arg, cenv, false))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(name) = head.symbol() {
        if is_shadowed(cenv, name) {
            log::trace!(target: "callsite", "{} is an assigned local", name);
        } else if let Some(expr) = compile_global_call(name, &args, cenv, tail, &span)? {
            return Ok(expr.with_span(&span));
        }
    }

    compile_generic(head, args, cenv, tail, span)
}

/// Only locals that are assigned somewhere hide a global's meaning from
/// dispatch. Other locals of the same name are ignored here.
fn is_shadowed(cenv: &Cenv, name: Symbol) -> bool {
    lookup(&cenv.scope, name).is_some() && cenv.registry().is_assigned(name)
}

fn compile_global_call(
    name: Symbol,
    args: &[Expr],
    cenv: &Cenv,
    tail: bool,
    span: &Option<SourceSpan>,
) -> Result<Option<Expr>, CompileError> {
    let options = cenv.options();
    let registry = cenv.registry();

    if options.optimize_calls {
        if let Some(known) = registry.known_procedure(name) {
            if let Some(expr) = compile_known(name, &known, args, cenv, tail, span)? {
                return Ok(Some(expr));
            }
        }
    }

    // User definitions of the same name hide everything below.
    if registry.is_defined(name) || registry.is_assigned(name) {
        return Ok(None);
    }

    if options.optimize_calls && name == intern("call-with-values") {
        if let [producer, consumer] = args {
            if let Some(expr) = multiple_values(producer, consumer, cenv, span)? {
                log::debug!(target: "callsite", "rewrote call-with-values");
                return Ok(Some(expr));
            }
        }
    }

    if let Some(expand) = registry.inline_macro(options.optimization, name) {
        match expand(args) {
            Some(expr) => {
                log::debug!(target: "callsite", "inline macro {}", name);
                return Ok(Some(box_primitive(expr)));
            }
            None => log::trace!(target: "callsite", "inline macro {} declined", name),
        }
    }

    if options.resolve_builtins {
        if let Some(expr) = compile_builtin(name, args, cenv, tail, span) {
            return Ok(Some(expr));
        }
    }

    Ok(None)
}

fn compile_known(
    name: Symbol,
    known: &KnownProcedure,
    args: &[Expr],
    cenv: &Cenv,
    tail: bool,
    span: &Option<SourceSpan>,
) -> Result<Option<Expr>, CompileError> {
    let argc = args.len();
    let target = match &known.callable {
        Callable::Fixed(t) if t.get().parameter_count() == argc => Some((t.clone(), false)),
        Callable::Variadic(t) if argc >= t.get().required() => Some((t.clone(), true)),
        Callable::Overloads(entries) => entries
            .iter()
            .find(|entry| entry.accepts(argc))
            .map(|entry| (entry.template.clone(), entry.variadic)),
        _ => None,
    };
    let Some((template, variadic)) = target else {
        log::trace!(target: "callsite", "{} is known but takes no {} arguments", name, argc);
        return Ok(None);
    };

    if known.allow_constant_fold {
        if let Some(folded) = fold_closure(cenv, &template, variadic, args) {
            return Ok(Some(folded));
        }
    }

    let args = args.to_vec();
    if variadic {
        log::debug!(target: "callsite", "variadic call to {} with {} arguments", name, argc);
        return call_var_args(&template, args, tail, span.clone()).map(Some);
    }

    if !cenv.scope.get().is_global && cenv.can_inline() && is_inlinable(&template.get()) {
        log::debug!(target: "callsite", "inlining known procedure {}", name);
        let copy = rewrite_body(&template);
        return inline_call(&cenv.deeper(), &copy, args, tail, span.clone()).map(Some);
    }

    log::debug!(target: "callsite", "direct call to {}", name);
    call_normal(&template, args, tail, span.clone()).map(Some)
}

fn is_thunk(template: &TemplateRef) -> bool {
    let t = template.get();
    !t.rest && !t.inlined && t.parameter_count() == 0
}

/// `(call-with-values producer consumer)` with a literal lambda consumer.
fn multiple_values(
    producer: &Expr,
    consumer: &Expr,
    cenv: &Cenv,
    span: &Option<SourceSpan>,
) -> Result<Option<Expr>, CompileError> {
    if cenv.scope.get().is_global || !cenv.can_inline() {
        return Ok(None);
    }
    let Expr::MakeClosure(consumer) = consumer else {
        return Ok(None);
    };
    let arity = {
        let c = consumer.get();
        if c.rest || c.inlined {
            return Ok(None);
        }
        c.parameter_count()
    };

    let cenv = cenv.deeper();
    let produced = match producer {
        Expr::MakeClosure(thunk) if is_thunk(thunk) => {
            inline_call(&cenv, thunk, vec![], false, span.clone())?
        }
        opaque => call_generic(opaque.clone(), vec![], false, span.clone()),
    };

    let expr = match arity {
        0 => {
            let body = inline_call(&cenv, consumer, vec![], false, span.clone())?;
            Expr::Sequence(vec![produced], Box::new(body))
        }
        1 => inline_call(&cenv, consumer, vec![produced], false, span.clone())?,
        n => {
            let name = cenv.gensym(&cenv.scope, intern("values"));
            let temp = add_local(&cenv.scope, name, VariableKind::Temporary);
            let store = Expr::Write(
                temp.clone(),
                Box::new(Expr::Runtime(RuntimeService::ValuesToArray, vec![produced])),
            );
            let spread = (0..n)
                .map(|i| Expr::ArrayIndex(Box::new(Expr::Read(temp.clone())), i))
                .collect();
            let body = inline_call(&cenv, consumer, spread, false, span.clone())?;
            Expr::Sequence(vec![store], Box::new(body))
        }
    };
    Ok(Some(expr))
}

fn box_primitive(expr: Expr) -> Expr {
    if expr.ty().is_primitive() {
        Expr::Convert(Box::new(expr), Type::Object)
    } else {
        expr
    }
}

fn compile_builtin(
    name: Symbol,
    args: &[Expr],
    cenv: &Cenv,
    tail: bool,
    span: &Option<SourceSpan>,
) -> Option<Expr> {
    let builtin = cenv.env().builtin(name)?;
    let mut args = args
        .iter()
        .cloned()
        .map(Expr::strip_conversions)
        .collect::<Vec<_>>();
    let types = args.iter().map(Expr::ty).collect::<Vec<_>>();
    let overload = builtin.resolve(&types);

    if let Some(folded) = fold_builtin(cenv, &builtin, overload, &args) {
        return Some(folded);
    }

    let Some(overload) = overload else {
        log::trace!(target: "callsite", "no overload of {} for {:?}", name, types);
        return None;
    };
    if builtin.overloads[overload].needs_context {
        args.insert(0, Expr::Context);
    }
    log::debug!(target: "callsite", "native call to {} (overload {})", name, overload);
    Some(Expr::Native(Native {
        builtin,
        overload,
        args,
        tail,
        span: span.clone(),
    }))
}

fn compile_generic(
    head: &Sexpr,
    args: Vec<Expr>,
    cenv: &Cenv,
    tail: bool,
    span: Option<SourceSpan>,
) -> Result<Expr, CompileError> {
    let callee = compile(head, cenv, false)?;
    if callee.is_constant() {
        return Err(cenv.syntax_error("expecting a procedure", head));
    }

    if cenv.options().optimize_calls {
        if let Expr::MakeClosure(template) = &callee {
            let (rest, inlined, count, required) = {
                let t = template.get();
                (t.rest, t.inlined, t.parameter_count(), t.required())
            };
            if !rest && !inlined && count == args.len() && cenv.can_inline() {
                log::debug!(target: "callsite", "inlining immediate application");
                let expr = inline_call(&cenv.deeper(), template, args, tail, span.clone())?;
                return Ok(expr.with_span(&span));
            }
            if rest && args.len() >= required {
                return call_var_args(template, args, tail, span);
            }
        }
    }

    Ok(call_generic(callee, args, tail, span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::{
            sexpr::{sym, SourceMap},
            tree_il::Stmt,
            CompileOptions, Compiler, OptimizationLevel,
        },
        runtime::{Machine, Value},
    };

    fn list(items: Vec<Sexpr>) -> Sexpr {
        Sexpr::list(items)
    }

    fn last_expr(stmt: &Stmt) -> &Expr {
        match stmt {
            Stmt::Block(stmts) => last_expr(stmts.last().expect("empty block")),
            Stmt::Return(e) | Stmt::Expression(e) => e,
            Stmt::If(..) => panic!("unexpected conditional"),
        }
    }

    #[test]
    fn builtin_call_resolves_overload() {
        let compiler = Compiler::new(CompileOptions::default().with_fold_constants(false));
        let form = list(vec![sym("+"), Sexpr::Fixnum(1), Sexpr::Fixnum(2)]);
        let unit = compiler.compile_unit(&[form], &SourceMap::new()).unwrap();
        let Expr::Native(native) = last_expr(&unit.body) else {
            panic!("expected a native call, got {}", unit.body);
        };
        assert_eq!(native.overload, 0);
        assert!(native.tail);
    }

    #[test]
    fn builtin_call_folds_literals() {
        let compiler = Compiler::new(CompileOptions::default());
        let form = list(vec![sym("*"), Sexpr::Fixnum(6), Sexpr::Fixnum(7)]);
        let unit = compiler.compile_unit(&[form], &SourceMap::new()).unwrap();
        assert!(matches!(
            last_expr(&unit.body),
            Expr::Constant(Sexpr::Fixnum(42))
        ));
    }

    #[test]
    fn literal_head_is_a_syntax_error() {
        let compiler = Compiler::new(CompileOptions::default());
        let form = list(vec![Sexpr::Fixnum(1), Sexpr::Fixnum(2)]);
        let err = compiler.compile_unit(&[form], &SourceMap::new()).unwrap_err();
        assert!(!err.is_internal());
        assert!(err.to_string().contains("expecting a procedure"));
    }

    #[test]
    fn generic_options_reach_the_generic_call() {
        let compiler = Compiler::new(CompileOptions::generic());
        let form = list(vec![sym("+"), Sexpr::Fixnum(1), Sexpr::Fixnum(2)]);
        let unit = compiler.compile_unit(&[form], &SourceMap::new()).unwrap();
        assert!(matches!(last_expr(&unit.body), Expr::Call(_)));
        let value = Machine::new(compiler.env().clone()).run_unit(&unit).unwrap();
        assert!(matches!(value, Value::Fixnum(3)));
    }

    fn call_first(args: &[Expr]) -> Option<Expr> {
        let callee = args.first()?.clone();
        Some(call_generic(callee, vec![], false, None))
    }

    #[test]
    fn inline_macro_result_takes_the_call_position() {
        let compiler = Compiler::new(CompileOptions::default());
        compiler
            .registry()
            .register_inline_macro(OptimizationLevel::None, intern("call-first"), call_first);
        let form = list(vec![sym("call-first"), sym("thunk")]);
        let mut source = SourceMap::new();
        let span = SourceSpan {
            file: "m.scm".into(),
            line: 4,
            column: 9,
        };
        source.mark(&form, span);
        let unit = compiler.compile_unit(&[form], &source).unwrap();
        let Expr::Call(call) = last_expr(&unit.body) else {
            panic!("expected a generic call, got {}", unit.body);
        };
        let span = call.span.as_ref().expect("span");
        assert_eq!((span.line, span.column), (4, 9));
    }

    #[test]
    fn null_check_uses_inline_macro() {
        let compiler = Compiler::new(CompileOptions::default());
        let form = list(vec![sym("null?"), sym("x")]);
        let unit = compiler.compile_unit(&[form], &SourceMap::new()).unwrap();
        let Expr::Convert(inner, Type::Object) = last_expr(&unit.body) else {
            panic!("expected a boxed type test, got {}", unit.body);
        };
        assert!(matches!(**inner, Expr::TypeTest(_, Type::Null)));
    }
}
