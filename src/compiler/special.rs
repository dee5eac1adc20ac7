//! Core special forms and procedure-body lowering.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::{
    compile, constfold,
    error::CompileError,
    scope::{add_local, add_parameter, bind, global_slot, lookup, ClosureTemplate, VariableKind},
    sexpr::{intern, Sexpr, Symbol},
    tree_il::{Expr, IfClause, Stmt},
    Cenv,
};

pub type SpecialForm = fn(&Sexpr, &Cenv<'_>, bool) -> Result<Expr, CompileError>;

static SPECIAL_FORMS: Lazy<HashMap<Symbol, SpecialForm>> = Lazy::new(|| {
    let mut env: HashMap<Symbol, SpecialForm> = HashMap::with_capacity(8);

    macro_rules! define_syntax {
        ($name: literal, $form: ident, $cenv: ident, $tail: ident, $b: block) => {{
            fn stx($form: &Sexpr, $cenv: &Cenv<'_>, $tail: bool) -> Result<Expr, CompileError> {
                $b
            }

            env.insert(intern($name), stx);
        }};
    }

    define_syntax!("quote", form, cenv, _tail, {
        match form.proper_list().as_deref() {
            Some([_, datum]) => Ok(constfold::quote_literal(datum)),
            _ => Err(cenv.syntax_error("illegal quote", form)),
        }
    });

    define_syntax!("if", form, cenv, tail, {
        let parts = form.proper_list().unwrap_or_default();
        match parts.as_slice() {
            [_, test, then] | [_, test, then, _] => {
                let test = compile(test, cenv, false)?;
                let then = compile(then, cenv, tail)?;
                let els = match parts.get(3) {
                    Some(els) => compile(els, cenv, tail)?,
                    None => Expr::unspecified(),
                };
                Ok(Expr::Conditional(
                    Box::new(test),
                    Box::new(then),
                    Box::new(els),
                ))
            }
            _ => Err(cenv.syntax_error("illegal if", form)),
        }
    });

    define_syntax!("begin", form, cenv, tail, {
        let Some(body) = form.cdr().and_then(Sexpr::proper_list) else {
            return Err(cenv.syntax_error("illegal begin", form));
        };
        let Some((last, init)) = body.split_last() else {
            return Ok(Expr::unspecified());
        };
        let prefix = init
            .iter()
            .map(|x| compile(x, cenv, false))
            .collect::<Result<Vec<_>, _>>()?;
        let last = compile(last, cenv, tail)?;
        if prefix.is_empty() {
            Ok(last)
        } else {
            Ok(Expr::Sequence(prefix, Box::new(last)))
        }
    });

    define_syntax!("lambda", form, cenv, _tail, {
        match form.proper_list().as_deref() {
            Some([_, formals, body @ ..]) if !body.is_empty() => {
                make_lambda(intern("lambda"), formals, body, cenv)
            }
            _ => Err(cenv.syntax_error("illegal lambda", form)),
        }
    });

    define_syntax!("define", form, cenv, _tail, {
        let Some(parts) = form.proper_list() else {
            return Err(cenv.syntax_error("illegal define", form));
        };
        let (name, value) = match parts.as_slice() {
            [_, Sexpr::Symbol(name)] => (*name, Expr::unspecified()),
            [_, Sexpr::Symbol(name), value] => {
                let value = match lambda_parts(value, cenv) {
                    Some((formals, body)) => make_lambda(*name, &formals, &body, cenv)?,
                    None => compile(value, cenv, false)?,
                };
                (*name, value)
            }
            [_, Sexpr::Pair(signature), body @ ..] if !body.is_empty() => {
                let Some(name) = signature.0.symbol() else {
                    return Err(cenv.syntax_error("illegal define", form));
                };
                (name, make_lambda(name, &signature.1, body, cenv)?)
            }
            _ => return Err(cenv.syntax_error("illegal define", form)),
        };

        if cenv.scope.get().is_global {
            let registry = cenv.registry();
            if registry.is_defined(name) {
                // Redefinition: calls already compiled keep the old binding,
                // so the name is treated as assigned from here on.
                registry.mark_assigned(name);
            }
            registry.mark_defined(name);
            match &value {
                Expr::MakeClosure(template)
                    if cenv.options().register_known_globals && !registry.is_assigned(name) =>
                {
                    bind(template);
                    let variadic = template.get().rest;
                    registry.register_known_procedure(name, template.clone(), variadic);
                }
                _ => registry.forget(name),
            }
            return Ok(Expr::Write(global_slot(&cenv.scope, name), Box::new(value)));
        }

        match lookup(&cenv.scope, name) {
            Some(slot) => Ok(Expr::Write(slot, Box::new(value))),
            None => Err(cenv.syntax_error("misplaced definition", form)),
        }
    });

    define_syntax!("set!", form, cenv, _tail, {
        match form.proper_list().as_deref() {
            Some([_, Sexpr::Symbol(name), value]) => {
                cenv.registry().mark_assigned(*name);
                let slot = lookup(&cenv.scope, *name)
                    .unwrap_or_else(|| global_slot(&cenv.scope, *name));
                let value = compile(value, cenv, false)?;
                Ok(Expr::Write(slot, Box::new(value)))
            }
            _ => Err(cenv.syntax_error("illegal set!", form)),
        }
    });

    env
});

pub fn lookup_special(name: Symbol) -> Option<SpecialForm> {
    SPECIAL_FORMS.get(&name).copied()
}

/// `(lambda formals body ...)` split into its parts, unless `lambda` is
/// shadowed.
fn lambda_parts(x: &Sexpr, cenv: &Cenv) -> Option<(Sexpr, Vec<Sexpr>)> {
    let (head, rest) = x.pair()?;
    if !head.is_symbol_named("lambda") || cenv.is_local(intern("lambda")) {
        return None;
    }
    let (formals, body) = rest.pair()?;
    let body = body.proper_list()?;
    if body.is_empty() {
        return None;
    }
    Some((formals.clone(), body))
}

fn parse_formals(formals: &Sexpr, cenv: &Cenv) -> Result<(Vec<Symbol>, Option<Symbol>), CompileError> {
    let mut reqs = vec![];
    let mut xs = formals;
    let rest = loop {
        match xs {
            Sexpr::Null => break None,
            Sexpr::Symbol(rest) => break Some(*rest),
            Sexpr::Pair(p) => {
                let Some(name) = p.0.symbol() else {
                    return Err(cenv.syntax_error("invalid formal parameter", &p.0));
                };
                reqs.push(name);
                xs = &p.1;
            }
            other => return Err(cenv.syntax_error("invalid formal parameter", other)),
        }
    };

    let mut seen = reqs.clone();
    seen.extend(rest);
    seen.sort();
    if seen.windows(2).any(|w| w[0] == w[1]) {
        return Err(cenv.syntax_error("duplicate formal parameter", formals));
    }
    Ok((reqs, rest))
}

/// Builds the template for a `lambda` and lowers its body.
pub fn make_lambda(
    name: Symbol,
    formals: &Sexpr,
    body: &[Sexpr],
    cenv: &Cenv,
) -> Result<Expr, CompileError> {
    let (reqs, rest) = parse_formals(formals, cenv)?;

    let template = ClosureTemplate::new(name, Some(&cenv.scope));
    for param in reqs.iter().chain(rest.iter()) {
        add_parameter(&template, *param);
    }
    template.get_mut().rest = rest.is_some();

    for form in body {
        if let Some(defined) = internal_define_name(form) {
            if !template.get().has_slot_named(defined) {
                add_local(&template, defined, VariableKind::Local);
            }
        }
    }

    let inner = cenv.with_scope(template.clone());
    let stmt = lower_body(body, &inner)?;
    template.get_mut().body = Some(stmt);
    Ok(Expr::MakeClosure(template))
}

fn internal_define_name(form: &Sexpr) -> Option<Symbol> {
    let (head, rest) = form.pair()?;
    if !head.is_symbol_named("define") {
        return None;
    }
    match rest.car()? {
        Sexpr::Symbol(name) => Some(*name),
        Sexpr::Pair(signature) => signature.0.symbol(),
        _ => None,
    }
}

/// Lowers a procedure body: every form but the last for effect, the last in
/// tail position.
pub fn lower_body(body: &[Sexpr], cenv: &Cenv) -> Result<Stmt, CompileError> {
    let Some((last, init)) = body.split_last() else {
        return Err(cenv.syntax_error("empty body", &cenv.form));
    };
    if init.is_empty() {
        return lower_tail(last, cenv);
    }
    let mut stmts = init
        .iter()
        .map(|x| compile(x, cenv, false).map(Stmt::Expression))
        .collect::<Result<Vec<_>, _>>()?;
    stmts.push(lower_tail(last, cenv)?);
    Ok(Stmt::Block(stmts))
}

/// Lowers a form in tail position. `if` becomes a single-clause conditional
/// statement; everything else returns its value.
pub fn lower_tail(x: &Sexpr, cenv: &Cenv) -> Result<Stmt, CompileError> {
    let head = x.car().and_then(Sexpr::symbol);
    let special = head.filter(|name| !cenv.is_local(*name));

    if special == Some(intern("if")) {
        let cenv = cenv.enter(x);
        let parts = x.proper_list().unwrap_or_default();
        if let [_, test, then, els @ ..] = parts.as_slice() {
            if els.len() <= 1 {
                let test = compile(test, &cenv, false)?;
                let then = lower_tail(then, &cenv)?;
                let els = match els.first() {
                    Some(els) => lower_tail(els, &cenv)?,
                    None => Stmt::Return(Expr::unspecified()),
                };
                return Ok(Stmt::If(
                    vec![IfClause {
                        test,
                        body: then,
                        span: cenv.span_of(x),
                    }],
                    Some(Box::new(els)),
                ));
            }
        }
        return Err(cenv.syntax_error("illegal if", x));
    }

    if special == Some(intern("begin")) {
        if let Some(body) = x.cdr().and_then(Sexpr::proper_list) {
            if !body.is_empty() {
                let cenv = cenv.enter(x);
                return lower_body(&body, &cenv);
            }
        }
    }

    Ok(Stmt::Return(compile(x, cenv, true)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{
        sexpr::{sym, SourceMap},
        CompileOptions, Compiler,
    };

    fn compile_forms(forms: &[Sexpr]) -> Result<crate::compiler::CompiledUnit, CompileError> {
        let compiler = Compiler::new(CompileOptions::default());
        compiler.compile_unit(forms, &SourceMap::new())
    }

    #[test]
    fn duplicate_formals_are_rejected() {
        let form = Sexpr::list([
            sym("lambda"),
            Sexpr::list([sym("x"), sym("x")]),
            sym("x"),
        ]);
        let err = compile_forms(&[form]).err().unwrap();
        assert!(!err.is_internal());
    }

    #[test]
    fn tail_if_lowers_to_single_clause_statement() {
        let form = Sexpr::list([
            sym("lambda"),
            Sexpr::list([sym("x")]),
            Sexpr::list([sym("if"), sym("x"), Sexpr::Fixnum(1), Sexpr::Fixnum(2)]),
        ]);
        let unit = compile_forms(&[form]).unwrap();
        let Stmt::Block(stmts) = &unit.body else {
            panic!("unit body is a block");
        };
        let Some(Stmt::Return(Expr::MakeClosure(t))) = stmts.last() else {
            panic!("expected a closure");
        };
        assert!(matches!(&t.get().body, Some(Stmt::If(clauses, Some(_))) if clauses.len() == 1));
    }

    #[test]
    fn internal_defines_become_locals() {
        let form = Sexpr::list([
            sym("lambda"),
            Sexpr::Null,
            Sexpr::list([sym("define"), sym("y"), Sexpr::Fixnum(1)]),
            sym("y"),
        ]);
        let unit = compile_forms(&[form]).unwrap();
        let Stmt::Block(stmts) = &unit.body else {
            panic!("unit body is a block");
        };
        let Some(Stmt::Return(Expr::MakeClosure(t))) = stmts.last() else {
            panic!("expected a closure");
        };
        assert_eq!(t.get().variables.len(), 1);
        assert_eq!(t.get().variables[0].get().kind, VariableKind::Local);
    }

    #[test]
    fn misplaced_define_is_a_syntax_error() {
        let form = Sexpr::list([
            sym("lambda"),
            Sexpr::Null,
            Sexpr::list([
                sym("if"),
                Sexpr::Boolean(true),
                Sexpr::list([sym("define"), sym("z"), Sexpr::Fixnum(1)]),
            ]),
        ]);
        assert!(matches!(
            compile_forms(&[form]),
            Err(CompileError::Syntax { .. })
        ));
    }
}
