//! Inline expansion of known templates.
//!
//! The inlinee's slots move into the caller's scope under fresh names and
//! its body is flattened into a single expression. IR refers to slots by
//! identity, so the moved slots need no rewriting of their uses.

use std::collections::HashMap;

use super::{
    convention::call_normal,
    error::CompileError,
    p::P,
    scope::{
        add_local, add_parameter, bind_nested, visit_stmt, ClosureTemplate, SlotRef, TemplateRef,
        VariableKind,
    },
    sexpr::{intern, SourceSpan},
    tree_il::{Call, Expr, IfClause, Invoke, Native, Stmt},
    Cenv,
};

/// Inlines `template` into the current scope of `cenv`.
///
/// `args` holds one compiled argument per parameter. Inlining into a unit
/// root is never attempted; such calls become direct invocations.
pub fn inline_call(
    cenv: &Cenv,
    template: &TemplateRef,
    args: Vec<Expr>,
    tail: bool,
    span: Option<SourceSpan>,
) -> Result<Expr, CompileError> {
    let parent = cenv.scope.clone();
    if parent.get().is_global {
        return call_normal(template, args, tail, span);
    }

    let (name, inlined, arity) = {
        let t = template.get();
        (t.name, t.inlined, t.parameter_count())
    };
    if inlined {
        return Err(CompileError::internal(format!(
            "template {} inlined twice",
            name
        )));
    }
    if arity != args.len() {
        return Err(CompileError::internal(format!(
            "inlining {} with {} arguments, expected {}",
            name,
            args.len(),
            arity
        )));
    }

    bind_nested(template);

    let (params, locals, body) = {
        let mut t = template.get_mut();
        t.inlined = true;
        (
            std::mem::take(&mut t.parameters),
            std::mem::take(&mut t.variables),
            t.body.clone(),
        )
    };
    let Some(body) = body else {
        return Err(CompileError::internal(format!("template {} has no body", name)));
    };

    log::debug!(
        target: "inline",
        "inlining {} into {} (tail: {})",
        name,
        parent.get().name,
        tail
    );

    let mut assignments = Vec::with_capacity(args.len());
    for (slot, arg) in params.iter().zip(args) {
        reparent(cenv, &parent, slot, VariableKind::Local);
        assignments.push(Expr::Write(slot.clone(), Box::new(arg)));
    }
    for slot in locals.iter() {
        let kind = slot.get().kind;
        reparent(cenv, &parent, slot, kind);
    }
    // Templates built directly in the inlinee now live in the caller's frame.
    visit_stmt(&body, &mut |expr| {
        if let Expr::MakeClosure(inner) = expr {
            let owned = inner.get().parent().map_or(false, |p| P::ptr_eq(&p, template));
            if owned {
                inner.get_mut().parent = P::downgrade(&parent);
            }
            false
        } else {
            true
        }
    });

    let flattened = rewrite_return(&body)?;
    log::trace!(target: "inline", "{}", flattened);

    if assignments.is_empty() {
        Ok(flattened)
    } else {
        Ok(Expr::Sequence(assignments, Box::new(flattened)))
    }
}

fn reparent(cenv: &Cenv, parent: &TemplateRef, slot: &SlotRef, kind: VariableKind) {
    let base = slot.get().name;
    let fresh = cenv.gensym(parent, base);
    let captured = {
        let mut s = slot.get_mut();
        s.name = fresh;
        s.owner = P::downgrade(parent);
        s.kind = kind;
        s.captured
    };
    let mut p = parent.get_mut();
    p.variables.push(slot.clone());
    if captured {
        p.set_heap_frame();
    }
}

/// Flattens a procedure body into the expression it returns.
pub fn rewrite_return(stmt: &Stmt) -> Result<Expr, CompileError> {
    match stmt {
        Stmt::Block(stmts) => {
            let Some((last, init)) = stmts.split_last() else {
                return Ok(Expr::unspecified());
            };
            let prefix = init.iter().map(void_expr).collect::<Result<Vec<_>, _>>()?;
            let last = rewrite_return(last)?;
            if prefix.is_empty() {
                Ok(last)
            } else {
                Ok(Expr::Sequence(prefix, Box::new(last)))
            }
        }
        Stmt::Return(e) => {
            let mut e = e.clone();
            e.set_tail(false);
            Ok(e)
        }
        Stmt::If(clauses, els) => {
            let [IfClause { test, body, .. }] = clauses.as_slice() else {
                return Err(CompileError::internal(format!(
                    "cannot flatten a conditional with {} clauses",
                    clauses.len()
                )));
            };
            let els = match els {
                Some(els) => rewrite_return(els)?,
                None => Expr::unspecified(),
            };
            Ok(Expr::Conditional(
                Box::new(test.clone()),
                Box::new(rewrite_return(body)?),
                Box::new(els),
            ))
        }
        Stmt::Expression(e) => Ok(Expr::Sequence(vec![e.clone()], Box::new(Expr::unspecified()))),
    }
}

/// A statement in non-final position, as an expression evaluated for effect.
fn void_expr(stmt: &Stmt) -> Result<Expr, CompileError> {
    match stmt {
        Stmt::Expression(e) => Ok(e.clone()),
        Stmt::Block(stmts) => {
            let mut exprs = stmts.iter().map(void_expr).collect::<Result<Vec<_>, _>>()?;
            match exprs.pop() {
                Some(last) => Ok(Expr::Sequence(exprs, Box::new(last))),
                None => Ok(Expr::unspecified()),
            }
        }
        Stmt::If(clauses, els) => {
            let [IfClause { test, body, .. }] = clauses.as_slice() else {
                return Err(CompileError::internal(format!(
                    "cannot flatten a conditional with {} clauses",
                    clauses.len()
                )));
            };
            let els = match els {
                Some(els) => void_expr(els)?,
                None => Expr::unspecified(),
            };
            Ok(Expr::Conditional(
                Box::new(test.clone()),
                Box::new(void_expr(body)?),
                Box::new(els),
            ))
        }
        Stmt::Return(_) => Err(CompileError::internal("return before the end of a body")),
    }
}

/// Whether `expr` is built only from calls, conversions, comparisons,
/// type tests, variable reads and non-false constants.
pub fn is_simple(expr: &Expr) -> bool {
    match expr {
        Expr::Native(native) => native.args.iter().all(is_simple),
        Expr::Invoke(invoke) => invoke.args.iter().all(is_simple),
        Expr::Call(call) => is_simple(&call.callee) && call.args.iter().all(is_simple),
        Expr::Convert(e, _) | Expr::TypeTest(e, _) => is_simple(e),
        Expr::Binary(_, l, r) => is_simple(l) && is_simple(r),
        Expr::Constant(c) => !c.is_false(),
        Expr::Read(_) => true,
        _ => false,
    }
}

/// Whether a known global's template may be expanded at its call sites.
pub fn is_inlinable(template: &ClosureTemplate) -> bool {
    !template.has_heap_frame
        && !template.is_closure
        && !template.inlined
        && !template.rest
        && matches!(&template.body, Some(Stmt::Return(e)) if is_simple(e))
}

/// Fresh copy of `template` with its own slots, so a shared template can
/// be inlined at any number of call sites.
pub fn rewrite_body(template: &TemplateRef) -> TemplateRef {
    let t = template.get();
    let copy = ClosureTemplate::new(
        intern(format!("temp-inline:{}", t.name)),
        t.parent().as_ref(),
    );
    let mut map = HashMap::new();
    for param in &t.parameters {
        let fresh = add_parameter(&copy, param.get().name);
        copy_flags(param, &fresh);
        map.insert(param.addr(), fresh);
    }
    for local in &t.variables {
        let (name, kind) = {
            let l = local.get();
            (l.name, l.kind)
        };
        let fresh = add_local(&copy, name, kind);
        copy_flags(local, &fresh);
        map.insert(local.addr(), fresh);
    }
    let body = t.body.as_ref().map(|b| substitute_stmt(b, &map));
    let rest = t.rest;
    drop(t);

    {
        let mut c = copy.get_mut();
        c.body = body;
        c.rest = rest;
    }
    copy
}

fn copy_flags(from: &SlotRef, to: &SlotRef) {
    let (captured, uninitialized, ty) = {
        let f = from.get();
        (f.captured, f.uninitialized, f.ty)
    };
    let mut t = to.get_mut();
    t.captured = captured;
    t.uninitialized = uninitialized;
    t.ty = ty;
}

type SlotMap = HashMap<usize, SlotRef>;

fn substitute_slot(slot: &SlotRef, map: &SlotMap) -> SlotRef {
    map.get(&slot.addr()).cloned().unwrap_or_else(|| slot.clone())
}

fn substitute_stmt(stmt: &Stmt, map: &SlotMap) -> Stmt {
    match stmt {
        Stmt::Block(stmts) => Stmt::Block(stmts.iter().map(|s| substitute_stmt(s, map)).collect()),
        Stmt::If(clauses, els) => Stmt::If(
            clauses
                .iter()
                .map(|c| IfClause {
                    test: substitute_expr(&c.test, map),
                    body: substitute_stmt(&c.body, map),
                    span: c.span.clone(),
                })
                .collect(),
            els.as_ref().map(|e| Box::new(substitute_stmt(e, map))),
        ),
        Stmt::Return(e) => Stmt::Return(substitute_expr(e, map)),
        Stmt::Expression(e) => Stmt::Expression(substitute_expr(e, map)),
    }
}

fn substitute_all(exprs: &[Expr], map: &SlotMap) -> Vec<Expr> {
    exprs.iter().map(|e| substitute_expr(e, map)).collect()
}

fn substitute_expr(expr: &Expr, map: &SlotMap) -> Expr {
    let sub = |e: &Expr| Box::new(substitute_expr(e, map));
    match expr {
        Expr::Read(slot) => Expr::Read(substitute_slot(slot, map)),
        Expr::Write(slot, value) => Expr::Write(substitute_slot(slot, map), sub(value)),
        Expr::Call(call) => Expr::Call(Call {
            callee: sub(&call.callee),
            args: substitute_all(&call.args, map),
            convention: call.convention,
            tail: call.tail,
            span: call.span.clone(),
        }),
        Expr::Invoke(invoke) => Expr::Invoke(Invoke {
            template: invoke.template.clone(),
            args: substitute_all(&invoke.args, map),
            needs_context: invoke.needs_context,
            entry: invoke.entry,
            tail: invoke.tail,
            span: invoke.span.clone(),
        }),
        Expr::Native(native) => Expr::Native(Native {
            builtin: native.builtin.clone(),
            overload: native.overload,
            args: substitute_all(&native.args, map),
            tail: native.tail,
            span: native.span.clone(),
        }),
        Expr::Runtime(service, args) => Expr::Runtime(*service, substitute_all(args, map)),
        Expr::Conditional(test, then, els) => Expr::Conditional(sub(test), sub(then), sub(els)),
        Expr::Sequence(prefix, tail) => Expr::Sequence(substitute_all(prefix, map), sub(tail)),
        Expr::TypeTest(e, ty) => Expr::TypeTest(sub(e), *ty),
        Expr::Convert(e, ty) => Expr::Convert(sub(e), *ty),
        Expr::Binary(op, l, r) => Expr::Binary(*op, sub(l), sub(r)),
        Expr::NewArray(ty, elems) => Expr::NewArray(*ty, substitute_all(elems, map)),
        Expr::ArrayIndex(e, i) => Expr::ArrayIndex(sub(e), *i),
        // Nested templates keep their own slots; simple bodies never hold one.
        Expr::Constant(_) | Expr::MakeClosure(_) | Expr::FieldRead(_) | Expr::Context => {
            expr.clone()
        }
    }
}
