//! Compile-time evaluation of calls with literal arguments.
//!
//! Folding runs the callee on a fuel-bounded, sealed machine: global writes
//! made while folding are discarded with it. Any failure, including a panic
//! inside a native procedure, declines the fold and leaves the call to be
//! compiled normally.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use super::{
    convention::needs_context,
    scope::TemplateRef,
    sexpr::Sexpr,
    tree_il::{Expr, Field, Type},
    Cenv,
};
use crate::runtime::{builtins::Builtin, Fuel, Machine, RuntimeError, Value};

/// Expression producing the literal `datum`.
pub fn quote_literal(datum: &Sexpr) -> Expr {
    match datum {
        Sexpr::Vector(xs) => Expr::NewArray(Type::Object, xs.iter().map(quote_literal).collect()),
        Sexpr::Bytevector(bytes) => Expr::NewArray(
            Type::Byte,
            bytes
                .iter()
                .map(|b| Expr::Constant(Sexpr::Fixnum(*b as i64)))
                .collect(),
        ),
        Sexpr::Unspecified => Expr::FieldRead(Field::Unspecified),
        Sexpr::Uninitialized => Expr::FieldRead(Field::Uninitialized),
        _ => Expr::Constant(datum.clone()),
    }
}

/// The literal values of `args`, if every one is a constant.
pub fn constant_args(args: &[Expr]) -> Option<Vec<Value>> {
    args.iter()
        .map(|arg| match arg {
            Expr::Constant(datum) => Some(Value::from_datum(datum)),
            _ => None,
        })
        .collect()
}

fn fold_with<F>(cenv: &Cenv, what: &str, run: F) -> Option<Expr>
where
    F: FnOnce(&mut Machine) -> Result<Value, RuntimeError>,
{
    let mut machine = Machine::new(cenv.env().clone())
        .sealed()
        .with_fuel(Fuel::with(cenv.options().fold_fuel));
    match catch_unwind(AssertUnwindSafe(|| run(&mut machine))) {
        Ok(Ok(_)) if machine.wrote_globals() => {
            log::debug!(target: "constfold", "not folding {}: it assigns globals", what);
            None
        }
        Ok(Ok(value)) => match value.to_datum() {
            Some(datum) => {
                log::debug!(target: "constfold", "folded {} to {}", what, value);
                Some(quote_literal(&datum))
            }
            None => {
                log::trace!(target: "constfold", "{} produced a non-literal value", what);
                None
            }
        },
        Ok(Err(err)) => {
            log::debug!(target: "constfold", "not folding {}: {}", what, err);
            None
        }
        Err(_) => {
            log::debug!(target: "constfold", "not folding {}: procedure panicked", what);
            None
        }
    }
}

/// Folds a call to `builtin` when it permits it and every argument is a
/// literal.
pub fn fold_builtin(
    cenv: &Cenv,
    builtin: &Arc<Builtin>,
    overload: Option<usize>,
    args: &[Expr],
) -> Option<Expr> {
    if !builtin.allow_constant_fold || !cenv.options().fold_constants {
        return None;
    }
    let values = constant_args(args)?;
    let what = builtin.name.to_string();
    fold_with(cenv, &what, |machine| {
        let overload = match overload {
            Some(overload) => overload,
            None => builtin.select(&values)?,
        };
        machine.call_native(builtin, overload, &values)
    })
}

/// Folds a call to a known user procedure. `variadic` templates receive
/// their surplus arguments as a list.
pub fn fold_closure(
    cenv: &Cenv,
    template: &TemplateRef,
    variadic: bool,
    args: &[Expr],
) -> Option<Expr> {
    if !cenv.options().fold_constants || needs_context(&template.get()) {
        return None;
    }
    let mut values = constant_args(args)?;
    let (name, required) = {
        let t = template.get();
        (t.name, t.required())
    };
    if variadic {
        if values.len() < required {
            return None;
        }
        let surplus = values.split_off(required);
        values.push(Value::list(surplus));
    }
    let what = name.to_string();
    fold_with(cenv, &what, |machine| machine.invoke(template, None, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_quote_by_kind() {
        assert!(matches!(
            quote_literal(&Sexpr::Fixnum(3)),
            Expr::Constant(Sexpr::Fixnum(3))
        ));
        assert!(matches!(
            quote_literal(&Sexpr::Unspecified),
            Expr::FieldRead(Field::Unspecified)
        ));
        let v = Sexpr::Vector(vec![Sexpr::Fixnum(1), Sexpr::Boolean(false)].into());
        let Expr::NewArray(Type::Object, elems) = quote_literal(&v) else {
            panic!("expected an array");
        };
        assert_eq!(elems.len(), 2);
        let bv = Sexpr::Bytevector(vec![1u8, 2, 255].into());
        assert!(matches!(quote_literal(&bv), Expr::NewArray(Type::Byte, xs) if xs.len() == 3));
    }

    #[test]
    fn constant_args_require_every_literal() {
        let one = Expr::Constant(Sexpr::Fixnum(1));
        assert_eq!(constant_args(&[one.clone(), one.clone()]).map(|v| v.len()), Some(2));
        assert!(constant_args(&[one, Expr::Context]).is_none());
        assert_eq!(constant_args(&[]).map(|v| v.len()), Some(0));
    }
}
