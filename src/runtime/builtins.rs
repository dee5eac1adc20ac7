//! Native procedures.
//!
//! Every builtin carries a list of typed overloads. The compiler picks one
//! statically when it can; the evaluator picks one per call otherwise.

use std::sync::Arc;

use num_traits::Zero;

use super::{error::RuntimeError, eval::Machine, value::Value};
use crate::compiler::{
    sexpr::{intern, Symbol},
    tree_il::Type,
};

pub type NativeFn = fn(&mut Machine, &[Value]) -> Result<Value, RuntimeError>;

pub struct Overload {
    pub params: Vec<Type>,
    pub rest: Option<Type>,
    pub ret: Type,
    /// Receives the caller's compilation context as a leading argument.
    pub needs_context: bool,
    pub fun: NativeFn,
}

impl Overload {
    pub fn new(params: &[Type], rest: Option<Type>, ret: Type, fun: NativeFn) -> Self {
        Self {
            params: params.to_vec(),
            rest,
            ret,
            needs_context: false,
            fun,
        }
    }

    pub fn with_context(mut self) -> Self {
        self.needs_context = true;
        self
    }

    pub fn accepts_count(&self, argc: usize) -> bool {
        if self.rest.is_some() {
            argc >= self.params.len()
        } else {
            argc == self.params.len()
        }
    }

    fn param_type(&self, i: usize) -> Type {
        self.params
            .get(i)
            .copied()
            .or(self.rest)
            .unwrap_or(Type::Object)
    }

    fn matches(&self, types: &[Type], exact: bool) -> bool {
        self.accepts_count(types.len())
            && types.iter().enumerate().all(|(i, ty)| {
                let param = self.param_type(i);
                if exact {
                    *ty == param
                } else {
                    ty.is_assignable_to(param)
                }
            })
    }
}

pub struct Builtin {
    pub name: Symbol,
    pub overloads: Vec<Overload>,
    pub allow_constant_fold: bool,
}

impl Builtin {
    pub fn new(name: &str, allow_constant_fold: bool, overloads: Vec<Overload>) -> Self {
        Self {
            name: intern(name),
            overloads,
            allow_constant_fold,
        }
    }

    /// Exact structural match first, then the first assignable overload.
    pub fn resolve(&self, types: &[Type]) -> Option<usize> {
        self.overloads
            .iter()
            .position(|o| o.matches(types, true))
            .or_else(|| self.overloads.iter().position(|o| o.matches(types, false)))
    }

    /// Overload for a call made through a procedure value.
    pub fn select(&self, args: &[Value]) -> Result<usize, RuntimeError> {
        let types = args.iter().map(Value::ty).collect::<Vec<_>>();
        self.resolve(&types)
            .or_else(|| self.overloads.iter().position(|o| o.accepts_count(args.len())))
            .ok_or_else(|| RuntimeError::Arity {
                procedure: self.name.to_string(),
                expected: self.arity_description(),
                got: args.len(),
            })
    }

    fn arity_description(&self) -> String {
        self.overloads
            .iter()
            .map(|o| match o.rest {
                Some(_) => format!("at least {}", o.params.len()),
                None => o.params.len().to_string(),
            })
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

impl std::fmt::Debug for Builtin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<builtin {}>", self.name)
    }
}

fn numbers(name: &str, args: &[Value]) -> Result<Vec<num::BigRational>, RuntimeError> {
    args.iter()
        .map(|arg| {
            arg.as_rational()
                .ok_or_else(|| RuntimeError::wrong_type(name, "number", arg))
        })
        .collect()
}

fn fixnum_add(machine: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    match (&args[0], &args[1]) {
        (Value::Fixnum(a), Value::Fixnum(b)) => match a.checked_add(*b) {
            Some(x) => Ok(Value::Fixnum(x)),
            None => add(machine, args),
        },
        _ => add(machine, args),
    }
}

fn add(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let xs = numbers("+", args)?;
    Ok(Value::from_rational(
        xs.into_iter().fold(num::BigRational::zero(), |a, b| a + b),
    ))
}

fn mul(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let xs = numbers("*", args)?;
    Ok(Value::from_rational(
        xs.into_iter()
            .fold(num::BigRational::from_integer(1.into()), |a, b| a * b),
    ))
}

fn sub(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let xs = numbers("-", args)?;
    let mut it = xs.into_iter();
    let first = it.next().unwrap_or_else(num::BigRational::zero);
    let rest = it.collect::<Vec<_>>();
    if rest.is_empty() {
        return Ok(Value::from_rational(-first));
    }
    Ok(Value::from_rational(
        rest.into_iter().fold(first, |a, b| a - b),
    ))
}

fn div(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let xs = numbers("/", args)?;
    let mut it = xs.into_iter();
    let first = it.next().unwrap_or_else(num::BigRational::zero);
    let rest = it.collect::<Vec<_>>();
    if rest.is_empty() {
        if first.is_zero() {
            return Err(RuntimeError::DivisionByZero);
        }
        return Ok(Value::from_rational(first.recip()));
    }
    let mut acc = first;
    for x in rest {
        if x.is_zero() {
            return Err(RuntimeError::DivisionByZero);
        }
        acc /= x;
    }
    Ok(Value::from_rational(acc))
}

fn num_eq(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let xs = numbers("=", args)?;
    Ok(Value::Boolean(xs.windows(2).all(|w| w[0] == w[1])))
}

fn num_lt(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let xs = numbers("<", args)?;
    Ok(Value::Boolean(xs.windows(2).all(|w| w[0] < w[1])))
}

fn cons(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::cons(args[0].clone(), args[1].clone()))
}

fn car(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Pair(p) => Ok(p.0.clone()),
        other => Err(RuntimeError::wrong_type("car", "pair", other)),
    }
}

fn cdr(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Pair(p) => Ok(p.1.clone()),
        other => Err(RuntimeError::wrong_type("cdr", "pair", other)),
    }
}

fn list(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::list(args.iter().cloned()))
}

fn is_null(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Null)))
}

fn is_pair(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(matches!(args[0], Value::Pair(_))))
}

fn not(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(!args[0].is_true()))
}

fn is_eq(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Boolean(args[0].eq(&args[1])))
}

fn vector(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Vector(args.iter().cloned().collect()))
}

fn vector_ref(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let Value::Vector(xs) = &args[0] else {
        return Err(RuntimeError::wrong_type("vector-ref", "vector", &args[0]));
    };
    let index = match &args[1] {
        Value::Fixnum(ix) if *ix >= 0 => *ix as usize,
        other => return Err(RuntimeError::wrong_type("vector-ref", "index", other)),
    };
    xs.get(index).cloned().ok_or(RuntimeError::IndexOutOfRange {
        index,
        len: xs.len(),
    })
}

fn values(_: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() == 1 {
        Ok(args[0].clone())
    } else {
        Ok(Value::Values(args.iter().cloned().collect()))
    }
}

fn call_with_values(machine: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let produced = machine.apply(&args[0], vec![])?;
    let spread = match produced {
        Value::Values(vs) => vs.to_vec(),
        single => vec![single],
    };
    machine.apply(&args[1], spread)
}

fn apply(machine: &mut Machine, args: &[Value]) -> Result<Value, RuntimeError> {
    let (last, init) = match args[1..].split_last() {
        Some((last, init)) => (last, init),
        None => return machine.apply(&args[0], vec![]),
    };
    let mut spread = init.to_vec();
    spread.extend(
        last.list_to_vec()
            .ok_or_else(|| RuntimeError::wrong_type("apply", "list", last))?,
    );
    machine.apply(&args[0], spread)
}

pub fn standard_builtins() -> Vec<Builtin> {
    use Type::*;
    vec![
        Builtin::new(
            "+",
            true,
            vec![
                Overload::new(&[Integer, Integer], None, Integer, fixnum_add),
                Overload::new(&[], Some(Object), Number, add),
            ],
        ),
        Builtin::new(
            "-",
            true,
            vec![Overload::new(&[Object], Some(Object), Number, sub)],
        ),
        Builtin::new(
            "*",
            true,
            vec![Overload::new(&[], Some(Object), Number, mul)],
        ),
        Builtin::new(
            "/",
            true,
            vec![Overload::new(&[Object], Some(Object), Number, div)],
        ),
        Builtin::new(
            "=",
            true,
            vec![Overload::new(&[Object, Object], Some(Object), Boolean, num_eq)],
        ),
        Builtin::new(
            "<",
            true,
            vec![Overload::new(&[Object, Object], Some(Object), Boolean, num_lt)],
        ),
        Builtin::new(
            "cons",
            false,
            vec![Overload::new(&[Object, Object], None, Pair, cons)],
        ),
        Builtin::new(
            "car",
            true,
            vec![
                Overload::new(&[Pair], None, Object, car),
                Overload::new(&[Object], None, Object, car),
            ],
        ),
        Builtin::new(
            "cdr",
            true,
            vec![
                Overload::new(&[Pair], None, Object, cdr),
                Overload::new(&[Object], None, Object, cdr),
            ],
        ),
        Builtin::new(
            "list",
            false,
            vec![Overload::new(&[], Some(Object), List, list)],
        ),
        Builtin::new(
            "null?",
            true,
            vec![Overload::new(&[Object], None, Boolean, is_null)],
        ),
        Builtin::new(
            "pair?",
            true,
            vec![Overload::new(&[Object], None, Boolean, is_pair)],
        ),
        Builtin::new(
            "not",
            true,
            vec![Overload::new(&[Object], None, Boolean, not)],
        ),
        Builtin::new(
            "eq?",
            false,
            vec![Overload::new(&[Object, Object], None, Boolean, is_eq)],
        ),
        Builtin::new(
            "vector",
            false,
            vec![Overload::new(&[], Some(Object), Vector, vector)],
        ),
        Builtin::new(
            "vector-ref",
            true,
            vec![
                Overload::new(&[Vector, Integer], None, Object, vector_ref),
                Overload::new(&[Object, Object], None, Object, vector_ref),
            ],
        ),
        Builtin::new(
            "values",
            false,
            vec![Overload::new(&[], Some(Object), Object, values)],
        ),
        Builtin::new(
            "call-with-values",
            false,
            vec![Overload::new(&[Object, Object], None, Object, call_with_values)],
        ),
        Builtin::new(
            "apply",
            false,
            vec![Overload::new(&[Object], Some(Object), Object, apply).with_context()],
        ),
    ]
}

pub fn standard_builtin_refs() -> Vec<Arc<Builtin>> {
    standard_builtins().into_iter().map(Arc::new).collect()
}
