use std::sync::Arc;

use num::{BigInt, BigRational};
use num_traits::{One, ToPrimitive, Zero};

use super::{builtins::Builtin, eval::Frames};
use crate::compiler::{
    scope::TemplateRef,
    sexpr::{Sexpr, Symbol},
    tree_il::Type,
};

#[derive(Clone)]
pub enum Value {
    Null,
    Unspecified,
    Uninitialized,
    Boolean(bool),
    Fixnum(i64),
    BigInt(Arc<BigInt>),
    Rational(Arc<BigRational>),
    String(Arc<str>),
    Bytevector(Arc<[u8]>),
    Symbol(Symbol),
    Pair(Arc<(Value, Value)>),
    Vector(Arc<[Value]>),
    Procedure(Procedure),
    /// Result of `values` with other than one value.
    Values(Arc<[Value]>),
    Context(Frames),
}

#[derive(Clone)]
pub enum Procedure {
    Builtin(Arc<Builtin>),
    Closure(Arc<Closure>),
}

pub struct Closure {
    pub template: TemplateRef,
    pub env: Frames,
}

impl Procedure {
    pub fn ptr_eq(&self, other: &Procedure) -> bool {
        match (self, other) {
            (Procedure::Builtin(a), Procedure::Builtin(b)) => Arc::ptr_eq(a, b),
            (Procedure::Closure(a), Procedure::Closure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Value {
    pub fn from_datum(datum: &Sexpr) -> Value {
        match datum {
            Sexpr::Null => Value::Null,
            Sexpr::Unspecified => Value::Unspecified,
            Sexpr::Uninitialized => Value::Uninitialized,
            Sexpr::Boolean(b) => Value::Boolean(*b),
            Sexpr::Fixnum(x) => Value::Fixnum(*x),
            Sexpr::BigInt(x) => Value::BigInt(x.clone()),
            Sexpr::Rational(x) => Value::Rational(x.clone()),
            Sexpr::String(x) => Value::String(x.clone()),
            Sexpr::Bytevector(x) => Value::Bytevector(x.clone()),
            Sexpr::Symbol(x) => Value::Symbol(*x),
            Sexpr::Vector(xs) => Value::Vector(xs.iter().map(Value::from_datum).collect()),
            Sexpr::Pair(_) => {
                let mut items = vec![];
                let mut ls = datum;
                while let Sexpr::Pair(p) = ls {
                    items.push(Value::from_datum(&p.0));
                    ls = &p.1;
                }
                let tail = Value::from_datum(ls);
                items
                    .into_iter()
                    .rev()
                    .fold(tail, |tail, head| Value::cons(head, tail))
            }
        }
    }

    /// Literal form of a value, if it has one. Procedures, multiple values
    /// and contexts do not.
    pub fn to_datum(&self) -> Option<Sexpr> {
        Some(match self {
            Value::Null => Sexpr::Null,
            Value::Unspecified => Sexpr::Unspecified,
            Value::Uninitialized => Sexpr::Uninitialized,
            Value::Boolean(b) => Sexpr::Boolean(*b),
            Value::Fixnum(x) => Sexpr::Fixnum(*x),
            Value::BigInt(x) => Sexpr::BigInt(x.clone()),
            Value::Rational(x) => Sexpr::Rational(x.clone()),
            Value::String(x) => Sexpr::String(x.clone()),
            Value::Bytevector(x) => Sexpr::Bytevector(x.clone()),
            Value::Symbol(x) => Sexpr::Symbol(*x),
            Value::Vector(xs) => Sexpr::Vector(
                xs.iter()
                    .map(Value::to_datum)
                    .collect::<Option<Vec<_>>>()?
                    .into(),
            ),
            Value::Pair(_) => {
                let mut items = vec![];
                let mut ls = self;
                while let Value::Pair(p) = ls {
                    items.push(p.0.to_datum()?);
                    ls = &p.1;
                }
                let tail = ls.to_datum()?;
                items
                    .into_iter()
                    .rev()
                    .fold(tail, |tail, head| crate::compiler::sexpr::cons(head, tail))
            }
            Value::Procedure(_) | Value::Values(_) | Value::Context(_) => return None,
        })
    }

    pub fn cons(car: Value, cdr: Value) -> Value {
        Value::Pair(Arc::new((car, cdr)))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        let items = items.into_iter().collect::<Vec<_>>();
        items
            .into_iter()
            .rev()
            .fold(Value::Null, |tail, head| Value::cons(head, tail))
    }

    pub fn list_to_vec(&self) -> Option<Vec<Value>> {
        let mut out = vec![];
        let mut ls = self;
        loop {
            match ls {
                Value::Null => return Some(out),
                Value::Pair(p) => {
                    out.push(p.0.clone());
                    ls = &p.1;
                }
                _ => return None,
            }
        }
    }

    pub fn is_true(&self) -> bool {
        !matches!(self, Value::Boolean(false))
    }

    pub fn ty(&self) -> Type {
        match self {
            Value::Null => Type::Null,
            Value::Unspecified => Type::Unspecified,
            Value::Uninitialized => Type::Uninitialized,
            Value::Boolean(_) => Type::Boolean,
            Value::Fixnum(_) | Value::BigInt(_) => Type::Integer,
            Value::Rational(_) => Type::Rational,
            Value::String(_) => Type::String,
            Value::Bytevector(_) => Type::ByteArray,
            Value::Symbol(_) => Type::Symbol,
            Value::Pair(_) => Type::Pair,
            Value::Vector(_) => Type::Vector,
            Value::Procedure(_) => Type::Callable,
            Value::Values(_) => Type::Object,
            Value::Context(_) => Type::Context,
        }
    }

    pub fn is_type(&self, ty: Type) -> bool {
        self.ty().is_assignable_to(ty)
    }

    pub fn as_rational(&self) -> Option<BigRational> {
        match self {
            Value::Fixnum(x) => Some(BigRational::from_integer(BigInt::from(*x))),
            Value::BigInt(x) => Some(BigRational::from_integer((**x).clone())),
            Value::Rational(x) => Some((**x).clone()),
            _ => None,
        }
    }

    /// Exact number, normalized to the smallest representation.
    pub fn from_rational(x: BigRational) -> Value {
        if x.denom().is_one() {
            let n = x.numer();
            match n.to_i64() {
                Some(n) => Value::Fixnum(n),
                None => Value::BigInt(Arc::new(n.clone())),
            }
        } else {
            Value::Rational(Arc::new(x))
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_rational().map_or(false, |x| x.is_zero())
    }

    /// `eq?`: identity for heap objects, value equality for immediates and
    /// numbers.
    pub fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null)
            | (Value::Unspecified, Value::Unspecified)
            | (Value::Uninitialized, Value::Uninitialized) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Rational(a), Value::Rational(b)) => a == b,
            (Value::String(a), Value::String(b)) => Arc::ptr_eq(a, b),
            (Value::Bytevector(a), Value::Bytevector(b)) => Arc::ptr_eq(a, b),
            (Value::Pair(a), Value::Pair(b)) => Arc::ptr_eq(a, b),
            (Value::Vector(a), Value::Vector(b)) => Arc::ptr_eq(a, b),
            (Value::Procedure(a), Value::Procedure(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Procedure(Procedure::Builtin(b)) => write!(f, "#<procedure {}>", b.name),
            Value::Procedure(Procedure::Closure(c)) => {
                write!(f, "#<procedure {}>", c.template.get().name)
            }
            Value::Values(vs) => {
                f.write_str("#<values")?;
                for v in vs.iter() {
                    write!(f, " {}", v)?;
                }
                f.write_str(">")
            }
            Value::Context(_) => f.write_str("#<context>"),
            Value::Pair(_) => {
                f.write_str("(")?;
                let mut ls = self;
                let mut first = true;
                while let Value::Pair(p) = ls {
                    if !first {
                        f.write_str(" ")?;
                    }
                    first = false;
                    write!(f, "{}", p.0)?;
                    ls = &p.1;
                }
                if !matches!(ls, Value::Null) {
                    write!(f, " . {}", ls)?;
                }
                f.write_str(")")
            }
            Value::Vector(xs) => {
                f.write_str("#(")?;
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", x)?;
                }
                f.write_str(")")
            }
            other => match other.to_datum() {
                Some(datum) => write!(f, "{}", datum),
                None => f.write_str("#<object>"),
            },
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::sexpr::{sym, Sexpr};

    #[test]
    fn quoted_lists_become_runtime_pairs() {
        let datum = Sexpr::list([sym("a"), Sexpr::Fixnum(2), Sexpr::Vector(Arc::from(vec![Sexpr::Null]))]);
        let value = Value::from_datum(&datum);
        assert_eq!(value.to_string(), "(a 2 #(()))");
        let back = value.to_datum().unwrap();
        assert!(crate::compiler::sexpr::sexp_equal(&datum, &back));
    }

    #[test]
    fn rationals_normalize() {
        let half = BigRational::new(BigInt::from(1), BigInt::from(2));
        assert!(matches!(Value::from_rational(half.clone() + half), Value::Fixnum(1)));
    }

    #[test]
    fn eq_is_identity_on_pairs() {
        let a = Value::cons(Value::Fixnum(1), Value::Null);
        let b = Value::cons(Value::Fixnum(1), Value::Null);
        assert!(a.eq(&a.clone()));
        assert!(!a.eq(&b));
        assert!(Value::Fixnum(3).eq(&Value::Fixnum(3)));
    }
}
