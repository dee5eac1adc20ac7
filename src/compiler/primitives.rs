//! Open-coding primitive procedures
//!
//! Inline macros expand a call to a primitive straight into IR. Each entry is
//! keyed by tier; an expander returning `None` declines and the call falls
//! through to overload resolution.

use super::{
    options::OptimizationLevel,
    sexpr::{intern, Sexpr, Symbol},
    tree_il::{BinaryOp, Expr, Type},
};

pub struct InlineMacroEntry {
    pub name: Symbol,
    pub tier: OptimizationLevel,
    pub expand: fn(&[Expr]) -> Option<Expr>,
}

macro_rules! table {
    ($table_name: ident => $($name: literal, $tier: ident, $argc: literal => ($args: ident) $b: block)*) => {
        pub fn $table_name() -> Vec<InlineMacroEntry> {
            vec![$(InlineMacroEntry {
                name: intern($name),
                tier: OptimizationLevel::$tier,
                expand: {
                    fn f($args: &[Expr]) -> Option<Expr> {
                        if $args.len() != $argc {
                            return None;
                        }
                        $b
                    }
                    f
                },
            }),*]
        }
    };
}

table! {
    inline_macro_table =>
        "eq?", Safe, 2 => (args) {
            Some(Expr::Binary(
                BinaryOp::Eq,
                Box::new(args[0].clone()),
                Box::new(args[1].clone()),
            ))
        }

        "not", Safe, 1 => (args) {
            Some(Expr::Binary(
                BinaryOp::Eq,
                Box::new(args[0].clone()),
                Box::new(Expr::Constant(Sexpr::Boolean(false))),
            ))
        }

        "null?", Basic, 1 => (args) {
            Some(Expr::TypeTest(Box::new(args[0].clone()), Type::Null))
        }

        "pair?", Basic, 1 => (args) {
            Some(Expr::TypeTest(Box::new(args[0].clone()), Type::Pair))
        }

        "vector-ref", Full, 2 => (args) {
            let Expr::Constant(Sexpr::Fixnum(ix)) = &args[1] else {
                return None;
            };
            let ix = usize::try_from(*ix).ok()?;
            Some(Expr::ArrayIndex(
                Box::new(Expr::Convert(Box::new(args[0].clone()), Type::Vector)),
                ix,
            ))
        }
}
