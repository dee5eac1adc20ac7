//! S-expression definition.
//!
//! The reader hands the compiler immutable trees built from these nodes, with
//! symbols already interned and literals already typed. Nothing in the
//! compiler mutates a tree it was given.

use std::{collections::HashMap, sync::Arc};

use lasso::{Spur, ThreadedRodeo};
use num::{BigInt, BigRational};
use num_traits::{One, ToPrimitive};
use once_cell::sync::Lazy;
use pretty::{BoxAllocator, DocAllocator, DocBuilder};
use termcolor::{Color, ColorSpec, WriteColor};

static SYMBOLS: Lazy<ThreadedRodeo> = Lazy::new(ThreadedRodeo::new);

/// Interned symbol. Two symbols are the same symbol iff they compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Spur);

impl Symbol {
    pub fn as_str(&self) -> &'static str {
        SYMBOLS.resolve(&self.0)
    }
}

pub fn intern(name: impl AsRef<str>) -> Symbol {
    Symbol(SYMBOLS.get_or_intern(name.as_ref()))
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}", self.as_str())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Sexpr {
    Null,
    Unspecified,
    Uninitialized,
    Boolean(bool),
    Fixnum(i64),
    BigInt(Arc<BigInt>),
    Rational(Arc<BigRational>),
    String(Arc<str>),
    Bytevector(Arc<[u8]>),
    Vector(Arc<[Sexpr]>),
    Symbol(Symbol),
    Pair(Arc<(Sexpr, Sexpr)>),
}

pub fn cons(car: Sexpr, cdr: Sexpr) -> Sexpr {
    Sexpr::Pair(Arc::new((car, cdr)))
}

pub fn sym(name: &str) -> Sexpr {
    Sexpr::Symbol(intern(name))
}

impl Sexpr {
    pub fn list(exprs: impl IntoIterator<Item = Sexpr>) -> Sexpr {
        let items = exprs.into_iter().collect::<Vec<_>>();
        items
            .into_iter()
            .rev()
            .fold(Sexpr::Null, |tail, head| cons(head, tail))
    }

    /// Builds an exact integer, keeping it a fixnum whenever it fits.
    pub fn integer(value: BigInt) -> Sexpr {
        match value.to_i64() {
            Some(x) => Sexpr::Fixnum(x),
            None => Sexpr::BigInt(Arc::new(value)),
        }
    }

    /// Builds an exact rational, collapsing to an integer on a unit denominator.
    pub fn rational(value: BigRational) -> Sexpr {
        if value.denom().is_one() {
            Sexpr::integer(value.numer().clone())
        } else {
            Sexpr::Rational(Arc::new(value))
        }
    }

    pub fn string(s: &str) -> Sexpr {
        Sexpr::String(Arc::from(s))
    }

    pub fn pair(&self) -> Option<(&Sexpr, &Sexpr)> {
        match self {
            Self::Pair(p) => Some((&p.0, &p.1)),
            _ => None,
        }
    }

    pub fn car(&self) -> Option<&Sexpr> {
        self.pair().map(|(car, _)| car)
    }

    pub fn cdr(&self) -> Option<&Sexpr> {
        self.pair().map(|(_, cdr)| cdr)
    }

    pub fn symbol(&self) -> Option<Symbol> {
        match self {
            Self::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    pub fn is_symbol_named(&self, name: &str) -> bool {
        matches!(self, Self::Symbol(s) if s.as_str() == name)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, Self::Pair(_))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Self::Boolean(false))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Self::Fixnum(_) | Self::BigInt(_) | Self::Rational(_))
    }

    /// Elements of a proper list. Walks iteratively, so improper tails are
    /// reported as `None` instead of being recursed on.
    pub fn proper_list(&self) -> Option<Vec<Sexpr>> {
        let mut out = Vec::new();
        let mut ls = self;
        loop {
            match ls {
                Self::Null => return Some(out),
                Self::Pair(p) => {
                    out.push(p.0.clone());
                    ls = &p.1;
                }
                _ => return None,
            }
        }
    }

    /// Length of a proper list, `None` for anything else.
    pub fn list_length(&self) -> Option<usize> {
        let mut n = 0;
        let mut ls = self;
        loop {
            match ls {
                Self::Null => return Some(n),
                Self::Pair(p) => {
                    n += 1;
                    ls = &p.1;
                }
                _ => return None,
            }
        }
    }

    /// Identity of a pair node, used to key source locations.
    pub fn pair_addr(&self) -> Option<usize> {
        match self {
            Self::Pair(p) => Some(Arc::as_ptr(p) as usize),
            _ => None,
        }
    }
}

/// Structural equality (`equal?`).
pub fn sexp_equal(x: &Sexpr, y: &Sexpr) -> bool {
    let (mut x, mut y) = (x, y);
    loop {
        return match (x, y) {
            (Sexpr::Null, Sexpr::Null) => true,
            (Sexpr::Unspecified, Sexpr::Unspecified) => true,
            (Sexpr::Uninitialized, Sexpr::Uninitialized) => true,
            (Sexpr::Boolean(a), Sexpr::Boolean(b)) => a == b,
            (Sexpr::Fixnum(a), Sexpr::Fixnum(b)) => a == b,
            (Sexpr::BigInt(a), Sexpr::BigInt(b)) => a == b,
            (Sexpr::Rational(a), Sexpr::Rational(b)) => a == b,
            (Sexpr::String(a), Sexpr::String(b)) => a == b,
            (Sexpr::Bytevector(a), Sexpr::Bytevector(b)) => a == b,
            (Sexpr::Symbol(a), Sexpr::Symbol(b)) => a == b,
            (Sexpr::Vector(a), Sexpr::Vector(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(a, b)| sexp_equal(a, b))
            }
            (Sexpr::Pair(a), Sexpr::Pair(b)) => {
                if !sexp_equal(&a.0, &b.0) {
                    return false;
                }
                x = &a.1;
                y = &b.1;
                continue;
            }
            _ => false,
        };
    }
}

/// Source location of a parsed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpan {
    pub file: Arc<str>,
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Mapping from pair nodes to source locations, filled by the reader.
///
/// Keys are node identities, so the map is only meaningful while the tree it
/// was built for is alive.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    spans: HashMap<usize, SourceSpan>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sexpr: &Sexpr) -> Option<SourceSpan> {
        sexpr.pair_addr().and_then(|addr| self.spans.get(&addr).cloned())
    }

    pub fn mark(&mut self, sexpr: &Sexpr, span: SourceSpan) {
        if let Some(addr) = sexpr.pair_addr() {
            self.spans.insert(addr, span);
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl Sexpr {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        match self {
            Self::Symbol(name) => allocator.text(name.as_str()),
            Self::Pair(pair) => {
                let mut docs = vec![];

                let mut pair = pair.clone();
                loop {
                    docs.push(pair.0.pretty(allocator));
                    match &pair.1 {
                        Self::Pair(x) => pair = x.clone(),
                        Self::Null => break,
                        tail => {
                            docs.push(allocator.text("."));
                            docs.push(tail.pretty(allocator));
                            break;
                        }
                    }
                }

                allocator
                    .intersperse(docs, allocator.softline())
                    .group()
                    .parens()
            }

            Self::Vector(vec) => allocator.text("#").append(
                allocator
                    .intersperse(
                        vec.iter().map(|x| x.pretty(allocator)),
                        allocator.softline(),
                    )
                    .group()
                    .parens(),
            ),

            Self::Boolean(true) => allocator.text("#t"),
            Self::Boolean(false) => allocator.text("#f"),
            Self::Fixnum(x) => allocator.text(x.to_string()),
            Self::BigInt(x) => allocator.text(x.to_string()),
            Self::Rational(x) => allocator.text(x.to_string()),
            Self::String(x) => allocator
                .text(escape_string(x))
                .annotate(ColorSpec::new().set_fg(Some(Color::Green)).clone()),
            Self::Null => allocator.text("()"),
            Self::Unspecified => allocator.text("#<unspecified>"),
            Self::Uninitialized => allocator.text("#<uninitialized>"),
            Self::Bytevector(x) => allocator.text("#vu8").append(
                allocator
                    .intersperse(
                        x.iter().map(|b| allocator.text(b.to_string())),
                        allocator.space(),
                    )
                    .parens(),
            ),
        }
    }

    pub fn pretty_print(&self, w: &mut dyn WriteColor) -> std::io::Result<()> {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        doc.1.render_colored(80, w)
    }
}

impl std::fmt::Display for Sexpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        let mut out = Vec::new();
        doc.1.render(80, &mut out).map_err(|_| std::fmt::Error)?;
        f.write_str(&String::from_utf8_lossy(&out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interned_symbols_share_identity() {
        assert_eq!(intern("car"), intern("car"));
        assert_ne!(intern("car"), intern("cdr"));
        assert_eq!(intern("lambda").as_str(), "lambda");
    }

    #[test]
    fn integers_normalize_to_fixnums() {
        assert!(matches!(Sexpr::integer(BigInt::from(42)), Sexpr::Fixnum(42)));
        let big = BigInt::from(i64::MAX) * 4;
        assert!(matches!(Sexpr::integer(big), Sexpr::BigInt(_)));
        let whole = BigRational::new(BigInt::from(6), BigInt::from(3));
        assert!(matches!(Sexpr::rational(whole), Sexpr::Fixnum(2)));
    }

    #[test]
    fn improper_lists_are_not_proper() {
        let dotted = cons(Sexpr::Fixnum(1), Sexpr::Fixnum(2));
        assert!(dotted.proper_list().is_none());
        assert_eq!(dotted.list_length(), None);
        let ls = Sexpr::list([Sexpr::Fixnum(1), Sexpr::Fixnum(2)]);
        assert_eq!(ls.list_length(), Some(2));
    }

    #[test]
    fn display_uses_external_representation() {
        let ls = Sexpr::list([sym("quote"), Sexpr::Boolean(false), Sexpr::string("a\"b")]);
        assert_eq!(ls.to_string(), "(quote #f \"a\\\"b\")");
        let dotted = cons(Sexpr::Fixnum(1), Sexpr::Fixnum(2));
        assert_eq!(dotted.to_string(), "(1 . 2)");
    }

    #[test]
    fn source_map_keys_by_node_identity() {
        let a = Sexpr::list([sym("f")]);
        let b = Sexpr::list([sym("f")]);
        let mut map = SourceMap::new();
        map.mark(
            &a,
            SourceSpan {
                file: Arc::from("t.scm"),
                line: 3,
                column: 1,
            },
        );
        assert!(map.get(&a).is_some());
        assert!(map.get(&b).is_none());
    }
}
