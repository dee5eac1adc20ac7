//! Lowered, typed IR.
//!
//! Expressions and statements produced by the call-site compiler and the
//! inliner, consumed by the emitter and the evaluator. Slots and templates
//! are referenced by identity through [`P`] handles, so renaming or
//! reparenting a slot never invalidates the IR that mentions it.

use std::sync::Arc;

use pretty::{BoxAllocator, DocAllocator, DocBuilder};
use termcolor::{Color, ColorSpec, WriteColor};

use super::{
    scope::{SlotRef, TemplateRef},
    sexpr::{Sexpr, SourceSpan},
};
use crate::runtime::builtins::Builtin;

/// Static type of an IR expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Object,
    Boolean,
    Integer,
    Rational,
    Number,
    String,
    Symbol,
    Null,
    Pair,
    List,
    Vector,
    ByteArray,
    Byte,
    ObjectArray,
    Callable,
    Unspecified,
    Uninitialized,
    /// Unboxed truth value produced by tests and comparisons.
    Bool,
    Context,
    Void,
}

impl Type {
    pub fn is_primitive(self) -> bool {
        matches!(self, Type::Bool | Type::Byte)
    }

    /// Whether a value of type `self` can be passed where `target` is expected.
    pub fn is_assignable_to(self, target: Type) -> bool {
        if self == target {
            return true;
        }
        match target {
            Type::Object => !matches!(self, Type::Void | Type::Context),
            Type::Number => matches!(self, Type::Integer | Type::Rational),
            Type::Rational => self == Type::Integer,
            Type::List => matches!(self, Type::Null | Type::Pair),
            Type::Vector => self == Type::ObjectArray,
            Type::ObjectArray => self == Type::Vector,
            Type::Boolean => self == Type::Bool,
            _ => false,
        }
    }

    pub fn of_datum(datum: &Sexpr) -> Type {
        match datum {
            Sexpr::Null => Type::Null,
            Sexpr::Unspecified => Type::Unspecified,
            Sexpr::Uninitialized => Type::Uninitialized,
            Sexpr::Boolean(_) => Type::Boolean,
            Sexpr::Fixnum(_) | Sexpr::BigInt(_) => Type::Integer,
            Sexpr::Rational(_) => Type::Rational,
            Sexpr::String(_) => Type::String,
            Sexpr::Bytevector(_) => Type::ByteArray,
            Sexpr::Vector(_) => Type::Vector,
            Sexpr::Symbol(_) => Type::Symbol,
            Sexpr::Pair(_) => Type::Pair,
        }
    }
}

/// Entry point used by generic calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// Arity-specialized entry for up to [`MAX_DIRECT_ARGS`] arguments.
    ///
    /// [`MAX_DIRECT_ARGS`]: super::convention::MAX_DIRECT_ARGS
    Arity(usize),
    /// Single object-array argument holding every actual argument.
    Packed,
}

/// Entry point used by direct invocations of a known template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Direct(usize),
    Packed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeService {
    MakeList,
    ValuesToArray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Unspecified,
    Uninitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Constant(Sexpr),
    Read(SlotRef),
    Write(SlotRef, Box<Expr>),
    Call(Call),
    Invoke(Invoke),
    Native(Native),
    Runtime(RuntimeService, Vec<Expr>),
    MakeClosure(TemplateRef),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    /// Evaluate the prefix for effect, then yield the tail.
    Sequence(Vec<Expr>, Box<Expr>),
    TypeTest(Box<Expr>, Type),
    Convert(Box<Expr>, Type),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    NewArray(Type, Vec<Expr>),
    ArrayIndex(Box<Expr>, usize),
    FieldRead(Field),
    /// The implicit compilation-context argument.
    Context,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub callee: Box<Expr>,
    pub args: Vec<Expr>,
    pub convention: Convention,
    pub tail: bool,
    pub span: Option<SourceSpan>,
}

#[derive(Debug, Clone)]
pub struct Invoke {
    pub template: TemplateRef,
    pub args: Vec<Expr>,
    pub needs_context: bool,
    pub entry: Entry,
    pub tail: bool,
    pub span: Option<SourceSpan>,
}

#[derive(Debug, Clone)]
pub struct Native {
    pub builtin: Arc<Builtin>,
    pub overload: usize,
    pub args: Vec<Expr>,
    pub tail: bool,
    pub span: Option<SourceSpan>,
}

#[derive(Debug, Clone)]
pub struct IfClause {
    pub test: Expr,
    pub body: Stmt,
    pub span: Option<SourceSpan>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Block(Vec<Stmt>),
    If(Vec<IfClause>, Option<Box<Stmt>>),
    Return(Expr),
    Expression(Expr),
}

impl Expr {
    pub fn unspecified() -> Expr {
        Expr::FieldRead(Field::Unspecified)
    }

    pub fn ty(&self) -> Type {
        match self {
            Expr::Constant(datum) => Type::of_datum(datum),
            Expr::Read(slot) => slot.get().ty,
            Expr::Write(..) => Type::Unspecified,
            Expr::Native(native) => native.builtin.overloads[native.overload].ret,
            Expr::Runtime(RuntimeService::MakeList, _) => Type::List,
            Expr::Runtime(RuntimeService::ValuesToArray, _) => Type::ObjectArray,
            Expr::MakeClosure(_) => Type::Callable,
            Expr::Conditional(_, then, els) => {
                let (a, b) = (then.ty(), els.ty());
                if a == b {
                    a
                } else {
                    Type::Object
                }
            }
            Expr::Sequence(_, tail) => tail.ty(),
            Expr::TypeTest(..) | Expr::Binary(..) => Type::Bool,
            Expr::Convert(_, ty) => *ty,
            Expr::NewArray(Type::Byte, _) => Type::ByteArray,
            Expr::NewArray(_, _) => Type::ObjectArray,
            Expr::FieldRead(Field::Unspecified) => Type::Unspecified,
            Expr::FieldRead(Field::Uninitialized) => Type::Uninitialized,
            Expr::Context => Type::Context,
            Expr::Call(_) | Expr::Invoke(_) | Expr::ArrayIndex(..) => Type::Object,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Constant(_))
    }

    /// Drops conversions that only widen to a uniform type.
    pub fn strip_conversions(self) -> Expr {
        match self {
            Expr::Convert(inner, Type::Object) => inner.strip_conversions(),
            other => other,
        }
    }

    pub fn is_tail_call(&self) -> bool {
        match self {
            Expr::Call(call) => call.tail,
            Expr::Invoke(invoke) => invoke.tail,
            Expr::Native(native) => native.tail,
            _ => false,
        }
    }

    /// Gives a call produced by expansion the position of the call site it
    /// replaces. Calls that already have a position keep it.
    pub fn with_span(mut self, span: &Option<SourceSpan>) -> Expr {
        if span.is_none() {
            return self;
        }
        let fill = |slot: &mut Option<SourceSpan>| {
            if slot.is_none() {
                *slot = span.clone();
            }
        };
        match &mut self {
            Expr::Call(call) => fill(&mut call.span),
            Expr::Invoke(invoke) => fill(&mut invoke.span),
            Expr::Native(native) => fill(&mut native.span),
            Expr::Convert(inner, _) | Expr::Sequence(_, inner) => {
                let e = std::mem::replace(&mut **inner, Expr::Context);
                **inner = e.with_span(span);
            }
            _ => (),
        }
        self
    }

    pub fn set_tail(&mut self, tail: bool) {
        match self {
            Expr::Call(call) => call.tail = tail,
            Expr::Invoke(invoke) => invoke.tail = tail,
            Expr::Native(native) => native.tail = tail,
            _ => (),
        }
    }
}

fn kw<'a, D>(allocator: &'a D, name: &'static str) -> DocBuilder<'a, D, ColorSpec>
where
    D: DocAllocator<'a, ColorSpec>,
    D::Doc: Clone,
{
    allocator
        .text(name)
        .annotate(ColorSpec::new().set_fg(Some(Color::Magenta)).clone())
}

fn slot_doc<'a, D>(allocator: &'a D, slot: &SlotRef) -> DocBuilder<'a, D, ColorSpec>
where
    D: DocAllocator<'a, ColorSpec>,
    D::Doc: Clone,
{
    let name = slot.get().name;
    allocator
        .text(name.as_str())
        .append(allocator.text("."))
        .append(allocator.text(format!("{:p}", slot.as_ptr())))
        .annotate(ColorSpec::new().set_fg(Some(Color::Cyan)).clone())
}

fn node<'a, D>(
    allocator: &'a D,
    name: &'static str,
    parts: Vec<DocBuilder<'a, D, ColorSpec>>,
) -> DocBuilder<'a, D, ColorSpec>
where
    D: DocAllocator<'a, ColorSpec>,
    D::Doc: Clone,
{
    if parts.is_empty() {
        return kw(allocator, name).parens();
    }
    kw(allocator, name)
        .append(allocator.space())
        .append(allocator.intersperse(parts, allocator.line()))
        .nest(1)
        .group()
        .parens()
}

impl Expr {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        match self {
            Expr::Constant(datum) => node(allocator, "const", vec![datum.pretty(allocator)]),
            Expr::Read(slot) => node(allocator, "read", vec![slot_doc(allocator, slot)]),
            Expr::Write(slot, value) => node(
                allocator,
                "write",
                vec![slot_doc(allocator, slot), value.pretty(allocator)],
            ),
            Expr::Call(call) => {
                let mut parts = vec![
                    allocator.text(format!("{:?}", call.convention)),
                    call.callee.pretty(allocator),
                ];
                parts.extend(call.args.iter().map(|arg| arg.pretty(allocator)));
                node(allocator, if call.tail { "tail-call" } else { "call" }, parts)
            }
            Expr::Invoke(invoke) => {
                let mut parts = vec![allocator.text(invoke.template.get().name.as_str())];
                parts.extend(invoke.args.iter().map(|arg| arg.pretty(allocator)));
                node(
                    allocator,
                    if invoke.tail { "tail-invoke" } else { "invoke" },
                    parts,
                )
            }
            Expr::Native(native) => {
                let mut parts = vec![allocator.text(format!(
                    "{}/{}",
                    native.builtin.name, native.overload
                ))];
                parts.extend(native.args.iter().map(|arg| arg.pretty(allocator)));
                node(allocator, "native", parts)
            }
            Expr::Runtime(service, args) => {
                let mut parts = vec![allocator.text(format!("{:?}", service))];
                parts.extend(args.iter().map(|arg| arg.pretty(allocator)));
                node(allocator, "runtime", parts)
            }
            Expr::MakeClosure(template) => {
                let t = template.get();
                let params = allocator.intersperse(
                    t.parameters.iter().map(|p| slot_doc(allocator, p)),
                    allocator.space(),
                );
                let mut parts = vec![allocator.text(t.name.as_str()), params.parens()];
                if let Some(body) = &t.body {
                    parts.push(body.pretty(allocator));
                }
                node(allocator, "closure", parts)
            }
            Expr::Conditional(test, then, els) => node(
                allocator,
                "if",
                vec![
                    test.pretty(allocator),
                    then.pretty(allocator),
                    els.pretty(allocator),
                ],
            ),
            Expr::Sequence(prefix, tail) => {
                let mut parts = prefix
                    .iter()
                    .map(|e| e.pretty(allocator))
                    .collect::<Vec<_>>();
                parts.push(tail.pretty(allocator));
                node(allocator, "seq", parts)
            }
            Expr::TypeTest(e, ty) => node(
                allocator,
                "is",
                vec![e.pretty(allocator), allocator.text(format!("{:?}", ty))],
            ),
            Expr::Convert(e, ty) => node(
                allocator,
                "convert",
                vec![e.pretty(allocator), allocator.text(format!("{:?}", ty))],
            ),
            Expr::Binary(op, l, r) => node(
                allocator,
                match op {
                    BinaryOp::Eq => "eq",
                    BinaryOp::NotEq => "neq",
                },
                vec![l.pretty(allocator), r.pretty(allocator)],
            ),
            Expr::NewArray(ty, elems) => {
                let mut parts = vec![allocator.text(format!("{:?}", ty))];
                parts.extend(elems.iter().map(|e| e.pretty(allocator)));
                node(allocator, "new-array", parts)
            }
            Expr::ArrayIndex(e, i) => node(
                allocator,
                "index",
                vec![e.pretty(allocator), allocator.text(i.to_string())],
            ),
            Expr::FieldRead(field) => {
                node(allocator, "field", vec![allocator.text(format!("{:?}", field))])
            }
            Expr::Context => kw(allocator, "context").parens(),
        }
    }

    pub fn pretty_print(&self, writer: &mut impl WriteColor) -> std::io::Result<()> {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        doc.1.render_colored(70, writer)
    }
}

impl Stmt {
    pub fn pretty<'a, D>(&self, allocator: &'a D) -> DocBuilder<'a, D, ColorSpec>
    where
        D: DocAllocator<'a, ColorSpec>,
        D::Doc: Clone,
    {
        match self {
            Stmt::Block(stmts) => {
                let body = allocator.intersperse(
                    stmts.iter().map(|s| s.pretty(allocator)),
                    allocator.hardline(),
                );
                kw(allocator, "block")
                    .append(allocator.hardline())
                    .append(body)
                    .nest(1)
                    .group()
                    .parens()
            }
            Stmt::If(clauses, els) => {
                let mut parts = clauses
                    .iter()
                    .map(|clause| {
                        clause
                            .test
                            .pretty(allocator)
                            .append(allocator.line())
                            .append(clause.body.pretty(allocator))
                            .nest(1)
                            .group()
                            .brackets()
                    })
                    .collect::<Vec<_>>();
                if let Some(els) = els {
                    parts.push(
                        kw(allocator, "else")
                            .append(allocator.line())
                            .append(els.pretty(allocator))
                            .nest(1)
                            .group()
                            .brackets(),
                    );
                }
                node(allocator, "cond", parts)
            }
            Stmt::Return(e) => node(allocator, "return", vec![e.pretty(allocator)]),
            Stmt::Expression(e) => e.pretty(allocator),
        }
    }

    pub fn pretty_print(&self, writer: &mut impl WriteColor) -> std::io::Result<()> {
        let allocator = BoxAllocator;
        let doc = self.pretty(&allocator);
        doc.1.render_colored(70, writer)
    }

    /// Whether control can never reach the end of this statement.
    pub fn never_falls_through(&self) -> bool {
        match self {
            Stmt::Return(_) => true,
            Stmt::Block(stmts) => matches!(stmts.last(), Some(Stmt::Return(_))),
            Stmt::If(clauses, els) => {
                clauses.iter().all(|clause| clause.body.never_falls_through())
                    && els.as_ref().map_or(false, |els| els.never_falls_through())
            }
            Stmt::Expression(_) => false,
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let allocator = BoxAllocator;
        let mut out = Vec::new();
        self.pretty(&allocator)
            .1
            .render(70, &mut out)
            .map_err(|_| std::fmt::Error)?;
        f.write_str(&String::from_utf8_lossy(&out))
    }
}

impl std::fmt::Display for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let allocator = BoxAllocator;
        let mut out = Vec::new();
        self.pretty(&allocator)
            .1
            .render(70, &mut out)
            .map_err(|_| std::fmt::Error)?;
        f.write_str(&String::from_utf8_lossy(&out))
    }
}
