pub mod callsite;
pub mod constfold;
pub mod convention;
pub mod emit;
pub mod error;
pub mod inline;
pub mod options;
pub mod p;
pub mod primitives;
pub mod registry;
pub mod scope;
pub mod sexpr;
pub mod special;
pub mod tree_il;

use std::{cell::Cell, collections::HashSet, sync::Arc};

pub use p::P;

use crate::runtime::{env::Environment, eval::Code};

pub use self::{
    error::CompileError,
    options::{CompileOptions, OptimizationLevel},
    registry::Registry,
};
use self::{
    scope::{bind, global_slot, lookup, ClosureTemplate, TemplateRef},
    sexpr::{intern, SourceMap, SourceSpan, Sexpr, Symbol},
    tree_il::{Expr, Field, Stmt},
};

/// Compiler front door. Holds the configuration and the state shared by
/// every unit compiled through it.
pub struct Compiler {
    options: CompileOptions,
    registry: Arc<Registry>,
    env: Arc<Environment>,
}

/// A compiled top-level unit.
#[derive(Debug)]
pub struct CompiledUnit {
    pub root: TemplateRef,
    pub body: Stmt,
    pub code: Code,
}

/// Per-unit state. Never shared between threads.
pub struct Unit<'a> {
    pub compiler: &'a Compiler,
    pub source: &'a SourceMap,
    counter: Cell<usize>,
}

/// Compilation environment threaded through every recursive call.
#[derive(Clone)]
pub struct Cenv<'a> {
    pub unit: &'a Unit<'a>,
    pub scope: TemplateRef,
    /// Innermost form being compiled, reported with syntax errors.
    pub form: Sexpr,
    /// Nearest known source location.
    pub span_hint: Option<SourceSpan>,
    pub inline_depth: usize,
}

impl<'a> Cenv<'a> {
    pub fn options(&self) -> &'a CompileOptions {
        &self.unit.compiler.options
    }

    pub fn registry(&self) -> &'a Registry {
        &self.unit.compiler.registry
    }

    pub fn env(&self) -> &'a Arc<Environment> {
        &self.unit.compiler.env
    }

    pub fn with_scope(&self, scope: TemplateRef) -> Cenv<'a> {
        Cenv {
            scope,
            ..self.clone()
        }
    }

    /// Enters `form`, picking up its source location when known.
    pub fn enter(&self, form: &Sexpr) -> Cenv<'a> {
        Cenv {
            form: form.clone(),
            span_hint: self.unit.source.get(form).or_else(|| self.span_hint.clone()),
            ..self.clone()
        }
    }

    pub fn deeper(&self) -> Cenv<'a> {
        Cenv {
            inline_depth: self.inline_depth + 1,
            ..self.clone()
        }
    }

    pub fn can_inline(&self) -> bool {
        self.inline_depth < self.options().max_inline_depth
    }

    pub fn span_of(&self, x: &Sexpr) -> Option<SourceSpan> {
        self.unit.source.get(x)
    }

    /// Name for a slot moving into `scope`, unique among its slots.
    pub fn gensym(&self, scope: &TemplateRef, base: Symbol) -> Symbol {
        let mut counter = self.unit.counter.get();
        let name = scope::fresh_name(scope, base, &mut counter);
        self.unit.counter.set(counter);
        name
    }

    pub fn syntax_error(&self, message: impl Into<String>, node: &Sexpr) -> CompileError {
        let span = self.span_of(node).or_else(|| self.span_hint.clone());
        CompileError::syntax(message, node, &self.form, span)
    }

    /// Whether `name` denotes a local binding in the current scope.
    pub fn is_local(&self, name: Symbol) -> bool {
        lookup(&self.scope, name).is_some()
    }
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self::with_shared(
            options,
            Arc::new(Registry::with_defaults()),
            Arc::new(Environment::standard()),
        )
    }

    /// Compiler over an existing registry and environment, e.g. one per
    /// worker thread.
    pub fn with_shared(
        options: CompileOptions,
        registry: Arc<Registry>,
        env: Arc<Environment>,
    ) -> Self {
        Self {
            options,
            registry,
            env,
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn compile_unit(
        &self,
        forms: &[Sexpr],
        source: &SourceMap,
    ) -> Result<CompiledUnit, CompileError> {
        let mut defined = HashSet::new();
        for form in forms {
            prescan_assignments(form, &self.registry);
            prescan_definitions(form, &mut defined, &self.registry);
        }

        let unit = Unit {
            compiler: self,
            source,
            counter: Cell::new(0),
        };
        let root = ClosureTemplate::root();
        let cenv = Cenv {
            unit: &unit,
            scope: root.clone(),
            form: Sexpr::Null,
            span_hint: None,
            inline_depth: 0,
        };

        let mut stmts = Vec::with_capacity(forms.len());
        for (i, form) in forms.iter().enumerate() {
            if i + 1 == forms.len() {
                stmts.push(Stmt::Return(compile(form, &cenv, true)?));
            } else {
                stmts.push(Stmt::Expression(compile(form, &cenv, false)?));
            }
        }
        if stmts.is_empty() {
            stmts.push(Stmt::Return(Expr::unspecified()));
        }

        let body = Stmt::Block(stmts);
        root.get_mut().body = Some(body.clone());
        bind(&root);

        let code: Code = emit::emit(&body).into();
        root.get_mut().code = Some(code.clone());

        log::debug!(target: "callsite", "compiled unit of {} forms", forms.len());
        log::trace!(target: "callsite", "{}", body);

        Ok(CompiledUnit { root, body, code })
    }
}

/// Compiles one expression in `cenv`.
pub fn compile(x: &Sexpr, cenv: &Cenv, tail: bool) -> Result<Expr, CompileError> {
    match x {
        Sexpr::Symbol(name) => Ok(compile_ref(*name, cenv)),
        Sexpr::Pair(_) => {
            let cenv = cenv.enter(x);
            if let Some(name) = x.car().and_then(Sexpr::symbol) {
                if !cenv.is_local(name) {
                    if let Some(form) = special::lookup_special(name) {
                        return form(x, &cenv, tail);
                    }
                }
            }
            callsite::compile_call(x, &cenv, tail)
        }
        Sexpr::Null => Err(cenv.syntax_error("empty application", x)),
        literal => Ok(constfold::quote_literal(literal)),
    }
}

pub fn compile_ref(name: Symbol, cenv: &Cenv) -> Expr {
    if let Some(slot) = lookup(&cenv.scope, name) {
        return Expr::Read(slot);
    }
    if name == intern("uninitialized") {
        return Expr::FieldRead(Field::Uninitialized);
    }
    Expr::Read(global_slot(&cenv.scope, name))
}

/// Records every `set!` target in `form`, so call sites compiled before the
/// assignment already see it.
fn prescan_assignments(form: &Sexpr, registry: &Registry) {
    let set = intern("set!");
    let quote = intern("quote");
    let mut stack = vec![form];
    while let Some(x) = stack.pop() {
        let Some((head, rest)) = x.pair() else {
            continue;
        };
        if head.symbol() == Some(quote) {
            continue;
        }
        if head.symbol() == Some(set) {
            if let Some(name) = rest.car().and_then(Sexpr::symbol) {
                registry.mark_assigned(name);
            }
        }
        let mut ls = x;
        while let Some((car, cdr)) = ls.pair() {
            stack.push(car);
            ls = cdr;
        }
    }
}

/// Names defined more than once at top level are treated as assigned: a call
/// compiled between two definitions must not bind to the first one.
fn prescan_definitions(form: &Sexpr, seen: &mut HashSet<Symbol>, registry: &Registry) {
    let Some((head, rest)) = form.pair() else {
        return;
    };
    match head.symbol() {
        Some(s) if s == intern("begin") => {
            let mut ls = rest;
            while let Some((car, cdr)) = ls.pair() {
                prescan_definitions(car, seen, registry);
                ls = cdr;
            }
        }
        Some(s) if s == intern("define") => {
            let name = match rest.car() {
                Some(Sexpr::Symbol(name)) => Some(*name),
                Some(signature) => signature.car().and_then(Sexpr::symbol),
                None => None,
            };
            if let Some(name) = name {
                if !seen.insert(name) {
                    registry.mark_assigned(name);
                }
            }
        }
        _ => (),
    }
}
