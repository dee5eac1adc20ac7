//! Scope tree: closure templates and the variable slots they own.
//!
//! Templates are created while lowering `lambda` and are mutated in place
//! by the inliner. Parent and owner links are weak; the unit root keeps the
//! tree alive through the IR that mentions each template.

use indexmap::IndexMap;

use super::{
    p::{Weak, P},
    sexpr::{intern, Symbol},
    tree_il::{Expr, Stmt, Type},
};
use crate::runtime::eval::Code;

pub type TemplateRef = P<ClosureTemplate>;
pub type SlotRef = P<Variable>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Parameter,
    Local,
    Temporary,
    Global,
}

#[derive(Debug)]
pub struct Variable {
    pub name: Symbol,
    pub owner: Weak<ClosureTemplate>,
    pub kind: VariableKind,
    /// Read or written by a scope nested inside the owner.
    pub captured: bool,
    /// A caller passed the uninitialized marker into this slot.
    pub uninitialized: bool,
    pub ty: Type,
}

impl Variable {
    pub fn new(name: Symbol, owner: &TemplateRef, kind: VariableKind) -> SlotRef {
        P(Variable {
            name,
            owner: P::downgrade(owner),
            kind,
            captured: false,
            uninitialized: false,
            ty: Type::Object,
        })
    }

    pub fn owner(&self) -> Option<TemplateRef> {
        self.owner.upgrade()
    }
}

#[derive(Debug)]
pub struct ClosureTemplate {
    pub name: Symbol,
    pub parent: Weak<ClosureTemplate>,
    pub parameters: Vec<SlotRef>,
    pub variables: Vec<SlotRef>,
    pub body: Option<Stmt>,
    /// Last parameter collects surplus arguments into a list.
    pub rest: bool,
    pub is_closure: bool,
    /// Monotonic: never cleared once set.
    pub has_heap_frame: bool,
    pub inlined: bool,
    pub is_global: bool,
    /// Binds its own compilation context instead of receiving one.
    pub explicit_context: bool,
    /// Global slots of a unit root, one per name.
    pub globals: IndexMap<Symbol, SlotRef>,
    /// Emitted instruction stream, filled on first invocation.
    pub code: Option<Code>,
}

impl ClosureTemplate {
    pub fn new(name: Symbol, parent: Option<&TemplateRef>) -> TemplateRef {
        P(ClosureTemplate {
            name,
            parent: parent.map(P::downgrade).unwrap_or_default(),
            parameters: vec![],
            variables: vec![],
            body: None,
            rest: false,
            is_closure: false,
            has_heap_frame: false,
            inlined: false,
            is_global: false,
            explicit_context: false,
            globals: IndexMap::new(),
            code: None,
        })
    }

    /// Root of a compilation unit. Everything it owns is a global.
    pub fn root() -> TemplateRef {
        let root = Self::new(intern("toplevel"), None);
        root.get_mut().is_global = true;
        root
    }

    pub fn parent(&self) -> Option<TemplateRef> {
        self.parent.upgrade()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// Number of arguments a caller must supply before the rest list.
    pub fn required(&self) -> usize {
        if self.rest {
            self.parameters.len() - 1
        } else {
            self.parameters.len()
        }
    }

    pub fn set_heap_frame(&mut self) {
        self.has_heap_frame = true;
    }

    fn find_own(&self, name: Symbol) -> Option<SlotRef> {
        self.parameters
            .iter()
            .chain(self.variables.iter())
            .rev()
            .find(|slot| slot.get().name == name)
            .cloned()
    }

    pub fn has_slot_named(&self, name: Symbol) -> bool {
        self.find_own(name).is_some()
    }
}

pub fn add_parameter(template: &TemplateRef, name: Symbol) -> SlotRef {
    let slot = Variable::new(name, template, VariableKind::Parameter);
    template.get_mut().parameters.push(slot.clone());
    slot
}

pub fn add_local(template: &TemplateRef, name: Symbol, kind: VariableKind) -> SlotRef {
    let slot = Variable::new(name, template, kind);
    template.get_mut().variables.push(slot.clone());
    slot
}

/// Resolves `name` lexically, innermost scope first. Unit roots hold only
/// globals and are not searched.
pub fn lookup(scope: &TemplateRef, name: Symbol) -> Option<SlotRef> {
    let mut current = Some(scope.clone());
    while let Some(template) = current {
        let t = template.get();
        if t.is_global {
            return None;
        }
        if let Some(slot) = t.find_own(name) {
            return Some(slot);
        }
        current = t.parent();
    }
    None
}

pub fn root_of(scope: &TemplateRef) -> TemplateRef {
    let mut current = scope.clone();
    loop {
        let parent = current.get().parent();
        match parent {
            Some(parent) => current = parent,
            None => return current,
        }
    }
}

/// Global slot for `name` in the unit owning `scope`, created on first use.
pub fn global_slot(scope: &TemplateRef, name: Symbol) -> SlotRef {
    let root = root_of(scope);
    if let Some(slot) = root.get().globals.get(&name) {
        return slot.clone();
    }
    let slot = Variable::new(name, &root, VariableKind::Global);
    root.get_mut().globals.insert(name, slot.clone());
    slot
}

/// Picks a name not used by any slot of `scope`.
pub fn fresh_name(scope: &TemplateRef, base: Symbol, counter: &mut usize) -> Symbol {
    let base = base.as_str();
    let stem = base.split('%').next().unwrap_or(base);
    loop {
        *counter += 1;
        let candidate = intern(format!("{}%{}", stem, counter));
        if !scope.get().has_slot_named(candidate) {
            return candidate;
        }
    }
}

/// Capture analysis over the body of `template`.
///
/// Every access to a slot owned by a non-global ancestor marks the slot
/// captured, gives its owner a heap frame and marks each template between
/// the accessor and the owner a closure. Nested templates are analyzed with
/// themselves as the accessor.
pub fn bind(template: &TemplateRef) {
    let body = template.get().body.clone();
    if let Some(body) = body {
        bind_stmt(template, &body);
    }
}

/// Runs [`bind`] on every template constructed inside `template`'s body,
/// without treating `template` itself as an accessor.
pub fn bind_nested(template: &TemplateRef) {
    let body = template.get().body.clone();
    if let Some(body) = body {
        visit_stmt(&body, &mut |expr| {
            if let Expr::MakeClosure(inner) = expr {
                bind(inner);
                false
            } else {
                true
            }
        });
    }
}

fn bind_stmt(accessor: &TemplateRef, stmt: &Stmt) {
    visit_stmt(stmt, &mut |expr| match expr {
        Expr::Read(slot) | Expr::Write(slot, _) => {
            note_access(accessor, slot);
            true
        }
        Expr::MakeClosure(inner) => {
            bind(inner);
            false
        }
        _ => true,
    });
}

fn note_access(accessor: &TemplateRef, slot: &SlotRef) {
    let (owner, kind) = {
        let s = slot.get();
        (s.owner(), s.kind)
    };
    let Some(owner) = owner else {
        return;
    };
    if kind == VariableKind::Global || owner.get().is_global || P::ptr_eq(&owner, accessor) {
        return;
    }

    let mut chain: Vec<TemplateRef> = vec![];
    let mut current = Some(accessor.clone());
    while let Some(t) = current {
        if P::ptr_eq(&t, &owner) {
            slot.get_mut().captured = true;
            owner.get_mut().set_heap_frame();
            for t in chain {
                t.get_mut().is_closure = true;
            }
            return;
        }
        current = t.get().parent();
        chain.push(t);
    }
}

/// Pre-order walk over every expression reachable from `stmt`. The visitor
/// returns `false` to skip the children of a node.
pub fn visit_stmt(stmt: &Stmt, f: &mut dyn FnMut(&Expr) -> bool) {
    match stmt {
        Stmt::Block(stmts) => stmts.iter().for_each(|s| visit_stmt(s, f)),
        Stmt::If(clauses, els) => {
            for clause in clauses {
                visit_expr(&clause.test, f);
                visit_stmt(&clause.body, f);
            }
            if let Some(els) = els {
                visit_stmt(els, f);
            }
        }
        Stmt::Return(e) | Stmt::Expression(e) => visit_expr(e, f),
    }
}

pub fn visit_expr(expr: &Expr, f: &mut dyn FnMut(&Expr) -> bool) {
    if !f(expr) {
        return;
    }
    match expr {
        Expr::Constant(_)
        | Expr::Read(_)
        | Expr::MakeClosure(_)
        | Expr::FieldRead(_)
        | Expr::Context => (),
        Expr::Write(_, value) => visit_expr(value, f),
        Expr::Call(call) => {
            visit_expr(&call.callee, f);
            call.args.iter().for_each(|a| visit_expr(a, f));
        }
        Expr::Invoke(invoke) => invoke.args.iter().for_each(|a| visit_expr(a, f)),
        Expr::Native(native) => native.args.iter().for_each(|a| visit_expr(a, f)),
        Expr::Runtime(_, args) | Expr::NewArray(_, args) => {
            args.iter().for_each(|a| visit_expr(a, f))
        }
        Expr::Conditional(test, then, els) => {
            visit_expr(test, f);
            visit_expr(then, f);
            visit_expr(els, f);
        }
        Expr::Sequence(prefix, tail) => {
            prefix.iter().for_each(|e| visit_expr(e, f));
            visit_expr(tail, f);
        }
        Expr::TypeTest(e, _) | Expr::Convert(e, _) | Expr::ArrayIndex(e, _) => visit_expr(e, f),
        Expr::Binary(_, l, r) => {
            visit_expr(l, f);
            visit_expr(r, f);
        }
    }
}
