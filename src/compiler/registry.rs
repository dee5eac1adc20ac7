//! Global procedure registry.
//!
//! Shared by every unit compiled against the same [`Compiler`]; all access
//! goes through a `RwLock`, so units may be compiled from several threads.
//!
//! [`Compiler`]: super::Compiler

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use super::{
    error::CompileError, options::OptimizationLevel, scope::TemplateRef, sexpr::Symbol,
    tree_il::Expr,
};

/// Compile-time expander. `None` declines.
pub type InlineMacro = fn(&[Expr]) -> Option<Expr>;

#[derive(Debug, Clone)]
pub struct OverloadEntry {
    pub template: TemplateRef,
    pub arity: usize,
    pub variadic: bool,
}

impl OverloadEntry {
    pub fn accepts(&self, argc: usize) -> bool {
        argc == self.arity || (self.variadic && argc >= self.arity)
    }
}

#[derive(Debug, Clone)]
pub enum Callable {
    Fixed(TemplateRef),
    Variadic(TemplateRef),
    Overloads(Vec<OverloadEntry>),
}

#[derive(Debug, Clone)]
pub struct KnownProcedure {
    pub callable: Callable,
    pub allow_constant_fold: bool,
}

#[derive(Default)]
struct Tables {
    known: HashMap<Symbol, KnownProcedure>,
    macros: HashMap<OptimizationLevel, HashMap<Symbol, InlineMacro>>,
    assigned: HashSet<Symbol>,
    defined: HashSet<Symbol>,
}

#[derive(Default)]
pub struct Registry {
    tables: RwLock<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock inline macros.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for entry in super::primitives::inline_macro_table() {
            registry.register_inline_macro(entry.tier, entry.name, entry.expand);
        }
        registry
    }

    pub fn register_known_procedure(&self, name: Symbol, template: TemplateRef, variadic: bool) {
        let callable = if variadic {
            Callable::Variadic(template)
        } else {
            Callable::Fixed(template)
        };
        log::debug!(target: "callsite", "known procedure {} ({:?})", name, callable);
        self.tables.write().known.insert(
            name,
            KnownProcedure {
                callable,
                allow_constant_fold: false,
            },
        );
    }

    /// Adds an arity-tagged target to `name`'s overload set. A set holds at
    /// most one variadic entry.
    pub fn register_overload(
        &self,
        name: Symbol,
        template: TemplateRef,
        arity: usize,
        variadic: bool,
    ) -> Result<(), CompileError> {
        let mut tables = self.tables.write();
        let entry = OverloadEntry {
            template,
            arity,
            variadic,
        };
        let known = tables.known.entry(name).or_insert_with(|| KnownProcedure {
            callable: Callable::Overloads(vec![]),
            allow_constant_fold: false,
        });
        match &mut known.callable {
            Callable::Overloads(entries) => {
                if variadic && entries.iter().any(|e| e.variadic) {
                    return Err(CompileError::internal(format!(
                        "overload set `{}` already has a variadic entry",
                        name
                    )));
                }
                entries.push(entry);
            }
            _ => known.callable = Callable::Overloads(vec![entry]),
        }
        Ok(())
    }

    pub fn set_allow_constant_fold(&self, name: Symbol, allow: bool) {
        if let Some(known) = self.tables.write().known.get_mut(&name) {
            known.allow_constant_fold = allow;
        }
    }

    pub fn register_inline_macro(&self, tier: OptimizationLevel, name: Symbol, expander: InlineMacro) {
        self.tables
            .write()
            .macros
            .entry(tier)
            .or_default()
            .insert(name, expander);
    }

    pub fn known_procedure(&self, name: Symbol) -> Option<KnownProcedure> {
        self.tables.read().known.get(&name).cloned()
    }

    pub fn forget(&self, name: Symbol) {
        self.tables.write().known.remove(&name);
    }

    /// Probes `tier` first, then every lower tier.
    pub fn inline_macro(&self, tier: OptimizationLevel, name: Symbol) -> Option<InlineMacro> {
        let tables = self.tables.read();
        OptimizationLevel::ALL
            .iter()
            .rev()
            .filter(|level| **level <= tier)
            .find_map(|level| tables.macros.get(level).and_then(|m| m.get(&name)).copied())
    }

    pub fn mark_assigned(&self, name: Symbol) {
        let mut tables = self.tables.write();
        if tables.assigned.insert(name) {
            // An assigned name can no longer be bound directly.
            tables.known.remove(&name);
        }
    }

    pub fn is_assigned(&self, name: Symbol) -> bool {
        self.tables.read().assigned.contains(&name)
    }

    pub fn mark_defined(&self, name: Symbol) {
        self.tables.write().defined.insert(name);
    }

    /// Defined at top level by user code, which hides any builtin of the
    /// same name.
    pub fn is_defined(&self, name: Symbol) -> bool {
        self.tables.read().defined.contains(&name)
    }
}
