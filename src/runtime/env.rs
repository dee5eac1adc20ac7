//! Global environment shared by compiled units.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::{
    builtins::{standard_builtin_refs, Builtin},
    value::{Procedure, Value},
};
use crate::compiler::sexpr::Symbol;

#[derive(Clone)]
pub enum Binding {
    Builtin(Arc<Builtin>),
    Value(Value),
}

impl Binding {
    pub fn value(&self) -> Value {
        match self {
            Binding::Builtin(b) => Value::Procedure(Procedure::Builtin(b.clone())),
            Binding::Value(v) => v.clone(),
        }
    }
}

#[derive(Default)]
pub struct Environment {
    bindings: RwLock<IndexMap<Symbol, Binding>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment holding the standard builtins.
    pub fn standard() -> Self {
        let env = Self::new();
        for builtin in standard_builtin_refs() {
            env.define_builtin(builtin);
        }
        env
    }

    pub fn define_builtin(&self, builtin: Arc<Builtin>) {
        self.bindings
            .write()
            .insert(builtin.name, Binding::Builtin(builtin));
    }

    pub fn define(&self, name: Symbol, value: Value) {
        self.bindings.write().insert(name, Binding::Value(value));
    }

    pub fn lookup(&self, name: Symbol) -> Option<Binding> {
        self.bindings.read().get(&name).cloned()
    }

    pub fn builtin(&self, name: Symbol) -> Option<Arc<Builtin>> {
        match self.bindings.read().get(&name) {
            Some(Binding::Builtin(b)) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::sexpr::intern;

    #[test]
    fn user_definition_replaces_builtin() {
        let env = Environment::standard();
        let car = intern("car");
        assert!(env.builtin(car).is_some());
        env.define(car, Value::Fixnum(1));
        assert!(env.builtin(car).is_none());
        assert!(matches!(env.lookup(car).map(|b| b.value()), Some(Value::Fixnum(1))));
    }

    #[test]
    fn environment_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Environment>();
    }
}
