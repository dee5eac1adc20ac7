//! Shared handles for scope-tree nodes.
//!
//! Closure templates and variable slots are created while lowering, then
//! mutated in place by the inliner (renamed, reparented) while IR nodes keep
//! pointing at them. `P<T>` is the shared, mutable handle used for that;
//! equality and hashing are by identity, never by value.

use std::{hash::Hash, sync::Arc};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct P<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> P<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Shared access. Guards must not be held across calls that may lock the
    /// same node again for writing.
    pub fn get(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    pub fn get_mut(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    pub fn as_ptr(&self) -> *const () {
        Arc::as_ptr(&self.inner).cast()
    }

    /// Identity of the node, stable for its whole lifetime.
    pub fn addr(&self) -> usize {
        self.as_ptr() as usize
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.inner, &other.inner)
    }

    pub fn downgrade(this: &Self) -> Weak<T> {
        Weak {
            inner: Arc::downgrade(&this.inner),
        }
    }
}

impl<T> Clone for P<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for P<T> {
    fn eq(&self, other: &Self) -> bool {
        P::ptr_eq(self, other)
    }
}

impl<T> Eq for P<T> {}

impl<T> Hash for P<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(self.addr())
    }
}

impl<T> std::fmt::Debug for P<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<p {:p}>", self.as_ptr())
    }
}

#[allow(non_snake_case)]
pub fn P<T>(value: T) -> P<T> {
    P::new(value)
}

pub struct Weak<T> {
    inner: std::sync::Weak<RwLock<T>>,
}

impl<T> Weak<T> {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Weak::new(),
        }
    }

    pub fn upgrade(&self) -> Option<P<T>> {
        self.inner.upgrade().map(|inner| P { inner })
    }
}

impl<T> Default for Weak<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<weak {:p}>", self.inner.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_not_value_equality() {
        let a = P(1);
        let b = P(1);
        assert!(a != b);
        assert!(a == a.clone());
    }

    #[test]
    fn weak_dies_with_last_strong() {
        let a = P(String::from("x"));
        let w = P::downgrade(&a);
        assert!(w.upgrade().is_some());
        drop(a);
        assert!(w.upgrade().is_none());
    }
}
