//! Symbol interning.
//!
//! Class names, method names, signatures, attribute keys and trace types are
//! interned once into small integer [`SymbolId`]s so the hot path only ever
//! moves integers around. Ids are stable for the lifetime of the registry and
//! start at 1; id 0 is never issued.

use crate::types::SymbolId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Symbols {
    ids: HashMap<Arc<str>, SymbolId>,
    names: Vec<Arc<str>>,
}

/// Thread-safe string interner.
///
/// # Example
///
/// ```
/// use calltrace::symbol::SymbolRegistry;
///
/// let symbols = SymbolRegistry::new();
/// let a = symbols.intern("com.example.Service");
/// assert_eq!(symbols.intern("com.example.Service"), a);
/// assert_eq!(symbols.name(a).as_deref(), Some("com.example.Service"));
/// ```
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    inner: RwLock<Symbols>,
}

impl SymbolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, assigning the next free id on first use.
    pub fn intern(&self, name: &str) -> SymbolId {
        if let Some(id) = self.inner.read().ids.get(name) {
            return *id;
        }

        let mut symbols = self.inner.write();
        // Another thread may have interned the name between the two locks.
        if let Some(id) = symbols.ids.get(name) {
            return *id;
        }
        let id = SymbolId::new(symbols.names.len() as u32 + 1);
        let name: Arc<str> = Arc::from(name);
        symbols.names.push(Arc::clone(&name));
        symbols.ids.insert(name, id);
        id
    }

    /// Returns the id for `name` if it has been interned.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.inner.read().ids.get(name).copied()
    }

    /// Returns the name behind `id`.
    #[must_use]
    pub fn name(&self, id: SymbolId) -> Option<Arc<str>> {
        let index = (id.as_u32() as usize).checked_sub(1)?;
        self.inner.read().names.get(index).cloned()
    }

    /// Returns the number of interned symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// Returns true if nothing has been interned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn intern_is_idempotent() {
        let symbols = SymbolRegistry::new();
        let a = symbols.intern("some.Class");
        let b = symbols.intern("someMethod");
        assert_ne!(a, b);
        assert_eq!(symbols.intern("some.Class"), a);
        assert_eq!(symbols.len(), 2);
    }

    #[test]
    fn ids_start_at_one() {
        let symbols = SymbolRegistry::new();
        assert!(symbols.is_empty());
        assert_eq!(symbols.intern("first").as_u32(), 1);
        assert_eq!(symbols.intern("second").as_u32(), 2);
        assert_eq!(symbols.name(SymbolId::new(0)), None);
    }

    #[test]
    fn reverse_lookup() {
        let symbols = SymbolRegistry::new();
        let id = symbols.intern("()V");
        assert_eq!(symbols.name(id).as_deref(), Some("()V"));
        assert_eq!(symbols.lookup("()V"), Some(id));
        assert_eq!(symbols.lookup("missing"), None);
        assert_eq!(symbols.name(SymbolId::new(99)), None);
    }

    #[test]
    fn concurrent_interning_agrees() {
        let symbols = Arc::new(SymbolRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let symbols = Arc::clone(&symbols);
                thread::spawn(move || {
                    (0..100)
                        .map(|i| symbols.intern(&format!("sym{i}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<SymbolId>> = handles
            .into_iter()
            .map(|h| h.join().expect("interning thread panicked"))
            .collect();
        for other in &results[1..] {
            assert_eq!(other, &results[0]);
        }
        assert_eq!(symbols.len(), 100);
    }
}
