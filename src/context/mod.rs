//! Immutable subscription context.
//!
//! A [`Context`] is an ordered key/value map that travels from the final
//! consumer upstream while a subscription is being established. Every mutating
//! operation returns a new `Context`; the receiver is never changed, so
//! instances can be shared between threads without synchronisation.
//!
//! # Examples
//!
//! ```rust
//! use fluxweld::context::Context;
//!
//! let base = Context::empty().put("tenant", "acme".to_string());
//! let child = base.put("request_id", 42u64);
//!
//! assert!(!base.has_key("request_id"));
//! assert_eq!(child.get::<u64>("request_id"), Some(&42));
//! assert_eq!(child.get::<String>("tenant").map(String::as_str), Some("acme"));
//! ```

mod propagation;

pub use propagation::{ContextWrite, DeferContextual, WithContext};

use std::any::Any;
use std::fmt;
use std::sync::Arc;

type Value = Arc<dyn Any + Send + Sync>;

/// Immutable ordered key/value map.
#[derive(Clone)]
pub struct Context {
    entries: Arc<[(Arc<str>, Value)]>,
}

impl Context {
    /// The empty context.
    pub fn empty() -> Self {
        Self {
            entries: Arc::from(Vec::new()),
        }
    }

    /// A context holding a single pair.
    pub fn of<K, V>(key: K, value: V) -> Self
    where
        K: Into<Arc<str>>,
        V: Any + Send + Sync,
    {
        Self::empty().put(key, value)
    }

    /// Returns a new context with `key` bound to `value`.
    ///
    /// An existing binding keeps its position and has its value replaced.
    pub fn put<K, V>(&self, key: K, value: V) -> Self
    where
        K: Into<Arc<str>>,
        V: Any + Send + Sync,
    {
        self.put_value(key.into(), Arc::new(value))
    }

    fn put_value(&self, key: Arc<str>, value: Value) -> Self {
        let mut entries: Vec<(Arc<str>, Value)> = self.entries.to_vec();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => entries.push((key, value)),
        }
        Self {
            entries: Arc::from(entries),
        }
    }

    /// Returns a new context holding every pair of `self` and `other`.
    /// Bindings from `other` win on conflicting keys.
    pub fn put_all(&self, other: &Context) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        other
            .entries
            .iter()
            .fold(self.clone(), |acc, (k, v)| acc.put_value(k.clone(), v.clone()))
    }

    /// Returns a new context without `key`.
    pub fn delete(&self, key: &str) -> Self {
        if !self.has_key(key) {
            return self.clone();
        }
        let entries: Vec<(Arc<str>, Value)> = self
            .entries
            .iter()
            .filter(|(k, _)| &**k != key)
            .cloned()
            .collect();
        Self {
            entries: Arc::from(entries),
        }
    }

    /// Typed lookup. `None` if the key is absent or bound to another type.
    pub fn get<V: Any>(&self, key: &str) -> Option<&V> {
        self.entries
            .iter()
            .find(|(k, _)| &**k == key)
            .and_then(|(_, v)| v.downcast_ref::<V>())
    }

    /// Typed lookup with a fallback.
    pub fn get_or_default<V: Any + Clone>(&self, key: &str, default: V) -> V {
        self.get::<V>(key).cloned().unwrap_or(default)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| &**k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| &**k)
    }

    /// Pairs in insertion order, values type-erased.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &(dyn Any + Send + Sync))> {
        self.entries.iter().map(|(k, v)| (&**k, &**v))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_put_all_other_wins() {
        let upstream = Context::empty().put("a", 1i32).put("b", 2i32);
        let downstream = Context::empty().put("b", 20i32).put("c", 30i32);
        let merged = upstream.put_all(&downstream);
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(merged.get::<i32>("b"), Some(&20));
        assert_eq!(upstream.get::<i32>("b"), Some(&2));
    }

    #[test]
    fn test_delete_and_type_mismatch() {
        let ctx = Context::of("k", "v".to_string());
        assert_eq!(ctx.get::<i32>("k"), None);
        assert_eq!(ctx.get_or_default("missing", 7u8), 7);
        let removed = ctx.delete("k");
        assert!(removed.is_empty());
        assert!(ctx.has_key("k"));
        assert_eq!(ctx.delete("absent").len(), 1);
    }

    proptest! {
        #[test]
        fn prop_put_never_mutates_receiver(
            pairs in proptest::collection::vec(("[a-d]", any::<i64>()), 0..8),
            key in "[a-e]",
            value in any::<i64>(),
        ) {
            let ctx = pairs
                .iter()
                .fold(Context::empty(), |c, (k, v)| c.put(k.as_str(), *v));
            let before = ctx.get::<i64>(&key).copied();
            let len_before = ctx.len();

            let next = ctx.put(key.as_str(), value);

            prop_assert_eq!(ctx.get::<i64>(&key).copied(), before);
            prop_assert_eq!(ctx.len(), len_before);
            prop_assert_eq!(next.get::<i64>(&key).copied(), Some(value));
        }
    }
}
