//! Process-wide, keyed hook registry.
//!
//! Hooks observe signals that fall outside the protocol (dropped `Next` and
//! dropped errors), transform operator failures, and decorate producers as they
//! are assembled. Each family holds an ordered list of `(key, hook)` pairs:
//! registering under a new key appends, registering under an existing key
//! replaces that hook in place.
//!
//! The registry is an immutable snapshot behind an `Arc` that is swapped on
//! every change, so invoking hooks never holds a lock while user code runs.
//! Tests that install hooks should remove them again with the keyed `reset_*`
//! functions; [`reset_all`] restores the defaults.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use fluxweld::hooks;
//!
//! let dropped = Arc::new(AtomicUsize::new(0));
//! let counter = dropped.clone();
//! hooks::on_next_dropped("doc-counter", move |_value| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! hooks::next_dropped(5u32);
//! assert!(dropped.load(Ordering::SeqCst) >= 1);
//!
//! hooks::reset_next_dropped_key("doc-counter");
//! ```

use std::any::{type_name, Any};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::core::traits::Producer;
use crate::error::Error;

type NextDroppedHook = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type ErrorDroppedHook = Arc<dyn Fn(&Error) + Send + Sync>;
type OperatorErrorHook = Arc<dyn Fn(Error, Option<&dyn Any>) -> Error + Send + Sync>;
type AssemblyHook = Arc<dyn Fn(Assembly) -> Assembly + Send + Sync>;

type Keyed<H> = Vec<(Arc<str>, H)>;

/// A producer under construction, handed to assembly hooks.
///
/// The producer is type-erased; hooks that care about a particular item type
/// recover it with [`Assembly::producer`] and substitute it with
/// [`Assembly::replace`].
pub struct Assembly {
    stage: &'static str,
    producer: Box<dyn Any + Send + Sync>,
}

impl Assembly {
    fn new<T: Send + 'static>(stage: &'static str, producer: Arc<dyn Producer<T>>) -> Self {
        Self {
            stage,
            producer: Box::new(producer),
        }
    }

    /// Name of the stage being assembled.
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// The producer, if it emits `T`.
    pub fn producer<T: Send + 'static>(&self) -> Option<Arc<dyn Producer<T>>> {
        self.producer.downcast_ref::<Arc<dyn Producer<T>>>().cloned()
    }

    /// Substitute the producer.
    pub fn replace<T: Send + 'static>(self, producer: Arc<dyn Producer<T>>) -> Self {
        Self::new(self.stage, producer)
    }

    fn into_producer<T: Send + 'static>(self) -> Option<Arc<dyn Producer<T>>> {
        self.producer
            .downcast::<Arc<dyn Producer<T>>>()
            .ok()
            .map(|boxed| *boxed)
    }
}

#[derive(Clone, Default)]
struct Hooks {
    next_dropped: Keyed<NextDroppedHook>,
    error_dropped: Keyed<ErrorDroppedHook>,
    operator_error: Keyed<OperatorErrorHook>,
    each_operator: Keyed<AssemblyHook>,
    last_operator: Keyed<AssemblyHook>,
}

static HOOKS: Lazy<RwLock<Arc<Hooks>>> = Lazy::new(|| RwLock::new(Arc::new(Hooks::default())));

fn current() -> Arc<Hooks> {
    HOOKS.read().clone()
}

fn update(f: impl FnOnce(&mut Hooks)) {
    let mut guard = HOOKS.write();
    let mut next = Hooks::clone(&guard);
    f(&mut next);
    *guard = Arc::new(next);
}

fn upsert<H>(list: &mut Keyed<H>, key: Arc<str>, hook: H) {
    match list.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = hook,
        None => list.push((key, hook)),
    }
}

fn remove_key<H>(list: &mut Keyed<H>, key: &str) {
    list.retain(|(k, _)| &**k != key);
}

// Registration

/// Observe values that were emitted outside the protocol window.
pub fn on_next_dropped<F>(key: impl Into<Arc<str>>, hook: F)
where
    F: Fn(&dyn Any) + Send + Sync + 'static,
{
    let key = key.into();
    update(|h| upsert(&mut h.next_dropped, key, Arc::new(hook)));
}

/// Observe errors that could not be delivered.
pub fn on_error_dropped<F>(key: impl Into<Arc<str>>, hook: F)
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    let key = key.into();
    update(|h| upsert(&mut h.error_dropped, key, Arc::new(hook)));
}

/// Transform operator failures. Hooks run in registration order, each
/// receiving the previous hook's result.
pub fn on_operator_error<F>(key: impl Into<Arc<str>>, hook: F)
where
    F: Fn(Error, Option<&dyn Any>) -> Error + Send + Sync + 'static,
{
    let key = key.into();
    update(|h| upsert(&mut h.operator_error, key, Arc::new(hook)));
}

/// Decorate every assembled stage.
pub fn on_each_operator<F>(key: impl Into<Arc<str>>, hook: F)
where
    F: Fn(Assembly) -> Assembly + Send + Sync + 'static,
{
    let key = key.into();
    update(|h| upsert(&mut h.each_operator, key, Arc::new(hook)));
}

/// Decorate the outermost stage of a chain when it is subscribed.
pub fn on_last_operator<F>(key: impl Into<Arc<str>>, hook: F)
where
    F: Fn(Assembly) -> Assembly + Send + Sync + 'static,
{
    let key = key.into();
    update(|h| upsert(&mut h.last_operator, key, Arc::new(hook)));
}

// Reset

pub fn reset_next_dropped_key(key: &str) {
    update(|h| remove_key(&mut h.next_dropped, key));
}

pub fn reset_next_dropped() {
    update(|h| h.next_dropped.clear());
}

pub fn reset_error_dropped_key(key: &str) {
    update(|h| remove_key(&mut h.error_dropped, key));
}

pub fn reset_error_dropped() {
    update(|h| h.error_dropped.clear());
}

pub fn reset_operator_error_key(key: &str) {
    update(|h| remove_key(&mut h.operator_error, key));
}

pub fn reset_operator_error() {
    update(|h| h.operator_error.clear());
}

pub fn reset_each_operator_key(key: &str) {
    update(|h| remove_key(&mut h.each_operator, key));
}

pub fn reset_each_operator() {
    update(|h| h.each_operator.clear());
}

pub fn reset_last_operator_key(key: &str) {
    update(|h| remove_key(&mut h.last_operator, key));
}

pub fn reset_last_operator() {
    update(|h| h.last_operator.clear());
}

/// Remove every installed hook.
pub fn reset_all() {
    *HOOKS.write() = Arc::new(Hooks::default());
}

// Invocation

/// Report a `Next` that cannot be delivered. The value is dropped afterwards.
pub fn next_dropped<T: Any>(value: T) {
    #[cfg(feature = "metrics")]
    metrics::counter!("fluxweld_dropped_next_total").increment(1);

    let hooks = current();
    if hooks.next_dropped.is_empty() {
        tracing::debug!(value_type = type_name::<T>(), "next signal dropped");
        return;
    }
    for (_, hook) in hooks.next_dropped.iter() {
        hook(&value);
    }
}

/// Report an error that cannot be delivered.
pub fn error_dropped(error: Error) {
    #[cfg(feature = "metrics")]
    metrics::counter!("fluxweld_dropped_error_total").increment(1);

    let hooks = current();
    if hooks.error_dropped.is_empty() {
        tracing::error!(error = %error, kind = error.as_label(), "error signal dropped");
        return;
    }
    for (_, hook) in hooks.error_dropped.iter() {
        hook(&error);
    }
}

/// Pass an operator failure through the installed transforms.
pub fn operator_error(error: Error, value: Option<&dyn Any>) -> Error {
    let hooks = current();
    hooks
        .operator_error
        .iter()
        .fold(error, |error, (_, hook)| hook(error, value))
}

fn assemble<T: Send + 'static>(
    list: &Keyed<AssemblyHook>,
    stage: &'static str,
    producer: Arc<dyn Producer<T>>,
) -> Arc<dyn Producer<T>> {
    if list.is_empty() {
        return producer;
    }
    let assembly = list
        .iter()
        .fold(Assembly::new(stage, producer.clone()), |a, (_, hook)| hook(a));
    match assembly.into_producer::<T>() {
        Some(substituted) => substituted,
        None => {
            tracing::warn!(stage, "assembly hook returned a producer of another item type, ignoring it");
            producer
        }
    }
}

/// Apply the per-stage assembly hooks.
pub fn on_assembly<T: Send + 'static>(
    stage: &'static str,
    producer: Arc<dyn Producer<T>>,
) -> Arc<dyn Producer<T>> {
    assemble(&current().each_operator, stage, producer)
}

/// Apply the outermost-stage assembly hooks.
pub fn on_last_assembly<T: Send + 'static>(
    stage: &'static str,
    producer: Arc<dyn Producer<T>>,
) -> Arc<dyn Producer<T>> {
    assemble(&current().last_operator, stage, producer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Marker(u32);

    #[test]
    fn test_keyed_registration_is_additive_and_replaces() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        on_next_dropped("hooks-test-a", move |v| {
            if v.downcast_ref::<Marker>().is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let counter = second.clone();
        on_next_dropped("hooks-test-b", move |v| {
            if let Some(Marker(n)) = v.downcast_ref::<Marker>() {
                counter.fetch_add(*n as usize, Ordering::SeqCst);
            }
        });

        next_dropped(Marker(10));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 10);

        // same key replaces in place
        on_next_dropped("hooks-test-a", |_| {});
        next_dropped(Marker(1));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 11);

        reset_next_dropped_key("hooks-test-a");
        reset_next_dropped_key("hooks-test-b");
        next_dropped(Marker(1));
        assert_eq!(second.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_operator_error_hooks_fold_in_order() {
        on_operator_error("hooks-test-wrap", |e, value| match e {
            Error::Custom(msg) if msg.starts_with("fold:") => {
                let seen = value.and_then(|v| v.downcast_ref::<i32>()).copied();
                Error::custom(format!("{msg}:{seen:?}"))
            }
            other => other,
        });
        let out = operator_error(Error::custom("fold:x"), Some(&3i32));
        assert_eq!(out.to_string(), "fold:x:Some(3)");
        reset_operator_error_key("hooks-test-wrap");
    }
}
