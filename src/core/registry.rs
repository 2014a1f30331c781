//! Subscriber registry owned by multi-subscriber processors.
//!
//! Membership is tracked by [`Handle`], so subscribers never hold a strong
//! reference back to the registry that owns them. Readers take a copy-on-write
//! snapshot and iterate without holding the lock.

use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque membership handle returned by [`Registry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

struct State<S: ?Sized> {
    entries: Arc<[(Handle, Arc<S>)]>,
    next_id: u64,
    terminated: bool,
}

/// Copy-on-write subscriber registry.
pub struct Registry<S: ?Sized> {
    state: Mutex<State<S>>,
}

impl<S: ?Sized> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ?Sized> Registry<S> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: Arc::from(Vec::new()),
                next_id: 0,
                terminated: false,
            }),
        }
    }

    /// Register a subscriber. Returns `None` once the registry was terminated.
    pub fn add(&self, subscriber: Arc<S>) -> Option<Handle> {
        let mut state = self.state.lock();
        if state.terminated {
            return None;
        }
        let handle = Handle(state.next_id);
        state.next_id += 1;
        let mut entries: Vec<(Handle, Arc<S>)> = state.entries.iter().cloned().collect();
        entries.push((handle, subscriber));
        state.entries = Arc::from(entries);
        Some(handle)
    }

    /// Remove a subscriber. Returns the number still registered if it was present.
    pub fn remove(&self, handle: Handle) -> Option<usize> {
        let mut state = self.state.lock();
        let position = state.entries.iter().position(|(h, _)| *h == handle)?;
        let mut entries: Vec<(Handle, Arc<S>)> = state.entries.iter().cloned().collect();
        entries.remove(position);
        state.entries = Arc::from(entries);
        Some(state.entries.len())
    }

    /// Lock-free iteration view of the current members.
    pub fn snapshot(&self) -> Arc<[(Handle, Arc<S>)]> {
        self.state.lock().entries.clone()
    }

    /// Close the registry and hand back its final members. Only the first call
    /// returns them; later calls return an empty list.
    pub fn terminate(&self) -> Vec<Arc<S>> {
        let mut state = self.state.lock();
        if state.terminated {
            return Vec::new();
        }
        state.terminated = true;
        let entries = std::mem::replace(&mut state.entries, Arc::from(Vec::new()));
        entries.iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_snapshot() {
        let registry: Registry<u32> = Registry::new();
        let a = registry.add(Arc::new(1)).unwrap();
        let _b = registry.add(Arc::new(2)).unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(registry.remove(a), Some(1));
        // the old snapshot is unaffected
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.remove(a), None);
        assert_eq!(*registry.snapshot()[0].1, 2);
    }

    #[test]
    fn test_terminate_rejects_new_members() {
        let registry: Registry<u32> = Registry::new();
        registry.add(Arc::new(7));
        assert_eq!(registry.terminate().len(), 1);
        assert!(registry.terminate().is_empty());
        assert!(registry.add(Arc::new(8)).is_none());
        assert!(registry.is_empty());
    }
}
