// Typed handles and append-only resource registries
//
// Every GPU resource lives in a registry and is addressed by a Handle.
// Handles are plain indices: never reused, never invalidated by growth.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed index into a [`HandleRegistry`].
///
/// `Handle<T>` is a plain u64 with a phantom type tag, so a buffer handle
/// cannot be passed where an image handle is expected. The `fn() -> T`
/// marker keeps the handle `Send + Sync + Copy` regardless of `T`.
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Sentinel returned by operations that failed to produce a resource.
    pub const NONE: Self = Self {
        id: u64::MAX,
        _marker: PhantomData,
    };

    pub(crate) fn from_index(index: usize) -> Self {
        Self {
            id: index as u64,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_none(&self) -> bool {
        self.id == u64::MAX
    }

    fn index(&self) -> usize {
        self.id as usize
    }
}

// Manual impls: derives would needlessly bound T.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Handle(NONE)")
        } else {
            write!(f, "Handle({})", self.id)
        }
    }
}

/// Append-only storage with optional name lookup.
///
/// Items are never removed or reordered, so a handle stays valid for the
/// registry's whole lifetime. A failed lookup logs and returns `None`
/// (or `Handle::NONE`); the caller decides whether that is fatal.
pub struct HandleRegistry<T> {
    items: Vec<T>,
    names: HashMap<String, Handle<T>>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            names: HashMap::new(),
        }
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an anonymous item.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let handle = Handle::from_index(self.items.len());
        self.items.push(value);
        handle
    }

    /// Idempotent named create: if the name is taken, the existing handle
    /// comes back and the builder is never run.
    pub fn insert_named(&mut self, name: &str, build: impl FnOnce() -> T) -> Handle<T> {
        if let Some(&existing) = self.names.get(name) {
            log::warn!("'{}' already exists, returning existing handle", name);
            return existing;
        }
        let handle = self.insert(build());
        self.names.insert(name.to_string(), handle);
        handle
    }

    /// Register a pre-built item under a unique name. Duplicates are
    /// rejected: the item is dropped and `NONE` returned.
    pub fn insert_with_name(&mut self, name: &str, value: T) -> Handle<T> {
        if self.names.contains_key(name) {
            log::error!("'{}' already exists, returning NONE", name);
            return Handle::NONE;
        }
        let handle = self.insert(value);
        self.names.insert(name.to_string(), handle);
        handle
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let item = self.items.get(handle.index());
        if item.is_none() {
            log::error!(
                "Handle {:?} not found (registry holds {} items)",
                handle,
                self.items.len()
            );
        }
        item
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let len = self.items.len();
        let item = self.items.get_mut(handle.index());
        if item.is_none() {
            log::error!("Handle {:?} not found (registry holds {} items)", handle, len);
        }
        item
    }

    pub fn handle_by_name(&self, name: &str) -> Handle<T> {
        match self.names.get(name) {
            Some(&handle) => handle,
            None => {
                log::error!("'{}' not found, returning NONE", name);
                Handle::NONE
            }
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<&T> {
        let handle = self.handle_by_name(name);
        if handle.is_none() {
            return None;
        }
        self.get(handle)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    /// Remove everything, yielding the items for teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.names.clear();
        self.items.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trip() {
        let mut registry = HandleRegistry::new();
        let a = registry.insert(10u32);
        let b = registry.insert(20u32);
        assert_eq!(registry.get(a), Some(&10));
        assert_eq!(registry.get(b), Some(&20));
        assert_ne!(a, b);
    }

    #[test]
    fn none_handle_lookup_fails() {
        let registry: HandleRegistry<u32> = HandleRegistry::new();
        assert!(Handle::<u32>::NONE.is_none());
        assert_eq!(registry.get(Handle::NONE), None);
    }

    #[test]
    fn out_of_range_handle_lookup_fails() {
        let mut registry = HandleRegistry::new();
        registry.insert(1u32);
        let stale = Handle::from_index(7);
        assert_eq!(registry.get(stale), None);
    }

    #[test]
    fn named_insert_is_idempotent() {
        let mut registry = HandleRegistry::new();
        let first = registry.insert_named("albedo", || 1u32);
        let second = registry.insert_named("albedo", || 2u32);
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first), Some(&1));
    }

    #[test]
    fn unique_insert_rejects_duplicates() {
        let mut registry = HandleRegistry::new();
        let first = registry.insert_with_name("fence", 1u32);
        let second = registry.insert_with_name("fence", 2u32);
        assert!(!first.is_none());
        assert!(second.is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn name_lookup() {
        let mut registry = HandleRegistry::new();
        let handle = registry.insert_with_name("camera", 5u32);
        assert_eq!(registry.handle_by_name("camera"), handle);
        assert!(registry.handle_by_name("missing").is_none());
        assert_eq!(registry.get_by_name("camera"), Some(&5));
    }

    #[test]
    fn mutation_through_handle() {
        let mut registry = HandleRegistry::new();
        let handle = registry.insert(1u32);
        *registry.get_mut(handle).unwrap() = 9;
        assert_eq!(registry.get(handle), Some(&9));
    }
}
