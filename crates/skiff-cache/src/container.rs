//! Concurrent container index.

use std::collections::HashMap;
use std::sync::RwLock;

use skiff_error::{EngineError, Result};

use crate::trie::{IdTrie, PrefixLookup};

/// Minimal view the cache needs of a stored container.
pub trait CacheEntry: Clone + Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);
}

/// Name slots are either squatted (rename in flight) or bound to an id.
enum NameSlot {
    Reserved,
    Bound(String),
}

struct Inner<T> {
    by_id: HashMap<String, T>,
    by_name: HashMap<String, NameSlot>,
    by_exec: HashMap<String, String>,
    trie: IdTrie,
}

/// In-memory container store indexed by id, name, exec id, and id prefix.
///
/// One reader/writer lock guards all four indices; readers get clones and
/// treat them as immutable snapshots.
pub struct ContainerCache<T> {
    inner: RwLock<Inner<T>>,
}

impl<T: CacheEntry> Default for ContainerCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheEntry> ContainerCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                by_exec: HashMap::new(),
                trie: IdTrie::new(),
            }),
        }
    }

    /// Resolves a name, full id, or unique id prefix. Ambiguous prefixes
    /// are an error; a miss is `Ok(None)`.
    pub fn get(&self, key: &str) -> Result<Option<T>> {
        let inner = self.inner.read().expect("container cache lock poisoned");
        match inner.trie.lookup(key) {
            PrefixLookup::Unique(id) => return Ok(inner.by_id.get(&id).cloned()),
            PrefixLookup::Ambiguous => {
                return Err(EngineError::bad_request(format!(
                    "Multiple IDs found with provided prefix: {key}"
                )));
            }
            PrefixLookup::None => {}
        }
        if let Some(c) = inner.by_id.get(key) {
            return Ok(Some(c.clone()));
        }
        match inner.by_name.get(key) {
            Some(NameSlot::Bound(id)) => Ok(inner.by_id.get(id).cloned()),
            _ => Ok(None),
        }
    }

    /// Inserts a container, replacing any previous entry with the same id.
    /// Name collisions are the caller's job to prevent via `reserve_name`.
    pub fn add(&self, container: T) {
        let mut inner = self.inner.write().expect("container cache lock poisoned");
        let id = container.id().to_string();
        let name = container.name().to_string();
        inner.trie.insert(&id);
        inner.by_name.insert(name, NameSlot::Bound(id.clone()));
        inner.by_id.insert(id, container);
    }

    /// Removes a container by name or id, along with its exec sessions.
    /// Returns the removed entry.
    pub fn delete(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.write().expect("container cache lock poisoned");
        let id = match inner.trie.lookup(key) {
            PrefixLookup::Unique(id) => id,
            _ => match inner.by_name.get(key) {
                Some(NameSlot::Bound(id)) => id.clone(),
                _ => key.to_string(),
            },
        };
        let container = inner.by_id.remove(&id)?;
        inner.trie.remove(&id);
        inner.by_name.remove(container.name());
        inner.by_exec.retain(|_, owner| *owner != id);
        Some(container)
    }

    /// Squats a name so concurrent create/rename cannot take it.
    pub fn reserve_name(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("container cache lock poisoned");
        if inner.by_name.contains_key(name) {
            let owner = match inner.by_name.get(name) {
                Some(NameSlot::Bound(id)) => id.clone(),
                _ => String::new(),
            };
            return Err(EngineError::conflict(format!(
                "Conflict. The name \"{name}\" is already in use by container {owner}. \
                 You have to remove (or rename) that container to be able to reuse that name."
            )));
        }
        inner.by_name.insert(name.to_string(), NameSlot::Reserved);
        Ok(())
    }

    /// Releases a squatted name after a failed rename or create.
    pub fn release_name(&self, name: &str) {
        let mut inner = self.inner.write().expect("container cache lock poisoned");
        if matches!(inner.by_name.get(name), Some(NameSlot::Reserved)) {
            inner.by_name.remove(name);
        }
    }

    /// Atomically swaps a container's name. The new name must have been
    /// reserved (or be free); fails if the old name is absent.
    pub fn update_name(&self, old: &str, new: &str) -> Result<()> {
        let mut inner = self.inner.write().expect("container cache lock poisoned");
        let id = match inner.by_name.get(old) {
            Some(NameSlot::Bound(id)) => id.clone(),
            _ => return Err(EngineError::no_such_container(old)),
        };
        if let Some(NameSlot::Bound(other)) = inner.by_name.get(new) {
            if *other != id {
                return Err(EngineError::conflict(format!(
                    "Conflict. The name \"{new}\" is already in use by container {other}. \
                     You have to remove (or rename) that container to be able to reuse that name."
                )));
            }
        }
        inner.by_name.remove(old);
        inner.by_name.insert(new.to_string(), NameSlot::Bound(id.clone()));
        if let Some(container) = inner.by_id.get_mut(&id) {
            container.set_name(new);
        }
        Ok(())
    }

    /// Records an exec session as owned by a container.
    pub fn add_exec(&self, container_id: &str, exec_id: &str) {
        let mut inner = self.inner.write().expect("container cache lock poisoned");
        inner
            .by_exec
            .insert(exec_id.to_string(), container_id.to_string());
    }

    /// Resolves an exec id to its owning container.
    pub fn get_by_exec(&self, exec_id: &str) -> Option<T> {
        let inner = self.inner.read().expect("container cache lock poisoned");
        let id = inner.by_exec.get(exec_id)?;
        inner.by_id.get(id).cloned()
    }

    /// Snapshot of all cached containers.
    pub fn list(&self) -> Vec<T> {
        let inner = self.inner.read().expect("container cache lock poisoned");
        inner.by_id.values().cloned().collect()
    }
}
