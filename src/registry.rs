//! Ordered, id-unique stub registry.
//!
//! Registration order is matching priority: the lowest index whose
//! matchers all pass wins. Structural changes take the write lock; lookups
//! take the read lock. `find_match` evaluates matchers on a snapshot taken
//! under the read lock, so user matcher code never runs while the lock is
//! held.

use crate::request::Request;
use crate::stub::Stub;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Category of a registry failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfRange,
    DuplicateId,
    NotFound,
}

/// Registry operation failure. The Display string is the human-readable
/// message reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Argument index={index} is outside of range [0, {bound})")]
    OutOfRange { index: usize, bound: usize },
    #[error("Stub with ID {0} has already been added")]
    DuplicateId(String),
    #[error("Could not find stub with ID {0}")]
    NotFound(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RegistryError::OutOfRange { .. } => ErrorKind::OutOfRange,
            RegistryError::DuplicateId(_) => ErrorKind::DuplicateId,
            RegistryError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Thread-safe ordered collection of stubs.
///
/// Read indices are valid in `[0, len)`; insertion positions in `[0, len]`.
#[derive(Debug, Default)]
pub struct StubRegistry {
    stubs: RwLock<Vec<Arc<Stub>>>,
}

fn position(stubs: &[Arc<Stub>], id: &str) -> Option<usize> {
    stubs.iter().position(|s| s.id() == id)
}

fn check_read_index(index: usize, len: usize) -> Result<(), RegistryError> {
    if index < len {
        Ok(())
    } else {
        Err(RegistryError::OutOfRange { index, bound: len })
    }
}

fn check_insert_index(index: usize, len: usize) -> Result<(), RegistryError> {
    if index <= len {
        Ok(())
    } else {
        Err(RegistryError::OutOfRange {
            index,
            bound: len + 1,
        })
    }
}

fn check_stub(stub: &Stub) -> Result<(), RegistryError> {
    if stub.id().is_empty() {
        return Err(RegistryError::InvalidArgument(
            "stub id must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl StubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.read().is_empty()
    }

    /// Identifiers in registry order.
    pub fn ids(&self) -> Vec<String> {
        self.stubs.read().iter().map(|s| s.id().to_string()).collect()
    }

    /// Snapshot of the registered stubs in order.
    pub fn stubs(&self) -> Vec<Arc<Stub>> {
        self.stubs.read().clone()
    }

    pub fn get(&self, index: usize) -> Result<Arc<Stub>, RegistryError> {
        let stubs = self.stubs.read();
        check_read_index(index, stubs.len())?;
        Ok(Arc::clone(&stubs[index]))
    }

    pub fn find_index(&self, id: &str) -> Option<usize> {
        position(&self.stubs.read(), id)
    }

    pub fn find(&self, id: &str) -> Option<Arc<Stub>> {
        let stubs = self.stubs.read();
        position(&stubs, id).map(|i| Arc::clone(&stubs[i]))
    }

    pub fn has(&self, id: &str) -> bool {
        self.find_index(id).is_some()
    }

    /// Append a stub.
    pub fn add(&self, stub: impl Into<Arc<Stub>>) -> Result<(), RegistryError> {
        let stub = stub.into();
        check_stub(&stub)?;
        let mut stubs = self.stubs.write();
        if position(&stubs, stub.id()).is_some() {
            return Err(RegistryError::DuplicateId(stub.id().to_string()));
        }
        debug!(stub_id = %stub.id(), index = stubs.len(), "Stub added");
        stubs.push(stub);
        Ok(())
    }

    /// Add each stub in order; one outcome per element, failures do not
    /// stop the batch.
    pub fn add_all<I, S>(&self, stubs: I) -> Vec<Result<(), RegistryError>>
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<Stub>>,
    {
        stubs.into_iter().map(|stub| self.add(stub)).collect()
    }

    /// Insert at `index`, shifting later stubs. `index == len` appends.
    pub fn insert(&self, index: usize, stub: impl Into<Arc<Stub>>) -> Result<(), RegistryError> {
        let stub = stub.into();
        check_stub(&stub)?;
        let mut stubs = self.stubs.write();
        check_insert_index(index, stubs.len())?;
        if position(&stubs, stub.id()).is_some() {
            return Err(RegistryError::DuplicateId(stub.id().to_string()));
        }
        debug!(stub_id = %stub.id(), index, "Stub inserted");
        stubs.insert(index, stub);
        Ok(())
    }

    pub fn remove_at(&self, index: usize) -> Option<Arc<Stub>> {
        let mut stubs = self.stubs.write();
        if index >= stubs.len() {
            return None;
        }
        let stub = stubs.remove(index);
        debug!(stub_id = %stub.id(), index, "Stub removed");
        Some(stub)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Stub>> {
        let mut stubs = self.stubs.write();
        let index = position(&stubs, id)?;
        debug!(stub_id = %id, index, "Stub removed");
        Some(stubs.remove(index))
    }

    /// Clear the registry, returning the stubs it held in order.
    pub fn remove_all(&self) -> Vec<Arc<Stub>> {
        let removed = std::mem::take(&mut *self.stubs.write());
        debug!(count = removed.len(), "All stubs removed");
        removed
    }

    /// Put `stub` in place of the stub at `index`, returning the old one.
    ///
    /// The new stub may reuse the id of the stub it replaces but not the id
    /// of any other stub. On failure the registry is unchanged.
    pub fn replace_at(
        &self,
        index: usize,
        stub: impl Into<Arc<Stub>>,
    ) -> Result<Arc<Stub>, RegistryError> {
        let stub = stub.into();
        check_stub(&stub)?;
        let mut stubs = self.stubs.write();
        check_read_index(index, stubs.len())?;
        if stubs[index].id() != stub.id() && position(&stubs, stub.id()).is_some() {
            return Err(RegistryError::DuplicateId(stub.id().to_string()));
        }
        debug!(old_id = %stubs[index].id(), new_id = %stub.id(), index, "Stub replaced");
        Ok(std::mem::replace(&mut stubs[index], stub))
    }

    /// Replace the stub with `old`'s id by `new`, keeping its position.
    pub fn replace(&self, old: &Stub, new: impl Into<Arc<Stub>>) -> Result<Arc<Stub>, RegistryError> {
        let new = new.into();
        check_stub(&new)?;
        let mut stubs = self.stubs.write();
        let index =
            position(&stubs, old.id()).ok_or_else(|| RegistryError::NotFound(old.id().to_string()))?;
        if old.id() != new.id() && position(&stubs, new.id()).is_some() {
            return Err(RegistryError::DuplicateId(new.id().to_string()));
        }
        debug!(old_id = %old.id(), new_id = %new.id(), index, "Stub replaced");
        Ok(std::mem::replace(&mut stubs[index], new))
    }

    /// First stub, in registry order, whose matchers all pass.
    pub fn find_match(&self, request: &Request) -> Option<Arc<Stub>> {
        let snapshot = self.stubs();
        snapshot.into_iter().find(|stub| stub.matches_request(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::PathMatcher;
    use crate::stub::tests::{ok_stub, CountingMatcher};
    use std::sync::atomic::Ordering;
    use std::thread;

    fn registry_with(ids: &[&str]) -> StubRegistry {
        let registry = StubRegistry::new();
        for id in ids {
            registry.add(ok_stub(id)).unwrap();
        }
        registry
    }

    #[test]
    fn test_add_and_lookup() {
        let registry = registry_with(&["a", "b"]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().id(), "b");
        assert_eq!(registry.find_index("a"), Some(0));
        assert_eq!(registry.find("b").unwrap().id(), "b");
        assert!(registry.has("a"));
        assert!(!registry.has("c"));
        assert!(registry.find("c").is_none());
        assert_eq!(registry.find_index("c"), None);
    }

    #[test]
    fn test_duplicate_add_leaves_registry_unchanged() {
        let registry = registry_with(&["a", "b"]);
        let err = registry.add(ok_stub("a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateId);
        assert_eq!(err.to_string(), "Stub with ID a has already been added");
        assert_eq!(registry.ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_id_is_invalid() {
        let registry = StubRegistry::new();
        let err = registry.add(ok_stub("")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_out_of_range() {
        let registry = registry_with(&["a"]);
        let err = registry.get(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(err.to_string(), "Argument index=1 is outside of range [0, 1)");
        assert!(StubRegistry::new().get(0).is_err());
    }

    #[test]
    fn test_add_all_reports_each_outcome() {
        let registry = registry_with(&["a"]);
        let results = registry.add_all(vec![ok_stub("b"), ok_stub("a"), ok_stub(""), ok_stub("c")]);

        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::DuplicateId);
        assert_eq!(
            results[2].as_ref().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert!(results[3].is_ok());
        assert_eq!(registry.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_insert_positions() {
        let registry = registry_with(&["a", "c"]);
        registry.insert(1, ok_stub("b")).unwrap();
        registry.insert(0, ok_stub("first")).unwrap();
        registry.insert(4, ok_stub("last")).unwrap();
        assert_eq!(registry.ids(), vec!["first", "a", "b", "c", "last"]);
    }

    #[test]
    fn test_insert_failures() {
        let registry = registry_with(&["a"]);
        let err = registry.insert(2, ok_stub("b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        let err = registry.insert(0, ok_stub("a")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateId);
        assert_eq!(registry.ids(), vec!["a"]);
    }

    #[test]
    fn test_remove() {
        let registry = registry_with(&["a", "b", "c"]);
        assert_eq!(registry.remove_at(1).unwrap().id(), "b");
        assert!(registry.remove_at(2).is_none());
        assert_eq!(registry.remove("c").unwrap().id(), "c");
        assert!(registry.remove("c").is_none());
        assert_eq!(registry.ids(), vec!["a"]);
    }

    #[test]
    fn test_remove_all_returns_stubs_in_order() {
        let registry = registry_with(&["a", "b", "c"]);
        let removed: Vec<_> = registry
            .remove_all()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(removed, vec!["a", "b", "c"]);
        assert!(registry.is_empty());
        assert!(registry.remove_all().is_empty());
    }

    #[test]
    fn test_replace_at() {
        let registry = registry_with(&["a", "b", "c"]);

        let old = registry.replace_at(1, ok_stub("x")).unwrap();
        assert_eq!(old.id(), "b");
        assert_eq!(registry.ids(), vec!["a", "x", "c"]);

        // Same id as the stub being replaced is allowed.
        registry.replace_at(1, ok_stub("x")).unwrap();
        assert_eq!(registry.ids(), vec!["a", "x", "c"]);
    }

    #[test]
    fn test_replace_at_failures_leave_registry_unchanged() {
        let registry = registry_with(&["a", "b"]);

        let err = registry.replace_at(0, ok_stub("b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateId);

        // The end position is valid for insertion, not for replacement.
        let err = registry.replace_at(2, ok_stub("z")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);

        assert_eq!(registry.ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_replace_by_stub() {
        let registry = registry_with(&["a", "b"]);
        let old = registry.find("a").unwrap();

        let replaced = registry.replace(&old, ok_stub("z")).unwrap();
        assert_eq!(replaced.id(), "a");
        assert_eq!(registry.ids(), vec!["z", "b"]);

        let err = registry.replace(&old, ok_stub("y")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let z = registry.find("z").unwrap();
        let err = registry.replace(&z, ok_stub("b")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateId);
        assert_eq!(registry.ids(), vec!["z", "b"]);
    }

    #[test]
    fn test_find_match_first_wins() {
        let registry = StubRegistry::new();
        registry
            .add(ok_stub("specific").with_matcher(PathMatcher::path("/users/me").unwrap()))
            .unwrap();
        registry
            .add(ok_stub("generic").with_matcher(PathMatcher::path("/users/{id}").unwrap()))
            .unwrap();

        let hit = registry.find_match(&Request::new("GET", "/users/me")).unwrap();
        assert_eq!(hit.id(), "specific");
        let hit = registry.find_match(&Request::new("GET", "/users/42")).unwrap();
        assert_eq!(hit.id(), "generic");
        assert!(registry.find_match(&Request::new("GET", "/posts")).is_none());
    }

    #[test]
    fn test_find_match_stops_at_first_success() {
        let (miss, miss_calls) = CountingMatcher::new(false);
        let (hit, hit_calls) = CountingMatcher::new(true);
        let (later, later_calls) = CountingMatcher::new(true);

        let registry = StubRegistry::new();
        registry.add(ok_stub("miss").with_matcher(miss)).unwrap();
        registry.add(ok_stub("hit").with_matcher(hit)).unwrap();
        registry.add(ok_stub("later").with_matcher(later)).unwrap();

        let found = registry.find_match(&Request::new("GET", "/")).unwrap();
        assert_eq!(found.id(), "hit");
        assert_eq!(miss_calls.load(Ordering::SeqCst), 1);
        assert_eq!(hit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_find_match_respects_insert_position() {
        let registry = StubRegistry::new();
        registry
            .add(ok_stub("generic").with_matcher(PathMatcher::path("/{}").unwrap()))
            .unwrap();
        registry
            .insert(0, ok_stub("health").with_matcher(PathMatcher::path("/health").unwrap()))
            .unwrap();

        let hit = registry.find_match(&Request::new("GET", "/health")).unwrap();
        assert_eq!(hit.id(), "health");
    }

    #[test]
    fn test_concurrent_adds_and_matches() {
        let registry = Arc::new(StubRegistry::new());
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for j in 0..25 {
                        let id = format!("stub-{}-{}", i, j);
                        registry.add(ok_stub(&id)).unwrap();
                        registry.find_match(&Request::new("GET", "/"));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(registry.len(), 200);
        let mut ids = registry.ids();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }
}
