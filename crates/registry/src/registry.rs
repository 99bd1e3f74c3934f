//! The capability registry.
//!
//! Internally a copy-on-write map behind an `RwLock<Arc<…>>`: writers clone
//! the map, mutate the clone, and swap the `Arc` inside the write lock, so
//! every reader observes either the old or the new snapshot in full — never a
//! mixture.  Lookups and filters clone the `Arc` and run lock-free from
//! there, which keeps the read path cheap under concurrent executions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::{CapabilityDescriptor, FilterCriteria, RegistryError};

/// An immutable point-in-time view of the registry.
pub type RegistrySnapshot = Arc<HashMap<String, CapabilityDescriptor>>;

/// Concurrency-safe registry of capability descriptors.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    inner: RwLock<RegistrySnapshot>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor.
    ///
    /// # Errors
    /// [`RegistryError::DuplicateCapability`] when the id already exists and
    /// `overwrite` is not set.
    pub fn register(
        &self,
        descriptor: CapabilityDescriptor,
        overwrite: bool,
    ) -> Result<(), RegistryError> {
        let mut guard = self.inner.write().expect("registry lock poisoned");

        if !overwrite && guard.contains_key(&descriptor.id) {
            return Err(RegistryError::DuplicateCapability(descriptor.id));
        }

        let mut map = (**guard).clone();
        info!(capability = %descriptor.id, "registering capability");
        map.insert(descriptor.id.clone(), descriptor);
        *guard = Arc::new(map);
        Ok(())
    }

    /// Remove a single descriptor.
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] when the id is absent.
    pub fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut guard = self.inner.write().expect("registry lock poisoned");

        if !guard.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_owned()));
        }

        let mut map = (**guard).clone();
        map.remove(id);
        *guard = Arc::new(map);
        Ok(())
    }

    /// Atomically replace the whole registry with a freshly discovered set.
    ///
    /// In-flight `lookup`/`filter` calls keep reading the snapshot they
    /// already hold.  Returns the number of capabilities loaded.
    ///
    /// # Errors
    /// [`RegistryError::DuplicateCapability`] when the batch itself contains
    /// two descriptors with the same id; the previous snapshot stays in place.
    pub fn reload(
        &self,
        descriptors: Vec<CapabilityDescriptor>,
    ) -> Result<usize, RegistryError> {
        let mut map = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if map.contains_key(&descriptor.id) {
                return Err(RegistryError::DuplicateCapability(descriptor.id));
            }
            map.insert(descriptor.id.clone(), descriptor);
        }

        let count = map.len();
        let mut guard = self.inner.write().expect("registry lock poisoned");
        *guard = Arc::new(map);
        info!(count, "registry reloaded");
        Ok(count)
    }

    /// Fetch a descriptor by id.
    pub fn lookup(&self, id: &str) -> Result<CapabilityDescriptor, RegistryError> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))
    }

    /// Return every descriptor matching `criteria`, ascending by id.
    ///
    /// Deterministic: the same snapshot and criteria always produce the same
    /// output in the same order.
    pub fn filter(&self, criteria: &FilterCriteria) -> Vec<CapabilityDescriptor> {
        let snapshot = self.snapshot();
        let mut hits: Vec<CapabilityDescriptor> = snapshot
            .values()
            .filter(|d| criteria.matches(d))
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits
    }

    /// A cheap immutable view of the current registry contents.
    pub fn snapshot(&self) -> RegistrySnapshot {
        Arc::clone(&self.inner.read().expect("registry lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use capabilities::mock::MockCapability;
    use serde_json::json;

    use super::*;
    use crate::CapabilityKind;

    fn descriptor(id: &str, category: &str, tags: &[&str]) -> CapabilityDescriptor {
        let handler = Arc::new(MockCapability::returning(id, json!({ "ok": true })));
        CapabilityDescriptor::new(id, CapabilityKind::Tool, category, handler)
            .with_tags(tags.iter().copied())
    }

    fn seeded() -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        registry.register(descriptor("fetcher", "Data", &["fetch", "http"]), false).unwrap();
        registry.register(descriptor("cleaner", "Data", &["clean"]), false).unwrap();
        registry.register(descriptor("scorer", "Analysis", &["score", "clean"]), false).unwrap();
        registry.register(descriptor("reporter", "Output", &["report"]), false).unwrap();
        registry
    }

    #[test]
    fn duplicate_register_is_rejected_unless_overwritten() {
        let registry = seeded();

        let err = registry
            .register(descriptor("fetcher", "Data", &[]), false)
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateCapability("fetcher".into()));

        registry
            .register(descriptor("fetcher", "Ingest", &[]), true)
            .expect("overwrite flag permits replacement");
        assert_eq!(registry.lookup("fetcher").unwrap().category, "Ingest");
    }

    #[test]
    fn lookup_of_missing_id_fails() {
        let registry = seeded();
        assert_eq!(
            registry.lookup("ghost").unwrap_err(),
            RegistryError::NotFound("ghost".into())
        );
    }

    #[test]
    fn filter_is_deterministic_and_sorted_by_id() {
        let registry = seeded();

        let all = registry.filter(&FilterCriteria::default());
        let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["cleaner", "fetcher", "reporter", "scorer"]);

        // Same criteria, same output.
        let again = registry.filter(&FilterCriteria::default());
        let ids_again: Vec<&str> = again.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ids_again);
    }

    #[test]
    fn categories_are_or_matched() {
        let registry = seeded();
        let hits = registry.filter(&FilterCriteria::default().categories(["Data", "Output"]));
        let ids: Vec<&str> = hits.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["cleaner", "fetcher", "reporter"]);
    }

    #[test]
    fn tags_or_by_default_and_all_when_requested() {
        let registry = seeded();

        let any = registry.filter(&FilterCriteria::default().tags(["clean", "fetch"]));
        let ids: Vec<&str> = any.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["cleaner", "fetcher", "scorer"]);

        let all = registry.filter(
            &FilterCriteria::default().tags(["clean", "score"]).match_all_tags(),
        );
        let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["scorer"]);
    }

    #[test]
    fn names_intersect_and_exclusions_subtract_last() {
        let registry = seeded();

        let hits = registry.filter(
            &FilterCriteria::default()
                .categories(["Data"])
                .names(["fetcher", "cleaner", "scorer"])
                .exclude_names(["cleaner"]),
        );
        let ids: Vec<&str> = hits.iter().map(|d| d.id.as_str()).collect();
        // 'scorer' fails the category gate, 'cleaner' is excluded last.
        assert_eq!(ids, vec!["fetcher"]);
    }

    #[test]
    fn reload_swaps_atomically_and_old_snapshots_survive() {
        let registry = seeded();
        let before = registry.snapshot();

        registry
            .reload(vec![descriptor("solo", "Data", &[])])
            .expect("reload succeeds");

        // The held snapshot still sees the old world in full.
        assert_eq!(before.len(), 4);
        assert!(before.contains_key("fetcher"));

        // New readers see only the new world.
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("fetcher").is_err());
        assert!(registry.lookup("solo").is_ok());
    }

    #[test]
    fn reload_rejects_in_batch_duplicates_and_keeps_previous_state() {
        let registry = seeded();
        let err = registry
            .reload(vec![
                descriptor("dup", "Data", &[]),
                descriptor("dup", "Data", &[]),
            ])
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateCapability("dup".into()));
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn deregister_removes_exactly_one_entry() {
        let registry = seeded();
        registry.deregister("cleaner").unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.deregister("cleaner").unwrap_err(),
            RegistryError::NotFound("cleaner".into())
        );
    }
}
