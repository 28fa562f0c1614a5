//! In-memory [`RecordClient`] used by the test suites.
//!
//! Besides emulating the server's Get/Create/Patch semantics (resource
//! versions, optimistic-lock conflicts, merge overlays), the fake records
//! enough bookkeeping to let tests assert the supervisor's write
//! discipline: injected failures, per-call snapshots and a high-water
//! mark of concurrently running patches.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ClientError, PatchStrategy, RecordClient};
use crate::store::{ObjectKey, RecordData, RecordKind, RemoteRecord};

#[derive(Debug, Default)]
struct FakeState {
    objects: HashMap<(RecordKind, ObjectKey), RemoteRecord>,
    next_resource_version: u64,
    failing_patches: u32,
    conflicting_patches: u32,
    patch_calls: u32,
    create_calls: u32,
    in_flight_patches: u32,
    max_in_flight_patches: u32,
    patch_log: Vec<RemoteRecord>,
}

/// In-memory record client for tests.
#[derive(Debug, Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
    patch_delay: Mutex<Option<Duration>>,
}

impl FakeClient {
    /// Create an empty fake client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `record` directly into the store, assigning it a resource
    /// version.
    pub fn seed(&self, mut record: RemoteRecord) {
        let mut state = self.state.lock().unwrap();
        state.next_resource_version += 1;
        record.resource_version = Some(state.next_resource_version.to_string());
        state
            .objects
            .insert((record.kind, record.key.clone()), record);
    }

    /// Snapshot of the stored object, if any.
    #[must_use]
    pub fn record(&self, kind: RecordKind, key: &ObjectKey) -> Option<RemoteRecord> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(kind, key.clone()))
            .cloned()
    }

    /// Make the next `count` patch calls fail with an API error.
    pub fn fail_patches(&self, count: u32) {
        self.state.lock().unwrap().failing_patches = count;
    }

    /// Make the next `count` optimistic-lock patch calls fail with a
    /// conflict.
    pub fn conflict_patches(&self, count: u32) {
        self.state.lock().unwrap().conflicting_patches = count;
    }

    /// Sleep this long inside every patch call, widening race windows.
    pub fn set_patch_delay(&self, delay: Duration) {
        *self.patch_delay.lock().unwrap() = Some(delay);
    }

    /// Total number of patch calls observed.
    #[must_use]
    pub fn patch_calls(&self) -> u32 {
        self.state.lock().unwrap().patch_calls
    }

    /// Total number of create calls observed.
    #[must_use]
    pub fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    /// Highest number of patch calls ever running at the same time.
    #[must_use]
    pub fn max_concurrent_patches(&self) -> u32 {
        self.state.lock().unwrap().max_in_flight_patches
    }

    /// The records passed to successful patch calls, in order.
    #[must_use]
    pub fn patched_records(&self) -> Vec<RemoteRecord> {
        self.state.lock().unwrap().patch_log.clone()
    }
}

fn merge_data(target: &mut RecordData, patch: &RecordData) {
    match (target, patch) {
        (RecordData::Text(target), RecordData::Text(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        (RecordData::Opaque(target), RecordData::Opaque(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        }
        // kind mismatches cannot happen: objects are keyed by kind
        _ => {}
    }
}

#[async_trait]
impl RecordClient for FakeClient {
    async fn get(&self, kind: RecordKind, key: &ObjectKey) -> Result<RemoteRecord, ClientError> {
        self.record(kind, key).ok_or(ClientError::NotFound)
    }

    async fn create(&self, record: &RemoteRecord) -> Result<RemoteRecord, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;

        let id = (record.kind, record.key.clone());
        if state.objects.contains_key(&id) {
            return Err(ClientError::AlreadyExists);
        }

        state.next_resource_version += 1;
        let mut stored = record.clone();
        stored.resource_version = Some(state.next_resource_version.to_string());
        state.objects.insert(id, stored.clone());
        Ok(stored)
    }

    async fn patch(
        &self,
        record: &RemoteRecord,
        strategy: PatchStrategy,
    ) -> Result<RemoteRecord, ClientError> {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight_patches += 1;
            state.max_in_flight_patches = state.max_in_flight_patches.max(state.in_flight_patches);
        }

        let delay = *self.patch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.apply_patch(record, strategy);

        self.state.lock().unwrap().in_flight_patches -= 1;
        result
    }
}

impl FakeClient {
    fn apply_patch(
        &self,
        record: &RemoteRecord,
        strategy: PatchStrategy,
    ) -> Result<RemoteRecord, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.patch_calls += 1;

        if state.failing_patches > 0 {
            state.failing_patches -= 1;
            return Err(ClientError::Api("injected patch failure".to_owned()));
        }

        let id = (record.kind, record.key.clone());
        let Some(existing) = state.objects.get(&id).cloned() else {
            return Err(ClientError::NotFound);
        };

        if strategy == PatchStrategy::MergeWithOptimisticLock {
            if state.conflicting_patches > 0 {
                state.conflicting_patches -= 1;
                return Err(ClientError::Conflict);
            }
            if record.resource_version != existing.resource_version {
                return Err(ClientError::Conflict);
            }
        }

        let mut updated = existing;
        merge_data(&mut updated.data, &record.data);
        if strategy == PatchStrategy::MergeWithOptimisticLock {
            updated.finalizers = record.finalizers.clone();
        }
        state.next_resource_version += 1;
        updated.resource_version = Some(state.next_resource_version.to_string());

        state.objects.insert(id, updated.clone());
        state.patch_log.push(record.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_record(name: &str) -> RemoteRecord {
        RemoteRecord::new(RecordKind::ConfigMap, ObjectKey::new("ns", name))
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let client = FakeClient::new();
        let mut record = config_record("cfg");
        record.insert("main.tf", b"x".to_vec()).unwrap();

        let stored = client.create(&record).await.unwrap();
        assert!(stored.resource_version.is_some());

        let fetched = client.get(RecordKind::ConfigMap, &record.key).await.unwrap();
        assert_eq!(fetched, stored);

        assert!(matches!(
            client.create(&record).await,
            Err(ClientError::AlreadyExists)
        ));
    }

    #[tokio::test]
    async fn test_patch_missing_object_is_not_found() {
        let client = FakeClient::new();
        assert!(matches!(
            client
                .patch(&config_record("cfg"), PatchStrategy::Merge)
                .await,
            Err(ClientError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_optimistic_lock_detects_stale_resource_version() {
        let client = FakeClient::new();
        client.seed(config_record("cfg"));

        let mut stale = client
            .get(RecordKind::ConfigMap, &ObjectKey::new("ns", "cfg"))
            .await
            .unwrap();

        // concurrent writer bumps the version
        client
            .patch(&stale.clone(), PatchStrategy::Merge)
            .await
            .unwrap();

        stale.add_finalizer("a/b");
        assert!(matches!(
            client.patch(&stale, PatchStrategy::MergeWithOptimisticLock).await,
            Err(ClientError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_merge_overlays_data_and_keeps_finalizers() {
        let client = FakeClient::new();
        let mut seeded = config_record("state");
        seeded.insert("keep", b"old".to_vec()).unwrap();
        seeded.add_finalizer("a/b");
        client.seed(seeded);

        let mut patch = config_record("state");
        patch.insert("terraform.tfstate", b"new".to_vec()).unwrap();
        let updated = client.patch(&patch, PatchStrategy::Merge).await.unwrap();

        assert_eq!(updated.read("keep").unwrap().as_ref(), b"old");
        assert_eq!(updated.read("terraform.tfstate").unwrap().as_ref(), b"new");
        assert!(updated.has_finalizer("a/b"));
    }

    #[tokio::test]
    async fn test_injected_failures_consume_themselves() {
        let client = FakeClient::new();
        client.seed(config_record("state"));
        client.fail_patches(1);

        let patch = config_record("state");
        assert!(client.patch(&patch, PatchStrategy::Merge).await.is_err());
        assert!(client.patch(&patch, PatchStrategy::Merge).await.is_ok());
        assert_eq!(client.patch_calls(), 2);
    }
}
