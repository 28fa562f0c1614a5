//! Access to the Kubernetes objects carrying terraform config and state.
//!
//! The engine only needs four verbs on two record kinds, captured by the
//! [`RecordClient`] trait. [`http::HttpClient`] talks to a real API
//! server; [`fake::FakeClient`] backs the tests.

pub mod fake;
pub mod http;

use async_trait::async_trait;

use crate::store::{ObjectKey, RecordKind, RemoteRecord};

/// Patch strategies supported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// Server-side merge of the supplied data; last writer wins.
    Merge,
    /// Merge guarded by the record's resource version; the server rejects
    /// the patch with a conflict if the object changed in between.
    MergeWithOptimisticLock,
}

/// Errors surfaced by a [`RecordClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The object does not exist.
    #[error("object not found")]
    NotFound,

    /// The object already exists.
    #[error("object already exists")]
    AlreadyExists,

    /// An optimistic-concurrency patch lost the race.
    #[error("conflicting resource version")]
    Conflict,

    /// The client could not be constructed or is misconfigured.
    #[error("client configuration: {0}")]
    Config(String),

    /// Any other API failure.
    #[error("api request failed: {0}")]
    Api(String),
}

impl ClientError {
    /// Returns `true` for [`ClientError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Returns `true` for [`ClientError::Conflict`].
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

/// Typed access to namespaced records.
#[async_trait]
pub trait RecordClient: Send + Sync {
    /// Fetch the record identified by `kind` and `key`.
    async fn get(&self, kind: RecordKind, key: &ObjectKey) -> Result<RemoteRecord, ClientError>;

    /// Create `record`; fails with [`ClientError::AlreadyExists`] if an
    /// object of the same kind and key exists.
    async fn create(&self, record: &RemoteRecord) -> Result<RemoteRecord, ClientError>;

    /// Patch the stored object with the contents of `record` using the
    /// given strategy. Returns the updated object.
    async fn patch(
        &self,
        record: &RemoteRecord,
        strategy: PatchStrategy,
    ) -> Result<RemoteRecord, ClientError>;
}
