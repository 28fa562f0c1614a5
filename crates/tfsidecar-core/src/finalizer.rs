//! Finalizer handling on the three tracked objects.
//!
//! While a supervisor owns a set of records, each of them carries the
//! supervisor's finalizer so the platform defers deletion. The finalizer
//! is added before terraform first runs and removed only once a destroy
//! completed and its (empty) state is durably stored; on every other exit
//! path it stays in place for the next supervisor run to deal with.

use std::fmt;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::client::{ClientError, PatchStrategy};
use crate::store::{ObjectKey, RecordKind, RemoteRecord};
use crate::supervisor::Supervisor;

/// The finalizer string owned by this supervisor.
pub const FINALIZER: &str = "tfsidecar.dev/protection";

/// Conflict retries per object.
const CONFLICT_RETRIES: u32 = 2;

/// Budget for a whole add or remove pass over the three objects.
const FINALIZER_UPDATE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Whether finalizers are being added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerOp {
    /// Attach the finalizer.
    Add,
    /// Detach the finalizer.
    Remove,
}

impl fmt::Display for FinalizerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// Failure to update the finalizer on one object.
#[derive(Debug, thiserror::Error)]
#[error("{kind} {key}: {source}")]
pub struct FinalizerItemError {
    kind: RecordKind,
    key: ObjectKey,
    #[source]
    source: ClientError,
}

/// Aggregated finalizer update failure.
#[derive(Debug)]
pub enum FinalizerError {
    /// The whole pass ran out of time.
    DeadlineExceeded {
        /// Which operation timed out.
        op: FinalizerOp,
    },
    /// One or more objects could not be updated.
    Aggregate {
        /// Which operation failed.
        op: FinalizerOp,
        /// The per-object failures.
        errors: Vec<FinalizerItemError>,
    },
}

impl fmt::Display for FinalizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineExceeded { op } => {
                write!(f, "timed out trying to {op} finalizers")
            }
            Self::Aggregate { op, errors } => {
                write!(f, "failed to {op} finalizers: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for FinalizerError {}

impl Supervisor {
    /// Attach the supervisor's finalizer to the three tracked objects.
    ///
    /// # Errors
    ///
    /// Returns a [`FinalizerError`] aggregating per-object failures.
    pub async fn add_finalizers(&self) -> Result<(), FinalizerError> {
        self.update_finalizers(FinalizerOp::Add).await
    }

    /// Detach the supervisor's finalizer from the three tracked objects.
    ///
    /// # Errors
    ///
    /// Returns a [`FinalizerError`] aggregating per-object failures.
    pub async fn remove_finalizers(&self) -> Result<(), FinalizerError> {
        self.update_finalizers(FinalizerOp::Remove).await
    }

    async fn update_finalizers(&self, op: FinalizerOp) -> Result<(), FinalizerError> {
        let namespace = self.config.namespace.as_str();
        let targets = [
            (RecordKind::ConfigMap, &self.config.configuration_config_map_name),
            (RecordKind::ConfigMap, &self.config.state_config_map_name),
            (RecordKind::Secret, &self.config.variables_secret_name),
        ];

        // detached deadline: finalizer updates run during teardown where
        // the root token may already be cancelled
        let pass = async {
            let mut errors = Vec::new();
            for (kind, name) in targets {
                let key = ObjectKey::new(namespace, name.as_str());
                debug!(%kind, %key, %op, "updating finalizer");
                if let Err(source) = self.update_object_finalizer(kind, &key, op).await {
                    errors.push(FinalizerItemError { kind, key, source });
                }
            }
            errors
        };

        match timeout(FINALIZER_UPDATE_TIMEOUT, pass).await {
            Err(_) => Err(FinalizerError::DeadlineExceeded { op }),
            Ok(errors) if errors.is_empty() => Ok(()),
            Ok(errors) => Err(FinalizerError::Aggregate { op, errors }),
        }
    }

    async fn update_object_finalizer(
        &self,
        kind: RecordKind,
        key: &ObjectKey,
        op: FinalizerOp,
    ) -> Result<(), ClientError> {
        for attempt in 0..=CONFLICT_RETRIES {
            match self.client.get(kind, key).await {
                Ok(mut record) => {
                    let changed = match op {
                        FinalizerOp::Add => record.add_finalizer(FINALIZER),
                        FinalizerOp::Remove => record.remove_finalizer(FINALIZER),
                    };
                    if !changed {
                        return Ok(());
                    }

                    match self
                        .client
                        .patch(&record, PatchStrategy::MergeWithOptimisticLock)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(ClientError::Conflict) => {
                            debug!(%kind, %key, attempt, "conflict updating finalizer, retrying");
                        }
                        Err(err) => return Err(err),
                    }
                }
                // an object that is gone before a mutating command starts
                // is created with the finalizer already attached
                Err(ClientError::NotFound) if op == FinalizerOp::Add => {
                    let mut record = RemoteRecord::new(kind, key.clone());
                    record.add_finalizer(FINALIZER);
                    match self.client.create(&record).await {
                        Ok(_) => return Ok(()),
                        Err(ClientError::AlreadyExists) => {
                            debug!(%kind, %key, attempt, "object appeared concurrently, retrying");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(ClientError::NotFound) => return Ok(()),
                Err(err) => return Err(err),
            }
        }

        Err(ClientError::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::fake::FakeClient;
    use crate::supervisor::Config;

    const NAMES: [(&str, RecordKind); 3] = [
        ("cfg", RecordKind::ConfigMap),
        ("state", RecordKind::ConfigMap),
        ("vars", RecordKind::Secret),
    ];

    fn supervisor(client: Arc<FakeClient>) -> Supervisor {
        Supervisor::new(
            Config {
                configuration_config_map_name: "cfg".to_owned(),
                state_config_map_name: "state".to_owned(),
                variables_secret_name: "vars".to_owned(),
                namespace: "ns".to_owned(),
                base_dir: None,
            },
            client,
        )
    }

    fn seed_all(client: &FakeClient, finalizer: bool) {
        for (name, kind) in NAMES {
            let mut record = RemoteRecord::new(kind, ObjectKey::new("ns", name));
            if finalizer {
                record.add_finalizer(FINALIZER);
            }
            client.seed(record);
        }
    }

    #[tokio::test]
    async fn test_add_attaches_finalizer_to_all_objects() {
        let client = Arc::new(FakeClient::new());
        seed_all(&client, false);
        let supervisor = supervisor(Arc::clone(&client));

        supervisor.add_finalizers().await.unwrap();

        for (name, kind) in NAMES {
            let record = client.record(kind, &ObjectKey::new("ns", name)).unwrap();
            assert!(record.has_finalizer(FINALIZER), "{name} misses the finalizer");
        }
    }

    #[tokio::test]
    async fn test_add_creates_missing_object_with_finalizer() {
        let client = Arc::new(FakeClient::new());
        let supervisor = supervisor(Arc::clone(&client));

        supervisor.add_finalizers().await.unwrap();

        for (name, kind) in NAMES {
            let record = client.record(kind, &ObjectKey::new("ns", name)).unwrap();
            assert!(record.has_finalizer(FINALIZER));
            assert!(record.data_is_empty());
        }
        assert_eq!(client.create_calls(), 3);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let client = Arc::new(FakeClient::new());
        seed_all(&client, true);
        let supervisor = supervisor(Arc::clone(&client));

        supervisor.add_finalizers().await.unwrap();

        // objects already carried the finalizer, nothing was written
        assert_eq!(client.patch_calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_detaches_finalizer_from_all_objects() {
        let client = Arc::new(FakeClient::new());
        seed_all(&client, true);
        let supervisor = supervisor(Arc::clone(&client));

        supervisor.remove_finalizers().await.unwrap();

        for (name, kind) in NAMES {
            let record = client.record(kind, &ObjectKey::new("ns", name)).unwrap();
            assert!(!record.has_finalizer(FINALIZER));
        }
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_objects() {
        let client = Arc::new(FakeClient::new());
        let supervisor = supervisor(Arc::clone(&client));

        supervisor.remove_finalizers().await.unwrap();
        assert_eq!(client.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let client = Arc::new(FakeClient::new());
        seed_all(&client, false);
        client.conflict_patches(2);
        let supervisor = supervisor(Arc::clone(&client));

        supervisor.add_finalizers().await.unwrap();

        let record = client
            .record(RecordKind::ConfigMap, &ObjectKey::new("ns", "cfg"))
            .unwrap();
        assert!(record.has_finalizer(FINALIZER));
    }

    #[tokio::test]
    async fn test_errors_are_aggregated() {
        let client = Arc::new(FakeClient::new());
        seed_all(&client, false);
        // every patch fails; all three objects report an error
        client.fail_patches(u32::MAX);
        let supervisor = supervisor(Arc::clone(&client));

        let err = supervisor.add_finalizers().await.unwrap_err();
        let message = err.to_string();

        assert!(message.starts_with("failed to add finalizers: "));
        for (name, _) in NAMES {
            assert!(message.contains(name), "{message} should mention {name}");
        }
    }
}
