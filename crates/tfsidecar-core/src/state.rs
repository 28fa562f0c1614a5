//! Mirroring the terraform state file into the state ConfigMap.
//!
//! All writes of the state record funnel through a single worker task fed
//! by the rate-limited queue, so no two writes are ever in flight at the
//! same time. Continuous updates (triggered by the file watcher) are
//! best-effort: a failed one is simply superseded by the next file
//! change. The final update issued at shutdown must succeed and is
//! retried with backoff until a long timeout.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, PatchStrategy, RecordClient};
use crate::paths::STATE_KEY;
use crate::queue::UpdateQueue;
use crate::store::{ObjectKey, RecordKind, RemoteRecord, StoreError};
use crate::supervisor::{Supervisor, SupervisorError};

/// Deadline for a single state update call.
pub const STATE_UPDATE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Overall budget for the final state update, including backoff retries.
pub const FINAL_STATE_UPDATE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Interval between queue-length polls while draining at shutdown.
const QUEUE_DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The two work items the state-update queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// Triggered by a state file change; not retried on failure.
    Continuous,
    /// Triggered at shutdown; retried with backoff until it succeeds.
    Final,
}

/// Errors from a single store attempt.
#[derive(Debug, thiserror::Error)]
pub enum StoreStateError {
    /// Reading a local file failed.
    #[error("failed reading {path}: {source}")]
    File {
        /// Path of the local file.
        path: std::path::PathBuf,
        /// The I/O error.
        source: std::io::Error,
    },

    /// The file contents could not be stored in the record.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The API write failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The update did not finish within its deadline.
    #[error("state update timed out after {0:?}")]
    DeadlineExceeded(Duration),
}

/// Upload the files named by `data_keys` from `dir` into the record
/// identified by `kind` and `key`.
///
/// The record is patched first and created only when the server reports
/// it missing; in steady state the record exists, so this halves the
/// request count.
///
/// # Errors
///
/// Returns a [`StoreStateError`] describing the failed step.
pub(crate) async fn store_record(
    client: &dyn RecordClient,
    kind: RecordKind,
    key: ObjectKey,
    dir: &Path,
    data_keys: &[&str],
) -> Result<(), StoreStateError> {
    let mut record = RemoteRecord::new(kind, key);

    for data_key in data_keys {
        let path = dir.join(data_key);
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|source| StoreStateError::File { path: path.clone(), source })?;
        debug!(%kind, key = %record.key, data_key, file = %path.display(), "copying file content into object");
        record.insert(data_key, contents)?;
    }

    debug!(%kind, key = %record.key, "storing object");
    let update = async {
        match client.patch(&record, PatchStrategy::Merge).await {
            Err(ClientError::NotFound) => client.create(&record).await.map(|_| ()),
            other => other.map(|_| ()),
        }
    };
    timeout(STATE_UPDATE_TIMEOUT, update)
        .await
        .map_err(|_| StoreStateError::DeadlineExceeded(STATE_UPDATE_TIMEOUT))??;

    debug!(%kind, key = %record.key, "successfully updated object");
    Ok(())
}

/// Handle to the running state-update worker.
pub(crate) struct StateUpdateWorker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    queue: Arc<UpdateQueue<UpdateKind>>,
}

impl StateUpdateWorker {
    /// Shut down the queue, wait for it to drain and stop the worker.
    ///
    /// At most one in-progress write continues past the queue drain; its
    /// own deadline caps how long this blocks.
    pub(crate) async fn shutdown(self) {
        debug!("shutting down state-update queue");
        self.queue.shut_down();

        loop {
            let remaining = self.queue.len();
            if remaining == 0 {
                break;
            }
            info!(remaining, "waiting for state-update queue to drain");
            tokio::time::sleep(QUEUE_DRAIN_POLL_INTERVAL).await;
        }

        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Handle to the running state file watcher.
pub(crate) struct StateFileWatcher {
    watcher: notify::RecommendedWatcher,
    task: JoinHandle<()>,
}

impl StateFileWatcher {
    /// Close the OS watch and join the event loop.
    pub(crate) async fn shutdown(self) {
        drop(self.watcher);
        let _ = self.task.await;
    }
}

impl Supervisor {
    /// Store the state file in the state ConfigMap.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreStateError`] describing the failed step.
    pub async fn store_state(&self) -> Result<(), StoreStateError> {
        store_record(
            self.client.as_ref(),
            RecordKind::ConfigMap,
            ObjectKey::new(&self.config.namespace, &self.config.state_config_map_name),
            &self.paths.state_dir,
            &[STATE_KEY],
        )
        .await
    }

    /// Start the single worker task consuming the state-update queue.
    pub(crate) fn start_state_update_worker(self: Arc<Self>) -> StateUpdateWorker {
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let queue = Arc::clone(&self.queue);

        let task = tokio::spawn(async move {
            loop {
                let key = tokio::select! {
                    biased;
                    () = worker_cancel.cancelled() => break,
                    key = self.queue.get() => match key {
                        Some(key) => key,
                        None => {
                            debug!("queue is empty and shutting down, stopping work");
                            break;
                        }
                    },
                };

                self.process_state_update(key).await;
                self.queue.done(&key);
            }
        });

        StateUpdateWorker { cancel, task, queue }
    }

    async fn process_state_update(&self, key: UpdateKind) {
        let with_retries = key == UpdateKind::Final;
        debug!(with_retries, "processing state update");

        match self.store_state().await {
            Ok(()) => {
                self.queue.forget(&key);
                if with_retries {
                    // never block the worker if nobody is receiving
                    let _ = self.final_update_tx.try_send(());
                }
            }
            Err(error) => {
                error!(%error, "error storing state");
                if with_retries {
                    debug!("adding item back to queue with backoff after error");
                    self.queue.add_rate_limited(key);
                } else {
                    self.queue.forget(&key);
                }
            }
        }
    }

    /// Watch the state file and enqueue a continuous update for every
    /// write the kernel reports.
    ///
    /// Only write events count: deletes, renames and creates are ignored
    /// so an accidental `rm` of the state file does not clear the remote
    /// record.
    ///
    /// # Errors
    ///
    /// Returns the watcher error if the OS watch cannot be registered.
    pub(crate) fn start_file_watcher(
        self: Arc<Self>,
    ) -> Result<StateFileWatcher, notify::Error> {
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| {
                let _ = events_tx.send(event);
            },
        )?;

        info!(file = %self.paths.state_path.display(), "starting file watcher for state file");
        watcher.watch(&self.paths.state_path, RecursiveMode::NonRecursive)?;

        let task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    Ok(event) => {
                        let is_write = matches!(
                            event.kind,
                            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
                        );
                        if is_write && event.paths.iter().any(|p| p == &self.paths.state_path) {
                            debug!("state file changed, triggering state update");
                            self.queue.add(UpdateKind::Continuous);
                        }
                    }
                    Err(error) => warn!(%error, "error while watching state file"),
                }
            }
            debug!("stopping file watcher");
        });

        Ok(StateFileWatcher { watcher, task })
    }

    /// Enqueue the final state update and wait for the worker to confirm
    /// it, or time out after [`FINAL_STATE_UPDATE_TIMEOUT`].
    ///
    /// On timeout the state file contents are copied to the stdout sink
    /// as a last resort, so the container log preserves them.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::FinalUpdateTimeout`] when the update
    /// did not succeed in time.
    pub async fn trigger_and_wait_for_final_state_update(&self) -> Result<(), SupervisorError> {
        info!(timeout = ?self.final_update_timeout, "triggering final state update before exiting");
        self.queue.add(UpdateKind::Final);

        let mut receiver = self.final_update_rx.lock().await;
        match timeout(self.final_update_timeout, receiver.recv()).await {
            Ok(_) => {
                info!("successfully stored terraform state");
                Ok(())
            }
            Err(_) => {
                error!("timed out waiting for final state update to complete");
                info!("logging contents of state file to stdout as last resort");
                if let Err(error) = self.copy_state_to_stdout().await {
                    error!(%error, "failed copying state contents to stdout, manual recovery from the record may be required");
                }
                Err(SupervisorError::FinalUpdateTimeout)
            }
        }
    }

    async fn copy_state_to_stdout(&self) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::open(&self.paths.state_path).await?;
        let mut stdout = self.stdout.lock().await;
        tokio::io::copy(&mut file, &mut *stdout).await?;
        stdout.flush().await
    }
}
