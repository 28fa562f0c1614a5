//! The supervisor session: fetch, watch, run terraform, mirror state,
//! finalize.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{ClientError, RecordClient};
use crate::command::{Command, LEGACY_PROVIDER_REPLACEMENTS, LEGACY_VERSION_PREFIX};
use crate::exec::ExecError;
use crate::fetch::{self, FetchError};
use crate::finalizer::FinalizerError;
use crate::paths::{PathSet, STATE_KEY};
use crate::queue::UpdateQueue;
use crate::state::UpdateKind;
use crate::store::{ObjectKey, RecordKind};

/// Immutable per-invocation configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the ConfigMap that holds the `main.tf` and `variables.tf`
    /// files.
    pub configuration_config_map_name: String,
    /// Name of the ConfigMap that the `terraform.tfstate` file is stored
    /// in.
    pub state_config_map_name: String,
    /// Name of the Secret that holds the `terraform.tfvars` file.
    pub variables_secret_name: String,
    /// Namespace holding the configuration resources.
    pub namespace: String,
    /// Optional root for all on-disk paths.
    pub base_dir: Option<PathBuf>,
}

/// A writable sink shared with the output pump tasks.
pub(crate) type OutputSink = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Errors terminating a supervisor session.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The requested command may not be run by users.
    #[error("terraform command \"{0}\" is not supported")]
    UnsupportedCommand(Command),

    /// Creating the working directories failed.
    #[error("failed to create terraform directories: {0}")]
    EnsureDirs(#[source] std::io::Error),

    /// Installing the OS signal handler failed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    /// Fetching config or state failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Starting the state file watcher failed.
    #[error("failed to start state file watcher: {0}")]
    Watcher(#[from] notify::Error),

    /// A terraform invocation failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Updating finalizers failed.
    #[error(transparent)]
    Finalizer(#[from] FinalizerError),

    /// A direct API call failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The final state update did not complete within its budget.
    #[error("timed out waiting for final state update to complete")]
    FinalUpdateTimeout,

    /// A shutdown signal arrived before terraform was started.
    #[error("interrupted before terraform execution finished")]
    Interrupted,
}

impl SupervisorError {
    /// The process exit code this error maps to.
    ///
    /// A terraform failure propagates the tool's own exit code; every
    /// other failure exits 1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exec(err) => match err.exit_code() {
                Some(code) if code > 0 => code,
                _ => 1,
            },
            _ => 1,
        }
    }
}

/// Executes terraform commands and mirrors config and state between the
/// cluster and the local filesystem.
pub struct Supervisor {
    pub(crate) config: Config,
    pub(crate) paths: PathSet,
    pub(crate) client: Arc<dyn RecordClient>,
    pub(crate) queue: Arc<UpdateQueue<UpdateKind>>,
    pub(crate) final_update_tx: mpsc::Sender<()>,
    pub(crate) final_update_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    pub(crate) terraform_binary: PathBuf,
    pub(crate) final_update_timeout: std::time::Duration,
    pub(crate) stdout: OutputSink,
    pub(crate) stderr: OutputSink,
}

impl Supervisor {
    /// Create a supervisor for the given configuration.
    #[must_use]
    pub fn new(config: Config, client: Arc<dyn RecordClient>) -> Self {
        let paths = PathSet::new(config.base_dir.as_deref());
        let (final_update_tx, final_update_rx) = mpsc::channel(1);

        Self {
            config,
            paths,
            client,
            queue: Arc::new(UpdateQueue::default()),
            final_update_tx,
            final_update_rx: tokio::sync::Mutex::new(final_update_rx),
            terraform_binary: PathBuf::from("terraform"),
            final_update_timeout: crate::state::FINAL_STATE_UPDATE_TIMEOUT,
            stdout: Arc::new(tokio::sync::Mutex::new(Box::new(tokio::io::stdout()))),
            stderr: Arc::new(tokio::sync::Mutex::new(Box::new(tokio::io::stderr()))),
        }
    }

    /// Override the overall budget for the final state update.
    #[must_use]
    pub fn with_final_update_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.final_update_timeout = timeout;
        self
    }

    /// Override the terraform binary (tests substitute a script).
    #[must_use]
    pub fn with_terraform_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.terraform_binary = binary.into();
        self
    }

    /// Redirect the supervisor's stdout and stderr sinks.
    ///
    /// Terraform output is mirrored to the stderr sink; the stdout sink
    /// only ever receives the state-file dump of last resort.
    #[must_use]
    pub fn with_output(
        mut self,
        stdout: Box<dyn AsyncWrite + Send + Unpin>,
        stderr: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        self.stdout = Arc::new(tokio::sync::Mutex::new(stdout));
        self.stderr = Arc::new(tokio::sync::Mutex::new(stderr));
        self
    }

    /// The resolved path set.
    #[must_use]
    pub fn paths(&self) -> &PathSet {
        &self.paths
    }

    /// Run `command`, reacting to SIGINT and SIGTERM.
    ///
    /// The first signal received cancels the root token, which interrupts
    /// a running terraform process; the final state update is detached
    /// from the token and still runs.
    ///
    /// # Errors
    ///
    /// See [`SupervisorError`]; a terraform failure carries the tool's
    /// exit code.
    pub async fn run(self: Arc<Self>, command: Command) -> Result<(), SupervisorError> {
        let cancel = CancellationToken::new();

        let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            info!("interrupt received");
            signal_cancel.cancel();
        });

        self.run_with_cancellation(command, cancel).await
    }

    /// Run `command` under an externally owned cancellation token.
    ///
    /// # Errors
    ///
    /// See [`SupervisorError`].
    pub async fn run_with_cancellation(
        self: Arc<Self>,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        if !command.is_user_invokable() {
            return Err(SupervisorError::UnsupportedCommand(command));
        }

        debug!(config = ?self.config, "executing terraform supervisor");

        if command == Command::Destroy && self.state_is_empty().await? {
            info!("state is empty, skipping terraform destroy");
            self.remove_finalizers().await?;
            return Ok(());
        }

        self.paths
            .ensure_dirs()
            .map_err(SupervisorError::EnsureDirs)?;

        tokio::select! {
            () = cancel.cancelled() => return Err(SupervisorError::Interrupted),
            result = fetch::fetch_config_and_state(self.client.as_ref(), &self.config, &self.paths) => result?,
        }

        let worker = Arc::clone(&self).start_state_update_worker();

        let tool_result = Arc::clone(&self).run_tool_phase(command, &cancel).await;

        // always store the state once more before exiting; the worker is
        // still alive here and the trigger runs detached from `cancel`
        let final_result = self.trigger_and_wait_for_final_state_update().await;

        worker.shutdown().await;

        // a tool failure wins over a final-update timeout: the process
        // must exit with terraform's exit code
        let result = match tool_result {
            Err(err) => Err(err),
            Ok(()) => final_result,
        };

        if result.is_ok() && command == Command::Destroy {
            self.remove_finalizers().await?;
        }

        result
    }

    /// Run the watcher-scoped part of the session: the watcher is stopped
    /// before this returns so no continuous update races the final one.
    async fn run_tool_phase(
        self: Arc<Self>,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let watcher = Arc::clone(&self).start_file_watcher()?;
        let result = self.tool_pipeline(command, cancel).await;
        watcher.shutdown().await;
        result
    }

    async fn tool_pipeline(
        &self,
        command: Command,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        self.add_finalizers().await?;

        self.run_tool(Command::Init, &[], cancel).await?;
        self.replace_legacy_providers(cancel).await?;
        self.run_tool(command, &[], cancel).await?;

        if command == Command::Validate {
            self.run_tool(Command::Plan, &[], cancel).await?;
        }

        Ok(())
    }

    /// Returns `true` if the remote state record is missing or holds no
    /// usable state.
    async fn state_is_empty(&self) -> Result<bool, SupervisorError> {
        let key = ObjectKey::new(&self.config.namespace, &self.config.state_config_map_name);

        match self.client.get(RecordKind::ConfigMap, &key).await {
            Err(ClientError::NotFound) => Ok(true),
            Err(err) => Err(err.into()),
            Ok(record) => match record.read(STATE_KEY) {
                Err(_) => Ok(true),
                Ok(value) => Ok(std::str::from_utf8(&value)
                    .map(|s| s.trim().is_empty())
                    .unwrap_or(false)),
            },
        }
    }

    /// Rewrite provider references when the fetched state was written by
    /// a legacy terraform version.
    async fn replace_legacy_providers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let Some(version) = self.state_terraform_version().await else {
            return Ok(());
        };
        if !version.starts_with(LEGACY_VERSION_PREFIX) {
            return Ok(());
        }

        info!(%version, "legacy terraform version found in state, replacing provider references");
        for (name, source) in LEGACY_PROVIDER_REPLACEMENTS {
            let positional = [
                format!("registry.terraform.io/-/{name}"),
                format!("registry.terraform.io/{source}"),
            ];
            self.run_tool(Command::StateReplaceProvider, &positional, cancel)
                .await?;
        }

        Ok(())
    }

    /// The `terraform_version` recorded in the local state file, if any.
    ///
    /// A missing file, unparseable state or absent field all read as no
    /// version.
    async fn state_terraform_version(&self) -> Option<String> {
        let contents = tokio::fs::read(&self.paths.state_path).await.ok()?;
        let state: serde_json::Value = serde_json::from_slice(&contents).ok()?;
        Some(state.get("terraform_version")?.as_str()?.to_owned())
    }
}
