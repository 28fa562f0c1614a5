//! Running the terraform child process.
//!
//! Terraform's output is mirrored to the supervisor's stderr sink while
//! being captured in memory; on failure the capture is written to the
//! termination message file so the platform can surface the reason. A
//! relay task forwards a SIGINT to the child when the root token is
//! cancelled, giving terraform the chance to finish gracefully.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::supervisor::{OutputSink, Supervisor};

/// Errors from a terraform invocation.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The termination message file could not be opened. Nothing is
    /// spawned in that case: a failure the platform cannot observe is
    /// worse than not starting.
    #[error("failed to open termination log {path}: {source}")]
    TerminationLog {
        /// The termination message path.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Spawning the terraform process failed.
    #[error("failed to start terraform: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the terraform process failed.
    #[error("failed waiting for terraform: {0}")]
    Wait(#[source] std::io::Error),

    /// Terraform exited with a non-zero status.
    #[error("terraform {command} failed with exit code {code}")]
    Failed {
        /// The command that failed.
        command: Command,
        /// The child's exit code; -1 when it was terminated by a signal.
        code: i32,
    },
}

impl ExecError {
    /// The child's exit code, if this error carries one.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl Supervisor {
    /// Run a single terraform command to completion.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecError`]; a non-zero child exit maps to
    /// [`ExecError::Failed`] carrying the exit code.
    pub(crate) async fn run_tool(
        &self,
        command: Command,
        positional: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        let termination_path = &self.paths.termination_message_path;
        let mut termination_log = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(termination_path)
            .await
            .map_err(|source| ExecError::TerminationLog {
                path: termination_path.clone(),
                source,
            })?;

        let args = command.cli_args(&self.paths, positional);
        info!(%command, args = %args.join(" "), "executing terraform");

        let mut child = tokio::process::Command::new(&self.terraform_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExecError::Spawn)?;

        let capture = Arc::new(Mutex::new(Vec::new()));
        let stdout_pump = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(out, Arc::clone(&self.stderr), Arc::clone(&capture))));
        let stderr_pump = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(err, Arc::clone(&self.stderr), Arc::clone(&capture))));

        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let relay_cancel = cancel.clone();
        let child_pid = child.id();
        let relay = tokio::spawn(async move {
            tokio::select! {
                _ = done_rx => {}
                () = relay_cancel.cancelled() => {
                    debug!("relaying interrupt to terraform process");
                    if let Some(pid) = child_pid {
                        #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
                        if let Err(error) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                            error!(%error, "failed to relay interrupt to terraform process");
                        }
                    }
                }
            }
        });

        let wait_result = child.wait().await;
        let _ = done_tx.send(());

        if let Some(pump) = stdout_pump {
            let _ = pump.await;
        }
        if let Some(pump) = stderr_pump {
            let _ = pump.await;
        }
        let _ = relay.await;

        let status = wait_result.map_err(ExecError::Wait)?;
        if status.success() {
            info!(%command, "terraform process finished successfully");
            return Ok(());
        }

        let code = status.code().unwrap_or(-1);
        error!(%command, code, "terraform process finished with error");

        let captured = capture.lock().unwrap().clone();
        if let Err(error) = write_termination_log(&mut termination_log, &captured).await {
            warn!(%error, "failed to write termination log");
        }

        Err(ExecError::Failed { command, code })
    }
}

async fn write_termination_log(
    file: &mut tokio::fs::File,
    contents: &[u8],
) -> std::io::Result<()> {
    file.write_all(contents).await?;
    file.flush().await
}

/// Copy child output into the supervisor's sink and the in-memory
/// post-mortem capture.
async fn pump(
    mut reader: impl AsyncRead + Unpin,
    sink: OutputSink,
    capture: Arc<Mutex<Vec<u8>>>,
) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                capture.lock().unwrap().extend_from_slice(&buf[..n]);
                let mut sink = sink.lock().await;
                let _ = sink.write_all(&buf[..n]).await;
                let _ = sink.flush().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::client::fake::FakeClient;
    use crate::supervisor::Config;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-terraform");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(base_dir: &Path, binary: PathBuf) -> Arc<Supervisor> {
        let config = Config {
            configuration_config_map_name: "cfg".to_owned(),
            state_config_map_name: "state".to_owned(),
            variables_secret_name: "vars".to_owned(),
            namespace: "ns".to_owned(),
            base_dir: Some(base_dir.to_path_buf()),
        };
        let supervisor = Supervisor::new(config, Arc::new(FakeClient::new()))
            .with_terraform_binary(binary)
            .with_output(Box::new(tokio::io::sink()), Box::new(tokio::io::sink()));
        let supervisor = Arc::new(supervisor);
        supervisor.paths().ensure_dirs().unwrap();
        supervisor
    }

    #[tokio::test]
    async fn test_successful_run() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = write_script(tmp.path(), "exit 0");
        let supervisor = supervisor(tmp.path(), binary);

        supervisor
            .run_tool(Command::Init, &[], &CancellationToken::new())
            .await
            .unwrap();

        // termination log was truncated and left empty
        let log = std::fs::read(&supervisor.paths().termination_message_path).unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_failure_captures_output_and_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = write_script(tmp.path(), "echo provisioning exploded; exit 7");
        let supervisor = supervisor(tmp.path(), binary);

        let err = supervisor
            .run_tool(Command::Apply, &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ExecError::Failed { command: Command::Apply, code: 7 }
        ));
        assert_eq!(err.exit_code(), Some(7));

        let log =
            std::fs::read_to_string(&supervisor.paths().termination_message_path).unwrap();
        assert!(log.contains("provisioning exploded"));
    }

    #[tokio::test]
    async fn test_unwritable_termination_log_aborts_before_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let binary = write_script(tmp.path(), "exit 0");
        let supervisor = supervisor(tmp.path(), binary);

        // remove the termination dir so the open fails
        std::fs::remove_dir_all(&supervisor.paths().termination_dir).unwrap();

        let err = supervisor
            .run_tool(Command::Init, &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::TerminationLog { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_relays_interrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("got-interrupt");
        let binary = write_script(
            tmp.path(),
            &format!(
                "trap 'touch {}; exit 130' INT\ni=0\nwhile [ $i -lt 100 ]; do sleep 0.1; i=$((i+1)); done",
                marker.display()
            ),
        );
        let supervisor = supervisor(tmp.path(), binary);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let err = supervisor
            .run_tool(Command::Apply, &[], &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), Some(130));
        assert!(marker.exists(), "child should have seen the interrupt");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = supervisor(tmp.path(), tmp.path().join("does-not-exist"));

        let err = supervisor
            .run_tool(Command::Init, &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Spawn(_)));
        assert_eq!(err.exit_code(), None);
    }
}
