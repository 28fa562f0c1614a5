//! Shared helpers for the supervisor end-to-end tests.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

use tfsidecar_core::client::fake::FakeClient;
use tfsidecar_core::paths::{CONFIG_MAIN_KEY, CONFIG_VARS_KEY, STATE_KEY, VARS_KEY};
use tfsidecar_core::store::{ObjectKey, RecordKind, RemoteRecord};
use tfsidecar_core::{Config, Supervisor};

pub const NAMESPACE: &str = "test-ns";
pub const CONFIG_NAME: &str = "example.infra.tf-config";
pub const STATE_NAME: &str = "example.infra.tf-state";
pub const VARS_NAME: &str = "example.infra.tf-vars";

/// `AsyncWrite` into a shared buffer, for capturing supervisor output.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    #[allow(dead_code)]
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub fn test_config(base_dir: &Path) -> Config {
    Config {
        configuration_config_map_name: CONFIG_NAME.to_owned(),
        state_config_map_name: STATE_NAME.to_owned(),
        variables_secret_name: VARS_NAME.to_owned(),
        namespace: NAMESPACE.to_owned(),
        base_dir: Some(base_dir.to_path_buf()),
    }
}

/// Seed the configuration ConfigMap and variables Secret the supervisor
/// requires.
pub fn seed_config_and_vars(client: &FakeClient) {
    let mut config = RemoteRecord::new(
        RecordKind::ConfigMap,
        ObjectKey::new(NAMESPACE, CONFIG_NAME),
    );
    config
        .insert(CONFIG_MAIN_KEY, b"resource \"null_resource\" \"foo\" {}".to_vec())
        .unwrap();
    config
        .insert(CONFIG_VARS_KEY, b"variable \"SOME_VAR\" {}".to_vec())
        .unwrap();
    client.seed(config);

    let mut vars = RemoteRecord::new(RecordKind::Secret, ObjectKey::new(NAMESPACE, VARS_NAME));
    vars.insert(VARS_KEY, b"SOME_VAR = \"yes\"".to_vec()).unwrap();
    client.seed(vars);
}

/// Seed a state record; `state` of `None` seeds an empty data map.
pub fn seed_state(client: &FakeClient, state: Option<&[u8]>, finalizer: Option<&str>) {
    let mut record = RemoteRecord::new(
        RecordKind::ConfigMap,
        ObjectKey::new(NAMESPACE, STATE_NAME),
    );
    if let Some(state) = state {
        record.insert(STATE_KEY, state.to_vec()).unwrap();
    }
    if let Some(finalizer) = finalizer {
        record.add_finalizer(finalizer);
    }
    client.seed(record);
}

pub fn stored_record(client: &FakeClient, kind: RecordKind, name: &str) -> Option<RemoteRecord> {
    client.record(kind, &ObjectKey::new(NAMESPACE, name))
}

pub fn stored_state(client: &FakeClient) -> Option<Vec<u8>> {
    stored_record(client, RecordKind::ConfigMap, STATE_NAME)
        .and_then(|record| record.read(STATE_KEY).ok().map(|value| value.into_owned()))
}

/// Write a fake terraform script into `dir`.
///
/// The script appends its full argument list to `invocations.log` next to
/// itself and then dispatches on the subcommand via the given shell
/// `cases` (a `case` body over `$1` after the `-chdir` flag is dropped).
pub fn fake_terraform(dir: &Path, cases: &str) -> PathBuf {
    let log = invocation_log(dir);
    let path = dir.join("fake-terraform");
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> \"{log}\"\nshift\ncase \"$1\" in\n{cases}\nesac\nexit 0\n",
        log = log.display(),
    );
    std::fs::write(&path, script).unwrap();

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn invocation_log(dir: &Path) -> PathBuf {
    dir.join("invocations.log")
}

/// The subcommands the fake terraform saw, in order.
pub fn invoked_commands(dir: &Path) -> Vec<String> {
    let Ok(log) = std::fs::read_to_string(invocation_log(dir)) else {
        return Vec::new();
    };
    log.lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(ToOwned::to_owned)
        .collect()
}

pub fn make_supervisor(
    client: Arc<FakeClient>,
    base_dir: &Path,
    terraform: &Path,
) -> (Arc<Supervisor>, SharedBuffer) {
    let stdout = SharedBuffer::default();
    let supervisor = Supervisor::new(test_config(base_dir), client)
        .with_terraform_binary(terraform)
        .with_output(Box::new(stdout.clone()), Box::new(tokio::io::sink()));
    (Arc::new(supervisor), stdout)
}
