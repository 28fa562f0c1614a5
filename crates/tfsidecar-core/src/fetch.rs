//! Fetching terraform config and state from the cluster into local files.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::client::{ClientError, RecordClient};
use crate::paths::{CONFIG_MAIN_KEY, CONFIG_VARS_KEY, PathSet, STATE_KEY, VARS_KEY};
use crate::store::{ObjectKey, RecordKind, StoreError};
use crate::supervisor::Config;

/// Failure to materialize one remote record on disk.
#[derive(Debug, thiserror::Error)]
#[error("{kind} {key}: {source}")]
pub struct FetchItemError {
    kind: RecordKind,
    key: ObjectKey,
    #[source]
    source: FetchCause,
}

/// The underlying cause of a fetch failure.
#[derive(Debug, thiserror::Error)]
pub enum FetchCause {
    /// The API read failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A required data key was missing.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Writing the local file failed.
    #[error("failed writing {path}: {source}")]
    File {
        /// Path of the local file.
        path: PathBuf,
        /// The I/O error.
        source: std::io::Error,
    },
}

/// Aggregated failures across the parallel record reads.
#[derive(Debug)]
pub struct FetchError {
    errors: Vec<FetchItemError>,
}

impl FetchError {
    /// The individual failures.
    #[must_use]
    pub fn errors(&self) -> &[FetchItemError] {
        &self.errors
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to fetch terraform config: ")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FetchError {}

/// Fetch the configured records and write their contents into the local
/// files named by `paths`.
///
/// The three reads run concurrently and are joined before returning. The
/// state record is optional: its absence (or the absence of its state
/// key) truncates the local state file, which makes the remote record the
/// single source of truth across container restarts.
///
/// # Errors
///
/// Returns a [`FetchError`] aggregating every failed read.
pub async fn fetch_config_and_state(
    client: &dyn RecordClient,
    config: &Config,
    paths: &PathSet,
) -> Result<(), FetchError> {
    let namespace = config.namespace.as_str();

    let (config_result, state_result, vars_result) = tokio::join!(
        fetch_record(
            client,
            RecordKind::ConfigMap,
            ObjectKey::new(namespace, &config.configuration_config_map_name),
            false,
            &paths.config_dir,
            &[CONFIG_MAIN_KEY, CONFIG_VARS_KEY],
        ),
        fetch_record(
            client,
            RecordKind::ConfigMap,
            ObjectKey::new(namespace, &config.state_config_map_name),
            true,
            &paths.state_dir,
            &[STATE_KEY],
        ),
        fetch_record(
            client,
            RecordKind::Secret,
            ObjectKey::new(namespace, &config.variables_secret_name),
            false,
            &paths.vars_dir,
            &[VARS_KEY],
        ),
    );

    let errors: Vec<_> = [config_result, state_result, vars_result]
        .into_iter()
        .filter_map(Result::err)
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(FetchError { errors })
    }
}

async fn fetch_record(
    client: &dyn RecordClient,
    kind: RecordKind,
    key: ObjectKey,
    optional: bool,
    dir: &Path,
    data_keys: &[&str],
) -> Result<(), FetchItemError> {
    let item = |source: FetchCause| FetchItemError {
        kind,
        key: key.clone(),
        source,
    };

    debug!(%kind, %key, "fetching object");
    let record = match client.get(kind, &key).await {
        Ok(record) => Some(record),
        Err(ClientError::NotFound) if optional => {
            debug!(%kind, %key, "object not found but optional");
            None
        }
        Err(err) => return Err(item(err.into())),
    };

    for data_key in data_keys {
        let path = dir.join(data_key);

        let value = match record.as_ref().map(|r| r.read(data_key)) {
            None => None,
            Some(Err(StoreError::KeyNotFound(_))) if optional => {
                debug!(%kind, %key, data_key, "key not found but object is optional");
                None
            }
            Some(Err(err)) => return Err(item(err.into())),
            Some(Ok(value)) => Some(value.into_owned()),
        };

        // absent value on an optional record still truncates: stale local
        // state from a previous container run must never be reused
        let value = value.unwrap_or_default();
        debug!(%kind, %key, data_key, file = %path.display(), "writing file");
        write_file(&path, &value)
            .await
            .map_err(|source| item(FetchCause::File { path, source }))?;
    }

    Ok(())
}

async fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::fake::FakeClient;
    use crate::store::RemoteRecord;

    fn test_config() -> Config {
        Config {
            configuration_config_map_name: "example.infra.tf-config".to_owned(),
            state_config_map_name: "example.infra.tf-state".to_owned(),
            variables_secret_name: "example.infra.tf-vars".to_owned(),
            namespace: "test-ns".to_owned(),
            base_dir: None,
        }
    }

    fn seeded_client(config: &Config) -> Arc<FakeClient> {
        let client = Arc::new(FakeClient::new());

        let mut cfg = RemoteRecord::new(
            RecordKind::ConfigMap,
            ObjectKey::new(&config.namespace, &config.configuration_config_map_name),
        );
        cfg.insert(CONFIG_MAIN_KEY, b"resource \"null_resource\" \"foo\" {}".to_vec())
            .unwrap();
        cfg.insert(CONFIG_VARS_KEY, b"variable \"SOME_VAR\" {}".to_vec())
            .unwrap();
        client.seed(cfg);

        let mut vars = RemoteRecord::new(
            RecordKind::Secret,
            ObjectKey::new(&config.namespace, &config.variables_secret_name),
        );
        vars.insert(VARS_KEY, b"SOME_VAR = \"yes\"".to_vec()).unwrap();
        client.seed(vars);

        client
    }

    async fn fetch_into_tempdir(
        client: &FakeClient,
        config: &Config,
    ) -> (tempfile::TempDir, PathSet, Result<(), FetchError>) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PathSet::new(Some(tmp.path()));
        paths.ensure_dirs().unwrap();
        let result = fetch_config_and_state(client, config, &paths).await;
        (tmp, paths, result)
    }

    #[tokio::test]
    async fn test_fetch_writes_all_files() {
        let config = test_config();
        let client = seeded_client(&config);

        let (_tmp, paths, result) = fetch_into_tempdir(&client, &config).await;
        result.unwrap();

        assert_eq!(
            std::fs::read_to_string(paths.config_dir.join(CONFIG_MAIN_KEY)).unwrap(),
            "resource \"null_resource\" \"foo\" {}"
        );
        assert_eq!(
            std::fs::read_to_string(paths.config_dir.join(CONFIG_VARS_KEY)).unwrap(),
            "variable \"SOME_VAR\" {}"
        );
        assert_eq!(
            std::fs::read_to_string(&paths.vars_path).unwrap(),
            "SOME_VAR = \"yes\""
        );
        // state record absent: local file created empty
        assert_eq!(std::fs::read(&paths.state_path).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent() {
        let config = test_config();
        let client = seeded_client(&config);

        let tmp = tempfile::tempdir().unwrap();
        let paths = PathSet::new(Some(tmp.path()));
        paths.ensure_dirs().unwrap();

        fetch_config_and_state(client.as_ref(), &config, &paths)
            .await
            .unwrap();
        let first = std::fs::read(paths.config_dir.join(CONFIG_MAIN_KEY)).unwrap();

        fetch_config_and_state(client.as_ref(), &config, &paths)
            .await
            .unwrap();
        let second = std::fs::read(paths.config_dir.join(CONFIG_MAIN_KEY)).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_state_record_truncates_stale_file() {
        let config = test_config();
        let client = seeded_client(&config);

        let tmp = tempfile::tempdir().unwrap();
        let paths = PathSet::new(Some(tmp.path()));
        paths.ensure_dirs().unwrap();
        std::fs::write(&paths.state_path, b"stale state from a previous run").unwrap();

        fetch_config_and_state(client.as_ref(), &config, &paths)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&paths.state_path).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_state_record_without_state_key_truncates() {
        let config = test_config();
        let client = seeded_client(&config);
        client.seed(RemoteRecord::new(
            RecordKind::ConfigMap,
            ObjectKey::new(&config.namespace, &config.state_config_map_name),
        ));

        let tmp = tempfile::tempdir().unwrap();
        let paths = PathSet::new(Some(tmp.path()));
        paths.ensure_dirs().unwrap();
        std::fs::write(&paths.state_path, b"stale").unwrap();

        fetch_config_and_state(client.as_ref(), &config, &paths)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&paths.state_path).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_missing_required_records_aggregate_errors() {
        let config = test_config();
        let client = FakeClient::new();

        let (_tmp, _paths, result) = fetch_into_tempdir(&client, &config).await;
        let err = result.unwrap_err();

        // config record and variables secret are required; state is optional
        assert_eq!(err.errors().len(), 2);
        let message = err.to_string();
        assert!(message.starts_with("failed to fetch terraform config: "));
        assert!(message.contains("example.infra.tf-config"));
        assert!(message.contains("example.infra.tf-vars"));
        assert!(!message.contains("example.infra.tf-state"));
    }

    #[tokio::test]
    async fn test_required_record_with_missing_key_fails() {
        let config = test_config();
        let client = seeded_client(&config);

        // overwrite the config record with one missing variables.tf
        let mut cfg = RemoteRecord::new(
            RecordKind::ConfigMap,
            ObjectKey::new(&config.namespace, &config.configuration_config_map_name),
        );
        cfg.insert(CONFIG_MAIN_KEY, b"{}".to_vec()).unwrap();
        client.seed(cfg);

        let (_tmp, _paths, result) = fetch_into_tempdir(&client, &config).await;
        let err = result.unwrap_err();

        assert_eq!(err.errors().len(), 1);
        assert!(err.to_string().contains("variables.tf"));
    }
}
