//! Thin REST client for the Kubernetes core/v1 ConfigMap and Secret
//! endpoints.
//!
//! The supervisor only ever issues Get, Create and merge Patch on two
//! resource types, so a handful of requests against `/api/v1` keeps the
//! dependency surface small. Credentials come either from a kubeconfig
//! file or from the in-cluster service account.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Identity, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ClientError, PatchStrategy, RecordClient};
use crate::store::{ObjectKey, RecordData, RecordKind, RemoteRecord};

const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Resolved connection parameters for an API server.
#[derive(Debug)]
pub struct ClientConfig {
    /// Base URL of the API server, e.g. `https://10.0.0.1:443`.
    pub server: String,
    /// PEM-encoded CA bundle to trust, if any.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Bearer token, if any.
    pub token: Option<SecretString>,
    /// PEM-encoded client certificate plus key, if any.
    pub client_identity_pem: Option<Vec<u8>>,
    /// Skip server certificate verification.
    pub insecure_skip_tls_verify: bool,
    /// Namespace suggested by the credential source.
    pub default_namespace: Option<String>,
}

impl ClientConfig {
    /// Resolve a configuration: from `kubeconfig` when given, otherwise
    /// from the in-cluster service account.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if neither source yields a usable
    /// configuration.
    pub fn resolve(kubeconfig: Option<&Path>) -> Result<Self, ClientError> {
        match kubeconfig {
            Some(path) => Self::from_kubeconfig(path),
            None => Self::in_cluster(),
        }
    }

    /// Load connection parameters from a kubeconfig file.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the file cannot be read or the
    /// current context is incomplete.
    pub fn from_kubeconfig(path: &Path) -> Result<Self, ClientError> {
        let raw = std::fs::read(path).map_err(|err| {
            ClientError::Config(format!("failed to read kubeconfig {}: {err}", path.display()))
        })?;
        let kubeconfig: Kubeconfig = serde_yaml::from_slice(&raw)
            .map_err(|err| ClientError::Config(format!("failed to parse kubeconfig: {err}")))?;

        let context_name = kubeconfig
            .current_context
            .as_deref()
            .ok_or_else(|| ClientError::Config("kubeconfig has no current-context".to_owned()))?;
        let context = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| {
                ClientError::Config(format!("kubeconfig context {context_name:?} not found"))
            })?;
        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                ClientError::Config(format!("kubeconfig cluster {:?} not found", context.cluster))
            })?;
        let user = kubeconfig
            .users
            .iter()
            .find(|u| u.name == context.user)
            .map(|u| &u.user)
            .ok_or_else(|| {
                ClientError::Config(format!("kubeconfig user {:?} not found", context.user))
            })?;

        let ca_cert_pem = match (&cluster.certificate_authority_data, &cluster.certificate_authority)
        {
            (Some(data), _) => Some(decode_base64(data, "certificate-authority-data")?),
            (None, Some(file)) => Some(read_pem(file)?),
            (None, None) => None,
        };

        let client_identity_pem = match (
            &user.client_certificate_data,
            &user.client_key_data,
            &user.client_certificate,
            &user.client_key,
        ) {
            (Some(cert), Some(key), _, _) => {
                let mut pem = decode_base64(cert, "client-certificate-data")?;
                pem.extend_from_slice(&decode_base64(key, "client-key-data")?);
                Some(pem)
            }
            (None, None, Some(cert), Some(key)) => {
                let mut pem = read_pem(cert)?;
                pem.extend_from_slice(&read_pem(key)?);
                Some(pem)
            }
            (None, None, None, None) => None,
            _ => {
                return Err(ClientError::Config(
                    "kubeconfig user has an incomplete client certificate pair".to_owned(),
                ));
            }
        };

        Ok(Self {
            server: cluster.server.clone(),
            ca_cert_pem,
            token: user.token.clone().map(SecretString::from),
            client_identity_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            default_namespace: context.namespace.clone(),
        })
    }

    /// Load connection parameters from the pod's service account.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] when not running inside a cluster.
    pub fn in_cluster() -> Result<Self, ClientError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            ClientError::Config(
                "not running in a cluster and no kubeconfig given (KUBERNETES_SERVICE_HOST unset)"
                    .to_owned(),
            )
        })?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_owned());

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token")).map_err(|err| {
            ClientError::Config(format!("failed to read service account token: {err}"))
        })?;
        let ca_cert_pem = std::fs::read(dir.join("ca.crt")).ok();
        let default_namespace = std::fs::read_to_string(dir.join("namespace"))
            .ok()
            .map(|ns| ns.trim().to_owned());

        Ok(Self {
            server: format!("https://{host}:{port}"),
            ca_cert_pem,
            token: Some(SecretString::from(token.trim().to_owned())),
            client_identity_pem: None,
            insecure_skip_tls_verify: false,
            default_namespace,
        })
    }
}

fn decode_base64(data: &str, field: &str) -> Result<Vec<u8>, ClientError> {
    BASE64
        .decode(data.trim())
        .map_err(|err| ClientError::Config(format!("invalid {field}: {err}")))
}

fn read_pem(path: &str) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path)
        .map_err(|err| ClientError::Config(format!("failed to read {path}: {err}")))
}

/// [`RecordClient`] implementation over the Kubernetes REST API.
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpClient {
    /// Build a client from resolved connection parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the TLS material is invalid.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120));

        if let Some(pem) = &config.ca_cert_pem {
            let cert = Certificate::from_pem(pem)
                .map_err(|err| ClientError::Config(format!("invalid CA certificate: {err}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(pem) = &config.client_identity_pem {
            let identity = Identity::from_pem(pem)
                .map_err(|err| ClientError::Config(format!("invalid client certificate: {err}")))?;
            builder = builder.identity(identity);
        }
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|err| ClientError::Config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            base_url: config.server.trim_end_matches('/').to_owned(),
            token: config.token,
        })
    }

    fn collection_url(&self, kind: RecordKind, namespace: &str) -> String {
        let resource = match kind {
            RecordKind::ConfigMap => "configmaps",
            RecordKind::Secret => "secrets",
        };
        format!("{}/api/v1/namespaces/{namespace}/{resource}", self.base_url)
    }

    fn object_url(&self, kind: RecordKind, key: &ObjectKey) -> String {
        format!("{}/{}", self.collection_url(kind, &key.namespace), key.name)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn parse_record(
        response: reqwest::Response,
        kind: RecordKind,
    ) -> Result<RemoteRecord, ClientError> {
        let manifest: Manifest = response
            .json()
            .await
            .map_err(|err| ClientError::Api(format!("failed to decode response: {err}")))?;
        manifest.into_record(kind)
    }
}

async fn api_error(response: reqwest::Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ClientError::Api(format!("unexpected status {status}: {body}"))
}

#[async_trait]
impl RecordClient for HttpClient {
    async fn get(&self, kind: RecordKind, key: &ObjectKey) -> Result<RemoteRecord, ClientError> {
        let response = self
            .authorize(self.http.get(self.object_url(kind, key)))
            .send()
            .await
            .map_err(|err| ClientError::Api(err.to_string()))?;

        match response.status() {
            status if status.is_success() => Self::parse_record(response, kind).await,
            StatusCode::NOT_FOUND => Err(ClientError::NotFound),
            _ => Err(api_error(response).await),
        }
    }

    async fn create(&self, record: &RemoteRecord) -> Result<RemoteRecord, ClientError> {
        let manifest = Manifest::from_record(record, FinalizerField::IfNonEmpty, false);
        let response = self
            .authorize(
                self.http
                    .post(self.collection_url(record.kind, &record.key.namespace)),
            )
            .json(&manifest)
            .send()
            .await
            .map_err(|err| ClientError::Api(err.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                debug!(kind = %record.kind, key = %record.key, "created object");
                Self::parse_record(response, record.kind).await
            }
            StatusCode::CONFLICT => Err(ClientError::AlreadyExists),
            _ => Err(api_error(response).await),
        }
    }

    async fn patch(
        &self,
        record: &RemoteRecord,
        strategy: PatchStrategy,
    ) -> Result<RemoteRecord, ClientError> {
        let manifest = match strategy {
            PatchStrategy::Merge => Manifest::from_record(record, FinalizerField::Omit, false),
            PatchStrategy::MergeWithOptimisticLock => {
                if record.resource_version.is_none() {
                    return Err(ClientError::Config(
                        "optimistic-lock patch requires a resource version".to_owned(),
                    ));
                }
                Manifest::from_record(record, FinalizerField::Always, true)
            }
        };

        let response = self
            .authorize(self.http.patch(self.object_url(record.kind, &record.key)))
            .header(CONTENT_TYPE, MERGE_PATCH_CONTENT_TYPE)
            .json(&manifest)
            .send()
            .await
            .map_err(|err| ClientError::Api(err.to_string()))?;

        match response.status() {
            status if status.is_success() => Self::parse_record(response, record.kind).await,
            StatusCode::NOT_FOUND => Err(ClientError::NotFound),
            StatusCode::CONFLICT => Err(ClientError::Conflict),
            _ => Err(api_error(response).await),
        }
    }
}

/// How the finalizer list is rendered into a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizerField {
    /// Leave the field out entirely (merge patches must not touch it).
    Omit,
    /// Include the list only when non-empty (create).
    IfNonEmpty,
    /// Always include it, even when empty, so a merge patch can clear the
    /// last finalizer.
    Always,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    api_version: String,
    kind: String,
    metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    finalizers: Option<Vec<String>>,
}

impl Manifest {
    fn from_record(
        record: &RemoteRecord,
        finalizers: FinalizerField,
        with_resource_version: bool,
    ) -> Self {
        let data = match &record.data {
            RecordData::Text(map) => map.clone(),
            RecordData::Opaque(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), BASE64.encode(value)))
                .collect(),
        };

        let finalizers = match finalizers {
            FinalizerField::Omit => None,
            FinalizerField::IfNonEmpty if record.finalizers.is_empty() => None,
            FinalizerField::IfNonEmpty | FinalizerField::Always => {
                Some(record.finalizers.clone())
            }
        };

        Self {
            api_version: "v1".to_owned(),
            kind: match record.kind {
                RecordKind::ConfigMap => "ConfigMap",
                RecordKind::Secret => "Secret",
            }
            .to_owned(),
            metadata: Metadata {
                name: record.key.name.clone(),
                namespace: record.key.namespace.clone(),
                resource_version: if with_resource_version {
                    record.resource_version.clone()
                } else {
                    None
                },
                finalizers,
            },
            data: if data.is_empty() { None } else { Some(data) },
        }
    }

    fn into_record(self, kind: RecordKind) -> Result<RemoteRecord, ClientError> {
        let data = match kind {
            RecordKind::ConfigMap => RecordData::Text(self.data.unwrap_or_default()),
            RecordKind::Secret => {
                let mut map = BTreeMap::new();
                for (key, value) in self.data.unwrap_or_default() {
                    let bytes = BASE64.decode(value.as_bytes()).map_err(|err| {
                        ClientError::Api(format!("invalid base64 in secret key {key:?}: {err}"))
                    })?;
                    map.insert(key, bytes);
                }
                RecordData::Opaque(map)
            }
        };

        Ok(RemoteRecord {
            kind,
            key: ObjectKey::new(self.metadata.namespace, self.metadata.name),
            resource_version: self.metadata.resource_version,
            finalizers: self.metadata.finalizers.unwrap_or_default(),
            data,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    #[serde(default)]
    certificate_authority: Option<String>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: Context,
}

#[derive(Debug, Deserialize)]
struct Context {
    cluster: String,
    user: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: User,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct User {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    client_certificate: Option<String>,
    #[serde(default)]
    client_key: Option<String>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
}
