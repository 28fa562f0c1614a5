//! In-memory representation of the remote objects that carry terraform
//! files.
//!
//! A [`RemoteRecord`] mirrors a namespaced ConfigMap or Secret: a data map
//! from file basename to bytes, plus the metadata the supervisor cares
//! about (resource version for optimistic concurrency, finalizers). The
//! two kinds differ only in how values are stored on the wire, so the data
//! map is a tagged variant rather than an open trait.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// The kind of a remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A ConfigMap; values are text.
    ConfigMap,
    /// A Secret; values are raw bytes.
    Secret,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigMap => write!(f, "ConfigMap"),
            Self::Secret => write!(f, "Secret"),
        }
    }
}

/// Namespaced name identifying a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace the object lives in.
    pub namespace: String,
    /// Name of the object.
    pub name: String,
}

impl ObjectKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Data payload of a remote record, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// Text values (ConfigMap).
    Text(BTreeMap<String, String>),
    /// Raw byte values (Secret).
    Opaque(BTreeMap<String, Vec<u8>>),
}

impl RecordData {
    /// Create an empty payload for the given kind.
    #[must_use]
    pub const fn empty(kind: RecordKind) -> Self {
        match kind {
            RecordKind::ConfigMap => Self::Text(BTreeMap::new()),
            RecordKind::Secret => Self::Opaque(BTreeMap::new()),
        }
    }

    /// Returns `true` if the payload holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(map) => map.is_empty(),
            Self::Opaque(map) => map.is_empty(),
        }
    }
}

/// Errors raised by record payload access.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested data key is not present.
    #[error("key {0:?} not found")]
    KeyNotFound(String),

    /// A text record was handed bytes that are not valid UTF-8.
    #[error("value for key {0:?} is not valid UTF-8")]
    InvalidUtf8(String),
}

/// A named remote object holding terraform files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    /// The record kind.
    pub kind: RecordKind,
    /// Namespace and name.
    pub key: ObjectKey,
    /// Opaque resource version used for optimistic concurrency; `None`
    /// for records that have not been fetched from the server.
    pub resource_version: Option<String>,
    /// Finalizer strings attached to the object.
    pub finalizers: Vec<String>,
    /// The data payload.
    pub data: RecordData,
}

impl RemoteRecord {
    /// Create an empty record of the given kind.
    #[must_use]
    pub fn new(kind: RecordKind, key: ObjectKey) -> Self {
        Self {
            kind,
            key,
            resource_version: None,
            finalizers: Vec::new(),
            data: RecordData::empty(kind),
        }
    }

    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::KeyNotFound`] if the key is absent.
    pub fn read(&self, key: &str) -> Result<Cow<'_, [u8]>, StoreError> {
        match &self.data {
            RecordData::Text(map) => map
                .get(key)
                .map(|value| Cow::Borrowed(value.as_bytes()))
                .ok_or_else(|| StoreError::KeyNotFound(key.to_owned())),
            RecordData::Opaque(map) => map
                .get(key)
                .map(|value| Cow::Borrowed(value.as_slice()))
                .ok_or_else(|| StoreError::KeyNotFound(key.to_owned())),
        }
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidUtf8`] if this is a text record and the
    /// value is not valid UTF-8.
    pub fn insert(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        match &mut self.data {
            RecordData::Text(map) => {
                let text = String::from_utf8(value)
                    .map_err(|_| StoreError::InvalidUtf8(key.to_owned()))?;
                map.insert(key.to_owned(), text);
            }
            RecordData::Opaque(map) => {
                map.insert(key.to_owned(), value);
            }
        }
        Ok(())
    }

    /// Returns `true` if the data payload holds no entries.
    #[must_use]
    pub fn data_is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if the object carries the given finalizer.
    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add a finalizer; returns `true` if the set changed.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_owned());
        true
    }

    /// Remove a finalizer; returns `true` if the set changed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }
}
