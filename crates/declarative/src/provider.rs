//! Resource provider interface
//!
//! The engine never talks to the remote service itself. Each resource kind
//! has one [`ResourceProvider`] that translates records into remote calls.
//! Adding a kind means adding a [`ResourceKind`] variant and a provider, not
//! editing the executor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{Error, Result};
use crate::types::{ConfigRecord, ResourceKind};

/// Referenced logical name to remote id, resolved at dispatch time
pub type ResolvedRefs = BTreeMap<String, String>;

/// The provider's view of a remote resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub id: String,
    /// Remote representation as returned by the service
    #[serde(default)]
    pub payload: Value,
}

impl RemoteResource {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Failure of a single provider call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote resource does not exist (404-class response)
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    /// The provider does not support this operation
    #[error("{operation} is not supported for {kind}")]
    Unsupported {
        kind: ResourceKind,
        operation: &'static str,
    },

    /// Any other failure
    #[error("{message}")]
    Failed { message: String },
}

impl ProviderError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for provider calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Remote operations for one resource kind
///
/// Calls must be bounded: every call resolves to a value or an error.
/// Transport-level retries are the provider's concern.
pub trait ResourceProvider: Send + Sync {
    /// Kind handled by this provider
    fn kind(&self) -> ResourceKind;

    /// Create the remote resource
    fn create(&self, record: &ConfigRecord, refs: &ResolvedRefs) -> ProviderResult<RemoteResource>;

    /// Update in place; `previous` is the remote representation before the call
    fn update(
        &self,
        remote_id: &str,
        record: &ConfigRecord,
        refs: &ResolvedRefs,
        previous: Option<&RemoteResource>,
    ) -> ProviderResult<RemoteResource>;

    /// Delete the remote resource
    fn delete(&self, remote_id: &str) -> ProviderResult<()>;

    /// Fetch the remote resource, `None` if it does not exist
    fn get_by_id(&self, remote_id: &str) -> ProviderResult<Option<RemoteResource>>;

    /// Destroy and recreate; only meaningful for custom agents
    fn replace(
        &self,
        _remote_id: &str,
        _record: &ConfigRecord,
        _refs: &ResolvedRefs,
    ) -> ProviderResult<RemoteResource> {
        Err(ProviderError::Unsupported {
            kind: self.kind(),
            operation: "replace",
        })
    }

    /// Rebuild a record from a remote snapshot, for rollback.
    ///
    /// This is a lossy inverse: fields the service never returns (redacted
    /// secrets, write-only settings) cannot be recovered. The default keeps
    /// the payload as the record's fields.
    fn record_from_remote(&self, name: &str, remote: &RemoteResource) -> ConfigRecord {
        let fields = match &remote.payload {
            Value::Object(map) => map
                .iter()
                .filter(|(key, _)| key.as_str() != "id")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => BTreeMap::new(),
        };
        ConfigRecord {
            kind: self.kind(),
            name: name.to_string(),
            fields,
            references: Vec::new(),
        }
    }
}

/// Providers indexed by the kind they handle
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ResourceKind, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider, replacing any previous one for the same kind
    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, kind: ResourceKind) -> Result<&dyn ResourceProvider> {
        self.providers
            .get(&kind)
            .map(|p| p.as_ref())
            .ok_or(Error::MissingProvider { kind })
    }

    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.providers.keys().copied()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use serde_json::json;

    #[test]
    fn test_registry_lookup_by_kind() {
        let registry =
            ProviderRegistry::new().with(Arc::new(MockProvider::new(ResourceKind::Watchlist)));

        assert!(registry.get(ResourceKind::Watchlist).is_ok());
        assert!(matches!(
            registry.get(ResourceKind::CustomAgent),
            Err(Error::MissingProvider {
                kind: ResourceKind::CustomAgent
            })
        ));
    }

    struct ReadOnly;

    impl ResourceProvider for ReadOnly {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Watchlist
        }

        fn create(&self, _: &ConfigRecord, _: &ResolvedRefs) -> ProviderResult<RemoteResource> {
            Err(ProviderError::failed("read only"))
        }

        fn update(
            &self,
            _: &str,
            _: &ConfigRecord,
            _: &ResolvedRefs,
            _: Option<&RemoteResource>,
        ) -> ProviderResult<RemoteResource> {
            Err(ProviderError::failed("read only"))
        }

        fn delete(&self, _: &str) -> ProviderResult<()> {
            Err(ProviderError::failed("read only"))
        }

        fn get_by_id(&self, _: &str) -> ProviderResult<Option<RemoteResource>> {
            Ok(None)
        }
    }

    #[test]
    fn test_default_replace_is_unsupported() {
        let record = ConfigRecord::new(ResourceKind::Watchlist, "w");
        let err = ReadOnly
            .replace("wl-1", &record, &ResolvedRefs::new())
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::Unsupported {
                kind: ResourceKind::Watchlist,
                operation: "replace"
            }
        );
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_record_from_remote_drops_id() {
        let provider = MockProvider::new(ResourceKind::NotificationChannel);
        let remote = RemoteResource::new(
            "ch-1",
            json!({"id": "ch-1", "type": "email", "address": "ops@example.com"}),
        );

        let record = provider.record_from_remote("pager", &remote);
        assert_eq!(record.name, "pager");
        assert_eq!(record.kind, ResourceKind::NotificationChannel);
        assert!(!record.fields.contains_key("id"));
        assert_eq!(record.fields.get("type"), Some(&json!("email")));
    }
}
