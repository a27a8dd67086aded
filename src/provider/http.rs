//! JSON-over-HTTP provider.
//!
//! Every kind lives under its own collection path:
//!
//! | kind                   | path                     |
//! |------------------------|--------------------------|
//! | notification channel   | `/notification-channels` |
//! | watchlist              | `/watchlists`            |
//! | custom agent           | `/custom-agents`         |
//!
//! Requests carry the record's fields plus `name`, without `_` annotations
//! at any depth; referenced channels are sent as `channel_ids`. Responses
//! must be a JSON object with an `id`.

use declarative::{
    ConfigRecord, ProviderError, ProviderResult, RemoteResource, ResolvedRefs, ResourceKind,
    ResourceProvider, strip_annotations,
};
use serde_json::Value;

use super::ApiConfig;

const USER_AGENT: &str = concat!("watchctl/", env!("CARGO_PKG_VERSION"));

pub struct HttpProvider {
    agent: ureq::Agent,
    kind: ResourceKind,
    collection_url: String,
    auth: Option<String>,
}

impl HttpProvider {
    pub fn new(agent: ureq::Agent, api: &ApiConfig, kind: ResourceKind) -> Self {
        Self {
            agent,
            kind,
            collection_url: format!("{}/{}", api.base_url, collection_path(kind)),
            auth: api.token.as_ref().map(|t| format!("Bearer {t}")),
        }
    }

    fn item_url(&self, remote_id: &str) -> String {
        format!("{}/{}", self.collection_url, remote_id)
    }

    fn prepare<B>(&self, request: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        let request = request
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT);
        match &self.auth {
            Some(auth) => request.header("Authorization", auth.as_str()),
            None => request,
        }
    }

    fn error(&self, remote_id: &str, err: ureq::Error) -> ProviderError {
        match err {
            ureq::Error::StatusCode(404) => ProviderError::NotFound {
                kind: self.kind,
                id: remote_id.to_string(),
            },
            ureq::Error::StatusCode(code) => {
                ProviderError::failed(format!("{} {}: HTTP {code}", self.kind, remote_id))
            }
            other => ProviderError::failed(other.to_string()),
        }
    }

    fn read_remote(
        &self,
        mut response: ureq::http::Response<ureq::Body>,
    ) -> ProviderResult<RemoteResource> {
        let payload: Value = response
            .body_mut()
            .read_json()
            .map_err(|e| ProviderError::failed(format!("invalid {} response: {e}", self.kind)))?;
        remote_from_payload(payload)
    }
}

impl ResourceProvider for HttpProvider {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn create(&self, record: &ConfigRecord, refs: &ResolvedRefs) -> ProviderResult<RemoteResource> {
        let body = request_body(record, refs)?;
        log::debug!("POST {}", self.collection_url);
        let response = self
            .prepare(self.agent.post(&self.collection_url))
            .send_json(&body)
            .map_err(|e| self.error(&record.name, e))?;
        self.read_remote(response)
    }

    fn update(
        &self,
        remote_id: &str,
        record: &ConfigRecord,
        refs: &ResolvedRefs,
        _previous: Option<&RemoteResource>,
    ) -> ProviderResult<RemoteResource> {
        let body = request_body(record, refs)?;
        let url = self.item_url(remote_id);
        log::debug!("PUT {url}");
        let response = self
            .prepare(self.agent.put(&url))
            .send_json(&body)
            .map_err(|e| self.error(remote_id, e))?;
        self.read_remote(response)
    }

    fn delete(&self, remote_id: &str) -> ProviderResult<()> {
        let url = self.item_url(remote_id);
        log::debug!("DELETE {url}");
        self.prepare(self.agent.delete(&url))
            .call()
            .map_err(|e| self.error(remote_id, e))?;
        Ok(())
    }

    fn get_by_id(&self, remote_id: &str) -> ProviderResult<Option<RemoteResource>> {
        let url = self.item_url(remote_id);
        log::debug!("GET {url}");
        match self.prepare(self.agent.get(&url)).call() {
            Ok(response) => self.read_remote(response).map(Some),
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(e) => Err(self.error(remote_id, e)),
        }
    }

    /// The API has no in-place type change for agents: delete, then create.
    fn replace(
        &self,
        remote_id: &str,
        record: &ConfigRecord,
        refs: &ResolvedRefs,
    ) -> ProviderResult<RemoteResource> {
        if self.kind != ResourceKind::CustomAgent {
            return Err(ProviderError::Unsupported {
                kind: self.kind,
                operation: "replace",
            });
        }
        match self.delete(remote_id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.create(record, refs)
    }
}

fn collection_path(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::NotificationChannel => "notification-channels",
        ResourceKind::Watchlist => "watchlists",
        ResourceKind::CustomAgent => "custom-agents",
    }
}

/// Record fields plus `name`, with references swapped for remote ids
fn request_body(record: &ConfigRecord, refs: &ResolvedRefs) -> ProviderResult<Value> {
    let mut body = strip_annotations(&record.fields);
    body.insert("name".to_string(), Value::String(record.name.clone()));

    if !record.references.is_empty() {
        let ids = record
            .reference_set()
            .into_iter()
            .map(|name| {
                refs.get(&name).cloned().map(Value::String).ok_or_else(|| {
                    ProviderError::failed(format!("'{}' references unresolved '{name}'", record.name))
                })
            })
            .collect::<ProviderResult<Vec<_>>>()?;
        body.insert("channel_ids".to_string(), Value::Array(ids));
    }

    Ok(Value::Object(body))
}

/// Pull the id out of a response object; numeric ids are kept as strings
fn remote_from_payload(payload: Value) -> ProviderResult<RemoteResource> {
    let id = match payload.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(ProviderError::failed("response has no 'id'")),
    };
    Ok(RemoteResource::new(id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api() -> ApiConfig {
        ApiConfig {
            base_url: "https://api.example.com/v1".to_string(),
            token: Some("secret".to_string()),
        }
    }

    fn provider(kind: ResourceKind) -> HttpProvider {
        HttpProvider::new(ureq::Agent::new_with_defaults(), &api(), kind)
    }

    #[test]
    fn test_urls_per_kind() {
        let channels = provider(ResourceKind::NotificationChannel);
        assert_eq!(
            channels.collection_url,
            "https://api.example.com/v1/notification-channels"
        );
        assert_eq!(
            provider(ResourceKind::CustomAgent).item_url("42"),
            "https://api.example.com/v1/custom-agents/42"
        );
        assert_eq!(channels.auth.as_deref(), Some("Bearer secret"));
    }

    #[test]
    fn test_body_swaps_references_for_ids() {
        let record = ConfigRecord::new(ResourceKind::Watchlist, "prod")
            .with_field("hosts", json!(["web-1"]))
            .with_field("_note", "annotation")
            .with_reference("slack")
            .with_reference("pager")
            .with_reference("pager");
        let refs = ResolvedRefs::from([
            ("pager".to_string(), "c-1".to_string()),
            ("slack".to_string(), "c-2".to_string()),
        ]);

        let body = request_body(&record, &refs).unwrap();
        assert_eq!(
            body,
            json!({"name": "prod", "hosts": ["web-1"], "channel_ids": ["c-1", "c-2"]})
        );
    }

    #[test]
    fn test_body_drops_nested_annotations() {
        let record = ConfigRecord::new(ResourceKind::CustomAgent, "latency")
            .with_field("type", "http")
            .with_field("trigger", json!({"threshold": 250, "_note": "tuned"}));
        let body = request_body(&record, &ResolvedRefs::new()).unwrap();
        assert_eq!(
            body,
            json!({"name": "latency", "type": "http", "trigger": {"threshold": 250}})
        );
    }

    #[test]
    fn test_body_without_references_keeps_fields() {
        // Rollback re-applies a remote snapshot that already carries channel_ids
        let record = ConfigRecord::new(ResourceKind::Watchlist, "prod")
            .with_field("channel_ids", json!(["c-9"]));
        let body = request_body(&record, &ResolvedRefs::new()).unwrap();
        assert_eq!(body["channel_ids"], json!(["c-9"]));
    }

    #[test]
    fn test_body_with_unresolved_reference_fails() {
        let record = ConfigRecord::new(ResourceKind::Watchlist, "prod").with_reference("pager");
        let err = request_body(&record, &ResolvedRefs::new()).unwrap_err();
        assert!(err.to_string().contains("unresolved 'pager'"));
    }

    #[test]
    fn test_remote_id_string_or_number() {
        assert_eq!(remote_from_payload(json!({"id": "abc"})).unwrap().id, "abc");
        assert_eq!(remote_from_payload(json!({"id": 17})).unwrap().id, "17");
        assert!(remote_from_payload(json!({"name": "x"})).is_err());
    }

    #[test]
    fn test_404_maps_to_not_found() {
        let p = provider(ResourceKind::Watchlist);
        assert!(p.error("w-1", ureq::Error::StatusCode(404)).is_not_found());

        let other = p.error("w-1", ureq::Error::StatusCode(500));
        assert!(!other.is_not_found());
        assert!(other.to_string().contains("HTTP 500"));
    }

    #[test]
    fn test_replace_only_for_agents() {
        let record = ConfigRecord::new(ResourceKind::Watchlist, "prod");
        let err = provider(ResourceKind::Watchlist)
            .replace("w-1", &record, &ResolvedRefs::new())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
    }
}
