//! Remote API providers.
//!
//! One [`HttpProvider`] per resource kind, all sharing a single HTTP agent.

mod http;

pub use http::HttpProvider;

use anyhow::{Context, Result};
use declarative::{ProviderRegistry, ResourceKind};
use std::sync::Arc;

/// Environment variable for the API base URL
pub const ENV_API_URL: &str = "WATCHCTL_API_URL";

/// Environment variable for the API bearer token
pub const ENV_API_TOKEN: &str = "WATCHCTL_API_TOKEN";

/// Where and how to reach the remote API
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl ApiConfig {
    /// Resolve from the `--api-url` flag, falling back to the environment
    pub fn resolve(flag: Option<&str>) -> Result<Self> {
        let base_url = match flag {
            Some(url) => url.to_string(),
            None => std::env::var(ENV_API_URL)
                .with_context(|| format!("No API URL configured (use --api-url or {ENV_API_URL})"))?,
        };
        let token = std::env::var(ENV_API_TOKEN).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            log::debug!("{ENV_API_TOKEN} not set, sending unauthenticated requests");
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

/// Build a registry with an HTTP provider for every kind
pub fn registry(api: &ApiConfig) -> ProviderRegistry {
    let agent = ureq::Agent::new_with_defaults();
    ResourceKind::ALL
        .into_iter()
        .fold(ProviderRegistry::new(), |registry, kind| {
            registry.with(Arc::new(HttpProvider::new(agent.clone(), api, kind)))
        })
}
