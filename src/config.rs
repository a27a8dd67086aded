//! Configuration file loading
//!
//! A configuration file holds three top-level arrays, one per resource kind.
//! Every entry needs a `name`; `channels` lists the notification channels it
//! references and every other key is passed through as a field.
//!
//! ```toml
//! [[notification_channels]]
//! name = "pager"
//! type = "email"
//! address = "oncall@example.com"
//!
//! [[watchlists]]
//! name = "prod-hosts"
//! channels = ["pager"]
//! ```

use anyhow::{Context, Result, bail};
use declarative::{ConfigRecord, ResourceKind};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

type Entry = Map<String, Value>;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    notification_channels: Vec<Entry>,
    #[serde(default)]
    watchlists: Vec<Entry>,
    #[serde(default)]
    custom_agents: Vec<Entry>,
}

/// Desired records loaded from a configuration file
#[derive(Debug)]
pub struct Config {
    pub path: PathBuf,
    pub records: Vec<ConfigRecord>,
}

impl Config {
    /// Load and validate a TOML or JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;

        let file: ConfigFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?,
        };

        let records = file
            .into_records()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        log::debug!("Loaded {} records from {}", records.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }
}

impl ConfigFile {
    fn into_records(self) -> Result<Vec<ConfigRecord>> {
        let sections = [
            (ResourceKind::NotificationChannel, self.notification_channels),
            (ResourceKind::Watchlist, self.watchlists),
            (ResourceKind::CustomAgent, self.custom_agents),
        ];

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for (kind, entries) in sections {
            for (index, entry) in entries.into_iter().enumerate() {
                let record = to_record(kind, entry)
                    .with_context(|| format!("{kind} entry #{}", index + 1))?;
                if !seen.insert(record.name.clone()) {
                    bail!("Duplicate resource name '{}'", record.name);
                }
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn to_record(kind: ResourceKind, mut entry: Entry) -> Result<ConfigRecord> {
    let name = match entry.remove("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        Some(_) => bail!("'name' must be a non-empty string"),
        None => bail!("missing required 'name'"),
    };

    let references = match entry.remove("channels") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(channel) => Ok(channel),
                other => bail!("'{name}': channel references must be strings, got {other}"),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => bail!("'{name}': 'channels' must be an array of names"),
    };

    if kind == ResourceKind::CustomAgent && !matches!(entry.get("type"), Some(Value::String(_))) {
        bail!("custom agent '{name}' needs a string 'type'");
    }

    Ok(ConfigRecord {
        kind,
        name,
        fields: entry.into_iter().collect(),
        references,
    })
}

// ============================================================================
// Tests
// ============================================================================
