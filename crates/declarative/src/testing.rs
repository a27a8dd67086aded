//! Test builders and a recording in-memory provider

use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::provider::{
    ProviderError, ProviderResult, RemoteResource, ResolvedRefs, ResourceProvider,
};
use crate::state::StateEntry;
use crate::types::{ConfigRecord, ResourceKind};

pub fn channel(name: &str) -> ConfigRecord {
    ConfigRecord::new(ResourceKind::NotificationChannel, name)
        .with_field("type", "email")
        .with_field("address", format!("{name}@example.com"))
}

pub fn watchlist(name: &str, channels: &[&str]) -> ConfigRecord {
    let mut record = ConfigRecord::new(ResourceKind::Watchlist, name)
        .with_field("description", format!("{name} watchlist"));
    record.references = channels.iter().map(|c| (*c).to_string()).collect();
    record
}

pub fn agent(name: &str, monitoring_type: &str, channels: &[&str]) -> ConfigRecord {
    let mut record = ConfigRecord::new(ResourceKind::CustomAgent, name)
        .with_field("type", monitoring_type)
        .with_field("enabled", true);
    record.references = channels.iter().map(|c| (*c).to_string()).collect();
    record
}

/// State entry as if `record` had been applied with `remote_id`
pub fn entry_for(record: &ConfigRecord, remote_id: &str) -> StateEntry {
    let remote = RemoteResource::new(remote_id, json!({ "id": remote_id }));
    StateEntry::applied(record, &remote, None, "test", "0.0.0")
}

/// One recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    /// Logical name when known, otherwise the remote id
    pub target: String,
}

impl Call {
    pub fn new(op: &'static str, target: &str) -> Self {
        Self {
            op,
            target: target.to_string(),
        }
    }
}

/// Call log shared between mock providers
pub type CallLog = Arc<Mutex<Vec<Call>>>;

#[derive(Debug, Default)]
struct Remote {
    next_id: u32,
    /// remote id -> (logical name, payload)
    objects: BTreeMap<String, (String, Value)>,
    failures: HashSet<(&'static str, String)>,
}

/// In-memory provider recording every call
#[derive(Debug)]
pub struct MockProvider {
    kind: ResourceKind,
    log: CallLog,
    remote: Mutex<Remote>,
}

impl MockProvider {
    pub fn new(kind: ResourceKind) -> Self {
        Self::with_log(kind, CallLog::default())
    }

    pub fn with_log(kind: ResourceKind, log: CallLog) -> Self {
        Self {
            kind,
            log,
            remote: Mutex::new(Remote::default()),
        }
    }

    /// Make `op` fail whenever it targets `name`
    pub fn fail_on(&self, op: &'static str, name: &str) {
        self.remote().failures.insert((op, name.to_string()));
    }

    /// Pre-populate a remote object
    pub fn seed(&self, id: &str, name: &str, payload: Value) {
        self.remote()
            .objects
            .insert(id.to_string(), (name.to_string(), payload));
    }

    pub fn exists(&self, id: &str) -> bool {
        self.remote().objects.contains_key(id)
    }

    pub fn payload(&self, id: &str) -> Option<Value> {
        self.remote().objects.get(id).map(|(_, p)| p.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.log).clone()
    }

    fn remote(&self) -> MutexGuard<'_, Remote> {
        lock(&self.remote)
    }

    fn record_call(&self, op: &'static str, target: &str) {
        lock(&self.log).push(Call::new(op, target));
    }

    fn check(&self, remote: &Remote, op: &'static str, name: &str) -> ProviderResult<()> {
        if remote.failures.contains(&(op, name.to_string())) {
            return Err(ProviderError::failed(format!("injected {op} failure for {name}")));
        }
        Ok(())
    }

    fn name_of(remote: &Remote, id: &str) -> String {
        remote
            .objects
            .get(id)
            .map_or_else(|| id.to_string(), |(name, _)| name.clone())
    }

    fn render(&self, id: &str, record: &ConfigRecord, refs: &ResolvedRefs) -> Value {
        let mut payload: Map<String, Value> = record
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        payload.insert("id".into(), Value::from(id));
        payload.insert("name".into(), Value::from(record.name.clone()));
        if !refs.is_empty() {
            payload.insert(
                "channel_ids".into(),
                Value::from(refs.values().cloned().collect::<Vec<_>>()),
            );
        }
        Value::Object(payload)
    }

    fn next_id(&self, remote: &mut Remote) -> String {
        remote.next_id += 1;
        let prefix = match self.kind {
            ResourceKind::NotificationChannel => "ch",
            ResourceKind::Watchlist => "wl",
            ResourceKind::CustomAgent => "ag",
        };
        format!("{prefix}-{}", remote.next_id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ResourceProvider for MockProvider {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn create(&self, record: &ConfigRecord, refs: &ResolvedRefs) -> ProviderResult<RemoteResource> {
        self.record_call("create", &record.name);
        let mut remote = self.remote();
        self.check(&remote, "create", &record.name)?;

        let id = self.next_id(&mut remote);
        let payload = self.render(&id, record, refs);
        remote
            .objects
            .insert(id.clone(), (record.name.clone(), payload.clone()));
        Ok(RemoteResource::new(id, payload))
    }

    fn update(
        &self,
        remote_id: &str,
        record: &ConfigRecord,
        refs: &ResolvedRefs,
        _previous: Option<&RemoteResource>,
    ) -> ProviderResult<RemoteResource> {
        self.record_call("update", &record.name);
        let mut remote = self.remote();
        self.check(&remote, "update", &record.name)?;

        if !remote.objects.contains_key(remote_id) {
            return Err(ProviderError::NotFound {
                kind: self.kind,
                id: remote_id.to_string(),
            });
        }
        let payload = self.render(remote_id, record, refs);
        remote.objects.insert(
            remote_id.to_string(),
            (record.name.clone(), payload.clone()),
        );
        Ok(RemoteResource::new(remote_id, payload))
    }

    fn delete(&self, remote_id: &str) -> ProviderResult<()> {
        let mut remote = self.remote();
        let name = Self::name_of(&remote, remote_id);
        self.record_call("delete", &name);
        self.check(&remote, "delete", &name)?;

        match remote.objects.remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound {
                kind: self.kind,
                id: remote_id.to_string(),
            }),
        }
    }

    fn get_by_id(&self, remote_id: &str) -> ProviderResult<Option<RemoteResource>> {
        let remote = self.remote();
        let name = Self::name_of(&remote, remote_id);
        self.record_call("get", &name);
        self.check(&remote, "get", &name)?;

        Ok(remote
            .objects
            .get(remote_id)
            .map(|(_, payload)| RemoteResource::new(remote_id, payload.clone())))
    }

    fn replace(
        &self,
        remote_id: &str,
        record: &ConfigRecord,
        refs: &ResolvedRefs,
    ) -> ProviderResult<RemoteResource> {
        self.record_call("replace", &record.name);
        let mut remote = self.remote();
        self.check(&remote, "replace", &record.name)?;

        remote.objects.remove(remote_id);
        let id = self.next_id(&mut remote);
        let payload = self.render(&id, record, refs);
        remote
            .objects
            .insert(id.clone(), (record.name.clone(), payload.clone()));
        Ok(RemoteResource::new(id, payload))
    }
}
