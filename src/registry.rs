use std::{
    collections::BTreeMap,
    sync::RwLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::mail::MailMessage;

/// Snapshot writes are skipped above this serialized size; the oldest entry is evicted instead.
const MAX_SNAPSHOT_BYTES: u64 = 50 * 1024 * 1024 * 1024;
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Sending,
    Sended,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Event {
    pub ts: u64,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RuntimeItem {
    pub message: MailMessage,
    pub ts_added: u64,
    pub state: JobState,
    pub events: Vec<Event>,
}

impl RuntimeItem {
    pub fn new(message: MailMessage) -> Self {
        Self {
            message,
            ts_added: now_seconds(),
            state: JobState::Sending,
            events: Vec::new(),
        }
    }

    /// Response-facing view: omits attachment payloads.
    pub fn without_attachment_bodies(&self) -> Self {
        Self {
            message: self.message.without_attachment_bodies(),
            ts_added: self.ts_added,
            state: self.state,
            events: self.events.clone(),
        }
    }
}

pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Default)]
struct State {
    items: BTreeMap<String, RuntimeItem>,
    /// Insertion order, oldest first, for eviction.
    order: Vec<String>,
}

/// In-memory job registry. Single `RwLock` guarding all mutation, per the rest of this
/// codebase's shared-state style: reads (GETs, snapshotting) don't block each other, writes
/// (delivery progress) are serialized.
pub struct Registry {
    state: RwLock<State>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    pub fn from_snapshot(entries: Vec<(String, RuntimeItem)>) -> Self {
        let mut items = BTreeMap::new();
        let mut order = Vec::with_capacity(entries.len());
        for (guid, item) in entries {
            order.push(guid.clone());
            items.insert(guid, item);
        }
        Self {
            state: RwLock::new(State { items, order }),
        }
    }

    pub fn insert(&self, guid: String, item: RuntimeItem) {
        let mut state = self.state.write().expect("registry lock poisoned");
        state.order.push(guid.clone());
        state.items.insert(guid, item);
        self.evict_if_needed(&mut state);
    }

    pub fn get(&self, guid: &str) -> Option<RuntimeItem> {
        let state = self.state.read().expect("registry lock poisoned");
        state.items.get(guid).cloned()
    }

    pub fn remove(&self, guid: &str) -> Option<RuntimeItem> {
        let mut state = self.state.write().expect("registry lock poisoned");
        state.order.retain(|g| g != guid);
        state.items.remove(guid)
    }

    pub fn iterate(&self) -> Vec<(String, RuntimeItem)> {
        let state = self.state.read().expect("registry lock poisoned");
        state
            .order
            .iter()
            .filter_map(|guid| state.items.get(guid).map(|item| (guid.clone(), item.clone())))
            .collect()
    }

    pub fn set_state(&self, guid: &str, new_state: JobState) {
        let mut state = self.state.write().expect("registry lock poisoned");
        if let Some(item) = state.items.get_mut(guid) {
            item.state = new_state;
        }
    }

    pub fn append_event(&self, guid: &str, source: &str, message: impl Into<String>) {
        let message = message.into();
        {
            let mut state = self.state.write().expect("registry lock poisoned");
            if let Some(item) = state.items.get_mut(guid) {
                item.events.push(Event {
                    ts: now_seconds(),
                    source: source.to_string(),
                    message: message.clone(),
                });
            }
        }
        info!("[{guid}] [{source}] {message}");
    }

    fn evict_if_needed(&self, state: &mut State) {
        loop {
            let size = serde_json::to_vec(&state.items).map(|v| v.len() as u64).unwrap_or(0);
            if size <= MAX_SNAPSHOT_BYTES || state.order.is_empty() {
                break;
            }
            let oldest = state.order.remove(0);
            warn!("registry exceeds snapshot size ceiling, evicting oldest entry {oldest}");
            state.items.remove(&oldest);
        }
    }

    /// Builds the persisted JSON with entries in insertion order. `BTreeMap` serializes
    /// lexicographically by guid, which would scramble the on-disk order, so this walks the
    /// `order` list explicitly into a `serde_json::Map` (order-preserving thanks to the
    /// `preserve_order` feature).
    fn snapshot_json(&self) -> Vec<u8> {
        let state = self.state.read().expect("registry lock poisoned");
        let mut ordered = serde_json::Map::with_capacity(state.order.len());
        for guid in &state.order {
            if let Some(item) = state.items.get(guid) {
                let value = serde_json::to_value(item).expect("RuntimeItem always serializes");
                ordered.insert(guid.clone(), value);
            }
        }
        serde_json::to_vec_pretty(&ordered).expect("registry snapshot always serializes")
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the snapshot file as an ordered list of `(guid, item)` pairs, preserving the file's
/// key order (and therefore the original insertion order) rather than collapsing into a
/// lexicographically-sorted map.
pub fn load_snapshot(path: &std::path::Path) -> anyhow::Result<Vec<(String, RuntimeItem)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)?;
    map.into_iter()
        .map(|(guid, value)| Ok((guid, serde_json::from_value(value)?)))
        .collect()
}

fn write_snapshot(path: &std::path::Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Periodically flushes the registry to disk, mirroring the service's other interval-driven
/// background loops: a fixed-cadence `tokio::select!` over a tick and the shutdown signal.
pub async fn run_snapshotter(
    registry: std::sync::Arc<Registry>,
    path: std::path::PathBuf,
    shutdown: CancellationToken,
) {
    let mut interval = time::interval(SNAPSHOT_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_hash: Option<[u8; 32]> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                flush_if_changed(&registry, &path, &mut last_hash);
            }
            _ = shutdown.cancelled() => {
                flush_if_changed(&registry, &path, &mut last_hash);
                break;
            }
        }
    }
}

fn flush_if_changed(registry: &Registry, path: &std::path::Path, last_hash: &mut Option<[u8; 32]>) {
    let bytes = registry.snapshot_json();
    let hash: [u8; 32] = Sha256::digest(&bytes).into();
    if last_hash.as_ref() == Some(&hash) {
        return;
    }
    match write_snapshot(path, &bytes) {
        Ok(()) => *last_hash = Some(hash),
        Err(err) => error!("failed to write registry snapshot to {path:?}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::BodyPart;

    fn sample_message() -> MailMessage {
        MailMessage {
            guid: "job-1".to_string(),
            from_user: Some("mailer".to_string()),
            from_name: Some("Mailer".to_string()),
            address_to: "dest@example.com".to_string(),
            subject: "hi".to_string(),
            data: vec![BodyPart::Text {
                text: "hello".to_string(),
                subtype: "plain".to_string(),
                charset: "utf-8".to_string(),
            }],
            send_timeout: Some(30),
            ignore_starttls_cert: Some(false),
        }
    }

    #[test]
    fn insert_and_get_roundtrips() {
        let registry = Registry::new();
        registry.insert("job-1".to_string(), RuntimeItem::new(sample_message()));
        let item = registry.get("job-1").expect("item present");
        assert_eq!(item.state, JobState::Sending);
        assert!(item.events.is_empty());
    }

    #[test]
    fn append_event_records_and_logs() {
        let registry = Registry::new();
        registry.insert("job-1".to_string(), RuntimeItem::new(sample_message()));
        registry.append_event("job-1", "mailer", "mx servers for target_address: mx.example.com");
        let item = registry.get("job-1").unwrap();
        assert_eq!(item.events.len(), 1);
        assert_eq!(item.events[0].source, "mailer");
    }

    #[test]
    fn set_state_transitions() {
        let registry = Registry::new();
        registry.insert("job-1".to_string(), RuntimeItem::new(sample_message()));
        registry.set_state("job-1", JobState::Sended);
        assert_eq!(registry.get("job-1").unwrap().state, JobState::Sended);
    }

    #[test]
    fn remove_drops_entry() {
        let registry = Registry::new();
        registry.insert("job-1".to_string(), RuntimeItem::new(sample_message()));
        let removed = registry.remove("job-1");
        assert!(removed.is_some());
        assert!(registry.get("job-1").is_none());
    }

    #[test]
    fn without_attachment_bodies_strips_payload() {
        let mut message = sample_message();
        message.data.push(BodyPart::Attachment {
            name: "f.txt".to_string(),
            content_type: "text/plain".to_string(),
            content_b64: "aGVsbG8=".to_string(),
        });
        let item = RuntimeItem::new(message);
        let view = item.without_attachment_bodies();
        match &view.message.data[1] {
            BodyPart::Attachment { content_b64, .. } => assert!(content_b64.is_empty()),
            _ => panic!("expected attachment"),
        }
    }

    #[test]
    fn snapshot_preserves_insertion_order_over_guid_order() {
        let registry = Registry::new();
        // "job-z" sorts after "job-a" lexicographically but is inserted first.
        registry.insert("job-z".to_string(), RuntimeItem::new(sample_message()));
        registry.insert("job-a".to_string(), RuntimeItem::new(sample_message()));

        let bytes = registry.snapshot_json();
        let text = String::from_utf8(bytes).unwrap();
        let z_pos = text.find("job-z").unwrap();
        let a_pos = text.find("job-a").unwrap();
        assert!(z_pos < a_pos, "snapshot should keep insertion order, not sort by guid");

        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&text).unwrap();
        let keys: Vec<_> = map.keys().cloned().collect();
        assert_eq!(keys, vec!["job-z".to_string(), "job-a".to_string()]);
    }

    #[test]
    fn flush_if_changed_skips_unchanged_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Registry::new();
        registry.insert("job-1".to_string(), RuntimeItem::new(sample_message()));

        let mut last_hash = None;
        flush_if_changed(&registry, &path, &mut last_hash);
        let written = std::fs::read(&path).unwrap();
        assert!(last_hash.is_some());

        flush_if_changed(&registry, &path, &mut last_hash);
        let written_again = std::fs::read(&path).unwrap();
        assert_eq!(written, written_again);
    }
}
