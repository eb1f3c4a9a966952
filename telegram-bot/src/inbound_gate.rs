//! InboundGate: two layers of inbound deduplication.
//!
//! - In-memory: `message_id -> received_at_ms`, TTL 30 min, LRU cap 1 000,
//!   throttled sweep every 5 min. Absorbs websocket-reconnect re-delivery
//!   bursts.
//! - Persistent per-chat [`InboundState`]: recent-id ring plus a watermark
//!   (`last_processed_sent_at_ms`) used to detect out-of-order stale
//!   deliveries.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

const MEMORY_TTL: Duration = Duration::from_secs(30 * 60);
const MEMORY_CAP: usize = 1_000;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// In-memory TTL + LRU dedup map. Not persisted; exists only to absorb
/// redelivery bursts within one process lifetime.
pub struct MemoryDedup {
    inner: Mutex<MemoryDedupInner>,
}

struct MemoryDedupInner {
    entries: HashMap<String, Instant>,
    order: VecDeque<String>,
    last_sweep: Instant,
}

impl Default for MemoryDedup {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MemoryDedupInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                last_sweep: Instant::now(),
            }),
        }
    }
}

impl MemoryDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `id` was already recorded (i.e. it's a duplicate);
    /// otherwise inserts it, evicting the oldest entry at capacity, and
    /// returns `true`.
    pub fn try_record(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.sweep_if_due(&mut inner);

        if inner.entries.contains_key(id) {
            return false;
        }

        if inner.order.len() >= MEMORY_CAP {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }

        inner.entries.insert(id.to_string(), Instant::now());
        inner.order.push_back(id.to_string());
        true
    }

    fn sweep_if_due(&self, inner: &mut MemoryDedupInner) {
        let now = Instant::now();
        if now.duration_since(inner.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        inner.last_sweep = now;
        inner.entries.retain(|_, at| now.duration_since(*at) < MEMORY_TTL);
        inner.order.retain(|id| inner.entries.contains_key(id));
    }
}

/// Persisted per-`(account_id, chat_id)` watermark and recent-id ring.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundState {
    pub last_processed_sent_at_ms: i64,
    #[serde(default)]
    pub recent_message_ids: VecDeque<String>,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug)]
pub struct StaleDropConfig {
    pub enabled: bool,
    pub reply: bool,
    pub skew_window_ms: i64,
    pub recent_ids_limit: usize,
}

impl Default for StaleDropConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reply: true,
            skew_window_ms: 5_000,
            recent_ids_limit: 250,
        }
    }
}

pub enum GateDecision {
    /// Process the event; `sent_at_ms` should be folded into the watermark.
    Admit,
    /// Drop silently: already seen in the recent-id ring.
    DuplicateInRing,
    /// Drop as stale out-of-order; if `notify` is set the caller should send
    /// the configured stale-drop reply. `watermark_ms` is the
    /// `last_processed_sent_at_ms` the event was measured against, for
    /// rendering the notice.
    Stale { notify: bool, watermark_ms: i64 },
}

/// File-backed per-chat inbound state. All persistence here is best-effort;
/// callers log and continue on error rather than blocking message handling.
pub struct InboundGate {
    state_dir: PathBuf,
    memory_dedup: MemoryDedup,
}

impl InboundGate {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            memory_dedup: MemoryDedup::new(),
        }
    }

    /// The in-memory redelivery-burst dedup layer, checked before the
    /// persistent per-chat gate in [`InboundGate::admit`].
    pub fn memory_dedup(&self) -> &MemoryDedup {
        &self.memory_dedup
    }

    pub fn path_for(&self, account_id: &str, chat_id: &str) -> PathBuf {
        let encoded_chat_id = urlencoding::encode(chat_id);
        self.state_dir
            .join("telegram")
            .join("inbound")
            .join(format!("{account_id}-{encoded_chat_id}.json"))
    }

    async fn read(&self, account_id: &str, chat_id: &str) -> (PathBuf, InboundState) {
        let path = self.path_for(account_id, chat_id);
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => InboundState::default(),
        };
        (path, state)
    }

    async fn write(&self, path: &Path, state: &InboundState) -> Result<(), GatewayError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Evaluates one inbound event against the persistent per-chat state,
    /// updating and persisting the state as a side effect. Persistence
    /// failures are logged and swallowed; they never block message handling.
    pub async fn admit(
        &self,
        account_id: &str,
        chat_id: &str,
        event_id: &str,
        sent_at_ms: i64,
        cfg: &StaleDropConfig,
    ) -> GateDecision {
        let (path, mut state) = self.read(account_id, chat_id).await;

        if state.recent_message_ids.iter().any(|id| id == event_id) {
            return GateDecision::DuplicateInRing;
        }

        let is_stale =
            cfg.enabled && sent_at_ms < state.last_processed_sent_at_ms - cfg.skew_window_ms;

        if is_stale {
            let watermark_ms = state.last_processed_sent_at_ms;
            push_recent(&mut state, event_id, cfg.recent_ids_limit);
            state.updated_at_ms = crate::types::now_ms();
            if let Err(e) = self.write(&path, &state).await {
                tracing::warn!(error = %e, "failed to persist inbound state after stale drop");
            }
            return GateDecision::Stale { notify: cfg.reply, watermark_ms };
        }

        push_recent(&mut state, event_id, cfg.recent_ids_limit);
        state.last_processed_sent_at_ms = state.last_processed_sent_at_ms.max(sent_at_ms);
        state.updated_at_ms = crate::types::now_ms();
        if let Err(e) = self.write(&path, &state).await {
            tracing::warn!(error = %e, "failed to persist inbound state after admit");
        }
        GateDecision::Admit
    }
}

fn push_recent(state: &mut InboundState, event_id: &str, limit: usize) {
    state.recent_message_ids.push_back(event_id.to_string());
    while state.recent_message_ids.len() > limit {
        state.recent_message_ids.pop_front();
    }
}

pub const STALE_REPLY_ZH: &str = "过期消息，被忽略";
pub const STALE_REPLY_EN: &str = "Stale message, ignored";

/// Renders the stale-drop notice text in the given locale.
pub fn render_stale_reply(locale: &str, event_sent_at_ms: i64, watermark_ms: i64) -> String {
    let header = if locale == "en" { STALE_REPLY_EN } else { STALE_REPLY_ZH };
    format!(
        "{header} (event_sent_at={event_sent_at_ms}, watermark={watermark_ms}, reason=out_of_order_delivery)"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_for_url_encodes_chat_id_per_spec_filename_contract() {
        let gate = InboundGate::new("/tmp/state");
        let path = gate.path_for("acct", "@some/channel");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(
            name,
            format!("acct-{}.json", urlencoding::encode("@some/channel"))
        );
        assert!(!name.contains('/'), "encoded chat id must not introduce path separators");
    }

    #[test]
    fn memory_dedup_rejects_repeat_id() {
        let dedup = MemoryDedup::new();
        assert!(dedup.try_record("om_x"));
        assert!(!dedup.try_record("om_x"));
    }

    #[test]
    fn memory_dedup_evicts_oldest_at_capacity() {
        let dedup = MemoryDedup::new();
        for i in 0..MEMORY_CAP {
            assert!(dedup.try_record(&format!("id-{i}")));
        }
        // At capacity: inserting one more evicts "id-0".
        assert!(dedup.try_record("id-overflow"));
        assert!(dedup.try_record("id-0"));
    }

    #[tokio::test]
    async fn admit_allows_first_delivery_and_rejects_ring_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let gate = InboundGate::new(dir.path());
        let cfg = StaleDropConfig::default();

        let d1 = gate.admit("acct", "chat1", "om_x", 1_000, &cfg).await;
        assert!(matches!(d1, GateDecision::Admit));

        let d2 = gate.admit("acct", "chat1", "om_x", 1_000, &cfg).await;
        assert!(matches!(d2, GateDecision::DuplicateInRing));
    }

    #[tokio::test]
    async fn admit_drops_stale_out_of_order_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let gate = InboundGate::new(dir.path());
        let cfg = StaleDropConfig {
            skew_window_ms: 0,
            ..Default::default()
        };

        // Seed watermark to 2000 via a fresh delivery.
        let seed = gate.admit("acct", "chat1", "seed", 2_000, &cfg).await;
        assert!(matches!(seed, GateDecision::Admit));

        let decision = gate.admit("acct", "chat1", "om_old", 1_000, &cfg).await;
        match decision {
            GateDecision::Stale { notify, watermark_ms } => {
                assert!(notify);
                assert_eq!(watermark_ms, 2_000);
            }
            _ => panic!("expected stale drop"),
        }
    }

    #[tokio::test]
    async fn watermark_is_monotone_nondecreasing() {
        let dir = tempfile::tempdir().unwrap();
        let gate = InboundGate::new(dir.path());
        let cfg = StaleDropConfig::default();

        gate.admit("acct", "chat1", "m1", 5_000, &cfg).await;
        gate.admit("acct", "chat1", "m2", 3_000, &cfg).await;

        let (_, state) = gate.read("acct", "chat1").await;
        assert_eq!(state.last_processed_sent_at_ms, 5_000);
    }

    #[test]
    fn stale_reply_contains_required_markers() {
        let msg = render_stale_reply("zh", 1_000, 2_000);
        assert!(msg.contains("过期消息"));
        assert!(msg.contains("reason=out_of_order_delivery"));
    }
}
