//! AnnounceQueue: per-destination follow-up/collect queue with debounce,
//! capacity caps, drop policies, staleness eviction, and retry-safe draining.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueMode {
    Followup,
    Collect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropPolicy {
    Summarize,
    Oldest,
    Newest,
}

#[derive(Clone, Debug)]
pub struct AnnounceOrigin {
    pub channel: String,
}

#[derive(Clone, Debug)]
pub struct AnnounceQueueItem {
    pub announce_id: Option<String>,
    pub prompt: String,
    pub summary_line: Option<String>,
    pub enqueued_at_ms: i64,
    pub session_key: String,
    pub origin: Option<AnnounceOrigin>,
    pub origin_key: Option<String>,
    pub high_priority: bool,
}

#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub mode: QueueMode,
    pub debounce_ms: u64,
    pub cap: usize,
    pub drop_policy: DropPolicy,
    pub max_age_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            mode: QueueMode::Followup,
            debounce_ms: 1_000,
            cap: 20,
            drop_policy: DropPolicy::Summarize,
            max_age_ms: 10 * 60 * 1_000,
        }
    }
}

/// Delivery callback used by the drain loop. A failed send must not drop the
/// item; the drain records `last_enqueued_at` so debounce re-applies and
/// exits, relying on the `finally`-style reschedule to retry later.
#[async_trait]
pub trait AnnounceSend: Send + Sync {
    async fn send(&self, item: &AnnounceQueueItem) -> Result<(), GatewayError>;
}

struct QueueState {
    items: Vec<AnnounceQueueItem>,
    draining: bool,
    last_enqueued_at_ms: i64,
    settings: QueueSettings,
    dropped_count: usize,
    summary_lines: Vec<String>,
    send: Arc<dyn AnnounceSend>,
    force_individual_collect: bool,
}

/// Keyed announce queue coordinator. One [`QueueState`] per key, created on
/// first enqueue and removed once `items` and `dropped_count` both reach zero
/// and no drain is running.
#[derive(Clone)]
pub struct AnnounceQueue {
    queues: Arc<DashMap<String, Arc<Mutex<QueueState>>>>,
}

impl Default for AnnounceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnounceQueue {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
        }
    }

    /// Clears all queue state. For worker isolation in tests only.
    pub fn reset_for_tests(&self) {
        self.queues.clear();
    }

    pub async fn enqueue(
        &self,
        key: &str,
        item: AnnounceQueueItem,
        settings: QueueSettings,
        send: Arc<dyn AnnounceSend>,
    ) -> bool {
        let entry = self
            .queues
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(QueueState {
                    items: Vec::new(),
                    draining: false,
                    last_enqueued_at_ms: 0,
                    settings: settings.clone(),
                    dropped_count: 0,
                    summary_lines: Vec::new(),
                    send: send.clone(),
                    force_individual_collect: false,
                }))
            })
            .clone();

        let accepted = {
            let mut state = entry.lock().await;
            state.settings = settings;
            state.send = send;

            if state.items.len() >= state.settings.cap {
                match state.settings.drop_policy {
                    DropPolicy::Newest => false,
                    DropPolicy::Oldest | DropPolicy::Summarize => {
                        if let Some(dropped) = state.items.first().cloned() {
                            state.items.remove(0);
                            if let Some(line) = dropped.summary_line.clone() {
                                state.summary_lines.push(line);
                            } else {
                                state.summary_lines.push(dropped.prompt.clone());
                            }
                            state.dropped_count += 1;
                        }
                        true
                    }
                }
            } else {
                true
            }
        };

        if !accepted {
            return false;
        }

        {
            let mut state = entry.lock().await;
            state.last_enqueued_at_ms = item.enqueued_at_ms;
            state.items.push(item);
        }

        self.schedule_drain(key.to_string(), entry);
        true
    }

    fn schedule_drain(&self, key: String, state: Arc<Mutex<QueueState>>) {
        let queues = self.queues.clone();
        tokio::spawn(async move {
            {
                let mut guard = state.lock().await;
                if guard.draining {
                    return;
                }
                guard.draining = true;
            }

            drain_loop(&key, &state, &queues).await;

            let mut guard = state.lock().await;
            guard.draining = false;
            let empty = guard.items.is_empty() && guard.dropped_count == 0;
            drop(guard);
            if empty {
                queues.remove(&key);
            }
        });
    }
}

async fn drain_loop(key: &str, state: &Arc<Mutex<QueueState>>, _queues: &Arc<DashMap<String, Arc<Mutex<QueueState>>>>) {
    loop {
        let should_continue = {
            let guard = state.lock().await;
            !guard.items.is_empty() || guard.dropped_count > 0
        };
        if !should_continue {
            return;
        }

        let (debounce_ms, last_enqueued_at_ms) = {
            let guard = state.lock().await;
            (guard.settings.debounce_ms, guard.last_enqueued_at_ms)
        };
        wait_for_debounce(last_enqueued_at_ms, debounce_ms).await;

        drop_stale_items(state).await;

        let mode = state.lock().await.settings.mode;
        match mode {
            QueueMode::Collect => drain_collect(key, state).await,
            QueueMode::Followup => drain_followup(key, state).await,
        }
    }
}

async fn wait_for_debounce(last_enqueued_at_ms: i64, debounce_ms: u64) {
    let now_ms = crate::types::now_ms();
    let elapsed = (now_ms - last_enqueued_at_ms).max(0) as u64;
    if elapsed < debounce_ms {
        tokio::time::sleep_until(Instant::now() + Duration::from_millis(debounce_ms - elapsed)).await;
    }
}

async fn drop_stale_items(state: &Arc<Mutex<QueueState>>) {
    let mut guard = state.lock().await;
    let max_age_ms = guard.settings.max_age_ms;
    if max_age_ms == 0 {
        return;
    }
    let now_ms = crate::types::now_ms();
    guard.items.retain(|item| {
        item.high_priority || (now_ms - item.enqueued_at_ms) as u64 <= max_age_ms
    });
}

fn build_summary_block(summary_lines: &[String], dropped_count: usize) -> Option<String> {
    if summary_lines.is_empty() && dropped_count == 0 {
        return None;
    }
    let mut block = String::from("\n\n[Queue overflow — earlier items summarized]\n");
    for line in summary_lines {
        block.push_str("- ");
        block.push_str(line);
        block.push('\n');
    }
    if dropped_count > summary_lines.len() {
        block.push_str(&format!(
            "- ({} additional item(s) dropped)\n",
            dropped_count - summary_lines.len()
        ));
    }
    Some(block)
}

async fn send_one(
    key: &str,
    state: &Arc<Mutex<QueueState>>,
    item: AnnounceQueueItem,
) -> bool {
    let send = state.lock().await.send.clone();
    match send.send(&item).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(key, error = %e, "announce send failed, will retry after debounce");
            let mut guard = state.lock().await;
            guard.last_enqueued_at_ms = crate::types::now_ms();
            false
        }
    }
}

async fn drain_followup(key: &str, state: &Arc<Mutex<QueueState>>) {
    let (next, summary_block) = {
        let guard = state.lock().await;
        let next = guard.items.first().cloned();
        let summary_block = build_summary_block(&guard.summary_lines, guard.dropped_count);
        (next, summary_block)
    };
    let Some(mut item) = next else { return };

    if let Some(block) = summary_block {
        item.prompt = format!("[Queue overflow]\n{block}");
        if send_one(key, state, item).await {
            let mut guard = state.lock().await;
            guard.summary_lines.clear();
            guard.dropped_count = 0;
        }
        return;
    }

    if send_one(key, state, item).await {
        let mut guard = state.lock().await;
        if !guard.items.is_empty() {
            guard.items.remove(0);
        }
    }
}

async fn drain_collect(key: &str, state: &Arc<Mutex<QueueState>>) {
    let (items, summary_block, force_individual, cross_channel) = {
        let guard = state.lock().await;
        let items = guard.items.clone();
        let summary_block = build_summary_block(&guard.summary_lines, guard.dropped_count);
        let channels: std::collections::HashSet<_> = items
            .iter()
            .filter_map(|i| i.origin.as_ref().map(|o| o.channel.clone()))
            .collect();
        (items, summary_block, guard.force_individual_collect, channels.len() > 1)
    };

    if items.is_empty() {
        return;
    }

    if force_individual || cross_channel {
        {
            let mut guard = state.lock().await;
            guard.force_individual_collect = true;
        }
        let first = items.into_iter().next().unwrap();
        if send_one(key, state, first).await {
            let mut guard = state.lock().await;
            if !guard.items.is_empty() {
                guard.items.remove(0);
            }
        }
        return;
    }

    let mut prompt = String::from("[Queued announce messages while agent was busy]\n");
    for (i, item) in items.iter().enumerate() {
        prompt.push_str(&format!("---\nQueued #{}\n{}\n", i + 1, item.prompt));
    }
    if let Some(block) = summary_block {
        prompt.push_str(&block);
    }

    let mut combined = items.last().unwrap().clone();
    combined.prompt = prompt;

    if send_one(key, state, combined).await {
        let mut guard = state.lock().await;
        guard.items.clear();
        guard.summary_lines.clear();
        guard.dropped_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSend {
        prompts: Arc<Mutex<Vec<String>>>,
        fail_first_n: AtomicUsize,
    }

    #[async_trait]
    impl AnnounceSend for RecordingSend {
        async fn send(&self, item: &AnnounceQueueItem) -> Result<(), GatewayError> {
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                return Err(GatewayError::provider("gateway timeout after 60000ms"));
            }
            self.prompts.lock().await.push(item.prompt.clone());
            Ok(())
        }
    }

    fn item(prompt: &str, key: &str) -> AnnounceQueueItem {
        AnnounceQueueItem {
            announce_id: None,
            prompt: prompt.to_string(),
            summary_line: None,
            enqueued_at_ms: crate::types::now_ms(),
            session_key: key.to_string(),
            origin: None,
            origin_key: None,
            high_priority: false,
        }
    }

    #[tokio::test]
    async fn retry_resends_same_item_after_failure() {
        let queue = AnnounceQueue::new();
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let send = Arc::new(RecordingSend {
            prompts: prompts.clone(),
            fail_first_n: AtomicUsize::new(1),
        });

        let settings = QueueSettings {
            debounce_ms: 0,
            ..Default::default()
        };
        queue
            .enqueue("k1", item("hello", "s1"), settings, send)
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(prompts.lock().await.is_empty(), "first send should have failed without recording");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let got = prompts.lock().await.clone();
        assert_eq!(got, vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn collect_mode_combines_items_into_one_prompt() {
        let queue = AnnounceQueue::new();
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let send = Arc::new(RecordingSend {
            prompts: prompts.clone(),
            fail_first_n: AtomicUsize::new(0),
        });
        let settings = QueueSettings {
            mode: QueueMode::Collect,
            debounce_ms: 0,
            ..Default::default()
        };

        queue
            .enqueue("k2", item("queued item one", "s1"), settings.clone(), send.clone())
            .await;
        queue
            .enqueue("k2", item("queued item two", "s1"), settings, send)
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let got = prompts.lock().await.clone();
        assert_eq!(got.len(), 1);
        assert!(got[0].contains("Queued #1"));
        assert!(got[0].contains("queued item one"));
        assert!(got[0].contains("Queued #2"));
        assert!(got[0].contains("queued item two"));
    }

    #[tokio::test]
    async fn stale_items_are_dropped_unless_high_priority() {
        let queue = AnnounceQueue::new();
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let send = Arc::new(RecordingSend {
            prompts: prompts.clone(),
            fail_first_n: AtomicUsize::new(0),
        });
        let settings = QueueSettings {
            debounce_ms: 0,
            max_age_ms: 10,
            ..Default::default()
        };

        let mut stale = item("old", "s1");
        stale.enqueued_at_ms = crate::types::now_ms() - 60_000;
        stale.high_priority = true;
        queue.enqueue("k3", stale, settings, send).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let got = prompts.lock().await.clone();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn newest_drop_policy_rejects_new_item_at_cap() {
        let queue = AnnounceQueue::new();
        let send = Arc::new(RecordingSend {
            prompts: Arc::new(Mutex::new(Vec::new())),
            fail_first_n: AtomicUsize::new(0),
        });
        let settings = QueueSettings {
            cap: 1,
            drop_policy: DropPolicy::Newest,
            debounce_ms: 60_000,
            ..Default::default()
        };
        let accepted1 = queue.enqueue("k4", item("a", "s1"), settings.clone(), send.clone()).await;
        assert!(accepted1);
        let accepted2 = queue.enqueue("k4", item("b", "s1"), settings, send).await;
        assert!(!accepted2);
    }
}
