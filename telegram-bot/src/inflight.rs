//! InFlightStore: atomic, file-backed journal of per-anchor task records.
//!
//! One file per `account_id`: `{version, tasks, last_interruptible_by_chat_id}`.
//! All mutations follow read → transform → write under a per-file lock; the
//! write itself goes through a `.tmp` + rename so a crash mid-write leaves the
//! previous committed store intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::types::{now_ms, ChatType, Reaction, TaskState};

pub const ORIGINAL_TEXT_MAX_CHARS: usize = 8_000;
pub const MAX_RESUME_ATTEMPTS: u32 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightTask {
    pub id: String,
    pub provider: String,
    pub account_id: String,
    pub chat_id: String,
    pub chat_type: ChatType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_open_id: Option<String>,
    pub message_id: String,
    pub original_text: String,
    pub truncated: bool,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction: Option<Reaction>,
    pub resume_attempts: u32,
    pub updated_at_ms: i64,
    pub interrupted_handled: bool,
    pub run_id: String,
}

impl InFlightTask {
    /// Builds a new task anchored on `message_id`, clamping `original_text` to
    /// [`ORIGINAL_TEXT_MAX_CHARS`] and setting `truncated` accordingly.
    pub fn new(
        provider: impl Into<String>,
        account_id: impl Into<String>,
        chat_id: impl Into<String>,
        chat_type: ChatType,
        user_open_id: Option<String>,
        message_id: impl Into<String>,
        original_text: impl Into<String>,
    ) -> Self {
        let original_text = original_text.into();
        let (clamped, truncated) = clamp_text(&original_text, ORIGINAL_TEXT_MAX_CHARS);
        Self {
            id: create_id(),
            provider: provider.into(),
            account_id: account_id.into(),
            chat_id: chat_id.into(),
            chat_type,
            user_open_id,
            message_id: message_id.into(),
            original_text: clamped,
            truncated,
            state: TaskState::Received,
            reaction: None,
            resume_attempts: 0,
            updated_at_ms: now_ms(),
            interrupted_handled: false,
            run_id: create_id(),
        }
    }

    pub fn transition(&mut self, next: TaskState) {
        self.state = next;
        self.updated_at_ms = now_ms();
    }
}

/// Clamps `text` to at most `max_chars` chars (not bytes), returning the
/// clamped string and whether truncation occurred.
fn clamp_text(text: &str, max_chars: usize) -> (String, bool) {
    let count = text.chars().count();
    if count <= max_chars {
        (text.to_string(), false)
    } else {
        (text.chars().take(max_chars).collect(), true)
    }
}

/// Creates a UUID v4-style opaque id.
pub fn create_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightStoreFile {
    pub version: u32,
    pub tasks: Vec<InFlightTask>,
    #[serde(default)]
    pub last_interruptible_by_chat_id: HashMap<String, String>,
}

impl InFlightStoreFile {
    fn new() -> Self {
        Self {
            version: 1,
            tasks: Vec::new(),
            last_interruptible_by_chat_id: HashMap::new(),
        }
    }

    pub fn find_by_task_id(&self, task_id: &str) -> Option<&InFlightTask> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn find_by_anchor(&self, account_id: &str, message_id: &str) -> Option<&InFlightTask> {
        self.tasks
            .iter()
            .find(|t| t.account_id == account_id && t.message_id == message_id)
    }

    /// Inserts or replaces the task with the same `id`.
    pub fn upsert_task(&mut self, task: InFlightTask) {
        if let Some(slot) = self.tasks.iter_mut().find(|t| t.id == task.id) {
            *slot = task;
        } else {
            self.tasks.push(task);
        }
    }

    pub fn remove_task(&mut self, task_id: &str) {
        self.tasks.retain(|t| t.id != task_id);
    }

    pub fn set_last_interruptible(&mut self, chat_id: impl Into<String>, task_id: impl Into<String>) {
        self.last_interruptible_by_chat_id
            .insert(chat_id.into(), task_id.into());
    }

    pub fn get_last_interruptible_task(&self, chat_id: &str) -> Option<&InFlightTask> {
        self.last_interruptible_by_chat_id
            .get(chat_id)
            .and_then(|task_id| self.find_by_task_id(task_id))
    }
}

/// File-backed journal for one `account_id`. Atomicity is per-file: callers
/// serialize writes for the same file (the [`crate::task_coordinator::GatewayCoordinator`]
/// holds a per-`account_id` lock).
pub struct InFlightStore {
    state_dir: PathBuf,
}

impl InFlightStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path_for(&self, account_id: &str) -> PathBuf {
        self.state_dir
            .join("telegram")
            .join("inflight")
            .join(format!("{account_id}-store.json"))
    }

    /// Reads and parses the store for `account_id`. Missing or corrupt files
    /// yield an empty store rather than an error — this is best-effort
    /// persistence, not a source of truth that must never be lost.
    pub async fn read(&self, account_id: &str) -> (PathBuf, InFlightStoreFile) {
        let path = self.path_for(account_id);
        let store = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "inflight store corrupt, starting empty");
                InFlightStoreFile::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => InFlightStoreFile::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "inflight store unreadable, starting empty");
                InFlightStoreFile::new()
            }
        };
        (path, store)
    }

    /// JSON-serializes `store` and writes it to `path` via `path.tmp` + rename.
    pub async fn write(&self, path: &Path, store: &InFlightStoreFile) -> Result<(), GatewayError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(store)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_text_sets_truncated_only_when_over_limit() {
        let (short, truncated) = clamp_text("hello", 8_000);
        assert_eq!(short, "hello");
        assert!(!truncated);

        let long = "a".repeat(9_000);
        let (clamped, truncated) = clamp_text(&long, 8_000);
        assert_eq!(clamped.chars().count(), 8_000);
        assert!(truncated);
    }

    #[test]
    fn upsert_replaces_existing_task_by_id() {
        let mut store = InFlightStoreFile::new();
        let mut task = InFlightTask::new(
            "telegram",
            "acct",
            "123",
            ChatType::Direct,
            None,
            "m1",
            "hi",
        );
        store.upsert_task(task.clone());
        assert_eq!(store.tasks.len(), 1);

        task.transition(TaskState::Queued);
        store.upsert_task(task.clone());
        assert_eq!(store.tasks.len(), 1);
        assert_eq!(store.tasks[0].state, TaskState::Queued);
    }

    #[test]
    fn last_interruptible_round_trip() {
        let mut store = InFlightStoreFile::new();
        let task = InFlightTask::new("telegram", "acct", "123", ChatType::Group, None, "m1", "hi");
        store.upsert_task(task.clone());
        store.set_last_interruptible("123", task.id.clone());
        let found = store.get_last_interruptible_task("123").unwrap();
        assert_eq!(found.id, task.id);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = InFlightStore::new(dir.path());
        let (path, mut file) = store.read("acct1").await;
        assert!(file.tasks.is_empty());

        let task = InFlightTask::new("telegram", "acct1", "123", ChatType::Direct, None, "m1", "hi");
        file.upsert_task(task.clone());
        store.write(&path, &file).await.unwrap();

        let (_, reread) = store.read("acct1").await;
        assert_eq!(reread.tasks.len(), 1);
        assert_eq!(reread.tasks[0].id, task.id);
    }

    #[tokio::test]
    async fn read_missing_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = InFlightStore::new(dir.path());
        let (_, file) = store.read("never-written").await;
        assert!(file.tasks.is_empty());
        assert_eq!(file.version, 1);
    }

    #[tokio::test]
    async fn read_corrupt_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = InFlightStore::new(dir.path());
        let path = store.path_for("acct2");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"not json").await.unwrap();
        let (_, file) = store.read("acct2").await;
        assert!(file.tasks.is_empty());
    }
}
