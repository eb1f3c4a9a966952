//! Session transcript types and the `SessionManager` collaborator contract.
//!
//! `loom`'s own `Message` enum (system/user/assistant) has no tool-call or
//! tool-result role, so the gateway defines its own richer transcript message
//! here — a tagged record (distilled spec §9 design note) rather than a loose
//! map — covering the four roles strict agent providers expect to see paired.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum SessionMessage {
    System {
        text: String,
    },
    User {
        text: String,
    },
    Assistant {
        #[serde(default)]
        text: String,
        #[serde(default)]
        tool_calls: Vec<ToolCallRecord>,
    },
    ToolResult {
        tool_call_id: String,
        text: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        is_synthetic: bool,
    },
}

impl SessionMessage {
    pub fn is_tool_result(&self) -> bool {
        matches!(self, SessionMessage::ToolResult { .. })
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, SessionMessage::Assistant { .. })
    }
}

/// Persists one transcript entry. Implementations own the actual storage
/// (e.g. a `loom` checkpointer, a flat JSONL file); the guard wraps whatever
/// is given.
#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn append_message(&self, msg: SessionMessage) -> Result<(), GatewayError>;
    fn session_file(&self) -> Option<std::path::PathBuf>;
}

/// In-memory session manager: accumulates entries for tests and for the
/// `entries()` collaborator contract method.
#[derive(Default)]
pub struct InMemorySessionManager {
    entries: tokio::sync::Mutex<Vec<SessionMessage>>,
}

impl InMemorySessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<SessionMessage> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
    async fn append_message(&self, msg: SessionMessage) -> Result<(), GatewayError> {
        self.entries.lock().await.push(msg);
        Ok(())
    }

    fn session_file(&self) -> Option<std::path::PathBuf> {
        None
    }
}
