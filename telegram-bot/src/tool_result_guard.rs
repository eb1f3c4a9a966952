//! ToolResultGuard: transcript append interceptor.
//!
//! Installed once per session as a decorator (distilled spec §9 design
//! note — not a runtime monkey-patch of `append_message`). Pairs assistant
//! tool calls with tool results, caps oversized results, and annotates
//! recoverable tool errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::session::{SessionManager, SessionMessage, ToolCallRecord};

pub const HARD_MAX_TOOL_RESULT_CHARS: usize = 25_000;
const TRUNCATION_SUFFIX: &str = "\n\n⚠️ [Content truncated during persistence — original exceeded size limit. Use offset/limit parameters or request specific sections for large content.]";
const RECOVERABLE_MARKER: &str = "[RECOVERABLE_TOOL_ERROR]";

/// User-supplied transform applied to tool-result text before persistence
/// (e.g. redaction). Defaults to identity.
pub trait ToolResultTransform: Send + Sync {
    fn transform(&self, text: String) -> String;
}

pub struct IdentityTransform;
impl ToolResultTransform for IdentityTransform {
    fn transform(&self, text: String) -> String {
        text
    }
}

/// Before-write hook: may block (return `Ok(None)`) or substitute the
/// message before it reaches the inner session manager.
#[async_trait]
pub trait BeforeWriteHook: Send + Sync {
    async fn before_write(&self, msg: SessionMessage) -> Option<SessionMessage>;
}

pub struct PassThroughHook;
#[async_trait]
impl BeforeWriteHook for PassThroughHook {
    async fn before_write(&self, msg: SessionMessage) -> Option<SessionMessage> {
        Some(msg)
    }
}

/// Wraps a [`SessionManager`] with the pairing/cap/annotation guard.
pub struct GuardedSessionManager<S: SessionManager> {
    inner: Arc<S>,
    pending: Mutex<HashMap<String, Option<String>>>,
    transform: Arc<dyn ToolResultTransform>,
    hook: Arc<dyn BeforeWriteHook>,
}

impl<S: SessionManager> GuardedSessionManager<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            pending: Mutex::new(HashMap::new()),
            transform: Arc::new(IdentityTransform),
            hook: Arc::new(PassThroughHook),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn ToolResultTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn BeforeWriteHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Current set of tool-call ids awaiting a paired result.
    pub async fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }

    /// Flushes pending tool calls as synthetic placeholder results. Called
    /// both mid-stream (before a non-tool-result message) and explicitly on
    /// shutdown.
    pub async fn flush_pending_tool_results(&self) -> Result<(), GatewayError> {
        let pending: Vec<(String, Option<String>)> = {
            let mut guard = self.pending.lock().await;
            let drained = guard.drain().collect();
            drained
        };
        for (call_id, _name) in pending {
            let synthetic = SessionMessage::ToolResult {
                tool_call_id: call_id,
                text: "[no result recorded — synthesized during flush]".to_string(),
                is_error: false,
                is_synthetic: true,
            };
            self.inner.append_message(synthetic).await?;
        }
        Ok(())
    }

    /// Appends one message, applying the full guard pipeline.
    pub async fn append_message(&self, msg: SessionMessage) -> Result<(), GatewayError> {
        match msg {
            SessionMessage::Assistant { text, tool_calls } => {
                let (text, tool_calls) = sanitize_assistant(text, tool_calls);
                if tool_calls.is_empty() && text.is_empty() {
                    self.flush_pending_tool_results().await?;
                    return Ok(());
                }
                self.record_pending(&tool_calls).await;
                self.persist(SessionMessage::Assistant { text, tool_calls }).await
            }
            SessionMessage::ToolResult {
                tool_call_id,
                text,
                is_error,
                is_synthetic,
            } => {
                self.pending.lock().await.remove(&tool_call_id);
                let capped = cap_tool_result_text(&text);
                let annotated = if is_synthetic {
                    capped
                } else {
                    annotate_recoverable(&capped, is_error)
                };
                self.persist(SessionMessage::ToolResult {
                    tool_call_id,
                    text: annotated,
                    is_error,
                    is_synthetic,
                })
                .await
            }
            other => {
                let is_empty_pending = self.pending.lock().await.is_empty();
                if !is_empty_pending {
                    self.flush_pending_tool_results().await?;
                }
                self.persist(other).await
            }
        }
    }

    async fn record_pending(&self, tool_calls: &[ToolCallRecord]) {
        let mut guard = self.pending.lock().await;
        for call in tool_calls {
            guard.insert(call.id.clone(), Some(call.name.clone()));
        }
    }

    async fn persist(&self, msg: SessionMessage) -> Result<(), GatewayError> {
        let msg = match msg {
            SessionMessage::ToolResult {
                tool_call_id,
                text,
                is_error,
                is_synthetic,
            } => SessionMessage::ToolResult {
                tool_call_id,
                text: self.transform.transform(text),
                is_error,
                is_synthetic,
            },
            other => other,
        };
        match self.hook.before_write(msg).await {
            Some(final_msg) => self.inner.append_message(final_msg).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<S: SessionManager> SessionManager for GuardedSessionManager<S> {
    async fn append_message(&self, msg: SessionMessage) -> Result<(), GatewayError> {
        GuardedSessionManager::append_message(self, msg).await
    }

    fn session_file(&self) -> Option<std::path::PathBuf> {
        self.inner.session_file()
    }
}

/// Drops malformed tool calls (empty id or name); if the sanitizer removes
/// every tool call and there's no text either, the caller flushes pending
/// results and drops the message entirely.
fn sanitize_assistant(text: String, tool_calls: Vec<ToolCallRecord>) -> (String, Vec<ToolCallRecord>) {
    let cleaned: Vec<ToolCallRecord> = tool_calls
        .into_iter()
        .filter(|c| !c.id.is_empty() && !c.name.is_empty())
        .collect();
    (text, cleaned)
}

/// Caps the collective text length at [`HARD_MAX_TOOL_RESULT_CHARS`],
/// preferring to cut at the last newline within the final 20% of the budget.
fn cap_tool_result_text(text: &str) -> String {
    if text.chars().count() <= HARD_MAX_TOOL_RESULT_CHARS {
        return text.to_string();
    }

    let budget = HARD_MAX_TOOL_RESULT_CHARS;
    let chars: Vec<char> = text.chars().collect();
    let hard_cut = budget.min(chars.len());
    let search_start = hard_cut.saturating_sub(budget / 5);

    let mut cut_at = hard_cut;
    for i in (search_start..hard_cut).rev() {
        if chars[i] == '\n' {
            cut_at = i;
            break;
        }
    }

    let mut truncated: String = chars[..cut_at].iter().collect();
    truncated.push_str(TRUNCATION_SUFFIX);
    truncated
}

fn edit_not_found_path(text: &str) -> Option<String> {
    let re = Regex::new(r"Could not find the exact text in ([^\s.]+(?:\.[^\s.]+)*)\.").ok()?;
    re.captures(text).map(|c| c[1].to_string())
}

fn edit_not_unique_occurrences(text: &str) -> Option<u32> {
    let re = Regex::new(r"Found (\d+) occurrences of the text").ok()?;
    re.captures(text).and_then(|c| c[1].parse().ok())
}

/// Annotates recoverable tool errors: only fires for non-synthetic errors
/// whose text doesn't already carry the marker.
fn annotate_recoverable(text: &str, is_error: bool) -> String {
    if !is_error || text.contains(RECOVERABLE_MARKER) {
        return text.to_string();
    }

    if let Some(path) = edit_not_found_path(text) {
        let payload = serde_json::json!({
            "kind": "EDIT_EXACT_MATCH_NOT_FOUND",
            "path": path,
            "recovery": [
                "re-read the file to get current contents",
                "use a smaller, more specific anchor string",
                "check for whitespace or line-ending differences",
            ],
        });
        return format!(
            "{text}\n\n{RECOVERABLE_MARKER}\n{}",
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        );
    }

    if let Some(occurrences) = edit_not_unique_occurrences(text) {
        let payload = serde_json::json!({
            "kind": "EDIT_NOT_UNIQUE",
            "occurrences": occurrences,
            "recovery": [
                "include more surrounding context to disambiguate",
                "target a narrower line range",
            ],
        });
        return format!(
            "{text}\n\n{RECOVERABLE_MARKER}\n{}",
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        );
    }

    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionManager;

    fn assistant_with_call(id: &str, name: &str) -> SessionMessage {
        SessionMessage::Assistant {
            text: String::new(),
            tool_calls: vec![ToolCallRecord {
                id: id.to_string(),
                name: name.to_string(),
                arguments: serde_json::json!({}),
            }],
        }
    }

    #[tokio::test]
    async fn edit_not_found_annotation_includes_path_and_marker() {
        let inner = Arc::new(InMemorySessionManager::new());
        let guard = GuardedSessionManager::new(inner.clone());

        guard.append_message(assistant_with_call("call_1", "edit")).await.unwrap();
        guard
            .append_message(SessionMessage::ToolResult {
                tool_call_id: "call_1".to_string(),
                text: "⚠️ Edit failed: Could not find the exact text in /tmp/example.md.".to_string(),
                is_error: true,
                is_synthetic: false,
            })
            .await
            .unwrap();

        let entries = inner.entries().await;
        let SessionMessage::ToolResult { text, .. } = &entries[1] else {
            panic!("expected tool result");
        };
        assert!(text.contains("[RECOVERABLE_TOOL_ERROR]"));
        assert!(text.contains("EDIT_EXACT_MATCH_NOT_FOUND"));
        assert!(text.contains("/tmp/example.md"));
    }

    #[tokio::test]
    async fn edit_not_unique_annotation_fires_for_multi_match() {
        let inner = Arc::new(InMemorySessionManager::new());
        let guard = GuardedSessionManager::new(inner.clone());

        guard.append_message(assistant_with_call("call_2", "edit")).await.unwrap();
        guard
            .append_message(SessionMessage::ToolResult {
                tool_call_id: "call_2".to_string(),
                text: "Found 3 occurrences of the text, please disambiguate".to_string(),
                is_error: true,
                is_synthetic: false,
            })
            .await
            .unwrap();

        let entries = inner.entries().await;
        let SessionMessage::ToolResult { text, .. } = &entries[1] else {
            panic!("expected tool result");
        };
        assert!(text.contains("EDIT_NOT_UNIQUE"));
        assert!(text.contains("\"occurrences\": 3"));
    }

    #[tokio::test]
    async fn non_tool_result_flushes_pending_as_synthetic() {
        let inner = Arc::new(InMemorySessionManager::new());
        let guard = GuardedSessionManager::new(inner.clone());

        guard.append_message(assistant_with_call("call_3", "bash")).await.unwrap();
        guard
            .append_message(SessionMessage::User {
                text: "next turn".to_string(),
            })
            .await
            .unwrap();

        let entries = inner.entries().await;
        assert_eq!(entries.len(), 3);
        match &entries[1] {
            SessionMessage::ToolResult { tool_call_id, is_synthetic, .. } => {
                assert_eq!(tool_call_id, "call_3");
                assert!(is_synthetic);
            }
            _ => panic!("expected synthetic tool result"),
        }
        assert!(matches!(entries[2], SessionMessage::User { .. }));
    }

    #[tokio::test]
    async fn size_cap_truncates_oversized_tool_result() {
        let inner = Arc::new(InMemorySessionManager::new());
        let guard = GuardedSessionManager::new(inner.clone());

        guard.append_message(assistant_with_call("call_4", "read")).await.unwrap();
        let big = "x".repeat(HARD_MAX_TOOL_RESULT_CHARS + 5_000);
        guard
            .append_message(SessionMessage::ToolResult {
                tool_call_id: "call_4".to_string(),
                text: big,
                is_error: false,
                is_synthetic: false,
            })
            .await
            .unwrap();

        let entries = inner.entries().await;
        let SessionMessage::ToolResult { text, .. } = &entries[1] else {
            panic!("expected tool result");
        };
        assert!(text.len() <= HARD_MAX_TOOL_RESULT_CHARS + TRUNCATION_SUFFIX.len() + 10);
        assert!(text.ends_with("large content.]"));
    }

    #[tokio::test]
    async fn already_annotated_error_is_not_double_annotated() {
        let inner = Arc::new(InMemorySessionManager::new());
        let guard = GuardedSessionManager::new(inner.clone());

        guard.append_message(assistant_with_call("call_5", "edit")).await.unwrap();
        let already = format!("boom {RECOVERABLE_MARKER} already here");
        guard
            .append_message(SessionMessage::ToolResult {
                tool_call_id: "call_5".to_string(),
                text: already.clone(),
                is_error: true,
                is_synthetic: false,
            })
            .await
            .unwrap();

        let entries = inner.entries().await;
        let SessionMessage::ToolResult { text, .. } = &entries[1] else {
            panic!("expected tool result");
        };
        assert_eq!(text, &already);
    }
}
