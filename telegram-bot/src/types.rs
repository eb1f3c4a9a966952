//! Shared domain types: chat/message identity, emoji/reaction vocabulary, task state.

use serde::{Deserialize, Serialize};

/// Telegram chat kind, collapsed to the two shapes the gateway cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatType {
    Direct,
    Group,
}

/// Status emoji painted onto the anchor message via [`crate::status_reactor::StatusReactor`].
///
/// Mapping to Telegram's reaction emoji is in [`EmojiType::as_telegram_emoji`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmojiType {
    Glance,
    OneSecond,
    Hammer,
    Alarm,
    Done,
    Error,
    /// Transient "agent is typing" marker cleaned up during boot reconciliation.
    Typing,
}

impl EmojiType {
    /// The literal Telegram reaction emoji used for `setMessageReaction`.
    pub fn as_telegram_emoji(self) -> &'static str {
        match self {
            EmojiType::Glance => "👀",
            EmojiType::OneSecond => "⏱",
            EmojiType::Hammer => "🔨",
            EmojiType::Alarm => "⏰",
            EmojiType::Done => "✅",
            EmojiType::Error => "⚠",
            EmojiType::Typing => "💭",
        }
    }
}

/// Task lifecycle state (distilled spec §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Received,
    Queued,
    Working,
    Waiting,
    Done,
    Failed,
    Interrupted,
}

impl TaskState {
    /// Whether a task in this state may still be resumed via "continue".
    pub fn is_resumable(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Interrupted)
    }

    /// Whether a task in this state is terminal (no further automatic transitions
    /// except the explicit resume path).
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Interrupted)
    }
}

/// A currently-displayed status reaction and the handle needed to remove it.
///
/// Telegram has no server-assigned per-reaction id, so `reaction_id` is the
/// gateway's own `(message_id, emoji)` pair rendered as a string — see
/// DESIGN.md for why this still satisfies the idempotence invariant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji_type: EmojiType,
    pub reaction_id: String,
}

pub fn reaction_id_for(message_id: i64, emoji: EmojiType) -> String {
    format!("{message_id}:{}", emoji.as_telegram_emoji())
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
