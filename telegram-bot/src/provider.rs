//! Provider capability contracts (distilled spec §6) and their `teloxide` backing.
//!
//! These are the named external collaborators the core control plane depends
//! on: add/remove/list reaction, send message, fetch message. Kept as traits
//! so the control plane (status reactor, inbound gate, task coordinator) is
//! testable with fakes.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::EmojiType;

/// One entity that reacted to a message, as returned by [`ReactionClient::list_reactions`].
#[derive(Clone, Debug)]
pub struct ReactorInfo {
    pub reaction_id: String,
    /// `"app"` for the bot itself, `"user"` for a human reactor.
    pub operator_type: String,
}

#[derive(Clone, Debug)]
pub struct SentMessage {
    pub message_id: String,
    pub chat_id: String,
}

#[derive(Clone, Debug)]
pub struct QuotedMessage {
    pub text: String,
    pub sender_label: Option<String>,
}

#[async_trait]
pub trait ReactionClient: Send + Sync {
    async fn add_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        emoji: EmojiType,
        account_id: &str,
    ) -> Result<String, GatewayError>;

    async fn remove_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        reaction_id: &str,
        account_id: &str,
    ) -> Result<(), GatewayError>;

    async fn list_reactions(
        &self,
        chat_id: &str,
        message_id: &str,
        emoji: EmojiType,
        account_id: &str,
    ) -> Result<Vec<ReactorInfo>, GatewayError>;
}

#[async_trait]
pub trait MessageClient: Send + Sync {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to_message_id: Option<&str>,
        account_id: &str,
    ) -> Result<SentMessage, GatewayError>;

    async fn fetch_message(
        &self,
        chat_id: &str,
        message_id: &str,
        account_id: &str,
    ) -> Result<Option<QuotedMessage>, GatewayError>;
}

/// `teloxide::Bot`-backed implementation of both provider contracts.
pub struct TeloxideProvider {
    bot: teloxide::Bot,
}

impl TeloxideProvider {
    pub fn new(bot: teloxide::Bot) -> Self {
        Self { bot }
    }

    fn parse_chat_id(chat_id: &str) -> Result<teloxide::types::ChatId, GatewayError> {
        chat_id
            .parse::<i64>()
            .map(teloxide::types::ChatId)
            .map_err(|e| GatewayError::provider(format!("invalid chat id {chat_id}: {e}")))
    }

    fn parse_message_id(message_id: &str) -> Result<teloxide::types::MessageId, GatewayError> {
        message_id
            .parse::<i32>()
            .map(teloxide::types::MessageId)
            .map_err(|e| GatewayError::provider(format!("invalid message id {message_id}: {e}")))
    }
}

#[async_trait]
impl ReactionClient for TeloxideProvider {
    async fn add_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        emoji: EmojiType,
        _account_id: &str,
    ) -> Result<String, GatewayError> {
        use teloxide::prelude::Requester;
        use teloxide::types::{ReactionType, ReactionTypeEmoji};

        let chat = Self::parse_chat_id(chat_id)?;
        let msg = Self::parse_message_id(message_id)?;
        let reaction = ReactionType::Emoji {
            emoji: ReactionTypeEmoji {
                emoji: emoji.as_telegram_emoji().to_string(),
            },
        };
        self.bot
            .set_message_reaction(chat, msg)
            .reaction(vec![reaction])
            .await
            .map_err(|e| GatewayError::provider(e.to_string()))?;
        Ok(crate::types::reaction_id_for(
            msg.0 as i64,
            emoji,
        ))
    }

    async fn remove_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        _reaction_id: &str,
        _account_id: &str,
    ) -> Result<(), GatewayError> {
        use teloxide::prelude::Requester;

        let chat = Self::parse_chat_id(chat_id)?;
        let msg = Self::parse_message_id(message_id)?;
        // Clearing the reaction set is Telegram's equivalent of "remove reaction".
        self.bot
            .set_message_reaction(chat, msg)
            .await
            .map_err(|e| GatewayError::provider(e.to_string()))?;
        Ok(())
    }

    async fn list_reactions(
        &self,
        _chat_id: &str,
        _message_id: &str,
        _emoji: EmojiType,
        _account_id: &str,
    ) -> Result<Vec<ReactorInfo>, GatewayError> {
        // Telegram's Bot API does not expose a "list reactors" call; the bot only
        // ever removes its own reaction, so boot reconciliation (task_coordinator)
        // treats "the bot's own lingering TYPING reaction" as always present and
        // clears it unconditionally rather than listing first.
        Ok(Vec::new())
    }
}

#[async_trait]
impl MessageClient for TeloxideProvider {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to_message_id: Option<&str>,
        _account_id: &str,
    ) -> Result<SentMessage, GatewayError> {
        use teloxide::prelude::Requester;

        let chat = Self::parse_chat_id(chat_id)?;
        let mut request = self.bot.send_message(chat, text);
        if let Some(reply_to) = reply_to_message_id {
            let reply_msg = Self::parse_message_id(reply_to)?;
            request = request.reply_to_message_id(reply_msg);
        }
        let sent = request
            .await
            .map_err(|e| GatewayError::provider(e.to_string()))?;
        Ok(SentMessage {
            message_id: sent.id.0.to_string(),
            chat_id: sent.chat.id.0.to_string(),
        })
    }

    async fn fetch_message(
        &self,
        _chat_id: &str,
        _message_id: &str,
        _account_id: &str,
    ) -> Result<Option<QuotedMessage>, GatewayError> {
        // Bot API has no generic "get message by id"; quoted-message expansion
        // relies on the reply payload already embedded in the inbound update
        // (see task_coordinator::InboundContext::quoted), so this is a stub
        // kept for parity with providers that do expose a fetch call.
        Ok(None)
    }
}

/// In-memory `ReactionClient`/`MessageClient` fakes for tests, exercised both
/// by this crate's own unit tests and by `tests/` integration tests (mirrors
/// how `loom::MockLlm` is exposed as a first-class, non-`cfg(test)` fake).
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeReactionCall {
        pub chat_id: String,
        pub message_id: String,
        pub emoji: Option<EmojiType>,
    }

    /// Records every add/remove call; `add_reaction` always returns a fresh
    /// synthetic id unless `same_id_for_emoji` is set, in which case repeated
    /// adds of the same emoji on the same message return the same id (used to
    /// exercise the reaction-idempotence invariant).
    #[derive(Default)]
    pub struct FakeProvider {
        pub added: Mutex<Vec<(String, String, EmojiType)>>,
        pub removed: Mutex<Vec<(String, String, String)>>,
        pub sent: Mutex<Vec<(String, String, Option<String>)>>,
        pub same_id_for_emoji: bool,
        pub fail_add: Mutex<bool>,
    }

    #[async_trait]
    impl ReactionClient for FakeProvider {
        async fn add_reaction(
            &self,
            chat_id: &str,
            message_id: &str,
            emoji: EmojiType,
            _account_id: &str,
        ) -> Result<String, GatewayError> {
            if *self.fail_add.lock().unwrap() {
                return Err(GatewayError::provider("add_reaction failed"));
            }
            self.added
                .lock()
                .unwrap()
                .push((chat_id.to_string(), message_id.to_string(), emoji));
            let id = if self.same_id_for_emoji {
                crate::types::reaction_id_for(message_id.parse().unwrap_or(0), emoji)
            } else {
                format!("{message_id}:{}:{}", emoji.as_telegram_emoji(), self.added.lock().unwrap().len())
            };
            Ok(id)
        }

        async fn remove_reaction(
            &self,
            chat_id: &str,
            message_id: &str,
            reaction_id: &str,
            _account_id: &str,
        ) -> Result<(), GatewayError> {
            self.removed.lock().unwrap().push((
                chat_id.to_string(),
                message_id.to_string(),
                reaction_id.to_string(),
            ));
            Ok(())
        }

        async fn list_reactions(
            &self,
            _chat_id: &str,
            _message_id: &str,
            _emoji: EmojiType,
            _account_id: &str,
        ) -> Result<Vec<ReactorInfo>, GatewayError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl MessageClient for FakeProvider {
        async fn send_message(
            &self,
            chat_id: &str,
            text: &str,
            reply_to_message_id: Option<&str>,
            _account_id: &str,
        ) -> Result<SentMessage, GatewayError> {
            self.sent.lock().unwrap().push((
                chat_id.to_string(),
                text.to_string(),
                reply_to_message_id.map(|s| s.to_string()),
            ));
            Ok(SentMessage {
                message_id: crate::inflight::create_id(),
                chat_id: chat_id.to_string(),
            })
        }

        async fn fetch_message(
            &self,
            _chat_id: &str,
            _message_id: &str,
            _account_id: &str,
        ) -> Result<Option<QuotedMessage>, GatewayError> {
            Ok(None)
        }
    }
}
