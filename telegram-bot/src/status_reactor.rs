//! StatusReactor: idempotent "replace one reaction with another" on a provider message.
//!
//! The `prev.reaction_id != new_reaction_id` check is essential: providers may
//! be idempotent and return the same id for the same (message, emoji) pair,
//! and removing it in that case would clear the currently-displayed status.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::provider::ReactionClient;
use crate::types::{EmojiType, Reaction};

pub struct ReplaceRequest<'a> {
    pub chat_id: &'a str,
    pub message_id: &'a str,
    pub account_id: &'a str,
    pub next_emoji_type: EmojiType,
    pub prev: Option<Reaction>,
}

pub struct StatusReactor {
    client: Arc<dyn ReactionClient>,
}

impl StatusReactor {
    pub fn new(client: Arc<dyn ReactionClient>) -> Self {
        Self { client }
    }

    /// Paints `next_emoji_type` onto the message and, if it differs from the
    /// previously-displayed reaction, best-effort removes the previous one.
    ///
    /// If "add" fails the error propagates — callers fall back to leaving the
    /// previous reaction in place. If "remove" fails it is logged and
    /// swallowed: at most one stale emoji lingers, and it is overwritten on
    /// the next transition.
    pub async fn replace(&self, req: ReplaceRequest<'_>) -> Result<Reaction, GatewayError> {
        let new_reaction_id = self
            .client
            .add_reaction(req.chat_id, req.message_id, req.next_emoji_type, req.account_id)
            .await?;

        if let Some(prev) = req.prev {
            if prev.reaction_id != new_reaction_id {
                if let Err(e) = self
                    .client
                    .remove_reaction(req.chat_id, req.message_id, &prev.reaction_id, req.account_id)
                    .await
                {
                    tracing::warn!(
                        chat_id = req.chat_id,
                        message_id = req.message_id,
                        error = %e,
                        "failed to remove previous status reaction, leaving it in place"
                    );
                }
            }
        }

        Ok(Reaction {
            emoji_type: req.next_emoji_type,
            reaction_id: new_reaction_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fakes::FakeProvider;

    #[tokio::test]
    async fn replace_removes_prev_when_id_differs() {
        let fake = Arc::new(FakeProvider::default());
        let reactor = StatusReactor::new(fake.clone());

        let r1 = reactor
            .replace(ReplaceRequest {
                chat_id: "c1",
                message_id: "m1",
                account_id: "a1",
                next_emoji_type: EmojiType::Glance,
                prev: None,
            })
            .await
            .unwrap();

        let r2 = reactor
            .replace(ReplaceRequest {
                chat_id: "c1",
                message_id: "m1",
                account_id: "a1",
                next_emoji_type: EmojiType::Hammer,
                prev: Some(r1.clone()),
            })
            .await
            .unwrap();

        assert_ne!(r1.reaction_id, r2.reaction_id);
        assert_eq!(fake.removed.lock().unwrap().len(), 1);
        assert_eq!(fake.removed.lock().unwrap()[0].2, r1.reaction_id);
    }

    #[tokio::test]
    async fn replace_skips_remove_when_provider_returns_same_id() {
        let fake = Arc::new(FakeProvider {
            same_id_for_emoji: true,
            ..Default::default()
        });
        let reactor = StatusReactor::new(fake.clone());

        let r1 = reactor
            .replace(ReplaceRequest {
                chat_id: "c1",
                message_id: "42",
                account_id: "a1",
                next_emoji_type: EmojiType::Hammer,
                prev: None,
            })
            .await
            .unwrap();

        let r2 = reactor
            .replace(ReplaceRequest {
                chat_id: "c1",
                message_id: "42",
                account_id: "a1",
                next_emoji_type: EmojiType::Hammer,
                prev: Some(r1.clone()),
            })
            .await
            .unwrap();

        assert_eq!(r1.reaction_id, r2.reaction_id);
        assert!(fake.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_propagates_add_failure() {
        let fake = Arc::new(FakeProvider::default());
        *fake.fail_add.lock().unwrap() = true;
        let reactor = StatusReactor::new(fake.clone());

        let result = reactor
            .replace(ReplaceRequest {
                chat_id: "c1",
                message_id: "m1",
                account_id: "a1",
                next_emoji_type: EmojiType::Glance,
                prev: None,
            })
            .await;

        assert!(result.is_err());
    }
}
