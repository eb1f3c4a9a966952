//! `telegram-bot` binary: wires `teloxide` to the gateway's control plane.
//!
//! Composition root only — config load, logging init, provider/agent seam
//! construction, boot reconciliation, then handing updates to
//! [`telegram_bot::GatewayCoordinator::handle_inbound`]. The control plane
//! itself lives in the library crate (`telegram_bot`).

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::{ChatKind, MediaKind, MessageEntityKind, MessageKind, PublicChatKind};

use telegram_bot::agent::{AgentDispatcher, LoomReactDispatcher, ReactRun};
use telegram_bot::config::GatewayConfig;
use telegram_bot::error::GatewayError;
use telegram_bot::provider::TeloxideProvider;
use telegram_bot::task_coordinator::{strip_bot_mentions, GatewayCoordinator, InboundContext};
use telegram_bot::types::ChatType;

const APP_NAME: &str = "loom-telegram-bot";
const RECONCILE_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1_000;

/// Process-level overrides layered on top of `GatewayConfig::from_env` (distilled
/// spec §6 ambient configuration: a `clap`-derived `Args` struct for overrides).
#[derive(Parser, Debug)]
#[command(name = "telegram-bot")]
#[command(about = "Loom Telegram gateway")]
struct Args {
    /// Override the configured state directory.
    #[arg(long, value_name = "DIR")]
    state_dir: Option<std::path::PathBuf>,

    /// Override RUST_LOG / log level.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Run boot reconciliation and exit, without starting the update loop.
    #[arg(long)]
    reconcile_only: bool,
}

/// Adapts `loom`'s ReAct runner to the gateway's narrow [`ReactRun`] seam,
/// keeping this crate's agent dispatch decoupled from `loom::cli_run`'s
/// richer `AnyRunner`/`RunOptions` surface.
struct LoomReactRun {
    working_folder: Option<std::path::PathBuf>,
}

#[async_trait]
impl ReactRun for LoomReactRun {
    async fn run(&self, thread_id: &str, message: &str) -> Result<String, GatewayError> {
        let opts = loom::RunOptions {
            message: message.to_string(),
            working_folder: self.working_folder.clone(),
            thread_id: Some(thread_id.to_string()),
            role_file: None,
            verbose: false,
            got_adaptive: false,
            display_max_len: 4_000,
            output_json: false,
        };
        loom::run_agent(&opts, &loom::RunCmd::React, None)
            .await
            .map_err(|e| GatewayError::dispatch(e.to_string()))
    }
}

fn chat_type_of(chat: &teloxide::types::Chat) -> ChatType {
    match &chat.kind {
        ChatKind::Private(_) => ChatType::Direct,
        ChatKind::Public(p) => match p.kind {
            PublicChatKind::Group(_) | PublicChatKind::Supergroup(_) | PublicChatKind::Channel(_) => {
                ChatType::Group
            }
        },
    }
}

/// Extracts `@mentions` from message entities, returning the mentioned
/// usernames and whether `bot_username` is among them.
fn extract_mentions(msg: &Message, bot_username: &str) -> (Vec<String>, bool) {
    let mut mentions = Vec::new();
    let mut mentions_bot = false;
    if let Some(entities) = msg.entities() {
        let text = msg.text().unwrap_or_default();
        for entity in entities {
            if let MessageEntityKind::Mention = entity.kind {
                let start = entity.offset;
                let end = (entity.offset + entity.length).min(text.chars().count());
                let slice: String = text.chars().skip(start).take(end.saturating_sub(start)).collect();
                let handle = slice.trim_start_matches('@').to_string();
                if handle.eq_ignore_ascii_case(bot_username) {
                    mentions_bot = true;
                } else if !handle.is_empty() {
                    mentions.push(handle);
                }
            }
        }
    }
    (mentions, mentions_bot)
}

async fn build_inbound_context(msg: &Message, bot_username: &str) -> Option<InboundContext> {
    let MessageKind::Common(common) = &msg.kind else {
        return None;
    };
    let MediaKind::Text(media_text) = &common.media_kind else {
        return None;
    };
    let sender_id = msg.from().map(|u| u.id.0.to_string())?;
    let (mentions, mentions_bot) = extract_mentions(msg, bot_username);
    let content = strip_bot_mentions(&media_text.text, bot_username);

    let quoted = msg.reply_to_message().and_then(|replied| {
        replied.text().map(|text| telegram_bot::provider::QuotedMessage {
            text: text.to_string(),
            sender_label: replied.from().map(|u| u.full_name()),
        })
    });

    Some(InboundContext {
        chat_id: msg.chat.id.0.to_string(),
        message_id: msg.id.0.to_string(),
        sender_id,
        chat_type: chat_type_of(&msg.chat),
        create_time_ms: (msg.date.timestamp() * 1_000),
        content,
        mentions,
        mentions_bot,
        quoted,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = config::load_and_apply(APP_NAME, None);

    let args = Args::parse();
    let mut cfg = GatewayConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    if let Some(dir) = args.state_dir {
        cfg.state_dir = dir;
    }
    if let Some(level) = args.log_level {
        cfg.log_level = level;
    }

    let _log_guard = telegram_bot::logging::init(&cfg.log_level, cfg.log_file.as_deref());

    let bot = Bot::new(&cfg.telegram_token);
    let me = bot.get_me().await?;
    let bot_username = me.user.username.clone().unwrap_or_default();

    let reaction_client = Arc::new(TeloxideProvider::new(bot.clone()));
    let message_client = reaction_client.clone();
    let dispatcher: Arc<dyn AgentDispatcher> = Arc::new(LoomReactDispatcher::new(LoomReactRun {
        working_folder: None,
    }));

    let account_id = cfg.account_id.clone();
    let coordinator = Arc::new(GatewayCoordinator::new(
        cfg,
        reaction_client,
        message_client,
        dispatcher,
        bot_username.clone(),
    ));

    tracing::info!(account_id = %account_id, bot_username = %bot_username, "gateway starting, running boot reconciliation");
    coordinator.reconcile(&account_id, RECONCILE_MAX_AGE_MS).await;

    if args.reconcile_only {
        return Ok(());
    }

    let handler = Update::filter_message().endpoint(
        |msg: Message, coordinator: Arc<GatewayCoordinator>, bot_username: Arc<String>| async move {
            if let Some(ctx) = build_inbound_context(&msg, &bot_username).await {
                coordinator.handle_inbound(ctx).await;
            }
            respond(())
        },
    );

    tracing::info!("gateway listening for updates");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![coordinator, Arc::new(bot_username.clone())])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}
