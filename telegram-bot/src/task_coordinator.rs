//! TaskCoordinator: inbound pipeline orchestration.
//!
//! Gate → classify (new / continue) → create or resume task → drive the
//! state machine → dispatch to the agent → on idle finalize or mark
//! waiting/failed → on boot reconcile orphans. This module owns the
//! process-wide mutable state the distilled spec calls out in its Design
//! Notes (dedup map, permission-error cache, per-account file locks) inside
//! a single [`GatewayCoordinator`] constructed once at `main()`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::Regex;
use tokio::sync::Mutex;

use crate::agent::{AgentDispatcher, AgentRunContext, DispatchCallbacks, DispatchOutcome};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::inbound_gate::{render_stale_reply, GateDecision, InboundGate};
use crate::inflight::{InFlightStore, InFlightStoreFile, InFlightTask, MAX_RESUME_ATTEMPTS};
use crate::provider::{MessageClient, QuotedMessage, ReactionClient};
use crate::status_reactor::{ReplaceRequest, StatusReactor};
use crate::types::{now_ms, ChatType, EmojiType, TaskState};

const PROVIDER_TAG: &str = "telegram";
const GROUP_HISTORY_CAP: usize = 20;
const PERMISSION_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// One inbound Telegram update, parsed into the tagged shape the control
/// plane operates on (distilled spec §9 design note — a tagged record
/// rather than a loose map).
#[derive(Clone, Debug)]
pub struct InboundContext {
    pub chat_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub chat_type: ChatType,
    pub create_time_ms: i64,
    pub content: String,
    pub mentions: Vec<String>,
    pub mentions_bot: bool,
    pub quoted: Option<QuotedMessage>,
}

/// A group message recorded into the per-chat history ring even though the
/// gateway did not engage the agent for it (allowlist/mention gated out),
/// so that a later mention has recent context.
#[derive(Clone, Debug)]
struct GroupHistoryEntry {
    sender_id: String,
    text: String,
}

/// Per-`app_id` cooldown on re-surfacing a permission-denied notice, scoped
/// to one [`GatewayCoordinator`] instance (distilled spec's second Open
/// Question, resolved in DESIGN.md: per-coordinator, not a global static).
struct PermissionErrorCache {
    last_notified: DashMap<String, Instant>,
}

impl PermissionErrorCache {
    fn new() -> Self {
        Self {
            last_notified: DashMap::new(),
        }
    }

    /// Returns `true` (and records `now`) if the cooldown for `app_id` has
    /// elapsed, i.e. the caller should notify the user this time.
    fn should_notify(&self, app_id: &str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_notified.get(app_id) {
            if now.duration_since(*last) < PERMISSION_COOLDOWN {
                return false;
            }
        }
        self.last_notified.insert(app_id.to_string(), now);
        true
    }
}

fn continue_command_re() -> Regex {
    Regex::new(r"(?i)^(继续|continue|resume)\b").expect("static regex")
}

fn bot_mention_re(bot_username: &str) -> Option<Regex> {
    if bot_username.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)@{}\b", regex::escape(bot_username))).ok()
}

/// Strips `@botusername` mentions from `content`. Telegram entity offsets
/// are the precise way to do this (see SPEC_FULL.md §4.4); this regex
/// fallback covers payloads where entity spans are unavailable.
pub fn strip_bot_mentions(content: &str, bot_username: &str) -> String {
    match bot_mention_re(bot_username) {
        Some(re) => re.replace_all(content, "").trim().to_string(),
        None => content.trim().to_string(),
    }
}

fn emoji_for_state(state: TaskState) -> EmojiType {
    match state {
        TaskState::Received => EmojiType::Glance,
        TaskState::Queued => EmojiType::OneSecond,
        TaskState::Working => EmojiType::Hammer,
        TaskState::Waiting => EmojiType::Alarm,
        TaskState::Done => EmojiType::Done,
        TaskState::Failed | TaskState::Interrupted => EmojiType::Error,
    }
}

fn thread_id_for(account_id: &str, chat_id: &str) -> String {
    format!("{account_id}:{chat_id}")
}

fn continue_invite_text(locale: &str) -> String {
    if locale == "en" {
        "Something went wrong. Reply \"continue\" to retry this task.".to_string()
    } else {
        "任务失败，回复「继续」可重试。".to_string()
    }
}

fn no_prior_task_text(locale: &str) -> String {
    if locale == "en" {
        "No prior task to continue.".to_string()
    } else {
        "没有可恢复的任务。".to_string()
    }
}

fn interrupted_explanation_text(locale: &str) -> String {
    if locale == "en" {
        "The gateway restarted while this task was in progress. Reply \"continue\" to resume."
            .to_string()
    } else {
        "网关重启，任务被中断。回复「继续」可恢复。".to_string()
    }
}

fn permission_denied_text(locale: &str, grant_url: Option<&str>) -> String {
    let base = if locale == "en" {
        "The bot is missing permission to complete this action."
    } else {
        "机器人缺少完成此操作所需的权限。"
    };
    match grant_url {
        Some(url) => format!("{base} {url}"),
        None => base.to_string(),
    }
}

/// Process-wide mutable state for one gateway account, constructed once at
/// `main()`. Owns the per-account/per-chat file locks, the in-memory dedup
/// map (via [`InboundGate`]), the permission-error cooldown cache, and the
/// group-history ring buffers.
pub struct GatewayCoordinator {
    config: GatewayConfig,
    store: InFlightStore,
    gate: InboundGate,
    reactor: StatusReactor,
    reaction_client: Arc<dyn ReactionClient>,
    message_client: Arc<dyn MessageClient>,
    dispatcher: Arc<dyn AgentDispatcher>,
    account_locks: DashMap<String, Arc<Mutex<()>>>,
    permission_errors: PermissionErrorCache,
    group_history: DashMap<String, Mutex<VecDeque<GroupHistoryEntry>>>,
    bot_username: String,
}

impl GatewayCoordinator {
    pub fn new(
        config: GatewayConfig,
        reaction_client: Arc<dyn ReactionClient>,
        message_client: Arc<dyn MessageClient>,
        dispatcher: Arc<dyn AgentDispatcher>,
        bot_username: impl Into<String>,
    ) -> Self {
        let store = InFlightStore::new(config.state_dir.clone());
        let gate = InboundGate::new(config.state_dir.clone());
        let reactor = StatusReactor::new(reaction_client.clone());
        Self {
            config,
            store,
            gate,
            reactor,
            reaction_client,
            message_client,
            dispatcher,
            account_locks: DashMap::new(),
            permission_errors: PermissionErrorCache::new(),
            group_history: DashMap::new(),
            bot_username: bot_username.into(),
        }
    }

    fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.account_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read-modify-write against the per-account store file, serialized by a
    /// per-account lock so two coroutines in the same account never
    /// interleave writes (distilled spec §5).
    async fn mutate_store<F, R>(&self, account_id: &str, f: F) -> R
    where
        F: FnOnce(&mut InFlightStoreFile) -> R,
    {
        let lock = self.account_lock(account_id);
        let _guard = lock.lock().await;
        let (path, mut store) = self.store.read(account_id).await;
        let result = f(&mut store);
        if let Err(e) = self.store.write(&path, &store).await {
            tracing::warn!(account_id, error = %e, "failed to persist inflight store");
        }
        result
    }

    /// Paints `next_emoji` (best-effort) and advances `task_id` to
    /// `next_state`, writing the returned reaction back to the task. If the
    /// reactor's "add" call fails, the state still advances but the
    /// reaction is left unchanged (distilled spec §4.2/§7: callers fall
    /// back to leaving the previous reaction in place).
    async fn paint_and_transition(
        &self,
        account_id: &str,
        chat_id: &str,
        message_id: &str,
        task_id: &str,
        next_state: TaskState,
        next_emoji: EmojiType,
    ) {
        let prev = self
            .mutate_store(account_id, |store| {
                store.find_by_task_id(task_id).and_then(|t| t.reaction.clone())
            })
            .await;

        let reaction = match self
            .reactor
            .replace(ReplaceRequest {
                chat_id,
                message_id,
                account_id,
                next_emoji_type: next_emoji,
                prev,
            })
            .await
        {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(account_id, message_id, error = %e, "status reaction update failed");
                None
            }
        };

        self.mutate_store(account_id, |store| {
            if let Some(task) = store.tasks.iter_mut().find(|t| t.id == task_id) {
                task.transition(next_state);
                if let Some(r) = reaction {
                    task.reaction = Some(r);
                }
            }
        })
        .await;
    }

    async fn record_group_history(&self, ctx: &InboundContext) {
        let entry = self
            .group_history
            .entry(ctx.chat_id.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut ring = entry.lock().await;
        ring.push_back(GroupHistoryEntry {
            sender_id: ctx.sender_id.clone(),
            text: ctx.content.clone(),
        });
        while ring.len() > GROUP_HISTORY_CAP {
            ring.pop_front();
        }
    }

    async fn recent_history_snippet(&self, chat_id: &str) -> Option<String> {
        let entry = self.group_history.get(chat_id)?;
        let ring = entry.lock().await;
        if ring.is_empty() {
            return None;
        }
        let lines: Vec<String> = ring
            .iter()
            .map(|e| format!("{}: {}", e.sender_id, e.text))
            .collect();
        Some(format!("[Recent unmentioned context]\n{}", lines.join("\n")))
    }

    fn is_group_sender_allowed(&self, chat_id: &str, sender_id: &str) -> bool {
        match &self.config.group_allowlist {
            Some(allow) if !allow.contains(&chat_id.to_string()) => return false,
            _ => {}
        }
        match self.config.group_sender_allowlist.as_ref().and_then(|m| m.get(chat_id)) {
            Some(senders) => senders.iter().any(|s| s == sender_id),
            None => true,
        }
    }

    fn is_dm_sender_allowed(&self, sender_id: &str) -> bool {
        match &self.config.dm_allowlist {
            Some(allow) => allow.contains(&sender_id.to_string()),
            None => true,
        }
    }

    /// Entry point for one inbound Telegram update. Never propagates errors
    /// to the caller — best-effort paths are logged and swallowed, matching
    /// the distilled spec's outer `try/catch`.
    pub async fn handle_inbound(self: &Arc<Self>, mut ctx: InboundContext) {
        if !self.gate.memory_dedup().try_record(&ctx.message_id) {
            return;
        }

        ctx.content = strip_bot_mentions(&ctx.content, &self.bot_username);

        let decision = self
            .gate
            .admit(
                &self.config.account_id,
                &ctx.chat_id,
                &ctx.message_id,
                ctx.create_time_ms,
                &self.config.stale_drop,
            )
            .await;

        match decision {
            GateDecision::DuplicateInRing => return,
            GateDecision::Stale { notify, watermark_ms } => {
                if notify {
                    let text = render_stale_reply(&self.config.locale, ctx.create_time_ms, watermark_ms);
                    if let Err(e) = self
                        .message_client
                        .send_message(&ctx.chat_id, &text, Some(&ctx.message_id), &self.config.account_id)
                        .await
                    {
                        tracing::warn!(error = %e, "failed to send stale-drop notice");
                    }
                }
                return;
            }
            GateDecision::Admit => {}
        }

        if ctx.chat_type == ChatType::Group {
            if !self.is_group_sender_allowed(&ctx.chat_id, &ctx.sender_id) {
                return;
            }
            if self.config.require_mention && !ctx.mentions_bot {
                self.record_group_history(&ctx).await;
                return;
            }
        } else if !self.is_dm_sender_allowed(&ctx.sender_id) {
            return;
        }

        let is_continue_cmd = continue_command_re().is_match(ctx.content.trim());

        let task = if is_continue_cmd {
            match self.try_resume(&ctx).await {
                Some(task) => task,
                None => {
                    let text = no_prior_task_text(&self.config.locale);
                    if let Err(e) = self
                        .message_client
                        .send_message(&ctx.chat_id, &text, Some(&ctx.message_id), &self.config.account_id)
                        .await
                    {
                        tracing::warn!(error = %e, "failed to send no-prior-task reply");
                    }
                    return;
                }
            }
        } else {
            self.create_new_task(&ctx).await
        };

        self.run_dispatch_pipeline(task, ctx).await;
    }

    async fn try_resume(&self, ctx: &InboundContext) -> Option<InFlightTask> {
        let account_id = self.config.account_id.clone();
        let chat_id = ctx.chat_id.clone();
        let sender_id = ctx.sender_id.clone();
        let chat_type = ctx.chat_type;
        self.mutate_store(&account_id, move |store| {
            let task_id = store.last_interruptible_by_chat_id.get(&chat_id)?.clone();
            let eligible = {
                let task = store.find_by_task_id(&task_id)?;
                task.state.is_resumable()
                    && task.resume_attempts < MAX_RESUME_ATTEMPTS
                    && (chat_type == ChatType::Direct
                        || task.user_open_id.as_deref().map_or(true, |id| id == sender_id))
            };
            if !eligible {
                return None;
            }
            let task = store.tasks.iter_mut().find(|t| t.id == task_id)?;
            task.resume_attempts += 1;
            task.transition(TaskState::Received);
            Some(task.clone())
        })
        .await
    }

    async fn create_new_task(&self, ctx: &InboundContext) -> InFlightTask {
        let user_open_id = (ctx.chat_type == ChatType::Group).then(|| ctx.sender_id.clone());
        let task = InFlightTask::new(
            PROVIDER_TAG,
            &self.config.account_id,
            &ctx.chat_id,
            ctx.chat_type,
            user_open_id,
            &ctx.message_id,
            &ctx.content,
        );
        self.mutate_store(&self.config.account_id, {
            let task = task.clone();
            move |store| store.upsert_task(task)
        })
        .await;
        task
    }

    async fn build_envelope(&self, ctx: &InboundContext, task: &InFlightTask) -> String {
        let mut parts = Vec::new();
        if let Some(quoted) = &ctx.quoted {
            let label = quoted.sender_label.clone().unwrap_or_else(|| "quoted message".to_string());
            parts.push(format!("[Reply to {label}]\n{}", quoted.text));
        }
        if ctx.chat_type == ChatType::Group {
            if let Some(history) = self.recent_history_snippet(&ctx.chat_id).await {
                parts.push(history);
            }
        }
        parts.push(format!("[{} in {}] {}", ctx.sender_id, ctx.chat_id, task.original_text));
        if !ctx.mentions.is_empty() {
            parts.push(format!("[mentions: {}]", ctx.mentions.join(", ")));
        }
        parts.join("\n\n")
    }

    async fn run_dispatch_pipeline(self: &Arc<Self>, task: InFlightTask, ctx: InboundContext) {
        let account_id = self.config.account_id.clone();

        self.paint_and_transition(
            &account_id,
            &ctx.chat_id,
            &task.message_id,
            &task.id,
            TaskState::Received,
            emoji_for_state(TaskState::Received),
        )
        .await;

        let envelope_text = self.build_envelope(&ctx, &task).await;

        self.paint_and_transition(
            &account_id,
            &ctx.chat_id,
            &task.message_id,
            &task.id,
            TaskState::Queued,
            emoji_for_state(TaskState::Queued),
        )
        .await;

        let thread_id = thread_id_for(&account_id, &ctx.chat_id);
        let run_ctx = AgentRunContext { thread_id, envelope_text };

        let coordinator = self.clone();
        let (acct, chat_id, message_id, task_id) =
            (account_id.clone(), ctx.chat_id.clone(), task.message_id.clone(), task.id.clone());
        // Awaited by the dispatcher before it proceeds, so this paint is
        // ordered against (never racing) `finalize`'s later Done/Failed paint
        // for the same task — a detached `tokio::spawn` here could otherwise
        // outlive and overwrite the terminal reaction (distilled spec §5).
        let on_reply_start: Box<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync> =
            Box::new(move || {
                let coordinator = coordinator.clone();
                let (acct, chat_id, message_id, task_id) =
                    (acct.clone(), chat_id.clone(), message_id.clone(), task_id.clone());
                Box::pin(async move {
                    coordinator
                        .paint_and_transition(
                            &acct,
                            &chat_id,
                            &message_id,
                            &task_id,
                            TaskState::Working,
                            emoji_for_state(TaskState::Working),
                        )
                        .await;
                })
            });
        let on_idle: Box<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync> =
            Box::new(|| {
                Box::pin(async {
                    tracing::debug!("agent dispatch idle");
                })
            });

        match self
            .dispatcher
            .dispatch(run_ctx, DispatchCallbacks { on_reply_start, on_idle })
            .await
        {
            Ok(outcome) => self.finalize(&account_id, &ctx, &task, outcome).await,
            Err(e) => {
                if let GatewayError::PermissionDenied { grant_url } = &e {
                    if self.permission_errors.should_notify(&account_id) {
                        let text = permission_denied_text(&self.config.locale, grant_url.as_deref());
                        if let Err(send_err) = self
                            .message_client
                            .send_message(&ctx.chat_id, &text, Some(&task.message_id), &account_id)
                            .await
                        {
                            tracing::warn!(error = %send_err, "failed to send permission-denied notice");
                        }
                    }
                }
                tracing::warn!(error = %e, task_id = %task.id, "agent dispatch failed");
                self.mark_failed(&account_id, &ctx, &task).await;
            }
        }
    }

    async fn finalize(&self, account_id: &str, ctx: &InboundContext, task: &InFlightTask, outcome: DispatchOutcome) {
        if outcome.queued_final {
            if let Some(text) = &outcome.final_text {
                if let Err(e) = self
                    .message_client
                    .send_message(&ctx.chat_id, text, Some(&task.message_id), account_id)
                    .await
                {
                    tracing::warn!(error = %e, "failed to send final reply");
                }
            }
            self.paint_and_transition(
                account_id,
                &ctx.chat_id,
                &task.message_id,
                &task.id,
                TaskState::Done,
                emoji_for_state(TaskState::Done),
            )
            .await;
            self.mutate_store(account_id, {
                let task_id = task.id.clone();
                move |store| store.remove_task(&task_id)
            })
            .await;
        } else if outcome.followup_queued {
            self.paint_and_transition(
                account_id,
                &ctx.chat_id,
                &task.message_id,
                &task.id,
                TaskState::Waiting,
                emoji_for_state(TaskState::Waiting),
            )
            .await;
        } else {
            self.mark_failed(account_id, ctx, task).await;
        }
    }

    async fn mark_failed(&self, account_id: &str, ctx: &InboundContext, task: &InFlightTask) {
        self.paint_and_transition(
            account_id,
            &ctx.chat_id,
            &task.message_id,
            &task.id,
            TaskState::Failed,
            emoji_for_state(TaskState::Failed),
        )
        .await;
        self.mutate_store(account_id, {
            let chat_id = ctx.chat_id.clone();
            let task_id = task.id.clone();
            move |store| store.set_last_interruptible(chat_id, task_id)
        })
        .await;
        let text = continue_invite_text(&self.config.locale);
        if let Err(e) = self
            .message_client
            .send_message(&ctx.chat_id, &text, Some(&task.message_id), account_id)
            .await
        {
            tracing::warn!(error = %e, "failed to send continue-invite fallback");
        }
    }

    /// Boot reconciliation: for every in-flight-but-not-yet-reconciled task,
    /// clean up lingering TYPING reactions, paint ERROR, send a single
    /// interruption notice, and record it as the chat's last-interruptible
    /// task so "continue" can resume it.
    pub async fn reconcile(&self, account_id: &str, max_age_ms: i64) {
        let now = now_ms();
        let to_handle: Vec<InFlightTask> = self
            .mutate_store(account_id, |store| {
                store
                    .tasks
                    .iter()
                    .filter(|t| {
                        matches!(t.state, TaskState::Queued | TaskState::Working | TaskState::Waiting)
                            && !t.interrupted_handled
                            && now - t.updated_at_ms <= max_age_ms
                    })
                    .cloned()
                    .collect()
            })
            .await;

        for task in to_handle {
            if let Ok(reactors) = self
                .reaction_client
                .list_reactions(&task.chat_id, &task.message_id, EmojiType::Typing, account_id)
                .await
            {
                for r in reactors.into_iter().filter(|r| r.operator_type == "app") {
                    if let Err(e) = self
                        .reaction_client
                        .remove_reaction(&task.chat_id, &task.message_id, &r.reaction_id, account_id)
                        .await
                    {
                        tracing::warn!(error = %e, "failed to clean up lingering typing reaction");
                    }
                }
            }

            self.paint_and_transition(
                account_id,
                &task.chat_id,
                &task.message_id,
                &task.id,
                TaskState::Interrupted,
                emoji_for_state(TaskState::Interrupted),
            )
            .await;

            let text = interrupted_explanation_text(&self.config.locale);
            if let Err(e) = self
                .message_client
                .send_message(&task.chat_id, &text, Some(&task.message_id), account_id)
                .await
            {
                tracing::warn!(error = %e, "failed to send interruption notice");
            }

            self.mutate_store(account_id, {
                let chat_id = task.chat_id.clone();
                let task_id = task.id.clone();
                move |store| {
                    if let Some(t) = store.tasks.iter_mut().find(|t| t.id == task_id) {
                        t.interrupted_handled = true;
                    }
                    store.set_last_interruptible(chat_id, task_id);
                }
            })
            .await;
        }
    }

    /// Auto-finalization on outbound: called whenever any message is sent
    /// whose `reply_to` equals a task's anchor. If that task is currently
    /// `waiting`, paints DONE and removes it. Best-effort; errors swallowed.
    pub async fn on_outbound_sent(&self, account_id: &str, reply_to_message_id: &str) {
        let task = self
            .mutate_store(account_id, |store| {
                store
                    .tasks
                    .iter()
                    .find(|t| t.message_id == reply_to_message_id && t.state == TaskState::Waiting)
                    .cloned()
            })
            .await;

        if let Some(task) = task {
            self.paint_and_transition(
                account_id,
                &task.chat_id,
                &task.message_id,
                &task.id,
                TaskState::Done,
                emoji_for_state(TaskState::Done),
            )
            .await;
            self.mutate_store(account_id, {
                let task_id = task.id.clone();
                move |store| store.remove_task(&task_id)
            })
            .await;
        }
    }

    /// Finalizes any `waiting` task for `chat_id` once an announce-queue
    /// followup has successfully been delivered there. `AnnounceQueueItem`
    /// carries no anchor handle (distilled spec §3), so the match is at
    /// chat granularity rather than per-anchor — see DESIGN.md.
    pub async fn finalize_waiting_for_chat(&self, account_id: &str, chat_id: &str) {
        let task = self
            .mutate_store(account_id, |store| {
                store
                    .tasks
                    .iter()
                    .find(|t| t.chat_id == chat_id && t.state == TaskState::Waiting)
                    .cloned()
            })
            .await;
        if let Some(task) = task {
            self.on_outbound_sent(account_id, &task.message_id).await;
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedDispatcher;
    use crate::provider::fakes::FakeProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(state_dir: &std::path::Path) -> GatewayConfig {
        GatewayConfig {
            telegram_token: "test".to_string(),
            account_id: "acct".to_string(),
            state_dir: state_dir.to_path_buf(),
            locale: "en".to_string(),
            require_mention: false,
            group_allowlist: None,
            dm_allowlist: None,
            group_sender_allowlist: None,
            stale_drop: crate::inbound_gate::StaleDropConfig::default(),
            announce: crate::announce_queue::QueueSettings::default(),
            hard_max_tool_result_chars: crate::tool_result_guard::HARD_MAX_TOOL_RESULT_CHARS,
            log_level: "info".to_string(),
            log_file: None,
        }
    }

    fn ctx(message_id: &str, sent_at: i64, text: &str) -> InboundContext {
        InboundContext {
            chat_id: "chat1".to_string(),
            message_id: message_id.to_string(),
            sender_id: "user1".to_string(),
            chat_type: ChatType::Direct,
            create_time_ms: sent_at,
            content: text.to_string(),
            mentions: Vec::new(),
            mentions_bot: false,
            quoted: None,
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_dispatches_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeProvider::default());
        let dispatch_count = Arc::new(AtomicUsize::new(0));

        struct CountingDispatcher {
            count: Arc<AtomicUsize>,
        }
        #[async_trait::async_trait]
        impl AgentDispatcher for CountingDispatcher {
            async fn dispatch(
                &self,
                _ctx: AgentRunContext,
                callbacks: DispatchCallbacks,
            ) -> Result<DispatchOutcome, GatewayError> {
                self.count.fetch_add(1, Ordering::SeqCst);
                (callbacks.on_reply_start)().await;
                (callbacks.on_idle)().await;
                Ok(DispatchOutcome {
                    queued_final: true,
                    counts: crate::agent::DispatchCounts { final_replies: 1 },
                    followup_queued: false,
                    final_text: Some("done".to_string()),
                })
            }
        }

        let coordinator = Arc::new(GatewayCoordinator::new(
            test_config(dir.path()),
            fake.clone(),
            fake.clone(),
            Arc::new(CountingDispatcher { count: dispatch_count.clone() }),
            "mybot",
        ));

        coordinator.handle_inbound(ctx("om_x", 1_000, "hello")).await;
        coordinator.handle_inbound(ctx("om_x", 1_000, "hello")).await;

        assert_eq!(dispatch_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_out_of_order_sends_notice_and_does_not_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeProvider::default());
        let dispatch_count = Arc::new(AtomicUsize::new(0));

        struct CountingDispatcher {
            count: Arc<AtomicUsize>,
        }
        #[async_trait::async_trait]
        impl AgentDispatcher for CountingDispatcher {
            async fn dispatch(
                &self,
                _ctx: AgentRunContext,
                _callbacks: DispatchCallbacks,
            ) -> Result<DispatchOutcome, GatewayError> {
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(DispatchOutcome {
                    queued_final: true,
                    counts: crate::agent::DispatchCounts { final_replies: 1 },
                    followup_queued: false,
                    final_text: Some("done".to_string()),
                })
            }
        }

        let mut config = test_config(dir.path());
        config.stale_drop.skew_window_ms = 0;

        let coordinator = Arc::new(GatewayCoordinator::new(
            config,
            fake.clone(),
            fake.clone(),
            Arc::new(CountingDispatcher { count: dispatch_count.clone() }),
            "mybot",
        ));

        // Seed the watermark.
        coordinator.handle_inbound(ctx("seed", 2_000, "hi")).await;
        // Deliver an older, stale message.
        coordinator.handle_inbound(ctx("om_old", 1_000, "late")).await;

        assert_eq!(dispatch_count.load(Ordering::SeqCst), 1, "only the seed message dispatches");
        let sent = fake.sent.lock().unwrap();
        let stale_notice = sent
            .iter()
            .find(|t| t.2.as_deref() == Some("om_old") && t.1.contains("reason=out_of_order_delivery"));
        assert!(stale_notice.is_some());
    }

    #[tokio::test]
    async fn waiting_task_finalizes_to_done_on_matching_outbound_reply() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeProvider::default());

        let coordinator = GatewayCoordinator::new(
            test_config(dir.path()),
            fake.clone(),
            fake.clone(),
            Arc::new(ScriptedDispatcher { reply: "x".to_string(), followup_queued: true }),
            "mybot",
        );

        let task = InFlightTask::new(
            "telegram",
            "acct",
            "chat1",
            ChatType::Direct,
            None,
            "msg-anchor",
            "hi",
        );
        let mut waiting_task = task.clone();
        waiting_task.transition(TaskState::Waiting);
        coordinator
            .mutate_store("acct", move |store| store.upsert_task(waiting_task.clone()))
            .await;

        coordinator.on_outbound_sent("acct", "msg-anchor").await;

        let (_, store) = coordinator.store.read("acct").await;
        assert!(store.find_by_task_id(&task.id).is_none());
        assert_eq!(fake.added.lock().unwrap().last().unwrap().2, EmojiType::Done);
    }

    #[tokio::test]
    async fn resume_is_rejected_once_attempts_cap_reached() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeProvider::default());
        let coordinator = GatewayCoordinator::new(
            test_config(dir.path()),
            fake.clone(),
            fake.clone(),
            Arc::new(ScriptedDispatcher { reply: "x".to_string(), followup_queued: false }),
            "mybot",
        );

        let mut task = InFlightTask::new("telegram", "acct", "chat1", ChatType::Direct, None, "anchor", "hi");
        task.transition(TaskState::Failed);
        task.resume_attempts = MAX_RESUME_ATTEMPTS;
        let task_id = task.id.clone();
        coordinator
            .mutate_store("acct", move |store| {
                store.upsert_task(task.clone());
                store.set_last_interruptible("chat1", task.id.clone());
            })
            .await;

        let resumed = coordinator
            .try_resume(&ctx("continue-msg", 1_000, "continue"))
            .await;
        assert!(resumed.is_none());

        let (_, store) = coordinator.store.read("acct").await;
        let still_failed = store.find_by_task_id(&task_id).unwrap();
        assert_eq!(still_failed.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn reconcile_marks_orphaned_task_interrupted_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeProvider::default());
        let coordinator = GatewayCoordinator::new(
            test_config(dir.path()),
            fake.clone(),
            fake.clone(),
            Arc::new(ScriptedDispatcher { reply: "x".to_string(), followup_queued: false }),
            "mybot",
        );

        let mut task = InFlightTask::new("telegram", "acct", "chat1", ChatType::Direct, None, "anchor", "hi");
        task.transition(TaskState::Working);
        let task_id = task.id.clone();
        coordinator.mutate_store("acct", move |store| store.upsert_task(task.clone())).await;

        coordinator.reconcile("acct", 24 * 60 * 60 * 1_000).await;

        let (_, store) = coordinator.store.read("acct").await;
        let reconciled = store.find_by_task_id(&task_id).unwrap();
        assert_eq!(reconciled.state, TaskState::Interrupted);
        assert!(reconciled.interrupted_handled);
        assert_eq!(
            store.last_interruptible_by_chat_id.get("chat1").cloned().as_deref(),
            Some(task_id.as_str())
        );

        // Second reconcile pass is a no-op: interrupted_handled is already set.
        coordinator.reconcile("acct", 24 * 60 * 60 * 1_000).await;
        let sent = fake.sent.lock().unwrap();
        assert_eq!(
            sent.iter()
                .filter(|t| t.1.contains("restarted") || t.1.contains("中断"))
                .count(),
            1
        );
    }
}
