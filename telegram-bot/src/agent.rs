//! Agent collaborator contract: mirrors the distilled spec's
//! `dispatchReplyFromConfig`, wrapping whatever runner produces replies
//! (`loom`'s ReAct runner in production, a scripted fake in tests).

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::GatewayError;

/// One inbound run's context as handed to the agent.
#[derive(Clone, Debug)]
pub struct AgentRunContext {
    pub thread_id: String,
    pub envelope_text: String,
}

/// Status callbacks fired on the event loop as the dispatch progresses.
///
/// Each callback returns the future doing the actual work rather than
/// spawning it itself: the dispatcher must `.await` `on_reply_start` before
/// continuing, so the `queued -> working` paint is ordered against (never
/// racing) the idle-finalization paint for the same task (distilled spec §5:
/// no two steps of the same task run concurrently).
pub struct DispatchCallbacks {
    pub on_reply_start: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
    pub on_idle: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
}

#[derive(Clone, Debug, Default)]
pub struct DispatchCounts {
    pub final_replies: u32,
}

#[derive(Clone, Debug)]
pub struct DispatchOutcome {
    pub queued_final: bool,
    pub counts: DispatchCounts,
    /// Set when at least one followup was queued to be delivered later via
    /// the announce queue (distinct from `queued_final`, which means a
    /// terminal reply was produced and sent already).
    pub followup_queued: bool,
    pub final_text: Option<String>,
}

#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        ctx: AgentRunContext,
        callbacks: DispatchCallbacks,
    ) -> Result<DispatchOutcome, GatewayError>;
}

/// Deterministic test/demo dispatcher: always replies once, then idles.
pub struct ScriptedDispatcher {
    pub reply: String,
    pub followup_queued: bool,
}

#[async_trait]
impl AgentDispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        _ctx: AgentRunContext,
        callbacks: DispatchCallbacks,
    ) -> Result<DispatchOutcome, GatewayError> {
        (callbacks.on_reply_start)().await;
        (callbacks.on_idle)().await;
        Ok(DispatchOutcome {
            queued_final: !self.followup_queued,
            counts: DispatchCounts { final_replies: 1 },
            followup_queued: self.followup_queued,
            final_text: Some(self.reply.clone()),
        })
    }
}

/// Dispatcher backed by `loom`'s ReAct runner. Construction details (model,
/// tool sources, checkpointer) live in `loom::helve`/`loom::agent::react` and
/// are wired at `main()`; this wrapper only adapts the run-context/callbacks
/// shape the gateway's `TaskCoordinator` expects to `loom`'s own
/// state-in/state-out `run_react_graph` entry point.
pub struct LoomReactDispatcher<R> {
    runner: R,
}

impl<R> LoomReactDispatcher<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

/// Minimal surface the gateway needs from a `loom` runner, kept separate from
/// `loom`'s own (richer) `ReactRunner` type so this crate compiles against a
/// stable, narrow seam.
#[async_trait]
pub trait ReactRun: Send + Sync {
    async fn run(&self, thread_id: &str, message: &str) -> Result<String, GatewayError>;
}

#[async_trait]
impl<R: ReactRun + Send + Sync> AgentDispatcher for LoomReactDispatcher<R> {
    async fn dispatch(
        &self,
        ctx: AgentRunContext,
        callbacks: DispatchCallbacks,
    ) -> Result<DispatchOutcome, GatewayError> {
        (callbacks.on_reply_start)().await;
        let reply = self.runner.run(&ctx.thread_id, &ctx.envelope_text).await?;
        (callbacks.on_idle)().await;
        Ok(DispatchOutcome {
            queued_final: true,
            counts: DispatchCounts { final_replies: 1 },
            followup_queued: false,
            final_text: Some(reply),
        })
    }
}
