//! `GatewayConfig`: ambient runtime configuration.
//!
//! Loaded the way other binaries in this workspace load configuration:
//! [`config::load_and_apply`] merges an XDG `config.toml` and project `.env`
//! into the process environment (existing env always wins), then this module
//! reads the resulting environment into a typed struct. A `clap`-derived
//! `Args` in `main.rs` layers process-level overrides on top.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::announce_queue::{DropPolicy, QueueMode, QueueSettings};
use crate::inbound_gate::StaleDropConfig;
use crate::tool_result_guard::HARD_MAX_TOOL_RESULT_CHARS;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub telegram_token: String,
    pub account_id: String,
    pub state_dir: PathBuf,
    pub locale: String,
    pub require_mention: bool,
    pub group_allowlist: Option<Vec<String>>,
    pub dm_allowlist: Option<Vec<String>>,
    /// Per-group sender allowlist, keyed by `chat_id`. A group absent from
    /// this map has no sender restriction beyond `group_allowlist`.
    pub group_sender_allowlist: Option<HashMap<String, Vec<String>>>,
    pub stale_drop: StaleDropConfig,
    pub announce: QueueSettings,
    pub hard_max_tool_result_chars: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl GatewayConfig {
    /// Reads configuration from the process environment, applying the
    /// defaults described in the distilled spec's §6 table.
    ///
    /// `TELOXIDE_TOKEN` takes precedence over `TELEGRAM_TOKEN` for the bot
    /// token, matching `teloxide`'s own convention.
    pub fn from_env() -> Result<Self, String> {
        let telegram_token = std::env::var("TELOXIDE_TOKEN")
            .or_else(|_| std::env::var("TELEGRAM_TOKEN"))
            .map_err(|_| "missing TELOXIDE_TOKEN or TELEGRAM_TOKEN".to_string())?;

        let account_id = std::env::var("TELEGRAM_ACCOUNT_ID").unwrap_or_else(|_| "default".to_string());
        let state_dir = std::env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./state"));
        let locale = std::env::var("LOOM_TELEGRAM_LOCALE").unwrap_or_else(|_| "zh".to_string());
        let require_mention = env_bool("LOOM_TELEGRAM_REQUIRE_MENTION", true);

        let group_allowlist = env_list("LOOM_TELEGRAM_GROUP_ALLOWLIST");
        let dm_allowlist = env_list("LOOM_TELEGRAM_DM_ALLOWLIST");
        let group_sender_allowlist = env_group_map("LOOM_TELEGRAM_GROUP_SENDER_ALLOWLIST");

        let stale_drop = StaleDropConfig {
            enabled: env_bool("STALE_DROP_ENABLED", true),
            reply: env_bool("STALE_DROP_REPLY", true),
            skew_window_ms: env_i64("STALE_DROP_SKEW_WINDOW_MS", 5_000),
            recent_ids_limit: env_usize("STALE_DROP_RECENT_IDS_LIMIT", 250),
        };

        let announce = QueueSettings {
            mode: match std::env::var("ANNOUNCE_MODE").as_deref() {
                Ok("collect") => QueueMode::Collect,
                _ => QueueMode::Followup,
            },
            debounce_ms: env_u64("ANNOUNCE_DEBOUNCE_MS", 1_000),
            cap: env_usize("ANNOUNCE_CAP", 20),
            drop_policy: match std::env::var("ANNOUNCE_DROP_POLICY").as_deref() {
                Ok("oldest") => DropPolicy::Oldest,
                Ok("newest") => DropPolicy::Newest,
                _ => DropPolicy::Summarize,
            },
            max_age_ms: env_u64("ANNOUNCE_MAX_AGE_MS", 10 * 60 * 1_000),
        };

        let hard_max_tool_result_chars =
            env_usize("HARD_MAX_TOOL_RESULT_CHARS", HARD_MAX_TOOL_RESULT_CHARS);

        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let log_file = std::env::var("LOG_FILE").ok().map(PathBuf::from);

        Ok(Self {
            telegram_token,
            account_id,
            state_dir,
            locale,
            require_mention,
            group_allowlist,
            dm_allowlist,
            group_sender_allowlist,
            stale_drop,
            announce,
            hard_max_tool_result_chars,
            log_level,
            log_file,
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

/// Parses `chat1:user1,user2;chat2:user3` into a per-chat sender allowlist map.
fn env_group_map(key: &str) -> Option<HashMap<String, Vec<String>>> {
    let raw = std::env::var(key).ok()?;
    let mut map = HashMap::new();
    for group in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (chat_id, senders) = group.split_once(':')?;
        let senders: Vec<String> = senders
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        map.insert(chat_id.trim().to_string(), senders);
    }
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_list_splits_and_trims_csv() {
        std::env::set_var("GATEWAY_CFG_TEST_LIST", " a, b ,c");
        assert_eq!(
            env_list("GATEWAY_CFG_TEST_LIST"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        std::env::remove_var("GATEWAY_CFG_TEST_LIST");
    }

    #[test]
    fn env_list_missing_key_is_none() {
        std::env::remove_var("GATEWAY_CFG_TEST_MISSING");
        assert_eq!(env_list("GATEWAY_CFG_TEST_MISSING"), None);
    }

    #[test]
    fn env_group_map_parses_semicolon_and_comma_delimiters() {
        std::env::set_var("GATEWAY_CFG_TEST_GROUPMAP", "chat1:u1,u2; chat2:u3");
        let map = env_group_map("GATEWAY_CFG_TEST_GROUPMAP").unwrap();
        assert_eq!(map.get("chat1").unwrap(), &vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(map.get("chat2").unwrap(), &vec!["u3".to_string()]);
        std::env::remove_var("GATEWAY_CFG_TEST_GROUPMAP");
    }
}
