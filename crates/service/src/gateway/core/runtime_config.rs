use reqwest::blocking::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

use crate::lock_utils::{read_recover, write_recover};

static UPSTREAM_CLIENT: OnceLock<Client> = OnceLock::new();
static RUNTIME_CONFIG_LOADED: OnceLock<()> = OnceLock::new();
static RETRY_BUDGET: AtomicUsize = AtomicUsize::new(DEFAULT_RETRY_BUDGET);
static STREAM_QUEUE_CAPACITY: AtomicUsize = AtomicUsize::new(DEFAULT_STREAM_QUEUE_CAPACITY);
static STREAM_DRAIN_GRACE_MS: AtomicU64 = AtomicU64::new(DEFAULT_STREAM_DRAIN_GRACE_MS);
static FRONT_MAX_BODY_BYTES: AtomicUsize = AtomicUsize::new(DEFAULT_FRONT_MAX_BODY_BYTES);
static UPSTREAM_CONNECT_TIMEOUT_SECS: AtomicU64 = AtomicU64::new(DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS);
static UPSTREAM_TOTAL_TIMEOUT_MS: AtomicU64 = AtomicU64::new(DEFAULT_UPSTREAM_TOTAL_TIMEOUT_MS);
static UPSTREAM_STREAM_TIMEOUT_MS: AtomicU64 = AtomicU64::new(DEFAULT_UPSTREAM_STREAM_TIMEOUT_MS);
static DIRECTORY_SYNC_INTERVAL_SECS: AtomicU64 = AtomicU64::new(DEFAULT_DIRECTORY_SYNC_INTERVAL_SECS);
static DEFAULT_GROUP: OnceLock<RwLock<String>> = OnceLock::new();
static MODEL_ALIAS_OVERRIDES: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

pub(crate) const DEFAULT_RETRY_BUDGET: usize = 3;
pub(crate) const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 5;
pub(crate) const DEFAULT_STREAM_DRAIN_GRACE_MS: u64 = 2_000;
const DEFAULT_FRONT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_UPSTREAM_TOTAL_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_UPSTREAM_STREAM_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_DIRECTORY_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_GROUP_NAME: &str = "default";

const ENV_RETRY_BUDGET: &str = "CHANNELRELAY_RETRY_BUDGET";
const ENV_STREAM_QUEUE_CAPACITY: &str = "CHANNELRELAY_STREAM_QUEUE_CAPACITY";
const ENV_STREAM_DRAIN_GRACE_MS: &str = "CHANNELRELAY_STREAM_DRAIN_GRACE_MS";
const ENV_FRONT_MAX_BODY_BYTES: &str = "CHANNELRELAY_FRONT_MAX_BODY_BYTES";
const ENV_UPSTREAM_CONNECT_TIMEOUT_SECS: &str = "CHANNELRELAY_UPSTREAM_CONNECT_TIMEOUT_SECS";
const ENV_UPSTREAM_TOTAL_TIMEOUT_MS: &str = "CHANNELRELAY_UPSTREAM_TOTAL_TIMEOUT_MS";
const ENV_UPSTREAM_STREAM_TIMEOUT_MS: &str = "CHANNELRELAY_UPSTREAM_STREAM_TIMEOUT_MS";
const ENV_DIRECTORY_SYNC_INTERVAL_SECS: &str = "CHANNELRELAY_DIRECTORY_SYNC_INTERVAL_SECS";
const ENV_DEFAULT_GROUP: &str = "CHANNELRELAY_DEFAULT_GROUP";
const ENV_MODEL_ALIASES: &str = "CHANNELRELAY_MODEL_ALIASES";

pub(crate) fn upstream_client() -> &'static Client {
    UPSTREAM_CLIENT.get_or_init(|| {
        ensure_runtime_config_loaded();
        build_upstream_client()
    })
}

pub(crate) fn fresh_upstream_client() -> Client {
    ensure_runtime_config_loaded();
    build_upstream_client()
}

fn build_upstream_client() -> Client {
    let connect_timeout = Duration::from_secs(UPSTREAM_CONNECT_TIMEOUT_SECS.load(Ordering::Relaxed));
    Client::builder()
        // 中文注释：客户端层不设总超时，每次请求按流式/非流式单独设置，避免长流被误杀。
        .timeout(None::<Duration>)
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn millis_or_none(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(value))
}

pub(crate) fn upstream_total_timeout() -> Option<Duration> {
    ensure_runtime_config_loaded();
    millis_or_none(UPSTREAM_TOTAL_TIMEOUT_MS.load(Ordering::Relaxed))
}

pub(crate) fn upstream_stream_timeout() -> Option<Duration> {
    ensure_runtime_config_loaded();
    millis_or_none(UPSTREAM_STREAM_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Total upstream attempts per client request, first attempt included.
pub(crate) fn retry_budget() -> usize {
    ensure_runtime_config_loaded();
    RETRY_BUDGET.load(Ordering::Relaxed).max(1)
}

pub(crate) fn stream_queue_capacity() -> usize {
    ensure_runtime_config_loaded();
    STREAM_QUEUE_CAPACITY.load(Ordering::Relaxed).max(1)
}

pub(crate) fn stream_drain_grace() -> Duration {
    ensure_runtime_config_loaded();
    Duration::from_millis(STREAM_DRAIN_GRACE_MS.load(Ordering::Relaxed))
}

pub(crate) fn front_max_body_bytes() -> usize {
    ensure_runtime_config_loaded();
    FRONT_MAX_BODY_BYTES.load(Ordering::Relaxed)
}

/// `None` disables the periodic directory reload.
pub(crate) fn directory_sync_interval() -> Option<Duration> {
    ensure_runtime_config_loaded();
    let secs = DIRECTORY_SYNC_INTERVAL_SECS.load(Ordering::Relaxed);
    (secs > 0).then(|| Duration::from_secs(secs))
}

pub(crate) fn default_group() -> String {
    ensure_runtime_config_loaded();
    read_recover(default_group_cell(), "default_group").clone()
}

pub(crate) fn model_alias_override(model: &str) -> Option<String> {
    ensure_runtime_config_loaded();
    read_recover(model_alias_cell(), "model_alias_overrides")
        .get(model)
        .cloned()
}

pub(crate) fn reload_from_env() {
    RETRY_BUDGET.store(
        env_usize_or(ENV_RETRY_BUDGET, DEFAULT_RETRY_BUDGET).max(1),
        Ordering::Relaxed,
    );
    STREAM_QUEUE_CAPACITY.store(
        env_usize_or(ENV_STREAM_QUEUE_CAPACITY, DEFAULT_STREAM_QUEUE_CAPACITY).max(1),
        Ordering::Relaxed,
    );
    STREAM_DRAIN_GRACE_MS.store(
        env_u64_or(ENV_STREAM_DRAIN_GRACE_MS, DEFAULT_STREAM_DRAIN_GRACE_MS),
        Ordering::Relaxed,
    );
    FRONT_MAX_BODY_BYTES.store(
        env_usize_or(ENV_FRONT_MAX_BODY_BYTES, DEFAULT_FRONT_MAX_BODY_BYTES),
        Ordering::Relaxed,
    );
    UPSTREAM_CONNECT_TIMEOUT_SECS.store(
        env_u64_or(
            ENV_UPSTREAM_CONNECT_TIMEOUT_SECS,
            DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS,
        ),
        Ordering::Relaxed,
    );
    UPSTREAM_TOTAL_TIMEOUT_MS.store(
        env_u64_or(ENV_UPSTREAM_TOTAL_TIMEOUT_MS, DEFAULT_UPSTREAM_TOTAL_TIMEOUT_MS),
        Ordering::Relaxed,
    );
    UPSTREAM_STREAM_TIMEOUT_MS.store(
        env_u64_or(ENV_UPSTREAM_STREAM_TIMEOUT_MS, DEFAULT_UPSTREAM_STREAM_TIMEOUT_MS),
        Ordering::Relaxed,
    );
    DIRECTORY_SYNC_INTERVAL_SECS.store(
        env_u64_or(
            ENV_DIRECTORY_SYNC_INTERVAL_SECS,
            DEFAULT_DIRECTORY_SYNC_INTERVAL_SECS,
        ),
        Ordering::Relaxed,
    );

    let group = env_non_empty(ENV_DEFAULT_GROUP).unwrap_or_else(|| DEFAULT_GROUP_NAME.to_string());
    *write_recover(default_group_cell(), "default_group") = group;

    let aliases = env_non_empty(ENV_MODEL_ALIASES)
        .map(|raw| parse_model_aliases(&raw))
        .unwrap_or_default();
    *write_recover(model_alias_cell(), "model_alias_overrides") = aliases;
}

fn parse_model_aliases(raw: &str) -> HashMap<String, String> {
    match serde_json::from_str::<HashMap<String, String>>(raw) {
        Ok(map) => map
            .into_iter()
            .map(|(from, to)| (from.trim().to_string(), to.trim().to_string()))
            .filter(|(from, to)| !from.is_empty() && !to.is_empty())
            .collect(),
        Err(err) => {
            log::warn!("event=config_invalid key={} err={}", ENV_MODEL_ALIASES, err);
            HashMap::new()
        }
    }
}

fn ensure_runtime_config_loaded() {
    let _ = RUNTIME_CONFIG_LOADED.get_or_init(reload_from_env);
}

fn default_group_cell() -> &'static RwLock<String> {
    DEFAULT_GROUP.get_or_init(|| RwLock::new(DEFAULT_GROUP_NAME.to_string()))
}

fn model_alias_cell() -> &'static RwLock<HashMap<String, String>> {
    MODEL_ALIAS_OVERRIDES.get_or_init(|| RwLock::new(HashMap::new()))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64_or(name: &str, default: u64) -> u64 {
    env_non_empty(name)
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize_or(name: &str, default: usize) -> usize {
    env_non_empty(name)
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test_env::{lock_env, EnvGuard};

    #[test]
    fn reload_from_env_updates_relay_settings() {
        let _lock = lock_env();
        let _budget = EnvGuard::set(ENV_RETRY_BUDGET, "0");
        let _capacity = EnvGuard::set(ENV_STREAM_QUEUE_CAPACITY, "9");
        let _grace = EnvGuard::set(ENV_STREAM_DRAIN_GRACE_MS, "15");
        let _timeout = EnvGuard::set(ENV_UPSTREAM_TOTAL_TIMEOUT_MS, "777");
        let _stream_timeout = EnvGuard::set(ENV_UPSTREAM_STREAM_TIMEOUT_MS, "0");
        let _sync = EnvGuard::set(ENV_DIRECTORY_SYNC_INTERVAL_SECS, "0");
        let _group = EnvGuard::set(ENV_DEFAULT_GROUP, " vip ");
        let _aliases = EnvGuard::set(ENV_MODEL_ALIASES, r#"{"m":"m-2024"," ":"x"}"#);

        reload_from_env();

        assert_eq!(retry_budget(), 1);
        assert_eq!(stream_queue_capacity(), 9);
        assert_eq!(stream_drain_grace(), Duration::from_millis(15));
        assert_eq!(upstream_total_timeout(), Some(Duration::from_millis(777)));
        assert_eq!(upstream_stream_timeout(), None);
        assert_eq!(directory_sync_interval(), None);
        assert_eq!(default_group(), "vip");
        assert_eq!(model_alias_override("m").as_deref(), Some("m-2024"));
        assert_eq!(model_alias_override(""), None);

        drop((_budget, _capacity, _grace, _timeout, _stream_timeout, _sync, _group, _aliases));
        reload_from_env();
        assert_eq!(retry_budget(), DEFAULT_RETRY_BUDGET);
        assert_eq!(default_group(), DEFAULT_GROUP_NAME);
    }

    #[test]
    fn invalid_alias_json_is_ignored() {
        assert!(parse_model_aliases("not json").is_empty());
        assert_eq!(
            parse_model_aliases(r#"{"a":"b"}"#).get("a").map(String::as_str),
            Some("b")
        );
    }
}
