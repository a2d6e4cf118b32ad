//! Client configuration loaded from environment variables.
//!
//! Every setting has a default that works against a local development
//! backend, so the client can start with zero configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use huddle_shared::constants::{
    CACHED_MESSAGES_PER_ROOM, DEFAULT_DEDUP_WINDOW_MS, DEFAULT_HEALTH_CHECK_SECS,
    DEFAULT_PAGE_SIZE, SEEN_IDS_MAX, SEEN_IDS_RETAIN,
};

use crate::reconcile::DedupPolicy;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// PostgREST endpoint.
    /// Env: `HUDDLE_REST_URL`
    /// Default: `http://localhost:54321/rest/v1`
    pub rest_url: String,

    /// Realtime service root.
    /// Env: `HUDDLE_REALTIME_URL`
    /// Default: `ws://localhost:54321/realtime/v1`
    pub realtime_url: String,

    /// Project API key sent with every request.
    /// Env: `HUDDLE_API_KEY`
    pub api_key: String,

    /// SQLite file backing the local cache.
    /// Env: `HUDDLE_CACHE_PATH`
    /// Default: `None` (platform data directory).
    pub cache_path: Option<PathBuf>,

    /// Two messages from the same author with the same content inside this
    /// window are one logical message.
    /// Env: `HUDDLE_DEDUP_WINDOW_MS`
    /// Default: 10 s
    pub dedup_window: Duration,

    /// Env: `HUDDLE_HEALTH_CHECK_SECS`
    /// Default: 30 s
    pub health_check_interval: Duration,

    /// Env: `HUDDLE_SEEN_IDS_MAX`
    pub seen_ids_max: usize,

    /// Env: `HUDDLE_SEEN_IDS_RETAIN`
    pub seen_ids_retain: usize,

    /// Env: `HUDDLE_PAGE_SIZE`
    pub page_size: usize,

    /// Env: `HUDDLE_CACHED_MESSAGES`
    pub cached_messages_per_room: usize,

    /// Append a system entry to the timeline when another member is kicked.
    /// Env: `HUDDLE_ANNOUNCE_MEMBERSHIP` (true/false)
    /// Default: `true`
    pub announce_membership: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rest_url: "http://localhost:54321/rest/v1".to_string(),
            realtime_url: "ws://localhost:54321/realtime/v1".to_string(),
            api_key: String::new(),
            cache_path: None,
            dedup_window: Duration::from_millis(DEFAULT_DEDUP_WINDOW_MS),
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_SECS),
            seen_ids_max: SEEN_IDS_MAX,
            seen_ids_retain: SEEN_IDS_RETAIN,
            page_size: DEFAULT_PAGE_SIZE,
            cached_messages_per_room: CACHED_MESSAGES_PER_ROOM,
            announce_membership: true,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = var("HUDDLE_REST_URL") {
            config.rest_url = url;
        }
        if let Some(url) = var("HUDDLE_REALTIME_URL") {
            config.realtime_url = url;
        }
        if let Some(key) = var("HUDDLE_API_KEY") {
            config.api_key = key;
        }
        if let Some(path) = var("HUDDLE_CACHE_PATH") {
            if !path.is_empty() {
                config.cache_path = Some(PathBuf::from(path));
            }
        }

        if let Some(ms) = parsed::<u64>(&var, "HUDDLE_DEDUP_WINDOW_MS") {
            config.dedup_window = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed::<u64>(&var, "HUDDLE_HEALTH_CHECK_SECS") {
            if secs == 0 {
                tracing::warn!("HUDDLE_HEALTH_CHECK_SECS must be positive, using default");
            } else {
                config.health_check_interval = Duration::from_secs(secs);
            }
        }
        if let Some(n) = parsed(&var, "HUDDLE_SEEN_IDS_MAX") {
            config.seen_ids_max = n;
        }
        if let Some(n) = parsed(&var, "HUDDLE_SEEN_IDS_RETAIN") {
            config.seen_ids_retain = n;
        }
        if config.seen_ids_retain > config.seen_ids_max {
            tracing::warn!(
                max = config.seen_ids_max,
                retain = config.seen_ids_retain,
                "seen-id retain exceeds max, clamping"
            );
            config.seen_ids_retain = config.seen_ids_max;
        }
        if let Some(n) = parsed::<usize>(&var, "HUDDLE_PAGE_SIZE") {
            config.page_size = n.max(1);
        }
        if let Some(n) = parsed::<usize>(&var, "HUDDLE_CACHED_MESSAGES") {
            config.cached_messages_per_room = n.max(1);
        }
        if let Some(val) = var("HUDDLE_ANNOUNCE_MEMBERSHIP") {
            config.announce_membership = val != "false" && val != "0";
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy::new(self.dedup_window)
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.dedup_window, Duration::from_secs(10));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.page_size, 20);
        assert_eq!((config.seen_ids_max, config.seen_ids_retain), (1000, 500));
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_vars(vars(&[
            ("HUDDLE_DEDUP_WINDOW_MS", "5000"),
            ("HUDDLE_PAGE_SIZE", "50"),
            ("HUDDLE_ANNOUNCE_MEMBERSHIP", "false"),
            ("HUDDLE_CACHE_PATH", "/tmp/h.db"),
        ]));
        assert_eq!(config.dedup_window, Duration::from_secs(5));
        assert_eq!(config.page_size, 50);
        assert!(!config.announce_membership);
        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/h.db")));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ClientConfig::from_vars(vars(&[
            ("HUDDLE_DEDUP_WINDOW_MS", "soon"),
            ("HUDDLE_HEALTH_CHECK_SECS", "0"),
            ("HUDDLE_SEEN_IDS_MAX", "10"),
        ]));
        assert_eq!(config.dedup_window, Duration::from_secs(10));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.seen_ids_retain, 10);
    }
}
