use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::live::Backoff;

const DEFAULT_ADDR: &str = "0.0.0.0:9001";
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 200;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_APPEND_RETRIES: u32 = 5;
const DEFAULT_SUMMARY_RETRIES: u32 = 3;
const DEFAULT_NOTIFY_BODY_MAX: usize = 120;

/// Runtime settings, read from `RENTAL_CHAT_*` environment variables.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub addr: String,
    /// Shared token clients must present on connect, when set
    pub access_token: Option<String>,
    pub seed_path: Option<PathBuf>,
    pub backoff: Backoff,
    /// Attempts for a message write that fails on connectivity
    pub append_retries: u32,
    /// Attempts for the compensating conversation update on stores
    /// without transactional appends
    pub summary_retries: u32,
    /// Max characters of message text carried in a notification body
    pub notify_body_max: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            access_token: None,
            seed_path: None,
            backoff: Backoff::new(
                Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
                Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            ),
            append_retries: DEFAULT_APPEND_RETRIES,
            summary_retries: DEFAULT_SUMMARY_RETRIES,
            notify_body_max: DEFAULT_NOTIFY_BODY_MAX,
        }
    }
}

impl ChatConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backoff = Backoff::new(
            Duration::from_millis(parse_or(
                non_empty("RENTAL_CHAT_BACKOFF_INITIAL_MS"),
                "RENTAL_CHAT_BACKOFF_INITIAL_MS",
                DEFAULT_BACKOFF_INITIAL_MS,
            )),
            Duration::from_millis(parse_or(
                non_empty("RENTAL_CHAT_BACKOFF_MAX_MS"),
                "RENTAL_CHAT_BACKOFF_MAX_MS",
                DEFAULT_BACKOFF_MAX_MS,
            )),
        );

        Self {
            addr: non_empty("RENTAL_CHAT_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            access_token: non_empty("RENTAL_CHAT_ACCESS_TOKEN"),
            seed_path: non_empty("RENTAL_CHAT_SEED").map(PathBuf::from),
            backoff,
            append_retries: parse_or(
                non_empty("RENTAL_CHAT_APPEND_RETRIES"),
                "RENTAL_CHAT_APPEND_RETRIES",
                DEFAULT_APPEND_RETRIES,
            ),
            summary_retries: parse_or(
                non_empty("RENTAL_CHAT_SUMMARY_RETRIES"),
                "RENTAL_CHAT_SUMMARY_RETRIES",
                DEFAULT_SUMMARY_RETRIES,
            ),
            notify_body_max: parse_or(
                non_empty("RENTAL_CHAT_NOTIFY_BODY_MAX"),
                "RENTAL_CHAT_NOTIFY_BODY_MAX",
                DEFAULT_NOTIFY_BODY_MAX,
            )
            .max(1),
        }
    }
}

fn parse_or<T: FromStr + std::fmt::Display>(raw: Option<String>, key: &str, default: T) -> T {
    match raw {
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value {:?} for {}, using {}", value, key, default);
            default
        }),
        None => default,
    }
}
