/// Configuration management
use crate::error::{RealtimeError, Result};
use crate::models::{RecordId, SenderRole, Viewer};
use crate::transport::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";
const DEFAULT_PUSH_URL: &str = "ws://127.0.0.1:8080/ws";

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// REST base URL, e.g. `http://host:8080/api`
    pub api_base_url: String,

    /// Push endpoint, e.g. `ws://host:8080/ws`
    pub push_url: String,

    /// Who the session belongs to
    pub user_id: RecordId,

    pub role: SenderRole,

    /// First reconnect delay; doubles per failed attempt
    pub reconnect_base_delay: Duration,

    pub reconnect_max_delay: Duration,

    /// Failed attempts before the push channel is declared unavailable
    pub max_reconnect_attempts: u32,

    pub connect_timeout: Duration,

    pub request_timeout: Duration,

    /// Unread-count polling period
    pub poll_interval: Duration,

    /// How far apart a local echo and its server copy may be stamped
    pub echo_match_window: Duration,

    /// Store event channel capacity
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            push_url: DEFAULT_PUSH_URL.to_string(),
            user_id: RecordId::from(1),
            role: SenderRole::User,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(30),
            echo_match_window: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(RealtimeError::Config(format!(
                "Usage: {} <user_id> [--staff] [--api-url <url>] [--push-url <url>] [--poll-secs <n>] [--max-reconnect <n>]",
                args.first().map(String::as_str).unwrap_or("realtime")
            )));
        }

        let user_id = args[1].trim();
        if user_id.is_empty() || user_id.starts_with("--") {
            return Err(RealtimeError::Config("First argument must be a user id".to_string()));
        }

        let mut config = Self {
            user_id: RecordId::from(user_id),
            ..Default::default()
        };

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--staff" => {
                    config.role = SenderRole::Staff;
                    i += 1;
                }
                "--api-url" => {
                    config.api_base_url = flag_value(args, i)?.to_string();
                    i += 2;
                }
                "--push-url" => {
                    config.push_url = flag_value(args, i)?.to_string();
                    i += 2;
                }
                "--poll-secs" => {
                    config.poll_interval = Duration::from_secs(parse_secs(flag_value(args, i)?, "--poll-secs")?);
                    i += 2;
                }
                "--max-reconnect" => {
                    config.max_reconnect_attempts = flag_value(args, i)?
                        .parse::<u32>()
                        .map_err(|_| RealtimeError::Config("--max-reconnect must be a number".to_string()))?;
                    i += 2;
                }
                other => {
                    return Err(RealtimeError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("LOSTFOUND_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = std::env::var("LOSTFOUND_PUSH_URL") {
            config.push_url = url;
        }
        if let Some(secs) = std::env::var("LOSTFOUND_POLL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            config.poll_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(RealtimeError::Config(format!(
                "API URL must be http(s): {}",
                self.api_base_url
            )));
        }
        if !self.push_url.starts_with("ws://") && !self.push_url.starts_with("wss://") {
            return Err(RealtimeError::Config(format!("Push URL must be ws(s): {}", self.push_url)));
        }
        if self.poll_interval.is_zero() {
            return Err(RealtimeError::Config("Poll interval must be positive".to_string()));
        }
        Ok(())
    }

    pub fn viewer(&self) -> Viewer {
        Viewer::new(self.user_id.clone(), self.role)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

fn flag_value<'a>(args: &'a [String], i: usize) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| RealtimeError::Config(format!("{} requires a value", args[i])))
}

fn parse_secs(raw: &str, flag: &str) -> Result<u64> {
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(RealtimeError::Config(format!("{} must be a positive number", flag))),
    }
}
