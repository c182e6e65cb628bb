use std::{fs, time::Duration};

use url::Url;

use crate::error::ClientError;

pub const CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed,
    Exponential,
}

impl BackoffPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(Self::Fixed),
            "exponential" | "exp" => Some(Self::Exponential),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffPolicy::Fixed => self.delay,
            BackoffPolicy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.delay.saturating_mul(1u32 << exponent)
            }
        };
        delay.min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            backoff: BackoffPolicy::Exponential,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub server_url: String,
    pub api_base_url: Option<String>,
    pub reconnect: ReconnectPolicy,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:5000".into(),
            api_base_url: None,
            reconnect: ReconnectPolicy::default(),
            event_buffer: 1024,
        }
    }
}

impl ClientSettings {
    pub fn api_base_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| format!("{}/api", self.server_url.trim_end_matches('/')))
    }

    pub fn websocket_url(&self) -> Result<Url, ClientError> {
        let mut url = Url::parse(self.server_url.trim())
            .map_err(|err| ClientError::InvalidServerUrl(format!("{}: {err}", self.server_url)))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ClientError::InvalidServerUrl(format!(
                    "server_url must start with http:// or https://, got {other}://"
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            ClientError::InvalidServerUrl(format!("cannot use {scheme} for {}", self.server_url))
        })?;
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url)
    }
}

pub fn load_settings() -> ClientSettings {
    let raw = fs::read_to_string(CONFIG_FILE).ok();
    load_settings_from(raw.as_deref(), |key| std::env::var(key).ok())
}

/// Environment variables and the `client.toml` key each one overrides,
/// applied in order.
const ENV_KEYS: &[(&str, &str)] = &[
    ("CHAT_SERVER_URL", "server_url"),
    ("APP__SERVER_URL", "server_url"),
    ("APP__API_BASE_URL", "api_base_url"),
    ("APP__RECONNECT_ATTEMPTS", "reconnect_attempts"),
    ("APP__RECONNECT_DELAY_MS", "reconnect_delay_ms"),
    ("APP__RECONNECT_MAX_DELAY_MS", "reconnect_max_delay_ms"),
    ("APP__RECONNECT_BACKOFF", "reconnect_backoff"),
    ("APP__EVENT_BUFFER", "event_buffer"),
];

pub fn load_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Some(raw) = file_contents {
        if let Ok(file_cfg) = toml::from_str::<toml::Table>(raw) {
            for (key, value) in &file_cfg {
                let value = match value {
                    toml::Value::String(v) => v.clone(),
                    toml::Value::Integer(v) => v.to_string(),
                    _ => continue,
                };
                apply_setting(&mut settings, key, &value);
            }
        }
    }

    for &(var, key) in ENV_KEYS {
        if let Some(value) = env(var) {
            apply_setting(&mut settings, key, &value);
        }
    }

    settings
}

/// Invalid values leave the current setting in place.
fn apply_setting(settings: &mut ClientSettings, key: &str, value: &str) {
    match key {
        "server_url" => settings.server_url = value.to_string(),
        "api_base_url" => settings.api_base_url = Some(value.to_string()),
        "reconnect_attempts" => {
            if let Ok(parsed) = value.parse::<u32>() {
                settings.reconnect.max_attempts = parsed;
            }
        }
        "reconnect_delay_ms" => {
            if let Ok(parsed) = value.parse::<u64>() {
                settings.reconnect.delay = Duration::from_millis(parsed);
            }
        }
        "reconnect_max_delay_ms" => {
            if let Ok(parsed) = value.parse::<u64>() {
                settings.reconnect.max_delay = Duration::from_millis(parsed);
            }
        }
        "reconnect_backoff" => {
            if let Some(policy) = BackoffPolicy::parse(value) {
                settings.reconnect.backoff = policy;
            }
        }
        "event_buffer" => {
            if let Ok(parsed) = value.parse::<usize>() {
                if parsed > 0 {
                    settings.event_buffer = parsed;
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
