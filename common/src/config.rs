use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::LinkError;

/// What an unresolved configuration template renders to.
pub const UNRESOLVED_URL: &str = "undefined";

pub const ENV_BROKER_URL: &str = "MQTT_URL";
pub const ENV_CLIENT_ID: &str = "MQTT_CLIENT_ID";
pub const ENV_MAX_LISTENERS: &str = "MQTT_MAX_LISTENERS";
pub const ENV_LOG_PROFILE: &str = "HOMELINK_ENV";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub broker_url: String,
    pub client_id: String,
    pub connect_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub reconnect_period_ms: u64,
    pub poll_interval_ms: u64,
    pub ready_timeout_ms: u64,
    pub max_listeners: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            client_id: "homelink".to_string(),
            connect_timeout_ms: 10_000,
            keep_alive_secs: 60,
            reconnect_period_ms: 1_000,
            poll_interval_ms: 100,
            ready_timeout_ms: 3_000,
            max_listeners: 15,
        }
    }
}

impl LinkConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            ..Self::default()
        }
    }

    /// Overlays `MQTT_URL`, `MQTT_CLIENT_ID` and `MQTT_MAX_LISTENERS` onto the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(ENV_BROKER_URL) {
            config.broker_url = url;
        }
        if let Ok(client_id) = std::env::var(ENV_CLIENT_ID) {
            config.client_id = client_id;
        }
        if let Some(limit) = std::env::var(ENV_MAX_LISTENERS)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
        {
            config.max_listeners = limit;
        }
        config.sanitize();
        config
    }

    pub fn sanitize(&mut self) {
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = 100;
        }
        if self.max_listeners == 0 {
            self.max_listeners = 15;
        }
        if self.client_id.trim().is_empty() {
            self.client_id = "homelink".to_string();
        }
        self.connect_timeout_ms = self.connect_timeout_ms.max(1_000);
    }
}

/// Selects the log sink layout installed by [`crate::logging::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogProfile {
    Production,
    Development,
}

impl LogProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
        }
    }

    /// Reads `HOMELINK_ENV`; unset means production.
    pub fn from_env() -> Result<Self, LinkError> {
        match std::env::var(ENV_LOG_PROFILE) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::Production),
        }
    }
}

impl FromStr for LogProfile {
    type Err = LinkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            _ => Err(LinkError::UnsupportedLogProfile(value.to_string())),
        }
    }
}

impl fmt::Display for LogProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
