use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_API_BASE: &str = "http://localhost:8080";
pub const DEFAULT_INGESTION_HOST: &str = "http://localhost:8081";
pub const DEFAULT_APP_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_SETTINGS_PATH: &str = "/settings";
pub const DEFAULT_CALLBACK_PATH: &str = "/gmail/callback";

const DEFAULT_POPUP_WIDTH: u32 = 500;
const DEFAULT_POPUP_HEIGHT: u32 = 600;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_POPUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SESSION_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_API_BASE: &str = "GMC_API_BASE";
const ENV_INGESTION_HOST: &str = "GMC_INGESTION_HOST";
const ENV_APP_ORIGIN: &str = "GMC_APP_ORIGIN";
const ENV_SETTINGS_PATH: &str = "GMC_SETTINGS_PATH";
const ENV_CALLBACK_PATH: &str = "GMC_CALLBACK_PATH";
const ENV_STRATEGY: &str = "GMC_STRATEGY";
const ENV_POPUP_TIMEOUT_SECS: &str = "GMC_POPUP_TIMEOUT_SECS";
const ENV_SESSION_WAIT_MS: &str = "GMC_SESSION_WAIT_MS";
const ENV_REQUEST_TIMEOUT_SECS: &str = "GMC_REQUEST_TIMEOUT_SECS";

/// How the consent page is presented to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStrategy {
    #[default]
    Redirect,
    Popup,
}

impl Display for ConsentStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redirect => write!(f, "redirect"),
            Self::Popup => write!(f, "popup"),
        }
    }
}

impl FromStr for ConsentStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redirect" => Ok(Self::Redirect),
            "popup" => Ok(Self::Popup),
            other => Err(format!("invalid consent strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupSize {
    pub width: u32,
    pub height: u32,
}

impl Default for PopupSize {
    fn default() -> Self {
        Self {
            width: DEFAULT_POPUP_WIDTH,
            height: DEFAULT_POPUP_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectConfig {
    /// Base URL of the token-management API (`/api/gmail/*`).
    pub api_base: Url,
    /// Base URL of the email-ingestion service (`/fetch`).
    pub ingestion_host: Url,
    /// Origin of the hosting application; popup messages from any other
    /// origin are rejected.
    pub app_origin: Url,
    pub settings_path: String,
    pub callback_path: String,
    pub strategy: ConsentStrategy,
    pub popup_size: PopupSize,
    pub poll_interval: Duration,
    pub popup_timeout: Duration,
    pub session_wait: Duration,
    pub request_timeout: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            api_base: default_url(DEFAULT_API_BASE),
            ingestion_host: default_url(DEFAULT_INGESTION_HOST),
            app_origin: default_url(DEFAULT_APP_ORIGIN),
            settings_path: DEFAULT_SETTINGS_PATH.to_string(),
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            strategy: ConsentStrategy::default(),
            popup_size: PopupSize::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            popup_timeout: DEFAULT_POPUP_TIMEOUT,
            session_wait: DEFAULT_SESSION_WAIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn default_url(raw: &str) -> Url {
    // Compile-time constants; parsing cannot fail.
    Url::parse(raw).unwrap_or_else(|_| unreachable!("invalid built-in URL {raw}"))
}

/// On-disk overrides. Every field is optional; unknown keys are rejected so
/// typos do not silently fall back to defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    api_base: Option<String>,
    ingestion_host: Option<String>,
    app_origin: Option<String>,
    settings_path: Option<String>,
    callback_path: Option<String>,
    strategy: Option<ConsentStrategy>,
    popup_width: Option<u32>,
    popup_height: Option<u32>,
    poll_interval_ms: Option<u64>,
    popup_timeout_secs: Option<u64>,
    session_wait_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
}

impl ConnectConfig {
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".gmconnect").join("config.json"))
    }

    /// Defaults, then the config file (explicit path or the default location
    /// when present), then `GMC_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let file_path = path
            .map(Path::to_path_buf)
            .or_else(|| Self::default_config_path().filter(|candidate| candidate.exists()));
        if let Some(file_path) = file_path {
            config.apply_file(&file_path)?;
        }

        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let file: ConfigFile = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;

        if let Some(value) = file.api_base {
            self.api_base = parse_url("api_base", &value)?;
        }
        if let Some(value) = file.ingestion_host {
            self.ingestion_host = parse_url("ingestion_host", &value)?;
        }
        if let Some(value) = file.app_origin {
            self.app_origin = parse_url("app_origin", &value)?;
        }
        if let Some(value) = file.settings_path {
            self.settings_path = parse_path("settings_path", &value)?;
        }
        if let Some(value) = file.callback_path {
            self.callback_path = parse_path("callback_path", &value)?;
        }
        if let Some(value) = file.strategy {
            self.strategy = value;
        }
        if let Some(value) = file.popup_width {
            self.popup_size.width = value;
        }
        if let Some(value) = file.popup_height {
            self.popup_size.height = value;
        }
        if let Some(value) = file.poll_interval_ms {
            self.poll_interval = non_zero("poll_interval_ms", Duration::from_millis(value))?;
        }
        if let Some(value) = file.popup_timeout_secs {
            self.popup_timeout = non_zero("popup_timeout_secs", Duration::from_secs(value))?;
        }
        if let Some(value) = file.session_wait_ms {
            self.session_wait = Duration::from_millis(value);
        }
        if let Some(value) = file.request_timeout_secs {
            self.request_timeout =
                non_zero("request_timeout_secs", Duration::from_secs(value))?;
        }
        Ok(())
    }

    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = lookup(ENV_API_BASE) {
            self.api_base = parse_url(ENV_API_BASE, &value)?;
        }
        if let Some(value) = lookup(ENV_INGESTION_HOST) {
            self.ingestion_host = parse_url(ENV_INGESTION_HOST, &value)?;
        }
        if let Some(value) = lookup(ENV_APP_ORIGIN) {
            self.app_origin = parse_url(ENV_APP_ORIGIN, &value)?;
        }
        if let Some(value) = lookup(ENV_SETTINGS_PATH) {
            self.settings_path = parse_path(ENV_SETTINGS_PATH, &value)?;
        }
        if let Some(value) = lookup(ENV_CALLBACK_PATH) {
            self.callback_path = parse_path(ENV_CALLBACK_PATH, &value)?;
        }
        if let Some(value) = lookup(ENV_STRATEGY) {
            self.strategy = value.parse().map_err(|reason| ConfigError::Invalid {
                field: ENV_STRATEGY,
                value: value.clone(),
                reason,
            })?;
        }
        if let Some(value) = lookup(ENV_POPUP_TIMEOUT_SECS) {
            let secs = parse_number(ENV_POPUP_TIMEOUT_SECS, &value)?;
            self.popup_timeout = non_zero(ENV_POPUP_TIMEOUT_SECS, Duration::from_secs(secs))?;
        }
        if let Some(value) = lookup(ENV_SESSION_WAIT_MS) {
            self.session_wait =
                Duration::from_millis(parse_number(ENV_SESSION_WAIT_MS, &value)?);
        }
        if let Some(value) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            let secs = parse_number(ENV_REQUEST_TIMEOUT_SECS, &value)?;
            self.request_timeout =
                non_zero(ENV_REQUEST_TIMEOUT_SECS, Duration::from_secs(secs))?;
        }
        Ok(())
    }

    /// Serialized origin (`scheme://host[:port]`) used for same-origin checks.
    pub fn app_origin_string(&self) -> String {
        self.app_origin.origin().ascii_serialization()
    }

    pub fn settings_url(&self) -> Result<Url, url::ParseError> {
        self.app_origin.join(&self.settings_path)
    }
}

pub(crate) fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|error| ConfigError::Invalid {
        field,
        value: value.to_string(),
        reason: error.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            field,
            value: value.to_string(),
            reason: "expected an http or https URL".to_string(),
        });
    }
    Ok(url)
}

fn parse_path(field: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if !trimmed.starts_with('/') {
        return Err(ConfigError::Invalid {
            field,
            value: value.to_string(),
            reason: "expected an absolute path starting with '/'".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

fn parse_number(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|error| ConfigError::Invalid {
        field,
        value: value.to_string(),
        reason: error.to_string(),
    })
}

fn non_zero(field: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use uuid::Uuid;

    use super::{ConnectConfig, ConsentStrategy};
    use crate::error::ConfigError;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_handshake_limits() {
        let config = ConnectConfig::default();
        assert_eq!(config.popup_timeout, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.session_wait, Duration::from_secs(5));
        assert_eq!(config.strategy, ConsentStrategy::Redirect);
        assert_eq!(config.popup_size.width, 500);
        assert_eq!(config.popup_size.height, 600);
        assert_eq!(config.app_origin_string(), "http://localhost:3000");
    }

    #[test]
    fn env_overrides_apply_and_blank_values_are_ignored() {
        let vars = env(&[
            ("GMC_API_BASE", "https://tokens.example.com"),
            ("GMC_STRATEGY", "Popup"),
            ("GMC_SESSION_WAIT_MS", "2500"),
            ("GMC_APP_ORIGIN", "   "),
        ]);
        let mut config = ConnectConfig::default();
        config
            .apply_env_with(|key| vars.get(key).cloned())
            .expect("apply env");

        assert_eq!(config.api_base.as_str(), "https://tokens.example.com/");
        assert_eq!(config.strategy, ConsentStrategy::Popup);
        assert_eq!(config.session_wait, Duration::from_millis(2500));
        assert_eq!(config.app_origin_string(), "http://localhost:3000");
    }

    #[test]
    fn env_rejects_non_http_urls_and_zero_timeouts() {
        let vars = env(&[("GMC_API_BASE", "ftp://tokens.example.com")]);
        let error = ConnectConfig::default()
            .apply_env_with(|key| vars.get(key).cloned())
            .expect_err("ftp should be rejected");
        assert!(matches!(error, ConfigError::Invalid { field: "GMC_API_BASE", .. }));

        let vars = env(&[("GMC_POPUP_TIMEOUT_SECS", "0")]);
        let error = ConnectConfig::default()
            .apply_env_with(|key| vars.get(key).cloned())
            .expect_err("zero timeout should be rejected");
        assert!(error.to_string().contains("greater than zero"));
    }

    #[test]
    fn config_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("gmconnect-config-{}.json", Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{
                "ingestion_host": "https://fetch.example.com",
                "settings_path": "/account/settings",
                "strategy": "popup",
                "popup_width": 640,
                "popup_timeout_secs": 120
            }"#,
        )
        .expect("write config file");

        let mut config = ConnectConfig::default();
        config.apply_file(&path).expect("apply config file");

        assert_eq!(config.ingestion_host.as_str(), "https://fetch.example.com/");
        assert_eq!(config.settings_path, "/account/settings");
        assert_eq!(config.strategy, ConsentStrategy::Popup);
        assert_eq!(config.popup_size.width, 640);
        assert_eq!(config.popup_size.height, 600);
        assert_eq!(config.popup_timeout, Duration::from_secs(120));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn config_file_rejects_unknown_keys() {
        let path = std::env::temp_dir().join(format!("gmconnect-config-{}.json", Uuid::new_v4()));
        std::fs::write(&path, r#"{ "api_bsae": "https://typo.example.com" }"#)
            .expect("write config file");

        let error = ConnectConfig::default()
            .apply_file(&path)
            .expect_err("unknown key should fail");
        assert!(matches!(error, ConfigError::Parse { .. }));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn settings_url_joins_origin_and_path() {
        let config = ConnectConfig::default();
        assert_eq!(
            config.settings_url().expect("settings url").as_str(),
            "http://localhost:3000/settings"
        );
    }
}
