use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "order_sync.toml";
pub const CONFIG_PATH_ENV: &str = "ORDER_SYNC_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Base of the order REST API; `/orders` is appended.
    pub api_url: String,
    /// Live channel endpoint. Derived from `api_url` when unset.
    pub ws_url: Option<String>,
    pub auth_url: String,
    pub request_timeout: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub credentials_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080/api".into(),
            ws_url: None,
            auth_url: "http://127.0.0.1:8081/api/v1".into(),
            request_timeout: Duration::from_secs(10),
            reconnect_initial_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(30),
            credentials_path: PathBuf::from(".order_sync/credentials.json"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    api_url: Option<String>,
    ws_url: Option<String>,
    auth_url: Option<String>,
    request_timeout_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    credentials_path: Option<PathBuf>,
}

impl Settings {
    /// Live channel URL: explicit `ws_url`, otherwise `ws(s)://<api host>/ws`.
    pub fn live_url(&self) -> anyhow::Result<String> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(ws_url.clone());
        }
        derive_ws_url(&self.api_url)
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.api_url {
            self.api_url = v;
        }
        if let Some(v) = file.ws_url {
            self.ws_url = Some(v);
        }
        if let Some(v) = file.auth_url {
            self.auth_url = v;
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.reconnect_initial_ms {
            self.reconnect_initial_backoff = Duration::from_millis(v);
        }
        if let Some(v) = file.reconnect_max_ms {
            self.reconnect_max_backoff = Duration::from_millis(v);
        }
        if let Some(v) = file.credentials_path {
            self.credentials_path = v;
        }
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ORDER_SYNC_API_URL") {
            self.api_url = v;
        }
        if let Some(v) = lookup("APP__API_URL") {
            self.api_url = v;
        }
        if let Some(v) = lookup("APP__WS_URL") {
            self.ws_url = Some(v);
        }
        if let Some(v) = lookup("APP__AUTH_URL") {
            self.auth_url = v;
        }
        if let Some(v) = lookup("APP__REQUEST_TIMEOUT_SECS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.request_timeout = Duration::from_secs(parsed);
            }
        }
        if let Some(v) = lookup("APP__RECONNECT_INITIAL_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.reconnect_initial_backoff = Duration::from_millis(parsed);
            }
        }
        if let Some(v) = lookup("APP__RECONNECT_MAX_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                self.reconnect_max_backoff = Duration::from_millis(parsed);
            }
        }
        if let Some(v) = lookup("APP__CREDENTIALS_PATH") {
            self.credentials_path = PathBuf::from(v);
        }
    }
}

/// Defaults, then `order_sync.toml` (or `$ORDER_SYNC_CONFIG`) when present,
/// then environment overrides. A missing default file is not an error.
pub fn load_settings() -> anyhow::Result<Settings> {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => load_settings_from(Some(Path::new(&path))),
        Err(_) => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            load_settings_from(default_path.exists().then_some(default_path))
        }
    }
}

/// Like [`load_settings`] with an explicit file, which must exist.
pub fn load_settings_from(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    if let Some(path) = path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        settings.apply_file(parse_file_settings(&raw).with_context(|| {
            format!("failed to parse config file '{}'", path.display())
        })?);
    }
    settings.apply_env(|key| std::env::var(key).ok());
    Ok(settings)
}

fn parse_file_settings(raw: &str) -> anyhow::Result<FileSettings> {
    Ok(toml::from_str::<FileSettings>(raw)?)
}

fn derive_ws_url(api_url: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(api_url).with_context(|| format!("invalid api url: {api_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("api url must be http:// or https://, got {other}://")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot derive websocket url from {api_url}"))?;
    url.set_path("/ws");
    url.set_query(None);
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
