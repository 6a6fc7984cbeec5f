use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

fn default_true() -> bool {
    true
}

fn default_max_age_days() -> u64 {
    30
}

fn default_max_size_mb() -> u64 {
    500
}

fn default_proxy_type() -> String {
    "http".to_string()
}

/// Settings consumed from the application's key/value store. The feed reader
/// UI writes this file; the proxy engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub media_cache_enabled: bool,
    /// When the cache is disabled or a cached fetch fails, allow streaming
    /// the media directly from the origin instead.
    #[serde(default = "default_true")]
    pub media_proxy_fallback: bool,
    #[serde(default = "default_max_age_days")]
    pub media_cache_max_age_days: u64,
    #[serde(default = "default_max_size_mb")]
    pub media_cache_max_size_mb: u64,

    /// Outbound proxy for upstream fetches (corporate networks, Tor, ...).
    #[serde(default)]
    pub proxy_enabled: bool,
    /// One of "http", "https", "socks5".
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
    #[serde(default)]
    pub proxy_host: String,
    #[serde(default)]
    pub proxy_port: u16,
    #[serde(default)]
    pub proxy_username: String,
    #[serde(default)]
    pub proxy_password: String,
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults when the
    /// file is missing or unreadable (first launch, UI not yet saved).
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(settings) => settings,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "settings file unparseable, using defaults");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    /// Outbound proxy URL for reqwest, or None when disabled/unconfigured.
    pub fn outbound_proxy_url(&self) -> Option<String> {
        if !self.proxy_enabled || self.proxy_host.is_empty() || self.proxy_port == 0 {
            return None;
        }
        let scheme = match self.proxy_type.as_str() {
            "socks5" => "socks5",
            "https" => "https",
            _ => "http",
        };
        Some(format!("{}://{}:{}", scheme, self.proxy_host, self.proxy_port))
    }
}

/// Shared handle so the UI thread can flip flags while requests are in flight.
pub type SharedSettings = Arc<RwLock<Settings>>;

pub fn shared(settings: Settings) -> SharedSettings {
    Arc::new(RwLock::new(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_cache_on_fallback_on() {
        let s = Settings::default();
        assert!(s.media_cache_enabled);
        assert!(s.media_proxy_fallback);
        assert_eq!(s.media_cache_max_age_days, 30);
        assert_eq!(s.media_cache_max_size_mb, 500);
        assert!(!s.proxy_enabled);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: Settings =
            serde_json::from_str(r#"{"media_cache_enabled": false, "proxy_port": 9050}"#).unwrap();
        assert!(!s.media_cache_enabled);
        assert!(s.media_proxy_fallback);
        assert_eq!(s.proxy_port, 9050);
    }

    #[test]
    fn proxy_url_requires_enabled_and_host() {
        let mut s = Settings::default();
        assert_eq!(s.outbound_proxy_url(), None);

        s.proxy_enabled = true;
        s.proxy_host = "127.0.0.1".into();
        s.proxy_port = 9050;
        s.proxy_type = "socks5".into();
        assert_eq!(
            s.outbound_proxy_url().as_deref(),
            Some("socks5://127.0.0.1:9050")
        );
    }
}
