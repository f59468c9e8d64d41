use std::env;

use thiserror::Error;
use url::Url;

use crate::negotiation::NegotiationRole;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost";
pub const SIGNALING_URL_ENV: &str = "PIXEL_SIGNALING_URL";
pub const INITIATE_OFFER_ENV: &str = "PIXEL_INITIATE_OFFER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid signaling url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported signaling url scheme {0:?}; expected ws, wss, http or https")]
    UnsupportedScheme(String),
}

/// Receiver configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Signaling server WebSocket endpoint
    pub signaling_url: Url,
    /// Whether this client answers the streamer's offer or makes its own
    pub role: NegotiationRole,
}

impl ReceiverConfig {
    pub fn new(signaling_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            signaling_url: websocket_url(signaling_url)?,
            role: NegotiationRole::Answerer,
        })
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = env::var(SIGNALING_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string());
        let mut config = Self::new(url.trim())?;
        if env_truthy(INITIATE_OFFER_ENV) {
            config.role = NegotiationRole::Offerer;
        }
        Ok(config)
    }

    pub fn with_role(mut self, role: NegotiationRole) -> Self {
        self.role = role;
        self
    }
}

/// Normalizes a signaling endpoint to a WebSocket URL; `http(s)` maps to
/// `ws(s)`.
pub fn websocket_url(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;
    Ok(url)
}

/// Flag variables are on unless unset, empty, `0` or `false`.
pub(crate) fn env_truthy(var: &str) -> bool {
    env::var(var)
        .map(|value| {
            let value = value.trim();
            !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn with_env<T>(vars: &[(&str, Option<&str>)], body: impl FnOnce() -> T) -> T {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| (key.to_string(), env::var(key).ok()))
            .collect();
        for (key, value) in vars {
            unsafe {
                match value {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
        let result = body();
        for (key, value) in saved {
            unsafe {
                match value {
                    Some(value) => env::set_var(&key, value),
                    None => env::remove_var(&key),
                }
            }
        }
        result
    }

    #[test]
    fn defaults_to_local_answerer() {
        let config = with_env(
            &[(SIGNALING_URL_ENV, None), (INITIATE_OFFER_ENV, None)],
            ReceiverConfig::from_env,
        )
        .expect("default config");
        assert_eq!(config.signaling_url.as_str(), "ws://localhost/");
        assert_eq!(config.role, NegotiationRole::Answerer);
    }

    #[test]
    fn env_overrides_url_and_role() {
        let config = with_env(
            &[
                (SIGNALING_URL_ENV, Some("https://stream.example.com:8443/signal")),
                (INITIATE_OFFER_ENV, Some("1")),
            ],
            ReceiverConfig::from_env,
        )
        .expect("config from env");
        assert_eq!(
            config.signaling_url.as_str(),
            "wss://stream.example.com:8443/signal"
        );
        assert_eq!(config.role, NegotiationRole::Offerer);
    }

    #[test]
    fn rejects_non_websocket_schemes() {
        assert!(matches!(
            websocket_url("ftp://example.com"),
            Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
        assert!(matches!(
            websocket_url("not a url"),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert_eq!(
            websocket_url("http://127.0.0.1:80/").expect("http").as_str(),
            "ws://127.0.0.1/"
        );
    }

    #[test]
    fn flag_variables_accept_common_spellings() {
        const FLAG: &str = "PIXEL_RECEIVER_TEST_FLAG";
        for (value, expected) in [
            (None, false),
            (Some(""), false),
            (Some(" 0 "), false),
            (Some("FALSE"), false),
            (Some("1"), true),
            (Some("yes"), true),
        ] {
            assert_eq!(with_env(&[(FLAG, value)], || env_truthy(FLAG)), expected, "{value:?}");
        }
    }
}
