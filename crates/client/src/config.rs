//! Client configuration from environment variables.

use url::Url;

use crate::auth_session::SessionConfig;
use crate::ws::ReconnectConfig;

const DEFAULT_API_URL: &str = "http://localhost:8080/api/v1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid URL: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("{var} must use http or https, got `{scheme}`")]
    UnsupportedScheme { var: &'static str, scheme: String },
    #[error("{var} must be a non-negative integer, got `{value}`")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    /// Explicit socket URL; derived from `api_url` when absent.
    pub ws_url: Option<Url>,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    /// Read the configuration from the process environment.
    ///
    /// Environment variables:
    /// - `CMS_ADMIN_API_URL`: REST base URL (default: "http://localhost:8080/api/v1")
    /// - `CMS_ADMIN_WS_URL`: notification socket URL (default: derived from the API URL)
    /// - `CMS_ADMIN_PRIVILEGED_ROLES`: comma separated role names (default: "ADMIN,EDITOR,AUTHOR")
    /// - `CMS_ADMIN_RECONNECT_MAX_ATTEMPTS`: reconnect budget (default: unlimited)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_url = parse_url(
            "CMS_ADMIN_API_URL",
            &var("CMS_ADMIN_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        )?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme {
                var: "CMS_ADMIN_API_URL",
                scheme: api_url.scheme().to_string(),
            });
        }

        let ws_url = var("CMS_ADMIN_WS_URL")
            .map(|raw| parse_url("CMS_ADMIN_WS_URL", &raw))
            .transpose()?;

        let mut session = SessionConfig::default();
        if let Some(roles) = var("CMS_ADMIN_PRIVILEGED_ROLES") {
            session.privileged_roles = roles
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }

        let mut reconnect = ReconnectConfig::default();
        if let Some(raw) = var("CMS_ADMIN_RECONNECT_MAX_ATTEMPTS") {
            let max = raw.trim().parse::<u32>().map_err(|_| ConfigError::InvalidNumber {
                var: "CMS_ADMIN_RECONNECT_MAX_ATTEMPTS",
                value: raw.clone(),
            })?;
            reconnect.max_attempts = Some(max);
        }

        Ok(Self {
            api_url,
            ws_url,
            session,
            reconnect,
        })
    }

    /// The notification socket URL: the API URL with `ws`/`wss` in place of
    /// `http`/`https` and `/ws` appended to its path.
    pub fn ws_url(&self) -> Url {
        if let Some(url) = &self.ws_url {
            return url.clone();
        }
        let mut url = self.api_url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        // Both are special schemes, so the swap cannot fail.
        let _ = url.set_scheme(scheme);
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        url
    }
}

fn parse_url(var: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl { var, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.api_url.as_str(), "http://localhost:8080/api/v1");
        assert_eq!(config.ws_url().as_str(), "ws://localhost:8080/api/v1/ws");
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn https_api_maps_to_wss() {
        let config = config(&[("CMS_ADMIN_API_URL", "https://cms.example.com/api/v1/")]).unwrap();
        assert_eq!(config.ws_url().as_str(), "wss://cms.example.com/api/v1/ws");
    }

    #[test]
    fn explicit_ws_url_wins() {
        let config = config(&[("CMS_ADMIN_WS_URL", "wss://push.example.com/socket")]).unwrap();
        assert_eq!(config.ws_url().as_str(), "wss://push.example.com/socket");
    }

    #[test]
    fn roles_and_reconnect_budget() {
        let config = config(&[
            ("CMS_ADMIN_PRIVILEGED_ROLES", "ADMIN, MODERATOR ,"),
            ("CMS_ADMIN_RECONNECT_MAX_ATTEMPTS", "5"),
        ])
        .unwrap();
        assert_eq!(config.session.privileged_roles, vec!["ADMIN", "MODERATOR"]);
        assert_eq!(config.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[("CMS_ADMIN_API_URL", "not a url")]),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            config(&[("CMS_ADMIN_API_URL", "ftp://host/api")]),
            Err(ConfigError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            config(&[("CMS_ADMIN_RECONNECT_MAX_ATTEMPTS", "-1")]),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }
}
