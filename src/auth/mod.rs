//! Credential providers: injecting auth material into outgoing requests.
//!
//! Providers are configured declaratively through [`AuthConfig`], a tagged
//! union dispatching on `type`, with secret-bearing fields resolvable from
//! environment variables through an injectable getter.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

pub(crate) mod basic;
pub(crate) mod http_scheme;
pub(crate) mod location;
pub(crate) mod oauth2;

pub use basic::BasicCredential;
pub use http_scheme::HttpCredential;
pub use location::{AuthLocation, TokenLocation};
pub use oauth2::OAuth2Credential;

/// Injects authentication material into an outgoing request; may refresh
/// itself (e.g. an OAuth2 token fetch) while doing so.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &mut http::Request<Full<Bytes>>) -> Result<()>;

    /// Terminate internal processes before the provider is dropped.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Resolves environment-backed configuration fields. The default getter
/// reads the process environment; tests inject their own.
pub type EnvGetter = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn os_env_getter() -> EnvGetter {
    Arc::new(|name| std::env::var(name).ok())
}

/// A string that is either inline or resolved from an environment variable
/// at provider construction time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvString {
    Literal(String),
    Env { env: String },
}

impl Default for EnvString {
    fn default() -> Self {
        Self::Literal(String::new())
    }
}

impl From<&str> for EnvString {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_owned())
    }
}

impl EnvString {
    pub fn resolve(&self, env: &EnvGetter) -> Result<String> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Env { env: name } => env(name).ok_or_else(|| Error::AuthConfig {
                message: format!("environment variable {name} is required"),
            }),
        }
    }

    /// Like `resolve`, but an unset environment variable yields an empty
    /// string instead of an error. Used for optional fields.
    pub(crate) fn resolve_optional(&self, env: &EnvGetter) -> String {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Env { env: name } => env(name).unwrap_or_default(),
        }
    }
}

/// Declarative authentication configuration, dispatching on `type`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Basic(basic::BasicAuthConfig),
    Http(http_scheme::HttpAuthConfig),
    OAuth2(oauth2::OAuth2Config),
}

impl AuthConfig {
    /// Build the runtime credential provider, resolving every env-backed
    /// field through `env`.
    pub fn build(&self, env: &EnvGetter) -> Result<Arc<dyn Authenticator>> {
        match self {
            Self::Basic(config) => Ok(Arc::new(BasicCredential::new(config, env)?)),
            Self::Http(config) => Ok(Arc::new(HttpCredential::new(config, env)?)),
            Self::OAuth2(config) => Ok(Arc::new(OAuth2Credential::new(config, env)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_env(pairs: &[(&str, &str)]) -> EnvGetter {
        let owned: Vec<(String, String)> = pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        Arc::new(move |name| {
            owned
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        })
    }

    #[test]
    fn env_string_resolves_literal_and_env() {
        let env = fixed_env(&[("API_TOKEN", "t0k")]);
        assert_eq!(
            EnvString::from("inline").resolve(&env).expect("literal"),
            "inline"
        );
        assert_eq!(
            EnvString::Env {
                env: "API_TOKEN".to_owned()
            }
            .resolve(&env)
            .expect("env"),
            "t0k"
        );
        assert!(
            EnvString::Env {
                env: "MISSING".to_owned()
            }
            .resolve(&env)
            .is_err()
        );
    }

    #[test]
    fn auth_config_dispatches_on_type_from_json() {
        let raw = r#"{"type": "basic", "username": "u", "password": "p"}"#;
        let config: AuthConfig = serde_json::from_str(raw).expect("basic config");
        assert!(matches!(config, AuthConfig::Basic(_)));

        let raw = r#"{"type": "http", "scheme": "bearer", "value": {"env": "TOKEN"}}"#;
        let config: AuthConfig = serde_json::from_str(raw).expect("http config");
        assert!(matches!(config, AuthConfig::Http(_)));

        let raw = r#"{
            "type": "oauth2",
            "tokenUrl": "https://idp.example.com/token",
            "clientId": "cid",
            "clientSecret": {"env": "SECRET"},
            "scopes": ["read"]
        }"#;
        let config: AuthConfig = serde_json::from_str(raw).expect("oauth2 config");
        assert!(matches!(config, AuthConfig::OAuth2(_)));
    }
}
