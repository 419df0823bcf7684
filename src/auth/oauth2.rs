use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http_body_util::{BodyExt, Full};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::Result;
use crate::error::Error;
use crate::metrics::global_metrics;
use crate::transport::Transport;
use crate::util::validate_http_url;

use super::location::{AuthLocation, TokenLocation};
use super::{Authenticator, EnvGetter, EnvString};

/// Tokens are refreshed this long before their advertised expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(10);

/// OAuth2 client-credentials configuration, OpenAPI-3 style.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2Config {
    pub token_url: EnvString,
    pub client_id: EnvString,
    #[serde(default)]
    pub client_secret: EnvString,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Additional form parameters for the token request. Values resolving
    /// to an empty string are omitted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoint_params: BTreeMap<String, EnvString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_location: Option<TokenLocation>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone, Debug)]
struct CachedToken {
    access_token: String,
    token_type: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() < expires_at,
            None => true,
        }
    }
}

/// OAuth2 client-credentials provider. The first `authenticate` fetches a
/// token from the token endpoint; later calls reuse the cached token until
/// it goes stale, then refresh transparently. When the configured location
/// has no scheme, it is filled from the token's `token_type` on first use.
#[derive(Debug)]
pub struct OAuth2Credential {
    token_url: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    endpoint_params: Vec<(String, String)>,
    location: TokenLocation,
    derived_scheme: OnceLock<String>,
    transport: Transport,
    token: Mutex<Option<CachedToken>>,
}

impl OAuth2Credential {
    pub fn new(config: &OAuth2Config, env: &EnvGetter) -> Result<Self> {
        let token_url = config
            .token_url
            .resolve(env)
            .and_then(|raw| validate_http_url(&raw).map(|parsed| parsed.to_string()))
            .map_err(|error| Error::AuthConfig {
                message: format!("tokenUrl: {error}"),
            })?;
        let client_id = config.client_id.resolve(env).map_err(|error| {
            Error::AuthConfig {
                message: format!("clientId: {error}"),
            }
        })?;
        let client_secret = config.client_secret.resolve(env).map_err(|error| {
            Error::AuthConfig {
                message: format!("clientSecret: {error}"),
            }
        })?;

        let mut endpoint_params = Vec::with_capacity(config.endpoint_params.len());
        for (name, value) in &config.endpoint_params {
            let resolved = value.resolve_optional(env);
            if !resolved.is_empty() {
                endpoint_params.push((name.clone(), resolved));
            }
        }

        let location = match &config.token_location {
            Some(location) => {
                location.validate()?;
                location.clone()
            }
            None => TokenLocation {
                location: AuthLocation::Header,
                name: "Authorization".to_owned(),
                scheme: String::new(),
            },
        };

        Ok(Self {
            token_url,
            client_id,
            client_secret,
            scopes: config.scopes.clone(),
            endpoint_params,
            location,
            derived_scheme: OnceLock::new(),
            transport: Transport::build(None, None, global_metrics())?,
            token: Mutex::new(None),
        })
    }

    async fn fetch_token(&self) -> Result<CachedToken> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "client_credentials"),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ];
        let scope = self.scopes.join(" ");
        if !scope.is_empty() {
            form.push(("scope", &scope));
        }
        for (name, value) in &self.endpoint_params {
            form.push((name.as_str(), value.as_str()));
        }

        let body = serde_urlencoded::to_string(&form).map_err(|error| Error::TokenExchange {
            message: format!("failed to encode token request: {error}"),
        })?;

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(self.token_url.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|source| Error::RequestBuild { source })?;

        let response = self.transport.send(request).await?;
        let status = response.status();
        let payload = response
            .into_body()
            .collect()
            .await
            .map_err(|error| Error::ReadBody {
                source: Box::new(error),
            })?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::TokenExchange {
                message: format!(
                    "token endpoint returned {status}: {}",
                    String::from_utf8_lossy(&payload)
                ),
            });
        }

        let token: TokenResponse =
            serde_json::from_slice(&payload).map_err(|error| Error::TokenExchange {
                message: format!("failed to decode token response: {error}"),
            })?;
        if token.access_token.is_empty() {
            return Err(Error::AuthCredentialEmpty);
        }

        debug!(token_url = %self.token_url, "fetched oauth2 access token");

        Ok(CachedToken {
            access_token: token.access_token,
            token_type: token.token_type.unwrap_or_else(|| "Bearer".to_owned()),
            expires_at: token.expires_in.map(|seconds| {
                Instant::now() + Duration::from_secs(seconds).saturating_sub(EXPIRY_SKEW)
            }),
        })
    }

    async fn current_token(&self) -> Result<CachedToken> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_fresh()
        {
            return Ok(token.clone());
        }

        let refreshed = self.fetch_token().await?;
        *cached = Some(refreshed.clone());
        Ok(refreshed)
    }
}

#[async_trait]
impl Authenticator for OAuth2Credential {
    async fn authenticate(&self, request: &mut http::Request<Full<Bytes>>) -> Result<()> {
        let token = self.current_token().await?;

        let mut location = self.location.clone();
        if location.scheme.is_empty() {
            location.scheme = self
                .derived_scheme
                .get_or_init(|| token.token_type.to_ascii_lowercase())
                .clone();
        }

        location.inject(request, &token.access_token, false)?;
        Ok(())
    }
}
