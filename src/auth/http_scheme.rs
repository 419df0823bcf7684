use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

use super::location::{AuthLocation, TokenLocation};
use super::{Authenticator, EnvGetter, EnvString};

/// Bearer / API-key style credential configuration. The value always lands
/// in a header; name defaults to `Authorization`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpAuthConfig {
    #[serde(default)]
    pub value: EnvString,
    /// RFC 7235 scheme, e.g. `bearer`. Case-insensitive.
    #[serde(default)]
    pub scheme: String,
    /// Header name; defaults to `Authorization`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

pub struct HttpCredential {
    location: TokenLocation,
    value: String,
}

impl HttpCredential {
    pub fn new(config: &HttpAuthConfig, env: &EnvGetter) -> Result<Self> {
        let value = config.value.resolve(env).map_err(|error| Error::AuthConfig {
            message: format!("value: {error}"),
        })?;

        let name = match &config.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => "Authorization".to_owned(),
        };

        Ok(Self {
            location: TokenLocation {
                location: AuthLocation::Header,
                name,
                scheme: config.scheme.trim().to_ascii_lowercase(),
            },
            value,
        })
    }
}

#[async_trait]
impl Authenticator for HttpCredential {
    async fn authenticate(&self, request: &mut http::Request<Full<Bytes>>) -> Result<()> {
        self.location.inject(request, &self.value, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn request() -> http::Request<Full<Bytes>> {
        http::Request::builder()
            .method("GET")
            .uri("http://api.example.com/")
            .body(Full::new(Bytes::new()))
            .expect("request")
    }

    #[tokio::test]
    async fn bearer_token_from_env() {
        let env: EnvGetter = Arc::new(|name| {
            (name == "SERVICE_TOKEN").then(|| "t0k".to_owned())
        });
        let config = HttpAuthConfig {
            value: EnvString::Env {
                env: "SERVICE_TOKEN".to_owned(),
            },
            scheme: "Bearer".to_owned(),
            name: None,
        };
        let credential = HttpCredential::new(&config, &env).expect("credential");
        let mut request = request();
        credential.authenticate(&mut request).await.expect("auth");
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer t0k"
        );
    }

    #[tokio::test]
    async fn api_key_header_without_scheme() {
        let env: EnvGetter = Arc::new(|_| None);
        let config = HttpAuthConfig {
            value: "secret".into(),
            scheme: String::new(),
            name: Some("X-Api-Key".to_owned()),
        };
        let credential = HttpCredential::new(&config, &env).expect("credential");
        let mut request = request();
        credential.authenticate(&mut request).await.expect("auth");
        assert_eq!(request.headers()["x-api-key"].to_str().unwrap(), "secret");
    }

    #[tokio::test]
    async fn existing_header_wins() {
        let env: EnvGetter = Arc::new(|_| None);
        let config = HttpAuthConfig {
            value: "new".into(),
            scheme: "bearer".to_owned(),
            name: None,
        };
        let credential = HttpCredential::new(&config, &env).expect("credential");
        let mut request = request();
        request
            .headers_mut()
            .insert("authorization", "Bearer forwarded".parse().unwrap());
        credential.authenticate(&mut request).await.expect("auth");
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer forwarded"
        );
    }
}
