use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use http_body_util::Full;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

use super::{Authenticator, EnvGetter, EnvString};

/// Characters escaped inside the userinfo component of a URL.
const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'=')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'|');

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthConfig {
    #[serde(default)]
    pub username: EnvString,
    #[serde(default)]
    pub password: EnvString,
    /// Custom header to carry the credential; the standard `Authorization`
    /// header is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

/// Basic authentication credential. With a custom header the encoded value
/// uses URL userinfo formatting; otherwise the standard
/// `Authorization: Basic` form is emitted.
#[derive(Debug)]
pub struct BasicCredential {
    header: Option<HeaderName>,
    username: String,
    password: String,
}

impl BasicCredential {
    pub fn new(config: &BasicAuthConfig, env: &EnvGetter) -> Result<Self> {
        let username = config.username.resolve(env).map_err(|error| {
            Error::AuthConfig {
                message: format!("username: {error}"),
            }
        })?;
        let password = config.password.resolve(env).map_err(|error| {
            Error::AuthConfig {
                message: format!("password: {error}"),
            }
        })?;

        if username.is_empty() && password.is_empty() {
            return Err(Error::AuthCredentialEmpty);
        }

        let header = match &config.header {
            Some(name) if !name.is_empty() => Some(
                HeaderName::from_bytes(name.as_bytes()).map_err(|source| {
                    Error::InvalidHeaderName {
                        name: name.clone(),
                        source,
                    }
                })?,
            ),
            _ => None,
        };

        Ok(Self {
            header,
            username,
            password,
        })
    }

    fn encoded_value(&self) -> String {
        let raw = if self.header.is_some() {
            // Userinfo formatting: escaped username, and the password only
            // when one is present.
            let username = utf8_percent_encode(&self.username, USERINFO).to_string();
            if self.password.is_empty() {
                username
            } else {
                let password = utf8_percent_encode(&self.password, USERINFO).to_string();
                format!("{username}:{password}")
            }
        } else {
            format!("{}:{}", self.username, self.password)
        };
        STANDARD.encode(raw)
    }
}

#[async_trait]
impl Authenticator for BasicCredential {
    async fn authenticate(&self, request: &mut http::Request<Full<Bytes>>) -> Result<()> {
        let name = self.header.clone().unwrap_or(AUTHORIZATION);
        let value = format!("Basic {}", self.encoded_value());
        let header_value =
            HeaderValue::from_str(&value).map_err(|source| Error::InvalidHeaderValue {
                name: name.to_string(),
                source,
            })?;
        request.headers_mut().insert(name, header_value);
        Ok(())
    }
}
