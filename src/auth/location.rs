use http::header::{COOKIE, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::error::Error;

/// Where an authentication value is placed on the outgoing request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthLocation {
    #[default]
    Header,
    Query,
    Cookie,
}

/// Placement of a credential value: location, field name, and optional
/// RFC 7235 scheme. The scheme is case-insensitive; well-known schemes are
/// title-cased, anything else is prepended verbatim.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenLocation {
    #[serde(rename = "in", default)]
    pub location: AuthLocation,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,
}

impl TokenLocation {
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::AuthConfig {
                message: "name for the token location is required".to_owned(),
            });
        }
        Ok(())
    }

    fn scheme_prefixed(&self, value: &str) -> String {
        match self.scheme.to_ascii_lowercase().as_str() {
            "bearer" => format!("Bearer {value}"),
            "basic" => format!("Basic {value}"),
            "" => value.to_owned(),
            _ => format!("{} {value}", self.scheme),
        }
    }

    /// Place `value` on the request. Returns whether the credential was
    /// applied (or already present when `replace` is false).
    pub fn inject<B>(
        &self,
        request: &mut http::Request<B>,
        value: &str,
        replace: bool,
    ) -> Result<bool, Error> {
        let value = self.scheme_prefixed(value);

        match self.location {
            AuthLocation::Header => {
                let name =
                    HeaderName::from_bytes(self.name.as_bytes()).map_err(|source| {
                        Error::InvalidHeaderName {
                            name: self.name.clone(),
                            source,
                        }
                    })?;
                if !replace
                    && request
                        .headers()
                        .get(&name)
                        .is_some_and(|existing| !existing.is_empty())
                {
                    return Ok(true);
                }
                if value.is_empty() {
                    return Ok(false);
                }
                let header_value =
                    HeaderValue::from_str(&value).map_err(|source| Error::InvalidHeaderValue {
                        name: self.name.clone(),
                        source,
                    })?;
                request.headers_mut().insert(name, header_value);
                Ok(true)
            }
            AuthLocation::Query => {
                if value.is_empty() {
                    return Ok(false);
                }
                let appended: String = form_urlencoded::Serializer::new(String::new())
                    .append_pair(&self.name, &value)
                    .finish();
                let uri = request.uri();
                let path_and_query = match uri.query() {
                    Some(existing) if !existing.is_empty() => {
                        format!("{}?{existing}&{appended}", uri.path())
                    }
                    _ => format!("{}?{appended}", uri.path()),
                };
                let mut parts = uri.clone().into_parts();
                parts.path_and_query =
                    Some(path_and_query.parse().map_err(|_| Error::InvalidUrl {
                        url: path_and_query.clone(),
                    })?);
                *request.uri_mut() =
                    http::Uri::from_parts(parts).map_err(|_| Error::InvalidUrl {
                        url: self.name.clone(),
                    })?;
                Ok(true)
            }
            AuthLocation::Cookie => {
                // Cookies are forwarded from the frontend client side; only
                // report whether one with this name is already present.
                if !replace && !value.is_empty() {
                    let found = request
                        .headers()
                        .get_all(COOKIE)
                        .iter()
                        .filter_map(|header| header.to_str().ok())
                        .flat_map(|header| header.split(';'))
                        .any(|cookie| {
                            cookie
                                .trim()
                                .split_once('=')
                                .is_some_and(|(name, _)| name == self.name)
                        });
                    if found {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> http::Request<()> {
        http::Request::builder()
            .method("GET")
            .uri("https://api.example.com/v1/items?page=2")
            .body(())
            .expect("request")
    }

    fn header_location(scheme: &str) -> TokenLocation {
        TokenLocation {
            location: AuthLocation::Header,
            name: "Authorization".to_owned(),
            scheme: scheme.to_owned(),
        }
    }

    #[test]
    fn bearer_scheme_is_title_cased() {
        let mut request = request();
        let applied = header_location("bearer")
            .inject(&mut request, "tok", true)
            .expect("inject");
        assert!(applied);
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer tok"
        );
    }

    #[test]
    fn custom_scheme_is_used_verbatim() {
        let mut request = request();
        header_location("DPoP")
            .inject(&mut request, "tok", true)
            .expect("inject");
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "DPoP tok"
        );
    }

    #[test]
    fn existing_header_is_kept_without_replace() {
        let mut request = request();
        request
            .headers_mut()
            .insert("authorization", "Bearer original".parse().unwrap());

        let applied = header_location("bearer")
            .inject(&mut request, "new", false)
            .expect("inject");
        assert!(applied);
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer original"
        );

        header_location("bearer")
            .inject(&mut request, "new", true)
            .expect("inject");
        assert_eq!(
            request.headers()["authorization"].to_str().unwrap(),
            "Bearer new"
        );
    }

    #[test]
    fn empty_value_is_not_applied() {
        let mut request = request();
        let applied = TokenLocation {
            location: AuthLocation::Header,
            name: "X-Api-Key".to_owned(),
            scheme: String::new(),
        }
        .inject(&mut request, "", true)
        .expect("inject");
        assert!(!applied);
        assert!(!request.headers().contains_key("x-api-key"));
    }

    #[test]
    fn query_value_is_appended() {
        let mut request = request();
        let applied = TokenLocation {
            location: AuthLocation::Query,
            name: "api_key".to_owned(),
            scheme: String::new(),
        }
        .inject(&mut request, "k v", true)
        .expect("inject");
        assert!(applied);
        assert_eq!(request.uri().query(), Some("page=2&api_key=k+v"));
    }

    #[test]
    fn cookie_reports_existing_without_overwrite() {
        let mut request = request();
        request
            .headers_mut()
            .insert("cookie", "session=abc; theme=dark".parse().unwrap());
        let location = TokenLocation {
            location: AuthLocation::Cookie,
            name: "session".to_owned(),
            scheme: String::new(),
        };
        assert!(location.inject(&mut request, "v", false).expect("inject"));

        let missing = TokenLocation {
            location: AuthLocation::Cookie,
            name: "other".to_owned(),
            scheme: String::new(),
        };
        assert!(!missing.inject(&mut request, "v", false).expect("inject"));
    }

    #[test]
    fn validate_requires_name() {
        let location = TokenLocation::default();
        assert!(location.validate().is_err());
    }
}
