use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::de::DeserializeOwned;

use crate::Result;
use crate::content_encoding;
use crate::error::Error;

enum ResponseBody {
    /// Body still streaming from the transport; decompressed on read.
    Stream(Incoming),
    /// Body already read and decoded, re-attached for the caller.
    Buffered(Bytes),
}

/// Wrapper around the raw HTTP response with body lifecycle tracking.
///
/// The read helpers consume and close the body: reading twice fails with
/// `BodyAlreadyRead`, reading after `close` fails with
/// `BodyReadAfterClose`, and an absent body yields `BodyNoContent`.
/// A declared, supported `Content-Encoding` is undone transparently; an
/// unknown coding returns the body as-is with the header preserved.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    version: Version,
    remote_addr: Option<SocketAddr>,
    body: Option<ResponseBody>,
    body_read: bool,
    closed: bool,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("body_read", &self.body_read)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub(crate) fn new(
        parts: http::response::Parts,
        body: Option<Incoming>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            status: parts.status,
            headers: parts.headers,
            version: parts.version,
            remote_addr,
            body: body.map(ResponseBody::Stream),
            body_read: false,
            closed: false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Resolved peer address of the connection that served this response.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Advertised `Content-Length`, when the server sent one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    pub fn is_body_read(&self) -> bool {
        self.body_read
    }

    pub(crate) fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Read the entire body, undoing any supported content coding, and
    /// close it.
    pub async fn read_bytes(&mut self) -> Result<Bytes> {
        if self.closed {
            return Err(Error::BodyReadAfterClose);
        }
        if self.body_read {
            return Err(Error::BodyAlreadyRead);
        }
        let Some(body) = self.body.take() else {
            return Err(Error::BodyNoContent);
        };

        let collected = match body {
            ResponseBody::Buffered(bytes) => bytes,
            ResponseBody::Stream(incoming) => {
                let raw = incoming
                    .collect()
                    .await
                    .map_err(|error| Error::ReadBody {
                        source: Box::new(error),
                    })?
                    .to_bytes();
                self.decode(raw)?
            }
        };

        self.body_read = true;
        Ok(collected)
    }

    /// Read the body and decode it as JSON.
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| Error::DecodeJson { source })
    }

    /// Close the body without reading it. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.body = None;
        self.closed = true;
    }

    fn decode(&self, raw: Bytes) -> Result<Bytes> {
        let Some(encoding) = self
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
        else {
            return Ok(raw);
        };
        content_encoding::decode(encoding, raw).map_err(|error| Error::Decompress {
            encoding: error.encoding,
            message: error.message,
        })
    }

    /// Re-attach an already-decoded body after a debug read so the caller
    /// still observes it.
    pub(crate) fn reattach_body(&mut self, bytes: Bytes) {
        self.body = Some(ResponseBody::Buffered(bytes));
        self.body_read = false;
        self.closed = false;
    }
}
