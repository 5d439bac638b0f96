//! Content-addressed blob transport.
//!
//! Blob HEAD/GET requests follow a bounded number of redirects by hand,
//! because registries routinely bounce blob downloads to an object store
//! with pre-signed URLs. Two things make the manual loop worth it: the
//! caller gets the full response chain (the first response carries headers
//! the redirect target strips), and the `Authorization` header is never
//! forwarded to the redirect target.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH, LOCATION};
use reqwest::{Method, StatusCode};
use tracing::debug;
use url::Url;

use crate::digest::{Digest, Hasher};
use crate::error::{RegistryError, RegistryResult};

/// Maximum number of redirects followed for one blob request. A response
/// chain therefore holds at most `MAX_REDIRECTS + 1` entries.
pub const MAX_REDIRECTS: usize = 3;

/// One response observed while resolving a blob request.
#[derive(Debug, Clone)]
pub struct Hop {
    /// URL this response came from.
    pub url: Url,

    pub status: StatusCode,

    pub headers: HeaderMap,
}

/// Issue `method` against `start`, following 302/307 redirects.
///
/// Returns every hop in order together with the final (non-3xx) response,
/// whose body is still unread. Credentials are only sent on the first hop.
pub(crate) async fn follow(
    http: &reqwest::Client,
    method: Method,
    start: Url,
    authorization: Option<&str>,
) -> RegistryResult<(Vec<Hop>, reqwest::Response)> {
    let mut url = start;
    let mut auth = authorization;
    let mut redirects = 0;
    let mut hops = Vec::new();

    loop {
        let mut request = http.request(method.clone(), url.clone());
        if let Some(value) = auth {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.send().await?;
        let status = response.status();
        hops.push(Hop {
            url: url.clone(),
            status,
            headers: response.headers().clone(),
        });

        if !matches!(status.as_u16(), 302 | 307) {
            return Ok((hops, response));
        }

        if redirects >= MAX_REDIRECTS {
            return Err(RegistryError::Download {
                message: "maximum number of redirects reached".to_string(),
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::Download {
                message: format!("redirect ({}) without a Location header", status),
            })?;

        let next = url.join(location).map_err(|e| RegistryError::Download {
            message: format!("invalid redirect Location '{}': {}", location, e),
        })?;

        debug!(from = %url, to = %next, status = status.as_u16(), "following blob redirect");

        url = next;
        redirects += 1;
        // Redirect targets are typically pre-signed object-store URLs;
        // registry credentials must not reach them.
        auth = None;
    }
}

/// Parse `Content-Length` from a set of response headers.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// A blob body that verifies itself as it is consumed.
///
/// Yields the raw chunks of the final response. Nothing is read until the
/// stream is polled. When the body ends, the received byte count is checked
/// against `Content-Length` and the running hash against the expected
/// digest; a mismatch surfaces as the final item.
pub struct BlobStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    hasher: Option<Hasher>,
    expected_hex: Option<String>,
    content_length: Option<u64>,
    received: u64,
    finished: bool,
}

impl BlobStream {
    /// Wrap the final response of a blob GET.
    ///
    /// `requested` is the digest the caller asked for; `first_headers` come
    /// from the first hop, the only one that reliably carries
    /// `Docker-Content-Digest`.
    pub(crate) fn from_parts(
        requested: &str,
        first_headers: &HeaderMap,
        content_length: Option<u64>,
        inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    ) -> RegistryResult<Self> {
        let mut hasher = None;
        let mut expected_hex = None;

        if let Some(value) = first_headers.get("docker-content-digest") {
            let raw = value.to_str().map_err(|_| RegistryError::BadDigest {
                message: "Docker-Content-Digest header is not valid UTF-8".to_string(),
            })?;
            let digest = Digest::parse(raw)?;
            if digest.to_string() != requested {
                return Err(RegistryError::BadDigest {
                    message: format!(
                        "Docker-Content-Digest '{}' does not match requested digest '{}'",
                        digest, requested
                    ),
                });
            }
            hasher = Some(digest.hasher());
            expected_hex = Some(digest.hex);
        }

        Ok(Self {
            inner,
            hasher,
            expected_hex,
            content_length,
            received: 0,
            finished: false,
        })
    }

    /// Bytes yielded so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// End-of-body verification.
    fn finish(&mut self) -> RegistryResult<()> {
        if let Some(expected) = self.content_length {
            if self.received != expected {
                return Err(RegistryError::Download {
                    message: format!(
                        "content-length mismatch: expected {} bytes, received {}",
                        expected, self.received
                    ),
                });
            }
        }

        if let (Some(hasher), Some(expected_hex)) = (self.hasher.take(), self.expected_hex.take())
        {
            let actual = hasher.finalize_hex();
            if actual != expected_hex {
                return Err(RegistryError::BadDigest {
                    message: format!(
                        "blob digest mismatch: expected {}, computed {}",
                        expected_hex, actual
                    ),
                });
            }
        }

        Ok(())
    }
}

impl Stream for BlobStream {
    type Item = RegistryResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.received += chunk.len() as u64;
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.finished = true;
                match this.finish() {
                    Ok(()) => Poll::Ready(None),
                    Err(e) => Poll::Ready(Some(Err(e))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream")
            .field("received", &self.received)
            .field("content_length", &self.content_length)
            .field("expected_hex", &self.expected_hex)
            .field("finished", &self.finished)
            .finish()
    }
}
