//! Registry client facade.
//!
//! A [`RegistryClient`] is bound to one repository on one registry. The
//! first operation that needs credentials triggers a login (ping →
//! challenge → token); the resulting `Authorization` header is cached for
//! the life of the client.

use std::time::Duration;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::auth::{pull_scope, AuthInfo};
use crate::blob::{self, BlobStream, Hop};
use crate::challenge::AuthChallenge;
use crate::digest::Digest;
use crate::error::{sanitize_error_body, RegistryError, RegistryResult};
use crate::jws::ReconstructedJws;
use crate::manifest::{ManifestV1, TagList};
use crate::reference::{parse_repo_and_ref, Repository};
use crate::token::{fetch_token, TokenRequest};

/// Registry URL used for the official index, whatever its name variant.
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

const DEFAULT_USER_AGENT: &str = concat!("dockreg/", env!("CARGO_PKG_VERSION"));

/// Accept values for schema 1 manifests; `prettyjws` keeps the signatures.
const MANIFEST_V1_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws, \
     application/vnd.docker.distribution.manifest.v1+json";

/// Escapes everything outside the RFC 3986 unreserved set, matching
/// component-level URI encoding (`:` in a digest becomes `%3A`).
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// Encode a remote name segment-by-segment, preserving `/`.
fn encode_remote_name(name: &str) -> String {
    name.split('/')
        .map(encode_component)
        .collect::<Vec<_>>()
        .join("/")
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: Option<String>,
    pub password: Option<String>,

    /// Skip TLS verification and default scheme-less realms to `http`.
    pub insecure: bool,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            insecure: false,
            timeout_secs: 60,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `DOCKREG_USERNAME` | Registry username |
    /// | `DOCKREG_PASSWORD` | Registry password |
    /// | `DOCKREG_INSECURE` | Skip TLS verification (`1`/`true`) |
    /// | `DOCKREG_TIMEOUT` | Request timeout in seconds |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            username: std::env::var("DOCKREG_USERNAME").ok().filter(|v| !v.is_empty()),
            password: std::env::var("DOCKREG_PASSWORD").ok().filter(|v| !v.is_empty()),
            insecure: std::env::var("DOCKREG_INSECURE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            timeout_secs: std::env::var("DOCKREG_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            user_agent: defaults.user_agent,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// Raw outcome of a `GET /v2/` probe. 401 is data here, not an error: the
/// caller decides what a status means.
#[derive(Debug, Clone)]
pub struct PingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    host: String,
}

impl PingResponse {
    /// The `WWW-Authenticate` challenge, if one can be determined.
    ///
    /// quay.io is known to serve 401 pings without a challenge header; for
    /// that host the documented challenge is synthesized.
    pub fn challenge_header(&self) -> Option<String> {
        if let Some(value) = self
            .headers
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
        {
            return Some(value.to_string());
        }
        if self.status == StatusCode::UNAUTHORIZED && self.host == "quay.io" {
            return Some(r#"Bearer realm="https://quay.io/v2/auth",service="quay.io""#.to_string());
        }
        None
    }

    /// Whether `Docker-Distribution-Api-Version` advertises `registry/2.0`.
    pub fn api_version_supported(&self) -> bool {
        self.headers
            .get("docker-distribution-api-version")
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(|c: char| c == ',' || c.is_whitespace())
                    .any(|token| token == "registry/2.0")
            })
            .unwrap_or(false)
    }
}

/// A manifest together with its verification context.
#[derive(Debug, Clone)]
pub struct ManifestFetch {
    pub manifest: ManifestV1,

    /// `Docker-Content-Digest` from the response, verified against the
    /// reconstructed signing payload. Absent when the registry sent none.
    pub digest: Option<Digest>,

    /// Raw response body, byte-for-byte as served.
    pub raw_body: Bytes,
}

#[derive(Debug, Default)]
struct SessionState {
    auth: Option<AuthInfo>,
    authorization: Option<String>,
    closed: bool,
}

/// Client for one repository on a v2 registry.
#[derive(Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
    repo: Repository,
    base_url: Url,
    config: ClientConfig,
    state: Mutex<SessionState>,
}

impl RegistryClient {
    /// Create a client for an already-parsed repository.
    pub fn new(repo: Repository, config: ClientConfig) -> RegistryResult<Self> {
        let base_url = if repo.index.official {
            Url::parse(DEFAULT_REGISTRY_URL)
        } else {
            Url::parse(&format!("{}://{}", repo.index.scheme, repo.index.name))
        }
        .map_err(|e| RegistryError::InvalidContent {
            message: format!("invalid registry URL for index '{}': {}", repo.index.name, e),
        })?;

        let http = reqwest::Client::builder()
            // Blob redirects are followed manually so the chain is observable
            // and credentials can be scrubbed.
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| RegistryError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        debug!(repo = %repo, base_url = %base_url, "created registry client");

        Ok(Self {
            http,
            repo,
            base_url,
            config,
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Create a client from a repository name string, e.g. `busybox` or
    /// `quay.io/coreos/etcd`. A trailing `:tag` or `@digest` is accepted
    /// and ignored.
    pub fn for_name(name: &str, config: ClientConfig) -> RegistryResult<Self> {
        let (repo, _reference) = parse_repo_and_ref(name)?;
        Self::new(repo, config)
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Probe `GET /v2/`. Returns the raw outcome; 200, 401, and 404 all
    /// come back as `Ok`.
    pub async fn ping(&self) -> RegistryResult<PingResponse> {
        self.ping_with_authorization(None).await
    }

    async fn ping_with_authorization(
        &self,
        authorization: Option<&str>,
    ) -> RegistryResult<PingResponse> {
        let url = self.url("/v2/")?;
        debug!(url = %url, "pinging registry");

        let mut request = self.http.get(url);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(PingResponse {
            status,
            headers,
            body,
            host: self.base_url.host_str().unwrap_or_default().to_string(),
        })
    }

    /// Whether the endpoint speaks the v2 API.
    pub async fn supports_v2(&self) -> RegistryResult<bool> {
        let ping = self.ping().await?;
        Ok(matches!(ping.status.as_u16(), 200 | 401) && ping.api_version_supported())
    }

    /// Log in with the default pull scope for this repository. A no-op if
    /// the client is already logged in.
    pub async fn login(&self) -> RegistryResult<()> {
        self.ensure_login().await.map(|_| ())
    }

    /// Log in requesting a specific token scope.
    pub async fn login_with_scope(&self, scope: &str) -> RegistryResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RegistryError::Closed);
        }
        if state.auth.is_some() {
            return Ok(());
        }
        let auth = self.perform_login(scope).await?;
        state.authorization = auth.header_value();
        state.auth = Some(auth);
        Ok(())
    }

    /// Log in if needed and return the cached `Authorization` header value.
    ///
    /// The session lock is held across the login round-trips, so concurrent
    /// operations observe exactly one completed login.
    async fn ensure_login(&self) -> RegistryResult<Option<String>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RegistryError::Closed);
        }
        if state.auth.is_none() {
            let scope = pull_scope(&self.repo.remote_name);
            let auth = self.perform_login(&scope).await?;
            state.authorization = auth.header_value();
            state.auth = Some(auth);
        }
        Ok(state.authorization.clone())
    }

    /// The ping → challenge → scheme dispatch sequence.
    async fn perform_login(&self, scope: &str) -> RegistryResult<AuthInfo> {
        let basic = match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => Some(AuthInfo::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        let basic_header = basic.as_ref().and_then(AuthInfo::header_value);
        let ping = self.ping_with_authorization(basic_header.as_deref()).await?;

        match ping.status.as_u16() {
            200 => {
                debug!("registry accepted credentials on ping");
                return Ok(basic.unwrap_or(AuthInfo::None));
            }
            401 => {}
            status => {
                let message = sanitize_error_body(
                    status,
                    header_str(&ping.headers, CONTENT_TYPE),
                    &ping.body,
                    "unexpected response to /v2/ ping",
                );
                return Err(RegistryError::Api { status, message });
            }
        }

        let header = ping
            .challenge_header()
            .ok_or_else(|| RegistryError::Unauthorized {
                message: "401 response without a WWW-Authenticate challenge".to_string(),
            })?;
        let challenge = AuthChallenge::parse(&header)?;

        if challenge.is_scheme("basic") {
            // Credentials (if any) already rode along on the ping and were
            // rejected.
            let message = sanitize_error_body(
                401,
                header_str(&ping.headers, CONTENT_TYPE),
                &ping.body,
                "authentication required",
            );
            return Err(RegistryError::Unauthorized { message });
        }

        if !challenge.is_scheme("bearer") {
            return Err(RegistryError::Unauthorized {
                message: format!("unsupported auth scheme: '{}'", challenge.scheme),
            });
        }

        let realm = challenge
            .param("realm")
            .ok_or_else(|| RegistryError::Unauthorized {
                message: "bearer challenge missing realm".to_string(),
            })?;

        let scopes: Vec<String> = if scope.is_empty() {
            Vec::new()
        } else {
            vec![scope.to_string()]
        };

        let token = fetch_token(
            &self.http,
            &TokenRequest {
                realm,
                service: challenge.param("service"),
                scopes: &scopes,
                username: self.config.username.as_deref(),
                password: self.config.password.as_deref(),
                insecure: self.config.insecure,
            },
        )
        .await?;

        Ok(AuthInfo::Bearer { token })
    }

    /// List tags: `GET /v2/<name>/tags/list`.
    pub async fn list_tags(&self) -> RegistryResult<TagList> {
        let authorization = self.ensure_login().await?;
        let url = self.url(&format!(
            "/v2/{}/tags/list",
            encode_remote_name(&self.repo.remote_name)
        ))?;
        debug!(url = %url, "listing tags");

        let response = self
            .request(Method::GET, url, authorization.as_deref())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, "repository not found").await);
        }

        response
            .json()
            .await
            .map_err(|e| RegistryError::InvalidContent {
                message: format!("could not parse tag list: {}", e),
            })
    }

    /// Fetch and verify a signed manifest by tag or digest.
    pub async fn get_manifest(&self, reference: &str) -> RegistryResult<ManifestFetch> {
        let authorization = self.ensure_login().await?;
        let url = self.url(&format!(
            "/v2/{}/manifests/{}",
            encode_remote_name(&self.repo.remote_name),
            encode_component(reference)
        ))?;
        debug!(url = %url, "fetching manifest");

        let response = self
            .request(Method::GET, url, authorization.as_deref())
            .header(ACCEPT, MANIFEST_V1_ACCEPT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, "manifest not found").await);
        }

        let headers = response.headers().clone();
        let raw_body = response.bytes().await?;

        let manifest: ManifestV1 =
            serde_json::from_slice(&raw_body).map_err(|e| RegistryError::InvalidContent {
                message: format!("could not parse manifest: {}", e),
            })?;

        let jws = ReconstructedJws::reconstruct(&manifest, &raw_body)?;

        // The digest header covers the signing payload, not the served body.
        let digest = match header_str(&headers, "docker-content-digest") {
            Some(raw) => {
                let digest = Digest::parse(raw)?;
                let computed = digest.algorithm.digest_hex(&jws.payload);
                if computed != digest.hex {
                    return Err(RegistryError::BadDigest {
                        message: format!(
                            "Docker-Content-Digest mismatch: header says {}, payload hashes to {}:{}",
                            digest, digest.algorithm, computed
                        ),
                    });
                }
                Some(digest)
            }
            None => None,
        };

        jws.verify()?;
        manifest.validate()?;

        Ok(ManifestFetch {
            manifest,
            digest,
            raw_body,
        })
    }

    /// HEAD a blob, returning the full response chain.
    pub async fn head_blob(&self, digest: &str) -> RegistryResult<Vec<Hop>> {
        let authorization = self.ensure_login().await?;
        let url = self.blob_url(digest)?;
        debug!(url = %url, "HEAD blob");

        let (hops, response) =
            blob::follow(&self.http, Method::HEAD, url, authorization.as_deref()).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, "blob not found").await);
        }
        Ok(hops)
    }

    /// GET a blob, returning the response chain and a verifying stream over
    /// the body. The stream reads nothing until polled.
    pub async fn open_blob_stream(
        &self,
        digest: &str,
    ) -> RegistryResult<(Vec<Hop>, BlobStream)> {
        let authorization = self.ensure_login().await?;
        let url = self.blob_url(digest)?;
        debug!(url = %url, "GET blob");

        let (hops, response) =
            blob::follow(&self.http, Method::GET, url, authorization.as_deref()).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, "blob not found").await);
        }

        let first_headers = match hops.first() {
            Some(hop) => hop.headers.clone(),
            None => response.headers().clone(),
        };
        let length = blob::content_length(response.headers());
        let stream = BlobStream::from_parts(
            digest,
            &first_headers,
            length,
            Box::pin(response.bytes_stream()),
        )?;

        Ok((hops, stream))
    }

    /// Close the client. Pending state is dropped and every subsequent
    /// operation fails with [`RegistryError::Closed`].
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.auth = None;
        state.authorization = None;
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        authorization: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        request
    }

    fn url(&self, path: &str) -> RegistryResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RegistryError::Internal {
                message: format!("could not build request URL for '{}': {}", path, e),
            })
    }

    fn blob_url(&self, digest: &str) -> RegistryResult<Url> {
        self.url(&format!(
            "/v2/{}/blobs/{}",
            encode_remote_name(&self.repo.remote_name),
            encode_component(digest)
        ))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Map a terminal non-success response to an error, keeping the status and
/// sanitizing non-JSON 404 bodies.
async fn error_from_response(response: reqwest::Response, not_found: &str) -> RegistryError {
    let status = response.status().as_u16();
    let content_type = header_str(response.headers(), CONTENT_TYPE).map(str::to_string);
    let body = response.bytes().await.unwrap_or_default();
    let message = sanitize_error_body(status, content_type.as_deref(), &body, not_found);

    match status {
        401 => RegistryError::Unauthorized { message },
        404 => RegistryError::NotFound { message },
        _ => RegistryError::Api { status, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn ping_response(status: StatusCode, headers: HeaderMap, host: &str) -> PingResponse {
        PingResponse {
            status,
            headers,
            body: Bytes::new(),
            host: host.to_string(),
        }
    }

    #[test]
    fn test_component_encoding() {
        assert_eq!(encode_component("sha256:abc"), "sha256%3Aabc");
        assert_eq!(encode_component("v1.2_3-x~y"), "v1.2_3-x~y");
    }

    #[test]
    fn test_remote_name_encoding_preserves_slashes() {
        assert_eq!(encode_remote_name("library/busybox"), "library/busybox");
        assert_eq!(encode_remote_name("a b/c:d"), "a%20b/c%3Ad");
    }

    #[test]
    fn test_official_index_base_url_override() {
        let client = RegistryClient::for_name("busybox", ClientConfig::default()).unwrap();
        assert_eq!(client.base_url().as_str(), "https://registry-1.docker.io/");
    }

    #[test]
    fn test_localhost_base_url_plain_http() {
        let client =
            RegistryClient::for_name("localhost:5000/foo", ClientConfig::default()).unwrap();
        assert_eq!(client.base_url().as_str(), "http://localhost:5000/");
    }

    #[test]
    fn test_for_name_accepts_trailing_tag() {
        let client = RegistryClient::for_name("busybox:latest", ClientConfig::default()).unwrap();
        assert_eq!(client.repository().remote_name, "library/busybox");
    }

    #[test]
    fn test_challenge_header_passthrough() {
        let mut headers = HeaderMap::new();
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static(r#"Bearer realm="https://auth.docker.io/token""#),
        );
        let ping = ping_response(StatusCode::UNAUTHORIZED, headers, "registry-1.docker.io");
        assert_eq!(
            ping.challenge_header().as_deref(),
            Some(r#"Bearer realm="https://auth.docker.io/token""#)
        );
    }

    #[test]
    fn test_challenge_header_quay_synthesis() {
        let ping = ping_response(StatusCode::UNAUTHORIZED, HeaderMap::new(), "quay.io");
        let header = ping.challenge_header().unwrap();
        assert!(header.starts_with("Bearer realm=\"https://quay.io/v2/auth\""));
    }

    #[test]
    fn test_challenge_header_absent_for_other_hosts() {
        let ping = ping_response(StatusCode::UNAUTHORIZED, HeaderMap::new(), "example.com");
        assert!(ping.challenge_header().is_none());
    }

    #[test]
    fn test_api_version_token_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "docker-distribution-api-version",
            HeaderValue::from_static("registry/2.0 registry/2.1"),
        );
        let ping = ping_response(StatusCode::OK, headers, "example.com");
        assert!(ping.api_version_supported());

        let ping = ping_response(StatusCode::OK, HeaderMap::new(), "example.com");
        assert!(!ping.api_version_supported());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::default()
            .with_credentials("fred", "s3cret")
            .with_insecure(true)
            .with_timeout_secs(5)
            .with_user_agent("test-agent/0.0");

        assert_eq!(config.username.as_deref(), Some("fred"));
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert!(config.insecure);
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.user_agent, "test-agent/0.0");
    }
}
