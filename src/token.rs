//! Bearer token acquisition from an auth realm.
//!
//! A `Bearer` challenge names a realm (token server), an optional service,
//! and optional scopes. The token server is queried with
//! `GET <realm>?service=<s>&scope=<sc1>&scope=<sc2>&account=<user>`, with
//! HTTP Basic credentials when both username and password are known.

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{RegistryError, RegistryResult};

/// Parameters for one token fetch.
#[derive(Debug, Clone, Default)]
pub struct TokenRequest<'a> {
    /// Token server URL from the challenge; a bare host is allowed.
    pub realm: &'a str,

    /// `service` challenge parameter.
    pub service: Option<&'a str>,

    /// Scopes to request, each sent as a separate `scope=` pair.
    pub scopes: &'a [String],

    pub username: Option<&'a str>,
    pub password: Option<&'a str>,

    /// Default a scheme-less realm to `http` instead of `https`.
    pub insecure: bool,
}

/// Token server response body. Extra fields are tolerated.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,

    #[serde(default)]
    expires_in: Option<u64>,
}

/// Fetch a bearer token for the given request.
pub async fn fetch_token(
    client: &reqwest::Client,
    req: &TokenRequest<'_>,
) -> RegistryResult<String> {
    let mut url = parse_realm(req.realm, req.insecure)?;

    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = req.service {
            query.append_pair("service", service);
        }
        for scope in req.scopes {
            query.append_pair("scope", scope);
        }
        if let Some(username) = req.username {
            query.append_pair("account", username);
        }
    }

    debug!(url = %url, "requesting bearer token");

    let mut request = client.get(url.clone());
    if let (Some(username), Some(password)) = (req.username, req.password) {
        request = request.basic_auth(username, Some(password));
    }

    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_else(|_| status.to_string());
        return Err(RegistryError::Api {
            status: status.as_u16(),
            message: format!("token request failed: {}", message),
        });
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| RegistryError::Unauthorized {
            message: format!("could not parse token response: {}", e),
        })?;

    match body.token {
        Some(token) if !token.is_empty() => {
            debug!(expires_in = ?body.expires_in, "obtained bearer token");
            Ok(token)
        }
        _ => Err(RegistryError::Unauthorized {
            message: "token server response did not include a token".to_string(),
        }),
    }
}

/// Parse a realm URL, defaulting the scheme when absent.
fn parse_realm(realm: &str, insecure: bool) -> RegistryResult<Url> {
    let with_scheme = if realm.contains("://") {
        realm.to_string()
    } else if insecure {
        format!("http://{}", realm)
    } else {
        format!("https://{}", realm)
    };

    let url = Url::parse(&with_scheme).map_err(|e| RegistryError::Unauthorized {
        message: format!("invalid auth realm '{}': {}", realm, e),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(RegistryError::Unauthorized {
            message: format!("unsupported auth realm scheme: '{}'", url.scheme()),
        });
    }

    Ok(url)
}
