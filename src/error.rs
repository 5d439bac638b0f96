//! Error types for the registry client.

use serde::Deserialize;

/// Registry client errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Authentication required, failed, or misconfigured.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Digest malformed, algorithm unsupported, or content mismatch.
    #[error("bad digest: {message}")]
    BadDigest { message: String },

    /// Manifest structurally invalid, protected header unparseable, or JWK
    /// conversion failed.
    #[error("invalid content: {message}")]
    InvalidContent { message: String },

    /// JWS signature failed to verify or used a forbidden algorithm.
    #[error("manifest verification failed: {reason}")]
    ManifestVerification { reason: String },

    /// Blob download failed (redirect budget exceeded, length mismatch).
    #[error("download error: {message}")]
    Download { message: String },

    /// Resource not found on the registry.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Non-success response outside the mapped statuses.
    #[error("registry error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Network or transport error.
    #[error("network error: {message}")]
    Network { message: String },

    /// The client has been closed.
    #[error("client is closed")]
    Closed,

    /// Unimplemented protocol path (e.g. x5c cert chains).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RegistryError {
    /// HTTP status attached to this error, where one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(404),
            Self::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            message: err.to_string(),
        }
    }
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error envelope returned by distribution registries.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Extract a human-readable message from a registry error body.
///
/// Registries speak the JSON error envelope, but 404s from front proxies are
/// often HTML; those are replaced by `fallback` so callers never see markup.
pub(crate) fn sanitize_error_body(
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
    fallback: &str,
) -> String {
    let is_json = content_type
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);

    if is_json {
        if let Ok(parsed) = serde_json::from_slice::<ApiErrorBody>(body) {
            if let Some(first) = parsed.errors.first() {
                return match &first.code {
                    Some(code) => format!("{} ({})", first.message, code),
                    None => first.message.clone(),
                };
            }
        }
    }

    if status == 404 {
        return fallback.to_string();
    }

    match std::str::from_utf8(body) {
        Ok(text) if !text.trim().is_empty() && is_json => text.trim().to_string(),
        _ => fallback.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_attachment() {
        let err = RegistryError::Api {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(err.status(), Some(502));

        let err = RegistryError::NotFound {
            message: "not found".into(),
        };
        assert_eq!(err.status(), Some(404));

        let err = RegistryError::BadDigest {
            message: "nope".into(),
        };
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_sanitize_json_error_envelope() {
        let body = br#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown"}]}"#;
        let msg = sanitize_error_body(404, Some("application/json"), body, "not found");
        assert_eq!(msg, "manifest unknown (MANIFEST_UNKNOWN)");
    }

    #[test]
    fn test_sanitize_html_404_replaced() {
        let body = b"<html><body><h1>404 Not Found</h1></body></html>";
        let msg = sanitize_error_body(404, Some("text/html"), body, "not found");
        assert_eq!(msg, "not found");
    }

    #[test]
    fn test_sanitize_missing_content_type() {
        let msg = sanitize_error_body(404, None, b"whatever", "no such blob");
        assert_eq!(msg, "no such blob");
    }
}
