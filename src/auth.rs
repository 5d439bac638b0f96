//! Credential state for a registry session.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Credentials a client holds against its registry.
///
/// A client carries at most one of these at a time; after a successful login
/// it does not change until the client is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthInfo {
    /// Anonymous access.
    None,

    /// HTTP Basic credentials.
    Basic { username: String, password: String },

    /// Bearer token from an auth realm.
    Bearer { token: String },
}

impl AuthInfo {
    /// Render the `Authorization` header value, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                Some(format!("Basic {}", encoded))
            }
            Self::Bearer { token } => Some(format!("Bearer {}", token)),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl Default for AuthInfo {
    fn default() -> Self {
        Self::None
    }
}

/// Default token scope for pull access to a repository.
pub fn pull_scope(remote_name: &str) -> String {
    format!("repository:{}:pull", remote_name)
}
