//! WWW-Authenticate challenge parsing.

use std::collections::HashMap;

use crate::error::{RegistryError, RegistryResult};

/// A single parsed auth challenge.
///
/// Multi-challenge headers (several scheme blocks in one line) are not
/// supported; feeding one in yields unspecified parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Challenge scheme as sent by the server, e.g. `Bearer`.
    pub scheme: String,

    /// Challenge parameters, keys lowercased.
    pub params: HashMap<String, String>,
}

impl AuthChallenge {
    /// Parse one challenge line of the form `Scheme k1="v1", k2=v2`.
    pub fn parse(header: &str) -> RegistryResult<Self> {
        let header = header.trim();
        if header.is_empty() {
            return Err(malformed(header));
        }

        let (scheme, rest) = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest.trim()),
            None => (header, ""),
        };

        if scheme.is_empty() || !scheme.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(malformed(header));
        }

        let mut params = HashMap::new();
        if !rest.is_empty() {
            for part in split_params(rest) {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (key, value) = part.split_once('=').ok_or_else(|| malformed(header))?;
                let key = key.trim().to_ascii_lowercase();
                if key.is_empty() {
                    return Err(malformed(header));
                }
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                params.insert(key, value.to_string());
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            params,
        })
    }

    /// Case-insensitive scheme comparison.
    pub fn is_scheme(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Split `k1="v1,with,commas", k2=v2` on commas outside quotes.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn malformed(header: &str) -> RegistryError {
    RegistryError::Unauthorized {
        message: format!("malformed WWW-Authenticate challenge: '{}'", header),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#,
        )
        .unwrap();
        assert_eq!(challenge.scheme, "Bearer");
        assert_eq!(challenge.param("realm"), Some("https://auth.docker.io/token"));
        assert_eq!(challenge.param("service"), Some("registry.docker.io"));
    }

    #[test]
    fn test_parse_basic_challenge() {
        let challenge = AuthChallenge::parse(r#"Basic realm="registry""#).unwrap();
        assert!(challenge.is_scheme("basic"));
        assert_eq!(challenge.param("realm"), Some("registry"));
    }

    #[test]
    fn test_scheme_case_insensitive() {
        let challenge = AuthChallenge::parse(r#"bearer realm="r""#).unwrap();
        assert!(challenge.is_scheme("Bearer"));
    }

    #[test]
    fn test_param_keys_lowercased() {
        let challenge = AuthChallenge::parse(r#"Bearer Realm="r",SERVICE=s"#).unwrap();
        assert_eq!(challenge.param("realm"), Some("r"));
        assert_eq!(challenge.param("service"), Some("s"));
    }

    #[test]
    fn test_unquoted_values() {
        let challenge = AuthChallenge::parse("Bearer realm=r, service=s").unwrap();
        assert_eq!(challenge.param("realm"), Some("r"));
        assert_eq!(challenge.param("service"), Some("s"));
    }

    #[test]
    fn test_comma_inside_quotes() {
        let challenge =
            AuthChallenge::parse(r#"Bearer realm="r",scope="repository:a/b:pull,push""#).unwrap();
        assert_eq!(challenge.param("scope"), Some("repository:a/b:pull,push"));
    }

    #[test]
    fn test_scheme_only() {
        let challenge = AuthChallenge::parse("Negotiate").unwrap();
        assert_eq!(challenge.scheme, "Negotiate");
        assert!(challenge.params.is_empty());
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(
            AuthChallenge::parse("   "),
            Err(RegistryError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_param_without_equals_rejected() {
        assert!(matches!(
            AuthChallenge::parse("Bearer realm"),
            Err(RegistryError::Unauthorized { .. })
        ));
    }
}
