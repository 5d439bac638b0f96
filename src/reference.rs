//! Repository name and index parsing.
//!
//! Supports the usual reference spellings:
//! - `busybox` → official index, remote name `library/busybox`
//! - `quay.io/coreos/etcd` → explicit index
//! - `localhost:5000/foo/bar` → localhost index, plain-HTTP default
//! - `ubuntu:latest` / `ubuntu@sha256:...` → repository plus reference

use std::fmt;
use std::str::FromStr;

use crate::error::{RegistryError, RegistryResult};

/// Name of the official index, normalized.
pub const DEFAULT_INDEX_NAME: &str = "docker.io";

/// Transport scheme for an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical registry endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    /// Host (and optional port), normalized to `docker.io` for the official
    /// index.
    pub name: String,

    /// Whether this is the official Docker index.
    pub official: bool,

    /// Scheme used to reach the registry.
    pub scheme: Scheme,
}

impl Index {
    /// Parse an index name, e.g. `docker.io`, `quay.io`, `localhost:5000`,
    /// or `https://registry.example.com`.
    pub fn parse(name: &str) -> RegistryResult<Self> {
        let name = name.trim();

        let (explicit_scheme, host) = if let Some(rest) = name.strip_prefix("https://") {
            (Some(Scheme::Https), rest)
        } else if let Some(rest) = name.strip_prefix("http://") {
            (Some(Scheme::Http), rest)
        } else {
            (None, name)
        };

        let host = host.trim_end_matches('/');
        if host.contains('/') {
            return Err(RegistryError::InvalidContent {
                message: format!("invalid index name (contains a path): {}", name),
            });
        }

        if host.is_empty() {
            return Ok(Self {
                name: DEFAULT_INDEX_NAME.to_string(),
                official: true,
                scheme: explicit_scheme.unwrap_or(Scheme::Https),
            });
        }

        let official = matches!(host, "docker.io" | "index.docker.io" | "registry-1.docker.io");
        let scheme = explicit_scheme.unwrap_or(if is_localhost(host) {
            Scheme::Http
        } else {
            Scheme::Https
        });

        Ok(Self {
            name: if official {
                DEFAULT_INDEX_NAME.to_string()
            } else {
                host.to_string()
            },
            official,
            scheme,
        })
    }

    /// The official index.
    pub fn default_index() -> Self {
        Self {
            name: DEFAULT_INDEX_NAME.to_string(),
            official: true,
            scheme: Scheme::Https,
        }
    }
}

fn is_localhost(host: &str) -> bool {
    let bare = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    matches!(bare, "localhost" | "127.0.0.1" | "[::1]" | "::1")
}

/// A reference appended to a repository name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A tag, e.g. `latest`.
    Tag(String),

    /// A content digest, e.g. `sha256:abc...`.
    Digest(String),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(t) => f.write_str(t),
            Self::Digest(d) => f.write_str(d),
        }
    }
}

/// A parsed repository bound to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// The index this repository lives on.
    pub index: Index,

    /// Name as the registry expects it, e.g. `library/busybox`.
    pub remote_name: String,

    /// Name as the user spelled it, e.g. `busybox` or `quay.io/foo/bar`.
    pub local_name: String,
}

impl Repository {
    /// Parse a repository name without a trailing tag or digest.
    pub fn parse(input: &str) -> RegistryResult<Self> {
        let (repo, reference) = parse_repo_and_ref(input)?;
        if let Some(r) = reference {
            return Err(RegistryError::InvalidContent {
                message: format!("unexpected reference '{}' in repository name: {}", r, input),
            });
        }
        Ok(repo)
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.local_name)
    }
}

impl FromStr for Repository {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse `[index/]name[:tag|@digest]` into a repository and an optional
/// reference.
pub fn parse_repo_and_ref(input: &str) -> RegistryResult<(Repository, Option<Reference>)> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RegistryError::InvalidContent {
            message: "empty repository name".to_string(),
        });
    }

    // A digest reference is introduced by '@'.
    let (rest, digest) = match input.split_once('@') {
        Some((rest, d)) => (rest, Some(d)),
        None => (input, None),
    };

    // Split off the index when the first path segment looks like a host.
    let (index, name_and_tag) = match rest.split_once('/') {
        Some((first, remainder))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Index::parse(first)?, remainder)
        }
        _ => (Index::default_index(), rest),
    };

    // A tag is introduced by the last ':' that is not part of a port (the
    // index has already been split off, so any ':' here starts a tag).
    let (name, tag) = match name_and_tag.rsplit_once(':') {
        Some((name, t)) => (name, Some(t)),
        None => (name_and_tag, None),
    };

    validate_repo_name(name)?;

    let reference = match (tag, digest) {
        (_, Some(d)) => {
            if !d.contains(':') {
                return Err(RegistryError::InvalidContent {
                    message: format!("invalid digest reference: {}", d),
                });
            }
            Some(Reference::Digest(d.to_string()))
        }
        (Some(t), None) => {
            validate_tag(t)?;
            Some(Reference::Tag(t.to_string()))
        }
        (None, None) => None,
    };

    let remote_name = if index.official && !name.contains('/') {
        format!("library/{}", name)
    } else {
        name.to_string()
    };
    let local_name = if index.official {
        name.to_string()
    } else {
        format!("{}/{}", index.name, name)
    };

    Ok((
        Repository {
            index,
            remote_name,
            local_name,
        },
        reference,
    ))
}

/// Validate a repository name: lowercase components separated by `/`, with
/// `.`, `_`, `__`, or runs of `-` as inner separators.
fn validate_repo_name(name: &str) -> RegistryResult<()> {
    if name.is_empty() {
        return Err(RegistryError::InvalidContent {
            message: "empty repository name".to_string(),
        });
    }

    for component in name.split('/') {
        if !valid_name_component(component) {
            return Err(RegistryError::InvalidContent {
                message: format!("invalid repository name component: '{}'", component),
            });
        }
    }
    Ok(())
}

fn valid_name_component(component: &str) -> bool {
    if component.is_empty() {
        return false;
    }
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut prev_sep = false;
    for &b in bytes {
        match b {
            b'.' | b'_' => {
                // "__" is allowed, "._" and ".." are not.
                if prev_sep && b == b'.' {
                    return false;
                }
                prev_sep = true;
            }
            b'-' => prev_sep = false,
            b if alnum(b) => prev_sep = false,
            _ => return false,
        }
    }
    true
}

fn validate_tag(tag: &str) -> RegistryResult<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .bytes()
            .next()
            .map(|b| b.is_ascii_alphanumeric() || b == b'_')
            .unwrap_or(false)
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidContent {
            message: format!("invalid tag: '{}'", tag),
        })
    }
}
