//! Client for the Docker Registry HTTP API v2, schema 1 manifests.
//!
//! This crate implements the client side of the v2 pull protocol:
//!
//! - Ping/version probing and the bearer/basic login dance
//! - Signed (schema 1) manifest retrieval with JWS verification against the
//!   embedded JWKs and the `Docker-Content-Digest` header
//! - Tag listing
//! - Blob HEAD/GET with bounded manual redirect following, credential
//!   scrubbing across redirects, and streamed digest/length verification
//!
//! # Quick Start
//!
//! ```no_run
//! use dockreg::{ClientConfig, RegistryClient};
//!
//! # async fn example() -> dockreg::RegistryResult<()> {
//! let client = RegistryClient::for_name("busybox", ClientConfig::default())?;
//!
//! let tags = client.list_tags().await?;
//! println!("{} has {} tags", tags.name, tags.tags.len());
//!
//! let fetch = client.get_manifest("latest").await?;
//! println!(
//!     "manifest for {}:{} has {} layers",
//!     fetch.manifest.name,
//!     fetch.manifest.tag,
//!     fetch.manifest.fs_layers.len()
//! );
//!
//! let (chain, _stream) = client
//!     .open_blob_stream(&fetch.manifest.fs_layers[0].blob_sum)
//!     .await?;
//! println!("blob resolved in {} hop(s)", chain.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Authentication
//!
//! Operations that need credentials log in lazily: the registry is pinged,
//! the `WWW-Authenticate` challenge interpreted, and for bearer challenges a
//! token is fetched from the advertised realm with scope
//! `repository:<name>:pull`. The resulting `Authorization` header is cached
//! until [`RegistryClient::close`].

pub mod auth;
pub mod blob;
pub mod challenge;
pub mod client;
pub mod digest;
pub mod error;
pub mod jwk;
pub mod jws;
pub mod manifest;
pub mod reference;
pub mod token;

// Re-export main types
pub use auth::AuthInfo;
pub use blob::{BlobStream, Hop, MAX_REDIRECTS};
pub use challenge::AuthChallenge;
pub use client::{
    ClientConfig, ManifestFetch, PingResponse, RegistryClient, DEFAULT_REGISTRY_URL,
};
pub use digest::{Algorithm, Digest, Hasher};
pub use error::{RegistryError, RegistryResult};
pub use jwk::Jwk;
pub use jws::{JwsSignature, ReconstructedJws};
pub use manifest::{FsLayer, HistoryEntry, ManifestSignature, ManifestV1, TagList};
pub use reference::{parse_repo_and_ref, Index, Reference, Repository, Scheme, DEFAULT_INDEX_NAME};
pub use token::{fetch_token, TokenRequest};
