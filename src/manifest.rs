//! Image manifest, schema version 1.
//!
//! Schema 1 manifests are signed JSON: the document carries its own
//! detached-payload JWS in the `signatures` array (see [`crate::jws`]).

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// A schema 1 image manifest as returned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestV1 {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    /// Repository name, e.g. `library/busybox`.
    pub name: String,

    /// Tag this manifest was published under.
    pub tag: String,

    pub architecture: String,

    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,

    pub history: Vec<HistoryEntry>,

    #[serde(default)]
    pub signatures: Vec<ManifestSignature>,
}

/// One filesystem layer, identified by its blob digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

/// One history entry; `v1Compatibility` is an embedded JSON document kept
/// opaque here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// One entry of the manifest's `signatures` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSignature {
    pub header: SignatureHeader,

    /// Base64url-encoded signature bytes.
    pub signature: String,

    /// Base64url-encoded protected header (see [`crate::jws`]).
    pub protected: String,
}

/// JOSE header of a manifest signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureHeader {
    /// Signature algorithm, e.g. `ES256`.
    pub alg: String,

    /// Embedded public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<crate::jwk::Jwk>,

    /// x5c certificate chain; unsupported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<Vec<String>>,
}

impl ManifestV1 {
    /// Enforce the structural invariants of a schema 1 manifest.
    ///
    /// Every manifest handed back by the client has passed this check, so
    /// callers can index `fs_layers` and `history` interchangeably.
    pub fn validate(&self) -> RegistryResult<()> {
        if self.schema_version != 1 {
            return Err(RegistryError::InvalidContent {
                message: format!(
                    "unsupported manifest schema version: {}",
                    self.schema_version
                ),
            });
        }
        if self.fs_layers.is_empty() {
            return Err(RegistryError::InvalidContent {
                message: "manifest has no fsLayers".to_string(),
            });
        }
        if self.fs_layers.len() != self.history.len() {
            return Err(RegistryError::InvalidContent {
                message: format!(
                    "manifest fsLayers length ({}) does not match history length ({})",
                    self.fs_layers.len(),
                    self.history.len()
                ),
            });
        }
        Ok(())
    }
}

/// Response from `GET /v2/<name>/tags/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagList {
    pub name: String,

    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_manifest() -> ManifestV1 {
        serde_json::from_value(serde_json::json!({
            "schemaVersion": 1,
            "name": "library/busybox",
            "tag": "latest",
            "architecture": "amd64",
            "fsLayers": [{"blobSum": "sha256:aa"}],
            "history": [{"v1Compatibility": "{}"}],
            "signatures": []
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_wire_shape() {
        let manifest = minimal_manifest();
        assert_eq!(manifest.schema_version, 1);
        assert_eq!(manifest.fs_layers[0].blob_sum, "sha256:aa");
        assert_eq!(manifest.history[0].v1_compatibility, "{}");
    }

    #[test]
    fn test_validate_ok() {
        assert!(minimal_manifest().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_schema_v2() {
        let mut manifest = minimal_manifest();
        manifest.schema_version = 2;
        assert!(matches!(
            manifest.validate(),
            Err(RegistryError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_layers() {
        let mut manifest = minimal_manifest();
        manifest.fs_layers.clear();
        manifest.history.clear();
        assert!(matches!(
            manifest.validate(),
            Err(RegistryError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_layer_history_mismatch() {
        let mut manifest = minimal_manifest();
        manifest.history.push(HistoryEntry {
            v1_compatibility: "{}".to_string(),
        });
        assert!(matches!(
            manifest.validate(),
            Err(RegistryError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_tag_list_defaults() {
        let tags: TagList = serde_json::from_str(r#"{"name":"library/busybox"}"#).unwrap();
        assert!(tags.tags.is_empty());
    }
}
