//! JWS reconstruction and verification for signed manifests.
//!
//! A schema 1 manifest is served with its `signatures` array spliced into
//! the signed document. The signed payload predates that splice, so it can
//! only be recovered from the raw response bytes: each signature's protected
//! header records how many leading bytes of the body to keep
//! (`formatLength`) and which suffix to append (`formatTail`, typically
//! `"\n}"`). Re-serializing the decoded JSON would reorder keys and change
//! whitespace, invalidating every signature; reconstruction is byte
//! splicing, never re-encoding.
//!
//! Verification builds the compact form
//! `protected + "." + base64url(payload) + "." + signature` per entry and
//! checks it against the key embedded in that entry's JWK.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use pkcs8::DecodePublicKey;
use serde::Deserialize;
use signature::Verifier;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::jwk;
use crate::manifest::ManifestV1;

/// Decoded protected header of one manifest signature.
#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: Option<u64>,

    #[serde(rename = "formatTail")]
    format_tail: Option<String>,
}

/// One signature, resolved for verification.
#[derive(Debug, Clone)]
pub struct JwsSignature {
    /// Base64url protected header, exactly as served.
    pub protected: String,

    /// Base64url signature bytes, exactly as served.
    pub signature: String,

    /// Declared algorithm, e.g. `ES256`.
    pub alg: String,

    /// Embedded key converted to SPKI PEM.
    pub jwk_pem: Option<String>,

    /// x5c chain, if the signer sent one. Unsupported.
    pub chain: Option<Vec<String>>,
}

/// The signing payload recovered from a manifest body, plus its signatures.
#[derive(Debug, Clone)]
pub struct ReconstructedJws {
    /// The exact bytes that were signed.
    pub payload: Vec<u8>,

    pub signatures: Vec<JwsSignature>,
}

impl ReconstructedJws {
    /// Recover the signing payload from the decoded manifest and the raw
    /// response body bytes.
    pub fn reconstruct(manifest: &ManifestV1, body: &[u8]) -> RegistryResult<Self> {
        if manifest.signatures.is_empty() {
            return Err(RegistryError::InvalidContent {
                message: "manifest has no signatures".to_string(),
            });
        }

        let mut format_length: Option<usize> = None;
        let mut format_tail: Option<Vec<u8>> = None;
        let mut signatures = Vec::with_capacity(manifest.signatures.len());

        for sig in &manifest.signatures {
            let protected_bytes = b64url_decode(&sig.protected).map_err(|e| {
                RegistryError::InvalidContent {
                    message: format!("invalid base64url in protected header: {}", e),
                }
            })?;
            let header: ProtectedHeader =
                serde_json::from_slice(&protected_bytes).map_err(|e| {
                    RegistryError::InvalidContent {
                        message: format!("could not parse protected header: {}", e),
                    }
                })?;

            let length = header.format_length.ok_or_else(|| {
                RegistryError::InvalidContent {
                    message: "protected header missing formatLength".to_string(),
                }
            })? as usize;
            if length > body.len() {
                return Err(RegistryError::InvalidContent {
                    message: format!(
                        "formatLength {} exceeds manifest body length {}",
                        length,
                        body.len()
                    ),
                });
            }

            let tail_b64 = header.format_tail.ok_or_else(|| {
                RegistryError::InvalidContent {
                    message: "protected header missing formatTail".to_string(),
                }
            })?;
            let tail = b64url_decode(&tail_b64).map_err(|e| RegistryError::InvalidContent {
                message: format!("invalid base64url in formatTail: {}", e),
            })?;

            // Every signature must describe the same splice point.
            match format_length {
                None => format_length = Some(length),
                Some(prev) if prev != length => {
                    return Err(RegistryError::InvalidContent {
                        message: "manifest signatures disagree on formatLength".to_string(),
                    });
                }
                Some(_) => {}
            }
            match &format_tail {
                None => format_tail = Some(tail),
                Some(prev) if *prev != tail => {
                    return Err(RegistryError::InvalidContent {
                        message: "manifest signatures disagree on formatTail".to_string(),
                    });
                }
                Some(_) => {}
            }

            let jwk_pem = sig
                .header
                .jwk
                .as_ref()
                .map(jwk::to_public_key_pem)
                .transpose()?;

            signatures.push(JwsSignature {
                protected: sig.protected.clone(),
                signature: sig.signature.clone(),
                alg: sig.header.alg.clone(),
                jwk_pem,
                chain: sig.header.chain.clone(),
            });
        }

        let length = format_length.expect("at least one signature was processed");
        let tail = format_tail.expect("at least one signature was processed");

        let mut payload = Vec::with_capacity(length + tail.len());
        payload.extend_from_slice(&body[..length]);
        payload.extend_from_slice(&tail);

        debug!(
            signatures = signatures.len(),
            payload_len = payload.len(),
            "reconstructed manifest signing payload"
        );

        Ok(Self {
            payload,
            signatures,
        })
    }

    /// Verify every signature against its embedded key.
    pub fn verify(&self) -> RegistryResult<()> {
        let payload_b64 = URL_SAFE_NO_PAD.encode(&self.payload);

        for sig in &self.signatures {
            if sig.alg.eq_ignore_ascii_case("none") {
                return Err(RegistryError::ManifestVerification {
                    reason: "forbidden signature algorithm 'none'".to_string(),
                });
            }
            if sig.chain.is_some() {
                return Err(RegistryError::Internal {
                    message: "x5c certificate chain validation is not implemented".to_string(),
                });
            }

            let pem = sig.jwk_pem.as_deref().ok_or_else(|| {
                RegistryError::ManifestVerification {
                    reason: "signature carries no key material".to_string(),
                }
            })?;

            let signing_input = format!("{}.{}", sig.protected, payload_b64);
            let signature = b64url_decode(&sig.signature).map_err(|e| {
                RegistryError::ManifestVerification {
                    reason: format!("invalid base64url signature: {}", e),
                }
            })?;

            verify_one(&sig.alg, pem, signing_input.as_bytes(), &signature)?;
        }

        Ok(())
    }
}

/// Verify a single compact-JWS signing input with the declared algorithm.
fn verify_one(alg: &str, pem: &str, message: &[u8], signature: &[u8]) -> RegistryResult<()> {
    match alg {
        "RS256" => {
            let key = rsa_key(pem)?;
            let key = rsa::pkcs1v15::VerifyingKey::<sha2::Sha256>::new(key);
            let sig = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|e| bad_signature(alg, &e.to_string()))?;
            key.verify(message, &sig)
                .map_err(|_| verification_failed(alg))
        }
        "RS384" => {
            let key = rsa_key(pem)?;
            let key = rsa::pkcs1v15::VerifyingKey::<sha2::Sha384>::new(key);
            let sig = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|e| bad_signature(alg, &e.to_string()))?;
            key.verify(message, &sig)
                .map_err(|_| verification_failed(alg))
        }
        "RS512" => {
            let key = rsa_key(pem)?;
            let key = rsa::pkcs1v15::VerifyingKey::<sha2::Sha512>::new(key);
            let sig = rsa::pkcs1v15::Signature::try_from(signature)
                .map_err(|e| bad_signature(alg, &e.to_string()))?;
            key.verify(message, &sig)
                .map_err(|_| verification_failed(alg))
        }
        "ES256" => {
            let key = p256::ecdsa::VerifyingKey::from_public_key_pem(pem)
                .map_err(|e| bad_key(alg, &e.to_string()))?;
            let sig = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|e| bad_signature(alg, &e.to_string()))?;
            key.verify(message, &sig)
                .map_err(|_| verification_failed(alg))
        }
        "ES384" => {
            let key = p384::ecdsa::VerifyingKey::from_public_key_pem(pem)
                .map_err(|e| bad_key(alg, &e.to_string()))?;
            let sig = p384::ecdsa::Signature::from_slice(signature)
                .map_err(|e| bad_signature(alg, &e.to_string()))?;
            key.verify(message, &sig)
                .map_err(|_| verification_failed(alg))
        }
        "ES512" => {
            let pub_key = p521::PublicKey::from_public_key_pem(pem)
                .map_err(|e| bad_key(alg, &e.to_string()))?;
            let key: p521::ecdsa::VerifyingKey =
                ecdsa::VerifyingKey::<p521::NistP521>::from(pub_key).into();
            let sig = p521::ecdsa::Signature::from_slice(signature)
                .map_err(|e| bad_signature(alg, &e.to_string()))?;
            key.verify(message, &sig)
                .map_err(|_| verification_failed(alg))
        }
        "EdDSA" => {
            let key = ed25519_dalek::VerifyingKey::from_public_key_pem(pem)
                .map_err(|e| bad_key(alg, &e.to_string()))?;
            let sig = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|e| bad_signature(alg, &e.to_string()))?;
            key.verify(message, &sig)
                .map_err(|_| verification_failed(alg))
        }
        other => Err(RegistryError::ManifestVerification {
            reason: format!("unsupported signature algorithm: '{}'", other),
        }),
    }
}

fn rsa_key(pem: &str) -> RegistryResult<rsa::RsaPublicKey> {
    rsa::RsaPublicKey::from_public_key_pem(pem).map_err(|e| bad_key("RSA", &e.to_string()))
}

fn bad_key(alg: &str, detail: &str) -> RegistryError {
    RegistryError::ManifestVerification {
        reason: format!("could not load {} public key: {}", alg, detail),
    }
}

fn bad_signature(alg: &str, detail: &str) -> RegistryError {
    RegistryError::ManifestVerification {
        reason: format!("malformed {} signature: {}", alg, detail),
    }
}

fn verification_failed(alg: &str) -> RegistryError {
    RegistryError::ManifestVerification {
        reason: format!("{} signature verification failed", alg),
    }
}

/// Base64url decode, tolerating padded input (libtrust strips padding, but
/// not every signer does).
fn b64url_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s.trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;
    use signature::Signer;

    const PAYLOAD: &str = concat!(
        "{\n",
        "   \"schemaVersion\": 1,\n",
        "   \"name\": \"library/busybox\",\n",
        "   \"tag\": \"latest\",\n",
        "   \"architecture\": \"amd64\",\n",
        "   \"fsLayers\": [{\"blobSum\": \"sha256:aa\"}],\n",
        "   \"history\": [{\"v1Compatibility\": \"{}\"}]\n",
        "}"
    );

    fn p256_key() -> p256::ecdsa::SigningKey {
        p256::ecdsa::SigningKey::from_slice(&[0x17; 32]).unwrap()
    }

    fn p256_jwk_json(key: &p256::ecdsa::SigningKey) -> serde_json::Value {
        let point = key.verifying_key().to_encoded_point(false);
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
            "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
        })
    }

    /// Build a served manifest body the way libtrust does: sign the bare
    /// payload, then splice a `signatures` member in before the closing
    /// brace.
    fn signed_body(key: &p256::ecdsa::SigningKey) -> Vec<u8> {
        let format_length = PAYLOAD.len() - 2;
        let format_tail = &PAYLOAD[format_length..];

        let protected = URL_SAFE_NO_PAD.encode(format!(
            r#"{{"formatLength":{},"formatTail":"{}","time":"2016-01-18T09:23:33Z"}}"#,
            format_length,
            URL_SAFE_NO_PAD.encode(format_tail)
        ));
        let signing_input = format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(PAYLOAD));
        let signature: p256::ecdsa::Signature = key.sign(signing_input.as_bytes());

        let entry = serde_json::json!({
            "header": {"alg": "ES256", "jwk": p256_jwk_json(key)},
            "signature": URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            "protected": protected,
        });

        format!(
            "{},\n   \"signatures\": [{}]{}",
            &PAYLOAD[..format_length],
            entry,
            format_tail
        )
        .into_bytes()
    }

    fn decode(body: &[u8]) -> ManifestV1 {
        serde_json::from_slice(body).unwrap()
    }

    #[test]
    fn test_reconstruct_recovers_exact_payload() {
        let body = signed_body(&p256_key());
        let jws = ReconstructedJws::reconstruct(&decode(&body), &body).unwrap();
        assert_eq!(jws.payload, PAYLOAD.as_bytes());
        assert_eq!(jws.signatures.len(), 1);
        assert_eq!(jws.signatures[0].alg, "ES256");
        assert!(jws.signatures[0].jwk_pem.is_some());
    }

    #[test]
    fn test_verify_es256_roundtrip() {
        let body = signed_body(&p256_key());
        let jws = ReconstructedJws::reconstruct(&decode(&body), &body).unwrap();
        jws.verify().unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_payload() {
        let body = signed_body(&p256_key());
        let jws = ReconstructedJws::reconstruct(&decode(&body), &body).unwrap();

        let mut tampered = jws.clone();
        let pos = tampered.payload.len() / 2;
        tampered.payload[pos] ^= 0x01;

        assert!(matches!(
            tampered.verify(),
            Err(RegistryError::ManifestVerification { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let body = signed_body(&p256_key());
        let mut manifest = decode(&body);

        // Swap in a different key than the one that signed.
        let other = p256::ecdsa::SigningKey::from_slice(&[0x29; 32]).unwrap();
        manifest.signatures[0].header.jwk =
            Some(serde_json::from_value(p256_jwk_json(&other)).unwrap());

        let jws = ReconstructedJws::reconstruct(&manifest, &body).unwrap();
        assert!(matches!(
            jws.verify(),
            Err(RegistryError::ManifestVerification { .. })
        ));
    }

    #[test]
    fn test_verify_eddsa_roundtrip() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[0x07; 32]);
        let format_length = PAYLOAD.len() - 2;
        let format_tail = &PAYLOAD[format_length..];

        let protected = URL_SAFE_NO_PAD.encode(format!(
            r#"{{"formatLength":{},"formatTail":"{}"}}"#,
            format_length,
            URL_SAFE_NO_PAD.encode(format_tail)
        ));
        let signing_input = format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(PAYLOAD));
        let signature = key.sign(signing_input.as_bytes());

        let entry = serde_json::json!({
            "header": {
                "alg": "EdDSA",
                "jwk": {
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "x": URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
                }
            },
            "signature": URL_SAFE_NO_PAD.encode(signature.to_bytes()),
            "protected": protected,
        });
        let body = format!(
            "{},\n   \"signatures\": [{}]{}",
            &PAYLOAD[..format_length],
            entry,
            format_tail
        )
        .into_bytes();

        let jws = ReconstructedJws::reconstruct(&decode(&body), &body).unwrap();
        jws.verify().unwrap();
    }

    #[test]
    fn test_alg_none_rejected() {
        let body = signed_body(&p256_key());
        let mut manifest = decode(&body);
        manifest.signatures[0].header.alg = "none".to_string();

        let jws = ReconstructedJws::reconstruct(&manifest, &body).unwrap();
        match jws.verify() {
            Err(RegistryError::ManifestVerification { reason }) => {
                assert!(reason.contains("none"), "unexpected reason: {}", reason)
            }
            other => panic!("expected ManifestVerification, got {:?}", other),
        }
    }

    #[test]
    fn test_chain_rejected_as_unimplemented() {
        let body = signed_body(&p256_key());
        let mut manifest = decode(&body);
        manifest.signatures[0].header.chain = Some(vec!["MIIB...".to_string()]);

        let jws = ReconstructedJws::reconstruct(&manifest, &body).unwrap();
        assert!(matches!(
            jws.verify(),
            Err(RegistryError::Internal { .. })
        ));
    }

    #[test]
    fn test_unsupported_alg_rejected() {
        let body = signed_body(&p256_key());
        let mut manifest = decode(&body);
        manifest.signatures[0].header.alg = "HS256".to_string();

        let jws = ReconstructedJws::reconstruct(&manifest, &body).unwrap();
        assert!(matches!(
            jws.verify(),
            Err(RegistryError::ManifestVerification { .. })
        ));
    }

    #[test]
    fn test_signatures_must_agree_on_format_length() {
        let body = signed_body(&p256_key());
        let mut manifest = decode(&body);

        // Duplicate the signature but with a different formatLength.
        let mut second = manifest.signatures[0].clone();
        second.protected = URL_SAFE_NO_PAD.encode(format!(
            r#"{{"formatLength":{},"formatTail":"{}"}}"#,
            1,
            URL_SAFE_NO_PAD.encode("\n}")
        ));
        manifest.signatures.push(second);

        assert!(matches!(
            ReconstructedJws::reconstruct(&manifest, &body),
            Err(RegistryError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_missing_format_length_rejected() {
        let body = signed_body(&p256_key());
        let mut manifest = decode(&body);
        manifest.signatures[0].protected = URL_SAFE_NO_PAD.encode(r#"{"formatTail":"Cn0"}"#);

        match ReconstructedJws::reconstruct(&manifest, &body) {
            Err(RegistryError::InvalidContent { message }) => {
                assert!(message.contains("formatLength"), "got: {}", message)
            }
            other => panic!("expected InvalidContent, got {:?}", other),
        }
    }

    #[test]
    fn test_format_length_beyond_body_rejected() {
        let body = signed_body(&p256_key());
        let mut manifest = decode(&body);
        manifest.signatures[0].protected = URL_SAFE_NO_PAD.encode(format!(
            r#"{{"formatLength":{},"formatTail":"Cn0"}}"#,
            body.len() + 100
        ));

        assert!(matches!(
            ReconstructedJws::reconstruct(&manifest, &body),
            Err(RegistryError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_empty_signatures_rejected() {
        let mut manifest = decode(&signed_body(&p256_key()));
        manifest.signatures.clear();

        assert!(matches!(
            ReconstructedJws::reconstruct(&manifest, PAYLOAD.as_bytes()),
            Err(RegistryError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_padded_base64url_accepted() {
        assert_eq!(b64url_decode("Cn0=").unwrap(), b"\n}");
        assert_eq!(b64url_decode("Cn0").unwrap(), b"\n}");
    }
}
