//! JSON Web Key to PEM conversion.
//!
//! Manifest signatures embed their public key as a JWK (RFC 7517). The
//! verifier wants SPKI PEM, so the supported key types are converted here:
//! RSA, EC over P-256/P-384/P-521, and OKP Ed25519.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use pkcs8::{EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// An embedded public key, RFC 7517 shape. Only the members needed for the
/// supported key types are modeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type: `RSA`, `EC`, or `OKP`.
    pub kty: String,

    /// Curve name for EC/OKP keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC/OKP x coordinate (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    /// Key ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// Convert a JWK to SPKI PEM.
pub fn to_public_key_pem(jwk: &Jwk) -> RegistryResult<String> {
    match jwk.kty.as_str() {
        "RSA" => rsa_pem(jwk),
        "EC" => ec_pem(jwk),
        "OKP" => okp_pem(jwk),
        other => Err(invalid(format!("unsupported JWK key type: '{}'", other))),
    }
}

fn rsa_pem(jwk: &Jwk) -> RegistryResult<String> {
    let n = decode_field(jwk, "n")?;
    let e = decode_field(jwk, "e")?;

    let key = rsa::RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(&n),
        rsa::BigUint::from_bytes_be(&e),
    )
    .map_err(|e| invalid(format!("invalid RSA JWK: {}", e)))?;

    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| invalid(format!("could not encode RSA key: {}", e)))
}

fn ec_pem(jwk: &Jwk) -> RegistryResult<String> {
    let crv = jwk
        .crv
        .as_deref()
        .ok_or_else(|| invalid("EC JWK missing 'crv'".to_string()))?;
    let field_len = match crv {
        "P-256" => 32,
        "P-384" => 48,
        "P-521" => 66,
        other => return Err(invalid(format!("unsupported EC curve: '{}'", other))),
    };

    let x = fixed_width(decode_field(jwk, "x")?, field_len)?;
    let y = fixed_width(decode_field(jwk, "y")?, field_len)?;

    // Uncompressed SEC1 point: 0x04 || X || Y.
    let mut point = Vec::with_capacity(1 + 2 * field_len);
    point.push(0x04);
    point.extend_from_slice(&x);
    point.extend_from_slice(&y);

    let pem = match crv {
        "P-256" => p256::PublicKey::from_sec1_bytes(&point)
            .map_err(|e| invalid(format!("invalid P-256 point: {}", e)))?
            .to_public_key_pem(LineEnding::LF),
        "P-384" => p384::PublicKey::from_sec1_bytes(&point)
            .map_err(|e| invalid(format!("invalid P-384 point: {}", e)))?
            .to_public_key_pem(LineEnding::LF),
        "P-521" => p521::PublicKey::from_sec1_bytes(&point)
            .map_err(|e| invalid(format!("invalid P-521 point: {}", e)))?
            .to_public_key_pem(LineEnding::LF),
        _ => unreachable!(),
    };

    pem.map_err(|e| invalid(format!("could not encode EC key: {}", e)))
}

fn okp_pem(jwk: &Jwk) -> RegistryResult<String> {
    match jwk.crv.as_deref() {
        Some("Ed25519") => {}
        other => {
            return Err(invalid(format!("unsupported OKP curve: {:?}", other)));
        }
    }

    let x = decode_field(jwk, "x")?;
    let bytes: [u8; 32] = x
        .as_slice()
        .try_into()
        .map_err(|_| invalid(format!("Ed25519 key must be 32 bytes, got {}", x.len())))?;

    let key = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
        .map_err(|e| invalid(format!("invalid Ed25519 key: {}", e)))?;

    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| invalid(format!("could not encode Ed25519 key: {}", e)))
}

fn decode_field(jwk: &Jwk, name: &str) -> RegistryResult<Vec<u8>> {
    let value = match name {
        "x" => &jwk.x,
        "y" => &jwk.y,
        "n" => &jwk.n,
        "e" => &jwk.e,
        _ => &None,
    };
    let value = value
        .as_deref()
        .ok_or_else(|| invalid(format!("{} JWK missing '{}'", jwk.kty, name)))?;

    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| invalid(format!("invalid base64url in JWK '{}': {}", name, e)))
}

/// Left-pad a big-endian coordinate to the curve's field width.
fn fixed_width(mut bytes: Vec<u8>, width: usize) -> RegistryResult<Vec<u8>> {
    while bytes.len() > width && bytes[0] == 0 {
        bytes.remove(0);
    }
    if bytes.len() > width {
        return Err(invalid(format!(
            "EC coordinate too long: {} > {}",
            bytes.len(),
            width
        )));
    }
    if bytes.len() < width {
        let mut padded = vec![0u8; width - bytes.len()];
        padded.extend_from_slice(&bytes);
        bytes = padded;
    }
    Ok(bytes)
}

fn invalid(message: String) -> RegistryError {
    RegistryError::InvalidContent { message }
}
