//! JSON Web Key Set types, generation and rotation.

use crate::cert::error::KeyMaterialError;
use crate::error::ErrorKind;
use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod generator;
pub mod rotation;

pub use generator::{generate, generate_from_secret, generate_set, key_id};
pub use rotation::{merge, should_update, UpdateStrategy};

/// Key type of every generated key.
pub const KEY_TYPE_RSA: &str = "RSA";
/// Public key use of every generated key.
pub const KEY_USE_SIG: &str = "sig";
/// Key operation of every generated key.
pub const KEY_OP_VERIFY: &str = "verify";
/// Algorithm advertised by every generated key.
pub const ALG_RS512: &str = "RS512";

/// An error that can arise generating, parsing or rotating a key set.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JwksError {
    /// The certificate or key entry is not RSA.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Generation produced no keys.
    #[error("generated JWKS has no keys")]
    EmptyResult,

    /// The source key material could not be extracted.
    #[error(transparent)]
    KeyMaterial(#[from] KeyMaterialError),

    /// A key parameter is missing or not valid base64url.
    #[error("invalid JWK parameter {name}")]
    InvalidKeyParameter {
        /// Name of the parameter, e.g. `n`.
        name: &'static str,
    },

    /// The key parameters do not form a usable RSA key.
    #[error("invalid RSA public key: {0}")]
    InvalidRsaKey(#[source] rsa::Error),

    /// The key set could not be serialized.
    #[error("cannot serialize JWKS")]
    Serialize(#[source] serde_json::Error),

    /// The bytes are not a JSON key set.
    #[error("cannot deserialize JWKS")]
    Deserialize(#[source] serde_json::Error),

    /// The update strategy is neither `rolling` nor `immediate`.
    #[error("unknown update strategy: {0}")]
    InvalidStrategy(String),
}

impl JwksError {
    /// Returns the failure kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedKeyType(_) => ErrorKind::UnsupportedKeyType,
            Self::EmptyResult | Self::Serialize(_) => ErrorKind::GenerationFailed,
            Self::KeyMaterial(e) => e.kind(),
            Self::InvalidKeyParameter { .. } | Self::InvalidRsaKey(_) | Self::Deserialize(_) => {
                ErrorKind::MalformedInput
            }
            Self::InvalidStrategy(_) => ErrorKind::InvalidConfiguration,
        }
    }
}

/// A single JSON Web Key.
///
/// Serialized field order is fixed; empty optional members are omitted.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Jwk {
    /// Key type.
    pub kty: String,
    /// Public key use.
    #[serde(rename = "use")]
    pub key_use: String,
    /// Permitted operations.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub key_ops: Vec<String>,
    /// Advertised algorithm.
    pub alg: String,
    /// Key ID.
    pub kid: String,
    /// RSA modulus, base64url without padding.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub n: String,
    /// RSA public exponent, base64url without padding.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub e: String,
    /// Certificate chain, standard base64 DER.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub x5c: Vec<String>,
    /// SHA-1 certificate thumbprint, base64url without padding.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub x5t: String,
    /// SHA-256 certificate thumbprint, base64url without padding.
    #[serde(rename = "x5t#S256", skip_serializing_if = "String::is_empty")]
    pub x5t_s256: String,
}

impl Jwk {
    /// Reconstructs the RSA public key from `n` and `e`.
    ///
    /// # Errors
    /// - [`JwksError::UnsupportedKeyType`] if `kty` is not `RSA`.
    /// - [`JwksError::InvalidKeyParameter`] if `n` or `e` is empty or not base64url.
    /// - [`JwksError::InvalidRsaKey`] if the parameters are not a valid key.
    pub fn to_rsa_public_key(&self) -> Result<RsaPublicKey, JwksError> {
        if self.kty != KEY_TYPE_RSA {
            return Err(JwksError::UnsupportedKeyType(self.kty.clone()));
        }
        let n = decode_parameter("n", &self.n)?;
        let e = decode_parameter("e", &self.e)?;
        RsaPublicKey::new(n, e).map_err(JwksError::InvalidRsaKey)
    }
}

fn decode_parameter(name: &'static str, value: &str) -> Result<BigUint, JwksError> {
    let bytes = Base64UrlUnpadded::decode_vec(value)
        .map_err(|_| JwksError::InvalidKeyParameter { name })?;
    if bytes.is_empty() {
        return Err(JwksError::InvalidKeyParameter { name });
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

/// An ordered set of JSON Web Keys. Order is meaningful: older keys first.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Jwks {
    /// The keys.
    #[serde(default)]
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Creates a set from keys.
    pub fn new(keys: Vec<Jwk>) -> Self {
        Self { keys }
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set has no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether a key with `kid` is present.
    pub fn contains_kid(&self, kid: &str) -> bool {
        self.keys.iter().any(|k| k.kid == kid)
    }

    /// Serializes the set as pretty-printed JSON with a two-space indent.
    pub fn to_json(&self) -> Result<Vec<u8>, JwksError> {
        serde_json::to_vec_pretty(self).map_err(JwksError::Serialize)
    }

    /// Parses a JSON key set.
    pub fn from_json(bytes: &[u8]) -> Result<Self, JwksError> {
        serde_json::from_slice(bytes).map_err(JwksError::Deserialize)
    }
}
