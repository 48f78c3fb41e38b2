//! Signed-token round trip proving a served key matches a private key.

use crate::cert::PrivateKey;
use crate::jwks::{Jwks, KEY_TYPE_RSA};
use crate::verification::VerificationError;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Issuer of every verification token.
pub const VERIFICATION_ISSUER: &str = "jwks-operator-verification";
const VERIFICATION_SUBJECT: &str = "test";
const TOKEN_LIFETIME: Duration = Duration::minutes(5);

#[derive(Debug, Serialize, Deserialize)]
struct VerificationClaims {
    iss: String,
    sub: String,
    iat: i64,
    exp: i64,
    kid: String,
}

/// Reconstructs the public key of the first entry of a served key set.
///
/// Returns the key together with its `kid`. Rolling updates append new keys,
/// so after a rotation the first entry is still the previous key and a token
/// minted with the current private key does not verify against it. Such a
/// target reports `JWKSVerificationFailed` until the old key leaves the set.
pub fn first_public_key(body: &[u8]) -> Result<(RsaPublicKey, String), VerificationError> {
    let jwks = Jwks::from_json(body).map_err(VerificationError::Decode)?;
    let jwk = jwks.keys.first().ok_or(VerificationError::NoKeys)?;
    if jwk.kty != KEY_TYPE_RSA {
        return Err(VerificationError::UnsupportedKeyType(jwk.kty.clone()));
    }
    let public_key = jwk.to_rsa_public_key().map_err(VerificationError::Decode)?;
    Ok((public_key, jwk.kid.clone()))
}

/// Mints an RS256 token valid for five minutes from `now`, carrying `kid` in
/// both the header and the claims.
pub fn mint_token(
    private_key: &PrivateKey,
    kid: &str,
    now: OffsetDateTime,
) -> Result<String, VerificationError> {
    let der = private_key
        .as_rsa()
        .to_pkcs1_der()
        .map_err(VerificationError::KeyEncoding)?;

    let claims = VerificationClaims {
        iss: VERIFICATION_ISSUER.to_string(),
        sub: VERIFICATION_SUBJECT.to_string(),
        iat: now.unix_timestamp(),
        exp: (now + TOKEN_LIFETIME).unix_timestamp(),
        kid: kid.to_string(),
    };
    let header = Header {
        kid: Some(kid.to_string()),
        ..Header::new(Algorithm::RS256)
    };

    Ok(encode(
        &header,
        &claims,
        &EncodingKey::from_rsa_der(der.as_bytes()),
    )?)
}

/// Verifies an RS256 token against `public_key`.
///
/// Any other algorithm, a bad signature, a foreign issuer or an expired token
/// fails with [`VerificationError::Token`].
pub fn verify_token(token: &str, public_key: &RsaPublicKey) -> Result<(), VerificationError> {
    let key = DecodingKey::from_rsa_raw_components(
        &public_key.n().to_bytes_be(),
        &public_key.e().to_bytes_be(),
    );

    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = true;
    validation.validate_aud = false;
    validation.set_issuer(&[VERIFICATION_ISSUER]);

    decode::<VerificationClaims>(token, &key, &validation)?;
    Ok(())
}
