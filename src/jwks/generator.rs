//! Certificate to JWK conversion.
//!
//! Generation is pure: byte-identical certificates always yield byte-identical
//! keys, `kid` included.

use crate::cert::{certificate_from_secret, Certificate, PublicKeyMaterial};
use crate::jwks::{Jwk, Jwks, JwksError, ALG_RS512, KEY_OP_VERIFY, KEY_TYPE_RSA, KEY_USE_SIG};
use crate::store::resources::Secret;
use base64ct::{Base64, Base64UrlUnpadded, Encoding};
use sha1::Sha1;
use sha2::{Digest, Sha256};

const KEY_ID_LEN: usize = 16;

/// Key ID of a certificate: the first 16 lowercase hex characters of the
/// SHA-1 digest of its DER bytes.
pub fn key_id(cert: &Certificate) -> String {
    let mut kid = hex::encode(Sha1::digest(cert.as_bytes()));
    kid.truncate(KEY_ID_LEN);
    kid
}

/// Builds the JWK of a certificate's public key.
///
/// # Errors
/// - [`JwksError::UnsupportedKeyType`] if the public key is not RSA.
/// - [`JwksError::KeyMaterial`] if the public key cannot be decoded.
pub fn generate(cert: &Certificate) -> Result<Jwk, JwksError> {
    let (modulus, exponent) = match cert.public_key() {
        Ok(PublicKeyMaterial::Rsa { modulus, exponent }) => (modulus, exponent),
        Err(crate::cert::error::KeyMaterialError::UnsupportedKeyType(alg)) => {
            return Err(JwksError::UnsupportedKeyType(alg))
        }
        Err(e) => return Err(e.into()),
    };

    let der = cert.as_bytes();
    Ok(Jwk {
        kty: KEY_TYPE_RSA.to_string(),
        key_use: KEY_USE_SIG.to_string(),
        key_ops: vec![KEY_OP_VERIFY.to_string()],
        alg: ALG_RS512.to_string(),
        kid: key_id(cert),
        n: Base64UrlUnpadded::encode_string(&modulus),
        e: Base64UrlUnpadded::encode_string(&exponent),
        x5c: vec![Base64::encode_string(der)],
        x5t: Base64UrlUnpadded::encode_string(&Sha1::digest(der)),
        x5t_s256: Base64UrlUnpadded::encode_string(&Sha256::digest(der)),
    })
}

/// Builds a key set holding one key per certificate, in order.
///
/// # Errors
/// Fails with [`JwksError::EmptyResult`] if no keys were produced, or with the
/// first per-certificate error.
pub fn generate_set(certs: &[Certificate]) -> Result<Jwks, JwksError> {
    let keys = certs.iter().map(generate).collect::<Result<Vec<_>, _>>()?;
    if keys.is_empty() {
        return Err(JwksError::EmptyResult);
    }
    Ok(Jwks::new(keys))
}

/// Builds the key set of the certificate stored under `tls.crt` in `secret`.
pub fn generate_from_secret(secret: &Secret) -> Result<Jwks, JwksError> {
    let cert = certificate_from_secret(secret)?;
    generate_set(std::slice::from_ref(&cert))
}
