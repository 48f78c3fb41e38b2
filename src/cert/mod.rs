//! `Certificate` and `PrivateKey` types and the key material extractor.
//!
//! Both types are built from PEM input and validated at construction time.
//! Only RSA key material is supported; any other algorithm fails with
//! [`KeyMaterialError::UnsupportedKeyType`].

use crate::cert::error::KeyMaterialError;
use crate::cert::parsing::{
    decode_first_pem_block, decode_rsa_private_key, parse_der_encoded_bytes_as_x509_certificate,
    trim_leading_zeros, zeroize_pem, PEM_LABEL_CERTIFICATE,
};
use crate::constants::{SECRET_KEY_TLS_CERT, SECRET_KEY_TLS_KEY};
use crate::store::resources::Secret;
use rsa::RsaPrivateKey;
use x509_parser::public_key::PublicKey;

pub mod error;
pub(crate) mod parsing;

/// A single DER-encoded X.509 certificate.
///
/// Invariant: instances are always validated as parseable DER-encoded X.509.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// Parses the first PEM block of `pem`, which must be of type `CERTIFICATE`.
    ///
    /// # Errors
    /// - [`KeyMaterialError::MissingPemBlock`] if no PEM block can be decoded.
    /// - [`KeyMaterialError::UnexpectedPemLabel`] if the block is not a certificate.
    /// - [`KeyMaterialError::ParseX509Certificate`] if the DER payload is not X.509.
    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyMaterialError> {
        let block = decode_first_pem_block(pem)?;
        if block.label != PEM_LABEL_CERTIFICATE {
            return Err(KeyMaterialError::UnexpectedPemLabel {
                expected: PEM_LABEL_CERTIFICATE,
                found: block.label,
            });
        }
        Self::try_from(block.contents)
    }

    /// Returns the certificate bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Extracts the subject public key.
    ///
    /// # Errors
    /// - [`KeyMaterialError::UnsupportedKeyType`] if the key is not RSA.
    /// - [`KeyMaterialError::ParseX509Certificate`] if the key cannot be decoded.
    pub fn public_key(&self) -> Result<PublicKeyMaterial, KeyMaterialError> {
        let x509 = parse_der_encoded_bytes_as_x509_certificate(self.as_bytes())?;
        let spki = x509.public_key();

        match spki.parsed()? {
            PublicKey::RSA(rsa) => Ok(PublicKeyMaterial::Rsa {
                modulus: trim_leading_zeros(rsa.modulus).to_vec(),
                exponent: trim_leading_zeros(rsa.exponent).to_vec(),
            }),
            _ => Err(KeyMaterialError::UnsupportedKeyType(
                spki.algorithm.algorithm.to_id_string(),
            )),
        }
    }
}

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for Certificate {
    type Error = KeyMaterialError;

    fn try_from(der_bytes: Vec<u8>) -> Result<Self, Self::Error> {
        parse_der_encoded_bytes_as_x509_certificate(&der_bytes)?;
        Ok(Self(der_bytes))
    }
}

impl TryFrom<&[u8]> for Certificate {
    type Error = KeyMaterialError;

    fn try_from(der_bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::try_from(der_bytes.to_vec())
    }
}

/// Public key material of a certificate.
///
/// Closed over the algorithms the engine supports.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum PublicKeyMaterial {
    /// An RSA public key as unsigned big-endian integers without leading zeros.
    Rsa {
        /// The modulus `n`.
        modulus: Vec<u8>,
        /// The public exponent `e`.
        exponent: Vec<u8>,
    },
}

/// An RSA private key decoded from PKCS#1 or PKCS#8 PEM.
///
/// The inner key is zeroized on drop.
#[derive(Clone)]
pub struct PrivateKey(RsaPrivateKey);

impl PrivateKey {
    /// Parses the first PEM block of `pem` as an RSA private key.
    ///
    /// The PEM label is not inspected; PKCS#1 is tried first, then PKCS#8.
    ///
    /// # Errors
    /// - [`KeyMaterialError::MissingPemBlock`] if no PEM block can be decoded.
    /// - [`KeyMaterialError::DecodePrivateKey`] if the payload is neither format.
    /// - [`KeyMaterialError::UnsupportedKeyType`] for a non-RSA PKCS#8 key.
    pub fn from_pem(pem: &[u8]) -> Result<Self, KeyMaterialError> {
        let block = decode_first_pem_block(pem)?;
        let key = decode_rsa_private_key(&block.contents);
        zeroize_pem(block);
        key.map(Self)
    }

    /// Returns the decoded RSA key.
    pub fn as_rsa(&self) -> &RsaPrivateKey {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &"RSA")
            .finish_non_exhaustive()
    }
}

/// Parses a PEM certificate. See [`Certificate::from_pem`].
pub fn parse_certificate(pem: &[u8]) -> Result<Certificate, KeyMaterialError> {
    Certificate::from_pem(pem)
}

/// Parses a PEM RSA private key. See [`PrivateKey::from_pem`].
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKey, KeyMaterialError> {
    PrivateKey::from_pem(pem)
}

/// Parses the certificate stored under `tls.crt` in `secret`.
pub fn certificate_from_secret(secret: &Secret) -> Result<Certificate, KeyMaterialError> {
    let pem = secret
        .data
        .get(SECRET_KEY_TLS_CERT)
        .ok_or(KeyMaterialError::MissingSecretKey(SECRET_KEY_TLS_CERT))?;
    parse_certificate(pem)
}

/// Parses the private key stored under `tls.key` in `secret`.
pub fn private_key_from_secret(secret: &Secret) -> Result<PrivateKey, KeyMaterialError> {
    let pem = secret
        .data
        .get(SECRET_KEY_TLS_KEY)
        .ok_or(KeyMaterialError::MissingSecretKey(SECRET_KEY_TLS_KEY))?;
    parse_private_key(pem)
}
