//! Internal PEM and DER decoding helpers.

use crate::cert::error::KeyMaterialError;
use pkcs8::{ObjectIdentifier, PrivateKeyInfo};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use x509_parser::certificate::X509Certificate;
use x509_parser::error::X509Error;
use x509_parser::nom::Err;
use x509_parser::pem::{parse_x509_pem, Pem};
use zeroize::Zeroize;

pub(crate) const PEM_LABEL_CERTIFICATE: &str = "CERTIFICATE";

/// `rsaEncryption` from RFC 8017.
const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

/// Decodes the first PEM block of `input`.
///
/// Anything following the first block is ignored.
pub(crate) fn decode_first_pem_block(input: &[u8]) -> Result<Pem, KeyMaterialError> {
    match parse_x509_pem(input) {
        Ok((_, pem)) => Ok(pem),
        Err(Err::Incomplete(_)) => Err(KeyMaterialError::MissingPemBlock(
            "incomplete PEM input".to_string(),
        )),
        Err(Err::Error(e) | Err::Failure(e)) => {
            Err(KeyMaterialError::MissingPemBlock(e.to_string()))
        }
    }
}

/// Parses the given DER-encoded bytes as an X.509 certificate.
pub(crate) fn parse_der_encoded_bytes_as_x509_certificate(
    der_bytes: &[u8],
) -> Result<X509Certificate<'_>, KeyMaterialError> {
    match x509_parser::parse_x509_certificate(der_bytes) {
        Ok((_, cert)) => Ok(cert),
        Err(Err::Incomplete(_)) => Err(KeyMaterialError::ParseX509Certificate(
            X509Error::InvalidCertificate,
        )),
        Err(Err::Error(e) | Err::Failure(e)) => Err(KeyMaterialError::ParseX509Certificate(e)),
    }
}

/// Decodes an RSA private key, trying PKCS#1 first and PKCS#8 second.
///
/// A well-formed PKCS#8 key for any algorithm other than RSA is rejected with
/// [`KeyMaterialError::UnsupportedKeyType`].
pub(crate) fn decode_rsa_private_key(der: &[u8]) -> Result<RsaPrivateKey, KeyMaterialError> {
    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(der) {
        return Ok(key);
    }

    let info = PrivateKeyInfo::try_from(der).map_err(KeyMaterialError::DecodePrivateKey)?;
    if info.algorithm.oid != OID_RSA_ENCRYPTION {
        return Err(KeyMaterialError::UnsupportedKeyType(
            info.algorithm.oid.to_string(),
        ));
    }

    RsaPrivateKey::from_pkcs8_der(der).map_err(KeyMaterialError::DecodePrivateKey)
}

/// Strips the DER sign-padding byte(s) from an unsigned big-endian integer.
pub(crate) fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len().saturating_sub(1));
    &bytes[start..]
}

pub(crate) fn zeroize_pem(mut pem: Pem) {
    pem.contents.zeroize();
}
