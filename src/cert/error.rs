//! Error types for certificate and private key extraction.

use crate::error::ErrorKind;
use x509_parser::error::X509Error;

/// An error that may arise extracting key material from PEM input.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KeyMaterialError {
    /// The input does not contain a decodable PEM block.
    #[error("failed to decode PEM block: {0}")]
    MissingPemBlock(String),

    /// The PEM block carries a label other than the one required.
    #[error("unexpected PEM block type: expected {expected}, found {found}")]
    UnexpectedPemLabel {
        /// Label the caller asked for.
        expected: &'static str,
        /// Label found in the input.
        found: String,
    },

    /// Error returned by the X.509 parsing library.
    #[error("failed parsing X.509 certificate")]
    ParseX509Certificate(#[from] X509Error),

    /// The private key is neither valid PKCS#1 nor valid PKCS#8.
    #[error("failed decoding private key as PKCS#1 or PKCS#8")]
    DecodePrivateKey(#[source] pkcs8::Error),

    /// The key uses an algorithm other than RSA.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// The source secret does not carry the expected data entry.
    #[error("{0} not found in secret")]
    MissingSecretKey(&'static str),
}

impl KeyMaterialError {
    /// Returns the failure kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedKeyType(_) => ErrorKind::UnsupportedKeyType,
            _ => ErrorKind::MalformedInput,
        }
    }
}
