//! Error type shared by every authority operation.

use thiserror::Error;

/// Errors produced by the certificate authority engine.
///
/// Every variant that reaches a caller maps to exactly one HTTP status in
/// the REST layer; `SerialCollision` is retried internally and never
/// escapes an issuance call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaError {
    /// Malformed subject, validity window, key usage vector or policy value.
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    /// A requested value does not match a template's regular expression.
    #[error("Value '{value}' does not match the pattern required for {field}")]
    PatternMismatch { field: String, value: String },

    /// The selected issuer cannot sign (wrong type, not a CA, path length exhausted).
    #[error("Issuer not eligible: {0}")]
    IssuerNotEligible(String),

    /// The issuer, or one of its ancestors, is revoked or outside its validity window.
    #[error("Issuer expired or revoked: {0}")]
    IssuerExpiredOrRevoked(String),

    /// The CSR signature does not verify against the embedded public key.
    #[error("CSR signature verification failed")]
    InvalidCsrSignature,

    /// The CSR could not be parsed or uses an unsupported algorithm.
    #[error("Invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("Certificate is already revoked")]
    AlreadyRevoked,

    #[error("Root certificates can only be revoked by an administrator")]
    CannotRevokeRoot,

    /// Authorization failure. Deliberately carries no detail.
    #[error("Forbidden")]
    Forbidden,

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("{entity} already exists: {name}")]
    AlreadyExists { entity: String, name: String },

    /// The issuer graph loops back on itself.
    #[error("Certificate chain contains a cycle at certificate {0}")]
    ChainCycle(u64),

    /// Serial number already present in the store.
    #[error("Serial number collision")]
    SerialCollision,

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Cryptography error: {0}")]
    Crypto(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CaError>;

impl CaError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CaError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        CaError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }
}

impl From<der::Error> for CaError {
    fn from(err: der::Error) -> Self {
        CaError::Encoding(err.to_string())
    }
}

impl From<x509_cert::spki::Error> for CaError {
    fn from(err: x509_cert::spki::Error) -> Self {
        CaError::Encoding(err.to_string())
    }
}

impl From<pkcs8::Error> for CaError {
    fn from(err: pkcs8::Error) -> Self {
        CaError::Encoding(err.to_string())
    }
}

impl From<rsa::Error> for CaError {
    fn from(err: rsa::Error) -> Self {
        CaError::Crypto(err.to_string())
    }
}

impl From<rsa::pkcs1::Error> for CaError {
    fn from(err: rsa::pkcs1::Error) -> Self {
        CaError::Crypto(err.to_string())
    }
}

impl From<pem::PemError> for CaError {
    fn from(err: pem::PemError) -> Self {
        CaError::Encoding(err.to_string())
    }
}

impl From<regex::Error> for CaError {
    fn from(err: regex::Error) -> Self {
        CaError::Validation {
            field: "regex".to_string(),
            message: err.to_string(),
        }
    }
}
