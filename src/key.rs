use std::fmt;

use const_oid::ObjectIdentifier;
use der::Decode;
use ed25519_dalek::SigningKey as Ed25519SigningKey;
use ed25519_dalek::VerifyingKey as Ed25519VerifyingKey;
use p256::ecdsa::{SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey};
use p384::ecdsa::{SigningKey as P384SigningKey, VerifyingKey as P384VerifyingKey};
use pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, SecretDocument};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

use crate::cert::SignatureAlgorithm;
use crate::error::{CaError, Result};

/// Key algorithms a CA key pair can be generated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
    Ed25519,
    Rsa2048,
    Rsa3072,
    Rsa4096,
}

/// Supported key types for signing certificates and CRLs.
///
/// The private half only leaves this type as the PKCS#8 document the key
/// vault seals; the `Debug` impl prints the algorithm alone.
pub enum KeyPair {
    Rsa {
        private: Box<RsaPrivateKey>,
        public: RsaPublicKey,
    },
    EcdsaP256 {
        signing_key: P256SigningKey,
    },
    EcdsaP384 {
        signing_key: P384SigningKey,
    },
    Ed25519 {
        signing_key: Ed25519SigningKey,
    },
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a key pair for the given algorithm.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        match algorithm {
            KeyAlgorithm::EcdsaP256 => Ok(Self::generate_ecdsa_p256()),
            KeyAlgorithm::EcdsaP384 => Ok(Self::generate_ecdsa_p384()),
            KeyAlgorithm::Ed25519 => Ok(Self::generate_ed25519()),
            KeyAlgorithm::Rsa2048 => Self::generate_rsa(2048),
            KeyAlgorithm::Rsa3072 => Self::generate_rsa(3072),
            KeyAlgorithm::Rsa4096 => Self::generate_rsa(4096),
        }
    }

    /// Generate an RSA key pair with the specified number of bits.
    pub fn generate_rsa(bits: usize) -> Result<Self> {
        let mut rng = rand_core::OsRng;
        let private = RsaPrivateKey::new(&mut rng, bits)?;
        let public = RsaPublicKey::from(&private);
        Ok(KeyPair::Rsa {
            private: Box::new(private),
            public,
        })
    }

    /// Generate an ECDSA P-256 key pair.
    pub fn generate_ecdsa_p256() -> Self {
        let mut rng = rand_core::OsRng;
        KeyPair::EcdsaP256 {
            signing_key: P256SigningKey::random(&mut rng),
        }
    }

    /// Generate an ECDSA P-384 key pair.
    pub fn generate_ecdsa_p384() -> Self {
        let mut rng = rand_core::OsRng;
        KeyPair::EcdsaP384 {
            signing_key: P384SigningKey::random(&mut rng),
        }
    }

    /// Generate an Ed25519 key pair.
    pub fn generate_ed25519() -> Self {
        let mut rng = rand_core::OsRng;
        KeyPair::Ed25519 {
            signing_key: Ed25519SigningKey::generate(&mut rng),
        }
    }

    /// Encodes the private key as PKCS#8 DER. The document zeroizes on drop.
    pub(crate) fn export_pkcs8_der(&self) -> Result<SecretDocument> {
        let document = match self {
            KeyPair::Rsa { private, .. } => private.to_pkcs8_der(),
            KeyPair::EcdsaP256 { signing_key } => signing_key.to_pkcs8_der(),
            KeyPair::EcdsaP384 { signing_key } => signing_key.to_pkcs8_der(),
            KeyPair::Ed25519 { signing_key } => signing_key.to_pkcs8_der(),
        }?;
        Ok(document)
    }

    /// Decodes a PKCS#8 private key, picking the key type from its
    /// algorithm identifier.
    pub fn import_from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let info = pkcs8::PrivateKeyInfo::try_from(der)?;
        match info.algorithm.oid {
            const_oid::db::rfc5912::RSA_ENCRYPTION => {
                let private = RsaPrivateKey::from_pkcs8_der(der)?;
                let public = RsaPublicKey::from(&private);
                Ok(KeyPair::Rsa {
                    private: Box::new(private),
                    public,
                })
            }
            const_oid::db::rfc5912::ID_EC_PUBLIC_KEY => match info.algorithm.parameters_oid()? {
                const_oid::db::rfc5912::SECP_256_R_1 => Ok(KeyPair::EcdsaP256 {
                    signing_key: P256SigningKey::from_pkcs8_der(der)?,
                }),
                const_oid::db::rfc5912::SECP_384_R_1 => Ok(KeyPair::EcdsaP384 {
                    signing_key: P384SigningKey::from_pkcs8_der(der)?,
                }),
                other => Err(CaError::Crypto(format!("unsupported EC curve {other}"))),
            },
            const_oid::db::rfc8410::ID_ED_25519 => Ok(KeyPair::Ed25519 {
                signing_key: Ed25519SigningKey::from_pkcs8_der(der)?,
            }),
            other => Err(CaError::Crypto(format!(
                "unsupported private key algorithm {other}"
            ))),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            KeyPair::Rsa { public, .. } => match rsa::traits::PublicKeyParts::size(public) * 8 {
                bits if bits >= 4096 => KeyAlgorithm::Rsa4096,
                bits if bits >= 3072 => KeyAlgorithm::Rsa3072,
                _ => KeyAlgorithm::Rsa2048,
            },
            KeyPair::EcdsaP256 { .. } => KeyAlgorithm::EcdsaP256,
            KeyPair::EcdsaP384 { .. } => KeyAlgorithm::EcdsaP384,
            KeyPair::Ed25519 { .. } => KeyAlgorithm::Ed25519,
        }
    }

    /// The algorithm this key signs certificates and CRLs with.
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        match self {
            KeyPair::Rsa { .. } => SignatureAlgorithm::Sha256WithRSA,
            KeyPair::EcdsaP256 { .. } => SignatureAlgorithm::Sha256WithECDSA,
            KeyPair::EcdsaP384 { .. } => SignatureAlgorithm::Sha384WithECDSA,
            KeyPair::Ed25519 { .. } => SignatureAlgorithm::Ed25519,
        }
    }

    /// Signs `data` and returns the signature in the encoding X.509 expects
    /// (DER `Ecdsa-Sig-Value` for ECDSA, raw bytes for RSA and Ed25519).
    pub fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            KeyPair::Rsa { private, .. } => {
                let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new((**private).clone());
                let signature = signing_key
                    .try_sign(data)
                    .map_err(|e| CaError::Crypto(e.to_string()))?;
                Ok(signature.to_vec())
            }
            KeyPair::EcdsaP256 { signing_key } => {
                let signature: p256::ecdsa::Signature = signing_key
                    .try_sign(data)
                    .map_err(|e| CaError::Crypto(e.to_string()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            KeyPair::EcdsaP384 { signing_key } => {
                let signature: p384::ecdsa::Signature = signing_key
                    .try_sign(data)
                    .map_err(|e| CaError::Crypto(e.to_string()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            KeyPair::Ed25519 { signing_key } => {
                let signature: ed25519_dalek::Signature = signing_key
                    .try_sign(data)
                    .map_err(|e| CaError::Crypto(e.to_string()))?;
                Ok(signature.to_bytes().to_vec())
            }
        }
    }
}

/// Public half of a key pair, or a key extracted from a CSR or certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    EcdsaP256(P256VerifyingKey),
    EcdsaP384(P384VerifyingKey),
    Ed25519(Ed25519VerifyingKey),
}

impl PublicKey {
    pub fn from_key_pair(key_pair: &KeyPair) -> Self {
        match key_pair {
            KeyPair::Rsa { public, .. } => PublicKey::Rsa(public.clone()),
            KeyPair::EcdsaP256 { signing_key } => PublicKey::EcdsaP256(*signing_key.verifying_key()),
            KeyPair::EcdsaP384 { signing_key } => PublicKey::EcdsaP384(*signing_key.verifying_key()),
            KeyPair::Ed25519 { signing_key } => PublicKey::Ed25519(signing_key.verifying_key()),
        }
    }

    /// Reads a public key out of a `SubjectPublicKeyInfo`.
    pub fn from_x509spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        let key_bytes = spki.subject_public_key.raw_bytes();
        match spki.algorithm.oid {
            const_oid::db::rfc5912::RSA_ENCRYPTION => {
                Ok(PublicKey::Rsa(RsaPublicKey::from_pkcs1_der(key_bytes)?))
            }
            const_oid::db::rfc5912::ID_EC_PUBLIC_KEY => {
                let curve = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .and_then(|params| params.decode_as::<ObjectIdentifier>().ok())
                    .ok_or_else(|| CaError::Crypto("EC public key without named curve".into()))?;
                match curve {
                    const_oid::db::rfc5912::SECP_256_R_1 => P256VerifyingKey::from_sec1_bytes(key_bytes)
                        .map(PublicKey::EcdsaP256)
                        .map_err(|e| CaError::Crypto(e.to_string())),
                    const_oid::db::rfc5912::SECP_384_R_1 => P384VerifyingKey::from_sec1_bytes(key_bytes)
                        .map(PublicKey::EcdsaP384)
                        .map_err(|e| CaError::Crypto(e.to_string())),
                    other => Err(CaError::Crypto(format!("unsupported EC curve {other}"))),
                }
            }
            const_oid::db::rfc8410::ID_ED_25519 => {
                let bytes: [u8; 32] = key_bytes
                    .try_into()
                    .map_err(|_| CaError::Crypto("Ed25519 key must be 32 bytes".into()))?;
                Ed25519VerifyingKey::from_bytes(&bytes)
                    .map(PublicKey::Ed25519)
                    .map_err(|e| CaError::Crypto(e.to_string()))
            }
            other => Err(CaError::Crypto(format!(
                "unsupported public key algorithm {other}"
            ))),
        }
    }

    /// Encodes the key as a `SubjectPublicKeyInfo`.
    pub fn to_spki(&self) -> Result<SubjectPublicKeyInfoOwned> {
        let document = match self {
            PublicKey::Rsa(key) => key.to_public_key_der(),
            PublicKey::EcdsaP256(key) => key.to_public_key_der(),
            PublicKey::EcdsaP384(key) => key.to_public_key_der(),
            PublicKey::Ed25519(key) => key.to_public_key_der(),
        }?;
        Ok(SubjectPublicKeyInfoOwned::from_der(document.as_bytes())?)
    }

    /// RFC 5280 §4.2.1.2 method 1: SHA-1 over the subjectPublicKey bits.
    pub fn key_identifier(&self) -> Result<Vec<u8>> {
        let spki = self.to_spki()?;
        let digest = <Sha1 as sha1::Digest>::digest(spki.subject_public_key.raw_bytes());
        Ok(digest.to_vec())
    }

    /// Verifies `signature` over `message` with the algorithm named by `algorithm`.
    ///
    /// The algorithm must agree with the key type; a mismatch is reported as
    /// an error, not as a failed verification.
    pub fn verify(
        &self,
        algorithm: &AlgorithmIdentifierOwned,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        match (self, algorithm.oid) {
            (PublicKey::Rsa(key), const_oid::db::rfc5912::SHA_256_WITH_RSA_ENCRYPTION) => {
                let verifying_key = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                let Ok(signature) = rsa::pkcs1v15::Signature::try_from(signature) else {
                    return Ok(false);
                };
                Ok(verifying_key.verify(message, &signature).is_ok())
            }
            (PublicKey::EcdsaP256(key), const_oid::db::rfc5912::ECDSA_WITH_SHA_256) => {
                let Ok(signature) = p256::ecdsa::Signature::from_der(signature) else {
                    return Ok(false);
                };
                Ok(key.verify(message, &signature).is_ok())
            }
            (PublicKey::EcdsaP384(key), const_oid::db::rfc5912::ECDSA_WITH_SHA_384) => {
                let Ok(signature) = p384::ecdsa::Signature::from_der(signature) else {
                    return Ok(false);
                };
                Ok(key.verify(message, &signature).is_ok())
            }
            (PublicKey::Ed25519(key), const_oid::db::rfc8410::ID_ED_25519) => {
                let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
                    return Ok(false);
                };
                Ok(key.verify(message, &signature).is_ok())
            }
            (_, oid) => Err(CaError::Crypto(format!(
                "signature algorithm {oid} does not match the public key"
            ))),
        }
    }
}
