//! # pki-authority - A Certificate Authority Engine on the RustCrypto X.509 Stack
//!
//! pki-authority issues and tracks X.509 certificates for a multi-tenant
//! private PKI. It builds self-signed roots, intermediate CAs and CSR-based
//! end-entity certificates, keeps every certificate linked to its issuer,
//! answers chain validity questions, records revocations and signs per-issuer
//! CRLs. A small warp server exposes the same operations over REST.
//!
//! ## Supported Key Types
//!
//! CA keys are generated by the authority and never leave it unencrypted:
//! - **ECDSA**: P-256 (default) and P-384
//! - **Ed25519**
//! - **RSA**: 2048, 3072 and 4096-bit keys
//!
//! End-entity keys stay with the requester; only their CSR is submitted.
//!
//! ## Key Features
//!
//! - **Role-aware issuance**: ADMIN issues roots, ADMIN and CA issue
//!   intermediates, anyone may submit a CSR for an end-entity certificate
//! - **Chain integrity**: validity windows nest inside the issuer's window,
//!   `pathLenConstraint` is enforced, and a revoked ancestor invalidates
//!   every descendant without touching their records
//! - **Revocation and CRLs**: RFC 5280 reason codes, X.509 v2 CRLs with
//!   CRL number and authority key identifier
//! - **Templates**: regex-constrained subject policies bound to a CA
//! - **Persistence**: JSON-file stores and CA keys sealed with AES-256-GCM
//!   under a passphrase-derived key
//! - **Audit trail**: a hash-chained log of every issuance, revocation and
//!   template change, refused attempts included
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pki_authority::{
//!     authority::CertificateAuthority,
//!     cert::params::{DistinguishedName, Validity},
//!     config::AuthorityConfig,
//!     csr::create_csr_pem,
//!     key::KeyPair,
//!     model::{Actor, Role},
//! };
//!
//! # fn main() -> Result<(), pki_authority::error::CaError> {
//! let ca = CertificateAuthority::new(&AuthorityConfig::default());
//! let admin = Actor::new("admin", Role::Admin, Some("Example Corp"));
//!
//! let subject = DistinguishedName::builder()
//!     .common_name("Example Root CA".to_string())
//!     .organization("Example Corp".to_string())
//!     .country("US".to_string())
//!     .build();
//! let root = ca.issue_root(&admin, subject, Validity::for_days(3650)?, Default::default())?;
//!
//! // The requester keeps its key and submits only a CSR.
//! let server_key = KeyPair::generate_ecdsa_p256();
//! let server_subject = DistinguishedName::builder()
//!     .common_name("server.example.com".to_string())
//!     .organization("Example Corp".to_string())
//!     .country("US".to_string())
//!     .build();
//! let csr = create_csr_pem(&server_subject, &server_key, &["server.example.com".to_string()])?;
//!
//! let server = ca.issue_end_entity(&admin, root.id, &csr, Validity::for_days(90)?, Default::default(), None)?;
//! println!("issued {}", server.serial_number);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every operation returns [`error::CaError`]; the REST layer maps each
//! variant to an HTTP status.
//!
//! ```rust
//! use pki_authority::{error::CaError, csr::VerifiedCsr};
//!
//! match VerifiedCsr::from_pem("not a csr") {
//!     Ok(_) => println!("CSR accepted"),
//!     Err(CaError::InvalidCsr(msg)) => println!("Malformed CSR: {}", msg),
//!     Err(CaError::InvalidCsrSignature) => println!("CSR signature does not verify"),
//!     Err(e) => println!("Other error: {}", e),
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`authority`]: The facade tying issuance, chains, revocation and templates together
//! - [`issuer`]: Certificate signing and the issuance pipeline
//! - [`chain`]: Issuer eligibility, chain validity, visibility and chain trees
//! - [`revocation`] and [`crl`]: Revocation records and CRL signing
//! - [`template`]: Issuance templates
//! - [`keystore`] and [`key`]: CA key custody and key operations
//! - [`cert`], [`csr`], [`tbs_certificate`]: X.509 encoding
//! - [`store`] and [`model`]: Certificate and template records
//! - [`audit`]: The hash-chained audit log
//! - [`api`] and [`config`]: REST server and runtime settings

pub mod api;
pub mod audit;
pub mod authority;
pub mod cert;
pub mod chain;
pub mod config;
pub mod crl;
pub mod csr;
pub mod error;
pub mod issuer;
pub mod key;
pub mod keystore;
pub mod model;
pub mod pem_utils;
pub mod revocation;
pub mod store;
pub mod tbs_certificate;
pub mod template;
