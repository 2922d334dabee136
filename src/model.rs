//! Records the authority persists, and the actor performing an operation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cert::extensions::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use crate::cert::params::{DistinguishedName, Validity};
use crate::error::{CaError, Result};
use crate::template::TemplateId;

/// Store-assigned certificate identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateId(pub u64);

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateType {
    Root,
    Intermediate,
    EndEntity,
}

impl CertificateType {
    pub fn is_ca(self) -> bool {
        matches!(self, CertificateType::Root | CertificateType::Intermediate)
    }
}

/// Status as reported to callers. `Expired` is computed on read and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateStatus {
    Valid,
    Revoked,
    Expired,
}

/// RFC 5280 §5.3.1 reason codes accepted when revoking.
///
/// `removeFromCRL` (8) and `aACompromise` (10) exist in the ASN.1 enumeration
/// but are not valid revocation inputs here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationReason {
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "keyCompromise")]
    KeyCompromise,
    #[serde(rename = "cACompromise")]
    CaCompromise,
    #[serde(rename = "affiliationChanged")]
    AffiliationChanged,
    #[serde(rename = "superseded")]
    Superseded,
    #[serde(rename = "cessationOfOperation")]
    CessationOfOperation,
    #[serde(rename = "certificateHold")]
    CertificateHold,
    #[serde(rename = "privilegeWithdrawn")]
    PrivilegeWithdrawn,
}

impl RevocationReason {
    pub const ALL: [RevocationReason; 8] = [
        RevocationReason::Unspecified,
        RevocationReason::KeyCompromise,
        RevocationReason::CaCompromise,
        RevocationReason::AffiliationChanged,
        RevocationReason::Superseded,
        RevocationReason::CessationOfOperation,
        RevocationReason::CertificateHold,
        RevocationReason::PrivilegeWithdrawn,
    ];

    /// The CRLReason enumeration value.
    pub fn code(self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
            RevocationReason::PrivilegeWithdrawn => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "keyCompromise",
            RevocationReason::CaCompromise => "cACompromise",
            RevocationReason::AffiliationChanged => "affiliationChanged",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessationOfOperation",
            RevocationReason::CertificateHold => "certificateHold",
            RevocationReason::PrivilegeWithdrawn => "privilegeWithdrawn",
        }
    }
}

/// Accepts the RFC 5280 camelCase names as well as the upper snake case
/// spelling (`KEY_COMPROMISE`) some clients send.
impl FromStr for RevocationReason {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        RevocationReason::ALL
            .into_iter()
            .find(|reason| reason.as_str().to_ascii_lowercase() == folded)
            .ok_or_else(|| CaError::validation("reason", format!("unknown revocation reason '{s}'")))
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationRecord {
    pub reason: RevocationReason,
    #[serde(with = "time::serde::rfc3339")]
    pub revoked_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Ca,
    Basic,
}

impl FromStr for Role {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().trim_start_matches("ROLE_") {
            "ADMIN" => Ok(Role::Admin),
            "CA" => Ok(Role::Ca),
            "BASIC" => Ok(Role::Basic),
            other => Err(CaError::validation("role", format!("unknown role '{other}'"))),
        }
    }
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub role: Role,
    pub organization: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role, organization: Option<&str>) -> Self {
        Self {
            id: id.into(),
            role,
            organization: organization.map(str::to_string),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Who created a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub id: String,
    pub organization: Option<String>,
}

impl From<&Actor> for Owner {
    fn from(actor: &Actor) -> Self {
        Self {
            id: actor.id.clone(),
            organization: actor.organization.clone(),
        }
    }
}

/// A stored certificate together with the fields the authority indexes on.
///
/// Everything except `revocation` is fixed at issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub id: CertificateId,
    /// Uppercase hex, no separators.
    pub serial_number: String,
    pub certificate_type: CertificateType,
    pub subject: DistinguishedName,
    pub issuer_dn: DistinguishedName,
    pub issuer_id: Option<CertificateId>,
    pub validity: Validity,
    pub basic_constraints: BasicConstraints,
    pub key_usage: KeyUsage,
    pub extended_key_usage: ExtendedKeyUsage,
    pub subject_alt_names: Vec<String>,
    pub revocation: Option<RevocationRecord>,
    pub owner: Owner,
    pub template_id: Option<TemplateId>,
    #[serde(rename = "certificatePem", with = "crate::pem_utils::certificate_pem")]
    pub der: Vec<u8>,
}

impl CertificateRecord {
    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.validity.not_after
    }

    /// Revocation wins over expiry.
    pub fn status_at(&self, now: OffsetDateTime) -> CertificateStatus {
        if self.is_revoked() {
            CertificateStatus::Revoked
        } else if self.is_expired_at(now) {
            CertificateStatus::Expired
        } else {
            CertificateStatus::Valid
        }
    }

    /// VALID and inside the validity window; says nothing about ancestors.
    pub fn is_usable_at(&self, now: OffsetDateTime) -> bool {
        !self.is_revoked() && self.validity.is_current_at(now)
    }

    pub fn can_sign_certificates(&self) -> bool {
        self.certificate_type.is_ca() && self.basic_constraints.is_ca
    }

    pub fn summary(&self, now: OffsetDateTime) -> CertificateSummary {
        CertificateSummary {
            id: self.id,
            serial_number: self.serial_number.clone(),
            certificate_type: self.certificate_type,
            subject: self.subject.clone(),
            subject_dn: self.subject.to_string(),
            issuer: self.issuer_dn.to_string(),
            issuer_certificate_id: self.issuer_id,
            valid_from: self.validity.not_before,
            valid_to: self.validity.not_after,
            status: self.status_at(now),
            revocation_reason: self.revocation.map(|r| r.reason),
            revoked_at: self.revocation.map(|r| r.revoked_at),
            basic_constraints: self.basic_constraints.to_string(),
            key_usage: self.key_usage.to_bits_vec(),
            extended_key_usage: self.extended_key_usage.to_string(),
            subject_alt_names: self.subject_alt_names.clone(),
            owner_id: self.owner.id.clone(),
            template_id: self.template_id,
        }
    }
}

/// Read model returned by list and lookup operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSummary {
    pub id: CertificateId,
    pub serial_number: String,
    #[serde(rename = "type")]
    pub certificate_type: CertificateType,
    pub subject: DistinguishedName,
    pub subject_dn: String,
    pub issuer: String,
    pub issuer_certificate_id: Option<CertificateId>,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_to: OffsetDateTime,
    pub status: CertificateStatus,
    pub revocation_reason: Option<RevocationReason>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    pub basic_constraints: String,
    pub key_usage: Vec<bool>,
    pub extended_key_usage: String,
    pub subject_alt_names: Vec<String>,
    pub owner_id: String,
    pub template_id: Option<TemplateId>,
}
