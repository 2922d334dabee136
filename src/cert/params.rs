use std::fmt;

use bon::Builder;
use const_oid::ObjectIdentifier;
use der::asn1::{Any, Ia5StringRef, PrintableStringRef, SetOfVec, Utf8StringRef};
use der::{Tag, Tagged};
use serde::{Deserialize, Serialize};
use time::Duration;
use time::OffsetDateTime;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::name::{RdnSequence, RelativeDistinguishedName};

use super::extensions::{BasicConstraints, ExtendedKeyUsage, KeyUsage, ToAndFromX509Extension};
use crate::error::{CaError, Result};
use crate::key::PublicKey;

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
const OID_STATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_ORGANIZATION_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
const OID_EMAIL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.1");

/// Parameters for building an X.509 certificate.
///
/// Carries everything about the subject that ends up in the TBS structure
/// apart from the issuer, serial number and validity window.
///
/// # Fields
/// * `subject` - The distinguished name of the certificate subject.
/// * `subject_public_key` - The public key of the certificate subject.
/// * `basic_constraints` - CA flag and optional path length.
/// * `key_usage` - Key usage flags; empty means the extension is omitted.
/// * `extended_key_usage` - Extended key usage purposes.
/// * `subject_alt_names` - DNS names for the subjectAltName extension.
/// * `extensions` - Additional raw X.509 extensions.
#[derive(Clone, Debug, Builder)]
pub struct CertificationRequestInfo {
    pub subject: DistinguishedName,
    pub subject_public_key: PublicKey,
    #[builder(default)]
    pub basic_constraints: BasicConstraints,
    #[builder(default)]
    pub key_usage: KeyUsage,
    #[builder(default)]
    pub extended_key_usage: ExtendedKeyUsage,
    #[builder(default)]
    pub subject_alt_names: Vec<String>,
    #[builder(default)]
    pub extensions: Vec<ExtensionParam>,
}

/// Distinguished name of a certificate subject or issuer.
///
/// # Fields
/// * `common_name` - The common name (CN).
/// * `organization` - The organization (O).
/// * `organization_unit` - The organizational unit (OU).
/// * `country` - The two-letter country code (C).
/// * `state` - The state or province (ST).
/// * `locality` - The locality or city (L).
/// * `email` - The PKCS#9 email address attribute.
#[derive(Clone, Debug, Builder, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistinguishedName {
    pub common_name: String,
    pub organization: Option<String>,
    pub organization_unit: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub email: Option<String>,
}

impl DistinguishedName {
    /// Checks the attributes every issued subject must carry: CN, O and a
    /// two-letter C. Optional attributes, when given, must not be blank.
    pub fn validate(&self) -> Result<()> {
        if self.common_name.trim().is_empty() {
            return Err(CaError::validation("subject.commonName", "is required"));
        }
        match self.organization.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(CaError::validation("subject.organization", "is required"));
            }
            Some(_) => {}
        }
        match self.country.as_deref() {
            Some(c) if c.len() == 2 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => {}
            Some(_) => {
                return Err(CaError::validation(
                    "subject.country",
                    "must be exactly two letters",
                ));
            }
            None => return Err(CaError::validation("subject.country", "is required")),
        }
        for (field, value) in [
            ("subject.organizationUnit", &self.organization_unit),
            ("subject.state", &self.state),
            ("subject.locality", &self.locality),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(CaError::validation(field, "must not be blank"));
            }
        }
        if let Some(email) = &self.email {
            if !email.contains('@') || !email.is_ascii() {
                return Err(CaError::validation("subject.email", "is not an email address"));
            }
        }
        Ok(())
    }

    /// Drops optional attributes that are present but blank.
    pub fn normalized(mut self) -> Self {
        for value in [
            &mut self.organization,
            &mut self.organization_unit,
            &mut self.country,
            &mut self.state,
            &mut self.locality,
            &mut self.email,
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }
        self
    }

    /// Converts the distinguished name to an X.509 `Name`.
    ///
    /// Attributes are emitted in the order C, ST, L, O, OU, CN, email;
    /// absent attributes are skipped rather than encoded empty.
    pub fn as_x509_name(&self) -> Result<x509_cert::name::DistinguishedName> {
        let mut rdns = Vec::new();
        if let Some(country) = &self.country {
            rdns.push(rdn(OID_COUNTRY, Any::encode_from(&PrintableStringRef::new(country)?)?)?);
        }
        for (oid, value) in [
            (OID_STATE, &self.state),
            (OID_LOCALITY, &self.locality),
            (OID_ORGANIZATION, &self.organization),
            (OID_ORGANIZATION_UNIT, &self.organization_unit),
        ] {
            if let Some(value) = value {
                rdns.push(rdn(oid, Any::encode_from(&Utf8StringRef::new(value)?)?)?);
            }
        }
        rdns.push(rdn(
            OID_COMMON_NAME,
            Any::encode_from(&Utf8StringRef::new(&self.common_name)?)?,
        )?);
        if let Some(email) = &self.email {
            rdns.push(rdn(OID_EMAIL, Any::encode_from(&Ia5StringRef::new(email)?)?)?);
        }
        Ok(RdnSequence(rdns))
    }

    /// Creates a `DistinguishedName` from an X.509 `Name`.
    ///
    /// Unknown attribute types and values that are not directory strings
    /// are ignored.
    pub fn from_x509_name(x509dn: &x509_cert::name::DistinguishedName) -> Self {
        let mut dn = DistinguishedName::default();
        for rdn in x509dn.0.iter() {
            for attr in rdn.0.iter() {
                let Some(value) = directory_string(&attr.value) else {
                    continue;
                };
                match attr.oid {
                    OID_COMMON_NAME => dn.common_name = value,
                    OID_COUNTRY => dn.country = Some(value),
                    OID_STATE => dn.state = Some(value),
                    OID_LOCALITY => dn.locality = Some(value),
                    OID_ORGANIZATION => dn.organization = Some(value),
                    OID_ORGANIZATION_UNIT => dn.organization_unit = Some(value),
                    OID_EMAIL => dn.email = Some(value),
                    _ => {}
                }
            }
        }
        dn
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN={}", self.common_name)?;
        for (label, value) in [
            ("O", &self.organization),
            ("OU", &self.organization_unit),
            ("C", &self.country),
            ("ST", &self.state),
            ("L", &self.locality),
            ("E", &self.email),
        ] {
            if let Some(value) = value {
                write!(f, ", {label}={value}")?;
            }
        }
        Ok(())
    }
}

fn rdn(oid: ObjectIdentifier, value: Any) -> Result<RelativeDistinguishedName> {
    let set = SetOfVec::try_from(vec![AttributeTypeAndValue { oid, value }])?;
    Ok(RelativeDistinguishedName(set))
}

fn directory_string(value: &Any) -> Option<String> {
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String | Tag::TeletexString => {
            std::str::from_utf8(value.value()).ok().map(str::to_string)
        }
        _ => None,
    }
}

/// Longest lifetime, in days, any validity window may span.
pub const MAX_VALIDITY_DAYS: u32 = 36_500;

/// Certificate validity period.
///
/// This struct represents the `notBefore` and `notAfter` fields in a certificate.
///
/// # Fields
/// * `not_before` - The start of the validity period.
/// * `not_after` - The end of the validity period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validity {
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
}

impl Validity {
    /// Creates a validity period starting now for the given number of days.
    ///
    /// # Arguments
    /// * `days` - The number of days for the validity period.
    pub fn for_days(days: i64) -> Result<Self> {
        Self::starting_at(OffsetDateTime::now_utc(), days)
    }

    /// Fails when `days` exceeds [`MAX_VALIDITY_DAYS`] in either direction
    /// or the end falls outside the representable date range.
    pub fn starting_at(not_before: OffsetDateTime, days: i64) -> Result<Self> {
        if days.unsigned_abs() > u64::from(MAX_VALIDITY_DAYS) {
            return Err(CaError::validation(
                "validity",
                format!("must not exceed {MAX_VALIDITY_DAYS} days"),
            ));
        }
        // X.509 times carry whole seconds only.
        let not_before = not_before.replace_nanosecond(0).unwrap_or(not_before);
        let not_after = not_before
            .checked_add(Duration::days(days))
            .ok_or_else(|| CaError::validation("validity", "end date is out of range"))?;
        Ok(Self {
            not_before,
            not_after,
        })
    }

    /// Rejects empty or inverted windows.
    pub fn validate(&self) -> Result<()> {
        if self.not_after <= self.not_before {
            return Err(CaError::validation(
                "validity",
                "validTo must be after validFrom",
            ));
        }
        Ok(())
    }

    /// Length of the window.
    pub fn duration(&self) -> Duration {
        self.not_after - self.not_before
    }

    /// Whether `other` lies entirely inside this window.
    pub fn contains(&self, other: &Validity) -> bool {
        other.not_before >= self.not_before && other.not_after <= self.not_after
    }

    pub fn is_current_at(&self, instant: OffsetDateTime) -> bool {
        self.not_before <= instant && instant <= self.not_after
    }
}

/// Represents an X.509 extension.
///
/// This struct contains the OID, criticality, and value of an extension.
///
/// # Fields
/// * `oid` - The object identifier of the extension.
/// * `critical` - Indicates if the extension is critical.
/// * `value` - The DER-encoded value of the extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionParam {
    pub oid: ObjectIdentifier,
    pub critical: bool,
    /// DER-encoded extension value
    pub value: Vec<u8>,
}

impl ExtensionParam {
    /// Creates an `ExtensionParam` from a specific extension.
    pub fn from_extension<E: ToAndFromX509Extension>(extension: &E, critical: bool) -> Result<Self> {
        Ok(Self {
            oid: E::OID,
            critical,
            value: extension.to_x509_extension_value()?,
        })
    }

    /// Decodes an `ExtensionParam` into a specific extension.
    pub fn to_extension<E: ToAndFromX509Extension>(&self) -> Result<E> {
        E::from_x509_extension_value(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> DistinguishedName {
        DistinguishedName::builder()
            .common_name("Example Root".to_string())
            .organization("Example, Inc.".to_string())
            .country("RS".to_string())
            .email("pki@example.com".to_string())
            .build()
    }

    #[test]
    fn test_distinguished_name_x509_conversion() {
        let dn = subject();
        let name = dn.as_x509_name().unwrap();
        assert_eq!(DistinguishedName::from_x509_name(&name), dn);
    }

    #[test]
    fn test_distinguished_name_validation() {
        assert!(subject().validate().is_ok());

        let mut missing_org = subject();
        missing_org.organization = None;
        assert!(matches!(
            missing_org.validate(),
            Err(CaError::Validation { field, .. }) if field == "subject.organization"
        ));

        let mut long_country = subject();
        long_country.country = Some("SRB".to_string());
        assert!(long_country.validate().is_err());

        let mut digit_country = subject();
        digit_country.country = Some("R5".to_string());
        assert!(digit_country.validate().is_err());
    }

    #[test]
    fn test_display_lists_present_attributes() {
        assert_eq!(
            subject().to_string(),
            "CN=Example Root, O=Example, Inc., C=RS, E=pki@example.com"
        );
    }

    #[test]
    fn test_validity_window_checks() {
        let outer = Validity::for_days(365).unwrap();
        let inner = Validity {
            not_before: outer.not_before + Duration::days(1),
            not_after: outer.not_after - Duration::days(1),
        };
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(inner.validate().is_ok());

        let inverted = Validity {
            not_before: outer.not_after,
            not_after: outer.not_before,
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        for days in [i64::from(MAX_VALIDITY_DAYS) + 1, i64::MAX, i64::MIN] {
            assert!(matches!(
                Validity::for_days(days),
                Err(CaError::Validation { field, .. }) if field == "validity"
            ));
        }
        let late = OffsetDateTime::new_utc(
            time::Date::from_calendar_date(9990, time::Month::January, 1).unwrap(),
            time::Time::MIDNIGHT,
        );
        assert!(Validity::starting_at(late, 36_000).is_err());
        assert_eq!(
            Validity::for_days(i64::from(MAX_VALIDITY_DAYS)).unwrap().duration(),
            Duration::days(i64::from(MAX_VALIDITY_DAYS))
        );
    }
}
