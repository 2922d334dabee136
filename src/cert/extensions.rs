use std::fmt;
use std::str::FromStr;

use const_oid::AssociatedOid;
use der::{
    Decode, Encode,
    asn1::{Ia5String, OctetString},
    oid::ObjectIdentifier,
};
use serde::{Deserialize, Serialize};
use x509_cert::ext::pkix::name::GeneralName;

pub use der::flagset::FlagSet;
use x509_cert::ext::pkix::KeyUsage as X509KeyUsage;
pub use x509_cert::ext::pkix::KeyUsages;

use crate::error::{CaError, Result};

/// DER codec for one extension value, keyed by its OID.
///
/// Issued certificates and parsed records go through the same impls, so a
/// constraint written at issuance reads back identically:
///
/// ```
/// use pki_authority::cert::extensions::{BasicConstraints, ToAndFromX509Extension};
/// let issued = BasicConstraints::ca(Some(0));
/// let der = issued.to_x509_extension_value().unwrap();
/// let stored = BasicConstraints::from_x509_extension_value(&der).unwrap();
/// assert_eq!(stored.max_path_length, Some(0));
/// ```
pub trait ToAndFromX509Extension {
    /// The Object Identifier (OID) for the extension.
    const OID: ObjectIdentifier;

    /// Encodes the extension into a DER-encoded byte vector.
    fn to_x509_extension_value(&self) -> Result<Vec<u8>>;

    /// Decodes the extension from a DER-encoded byte slice.
    fn from_x509_extension_value(extension: &[u8]) -> Result<Self>
    where
        Self: Sized;
}

/// Represents the Subject Alternative Name (SAN) extension.
///
/// # Fields
/// * `names` - A list of DNS names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectAltName {
    pub names: Vec<String>,
}

impl ToAndFromX509Extension for SubjectAltName {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::SubjectAltName::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>> {
        let san = x509_cert::ext::pkix::SubjectAltName(
            self.names
                .iter()
                .map(|name| {
                    Ia5String::try_from(name.clone())
                        .map(GeneralName::DnsName)
                        .map_err(|e| CaError::validation("subjectAltName", e.to_string()))
                })
                .collect::<Result<Vec<_>>>()?,
        );

        Ok(san.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self> {
        let san = x509_cert::ext::pkix::SubjectAltName::from_der(extension)?;
        let names = san
            .0
            .iter()
            .filter_map(|name| match name {
                GeneralName::DnsName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect();
        Ok(Self { names })
    }
}

/// Represents the Basic Constraints extension.
///
/// # Fields
/// * `is_ca` - Indicates if the certificate is a CA.
/// * `max_path_length` - The maximum number of intermediate CAs allowed below this one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicConstraints {
    pub is_ca: bool,
    pub max_path_length: Option<u8>,
}

impl BasicConstraints {
    pub fn ca(max_path_length: Option<u8>) -> Self {
        Self {
            is_ca: true,
            max_path_length,
        }
    }

    pub fn end_entity() -> Self {
        Self {
            is_ca: false,
            max_path_length: None,
        }
    }
}

impl ToAndFromX509Extension for BasicConstraints {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::BasicConstraints::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>> {
        let bc = x509_cert::ext::pkix::BasicConstraints {
            ca: self.is_ca,
            path_len_constraint: self.max_path_length.filter(|_| self.is_ca),
        };

        Ok(bc.to_der()?)
    }

    fn from_x509_extension_value(der_bytes: &[u8]) -> Result<Self> {
        let bc = x509_cert::ext::pkix::BasicConstraints::from_der(der_bytes)?;
        Ok(Self {
            is_ca: bc.ca,
            max_path_length: bc.path_len_constraint,
        })
    }
}

/// Parses the OpenSSL-style strings the UI sends: `CA:TRUE`, `CA:FALSE`,
/// `CA:TRUE, pathlen:0`. Case and whitespace are ignored.
impl FromStr for BasicConstraints {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        let mut is_ca = None;
        let mut max_path_length = None;
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| CaError::validation("basicConstraints", format!("malformed token '{token}'")))?;
            match (key.trim().to_ascii_lowercase().as_str(), value.trim()) {
                ("ca", v) if v.eq_ignore_ascii_case("true") => is_ca = Some(true),
                ("ca", v) if v.eq_ignore_ascii_case("false") => is_ca = Some(false),
                ("pathlen", v) => {
                    let len = v.parse::<u8>().map_err(|_| {
                        CaError::validation("basicConstraints", format!("invalid pathlen '{v}'"))
                    })?;
                    max_path_length = Some(len);
                }
                _ => {
                    return Err(CaError::validation(
                        "basicConstraints",
                        format!("unknown token '{token}'"),
                    ));
                }
            }
        }
        let is_ca = is_ca.ok_or_else(|| CaError::validation("basicConstraints", "missing CA flag"))?;
        if !is_ca && max_path_length.is_some() {
            return Err(CaError::validation(
                "basicConstraints",
                "pathlen is only allowed with CA:TRUE",
            ));
        }
        Ok(Self {
            is_ca,
            max_path_length,
        })
    }
}

impl fmt::Display for BasicConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_ca, self.max_path_length) {
            (true, Some(len)) => write!(f, "CA:TRUE, pathlen:{len}"),
            (true, None) => f.write_str("CA:TRUE"),
            (false, _) => f.write_str("CA:FALSE"),
        }
    }
}

/// Key usage bits in RFC 5280 order, paired with their wire names.
///
/// Position `i` in the 9-element boolean vector the REST API exchanges is
/// `KEY_USAGE_BITS[i]`.
pub const KEY_USAGE_BITS: [(KeyUsages, &str); 9] = [
    (KeyUsages::DigitalSignature, "digitalSignature"),
    (KeyUsages::NonRepudiation, "nonRepudiation"),
    (KeyUsages::KeyEncipherment, "keyEncipherment"),
    (KeyUsages::DataEncipherment, "dataEncipherment"),
    (KeyUsages::KeyAgreement, "keyAgreement"),
    (KeyUsages::KeyCertSign, "keyCertSign"),
    (KeyUsages::CRLSign, "cRLSign"),
    (KeyUsages::EncipherOnly, "encipherOnly"),
    (KeyUsages::DecipherOnly, "decipherOnly"),
];

/// Represents the Key Usage extension as a named flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUsage(pub FlagSet<KeyUsages>);

impl Default for KeyUsage {
    fn default() -> Self {
        KeyUsage(FlagSet::default())
    }
}

impl KeyUsage {
    /// Builds the flag set from the positional boolean vector.
    ///
    /// Anything other than exactly nine entries is rejected instead of
    /// being padded or truncated.
    pub fn from_bits_vec(bits: &[bool]) -> Result<Self> {
        if bits.len() != KEY_USAGE_BITS.len() {
            return Err(CaError::validation(
                "keyUsage",
                format!("expected {} flags, got {}", KEY_USAGE_BITS.len(), bits.len()),
            ));
        }
        let mut flags = FlagSet::default();
        for ((flag, _), set) in KEY_USAGE_BITS.iter().zip(bits) {
            if *set {
                flags |= *flag;
            }
        }
        Ok(KeyUsage(flags))
    }

    /// Positional boolean vector in RFC 5280 bit order.
    pub fn to_bits_vec(&self) -> Vec<bool> {
        KEY_USAGE_BITS
            .iter()
            .map(|(flag, _)| self.0.contains(*flag))
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        KEY_USAGE_BITS
            .iter()
            .filter(|(flag, _)| self.0.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut flags = FlagSet::default();
        for name in names {
            let name = name.as_ref();
            let (flag, _) = KEY_USAGE_BITS
                .iter()
                .find(|(_, known)| *known == name)
                .ok_or_else(|| CaError::validation("keyUsage", format!("unknown usage '{name}'")))?;
            flags |= *flag;
        }
        Ok(KeyUsage(flags))
    }

    pub fn contains(&self, usage: KeyUsages) -> bool {
        self.0.contains(usage)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn with(mut self, usage: KeyUsages) -> Self {
        self.0 |= usage;
        self
    }

    pub fn without(mut self, usage: KeyUsages) -> Self {
        self.0 -= usage;
        self
    }
}

impl Serialize for KeyUsage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for KeyUsage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        KeyUsage::from_names(&names).map_err(serde::de::Error::custom)
    }
}

impl ToAndFromX509Extension for KeyUsage {
    const OID: ObjectIdentifier = <X509KeyUsage as AssociatedOid>::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>> {
        let ku = X509KeyUsage::from(self.0);
        Ok(ku.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self> {
        let ku = X509KeyUsage::from_der(extension)?;
        Ok(Self(ku.0))
    }
}

/// Represents the Extended Key Usage extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedKeyUsage {
    pub usage: Vec<ExtendedKeyUsageOption>,
}

impl ExtendedKeyUsage {
    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }
}

/// Parses `"serverAuth, clientAuth"` style lists; dotted OIDs are accepted
/// for purposes without a name. An empty string yields an empty set.
impl FromStr for ExtendedKeyUsage {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        let usage = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ExtendedKeyUsageOption::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { usage })
    }
}

impl fmt::Display for ExtendedKeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.usage.iter().map(ToString::to_string).collect();
        f.write_str(&names.join(", "))
    }
}

impl Serialize for ExtendedKeyUsage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExtendedKeyUsage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

impl ToAndFromX509Extension for ExtendedKeyUsage {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::ExtendedKeyUsage::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>> {
        let oids: Vec<ObjectIdentifier> = self.usage.iter().map(|v| (*v).into()).collect();
        let eku = x509_cert::ext::pkix::ExtendedKeyUsage(oids);
        Ok(eku.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self> {
        let eku = x509_cert::ext::pkix::ExtendedKeyUsage::from_der(extension)?;
        let usage = eku.0.iter().map(|v| ExtendedKeyUsageOption::from(*v)).collect();
        Ok(Self { usage })
    }
}

/// Represents an option for the Extended Key Usage extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKeyUsageOption {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
    Other(ObjectIdentifier),
}

impl From<ExtendedKeyUsageOption> for ObjectIdentifier {
    fn from(value: ExtendedKeyUsageOption) -> Self {
        match value {
            ExtendedKeyUsageOption::OcspSigning => const_oid::db::rfc5912::ID_KP_OCSP_SIGNING,
            ExtendedKeyUsageOption::ServerAuth => const_oid::db::rfc5912::ID_KP_SERVER_AUTH,
            ExtendedKeyUsageOption::ClientAuth => const_oid::db::rfc5912::ID_KP_CLIENT_AUTH,
            ExtendedKeyUsageOption::CodeSigning => const_oid::db::rfc5912::ID_KP_CODE_SIGNING,
            ExtendedKeyUsageOption::EmailProtection => {
                const_oid::db::rfc5912::ID_KP_EMAIL_PROTECTION
            }
            ExtendedKeyUsageOption::TimeStamping => const_oid::db::rfc5912::ID_KP_TIME_STAMPING,
            ExtendedKeyUsageOption::Other(oid) => oid,
        }
    }
}

impl From<ObjectIdentifier> for ExtendedKeyUsageOption {
    fn from(value: ObjectIdentifier) -> Self {
        match value {
            const_oid::db::rfc5912::ID_KP_OCSP_SIGNING => ExtendedKeyUsageOption::OcspSigning,
            const_oid::db::rfc5912::ID_KP_SERVER_AUTH => ExtendedKeyUsageOption::ServerAuth,
            const_oid::db::rfc5912::ID_KP_CLIENT_AUTH => ExtendedKeyUsageOption::ClientAuth,
            const_oid::db::rfc5912::ID_KP_CODE_SIGNING => ExtendedKeyUsageOption::CodeSigning,
            const_oid::db::rfc5912::ID_KP_EMAIL_PROTECTION => {
                ExtendedKeyUsageOption::EmailProtection
            }
            const_oid::db::rfc5912::ID_KP_TIME_STAMPING => ExtendedKeyUsageOption::TimeStamping,
            other => ExtendedKeyUsageOption::Other(other),
        }
    }
}

impl FromStr for ExtendedKeyUsageOption {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "serverAuth" => Ok(ExtendedKeyUsageOption::ServerAuth),
            "clientAuth" => Ok(ExtendedKeyUsageOption::ClientAuth),
            "codeSigning" => Ok(ExtendedKeyUsageOption::CodeSigning),
            "emailProtection" => Ok(ExtendedKeyUsageOption::EmailProtection),
            "timeStamping" => Ok(ExtendedKeyUsageOption::TimeStamping),
            "OCSPSigning" | "ocspSigning" => Ok(ExtendedKeyUsageOption::OcspSigning),
            other => ObjectIdentifier::new(other)
                .map(ExtendedKeyUsageOption::from)
                .map_err(|_| {
                    CaError::validation("extendedKeyUsage", format!("unknown purpose '{other}'"))
                }),
        }
    }
}

impl fmt::Display for ExtendedKeyUsageOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtendedKeyUsageOption::ServerAuth => f.write_str("serverAuth"),
            ExtendedKeyUsageOption::ClientAuth => f.write_str("clientAuth"),
            ExtendedKeyUsageOption::CodeSigning => f.write_str("codeSigning"),
            ExtendedKeyUsageOption::EmailProtection => f.write_str("emailProtection"),
            ExtendedKeyUsageOption::TimeStamping => f.write_str("timeStamping"),
            ExtendedKeyUsageOption::OcspSigning => f.write_str("OCSPSigning"),
            ExtendedKeyUsageOption::Other(oid) => write!(f, "{oid}"),
        }
    }
}

/// Represents the Subject Key Identifier extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectKeyIdentifier(pub Vec<u8>);

impl ToAndFromX509Extension for SubjectKeyIdentifier {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::SubjectKeyIdentifier::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>> {
        let ski = x509_cert::ext::pkix::SubjectKeyIdentifier(OctetString::new(self.0.as_slice())?);
        Ok(ski.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self> {
        let ski = x509_cert::ext::pkix::SubjectKeyIdentifier::from_der(extension)?;
        Ok(Self(ski.0.as_bytes().to_vec()))
    }
}

/// Represents the Authority Key Identifier (AKI) extension.
///
/// Only the key identifier form is emitted; it is what path builders match
/// against the issuer's subject key identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityKeyIdentifier {
    pub key_identifier: Vec<u8>,
}

impl ToAndFromX509Extension for AuthorityKeyIdentifier {
    const OID: ObjectIdentifier = x509_cert::ext::pkix::AuthorityKeyIdentifier::OID;

    fn to_x509_extension_value(&self) -> Result<Vec<u8>> {
        let aki = x509_cert::ext::pkix::AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(self.key_identifier.as_slice())?),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        };

        Ok(aki.to_der()?)
    }

    fn from_x509_extension_value(extension: &[u8]) -> Result<Self> {
        let aki = x509_cert::ext::pkix::AuthorityKeyIdentifier::from_der(extension)?;
        Ok(Self {
            key_identifier: aki
                .key_identifier
                .map(|id| id.as_bytes().to_vec())
                .unwrap_or_default(),
        })
    }
}
