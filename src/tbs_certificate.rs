use der::asn1::{GeneralizedTime, OctetString, UtcTime};
use time::OffsetDateTime;
use x509_cert::Version;
use x509_cert::certificate::TbsCertificateInner;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Time;

use crate::cert::SignatureAlgorithm;
use crate::cert::params::{DistinguishedName, ExtensionParam, Validity};
use crate::error::{CaError, Result};
use crate::key::PublicKey;

/// First instant that must be encoded as GeneralizedTime (RFC 5280 §4.1.2.5).
const UTC_TIME_LIMIT: i64 = 2_524_608_000; // 2050-01-01T00:00:00Z

/// Represents the "To Be Signed" (TBS) portion of an X.509 certificate.
/// This struct contains all the fields required to generate a valid X.509 certificate.
///
/// # Fields
/// * `serial_number` - The unique identifier for the certificate, big-endian and positive.
/// * `signature_algorithm` - The algorithm the issuer signs with.
/// * `issuer` - The distinguished name of the certificate issuer.
/// * `validity` - The certificate's validity period.
/// * `subject` - The distinguished name of the certificate subject.
/// * `subject_public_key` - The public key of the certificate subject.
/// * `extensions` - X.509 extensions for the certificate.
pub struct TbsCertificate {
    pub serial_number: Vec<u8>,
    pub signature_algorithm: SignatureAlgorithm,
    pub issuer: DistinguishedName,
    pub validity: Validity,
    pub subject: DistinguishedName,
    pub subject_public_key: PublicKey,
    pub extensions: Vec<ExtensionParam>,
}

impl TbsCertificate {
    /// Converts the `TbsCertificate` into a `TbsCertificateInner` for DER encoding.
    ///
    /// # Returns
    /// A `TbsCertificateInner` object suitable for DER encoding.
    pub fn to_tbs_certificate_inner(&self) -> Result<TbsCertificateInner> {
        let extensions = self
            .extensions
            .iter()
            .map(|ext| {
                Ok(x509_cert::ext::Extension {
                    extn_id: ext.oid,
                    critical: ext.critical,
                    extn_value: OctetString::new(ext.value.clone())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let validity = x509_cert::time::Validity {
            not_before: to_x509_time(self.validity.not_before)?,
            not_after: to_x509_time(self.validity.not_after)?,
        };

        Ok(TbsCertificateInner {
            version: Version::V3,
            serial_number: SerialNumber::new(self.serial_number.as_slice())?,
            signature: self.signature_algorithm.into(),
            issuer: self.issuer.as_x509_name()?,
            validity,
            subject: self.subject.as_x509_name()?,
            subject_public_key_info: self.subject_public_key.to_spki()?,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: (!extensions.is_empty()).then_some(extensions),
        })
    }
}

/// Encodes an instant as UTCTime before 2050 and GeneralizedTime from then on.
pub fn to_x509_time(instant: OffsetDateTime) -> Result<Time> {
    if instant.unix_timestamp() < 0 {
        return Err(CaError::validation(
            "validity",
            "dates before 1970 are not supported",
        ));
    }
    let system_time: std::time::SystemTime = instant.into();
    if instant.unix_timestamp() < UTC_TIME_LIMIT {
        Ok(Time::UtcTime(UtcTime::from_system_time(system_time)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_system_time(system_time)?))
    }
}

pub fn from_x509_time(time: &Time) -> OffsetDateTime {
    match time {
        Time::UtcTime(ut) => OffsetDateTime::from(ut.to_system_time()),
        Time::GeneralTime(gt) => OffsetDateTime::from(gt.to_system_time()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_time_encoding_switches_at_2050() {
        let before = datetime!(2049-12-31 23:59:59 UTC);
        let after = datetime!(2050-01-01 00:00:00 UTC);
        assert!(matches!(to_x509_time(before).unwrap(), Time::UtcTime(_)));
        assert!(matches!(to_x509_time(after).unwrap(), Time::GeneralTime(_)));
        assert_eq!(from_x509_time(&to_x509_time(after).unwrap()), after);
    }
}
