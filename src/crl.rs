//! X.509 v2 certificate revocation lists (RFC 5280 §5).

use const_oid::{AssociatedOid, ObjectIdentifier};
use der::asn1::{BitString, OctetString};
use der::{Decode, Encode};
use time::OffsetDateTime;
use x509_cert::Version;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::Extension;
use x509_cert::ext::pkix::CrlReason;
use x509_cert::serial_number::SerialNumber;

use crate::cert::extensions::{AuthorityKeyIdentifier, ToAndFromX509Extension};
use crate::cert::hex_decode;
use crate::cert::params::DistinguishedName;
use crate::error::{CaError, Result};
use crate::key::{KeyPair, PublicKey};
use crate::model::RevocationReason;
use crate::pem_utils::{CRL_LABEL, der_to_pem};
use crate::tbs_certificate::to_x509_time;

const OID_CRL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.20");

/// One revoked certificate as listed in a CRL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrlEntry {
    pub serial_number: String,
    pub revoked_at: OffsetDateTime,
    pub reason: RevocationReason,
}

/// A signed CRL plus the values it was built from.
#[derive(Debug, Clone)]
pub struct Crl {
    pub inner: CertificateList,
    pub number: u64,
    pub this_update: OffsetDateTime,
    pub next_update: OffsetDateTime,
    pub entries: Vec<CrlEntry>,
}

impl Crl {
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.inner.to_der()?)
    }

    pub fn to_pem(&self) -> Result<String> {
        Ok(der_to_pem(&self.to_der()?, CRL_LABEL))
    }

    /// Checks the CRL signature against the issuer's public key.
    pub fn verify_signed_by(&self, issuer_key: &PublicKey) -> Result<bool> {
        let tbs = self.inner.tbs_cert_list.to_der()?;
        let signature = self
            .inner
            .signature
            .as_bytes()
            .ok_or_else(|| CaError::Encoding("signature has unused bits".into()))?;
        issuer_key.verify(&self.inner.signature_algorithm, &tbs, signature)
    }

    /// Parses a DER CRL; `entries` and `number` are not recovered.
    pub fn decode_list(der: &[u8]) -> Result<CertificateList> {
        Ok(CertificateList::from_der(der)?)
    }
}

fn crl_reason(reason: RevocationReason) -> CrlReason {
    match reason {
        RevocationReason::Unspecified => CrlReason::Unspecified,
        RevocationReason::KeyCompromise => CrlReason::KeyCompromise,
        RevocationReason::CaCompromise => CrlReason::CaCompromise,
        RevocationReason::AffiliationChanged => CrlReason::AffiliationChanged,
        RevocationReason::Superseded => CrlReason::Superseded,
        RevocationReason::CessationOfOperation => CrlReason::CessationOfOperation,
        RevocationReason::CertificateHold => CrlReason::CertificateHold,
        RevocationReason::PrivilegeWithdrawn => CrlReason::PrivilegeWithdrawn,
    }
}

fn extension(extn_id: ObjectIdentifier, value: Vec<u8>) -> Result<Extension> {
    Ok(Extension {
        extn_id,
        critical: false,
        extn_value: OctetString::new(value)?,
    })
}

/// Builds and signs a CRL with `key`, the private key of the issuer named
/// `issuer`. Entries are written in the order given.
pub fn build_crl(
    issuer: &DistinguishedName,
    key: &KeyPair,
    number: u64,
    this_update: OffsetDateTime,
    next_update: OffsetDateTime,
    entries: &[CrlEntry],
) -> Result<Crl> {
    let revoked: Vec<RevokedCert> = entries
        .iter()
        .map(|entry| {
            let serial = hex_decode(&entry.serial_number)?;
            Ok(RevokedCert {
                serial_number: SerialNumber::new(&serial)?,
                revocation_date: to_x509_time(entry.revoked_at)?,
                crl_entry_extensions: Some(vec![extension(
                    CrlReason::OID,
                    crl_reason(entry.reason).to_der()?,
                )?]),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let authority_key_id = AuthorityKeyIdentifier {
        key_identifier: PublicKey::from_key_pair(key).key_identifier()?,
    };
    let crl_extensions = vec![
        extension(
            AuthorityKeyIdentifier::OID,
            authority_key_id.to_x509_extension_value()?,
        )?,
        extension(OID_CRL_NUMBER, number.to_der()?)?,
    ];

    let tbs_cert_list: TbsCertList = TbsCertList {
        version: Version::V2,
        signature: key.signature_algorithm().into(),
        issuer: issuer.as_x509_name()?,
        this_update: to_x509_time(this_update)?,
        next_update: Some(to_x509_time(next_update)?),
        revoked_certificates: (!revoked.is_empty()).then_some(revoked),
        crl_extensions: Some(crl_extensions),
    };

    let signature = key.sign_data(&tbs_cert_list.to_der()?)?;
    let inner: CertificateList = CertificateList {
        signature_algorithm: tbs_cert_list.signature.clone(),
        tbs_cert_list,
        signature: BitString::from_bytes(&signature)?,
    };

    Ok(Crl {
        inner,
        number,
        this_update,
        next_update,
        entries: entries.to_vec(),
    })
}
