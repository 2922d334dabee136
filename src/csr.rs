//! PKCS#10 certificate signing requests.

use const_oid::AssociatedOid;
use der::asn1::{BitString, SetOfVec};
use der::{Any, Decode, Encode};
use tracing::debug;
use x509_cert::attr::Attribute;
use x509_cert::ext::Extension;
use x509_cert::request::{CertReq, CertReqInfo, ExtensionReq, Version};

use crate::cert::extensions::{SubjectAltName, ToAndFromX509Extension};
use crate::cert::params::DistinguishedName;
use crate::error::{CaError, Result};
use crate::key::{KeyPair, PublicKey};
use crate::pem_utils::{CSR_LABELS, der_to_pem, pem_to_der};

/// A CSR whose self-signature has been checked.
///
/// The only way to obtain one is [`VerifiedCsr::from_pem`] or
/// [`VerifiedCsr::from_der`], so holding one means the embedded public key
/// belongs to whoever signed the request.
#[derive(Debug, Clone)]
pub struct VerifiedCsr {
    pub subject: DistinguishedName,
    pub public_key: PublicKey,
    /// DNS names from a subjectAltName in the extensionRequest attribute.
    pub subject_alt_names: Vec<String>,
}

impl VerifiedCsr {
    pub fn from_pem(csr_pem: &str) -> Result<Self> {
        let der = pem_to_der(csr_pem, &CSR_LABELS).map_err(|e| CaError::InvalidCsr(e.to_string()))?;
        Self::from_der(&der)
    }

    /// Parses the request and verifies its signature with the key it carries.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let request = CertReq::from_der(der).map_err(|e| CaError::InvalidCsr(e.to_string()))?;
        let public_key = PublicKey::from_x509spki(&request.info.public_key)
            .map_err(|e| CaError::InvalidCsr(e.to_string()))?;

        let info = request.info.to_der()?;
        let signature = request.signature.as_bytes().ok_or(CaError::InvalidCsrSignature)?;
        match public_key.verify(&request.algorithm, &info, signature) {
            Ok(true) => {}
            Ok(false) => return Err(CaError::InvalidCsrSignature),
            Err(e) => {
                debug!(error = %e, "CSR signature algorithm does not match its key");
                return Err(CaError::InvalidCsrSignature);
            }
        }

        let subject = DistinguishedName::from_x509_name(&request.info.subject);
        let subject_alt_names = requested_extensions(&request.info)?
            .iter()
            .find(|ext| ext.extn_id == SubjectAltName::OID)
            .map(|ext| SubjectAltName::from_x509_extension_value(ext.extn_value.as_bytes()))
            .transpose()?
            .map(|san| san.names)
            .unwrap_or_default();

        Ok(Self {
            subject,
            public_key,
            subject_alt_names,
        })
    }
}

fn requested_extensions(info: &CertReqInfo) -> Result<Vec<Extension>> {
    let mut extensions = Vec::new();
    for attribute in info.attributes.iter() {
        if attribute.oid != ExtensionReq::OID {
            continue;
        }
        for value in attribute.values.iter() {
            let request = ExtensionReq::from_der(&value.to_der()?)
                .map_err(|e| CaError::InvalidCsr(e.to_string()))?;
            extensions.extend(request.0);
        }
    }
    Ok(extensions)
}

/// Builds and signs a PKCS#10 request, PEM encoded.
///
/// The server never does this for end entities; it exists for clients and
/// tooling that hold their own keys.
pub fn create_csr_pem(
    subject: &DistinguishedName,
    key: &KeyPair,
    subject_alt_names: &[String],
) -> Result<String> {
    let mut attributes = SetOfVec::new();
    if !subject_alt_names.is_empty() {
        let san = SubjectAltName {
            names: subject_alt_names.to_vec(),
        };
        let extension = Extension {
            extn_id: SubjectAltName::OID,
            critical: false,
            extn_value: der::asn1::OctetString::new(san.to_x509_extension_value()?)?,
        };
        let mut values = SetOfVec::new();
        values.insert(Any::encode_from(&ExtensionReq(vec![extension]))?)?;
        attributes.insert(Attribute {
            oid: ExtensionReq::OID,
            values,
        })?;
    }

    let info = CertReqInfo {
        version: Version::V1,
        subject: subject.as_x509_name()?,
        public_key: PublicKey::from_key_pair(key).to_spki()?,
        attributes,
    };
    let signature = key.sign_data(&info.to_der()?)?;
    let request = CertReq {
        info,
        algorithm: key.signature_algorithm().into(),
        signature: BitString::from_bytes(&signature)?,
    };
    Ok(der_to_pem(&request.to_der()?, CSR_LABELS[0]))
}
