use std::sync::Arc;

use der::Encode;
use time::OffsetDateTime;
use tracing::{debug, error, info};
use x509_cert::certificate::CertificateInner;

use crate::cert::Certificate;
use crate::cert::extensions::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectAltName, SubjectKeyIdentifier,
};
use crate::cert::params::{CertificationRequestInfo, DistinguishedName, ExtensionParam, Validity};
use crate::chain::ChainValidator;
use crate::csr::VerifiedCsr;
use crate::error::{CaError, Result};
use crate::key::{KeyPair, PublicKey};
use crate::keystore::{KeyMaterialProvider, PendingKey};
use crate::model::{CertificateId, CertificateRecord, CertificateType, Owner};
use crate::store::CertificateStore;
use crate::tbs_certificate::TbsCertificate;
use crate::template::TemplateId;

/// Represents an entity capable of issuing certificates.
///
/// This trait provides methods to retrieve issuer details and issue certificates.
pub trait Issuer {
    /// Returns the distinguished name of the issuer.
    fn issuer_name(&self) -> &DistinguishedName;

    /// Returns the signing key of the issuer.
    fn signing_key(&self) -> &KeyPair;

    /// Key identifier placed in the AuthorityKeyIdentifier extension, or
    /// `None` for self-signed certificates.
    fn authority_key_identifier(&self) -> Result<Option<Vec<u8>>>;

    /// Issues a certificate based on the provided certification request information.
    ///
    /// # Arguments
    /// * `serial_number` - Positive big-endian serial number.
    /// * `cert_request` - Subject, public key and extensions of the certificate to be issued.
    /// * `validity` - The validity window written into the certificate.
    ///
    /// # Returns
    /// The signed `Certificate`.
    fn issue(
        &self,
        serial_number: &[u8],
        cert_request: &CertificationRequestInfo,
        validity: Validity,
    ) -> Result<Certificate> {
        let signature_algorithm = self.signing_key().signature_algorithm();
        let subject_key_id = cert_request.subject_public_key.key_identifier()?;

        let mut extensions = vec![ExtensionParam::from_extension(
            &cert_request.basic_constraints,
            true,
        )?];
        if !cert_request.key_usage.is_empty() {
            extensions.push(ExtensionParam::from_extension(&cert_request.key_usage, true)?);
        }
        if !cert_request.extended_key_usage.is_empty() {
            extensions.push(ExtensionParam::from_extension(
                &cert_request.extended_key_usage,
                false,
            )?);
        }
        if !cert_request.subject_alt_names.is_empty() {
            let san = SubjectAltName {
                names: cert_request.subject_alt_names.clone(),
            };
            extensions.push(ExtensionParam::from_extension(&san, false)?);
        }
        extensions.push(ExtensionParam::from_extension(
            &SubjectKeyIdentifier(subject_key_id),
            false,
        )?);
        if let Some(key_identifier) = self.authority_key_identifier()? {
            extensions.push(ExtensionParam::from_extension(
                &AuthorityKeyIdentifier { key_identifier },
                false,
            )?);
        }
        extensions.extend(cert_request.extensions.iter().cloned());

        let tbs_cert = TbsCertificate {
            serial_number: serial_number.to_vec(),
            signature_algorithm,
            issuer: self.issuer_name().clone(),
            validity,
            subject: cert_request.subject.clone(),
            subject_public_key: cert_request.subject_public_key.clone(),
            extensions,
        };

        let tbs_cert_inner = tbs_cert.to_tbs_certificate_inner()?;
        let signature = self.signing_key().sign_data(&tbs_cert_inner.to_der()?)?;

        let cert_inner = CertificateInner {
            signature_algorithm: tbs_cert_inner.signature.clone(),
            tbs_certificate: tbs_cert_inner,
            signature: der::asn1::BitString::from_bytes(&signature)?,
        };

        Ok(Certificate { inner: cert_inner })
    }
}

/// Signs a certificate with the key it certifies.
pub struct SelfIssuer<'a> {
    pub name: &'a DistinguishedName,
    pub key: &'a KeyPair,
}

impl Issuer for SelfIssuer<'_> {
    fn issuer_name(&self) -> &DistinguishedName {
        self.name
    }

    fn signing_key(&self) -> &KeyPair {
        self.key
    }

    fn authority_key_identifier(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Signs with the key of an existing CA certificate.
pub struct CaIssuer<'a> {
    pub name: &'a DistinguishedName,
    pub key: &'a KeyPair,
}

impl Issuer for CaIssuer<'_> {
    fn issuer_name(&self) -> &DistinguishedName {
        self.name
    }

    fn signing_key(&self) -> &KeyPair {
        self.key
    }

    fn authority_key_identifier(&self) -> Result<Option<Vec<u8>>> {
        PublicKey::from_key_pair(self.key).key_identifier().map(Some)
    }
}

/// Extensions a caller asks for. Each issuance path overrides what its
/// certificate type forces (CA flag, certificate signing usages).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedExtensions {
    pub basic_constraints: BasicConstraints,
    pub key_usage: KeyUsage,
    pub extended_key_usage: ExtendedKeyUsage,
    pub subject_alt_names: Vec<String>,
}

/// Who asked for a certificate, and through which template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceContext {
    pub owner: Owner,
    pub template_id: Option<TemplateId>,
}

impl IssuanceContext {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            template_id: None,
        }
    }

    pub fn with_template(mut self, template_id: Option<TemplateId>) -> Self {
        self.template_id = template_id;
        self
    }
}

/// Random 128-bit serial number: positive, always 16 bytes in DER.
pub fn generate_serial_number() -> [u8; 16] {
    let mut serial: [u8; 16] = rand::random();
    serial[0] = (serial[0] & 0x7F) | 0x01;
    serial
}

/// Builds, signs and stores root, intermediate and end-entity certificates.
///
/// Callers are expected to serialize calls per issuer; this type checks
/// eligibility against the store at call time and commits each certificate
/// with one store insert.
pub struct CertificateIssuer {
    store: Arc<dyn CertificateStore>,
    keys: Arc<KeyMaterialProvider>,
    chain: ChainValidator,
    max_serial_attempts: u32,
    max_validity_days: Option<u32>,
}

impl CertificateIssuer {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        keys: Arc<KeyMaterialProvider>,
        max_serial_attempts: u32,
        max_validity_days: Option<u32>,
    ) -> Self {
        Self {
            chain: ChainValidator::new(Arc::clone(&store)),
            store,
            keys,
            max_serial_attempts: max_serial_attempts.max(1),
            max_validity_days,
        }
    }

    /// Issues a self-signed root with a fresh key pair.
    pub fn issue_root(
        &self,
        subject: DistinguishedName,
        validity: Validity,
        extensions: RequestedExtensions,
        context: IssuanceContext,
    ) -> Result<CertificateRecord> {
        let subject = subject.normalized();
        subject.validate()?;
        self.check_validity(&validity)?;

        let pending = self.keys.generate()?;
        let request = CertificationRequestInfo::builder()
            .subject(subject.clone())
            .subject_public_key(pending.public_key())
            .basic_constraints(BasicConstraints::ca(
                extensions.basic_constraints.max_path_length,
            ))
            .key_usage(ca_key_usage(extensions.key_usage))
            .extended_key_usage(extensions.extended_key_usage)
            .subject_alt_names(extensions.subject_alt_names)
            .build();

        let id = self.store.allocate_id();
        let record = self.commit(id, CertificateType::Root, None, Some(pending), context, |serial| {
            self.keys.with_signing_key(id, |key| {
                SelfIssuer {
                    name: &subject,
                    key,
                }
                .issue(serial, &request, validity)
            })
        })?;
        info!(id = %record.id, serial = %record.serial_number, subject = %record.subject, "issued root certificate");
        Ok(record)
    }

    /// Issues a CA certificate under `issuer_id` with a fresh key pair.
    pub fn issue_intermediate(
        &self,
        issuer_id: CertificateId,
        subject: DistinguishedName,
        validity: Validity,
        extensions: RequestedExtensions,
        context: IssuanceContext,
    ) -> Result<CertificateRecord> {
        let subject = subject.normalized();
        subject.validate()?;
        self.check_validity(&validity)?;
        let issuer = self.require_issuer(issuer_id, &validity)?;

        let max_path_length = match issuer.basic_constraints.max_path_length {
            Some(0) => {
                return Err(CaError::IssuerNotEligible(format!(
                    "certificate {issuer_id} has path length 0 and cannot issue CA certificates"
                )));
            }
            Some(parent) => Some(
                extensions
                    .basic_constraints
                    .max_path_length
                    .map_or(parent - 1, |requested| requested.min(parent - 1)),
            ),
            None => extensions.basic_constraints.max_path_length,
        };

        let pending = self.keys.generate()?;
        let request = CertificationRequestInfo::builder()
            .subject(subject)
            .subject_public_key(pending.public_key())
            .basic_constraints(BasicConstraints::ca(max_path_length))
            .key_usage(ca_key_usage(extensions.key_usage))
            .extended_key_usage(extensions.extended_key_usage)
            .subject_alt_names(extensions.subject_alt_names)
            .build();

        let record = self.commit(
            self.store.allocate_id(),
            CertificateType::Intermediate,
            Some(&issuer),
            Some(pending),
            context,
            |serial| self.sign_with_issuer(&issuer, serial, &request, validity),
        )?;
        info!(
            id = %record.id,
            issuer = %issuer_id,
            serial = %record.serial_number,
            subject = %record.subject,
            "issued intermediate certificate"
        );
        Ok(record)
    }

    /// Verifies the CSR and issues an end-entity certificate for its key.
    pub fn issue_end_entity_from_csr(
        &self,
        issuer_id: CertificateId,
        csr_pem: &str,
        validity: Validity,
        extensions: RequestedExtensions,
        context: IssuanceContext,
    ) -> Result<CertificateRecord> {
        let csr = VerifiedCsr::from_pem(csr_pem)?;
        self.issue_end_entity(issuer_id, csr, validity, extensions, context)
    }

    /// Issues an end-entity certificate for an already verified CSR.
    ///
    /// SANs requested explicitly are added to the ones in the CSR.
    pub fn issue_end_entity(
        &self,
        issuer_id: CertificateId,
        csr: VerifiedCsr,
        validity: Validity,
        extensions: RequestedExtensions,
        context: IssuanceContext,
    ) -> Result<CertificateRecord> {
        let subject = csr.subject.normalized();
        subject.validate()?;
        self.check_validity(&validity)?;
        let issuer = self.require_issuer(issuer_id, &validity)?;

        let mut subject_alt_names = csr.subject_alt_names;
        for name in extensions.subject_alt_names {
            if !subject_alt_names.contains(&name) {
                subject_alt_names.push(name);
            }
        }

        let request = CertificationRequestInfo::builder()
            .subject(subject)
            .subject_public_key(csr.public_key)
            .basic_constraints(BasicConstraints::end_entity())
            .key_usage(
                extensions
                    .key_usage
                    .without(KeyUsages::KeyCertSign)
                    .without(KeyUsages::CRLSign),
            )
            .extended_key_usage(extensions.extended_key_usage)
            .subject_alt_names(subject_alt_names)
            .build();

        let record = self.commit(
            self.store.allocate_id(),
            CertificateType::EndEntity,
            Some(&issuer),
            None,
            context,
            |serial| self.sign_with_issuer(&issuer, serial, &request, validity),
        )?;
        info!(
            id = %record.id,
            issuer = %issuer_id,
            serial = %record.serial_number,
            subject = %record.subject,
            "issued end-entity certificate"
        );
        Ok(record)
    }

    fn check_validity(&self, validity: &Validity) -> Result<()> {
        validity.validate()?;
        if let Some(max_days) = self.max_validity_days {
            if validity.duration() > time::Duration::days(i64::from(max_days)) {
                return Err(CaError::validation(
                    "validity",
                    format!("lifetime exceeds the configured maximum of {max_days} days"),
                ));
            }
        }
        Ok(())
    }

    fn require_issuer(&self, issuer_id: CertificateId, validity: &Validity) -> Result<CertificateRecord> {
        let issuer = self
            .chain
            .require_eligible_issuer(issuer_id, OffsetDateTime::now_utc())?;
        if !issuer.validity.contains(validity) {
            return Err(CaError::validation(
                "validity",
                format!(
                    "must lie within the issuer's validity period ({} to {})",
                    issuer.validity.not_before, issuer.validity.not_after
                ),
            ));
        }
        Ok(issuer)
    }

    fn sign_with_issuer(
        &self,
        issuer: &CertificateRecord,
        serial: &[u8],
        request: &CertificationRequestInfo,
        validity: Validity,
    ) -> Result<Certificate> {
        self.keys.with_signing_key(issuer.id, |key| {
            CaIssuer {
                name: &issuer.subject,
                key,
            }
            .issue(serial, request, validity)
        })
    }

    /// Signs under a fresh serial and inserts the record, retrying on serial
    /// collisions. A CA key is bound to the reserved id before the insert
    /// and discarded if nothing gets stored.
    fn commit(
        &self,
        id: CertificateId,
        certificate_type: CertificateType,
        issuer: Option<&CertificateRecord>,
        pending: Option<PendingKey>,
        context: IssuanceContext,
        sign: impl Fn(&[u8]) -> Result<Certificate>,
    ) -> Result<CertificateRecord> {
        let has_key = pending.is_some();
        if let Some(pending) = pending {
            self.keys.register(id, pending)?;
        }

        let result = self.insert_with_fresh_serial(id, certificate_type, issuer, &context, &sign);
        if result.is_err() && has_key {
            self.keys.discard(id);
        }
        result
    }

    fn insert_with_fresh_serial(
        &self,
        id: CertificateId,
        certificate_type: CertificateType,
        issuer: Option<&CertificateRecord>,
        context: &IssuanceContext,
        sign: &impl Fn(&[u8]) -> Result<Certificate>,
    ) -> Result<CertificateRecord> {
        for attempt in 1..=self.max_serial_attempts {
            let serial = generate_serial_number();
            let serial_hex = crate::cert::hex_upper(&serial);
            if self.store.contains_serial(&serial_hex)? {
                debug!(attempt, serial = %serial_hex, "serial number taken, regenerating");
                continue;
            }

            let certificate = sign(&serial)?;
            let record = build_record(id, certificate_type, issuer, &certificate, context)?;

            match self.store.insert(record.clone()) {
                Ok(()) => return Ok(record),
                Err(CaError::SerialCollision) => {
                    debug!(attempt, serial = %serial_hex, "serial number collided on insert, regenerating");
                }
                Err(e) => {
                    error!(error = %e, id = %id, "failed to store certificate");
                    return Err(e);
                }
            }
        }
        error!(attempts = self.max_serial_attempts, "could not allocate a unique serial number");
        Err(CaError::Storage(
            "could not allocate a unique serial number".into(),
        ))
    }
}

fn ca_key_usage(requested: KeyUsage) -> KeyUsage {
    requested
        .with(KeyUsages::KeyCertSign)
        .with(KeyUsages::CRLSign)
}

fn build_record(
    id: CertificateId,
    certificate_type: CertificateType,
    issuer: Option<&CertificateRecord>,
    certificate: &Certificate,
    context: &IssuanceContext,
) -> Result<CertificateRecord> {
    Ok(CertificateRecord {
        id,
        serial_number: certificate.serial_number_hex(),
        certificate_type,
        subject: certificate.subject(),
        issuer_dn: certificate.issuer(),
        issuer_id: issuer.map(|issuer| issuer.id),
        validity: certificate.validity(),
        basic_constraints: certificate
            .extension::<BasicConstraints>()?
            .unwrap_or_default(),
        key_usage: certificate.extension::<KeyUsage>()?.unwrap_or_default(),
        extended_key_usage: certificate
            .extension::<ExtendedKeyUsage>()?
            .unwrap_or_default(),
        subject_alt_names: certificate
            .extension::<SubjectAltName>()?
            .map(|san| san.names)
            .unwrap_or_default(),
        revocation: None,
        owner: context.owner.clone(),
        template_id: context.template_id,
        der: certificate.to_der()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyAlgorithm;
    use crate::model::RevocationRecord;
    use crate::store::MemoryCertificateStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dn(cn: &str) -> DistinguishedName {
        DistinguishedName::builder()
            .common_name(cn.to_string())
            .organization("Example".to_string())
            .country("RS".to_string())
            .build()
    }

    fn context() -> IssuanceContext {
        IssuanceContext::new(Owner {
            id: "admin".into(),
            organization: Some("Example".into()),
        })
    }

    fn issuer_with(store: Arc<dyn CertificateStore>) -> CertificateIssuer {
        CertificateIssuer::new(
            store,
            Arc::new(KeyMaterialProvider::new(KeyAlgorithm::EcdsaP256)),
            4,
            None,
        )
    }

    #[test]
    fn test_serial_number_is_positive_and_full_width() {
        for _ in 0..64 {
            let serial = generate_serial_number();
            assert!(serial[0] >= 0x01 && serial[0] <= 0x7F);
        }
    }

    #[test]
    fn test_root_is_self_signed_ca() {
        let issuer = issuer_with(Arc::new(MemoryCertificateStore::new()));
        let root = issuer
            .issue_root(dn("Root"), Validity::for_days(3650).unwrap(), RequestedExtensions::default(), context())
            .unwrap();

        assert_eq!(root.certificate_type, CertificateType::Root);
        assert!(root.basic_constraints.is_ca);
        assert!(root.key_usage.contains(KeyUsages::KeyCertSign));
        assert!(root.key_usage.contains(KeyUsages::CRLSign));
        assert_eq!(root.issuer_dn, root.subject);

        let cert = Certificate::from_der(&root.der).unwrap();
        let key = cert.public_key().unwrap();
        assert!(cert.verify_signed_by(&key).unwrap());
        assert!(cert.extension::<AuthorityKeyIdentifier>().unwrap().is_none());
        assert!(cert.extension::<SubjectKeyIdentifier>().unwrap().is_some());
    }

    #[test]
    fn test_intermediate_path_length_is_clamped_and_enforced() {
        let issuer = issuer_with(Arc::new(MemoryCertificateStore::new()));
        let extensions = RequestedExtensions {
            basic_constraints: BasicConstraints::ca(Some(1)),
            ..Default::default()
        };
        let root = issuer
            .issue_root(dn("Root"), Validity::for_days(3650).unwrap(), extensions, context())
            .unwrap();

        let wide = RequestedExtensions {
            basic_constraints: BasicConstraints::ca(Some(5)),
            ..Default::default()
        };
        let intermediate = issuer
            .issue_intermediate(root.id, dn("Intermediate"), Validity::for_days(365).unwrap(), wide.clone(), context())
            .unwrap();
        assert_eq!(intermediate.basic_constraints.max_path_length, Some(0));

        let err = issuer
            .issue_intermediate(intermediate.id, dn("Too deep"), Validity::for_days(30).unwrap(), wide, context())
            .unwrap_err();
        assert!(matches!(err, CaError::IssuerNotEligible(_)));
    }

    #[test]
    fn test_child_validity_must_fit_inside_issuer() {
        let issuer = issuer_with(Arc::new(MemoryCertificateStore::new()));
        let root = issuer
            .issue_root(dn("Root"), Validity::for_days(30).unwrap(), RequestedExtensions::default(), context())
            .unwrap();
        let err = issuer
            .issue_intermediate(root.id, dn("Long"), Validity::for_days(60).unwrap(), RequestedExtensions::default(), context())
            .unwrap_err();
        assert!(matches!(err, CaError::Validation { field, .. } if field == "validity"));
    }

    #[test]
    fn test_end_entity_strips_ca_usages() {
        let issuer = issuer_with(Arc::new(MemoryCertificateStore::new()));
        let root = issuer
            .issue_root(dn("Root"), Validity::for_days(3650).unwrap(), RequestedExtensions::default(), context())
            .unwrap();
        let key = KeyPair::generate_ecdsa_p256();
        let csr = crate::csr::create_csr_pem(&dn("host-1"), &key, &[]).unwrap();
        let requested = RequestedExtensions {
            key_usage: KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyCertSign),
            ..Default::default()
        };
        let ee = issuer
            .issue_end_entity_from_csr(root.id, &csr, Validity::for_days(90).unwrap(), requested, context())
            .unwrap();

        assert!(!ee.basic_constraints.is_ca);
        assert!(ee.key_usage.contains(KeyUsages::DigitalSignature));
        assert!(!ee.key_usage.contains(KeyUsages::KeyCertSign));

        let cert = Certificate::from_der(&ee.der).unwrap();
        let root_cert = Certificate::from_der(&root.der).unwrap();
        assert!(cert.verify_signed_by(&root_cert.public_key().unwrap()).unwrap());
        assert_eq!(cert.public_key().unwrap(), PublicKey::from_key_pair(&key));
        let aki = cert.extension::<AuthorityKeyIdentifier>().unwrap().unwrap();
        let root_ski = root_cert.extension::<SubjectKeyIdentifier>().unwrap().unwrap();
        assert_eq!(aki.key_identifier, root_ski.0);
    }

    #[test]
    fn test_end_entity_cannot_issue() {
        let issuer = issuer_with(Arc::new(MemoryCertificateStore::new()));
        let root = issuer
            .issue_root(dn("Root"), Validity::for_days(3650).unwrap(), RequestedExtensions::default(), context())
            .unwrap();
        let csr = crate::csr::create_csr_pem(&dn("leaf"), &KeyPair::generate_ed25519(), &[]).unwrap();
        let leaf = issuer
            .issue_end_entity_from_csr(root.id, &csr, Validity::for_days(30).unwrap(), RequestedExtensions::default(), context())
            .unwrap();

        let err = issuer
            .issue_intermediate(leaf.id, dn("Child"), Validity::for_days(10).unwrap(), RequestedExtensions::default(), context())
            .unwrap_err();
        assert!(matches!(err, CaError::IssuerNotEligible(_)));
    }

    /// Reports a collision for the first `collisions` inserts.
    struct CollidingStore {
        inner: MemoryCertificateStore,
        collisions: AtomicU32,
    }

    impl CertificateStore for CollidingStore {
        fn allocate_id(&self) -> CertificateId {
            self.inner.allocate_id()
        }

        fn insert(&self, record: CertificateRecord) -> Result<()> {
            if self
                .collisions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CaError::SerialCollision);
            }
            self.inner.insert(record)
        }

        fn get(&self, id: CertificateId) -> Result<CertificateRecord> {
            self.inner.get(id)
        }

        fn find_by_serial(&self, serial_number: &str) -> Result<Option<CertificateRecord>> {
            self.inner.find_by_serial(serial_number)
        }

        fn contains_serial(&self, serial_number: &str) -> Result<bool> {
            self.inner.contains_serial(serial_number)
        }

        fn snapshot(&self) -> Result<Vec<CertificateRecord>> {
            self.inner.snapshot()
        }

        fn mark_revoked(&self, id: CertificateId, revocation: RevocationRecord) -> Result<CertificateRecord> {
            self.inner.mark_revoked(id, revocation)
        }
    }

    #[test]
    fn test_serial_collision_is_retried() {
        let store = Arc::new(CollidingStore {
            inner: MemoryCertificateStore::new(),
            collisions: AtomicU32::new(3),
        });
        let issuer = issuer_with(store.clone());
        let root = issuer
            .issue_root(dn("Root"), Validity::for_days(365).unwrap(), RequestedExtensions::default(), context())
            .unwrap();
        assert_eq!(store.snapshot().unwrap().len(), 1);
        assert!(issuer.keys.contains(root.id));
    }

    #[test]
    fn test_exhausted_serial_attempts_leave_nothing_behind() {
        let store = Arc::new(CollidingStore {
            inner: MemoryCertificateStore::new(),
            collisions: AtomicU32::new(100),
        });
        let issuer = issuer_with(store.clone());
        let err = issuer
            .issue_root(dn("Root"), Validity::for_days(365).unwrap(), RequestedExtensions::default(), context())
            .unwrap_err();
        assert!(matches!(err, CaError::Storage(_)));
        assert!(store.snapshot().unwrap().is_empty());
        assert!(!issuer.keys.contains(CertificateId(1)));
    }
}
