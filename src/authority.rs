//! The authority facade: role checks, per-issuer serialization and template
//! enforcement in front of the issuer, chain, revocation and template
//! components. Every issuance, revocation and template change lands in the
//! audit log, refused attempts included.

use std::fs;
use std::sync::Arc;

use dashmap::DashMap;
use der::Decode;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use x509_cert::Certificate;

use crate::audit::{AuditAction, AuditFilter, AuditLog, AuditOutcome, AuditPage};
use crate::cert::params::{DistinguishedName, Validity};
use crate::chain::{ChainNode, ChainValidator};
use crate::config::AuthorityConfig;
use crate::crl::Crl;
use crate::csr::VerifiedCsr;
use crate::error::{CaError, Result};
use crate::issuer::{CertificateIssuer, IssuanceContext, RequestedExtensions};
use crate::key::PublicKey;
use crate::keystore::{KeyMaterialProvider, KeyVault};
use crate::model::{
    Actor, CertificateId, CertificateRecord, CertificateType, Owner, RevocationReason, Role,
};
use crate::pem_utils::{CERTIFICATE_LABEL, der_to_pem};
use crate::revocation::RevocationRegistry;
use crate::store::{
    CertificateStore, FileCertificateStore, FileTemplateStore, MemoryCertificateStore,
    MemoryTemplateStore, TemplateStore, io_error,
};
use crate::template::{
    CertificateTemplate, IssuanceRequest, TemplateEngine, TemplateId, TemplatePolicy,
};

const CERTIFICATES_FILE: &str = "certificates.json";
const TEMPLATES_FILE: &str = "templates.json";
const KEYS_DIR: &str = "keys";
const AUDIT_FILE: &str = "audit.jsonl";

pub struct CertificateAuthority {
    store: Arc<dyn CertificateStore>,
    keys: Arc<KeyMaterialProvider>,
    issuer: CertificateIssuer,
    chain: ChainValidator,
    revocation: RevocationRegistry,
    templates: TemplateEngine,
    audit: AuditLog,
    issuer_locks: DashMap<CertificateId, Arc<Mutex<()>>>,
}

impl CertificateAuthority {
    /// An authority backed by in-memory stores.
    pub fn new(config: &AuthorityConfig) -> Self {
        Self::with_stores(
            config,
            Arc::new(MemoryCertificateStore::new()),
            Arc::new(MemoryTemplateStore::new()),
        )
    }

    pub fn with_stores(
        config: &AuthorityConfig,
        store: Arc<dyn CertificateStore>,
        template_store: Arc<dyn TemplateStore>,
    ) -> Self {
        Self::assemble(
            config,
            store,
            template_store,
            Arc::new(KeyMaterialProvider::new(config.key_algorithm)),
            AuditLog::in_memory(),
        )
    }

    /// The authority described by `config`.
    ///
    /// Without `storage.data_dir` this is [`CertificateAuthority::new`].
    /// Otherwise certificates, templates and the audit log are loaded from
    /// the data directory and CA keys are unsealed with `passphrase`.
    pub fn open(config: &AuthorityConfig, passphrase: Option<&str>) -> Result<Self> {
        config.validate()?;
        let Some(data_dir) = &config.storage.data_dir else {
            info!("no data directory configured, state is kept in memory");
            return Ok(Self::new(config));
        };
        let passphrase = passphrase.ok_or_else(|| {
            CaError::Config(format!(
                "{} must hold the key vault passphrase",
                config.storage.passphrase_env
            ))
        })?;
        fs::create_dir_all(data_dir).map_err(|e| io_error(data_dir, e))?;

        let store = Arc::new(FileCertificateStore::open(data_dir.join(CERTIFICATES_FILE))?);
        let templates = Arc::new(FileTemplateStore::open(data_dir.join(TEMPLATES_FILE))?);
        let vault = KeyVault::open(data_dir.join(KEYS_DIR), passphrase, config.storage.kdf_iterations)?;
        let keys = Arc::new(KeyMaterialProvider::with_vault(config.key_algorithm, vault)?);
        let audit = AuditLog::open(data_dir.join(AUDIT_FILE))?;

        let authority = Self::assemble(config, store, templates, keys, audit);
        authority.reconcile_keys()?;
        info!(data_dir = %data_dir.display(), "opened persistent authority");
        Ok(authority)
    }

    fn assemble(
        config: &AuthorityConfig,
        store: Arc<dyn CertificateStore>,
        template_store: Arc<dyn TemplateStore>,
        keys: Arc<KeyMaterialProvider>,
        audit: AuditLog,
    ) -> Self {
        let chain = ChainValidator::new(Arc::clone(&store));
        Self {
            issuer: CertificateIssuer::new(
                Arc::clone(&store),
                Arc::clone(&keys),
                config.max_serial_attempts,
                config.max_validity_days,
            ),
            revocation: RevocationRegistry::new(
                Arc::clone(&store),
                Arc::clone(&keys),
                config.crl_validity_days,
            ),
            templates: TemplateEngine::new(template_store, chain.clone()),
            chain,
            store,
            keys,
            audit,
            issuer_locks: DashMap::new(),
        }
    }

    /// Drops keys no CA certificate refers to and checks every CA
    /// certificate against the key held for it.
    fn reconcile_keys(&self) -> Result<()> {
        let records = self.store.snapshot()?;
        for id in self.keys.ids() {
            if !records.iter().any(|r| r.id == id && r.certificate_type.is_ca()) {
                warn!(certificate = %id, "discarding key with no CA certificate");
                self.keys.discard(id);
            }
        }
        for record in records.iter().filter(|r| r.certificate_type.is_ca()) {
            let certificate = Certificate::from_der(&record.der)?;
            let certified = PublicKey::from_x509spki(&certificate.tbs_certificate.subject_public_key_info)?;
            let held = self.keys.public_key(record.id).map_err(|_| {
                CaError::Storage(format!("no key is held for CA certificate {}", record.id))
            })?;
            if held != certified {
                return Err(CaError::Storage(format!(
                    "key held for certificate {} does not match its public key",
                    record.id
                )));
            }
        }
        Ok(())
    }

    fn issuer_lock(&self, issuer_id: CertificateId) -> Arc<Mutex<()>> {
        Arc::clone(self.issuer_locks.entry(issuer_id).or_default().value())
    }

    /// Records the outcome of one operation and hands the result back.
    ///
    /// `target` names what was addressed; `on_success` may rename it to
    /// what was created. A failed append is logged but does not undo or
    /// fail the operation.
    fn audited<T>(
        &self,
        actor: &Actor,
        action: AuditAction,
        target: String,
        result: Result<T>,
        on_success: impl FnOnce(&T) -> (String, Option<String>),
    ) -> Result<T> {
        let outcome = AuditOutcome::of(&result);
        let (target, detail) = match &result {
            Ok(value) => on_success(value),
            Err(e) => (target, Some(e.to_string())),
        };
        if let Err(e) = self.audit.record(actor, action, target, outcome, detail) {
            error!(error = %e, ?action, actor = %actor.id, "failed to append audit event");
        }
        result
    }

    /// Root certificates are ADMIN only.
    pub fn issue_root(
        &self,
        actor: &Actor,
        subject: DistinguishedName,
        validity: Validity,
        extensions: RequestedExtensions,
    ) -> Result<CertificateRecord> {
        let result = self.try_issue_root(actor, subject, validity, extensions);
        self.audited(actor, AuditAction::IssueRoot, "root".into(), result, issued)
    }

    fn try_issue_root(
        &self,
        actor: &Actor,
        subject: DistinguishedName,
        validity: Validity,
        extensions: RequestedExtensions,
    ) -> Result<CertificateRecord> {
        if !actor.is_admin() {
            warn!(actor = %actor.id, role = ?actor.role, "root issuance denied");
            return Err(CaError::Forbidden);
        }
        self.issuer
            .issue_root(subject, validity, extensions, IssuanceContext::new(Owner::from(actor)))
    }

    /// ADMIN may issue under any issuer, CA only under issuers it can see.
    pub fn issue_intermediate(
        &self,
        actor: &Actor,
        issuer_id: CertificateId,
        subject: DistinguishedName,
        validity: Validity,
        extensions: RequestedExtensions,
        template_id: Option<TemplateId>,
    ) -> Result<CertificateRecord> {
        let result =
            self.try_issue_intermediate(actor, issuer_id, subject, validity, extensions, template_id);
        self.audited(
            actor,
            AuditAction::IssueIntermediate,
            format!("issuer:{issuer_id}"),
            result,
            issued,
        )
    }

    fn try_issue_intermediate(
        &self,
        actor: &Actor,
        issuer_id: CertificateId,
        subject: DistinguishedName,
        validity: Validity,
        mut extensions: RequestedExtensions,
        template_id: Option<TemplateId>,
    ) -> Result<CertificateRecord> {
        if actor.role == Role::Basic {
            warn!(actor = %actor.id, "intermediate issuance denied");
            return Err(CaError::Forbidden);
        }
        self.require_issuer_access(actor, issuer_id)?;
        if let Some(template_id) = template_id {
            let template = self.templates.check_issuance(
                template_id,
                issuer_id,
                CertificateType::Intermediate,
                &subject.common_name,
                &extensions.subject_alt_names,
                &validity,
            )?;
            apply_template_extensions(&mut extensions, &template);
        }

        let lock = self.issuer_lock(issuer_id);
        let _guard = lock.lock();
        self.issuer.issue_intermediate(
            issuer_id,
            subject,
            validity,
            extensions,
            IssuanceContext::new(Owner::from(actor)).with_template(template_id),
        )
    }

    /// Any role may request an end-entity certificate; CA actors are held to
    /// issuers they can see.
    pub fn issue_end_entity(
        &self,
        actor: &Actor,
        issuer_id: CertificateId,
        csr_pem: &str,
        validity: Validity,
        extensions: RequestedExtensions,
        template_id: Option<TemplateId>,
    ) -> Result<CertificateRecord> {
        let result =
            self.try_issue_end_entity(actor, issuer_id, csr_pem, validity, extensions, template_id);
        self.audited(
            actor,
            AuditAction::IssueEndEntity,
            format!("issuer:{issuer_id}"),
            result,
            issued,
        )
    }

    fn try_issue_end_entity(
        &self,
        actor: &Actor,
        issuer_id: CertificateId,
        csr_pem: &str,
        validity: Validity,
        mut extensions: RequestedExtensions,
        template_id: Option<TemplateId>,
    ) -> Result<CertificateRecord> {
        if actor.role == Role::Ca {
            self.require_issuer_access(actor, issuer_id)?;
        }
        let csr = VerifiedCsr::from_pem(csr_pem)?;
        if let Some(template_id) = template_id {
            let mut names = csr.subject_alt_names.clone();
            names.extend(
                extensions
                    .subject_alt_names
                    .iter()
                    .filter(|name| !csr.subject_alt_names.contains(name))
                    .cloned(),
            );
            let template = self.templates.check_issuance(
                template_id,
                issuer_id,
                CertificateType::EndEntity,
                csr.subject.common_name.trim(),
                &names,
                &validity,
            )?;
            apply_template_extensions(&mut extensions, &template);
        }

        let lock = self.issuer_lock(issuer_id);
        let _guard = lock.lock();
        self.issuer.issue_end_entity(
            issuer_id,
            csr,
            validity,
            extensions,
            IssuanceContext::new(Owner::from(actor)).with_template(template_id),
        )
    }

    /// Revocation is serialized with issuance under the target's issuer.
    pub fn revoke(
        &self,
        actor: &Actor,
        id: CertificateId,
        reason: RevocationReason,
    ) -> Result<CertificateRecord> {
        let result = self.try_revoke(actor, id, reason);
        self.audited(
            actor,
            AuditAction::RevokeCertificate,
            format!("certificate:{id}"),
            result,
            |record| (format!("certificate:{}", record.id), Some(format!("reason {reason}"))),
        )
    }

    fn try_revoke(
        &self,
        actor: &Actor,
        id: CertificateId,
        reason: RevocationReason,
    ) -> Result<CertificateRecord> {
        let target = self.store.get(id)?;
        let lock = self.issuer_lock(target.issuer_id.unwrap_or(id));
        let _guard = lock.lock();
        self.revocation.revoke(id, reason, actor)
    }

    pub fn certificate(&self, actor: &Actor, id: CertificateId) -> Result<CertificateRecord> {
        let record = self.store.get(id)?;
        if !self.chain.is_visible(id, actor)? {
            warn!(certificate = %id, actor = %actor.id, "certificate access denied");
            return Err(CaError::Forbidden);
        }
        Ok(record)
    }

    pub fn certificate_pem(&self, actor: &Actor, id: CertificateId) -> Result<String> {
        let record = self.certificate(actor, id)?;
        Ok(der_to_pem(&record.der, CERTIFICATE_LABEL))
    }

    /// DER of an end-entity certificate by serial. BASIC actors may only
    /// fetch their own.
    pub fn end_entity_der(&self, actor: &Actor, serial_number: &str) -> Result<Vec<u8>> {
        let record = self
            .store
            .find_by_serial(serial_number)?
            .ok_or_else(|| CaError::not_found("Certificate", serial_number))?;
        let allowed = record.certificate_type == CertificateType::EndEntity
            && (actor.role != Role::Basic || record.owner.id == actor.id);
        if !allowed {
            warn!(serial = %serial_number, actor = %actor.id, "end-entity download denied");
            return Err(CaError::Forbidden);
        }
        Ok(record.der)
    }

    pub fn my_chain(&self, actor: &Actor) -> Result<Vec<CertificateRecord>> {
        self.chain.visible_certificates(actor)
    }

    pub fn chain_tree(&self, actor: &Actor) -> Result<Vec<ChainNode>> {
        self.chain.build_chain_tree(actor)
    }

    pub fn eligible_issuers(&self, actor: &Actor) -> Result<Vec<CertificateRecord>> {
        self.chain.eligible_issuers(actor)
    }

    pub fn is_chain_valid(&self, id: CertificateId) -> Result<bool> {
        self.chain.is_chain_valid(id)
    }

    /// CRL of the CA certificate with `issuer_serial`.
    pub fn crl(&self, issuer_serial: &str) -> Result<Crl> {
        self.revocation.generate_crl_for_serial(issuer_serial)
    }

    pub fn create_template(&self, actor: &Actor, policy: TemplatePolicy) -> Result<CertificateTemplate> {
        let name = policy.name.clone();
        let result = self.templates.create_template(policy, actor);
        self.audited(actor, AuditAction::CreateTemplate, "template".into(), result, |template| {
            (format!("template:{}", template.id), Some(format!("name {name}")))
        })
    }

    pub fn update_template(
        &self,
        actor: &Actor,
        id: TemplateId,
        policy: TemplatePolicy,
    ) -> Result<CertificateTemplate> {
        let result = self.templates.update_template(id, policy, actor);
        self.audited(actor, AuditAction::UpdateTemplate, format!("template:{id}"), result, |_| {
            (format!("template:{id}"), None)
        })
    }

    pub fn delete_template(&self, actor: &Actor, id: TemplateId) -> Result<()> {
        let result = self.templates.delete_template(id, actor);
        self.audited(actor, AuditAction::DeleteTemplate, format!("template:{id}"), result, |_| {
            (format!("template:{id}"), None)
        })
    }

    pub fn template(&self, actor: &Actor, id: TemplateId) -> Result<CertificateTemplate> {
        self.templates.get_template(id, actor)
    }

    pub fn templates(&self, actor: &Actor) -> Result<Vec<CertificateTemplate>> {
        self.templates.list_templates(actor)
    }

    /// Prefills an issuance request from a template the actor can see.
    pub fn use_template(
        &self,
        actor: &Actor,
        id: TemplateId,
        subject: DistinguishedName,
        subject_alt_names: Vec<String>,
    ) -> Result<IssuanceRequest> {
        let result = self
            .templates
            .get_template(id, actor)
            .and_then(|_| self.templates.apply_template(id, subject, subject_alt_names));
        self.audited(actor, AuditAction::UseTemplate, format!("template:{id}"), result, |_| {
            (format!("template:{id}"), None)
        })
    }

    /// Audit events matching `filter`. ADMIN only.
    pub fn audit_events(&self, actor: &Actor, filter: &AuditFilter) -> Result<AuditPage> {
        if !actor.is_admin() {
            warn!(actor = %actor.id, role = ?actor.role, "audit log access denied");
            return Err(CaError::Forbidden);
        }
        Ok(self.audit.query(filter))
    }

    fn require_issuer_access(&self, actor: &Actor, issuer_id: CertificateId) -> Result<()> {
        if actor.is_admin() {
            return Ok(());
        }
        if self.chain.is_visible(issuer_id, actor)? {
            debug!(issuer = %issuer_id, actor = %actor.id, "issuer access granted");
            Ok(())
        } else {
            warn!(issuer = %issuer_id, actor = %actor.id, "issuer outside the actor's chain");
            Err(CaError::Forbidden)
        }
    }
}

fn issued(record: &CertificateRecord) -> (String, Option<String>) {
    (
        format!("certificate:{}", record.id),
        Some(format!("serial {}", record.serial_number)),
    )
}

fn apply_template_extensions(extensions: &mut RequestedExtensions, template: &CertificateTemplate) {
    extensions.key_usage = template.key_usage;
    extensions.extended_key_usage = template.extended_key_usage.clone();
    extensions.basic_constraints = template.basic_constraints;
}
