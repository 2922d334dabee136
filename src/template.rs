//! Reusable issuance policies.
//!
//! A template binds a CA certificate to regular expressions for the subject
//! CN and SANs, a maximum lifetime and fixed extensions. Applying a template
//! yields an [`IssuanceRequest`]; it never signs anything itself.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::cert::extensions::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use crate::cert::params::{DistinguishedName, MAX_VALIDITY_DAYS, Validity};
use crate::chain::ChainValidator;
use crate::error::{CaError, Result};
use crate::model::{Actor, CertificateId, CertificateType, Role};
use crate::store::TemplateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub u64);

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The editable part of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplatePolicy {
    pub name: String,
    pub description: Option<String>,
    pub ca_issuer_id: CertificateId,
    pub common_name_regex: String,
    pub sans_regex: Option<String>,
    pub max_validity_days: u32,
    pub key_usage: KeyUsage,
    pub extended_key_usage: ExtendedKeyUsage,
    pub basic_constraints: BasicConstraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateTemplate {
    pub id: TemplateId,
    pub name: String,
    pub description: Option<String>,
    pub ca_issuer_id: CertificateId,
    pub common_name_regex: String,
    pub sans_regex: Option<String>,
    pub max_validity_days: u32,
    pub key_usage: KeyUsage,
    pub extended_key_usage: ExtendedKeyUsage,
    pub basic_constraints: BasicConstraints,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CertificateTemplate {
    fn from_policy(id: TemplateId, policy: TemplatePolicy, created_by: String, created_at: OffsetDateTime) -> Self {
        Self {
            id,
            name: policy.name.trim().to_string(),
            description: policy.description,
            ca_issuer_id: policy.ca_issuer_id,
            common_name_regex: policy.common_name_regex,
            sans_regex: policy.sans_regex.filter(|r| !r.trim().is_empty()),
            max_validity_days: policy.max_validity_days,
            key_usage: policy.key_usage,
            extended_key_usage: policy.extended_key_usage,
            basic_constraints: policy.basic_constraints,
            created_by,
            created_at,
        }
    }

    /// CA:TRUE templates issue intermediates, everything else end entities.
    pub fn certificate_type(&self) -> CertificateType {
        if self.basic_constraints.is_ca {
            CertificateType::Intermediate
        } else {
            CertificateType::EndEntity
        }
    }

    pub fn max_validity(&self) -> Duration {
        Duration::days(i64::from(self.max_validity_days))
    }
}

/// Everything needed to issue a certificate, resolved from a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRequest {
    pub template_id: Option<TemplateId>,
    pub issuer_id: CertificateId,
    pub certificate_type: CertificateType,
    pub subject: DistinguishedName,
    pub validity: Validity,
    pub key_usage: KeyUsage,
    pub extended_key_usage: ExtendedKeyUsage,
    pub basic_constraints: BasicConstraints,
    pub subject_alt_names: Vec<String>,
}

struct CompiledTemplate {
    template: CertificateTemplate,
    common_name: Regex,
    sans: Option<Regex>,
}

impl CompiledTemplate {
    fn compile(template: CertificateTemplate) -> Result<Self> {
        let common_name = anchored("commonNameRegex", &template.common_name_regex)?;
        let sans = template
            .sans_regex
            .as_deref()
            .map(|pattern| anchored("sansRegex", pattern))
            .transpose()?;
        Ok(Self {
            template,
            common_name,
            sans,
        })
    }

    fn check_common_name(&self, common_name: &str) -> Result<()> {
        if self.common_name.is_match(common_name) {
            Ok(())
        } else {
            Err(CaError::PatternMismatch {
                field: "commonName".into(),
                value: common_name.to_string(),
            })
        }
    }

    fn check_subject_alt_names(&self, names: &[String]) -> Result<()> {
        let Some(sans) = &self.sans else {
            return Ok(());
        };
        match names.iter().find(|name| !sans.is_match(name)) {
            Some(name) => Err(CaError::PatternMismatch {
                field: "subjectAltName".into(),
                value: name.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Patterns must match the whole value.
fn anchored(field: &str, pattern: &str) -> Result<Regex> {
    if pattern.trim().is_empty() {
        return Err(CaError::validation(field, "must not be empty"));
    }
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| CaError::validation(field, format!("invalid regular expression: {e}")))
}

pub struct TemplateEngine {
    store: Arc<dyn TemplateStore>,
    chain: ChainValidator,
    compiled: DashMap<TemplateId, Arc<CompiledTemplate>>,
}

impl TemplateEngine {
    pub fn new(store: Arc<dyn TemplateStore>, chain: ChainValidator) -> Self {
        Self {
            store,
            chain,
            compiled: DashMap::new(),
        }
    }

    pub fn create_template(&self, policy: TemplatePolicy, actor: &Actor) -> Result<CertificateTemplate> {
        if actor.role == Role::Basic {
            warn!(actor = %actor.id, "template creation denied");
            return Err(CaError::Forbidden);
        }
        self.check_policy(&policy, actor)?;

        let template = CertificateTemplate::from_policy(
            self.store.allocate_id(),
            policy,
            actor.id.clone(),
            OffsetDateTime::now_utc(),
        );
        let compiled = CompiledTemplate::compile(template.clone())?;
        self.store.insert(template.clone())?;
        self.compiled.insert(template.id, Arc::new(compiled));
        info!(template = %template.id, name = %template.name, issuer = %template.ca_issuer_id, "template created");
        Ok(template)
    }

    pub fn update_template(
        &self,
        id: TemplateId,
        policy: TemplatePolicy,
        actor: &Actor,
    ) -> Result<CertificateTemplate> {
        let existing = self.store.get(id)?;
        self.require_manager(&existing, actor)?;
        self.check_policy(&policy, actor)?;

        let template = CertificateTemplate::from_policy(id, policy, existing.created_by, existing.created_at);
        let compiled = CompiledTemplate::compile(template.clone())?;
        self.store.update(template.clone())?;
        self.compiled.insert(id, Arc::new(compiled));
        info!(template = %id, name = %template.name, "template updated");
        Ok(template)
    }

    pub fn delete_template(&self, id: TemplateId, actor: &Actor) -> Result<()> {
        let existing = self.store.get(id)?;
        self.require_manager(&existing, actor)?;
        self.store.remove(id)?;
        self.compiled.remove(&id);
        info!(template = %id, "template deleted");
        Ok(())
    }

    pub fn get_template(&self, id: TemplateId, actor: &Actor) -> Result<CertificateTemplate> {
        let template = self.store.get(id)?;
        if !self.is_visible(&template, actor)? {
            warn!(template = %id, actor = %actor.id, "template access denied");
            return Err(CaError::Forbidden);
        }
        Ok(template)
    }

    /// ADMIN sees every template, CA those it created or that are bound to
    /// an issuer it can see. BASIC sees none.
    pub fn list_templates(&self, actor: &Actor) -> Result<Vec<CertificateTemplate>> {
        let mut visible = Vec::new();
        for template in self.store.list()? {
            if self.is_visible(&template, actor)? {
                visible.push(template);
            }
        }
        Ok(visible)
    }

    /// Resolves a template and the caller's requested subject into an
    /// issuance request. The CN and SANs are checked against the template
    /// patterns; the window runs from now for `maxValidityDays`.
    pub fn apply_template(
        &self,
        id: TemplateId,
        requested_subject: DistinguishedName,
        requested_sans: Vec<String>,
    ) -> Result<IssuanceRequest> {
        let compiled = self.compiled(id)?;
        compiled.check_common_name(&requested_subject.common_name)?;
        compiled.check_subject_alt_names(&requested_sans)?;

        let template = &compiled.template;
        debug!(template = %id, common_name = %requested_subject.common_name, "template applied");
        Ok(IssuanceRequest {
            template_id: Some(id),
            issuer_id: template.ca_issuer_id,
            certificate_type: template.certificate_type(),
            subject: requested_subject,
            validity: Validity::for_days(i64::from(template.max_validity_days))?,
            key_usage: template.key_usage,
            extended_key_usage: template.extended_key_usage.clone(),
            basic_constraints: template.basic_constraints,
            subject_alt_names: requested_sans,
        })
    }

    /// Re-validates an issuance against the current template snapshot and
    /// returns that snapshot. Callers apply the template's extensions to
    /// the certificate.
    pub fn check_issuance(
        &self,
        id: TemplateId,
        issuer_id: CertificateId,
        certificate_type: CertificateType,
        common_name: &str,
        subject_alt_names: &[String],
        validity: &Validity,
    ) -> Result<CertificateTemplate> {
        let compiled = self.compiled(id)?;
        let template = &compiled.template;
        if template.ca_issuer_id != issuer_id {
            return Err(CaError::validation(
                "issuerCertificateId",
                format!("template {id} is bound to issuer {}", template.ca_issuer_id),
            ));
        }
        if template.certificate_type() != certificate_type {
            return Err(CaError::validation(
                "templateId",
                format!("template {id} does not issue {certificate_type:?} certificates"),
            ));
        }
        compiled.check_common_name(common_name)?;
        compiled.check_subject_alt_names(subject_alt_names)?;
        if validity.duration() > template.max_validity() {
            return Err(CaError::validation(
                "validity",
                format!("exceeds the template maximum of {} days", template.max_validity_days),
            ));
        }
        Ok(template.clone())
    }

    fn compiled(&self, id: TemplateId) -> Result<Arc<CompiledTemplate>> {
        if let Some(compiled) = self.compiled.get(&id) {
            return Ok(Arc::clone(compiled.value()));
        }
        let compiled = Arc::new(CompiledTemplate::compile(self.store.get(id)?)?);
        self.compiled.insert(id, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn check_policy(&self, policy: &TemplatePolicy, actor: &Actor) -> Result<()> {
        if policy.name.trim().is_empty() {
            return Err(CaError::validation("name", "must not be empty"));
        }
        if policy.max_validity_days == 0 {
            return Err(CaError::validation("maxValidityDays", "must be at least 1"));
        }
        if policy.max_validity_days > MAX_VALIDITY_DAYS {
            return Err(CaError::validation(
                "maxValidityDays",
                format!("must not exceed {MAX_VALIDITY_DAYS}"),
            ));
        }
        anchored("commonNameRegex", &policy.common_name_regex)?;
        if let Some(pattern) = policy.sans_regex.as_deref().filter(|p| !p.trim().is_empty()) {
            anchored("sansRegex", pattern)?;
        }

        let issuer = self
            .chain
            .require_eligible_issuer(policy.ca_issuer_id, OffsetDateTime::now_utc())?;
        if !actor.is_admin() && !self.chain.is_visible(issuer.id, actor)? {
            warn!(actor = %actor.id, issuer = %issuer.id, "template bound to an issuer outside the actor's chain");
            return Err(CaError::Forbidden);
        }
        Ok(())
    }

    fn require_manager(&self, template: &CertificateTemplate, actor: &Actor) -> Result<()> {
        if actor.is_admin() || (actor.role == Role::Ca && template.created_by == actor.id) {
            Ok(())
        } else {
            warn!(template = %template.id, actor = %actor.id, "template modification denied");
            Err(CaError::Forbidden)
        }
    }

    fn is_visible(&self, template: &CertificateTemplate, actor: &Actor) -> Result<bool> {
        match actor.role {
            Role::Admin => Ok(true),
            Role::Basic => Ok(false),
            Role::Ca => {
                if template.created_by == actor.id {
                    return Ok(true);
                }
                match self.chain.is_visible(template.ca_issuer_id, actor) {
                    Ok(visible) => Ok(visible),
                    Err(CaError::NotFound { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::extensions::KeyUsages;
    use crate::issuer::{CertificateIssuer, IssuanceContext, RequestedExtensions};
    use crate::key::KeyAlgorithm;
    use crate::keystore::KeyMaterialProvider;
    use crate::model::{CertificateRecord, Owner};
    use crate::store::{CertificateStore, MemoryCertificateStore, MemoryTemplateStore};

    fn dn(cn: &str) -> DistinguishedName {
        DistinguishedName::builder()
            .common_name(cn.to_string())
            .organization("Acme".to_string())
            .country("RS".to_string())
            .build()
    }

    fn setup() -> (TemplateEngine, CertificateRecord) {
        let store: Arc<dyn CertificateStore> = Arc::new(MemoryCertificateStore::new());
        let keys = Arc::new(KeyMaterialProvider::new(KeyAlgorithm::EcdsaP256));
        let issuer = CertificateIssuer::new(store.clone(), keys, 4, None);
        let root = issuer
            .issue_root(
                dn("Root"),
                Validity::for_days(3650).unwrap(),
                RequestedExtensions::default(),
                IssuanceContext::new(Owner {
                    id: "admin".into(),
                    organization: Some("Acme".into()),
                }),
            )
            .unwrap();
        let engine = TemplateEngine::new(
            Arc::new(MemoryTemplateStore::new()),
            ChainValidator::new(store),
        );
        (engine, root)
    }

    fn policy(name: &str, issuer: CertificateId) -> TemplatePolicy {
        TemplatePolicy {
            name: name.to_string(),
            description: None,
            ca_issuer_id: issuer,
            common_name_regex: "^host-[0-9]+$".to_string(),
            sans_regex: Some(r"[a-z0-9-]+\.example\.com".to_string()),
            max_validity_days: 90,
            key_usage: KeyUsage(KeyUsages::DigitalSignature.into()),
            extended_key_usage: "serverAuth".parse().unwrap(),
            basic_constraints: BasicConstraints::end_entity(),
        }
    }

    fn ca_actor() -> Actor {
        Actor::new("carol", Role::Ca, Some("Acme"))
    }

    #[test]
    fn test_apply_template_checks_common_name() {
        let (engine, root) = setup();
        let template = engine.create_template(policy("web", root.id), &ca_actor()).unwrap();

        let request = engine
            .apply_template(template.id, dn("host-42"), vec!["host-42.example.com".into()])
            .unwrap();
        assert_eq!(request.certificate_type, CertificateType::EndEntity);
        assert_eq!(request.issuer_id, root.id);
        assert_eq!(request.validity.duration(), Duration::days(90));

        let err = engine.apply_template(template.id, dn("bad host"), vec![]).unwrap_err();
        assert_eq!(
            err,
            CaError::PatternMismatch {
                field: "commonName".into(),
                value: "bad host".into()
            }
        );

        let err = engine
            .apply_template(template.id, dn("host-1"), vec!["evil.org".into()])
            .unwrap_err();
        assert!(matches!(err, CaError::PatternMismatch { field, .. } if field == "subjectAltName"));
    }

    #[test]
    fn test_patterns_match_whole_value() {
        let (engine, root) = setup();
        let mut loose = policy("loose", root.id);
        loose.common_name_regex = "host-[0-9]+".into();
        let template = engine.create_template(loose, &ca_actor()).unwrap();
        assert!(engine.apply_template(template.id, dn("xhost-1x"), vec![]).is_err());
        assert!(engine.apply_template(template.id, dn("host-1"), vec![]).is_ok());
    }

    #[test]
    fn test_create_template_validation() {
        let (engine, root) = setup();
        let mut invalid = policy("broken", root.id);
        invalid.common_name_regex = "host-(".into();
        assert!(matches!(
            engine.create_template(invalid, &ca_actor()),
            Err(CaError::Validation { field, .. }) if field == "commonNameRegex"
        ));

        engine.create_template(policy("dup", root.id), &ca_actor()).unwrap();
        assert!(matches!(
            engine.create_template(policy("dup", root.id), &ca_actor()),
            Err(CaError::AlreadyExists { .. })
        ));

        let basic = Actor::new("bob", Role::Basic, Some("Acme"));
        assert_eq!(
            engine.create_template(policy("basic", root.id), &basic),
            Err(CaError::Forbidden)
        );

        let outsider = Actor::new("dave", Role::Ca, Some("Other"));
        assert_eq!(
            engine.create_template(policy("outsider", root.id), &outsider),
            Err(CaError::Forbidden)
        );
    }

    #[test]
    fn test_max_validity_is_bounded() {
        let (engine, root) = setup();
        for days in [MAX_VALIDITY_DAYS + 1, u32::MAX] {
            let mut endless = policy("endless", root.id);
            endless.max_validity_days = days;
            assert!(matches!(
                engine.create_template(endless, &ca_actor()),
                Err(CaError::Validation { field, .. }) if field == "maxValidityDays"
            ));
        }
        assert!(engine.list_templates(&ca_actor()).unwrap().is_empty());

        let template = engine.create_template(policy("web", root.id), &ca_actor()).unwrap();
        let mut endless = policy("web", root.id);
        endless.max_validity_days = u32::MAX;
        assert!(matches!(
            engine.update_template(template.id, endless, &ca_actor()),
            Err(CaError::Validation { field, .. }) if field == "maxValidityDays"
        ));

        let mut longest = policy("longest", root.id);
        longest.max_validity_days = MAX_VALIDITY_DAYS;
        let longest = engine.create_template(longest, &ca_actor()).unwrap();
        let request = engine.apply_template(longest.id, dn("host-1"), vec![]).unwrap();
        assert_eq!(request.validity.duration(), Duration::days(i64::from(MAX_VALIDITY_DAYS)));
    }

    #[test]
    fn test_update_replaces_cached_patterns() {
        let (engine, root) = setup();
        let template = engine.create_template(policy("web", root.id), &ca_actor()).unwrap();
        assert!(engine.apply_template(template.id, dn("host-1"), vec![]).is_ok());

        let mut stricter = policy("web", root.id);
        stricter.common_name_regex = "^db-[0-9]+$".into();
        engine.update_template(template.id, stricter, &ca_actor()).unwrap();
        assert!(engine.apply_template(template.id, dn("host-1"), vec![]).is_err());

        let other = Actor::new("erin", Role::Ca, Some("Acme"));
        assert_eq!(engine.delete_template(template.id, &other), Err(CaError::Forbidden));
        engine.delete_template(template.id, &ca_actor()).unwrap();
        assert!(matches!(
            engine.apply_template(template.id, dn("db-1"), vec![]),
            Err(CaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_check_issuance_is_authoritative() {
        let (engine, root) = setup();
        let template = engine.create_template(policy("web", root.id), &ca_actor()).unwrap();
        let ok = Validity::for_days(30).unwrap();
        assert!(engine
            .check_issuance(template.id, root.id, CertificateType::EndEntity, "host-7", &[], &ok)
            .is_ok());
        assert!(matches!(
            engine.check_issuance(template.id, root.id, CertificateType::EndEntity, "bad host", &[], &ok),
            Err(CaError::PatternMismatch { .. })
        ));
        assert!(engine
            .check_issuance(template.id, root.id, CertificateType::Intermediate, "host-7", &[], &ok)
            .is_err());
        assert!(engine
            .check_issuance(
                template.id,
                root.id,
                CertificateType::EndEntity,
                "host-7",
                &[],
                &Validity::for_days(91).unwrap()
            )
            .is_err());
    }
}
