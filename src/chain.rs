//! Issuer eligibility, chain validity and chain trees.
//!
//! Everything here is computed from one store snapshot per call. Revoking a
//! certificate only ever writes that certificate; descendants become invalid
//! because their chain is re-walked on every query.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{CaError, Result};
use crate::model::{Actor, CertificateId, CertificateRecord, CertificateSummary, Role};
use crate::store::CertificateStore;

/// A certificate in the chain forest, with its issued children.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainNode {
    pub certificate: CertificateSummary,
    pub chain_valid: bool,
    pub children: Vec<ChainNode>,
}

impl ChainNode {
    /// Number of nodes in this subtree, including this one.
    pub fn subtree_size(&self) -> usize {
        1 + self.children.iter().map(ChainNode::subtree_size).sum::<usize>()
    }
}

/// Read-only view over the issuer graph of one snapshot.
pub(crate) struct ChainIndex {
    records: HashMap<CertificateId, CertificateRecord>,
}

impl ChainIndex {
    pub(crate) fn new(records: Vec<CertificateRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub(crate) fn get(&self, id: CertificateId) -> Result<&CertificateRecord> {
        self.records
            .get(&id)
            .ok_or_else(|| CaError::not_found("Certificate", id))
    }

    /// The certificate followed by its ancestors up to the root.
    pub(crate) fn path(&self, id: CertificateId) -> Result<Vec<&CertificateRecord>> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(id);
        while let Some(id) = current {
            if !seen.insert(id) {
                warn!(certificate = %id, "issuer graph contains a cycle");
                return Err(CaError::ChainCycle(id.0));
            }
            let record = self.get(id)?;
            current = record.issuer_id;
            path.push(record);
        }
        Ok(path)
    }

    pub(crate) fn is_chain_valid(&self, id: CertificateId, now: OffsetDateTime) -> Result<bool> {
        match self.path(id) {
            Ok(path) => Ok(path.iter().all(|record| record.is_usable_at(now))),
            // Fail closed: a looping chain anchors nothing.
            Err(CaError::ChainCycle(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// ADMIN sees everything, CA sees certificates whose chain contains a
    /// subject of its organization, BASIC sees what it owns.
    pub(crate) fn is_visible_to(&self, record: &CertificateRecord, actor: &Actor) -> bool {
        match actor.role {
            Role::Admin => true,
            Role::Basic => record.owner.id == actor.id,
            Role::Ca => {
                if record.owner.id == actor.id {
                    return true;
                }
                let Some(organization) = actor.organization.as_deref() else {
                    return false;
                };
                self.path(record.id)
                    .map(|path| {
                        path.iter()
                            .any(|r| r.subject.organization.as_deref() == Some(organization))
                    })
                    .unwrap_or(false)
            }
        }
    }

    pub(crate) fn visible(&self, actor: &Actor) -> Vec<&CertificateRecord> {
        let mut visible: Vec<_> = self
            .records
            .values()
            .filter(|record| self.is_visible_to(record, actor))
            .collect();
        visible.sort_by_key(|record| record.id);
        visible
    }

    /// Eligibility with a specific error for each way a certificate can
    /// fail to qualify as an issuer.
    pub(crate) fn require_eligible_issuer(
        &self,
        id: CertificateId,
        now: OffsetDateTime,
    ) -> Result<&CertificateRecord> {
        let issuer = self.get(id)?;
        if !issuer.can_sign_certificates() {
            return Err(CaError::IssuerNotEligible(format!(
                "certificate {id} is not a CA certificate"
            )));
        }
        for record in self.path(id)? {
            if record.is_revoked() {
                return Err(CaError::IssuerExpiredOrRevoked(format!(
                    "certificate {} in the chain of {id} is revoked",
                    record.id
                )));
            }
            if !record.validity.is_current_at(now) {
                return Err(CaError::IssuerExpiredOrRevoked(format!(
                    "certificate {} in the chain of {id} is outside its validity period",
                    record.id
                )));
            }
        }
        Ok(issuer)
    }
}

/// Answers trust questions about stored certificates.
#[derive(Clone)]
pub struct ChainValidator {
    store: Arc<dyn CertificateStore>,
}

impl ChainValidator {
    pub fn new(store: Arc<dyn CertificateStore>) -> Self {
        Self { store }
    }

    fn index(&self) -> Result<ChainIndex> {
        Ok(ChainIndex::new(self.store.snapshot()?))
    }

    /// Whether `issuer_id` may sign a new certificate right now.
    pub fn can_issue_from(&self, issuer_id: CertificateId) -> bool {
        self.require_eligible_issuer(issuer_id, OffsetDateTime::now_utc())
            .is_ok()
    }

    /// Returns the issuer record if it exists, is a CA, and it and every
    /// ancestor are unrevoked and inside their validity windows at `now`.
    pub fn require_eligible_issuer(
        &self,
        issuer_id: CertificateId,
        now: OffsetDateTime,
    ) -> Result<CertificateRecord> {
        let index = self.index()?;
        let issuer = index.require_eligible_issuer(issuer_id, now).map_err(|e| {
            debug!(issuer = %issuer_id, error = %e, "issuer rejected");
            e
        })?;
        Ok(issuer.clone())
    }

    /// True only if the certificate and every ancestor are unrevoked and
    /// unexpired.
    pub fn is_chain_valid(&self, id: CertificateId) -> Result<bool> {
        self.index()?.is_chain_valid(id, OffsetDateTime::now_utc())
    }

    /// The certificate followed by its ancestors, leaf first.
    pub fn chain_path(&self, id: CertificateId) -> Result<Vec<CertificateRecord>> {
        Ok(self.index()?.path(id)?.into_iter().cloned().collect())
    }

    pub fn visible_certificates(&self, actor: &Actor) -> Result<Vec<CertificateRecord>> {
        Ok(self.index()?.visible(actor).into_iter().cloned().collect())
    }

    pub fn is_visible(&self, id: CertificateId, actor: &Actor) -> Result<bool> {
        let index = self.index()?;
        let record = index.get(id)?;
        Ok(index.is_visible_to(record, actor))
    }

    /// CA certificates the actor may select as issuer. BASIC actors get none.
    pub fn eligible_issuers(&self, actor: &Actor) -> Result<Vec<CertificateRecord>> {
        if actor.role == Role::Basic {
            return Ok(Vec::new());
        }
        let index = self.index()?;
        let now = OffsetDateTime::now_utc();
        Ok(index
            .visible(actor)
            .into_iter()
            .filter(|record| index.require_eligible_issuer(record.id, now).is_ok())
            .cloned()
            .collect())
    }

    /// Forest of the certificates visible to `actor`.
    ///
    /// A visible certificate whose issuer is not visible becomes a root of
    /// the forest. Siblings are ordered by id. Any certificate that cannot
    /// be reached from a root sits on a cycle and fails the whole call.
    pub fn build_chain_tree(&self, actor: &Actor) -> Result<Vec<ChainNode>> {
        let index = self.index()?;
        let now = OffsetDateTime::now_utc();
        let visible = index.visible(actor);
        let visible_ids: HashSet<CertificateId> = visible.iter().map(|r| r.id).collect();

        let mut children: BTreeMap<CertificateId, Vec<&CertificateRecord>> = BTreeMap::new();
        let mut roots = Vec::new();
        for record in &visible {
            match record.issuer_id {
                Some(parent) if visible_ids.contains(&parent) && parent != record.id => {
                    children.entry(parent).or_default().push(*record)
                }
                Some(parent) if parent == record.id => {
                    warn!(certificate = %record.id, "certificate lists itself as issuer");
                    return Err(CaError::ChainCycle(record.id.0));
                }
                _ => roots.push(*record),
            }
        }

        let mut attached = HashSet::new();
        let forest = roots
            .into_iter()
            .map(|root| build_node(&index, root, &children, &mut attached, now))
            .collect::<Result<Vec<_>>>()?;

        if let Some(orphan) = visible.iter().find(|r| !attached.contains(&r.id)) {
            warn!(certificate = %orphan.id, "certificate unreachable from any root");
            return Err(CaError::ChainCycle(orphan.id.0));
        }
        Ok(forest)
    }
}

fn build_node(
    index: &ChainIndex,
    record: &CertificateRecord,
    children: &BTreeMap<CertificateId, Vec<&CertificateRecord>>,
    attached: &mut HashSet<CertificateId>,
    now: OffsetDateTime,
) -> Result<ChainNode> {
    if !attached.insert(record.id) {
        return Err(CaError::ChainCycle(record.id.0));
    }
    let nodes = children
        .get(&record.id)
        .map(|kids| {
            kids.iter()
                .map(|child| build_node(index, child, children, attached, now))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(ChainNode {
        certificate: record.summary(now),
        chain_valid: index.is_chain_valid(record.id, now)?,
        children: nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::extensions::BasicConstraints;
    use crate::cert::params::{DistinguishedName, Validity};
    use crate::model::{CertificateType, Owner, RevocationReason, RevocationRecord};
    use crate::store::MemoryCertificateStore;

    fn record(
        id: u64,
        issuer: Option<u64>,
        certificate_type: CertificateType,
        organization: &str,
        owner: &str,
    ) -> CertificateRecord {
        CertificateRecord {
            id: CertificateId(id),
            serial_number: format!("{id:02X}"),
            certificate_type,
            subject: DistinguishedName::builder()
                .common_name(format!("cert-{id}"))
                .organization(organization.to_string())
                .country("RS".to_string())
                .build(),
            issuer_dn: DistinguishedName::default(),
            issuer_id: issuer.map(CertificateId),
            validity: Validity::for_days(30).unwrap(),
            basic_constraints: if certificate_type.is_ca() {
                BasicConstraints::ca(None)
            } else {
                BasicConstraints::end_entity()
            },
            key_usage: Default::default(),
            extended_key_usage: Default::default(),
            subject_alt_names: Vec::new(),
            revocation: None,
            owner: Owner {
                id: owner.to_string(),
                organization: Some(organization.to_string()),
            },
            template_id: None,
            der: Vec::new(),
        }
    }

    fn validator(records: Vec<CertificateRecord>) -> (Arc<MemoryCertificateStore>, ChainValidator) {
        let store = Arc::new(MemoryCertificateStore::new());
        for r in records {
            store.insert(r).unwrap();
        }
        let validator = ChainValidator::new(store.clone());
        (store, validator)
    }

    fn admin() -> Actor {
        Actor::new("admin", Role::Admin, None)
    }

    #[test]
    fn test_tree_nests_root_intermediate_end_entity() {
        let (_, validator) = validator(vec![
            record(1, None, CertificateType::Root, "Acme", "admin"),
            record(2, Some(1), CertificateType::Intermediate, "Acme", "admin"),
            record(3, Some(2), CertificateType::EndEntity, "Acme", "alice"),
        ]);
        let forest = validator.build_chain_tree(&admin()).unwrap();
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].certificate.id, CertificateId(1));
        assert_eq!(forest[0].children.len(), 1);
        assert_eq!(forest[0].children[0].certificate.id, CertificateId(2));
        assert_eq!(forest[0].children[0].children[0].certificate.id, CertificateId(3));
        assert_eq!(forest[0].subtree_size(), 3);
    }

    #[test]
    fn test_revoked_ancestor_invalidates_descendants_only() {
        let (store, validator) = validator(vec![
            record(1, None, CertificateType::Root, "Acme", "admin"),
            record(2, Some(1), CertificateType::Intermediate, "Acme", "admin"),
            record(3, Some(2), CertificateType::EndEntity, "Acme", "alice"),
        ]);
        store
            .mark_revoked(
                CertificateId(2),
                RevocationRecord {
                    reason: RevocationReason::KeyCompromise,
                    revoked_at: OffsetDateTime::now_utc(),
                },
            )
            .unwrap();

        assert!(validator.is_chain_valid(CertificateId(1)).unwrap());
        assert!(!validator.is_chain_valid(CertificateId(2)).unwrap());
        assert!(!validator.is_chain_valid(CertificateId(3)).unwrap());
        assert!(store.get(CertificateId(3)).unwrap().revocation.is_none());
        assert!(!validator.can_issue_from(CertificateId(2)));
        assert!(matches!(
            validator.require_eligible_issuer(CertificateId(2), OffsetDateTime::now_utc()),
            Err(CaError::IssuerExpiredOrRevoked(_))
        ));
    }

    #[test]
    fn test_cycle_fails_closed() {
        let (_, validator) = validator(vec![
            record(1, Some(2), CertificateType::Intermediate, "Acme", "admin"),
            record(2, Some(1), CertificateType::Intermediate, "Acme", "admin"),
        ]);
        assert!(matches!(
            validator.chain_path(CertificateId(1)),
            Err(CaError::ChainCycle(_))
        ));
        assert!(!validator.is_chain_valid(CertificateId(1)).unwrap());
        assert!(matches!(
            validator.build_chain_tree(&admin()),
            Err(CaError::ChainCycle(_))
        ));
    }

    #[test]
    fn test_visibility_by_role() {
        let (_, validator) = validator(vec![
            record(1, None, CertificateType::Root, "Root Org", "admin"),
            record(2, Some(1), CertificateType::Intermediate, "Acme", "admin"),
            record(3, Some(2), CertificateType::EndEntity, "Acme", "alice"),
            record(4, Some(1), CertificateType::Intermediate, "Other", "admin"),
        ]);

        let ca = Actor::new("carol", Role::Ca, Some("Acme"));
        let ids: Vec<_> = validator
            .visible_certificates(&ca)
            .unwrap()
            .iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(ids, vec![2, 3]);

        let forest = validator.build_chain_tree(&ca).unwrap();
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].certificate.id, CertificateId(2));

        let basic = Actor::new("alice", Role::Basic, Some("Acme"));
        let ids: Vec<_> = validator
            .visible_certificates(&basic)
            .unwrap()
            .iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(ids, vec![3]);
        assert!(validator.eligible_issuers(&basic).unwrap().is_empty());

        let issuers: Vec<_> = validator
            .eligible_issuers(&ca)
            .unwrap()
            .iter()
            .map(|r| r.id.0)
            .collect();
        assert_eq!(issuers, vec![2]);
        assert_eq!(validator.eligible_issuers(&admin()).unwrap().len(), 3);
    }
}
