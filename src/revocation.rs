use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::crl::{Crl, CrlEntry, build_crl};
use crate::error::{CaError, Result};
use crate::keystore::KeyMaterialProvider;
use crate::model::{
    Actor, CertificateId, CertificateRecord, CertificateStatus, CertificateType, RevocationReason,
    RevocationRecord, Role,
};
use crate::store::CertificateStore;

/// Records revocations and produces per-issuer CRLs.
pub struct RevocationRegistry {
    store: Arc<dyn CertificateStore>,
    keys: Arc<KeyMaterialProvider>,
    crl_validity: Duration,
}

impl RevocationRegistry {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        keys: Arc<KeyMaterialProvider>,
        crl_validity_days: u32,
    ) -> Self {
        Self {
            store,
            keys,
            crl_validity: Duration::days(i64::from(crl_validity_days)),
        }
    }

    /// Revokes one certificate on behalf of `actor`.
    ///
    /// Checks run in this order: existence, root protection, authorization,
    /// current status. Only the target record is written.
    ///
    /// Non-admin actors may only revoke certificates that are currently
    /// VALID; an ADMIN may also revoke an expired one.
    pub fn revoke(
        &self,
        id: CertificateId,
        reason: RevocationReason,
        actor: &Actor,
    ) -> Result<CertificateRecord> {
        let record = self.store.get(id)?;
        if record.certificate_type == CertificateType::Root && !actor.is_admin() {
            warn!(certificate = %id, actor = %actor.id, role = ?actor.role, "non-admin attempted to revoke a root");
            return Err(CaError::CannotRevokeRoot);
        }
        if !may_revoke(&record, actor) {
            warn!(certificate = %id, actor = %actor.id, role = ?actor.role, "revocation not permitted");
            return Err(CaError::Forbidden);
        }

        let now = OffsetDateTime::now_utc();
        if !actor.is_admin() {
            match record.status_at(now) {
                CertificateStatus::Valid => {}
                CertificateStatus::Revoked => return Err(CaError::AlreadyRevoked),
                CertificateStatus::Expired => {
                    warn!(certificate = %id, actor = %actor.id, "non-admin attempted to revoke an expired certificate");
                    return Err(CaError::validation("status", "only VALID certificates can be revoked"));
                }
            }
        }

        let revocation = RevocationRecord {
            reason,
            revoked_at: now.replace_nanosecond(0).unwrap_or(now),
        };
        let revoked = self.store.mark_revoked(id, revocation)?;
        info!(
            certificate = %id,
            serial = %revoked.serial_number,
            reason = %reason,
            actor = %actor.id,
            "certificate revoked"
        );
        Ok(revoked)
    }

    /// Revoked certificates directly under `issuer_id`, sorted by serial.
    pub fn revoked_under(&self, issuer_id: CertificateId) -> Result<Vec<CrlEntry>> {
        Ok(revoked_entries(&self.store.snapshot()?, issuer_id))
    }

    /// Builds and signs a CRL for `issuer_id` from one store snapshot.
    ///
    /// The CRL number is the number of revocations recorded under the
    /// issuer, so it grows with every revocation and repeats for an
    /// unchanged revocation state.
    pub fn generate_crl(&self, issuer_id: CertificateId) -> Result<Crl> {
        let snapshot = self.store.snapshot()?;
        let issuer = snapshot
            .iter()
            .find(|record| record.id == issuer_id)
            .ok_or_else(|| CaError::not_found("Certificate", issuer_id))?;
        if !issuer.can_sign_certificates() {
            return Err(CaError::IssuerNotEligible(format!(
                "certificate {issuer_id} does not sign CRLs"
            )));
        }

        let entries = revoked_entries(&snapshot, issuer_id);
        let this_update = OffsetDateTime::now_utc()
            .replace_nanosecond(0)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let next_update = this_update
            .checked_add(self.crl_validity)
            .ok_or_else(|| CaError::Config("CRL validity reaches past the supported date range".into()))?;
        let crl = self.keys.with_signing_key(issuer_id, |key| {
            build_crl(
                &issuer.subject,
                key,
                entries.len() as u64,
                this_update,
                next_update,
                &entries,
            )
        })?;
        info!(issuer = %issuer_id, entries = entries.len(), crl_number = crl.number, "generated CRL");
        Ok(crl)
    }

    /// Same as [`generate_crl`](Self::generate_crl), addressed by the
    /// issuer's serial number.
    pub fn generate_crl_for_serial(&self, issuer_serial: &str) -> Result<Crl> {
        let issuer = self
            .store
            .find_by_serial(issuer_serial)?
            .ok_or_else(|| CaError::not_found("Certificate", issuer_serial))?;
        self.generate_crl(issuer.id)
    }
}

fn may_revoke(record: &CertificateRecord, actor: &Actor) -> bool {
    match actor.role {
        Role::Admin => true,
        Role::Basic => {
            record.owner.id == actor.id && record.certificate_type == CertificateType::EndEntity
        }
        Role::Ca => {
            record.owner.id == actor.id
                || (actor.organization.is_some()
                    && record.owner.organization == actor.organization
                    && record.certificate_type != CertificateType::Root)
        }
    }
}

fn revoked_entries(snapshot: &[CertificateRecord], issuer_id: CertificateId) -> Vec<CrlEntry> {
    let mut entries: Vec<CrlEntry> = snapshot
        .iter()
        .filter(|record| record.issuer_id == Some(issuer_id))
        .filter_map(|record| {
            record.revocation.map(|revocation| CrlEntry {
                serial_number: record.serial_number.clone(),
                revoked_at: revocation.revoked_at,
                reason: revocation.reason,
            })
        })
        .collect();
    entries.sort_by(|a, b| {
        a.serial_number
            .len()
            .cmp(&b.serial_number.len())
            .then_with(|| a.serial_number.cmp(&b.serial_number))
    });
    entries
}
