//! Persistence seams for certificates and templates, with in-memory and
//! JSON-file implementations.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CaError, Result};
use crate::model::{CertificateId, CertificateRecord, RevocationRecord};
use crate::template::{CertificateTemplate, TemplateId};

/// Certificate store.
///
/// `insert` is the single commit point of an issuance: it either stores the
/// complete record or nothing. Implementations must reject a serial number
/// that is already present with [`CaError::SerialCollision`].
pub trait CertificateStore: Send + Sync {
    /// Reserves the next identifier. Identifiers are never reused.
    fn allocate_id(&self) -> CertificateId;

    fn insert(&self, record: CertificateRecord) -> Result<()>;

    fn get(&self, id: CertificateId) -> Result<CertificateRecord>;

    /// Case-insensitive hex match.
    fn find_by_serial(&self, serial_number: &str) -> Result<Option<CertificateRecord>>;

    fn contains_serial(&self, serial_number: &str) -> Result<bool>;

    /// Every stored record, ordered by id, read under one lock.
    fn snapshot(&self) -> Result<Vec<CertificateRecord>>;

    /// Sets the revocation fields of one record; fails with
    /// [`CaError::AlreadyRevoked`] without touching it if already set.
    fn mark_revoked(&self, id: CertificateId, revocation: RevocationRecord) -> Result<CertificateRecord>;
}

#[derive(Default)]
struct CertificateTables {
    records: BTreeMap<CertificateId, CertificateRecord>,
    by_serial: HashMap<String, CertificateId>,
}

impl CertificateTables {
    fn admit(&self, record: &CertificateRecord) -> Result<()> {
        let serial = record.serial_number.to_ascii_uppercase();
        if self.by_serial.contains_key(&serial) {
            debug!(serial = %serial, "serial number already present");
            return Err(CaError::SerialCollision);
        }
        if self.records.contains_key(&record.id) {
            return Err(CaError::Storage(format!(
                "certificate id {} already stored",
                record.id
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCertificateStore {
    next_id: AtomicU64,
    tables: RwLock<CertificateTables>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    fn raise_next_id(&self, floor: u64) {
        self.next_id.fetch_max(floor, Ordering::SeqCst);
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn allocate_id(&self) -> CertificateId {
        CertificateId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn insert(&self, record: CertificateRecord) -> Result<()> {
        let mut tables = self.tables.write();
        tables.admit(&record)?;
        tables
            .by_serial
            .insert(record.serial_number.to_ascii_uppercase(), record.id);
        tables.records.insert(record.id, record);
        Ok(())
    }

    fn get(&self, id: CertificateId) -> Result<CertificateRecord> {
        self.tables
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or_else(|| CaError::not_found("Certificate", id))
    }

    fn find_by_serial(&self, serial_number: &str) -> Result<Option<CertificateRecord>> {
        let tables = self.tables.read();
        Ok(tables
            .by_serial
            .get(&serial_number.to_ascii_uppercase())
            .and_then(|id| tables.records.get(id))
            .cloned())
    }

    fn contains_serial(&self, serial_number: &str) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .by_serial
            .contains_key(&serial_number.to_ascii_uppercase()))
    }

    fn snapshot(&self) -> Result<Vec<CertificateRecord>> {
        Ok(self.tables.read().records.values().cloned().collect())
    }

    fn mark_revoked(&self, id: CertificateId, revocation: RevocationRecord) -> Result<CertificateRecord> {
        let mut tables = self.tables.write();
        let record = tables
            .records
            .get_mut(&id)
            .ok_or_else(|| CaError::not_found("Certificate", id))?;
        if record.revocation.is_some() {
            return Err(CaError::AlreadyRevoked);
        }
        record.revocation = Some(revocation);
        Ok(record.clone())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateSnapshot {
    next_id: u64,
    certificates: Vec<CertificateRecord>,
}

/// Certificate store persisted as one JSON snapshot file.
///
/// Every mutation rewrites the snapshot before it is applied in memory, so a
/// failed write leaves both the file and the store unchanged. Reads are
/// served from memory.
pub struct FileCertificateStore {
    path: PathBuf,
    memory: MemoryCertificateStore,
    writer: Mutex<()>,
}

impl FileCertificateStore {
    /// Loads `path` if it exists; a missing file starts an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let memory = MemoryCertificateStore::new();
        if let Some(snapshot) = read_snapshot::<CertificateSnapshot>(&path)? {
            let highest = snapshot.certificates.iter().map(|r| r.id.0).max().unwrap_or(0);
            for record in snapshot.certificates {
                memory.insert(record)?;
            }
            memory.raise_next_id(snapshot.next_id.max(highest));
        }
        info!(path = %path.display(), certificates = memory.tables.read().records.len(), "opened certificate store");
        Ok(Self {
            path,
            memory,
            writer: Mutex::new(()),
        })
    }

    fn persist(&self, certificates: Vec<CertificateRecord>) -> Result<()> {
        let snapshot = CertificateSnapshot {
            next_id: self.memory.next_id(),
            certificates,
        };
        write_snapshot(&self.path, &snapshot)
    }
}

impl CertificateStore for FileCertificateStore {
    fn allocate_id(&self) -> CertificateId {
        self.memory.allocate_id()
    }

    fn insert(&self, record: CertificateRecord) -> Result<()> {
        let _writer = self.writer.lock();
        self.memory.tables.read().admit(&record)?;
        let mut certificates = self.memory.snapshot()?;
        certificates.push(record.clone());
        self.persist(certificates)?;
        self.memory.insert(record)
    }

    fn get(&self, id: CertificateId) -> Result<CertificateRecord> {
        self.memory.get(id)
    }

    fn find_by_serial(&self, serial_number: &str) -> Result<Option<CertificateRecord>> {
        self.memory.find_by_serial(serial_number)
    }

    fn contains_serial(&self, serial_number: &str) -> Result<bool> {
        self.memory.contains_serial(serial_number)
    }

    fn snapshot(&self) -> Result<Vec<CertificateRecord>> {
        self.memory.snapshot()
    }

    fn mark_revoked(&self, id: CertificateId, revocation: RevocationRecord) -> Result<CertificateRecord> {
        let _writer = self.writer.lock();
        let mut certificates = self.memory.snapshot()?;
        let record = certificates
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CaError::not_found("Certificate", id))?;
        if record.revocation.is_some() {
            return Err(CaError::AlreadyRevoked);
        }
        record.revocation = Some(revocation);
        self.persist(certificates)?;
        self.memory.mark_revoked(id, revocation)
    }
}

/// Template store. Names are unique; `insert` and `update` enforce it.
pub trait TemplateStore: Send + Sync {
    fn allocate_id(&self) -> TemplateId;

    fn insert(&self, template: CertificateTemplate) -> Result<()>;

    fn update(&self, template: CertificateTemplate) -> Result<()>;

    fn remove(&self, id: TemplateId) -> Result<CertificateTemplate>;

    fn get(&self, id: TemplateId) -> Result<CertificateTemplate>;

    fn list(&self) -> Result<Vec<CertificateTemplate>>;
}

#[derive(Default)]
pub struct MemoryTemplateStore {
    next_id: AtomicU64,
    templates: RwLock<BTreeMap<TemplateId, CertificateTemplate>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `replacing` requires the id to exist and ignores its current name.
    fn admit(
        templates: &BTreeMap<TemplateId, CertificateTemplate>,
        template: &CertificateTemplate,
        replacing: bool,
    ) -> Result<()> {
        if replacing && !templates.contains_key(&template.id) {
            return Err(CaError::not_found("Template", template.id));
        }
        let taken = templates.values().any(|t| {
            (!replacing || t.id != template.id) && t.name.eq_ignore_ascii_case(&template.name)
        });
        if taken {
            return Err(CaError::AlreadyExists {
                entity: "Template".into(),
                name: template.name.clone(),
            });
        }
        Ok(())
    }
}

impl TemplateStore for MemoryTemplateStore {
    fn allocate_id(&self) -> TemplateId {
        TemplateId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn insert(&self, template: CertificateTemplate) -> Result<()> {
        let mut templates = self.templates.write();
        Self::admit(&templates, &template, false)?;
        templates.insert(template.id, template);
        Ok(())
    }

    fn update(&self, template: CertificateTemplate) -> Result<()> {
        let mut templates = self.templates.write();
        Self::admit(&templates, &template, true)?;
        templates.insert(template.id, template);
        Ok(())
    }

    fn remove(&self, id: TemplateId) -> Result<CertificateTemplate> {
        self.templates
            .write()
            .remove(&id)
            .ok_or_else(|| CaError::not_found("Template", id))
    }

    fn get(&self, id: TemplateId) -> Result<CertificateTemplate> {
        self.templates
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CaError::not_found("Template", id))
    }

    fn list(&self) -> Result<Vec<CertificateTemplate>> {
        Ok(self.templates.read().values().cloned().collect())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateSnapshot {
    next_id: u64,
    templates: Vec<CertificateTemplate>,
}

/// Template store persisted as one JSON snapshot file, written before each
/// change is applied in memory.
pub struct FileTemplateStore {
    path: PathBuf,
    memory: MemoryTemplateStore,
    writer: Mutex<()>,
}

impl FileTemplateStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let memory = MemoryTemplateStore::new();
        if let Some(snapshot) = read_snapshot::<TemplateSnapshot>(&path)? {
            let highest = snapshot.templates.iter().map(|t| t.id.0).max().unwrap_or(0);
            for template in snapshot.templates {
                memory.insert(template)?;
            }
            memory.next_id.fetch_max(snapshot.next_id.max(highest), Ordering::SeqCst);
        }
        info!(path = %path.display(), templates = memory.templates.read().len(), "opened template store");
        Ok(Self {
            path,
            memory,
            writer: Mutex::new(()),
        })
    }

    fn persist(&self, templates: Vec<CertificateTemplate>) -> Result<()> {
        let snapshot = TemplateSnapshot {
            next_id: self.memory.next_id.load(Ordering::SeqCst),
            templates,
        };
        write_snapshot(&self.path, &snapshot)
    }
}

impl TemplateStore for FileTemplateStore {
    fn allocate_id(&self) -> TemplateId {
        self.memory.allocate_id()
    }

    fn insert(&self, template: CertificateTemplate) -> Result<()> {
        let _writer = self.writer.lock();
        MemoryTemplateStore::admit(&self.memory.templates.read(), &template, false)?;
        let mut templates = self.memory.list()?;
        templates.push(template.clone());
        self.persist(templates)?;
        self.memory.insert(template)
    }

    fn update(&self, template: CertificateTemplate) -> Result<()> {
        let _writer = self.writer.lock();
        MemoryTemplateStore::admit(&self.memory.templates.read(), &template, true)?;
        let templates = self
            .memory
            .list()?
            .into_iter()
            .map(|t| if t.id == template.id { template.clone() } else { t })
            .collect();
        self.persist(templates)?;
        self.memory.update(template)
    }

    fn remove(&self, id: TemplateId) -> Result<CertificateTemplate> {
        let _writer = self.writer.lock();
        let mut templates = self.memory.list()?;
        let Some(position) = templates.iter().position(|t| t.id == id) else {
            return Err(CaError::not_found("Template", id));
        };
        templates.remove(position);
        self.persist(templates)?;
        self.memory.remove(id)
    }

    fn get(&self, id: TemplateId) -> Result<CertificateTemplate> {
        self.memory.get(id)
    }

    fn list(&self) -> Result<Vec<CertificateTemplate>> {
        self.memory.list()
    }
}

fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CaError::Storage(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}

fn write_snapshot<T: Serialize>(path: &Path, snapshot: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| CaError::Storage(format!("{}: {e}", path.display())))?;
    write_file(path, &bytes)
}

/// Writes through a temporary file and a rename so readers never see a
/// partial file.
pub(crate) fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = path.with_extension("tmp");
    let mut file = File::create(&temp).map_err(|e| io_error(&temp, e))?;
    file.write_all(bytes).map_err(|e| io_error(&temp, e))?;
    file.sync_all().map_err(|e| io_error(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| io_error(path, e))
}

pub(crate) fn io_error(path: &Path, err: io::Error) -> CaError {
    CaError::Storage(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::extensions::BasicConstraints;
    use crate::cert::params::{DistinguishedName, Validity};
    use crate::model::{CertificateType, Owner, RevocationReason};
    use time::OffsetDateTime;

    fn record(store: &dyn CertificateStore, serial: &str) -> CertificateRecord {
        CertificateRecord {
            id: store.allocate_id(),
            serial_number: serial.to_string(),
            certificate_type: CertificateType::EndEntity,
            subject: DistinguishedName::default(),
            issuer_dn: DistinguishedName::default(),
            issuer_id: None,
            validity: Validity::for_days(1).unwrap(),
            basic_constraints: BasicConstraints::end_entity(),
            key_usage: Default::default(),
            extended_key_usage: Default::default(),
            subject_alt_names: Vec::new(),
            revocation: None,
            owner: Owner {
                id: "alice".into(),
                organization: None,
            },
            template_id: None,
            der: vec![0x30, 0x00],
        }
    }

    fn template(id: TemplateId, name: &str) -> CertificateTemplate {
        CertificateTemplate {
            id,
            name: name.to_string(),
            description: None,
            ca_issuer_id: CertificateId(1),
            common_name_regex: "^host-[0-9]+$".into(),
            sans_regex: None,
            max_validity_days: 30,
            key_usage: Default::default(),
            extended_key_usage: "serverAuth, clientAuth".parse().unwrap(),
            basic_constraints: BasicConstraints::end_entity(),
            created_by: "carol".into(),
            created_at: OffsetDateTime::now_utc().replace_nanosecond(0).unwrap(),
        }
    }

    #[test]
    fn test_serial_uniqueness_and_lookup() {
        let store = MemoryCertificateStore::new();
        let first = record(&store, "0A1B");
        store.insert(first.clone()).unwrap();
        assert_eq!(store.insert(record(&store, "0a1b")), Err(CaError::SerialCollision));
        assert_eq!(store.find_by_serial("0a1b").unwrap(), Some(first));
        assert!(store.find_by_serial("FFFF").unwrap().is_none());
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_mark_revoked_is_one_way() {
        let store = MemoryCertificateStore::new();
        let r = record(&store, "01");
        store.insert(r.clone()).unwrap();
        let revocation = RevocationRecord {
            reason: RevocationReason::KeyCompromise,
            revoked_at: OffsetDateTime::now_utc(),
        };
        let revoked = store.mark_revoked(r.id, revocation).unwrap();
        assert_eq!(revoked.revocation, Some(revocation));
        let again = RevocationRecord {
            reason: RevocationReason::Superseded,
            ..revocation
        };
        assert_eq!(store.mark_revoked(r.id, again), Err(CaError::AlreadyRevoked));
        assert_eq!(store.get(r.id).unwrap().revocation, Some(revocation));
        assert!(matches!(
            store.mark_revoked(CertificateId(99), revocation),
            Err(CaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certificates.json");
        let store = FileCertificateStore::open(&path).unwrap();
        let first = record(&store, "0A1B");
        store.insert(first.clone()).unwrap();
        let second = record(&store, "0C");
        store.insert(second.clone()).unwrap();
        assert_eq!(store.insert(record(&store, "0a1b")), Err(CaError::SerialCollision));
        let revocation = RevocationRecord {
            reason: RevocationReason::Superseded,
            revoked_at: OffsetDateTime::now_utc().replace_nanosecond(0).unwrap(),
        };
        store.mark_revoked(second.id, revocation).unwrap();
        drop(store);

        let reopened = FileCertificateStore::open(&path).unwrap();
        assert_eq!(reopened.get(first.id).unwrap(), first);
        assert_eq!(reopened.find_by_serial("0c").unwrap().unwrap().revocation, Some(revocation));
        assert_eq!(
            reopened.mark_revoked(second.id, revocation),
            Err(CaError::AlreadyRevoked)
        );
        assert!(reopened.allocate_id().0 > second.id.0);
    }

    #[test]
    fn test_file_store_write_failure_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("certificates.json");
        fs::create_dir(dir.path().join("state")).unwrap();
        let store = FileCertificateStore::open(&path).unwrap();
        store.insert(record(&store, "01")).unwrap();

        fs::remove_dir_all(dir.path().join("state")).unwrap();
        assert!(matches!(store.insert(record(&store, "02")), Err(CaError::Storage(_))));
        assert_eq!(store.snapshot().unwrap().len(), 1);
        assert!(!store.contains_serial("02").unwrap());
    }

    #[test]
    fn test_file_template_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.json");
        let store = FileTemplateStore::open(&path).unwrap();
        let web = template(store.allocate_id(), "web");
        store.insert(web.clone()).unwrap();
        let db = template(store.allocate_id(), "db");
        store.insert(db.clone()).unwrap();
        assert!(matches!(
            store.insert(template(store.allocate_id(), "WEB")),
            Err(CaError::AlreadyExists { .. })
        ));
        let renamed = CertificateTemplate {
            name: "web-servers".into(),
            ..web.clone()
        };
        store.update(renamed.clone()).unwrap();
        store.remove(db.id).unwrap();
        drop(store);

        let reopened = FileTemplateStore::open(&path).unwrap();
        assert_eq!(reopened.list().unwrap(), vec![renamed]);
        assert!(matches!(reopened.get(db.id), Err(CaError::NotFound { .. })));
        assert!(reopened.allocate_id().0 > db.id.0);
    }
}
