use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use dashmap::DashMap;
use der::zeroize::Zeroizing;
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::error::{CaError, Result};
use crate::key::{KeyAlgorithm, KeyPair, PublicKey};
use crate::model::CertificateId;
use crate::store::{io_error, write_file};

/// Holds the private keys of CA certificates.
///
/// Keys go in through [`KeyMaterialProvider::generate`] and are only ever
/// used through [`KeyMaterialProvider::with_signing_key`]; nothing hands a
/// key pair back out. With a [`KeyVault`] attached every registered key is
/// also sealed to disk.
pub struct KeyMaterialProvider {
    algorithm: KeyAlgorithm,
    keys: DashMap<CertificateId, Arc<KeyPair>>,
    vault: Option<KeyVault>,
}

/// A generated key that is not yet bound to a stored certificate.
pub struct PendingKey {
    key: KeyPair,
}

impl PendingKey {
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_key_pair(&self.key)
    }
}

impl KeyMaterialProvider {
    pub fn new(algorithm: KeyAlgorithm) -> Self {
        Self {
            algorithm,
            keys: DashMap::new(),
            vault: None,
        }
    }

    /// A provider backed by `vault`, starting with every key it holds.
    pub fn with_vault(algorithm: KeyAlgorithm, vault: KeyVault) -> Result<Self> {
        let keys = DashMap::new();
        for (id, key) in vault.load_all()? {
            keys.insert(id, Arc::new(key));
        }
        info!(keys = keys.len(), dir = %vault.dir.display(), "loaded CA keys from vault");
        Ok(Self {
            algorithm,
            keys,
            vault: Some(vault),
        })
    }

    /// Generates a fresh key pair with the configured algorithm.
    pub fn generate(&self) -> Result<PendingKey> {
        let key = KeyPair::generate(self.algorithm)?;
        debug!(algorithm = ?self.algorithm, "generated CA key pair");
        Ok(PendingKey { key })
    }

    /// Binds a generated key to the certificate it was certified under.
    pub fn register(&self, id: CertificateId, pending: PendingKey) -> Result<()> {
        match self.keys.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CaError::Storage(format!(
                "a key is already registered for certificate {id}"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if let Some(vault) = &self.vault {
                    vault.store(id, &pending.key)?;
                }
                slot.insert(Arc::new(pending.key));
                Ok(())
            }
        }
    }

    /// Drops the key of a certificate that failed to commit.
    pub fn discard(&self, id: CertificateId) {
        self.keys.remove(&id);
        if let Some(vault) = &self.vault {
            if let Err(e) = vault.remove(id) {
                warn!(certificate = %id, error = %e, "failed to delete sealed key");
            }
        }
    }

    pub fn contains(&self, id: CertificateId) -> bool {
        self.keys.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Ids of every held key, ascending.
    pub fn ids(&self) -> Vec<CertificateId> {
        let mut ids: Vec<CertificateId> = self.keys.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn public_key(&self, id: CertificateId) -> Result<PublicKey> {
        self.with_signing_key(id, |key| Ok(PublicKey::from_key_pair(key)))
    }

    /// Runs `f` with the signing key of certificate `id`.
    ///
    /// The map guard is released before `f` runs so long signatures do not
    /// block other shards.
    pub fn with_signing_key<T>(
        &self,
        id: CertificateId,
        f: impl FnOnce(&KeyPair) -> Result<T>,
    ) -> Result<T> {
        let key = self
            .keys
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CaError::not_found("Signing key", id))?;
        f(&key)
    }
}

const VAULT_HEADER: &[u8] = b"PKI-AUTHORITY-VAULT-V1\0";
const KEY_HEADER: &[u8] = b"PKI-AUTHORITY-KEY-V1\0";
const VAULT_FILE: &str = "vault.meta";
const KEY_EXTENSION: &str = "key";
const SALT_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
/// Sealed into the vault header; opening it proves the passphrase.
const VERIFIER: &[u8] = b"pki-authority key vault";

/// CA private keys encrypted at rest.
///
/// The master key is derived once per process with PBKDF2-HMAC-SHA256 from
/// the passphrase and the salt kept in `vault.meta`. Each key is stored as
/// PKCS#8 in `<id>.key`, sealed with AES-256-GCM under a fresh 96-bit nonce
/// and bound to its certificate id through the associated data.
///
/// ```text
/// vault.meta  header | iterations (u32 BE) | salt (32) | nonce (12) | sealed verifier
/// <id>.key    header | nonce (12) | sealed PKCS#8 + tag (16)
/// ```
pub struct KeyVault {
    dir: PathBuf,
    cipher: Aes256Gcm,
}

impl KeyVault {
    /// Opens the vault in `dir`, creating it on first use. A wrong
    /// passphrase fails with [`CaError::Config`].
    pub fn open(dir: impl Into<PathBuf>, passphrase: &str, iterations: u32) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(CaError::Config("key vault passphrase must not be empty".into()));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
        let meta = dir.join(VAULT_FILE);
        match fs::read(&meta) {
            Ok(bytes) => Self::unlock(dir, &bytes, passphrase),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Self::create(dir, &meta, passphrase, iterations)
            }
            Err(e) => Err(io_error(&meta, e)),
        }
    }

    fn create(dir: PathBuf, meta: &Path, passphrase: &str, iterations: u32) -> Result<Self> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let vault = Self {
            cipher: derive_cipher(passphrase, &salt, iterations),
            dir,
        };
        let sealed = vault.seal(VERIFIER, VAULT_HEADER)?;

        let mut header = Vec::with_capacity(VAULT_HEADER.len() + 4 + SALT_SIZE + sealed.len());
        header.extend_from_slice(VAULT_HEADER);
        header.extend_from_slice(&iterations.to_be_bytes());
        header.extend_from_slice(&salt);
        header.extend_from_slice(&sealed);
        write_file(meta, &header)?;
        info!(dir = %vault.dir.display(), iterations, "created key vault");
        Ok(vault)
    }

    fn unlock(dir: PathBuf, bytes: &[u8], passphrase: &str) -> Result<Self> {
        let rest = bytes
            .strip_prefix(VAULT_HEADER)
            .ok_or_else(|| CaError::Config("key vault header is not recognized".into()))?;
        if rest.len() < 4 + SALT_SIZE + NONCE_SIZE {
            return Err(CaError::Config("key vault header is truncated".into()));
        }
        let (iterations, rest) = rest.split_at(4);
        let iterations = u32::from_be_bytes(
            <[u8; 4]>::try_from(iterations)
                .map_err(|_| CaError::Config("key vault header is truncated".into()))?,
        );
        let (salt, sealed) = rest.split_at(SALT_SIZE);
        let vault = Self {
            cipher: derive_cipher(passphrase, salt, iterations),
            dir,
        };
        match vault.open_sealed(sealed, VAULT_HEADER) {
            Ok(verifier) if verifier == VERIFIER => {
                debug!(dir = %vault.dir.display(), "unlocked key vault");
                Ok(vault)
            }
            _ => Err(CaError::Config("wrong key vault passphrase".into())),
        }
    }

    /// Seals the key of certificate `id` to disk.
    pub fn store(&self, id: CertificateId, key: &KeyPair) -> Result<()> {
        let document = key.export_pkcs8_der()?;
        let sealed = self.seal(document.as_bytes(), &id.0.to_be_bytes())?;
        let mut bytes = Vec::with_capacity(KEY_HEADER.len() + sealed.len());
        bytes.extend_from_slice(KEY_HEADER);
        bytes.extend_from_slice(&sealed);
        write_file(&self.key_path(id), &bytes)?;
        debug!(certificate = %id, algorithm = ?key.algorithm(), "sealed CA key");
        Ok(())
    }

    pub fn remove(&self, id: CertificateId) -> Result<()> {
        let path = self.key_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Decrypts every stored key. A file that fails authentication aborts
    /// the load.
    pub fn load_all(&self) -> Result<Vec<(CertificateId, KeyPair)>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))? {
            let path = entry.map_err(|e| io_error(&self.dir, e))?.path();
            if path.extension() != Some(OsStr::new(KEY_EXTENSION)) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(OsStr::to_str)
                .and_then(|stem| stem.parse().ok())
                .map(CertificateId)
            else {
                warn!(path = %path.display(), "ignoring unrecognized key file");
                continue;
            };
            keys.push((id, self.load(id, &path)?));
        }
        keys.sort_by_key(|(id, _)| *id);
        Ok(keys)
    }

    fn load(&self, id: CertificateId, path: &Path) -> Result<KeyPair> {
        let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
        let sealed = bytes
            .strip_prefix(KEY_HEADER)
            .ok_or_else(|| CaError::Storage(format!("{} is not a sealed key", path.display())))?;
        let document = Zeroizing::new(self.open_sealed(sealed, &id.0.to_be_bytes()).map_err(
            |_| CaError::Storage(format!("{} failed authentication", path.display())),
        )?);
        KeyPair::import_from_pkcs8_der(&document)
    }

    fn key_path(&self, id: CertificateId) -> PathBuf {
        self.dir.join(format!("{id}.{KEY_EXTENSION}"))
    }

    /// `nonce || ciphertext || tag`
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CaError::Crypto("AES-GCM sealing failed".into()))?;
        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open_sealed(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(CaError::Crypto("sealed data is truncated".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CaError::Crypto("AES-GCM authentication failed".into()))
    }
}

fn derive_cipher(passphrase: &str, salt: &[u8], iterations: u32) -> Aes256Gcm {
    let mut master = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut master[..]);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&master[..]))
}
