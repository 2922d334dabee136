//! Append-only audit trail of issuance, revocation and template changes.
//!
//! Every event carries the SHA-256 hash of its predecessor, so removing or
//! editing an entry breaks the chain from that point on. With a file
//! attached, events are appended as JSON lines and the chain is re-verified
//! when the file is opened.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::cert::hex_upper;
use crate::error::{CaError, Result};
use crate::model::{Actor, Role};
use crate::store::io_error;

/// `previous_hash` of the first event.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    IssueRoot,
    IssueIntermediate,
    IssueEndEntity,
    RevokeCertificate,
    CreateTemplate,
    UpdateTemplate,
    DeleteTemplate,
    UseTemplate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    /// Rejected by an authorization check.
    Denied,
    /// Rejected for any other reason.
    Failure,
}

impl AuditOutcome {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => AuditOutcome::Success,
            Err(CaError::Forbidden | CaError::CannotRevokeRoot) => AuditOutcome::Denied,
            Err(_) => AuditOutcome::Failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub actor_id: String,
    pub actor_role: Role,
    pub action: AuditAction,
    /// What the action addressed, such as `certificate:12` or `template:3`.
    pub target: String,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEvent {
    /// Uppercase hex SHA-256 over every other field, each length-prefixed.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let timestamp = self.timestamp.unix_timestamp_nanos().to_be_bytes();
        let fields: [&[u8]; 9] = [
            &self.sequence.to_be_bytes(),
            &timestamp,
            self.actor_id.as_bytes(),
            role_name(self.actor_role).as_bytes(),
            action_name(self.action).as_bytes(),
            self.target.as_bytes(),
            outcome_name(self.outcome).as_bytes(),
            self.detail.as_deref().unwrap_or("").as_bytes(),
            self.previous_hash.as_bytes(),
        ];
        for field in fields {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field);
        }
        hex_upper(&hasher.finalize())
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Admin => "ADMIN",
        Role::Ca => "CA",
        Role::Basic => "BASIC",
    }
}

fn action_name(action: AuditAction) -> &'static str {
    match action {
        AuditAction::IssueRoot => "ISSUE_ROOT",
        AuditAction::IssueIntermediate => "ISSUE_INTERMEDIATE",
        AuditAction::IssueEndEntity => "ISSUE_END_ENTITY",
        AuditAction::RevokeCertificate => "REVOKE_CERTIFICATE",
        AuditAction::CreateTemplate => "CREATE_TEMPLATE",
        AuditAction::UpdateTemplate => "UPDATE_TEMPLATE",
        AuditAction::DeleteTemplate => "DELETE_TEMPLATE",
        AuditAction::UseTemplate => "USE_TEMPLATE",
    }
}

fn outcome_name(outcome: AuditOutcome) -> &'static str {
    match outcome {
        AuditOutcome::Success => "SUCCESS",
        AuditOutcome::Denied => "DENIED",
        AuditOutcome::Failure => "FAILURE",
    }
}

/// Query filters. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub outcome: Option<AuditOutcome>,
    pub target: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.actor_id.as_ref().is_none_or(|id| *id == event.actor_id)
            && self.action.is_none_or(|action| action == event.action)
            && self.outcome.is_none_or(|outcome| outcome == event.outcome)
            && self.target.as_ref().is_none_or(|target| *target == event.target)
            && self.from.is_none_or(|from| event.timestamp >= from)
            && self.to.is_none_or(|to| event.timestamp <= to)
    }
}

/// One page of matching events, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPage {
    pub total: usize,
    pub events: Vec<AuditEvent>,
}

struct AuditState {
    events: Vec<AuditEvent>,
    file: Option<File>,
}

pub struct AuditLog {
    path: Option<PathBuf>,
    state: Mutex<AuditState>,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(AuditState {
                events: Vec::new(),
                file: None,
            }),
        }
    }

    /// Opens or creates the JSON-lines log at `path`. A broken chain fails
    /// with [`CaError::Storage`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let events = match File::open(&path) {
            Ok(file) => read_events(&path, file)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_error(&path, e)),
        };
        verify_chain(&events)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        info!(path = %path.display(), events = events.len(), "opened audit log");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(AuditState {
                events,
                file: Some(file),
            }),
        })
    }

    /// Appends one event. The file write happens before the event becomes
    /// visible to queries.
    pub fn record(
        &self,
        actor: &Actor,
        action: AuditAction,
        target: impl Into<String>,
        outcome: AuditOutcome,
        detail: Option<String>,
    ) -> Result<AuditEvent> {
        let mut state = self.state.lock();
        let (sequence, previous_hash) = match state.events.last() {
            Some(last) => (last.sequence + 1, last.hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };
        let now = OffsetDateTime::now_utc();
        let mut event = AuditEvent {
            sequence,
            timestamp: now.replace_nanosecond(0).unwrap_or(now),
            actor_id: actor.id.clone(),
            actor_role: actor.role,
            action,
            target: target.into(),
            outcome,
            detail,
            previous_hash,
            hash: String::new(),
        };
        event.hash = event.compute_hash();

        if let Some(file) = state.file.as_mut() {
            let mut line = serde_json::to_vec(&event)
                .map_err(|e| CaError::Storage(format!("cannot encode audit event: {e}")))?;
            line.push(b'\n');
            let path = self.path.as_deref().unwrap_or(Path::new("audit log"));
            file.write_all(&line).map_err(|e| io_error(path, e))?;
            file.sync_data().map_err(|e| io_error(path, e))?;
        }
        debug!(sequence, action = ?event.action, outcome = ?event.outcome, actor = %event.actor_id, "audit event recorded");
        state.events.push(event.clone());
        Ok(event)
    }

    pub fn query(&self, filter: &AuditFilter) -> AuditPage {
        let state = self.state.lock();
        let matching: Vec<&AuditEvent> = state.events.iter().filter(|e| filter.matches(e)).collect();
        let events = matching
            .iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(|e| (*e).clone())
            .collect();
        AuditPage {
            total: matching.len(),
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-checks every hash and link of the in-memory chain.
    pub fn verify(&self) -> Result<()> {
        verify_chain(&self.state.lock().events)
    }
}

fn read_events(path: &Path, file: File) -> Result<Vec<AuditEvent>> {
    let mut events = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_error(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str(&line).map_err(|e| {
            CaError::Storage(format!("{} line {}: {e}", path.display(), index + 1))
        })?;
        events.push(event);
    }
    Ok(events)
}

fn verify_chain(events: &[AuditEvent]) -> Result<()> {
    let mut previous = GENESIS_HASH.to_string();
    for (index, event) in events.iter().enumerate() {
        let expected_sequence = index as u64 + 1;
        if event.sequence != expected_sequence
            || event.previous_hash != previous
            || event.hash != event.compute_hash()
        {
            return Err(CaError::Storage(format!(
                "audit chain broken at sequence {expected_sequence}"
            )));
        }
        previous.clone_from(&event.hash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn admin() -> Actor {
        Actor::new("admin", Role::Admin, None)
    }

    #[test]
    fn test_events_are_chained() {
        let log = AuditLog::in_memory();
        let first = log
            .record(&admin(), AuditAction::IssueRoot, "certificate:1", AuditOutcome::Success, None)
            .unwrap();
        let bob = Actor::new("bob", Role::Basic, Some("Acme"));
        let second = log
            .record(&bob, AuditAction::RevokeCertificate, "certificate:1", AuditOutcome::Denied, None)
            .unwrap();

        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(second.sequence, 2);
        assert_eq!(first.hash.len(), 64);
        assert!(log.verify().is_ok());
    }

    #[test]
    fn test_query_filters_and_pages() {
        let log = AuditLog::in_memory();
        let bob = Actor::new("bob", Role::Basic, Some("Acme"));
        for n in 0..5 {
            log.record(&admin(), AuditAction::IssueEndEntity, format!("certificate:{n}"), AuditOutcome::Success, None)
                .unwrap();
        }
        log.record(&bob, AuditAction::IssueRoot, "root", AuditOutcome::Denied, Some("Forbidden".into()))
            .unwrap();

        let denied = log.query(&AuditFilter {
            outcome: Some(AuditOutcome::Denied),
            ..Default::default()
        });
        assert_eq!(denied.total, 1);
        assert_eq!(denied.events[0].actor_id, "bob");

        let page = log.query(&AuditFilter {
            actor_id: Some("admin".into()),
            offset: 3,
            limit: Some(10),
            ..Default::default()
        });
        assert_eq!(page.total, 5);
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].sequence, 4);
    }

    #[test]
    fn test_file_log_reopens_and_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        log.record(&admin(), AuditAction::CreateTemplate, "template:1", AuditOutcome::Success, None)
            .unwrap();
        log.record(&admin(), AuditAction::DeleteTemplate, "template:1", AuditOutcome::Success, None)
            .unwrap();
        drop(log);

        let reopened = AuditLog::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        let third = reopened
            .record(&admin(), AuditAction::UseTemplate, "template:2", AuditOutcome::Failure, None)
            .unwrap();
        assert_eq!(third.sequence, 3);
        drop(reopened);

        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen("DELETE_TEMPLATE", "UPDATE_TEMPLATE", 1)).unwrap();
        assert!(matches!(AuditLog::open(&path), Err(CaError::Storage(_))));

        let lines: Vec<&str> = text.lines().collect();
        fs::write(&path, format!("{}\n{}\n", lines[0], lines[2])).unwrap();
        assert!(matches!(AuditLog::open(&path), Err(CaError::Storage(_))));
    }
}
