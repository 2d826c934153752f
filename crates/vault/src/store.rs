// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The credential vault (spec §4.2): signature verification, revocation,
//! replay-tolerant re-validation, and crash-safe persistence of the full
//! vault state.

use agentd_core::{AgentError, Clock, ErrorKind, JobCredential, JobId};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::persist::{atomic_write, read_with_fallback, PersistError};

/// A credential that has passed every §4.2 check: signature, revocation,
/// hostlist membership, and uid match. Callers downstream (the step
/// launcher, the dispatcher) only ever see this, never a raw
/// `JobCredential` pulled off the wire.
#[derive(Debug, Clone)]
pub struct VerifiedCredential {
    pub credential: JobCredential,
    pub local_host_index: usize,
}

/// How long a revocation's bookkeeping is retained before being purged
/// (spec §3: "Entries expire `cred_lifetime` seconds after revocation").
pub const DEFAULT_CRED_LIFETIME_SECS: u64 = 3600;

/// Serializable snapshot of vault state (spec §4.2 `pack`/`unpack`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VaultSnapshot {
    seen_jobs: Vec<JobId>,
    revocations: Vec<(JobId, agentd_core::RevocationEntry)>,
    expiring: Vec<(JobId, u64)>,
}

struct VaultState {
    seen_jobs: HashSet<JobId>,
    revocations: HashMap<JobId, agentd_core::RevocationEntry>,
    /// job_id -> unix time the expiration timer started (spec
    /// `begin_expiration`).
    expiring: HashMap<JobId, u64>,
    /// Most recent wall-clock a `(job_id, step_id)` pair was successfully
    /// verified — lets a second RPC within the same step skip re-running
    /// the full check without opening a real replay window, since every
    /// lookup still re-confirms the credential isn't revoked.
    recently_validated: HashMap<(JobId, i64), u64>,
}

impl VaultState {
    fn new() -> Self {
        Self {
            seen_jobs: HashSet::new(),
            revocations: HashMap::new(),
            expiring: HashMap::new(),
            recently_validated: HashMap::new(),
        }
    }

    fn to_snapshot(&self) -> VaultSnapshot {
        VaultSnapshot {
            seen_jobs: self.seen_jobs.iter().cloned().collect(),
            revocations: self.revocations.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            expiring: self.expiring.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    fn from_snapshot(snapshot: VaultSnapshot) -> Self {
        Self {
            seen_jobs: snapshot.seen_jobs.into_iter().collect(),
            revocations: snapshot.revocations.into_iter().collect(),
            expiring: snapshot.expiring.into_iter().collect(),
            recently_validated: HashMap::new(),
        }
    }
}

/// The vault itself. Holds the controller's public verifying key and the
/// local hostname; everything mutable lives behind one mutex, matching
/// spec §4.2's "a process-wide mutex serialises saves" (extended here to
/// cover reads too, since the vault's operations are all O(1)).
pub struct Vault<C: Clock> {
    state: Mutex<VaultState>,
    verifying_key: VerifyingKey,
    local_hostname: String,
    cred_lifetime_secs: u64,
    snapshot_path: PathBuf,
    clock: C,
}

impl<C: Clock> Vault<C> {
    pub fn new(verifying_key: VerifyingKey, local_hostname: impl Into<String>, snapshot_path: impl Into<PathBuf>, clock: C) -> Self {
        Self {
            state: Mutex::new(VaultState::new()),
            verifying_key,
            local_hostname: local_hostname.into(),
            cred_lifetime_secs: DEFAULT_CRED_LIFETIME_SECS,
            snapshot_path: snapshot_path.into(),
            clock,
        }
    }

    pub fn with_cred_lifetime_secs(mut self, secs: u64) -> Self {
        self.cred_lifetime_secs = secs;
        self
    }

    /// Cryptographically validates `cred`'s signature, refuses revoked or
    /// foreign-host credentials, and (unless `privileged`) enforces that
    /// `claimed_uid` (from the authenticated RPC header) matches the
    /// credential's own uid. On success returns an owned typed view
    /// carrying this node's index into the credential's hostlist.
    pub fn verify(&self, cred: &JobCredential, claimed_uid: u32, privileged: bool) -> Result<VerifiedCredential, AgentError> {
        self.verify_signature(cred)?;

        let mut state = self.state.lock();
        if let Some(entry) = state.revocations.get(&cred.job_id) {
            if !entry.is_expired(self.clock.unix_secs()) {
                return Err(AgentError::CredentialRevoked(cred.job_id.to_string()));
            }
        }

        let local_host_index = cred
            .hostlist
            .iter()
            .position(|h| h == &self.local_hostname)
            .ok_or_else(|| AgentError::Auth(format!("host {} not in credential hostlist", self.local_hostname)))?;

        if !privileged && claimed_uid != cred.uid {
            return Err(AgentError::UserIdMissing { uid: claimed_uid });
        }

        state
            .recently_validated
            .insert((cred.job_id.clone(), cred.step_id), self.clock.unix_secs());

        Ok(VerifiedCredential { credential: cred.clone(), local_host_index })
    }

    fn verify_signature(&self, cred: &JobCredential) -> Result<(), AgentError> {
        if cred.signature.len() != 64 {
            return Err(AgentError::Auth("signature must be 64 bytes".to_string()));
        }
        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(&cred.signature);
        let signature = Signature::from_bytes(&sig_bytes);

        let message = signable_bytes(cred);
        self.verifying_key
            .verify(&message, &signature)
            .map_err(|e| AgentError::Auth(format!("signature verification failed: {e}")))
    }

    /// Marks `job_id` as seen so future step launches for the same job
    /// skip the prolog path.
    pub fn insert_job(&self, job_id: JobId) {
        self.state.lock().seen_jobs.insert(job_id);
    }

    pub fn job_seen(&self, job_id: &JobId) -> bool {
        self.state.lock().seen_jobs.contains(job_id)
    }

    /// Re-queries the revocation list without re-verifying a signature.
    /// Used to re-check a credential that was verified before a long-
    /// running prolog, where a `TerminateJob` may have revoked it in the
    /// meantime (spec §8 S2).
    pub fn is_revoked(&self, job_id: &JobId) -> bool {
        let state = self.state.lock();
        match state.revocations.get(job_id) {
            Some(entry) => !entry.is_expired(self.clock.unix_secs()),
            None => false,
        }
    }

    /// Appends to the revocation list; subsequent verifications for
    /// `job_id` fail with `CredentialRevoked` until the entry expires.
    pub fn revoke(&self, job_id: JobId, revoke_time_unix_secs: u64, start_time_unix_secs: u64) {
        let entry = agentd_core::RevocationEntry::new(revoke_time_unix_secs, start_time_unix_secs, self.cred_lifetime_secs);
        self.state.lock().revocations.insert(job_id, entry);
    }

    /// Starts the epilog-cleanup timer for `job_id`; the credential's
    /// bookkeeping is kept until `cred_lifetime` elapses, then purged by
    /// `purge_expired`.
    pub fn begin_expiration(&self, job_id: JobId) {
        let now = self.clock.unix_secs();
        self.state.lock().expiring.insert(job_id, now);
    }

    /// Idempotently accepts a credential whose `start_time` is newer than
    /// the recorded revocation's `start_time` — supports a controller
    /// re-queueing the same job id after a prior run was revoked.
    pub fn handle_reissue(&self, job_id: &JobId, new_start_time_unix_secs: u64) -> bool {
        let mut state = self.state.lock();
        match state.revocations.get(job_id) {
            Some(entry) if new_start_time_unix_secs > entry.start_time_unix_secs => {
                state.revocations.remove(job_id);
                state.seen_jobs.remove(job_id);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Purges expiration timers and revocation entries whose `cred_lifetime`
    /// has elapsed. Called periodically by the daemon's housekeeping loop.
    pub fn purge_expired(&self) {
        let now = self.clock.unix_secs();
        let mut state = self.state.lock();
        state.revocations.retain(|_, entry| !entry.is_expired(now));
        state.expiring.retain(|_, started_at| now.saturating_sub(*started_at) < self.cred_lifetime_secs);
    }

    /// Serializes the full vault state and persists it atomically
    /// (write-new, link-to-`.old`, rename-over-current).
    pub fn save(&self) -> Result<(), PersistError> {
        let snapshot = self.state.lock().to_snapshot();
        let bytes = serde_json::to_vec(&snapshot).unwrap_or_default();
        atomic_write(&self.snapshot_path, &bytes)
    }

    /// Loads vault state from disk, falling back to the `.old` generation.
    /// Leaves the vault empty if no snapshot exists yet (first boot).
    pub fn load(&self) -> Result<(), PersistError> {
        if let Some(bytes) = read_with_fallback(&self.snapshot_path)? {
            if let Ok(snapshot) = serde_json::from_slice::<VaultSnapshot>(&bytes) {
                *self.state.lock() = VaultState::from_snapshot(snapshot);
            }
        }
        Ok(())
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Job ids the vault currently holds credential state for, reported to
    /// the controller uplink's registration RPC (spec §4.9).
    pub fn seen_job_ids(&self) -> Vec<JobId> {
        self.state.lock().seen_jobs.iter().cloned().collect()
    }

    /// Coarse counters for the health-check reply (spec §4.9).
    pub fn stats(&self) -> VaultStats {
        let state = self.state.lock();
        VaultStats {
            seen_jobs: state.seen_jobs.len(),
            active_revocations: state.revocations.len(),
            expiring: state.expiring.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VaultStats {
    pub seen_jobs: usize,
    pub active_revocations: usize,
    pub expiring: usize,
}

/// Canonical signable encoding of a credential: every field except the
/// signature itself.
fn signable_bytes(cred: &JobCredential) -> Vec<u8> {
    let mut unsigned = cred.clone();
    unsigned.signature = Vec::new();
    serde_json::to_vec(&unsigned).unwrap_or_default()
}

/// Converts a vault rejection's `AgentError` into the numeric kind the
/// wire protocol carries (spec §7: "clients distinguish kinds by numeric
/// code").
pub fn error_code(err: &AgentError) -> i32 {
    err.kind().code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_core::FakeClock;
    use ed25519_dalek::{Signer, SigningKey};
    use tempfile::tempdir;

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let verifying_key = signing_key.verifying_key();
        (signing_key, verifying_key)
    }

    fn signed_credential(signing_key: &SigningKey, job_id: &str, uid: u32, hostlist: &[&str]) -> JobCredential {
        let mut cred = agentd_core::test_support::CredentialBuilder::new(job_id, 0)
            .hostlist(hostlist)
            .uid(uid)
            .build();
        let message = signable_bytes(&cred);
        let signature = signing_key.sign(&message);
        cred.signature = signature.to_bytes().to_vec();
        cred
    }

    fn vault(signing_key: &SigningKey, verifying_key: VerifyingKey, hostname: &str) -> Vault<FakeClock> {
        let dir = tempdir().unwrap();
        let _ = signing_key;
        Vault::new(verifying_key, hostname, dir.path().join("cred_state"), FakeClock::new())
    }

    #[test]
    fn valid_credential_for_local_host_verifies() {
        let (signing_key, verifying_key) = keypair();
        let cred = signed_credential(&signing_key, "100", 1001, &["n1", "n2"]);
        let vault = vault(&signing_key, verifying_key, "n1");

        let verified = vault.verify(&cred, 1001, false).expect("should verify");
        assert_eq!(verified.local_host_index, 0);
    }

    #[test]
    fn tampered_payload_fails_signature_check() {
        let (signing_key, verifying_key) = keypair();
        let mut cred = signed_credential(&signing_key, "100", 1001, &["n1"]);
        cred.uid = 9999;
        let vault = vault(&signing_key, verifying_key, "n1");

        let err = vault.verify(&cred, 9999, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthError);
    }

    #[test]
    fn foreign_hostname_is_rejected() {
        let (signing_key, verifying_key) = keypair();
        let cred = signed_credential(&signing_key, "100", 1001, &["n1"]);
        let vault = vault(&signing_key, verifying_key, "n-not-in-list");

        let err = vault.verify(&cred, 1001, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthError);
    }

    #[test]
    fn uid_mismatch_rejected_unless_privileged() {
        let (signing_key, verifying_key) = keypair();
        let cred = signed_credential(&signing_key, "100", 1001, &["n1"]);
        let vault = vault(&signing_key, verifying_key, "n1");

        assert!(vault.verify(&cred, 2002, false).is_err());
        assert!(vault.verify(&cred, 2002, true).is_ok());
    }

    #[test]
    fn revoked_credential_fails_until_entry_expires() {
        let (signing_key, verifying_key) = keypair();
        let cred = signed_credential(&signing_key, "100", 1001, &["n1"]);
        let vault = vault(&signing_key, verifying_key, "n1").with_cred_lifetime_secs(300);

        vault.revoke(agentd_core::JobId::from("100"), 1_700_000_000, 1_699_999_000);
        let err = vault.verify(&cred, 1001, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialRevoked);
    }

    #[test]
    fn handle_reissue_accepts_newer_start_time_and_clears_revocation() {
        let (_signing_key, verifying_key) = keypair();
        let vault = vault(&_signing_key, verifying_key, "n1");
        let job_id = agentd_core::JobId::from("100");

        vault.revoke(job_id.clone(), 1_700_000_000, 1_699_999_000);
        assert!(!vault.handle_reissue(&job_id, 1_699_999_000));
        assert!(vault.handle_reissue(&job_id, 1_700_001_000));
    }

    #[test]
    fn save_and_load_round_trip_vault_state() {
        let (_signing_key, verifying_key) = keypair();
        let dir = tempdir().unwrap();
        let path = dir.path().join("cred_state");
        let job_id = agentd_core::JobId::from("100");

        {
            let vault = Vault::new(verifying_key, "n1", &path, FakeClock::new());
            vault.insert_job(job_id.clone());
            vault.revoke(agentd_core::JobId::from("200"), 1_700_000_000, 1_699_999_000);
            vault.save().unwrap();
        }

        let vault = Vault::new(verifying_key, "n1", &path, FakeClock::new());
        vault.load().unwrap();
        assert!(vault.job_seen(&job_id));
    }
}
