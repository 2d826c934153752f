// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The file-broadcast receiver (spec §4.8): credential-checked,
//! block-numbered, optionally zstd-compressed streaming writer for
//! binaries pushed across the cluster by `sbcast`-equivalent clients.
//!
//! Grounded on `agentd-engine::launcher`'s fork discipline for the one
//! piece of this component that must run as the credentialed user
//! (opening the destination file) and on `agentd-vault::store::Vault` for
//! credential verification — spec §4.8 explicitly reuses "the same
//! verifier as §4.2".

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentd_adapters::ContainerAdapter;
use agentd_core::{AgentError, Clock, JobId, JobCredential, EXTERN_STEP_ID};
use agentd_vault::Vault;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, setgid, setgroups, setuid, ForkResult, Gid, Uid};
use parking_lot::Mutex;
use thiserror::Error;

use crate::rwlock::PreemptingRwLock;

/// Idle duration after which a stalled transfer is garbage-collected
/// (spec §4.8 "Stall garbage collection").
pub const FILE_BCAST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum BcastError {
    #[error("credential rejected: {0}")]
    Auth(#[from] AgentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block {got} out of order for {path:?} (expected {expected})")]
    OutOfOrder { path: PathBuf, expected: u32, got: u32 },

    #[error("no transfer in progress for {0:?}")]
    NoSuchTransfer(PathBuf),

    #[error("opening destination as user failed: {0}")]
    OpenAsUser(String),

    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
}

/// Per-transfer state (spec §3 `BcastTransfer`). Retained until the last
/// block arrives or stall-GC reaps it.
struct BcastTransfer<C: Clock> {
    uid: u32,
    gid: u32,
    job_id: JobId,
    path: PathBuf,
    fd: OwnedFd,
    last_block_no: u32,
    last_update: u64,
    clock: C,
}

impl<C: Clock> BcastTransfer<C> {
    fn touch(&mut self) {
        self.last_update = self.clock.unix_secs();
    }

    fn is_stale(&self, now: u64, timeout_secs: u64) -> bool {
        now.saturating_sub(self.last_update) >= timeout_secs
    }
}

/// One block of a broadcast transfer, as parsed from a `FileBcast` request.
pub struct Block {
    pub job_id: JobId,
    pub credential: JobCredential,
    pub dest_path: PathBuf,
    pub block_no: u32,
    pub force: bool,
    pub last_block: bool,
    pub data: Vec<u8>,
    pub compressed: bool,
    pub mode: u32,
    pub mtime_unix_secs: Option<i64>,
}

type TransferKey = (u32, PathBuf);

/// Opens a broadcast destination file as the credential's (uid, gid),
/// the one step of §4.8 that needs real privilege-drop machinery. A
/// trait boundary here, same reasoning as `agentd_adapters::ContainerAdapter`:
/// the fork+setuid+SCM_RIGHTS dance only needs to run for real in
/// production; tests substitute something that doesn't require root.
pub trait DestinationOpener: Send + Sync {
    fn open(&self, uid: u32, gid: u32, path: &Path, force: bool, job_id: &JobId) -> Result<OwnedFd, BcastError>;
}

/// Production `DestinationOpener`: forks a helper that joins the job's
/// container, drops to `(uid, gid)`, opens the file, and hands the fd
/// back over a socketpair with `SCM_RIGHTS` (spec §4.8 step 2).
pub struct ForkingOpener {
    container: Arc<dyn ContainerAdapter>,
}

impl ForkingOpener {
    pub fn new(container: Arc<dyn ContainerAdapter>) -> Self {
        Self { container }
    }
}

impl DestinationOpener for ForkingOpener {
    fn open(&self, uid: u32, gid: u32, path: &Path, force: bool, job_id: &JobId) -> Result<OwnedFd, BcastError> {
        open_as_user(uid, gid, path, force, self.container.as_ref(), job_id)
    }
}

/// The receiver: one per agent, holding every in-flight broadcast's state
/// behind a read/write lock that lets concurrent transfers write their
/// blocks without contending on each other (spec §4.8 "Locking").
pub struct BcastReceiver<C: Clock> {
    transfers: PreemptingRwLock,
    table: Mutex<HashMap<TransferKey, Arc<Mutex<BcastTransfer<C>>>>>,
    opener: Arc<dyn DestinationOpener>,
    clock: C,
    stall_timeout_secs: u64,
}

impl<C: Clock> BcastReceiver<C> {
    pub fn new(opener: Arc<dyn DestinationOpener>, clock: C) -> Self {
        Self {
            transfers: PreemptingRwLock::new(),
            table: Mutex::new(HashMap::new()),
            opener,
            clock,
            stall_timeout_secs: FILE_BCAST_TIMEOUT_SECS,
        }
    }

    /// Processes one block (spec §4.8 steps 1-5).
    pub fn receive_block(&self, vault: &Vault<C>, claimed_uid: u32, privileged: bool, block: Block) -> Result<(), BcastError> {
        let verified = vault.verify(&block.credential, claimed_uid, privileged)?;
        let key: TransferKey = (verified.credential.uid, block.dest_path.clone());

        if block.block_no == 1 {
            // A fresh (or restarted) transfer: close out any stale prior
            // entry for the same (uid, path) before opening a new fd.
            let _guard = self.transfers.write();
            self.table.lock().remove(&key);
            let fd = self.opener.open(verified.credential.uid, verified.credential.gid, &block.dest_path, block.force, &block.job_id)?;
            let transfer = BcastTransfer {
                uid: verified.credential.uid,
                gid: verified.credential.gid,
                job_id: block.job_id.clone(),
                path: block.dest_path.clone(),
                fd,
                last_block_no: 0,
                last_update: self.clock.unix_secs(),
                clock: self.clock.clone(),
            };
            self.table.lock().insert(key.clone(), Arc::new(Mutex::new(transfer)));
        }

        let entry = {
            let _guard = self.transfers.read();
            self.table.lock().get(&key).cloned().ok_or_else(|| BcastError::NoSuchTransfer(block.dest_path.clone()))?
        };

        let mut transfer = entry.lock();
        if block.block_no != transfer.last_block_no + 1 {
            return Err(BcastError::OutOfOrder { path: block.dest_path.clone(), expected: transfer.last_block_no + 1, got: block.block_no });
        }

        let bytes = if block.compressed { zstd::decode_all(block.data.as_slice()).map_err(BcastError::Decompress)? } else { block.data };

        write_all_eintr(transfer.fd.as_raw_fd(), &bytes)?;
        transfer.last_block_no = block.block_no;
        transfer.touch();

        if block.last_block {
            finalize(&transfer, block.mode, block.mtime_unix_secs)?;
            drop(transfer);
            let _guard = self.transfers.write();
            self.table.lock().remove(&key);
        }

        Ok(())
    }

    /// Stall GC (spec §4.8): run opportunistically on ping handling. Any
    /// transfer idle longer than `stall_timeout_secs` is closed, removed,
    /// and logged.
    pub fn gc_stalled(&self) {
        let now = self.clock.unix_secs();
        let _guard = self.transfers.write();
        let mut table = self.table.lock();
        table.retain(|_, entry| {
            let transfer = entry.lock();
            let stale = transfer.is_stale(now, self.stall_timeout_secs);
            if stale {
                tracing::error!(job_id = %transfer.job_id, path = %transfer.path.display(), "file broadcast stalled, garbage collecting");
            }
            !stale
        });
    }

    pub fn in_flight_count(&self) -> usize {
        let _guard = self.transfers.read();
        self.table.lock().len()
    }
}

fn finalize<C: Clock>(transfer: &BcastTransfer<C>, mode: u32, mtime_unix_secs: Option<i64>) -> Result<(), BcastError> {
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(transfer.fd.as_raw_fd()) };
    let perm_mode = nix::sys::stat::Mode::from_bits_truncate(mode);
    nix::sys::stat::fchmod(fd, perm_mode).map_err(|e| BcastError::Io(e.into()))?;
    nix::unistd::fchown(fd, Some(Uid::from_raw(transfer.uid)), Some(Gid::from_raw(transfer.gid))).map_err(|e| BcastError::Io(e.into()))?;
    if let Some(secs) = mtime_unix_secs {
        let spec = nix::sys::time::TimeSpec::new(secs, 0);
        let _ = nix::sys::stat::futimens(fd, &spec, &spec);
    }
    Ok(())
}

fn write_all_eintr(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, buf) {
            Ok(0) => return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => buf = &buf[n..],
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Opens `path` as `(uid, gid)` by forking a helper process that joins the
/// job's container, drops privileges, opens the file, and hands the open
/// fd back over a socketpair with `SCM_RIGHTS` (spec §4.8 step 2).
///
/// # Safety discipline
/// Same contract as `agentd_engine::launcher::StepLauncher::launch`: the
/// child only calls async-signal-safe operations before exiting.
fn open_as_user(uid: u32, gid: u32, path: &Path, force: bool, container: &dyn ContainerAdapter, job_id: &JobId) -> Result<OwnedFd, BcastError> {
    let (parent_sock, child_sock) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
        .map_err(|e| BcastError::OpenAsUser(e.to_string()))?;

    // SAFETY: the child path below only joins the container, drops
    // privileges, opens a file, and sends the fd before exiting; no
    // Rust-level locks are taken between fork and exit.
    match unsafe { fork() }.map_err(|e| BcastError::OpenAsUser(e.to_string()))? {
        ForkResult::Parent { child } => {
            drop(child_sock);
            let fd = recv_fd(&parent_sock).map_err(|e| BcastError::OpenAsUser(e.to_string()))?;
            match waitpid(child, None) {
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "waitpid on bcast-open helper failed"),
            }
            fd.ok_or_else(|| BcastError::OpenAsUser("helper exited without sending an fd".to_string()))
        }
        ForkResult::Child => {
            drop(parent_sock);
            let rc = child_open_and_send(uid, gid, path, force, container, job_id, &child_sock);
            std::process::exit(rc);
        }
    }
}

fn child_open_and_send(uid: u32, gid: u32, path: &Path, force: bool, container: &dyn ContainerAdapter, job_id: &JobId, sock: &std::os::fd::OwnedFd) -> i32 {
    if container.join(job_id, EXTERN_STEP_ID).is_err() {
        return 1;
    }
    if setgroups(&[]).is_err() {
        return 1;
    }
    if setgid(Gid::from_raw(gid)).is_err() {
        return 1;
    }
    if setuid(Uid::from_raw(uid)).is_err() {
        return 1;
    }

    let mut flags = nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_CREAT;
    flags |= if force { nix::fcntl::OFlag::O_TRUNC } else { nix::fcntl::OFlag::O_EXCL };
    let mode = nix::sys::stat::Mode::from_bits_truncate(0o700);

    let fd = match nix::fcntl::open(path, flags, mode) {
        Ok(fd) => fd,
        Err(_) => return 1,
    };

    if send_fd(sock, fd).is_err() {
        return 1;
    }
    0
}

fn send_fd(sock: &std::os::fd::OwnedFd, fd: RawFd) -> nix::Result<()> {
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(sock.as_raw_fd(), &[std::io::IoSlice::new(b"x")], &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

fn recv_fd(sock: &std::os::fd::OwnedFd) -> nix::Result<Option<OwnedFd>> {
    let mut byte = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut byte)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<UnixAddr>(sock.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                return Ok(Some(unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }
    }
    Ok(None)
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::{BcastError, DestinationOpener};
    use agentd_core::JobId;
    use std::os::fd::OwnedFd;
    use std::path::Path;

    /// `DestinationOpener` that opens the file as the calling process,
    /// skipping the fork/setuid/SCM_RIGHTS dance — lets receiver tests run
    /// without root.
    #[derive(Default)]
    pub struct FakeOpener;

    impl FakeOpener {
        pub fn new() -> Self {
            Self
        }
    }

    impl DestinationOpener for FakeOpener {
        fn open(&self, _uid: u32, _gid: u32, path: &Path, force: bool, _job_id: &JobId) -> Result<OwnedFd, BcastError> {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create(true);
            if force {
                opts.truncate(true);
            } else {
                opts.create_new(true);
            }
            let file = opts.open(path).map_err(BcastError::Io)?;
            Ok(std::os::fd::OwnedFd::from(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_core::test_support::CredentialBuilder;
    use agentd_core::FakeClock;
    use ed25519_dalek::{Signer, SigningKey};
    use tempfile::tempdir;

    fn signed_cred(signing_key: &SigningKey, job_id: &str, uid: u32, gid: u32, hostlist: &[&str]) -> JobCredential {
        let mut cred = CredentialBuilder::new(job_id, 0).hostlist(hostlist).uid(uid).build();
        cred.gid = gid;
        let mut unsigned = cred.clone();
        unsigned.signature = Vec::new();
        let message = serde_json::to_vec(&unsigned).unwrap();
        cred.signature = signing_key.sign(&message).to_bytes().to_vec();
        cred
    }

    fn vault_and_key(hostname: &str) -> (Vault<FakeClock>, SigningKey) {
        let signing_key = SigningKey::from_bytes(&[9u8; 32]);
        let dir = tempdir().unwrap();
        let vault = Vault::new(signing_key.verifying_key(), hostname, dir.path().join("cred_state"), FakeClock::new());
        (vault, signing_key)
    }

    #[test]
    fn out_of_order_block_is_rejected() {
        let receiver = BcastReceiver::new(Arc::new(test_support::FakeOpener::new()), FakeClock::new());
        let (vault, key) = vault_and_key("n1");
        let my_uid = nix::unistd::getuid().as_raw();
        let cred = signed_cred(&key, "100", my_uid, nix::unistd::getgid().as_raw(), &["n1"]);

        let dir = tempdir().unwrap();
        let dest = dir.path().join("payload.bin");

        let first = Block {
            job_id: JobId::from("100"),
            credential: cred.clone(),
            dest_path: dest.clone(),
            block_no: 1,
            force: true,
            last_block: false,
            data: b"hello".to_vec(),
            compressed: false,
            mode: 0o700,
            mtime_unix_secs: None,
        };
        receiver.receive_block(&vault, my_uid, false, first).unwrap();

        let skip_to_three = Block {
            job_id: JobId::from("100"),
            credential: cred,
            dest_path: dest,
            block_no: 3,
            force: true,
            last_block: false,
            data: b"world".to_vec(),
            compressed: false,
            mode: 0o700,
            mtime_unix_secs: None,
        };
        let err = receiver.receive_block(&vault, my_uid, false, skip_to_three).unwrap_err();
        assert!(matches!(err, BcastError::OutOfOrder { expected: 2, got: 3, .. }));
    }

    #[test]
    fn full_transfer_writes_all_blocks_and_clears_entry() {
        let receiver = BcastReceiver::new(Arc::new(test_support::FakeOpener::new()), FakeClock::new());
        let (vault, key) = vault_and_key("n1");
        let my_uid = nix::unistd::getuid().as_raw();
        let my_gid = nix::unistd::getgid().as_raw();
        let cred = signed_cred(&key, "200", my_uid, my_gid, &["n1"]);

        let dir = tempdir().unwrap();
        let dest = dir.path().join("payload.bin");

        for (block_no, chunk, last) in [(1u32, b"AAAA".to_vec(), false), (2, b"BBBB".to_vec(), true)] {
            let block = Block {
                job_id: JobId::from("200"),
                credential: cred.clone(),
                dest_path: dest.clone(),
                block_no,
                force: true,
                last_block: last,
                data: chunk,
                compressed: false,
                mode: 0o600,
                mtime_unix_secs: None,
            };
            receiver.receive_block(&vault, my_uid, false, block).unwrap();
        }

        assert_eq!(receiver.in_flight_count(), 0);
        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written, b"AAAABBBB");
    }

    /// Spec §8 scenario S5: a transfer that stalls for longer than
    /// `FILE_BCAST_TIMEOUT_SECS` is reaped by `gc_stalled` (run
    /// opportunistically on ping handling), and a fresh broadcast
    /// restarting at block 1 succeeds afterwards.
    #[test]
    fn stalled_transfer_is_gced_after_timeout_and_restart_succeeds() {
        let clock = FakeClock::new();
        let receiver = BcastReceiver::new(Arc::new(test_support::FakeOpener::new()), clock.clone());
        let (vault, key) = vault_and_key("n1");
        let my_uid = nix::unistd::getuid().as_raw();
        let my_gid = nix::unistd::getgid().as_raw();
        let cred = signed_cred(&key, "300", my_uid, my_gid, &["n1"]);

        let dir = tempdir().unwrap();
        let dest = dir.path().join("payload.bin");

        for block_no in 1..=3u32 {
            let block = Block {
                job_id: JobId::from("300"),
                credential: cred.clone(),
                dest_path: dest.clone(),
                block_no,
                force: true,
                last_block: false,
                data: b"chunk".to_vec(),
                compressed: false,
                mode: 0o700,
                mtime_unix_secs: None,
            };
            receiver.receive_block(&vault, my_uid, false, block).unwrap();
        }
        assert_eq!(receiver.in_flight_count(), 1);

        // The sender crashes; 301s of idle time pass before a Ping drives
        // stall GC.
        clock.advance(Duration::from_secs(301));
        receiver.gc_stalled();
        assert_eq!(receiver.in_flight_count(), 0);

        // A re-broadcast starting at block 1 succeeds (the stale entry is
        // gone, so block 1 opens a fresh transfer rather than failing an
        // out-of-order check against the reaped one).
        let restart = Block {
            job_id: JobId::from("300"),
            credential: cred,
            dest_path: dest.clone(),
            block_no: 1,
            force: true,
            last_block: true,
            data: b"retry".to_vec(),
            compressed: false,
            mode: 0o700,
            mtime_unix_secs: None,
        };
        receiver.receive_block(&vault, my_uid, false, restart).unwrap();
        assert_eq!(receiver.in_flight_count(), 0);
        assert_eq!(std::fs::read(&dest).unwrap(), b"retry");
    }
}
