//! Process-wide transfer registry shared by every server instance in the
//! daemon, and the two-level locking discipline that guards it.
//!
//! The registry mutex is strictly coarser than any per-transfer mutex: a
//! per-transfer lock may only be attempted (never blocked on) while the
//! registry is held, and the registry must be released before any I/O runs
//! under a transfer lock. Blocking on a transfer lock with the registry held
//! would deadlock against `remove` waiting to tear down the same transfer.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::addr::DataAddress;
use crate::journal::TransferJournal;
use crate::openmode::OpenMode;
use crate::protocol::LOCK_RETRY_US;

/// Mutable half of a transfer, guarded by the per-transfer lock. The fd is
/// an `Option` so removal can close it while the lock is still held.
pub struct TransferIo {
    pub fd: Option<File>,
}

/// One registered transfer. `path` and `open_mode` never change after
/// registration and are readable under the registry lock alone; the file
/// handle lives behind the per-transfer lock.
pub struct Transfer {
    pub path: PathBuf,
    pub open_mode: OpenMode,
    pub io: Arc<Mutex<TransferIo>>,
}

impl Transfer {
    pub fn new(path: PathBuf, open_mode: OpenMode, fd: File) -> Self {
        Transfer {
            path,
            open_mode,
            io: Arc::new(Mutex::new(TransferIo { fd: Some(fd) })),
        }
    }
}

pub type TransferMap = HashMap<Uuid, Transfer>;

/// Shared daemon state: the transfer map behind the registry lock, the
/// advertised data-channel endpoints (fixed at startup), and the optional
/// session journal.
pub struct EtdState {
    pub transfers: Mutex<TransferMap>,
    pub dataaddrs: Vec<DataAddress>,
    pub journal: Option<TransferJournal>,
}

impl EtdState {
    pub fn new(dataaddrs: Vec<DataAddress>) -> Self {
        EtdState {
            transfers: Mutex::new(HashMap::new()),
            dataaddrs,
            journal: None,
        }
    }

    pub fn with_journal(dataaddrs: Vec<DataAddress>, journal: TransferJournal) -> Self {
        EtdState {
            transfers: Mutex::new(HashMap::new()),
            dataaddrs,
            journal: Some(journal),
        }
    }

    /// Run `f` under the per-transfer lock of `uuid`, with the registry lock
    /// already released. Returns `None` when no such transfer is registered;
    /// the caller picks the error wording for its operation.
    ///
    /// Acquisition loops: lock the registry, look the transfer up afresh (an
    /// earlier lookup is stale once the registry was released), try-lock the
    /// transfer, and on contention release the registry and back off for a
    /// few microseconds before starting over.
    pub fn with_transfer<R>(
        &self,
        uuid: &Uuid,
        f: impl FnOnce(&Path, OpenMode, &mut TransferIo) -> Result<R>,
    ) -> Option<Result<R>> {
        loop {
            let transfers = self.transfers.lock();
            let (path, open_mode, io) = match transfers.get(uuid) {
                None => return None,
                Some(t) => (t.path.clone(), t.open_mode, t.io.clone()),
            };
            match io.try_lock() {
                Some(mut guard) => {
                    drop(transfers);
                    return Some(f(&path, open_mode, &mut guard));
                }
                None => {
                    drop(transfers);
                    thread::sleep(Duration::from_micros(LOCK_RETRY_US));
                }
            };
        }
    }

    /// Tear down the transfer registered under `uuid`. Returns false when it
    /// was not (or no longer) present. Follows the same acquire-both loop as
    /// [`EtdState::with_transfer`]; once both locks are held the entry is
    /// taken out of the map, the fd is closed, and only after the transfer
    /// lock is released does the moved-out entry get dropped.
    pub fn remove(&self, uuid: &Uuid) -> bool {
        loop {
            let mut transfers = self.transfers.lock();
            let io = match transfers.get(uuid) {
                None => return false,
                Some(t) => t.io.clone(),
            };
            match io.try_lock() {
                Some(mut guard) => {
                    let removed = transfers.remove(uuid);
                    drop(transfers);
                    guard.fd.take();
                    if let (Some(journal), Some(t)) = (&self.journal, &removed) {
                        journal.closed(uuid, &t.path, t.open_mode).ok();
                    }
                    drop(guard);
                    // `removed` still holds a clone of the lock's Arc, so the
                    // mutex itself outlives the guard that was just released
                    drop(removed);
                    return true;
                }
                None => {
                    drop(transfers);
                    thread::sleep(Duration::from_micros(LOCK_RETRY_US));
                }
            };
        }
    }

    /// Snapshot of the advertised data-channel endpoints.
    pub fn data_channel_addrs(&self) -> Vec<DataAddress> {
        self.dataaddrs.clone()
    }
}
