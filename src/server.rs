//! The local transfer server: performs file I/O on this host. One instance
//! owns one UUID for its lifetime; a session exists between a successful
//! `request_file_read`/`request_file_write` and `remove_uuid`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context, Result};
use uuid::Uuid;

use crate::addr::DataAddress;
use crate::net;
use crate::openmode::OpenMode;
use crate::paths::{ensure_parent_exists, normalize_path};
use crate::protocol::DATA_BUF_SIZE;
use crate::registry::{EtdState, Transfer};

/// The capability set shared by the local server and the remote proxy. A
/// client holds one handle per peer and never needs to know which side of
/// the wire it is talking to.
pub trait EtdServerInterface {
    fn list_path(&mut self, path: &str, allow_tilde: bool) -> Result<Vec<String>>;
    fn request_file_write(&mut self, path: &str, mode: OpenMode) -> Result<(Uuid, i64)>;
    fn request_file_read(&mut self, path: &str, already_have: i64) -> Result<(Uuid, i64)>;
    fn data_channel_addr(&mut self) -> Result<Vec<DataAddress>>;
    fn send_file(
        &mut self,
        src_uuid: Uuid,
        dst_uuid: Uuid,
        todo: i64,
        data_addrs: &[DataAddress],
    ) -> Result<bool>;
    fn get_file(
        &mut self,
        src_uuid: Uuid,
        dst_uuid: Uuid,
        todo: i64,
        data_addrs: &[DataAddress],
    ) -> Result<bool>;
    fn remove_uuid(&mut self, uuid: Uuid) -> Result<bool>;
}

pub struct EtdServer {
    uuid: Uuid,
    state: Arc<EtdState>,
}

impl EtdServer {
    pub fn new(state: Arc<EtdState>) -> Self {
        EtdServer {
            uuid: Uuid::new_v4(),
            state,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn open_for_mode(path: &std::path::Path, mode: OpenMode) -> Result<std::fs::File> {
        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::Read => {
                opts.read(true);
            }
            OpenMode::New => {
                opts.write(true).create_new(true);
            }
            OpenMode::OverWrite => {
                opts.write(true).create(true).truncate(true);
            }
            // Resume keeps whatever is there; SkipExisting records the
            // session but the byte phase will refuse it
            OpenMode::Resume | OpenMode::SkipExisting => {
                opts.write(true).create(true);
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o644);
        }
        opts.open(path)
            .with_context(|| format!("open {} for {}", path.display(), mode))
    }
}

impl EtdServerInterface for EtdServer {
    fn list_path(&mut self, path: &str, allow_tilde: bool) -> Result<Vec<String>> {
        ensure!(!path.is_empty(), "We do not allow listing an empty path");

        // A trailing "/" means the caller wants the directory's contents
        let mut pattern = path.to_string();
        if pattern.ends_with('/') {
            pattern.push('*');
        }

        // The glob engine performs no tilde expansion; if the caller asked
        // for it and the path actually contains one, tell them rather than
        // silently matching a literal '~'
        if allow_tilde && pattern.contains('~') {
            bail!("The target O/S does not support the requested tilde expansion");
        }

        let mut rv = Vec::new();
        for entry in glob::glob(&pattern)
            .with_context(|| format!("invalid glob pattern '{}'", pattern))?
            .flatten()
        {
            let mut s = entry.to_string_lossy().into_owned();
            // mark directories the way glob(3) does with GLOB_MARK
            if entry.is_dir() && !s.ends_with('/') {
                s.push('/');
            }
            rv.push(s);
        }
        Ok(rv)
    }

    fn request_file_write(&mut self, path: &str, mode: OpenMode) -> Result<(Uuid, i64)> {
        ensure!(
            mode.is_write(),
            "invalid open mode for requestFileWrite({})",
            path
        );

        // The whole check-and-insert must be atomic, so the registry lock is
        // held until the new entry is in place.
        let mut transfers = self.state.transfers.lock();
        ensure!(
            !transfers.contains_key(&self.uuid),
            "requestFileWrite: this server is already busy"
        );

        let npath = normalize_path(path)?;
        // A write cannot share its path with any other transfer, reads
        // included.
        ensure!(
            !transfers.values().any(|t| t.path == npath),
            "requestFileWrite({}) - the path is already in use",
            path
        );

        ensure_parent_exists(&npath)?;
        let mut fd = Self::open_for_mode(&npath, mode)?;
        let existing = fd.seek(SeekFrom::End(0)).context("seek to end")? as i64;

        transfers.insert(self.uuid, Transfer::new(npath.clone(), mode, fd));
        drop(transfers);

        if let Some(journal) = &self.state.journal {
            journal.opened(&self.uuid, &npath, mode, existing).ok();
        }
        Ok((self.uuid, existing))
    }

    fn request_file_read(&mut self, path: &str, already_have: i64) -> Result<(Uuid, i64)> {
        let mut transfers = self.state.transfers.lock();
        ensure!(
            !transfers.contains_key(&self.uuid),
            "requestFileRead: this server is already busy"
        );

        let npath = normalize_path(path)?;
        // Multiple readers of one path are fine; a writer on it is not.
        ensure!(
            !transfers
                .values()
                .any(|t| t.path == npath && t.open_mode != OpenMode::Read),
            "requestFileRead({}) - the path is already in use",
            path
        );

        let mut fd = Self::open_for_mode(&npath, OpenMode::Read)?;
        let size = fd.seek(SeekFrom::End(0)).context("seek to end")? as i64;
        ensure!(already_have >= 0, "Cannot seek to position {} in file {}", already_have, path);
        fd.seek(SeekFrom::Start(already_have as u64))
            .with_context(|| format!("Cannot seek to position {} in file {}", already_have, path))?;

        transfers.insert(self.uuid, Transfer::new(npath.clone(), OpenMode::Read, fd));
        drop(transfers);

        if let Some(journal) = &self.state.journal {
            journal
                .opened(&self.uuid, &npath, OpenMode::Read, size - already_have)
                .ok();
        }
        Ok((self.uuid, size - already_have))
    }

    fn data_channel_addr(&mut self) -> Result<Vec<DataAddress>> {
        Ok(self.state.data_channel_addrs())
    }

    fn send_file(
        &mut self,
        src_uuid: Uuid,
        dst_uuid: Uuid,
        mut todo: i64,
        data_addrs: &[DataAddress],
    ) -> Result<bool> {
        ensure!(
            src_uuid == self.uuid,
            "The srcUUID '{}' is not our UUID",
            src_uuid
        );

        let total = todo;
        let result = self.state.with_transfer(&self.uuid, |path, mode, io| {
            ensure!(
                mode == OpenMode::Read,
                "This server was initialized, but not for reading a file"
            );
            let fd = io
                .fd
                .as_mut()
                .ok_or_else(|| anyhow!("transfer file is already closed"))?;

            let mut conn = net::connect_any(data_addrs)?;
            let header = format!("{{ uuid:{}, sz:{}}}", dst_uuid, todo);
            conn.write_all(header.as_bytes())
                .context("write data-channel header")?;

            let mut buf = vec![0u8; DATA_BUF_SIZE];
            while todo > 0 {
                let n = todo.min(DATA_BUF_SIZE as i64) as usize;
                fd.read_exact(&mut buf[..n])
                    .with_context(|| format!("short read from {}", path.display()))?;
                conn.write_all(&buf[..n]).context("short write to data channel")?;
                todo -= n as i64;
            }
            // Block until the recipient acknowledges the last byte
            let mut ack = [0u8; 1];
            conn.read_exact(&mut ack).context("waiting for remote ACK")?;

            if let Some(journal) = &self.state.journal {
                journal.pushed(&self.uuid, path, mode, total).ok();
            }
            Ok(())
        });
        match result {
            None => bail!("This server was not initialized yet"),
            Some(r) => r.map(|_| true),
        }
    }

    fn get_file(
        &mut self,
        src_uuid: Uuid,
        dst_uuid: Uuid,
        mut todo: i64,
        data_addrs: &[DataAddress],
    ) -> Result<bool> {
        ensure!(
            dst_uuid == self.uuid,
            "The dstUUID '{}' is not our UUID",
            dst_uuid
        );

        let total = todo;
        let result = self.state.with_transfer(&self.uuid, |path, mode, io| {
            // SkipExisting registers a session but never takes bytes
            ensure!(
                mode.accepts_data(),
                "This server was initialized, but not for writing to file"
            );
            let fd = io
                .fd
                .as_mut()
                .ok_or_else(|| anyhow!("transfer file is already closed"))?;

            let mut conn = net::connect_any(data_addrs)?;
            let header = format!("{{ uuid:{}, push:1, sz:{}}}", src_uuid, todo);
            conn.write_all(header.as_bytes())
                .context("write data-channel header")?;

            let mut buf = vec![0u8; DATA_BUF_SIZE];
            while todo > 0 {
                let want = todo.min(DATA_BUF_SIZE as i64) as usize;
                let n = conn.read(&mut buf[..want]).context("read from data channel")?;
                ensure!(n > 0, "data channel closed before all bytes were received");
                fd.write_all(&buf[..n])
                    .with_context(|| format!("short write to {}", path.display()))?;
                todo -= n as i64;
            }
            conn.write_all(&[crate::protocol::ACK_BYTE])
                .context("send ACK")?;

            if let Some(journal) = &self.state.journal {
                journal.pulled(&self.uuid, path, mode, total).ok();
            }
            Ok(())
        });
        match result {
            None => bail!("This server was not initialized yet"),
            Some(r) => r.map(|_| true),
        }
    }

    fn remove_uuid(&mut self, uuid: Uuid) -> Result<bool> {
        ensure!(uuid == self.uuid, "Cannot remove someone else's UUID!");
        Ok(self.state.remove(&uuid))
    }
}

impl Drop for EtdServer {
    fn drop(&mut self) {
        // best effort; a session that was already removed is fine
        self.state.remove(&self.uuid);
    }
}
