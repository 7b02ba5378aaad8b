//! Client-side orchestration of one transfer between two peers

use anyhow::{Context, Result};

use crate::openmode::OpenMode;
use crate::server::EtdServerInterface;

/// Which side opens the data connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The source connects to the destination's data channel and writes.
    Push,
    /// The destination connects to the source's data channel and reads.
    /// Requires the destination handle to be a local server.
    Pull,
}

/// Sequence one file transfer: set up a write session on `dst`, a read
/// session on `src` picking up where the destination left off, move the
/// missing bytes, then tear both sessions down. Returns the number of
/// payload bytes moved.
///
/// `SkipExisting` registers the destination session but moves no bytes.
pub fn transfer(
    src: &mut dyn EtdServerInterface,
    dst: &mut dyn EtdServerInterface,
    src_path: &str,
    dst_path: &str,
    mode: OpenMode,
    direction: Direction,
) -> Result<i64> {
    let (dst_uuid, already_have) = dst
        .request_file_write(dst_path, mode)
        .with_context(|| format!("set up write session for {}", dst_path))?;
    let (src_uuid, todo) = src
        .request_file_read(src_path, already_have)
        .with_context(|| format!("set up read session for {}", src_path))?;

    let moved = if todo > 0 && mode.accepts_data() {
        match direction {
            Direction::Push => {
                let addrs = dst.data_channel_addr()?;
                src.send_file(src_uuid, dst_uuid, todo, &addrs)?;
            }
            Direction::Pull => {
                let addrs = src.data_channel_addr()?;
                dst.get_file(src_uuid, dst_uuid, todo, &addrs)?;
            }
        }
        todo
    } else {
        0
    };

    src.remove_uuid(src_uuid)?;
    dst.remove_uuid(dst_uuid)?;
    Ok(moved)
}
