//! Serves one accepted data-channel connection: a `{ key:value, … }` header
//! naming the transfer, then the raw payload bytes, then a one-byte ACK.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use uuid::Uuid;

use crate::openmode::OpenMode;
use crate::protocol::{ACK_BYTE, DATA_BUF_SIZE, MAX_HEADER_SIZE};
use crate::registry::EtdState;

pub struct EtdDataServer {
    conn: TcpStream,
    state: Arc<EtdState>,
}

/// Extract the key-value pairs of a command header body (the text between
/// `{` and `}`). Keys are at least two characters, start with a letter,
/// and compare case-insensitively; values are either quoted strings (with
/// backslash escapes, which are stripped) or runs of non-whitespace,
/// non-comma characters. Duplicate keys are a protocol error.
pub fn parse_kv_header(body: &str) -> Result<HashMap<String, String>> {
    let b = body.as_bytes();
    let mut map = HashMap::new();
    let mut i = 0;
    while i < b.len() {
        if !b[i].is_ascii_alphabetic() {
            i += 1;
            continue;
        }
        let k0 = i;
        i += 1;
        while i < b.len() && (b[i].is_ascii_alphanumeric() || b[i] == b'_' || b[i] == b'-') {
            i += 1;
        }
        if i - k0 < 2 {
            continue;
        }
        let key = body[k0..i].to_ascii_lowercase();

        let mut j = i;
        while j < b.len() && b[j].is_ascii_whitespace() {
            j += 1;
        }
        if j >= b.len() || b[j] != b':' {
            // a stray word, not a key-value pair
            continue;
        }
        j += 1;
        while j < b.len() && b[j].is_ascii_whitespace() {
            j += 1;
        }

        let value = if j < b.len() && b[j] == b'"' {
            j += 1;
            let v0 = j;
            let mut escaped = false;
            loop {
                ensure!(j < b.len(), "unterminated quoted value for key '{}'", key);
                if !escaped && b[j] == b'"' {
                    break;
                }
                escaped = !escaped && b[j] == b'\\';
                j += 1;
            }
            let raw = &body[v0..j];
            j += 1;
            raw.replace('\\', "")
        } else {
            let v0 = j;
            while j < b.len() && !b[j].is_ascii_whitespace() && b[j] != b',' {
                j += 1;
            }
            if j == v0 {
                continue;
            }
            body[v0..j].replace('\\', "")
        };

        ensure!(
            map.insert(key.clone(), value).is_none(),
            "duplicate key '{}' in command",
            key
        );
        i = j;
    }
    Ok(map)
}

fn push_n(conn: &mut TcpStream, fd: &mut File, buf: &mut [u8], mut n: i64) -> Result<()> {
    while n > 0 {
        let chunk = (n as usize).min(buf.len());
        fd.read_exact(&mut buf[..chunk])
            .context("short read from transfer file")?;
        conn.write_all(&buf[..chunk])
            .context("short write to data channel")?;
        n -= chunk as i64;
    }
    // a read here doubles as "the recipient has everything"
    let mut ack = [0u8; 1];
    conn.read_exact(&mut ack).context("waiting for remote ACK")?;
    Ok(())
}

// Payload bytes that arrived on the heels of the command header sit in
// `buf[rd..wr]` and are flushed before any further socket reads.
fn pull_n(
    conn: &mut TcpStream,
    fd: &mut File,
    buf: &mut [u8],
    mut rd: usize,
    mut wr: usize,
    mut n: i64,
) -> Result<()> {
    while n > 0 {
        let have = (wr - rd) as i64;
        if have > 0 {
            let flush = have.min(n) as usize;
            fd.write_all(&buf[rd..rd + flush])
                .context("short write to transfer file")?;
            n -= flush as i64;
            rd += flush;
            if rd == wr {
                rd = 0;
                wr = 0;
            }
            continue;
        }
        rd = 0;
        wr = 0;
        let want = (n as usize).min(buf.len());
        let a = conn
            .read(&mut buf[..want])
            .context("read from data channel")?;
        ensure!(
            a > 0,
            "No bytes read from client and no more bytes still left in buffer"
        );
        wr = a;
    }
    conn.write_all(&[ACK_BYTE]).context("send ACK")?;
    Ok(())
}

impl EtdDataServer {
    pub fn new(conn: TcpStream, state: Arc<EtdState>) -> Self {
        EtdDataServer { conn, state }
    }

    /// Serve commands until the peer disconnects. Each round: hunt for a
    /// `{ … }` header within the first 4 KiB, validate it, acquire the named
    /// transfer, run the byte phase.
    pub fn handle(mut self) -> Result<()> {
        let mut buf = vec![0u8; DATA_BUF_SIZE];
        loop {
            let mut cur = 0usize;
            let close = loop {
                if cur >= MAX_HEADER_SIZE {
                    bail!("client sent {} bytes without a complete command", cur);
                }
                let n = self
                    .conn
                    .read(&mut buf[cur..MAX_HEADER_SIZE])
                    .context("read data channel")?;
                if n == 0 {
                    if cur == 0 {
                        // peer is done sending commands
                        return Ok(());
                    }
                    bail!("Failed to read data from remote end");
                }
                cur += n;
                // anything that does not open with a command block is abuse
                ensure!(
                    buf[0] == b'{',
                    "Client is messing with us - doesn't look like it is going to send a command"
                );
                if let Some(pos) = buf[..cur].iter().position(|b| *b == b'}') {
                    break pos;
                }
            };

            let body = std::str::from_utf8(&buf[1..close])
                .context("command header is not valid text")?;
            let kv = parse_kv_header(body)?;

            let uuid_s = kv.get("uuid").context("No UUID was sent")?;
            let sz_s = kv.get("sz").context("No amount was sent")?;
            if let Some(push) = kv.get("push") {
                ensure!(
                    push == "1",
                    "push keyword may only take one specific value"
                );
            }
            let push = kv.contains_key("push");
            let uuid = Uuid::parse_str(uuid_s)
                .with_context(|| format!("'{}' is not a valid UUID", uuid_s))?;
            let sz: i64 = sz_s
                .parse()
                .with_context(|| format!("'{}' is not a valid byte count", sz_s))?;

            // payload may already have started right behind the header
            let rd_pos = close + 1;
            let conn = &mut self.conn;
            let journal = &self.state.journal;
            let result = self.state.with_transfer(&uuid, |path, mode, io| {
                // mode compatibility is only worth checking once the lock is
                // actually ours
                ensure!(
                    if push {
                        mode == OpenMode::Read
                    } else {
                        mode.accepts_data()
                    },
                    "The referred-to transfer's open mode ({}) is not compatible with the current data request",
                    mode
                );
                let fd = io
                    .fd
                    .as_mut()
                    .context("transfer file is already closed")?;
                if push {
                    push_n(conn, fd, &mut buf, sz)?;
                    if let Some(journal) = journal {
                        journal.pushed(&uuid, path, mode, sz).ok();
                    }
                } else {
                    pull_n(conn, fd, &mut buf, rd_pos, cur, sz)?;
                    if let Some(journal) = journal {
                        journal.pulled(&uuid, path, mode, sz).ok();
                    }
                }
                Ok(())
            });
            match result {
                None => bail!("No transfer associated with the UUID"),
                Some(r) => r?,
            }
        }
    }
}
