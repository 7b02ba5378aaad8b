//! Serves the control protocol on one accepted connection, backed by a
//! private local server instance. Command errors turn into `ERR` replies;
//! an unknown command closes the connection and ends the session.

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crate::addr::decode_data_addr_list;
use crate::control::{match_request, LineBuffer, Request};
use crate::openmode::OpenMode;
use crate::protocol::CONTROL_BUF_SIZE;
use crate::registry::EtdState;
use crate::server::{EtdServer, EtdServerInterface};

pub struct EtdServerWrapper {
    conn: TcpStream,
    server: EtdServer,
}

impl EtdServerWrapper {
    pub fn new(conn: TcpStream, state: Arc<EtdState>) -> Self {
        EtdServerWrapper {
            conn,
            server: EtdServer::new(state),
        }
    }

    /// Read commands until the peer goes away or sends something fatal.
    /// Dropping `self.server` on the way out tears down any session the
    /// connection left behind.
    pub fn handle(mut self) -> Result<()> {
        let mut lb = LineBuffer::with_capacity(CONTROL_BUF_SIZE);
        loop {
            if lb.is_full() {
                bail!(
                    "no complete command within {} bytes, giving up on this client",
                    CONTROL_BUF_SIZE
                );
            }
            let n = lb.fill(&mut self.conn).context("read control channel")?;
            if n == 0 {
                // orderly shutdown from the peer
                if lb.is_empty() {
                    return Ok(());
                }
                bail!("connection closed mid-command");
            }
            for line in lb.take_lines() {
                let request = match match_request(&line) {
                    Some(r) => r,
                    None => {
                        // not a command we know: cut the peer off entirely
                        eprintln!("unknown control command, closing connection");
                        let _ = self.conn.shutdown(Shutdown::Both);
                        return Ok(());
                    }
                };
                let replies = match self.run(request) {
                    Ok(replies) => replies,
                    Err(e) => vec![format!("ERR {:#}", e)],
                };
                for reply in replies {
                    self.conn.write_all(reply.as_bytes())?;
                    self.conn.write_all(b"\n")?;
                }
            }
        }
    }

    fn run(&mut self, request: Request<'_>) -> Result<Vec<String>> {
        match request {
            Request::List { path } => {
                // remote listings never get tilde expansion
                let entries = self.server.list_path(path, false)?;
                let mut replies: Vec<String> =
                    entries.into_iter().map(|e| format!("OK {}", e)).collect();
                replies.push("OK".to_string());
                Ok(replies)
            }
            Request::WriteFile { mode, path } => {
                let mode: OpenMode = mode.parse()?;
                let (uuid, have) = self.server.request_file_write(path, mode)?;
                Ok(vec![
                    format!("AlreadyHave:{}", have),
                    format!("UUID:{}", uuid),
                    "OK".to_string(),
                ])
            }
            Request::ReadFile { already_have, path } => {
                let already_have: i64 = already_have
                    .parse()
                    .with_context(|| format!("invalid byte count '{}'", already_have))?;
                let (uuid, remain) = self.server.request_file_read(path, already_have)?;
                Ok(vec![
                    format!("Remain:{}", remain),
                    format!("UUID:{}", uuid),
                    "OK".to_string(),
                ])
            }
            Request::SendFile {
                src,
                dst,
                todo,
                addrs,
            } => {
                let src = parse_uuid(src)?;
                let dst = parse_uuid(dst)?;
                let todo: i64 = todo
                    .parse()
                    .with_context(|| format!("invalid byte count '{}'", todo))?;
                let addrs = decode_data_addr_list(addrs)?;
                let sent = self.server.send_file(src, dst, todo, &addrs)?;
                Ok(vec![if sent {
                    "OK".to_string()
                } else {
                    "ERR Failed to send file".to_string()
                }])
            }
            Request::DataChannelAddr => {
                let mut replies: Vec<String> = self
                    .server
                    .data_channel_addr()?
                    .into_iter()
                    .map(|a| format!("OK {}", a))
                    .collect();
                replies.push("OK".to_string());
                Ok(replies)
            }
            Request::RemoveUuid { uuid } => {
                let removed = self.server.remove_uuid(parse_uuid(uuid)?)?;
                Ok(vec![if removed {
                    "OK".to_string()
                } else {
                    "ERR Failed to remove UUID".to_string()
                }])
            }
        }
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("'{}' is not a valid UUID", s))
}
