//! The remote-server shim: looks exactly like a local server, but every
//! operation turns into one control-protocol exchange with a remote daemon.
//!
//! A proxy owns one persistent control connection. Calls must not overlap
//! on one instance; the proxy does no internal serialization.

use std::io::Write;
use std::net::TcpStream;

use anyhow::{bail, ensure, Context, Result};
use uuid::Uuid;

use crate::addr::{decode_data_addr, DataAddress};
use crate::control::{parse_reply, LineBuffer, ReplyStatus};
use crate::openmode::OpenMode;
use crate::protocol::{CONTROL_BUF_SIZE, LISTING_BUF_SIZE};
use crate::server::EtdServerInterface;

pub struct EtdProxy {
    conn: TcpStream,
}

impl EtdProxy {
    /// Open a control channel to a remote daemon.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let conn = TcpStream::connect((host, port))
            .with_context(|| format!("connect control channel {}:{}", host, port))?;
        Ok(EtdProxy { conn })
    }

    pub fn from_stream(conn: TcpStream) -> Self {
        EtdProxy { conn }
    }

    fn send_request(&mut self, line: &str) -> Result<()> {
        self.conn
            .write_all(line.as_bytes())
            .and_then(|_| self.conn.write_all(b"\n"))
            .context("Failed to send request to remote end")
    }

    /// Collect an `OK <payload>`* stream terminated by a bare `OK`. An `ERR`
    /// is only legal as the very first reply line.
    fn read_ok_stream(&mut self, buf_size: usize, what: &str) -> Result<Vec<String>> {
        let mut lb = LineBuffer::with_capacity(buf_size);
        let mut rv = Vec::new();
        let mut saw_ok = false;
        let mut finished = false;

        while !finished && !lb.is_full() {
            ensure!(
                lb.fill(&mut self.conn)? > 0,
                "Failed to read data from remote end"
            );
            for line in lb.take_lines() {
                ensure!(
                    !finished,
                    "There are unprocessed lines of reply from the server. This is probably a protocol error."
                );
                let (status, info) = parse_reply(&line)
                    .with_context(|| format!("Server replied with an invalid line: '{}'", line))?;
                ensure!(
                    !(saw_ok && status == ReplyStatus::Err),
                    "The server changed its mind about the success of the call in the middle of the reply"
                );
                if status == ReplyStatus::Err {
                    bail!("{} failed - {}", what, info.unwrap_or("<unknown reason>"));
                }
                saw_ok = true;
                match info {
                    // bare OK is the end-of-reply sentinel
                    None => finished = true,
                    Some(payload) => rv.push(payload.to_string()),
                }
            }
        }
        ensure!(
            lb.is_empty(),
            "{}: there are {} unconsumed bytes left in the input. This is likely a protocol error.",
            what,
            lb.len()
        );
        ensure!(
            finished,
            "{}: the reply exceeded the {} byte buffer without completing. This is likely a protocol error.",
            what,
            buf_size
        );
        Ok(rv)
    }

    /// Await the single `OK`/`ERR` line of a one-reply command.
    fn read_single_reply(&mut self, what: &str) -> Result<()> {
        let mut lb = LineBuffer::with_capacity(CONTROL_BUF_SIZE);
        loop {
            ensure!(!lb.is_full(), "{}: reply did not fit the buffer", what);
            ensure!(
                lb.fill(&mut self.conn)? > 0,
                "Failed to read data from remote end"
            );
            let lines = lb.take_lines();
            if lines.is_empty() {
                continue;
            }
            ensure!(
                lines.len() == 1 && lb.is_empty(),
                "The server sent the wrong number of responses - this is likely a protocol error"
            );
            let (status, info) = parse_reply(&lines[0])
                .with_context(|| format!("Server replied with an invalid line: '{}'", lines[0]))?;
            ensure!(
                status == ReplyStatus::Ok,
                "{} failed - {}",
                what,
                info.unwrap_or("<unknown reason>")
            );
            return Ok(());
        }
    }

    /// Await a `UUID:`/`<count_tag>:` field pair terminated by `OK`.
    fn read_session_reply(
        &mut self,
        what: &str,
        count_tag: &str,
        allow_negative: bool,
    ) -> Result<(Uuid, i64)> {
        let mut lb = LineBuffer::with_capacity(CONTROL_BUF_SIZE);
        let mut uuid: Option<Uuid> = None;
        let mut count: Option<i64> = None;
        let mut finished = false;

        while !finished && !lb.is_full() {
            ensure!(
                lb.fill(&mut self.conn)? > 0,
                "Failed to read data from remote end"
            );
            for line in lb.take_lines() {
                ensure!(
                    !finished,
                    "{}: there are unprocessed lines of input left, this means the server sent an erroneous reply.",
                    what
                );
                if let Some(value) = field_value(&line, "UUID:") {
                    ensure!(uuid.is_none(), "Server had already sent a UUID");
                    uuid = Some(
                        Uuid::parse_str(value)
                            .with_context(|| format!("Server sent an invalid UUID '{}'", value))?,
                    );
                } else if let Some(value) = field_value(&line, count_tag) {
                    ensure!(count.is_none(), "Server had already sent a file position");
                    count = Some(
                        parse_off(value, allow_negative)
                            .with_context(|| format!("Server sent an invalid count '{}'", value))?,
                    );
                } else if let Some((status, info)) = parse_reply(&line) {
                    ensure!(
                        status == ReplyStatus::Ok,
                        "{} failed - {}",
                        what,
                        info.unwrap_or("<unknown reason>")
                    );
                    finished = true;
                } else {
                    bail!(
                        "{}: the server sent a reply that we did not recognize: {}",
                        what,
                        line
                    );
                }
            }
        }
        ensure!(
            lb.is_empty(),
            "{}: there are {} unconsumed server bytes left in the input. This is likely a protocol error.",
            what,
            lb.len()
        );
        ensure!(
            finished,
            "{}: the reply exceeded the buffer without completing. This is likely a protocol error.",
            what
        );
        match (uuid, count) {
            (Some(u), Some(c)) => Ok((u, c)),
            _ => bail!("{}: the server did NOT send all required fields", what),
        }
    }
}

fn field_value<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let rest = line
        .get(..tag.len())
        .filter(|p| p.eq_ignore_ascii_case(tag))
        .map(|_| &line[tag.len()..])?;
    (!rest.is_empty() && !rest.contains(char::is_whitespace)).then_some(rest)
}

fn parse_off(s: &str, allow_negative: bool) -> Option<i64> {
    let digits = if allow_negative {
        s.strip_prefix('-').unwrap_or(s)
    } else {
        s
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl EtdServerInterface for EtdProxy {
    fn list_path(&mut self, path: &str, _allow_tilde: bool) -> Result<Vec<String>> {
        self.send_request(&format!("list {}", path))?;
        self.read_ok_stream(LISTING_BUF_SIZE, &format!("listPath({})", path))
    }

    fn request_file_write(&mut self, path: &str, mode: OpenMode) -> Result<(Uuid, i64)> {
        self.send_request(&format!("write-file-{} {}", mode, path))?;
        self.read_session_reply(
            &format!("requestFileWrite({})", path),
            "AlreadyHave:",
            false,
        )
    }

    fn request_file_read(&mut self, path: &str, already_have: i64) -> Result<(Uuid, i64)> {
        self.send_request(&format!("read-file {} {}", already_have, path))?;
        self.read_session_reply(&format!("requestFileRead({})", path), "Remain:", true)
    }

    fn data_channel_addr(&mut self) -> Result<Vec<DataAddress>> {
        self.send_request("data-channel-addr")?;
        self.read_ok_stream(CONTROL_BUF_SIZE, "dataChannelAddr()")?
            .iter()
            .map(|s| decode_data_addr(s))
            .collect()
    }

    fn send_file(
        &mut self,
        src_uuid: Uuid,
        dst_uuid: Uuid,
        todo: i64,
        data_addrs: &[DataAddress],
    ) -> Result<bool> {
        let addrs = data_addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.send_request(&format!(
            "send-file {} {} {} {}",
            src_uuid, dst_uuid, todo, addrs
        ))?;
        self.read_single_reply("sendFile")?;
        Ok(true)
    }

    fn get_file(
        &mut self,
        _src_uuid: Uuid,
        _dst_uuid: Uuid,
        _todo: i64,
        _data_addrs: &[DataAddress],
    ) -> Result<bool> {
        // The control protocol has no pull command; a pull is always driven
        // by the destination's own (local) server.
        bail!("getFile is not available on a remote server handle")
    }

    fn remove_uuid(&mut self, uuid: Uuid) -> Result<bool> {
        self.send_request(&format!("remove-uuid {}", uuid))?;
        self.read_single_reply("removeUUID")?;
        Ok(true)
    }
}
