//! Line-oriented control protocol: buffered line extraction, reply lines,
//! and the request grammar served by the daemon.
//!
//! Lines terminate on CR, LF, or CRLF; empty lines are discarded. The
//! grammars here are tiny, so they are hand-scanned rather than fed to a
//! regex engine.

use std::io::{self, Read};

/// Incremental scanner over a fixed-size read buffer. Complete lines are
/// split off by [`LineBuffer::take_lines`]; the trailing partial line is
/// moved to the buffer front and completed by later reads.
pub struct LineBuffer {
    buf: Vec<u8>,
    len: usize,
}

impl LineBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        LineBuffer {
            buf: vec![0u8; cap],
            len: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// One read into the free tail. Returns the number of bytes read; zero
    /// means the peer closed the connection.
    pub fn fill(&mut self, r: &mut dyn Read) -> io::Result<usize> {
        let n = r.read(&mut self.buf[self.len..])?;
        self.len += n;
        Ok(n)
    }

    /// Extract every complete line buffered so far. Bytes after the last
    /// line terminator stay put as the start of the next line.
    pub fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut start = 0;
        for i in 0..self.len {
            let b = self.buf[i];
            if b == b'\r' || b == b'\n' {
                if i > start {
                    lines.push(String::from_utf8_lossy(&self.buf[start..i]).into_owned());
                }
                start = i + 1;
                consumed = i + 1;
            }
        }
        self.buf.copy_within(consumed..self.len, 0);
        self.len -= consumed;
        lines
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Err,
}

/// Parse one reply line: `OK` or `ERR` (case-insensitive), optionally
/// followed by whitespace and a payload. Returns `None` when the line is
/// not a reply at all.
pub fn parse_reply(line: &str) -> Option<(ReplyStatus, Option<&str>)> {
    let (word, rest) = match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], &line[i..]),
        None => (line, ""),
    };
    let status = if word.eq_ignore_ascii_case("OK") {
        ReplyStatus::Ok
    } else if word.eq_ignore_ascii_case("ERR") {
        ReplyStatus::Err
    } else {
        return None;
    };
    let info = rest.trim_start();
    Some((status, (!info.is_empty()).then_some(info)))
}

/// Structural shape of one control request. Fields are raw slices of the
/// request line; value decoding (UUIDs, open modes, data addresses) happens
/// at dispatch so that a bad value earns an `ERR` reply while an unknown
/// shape terminates the session.
#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    List { path: &'a str },
    WriteFile { mode: &'a str, path: &'a str },
    ReadFile { already_have: &'a str, path: &'a str },
    SendFile { src: &'a str, dst: &'a str, todo: &'a str, addrs: &'a str },
    DataChannelAddr,
    RemoveUuid { uuid: &'a str },
}

fn strip_icase<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|p| p.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}

// At least one whitespace character, then the remainder.
fn skip_ws(s: &str) -> Option<&str> {
    let t = s.trim_start();
    (t.len() < s.len()).then_some(t)
}

// Leading run of non-whitespace, plus whatever follows it.
fn word(s: &str) -> Option<(&str, &str)> {
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    (end > 0).then(|| (&s[..end], &s[end..]))
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Match a request line against the known command shapes. `None` means the
/// command is unknown and the connection must be torn down.
pub fn match_request(line: &str) -> Option<Request<'_>> {
    if line.eq_ignore_ascii_case("data-channel-addr") {
        return Some(Request::DataChannelAddr);
    }
    if let Some(rest) = strip_icase(line, "list") {
        let path = skip_ws(rest)?;
        if path.is_empty() {
            return None;
        }
        return Some(Request::List { path });
    }
    if let Some(rest) = strip_icase(line, "write-file-") {
        let (mode, rest) = word(rest)?;
        let path = skip_ws(rest)?;
        if path.is_empty() {
            return None;
        }
        return Some(Request::WriteFile { mode, path });
    }
    if let Some(rest) = strip_icase(line, "read-file") {
        let rest = skip_ws(rest)?;
        let (already_have, rest) = word(rest)?;
        if !all_digits(already_have) {
            return None;
        }
        let path = skip_ws(rest)?;
        if path.is_empty() {
            return None;
        }
        return Some(Request::ReadFile { already_have, path });
    }
    if let Some(rest) = strip_icase(line, "send-file") {
        let rest = skip_ws(rest)?;
        let (src, rest) = word(rest)?;
        let rest = skip_ws(rest)?;
        let (dst, rest) = word(rest)?;
        let rest = skip_ws(rest)?;
        let (todo, rest) = word(rest)?;
        if !all_digits(todo) {
            return None;
        }
        let rest = skip_ws(rest)?;
        let (addrs, rest) = word(rest)?;
        if !rest.is_empty() {
            return None;
        }
        return Some(Request::SendFile { src, dst, todo, addrs });
    }
    if let Some(rest) = strip_icase(line, "remove-uuid") {
        let rest = skip_ws(rest)?;
        let (uuid, rest) = word(rest)?;
        if !rest.is_empty() {
            return None;
        }
        return Some(Request::RemoveUuid { uuid });
    }
    None
}
