//! Parsing and formatting of `<proto/host:port>` data-channel designators

use std::fmt;

use anyhow::{bail, Context, Result};

/// One advertised data-channel endpoint. `host` is stored unbracketed; an
/// IPv6 literal (possibly carrying a `/prefix` or `%zone`) is re-bracketed
/// on output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAddress {
    pub proto: String,
    pub host: String,
    pub port: u16,
}

impl DataAddress {
    pub fn new(proto: &str, host: &str, port: u16) -> Self {
        DataAddress {
            proto: proto.to_string(),
            host: host.to_string(),
            port,
        }
    }
}

impl fmt::Display for DataAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains([':', '/', '%']) {
            write!(f, "<{}/[{}]:{}>", self.proto, self.host, self.port)
        } else {
            write!(f, "<{}/{}:{}>", self.proto, self.host, self.port)
        }
    }
}

// Bracketed IPv6 literal body: address characters, then an optional /prefix
// of at most three digits, then an optional %zone.
fn is_ipv6_literal(s: &str) -> bool {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() && (b[i].is_ascii_alphanumeric() || b[i] == b':') {
        i += 1;
    }
    if i == 0 {
        return false;
    }
    if i < b.len() && b[i] == b'/' {
        i += 1;
        let d0 = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        if i == d0 || i - d0 > 3 {
            return false;
        }
    }
    if i < b.len() && b[i] == b'%' {
        i += 1;
        let z0 = i;
        while i < b.len() && b[i].is_ascii_alphanumeric() {
            i += 1;
        }
        if i == z0 {
            return false;
        }
    }
    i == b.len()
}

// RFC-1123 hostname shape: dot-separated labels of at most 63 alphanumeric
// or hyphen characters, no leading or trailing hyphen. IPv4 literals match
// this too (digits-only labels), which is intentional.
fn is_hostname(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|label| {
            let b = label.as_bytes();
            !b.is_empty()
                && b.len() <= 63
                && b.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'-')
                && b[0] != b'-'
                && b[b.len() - 1] != b'-'
        })
}

/// Parse a `<proto/host:port>` designator.
pub fn decode_data_addr(s: &str) -> Result<DataAddress> {
    let invalid = || format!("The string '{}' is not a valid data address designator", s);

    let inner = s
        .strip_prefix('<')
        .and_then(|r| r.strip_suffix('>'))
        .with_context(invalid)?;
    // proto runs up to the first '/'; an IPv6 prefix length never gets here
    let (proto, rest) = inner.split_once('/').with_context(invalid)?;
    if proto.is_empty() {
        bail!(invalid());
    }
    // port sits after the last ':', clear of any colons inside a bracketed host
    let (host_part, port_s) = rest.rsplit_once(':').with_context(invalid)?;

    let host = if let Some(v6) = host_part
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
    {
        if !is_ipv6_literal(v6) {
            bail!(invalid());
        }
        v6
    } else {
        if !is_hostname(host_part) {
            bail!(invalid());
        }
        if host_part.len() > 255 {
            bail!("Host names can not be longer than 255 characters (RFC1123)");
        }
        host_part
    };

    if port_s.is_empty() || !port_s.bytes().all(|b| b.is_ascii_digit()) {
        bail!(invalid());
    }
    let port: u16 = port_s
        .parse()
        .with_context(|| format!("'{}' is not a valid port number", port_s))?;

    Ok(DataAddress::new(proto, host, port))
}

/// Parse a comma-separated run of designators, as carried by the
/// `send-file` control command. Empty segments are skipped.
pub fn decode_data_addr_list(s: &str) -> Result<Vec<DataAddress>> {
    s.split(',')
        .filter(|seg| !seg.is_empty())
        .map(decode_data_addr)
        .collect()
}
