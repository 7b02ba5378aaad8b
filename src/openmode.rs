//! Open modes for transfer sessions and their wire tokens

use std::fmt;
use std::str::FromStr;

use anyhow::bail;

/// How a transfer session opens its local file. `Read` is the only mode a
/// read session accepts; the rest are write-class. `SkipExisting` registers
/// a transfer but refuses payload bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    New,
    OverWrite,
    Resume,
    SkipExisting,
}

impl OpenMode {
    pub fn is_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    /// Write-class modes that actually accept payload bytes. `SkipExisting`
    /// is deliberately excluded.
    pub fn accepts_data(self) -> bool {
        matches!(self, OpenMode::New | OpenMode::OverWrite | OpenMode::Resume)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpenMode::Read => "Read",
            OpenMode::New => "New",
            OpenMode::OverWrite => "OverWrite",
            OpenMode::Resume => "Resume",
            OpenMode::SkipExisting => "SkipExisting",
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpenMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for mode in [
            OpenMode::Read,
            OpenMode::New,
            OpenMode::OverWrite,
            OpenMode::Resume,
            OpenMode::SkipExisting,
        ] {
            if s.eq_ignore_ascii_case(mode.as_str()) {
                return Ok(mode);
            }
        }
        bail!("unrecognized open mode '{}'", s)
    }
}
