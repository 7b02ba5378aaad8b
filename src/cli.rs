//! Shared CLI fragments for the etd daemon binary

use clap::Parser;
use std::path::PathBuf;

/// Daemon options used by etdd
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "etd - peer-to-peer e-transfer daemon")]
pub struct DaemonOpts {
    /// Control-channel bind address (host:port)
    #[arg(long, default_value = "127.0.0.1:2620")] // SECURITY: bind to localhost by default
    pub control: String,

    /// Data-channel address to listen on and advertise (<proto/host:port>);
    /// may be given more than once
    #[arg(long = "data", default_value = "<tcp/127.0.0.1:2630>")]
    pub data: Vec<String>,

    /// Append a JSONL journal of session events to this file
    #[arg(long)]
    pub journal: Option<PathBuf>,
}
