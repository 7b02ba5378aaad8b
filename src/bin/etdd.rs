use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;

use etd::addr::{decode_data_addr, DataAddress};
use etd::cli::DaemonOpts;
use etd::journal::TransferJournal;
use etd::net;
use etd::registry::EtdState;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let dataaddrs: Vec<DataAddress> = opts
        .data
        .iter()
        .map(|s| decode_data_addr(s))
        .collect::<Result<_>>()?;

    println!(
        "etd daemon\n  Control: {}\n  Data:    {}",
        opts.control,
        dataaddrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let state = Arc::new(match &opts.journal {
        Some(path) => EtdState::with_journal(dataaddrs.clone(), TransferJournal::new(path)),
        None => EtdState::new(dataaddrs.clone()),
    });

    // one listener thread per data-channel address; the control loop keeps
    // the main thread
    for addr in &dataaddrs {
        let listener = net::bind_data_addr(addr)?;
        let state = state.clone();
        let addr = addr.clone();
        thread::spawn(move || {
            if let Err(e) = net::serve_data(listener, state) {
                eprintln!("data listener {} failed: {:#}", addr, e);
            }
        });
    }

    let listener = TcpListener::bind(&opts.control)
        .with_context(|| format!("bind control channel {}", opts.control))?;
    eprintln!("etd daemon listening on {}", opts.control);
    net::serve_control(listener, state)
}
