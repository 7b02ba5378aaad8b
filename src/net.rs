//! Socket plumbing: data-channel connectors and the daemon accept loops

use std::fmt::Write as _;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};

use crate::addr::DataAddress;
use crate::data_server::EtdDataServer;
use crate::protocol::timeouts;
use crate::registry::EtdState;
use crate::wrapper::EtdServerWrapper;

/// Connect a data-channel client socket. Only the "tcp" protocol token has
/// a transport wired up here; other tokens parse but are not dialable.
pub fn mk_client(proto: &str, host: &str, port: u16) -> Result<TcpStream> {
    if !proto.eq_ignore_ascii_case("tcp") {
        bail!("unsupported data-channel protocol '{}'", proto);
    }
    let addrs = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}:{}", host, port))?;
    let mut last_err = None;
    for sa in addrs {
        match TcpStream::connect_timeout(&sa, timeouts::connect_timeout()) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e).with_context(|| format!("connect {}:{}", host, port)),
        None => bail!("{}:{} did not resolve to any address", host, port),
    }
}

/// Try each advertised address in order; the first successful connect wins.
/// Per-address failures are only reported if every candidate fails.
pub fn connect_any(addrs: &[DataAddress]) -> Result<TcpStream> {
    let mut tried = String::new();
    for addr in addrs {
        match mk_client(&addr.proto, &addr.host, addr.port) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                let _ = write!(tried, "{}: {:#}, ", addr, e);
            }
        }
    }
    bail!("Failed to connect to any of the data servers: {}", tried)
}

/// Bind a listener for one advertised data-channel address.
pub fn bind_data_addr(addr: &DataAddress) -> Result<TcpListener> {
    if !addr.proto.eq_ignore_ascii_case("tcp") {
        bail!("unsupported data-channel protocol '{}'", addr.proto);
    }
    TcpListener::bind((addr.host.as_str(), addr.port))
        .with_context(|| format!("bind data channel {}", addr))
}

/// Control-channel accept loop: one thread and one private server instance
/// per accepted connection, all sharing `state`.
pub fn serve_control(listener: TcpListener, state: Arc<EtdState>) -> Result<()> {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                eprintln!("control conn from {}", peer);
                let state = state.clone();
                thread::spawn(move || {
                    if let Err(e) = EtdServerWrapper::new(stream, state).handle() {
                        eprintln!("control connection error (possible client disconnect): {:#}", e);
                    }
                });
            }
            Err(e) => {
                eprintln!("control accept error: {}", e);
            }
        }
    }
    Ok(())
}

/// Data-channel accept loop.
pub fn serve_data(listener: TcpListener, state: Arc<EtdState>) -> Result<()> {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                eprintln!("data conn from {}", peer);
                let state = state.clone();
                thread::spawn(move || {
                    if let Err(e) = EtdDataServer::new(stream, state).handle() {
                        eprintln!("data connection error (possible client disconnect): {:#}", e);
                    }
                });
            }
            Err(e) => {
                eprintln!("data accept error: {}", e);
            }
        }
    }
    Ok(())
}
