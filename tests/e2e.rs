use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use uuid::Uuid;

use etd::addr::DataAddress;
use etd::client::{transfer, Direction};
use etd::journal::{SessionEvent, TransferJournal};
use etd::net;
use etd::openmode::OpenMode;
use etd::proxy::EtdProxy;
use etd::registry::EtdState;
use etd::server::{EtdServer, EtdServerInterface};

fn write_file(path: &std::path::Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    fs::write(path, data)?;
    Ok(())
}

fn free_port() -> u16 {
    let sock = TcpListener::bind("127.0.0.1:0").unwrap();
    let p = sock.local_addr().unwrap().port();
    drop(sock);
    p
}

/// One in-process peer: a registry plus a live data listener advertising
/// itself under `data_addr`.
struct Peer {
    state: Arc<EtdState>,
    data_addr: DataAddress,
}

fn spawn_peer() -> Peer {
    spawn_peer_with_journal(None)
}

fn spawn_peer_with_journal(journal: Option<TransferJournal>) -> Peer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let data_addr = DataAddress::new("tcp", "127.0.0.1", port);
    let state = Arc::new(match journal {
        Some(j) => EtdState::with_journal(vec![data_addr.clone()], j),
        None => EtdState::new(vec![data_addr.clone()]),
    });
    {
        let state = state.clone();
        thread::spawn(move || {
            let _ = net::serve_data(listener, state);
        });
    }
    Peer { state, data_addr }
}

/// Also serve the control protocol for a peer; returns the control port.
fn spawn_control(peer: &Peer) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = peer.state.clone();
    thread::spawn(move || {
        let _ = net::serve_control(listener, state);
    });
    port
}

#[test]
fn push_to_fresh_target() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let src_path = dir_a.path().join("data/src.bin");
    let dst_path = dir_b.path().join("out/dst.bin");
    write_file(&src_path, 1000)?;

    let peer_a = spawn_peer();
    let peer_b = spawn_peer();
    let mut src = EtdServer::new(peer_a.state.clone());
    let mut dst = EtdServer::new(peer_b.state.clone());

    let moved = transfer(
        &mut src,
        &mut dst,
        src_path.to_str().unwrap(),
        dst_path.to_str().unwrap(),
        OpenMode::New,
        Direction::Push,
    )?;
    assert_eq!(moved, 1000);
    assert_eq!(fs::read(&src_path)?, fs::read(&dst_path)?);

    // both sessions are gone
    assert!(peer_a.state.transfers.lock().is_empty());
    assert!(peer_b.state.transfers.lock().is_empty());
    Ok(())
}

#[test]
fn pull_variant_matches_push() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let src_path = dir_a.path().join("src.bin");
    let dst_path = dir_b.path().join("dst.bin");
    write_file(&src_path, 1000)?;

    let peer_a = spawn_peer();
    let peer_b = spawn_peer();
    let mut src = EtdServer::new(peer_a.state.clone());
    let mut dst = EtdServer::new(peer_b.state.clone());

    let moved = transfer(
        &mut src,
        &mut dst,
        src_path.to_str().unwrap(),
        dst_path.to_str().unwrap(),
        OpenMode::New,
        Direction::Pull,
    )?;
    assert_eq!(moved, 1000);
    assert_eq!(fs::read(&src_path)?, fs::read(&dst_path)?);
    Ok(())
}

#[test]
fn resume_completes_a_partial_file() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let src_path = dir_a.path().join("src.bin");
    let dst_path = dir_b.path().join("dst.bin");
    write_file(&src_path, 1000)?;
    // destination already holds the first 400 bytes
    let full = fs::read(&src_path)?;
    fs::write(&dst_path, &full[..400])?;

    let peer_a = spawn_peer();
    let peer_b = spawn_peer();
    let mut src = EtdServer::new(peer_a.state.clone());
    let mut dst = EtdServer::new(peer_b.state.clone());

    let moved = transfer(
        &mut src,
        &mut dst,
        src_path.to_str().unwrap(),
        dst_path.to_str().unwrap(),
        OpenMode::Resume,
        Direction::Push,
    )?;
    assert_eq!(moved, 600);
    assert_eq!(fs::read(&dst_path)?, full);
    Ok(())
}

#[test]
fn skip_existing_moves_no_bytes() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let src_path = dir_a.path().join("src.bin");
    let dst_path = dir_b.path().join("dst.bin");
    write_file(&src_path, 1000)?;
    write_file(&dst_path, 4)?;
    let before = fs::read(&dst_path)?;

    let peer_a = spawn_peer();
    let peer_b = spawn_peer();
    let mut src = EtdServer::new(peer_a.state.clone());
    let mut dst = EtdServer::new(peer_b.state.clone());

    let moved = transfer(
        &mut src,
        &mut dst,
        src_path.to_str().unwrap(),
        dst_path.to_str().unwrap(),
        OpenMode::SkipExisting,
        Direction::Push,
    )?;
    assert_eq!(moved, 0);
    assert_eq!(fs::read(&dst_path)?, before);
    Ok(())
}

#[test]
fn send_file_fails_over_to_the_second_address() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let src_path = dir_a.path().join("src.bin");
    let dst_path = dir_b.path().join("dst.bin");
    write_file(&src_path, 1000)?;

    let peer_a = spawn_peer();
    let peer_b = spawn_peer();
    let mut src = EtdServer::new(peer_a.state.clone());
    let mut dst = EtdServer::new(peer_b.state.clone());

    let (src_uuid, todo) = src.request_file_read(src_path.to_str().unwrap(), 0)?;
    let (dst_uuid, _) = dst.request_file_write(dst_path.to_str().unwrap(), OpenMode::New)?;

    // the first candidate has no listener behind it
    let addrs = vec![
        DataAddress::new("tcp", "127.0.0.1", free_port()),
        peer_b.data_addr.clone(),
    ];
    assert!(src.send_file(src_uuid, dst_uuid, todo, &addrs)?);
    src.remove_uuid(src_uuid)?;
    dst.remove_uuid(dst_uuid)?;

    assert_eq!(fs::read(&src_path)?, fs::read(&dst_path)?);
    Ok(())
}

#[test]
fn all_addresses_unreachable_aborts_the_transfer() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let src_path = dir_a.path().join("src.bin");
    write_file(&src_path, 10)?;

    let peer_a = spawn_peer();
    let mut src = EtdServer::new(peer_a.state.clone());
    let (src_uuid, todo) = src.request_file_read(src_path.to_str().unwrap(), 0)?;

    let addrs = vec![
        DataAddress::new("tcp", "127.0.0.1", free_port()),
        DataAddress::new("tcp", "127.0.0.1", free_port()),
    ];
    let err = src
        .send_file(src_uuid, Uuid::new_v4(), todo, &addrs)
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("Failed to connect to any of the data servers"));
    Ok(())
}

#[test]
fn remote_push_through_proxies() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let src_path = dir_a.path().join("deep/src.bin");
    let dst_path = dir_b.path().join("deeper/dst.bin");
    write_file(&src_path, 1_100_000)?; // crosses several reads

    let peer_a = spawn_peer();
    let peer_b = spawn_peer();
    let control_a = spawn_control(&peer_a);
    let control_b = spawn_control(&peer_b);

    let mut src = EtdProxy::connect("127.0.0.1", control_a)?;
    let mut dst = EtdProxy::connect("127.0.0.1", control_b)?;

    let moved = transfer(
        &mut src,
        &mut dst,
        src_path.to_str().unwrap(),
        dst_path.to_str().unwrap(),
        OpenMode::New,
        Direction::Push,
    )?;
    assert_eq!(moved, 1_100_000);
    assert_eq!(fs::read(&src_path)?, fs::read(&dst_path)?);
    Ok(())
}

#[test]
fn download_from_remote_source() -> Result<()> {
    // remote read session over the control channel, local pull of the bytes
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let src_path = dir_a.path().join("src.bin");
    let dst_path = dir_b.path().join("dst.bin");
    write_file(&src_path, 1000)?;

    let peer_a = spawn_peer();
    let peer_b = spawn_peer();
    let control_a = spawn_control(&peer_a);

    let mut src = EtdProxy::connect("127.0.0.1", control_a)?;
    let mut dst = EtdServer::new(peer_b.state.clone());

    let moved = transfer(
        &mut src,
        &mut dst,
        src_path.to_str().unwrap(),
        dst_path.to_str().unwrap(),
        OpenMode::OverWrite,
        Direction::Pull,
    )?;
    assert_eq!(moved, 1000);
    assert_eq!(fs::read(&src_path)?, fs::read(&dst_path)?);
    Ok(())
}

#[test]
fn remote_listing_marks_directories() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_file(&dir.path().join("a.txt"), 16)?;
    fs::create_dir(dir.path().join("sub"))?;

    let peer = spawn_peer();
    let control = spawn_control(&peer);
    let mut proxy = EtdProxy::connect("127.0.0.1", control)?;

    let entries = proxy.list_path(&format!("{}/", dir.path().display()), false)?;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.ends_with("a.txt")));
    assert!(entries.iter().any(|e| e.ends_with("sub/")));

    // "list" with an empty path is not even a well-formed command; the
    // daemon drops the connection rather than replying
    let err = proxy.list_path("", false).unwrap_err().to_string();
    assert!(err.contains("Failed to read data"), "got: {}", err);
    Ok(())
}

#[test]
fn remote_data_channel_addrs_round_trip() -> Result<()> {
    let peer = spawn_peer();
    let control = spawn_control(&peer);
    let mut proxy = EtdProxy::connect("127.0.0.1", control)?;
    assert_eq!(proxy.data_channel_addr()?, vec![peer.data_addr.clone()]);
    Ok(())
}

#[test]
fn second_session_on_one_control_connection_is_refused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let src_path = dir.path().join("src.bin");
    write_file(&src_path, 10)?;

    let peer = spawn_peer();
    let control = spawn_control(&peer);
    let mut proxy = EtdProxy::connect("127.0.0.1", control)?;

    proxy.request_file_read(src_path.to_str().unwrap(), 0)?;
    let err = proxy
        .request_file_read(src_path.to_str().unwrap(), 0)
        .unwrap_err()
        .to_string();
    assert!(err.contains("already busy"), "got: {}", err);
    Ok(())
}

#[test]
fn unknown_command_closes_the_control_connection() -> Result<()> {
    let peer = spawn_peer();
    let control = spawn_control(&peer);

    let mut conn = TcpStream::connect(("127.0.0.1", control))?;
    conn.write_all(b"make-me-a-sandwich\n")?;
    // the daemon answers nothing and drops the connection
    let mut buf = [0u8; 16];
    match conn.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(_) => {} // reset is also an acceptable way to be hung up on
    }
    Ok(())
}

#[test]
fn bad_value_in_a_known_command_earns_an_err_reply() -> Result<()> {
    let peer = spawn_peer();
    let control = spawn_control(&peer);

    let mut conn = TcpStream::connect(("127.0.0.1", control))?;
    conn.write_all(b"remove-uuid not-a-uuid\n")?;
    let mut reply = Vec::new();
    let mut buf = [0u8; 256];
    while !reply.contains(&b'\n') {
        let n = conn.read(&mut buf)?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("ERR "), "got: {}", reply);
    Ok(())
}

#[test]
fn data_connection_must_open_with_a_command_block() -> Result<()> {
    let peer = spawn_peer();
    let mut conn = TcpStream::connect(("127.0.0.1", peer.data_addr.port))?;
    conn.write_all(b"GET / HTTP/1.1\r\n\r\n")?;
    let mut buf = [0u8; 16];
    match conn.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0),
        Err(_) => {}
    }
    Ok(())
}

#[test]
fn journal_records_the_session_lifecycle() -> Result<()> {
    let dir_a = tempfile::tempdir()?;
    let dir_b = tempfile::tempdir()?;
    let journal_path = dir_b.path().join("etd.jsonl");
    let src_path = dir_a.path().join("src.bin");
    let dst_path = dir_b.path().join("dst.bin");
    write_file(&src_path, 256)?;

    let peer_a = spawn_peer();
    let peer_b = spawn_peer_with_journal(Some(TransferJournal::new(&journal_path)));
    let mut src = EtdServer::new(peer_a.state.clone());
    let mut dst = EtdServer::new(peer_b.state.clone());

    transfer(
        &mut src,
        &mut dst,
        src_path.to_str().unwrap(),
        dst_path.to_str().unwrap(),
        OpenMode::New,
        Direction::Push,
    )?;

    let entries = TransferJournal::new(&journal_path).read_log()?;
    let events: Vec<&SessionEvent> = entries.iter().map(|e| &e.event).collect();
    assert!(events.contains(&&SessionEvent::Opened));
    assert!(events.contains(&&SessionEvent::Pull));
    assert!(events.contains(&&SessionEvent::Closed));
    Ok(())
}
