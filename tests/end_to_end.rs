//! Black-box end-to-end tests: bind a real `Server` on an ephemeral port and
//! drive it over `std::net::TcpStream`, exactly as a real RESP client would.
//! Covers scenarios S1-S6 from the wire-protocol spec this server implements.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use clap::Parser;
use respd::cli::Cli;
use respd::Server;

/// Starts a server backed by a fresh temp directory and returns its bound
/// address. The accept loop runs on a detached thread for the test's
/// lifetime; the process exiting is what reclaims it.
fn start_server(extra_args: &[&str]) -> SocketAddr {
    let dir = tempfile::tempdir().unwrap();
    let dir = dir.into_path();
    let mut args = vec![
        "respd",
        "--dir",
        dir.to_str().unwrap(),
        "--port",
        "0",
        "--bind",
        "127.0.0.1",
    ];
    args.extend_from_slice(extra_args);
    let cli = Cli::parse_from(args);
    let server = Server::bind(&cli).expect("server should bind");
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.serve());
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// Sends `req` and reads exactly `want.len()` bytes back, asserting equality.
/// RESP frames are self-delimiting so reading the expected byte count is
/// enough to isolate one reply even when the socket buffers more later.
fn roundtrip(stream: &mut TcpStream, req: &[u8], want: &[u8]) {
    stream.write_all(req).unwrap();
    let mut buf = vec![0u8; want.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, want, "request {:?}", String::from_utf8_lossy(req));
}

#[test]
fn s1_ping_and_echo() {
    let addr = start_server(&[]);
    let mut client = connect(addr);
    roundtrip(&mut client, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n");
    roundtrip(
        &mut client,
        b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n",
        b"$3\r\nhey\r\n",
    );
}

#[test]
fn s2_set_with_expiry() {
    let addr = start_server(&[]);
    let mut client = connect(addr);
    roundtrip(
        &mut client,
        b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\npx\r\n$3\r\n100\r\n",
        b"+OK\r\n",
    );
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$1\r\nv\r\n");
    thread::sleep(Duration::from_millis(200));
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$-1\r\n");
}

#[test]
fn s3_xadd_and_xrange() {
    let addr = start_server(&[]);
    let mut client = connect(addr);
    roundtrip(
        &mut client,
        b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n1-1\r\n$1\r\na\r\n$1\r\n1\r\n",
        b"$3\r\n1-1\r\n",
    );
    roundtrip(
        &mut client,
        b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n1-1\r\n$1\r\na\r\n$1\r\n2\r\n",
        b"-ERR The ID specified in XADD is equal or smaller than the target stream top item\r\n",
    );
    roundtrip(
        &mut client,
        b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n0-0\r\n$1\r\na\r\n$1\r\n3\r\n",
        b"-ERR The ID specified in XADD must be greater than 0-0\r\n",
    );
    roundtrip(
        &mut client,
        b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n2-*\r\n$1\r\na\r\n$1\r\n4\r\n",
        b"$3\r\n2-0\r\n",
    );
    roundtrip(
        &mut client,
        b"*4\r\n$6\r\nXRANGE\r\n$1\r\ns\r\n$1\r\n-\r\n$1\r\n+\r\n",
        b"*2\r\n\
          *2\r\n$3\r\n1-1\r\n*2\r\n$1\r\na\r\n$1\r\n1\r\n\
          *2\r\n$3\r\n2-0\r\n*2\r\n$1\r\na\r\n$1\r\n4\r\n",
    );
}

#[test]
fn s4_incr() {
    let addr = start_server(&[]);
    let mut client = connect(addr);
    roundtrip(&mut client, b"*2\r\n$4\r\nINCR\r\n$1\r\nk\r\n", b":1\r\n");
    roundtrip(&mut client, b"*2\r\n$4\r\nINCR\r\n$1\r\nk\r\n", b":2\r\n");
    roundtrip(
        &mut client,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$3\r\nabc\r\n",
        b"+OK\r\n",
    );
    roundtrip(
        &mut client,
        b"*2\r\n$4\r\nINCR\r\n$1\r\nk\r\n",
        b"-ERR value is not an integer or out of range\r\n",
    );
}

#[test]
fn s5_transaction() {
    let addr = start_server(&[]);
    let mut client = connect(addr);
    roundtrip(&mut client, b"*1\r\n$5\r\nMULTI\r\n", b"+OK\r\n");
    roundtrip(
        &mut client,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\n1\r\n",
        b"+QUEUED\r\n",
    );
    roundtrip(&mut client, b"*2\r\n$4\r\nINCR\r\n$1\r\nk\r\n", b"+QUEUED\r\n");
    roundtrip(
        &mut client,
        b"*1\r\n$4\r\nEXEC\r\n",
        b"*2\r\n+OK\r\n:2\r\n",
    );
}

#[test]
fn discard_clears_the_queue_without_running_it() {
    let addr = start_server(&[]);
    let mut client = connect(addr);
    roundtrip(&mut client, b"*1\r\n$5\r\nMULTI\r\n", b"+OK\r\n");
    roundtrip(
        &mut client,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\n1\r\n",
        b"+QUEUED\r\n",
    );
    roundtrip(&mut client, b"*1\r\n$7\r\nDISCARD\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$-1\r\n");
}

/// S6: a replica attaches to a primary, observes the handshake, then a SET
/// issued on the primary propagates and the replica answers a subsequent
/// GETACK with the byte length of that SET alone.
#[test]
fn s6_replication_handshake_and_fanout() {
    let primary_addr = start_server(&[]);
    let replicaof = format!("{} {}", primary_addr.ip(), primary_addr.port());
    let _replica_addr = start_server(&["--replicaof", replicaof.as_str()]);

    // Give the replica's handshake thread time to complete PSYNC.
    thread::sleep(Duration::from_millis(300));

    let mut primary_client = connect(primary_addr);
    roundtrip(
        &mut primary_client,
        b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n",
        b"+OK\r\n",
    );

    // Give the replica a moment to apply the fanned-out SET, then ask it to
    // WAIT for acknowledgement. This exercises the GETACK broadcast path.
    thread::sleep(Duration::from_millis(200));
    roundtrip(
        &mut primary_client,
        b"*3\r\n$4\r\nWAIT\r\n$1\r\n1\r\n$3\r\n500\r\n",
        b":1\r\n",
    );
}

#[test]
fn xread_block_wakes_on_new_entry_over_a_real_socket() {
    let addr = start_server(&[]);
    let mut writer = connect(addr);
    roundtrip(
        &mut writer,
        b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n1-1\r\n$1\r\na\r\n$1\r\n1\r\n",
        b"$3\r\n1-1\r\n",
    );

    let mut reader = connect(addr);
    let req = b"*6\r\n$5\r\nXREAD\r\n$5\r\nBLOCK\r\n$4\r\n2000\r\n$7\r\nstreams\r\n$1\r\ns\r\n$3\r\n1-1\r\n".to_vec();
    let read_thread = thread::spawn(move || {
        reader.write_all(&req).unwrap();
        let mut buf = vec![0u8; 256];
        let n = reader.read(&mut buf).unwrap();
        buf.truncate(n);
        buf
    });

    thread::sleep(Duration::from_millis(100));
    let mut appender = connect(addr);
    roundtrip(
        &mut appender,
        b"*5\r\n$4\r\nXADD\r\n$1\r\ns\r\n$3\r\n2-0\r\n$1\r\na\r\n$1\r\n2\r\n",
        b"$3\r\n2-0\r\n",
    );

    let reply = read_thread.join().unwrap();
    let text = String::from_utf8(reply).unwrap();
    assert!(text.contains("2-0"), "expected the blocked XREAD to surface the new entry, got {text:?}");
}
