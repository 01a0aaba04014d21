//! `ConnectionLoop`: the per-connection read/dispatch/write cycle. Each
//! accepted socket gets its own thread, its own [`Decoder`], and its own
//! [`CommandRouter`] (so its MULTI/EXEC queue is private), sharing the
//! process-wide [`Store`] and [`ReplicaRegistry`] through [`ExecutionContext`].

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;

use tracing::{debug, info, warn};

use crate::protocol::command::{parse_request, Verb};
use crate::protocol::resp::Decoder;
use crate::router::{CommandRouter, ExecutionContext, Outcome};

const READ_BUF_SIZE: usize = 8192;

/// Drives one client connection until the peer disconnects or a protocol
/// error occurs. If the connection PSYNCs, control passes to
/// [`run_replica_link`] for the remainder of its life.
pub fn handle_client(mut stream: TcpStream, ctx: ExecutionContext) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let mut decoder = Decoder::new();
    let mut router = CommandRouter::new();
    let mut buf = [0u8; READ_BUF_SIZE];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                debug!(%peer, "connection closed by peer");
                return;
            }
            Ok(n) => n,
            Err(err) => {
                warn!(%peer, error = %err, "read error, closing connection");
                return;
            }
        };

        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(%peer, error = %err, "malformed frame, closing connection silently");
                return;
            }
        };

        for frame in frames {
            match router.dispatch(&frame, &ctx) {
                Outcome::Reply(value) => {
                    if write_all(&mut stream, &crate::protocol::resp::encode(&value)).is_err() {
                        return;
                    }
                }
                Outcome::RawBytes(bytes) => {
                    if write_all(&mut stream, &bytes).is_err() {
                        return;
                    }
                }
                Outcome::NoReply => {}
                Outcome::BecameReplica(preamble) => {
                    if write_all(&mut stream, &preamble).is_err() {
                        return;
                    }
                    return run_replica_link(stream, ctx, peer);
                }
            }
        }
    }
}

fn write_all(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(bytes)?;
    stream.flush()
}

/// Once a connection has PSYNC'd, it stops being an ordinary command
/// socket: a writer thread drains the [`ReplicaRegistry`]'s fan-out
/// channel onto a cloned write half, while this thread keeps reading the
/// same socket for `REPLCONF ACK` replies and feeds them back into the
/// registry's ack tracking.
fn run_replica_link(stream: TcpStream, ctx: ExecutionContext, peer: String) {
    let write_half = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!(%peer, error = %err, "could not clone replica socket for fan-out writer");
            return;
        }
    };
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let replica_id = ctx.registry.register(tx);
    info!(%peer, replica_id, "replica attached after full resync");

    let writer_peer = peer.clone();
    std::thread::spawn(move || {
        let mut write_half = write_half;
        while let Ok(bytes) = rx.recv() {
            if write_all(&mut write_half, &bytes).is_err() {
                debug!(peer = %writer_peer, "replica fan-out write failed, dropping link");
                break;
            }
        }
    });

    let mut stream = stream;
    let mut decoder = Decoder::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(_) => break,
        };
        for frame in frames {
            let Some(Ok(request)) = parse_request(&frame) else {
                continue;
            };
            if request.verb == Verb::Replconf
                && request.args.first().is_some_and(|a| a.eq_ignore_ascii_case("ack"))
            {
                if let Some(offset) = request.args.get(1).and_then(|s| s.parse::<u64>().ok()) {
                    ctx.registry.update_ack(replica_id, offset);
                }
            }
        }
    }

    ctx.registry.remove(replica_id);
    info!(%peer, replica_id, "replica link closed");
}
