//! Replica-side: the four-step handshake with a primary, followed by the
//! loop that applies whatever the primary then streams at us.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::net::Binding;
use crate::protocol::command::{parse_request, Verb};
use crate::protocol::resp::{encode, Decoder, Resp};
use crate::store::{SetOptions, Store};

/// Reads RESP frames off a stream through a [`Decoder`], handling
/// pipelined replies one at a time.
struct FrameReader {
    stream: TcpStream,
    decoder: Decoder,
    pending: std::collections::VecDeque<Resp>,
}

impl FrameReader {
    fn new(stream: TcpStream) -> Self {
        FrameReader {
            stream,
            decoder: Decoder::new(),
            pending: std::collections::VecDeque::new(),
        }
    }

    fn next_frame(&mut self) -> Result<Resp> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            let mut buf = [0u8; 8192];
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                bail!("master closed the replication connection");
            }
            for frame in self.decoder.feed(&buf[..n])? {
                self.pending.push_back(frame);
            }
        }
    }

    fn send(&mut self, req: &Resp) -> Result<()> {
        self.stream.write_all(&encode(req))?;
        Ok(())
    }
}

fn expect_simple(frame: Resp) -> Result<String> {
    match frame {
        Resp::Simple(s) => Ok(s),
        other => bail!("expected a simple-string reply, got {:?}", other),
    }
}

/// Connects to `master`, performs the PING / REPLCONF / REPLCONF / PSYNC
/// handshake, then loops forever applying whatever the master streams.
/// `offset` is updated as bytes are applied so `REPLCONF ACK` can be
/// answered truthfully.
pub fn run(store: Arc<Store>, master: Binding, my_port: u16, offset: Arc<AtomicU64>) {
    loop {
        match connect_and_replicate(&store, &master, my_port, &offset) {
            Ok(()) => unreachable!("replication loop only returns on error"),
            Err(err) => {
                warn!(error = %err, %master, "replication link failed, retrying");
                offset.store(0, Ordering::SeqCst);
                thread::sleep(Duration::from_secs(2));
            }
        }
    }
}

fn connect_and_replicate(
    store: &Arc<Store>,
    master: &Binding,
    my_port: u16,
    offset: &Arc<AtomicU64>,
) -> Result<()> {
    let stream = TcpStream::connect((master.host.as_str(), master.port))
        .with_context(|| format!("connecting to master at {}", master))?;
    let mut reader = FrameReader::new(stream);

    reader.send(&Resp::array_of_bulks(["PING"]))?;
    expect_simple(reader.next_frame()?)?;

    reader.send(&Resp::array_of_bulks(["REPLCONF", "listening-port", &my_port.to_string()]))?;
    expect_simple(reader.next_frame()?)?;

    reader.send(&Resp::array_of_bulks(["REPLCONF", "capa", "psync2"]))?;
    expect_simple(reader.next_frame()?)?;

    reader.send(&Resp::array_of_bulks(["PSYNC", "?", "-1"]))?;
    let fullresync = expect_simple(reader.next_frame()?)?;
    if !fullresync.starts_with("FULLRESYNC") {
        bail!("expected FULLRESYNC, got {:?}", fullresync);
    }
    match reader.next_frame()? {
        Resp::File(_) => {}
        other => bail!("expected raw rdb payload after FULLRESYNC, got {:?}", other),
    }

    offset.store(0, Ordering::SeqCst);
    info!(%master, "replication handshake complete");

    loop {
        let frame = reader.next_frame()?;
        let frame_len = encode(&frame).len() as u64;

        if let Some(Ok(request)) = parse_request(&frame) {
            match request.verb {
                Verb::Set => {
                    if let [key, value] = request.args.as_slice() {
                        store.set(key, value, SetOptions::default());
                    } else if let [key, value, px_flag, px_millis] = request.args.as_slice() {
                        if px_flag.eq_ignore_ascii_case("px") {
                            let px = px_millis.parse::<u64>().ok();
                            store.set(key, value, SetOptions { px_millis: px });
                        }
                    }
                }
                Verb::Replconf => {
                    if request
                        .args
                        .first()
                        .is_some_and(|a| a.eq_ignore_ascii_case("getack"))
                    {
                        // Reply with the offset as it stood *before* this
                        // GETACK frame; the frame's own length is folded
                        // into the counter only after the reply is sent.
                        let pre_command = offset.load(Ordering::SeqCst);
                        let ack = Resp::array_of_bulks(["REPLCONF", "ACK", &pre_command.to_string()]);
                        reader.send(&ack)?;
                    }
                }
                Verb::Ping => {}
                _ => {}
            }
        }

        offset.fetch_add(frame_len, Ordering::SeqCst);
    }
}
