//! The `CommandRouter`: parses a request array into a [`Verb`] and its
//! arguments, validates arity, and dispatches to the storage/replication
//! layer. One instance lives per connection so its MULTI/EXEC queue is
//! private to that client. Cheap enough to build fresh per socket.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{Role, ServerConfig, MASTER_REPLID};
use crate::errors::CommandError;
use crate::protocol::command::{parse_request, Request, Verb};
use crate::protocol::resp::{encode, encode_array_passthrough, Resp};
use crate::replication::ReplicaRegistry;
use crate::store::stream::{parse_range_high, parse_range_low, StreamId};
use crate::store::{Block, SetOptions, Store};

/// Shared dependencies a [`CommandRouter`] dispatches against. Cheap to
/// clone (everything is an `Arc`); one is built per connection from the
/// listener's shared state.
#[derive(Clone)]
pub struct ExecutionContext {
    pub store: Arc<Store>,
    pub registry: Arc<ReplicaRegistry>,
    pub config: Arc<ServerConfig>,
}

/// What a connection should do after a dispatched request.
pub enum Outcome {
    /// Encode and write this logical value.
    Reply(Resp),
    /// Write these already-encoded bytes verbatim (EXEC's passthrough
    /// array, PSYNC's boundary-less FULLRESYNC + rdb payload).
    RawBytes(Vec<u8>),
    /// Produce no output at all (unknown verb, silent replica apply).
    NoReply,
    /// This connection just completed PSYNC: write the FULLRESYNC
    /// preamble (carried here) verbatim, then the caller should register
    /// this socket with the [`ReplicaRegistry`] and switch to the
    /// replica-link read loop (see connection.rs).
    BecameReplica(Vec<u8>),
}

/// Per-connection MULTI/EXEC buffer. Everything except MULTI/EXEC/DISCARD
/// and the replication handshake verbs is queued while `in_tx` is set.
#[derive(Default)]
struct TransactionQueue {
    in_tx: bool,
    queued: Vec<Resp>,
}

pub struct CommandRouter {
    tx: TransactionQueue,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        CommandRouter {
            tx: TransactionQueue::default(),
        }
    }

    /// Dispatches one decoded frame: validates arity, routes MULTI/EXEC/
    /// DISCARD itself, and queues or executes everything else.
    pub fn dispatch(&mut self, frame: &Resp, ctx: &ExecutionContext) -> Outcome {
        let Some(parsed) = parse_request(frame) else {
            debug!("dropping non-command frame");
            return Outcome::NoReply;
        };
        let request = match parsed {
            Ok(request) => request,
            Err(_) => {
                debug!("dropping unknown verb");
                return Outcome::NoReply;
            }
        };

        if request.args.len() + 1 < request.verb.min_arity() {
            return Outcome::Reply(Resp::error(CommandError::wrong_arity(&request.verb.to_string()).0));
        }

        if self.tx.in_tx && request.verb.is_queueable() {
            self.tx.queued.push(request.raw.clone());
            return Outcome::Reply(Resp::simple("QUEUED"));
        }

        match request.verb {
            Verb::Multi => {
                self.tx.in_tx = true;
                self.tx.queued.clear();
                Outcome::Reply(Resp::simple("OK"))
            }
            Verb::Exec => self.exec(ctx),
            Verb::Discard => {
                if !self.tx.in_tx {
                    Outcome::Reply(Resp::error("ERR DISCARD without MULTI"))
                } else {
                    self.tx.in_tx = false;
                    self.tx.queued.clear();
                    Outcome::Reply(Resp::simple("OK"))
                }
            }
            _ => execute_one(&request, ctx),
        }
    }

    fn exec(&mut self, ctx: &ExecutionContext) -> Outcome {
        if !self.tx.in_tx {
            return Outcome::Reply(Resp::error("ERR EXEC without MULTI"));
        }
        self.tx.in_tx = false;
        let queued = std::mem::take(&mut self.tx.queued);
        let mut replies = Vec::with_capacity(queued.len());
        for raw in &queued {
            // A malformed queued frame can't happen (it was validated on
            // queueing), but `parse_request` is total, so fall back to a
            // dropped-verb reply shape rather than panicking.
            let Some(Ok(request)) = parse_request(raw) else {
                replies.push(encode(&Resp::error("ERR unknown command")));
                continue;
            };
            let reply = match execute_one(&request, ctx) {
                Outcome::Reply(value) => encode(&value),
                Outcome::RawBytes(bytes) => bytes,
                Outcome::NoReply | Outcome::BecameReplica(_) => encode(&Resp::Null),
            };
            replies.push(reply);
        }
        Outcome::RawBytes(encode_array_passthrough(&replies))
    }
}

/// Executes a single (non-transaction-control) verb against the store and
/// replication state. Used both for direct dispatch and for replaying the
/// MULTI queue inside EXEC.
fn execute_one(request: &Request, ctx: &ExecutionContext) -> Outcome {
    match request.verb {
        Verb::Ping => Outcome::Reply(Resp::simple("PONG")),
        Verb::Echo => Outcome::Reply(Resp::bulk(request.args[0].clone())),
        Verb::Set => handle_set(request, ctx),
        Verb::Get => handle_get(request, ctx),
        Verb::Type => Outcome::Reply(Resp::simple(ctx.store.value_type(&request.args[0]))),
        Verb::Incr => handle_incr(request, ctx),
        Verb::Keys => {
            let keys = ctx.store.keys(&request.args[0]);
            Outcome::Reply(Resp::array_of_bulks(keys))
        }
        Verb::Config => handle_config_get(request, ctx),
        Verb::Info => Outcome::Reply(Resp::bulk(build_info(ctx))),
        Verb::Replconf => handle_replconf(request, ctx),
        Verb::Psync => handle_psync(),
        Verb::Wait => handle_wait(request, ctx),
        Verb::Xadd => handle_xadd(request, ctx),
        Verb::Xrange => handle_xrange(request, ctx),
        Verb::Xread => handle_xread(request, ctx),
        Verb::Multi | Verb::Exec | Verb::Discard => unreachable!("handled by CommandRouter::dispatch"),
    }
}

fn handle_set(request: &Request, ctx: &ExecutionContext) -> Outcome {
    let key = &request.args[0];
    let value = &request.args[1];
    let mut options = SetOptions::default();
    if let [_, _, flag, millis] = request.args.as_slice() {
        if flag.eq_ignore_ascii_case("px") {
            match millis.parse::<u64>() {
                Ok(ms) => options.px_millis = Some(ms),
                Err(_) => return Outcome::Reply(Resp::error("ERR PX value is not an integer or out of range")),
            }
        }
    }
    ctx.store.set(key, value, options);
    if ctx.config.role() == Role::Primary {
        let encoded = encode(&request.raw);
        ctx.registry.propagate(&encoded);
    }
    Outcome::Reply(Resp::simple("OK"))
}

fn handle_get(request: &Request, ctx: &ExecutionContext) -> Outcome {
    match ctx.store.get(&request.args[0]) {
        Ok(Some(value)) => Outcome::Reply(Resp::bulk(value)),
        Ok(None) => Outcome::Reply(Resp::Null),
        Err(err) => Outcome::Reply(Resp::error(CommandError::from(err).0)),
    }
}

fn handle_incr(request: &Request, ctx: &ExecutionContext) -> Outcome {
    match ctx.store.incr(&request.args[0]) {
        Ok(n) => Outcome::Reply(Resp::Integer(n)),
        Err(err) => Outcome::Reply(Resp::error(CommandError::from(err).0)),
    }
}

fn handle_config_get(request: &Request, ctx: &ExecutionContext) -> Outcome {
    let Some(key) = request.args.get(1) else {
        return Outcome::Reply(Resp::error(CommandError::wrong_arity("CONFIG").0));
    };
    let value = match key.to_ascii_lowercase().as_str() {
        "dir" => Some(ctx.config.dir.to_string_lossy().to_string()),
        "dbfilename" => Some(ctx.config.dbfilename.clone()),
        _ => None,
    };
    let value = match value {
        Some(v) => Resp::bulk(v),
        None => Resp::Null,
    };
    Outcome::Reply(Resp::Array(vec![Resp::bulk(key.clone()), value]))
}

fn build_info(ctx: &ExecutionContext) -> String {
    let role = ctx.config.role();
    [
        format!("role:{}", role.as_info_str()),
        format!("master_replid:{}", MASTER_REPLID),
        "master_repl_offset:0".to_string(),
    ]
    .join("\r\n")
}

fn handle_replconf(request: &Request, ctx: &ExecutionContext) -> Outcome {
    match request.args.first().map(|s| s.to_ascii_uppercase()) {
        Some(sub) if sub == "ACK" => {
            // Replies never get sent for ACKs; the registry ties this
            // back to a replica by connection identity at the PSYNC site
            // (see connection.rs), so here we only need to surface the
            // offset upward. Handled entirely in connection.rs, which
            // owns the replica id.
            Outcome::NoReply
        }
        _ => Outcome::Reply(Resp::simple("OK")),
    }
}

fn handle_psync() -> Outcome {
    info!("accepted PSYNC, starting full resync");
    let mut bytes = encode(&Resp::simple(format!("FULLRESYNC {} 0", MASTER_REPLID)));
    bytes.extend_from_slice(&encode(&Resp::File(crate::store::rdb::empty_payload())));
    // The FULLRESYNC preamble is written verbatim; the caller (connection.rs)
    // then registers this socket as a replica link and stops routing
    // ordinary commands to it.
    Outcome::BecameReplica(bytes)
}

fn handle_wait(request: &Request, ctx: &ExecutionContext) -> Outcome {
    let Ok(min_replicas) = request.args[0].parse::<usize>() else {
        return Outcome::Reply(Resp::error("ERR value is not an integer or out of range"));
    };
    let Ok(timeout_ms) = request.args[1].parse::<u64>() else {
        return Outcome::Reply(Resp::error("ERR value is not an integer or out of range"));
    };
    let getack = encode(&Resp::array_of_bulks(["REPLCONF", "GETACK", "*"]));
    let up = ctx
        .registry
        .wait(min_replicas, Duration::from_millis(timeout_ms), &getack);
    Outcome::Reply(Resp::Integer(up as i64))
}

fn handle_xadd(request: &Request, ctx: &ExecutionContext) -> Outcome {
    let key = &request.args[0];
    let id_spec = &request.args[1];
    let rest = &request.args[2..];
    if rest.len() % 2 != 0 {
        return Outcome::Reply(Resp::error("ERR wrong number of arguments for 'xadd' command"));
    }
    let fields: Vec<(String, String)> = rest
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    match ctx.store.xadd(key, id_spec, fields) {
        Ok(id) => Outcome::Reply(Resp::bulk(id.to_string())),
        Err(err) => Outcome::Reply(Resp::error(CommandError::from(err).0)),
    }
}

fn handle_xrange(request: &Request, ctx: &ExecutionContext) -> Outcome {
    let key = &request.args[0];
    let (low, high) = match (parse_range_low(&request.args[1]), parse_range_high(&request.args[2])) {
        (Ok(low), Ok(high)) => (low, high),
        _ => return Outcome::Reply(Resp::error("ERR Invalid stream ID specified as stream command argument")),
    };
    match ctx.store.xrange(key, low, high) {
        Ok(entries) => Outcome::Reply(Resp::Array(entries.into_iter().map(encode_stream_entry).collect())),
        Err(err) => Outcome::Reply(Resp::error(CommandError::from(err).0)),
    }
}

fn encode_stream_entry((id, fields): (StreamId, Vec<(String, String)>)) -> Resp {
    let mut flat = Vec::with_capacity(fields.len() * 2);
    for (field, value) in fields {
        flat.push(Resp::bulk(field));
        flat.push(Resp::bulk(value));
    }
    Resp::Array(vec![Resp::bulk(id.to_string()), Resp::Array(flat)])
}

fn handle_xread(request: &Request, ctx: &ExecutionContext) -> Outcome {
    let args = &request.args;
    let mut block: Option<Duration> = None;
    let mut cursor = 0;
    if args.first().is_some_and(|a| a.eq_ignore_ascii_case("block")) {
        let Some(ms) = args.get(1).and_then(|s| s.parse::<u64>().ok()) else {
            return Outcome::Reply(Resp::error("ERR timeout is not an integer or out of range"));
        };
        block = Some(Duration::from_millis(ms));
        cursor = 2;
    }
    if !args.get(cursor).is_some_and(|a| a.eq_ignore_ascii_case("streams")) {
        return Outcome::Reply(Resp::error("ERR syntax error"));
    }
    let rest = &args[cursor + 1..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Outcome::Reply(Resp::error("ERR Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified."));
    }
    let (keys, id_tokens) = rest.split_at(rest.len() / 2);
    let mut ids = Vec::with_capacity(keys.len());
    for (key, token) in keys.iter().zip(id_tokens.iter()) {
        let id = if token == "$" {
            ctx.store.latest_stream_id(key)
        } else {
            match token.parse::<StreamId>() {
                Ok(id) => id,
                Err(_) => return Outcome::Reply(Resp::error("ERR Invalid stream ID specified as stream command argument")),
            }
        };
        ids.push(id);
    }

    let block_mode = match block {
        None => Block::NoBlock,
        Some(d) if d.is_zero() => Block::Infinite,
        Some(d) => Block::Timeout(d),
    };

    match ctx.store.xread(keys, &ids, block_mode) {
        None => Outcome::Reply(Resp::Null),
        Some(per_stream) => Outcome::Reply(Resp::Array(
            per_stream
                .into_iter()
                .map(|(key, entries)| {
                    Resp::Array(vec![
                        Resp::bulk(key),
                        Resp::Array(entries.into_iter().map(encode_stream_entry).collect()),
                    ])
                })
                .collect(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::replication::ReplicaRegistry;
    use crate::store::Store;
    use std::path::PathBuf;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            store: Arc::new(Store::new()),
            registry: Arc::new(ReplicaRegistry::new()),
            config: Arc::new(ServerConfig {
                port: 6379,
                bind_host: "127.0.0.1".into(),
                dir: PathBuf::from("."),
                dbfilename: "dump.rdb".into(),
                replicaof: None,
            }),
        }
    }

    fn dispatch(router: &mut CommandRouter, ctx: &ExecutionContext, parts: &[&str]) -> Outcome {
        let frame = Resp::array_of_bulks(parts.iter().copied());
        router.dispatch(&frame, ctx)
    }

    fn reply_bytes(outcome: Outcome) -> Vec<u8> {
        match outcome {
            Outcome::Reply(value) => encode(&value),
            Outcome::RawBytes(bytes) => bytes,
            Outcome::NoReply | Outcome::BecameReplica(_) => Vec::new(),
        }
    }

    #[test]
    fn ping_replies_pong() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        let out = dispatch(&mut router, &ctx, &["PING"]);
        assert_eq!(reply_bytes(out), b"+PONG\r\n");
    }

    #[test]
    fn echo_replies_bulk() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        let out = dispatch(&mut router, &ctx, &["ECHO", "hey"]);
        assert_eq!(reply_bytes(out), b"$3\r\nhey\r\n");
    }

    #[test]
    fn set_then_get() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        assert_eq!(reply_bytes(dispatch(&mut router, &ctx, &["SET", "k", "v"])), b"+OK\r\n");
        assert_eq!(reply_bytes(dispatch(&mut router, &ctx, &["GET", "k"])), b"$1\r\nv\r\n");
    }

    #[test]
    fn transaction_queues_until_exec() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        assert_eq!(reply_bytes(dispatch(&mut router, &ctx, &["MULTI"])), b"+OK\r\n");
        assert_eq!(reply_bytes(dispatch(&mut router, &ctx, &["SET", "k", "1"])), b"+QUEUED\r\n");
        assert_eq!(reply_bytes(dispatch(&mut router, &ctx, &["INCR", "k"])), b"+QUEUED\r\n");
        assert_eq!(ctx.store.get("k").unwrap(), None, "queued SET must not have run yet");
        let out = dispatch(&mut router, &ctx, &["EXEC"]);
        assert_eq!(reply_bytes(out), b"*2\r\n+OK\r\n:2\r\n");
    }

    #[test]
    fn exec_without_multi_errors() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        let out = dispatch(&mut router, &ctx, &["EXEC"]);
        assert_eq!(reply_bytes(out), b"-ERR EXEC without MULTI\r\n");
    }

    #[test]
    fn discard_without_multi_errors() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        let out = dispatch(&mut router, &ctx, &["DISCARD"]);
        assert_eq!(reply_bytes(out), b"-ERR DISCARD without MULTI\r\n");
    }

    #[test]
    fn arity_violation_is_an_error() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        let out = dispatch(&mut router, &ctx, &["GET"]);
        assert_eq!(reply_bytes(out), b"-ERR wrong number of arguments for 'get' command\r\n");
    }

    #[test]
    fn xadd_and_xrange_round_trip() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        assert_eq!(reply_bytes(dispatch(&mut router, &ctx, &["XADD", "s", "1-1", "a", "1"])), b"$3\r\n1-1\r\n");
        let out = dispatch(&mut router, &ctx, &["XADD", "s", "1-1", "a", "2"]);
        assert_eq!(
            reply_bytes(out),
            b"-ERR The ID specified in XADD is equal or smaller than the target stream top item\r\n"
        );
        assert_eq!(
            reply_bytes(dispatch(&mut router, &ctx, &["XADD", "s", "2-*", "a", "4"])),
            b"$3\r\n2-0\r\n"
        );
    }

    #[test]
    fn unknown_verb_produces_no_reply() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        let out = dispatch(&mut router, &ctx, &["NOPE"]);
        assert!(matches!(out, Outcome::NoReply));
    }

    #[test]
    fn info_reports_role_and_fixed_replid() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        let out = dispatch(&mut router, &ctx, &["INFO"]);
        let bytes = reply_bytes(out);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("role:master"));
        assert!(text.contains(MASTER_REPLID));
    }

    #[test]
    fn config_get_reports_null_for_an_unknown_key() {
        let ctx = ctx();
        let mut router = CommandRouter::new();
        let out = dispatch(&mut router, &ctx, &["CONFIG", "GET", "maxmemory"]);
        assert_eq!(reply_bytes(out), b"*2\r\n$9\r\nmaxmemory\r\n$-1\r\n");
    }
}
