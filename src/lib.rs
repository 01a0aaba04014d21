//! Library surface shared by the `respd` binary and its integration tests.
//! `main.rs` is a thin wrapper around [`Server::bind`]/[`Server::serve`];
//! tests bind an ephemeral port directly and drive it over real sockets
//! without going through a subprocess.

pub mod cli;
pub mod config;
pub mod connection;
pub mod errors;
pub mod net;
pub mod protocol;
pub mod replication;
pub mod router;
pub mod store;

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::ServerConfig;
use crate::replication::ReplicaRegistry;
use crate::router::ExecutionContext;
use crate::store::Store;

/// Process-wide shared state plus a bound (but not yet accepting) listener.
/// Split from the accept loop so a caller can read back the bound ephemeral
/// port before traffic starts flowing.
pub struct Server {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    store: Arc<Store>,
    registry: Arc<ReplicaRegistry>,
}

impl Server {
    /// Loads the snapshot, starts the replication handshake thread if this
    /// process is a replica, and binds the listener. Does not accept yet.
    pub fn bind(cli: &Cli) -> Result<Self> {
        let config = Arc::new(ServerConfig::from_cli(cli));
        let initial = store::rdb::load_or_create(&config.dir, &config.dbfilename)
            .context("loading initial snapshot")?;
        let store = Arc::new(Store::from_initial(initial));
        let registry = Arc::new(ReplicaRegistry::new());
        let listener = bind_listener(&config)?;

        if let Some(master) = config.replicaof.clone() {
            let store = store.clone();
            // Announce the port we actually bound, not `config.port` as
            // configured. The two differ whenever the process is started
            // with `--port 0` and the OS assigns an ephemeral one.
            let port = listener.local_addr()?.port();
            thread::spawn(move || {
                replication::handshake::run(store, master, port, Arc::new(AtomicU64::new(0)));
            });
        }

        Ok(Server { listener, config, store, registry })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop, spawning one thread per connection. Returns
    /// only if accepting the listener itself fails outright.
    pub fn serve(self) -> Result<()> {
        let Server { listener, config, store, registry } = self;
        info!(addr = %listener.local_addr()?, "listening");
        for incoming in listener.incoming() {
            let stream = match incoming {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    continue;
                }
            };
            let ctx = ExecutionContext {
                store: store.clone(),
                registry: registry.clone(),
                config: config.clone(),
            };
            thread::spawn(move || connection::handle_client(stream, ctx));
        }
        Ok(())
    }
}

/// Binds the listener with `SO_REUSEPORT` set, the way a production
/// multi-process Redis-alike would want it, even though this server only
/// ever runs one listener per process.
fn bind_listener(config: &ServerConfig) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", config.bind_host, config.port)
        .parse()
        .context("invalid bind address")?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    let listener: TcpListener = socket.into();
    Ok(listener)
}
