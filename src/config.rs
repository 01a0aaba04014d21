use std::path::PathBuf;

use crate::cli::Cli;
use crate::net::Binding;

/// Fixed replication id this server always advertises. Real Redis derives
/// this per-process, but a single constant is all a subset server needs.
pub const MASTER_REPLID: &str = "8371b4fb1155b71f4a04d3e1bc3e18c4a990aeeb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

impl Role {
    pub fn as_info_str(self) -> &'static str {
        match self {
            Role::Primary => "master",
            Role::Replica => "slave",
        }
    }
}

/// Server-wide configuration, built once at startup from CLI flags and
/// shared read-only (wrapped in an `Arc`) across every connection thread.
/// Never a global/static, so a future multi-instance test harness can spin
/// up more than one `ServerConfig` in the same process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_host: String,
    pub dir: PathBuf,
    pub dbfilename: String,
    pub replicaof: Option<Binding>,
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        ServerConfig {
            port: cli.port,
            bind_host: cli.bind.clone(),
            dir: cli.dir.clone(),
            dbfilename: cli.dbfilename.clone(),
            replicaof: cli.replicaof.clone(),
        }
    }

    pub fn role(&self) -> Role {
        match self.replicaof {
            Some(_) => Role::Replica,
            None => Role::Primary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(replicaof: Option<Binding>) -> ServerConfig {
        ServerConfig {
            port: 6379,
            bind_host: "127.0.0.1".to_string(),
            dir: PathBuf::from("."),
            dbfilename: "dump.rdb".to_string(),
            replicaof,
        }
    }

    #[test]
    fn role_follows_replicaof_presence() {
        assert_eq!(config(None).role(), Role::Primary);
        assert_eq!(
            config(Some(Binding::new("localhost", 6380))).role(),
            Role::Replica
        );
    }
}
