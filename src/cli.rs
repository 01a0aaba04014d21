//! Process argv, parsed with `clap` into a typed [`Cli`] and folded into a
//! [`ServerConfig`]. The CLI surface is an external collaborator. It owns
//! no behavior beyond turning flags into config.

use std::path::PathBuf;

use clap::Parser;

use crate::net::{Binding, DEFAULT_PORT};

#[derive(Debug, Parser)]
#[command(name = "respd", about = "An in-memory RESP key/value server")]
pub struct Cli {
    /// Directory holding the persistence snapshot.
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Snapshot file name within `--dir`.
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,

    /// Listen port.
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Host to bind the listener on.
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// `"<host> <port>"` of the primary to replicate from. Presence alone
    /// makes this process start in the replica role.
    #[arg(long)]
    pub replicaof: Option<Binding>,
}
