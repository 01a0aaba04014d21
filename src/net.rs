use std::fmt::Display;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 6379;

/// A host/port pair, e.g. the value of `--replicaof` or the address a
/// REPLCONF listening-port announces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub host: String,
    pub port: u16,
}

impl Binding {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Binding { host: host.into(), port }
    }
}

impl Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses the `"<host> <port>"` form used by `--replicaof`.
impl FromStr for Binding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let host = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("invalid binding: {}", s))?;
        let port = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("invalid binding: {}", s))?
            .parse::<u16>()?;
        Ok(Binding::new(host, port))
    }
}
