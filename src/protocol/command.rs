use std::fmt::Display;
use std::str::FromStr;

use crate::errors::CommandError;
use crate::protocol::resp::Resp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Ping,
    Echo,
    Set,
    Get,
    Type,
    Incr,
    Keys,
    Config,
    Info,
    Replconf,
    Psync,
    Wait,
    Xadd,
    Xrange,
    Xread,
    Multi,
    Exec,
    Discard,
}

impl Verb {
    /// Minimum arity including the verb token itself.
    pub fn min_arity(self) -> usize {
        match self {
            Verb::Ping => 1,
            Verb::Echo => 2,
            Verb::Set => 3,
            Verb::Get => 2,
            Verb::Type => 2,
            Verb::Incr => 2,
            Verb::Keys => 2,
            Verb::Config => 3,
            Verb::Info => 1,
            Verb::Replconf => 2,
            Verb::Psync => 2,
            Verb::Wait => 3,
            Verb::Xadd => 5,
            Verb::Xrange => 4,
            Verb::Xread => 4,
            Verb::Multi => 1,
            Verb::Exec => 1,
            Verb::Discard => 1,
        }
    }

    /// Verbs that bypass the MULTI queue even while a transaction is open:
    /// MULTI/EXEC/DISCARD themselves plus the replication handshake verbs,
    /// which must run immediately regardless of transaction state.
    pub fn is_queueable(self) -> bool {
        !matches!(
            self,
            Verb::Multi | Verb::Exec | Verb::Discard | Verb::Replconf | Verb::Psync
        )
    }
}

impl FromStr for Verb {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_uppercase().as_str() {
            "PING" => Ok(Verb::Ping),
            "ECHO" => Ok(Verb::Echo),
            "SET" => Ok(Verb::Set),
            "GET" => Ok(Verb::Get),
            "TYPE" => Ok(Verb::Type),
            "INCR" => Ok(Verb::Incr),
            "KEYS" => Ok(Verb::Keys),
            "CONFIG" => Ok(Verb::Config),
            "INFO" => Ok(Verb::Info),
            "REPLCONF" => Ok(Verb::Replconf),
            "PSYNC" => Ok(Verb::Psync),
            "WAIT" => Ok(Verb::Wait),
            "XADD" => Ok(Verb::Xadd),
            "XRANGE" => Ok(Verb::Xrange),
            "XREAD" => Ok(Verb::Xread),
            "MULTI" => Ok(Verb::Multi),
            "EXEC" => Ok(Verb::Exec),
            "DISCARD" => Ok(Verb::Discard),
            other => Err(CommandError::new(format!("ERR unknown command '{}'", other))),
        }
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verb::Ping => "PING",
            Verb::Echo => "ECHO",
            Verb::Set => "SET",
            Verb::Get => "GET",
            Verb::Type => "TYPE",
            Verb::Incr => "INCR",
            Verb::Keys => "KEYS",
            Verb::Config => "CONFIG",
            Verb::Info => "INFO",
            Verb::Replconf => "REPLCONF",
            Verb::Psync => "PSYNC",
            Verb::Wait => "WAIT",
            Verb::Xadd => "XADD",
            Verb::Xrange => "XRANGE",
            Verb::Xread => "XREAD",
            Verb::Multi => "MULTI",
            Verb::Exec => "EXEC",
            Verb::Discard => "DISCARD",
        };
        write!(f, "{}", s)
    }
}

/// A parsed request: the verb plus the bulk arguments that followed it
/// (as plain strings, since this server only deals in text-safe bulks) and
/// the original frame, retained for replication fan-out and transaction replay.
pub struct Request {
    pub verb: Verb,
    pub args: Vec<String>,
    pub raw: Resp,
}

/// Returns `None` for anything that is not a well-formed command array
/// (empty array, non-array frame, or an array containing a non-bulk
/// element). Such a frame is simply not a command and the caller should
/// treat it as "unknown verb, drop silently", UNLESS the verb itself fails
/// to parse, in which case `Some(Err(..))` flags an explicit unknown-verb
/// condition the caller may choose to ignore too.
pub fn parse_request(message: &Resp) -> Option<Result<Request, CommandError>> {
    let Resp::Array(items) = message else {
        return None;
    };
    let (head, rest) = items.split_first()?;
    let verb_text = head.as_str()?;
    let mut args = Vec::with_capacity(rest.len());
    for item in rest {
        args.push(item.as_str()?.to_string());
    }
    Some(verb_text.parse::<Verb>().map(|verb| Request {
        verb,
        args,
        raw: message.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_verb_case_insensitively() {
        let msg = Resp::Array(vec![Resp::bulk("set"), Resp::bulk("k"), Resp::bulk("v")]);
        let req = parse_request(&msg).unwrap().unwrap();
        assert_eq!(req.verb, Verb::Set);
        assert_eq!(req.args, vec!["k".to_string(), "v".to_string()]);
    }

    #[test]
    fn unknown_verb_is_an_explicit_error() {
        let msg = Resp::Array(vec![Resp::bulk("NOPE")]);
        assert!(parse_request(&msg).unwrap().is_err());
    }

    #[test]
    fn non_array_frame_is_not_a_command() {
        assert!(parse_request(&Resp::Simple("PONG".into())).is_none());
    }

    #[test]
    fn empty_array_is_not_a_command() {
        assert!(parse_request(&Resp::Array(vec![])).is_none());
    }

    #[test]
    fn min_arity_rejects_too_few_args() {
        assert_eq!(Verb::Set.min_arity(), 3);
        assert_eq!(Verb::Ping.min_arity(), 1);
    }
}
