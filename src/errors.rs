use thiserror::Error;

/// A malformed frame on the wire. The connection that produced it is closed
/// silently. This error never reaches a client as a reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame type byte: {0:#x}")]
    UnknownType(u8),
    #[error("invalid integer in frame: {0}")]
    InvalidInteger(String),
    #[error("invalid utf-8 bulk body")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("malformed bulk boundary")]
    MalformedBoundary,
}

/// A known verb with invalid arity or semantics. Rendered as `-ERR ...`.
/// Carries its own message verbatim so callers can produce bit-exact
/// literals for XADD and transaction errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    pub fn new(msg: impl Into<String>) -> Self {
        CommandError(msg.into())
    }

    pub fn wrong_arity(verb: &str) -> Self {
        CommandError(format!("ERR wrong number of arguments for '{}' command", verb.to_lowercase()))
    }
}

/// Storage-layer invariant violations. These always surface to the client
/// as a [`CommandError`]. The two are kept distinct so `Store` stays free
/// of any notion of "wire reply" and knows nothing about the command layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    XaddIdTooSmall,
    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    XaddIdNotMonotonic,
    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR invalid stream ID: {0}")]
    InvalidId(String),
}

impl From<StoreError> for CommandError {
    fn from(e: StoreError) -> Self {
        CommandError(e.to_string())
    }
}
