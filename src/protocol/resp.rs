//! RESP wire framing: a single resumable [`Decoder`] and a symmetric
//! `encode` function, sharing the [`Resp`] value representation.

use bytes::{Buf, BytesMut};

use crate::errors::ProtocolError;

/// The magic bytes at the start of a persistence snapshot. A bulk body
/// immediately followed by these (instead of `\r\n`) is a raw file
/// transfer with no trailing boundary. See [`Decoder`].
pub const FILE_MAGIC: &[u8; 5] = b"REDIS";

#[derive(Debug, Clone, PartialEq)]
pub enum Resp {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(String),
    Null,
    Array(Vec<Resp>),
    /// A raw byte payload carried by a bulk frame that had no trailing
    /// `\r\n`. Used for RDB snapshot transfer during a full resync.
    File(Vec<u8>),
}

impl Resp {
    pub fn simple(s: impl Into<String>) -> Resp {
        Resp::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Resp {
        Resp::Error(s.into())
    }

    pub fn bulk(s: impl Into<String>) -> Resp {
        Resp::Bulk(s.into())
    }

    pub fn array_of_bulks<I, S>(items: I) -> Resp
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Resp::Array(items.into_iter().map(Resp::bulk).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Resp::Bulk(s) | Resp::Simple(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Resp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resp::Simple(s) => write!(f, "+{}", s),
            Resp::Error(s) => write!(f, "-{}", s),
            Resp::Integer(n) => write!(f, ":{}", n),
            Resp::Bulk(s) => write!(f, "${}:{}", s.len(), s),
            Resp::Null => write!(f, "$-1"),
            Resp::Array(items) => {
                write!(f, "*{}[", items.len())?;
                for item in items {
                    write!(f, "{} ", item)?;
                }
                write!(f, "]")
            }
            Resp::File(bytes) => write!(f, "<file:{} bytes>", bytes.len()),
        }
    }
}

/// Encodes a logical value into its complete wire frame.
pub fn encode(value: &Resp) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Resp, out: &mut Vec<u8>) {
    match value {
        Resp::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Resp::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Resp::Integer(n) => {
            out.push(b':');
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Resp::Bulk(s) => {
            out.push(b'$');
            out.extend_from_slice(s.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Resp::Null => {
            out.extend_from_slice(b"$-1\r\n");
        }
        Resp::Array(items) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                encode_into(item, out);
            }
        }
        Resp::File(bytes) => {
            out.push(b'$');
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(bytes);
            // deliberately no trailing \r\n. See FILE_MAGIC edge case.
        }
    }
}

/// Builds an array frame whose elements are already-encoded byte buffers,
/// written back to back without re-encoding them. Used by MULTI/EXEC to
/// reply with the captured encoded replies of the queued commands.
pub fn encode_array_passthrough(parts: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'*');
    out.extend_from_slice(parts.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

#[derive(Debug, Clone)]
enum LineKind {
    Simple,
    Error,
    Integer,
    BulkLen,
    ArrayLen,
}

#[derive(Debug, Clone)]
enum State {
    /// Waiting for the one-byte frame type marker.
    ReadType,
    /// Reading a `\r\n`-terminated line whose meaning depends on `LineKind`.
    /// `scanned` remembers how much of the buffer has already been searched
    /// for the terminator so a line spanning many `feed` calls is not
    /// rescanned from the start each time.
    ReadLine { kind: LineKind, scanned: usize },
    /// Reading the `len` raw bytes of a bulk's body.
    ReadBulkBody { len: usize },
    /// Body fully read; deciding whether it's followed by `\r\n` (ordinary
    /// bulk) or not (file transfer, see FILE_MAGIC).
    ReadBulkBoundary { body: Vec<u8> },
}

struct ArrayFrame {
    remaining: usize,
    items: Vec<Resp>,
}

/// Incremental, resumable RESP decoder. Feed it bytes as they arrive off
/// the socket; it returns however many complete top-level frames those
/// bytes completed (zero, one, or many for a pipelined batch).
pub struct Decoder {
    buf: BytesMut,
    state: State,
    stack: Vec<ArrayFrame>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            buf: BytesMut::with_capacity(4096),
            state: State::ReadType,
            stack: Vec::new(),
        }
    }

    /// Appends `bytes` to the internal buffer and decodes as many complete
    /// top-level frames as possible. Partial frames are retained across
    /// calls; this never re-reads bytes that have already been consumed
    /// into a completed value.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Resp>, ProtocolError> {
        self.buf.extend_from_slice(bytes);
        let mut completed = Vec::new();
        loop {
            match self.step()? {
                Step::NeedMore => break,
                Step::Continue => continue,
                Step::Value(value) => {
                    if let Some(top) = self.resolve(value) {
                        completed.push(top);
                    }
                    self.state = State::ReadType;
                }
            }
        }
        Ok(completed)
    }

    /// Pushes a completed value into the enclosing array on the stack,
    /// repeatedly popping finished arrays. Returns `Some(value)` once a
    /// value with no enclosing array (a top-level frame) is produced.
    fn resolve(&mut self, mut value: Resp) -> Option<Resp> {
        loop {
            match self.stack.last_mut() {
                None => return Some(value),
                Some(frame) => {
                    frame.items.push(value);
                    if frame.items.len() == frame.remaining {
                        let frame = self.stack.pop().unwrap();
                        value = Resp::Array(frame.items);
                        continue;
                    }
                    return None;
                }
            }
        }
    }

    fn step(&mut self) -> Result<Step, ProtocolError> {
        match &self.state {
            State::ReadType => {
                if self.buf.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let type_byte = self.buf[0];
                self.buf.advance(1);
                let kind = match type_byte {
                    b'+' => LineKind::Simple,
                    b'-' => LineKind::Error,
                    b':' => LineKind::Integer,
                    b'$' => LineKind::BulkLen,
                    b'*' => LineKind::ArrayLen,
                    other => return Err(ProtocolError::UnknownType(other)),
                };
                self.state = State::ReadLine { kind, scanned: 0 };
                Ok(Step::Continue)
            }
            State::ReadLine { kind, scanned } => {
                let kind = kind.clone();
                let scanned = *scanned;
                let search_from = scanned.min(self.buf.len());
                match find_crlf(&self.buf[search_from..]) {
                    None => {
                        self.state = State::ReadLine {
                            kind,
                            scanned: self.buf.len().saturating_sub(1).max(search_from),
                        };
                        Ok(Step::NeedMore)
                    }
                    Some(rel_pos) => {
                        let pos = search_from + rel_pos;
                        let line = std::str::from_utf8(&self.buf[..pos])
                            .map_err(|_| ProtocolError::InvalidInteger("non-utf8 line".into()))?
                            .to_string();
                        self.buf.advance(pos + 2);
                        self.finish_line(kind, line)
                    }
                }
            }
            State::ReadBulkBody { len } => {
                let len = *len;
                if self.buf.len() < len {
                    return Ok(Step::NeedMore);
                }
                let body = self.buf[..len].to_vec();
                self.buf.advance(len);
                self.state = State::ReadBulkBoundary { body };
                Ok(Step::Continue)
            }
            State::ReadBulkBoundary { body } => {
                if self.buf.is_empty() {
                    return Ok(Step::NeedMore);
                }
                if self.buf[0] == b'\r' {
                    if self.buf.len() < 2 {
                        return Ok(Step::NeedMore);
                    }
                    if self.buf[1] != b'\n' {
                        return Err(ProtocolError::MalformedBoundary);
                    }
                    let body = body.clone();
                    self.buf.advance(2);
                    let text = String::from_utf8(body)?;
                    Ok(Step::Value(Resp::Bulk(text)))
                } else {
                    // No CRLF boundary: a raw file transfer, per the
                    // FILE_MAGIC edge case. Nothing more to consume here.
                    // The next byte starts the following top-level frame.
                    let body = body.clone();
                    Ok(Step::Value(Resp::File(body)))
                }
            }
        }
    }

    fn finish_line(&mut self, kind: LineKind, line: String) -> Result<Step, ProtocolError> {
        match kind {
            LineKind::Simple => Ok(Step::Value(Resp::Simple(line))),
            LineKind::Error => Ok(Step::Value(Resp::Error(line))),
            LineKind::Integer => {
                let n = line
                    .parse::<i64>()
                    .map_err(|_| ProtocolError::InvalidInteger(line))?;
                Ok(Step::Value(Resp::Integer(n)))
            }
            LineKind::BulkLen => {
                let len = line
                    .parse::<i64>()
                    .map_err(|_| ProtocolError::InvalidInteger(line))?;
                if len < 0 {
                    Ok(Step::Value(Resp::Null))
                } else {
                    self.state = State::ReadBulkBody { len: len as usize };
                    Ok(Step::Continue)
                }
            }
            LineKind::ArrayLen => {
                let len = line
                    .parse::<i64>()
                    .map_err(|_| ProtocolError::InvalidInteger(line))?;
                if len <= 0 {
                    Ok(Step::Value(Resp::Array(Vec::new())))
                } else {
                    self.stack.push(ArrayFrame {
                        remaining: len as usize,
                        items: Vec::with_capacity(len as usize),
                    });
                    self.state = State::ReadType;
                    Ok(Step::Continue)
                }
            }
        }
    }
}

enum Step {
    NeedMore,
    Continue,
    Value(Resp),
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_string() {
        let mut d = Decoder::new();
        let out = d.feed(b"+OK\r\n").unwrap();
        assert_eq!(out, vec![Resp::Simple("OK".into())]);
    }

    #[test]
    fn decodes_array_of_bulks() {
        let mut d = Decoder::new();
        let out = d.feed(b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n").unwrap();
        assert_eq!(
            out,
            vec![Resp::Array(vec![Resp::bulk("ECHO"), Resp::bulk("hey")])]
        );
    }

    #[test]
    fn decodes_nested_arrays() {
        let mut d = Decoder::new();
        let out = d
            .feed(b"*2\r\n*2\r\n$1\r\na\r\n$1\r\nb\r\n*1\r\n$1\r\nc\r\n")
            .unwrap();
        assert_eq!(
            out,
            vec![Resp::Array(vec![
                Resp::Array(vec![Resp::bulk("a"), Resp::bulk("b")]),
                Resp::Array(vec![Resp::bulk("c")]),
            ])]
        );
    }

    #[test]
    fn resumes_across_partial_feeds() {
        let mut d = Decoder::new();
        assert!(d.feed(b"*2\r\n$4\r\nECH").unwrap().is_empty());
        assert!(d.feed(b"O\r\n$3\r\nh").unwrap().is_empty());
        let out = d.feed(b"ey\r\n").unwrap();
        assert_eq!(
            out,
            vec![Resp::Array(vec![Resp::bulk("ECHO"), Resp::bulk("hey")])]
        );
    }

    #[test]
    fn decodes_pipelined_frames_in_one_feed() {
        let mut d = Decoder::new();
        let out = d.feed(b"+PONG\r\n+PONG\r\n:5\r\n").unwrap();
        assert_eq!(
            out,
            vec![
                Resp::Simple("PONG".into()),
                Resp::Simple("PONG".into()),
                Resp::Integer(5),
            ]
        );
    }

    #[test]
    fn decodes_null_bulk() {
        let mut d = Decoder::new();
        let out = d.feed(b"$-1\r\n").unwrap();
        assert_eq!(out, vec![Resp::Null]);
    }

    #[test]
    fn decodes_file_transfer_bulk_without_boundary() {
        let mut d = Decoder::new();
        // $5\r\n + 5 raw bytes, immediately followed by the start of the
        // next top-level frame with no \r\n in between.
        let mut bytes = b"$5\r\n".to_vec();
        bytes.extend_from_slice(FILE_MAGIC);
        bytes.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        let out = d.feed(&bytes).unwrap();
        assert_eq!(
            out,
            vec![
                Resp::File(FILE_MAGIC.to_vec()),
                Resp::Array(vec![Resp::bulk("PING")]),
            ]
        );
    }

    #[test]
    fn roundtrips_encode_decode_for_every_variant() {
        let values = vec![
            Resp::Simple("OK".into()),
            Resp::Error("ERR bad".into()),
            Resp::Integer(-42),
            Resp::Bulk("hello world".into()),
            Resp::Null,
            Resp::Array(vec![Resp::bulk("a"), Resp::Integer(1), Resp::Null]),
        ];
        for value in values {
            let bytes = encode(&value);
            let mut d = Decoder::new();
            let out = d.feed(&bytes).unwrap();
            assert_eq!(out, vec![value]);
        }
    }

    #[test]
    fn rejects_unknown_type_byte() {
        let mut d = Decoder::new();
        assert!(d.feed(b"!bad\r\n").is_err());
    }

    #[test]
    fn encode_array_passthrough_concatenates_raw_parts() {
        let parts = vec![encode(&Resp::simple("OK")), encode(&Resp::Integer(2))];
        let out = encode_array_passthrough(&parts);
        let mut d = Decoder::new();
        let decoded = d.feed(&out).unwrap();
        assert_eq!(
            decoded,
            vec![Resp::Array(vec![Resp::Simple("OK".into()), Resp::Integer(2)])]
        );
    }
}
