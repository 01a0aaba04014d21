use std::cmp::Ordering;
use std::fmt::Display;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::StoreError;

/// `(ms, seq)`. Strict lexicographic order on the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId { ms: u64::MAX, seq: u64::MAX };

    pub fn new(ms: u64, seq: u64) -> Self {
        StreamId { ms, seq }
    }
}

impl PartialOrd for StreamId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((ms, seq)) => {
                let ms = ms.parse().map_err(|_| StoreError::InvalidId(s.to_string()))?;
                let seq = seq.parse().map_err(|_| StoreError::InvalidId(s.to_string()))?;
                Ok(StreamId { ms, seq })
            }
            None => {
                let ms = s.parse().map_err(|_| StoreError::InvalidId(s.to_string()))?;
                Ok(StreamId { ms, seq: 0 })
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// The lower-bound endpoint of an XRANGE/XREAD request, expanded per the
/// endpoint grammar (`-`, a bare ms, or a full `ms-seq` id).
pub fn parse_range_low(token: &str) -> Result<StreamId, StoreError> {
    if token == "-" {
        return Ok(StreamId::MIN);
    }
    if !token.contains('-') {
        let ms = token
            .parse::<u64>()
            .map_err(|_| StoreError::InvalidId(token.to_string()))?;
        return Ok(StreamId::new(ms, 0));
    }
    token.parse()
}

/// The upper-bound endpoint of an XRANGE/XREAD request.
pub fn parse_range_high(token: &str) -> Result<StreamId, StoreError> {
    if token == "+" {
        return Ok(StreamId::MAX);
    }
    if !token.contains('-') {
        let ms = token
            .parse::<u64>()
            .map_err(|_| StoreError::InvalidId(token.to_string()))?;
        return Ok(StreamId::new(ms, u64::MAX));
    }
    token.parse()
}

/// Resolves an XADD id spec (`*`, `<ms>-*`, or an explicit id) against the
/// stream's last id. Does not check the monotonicity invariant; the
/// caller does that against the result.
pub fn resolve_xadd_id(spec: &str, last: Option<StreamId>) -> Result<StreamId, StoreError> {
    if spec == "*" {
        let ms = now_ms();
        return Ok(match last {
            Some(last) if last.ms == ms => StreamId::new(ms, last.seq + 1),
            _ => StreamId::new(ms, 0),
        });
    }
    if let Some(ms_part) = spec.strip_suffix("-*") {
        let ms: u64 = ms_part
            .parse()
            .map_err(|_| StoreError::InvalidId(spec.to_string()))?;
        let seq = match last {
            Some(last) if last.ms == ms => last.seq + 1,
            Some(_) => 0,
            None if ms == 0 => 1,
            None => 0,
        };
        return Ok(StreamId::new(ms, seq));
    }
    spec.parse()
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub id: StreamId,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: Vec<Entry>,
}

impl Stream {
    pub fn last_id(&self) -> Option<StreamId> {
        self.entries.last().map(|e| e.id)
    }

    /// Validates `id` against the monotonicity invariant and, if it
    /// passes, appends the entry. Returns the concrete id used.
    pub fn append(&mut self, id: StreamId, fields: Vec<(String, String)>) -> Result<StreamId, StoreError> {
        if id <= StreamId::MIN {
            return Err(StoreError::XaddIdTooSmall);
        }
        if let Some(last) = self.last_id() {
            if id <= last {
                return Err(StoreError::XaddIdNotMonotonic);
            }
        }
        self.entries.push(Entry { id, fields });
        Ok(id)
    }

    pub fn range(&self, low: StreamId, high: StreamId) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|e| e.id >= low && e.id <= high)
            .collect()
    }

    /// Exclusive-lower-bound range used by XREAD (`low` itself is excluded).
    pub fn after(&self, low: StreamId) -> Vec<&Entry> {
        self.entries.iter().filter(|e| e.id > low).collect()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_lexicographically() {
        assert!(StreamId::new(1, 1) < StreamId::new(1, 2));
        assert!(StreamId::new(1, 5) < StreamId::new(2, 0));
        assert_eq!(StreamId::new(1, 1), StreamId::new(1, 1));
    }

    #[test]
    fn explicit_id_must_exceed_last() {
        let mut s = Stream::default();
        s.append(StreamId::new(1, 1), vec![]).unwrap();
        let err = s.append(StreamId::new(1, 1), vec![]).unwrap_err();
        assert_eq!(err, StoreError::XaddIdNotMonotonic);
    }

    #[test]
    fn zero_zero_is_rejected() {
        let mut s = Stream::default();
        let err = s.append(StreamId::MIN, vec![]).unwrap_err();
        assert_eq!(err, StoreError::XaddIdTooSmall);
    }

    #[test]
    fn ms_star_increments_seq_within_same_ms() {
        assert_eq!(resolve_xadd_id("5-*", None).unwrap(), StreamId::new(5, 0));
        assert_eq!(
            resolve_xadd_id("5-*", Some(StreamId::new(5, 3))).unwrap(),
            StreamId::new(5, 4)
        );
        assert_eq!(
            resolve_xadd_id("5-*", Some(StreamId::new(4, 9))).unwrap(),
            StreamId::new(5, 0)
        );
    }

    #[test]
    fn ms_star_on_empty_stream_with_ms_zero_starts_at_one() {
        assert_eq!(resolve_xadd_id("0-*", None).unwrap(), StreamId::new(0, 1));
    }

    #[test]
    fn range_endpoints_expand_bare_ms() {
        assert_eq!(parse_range_low("5").unwrap(), StreamId::new(5, 0));
        assert_eq!(parse_range_high("5").unwrap(), StreamId::new(5, u64::MAX));
        assert_eq!(parse_range_low("-").unwrap(), StreamId::MIN);
        assert_eq!(parse_range_high("+").unwrap(), StreamId::MAX);
    }
}
