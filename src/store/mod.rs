//! The in-memory keyspace: string values with TTL expiry and append-only
//! streams with blocking tail-reads, behind a single mutex. All mutating
//! operations take the same lock, so readers never observe a torn write.

pub mod rdb;
pub mod stream;

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::errors::StoreError;
use stream::{resolve_xadd_id, Stream, StreamId};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Stream(Stream),
}

#[derive(Debug, Clone)]
pub struct KeyspaceEntry {
    pub value: Value,
    pub expiry_ms_unix: Option<u64>,
}

impl KeyspaceEntry {
    pub fn string(value: impl Into<String>, expiry_ms_unix: Option<u64>) -> Self {
        KeyspaceEntry {
            value: Value::Str(value.into()),
            expiry_ms_unix,
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, KeyspaceEntry>,
}

impl Inner {
    fn evict_if_expired(&mut self, key: &str) {
        let expired = matches!(
            self.entries.get(key),
            Some(e) if e.expiry_ms_unix.is_some_and(|exp| now_ms() >= exp)
        );
        if expired {
            self.entries.remove(key);
        }
    }
}

/// Set options accepted alongside a key/value. Only `px` is in scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub px_millis: Option<u64>,
}

/// How long an XREAD with BLOCK should wait for new entries.
#[derive(Debug, Clone, Copy)]
pub enum Block {
    NoBlock,
    /// `BLOCK 0`: wait indefinitely, recomputing the per-stream start id
    /// at wait time so only genuinely new entries are returned.
    Infinite,
    Timeout(Duration),
}

pub type StreamEntries = Vec<(StreamId, Vec<(String, String)>)>;

pub struct Store {
    inner: Mutex<Inner>,
    stream_cv: Condvar,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            inner: Mutex::new(Inner::default()),
            stream_cv: Condvar::new(),
        }
    }

    pub fn from_initial(entries: HashMap<String, KeyspaceEntry>) -> Self {
        Store {
            inner: Mutex::new(Inner { entries }),
            stream_cv: Condvar::new(),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut guard = self.inner.lock().unwrap();
        guard.evict_if_expired(key);
        match guard.entries.get(key) {
            None => Ok(None),
            Some(e) => match &e.value {
                Value::Str(s) => Ok(Some(s.clone())),
                Value::Stream(_) => Err(StoreError::WrongType),
            },
        }
    }

    pub fn set(&self, key: &str, value: &str, options: SetOptions) {
        let expiry = options.px_millis.map(|ms| now_ms() + ms);
        let mut guard = self.inner.lock().unwrap();
        guard
            .entries
            .insert(key.to_string(), KeyspaceEntry::string(value, expiry));
    }

    pub fn value_type(&self, key: &str) -> &'static str {
        let mut guard = self.inner.lock().unwrap();
        guard.evict_if_expired(key);
        match guard.entries.get(key) {
            None => "none",
            Some(e) => match &e.value {
                Value::Str(_) => "string",
                Value::Stream(_) => "stream",
            },
        }
    }

    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let mut guard = self.inner.lock().unwrap();
        let now = now_ms();
        let expired: Vec<String> = guard
            .entries
            .iter()
            .filter(|(_, e)| e.expiry_ms_unix.is_some_and(|exp| now >= exp))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            guard.entries.remove(&key);
        }
        guard
            .entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect()
    }

    pub fn get_all_keys(&self) -> Vec<String> {
        self.keys("*")
    }

    pub fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut guard = self.inner.lock().unwrap();
        guard.evict_if_expired(key);
        match guard.entries.get_mut(key) {
            None => {
                guard
                    .entries
                    .insert(key.to_string(), KeyspaceEntry::string("1", None));
                Ok(1)
            }
            Some(entry) => match &mut entry.value {
                Value::Str(s) => {
                    let n: i64 = s.parse().map_err(|_| StoreError::NotAnInteger)?;
                    let n = n
                        .checked_add(1)
                        .ok_or(StoreError::NotAnInteger)?;
                    *s = n.to_string();
                    Ok(n)
                }
                Value::Stream(_) => Err(StoreError::WrongType),
            },
        }
    }

    pub fn xadd(
        &self,
        key: &str,
        id_spec: &str,
        fields: Vec<(String, String)>,
    ) -> Result<StreamId, StoreError> {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard
            .entries
            .entry(key.to_string())
            .or_insert_with(|| KeyspaceEntry {
                value: Value::Stream(Stream::default()),
                expiry_ms_unix: None,
            });
        let stream = match &mut entry.value {
            Value::Stream(s) => s,
            Value::Str(_) => return Err(StoreError::WrongType),
        };
        let id = resolve_xadd_id(id_spec, stream.last_id())?;
        let id = stream.append(id, fields)?;
        self.stream_cv.notify_all();
        Ok(id)
    }

    pub fn xrange(&self, key: &str, low: StreamId, high: StreamId) -> Result<StreamEntries, StoreError> {
        let guard = self.inner.lock().unwrap();
        match guard.entries.get(key) {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Value::Stream(s) => Ok(s
                    .range(low, high)
                    .into_iter()
                    .map(|e| (e.id, e.fields.clone()))
                    .collect()),
                Value::Str(_) => Err(StoreError::WrongType),
            },
        }
    }

    pub fn latest_stream_id(&self, key: &str) -> StreamId {
        let guard = self.inner.lock().unwrap();
        match guard.entries.get(key) {
            Some(KeyspaceEntry { value: Value::Stream(s), .. }) => s.last_id().unwrap_or(StreamId::MIN),
            _ => StreamId::MIN,
        }
    }

    /// Reads entries strictly after `ids[i]` for `streams[i]`, blocking per
    /// `block` if the initial read is empty. Returns `None` when a
    /// single-stream request times out with nothing new.
    pub fn xread(
        &self,
        streams: &[String],
        ids: &[StreamId],
        block: Block,
    ) -> Option<Vec<(String, StreamEntries)>> {
        let mut guard = self.inner.lock().unwrap();

        let scan = |guard: &Inner, ids: &[StreamId]| -> Vec<(String, StreamEntries)> {
            let mut out = Vec::new();
            for (key, low) in streams.iter().zip(ids.iter()) {
                if let Some(KeyspaceEntry { value: Value::Stream(s), .. }) = guard.entries.get(key) {
                    let found: StreamEntries = s
                        .after(*low)
                        .into_iter()
                        .map(|e| (e.id, e.fields.clone()))
                        .collect();
                    if !found.is_empty() {
                        out.push((key.clone(), found));
                    }
                }
            }
            out
        };

        let initial = scan(&guard, ids);
        if !initial.is_empty() {
            return Some(initial);
        }

        let empty_outcome = |streams: &[String]| if streams.len() == 1 { None } else { Some(Vec::new()) };

        match block {
            Block::NoBlock => None,
            Block::Infinite => {
                let effective_ids: Vec<StreamId> = streams
                    .iter()
                    .map(|k| match guard.entries.get(k) {
                        Some(KeyspaceEntry { value: Value::Stream(s), .. }) => {
                            s.last_id().unwrap_or(StreamId::MIN)
                        }
                        _ => StreamId::MIN,
                    })
                    .collect();
                loop {
                    let found = scan(&guard, &effective_ids);
                    if !found.is_empty() {
                        return Some(found);
                    }
                    guard = self.stream_cv.wait(guard).unwrap();
                }
            }
            Block::Timeout(duration) => {
                let deadline = Instant::now() + duration;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        return empty_outcome(streams);
                    }
                    let (next_guard, wait_result) =
                        self.stream_cv.wait_timeout(guard, deadline - now).unwrap();
                    guard = next_guard;
                    let found = scan(&guard, ids);
                    if !found.is_empty() {
                        return Some(found);
                    }
                    if wait_result.timed_out() {
                        return empty_outcome(streams);
                    }
                }
            }
        }
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_rec(&pattern, &text)
}

fn glob_match_rec(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            glob_match_rec(&pattern[1..], text)
                || (!text.is_empty() && glob_match_rec(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && glob_match_rec(&pattern[1..], &text[1..]),
        Some(c) => text.first() == Some(c) && glob_match_rec(&pattern[1..], &text[1..]),
    }
}
