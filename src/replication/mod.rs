//! The primary side of replication: tracking connected replicas, fanning
//! writes out to them, and answering WAIT by blocking on their acks.
//!
//! WAIT blocks on a `Condvar` that `update_ack` notifies, rather than
//! polling on a fixed interval. No wasted wakeups, no arbitrary poll
//! granularity.

pub mod handshake;

use std::sync::mpsc::Sender;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct ReplicaHandle {
    id: u64,
    sender: Sender<Vec<u8>>,
    acked_offset: u64,
}

struct Inner {
    replicas: Vec<ReplicaHandle>,
    master_offset: u64,
    next_id: u64,
}

pub struct ReplicaRegistry {
    inner: Mutex<Inner>,
    ack_cv: Condvar,
}

impl Default for ReplicaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaRegistry {
    pub fn new() -> Self {
        ReplicaRegistry {
            inner: Mutex::new(Inner {
                replicas: Vec::new(),
                master_offset: 0,
                next_id: 0,
            }),
            ack_cv: Condvar::new(),
        }
    }

    /// Registers a newly PSYNC'd replica link, returning a handle used to
    /// later remove it when the connection drops.
    pub fn register(&self, sender: Sender<Vec<u8>>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.replicas.push(ReplicaHandle {
            id,
            sender,
            acked_offset: 0,
        });
        id
    }

    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.replicas.retain(|r| r.id != id);
        self.ack_cv.notify_all();
    }

    pub fn master_offset(&self) -> u64 {
        self.inner.lock().unwrap().master_offset
    }

    /// Fans an encoded, mutating command out to every connected replica and
    /// advances the master offset by its encoded length. Dead replica
    /// senders are dropped silently.
    pub fn propagate(&self, encoded: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.master_offset += encoded.len() as u64;
        inner
            .replicas
            .retain(|r| r.sender.send(encoded.to_vec()).is_ok());
    }

    /// Records an acked offset reported by a replica's `REPLCONF ACK`.
    pub fn update_ack(&self, id: u64, offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.replicas.iter_mut().find(|r| r.id == id) {
            r.acked_offset = r.acked_offset.max(offset);
        }
        self.ack_cv.notify_all();
    }

    /// WAIT: blocks until `num_replicas` have acked the current master
    /// offset, or `timeout` elapses, returning however many have. If
    /// nothing has ever been written (`master_offset == 0`), every
    /// connected replica is trivially "caught up" and the count returns
    /// immediately without sending GETACK.
    pub fn wait(&self, num_replicas: usize, timeout: Duration, getack_encoded: &[u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        if inner.master_offset == 0 {
            return inner.replicas.len();
        }

        let count_acked = |inner: &Inner, target: u64| {
            inner.replicas.iter().filter(|r| r.acked_offset >= target).count()
        };

        // The target is the offset as it stands before GETACK goes out.
        // A replica that has already applied everything up to here answers
        // GETACK with exactly this value, since it reports its pre-command
        // offset, so this target is reachable by the very first ACK.
        let target = inner.master_offset;
        let already = count_acked(&inner, target);
        if already >= num_replicas {
            return already;
        }

        // GETACK's own encoded length is folded into the offset now so a
        // later WAIT call's target accounts for replicas having to walk
        // past this GETACK too, matching how each replica bumps its own
        // counter by the GETACK's length after replying to it.
        inner.master_offset += getack_encoded.len() as u64;
        inner
            .replicas
            .retain(|r| r.sender.send(getack_encoded.to_vec()).is_ok());

        let deadline = Instant::now() + timeout;
        loop {
            let acked = count_acked(&inner, target);
            if acked >= num_replicas {
                return acked;
            }
            let now = Instant::now();
            if now >= deadline {
                return acked;
            }
            let (next, result) = self.ack_cv.wait_timeout(inner, deadline - now).unwrap();
            inner = next;
            if result.timed_out() {
                return count_acked(&inner, target);
            }
        }
    }
}
