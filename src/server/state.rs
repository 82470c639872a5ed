//! Auction state store -- the replicated record of the current round.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::utils::{now_millis, SubastaError};
use crate::wire::fmt_amount;

use serde::{Deserialize, Serialize};

/// Sentinel bidder value while no bid has been committed.
pub const NO_BIDDER: &str = "none";

/// One bidder's standing within the current session, keyed by address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// Bidder identity: the observed peer address literal.
    pub address: String,
    /// Most recently committed bid from this address.
    pub last_bid: f64,
    /// Commit time of `last_bid`.
    pub last_update_millis: i64,
}

/// Serializable snapshot of the complete store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoreSnapshot {
    high_bid: f64,
    high_bidder: String,
    started_at_millis: i64,
    active: bool,
    participants: Vec<ParticipantRecord>,
}

struct StoreInner {
    high_bid: f64,
    high_bidder: String,
    participants: Vec<ParticipantRecord>,
}

impl StoreInner {
    fn initial() -> Self {
        StoreInner {
            high_bid: 0.0,
            high_bidder: NO_BIDDER.into(),
            participants: vec![],
        }
    }
}

/// In-memory record of the current auction round. All mutators serialize
/// under the inner lock; `active` and `started_at_millis` are mirrored in
/// atomics so hot paths can check them without locking.
pub struct AuctionStore {
    inner: Mutex<StoreInner>,
    active: AtomicBool,
    started_at_millis: AtomicI64,
}

impl AuctionStore {
    /// Creates a store with all fields at their initial values.
    pub fn new() -> Self {
        AuctionStore {
            inner: Mutex::new(StoreInner::initial()),
            active: AtomicBool::new(false),
            started_at_millis: AtomicI64::new(0),
        }
    }

    fn locked(&self) -> MutexGuard<'_, StoreInner> {
        // a poisoned lock only means a panicked test thread; the data is
        // still consistent because mutators never unwind mid-update
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Upserts the bidder's record and commits the bid if it strictly
    /// exceeds the current high. Returns whether the bid took the lead;
    /// an equal bid never displaces the incumbent.
    pub fn register(&self, bid: f64, address: &str) -> bool {
        let millis = now_millis();
        let mut inner = self.locked();
        match inner
            .participants
            .iter()
            .position(|p| p.address == address)
        {
            Some(idx) => {
                let record = &mut inner.participants[idx];
                record.last_bid = bid;
                record.last_update_millis = millis;
            }
            None => inner.participants.push(ParticipantRecord {
                address: address.into(),
                last_bid: bid,
                last_update_millis: millis,
            }),
        }
        if bid > inner.high_bid {
            inner.high_bid = bid;
            inner.high_bidder = address.into();
            true
        } else {
            false
        }
    }

    /// Applies a replicated high-bid update from the leader. Never lowers
    /// the high bid or a participant's recorded bid, which makes it
    /// idempotent and safe under out-of-order delivery.
    pub fn merge_remote(&self, bid: f64, address: &str) {
        let millis = now_millis();
        let mut inner = self.locked();
        match inner
            .participants
            .iter()
            .position(|p| p.address == address)
        {
            Some(idx) => {
                let record = &mut inner.participants[idx];
                if bid > record.last_bid {
                    record.last_bid = bid;
                    record.last_update_millis = millis;
                }
            }
            None => inner.participants.push(ParticipantRecord {
                address: address.into(),
                last_bid: bid,
                last_update_millis: millis,
            }),
        }
        if bid > inner.high_bid {
            inner.high_bid = bid;
            inner.high_bidder = address.into();
        }
    }

    /// Returns all fields to their initial values.
    pub fn reset(&self) {
        let mut inner = self.locked();
        *inner = StoreInner::initial();
        self.active.store(false, Ordering::Release);
        self.started_at_millis.store(0, Ordering::Release);
    }

    /// Marks the round active and records its start time.
    pub fn start(&self) {
        self.started_at_millis
            .store(now_millis(), Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    /// Marks the round no longer active.
    pub fn finish(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether a round is currently active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start time of the current round, 0 if never started.
    pub fn started_at_millis(&self) -> i64 {
        self.started_at_millis.load(Ordering::Acquire)
    }

    /// Current `(high_bidder, high_bid)` pair.
    pub fn high(&self) -> (String, f64) {
        let inner = self.locked();
        (inner.high_bidder.clone(), inner.high_bid)
    }

    /// Renders the current standings as `OFERTA_MAX:<address>:<bid>`
    /// (`OFERTA_MAX:none:0.0` while no bid is committed).
    pub fn snapshot_high(&self) -> String {
        let inner = self.locked();
        format!(
            "OFERTA_MAX:{}:{}",
            inner.high_bidder,
            fmt_amount(inner.high_bid)
        )
    }

    /// The winning participant record, if any bid was committed.
    pub fn winner(&self) -> Option<ParticipantRecord> {
        let inner = self.locked();
        if inner.high_bidder == NO_BIDDER {
            return None;
        }
        inner
            .participants
            .iter()
            .find(|p| p.address == inner.high_bidder)
            .cloned()
    }

    /// Serializes the complete store into one JSON line.
    pub fn serialize(&self) -> Result<String, SubastaError> {
        let snapshot = {
            let inner = self.locked();
            StoreSnapshot {
                high_bid: inner.high_bid,
                high_bidder: inner.high_bidder.clone(),
                started_at_millis: self.started_at_millis(),
                active: self.is_active(),
                participants: inner.participants.clone(),
            }
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Replaces the complete store from a serialized snapshot.
    pub fn deserialize(&self, data: &str) -> Result<(), SubastaError> {
        let snapshot: StoreSnapshot = serde_json::from_str(data)?;
        let mut inner = self.locked();
        inner.high_bid = snapshot.high_bid;
        inner.high_bidder = snapshot.high_bidder;
        inner.participants = snapshot.participants;
        self.started_at_millis
            .store(snapshot.started_at_millis, Ordering::Release);
        self.active.store(snapshot.active, Ordering::Release);
        Ok(())
    }
}

impl Default for AuctionStore {
    fn default() -> Self {
        Self::new()
    }
}
