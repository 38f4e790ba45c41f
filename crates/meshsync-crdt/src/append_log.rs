//! Grow-only append log.
//!
//! Every entry is identified by `(author, seq)`. The clock counts, per
//! author, the longest contiguous run of entries held starting at 1, so an
//! entry that arrives ahead of its predecessor is stored but not counted
//! until the gap fills.

use async_trait::async_trait;
use bytes::Bytes;
use meshsync_proto::codec::{from_slice, to_vec};
use meshsync_proto::{DeltaRecord, ProtoError, ReplicaId, Shared, VectorClock};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::warn;

/// Type name carried by every record an [`AppendLog`] produces.
pub const APPEND_LOG_TYPE: &str = "append-log";

/// One appended value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Replica that appended the value.
    pub author: ReplicaId,
    /// Per-author sequence number, starting at 1.
    pub seq: u64,
    /// Author's clock just before appending.
    pub previous_clock: VectorClock,
    /// The value.
    pub value: String,
}

#[derive(Debug, Default)]
struct LogState {
    clock: VectorClock,
    entries: BTreeMap<(ReplicaId, u64), LogEntry>,
}

impl LogState {
    fn insert(&mut self, entry: LogEntry) -> bool {
        let key = (entry.author.clone(), entry.seq);
        if self.entries.contains_key(&key) {
            return false;
        }
        let author = entry.author.clone();
        self.entries.insert(key, entry);

        let mut next = self.clock.get(&author) + 1;
        while self.entries.contains_key(&(author.clone(), next)) {
            self.clock.advance(&author, next);
            next += 1;
        }
        true
    }
}

/// A replicated, append-only list of strings.
pub struct AppendLog {
    replica: ReplicaId,
    name: String,
    state: RwLock<LogState>,
    clock_tx: watch::Sender<VectorClock>,
}

impl AppendLog {
    /// Create an empty log owned by `replica`.
    pub fn new(replica: ReplicaId, name: impl Into<String>) -> Self {
        let (clock_tx, _) = watch::channel(VectorClock::new());
        Self {
            replica,
            name: name.into(),
            state: RwLock::new(LogState::default()),
            clock_tx,
        }
    }

    /// The local replica.
    #[must_use]
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Collaboration name written into records.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a value locally and return the delta describing it.
    pub fn push(&self, value: impl Into<String>) -> Result<DeltaRecord, ProtoError> {
        let (record, clock) = {
            let mut state = self.state.write();
            let previous_clock = state.clock.clone();
            let entry = LogEntry {
                author: self.replica.clone(),
                seq: previous_clock.get(&self.replica) + 1,
                previous_clock: previous_clock.clone(),
                value: value.into(),
            };
            let record = self.record(previous_clock, unit_clock(&self.replica), &[&entry])?;
            state.insert(entry);
            (record, state.clock.clone())
        };
        self.clock_tx.send_replace(clock);
        Ok(record)
    }

    /// Values ordered by `(seq, author)`.
    #[must_use]
    pub fn value(&self) -> Vec<String> {
        let state = self.state.read();
        let mut entries: Vec<&LogEntry> = state.entries.values().collect();
        entries.sort_by(|a, b| (a.seq, &a.author).cmp(&(b.seq, &b.author)));
        entries.into_iter().map(|e| e.value.clone()).collect()
    }

    /// Number of entries held, counted or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// True when no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(
        &self,
        previous_clock: VectorClock,
        author_clock: VectorClock,
        entries: &[&LogEntry],
    ) -> Result<DeltaRecord, ProtoError> {
        let state = Bytes::from(to_vec(entries)?);
        Ok(DeltaRecord::new(
            previous_clock,
            author_clock,
            self.name.clone(),
            APPEND_LOG_TYPE,
            state,
        ))
    }
}

impl std::fmt::Debug for AppendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("AppendLog")
            .field("replica", &self.replica)
            .field("name", &self.name)
            .field("clock", &state.clock)
            .field("entries", &state.entries.len())
            .finish()
    }
}

/// Keep a record, or log why it could not be built.
fn logged(name: &str, record: Result<DeltaRecord, ProtoError>) -> Option<DeltaRecord> {
    match record {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(log = %name, error = %e, code = e.error_code(), "Dropping record that failed to encode");
            None
        }
    }
}

fn unit_clock(replica: &ReplicaId) -> VectorClock {
    std::iter::once((replica.clone(), 1u64)).collect()
}

#[async_trait]
impl Shared for AppendLog {
    fn type_name(&self) -> &str {
        APPEND_LOG_TYPE
    }

    fn clock(&self) -> VectorClock {
        self.state.read().clock.clone()
    }

    fn deltas(&self, since: &VectorClock) -> Vec<DeltaRecord> {
        let state = self.state.read();
        let mut missing: Vec<&LogEntry> = state
            .entries
            .values()
            .filter(|e| e.seq > since.get(&e.author))
            .collect();
        // An entry's previous clock covers every entry it depends on, so the
        // totals order dependencies first.
        missing.sort_by(|a, b| {
            (a.previous_clock.total(), a.seq, &a.author).cmp(&(
                b.previous_clock.total(),
                b.seq,
                &b.author,
            ))
        });
        missing
            .into_iter()
            .filter_map(|e| {
                logged(
                    &self.name,
                    self.record(e.previous_clock.clone(), unit_clock(&e.author), &[e]),
                )
            })
            .collect()
    }

    async fn apply(
        &self,
        record: DeltaRecord,
        _is_delta: bool,
        _is_sub: bool,
    ) -> Result<bool, ProtoError> {
        if record.payload.type_name != APPEND_LOG_TYPE {
            return Err(ProtoError::InvalidState {
                type_name: record.payload.type_name,
                reason: format!("expected {APPEND_LOG_TYPE}"),
            });
        }
        let entries: Vec<LogEntry> = from_slice(&record.payload.state)?;

        let (inserted, clock) = {
            let mut state = self.state.write();
            let before = state.clock.clone();
            let mut inserted = false;
            for entry in entries {
                inserted |= state.insert(entry);
            }
            let clock = (state.clock != before).then(|| state.clock.clone());
            (inserted, clock)
        };
        if let Some(clock) = clock {
            self.clock_tx.send_replace(clock);
        }
        Ok(inserted)
    }

    fn state_as_delta(&self) -> Option<DeltaRecord> {
        let state = self.state.read();
        if state.entries.is_empty() {
            return None;
        }
        let entries: Vec<&LogEntry> = state.entries.values().collect();
        logged(
            &self.name,
            self.record(VectorClock::new(), state.clock.clone(), &entries),
        )
    }

    fn subscribe_clock(&self) -> watch::Receiver<VectorClock> {
        self.clock_tx.subscribe()
    }
}
