use std::collections::VecDeque;

use tokio::sync::Mutex;
use tracing::{debug, info};

use urd_types::{LogId, LogIndex, Term, UrdError};

use crate::codec::{LogEntryDecoder, LogEntryEncoder};
use crate::traits::LogStorage;
use crate::types::{LogEntry, Snapshot};

/// Entries read from storage per cursor page.
const PAGE: u64 = 256;

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, UrdError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| UrdError::Storage(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, UrdError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| UrdError::Decode(e.to_string()))
}

#[derive(Debug, Clone, Copy, Default)]
struct Tail {
    last_index: LogIndex,
    last_term: Term,
    commit_index: LogIndex,
    purged_index: LogIndex,
    purged_term: Term,
}

/// What a follower did with an `append_entries` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Entries up to `last_index` now match the leader.
    Appended { last_index: LogIndex },
    /// The entry before the batch is missing or has another term; the
    /// leader must resend from further back. `last_index` is this log's end.
    Mismatch { last_index: LogIndex },
}

/// Bytes a leader ships to one follower, with the position they attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationBatch {
    pub prev_index: LogIndex,
    pub prev_term: Term,
    /// Codec stream: optionally a snapshot marker plus the snapshot frame,
    /// then consecutive command entries.
    pub frames: Vec<u8>,
    pub last_index: LogIndex,
}

/// A decoded [`ReplicationBatch::frames`] stream.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<LogEntry>,
}

/// Splits a replication stream into an optional leading snapshot and the
/// entries after it. A marker anywhere but the front is a framing error.
pub fn decode_batch(bytes: &[u8]) -> Result<DecodedBatch, UrdError> {
    let mut dec = LogEntryDecoder::new(bytes);
    let mut out = DecodedBatch::default();
    let mut first = true;
    while let Some(entry) = dec.decode()? {
        if entry.is_snapshot_marker() {
            if !first {
                return Err(UrdError::Framing("snapshot marker inside entry batch".into()));
            }
            let frame = dec
                .decode()?
                .ok_or_else(|| UrdError::Framing("snapshot marker without snapshot".into()))?;
            if frame.is_snapshot_marker() {
                return Err(UrdError::Framing("consecutive snapshot markers".into()));
            }
            let snapshot: Snapshot = decode(&frame.data)?;
            if snapshot.meta.last_log_index != frame.index || snapshot.meta.last_log_term != frame.term {
                return Err(UrdError::Framing("snapshot frame header disagrees with body".into()));
            }
            out.snapshot = Some(snapshot);
        } else {
            out.entries.push(entry);
        }
        first = false;
    }
    Ok(out)
}

/// Append-only log of one node, persisted through a [`LogStorage`].
///
/// The tail position is tracked in memory behind an async mutex so index
/// assignment, truncation and commit advance are serialized.
pub struct ReplicatedLog<S> {
    id: LogId,
    store: S,
    tail: Mutex<Tail>,
}

impl<S: LogStorage> ReplicatedLog<S> {
    /// Opens log `id`, recovering its end, commit index and purged prefix.
    pub async fn open(store: S, id: LogId) -> Result<Self, UrdError> {
        let state = store.log_state(id).await?;
        let mut tail = Tail {
            purged_index: state.last_purged_index.unwrap_or(0),
            purged_term: state.last_purged_term,
            ..Tail::default()
        };
        match state.last_index {
            Some(last) => {
                let entry = store
                    .get_entry(id, last)
                    .await?
                    .ok_or_else(|| UrdError::Storage(format!("log {id}: entry {last} vanished")))?;
                tail.last_index = last;
                tail.last_term = entry.term;
            }
            None => {
                tail.last_index = tail.purged_index;
                tail.last_term = tail.purged_term;
            }
        }
        tail.commit_index = store.read_commit(id).await?.unwrap_or(0).min(tail.last_index);
        tail.commit_index = tail.commit_index.max(tail.purged_index);
        Ok(ReplicatedLog { id, store, tail: Mutex::new(tail) })
    }

    pub fn id(&self) -> LogId {
        self.id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn last_index(&self) -> LogIndex {
        self.tail.lock().await.last_index
    }

    pub async fn last_term(&self) -> Term {
        self.tail.lock().await.last_term
    }

    pub async fn commit_index(&self) -> LogIndex {
        self.tail.lock().await.commit_index
    }

    /// Last index covered by a snapshot, 0 if nothing was compacted.
    pub async fn purged_index(&self) -> LogIndex {
        self.tail.lock().await.purged_index
    }

    /// Appends `data` as the next entry. `term` may not go backwards.
    pub async fn append(&self, term: Term, data: Vec<u8>) -> Result<LogEntry, UrdError> {
        let mut tail = self.tail.lock().await;
        if term < tail.last_term {
            return Err(UrdError::InvalidArgument(format!(
                "term {term} is behind log term {}",
                tail.last_term
            )));
        }
        let entry = LogEntry::command(term, tail.last_index + 1, data);
        self.store.append(self.id, vec![entry.clone()]).await?;
        tail.last_index = entry.index;
        tail.last_term = term;
        Ok(entry)
    }

    /// Follower side of replication: attaches `entries` after
    /// `(prev_index, prev_term)`, replacing any conflicting uncommitted
    /// suffix. Entries already present with the same term are kept.
    pub async fn append_entries(
        &self,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<LogEntry>,
    ) -> Result<AppendOutcome, UrdError> {
        for (i, e) in entries.iter().enumerate() {
            if e.is_snapshot_marker() || e.index != prev_index + 1 + i as u64 {
                return Err(UrdError::Framing(format!(
                    "non-consecutive entry {} after {prev_index}",
                    e.index
                )));
            }
        }

        let mut tail = self.tail.lock().await;
        if prev_index > tail.last_index {
            return Ok(AppendOutcome::Mismatch { last_index: tail.last_index });
        }
        if prev_index >= tail.purged_index {
            match self.term_at_locked(&tail, prev_index).await? {
                Some(t) if t == prev_term => {}
                _ => return Ok(AppendOutcome::Mismatch { last_index: tail.last_index }),
            }
        }

        let mut new_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index <= tail.purged_index {
                continue;
            }
            if new_entries.is_empty() && entry.index <= tail.last_index {
                match self.store.get_entry(self.id, entry.index).await? {
                    Some(existing) if existing.term == entry.term => continue,
                    _ => {
                        if entry.index <= tail.commit_index {
                            return Err(UrdError::CommittedEntryConflict(entry.index));
                        }
                        debug!(log = self.id, from = entry.index, "truncating conflicting suffix");
                        self.store.truncate_after(self.id, entry.index - 1).await?;
                        tail.last_index = entry.index - 1;
                        let term = self.term_at_locked(&tail, entry.index - 1).await?;
                        tail.last_term = term.unwrap_or(tail.purged_term);
                    }
                }
            }
            new_entries.push(entry);
        }

        if let Some(last) = new_entries.last() {
            let (last_index, last_term) = (last.index, last.term);
            self.store.append(self.id, new_entries).await?;
            tail.last_index = last_index;
            tail.last_term = last_term;
        }
        Ok(AppendOutcome::Appended { last_index: tail.last_index })
    }

    /// Removes every entry after `index`. Committed entries cannot be removed.
    pub async fn truncate_after(&self, index: LogIndex) -> Result<(), UrdError> {
        let mut tail = self.tail.lock().await;
        if index >= tail.last_index {
            return Ok(());
        }
        if index < tail.commit_index {
            return Err(UrdError::CommittedEntryConflict(index + 1));
        }
        self.store.truncate_after(self.id, index).await?;
        let term = self.term_at_locked(&tail, index).await?;
        tail.last_term = term.unwrap_or(tail.purged_term);
        tail.last_index = index;
        Ok(())
    }

    /// Advances the commit index to `index` (capped at the log end). Never
    /// moves it backwards. Returns the resulting commit index.
    pub async fn commit_to(&self, index: LogIndex) -> Result<LogIndex, UrdError> {
        let mut tail = self.tail.lock().await;
        let target = index.min(tail.last_index);
        if target > tail.commit_index {
            self.store.save_commit(self.id, target).await?;
            tail.commit_index = target;
        }
        Ok(tail.commit_index)
    }

    /// Term of the entry at `index`; `None` if it is not in the log.
    pub async fn term_at(&self, index: LogIndex) -> Result<Option<Term>, UrdError> {
        let tail = self.tail.lock().await;
        self.term_at_locked(&tail, index).await
    }

    async fn term_at_locked(&self, tail: &Tail, index: LogIndex) -> Result<Option<Term>, UrdError> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == tail.purged_index {
            return Ok(Some(tail.purged_term));
        }
        if index > tail.last_index || index < tail.purged_index {
            return Ok(None);
        }
        Ok(self.store.get_entry(self.id, index).await?.map(|e| e.term))
    }

    /// Lazy cursor over `[index, last_index]`, bounded by the log end at the
    /// time of the call.
    pub async fn entries_from(&self, index: LogIndex) -> EntryCursor<'_, S> {
        let end = self.last_index().await;
        EntryCursor::new(self, index.max(1), end)
    }

    /// Stores `snapshot` and purges every entry it covers. Only committed
    /// history can be compacted.
    pub async fn compact(&self, snapshot: Snapshot) -> Result<(), UrdError> {
        let mut tail = self.tail.lock().await;
        let upto = snapshot.meta.last_log_index;
        if upto > tail.commit_index {
            return Err(UrdError::InvalidArgument(format!(
                "cannot compact past commit index {} (requested {upto})",
                tail.commit_index
            )));
        }
        if upto <= tail.purged_index {
            return Ok(());
        }
        let term = snapshot.meta.last_log_term;
        self.store.save_snapshot(self.id, snapshot).await?;
        self.store.purge(self.id, upto, term).await?;
        tail.purged_index = upto;
        tail.purged_term = term;
        info!(log = self.id, up_to = upto, "log compacted");
        Ok(())
    }

    /// Replaces the history covered by a snapshot received from the leader.
    /// A local suffix that agrees with the snapshot's last entry is kept.
    pub async fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), UrdError> {
        let mut tail = self.tail.lock().await;
        let (upto, term) = (snapshot.meta.last_log_index, snapshot.meta.last_log_term);
        if upto <= tail.purged_index {
            return Ok(());
        }
        let keep_tail = self.term_at_locked(&tail, upto).await? == Some(term);
        self.store.save_snapshot(self.id, snapshot).await?;
        if !keep_tail {
            self.store.truncate_after(self.id, 0).await?;
        }
        self.store.purge(self.id, upto, term).await?;
        tail.purged_index = upto;
        tail.purged_term = term;
        if !keep_tail {
            tail.last_index = upto;
            tail.last_term = term;
        }
        if tail.commit_index < upto {
            self.store.save_commit(self.id, upto).await?;
            tail.commit_index = upto;
        }
        info!(log = self.id, up_to = upto, kept_tail = keep_tail, "snapshot installed");
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<Option<Snapshot>, UrdError> {
        self.store.read_snapshot(self.id).await
    }

    /// Builds the stream that brings a follower from `next_index` up to the
    /// current end. When `next_index` lies inside the compacted prefix the
    /// stream starts with a snapshot marker followed by the snapshot.
    pub async fn replication_frames(&self, next_index: LogIndex) -> Result<ReplicationBatch, UrdError> {
        let tail = *self.tail.lock().await;
        let next_index = next_index.max(1);
        let mut enc = LogEntryEncoder::new(Vec::new());

        let (prev_index, prev_term, from) = if next_index <= tail.purged_index {
            let snapshot = self
                .store
                .read_snapshot(self.id)
                .await?
                .ok_or_else(|| UrdError::Storage(format!("log {}: compacted without snapshot", self.id)))?;
            let frame = LogEntry::command(
                snapshot.meta.last_log_term,
                snapshot.meta.last_log_index,
                encode(&snapshot)?,
            );
            enc.encode(&LogEntry::snapshot_marker())?;
            enc.encode(&frame)?;
            (0, 0, snapshot.meta.last_log_index + 1)
        } else {
            let prev = next_index - 1;
            let term = self
                .term_at_locked(&tail, prev)
                .await?
                .ok_or_else(|| UrdError::Storage(format!("log {}: no entry {prev}", self.id)))?;
            (prev, term, next_index)
        };

        let mut cursor = EntryCursor::new(self, from, tail.last_index);
        while let Some(entry) = cursor.next().await? {
            enc.encode(&entry)?;
        }
        Ok(ReplicationBatch {
            prev_index,
            prev_term,
            frames: enc.into_inner(),
            last_index: tail.last_index,
        })
    }
}

/// Finite, restartable iterator over a log range. Entries are fetched from
/// storage a page at a time.
pub struct EntryCursor<'a, S> {
    log: &'a ReplicatedLog<S>,
    start: LogIndex,
    next: LogIndex,
    end: LogIndex,
    buf: VecDeque<LogEntry>,
}

impl<'a, S: LogStorage> EntryCursor<'a, S> {
    fn new(log: &'a ReplicatedLog<S>, start: LogIndex, end: LogIndex) -> Self {
        EntryCursor { log, start, next: start, end, buf: VecDeque::new() }
    }

    /// Next entry, or `None` once the end bound is passed. Hitting a
    /// compacted or missing entry is an error, never a silent skip.
    pub async fn next(&mut self) -> Result<Option<LogEntry>, UrdError> {
        if self.buf.is_empty() {
            if self.next > self.end {
                return Ok(None);
            }
            let to = self.end.min(self.next.saturating_add(PAGE - 1));
            let page = self.log.store.get_entries(self.log.id, self.next, to).await?;
            self.buf.extend(page);
        }
        match self.buf.pop_front() {
            Some(entry) if entry.index == self.next => {
                self.next += 1;
                Ok(Some(entry))
            }
            _ => Err(UrdError::Storage(format!(
                "log {}: entry {} is not available",
                self.log.id, self.next
            ))),
        }
    }

    /// Rewinds to the starting index. Entries appended since the cursor was
    /// created stay out of range.
    pub fn restart(&mut self) {
        self.next = self.start;
        self.buf.clear();
    }

    /// Drains the remaining entries into a vector.
    pub async fn collect(&mut self) -> Result<Vec<LogEntry>, UrdError> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }
}
