use super::{Configuration, NodeID, Snapshot, Term};
use crate::encoding::{self, bincode, Value as _};
use crate::errdata;
use crate::error::Result;
use crate::storage;

use log::debug;
use serde::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no index if 0.
pub type Index = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The entry payload.
    pub payload: Payload,
}

impl encoding::Value for Entry {}

/// A log entry payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A noop, appended by new leaders to commit entries from previous terms
    /// (see section 5.4.2 in the Raft paper).
    Noop,
    /// An opaque state machine command.
    Command(#[serde(with = "serde_bytes")] Vec<u8>),
    /// A cluster configuration change. Takes effect when committed.
    Configuration(Configuration),
}

/// A log storage key. Keys are encoded by hand as a prefix byte followed by
/// any big-endian integer, which preserves the ordering of entry indexes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Key {
    /// A log entry, storing the term and payload.
    Entry(Index),
    /// Stores the current term and vote (if any).
    TermVote,
    /// Stores the current commit index and term.
    CommitIndex,
    /// Stores the base configuration, i.e. the configuration at the snapshot
    /// index, or one installed via Message::Configure.
    Configuration,
    /// Stores the latest snapshot, if any.
    Snapshot,
}

impl Key {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Key::Entry(index) => [&[0x00][..], &index.to_be_bytes()].concat(),
            Key::TermVote => vec![0x01],
            Key::CommitIndex => vec![0x02],
            Key::Configuration => vec![0x03],
            Key::Snapshot => vec![0x04],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [0x00, index @ ..] => match <[u8; 8]>::try_from(index) {
                Ok(index) => Ok(Key::Entry(Index::from_be_bytes(index))),
                Err(_) => errdata!("invalid entry key {bytes:x?}"),
            },
            [0x01] => Ok(Key::TermVote),
            [0x02] => Ok(Key::CommitIndex),
            [0x03] => Ok(Key::Configuration),
            [0x04] => Ok(Key::Snapshot),
            _ => errdata!("invalid log key {bytes:x?}"),
        }
    }
}

/// The Raft log stores a sequence of entries that are replicated across nodes
/// and applied sequentially to the local state machine. Each entry contains an
/// index, the term in which the leader proposed it, and a payload: a noop, an
/// opaque command, or a cluster configuration. For example:
///
/// Index | Term | Payload
/// ------|------|------------------------------------
///   1   |   1  | Noop
///   2   |   1  | Command(0x0102)
///   3   |   1  | Configuration(v2: 1,2,3 learner 4)
///   4   |   2  | Noop
///   5   |   2  | Command(0x03)
///
/// In the steady state, the log is append-only: the leader appends entries via
/// [`Log::append`] and followers splice them in via [`Log::splice`]. Once an
/// entry is replicated to a quorum it is committed via [`Log::commit`], and
/// the log is immutable up to that index. Uncommitted entries may be replaced
/// when a new leader has a different log.
///
/// To bound its size, the log can be compacted via [`Log::compact`], replacing
/// a committed prefix with a state machine snapshot. A lagging follower can
/// instead receive a snapshot from the leader via [`Log::install_snapshot`].
/// Compacted entries no longer exist, but the snapshot's index/term pair still
/// counts as the base of the remaining log.
///
/// Configuration changes are ordinary entries. The log tracks them in memory,
/// so that the active (latest committed) and pending (appended but not yet
/// committed) configurations can be looked up cheaply. Truncating the log
/// rolls back pending configurations along with the other entries.
///
/// The Raft log has the following invariants:
///
/// * Entry indexes are contiguous starting after the snapshot index.
/// * Entry terms never decrease from the previous entry.
/// * Entry terms are at or below the current term.
/// * Appended entries, terms and votes are durable (flushed) before return.
/// * Committed entries are never changed or removed, except by compaction.
/// * If two logs contain a matching index/term, all previous entries
///   are identical (see section 5.3 in the Raft paper).
pub struct Log {
    /// The underlying storage engine. Uses a trait object instead of generics,
    /// to allow runtime selection of the engine.
    pub(super) engine: Box<dyn storage::Engine>,
    /// The current term.
    term: Term,
    /// Our leader vote in the current term, if any.
    vote: Option<NodeID>,
    /// The index of the last stored entry (or the snapshot index).
    last_index: Index,
    /// The term of the last stored entry (or the snapshot term).
    last_term: Term,
    /// The index of the last committed entry.
    commit_index: Index,
    /// The term of the last committed entry.
    commit_term: Term,
    /// The index of the last compacted entry, i.e. the snapshot index.
    snapshot_index: Index,
    /// The term of the last compacted entry.
    snapshot_term: Term,
    /// The base configuration, which applies before any configuration
    /// entries in the log.
    configuration: Configuration,
    /// Configuration entries in the log, in index order.
    changes: Vec<(Index, Configuration)>,
}

impl Log {
    /// Initializes a log using the given storage engine.
    pub fn new(mut engine: Box<dyn storage::Engine>) -> Result<Self> {
        use std::ops::Bound::Included;
        let (term, vote) = engine
            .get(&Key::TermVote.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        let (commit_index, commit_term) = engine
            .get(&Key::CommitIndex.encode())?
            .map(|v| bincode::deserialize(&v))
            .transpose()?
            .unwrap_or((0, 0));
        let configuration = engine
            .get(&Key::Configuration.encode())?
            .map(|v| Configuration::decode(&v))
            .transpose()?
            .unwrap_or_default();
        let (snapshot_index, snapshot_term) = engine
            .get(&Key::Snapshot.encode())?
            .map(|v| Snapshot::decode(&v))
            .transpose()?
            .map(|s| (s.index, s.term))
            .unwrap_or((0, 0));

        let (mut last_index, mut last_term) = (snapshot_index, snapshot_term);
        let mut changes = Vec::new();
        let mut scan = engine
            .scan((Included(Key::Entry(0).encode()), Included(Key::Entry(Index::MAX).encode())));
        while let Some((_, value)) = scan.next().transpose()? {
            let entry = Entry::decode(&value)?;
            (last_index, last_term) = (entry.index, entry.term);
            if let Payload::Configuration(configuration) = entry.payload {
                changes.push((entry.index, configuration));
            }
        }
        drop(scan);

        Ok(Self {
            engine,
            term,
            vote,
            last_index,
            last_term,
            commit_index,
            commit_term,
            snapshot_index,
            snapshot_term,
            configuration,
            changes,
        })
    }

    /// Bootstraps a new cluster with the given initial configuration. Does
    /// nothing if the log already has a configuration or any entries, since
    /// the cluster configuration is then given by the log.
    pub fn bootstrap(&mut self, configuration: Configuration) -> Result<()> {
        if self.last_index > 0 || !self.configuration.is_empty() || !self.changes.is_empty() {
            return Ok(());
        }
        self.set_configuration(configuration)?;
        Ok(())
    }

    /// Returns the commit index and term.
    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Returns the last log index and term.
    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    /// Returns the snapshot index and term, or (0, 0) if there is no snapshot.
    pub fn get_snapshot_index(&self) -> (Index, Term) {
        (self.snapshot_index, self.snapshot_term)
    }

    /// Returns the current term (0 if none) and vote.
    pub fn get_term(&self) -> (Term, Option<NodeID>) {
        (self.term, self.vote)
    }

    /// Stores the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node in a term. The
    /// term and vote are flushed to storage before returning, since they must
    /// be durable before a vote or any other response is sent.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) -> Result<()> {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(&Key::TermVote.encode(), bincode::serialize(&(term, vote)))?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a payload to the log at the current term, and flushes it to
    /// disk, returning its index.
    pub fn append(&mut self, payload: Payload) -> Result<Index> {
        assert!(self.term > 0, "can't append entry in term 0");
        let entry = Entry { index: self.last_index + 1, term: self.term, payload };
        self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        self.engine.flush()?;
        if let Payload::Configuration(configuration) = &entry.payload {
            self.changes.push((entry.index, configuration.clone()));
        }
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index. The index must
    /// exist and be at or after the current commit index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        if index < self.commit_index {
            panic!("commit index regression {} → {}", self.commit_index, index);
        }
        if index == self.commit_index {
            return Ok(index);
        }
        let Some(term) = self.term_at(index)? else {
            panic!("commit index {index} does not exist");
        };
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term)))?;
        // NB: the commit index doesn't need to be flushed, since the entries
        // are flushed and the commit index can be recovered from a log quorum.
        self.commit_index = index;
        self.commit_term = term;
        Ok(index)
    }

    /// Fetches an entry at an index, or None if it does not exist or has been
    /// compacted.
    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        if index <= self.snapshot_index {
            return Ok(None);
        }
        self.engine.get(&Key::Entry(index).encode())?.map(|v| Entry::decode(&v)).transpose()
    }

    /// Returns the term of the entry at the given index. Index 0 has term 0,
    /// and the snapshot index has the snapshot term. Returns None if the entry
    /// does not exist or has been compacted.
    pub fn term_at(&mut self, index: Index) -> Result<Option<Term>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.snapshot_index {
            return Ok(Some(self.snapshot_term));
        }
        if index == self.last_index {
            return Ok(Some(self.last_term));
        }
        Ok(self.get(index)?.map(|e| e.term))
    }

    /// Checks if the log contains an entry with the given index and term.
    /// Index 0 is always present with term 0. Compacted entries are committed
    /// and thus known to match any leader's log.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index > self.last_index {
            return Ok(false);
        }
        if index < self.snapshot_index {
            return Ok(true);
        }
        Ok(self.term_at(index)? == Some(term))
    }

    /// Returns an iterator over log entries in the given index range.
    /// Compacted entries are not included.
    pub fn scan(&mut self, range: impl std::ops::RangeBounds<Index>) -> Iterator {
        use std::ops::Bound;
        let from = match range.start_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()),
        };
        let to = match range.end_bound() {
            Bound::Excluded(&index) => Bound::Excluded(Key::Entry(index).encode()),
            Bound::Included(&index) => Bound::Included(Key::Entry(index).encode()),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()),
        };
        Iterator::new(self.engine.scan((from, to)))
    }

    /// Returns an iterator over entries that are ready to apply, starting after
    /// the given applied index up to the commit index.
    pub fn scan_apply(&mut self, applied_index: Index) -> Iterator {
        if applied_index >= self.commit_index {
            return Iterator::new(Box::new(std::iter::empty()));
        }
        self.scan(applied_index + 1..=self.commit_index)
    }

    /// Splices a set of entries into the log and flushes it to disk. The
    /// entries must have contiguous indexes and equal/increasing terms, and the
    /// first entry must connect to the existing log (or snapshot). Entries at
    /// or below the snapshot index are skipped, since they're committed.
    /// Overlapping indexes with the same term must be equal and are ignored.
    /// Overlapping indexes with different terms truncate the existing log at
    /// the first conflict and then splice the new entries.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(self.last_index); // empty input is noop
        };

        // Check that the entries are well-formed.
        if first.index == 0 || first.term == 0 {
            panic!("spliced entry has index or term 0");
        }
        if !entries.windows(2).all(|w| w[0].index + 1 == w[1].index) {
            panic!("spliced entries are not contiguous");
        }
        if !entries.windows(2).all(|w| w[0].term <= w[1].term) {
            panic!("spliced entries have term regression");
        }
        assert!(last.term <= self.term, "splice term {} beyond current {}", last.term, self.term);

        // Skip compacted entries.
        let last = last.clone();
        let skip = self.snapshot_index.saturating_sub(first.index - 1) as usize;
        let mut entries = entries.get(skip..).unwrap_or_default();
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Check that the entries connect to the existing log, and that the
        // term doesn't regress.
        match self.term_at(first.index - 1)? {
            Some(base) if first.term < base => {
                panic!("splice term regression {} → {}", base, first.term)
            }
            Some(_) => {}
            None => panic!("first index {} must touch existing log", first.index),
        }

        // Skip entries that are already in the log.
        let mut scan = self.scan(first.index..=last.index);
        while let Some(entry) = scan.next().transpose()? {
            // [0] is ok, because the scan has the same size as entries.
            assert!(entry.index == entries[0].index, "index mismatch at {entry:?}");
            if entry.term != entries[0].term {
                break;
            }
            assert!(entry.payload == entries[0].payload, "payload mismatch at {entry:?}");
            entries = &entries[1..];
        }
        drop(scan);

        // If all entries already exist then we're done.
        let Some(first) = entries.first() else {
            return Ok(self.last_index);
        };

        // Write the entries that weren't already in the log, and remove the
        // tail of the old log if any. We can't write below the commit index,
        // since these entries must be immutable.
        assert!(first.index > self.commit_index, "spliced entries below commit index");
        if first.index <= self.last_index {
            debug!("Truncating log entries {}..={}", first.index, self.last_index);
        }

        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode(), entry.encode())?;
        }
        for index in last.index + 1..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        self.engine.flush()?;

        let first_index = first.index;
        self.changes.retain(|(index, _)| *index < first_index);
        for entry in entries {
            if let Payload::Configuration(configuration) = &entry.payload {
                self.changes.push((entry.index, configuration.clone()));
            }
        }
        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    /// Compacts the log up to and including the given committed index,
    /// replacing the prefix with a snapshot of the state machine at that index.
    pub fn compact(&mut self, index: Index, data: Vec<u8>) -> Result<()> {
        assert!(index <= self.commit_index, "can't compact uncommitted index {index}");
        assert!(index > self.snapshot_index, "compaction index {index} already compacted");
        let Some(term) = self.term_at(index)? else {
            panic!("compaction index {index} does not exist");
        };
        let configuration = self.configuration_at(index).clone();
        let snapshot = Snapshot { index, term, configuration, data };
        debug!("Compacting log through {index}@{term}");
        self.write_snapshot(snapshot, index)
    }

    /// Installs a snapshot received from the leader. If the log contains the
    /// snapshot's last entry, the following entries are retained. Otherwise,
    /// the entire log is discarded. The snapshot must be beyond the commit
    /// index; the caller restores the state machine from it.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        assert!(snapshot.index > self.commit_index, "snapshot at or below commit index");
        assert!(snapshot.term <= self.term, "snapshot term beyond current term");
        let (index, term) = (snapshot.index, snapshot.term);
        let retain = self.has(index, term)?;
        let truncate = if retain { index } else { self.last_index };
        self.write_snapshot(snapshot, truncate)?;
        if !retain {
            self.last_index = index;
            self.last_term = term;
        }
        self.engine.set(&Key::CommitIndex.encode(), bincode::serialize(&(index, term)))?;
        self.commit_index = index;
        self.commit_term = term;
        Ok(())
    }

    /// Stores a snapshot and its configuration, and deletes entries up to and
    /// including truncate. The snapshot's configuration becomes the base
    /// configuration, unless the current base is newer (e.g. pushed by the
    /// leader via Message::Configure).
    fn write_snapshot(&mut self, snapshot: Snapshot, truncate: Index) -> Result<()> {
        for index in self.snapshot_index + 1..=truncate {
            self.engine.delete(&Key::Entry(index).encode())?;
        }
        let update_base = snapshot.configuration.version >= self.configuration.version;
        if update_base {
            self.engine.set(&Key::Configuration.encode(), snapshot.configuration.encode())?;
        }
        self.engine.set(&Key::Snapshot.encode(), snapshot.encode())?;
        self.engine.flush()?;
        self.changes.retain(|(index, _)| *index > truncate);
        self.snapshot_index = snapshot.index;
        self.snapshot_term = snapshot.term;
        if update_base {
            self.configuration = snapshot.configuration;
        }
        Ok(())
    }

    /// Returns the latest snapshot, if any.
    pub fn get_snapshot(&mut self) -> Result<Option<Snapshot>> {
        self.engine.get(&Key::Snapshot.encode())?.map(|v| Snapshot::decode(&v)).transpose()
    }

    /// Returns the active configuration: the latest one committed to the log,
    /// or the base configuration if it is newer.
    pub fn configuration(&self) -> &Configuration {
        self.configuration_at(self.commit_index)
    }

    /// Returns the configuration in effect as of the given index.
    fn configuration_at(&self, index: Index) -> &Configuration {
        match self.changes.iter().rev().find(|(i, _)| *i <= index) {
            Some((_, c)) if c.version > self.configuration.version => c,
            _ => &self.configuration,
        }
    }

    /// Returns the pending configuration, i.e. one that has been appended to
    /// the log but is not yet committed, if any.
    pub fn pending_configuration(&self) -> Option<&Configuration> {
        let active = self.configuration().version;
        self.changes
            .iter()
            .rev()
            .find(|(index, c)| *index > self.commit_index && c.version > active)
            .map(|(_, c)| c)
    }

    /// Returns the index of the first configuration entry after the given
    /// index, if any.
    pub fn next_configuration_index(&self, index: Index) -> Option<Index> {
        self.changes.iter().map(|(i, _)| *i).find(|i| *i > index)
    }

    /// Returns the latest known configuration, pending or active. This
    /// determines which nodes the leader replicates to.
    pub fn latest_configuration(&self) -> &Configuration {
        self.pending_configuration().unwrap_or_else(|| self.configuration())
    }

    /// Installs a base configuration, e.g. one pushed by the leader via
    /// Message::Configure. Only newer versions are installed. Returns true if
    /// the configuration was installed.
    pub fn set_configuration(&mut self, configuration: Configuration) -> Result<bool> {
        if configuration.version <= self.configuration().version {
            return Ok(false);
        }
        self.engine.set(&Key::Configuration.encode(), configuration.encode())?;
        self.engine.flush()?;
        self.configuration = configuration;
        Ok(true)
    }

    /// Returns log engine status.
    pub fn status(&mut self) -> Result<storage::Status> {
        self.engine.status()
    }
}

/// A log entry iterator.
pub struct Iterator<'a> {
    inner: Box<dyn storage::ScanIterator + 'a>,
}

impl<'a> Iterator<'a> {
    fn new(inner: Box<dyn storage::ScanIterator + 'a>) -> Self {
        Self { inner }
    }
}

impl<'a> std::iter::Iterator for Iterator<'a> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.and_then(|(_, v)| Entry::decode(&v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{Member, MemberRole};
    use crate::storage::engine::test::{Recording, Write};
    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;

    /// Creates a log over a Recording engine, returning its write receiver.
    fn setup() -> (Log, Receiver<Write>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        let log = Log::new(Box::new(Recording::new(storage::Memory::new(), tx))).expect("log failed");
        (log, rx)
    }

    fn entry(index: Index, term: Term, command: &[u8]) -> Entry {
        Entry { index, term, payload: Payload::Command(command.to_vec()) }
    }

    fn config(version: u64, voters: &[NodeID]) -> Configuration {
        Configuration::new(version, voters.iter().copied().map(Member::voter).collect())
    }

    fn scan(log: &mut Log) -> Vec<Entry> {
        log.scan(..).collect::<Result<Vec<_>>>().expect("scan failed")
    }

    /// Reloads the log from its engine, as after a restart.
    fn reload(log: Log) -> Log {
        Log::new(log.engine).expect("reload failed")
    }

    #[test]
    fn key_encoding_preserves_order() -> Result<()> {
        assert!(Key::Entry(1).encode() < Key::Entry(256).encode());
        assert!(Key::Entry(Index::MAX).encode() < Key::TermVote.encode());
        for key in [Key::Entry(7), Key::TermVote, Key::CommitIndex, Key::Configuration, Key::Snapshot]
        {
            assert_eq!(Key::decode(&key.encode())?, key);
        }
        assert!(Key::decode(&[0x00, 0x01]).is_err());
        Ok(())
    }

    #[test]
    fn set_term_flushes() -> Result<()> {
        let (mut log, rx) = setup();
        log.set_term(2, Some(3))?;
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![
                Write::Set {
                    key: Key::TermVote.encode(),
                    value: bincode::serialize(&(2 as Term, Some(3 as NodeID)))
                },
                Write::Flush,
            ]
        );
        // Setting the same term and vote again is a noop.
        log.set_term(2, Some(3))?;
        assert_eq!(rx.try_iter().count(), 0);

        let log = reload(log);
        assert_eq!(log.get_term(), (2, Some(3)));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "can't change vote")]
    fn set_term_vote_change_panics() {
        let (mut log, _rx) = setup();
        log.set_term(2, Some(3)).unwrap();
        log.set_term(2, Some(1)).unwrap();
    }

    #[test]
    fn append_commit_get() -> Result<()> {
        let (mut log, rx) = setup();
        log.set_term(1, None)?;
        assert_eq!(log.append(Payload::Noop)?, 1);
        assert_eq!(log.append(Payload::Command(vec![0x01]))?, 2);
        log.set_term(2, None)?;
        assert_eq!(log.append(Payload::Command(vec![0x02]))?, 3);
        assert!(rx.try_iter().any(|op| op == Write::Flush));

        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.get(2)?, Some(entry(2, 1, &[0x01])));
        assert_eq!(log.get(4)?, None);
        assert!(log.has(0, 0)?);
        assert!(log.has(2, 1)?);
        assert!(!log.has(2, 2)?);
        assert!(!log.has(4, 2)?);

        assert_eq!(log.commit(2)?, 2);
        assert_eq!(log.get_commit_index(), (2, 1));
        assert_eq!(log.scan_apply(0).collect::<Result<Vec<_>>>()?.len(), 2);
        assert_eq!(log.scan_apply(2).count(), 0);

        let mut log = reload(log);
        assert_eq!(log.get_last_index(), (3, 2));
        assert_eq!(log.get_commit_index(), (2, 1));
        assert_eq!(scan(&mut log).len(), 3);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "commit index regression")]
    fn commit_regression_panics() {
        let (mut log, _rx) = setup();
        log.set_term(1, None).unwrap();
        log.append(Payload::Noop).unwrap();
        log.append(Payload::Noop).unwrap();
        log.commit(2).unwrap();
        log.commit(1).unwrap();
    }

    #[test]
    fn splice_truncates_conflicts() -> Result<()> {
        let (mut log, _rx) = setup();
        log.set_term(1, None)?;
        for command in [b"a", b"b", b"c", b"d"] {
            log.append(Payload::Command(command.to_vec()))?;
        }
        log.commit(2)?;

        // Existing entries are skipped.
        log.set_term(3, None)?;
        assert_eq!(log.splice(vec![entry(2, 1, b"b"), entry(3, 1, b"c")])?, 4);
        assert_eq!(scan(&mut log).len(), 4);

        // A conflict at 3 replaces the tail.
        assert_eq!(log.splice(vec![entry(3, 3, b"x")])?, 3);
        assert_eq!(
            scan(&mut log),
            vec![entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 3, b"x")]
        );
        assert_eq!(log.get_last_index(), (3, 3));

        let mut log = reload(log);
        assert_eq!(log.get_last_index(), (3, 3));
        assert_eq!(log.get(4)?, None);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "spliced entries below commit index")]
    fn splice_below_commit_panics() {
        let (mut log, _rx) = setup();
        log.set_term(1, None).unwrap();
        log.append(Payload::Noop).unwrap();
        log.commit(1).unwrap();
        log.set_term(2, None).unwrap();
        log.splice(vec![entry(1, 2, b"x")]).unwrap();
    }

    #[test]
    fn configuration_tracking() -> Result<()> {
        let (mut log, _rx) = setup();
        log.bootstrap(config(1, &[1, 2, 3]))?;
        log.set_term(1, None)?;
        assert_eq!(log.configuration(), &config(1, &[1, 2, 3]));
        assert_eq!(log.pending_configuration(), None);

        // A configuration entry is pending until committed.
        log.append(Payload::Noop)?;
        log.append(Payload::Configuration(config(2, &[1, 2])))?;
        assert_eq!(log.configuration().version, 1);
        assert_eq!(log.pending_configuration(), Some(&config(2, &[1, 2])));
        assert_eq!(log.latest_configuration().version, 2);

        // Truncation rolls back the pending configuration.
        log.set_term(2, None)?;
        log.splice(vec![entry(2, 2, b"x")])?;
        assert_eq!(log.pending_configuration(), None);

        // A committed configuration becomes active, also after a restart.
        log.append(Payload::Configuration(config(2, &[1, 2, 3, 4])))?;
        log.commit(3)?;
        assert_eq!(log.configuration(), &config(2, &[1, 2, 3, 4]));
        let mut log = reload(log);
        assert_eq!(log.configuration(), &config(2, &[1, 2, 3, 4]));

        // Bootstrapping an existing log does nothing.
        log.bootstrap(config(1, &[7]))?;
        assert_eq!(log.configuration().version, 2);

        // Only newer base configurations are installed.
        assert!(!log.set_configuration(config(2, &[9]))?);
        assert!(log.set_configuration(config(3, &[1, 2, 3]))?);
        assert_eq!(log.configuration(), &config(3, &[1, 2, 3]));
        Ok(())
    }

    #[test]
    fn compact() -> Result<()> {
        let (mut log, _rx) = setup();
        log.bootstrap(config(1, &[1]))?;
        log.set_term(1, None)?;
        log.append(Payload::Noop)?;
        log.append(Payload::Configuration(Configuration::new(
            2,
            vec![Member::voter(1), Member { id: 2, role: MemberRole::Learner }],
        )))?;
        log.append(Payload::Command(b"a".to_vec()))?;
        log.append(Payload::Command(b"b".to_vec()))?;
        log.commit(3)?;

        log.compact(3, b"state".to_vec())?;
        assert_eq!(log.get_snapshot_index(), (3, 1));
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.term_at(3)?, Some(1));
        assert_eq!(log.term_at(2)?, None);
        assert!(log.has(2, 1)?);
        assert!(log.has(3, 1)?);
        assert_eq!(scan(&mut log), vec![entry(4, 1, b"b")]);
        assert_eq!(log.configuration().version, 2);

        let mut log = reload(log);
        assert_eq!(log.get_snapshot_index(), (3, 1));
        assert_eq!(log.get_last_index(), (4, 1));
        assert_eq!(log.configuration().version, 2);
        let snapshot = log.get_snapshot()?.expect("no snapshot");
        assert_eq!(snapshot.data, b"state".to_vec());

        // Splicing entries that overlap the snapshot skips compacted entries.
        assert_eq!(log.splice(vec![entry(2, 1, b"?"), entry(3, 1, b"?"), entry(4, 1, b"b")])?, 4);
        Ok(())
    }

    #[test]
    fn install_snapshot_retains_matching_suffix() -> Result<()> {
        let (mut log, _rx) = setup();
        log.set_term(1, None)?;
        for command in [b"a", b"b", b"c"] {
            log.append(Payload::Command(command.to_vec()))?;
        }
        let snapshot =
            Snapshot { index: 2, term: 1, configuration: config(2, &[1, 2]), data: vec![] };
        log.install_snapshot(snapshot)?;
        assert_eq!(log.get_commit_index(), (2, 1));
        assert_eq!(log.get_last_index(), (3, 1));
        assert_eq!(scan(&mut log), vec![entry(3, 1, b"c")]);
        assert_eq!(log.configuration(), &config(2, &[1, 2]));
        Ok(())
    }

    #[test]
    fn install_snapshot_discards_conflicting_log() -> Result<()> {
        let (mut log, _rx) = setup();
        log.set_term(1, None)?;
        log.append(Payload::Command(b"a".to_vec()))?;
        log.append(Payload::Command(b"b".to_vec()))?;
        log.set_term(3, None)?;
        let snapshot =
            Snapshot { index: 5, term: 3, configuration: config(2, &[1, 2]), data: vec![] };
        log.install_snapshot(snapshot)?;
        assert_eq!(log.get_last_index(), (5, 3));
        assert_eq!(log.get_commit_index(), (5, 3));
        assert!(scan(&mut log).is_empty());

        let mut log = reload(log);
        assert_eq!(log.get_last_index(), (5, 3));
        log.append(Payload::Noop)?;
        assert_eq!(log.get_last_index(), (6, 3));
        Ok(())
    }

    #[test]
    fn install_snapshot_keeps_newer_configuration() -> Result<()> {
        let (mut log, _rx) = setup();
        log.set_term(2, None)?;
        assert!(log.set_configuration(config(3, &[1, 2, 3]))?);
        let snapshot =
            Snapshot { index: 4, term: 2, configuration: config(2, &[1, 2]), data: vec![] };
        log.install_snapshot(snapshot)?;
        assert_eq!(log.configuration(), &config(3, &[1, 2, 3]));
        assert_eq!(log.get_snapshot()?.map(|s| s.configuration), Some(config(2, &[1, 2])));

        let log = reload(log);
        assert_eq!(log.configuration(), &config(3, &[1, 2, 3]));
        Ok(())
    }
}
