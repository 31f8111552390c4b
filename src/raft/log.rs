use crate::error::{Error, Result};
use crate::raft::message::NodeId;
use crate::raft::state::State;
use crate::storage::log;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

/// The client a committed entry replies to
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Caller {
    /// The requesting client's address
    pub origin: NodeId,
    /// The client's request id
    pub cid: u64,
}

/// A replicated log entry. The index is positional and not stored in the
/// entry itself; batches on the wire are anchored by prev_log_index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was proposed
    pub term: u64,
    /// The state machine command
    pub command: Vec<u8>,
    /// The client to reply to on commit, set by the proposing leader
    pub caller: Option<Caller>,
}

/// A log scan
pub type Scan<'a> = Box<dyn Iterator<Item = Result<Entry>> + 'a>;

/// The replicated Raft log
pub struct Log {
    /// The underlying log store
    store: Box<dyn log::Store>,
    /// The index of the last stored entry
    pub last_index: u64,
    /// The term of the last stored entry
    pub last_term: u64,
    /// The last entry known to be committed
    pub commit_index: u64,
    /// The term of the last committed entry
    pub commit_term: u64,
    /// The last entry handed to the state machine
    pub apply_index: u64,
}

impl Log {
    /// Creates a new log, using a log::Store for storage
    pub fn new(store: Box<dyn log::Store>) -> Result<Self> {
        let (commit_index, commit_term) = match store.committed() {
            0 => (0, 0),
            index => store
                .get(index)?
                .map(|v| Self::deserialize::<Entry>(&v))
                .transpose()?
                .map(|e| (index, e.term))
                .ok_or_else(|| Error::Internal("Committed entry not found".into()))?,
        };
        let (last_index, last_term) = match store.len() {
            0 => (0, 0),
            index => store
                .get(index)?
                .map(|v| Self::deserialize::<Entry>(&v))
                .transpose()?
                .map(|e| (index, e.term))
                .ok_or_else(|| Error::Internal("Last entry not found".into()))?,
        };
        Ok(Self {
            store,
            last_index,
            last_term,
            commit_index,
            commit_term,
            apply_index: 0,
        })
    }

    /// Appends an entry to the log, returning its index
    pub fn append(&mut self, entry: Entry) -> Result<u64> {
        debug!("Appending log entry {}: {:?}", self.last_index + 1, entry);
        let term = entry.term;
        let index = self.store.append(Self::serialize(&entry)?)?;
        self.last_index = index;
        self.last_term = term;
        Ok(index)
    }

    /// Commits entries up to and including an index, saturating at the last
    /// index. The commit index never moves backwards.
    pub fn commit(&mut self, index: u64) -> Result<u64> {
        let index = std::cmp::min(index, self.last_index);
        if index <= self.commit_index {
            return Ok(self.commit_index);
        }
        let entry = self
            .get(index)?
            .ok_or_else(|| Error::Internal(format!("Entry {} not found", index)))?;
        self.store.commit(index)?;
        self.commit_index = index;
        self.commit_term = entry.term;
        Ok(index)
    }

    /// Applies the next committed entry to the state machine, returning the
    /// entry's caller and the state machine result, or None when there is
    /// nothing left to apply.
    #[allow(clippy::type_complexity)]
    pub fn apply(&mut self, state: &mut dyn State) -> Result<Option<(Option<Caller>, Result<Vec<u8>>)>> {
        if self.apply_index >= self.commit_index {
            return Ok(None);
        }
        let index = self.apply_index + 1;
        let entry = self
            .get(index)?
            .ok_or_else(|| Error::Internal(format!("Committed entry {} not found", index)))?;
        debug!("Applying log entry {}: {:?}", index, entry);
        let result = match state.apply(index, entry.command) {
            Err(err @ Error::Internal(_)) => return Err(err),
            result => result,
        };
        self.apply_index = index;
        Ok(Some((entry.caller, result)))
    }

    /// Fetches an entry at an index
    pub fn get(&self, index: u64) -> Result<Option<Entry>> {
        self.store.get(index)?.map(|v| Self::deserialize(&v)).transpose()
    }

    /// Checks if the log contains an entry with the given index and term.
    /// The empty prefix (0, 0) always matches.
    pub fn has(&self, index: u64, term: u64) -> Result<bool> {
        match self.get(index)? {
            Some(entry) => Ok(entry.term == term),
            None if index == 0 && term == 0 => Ok(true),
            None => Ok(false),
        }
    }

    /// Returns the log suffix starting at the given index, e.g. the tail a
    /// leader replicates to a peer
    pub fn tail(&self, from: u64) -> Scan {
        Box::new(
            self.store
                .scan_from(from)
                .map(|r| r.and_then(|v| Self::deserialize(&v))),
        )
    }

    /// Splices a batch of entries into the log immediately after prev_index.
    /// Entries already present with a matching term are kept (replays are
    /// idempotent); an entry conflicting with the batch (same index,
    /// different term) has itself and all following entries truncated away
    /// before the batch entry is appended.
    pub fn splice(&mut self, prev_index: u64, entries: Vec<Entry>) -> Result<u64> {
        if prev_index > self.last_index {
            return Err(Error::Internal(
                "Spliced entries cannot begin past last index".into(),
            ));
        }
        for (i, entry) in entries.into_iter().enumerate() {
            let index = prev_index + 1 + i as u64;
            if let Some(ref current) = self.get(index)? {
                if current.term == entry.term {
                    continue;
                }
                self.truncate(index - 1)?;
            }
            self.append(entry)?;
        }
        Ok(self.last_index)
    }

    /// Truncates the log such that its last entry is at most index.
    /// Refuses to remove committed entries.
    pub fn truncate(&mut self, index: u64) -> Result<u64> {
        debug!("Truncating log after entry {}", index);
        let (index, term) = match self.store.truncate(index)? {
            0 => (0, 0),
            i => self
                .store
                .get(i)?
                .map(|v| Self::deserialize::<Entry>(&v))
                .transpose()?
                .map(|e| (i, e.term))
                .ok_or_else(|| Error::Internal(format!("Entry {} not found", index)))?,
        };
        self.last_index = index;
        self.last_term = term;
        Ok(index)
    }

    /// Loads the most recent term known by the log, with the candidate
    /// voted for in that term (if any)
    pub fn load_term(&self) -> Result<(u64, Option<NodeId>)> {
        let (term, voted_for) = self
            .store
            .term()?
            .map(|v| Self::deserialize(&v))
            .transpose()?
            .unwrap_or((0, None));
        debug!("Loaded term {} and voted for {:?} from log", term, voted_for);
        Ok((term, voted_for))
    }

    /// Saves the current term and vote. This must be durable before any
    /// reply for the term goes out.
    pub fn save_term(&mut self, term: u64, voted_for: Option<&str>) -> Result<()> {
        self.store.set_term(Self::serialize(&(term, voted_for))?)
    }

    fn serialize<V: serde::Serialize>(value: &V) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<'a, V: serde::Deserialize<'a>>(bytes: &'a [u8]) -> Result<V> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::log::Memory;

    fn entry(term: u64, command: &[u8]) -> Entry {
        Entry {
            term,
            command: command.to_vec(),
            caller: None,
        }
    }

    fn setup() -> Result<Log> {
        let mut log = Log::new(Box::new(Memory::new()))?;
        log.append(entry(1, b"a"))?;
        log.append(entry(1, b"b"))?;
        log.append(entry(2, b"c"))?;
        Ok(log)
    }

    struct TestState {
        applied: Vec<(u64, Vec<u8>)>,
    }

    impl State for TestState {
        fn applied_index(&self) -> u64 {
            self.applied.last().map(|(i, _)| *i).unwrap_or(0)
        }

        fn apply(&mut self, index: u64, command: Vec<u8>) -> Result<Vec<u8>> {
            self.applied.push((index, command.clone()));
            Ok(command)
        }
    }

    #[test]
    fn empty() -> Result<()> {
        let log = Log::new(Box::new(Memory::new()))?;
        assert_eq!(log.last_index, 0);
        assert_eq!(log.last_term, 0);
        assert_eq!(log.commit_index, 0);
        assert!(log.has(0, 0)?);
        assert!(!log.has(1, 1)?);
        assert_eq!(log.get(0)?, None);
        Ok(())
    }

    #[test]
    fn append_has() -> Result<()> {
        let log = setup()?;
        assert_eq!(log.last_index, 3);
        assert_eq!(log.last_term, 2);
        assert!(log.has(1, 1)?);
        assert!(log.has(3, 2)?);
        assert!(!log.has(3, 1)?);
        assert!(!log.has(4, 2)?);
        Ok(())
    }

    #[test]
    fn commit_saturates_and_is_monotone() -> Result<()> {
        let mut log = setup()?;
        assert_eq!(log.commit(7)?, 3);
        assert_eq!(log.commit_index, 3);
        assert_eq!(log.commit_term, 2);
        // Lower commit indexes are ignored, not errors
        assert_eq!(log.commit(1)?, 3);
        assert_eq!(log.commit_index, 3);
        Ok(())
    }

    #[test]
    fn splice_appends_missing_suffix() -> Result<()> {
        let mut log = setup()?;
        let last = log.splice(3, vec![entry(2, b"d"), entry(2, b"e")])?;
        assert_eq!(last, 5);
        assert_eq!(log.get(5)?, Some(entry(2, b"e")));
        Ok(())
    }

    #[test]
    fn splice_replay_is_idempotent() -> Result<()> {
        let mut log = setup()?;
        let last = log.splice(1, vec![entry(1, b"b"), entry(2, b"c")])?;
        assert_eq!(last, 3);
        assert_eq!(log.get(2)?, Some(entry(1, b"b")));
        assert_eq!(log.get(3)?, Some(entry(2, b"c")));
        Ok(())
    }

    #[test]
    fn splice_truncates_conflicting_suffix() -> Result<()> {
        let mut log = setup()?;
        let last = log.splice(1, vec![entry(3, b"x")])?;
        assert_eq!(last, 2);
        assert_eq!(log.get(2)?, Some(entry(3, b"x")));
        assert_eq!(log.get(3)?, None);
        assert_eq!(log.last_term, 3);
        Ok(())
    }

    #[test]
    fn splice_past_end_is_rejected() -> Result<()> {
        let mut log = setup()?;
        assert!(log.splice(4, vec![entry(2, b"d")]).is_err());
        Ok(())
    }

    #[test]
    fn truncate_refuses_committed() -> Result<()> {
        let mut log = setup()?;
        log.commit(2)?;
        assert!(log.truncate(1).is_err());
        assert_eq!(log.truncate(2)?, 2);
        assert_eq!(log.last_index, 2);
        assert_eq!(log.last_term, 1);
        Ok(())
    }

    #[test]
    fn apply_tracks_commit() -> Result<()> {
        let mut log = setup()?;
        let mut state = TestState { applied: Vec::new() };
        assert_eq!(log.apply(&mut state)?, None);
        log.commit(2)?;
        assert_eq!(log.apply(&mut state)?, Some((None, Ok(b"a".to_vec()))));
        assert_eq!(log.apply(&mut state)?, Some((None, Ok(b"b".to_vec()))));
        assert_eq!(log.apply(&mut state)?, None);
        assert_eq!(log.apply_index, 2);
        assert_eq!(state.applied, vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
        Ok(())
    }

    #[test]
    fn tail_returns_suffix() -> Result<()> {
        let log = setup()?;
        let tail: Vec<Entry> = log.tail(2).collect::<Result<_>>()?;
        assert_eq!(tail, vec![entry(1, b"b"), entry(2, b"c")]);
        let empty: Vec<Entry> = log.tail(4).collect::<Result<_>>()?;
        assert!(empty.is_empty());
        Ok(())
    }

    #[test]
    fn save_load_term() -> Result<()> {
        let mut log = setup()?;
        assert_eq!(log.load_term()?, (0, None));
        log.save_term(3, Some("b"))?;
        assert_eq!(log.load_term()?, (3, Some("b".into())));
        log.save_term(4, None)?;
        assert_eq!(log.load_term()?, (4, None));
        Ok(())
    }
}
