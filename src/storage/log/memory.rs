use crate::error::{Error, Result};
use crate::storage::log::{Scan, Store};

/// A volatile store, used for tests and single-process clusters. Nothing
/// survives a restart; a crashed peer rejoins with an empty log and relies
/// on the leader replaying entries to it.
pub struct Memory {
    entries: Vec<Vec<u8>>,
    committed: u64,
    term: Option<Vec<u8>>,
}

impl Memory {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            committed: 0,
            term: None,
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for Memory {
    fn append(&mut self, entry: Vec<u8>) -> Result<u64> {
        self.entries.push(entry);
        Ok(self.entries.len() as u64)
    }

    fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
        if index == 0 {
            return Ok(None);
        }
        Ok(self.entries.get(index as usize - 1).cloned())
    }

    fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    fn scan_from(&self, index: u64) -> Scan {
        let start = std::cmp::min(index.saturating_sub(1) as usize, self.entries.len());
        Box::new(self.entries[start..].iter().cloned().map(Ok))
    }

    fn truncate(&mut self, index: u64) -> Result<u64> {
        if index < self.committed {
            return Err(Error::Internal(format!(
                "Cannot truncate entries committed through {}",
                self.committed
            )));
        }
        self.entries.truncate(index as usize);
        Ok(self.entries.len() as u64)
    }

    fn commit(&mut self, index: u64) -> Result<()> {
        if index < self.committed || index > self.len() {
            return Err(Error::Internal(format!(
                "Commit index {} outside {}..={}",
                index,
                self.committed,
                self.len()
            )));
        }
        self.committed = index;
        Ok(())
    }

    fn committed(&self) -> u64 {
        self.committed
    }

    fn set_term(&mut self, record: Vec<u8>) -> Result<()> {
        self.term = Some(record);
        Ok(())
    }

    fn term(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.term.clone())
    }
}
