//! In-memory write-ahead log.
//!
//! Entries are addressed by log index.  Index 0 is a sentinel that is never
//! applied.  Writing past the end grows the log and leaves any skipped
//! slots empty, which the commit walk reports as holes.

use super::message::Entry;
use crate::errors::{ClusterError, ClusterResult};

#[derive(Debug, Clone)]
pub struct WriteAheadLog {
    entries: Vec<Entry>,
}

impl Default for WriteAheadLog {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteAheadLog {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry::default()],
        }
    }

    /// Whether `index` names a slot this log can hold.
    pub fn addressable(index: u64) -> bool {
        slot_len(index).is_some()
    }

    /// Store `entry` at `index`, growing the log as needed.
    ///
    /// Writes to the sentinel slot are ignored.
    pub fn write_at(&mut self, index: u64, entry: Entry) -> ClusterResult<()> {
        if index == 0 {
            return Ok(());
        }
        let len = slot_len(index)
            .ok_or_else(|| ClusterError::invalid(format!("log index {index} out of range")))?;
        if len > self.entries.len() {
            self.entries.resize_with(len, Entry::default);
        }
        self.entries[len - 1] = entry;
        Ok(())
    }

    /// The filled entry at `index`, if any.
    pub fn get(&self, index: u64) -> Option<&Entry> {
        if index == 0 {
            return None;
        }
        self.entries
            .get(index as usize)
            .filter(|entry| entry.is_filled())
    }

    /// Highest index with a slot (filled or not).
    pub fn last_index(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    /// Filled entries with their indices, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Entry)> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, entry)| entry.is_filled())
            .map(|(idx, entry)| (idx as u64, entry))
    }
}

/// Vec length needed to hold `index`.
fn slot_len(index: u64) -> Option<usize> {
    usize::try_from(index).ok()?.checked_add(1)
}
