use std::sync::{Arc, RwLock};

use crate::errors::*;
use crate::protos::*;


/// Read/append access to the replicated log of a single server
///
/// Every log implicitly begins with a sentinel at index 0 carrying term 0, so
/// `term(0)` is always `Some(0)` and `last_index()` is 0 for an empty log.
/// Indices are contiguous and terms are non-decreasing along the log.
///
/// Appends are accepted in memory and must never block; durability is tracked
/// separately: `match_index()` reports the highest index known to be on disk
/// and only advances when `flush()` completes. A future log-compaction
/// extension would add a base offset behind this trait without changing any
/// caller.
pub trait LogStorage {

	/// Index of the last entry in the log (0 if the log is empty)
	fn last_index(&self) -> LogIndex;

	/// Term of the entry at the given index, or None if the log has no entry
	/// there. The sentinel guarantees `term(0) == Some(0)`
	fn term(&self, index: LogIndex) -> Option<Term>;

	fn entry(&self, index: LogIndex) -> Option<Arc<LogEntry>>;

	/// Appends one entry. The caller guarantees `entry.index` is exactly
	/// `last_index() + 1` and `entry.term` is not below the last entry's term
	fn append(&self, entry: LogEntry);

	/// Removes the entry at `start_index` and everything after it
	/// Must never be called at or below the commit index
	fn truncate_suffix(&self, start_index: LogIndex);

	/// Highest index that is durable (0 if nothing is)
	fn match_index(&self) -> LogIndex;

	/// Makes all appended/truncated state durable
	/// After an Ok return, `match_index() == last_index()`
	fn flush(&self) -> Result<()>;

	/// Position of the last entry (the sentinel position for an empty log)
	fn last_position(&self) -> LogPosition {
		let index = self.last_index();
		LogPosition { term: self.term(index).unwrap_or(0), index }
	}
}


/// In-memory log with no durability: everything is trivially 'on disk' the
/// moment it is appended. Used by tests and the in-process demo cluster
pub struct MemoryLog {
	entries: RwLock<Vec<Arc<LogEntry>>>
}

impl MemoryLog {
	pub fn new() -> Self {
		MemoryLog { entries: RwLock::new(vec![]) }
	}
}

impl LogStorage for MemoryLog {

	fn last_index(&self) -> LogIndex {
		self.entries.read().unwrap().len() as LogIndex
	}

	fn term(&self, index: LogIndex) -> Option<Term> {
		if index == 0 {
			return Some(0);
		}

		self.entries.read().unwrap()
			.get((index - 1) as usize)
			.map(|e| e.term)
	}

	fn entry(&self, index: LogIndex) -> Option<Arc<LogEntry>> {
		if index == 0 {
			return None;
		}

		self.entries.read().unwrap()
			.get((index - 1) as usize)
			.cloned()
	}

	fn append(&self, entry: LogEntry) {
		let mut entries = self.entries.write().unwrap();
		assert_eq!(entry.index, entries.len() as LogIndex + 1);
		entries.push(Arc::new(entry));
	}

	fn truncate_suffix(&self, start_index: LogIndex) {
		assert!(start_index >= 1);
		let mut entries = self.entries.write().unwrap();
		entries.truncate((start_index - 1) as usize);
	}

	fn match_index(&self) -> LogIndex {
		self.last_index()
	}

	fn flush(&self) -> Result<()> {
		Ok(())
	}
}
