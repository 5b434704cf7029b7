use crate::log::LogStorage;
use crate::protos::*;


/// Wrapper around a RequestVote response whose inner value is only
/// extractable by acknowledging that the current metadata has been made
/// durable. A vote granted in term T must be on disk before the reply leaves
/// this process
pub struct MustPersistMetadata<T> {
	inner: T
}

impl<T> MustPersistMetadata<T> {
	pub fn new(inner: T) -> Self {
		MustPersistMetadata { inner }
	}

	/// Consumes the wrapper. The caller asserts that the metadata store has
	/// flushed since the operation that produced this value
	pub fn persisted(self) -> T {
		self.inner
	}
}


/// Wrapper around an AppendEntries response that may only be released once
/// the log is durable up to the position it acknowledges
pub struct MatchConstraint<T> {
	inner: T,
	pos: Option<LogPosition>
}

impl<T> MatchConstraint<T> {
	pub fn new(inner: T, pos: LogPosition) -> Self {
		MatchConstraint { inner, pos: Some(pos) }
	}

	/// Releases the inner value if the log's durable point covers the
	/// acknowledged position, otherwise hands the constraint back so that the
	/// caller can flush and retry
	pub fn poll(self, log: &dyn LogStorage) -> std::result::Result<T, MatchConstraint<T>> {
		match self.pos {
			None => Ok(self.inner),
			Some(pos) => {
				if log.match_index() >= pos.index {
					Ok(self.inner)
				} else {
					Err(self)
				}
			}
		}
	}
}

impl<T> From<T> for MatchConstraint<T> {
	/// A response with no durability requirement (rejections)
	fn from(inner: T) -> Self {
		MatchConstraint { inner, pos: None }
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use crate::log::MemoryLog;

	#[test]
	fn match_constraint_released_only_when_durable() {
		let log = MemoryLog::new();
		log.append(LogEntry { term: 1, index: 1, data: LogEntryData::Noop });

		let c = MatchConstraint::new("resp", LogPosition { term: 1, index: 2 });
		let c = match c.poll(&log) {
			Ok(_) => panic!("released before the log contained index 2"),
			Err(c) => c
		};

		log.append(LogEntry { term: 1, index: 2, data: LogEntryData::Noop });
		assert_eq!(c.poll(&log).ok(), Some("resp"));
	}

	#[test]
	fn unconstrained_response_released_immediately() {
		let log = MemoryLog::new();
		let c: MatchConstraint<&str> = "resp".into();
		assert_eq!(c.poll(&log).ok(), Some("resp"));
	}
}
