use bytes::Bytes;


/// Type used to uniquely identify each server. Ids are assigned in the boot
/// configuration, start at 1, and never change for the lifetime of the cluster
pub type ServerId = u64;

/// Monotonic logical clock partitioning time into epochs with at most one
/// leader each. Starts at 0 on a fresh server
pub type Term = u64;

/// Position of an entry in the log. The first real entry is at index 1; index
/// 0 names the sentinel that every log implicitly starts with
pub type LogIndex = u64;


/// Persistent information describing the state of the current server
/// Must be durable before any vote or term bump is exposed to other servers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
	/// Latest term seen by this server (starts at 0)
	pub current_term: Term,

	/// The id of the server that we have voted for in the current term
	pub voted_for: Option<ServerId>
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata {
			current_term: 0,
			voted_for: None
		}
	}
}


/// A (term, index) pair naming a single slot in some log
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
	pub term: Term,
	pub index: LogIndex
}


#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogEntryData {
	/// Does nothing but occupies a single log index. A new leader proposes one
	/// of these to pull entries from earlier terms over the commit line
	Noop,

	/// Opaque data to be executed on the application state machine
	Command(Bytes)
}

/// A single slot of the replicated log
/// Immutable once committed; an uncommitted entry may only be replaced by a
/// leader's conflicting AppendEntries at the same index
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,
	pub data: LogEntryData
}

impl LogEntry {
	pub fn pos(&self) -> LogPosition {
		LogPosition { term: self.term, index: self.index }
	}
}


#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,

	/// Entries immediately following (prev_log_term, prev_log_index), in
	/// ascending contiguous index order
	pub entries: Vec<LogEntry>,

	pub leader_commit: LogIndex
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: ServerId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool
}


pub enum MessageBody {
	RequestVote(RequestVoteRequest),

	/// The index is the last log index covered by the request (prev_log_index
	/// plus the number of entries), retained so that the response callback
	/// knows what was acknowledged without holding on to the request
	AppendEntries(AppendEntriesRequest, LogIndex)
}

/// An outbound request produced by the consensus module, to be delivered by
/// the transport to every server listed in `to`
pub struct Message {
	pub to: Vec<ServerId>,
	pub body: MessageBody
}
