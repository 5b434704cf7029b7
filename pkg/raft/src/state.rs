use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::protos::*;


/// Current role of the server along with all bookkeeping that only exists in
/// that role. In particular the per-peer replication progress has no
/// representation outside of leadership
pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState)
}

pub struct ServerFollowerState {
	/// Randomized duration after which, absent any heartbeat, we will start an
	/// election
	pub election_timeout: Duration,

	/// Last server we have seen acting as a valid leader (used as a hint for
	/// redirecting proposals)
	pub last_leader_id: Option<ServerId>,

	/// Time of the last event that restarted the election timer
	pub last_heartbeat: Instant
}

pub struct ServerCandidateState {
	/// Time at which this election began
	pub election_start: Instant,

	/// Randomized duration after which this election is abandoned and a new
	/// one is started in the next term
	pub election_timeout: Duration,

	/// Peers that have granted us their vote in the current term
	/// Our own vote is not stored here
	pub votes_received: HashSet<ServerId>
}

pub struct ServerLeaderState {
	/// Replication progress per peer (everyone in the cluster except us)
	pub servers: HashMap<ServerId, ServerProgress>
}

/// What the leader knows about a single peer's log
pub struct ServerProgress {
	/// Index of the next entry to send to this peer
	pub next_index: LogIndex,

	/// Highest index known to be replicated on this peer
	pub match_index: LogIndex,

	/// Whether a request to this peer is currently in flight. At most one
	/// request per peer is outstanding at a time
	pub request_pending: bool,

	/// When we last sent this peer anything (heartbeats included)
	pub last_sent: Option<Instant>
}

impl ServerProgress {
	/// State for a freshly elected leader with the given last log index
	pub fn new(last_log_index: LogIndex) -> Self {
		ServerProgress {
			next_index: last_log_index + 1,
			match_index: 0,
			request_pending: false,
			last_sent: None
		}
	}
}
