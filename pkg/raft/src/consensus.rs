use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::constraint::*;
use crate::errors::*;
use crate::log::*;
use crate::protos::*;
use crate::state::*;


/// Identifies an entry a caller proposed so its fate can be queried later
pub type Proposal = LogPosition;

/// On success, the entry has been accepted into the local log and may
/// eventually be committed under the returned position
pub type ProposeResult = std::result::Result<Proposal, ProposeError>;

#[derive(Debug)]
pub enum ProposeError {
	/// The entry can't be proposed by this server because it is not the
	/// current leader
	NotLeader { leader_hint: Option<ServerId> }
}

#[derive(Debug, PartialEq)]
pub enum ProposalStatus {
	/// Safely replicated; it will be applied to the state machine soon
	Committed,

	/// Overwritten by another leader before it could be committed
	Failed,

	/// Still awaiting replication
	Pending,

	/// Nothing known about this proposal on this server (it was likely made
	/// on a different server)
	Missing
}


pub type ConsensusModuleHandle = Arc<Mutex<ConsensusModule>>;


/// Timing and batching knobs, fixed at boot
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
	/// Minimum follower quiet period before an election is started
	pub election_timeout_base: Duration,

	/// Width of the uniform jitter added on top of the base on every timer
	/// (re)start
	pub election_timeout_fluctuate: Duration,

	/// How often a leader contacts an otherwise idle peer. Must be well below
	/// the election base
	pub heartbeat_interval: Duration,

	/// Maximum number of entries carried by a single AppendEntries request
	pub max_entries_per_append: usize
}

impl Default for ConsensusConfig {
	fn default() -> Self {
		ConsensusConfig {
			election_timeout_base: Duration::from_millis(150),
			election_timeout_fluctuate: Duration::from_millis(150),
			heartbeat_interval: Duration::from_millis(50),
			max_entries_per_append: 5
		}
	}
}


/// All external side effects requested by the ConsensusModule during a single
/// operation. The caller is responsible for persisting what is flagged and
/// sending what is enqueued, in that order
pub struct Tick {
	/// Time at which this tick is happening. Injected by the caller so that
	/// the module itself never reads a clock
	pub time: Instant,

	/// The metadata changed and must be persisted before any response
	/// produced by this operation is released
	pub meta: bool,

	/// The log changed (append or truncation) and must be flushed before any
	/// acknowledgement produced by this operation is released
	pub new_entries: bool,

	/// The commit index advanced; the apply loop has work to do
	pub committed: bool,

	/// Messages to send to other servers
	pub messages: Vec<Message>,

	/// If no other event occurs first, when the next cycle should run
	pub next_tick: Option<Duration>
}

impl Tick {
	pub fn empty_at(time: Instant) -> Self {
		Tick {
			time,
			meta: false,
			new_entries: false,
			committed: false,
			messages: vec![],
			next_tick: None
		}
	}

	pub fn empty() -> Self {
		Self::empty_at(Instant::now())
	}

	pub fn write_meta(&mut self) {
		self.meta = true;
	}

	pub fn send(&mut self, msg: Message) {
		self.messages.push(msg);
	}
}


/// The Raft core of a single server: role transitions, elections, log
/// replication, and commit advancement over a fixed roster of members
///
/// The module performs no I/O and takes no locks. It is driven entirely by
/// its entry points (RPC handlers, response callbacks, proposals, and the
/// periodic `cycle`), each of which records its side effects on a `Tick`.
/// All entry points expect to run serialized behind a single mutex
pub struct ConsensusModule {
	/// Id of the server we are representing
	id: ServerId,

	/// The persistent pair (current_term, voted_for)
	meta: Metadata,

	/// Highest index known committed. Volatile; rebuilt after a restart
	commit_index: LogIndex,

	/// Every server in the cluster, ourselves included. Fixed at boot
	members: HashSet<ServerId>,

	config: ConsensusConfig,

	log: Arc<dyn LogStorage + Send + Sync>,

	state: ServerState
}

impl ConsensusModule {

	pub fn new(
		id: ServerId, members: HashSet<ServerId>, mut meta: Metadata,
		log: Arc<dyn LogStorage + Send + Sync>,
		config: ConsensusConfig, now: Instant
	) -> ConsensusModule {
		assert!(members.contains(&id));

		// If the log carries a newer term than the metadata, no vote was cast
		// in any of the missing terms
		let last_log_term = log.term(log.last_index()).unwrap();
		if last_log_term > meta.current_term {
			meta.current_term = last_log_term;
			meta.voted_for = None;
		}

		let state = Self::new_follower(Self::new_election_timeout(&config), now);

		ConsensusModule {
			id,
			meta,
			commit_index: 0,
			members,
			config,
			log,
			state
		}
	}

	pub fn id(&self) -> ServerId {
		self.id
	}

	pub fn meta(&self) -> &Metadata {
		&self.meta
	}

	pub fn current_term(&self) -> Term {
		self.meta.current_term
	}

	pub fn commit_index(&self) -> LogIndex {
		self.commit_index
	}

	pub fn is_leader(&self) -> bool {
		match self.state {
			ServerState::Leader(_) => true,
			_ => false
		}
	}

	/// Best guess at who is currently able to accept proposals
	pub fn leader_hint(&self) -> Option<ServerId> {
		match self.state {
			ServerState::Leader(_) => Some(self.id),
			ServerState::Follower(ref s) => s.last_leader_id.or(self.meta.voted_for),
			ServerState::Candidate(_) => None
		}
	}

	pub fn propose_command(&mut self, data: bytes::Bytes, out: &mut Tick) -> ProposeResult {
		self.propose_entry(LogEntryData::Command(data), out)
	}

	pub fn propose_noop(&mut self, out: &mut Tick) -> ProposeResult {
		self.propose_entry(LogEntryData::Noop, out)
	}

	fn propose_entry(&mut self, data: LogEntryData, out: &mut Tick) -> ProposeResult {
		match self.state {
			ServerState::Leader(_) => {
				let term = self.meta.current_term;
				let index = self.log.last_index() + 1;

				out.new_entries = true;
				self.log.append(LogEntry { term, index, data });

				// Try to get it on the wire within this same tick
				self.cycle(out);

				Ok(LogPosition { term, index })
			},
			ServerState::Follower(ref s) => {
				Err(ProposeError::NotLeader {
					leader_hint: s.last_leader_id.or(self.meta.voted_for)
				})
			},
			ServerState::Candidate(_) => {
				Err(ProposeError::NotLeader { leader_hint: None })
			}
		}
	}

	/// Checks the progress of a previously initiated proposal. Converges
	/// fastest on the leader that accepted it
	pub fn proposal_status(&self, prop: &Proposal) -> ProposalStatus {
		match self.log.term(prop.index) {
			Some(term) => {
				if term == prop.term {
					if self.commit_index >= prop.index {
						ProposalStatus::Committed
					} else {
						ProposalStatus::Pending
					}
				} else if term > prop.term {
					// Truncated in favor of an entry from a newer leader
					ProposalStatus::Failed
				} else {
					ProposalStatus::Missing
				}
			},
			None => ProposalStatus::Missing
		}
	}

	/// Advances time. Runs any transition that is due (election timeouts,
	/// heartbeats, commit advancement) and reports when it wants to run next
	pub fn cycle(&mut self, tick: &mut Tick) {

		enum Summary {
			Follower { elapsed: Duration, election_timeout: Duration },
			Candidate { vote_count: usize, election_start: Instant, election_timeout: Duration },
			Leader { next_commit_index: Option<LogIndex> }
		}

		// Pull what we need out of the state so transitions below can freely
		// replace it
		let summary = match self.state {
			ServerState::Follower(ref s) => Summary::Follower {
				elapsed: tick.time.saturating_duration_since(s.last_heartbeat),
				election_timeout: s.election_timeout
			},
			ServerState::Candidate(ref s) => Summary::Candidate {
				// We always vote for ourselves
				vote_count: 1 + s.votes_received.len(),
				election_start: s.election_start,
				election_timeout: s.election_timeout
			},
			ServerState::Leader(ref s) => Summary::Leader {
				next_commit_index: self.find_next_commit_index(s)
			}
		};

		match summary {
			Summary::Follower { elapsed, election_timeout } => {
				if elapsed >= election_timeout {
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
				}
			},

			Summary::Candidate { vote_count, election_start, election_timeout } => {
				if vote_count >= self.majority_size() {
					info!("server {}: elected leader for term {}", self.id, self.meta.current_term);

					let last_log_index = self.log.last_index();

					let servers = self.members.iter()
						.filter(|s| **s != self.id)
						.map(|s| (*s, ServerProgress::new(last_log_index)))
						.collect();

					self.state = ServerState::Leader(ServerLeaderState { servers });

					// Entries inherited from earlier terms can only be
					// committed behind an entry of our own term
					if self.commit_index < last_log_index {
						self.propose_noop(tick)
							.expect("newly elected leader rejected its own proposal");
						return;
					}

					// Assert authority with an immediate round of heartbeats
					self.cycle(tick);
					return;
				}

				let elapsed = tick.time.saturating_duration_since(election_start);
				if elapsed >= election_timeout {
					// Nobody won this term; try again in the next one
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
				}
			},

			Summary::Leader { next_commit_index } => {
				if let Some(ci) = next_commit_index {
					self.update_committed(ci, tick);
				}

				let next_heartbeat = self.replicate_entries(tick);
				tick.next_tick = Some(next_heartbeat);
			}
		}
	}

	fn start_election(&mut self, tick: &mut Tick) {
		self.meta.current_term += 1;
		self.meta.voted_for = Some(self.id);
		tick.write_meta();

		info!("server {}: starting election for term {}", self.id, self.meta.current_term);

		self.state = ServerState::Candidate(ServerCandidateState {
			election_start: tick.time,
			election_timeout: Self::new_election_timeout(&self.config),
			votes_received: HashSet::new()
		});

		self.perform_election(tick);

		// Sets the retry deadline, or immediately wins a single-server cluster
		self.cycle(tick);
	}

	fn perform_election(&self, tick: &mut Tick) {
		let pos = self.log.last_position();

		let req = RequestVoteRequest {
			term: self.meta.current_term,
			candidate_id: self.id,
			last_log_index: pos.index,
			last_log_term: pos.term
		};

		let ids = self.members.iter()
			.filter(|s| **s != self.id)
			.cloned()
			.collect::<Vec<_>>();

		if ids.is_empty() {
			return;
		}

		tick.send(Message { to: ids, body: MessageBody::RequestVote(req) });
	}

	fn new_follower(election_timeout: Duration, now: Instant) -> ServerState {
		ServerState::Follower(ServerFollowerState {
			election_timeout,
			last_leader_id: None,
			last_heartbeat: now
		})
	}

	fn become_follower(&mut self, tick: &mut Tick) {
		self.state = Self::new_follower(Self::new_election_timeout(&self.config), tick.time);
		self.cycle(tick);
	}

	/// Run on every term seen in a remote request or response. A higher term
	/// immediately demotes us
	fn observe_term(&mut self, term: Term, tick: &mut Tick) {
		if term > self.meta.current_term {
			self.meta.current_term = term;
			self.meta.voted_for = None;
			tick.write_meta();

			self.become_follower(tick);
		}
	}

	fn update_committed(&mut self, index: LogIndex, tick: &mut Tick) {
		assert!(index > self.commit_index);

		debug!("server {}: commit index {} -> {}", self.id, self.commit_index, index);
		self.commit_index = index;
		tick.committed = true;
	}

	fn majority_size(&self) -> usize {
		(self.members.len() / 2) + 1
	}

	/// On the leader, the highest index that a majority of the cluster has
	/// persisted, provided it is from our own term
	fn find_next_commit_index(&self, s: &ServerLeaderState) -> Option<LogIndex> {
		let last_log_index = self.log.last_index();

		let mut indices = s.servers.values()
			.map(|p| p.match_index)
			.collect::<Vec<_>>();

		// The leader's own log counts towards the quorum
		indices.push(last_log_index);
		indices.sort_unstable();

		// Sorted ascending, this is the highest index present on at least a
		// majority of servers
		let n = indices[indices.len() - self.majority_size()];

		if n > self.commit_index && self.log.term(n) == Some(self.meta.current_term) {
			Some(n)
		} else {
			None
		}
	}

	/// On the leader, produces replication requests and heartbeats for every
	/// peer that needs one. Returns the time until the next heartbeat is due
	fn replicate_entries(&mut self, tick: &mut Tick) -> Duration {
		let state = match self.state {
			ServerState::Leader(ref mut s) => s,
			_ => panic!("replicating entries while not the leader")
		};

		let leader_id = self.id;
		let term = self.meta.current_term;
		let leader_commit = self.commit_index;
		let cap = self.config.max_entries_per_append as u64;
		let heartbeat_interval = self.config.heartbeat_interval;
		let log = &self.log;

		let last_log_index = log.last_index();

		// Builds the request for a peer whose log is known to match up to
		// prev_log_index, with at most `cap` entries. Also yields the last
		// index covered so the response callback knows what was acknowledged
		let new_request = |prev_log_index: LogIndex| -> (AppendEntriesRequest, LogIndex) {
			let last = std::cmp::min(last_log_index, prev_log_index + cap);

			let mut entries = vec![];
			for i in (prev_log_index + 1)..=last {
				entries.push((*log.entry(i).unwrap()).clone());
			}

			let req = AppendEntriesRequest {
				term,
				leader_id,
				prev_log_index,
				prev_log_term: log.term(prev_log_index).unwrap(),
				entries,
				leader_commit
			};

			(req, last)
		};

		// Peers at the same position receive byte-identical requests; build
		// each once and fan out
		let mut message_map: HashMap<LogIndex, Message> = HashMap::new();

		// Among the peers we are skipping, the longest time since we sent
		// anything (bounds when the next heartbeat must go out)
		let mut since_last_heartbeat = Duration::from_millis(0);

		for (server_id, progress) in state.servers.iter_mut() {
			// At most one outstanding request per peer
			if progress.request_pending {
				continue;
			}

			// An up-to-date peer only needs to hear from us once per
			// heartbeat interval
			if progress.match_index >= last_log_index {
				if let Some(ref time) = progress.last_sent {
					let elapsed = tick.time.saturating_duration_since(*time);
					if elapsed < heartbeat_interval {
						if elapsed > since_last_heartbeat {
							since_last_heartbeat = elapsed;
						}
						continue;
					}
				}
			}

			progress.request_pending = true;
			progress.last_sent = Some(tick.time);

			let msg_key = progress.next_index - 1;
			if let Some(msg) = message_map.get_mut(&msg_key) {
				msg.to.push(*server_id);
			} else {
				let (req, last) = new_request(msg_key);
				message_map.insert(msg_key, Message {
					to: vec![*server_id],
					body: MessageBody::AppendEntries(req, last)
				});
			}
		}

		for (_, msg) in message_map.into_iter() {
			tick.send(msg);
		}

		heartbeat_interval.checked_sub(since_last_heartbeat)
			.unwrap_or_else(|| Duration::from_millis(0))
	}

	fn new_election_timeout(config: &ConsensusConfig) -> Duration {
		let mut rng = rand::thread_rng();
		let fluctuate = config.election_timeout_fluctuate.as_millis() as u64;
		let base = config.election_timeout_base.as_millis() as u64;

		Duration::from_millis(base + rng.gen_range(0..=fluctuate))
	}

	/// Handles the response to a RequestVote this server sent to `from_id`
	pub fn request_vote_callback(
		&mut self, from_id: ServerId, resp: RequestVoteResponse, tick: &mut Tick
	) {
		self.observe_term(resp.term, tick);

		// Only meaningful if we are still the candidate of the term the vote
		// was requested in
		if self.meta.current_term != resp.term {
			return;
		}

		let should_cycle = if let ServerState::Candidate(ref mut s) = self.state {
			if resp.vote_granted {
				s.votes_received.insert(from_id);
			}
			true
		} else {
			false
		};

		if should_cycle {
			// We may just have reached a majority
			self.cycle(tick);
		}
	}

	/// Handles the response to an AppendEntries this server sent to
	/// `from_id`. `last_index` is the last log index the request covered
	pub fn append_entries_callback(
		&mut self, from_id: ServerId, last_index: LogIndex,
		resp: AppendEntriesResponse, tick: &mut Tick
	) {
		self.observe_term(resp.term, tick);

		// A response from an earlier leadership of ours is stale
		if self.meta.current_term != resp.term {
			return;
		}

		let should_cycle = if let ServerState::Leader(ref mut s) = self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				if resp.success {
					if last_index > progress.match_index {
						progress.match_index = last_index;
						progress.next_index = last_index + 1;
					}
				} else {
					// Consistency check failed: back off one entry and retry
					if progress.next_index > 1 {
						progress.next_index -= 1;
					}
				}

				progress.request_pending = false;
				true
			} else {
				false
			}
		} else {
			false
		};

		if should_cycle {
			// match_index may have moved; recheck the commit index and keep
			// the peer fed
			self.cycle(tick);
		}
	}

	/// Handles an error/timeout of an AppendEntries this server sent. The
	/// request will be rebuilt and retried on a future cycle
	pub fn append_entries_noresponse(&mut self, from_id: ServerId, _tick: &mut Tick) {
		if let ServerState::Leader(ref mut s) = self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				progress.request_pending = false;
			}
		}
	}

	/// Whether a RequestVote request would currently be granted. Pure; never
	/// mutates our state
	pub fn pre_vote(&self, req: &RequestVoteRequest) -> RequestVoteResponse {
		let should_grant = |this: &Self| {
			if req.term < this.meta.current_term {
				return false;
			}

			let pos = this.log.last_position();

			// Whether the candidate's log is at least as up-to-date as ours:
			// later last term wins, equal terms compare last indices
			let up_to_date =
				req.last_log_term > pos.term ||
				(req.last_log_term == pos.term && req.last_log_index >= pos.index);

			if !up_to_date {
				return false;
			}

			// A higher term than ours implies we cast no vote in it
			if req.term > this.meta.current_term {
				return true;
			}

			match this.meta.voted_for {
				// Within a term a vote is cast at most once
				Some(id) => id == req.candidate_id,
				None => true
			}
		};

		RequestVoteResponse {
			term: self.meta.current_term,
			vote_granted: should_grant(self)
		}
	}

	/// Called when another server asks for our vote. The returned response
	/// must not leave this process until the metadata is durable
	pub fn request_vote(
		&mut self, req: RequestVoteRequest, tick: &mut Tick
	) -> MustPersistMetadata<RequestVoteResponse> {
		self.observe_term(req.term, tick);

		let res = self.pre_vote(&req);

		if res.vote_granted {
			// Restart the timer so the winner gets a full quiet period to
			// assert itself
			if let ServerState::Follower(ref mut s) = self.state {
				s.last_heartbeat = tick.time;
			}

			self.meta.voted_for = Some(req.candidate_id);
			tick.write_meta();

			info!("server {}: voted for {} in term {}",
				self.id, req.candidate_id, self.meta.current_term);
		}

		MustPersistMetadata::new(res)
	}

	/// Called when a leader replicates entries to us. The returned response
	/// must not leave this process until the log is durable up to the
	/// position it acknowledges
	pub fn append_entries(
		&mut self, req: AppendEntriesRequest, tick: &mut Tick
	) -> Result<MatchConstraint<AppendEntriesResponse>> {
		self.observe_term(req.term, tick);

		let current_term = self.meta.current_term;
		let response = |success: bool| AppendEntriesResponse { term: current_term, success };

		if req.term < current_term {
			// Stale leader. The term in the response will demote it. The
			// election timer is deliberately left alone
			return Ok(response(false).into());
		}

		// A candidate observing a valid leader in its own term concedes
		if let ServerState::Candidate(_) = self.state {
			self.become_follower(tick);
		}

		match self.state {
			ServerState::Follower(ref mut s) => {
				s.last_heartbeat = tick.time;
				s.last_leader_id = Some(req.leader_id);
			},
			ServerState::Leader(_) => {
				bail!("second leader observed in term {}", current_term);
			},
			ServerState::Candidate(_) => {
				bail!("still a candidate after conceding to a leader");
			}
		};

		// The entries must directly follow the previous position and be
		// contiguous; the truncation below relies on it
		if let Some(first) = req.entries.first() {
			if first.term < req.prev_log_term || first.index != req.prev_log_index + 1 {
				bail!("first entry does not follow the previous position");
			}

			for w in req.entries.windows(2) {
				if w[1].term < w[0].term || w[1].index != w[0].index + 1 {
					bail!("entries are unsorted or discontiguous");
				}
			}
		}

		// Consistency check: our log must contain the position immediately
		// preceding the new entries. The sentinel always matches (0, 0)
		match self.log.term(req.prev_log_index) {
			Some(term) => {
				if term != req.prev_log_term {
					return Ok(response(false).into());
				}
			},
			None => {
				return Ok(response(false).into());
			}
		};

		// Walk the provided entries against our log. Entries already present
		// with a matching term are left untouched so that retries and
		// heartbeats are idempotent; the first divergence truncates our tail
		let mut first_new = 0;
		for e in req.entries.iter() {
			match self.log.term(e.index) {
				Some(t) => {
					if t == e.term {
						first_new += 1;
					} else {
						if self.commit_index >= e.index {
							bail!("leader requested truncating committed entries");
						}

						self.log.truncate_suffix(e.index);
						tick.new_entries = true;
						break;
					}
				},
				None => break
			}
		}

		// Everything the request covers is now in our log (matched prefix
		// plus whatever we append below)
		let (last_new, last_new_term) = match req.entries.last() {
			Some(e) => (e.index, e.term),
			None => (req.prev_log_index, req.prev_log_term)
		};

		if first_new < req.entries.len() {
			for e in &req.entries[first_new..] {
				tick.new_entries = true;
				self.log.append(e.clone());
			}
		}

		// Only the range this request vouches for may move our commit index,
		// regardless of how much further our log extends
		if req.leader_commit > self.commit_index {
			let next_commit = std::cmp::min(req.leader_commit, last_new);
			if next_commit > self.commit_index {
				self.update_committed(next_commit, tick);
			}
		}

		Ok(MatchConstraint::new(
			response(true),
			LogPosition { term: last_new_term, index: last_new }
		))
	}
}


#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;

	fn fixed_config() -> ConsensusConfig {
		ConsensusConfig {
			election_timeout_base: Duration::from_millis(150),
			election_timeout_fluctuate: Duration::from_millis(0),
			heartbeat_interval: Duration::from_millis(50),
			max_entries_per_append: 5
		}
	}

	fn members(n: u64) -> HashSet<ServerId> {
		(1..=n).collect()
	}

	fn new_module(id: ServerId, n: u64, now: Instant) -> (ConsensusModule, Arc<MemoryLog>) {
		let log = Arc::new(MemoryLog::new());
		let module = ConsensusModule::new(
			id, members(n), Metadata::default(), log.clone(), fixed_config(), now);
		(module, log)
	}

	fn command_entry(term: Term, index: LogIndex, data: &str) -> LogEntry {
		LogEntry {
			term, index,
			data: LogEntryData::Command(Bytes::copy_from_slice(data.as_bytes()))
		}
	}

	fn tick_at(t0: Instant, ms: u64) -> Tick {
		Tick::empty_at(t0 + Duration::from_millis(ms))
	}

	/// Drives the module from a fresh follower to leadership in a 3-server
	/// cluster by expiring the timer and delivering one granted vote
	fn elect(module: &mut ConsensusModule, t0: Instant) -> Tick {
		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		assert!(!module.is_leader());

		let mut tick = tick_at(t0, 151);
		module.request_vote_callback(2, RequestVoteResponse {
			term: module.current_term(), vote_granted: true
		}, &mut tick);
		assert!(module.is_leader());

		tick
	}

	#[test]
	fn follower_starts_election_on_timeout() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);

		// Before the timeout nothing happens
		let mut tick = tick_at(t0, 100);
		module.cycle(&mut tick);
		assert_eq!(module.current_term(), 0);
		assert!(tick.messages.is_empty());
		assert_eq!(tick.next_tick, Some(Duration::from_millis(50)));

		// At the timeout we become a candidate in term 1 and solicit votes
		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		assert_eq!(module.current_term(), 1);
		assert_eq!(module.meta().voted_for, Some(1));
		assert!(tick.meta);

		assert_eq!(tick.messages.len(), 1);
		let msg = &tick.messages[0];
		let mut to = msg.to.clone();
		to.sort_unstable();
		assert_eq!(to, vec![2, 3]);
		match msg.body {
			MessageBody::RequestVote(ref req) => {
				assert_eq!(req.term, 1);
				assert_eq!(req.candidate_id, 1);
				assert_eq!(req.last_log_index, 0);
				assert_eq!(req.last_log_term, 0);
			},
			_ => panic!("expected a RequestVote")
		}
	}

	#[test]
	fn candidate_restarts_election_in_next_term() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);

		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		assert_eq!(module.current_term(), 1);

		// No votes arrive; the candidate times out into a fresh election
		let mut tick = tick_at(t0, 301);
		module.cycle(&mut tick);
		assert_eq!(module.current_term(), 2);
		assert_eq!(module.meta().voted_for, Some(1));
		assert!(!module.is_leader());
	}

	#[test]
	fn candidate_with_majority_becomes_leader_and_heartbeats() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);

		let tick = elect(&mut module, t0);

		// Leadership is asserted with an immediate empty append to both peers
		assert_eq!(tick.messages.len(), 1);
		let msg = &tick.messages[0];
		let mut to = msg.to.clone();
		to.sort_unstable();
		assert_eq!(to, vec![2, 3]);
		match msg.body {
			MessageBody::AppendEntries(ref req, last) => {
				assert_eq!(req.term, 1);
				assert_eq!(req.leader_id, 1);
				assert_eq!(req.prev_log_index, 0);
				assert_eq!(req.prev_log_term, 0);
				assert!(req.entries.is_empty());
				assert_eq!(last, 0);
			},
			_ => panic!("expected an AppendEntries")
		}
	}

	#[test]
	fn votes_from_older_terms_are_ignored() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);

		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		let mut tick = tick_at(t0, 301);
		module.cycle(&mut tick);
		assert_eq!(module.current_term(), 2);

		// A straggling grant from the term 1 election must not count
		let mut tick = tick_at(t0, 302);
		module.request_vote_callback(2, RequestVoteResponse {
			term: 1, vote_granted: true
		}, &mut tick);
		assert!(!module.is_leader());
	}

	#[test]
	fn grants_at_most_one_vote_per_term() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);

		let req = |candidate_id| RequestVoteRequest {
			term: 1, candidate_id, last_log_index: 0, last_log_term: 0
		};

		let mut tick = tick_at(t0, 10);
		let res = module.request_vote(req(2), &mut tick).persisted();
		assert!(res.vote_granted);
		assert!(tick.meta);
		assert_eq!(module.meta().voted_for, Some(2));

		// A second candidate in the same term is refused
		let mut tick = tick_at(t0, 11);
		let res = module.request_vote(req(3), &mut tick).persisted();
		assert!(!res.vote_granted);

		// But the original candidate may ask again
		let mut tick = tick_at(t0, 12);
		let res = module.request_vote(req(2), &mut tick).persisted();
		assert!(res.vote_granted);
	}

	#[test]
	fn rejects_vote_for_stale_term() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);

		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		assert_eq!(module.current_term(), 1);

		let mut tick = tick_at(t0, 151);
		let res = module.request_vote(RequestVoteRequest {
			term: 0, candidate_id: 2, last_log_index: 10, last_log_term: 0
		}, &mut tick).persisted();

		assert!(!res.vote_granted);
		assert_eq!(res.term, 1);
	}

	#[test]
	fn rejects_vote_for_less_up_to_date_log() {
		let t0 = Instant::now();
		let log = Arc::new(MemoryLog::new());
		log.append(command_entry(1, 1, "a"));
		log.append(command_entry(2, 2, "b"));

		let mut module = ConsensusModule::new(
			1, members(3), Metadata { current_term: 2, voted_for: None },
			log.clone(), fixed_config(), t0);

		// Same last term but shorter log
		let mut tick = tick_at(t0, 10);
		let res = module.request_vote(RequestVoteRequest {
			term: 3, candidate_id: 2, last_log_index: 1, last_log_term: 2
		}, &mut tick).persisted();
		assert!(!res.vote_granted);

		// Lower last term, even if longer
		let mut tick = tick_at(t0, 11);
		let res = module.request_vote(RequestVoteRequest {
			term: 3, candidate_id: 2, last_log_index: 10, last_log_term: 1
		}, &mut tick).persisted();
		assert!(!res.vote_granted);

		// Equal position is good enough
		let mut tick = tick_at(t0, 12);
		let res = module.request_vote(RequestVoteRequest {
			term: 3, candidate_id: 2, last_log_index: 2, last_log_term: 2
		}, &mut tick).persisted();
		assert!(res.vote_granted);
	}

	#[test]
	fn append_entries_rejects_stale_term() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);

		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		assert_eq!(module.current_term(), 1);

		let mut tick = tick_at(t0, 160);
		let res = module.append_entries(AppendEntriesRequest {
			term: 0, leader_id: 2,
			prev_log_index: 0, prev_log_term: 0,
			entries: vec![], leader_commit: 0
		}, &mut tick).unwrap().poll(&*_log).ok().unwrap();

		assert!(!res.success);
		assert_eq!(res.term, 1);
	}

	#[test]
	fn append_entries_rejects_missing_prev_entry() {
		let t0 = Instant::now();
		let (mut module, log) = new_module(1, 3, t0);

		let mut tick = tick_at(t0, 10);
		let res = module.append_entries(AppendEntriesRequest {
			term: 1, leader_id: 2,
			prev_log_index: 5, prev_log_term: 1,
			entries: vec![command_entry(1, 6, "x")],
			leader_commit: 0
		}, &mut tick).unwrap().poll(&*log).ok().unwrap();

		assert!(!res.success);
		assert_eq!(log.last_index(), 0);
	}

	#[test]
	fn append_entries_truncates_conflicts() {
		// A follower holding stale entries from an old term accepts the new
		// leader's conflicting entry by truncating its own tail
		let t0 = Instant::now();
		let log = Arc::new(MemoryLog::new());
		log.append(command_entry(1, 1, "a"));
		log.append(command_entry(1, 2, "b"));

		let mut module = ConsensusModule::new(
			1, members(3), Metadata { current_term: 1, voted_for: None },
			log.clone(), fixed_config(), t0);

		let mut tick = tick_at(t0, 10);
		let res = module.append_entries(AppendEntriesRequest {
			term: 2, leader_id: 2,
			prev_log_index: 1, prev_log_term: 1,
			entries: vec![command_entry(2, 2, "c")],
			leader_commit: 0
		}, &mut tick).unwrap().poll(&*log).ok().unwrap();

		assert!(res.success);
		assert_eq!(log.last_index(), 2);
		assert_eq!(log.term(1), Some(1));
		assert_eq!(log.entry(2).unwrap().as_ref(), &command_entry(2, 2, "c"));
	}

	#[test]
	fn append_entries_is_idempotent() {
		let t0 = Instant::now();
		let (mut module, log) = new_module(1, 3, t0);

		let req = AppendEntriesRequest {
			term: 1, leader_id: 2,
			prev_log_index: 0, prev_log_term: 0,
			entries: vec![command_entry(1, 1, "a"), command_entry(1, 2, "b")],
			leader_commit: 1
		};

		let mut tick = tick_at(t0, 10);
		let res = module.append_entries(req.clone(), &mut tick).unwrap()
			.poll(&*log).ok().unwrap();
		assert!(res.success);
		assert!(tick.new_entries);
		assert_eq!(log.last_index(), 2);
		assert_eq!(module.commit_index(), 1);

		// Redelivery changes nothing
		let first = log.entry(1).unwrap();
		let mut tick = tick_at(t0, 11);
		let res = module.append_entries(req, &mut tick).unwrap()
			.poll(&*log).ok().unwrap();
		assert!(res.success);
		assert!(!tick.new_entries);
		assert_eq!(log.last_index(), 2);
		assert!(Arc::ptr_eq(&first, &log.entry(1).unwrap()));
	}

	#[test]
	fn heartbeat_never_modifies_the_log() {
		let t0 = Instant::now();
		let (mut module, log) = new_module(1, 3, t0);

		let mut tick = tick_at(t0, 10);
		module.append_entries(AppendEntriesRequest {
			term: 1, leader_id: 2,
			prev_log_index: 0, prev_log_term: 0,
			entries: vec![command_entry(1, 1, "a")],
			leader_commit: 0
		}, &mut tick).unwrap();

		let mut tick = tick_at(t0, 20);
		let res = module.append_entries(AppendEntriesRequest {
			term: 1, leader_id: 2,
			prev_log_index: 1, prev_log_term: 1,
			entries: vec![], leader_commit: 1
		}, &mut tick).unwrap().poll(&*log).ok().unwrap();

		assert!(res.success);
		assert!(!tick.new_entries);
		assert_eq!(log.last_index(), 1);
		assert_eq!(module.commit_index(), 1);
	}

	#[test]
	fn commit_only_covers_acknowledged_range() {
		// A follower whose log extends past the entries the leader just
		// confirmed must not commit the unconfirmed tail
		let t0 = Instant::now();
		let log = Arc::new(MemoryLog::new());
		log.append(command_entry(1, 1, "a"));
		log.append(command_entry(1, 2, "b"));
		log.append(command_entry(1, 3, "c"));

		let mut module = ConsensusModule::new(
			1, members(3), Metadata { current_term: 1, voted_for: None },
			log.clone(), fixed_config(), t0);

		let mut tick = tick_at(t0, 10);
		let res = module.append_entries(AppendEntriesRequest {
			term: 1, leader_id: 2,
			prev_log_index: 0, prev_log_term: 0,
			entries: vec![command_entry(1, 1, "a")],
			leader_commit: 3
		}, &mut tick).unwrap().poll(&*log).ok().unwrap();

		assert!(res.success);
		assert_eq!(module.commit_index(), 1);
	}

	#[test]
	fn candidate_concedes_to_leader_in_same_term() {
		let t0 = Instant::now();
		let (mut module, log) = new_module(1, 3, t0);

		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		assert_eq!(module.current_term(), 1);

		let mut tick = tick_at(t0, 160);
		let res = module.append_entries(AppendEntriesRequest {
			term: 1, leader_id: 2,
			prev_log_index: 0, prev_log_term: 0,
			entries: vec![], leader_commit: 0
		}, &mut tick).unwrap().poll(&*log).ok().unwrap();

		assert!(res.success);
		assert!(!module.is_leader());
		assert_eq!(module.leader_hint(), Some(2));
	}

	#[test]
	fn leader_replicates_and_commits_proposals() {
		let t0 = Instant::now();
		let (mut module, log) = new_module(1, 3, t0);
		elect(&mut module, t0);

		// Both peers acknowledge the initial heartbeat
		let mut tick = tick_at(t0, 155);
		module.append_entries_callback(2, 0, AppendEntriesResponse {
			term: 1, success: true
		}, &mut tick);
		let mut tick = tick_at(t0, 156);
		module.append_entries_callback(3, 0, AppendEntriesResponse {
			term: 1, success: true
		}, &mut tick);

		let mut tick = tick_at(t0, 200);
		let prop = module.propose_command(Bytes::from_static(b"x"), &mut tick).unwrap();
		assert_eq!(prop, LogPosition { term: 1, index: 1 });
		assert!(tick.new_entries);
		assert_eq!(module.proposal_status(&prop), ProposalStatus::Pending);

		// The proposal goes out to both peers within the same tick
		let covered = tick.messages.iter().map(|m| match m.body {
			MessageBody::AppendEntries(ref req, last) => {
				assert_eq!(req.entries.len(), 1);
				(m.to.len(), last)
			},
			_ => panic!("expected AppendEntries")
		}).collect::<Vec<_>>();
		assert_eq!(covered, vec![(2, 1)]);

		// One acknowledgement forms a majority together with our own log
		let mut tick = tick_at(t0, 210);
		module.append_entries_callback(2, 1, AppendEntriesResponse {
			term: 1, success: true
		}, &mut tick);

		assert_eq!(module.commit_index(), 1);
		assert!(tick.committed);
		assert_eq!(module.proposal_status(&prop), ProposalStatus::Committed);
		assert_eq!(log.last_index(), 1);
	}

	#[test]
	fn leader_backs_off_after_rejection() {
		let t0 = Instant::now();
		let log = Arc::new(MemoryLog::new());
		log.append(command_entry(1, 1, "a"));
		log.append(command_entry(1, 2, "b"));

		let mut module = ConsensusModule::new(
			1, members(3), Metadata { current_term: 1, voted_for: None },
			log.clone(), fixed_config(), t0);

		// Take leadership in term 2 with the existing 2-entry log
		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		let mut tick = tick_at(t0, 151);
		module.request_vote_callback(2, RequestVoteResponse {
			term: 2, vote_granted: true
		}, &mut tick);
		assert!(module.is_leader());

		// A noop in our own term was proposed on top of the old entries
		assert_eq!(log.last_index(), 3);
		assert_eq!(log.entry(3).unwrap().data, LogEntryData::Noop);

		// Peer 2 rejects the initial probe at prev=2; the retry must probe
		// one entry earlier
		let mut tick = tick_at(t0, 160);
		module.append_entries_callback(2, 3, AppendEntriesResponse {
			term: 2, success: false
		}, &mut tick);

		let probe = tick.messages.iter().find_map(|m| match m.body {
			MessageBody::AppendEntries(ref req, _) if m.to.contains(&2) => Some(req.clone()),
			_ => None
		}).expect("no retry sent to peer 2");
		assert_eq!(probe.prev_log_index, 1);
	}

	#[test]
	fn old_term_entries_commit_only_behind_a_current_term_entry() {
		let t0 = Instant::now();
		let log = Arc::new(MemoryLog::new());
		log.append(command_entry(1, 1, "a"));

		let mut module = ConsensusModule::new(
			1, members(3), Metadata { current_term: 1, voted_for: None },
			log.clone(), fixed_config(), t0);

		let mut tick = tick_at(t0, 150);
		module.cycle(&mut tick);
		let mut tick = tick_at(t0, 151);
		module.request_vote_callback(2, RequestVoteResponse {
			term: 2, vote_granted: true
		}, &mut tick);
		assert!(module.is_leader());
		assert_eq!(log.last_index(), 2);

		// Majority on the old entry alone must not commit it
		let mut tick = tick_at(t0, 160);
		module.append_entries_callback(2, 1, AppendEntriesResponse {
			term: 2, success: true
		}, &mut tick);
		assert_eq!(module.commit_index(), 0);

		// Covering the term-2 noop as well commits everything up to it
		let mut tick = tick_at(t0, 170);
		module.append_entries_callback(2, 2, AppendEntriesResponse {
			term: 2, success: true
		}, &mut tick);
		assert_eq!(module.commit_index(), 2);
	}

	#[test]
	fn leader_steps_down_on_higher_term() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);
		elect(&mut module, t0);

		let mut tick = tick_at(t0, 200);
		module.append_entries_callback(2, 0, AppendEntriesResponse {
			term: 5, success: false
		}, &mut tick);

		assert!(!module.is_leader());
		assert_eq!(module.current_term(), 5);
		assert_eq!(module.meta().voted_for, None);
		assert!(tick.meta);
	}

	#[test]
	fn proposals_refused_by_non_leaders() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);

		let mut tick = tick_at(t0, 10);
		match module.propose_command(Bytes::from_static(b"x"), &mut tick) {
			Err(ProposeError::NotLeader { .. }) => {},
			other => panic!("expected NotLeader, got {:?}", other)
		}
	}

	#[test]
	fn replication_batches_are_capped() {
		let t0 = Instant::now();
		let (mut module, _log) = new_module(1, 3, t0);
		elect(&mut module, t0);

		// Pile up proposals while the initial heartbeats are still in flight
		let mut tick = tick_at(t0, 210);
		for i in 0..7u8 {
			module.propose_command(Bytes::copy_from_slice(&[i]), &mut tick).unwrap();
		}

		// When peer 2 becomes sendable again it gets at most one cap's worth
		let mut tick = tick_at(t0, 220);
		module.append_entries_callback(2, 0, AppendEntriesResponse {
			term: 1, success: true
		}, &mut tick);

		let req = tick.messages.iter().find_map(|m| match m.body {
			MessageBody::AppendEntries(ref req, last) if m.to.contains(&2) => Some((req.clone(), last)),
			_ => None
		}).expect("no batch sent to peer 2");

		assert_eq!(req.0.prev_log_index, 0);
		assert_eq!(req.0.entries.len(), 5);
		assert_eq!(req.1, 5);
	}

	#[test]
	fn election_timeouts_stay_in_range() {
		let config = ConsensusConfig::default();
		for _ in 0..200 {
			let t = ConsensusModule::new_election_timeout(&config);
			assert!(t >= Duration::from_millis(150));
			assert!(t <= Duration::from_millis(300));
		}
	}

	#[test]
	fn recovery_adopts_newer_log_term() {
		let t0 = Instant::now();
		let log = Arc::new(MemoryLog::new());
		log.append(command_entry(3, 1, "a"));

		let module = ConsensusModule::new(
			1, members(3), Metadata { current_term: 1, voted_for: Some(2) },
			log, fixed_config(), t0);

		assert_eq!(module.current_term(), 3);
		assert_eq!(module.meta().voted_for, None);
	}
}
