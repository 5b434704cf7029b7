use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::consensus::*;
use crate::errors::*;
use crate::log::LogStorage;
use crate::protos::*;
use crate::rpc::{Client, ServerService};
use crate::state_machine::StateMachine;
use crate::storage::MetadataStore;
use crate::sync::ChangeEvent;


struct ServerShared {
	inst: ConsensusModuleHandle,

	log: Arc<dyn LogStorage + Send + Sync>,
	meta_store: Arc<dyn MetadataStore>,
	client: Arc<dyn Client>,
	state_machine: Arc<dyn StateMachine>,

	/// Deadline for outbound requests. Expiry counts as no response and the
	/// request is rebuilt on a later cycle
	rpc_timeout: Duration,

	/// Wakes the cycle task whenever its schedule may have changed
	state_changed: ChangeEvent,

	/// Wakes the apply task when the commit index moves
	commit_changed: ChangeEvent,

	/// Carries the index of the last applied entry; proposers watch it to
	/// learn when their command has executed
	applied_tx: watch::Sender<LogIndex>,
	applied_rx: watch::Receiver<LogIndex>
}


/// Runs a ConsensusModule as a live server: the election/heartbeat clock, the
/// outbound request dispatch, and the apply loop, with the persistence
/// discipline enforced between the module and the transport
///
/// Cloning is cheap and yields a handle to the same server
#[derive(Clone)]
pub struct Server {
	shared: Arc<ServerShared>
}

impl Server {

	pub fn new(
		module: ConsensusModule,
		log: Arc<dyn LogStorage + Send + Sync>,
		meta_store: Arc<dyn MetadataStore>,
		client: Arc<dyn Client>,
		state_machine: Arc<dyn StateMachine>,
		last_applied: LogIndex,
		rpc_timeout: Duration
	) -> Server {
		let (applied_tx, applied_rx) = watch::channel(last_applied);

		Server {
			shared: Arc::new(ServerShared {
				inst: Arc::new(Mutex::new(module)),
				log,
				meta_store,
				client,
				state_machine,
				rpc_timeout,
				state_changed: ChangeEvent::new(),
				commit_changed: ChangeEvent::new(),
				applied_tx,
				applied_rx
			})
		}
	}

	/// Spawns the background tasks. Must be called from within a tokio
	/// runtime; the server is inert until then
	pub fn start(&self) {
		let server = self.clone();
		tokio::spawn(async move { server.run_cycle().await });

		let server = self.clone();
		tokio::spawn(async move { server.run_apply().await });
	}

	pub fn id(&self) -> ServerId {
		self.shared.inst.lock().unwrap().id()
	}

	pub fn is_leader(&self) -> bool {
		self.shared.inst.lock().unwrap().is_leader()
	}

	pub fn current_term(&self) -> Term {
		self.shared.inst.lock().unwrap().current_term()
	}

	pub fn commit_index(&self) -> LogIndex {
		self.shared.inst.lock().unwrap().commit_index()
	}

	pub fn leader_hint(&self) -> Option<ServerId> {
		self.shared.inst.lock().unwrap().leader_hint()
	}

	pub fn last_applied(&self) -> LogIndex {
		*self.shared.applied_rx.borrow()
	}

	/// Appends a command to the replicated log, failing immediately if this
	/// server is not the leader
	pub fn propose(&self, data: Bytes) -> Result<Proposal> {
		let result = {
			let mut inst = self.shared.inst.lock().unwrap();
			let mut tick = Tick::empty();
			let result = inst.propose_command(data, &mut tick);
			self.must_persist(self.finish_tick(&inst, tick));
			result
		};

		match result {
			Ok(prop) => Ok(prop),
			Err(ProposeError::NotLeader { leader_hint }) => {
				Err(ErrorKind::NotLeader(leader_hint).into())
			}
		}
	}

	/// Proposes a command and waits until it has been committed and executed
	/// on the local state machine
	pub async fn execute(&self, data: Bytes) -> Result<()> {
		let prop = self.propose(data)?;
		self.wait_for_applied(prop).await
	}

	async fn wait_for_applied(&self, prop: Proposal) -> Result<()> {
		let mut applied_rx = self.shared.applied_rx.clone();

		loop {
			{
				let inst = self.shared.inst.lock().unwrap();
				match inst.proposal_status(&prop) {
					ProposalStatus::Failed | ProposalStatus::Missing => {
						return Err(ErrorKind::ProposalDropped.into());
					},
					_ => {}
				}
			}

			if *applied_rx.borrow() >= prop.index {
				return Ok(());
			}

			// The sleep arm re-checks the failure case even while nothing is
			// being applied
			tokio::select! {
				_ = applied_rx.changed() => {},
				_ = tokio::time::sleep(Duration::from_millis(50)) => {}
			}
		}
	}

	/// Executes the side effects a module operation requested. Must run while
	/// the module lock is still held so that persisted state never runs
	/// behind a later mutation
	fn finish_tick(&self, inst: &ConsensusModule, tick: Tick) -> Result<()> {
		if tick.meta {
			self.shared.meta_store.store(inst.meta())?;
		}

		if tick.new_entries {
			self.shared.log.flush()?;
		}

		if tick.committed {
			self.shared.commit_changed.notify();
		}

		let had_messages = !tick.messages.is_empty();
		for msg in tick.messages {
			self.dispatch(msg);
		}

		if tick.meta || tick.new_entries || had_messages {
			self.shared.state_changed.notify();
		}

		Ok(())
	}

	/// Durability is not optional: a vote or an acknowledged entry that we
	/// fail to persist would let us break our promises after a restart, so a
	/// storage failure halts the process
	fn must_persist<T>(&self, result: Result<T>) -> T {
		match result {
			Ok(v) => v,
			Err(e) => {
				// The module lock may be held here, so nothing that touches
				// the module again (not even to log our own id)
				error!("halting on persistence failure: {}", e);
				std::process::abort();
			}
		}
	}

	fn dispatch(&self, msg: Message) {
		match msg.body {
			MessageBody::RequestVote(ref req) => {
				for to in msg.to.iter().cloned() {
					let server = self.clone();
					let req = req.clone();

					tokio::spawn(async move {
						let result = tokio::time::timeout(
							server.shared.rpc_timeout,
							server.shared.client.request_vote(to, req)).await;

						match result {
							Ok(Ok(resp)) => {
								let mut inst = server.shared.inst.lock().unwrap();
								let mut tick = Tick::empty();
								inst.request_vote_callback(to, resp, &mut tick);
								server.must_persist(server.finish_tick(&inst, tick));
							},
							Ok(Err(e)) => {
								debug!("request_vote to {} failed: {}", to, e);
							},
							Err(_) => {
								debug!("request_vote to {} timed out", to);
							}
						}
					});
				}
			},

			MessageBody::AppendEntries(ref req, last_index) => {
				for to in msg.to.iter().cloned() {
					let server = self.clone();
					let req = req.clone();

					tokio::spawn(async move {
						let result = tokio::time::timeout(
							server.shared.rpc_timeout,
							server.shared.client.append_entries(to, req)).await;

						let mut inst = server.shared.inst.lock().unwrap();
						let mut tick = Tick::empty();

						match result {
							Ok(Ok(resp)) => {
								inst.append_entries_callback(to, last_index, resp, &mut tick);
							},
							Ok(Err(e)) => {
								debug!("append_entries to {} failed: {}", to, e);
								inst.append_entries_noresponse(to, &mut tick);
							},
							Err(_) => {
								debug!("append_entries to {} timed out", to);
								inst.append_entries_noresponse(to, &mut tick);
							}
						}

						server.must_persist(server.finish_tick(&inst, tick));
					});
				}
			}
		}
	}

	/// The clock of the server: runs elections and heartbeats when the module
	/// says they are due, sleeping exactly as long as it is told to
	async fn run_cycle(self) {
		loop {
			let wait = {
				let mut inst = self.shared.inst.lock().unwrap();
				let mut tick = Tick::empty();
				inst.cycle(&mut tick);
				let wait = tick.next_tick.unwrap_or(Duration::from_millis(100));
				self.must_persist(self.finish_tick(&inst, tick));
				wait
			};

			tokio::select! {
				_ = tokio::time::sleep(wait) => {},
				_ = self.shared.state_changed.wait() => {}
			}
		}
	}

	/// Feeds committed entries to the state machine, strictly in log order,
	/// exactly once each. The module lock is never held during `apply`
	async fn run_apply(self) {
		loop {
			loop {
				let commit_index = self.commit_index();
				let applied = *self.shared.applied_rx.borrow();
				if applied >= commit_index {
					break;
				}

				let next = applied + 1;
				let entry = self.shared.log.entry(next)
					.expect("committed entry missing from the log");

				if let LogEntryData::Command(ref data) = entry.data {
					if let Err(e) = self.shared.state_machine.apply(next, data) {
						error!("server {}: halting on state machine failure at index {}: {}",
							self.id(), next, e);
						std::process::abort();
					}
				}

				self.shared.applied_tx.send(next).ok();
			}

			self.shared.commit_changed.wait().await;
		}
	}
}


#[async_trait]
impl ServerService for Server {

	async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
		let res = {
			let mut inst = self.shared.inst.lock().unwrap();
			let mut tick = Tick::empty();
			let res = inst.request_vote(req, &mut tick);
			self.must_persist(self.finish_tick(&inst, tick));
			res
		};

		// The metadata store flushed above, which is what the wrapper wants
		// to hear before it lets the response out
		Ok(res.persisted())
	}

	async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
		let constraint = {
			let mut inst = self.shared.inst.lock().unwrap();
			let mut tick = Tick::empty();
			// Even a rejected request may have bumped our term
			let res = inst.append_entries(req, &mut tick);
			self.must_persist(self.finish_tick(&inst, tick));
			res?
		};

		match constraint.poll(&*self.shared.log) {
			Ok(resp) => Ok(resp),
			Err(_) => {
				// finish_tick flushed everything this response acknowledges
				bail!("log flush did not cover the acknowledged entries");
			}
		}
	}
}
