use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base::fs::DirLock;

use crate::config::Config;
use crate::consensus::ConsensusModule;
use crate::errors::*;
use crate::log::LogStorage;
use crate::protos::*;
use crate::rpc::Client;
use crate::server::Server;
use crate::state_machine::StateMachine;
use crate::storage::{FileLog, MetadataFile};


pub struct NodeConfig {
	/// Existing directory holding (or about to hold) this server's durable
	/// state. Locked for the lifetime of the node
	pub dir: PathBuf,

	pub config: Config,

	pub client: Arc<dyn Client>,

	pub state_machine: Arc<dyn StateMachine>,

	/// Index up to which the state machine has already seen commands (0 for
	/// a state machine that starts empty on every boot)
	pub last_applied: LogIndex
}

/// A fully bootstrapped server: durable state recovered from disk, consensus
/// tasks running. Dropping the node releases the directory lock but does not
/// stop the spawned tasks
pub struct Node {
	pub id: ServerId,
	pub server: Server,
	_dir_lock: DirLock
}

impl Node {

	/// Must be called from within a tokio runtime
	pub fn start(config: NodeConfig) -> Result<Node> {
		config.config.validate()?;

		let dir_lock = DirLock::open(&config.dir)?;

		let (meta_file, meta) = MetadataFile::open(&config.dir.join("meta"))?;
		let log = Arc::new(FileLog::open(&config.dir.join("log"))?);

		info!("server {}: recovered term={} voted_for={:?} last_log_index={}",
			config.config.id, meta.current_term, meta.voted_for, log.last_index());

		let id = config.config.id;
		let rpc_timeout = Duration::from_millis(config.config.heartbeat_interval_ms);

		let module = ConsensusModule::new(
			id,
			config.config.member_ids(),
			meta,
			log.clone(),
			config.config.consensus(),
			Instant::now());

		let server = Server::new(
			module,
			log,
			Arc::new(meta_file),
			config.client,
			config.state_machine,
			config.last_applied,
			rpc_timeout);

		server.start();

		Ok(Node { id, server, _dir_lock: dir_lock })
	}
}
