use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::consensus::ConsensusConfig;
use crate::errors::*;
use crate::protos::ServerId;


/// Address book entry for one other server in the cluster
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerDescriptor {
	pub id: ServerId,
	pub addr: String
}

/// Boot configuration of a single server. Read once at startup and immutable
/// afterwards; the roster in particular never changes at runtime
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
	/// Our own id. Must not collide with any peer
	pub id: ServerId,

	/// Every *other* server in the cluster
	#[serde(default)]
	pub peers: Vec<PeerDescriptor>,

	#[serde(default = "default_election_timer_base_ms")]
	pub election_timer_base_ms: u64,

	#[serde(default = "default_election_timer_fluctuate_ms")]
	pub election_timer_fluctuate_ms: u64,

	#[serde(default = "default_heartbeat_interval_ms")]
	pub heartbeat_interval_ms: u64,

	#[serde(default = "default_max_entries_per_append")]
	pub max_entries_per_append: usize
}

fn default_election_timer_base_ms() -> u64 { 150 }
fn default_election_timer_fluctuate_ms() -> u64 { 150 }
fn default_heartbeat_interval_ms() -> u64 { 50 }
fn default_max_entries_per_append() -> usize { 5 }

impl Config {

	pub fn from_file(path: &Path) -> Result<Config> {
		let text = std::fs::read_to_string(path)?;
		let config: Config = toml::from_str(&text)
			.map_err(|e| ErrorKind::ConfigInvalid(format!("{}", e)))?;

		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.id == 0 {
			bail!(ErrorKind::ConfigInvalid("server ids start at 1".into()));
		}

		let mut seen = HashSet::new();
		seen.insert(self.id);
		for peer in &self.peers {
			if peer.id == 0 {
				bail!(ErrorKind::ConfigInvalid("server ids start at 1".into()));
			}
			if !seen.insert(peer.id) {
				bail!(ErrorKind::ConfigInvalid(
					format!("server id {} appears more than once", peer.id)));
			}
		}

		if self.max_entries_per_append == 0 {
			bail!(ErrorKind::ConfigInvalid("max_entries_per_append must be positive".into()));
		}

		// A leader that can't outpace the election timer will be deposed by
		// its own followers
		if self.heartbeat_interval_ms >= self.election_timer_base_ms {
			bail!(ErrorKind::ConfigInvalid(
				"heartbeat interval must be well below the election timer base".into()));
		}

		Ok(())
	}

	/// Ids of every server in the cluster, ourselves included
	pub fn member_ids(&self) -> HashSet<ServerId> {
		let mut ids: HashSet<ServerId> = self.peers.iter().map(|p| p.id).collect();
		ids.insert(self.id);
		ids
	}

	pub fn consensus(&self) -> ConsensusConfig {
		ConsensusConfig {
			election_timeout_base: Duration::from_millis(self.election_timer_base_ms),
			election_timeout_fluctuate: Duration::from_millis(self.election_timer_fluctuate_ms),
			heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
			max_entries_per_append: self.max_entries_per_append
		}
	}
}
