#[macro_use] extern crate log;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{App, Arg, ArgMatches};

use raft::config::{Config, PeerDescriptor};
use raft::errors::*;
use raft::node::{Node, NodeConfig};
use raft::rpc::{marshal, LocalNetwork};
use raft::state_machine::{KeyValueOperation, MemoryKVStateMachine};


/*
	Demonstration of a full consensus round trip without leaving the process:
	all servers run in one runtime connected by the in-process transport, each
	with its own data directory, replicating writes into its own key/value
	machine. Kill and restart the process with the same --dir and every server
	recovers its term, vote and log from disk.
*/


async fn wait_for_leader(nodes: &[(Node, Arc<MemoryKVStateMachine>)]) -> Result<usize> {
	let deadline = Instant::now() + Duration::from_secs(10);

	loop {
		for (i, (node, _)) in nodes.iter().enumerate() {
			if node.server.is_leader() {
				return Ok(i);
			}
		}

		if Instant::now() > deadline {
			return Err("no leader elected within 10s".into());
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
	}
}

async fn main_task(matches: ArgMatches<'_>) -> Result<()> {
	let dir = Path::new(matches.value_of("dir").unwrap()).to_owned();

	let num_servers: u64 = matches.value_of("servers").unwrap()
		.parse().map_err(|_| Error::from("--servers must be an integer"))?;
	let num_commands: usize = matches.value_of("commands").unwrap()
		.parse().map_err(|_| Error::from("--commands must be an integer"))?;

	if num_servers == 0 {
		return Err("need at least one server".into());
	}

	let network = LocalNetwork::new();
	let mut nodes = vec![];

	for id in 1..=num_servers {
		let node_dir = dir.join(format!("server-{}", id));
		std::fs::create_dir_all(&node_dir)?;

		let peers = (1..=num_servers)
			.filter(|p| *p != id)
			.map(|p| PeerDescriptor { id: p, addr: format!("local:{}", p) })
			.collect();

		let config = Config {
			id,
			peers,
			election_timer_base_ms: 150,
			election_timer_fluctuate_ms: 150,
			heartbeat_interval_ms: 50,
			max_entries_per_append: 5
		};

		let state_machine = Arc::new(MemoryKVStateMachine::new());

		let node = Node::start(NodeConfig {
			dir: node_dir,
			config,
			client: network.clone(),
			state_machine: state_machine.clone(),
			last_applied: 0
		})?;

		network.register(id, Arc::new(node.server.clone()));
		nodes.push((node, state_machine));
	}

	let leader_idx = wait_for_leader(&nodes).await?;
	let leader = &nodes[leader_idx].0;
	info!("server {} is the leader of term {}", leader.id, leader.server.current_term());

	for i in 0..num_commands {
		let op = KeyValueOperation::Set {
			key: format!("key-{}", i).into_bytes(),
			value: format!("value {}", i).into_bytes()
		};

		leader.server.execute(Bytes::from(marshal(&op)?)).await?;
	}

	// Give the followers a moment to catch up before taking stock
	tokio::time::sleep(Duration::from_millis(500)).await;

	for (node, machine) in &nodes {
		println!("server {}: term={} commit_index={} last_applied={} keys={}",
			node.id,
			node.server.current_term(),
			node.server.commit_index(),
			node.server.last_applied(),
			machine.len());
	}

	Ok(())
}

fn main() -> Result<()> {
	env_logger::init();

	let matches = App::new("raft")
		.about("Runs a small in-process consensus cluster")
		.arg(Arg::with_name("dir")
			.long("dir")
			.short("d")
			.value_name("DIRECTORY_PATH")
			.help("An existing directory under which every server keeps its data files")
			.required(true)
			.takes_value(true))
		.arg(Arg::with_name("servers")
			.long("servers")
			.short("n")
			.value_name("COUNT")
			.help("Number of servers in the cluster")
			.default_value("3")
			.takes_value(true))
		.arg(Arg::with_name("commands")
			.long("commands")
			.short("c")
			.value_name("COUNT")
			.help("Number of key/value writes to push through the cluster")
			.default_value("10")
			.takes_value(true))
		.get_matches();

	let runtime = tokio::runtime::Runtime::new()?;
	runtime.block_on(main_task(matches))
}
