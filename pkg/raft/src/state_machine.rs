use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::*;
use crate::protos::LogIndex;
use crate::rpc::unmarshal;


/// The external application fed by the apply loop
///
/// `apply` is invoked exactly once per committed log index, in ascending
/// index order, and never concurrently with itself
pub trait StateMachine: Send + Sync {
	fn apply(&self, index: LogIndex, command: &[u8]) -> Result<()>;
}


/// Operations understood by the in-memory key/value machine, marshaled into
/// opaque log commands by whoever proposes them
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum KeyValueOperation {
	Set { key: Vec<u8>, value: Vec<u8> },
	Delete { key: Vec<u8> }
}


/// Simple key/value store used by the demo binary and tests
pub struct MemoryKVStateMachine {
	data: Mutex<HashMap<Vec<u8>, Vec<u8>>>
}

impl MemoryKVStateMachine {
	pub fn new() -> Self {
		MemoryKVStateMachine { data: Mutex::new(HashMap::new()) }
	}

	pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.data.lock().unwrap().get(key).cloned()
	}

	pub fn len(&self) -> usize {
		self.data.lock().unwrap().len()
	}
}

impl StateMachine for MemoryKVStateMachine {
	fn apply(&self, _index: LogIndex, command: &[u8]) -> Result<()> {
		let op: KeyValueOperation = unmarshal(command)?;

		let mut data = self.data.lock().unwrap();
		match op {
			KeyValueOperation::Set { key, value } => {
				data.insert(key, value);
			},
			KeyValueOperation::Delete { key } => {
				data.remove(&key);
			}
		}

		Ok(())
	}
}
