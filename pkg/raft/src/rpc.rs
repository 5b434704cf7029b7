use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::*;
use crate::protos::*;


pub fn marshal<T: Serialize>(obj: &T) -> Result<Vec<u8>> {
	rmp_serde::to_vec_named(obj)
		.map_err(|e| Error::from(format!("marshal failed: {}", e)))
}

pub fn unmarshal<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	rmp_serde::from_slice(data)
		.map_err(|e| Error::from(format!("unmarshal failed: {}", e)))
}


/// Outbound half of the transport. Implementations are expected to be cheap
/// to call concurrently; the server time-boxes every call, so they may block
/// for as long as the network does
#[async_trait]
pub trait Client: Send + Sync {
	async fn request_vote(
		&self, to: ServerId, req: RequestVoteRequest
	) -> Result<RequestVoteResponse>;

	async fn append_entries(
		&self, to: ServerId, req: AppendEntriesRequest
	) -> Result<AppendEntriesResponse>;
}

/// Inbound half of the transport: what a server exposes to its peers
#[async_trait]
pub trait ServerService: Send + Sync {
	async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse>;

	async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;
}


/// In-process transport connecting a set of servers living in one process.
/// Requests and responses make a marshal/unmarshal round trip so that the
/// wire encoding of every field is exercised. Used by tests and the demo
/// cluster binary
pub struct LocalNetwork {
	services: Mutex<HashMap<ServerId, Arc<dyn ServerService>>>
}

impl LocalNetwork {
	pub fn new() -> Arc<LocalNetwork> {
		Arc::new(LocalNetwork { services: Mutex::new(HashMap::new()) })
	}

	pub fn register(&self, id: ServerId, service: Arc<dyn ServerService>) {
		self.services.lock().unwrap().insert(id, service);
	}

	fn route(&self, id: ServerId) -> Result<Arc<dyn ServerService>> {
		self.services.lock().unwrap().get(&id).cloned()
			.ok_or_else(|| Error::from(format!("no route to server {}", id)))
	}
}

#[async_trait]
impl Client for LocalNetwork {
	async fn request_vote(
		&self, to: ServerId, req: RequestVoteRequest
	) -> Result<RequestVoteResponse> {
		let service = self.route(to)?;
		let req = unmarshal(&marshal(&req)?)?;
		let resp = service.request_vote(req).await?;
		unmarshal(&marshal(&resp)?)
	}

	async fn append_entries(
		&self, to: ServerId, req: AppendEntriesRequest
	) -> Result<AppendEntriesResponse> {
		let service = self.route(to)?;
		let req = unmarshal(&marshal(&req)?)?;
		let resp = service.append_entries(req).await?;
		unmarshal(&marshal(&resp)?)
	}
}
