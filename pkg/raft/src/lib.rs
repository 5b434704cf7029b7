#[macro_use] extern crate serde_derive;
#[macro_use] extern crate error_chain;
#[macro_use] extern crate log as log_facade;


pub mod errors {
	use crate::protos::ServerId;

	error_chain! {
		foreign_links {
			Io(::std::io::Error);
		}

		errors {
			/// The operation requires a leader and this server currently isn't one
			NotLeader(leader_hint: Option<ServerId>) {
				description("not the leader")
				display("not the leader (hint: {:?})", leader_hint)
			}

			/// The boot configuration can not describe a usable cluster
			ConfigInvalid(reason: String) {
				description("invalid configuration")
				display("invalid configuration: {}", reason)
			}

			/// On-disk state failed validation while being read back
			Corrupt(reason: String) {
				description("corrupt persistent state")
				display("corrupt persistent state: {}", reason)
			}

			/// A proposed entry was truncated by a newer leader and will never commit
			ProposalDropped {
				description("proposal dropped")
				display("proposal dropped")
			}
		}
	}
}

mod sync;
pub mod protos;
pub mod config;
pub mod rpc;
pub mod state_machine;

pub mod log;
mod state;
pub mod constraint;
pub mod consensus;
pub mod storage;
pub mod server;
pub mod node;
