use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::*;
use crate::log::LogStorage;
use crate::protos::*;
use crate::rpc::{marshal, unmarshal};


/// Durable home of the (current_term, voted_for) pair
/// Implementations must be crash-atomic: a store that fails midway leaves the
/// previous value readable
pub trait MetadataStore: Send + Sync {
	fn store(&self, meta: &Metadata) -> Result<()>;
}


/// Metadata kept only in memory. For tests and demo clusters that accept
/// losing everything on restart
pub struct MemoryMetadataStore {
	last: Mutex<Metadata>
}

impl MemoryMetadataStore {
	pub fn new() -> Self {
		MemoryMetadataStore { last: Mutex::new(Metadata::default()) }
	}

	pub fn read(&self) -> Metadata {
		self.last.lock().unwrap().clone()
	}
}

impl MetadataStore for MemoryMetadataStore {
	fn store(&self, meta: &Metadata) -> Result<()> {
		*self.last.lock().unwrap() = meta.clone();
		Ok(())
	}
}


/// Metadata persisted as a single MessagePack blob, replaced atomically on
/// every store
pub struct MetadataFile {
	path: PathBuf
}

impl MetadataFile {
	/// Opens the file, recovering the last stored metadata (or the defaults
	/// for a server that has never run before)
	pub fn open(path: &Path) -> Result<(MetadataFile, Metadata)> {
		let store = MetadataFile { path: path.to_owned() };

		let meta = if path.exists() {
			let data = std::fs::read(path)?;
			unmarshal(&data).chain_err(|| ErrorKind::Corrupt(
				format!("unreadable metadata file {:?}", path)))?
		} else {
			Metadata::default()
		};

		Ok((store, meta))
	}
}

impl MetadataStore for MetadataFile {
	fn store(&self, meta: &Metadata) -> Result<()> {
		let data = marshal(meta)?;
		base::fs::write_atomic(&self.path, &data)?;
		Ok(())
	}
}


/// Bytes in front of every record: u32 payload length, u32 crc32c of the
/// payload
const FRAME_HEADER_SIZE: usize = 8;

fn frame_entry(entry: &LogEntry, out: &mut Vec<u8>) -> Result<()> {
	let payload = marshal(entry)?;

	let mut header = [0u8; FRAME_HEADER_SIZE];
	LittleEndian::write_u32(&mut header[0..4], payload.len() as u32);
	LittleEndian::write_u32(&mut header[4..8], crc32c::crc32c(&payload));

	out.extend_from_slice(&header);
	out.extend_from_slice(&payload);
	Ok(())
}


struct FileLogState {
	file: File,

	/// All entries of the log, indices 1..=len
	entries: Vec<Arc<LogEntry>>,

	/// How many of `entries` are on disk and synced
	persisted: usize,

	/// A truncation happened since the last flush, so the file must be
	/// rewritten rather than appended to
	rewrite_needed: bool
}

/// Append-only log file of checksummed, length-prefixed MessagePack records
///
/// Appends and truncations are buffered in memory and only touch the disk in
/// `flush`: appends go to the end of the file followed by an fsync, while a
/// truncation rewrites the whole retained prefix through an atomic file
/// replacement. Recovery scans records until end of file or the first record
/// that is short or fails its checksum, which is taken to be a torn write
/// from a crash mid-append and discarded
pub struct FileLog {
	path: PathBuf,
	state: Mutex<FileLogState>
}

impl FileLog {

	pub fn open(path: &Path) -> Result<FileLog> {
		let mut entries: Vec<Arc<LogEntry>> = vec![];

		if path.exists() {
			let data = std::fs::read(path)?;
			let mut offset = 0usize;

			loop {
				if offset + FRAME_HEADER_SIZE > data.len() {
					break;
				}

				let len = LittleEndian::read_u32(&data[offset..offset + 4]) as usize;
				let sum = LittleEndian::read_u32(&data[offset + 4..offset + 8]);

				let start = offset + FRAME_HEADER_SIZE;
				if start + len > data.len() {
					break;
				}

				let payload = &data[start..start + len];
				if crc32c::crc32c(payload) != sum {
					break;
				}

				let entry: LogEntry = match unmarshal(payload) {
					Ok(e) => e,
					Err(_) => break
				};

				// The file is only ever appended to or atomically rewritten,
				// so a gap can't be explained by a torn tail
				if entry.index != entries.len() as LogIndex + 1 {
					return Err(ErrorKind::Corrupt(format!(
						"log file {:?} skips from index {} to {}",
						path, entries.len(), entry.index)).into());
				}

				entries.push(Arc::new(entry));
				offset = start + len;
			}

			if offset < data.len() {
				warn!("discarding {} bytes of torn log tail in {:?}",
					data.len() - offset, path);

				let file = OpenOptions::new().write(true).open(path)?;
				file.set_len(offset as u64)?;
				file.sync_all()?;
			}
		}

		let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;

		let persisted = entries.len();
		Ok(FileLog {
			path: path.to_owned(),
			state: Mutex::new(FileLogState {
				file,
				entries,
				persisted,
				rewrite_needed: false
			})
		})
	}
}

impl LogStorage for FileLog {

	fn last_index(&self) -> LogIndex {
		self.state.lock().unwrap().entries.len() as LogIndex
	}

	fn term(&self, index: LogIndex) -> Option<Term> {
		if index == 0 {
			return Some(0);
		}

		self.state.lock().unwrap().entries
			.get((index - 1) as usize)
			.map(|e| e.term)
	}

	fn entry(&self, index: LogIndex) -> Option<Arc<LogEntry>> {
		if index == 0 {
			return None;
		}

		self.state.lock().unwrap().entries
			.get((index - 1) as usize)
			.cloned()
	}

	fn append(&self, entry: LogEntry) {
		let mut state = self.state.lock().unwrap();
		assert_eq!(entry.index, state.entries.len() as LogIndex + 1);
		state.entries.push(Arc::new(entry));
	}

	fn truncate_suffix(&self, start_index: LogIndex) {
		assert!(start_index >= 1);

		let mut state = self.state.lock().unwrap();
		state.entries.truncate((start_index - 1) as usize);
		state.rewrite_needed = true;
	}

	fn match_index(&self) -> LogIndex {
		let state = self.state.lock().unwrap();
		std::cmp::min(state.persisted, state.entries.len()) as LogIndex
	}

	fn flush(&self) -> Result<()> {
		let mut state = self.state.lock().unwrap();

		if state.rewrite_needed {
			let mut data = vec![];
			for entry in state.entries.iter() {
				frame_entry(entry, &mut data)?;
			}

			base::fs::write_atomic(&self.path, &data)?;

			// The old handle still points at the replaced file
			state.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
			state.rewrite_needed = false;
		} else if state.persisted < state.entries.len() {
			let mut data = vec![];
			for entry in state.entries[state.persisted..].iter() {
				frame_entry(entry, &mut data)?;
			}

			state.file.write_all(&data)?;
			state.file.sync_data()?;
		}

		state.persisted = state.entries.len();
		Ok(())
	}
}
