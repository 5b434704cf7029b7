use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;


/// Name of the advisory lock file placed inside a locked data directory
const LOCK_FILE_NAME: &str = "LOCK";


/// An exclusive advisory lock on a directory held for the lifetime of this object
/// Used to guarantee that at most one process is operating on a data directory at a time
pub struct DirLock {
	/// Open handle to the lock file (the lock is attached to its lifetime)
	_file: File,

	/// Path to the directory that we locked
	path: PathBuf
}

impl DirLock {

	pub fn open(path: &Path) -> io::Result<DirLock> {
		if !path.is_dir() {
			return Err(io::Error::new(
				io::ErrorKind::NotFound, format!("no such directory: {:?}", path)));
		}

		let file = OpenOptions::new()
			.create(true).read(true).write(true)
			.open(path.join(LOCK_FILE_NAME))?;

		file.try_lock_exclusive().map_err(|_| io::Error::new(
			io::ErrorKind::AddrInUse, format!("directory already locked: {:?}", path)))?;

		Ok(DirLock { _file: file, path: path.to_owned() })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}


/// Flushes a directory's own metadata (in particular, renames performed in it)
pub fn sync_directory(path: &Path) -> io::Result<()> {
	File::open(path)?.sync_all()
}

/// Replaces the contents of the file at the given path such that a crash at any
/// point leaves either the old contents or the new contents, never a mixture
///
/// The data is first fully written and synced to a sibling temporary file which
/// is then renamed over the destination, followed by a directory sync so that
/// the rename itself is on disk
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
	let dir = path.parent().ok_or_else(|| io::Error::new(
		io::ErrorKind::InvalidInput, "path has no parent directory"))?;

	let mut tmp_path = path.as_os_str().to_owned();
	tmp_path.push(".tmp");
	let tmp_path = PathBuf::from(tmp_path);

	{
		let mut file = File::create(&tmp_path)?;
		file.write_all(data)?;
		file.sync_all()?;
	}

	std::fs::rename(&tmp_path, path)?;
	sync_directory(dir)
}
