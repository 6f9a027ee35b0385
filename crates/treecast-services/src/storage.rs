//! Flat-namespace file storage.
//!
//! Every file a station keeps (data files and their `.mkl` trees) lives in
//! one directory and is addressed by a short name. The traits let the
//! session layer run against any backend; `DirStorage` is the host one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use treecast_core::wire::{legal_filename_char, MAX_FILENAME_LENGTH};

/// An open file handle.
pub trait StorageFile: Read + Write + Seek {
    /// Flush buffered writes to durable storage.
    fn sync(&mut self) -> io::Result<()>;
    /// Current file size in bytes.
    fn len(&self) -> io::Result<u64>;

    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// A directory of named files.
pub trait Storage {
    type File: StorageFile;

    /// Open an existing file for reading and writing.
    fn open(&self, name: &str) -> io::Result<Self::File>;
    /// Create a file, truncating any existing one, for reading and writing.
    fn create(&self, name: &str) -> io::Result<Self::File>;
    fn exists(&self, name: &str) -> bool;
    /// Names of all files, sorted.
    fn names(&self) -> io::Result<Vec<String>>;
    fn remove(&self, name: &str) -> io::Result<()>;
}

/// Create `name` filled with `size` zero bytes. Refuses to overwrite.
pub fn create_zeroed<S: Storage>(storage: &S, name: &str, size: u64) -> io::Result<S::File> {
    if storage.exists(name) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("refusing to overwrite {name}"),
        ));
    }
    let mut file = storage.create(name)?;
    let zeros = [0u8; 512];
    let mut left = size;
    while left > 0 {
        let n = left.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..n])?;
        left -= n as u64;
    }
    file.sync()?;
    file.rewind()?;
    Ok(file)
}

/// Check that `name` can be stored: non-empty, short enough, legal characters only.
pub fn validate_name(name: &str) -> io::Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_FILENAME_LENGTH
        && name.bytes().all(legal_filename_char)
        && name != "."
        && name != "..";
    if ok {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid file name: {name:?}"),
        ))
    }
}

/// Read until `buf` is full or the source ends. Returns the bytes read.
pub fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Directory backend ─────────────────────────────────────────────────────────

impl StorageFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}

/// Storage backed by a single host directory.
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    /// Use `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> io::Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl Storage for DirStorage {
    type File = File;

    fn open(&self, name: &str) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(self.path(name)?)
    }

    fn create(&self, name: &str) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path(name)?)
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.path(name)?)
    }
}
