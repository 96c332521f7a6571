//! # cellar-fs
//!
//! A capability interface over the filesystem. The store takes an
//! `Arc<dyn Fs>` at open time instead of calling into `std::fs` directly, so
//! the whole engine runs unmodified against [`MemFs`] in tests and several
//! stores can coexist in one process.

mod mem;
mod os;

pub use mem::MemFs;
pub use os::OsFs;

use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use cellar_core::FileType;

/// Readable, seekable stream handed out by [`Fs::open`].
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Metadata for one filesystem entry. `stat` does not follow symlinks; a
/// symlink stats as [`FileType::Symlink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }
}

/// One entry returned by [`Fs::read_dir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub metadata: Metadata,
}

/// One entry yielded by [`Fs::walk`]: the absolute path plus its metadata.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: PathBuf,
    pub metadata: Metadata,
}

/// Include matcher for [`Fs::walk`]: entries for which `matches` returns
/// false are skipped (directories are still descended into).
pub trait PathMatcher: Sync {
    fn matches(&self, relative_path: &str) -> bool;
}

impl<F: Fn(&str) -> bool + Sync> PathMatcher for F {
    fn matches(&self, relative_path: &str) -> bool {
        self(relative_path)
    }
}

/// Options for [`Fs::walk`].
#[derive(Default)]
pub struct WalkOptions<'a> {
    pub matcher: Option<&'a dyn PathMatcher>,
    /// Upper bound on concurrent directory reads. Advisory; implementations
    /// may walk sequentially.
    pub max_concurrency: usize,
}

/// Flags for [`Fs::open_with_flags`].
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    pub create: bool,
    pub truncate: bool,
    pub mode: u32,
}

/// The filesystem operations the store engine needs.
///
/// All paths are absolute from the caller's point of view. Implementations
/// must be usable from multiple threads.
pub trait Fs: Send + Sync {
    /// Create (or truncate) a file for writing.
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Open a file for reading. Symlinks are followed.
    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    /// Open a file for writing with explicit flags and permissions.
    fn open_with_flags(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn Write + Send>>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Remove a file or directory tree. Succeeds when the path is absent.
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    fn stat(&self, path: &Path) -> io::Result<Metadata>;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Write a whole file and flush it durably.
    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()>;

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn symlink(&self, target: &str, link: &Path) -> io::Result<()>;

    /// Read a symlink's target without following it.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Depth-first traversal of the tree rooted at `base`, yielding every
    /// entry beneath it (not `base` itself).
    fn walk(&self, base: &Path, options: &WalkOptions<'_>) -> io::Result<Vec<WalkEntry>>;
}
