use std::collections::BTreeMap;
use std::io::{self, Cursor, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use cellar_core::FileType;

use crate::{DirEntry, Fs, Metadata, OpenFlags, ReadSeek, WalkEntry, WalkOptions};

const MAX_SYMLINK_DEPTH: usize = 40;

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        mode: u32,
        mod_time: DateTime<Utc>,
    },
    Dir {
        mode: u32,
    },
    Symlink {
        target: String,
    },
}

/// An in-memory filesystem for tests: fast, deterministic, and safe to use
/// from multiple threads. Clones share the same tree.
#[derive(Debug, Clone)]
pub struct MemFs {
    nodes: Arc<Mutex<BTreeMap<PathBuf, Node>>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push("/"),
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push("/");
    }
    normalized
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file or directory: {}", path.display()),
    )
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::from("/"), Node::Dir { mode: 0o755 });
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }

    fn require_parent(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> io::Result<()> {
        match path.parent() {
            None => Ok(()),
            Some(parent) => match nodes.get(&normalize(parent)) {
                Some(Node::Dir { .. }) => Ok(()),
                Some(_) => Err(io::Error::other(format!(
                    "parent is not a directory: {}",
                    parent.display()
                ))),
                None => Err(not_found(parent)),
            },
        }
    }

    /// Follow symlinks until a non-symlink node is reached.
    fn resolve(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> io::Result<PathBuf> {
        let mut current = normalize(path);
        for _ in 0..MAX_SYMLINK_DEPTH {
            match nodes.get(&current) {
                Some(Node::Symlink { target }) => {
                    let target_path = Path::new(target);
                    current = if target_path.is_absolute() {
                        normalize(target_path)
                    } else {
                        let parent = current.parent().unwrap_or(Path::new("/"));
                        normalize(&parent.join(target_path))
                    };
                }
                Some(_) => return Ok(current),
                None => return Err(not_found(&current)),
            }
        }
        Err(io::Error::other(format!(
            "too many levels of symbolic links: {}",
            path.display()
        )))
    }

    fn insert_file(&self, path: &Path, data: Vec<u8>, mode: u32) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        Self::require_parent(&nodes, &path)?;
        nodes.insert(
            path,
            Node::File {
                data,
                mode,
                mod_time: Utc::now(),
            },
        );
        Ok(())
    }

    fn metadata_of(node: &Node) -> Metadata {
        match node {
            Node::File {
                data,
                mode,
                mod_time,
            } => Metadata {
                file_type: FileType::Regular,
                size: data.len() as u64,
                mode: *mode,
                mod_time: *mod_time,
            },
            Node::Dir { mode } => Metadata {
                file_type: FileType::Dir,
                size: 0,
                mode: *mode,
                mod_time: DateTime::<Utc>::UNIX_EPOCH,
            },
            Node::Symlink { target } => Metadata {
                file_type: FileType::Symlink,
                size: target.len() as u64,
                mode: 0o777,
                mod_time: DateTime::<Utc>::UNIX_EPOCH,
            },
        }
    }
}

/// Buffering writer that commits its contents to the tree on flush and drop.
struct MemWriter {
    fs: MemFs,
    path: PathBuf,
    buf: Vec<u8>,
    mode: u32,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.fs.insert_file(&self.path, self.buf.clone(), self.mode)
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl Fs for MemFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        Self::require_parent(&nodes, &path)?;
        drop(nodes);
        Ok(Box::new(MemWriter {
            fs: self.clone(),
            path,
            buf: Vec::new(),
            mode: 0o600,
        }))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        let nodes = self.nodes.lock().unwrap();
        let resolved = Self::resolve(&nodes, path)?;
        match nodes.get(&resolved) {
            Some(Node::File { data, .. }) => Ok(Box::new(Cursor::new(data.clone()))),
            Some(_) => Err(io::Error::other(format!(
                "not a regular file: {}",
                path.display()
            ))),
            None => Err(not_found(path)),
        }
    }

    fn open_with_flags(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn Write + Send>> {
        let nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        if !flags.create && !nodes.contains_key(&path) {
            return Err(not_found(&path));
        }
        Self::require_parent(&nodes, &path)?;
        drop(nodes);
        Ok(Box::new(MemWriter {
            fs: self.clone(),
            path,
            buf: Vec::new(),
            mode: flags.mode,
        }))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                let has_children = nodes
                    .keys()
                    .any(|key| key != &path && key.starts_with(&path));
                if has_children {
                    return Err(io::Error::other(format!(
                        "directory not empty: {}",
                        path.display()
                    )));
                }
            }
            Some(_) => {}
            None => return Err(not_found(&path)),
        }
        nodes.remove(&path);
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        nodes.retain(|key, _| !key.starts_with(&path));
        Ok(())
    }

    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(&normalize(path))
            .map(Self::metadata_of)
            .ok_or_else(|| not_found(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(_) => {
                return Err(io::Error::other(format!(
                    "not a directory: {}",
                    path.display()
                )))
            }
            None => return Err(not_found(&path)),
        }

        let mut entries = Vec::new();
        for (key, node) in nodes.iter() {
            if let Ok(remainder) = key.strip_prefix(&path) {
                let mut components = remainder.components();
                if let (Some(Component::Normal(name)), None) =
                    (components.next(), components.next())
                {
                    entries.push(DirEntry {
                        name: name.to_string_lossy().into_owned(),
                        metadata: Self::metadata_of(node),
                    });
                }
            }
        }
        Ok(entries)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        Self::require_parent(&nodes, &path)?;
        if nodes.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("already exists: {}", path.display()),
            ));
        }
        nodes.insert(path, Node::Dir { mode });
        Ok(())
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        let mut current = PathBuf::new();
        for component in path.components() {
            match component {
                Component::RootDir => current.push("/"),
                Component::Normal(part) => {
                    current.push(part);
                    match nodes.get(&current) {
                        Some(Node::Dir { .. }) => {}
                        Some(_) => {
                            return Err(io::Error::other(format!(
                                "not a directory: {}",
                                current.display()
                            )))
                        }
                        None => {
                            nodes.insert(current.clone(), Node::Dir { mode });
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        self.insert_file(path, data.to_vec(), mode)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let nodes = self.nodes.lock().unwrap();
        let resolved = Self::resolve(&nodes, path)?;
        match nodes.get(&resolved) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(_) => Err(io::Error::other(format!(
                "not a regular file: {}",
                path.display()
            ))),
            None => Err(not_found(path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let from = normalize(from);
        let to = normalize(to);
        if !nodes.contains_key(&from) {
            return Err(not_found(&from));
        }
        Self::require_parent(&nodes, &to)?;

        let moved: Vec<(PathBuf, Node)> = nodes
            .iter()
            .filter(|(key, _)| key.starts_with(&from))
            .map(|(key, node)| (key.clone(), node.clone()))
            .collect();
        for (key, node) in moved {
            nodes.remove(&key);
            let suffix = key.strip_prefix(&from).unwrap().to_path_buf();
            nodes.insert(normalize(&to.join(suffix)), node);
        }
        Ok(())
    }

    fn symlink(&self, target: &str, link: &Path) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let link = normalize(link);
        Self::require_parent(&nodes, &link)?;
        if nodes.contains_key(&link) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("already exists: {}", link.display()),
            ));
        }
        nodes.insert(
            link,
            Node::Symlink {
                target: target.to_string(),
            },
        );
        Ok(())
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        let nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        match nodes.get(&path) {
            Some(Node::Symlink { target }) => Ok(PathBuf::from(target)),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a symlink: {}", path.display()),
            )),
            None => Err(not_found(&path)),
        }
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let path = normalize(path);
        match nodes.get_mut(&path) {
            Some(Node::File { mode: m, .. }) | Some(Node::Dir { mode: m }) => {
                *m = mode;
                Ok(())
            }
            Some(Node::Symlink { .. }) => Ok(()),
            None => Err(not_found(&path)),
        }
    }

    fn walk(&self, base: &Path, options: &WalkOptions<'_>) -> io::Result<Vec<WalkEntry>> {
        let nodes = self.nodes.lock().unwrap();
        let base = normalize(base);
        if !nodes.contains_key(&base) {
            return Err(not_found(&base));
        }

        let mut entries = Vec::new();
        for (key, node) in nodes.iter() {
            if key == &base || !key.starts_with(&base) {
                continue;
            }
            if let Some(matcher) = options.matcher {
                let relative = key
                    .strip_prefix(&base)
                    .unwrap_or(key)
                    .to_string_lossy()
                    .replace('\\', "/");
                if !matcher.matches(&relative) {
                    continue;
                }
            }
            entries.push(WalkEntry {
                path: key.clone(),
                metadata: Self::metadata_of(node),
            });
        }
        Ok(entries)
    }
}
