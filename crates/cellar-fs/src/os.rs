use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};

use cellar_core::FileType;

use crate::{DirEntry, Fs, Metadata, OpenFlags, ReadSeek, WalkEntry, WalkOptions};

/// The operating-system filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl OsFs {
    pub fn new() -> Self {
        Self
    }
}

fn metadata_from_std(meta: &fs::Metadata) -> Metadata {
    let file_type = if meta.file_type().is_symlink() {
        FileType::Symlink
    } else if meta.is_dir() {
        FileType::Dir
    } else {
        FileType::Regular
    };

    let mod_time = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH);

    Metadata {
        file_type,
        size: meta.len(),
        mode: mode_of(meta),
        mod_time,
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_meta: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

impl Fs for OsFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(File::create(path)?))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_with_flags(&self, path: &Path, flags: OpenFlags) -> io::Result<Box<dyn Write + Send>> {
        let mut options = OpenOptions::new();
        options
            .write(true)
            .create(flags.create)
            .truncate(flags.truncate);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(flags.mode);
        }
        Ok(Box::new(options.open(path)?))
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        Ok(metadata_from_std(&fs::symlink_metadata(path)?))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                metadata: metadata_from_std(&entry.path().symlink_metadata()?),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::create_dir(path)?;
        self.chmod(path, mode)
    }

    fn mkdir_all(&self, path: &Path, _mode: u32) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut file = File::create(path)?;
        set_mode(&file, mode)?;
        file.write_all(data)?;
        file.sync_all()
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    #[cfg(unix)]
    fn symlink(&self, target: &str, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &str, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks are not supported on this platform",
        ))
    }

    fn read_link(&self, path: &Path) -> io::Result<std::path::PathBuf> {
        fs::read_link(path)
    }

    fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            Ok(())
        }
    }

    fn walk(&self, base: &Path, options: &WalkOptions<'_>) -> io::Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(base)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(io::Error::other)?;
            if let Some(matcher) = options.matcher {
                let relative = entry
                    .path()
                    .strip_prefix(base)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                if !matcher.matches(&relative) {
                    continue;
                }
            }
            entries.push(WalkEntry {
                path: entry.path().to_path_buf(),
                metadata: metadata_from_std(&entry.metadata().map_err(io::Error::other)?),
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let fs = OsFs::new();
        let path = temp.path().join("hello.txt");

        fs.write_file(&path, b"hello", 0o600).unwrap();
        assert_eq!(fs.read_file(&path).unwrap(), b"hello");

        let meta = fs.stat(&path).unwrap();
        assert_eq!(meta.file_type, FileType::Regular);
        assert_eq!(meta.size, 5);
    }

    #[test]
    fn test_walk_with_matcher() {
        let temp = TempDir::new().unwrap();
        let fs = OsFs::new();
        fs.mkdir_all(&temp.path().join("sub"), 0o700).unwrap();
        fs.write_file(&temp.path().join("keep.txt"), b"k", 0o600)
            .unwrap();
        fs.write_file(&temp.path().join("sub/skip.log"), b"s", 0o600)
            .unwrap();

        let matcher = |path: &str| !path.ends_with(".log");
        let options = WalkOptions {
            matcher: Some(&matcher),
            max_concurrency: 1,
        };
        let entries = fs.walk(temp.path(), &options).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"keep.txt".to_string()));
        assert!(names.contains(&"sub".to_string()));
        assert!(!names.contains(&"skip.log".to_string()));
    }

    #[test]
    fn test_remove_all_missing_path_ok() {
        let temp = TempDir::new().unwrap();
        let fs = OsFs::new();
        fs.remove_all(&temp.path().join("nope")).unwrap();
    }
}
