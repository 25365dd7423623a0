//! Per-path advisory locking for the FTP file service, plus a thin
//! `std::fs`-backed file handler rooted at a configured directory.
//!
//! This is advisory, not a filesystem-level lock: correctness depends on
//! every caller going through the same pair of [`FileAccessManager`]
//! instances held by [`ThreadSafeFileHandler`].

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result, ResultWrappedExt};

/// A set of normalized-absolute path strings currently held, guarded by a
/// single mutex and condition variable. Two independent instances are used
/// by [`ThreadSafeFileHandler`]: one for read intents, one for write
/// intents.
#[derive(Default)]
pub struct FileAccessManager {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl FileAccessManager {
    pub fn new() -> Self {
        FileAccessManager {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    fn normalize(path: &Path) -> Result<String> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .wrapped(ErrorKind::Io)?
                .join(path)
        };
        Ok(lexically_normalize(&absolute)
            .to_string_lossy()
            .into_owned())
    }

    /// Blocks until `path` is not held by anyone else, then marks it held.
    pub fn lock(&self, path: &Path) -> Result<String> {
        let key = Self::normalize(path)?;
        let mut guard = self.held.lock();
        while guard.contains(&key) {
            self.released.wait(&mut guard);
        }
        guard.insert(key.clone());
        Ok(key)
    }

    /// Releases `key` (as returned by [`lock`](Self::lock)) and wakes one
    /// waiter, if any.
    pub fn unlock(&self, key: &str) {
        self.held.lock().remove(key);
        self.released.notify_one();
    }
}

/// Lexically normalizes `path` (collapses `.`/`..` components without
/// touching the filesystem), mirroring C++'s
/// `std::filesystem::path::lexically_normal`.
fn lexically_normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.into_iter().collect()
}

/// Scoped read/write lock guard over a single path: acquires read-then-write
/// (in that order) on construction and releases in reverse order on every
/// exit path, including early returns and panics.
pub struct PathLockGuard<'a> {
    write_fam: Option<(&'a FileAccessManager, String)>,
    read_fam: Option<(&'a FileAccessManager, String)>,
}

impl<'a> PathLockGuard<'a> {
    /// Acquires only the read lock for `path`.
    pub fn read_only(read_fam: &'a FileAccessManager, path: &Path) -> Result<Self> {
        let key = read_fam.lock(path)?;
        Ok(PathLockGuard {
            write_fam: None,
            read_fam: Some((read_fam, key)),
        })
    }

    /// Acquires the read lock, then the write lock, for `path` (fixed
    /// acquisition order per the file access manager's contract).
    pub fn read_then_write(
        read_fam: &'a FileAccessManager,
        write_fam: &'a FileAccessManager,
        path: &Path,
    ) -> Result<Self> {
        let read_key = read_fam.lock(path)?;
        let write_key = match write_fam.lock(path) {
            Ok(k) => k,
            Err(e) => {
                read_fam.unlock(&read_key);
                return Err(e);
            }
        };
        Ok(PathLockGuard {
            write_fam: Some((write_fam, write_key)),
            read_fam: Some((read_fam, read_key)),
        })
    }
}

impl<'a> Drop for PathLockGuard<'a> {
    fn drop(&mut self) {
        // Release in reverse acquisition order: write before read.
        if let Some((fam, key)) = self.write_fam.take() {
            fam.unlock(&key);
        }
        if let Some((fam, key)) = self.read_fam.take() {
            fam.unlock(&key);
        }
    }
}

/// A thin wrapper over `std::fs`, rooted at a configured directory, with
/// every operation coordinated through a pair of [`FileAccessManager`]s.
/// Paths are rejected with [`ErrorKind::Policy`] if they would resolve
/// outside the root.
pub struct ThreadSafeFileHandler {
    root: PathBuf,
    read_fam: FileAccessManager,
    write_fam: FileAccessManager,
    cwd: Mutex<PathBuf>,
}

impl ThreadSafeFileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ThreadSafeFileHandler {
            root: root.into(),
            read_fam: FileAccessManager::new(),
            write_fam: FileAccessManager::new(),
            cwd: Mutex::new(PathBuf::new()),
        }
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let cwd = self.cwd.lock().clone();
        let joined = self.root.join(&cwd).join(relative);
        let normalized = lexically_normalize(&joined);
        let root_normalized = lexically_normalize(&self.root);
        if !normalized.starts_with(&root_normalized) {
            return Err(Error::simple(ErrorKind::Policy));
        }
        Ok(normalized)
    }

    /// Reads the whole contents of `filename`, under the read lock only.
    pub fn get(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self.resolve(filename)?;
        let _guard = PathLockGuard::read_only(&self.read_fam, &path)?;
        fs::read(&path).wrapped(ErrorKind::Io)
    }

    /// Overwrites `filename` with `contents`, under read-then-write locks.
    pub fn put(&self, filename: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(filename)?;
        let _guard = PathLockGuard::read_then_write(&self.read_fam, &self.write_fam, &path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).wrapped(ErrorKind::Io)?;
        }
        fs::write(&path, contents).wrapped(ErrorKind::Io)
    }

    /// Removes `filename`, under read-then-write locks.
    pub fn delete(&self, filename: &str) -> Result<()> {
        let path = self.resolve(filename)?;
        let _guard = PathLockGuard::read_then_write(&self.read_fam, &self.write_fam, &path)?;
        fs::remove_file(&path).wrapped(ErrorKind::Io)
    }

    /// Creates a directory (and its parents), under read-then-write locks.
    pub fn make_dir(&self, dir_name: &str) -> Result<()> {
        let path = self.resolve(dir_name)?;
        let _guard = PathLockGuard::read_then_write(&self.read_fam, &self.write_fam, &path)?;
        fs::create_dir_all(&path).wrapped(ErrorKind::Io)
    }

    /// Lists filenames in the current directory, under the read lock only.
    pub fn list(&self) -> Result<Vec<String>> {
        let cwd = self.cwd.lock().clone();
        let path = self.resolve(cwd.to_string_lossy().as_ref())?;
        let _guard = PathLockGuard::read_only(&self.read_fam, &path)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&path).wrapped(ErrorKind::Io)? {
            let entry = entry.wrapped(ErrorKind::Io)?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Changes the handler's notion of current directory, relative to the
    /// root. `go_up` moves one component toward the root instead.
    pub fn change_dir(&self, dir_name: &str, go_up: bool) -> Result<()> {
        let mut cwd = self.cwd.lock();
        if go_up {
            cwd.pop();
            return Ok(());
        }
        let candidate = cwd.join(dir_name);
        let resolved = self.resolve(candidate.to_string_lossy().as_ref())?;
        if !resolved.is_dir() {
            return Err(Error::simple(ErrorKind::Policy));
        }
        *cwd = candidate;
        Ok(())
    }

    /// Returns the handler's current directory, relative to the root.
    pub fn pwd(&self) -> String {
        self.cwd.lock().to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn second_locker_waits_for_release() {
        let fam = Arc::new(FileAccessManager::new());
        let path = Path::new("/tmp/tacho-fam-test-file");
        let key = fam.lock(path).unwrap();

        let fam2 = Arc::clone(&fam);
        let path2 = path.to_path_buf();
        let handle = thread::spawn(move || {
            fam2.lock(&path2).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        fam.unlock(&key);
        handle.join().unwrap();
    }

    #[test]
    fn put_then_get_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ThreadSafeFileHandler::new(dir.path());
        handler.put("x.txt", &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(handler.get("x.txt").unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn path_escaping_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ThreadSafeFileHandler::new(dir.path());
        let err = handler.get("../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Policy);
    }

    #[test]
    fn make_dir_then_list_sees_it() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ThreadSafeFileHandler::new(dir.path());
        handler.make_dir("sub").unwrap();
        let names = handler.list().unwrap();
        assert!(names.contains(&"sub".to_owned()));
    }

    #[test]
    fn change_dir_and_pwd_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ThreadSafeFileHandler::new(dir.path());
        handler.make_dir("sub").unwrap();
        handler.change_dir("sub", false).unwrap();
        assert_eq!(handler.pwd(), "sub");
        handler.change_dir("", true).unwrap();
        assert_eq!(handler.pwd(), "");
    }
}
