//! OS file lock guarding an installation directory.
//!
//! Only the locking primitive lives here. Recording who holds the lock is the
//! store's business, see [`RuntimeStore::lock`](super::RuntimeStore::lock).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// The process holding an installation's exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub command: String,
  pub since: DateTime<Utc>,
}

impl LockHolder {
  pub fn current(command: &str) -> Self {
    Self {
      pid: std::process::id(),
      command: command.to_string(),
      since: Utc::now(),
    }
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "{} is busy: {}\nIf no rtsetup process is running, remove {}",
    .install_dir.display(),
    describe_holder(.holder.as_ref()),
    .lock_path.display()
  )]
  Busy {
    install_dir: PathBuf,
    holder: Option<LockHolder>,
    lock_path: PathBuf,
  },

  #[error("failed to {action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn describe_holder(holder: Option<&LockHolder>) -> String {
  match holder {
    Some(h) => format!(
      "`{}` (PID {}) since {}",
      h.command,
      h.pid,
      h.since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ),
    None => "held by another process".to_string(),
  }
}

/// A held lock file. Released when dropped.
#[derive(Debug)]
pub struct InstallLock {
  file: File,
  path: PathBuf,
  recorded: bool,
}

/// Outcome of a non-blocking lock attempt.
pub(crate) enum Attempt {
  Acquired(InstallLock),
  Busy,
}

impl InstallLock {
  /// Try to lock the file at `path`, creating it if needed, without blocking.
  pub(crate) fn try_acquire(path: &Path, mode: LockMode) -> Result<Attempt, StoreLockError> {
    let io_err = |action: &'static str| {
      move |source: io::Error| StoreLockError::Io {
        action,
        path: path.to_path_buf(),
        source,
      }
    };

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(io_err("create directory for"))?;
    }
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(path)
      .map_err(io_err("open"))?;

    match os_lock(&file, mode) {
      Ok(()) => Ok(Attempt::Acquired(Self {
        file,
        path: path.to_path_buf(),
        recorded: false,
      })),
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Attempt::Busy),
      Err(source) => Err(StoreLockError::Io {
        action: "lock",
        path: path.to_path_buf(),
        source,
      }),
    }
  }

  /// Replace the lock file's content through the held handle. The content
  /// is erased again when the lock is released.
  ///
  /// On Windows the lock is mandatory, so a second handle could not write it.
  pub(crate) fn record(&mut self, content: &[u8]) -> io::Result<()> {
    self.recorded = true;
    self.file.set_len(0)?;
    self.file.seek(SeekFrom::Start(0))?;
    self.file.write_all(content)?;
    self.file.flush()
  }

  /// Read the lock file's content through the held handle.
  #[cfg(test)]
  fn read(&self) -> io::Result<String> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(content)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for InstallLock {
  fn drop(&mut self) {
    // A stale record would name a process that no longer holds the lock.
    if self.recorded {
      let _ = self.file.set_len(0);
    }
  }
}

#[cfg(unix)]
fn os_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file.as_fd(), operation).map_err(io::Error::from)
}

#[cfg(windows)]
fn os_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
  if mode == LockMode::Exclusive {
    flags |= LOCKFILE_EXCLUSIVE_LOCK;
  }

  // SAFETY: the handle belongs to an open file and a zeroed OVERLAPPED is
  // valid for a synchronous call.
  let locked = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
  };
  if locked != 0 {
    return Ok(());
  }

  let err = io::Error::last_os_error();
  if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
    Err(io::Error::from(io::ErrorKind::WouldBlock))
  } else {
    Err(err)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn acquire(path: &Path, mode: LockMode) -> Option<InstallLock> {
    match InstallLock::try_acquire(path, mode).unwrap() {
      Attempt::Acquired(lock) => Some(lock),
      Attempt::Busy => None,
    }
  }

  #[test]
  fn shared_locks_coexist() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested/.lock");
    let first = acquire(&path, LockMode::Shared).unwrap();
    assert!(acquire(&path, LockMode::Shared).is_some());
    assert!(first.path().exists());
  }

  #[cfg(unix)]
  #[test]
  fn exclusive_lock_excludes_everyone() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".lock");
    let held = acquire(&path, LockMode::Exclusive).unwrap();

    assert!(acquire(&path, LockMode::Exclusive).is_none());
    assert!(acquire(&path, LockMode::Shared).is_none());

    drop(held);
    assert!(acquire(&path, LockMode::Exclusive).is_some());
  }

  #[test]
  fn content_round_trips_through_the_handle() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(".lock");
    let mut lock = acquire(&path, LockMode::Exclusive).unwrap();
    lock.record(b"a longer first record").unwrap();
    lock.record(b"short").unwrap();
    assert_eq!(lock.read().unwrap(), "short");

    drop(lock);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
  }

  #[test]
  fn busy_error_names_the_holder() {
    let holder = LockHolder {
      pid: 42,
      command: "install".to_string(),
      since: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").unwrap().with_timezone(&Utc),
    };
    let err = StoreLockError::Busy {
      install_dir: PathBuf::from("/opt/runtime"),
      holder: Some(holder),
      lock_path: PathBuf::from("/opt/runtime/.rtsetup/.lock"),
    };
    let message = err.to_string();
    assert!(message.starts_with("/opt/runtime is busy: `install` (PID 42) since 2026-01-02T03:04:05Z"));
    assert!(message.contains("remove /opt/runtime/.rtsetup/.lock"));
  }
}
