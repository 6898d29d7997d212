use std::path::PathBuf;

use crate::consts::{APP_NAME, CACHE_DIR_ENV};

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for cached artifact downloads.
///
/// `RTSETUP_CACHE_DIR` takes precedence over the platform default.
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
    return PathBuf::from(dir);
  }
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cached artifact downloads.
///
/// `RTSETUP_CACHE_DIR` takes precedence over `XDG_CACHE_HOME`.
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
    return PathBuf::from(dir);
  }
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

#[cfg(test)]
#[cfg(not(windows))]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn cache_dir_env_override_takes_precedence() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, Some("/custom/artifacts")),
        ("XDG_CACHE_HOME", Some("/custom/cache")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/custom/artifacts"));
      },
    );
  }

  #[test]
  #[serial]
  fn xdg_cache_home_used_without_override() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, None::<&str>),
        ("XDG_CACHE_HOME", Some("/custom/cache")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/custom/cache").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn falls_back_to_home_cache() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, None::<&str>),
        ("XDG_CACHE_HOME", None::<&str>),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/home/user/.cache").join(APP_NAME));
      },
    );
  }
}
