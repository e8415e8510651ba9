// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for the configuration tree that the
//! installer is expected to run from, and resolve paths relative to it.

use nix::unistd::User;
use std::{
    env::var,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Determine absolute path to user's home directory.
///
/// The installer runs through `sudo`, which may reset `HOME` to root's home.
/// So if `SUDO_USER` names a known account, the home directory of that
/// account is used. Otherwise the home directory of the current user is
/// used. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn home_dir() -> Result<PathBuf> {
    if let Some(home) = invoking_user_home() {
        return Ok(home);
    }

    dirs::home_dir().ok_or(NoWayHome)
}

fn invoking_user_home() -> Option<PathBuf> {
    let name = var("SUDO_USER").ok().filter(|name| !name.is_empty())?;
    let user = User::from_name(&name).ok().flatten()?;
    debug!("use home directory of invoking user {name:?}");
    Some(user.dir)
}

/// Resolve path against a base directory.
///
/// Absolute paths are returned as is. Relative paths are joined onto `base`.
pub fn resolve(base: impl AsRef<Path>, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        return path.to_path_buf();
    }

    base.as_ref().join(path)
}

/// Path that a stale backup directory gets renamed to while a new backup is
/// being taken.
pub fn stale_backup_path(backup: impl AsRef<Path>) -> PathBuf {
    let mut name = backup.as_ref().as_os_str().to_os_string();
    name.push("--deleting");
    PathBuf::from(name)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
