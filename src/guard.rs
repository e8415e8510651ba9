// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Invocation preconditions.
//!
//! The installer rewrites system configuration, so every invocation must be
//! made with elevated privileges from inside the full configuration path.
//! Both conditions are checked up front, before anything on disk is touched.

use std::{
    env::current_dir,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Determine if current process has elevated privileges.
pub trait Privilege {
    /// Process may modify system configuration.
    fn is_elevated(&self) -> bool;
}

/// Privilege check through the effective user id of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct EffectiveUid;

impl Privilege for EffectiveUid {
    fn is_elevated(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

/// Verify that installer may run at all.
///
/// Checks privileges first, then compares the current working directory to
/// `full_conf_path`. Both sides are canonicalized before comparison.
///
/// # Errors
///
/// - Return [`GuardError::NotPrivileged`] if process lacks privileges.
/// - Return [`GuardError::WrongDirectory`] if working directory does not
///   match `full_conf_path`.
/// - Return [`GuardError::CurrentDir`] if working directory cannot be
///   determined.
#[instrument(skip(privilege), level = "debug")]
pub fn verify(privilege: &impl Privilege, full_conf_path: &Path) -> Result<()> {
    if !privilege.is_elevated() {
        return Err(GuardError::NotPrivileged);
    }

    let cwd = current_dir().map_err(GuardError::CurrentDir)?;
    verify_directory(&cwd, full_conf_path)
}

/// Compare working directory to expected full configuration path.
///
/// # Errors
///
/// - Return [`GuardError::WrongDirectory`] on mismatch, or if either path
///   cannot be canonicalized.
pub fn verify_directory(cwd: &Path, full_conf_path: &Path) -> Result<()> {
    let actual = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
    let expected = full_conf_path.canonicalize().map_err(|_| GuardError::WrongDirectory {
        expected: full_conf_path.to_path_buf(),
        actual: actual.clone(),
    })?;

    debug!("compare {:?} to {:?}", actual.display(), expected.display());
    if actual != expected {
        return Err(GuardError::WrongDirectory { expected, actual });
    }

    Ok(())
}

/// Precondition error types.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Process is not running as root.
    #[error("installer must be executed as root")]
    NotPrivileged,

    /// Process is not running from the full configuration path.
    #[error(
        "installer must be executed in {:?}, not {:?}; change the expected path with -f or --full-conf-path",
        expected.display(),
        actual.display()
    )]
    WrongDirectory { expected: PathBuf, actual: PathBuf },

    /// Current working directory cannot be determined.
    #[error("failed to determine current working directory")]
    CurrentDir(#[source] std::io::Error),
}

/// Friendly result alias :3
type Result<T, E = GuardError> = std::result::Result<T, E>;
