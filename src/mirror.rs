// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Directory mirroring.
//!
//! Utilities to take a backup of the live configuration directory, and to
//! put that backup back in place. No transactions are involved. Safety during
//! partial failure comes entirely from step ordering.
//!
//! Symbolic links are mirrored as links. Their targets are never followed.
//!
//! # Backup Protocol
//!
//! A fresh backup never replaces the current one in place. The current
//! backup is renamed to a stale name first, the new backup is copied in, and
//! only then is the stale backup deleted. So at any instant either the old
//! backup, the new backup, or both exist on disk. If copying fails, the
//! partial copy is discarded and the stale backup is renamed back. If the
//! process dies half way through, the stale backup survives under its
//! `--deleting` name and must be inspected by hand.

use crate::path::stale_backup_path;

use std::{
    fs::{
        copy, create_dir_all, read_dir, read_link, remove_dir_all, remove_file, rename,
        symlink_metadata,
    },
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Replace backup at `backup` with a fresh mirror of `source`.
///
/// # Errors
///
/// - Return [`MirrorError::MissingSource`] if `source` is not a directory.
/// - Return [`MirrorError::Rename`] if the old backup cannot be set aside.
/// - Return [`MirrorError`] if the new backup cannot be created. The old
///   backup is back under its own name by then.
/// - Return [`MirrorError::Remove`] if the stale backup cannot be deleted.
#[instrument(skip(source, backup), level = "debug")]
pub fn backup(source: &Path, backup: &Path) -> Result<()> {
    info!("backup {:?} to {:?}", source.display(), backup.display());
    if !source.is_dir() {
        return Err(MirrorError::MissingSource(source.to_path_buf()));
    }

    // INVARIANT: Set aside old backup before writing anything new.
    let stale = stale_backup_path(backup);
    let had_backup = backup.exists();
    if had_backup {
        debug!("set aside stale backup at {:?}", stale.display());
        rename(backup, &stale).map_err(|err| MirrorError::Rename {
            source: err,
            from: backup.to_path_buf(),
            to: stale.clone(),
        })?;
    }

    if let Err(err) = copy_tree(source, backup) {
        warn!("backup incomplete, putting previous backup back: {err}");
        discard_partial_backup(backup, &stale, had_backup)?;
        return Err(err);
    }

    // INVARIANT: Only delete stale backup once the new one is complete.
    if had_backup {
        debug!("delete stale backup at {:?}", stale.display());
        remove_dir_all(&stale).map_err(|err| MirrorError::Remove {
            source: err,
            path: stale.clone(),
        })?;
    }

    Ok(())
}

fn discard_partial_backup(backup: &Path, stale: &Path, had_backup: bool) -> Result<()> {
    if symlink_metadata(backup).is_ok() {
        remove_dir_all(backup).map_err(|err| MirrorError::Remove {
            source: err,
            path: backup.to_path_buf(),
        })?;
    }

    if had_backup {
        rename(stale, backup).map_err(|err| MirrorError::Rename {
            source: err,
            from: stale.to_path_buf(),
            to: backup.to_path_buf(),
        })?;
    }

    Ok(())
}

/// Put backup at `backup` back into `target`.
///
/// Clears every entry in `target`, then copies every entry of `backup` into
/// it. An interruption between the two steps leaves `target` empty.
///
/// # Errors
///
/// - Return [`MirrorError::MissingSource`] if `backup` is not a directory.
///   Nothing is deleted in that case.
/// - Return [`MirrorError`] for any filesystem failure while clearing or
///   copying.
#[instrument(skip(backup, target), level = "debug")]
pub fn restore(backup: &Path, target: &Path) -> Result<()> {
    info!("restore {:?} from {:?}", target.display(), backup.display());
    if !backup.is_dir() {
        return Err(MirrorError::MissingSource(backup.to_path_buf()));
    }

    clear_dir(target)?;
    copy_entries(backup, target)?;

    Ok(())
}

/// Delete every entry directly inside `dir`, keeping `dir` itself.
///
/// Subdirectories are removed with all of their content. Links are removed,
/// never what they point to.
///
/// # Errors
///
/// - Return [`MirrorError::ReadDir`] if `dir` cannot be listed.
/// - Return [`MirrorError::Remove`] if an entry cannot be removed.
pub fn clear_dir(dir: &Path) -> Result<()> {
    for path in list_entries(dir)? {
        debug!("remove {:?}", path.display());
        remove_entry(&path)?;
    }

    Ok(())
}

/// Copy every entry directly inside `source` into `target`.
///
/// Entries already present in `target` are replaced. Subdirectories are
/// copied recursively.
///
/// # Errors
///
/// - Return [`MirrorError::ReadDir`] if `source` cannot be listed.
/// - Return [`MirrorError`] if an entry cannot be copied.
pub fn copy_entries(source: &Path, target: &Path) -> Result<()> {
    for from in list_entries(source)? {
        // INVARIANT: Entries from read_dir always carry a file name.
        let Some(name) = from.file_name() else {
            continue;
        };
        copy_path(&from, &target.join(name))?;
    }

    Ok(())
}

/// Recursively copy directory `source` to a new directory at `target`.
///
/// # Errors
///
/// - Return [`MirrorError::CreateDir`] if a directory cannot be created.
/// - Return [`MirrorError::Walk`] if `source` cannot be traversed.
/// - Return [`MirrorError::Copy`] or [`MirrorError::Link`] if an entry
///   cannot be copied.
pub fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    create_dir(target)?;

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| MirrorError::Walk {
            source: err,
            path: source.to_path_buf(),
        })?;

        // INVARIANT: Every walked entry lives below the walk root.
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let to = target.join(relative);

        let kind = entry.file_type();
        if kind.is_dir() {
            create_dir(&to)?;
        } else if kind.is_symlink() {
            copy_link(entry.path(), &to)?;
        } else {
            copy_file(entry.path(), &to)?;
        }
    }

    Ok(())
}

/// Copy a single file, overwriting `to`.
///
/// # Errors
///
/// - Return [`MirrorError::Copy`] if the file cannot be copied.
pub fn copy_file(from: &Path, to: &Path) -> Result<()> {
    debug!("copy {:?} to {:?}", from.display(), to.display());
    copy(from, to).map_err(|err| MirrorError::Copy {
        source: err,
        from: from.to_path_buf(),
        to: to.to_path_buf(),
    })?;

    Ok(())
}

fn copy_path(from: &Path, to: &Path) -> Result<()> {
    let meta = symlink_metadata(from).map_err(|err| MirrorError::Copy {
        source: err,
        from: from.to_path_buf(),
        to: to.to_path_buf(),
    })?;

    if meta.file_type().is_symlink() {
        return copy_link(from, to);
    }

    if meta.is_dir() {
        if symlink_metadata(to).is_ok_and(|meta| !meta.is_dir()) {
            remove_entry(to)?;
        }
        return copy_tree(from, to);
    }

    if symlink_metadata(to).is_ok_and(|meta| !meta.is_file()) {
        remove_entry(to)?;
    }
    copy_file(from, to)
}

fn copy_link(from: &Path, to: &Path) -> Result<()> {
    let link_err = |err| MirrorError::Link {
        source: err,
        from: from.to_path_buf(),
        to: to.to_path_buf(),
    };

    let pointee = read_link(from).map_err(link_err)?;
    if symlink_metadata(to).is_ok() {
        remove_entry(to)?;
    }

    debug!("link {:?} to {:?}", to.display(), pointee.display());
    symlink(&pointee, to).map_err(link_err)?;

    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    create_dir_all(path).map_err(|err| MirrorError::CreateDir {
        source: err,
        path: path.to_path_buf(),
    })
}

fn remove_entry(path: &Path) -> Result<()> {
    let is_dir = symlink_metadata(path)
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    let removed = if is_dir {
        remove_dir_all(path)
    } else {
        remove_file(path)
    };

    removed.map_err(|err| MirrorError::Remove {
        source: err,
        path: path.to_path_buf(),
    })
}

fn list_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let read_err = |err| MirrorError::ReadDir {
        source: err,
        path: dir.to_path_buf(),
    };

    let mut entries = Vec::new();
    for entry in read_dir(dir).map_err(read_err)? {
        entries.push(entry.map_err(read_err)?.path());
    }
    entries.sort();

    Ok(entries)
}

/// Directory mirroring error types.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Directory to mirror does not exist.
    #[error("directory {:?} does not exist", .0.display())]
    MissingSource(PathBuf),

    /// Directory cannot be listed.
    #[error("failed to read directory {:?}", path.display())]
    ReadDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory tree cannot be traversed.
    #[error("failed to walk directory {:?}", path.display())]
    Walk {
        #[source]
        source: walkdir::Error,
        path: PathBuf,
    },

    /// Directory cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// File cannot be copied.
    #[error("failed to copy {:?} to {:?}", from.display(), to.display())]
    Copy {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    /// Symbolic link cannot be copied.
    #[error("failed to copy link {:?} to {:?}", from.display(), to.display())]
    Link {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    /// Entry cannot be renamed.
    #[error("failed to rename {:?} to {:?}", from.display(), to.display())]
    Rename {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    /// Entry cannot be removed.
    #[error("failed to remove {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = MirrorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{
        fs::{create_dir, read_to_string, write},
        os::unix::net::UnixListener,
    };

    fn names(dir: &Path) -> Vec<String> {
        list_entries(dir)
            .unwrap()
            .into_iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn backup_replaces_stale_backup() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let live = root.path().join("nixos");
        let bk = root.path().join("global-bk");
        create_dir(&live)?;
        create_dir(&bk)?;
        write(live.join("a.conf"), "a")?;
        write(live.join("b.conf"), "b")?;
        write(bk.join("x.conf"), "x")?;

        backup(&live, &bk)?;

        assert_eq!(names(&bk), vec!["a.conf", "b.conf"]);
        assert_eq!(read_to_string(bk.join("b.conf"))?, "b");
        assert!(!stale_backup_path(&bk).exists());
        assert_eq!(names(root.path()), vec!["global-bk", "nixos"]);

        Ok(())
    }

    #[test]
    fn backup_copies_nested_directories() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let live = root.path().join("nixos");
        let bk = root.path().join("global-bk");
        create_dir(&live)?;
        create_dir(live.join("modules"))?;
        write(live.join("modules").join("net.nix"), "{ }")?;

        backup(&live, &bk)?;

        assert_eq!(read_to_string(bk.join("modules").join("net.nix"))?, "{ }");

        Ok(())
    }

    #[test]
    fn backup_keeps_links_as_links() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let live = root.path().join("nixos");
        let bk = root.path().join("global-bk");
        create_dir(&live)?;
        create_dir(live.join("modules"))?;
        write(live.join("a.conf"), "a")?;
        write(live.join("modules").join("net.nix"), "{ }")?;
        symlink("nowhere", live.join("dangling"))?;
        symlink("modules", live.join("modules-link"))?;

        backup(&live, &bk)?;

        assert_eq!(
            names(&bk),
            vec!["a.conf", "dangling", "modules", "modules-link"]
        );
        assert_eq!(read_link(bk.join("dangling"))?, PathBuf::from("nowhere"));
        assert!(symlink_metadata(bk.join("modules-link"))?
            .file_type()
            .is_symlink());
        assert_eq!(read_link(bk.join("modules-link"))?, PathBuf::from("modules"));

        Ok(())
    }

    #[test]
    fn failed_backup_puts_previous_backup_back() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let live = root.path().join("nixos");
        let bk = root.path().join("global-bk");
        create_dir(&live)?;
        create_dir(&bk)?;
        write(live.join("a.conf"), "a")?;
        write(bk.join("x.conf"), "x")?;

        // Sockets cannot be copied, not even by root.
        let socket = live.join("z.sock");
        let listener = UnixListener::bind(&socket)?;

        let result = backup(&live, &bk);

        assert!(matches!(result, Err(MirrorError::Copy { .. })));
        assert_eq!(names(&bk), vec!["x.conf"]);
        assert_eq!(read_to_string(bk.join("x.conf"))?, "x");
        assert!(!stale_backup_path(&bk).exists());

        drop(listener);
        remove_file(&socket)?;
        backup(&live, &bk)?;

        assert_eq!(names(&bk), vec!["a.conf"]);

        Ok(())
    }

    #[test]
    fn failed_first_backup_leaves_no_backup() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let live = root.path().join("nixos");
        let bk = root.path().join("global-bk");
        create_dir(&live)?;
        write(live.join("a.conf"), "a")?;
        let _listener = UnixListener::bind(live.join("z.sock"))?;

        let result = backup(&live, &bk);

        assert!(matches!(result, Err(MirrorError::Copy { .. })));
        assert!(!bk.exists());
        assert!(!stale_backup_path(&bk).exists());

        Ok(())
    }

    #[test]
    fn backup_without_source_keeps_old_backup() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let bk = root.path().join("global-bk");
        create_dir(&bk)?;
        write(bk.join("x.conf"), "x")?;

        let result = backup(&root.path().join("missing"), &bk);

        assert!(matches!(result, Err(MirrorError::MissingSource(_))));
        assert_eq!(names(&bk), vec!["x.conf"]);

        Ok(())
    }

    #[test]
    fn restore_mirrors_backup() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let live = root.path().join("nixos");
        let bk = root.path().join("global-bk");
        create_dir(&live)?;
        create_dir(&bk)?;
        write(live.join("new.conf"), "new")?;
        create_dir(live.join("junk"))?;
        write(bk.join("old.conf"), "old")?;

        restore(&bk, &live)?;

        assert_eq!(names(&live), vec!["old.conf"]);
        assert_eq!(read_to_string(live.join("old.conf"))?, "old");

        Ok(())
    }

    #[test]
    fn restore_without_backup_deletes_nothing() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let live = root.path().join("nixos");
        create_dir(&live)?;
        write(live.join("keep.conf"), "keep")?;

        let result = restore(&root.path().join("global-bk"), &live);

        assert!(matches!(result, Err(MirrorError::MissingSource(_))));
        assert_eq!(names(&live), vec!["keep.conf"]);

        Ok(())
    }

    #[test]
    fn copy_entries_overwrites_existing_files() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let from = root.path().join("from");
        let to = root.path().join("to");
        create_dir(&from)?;
        create_dir(&to)?;
        write(from.join("same.conf"), "fresh")?;
        write(to.join("same.conf"), "stale")?;

        copy_entries(&from, &to)?;

        assert_eq!(read_to_string(to.join("same.conf"))?, "fresh");

        Ok(())
    }

    #[test]
    fn copy_entries_replaces_link_with_file() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let from = root.path().join("from");
        let to = root.path().join("to");
        create_dir(&from)?;
        create_dir(&to)?;
        write(from.join("hosts"), "fresh")?;
        symlink("/etc/hosts", to.join("hosts"))?;

        copy_entries(&from, &to)?;

        assert!(symlink_metadata(to.join("hosts"))?.is_file());
        assert_eq!(read_to_string(to.join("hosts"))?, "fresh");

        Ok(())
    }
}
