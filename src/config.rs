// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the installer configuration to simplify the process
//! of serialization and deserialization. Every path the installer touches is
//! described here, so operations never reach for process-wide constants.
//!
//! # General Layout
//!
//! The installer configuration is composed of three tables: paths, secrets,
//! and rebuild. Every field has a default, so an empty file is a valid
//! configuration. Relative paths are resolved against the full configuration
//! path, i.e., the directory the installer is expected to run from. A
//! leading "~" names the home directory of the user that invoked `sudo`, not
//! the home directory of root.
//!
//! ```toml
//! [paths]
//! full_conf_path = "~/.config/home-manager"
//! global_config_file = "/etc/nixos/configuration.nix"
//! top_level_config = "configuration.nix"
//! versioned_source = "derivations/global"
//! backup_dir = "global-bk"
//! config_file_backup = "configuration-bk.nix"
//!
//! [secrets]
//! url = "http://secrets.homeserver.lc/secrets.zip"
//! extract_dir = "dotfiles"
//!
//! [rebuild]
//! program = "nixos-rebuild"
//! args = ["build"]
//! rollback = "config-file"
//! ```

use crate::path::{home_dir, resolve};

use serde::{Deserialize, Serialize};
use std::{
    env::var,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Installer configuration layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Filesystem locations read and written by the installer.
    pub paths: PathSettings,

    /// Remote secrets archive settings.
    pub secrets: SecretsSettings,

    /// Rebuild tool settings.
    pub rebuild: RebuildSettings,
}

impl InstallConfig {
    /// Construct default configuration with shell expansion applied.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::NoWayHome`] if home directory is unknown.
    pub fn try_default() -> Result<Self> {
        Self::default().expanded()
    }

    /// Load configuration from file at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file is not valid.
    /// - Return [`ConfigError::ShellExpansion`] if paths cannot be expanded.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = read_to_string(path.as_ref()).map_err(|err| ConfigError::Read {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }

    /// Perform shell expansion on every path field.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ShellExpansion`] if a variable is not set.
    /// - Return [`ConfigError::NoWayHome`] if a path starts with "~" and the
    ///   home directory is unknown.
    pub fn expanded(mut self) -> Result<Self> {
        let paths = &mut self.paths;
        paths.full_conf_path = expand_path(&paths.full_conf_path)?;
        paths.global_config_file = expand_path(&paths.global_config_file)?;
        paths.top_level_config = expand_path(&paths.top_level_config)?;
        paths.versioned_source = expand_path(&paths.versioned_source)?;
        paths.backup_dir = expand_path(&paths.backup_dir)?;
        paths.config_file_backup = expand_path(&paths.config_file_backup)?;
        self.secrets.extract_dir = expand_path(&self.secrets.extract_dir)?;

        Ok(self)
    }

    /// Directory the installer must be executed from.
    pub fn full_conf_path(&self) -> &Path {
        self.paths.full_conf_path.as_path()
    }

    /// Live configuration file consumed by the rebuild tool.
    pub fn global_config_file(&self) -> PathBuf {
        self.resolved(&self.paths.global_config_file)
    }

    /// Directory holding the live configuration file.
    pub fn global_config_dir(&self) -> PathBuf {
        let file = self.global_config_file();
        file.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// File copied over the live configuration file on update.
    pub fn top_level_config(&self) -> PathBuf {
        self.resolved(&self.paths.top_level_config)
    }

    /// Directory of extra configuration files copied on update.
    pub fn versioned_source(&self) -> PathBuf {
        self.resolved(&self.paths.versioned_source)
    }

    /// Mirror of the live configuration directory.
    pub fn backup_dir(&self) -> PathBuf {
        self.resolved(&self.paths.backup_dir)
    }

    /// Single-file backup of the live configuration file.
    pub fn config_file_backup(&self) -> PathBuf {
        self.resolved(&self.paths.config_file_backup)
    }

    /// Directory downloaded secrets are extracted into.
    pub fn extract_dir(&self) -> PathBuf {
        self.resolved(&self.secrets.extract_dir)
    }

    fn resolved(&self, path: &Path) -> PathBuf {
        resolve(self.full_conf_path(), path)
    }
}

impl FromStr for InstallConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let config: InstallConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on all path fields.
        config.expanded()
    }
}

impl Display for InstallConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Filesystem locations.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathSettings {
    /// Directory the installer must be executed from.
    pub full_conf_path: PathBuf,

    /// Live configuration file. Its parent is the live configuration
    /// directory.
    pub global_config_file: PathBuf,

    /// File installed over the live configuration file.
    pub top_level_config: PathBuf,

    /// Directory of extra configuration files to install.
    pub versioned_source: PathBuf,

    /// Backup mirror of the live configuration directory.
    pub backup_dir: PathBuf,

    /// Single-file backup used when validation fails.
    pub config_file_backup: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            full_conf_path: "~/.config/home-manager".into(),
            global_config_file: "/etc/nixos/configuration.nix".into(),
            top_level_config: "configuration.nix".into(),
            versioned_source: "derivations/global".into(),
            backup_dir: "global-bk".into(),
            config_file_backup: "configuration-bk.nix".into(),
        }
    }
}

/// Remote secrets archive settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecretsSettings {
    /// Where the secrets archive can be downloaded from.
    pub url: String,

    /// Directory to extract the secrets archive into.
    pub extract_dir: PathBuf,
}

impl Default for SecretsSettings {
    fn default() -> Self {
        Self {
            url: "http://secrets.homeserver.lc/secrets.zip".into(),
            extract_dir: "dotfiles".into(),
        }
    }
}

/// Rebuild tool settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RebuildSettings {
    /// Rebuild tool binary.
    pub program: String,

    /// Arguments that make the rebuild tool validate without switching.
    pub args: Vec<String>,

    /// What to undo when validation fails.
    pub rollback: RollbackPolicy,
}

impl Default for RebuildSettings {
    fn default() -> Self {
        Self {
            program: "nixos-rebuild".into(),
            args: vec!["build".into()],
            rollback: RollbackPolicy::default(),
        }
    }
}

/// Rollback strategy when the rebuild tool rejects a new configuration.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackPolicy {
    /// Only put the single-file backup back over the live configuration file.
    ///
    /// Everything else copied in by the update stays in place.
    #[default]
    ConfigFile,

    /// Restore the whole live configuration directory from the backup
    /// directory, then apply the single-file backup.
    Full,
}

impl FromStr for RollbackPolicy {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data {
            "config-file" => Ok(Self::ConfigFile),
            "full" => Ok(Self::Full),
            other => Err(ConfigError::UnknownRollback(other.into())),
        }
    }
}

impl Display for RollbackPolicy {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::ConfigFile => fmt.write_str("config-file"),
            Self::Full => fmt.write_str("full"),
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    // INVARIANT: Paths that are not valid UTF-8 are taken literally.
    let Some(raw) = path.to_str() else {
        return Ok(path.to_path_buf());
    };

    let mut no_way_home = None;
    let home = || match home_dir() {
        Ok(home) => home.to_str().map(str::to_owned),
        Err(err) => {
            no_way_home = Some(err);
            None
        }
    };
    let expanded = shellexpand::full_with_context(raw, home, |name| var(name).map(Some))?;
    if let Some(err) = no_way_home {
        return Err(err.into());
    }

    Ok(PathBuf::from(expanded.as_ref()))
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Failed to determine home directory for tilde expansion.
    #[error(transparent)]
    NoWayHome(#[from] crate::path::NoWayHome),

    /// Configuration file cannot be read.
    #[error("failed to read configuration file at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Rollback policy name is not known.
    #[error("unknown rollback policy {0:?}, expected \"config-file\" or \"full\"")]
    UnknownRollback(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
