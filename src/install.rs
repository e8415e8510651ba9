// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration installation.
//!
//! The installer moves configuration from the versioned bundle into the live
//! configuration directory, keeping a backup of whatever was there before.
//!
//! # Update Flow
//!
//! 1. Optionally fetch the secrets package into the dotfiles directory.
//! 2. Back up the live configuration directory.
//! 3. Clear the live configuration directory, install the top-level
//!    configuration file, then copy in the versioned configuration source.
//! 4. Ask the rebuild tool to build the result without switching to it.
//!
//! If the rebuild tool rejects the new configuration, a rollback is made
//! according to [`RollbackPolicy`]. The default policy only puts the
//! single-file backup back over the live configuration file, leaving the
//! rest of the directory as installed. [`RollbackPolicy::Full`] restores the
//! whole directory from the backup taken in step 2 first.
//!
//! Nothing is ever retried. Every failure ends the current invocation.

use crate::{
    config::{InstallConfig, RollbackPolicy},
    mirror::{self, MirrorError},
    rebuild::{CommandRebuild, Rebuild, RebuildError},
    secrets::{self, CredentialProvider, Fetch, SecretsError},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::remove_file,
    path::PathBuf,
};
use tracing::{info, instrument, warn};

/// Installs, backs up, and restores the live configuration.
#[derive(Debug)]
pub struct Installer<R = CommandRebuild>
where
    R: Rebuild,
{
    pub(crate) config: InstallConfig,
    pub(crate) rebuild: R,
}

impl Installer<CommandRebuild> {
    /// Construct installer that validates through the configured rebuild
    /// tool.
    pub fn with_config(config: InstallConfig) -> Self {
        let rebuild = CommandRebuild::from(&config.rebuild);
        Self { config, rebuild }
    }
}

impl<R> Installer<R>
where
    R: Rebuild,
{
    /// Construct new installer.
    pub fn new(config: InstallConfig, rebuild: R) -> Self {
        Self { config, rebuild }
    }

    /// Configuration in use.
    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    /// Mirror live configuration directory into backup directory.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError::Mirror`] if backup cannot be taken.
    #[instrument(skip(self), level = "debug")]
    pub fn backup(&self) -> Result<()> {
        mirror::backup(&self.config.global_config_dir(), &self.config.backup_dir())?;
        Ok(())
    }

    /// Replace live configuration directory with backup directory.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError::Mirror`] if backup cannot be restored.
    #[instrument(skip(self), level = "debug")]
    pub fn restore(&self) -> Result<()> {
        mirror::restore(&self.config.backup_dir(), &self.config.global_config_dir())?;
        Ok(())
    }

    /// Fetch secrets package, then update.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError::Secrets`] if secrets package cannot be
    ///   fetched. No configuration is touched in that case.
    /// - Return any error of [`Installer::update`].
    pub fn update_with_secrets(
        &self,
        fetcher: &impl Fetch,
        provider: &impl CredentialProvider,
    ) -> Result<()> {
        secrets::fetch_secrets(
            fetcher,
            provider,
            &self.config.secrets.url,
            &self.config.extract_dir(),
        )?;

        self.update()
    }

    /// Install versioned configuration and validate it.
    ///
    /// # Errors
    ///
    /// - Return [`InstallError::MissingInput`] if the configuration to
    ///   install is absent. Nothing is touched in that case.
    /// - Return [`InstallError::Mirror`] if backup or installation fails.
    /// - Return [`InstallError::Validation`] if the rebuild tool rejects the
    ///   new configuration. The rollback has been made by then.
    /// - Return [`InstallError::Rollback`] if the rebuild tool rejects the
    ///   new configuration and the rollback fails.
    #[instrument(skip(self), level = "debug")]
    pub fn update(&self) -> Result<()> {
        self.check_inputs()?;
        self.backup()?;
        self.apply()?;

        match self.rebuild.validate() {
            Ok(()) => {
                info!("new configuration accepted");
                Ok(())
            }
            Err(err) => {
                warn!("new configuration rejected: {err}");
                match self.rollback() {
                    Ok(rollback) => Err(InstallError::Validation {
                        source: err,
                        rollback,
                    }),
                    Err(rollback_err) => Err(InstallError::Rollback {
                        source: rollback_err,
                        validation: err,
                    }),
                }
            }
        }
    }

    fn check_inputs(&self) -> Result<()> {
        let top_level = self.config.top_level_config();
        if !top_level.is_file() {
            return Err(InstallError::MissingInput(top_level));
        }

        let versioned = self.config.versioned_source();
        if !versioned.is_dir() {
            return Err(InstallError::MissingInput(versioned));
        }

        Ok(())
    }

    fn apply(&self) -> Result<()> {
        let live = self.config.global_config_dir();
        info!("install new configuration into {:?}", live.display());
        mirror::clear_dir(&live)?;
        mirror::copy_file(
            &self.config.top_level_config(),
            &self.config.global_config_file(),
        )?;
        mirror::copy_entries(&self.config.versioned_source(), &live)?;

        Ok(())
    }

    fn rollback(&self) -> Result<Rollback, MirrorError> {
        let mut rollback = Rollback::default();

        if self.config.rebuild.rollback == RollbackPolicy::Full {
            warn!("restore live configuration directory from backup");
            mirror::restore(&self.config.backup_dir(), &self.config.global_config_dir())?;
            rollback.directory = true;
        }

        let artifact = self.config.config_file_backup();
        if artifact.exists() {
            warn!(
                "restore {:?} from {:?}",
                self.config.global_config_file().display(),
                artifact.display()
            );
            mirror::copy_file(&artifact, &self.config.global_config_file())?;
            remove_file(&artifact).map_err(|err| MirrorError::Remove {
                source: err,
                path: artifact.clone(),
            })?;
            rollback.config_file = true;
        }

        Ok(rollback)
    }
}

/// What a rollback put back in place.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rollback {
    /// Live configuration directory was restored from the backup directory.
    pub directory: bool,

    /// Live configuration file was restored from the single-file backup.
    pub config_file: bool,
}

impl Display for Rollback {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match (self.directory, self.config_file) {
            (false, false) => fmt.write_str("nothing was rolled back"),
            (true, false) => fmt.write_str("configuration directory was restored from backup"),
            (false, true) => fmt.write_str("configuration file was restored from backup"),
            (true, true) => fmt.write_str(
                "configuration directory and configuration file were restored from backup",
            ),
        }
    }
}

/// Installation error types.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Filesystem operation fails.
    #[error(transparent)]
    Mirror(#[from] MirrorError),

    /// Secrets package cannot be fetched.
    #[error(transparent)]
    Secrets(#[from] SecretsError),

    /// Configuration to install does not exist.
    #[error("configuration source {:?} does not exist", .0.display())]
    MissingInput(PathBuf),

    /// Rebuild tool rejected the new configuration.
    #[error("new configuration failed validation; {rollback}")]
    Validation {
        #[source]
        source: RebuildError,
        rollback: Rollback,
    },

    /// Rebuild tool rejected the new configuration, and rollback failed.
    #[error("new configuration failed validation ({validation}), and rollback failed")]
    Rollback {
        #[source]
        source: MirrorError,
        validation: RebuildError,
    },
}

/// Friendly result alias :3
pub type Result<T, E = InstallError> = std::result::Result<T, E>;
