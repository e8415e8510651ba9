// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration validation through the OS rebuild tool.
//!
//! A freshly installed configuration is only accepted once the rebuild tool
//! manages to build it without switching to it. The tool is always invoked
//! directly with an argument vector. No shell is involved.

use crate::config::RebuildSettings;

use std::{
    ffi::{OsStr, OsString},
    process::{Command, ExitStatus},
};
use tracing::{info, instrument};

/// Validate newly installed configuration.
pub trait Rebuild {
    /// Build current configuration without activating it.
    fn validate(&self) -> Result<()>;
}

/// Rebuild tool executed as an external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRebuild {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandRebuild {
    /// Construct new rebuild tool invocation.
    pub fn new(
        program: impl Into<OsString>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&RebuildSettings> for CommandRebuild {
    fn from(settings: &RebuildSettings) -> Self {
        Self::new(&settings.program, &settings.args)
    }
}

impl Rebuild for CommandRebuild {
    #[instrument(skip(self), level = "debug")]
    fn validate(&self) -> Result<()> {
        info!("validate configuration with {:?} {:?}", self.program, self.args);
        syscall_interactive(&self.program, &self.args)
    }
}

fn syscall_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<()> {
    let status = Command::new(cmd.as_ref())
        .args(args)
        .spawn()
        .and_then(|mut child| child.wait())
        .map_err(|err| RebuildError::Spawn {
            source: err,
            program: cmd.as_ref().to_os_string(),
        })?;

    if !status.success() {
        return Err(RebuildError::Failed {
            program: cmd.as_ref().to_os_string(),
            status,
        });
    }

    Ok(())
}

/// Rebuild tool error types.
#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    /// Rebuild tool could not be started.
    #[error("failed to run {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    /// Rebuild tool rejected the configuration.
    #[error("error during configuration validation: {program:?} exited with {status}")]
    Failed { program: OsString, status: ExitStatus },
}

/// Friendly result alias :3
pub type Result<T, E = RebuildError> = std::result::Result<T, E>;

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn successful_tool_validates() -> anyhow::Result<()> {
        CommandRebuild::new("true", Vec::<OsString>::new()).validate()?;

        Ok(())
    }

    #[test]
    fn failing_tool_is_reported() {
        let result = CommandRebuild::new("sh", ["-c", "exit 3"]).validate();
        assert!(matches!(
            result,
            Err(RebuildError::Failed { status, .. }) if status.code() == Some(3)
        ));
    }

    #[test]
    fn missing_tool_is_reported() {
        let result = CommandRebuild::new("nixstall-no-such-rebuild-tool", ["build"]).validate();
        assert!(matches!(result, Err(RebuildError::Spawn { .. })));
    }

    #[test]
    fn arguments_are_not_shell_interpolated() {
        // A shell would expand `$(exit 0)`; passed verbatim, `test` sees a
        // non-empty string compared against "ok" and fails.
        let result = CommandRebuild::new("test", ["$(exit 0)", "=", "ok"]).validate();
        assert!(matches!(result, Err(RebuildError::Failed { .. })));
    }

    #[test]
    fn settings_convert_to_invocation() {
        let settings = RebuildSettings::default();
        let rebuild = CommandRebuild::from(&settings);
        assert_eq!(rebuild, CommandRebuild::new("nixos-rebuild", ["build"]));
    }
}
