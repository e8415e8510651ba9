// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Install, back up, and restore NixOS system configuration.
//!
//! The live configuration directory is only ever mutated after a full backup
//! of it exists. New configuration comes from a versioned bundle, and is
//! validated by the rebuild tool before being accepted. Sensitive dotfiles
//! can be pulled from a password protected archive on a remote host.

pub mod config;
pub mod guard;
pub mod install;
pub mod mirror;
pub mod path;
pub mod rebuild;
pub mod secrets;

pub use config::{InstallConfig, RollbackPolicy};
pub use install::{InstallError, Installer, Rollback};
