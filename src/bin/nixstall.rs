// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use nixstall::{
    config::{InstallConfig, RollbackPolicy},
    guard::{self, EffectiveUid},
    install::Installer,
    secrets::{InquirePrompter, UreqFetch},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{
    io::{stdout, Write},
    path::PathBuf,
    process::exit,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "nixstall [options] <nixstall-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to installer configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Link where secrets package is stored.
    #[arg(short, long, global = true, value_name = "url")]
    pub link: Option<String>,

    /// Directory the installer must be executed from.
    #[arg(short, long, global = true, value_name = "path")]
    pub full_conf_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Update(opts) => run_update(config, opts),
            Command::Backup => run_backup(config),
            Command::Restore => run_restore(config),
            Command::Config => run_config(&config),
        }
    }

    fn load_config(&self) -> Result<InstallConfig> {
        let mut config = match &self.config {
            Some(path) => InstallConfig::load(path)?,
            None => InstallConfig::try_default()?,
        };

        if let Some(link) = &self.link {
            config.secrets.url = link.clone();
        }

        if let Some(path) = &self.full_conf_path {
            config.paths.full_conf_path = path.clone();
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Update NixOS config.
    #[command(override_usage = "nixstall update [options]")]
    Update(UpdateOptions),

    /// Backup NixOS config.
    #[command(override_usage = "nixstall backup [options]")]
    Backup,

    /// Restore NixOS config.
    #[command(override_usage = "nixstall restore [options]")]
    Restore,

    /// Show effective installer configuration.
    #[command(override_usage = "nixstall config [options]")]
    Config,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UpdateOptions {
    /// Download secrets package.
    #[arg(short, long)]
    pub secrets: bool,

    /// What to roll back when validation fails [config-file, full].
    #[arg(short, long, value_name = "policy")]
    pub rollback: Option<RollbackPolicy>,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn preflight(config: &InstallConfig) -> Result<()> {
    guard::verify(&EffectiveUid, config.full_conf_path())?;
    Ok(())
}

fn run_update(mut config: InstallConfig, opts: UpdateOptions) -> Result<()> {
    preflight(&config)?;
    if let Some(policy) = opts.rollback {
        config.rebuild.rollback = policy;
    }

    let installer = Installer::with_config(config);
    if opts.secrets {
        installer.update_with_secrets(&UreqFetch::new(), &InquirePrompter)?;
    } else {
        installer.update()?;
    }

    info!("configuration updated");
    Ok(())
}

fn run_backup(config: InstallConfig) -> Result<()> {
    preflight(&config)?;
    Installer::with_config(config).backup()?;

    info!("configuration backed up");
    Ok(())
}

fn run_restore(config: InstallConfig) -> Result<()> {
    preflight(&config)?;
    Installer::with_config(config).restore()?;

    info!("configuration restored");
    Ok(())
}

fn run_config(config: &InstallConfig) -> Result<()> {
    write!(stdout(), "{config}")?;
    Ok(())
}
