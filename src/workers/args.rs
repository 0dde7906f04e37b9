//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML settings file
//! - Merging CLI overrides into the file settings (CLI takes precedence)

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use peerdrop::core::config::Settings;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "peerdrop.toml";

/// peerdrop - encrypted peer-to-peer text and file rooms.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Settings file (TOML). Defaults to ./peerdrop.toml when present.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Seconds a delivery waits for a dropped peer before failing it.
    #[clap(long, global = true)]
    pub resume_wait: Option<u64>,

    /// Reconnect attempts before a guest gives up on the room.
    #[clap(long, global = true)]
    pub reconnect_attempts: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Print a fresh room code and the rendezvous id it maps to.
    Code,
    /// Run a host and guests on an in-memory network and move data between them.
    Demo(DemoArgs),
}

#[derive(ClapArgs, Clone, Debug)]
pub struct DemoArgs {
    /// Number of guests joining the host's room.
    #[clap(long, default_value_t = 2)]
    pub peers: usize,

    /// Size in bytes of the generated file (ignored with --file).
    #[clap(long, default_value_t = 8 * 1024 * 1024)]
    pub size: usize,

    /// Send this file instead of generated bytes.
    #[clap(long)]
    pub file: Option<PathBuf>,

    /// Text broadcast before the file.
    #[clap(long, default_value = "hello from the host")]
    pub text: String,

    /// Disconnect this guest (0-based) as soon as its first chunk arrives.
    #[clap(long)]
    pub drop_peer: Option<usize>,

    /// Cancel the file transfer after this many milliseconds.
    #[clap(long)]
    pub cancel_after: Option<u64>,
}

impl Args {
    pub fn load() -> Self {
        let mut args = Args::parse();
        args.config = args.config.map(Self::resolve_path);
        args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// File settings (or defaults) with CLI overrides applied, validated.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let file = match &self.config {
            Some(path) => Some(Self::from_file(path)?),
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG);
                if default_path.exists() {
                    Some(Self::from_file(&default_path)?)
                } else {
                    None
                }
            }
        };
        let settings = self.merge(file.unwrap_or_default());
        settings.validate()?;
        Ok(settings)
    }

    fn from_file(path: &Path) -> anyhow::Result<Settings> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        toml::from_str::<Settings>(&content)
            .with_context(|| format!("parsing settings in {}", path.display()))
    }

    fn merge(&self, mut file: Settings) -> Settings {
        if let Some(secs) = self.resume_wait {
            file.resume_wait_ms = secs * 1000;
        }
        if let Some(attempts) = self.reconnect_attempts {
            file.reconnect.max_attempts = attempts;
        }
        file
    }
}
