//! Mount a DICOMweb store as a local filesystem of studies, series and instances.
use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::{Config, MountProfile};
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    long_version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("VERGEN_GIT_SHA"), ")"),
    about = "Mount a DICOMweb store as a filesystem."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a dicom-fuse config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mount for interactive use.
    Mount(MountArgs),

    /// Mount with caches that never expire or evict, for repeatable measurements.
    Bench(MountArgs),
}

/// Flags shared by every mount profile. Each one overrides the config file.
#[derive(ClapArgs, Default)]
struct MountArgs {
    /// Base URL of the DICOM store.
    #[arg(short = 'a', long)]
    dataset_addr: Option<String>,

    /// Where to mount the filesystem.
    #[arg(short = 'p', long = "mount-path")]
    mount_path: Option<PathBuf>,

    /// File holding the bearer token. Defaults to the DICOM_FUSE_TOKEN environment variable.
    #[arg(short = 'k', long)]
    key_file: Option<PathBuf>,

    /// Pass `rm` and `rmdir` on to the store.
    #[arg(short = 'd', long)]
    enable_deletion: Option<bool>,

    /// Attribute cache TTL in seconds.
    #[arg(long)]
    attr_ttl: Option<u64>,

    /// Listing cache TTL in seconds.
    #[arg(long)]
    list_ttl: Option<u64>,

    /// Maximum number of instances kept on local disk.
    #[arg(short = 's', long = "cache-size")]
    cache_size: Option<usize>,

    /// Directory for cached instances and staged writes.
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Maximum number of concurrent transfers.
    #[arg(long)]
    max_transfers: Option<usize>,
}

impl MountArgs {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.dataset_addr {
            config.dataset_addr = v;
        }
        if let Some(v) = self.mount_path {
            config.mount_point = v;
        }
        if let Some(v) = self.key_file {
            config.key_file = Some(v);
        }
        if let Some(v) = self.enable_deletion {
            config.enable_deletion = v;
        }
        if let Some(v) = self.attr_ttl {
            config.cache.attr_ttl_secs = v;
        }
        if let Some(v) = self.list_ttl {
            config.cache.list_ttl_secs = v;
        }
        if let Some(v) = self.cache_size {
            config.cache.capacity = v;
        }
        if let Some(v) = self.cache_path {
            config.cache.path = v;
        }
        if let Some(v) = self.max_transfers {
            config.max_transfers = v;
        }
    }
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    let (profile, mount_args) = match args.command {
        Some(Command::Bench(mount_args)) => (MountProfile::Benchmark, mount_args),
        Some(Command::Mount(mount_args)) => (MountProfile::Interactive, mount_args),
        None => (config.profile, MountArgs::default()),
    };
    config.profile = profile;
    mount_args.apply(&mut config);

    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    Trc::default().init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });

    if let Err(e) = fuse_check::ensure_fuse() {
        error!("{e}");
        std::process::exit(1);
    }

    debug!(config = ?config, "Starting with configuration...");
    if let Err(e) = daemon::spawn(config) {
        error!("{e}");
        std::process::exit(1);
    }
}
