//! immutfs - append-only overlay filesystem
//!
//! Usage:
//!   immutfs [-o OPTIONS]... [--config FILE] <SOURCE> <MOUNTPOINT>
//!
//! Serves SOURCE at MOUNTPOINT. New files and directories may be created
//! through the mount; existing ones may only change during the grace window
//! that follows their creation.

use clap::{error::ErrorKind, CommandFactory, Parser};
use immutfs::{
    config::MountConfig,
    fs::{ImmutFs, Overlay},
    Error, Result,
};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "immutfs")]
#[command(version)]
#[command(about = "Append-only overlay filesystem")]
struct Cli {
    /// Mount options, comma separated: debug, null, log, ro, allow_other,
    /// grace=<duration>, xattr_strict
    #[arg(short = 'o', value_name = "OPTIONS")]
    options: Vec<String>,

    /// JSON configuration file, applied before -o options
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory to serve
    source: PathBuf,

    /// Mount point directory
    mount_point: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let config = build_config(&cli).unwrap_or_else(|e| usage_error(e));
    for dir in [&cli.source, &cli.mount_point] {
        if !dir.is_dir() {
            usage_error(format!("{:?} is not an existing directory", dir));
        }
    }

    init_logging(config.debug);

    if let Err(e) = mount(&cli.source, &cli.mount_point, config) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print a usage error and exit with status 2
fn usage_error(message: impl std::fmt::Display) -> ! {
    Cli::command()
        .error(ErrorKind::ValueValidation, message)
        .exit()
}

fn build_config(cli: &Cli) -> Result<MountConfig> {
    let mut config = match &cli.config {
        Some(path) => MountConfig::load(expand_tilde(path))?,
        None => {
            let mut config = MountConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    for options in &cli.options {
        config.apply_options(options)?;
    }
    Ok(config)
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }
}

fn mount(source: &Path, mount_point: &Path, config: MountConfig) -> Result<()> {
    let source = source.canonicalize()?;
    let options = mount_options(&source, &config);

    if config.read_only {
        info!("Mounting {:?} at {:?} read-only", source, mount_point);
    } else if !config.grace_enabled() {
        info!("Mounting {:?} at {:?} (no grace period)", source, mount_point);
    } else {
        info!(
            "Mounting {:?} at {:?} (grace period {})",
            source,
            mount_point,
            immutfs::config::format_duration(config.grace_period)
        );
    }

    let overlay = Overlay::new(source, config)?;
    fuser::mount2(ImmutFs::new(overlay), mount_point, &options)
        .map_err(|e| Error::Mount(e.to_string()))?;

    info!("Unmounted {:?}", mount_point);
    Ok(())
}

/// FUSE mount options for serving `source`.
///
/// With `allow_other` the kernel enforces the backing modes itself, since
/// the daemon's own credentials would otherwise apply to every caller.
fn mount_options(source: &Path, config: &MountConfig) -> Vec<fuser::MountOption> {
    let mut options = vec![
        fuser::MountOption::FSName(source.to_string_lossy().to_string()),
        fuser::MountOption::Subtype("immutfs".to_string()),
    ];
    if config.allow_other {
        options.push(fuser::MountOption::AllowOther);
        options.push(fuser::MountOption::DefaultPermissions);
    }
    options
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuser::MountOption;

    #[test]
    fn test_mount_options() {
        let source = Path::new("/srv/data");
        let options = mount_options(source, &MountConfig::default());
        assert_eq!(
            options,
            vec![
                MountOption::FSName("/srv/data".to_string()),
                MountOption::Subtype("immutfs".to_string()),
            ]
        );

        let shared = MountConfig {
            allow_other: true,
            ..Default::default()
        };
        let options = mount_options(source, &shared);
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::DefaultPermissions));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde(Path::new("/etc/x")), PathBuf::from("/etc/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x.json")), home.join("x.json"));
        }
    }
}
