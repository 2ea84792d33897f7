//! NixOS Takeover - Main Entry Point
//!
//! Replaces the running Linux distribution with NixOS in place.

use clap::Parser;
use nixos_takeover::*;
use std::path::PathBuf;
use std::process;

/// Convert this host to NixOS in place
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT:
    NIX_CHANNEL         Channel to install from (default: nixos-24.05)
    NIXOS_CONFIG        URL or path of the main configuration
    USE_FLAKE=1         Build FLAKE_URI#FLAKE_HOSTNAME instead of a channel
    NO_SWAP=1           Do not create a temporary swap file
    NO_REBOOT=1         Do not reboot when finished
    DO_NETCONF=1        Generate networking.nix from the live network
    PROVIDER            digitalocean or servarica imply DO_NETCONF
    NETWORK_INTERFACES  Interfaces for networking.nix (e.g. eth0,eth1)
    NIXOS_IMPORT        Extra path imported by configuration.nix

EXAMPLES:
    # See what would happen
    nixos-takeover --dry-run

    # Show the facts the configuration would be generated from
    nixos-takeover --print-facts

    # Static networking, keep the machine up afterwards
    DO_NETCONF=1 NO_REBOOT=1 nixos-takeover
")]
struct Args {
    /// Dry run - show what would be done without making changes
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Directory the configuration is written to
    #[arg(short, long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Probe the host, print the facts as JSON and exit
    #[arg(long)]
    print_facts: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if let Err(e) = run(args) {
        log::debug!("Fatal: {:?}", e);
        eprintln!("ERROR: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = Config::from_env()?;
    config.dry_run |= args.dry_run;
    if let Some(dir) = args.config_dir {
        config.config_dir = dir;
    }
    config.validate()?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let runner = SystemRunner::new(config.dry_run);
    let installer = NixInstaller::new(&runner, &config.nix_install_url);
    let orchestrator = Orchestrator::new(&config, &runner, &installer);

    if args.print_facts {
        let facts = orchestrator.gather_facts()?;
        println!("{}", serde_json::to_string_pretty(&facts)?);
        return Ok(());
    }

    // Display configuration
    log::info!("Configuration:");
    log::info!("  Mode: {}", config.mode);
    log::info!("  Config dir: {}", config.config_dir.display());
    log::info!("  Network config: {}", config.network_config);
    log::info!("  Temporary swap: {}", !config.no_swap);
    if let Some(provider) = &config.provider {
        log::info!("  Provider: {}", provider);
    }

    let report = orchestrator.run()?;

    log::info!(
        "Takeover complete: {} file(s) written, {} kept",
        report.written.len(),
        report.skipped.len()
    );
    Ok(())
}
