//! Run configuration
//!
//! Everything the operator can tune arrives through environment variables,
//! with a few CLI overrides layered on top in `main.rs`.

use crate::error::{Result, TakeoverError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Channel used when `NIX_CHANNEL` is not set
pub const DEFAULT_CHANNEL: &str = "nixos-24.05";

/// Installer script used when `NIX_INSTALL_URL` is not set
pub const DEFAULT_NIX_INSTALL_URL: &str = "https://nixos.org/nix/install";

/// Directory the generated configuration lands in
pub const DEFAULT_CONFIG_DIR: &str = "/etc/nixos";

/// Providers whose images need static network configuration
const NETCONF_PROVIDERS: &[&str] = &["digitalocean", "servarica"];

/// Where the main configuration comes from in channel mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Synthesized from probed facts
    Generated,
    /// Fetched verbatim from a URL, replacing the synthesized file
    Url(String),
    /// An existing file on this host
    Path(PathBuf),
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generated => write!(f, "generated"),
            Self::Url(url) => write!(f, "{}", url),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// How the NixOS system is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallMode {
    /// Classic channel install from `configuration.nix`
    Channel {
        channel: String,
        source: ConfigSource,
    },
    /// Build `nixosConfigurations.<hostname>` from a flake
    Flake { uri: String, hostname: String },
}

impl InstallMode {
    /// Whether configuration files are synthesized for this mode
    pub fn synthesizes_main_config(&self) -> bool {
        matches!(self, Self::Channel { .. })
    }
}

impl std::fmt::Display for InstallMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel { channel, source } => {
                write!(f, "channel {} (configuration: {})", channel, source)
            }
            Self::Flake { uri, hostname } => write!(f, "flake {}#{}", uri, hostname),
        }
    }
}

/// Which interfaces get static configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceSelection {
    /// Pick interfaces by kernel index
    KernelIndex { primary: u32, secondary: u32 },
    /// Pick interfaces by name, first is primary
    Named(Vec<String>),
}

impl Default for InterfaceSelection {
    fn default() -> Self {
        Self::KernelIndex {
            primary: 2,
            secondary: 3,
        }
    }
}

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Build mode
    pub mode: InstallMode,

    /// Nix installer script location
    pub nix_install_url: String,

    /// Skip the temporary swap file
    pub no_swap: bool,

    /// Skip the final reboot
    pub no_reboot: bool,

    /// Generate `networking.nix`
    pub network_config: bool,

    /// Interface selection policy for `networking.nix`
    pub interfaces: InterfaceSelection,

    /// Extra path imported by `configuration.nix`
    pub extra_import: Option<String>,

    /// Cloud provider hint
    pub provider: Option<String>,

    /// Invoking user when run through sudo, searched for SSH keys
    pub sudo_user: Option<String>,

    /// Home directory searched for SSH keys
    pub home: Option<String>,

    /// Target configuration directory
    pub config_dir: PathBuf,

    /// Dry run mode (don't actually make changes)
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: InstallMode::Channel {
                channel: DEFAULT_CHANNEL.to_string(),
                source: ConfigSource::Generated,
            },
            nix_install_url: DEFAULT_NIX_INSTALL_URL.to_string(),
            no_swap: false,
            no_reboot: false,
            network_config: false,
            interfaces: InterfaceSelection::default(),
            extra_import: None,
            provider: None,
            sudo_user: None,
            home: None,
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            dry_run: false,
        }
    }
}

impl Config {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let flag = |key: &str| var(key).map(|v| v != "0").unwrap_or(false);

        let mode = if flag("USE_FLAKE") {
            let uri = var("FLAKE_URI")
                .ok_or_else(|| TakeoverError::config("FLAKE_URI is required when USE_FLAKE=1"))?;
            let hostname = var("FLAKE_HOSTNAME").ok_or_else(|| {
                TakeoverError::config("FLAKE_HOSTNAME is required when USE_FLAKE=1")
            })?;
            InstallMode::Flake { uri, hostname }
        } else {
            let source = match var("NIXOS_CONFIG") {
                Some(v) if v.starts_with("http://") || v.starts_with("https://") => {
                    ConfigSource::Url(v)
                }
                Some(v) => ConfigSource::Path(PathBuf::from(v)),
                None => ConfigSource::Generated,
            };
            InstallMode::Channel {
                channel: var("NIX_CHANNEL").unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
                source,
            }
        };

        let provider = var("PROVIDER").map(|p| p.to_lowercase());
        let provider_needs_netconf = provider
            .as_deref()
            .map(|p| NETCONF_PROVIDERS.contains(&p))
            .unwrap_or(false);

        let interfaces = match var("NETWORK_INTERFACES") {
            Some(list) => {
                let names: Vec<String> = list
                    .split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect();
                InterfaceSelection::Named(names)
            }
            None => InterfaceSelection::default(),
        };

        let config = Self {
            mode,
            nix_install_url: var("NIX_INSTALL_URL")
                .unwrap_or_else(|| DEFAULT_NIX_INSTALL_URL.to_string()),
            no_swap: flag("NO_SWAP"),
            no_reboot: flag("NO_REBOOT"),
            network_config: flag("DO_NETCONF") || provider_needs_netconf,
            interfaces,
            extra_import: var("NIXOS_IMPORT"),
            provider,
            sudo_user: var("SUDO_USER"),
            home: var("HOME"),
            ..Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match &self.mode {
            InstallMode::Channel { channel, .. } => {
                if channel.is_empty() || channel.contains('/') {
                    return Err(TakeoverError::config(format!(
                        "Invalid channel name '{}'",
                        channel
                    )));
                }
            }
            InstallMode::Flake { uri, hostname } => {
                if uri.is_empty() || hostname.is_empty() {
                    return Err(TakeoverError::config(
                        "Flake mode requires both FLAKE_URI and FLAKE_HOSTNAME",
                    ));
                }
            }
        }

        if let InterfaceSelection::Named(names) = &self.interfaces {
            if names.is_empty() || names.len() > 2 {
                return Err(TakeoverError::config(
                    "NETWORK_INTERFACES must name one or two interfaces",
                ));
            }
        }

        if self.config_dir.is_relative() {
            return Err(TakeoverError::config(format!(
                "Configuration directory must be absolute: {}",
                self.config_dir.display()
            )));
        }

        Ok(())
    }

    /// Path of the main configuration file
    pub fn main_config_path(&self) -> PathBuf {
        self.config_dir.join("configuration.nix")
    }

    /// Path of the hardware configuration file
    pub fn hardware_config_path(&self) -> PathBuf {
        self.config_dir.join("hardware-configuration.nix")
    }

    /// Path of the network configuration file
    pub fn network_config_path(&self) -> PathBuf {
        self.config_dir.join("networking.nix")
    }
}
