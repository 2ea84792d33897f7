//! Live system introspection
//!
//! Probes only read: they run queries through [`CommandRunner`] and return
//! immutable fact records. Nothing here changes the host.

pub mod environment;
pub mod keys;
pub mod network;
pub mod swap;

pub use environment::{
    Architecture, BootTarget, EnvironmentProbe, FirmwareMode, HostIdentity, RootFilesystem,
};
pub use keys::AuthorizedKey;
pub use network::{DnsConfig, IpAddress, NetworkFacts, NetworkInterface, NetworkProbe, RouteInfo};
pub use swap::{SwapClassifier, SwapState};

use crate::config::Config;
use crate::error::Result;
use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};

/// Everything learned about the host before swap classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    pub arch: Architecture,
    pub firmware: FirmwareMode,
    pub boot: BootTarget,
    pub root: RootFilesystem,
    pub host: HostIdentity,
    pub keys: Vec<AuthorizedKey>,
    /// Present only when `networking.nix` was requested
    pub network: Option<NetworkFacts>,
}

/// The complete, immutable fact record handed to the synthesizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFacts {
    #[serde(flatten)]
    pub host: HostFacts,
    pub swap: SwapState,
}

impl SystemFacts {
    /// Combine host facts with the swap classification
    pub fn new(host: HostFacts, swap: SwapState) -> Self {
        Self { host, swap }
    }
}

/// Run every environment probe; fatal probe failures propagate
pub fn probe_host<R: CommandRunner + ?Sized>(runner: &R, config: &Config) -> Result<HostFacts> {
    let env = EnvironmentProbe::new(runner);

    let firmware = env.detect_firmware_mode();
    let arch = env.detect_architecture()?;
    log::info!("Firmware: {}, architecture: {}", firmware, arch);

    let boot = env.boot_target(firmware)?;
    match &boot {
        BootTarget::Efi { esp_identifier } => log::info!("ESP: {}", esp_identifier),
        BootTarget::Bios { device } => log::info!("GRUB device: {}", device),
    }

    let root = env.detect_root_filesystem()?;
    log::info!("Root filesystem: {} ({})", root.device, root.fs_type);

    let host = env.detect_host_identity()?;
    let keys = keys::find_authorized_keys(runner, config.sudo_user.as_deref(), config.home.as_deref());

    let network = if config.network_config {
        Some(NetworkProbe::new(runner).probe(&config.interfaces)?)
    } else {
        None
    };

    Ok(HostFacts {
        arch,
        firmware,
        boot,
        root,
        host,
        keys,
        network,
    })
}
