//! Configuration synthesis
//!
//! Pure functions from [`SystemFacts`](crate::probe::SystemFacts) to Nix
//! text. Nothing in here touches the host; the orchestrator decides which
//! files get written.

pub mod expr;
pub mod hardware;
pub mod main_config;
pub mod networking;

pub use expr::{AttrSet, NixFile, Value};
pub use hardware::hardware_config;
pub use main_config::{main_config, MainImports};
pub use networking::network_config;

/// `system.stateVersion` written into fresh configurations
pub const STATE_VERSION: &str = "24.05";

/// File names inside the configuration directory
pub const HARDWARE_FILE: &str = "hardware-configuration.nix";
pub const NETWORK_FILE: &str = "networking.nix";
