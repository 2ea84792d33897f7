//! NixOS Takeover Library
//!
//! Converts a running, generically provisioned Linux host into NixOS in
//! place:
//! - Probes firmware, boot target, root filesystem, network and swap
//! - Synthesizes `configuration.nix`, `hardware-configuration.nix` and
//!   optionally `networking.nix` describing that same host
//! - Installs Nix, builds the system and hands the next boot to NixOS
//!
//! # Architecture
//!
//! The engine is organized into modules:
//! - `runner`: command execution and filesystem access, the only I/O boundary
//! - `probe`: read-only introspection producing immutable fact records
//! - `synth`: typed Nix expression builder and the three renderers
//! - `install`: the Nix installer/build/activation collaborator
//! - `orchestrator`: the stage machine tying it together
//! - `system`: privileges and the temporary swap file
//! - `config`: environment-driven configuration
//! - `error`: error types and handling
//!
//! # Example
//!
//! ```rust,no_run
//! use nixos_takeover::*;
//!
//! # fn main() -> Result<()> {
//! let config = Config::from_env()?;
//! let runner = SystemRunner::new(config.dry_run);
//! let installer = NixInstaller::new(&runner, &config.nix_install_url);
//!
//! let report = Orchestrator::new(&config, &runner, &installer).run()?;
//! for path in &report.written {
//!     println!("wrote {}", path.display());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod install;
pub mod orchestrator;
pub mod probe;
pub mod runner;
pub mod synth;
pub mod system;

// Re-export commonly used types
pub use config::{Config, ConfigSource, InstallMode, InterfaceSelection};
pub use error::{Result, TakeoverError};
pub use install::{Installer, NixInstaller};
pub use orchestrator::{Orchestrator, RunReport, Stage};
pub use probe::SystemFacts;
pub use runner::{CommandRunner, SystemRunner};
