//! Nix installation, system build and activation
//!
//! The orchestrator only talks to the [`Installer`] trait. [`NixInstaller`]
//! drives the upstream installer script and the Nix tools through a
//! [`CommandRunner`].

use crate::config::InstallMode;
use crate::error::{Result, TakeoverError};
use crate::probe::BootTarget;
use crate::runner::CommandRunner;
use std::path::Path;

/// Profile the new system is built into
pub const SYSTEM_PROFILE: &str = "/nix/var/nix/profiles/system";

/// Where the single-user install puts the Nix tools for root
const NIX_BIN: &str = "/root/.nix-profile/bin";

/// Channel checkout used as `nixpkgs` in channel mode
const CHANNEL_PATH: &str = "/root/.nix-defexpr/channels/nixos";

const INSTALL_SCRIPT: &str = "/tmp/nix-install.sh";
const BUILD_USERS: u32 = 10;
const BUILD_GROUP_ID: &str = "30000";

/// External collaborator performing the irreversible steps
#[cfg_attr(test, mockall::automock)]
pub trait Installer {
    /// Download and run the Nix installer
    fn install_nix(&self) -> Result<()>;

    /// Download a configuration file verbatim
    fn fetch_config(&self, url: &str, dest: &Path) -> Result<()>;

    /// Build the system profile
    fn build_system(&self, mode: &InstallMode, main_config: &Path) -> Result<()>;

    /// Move the old boot files aside and install the new boot loader
    fn activate(&self, boot: &BootTarget) -> Result<()>;

    /// Reboot into NixOS
    fn reboot(&self) -> Result<()>;
}

/// [`Installer`] backed by the upstream Nix tooling
pub struct NixInstaller<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    install_url: String,
}

impl<'a, R: CommandRunner + ?Sized> NixInstaller<'a, R> {
    /// Create a new installer
    pub fn new(runner: &'a R, install_url: &str) -> Self {
        Self {
            runner,
            install_url: install_url.to_string(),
        }
    }

    fn nix_tool(name: &str) -> String {
        format!("{}/{}", NIX_BIN, name)
    }

    /// Log a failed step without aborting
    fn best_effort(&self, step: &str, result: Result<impl Sized>) {
        if let Err(e) = result {
            log::warn!("{}", TakeoverError::best_effort(step, e));
        }
    }

    /// Download `url` to `dest` with curl, falling back to wget
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_str().ok_or_else(|| {
            TakeoverError::config(format!("download target {} is not UTF-8", dest.display()))
        })?;
        log::info!("Downloading {}", url);
        if self.runner.has_command("curl") {
            self.runner.execute("curl", &["-fsSL", "-o", dest, url])?;
        } else {
            self.runner.execute("wget", &["-q", "-O", dest, url])?;
        }
        Ok(())
    }

    /// The `nixbld` group and users the installer expects to exist
    fn create_build_users(&self) {
        self.best_effort(
            "groupadd nixbld",
            self.runner
                .execute("groupadd", &["-r", "-g", BUILD_GROUP_ID, "nixbld"]),
        );
        for i in 1..=BUILD_USERS {
            let name = format!("nixbld{}", i);
            let comment = format!("Nix build user {}", i);
            self.best_effort(
                &format!("useradd {}", name),
                self.runner.execute(
                    "useradd",
                    &[
                        "-c", &comment, "-d", "/var/empty", "-g", "nixbld", "-G", "nixbld", "-M",
                        "-N", "-r", "-s", "/sbin/nologin", &name,
                    ],
                ),
            );
        }
    }

    fn build_from_channel(&self, channel: &str, main_config: &Path) -> Result<()> {
        let config = main_config.to_str().ok_or_else(|| {
            TakeoverError::config(format!(
                "configuration path {} is not UTF-8",
                main_config.display()
            ))
        })?;
        let nix_channel = Self::nix_tool("nix-channel");
        let channel_url = format!("https://nixos.org/channels/{}", channel);

        self.best_effort(
            "remove nixpkgs channel",
            self.runner.execute(&nix_channel, &["--remove", "nixpkgs"]),
        );
        self.runner
            .execute(&nix_channel, &["--add", &channel_url, "nixos"])?;
        self.runner.execute_interactive(&nix_channel, &["--update"])?;

        let nixpkgs = format!("nixpkgs={}", CHANNEL_PATH);
        let nixos_config = format!("nixos-config={}", config);
        self.runner.execute_interactive(
            &Self::nix_tool("nix-env"),
            &[
                "--set",
                "-I",
                &nixpkgs,
                "-I",
                &nixos_config,
                "-f",
                "<nixpkgs/nixos>",
                "-p",
                SYSTEM_PROFILE,
                "-A",
                "system",
            ],
        )
    }

    fn build_from_flake(&self, uri: &str, hostname: &str) -> Result<()> {
        let installable = format!(
            "{}#nixosConfigurations.\"{}\".config.system.build.toplevel",
            uri, hostname
        );
        self.runner.execute_interactive(
            &Self::nix_tool("nix"),
            &[
                "--extra-experimental-features",
                "nix-command flakes",
                "build",
                "--profile",
                SYSTEM_PROFILE,
                &installable,
            ],
        )
    }

    /// Move `/boot` aside; a mounted `/boot` is copied, emptied and unmounted
    fn backup_boot(&self) -> Result<()> {
        if self.runner.execute("mv", &["/boot", "/boot.bak"]).is_ok() {
            return Ok(());
        }
        log::info!("/boot cannot be moved, copying it instead");
        self.runner.execute("cp", &["-a", "/boot", "/boot.bak"])?;
        self.runner
            .execute("find", &["/boot", "-mindepth", "1", "-delete"])?;
        self.best_effort("umount /boot", self.runner.execute("umount", &["/boot"]));
        Ok(())
    }
}

impl<R: CommandRunner + ?Sized> Installer for NixInstaller<'_, R> {
    fn install_nix(&self) -> Result<()> {
        log::info!("Installing Nix from {}", self.install_url);
        self.create_build_users();
        self.download(&self.install_url, Path::new(INSTALL_SCRIPT))?;
        self.runner.execute_interactive(
            "env",
            &[
                "USER=root",
                "HOME=/root",
                "sh",
                INSTALL_SCRIPT,
                "--no-channel-add",
            ],
        )?;
        self.best_effort(
            "remove installer script",
            self.runner.remove_file(Path::new(INSTALL_SCRIPT)),
        );
        Ok(())
    }

    fn fetch_config(&self, url: &str, dest: &Path) -> Result<()> {
        self.download(url, dest)
    }

    fn build_system(&self, mode: &InstallMode, main_config: &Path) -> Result<()> {
        log::info!("Building NixOS system: {}", mode);
        match mode {
            InstallMode::Channel { channel, .. } => self.build_from_channel(channel, main_config),
            InstallMode::Flake { uri, hostname } => self.build_from_flake(uri, hostname),
        }
    }

    fn activate(&self, boot: &BootTarget) -> Result<()> {
        self.backup_boot()?;

        if let BootTarget::Efi { esp_identifier } = boot {
            self.runner.execute("mkdir", &["-p", "/boot"])?;
            self.runner.execute("mount", &[esp_identifier.as_str(), "/boot"])?;
            self.runner
                .execute("find", &["/boot", "-mindepth", "1", "-delete"])?;
        }

        let switch = format!("{}/bin/switch-to-configuration", SYSTEM_PROFILE);
        self.runner.execute_interactive(
            "env",
            &["NIXOS_INSTALL_BOOTLOADER=1", &switch, "boot"],
        )
    }

    fn reboot(&self) -> Result<()> {
        log::info!("Rebooting into NixOS");
        self.runner.execute("reboot", &[])?;
        Ok(())
    }
}
