//! The takeover state machine
//!
//! ```text
//! CheckPrerequisites -> ProbeEnvironment -> ClassifySwap -> (ProvisionSwap)
//!     -> SynthesizeConfig -> RunInstaller -> (TeardownSwap) -> Done
//! ```
//!
//! Everything before `ProvisionSwap` is read-only. Once the temporary swap
//! is active it is torn down whatever happens next.

use crate::config::{Config, ConfigSource, InstallMode};
use crate::error::{Result, TakeoverError};
use crate::install::Installer;
use crate::probe::{self, SwapClassifier, SystemFacts};
use crate::runner::CommandRunner;
use crate::synth::{self, MainImports};
use crate::system::{self, SwapFile};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Paths preserved across the converting boot
pub const LUSTRATE_FILE: &str = "/etc/NIXOS_LUSTRATE";

/// Marks the root filesystem as NixOS
pub const NIXOS_MARKER: &str = "/etc/NIXOS";

const RESOLV_CONF: &str = "/etc/resolv.conf";
const SSH_DIR: &str = "/etc/ssh";

/// Always preserved besides the configuration directory, relative to `/`
const LUSTRATE_ENTRIES: &[&str] = &["etc/resolv.conf", "root/.nix-defexpr/channels"];

/// Tools that must exist regardless of options
const REQUIRED_TOOLS: &[&str] = &["bzcat", "xzcat", "groupadd", "useradd", "ip"];

/// Tools needed for the temporary swap file
const SWAP_TOOLS: &[&str] = &["mkswap", "swapon"];

/// Orchestrator stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    CheckPrerequisites,
    ProbeEnvironment,
    ClassifySwap,
    ProvisionSwap,
    SynthesizeConfig,
    RunInstaller,
    TeardownSwap,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CheckPrerequisites => write!(f, "check prerequisites"),
            Self::ProbeEnvironment => write!(f, "probe environment"),
            Self::ClassifySwap => write!(f, "classify swap"),
            Self::ProvisionSwap => write!(f, "provision swap"),
            Self::SynthesizeConfig => write!(f, "synthesize configuration"),
            Self::RunInstaller => write!(f, "run installer"),
            Self::TeardownSwap => write!(f, "tear down swap"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// What a run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Stages completed, in order
    pub stages: Vec<Stage>,
    /// Configuration files written
    pub written: Vec<PathBuf>,
    /// Configuration files left untouched because they already existed
    pub skipped: Vec<PathBuf>,
}

impl RunReport {
    fn passed(&mut self, stage: Stage) {
        log::debug!("Stage complete: {}", stage);
        self.stages.push(stage);
    }
}

/// Drives one takeover run
pub struct Orchestrator<'a, R: CommandRunner + ?Sized, I: Installer + ?Sized> {
    config: &'a Config,
    runner: &'a R,
    installer: &'a I,
    privileged: bool,
}

impl<'a, R: CommandRunner + ?Sized, I: Installer + ?Sized> Orchestrator<'a, R, I> {
    /// Create a new orchestrator for the current process
    pub fn new(config: &'a Config, runner: &'a R, installer: &'a I) -> Self {
        Self {
            config,
            runner,
            installer,
            privileged: system::is_root(),
        }
    }

    /// Override the privilege check result
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Run every stage, then reboot unless suppressed
    pub fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::default();

        log::info!("Starting NixOS takeover: {}", self.config.mode);
        if self.config.dry_run {
            log::warn!("DRY RUN MODE - No changes will be made");
        }

        self.check_prerequisites()?;
        report.passed(Stage::CheckPrerequisites);

        let host = self.probe_environment()?;
        report.passed(Stage::ProbeEnvironment);

        let swap = self.classify_swap()?;
        report.passed(Stage::ClassifySwap);

        let facts = SystemFacts::new(host, swap);

        let swapfile = if facts.swap.needs_temporary_file() {
            log::info!("Phase 4: Provisioning temporary swap");
            let swapfile = SwapFile::temporary();
            if let Err(e) = swapfile.provision(self.runner) {
                swapfile.teardown(self.runner);
                return Err(e);
            }
            report.passed(Stage::ProvisionSwap);
            Some(swapfile)
        } else {
            None
        };

        let result = self.build(&facts, &mut report);

        if let Some(swapfile) = &swapfile {
            log::info!("Phase 7: Tearing down temporary swap");
            swapfile.teardown(self.runner);
            report.passed(Stage::TeardownSwap);
        }
        result?;
        report.passed(Stage::Done);

        if self.config.no_reboot {
            log::info!("NO_REBOOT set; reboot to finish the conversion");
        } else {
            self.installer.reboot()?;
        }
        Ok(report)
    }

    /// Probe and classify without changing anything
    pub fn gather_facts(&self) -> Result<SystemFacts> {
        let host = self.probe_environment()?;
        let swap = self.classify_swap()?;
        Ok(SystemFacts::new(host, swap))
    }

    fn build(&self, facts: &SystemFacts, report: &mut RunReport) -> Result<()> {
        self.synthesize(facts, report)?;
        report.passed(Stage::SynthesizeConfig);
        self.run_installer(facts)?;
        report.passed(Stage::RunInstaller);
        Ok(())
    }

    /// Privileges and required tools
    pub fn check_prerequisites(&self) -> Result<()> {
        log::info!("Phase 1: Checking prerequisites");

        if !self.privileged {
            if self.config.dry_run {
                log::warn!("Not running as root; continuing because this is a dry run");
            } else {
                return Err(TakeoverError::prerequisite("must be run as root"));
            }
        }

        let mut missing = Vec::new();
        if !self.runner.has_command("curl") && !self.runner.has_command("wget") {
            missing.push("curl or wget".to_string());
        }
        let swap_tools = if self.config.no_swap { &[][..] } else { SWAP_TOOLS };
        for tool in REQUIRED_TOOLS.iter().chain(swap_tools) {
            if !self.runner.has_command(tool) {
                missing.push(tool.to_string());
            }
        }

        if !missing.is_empty() {
            return Err(TakeoverError::prerequisite(format!(
                "required tools not found: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn probe_environment(&self) -> Result<probe::HostFacts> {
        log::info!("Phase 2: Probing environment");
        probe::probe_host(self.runner, self.config)
    }

    fn classify_swap(&self) -> Result<probe::SwapState> {
        log::info!("Phase 3: Classifying swap");
        SwapClassifier::new(self.runner).classify(self.config.no_swap)
    }

    fn write(&self, path: &Path, contents: &str, report: &mut RunReport) -> Result<()> {
        log::info!("Writing {}", path.display());
        self.runner.write_file(path, contents)?;
        report.written.push(path.to_path_buf());
        Ok(())
    }

    /// Write the configuration files
    ///
    /// An existing `configuration.nix` keeps the main/hardware pair untouched;
    /// `networking.nix` is regenerated whenever it was requested. Flake mode
    /// never writes the main file.
    pub fn synthesize(&self, facts: &SystemFacts, report: &mut RunReport) -> Result<()> {
        log::info!("Phase 5: Synthesizing configuration");
        self.runner.create_dir_all(&self.config.config_dir)?;

        let main_path = self.config.main_config_path();
        let hardware_path = self.config.hardware_config_path();

        if self.runner.exists(&main_path) {
            log::info!(
                "{} already exists, keeping the existing configuration",
                main_path.display()
            );
            report.skipped.push(main_path);
            report.skipped.push(hardware_path);
        } else {
            // Render everything before the first write
            let hardware = synth::hardware_config(facts)?;
            if let InstallMode::Channel { source, .. } = &self.config.mode {
                match source {
                    ConfigSource::Url(url) => {
                        log::info!("Fetching {} as {}", url, main_path.display());
                        self.installer.fetch_config(url, &main_path)?;
                        report.written.push(main_path);
                    }
                    ConfigSource::Generated | ConfigSource::Path(_) => {
                        let imports = MainImports {
                            network: facts.host.network.is_some(),
                            extra: self.config.extra_import.as_deref(),
                        };
                        let main = synth::main_config(facts, &imports)?;
                        self.write(&main_path, &main, report)?;
                    }
                }
            }
            self.write(&hardware_path, &hardware, report)?;
        }

        if let Some(network) = &facts.host.network {
            let text = synth::network_config(network)?;
            self.write(&self.config.network_config_path(), &text, report)?;
        }
        Ok(())
    }

    fn run_installer(&self, facts: &SystemFacts) -> Result<()> {
        log::info!("Phase 6: Installing NixOS");
        self.installer.install_nix()?;

        let main_config = match &self.config.mode {
            InstallMode::Channel {
                source: ConfigSource::Path(path),
                ..
            } => path.clone(),
            _ => self.config.main_config_path(),
        };
        self.installer.build_system(&self.config.mode, &main_config)?;

        if let Err(e) = self.reify_resolv_conf() {
            log::warn!("{}", TakeoverError::best_effort("preserve resolv.conf", e));
        }
        if !self.runner.exists(Path::new(NIXOS_MARKER)) {
            self.runner.write_file(Path::new(NIXOS_MARKER), "")?;
        }
        self.write_lustrate()?;

        self.installer.activate(&facts.host.boot)
    }

    /// Replace a symlinked resolv.conf with a plain copy of its contents
    ///
    /// The link target usually lives under `/run` and is gone after lustration.
    fn reify_resolv_conf(&self) -> Result<()> {
        let path = Path::new(RESOLV_CONF);
        if !self.runner.is_symlink(path) {
            return Ok(());
        }
        let contents = self.runner.read_to_string(path)?;
        let backup = PathBuf::from(format!("{}.lnk", RESOLV_CONF));
        log::info!("Replacing symlinked {} with its contents", RESOLV_CONF);
        self.runner.rename(path, &backup)?;
        self.runner.write_file(path, &contents)
    }

    /// Entries for the lustrate marker, host keys included
    pub fn lustrate_entries(&self) -> Vec<String> {
        let config_dir = self.config.config_dir.to_string_lossy();
        let mut entries = vec![config_dir.trim_start_matches('/').to_string()];
        entries.extend(LUSTRATE_ENTRIES.iter().map(|e| e.to_string()));
        match self.runner.read_dir(Path::new(SSH_DIR)) {
            Ok(files) => {
                for file in files {
                    let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if name.starts_with("ssh_host_") && name.contains("_key") {
                        entries.push(format!("etc/ssh/{}", name));
                    }
                }
            }
            Err(e) => log::warn!("Cannot list {}: {}", SSH_DIR, e),
        }
        entries
    }

    /// Merge the preserve list into the lustrate marker without duplicates
    fn write_lustrate(&self) -> Result<()> {
        let path = Path::new(LUSTRATE_FILE);
        let existing = if self.runner.exists(path) {
            self.runner.read_to_string(path)?
        } else {
            String::new()
        };

        let mut lines: Vec<String> = existing
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        for entry in self.lustrate_entries() {
            if !lines.contains(&entry) {
                lines.push(entry);
            }
        }

        let mut contents = lines.join("\n");
        contents.push('\n');
        log::info!("Writing {} ({} entries)", LUSTRATE_FILE, lines.len());
        self.runner.write_file(path, &contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceSelection;
    use crate::install::MockInstaller;
    use crate::probe::BootTarget;
    use crate::runner::fake::FakeRunner;
    use pretty_assertions::assert_eq;

    const TOOLS: &[&str] = &[
        "curl", "bzcat", "xzcat", "groupadd", "useradd", "ip", "mkswap", "swapon",
    ];

    const ADDR_JSON: &str = r#"[
      {"ifindex":1,"ifname":"lo","link_type":"loopback","address":"00:00:00:00:00:00",
       "addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8}]},
      {"ifindex":2,"ifname":"eth0","link_type":"ether","address":"52:54:00:12:34:56",
       "addr_info":[{"family":"inet","local":"10.0.0.5","prefixlen":24}]}
    ]"#;

    /// A BIOS KVM guest with one NIC and a systemd-resolved stub
    fn bios_host() -> FakeRunner {
        FakeRunner::new()
            .with_tools(TOOLS)
            .with_command("uname -m", "x86_64\n")
            .with_command("hostname -s", "web1\n")
            .with_file("/proc/mounts", "/dev/vda1 / ext4 rw,relatime 0 0\nproc /proc proc rw 0 0\n")
            .with_file("/dev/vda", "")
            .with_file("/dev/vda1", "")
            .with_file(
                "/root/.ssh/authorized_keys",
                "ssh-ed25519 AAAAC3 ops@example\n",
            )
            .with_command("ip -j address show", ADDR_JSON)
            .with_command(
                "ip -j route show dev eth0",
                r#"[{"dst":"default","gateway":"10.0.0.1","protocol":"static"},{"dst":"10.0.0.0/24","prefsrc":"10.0.0.5"}]"#,
            )
            .with_file("/run/systemd/resolve/stub-resolv.conf", "nameserver 127.0.0.53\n")
            .with_link("/etc/resolv.conf", "/run/systemd/resolve/stub-resolv.conf")
            .with_dir("/etc/ssh")
            .with_file("/etc/ssh/ssh_host_ed25519_key", "private")
            .with_file("/etc/ssh/ssh_host_ed25519_key.pub", "public")
            .with_file("/etc/ssh/sshd_config", "")
    }

    fn network_config() -> Config {
        let mut config = Config::default();
        config.network_config = true;
        config
    }

    fn installer_expecting_full_run(reboots: usize) -> MockInstaller {
        let mut installer = MockInstaller::new();
        installer.expect_install_nix().times(1).returning(|| Ok(()));
        installer
            .expect_build_system()
            .withf(|mode, path| {
                matches!(mode, InstallMode::Channel { .. })
                    && path == Path::new("/etc/nixos/configuration.nix")
            })
            .times(1)
            .returning(|_, _| Ok(()));
        installer
            .expect_activate()
            .withf(|boot| {
                *boot
                    == BootTarget::Bios {
                        device: "/dev/vda".to_string(),
                    }
            })
            .times(1)
            .returning(|_| Ok(()));
        installer.expect_reboot().times(reboots).returning(|| Ok(()));
        installer
    }

    #[test]
    fn test_end_to_end_single_interface() {
        let runner = bios_host();
        let config = network_config();
        let installer = installer_expecting_full_run(1);

        let report = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap();

        assert_eq!(
            report.stages,
            vec![
                Stage::CheckPrerequisites,
                Stage::ProbeEnvironment,
                Stage::ClassifySwap,
                Stage::ProvisionSwap,
                Stage::SynthesizeConfig,
                Stage::RunInstaller,
                Stage::TeardownSwap,
                Stage::Done,
            ]
        );
        assert_eq!(
            report.written,
            vec![
                PathBuf::from("/etc/nixos/configuration.nix"),
                PathBuf::from("/etc/nixos/hardware-configuration.nix"),
                PathBuf::from("/etc/nixos/networking.nix"),
            ]
        );

        let networking = runner.file("/etc/nixos/networking.nix").unwrap();
        assert!(networking.contains("  networking.nameservers = [ \"8.8.8.8\" ];\n"));
        assert!(networking.contains("  networking.defaultGateway = \"10.0.0.1\";\n"));
        assert!(networking.contains("      { address = \"10.0.0.5\"; prefixLength = 24; }\n"));
        assert!(networking.contains("      { address = \"10.0.0.1\"; prefixLength = 32; }\n"));
        assert!(networking.contains("networking.usePredictableInterfaceNames = lib.mkForce false;"));
        assert!(networking.contains("ATTR{address}==\"52:54:00:12:34:56\", NAME=\"eth0\""));

        let main = runner.file("/etc/nixos/configuration.nix").unwrap();
        assert!(main.contains("./networking.nix"));
        assert!(main.contains("\"ssh-ed25519 AAAAC3 ops@example\""));
        assert!(main.contains("  networking.hostName = \"web1\";\n"));

        let hardware = runner.file("/etc/nixos/hardware-configuration.nix").unwrap();
        assert!(hardware.contains("  boot.loader.grub.device = \"/dev/vda\";\n"));
        assert!(hardware.contains("  fileSystems.\"/\" = { device = \"/dev/vda1\"; fsType = \"ext4\"; };\n"));

        assert_eq!(
            runner.file(LUSTRATE_FILE).unwrap(),
            "etc/nixos\netc/resolv.conf\nroot/.nix-defexpr/channels\netc/ssh/ssh_host_ed25519_key\netc/ssh/ssh_host_ed25519_key.pub\n"
        );
        assert_eq!(runner.file(NIXOS_MARKER).as_deref(), Some(""));
        assert_eq!(
            runner.file("/etc/resolv.conf").as_deref(),
            Some("nameserver 127.0.0.53\n")
        );
        assert!(runner.is_symlink(Path::new("/etc/resolv.conf.lnk")));

        let executed = runner.executed();
        let swapon = executed
            .iter()
            .position(|c| c.starts_with("swapon /tmp/nixos-takeover."))
            .unwrap();
        let swapoff = executed
            .iter()
            .position(|c| c.starts_with("swapoff /tmp/nixos-takeover."))
            .unwrap();
        assert!(swapon < swapoff);
    }

    #[test]
    fn test_existing_swap_device_skips_provisioning() {
        let runner = bios_host().with_command(
            "swapon --show=NAME,TYPE --noheadings --raw",
            "/dev/vda2 partition\n",
        );
        let config = Config::default();
        let installer = installer_expecting_full_run(1);

        let report = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap();

        assert!(!report.stages.contains(&Stage::ProvisionSwap));
        assert!(!report.stages.contains(&Stage::TeardownSwap));
        assert!(!runner.ran("dd "));
        assert!(!runner.ran("swapoff"));

        let hardware = runner.file("/etc/nixos/hardware-configuration.nix").unwrap();
        assert!(hardware.contains("{ device = \"/dev/vda2\"; }"));
        let main = runner.file("/etc/nixos/configuration.nix").unwrap();
        assert!(main.contains("  zramSwap.enable = false;\n"));
        assert!(!main.contains("networking.nix"));
    }

    #[test]
    fn test_existing_configuration_is_kept() {
        let runner = bios_host().with_file("/etc/nixos/configuration.nix", "{ ... }: { }\n");
        let config = network_config();
        let installer = installer_expecting_full_run(1);

        let report = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap();

        assert_eq!(
            runner.file("/etc/nixos/configuration.nix").as_deref(),
            Some("{ ... }: { }\n")
        );
        assert!(runner.file("/etc/nixos/hardware-configuration.nix").is_none());
        assert!(runner.file("/etc/nixos/networking.nix").is_some());
        assert_eq!(
            report.skipped,
            vec![
                PathBuf::from("/etc/nixos/configuration.nix"),
                PathBuf::from("/etc/nixos/hardware-configuration.nix"),
            ]
        );
        assert_eq!(report.written, vec![PathBuf::from("/etc/nixos/networking.nix")]);
    }

    #[test]
    fn test_build_failure_still_tears_down_swap() {
        let runner = bios_host();
        let config = Config::default();
        let mut installer = MockInstaller::new();
        installer.expect_install_nix().times(1).returning(|| Ok(()));
        installer.expect_build_system().times(1).returning(|_, _| {
            Err(TakeoverError::ExternalToolFailure {
                cmd: "nix-env".to_string(),
                code: 1,
                stderr: "evaluation error".to_string(),
            })
        });
        installer.expect_activate().times(0);
        installer.expect_reboot().times(0);

        let err = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap_err();

        assert!(matches!(err, TakeoverError::ExternalToolFailure { .. }));
        assert!(runner.ran("swapoff /tmp/nixos-takeover."));
        assert!(runner.file(LUSTRATE_FILE).is_none());
    }

    #[test]
    fn test_no_reboot() {
        let runner = bios_host();
        let mut config = Config::default();
        config.no_reboot = true;
        let installer = installer_expecting_full_run(0);

        let report = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap();
        assert_eq!(report.stages.last(), Some(&Stage::Done));
    }

    #[test]
    fn test_missing_tools_abort_before_any_change() {
        let runner = FakeRunner::new().with_tools(&["bzcat", "ip"]);
        let config = Config::default();
        let installer = MockInstaller::new();

        let err = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap_err();

        match err {
            TakeoverError::PrerequisiteMissing(msg) => {
                assert!(msg.contains("curl or wget"));
                assert!(msg.contains("xzcat"));
                assert!(msg.contains("mkswap"));
                assert!(!msg.contains("bzcat"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(runner.executed().is_empty());
    }

    #[test]
    fn test_swap_tools_optional_with_no_swap() {
        let runner = FakeRunner::new().with_tools(&["wget", "bzcat", "xzcat", "groupadd", "useradd", "ip"]);
        let mut config = Config::default();
        config.no_swap = true;
        let installer = MockInstaller::new();

        assert!(Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .check_prerequisites()
            .is_ok());
    }

    #[test]
    fn test_requires_root() {
        let runner = bios_host();
        let config = Config::default();
        let installer = MockInstaller::new();

        let err = Orchestrator::new(&config, &runner, &installer)
            .privileged(false)
            .run()
            .unwrap_err();
        assert!(matches!(err, TakeoverError::PrerequisiteMissing(_)));
    }

    #[test]
    fn test_probe_failure_aborts_before_swap() {
        // EFI firmware, but no ESP mounted anywhere
        let runner = bios_host().with_dir("/sys/firmware/efi");
        let config = Config::default();
        let installer = MockInstaller::new();

        let err = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap_err();
        assert!(matches!(err, TakeoverError::ProbeFailure(_)));
        assert!(runner.executed().is_empty());
    }

    #[test]
    fn test_config_url_is_fetched() {
        let runner = bios_host();
        let mut config = Config::default();
        config.mode = InstallMode::Channel {
            channel: "nixos-24.05".to_string(),
            source: ConfigSource::Url("https://example.org/configuration.nix".to_string()),
        };
        let mut installer = installer_expecting_full_run(1);
        installer
            .expect_fetch_config()
            .withf(|url, dest| {
                url == "https://example.org/configuration.nix"
                    && dest == Path::new("/etc/nixos/configuration.nix")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let report = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap();
        assert!(runner.file("/etc/nixos/configuration.nix").is_none());
        assert!(runner.file("/etc/nixos/hardware-configuration.nix").is_some());
        assert!(report
            .written
            .contains(&PathBuf::from("/etc/nixos/configuration.nix")));
    }

    #[test]
    fn test_config_path_is_built() {
        let runner = bios_host();
        let mut config = Config::default();
        config.mode = InstallMode::Channel {
            channel: "nixos-24.05".to_string(),
            source: ConfigSource::Path(PathBuf::from("/srv/site/configuration.nix")),
        };
        let mut installer = MockInstaller::new();
        installer.expect_install_nix().returning(|| Ok(()));
        installer
            .expect_build_system()
            .withf(|_, path| path == Path::new("/srv/site/configuration.nix"))
            .times(1)
            .returning(|_, _| Ok(()));
        installer.expect_activate().returning(|_| Ok(()));
        installer.expect_reboot().returning(|| Ok(()));

        Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap();
    }

    #[test]
    fn test_flake_mode_writes_hardware_but_not_main() {
        let runner = bios_host();
        let mut config = network_config();
        config.mode = InstallMode::Flake {
            uri: "github:example/hosts".to_string(),
            hostname: "web1".to_string(),
        };
        let mut installer = MockInstaller::new();
        installer.expect_install_nix().returning(|| Ok(()));
        installer
            .expect_build_system()
            .withf(|mode, _| matches!(mode, InstallMode::Flake { .. }))
            .times(1)
            .returning(|_, _| Ok(()));
        installer.expect_activate().returning(|_| Ok(()));
        installer.expect_reboot().returning(|| Ok(()));

        let report = Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap();
        assert_eq!(
            report.written,
            vec![
                PathBuf::from("/etc/nixos/hardware-configuration.nix"),
                PathBuf::from("/etc/nixos/networking.nix"),
            ]
        );
        assert!(report.skipped.is_empty());
        assert!(runner.file("/etc/nixos/configuration.nix").is_none());

        let hardware = runner.file("/etc/nixos/hardware-configuration.nix").unwrap();
        assert!(hardware.contains("  boot.loader.grub.device = \"/dev/vda\";\n"));
        assert!(hardware.contains("  fileSystems.\"/\" = { device = \"/dev/vda1\"; fsType = \"ext4\"; };\n"));
    }

    #[test]
    fn test_flake_mode_keeps_existing_configuration() {
        let runner = bios_host().with_file("/etc/nixos/configuration.nix", "{ ... }: { }\n");
        let mut config = Config::default();
        config.mode = InstallMode::Flake {
            uri: "github:example/hosts".to_string(),
            hostname: "web1".to_string(),
        };
        let installer = MockInstaller::new();
        let facts = Orchestrator::new(&config, &runner, &installer)
            .gather_facts()
            .unwrap();

        let mut report = RunReport::default();
        Orchestrator::new(&config, &runner, &installer)
            .synthesize(&facts, &mut report)
            .unwrap();
        assert!(report.written.is_empty());
        assert!(runner.file("/etc/nixos/hardware-configuration.nix").is_none());
    }

    #[test]
    fn test_lustrate_merges_existing_entries() {
        let runner = bios_host().with_file(LUSTRATE_FILE, "etc/nixos\nvar/lib/keep\n");
        let config = Config::default();
        let installer = installer_expecting_full_run(1);

        Orchestrator::new(&config, &runner, &installer)
            .privileged(true)
            .run()
            .unwrap();

        let lustrate = runner.file(LUSTRATE_FILE).unwrap();
        assert_eq!(lustrate.matches("etc/nixos\n").count(), 1);
        assert!(lustrate.starts_with("etc/nixos\nvar/lib/keep\netc/resolv.conf\n"));
    }

    #[test]
    fn test_lustrate_follows_config_dir() {
        let runner = bios_host();
        let mut config = Config::default();
        config.config_dir = PathBuf::from("/srv/nixos");
        let installer = MockInstaller::new();

        let entries = Orchestrator::new(&config, &runner, &installer).lustrate_entries();
        assert_eq!(entries[0], "srv/nixos");
        assert!(!entries.contains(&"etc/nixos".to_string()));
        assert!(entries.contains(&"etc/resolv.conf".to_string()));
    }

    #[test]
    fn test_named_interface_selection() {
        let runner = bios_host();
        let mut config = network_config();
        config.interfaces = InterfaceSelection::Named(vec!["eth0".to_string()]);
        let installer = MockInstaller::new();

        let facts = Orchestrator::new(&config, &runner, &installer)
            .gather_facts()
            .unwrap();
        let network = facts.host.network.unwrap();
        assert_eq!(network.primary.name, "eth0");
        assert!(network.unconfigured.is_empty());
        assert!(runner.executed().is_empty());
    }
}
