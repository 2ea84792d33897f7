//! Firmware, architecture, boot target and root filesystem detection

use crate::error::{Result, TakeoverError};
use crate::runner::CommandRunner;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Present only when the kernel was booted through UEFI
const EFI_FIRMWARE_DIR: &str = "/sys/firmware/efi";

/// Mount table
const MOUNTS: &str = "/proc/mounts";

/// Mount table with device numbers
const MOUNTINFO: &str = "/proc/self/mountinfo";

/// `<major>:<minor>` links into the block device tree
const SYS_DEV_BLOCK: &str = "/sys/dev/block";

/// Stable-identifier device namespace
const BY_UUID_DIR: &str = "/dev/disk/by-uuid";

/// Where cloud images mount their ESP, most specific first
const ESP_CANDIDATES: &[&str] = &["/boot/EFI", "/boot/efi", "/boot"];

/// Conventional whole-disk nodes for a BIOS GRUB install
const BOOT_DEVICE_CANDIDATES: &[&str] = &["/dev/vda", "/dev/sda", "/dev/xvda", "/dev/nvme0n1"];

/// Firmware boot mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareMode {
    Efi,
    Bios,
}

impl std::fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Efi => write!(f, "EFI"),
            Self::Bios => write!(f, "BIOS"),
        }
    }
}

/// Normalized CPU architecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Other(String),
}

impl Architecture {
    /// Normalize `uname -m` output
    pub fn from_uname(machine: &str) -> Self {
        match machine.trim() {
            "x86_64" | "amd64" => Self::X86_64,
            "aarch64" | "arm64" => Self::Aarch64,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X86_64 => write!(f, "x86_64"),
            Self::Aarch64 => write!(f, "aarch64"),
            Self::Other(machine) => write!(f, "{}", machine),
        }
    }
}

/// Where the boot loader gets installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootTarget {
    /// EFI install onto the ESP, referenced by a `/dev/disk/by-uuid` path
    Efi { esp_identifier: String },
    /// BIOS GRUB install onto a whole disk
    Bios { device: String },
}

/// The filesystem mounted at `/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFilesystem {
    pub device: String,
    pub fs_type: String,
}

/// Short host name and DNS domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub domain: Option<String>,
}

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
}

/// Parse `/proc/mounts`, decoding the octal escapes used for whitespace
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                source: unescape_mount_field(source),
                target: unescape_mount_field(target),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// `major:minor` of the last `/proc/self/mountinfo` entry mounted at `/`
pub fn root_device_number(mountinfo: &str) -> Option<String> {
    mountinfo
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let dev = fields.get(2)?;
            let mount_point = fields.get(4)?;
            (unescape_mount_field(mount_point) == "/").then(|| dev.to_string())
        })
        .last()
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Probe for boot-relevant facts of the running host
pub struct EnvironmentProbe<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
}

impl<'a, R: CommandRunner + ?Sized> EnvironmentProbe<'a, R> {
    /// Create a new probe
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// EFI when the firmware interface directory exists
    pub fn detect_firmware_mode(&self) -> FirmwareMode {
        if self.runner.exists(Path::new(EFI_FIRMWARE_DIR)) {
            FirmwareMode::Efi
        } else {
            FirmwareMode::Bios
        }
    }

    /// Normalized architecture from `uname -m`
    pub fn detect_architecture(&self) -> Result<Architecture> {
        let output = self.runner.run("uname", &["-m"])?;
        if !output.success() || output.stdout.trim().is_empty() {
            return Err(TakeoverError::probe("cannot determine CPU architecture"));
        }
        Ok(Architecture::from_uname(&output.stdout))
    }

    fn mounts(&self) -> Result<Vec<MountEntry>> {
        Ok(parse_mounts(&self.runner.read_to_string(Path::new(MOUNTS))?))
    }

    /// Resolve the mounted ESP to its `/dev/disk/by-uuid` path
    pub fn find_stable_esp(&self) -> Result<String> {
        let mounts = self.mounts()?;

        let esp_device = ESP_CANDIDATES
            .iter()
            .filter(|candidate| self.runner.exists(Path::new(candidate)))
            .find_map(|candidate| {
                mounts
                    .iter()
                    .rev()
                    .find(|m| m.target == *candidate)
                    .map(|m| m.source.clone())
            })
            .ok_or_else(|| TakeoverError::probe("no ESP"))?;

        log::debug!("ESP is mounted from {}", esp_device);

        let resolved = self
            .runner
            .canonicalize(Path::new(&esp_device))
            .unwrap_or_else(|_| PathBuf::from(&esp_device));

        for link in self.runner.read_dir(Path::new(BY_UUID_DIR))? {
            if let Ok(target) = self.runner.canonicalize(&link) {
                if target == resolved {
                    return Ok(link.to_string_lossy().into_owned());
                }
            }
        }

        Err(TakeoverError::probe(format!(
            "ESP {} has no stable identifier under {}",
            esp_device, BY_UUID_DIR
        )))
    }

    /// First conventional whole-disk node that exists
    ///
    /// When none exists the last candidate is returned as-is and the
    /// resulting GRUB device will be wrong.
    pub fn find_boot_device(&self) -> String {
        if let Some(device) = BOOT_DEVICE_CANDIDATES
            .iter()
            .find(|candidate| self.runner.exists(Path::new(candidate)))
        {
            return device.to_string();
        }

        let fallback = BOOT_DEVICE_CANDIDATES[BOOT_DEVICE_CANDIDATES.len() - 1];
        log::warn!(
            "None of {} exists; GRUB device will be {}",
            BOOT_DEVICE_CANDIDATES.join(", "),
            fallback
        );
        fallback.to_string()
    }

    /// Boot target for the given firmware mode
    pub fn boot_target(&self, mode: FirmwareMode) -> Result<BootTarget> {
        match mode {
            FirmwareMode::Efi => Ok(BootTarget::Efi {
                esp_identifier: self.find_stable_esp()?,
            }),
            FirmwareMode::Bios => Ok(BootTarget::Bios {
                device: self.find_boot_device(),
            }),
        }
    }

    /// Device and filesystem type mounted at `/`
    pub fn detect_root_filesystem(&self) -> Result<RootFilesystem> {
        let mounts = self.mounts()?;
        let root = mounts
            .iter()
            .rev()
            .find(|m| m.target == "/")
            .ok_or_else(|| TakeoverError::probe("no filesystem mounted at /"))?;

        if !root.source.starts_with("/dev/") {
            return Err(TakeoverError::probe(format!(
                "root filesystem is not a block device ({} of type {})",
                root.source, root.fs_type
            )));
        }

        Ok(RootFilesystem {
            device: self.resolve_root_device(&root.source)?,
            fs_type: root.fs_type.clone(),
        })
    }

    /// The mount source when the node exists, else the node behind the
    /// device number of `/` (`/dev/root` on many cloud images)
    fn resolve_root_device(&self, source: &str) -> Result<String> {
        if self.runner.exists(Path::new(source)) {
            return Ok(source.to_string());
        }
        log::debug!("{} does not exist, resolving / by device number", source);

        let unresolved = || {
            TakeoverError::probe(format!(
                "root filesystem {} does not resolve to a device node",
                source
            ))
        };
        let mountinfo = self
            .runner
            .read_to_string(Path::new(MOUNTINFO))
            .map_err(|_| unresolved())?;
        let number = root_device_number(&mountinfo).ok_or_else(unresolved)?;
        let sys_path = self
            .runner
            .canonicalize(&Path::new(SYS_DEV_BLOCK).join(&number))
            .map_err(|_| unresolved())?;
        let name = sys_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(unresolved)?;

        let device = format!("/dev/{}", name);
        if !self.runner.exists(Path::new(&device)) {
            return Err(unresolved());
        }
        log::info!("Root filesystem {} is {} ({})", source, device, number);
        Ok(device)
    }

    /// Host name and domain as the running system reports them
    pub fn detect_host_identity(&self) -> Result<HostIdentity> {
        let short = self.runner.run("hostname", &["-s"])?;
        let hostname = if short.success() && !short.stdout.trim().is_empty() {
            short.stdout.trim().to_string()
        } else {
            let fallback = self
                .runner
                .read_to_string(Path::new("/proc/sys/kernel/hostname"))
                .unwrap_or_default();
            let name = fallback.trim().split('.').next().unwrap_or("").to_string();
            if name.is_empty() {
                log::warn!("Could not determine host name, using 'nixos'");
                "nixos".to_string()
            } else {
                name
            }
        };

        let domain = self
            .runner
            .run("hostname", &["-d"])
            .ok()
            .filter(|o| o.success())
            .map(|o| o.stdout.trim().to_string())
            .filter(|d| !d.is_empty() && d != "(none)");

        Ok(HostIdentity { hostname, domain })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;

    const MOUNTS_EFI: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/vda1 / ext4 rw,relatime,discard,errors=remount-ro 0 0
/dev/vda15 /boot/efi vfat rw,relatime,fmask=0077,dmask=0077 0 0
";

    fn efi_host() -> FakeRunner {
        FakeRunner::new()
            .with_dir("/sys/firmware/efi")
            .with_dir("/boot")
            .with_dir("/boot/efi")
            .with_dir("/dev/disk/by-uuid")
            .with_file("/proc/mounts", MOUNTS_EFI)
            .with_file("/dev/vda1", "")
            .with_file("/dev/vda15", "")
            .with_link("/dev/disk/by-uuid/0b5e1a4c-0000-4d3c-9e1d-7a7e5c0f0001", "/dev/vda1")
            .with_link("/dev/disk/by-uuid/4A1B-22CD", "/dev/vda15")
    }

    #[test]
    fn test_firmware_mode() {
        assert_eq!(
            EnvironmentProbe::new(&efi_host()).detect_firmware_mode(),
            FirmwareMode::Efi
        );
        assert_eq!(
            EnvironmentProbe::new(&FakeRunner::new()).detect_firmware_mode(),
            FirmwareMode::Bios
        );
    }

    #[test]
    fn test_architecture_normalization() {
        assert_eq!(Architecture::from_uname("x86_64\n"), Architecture::X86_64);
        assert_eq!(Architecture::from_uname("aarch64"), Architecture::Aarch64);
        assert_eq!(
            Architecture::from_uname("riscv64"),
            Architecture::Other("riscv64".to_string())
        );

        let runner = FakeRunner::new().with_command("uname -m", "x86_64\n");
        assert_eq!(
            EnvironmentProbe::new(&runner).detect_architecture().unwrap(),
            Architecture::X86_64
        );
    }

    #[test]
    fn test_stable_esp_resolves_by_uuid() {
        let runner = efi_host();
        let probe = EnvironmentProbe::new(&runner);
        assert_eq!(probe.find_stable_esp().unwrap(), "/dev/disk/by-uuid/4A1B-22CD");

        let target = probe.boot_target(FirmwareMode::Efi).unwrap();
        assert_eq!(
            target,
            BootTarget::Efi {
                esp_identifier: "/dev/disk/by-uuid/4A1B-22CD".to_string()
            }
        );
    }

    #[test]
    fn test_stable_esp_missing_mount() {
        let runner = FakeRunner::new()
            .with_dir("/boot")
            .with_dir("/dev/disk/by-uuid")
            .with_file("/proc/mounts", "/dev/sda1 / ext4 rw 0 0\n");
        let err = EnvironmentProbe::new(&runner).find_stable_esp().unwrap_err();
        assert!(matches!(err, TakeoverError::ProbeFailure(ref m) if m == "no ESP"));
    }

    #[test]
    fn test_stable_esp_never_returns_device_node() {
        let runner = FakeRunner::new()
            .with_dir("/boot")
            .with_dir("/boot/efi")
            .with_dir("/dev/disk/by-uuid")
            .with_file("/dev/sda15", "")
            .with_file("/proc/mounts", "/dev/sda15 /boot/efi vfat rw 0 0\n");
        let err = EnvironmentProbe::new(&runner).find_stable_esp().unwrap_err();
        assert!(err.to_string().contains("/dev/sda15"));
        assert!(matches!(err, TakeoverError::ProbeFailure(_)));
    }

    #[test]
    fn test_boot_device_first_existing() {
        let runner = FakeRunner::new().with_file("/dev/sda", "").with_file("/dev/xvda", "");
        assert_eq!(EnvironmentProbe::new(&runner).find_boot_device(), "/dev/sda");
    }

    #[test]
    fn test_boot_device_falls_through_to_last_candidate() {
        let runner = FakeRunner::new();
        assert_eq!(
            EnvironmentProbe::new(&runner).find_boot_device(),
            "/dev/nvme0n1"
        );
    }

    #[test]
    fn test_root_filesystem() {
        let runner = efi_host();
        let root = EnvironmentProbe::new(&runner).detect_root_filesystem().unwrap();
        assert_eq!(
            root,
            RootFilesystem {
                device: "/dev/vda1".to_string(),
                fs_type: "ext4".to_string(),
            }
        );
    }

    #[test]
    fn test_root_filesystem_last_entry_wins() {
        let mounts = "rootfs / rootfs rw 0 0\n/dev/mapper/vg-root / xfs rw 0 0\n";
        let runner = FakeRunner::new()
            .with_file("/proc/mounts", mounts)
            .with_file("/dev/dm-0", "")
            .with_link("/dev/mapper/vg-root", "/dev/dm-0");
        let root = EnvironmentProbe::new(&runner).detect_root_filesystem().unwrap();
        assert_eq!(root.device, "/dev/mapper/vg-root");
        assert_eq!(root.fs_type, "xfs");
    }

    #[test]
    fn test_dev_root_resolved_through_device_number() {
        let runner = FakeRunner::new()
            .with_file("/proc/mounts", "/dev/root / ext4 rw,relatime 0 0\n")
            .with_file(
                "/proc/self/mountinfo",
                "1 0 0:22 / /proc rw - proc proc rw\n22 1 202:1 / / rw,relatime shared:1 - ext4 /dev/root rw,discard\n",
            )
            .with_dir("/sys/devices/vbd-51712/block/xvda/xvda1")
            .with_link(
                "/sys/dev/block/202:1",
                "/sys/devices/vbd-51712/block/xvda/xvda1",
            )
            .with_file("/dev/xvda1", "");
        let root = EnvironmentProbe::new(&runner).detect_root_filesystem().unwrap();
        assert_eq!(
            root,
            RootFilesystem {
                device: "/dev/xvda1".to_string(),
                fs_type: "ext4".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_root_node_rejected() {
        let runner = FakeRunner::new()
            .with_file("/proc/mounts", "/dev/root / ext4 rw,relatime 0 0\n")
            .with_file(
                "/proc/self/mountinfo",
                "22 1 202:1 / / rw,relatime shared:1 - ext4 /dev/root rw\n",
            );
        let err = EnvironmentProbe::new(&runner)
            .detect_root_filesystem()
            .unwrap_err();
        assert!(matches!(err, TakeoverError::ProbeFailure(ref m) if m.contains("/dev/root")));
    }

    #[test]
    fn test_root_device_number_last_entry() {
        let mountinfo = "22 1 8:1 / / rw - ext4 /dev/sda1 rw\n30 22 0:5 / /dev rw - devtmpfs udev rw\n31 22 8:2 / / rw - ext4 /dev/sda2 rw\n";
        assert_eq!(root_device_number(mountinfo).as_deref(), Some("8:2"));
        assert_eq!(root_device_number(""), None);
    }

    #[test]
    fn test_overlay_root_rejected() {
        let runner = FakeRunner::new().with_file("/proc/mounts", "overlay / overlay rw 0 0\n");
        let err = EnvironmentProbe::new(&runner)
            .detect_root_filesystem()
            .unwrap_err();
        assert!(matches!(err, TakeoverError::ProbeFailure(_)));
    }

    #[test]
    fn test_parse_mounts_unescapes_spaces() {
        let entries = parse_mounts("/dev/sdb1 /mnt/my\\040disk ext4 rw 0 0\n");
        assert_eq!(entries[0].target, "/mnt/my disk");
    }

    #[test]
    fn test_host_identity() {
        let runner = FakeRunner::new()
            .with_command("hostname -s", "web1\n")
            .with_command("hostname -d", "example.org\n");
        let host = EnvironmentProbe::new(&runner).detect_host_identity().unwrap();
        assert_eq!(host.hostname, "web1");
        assert_eq!(host.domain.as_deref(), Some("example.org"));

        let runner = FakeRunner::new()
            .with_command("hostname -s", "web1\n")
            .with_command("hostname -d", "\n");
        let host = EnvironmentProbe::new(&runner).detect_host_identity().unwrap();
        assert_eq!(host.domain, None);
    }

    #[test]
    fn test_host_identity_falls_back_to_procfs() {
        let runner =
            FakeRunner::new().with_file("/proc/sys/kernel/hostname", "db2.internal\n");
        let host = EnvironmentProbe::new(&runner).detect_host_identity().unwrap();
        assert_eq!(host.hostname, "db2");
    }
}
