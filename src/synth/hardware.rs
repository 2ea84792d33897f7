//! `hardware-configuration.nix`

use super::expr::{AttrSet, NixFile, Value};
use crate::error::{Result, TakeoverError};
use crate::probe::{Architecture, BootTarget, SystemFacts};

/// Only identifiers under this directory survive a reboot
pub const STABLE_ID_DIR: &str = "/dev/disk/by-uuid/";

const INITRD_MODULES: &[&str] = &["ata_piix", "uhci_hcd", "xen_blkfront"];
const INITRD_MODULES_X86_64: &[&str] = &["vmw_pvscsi"];

/// initrd modules for the architecture
pub fn initrd_modules(arch: &Architecture) -> Vec<&'static str> {
    let mut modules = INITRD_MODULES.to_vec();
    if *arch == Architecture::X86_64 {
        modules.extend_from_slice(INITRD_MODULES_X86_64);
    }
    modules
}

/// Render the hardware configuration
pub fn hardware_config(facts: &SystemFacts) -> Result<String> {
    let host = &facts.host;
    let mut body = AttrSet::new();
    body.set(
        "imports",
        vec![Value::add(
            Value::ident("modulesPath"),
            Value::from("/profiles/qemu-guest.nix"),
        )],
    );

    match &host.boot {
        BootTarget::Efi { esp_identifier } => {
            if !esp_identifier.starts_with(STABLE_ID_DIR) {
                return Err(TakeoverError::render(format!(
                    "ESP identifier '{}' is not a stable by-uuid path",
                    esp_identifier
                )));
            }
            body.set(
                "boot.loader.grub",
                AttrSet::new()
                    .with("efiSupport", true)
                    .with("efiInstallAsRemovable", true)
                    .with("device", "nodev"),
            )
            .set(
                ["fileSystems", "/boot"],
                AttrSet::new()
                    .with("device", esp_identifier.as_str())
                    .with("fsType", "vfat"),
            );
        }
        BootTarget::Bios { device } => {
            body.set("boot.loader.grub.device", device.as_str());
        }
    }

    body.set(
        "boot.initrd.availableKernelModules",
        Value::strings(initrd_modules(&host.arch)),
    )
    .set("boot.initrd.kernelModules", Value::strings(["nvme"]))
    .set(
        ["fileSystems", "/"],
        AttrSet::new()
            .with("device", host.root.device.as_str())
            .with("fsType", host.root.fs_type.as_str()),
    );

    if let Some(device) = facts.swap.device() {
        body.set(
            "swapDevices",
            vec![Value::from(AttrSet::new().with("device", device))],
        );
    }

    NixFile::module(&["modulesPath"], body)
        .comment("Generated by nixos-takeover from the running system.")
        .render()
}
