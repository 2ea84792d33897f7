//! `configuration.nix`

use super::expr::{AttrSet, NixFile, Value};
use super::{HARDWARE_FILE, NETWORK_FILE, STATE_VERSION};
use crate::error::Result;
use crate::probe::SystemFacts;

/// Optional imports of the main configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainImports<'a> {
    /// Import `networking.nix`
    pub network: bool,
    /// Extra user-supplied path
    pub extra: Option<&'a str>,
}

/// Render the main configuration
pub fn main_config(facts: &SystemFacts, imports: &MainImports<'_>) -> Result<String> {
    let mut import_list = vec![Value::path(format!("./{}", HARDWARE_FILE))];
    if imports.network {
        import_list.push(Value::path(format!("./{}", NETWORK_FILE)));
    }
    if let Some(extra) = imports.extra {
        import_list.push(Value::path(extra));
    }

    let host = &facts.host.host;
    let mut body = AttrSet::new();
    body.set("imports", import_list)
        .set("boot.tmp.cleanOnBoot", true)
        .set("zramSwap.enable", facts.swap.device().is_none())
        .set("networking.hostName", host.hostname.as_str());
    if let Some(domain) = &host.domain {
        body.set("networking.domain", domain.as_str());
    }
    body.set("services.openssh.enable", true)
        .set(
            "users.users.root.openssh.authorizedKeys.keys",
            Value::strings(facts.host.keys.iter().map(|k| k.to_string())),
        )
        .set("system.stateVersion", STATE_VERSION);

    NixFile::module(&[], body)
        .comment("Generated by nixos-takeover from the running system.")
        .render()
}
