//! `networking.nix`
//!
//! Pins the live addressing, gateways and resolvers as static configuration
//! and keeps interface names stable with udev rules keyed on MAC address.

use super::expr::{AttrSet, NixFile, Value};
use crate::error::{Result, TakeoverError};
use crate::probe::{IpAddress, NetworkFacts, NetworkInterface};
use regex::Regex;
use std::sync::OnceLock;

fn mac_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("valid regex"))
}

fn addresses(list: &[IpAddress]) -> Value {
    Value::List(
        list.iter()
            .map(|ip| {
                Value::from(
                    AttrSet::new()
                        .with("address", ip.address.as_str())
                        .with("prefixLength", ip.prefix_length),
                )
            })
            .collect(),
    )
}

fn host_route(gateway: &str, prefix_length: u8) -> Value {
    Value::List(vec![Value::from(
        AttrSet::new()
            .with("address", gateway)
            .with("prefixLength", prefix_length),
    )])
}

/// udev rule pinning an interface name to its MAC; `None` without a usable MAC
fn udev_rule(iface: &NetworkInterface) -> Result<Option<String>> {
    let mac = match &iface.mac_address {
        Some(mac) if mac_re().is_match(mac) => mac.to_lowercase(),
        Some(mac) => {
            log::warn!("Ignoring malformed MAC '{}' on {}", mac, iface.name);
            return Ok(None);
        }
        None => return Ok(None),
    };
    if iface
        .name
        .chars()
        .any(|c| c == '"' || c == '\\' || c.is_whitespace())
    {
        return Err(TakeoverError::render(format!(
            "interface name {:?} cannot be used in a udev rule",
            iface.name
        )));
    }
    Ok(Some(format!(
        "ATTR{{address}}==\"{}\", NAME=\"{}\"",
        mac, iface.name
    )))
}

fn interface_attrs(iface: &NetworkInterface, facts: &NetworkFacts) -> AttrSet {
    let mut attrs = AttrSet::new();
    attrs
        .set("ipv4.addresses", addresses(&iface.ipv4_addresses))
        .set("ipv6.addresses", addresses(&iface.ipv6_addresses));

    if iface.name == facts.route.interface {
        if let Some(gw) = &facts.route.gateway4 {
            attrs.set("ipv4.routes", host_route(gw, 32));
        }
        if let Some(gw) = &facts.route.gateway6 {
            attrs.set("ipv6.routes", host_route(gw, 128));
        }
    }
    attrs
}

/// Render the network configuration
pub fn network_config(facts: &NetworkFacts) -> Result<String> {
    let mut body = AttrSet::new();
    body.set(
        "networking.nameservers",
        Value::strings(facts.dns.nameservers.iter().map(String::as_str)),
    );

    if let Some(gw) = &facts.route.gateway4 {
        body.set("networking.defaultGateway", gw.as_str());
    }
    if let Some(gw) = &facts.route.gateway6 {
        body.set(
            "networking.defaultGateway6",
            AttrSet::new()
                .with("address", gw.as_str())
                .with("interface", facts.route.interface.as_str()),
        );
    }

    body.set("networking.dhcpcd.enable", false).set(
        "networking.usePredictableInterfaceNames",
        Value::mk_force(Value::Bool(facts.predictable_names)),
    );

    let mut rules = Vec::new();
    for iface in facts.interfaces() {
        body.set(
            ["networking", "interfaces", iface.name.as_str()],
            interface_attrs(iface, facts),
        );
        if let Some(rule) = udev_rule(iface)? {
            rules.push(rule);
        }
    }
    if !rules.is_empty() {
        body.set("services.udev.extraRules", Value::Indented(rules));
    }

    let mut file = NixFile::module(&["lib"], body)
        .comment("Generated by nixos-takeover from the live network configuration.");
    if !facts.unconfigured.is_empty() {
        file = file.comment(format!(
            "Not configured: {}",
            facts.unconfigured.join(", ")
        ));
    }
    file.render()
}
