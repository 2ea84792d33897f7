//! Network interface, route and resolver discovery
//!
//! Queries `ip` through its JSON interface (`ip -j`) first. Older iproute2
//! builds without JSON support fall back to line-oriented parsing of the
//! plain output; lines that fit neither shape are reported, not skipped.

use crate::config::InterfaceSelection;
use crate::error::{Result, TakeoverError};
use crate::runner::CommandRunner;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::OnceLock;

/// Resolver used in place of loopback stubs, which do not survive the switch
pub const FALLBACK_RESOLVER: &str = "8.8.8.8";

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// An address with its prefix length
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: String,
    pub prefix_length: u8,
}

impl IpAddress {
    fn new(address: &str, prefix_length: u8) -> Self {
        Self {
            address: address.to_string(),
            prefix_length,
        }
    }
}

/// A non-loopback interface as enumerated by the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub index: u32,
    pub name: String,
    pub mac_address: Option<String>,
    pub ipv4_addresses: Vec<IpAddress>,
    pub ipv6_addresses: Vec<IpAddress>,
}

/// Default gateways reachable through one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    pub gateway4: Option<String>,
    pub gateway6: Option<String>,
    pub interface: String,
}

/// System resolvers, loopback entries already rewritten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub nameservers: Vec<String>,
}

/// Everything `networking.nix` is rendered from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFacts {
    pub primary: NetworkInterface,
    pub secondary: Option<NetworkInterface>,
    pub route: RouteInfo,
    pub dns: DnsConfig,
    /// Value forced onto `networking.usePredictableInterfaceNames`
    pub predictable_names: bool,
    /// Interfaces present on the host but left out of the configuration
    pub unconfigured: Vec<String>,
}

impl NetworkFacts {
    /// Configured interfaces, primary first
    pub fn interfaces(&self) -> impl Iterator<Item = &NetworkInterface> {
        std::iter::once(&self.primary).chain(self.secondary.iter())
    }
}

/// Predictable naming is forced off for legacy `eth*` names, on otherwise
pub fn naming_scheme(primary_name: &str) -> bool {
    !primary_name.starts_with("eth")
}

#[derive(Debug, Deserialize)]
struct JsonLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    addr_info: Vec<JsonAddr>,
}

#[derive(Debug, Deserialize)]
struct JsonAddr {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct JsonRoute {
    #[serde(default)]
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
}

/// Parse `ip -j address show`, dropping loopback
pub fn parse_address_json(json: &str) -> Result<Vec<NetworkInterface>> {
    let links: Vec<JsonLink> = serde_json::from_str(json)?;
    Ok(links
        .into_iter()
        .filter(|link| link.link_type.as_deref() != Some("loopback"))
        .map(|link| {
            let mut iface = NetworkInterface {
                index: link.ifindex,
                name: link.ifname,
                mac_address: match link.link_type.as_deref() {
                    Some("ether") => link.address,
                    _ => None,
                },
                ipv4_addresses: Vec::new(),
                ipv6_addresses: Vec::new(),
            };
            for addr in link.addr_info {
                let (Some(family), Some(local), Some(prefix)) =
                    (addr.family.as_deref(), addr.local.as_deref(), addr.prefixlen)
                else {
                    continue;
                };
                match family {
                    "inet" => iface.ipv4_addresses.push(IpAddress::new(local, prefix)),
                    "inet6" => iface.ipv6_addresses.push(IpAddress::new(local, prefix)),
                    _ => {}
                }
            }
            iface
        })
        .collect())
}

fn link_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+):\s+([^:@\s]+)(?:@[^:\s]*)?:\s+<").expect("valid regex")
    })
}

fn inet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+(inet6?)\s+([0-9A-Fa-f.:]+)/(\d+)\b").expect("valid regex"))
}

fn ether_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s+link/ether\s+([0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5})\b").expect("valid regex")
    })
}

fn default_route_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^default\s+(?:.*\s)?via\s+(\S+)").expect("valid regex"))
}

/// Parse plain `ip address show` output, dropping loopback
pub fn parse_address_text(text: &str) -> Result<Vec<NetworkInterface>> {
    let mut interfaces: Vec<(NetworkInterface, bool)> = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        if let Some(caps) = link_header_re().captures(line) {
            let index = caps[1]
                .parse()
                .map_err(|e| TakeoverError::parse(format!("interface index on line {}: {}", lineno + 1, e)))?;
            interfaces.push((
                NetworkInterface {
                    index,
                    name: caps[2].to_string(),
                    mac_address: None,
                    ipv4_addresses: Vec::new(),
                    ipv6_addresses: Vec::new(),
                },
                false,
            ));
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            return Err(TakeoverError::parse(format!(
                "unexpected line {} in ip address output: {}",
                lineno + 1,
                line
            )));
        }

        let Some((current, loopback)) = interfaces.last_mut() else {
            return Err(TakeoverError::parse(format!(
                "address line {} before any interface header",
                lineno + 1
            )));
        };

        if line.trim_start().starts_with("link/loopback") {
            *loopback = true;
        } else if let Some(caps) = ether_re().captures(line) {
            current.mac_address = Some(caps[1].to_lowercase());
        } else if let Some(caps) = inet_re().captures(line) {
            let prefix: u8 = caps[3]
                .parse()
                .map_err(|e| TakeoverError::parse(format!("prefix length on line {}: {}", lineno + 1, e)))?;
            let address = IpAddress::new(&caps[2], prefix);
            if &caps[1] == "inet" {
                current.ipv4_addresses.push(address);
            } else {
                current.ipv6_addresses.push(address);
            }
        }
    }

    Ok(interfaces
        .into_iter()
        .filter(|(_, loopback)| !loopback)
        .map(|(iface, _)| iface)
        .collect())
}

/// Gateway of the `default` route in `ip -j route` output
pub fn parse_default_route_json(json: &str) -> Result<Option<String>> {
    let routes: Vec<JsonRoute> = serde_json::from_str(json)?;
    Ok(routes
        .into_iter()
        .find(|r| r.dst == "default" && r.gateway.is_some())
        .and_then(|r| r.gateway))
}

/// Gateway of the `default` route in plain `ip route` output
pub fn parse_default_route_text(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| default_route_re().captures(line.trim()))
        .map(|caps| caps[1].to_string())
}

/// `nameserver` entries of a resolv.conf, loopback rewritten
pub fn parse_resolv_conf(text: &str) -> Vec<String> {
    let mut nameservers = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        let Some(entry) = fields.next() else {
            continue;
        };
        let address = entry.split('%').next().unwrap_or(entry);
        match address.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => nameservers.push(FALLBACK_RESOLVER.to_string()),
            Ok(ip) => nameservers.push(ip.to_string()),
            Err(_) => log::warn!("Ignoring unparseable nameserver entry '{}'", entry),
        }
    }
    nameservers
}

/// Probe for the network facts of the running host
pub struct NetworkProbe<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
}

impl<'a, R: CommandRunner + ?Sized> NetworkProbe<'a, R> {
    /// Create a new probe
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// All non-loopback interfaces in kernel index order
    pub fn list_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        let json = self.runner.run("ip", &["-j", "address", "show"])?;
        let mut interfaces = if json.success() {
            match parse_address_json(&json.stdout) {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    log::debug!("ip -j output unusable ({}), parsing plain output", e);
                    self.list_interfaces_text()?
                }
            }
        } else {
            log::debug!("ip has no JSON support, parsing plain output");
            self.list_interfaces_text()?
        };
        interfaces.sort_by_key(|iface| iface.index);
        Ok(interfaces)
    }

    fn list_interfaces_text(&self) -> Result<Vec<NetworkInterface>> {
        let text = self
            .runner
            .run("ip", &["address", "show"])?
            .into_result("ip address show")?;
        parse_address_text(&text.stdout)
    }

    /// Select the primary and optional secondary interface
    ///
    /// Returns the names of every other interface alongside.
    pub fn enumerate_primary_and_secondary(
        &self,
        selection: &InterfaceSelection,
    ) -> Result<(NetworkInterface, Option<NetworkInterface>, Vec<String>)> {
        let interfaces = self.list_interfaces()?;

        let (primary, secondary) = match selection {
            InterfaceSelection::KernelIndex { primary, secondary } => {
                let first = interfaces
                    .iter()
                    .find(|iface| iface.index == *primary)
                    .cloned()
                    .ok_or_else(|| {
                        TakeoverError::probe(format!("no network interface at kernel index {}", primary))
                    })?;
                let second = interfaces
                    .iter()
                    .find(|iface| iface.index == *secondary)
                    .cloned();
                (first, second)
            }
            InterfaceSelection::Named(names) => {
                let by_name = |name: &String| {
                    interfaces
                        .iter()
                        .find(|iface| &iface.name == name)
                        .cloned()
                        .ok_or_else(|| TakeoverError::probe(format!("no network interface named {}", name)))
                };
                let first_name = names
                    .first()
                    .ok_or_else(|| TakeoverError::config("empty interface selection"))?;
                let first = by_name(first_name)?;
                let second = names.get(1).map(by_name).transpose()?;
                (first, second)
            }
        };

        let unconfigured: Vec<String> = interfaces
            .iter()
            .filter(|iface| {
                iface.name != primary.name
                    && secondary.as_ref().map(|s| s.name != iface.name).unwrap_or(true)
            })
            .map(|iface| iface.name.clone())
            .collect();

        if !unconfigured.is_empty() {
            log::warn!(
                "Only {} interface(s) will be configured; left unconfigured: {}",
                if secondary.is_some() { 2 } else { 1 },
                unconfigured.join(", ")
            );
        }

        Ok((primary, secondary, unconfigured))
    }

    /// IPv4 and IPv6 default gateways through `interface`, looked up independently
    pub fn default_routes(&self, interface: &str) -> Result<RouteInfo> {
        Ok(RouteInfo {
            gateway4: self.default_gateway(interface, false)?,
            gateway6: self.default_gateway(interface, true)?,
            interface: interface.to_string(),
        })
    }

    fn default_gateway(&self, interface: &str, v6: bool) -> Result<Option<String>> {
        let mut json_args = vec!["-j"];
        let mut text_args = Vec::new();
        if v6 {
            json_args.push("-6");
            text_args.push("-6");
        }
        json_args.extend(["route", "show", "dev", interface]);
        text_args.extend(["route", "show", "dev", interface]);

        let json = self.runner.run("ip", &json_args)?;
        if json.success() {
            if let Ok(gateway) = parse_default_route_json(&json.stdout) {
                return Ok(gateway);
            }
        }

        let text = self.runner.run("ip", &text_args)?;
        if !text.success() {
            log::debug!(
                "No {} routes for {}: {}",
                if v6 { "IPv6" } else { "IPv4" },
                interface,
                text.stderr.trim()
            );
            return Ok(None);
        }
        Ok(parse_default_route_text(&text.stdout))
    }

    /// Resolvers from resolv.conf, falling back to the public resolver
    pub fn system_resolvers(&self) -> DnsConfig {
        let nameservers = match self.runner.read_to_string(Path::new(RESOLV_CONF)) {
            Ok(text) => parse_resolv_conf(&text),
            Err(e) => {
                log::warn!("Cannot read {}: {}", RESOLV_CONF, e);
                Vec::new()
            }
        };

        if nameservers.is_empty() {
            log::warn!("No usable nameservers found, using {}", FALLBACK_RESOLVER);
            return DnsConfig {
                nameservers: vec![FALLBACK_RESOLVER.to_string()],
            };
        }
        DnsConfig { nameservers }
    }

    /// Gather everything needed for `networking.nix`
    pub fn probe(&self, selection: &InterfaceSelection) -> Result<NetworkFacts> {
        let (primary, secondary, unconfigured) = self.enumerate_primary_and_secondary(selection)?;
        let route = self.default_routes(&primary.name)?;
        let dns = self.system_resolvers();
        let predictable_names = naming_scheme(&primary.name);

        log::info!(
            "Network: primary {} ({} IPv4, {} IPv6), gateway {}",
            primary.name,
            primary.ipv4_addresses.len(),
            primary.ipv6_addresses.len(),
            route.gateway4.as_deref().unwrap_or("none")
        );

        Ok(NetworkFacts {
            primary,
            secondary,
            route,
            dns,
            predictable_names,
            unconfigured,
        })
    }
}
