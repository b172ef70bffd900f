//! Network model: CIDRs, subnets and IP pools.
//!
//! `manual` networks allocate addresses from their subnet pools, `dynamic`
//! networks defer addressing to the provider, and `vip` networks carry
//! addresses declared on jobs. All allocation happens single-threaded in
//! the binding pass (compilation VMs allocate later behind a mutex), so
//! the pool itself needs no synchronization.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde_json::{json, Value};

use crate::manifest::{NetworkKindSpec, NetworkSpec, SubnetSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Manual,
    Dynamic,
    Vip,
}

impl From<NetworkKindSpec> for NetworkKind {
    fn from(kind: NetworkKindSpec) -> Self {
        match kind {
            NetworkKindSpec::Manual => Self::Manual,
            NetworkKindSpec::Dynamic => Self::Dynamic,
            NetworkKindSpec::Vip => Self::Vip,
        }
    }
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Dynamic => "dynamic",
            Self::Vip => "vip",
        }
    }
}

/// An IPv4 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: u32,
    prefix: u8,
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("not a CIDR: {s}"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| format!("bad address in {s}"))?;
        let prefix: u8 = prefix.parse().map_err(|_| format!("bad prefix in {s}"))?;
        if prefix > 30 {
            return Err(format!("prefix too long in {s}"));
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: u32::from(addr) & mask,
            prefix,
        })
    }
}

impl Cidr {
    pub fn contains(&self, ip: u32) -> bool {
        let mask = u32::MAX << (32 - self.prefix);
        ip & mask == self.network
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::MAX << (32 - self.prefix))
    }

    pub fn broadcast(&self) -> u32 {
        self.network | !(u32::MAX << (32 - self.prefix))
    }

    /// Hosts assignable inside this block (network and broadcast excluded).
    pub fn first_host(&self) -> u32 {
        self.network + 1
    }

    pub fn last_host(&self) -> u32 {
        self.broadcast() - 1
    }
}

/// Parse `10.0.0.10 - 10.0.0.12` or a single address into the inclusive
/// set of addresses it covers.
pub fn parse_ip_range(text: &str) -> Result<Vec<u32>, String> {
    match text.split_once('-') {
        Some((from, to)) => {
            let from: Ipv4Addr = from.trim().parse().map_err(|_| format!("bad ip in {text}"))?;
            let to: Ipv4Addr = to.trim().parse().map_err(|_| format!("bad ip in {text}"))?;
            let (from, to) = (u32::from(from), u32::from(to));
            if from > to {
                return Err(format!("inverted range: {text}"));
            }
            Ok((from..=to).collect())
        }
        None => {
            let ip: Ipv4Addr = text.trim().parse().map_err(|_| format!("bad ip: {text}"))?;
            Ok(vec![u32::from(ip)])
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub range: Cidr,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub static_ips: BTreeSet<u32>,
    pub reserved: BTreeSet<u32>,
    pub cloud_properties: Value,
}

impl Subnet {
    pub fn from_spec(spec: &SubnetSpec) -> Result<Self, String> {
        let range: Cidr = spec.range.parse()?;

        let gateway = match &spec.gateway {
            Some(g) => {
                let ip: Ipv4Addr = g.parse().map_err(|_| format!("bad gateway: {g}"))?;
                if !range.contains(u32::from(ip)) {
                    return Err(format!("gateway {g} outside {}", spec.range));
                }
                Some(ip)
            }
            None => None,
        };

        let mut dns = Vec::new();
        for entry in &spec.dns {
            dns.push(entry.parse().map_err(|_| format!("bad dns: {entry}"))?);
        }

        let mut static_ips = BTreeSet::new();
        for entry in &spec.static_ranges {
            for ip in parse_ip_range(entry)? {
                if !range.contains(ip) {
                    return Err(format!(
                        "static ip {} outside {}",
                        Ipv4Addr::from(ip),
                        spec.range
                    ));
                }
                static_ips.insert(ip);
            }
        }

        let mut reserved = BTreeSet::new();
        for entry in &spec.reserved {
            for ip in parse_ip_range(entry)? {
                reserved.insert(ip);
            }
        }

        Ok(Self {
            range,
            gateway,
            dns,
            static_ips,
            reserved,
            cloud_properties: spec.cloud_properties.clone(),
        })
    }

    fn excluded(&self, ip: u32) -> bool {
        self.reserved.contains(&ip)
            || self.gateway.map(u32::from) == Some(ip)
            || ip < self.range.first_host()
            || ip > self.range.last_host()
    }

    /// Is `ip` assignable from this subnet at all (static or dynamic)?
    fn in_pool(&self, ip: u32) -> bool {
        self.range.contains(ip) && !self.excluded(ip)
    }
}

/// A named network with its allocation state.
#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    pub kind: NetworkKind,
    pub subnets: Vec<Subnet>,
    pub cloud_properties: Value,
    used: BTreeSet<u32>,
}

impl Network {
    pub fn from_spec(spec: &NetworkSpec) -> Result<Self, Vec<String>> {
        let kind = NetworkKind::from(spec.kind);
        let mut issues = Vec::new();
        let mut subnets = Vec::new();

        if kind == NetworkKind::Manual && spec.subnets.is_empty() {
            issues.push(format!("network {} has no subnets", spec.name));
        }
        for subnet_spec in &spec.subnets {
            match Subnet::from_spec(subnet_spec) {
                Ok(subnet) => subnets.push(subnet),
                Err(e) => issues.push(format!("network {}: {e}", spec.name)),
            }
        }
        if !issues.is_empty() {
            return Err(issues);
        }

        Ok(Self {
            name: spec.name.clone(),
            kind,
            subnets,
            cloud_properties: spec.cloud_properties.clone(),
            used: BTreeSet::new(),
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.subnets.iter().any(|s| s.range.contains(u32::from(ip)))
    }

    /// Reserve a declared static address. Fails outside static ranges or on
    /// double use.
    pub fn reserve_static(&mut self, ip: Ipv4Addr) -> Result<(), String> {
        let raw = u32::from(ip);
        match self.kind {
            NetworkKind::Dynamic => {
                return Err(format!("network {} is dynamic, static ip {ip} not allowed", self.name))
            }
            NetworkKind::Vip => {
                // Vip addresses are declared, not pooled.
                if !self.used.insert(raw) {
                    return Err(format!("ip {ip} used more than once"));
                }
                return Ok(());
            }
            NetworkKind::Manual => {}
        }

        if !self.subnets.iter().any(|s| s.static_ips.contains(&raw)) {
            return Err(format!(
                "ip {ip} not in a static range of network {}",
                self.name
            ));
        }
        if !self.used.insert(raw) {
            return Err(format!("ip {ip} used more than once"));
        }
        Ok(())
    }

    /// Try to keep an address an existing instance already holds. Returns
    /// false when the address left the pool (re-rangied subnet, now
    /// reserved, or already taken).
    pub fn reserve_existing(&mut self, ip: Ipv4Addr) -> bool {
        let raw = u32::from(ip);
        if self.used.contains(&raw) {
            return false;
        }
        let valid = self
            .subnets
            .iter()
            .any(|s| s.in_pool(raw) || s.static_ips.contains(&raw));
        if valid {
            self.used.insert(raw);
        }
        valid
    }

    /// Allocate the lowest free dynamic address.
    pub fn allocate_dynamic(&mut self) -> Option<Ipv4Addr> {
        if self.kind != NetworkKind::Manual {
            return None;
        }
        for subnet in &self.subnets {
            for ip in subnet.range.first_host()..=subnet.range.last_host() {
                if subnet.excluded(ip) || subnet.static_ips.contains(&ip) {
                    continue;
                }
                if self.used.insert(ip) {
                    return Some(Ipv4Addr::from(ip));
                }
            }
        }
        None
    }

    pub fn release(&mut self, ip: Ipv4Addr) {
        self.used.remove(&u32::from(ip));
    }

    /// Network settings handed to the agent in the apply spec.
    pub fn settings_for(&self, ip: Option<Ipv4Addr>) -> Value {
        match self.kind {
            NetworkKind::Dynamic => json!({
                "type": "dynamic",
                "cloud_properties": self.cloud_properties,
            }),
            NetworkKind::Vip => json!({
                "type": "vip",
                "ip": ip.map(|i| i.to_string()),
                "cloud_properties": self.cloud_properties,
            }),
            NetworkKind::Manual => {
                let subnet = ip.and_then(|i| {
                    self.subnets.iter().find(|s| s.range.contains(u32::from(i)))
                });
                match (ip, subnet) {
                    (Some(ip), Some(subnet)) => json!({
                        "type": "manual",
                        "ip": ip.to_string(),
                        "netmask": subnet.range.netmask().to_string(),
                        "gateway": subnet.gateway.map(|g| g.to_string()),
                        "dns": subnet.dns.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                        "cloud_properties": subnet.cloud_properties,
                    }),
                    _ => json!({ "type": "manual" }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_spec() -> NetworkSpec {
        NetworkSpec {
            name: "default".into(),
            kind: NetworkKindSpec::Manual,
            subnets: vec![SubnetSpec {
                range: "10.0.0.0/24".into(),
                gateway: Some("10.0.0.1".into()),
                static_ranges: vec!["10.0.0.10 - 10.0.0.12".into()],
                reserved: vec!["10.0.0.2 - 10.0.0.4".into()],
                dns: vec!["8.8.8.8".into()],
                cloud_properties: json!({"vlan": 12}),
            }],
            cloud_properties: Value::Null,
        }
    }

    #[test]
    fn cidr_parsing_and_bounds() {
        let cidr: Cidr = "10.0.0.0/24".parse().unwrap();
        assert!(cidr.contains(u32::from(Ipv4Addr::new(10, 0, 0, 200))));
        assert!(!cidr.contains(u32::from(Ipv4Addr::new(10, 0, 1, 1))));
        assert_eq!(cidr.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(Ipv4Addr::from(cidr.first_host()), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(Ipv4Addr::from(cidr.last_host()), Ipv4Addr::new(10, 0, 0, 254));

        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_ip_range("10.0.0.5").unwrap().len(), 1);
        assert_eq!(parse_ip_range("10.0.0.10 - 10.0.0.12").unwrap().len(), 3);
        assert!(parse_ip_range("10.0.0.12 - 10.0.0.10").is_err());
        assert!(parse_ip_range("ten.zero").is_err());
    }

    #[test]
    fn static_reservation_enforces_ranges_and_uniqueness() {
        let mut network = Network::from_spec(&manual_spec()).unwrap();

        network.reserve_static(Ipv4Addr::new(10, 0, 0, 10)).unwrap();
        // Double use.
        assert!(network.reserve_static(Ipv4Addr::new(10, 0, 0, 10)).is_err());
        // Outside the static range.
        assert!(network.reserve_static(Ipv4Addr::new(10, 0, 0, 50)).is_err());
    }

    #[test]
    fn dynamic_allocation_skips_gateway_reserved_and_static() {
        let mut network = Network::from_spec(&manual_spec()).unwrap();

        // .1 gateway, .2-.4 reserved, .10-.12 static → first dynamic is .5.
        assert_eq!(
            network.allocate_dynamic(),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
        assert_eq!(
            network.allocate_dynamic(),
            Some(Ipv4Addr::new(10, 0, 0, 6))
        );
    }

    #[test]
    fn existing_address_reuse() {
        let mut network = Network::from_spec(&manual_spec()).unwrap();

        // A previously held dynamic address is still valid.
        assert!(network.reserve_existing(Ipv4Addr::new(10, 0, 0, 7)));
        // But not twice.
        assert!(!network.reserve_existing(Ipv4Addr::new(10, 0, 0, 7)));
        // A reserved address is no longer usable.
        assert!(!network.reserve_existing(Ipv4Addr::new(10, 0, 0, 3)));
        // The next dynamic allocation avoids the kept address.
        assert_eq!(
            network.allocate_dynamic(),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
    }

    #[test]
    fn release_returns_address_to_pool() {
        let mut network = Network::from_spec(&manual_spec()).unwrap();
        let ip = network.allocate_dynamic().unwrap();
        network.release(ip);
        assert_eq!(network.allocate_dynamic(), Some(ip));
    }

    #[test]
    fn settings_carry_subnet_details() {
        let network = Network::from_spec(&manual_spec()).unwrap();
        let settings = network.settings_for(Some(Ipv4Addr::new(10, 0, 0, 10)));
        assert_eq!(settings["type"], "manual");
        assert_eq!(settings["ip"], "10.0.0.10");
        assert_eq!(settings["netmask"], "255.255.255.0");
        assert_eq!(settings["gateway"], "10.0.0.1");
        assert_eq!(settings["cloud_properties"]["vlan"], 12);
    }

    #[test]
    fn dynamic_network_defers_to_provider() {
        let spec = NetworkSpec {
            name: "ephemeral".into(),
            kind: NetworkKindSpec::Dynamic,
            subnets: vec![],
            cloud_properties: json!({"net": "backplane"}),
        };
        let mut network = Network::from_spec(&spec).unwrap();
        assert_eq!(network.allocate_dynamic(), None);
        let settings = network.settings_for(None);
        assert_eq!(settings["type"], "dynamic");
        assert_eq!(settings["cloud_properties"]["net"], "backplane");
    }

    #[test]
    fn gateway_outside_range_is_rejected() {
        let mut spec = manual_spec();
        spec.subnets[0].gateway = Some("10.0.9.1".into());
        let issues = Network::from_spec(&spec).unwrap_err();
        assert!(issues[0].contains("gateway"));
    }
}
