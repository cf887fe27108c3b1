use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hwaddr::HwAddr;
use crate::pool::NetworkConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Name of the network interface to bind, e.g. `eth0`.
    pub interface: String,
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub router: Ipv4Addr,
    pub server_id: Ipv4Addr,
    pub dhcp_first: Ipv4Addr,
    pub dhcp_last: Ipv4Addr,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_seconds: u32,
    /// T1; defaults to half the lease time.
    pub renewal_seconds: Option<u32>,
    /// T2; defaults to 7/8 of the lease time.
    pub rebinding_seconds: Option<u32>,
    pub lease_file: Option<PathBuf>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub mac: String,
    pub ip: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: vec![InterfaceConfig {
                interface: "eth0".to_string(),
                network: Ipv4Addr::new(192, 168, 200, 0),
                prefix_len: 24,
                router: Ipv4Addr::new(192, 168, 200, 1),
                server_id: Ipv4Addr::new(192, 168, 200, 1),
                dhcp_first: Ipv4Addr::new(192, 168, 200, 100),
                dhcp_last: Ipv4Addr::new(192, 168, 200, 254),
                dns_servers: vec![Ipv4Addr::new(9, 9, 9, 9)],
                lease_seconds: 3600,
                renewal_seconds: None,
                rebinding_seconds: None,
                lease_file: Some(PathBuf::from("dhcplet-eth0.leases")),
                reservations: Vec::new(),
            }],
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.interfaces.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one interface must be configured".to_string(),
            ));
        }

        let mut seen_interfaces = HashSet::new();
        for interface in &self.interfaces {
            if !seen_interfaces.insert(interface.interface.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "interface {} configured twice",
                    interface.interface
                )));
            }
            interface.validate()?;
        }

        Ok(())
    }
}

impl InterfaceConfig {
    pub fn validate(&self) -> Result<()> {
        // The subnet mask computation shifts by 32 - prefix_len, which is
        // only defined on this range.
        if !(1..=30).contains(&self.prefix_len) {
            return Err(Error::InvalidConfig(format!(
                "{}: prefix_len must be between 1 and 30",
                self.interface
            )));
        }

        let network = self.network_config()?;

        if u32::from(self.dhcp_first) > u32::from(self.dhcp_last) {
            return Err(Error::InvalidConfig(format!(
                "{}: dhcp_first must not be above dhcp_last",
                self.interface
            )));
        }

        for bound in [self.dhcp_first, self.dhcp_last] {
            if !network.is_allowed(bound) {
                return Err(Error::InvalidConfig(format!(
                    "{}: pool bound {} is outside the usable network range",
                    self.interface, bound
                )));
            }
        }

        if self.lease_seconds == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: lease_seconds must be greater than 0",
                self.interface
            )));
        }

        let renewal = network.renewal_seconds;
        let rebinding = network.rebinding_seconds;
        if !(0 < renewal && renewal < rebinding && rebinding < self.lease_seconds) {
            return Err(Error::InvalidConfig(format!(
                "{}: times must satisfy 0 < renewal < rebinding < lease",
                self.interface
            )));
        }

        let mut seen_ips = HashSet::new();
        let mut seen_macs = HashSet::new();
        for reservation in &self.reservations {
            let hw: HwAddr = reservation.mac.parse()?;
            if !seen_macs.insert(hw) {
                return Err(Error::InvalidConfig(format!(
                    "{}: duplicate MAC {} in reservations",
                    self.interface, reservation.mac
                )));
            }
            if !seen_ips.insert(reservation.ip) {
                return Err(Error::InvalidConfig(format!(
                    "{}: duplicate address {} in reservations",
                    self.interface, reservation.ip
                )));
            }
            if !network.is_allowed(reservation.ip) {
                return Err(Error::InvalidConfig(format!(
                    "{}: reserved address {} is outside the usable network range",
                    self.interface, reservation.ip
                )));
            }
        }

        Ok(())
    }

    /// Builds the allocator's view of this interface, applying the T1/T2
    /// defaults.
    pub fn network_config(&self) -> Result<NetworkConfig> {
        let mut reservations = HashMap::new();
        for reservation in &self.reservations {
            let hw: HwAddr = reservation.mac.parse()?;
            reservations.insert(hw, reservation.ip);
        }

        Ok(NetworkConfig {
            network: self.network,
            prefix_len: self.prefix_len,
            router: self.router,
            server_id: self.server_id,
            dhcp_first: self.dhcp_first,
            dhcp_last: self.dhcp_last,
            dns_servers: self.dns_servers.clone(),
            lease_seconds: self.lease_seconds,
            renewal_seconds: self
                .renewal_seconds
                .unwrap_or(self.lease_seconds / 2),
            rebinding_seconds: self
                .rebinding_seconds
                .unwrap_or(self.lease_seconds / 8 * 7),
            reservations,
        })
    }
}
