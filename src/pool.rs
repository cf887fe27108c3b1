//! Per-interface lease pool and address allocator.
//!
//! The pool tracks which hardware addresses hold which IPv4 addresses and
//! when those bindings expire. It is a plain synchronous structure: each
//! interface actor owns its pool exclusively, so the operations here are
//! atomic without any locking.
//!
//! Expiry is lazy. Expired leases linger in both indices until a query
//! observes them on its path, at which point they are removed.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::Error;
use crate::hwaddr::HwAddr;

/// A binding between a hardware address and an IPv4 address.
///
/// `start_secs == 0` is the invalid sentinel used by the persistent record
/// format; leases held in a [`Pool`] always have `start_secs > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub start_secs: u64,
    pub hw: HwAddr,
    pub ip: Ipv4Addr,
}

impl Lease {
    pub fn is_valid(&self) -> bool {
        self.start_secs != 0
    }
}

/// Immutable per-interface network parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Ipv4Addr,
    /// Prefix length, constrained to [1, 30] by configuration validation
    /// so the mask shift below is always defined.
    pub prefix_len: u8,
    pub router: Ipv4Addr,
    pub server_id: Ipv4Addr,
    pub dhcp_first: Ipv4Addr,
    pub dhcp_last: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_seconds: u32,
    pub renewal_seconds: u32,
    pub rebinding_seconds: u32,
    pub reservations: HashMap<HwAddr, Ipv4Addr>,
}

impl NetworkConfig {
    fn mask(&self) -> u32 {
        (!0u32) << (32 - self.prefix_len)
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !self.mask())
    }

    /// True iff `ip` lies inside the network and is neither the network
    /// address nor the directed broadcast.
    pub fn is_allowed(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        (u32::from(ip) & mask) == (u32::from(self.network) & mask)
            && ip != self.network
            && ip != self.broadcast()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Per-interface lease state, indexed both ways.
///
/// Invariant: for every lease `L` held here, `by_hw[L.hw] == L` iff
/// `by_ip[L.ip] == L`. No two leases share an IP and no two leases share a
/// hardware address.
#[derive(Debug)]
pub struct Pool {
    config: NetworkConfig,
    by_hw: HashMap<HwAddr, Lease>,
    by_ip: HashMap<Ipv4Addr, Lease>,
}

impl Pool {
    /// Builds a pool from the interface configuration and any leases
    /// recovered from the persistent store. Invalid or out-of-range records
    /// are dropped.
    pub fn new(config: NetworkConfig, initial_leases: Vec<Lease>) -> Self {
        let mut pool = Self {
            config,
            by_hw: HashMap::new(),
            by_ip: HashMap::new(),
        };

        for lease in initial_leases {
            if !lease.is_valid() {
                warn!("Dropping stored lease with zero start time for {}", lease.hw);
                continue;
            }
            if !pool.config.is_allowed(lease.ip) {
                warn!(
                    "Dropping stored lease for {}: {}",
                    lease.hw,
                    Error::Unallowed(lease.ip)
                );
                continue;
            }
            pool.by_hw.insert(lease.hw, lease);
            pool.by_ip.insert(lease.ip, lease);
        }

        pool
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn is_expired(&self, lease: &Lease, now: u64) -> bool {
        now.saturating_sub(lease.start_secs) > u64::from(self.config.lease_seconds)
    }

    /// True when `ip` is reserved in the configuration for a hardware
    /// address other than `hw`; such addresses are never offered elsewhere.
    fn reserved_for_other(&self, ip: Ipv4Addr, hw: HwAddr) -> bool {
        self.config
            .reservations
            .iter()
            .any(|(owner, reserved)| *reserved == ip && *owner != hw)
    }

    fn remove_by_hw(&mut self, hw: HwAddr) {
        if let Some(lease) = self.by_hw.remove(&hw)
            && self.by_ip.get(&lease.ip).is_some_and(|paired| paired.hw == hw)
        {
            self.by_ip.remove(&lease.ip);
        }
    }

    fn remove_by_ip(&mut self, ip: Ipv4Addr) {
        if let Some(lease) = self.by_ip.remove(&ip)
            && self.by_hw.get(&lease.hw).is_some_and(|paired| paired.ip == ip)
        {
            self.by_hw.remove(&lease.hw);
        }
    }

    /// Picks an address a DISCOVER can be offered, or `None` when the pool
    /// is exhausted.
    ///
    /// Order: an existing unexpired lease for `hw` wins over everything;
    /// then a configured reservation for `hw`; then an allowed and free
    /// `preferred`; then the first free address in the dynamic range.
    pub fn available(&mut self, hw: HwAddr, preferred: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        let now = now_secs();

        let preferred =
            preferred.filter(|ip| self.config.is_allowed(*ip) && !self.reserved_for_other(*ip, hw));
        if let Some(ip) = preferred
            && let Some(lease) = self.by_ip.get(&ip).copied()
            && self.is_expired(&lease, now)
        {
            self.remove_by_ip(ip);
        }

        if let Some(lease) = self.by_hw.get(&hw).copied() {
            if self.is_expired(&lease, now) {
                self.remove_by_hw(hw);
            } else {
                return Some(lease.ip);
            }
        }

        if let Some(&reserved) = self.config.reservations.get(&hw) {
            match self.by_ip.get(&reserved).copied() {
                None => return Some(reserved),
                Some(lease) if self.is_expired(&lease, now) => {
                    self.remove_by_ip(reserved);
                    return Some(reserved);
                }
                // Squatted by an unexpired lease; fall through.
                Some(_) => {}
            }
        }

        if let Some(ip) = preferred
            && !self.by_ip.contains_key(&ip)
        {
            return Some(ip);
        }

        let first = u32::from(self.config.dhcp_first);
        let last = u32::from(self.config.dhcp_last);
        for raw in first..=last {
            let ip = Ipv4Addr::from(raw);
            if self.reserved_for_other(ip, hw) {
                continue;
            }
            match self.by_ip.get(&ip) {
                None => return Some(ip),
                Some(lease) if self.is_expired(lease, now) => return Some(ip),
                Some(_) => {}
            }
        }

        None
    }

    /// Commits a lease for `hw` on `ip`, replacing any lease `hw` held on a
    /// different address. Returns false and changes nothing when `ip` is not
    /// allowed on this network or is held unexpired by someone else.
    pub fn reserve(&mut self, hw: HwAddr, ip: Ipv4Addr) -> bool {
        let now = now_secs();

        if !self.config.is_allowed(ip) {
            return false;
        }

        if let Some(lease) = self.by_ip.get(&ip).copied() {
            if !self.is_expired(&lease, now) && lease.hw != hw {
                return false;
            }
            if self.is_expired(&lease, now) {
                self.remove_by_ip(ip);
            }
        }

        if let Some(lease) = self.by_hw.get(&hw).copied()
            && lease.ip != ip
        {
            self.remove_by_hw(hw);
        }

        let lease = Lease {
            start_secs: now,
            hw,
            ip,
        };
        self.by_hw.insert(hw, lease);
        self.by_ip.insert(ip, lease);
        true
    }

    /// Removes any lease keyed by `ip`. Idempotent.
    pub fn release(&mut self, ip: Ipv4Addr) {
        self.remove_by_ip(ip);
    }

    pub fn lease_by_hw(&self, hw: HwAddr) -> Option<Lease> {
        self.by_hw.get(&hw).copied()
    }

    pub fn lease_by_ip(&self, ip: Ipv4Addr) -> Option<Lease> {
        self.by_ip.get(&ip).copied()
    }

    /// All current leases, for persistence.
    pub fn snapshot(&self) -> Vec<Lease> {
        self.by_hw.values().copied().collect()
    }
}
