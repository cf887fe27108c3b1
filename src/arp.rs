//! ARP advice.
//!
//! Before a client has accepted its address, unicast offers cannot be
//! resolved by the kernel. The engine therefore advises the host to publish
//! a static ARP entry for the offered address; failures here are logged and
//! ignored.

use std::net::Ipv4Addr;
use std::process::Command;

use tracing::{debug, error};

use crate::hwaddr::HwAddr;

const ARP_PROGRAM: &str = "/sbin/arp";

pub trait ArpSink: Send + Sync {
    fn publish(&self, iface: &str, ip: Ipv4Addr, hw: HwAddr);
}

/// Publishes ARP entries by invoking the system `arp` utility.
pub struct SystemArp;

impl ArpSink for SystemArp {
    fn publish(&self, iface: &str, ip: Ipv4Addr, hw: HwAddr) {
        debug!("Executing: {} -i {} -s {} {}", ARP_PROGRAM, iface, ip, hw);

        let status = Command::new(ARP_PROGRAM)
            .arg("-i")
            .arg(iface)
            .arg("-s")
            .arg(ip.to_string())
            .arg(hw.to_string())
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!("{} exited with {} for {} on {}", ARP_PROGRAM, status, ip, iface);
            }
            Err(err) => {
                error!("Failed to execute {}: {}", ARP_PROGRAM, err);
            }
        }
    }
}

/// Discards ARP advice; used in tests and on hosts that manage ARP
/// themselves.
pub struct NullArp;

impl ArpSink for NullArp {
    fn publish(&self, _iface: &str, _ip: Ipv4Addr, _hw: HwAddr) {}
}
