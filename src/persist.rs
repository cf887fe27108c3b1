//! Persistent lease records.
//!
//! The lease file is a flat sequence of fixed 20-byte records: 8 bytes of
//! little-endian seconds since the epoch, 8 bytes of little-endian hardware
//! address, 4 bytes of IPv4 address in octet order. Records whose start
//! time is zero are skipped on load. The file is rewritten atomically
//! (temp file + rename) on every ACK.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::hwaddr::HwAddr;
use crate::pool::Lease;

pub const LEASE_RECORD_LEN: usize = 8 + 8 + 4;

/// Loads all valid lease records from `path`. A missing file is an empty
/// lease table, not an error.
pub async fn load(path: impl AsRef<Path>) -> Result<Vec<Lease>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let data = tokio::fs::read(path).await?;

    let mut leases = Vec::with_capacity(data.len() / LEASE_RECORD_LEN);
    for record in data.chunks_exact(LEASE_RECORD_LEN) {
        let start_secs = u64::from_le_bytes([
            record[0], record[1], record[2], record[3], record[4], record[5], record[6], record[7],
        ]);
        if start_secs == 0 {
            continue;
        }

        let hw = HwAddr::new(u64::from_le_bytes([
            record[8], record[9], record[10], record[11], record[12], record[13], record[14],
            record[15],
        ]));
        let ip = Ipv4Addr::new(record[16], record[17], record[18], record[19]);

        leases.push(Lease {
            start_secs,
            hw,
            ip,
        });
    }

    debug!("Loaded {} lease(s) from {}", leases.len(), path.display());

    Ok(leases)
}

/// Rewrites `path` with the given leases, atomically.
pub async fn store(path: impl AsRef<Path>, leases: &[Lease]) -> Result<()> {
    let path = path.as_ref();

    let mut data = Vec::with_capacity(leases.len() * LEASE_RECORD_LEN);
    for lease in leases {
        data.extend_from_slice(&lease.start_secs.to_le_bytes());
        data.extend_from_slice(&lease.hw.to_bits().to_le_bytes());
        data.extend_from_slice(&lease.ip.octets());
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path).await?;

    Ok(())
}

/// A lease-table rewrite queued by an interface actor.
#[derive(Debug)]
pub struct PersistRequest {
    pub path: PathBuf,
    pub leases: Vec<Lease>,
}

/// Runs the persistence writer: one task serialises all lease-file writes,
/// keeping them off the request path and ordered per interface. Failures
/// are logged and never fatal; the in-memory table stays authoritative.
pub async fn run_writer(mut rx: mpsc::Receiver<PersistRequest>) {
    while let Some(request) = rx.recv().await {
        if let Err(error) = store(&request.path, &request.leases).await {
            warn!(
                "Failed to persist {} lease(s) to {}: {}",
                request.leases.len(),
                request.path.display(),
                error
            );
        }
    }
}
