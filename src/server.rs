//! Socket layer and per-interface dispatch.
//!
//! One receiver task per bound interface reads datagrams and decodes them;
//! decoded frames travel over a bounded channel to the interface's actor,
//! which owns the engine (allocator + offer table), realises its advice and
//! writes replies back to the socket. A single writer task serialises lease
//! persistence. Frames from one interface are handled and answered in
//! receipt order; nothing is ordered across interfaces.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::arp::{ArpSink, SystemArp};
use crate::config::Config;
use crate::engine::{Advice, Engine};
use crate::error::{Error, Result};
use crate::packet::Frame;
use crate::persist::{self, PersistRequest};
use crate::pool::Pool;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;
const FRAME_CHANNEL_DEPTH: usize = 64;
const PERSIST_CHANNEL_DEPTH: usize = 16;
const IPTOS_LOWDELAY: u32 = 0x10;

pub struct DhcpServer {
    receivers: Vec<JoinHandle<()>>,
    actors: Vec<JoinHandle<()>>,
    writer: JoinHandle<()>,
    persist_tx: mpsc::Sender<PersistRequest>,
}

impl DhcpServer {
    /// Binds every configured interface and spawns its receiver and actor
    /// tasks. Lease files are loaded before the first datagram is accepted.
    pub async fn start(config: Config, shutdown: watch::Receiver<bool>) -> Result<Self> {
        Self::start_with_arp(config, shutdown, Arc::new(SystemArp)).await
    }

    pub async fn start_with_arp(
        config: Config,
        shutdown: watch::Receiver<bool>,
        arp: Arc<dyn ArpSink>,
    ) -> Result<Self> {
        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_CHANNEL_DEPTH);
        let writer = tokio::spawn(persist::run_writer(persist_rx));

        let mut receivers = Vec::with_capacity(config.interfaces.len());
        let mut actors = Vec::with_capacity(config.interfaces.len());

        for interface in &config.interfaces {
            let network = interface.network_config()?;
            let initial_leases = match &interface.lease_file {
                Some(path) => match persist::load(path).await {
                    Ok(leases) => leases,
                    Err(error) => {
                        warn!(
                            "Could not load leases from {}: {}",
                            path.display(),
                            error
                        );
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };

            info!(
                "Serving {} on {}: pool {} - {}",
                network.network, interface.interface, network.dhcp_first, network.dhcp_last
            );

            let socket = Arc::new(create_socket(&interface.interface)?);
            let engine = Engine::new(
                interface.interface.clone(),
                Pool::new(network, initial_leases),
            );

            let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);

            receivers.push(tokio::spawn(receive_loop(
                Arc::clone(&socket),
                interface.interface.clone(),
                frame_tx,
                shutdown.clone(),
            )));
            actors.push(tokio::spawn(actor_loop(
                engine,
                frame_rx,
                socket,
                interface.lease_file.clone(),
                persist_tx.clone(),
                Arc::clone(&arp),
            )));
        }

        Ok(Self {
            receivers,
            actors,
            writer,
            persist_tx,
        })
    }

    /// Waits for shutdown to propagate: receivers stop accepting datagrams,
    /// actors drain their queues and flush a final lease snapshot, then the
    /// persistence writer drains and exits.
    pub async fn join(self) -> Result<()> {
        for receiver in self.receivers {
            if let Err(error) = receiver.await {
                error!("Receiver task failed: {}", error);
            }
        }
        for actor in self.actors {
            if let Err(error) = actor.await {
                error!("Actor task failed: {}", error);
            }
        }

        drop(self.persist_tx);
        if let Err(error) = self.writer.await {
            error!("Persistence task failed: {}", error);
        }

        Ok(())
    }
}

/// Builds the UDP/67 socket for one interface: broadcast-capable, bound to
/// the device, marked low-delay, and nonblocking for tokio.
fn create_socket(interface: &str) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    #[cfg(target_os = "linux")]
    socket
        .bind_device(Some(interface.as_bytes()))
        .map_err(|error| {
            Error::Socket(format!("Failed to bind to device {}: {}", interface, error))
        })?;

    #[cfg(not(target_os = "linux"))]
    warn!(
        "Binding to a device is only supported on Linux; {} receives all interfaces",
        interface
    );

    if let Err(error) = socket.set_tos(IPTOS_LOWDELAY) {
        warn!("Failed to set IP_TOS on {}: {}", interface, error);
    }

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    interface: String,
    frames: mpsc::Sender<Frame>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    info!("Started receiver for {}", interface);

    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        let (size, source) = match received {
            Ok(received) => received,
            Err(error) => {
                warn!("{}: socket read error: {}", interface, error);
                continue;
            }
        };

        debug!("{}: got {} bytes from {}", interface, size, source);

        let frame = match Frame::decode(&buffer[..size]) {
            Ok(frame) => frame,
            Err(error) => {
                warn!("{}: dropping datagram from {}: {}", interface, source, error);
                continue;
            }
        };

        if frames.send(frame).await.is_err() {
            break;
        }
    }

    info!("Stopped receiver for {}", interface);
}

async fn actor_loop(
    mut engine: Engine,
    mut frames: mpsc::Receiver<Frame>,
    socket: Arc<UdpSocket>,
    lease_file: Option<PathBuf>,
    persist_tx: mpsc::Sender<PersistRequest>,
    arp: Arc<dyn ArpSink>,
) {
    // Runs until the receiver drops its sender; queued frames are drained
    // before the final flush.
    while let Some(frame) = frames.recv().await {
        let handled = engine.handle(frame);

        match handled.advice {
            Some(Advice::PublishArp { ip, hw }) => arp.publish(engine.iface(), ip, hw),
            Some(Advice::PersistLeases(leases)) => {
                if let Some(path) = &lease_file {
                    let request = PersistRequest {
                        path: path.clone(),
                        leases,
                    };
                    if persist_tx.send(request).await.is_err() {
                        warn!("{}: persistence writer is gone", engine.iface());
                    }
                }
            }
            None => {}
        }

        let Some(outbound) = handled.reply else {
            continue;
        };

        let data = match outbound.frame.encode() {
            Ok(data) => data,
            Err(error) => {
                // A reply the engine built without its required options is
                // a bug; drop it loudly.
                error!("{}: not sending reply: {}", engine.iface(), error);
                continue;
            }
        };

        let destination = SocketAddr::new(IpAddr::V4(outbound.target), DHCP_CLIENT_PORT);
        match socket.send_to(&data, destination).await {
            Ok(sent) => debug!(
                "{}: responded with {} bytes to {}",
                engine.iface(),
                sent,
                destination
            ),
            Err(error) => warn!("{}: socket write error: {}", engine.iface(), error),
        }
    }

    if let Some(path) = &lease_file {
        if let Err(error) = persist::store(path, &engine.pool().snapshot()).await {
            warn!(
                "{}: final lease flush to {} failed: {}",
                engine.iface(),
                path.display(),
                error
            );
        }
    }

    info!("Stopped handler for {}", engine.iface());
}
