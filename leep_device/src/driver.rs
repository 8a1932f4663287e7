//! Background driver loop.
//!
//! One current-thread tokio runtime per device. The loop is the only
//! code touching the socket:
//!
//! ```text
//! loop {
//!     poll core ──► resolve peer? ──► send frames
//!     select! {
//!         intent (Notify)     ──► re-poll
//!         datagram            ──► core.handle_datagram
//!         deadline (timer)    ──► re-poll (timeouts, reconnect)
//!     }
//! }
//! ```

use crate::session::Device;
use crate::status::DebugFlags;
use leep_common::config::PeerAddress;
use leep_common::consts::{COMMAND_SIZE, MAX_FRAME_BYTES};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

pub(crate) async fn run(device: Arc<Device>, socket: std::net::UdpSocket) {
    let socket = match UdpSocket::from_std(socket) {
        Ok(s) => s,
        Err(e) => {
            device.transport_error(format!("Socket setup failed: {e}"));
            return;
        }
    };
    let local_v4 = device.local_addr().is_ipv4();
    // room for one oversized datagram so it is seen as too long
    let mut buf = vec![0u8; MAX_FRAME_BYTES + COMMAND_SIZE];

    while !device.stopping() {
        let poll = device.drive();

        if let Some(request) = poll.resolve {
            let result = resolve(&request.peer, device.resolve_timeout(), local_v4).await;
            device.resolved(request.generation, result);
            continue;
        }

        let mut sent = 0;
        let mut failed = false;
        for frame in &poll.outbound {
            match socket.send_to(&frame.bytes, frame.dest).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    device.transport_error(format!("Send to {} failed: {e}", frame.dest));
                    failed = true;
                    break;
                }
            }
        }
        device.sent(sent);
        if failed {
            continue;
        }

        let deadline = poll.deadline;
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = device.notified() => {
                if device.debug().contains(DebugFlags::LOOP) {
                    trace!(device = %device.name(), "Woken by intent");
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => device.datagram(&buf[..len], from),
                Err(e) => device.transport_error(format!("Receive failed: {e}")),
            },
            _ = timer => {
                if device.debug().contains(DebugFlags::LOOP) {
                    trace!(device = %device.name(), "Timer expired");
                }
            }
        }
    }
    info!(device = %device.name(), "Driver stopped");
}

/// Resolve `peer`, preferring the address family of the local socket.
async fn resolve(
    peer: &PeerAddress,
    timeout: Duration,
    prefer_v4: bool,
) -> Result<SocketAddr, String> {
    if let Some(addr) = peer.socket_addr() {
        return Ok(addr);
    }
    debug!("Looking up {}", peer);
    let lookup = tokio::net::lookup_host(peer.lookup_string());
    let addrs: Vec<SocketAddr> = match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(addrs)) => addrs.collect(),
        Ok(Err(e)) => return Err(e.to_string()),
        Err(_) => return Err(format!("lookup timed out after {timeout:?}")),
    };
    addrs
        .iter()
        .find(|a| a.is_ipv4() == prefer_v4)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| "no addresses".to_string())
}
