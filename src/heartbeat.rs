//! ==============================================================================
//! heartbeat.rs - UDP discovery and liveness
//! ==============================================================================
//!
//! purpose:
//!     sensor nodes announce themselves with a small json datagram every
//!     couple of seconds. the listener turns the first one into a new device
//!     session and every later one into a liveness refresh. a sweeper marks
//!     devices DOWN once they have been silent longer than the expiry.
//!
//! relationships:
//!     - uses: protocol.rs (Heartbeat), registry.rs, session.rs
//!     - started by: hub.rs
//!
//! ==============================================================================

use crate::error::ProtocolError;
use crate::protocol::Heartbeat;
use crate::registry::Registry;
use crate::session::{Device, DeviceSession, SessionLinks, SessionSettings};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

// a heartbeat is a few hundred bytes; anything bigger is not ours
const MAX_DATAGRAM: usize = 2048;

pub struct HeartbeatListener {
    registry: Registry,
    links: SessionLinks,
    settings: SessionSettings,
    expiry: Duration,
}

impl HeartbeatListener {
    pub fn new(
        registry: Registry,
        links: SessionLinks,
        settings: SessionSettings,
        expiry: Duration,
    ) -> Self {
        Self {
            registry,
            links,
            settings,
            expiry,
        }
    }

    /// Apply one datagram. Returns the device and whether it was new.
    pub fn handle_datagram(
        &self,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<(Arc<Device>, bool), ProtocolError> {
        let heartbeat = Heartbeat::parse(bytes)?;
        let address = from.ip();

        let (device, created) = self.registry.upsert(&heartbeat.identity, || {
            Device::new(
                &heartbeat,
                address,
                self.settings.clone(),
                self.links.clone(),
                now,
            )
        });

        if created {
            info!(
                device = %device.name(),
                identity = %heartbeat.identity,
                %address,
                firmware = heartbeat.firmware.as_deref().unwrap_or("?"),
                "new device discovered"
            );
            device.ensure_connected();
        } else {
            device.on_heartbeat(&heartbeat, address, now);
        }
        Ok((device, created))
    }

    /// One expiry pass. Returns how many devices went DOWN.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut expired = 0;
        self.registry.for_each_active(|device| {
            if device.expire(now, self.expiry) {
                expired += 1;
            }
        });
        expired
    }

    pub async fn listen(self: Arc<Self>, socket: UdpSocket) {
        match socket.local_addr() {
            Ok(addr) => info!(%addr, "heartbeat listener ready"),
            Err(e) => warn!(error = %e, "heartbeat socket has no local address"),
        }

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "heartbeat receive failed");
                    continue;
                }
            };
            if let Err(e) = self.handle_datagram(&buf[..len], from, Instant::now()) {
                warn!(%from, error = %e, "dropping malformed heartbeat");
            }
        }
    }

    pub async fn run_sweeper(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = self.sweep(Instant::now());
            if expired > 0 {
                debug!(expired, "heartbeat sweep");
            }
        }
    }
}
