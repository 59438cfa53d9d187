//! ==============================================================================
//! hub.rs - wiring of the hub core
//! ==============================================================================
//!
//! purpose:
//!     builds the shared pieces once (registry, correlator, listener,
//!     aggregator) and starts the background tasks that drive them.
//!
//! background tasks:
//!
//! ```text
//!     ┌──────────────────┐   ┌──────────────────┐
//!     │ heartbeat listen │   │ heartbeat sweep  │  (1s)
//!     │ (udp 6842)       │   │ UP -> DOWN       │
//!     └────────┬─────────┘   └────────┬─────────┘
//!              │                      │
//!              └──────────┬───────────┘
//!                    ┌────┴─────┐
//!                    │ registry │ <- one Device per identity
//!                    └────┬─────┘
//!              ┌──────────┴───────────┐
//!     ┌────────┴─────────┐   ┌────────┴─────────┐
//!     │ reconnect check  │   │ hourly snapshot  │
//!     │ (5s)             │   │ (top of hour)    │
//!     └──────────────────┘   └──────────────────┘
//!
//!     per-device connect/read/write/poll tasks are owned by each Device.
//! ```
//!
//! ==============================================================================

use crate::aggregation::Aggregator;
use crate::commands::SocketCommand;
use crate::config::HubConfig;
use crate::correlator::{Correlator, Outcome, Request};
use crate::directory::FleetDirectory;
use crate::domain::Telemetry;
use crate::error::{HubError, HubResult};
use crate::heartbeat::HeartbeatListener;
use crate::registry::Registry;
use crate::session::{DeviceSession, SessionLinks, SessionSettings};

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Clone)]
pub struct Hub {
    config: Arc<HubConfig>,
    registry: Registry,
    correlator: Correlator,
    listener: Arc<HeartbeatListener>,
    aggregator: Aggregator,
}

/// Handles of the tasks started by `Hub::start`.
pub struct HubTasks {
    /// where heartbeats are actually received (resolves port 0)
    pub heartbeat_addr: SocketAddr,
    handles: Vec<JoinHandle<()>>,
}

impl HubTasks {
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let registry = Registry::default();
        let correlator = Correlator::new(Duration::from_millis(config.requests.timeout_ms));
        let aggregator = Aggregator::new(&registry);
        let links = SessionLinks {
            correlator: correlator.clone(),
            aggregator: aggregator.clone(),
        };
        let listener = HeartbeatListener::new(
            registry.clone(),
            links,
            SessionSettings::from_config(&config),
            config.heartbeat.expiry(),
        );
        Self {
            aggregator,
            listener: Arc::new(listener),
            config: Arc::new(config),
            registry,
            correlator,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn directory(&self) -> FleetDirectory {
        FleetDirectory::new(self.registry.clone(), self.config.aggregation.decimal_places)
    }

    /// Bind the heartbeat socket and start every background task.
    pub async fn start(&self) -> HubResult<HubTasks> {
        let hb = &self.config.heartbeat;
        let socket = UdpSocket::bind((hb.bind, hb.port)).await?;
        let heartbeat_addr = socket.local_addr()?;

        let handles = vec![
            tokio::spawn(Arc::clone(&self.listener).listen(socket)),
            tokio::spawn(Arc::clone(&self.listener).run_sweeper(hb.sweep_interval())),
            tokio::spawn(self.clone().run_reconnect_check()),
            tokio::spawn(self.aggregator.clone().run_hourly()),
        ];
        info!(%heartbeat_addr, "hub started");

        Ok(HubTasks {
            heartbeat_addr,
            handles,
        })
    }

    async fn run_reconnect_check(self) {
        let period = Duration::from_millis(self.config.session.reconnect_check_ms);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            self.registry.for_each(|device| {
                device.check_connection(now, period);
            });
        }
    }

    /// Send `command` to one device and wait for the reply or the deadline.
    /// A `patch` is written into the device's telemetry once it confirms.
    /// `sub` is rejected if it contains `/`, which would shift the id field.
    pub async fn command(
        &self,
        identity: &str,
        command: SocketCommand,
        sub: impl Display,
        patch: Option<Telemetry>,
    ) -> HubResult<Outcome> {
        let sub = sub.to_string();
        if sub.contains('/') {
            return Err(HubError::InvalidSub(sub));
        }
        let device = self
            .registry
            .get(identity)
            .ok_or_else(|| HubError::UnknownDevice(identity.to_string()))?;

        let mut request = Request::new(identity);
        if let Some(patch) = patch {
            request = request.with_patch(patch);
        }
        let ticket = self.correlator.issue(request)?;

        let frame = command.frame(&sub, ticket.id);
        if let Err(e) = device.send(&frame) {
            self.correlator.cancel(&ticket);
            return Err(e.into());
        }
        debug!(device = %device.name(), %command, %frame, "command sent");

        let outcome = ticket.outcome().await;
        info!(device = %device.name(), %command, success = outcome.is_success(), "command finished");
        Ok(outcome)
    }
}
