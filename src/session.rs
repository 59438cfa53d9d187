//! ==============================================================================
//! session.rs - one device's connection, polling and statistics
//! ==============================================================================
//!
//! purpose:
//!     a `Device` owns everything the hub knows about one sensor node: its
//!     address and liveness, the websocket to it, the poll schedule, the latest
//!     reading, and the running/archived statistics.
//!
//! state machine:
//!
//! ```text
//!     DISCOVERED ──ensure_connected──► CONNECTING ──open──► CONNECTED (polling)
//!                                          ▲   │                 │
//!                              reconnect() │   └─fail─┐          │ close / error /
//!                                          │          ▼          │ expiry
//!                          CONNECTED / CONNECTING   DISCONNECTED ◄─┘ (not polling)
//!
//!     a device that keeps announcing is resurrected indefinitely. reconnect()
//!     during CONNECTING abandons that attempt, so a heartbeat from a new
//!     address always ends with a dial to that address.
//! ```
//!
//! connection epochs:
//!     every attempt bumps `epoch`. the connect task and the reader task carry
//!     the epoch they were started under; their open/close events are ignored
//!     once a newer attempt (or an expiry) has moved the epoch on.
//!
//! transport:
//!     the websocket is split. a reader task feeds the correlator; a writer
//!     task drains an unbounded mpsc queue whose sender is the connection
//!     handle kept in the record.
//!
//! relationships:
//!     - used by: registry.rs, heartbeat.rs, aggregation.rs, directory.rs, hub.rs
//!     - uses: correlator.rs (poll requests, reply dispatch), commands.rs,
//!       aggregation.rs (poll replies are folded through the engine)
//!
//! ==============================================================================

use crate::aggregation::{Aggregator, RunningStats, TrendHistory};
use crate::commands::SocketCommand;
use crate::config::HubConfig;
use crate::correlator::{Correlator, Request, TelemetryTarget};
use crate::domain::{DeviceDetail, DeviceSummary, Liveness, SessionPhase, Telemetry};
use crate::error::SendError;
use crate::protocol::{display_name, Heartbeat};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// settings
// ============================================================================

/// Per-device knobs, cut from `HubConfig`.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub socket_port: u16,
    pub socket_path: String,
}

impl SessionSettings {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.polling.frequency_ms),
            connect_timeout: Duration::from_millis(config.session.connect_timeout_ms),
            socket_port: config.session.socket_port,
            socket_path: config.session.socket_path.clone(),
        }
    }

    /// `ws://<address>[:port]<path>`; port 80 is left implicit.
    pub fn socket_url(&self, address: IpAddr) -> String {
        let host = match address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        if self.socket_port == 80 {
            format!("ws://{}{}", host, self.socket_path)
        } else {
            format!("ws://{}:{}{}", host, self.socket_port, self.socket_path)
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

/// Fleet-wide services every session reports into.
#[derive(Clone)]
pub struct SessionLinks {
    pub correlator: Correlator,
    pub aggregator: Aggregator,
}

impl SessionLinks {
    /// Links to a private correlator and an engine with no fleet behind it.
    #[cfg(test)]
    pub(crate) fn detached(request_timeout: Duration) -> Self {
        Self {
            correlator: Correlator::new(request_timeout),
            aggregator: Aggregator::new(&crate::registry::Registry::default()),
        }
    }
}

// ============================================================================
// the session interface
// ============================================================================

/// Connection and polling lifecycle of one device.
pub trait DeviceSession {
    fn identity(&self) -> &str;

    /// No-op when open and healthy or an attempt is already in flight.
    fn ensure_connected(self: &Arc<Self>);

    /// Drop the current connection or in-flight attempt and dial again.
    fn reconnect(self: &Arc<Self>);

    fn send(&self, frame: &str) -> Result<(), SendError>;

    fn start_poll(self: &Arc<Self>);

    fn stop_poll(&self);

    fn is_polling(&self) -> bool;

    fn phase(&self) -> SessionPhase;
}

/// What the reconnect check decided for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCheck {
    Healthy,
    /// UP but not connected
    Dial,
    /// connected but silent for too long
    Restart,
    /// DOWN or mid-attempt; left alone
    Skipped,
}

// ============================================================================
// device state
// ============================================================================

struct Connection {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.outbound.is_closed() && !self.reader.is_finished() && !self.writer.is_finished()
    }

    /// Queue a close frame and let the writer drain it.
    fn terminate(self) {
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
    }
}

struct DeviceRecord {
    address: IpAddr,
    socket_url: String,
    firmware: Option<String>,
    announcement: Telemetry,
    last_seen: Instant,
    liveness: Liveness,
    down_since: Option<Instant>,
    phase: SessionPhase,
    epoch: u64,
    connection: Option<Connection>,
    poll: Option<JoinHandle<()>>,
    /// last frame of any kind from the device
    last_rx: Option<Instant>,
    telemetry: Telemetry,
    stats: RunningStats,
    trends: TrendHistory,
}

impl DeviceRecord {
    fn cancel_poll(&mut self) -> bool {
        match self.poll.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Tear down transport and schedule, and invalidate in-flight callbacks.
    fn drop_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.terminate();
        }
        self.cancel_poll();
        self.epoch += 1;
    }
}

pub struct Device {
    identity: String,
    name: String,
    settings: SessionSettings,
    correlator: Correlator,
    aggregator: Aggregator,
    record: Mutex<DeviceRecord>,
}

impl Device {
    /// A freshly announced device: UP, not yet dialled.
    pub fn new(
        heartbeat: &Heartbeat,
        address: IpAddr,
        settings: SessionSettings,
        links: SessionLinks,
        now: Instant,
    ) -> Arc<Self> {
        let record = DeviceRecord {
            address,
            socket_url: settings.socket_url(address),
            firmware: heartbeat.firmware.clone(),
            announcement: heartbeat.fields.clone(),
            last_seen: now,
            liveness: Liveness::Up,
            down_since: None,
            phase: SessionPhase::Discovered,
            epoch: 0,
            connection: None,
            poll: None,
            last_rx: None,
            telemetry: Telemetry::new(),
            stats: RunningStats::default(),
            trends: TrendHistory::default(),
        };
        Arc::new(Self {
            identity: heartbeat.identity.clone(),
            name: display_name(&heartbeat.identity),
            settings,
            correlator: links.correlator,
            aggregator: links.aggregator,
            record: Mutex::new(record),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------------
    // liveness
    // ------------------------------------------------------------------------

    /// A repeat announcement: refresh address and last-seen, come back UP,
    /// then make sure the socket is there.
    pub fn on_heartbeat(self: &Arc<Self>, heartbeat: &Heartbeat, address: IpAddr, now: Instant) {
        let moved = {
            let mut rec = self.record.lock();
            let moved = rec.address != address;
            if moved {
                info!(device = %self.name, old = %rec.address, new = %address, "device address changed");
                rec.address = address;
                rec.socket_url = self.settings.socket_url(address);
            }
            rec.firmware = heartbeat.firmware.clone();
            rec.announcement = heartbeat.fields.clone();
            rec.last_seen = now;
            if rec.liveness == Liveness::Down {
                info!(device = %self.name, "device UP");
                rec.liveness = Liveness::Up;
                rec.down_since = None;
            }
            moved
        };

        if moved {
            self.reconnect();
        } else {
            self.ensure_connected();
        }
    }

    /// Sweep step. Marks the device DOWN if it has been silent longer than
    /// `threshold`; true only on the UP -> DOWN edge.
    pub fn expire(&self, now: Instant, threshold: Duration) -> bool {
        let mut rec = self.record.lock();
        if rec.liveness != Liveness::Up
            || now.saturating_duration_since(rec.last_seen) <= threshold
        {
            return false;
        }
        rec.liveness = Liveness::Down;
        rec.down_since = Some(now);
        rec.drop_connection();
        rec.phase = SessionPhase::Disconnected;
        warn!(
            device = %self.name,
            silent_ms = now.saturating_duration_since(rec.last_seen).as_millis() as u64,
            "heartbeat expired, device DOWN"
        );
        true
    }

    pub fn liveness(&self) -> Liveness {
        self.record.lock().liveness
    }

    pub fn down_since(&self) -> Option<Instant> {
        self.record.lock().down_since
    }

    pub fn last_seen(&self) -> Instant {
        self.record.lock().last_seen
    }

    pub fn address(&self) -> IpAddr {
        self.record.lock().address
    }

    pub fn socket_url(&self) -> String {
        self.record.lock().socket_url.clone()
    }

    // ------------------------------------------------------------------------
    // connection lifecycle
    // ------------------------------------------------------------------------

    async fn connect(self: Arc<Self>, epoch: u64, url: String) {
        debug!(device = %self.name, %url, epoch, "opening websocket");
        let stream = match timeout(self.settings.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                warn!(device = %self.name, %url, error = %e, "websocket connect failed");
                self.on_closed(epoch);
                return;
            }
            Err(_) => {
                warn!(
                    device = %self.name,
                    %url,
                    timeout_ms = self.settings.connect_timeout.as_millis() as u64,
                    "websocket connect timed out"
                );
                self.on_closed(epoch);
                return;
            }
        };

        let (sink, source) = stream.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, queue, self.name.clone()));
        let reader = tokio::spawn(Arc::clone(&self).read_loop(source, epoch));

        {
            let mut rec = self.record.lock();
            if rec.epoch != epoch || rec.phase != SessionPhase::Connecting {
                debug!(device = %self.name, epoch, "connection attempt superseded");
                drop(rec);
                reader.abort();
                writer.abort();
                return;
            }
            rec.connection = Some(Connection {
                epoch,
                outbound,
                reader,
                writer,
            });
            rec.phase = SessionPhase::Connected;
            rec.liveness = Liveness::Up;
            rec.down_since = None;
            rec.last_rx = Some(Instant::now());
        }
        info!(device = %self.name, %url, "connection OPEN");
        self.start_poll();
    }

    async fn read_loop(self: Arc<Self>, mut source: SplitStream<WsStream>, epoch: u64) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    self.touch_rx();
                    self.correlator.on_reply(&*self, text.as_str());
                }
                Ok(Message::Binary(bytes)) => {
                    self.touch_rx();
                    match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            self.correlator.on_reply(&*self, text);
                        }
                        Err(_) => warn!(device = %self.name, "dropping non-utf8 binary frame"),
                    }
                }
                Ok(Message::Close(frame)) => {
                    debug!(device = %self.name, ?frame, "close frame received");
                    break;
                }
                Ok(_) => self.touch_rx(),
                // message-level faults; the stream itself is still usable
                Err(e @ (WsError::Utf8 | WsError::Capacity(_))) => {
                    warn!(device = %self.name, error = %e, "bad frame from device");
                }
                Err(e) => {
                    warn!(device = %self.name, error = %e, "websocket transport error");
                    break;
                }
            }
        }
        self.on_closed(epoch);
    }

    /// Close (or failed connect) for `epoch`. DOWN until the next heartbeat.
    fn on_closed(&self, epoch: u64) {
        let mut rec = self.record.lock();
        if rec.epoch != epoch {
            debug!(device = %self.name, epoch, current = rec.epoch, "ignoring stale close");
            return;
        }
        // the reader is finished; dropping the sender stops the writer
        rec.connection.take();
        rec.cancel_poll();
        rec.phase = SessionPhase::Disconnected;
        if rec.liveness == Liveness::Up {
            rec.liveness = Liveness::Down;
            rec.down_since = Some(Instant::now());
        }
        info!(device = %self.name, "connection CLOSED, device DOWN");
    }

    fn touch_rx(&self) {
        self.record.lock().last_rx = Some(Instant::now());
    }

    /// Reconnect-check step; see `ConnectionCheck`.
    pub fn check_connection(self: &Arc<Self>, now: Instant, stale_after: Duration) -> ConnectionCheck {
        let check = {
            let rec = self.record.lock();
            if rec.liveness != Liveness::Up {
                ConnectionCheck::Skipped
            } else {
                match rec.phase {
                    SessionPhase::Discovered | SessionPhase::Disconnected => ConnectionCheck::Dial,
                    SessionPhase::Connecting => ConnectionCheck::Skipped,
                    SessionPhase::Connected => {
                        let silent = rec
                            .last_rx
                            .map_or(true, |t| now.saturating_duration_since(t) > stale_after);
                        if silent {
                            ConnectionCheck::Restart
                        } else {
                            ConnectionCheck::Healthy
                        }
                    }
                }
            }
        };

        match check {
            ConnectionCheck::Dial => self.ensure_connected(),
            ConnectionCheck::Restart => {
                warn!(
                    device = %self.name,
                    stale_ms = stale_after.as_millis() as u64,
                    "no traffic from device, restarting connection"
                );
                self.reconnect();
            }
            ConnectionCheck::Healthy | ConnectionCheck::Skipped => {}
        }
        check
    }

    // ------------------------------------------------------------------------
    // polling
    // ------------------------------------------------------------------------

    /// One poll tick: GET_ALL through the correlator. The reply is folded
    /// by the aggregation engine.
    pub fn poll_once(&self) {
        let aggregator = self.aggregator.clone();
        let identity = self.identity.clone();
        let request = Request::new(self.identity.clone()).on_reply(move |reply, _| {
            aggregator.fold_reading(&identity, &reply.payload);
        });
        let ticket = match self.correlator.issue(request) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(device = %self.name, error = %e, "poll skipped");
                return;
            }
        };

        let frame = SocketCommand::GetAll.frame(0, ticket.id);
        if let Err(e) = self.send(&frame) {
            warn!(device = %self.name, error = %e, "poll send failed");
            self.correlator.cancel(&ticket);
        }
    }

    // ------------------------------------------------------------------------
    // telemetry and statistics
    // ------------------------------------------------------------------------

    /// Replace the latest reading and fold it into the running stats.
    /// Readings arrive through `Aggregator::fold_reading`.
    pub(crate) fn record_telemetry(&self, reading: &Telemetry) {
        let mut rec = self.record.lock();
        rec.telemetry = reading.clone();
        rec.stats.fold(reading);
    }

    /// Archive the running stats under `hour` and reset them, atomically
    /// with respect to folds. Returns the archived copy.
    pub fn snapshot_stats(&self, hour: usize) -> RunningStats {
        let mut rec = self.record.lock();
        let snapshot = rec.stats.clone();
        rec.trends.record(hour, snapshot.clone());
        rec.stats.reset();
        snapshot
    }

    pub fn telemetry(&self) -> Telemetry {
        self.record.lock().telemetry.clone()
    }

    pub fn stats(&self) -> RunningStats {
        self.record.lock().stats.clone()
    }

    pub fn trend(&self, hour: usize) -> Option<RunningStats> {
        self.record.lock().trends.get(hour).cloned()
    }

    // ------------------------------------------------------------------------
    // projections
    // ------------------------------------------------------------------------

    pub fn summary(&self) -> DeviceSummary {
        let rec = self.record.lock();
        DeviceSummary {
            name: self.name.clone(),
            liveness: rec.liveness,
            address: rec.address.to_string(),
            socket_url: rec.socket_url.clone(),
        }
    }

    pub fn detail(&self, decimal_places: u32) -> DeviceDetail {
        let rec = self.record.lock();
        DeviceDetail {
            summary: DeviceSummary {
                name: self.name.clone(),
                liveness: rec.liveness,
                address: rec.address.to_string(),
                socket_url: rec.socket_url.clone(),
            },
            phase: rec.phase,
            firmware: rec.firmware.clone(),
            announcement: rec.announcement.clone(),
            telemetry: rec.telemetry.clone(),
            averages: rec.stats.rounded(decimal_places),
            trends: DeviceDetail::trends_from(&rec.trends),
        }
    }
}

impl DeviceSession for Device {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn ensure_connected(self: &Arc<Self>) {
        let (epoch, url) = {
            let mut rec = self.record.lock();
            match rec.phase {
                SessionPhase::Connecting => {
                    debug!(device = %self.name, "connection attempt already in flight");
                    return;
                }
                SessionPhase::Connected if rec.connection.as_ref().is_some_and(Connection::is_open) => {
                    return;
                }
                _ => {}
            }
            if rec.connection.is_some() {
                debug!(device = %self.name, "closing unhealthy connection before redial");
            }
            rec.drop_connection();
            rec.phase = SessionPhase::Connecting;
            (rec.epoch, rec.socket_url.clone())
        };
        tokio::spawn(Arc::clone(self).connect(epoch, url));
    }

    fn reconnect(self: &Arc<Self>) {
        {
            let mut rec = self.record.lock();
            if rec.phase == SessionPhase::Connecting {
                debug!(device = %self.name, epoch = rec.epoch, "abandoning in-flight attempt");
            }
            info!(device = %self.name, url = %rec.socket_url, "reconnecting");
            rec.drop_connection();
            rec.phase = SessionPhase::Disconnected;
        }
        self.ensure_connected();
    }

    fn send(&self, frame: &str) -> Result<(), SendError> {
        let rec = self.record.lock();
        let conn = rec.connection.as_ref().ok_or(SendError::NoConnection)?;
        if rec.phase != SessionPhase::Connected || conn.epoch != rec.epoch || !conn.is_open() {
            return Err(SendError::NotOpen);
        }
        conn.outbound
            .send(Message::text(frame.to_string()))
            .map_err(|_| SendError::Rejected)
    }

    fn start_poll(self: &Arc<Self>) {
        let mut rec = self.record.lock();
        if rec.poll.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!(device = %self.name, "poll schedule already running");
            return;
        }
        if rec.phase != SessionPhase::Connected {
            warn!(device = %self.name, phase = ?rec.phase, "not polling without an open connection");
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.settings.poll_interval;
        rec.poll = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(device) = weak.upgrade() else { break };
                device.poll_once();
            }
        }));
        debug!(device = %self.name, period_ms = period.as_millis() as u64, "poll schedule started");
    }

    fn stop_poll(&self) {
        if !self.record.lock().cancel_poll() {
            debug!(device = %self.name, "poll schedule not running");
        }
    }

    fn is_polling(&self) -> bool {
        self.record
            .lock()
            .poll
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn phase(&self) -> SessionPhase {
        self.record.lock().phase
    }
}

impl TelemetryTarget for Device {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn apply_patch(&self, patch: &Telemetry) {
        let mut rec = self.record.lock();
        for (key, value) in patch {
            rec.telemetry.insert(key.clone(), value.clone());
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut queue: mpsc::UnboundedReceiver<Message>,
    name: String,
) {
    while let Some(message) = queue.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!(device = %name, error = %e, "websocket write failed");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::Ipv4Addr;

    fn heartbeat(identity: &str) -> Heartbeat {
        Heartbeat::parse(format!(r#"{{"mdns":"{identity}","firmv":"2.1"}}"#).as_bytes()).unwrap()
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn device(settings: SessionSettings) -> Arc<Device> {
        Device::new(
            &heartbeat("http://greenhouse1.local"),
            ip(20),
            settings,
            SessionLinks::detached(Duration::from_millis(2000)),
            Instant::now(),
        )
    }

    #[test]
    fn socket_url_omits_default_port() {
        let mut settings = SessionSettings::default();
        assert_eq!(settings.socket_url(ip(20)), "ws://192.168.1.20/ws");
        settings.socket_port = 8080;
        assert_eq!(settings.socket_url(ip(20)), "ws://192.168.1.20:8080/ws");
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(settings.socket_url(v6), "ws://[fe80::1]:8080/ws");
    }

    #[test]
    fn new_device_is_up_and_discovered() {
        let d = device(SessionSettings::default());
        assert_eq!(d.name(), "greenhouse1");
        assert_eq!(d.liveness(), Liveness::Up);
        assert_eq!(d.phase(), SessionPhase::Discovered);
        assert!(!d.is_polling());
        assert_eq!(d.summary().socket_url, "ws://192.168.1.20/ws");
    }

    #[test]
    fn send_without_connection_fails() {
        let d = device(SessionSettings::default());
        assert_eq!(d.send("1/0/0"), Err(SendError::NoConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn start_poll_requires_connection() {
        let d = device(SessionSettings::default());
        d.start_poll();
        assert!(!d.is_polling());
        // stopping a schedule that never ran is harmless
        d.stop_poll();
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_fires_once_per_silence() {
        let d = device(SessionSettings::default());
        let t0 = d.last_seen();
        let threshold = Duration::from_millis(5000);

        assert!(!d.expire(t0 + Duration::from_millis(5000), threshold));
        assert!(d.expire(t0 + Duration::from_millis(6000), threshold));
        assert_eq!(d.liveness(), Liveness::Down);
        assert_eq!(d.down_since(), Some(t0 + Duration::from_millis(6000)));
        assert_eq!(d.phase(), SessionPhase::Disconnected);

        assert!(!d.expire(t0 + Duration::from_millis(9000), threshold));
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_connected_is_single_flight() {
        let d = device(SessionSettings::default());
        d.ensure_connected();
        assert_eq!(d.phase(), SessionPhase::Connecting);
        let epoch = d.record.lock().epoch;

        // no await in between: the spawned attempt has not run yet
        d.ensure_connected();
        d.on_heartbeat(&heartbeat("http://greenhouse1.local"), ip(20), Instant::now());
        assert_eq!(d.record.lock().epoch, epoch);
        assert_eq!(d.phase(), SessionPhase::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn move_while_connecting_abandons_the_old_attempt() {
        let d = device(SessionSettings::default());
        d.ensure_connected();
        let toward_old = d.record.lock().epoch;

        d.on_heartbeat(&heartbeat("http://greenhouse1.local"), ip(21), Instant::now());
        let toward_new = d.record.lock().epoch;
        assert!(toward_new > toward_old);
        assert_eq!(d.phase(), SessionPhase::Connecting);
        assert_eq!(d.socket_url(), "ws://192.168.1.21/ws");

        // the old attempt failing later changes nothing
        d.on_closed(toward_old);
        assert_eq!(d.phase(), SessionPhase::Connecting);
        assert_eq!(d.liveness(), Liveness::Up);

        // a second heartbeat from the new address is a plain refresh
        d.on_heartbeat(&heartbeat("http://greenhouse1.local"), ip(21), Instant::now());
        assert_eq!(d.record.lock().epoch, toward_new);
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_connected_replaces_a_dead_connection() {
        let d = device(SessionSettings::default());
        let before = {
            let mut rec = d.record.lock();
            let epoch = rec.epoch;
            let (outbound, queue) = mpsc::unbounded_channel();
            // writer side gone: the connection reports itself closed
            drop(queue);
            rec.connection = Some(Connection {
                epoch,
                outbound,
                reader: tokio::spawn(async {}),
                writer: tokio::spawn(async {}),
            });
            rec.phase = SessionPhase::Connected;
            epoch
        };

        d.ensure_connected();
        let rec = d.record.lock();
        assert_eq!(rec.epoch, before + 1);
        assert_eq!(rec.phase, SessionPhase::Connecting);
        assert!(rec.connection.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_without_connection_releases_its_id() {
        let d = device(SessionSettings::default());
        d.poll_once();
        d.poll_once();
        assert_eq!(d.correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_close_is_ignored() {
        let d = device(SessionSettings::default());
        d.ensure_connected();
        let first = d.record.lock().epoch;

        // expiry moves the epoch on, then the old attempt reports back
        assert!(d.expire(d.last_seen() + Duration::from_secs(10), Duration::from_secs(5)));
        d.on_heartbeat(&heartbeat("http://greenhouse1.local"), ip(20), Instant::now());
        let second = d.record.lock().epoch;
        assert!(second > first);
        assert_eq!(d.liveness(), Liveness::Up);

        d.on_closed(first);
        assert_eq!(d.liveness(), Liveness::Up);
        assert_eq!(d.phase(), SessionPhase::Connecting);

        d.on_closed(second);
        assert_eq!(d.liveness(), Liveness::Down);
        assert_eq!(d.phase(), SessionPhase::Disconnected);
        assert!(d.down_since().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_from_new_address_updates_socket_url() {
        let d = device(SessionSettings::default());
        d.on_heartbeat(&heartbeat("http://greenhouse1.local"), ip(21), Instant::now());
        assert_eq!(d.address(), ip(21));
        assert_eq!(d.socket_url(), "ws://192.168.1.21/ws");
        assert_eq!(d.phase(), SessionPhase::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn check_connection_dials_up_devices_only() {
        let d = device(SessionSettings::default());
        let now = Instant::now();
        assert_eq!(d.check_connection(now, Duration::from_secs(5)), ConnectionCheck::Dial);
        assert_eq!(d.check_connection(now, Duration::from_secs(5)), ConnectionCheck::Skipped);

        assert!(d.expire(now + Duration::from_secs(10), Duration::from_secs(5)));
        assert_eq!(
            d.check_connection(now + Duration::from_secs(10), Duration::from_secs(5)),
            ConnectionCheck::Skipped
        );
    }

    #[test]
    fn patch_and_telemetry_share_one_view() {
        let d = device(SessionSettings::default());
        d.record_telemetry(&json!({"temp": 20.0, "hum": 40.0, "SHTRdOK": 1}).as_object().cloned().unwrap());
        d.apply_patch(&json!({"re0": 1}).as_object().cloned().unwrap());

        let detail = d.detail(2);
        assert_eq!(detail.telemetry.get("temp"), Some(&json!(20.0)));
        assert_eq!(detail.telemetry.get("re0"), Some(&json!(1)));
        assert_eq!(detail.averages.climate.count, 1);
        assert_eq!(detail.firmware.as_deref(), Some("2.1"));
        assert_eq!(detail.announcement.get("firmv"), Some(&json!("2.1")));
    }
}
