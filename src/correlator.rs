//! ==============================================================================
//! correlator.rs - request/reply correlation over device sockets
//! ==============================================================================
//!
//! purpose:
//!     every outbound frame carries a sequence id in [0, 256). the correlator
//!     remembers what to do when the reply with that id comes back, and gives
//!     up on it when the deadline passes.
//!
//! lifecycle of a pending request:
//!
//! ```text
//!     PENDING ──reply status=1/absent──► RESOLVED  (patch, callback, waiter)
//!        │ ────reply status≠1──────────► FAILED    (waiter only)
//!        │ ────deadline────────────────► EXPIRED   (waiter only, logged)
//!        └────cancel (send failed)─────► CANCELLED (waiter only)
//!
//!     whichever event removes the entry from the map first wins; the others
//!     find nothing and become no-ops.
//! ```
//!
//! id reuse:
//!     ids are handed out from a wrapping counter, skipping any id that is
//!     still pending. when all 256 are pending, `issue` refuses with
//!     `CorrelatorError::Exhausted`; an in-flight request is never overwritten.
//!
//! relationships:
//!     - used by: session.rs (poll ticks, inbound frames), hub.rs (commands)
//!     - uses: protocol.rs (Reply)
//!
//! ==============================================================================

use crate::domain::Telemetry;
use crate::error::CorrelatorError;
use crate::protocol::{Reply, ReplyStatus};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Runs on a successful reply with the reply and the args given at issue time.
pub type ReplyCallback = Box<dyn FnOnce(&Reply, Option<&Value>) + Send + 'static>;

/// The device-side state a reply may patch.
pub trait TelemetryTarget {
    fn identity(&self) -> &str;
    fn apply_patch(&self, patch: &Telemetry);
}

/// Everything needed to react to one reply.
pub struct Request {
    device: String,
    callback: Option<ReplyCallback>,
    args: Option<Value>,
    patch: Option<Telemetry>,
}

impl Request {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            callback: None,
            args: None,
            patch: None,
        }
    }

    pub fn on_reply<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Reply, Option<&Value>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }

    /// Key/value pairs written into the device's latest telemetry as soon as
    /// the device confirms the change, ahead of the next poll.
    pub fn with_patch(mut self, patch: Telemetry) -> Self {
        self.patch = Some(patch);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Resolved(Reply),
    /// device answered with a failure status
    Failed(Reply),
    /// released before it could be answered, e.g. the frame was never sent
    Cancelled,
    Expired,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

/// Handle returned by `issue`.
pub struct Ticket {
    pub id: u8,
    generation: u64,
    outcome: oneshot::Receiver<Outcome>,
}

impl Ticket {
    /// Completes on reply, cancellation or deadline, whichever comes first.
    pub async fn outcome(self) -> Outcome {
        self.outcome.await.unwrap_or(Outcome::Cancelled)
    }
}

/// What `on_reply` did with an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Resolved(u8),
    Failed(u8),
    /// well formed, but nothing pending under that id for this device
    Unmatched(u8),
    Malformed,
}

struct PendingRequest {
    device: String,
    generation: u64,
    issued_at: Instant,
    callback: Option<ReplyCallback>,
    args: Option<Value>,
    patch: Option<Telemetry>,
    waiter: Option<oneshot::Sender<Outcome>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn settle(mut self, outcome: Outcome) {
        if let Some(waiter) = self.waiter.take() {
            // receiver may have been dropped (fire-and-forget polls)
            let _ = waiter.send(outcome);
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Slots {
    cursor: u8,
    generation: u64,
    pending: HashMap<u8, PendingRequest>,
}

impl Slots {
    fn allocate(&mut self) -> Option<u8> {
        for _ in 0..=u8::MAX as usize {
            let id = self.cursor;
            self.cursor = self.cursor.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn take(&mut self, id: u8, generation: Option<u64>) -> Option<PendingRequest> {
        match (self.pending.get(&id), generation) {
            (Some(entry), Some(g)) if entry.generation != g => None,
            (Some(_), _) => self.pending.remove(&id),
            (None, _) => None,
        }
    }
}

struct Shared {
    timeout: Duration,
    slots: Mutex<Slots>,
}

/// Cloneable handle; all clones share one id space.
#[derive(Clone)]
pub struct Correlator {
    shared: Arc<Shared>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                timeout,
                slots: Mutex::new(Slots::default()),
            }),
        }
    }

    /// Allocate an id, record the request and arm its deadline.
    pub fn issue(&self, request: Request) -> Result<Ticket, CorrelatorError> {
        let mut slots = self.shared.slots.lock();
        let id = slots.allocate().ok_or(CorrelatorError::Exhausted)?;
        slots.generation += 1;
        let generation = slots.generation;

        let issued_at = Instant::now();
        let deadline = issued_at + self.shared.timeout;
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let timer = tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                Correlator { shared }.expire(id, generation);
            }
        });

        let (tx, rx) = oneshot::channel();
        slots.pending.insert(
            id,
            PendingRequest {
                device: request.device,
                generation,
                issued_at,
                callback: request.callback,
                args: request.args,
                patch: request.patch,
                waiter: Some(tx),
                timer: Some(timer),
            },
        );

        Ok(Ticket {
            id,
            generation,
            outcome: rx,
        })
    }

    /// Match an inbound frame from `target`'s connection to its request.
    pub fn on_reply(&self, target: &dyn TelemetryTarget, raw: &str) -> Dispatch {
        let reply = match Reply::parse(raw) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(device = target.identity(), error = %e, "dropping malformed reply");
                return Dispatch::Malformed;
            }
        };
        let id = reply.id;

        let entry = {
            let mut slots = self.shared.slots.lock();
            match slots.pending.get(&id) {
                Some(p) if p.device == target.identity() => slots.pending.remove(&id),
                _ => None,
            }
        };
        let Some(mut entry) = entry else {
            // late duplicate, already expired, or never ours
            debug!(device = target.identity(), id, "reply has no pending request");
            return Dispatch::Unmatched(id);
        };
        entry.disarm();

        if reply.status == ReplyStatus::Failure {
            debug!(device = target.identity(), id, "device reported failure");
            entry.settle(Outcome::Failed(reply));
            return Dispatch::Failed(id);
        }

        if reply.status == ReplyStatus::Success {
            if let Some(patch) = entry.patch.as_ref() {
                target.apply_patch(patch);
            }
        }
        if let Some(callback) = entry.callback.take() {
            callback(&reply, entry.args.as_ref());
        }
        debug!(
            device = target.identity(),
            id,
            rtt_ms = entry.issued_at.elapsed().as_millis() as u64,
            "request resolved"
        );
        entry.settle(Outcome::Resolved(reply));
        Dispatch::Resolved(id)
    }

    /// Release a request that will never be answered.
    pub fn cancel(&self, ticket: &Ticket) -> bool {
        let entry = self.shared.slots.lock().take(ticket.id, Some(ticket.generation));
        match entry {
            Some(mut entry) => {
                entry.disarm();
                entry.settle(Outcome::Cancelled);
                true
            }
            None => false,
        }
    }

    fn expire(&self, id: u8, generation: u64) {
        let entry = self.shared.slots.lock().take(id, Some(generation));
        if let Some(mut entry) = entry {
            // this runs on the timer task itself
            entry.timer.take();
            warn!(
                device = %entry.device,
                id,
                timeout_ms = self.shared.timeout.as_millis() as u64,
                "request timed out"
            );
            entry.settle(Outcome::Expired);
        }
    }

    pub fn is_pending(&self, id: u8) -> bool {
        self.shared.slots.lock().pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.slots.lock().pending.len()
    }
}
