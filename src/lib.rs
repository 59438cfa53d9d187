//! ==============================================================================
//! lib.rs - greenhouse sensor hub core
//! ==============================================================================
//!
//! purpose:
//!     discovers greenhouse sensor nodes from their UDP heartbeats, keeps a
//!     websocket open to each one, polls them for telemetry, correlates
//!     replies to requests, and folds every reading into hourly statistics.
//!
//! module map (leaf first):
//!     - clock:       calendar breakdowns, time to the next hour
//!     - commands:    firmware command codebook
//!     - protocol:    heartbeat and reply parsing
//!     - config:      hub.toml schema and loader
//!     - error:       error types
//!     - domain:      shared device and projection types
//!     - correlator:  sequence ids, pending requests, timeouts
//!     - aggregation: running means and 24-slot trend history
//!     - session:     one device's connection and polling lifecycle
//!     - registry:    the device map
//!     - heartbeat:   UDP listener and expiry sweep
//!     - directory:   read-only fleet projection
//!     - hub:         wiring and background tasks
//!     - web:         json api over the hub
//!
//! ==============================================================================

pub mod aggregation;
pub mod clock;
pub mod commands;
pub mod config;
pub mod correlator;
pub mod directory;
pub mod domain;
pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod web;

pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use hub::{Hub, HubTasks};
