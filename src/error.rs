//! ==============================================================================
//! error.rs - error taxonomy for the hub core
//! ==============================================================================
//!
//! purpose:
//!     typed errors for each fault class the hub can hit. none of them are
//!     fatal at runtime: callers log them and degrade to "device down" or
//!     "this request failed".
//!
//! relationships:
//!     - used by: config.rs, protocol.rs, commands.rs, session.rs, correlator.rs,
//!       hub.rs
//!
//! ==============================================================================

use std::io::Error as IoError;
use thiserror::Error;

pub type HubResult<T, E = HubError> = Result<T, E>;

/// configuration could not be read or is inconsistent
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] IoError),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// malformed datagram or message from a device
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload is not valid json: {0}")]
    NotJson(String),
    #[error("payload is not a json object")]
    NotObject,
    #[error("heartbeat carries no mdns identity")]
    MissingIdentity,
    #[error("reply carries no id")]
    MissingId,
    #[error("reply id {0:?} is not an integer in [0, 256)")]
    InvalidId(String),
}

/// a frame could not be handed to the device connection
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("no connection")]
    NoConnection,
    #[error("connection not open")]
    NotOpen,
    #[error("transport rejected the write")]
    Rejected,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("all 256 request ids are pending")]
    Exhausted,
}

/// a command name that is not in the socket command table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown socket command {0:?}")]
pub struct UnknownCommand(pub String);

#[derive(Error, Debug)]
pub enum HubError {
    #[error("{0}")]
    Io(#[from] IoError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    #[error("{0}")]
    Correlator(#[from] CorrelatorError),
    #[error("{0}")]
    Command(#[from] UnknownCommand),
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("sub argument {0:?} must not contain '/'")]
    InvalidSub(String),
}
