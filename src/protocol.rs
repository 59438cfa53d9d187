//! ==============================================================================
//! protocol.rs - device wire formats
//! ==============================================================================
//!
//! purpose:
//!     parses the two inbound message kinds a sensor node produces:
//!     - heartbeat: unsolicited UDP json announcement, keyed by `mdns`
//!     - reply: websocket json answer to a `<code>/<sub>/<id>` frame
//!
//! relationships:
//!     - used by: heartbeat.rs (Heartbeat), correlator.rs (Reply)
//!
//! ==============================================================================

use crate::domain::Telemetry;
use crate::error::ProtocolError;
use serde_json::Value;

/// A parsed device announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    /// advertised mdns name; the registry key
    pub identity: String,
    pub firmware: Option<String>,
    /// every field the device sent, verbatim
    pub fields: Telemetry,
}

impl Heartbeat {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let fields = parse_object(bytes)?;

        let identity = match fields.get("mdns").and_then(Value::as_str) {
            Some(mdns) if !mdns.trim().is_empty() => mdns.trim().to_string(),
            _ => return Err(ProtocolError::MissingIdentity),
        };
        let firmware = fields
            .get("firmv")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self { identity, firmware, fields })
    }
}

/// Short display name: `http://greenhouse3.local` becomes `greenhouse3`.
/// Identities that don't follow that pattern are used verbatim.
pub fn display_name(identity: &str) -> String {
    identity
        .strip_prefix("http://")
        .and_then(|rest| rest.strip_suffix(".local"))
        .filter(|host| {
            host.strip_prefix("greenhouse")
                .is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()))
        })
        .unwrap_or(identity)
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    /// `status` is 1, "1" or true
    Success,
    /// any other explicit status
    Failure,
    /// no status field; pure telemetry replies to polling
    Implicit,
}

impl ReplyStatus {
    pub fn is_success(self) -> bool {
        !matches!(self, Self::Failure)
    }
}

/// A parsed reply from the device socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: u8,
    pub status: ReplyStatus,
    /// reply body without `id` and `status`
    pub payload: Telemetry,
}

impl Reply {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut payload = parse_object(text.as_bytes())?;

        let id = match payload.remove("id") {
            Some(raw) => parse_id(&raw)?,
            None => return Err(ProtocolError::MissingId),
        };

        let status = match payload.remove("status") {
            None | Some(Value::Null) => ReplyStatus::Implicit,
            Some(Value::Bool(true)) => ReplyStatus::Success,
            Some(raw) if numeric(&raw) == Some(1.0) => ReplyStatus::Success,
            Some(_) => ReplyStatus::Failure,
        };

        Ok(Self { id, status, payload })
    }
}

fn parse_object(bytes: &[u8]) -> Result<Telemetry, ProtocolError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProtocolError::NotObject),
        Err(e) => Err(ProtocolError::NotJson(e.to_string())),
    }
}

/// Numbers and numeric strings are both accepted; the firmware quotes ids.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn parse_id(raw: &Value) -> Result<u8, ProtocolError> {
    let invalid = || ProtocolError::InvalidId(raw.to_string());
    let n = numeric(raw).ok_or_else(invalid)?;
    if n.fract() != 0.0 || !(0.0..256.0).contains(&n) {
        return Err(invalid());
    }
    Ok(n as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_keeps_all_fields() {
        let hb = Heartbeat::parse(
            br#"{"mdns":"http://greenhouse1.local","firmv":"1.2.0","netMode":1}"#,
        )
        .unwrap();
        assert_eq!(hb.identity, "http://greenhouse1.local");
        assert_eq!(hb.firmware.as_deref(), Some("1.2.0"));
        assert_eq!(hb.fields.get("netMode"), Some(&Value::from(1)));
    }

    #[test]
    fn heartbeat_without_identity_is_rejected() {
        assert_eq!(
            Heartbeat::parse(br#"{"firmv":"1.0"}"#),
            Err(ProtocolError::MissingIdentity)
        );
        assert_eq!(
            Heartbeat::parse(br#"{"mdns":"  "}"#),
            Err(ProtocolError::MissingIdentity)
        );
        assert_eq!(Heartbeat::parse(b"[1,2]"), Err(ProtocolError::NotObject));
        assert!(matches!(
            Heartbeat::parse(b"{not json"),
            Err(ProtocolError::NotJson(_))
        ));
    }

    #[test]
    fn display_name_strips_mdns_decoration() {
        assert_eq!(display_name("http://greenhouse12.local"), "greenhouse12");
        assert_eq!(display_name("http://greenhouse.local"), "greenhouse");
        assert_eq!(display_name("greenhouse1"), "greenhouse1");
        assert_eq!(display_name("http://shed.local"), "http://shed.local");
    }

    #[test]
    fn reply_id_accepts_quoted_numbers() {
        let reply = Reply::parse(r#"{"id":"7","temp":21.5}"#).unwrap();
        assert_eq!(reply.id, 7);
        assert_eq!(reply.status, ReplyStatus::Implicit);
        assert_eq!(reply.payload.get("temp"), Some(&Value::from(21.5)));
        assert!(!reply.payload.contains_key("id"));
    }

    #[test]
    fn reply_status_mapping() {
        let ok = Reply::parse(r#"{"id":3,"status":1,"msg":"done"}"#).unwrap();
        assert_eq!(ok.status, ReplyStatus::Success);
        assert!(!ok.payload.contains_key("status"));

        let failed = Reply::parse(r#"{"id":3,"status":0}"#).unwrap();
        assert_eq!(failed.status, ReplyStatus::Failure);
        assert!(!failed.status.is_success());
    }

    #[test]
    fn boolean_and_text_status_count_as_success() {
        let ok = Reply::parse(r#"{"id":3,"status":true}"#).unwrap();
        assert_eq!(ok.status, ReplyStatus::Success);
        let textual = Reply::parse(r#"{"id":3,"status":"1"}"#).unwrap();
        assert_eq!(textual.status, ReplyStatus::Success);
        let failed = Reply::parse(r#"{"id":3,"status":false}"#).unwrap();
        assert_eq!(failed.status, ReplyStatus::Failure);
    }

    #[test]
    fn reply_id_must_be_in_range() {
        for bad in [r#"{"id":256}"#, r#"{"id":-1}"#, r#"{"id":"abc"}"#, r#"{"id":1.5}"#] {
            assert!(
                matches!(Reply::parse(bad), Err(ProtocolError::InvalidId(_))),
                "{bad} should be rejected"
            );
        }
        assert_eq!(Reply::parse(r#"{"temp":1}"#), Err(ProtocolError::MissingId));
        assert_eq!(Reply::parse(r#"{"id":255}"#).unwrap().id, 255);
    }
}
