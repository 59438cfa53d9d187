//! ==============================================================================
//! directory.rs - read-only fleet view for the dashboard
//! ==============================================================================
//!
//! purpose:
//!     projects the registry into plain serializable rows. connection
//!     handles, timers and locks never leave the session.
//!
//! ==============================================================================

use crate::domain::{DeviceDetail, DeviceSummary};
use crate::registry::Registry;

use std::collections::BTreeMap;

#[derive(Clone)]
pub struct FleetDirectory {
    registry: Registry,
    decimal_places: u32,
}

impl FleetDirectory {
    pub fn new(registry: Registry, decimal_places: u32) -> Self {
        Self {
            registry,
            decimal_places,
        }
    }

    /// `{name, liveness, address, socketURL}` for every known device,
    /// keyed by identity.
    pub fn active(&self) -> BTreeMap<String, DeviceSummary> {
        self.registry
            .devices()
            .into_iter()
            .map(|device| (device.identity().to_string(), device.summary()))
            .collect()
    }

    pub fn detail(&self, identity: &str) -> Option<DeviceDetail> {
        self.registry
            .get(identity)
            .map(|device| device.detail(self.decimal_places))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregator;
    use crate::correlator::Correlator;
    use crate::domain::Liveness;
    use crate::protocol::Heartbeat;
    use crate::session::{Device, SessionLinks, SessionSettings};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::time::Instant;

    fn add(registry: &Registry, identity: &str, last: u8) -> std::sync::Arc<Device> {
        let hb = Heartbeat::parse(format!(r#"{{"mdns":"{identity}"}}"#).as_bytes()).unwrap();
        registry
            .upsert(identity, || {
                Device::new(
                    &hb,
                    IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)),
                    SessionSettings::default(),
                    SessionLinks {
                        correlator: Correlator::new(Duration::from_secs(2)),
                        aggregator: Aggregator::new(registry),
                    },
                    Instant::now(),
                )
            })
            .0
    }

    #[test]
    fn active_lists_every_device_with_public_fields_only() {
        let registry = Registry::default();
        add(&registry, "http://greenhouse1.local", 21);
        let gh2 = add(&registry, "http://greenhouse2.local", 22);
        gh2.expire(Instant::now() + Duration::from_secs(9), Duration::from_secs(5));

        let directory = FleetDirectory::new(registry, 2);
        let rows = directory.active();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["http://greenhouse2.local"].liveness, Liveness::Down);

        let row = serde_json::to_value(&rows["http://greenhouse1.local"]).unwrap();
        assert_eq!(
            row,
            json!({
                "name": "greenhouse1",
                "liveness": "UP",
                "address": "192.168.1.21",
                "socketURL": "ws://192.168.1.21/ws",
            })
        );
    }

    #[test]
    fn detail_rounds_averages_for_display() {
        let registry = Registry::default();
        let gh1 = add(&registry, "http://greenhouse1.local", 21);
        let engine = Aggregator::new(&registry);
        let photo = |v: f64| json!({"photo": v, "photoRdOK": 1}).as_object().cloned().unwrap();
        for v in [1.0, 1.0, 2.0] {
            assert!(engine.fold_reading("http://greenhouse1.local", &photo(v)));
        }
        gh1.snapshot_stats(9);
        assert!(engine.fold_reading("http://greenhouse1.local", &photo(5.0)));

        let directory = FleetDirectory::new(registry, 2);
        let detail = directory.detail("http://greenhouse1.local").unwrap();
        assert_eq!(detail.averages.photo.mean, 5.0);
        assert_eq!(detail.trends.keys().copied().collect::<Vec<_>>(), vec![9]);
        assert!((detail.trends[&9].photo.mean - 4.0 / 3.0).abs() < 1e-12);

        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(value["name"], json!("greenhouse1"));
        assert_eq!(value["phase"], json!("DISCOVERED"));
        assert!(directory.detail("http://greenhouse9.local").is_none());
    }
}
