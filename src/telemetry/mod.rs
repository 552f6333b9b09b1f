//! Monitor Telemetry Store
//!
//! Per-host arena of every [`Monitor`] the engine has ever discovered, indexed by
//! `(monitor type, monitor id)`. The store survives from one cycle to the next;
//! it is the only state the strategies carry across cycles.
//!
//! ## Lifecycle Rules
//!
//! - monitors are created by discovery and never removed by the engine
//! - a monitor not seen by a discovery pass is marked not present; its metrics
//!   stay as they were
//! - metrics are overwritten, never appended; an update older than the stored
//!   value is rejected so exported timestamps only move forward
//! - monitors never hold references to each other, parent links are ids looked
//!   up through the store
//!
//! Only the strategies of the owning host mutate the store. Exporters get
//! read-only iteration ([`TelemetryStore::for_each_monitor`]) or a snapshot.

mod monitor;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

pub use monitor::{
    CONNECTOR_ID_ATTRIBUTE, CONNECTOR_MONITOR_TYPE, HOST_MONITOR_TYPE, Metric, Monitor,
    metric_attributes, monitor_id, present_metric_name,
};

/// Attribute carrying the parent's `id` attribute value
pub const PARENT_ID_ATTRIBUTE: &str = "hw.parent.id";

/// Attribute carrying the parent's monitor type
pub const PARENT_TYPE_ATTRIBUTE: &str = "hw.parent.type";

/// All monitors of one host
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    hostname: String,

    /// type -> id -> monitor
    monitors: BTreeMap<String, BTreeMap<String, Monitor>>,

    /// Id of the monitor standing for the host itself
    endpoint_host_id: Option<String>,
}

impl TelemetryStore {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            monitors: BTreeMap::new(),
            endpoint_host_id: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Existing monitor, or a new one (not present) if there is none
    pub fn get_or_create(&mut self, monitor_type: &str, id: &str) -> &mut Monitor {
        self.monitors
            .entry(monitor_type.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(host = %self.hostname, "new {monitor_type} monitor {id}");
                Monitor::new(monitor_type, id)
            })
    }

    pub fn find_monitor(&self, monitor_type: &str, id: &str) -> Option<&Monitor> {
        self.monitors.get(monitor_type)?.get(id)
    }

    pub fn find_monitor_mut(&mut self, monitor_type: &str, id: &str) -> Option<&mut Monitor> {
        self.monitors.get_mut(monitor_type)?.get_mut(id)
    }

    /// Lookup by id alone, across every type
    pub fn find_monitor_by_id(&self, id: &str) -> Option<&Monitor> {
        self.monitors.values().find_map(|by_id| by_id.get(id))
    }

    /// Mark a monitor seen by the current discovery pass
    ///
    /// Sets the presence metric to 1 and stamps the discovery time. Returns false
    /// when the monitor does not exist.
    pub fn mark_present(&mut self, monitor_type: &str, id: &str, time: DateTime<Utc>) -> bool {
        let Some(monitor) = self.find_monitor_mut(monitor_type, id) else {
            return false;
        };
        monitor.present = true;
        monitor.discovery_time = Some(time);
        self.set_metric(
            monitor_type,
            id,
            &present_metric_name(monitor_type),
            Metric::number(1.0, time),
        );
        true
    }

    /// Mark monitors not seen by the current discovery pass
    ///
    /// Sets the presence metric to 0; other metrics and the monitors themselves
    /// are kept. Returns how many monitors changed from present to absent.
    pub fn mark_absent<'i>(
        &mut self,
        monitor_type: &str,
        ids: impl IntoIterator<Item = &'i str>,
        time: DateTime<Utc>,
    ) -> usize {
        let mut flipped = 0;
        for id in ids {
            let Some(monitor) = self.find_monitor_mut(monitor_type, id) else {
                continue;
            };
            if monitor.present {
                flipped += 1;
            }
            monitor.present = false;
            self.set_metric(
                monitor_type,
                id,
                &present_metric_name(monitor_type),
                Metric::number(0.0, time),
            );
        }
        if flipped > 0 {
            debug!(host = %self.hostname, "{flipped} {monitor_type} monitor(s) now missing");
        }
        flipped
    }

    /// Overwrite a metric
    ///
    /// Returns false when the monitor does not exist or when the stored value is
    /// more recent than the update.
    pub fn set_metric(&mut self, monitor_type: &str, id: &str, name: &str, metric: Metric) -> bool {
        let Some(monitor) = self.find_monitor_mut(monitor_type, id) else {
            return false;
        };
        if let Some(current) = monitor.metrics.get(name)
            && current.collect_time() > metric.collect_time()
        {
            trace!(
                "ignoring {name} on {id}: {} is older than {}",
                metric.collect_time(),
                current.collect_time()
            );
            return false;
        }
        monitor.metrics.insert(name.to_string(), metric);
        true
    }

    /// Monitors of one type, ordered by id
    pub fn monitors_of_type(&self, monitor_type: &str) -> impl Iterator<Item = &Monitor> {
        self.monitors
            .get(monitor_type)
            .into_iter()
            .flat_map(|by_id| by_id.values())
    }

    /// Read-only visit of every monitor of a type
    pub fn for_each_monitor(&self, monitor_type: &str, f: impl FnMut(&Monitor)) {
        self.monitors_of_type(monitor_type).for_each(f);
    }

    /// Every monitor, grouped by type
    pub fn all_monitors(&self) -> impl Iterator<Item = &Monitor> {
        self.monitors.values().flat_map(|by_id| by_id.values())
    }

    pub fn monitor_types(&self) -> impl Iterator<Item = &str> {
        self.monitors.keys().map(String::as_str)
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.monitor_count() == 0
    }

    /// Register the monitor standing for the host, creating it if needed
    pub fn set_endpoint_host(&mut self, id: &str) -> &mut Monitor {
        self.endpoint_host_id = Some(id.to_string());
        self.get_or_create(HOST_MONITOR_TYPE, id)
    }

    pub fn endpoint_host_monitor(&self) -> Option<&Monitor> {
        self.find_monitor(HOST_MONITOR_TYPE, self.endpoint_host_id.as_deref()?)
    }

    pub fn endpoint_host_id(&self) -> Option<&str> {
        self.endpoint_host_id.as_deref()
    }

    /// Parent of a monitor, through its parent id
    pub fn find_parent(&self, monitor: &Monitor) -> Option<&Monitor> {
        self.find_monitor_by_id(monitor.parent_id()?)
    }

    /// Monitors whose parent id is `id`
    pub fn children_of(&self, id: &str) -> Vec<&Monitor> {
        self.all_monitors()
            .filter(|m| m.parent_id() == Some(id))
            .collect()
    }

    /// Monitor of a connector whose attributes match every given key
    pub fn find_by_key_attributes(
        &self,
        monitor_type: &str,
        connector_id: &str,
        keys: &[(String, String)],
    ) -> Option<&Monitor> {
        self.monitors_of_type(monitor_type).find(|m| {
            m.connector_id() == Some(connector_id)
                && keys
                    .iter()
                    .all(|(name, value)| m.attribute(name) == Some(value.as_str()))
        })
    }

    /// Ids of a connector's monitors of one type
    pub fn ids_owned_by(&self, monitor_type: &str, connector_id: &str) -> Vec<String> {
        self.monitors_of_type(monitor_type)
            .filter(|m| m.connector_id() == Some(connector_id))
            .map(|m| m.id().to_string())
            .collect()
    }

    /// Owned copy of the monitors of a type (or of all monitors)
    pub fn snapshot(&self, monitor_type: Option<&str>) -> Vec<Monitor> {
        match monitor_type {
            Some(t) => self.monitors_of_type(t).cloned().collect(),
            None => self.all_monitors().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn store_with_disk() -> TelemetryStore {
        let mut store = TelemetryStore::new("host-1");
        let disk = store.get_or_create("disk", "c_disk_1");
        disk.set_attribute(CONNECTOR_ID_ATTRIBUTE, "c");
        disk.set_attribute("id", "1");
        store
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut store = store_with_disk();
        store.get_or_create("disk", "c_disk_1");
        assert_eq!(store.monitor_count(), 1);
        assert!(!store.find_monitor("disk", "c_disk_1").unwrap().is_present());
    }

    #[test]
    fn test_presence_keeps_metrics() {
        let mut store = store_with_disk();
        let t0 = Utc::now();
        assert!(store.mark_present("disk", "c_disk_1", t0));
        store.set_metric("disk", "c_disk_1", "hw.status", Metric::number(1.0, t0));

        let t1 = t0 + Duration::minutes(2);
        assert_eq!(store.mark_absent("disk", ["c_disk_1"], t1), 1);

        let disk = store.find_monitor("disk", "c_disk_1").unwrap();
        assert!(!disk.is_present());
        assert_eq!(disk.number_metric("hw.status"), Some(1.0));
        assert_eq!(disk.number_metric(&present_metric_name("disk")), Some(0.0));

        // already absent: nothing flips
        assert_eq!(store.mark_absent("disk", ["c_disk_1"], t1), 0);
    }

    #[test]
    fn test_set_metric_rejects_older_values() {
        let mut store = store_with_disk();
        let t1 = Utc::now();
        let t0 = t1 - Duration::seconds(30);
        assert!(store.set_metric("disk", "c_disk_1", "hw.temperature", Metric::number(40.0, t1)));
        assert!(!store.set_metric("disk", "c_disk_1", "hw.temperature", Metric::number(20.0, t0)));
        assert_eq!(
            store
                .find_monitor("disk", "c_disk_1")
                .unwrap()
                .number_metric("hw.temperature"),
            Some(40.0)
        );
        assert!(!store.set_metric("disk", "unknown", "x", Metric::number(1.0, t1)));
    }

    #[test]
    fn test_parent_and_children() {
        let mut store = store_with_disk();
        store.get_or_create("enclosure", "c_enclosure_0");
        store
            .find_monitor_mut("disk", "c_disk_1")
            .unwrap()
            .set_parent_id(Some("c_enclosure_0".into()));

        let disk = store.find_monitor("disk", "c_disk_1").unwrap();
        assert_eq!(store.find_parent(disk).unwrap().id(), "c_enclosure_0");
        assert_eq!(store.children_of("c_enclosure_0").len(), 1);
    }

    #[test]
    fn test_find_by_key_attributes() {
        let store = store_with_disk();
        let keys = vec![("id".to_string(), "1".to_string())];
        assert!(store.find_by_key_attributes("disk", "c", &keys).is_some());
        assert!(store.find_by_key_attributes("disk", "other", &keys).is_none());
        assert_eq!(store.ids_owned_by("disk", "c"), vec!["c_disk_1".to_string()]);
    }

    #[test]
    fn test_endpoint_host() {
        let mut store = TelemetryStore::new("srv");
        assert!(store.endpoint_host_monitor().is_none());
        store.set_endpoint_host("srv");
        assert_eq!(store.endpoint_host_monitor().unwrap().monitor_type(), "host");
        assert_eq!(store.snapshot(Some("host")).len(), 1);
    }
}
