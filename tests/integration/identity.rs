//! Stability of monitor identifiers

use std::sync::Arc;

use hwmon_engine::{HostCycle, TelemetryStore, telemetry::monitor_id};

use crate::helpers::*;

#[tokio::test]
async fn test_rediscovery_never_duplicates() {
    let snmp = dell_agent();
    snmp.set(
        ENCLOSURE_OID,
        Answer::Value("enclosure-1;1;healthy\nenclosure-2;2;healthy".into()),
    );
    let cycle = HostCycle::new(
        Arc::new(snmp_host("srv-1")),
        &[Arc::new(enclosure_connector())],
        snmp.registry(),
    );
    let mut store = TelemetryStore::new("srv-1");

    cycle.run(&mut store).await;
    let ids: Vec<String> = store.monitors_of_type("enclosure").map(|m| m.id().to_string()).collect();
    let count = store.monitor_count();

    for _ in 0..3 {
        cycle.run(&mut store).await;
    }

    let again: Vec<String> = store.monitors_of_type("enclosure").map(|m| m.id().to_string()).collect();
    assert_eq!(ids, again);
    assert_eq!(store.monitor_count(), count);
}

#[tokio::test]
async fn test_whitespace_in_keys_is_dropped() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("Main Enclosure ;1;healthy".into()));
    let cycle = HostCycle::new(
        Arc::new(snmp_host("srv-1")),
        &[Arc::new(enclosure_connector())],
        snmp.registry(),
    );
    let mut store = TelemetryStore::new("srv-1");
    cycle.run(&mut store).await;

    let id = monitor_id("DellEnclosure", "enclosure", &["Main Enclosure "]);
    assert_eq!(id, "DellEnclosure_enclosure_MainEnclosure");
    assert!(store.find_monitor("enclosure", &id).is_some());
}

#[tokio::test]
async fn test_blank_key_row_is_skipped() {
    let snmp = dell_agent();
    snmp.set(
        ENCLOSURE_OID,
        Answer::Value(" ;1;healthy\nenclosure-2;2;healthy".into()),
    );
    let cycle = HostCycle::new(
        Arc::new(snmp_host("srv-1")),
        &[Arc::new(enclosure_connector())],
        snmp.registry(),
    );
    let mut store = TelemetryStore::new("srv-1");
    let report = cycle.run(&mut store).await;

    assert_eq!(store.monitors_of_type("enclosure").count(), 1);
    assert_eq!(report.diagnostics.len(), 1);
}
