//! Monitors appearing and disappearing across cycles

use std::sync::Arc;

use hwmon_engine::{
    HostCycle, TelemetryStore,
    strategy::host_up_metric_name,
    telemetry::{monitor_id, present_metric_name},
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn cycle(snmp: &MockSnmp) -> HostCycle {
    HostCycle::new(
        Arc::new(snmp_host("srv-1")),
        &[Arc::new(enclosure_connector())],
        snmp.registry(),
    )
}

#[tokio::test]
async fn test_enclosure_discovered_then_missing() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    let cycle = cycle(&snmp);
    let mut store = TelemetryStore::new("srv-1");

    let report = cycle.run(&mut store).await;
    assert_eq!(report.applicable_connectors, vec!["DellEnclosure".to_string()]);

    let id = monitor_id("DellEnclosure", "enclosure", &["enclosure-1"]);
    let presence = present_metric_name("enclosure");
    {
        let enclosure = store.find_monitor("enclosure", &id).expect("enclosure discovered");
        assert!(enclosure.is_present());
        assert_eq!(enclosure.attribute("index"), Some("1"));
        assert_eq!(enclosure.state_metric("hw.status"), Some("ok"));
        assert_eq!(enclosure.number_metric(&presence), Some(1.0));
        assert_eq!(enclosure.parent_id(), Some("srv-1"));
    }

    // the enclosure is gone from the agent's answer
    snmp.set(ENCLOSURE_OID, Answer::Value(String::new()));
    let report = cycle.run(&mut store).await;
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);

    let enclosure = store.find_monitor("enclosure", &id).expect("never removed");
    assert!(!enclosure.is_present());
    assert_eq!(enclosure.number_metric(&presence), Some(0.0));
    assert_eq!(enclosure.state_metric("hw.status"), Some("ok"));
}

#[tokio::test]
async fn test_enclosure_comes_back() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    let cycle = cycle(&snmp);
    let mut store = TelemetryStore::new("srv-1");
    cycle.run(&mut store).await;

    snmp.set(ENCLOSURE_OID, Answer::Value(String::new()));
    cycle.run(&mut store).await;

    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;critical".into()));
    cycle.run(&mut store).await;

    let id = monitor_id("DellEnclosure", "enclosure", &["enclosure-1"]);
    let enclosure = store.find_monitor("enclosure", &id).unwrap();
    assert!(enclosure.is_present());
    assert_eq!(enclosure.state_metric("hw.status"), Some("failed"));
    assert_eq!(store.monitors_of_type("enclosure").count(), 1);
}

#[tokio::test]
async fn test_worst_enclosure_status_reaches_host() {
    let snmp = dell_agent();
    snmp.set(
        ENCLOSURE_OID,
        Answer::Value("enclosure-1;1;healthy\nenclosure-2;2;warning".into()),
    );
    let cycle = cycle(&snmp);
    let mut store = TelemetryStore::new("srv-1");
    cycle.run(&mut store).await;

    let host = store.endpoint_host_monitor().unwrap();
    assert_eq!(host.state_metric("hw.status.children"), Some("degraded"));
}

#[tokio::test]
async fn test_connector_not_applicable() {
    let snmp = MockSnmp::default();
    snmp.set(SYSTEM_OID, Answer::Value("HP ProLiant".into()));
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    let cycle = cycle(&snmp);
    let mut store = TelemetryStore::new("srv-1");

    let report = cycle.run(&mut store).await;

    assert!(report.applicable_connectors.is_empty());
    assert_eq!(store.monitors_of_type("enclosure").count(), 0);
    let connector = store.find_monitor("connector", "connector_DellEnclosure").unwrap();
    assert_eq!(connector.state_metric("metricshub.connector.status"), Some("failed"));
    let status = connector.attribute("status_information").unwrap();
    assert!(status.starts_with("Received Result: HP ProLiant."), "{status}");
    assert!(status.ends_with("Conclusion: Test on srv-1 FAILED"), "{status}");
}

#[tokio::test]
async fn test_protocol_health_is_recorded_on_the_endpoint_host() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    let mut store = TelemetryStore::new("srv-1");
    let name = host_up_metric_name("mock-snmp");
    let host_up = |store: &TelemetryStore| {
        store
            .endpoint_host_monitor()
            .and_then(|host| host.number_metric(&name))
    };

    cycle(&snmp).run(&mut store).await;
    assert_eq!(host_up(&store), None);

    snmp.set_health(Some(true));
    cycle(&snmp).run(&mut store).await;
    assert_eq!(host_up(&store), Some(1.0));

    snmp.set_health(Some(false));
    cycle(&snmp).run(&mut store).await;
    assert_eq!(host_up(&store), Some(0.0));
    let metric = store.endpoint_host_monitor().and_then(|host| host.metric(&name)).unwrap();
    assert_eq!(metric.attributes().get("protocol").map(String::as_str), Some("mock-snmp"));
}
