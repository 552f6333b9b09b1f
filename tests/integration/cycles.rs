//! Cyclic source dependencies

use std::sync::Arc;

use hwmon_engine::{
    DiagnosticKind, HostCycle, TelemetryStore,
    connector::{Mapping, MonitorJob, MonitorJobs, Source, SourceKind},
    telemetry::monitor_id,
};

use crate::helpers::*;

fn copy(key: &str, from: &str) -> Source {
    Source::new(key, SourceKind::Copy { from: from.into() })
}

#[tokio::test]
async fn test_cycle_skips_job_and_keeps_presence() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    let mut store = TelemetryStore::new("srv-1");

    let healthy = HostCycle::new(
        Arc::new(snmp_host("srv-1")),
        &[Arc::new(enclosure_connector())],
        snmp.registry(),
    );
    healthy.run(&mut store).await;

    // same connector, now with a loop between its sources
    let mut looping = enclosure_connector();
    looping.monitors.insert(
        "enclosure".into(),
        MonitorJobs {
            discovery: Some(MonitorJob::new(
                vec![copy("a", "b"), copy("b", "a")],
                Mapping::new("a").attribute("id", "$1"),
            )),
            collect: None,
        },
    );
    let broken = HostCycle::new(Arc::new(snmp_host("srv-1")), &[Arc::new(looping)], snmp.registry());
    let report = broken.run(&mut store).await;

    let structural: Vec<_> = report
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::Structural)
        .collect();
    assert_eq!(structural.len(), 1, "{:?}", report.diagnostics);
    assert!(structural[0].message.contains("a -> b -> a"), "{}", structural[0].message);

    let id = monitor_id("DellEnclosure", "enclosure", &["enclosure-1"]);
    assert!(store.find_monitor("enclosure", &id).unwrap().is_present());
}

#[tokio::test]
async fn test_cycle_does_not_block_other_types() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));

    let mut connector = enclosure_connector();
    connector.monitors.insert(
        "disk".into(),
        MonitorJobs {
            discovery: Some(MonitorJob::new(
                vec![copy("x", "x")],
                Mapping::new("x").attribute("id", "$1"),
            )),
            collect: None,
        },
    );
    let cycle = HostCycle::new(Arc::new(snmp_host("srv-1")), &[Arc::new(connector)], snmp.registry());
    let mut store = TelemetryStore::new("srv-1");
    let report = cycle.run(&mut store).await;

    assert_eq!(store.monitors_of_type("enclosure").count(), 1);
    assert!(
        report
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Structural && d.context.contains("disk"))
    );
}
