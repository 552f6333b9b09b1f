//! One failing source, job or connector never takes the others down

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use hwmon_engine::{
    DiagnosticKind, HostCycle, TelemetryStore,
    connector::{Connector, Criterion, Mapping, MonitorJob, MonitorJobs, Source, SourceKind},
};

use crate::helpers::*;

const DISK_OID: &str = "1.3.6.1.4.1.674.10893.1.20.130.4";
const FAN_OID: &str = "1.3.6.1.4.1.674.10892.1.700.12";

fn with_type(connector: &mut Connector, monitor_type: &str, source: hwmon_engine::connector::Source) {
    let key = source.key.clone();
    connector.monitors.insert(
        monitor_type.into(),
        MonitorJobs {
            discovery: Some(MonitorJob::new(vec![source], Mapping::new(key).attribute("id", "$1"))),
            collect: None,
        },
    );
}

#[tokio::test]
async fn test_slow_and_failing_sources_are_isolated() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    snmp.set(DISK_OID, Answer::Slow(Duration::from_secs(3), "disk-1".into()));
    snmp.set(FAN_OID, Answer::Fail);

    let mut connector = enclosure_connector();
    with_type(&mut connector, "disk", snmp_get("disks", DISK_OID).with_timeout(1));
    with_type(&mut connector, "fan", snmp_get("fans", FAN_OID));

    let cycle = HostCycle::new(Arc::new(snmp_host("srv-1")), &[Arc::new(connector)], snmp.registry());
    let mut store = TelemetryStore::new("srv-1");

    let started = Instant::now();
    let report = cycle.run(&mut store).await;
    assert!(started.elapsed() < Duration::from_secs(3), "the slow source was not cut short");

    assert_eq!(store.monitors_of_type("enclosure").count(), 1);
    assert_eq!(store.monitors_of_type("disk").count(), 0);
    assert_eq!(store.monitors_of_type("fan").count(), 0);

    let execution: Vec<_> = report
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::Execution)
        .collect();
    assert_eq!(execution.len(), 2, "{:?}", report.diagnostics);
    assert!(execution.iter().any(|d| d.context.contains("source(disks)") && d.message.contains("timed out")));
    assert!(execution.iter().any(|d| d.context.contains("source(fans)")));
    assert!(report.timed_out_phases.is_empty());
}

#[tokio::test]
async fn test_failed_connector_leaves_others_alone() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));

    let mut broken = Connector::new("Unreachable");
    broken.detection.criteria.push(Criterion::SnmpGet {
        oid: "1.3.6.1.4.1.9999".into(),
        expected_result: None,
    });
    with_type(&mut broken, "enclosure", snmp_get("enclosures", ENCLOSURE_OID));

    let cycle = HostCycle::new(
        Arc::new(snmp_host("srv-1")),
        &[Arc::new(broken), Arc::new(enclosure_connector())],
        snmp.registry(),
    );
    let mut store = TelemetryStore::new("srv-1");
    let report = cycle.run(&mut store).await;

    assert_eq!(report.applicable_connectors, vec!["DellEnclosure".to_string()]);
    let owners: Vec<_> = store
        .monitors_of_type("enclosure")
        .map(|m| m.connector_id().map(str::to_string))
        .collect();
    assert_eq!(owners, vec![Some("DellEnclosure".to_string())]);
}

#[tokio::test]
async fn test_phase_timeout_is_reported() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Slow(Duration::from_secs(5), "enclosure-1;1;healthy".into()));

    let mut host = snmp_host("srv-1");
    host.strategy_timeout = 1;
    host.phase_timeout = 1;
    // the source itself may wait longer than the phase
    let mut connector = enclosure_connector();
    for jobs in connector.monitors.values_mut() {
        for source in jobs.discovery.iter_mut().flat_map(|job| job.sources.iter_mut()) {
            source.timeout = Some(10);
        }
    }
    let cycle = HostCycle::new(Arc::new(host), &[Arc::new(connector)], snmp.registry());
    let mut store = TelemetryStore::new("srv-1");
    let report = cycle.run(&mut store).await;

    assert_matches!(report.timed_out_phases.as_slice(), [hwmon_engine::strategy::Phase::Discovery]);
    // detection results written before the timeout stay
    assert_eq!(report.applicable_connectors, vec!["DellEnclosure".to_string()]);
}

#[tokio::test]
async fn test_dead_source_on_default_timeout_spares_its_siblings() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Slow(Duration::from_secs(3), "enclosure-1;1;healthy".into()));

    let mut host = snmp_host("srv-1");
    host.strategy_timeout = 1;
    host.phase_timeout = 1;
    let mut connector = enclosure_connector();
    with_type(
        &mut connector,
        "fan",
        Source::new("fans", SourceKind::Static { value: "fan-1".into() }),
    );

    let cycle = HostCycle::new(Arc::new(host), &[Arc::new(connector)], snmp.registry());
    let mut store = TelemetryStore::new("srv-1");
    let report = cycle.run(&mut store).await;

    assert!(report.timed_out_phases.is_empty(), "{:?}", report.timed_out_phases);
    assert_eq!(store.monitors_of_type("enclosure").count(), 0);
    assert_eq!(store.monitors_of_type("fan").count(), 1);
    assert!(
        report
            .diagnostics
            .iter()
            .any(|d| d.context.contains("source(enclosures)") && d.message.contains("timed out"))
    );
}

#[tokio::test]
async fn test_timed_out_discovery_keeps_finished_jobs() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    snmp.set(DISK_OID, Answer::Value("disk-1\ndisk-2".into()));
    snmp.set(FAN_OID, Answer::Slow(Duration::from_secs(5), "fan-1".into()));

    let mut host = snmp_host("srv-1");
    host.strategy_timeout = 1;
    host.phase_timeout = 1;
    let mut connector = enclosure_connector();
    with_type(&mut connector, "disk", snmp_get("disks", DISK_OID));
    with_type(&mut connector, "fan", snmp_get("fans", FAN_OID).with_timeout(10));

    let cycle = HostCycle::new(Arc::new(host), &[Arc::new(connector)], snmp.registry());
    let mut store = TelemetryStore::new("srv-1");
    let report = cycle.run(&mut store).await;

    assert_matches!(report.timed_out_phases.as_slice(), [hwmon_engine::strategy::Phase::Discovery]);
    assert_eq!(store.monitors_of_type("enclosure").count(), 1);
    assert_eq!(store.monitors_of_type("disk").count(), 2);
    assert_eq!(store.monitors_of_type("fan").count(), 0);
}

#[tokio::test]
async fn test_serialized_sources_never_overlap_across_discovery_jobs() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    snmp.set(DISK_OID, Answer::Slow(Duration::from_millis(200), "disk-1".into()));
    snmp.set(FAN_OID, Answer::Slow(Duration::from_millis(200), "fan-1".into()));

    let mut connector = enclosure_connector();
    with_type(&mut connector, "disk", snmp_get("disks", DISK_OID).serialized());
    with_type(&mut connector, "fan", snmp_get("fans", FAN_OID).serialized());

    let cycle = HostCycle::new(Arc::new(snmp_host("srv-1")), &[Arc::new(connector)], snmp.registry());
    let mut store = TelemetryStore::new("srv-1");
    cycle.run(&mut store).await;

    assert_eq!(store.monitors_of_type("disk").count(), 1);
    assert_eq!(store.monitors_of_type("fan").count(), 1);
    assert_eq!(snmp.max_running(), 1);
}
