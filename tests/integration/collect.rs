//! Collect refreshes the metrics of present monitors only

use std::sync::Arc;
use std::time::Duration;

use hwmon_engine::{
    HostCycle, TelemetryStore,
    connector::{Connector, Mapping, MonitorJob, MonitorJobs},
    telemetry::monitor_id,
};

use crate::helpers::*;

const FAN_OID: &str = "1.3.6.1.4.1.674.10892.1.700.12";
const FAN_SPEED_OID: &str = "1.3.6.1.4.1.674.10892.1.700.12.1.6";
const ENCLOSURE_POWER_OID: &str = "1.3.6.1.4.1.674.10892.1.600.30.1.6";

/// Enclosures plus fans, fans collected as a multi-instance job
fn fan_connector() -> Connector {
    let mut connector = enclosure_connector();
    connector.monitors.insert(
        "fan".into(),
        MonitorJobs {
            discovery: Some(MonitorJob::new(
                vec![snmp_get("fans", FAN_OID)],
                Mapping::new("fans").attribute("id", "$1"),
            )),
            collect: Some(MonitorJob::new(
                vec![snmp_get("speeds", FAN_SPEED_OID)],
                Mapping::new("speeds")
                    .attribute("id", "$1")
                    .metric("hw.fan.speed", "$2"),
            )),
        },
    );
    connector
}

/// Enclosures whose power is read one enclosure at a time
fn enclosure_power_connector(serialized: bool) -> Connector {
    let mut connector = enclosure_connector();
    let mut source = snmp_get("power", &format!("{ENCLOSURE_POWER_OID}.${{attribute::index}}"));
    source.force_serialization = serialized;
    if let Some(jobs) = connector.monitors.get_mut("enclosure") {
        jobs.collect = Some(
            MonitorJob::new(vec![source], Mapping::new("power").metric("hw.enclosure.power", "$1"))
                .mono_instance(),
        );
    }
    connector
}

fn cycle(snmp: &MockSnmp, connector: Connector) -> HostCycle {
    HostCycle::new(Arc::new(snmp_host("srv-1")), &[Arc::new(connector)], snmp.registry())
}

fn fan_speed(store: &TelemetryStore, fan: &str) -> Option<f64> {
    let id = monitor_id("DellEnclosure", "fan", &[fan]);
    store.find_monitor("fan", &id)?.number_metric("hw.fan.speed")
}

#[tokio::test]
async fn test_multi_instance_rows_reach_their_monitor() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    snmp.set(FAN_OID, Answer::Value("fan-1\nfan-2".into()));
    snmp.set(FAN_SPEED_OID, Answer::Value("fan-2;4200\nfan-1;3000".into()));

    let mut store = TelemetryStore::new("srv-1");
    let report = cycle(&snmp, fan_connector()).run(&mut store).await;

    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);
    assert_eq!(fan_speed(&store, "fan-1"), Some(3000.0));
    assert_eq!(fan_speed(&store, "fan-2"), Some(4200.0));
}

#[tokio::test]
async fn test_unmatched_row_creates_no_monitor() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    snmp.set(FAN_OID, Answer::Value("fan-1".into()));
    snmp.set(FAN_SPEED_OID, Answer::Value("fan-1;3000\nfan-9;100".into()));

    let mut store = TelemetryStore::new("srv-1");
    cycle(&snmp, fan_connector()).run(&mut store).await;

    assert_eq!(store.monitors_of_type("fan").count(), 1);
    assert_eq!(fan_speed(&store, "fan-1"), Some(3000.0));
    assert_eq!(fan_speed(&store, "fan-9"), None);
}

#[tokio::test]
async fn test_absent_monitor_keeps_its_last_metrics() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    snmp.set(FAN_OID, Answer::Value("fan-1\nfan-2".into()));
    snmp.set(FAN_SPEED_OID, Answer::Value("fan-1;3000\nfan-2;4200".into()));

    let cycle = cycle(&snmp, fan_connector());
    let mut store = TelemetryStore::new("srv-1");
    let first = cycle.run(&mut store).await;

    // fan-2 is gone from discovery but the speed table still lists it
    snmp.set(FAN_OID, Answer::Value("fan-1".into()));
    snmp.set(FAN_SPEED_OID, Answer::Value("fan-1;3100\nfan-2;9999".into()));
    let second = cycle.run(&mut store).await;

    assert_eq!(fan_speed(&store, "fan-1"), Some(3100.0));
    assert_eq!(fan_speed(&store, "fan-2"), Some(4200.0));

    let time_of = |fan: &str| {
        let id = monitor_id("DellEnclosure", "fan", &[fan]);
        store
            .find_monitor("fan", &id)
            .and_then(|m| m.metric("hw.fan.speed"))
            .map(|m| m.collect_time())
    };
    assert_eq!(time_of("fan-1"), Some(second.strategy_time));
    assert_eq!(time_of("fan-2"), Some(first.strategy_time));
}

#[tokio::test]
async fn test_metrics_are_overwritten_each_cycle() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    snmp.set(FAN_OID, Answer::Value("fan-1".into()));

    let cycle = cycle(&snmp, fan_connector());
    let mut store = TelemetryStore::new("srv-1");
    let mut reports = Vec::new();
    for speed in ["3000", "3300"] {
        snmp.set(FAN_SPEED_OID, Answer::Value(format!("fan-1;{speed}")));
        reports.push(cycle.run(&mut store).await);
    }

    let id = monitor_id("DellEnclosure", "fan", &["fan-1"]);
    let fan = store.find_monitor("fan", &id).unwrap();
    assert_eq!(fan.number_metric("hw.fan.speed"), Some(3300.0));
    assert_eq!(
        fan.metric("hw.fan.speed").map(|m| m.collect_time()),
        Some(reports[1].strategy_time)
    );
    assert_eq!(fan.metrics().keys().filter(|k| k.starts_with("hw.fan.speed")).count(), 1);
}

#[tokio::test]
async fn test_mono_instance_substitutes_monitor_attributes() {
    let snmp = dell_agent();
    snmp.set(
        ENCLOSURE_OID,
        Answer::Value("enclosure-1;1;healthy\nenclosure-2;2;healthy".into()),
    );
    snmp.set(&format!("{ENCLOSURE_POWER_OID}.1"), Answer::Value("450".into()));
    snmp.set(&format!("{ENCLOSURE_POWER_OID}.2"), Answer::Value("380\n999".into()));

    let mut store = TelemetryStore::new("srv-1");
    let report = cycle(&snmp, enclosure_power_connector(false)).run(&mut store).await;
    assert!(report.diagnostics.is_empty(), "{:?}", report.diagnostics);

    let power = |enclosure: &str| {
        let id = monitor_id("DellEnclosure", "enclosure", &[enclosure]);
        store.find_monitor("enclosure", &id)?.number_metric("hw.enclosure.power")
    };
    assert_eq!(power("enclosure-1"), Some(450.0));
    // only the first row counts
    assert_eq!(power("enclosure-2"), Some(380.0));
}

#[tokio::test]
async fn test_mono_instance_serialized_source_runs_one_monitor_at_a_time() {
    let snmp = dell_agent();
    snmp.set(
        ENCLOSURE_OID,
        Answer::Value("enclosure-1;1;healthy\nenclosure-2;2;healthy\nenclosure-3;3;healthy".into()),
    );
    for index in 1..=3 {
        snmp.set(
            &format!("{ENCLOSURE_POWER_OID}.{index}"),
            Answer::Slow(Duration::from_millis(100), format!("{index}00")),
        );
    }

    let mut store = TelemetryStore::new("srv-1");
    cycle(&snmp, enclosure_power_connector(true)).run(&mut store).await;

    let collected = store
        .monitors_of_type("enclosure")
        .filter(|m| m.number_metric("hw.enclosure.power").is_some())
        .count();
    assert_eq!(collected, 3);
    assert_eq!(snmp.max_running(), 1);
}
