//! Host actor driven through its handle

use std::sync::Arc;
use std::time::Duration;

use hwmon_engine::{actors::HostHandle, telemetry::present_metric_name};
use tokio::sync::broadcast;

use crate::helpers::*;

fn spawn(snmp: &MockSnmp) -> (HostHandle, broadcast::Receiver<hwmon_engine::actors::CycleEvent>) {
    let (event_tx, event_rx) = broadcast::channel(16);
    let mut host = snmp_host("srv-1");
    host.collect_interval = 3600;
    let handle = HostHandle::spawn(host, &[Arc::new(enclosure_connector())], snmp.registry(), event_tx);
    (handle, event_rx)
}

#[tokio::test]
async fn test_snapshot_after_cycle() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    let (handle, _events) = spawn(&snmp);

    let report = handle.run_cycle().await.unwrap();
    assert_eq!(report.applicable_connectors, vec!["DellEnclosure".to_string()]);

    let enclosures = handle.monitors(Some("enclosure")).await.unwrap();
    assert_eq!(enclosures.len(), 1);
    assert_eq!(
        enclosures[0].number_metric(&present_metric_name("enclosure")),
        Some(1.0)
    );

    let all = handle.monitors(None).await.unwrap();
    assert_eq!(all.len(), handle.monitor_count().await.unwrap());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_handles_share_one_store() {
    let snmp = dell_agent();
    snmp.set(ENCLOSURE_OID, Answer::Value("enclosure-1;1;healthy".into()));
    let (handle, _events) = spawn(&snmp);

    let mut tasks = vec![];
    for _ in 0..4 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move { handle.run_cycle().await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(handle.monitors(Some("enclosure")).await.unwrap().len(), 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_a_busy_cycle_after_in_flight_sources() {
    let snmp = dell_agent();
    snmp.set(
        ENCLOSURE_OID,
        Answer::Slow(Duration::from_secs(1), "enclosure-1;1;healthy".into()),
    );
    let (handle, mut events) = spawn(&snmp);

    // the first tick starts a cycle right away
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel_cycle();

    let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("cancelled cycle finishes once its sources are back")
        .unwrap();
    assert!(event.report.cancelled);
    assert!(event.report.timed_out_phases.is_empty());
    // the enclosure query was already running and its table was used
    assert_eq!(handle.monitors(Some("enclosure")).await.unwrap().len(), 1);

    handle.shutdown().await.unwrap();
}
