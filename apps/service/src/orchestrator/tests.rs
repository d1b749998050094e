/// Integration tests for the monitor registry
///
/// These tests verify end-to-end behaviour of:
/// - Loop lifecycle (start, stop, restart, idempotence)
/// - Watchdog recovery of crashed, stuck and retired loops
/// - Durability of buffered results across `stop()`
use crate::config::Config;
use crate::database::memory::MemoryDatabase;
use crate::database::{Database, DatabaseImpl};
use crate::monitoring::executor::testing::{ScriptedProvider, Step};
use crate::monitoring::types::DeviceStatus;
use crate::orchestrator::MonitorRegistry;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;

fn registry(db: &Arc<MemoryDatabase>, provider: &Arc<ScriptedProvider>) -> MonitorRegistry {
    MonitorRegistry::new(db.clone(), provider.clone(), &Config::default())
}

#[tokio::test(start_paused = true)]
async fn test_start_device_is_idempotent() {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    let id = db.add_device("router", "10.0.0.1", 1.0);
    let registry = registry(&db, &provider);

    assert!(registry.start_device(id).await);
    assert!(!registry.start_device(id).await);
    assert!(registry.is_monitoring(id).await);

    // One loop ticks at t=0, 1 and 2; a second loop would double that
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(provider.icmp_calls(), 3);

    registry.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_device_discards_runtime_state() {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    let id = db.add_device("router", "10.0.0.1", 1.0);
    let registry = registry(&db, &provider);

    registry.start_device(id).await;
    sleep(Duration::from_millis(1500)).await;
    assert!(registry.loop_snapshot(id).await.is_some());

    assert!(registry.stop_device(id).await);
    assert!(!registry.is_monitoring(id).await);
    assert!(registry.loop_snapshot(id).await.is_none());
    assert!(!registry.stop_device(id).await);

    let calls = provider.icmp_calls();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(provider.icmp_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_restart_device_resets_hysteresis() {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    let id = db.add_device("router", "10.0.0.1", 1.0);
    let registry = registry(&db, &provider);

    registry.start_device(id).await;
    sleep(Duration::from_millis(4500)).await;
    assert_eq!(registry.loop_snapshot(id).await.unwrap().streak.successes, 5);

    registry.restart_device(id).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.loop_snapshot(id).await.unwrap().streak.successes, 1);
    assert!(registry.is_monitoring(id).await);

    registry.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_launches_enabled_devices_only() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    let enabled = db.add_device("router", "10.0.0.1", 1.0);
    let disabled = db.add_device("spare", "10.0.0.9", 1.0);
    db.update_device(disabled, |d| d.monitoring_enabled = false);
    let registry = registry(&db, &provider);

    registry.start().await?;
    // A second start must not spawn anything twice
    registry.start().await?;

    assert!(registry.is_monitoring(enabled).await);
    assert!(!registry.is_monitoring(disabled).await);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(db.status(enabled), DeviceStatus::Online);
    assert_eq!(provider.icmp_calls(), 1);

    registry.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_replaces_crashed_loop() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    provider.push(Step::Panic, 1);
    let id = db.add_device("router", "10.0.0.1", 1.0);
    let registry = registry(&db, &provider);

    registry.start().await?;
    sleep(Duration::from_millis(100)).await;
    assert!(!registry.is_monitoring(id).await);

    // The first watchdog cycle runs 30s after start
    sleep(Duration::from_secs(31)).await;
    assert!(registry.is_monitoring(id).await);
    assert_eq!(db.status(id), DeviceStatus::Online);

    registry.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_reports_each_kind_of_repair() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    let missing = db.add_device("missing", "10.0.0.1", 60.0);
    let disabled = db.add_device("disabled", "10.0.0.2", 60.0);
    let deleted = db.add_device("deleted", "10.0.0.3", 60.0);
    let registry = registry(&db, &provider);

    registry.start_device(disabled).await;
    registry.start_device(deleted).await;
    sleep(Duration::from_millis(100)).await;

    // Changed directly in storage, behind the registry's back
    db.update_device(disabled, |d| d.monitoring_enabled = false);
    db.remove_device(deleted);

    let report = registry.reconcile().await?;
    assert_eq!(report.started, vec![missing]);
    let mut retired = report.retired.clone();
    retired.sort_unstable();
    assert_eq!(retired, vec![disabled, deleted]);
    assert!(report.restarted.is_empty());
    assert!(report.replaced.is_empty());

    assert!(registry.is_monitoring(missing).await);
    assert!(!registry.is_monitoring(disabled).await);
    assert!(!registry.is_monitoring(deleted).await);

    // Nothing left to repair
    assert!(registry.reconcile().await?.is_empty());

    registry.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_restarts_loop_that_exited() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    let id = db.add_device("router", "10.0.0.1", 1.0);
    let registry = registry(&db, &provider);

    // Disabled for a moment: the loop ends itself on its next tick
    db.update_device(id, |d| d.monitoring_enabled = false);
    registry.start_device(id).await;
    sleep(Duration::from_millis(100)).await;
    assert!(!registry.is_monitoring(id).await);

    db.update_device(id, |d| d.monitoring_enabled = true);
    let report = registry.reconcile().await?;
    assert_eq!(report.restarted, vec![id]);
    assert!(registry.is_monitoring(id).await);

    registry.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_stuck_loop_is_replaced() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    provider.push(Step::Reply, 2);
    provider.push(Step::Hang, 1);
    let id = db.add_device("router", "10.0.0.1", 1.0);
    let registry = registry(&db, &provider);

    registry.start_device(id).await;

    // Hangs in its third probe at t=2; last activity was t=2
    sleep(Duration::from_secs(20)).await;
    assert_eq!(provider.icmp_calls(), 3);
    assert!(registry.reconcile().await?.is_empty());
    assert!(registry.is_monitoring(id).await);

    sleep(Duration::from_secs(15)).await;
    let report = registry.reconcile().await?;
    assert_eq!(report.replaced, vec![id]);

    sleep(Duration::from_millis(1500)).await;
    assert!(provider.icmp_calls() > 3);
    assert_eq!(registry.loop_snapshot(id).await.unwrap().streak.successes, 2);

    registry.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_backing_off_loop_is_not_stuck() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    let id = db.add_device("router", "10.0.0.1", 1.0);
    db.fail_reads(true);
    let registry = registry(&db, &provider);

    registry.start_device(id).await;

    // The 12th error at t=330 leaves the loop sleeping 60s; 45s into that
    // sleep it is past the plain staleness limit but still within its backoff
    sleep(Duration::from_secs(375)).await;
    let snapshot = registry.loop_snapshot(id).await.unwrap();
    assert_eq!(snapshot.error_count, 12);
    assert_eq!(snapshot.backoff, Duration::from_secs(60));

    db.fail_reads(false);
    assert!(registry.reconcile().await?.is_empty());

    registry.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_hung_tick_after_backoff_is_timed_from_tick_start() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    provider.push(Step::Hang, 1);
    let id = db.add_device("router", "10.0.0.1", 1.0);
    db.fail_reads(true);
    let registry = registry(&db, &provider);

    registry.start_device(id).await;
    sleep(Duration::from_secs(1)).await;
    db.fail_reads(false);

    // The retry at t=5 hangs in its first probe
    sleep(Duration::from_secs(9)).await;
    assert_eq!(provider.icmp_calls(), 1);
    let snapshot = registry.loop_snapshot(id).await.unwrap();
    assert_eq!(snapshot.error_count, 1);
    assert_eq!(snapshot.backoff, Duration::ZERO);

    sleep(Duration::from_secs(24)).await;
    assert!(registry.reconcile().await?.is_empty());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(registry.reconcile().await?.replaced, vec![id]);

    registry.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_flush_interval_is_capped() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    db.add_device("router", "10.0.0.1", 60.0);
    let mut config = Config::default();
    config.monitoring.batch_write_interval = f64::INFINITY;
    let registry = MonitorRegistry::new(db.clone(), provider.clone(), &config);

    registry.start().await?;
    sleep(Duration::from_secs(1800)).await;
    assert!(registry.pending_results() > 0);
    assert!(db.stored_results().is_empty());

    // The flush period tops out at one hour
    sleep(Duration::from_secs(1801)).await;
    assert!(!db.stored_results().is_empty());

    registry.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_stop_flushes_everything_buffered() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Lost));
    let first = db.add_device("router", "10.0.0.1", 1.0);
    let second = db.add_device("switch", "10.0.0.2", 0.25);
    let registry = registry(&db, &provider);

    registry.start().await?;
    sleep(Duration::from_millis(2600)).await;
    registry.stop().await?;

    assert!(!registry.is_monitoring(first).await);
    assert!(!registry.is_monitoring(second).await);
    assert_eq!(registry.pending_results(), 0);
    assert_eq!(db.stored_results().len(), provider.icmp_calls());

    // Nothing runs after stop
    let calls = provider.icmp_calls();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(provider.icmp_calls(), calls);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_reports_final_flush_failure() -> Result<()> {
    let db = Arc::new(MemoryDatabase::new());
    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    db.add_device("router", "10.0.0.1", 1.0);
    let registry = registry(&db, &provider);

    registry.start().await?;
    sleep(Duration::from_millis(200)).await;
    db.fail_writes(true);

    assert!(registry.stop().await.is_err());
    assert!(registry.pending_results() > 0);
    Ok(())
}

#[tokio::test]
async fn test_registry_against_libsql() -> Result<()> {
    let dir = tempdir()?;
    let pool = crate::pool::open(&dir.path().join("badping.db"), 4).await?;
    {
        let conn = pool.get().await?;
        crate::database::initialize_database(&conn).await?;
    }
    let database = Arc::new(DatabaseImpl::new_from_pool(pool));
    let device_id = database
        .insert_device(&crate::database::models::NewDevice::new("router", "10.0.0.1", &Config::default().defaults))
        .await?;

    let provider = Arc::new(ScriptedProvider::new(Step::Reply));
    let registry = MonitorRegistry::new(database.clone(), provider.clone(), &Config::default());
    registry.start().await?;

    // Real time: the first tick runs immediately
    for _ in 0..100 {
        if provider.icmp_calls() > 0 && database.get_device(device_id).await?.is_some_and(|d| d.status == DeviceStatus::Online) {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    registry.stop().await?;

    let device = database.get_device(device_id).await?.expect("device exists");
    assert_eq!(device.status, DeviceStatus::Online);
    assert!(device.last_seen_at.is_some());
    let window = database.loss_since(device_id, chrono::Utc::now() - chrono::Duration::minutes(5)).await?;
    assert_eq!(window.total as usize, provider.icmp_calls());
    assert_eq!(window.lost, 0);
    Ok(())
}
