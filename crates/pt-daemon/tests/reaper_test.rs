use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use pt_bridge::registry::{ConnectionHandle, ConnectionRegistry};
use pt_core::naming::{build_session_name, SessionName};
use pt_daemon::daemon::run_reaper;
use pt_daemon::reaper::StaleSessionReaper;
use pt_daemon::shutdown::ShutdownSignal;
use pt_session::testing::FakeTmux;
use pt_session::tmux::TmuxController;

const NOW: i64 = 1_700_100_000;
const TTL: u64 = 3_600;

fn name(id: &str) -> SessionName {
    build_session_name("reaper-credential", Some(id)).unwrap()
}

fn reaper(fake: &FakeTmux, registry: &Arc<ConnectionRegistry>) -> StaleSessionReaper {
    StaleSessionReaper::new(
        TmuxController::new(Arc::new(fake.clone())),
        registry.clone(),
        Duration::from_secs(TTL),
    )
}

fn hold(registry: &ConnectionRegistry, name: &SessionName) {
    let (evict_tx, _evict_rx) = flume::bounded(1);
    registry.claim(name.clone(), ConnectionHandle::new(uuid::Uuid::new_v4(), evict_tx));
}

#[tokio::test]
async fn kills_only_idle_unheld_sessions() {
    let fake = FakeTmux::new();
    let registry = Arc::new(ConnectionRegistry::new());

    let stale = name("stale");
    let fresh = name("fresh");
    let held = name("held");
    let client = name("client");
    for n in [&stale, &fresh, &held, &client] {
        fake.insert_session(n.as_str(), NOW - 10 * TTL as i64, 0);
    }
    fake.set_activity(fresh.as_str(), NOW - 60);
    fake.set_attached(client.as_str(), 1);
    hold(&registry, &held);

    let report = reaper(&fake, &registry)
        .sweep_at(DateTime::from_timestamp(NOW, 0).unwrap())
        .await;

    assert_eq!(report.examined, 4);
    assert_eq!(report.reaped, vec![stale.to_string()]);
    assert_eq!(report.skipped_attached, 2);
    assert_eq!(report.failed, 0);

    assert!(!fake.has(stale.as_str()));
    assert!(fake.has(fresh.as_str()));
    assert!(fake.has(held.as_str()));
    assert!(fake.has(client.as_str()));
}

#[tokio::test]
async fn foreign_sessions_are_never_touched() {
    let fake = FakeTmux::new();
    let registry = Arc::new(ConnectionRegistry::new());
    fake.insert_session("scratch", 0, 0);
    fake.insert_session("0123456789abcdef-bad.name", 0, 0);
    fake.insert_session("not-hex-prefix00-x", 0, 0);

    let report = reaper(&fake, &registry)
        .sweep_at(DateTime::from_timestamp(NOW, 0).unwrap())
        .await;

    assert_eq!(report.examined, 0);
    assert!(report.reaped.is_empty());
    assert!(fake.calls_for("kill-session").is_empty());
    assert_eq!(fake.session_names().len(), 3);
}

#[tokio::test]
async fn no_server_means_nothing_to_do() {
    let fake = FakeTmux::new();
    let registry = Arc::new(ConnectionRegistry::new());

    let report = reaper(&fake, &registry).sweep().await;
    assert_eq!(report.examined, 0);
    assert!(report.reaped.is_empty());
}

#[tokio::test]
async fn kill_targets_use_exact_match() {
    let fake = FakeTmux::new();
    let registry = Arc::new(ConnectionRegistry::new());
    let stale = name("old");
    fake.insert_session(stale.as_str(), 0, 0);

    reaper(&fake, &registry)
        .sweep_at(DateTime::from_timestamp(NOW, 0).unwrap())
        .await;

    let kill = &fake.calls_for("kill-session")[0];
    assert_eq!(kill[2], format!("={stale}"));
}

#[tokio::test]
async fn reaper_loop_stops_on_shutdown() {
    let fake = FakeTmux::new();
    let registry = Arc::new(ConnectionRegistry::new());
    let stale = name("loop");
    fake.insert_session(stale.as_str(), 0, 0);

    let shutdown = ShutdownSignal::new();
    let handle = tokio::spawn(run_reaper(
        reaper(&fake, &registry),
        Duration::from_millis(50),
        shutdown.clone(),
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while fake.has(stale.as_str()) {
        assert!(tokio::time::Instant::now() < deadline, "loop never swept");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop stopped")
        .unwrap();
}
