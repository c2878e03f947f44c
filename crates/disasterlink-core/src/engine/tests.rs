use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;
use crate::backoff::BackoffPolicy;
use crate::models::{AlertStatus, MessageStatus, SyncState};
use crate::sync::InMemoryAuthority;

async fn open_engine(remote: &Arc<InMemoryAuthority>) -> SyncEngine<InMemoryAuthority> {
    SyncEngine::open(EngineConfig::default(), Arc::clone(remote))
        .await
        .unwrap()
}

fn street() -> Location {
    Location::new(29.95, -90.07).with_address("12 Harbour St")
}

/// Poll in 100 ms steps of (paused) time until `check` holds
async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..600 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

fn is_synced(engine: &SyncEngine<InMemoryAuthority>, id: &AlertId) -> bool {
    engine
        .get_alert(id)
        .is_some_and(|alert| alert.sync_state == SyncState::Synced)
}

#[tokio::test(start_paused = true)]
async fn trapped_on_third_floor_reaches_remote_after_reconnect() {
    let remote = Arc::new(InMemoryAuthority::new());
    remote.set_reachable(false);
    let engine = open_engine(&remote).await;
    let monitor = engine.spawn_monitor(false);
    engine.start(&monitor).unwrap();

    let alert = engine
        .create_alert("Trapped on 3rd floor", street(), Priority::Critical)
        .await
        .unwrap();
    assert_eq!(alert.sync_state, SyncState::Pending);
    assert_eq!(alert.status, AlertStatus::Active);
    assert_eq!(engine.list_alerts()[0].id, alert.id);

    let message = engine
        .queue_message("+1 555 0100", "Water is rising, we are on the 3rd floor")
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Queued);
    assert_eq!(engine.status(), EngineStatus::Offline);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(remote.push_count(), 0);
    assert_eq!(engine.pending_count().await.unwrap(), 2);

    remote.set_reachable(true);
    monitor.report(true);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    // Still inside the stability window
    assert_eq!(remote.alert_count(), 0);

    eventually("alert to sync", || is_synced(&engine, &alert.id)).await;
    eventually("message to be sent", || {
        engine
            .get_message(&message.id)
            .is_some_and(|message| message.status == MessageStatus::Sent)
    })
    .await;

    assert_eq!(engine.pending_count().await.unwrap(), 0);
    assert!(engine
        .list_messages()
        .iter()
        .all(|message| message.sync_state == SyncState::Synced));
    let stored = remote.get_alert(&alert.id).unwrap();
    assert_eq!(stored.record.priority, Priority::Critical);
    assert_eq!(stored.record.location.address.as_deref(), Some("12 Harbour St"));
    assert_eq!(engine.status(), EngineStatus::Idle);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_acknowledgement_is_retried_without_duplicates() {
    let remote = Arc::new(InMemoryAuthority::new());
    let engine = open_engine(&remote).await;
    let monitor = engine.spawn_monitor(true);
    engine.start(&monitor).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    remote.drop_next_ack();
    let alert = engine
        .create_alert("Gas leak on Elm St", street(), Priority::High)
        .await
        .unwrap();

    eventually("retry to confirm the alert", || is_synced(&engine, &alert.id)).await;
    assert_eq!(remote.alert_count(), 1);
    assert_eq!(remote.push_count(), 2);
    assert_eq!(engine.pending_count().await.unwrap(), 0);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_until_the_remote_answers() {
    let remote = Arc::new(InMemoryAuthority::new());
    let engine = open_engine(&remote).await;
    let monitor = engine.spawn_monitor(true);
    engine.start(&monitor).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for _ in 0..3 {
        remote.drop_next_ack();
    }
    let alert = engine
        .create_alert("Roof collapse", street(), Priority::Critical)
        .await
        .unwrap();

    // Jittered delays are bounded by 1 s, 2 s and 4 s
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(is_synced(&engine, &alert.id));
    assert_eq!(remote.push_count(), 4);
    assert_eq!(remote.alert_count(), 1);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retry_waits_for_connectivity() {
    let remote = Arc::new(InMemoryAuthority::new());
    remote.set_reachable(false);
    let engine = open_engine(&remote).await;
    let monitor = engine.spawn_monitor(true);
    engine.start(&monitor).unwrap();

    let alert = engine
        .create_alert("Power line down", street(), Priority::Medium)
        .await
        .unwrap();
    monitor.report(false);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(engine.status(), EngineStatus::Offline);

    remote.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(
        engine.get_alert(&alert.id).unwrap().sync_state,
        SyncState::Pending
    );
    assert_eq!(remote.alert_count(), 0);

    monitor.report(true);
    eventually("reconnect drain", || is_synced(&engine, &alert.id)).await;

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn requests_during_a_drain_coalesce() {
    let remote = Arc::new(InMemoryAuthority::new());
    let engine = open_engine(&remote).await;
    let monitor = engine.spawn_monitor(true);
    engine.start(&monitor).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let drains = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&drains);
    let _subscription = engine.on_state_change(move |change| {
        if *change == StateChange::Status(EngineStatus::Syncing) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    remote.set_latency(Some(Duration::from_secs(5)));
    for n in 0..4 {
        engine
            .create_alert(format!("Flooded basement #{n}"), street(), Priority::Low)
            .await
            .unwrap();
    }
    engine.sync_now();

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(drains.load(Ordering::SeqCst), 2);
    assert_eq!(remote.alert_count(), 4);
    assert_eq!(engine.pending_count().await.unwrap(), 0);

    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn manual_sync_during_a_drain_is_not_held_by_backoff() {
    let remote = Arc::new(InMemoryAuthority::new());
    let config = EngineConfig {
        backoff: BackoffPolicy {
            base: Duration::from_secs(600),
            cap: Duration::from_secs(600),
            ..BackoffPolicy::default()
        },
        ..EngineConfig::default()
    };
    let engine = SyncEngine::open(config, Arc::clone(&remote)).await.unwrap();
    let monitor = engine.spawn_monitor(true);
    engine.start(&monitor).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    remote.set_latency(Some(Duration::from_secs(5)));
    remote.drop_next_ack();
    let first = engine
        .create_alert("Trapped in elevator", street(), Priority::High)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Local change then manual request, both while the failing drain runs
    let second = engine
        .create_alert("Smoke on 2nd floor", street(), Priority::High)
        .await
        .unwrap();
    assert!(engine.sync_now());

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(is_synced(&engine, &first.id));
    assert!(is_synced(&engine, &second.id));
    assert_eq!(remote.alert_count(), 2);
    assert_eq!(engine.pending_count().await.unwrap(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn escalation_behind_a_losing_edit_survives_the_conflict() {
    let remote = Arc::new(InMemoryAuthority::new());
    let engine = open_engine(&remote).await;

    let alert = engine
        .create_alert("Water rising in basement", street(), Priority::High)
        .await
        .unwrap();
    engine.drain_now().await.unwrap();

    // Edited elsewhere after anything this device did
    let theirs = engine.get_alert(&alert.id).unwrap();
    remote.remote_update_alert(theirs, i64::MAX);

    // The first local edit alone would lose to the remote copy
    engine
        .escalate_alert(&alert.id, Priority::Medium)
        .await
        .unwrap();
    engine
        .escalate_alert(&alert.id, Priority::Critical)
        .await
        .unwrap();

    let result = engine.drain_now().await.unwrap();
    assert_eq!(result.conflicted, 1);
    assert_eq!(engine.pending_count().await.unwrap(), 0);
    assert_eq!(
        engine.get_alert(&alert.id).unwrap().priority,
        Priority::Critical
    );
    assert_eq!(
        remote.get_alert(&alert.id).unwrap().record.priority,
        Priority::Critical
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_a_drain_between_entries() {
    let remote = Arc::new(InMemoryAuthority::new());
    remote.set_latency(Some(Duration::from_secs(5)));
    let engine = open_engine(&remote).await;
    let monitor = engine.spawn_monitor(false);
    engine.start(&monitor).unwrap();

    for n in 0..3 {
        engine
            .create_alert(format!("Aftershock damage #{n}"), street(), Priority::High)
            .await
            .unwrap();
    }
    monitor.report(true);
    tokio::time::sleep(Duration::from_secs(3)).await;

    engine.shutdown().await;
    assert_eq!(remote.alert_count(), 1);
    assert_eq!(engine.pending_count().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn manual_sync_runs_while_offline() {
    let remote = Arc::new(InMemoryAuthority::new());
    let engine = open_engine(&remote).await;
    assert!(!engine.sync_now());

    let monitor = engine.spawn_monitor(false);
    engine.start(&monitor).unwrap();
    assert!(engine.start(&monitor).is_err());

    let alert = engine
        .create_alert("Bridge out on Route 9", street(), Priority::High)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(remote.push_count(), 0);

    assert!(engine.sync_now());
    eventually("manual drain", || is_synced(&engine, &alert.id)).await;

    engine.shutdown().await;
}

#[tokio::test]
async fn concurrent_priorities_resolve_to_critical_in_either_order() {
    for (local_priority, remote_priority) in [
        (Priority::High, Priority::Critical),
        (Priority::Critical, Priority::High),
    ] {
        let remote = Arc::new(InMemoryAuthority::new());
        let engine = open_engine(&remote).await;
        let alert = engine
            .create_alert("Fire on 5th floor", street(), Priority::Medium)
            .await
            .unwrap();
        engine.drain_now().await.unwrap();

        let mut theirs = alert.clone();
        theirs.priority = remote_priority;
        remote.remote_update_alert(theirs, unix_millis_now());
        engine
            .escalate_alert(&alert.id, local_priority)
            .await
            .unwrap();

        let result = engine.drain_now().await.unwrap();
        assert_eq!(result.conflicted, 1);
        assert_eq!(
            engine.get_alert(&alert.id).unwrap().priority,
            Priority::Critical
        );
        assert_eq!(
            remote.get_alert(&alert.id).unwrap().record.priority,
            Priority::Critical
        );
        assert_eq!(engine.pending_count().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn conflicts_surface_until_dismissed() {
    let remote = Arc::new(InMemoryAuthority::new());
    let engine = open_engine(&remote).await;
    let alert = engine
        .create_alert("Looting reported", street(), Priority::High)
        .await
        .unwrap();
    engine.drain_now().await.unwrap();

    let mut theirs = alert.clone();
    theirs.priority = Priority::Critical;
    remote.remote_update_alert(theirs, 0);
    engine.resolve_alert(&alert.id).await.unwrap();
    engine.drain_now().await.unwrap();

    let conflicts = engine.list_conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(
        engine.get_alert(&alert.id).unwrap().sync_state,
        SyncState::Conflict
    );

    let dismissed = engine.dismiss_conflict(conflicts[0].id).await.unwrap();
    assert!(dismissed.dismissed);
    assert!(engine.list_conflicts().is_empty());
    assert_eq!(
        engine.get_alert(&alert.id).unwrap().sync_state,
        SyncState::Synced
    );

    let history = engine.conflict_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].dismissed);
    assert!(matches!(
        engine.dismiss_conflict(999).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn alert_lifecycle_rules() {
    let remote = Arc::new(InMemoryAuthority::new());
    let engine = open_engine(&remote).await;
    let alert = engine
        .create_alert("  Stranded on the overpass  ", street(), Priority::High)
        .await
        .unwrap();
    assert_eq!(alert.message, "Stranded on the overpass");

    let resolved = engine.resolve_alert(&alert.id).await.unwrap();
    assert_eq!(resolved.status, AlertStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
    assert_eq!(resolved.sync_state, SyncState::Pending);

    // Second resolve is a no-op and appends nothing
    engine.resolve_alert(&alert.id).await.unwrap();
    assert_eq!(engine.pending_count().await.unwrap(), 2);

    assert!(matches!(
        engine.cancel_alert(&alert.id).await,
        Err(Error::InvalidTransition(_))
    ));
    assert!(matches!(
        engine.escalate_alert(&alert.id, Priority::Critical).await,
        Err(Error::InvalidTransition(_))
    ));
    assert!(matches!(
        engine.resolve_alert(&AlertId::new()).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        engine.create_alert("   ", street(), Priority::Low).await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        engine
            .create_alert("help", Location::new(120.0, 0.0), Priority::Low)
            .await,
        Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
        engine.queue_message(" ", "hello").await,
        Err(Error::InvalidInput(_))
    ));
    assert_eq!(engine.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn list_alerts_is_newest_first() {
    let remote = Arc::new(InMemoryAuthority::new());
    let engine = open_engine(&remote).await;
    let mut created = Vec::new();
    for n in 0..3 {
        let alert = engine
            .create_alert(format!("Report {n}"), street(), Priority::Medium)
            .await
            .unwrap();
        created.push(alert.id);
        std::thread::sleep(Duration::from_millis(2));
    }

    let listed: Vec<AlertId> = engine.list_alerts().iter().map(|alert| alert.id).collect();
    created.reverse();
    assert_eq!(listed, created);
}

#[tokio::test]
async fn storage_full_degrades_the_engine() {
    let remote = Arc::new(InMemoryAuthority::new());
    let config = EngineConfig {
        ledger_capacity: 2,
        ..EngineConfig::default()
    };
    let engine = SyncEngine::open(config, remote).await.unwrap();

    let changes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&changes);
    let _subscription = engine.on_state_change(move |change| {
        seen.lock().unwrap().push(change.clone());
    });

    engine
        .create_alert("First", street(), Priority::Low)
        .await
        .unwrap();
    engine
        .queue_message("dad", "ok")
        .await
        .unwrap();
    let error = engine
        .create_alert("Third", street(), Priority::Low)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::StorageFull(_)));

    assert!(engine.status().is_degraded());
    assert_eq!(engine.list_alerts().len(), 1);
    let changes = changes.lock().unwrap();
    assert_eq!(changes.len(), 3);
    assert!(matches!(
        changes.last(),
        Some(StateChange::Status(EngineStatus::Degraded(_)))
    ));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ledger.db");
    let config = EngineConfig {
        db_path: Some(db_path.clone()),
        ..EngineConfig::default()
    };
    let remote = Arc::new(InMemoryAuthority::new());

    let alert = {
        let engine = SyncEngine::open(config.clone(), Arc::clone(&remote))
            .await
            .unwrap();
        let alert = engine
            .create_alert("Collapsed stairwell", street(), Priority::Critical)
            .await
            .unwrap();
        engine
            .queue_message("+1 555 0101", "Kids are with me")
            .await
            .unwrap();
        engine.shutdown().await;
        alert
    };

    let engine = SyncEngine::open(config, Arc::clone(&remote))
        .await
        .unwrap();
    let reloaded = engine.get_alert(&alert.id).unwrap();
    assert_eq!(reloaded.sync_state, SyncState::Pending);
    assert!(reloaded.same_content(&alert));
    assert_eq!(engine.list_messages().len(), 1);
    assert_eq!(engine.pending_count().await.unwrap(), 2);

    let result = engine.drain_now().await.unwrap();
    assert_eq!(result.pushed, 2);
    assert!(is_synced(&engine, &alert.id));
    assert!(LocalStore::snapshot_path(&db_path).exists());
}
