use std::time::{Duration, Instant};

use super::*;
use crate::core::error::SupervisorError;

#[tokio::test]
async fn stop_on_stopped_bot_is_a_noop() {
    let h = harness(READY);
    let id = h.add_bot("idle").await;

    assert_eq!(h.supervisor.stop(&id).await.unwrap(), BotState::Stopped);
    assert_eq!(h.status(&id).await, BotStatus::Offline);
    assert!(h.last_active(&id).await.is_none());
    assert!(h.store.written().is_empty());

    h.supervisor.start(&id).await.unwrap();
    h.supervisor.stop(&id).await.unwrap();
    let after_first_stop = h.last_active(&id).await;
    let writes = h.store.written().len();

    assert_eq!(h.supervisor.stop(&id).await.unwrap(), BotState::Stopped);
    assert_eq!(h.last_active(&id).await, after_first_stop);
    assert_eq!(h.store.written().len(), writes);
}

#[tokio::test]
async fn stop_terminates_process_and_persists_offline() {
    let h = harness(READY);
    let id = h.add_bot("worker").await;

    h.supervisor.start(&id).await.unwrap();
    let pid = h.supervisor.snapshot(&id).pid.unwrap();

    assert_eq!(h.supervisor.stop(&id).await.unwrap(), BotState::Stopped);
    assert_eq!(h.status(&id).await, BotStatus::Offline);
    assert!(h.supervisor.get_running_ids().is_empty());
    assert!(h.supervisor.snapshot(&id).pid.is_none());
    assert_pid_gone(pid).await;
}

#[tokio::test]
async fn stop_escalates_to_kill_after_grace_period() {
    let mut config = fast_config();
    config.grace_period = Duration::from_millis(300);
    let h = harness_with(IGNORES_TERM, config);
    let id = h.add_bot("stubborn").await;

    h.supervisor.start(&id).await.unwrap();
    let pid = h.supervisor.snapshot(&id).pid.unwrap();

    let started = Instant::now();
    assert_eq!(h.supervisor.stop(&id).await.unwrap(), BotState::Stopped);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(h.status(&id).await, BotStatus::Offline);
    assert_pid_gone(pid).await;
}

#[tokio::test]
async fn stop_during_start_cancels_and_leaves_no_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let mut config = fast_config();
    config.observation_window = Duration::from_secs(3);
    let h = harness_with(
        &format!("sleep 30 & echo $! > '{}'; wait", pid_file.display()),
        config,
    );
    let id = h.add_bot("quick-stop").await;

    let starter = {
        let supervisor = h.supervisor.clone();
        let id = id.clone();
        tokio::spawn(async move { supervisor.start(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped_at = Instant::now();
    assert_eq!(h.supervisor.stop(&id).await.unwrap(), BotState::Stopped);
    assert!(stopped_at.elapsed() < Duration::from_secs(2));

    let started = starter.await.unwrap();
    assert!(matches!(started, Err(SupervisorError::Cancelled(_))));
    assert_eq!(h.status(&id).await, BotStatus::Offline);
    assert!(h.supervisor.get_running_ids().is_empty());

    let grandchild: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_pid_gone(grandchild).await;
}

#[tokio::test]
async fn stop_after_silent_crash_reports_the_crash() {
    let h = harness("echo BOTDECK_READY; sleep 0.3; exit 4");
    let id = h.add_bot("crashy").await;

    h.supervisor.start(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(h.supervisor.stop(&id).await.unwrap(), BotState::Errored);
    assert_eq!(h.status(&id).await, BotStatus::Error);
}

#[tokio::test]
async fn delete_stops_process_and_removes_record() {
    let h = harness(READY);
    let id = h.add_bot("doomed").await;

    h.supervisor.start(&id).await.unwrap();
    let pid = h.supervisor.snapshot(&id).pid.unwrap();

    assert!(h.supervisor.delete(&id).await.unwrap());
    assert!(h.store.inner.get_bot(&id).await.unwrap().is_none());
    assert!(h.supervisor.get_running_ids().is_empty());
    assert_pid_gone(pid).await;

    assert!(!h.supervisor.delete(&id).await.unwrap());
}

#[tokio::test]
async fn abandoned_stop_still_finishes_offline() {
    let h = harness("trap 'sleep 0.5; exit 7' TERM; echo BOTDECK_READY; while :; do sleep 0.1; done");
    let id = h.add_bot("slow-exit").await;
    let mut events = h.supervisor.subscribe();

    h.supervisor.start(&id).await.unwrap();
    let pid = h.supervisor.snapshot(&id).pid.unwrap();

    let abandoned = tokio::time::timeout(Duration::from_millis(50), h.supervisor.stop(&id)).await;
    assert!(abandoned.is_err());

    let event = wait_for_transition(&mut events, &id, BotState::Stopped).await;
    assert_eq!(event.from, BotState::Stopping);
    // Queued behind the detached stop, so its store write is done.
    assert_eq!(h.supervisor.stop(&id).await.unwrap(), BotState::Stopped);
    assert_eq!(h.status(&id).await, BotStatus::Offline);
    assert!(h.supervisor.snapshot(&id).pid.is_none());
    assert!(h.supervisor.get_running_ids().is_empty());
    assert_pid_gone(pid).await;

    h.launcher.set_script(&id, READY);
    assert_eq!(h.supervisor.start(&id).await.unwrap(), BotState::Running);
    assert_eq!(h.status(&id).await, BotStatus::Online);
    h.supervisor.stop(&id).await.unwrap();
}

#[tokio::test]
async fn exit_seen_while_stopping_ends_stopped() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let h = harness(READY);
    let id = h.add_bot("mid-stop").await;
    let mut events = h.supervisor.subscribe();

    h.supervisor.start(&id).await.unwrap();
    let pid = h.supervisor.snapshot(&id).pid.unwrap();
    let entry = h.supervisor.inner.registry.entry(&id);
    {
        let mut slot = entry.slot.lock().await;
        slot.state = BotState::Stopping;
        entry.publish(&slot);
    }
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let event = wait_for_transition(&mut events, &id, BotState::Stopped).await;
    assert_eq!(event.from, BotState::Stopping);
    drop(entry.slot.lock().await);
    assert_eq!(h.status(&id).await, BotStatus::Offline);
    assert!(h.supervisor.snapshot(&id).pid.is_none());
    assert!(h.supervisor.get_running_ids().is_empty());
}

#[tokio::test]
async fn queued_stop_wins_over_the_start_ahead_of_it() {
    let h = harness(READY);
    let id = h.add_bot("contended").await;

    let entry = h.supervisor.inner.registry.entry(&id);
    let held = entry.slot.lock().await;

    let starter = {
        let supervisor = h.supervisor.clone();
        let id = id.clone();
        tokio::spawn(async move { supervisor.start(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stopper = {
        let supervisor = h.supervisor.clone();
        let id = id.clone();
        tokio::spawn(async move { supervisor.stop(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    assert!(matches!(
        starter.await.unwrap(),
        Err(SupervisorError::Cancelled(_))
    ));
    assert_eq!(stopper.await.unwrap().unwrap(), BotState::Stopped);
    assert_eq!(h.launcher.spawn_count(), 0);
    assert!(h.supervisor.get_running_ids().is_empty());
    assert_eq!(h.status(&id).await, BotStatus::Offline);
}

#[tokio::test]
async fn stop_requested_before_a_start_does_not_undo_it() {
    let h = harness(READY);
    let id = h.add_bot("reordered").await;

    let entry = h.supervisor.inner.registry.entry(&id);
    let held = entry.slot.lock().await;

    let stopper = {
        let supervisor = h.supervisor.clone();
        let id = id.clone();
        tokio::spawn(async move { supervisor.stop(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let starter = {
        let supervisor = h.supervisor.clone();
        let id = id.clone();
        tokio::spawn(async move { supervisor.start(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    assert_eq!(stopper.await.unwrap().unwrap(), BotState::Stopped);
    assert_eq!(starter.await.unwrap().unwrap(), BotState::Running);
    assert_eq!(h.status(&id).await, BotStatus::Online);

    h.supervisor.stop(&id).await.unwrap();
}

#[tokio::test]
async fn stop_of_unknown_bot_leaves_no_entry_behind() {
    let h = harness(READY);
    let ghost = BotId::from("ghost");
    assert_eq!(h.supervisor.stop(&ghost).await.unwrap(), BotState::Stopped);
    assert!(h.supervisor.inner.registry.get(&ghost).is_none());
}

#[tokio::test]
async fn delete_drops_the_registry_entry() {
    let h = harness(READY);
    let id = h.add_bot("forgotten").await;

    h.supervisor.start(&id).await.unwrap();
    assert!(h.supervisor.delete(&id).await.unwrap());
    assert!(h.supervisor.inner.registry.get(&id).is_none());
    assert!(h.supervisor.inner.registry.all().is_empty());

    let err = h.supervisor.start(&id).await.unwrap_err();
    assert!(matches!(err, SupervisorError::Store(StoreError::NotFound(_))));
}
