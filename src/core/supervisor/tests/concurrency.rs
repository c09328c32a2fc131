use std::time::Duration;

use tokio::task::JoinSet;

use super::*;
use crate::core::error::FailureReason;

#[tokio::test]
async fn restart_leaves_exactly_one_process() {
    let h = harness(READY);
    let id = h.add_bot("restartable").await;

    h.supervisor.start(&id).await.unwrap();
    let first = h.supervisor.snapshot(&id).pid.unwrap();

    assert_eq!(h.supervisor.restart(&id).await.unwrap(), BotState::Running);
    let second = h.supervisor.snapshot(&id).pid.unwrap();
    assert_ne!(first, second);
    assert_pid_gone(first).await;
    assert_eq!(h.supervisor.get_running_ids().len(), 1);
    assert_eq!(h.launcher.spawn_count(), 2);
    assert_eq!(h.status(&id).await, BotStatus::Online);

    h.supervisor.stop(&id).await.unwrap();
}

#[tokio::test]
async fn restart_of_stopped_bot_just_starts() {
    let h = harness(READY);
    let id = h.add_bot("cold").await;

    assert_eq!(h.supervisor.restart(&id).await.unwrap(), BotState::Running);
    assert_eq!(h.launcher.spawn_count(), 1);

    h.supervisor.stop(&id).await.unwrap();
}

#[tokio::test]
async fn unrelated_bots_do_not_block_each_other() {
    let mut config = fast_config();
    config.observation_window = Duration::from_secs(2);
    let h = harness_with(SILENT, config);
    let slow = h.add_bot("slow").await;
    let fast = h.add_bot("fast").await;
    h.launcher.set_script(&fast, READY);

    let slow_start = {
        let supervisor = h.supervisor.clone();
        let slow = slow.clone();
        tokio::spawn(async move { supervisor.start(&slow).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast_start = tokio::time::timeout(Duration::from_secs(1), h.supervisor.start(&fast))
        .await
        .expect("start of an unrelated bot must not wait for the slow one");
    assert_eq!(fast_start.unwrap(), BotState::Running);
    assert_eq!(slow_start.await.unwrap().unwrap(), BotState::Running);

    h.supervisor.shutdown(crate::core::supervisor::ShutdownMode::Clean).await;
}

#[tokio::test]
async fn concurrent_operations_never_run_two_processes() {
    let dir = tempfile::tempdir().unwrap();
    let lock = dir.path().join("bot.lock");
    let script = format!(
        "mkdir '{lock}' 2>/dev/null || {{ echo duplicate process >&2; exit 9; }}; \
         trap 'rmdir \"{lock}\"; exit 0' TERM; \
         echo BOTDECK_READY; \
         while :; do sleep 1; done",
        lock = lock.display()
    );
    let h = harness(&script);
    let id = h.add_bot("contended").await;
    let mut events = h.supervisor.subscribe();

    let mut ops = JoinSet::new();
    for i in 0..24 {
        let supervisor = h.supervisor.clone();
        let id = id.clone();
        ops.spawn(async move {
            tokio::time::sleep(Duration::from_millis((i % 6) * 15)).await;
            let _ = match i % 3 {
                0 => supervisor.start(&id).await,
                1 => supervisor.stop(&id).await,
                _ => supervisor.restart(&id).await,
            };
            assert!(supervisor.get_running_ids().len() <= 1);
        });
    }
    while let Some(joined) = ops.join_next().await {
        joined.unwrap();
    }

    h.supervisor.stop(&id).await.unwrap();
    assert!(h.supervisor.get_running_ids().is_empty());
    assert!(!lock.exists());

    while let Ok(event) = events.try_recv() {
        if event.to == BotState::Errored {
            assert_ne!(
                event.reason,
                Some(FailureReason::ExitCode(9).to_string()),
                "a second process was spawned: {:?}",
                event.stderr_tail
            );
        }
    }
}
