//! Integration tests for per-directory serialization.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gitwarden::error::GitwardenError;
use gitwarden::sequencer::{Sequencer, SequencerMap};

// ---------------------------------------------------------------------------
// Ordering and failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tasks_run_in_submission_order_one_at_a_time() {
    let sequencer = Sequencer::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(Mutex::new(0usize));

    let mut results = Vec::new();
    for i in 0..10u32 {
        let log = log.clone();
        let active = active.clone();
        results.push(sequencer.push(async move {
            {
                let mut n = active.lock().unwrap();
                *n += 1;
                assert_eq!(*n, 1, "two tasks overlapped");
            }
            // Later tasks finish faster if they were ever run concurrently.
            tokio::time::sleep(Duration::from_millis(u64::from(10 - i))).await;
            log.lock().unwrap().push(i);
            *active.lock().unwrap() -= 1;
            if i == 5 {
                Err(GitwardenError::PromptRejected {
                    reason: "task five".into(),
                })
            } else {
                Ok(i)
            }
        }));
    }

    for (i, result) in results.into_iter().enumerate() {
        match result.await {
            Ok(value) => assert_eq!(value as usize, i),
            Err(e) => {
                assert_eq!(i, 5);
                assert!(e.to_string().contains("task five"));
            }
        }
    }

    assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn panicking_task_settles_as_aborted_and_queue_continues() {
    let sequencer = Sequencer::new();
    let first = sequencer.push(async {
        if true {
            panic!("boom");
        }
        Ok(())
    });
    let second = sequencer.push(async { Ok("still runs") });

    assert!(matches!(first.await, Err(GitwardenError::TaskAborted)));
    assert_eq!(second.await.unwrap(), "still runs");
}

#[tokio::test]
async fn push_order_wins_over_await_order() {
    let sequencer = Sequencer::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let log = log.clone();
        sequencer.push(async move {
            log.lock().unwrap().push("a");
            Ok(())
        })
    };
    let b = {
        let log = log.clone();
        sequencer.push(async move {
            log.lock().unwrap().push("b");
            Ok(())
        })
    };

    b.await.unwrap();
    a.await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
}

// ---------------------------------------------------------------------------
// Per-directory isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn different_directories_run_concurrently() {
    let map = SequencerMap::new();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    // Blocks repo-a until repo-b's task has finished.
    let blocked = map.for_dir(Path::new("/repo-a")).push(async move {
        release_rx.await.ok();
        Ok("a")
    });
    let free = map.for_dir(Path::new("/repo-b")).push(async move {
        let _ = release_tx.send(());
        Ok("b")
    });

    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(blocked, free)
    })
    .await
    .expect("directories must not block each other");
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert_eq!(map.len(), 2);
}

#[tokio::test]
async fn same_directory_shares_one_queue() {
    let map = SequencerMap::new();
    let first = map.for_dir(Path::new("/repo"));
    let second = map.for_dir(Path::new("/repo"));

    let gate = Arc::new(tokio::sync::Notify::new());
    let waiting = {
        let gate = gate.clone();
        first.push(async move {
            gate.notified().await;
            Ok(1)
        })
    };
    let queued = second.push(async { Ok(2) });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(second.is_running());
    assert_eq!(second.pending(), 1);

    gate.notify_one();
    assert_eq!(waiting.await.unwrap(), 1);
    assert_eq!(queued.await.unwrap(), 2);
    assert_eq!(map.len(), 1);
}

#[tokio::test]
async fn drained_directories_are_forgotten() {
    let map = SequencerMap::new();
    for dir in ["/repo/a", "/repo/b", "/repo/c"] {
        map.for_dir(Path::new(dir)).push(async { Ok(()) }).await.unwrap();
    }
    let busy = map.for_dir(Path::new("/repo/busy"));
    let gate = Arc::new(tokio::sync::Notify::new());
    let waiting = {
        let gate = gate.clone();
        busy.push(async move {
            gate.notified().await;
            Ok(())
        })
    };
    drop(busy);

    // Each drain loop lets go of its queue right after its last task.
    for _ in 0..200 {
        map.remove_idle();
        if map.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(map.len(), 1, "only the busy directory stays");

    gate.notify_one();
    waiting.await.unwrap();
    for _ in 0..200 {
        map.remove_idle();
        if map.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(map.is_empty());
}
