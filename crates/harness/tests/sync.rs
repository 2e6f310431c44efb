use std::sync::{Arc, Mutex};
use std::time::Duration;

use examsync_core::{CoreError, Diffable, RecordId, Schedule, Task};
use examsync_engine::session::PERM_VIEW;
use examsync_engine::{EngineError, SyncConfig, SyncController, SyncParams, SyncStatus, UserInfo};
use examsync_harness::{PeerError, TASK_ENDPOINT, TestNetwork, TestPeer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "examsync_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn setup() -> Result<(Arc<TestNetwork>, TestPeer), Box<dyn std::error::Error>> {
    init_tracing();
    let network = Arc::new(TestNetwork::new()?);
    let peer = TestPeer::admin(Arc::clone(&network));
    Ok((network, peer))
}

fn status_log() -> (
    Arc<Mutex<Vec<SyncStatus>>>,
    impl Fn(SyncStatus, &str) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = Arc::clone(&seen);
        move |status: SyncStatus, _text: &str| seen.lock().unwrap().push(status)
    };
    (seen, sink)
}

#[tokio::test]
async fn first_save_creates_the_record() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;
    let id = task.read(|t| t.id());

    task.update(|edit| {
        let mut local = edit.local();
        local.set_statement("2 + 2 = ?");
        local.set_answer_rows(1);
    });
    assert!(task.synchronize().await);

    let stored = network.load("task", id)?;
    assert_eq!(stored.decode_field::<String>("statement")?, "2 + 2 = ?");
    assert_eq!(stored.decode_field::<i64>("answer_rows")?, 1);
    assert_eq!(network.request_count(), 1);
    assert!(task.is_synchronized());
    assert_eq!(task.fields(), 0);
    Ok(())
}

#[tokio::test]
async fn no_op_write_sends_nothing() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;
    task.update(|edit| edit.local().set_tag(""));
    assert!(task.synchronize().await);
    assert_eq!(network.request_count(), 0);
    Ok(())
}

#[tokio::test]
async fn changes_during_a_save_are_coalesced() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;
    let id = task.read(|t| t.id());

    network.hold();
    task.update(|edit| edit.local().set_tag("a"));
    network.wait_for_requests(1).await;
    assert!(!task.is_synchronized());

    task.update(|edit| edit.local().set_tag("b"));
    task.update(|edit| edit.local().set_statement("s"));
    task.update(|edit| edit.local().set_tag("c"));
    network.release();
    assert!(task.synchronize().await);

    let requests = network.requests();
    assert_eq!(requests.len(), 2);
    let second = &requests[1].1;
    assert_eq!(second.decode_field::<String>("tag")?, "c");
    assert_eq!(second.decode_field::<String>("statement")?, "s");

    let stored = network.load("task", id)?;
    assert_eq!(stored.decode_field::<String>("tag")?, "c");
    Ok(())
}

#[tokio::test]
async fn write_back_to_remote_during_a_save_is_still_sent() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;
    let id = task.read(|t| t.id());

    network.hold();
    task.update(|edit| edit.local().set_tag("a"));
    network.wait_for_requests(1).await;
    // Equal to the remote that is still in place, so the delta empties;
    // once "a" is committed the field is dirty again.
    task.update(|edit| edit.local().set_tag(""));
    network.release();
    assert!(task.synchronize().await);

    assert_eq!(network.request_count(), 2);
    assert_eq!(network.load("task", id)?.decode_field::<String>("tag")?, "");
    Ok(())
}

#[tokio::test]
async fn failed_save_keeps_the_delta_for_the_next_attempt() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;
    let id = task.read(|t| t.id());

    network.fail_all(true);
    task.update(|edit| edit.local().set_statement("x"));
    assert!(!task.synchronize().await);
    assert_eq!(task.status(), SyncStatus::NotSaved);
    assert!(!task.is_synchronized());
    assert_eq!(task.fields(), 1);
    task.read(|t| {
        assert_eq!(t.statement(), "x");
        assert_eq!(
            t.remote_message().decode_field::<String>("statement").ok(),
            Some(String::new())
        );
    });

    network.fail_all(false);
    task.update(|edit| edit.local().set_tag("t"));
    assert!(task.synchronize().await);

    let (_, last) = network.requests().pop().ok_or("no request")?;
    assert_eq!(last.decode_field::<String>("statement")?, "x");
    assert_eq!(last.decode_field::<String>("tag")?, "t");
    let stored = network.load("task", id)?;
    assert_eq!(stored.decode_field::<String>("statement")?, "x");
    assert_eq!(task.status(), SyncStatus::Saved);
    Ok(())
}

#[tokio::test]
async fn synchronize_retries_once_after_a_failure() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;

    network.fail_next(1);
    task.update(|edit| edit.local().set_answer_cols(3));
    assert!(task.synchronize().await);
    assert_eq!(network.request_count(), 2);
    assert!(task.is_synchronized());
    Ok(())
}

#[tokio::test]
async fn status_follows_each_attempt() -> TestResult {
    let (network, peer) = setup()?;
    let id = peer.new_id().await?;
    let (seen, sink) = status_log();
    let task = SyncController::new(
        SyncParams::new(Task::new(id), Arc::clone(&network), TASK_ENDPOINT).with_status(sink),
    );
    task.resume_saves();

    task.update(|edit| edit.local().set_tag("a"));
    assert!(task.synchronize().await);
    network.fail_all(true);
    task.update(|edit| edit.local().set_tag("b"));
    assert!(!task.synchronize().await);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            SyncStatus::Saving,
            SyncStatus::Saved,
            SyncStatus::Saving,
            SyncStatus::NotSaved,
            SyncStatus::Saving,
            SyncStatus::NotSaved,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn saves_wait_until_resumed() -> TestResult {
    let (network, peer) = setup()?;
    let id = peer.new_id().await?;
    let task = SyncController::new(SyncParams::new(
        Task::new(id),
        Arc::clone(&network),
        TASK_ENDPOINT,
    ));

    task.update(|edit| {
        let mut local = edit.local();
        local.set_task_type(2);
        local.set_answer_rows(4);
    });
    tokio::task::yield_now().await;
    assert_eq!(network.request_count(), 0);
    assert!(!task.synchronize().await);

    task.resume_saves();
    assert!(task.synchronize().await);
    assert_eq!(network.request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn atomic_change_is_one_request() -> TestResult {
    let (network, mut peer) = setup()?;
    let kim = peer.new_kim().await?;
    let id = kim.read(|k| k.id());
    let entry = peer.new_id().await?;
    let schedule = Schedule {
        start_time: 0,
        end_time: 2 * examsync_core::MINUTE * 60,
        duration: 0,
        is_virtual: false,
    }
    .normalize(examsync_core::ScheduleEdit::EndTime);

    kim.as_atomic_change(|kim| -> Result<(), CoreError> {
        kim.update(|edit| edit.local().set_name("Вариант 1"));
        kim.update(|edit| edit.local().set_schedule(schedule));
        kim.as_atomic_change(|kim| {
            kim.update(|edit| edit.local().set_is_exam(true));
        });
        kim.update(|edit| -> Result<(), CoreError> {
            let mut local = edit.local();
            let mut tasks = local.tasks();
            tasks.add(examsync_core::TaskEntry::new(entry))?.local().set_tag("t1");
            Ok(())
        })?;
        assert!(!kim.is_synchronized());
        Ok(())
    })?;
    assert!(kim.synchronize().await);

    assert_eq!(network.request_count(), 1);
    let stored = network.load("kim", id)?;
    assert_eq!(stored.decode_field::<String>("name")?, "Вариант 1");
    assert_eq!(stored.decode_field::<i64>("duration")?, schedule.duration);
    assert!(stored.decode_field::<bool>("is_exam")?);
    assert_eq!(stored.children("tasks").len(), 1);
    Ok(())
}

#[tokio::test]
async fn drain_timeout_gives_up() -> TestResult {
    init_tracing();
    let network = Arc::new(TestNetwork::new()?);
    let config = SyncConfig::from_yaml_str("drain_timeout_ms: 50\n")?;
    let mut peer = TestPeer::with_config(
        Arc::clone(&network),
        UserInfo {
            user_id: 2,
            login: "slow".into(),
            perms: u32::MAX,
        },
        config,
    );
    let task = peer.new_task().await?;

    network.hold();
    task.update(|edit| edit.local().set_tag("late"));
    assert!(!task.synchronize().await);

    network.release();
    let mut attempts = 0;
    while !task.synchronize().await {
        attempts += 1;
        assert!(attempts < 10, "save never completed");
    }
    assert_eq!(network.request_count(), 1);
    Ok(())
}

#[tokio::test]
async fn session_end_requires_a_full_drain() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;
    let kim = peer.new_kim().await?;
    assert_eq!(peer.session.tracked(), 2);

    kim.update(|edit| edit.local().set_name("B"));
    assert!(kim.synchronize().await);

    network.fail_all(true);
    task.update(|edit| edit.local().set_statement("unsaved"));
    assert!(peer.session.has_unsaved_changes());

    let TestPeer { session, .. } = peer;
    let (session, err) = match session.end().await {
        Ok(()) => return Err("session ended with unsaved changes".into()),
        Err(failure) => failure,
    };
    assert!(matches!(err, EngineError::UnsavedChanges(1)));

    network.fail_all(false);
    assert!(session.end().await.is_ok());
    Ok(())
}

#[tokio::test]
async fn view_only_user_cannot_create_records() -> TestResult {
    init_tracing();
    let network = Arc::new(TestNetwork::new()?);
    let mut peer = TestPeer::new(
        Arc::clone(&network),
        UserInfo {
            user_id: 3,
            login: "viewer".into(),
            perms: PERM_VIEW,
        },
    );
    assert!(matches!(
        peer.new_task().await,
        Err(PeerError::Engine(EngineError::Forbidden(_)))
    ));
    assert!(matches!(
        peer.open_kim(RecordId::new(1)),
        Err(PeerError::Engine(EngineError::Forbidden(_)))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edit_pending_across_an_empty_batch_is_sent() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;
    let id = task.read(|t| t.id());

    network.hold();
    task.update(|edit| edit.local().set_tag("a"));
    network.wait_for_requests(1).await;
    task.update(|edit| edit.local().set_statement("s"));

    // The first response lands while the batch is open.
    task.as_atomic_change(|_| {
        network.release();
        std::thread::sleep(Duration::from_millis(300));
    });

    tokio::time::timeout(Duration::from_secs(5), network.wait_for_requests(2)).await?;
    let stored = async {
        loop {
            if task.is_synchronized() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), stored).await?;
    assert_eq!(network.load("task", id)?.decode_field::<String>("statement")?, "s");
    Ok(())
}

#[tokio::test]
async fn reverted_edit_drains_while_suppressed() -> TestResult {
    let (network, peer) = setup()?;
    let id = peer.new_id().await?;
    let task = SyncController::new(SyncParams::new(
        Task::new(id),
        Arc::clone(&network),
        TASK_ENDPOINT,
    ));

    task.update(|edit| {
        let mut local = edit.local();
        local.set_tag("x");
        local.set_tag("");
    });
    assert!(task.synchronize().await);
    assert!(task.is_synchronized());
    assert_eq!(network.request_count(), 0);
    Ok(())
}

#[tokio::test]
async fn closed_records_leave_the_session() -> TestResult {
    let (network, mut peer) = setup()?;
    let task = peer.new_task().await?;
    let kim = peer.new_kim().await?;
    assert_eq!(peer.session.tracked(), 2);

    task.update(|edit| edit.local().set_statement("done"));
    peer.session.close(&task).await?;
    assert_eq!(peer.session.tracked(), 1);

    network.fail_all(true);
    kim.update(|edit| edit.local().set_name("draft"));
    assert!(peer.session.close(&kim).await.is_err());
    assert!(peer.session.has_unsaved_changes());
    assert!(peer.session.release(&kim));
    assert_eq!(peer.session.tracked(), 0);
    assert!(!peer.session.has_unsaved_changes());
    Ok(())
}
