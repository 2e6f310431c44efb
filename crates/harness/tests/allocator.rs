use std::collections::BTreeSet;
use std::error::Error;
use std::sync::Arc;

use examsync_engine::{IdAllocator, SyncConfig, UserInfo};
use examsync_harness::{TestNetwork, TestPeer};
use examsync_storage::SqliteStorage;

type TestResult = Result<(), Box<dyn Error>>;

fn user(user_id: i64) -> UserInfo {
    UserInfo {
        user_id,
        login: format!("user{user_id}"),
        perms: u32::MAX,
    }
}

#[tokio::test]
async fn peers_never_share_ids() -> TestResult {
    let network = Arc::new(TestNetwork::new()?);
    let config = SyncConfig {
        id_batch_size: 4,
        ..SyncConfig::default()
    };
    let first = TestPeer::with_config(Arc::clone(&network), user(1), config.clone());
    let second = TestPeer::with_config(Arc::clone(&network), user(2), config);

    let mut seen = BTreeSet::new();
    for _ in 0..10 {
        assert!(seen.insert(first.new_id().await?));
        assert!(seen.insert(second.new_id().await?));
    }
    assert_eq!(seen.len(), 20);
    Ok(())
}

#[tokio::test]
async fn pool_serves_without_the_network_until_empty() -> TestResult {
    let network = Arc::new(TestNetwork::new()?);
    let allocator = IdAllocator::new(Arc::clone(&network), 3);
    assert!(allocator.try_allocate().is_none());

    let first = allocator.allocate().await?;
    assert_eq!(allocator.available(), 2);
    let second = allocator.try_allocate().ok_or("pool empty")?;
    assert_eq!(second.get(), first.get() + 1);
    Ok(())
}

#[tokio::test]
async fn reservations_survive_a_restart() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("exams.db");
    let path = path.to_str().ok_or("non-utf8 temp path")?;

    let before = {
        let network = Arc::new(TestNetwork::with_storage(SqliteStorage::open(path)?));
        let peer = TestPeer::new(network, user(1));
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(peer.new_id().await?);
        }
        ids
    };

    let network = Arc::new(TestNetwork::with_storage(SqliteStorage::open(path)?));
    let peer = TestPeer::new(network, user(1));
    let after = peer.new_id().await?;
    assert!(before.iter().all(|id| *id < after));
    Ok(())
}
