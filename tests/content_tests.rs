mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{MemoryDatabase, RecordingSink, StubMetadataService};
use mediatheca::autoscan::{AutoscanDirectory, ScanMode, ScanSetting};
use mediatheca::config::ServerConfig;
use mediatheca::content::ContentOrchestrator;
use mediatheca::database::{Database, DbFileType};
use mediatheca::error::CatalogError;
use mediatheca::metadata::MetadataService;
use mediatheca::object::ObjectId;
use mediatheca::timer::{NullTimer, TimerSubscriber};
use mediatheca::update::UpdateAggregator;

struct Fixture {
    database: Arc<MemoryDatabase>,
    orchestrator: Arc<ContentOrchestrator>,
    _root: tempfile::TempDir,
    root_path: PathBuf,
}

async fn fixture(files: &[(&str, &[u8])]) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    for (rel, content) in files {
        let path = root.path().join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, content).await.unwrap();
    }
    let mut config = ServerConfig::default();
    config.import.autoscan.use_inotify = false;
    let config = Arc::new(config);
    let database = MemoryDatabase::new();
    let update = UpdateAggregator::new(
        database.clone() as Arc<dyn Database>,
        Arc::new(RecordingSink::default()),
    );
    let orchestrator = ContentOrchestrator::new(
        config,
        database.clone() as Arc<dyn Database>,
        Arc::new(StubMetadataService::new()) as Arc<dyn MetadataService>,
        update,
        Arc::new(NullTimer),
    );
    let root_path = root.path().to_path_buf();
    Fixture {
        database,
        orchestrator,
        _root: root,
        root_path,
    }
}

async fn wait_for<F>(predicate: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn find_file_id(database: &Arc<MemoryDatabase>, path: &PathBuf) -> Option<ObjectId> {
    database
        .find_object_id_by_path(path, DbFileType::File)
        .await
        .unwrap()
}

async fn wait_for_file(database: &Arc<MemoryDatabase>, path: &PathBuf, present: bool) -> bool {
    for _ in 0..200 {
        if find_file_id(database, path).await.is_some() == present {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn removing_a_subtree_invalidates_pending_add_tasks() {
    let fixture = fixture(&[("a/b/c.mp3", b"audio"), ("a/b/d.mp3", b"audio")]).await;

    // populate the catalog synchronously
    let settings = ScanSetting {
        recursive: true,
        ..Default::default()
    };
    fixture
        .orchestrator
        .add_file(
            fixture.root_path.join("a"),
            fixture.root_path.clone(),
            settings.clone(),
            false,
            false,
            true,
        )
        .await
        .unwrap();

    let b_dir = fixture.root_path.join("a/b");
    let b_id = fixture
        .database
        .find_object_id_by_path(&b_dir, DbFileType::Directory)
        .await
        .unwrap()
        .expect("directory imported");

    // queue re-imports of both children; the worker is not running yet
    for name in ["a/b/c.mp3", "a/b/d.mp3"] {
        fixture
            .orchestrator
            .add_file(
                fixture.root_path.join(name),
                fixture.root_path.clone(),
                settings.clone(),
                true,
                false,
                true,
            )
            .await
            .unwrap();
    }
    assert_eq!(fixture.orchestrator.task_list().len(), 2);

    // removal invalidates the queued AddFile tasks before it proceeds
    fixture
        .orchestrator
        .remove_object(None, b_id, false, false, true)
        .await
        .unwrap();
    assert!(
        fixture.orchestrator.task_list().is_empty(),
        "queued adds under the removed path must be invalid"
    );

    let c_path = fixture.root_path.join("a/b/c.mp3");
    assert!(find_file_id(&fixture.database, &c_path).await.is_none());

    // draining the queue must not resurrect the children
    fixture.orchestrator.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        find_file_id(&fixture.database, &c_path).await.is_none(),
        "invalidated task re-added a removed child"
    );

    fixture.orchestrator.shutdown().await;
}

#[tokio::test]
async fn synchronous_add_returns_the_object_id() {
    let fixture = fixture(&[("song.mp3", b"audio")]).await;
    let path = fixture.root_path.join("song.mp3");
    let id = fixture
        .orchestrator
        .add_file(
            path.clone(),
            fixture.root_path.clone(),
            ScanSetting::default(),
            false,
            false,
            true,
        )
        .await
        .unwrap();
    assert!(id > 0);
    assert_eq!(find_file_id(&fixture.database, &path).await, Some(id));
    fixture.orchestrator.shutdown().await;
}

#[tokio::test]
async fn timed_autoscan_imports_and_reconciles() {
    let fixture = fixture(&[("media/keep.mp3", b"audio"), ("media/drop.mp3", b"audio")]).await;
    fixture.orchestrator.run().await.unwrap();

    let location = fixture.root_path.join("media");
    let adir = Arc::new(AutoscanDirectory::with_options(
        location.clone(),
        ScanMode::Timed,
        true,
        false,
        Duration::from_secs(3600),
    ));
    fixture
        .orchestrator
        .set_autoscan_directory(Arc::clone(&adir))
        .await
        .unwrap();

    let keep = fixture.root_path.join("media/keep.mp3");
    let drop_path = fixture.root_path.join("media/drop.mp3");
    assert!(
        wait_for_file(&fixture.database, &keep, true).await,
        "initial autoscan never imported the files"
    );

    // wait for the scan task to finish, then drop a file and fire the timer
    assert!(wait_for(|| adir.task_count() == 0).await);
    tokio::fs::remove_file(&drop_path).await.unwrap();
    fixture
        .orchestrator
        .timer_notify(adir.timer_parameter())
        .await;

    assert!(
        wait_for_file(&fixture.database, &drop_path, false).await,
        "timed rescan did not remove the stale item"
    );
    assert!(find_file_id(&fixture.database, &keep).await.is_some());

    fixture.orchestrator.shutdown().await;
}

#[tokio::test]
async fn overlapping_autoscans_are_rejected() {
    let fixture = fixture(&[("tree/sub/x.mp3", b"audio")]).await;
    fixture.orchestrator.run().await.unwrap();

    let outer = Arc::new(AutoscanDirectory::with_options(
        fixture.root_path.join("tree"),
        ScanMode::Timed,
        true,
        false,
        Duration::from_secs(3600),
    ));
    fixture
        .orchestrator
        .set_autoscan_directory(outer)
        .await
        .unwrap();

    let inner = Arc::new(AutoscanDirectory::with_options(
        fixture.root_path.join("tree/sub"),
        ScanMode::Timed,
        true,
        false,
        Duration::from_secs(3600),
    ));
    let err = fixture
        .orchestrator
        .set_autoscan_directory(inner)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::OverlappingAutoscan(_)));

    fixture.orchestrator.shutdown().await;
}

#[tokio::test]
async fn removing_a_parent_drops_child_autoscans() {
    let fixture = fixture(&[("tree/sub/x.mp3", b"audio")]).await;
    fixture.orchestrator.run().await.unwrap();

    let adir = Arc::new(AutoscanDirectory::with_options(
        fixture.root_path.join("tree/sub"),
        ScanMode::Timed,
        true,
        false,
        Duration::from_secs(3600),
    ));
    fixture
        .orchestrator
        .set_autoscan_directory(Arc::clone(&adir))
        .await
        .unwrap();
    assert!(wait_for(|| adir.task_count() == 0).await);

    let tree_id = fixture
        .database
        .find_object_id_by_path(&fixture.root_path.join("tree"), DbFileType::Directory)
        .await
        .unwrap()
        .expect("tree container");

    fixture
        .orchestrator
        .remove_object(None, tree_id, false, false, true)
        .await
        .unwrap();

    assert!(
        fixture.orchestrator.get_autoscan_directories().is_empty(),
        "autoscan under the removed tree must be gone"
    );
    fixture.orchestrator.shutdown().await;
}
