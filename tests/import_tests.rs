mod common;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use common::{MemoryDatabase, RecordingSink, StubMetadataService};
use mediatheca::autoscan::ScanSetting;
use mediatheca::config::ServerConfig;
use mediatheca::database::{Database, DbFileType, DEFAULT_CLIENT_GROUP};
use mediatheca::import::ImportService;
use mediatheca::layout::builtin::BuiltinLayout;
use mediatheca::metadata::MetadataService;
use mediatheca::object::{
    MetadataField, CdsObject, OBJECT_FLAG_USE_RESOURCE_REF, UPNP_CLASS_MUSIC_TRACK,
};
use mediatheca::update::UpdateAggregator;

fn settings_recursive() -> ScanSetting {
    ScanSetting {
        recursive: true,
        ..Default::default()
    }
}

struct Fixture {
    database: Arc<MemoryDatabase>,
    service: ImportService,
    _root: tempfile::TempDir,
    root_path: PathBuf,
}

async fn fixture_with(
    config: ServerConfig,
    metadata: Arc<dyn MetadataService>,
    files: &[(&str, &[u8])],
) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    for (rel, content) in files {
        let path = root.path().join(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(&path, content).await.unwrap();
    }
    let database = MemoryDatabase::new();
    let update = UpdateAggregator::new(
        database.clone() as Arc<dyn Database>,
        Arc::new(RecordingSink::default()),
    );
    let config = Arc::new(config);
    let service = ImportService::new(
        Arc::clone(&config),
        database.clone() as Arc<dyn Database>,
        metadata,
        update,
        None,
        root.path().to_path_buf(),
    );
    service.init_layout(Arc::new(BuiltinLayout::new(config)));
    let root_path = root.path().to_path_buf();
    Fixture {
        database,
        service,
        _root: root,
        root_path,
    }
}

#[tokio::test]
async fn audio_import_places_virtual_copies() {
    let stub = StubMetadataService::new();
    stub.set_tags(
        "a.mp3",
        vec![
            (MetadataField::Title, "Song".to_string()),
            (MetadataField::Artist, "X".to_string()),
            (MetadataField::Album, "Y".to_string()),
            (MetadataField::Date, "2020-05-01".to_string()),
            (MetadataField::Genre, "Rock".to_string()),
            (MetadataField::Genre, "Pop".to_string()),
        ],
    );
    let fixture = fixture_with(
        ServerConfig::default(),
        Arc::new(stub),
        &[("m/a.mp3", b"audio")],
    )
    .await;

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();

    // physical mirror
    let item_path = fixture.root_path.join("m/a.mp3");
    let item = fixture
        .database
        .find_object_by_path(&item_path, DEFAULT_CLIENT_GROUP, DbFileType::File)
        .await
        .unwrap()
        .expect("physical item");
    assert_eq!(item.upnp_class(), UPNP_CLASS_MUSIC_TRACK);
    assert_eq!(item.title(), "Song");
    let dir = fixture
        .database
        .find_object_by_path(
            &fixture.root_path.join("m"),
            DEFAULT_CLIENT_GROUP,
            DbFileType::Directory,
        )
        .await
        .unwrap();
    assert!(dir.is_some(), "physical container for m/");

    // virtual placements from the builtin layout
    for expected in [
        "/Audio/All Audio",
        "/Audio/Artists/X/All Songs",
        "/Audio/Artists/X/Y",
        "/Audio/Albums/Y",
        "/Audio/Genres/Rock",
        "/Audio/Genres/Pop",
        "/Audio/Year/2020",
        "/Audio/Directories/m",
    ] {
        let id = fixture
            .database
            .virtual_container_id(expected)
            .unwrap_or_else(|| panic!("missing virtual container {expected}"));
        let children = fixture.database.children_of(id);
        assert!(
            children
                .iter()
                .any(|child| child.is_item() && child.ref_id() == item.id()),
            "no referencing item under {expected}"
        );
    }

    // virtual copies reference the real object and expose its resources
    let album_id = fixture.database.virtual_container_id("/Audio/Albums/Y").unwrap();
    let copy = fixture
        .database
        .children_of(album_id)
        .into_iter()
        .find(|child| child.is_item())
        .unwrap();
    assert!(copy.core().is_virtual);
    assert!(copy.core().flag(OBJECT_FLAG_USE_RESOURCE_REF));
    assert_eq!(copy.ref_id(), item.id());
}

#[tokio::test]
async fn import_is_idempotent_for_unchanged_trees() {
    let stub = StubMetadataService::new();
    stub.set_tags(
        "a.mp3",
        vec![
            (MetadataField::Artist, "X".to_string()),
            (MetadataField::Album, "Y".to_string()),
        ],
    );
    let fixture = fixture_with(
        ServerConfig::default(),
        Arc::new(stub),
        &[("m/a.mp3", b"audio")],
    )
    .await;

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();
    let after_first = fixture.database.object_count();

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();
    assert_eq!(
        fixture.database.object_count(),
        after_first,
        "re-import created objects"
    );
}

#[tokio::test]
async fn rescan_reconciliation_reports_deleted_children() {
    let fixture = fixture_with(
        ServerConfig::default(),
        Arc::new(StubMetadataService::new()),
        &[("m/a.mp3", b"audio"), ("m/b.mp3", b"audio")],
    )
    .await;

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();

    let b_path = fixture.root_path.join("m/b.mp3");
    let b_id = fixture
        .database
        .find_object_id_by_path(&b_path, DbFileType::File)
        .await
        .unwrap()
        .unwrap();
    tokio::fs::remove_file(&b_path).await.unwrap();

    // the caller hands in the known children; whatever the import leaves in
    // the set is stale and must be deleted
    let dir_id = fixture
        .database
        .find_object_id_by_path(&fixture.root_path.join("m"), DbFileType::Directory)
        .await
        .unwrap()
        .unwrap();
    let mut current = fixture.database.get_objects(dir_id, false).await.unwrap();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();

    assert_eq!(current.len(), 1);
    assert!(current.contains(&b_id));
}

#[tokio::test]
async fn nomedia_marker_hides_the_directory() {
    let fixture = fixture_with(
        ServerConfig::default(),
        Arc::new(StubMetadataService::new()),
        &[
            ("visible/a.mp3", b"audio"),
            ("skipped/b.mp3", b"audio"),
            ("skipped/.nomedia", b""),
        ],
    )
    .await;

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();

    assert!(fixture
        .database
        .find_object_id_by_path(&fixture.root_path.join("visible/a.mp3"), DbFileType::File)
        .await
        .unwrap()
        .is_some());
    assert!(fixture
        .database
        .find_object_id_by_path(&fixture.root_path.join("skipped/b.mp3"), DbFileType::File)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn hidden_files_are_skipped_unless_configured() {
    let fixture = fixture_with(
        ServerConfig::default(),
        Arc::new(StubMetadataService::new()),
        &[(".hidden.mp3", b"audio"), ("plain.mp3", b"audio")],
    )
    .await;

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();
    assert!(fixture
        .database
        .find_object_id_by_path(&fixture.root_path.join(".hidden.mp3"), DbFileType::File)
        .await
        .unwrap()
        .is_none());
    assert!(fixture
        .database
        .find_object_id_by_path(&fixture.root_path.join("plain.mp3"), DbFileType::File)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn readable_names_replace_inner_underscores() {
    let fixture = fixture_with(
        ServerConfig::default(),
        Arc::new(StubMetadataService::new()),
        &[("My_Cool_Song.mp3", b"audio")],
    )
    .await;

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();

    let item = fixture
        .database
        .find_object_by_path(
            &fixture.root_path.join("My_Cool_Song.mp3"),
            DEFAULT_CLIENT_GROUP,
            DbFileType::File,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.title(), "My Cool Song");
}

#[tokio::test]
async fn container_tree_creation_is_idempotent() {
    let fixture = fixture_with(
        ServerConfig::default(),
        Arc::new(StubMetadataService::new()),
        &[],
    )
    .await;

    let chain = || {
        vec![
            mediatheca::object::CdsContainer::with_title(
                "Audio",
                mediatheca::object::UPNP_CLASS_CONTAINER,
            ),
            mediatheca::object::CdsContainer::with_title(
                "Albums",
                mediatheca::object::UPNP_CLASS_CONTAINER,
            ),
            mediatheca::object::CdsContainer::with_title(
                "Greatest Hits",
                mediatheca::object::UPNP_CLASS_MUSIC_ALBUM,
            ),
        ]
    };

    let mut created = Vec::new();
    let (first_id, first_new) = fixture
        .service
        .add_container_tree(
            mediatheca::object::ROOT_OBJECT_ID,
            chain(),
            None,
            &mut created,
        )
        .await
        .unwrap();
    assert!(first_new);
    assert!(!created.is_empty());

    let mut created_again = Vec::new();
    let (second_id, second_new) = fixture
        .service
        .add_container_tree(
            mediatheca::object::ROOT_OBJECT_ID,
            chain(),
            None,
            &mut created_again,
        )
        .await
        .unwrap();
    assert_eq!(first_id, second_id);
    assert!(!second_new);
    assert!(created_again.is_empty(), "re-run must be a no-op");
}

#[tokio::test]
async fn fanart_from_sidecar_image_is_assigned_once() {
    let fixture = fixture_with(
        ServerConfig::default(),
        Arc::new(StubMetadataService::new()),
        &[("album/track.mp3", b"audio"), ("album/folder.jpg", b"img")],
    )
    .await;

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();

    let container = fixture
        .database
        .find_object_by_path(
            &fixture.root_path.join("album"),
            DEFAULT_CLIENT_GROUP,
            DbFileType::Directory,
        )
        .await
        .unwrap()
        .unwrap();
    let art = container
        .core()
        .resource_by_purpose(mediatheca::object::ResourcePurpose::Thumbnail)
        .expect("container art");
    assert_eq!(
        art.handler_type(),
        mediatheca::object::ContentHandlerType::ContainerArt
    );
    assert!(art
        .attribute(mediatheca::object::ResourceAttribute::ResourceFile)
        .unwrap()
        .ends_with("folder.jpg"));
}

#[tokio::test]
async fn virtual_directory_keys_disambiguate_same_titles() {
    let stub = StubMetadataService::new();
    stub.set_tags(
        "a.mp3",
        vec![
            (MetadataField::Artist, "ArtistOne".to_string()),
            (MetadataField::Album, "Greatest Hits".to_string()),
        ],
    );
    stub.set_tags(
        "b.mp3",
        vec![
            (MetadataField::Artist, "ArtistTwo".to_string()),
            (MetadataField::Album, "Greatest Hits".to_string()),
        ],
    );
    let mut config = ServerConfig::default();
    config.import.virtual_directory_keys = vec![mediatheca::config::VirtualDirectoryKey {
        upnp_class: mediatheca::object::UPNP_CLASS_MUSIC_ALBUM.to_string(),
        field: "upnp:artist".to_string(),
    }];
    let fixture = fixture_with(
        config,
        Arc::new(stub),
        &[("one/a.mp3", b"audio"), ("two/b.mp3", b"audio")],
    )
    .await;

    let mut current = HashSet::new();
    fixture
        .service
        .do_import(&fixture.root_path, &settings_recursive(), &mut current, None)
        .await
        .unwrap();

    // the two albums share a title but land in distinct containers; the
    // disambiguated keys carry the artist value
    let state_albums: Vec<CdsObject> = fixture
        .database
        .children_of(
            fixture
                .database
                .virtual_container_id("/Audio/Albums")
                .expect("albums axis"),
        )
        .into_iter()
        .filter(|object| object.is_container())
        .collect();
    assert_eq!(
        state_albums.len(),
        2,
        "expected one album container per artist"
    );
}
