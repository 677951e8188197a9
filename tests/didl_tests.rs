mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::MemoryDatabase;
use mediatheca::config::ServerConfig;
use mediatheca::database::Database;
use mediatheca::didl::transcoding::{TranscodingFilter, TranscodingProfile};
use mediatheca::didl::{ClientQuirks, DidlRenderer};
use mediatheca::object::{
    CdsContainer, CdsItem, CdsObject, ContentHandlerType, MetadataField, PlayStatus, Resource,
    ResourceAttribute, ResourcePurpose, UPNP_CLASS_MUSIC_ALBUM, UPNP_CLASS_MUSIC_TRACK,
};

const BASE: &str = "http://server";

fn renderer(config: ServerConfig, database: Arc<MemoryDatabase>) -> DidlRenderer {
    DidlRenderer::new(Arc::new(config), database as Arc<dyn Database>, BASE)
}

fn music_item() -> CdsItem {
    let mut item = CdsItem::new();
    item.core.id = 5;
    item.core.parent_id = 3;
    item.core.title = "Song".to_string();
    item.core.upnp_class = UPNP_CLASS_MUSIC_TRACK.to_string();
    item.core.location = PathBuf::from("/m/a.mp3");
    item.core.mtime = 1_588_291_200; // 2020-05-01
    item.mime_type = "audio/mpeg".to_string();
    let mut res = Resource::new(ContentHandlerType::Default, ResourcePurpose::Content);
    res.set_attribute(ResourceAttribute::ProtocolInfo, "http-get:*:audio/mpeg:*");
    res.set_attribute(ResourceAttribute::Size, "1024");
    res.set_attribute(ResourceAttribute::Duration, "0:03:25");
    item.core.add_resource(res);
    item
}

#[tokio::test]
async fn container_with_fanart_renders_album_art_and_date() {
    let database = MemoryDatabase::new();
    let mut container = CdsContainer::with_title("Album", UPNP_CLASS_MUSIC_ALBUM);
    container.core.id = 1;
    container.core.parent_id = 2;
    container.core.mtime = 1_588_291_200;
    container.child_count = -1;
    let mut art = Resource::new(ContentHandlerType::ContainerArt, ResourcePurpose::Thumbnail);
    art.set_attribute(ResourceAttribute::ResourceFile, "/x/cover.jpg");
    art.set_attribute(ResourceAttribute::ProtocolInfo, "http-get:*:image/jpeg:*");
    container.core.add_resource(art);

    let renderer = renderer(ServerConfig::default(), database);
    let xml = renderer
        .render_object(&CdsObject::Container(container), None)
        .await
        .unwrap();

    assert!(xml.starts_with("<container"));
    assert!(xml.contains(r#"id="1""#));
    assert!(xml.contains(r#"parentID="2""#));
    assert!(
        xml.contains(&format!(
            "<upnp:albumArtURI>{BASE}/content/media/object_id/1/res_id/0/ext/file.jpg</upnp:albumArtURI>"
        )),
        "unexpected albumArtURI in {xml}"
    );
    assert!(xml.contains("<dc:date>2020-05-01"), "missing dc:date in {xml}");
    // childCount == -1 means unknown and must not be rendered
    assert!(!xml.contains("childCount"));
}

#[tokio::test]
async fn known_child_count_is_rendered() {
    let database = MemoryDatabase::new();
    let mut container = CdsContainer::with_title("Album", UPNP_CLASS_MUSIC_ALBUM);
    container.core.id = 7;
    container.core.parent_id = 2;
    container.child_count = 12;
    let renderer = renderer(ServerConfig::default(), database);
    let xml = renderer
        .render_object(&CdsObject::Container(container), None)
        .await
        .unwrap();
    assert!(xml.contains(r#"childCount="12""#));
}

#[tokio::test]
async fn fanart_reference_chain_resolves_through_items() {
    let database = MemoryDatabase::new();

    // the donor item owns the actual image resource
    let mut donor = music_item();
    donor.core.id = 0; // assigned by add_object
    let mut thumb = Resource::new(ContentHandlerType::FanArt, ResourcePurpose::Thumbnail);
    thumb.set_attribute(ResourceAttribute::ProtocolInfo, "http-get:*:image/jpeg:*");
    donor.core.add_resource(thumb);
    let mut donor_object = CdsObject::Item(donor);
    database.add_object(&mut donor_object).await.unwrap();
    let donor_id = donor_object.id();

    let mut container = CdsContainer::with_title("Album", UPNP_CLASS_MUSIC_ALBUM);
    container.core.id = 1;
    container.core.parent_id = 2;
    let mut art = Resource::new(ContentHandlerType::FanArt, ResourcePurpose::Thumbnail);
    art.set_attribute(ResourceAttribute::FanArtObjId, donor_id.to_string());
    art.set_attribute(ResourceAttribute::FanArtResId, "1");
    art.set_attribute(ResourceAttribute::ProtocolInfo, "http-get:*:image/jpeg:*");
    container.core.add_resource(art);

    let renderer = renderer(ServerConfig::default(), database);
    let xml = renderer
        .render_object(&CdsObject::Container(container), None)
        .await
        .unwrap();
    assert!(
        xml.contains(&format!(
            "{BASE}/content/media/object_id/{donor_id}/res_id/1"
        )),
        "fanart URL should point at the donor item: {xml}"
    );
}

#[tokio::test]
async fn protocol_info_round_trips_mime_and_profile() {
    let database = MemoryDatabase::new();
    let renderer = renderer(ServerConfig::default(), database);
    let xml = renderer
        .render_object(&CdsObject::Item(music_item()), None)
        .await
        .unwrap();

    let start = xml.find("protocolInfo=\"").unwrap() + "protocolInfo=\"".len();
    let end = xml[start..].find('"').unwrap() + start;
    let protocol_info = &xml[start..end];

    let fields: Vec<&str> = protocol_info.split(':').collect();
    assert_eq!(fields[0], "http-get");
    assert_eq!(fields[1], "*");
    assert_eq!(fields[2], "audio/mpeg");
    let dlna = fields[3];
    assert!(dlna.starts_with("DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS="));
    assert!(dlna.ends_with(";DLNA.ORG_PN=MP3"), "profile missing: {dlna}");
}

#[tokio::test]
async fn transcoded_resource_is_prepended_and_marked() {
    let mut config = ServerConfig::default();
    config.transcoding.profiles = vec![TranscodingFilter {
        mime_type: "audio/*".to_string(),
        profile: TranscodingProfile {
            name: "tmp3".to_string(),
            target_mime: "audio/mpeg".to_string(),
            first_resource: true,
            sample_frequency: mediatheca::didl::PARAM_OFF,
            num_channels: mediatheca::didl::PARAM_OFF,
            ..Default::default()
        },
        ..Default::default()
    }];
    let database = MemoryDatabase::new();
    let renderer = renderer(config, database);

    let xml = renderer
        .render_object(&CdsObject::Item(music_item()), None)
        .await
        .unwrap();

    let first_res = xml.find("<res ").expect("a res tag");
    let transcode_pos = xml.find("/res_id/tr").expect("transcoded URL");
    let original_pos = xml.find("/res_id/0").expect("original URL");
    assert!(
        transcode_pos < original_pos,
        "transcoded res must come first: {xml}"
    );
    assert!(xml[first_res..].contains("pr_name=tmp3&amp;transcode=1"));
    // transcodes are never seekable and always converted
    assert!(xml.contains("DLNA.ORG_OP=00;DLNA.ORG_CI=1"));
    // duration carries over from the source resource
    let transcoded_res = &xml[first_res..xml[first_res..].find("</res>").unwrap() + first_res];
    assert!(transcoded_res.contains("duration=\"0:03:25\""));
}

#[tokio::test]
async fn hidden_original_is_omitted() {
    let mut config = ServerConfig::default();
    config.transcoding.profiles = vec![TranscodingFilter {
        mime_type: "audio/*".to_string(),
        profile: TranscodingProfile {
            name: "only".to_string(),
            target_mime: "audio/L16".to_string(),
            hide_original: true,
            sample_frequency: mediatheca::didl::PARAM_OFF,
            num_channels: mediatheca::didl::PARAM_OFF,
            ..Default::default()
        },
        ..Default::default()
    }];
    let database = MemoryDatabase::new();
    let renderer = renderer(config, database);
    let xml = renderer
        .render_object(&CdsObject::Item(music_item()), None)
        .await
        .unwrap();
    assert!(xml.contains("/res_id/tr"));
    assert!(!xml.contains("/res_id/0/"), "original should be hidden: {xml}");
}

#[tokio::test]
async fn empty_metadata_values_are_never_emitted() {
    let database = MemoryDatabase::new();
    let mut item = music_item();
    item.core.add_meta(MetadataField::Genre, "");
    item.core.add_meta(MetadataField::Artist, "X");
    let renderer = renderer(ServerConfig::default(), database);
    let xml = renderer
        .render_object(&CdsObject::Item(item), None)
        .await
        .unwrap();
    assert!(!xml.contains("upnp:genre"));
    assert!(xml.contains("<upnp:artist>X</upnp:artist>"));
}

#[tokio::test]
async fn multi_value_mode_renders_one_element_per_value() {
    let database = MemoryDatabase::new();
    let mut item = music_item();
    item.core.add_meta(MetadataField::Genre, "Rock");
    item.core.add_meta(MetadataField::Genre, "Pop");

    let renderer = renderer(ServerConfig::default(), database.clone());
    let xml = renderer
        .render_object(&CdsObject::Item(item.clone()), None)
        .await
        .unwrap();
    assert!(xml.contains("<upnp:genre>Rock</upnp:genre>"));
    assert!(xml.contains("<upnp:genre>Pop</upnp:genre>"));

    let mut config = ServerConfig::default();
    config.upnp.multi_value = false;
    config.upnp.entry_separator = "; ".to_string();
    let renderer = DidlRenderer::new(Arc::new(config), database as Arc<dyn Database>, BASE);
    let xml = renderer
        .render_object(&CdsObject::Item(item), None)
        .await
        .unwrap();
    assert!(xml.contains("<upnp:genre>Rock; Pop</upnp:genre>"));
}

#[tokio::test]
async fn quirks_filter_resource_purposes_and_truncate_titles() {
    let database = MemoryDatabase::new();
    let mut item = music_item();
    item.core.title = "An Extremely Long Title That Needs Truncation".to_string();
    let mut subtitle = Resource::new(ContentHandlerType::Subtitle, ResourcePurpose::Subtitle);
    subtitle.set_attribute(ResourceAttribute::ProtocolInfo, "http-get:*:text/srt:*");
    subtitle.set_attribute(ResourceAttribute::Type, "srt");
    item.core.add_resource(subtitle);

    let quirks = ClientQuirks {
        string_limit: Some(16),
        accepted_purposes: Some(vec![ResourcePurpose::Content]),
        ..Default::default()
    };
    let renderer = renderer(ServerConfig::default(), database);
    let xml = renderer
        .render_object(&CdsObject::Item(item), Some(&quirks))
        .await
        .unwrap();

    assert!(xml.contains("<dc:title>An Extremely ...</dc:title>"), "{xml}");
    // caption metadata is still announced, but no subtitle res is rendered
    assert!(xml.contains("sec:CaptionInfoEx"));
    assert!(!xml.contains("text/srt:DLNA"));
}

#[tokio::test]
async fn samsung_bookmark_is_restored_for_flagged_clients() {
    let database = MemoryDatabase::new();
    let mut item = music_item();
    item.play_status = Some(PlayStatus {
        group: "default".to_string(),
        item_id: item.core.id,
        play_count: 3,
        last_played: 1_588_291_200,
        last_played_position: 95,
        bookmark_position: 0,
    });
    let quirks = ClientQuirks {
        flags: mediatheca::didl::quirk_flags::SAMSUNG_BOOKMARK,
        ..Default::default()
    };
    let renderer = renderer(ServerConfig::default(), database);
    let xml = renderer
        .render_object(&CdsObject::Item(item), Some(&quirks))
        .await
        .unwrap();
    // offset of 10 seconds is subtracted from the stored position
    assert!(xml.contains("BM=85"), "{xml}");
    assert!(xml.contains("<upnp:playbackCount>3</upnp:playbackCount>"));
}

#[tokio::test]
async fn external_items_pass_raw_urls_through() {
    let database = MemoryDatabase::new();
    let mut item = CdsItem::new_external();
    item.core.id = 9;
    item.core.parent_id = 2;
    item.core.title = "Stream".to_string();
    item.core.upnp_class = "object.item.audioItem.audioBroadcast".to_string();
    item.core.location = PathBuf::from("http://radio.example/stream.mp3");
    item.mime_type = "audio/mpeg".to_string();
    let mut res = Resource::new(ContentHandlerType::Default, ResourcePurpose::Content);
    res.set_attribute(ResourceAttribute::ProtocolInfo, "http-get:*:audio/mpeg:*");
    item.core.add_resource(res);

    let renderer = renderer(ServerConfig::default(), database);
    let xml = renderer
        .render_object(&CdsObject::Item(item), None)
        .await
        .unwrap();
    assert!(
        xml.contains(">http://radio.example/stream.mp3</res>"),
        "raw remote URL expected: {xml}"
    );
}
