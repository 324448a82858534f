//! Integration tests for atlas-graph: end-to-end composition and editing.
//!
//! These tests validate the pipeline across modules:
//! 1. Files on disk → load_all / MultiAtlas
//! 2. Border stitching of shards
//! 3. On-demand shard loading
//! 4. Concurrent edits → merged change → overlay view → materialized atlas
//! 5. Diffing

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use atlas_graph::{
    load_all, multi_from_paths, same_contents, Atlas, AtlasConfig, AtlasDiff, AtlasError,
    AtlasMetadata, BorderConflictPolicy, BuildConfig, ChangeAtlas, ChangeBuilder, ChangeError,
    CompleteEdge, CompleteNode, CompletePoint, CompleteRelation, Compression, DynamicAtlas, DynamicAtlasPolicy,
    FeatureChange, IntegrityError, ItemType, LoadErrorKind, Location, MergeFailureType, MultiAtlas, PackedAtlas,
    PackedAtlasBuilder, PolyLine, Rectangle, RelationMember, Shard, SlippyTile,
    SlippyTileSharding, Tags,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Route library logs to the test output; `RUST_LOG=atlas_graph=debug` shows loads and merges.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "atlas_graph=warn".into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_test_writer())
        .try_init();
}

fn at(lat: f64, lon: f64) -> Location {
    Location::from_degrees(lat, lon)
}

/// Fresh scratch directory unique to this process and test.
fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("atlas-graph-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn add_road(builder: &mut PackedAtlasBuilder, id: i64, from: (i64, Location), to: (i64, Location), kind: &str) {
    let shape = PolyLine::new(vec![from.1, to.1]);
    builder
        .add_edge(id, shape.clone(), tags(&[("highway", kind)]), from.0, to.0)
        .unwrap();
    builder
        .add_edge(-id, shape.reversed(), tags(&[("highway", kind)]), to.0, from.0)
        .unwrap();
}

/// A road chain 1 → 2 → 3 → 4 split over two shards at node 2 and 3.
///
/// The west shard holds edges 12 and 23, the east shard edges 23 and 34.
fn chain_shards() -> (PackedAtlas, PackedAtlas) {
    let nodes = [
        (1, at(48.30, 10.90)),
        (2, at(48.30, 11.00)),
        (3, at(48.30, 11.10)),
        (4, at(48.30, 11.20)),
    ];

    let mut west = PackedAtlasBuilder::new().with_metadata(AtlasMetadata::default().with_shard_name("west"));
    for &(id, location) in &nodes[..3] {
        west.add_node(id, location, Tags::new()).unwrap();
    }
    add_road(&mut west, 12, nodes[0], nodes[1], "primary");
    add_road(&mut west, 23, nodes[1], nodes[2], "primary");
    west.add_relation(100, tags(&[("type", "route")]), vec![RelationMember::new(ItemType::Edge, 12, "")])
        .unwrap();

    let mut east = PackedAtlasBuilder::new().with_metadata(AtlasMetadata::default().with_shard_name("east"));
    for &(id, location) in &nodes[1..] {
        east.add_node(id, location, Tags::new()).unwrap();
    }
    add_road(&mut east, 23, nodes[1], nodes[2], "primary");
    add_road(&mut east, 34, nodes[2], nodes[3], "secondary");
    east.add_relation(100, tags(&[("type", "route")]), vec![RelationMember::new(ItemType::Edge, 34, "")])
        .unwrap();

    (west.build().unwrap(), east.build().unwrap())
}

fn town() -> PackedAtlas {
    let mut builder = PackedAtlasBuilder::new();
    builder.add_node(1, at(48.37, 10.89), Tags::new()).unwrap();
    builder.add_node(2, at(48.37, 10.90), tags(&[("highway", "crossing")])).unwrap();
    builder.add_node(3, at(48.38, 10.90), Tags::new()).unwrap();
    add_road(&mut builder, 12, (1, at(48.37, 10.89)), (2, at(48.37, 10.90)), "residential");
    add_road(&mut builder, 23, (2, at(48.37, 10.90)), (3, at(48.38, 10.90)), "residential");
    builder
        .add_point(50, at(48.371, 10.895), tags(&[("amenity", "cafe"), ("name", "Eck")]))
        .unwrap();
    builder
        .add_relation(70, tags(&[("type", "street")]), vec![
            RelationMember::new(ItemType::Edge, 12, "street"),
            RelationMember::new(ItemType::Point, 50, "house"),
        ])
        .unwrap();
    builder.build().unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// MultiAtlas
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_multi_over_single_atlas_is_identity() {
    let atlas = town();
    let multi = MultiAtlas::new(vec![Arc::new(atlas.clone()) as Arc<dyn Atlas>]);
    assert!(same_contents(&multi, &atlas));
    assert_eq!(multi.bounds(), atlas.bounds());
}

#[test]
fn test_multi_stitches_edge_chain() {
    init_tracing();
    let (west, east) = chain_shards();
    let multi = MultiAtlas::new(vec![Arc::new(west) as Arc<dyn Atlas>, Arc::new(east)]);

    assert_eq!(multi.identifiers(ItemType::Node), vec![1, 2, 3, 4]);
    assert_eq!(multi.identifiers(ItemType::Edge), vec![-34, -23, -12, 12, 23, 34]);

    // Walk the main edges from node 1 to node 4.
    let mut node = multi.node(1).unwrap();
    let mut path = vec![node.identifier];
    loop {
        let next = node.out_edges.iter().filter(|&&e| e > 0).find_map(|&e| multi.edge(e));
        let Some(next) = next else { break };
        node = multi.end_node(&next).unwrap();
        path.push(node.identifier);
    }
    assert_eq!(path, vec![1, 2, 3, 4]);

    let border = multi.node(3).unwrap();
    assert_eq!(border.connected_edges(), [-34, -23, 23, 34].into_iter().collect());

    let route = multi.relation(100).unwrap();
    let members: Vec<_> = route.members.iter().map(|m| m.identifier).collect();
    assert_eq!(members, vec![12, 34]);
    assert_eq!(multi.metadata().shard_name, None);
}

#[test]
fn test_multi_spatial_query_spans_shards() {
    let (west, east) = chain_shards();
    let multi = MultiAtlas::new(vec![Arc::new(west) as Arc<dyn Atlas>, Arc::new(east)]);
    let window = Rectangle::new(at(48.29, 11.05), at(48.31, 11.15));
    assert_eq!(multi.identifiers_intersecting(ItemType::Node, &window), vec![3]);
    assert_eq!(multi.identifiers_intersecting(ItemType::Edge, &window), vec![-34, -23, 23, 34]);
}

#[test]
fn test_multi_conflict_callback_sees_border_conflict() {
    let mut west = PackedAtlasBuilder::new();
    west.add_point(9, at(48.0, 11.0), Tags::new()).unwrap();
    let mut east = PackedAtlasBuilder::new();
    east.add_point(9, at(48.0, 11.001), Tags::new()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let multi = MultiAtlas::new(vec![
        Arc::new(west.build().unwrap()) as Arc<dyn Atlas>,
        Arc::new(east.build().unwrap()),
    ])
    .with_conflict_callback(move |conflict| sink.lock().unwrap().push(conflict.clone()));

    assert_eq!(multi.point(9).unwrap().location, at(48.0, 11.0));
    let conflicts = seen.lock().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].item_type, ItemType::Point);
    assert_eq!(conflicts[0].sources, vec![0, 1]);
    assert_eq!(conflicts[0].policy, BorderConflictPolicy::FirstSource);
}

// ─────────────────────────────────────────────────────────────────────────────
// Files
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_load_all_mixed_formats() {
    init_tracing();
    let dir = scratch_dir("load-all");
    let (west, east) = chain_shards();
    let west_path = dir.join("west.atlas");
    let east_path = dir.join("east.txt");
    let broken_path = dir.join("broken.atlas");
    west.save_path(&west_path, Compression::gzip()).unwrap();
    east.save_text_path(&east_path).unwrap();
    std::fs::write(&broken_path, b"ATLS\x01").unwrap();

    let (atlases, errors) = load_all([&west_path, &east_path, &broken_path, &dir.join("missing")], &AtlasConfig::default());
    assert_eq!(atlases.len(), 2);
    assert_eq!(atlases[0], west);
    assert_eq!(atlases[1], east);
    assert_eq!(errors.len(), 2);
    assert!(matches!(errors[0].kind, LoadErrorKind::BadMagic));
    assert!(matches!(errors[1].kind, LoadErrorKind::Io(_)));
    assert!(errors[0].resource.ends_with("broken.atlas"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_multi_from_paths_uses_config() {
    init_tracing();
    let dir = scratch_dir("multi-from-paths");
    let mut first = PackedAtlasBuilder::new();
    first.add_point(1, at(10.0, 10.0), Tags::new()).unwrap();
    let mut second = PackedAtlasBuilder::new();
    second.add_point(1, at(10.0, 10.5), Tags::new()).unwrap();
    first.build().unwrap().save_path(dir.join("a.atlas"), Compression::None).unwrap();
    second.build().unwrap().save_path(dir.join("b.atlas"), Compression::None).unwrap();

    let config = AtlasConfig::from_json(r#"{"multi": {"border_conflict_policy": "last_source"}}"#).unwrap();
    let (multi, errors) = multi_from_paths([dir.join("a.atlas"), dir.join("b.atlas")], &config);
    assert!(errors.is_empty());
    assert_eq!(multi.policy(), BorderConflictPolicy::LastSource);
    assert_eq!(multi.point(1).unwrap().location, at(10.0, 10.5));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_codec_config_drives_save_and_load() {
    init_tracing();
    let dir = scratch_dir("codec-config");
    let atlas = town();
    let config = AtlasConfig::from_json(r#"{"codec": {"compression": {"kind": "gzip", "level": 9}}}"#).unwrap();
    let path = dir.join("town.atlas");
    atlas.save_path_with_config(&path, &config.codec).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes[6] & 1, 1);
    assert_eq!(PackedAtlas::load_path_with_config(&path, &config).unwrap(), atlas);

    let tight = config.with_overrides_from(|name| (name == "ATLAS_MAX_PAYLOAD_BYTES").then(|| "64".to_string())).unwrap();
    let (atlases, errors) = load_all([&path], &tight);
    assert!(atlases.is_empty());
    assert!(matches!(errors[0].kind, LoadErrorKind::Corrupt(_)));

    let _ = std::fs::remove_dir_all(&dir);
}

// ─────────────────────────────────────────────────────────────────────────────
// DynamicAtlas
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_dynamic_atlas_loads_neighbor_tile_from_disk() {
    init_tracing();
    let dir = scratch_dir("dynamic");
    let sharding = SlippyTileSharding::new(9);
    let home = SlippyTile::containing(&at(48.37, 10.90), 9);
    assert_eq!(home.name(), "9-271-177");

    // Node 2 sits east of the tile boundary at 11.25°.
    let mut inside = PackedAtlasBuilder::new();
    inside.add_node(1, at(48.30, 11.20), Tags::new()).unwrap();
    inside.add_node(2, at(48.30, 11.30), Tags::new()).unwrap();
    add_road(&mut inside, 5, (1, at(48.30, 11.20)), (2, at(48.30, 11.30)), "primary");
    inside.build().unwrap().save_path(dir.join("9-271-177.atlas"), Compression::gzip()).unwrap();

    let mut outside = PackedAtlasBuilder::new();
    outside.add_node(2, at(48.30, 11.30), Tags::new()).unwrap();
    outside.add_node(3, at(48.30, 11.40), Tags::new()).unwrap();
    add_road(&mut outside, 6, (2, at(48.30, 11.30)), (3, at(48.30, 11.40)), "primary");
    outside.build().unwrap().save_path(dir.join("9-272-177.atlas"), Compression::gzip()).unwrap();

    let root = dir.clone();
    let fetcher = move |shard: &Shard| -> Result<Option<Arc<dyn Atlas>>, AtlasError> {
        let path = root.join(format!("{}.atlas", shard.name()));
        if !path.exists() {
            return Ok(None);
        }
        let atlas = PackedAtlas::load_path(&path, &BuildConfig::default())?;
        Ok(Some(Arc::new(atlas) as Arc<dyn Atlas>))
    };
    let policy = DynamicAtlasPolicy::new([home.to_shard()], Rectangle::world().to_polygon());
    let dynamic = DynamicAtlas::new(Arc::new(sharding), fetcher, policy);

    let road = dynamic.edge(5).unwrap();
    assert_eq!(road.end_node, 2);
    let loaded: Vec<_> = dynamic.loaded_shards().iter().map(|s| s.name().to_string()).collect();
    assert!(loaded.contains(&"9-272-177".to_string()));
    assert!(dynamic.node(2).unwrap().out_edges.contains(&6));
    assert_eq!(dynamic.sharding().shard("9-272-177").map(|s| s.name().to_string()), Some("9-272-177".to_string()));

    let _ = std::fs::remove_dir_all(&dir);
}

// ─────────────────────────────────────────────────────────────────────────────
// Changes
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_concurrent_edits_merge_and_apply() {
    init_tracing();
    let base = town();

    // Editor A renames the cafe; editor B retags it and extends the street.
    let rename = FeatureChange::add(
        CompletePoint::shallow(50).with_tags(tags(&[("amenity", "cafe"), ("name", "Eckcafe")])),
    )
    .with_atlas_context(&base);
    let retag = FeatureChange::add(
        CompletePoint::shallow(50).with_tags(tags(&[("amenity", "restaurant"), ("name", "Eck")])),
    )
    .with_atlas_context(&base);
    let new_node = FeatureChange::add(
        CompleteNode::shallow(4)
            .with_location(at(48.38, 10.91))
            .with_tags(Tags::new()),
    );
    let new_edge = FeatureChange::add(
        CompleteEdge::shallow(34)
            .with_polyline(PolyLine::new(vec![at(48.38, 10.90), at(48.38, 10.91)]))
            .with_tags(tags(&[("highway", "residential")]))
            .with_nodes(3, 4),
    );

    let mut editor_a = ChangeBuilder::new().with_name("editor-a");
    editor_a.add(rename).unwrap();
    let mut editor_b = ChangeBuilder::new().with_name("editor-b");
    editor_b.add_all([retag, new_node, new_edge]).unwrap();

    let merged = editor_a.build().unwrap().merge(&editor_b.build().unwrap()).unwrap();
    assert_eq!(merged.len(), 3);

    let view = ChangeAtlas::new(&base, &merged).unwrap();
    assert_eq!(
        view.point(50).unwrap().tags,
        tags(&[("amenity", "restaurant"), ("name", "Eckcafe")])
    );
    assert!(view.node(3).unwrap().out_edges.contains(&34));
    assert_eq!(view.edges_of_node(4).len(), 1);

    // The view materializes into a regular atlas.
    let materialized = PackedAtlasBuilder::from_atlas(&view, BuildConfig::default()).unwrap();
    assert!(same_contents(&materialized, &view));
    let reloaded = PackedAtlas::from_bytes(&materialized.to_bytes(Compression::gzip()).unwrap()).unwrap();
    assert_eq!(reloaded, materialized);
}

#[test]
fn test_conflicting_edits_name_the_key() {
    let base = town();
    let one = FeatureChange::add(CompletePoint::shallow(50).with_tags(tags(&[("amenity", "cafe"), ("name", "Eins")])))
        .with_atlas_context(&base);
    let two = FeatureChange::add(CompletePoint::shallow(50).with_tags(tags(&[("amenity", "cafe"), ("name", "Zwei")])))
        .with_atlas_context(&base);

    let mut builder = ChangeBuilder::new();
    builder.add(one).unwrap();
    match builder.add(two) {
        Err(ChangeError::Merge(error)) => {
            assert_eq!(error.root_cause(), MergeFailureType::ConsistentBeforeViewStrategyFailed);
            assert_eq!(error.failure_types.last(), Some(&MergeFailureType::HighestLevelMergeFailure));
            assert!(error.message.contains("name"));
            assert!(error.message.contains("Eins") && error.message.contains("Zwei"));
        }
        other => panic!("expected merge conflict, got {other:?}"),
    }
}

#[test]
fn test_remove_and_add_of_same_entity_conflicts() {
    let base = town();
    let mut builder = ChangeBuilder::new();
    builder
        .add(FeatureChange::remove_identifier(ItemType::Point, 50).with_atlas_context(&base))
        .unwrap();
    let error = builder
        .add(FeatureChange::add(CompletePoint::shallow(50).with_tags(Tags::new())))
        .unwrap_err();
    assert!(matches!(error, ChangeError::Merge(e) if e.field == "change_type"));
}

#[test]
fn test_change_json_survives_round_trip_into_overlay() {
    let base = town();
    let mut builder = ChangeBuilder::new().with_name("json");
    builder
        .add(FeatureChange::remove_identifier(ItemType::Relation, 70).with_atlas_context(&base))
        .unwrap();
    builder
        .add(FeatureChange::remove_identifier(ItemType::Point, 50).with_atlas_context(&base))
        .unwrap();
    let change = builder.build().unwrap();

    let decoded = atlas_graph::Change::from_json(&change.to_json().unwrap()).unwrap();
    assert_eq!(decoded.fingerprint().unwrap(), change.fingerprint().unwrap());
    let view = ChangeAtlas::new(&base, &decoded).unwrap();
    assert!(view.point(50).is_none());
    assert!(view.relations_with_member(ItemType::Edge, 12).is_empty());
}

#[test]
fn test_member_edits_from_different_snapshots() {
    let base = town();
    let member = |item_type, id, role: &str| RelationMember::new(item_type, id, role);
    let street = |members: Vec<RelationMember>| CompleteRelation::shallow(70).with_members(members);

    // Editor A saw the current relation; editor B an older one without the cafe.
    let extend = FeatureChange::add(street(vec![
        member(ItemType::Edge, 12, "street"),
        member(ItemType::Point, 50, "house"),
        member(ItemType::Edge, 23, "street"),
    ]))
    .with_atlas_context(&base);
    let reverse = FeatureChange::add(street(vec![
        member(ItemType::Edge, 12, "street"),
        member(ItemType::Edge, -12, "street"),
    ]))
    .with_before_view(street(vec![member(ItemType::Edge, 12, "street")]));

    let merged = extend.merge(&reverse).unwrap();
    assert_eq!(merged, reverse.merge(&extend).unwrap());

    let mut builder = ChangeBuilder::new();
    builder.add(merged).unwrap();
    let change = builder.build().unwrap();
    let view = ChangeAtlas::new(&base, &change).unwrap();
    assert_eq!(
        view.relation(70).unwrap().members,
        vec![
            member(ItemType::Edge, 12, "street"),
            member(ItemType::Point, 50, "house"),
            member(ItemType::Edge, -12, "street"),
            member(ItemType::Edge, 23, "street"),
        ]
    );
    assert!(view.relations_with_member(ItemType::Point, 50).contains(&70));
}

#[test]
fn test_overlay_rejects_node_edges_that_disagree_with_view() {
    let base = town();
    let mut builder = ChangeBuilder::new();
    builder
        .add(FeatureChange::add(CompleteNode::shallow(1).with_out_edges(BTreeSet::new()).with_in_edges([777])))
        .unwrap();
    let change = builder.build().unwrap();
    assert!(matches!(
        ChangeAtlas::new(&base, &change),
        Err(ChangeError::InvalidOverlay(IntegrityError::InconsistentEdgeSet(1, _)))
    ));

    // Listing exactly the attached edges is accepted.
    let mut builder = ChangeBuilder::new();
    builder
        .add(FeatureChange::add(
            CompleteNode::shallow(1).with_in_edges([-12]).with_out_edges([12]),
        ))
        .unwrap();
    let change = builder.build().unwrap();
    let view = ChangeAtlas::new(&base, &change).unwrap();
    assert_eq!(view.node(1).unwrap().out_edges, [12].into_iter().collect());
}

// ─────────────────────────────────────────────────────────────────────────────
// Diff
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_diff_inverse_over_shards() {
    let (west, east) = chain_shards();
    let stitched = MultiAtlas::new(vec![Arc::new(west.clone()) as Arc<dyn Atlas>, Arc::new(east)]);
    let after = PackedAtlasBuilder::from_atlas(&stitched, BuildConfig::default()).unwrap();

    let diff = AtlasDiff::new(&west, &after).generate_change().unwrap();
    assert!(diff.get(ItemType::Node, 4).is_some());
    assert!(diff.get(ItemType::Node, 1).is_none());

    let applied = ChangeAtlas::new(&west, &diff).unwrap();
    assert!(AtlasDiff::new(&applied, &after).generate_change().is_none());
}
