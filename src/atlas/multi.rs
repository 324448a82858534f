//! MultiAtlas: many atlases presented as one logical graph.
//!
//! Sources are shared, never copied. An identifier present in several
//! sources is stitched on lookup:
//!
//! - nodes union their incoming and outgoing edge sets;
//! - relations union their members in first-seen order;
//! - other variants take one representative copy.
//!
//! Copies are the same entity when their geometry agrees (location, shape,
//! and for edges the endpoints). Disagreement is a [`BorderConflict`]: it is
//! logged, handed to the conflict callback, and resolved by the configured
//! [`BorderConflictPolicy`].

use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::atlas::packed::{load_all, AtlasLoadError};
use crate::atlas::{Atlas, AtlasMetadata};
use crate::config::{AtlasConfig, MultiAtlasConfig};
use crate::types::{
    Area, AtlasEntity, Edge, Identifier, ItemType, Line, Node, Point, Rectangle, Relation,
};

/// How disagreeing copies of a border entity are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderConflictPolicy {
    /// Keep the copy from the earliest source.
    #[default]
    FirstSource,
    /// Keep the copy from the latest source.
    LastSource,
    /// Hide the entity altogether.
    Exclude,
}

impl BorderConflictPolicy {
    /// Parse policy from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "first_source" | "first" => Some(Self::FirstSource),
            "last_source" | "last" => Some(Self::LastSource),
            "exclude" => Some(Self::Exclude),
            _ => None,
        }
    }
}

/// Two or more sources disagree about one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorderConflict {
    /// Variant of the entity.
    pub item_type: ItemType,
    /// Identifier of the entity.
    pub identifier: Identifier,
    /// Indices of every source holding a copy.
    pub sources: Vec<usize>,
    /// Indices of the sources whose copy differs from the kept one.
    pub disagreeing: Vec<usize>,
    /// Policy applied.
    pub policy: BorderConflictPolicy,
}

/// Receives border conflicts as they are found, once per entity.
pub type ConflictCallback = Arc<dyn Fn(&BorderConflict) + Send + Sync>;

type StitchCache = Mutex<LruCache<(ItemType, Identifier), Option<AtlasEntity>>>;

/// Union view over several atlases.
pub struct MultiAtlas {
    sources: Vec<Arc<dyn Atlas>>,
    policy: BorderConflictPolicy,
    on_conflict: Option<ConflictCallback>,
    cache: Option<StitchCache>,
    reported: Mutex<HashSet<(ItemType, Identifier)>>,
    metadata: AtlasMetadata,
}

impl std::fmt::Debug for MultiAtlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiAtlas")
            .field("sources", &self.sources.len())
            .field("policy", &self.policy)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

fn same_geometry(a: &AtlasEntity, b: &AtlasEntity) -> bool {
    match (a, b) {
        (AtlasEntity::Node(a), AtlasEntity::Node(b)) => a.location == b.location,
        (AtlasEntity::Edge(a), AtlasEntity::Edge(b)) => {
            a.polyline == b.polyline && a.start_node == b.start_node && a.end_node == b.end_node
        }
        (AtlasEntity::Area(a), AtlasEntity::Area(b)) => a.polygon == b.polygon,
        (AtlasEntity::Line(a), AtlasEntity::Line(b)) => a.polyline == b.polyline,
        (AtlasEntity::Point(a), AtlasEntity::Point(b)) => a.location == b.location,
        (AtlasEntity::Relation(_), AtlasEntity::Relation(_)) => true,
        _ => false,
    }
}

impl MultiAtlas {
    /// Compose sources with default settings.
    pub fn new(sources: Vec<Arc<dyn Atlas>>) -> Self {
        Self::with_config(sources, &MultiAtlasConfig::default())
    }

    /// Compose sources with explicit settings.
    pub fn with_config(sources: Vec<Arc<dyn Atlas>>, config: &MultiAtlasConfig) -> Self {
        let cache = NonZeroUsize::new(config.cache_capacity).map(|c| Mutex::new(LruCache::new(c)));
        let metadata = sources
            .first()
            .map(|s| AtlasMetadata {
                shard_name: None,
                ..s.metadata()
            })
            .unwrap_or_default();
        tracing::debug!(
            sources = sources.len(),
            policy = ?config.border_conflict_policy,
            cache_capacity = config.cache_capacity,
            "MultiAtlas composed"
        );
        Self {
            sources,
            policy: config.border_conflict_policy,
            on_conflict: None,
            cache,
            reported: Mutex::new(HashSet::new()),
            metadata,
        }
    }

    /// Install a callback receiving every border conflict.
    pub fn with_conflict_callback(mut self, callback: impl Fn(&BorderConflict) + Send + Sync + 'static) -> Self {
        self.on_conflict = Some(Arc::new(callback));
        self
    }

    /// The composed sources, in order.
    pub fn sources(&self) -> &[Arc<dyn Atlas>] {
        &self.sources
    }

    /// Border policy in effect.
    pub fn policy(&self) -> BorderConflictPolicy {
        self.policy
    }

    fn stitched(&self, item_type: ItemType, identifier: Identifier) -> Option<AtlasEntity> {
        let Some(cache) = &self.cache else {
            return self.stitch(item_type, identifier);
        };
        if let Some(hit) = cache.lock().get(&(item_type, identifier)) {
            return hit.clone();
        }
        let stitched = self.stitch(item_type, identifier);
        cache.lock().put((item_type, identifier), stitched.clone());
        stitched
    }

    fn stitch(&self, item_type: ItemType, identifier: Identifier) -> Option<AtlasEntity> {
        let copies: Vec<(usize, AtlasEntity)> = self
            .sources
            .iter()
            .enumerate()
            .filter_map(|(index, source)| source.entity(item_type, identifier).map(|e| (index, e)))
            .collect();
        if copies.len() <= 1 {
            return copies.into_iter().next().map(|(_, e)| e);
        }

        let kept = match self.policy {
            BorderConflictPolicy::LastSource => copies.len() - 1,
            _ => 0,
        };
        let disagreeing: Vec<usize> = copies
            .iter()
            .filter(|(_, copy)| !same_geometry(copy, &copies[kept].1))
            .map(|(index, _)| *index)
            .collect();
        if !disagreeing.is_empty() {
            // Racing readers may stitch the same entity; only the first reports.
            if self.reported.lock().insert((item_type, identifier)) {
                let conflict = BorderConflict {
                    item_type,
                    identifier,
                    sources: copies.iter().map(|(index, _)| *index).collect(),
                    disagreeing,
                    policy: self.policy,
                };
                tracing::warn!(
                    item_type = %item_type,
                    identifier,
                    sources = ?conflict.sources,
                    disagreeing = ?conflict.disagreeing,
                    policy = ?self.policy,
                    "Border conflict between atlas sources"
                );
                if let Some(callback) = &self.on_conflict {
                    callback(&conflict);
                }
            }
            if self.policy == BorderConflictPolicy::Exclude {
                return None;
            }
        }

        let mut stitched = copies[kept].1.clone();
        match &mut stitched {
            AtlasEntity::Node(node) => {
                for (_, copy) in &copies {
                    if let AtlasEntity::Node(copy) = copy {
                        node.in_edges.extend(copy.in_edges.iter().copied());
                        node.out_edges.extend(copy.out_edges.iter().copied());
                    }
                }
            }
            AtlasEntity::Relation(relation) => {
                let mut seen = HashSet::new();
                relation.members = copies
                    .iter()
                    .filter_map(|(_, copy)| match copy {
                        AtlasEntity::Relation(r) => Some(r.members.iter()),
                        _ => None,
                    })
                    .flatten()
                    .filter(|m| seen.insert((m.item_type, m.identifier, m.role.clone())))
                    .cloned()
                    .collect();
            }
            _ => {}
        }
        Some(stitched)
    }

    fn visible(&self, item_type: ItemType, identifiers: BTreeSet<Identifier>) -> Vec<Identifier> {
        if self.policy != BorderConflictPolicy::Exclude {
            return identifiers.into_iter().collect();
        }
        identifiers
            .into_iter()
            .filter(|&id| self.stitched(item_type, id).is_some())
            .collect()
    }
}

impl Atlas for MultiAtlas {
    fn metadata(&self) -> AtlasMetadata {
        self.metadata.clone()
    }

    fn node(&self, identifier: Identifier) -> Option<Node> {
        match self.stitched(ItemType::Node, identifier)? {
            AtlasEntity::Node(node) => Some(node),
            _ => None,
        }
    }

    fn edge(&self, identifier: Identifier) -> Option<Edge> {
        match self.stitched(ItemType::Edge, identifier)? {
            AtlasEntity::Edge(edge) => Some(edge),
            _ => None,
        }
    }

    fn area(&self, identifier: Identifier) -> Option<Area> {
        match self.stitched(ItemType::Area, identifier)? {
            AtlasEntity::Area(area) => Some(area),
            _ => None,
        }
    }

    fn line(&self, identifier: Identifier) -> Option<Line> {
        match self.stitched(ItemType::Line, identifier)? {
            AtlasEntity::Line(line) => Some(line),
            _ => None,
        }
    }

    fn point(&self, identifier: Identifier) -> Option<Point> {
        match self.stitched(ItemType::Point, identifier)? {
            AtlasEntity::Point(point) => Some(point),
            _ => None,
        }
    }

    fn relation(&self, identifier: Identifier) -> Option<Relation> {
        match self.stitched(ItemType::Relation, identifier)? {
            AtlasEntity::Relation(relation) => Some(relation),
            _ => None,
        }
    }

    fn entity(&self, item_type: ItemType, identifier: Identifier) -> Option<AtlasEntity> {
        self.stitched(item_type, identifier)
    }

    fn identifiers(&self, item_type: ItemType) -> Vec<Identifier> {
        let union = self
            .sources
            .iter()
            .flat_map(|s| s.identifiers(item_type))
            .collect();
        self.visible(item_type, union)
    }

    fn identifiers_intersecting(&self, item_type: ItemType, bounds: &Rectangle) -> Vec<Identifier> {
        let union = self
            .sources
            .iter()
            .flat_map(|s| s.identifiers_intersecting(item_type, bounds))
            .collect();
        self.visible(item_type, union)
    }

    fn relations_with_member(&self, item_type: ItemType, identifier: Identifier) -> BTreeSet<Identifier> {
        let union = self
            .sources
            .iter()
            .flat_map(|s| s.relations_with_member(item_type, identifier))
            .collect();
        self.visible(ItemType::Relation, union).into_iter().collect()
    }

    fn contains(&self, item_type: ItemType, identifier: Identifier) -> bool {
        if self.policy == BorderConflictPolicy::Exclude {
            return self.stitched(item_type, identifier).is_some();
        }
        self.sources.iter().any(|s| s.contains(item_type, identifier))
    }

    fn bounds(&self) -> Option<Rectangle> {
        self.sources
            .iter()
            .filter_map(|s| s.bounds())
            .reduce(|a, b| a.combine(&b))
    }
}

/// Load every path and compose the atlases that loaded.
///
/// Failures are returned alongside instead of aborting the composition.
pub fn multi_from_paths<P: AsRef<Path>>(
    paths: impl IntoIterator<Item = P>,
    config: &AtlasConfig,
) -> (MultiAtlas, Vec<AtlasLoadError>) {
    let (atlases, errors) = load_all(paths, config);
    let sources = atlases
        .into_iter()
        .map(|atlas| Arc::new(atlas) as Arc<dyn Atlas>)
        .collect();
    (MultiAtlas::with_config(sources, &config.multi), errors)
}
