//! DynamicAtlas: a view that loads shards on demand.
//!
//! ## Expansion rules
//!
//! - Construction loads nothing; the first access loads the initial shards.
//! - When a lookup returns an entity whose bounds reach shards that are not
//!   loaded yet, those shards are fetched and the lookup is answered again
//!   against the grown view (unless loading is deferred).
//! - A shard may be loaded only if it overlaps the maximum bounds polygon
//!   and either expansion is indefinite or geometry from the initial shards
//!   touches it.
//! - An optional checker sees every prospective shard set and may veto it.
//! - Fetch failures are logged and the shard is marked unavailable; it is
//!   never fetched again.
//!
//! Loads are serialized by a mutex; readers keep working against the
//! previously composed view while a load is in flight.

pub mod sharding;

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::atlas::{Atlas, AtlasMetadata, MultiAtlas};
use crate::config::MultiAtlasConfig;
use crate::error::AtlasError;
use crate::types::{
    Area, AtlasEntity, Edge, Identifier, ItemType, Line, Node, Point, Polygon, Rectangle, Relation,
};

pub use sharding::{Shard, Sharding, SlippyTile, SlippyTileSharding, MAX_ZOOM};

/// Fetches the atlas of one shard. `Ok(None)` means the shard has no data.
pub type ShardFetcher = Arc<dyn Fn(&Shard) -> Result<Option<Arc<dyn Atlas>>, AtlasError> + Send + Sync>;

/// Approves or vetoes a prospective set of loaded shards.
pub type ShardSetChecker = Arc<dyn Fn(&BTreeSet<Shard>) -> bool + Send + Sync>;

/// Expansion policy of a [`DynamicAtlas`].
#[derive(Clone)]
pub struct DynamicAtlasPolicy {
    /// Shards loaded on first access.
    pub initial_shards: BTreeSet<Shard>,
    /// No shard outside this polygon is ever loaded.
    pub maximum_bounds: Polygon,
    /// Follow geometry without limit instead of only one step out of the
    /// initial shards.
    pub extend_indefinitely: bool,
    /// Never expand on lookup; only [`DynamicAtlas::preemptive_load`] expands.
    pub deferred_loading: bool,
    /// Optional veto over prospective shard sets.
    pub shard_set_checker: Option<ShardSetChecker>,
    /// Settings of the composed view.
    pub multi: MultiAtlasConfig,
}

impl std::fmt::Debug for DynamicAtlasPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicAtlasPolicy")
            .field("initial_shards", &self.initial_shards)
            .field("maximum_bounds", &self.maximum_bounds)
            .field("extend_indefinitely", &self.extend_indefinitely)
            .field("deferred_loading", &self.deferred_loading)
            .field("shard_set_checker", &self.shard_set_checker.is_some())
            .finish()
    }
}

impl DynamicAtlasPolicy {
    /// Policy starting from `initial_shards`, confined to `maximum_bounds`.
    pub fn new(initial_shards: impl IntoIterator<Item = Shard>, maximum_bounds: Polygon) -> Self {
        Self {
            initial_shards: initial_shards.into_iter().collect(),
            maximum_bounds,
            extend_indefinitely: true,
            deferred_loading: false,
            shard_set_checker: None,
            multi: MultiAtlasConfig::default(),
        }
    }

    /// Set whether expansion follows geometry without limit.
    pub fn with_extend_indefinitely(mut self, extend: bool) -> Self {
        self.extend_indefinitely = extend;
        self
    }

    /// Set whether lookups are allowed to trigger loads.
    pub fn with_deferred_loading(mut self, deferred: bool) -> Self {
        self.deferred_loading = deferred;
        self
    }

    /// Install a shard set checker.
    pub fn with_shard_set_checker(mut self, checker: impl Fn(&BTreeSet<Shard>) -> bool + Send + Sync + 'static) -> Self {
        self.shard_set_checker = Some(Arc::new(checker));
        self
    }

    /// Settings of the composed view.
    pub fn with_multi_config(mut self, config: MultiAtlasConfig) -> Self {
        self.multi = config;
        self
    }
}

struct DynamicState {
    initialized: bool,
    view: Arc<MultiAtlas>,
    sources: Vec<Arc<dyn Atlas>>,
    loaded: BTreeSet<Shard>,
    unavailable: BTreeSet<Shard>,
    /// Shards reached by geometry of the initial shards.
    reachable: BTreeSet<Shard>,
}

/// Atlas view growing shard by shard.
pub struct DynamicAtlas {
    sharding: Arc<dyn Sharding>,
    fetcher: ShardFetcher,
    policy: DynamicAtlasPolicy,
    state: RwLock<DynamicState>,
    load_lock: Mutex<()>,
}

impl std::fmt::Debug for DynamicAtlas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("DynamicAtlas")
            .field("policy", &self.policy)
            .field("loaded", &state.loaded)
            .field("unavailable", &state.unavailable)
            .finish()
    }
}

impl DynamicAtlas {
    /// Create a dynamic atlas. Nothing is fetched until first use.
    pub fn new(
        sharding: Arc<dyn Sharding>,
        fetcher: impl Fn(&Shard) -> Result<Option<Arc<dyn Atlas>>, AtlasError> + Send + Sync + 'static,
        policy: DynamicAtlasPolicy,
    ) -> Self {
        let view = Arc::new(MultiAtlas::with_config(Vec::new(), &policy.multi));
        Self {
            sharding,
            fetcher: Arc::new(fetcher),
            policy,
            state: RwLock::new(DynamicState {
                initialized: false,
                view,
                sources: Vec::new(),
                loaded: BTreeSet::new(),
                unavailable: BTreeSet::new(),
                reachable: BTreeSet::new(),
            }),
            load_lock: Mutex::new(()),
        }
    }

    /// Shards loaded so far.
    pub fn loaded_shards(&self) -> BTreeSet<Shard> {
        self.state.read().loaded.clone()
    }

    /// Shards whose fetch failed or returned no data.
    pub fn unavailable_shards(&self) -> BTreeSet<Shard> {
        self.state.read().unavailable.clone()
    }

    /// The sharding scheme.
    pub fn sharding(&self) -> &dyn Sharding {
        self.sharding.as_ref()
    }

    /// The expansion policy.
    pub fn policy(&self) -> &DynamicAtlasPolicy {
        &self.policy
    }

    /// Current composed view, loading the initial shards on first call.
    pub fn view(&self) -> Arc<MultiAtlas> {
        self.ensure_initialized();
        Arc::clone(&self.state.read().view)
    }

    fn ensure_initialized(&self) {
        if self.state.read().initialized {
            return;
        }
        let _guard = self.load_lock.lock();
        if self.state.read().initialized {
            return;
        }
        let initial = self.policy.initial_shards.clone();
        self.load_locked(initial, false);

        let reachable = if self.policy.extend_indefinitely {
            BTreeSet::new()
        } else {
            let view = Arc::clone(&self.state.read().view);
            self.shards_reached_by(&view)
        };
        let mut state = self.state.write();
        state.reachable = reachable;
        state.initialized = true;
    }

    fn shards_reached_by(&self, view: &MultiAtlas) -> BTreeSet<Shard> {
        let mut reached = BTreeSet::new();
        for item_type in ItemType::ALL {
            for entity in view.entities(item_type) {
                if let Some(bounds) = view.entity_bounds(&entity) {
                    reached.extend(self.sharding.shards_covering(&bounds));
                }
            }
        }
        reached
    }

    fn allowed(&self, state: &DynamicState, shard: &Shard) -> bool {
        !state.loaded.contains(shard)
            && !state.unavailable.contains(shard)
            && self.policy.maximum_bounds.intersects_rectangle(&shard.bounds())
            && (self.policy.extend_indefinitely || state.reachable.contains(shard))
    }

    /// Fetch `candidates` and recompose. Caller holds `load_lock`.
    ///
    /// Returns whether at least one new atlas joined the view.
    fn load_locked(&self, candidates: BTreeSet<Shard>, filter: bool) -> bool {
        let candidates: BTreeSet<Shard> = {
            let state = self.state.read();
            candidates
                .into_iter()
                .filter(|shard| {
                    if filter {
                        self.allowed(&state, shard)
                    } else {
                        !state.loaded.contains(shard) && !state.unavailable.contains(shard)
                    }
                })
                .collect()
        };
        if candidates.is_empty() {
            return false;
        }

        if let Some(checker) = &self.policy.shard_set_checker {
            let mut prospective = self.state.read().loaded.clone();
            prospective.extend(candidates.iter().cloned());
            if !checker(&prospective) {
                tracing::warn!(
                    candidates = ?candidates.iter().map(Shard::name).collect::<Vec<_>>(),
                    "Shard set checker vetoed expansion"
                );
                return false;
            }
        }

        let mut fetched = Vec::new();
        let mut unavailable = Vec::new();
        for shard in candidates {
            match (self.fetcher)(&shard) {
                Ok(Some(atlas)) => fetched.push((shard, atlas)),
                Ok(None) => {
                    tracing::debug!(shard = %shard, "Shard has no data");
                    unavailable.push(shard);
                }
                Err(error) => {
                    tracing::warn!(shard = %shard, error = %error, "Shard fetch failed");
                    unavailable.push(shard);
                }
            }
        }

        let mut state = self.state.write();
        state.unavailable.extend(unavailable);
        if fetched.is_empty() {
            return false;
        }
        let names: Vec<String> = fetched.iter().map(|(s, _)| s.name().to_string()).collect();
        for (shard, atlas) in fetched {
            state.loaded.insert(shard);
            state.sources.push(atlas);
        }
        state.view = Arc::new(MultiAtlas::with_config(state.sources.clone(), &self.policy.multi));
        tracing::info!(
            shards = ?names,
            loaded = state.loaded.len(),
            unavailable = state.unavailable.len(),
            "DynamicAtlas expanded"
        );
        true
    }

    fn expand_to(&self, bounds: &Rectangle) -> bool {
        if self.policy.deferred_loading {
            return false;
        }
        let candidates: BTreeSet<Shard> = {
            let state = self.state.read();
            self.sharding
                .shards_covering(bounds)
                .into_iter()
                .filter(|shard| self.allowed(&state, shard))
                .collect()
        };
        if candidates.is_empty() {
            return false;
        }
        let _guard = self.load_lock.lock();
        self.load_locked(candidates, true)
    }

    /// Load every allowed shard reached by loaded geometry, until nothing
    /// new is reached.
    pub fn preemptive_load(&self) {
        self.ensure_initialized();
        let _guard = self.load_lock.lock();
        loop {
            let view = Arc::clone(&self.state.read().view);
            let reached = self.shards_reached_by(&view);
            if !self.load_locked(reached, true) {
                break;
            }
        }
    }

    fn lookup(&self, item_type: ItemType, identifier: Identifier) -> Option<AtlasEntity> {
        loop {
            let view = self.view();
            let entity = view.entity(item_type, identifier)?;
            match view.entity_bounds(&entity) {
                Some(bounds) if self.expand_to(&bounds) => continue,
                _ => return Some(entity),
            }
        }
    }
}

impl Atlas for DynamicAtlas {
    fn metadata(&self) -> AtlasMetadata {
        self.view().metadata()
    }

    fn node(&self, identifier: Identifier) -> Option<Node> {
        match self.lookup(ItemType::Node, identifier)? {
            AtlasEntity::Node(node) => Some(node),
            _ => None,
        }
    }

    fn edge(&self, identifier: Identifier) -> Option<Edge> {
        match self.lookup(ItemType::Edge, identifier)? {
            AtlasEntity::Edge(edge) => Some(edge),
            _ => None,
        }
    }

    fn area(&self, identifier: Identifier) -> Option<Area> {
        match self.lookup(ItemType::Area, identifier)? {
            AtlasEntity::Area(area) => Some(area),
            _ => None,
        }
    }

    fn line(&self, identifier: Identifier) -> Option<Line> {
        match self.lookup(ItemType::Line, identifier)? {
            AtlasEntity::Line(line) => Some(line),
            _ => None,
        }
    }

    fn point(&self, identifier: Identifier) -> Option<Point> {
        match self.lookup(ItemType::Point, identifier)? {
            AtlasEntity::Point(point) => Some(point),
            _ => None,
        }
    }

    fn relation(&self, identifier: Identifier) -> Option<Relation> {
        match self.lookup(ItemType::Relation, identifier)? {
            AtlasEntity::Relation(relation) => Some(relation),
            _ => None,
        }
    }

    fn entity(&self, item_type: ItemType, identifier: Identifier) -> Option<AtlasEntity> {
        self.lookup(item_type, identifier)
    }

    fn identifiers(&self, item_type: ItemType) -> Vec<Identifier> {
        self.view().identifiers(item_type)
    }

    fn identifiers_intersecting(&self, item_type: ItemType, bounds: &Rectangle) -> Vec<Identifier> {
        self.ensure_initialized();
        self.expand_to(bounds);
        self.view().identifiers_intersecting(item_type, bounds)
    }

    fn relations_with_member(&self, item_type: ItemType, identifier: Identifier) -> BTreeSet<Identifier> {
        self.view().relations_with_member(item_type, identifier)
    }

    fn contains(&self, item_type: ItemType, identifier: Identifier) -> bool {
        self.view().contains(item_type, identifier)
    }

    fn bounds(&self) -> Option<Rectangle> {
        self.view().bounds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::PackedAtlasBuilder;
    use crate::types::{Location, PolyLine, Tags};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Zoom 1 tiles: 1-0-0 (NW), 1-1-0 (NE), 1-0-1 (SW), 1-1-1 (SE).
    fn sharding() -> Arc<dyn Sharding> {
        Arc::new(SlippyTileSharding::new(1))
    }

    fn shard(name: &str) -> Shard {
        sharding().shard(name).unwrap()
    }

    fn degrees(lat: f64, lon: f64) -> Location {
        Location::from_degrees(lat, lon)
    }

    /// A road from NW to NE, then a road from NE to SE.
    fn shard_atlases() -> BTreeMap<String, Arc<dyn Atlas>> {
        let mut atlases = BTreeMap::new();

        let mut nw = PackedAtlasBuilder::new();
        nw.add_node(1, degrees(10.0, -10.0), Tags::new()).unwrap();
        nw.add_node(2, degrees(10.0, 10.0), Tags::new()).unwrap();
        nw.add_edge(12, PolyLine::new(vec![degrees(10.0, -10.0), degrees(10.0, 10.0)]), Tags::new(), 1, 2)
            .unwrap();
        atlases.insert("1-0-0".to_string(), Arc::new(nw.build().unwrap()) as Arc<dyn Atlas>);

        let mut ne = PackedAtlasBuilder::new();
        ne.add_node(1, degrees(10.0, -10.0), Tags::new()).unwrap();
        ne.add_node(2, degrees(10.0, 10.0), Tags::new()).unwrap();
        ne.add_node(3, degrees(-10.0, 10.0), Tags::new()).unwrap();
        ne.add_edge(12, PolyLine::new(vec![degrees(10.0, -10.0), degrees(10.0, 10.0)]), Tags::new(), 1, 2)
            .unwrap();
        ne.add_edge(23, PolyLine::new(vec![degrees(10.0, 10.0), degrees(-10.0, 10.0)]), Tags::new(), 2, 3)
            .unwrap();
        atlases.insert("1-1-0".to_string(), Arc::new(ne.build().unwrap()) as Arc<dyn Atlas>);

        let mut se = PackedAtlasBuilder::new();
        se.add_node(2, degrees(10.0, 10.0), Tags::new()).unwrap();
        se.add_node(3, degrees(-10.0, 10.0), Tags::new()).unwrap();
        se.add_edge(23, PolyLine::new(vec![degrees(10.0, 10.0), degrees(-10.0, 10.0)]), Tags::new(), 2, 3)
            .unwrap();
        atlases.insert("1-1-1".to_string(), Arc::new(se.build().unwrap()) as Arc<dyn Atlas>);

        atlases
    }

    fn world() -> Polygon {
        Rectangle::world().to_polygon()
    }

    fn dynamic(policy: DynamicAtlasPolicy, fetches: Arc<AtomicUsize>) -> DynamicAtlas {
        let atlases = shard_atlases();
        DynamicAtlas::new(
            sharding(),
            move |shard: &Shard| {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(atlases.get(shard.name()).cloned())
            },
            policy,
        )
    }

    #[test]
    fn test_construction_is_lazy() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let atlas = dynamic(DynamicAtlasPolicy::new([shard("1-0-0")], world()), fetches.clone());
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert!(atlas.node(1).is_some());
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lookup_expands_to_reached_shards() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let atlas = dynamic(DynamicAtlasPolicy::new([shard("1-0-0")], world()), fetches);

        // Edge 12 reaches into the north-east tile.
        let edge = atlas.edge(12).unwrap();
        assert_eq!(edge.end_node, 2);
        assert!(atlas.loaded_shards().contains(&shard("1-1-0")));

        // Node 2 now sees edge 23 from the newly loaded tile.
        let node = atlas.node(2).unwrap();
        assert!(node.out_edges.contains(&23));
    }

    #[test]
    fn test_deferred_loading_waits_for_preemptive_load() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let policy = DynamicAtlasPolicy::new([shard("1-0-0")], world()).with_deferred_loading(true);
        let atlas = dynamic(policy, fetches);

        assert!(atlas.edge(12).is_some());
        assert_eq!(atlas.loaded_shards().len(), 1);

        atlas.preemptive_load();
        let loaded: Vec<_> = atlas.loaded_shards().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(loaded, vec!["1-0-0", "1-1-0", "1-1-1"]);
        assert!(atlas.unavailable_shards().is_empty());
    }

    #[test]
    fn test_bounded_expansion_stops_one_step_out() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let policy = DynamicAtlasPolicy::new([shard("1-0-0")], world()).with_extend_indefinitely(false);
        let atlas = dynamic(policy, fetches);
        atlas.preemptive_load();
        let loaded: Vec<_> = atlas.loaded_shards().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(loaded, vec!["1-0-0", "1-1-0"]);
    }

    #[test]
    fn test_checker_vetoes_expansion() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let policy = DynamicAtlasPolicy::new([shard("1-0-0")], world()).with_shard_set_checker(|set| set.len() <= 1);
        let atlas = dynamic(policy, fetches.clone());
        assert!(atlas.edge(12).is_some());
        assert_eq!(atlas.loaded_shards().len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_maximum_bounds_confine_loading() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let west_only = Rectangle::new(degrees(-80.0, -170.0), degrees(80.0, -1.0)).to_polygon();
        let atlas = dynamic(DynamicAtlasPolicy::new([shard("1-0-0")], west_only), fetches);
        atlas.preemptive_load();
        assert_eq!(atlas.loaded_shards().len(), 1);
    }

    #[test]
    fn test_fetch_error_marks_unavailable() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let atlases = shard_atlases();
        let atlas = DynamicAtlas::new(
            sharding(),
            move |shard: &Shard| {
                counter.fetch_add(1, Ordering::SeqCst);
                if shard.name() == "1-1-0" {
                    return Err(AtlasError::Fetch(shard.name().to_string(), "connection reset".to_string()));
                }
                Ok(atlases.get(shard.name()).cloned())
            },
            DynamicAtlasPolicy::new([shard("1-0-0")], world()),
        );
        assert!(atlas.edge(12).is_some());
        assert!(atlas.edge(12).is_some());
        assert!(atlas.unavailable_shards().contains(&shard("1-1-0")));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}
