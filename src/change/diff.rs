//! AtlasDiff: the change that turns one atlas into another.
//!
//! Entities are compared by value, per type and identifier. Metadata is not
//! compared. Applying the generated change to `before` through a
//! [`ChangeAtlas`](super::ChangeAtlas) yields a view with no differences
//! from `after`.

use std::collections::{BTreeMap, BTreeSet};

use super::{Change, FeatureChange};
use crate::atlas::Atlas;
use crate::types::{CompleteEntity, ItemType};

/// Name given to generated changes.
pub const DIFF_CHANGE_NAME: &str = "diff";

/// Comparison of two atlases.
pub struct AtlasDiff<'a> {
    before: &'a dyn Atlas,
    after: &'a dyn Atlas,
    name: String,
}

impl<'a> AtlasDiff<'a> {
    /// Compare `before` with `after`.
    pub fn new(before: &'a dyn Atlas, after: &'a dyn Atlas) -> Self {
        Self {
            before,
            after,
            name: DIFF_CHANGE_NAME.to_string(),
        }
    }

    /// Name the generated change.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Feature changes for one entity type, ascending by identifier.
    pub fn feature_changes(&self, item_type: ItemType) -> Vec<FeatureChange> {
        let identifiers: BTreeSet<_> = self
            .before
            .identifiers(item_type)
            .into_iter()
            .chain(self.after.identifiers(item_type))
            .collect();
        identifiers
            .into_iter()
            .filter_map(|id| {
                match (self.before.entity(item_type, id), self.after.entity(item_type, id)) {
                    (Some(_), None) => {
                        Some(FeatureChange::remove_identifier(item_type, id).with_atlas_context(self.before))
                    }
                    (None, Some(added)) => Some(FeatureChange::add(CompleteEntity::from(added))),
                    (Some(old), Some(new)) if old != new => {
                        Some(FeatureChange::add(CompleteEntity::from(new)).with_atlas_context(self.before))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// The change from `before` to `after`, or `None` when they hold the
    /// same entities.
    pub fn generate_change(&self) -> Option<Change> {
        let changes: BTreeMap<_, _> = ItemType::ALL
            .into_iter()
            .flat_map(|item_type| self.feature_changes(item_type))
            .map(|change| (change.key(), change))
            .collect();
        tracing::debug!(name = %self.name, feature_changes = changes.len(), "Atlas diff generated");
        if changes.is_empty() {
            return None;
        }
        Some(Change {
            name: self.name.clone(),
            changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{same_contents, PackedAtlas, PackedAtlasBuilder};
    use crate::change::{ChangeAtlas, ChangeType};
    use crate::types::{Location, PolyLine, RelationMember, Tags};

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn at(lat: i32, lon: i32) -> Location {
        Location::from_dm7(lat, lon)
    }

    fn road(builder: &mut PackedAtlasBuilder, id: i64, from: (i64, Location), to: (i64, Location)) {
        let shape = PolyLine::new(vec![from.1, to.1]);
        builder.add_edge(id, shape.clone(), tags(&[("highway", "residential")]), from.0, to.0).unwrap();
        builder.add_edge(-id, shape.reversed(), tags(&[("highway", "residential")]), to.0, from.0).unwrap();
    }

    fn before_atlas() -> PackedAtlas {
        let mut builder = PackedAtlasBuilder::new();
        builder.add_node(1, at(0, 0), Tags::new()).unwrap();
        builder.add_node(2, at(0, 1000), Tags::new()).unwrap();
        builder.add_node(3, at(1000, 1000), Tags::new()).unwrap();
        road(&mut builder, 10, (1, at(0, 0)), (2, at(0, 1000)));
        road(&mut builder, 11, (2, at(0, 1000)), (3, at(1000, 1000)));
        builder.add_point(20, at(5, 5), tags(&[("amenity", "cafe")])).unwrap();
        builder
            .add_relation(30, Tags::new(), vec![RelationMember::new(ItemType::Edge, 11, "")])
            .unwrap();
        builder.build().unwrap()
    }

    fn after_atlas() -> PackedAtlas {
        let mut builder = PackedAtlasBuilder::new();
        builder.add_node(1, at(0, 0), tags(&[("highway", "stop")])).unwrap();
        builder.add_node(2, at(0, 1000), Tags::new()).unwrap();
        builder.add_node(4, at(0, 2000), Tags::new()).unwrap();
        road(&mut builder, 10, (1, at(0, 0)), (2, at(0, 1000)));
        road(&mut builder, 12, (2, at(0, 1000)), (4, at(0, 2000)));
        builder.add_point(20, at(5, 5), tags(&[("amenity", "bar")])).unwrap();
        builder
            .add_relation(30, Tags::new(), vec![RelationMember::new(ItemType::Edge, 12, "")])
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_identical_atlases_have_no_change() {
        let atlas = before_atlas();
        assert!(AtlasDiff::new(&atlas, &atlas).generate_change().is_none());
    }

    #[test]
    fn test_diff_classifies_entities() {
        let (before, after) = (before_atlas(), after_atlas());
        let change = AtlasDiff::new(&before, &after).generate_change().unwrap();
        assert_eq!(change.name(), DIFF_CHANGE_NAME);

        let removed = change.get(ItemType::Node, 3).unwrap();
        assert_eq!(removed.change_type, ChangeType::Remove);
        assert!(removed.before_view.as_ref().is_some_and(CompleteEntity::is_full));

        let created = change.get(ItemType::Edge, 12).unwrap();
        assert!(created.before_view.is_none());

        let updated = change.get(ItemType::Point, 20).unwrap();
        assert_eq!(updated.before_view.as_ref().unwrap().tags(), Some(&tags(&[("amenity", "cafe")])));
        assert!(change.get(ItemType::Edge, 10).is_none());
    }

    #[test]
    fn test_applying_diff_reproduces_after() {
        let (before, after) = (before_atlas(), after_atlas());
        let change = AtlasDiff::new(&before, &after).generate_change().unwrap();
        let applied = ChangeAtlas::new(&before, &change).unwrap();

        assert!(AtlasDiff::new(&applied, &after).generate_change().is_none());
        assert!(same_contents(&applied, &after));
    }
}
