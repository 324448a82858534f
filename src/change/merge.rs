//! Field-level, conflict-aware merging of two changes on one entity.
//!
//! ## Strategy selection
//!
//! Each field specified by both sides (and not already equal) is merged by a
//! strategy picked from the two before views of that field:
//!
//! | Before views | Strategy |
//! |---|---|
//! | neither side has one | ignore-before-view |
//! | one side has one, or both agree | consistent-before-view |
//! | both present and different | conflict-aware (tags, sets, members only) |
//!
//! A field specified by one side only is taken from that side.
//!
//! ## Guarantees
//!
//! - Pure: inputs are never modified.
//! - Commutative for inputs that merge successfully.
//! - Failures carry the strategy trace, root cause first, ending in
//!   [`MergeFailureType::HighestLevelMergeFailure`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::feature_change::{ChangeType, FeatureChange};
use crate::types::{
    CompleteArea, CompleteEdge, CompleteEntity, CompleteLine, CompleteNode, CompletePoint,
    CompleteRelation, Identifier, ItemType, Location, PolyLine, Polygon, RelationMember, Tags,
};

/// Where in the strategy stack a merge failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeFailureType {
    /// Both sides changed a field and neither carried a before view.
    IgnoreBeforeViewStrategyFailed,
    /// Both sides changed a field away from a shared before view.
    ConsistentBeforeViewStrategyFailed,
    /// Before views disagree and the changes cannot be reconciled.
    ConflictAwareBeforeViewStrategyFailed,
    /// Before views disagree on a field no strategy can reconcile.
    NoApplicableStrategy,
    /// The feature changes as a whole could not be merged.
    HighestLevelMergeFailure,
}

impl fmt::Display for MergeFailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IgnoreBeforeViewStrategyFailed => "ignore-before-view strategy failed",
            Self::ConsistentBeforeViewStrategyFailed => "consistent-before-view strategy failed",
            Self::ConflictAwareBeforeViewStrategyFailed => "conflict-aware strategy failed",
            Self::NoApplicableStrategy => "no applicable strategy",
            Self::HighestLevelMergeFailure => "merge failed",
        };
        f.write_str(name)
    }
}

/// Failed merge of two feature changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot merge {field}: {message} ({})", trace(.failure_types))]
pub struct MergeError {
    /// Failure trace, root cause first.
    pub failure_types: Vec<MergeFailureType>,
    /// Field (or aspect) that failed, e.g. `tags` or `change_type`.
    pub field: String,
    /// Human-readable description naming the conflicting values.
    pub message: String,
}

fn trace(failure_types: &[MergeFailureType]) -> String {
    failure_types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" <- ")
}

impl MergeError {
    fn new(failure: MergeFailureType, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failure_types: vec![failure],
            field: field.into(),
            message: message.into(),
        }
    }

    fn wrap(mut self, failure: MergeFailureType) -> Self {
        self.failure_types.push(failure);
        self
    }

    /// Innermost failure.
    pub fn root_cause(&self) -> MergeFailureType {
        self.failure_types
            .first()
            .copied()
            .unwrap_or(MergeFailureType::HighestLevelMergeFailure)
    }

    /// Whether `failure` appears anywhere in the trace.
    pub fn involves(&self, failure: MergeFailureType) -> bool {
        self.failure_types.contains(&failure)
    }
}

/// Classification of one field's before views.
enum BeforeView<'a, T> {
    Missing,
    Consistent(&'a T),
    Conflicting(&'a T, &'a T),
}

fn classify<'a, T: PartialEq>(left: Option<&'a T>, right: Option<&'a T>) -> BeforeView<'a, T> {
    match (left, right) {
        (None, None) => BeforeView::Missing,
        (Some(b), None) | (None, Some(b)) => BeforeView::Consistent(b),
        (Some(l), Some(r)) if l == r => BeforeView::Consistent(l),
        (Some(l), Some(r)) => BeforeView::Conflicting(l, r),
    }
}

/// Per-type merge strategies. The defaults treat the value as an opaque
/// scalar.
trait MergeField: Clone + PartialEq + fmt::Debug {
    fn ignore_before(field: &str, left: &Self, right: &Self) -> Result<Self, MergeError> {
        Err(MergeError::new(
            MergeFailureType::IgnoreBeforeViewStrategyFailed,
            field,
            format!("{left:?} vs {right:?}"),
        ))
    }

    fn consistent(field: &str, before: &Self, left: &Self, right: &Self) -> Result<Self, MergeError> {
        if left == before {
            return Ok(right.clone());
        }
        if right == before {
            return Ok(left.clone());
        }
        Err(MergeError::new(
            MergeFailureType::ConsistentBeforeViewStrategyFailed,
            field,
            format!("both sides changed {before:?}: {left:?} vs {right:?}"),
        ))
    }

    fn conflict_aware(
        field: &str,
        before_left: &Self,
        before_right: &Self,
        _left: &Self,
        _right: &Self,
    ) -> Result<Self, MergeError> {
        Err(MergeError::new(
            MergeFailureType::NoApplicableStrategy,
            field,
            format!("before views disagree: {before_left:?} vs {before_right:?}"),
        ))
    }
}

impl MergeField for Identifier {}
impl MergeField for Location {}
impl MergeField for PolyLine {}
impl MergeField for Polygon {}

fn merge_tag_values(
    failure: MergeFailureType,
    key: &str,
    (before_left, left): (Option<&String>, Option<&String>),
    (before_right, right): (Option<&String>, Option<&String>),
) -> Result<Option<String>, MergeError> {
    let changed_left = left != before_left;
    let changed_right = right != before_right;
    let value = match (changed_left, changed_right) {
        _ if left == right => left,
        (true, false) => left,
        (false, true) => right,
        _ => {
            return Err(MergeError::new(
                failure,
                "tags",
                format!("key '{key}': {left:?} vs {right:?}"),
            ))
        }
    };
    Ok(value.cloned())
}

fn tag_keys<'a>(maps: &[&'a Tags]) -> BTreeSet<&'a String> {
    maps.iter().flat_map(|m| m.keys()).collect()
}

impl MergeField for Tags {
    fn ignore_before(field: &str, left: &Self, right: &Self) -> Result<Self, MergeError> {
        let mut merged = left.clone();
        for (key, value) in right {
            match left.get(key) {
                Some(existing) if existing != value => {
                    return Err(MergeError::new(
                        MergeFailureType::IgnoreBeforeViewStrategyFailed,
                        field,
                        format!("key '{key}': '{existing}' vs '{value}'"),
                    ))
                }
                _ => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(merged)
    }

    fn consistent(_field: &str, before: &Self, left: &Self, right: &Self) -> Result<Self, MergeError> {
        let mut merged = Tags::new();
        for key in tag_keys(&[before, left, right]) {
            let value = merge_tag_values(
                MergeFailureType::ConsistentBeforeViewStrategyFailed,
                key,
                (before.get(key), left.get(key)),
                (before.get(key), right.get(key)),
            )?;
            if let Some(value) = value {
                merged.insert(key.clone(), value);
            }
        }
        Ok(merged)
    }

    fn conflict_aware(
        _field: &str,
        before_left: &Self,
        before_right: &Self,
        left: &Self,
        right: &Self,
    ) -> Result<Self, MergeError> {
        let mut merged = Tags::new();
        for key in tag_keys(&[before_left, before_right, left, right]) {
            let value = merge_tag_values(
                MergeFailureType::ConflictAwareBeforeViewStrategyFailed,
                key,
                (before_left.get(key), left.get(key)),
                (before_right.get(key), right.get(key)),
            )?;
            if let Some(value) = value {
                merged.insert(key.clone(), value);
            }
        }
        Ok(merged)
    }
}

fn merge_sets(
    failure: MergeFailureType,
    field: &str,
    (before_left, left): (&BTreeSet<Identifier>, &BTreeSet<Identifier>),
    (before_right, right): (&BTreeSet<Identifier>, &BTreeSet<Identifier>),
) -> Result<BTreeSet<Identifier>, MergeError> {
    let removed_left: BTreeSet<_> = before_left.difference(left).copied().collect();
    let removed_right: BTreeSet<_> = before_right.difference(right).copied().collect();
    let added_left: BTreeSet<_> = left.difference(before_left).copied().collect();
    let added_right: BTreeSet<_> = right.difference(before_right).copied().collect();

    let clash: Vec<_> = added_left
        .intersection(&removed_right)
        .chain(added_right.intersection(&removed_left))
        .collect();
    if !clash.is_empty() {
        return Err(MergeError::new(
            failure,
            field,
            format!("{clash:?} added by one side and removed by the other"),
        ));
    }
    Ok(left
        .union(right)
        .filter(|id| !removed_left.contains(id) && !removed_right.contains(id))
        .copied()
        .collect())
}

impl MergeField for BTreeSet<Identifier> {
    fn ignore_before(_field: &str, left: &Self, right: &Self) -> Result<Self, MergeError> {
        Ok(left.union(right).copied().collect())
    }

    fn consistent(field: &str, before: &Self, left: &Self, right: &Self) -> Result<Self, MergeError> {
        merge_sets(
            MergeFailureType::ConsistentBeforeViewStrategyFailed,
            field,
            (before, left),
            (before, right),
        )
    }

    fn conflict_aware(
        field: &str,
        before_left: &Self,
        before_right: &Self,
        left: &Self,
        right: &Self,
    ) -> Result<Self, MergeError> {
        merge_sets(
            MergeFailureType::ConflictAwareBeforeViewStrategyFailed,
            field,
            (before_left, left),
            (before_right, right),
        )
    }
}

fn merge_members(
    failure: MergeFailureType,
    field: &str,
    (before_left, left): (&[RelationMember], &[RelationMember]),
    (before_right, right): (&[RelationMember], &[RelationMember]),
) -> Result<Vec<RelationMember>, MergeError> {
    if before_left == before_right {
        match (left != before_left, right != before_right) {
            (false, _) => return Ok(right.to_vec()),
            (true, false) => return Ok(left.to_vec()),
            (true, true) => {}
        }
    }
    let set = |members: &[RelationMember]| -> BTreeSet<RelationMember> { members.iter().cloned().collect() };
    let (before_left_set, left_set) = (set(before_left), set(left));
    let (before_right_set, right_set) = (set(before_right), set(right));

    let removed: BTreeSet<RelationMember> = before_left_set
        .difference(&left_set)
        .chain(before_right_set.difference(&right_set))
        .cloned()
        .collect();
    let added_left: BTreeSet<_> = left_set.difference(&before_left_set).cloned().collect();
    let added_right: BTreeSet<_> = right_set.difference(&before_right_set).cloned().collect();
    let clash: Vec<String> = added_left
        .union(&added_right)
        .filter(|m| removed.contains(*m))
        .map(|m| format!("{}/{}/{}", m.item_type, m.identifier, m.role))
        .collect();
    if !clash.is_empty() {
        return Err(MergeError::new(
            failure,
            field,
            format!("{clash:?} added by one side and removed by the other"),
        ));
    }

    // Survivors are every member either side still lists, minus removals.
    // Both bases in order first (the smaller base leads), then the rest in
    // canonical order.
    let kept: BTreeSet<RelationMember> = left_set
        .union(&right_set)
        .filter(|m| !removed.contains(*m))
        .cloned()
        .collect();
    let (first, second) = if before_left <= before_right {
        (before_left, before_right)
    } else {
        (before_right, before_left)
    };
    let mut merged: Vec<RelationMember> = Vec::with_capacity(kept.len());
    let mut placed = BTreeSet::new();
    for member in first.iter().chain(second).chain(&kept) {
        if kept.contains(member) && placed.insert(member.clone()) {
            merged.push(member.clone());
        }
    }
    Ok(merged)
}

impl MergeField for Vec<RelationMember> {
    fn ignore_before(_field: &str, left: &Self, right: &Self) -> Result<Self, MergeError> {
        let (first, second) = if left <= right { (left, right) } else { (right, left) };
        let mut merged = first.clone();
        let present: BTreeSet<RelationMember> = first.iter().cloned().collect();
        merged.extend(second.iter().filter(|m| !present.contains(*m)).cloned());
        Ok(merged)
    }

    fn consistent(field: &str, before: &Self, left: &Self, right: &Self) -> Result<Self, MergeError> {
        merge_members(
            MergeFailureType::ConsistentBeforeViewStrategyFailed,
            field,
            (before, left),
            (before, right),
        )
    }

    fn conflict_aware(
        field: &str,
        before_left: &Self,
        before_right: &Self,
        left: &Self,
        right: &Self,
    ) -> Result<Self, MergeError> {
        merge_members(
            MergeFailureType::ConflictAwareBeforeViewStrategyFailed,
            field,
            (before_left, left),
            (before_right, right),
        )
    }
}

fn merge_field<T: MergeField>(
    field: &str,
    left: &Option<T>,
    right: &Option<T>,
    before_left: Option<&T>,
    before_right: Option<&T>,
) -> Result<Option<T>, MergeError> {
    let (left, right) = match (left, right) {
        (None, None) => return Ok(None),
        (Some(value), None) | (None, Some(value)) => return Ok(Some(value.clone())),
        (Some(left), Some(right)) if left == right => return Ok(Some(left.clone())),
        (Some(left), Some(right)) => (left, right),
    };
    let merged = match classify(before_left, before_right) {
        BeforeView::Missing => T::ignore_before(field, left, right),
        BeforeView::Consistent(before) => T::consistent(field, before, left, right),
        BeforeView::Conflicting(before_left, before_right) => {
            T::conflict_aware(field, before_left, before_right, left, right)
        }
    }?;
    Ok(Some(merged))
}

/// Merged before view of one field: kept when the sides agree or only one
/// side knows it.
fn merge_before<T: Clone + PartialEq>(left: Option<&T>, right: Option<&T>) -> Option<T> {
    match classify(left, right) {
        BeforeView::Consistent(value) => Some(value.clone()),
        _ => None,
    }
}

macro_rules! typed_before {
    ($before:expr, $variant:ident) => {
        $before.and_then(|b| match b {
            CompleteEntity::$variant(inner) => Some(inner),
            _ => None,
        })
    };
}

macro_rules! merge_fields {
    ($left:expr, $right:expr, $bl:expr, $br:expr, $target:ident { $($field:ident),+ }) => {{
        let (left, right, bl, br) = ($left, $right, $bl, $br);
        let after = $target {
            identifier: left.identifier,
            $($field: merge_field(
                stringify!($field),
                &left.$field,
                &right.$field,
                bl.and_then(|b| b.$field.as_ref()),
                br.and_then(|b| b.$field.as_ref()),
            )?,)+
        };
        let before = (bl.is_some() || br.is_some()).then(|| $target {
            identifier: left.identifier,
            $($field: merge_before(
                bl.and_then(|b| b.$field.as_ref()),
                br.and_then(|b| b.$field.as_ref()),
            ),)+
        });
        (CompleteEntity::from(after), before.map(CompleteEntity::from))
    }};
}

/// Merges feature changes that target the same entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureChangeMerger;

impl FeatureChangeMerger {
    /// Create a merger.
    pub fn new() -> Self {
        Self
    }

    /// Merge two feature changes into one.
    pub fn merge(&self, left: &FeatureChange, right: &FeatureChange) -> Result<FeatureChange, MergeError> {
        let highest = MergeFailureType::HighestLevelMergeFailure;
        if left.key() != right.key() {
            return Err(MergeError::new(
                highest,
                "identifier",
                format!(
                    "targets differ: {} {} vs {} {}",
                    left.item_type(),
                    left.identifier(),
                    right.item_type(),
                    right.identifier()
                ),
            ));
        }
        if left == right {
            return Ok(left.clone());
        }

        match (left.change_type, right.change_type) {
            (ChangeType::Remove, ChangeType::Remove) => Ok(FeatureChange {
                change_type: ChangeType::Remove,
                after_view: CompleteEntity::shallow(left.item_type(), left.identifier()),
                before_view: merge_before(left.before_view.as_ref(), right.before_view.as_ref()),
            }),
            (ChangeType::Add, ChangeType::Add) => {
                let (after_view, before_view) = self
                    .merge_views(left, right)
                    .map_err(|e| e.wrap(highest))?;
                tracing::debug!(
                    item_type = %left.item_type(),
                    identifier = left.identifier(),
                    "Feature changes merged"
                );
                Ok(FeatureChange {
                    change_type: ChangeType::Add,
                    after_view,
                    before_view,
                })
            }
            _ => Err(MergeError::new(
                highest,
                "change_type",
                format!("{} {} is both added and removed", left.item_type(), left.identifier()),
            )),
        }
    }

    fn merge_views(
        &self,
        left: &FeatureChange,
        right: &FeatureChange,
    ) -> Result<(CompleteEntity, Option<CompleteEntity>), MergeError> {
        let (bl, br) = (left.before_view.as_ref(), right.before_view.as_ref());
        let merged = match (&left.after_view, &right.after_view) {
            (CompleteEntity::Node(l), CompleteEntity::Node(r)) => merge_fields!(
                l, r, typed_before!(bl, Node), typed_before!(br, Node),
                CompleteNode { location, tags, in_edges, out_edges }
            ),
            (CompleteEntity::Edge(l), CompleteEntity::Edge(r)) => merge_fields!(
                l, r, typed_before!(bl, Edge), typed_before!(br, Edge),
                CompleteEdge { polyline, tags, start_node, end_node }
            ),
            (CompleteEntity::Area(l), CompleteEntity::Area(r)) => merge_fields!(
                l, r, typed_before!(bl, Area), typed_before!(br, Area),
                CompleteArea { polygon, tags }
            ),
            (CompleteEntity::Line(l), CompleteEntity::Line(r)) => merge_fields!(
                l, r, typed_before!(bl, Line), typed_before!(br, Line),
                CompleteLine { polyline, tags }
            ),
            (CompleteEntity::Point(l), CompleteEntity::Point(r)) => merge_fields!(
                l, r, typed_before!(bl, Point), typed_before!(br, Point),
                CompletePoint { location, tags }
            ),
            (CompleteEntity::Relation(l), CompleteEntity::Relation(r)) => merge_fields!(
                l, r, typed_before!(bl, Relation), typed_before!(br, Relation),
                CompleteRelation { tags, members }
            ),
            _ => {
                return Err(MergeError::new(
                    MergeFailureType::NoApplicableStrategy,
                    "item_type",
                    "after views are of different variants",
                ))
            }
        };
        Ok(merged)
    }
}

/// Group changes by target and merge each group.
///
/// Fails on the first group that cannot be merged.
pub fn merge_all(
    changes: impl IntoIterator<Item = FeatureChange>,
) -> Result<BTreeMap<(ItemType, Identifier), FeatureChange>, MergeError> {
    let merger = FeatureChangeMerger::new();
    let mut merged: BTreeMap<_, FeatureChange> = BTreeMap::new();
    for change in changes {
        let key = change.key();
        let combined = match merged.remove(&key) {
            Some(existing) => merger.merge(&existing, &change)?,
            None => change,
        };
        merged.insert(key, combined);
    }
    Ok(merged)
}
