use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document_model::{Position, Range};
use crate::marker_index::{MarkerId, SpliceSets};

pub type Properties = BTreeMap<String, Value>;

/// Which edits mark a marker invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationStrategy {
    Never,
    Surround,
    #[default]
    Overlap,
    Inside,
    Touch,
}

impl InvalidationStrategy {
    /// Decides against the sets a splice reported for the edited span.
    pub fn invalidates(&self, id: MarkerId, sets: &SpliceSets) -> bool {
        if !sets.intersecting.contains(&id) {
            return false;
        }
        match self {
            InvalidationStrategy::Never => false,
            InvalidationStrategy::Touch => true,
            InvalidationStrategy::Inside => {
                !sets.preceding.contains(&id) && !sets.following.contains(&id)
            }
            InvalidationStrategy::Overlap => {
                !sets.preceding.contains(&id)
                    && !sets.following.contains(&id)
                    && !sets.empty.contains(&id)
            }
            InvalidationStrategy::Surround => {
                !sets.starting_in.contains(&id) && !sets.ending_in.contains(&id)
            }
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "never" => Some(InvalidationStrategy::Never),
            "surround" => Some(InvalidationStrategy::Surround),
            "overlap" => Some(InvalidationStrategy::Overlap),
            "inside" => Some(InvalidationStrategy::Inside),
            "touch" => Some(InvalidationStrategy::Touch),
            _ => None,
        }
    }
}

/// Options for creating a marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerParams {
    pub reversed: bool,
    pub tailed: bool,
    pub invalidate: InvalidationStrategy,
    pub exclusive: Option<bool>,
    pub persistent: bool,
    pub maintain_history: bool,
    pub properties: Properties,
}

impl Default for MarkerParams {
    fn default() -> Self {
        Self {
            reversed: false,
            tailed: true,
            invalidate: InvalidationStrategy::default(),
            exclusive: None,
            persistent: true,
            maintain_history: false,
            properties: Properties::new(),
        }
    }
}

impl MarkerParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reversed(mut self, reversed: bool) -> Self {
        self.reversed = reversed;
        self
    }

    pub fn tailed(mut self, tailed: bool) -> Self {
        self.tailed = tailed;
        self
    }

    pub fn invalidate(mut self, strategy: InvalidationStrategy) -> Self {
        self.invalidate = strategy;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = Some(exclusive);
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn maintain_history(mut self, maintain_history: bool) -> Self {
        self.maintain_history = maintain_history;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Everything needed to describe or recreate a marker at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerState {
    pub range: Range,
    pub reversed: bool,
    pub tailed: bool,
    pub valid: bool,
    pub invalidate: InvalidationStrategy,
    #[serde(default)]
    pub exclusive: Option<bool>,
    pub persistent: bool,
    pub maintain_history: bool,
    #[serde(default)]
    pub properties: Properties,
}

impl MarkerState {
    pub fn head(&self) -> Position {
        if self.reversed {
            self.range.start
        } else {
            self.range.end
        }
    }

    pub fn tail(&self) -> Position {
        if self.reversed {
            self.range.end
        } else {
            self.range.start
        }
    }

    pub(crate) fn params(&self) -> MarkerParams {
        MarkerParams {
            reversed: self.reversed,
            tailed: self.tailed,
            invalidate: self.invalidate,
            exclusive: self.exclusive,
            persistent: self.persistent,
            maintain_history: self.maintain_history,
            properties: self.properties.clone(),
        }
    }
}

/// Changes applied through the single marker update path. `None` leaves a
/// field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerUpdate {
    pub range: Option<Range>,
    pub reversed: Option<bool>,
    pub tailed: Option<bool>,
    pub valid: Option<bool>,
    pub properties: Option<Properties>,
}

/// A client-owned range that follows the text through edits. The range
/// itself lives in the marker index; this holds the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    id: MarkerId,
    reversed: bool,
    tailed: bool,
    valid: bool,
    invalidate: InvalidationStrategy,
    exclusive: Option<bool>,
    persistent: bool,
    maintain_history: bool,
    properties: Properties,
}

impl Marker {
    pub(crate) fn new(id: MarkerId, params: MarkerParams) -> Self {
        Self {
            id,
            reversed: params.reversed && params.tailed,
            tailed: params.tailed,
            valid: true,
            invalidate: params.invalidate,
            exclusive: params.exclusive,
            persistent: params.persistent,
            maintain_history: params.maintain_history,
            properties: params.properties,
        }
    }

    pub fn id(&self) -> MarkerId {
        self.id
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    pub fn has_tail(&self) -> bool {
        self.tailed
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidation_strategy(&self) -> InvalidationStrategy {
        self.invalidate
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn maintains_history(&self) -> bool {
        self.maintain_history
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// An explicit flag wins. Otherwise markers invalidated by `inside`
    /// edits, and markers without a tail, refuse text inserted at their edges.
    pub fn is_exclusive(&self) -> bool {
        match self.exclusive {
            Some(exclusive) => exclusive,
            None => self.invalidate == InvalidationStrategy::Inside || !self.tailed,
        }
    }

    pub fn state(&self, range: Range) -> MarkerState {
        MarkerState {
            range,
            reversed: self.reversed,
            tailed: self.tailed,
            valid: self.valid,
            invalidate: self.invalidate,
            exclusive: self.exclusive,
            persistent: self.persistent,
            maintain_history: self.maintain_history,
            properties: self.properties.clone(),
        }
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Applies the non-range fields of an update.
    pub(crate) fn apply(&mut self, update: &MarkerUpdate) {
        if let Some(reversed) = update.reversed {
            self.reversed = reversed;
        }
        if let Some(tailed) = update.tailed {
            self.tailed = tailed;
        }
        if let Some(valid) = update.valid {
            self.valid = valid;
        }
        if let Some(properties) = &update.properties {
            self.properties = properties.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn sets_for(id: MarkerId) -> SpliceSets {
        SpliceSets {
            intersecting: BTreeSet::from([id]),
            ..SpliceSets::default()
        }
    }

    #[test]
    fn test_inside_strategy_makes_marker_exclusive() {
        let inside = Marker::new(
            MarkerId::new(1),
            MarkerParams::new().invalidate(InvalidationStrategy::Inside),
        );
        let overlap = Marker::new(MarkerId::new(2), MarkerParams::new());
        let point = Marker::new(MarkerId::new(3), MarkerParams::new().tailed(false));
        let forced = Marker::new(
            MarkerId::new(4),
            MarkerParams::new()
                .invalidate(InvalidationStrategy::Inside)
                .exclusive(false),
        );

        assert!(inside.is_exclusive());
        assert!(!overlap.is_exclusive());
        assert!(point.is_exclusive());
        assert!(!forced.is_exclusive());
    }

    #[test]
    fn test_strategies_against_boundary_touch() {
        let id = MarkerId::new(1);
        let mut sets = sets_for(id);
        sets.preceding.insert(id);
        sets.ending_in.insert(id);

        assert!(InvalidationStrategy::Touch.invalidates(id, &sets));
        assert!(!InvalidationStrategy::Inside.invalidates(id, &sets));
        assert!(!InvalidationStrategy::Overlap.invalidates(id, &sets));
        assert!(!InvalidationStrategy::Surround.invalidates(id, &sets));
        assert!(!InvalidationStrategy::Never.invalidates(id, &sets));
    }

    #[test]
    fn test_strategies_against_interior_edit() {
        let id = MarkerId::new(1);
        let sets = sets_for(id);

        assert!(InvalidationStrategy::Touch.invalidates(id, &sets));
        assert!(InvalidationStrategy::Inside.invalidates(id, &sets));
        assert!(InvalidationStrategy::Overlap.invalidates(id, &sets));
        assert!(InvalidationStrategy::Surround.invalidates(id, &sets));
        assert!(!InvalidationStrategy::Never.invalidates(id, &sets));
    }

    #[test]
    fn test_untouched_marker_is_never_invalidated() {
        let id = MarkerId::new(1);
        let sets = SpliceSets::default();
        assert!(!InvalidationStrategy::Touch.invalidates(id, &sets));
    }

    #[test]
    fn test_head_and_tail_follow_orientation() {
        let marker = Marker::new(MarkerId::new(1), MarkerParams::new().reversed(true));
        let state = marker.state(Range::from(((0, 1), (0, 4))));
        assert_eq!(state.head(), Position::new(0, 1));
        assert_eq!(state.tail(), Position::new(0, 4));
    }

    #[test]
    fn test_strategy_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&InvalidationStrategy::Surround).unwrap(),
            "\"surround\""
        );
        assert_eq!(
            InvalidationStrategy::from_name("touch"),
            Some(InvalidationStrategy::Touch)
        );
    }
}
