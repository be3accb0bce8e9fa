//! Consolidation edges.

use serde::{Deserialize, Serialize};

use super::{ElementId, ElementType};

/// A desired (parent, child, weight) edge.
///
/// Transient: only used to describe the target tree shape of a bulk update.
/// An edge without a child states that the parent must end up with no
/// children at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consolidation {
    pub parent: ElementId,
    /// Needed to pick the right element type when the parent is cleared.
    pub parent_type: ElementType,
    pub child: Option<ElementId>,
    pub weight: f64,
}

impl Consolidation {
    pub fn new(parent: ElementId, parent_type: ElementType, child: ElementId, weight: f64) -> Self {
        Self { parent, parent_type, child: Some(child), weight }
    }

    /// The parent must end up with no children.
    pub fn clear(parent: ElementId, parent_type: ElementType) -> Self {
        Self { parent, parent_type, child: None, weight: 0.0 }
    }
}
