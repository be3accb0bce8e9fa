//! Element handles.
//!
//! An [`Element`] remembers the generation it was read from. Accessors
//! that depend on the hierarchy first ask the dimension for its current
//! generation; when that is a newer one the element re-resolves itself by
//! id, or reports that it was deleted.

use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;

use super::generation::{ElementNode, Generation};
use super::{Dimension, DimensionInner};
use crate::model::{CellValue, DimensionId, ElementId, ElementPermission, ElementType};
use crate::transport::ops;
use crate::{Error, Result};

#[derive(Clone)]
struct Snapshot {
    generation: Arc<Generation>,
    node: Arc<ElementNode>,
}

/// A member of a dimension.
pub struct Element {
    dimension: Weak<DimensionInner>,
    dimension_id: DimensionId,
    snapshot: RwLock<Snapshot>,
}

impl Element {
    pub(crate) fn new(
        dimension: Weak<DimensionInner>,
        dimension_id: DimensionId,
        generation: Arc<Generation>,
        node: Arc<ElementNode>,
    ) -> Self {
        Self {
            dimension,
            dimension_id,
            snapshot: RwLock::new(Snapshot { generation, node }),
        }
    }

    fn dimension(&self) -> Result<Dimension> {
        self.dimension
            .upgrade()
            .map(Dimension::from_inner)
            .ok_or_else(|| Error::Detached(format!("dimension of element {} was dropped", self.name())))
    }

    /// Brings the snapshot up to the dimension's current generation.
    fn sync(&self, with_attributes: bool) -> Result<Snapshot> {
        let generation = self.dimension()?.generation(with_attributes)?;
        let current = self.snapshot.read().clone();
        if Arc::ptr_eq(&generation, &current.generation) {
            return Ok(current);
        }
        let node = generation.node(current.node.id).ok_or_else(|| Error::ElementDeleted {
            name: current.node.name.clone(),
            id: current.node.id,
        })?;
        let synced = Snapshot { generation, node };
        *self.snapshot.write() = synced.clone();
        Ok(synced)
    }

    fn sibling(&self, generation: &Arc<Generation>, node: Arc<ElementNode>) -> Element {
        Element::new(self.dimension.clone(), self.dimension_id, Arc::clone(generation), node)
    }

    // ========================================================================
    // Plain accessors (no revalidation)
    // ========================================================================

    pub fn id(&self) -> ElementId {
        self.snapshot.read().node.id
    }

    pub fn name(&self) -> String {
        self.snapshot.read().node.name.clone()
    }

    pub fn position(&self) -> u32 {
        self.snapshot.read().node.position
    }

    /// Only set when the dimension reads element permissions.
    pub fn permission(&self) -> Option<ElementPermission> {
        self.snapshot.read().node.permission
    }

    pub fn dimension_id(&self) -> DimensionId {
        self.dimension_id
    }

    /// Attribute values this handle was read with. Empty unless it came
    /// from an attribute read.
    pub fn loaded_attribute_values(&self) -> HashMap<String, CellValue> {
        let s = self.snapshot.read();
        s.generation
            .attributes()
            .iter()
            .zip(s.node.attribute_values())
            .map(|(a, v)| (a.name.clone(), v.clone()))
            .collect()
    }

    // ========================================================================
    // Hierarchy
    // ========================================================================

    pub fn element_type(&self) -> Result<ElementType> {
        Ok(self.sync(false)?.node.element_type)
    }

    pub fn level(&self) -> Result<u32> {
        Ok(self.sync(false)?.node.level)
    }

    pub fn depth(&self) -> Result<u32> {
        Ok(self.sync(false)?.node.depth)
    }

    pub fn child_count(&self) -> Result<usize> {
        let s = self.sync(false)?;
        Ok(s.node.children(&s.generation).len())
    }

    pub fn parent_count(&self) -> Result<usize> {
        let s = self.sync(false)?;
        Ok(s.node.parents(&s.generation).len())
    }

    pub fn children(&self) -> Result<Vec<Element>> {
        let s = self.sync(false)?;
        Ok(s.node
            .children(&s.generation)
            .iter()
            .filter_map(|(id, _)| s.generation.node(*id))
            .map(|n| self.sibling(&s.generation, n))
            .collect())
    }

    pub fn parents(&self) -> Result<Vec<Element>> {
        let s = self.sync(false)?;
        Ok(s.node
            .parents(&s.generation)
            .iter()
            .filter_map(|id| s.generation.node(*id))
            .map(|n| self.sibling(&s.generation, n))
            .collect())
    }

    /// Weight of this element in `parent`'s consolidation.
    ///
    /// A root element has weight 1 with no parent given. An element with
    /// parents needs the parent named.
    pub fn weight(&self, parent: Option<&Element>) -> Result<f64> {
        let s = self.sync(false)?;
        let parents = s.node.parents(&s.generation);
        match parent {
            None if parents.is_empty() => Ok(1.0),
            None => Err(Error::InvalidOperation(format!(
                "Element {} has parents; a parent is needed to read its weight",
                s.node.name
            ))),
            Some(p) => {
                let edge = s
                    .generation
                    .node(p.id())
                    .filter(|_| parents.contains(&p.id()))
                    .and_then(|pn| pn.children(&s.generation).iter().find(|(c, _)| *c == s.node.id).copied());
                edge.map(|(_, w)| w).ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "Element {} is not a parent of element {}",
                        p.name(),
                        s.node.name
                    ))
                })
            }
        }
    }

    /// Every element at or below this one, by name, with its children.
    pub fn subtree(&self) -> Result<HashMap<String, Vec<Element>>> {
        let s = self.sync(false)?;
        let mut map = HashMap::new();
        let mut seen = HashSet::new();
        let mut stack = vec![Arc::clone(&s.node)];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.id) {
                continue;
            }
            let children: Vec<Arc<ElementNode>> = node
                .children(&s.generation)
                .iter()
                .filter_map(|(id, _)| s.generation.node(*id))
                .collect();
            stack.extend(children.iter().cloned());
            map.insert(
                node.name.clone(),
                children.into_iter().map(|c| self.sibling(&s.generation, c)).collect(),
            );
        }
        Ok(map)
    }

    /// Attribute values of this element and everything below it, by
    /// element name.
    pub fn subtree_attributes(&self) -> Result<HashMap<String, HashMap<String, CellValue>>> {
        let s = self.sync(true)?;
        let attributes = s.generation.attributes();
        let mut map = HashMap::new();
        let mut stack = vec![Arc::clone(&s.node)];
        while let Some(node) = stack.pop() {
            if map.contains_key(&node.name) {
                continue;
            }
            stack.extend(node.children(&s.generation).iter().filter_map(|(id, _)| s.generation.node(*id)));
            let values = attributes
                .iter()
                .zip(node.attribute_values())
                .map(|(a, v)| (a.name.clone(), v.clone()))
                .collect();
            map.insert(node.name.clone(), values);
        }
        Ok(map)
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    /// `None` if the dimension has no attribute of that name.
    pub fn attribute_value(&self, attribute: &str) -> Result<Option<CellValue>> {
        let s = self.sync(true)?;
        Ok(s.generation
            .attribute_index(attribute)
            .and_then(|i| s.node.attribute_values().get(i).cloned()))
    }

    /// Attribute name to value, for every attribute of the dimension.
    pub fn attribute_values(&self) -> Result<HashMap<String, CellValue>> {
        let s = self.sync(true)?;
        Ok(s.generation
            .attributes()
            .iter()
            .zip(s.node.attribute_values())
            .map(|(a, v)| (a.name.clone(), v.clone()))
            .collect())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub fn rename(&self, new_name: &str) -> Result<()> {
        let dimension = self.dimension()?;
        dimension.session().send(
            dimension
                .request(ops::ELEMENT_RENAME)
                .param("element", self.id())
                .param("new_name", new_name),
        )?;
        dimension.end_trust();
        Ok(())
    }

    pub fn move_to(&self, position: u32) -> Result<()> {
        let dimension = self.dimension()?;
        dimension.session().send(
            dimension
                .request(ops::ELEMENT_MOVE)
                .param("element", self.id())
                .param("position", position),
        )?;
        dimension.end_trust();
        Ok(())
    }
}

impl Clone for Element {
    fn clone(&self) -> Self {
        Self {
            dimension: self.dimension.clone(),
            dimension_id: self.dimension_id,
            snapshot: RwLock::new(self.snapshot.read().clone()),
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.dimension_id == other.dimension_id && self.id() == other.id()
    }
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot.read();
        f.debug_struct("Element")
            .field("id", &s.node.id)
            .field("name", &s.node.name)
            .field("type", &s.node.element_type)
            .finish()
    }
}
