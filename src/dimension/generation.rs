//! Immutable snapshots of a dimension's element hierarchy.
//!
//! A [`Generation`] is built in one go from the element list and swapped in
//! whole. Element nodes keep the raw parent/child id arrays exactly as the
//! server sent them; the views with hidden ids removed are computed on first
//! access and memoized inside the node, against the generation that owns it.

use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;

use crate::model::{CellValue, DimensionInfo, DimensionType, ElementId, ElementPermission, ElementType};
use crate::transport::wire::{self, Row, Rows};
use crate::Result;

// ============================================================================
// Attributes
// ============================================================================

/// An attribute of a dimension: an element of its attribute dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub id: ElementId,
    pub name: String,
    /// Numeric or string; attributes may also be consolidated groups.
    pub attribute_type: ElementType,
}

/// Attribute names and values loaded together with a generation.
#[derive(Debug, Default)]
pub(crate) struct AttributeData {
    pub attributes: Vec<Attribute>,
    /// Keyed by (attribute id, element id).
    pub values: HashMap<(ElementId, ElementId), CellValue>,
}

#[derive(Debug)]
struct AttributeSet {
    list: Vec<Attribute>,
    by_name: HashMap<String, usize>,
}

// ============================================================================
// ElementNode
// ============================================================================

/// One element as stored in a generation.
#[derive(Debug)]
pub(crate) struct ElementNode {
    pub id: ElementId,
    pub name: String,
    pub element_type: ElementType,
    pub position: u32,
    pub level: u32,
    pub indent: u32,
    pub depth: u32,
    pub permission: Option<ElementPermission>,
    raw_parents: Vec<ElementId>,
    /// (child, weight): the weight belongs to the edge, not to either end.
    raw_children: Vec<(ElementId, f64)>,
    parents: OnceLock<Vec<ElementId>>,
    children: OnceLock<Vec<(ElementId, f64)>>,
    /// Aligned with the generation's attribute list.
    attribute_values: Vec<CellValue>,
}

impl ElementNode {
    fn new(
        id: ElementId,
        name: String,
        element_type: ElementType,
        position: u32,
        raw_parents: Vec<ElementId>,
        raw_children: Vec<(ElementId, f64)>,
        prefiltered: bool,
    ) -> Self {
        let node = Self {
            id,
            name,
            element_type,
            position,
            level: 0,
            indent: 0,
            depth: 0,
            permission: None,
            raw_parents,
            raw_children,
            parents: OnceLock::new(),
            children: OnceLock::new(),
            attribute_values: Vec::new(),
        };
        if prefiltered {
            let _ = node.parents.set(node.raw_parents.clone());
            let _ = node.children.set(node.raw_children.clone());
        }
        node
    }

    /// `id;name;position;level;indent;depth;type;#parents;parents;#children;children;weights[;permission]`
    fn from_row(row: &Row, prefiltered: bool) -> Result<Self> {
        let children: Vec<ElementId> = wire::id_list(wire::field(row, 10, "element children")?)?;
        let weights = wire::f64_list(wire::field(row, 11, "element weights")?)?;
        if children.len() != weights.len() {
            return Err(crate::Error::Protocol(format!(
                "element {} has {} children but {} weights",
                wire::field_or_empty(row, 1),
                children.len(),
                weights.len()
            )));
        }

        let mut node = Self::new(
            wire::parse_id(row, 0, "element id")?,
            wire::field(row, 1, "element name")?.to_string(),
            ElementType::from_code(wire::parse_u32(row, 6, "element type")?)?,
            wire::parse_u32(row, 2, "element position")?,
            wire::id_list(wire::field(row, 8, "element parents")?)?,
            children.into_iter().zip(weights).collect(),
            prefiltered,
        );
        node.level = wire::parse_u32(row, 3, "element level")?;
        node.indent = wire::parse_u32(row, 4, "element indent")?;
        node.depth = wire::parse_u32(row, 5, "element depth")?;
        node.permission = ElementPermission::from_tag(wire::field_or_empty(row, 12).trim())?;
        Ok(node)
    }

    /// A fresh node with the same raw data and no memoized views.
    fn duplicate(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            element_type: self.element_type,
            position: self.position,
            level: self.level,
            indent: self.indent,
            depth: self.depth,
            permission: self.permission,
            raw_parents: self.raw_parents.clone(),
            raw_children: self.raw_children.clone(),
            parents: OnceLock::new(),
            children: OnceLock::new(),
            attribute_values: self.attribute_values.clone(),
        }
    }

    /// Parent ids visible in `generation`.
    pub fn parents(&self, generation: &Generation) -> &[ElementId] {
        self.parents
            .get_or_init(|| filter_visible(&self.raw_parents, |id| *id, |id| generation.contains(id)))
    }

    /// (child id, weight) pairs visible in `generation`.
    pub fn children(&self, generation: &Generation) -> &[(ElementId, f64)] {
        self.children
            .get_or_init(|| filter_visible(&self.raw_children, |(id, _)| *id, |id| generation.contains(id)))
    }

    pub fn raw_child_count(&self) -> usize {
        self.raw_children.len()
    }

    pub fn attribute_values(&self) -> &[CellValue] {
        &self.attribute_values
    }
}

/// Keeps the items whose id is visible, preserving order.
pub(crate) fn filter_visible<T: Clone>(
    items: &[T],
    id_of: impl Fn(&T) -> ElementId,
    visible: impl Fn(ElementId) -> bool,
) -> Vec<T> {
    items.iter().filter(|item| visible(id_of(item))).cloned().collect()
}

// ============================================================================
// Generation
// ============================================================================

/// One immutable snapshot of a dimension.
#[derive(Debug)]
pub(crate) struct Generation {
    pub info: DimensionInfo,
    nodes: Vec<Arc<ElementNode>>,
    by_id: HashMap<ElementId, usize>,
    by_name: HashMap<String, usize>,
    attributes: Option<AttributeSet>,
    has_consolidated: bool,
    /// Nodes are synthesized from their id on lookup.
    synthesize_ids: bool,
}

impl Generation {
    /// Builds a generation from a `/dimension/elements` response.
    ///
    /// With `list_mode` the first row is a header whose first field is `0`
    /// when the server already removed hidden elements from the id lists.
    pub fn from_rows(
        info: DimensionInfo,
        rows: &Rows,
        list_mode: bool,
        attributes: Option<AttributeData>,
    ) -> Result<Self> {
        let mut rows = rows.iter();
        let mut prefiltered = false;
        if list_mode {
            if let Some(header) = rows.next() {
                prefiltered = wire::field_or_empty(header, 0).trim() == "0";
            }
        }

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            nodes.push(ElementNode::from_row(row, prefiltered)?);
        }
        Ok(Self::assemble(info, nodes, attributes))
    }

    fn assemble(info: DimensionInfo, mut nodes: Vec<ElementNode>, attributes: Option<AttributeData>) -> Self {
        let attributes = attributes.map(|data| {
            for node in &mut nodes {
                node.attribute_values = data
                    .attributes
                    .iter()
                    .map(|attr| {
                        data.values.get(&(attr.id, node.id)).cloned().unwrap_or_else(|| {
                            if node.element_type == ElementType::String {
                                CellValue::empty_for(ElementType::String)
                            } else {
                                CellValue::empty_for(attr.attribute_type)
                            }
                        })
                    })
                    .collect();
            }
            let by_name = data
                .attributes
                .iter()
                .enumerate()
                .map(|(i, a)| (a.name.to_lowercase(), i))
                .collect();
            AttributeSet { list: data.attributes, by_name }
        });

        let mut by_id = HashMap::with_capacity(nodes.len());
        let mut by_name = HashMap::with_capacity(nodes.len());
        let mut has_consolidated = false;
        for (i, node) in nodes.iter().enumerate() {
            by_id.insert(node.id, i);
            by_name.insert(node.name.to_lowercase(), i);
            has_consolidated |= node.raw_child_count() > 0;
        }

        let synthesize_ids = info.dimension_type == DimensionType::SystemId;
        Self {
            info,
            nodes: nodes.into_iter().map(Arc::new).collect(),
            by_id,
            by_name,
            attributes,
            has_consolidated,
            synthesize_ids,
        }
    }

    /// A copy of this generation with one more base element appended.
    pub fn with_element(&self, id: ElementId, name: &str, element_type: ElementType, position: u32) -> Self {
        let mut nodes: Vec<ElementNode> = self.nodes.iter().map(|n| n.duplicate()).collect();
        let mut node = ElementNode::new(id, name.to_string(), element_type, position, Vec::new(), Vec::new(), true);
        if let Some(set) = &self.attributes {
            node.attribute_values = set
                .list
                .iter()
                .map(|a| {
                    if element_type == ElementType::String {
                        CellValue::empty_for(ElementType::String)
                    } else {
                        CellValue::empty_for(a.attribute_type)
                    }
                })
                .collect();
        }
        nodes.push(node);

        let attributes = self.attributes.as_ref().map(|set| AttributeSet {
            list: set.list.clone(),
            by_name: set.by_name.clone(),
        });
        let mut info = self.info.clone();
        info.element_count += 1;
        let mut generation = Self::assemble(info, nodes, None);
        generation.attributes = attributes;
        generation
    }

    pub fn token(&self) -> u64 {
        self.info.token
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Arc<ElementNode>] {
        &self.nodes
    }

    pub fn node(&self, id: ElementId) -> Option<Arc<ElementNode>> {
        match self.by_id.get(&id) {
            Some(&i) => Some(Arc::clone(&self.nodes[i])),
            None if self.synthesize_ids => Some(Arc::new(ElementNode::new(
                id,
                id.to_string(),
                ElementType::Numeric,
                id.0,
                Vec::new(),
                Vec::new(),
                true,
            ))),
            None => None,
        }
    }

    /// Case-insensitive.
    pub fn node_by_name(&self, name: &str) -> Option<Arc<ElementNode>> {
        self.by_name.get(&name.to_lowercase()).map(|&i| Arc::clone(&self.nodes[i]))
    }

    pub fn has_consolidated(&self) -> bool {
        self.has_consolidated
    }

    pub fn attributes(&self) -> &[Attribute] {
        self.attributes.as_ref().map(|a| a.list.as_slice()).unwrap_or(&[])
    }

    /// Index of an attribute in [`attributes`](Generation::attributes), case-insensitive.
    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes
            .as_ref()
            .and_then(|a| a.by_name.get(&name.to_lowercase()).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info(dimension_type: DimensionType) -> DimensionInfo {
        DimensionInfo {
            id: crate::model::DimensionId(1),
            name: "Products".into(),
            element_count: 0,
            max_level: 0,
            max_indent: 0,
            max_depth: 0,
            dimension_type,
            attribute_dimension: None,
            attribute_cube: None,
            rights_cube: None,
            token: 5,
        }
    }

    fn row(fields: &[&str]) -> Row {
        fields.iter().map(|f| f.to_string()).collect()
    }

    /// P1 consolidates P2 (1.0), P3 (2.0) and a hidden element 9.
    fn hierarchy_rows() -> Rows {
        vec![
            row(&["1", "P1", "0", "1", "0", "0", "4", "0", "", "3", "2,3,9", "1,2,0.5"]),
            row(&["2", "P2", "1", "0", "1", "1", "1", "2", "1,9", "0", "", ""]),
            row(&["3", "P3", "2", "0", "1", "1", "1", "1", "1", "0", "", ""]),
        ]
    }

    #[test]
    fn test_hidden_ids_filtered_lazily() {
        let generation = Generation::from_rows(info(DimensionType::Normal), &hierarchy_rows(), false, None).unwrap();
        let p1 = generation.node_by_name("p1").unwrap();
        assert_eq!(p1.children(&generation), &[(ElementId(2), 1.0), (ElementId(3), 2.0)]);
        let p2 = generation.node(ElementId(2)).unwrap();
        assert_eq!(p2.parents(&generation), &[ElementId(1)]);
        assert!(generation.has_consolidated());
    }

    #[test]
    fn test_list_mode_header() {
        let mut rows = vec![row(&["0"])];
        rows.extend(hierarchy_rows());
        let generation = Generation::from_rows(info(DimensionType::Normal), &rows, true, None).unwrap();
        assert_eq!(generation.len(), 3);
        // Header says already filtered: raw arrays are taken as they are.
        let p1 = generation.node(ElementId(1)).unwrap();
        assert_eq!(p1.children(&generation).len(), 3);
    }

    #[test]
    fn test_mismatched_weights_rejected() {
        let rows = vec![row(&["1", "P1", "0", "1", "0", "0", "4", "0", "", "2", "2,3", "1"])];
        let err = Generation::from_rows(info(DimensionType::Normal), &rows, false, None).unwrap_err();
        assert!(err.to_string().contains("2 children but 1 weights"));
    }

    #[test]
    fn test_attribute_defaults() {
        let color = Attribute { id: ElementId(0), name: "Color".into(), attribute_type: ElementType::String };
        let size = Attribute { id: ElementId(1), name: "Size".into(), attribute_type: ElementType::Numeric };
        let mut values = HashMap::new();
        values.insert((ElementId(0), ElementId(2)), CellValue::from("Red"));
        let data = AttributeData { attributes: vec![color, size], values };

        let generation =
            Generation::from_rows(info(DimensionType::Normal), &hierarchy_rows(), false, Some(data)).unwrap();
        let p2 = generation.node(ElementId(2)).unwrap();
        let p3 = generation.node(ElementId(3)).unwrap();
        assert_eq!(p2.attribute_values(), &[CellValue::from("Red"), CellValue::from(0.0)]);
        assert_eq!(p3.attribute_values(), &[CellValue::from(""), CellValue::from(0.0)]);
        assert_eq!(generation.attribute_index("COLOR"), Some(0));
    }

    #[test]
    fn test_with_element_appends() {
        let generation = Generation::from_rows(info(DimensionType::Normal), &hierarchy_rows(), false, None).unwrap();
        let next = generation.with_element(ElementId(4), "P4", ElementType::Numeric, 3);
        assert_eq!(next.len(), 4);
        assert_eq!(next.info.element_count, 1);
        assert!(next.node_by_name("P4").is_some());
        assert!(!generation.contains(ElementId(4)));
    }

    #[test]
    fn test_system_id_dimension_synthesizes_nodes() {
        let generation = Generation::from_rows(info(DimensionType::SystemId), &Vec::new(), false, None).unwrap();
        let node = generation.node(ElementId(42)).unwrap();
        assert_eq!(node.name, "42");
    }

    proptest! {
        #[test]
        fn prop_filtering_is_idempotent(
            raw in proptest::collection::vec(0u32..50, 0..40),
            visible in proptest::collection::hash_set(0u32..50, 0..50),
        ) {
            let raw: Vec<ElementId> = raw.into_iter().map(ElementId).collect();
            let is_visible = |id: ElementId| visible.contains(&id.0);
            let once = filter_visible(&raw, |id| *id, is_visible);
            let twice = filter_visible(&once, |id| *id, is_visible);
            prop_assert_eq!(&once, &twice);
            prop_assert!(once.iter().all(|id| visible.contains(&id.0)));
        }
    }
}
