//! Consolidation updates.
//!
//! Setting children and clearing children are different server calls: an
//! empty child list sent as a replace does not clear a parent. Parents with
//! children go into one `replace_bulk` with type consolidated; parents that
//! must end up empty are reset to their base type instead.

use hashbrown::HashMap;

use super::{Dimension, Element};
use crate::model::value::format_number;
use crate::model::{Consolidation, ElementId, ElementType};
use crate::transport::{ops, wire};
use crate::{Error, Result};

/// Desired children of one parent, in input order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParentGroup {
    pub parent: ElementId,
    pub parent_type: ElementType,
    pub children: Vec<(ElementId, f64)>,
}

/// Groups edges by parent, keeping parents in order of first appearance.
pub(crate) fn group_by_parent(consolidations: &[Consolidation]) -> Vec<ParentGroup> {
    let mut groups: Vec<ParentGroup> = Vec::new();
    let mut index: HashMap<ElementId, usize> = HashMap::new();
    for c in consolidations {
        let i = *index.entry(c.parent).or_insert_with(|| {
            groups.push(ParentGroup { parent: c.parent, parent_type: c.parent_type, children: Vec::new() });
            groups.len() - 1
        });
        if let Some(child) = c.child {
            groups[i].children.push((child, c.weight));
        }
    }
    groups
}

/// The `replace_bulk` parameters for parents that keep children:
/// `elements=p1,p2`, `children=c1,c2:c3`, `weights=w1,w2:w3`.
fn replace_params(groups: &[&ParentGroup]) -> (String, String, String) {
    let elements = wire::join(groups.iter().map(|g| g.parent), ",");
    let children = groups
        .iter()
        .map(|g| wire::join(g.children.iter().map(|(c, _)| *c), ","))
        .collect::<Vec<_>>()
        .join(":");
    let weights = groups
        .iter()
        .map(|g| wire::join(g.children.iter().map(|(_, w)| format_number(*w)), ","))
        .collect::<Vec<_>>()
        .join(":");
    (elements, children, weights)
}

/// Base type a cleared parent falls back to.
fn cleared_type(parent_type: ElementType) -> ElementType {
    match parent_type {
        ElementType::String => ElementType::String,
        ElementType::Numeric | ElementType::Consolidated => ElementType::Numeric,
    }
}

impl Dimension {
    /// An edge from `parent` to `child`.
    pub fn new_consolidation(&self, parent: &Element, child: &Element, weight: f64) -> Result<Consolidation> {
        Ok(Consolidation::new(parent.id(), parent.element_type()?, child.id(), weight))
    }

    /// Makes every parent named in `consolidations` have exactly the given
    /// children, in order. A parent listed only through
    /// [`Consolidation::clear`] ends up with no children.
    pub fn update_consolidations(&self, consolidations: &[Consolidation]) -> Result<()> {
        if consolidations.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "Consolidation list for dimension {} can not be empty",
                self.name()
            )));
        }

        let groups = group_by_parent(consolidations);
        let (filled, empty): (Vec<&ParentGroup>, Vec<&ParentGroup>) =
            groups.iter().partition(|g| !g.children.is_empty());

        if !filled.is_empty() {
            let (elements, children, weights) = replace_params(&filled);
            self.session().send(
                self.request(ops::ELEMENT_REPLACE_BULK)
                    .param("elements", elements)
                    .param("children", children)
                    .param("weights", weights)
                    .param("type", ElementType::Consolidated.code()),
            )?;
        }

        if !empty.is_empty() {
            let targets: Vec<(ElementId, ElementType)> =
                empty.iter().map(|g| (g.parent, cleared_type(g.parent_type))).collect();
            self.clear_consolidations(&targets)?;
        } else {
            self.end_trust();
        }
        Ok(())
    }

    /// Removes all children from the given elements.
    pub fn remove_consolidations(&self, elements: &[Element]) -> Result<()> {
        let mut targets = Vec::with_capacity(elements.len());
        for e in elements {
            targets.push((e.id(), cleared_type(e.element_type()?)));
        }
        self.clear_consolidations(&targets)
    }

    /// Removes every consolidation in the dimension. Returns the number of
    /// parents that were cleared.
    pub fn remove_all_consolidations(&self) -> Result<usize> {
        let generation = self.generation(false)?;
        let targets: Vec<(ElementId, ElementType)> = generation
            .nodes()
            .iter()
            .filter(|n| n.raw_child_count() > 0)
            .map(|n| (n.id, cleared_type(n.element_type)))
            .collect();
        self.clear_consolidations(&targets)?;
        Ok(targets.len())
    }

    /// Resets elements to a base type, one call per type.
    pub(crate) fn clear_consolidations(&self, targets: &[(ElementId, ElementType)]) -> Result<()> {
        for element_type in [ElementType::Numeric, ElementType::String] {
            let ids: Vec<ElementId> = targets
                .iter()
                .filter(|(_, t)| cleared_type(*t) == element_type)
                .map(|(id, _)| *id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            self.session().send(
                self.request(ops::ELEMENT_REPLACE_BULK)
                    .param("elements", wire::join(&ids, ","))
                    .param("type", element_type.code()),
            )?;
        }
        self.end_trust();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Connection, MemoryTransport};
    use pretty_assertions::assert_eq;

    fn edge(parent: u32, child: u32, weight: f64) -> Consolidation {
        Consolidation::new(ElementId(parent), ElementType::Consolidated, ElementId(child), weight)
    }

    #[test]
    fn test_grouping_keeps_first_appearance_order() {
        let groups = group_by_parent(&[
            edge(5, 1, 1.0),
            edge(2, 3, 1.0),
            edge(5, 4, 0.5),
            Consolidation::clear(ElementId(9), ElementType::String),
        ]);
        let parents: Vec<u32> = groups.iter().map(|g| g.parent.0).collect();
        assert_eq!(parents, vec![5, 2, 9]);
        assert_eq!(groups[0].children, vec![(ElementId(1), 1.0), (ElementId(4), 0.5)]);
        assert!(groups[2].children.is_empty());
    }

    #[test]
    fn test_replace_params_wire_form() {
        let groups = group_by_parent(&[edge(1, 2, 1.0), edge(1, 3, 2.0), edge(7, 8, 0.25)]);
        let refs: Vec<&ParentGroup> = groups.iter().collect();
        assert_eq!(
            replace_params(&refs),
            ("1,7".to_string(), "2,3:8".to_string(), "1,2:0.25".to_string())
        );
    }

    #[test]
    fn test_update_splits_replace_and_clear() {
        let transport = MemoryTransport::new();
        let conn = Connection::open(transport.clone(), Default::default()).unwrap();
        let db = conn.add_database("Demo").unwrap();
        let dim = db.add_dimension("Products").unwrap();
        dim.add_elements(&["A", "B", "C", "D", "E"], &[ElementType::Numeric; 5]).unwrap();
        let [a, b, c, d, e] =
            ["A", "B", "C", "D", "E"].map(|n| dim.element_by_name(n, false).unwrap().unwrap());
        dim.update_consolidations(&[
            Consolidation::new(d.id(), ElementType::Numeric, e.id(), 1.0),
        ])
        .unwrap();

        transport.clear_log();
        dim.update_consolidations(&[
            Consolidation::new(a.id(), ElementType::Numeric, b.id(), 1.0),
            Consolidation::new(a.id(), ElementType::Numeric, c.id(), 2.0),
            Consolidation::clear(d.id(), ElementType::Consolidated),
        ])
        .unwrap();

        let requests = transport.requests_for(ops::ELEMENT_REPLACE_BULK);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].get("type"), Some("4"));
        assert_eq!(requests[0].get("children"), Some("1,2"));
        assert_eq!(requests[1].get("type"), Some("1"));
        assert_eq!(requests[1].get("elements"), Some("3"));
        assert_eq!(d.child_count().unwrap(), 0);
        assert_eq!(a.child_count().unwrap(), 2);
    }

    #[test]
    fn test_empty_update_is_rejected() {
        let conn = Connection::open_memory().unwrap();
        let db = conn.add_database("Demo").unwrap();
        let dim = db.add_dimension("Products").unwrap();
        assert!(matches!(dim.update_consolidations(&[]), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_remove_all_consolidations() {
        let conn = Connection::open_memory().unwrap();
        let db = conn.add_database("Demo").unwrap();
        let dim = db.add_dimension("Products").unwrap();
        dim.add_elements(&["T", "X", "Y"], &[ElementType::Numeric; 3]).unwrap();
        let [t, x, y] = ["T", "X", "Y"].map(|n| dim.element_by_name(n, false).unwrap().unwrap());
        dim.update_consolidations(&[
            dim.new_consolidation(&t, &x, 1.0).unwrap(),
            dim.new_consolidation(&t, &y, 1.0).unwrap(),
        ])
        .unwrap();
        assert!(dim.has_consolidated_elements().unwrap());
        assert_eq!(dim.remove_all_consolidations().unwrap(), 1);
        assert!(!dim.has_consolidated_elements().unwrap());
    }
}
