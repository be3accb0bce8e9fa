//! Attributes: elements of the linked attribute dimension, with their
//! values stored in the linked attribute cube at `(attribute, element)`.

use super::{Attribute, Dimension, Element};
use crate::cube::{self, load};
use crate::model::{Area, CellLoadContext, CellPath, CellValue, Consolidation, CubeId, DimensionId, ElementType};
use crate::{Error, Result};

impl Dimension {
    /// Attribute dimension and cube ids. Fetches fresh info once if the
    /// last known info has no link.
    fn attribute_link(&self) -> Result<(DimensionId, CubeId)> {
        self.fail_if_no_attributes()?;
        let mut info = self.last_info();
        if !info.has_attribute_link() {
            info = self.info()?;
        }
        match (info.attribute_dimension, info.attribute_cube) {
            (Some(dim), Some(cube)) => Ok((dim, cube)),
            _ => Err(Error::NotFound(format!("Dimension {} has no attribute dimension", self.name()))),
        }
    }

    fn attribute_dimension(&self) -> Result<Dimension> {
        let (id, _) = self.attribute_link()?;
        self.linked_dimension(id)
    }

    /// Attributes in attribute-dimension order.
    pub fn attributes(&self) -> Result<Vec<Attribute>> {
        let generation = self.attribute_dimension()?.generation(false)?;
        Ok(generation
            .nodes()
            .iter()
            .map(|n| Attribute { id: n.id, name: n.name.clone(), attribute_type: n.element_type })
            .collect())
    }

    /// Case-insensitive; `None` if there is no such attribute.
    pub fn attribute_by_name(&self, name: &str) -> Result<Option<Attribute>> {
        let generation = self.attribute_dimension()?.generation(false)?;
        Ok(generation
            .node_by_name(name)
            .map(|n| Attribute { id: n.id, name: n.name.clone(), attribute_type: n.element_type }))
    }

    fn existing_attribute(&self, attribute: &Attribute) -> Result<()> {
        let generation = self.attribute_dimension()?.generation(false)?;
        if generation.contains(attribute.id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!(
                "Attribute {} does not exist in dimension {}",
                attribute.name,
                self.name()
            )))
        }
    }

    // ========================================================================
    // Attribute definitions
    // ========================================================================

    pub fn add_attribute(&self, name: &str, attribute_type: ElementType) -> Result<Attribute> {
        let attribute_dimension = self.attribute_dimension()?;
        let element = attribute_dimension.add_base_element(name, attribute_type)?;
        attribute_dimension.end_trust();
        self.invalidate_attributes();
        Ok(Attribute { id: element.id(), name: element.name(), attribute_type })
    }

    pub fn add_attributes(&self, names: &[&str], types: &[ElementType]) -> Result<()> {
        let attribute_dimension = self.attribute_dimension()?;
        attribute_dimension.add_elements(names, types)?;
        self.invalidate_attributes();
        Ok(())
    }

    /// Deletes attributes and their values; each must exist.
    pub fn remove_attributes(&self, attributes: &[Attribute]) -> Result<()> {
        if attributes.is_empty() {
            return Ok(());
        }
        let attribute_dimension = self.attribute_dimension()?;
        let generation = attribute_dimension.generation(false)?;
        let mut elements = Vec::with_capacity(attributes.len());
        for attribute in attributes {
            let node = generation.node(attribute.id).ok_or_else(|| {
                Error::NotFound(format!(
                    "Attribute {} can not be deleted. It does not exist in dimension {}",
                    attribute.name,
                    self.name()
                ))
            })?;
            elements.push(Element::new(attribute_dimension.downgrade(), attribute_dimension.id(), generation.clone(), node));
        }
        attribute_dimension.remove_elements(&elements)?;
        self.invalidate_attributes();
        Ok(())
    }

    /// Groups `child` under `parent` in the attribute dimension, next to
    /// the children `parent` already has.
    pub fn add_attribute_consolidation(&self, parent: &Attribute, child: &Attribute) -> Result<()> {
        let attribute_dimension = self.attribute_dimension()?;
        let generation = attribute_dimension.generation(false)?;
        let mut edges: Vec<Consolidation> = generation
            .node(parent.id)
            .map(|node| {
                node.children(&generation)
                    .iter()
                    .filter(|(id, _)| *id != child.id)
                    .map(|(id, weight)| Consolidation::new(parent.id, parent.attribute_type, *id, *weight))
                    .collect()
            })
            .unwrap_or_default();
        edges.push(Consolidation::new(parent.id, parent.attribute_type, child.id, 1.0));
        attribute_dimension.update_consolidations(&edges)?;
        self.invalidate_attributes();
        Ok(())
    }

    pub fn remove_attribute_consolidations(&self, attribute: &Attribute) -> Result<()> {
        let attribute_dimension = self.attribute_dimension()?;
        attribute_dimension.update_consolidations(&[Consolidation::clear(attribute.id, attribute.attribute_type)])?;
        self.invalidate_attributes();
        Ok(())
    }

    // ========================================================================
    // Attribute values
    // ========================================================================

    /// Writes one attribute for several elements.
    pub fn add_attribute_values(&self, attribute: &Attribute, elements: &[Element], values: &[CellValue]) -> Result<()> {
        if elements.len() != values.len() {
            return Err(Error::InvalidOperation(format!(
                "{} elements but {} values for attribute {}",
                elements.len(),
                values.len(),
                attribute.name
            )));
        }
        if elements.is_empty() {
            return Ok(());
        }
        let (_, attribute_cube) = self.attribute_link()?;
        self.existing_attribute(attribute)?;

        let paths: Vec<CellPath> = elements.iter().map(|e| CellPath::from_slice(&[attribute.id, e.id()])).collect();
        let context = CellLoadContext {
            block_size: self.session().config().bulk.load_block_size,
            ..CellLoadContext::default()
        };
        let written = load::write_cells(
            self.session(),
            self.database_id(),
            attribute_cube,
            2,
            &paths,
            values,
            &context,
            &[],
        );
        self.invalidate_attributes();
        written.map(|_| ())
    }

    /// Clears one attribute for several elements.
    pub fn remove_attribute_values(&self, attribute: &Attribute, elements: &[Element]) -> Result<()> {
        if elements.is_empty() {
            return Ok(());
        }
        let (_, attribute_cube) = self.attribute_link()?;
        let area = Area::all(2)
            .with(0, [attribute.id])
            .with(1, elements.iter().map(Element::id));
        self.session()
            .send(cube::clear_request(self.database_id(), attribute_cube, Some(&area)))?;
        self.invalidate_attributes();
        Ok(())
    }
}
