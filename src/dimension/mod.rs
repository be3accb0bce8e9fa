//! # Dimension
//!
//! A dimension mirrors its element hierarchy as one immutable
//! [`Generation`]. The cache has three states: nothing built, structure
//! only, or structure plus attribute values. A generation with attributes
//! also satisfies a structure-only read.
//!
//! Validity follows the usual two tiers (trust window, then token). When
//! attributes are wanted the token of the linked attribute dimension is
//! compared as well. Attribute *values* live in the attribute cube and do
//! not move either token, so every attribute write drops the cache back to
//! structure-only explicitly.

mod attributes;
mod consolidate;
mod element;
mod generation;

pub use element::Element;
pub use generation::Attribute;

pub(crate) use generation::Generation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::cache::TrustWindow;
use crate::connection::Session;
use crate::cube::CellsExporter;
use crate::database::{Database, DatabaseInner};
use crate::model::{
    Area, CellExportContext, CellValue, CellsExportType, DatabaseId, DimensionId, DimensionInfo,
    DimensionType, ElementId, ElementType,
};
use crate::transport::{ops, wire, Request};
use crate::{Error, Result};

use generation::AttributeData;

// ============================================================================
// Cache state
// ============================================================================

#[derive(Debug, Clone)]
enum CacheState {
    Unbuilt,
    Structure(Arc<Generation>),
    WithAttributes(Arc<Generation>),
}

impl CacheState {
    /// The generation if it can serve a read of the given kind.
    fn usable(&self, with_attributes: bool) -> Option<&Arc<Generation>> {
        match self {
            CacheState::WithAttributes(g) => Some(g),
            CacheState::Structure(g) if !with_attributes => Some(g),
            _ => None,
        }
    }

    fn current(&self) -> Option<&Arc<Generation>> {
        match self {
            CacheState::Unbuilt => None,
            CacheState::Structure(g) | CacheState::WithAttributes(g) => Some(g),
        }
    }
}

struct DimensionState {
    cache: CacheState,
    window: TrustWindow,
    token: Option<u64>,
    attribute_token: Option<u64>,
}

// ============================================================================
// Dimension
// ============================================================================

/// One axis of a cube: a hierarchy of elements.
#[derive(Clone)]
pub struct Dimension {
    inner: Arc<DimensionInner>,
}

pub(crate) struct DimensionInner {
    session: Arc<Session>,
    database: Weak<DatabaseInner>,
    database_id: DatabaseId,
    id: DimensionId,
    name: RwLock<String>,
    dimension_type: DimensionType,
    /// Last info seen, for the attribute links.
    info: RwLock<DimensionInfo>,
    with_permission: AtomicBool,
    state: Mutex<DimensionState>,
}

impl Dimension {
    pub(crate) fn new(database: &Database, info: &DimensionInfo, ttl_secs: u64) -> Self {
        Self {
            inner: Arc::new(DimensionInner {
                session: Arc::clone(database.session()),
                database: database.downgrade(),
                database_id: database.id(),
                id: info.id,
                name: RwLock::new(info.name.clone()),
                dimension_type: info.dimension_type,
                info: RwLock::new(info.clone()),
                with_permission: AtomicBool::new(false),
                state: Mutex::new(DimensionState {
                    cache: CacheState::Unbuilt,
                    window: TrustWindow::from_secs(ttl_secs),
                    token: None,
                    attribute_token: None,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DimensionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<DimensionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut current = self.inner.name.write();
        if *current != name {
            *current = name.to_string();
        }
    }

    pub fn id(&self) -> DimensionId {
        self.inner.id
    }

    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    pub fn dimension_type(&self) -> DimensionType {
        self.inner.dimension_type
    }

    pub fn database_id(&self) -> DatabaseId {
        self.inner.database_id
    }

    /// True if both values refer to the same cached handle.
    pub fn same_handle(&self, other: &Dimension) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fresh info from the server, bypassing the cache.
    pub fn info(&self) -> Result<DimensionInfo> {
        let rows = self.inner.session.send(
            Request::new(ops::DIMENSION_INFO)
                .param("database", self.database_id())
                .param("dimension", self.id()),
        )?;
        let info = DimensionInfo::from_row(wire::first_row(&rows, "dimension info")?)?;
        *self.inner.info.write() = info.clone();
        Ok(info)
    }

    pub(crate) fn last_info(&self) -> DimensionInfo {
        self.inner.info.read().clone()
    }

    pub(crate) fn database(&self) -> Result<Database> {
        self.inner
            .database
            .upgrade()
            .map(Database::from_inner)
            .ok_or_else(|| Error::Detached(format!("database of dimension {} was dropped", self.name())))
    }

    fn request(&self, operation: &str) -> Request {
        Request::new(operation)
            .param("database", self.database_id())
            .param("dimension", self.id())
    }

    // ========================================================================
    // Cache
    // ========================================================================

    /// Returns a valid generation, rebuilding it when the tokens moved.
    pub(crate) fn generation(&self, with_attributes: bool) -> Result<Arc<Generation>> {
        if with_attributes {
            self.fail_if_no_attributes()?;
        }

        let mut state = self.inner.state.lock();
        if let Some(generation) = state.cache.usable(with_attributes).cloned() {
            if state.window.in_trust() {
                return Ok(generation);
            }

            let info = self.info()?;
            let attribute_token = match (with_attributes, info.attribute_dimension) {
                (true, Some(attr_id)) => Some(self.dimension_token(attr_id)?),
                _ => None,
            };
            let unchanged = state.token == Some(info.token)
                && (!with_attributes || state.attribute_token == attribute_token);
            if unchanged {
                tracing::trace!(dimension = %self.name(), token = info.token, "token unchanged, trust renewed");
                state.window.renew();
                return Ok(generation);
            }
            return self.rebuild(&mut state, info, with_attributes);
        }

        let info = self.info()?;
        self.rebuild(&mut state, info, with_attributes)
    }

    fn rebuild(
        &self,
        state: &mut DimensionState,
        info: DimensionInfo,
        with_attributes: bool,
    ) -> Result<Arc<Generation>> {
        let (attributes, attribute_token) = if with_attributes {
            let (data, token) = self.load_attributes(&info, None)?;
            (Some(data), token)
        } else {
            (None, None)
        };

        let list_mode = self.inner.session.capabilities().element_list_mode;
        let rows = self.inner.session.send(
            self.request(ops::DIMENSION_ELEMENTS)
                .flag("show_permission", self.inner.with_permission.load(Ordering::Relaxed))
                .flag("mode", list_mode),
        )?;

        tracing::debug!(
            dimension = %self.name(),
            old = ?state.token,
            new = info.token,
            with_attributes,
            "rebuilding dimension cache"
        );
        self.set_name(&info.name);
        let generation = Arc::new(Generation::from_rows(info, &rows, list_mode, attributes)?);

        state.token = Some(generation.token());
        state.attribute_token = attribute_token;
        state.cache = if with_attributes {
            CacheState::WithAttributes(Arc::clone(&generation))
        } else {
            CacheState::Structure(Arc::clone(&generation))
        };
        state.window.renew();
        Ok(generation)
    }

    /// Attribute names from the attribute dimension plus the stored values
    /// from the attribute cube, for every element or just `only`.
    fn load_attributes(
        &self,
        info: &DimensionInfo,
        only: Option<ElementId>,
    ) -> Result<(AttributeData, Option<u64>)> {
        let (Some(attr_dim_id), Some(attr_cube_id)) = (info.attribute_dimension, info.attribute_cube) else {
            return Ok((AttributeData::default(), None));
        };

        let attribute_dimension = self.linked_dimension(attr_dim_id)?;
        let token = self.dimension_token(attr_dim_id)?;
        let mut attr_generation = attribute_dimension.generation(false)?;
        if attr_generation.token() != token {
            attribute_dimension.end_trust();
            attr_generation = attribute_dimension.generation(false)?;
        }

        let attributes: Vec<Attribute> = attr_generation
            .nodes()
            .iter()
            .map(|n| Attribute { id: n.id, name: n.name.clone(), attribute_type: n.element_type })
            .collect();

        let mut values = HashMap::new();
        if !attributes.is_empty() {
            let context = CellExportContext {
                export_type: CellsExportType::Both,
                block_size: self.inner.session.config().bulk.attribute_export_block_size,
                use_rules: true,
                only_bases: false,
                skip_empty: true,
            };
            let area = match only {
                Some(id) => Area::all(2).with(1, [id]),
                None => Area::all(2),
            };
            let exporter = CellsExporter::new(
                Arc::clone(&self.inner.session),
                self.database_id(),
                attr_cube_id,
                &area,
                context,
            )?;
            for cell in exporter {
                let cell = cell?;
                if let [attribute, element] = cell.path[..] {
                    values.insert((attribute, element), cell.value);
                }
            }
        }

        Ok((AttributeData { attributes, values }, Some(token)))
    }

    fn dimension_token(&self, id: DimensionId) -> Result<u64> {
        self.inner.session.token(
            Request::new(ops::DIMENSION_INFO)
                .param("database", self.database_id())
                .param("dimension", id),
        )
    }

    fn linked_dimension(&self, id: DimensionId) -> Result<Dimension> {
        self.database()?.dimension_by_id(id)?.ok_or_else(|| {
            Error::NotFound(format!("Dimension with id {id} linked to dimension {} does not exist", self.name()))
        })
    }

    fn fail_if_no_attributes(&self) -> Result<()> {
        if self.dimension_type().allows_attributes() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "Dimension {} of type {:?} can not have attributes. Only dimensions of type normal or user info can have attributes.",
                self.name(),
                self.dimension_type()
            )))
        }
    }

    /// Drops attribute values but keeps the structure.
    pub(crate) fn invalidate_attributes(&self) {
        let mut state = self.inner.state.lock();
        if let CacheState::WithAttributes(g) = &state.cache {
            state.cache = CacheState::Structure(Arc::clone(g));
        }
        state.attribute_token = None;
        state.window.end_trust();
    }

    pub(crate) fn end_trust(&self) {
        self.inner.state.lock().window.end_trust();
    }

    pub fn set_cache_trust_expiry(&self, secs: u64) {
        self.inner.state.lock().window.set_duration(Duration::from_secs(secs));
    }

    /// Drops the cached hierarchy immediately.
    pub fn reset_cache(&self) {
        let mut state = self.inner.state.lock();
        state.cache = CacheState::Unbuilt;
        state.token = None;
        state.attribute_token = None;
        state.window.end_trust();
    }

    /// Whether element lists carry the caller's permission on each element.
    /// Changing it drops the cache.
    pub fn set_with_element_permission(&self, with_permission: bool) {
        if self.inner.with_permission.swap(with_permission, Ordering::Relaxed) != with_permission {
            self.reset_cache();
        }
    }

    // ========================================================================
    // Element reads
    // ========================================================================

    fn element(&self, generation: &Arc<Generation>, node: Arc<generation::ElementNode>) -> Element {
        Element::new(self.downgrade(), self.id(), Arc::clone(generation), node)
    }

    fn collect(&self, generation: &Arc<Generation>, keep: impl Fn(&generation::ElementNode) -> bool) -> Vec<Element> {
        generation
            .nodes()
            .iter()
            .filter(|n| keep(n))
            .map(|n| self.element(generation, Arc::clone(n)))
            .collect()
    }

    /// Every element, in position order.
    pub fn elements(&self, with_attributes: bool) -> Result<Vec<Element>> {
        let generation = self.generation(with_attributes)?;
        Ok(self.collect(&generation, |_| true))
    }

    /// Elements without visible parents.
    pub fn root_elements(&self, with_attributes: bool) -> Result<Vec<Element>> {
        let generation = self.generation(with_attributes)?;
        Ok(self.collect(&generation, |n| n.parents(&generation).is_empty()))
    }

    /// Elements without visible children.
    pub fn base_elements(&self, with_attributes: bool) -> Result<Vec<Element>> {
        let generation = self.generation(with_attributes)?;
        Ok(self.collect(&generation, |n| n.children(&generation).is_empty()))
    }

    /// Case-insensitive lookup; `None` if there is no such element.
    pub fn element_by_name(&self, name: &str, with_attributes: bool) -> Result<Option<Element>> {
        let generation = self.generation(with_attributes)?;
        Ok(generation.node_by_name(name).map(|n| self.element(&generation, n)))
    }

    /// Resolves every name or fails naming the first missing one.
    pub fn elements_by_name(&self, names: &[&str], with_attributes: bool) -> Result<Vec<Element>> {
        let generation = self.generation(with_attributes)?;
        names
            .iter()
            .map(|name| {
                generation
                    .node_by_name(name)
                    .map(|n| self.element(&generation, n))
                    .ok_or_else(|| {
                        Error::NotFound(format!("Element {name} does not exist in dimension {}", self.name()))
                    })
            })
            .collect()
    }

    pub fn element_by_id(&self, id: ElementId) -> Result<Option<Element>> {
        let generation = self.generation(false)?;
        Ok(generation.node(id).map(|n| self.element(&generation, n)))
    }

    /// Reads one element straight from the server without loading the
    /// dimension. `None` if the server does not know the name.
    ///
    /// With attributes, only this element's values are exported from the
    /// attribute cube; [`Element::loaded_attribute_values`] reads them.
    /// The returned element is not part of the cached hierarchy; its
    /// hierarchy accessors resolve it against the cache on first use.
    pub fn single_element(&self, name: &str, with_attributes: bool) -> Result<Option<Element>> {
        if with_attributes {
            self.fail_if_no_attributes()?;
        }
        let rows = match self
            .inner
            .session
            .send(self.request(ops::ELEMENT_INFO).param("name_element", name))
        {
            Ok(rows) => rows,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let info = self.last_info();
        let attributes = if with_attributes {
            let id: ElementId = wire::parse_id(row, 0, "element id")?;
            Some(self.load_attributes(&info, Some(id))?.0)
        } else {
            None
        };
        let generation = Arc::new(Generation::from_rows(info, &vec![row.clone()], false, attributes)?);
        Ok(generation.nodes().first().map(|n| self.element(&generation, Arc::clone(n))))
    }

    pub fn has_consolidated_elements(&self) -> Result<bool> {
        Ok(self.generation(false)?.has_consolidated())
    }

    /// Element name to its children.
    pub fn children_map(&self) -> Result<HashMap<String, Vec<Element>>> {
        let generation = self.generation(false)?;
        let mut map = HashMap::with_capacity(generation.len());
        for node in generation.nodes() {
            let children = node
                .children(&generation)
                .iter()
                .filter_map(|(id, _)| generation.node(*id))
                .map(|child| self.element(&generation, child))
                .collect();
            map.insert(node.name.clone(), children);
        }
        Ok(map)
    }

    /// Element name to (parent name to weight).
    pub fn weights_map(&self) -> Result<HashMap<String, HashMap<String, f64>>> {
        let generation = self.generation(false)?;
        let mut map = HashMap::with_capacity(generation.len());
        for node in generation.nodes() {
            let mut weights = HashMap::new();
            for parent_id in node.parents(&generation) {
                let Some(parent) = generation.node(*parent_id) else { continue };
                if let Some((_, w)) = parent.children(&generation).iter().find(|(c, _)| *c == node.id) {
                    weights.insert(parent.name.clone(), *w);
                }
            }
            map.insert(node.name.clone(), weights);
        }
        Ok(map)
    }

    /// Element name to (attribute name to value).
    pub fn attributes_map(&self) -> Result<HashMap<String, HashMap<String, CellValue>>> {
        let generation = self.generation(true)?;
        let attributes = generation.attributes();
        let mut map = HashMap::with_capacity(generation.len());
        for node in generation.nodes() {
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
    // Element mutations
    // ========================================================================

    /// Creates elements in one call when the server takes per-element
    /// types, otherwise one call per type. Consolidated counts as numeric.
    pub fn add_elements(&self, names: &[&str], types: &[ElementType]) -> Result<()> {
        if names.len() != types.len() {
            return Err(Error::InvalidOperation(format!(
                "{} element names but {} types",
                names.len(),
                types.len()
            )));
        }
        if names.is_empty() {
            return Ok(());
        }

        let create_code = |t: &ElementType| match t {
            ElementType::String => ElementType::String.code(),
            _ => ElementType::Numeric.code(),
        };

        if self.inner.session.capabilities().typed_element_create {
            self.inner.session.send(
                self.request(ops::ELEMENT_REPLACE_BULK)
                    .param("name_elements", wire::join_quoted(names, ','))
                    .param("types", wire::join(types.iter().map(create_code), ",")),
            )?;
        } else {
            for code in [ElementType::Numeric.code(), ElementType::String.code()] {
                let group: Vec<&str> = names
                    .iter()
                    .zip(types)
                    .filter(|(_, t)| create_code(*t) == code)
                    .map(|(n, _)| *n)
                    .collect();
                if group.is_empty() {
                    continue;
                }
                self.inner.session.send(
                    self.request(ops::ELEMENT_REPLACE_BULK)
                        .param("name_elements", wire::join_quoted(&group, ','))
                        .param("type", code),
                )?;
            }
        }
        self.end_trust();
        Ok(())
    }

    /// Creates elements with the names and types of the given ones, which
    /// may belong to another dimension. Existing names keep their element.
    pub fn append_elements(&self, elements: &[Element]) -> Result<()> {
        let names: Vec<String> = elements.iter().map(Element::name).collect();
        let types = elements.iter().map(Element::element_type).collect::<Result<Vec<_>>>()?;
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.add_elements(&names, &types)
    }

    /// Creates one base element and merges it into the cached hierarchy
    /// without forcing a rebuild. Re-adding an existing name returns that
    /// element as the server has it.
    pub fn add_base_element(&self, name: &str, element_type: ElementType) -> Result<Element> {
        if element_type == ElementType::Consolidated {
            return Err(Error::InvalidOperation(format!(
                "Element {name}: only numeric and string types can be used for a base element"
            )));
        }
        let rows = self.inner.session.send(
            self.request(ops::ELEMENT_REPLACE)
                .param("name_element", name)
                .param("type", element_type.code()),
        )?;
        let row = wire::first_row(&rows, "element replace")?;
        let id: ElementId = wire::parse_id(row, 0, "element id")?;
        let created_name = wire::field(row, 1, "element name")?.to_string();
        let position = wire::parse_u32(row, 2, "element position")?;

        let mut state = self.inner.state.lock();
        let current = state.cache.current();
        let generation = match current {
            // An existing name: the server kept the element's type and children.
            Some(g) if g.contains(id) => {
                state.token = None;
                state.window.end_trust();
                drop(state);
                self.generation(false)?
            }
            Some(g) => {
                let merged = Arc::new(g.with_element(id, &created_name, element_type, position));
                state.cache = match state.cache {
                    CacheState::WithAttributes(_) => CacheState::WithAttributes(Arc::clone(&merged)),
                    _ => CacheState::Structure(Arc::clone(&merged)),
                };
                drop(state);
                merged
            }
            None => {
                drop(state);
                Arc::new(Generation::from_rows(self.last_info(), &vec![row.clone()], false, None)?)
            }
        };

        let node = generation.node(id).ok_or_else(|| {
            Error::Protocol(format!("element {created_name} missing after creation"))
        })?;
        Ok(self.element(&generation, node))
    }

    /// Moves elements to new positions, in one call when the server
    /// supports it.
    pub fn move_elements(&self, elements: &[Element], positions: &[u32]) -> Result<()> {
        if elements.len() != positions.len() {
            return Err(Error::InvalidOperation(
                "Positions and elements arrays should have the same length".into(),
            ));
        }
        if elements.is_empty() {
            return Err(Error::InvalidOperation("Positions array length should be at least one".into()));
        }

        if elements.len() > 1 && self.inner.session.capabilities().bulk_move {
            self.inner.session.send(
                self.request(ops::ELEMENT_MOVE_BULK)
                    .param("elements", wire::join(elements.iter().map(Element::id), ","))
                    .param("positions", wire::join(positions, ",")),
            )?;
            self.end_trust();
        } else {
            for (element, position) in elements.iter().zip(positions) {
                element.move_to(*position)?;
            }
        }
        Ok(())
    }

    /// Deletes elements; each must exist in the current hierarchy.
    pub fn remove_elements(&self, elements: &[Element]) -> Result<()> {
        if elements.is_empty() {
            return Ok(());
        }
        let generation = self.generation(false)?;
        for element in elements {
            if !generation.contains(element.id()) {
                return Err(Error::NotFound(format!(
                    "Element {} can not be deleted. It does not exist in dimension {}",
                    element.name(),
                    self.name()
                )));
            }
        }
        self.inner.session.send(
            self.request(ops::ELEMENT_DESTROY_BULK)
                .param("elements", wire::join(elements.iter().map(Element::id), ",")),
        )?;
        self.end_trust();
        Ok(())
    }

    /// Changes base elements between numeric and string. This also drops
    /// their consolidations.
    pub fn update_elements_type(&self, elements: &[Element], element_type: ElementType) -> Result<()> {
        if element_type == ElementType::Consolidated {
            return Err(Error::InvalidOperation(
                "Only element type string or numeric can be used in update_elements_type".into(),
            ));
        }
        for element in elements {
            let current = element.element_type()?;
            if current == ElementType::Consolidated {
                return Err(Error::InvalidOperation(format!(
                    "update_elements_type can not be applied to consolidated element {}",
                    element.name()
                )));
            }
            if current == element_type {
                return Err(Error::InvalidOperation(format!(
                    "Element {} has already type {}",
                    element.name(),
                    element_type.type_name()
                )));
            }
        }
        let targets: Vec<(ElementId, ElementType)> = elements.iter().map(|e| (e.id(), element_type)).collect();
        self.clear_consolidations(&targets)
    }

    pub fn rename(&self, new_name: &str) -> Result<()> {
        self.inner
            .session
            .send(self.request(ops::DIMENSION_RENAME).param("new_name", new_name))?;
        self.set_name(new_name);
        self.end_trust();
        if let Ok(database) = self.database() {
            database.end_trust();
        }
        Ok(())
    }
}

impl PartialEq for Dimension {
    fn eq(&self, other: &Self) -> bool {
        self.database_id() == other.database_id() && self.id() == other.id()
    }
}

impl std::fmt::Debug for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dimension")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("type", &self.dimension_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CacheConfig, ClientConfig};
    use crate::model::ServerVersion;
    use crate::transport::ops;
    use crate::{CellValue, Connection, Database, Dimension, ElementType, Error, MemoryTransport};

    fn setup_with(transport: MemoryTransport, config: ClientConfig) -> (MemoryTransport, Database, Dimension) {
        let conn = Connection::open(transport.clone(), config).unwrap();
        let db = conn.add_database("Demo").unwrap();
        let dim = db.add_dimension("Products").unwrap();
        (transport, db, dim)
    }

    fn setup() -> (MemoryTransport, Database, Dimension) {
        setup_with(MemoryTransport::new(), ClientConfig::default())
    }

    #[test]
    fn test_elements_in_position_order() {
        let (_, _, dim) = setup();
        dim.add_elements(&["B", "A", "S"], &[ElementType::Numeric, ElementType::Numeric, ElementType::String])
            .unwrap();
        let names: Vec<String> = dim.elements(false).unwrap().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["B", "A", "S"]);
        assert_eq!(dim.element_by_name("s", false).unwrap().unwrap().element_type().unwrap(), ElementType::String);
    }

    #[test]
    fn test_untyped_create_splits_by_type() {
        let transport = MemoryTransport::new().with_version(ServerVersion::new(5, 0, 0, 4000));
        let (transport, _, dim) = setup_with(transport, ClientConfig::default());
        transport.clear_log();
        dim.add_elements(&["N1", "S1", "N2"], &[ElementType::Numeric, ElementType::String, ElementType::Consolidated])
            .unwrap();
        assert_eq!(transport.count(ops::ELEMENT_REPLACE_BULK), 2);
        assert_eq!(dim.elements(false).unwrap().len(), 3);
    }

    #[test]
    fn test_mismatched_names_and_types() {
        let (transport, _, dim) = setup();
        transport.clear_log();
        let err = dim.add_elements(&["A"], &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_trusted_reads_send_nothing() {
        let (transport, _, dim) = setup();
        dim.add_elements(&["A"], &[ElementType::Numeric]).unwrap();
        dim.elements(false).unwrap();
        transport.clear_log();
        dim.elements(false).unwrap();
        dim.root_elements(false).unwrap();
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_unchanged_token_keeps_generation() {
        let (transport, _, dim) =
            setup_with(MemoryTransport::new(), ClientConfig::default().with_cache(CacheConfig::uniform(0)));
        dim.add_elements(&["A"], &[ElementType::Numeric]).unwrap();
        let first = dim.generation(false).unwrap();
        transport.clear_log();
        let second = dim.generation(false).unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(transport.count(ops::DIMENSION_ELEMENTS), 0);
        assert_eq!(transport.count(ops::DIMENSION_INFO), 1);
    }

    #[test]
    fn test_attributes_rejected_on_attribute_dimension() {
        let (transport, db, _) = setup();
        let attr_dim = db.dimension_by_name("#_Products_").unwrap().unwrap();
        transport.clear_log();
        let err = attr_dim.elements(true).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_add_base_element_merges_without_rebuild() {
        let (transport, _, dim) = setup();
        dim.add_elements(&["A"], &[ElementType::Numeric]).unwrap();
        dim.elements(false).unwrap();
        transport.clear_log();
        let b = dim.add_base_element("B", ElementType::Numeric).unwrap();
        assert_eq!(b.name(), "B");
        assert!(dim.element_by_name("B", false).unwrap().is_some());
        assert_eq!(transport.count(ops::DIMENSION_ELEMENTS), 0);
    }

    #[test]
    fn test_add_base_element_with_existing_name() {
        let (_, _, dim) = setup();
        dim.add_elements(&["T", "A"], &[ElementType::Numeric; 2]).unwrap();
        let [t, a] = ["T", "A"].map(|n| dim.element_by_name(n, false).unwrap().unwrap());
        dim.update_consolidations(&[dim.new_consolidation(&t, &a, 1.0).unwrap()]).unwrap();
        dim.elements(false).unwrap();

        let again = dim.add_base_element("T", ElementType::Numeric).unwrap();
        assert_eq!(again.id(), t.id());
        let names: Vec<String> = dim.elements(false).unwrap().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["T", "A"]);
        assert_eq!(again.element_type().unwrap(), ElementType::Consolidated);
        assert_eq!(again.child_count().unwrap(), 1);
    }

    #[test]
    fn test_remove_unknown_element() {
        let (_, db, dim) = setup();
        dim.add_elements(&["A"], &[ElementType::Numeric]).unwrap();
        let other = db.add_dimension("Other").unwrap();
        other.add_elements(&["X", "Y"], &[ElementType::Numeric; 2]).unwrap();
        // Y has id 1, which Products does not have.
        let y = other.element_by_name("Y", false).unwrap().unwrap();
        let err = dim.remove_elements(&[y]).unwrap_err();
        assert!(matches!(err, Error::NotFound(msg) if msg.contains("can not be deleted")));
        assert!(dim.remove_elements(&[]).is_ok());
    }

    #[test]
    fn test_single_element() {
        let (_, _, dim) = setup();
        dim.add_elements(&["Bikes"], &[ElementType::Numeric]).unwrap();
        let bikes = dim.single_element("Bikes", false).unwrap().unwrap();
        assert_eq!(bikes.name(), "Bikes");
        assert!(bikes.loaded_attribute_values().is_empty());
        assert!(dim.single_element("Boats", false).unwrap().is_none());
    }

    #[test]
    fn test_single_element_with_attributes() {
        let (transport, _db, dim) = setup();
        dim.add_elements(&["Bikes", "Cars"], &[ElementType::Numeric; 2]).unwrap();
        let color = dim.add_attribute("Color", ElementType::String).unwrap();
        let weight = dim.add_attribute("Weight", ElementType::Numeric).unwrap();
        let [bikes, cars] = ["Bikes", "Cars"].map(|n| dim.element_by_name(n, false).unwrap().unwrap());
        dim.add_attribute_values(&color, &[bikes.clone(), cars.clone()], &[CellValue::from("Red"), CellValue::from("Blue")])
            .unwrap();
        dim.add_attribute_values(&weight, &[cars], &[CellValue::from(900.0)]).unwrap();
        dim.reset_cache();

        transport.clear_log();
        let single = dim.single_element("Bikes", true).unwrap().unwrap();
        let own_id = dim.id().to_string();
        assert!(transport
            .requests_for(ops::DIMENSION_ELEMENTS)
            .iter()
            .all(|r| r.get("dimension") != Some(own_id.as_str())));
        let exports = transport.requests_for(ops::CELL_EXPORT);
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].get("area"), Some(format!("*,{}", bikes.id()).as_str()));

        let values = single.loaded_attribute_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values["Color"], CellValue::from("Red"));
        assert_eq!(values["Weight"], CellValue::from(0.0));
    }

    #[test]
    fn test_append_elements_from_another_dimension() {
        let (_, db, dim) = setup();
        dim.add_elements(&["Bikes", "Label"], &[ElementType::Numeric, ElementType::String]).unwrap();
        let target = db.add_dimension("Archive").unwrap();
        target.add_elements(&["Bikes"], &[ElementType::Numeric]).unwrap();
        let bikes_id = target.element_by_name("Bikes", false).unwrap().unwrap().id();

        target.append_elements(&dim.elements(false).unwrap()).unwrap();
        let names: Vec<String> = target.elements(false).unwrap().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["Bikes", "Label"]);
        assert_eq!(target.element_by_name("Bikes", false).unwrap().unwrap().id(), bikes_id);
        assert_eq!(
            target.element_by_name("Label", false).unwrap().unwrap().element_type().unwrap(),
            ElementType::String
        );
    }

    #[test]
    fn test_bulk_and_single_move() {
        let (transport, _, dim) = setup();
        dim.add_elements(&["A", "B", "C"], &[ElementType::Numeric; 3]).unwrap();
        let elements = dim.elements(false).unwrap();
        transport.clear_log();
        dim.move_elements(&[elements[2].clone(), elements[0].clone()], &[0, 2]).unwrap();
        assert_eq!(transport.count(ops::ELEMENT_MOVE_BULK), 1);
        let names: Vec<String> = dim.elements(false).unwrap().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["C", "B", "A"]);

        let old = MemoryTransport::new().with_version(ServerVersion::new(5, 1, 0, 5000));
        let (old, _, dim) = setup_with(old, ClientConfig::default());
        dim.add_elements(&["A", "B"], &[ElementType::Numeric; 2]).unwrap();
        let elements = dim.elements(false).unwrap();
        old.clear_log();
        dim.move_elements(&elements, &[1, 0]).unwrap();
        assert_eq!(old.count(ops::ELEMENT_MOVE), 2);
        assert_eq!(old.count(ops::ELEMENT_MOVE_BULK), 0);
    }

    #[test]
    fn test_update_elements_type() {
        let (_, _, dim) = setup();
        dim.add_elements(&["A"], &[ElementType::Numeric]).unwrap();
        let a = dim.element_by_name("A", false).unwrap().unwrap();
        assert!(matches!(
            dim.update_elements_type(&[a.clone()], ElementType::Numeric),
            Err(Error::InvalidOperation(_))
        ));
        dim.update_elements_type(&[a.clone()], ElementType::String).unwrap();
        assert_eq!(a.element_type().unwrap(), ElementType::String);
    }

    #[test]
    fn test_rename_dimension() {
        let (_, db, dim) = setup();
        dim.rename("Articles").unwrap();
        assert_eq!(dim.name(), "Articles");
        assert!(db.dimension_by_name("articles").unwrap().unwrap().same_handle(&dim));
    }
}
