//! # Cube
//!
//! A cube caches only its info record, keyed by two tokens: the structure
//! token (`cb`, bumped by rules and conversion) and the cell-change token
//! (`cc`, bumped by any value write). Cell values themselves are never
//! cached; point reads and exports always go to the server.
//!
//! Every structural call ends the cube's trust window once it succeeds.

pub mod export;
pub(crate) mod load;

pub use export::CellsExporter;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::cache::{Cached, TrustWindow};
use crate::connection::Session;
use crate::database::{Database, DatabaseInner};
use crate::dimension::{Dimension, Element};
use crate::model::cell::{path_to_wire, Area};
use crate::model::{
    Cell, CellExportContext, CellLoadContext, CellPath, CellType, CellValue, CubeId, CubeInfo,
    CubeType, DatabaseId, DimensionId, LockId, Rule,
};
use crate::transport::{ops, wire, Request, Row};
use crate::{Error, Result};

/// `/cube/clear` for the whole cube, or for one area of it.
pub(crate) fn clear_request(database: DatabaseId, cube: CubeId, area: Option<&Area>) -> Request {
    let request = Request::new(ops::CUBE_CLEAR)
        .param("database", database)
        .param("cube", cube);
    match area {
        Some(area) => request.param("area", area.to_wire()),
        None => request.param("complete", 1),
    }
}

/// `type;exists;value` followed by the path in export rows.
pub(crate) fn value_from_row(row: &Row) -> Result<(CellValue, bool)> {
    let cell_type = CellType::from_code(wire::field(row, 0, "cell type")?);
    let exists = wire::field(row, 1, "cell exists flag")?.trim() == "1";
    let value = CellValue::from_wire(cell_type, wire::field(row, 2, "cell value")?);
    Ok((value, exists))
}

/// A multidimensional array addressed by one element per dimension.
#[derive(Clone)]
pub struct Cube {
    inner: Arc<CubeInner>,
}

struct CubeInner {
    session: Arc<Session>,
    database: Weak<DatabaseInner>,
    database_id: DatabaseId,
    id: CubeId,
    name: RwLock<String>,
    dimension_ids: Vec<DimensionId>,
    info: Mutex<Cached<CubeInfo, (u64, Option<u64>)>>,
}

impl Cube {
    pub(crate) fn new(database: &Database, info: &CubeInfo, ttl_secs: u64) -> Self {
        Self {
            inner: Arc::new(CubeInner {
                session: Arc::clone(database.session()),
                database: database.downgrade(),
                database_id: database.id(),
                id: info.id,
                name: RwLock::new(info.name.clone()),
                dimension_ids: info.dimensions.clone(),
                info: Mutex::new(Cached::new("cube", TrustWindow::from_secs(ttl_secs))),
            }),
        }
    }

    pub(crate) fn set_name(&self, name: &str) {
        let mut current = self.inner.name.write();
        if *current != name {
            *current = name.to_string();
        }
    }

    pub fn id(&self) -> CubeId {
        self.inner.id
    }

    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    pub fn database_id(&self) -> DatabaseId {
        self.inner.database_id
    }

    /// Dimension ids in axis order. Fixed for the lifetime of the handle.
    pub fn dimension_ids(&self) -> &[DimensionId] {
        &self.inner.dimension_ids
    }

    /// True if both values refer to the same cached handle.
    pub fn same_handle(&self, other: &Cube) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn database(&self) -> Result<Database> {
        self.inner
            .database
            .upgrade()
            .map(Database::from_inner)
            .ok_or_else(|| Error::Detached(format!("database of cube {} was dropped", self.name())))
    }

    fn request(&self, operation: &str) -> Request {
        Request::new(operation)
            .param("database", self.database_id())
            .param("cube", self.id())
    }

    /// Sends a structural request and ends trust once it succeeded.
    fn send_structural(&self, request: Request) -> Result<crate::Rows> {
        let rows = self.inner.session.send(request)?;
        self.end_trust();
        Ok(rows)
    }

    // ========================================================================
    // Info cache
    // ========================================================================

    /// Fresh info from the server, both tokens included, in one request.
    pub fn info(&self) -> Result<CubeInfo> {
        let rows = self.inner.session.send(self.request(ops::CUBE_INFO).with_token())?;
        CubeInfo::from_row(wire::first_row(&rows, "cube info")?)
    }

    fn cached_info(&self) -> Result<Arc<CubeInfo>> {
        let mut cached = self.inner.info.lock();
        let (info, _) = cached.validate(
            || {
                let info = self.info()?;
                Ok((info.tokens(), info))
            },
            |info, _| {
                self.set_name(&info.name);
                Ok(info)
            },
        )?;
        Ok(info)
    }

    pub fn cube_type(&self) -> Result<CubeType> {
        Ok(self.cached_info()?.cube_type)
    }

    pub fn number_of_cells(&self) -> Result<u64> {
        Ok(self.cached_info()?.cell_count)
    }

    pub fn number_of_filled_cells(&self) -> Result<u64> {
        Ok(self.cached_info()?.filled_cell_count)
    }

    /// Structure token.
    pub fn cb_token(&self) -> Result<u64> {
        Ok(self.cached_info()?.cb_token)
    }

    /// Cell-change token.
    pub fn cc_token(&self) -> Result<Option<u64>> {
        Ok(self.cached_info()?.cc_token)
    }

    pub(crate) fn end_trust(&self) {
        self.inner.info.lock().end_trust();
    }

    pub fn set_cache_trust_expiry(&self, secs: u64) {
        self.inner.info.lock().window_mut().set_duration(Duration::from_secs(secs));
    }

    pub fn reset_cache(&self) {
        self.inner.info.lock().reset();
    }

    // ========================================================================
    // Dimensions and paths
    // ========================================================================

    /// Dimension handles in axis order.
    pub fn dimensions(&self) -> Result<Vec<Dimension>> {
        let database = self.database()?;
        self.dimension_ids()
            .iter()
            .map(|id| {
                database.dimension_by_id(*id)?.ok_or_else(|| {
                    Error::NotFound(format!("Dimension with id {id} of cube {} does not exist", self.name()))
                })
            })
            .collect()
    }

    /// Case-insensitive lookup among this cube's dimensions.
    pub fn dimension_by_name(&self, name: &str) -> Result<Option<Dimension>> {
        let lower = name.to_lowercase();
        Ok(self.dimensions()?.into_iter().find(|d| d.name().to_lowercase() == lower))
    }

    fn check_arity(&self, len: usize, what: &str) -> Result<()> {
        if len == self.dimension_ids().len() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "{what} has {len} elements, cube {} has {} dimensions",
                self.name(),
                self.dimension_ids().len()
            )))
        }
    }

    /// Resolves one element name per dimension into a path.
    pub fn cell_path(&self, names: &[&str]) -> Result<CellPath> {
        self.check_arity(names.len(), "Path")?;
        let dimensions = self.dimensions()?;
        let mut path = CellPath::new();
        for (dimension, name) in dimensions.iter().zip(names) {
            let element = dimension.element_by_name(name, false)?.ok_or_else(|| {
                Error::NotFound(format!("Element {name} does not exist in dimension {}", dimension.name()))
            })?;
            path.push(element.id());
        }
        Ok(path)
    }

    /// Reads one cell. Each element must belong to the dimension at its
    /// position.
    pub fn cell(&self, elements: &[Element]) -> Result<Cell> {
        self.check_arity(elements.len(), "Path")?;
        for (index, (element, dimension_id)) in elements.iter().zip(self.dimension_ids()).enumerate() {
            if element.dimension_id() != *dimension_id {
                return Err(Error::NotFound(format!(
                    "Element {} does not belong to dimension {index} of cube {}",
                    element.name(),
                    self.name()
                )));
            }
        }
        let path: CellPath = elements.iter().map(Element::id).collect();
        self.cell_at(&path)
    }

    /// Reads one cell by element ids.
    pub fn cell_at(&self, path: &[crate::ElementId]) -> Result<Cell> {
        self.check_arity(path.len(), "Path")?;
        let rows = self
            .inner
            .session
            .send(self.request(ops::CELL_VALUE).param("path", path_to_wire(path)))?;
        let (value, exists) = value_from_row(wire::first_row(&rows, "cell value")?)?;
        Ok(Cell { path: path.iter().copied().collect(), value, exists })
    }

    // ========================================================================
    // Bulk transfer
    // ========================================================================

    /// A lazy, forward-only scan over the cells of `area`.
    pub fn cells_exporter(&self, area: &Area, context: CellExportContext) -> Result<CellsExporter> {
        area.validate(self.dimension_ids().len())?;
        CellsExporter::new(Arc::clone(&self.inner.session), self.database_id(), self.id(), area, context)
    }

    /// Writes cells in blocks of `context.block_size`.
    ///
    /// Not atomic: when a block fails, the blocks before it stay written.
    /// `locked` paths are excluded from splashing.
    pub fn load_cells(
        &self,
        paths: &[CellPath],
        values: &[CellValue],
        context: &CellLoadContext,
        locked: &[CellPath],
    ) -> Result<()> {
        let result = load::write_cells(
            &self.inner.session,
            self.database_id(),
            self.id(),
            self.dimension_ids().len(),
            paths,
            values,
            context,
            locked,
        );
        self.end_trust();
        result.map(|_| ())
    }

    /// Empties the whole cube.
    pub fn clear(&self) -> Result<()> {
        self.send_structural(clear_request(self.database_id(), self.id(), None))?;
        Ok(())
    }

    /// Empties the cells of one area.
    pub fn clear_cells(&self, area: &Area) -> Result<()> {
        area.validate(self.dimension_ids().len())?;
        self.send_structural(clear_request(self.database_id(), self.id(), Some(area)))?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.inner.session.send(self.request(ops::CUBE_SAVE))?;
        Ok(())
    }

    // ========================================================================
    // Locks
    // ========================================================================

    pub fn lock_complete(&self) -> Result<LockId> {
        let rows = self.send_structural(self.request(ops::CUBE_LOCK).param("complete", 1))?;
        wire::parse_id(wire::first_row(&rows, "cube lock")?, 0, "lock id")
    }

    pub fn lock_area(&self, area: &Area) -> Result<LockId> {
        area.validate(self.dimension_ids().len())?;
        let rows = self.send_structural(self.request(ops::CUBE_LOCK).param("area", area.to_wire()))?;
        wire::parse_id(wire::first_row(&rows, "cube lock")?, 0, "lock id")
    }

    pub fn commit_lock(&self, lock: LockId) -> Result<()> {
        self.send_structural(self.request(ops::CUBE_COMMIT).param("lock", lock))?;
        Ok(())
    }

    /// Switches between the normal and the GPU cube type.
    pub fn convert(&self, cube_type: CubeType) -> Result<()> {
        let current = self.cube_type()?;
        let convertible = |t: CubeType| matches!(t, CubeType::Normal | CubeType::Gpu);
        if !convertible(current) || !convertible(cube_type) {
            return Err(Error::InvalidOperation(format!(
                "Cube {} of type {current:?} can not be converted to {cube_type:?}. Only normal and GPU cubes can be converted.",
                self.name()
            )));
        }
        if current == cube_type {
            return Ok(());
        }
        self.send_structural(self.request(ops::CUBE_CONVERT).param("type", cube_type.code()))?;
        Ok(())
    }

    pub fn rename(&self, new_name: &str) -> Result<()> {
        self.send_structural(self.request(ops::CUBE_RENAME).param("new_name", new_name))?;
        self.set_name(new_name);
        if let Ok(database) = self.database() {
            database.end_trust();
        }
        Ok(())
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Every rule of the cube, read fresh.
    pub fn rules(&self) -> Result<Vec<Rule>> {
        let rows = self.inner.session.send(self.request(ops::CUBE_RULES).param("use_identifier", 0))?;
        rows.iter().map(Rule::from_row).collect()
    }

    pub fn add_rule(&self, definition: &str, active: bool, external_id: &str, comment: &str) -> Result<Rule> {
        let rows = self.send_structural(
            self.request(ops::RULE_CREATE)
                .param("definition", definition)
                .param("activate", u8::from(active))
                .param("external_identifier", external_id)
                .param("comment", comment)
                .param("use_identifier", 0),
        )?;
        Rule::from_row(wire::first_row(&rows, "rule create")?)
    }

    /// Writes the rule's definition, activity, external id and comment.
    pub fn update_rule(&self, rule: &Rule) -> Result<Rule> {
        let rows = self.send_structural(
            self.request(ops::RULE_MODIFY)
                .param("rule", rule.id)
                .param("definition", &rule.definition)
                .param("activate", u8::from(rule.active))
                .param("external_identifier", &rule.external_id)
                .param("comment", &rule.comment)
                .param("use_identifier", 0),
        )?;
        Rule::from_row(wire::first_row(&rows, "rule modify")?)
    }

    /// Server-side parse of a rule definition, returned as XML.
    pub fn parse_rule(&self, definition: &str) -> Result<String> {
        let rows = self
            .inner
            .session
            .send(self.request(ops::RULE_PARSE).param("definition", definition))?;
        Ok(wire::field(wire::first_row(&rows, "rule parse")?, 0, "rule xml")?.to_string())
    }

    /// Runs `per_call` once with all rules when the server takes rule
    /// lists, otherwise once per rule.
    fn for_rules(&self, rules: &[Rule], what: &str, per_call: impl Fn(String) -> Request) -> Result<()> {
        if rules.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "Rule list to {what} for cube {} can not be empty",
                self.name()
            )));
        }
        if self.inner.session.capabilities().bulk_rules {
            self.send_structural(per_call(wire::join(rules.iter().map(|r| r.id), ",")))?;
        } else {
            for rule in rules {
                self.send_structural(per_call(rule.id.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn remove_rules(&self, rules: &[Rule]) -> Result<()> {
        self.for_rules(rules, "remove", |ids| self.request(ops::RULE_DESTROY).param("rule", ids))
    }

    /// Removes every rule; returns how many there were.
    pub fn remove_all_rules(&self) -> Result<usize> {
        let rules = self.rules()?;
        if !rules.is_empty() {
            self.remove_rules(&rules)?;
        }
        Ok(rules.len())
    }

    pub fn activate_rules(&self, rules: &[Rule]) -> Result<()> {
        self.for_rules(rules, "activate", |ids| {
            self.request(ops::RULE_MODIFY).param("rule", ids).param("activate", 1)
        })
    }

    pub fn deactivate_rules(&self, rules: &[Rule]) -> Result<()> {
        self.for_rules(rules, "deactivate", |ids| {
            self.request(ops::RULE_MODIFY).param("rule", ids).param("activate", 0)
        })
    }
}

impl PartialEq for Cube {
    fn eq(&self, other: &Self) -> bool {
        self.database_id() == other.database_id() && self.id() == other.id()
    }
}

impl std::fmt::Debug for Cube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cube")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("dimensions", &self.inner.dimension_ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{CacheConfig, ClientConfig};
    use crate::model::ServerVersion;
    use crate::transport::ops;
    use crate::{
        Area, CellLoadContext, CellPath, CellValue, Connection, Cube, CubeType, Database, ElementType, Error,
        MemoryTransport,
    };

    fn sales(transport: &MemoryTransport, config: ClientConfig) -> (Connection, Database, Cube) {
        let conn = Connection::open(transport.clone(), config).unwrap();
        let db = conn.add_database("Demo").unwrap();
        let products = db.add_dimension("Products").unwrap();
        products.add_elements(&["Bikes", "Cars"], &[ElementType::Numeric; 2]).unwrap();
        let regions = db.add_dimension("Regions").unwrap();
        regions.add_elements(&["North", "South", "Note"], &[ElementType::Numeric, ElementType::Numeric, ElementType::String])
            .unwrap();
        let cube = db.add_cube("Sales", &[products, regions]).unwrap();
        (conn, db, cube)
    }

    #[test]
    fn test_cell_path_and_point_read() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        let path = cube.cell_path(&["cars", "South"]).unwrap();
        cube.load_cells(&[path.clone()], &[CellValue::from(12.5)], &CellLoadContext::default(), &[])
            .unwrap();

        let cell = cube.cell_at(&path).unwrap();
        assert_eq!(cell.value, CellValue::from(12.5));
        assert!(cell.exists);

        let empty = cube.cell_at(&cube.cell_path(&["Bikes", "North"]).unwrap()).unwrap();
        assert!(!empty.exists);
        assert_eq!(empty.value, CellValue::from(0.0));
    }

    #[test]
    fn test_cell_path_errors() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        assert!(matches!(cube.cell_path(&["Bikes"]), Err(Error::InvalidOperation(_))));
        let err = cube.cell_path(&["Boats", "North"]).unwrap_err();
        assert!(matches!(err, Error::NotFound(msg) if msg.contains("Boats")));
    }

    #[test]
    fn test_cell_rejects_elements_of_other_dimensions() {
        let transport = MemoryTransport::new();
        let (_conn, db, cube) = sales(&transport, ClientConfig::default());
        let products = db.dimension_by_name("Products").unwrap().unwrap();
        let bikes = products.element_by_name("Bikes", false).unwrap().unwrap();
        transport.clear_log();
        let err = cube.cell(&[bikes.clone(), bikes]).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(transport.count(ops::CELL_VALUE), 0);
    }

    #[test]
    fn test_write_moves_cc_token_only() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        let cb = cube.cb_token().unwrap();
        let cc = cube.cc_token().unwrap();
        let path = cube.cell_path(&["Bikes", "North"]).unwrap();
        cube.load_cells(&[path], &[CellValue::from(1.0)], &CellLoadContext::default(), &[]).unwrap();
        assert_eq!(cube.cb_token().unwrap(), cb);
        assert_ne!(cube.cc_token().unwrap(), cc);
        assert_eq!(cube.number_of_filled_cells().unwrap(), 1);
    }

    #[test]
    fn test_info_trusted_within_window() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        cube.number_of_cells().unwrap();
        transport.clear_log();
        cube.number_of_cells().unwrap();
        cube.cb_token().unwrap();
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_revalidation_is_one_info_request() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default().with_cache(CacheConfig::uniform(0)));
        cube.number_of_cells().unwrap();
        transport.clear_log();
        assert!(cube.cc_token().unwrap().is_some());
        assert_eq!(transport.count(ops::CUBE_INFO), 1);
        assert_eq!(transport.request_count(), 1);
        assert!(transport.requests_for(ops::CUBE_INFO).iter().all(|r| !r.token_only));
    }

    #[test]
    fn test_clear_area() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        let paths: Vec<CellPath> = [["Bikes", "North"], ["Cars", "North"], ["Cars", "South"]]
            .iter()
            .map(|p| cube.cell_path(p).unwrap())
            .collect();
        let values = vec![CellValue::from(1.0), CellValue::from(2.0), CellValue::from(3.0)];
        cube.load_cells(&paths, &values, &CellLoadContext::default(), &[]).unwrap();

        let north = cube.cell_path(&["Bikes", "North"]).unwrap()[1];
        cube.clear_cells(&Area::all(2).with(1, [north])).unwrap();
        assert_eq!(cube.number_of_filled_cells().unwrap(), 1);
        cube.clear().unwrap();
        assert_eq!(cube.number_of_filled_cells().unwrap(), 0);
    }

    #[test]
    fn test_locks() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        let lock = cube.lock_complete().unwrap();
        cube.commit_lock(lock).unwrap();
        let err = cube.commit_lock(lock).unwrap_err();
        assert_eq!(err.code(), Some(crate::transport::codes::CUBE_LOCK_NOT_FOUND));
    }

    #[test]
    fn test_convert_only_between_normal_and_gpu() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        let cb = cube.cb_token().unwrap();
        cube.convert(CubeType::Gpu).unwrap();
        assert_eq!(cube.cube_type().unwrap(), CubeType::Gpu);
        assert_ne!(cube.cb_token().unwrap(), cb);
        assert!(matches!(cube.convert(CubeType::System), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_rules_lifecycle() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        let rule = cube.add_rule("['North'] = 1", true, "ext-1", "first").unwrap();
        assert!(rule.active);
        cube.add_rule("['South'] = 2", true, "", "").unwrap();

        let mut edited = rule.clone();
        edited.comment = "edited".into();
        assert_eq!(cube.update_rule(&edited).unwrap().comment, "edited");

        let rules = cube.rules().unwrap();
        cube.deactivate_rules(&rules).unwrap();
        assert!(cube.rules().unwrap().iter().all(|r| !r.active));
        assert!(cube.parse_rule("['North'] = 1").unwrap().starts_with("<"));
        assert_eq!(cube.remove_all_rules().unwrap(), 2);
        assert!(cube.rules().unwrap().is_empty());
        assert_eq!(cube.remove_all_rules().unwrap(), 0);
    }

    #[test]
    fn test_rule_calls_by_capability() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        cube.add_rule("['North'] = 1", false, "", "").unwrap();
        cube.add_rule("['South'] = 2", false, "", "").unwrap();
        transport.clear_log();
        cube.activate_rules(&cube.rules().unwrap()).unwrap();
        assert_eq!(transport.count(ops::RULE_MODIFY), 1);

        let old = MemoryTransport::new().with_version(ServerVersion::new(5, 0, 0, 4000));
        let (_conn, _db, cube) = sales(&old, ClientConfig::default());
        cube.add_rule("['North'] = 1", false, "", "").unwrap();
        cube.add_rule("['South'] = 2", false, "", "").unwrap();
        old.clear_log();
        cube.activate_rules(&cube.rules().unwrap()).unwrap();
        assert_eq!(old.count(ops::RULE_MODIFY), 2);
        assert!(cube.rules().unwrap().iter().all(|r| r.active));
    }

    #[test]
    fn test_empty_rule_list_rejected() {
        let transport = MemoryTransport::new();
        let (_conn, _db, cube) = sales(&transport, ClientConfig::default());
        transport.clear_log();
        assert!(matches!(cube.remove_rules(&[]), Err(Error::InvalidOperation(_))));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_rename_ends_trust() {
        let transport = MemoryTransport::new();
        let config = ClientConfig::default().with_cache(CacheConfig::uniform(60));
        let (_conn, db, cube) = sales(&transport, config);
        cube.rename("Revenue").unwrap();
        assert_eq!(cube.name(), "Revenue");
        assert!(db.cube_by_name("revenue").unwrap().unwrap().same_handle(&cube));
    }
}
