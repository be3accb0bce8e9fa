//! In-memory server.
//!
//! This is the reference implementation of `Transport`: a small OLAP
//! server living in the process, speaking the same rows the real server
//! speaks. Every request is recorded so tests can assert on request counts
//! and parameters.
//!
//! ## Limitations
//!
//! - **No rule engine**: rules are stored and listed but never evaluated.
//!   `use_rules` on exports is ignored.
//! - **No aggregation or splashing**: consolidated cells do not sum their
//!   children, and a write to a consolidated cell is stored at that cell.
//! - **No permissions**: every element reports write permission.
//! - **Locks are bookkeeping only**: they do not block writes.
//! - **Empty cells are never exported**, whatever `skip_empty` says.
//!
//! Use this transport for:
//! - Testing the cache layer without a server
//! - Embedding the client in tools that only need a scratch cube

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{codes, ops, wire, Request, Row, Rows, Transport};
use crate::model::cell::Area;
use crate::model::value::format_number;
use crate::model::{
    CellValue, CubeType, DatabaseId, DatabaseType, DimensionId, DimensionType, ElementId, ElementType,
    Rule, RuleId, ServerVersion,
};
use crate::{Error, Result};

// ============================================================================
// MemoryTransport
// ============================================================================

/// In-process server; clones share the same server state and request log.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    server: Mutex<Server>,
    log: Mutex<Vec<Request>>,
    faults: Mutex<Faults>,
}

#[derive(Default)]
struct Faults {
    reject_logins: bool,
    next: Option<String>,
    /// (operation, successes left, message)
    after: Option<(String, usize, String)>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                server: Mutex::new(Server::new(ServerVersion::new(6, 0, 0, 1200))),
                log: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    /// Reports `version` from `/server/info`.
    pub fn with_version(self, version: ServerVersion) -> Self {
        self.inner.server.lock().version = version;
        self
    }

    /// Makes every subsequent login fail.
    pub fn reject_logins(&self, reject: bool) {
        self.inner.faults.lock().reject_logins = reject;
    }

    /// Fails the next request with a transport error.
    pub fn fail_next(&self, message: &str) {
        self.inner.faults.lock().next = Some(message.to_string());
    }

    /// Lets `successes` requests of `operation` through, then fails the next one.
    pub fn fail_after(&self, operation: &str, successes: usize, message: &str) {
        self.inner.faults.lock().after = Some((operation.to_string(), successes, message.to_string()));
    }

    /// Hides an element from element lists, as a permission change would.
    pub fn hide_element(&self, database: DatabaseId, dimension: DimensionId, element: ElementId) -> Result<()> {
        let mut server = self.inner.server.lock();
        let Server { databases, clock, .. } = &mut *server;
        let dimension = databases
            .get_mut(&database.0)
            .ok_or_else(|| database_not_found(database.0))?
            .dimensions
            .get_mut(&dimension.0)
            .ok_or_else(|| dimension_not_found(dimension.0))?;
        dimension.index_of(element.0)?;
        dimension.hidden.insert(element.0);
        dimension.token = clock.tick();
        Ok(())
    }

    // ========================================================================
    // Request log
    // ========================================================================

    pub fn requests(&self) -> Vec<Request> {
        self.inner.log.lock().clone()
    }

    pub fn requests_for(&self, operation: &str) -> Vec<Request> {
        self.inner.log.lock().iter().filter(|r| r.operation == operation).cloned().collect()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.inner.log.lock().iter().filter(|r| r.operation == operation).count()
    }

    pub fn request_count(&self) -> usize {
        self.inner.log.lock().len()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    fn record(&self, request: Request) {
        self.inner.log.lock().push(request);
    }

    fn inject_fault(&self, operation: &str) -> Result<()> {
        let mut faults = self.inner.faults.lock();
        if let Some(message) = faults.next.take() {
            return Err(Error::Transport(message));
        }
        if let Some((op, left, message)) = &mut faults.after {
            if op == operation {
                if *left == 0 {
                    let message = std::mem::take(message);
                    faults.after = None;
                    return Err(Error::Transport(message));
                }
                *left -= 1;
            }
        }
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn open(&self) -> Result<()> {
        self.record(Request::new(ops::SERVER_LOGIN).without_session());
        if self.inner.faults.lock().reject_logins {
            return Err(Error::Session("login rejected: invalid user or password".into()));
        }
        Ok(())
    }

    fn close(&self, stop: bool) -> Result<()> {
        self.record(Request::new(ops::SERVER_LOGOUT).flag("type", stop));
        Ok(())
    }

    fn send(&self, request: &Request) -> Result<Rows> {
        self.record(request.clone());
        self.inject_fault(&request.operation)?;
        let mut server = self.inner.server.lock();
        let mut rows = server.handle(request)?;
        if request.with_token {
            let token = server.token_for(request)?;
            if let Some(first) = rows.first_mut() {
                first.push(token.to_string());
            }
        }
        Ok(rows)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Parameters and errors
// ============================================================================

fn param<'a>(request: &'a Request, key: &str) -> Result<&'a str> {
    request
        .get(key)
        .ok_or_else(|| Error::server(codes::PARAMETER_MISSING, format!("parameter {key} is missing")))
}

fn number(request: &Request, key: &str) -> Result<u32> {
    let raw = param(request, key)?;
    raw.trim()
        .parse()
        .map_err(|_| Error::server(codes::PARAMETER_MISSING, format!("parameter {key} is invalid: '{raw}'")))
}

fn numbers(raw: &str) -> Result<Vec<u32>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| Error::server(codes::PARAMETER_MISSING, format!("invalid id '{v}'")))
        })
        .collect()
}

fn flag(request: &Request, key: &str) -> bool {
    request.get(key).is_some_and(|v| v.trim() == "1")
}

fn element_type(raw: &str) -> Result<ElementType> {
    raw.trim()
        .parse()
        .map_err(|_| Error::server(codes::PARAMETER_MISSING, format!("invalid element type '{raw}'")))
        .and_then(ElementType::from_code)
}

fn database_not_found(id: u32) -> Error {
    Error::server(codes::DATABASE_NOT_FOUND, format!("database {id} not found"))
}

fn dimension_not_found(id: u32) -> Error {
    Error::server(codes::DIMENSION_NOT_FOUND, format!("dimension {id} not found"))
}

fn element_not_found(what: impl std::fmt::Display) -> Error {
    Error::server(codes::ELEMENT_NOT_FOUND, format!("element {what} not found"))
}

fn cube_not_found(id: u32) -> Error {
    Error::server(codes::CUBE_NOT_FOUND, format!("cube {id} not found"))
}

fn join_ids(ids: impl IntoIterator<Item = u32>) -> String {
    wire::join(ids, ",")
}

/// Source of version tokens; every tick is unique server-wide.
#[derive(Default)]
struct Clock(u64);

impl Clock {
    fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

// ============================================================================
// Server state
// ============================================================================

struct Server {
    version: ServerVersion,
    token: u64,
    clock: Clock,
    next_database: u32,
    databases: BTreeMap<u32, MemDatabase>,
}

struct MemDatabase {
    id: u32,
    name: String,
    database_type: DatabaseType,
    token: u64,
    next_dimension: u32,
    next_cube: u32,
    dimensions: BTreeMap<u32, MemDimension>,
    cubes: BTreeMap<u32, MemCube>,
}

struct MemElement {
    id: u32,
    name: String,
    element_type: ElementType,
    children: Vec<(u32, f64)>,
}

struct MemDimension {
    id: u32,
    name: String,
    dimension_type: DimensionType,
    token: u64,
    attribute_dimension: Option<u32>,
    attribute_cube: Option<u32>,
    next_element: u32,
    /// Position order.
    elements: Vec<MemElement>,
    hidden: HashSet<u32>,
}

struct MemCube {
    id: u32,
    name: String,
    dimensions: Vec<u32>,
    cube_type: CubeType,
    cb_token: u64,
    cc_token: u64,
    cells: BTreeMap<Vec<u32>, CellValue>,
    rules: Vec<Rule>,
    next_rule: u32,
    locks: Vec<u32>,
    next_lock: u32,
}

impl Server {
    fn new(version: ServerVersion) -> Self {
        let mut clock = Clock::default();
        Self {
            version,
            token: clock.tick(),
            clock,
            next_database: 0,
            databases: BTreeMap::new(),
        }
    }

    fn handle(&mut self, request: &Request) -> Result<Rows> {
        if request.token_only {
            return self.token_for(request).map(|t| vec![vec![t.to_string()]]);
        }
        let op = request.operation.as_str();
        match op {
            ops::SERVER_INFO => {
                let v = self.version;
                Ok(vec![[v.major, v.minor, v.bugfix, v.build, 0, 0].iter().map(u32::to_string).collect()])
            }
            ops::SERVER_DATABASES => Ok(self.databases.values().map(MemDatabase::row).collect()),
            ops::DATABASE_CREATE => self.create_database(request),
            ops::DATABASE_DESTROY => {
                let id = number(request, "database")?;
                self.databases.remove(&id).ok_or_else(|| database_not_found(id))?;
                self.token = self.clock.tick();
                Ok(vec![vec!["1".into()]])
            }
            ops::DATABASE_RENAME => {
                let id = number(request, "database")?;
                let name = param(request, "new_name")?;
                self.check_database_name(name, Some(id))?;
                let db = self.databases.get_mut(&id).ok_or_else(|| database_not_found(id))?;
                db.name = name.to_string();
                db.token = self.clock.tick();
                self.token = self.clock.tick();
                Ok(vec![db.row()])
            }
            _ => {
                let id = number(request, "database")?;
                let db = self.databases.get_mut(&id).ok_or_else(|| database_not_found(id))?;
                db.handle(request, &mut self.clock)
            }
        }
    }

    fn token_for(&self, request: &Request) -> Result<u64> {
        if request.operation == ops::SERVER_INFO {
            return Ok(self.token);
        }
        let id = number(request, "database")?;
        let db = self.databases.get(&id).ok_or_else(|| database_not_found(id))?;
        match request.operation.as_str() {
            ops::DATABASE_INFO => Ok(db.token),
            ops::DIMENSION_INFO => Ok(db.dimension(request)?.token),
            ops::CUBE_INFO => Ok(db.cube(request)?.cc_token),
            other => Err(Error::Transport(format!("memory transport has no token for {other}"))),
        }
    }

    fn check_database_name(&self, name: &str, except: Option<u32>) -> Result<()> {
        let lower = name.to_lowercase();
        if self
            .databases
            .values()
            .any(|db| Some(db.id) != except && db.name.to_lowercase() == lower)
        {
            return Err(Error::server(codes::DATABASE_NAME_IN_USE, format!("database name {name} is in use")));
        }
        Ok(())
    }

    fn create_database(&mut self, request: &Request) -> Result<Rows> {
        let name = param(request, "new_name")?;
        self.check_database_name(name, None)?;
        let database_type = match request.get("type") {
            Some(code) => DatabaseType::from_code(code.trim().parse().unwrap_or(0))?,
            None => DatabaseType::Normal,
        };
        let id = self.next_database;
        self.next_database += 1;
        let db = MemDatabase {
            id,
            name: name.to_string(),
            database_type,
            token: self.clock.tick(),
            next_dimension: 0,
            next_cube: 0,
            dimensions: BTreeMap::new(),
            cubes: BTreeMap::new(),
        };
        let row = db.row();
        self.databases.insert(id, db);
        self.token = self.clock.tick();
        Ok(vec![row])
    }
}

// ============================================================================
// Database
// ============================================================================

impl MemDatabase {
    /// `id;name;#dimensions;#cubes;status;type;token`
    fn row(&self) -> Row {
        vec![
            self.id.to_string(),
            self.name.clone(),
            self.dimensions.len().to_string(),
            self.cubes.len().to_string(),
            "1".into(),
            self.database_type.code().to_string(),
            self.token.to_string(),
        ]
    }

    fn dimension(&self, request: &Request) -> Result<&MemDimension> {
        let id = number(request, "dimension")?;
        self.dimensions.get(&id).ok_or_else(|| dimension_not_found(id))
    }

    fn cube(&self, request: &Request) -> Result<&MemCube> {
        let id = number(request, "cube")?;
        self.cubes.get(&id).ok_or_else(|| cube_not_found(id))
    }

    fn handle(&mut self, request: &Request, clock: &mut Clock) -> Result<Rows> {
        let op = request.operation.as_str();
        match op {
            ops::DATABASE_INFO => Ok(vec![self.row()]),
            ops::DATABASE_SAVE => Ok(vec![vec!["1".into()]]),
            ops::DATABASE_DIMENSIONS => Ok(self.dimensions.values().map(MemDimension::row).collect()),
            ops::DATABASE_CUBES => Ok(self.cubes.values().map(|c| self.cube_row(c)).collect()),
            ops::DIMENSION_CREATE => self.create_dimension(request, clock),
            ops::DIMENSION_DESTROY => self.destroy_dimension(request, clock),
            ops::DIMENSION_RENAME => self.rename_dimension(request, clock),
            ops::DIMENSION_INFO => Ok(vec![self.dimension(request)?.row()]),
            ops::DIMENSION_ELEMENTS => {
                let dimension = self.dimension(request)?;
                Ok(dimension.list(flag(request, "mode"), flag(request, "show_permission")))
            }
            ops::ELEMENT_INFO => {
                let dimension = self.dimension(request)?;
                let index = match (request.get("name_element"), request.get("element")) {
                    (Some(name), _) => dimension.index_by_name(name).ok_or_else(|| element_not_found(name))?,
                    (None, Some(_)) => dimension.index_of(number(request, "element")?)?,
                    (None, None) => {
                        return Err(Error::server(codes::PARAMETER_MISSING, "parameter name_element is missing"));
                    }
                };
                Ok(vec![dimension.element_row(index, &dimension.shape(), false, false)])
            }
            ops::ELEMENT_REPLACE
            | ops::ELEMENT_REPLACE_BULK
            | ops::ELEMENT_DESTROY_BULK
            | ops::ELEMENT_RENAME
            | ops::ELEMENT_MOVE
            | ops::ELEMENT_MOVE_BULK => self.change_elements(request, clock),
            ops::CUBE_CREATE => self.create_cube(request, clock),
            ops::CUBE_DESTROY => {
                let id = number(request, "cube")?;
                self.cubes.remove(&id).ok_or_else(|| cube_not_found(id))?;
                self.token = clock.tick();
                Ok(vec![vec!["1".into()]])
            }
            ops::CUBE_RENAME => {
                let id = number(request, "cube")?;
                let name = param(request, "new_name")?;
                self.check_cube_name(name, Some(id))?;
                let cube = self.cubes.get_mut(&id).ok_or_else(|| cube_not_found(id))?;
                cube.name = name.to_string();
                cube.cb_token = clock.tick();
                self.token = clock.tick();
                Ok(vec![vec!["1".into()]])
            }
            _ => self.cube_operation(request, clock),
        }
    }

    // ========================================================================
    // Dimensions
    // ========================================================================

    fn check_dimension_name(&self, name: &str, except: Option<u32>) -> Result<()> {
        let lower = name.to_lowercase();
        if self
            .dimensions
            .values()
            .any(|d| Some(d.id) != except && d.name.to_lowercase() == lower)
        {
            return Err(Error::server(codes::DIMENSION_NAME_IN_USE, format!("dimension name {name} is in use")));
        }
        Ok(())
    }

    fn check_cube_name(&self, name: &str, except: Option<u32>) -> Result<()> {
        let lower = name.to_lowercase();
        if self
            .cubes
            .values()
            .any(|c| Some(c.id) != except && c.name.to_lowercase() == lower)
        {
            return Err(Error::server(codes::INVALID_CUBE_NAME, format!("cube name {name} is in use")));
        }
        Ok(())
    }

    fn add_dimension(&mut self, name: &str, dimension_type: DimensionType, clock: &mut Clock) -> u32 {
        let id = self.next_dimension;
        self.next_dimension += 1;
        self.dimensions.insert(
            id,
            MemDimension {
                id,
                name: name.to_string(),
                dimension_type,
                token: clock.tick(),
                attribute_dimension: None,
                attribute_cube: None,
                next_element: 0,
                elements: Vec::new(),
                hidden: HashSet::new(),
            },
        );
        id
    }

    fn add_cube(&mut self, name: &str, dimensions: Vec<u32>, cube_type: CubeType, clock: &mut Clock) -> u32 {
        let id = self.next_cube;
        self.next_cube += 1;
        self.cubes.insert(
            id,
            MemCube {
                id,
                name: name.to_string(),
                dimensions,
                cube_type,
                cb_token: clock.tick(),
                cc_token: clock.tick(),
                cells: BTreeMap::new(),
                rules: Vec::new(),
                next_rule: 0,
                locks: Vec::new(),
                next_lock: 0,
            },
        );
        id
    }

    /// A normal dimension comes with its attribute dimension `#_NAME_`
    /// and attribute cube `#_NAME`.
    fn create_dimension(&mut self, request: &Request, clock: &mut Clock) -> Result<Rows> {
        let name = param(request, "new_name")?;
        self.check_dimension_name(name, None)?;
        let dimension_type = match request.get("type") {
            Some(code) => DimensionType::from_code(code.trim().parse().unwrap_or(0))?,
            None => DimensionType::Normal,
        };
        let id = self.add_dimension(name, dimension_type, clock);
        if dimension_type == DimensionType::Normal {
            let attribute_dimension = self.add_dimension(&format!("#_{name}_"), DimensionType::Attribute, clock);
            let attribute_cube =
                self.add_cube(&format!("#_{name}"), vec![attribute_dimension, id], CubeType::Attribute, clock);
            if let Some(d) = self.dimensions.get_mut(&id) {
                d.attribute_dimension = Some(attribute_dimension);
                d.attribute_cube = Some(attribute_cube);
            }
        }
        self.token = clock.tick();
        Ok(vec![self.dimensions[&id].row()])
    }

    fn destroy_dimension(&mut self, request: &Request, clock: &mut Clock) -> Result<Rows> {
        let id = number(request, "dimension")?;
        let dimension = self.dimensions.get(&id).ok_or_else(|| dimension_not_found(id))?;
        let (attribute_dimension, attribute_cube) = (dimension.attribute_dimension, dimension.attribute_cube);
        if let Some(cube) = self
            .cubes
            .values()
            .find(|c| c.dimensions.contains(&id) && Some(c.id) != attribute_cube)
        {
            return Err(Error::server(
                codes::DIMENSION_IN_USE,
                format!("dimension {} is used by cube {}", dimension.name, cube.name),
            ));
        }
        self.dimensions.remove(&id);
        if let Some(attr) = attribute_dimension {
            self.dimensions.remove(&attr);
        }
        if let Some(cube) = attribute_cube {
            self.cubes.remove(&cube);
        }
        self.token = clock.tick();
        Ok(vec![vec!["1".into()]])
    }

    fn rename_dimension(&mut self, request: &Request, clock: &mut Clock) -> Result<Rows> {
        let id = number(request, "dimension")?;
        let name = param(request, "new_name")?;
        self.check_dimension_name(name, Some(id))?;
        let dimension = self.dimensions.get_mut(&id).ok_or_else(|| dimension_not_found(id))?;
        dimension.name = name.to_string();
        dimension.token = clock.tick();
        let (attribute_dimension, attribute_cube) = (dimension.attribute_dimension, dimension.attribute_cube);
        if let Some(attr) = attribute_dimension.and_then(|a| self.dimensions.get_mut(&a)) {
            attr.name = format!("#_{name}_");
            attr.token = clock.tick();
        }
        if let Some(cube) = attribute_cube.and_then(|c| self.cubes.get_mut(&c)) {
            cube.name = format!("#_{name}");
        }
        self.token = clock.tick();
        Ok(vec![self.dimensions[&id].row()])
    }

    // ========================================================================
    // Elements
    // ========================================================================

    fn change_elements(&mut self, request: &Request, clock: &mut Clock) -> Result<Rows> {
        let id = number(request, "dimension")?;
        let dimension = self.dimensions.get_mut(&id).ok_or_else(|| dimension_not_found(id))?;
        let mut destroyed = Vec::new();
        let rows = match request.operation.as_str() {
            ops::ELEMENT_REPLACE => {
                let index = dimension.create(param(request, "name_element")?, element_type(param(request, "type")?)?);
                vec![dimension.element_row(index, &dimension.shape(), false, false)]
            }
            ops::ELEMENT_REPLACE_BULK => {
                dimension.replace_bulk(request)?;
                Vec::new()
            }
            ops::ELEMENT_DESTROY_BULK => {
                destroyed = numbers(param(request, "elements")?)?;
                dimension.destroy(&destroyed)?;
                Vec::new()
            }
            ops::ELEMENT_RENAME => {
                let index = dimension.index_of(number(request, "element")?)?;
                let name = param(request, "new_name")?;
                if dimension.index_by_name(name).is_some_and(|other| other != index) {
                    return Err(Error::server(codes::ELEMENT_NAME_IN_USE, format!("element name {name} is in use")));
                }
                dimension.elements[index].name = name.to_string();
                Vec::new()
            }
            ops::ELEMENT_MOVE => {
                dimension.move_to(number(request, "element")?, number(request, "position")?)?;
                Vec::new()
            }
            _ => {
                let elements = numbers(param(request, "elements")?)?;
                let positions = numbers(param(request, "positions")?)?;
                if elements.len() != positions.len() {
                    return Err(Error::server(codes::PARAMETER_MISSING, "elements and positions differ in length"));
                }
                for (element, position) in elements.into_iter().zip(positions) {
                    dimension.move_to(element, position)?;
                }
                Vec::new()
            }
        };
        dimension.token = clock.tick();

        if !destroyed.is_empty() {
            for cube in self.cubes.values_mut() {
                for (axis, _) in cube.dimensions.iter().enumerate().filter(|(_, d)| **d == id) {
                    let before = cube.cells.len();
                    cube.cells.retain(|path, _| !destroyed.contains(&path[axis]));
                    if cube.cells.len() != before {
                        cube.cc_token = clock.tick();
                    }
                }
            }
        }
        Ok(rows)
    }

    // ========================================================================
    // Cubes
    // ========================================================================

    /// `id;name;#dimensions;dimension_ids;#cells;#filled;status;type;cb_token`
    fn cube_row(&self, cube: &MemCube) -> Row {
        let cells = cube
            .dimensions
            .iter()
            .map(|d| self.dimensions.get(d).map_or(0, |d| d.elements.len() as u64))
            .fold(1u64, u64::saturating_mul);
        vec![
            cube.id.to_string(),
            cube.name.clone(),
            cube.dimensions.len().to_string(),
            join_ids(cube.dimensions.iter().copied()),
            cells.to_string(),
            cube.cells.len().to_string(),
            "1".into(),
            cube.cube_type.code().to_string(),
            cube.cb_token.to_string(),
        ]
    }

    fn create_cube(&mut self, request: &Request, clock: &mut Clock) -> Result<Rows> {
        let name = param(request, "new_name")?;
        self.check_cube_name(name, None)?;
        let dimensions = numbers(param(request, "dimensions")?)?;
        if dimensions.is_empty() {
            return Err(Error::server(codes::PARAMETER_MISSING, "a cube needs at least one dimension"));
        }
        if let Some(missing) = dimensions.iter().find(|d| !self.dimensions.contains_key(*d)) {
            return Err(dimension_not_found(*missing));
        }
        let id = self.add_cube(name, dimensions, CubeType::Normal, clock);
        self.token = clock.tick();
        Ok(vec![self.cube_row(&self.cubes[&id])])
    }

    /// Element of `dimension` at `id`, or a not-found error.
    fn element_at(&self, dimension: u32, id: u32) -> Result<&MemElement> {
        let dimension = self.dimensions.get(&dimension).ok_or_else(|| dimension_not_found(dimension))?;
        Ok(&dimension.elements[dimension.index_of(id)?])
    }

    /// Checks a path against the cube. Returns whether the path touches a
    /// string element and whether it touches a consolidated one.
    fn check_path(&self, cube: &MemCube, path: &[u32]) -> Result<(bool, bool)> {
        if path.len() != cube.dimensions.len() {
            return Err(Error::server(
                codes::PARAMETER_MISSING,
                format!("path has {} elements, cube {} has {} dimensions", path.len(), cube.name, cube.dimensions.len()),
            ));
        }
        let mut is_string = false;
        let mut consolidated = false;
        for (dimension, id) in cube.dimensions.iter().zip(path) {
            let element = self.element_at(*dimension, *id)?;
            is_string |= element.element_type == ElementType::String;
            consolidated |= element.element_type == ElementType::Consolidated;
        }
        Ok((is_string, consolidated))
    }

    fn cube_operation(&mut self, request: &Request, clock: &mut Clock) -> Result<Rows> {
        let cube_id = number(request, "cube")?;
        let cube = self.cubes.get(&cube_id).ok_or_else(|| cube_not_found(cube_id))?;
        match request.operation.as_str() {
            ops::CUBE_INFO => return Ok(vec![self.cube_row(cube)]),
            ops::CUBE_SAVE => return Ok(vec![vec!["1".into()]]),
            ops::CUBE_RULES => return Ok(cube.rules.iter().map(rule_row).collect()),
            ops::RULE_PARSE => {
                let definition = param(request, "definition")?;
                parse_rule(definition)?;
                return Ok(vec![vec![format!("<rule><definition>{definition}</definition></rule>")]]);
            }
            ops::CELL_VALUE => {
                let path = numbers(param(request, "path")?)?;
                let (is_string, _) = self.check_path(cube, &path)?;
                let code = if is_string { "2" } else { "1" };
                return Ok(vec![match cube.cells.get(&path) {
                    Some(value) => vec![code.into(), "1".into(), raw_value(value)],
                    None => vec![code.into(), "0".into(), String::new()],
                }]);
            }
            ops::CELL_EXPORT => return export_page(cube, request),
            ops::CELL_REPLACE_BULK => {
                let writes = self.parse_writes(cube, request)?;
                let cube = self.cubes.get_mut(&cube_id).ok_or_else(|| cube_not_found(cube_id))?;
                let add = flag(request, "add");
                for (path, value) in writes {
                    let merged = match (add, cube.cells.get(&path), value) {
                        (true, Some(CellValue::Numeric(old)), CellValue::Numeric(v)) => CellValue::Numeric(old + v),
                        (_, _, value) => value,
                    };
                    let empty = matches!(&merged, CellValue::Numeric(v) if *v == 0.0)
                        || matches!(&merged, CellValue::String(s) if s.is_empty());
                    if empty {
                        cube.cells.remove(&path);
                    } else {
                        cube.cells.insert(path, merged);
                    }
                }
                cube.cc_token = clock.tick();
                return Ok(vec![vec!["1".into()]]);
            }
            _ => {}
        }

        let cube = self.cubes.get_mut(&cube_id).ok_or_else(|| cube_not_found(cube_id))?;
        match request.operation.as_str() {
            ops::CUBE_CLEAR => {
                match request.get("area") {
                    Some(area) => {
                        let area = Area::from_wire(area)?;
                        cube.cells.retain(|path, _| !in_area(&area, path));
                    }
                    None => cube.cells.clear(),
                }
                cube.cc_token = clock.tick();
                Ok(vec![vec!["1".into()]])
            }
            ops::CUBE_LOCK => {
                let id = cube.next_lock;
                cube.next_lock += 1;
                cube.locks.push(id);
                let area = request.get("area").map_or_else(
                    || vec!["*"; cube.dimensions.len()].join(","),
                    str::to_string,
                );
                Ok(vec![vec![id.to_string(), area, "admin".into(), "0".into()]])
            }
            ops::CUBE_COMMIT => {
                let lock = number(request, "lock")?;
                let index = cube.locks.iter().position(|l| *l == lock).ok_or_else(|| {
                    Error::server(codes::CUBE_LOCK_NOT_FOUND, format!("lock {lock} not found"))
                })?;
                cube.locks.remove(index);
                Ok(vec![vec!["1".into()]])
            }
            ops::CUBE_CONVERT => {
                let code: u32 = number(request, "type")?;
                cube.cube_type = CubeType::from_code(code)?;
                cube.cb_token = clock.tick();
                Ok(vec![vec!["1".into()]])
            }
            ops::RULE_CREATE => {
                let definition = param(request, "definition")?;
                parse_rule(definition)?;
                let rule = Rule {
                    id: RuleId(cube.next_rule),
                    definition: definition.to_string(),
                    external_id: request.get("external_identifier").unwrap_or("").to_string(),
                    comment: request.get("comment").unwrap_or("").to_string(),
                    timestamp: Some(Utc::now()),
                    active: request.get("activate").is_none_or(|v| v.trim() != "0"),
                };
                cube.next_rule += 1;
                let row = rule_row(&rule);
                cube.rules.push(rule);
                cube.cb_token = clock.tick();
                Ok(vec![row])
            }
            ops::RULE_MODIFY => {
                let ids = numbers(param(request, "rule")?)?;
                if let Some(definition) = request.get("definition") {
                    parse_rule(definition)?;
                }
                let mut rows = Vec::with_capacity(ids.len());
                for id in ids {
                    let rule = cube
                        .rules
                        .iter_mut()
                        .find(|r| r.id.0 == id)
                        .ok_or_else(|| Error::server(codes::RULE_NOT_FOUND, format!("rule {id} not found")))?;
                    if let Some(definition) = request.get("definition") {
                        rule.definition = definition.to_string();
                    }
                    if let Some(activate) = request.get("activate") {
                        rule.active = activate.trim() != "0";
                    }
                    if let Some(external) = request.get("external_identifier") {
                        rule.external_id = external.to_string();
                    }
                    if let Some(comment) = request.get("comment") {
                        rule.comment = comment.to_string();
                    }
                    rule.timestamp = Some(Utc::now());
                    rows.push(rule_row(rule));
                }
                cube.cb_token = clock.tick();
                Ok(rows)
            }
            ops::RULE_DESTROY => {
                let ids = numbers(param(request, "rule")?)?;
                if let Some(missing) = ids.iter().find(|id| !cube.rules.iter().any(|r| r.id.0 == **id)) {
                    return Err(Error::server(codes::RULE_NOT_FOUND, format!("rule {missing} not found")));
                }
                cube.rules.retain(|r| !ids.contains(&r.id.0));
                cube.cb_token = clock.tick();
                Ok(vec![vec!["1".into()]])
            }
            other => Err(Error::Transport(format!("memory transport does not implement {other}"))),
        }
    }

    /// Parses and checks `paths`/`values` of a bulk write.
    fn parse_writes(&self, cube: &MemCube, request: &Request) -> Result<Vec<(Vec<u32>, CellValue)>> {
        let paths: Vec<Vec<u32>> = param(request, "paths")?.split(':').map(numbers).collect::<Result<_>>()?;
        let values = wire::split_quoted(param(request, "values")?, ':');
        if paths.len() != values.len() {
            return Err(Error::server(codes::PARAMETER_MISSING, "paths and values differ in length"));
        }
        let splash = request.get("splash").is_none_or(|s| s.trim() != "0");
        let mut writes = Vec::with_capacity(paths.len());
        for (path, raw) in paths.into_iter().zip(values) {
            let (is_string, consolidated) = self.check_path(cube, &path)?;
            if consolidated && !splash {
                return Err(Error::server(codes::SPLASH_DISABLED, "splashing is disabled"));
            }
            let value = if is_string {
                CellValue::String(raw)
            } else {
                CellValue::Numeric(raw.trim().parse().map_err(|_| {
                    Error::server(codes::PARAMETER_MISSING, format!("value '{raw}' is not a number"))
                })?)
            };
            writes.push((path, value));
        }
        Ok(writes)
    }
}

fn in_area(area: &Area, path: &[u32]) -> bool {
    area.filters()
        .iter()
        .zip(path)
        .all(|(filter, id)| filter.as_ref().is_none_or(|ids| ids.contains(&ElementId(*id))))
}

fn raw_value(value: &CellValue) -> String {
    match value {
        CellValue::Numeric(v) => format_number(*v),
        CellValue::String(s) => s.clone(),
    }
}

fn parse_rule(definition: &str) -> Result<()> {
    if definition.contains('=') {
        Ok(())
    } else {
        Err(Error::server(codes::PARSING_RULE, format!("rule '{definition}' has no assignment")))
    }
}

/// `id;definition;external_id;comment;timestamp;active`
fn rule_row(rule: &Rule) -> Row {
    vec![
        rule.id.to_string(),
        rule.definition.clone(),
        rule.external_id.clone(),
        rule.comment.clone(),
        rule.timestamp.map_or_else(String::new, |t| t.timestamp().to_string()),
        if rule.active { "1" } else { "0" }.into(),
    ]
}

/// One page of `/cell/export`: up to `blocksize` cells after `path`, then
/// `processed;total`.
fn export_page(cube: &MemCube, request: &Request) -> Result<Rows> {
    let area = match request.get("area") {
        Some(raw) => Area::from_wire(raw)?,
        None => Area::all(cube.dimensions.len()),
    };
    let block_size = number(request, "blocksize")?.max(1) as usize;
    let export_type = request.get("type").and_then(|t| t.trim().parse().ok()).unwrap_or(0);
    let matching: Vec<(&Vec<u32>, &CellValue)> = cube
        .cells
        .iter()
        .filter(|(path, value)| {
            in_area(&area, path)
                && match export_type {
                    1 => value.is_numeric(),
                    2 => value.is_string(),
                    _ => true,
                }
        })
        .collect();

    let start = match request.get("path") {
        Some(raw) => {
            let after = numbers(raw)?;
            matching.partition_point(|(path, _)| **path <= after)
        }
        None => 0,
    };
    let end = (start + block_size).min(matching.len());
    let mut rows: Rows = matching[start..end]
        .iter()
        .map(|(path, value)| {
            vec![
                value.cell_type().code().to_string(),
                "1".into(),
                raw_value(value),
                join_ids(path.iter().copied()),
            ]
        })
        .collect();
    rows.push(vec![end.to_string(), matching.len().to_string()]);
    Ok(rows)
}

// ============================================================================
// Dimension
// ============================================================================

/// Level and depth per element id.
struct Shape {
    level: HashMap<u32, u32>,
    depth: HashMap<u32, u32>,
}

impl MemDimension {
    /// `id;name;#elements;max_level;max_indent;max_depth;type;attr_dim;attr_cube;rights_cube;token`
    fn row(&self) -> Row {
        let shape = self.shape();
        let max_level = shape.level.values().copied().max().unwrap_or(0);
        let max_depth = shape.depth.values().copied().max().unwrap_or(0);
        let optional = |id: Option<u32>| id.map_or_else(String::new, |i| i.to_string());
        vec![
            self.id.to_string(),
            self.name.clone(),
            self.elements.len().to_string(),
            max_level.to_string(),
            (max_depth + 1).to_string(),
            max_depth.to_string(),
            self.dimension_type.code().to_string(),
            optional(self.attribute_dimension),
            optional(self.attribute_cube),
            String::new(),
            self.token.to_string(),
        ]
    }

    fn index_of(&self, id: u32) -> Result<usize> {
        self.elements.iter().position(|e| e.id == id).ok_or_else(|| element_not_found(id))
    }

    fn index_by_name(&self, name: &str) -> Option<usize> {
        let lower = name.to_lowercase();
        self.elements.iter().position(|e| e.name.to_lowercase() == lower)
    }

    fn parents_of(&self, id: u32) -> Vec<u32> {
        self.elements
            .iter()
            .filter(|e| e.children.iter().any(|(c, _)| *c == id))
            .map(|e| e.id)
            .collect()
    }

    fn shape(&self) -> Shape {
        fn level_of(dim: &MemDimension, index: usize, memo: &mut HashMap<u32, u32>, visiting: &mut HashSet<u32>) -> u32 {
            let element = &dim.elements[index];
            if let Some(level) = memo.get(&element.id) {
                return *level;
            }
            if !visiting.insert(element.id) {
                return 0;
            }
            let level = element
                .children
                .iter()
                .filter_map(|(c, _)| dim.index_of(*c).ok())
                .map(|i| level_of(dim, i, memo, visiting) + 1)
                .max()
                .unwrap_or(0);
            memo.insert(element.id, level);
            level
        }

        let mut level = HashMap::new();
        let mut visiting = HashSet::new();
        for index in 0..self.elements.len() {
            level_of(self, index, &mut level, &mut visiting);
        }

        let mut depth: HashMap<u32, u32> = HashMap::new();
        let mut frontier: Vec<u32> = self
            .elements
            .iter()
            .filter(|e| self.parents_of(e.id).is_empty())
            .map(|e| e.id)
            .collect();
        let mut d = 0;
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for id in frontier {
                if depth.contains_key(&id) {
                    continue;
                }
                depth.insert(id, d);
                if let Ok(index) = self.index_of(id) {
                    next.extend(self.elements[index].children.iter().map(|(c, _)| *c));
                }
            }
            frontier = next;
            d += 1;
        }
        Shape { level, depth }
    }

    /// `id;name;position;level;indent;depth;type;#parents;parents;#children;children;weights[;permission]`
    fn element_row(&self, index: usize, shape: &Shape, hide: bool, permission: bool) -> Row {
        let element = &self.elements[index];
        let visible = |id: &u32| !hide || !self.hidden.contains(id);
        let parents: Vec<u32> = self.parents_of(element.id).into_iter().filter(visible).collect();
        let children: Vec<&(u32, f64)> = element.children.iter().filter(|(c, _)| visible(c)).collect();
        let depth = shape.depth.get(&element.id).copied().unwrap_or(0);
        let mut row = vec![
            element.id.to_string(),
            element.name.clone(),
            index.to_string(),
            shape.level.get(&element.id).copied().unwrap_or(0).to_string(),
            (depth + 1).to_string(),
            depth.to_string(),
            element.element_type.code().to_string(),
            parents.len().to_string(),
            join_ids(parents),
            children.len().to_string(),
            join_ids(children.iter().map(|(c, _)| *c)),
            wire::join(children.iter().map(|(_, w)| format_number(*w)), ","),
        ];
        if permission {
            row.push("W".into());
        }
        row
    }

    /// `/dimension/elements`. In list mode the first row says the id
    /// lists are already free of hidden elements.
    fn list(&self, mode: bool, permission: bool) -> Rows {
        let shape = self.shape();
        let mut rows = Vec::with_capacity(self.elements.len() + 1);
        if mode {
            rows.push(vec!["0".to_string()]);
        }
        for (index, element) in self.elements.iter().enumerate() {
            if !self.hidden.contains(&element.id) {
                rows.push(self.element_row(index, &shape, mode, permission));
            }
        }
        rows
    }

    /// Creates an element, or retypes the existing base element of that name.
    fn create(&mut self, name: &str, element_type: ElementType) -> usize {
        if let Some(index) = self.index_by_name(name) {
            let element = &mut self.elements[index];
            if element.element_type != ElementType::Consolidated && element_type != ElementType::Consolidated {
                element.element_type = element_type;
            }
            return index;
        }
        self.elements.push(MemElement {
            id: self.next_element,
            name: name.to_string(),
            element_type,
            children: Vec::new(),
        });
        self.next_element += 1;
        self.elements.len() - 1
    }

    fn replace_bulk(&mut self, request: &Request) -> Result<()> {
        if let Some(names) = request.get("name_elements") {
            let names = wire::split_quoted(names, ',');
            let types: Vec<ElementType> = match request.get("types") {
                Some(raw) => raw.split(',').map(element_type).collect::<Result<_>>()?,
                None => vec![element_type(param(request, "type")?)?; names.len()],
            };
            if types.len() != names.len() {
                return Err(Error::server(codes::PARAMETER_MISSING, "names and types differ in length"));
            }
            for (name, t) in names.iter().zip(types) {
                self.create(name, t);
            }
            return Ok(());
        }

        let parents = numbers(param(request, "elements")?)?;
        let target = element_type(param(request, "type")?)?;
        for parent in &parents {
            self.index_of(*parent)?;
        }
        if target != ElementType::Consolidated {
            for parent in parents {
                let index = self.index_of(parent)?;
                self.elements[index].element_type = target;
                self.elements[index].children.clear();
            }
            return Ok(());
        }

        let children: Vec<&str> = param(request, "children")?.split(':').collect();
        let weights: Vec<&str> = param(request, "weights")?.split(':').collect();
        if children.len() != parents.len() || weights.len() != parents.len() {
            return Err(Error::server(codes::PARAMETER_MISSING, "one child and weight list per element expected"));
        }
        let mut updates = Vec::with_capacity(parents.len());
        for ((parent, children), weights) in parents.iter().zip(children).zip(weights) {
            let children = numbers(children)?;
            let weights = wire::f64_list(weights)?;
            if children.is_empty() || children.len() != weights.len() {
                return Err(Error::server(
                    codes::PARAMETER_MISSING,
                    format!("element {parent} needs matching, non-empty children and weights"),
                ));
            }
            for child in &children {
                self.index_of(*child)?;
            }
            updates.push((*parent, children.into_iter().zip(weights).collect::<Vec<_>>()));
        }
        for (parent, children) in updates {
            let index = self.index_of(parent)?;
            self.elements[index].element_type = ElementType::Consolidated;
            self.elements[index].children = children;
        }
        Ok(())
    }

    fn destroy(&mut self, ids: &[u32]) -> Result<()> {
        for id in ids {
            self.index_of(*id)?;
        }
        self.elements.retain(|e| !ids.contains(&e.id));
        for element in &mut self.elements {
            element.children.retain(|(c, _)| !ids.contains(c));
        }
        self.hidden.retain(|h| !ids.contains(h));
        Ok(())
    }

    fn move_to(&mut self, id: u32, position: u32) -> Result<()> {
        let index = self.index_of(id)?;
        let position = position as usize;
        if position >= self.elements.len() {
            return Err(Error::server(codes::INVALID_POSITION, format!("position {position} is out of range")));
        }
        let element = self.elements.remove(index);
        self.elements.insert(position, element);
        Ok(())
    }
}
