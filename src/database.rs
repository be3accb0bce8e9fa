//! # Database
//!
//! A database mirrors its dimension and cube lists as one generation,
//! validated against the database token. Dimension and cube handles are
//! carried over from the previous generation when their id survives a
//! rebuild, so their own caches are not thrown away for an unrelated change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::cache::{Cached, TrustWindow};
use crate::connection::Session;
use crate::cube::Cube;
use crate::dimension::Dimension;
use crate::model::{
    CubeId, CubeInfo, DatabaseId, DatabaseInfo, DatabaseType, DimensionId, DimensionInfo,
    DimensionType,
};
use crate::transport::{ops, wire, Request};
use crate::{Error, Result};

/// A named container of dimensions and cubes.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

pub(crate) struct DatabaseInner {
    pub(crate) session: Arc<Session>,
    id: DatabaseId,
    name: RwLock<String>,
    database_type: DatabaseType,
    structure: Mutex<Cached<Structure, u64>>,
    dimension_ttl_secs: AtomicU64,
    cube_ttl_secs: AtomicU64,
}

/// One generation of the dimension and cube lists.
pub(crate) struct Structure {
    dimensions: Vec<Dimension>,
    dimensions_by_name: HashMap<String, usize>,
    dimensions_by_id: HashMap<DimensionId, usize>,
    cubes: Vec<Cube>,
    cubes_by_name: HashMap<String, usize>,
    cubes_by_id: HashMap<CubeId, usize>,
}

impl Structure {
    fn build(dimensions: Vec<Dimension>, cubes: Vec<Cube>) -> Self {
        let mut dimensions_by_name = HashMap::with_capacity(dimensions.len());
        let mut dimensions_by_id = HashMap::with_capacity(dimensions.len());
        for (i, dim) in dimensions.iter().enumerate() {
            dimensions_by_name.insert(dim.name().to_lowercase(), i);
            dimensions_by_id.insert(dim.id(), i);
        }
        let mut cubes_by_name = HashMap::with_capacity(cubes.len());
        let mut cubes_by_id = HashMap::with_capacity(cubes.len());
        for (i, cube) in cubes.iter().enumerate() {
            cubes_by_name.insert(cube.name().to_lowercase(), i);
            cubes_by_id.insert(cube.id(), i);
        }
        Self {
            dimensions,
            dimensions_by_name,
            dimensions_by_id,
            cubes,
            cubes_by_name,
            cubes_by_id,
        }
    }

    fn dimension_by_id(&self, id: DimensionId) -> Option<Dimension> {
        self.dimensions_by_id.get(&id).map(|&i| self.dimensions[i].clone())
    }

    fn cube_by_id(&self, id: CubeId) -> Option<Cube> {
        self.cubes_by_id.get(&id).map(|&i| self.cubes[i].clone())
    }
}

impl Database {
    pub(crate) fn new(session: Arc<Session>, info: &DatabaseInfo) -> Self {
        let cache = session.config().cache.clone();
        Self {
            inner: Arc::new(DatabaseInner {
                session,
                id: info.id,
                name: RwLock::new(info.name.clone()),
                database_type: info.database_type,
                structure: Mutex::new(Cached::new(
                    "database",
                    TrustWindow::from_secs(cache.database_ttl_secs),
                )),
                dimension_ttl_secs: AtomicU64::new(cache.dimension_ttl_secs),
                cube_ttl_secs: AtomicU64::new(cache.cube_ttl_secs),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<DatabaseInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<DatabaseInner> {
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

    pub fn id(&self) -> DatabaseId {
        self.inner.id
    }

    pub fn name(&self) -> String {
        self.inner.name.read().clone()
    }

    pub fn database_type(&self) -> DatabaseType {
        self.inner.database_type
    }

    /// True if both values refer to the same cached handle.
    pub fn same_handle(&self, other: &Database) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fresh info from the server, bypassing the cache.
    pub fn info(&self) -> Result<DatabaseInfo> {
        let rows = self
            .inner
            .session
            .send(Request::new(ops::DATABASE_INFO).param("database", self.id()))?;
        DatabaseInfo::from_row(wire::first_row(&rows, "database info")?)
    }

    // ========================================================================
    // Structure cache
    // ========================================================================

    fn structure(&self) -> Result<Arc<Structure>> {
        let mut structure = self.inner.structure.lock();
        let (generation, _) = structure.validate(
            || {
                let info = self.info()?;
                Ok((info.token, info))
            },
            |info, previous| self.build_structure(&info, previous),
        )?;
        Ok(generation)
    }

    fn build_structure(&self, info: &DatabaseInfo, previous: Option<&Arc<Structure>>) -> Result<Structure> {
        self.set_name(&info.name);
        let session = &self.inner.session;

        let rows = session.send(
            Request::new(ops::DATABASE_DIMENSIONS)
                .param("database", self.id())
                .param("show_normal", 1)
                .param("show_system", 1)
                .param("show_attribute", 1)
                .param("show_info", 1),
        )?;
        let dimension_ttl = self.inner.dimension_ttl_secs.load(Ordering::Relaxed);
        let mut dimensions = Vec::with_capacity(rows.len());
        for row in &rows {
            let info = DimensionInfo::from_row(row)?;
            let reused = previous
                .and_then(|p| p.dimension_by_id(info.id))
                .filter(|d| d.dimension_type() == info.dimension_type);
            let dimension = match reused {
                Some(d) => {
                    d.set_name(&info.name);
                    d
                }
                None => Dimension::new(self, &info, dimension_ttl),
            };
            dimensions.push(dimension);
        }

        let rows = session.send(
            Request::new(ops::DATABASE_CUBES)
                .param("database", self.id())
                .param("show_normal", 1)
                .param("show_system", 1)
                .param("show_attribute", 1)
                .param("show_info", 1)
                .param("show_gputype", 1),
        )?;
        let cube_ttl = self.inner.cube_ttl_secs.load(Ordering::Relaxed);
        let mut cubes = Vec::with_capacity(rows.len());
        for row in &rows {
            let info = CubeInfo::from_row(row)?;
            let reused = previous
                .and_then(|p| p.cube_by_id(info.id))
                .filter(|c| c.dimension_ids() == info.dimensions.as_slice());
            let cube = match reused {
                Some(c) => {
                    c.set_name(&info.name);
                    c
                }
                None => Cube::new(self, &info, cube_ttl),
            };
            cubes.push(cube);
        }

        Ok(Structure::build(dimensions, cubes))
    }

    /// The current structure if one was built, without revalidating.
    fn current_or_validate(&self) -> Result<Arc<Structure>> {
        let current = self.inner.structure.lock().current();
        match current {
            Some(structure) => Ok(structure),
            None => self.structure(),
        }
    }

    // ========================================================================
    // Dimensions
    // ========================================================================

    pub fn dimensions(&self) -> Result<Vec<Dimension>> {
        Ok(self.structure()?.dimensions.clone())
    }

    /// Case-insensitive lookup; `None` if there is no such dimension.
    pub fn dimension_by_name(&self, name: &str) -> Result<Option<Dimension>> {
        let structure = self.structure()?;
        Ok(structure
            .dimensions_by_name
            .get(&name.to_lowercase())
            .map(|&i| structure.dimensions[i].clone()))
    }

    /// Id lookup used for internal links (attribute dimensions, cube axes).
    ///
    /// Served from the current generation without a token check; an unknown
    /// id forces one revalidation in case the dimension is new.
    pub fn dimension_by_id(&self, id: DimensionId) -> Result<Option<Dimension>> {
        if let Some(d) = self.current_or_validate()?.dimension_by_id(id) {
            return Ok(Some(d));
        }
        self.inner.structure.lock().end_trust();
        Ok(self.structure()?.dimension_by_id(id))
    }

    /// Creates a normal dimension.
    pub fn add_dimension(&self, name: &str) -> Result<Dimension> {
        self.inner.session.send(
            Request::new(ops::DIMENSION_CREATE)
                .param("database", self.id())
                .param("new_name", name)
                .param("type", DimensionType::Normal.code()),
        )?;
        self.end_trust();
        self.dimension_by_name(name)?
            .ok_or_else(|| Error::NotFound(format!("Dimension {name} was not created in database {}", self.name())))
    }

    pub fn remove_dimension(&self, dimension: &Dimension) -> Result<()> {
        self.inner.session.send(
            Request::new(ops::DIMENSION_DESTROY)
                .param("database", self.id())
                .param("dimension", dimension.id()),
        )?;
        dimension.reset_cache();
        self.end_trust();
        Ok(())
    }

    // ========================================================================
    // Cubes
    // ========================================================================

    pub fn cubes(&self) -> Result<Vec<Cube>> {
        Ok(self.structure()?.cubes.clone())
    }

    /// Case-insensitive lookup; `None` if there is no such cube.
    pub fn cube_by_name(&self, name: &str) -> Result<Option<Cube>> {
        let structure = self.structure()?;
        Ok(structure
            .cubes_by_name
            .get(&name.to_lowercase())
            .map(|&i| structure.cubes[i].clone()))
    }

    /// Id lookup with the same semantics as [`dimension_by_id`](Database::dimension_by_id).
    pub fn cube_by_id(&self, id: CubeId) -> Result<Option<Cube>> {
        if let Some(c) = self.current_or_validate()?.cube_by_id(id) {
            return Ok(Some(c));
        }
        self.inner.structure.lock().end_trust();
        Ok(self.structure()?.cube_by_id(id))
    }

    /// Cubes that use `dimension` as one of their axes.
    pub fn cubes_with_dimension(&self, dimension: &Dimension) -> Result<Vec<Cube>> {
        Ok(self
            .structure()?
            .cubes
            .iter()
            .filter(|c| c.dimension_ids().contains(&dimension.id()))
            .cloned()
            .collect())
    }

    /// Creates a normal cube over the given dimensions, in order.
    pub fn add_cube(&self, name: &str, dimensions: &[Dimension]) -> Result<Cube> {
        if dimensions.is_empty() {
            return Err(Error::InvalidOperation(format!(
                "Cube {name} needs at least one dimension"
            )));
        }
        let structure = self.structure()?;
        for d in dimensions {
            if d.database_id() != self.id() || structure.dimension_by_id(d.id()).is_none() {
                return Err(Error::NotFound(format!(
                    "Dimension {} does not exist in database {}",
                    d.name(),
                    self.name()
                )));
            }
        }
        self.inner.session.send(
            Request::new(ops::CUBE_CREATE)
                .param("database", self.id())
                .param("new_name", name)
                .param("dimensions", wire::join(dimensions.iter().map(Dimension::id), ",")),
        )?;
        self.end_trust();
        self.cube_by_name(name)?
            .ok_or_else(|| Error::NotFound(format!("Cube {name} was not created in database {}", self.name())))
    }

    pub fn remove_cube(&self, cube: &Cube) -> Result<()> {
        self.inner.session.send(
            Request::new(ops::CUBE_DESTROY)
                .param("database", self.id())
                .param("cube", cube.id()),
        )?;
        cube.reset_cache();
        self.end_trust();
        Ok(())
    }

    // ========================================================================
    // Database-level operations
    // ========================================================================

    pub fn rename(&self, new_name: &str) -> Result<()> {
        self.inner.session.send(
            Request::new(ops::DATABASE_RENAME)
                .param("database", self.id())
                .param("new_name", new_name),
        )?;
        self.set_name(new_name);
        self.end_trust();
        self.inner.session.end_catalog_trust();
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.inner
            .session
            .send(Request::new(ops::DATABASE_SAVE).param("database", self.id()))?;
        Ok(())
    }

    // ========================================================================
    // Cache control
    // ========================================================================

    pub(crate) fn end_trust(&self) {
        self.inner.structure.lock().end_trust();
    }

    pub fn set_cache_trust_expiry(&self, secs: u64) {
        self.inner
            .structure
            .lock()
            .window_mut()
            .set_duration(Duration::from_secs(secs));
    }

    /// Sets the trust durations of this database and of every dimension and
    /// cube in it, including ones materialised later.
    pub fn set_cache_trust_expiries(&self, database_secs: u64, cube_secs: u64, dimension_secs: u64) {
        self.set_cache_trust_expiry(database_secs);
        self.inner.cube_ttl_secs.store(cube_secs, Ordering::Relaxed);
        self.inner.dimension_ttl_secs.store(dimension_secs, Ordering::Relaxed);

        let current = self.inner.structure.lock().current();
        if let Some(structure) = current {
            for d in &structure.dimensions {
                d.set_cache_trust_expiry(dimension_secs);
            }
            for c in &structure.cubes {
                c.set_cache_trust_expiry(cube_secs);
            }
        }
    }

    /// Drops this database's caches and those of all its children.
    pub fn reset_caches(&self) {
        let current = {
            let mut structure = self.inner.structure.lock();
            let current = structure.current();
            structure.reset();
            current
        };
        if let Some(structure) = current {
            for d in &structure.dimensions {
                d.reset_cache();
            }
            for c in &structure.cubes {
                c.reset_cache();
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("type", &self.database_type())
            .finish()
    }
}
