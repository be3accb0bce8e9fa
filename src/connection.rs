//! # Connection and catalog cache
//!
//! A [`Connection`] owns one session with a server and a lazily built
//! mirror of the server's database list. Every handle reached from it
//! (databases, dimensions, cubes, elements) shares the connection's
//! [`Session`] but never points back at the connection itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::cache::{Cached, TrustWindow};
use crate::config::ClientConfig;
use crate::database::Database;
use crate::model::{DatabaseId, DatabaseInfo, DatabaseType, ServerInfo, ServerVersion};
use crate::transport::{ops, wire, Capabilities, MemoryTransport, Request, Rows, Transport};
use crate::{Error, Result};

// ============================================================================
// Session
// ============================================================================

/// What every handle needs to talk to the server.
pub(crate) struct Session {
    transport: Arc<dyn Transport>,
    capabilities: Capabilities,
    server: ServerInfo,
    config: ClientConfig,
    closed: AtomicBool,
    /// Set by handles whose change shows up in the database list.
    catalog_stale: AtomicBool,
}

impl Session {
    pub(crate) fn send(&self, request: Request) -> Result<Rows> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Session(format!(
                "connection closed, cannot send {}",
                request.operation
            )));
        }
        tracing::debug!(
            transport = self.transport.name(),
            operation = %request.operation,
            params = request.params.len(),
            token_only = request.token_only,
            "request"
        );
        self.transport.send(&request)
    }

    /// Sends a token-only request and returns the token.
    pub(crate) fn token(&self, request: Request) -> Result<u64> {
        let what = request.operation.clone();
        let rows = self.send(request.token_only())?;
        wire::token(&rows, &what)
    }

    pub(crate) fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Makes the next catalog read revalidate.
    pub(crate) fn end_catalog_trust(&self) {
        self.catalog_stale.store(true, Ordering::Release);
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// One generation of the server's database list.
pub(crate) struct Catalog {
    databases: Vec<Database>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<DatabaseId, usize>,
}

impl Catalog {
    fn build(databases: Vec<Database>) -> Self {
        let mut by_name = HashMap::with_capacity(databases.len());
        let mut by_id = HashMap::with_capacity(databases.len());
        for (i, db) in databases.iter().enumerate() {
            by_name.insert(db.name().to_lowercase(), i);
            by_id.insert(db.id(), i);
        }
        Self { databases, by_name, by_id }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A session with one server plus its cached database list.
pub struct Connection {
    session: Arc<Session>,
    catalog: Mutex<Cached<Catalog, u64>>,
}

impl Connection {
    /// Opens a session and reads the server's version.
    ///
    /// Fails without leaving any state behind when the session cannot be
    /// established.
    pub fn open(transport: impl Transport, config: ClientConfig) -> Result<Self> {
        Self::open_shared(Arc::new(transport), config)
    }

    /// Like [`open`](Connection::open), for a transport that is shared with
    /// other owners.
    pub fn open_shared(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        transport.open()?;

        let server = match Self::read_server_info(transport.as_ref()) {
            Ok(server) => server,
            Err(e) => {
                if let Err(close_err) = transport.close(false) {
                    tracing::debug!(error = %close_err, "logout after failed open also failed");
                }
                return Err(e);
            }
        };
        let capabilities = Capabilities::for_version(server.version);

        tracing::info!(
            transport = transport.name(),
            version = %server.version,
            "connection opened"
        );

        let window = TrustWindow::from_secs(config.cache.connection_ttl_secs);
        Ok(Self {
            session: Arc::new(Session {
                transport,
                capabilities,
                server,
                config,
                closed: AtomicBool::new(false),
                catalog_stale: AtomicBool::new(false),
            }),
            catalog: Mutex::new(Cached::new("catalog", window)),
        })
    }

    fn read_server_info(transport: &dyn Transport) -> Result<ServerInfo> {
        let rows = transport.send(&Request::new(ops::SERVER_INFO).without_session())?;
        ServerInfo::from_row(wire::first_row(&rows, "server info")?)
    }

    /// In-process server for testing and embedding.
    pub fn open_memory() -> Result<Self> {
        Self::open(MemoryTransport::new(), ClientConfig::default())
    }

    /// Connects to a live server over HTTP.
    #[cfg(feature = "http")]
    pub fn open_http(config: ClientConfig) -> Result<Self> {
        let transport = crate::transport::HttpTransport::new(&config)?;
        Self::open(transport, config)
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.session.server
    }

    pub fn version(&self) -> ServerVersion {
        self.session.server.version
    }

    pub fn capabilities(&self) -> Capabilities {
        self.session.capabilities
    }

    pub fn config(&self) -> &ClientConfig {
        &self.session.config
    }

    pub fn is_closed(&self) -> bool {
        self.session.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Catalog reads
    // ========================================================================

    fn catalog(&self) -> Result<Arc<Catalog>> {
        let session = &self.session;
        let mut catalog = self.catalog.lock();
        if session.catalog_stale.swap(false, Ordering::AcqRel) {
            catalog.end_trust();
        }
        let (generation, _) = catalog.validate(
            || {
                let token = session.token(Request::new(ops::SERVER_INFO))?;
                Ok((token, ()))
            },
            |_, previous| {
                let rows = session.send(
                    Request::new(ops::SERVER_DATABASES)
                        .param("show_normal", 1)
                        .param("show_system", 1)
                        .param("show_user_info", 1),
                )?;
                let mut databases = Vec::with_capacity(rows.len());
                for row in &rows {
                    let info = DatabaseInfo::from_row(row)?;
                    let reused = previous
                        .and_then(|p| p.by_id.get(&info.id).map(|&i| p.databases[i].clone()))
                        .filter(|db| db.database_type() == info.database_type);
                    let db = match reused {
                        Some(db) => {
                            db.set_name(&info.name);
                            db
                        }
                        None => Database::new(Arc::clone(session), &info),
                    };
                    databases.push(db);
                }
                Ok(Catalog::build(databases))
            },
        )?;
        Ok(generation)
    }

    /// Every database on the server, in server order.
    pub fn databases(&self) -> Result<Vec<Database>> {
        Ok(self.catalog()?.databases.clone())
    }

    /// Case-insensitive lookup; `None` if there is no such database.
    pub fn database_by_name(&self, name: &str) -> Result<Option<Database>> {
        let catalog = self.catalog()?;
        Ok(catalog
            .by_name
            .get(&name.to_lowercase())
            .map(|&i| catalog.databases[i].clone()))
    }

    pub fn database_by_id(&self, id: DatabaseId) -> Result<Option<Database>> {
        let catalog = self.catalog()?;
        Ok(catalog.by_id.get(&id).map(|&i| catalog.databases[i].clone()))
    }

    // ========================================================================
    // Catalog mutations
    // ========================================================================

    /// Creates a normal database.
    pub fn add_database(&self, name: &str) -> Result<Database> {
        self.session.send(
            Request::new(ops::DATABASE_CREATE)
                .param("new_name", name)
                .param("type", DatabaseType::Normal.code()),
        )?;
        self.catalog.lock().end_trust();
        self.database_by_name(name)?
            .ok_or_else(|| Error::NotFound(format!("Database {name} was not created")))
    }

    pub fn remove_database(&self, database: &Database) -> Result<()> {
        self.session
            .send(Request::new(ops::DATABASE_DESTROY).param("database", database.id()))?;
        database.reset_caches();
        self.catalog.lock().end_trust();
        Ok(())
    }

    // ========================================================================
    // Cache control
    // ========================================================================

    /// Drops the database list immediately.
    pub fn reset_cache(&self) {
        self.catalog.lock().reset();
    }

    pub fn set_cache_trust_expiry(&self, secs: u64) {
        self.catalog.lock().window_mut().set_duration(Duration::from_secs(secs));
    }

    /// Ends the session and drops every cache reachable from this
    /// connection. Handles obtained earlier fail with a session error.
    pub fn close(&self) -> Result<()> {
        if self.session.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(catalog) = self.catalog.lock().current() {
            for db in &catalog.databases {
                db.reset_caches();
            }
        }
        self.reset_cache();
        tracing::info!(transport = self.session.transport.name(), "connection closed");
        self.session.transport.close(self.session.capabilities.logout_with_stop)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.session.transport.name())
            .field("version", &self.session.server.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Named connections owned by the application.
///
/// Replaces process-wide connection managers: the application decides
/// where the registry lives, and closing it closes every connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a connection under `key`. An existing connection with the same
    /// key is closed first.
    pub fn open(
        &self,
        key: &str,
        transport: impl Transport,
        config: ClientConfig,
    ) -> Result<Arc<Connection>> {
        let connection = Arc::new(Connection::open(transport, config)?);
        let previous = self
            .connections
            .write()
            .insert(key.to_string(), Arc::clone(&connection));
        if let Some(previous) = previous {
            previous.close()?;
        }
        Ok(connection)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(key).cloned()
    }

    /// Closes and forgets the connection under `key`; false if there was none.
    pub fn close(&self, key: &str) -> Result<bool> {
        let removed = self.connections.write().remove(key);
        match removed {
            Some(connection) => {
                connection.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Closes every connection; the first failure is returned after all
    /// connections were attempted.
    pub fn close_all(&self) -> Result<()> {
        let drained: Vec<_> = self.connections.write().drain().collect();
        let mut first_error = None;
        for (key, connection) in drained {
            if let Err(e) = connection.close() {
                tracing::warn!(key = %key, error = %e, "closing connection failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn open(transport: &MemoryTransport) -> Connection {
        Connection::open(transport.clone(), ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_open_reads_version() {
        let transport = MemoryTransport::new().with_version(ServerVersion::new(5, 0, 0, 4000));
        let conn = open(&transport);
        assert_eq!(conn.version().build, 4000);
        assert!(!conn.capabilities().bulk_rules);
    }

    #[test]
    fn test_failed_login_is_fatal() {
        let transport = MemoryTransport::new();
        transport.reject_logins(true);
        let err = Connection::open(transport.clone(), ClientConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Session(_)));
        assert_eq!(transport.count(ops::SERVER_INFO), 0);
    }

    #[test]
    fn test_catalog_lookup_is_case_insensitive() {
        let transport = MemoryTransport::new();
        let conn = open(&transport);
        conn.add_database("Planning").unwrap();
        assert!(conn.database_by_name("PLANNING").unwrap().is_some());
        assert!(conn.database_by_name("missing").unwrap().is_none());
    }

    #[test]
    fn test_catalog_trusted_within_window() {
        let transport = MemoryTransport::new();
        let conn = open(&transport);
        conn.add_database("Planning").unwrap();
        conn.databases().unwrap();

        transport.clear_log();
        conn.databases().unwrap();
        conn.database_by_name("Planning").unwrap();
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_catalog_revalidates_by_token() {
        let transport = MemoryTransport::new();
        let config = ClientConfig::default().with_cache(CacheConfig::uniform(0));
        let conn = Connection::open(transport.clone(), config).unwrap();
        conn.add_database("Planning").unwrap();
        conn.databases().unwrap();

        transport.clear_log();
        conn.databases().unwrap();
        assert_eq!(transport.count(ops::SERVER_INFO), 1);
        assert_eq!(transport.count(ops::SERVER_DATABASES), 0);
    }

    #[test]
    fn test_catalog_sees_other_clients_after_window() {
        let transport = MemoryTransport::new();
        let conn = open(&transport);
        let other = open(&transport);
        assert!(conn.databases().unwrap().iter().all(|db| db.name() != "Forecast"));

        other.add_database("Forecast").unwrap();
        assert!(conn.database_by_name("Forecast").unwrap().is_none());

        conn.set_cache_trust_expiry(0);
        assert!(conn.database_by_name("Forecast").unwrap().is_some());
    }

    #[test]
    fn test_failed_refresh_is_not_masked() {
        let transport = MemoryTransport::new();
        let conn = open(&transport);
        conn.databases().unwrap();
        conn.set_cache_trust_expiry(0);

        transport.fail_next("connection reset");
        assert!(matches!(conn.databases(), Err(Error::Transport(_))));
    }

    #[test]
    fn test_handles_survive_unrelated_catalog_change() {
        let transport = MemoryTransport::new();
        let conn = open(&transport);
        let planning = conn.add_database("Planning").unwrap();
        conn.add_database("Forecast").unwrap();
        let again = conn.database_by_name("planning").unwrap().unwrap();
        assert!(planning.same_handle(&again));
    }

    #[test]
    fn test_close_invalidates_handles() {
        let transport = MemoryTransport::new();
        let conn = open(&transport);
        let db = conn.add_database("Planning").unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert!(matches!(db.dimensions(), Err(Error::Session(_))));
        assert_eq!(transport.count(ops::SERVER_LOGOUT), 1);
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = ConnectionRegistry::new();
        let transport = MemoryTransport::new();
        let first = registry.open("main", transport.clone(), ClientConfig::default()).unwrap();
        assert_eq!(registry.len(), 1);

        let second = registry.open("main", transport.clone(), ClientConfig::default()).unwrap();
        assert!(first.is_closed());
        assert!(!second.is_closed());

        assert!(registry.close("main").unwrap());
        assert!(!registry.close("main").unwrap());
        assert!(registry.is_empty());
    }
}
