//! # molap-rs: Caching Client for MOLAP Servers
//!
//! Program against a remote multidimensional database: databases,
//! dimensions (element hierarchies with weighted consolidations and typed
//! attributes), cubes and their cells, without dealing with the server's
//! request/response protocol.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `Transport` is the contract between the cache layer and the server
//! 2. **Two-tier validity**: a trust window first, a version token second
//! 3. **Immutable generations**: a rebuild swaps a whole snapshot; readers never see a mix
//! 4. **Bounded transfers**: exports are paged cursors, loads are chunked writes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use molap_rs::{ClientConfig, Connection, ElementType, MemoryTransport};
//!
//! # fn example() -> molap_rs::Result<()> {
//! let conn = Connection::open(MemoryTransport::new(), ClientConfig::default())?;
//!
//! let db = conn.add_database("Demo")?;
//! let products = db.add_dimension("Products")?;
//! products.add_elements(&["Total", "Bikes", "Cars"], &[ElementType::Numeric; 3])?;
//!
//! for element in products.elements(false)? {
//!     println!("{} ({:?})", element.name(), element.element_type()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Transports
//!
//! | Transport | Feature | Description |
//! |-----------|---------|-------------|
//! | Memory | (default) | In-process server for testing/embedding |
//! | HTTP | `http` | Live server over HTTP |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod cache;
pub mod config;
pub mod transport;
pub mod connection;
pub mod database;
pub mod dimension;
pub mod cube;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Area, Cell, CellExportContext, CellLoadContext, CellPath, CellType, CellValue,
    CellsExportType, Consolidation, CubeId, CubeInfo, CubeType, DatabaseId, DatabaseInfo,
    DatabaseType, DimensionId, DimensionInfo, DimensionType, ElementId, ElementPermission,
    ElementType, LockId, Rule, RuleId, ServerInfo, ServerVersion, SplashMode,
};

// ============================================================================
// Re-exports: Transport
// ============================================================================

pub use transport::{Capabilities, MemoryTransport, Request, Row, Rows, Transport};
#[cfg(feature = "http")]
pub use transport::HttpTransport;

// ============================================================================
// Re-exports: Handles
// ============================================================================

pub use cache::{TrustWindow, DEFAULT_TRUST_SECS};
pub use config::{BulkConfig, CacheConfig, ClientConfig};
pub use connection::{Connection, ConnectionRegistry};
pub use database::Database;
pub use dimension::{Attribute, Dimension, Element};
pub use cube::{CellsExporter, Cube};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Server error {code}: {message}")]
    Server { code: u32, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Element {name} with id {id} is already deleted")]
    ElementDeleted { name: String, id: ElementId },

    #[error("Detached handle: {0}")]
    Detached(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn server(code: u32, message: impl Into<String>) -> Self {
        Error::Server { code, message: message.into() }
    }

    /// True for local not-found errors and for server errors whose code
    /// means the addressed entity does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) | Error::ElementDeleted { .. } => true,
            Error::Server { code, .. } => transport::codes::NOT_FOUND.contains(code),
            _ => false,
        }
    }

    /// Server error code, if any.
    pub fn code(&self) -> Option<u32> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(Error::server(transport::codes::ELEMENT_NOT_FOUND, "element not found").is_not_found());
        assert!(!Error::server(transport::codes::INVALID_SESSION, "invalid session").is_not_found());
        assert!(Error::NotFound("Element 'X'".into()).is_not_found());
        assert!(!Error::InvalidOperation("empty".into()).is_not_found());
    }

    #[test]
    fn test_error_messages_name_the_entity() {
        let err = Error::ElementDeleted { name: "Bikes".into(), id: ElementId(3) };
        assert_eq!(err.to_string(), "Element Bikes with id 3 is already deleted");
        assert_eq!(Error::server(1015, "invalid session").code(), Some(1015));
    }
}
