//! # Transport
//!
//! This is THE contract between the cache layer and the server. The cache
//! never opens sockets or sessions itself; it hands a [`Request`] to a
//! [`Transport`] and gets back rows of string fields.
//!
//! ## Implementations
//!
//! | Transport | Module | Description |
//! |-----------|--------|-------------|
//! | `MemoryTransport` | `memory` | In-process server for testing/embedding |
//! | `HttpTransport` | `http` | Live server over HTTP (feature `http`) |

pub mod wire;
pub mod memory;
#[cfg(feature = "http")]
pub mod http;

use serde::{Deserialize, Serialize};

use crate::model::ServerVersion;
use crate::Result;

pub use memory::MemoryTransport;
#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use wire::{Row, Rows};

// ============================================================================
// Operations
// ============================================================================

/// Operation names understood by the server.
pub mod ops {
    pub const SERVER_INFO: &str = "/server/info";
    pub const SERVER_DATABASES: &str = "/server/databases";
    pub const SERVER_LOGIN: &str = "/server/login";
    pub const SERVER_LOGOUT: &str = "/server/logout";

    pub const DATABASE_INFO: &str = "/database/info";
    pub const DATABASE_CREATE: &str = "/database/create";
    pub const DATABASE_DESTROY: &str = "/database/destroy";
    pub const DATABASE_RENAME: &str = "/database/rename";
    pub const DATABASE_SAVE: &str = "/database/save";
    pub const DATABASE_DIMENSIONS: &str = "/database/dimensions";
    pub const DATABASE_CUBES: &str = "/database/cubes";

    pub const DIMENSION_INFO: &str = "/dimension/info";
    pub const DIMENSION_CREATE: &str = "/dimension/create";
    pub const DIMENSION_DESTROY: &str = "/dimension/destroy";
    pub const DIMENSION_RENAME: &str = "/dimension/rename";
    pub const DIMENSION_ELEMENTS: &str = "/dimension/elements";

    pub const ELEMENT_INFO: &str = "/element/info";
    pub const ELEMENT_REPLACE: &str = "/element/replace";
    pub const ELEMENT_REPLACE_BULK: &str = "/element/replace_bulk";
    pub const ELEMENT_DESTROY_BULK: &str = "/element/destroy_bulk";
    pub const ELEMENT_RENAME: &str = "/element/rename";
    pub const ELEMENT_MOVE: &str = "/element/move";
    pub const ELEMENT_MOVE_BULK: &str = "/element/move_bulk";

    pub const CUBE_INFO: &str = "/cube/info";
    pub const CUBE_CREATE: &str = "/cube/create";
    pub const CUBE_DESTROY: &str = "/cube/destroy";
    pub const CUBE_RENAME: &str = "/cube/rename";
    pub const CUBE_CLEAR: &str = "/cube/clear";
    pub const CUBE_SAVE: &str = "/cube/save";
    pub const CUBE_LOCK: &str = "/cube/lock";
    pub const CUBE_COMMIT: &str = "/cube/commit";
    pub const CUBE_CONVERT: &str = "/cube/convert";
    pub const CUBE_RULES: &str = "/cube/rules";

    pub const CELL_VALUE: &str = "/cell/value";
    pub const CELL_EXPORT: &str = "/cell/export";
    pub const CELL_REPLACE_BULK: &str = "/cell/replace_bulk";

    pub const RULE_CREATE: &str = "/rule/create";
    pub const RULE_MODIFY: &str = "/rule/modify";
    pub const RULE_DESTROY: &str = "/rule/destroy";
    pub const RULE_PARSE: &str = "/rule/parse";
}

/// Server error codes the client reacts to.
pub mod codes {
    pub const ID_NOT_FOUND: u32 = 1000;
    pub const INVALID_SESSION: u32 = 1015;
    pub const PARAMETER_MISSING: u32 = 1016;
    pub const DATABASE_NOT_FOUND: u32 = 2001;
    pub const DATABASE_NAME_IN_USE: u32 = 2005;
    pub const DIMENSION_NOT_FOUND: u32 = 3002;
    pub const DIMENSION_NAME_IN_USE: u32 = 3005;
    pub const DIMENSION_IN_USE: u32 = 3006;
    pub const ELEMENT_NAME_IN_USE: u32 = 4002;
    pub const ELEMENT_NOT_FOUND: u32 = 4004;
    pub const INVALID_POSITION: u32 = 4009;
    pub const CUBE_NOT_FOUND: u32 = 5000;
    pub const INVALID_CUBE_NAME: u32 = 5001;
    pub const SPLASH_DISABLED: u32 = 5005;
    pub const CUBE_LOCK_NOT_FOUND: u32 = 5013;
    pub const PARSING_RULE: u32 = 8001;
    pub const RULE_NOT_FOUND: u32 = 8002;

    /// Codes that mean "the addressed entity does not exist".
    pub const NOT_FOUND: &[u32] = &[
        ID_NOT_FOUND,
        DATABASE_NOT_FOUND,
        DIMENSION_NOT_FOUND,
        ELEMENT_NOT_FOUND,
        CUBE_NOT_FOUND,
        RULE_NOT_FOUND,
    ];
}

// ============================================================================
// Request
// ============================================================================

/// One named operation with its parameters.
///
/// Parameter values are kept raw; [`Request::query_string`] produces the
/// percent-encoded form for transports that need it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub operation: String,
    pub params: Vec<(String, String)>,
    /// Attach the session id.
    pub with_session: bool,
    /// Only the entity's version token is wanted, not the body.
    pub token_only: bool,
    /// The body plus the entity's version token, appended to the first row.
    pub with_token: bool,
}

impl Request {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            params: Vec::new(),
            with_session: true,
            token_only: false,
            with_token: false,
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    /// Adds `key=1` when `flag` is set.
    pub fn flag(self, key: &str, flag: bool) -> Self {
        if flag { self.param(key, 1) } else { self }
    }

    pub fn without_session(mut self) -> Self {
        self.with_session = false;
        self
    }

    pub fn token_only(mut self) -> Self {
        self.token_only = true;
        self
    }

    pub fn with_token(mut self) -> Self {
        self.with_token = true;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// `key=value&key=value` with percent-encoded values.
    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{k}={}", wire::percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Protocol features that depend on the server release.
///
/// Derived once when a connection opens and consulted by each call site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Rule (de)activation and removal accept a list of rules in one call.
    pub bulk_rules: bool,
    /// Elements of mixed types can be created in one call.
    pub typed_element_create: bool,
    /// The element list carries a header row telling whether hidden
    /// elements were already filtered out.
    pub element_list_mode: bool,
    /// Several elements can be moved in one call.
    pub bulk_move: bool,
    /// Logout can stop the session's running jobs.
    pub logout_with_stop: bool,
}

impl Capabilities {
    pub fn for_version(v: ServerVersion) -> Self {
        let at_least_5_1 = v.major >= 6 || (v.major == 5 && v.minor >= 1);
        Self {
            bulk_rules: v.major > 5
                || (v.major == 5 && v.minor > 0)
                || (v.major == 5 && v.minor == 0 && v.build > 4098),
            typed_element_create: at_least_5_1,
            element_list_mode: at_least_5_1,
            bulk_move: v.major >= 6 || (v.major == 5 && v.minor >= 1 && v.build > 5359),
            logout_with_stop: at_least_5_1,
        }
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// The universal server contract.
///
/// Implementations own the session: they log in on [`open`](Transport::open),
/// attach the session id to every request that asks for it, and rotate it
/// transparently when the server rejects it. Timeouts and cancellation are
/// theirs too; the cache layer just waits for `send` to return.
pub trait Transport: Send + Sync + 'static {
    /// Establishes the session. A failure here is fatal to the connection.
    fn open(&self) -> Result<()>;

    /// Ends the session; `stop` also cancels the session's running jobs
    /// when the server supports it.
    fn close(&self, stop: bool) -> Result<()>;

    /// Sends one request and returns its rows.
    ///
    /// For a `token_only` request the result is a single row holding the
    /// entity's version token. A `with_token` request gets that token as
    /// one more field of its first row.
    fn send(&self, request: &Request) -> Result<Rows>;

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "transport"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_5_0() {
        let old = Capabilities::for_version(ServerVersion::new(5, 0, 0, 4098));
        assert!(!old.bulk_rules);
        assert!(!old.typed_element_create);
        let patched = Capabilities::for_version(ServerVersion::new(5, 0, 0, 4099));
        assert!(patched.bulk_rules);
        assert!(!patched.bulk_move);
    }

    #[test]
    fn test_capabilities_5_1() {
        let early = Capabilities::for_version(ServerVersion::new(5, 1, 0, 5359));
        assert!(early.typed_element_create && early.element_list_mode && early.logout_with_stop);
        assert!(!early.bulk_move);
        let late = Capabilities::for_version(ServerVersion::new(5, 1, 0, 5360));
        assert!(late.bulk_move);
    }

    #[test]
    fn test_capabilities_6() {
        let caps = Capabilities::for_version(ServerVersion::new(6, 0, 0, 0));
        assert_eq!(
            caps,
            Capabilities {
                bulk_rules: true,
                typed_element_create: true,
                element_list_mode: true,
                bulk_move: true,
                logout_with_stop: true,
            }
        );
    }

    #[test]
    fn test_query_string_encodes_values() {
        let req = Request::new(ops::ELEMENT_RENAME)
            .param("database", 1)
            .param("new_name", "Q1 & Q2")
            .flag("show_permission", false);
        assert_eq!(req.query_string(), "database=1&new_name=Q1%20%26%20Q2");
        assert_eq!(req.get("new_name"), Some("Q1 & Q2"));
    }
}
