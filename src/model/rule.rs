//! Cube rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RuleId;
use crate::transport::wire::{self, Row};
use crate::Result;

/// A computed-cell definition attached to a cube.
///
/// Rules are always read fresh from the server; nothing here is cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub definition: String,
    pub external_id: String,
    pub comment: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Rule {
    /// `id;definition;external_id;comment;timestamp;active`
    pub fn from_row(row: &Row) -> Result<Self> {
        let timestamp = wire::field_or_empty(row, 4)
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        Ok(Self {
            id: wire::parse_id(row, 0, "rule id")?,
            definition: wire::field(row, 1, "rule definition")?.to_string(),
            external_id: wire::field_or_empty(row, 2).to_string(),
            comment: wire::field_or_empty(row, 3).to_string(),
            timestamp,
            active: wire::field_or_empty(row, 5).trim() != "0",
        })
    }
}
