//! Cell and attribute values.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ElementType;

/// A value stored in a cube cell or an attribute.
///
/// The server only knows two kinds: numbers (double precision) and strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Numeric(f64),
    String(String),
}

/// Kind of a [`CellValue`] as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    Numeric,
    String,
}

impl CellType {
    /// `1` is numeric, anything else is string.
    pub fn from_code(code: &str) -> Self {
        if code.trim() == "1" { CellType::Numeric } else { CellType::String }
    }

    pub fn code(self) -> u32 {
        match self {
            CellType::Numeric => 1,
            CellType::String => 2,
        }
    }
}

// ============================================================================
// Type checking
// ============================================================================

impl CellValue {
    pub fn cell_type(&self) -> CellType {
        match self {
            CellValue::Numeric(_) => CellType::Numeric,
            CellValue::String(_) => CellType::String,
        }
    }

    pub fn is_numeric(&self) -> bool { matches!(self, CellValue::Numeric(_)) }
    pub fn is_string(&self) -> bool { matches!(self, CellValue::String(_)) }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Numeric(v) => Some(*v),
            CellValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) => Some(s),
            CellValue::Numeric(_) => None,
        }
    }

    /// The value an empty cell or attribute of the given type reads as.
    pub fn empty_for(element_type: ElementType) -> Self {
        match element_type {
            ElementType::String => CellValue::String(String::new()),
            ElementType::Numeric | ElementType::Consolidated => CellValue::Numeric(0.0),
        }
    }

    /// Builds a value from a raw wire field given its reported type.
    ///
    /// An unparsable numeric field reads as zero; the server sends an empty
    /// field for numeric cells that do not exist.
    pub fn from_wire(cell_type: CellType, raw: &str) -> Self {
        match cell_type {
            CellType::Numeric => CellValue::Numeric(raw.trim().parse().unwrap_or(0.0)),
            CellType::String => CellValue::String(raw.to_owned()),
        }
    }

    /// Wire form used in bulk writes: numbers bare, strings double-quoted.
    pub fn to_wire(&self) -> String {
        match self {
            CellValue::Numeric(v) => format_number(*v),
            CellValue::String(s) => crate::transport::wire::quote(s),
        }
    }
}

/// Formats a number without a trailing `.0` for integral values.
pub(crate) fn format_number(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

// ============================================================================
// Conversions (From impls)
// ============================================================================

impl From<f64> for CellValue { fn from(v: f64) -> Self { CellValue::Numeric(v) } }
impl From<i32> for CellValue { fn from(v: i32) -> Self { CellValue::Numeric(v as f64) } }
impl From<i64> for CellValue { fn from(v: i64) -> Self { CellValue::Numeric(v as f64) } }
impl From<String> for CellValue { fn from(v: String) -> Self { CellValue::String(v) } }
impl From<&str> for CellValue { fn from(v: &str) -> Self { CellValue::String(v.to_owned()) } }

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Numeric(v) => write!(f, "{}", format_number(*v)),
            CellValue::String(s) => write!(f, "{s}"),
        }
    }
}
