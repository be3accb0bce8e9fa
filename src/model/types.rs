//! Type tags carried by databases, dimensions, elements and cubes.
//!
//! Every tag maps to the integer code the server uses in its rows.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Database kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    Normal,
    System,
    UserInfo,
}

impl DatabaseType {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::Normal),
            1 => Ok(Self::System),
            3 => Ok(Self::UserInfo),
            other => Err(Error::Protocol(format!("unknown database type {other}"))),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::System => 1,
            Self::UserInfo => 3,
        }
    }
}

/// Dimension kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimensionType {
    Normal,
    System,
    Attribute,
    UserInfo,
    /// Synthetic dimension whose elements are the ids themselves.
    SystemId,
}

impl DimensionType {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::Normal),
            1 => Ok(Self::System),
            2 => Ok(Self::Attribute),
            3 => Ok(Self::UserInfo),
            4 => Ok(Self::SystemId),
            other => Err(Error::Protocol(format!("unknown dimension type {other}"))),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::System => 1,
            Self::Attribute => 2,
            Self::UserInfo => 3,
            Self::SystemId => 4,
        }
    }

    /// Only normal and user-info dimensions may carry attributes.
    pub fn allows_attributes(self) -> bool {
        matches!(self, Self::Normal | Self::UserInfo)
    }
}

/// Element kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Numeric,
    String,
    Consolidated,
}

impl ElementType {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::Numeric),
            2 => Ok(Self::String),
            4 => Ok(Self::Consolidated),
            other => Err(Error::Protocol(format!("unknown element type {other}"))),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Numeric => 1,
            Self::String => 2,
            Self::Consolidated => 4,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            Self::Numeric => "numeric",
            Self::String => "string",
            Self::Consolidated => "consolidated",
        }
    }
}

/// Cube kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CubeType {
    Normal,
    System,
    Attribute,
    UserInfo,
    Gpu,
}

impl CubeType {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::Normal),
            1 => Ok(Self::System),
            2 => Ok(Self::Attribute),
            3 => Ok(Self::UserInfo),
            4 => Ok(Self::Gpu),
            other => Err(Error::Protocol(format!("unknown cube type {other}"))),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::System => 1,
            Self::Attribute => 2,
            Self::UserInfo => 3,
            Self::Gpu => 4,
        }
    }
}

/// Effective right of the session user on one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementPermission {
    None,
    Read,
    Write,
    Delete,
    Splash,
}

impl ElementPermission {
    /// Parses the one-letter permission tag; an empty tag means "not reported".
    pub fn from_tag(tag: &str) -> Result<Option<Self>> {
        match tag {
            "" => Ok(None),
            "N" => Ok(Some(Self::None)),
            "R" => Ok(Some(Self::Read)),
            "W" => Ok(Some(Self::Write)),
            "D" => Ok(Some(Self::Delete)),
            "S" => Ok(Some(Self::Splash)),
            other => Err(Error::Protocol(format!("unknown element permission '{other}'"))),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Read => "R",
            Self::Write => "W",
            Self::Delete => "D",
            Self::Splash => "S",
        }
    }
}

/// How a write to a consolidated cell is spread over its base cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SplashMode {
    /// Writes to consolidated cells are rejected.
    None,
    #[default]
    Default,
    Add,
    Set,
}

impl SplashMode {
    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Default => 1,
            Self::Add => 2,
            Self::Set => 3,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Default),
            2 => Ok(Self::Add),
            3 => Ok(Self::Set),
            other => Err(Error::Protocol(format!("unknown splash mode {other}"))),
        }
    }
}

/// Which value kinds a bulk export returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CellsExportType {
    #[default]
    Both,
    OnlyNumeric,
    OnlyString,
}

impl CellsExportType {
    pub fn code(self) -> u32 {
        match self {
            Self::Both => 0,
            Self::OnlyNumeric => 1,
            Self::OnlyString => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Self::Both),
            1 => Ok(Self::OnlyNumeric),
            2 => Ok(Self::OnlyString),
            other => Err(Error::Protocol(format!("unknown export type {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_permission_by_dimension_type() {
        assert!(DimensionType::Normal.allows_attributes());
        assert!(DimensionType::UserInfo.allows_attributes());
        assert!(!DimensionType::Attribute.allows_attributes());
        assert!(!DimensionType::System.allows_attributes());
        assert!(!DimensionType::SystemId.allows_attributes());
    }

    #[test]
    fn test_unknown_codes_are_protocol_errors() {
        assert!(matches!(ElementType::from_code(3), Err(Error::Protocol(_))));
        assert!(matches!(DatabaseType::from_code(2), Err(Error::Protocol(_))));
        assert!(matches!(ElementPermission::from_tag("X"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_empty_permission_tag() {
        assert_eq!(ElementPermission::from_tag("").unwrap(), None);
        assert_eq!(ElementPermission::from_tag("W").unwrap(), Some(ElementPermission::Write));
    }
}
