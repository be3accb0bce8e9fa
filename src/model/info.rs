//! Lightweight info records: what the server reports about an entity without
//! its structure. The cache layer compares their tokens to decide whether a
//! structural rebuild is needed.

use serde::{Deserialize, Serialize};

use super::{CubeId, CubeType, DatabaseId, DatabaseType, DimensionId, DimensionType};
use crate::transport::wire::{self, Row};
use crate::Result;

/// Server release, as reported by `/server/info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub bugfix: u32,
    pub build: u32,
}

impl ServerVersion {
    pub fn new(major: u32, minor: u32, bugfix: u32, build: u32) -> Self {
        Self { major, minor, bugfix, build }
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.bugfix, self.build)
    }
}

/// `major;minor;bugfix;build;encryption;https_port`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: ServerVersion,
    pub encryption: u32,
    pub https_port: Option<u16>,
}

impl ServerInfo {
    pub fn from_row(row: &Row) -> Result<Self> {
        let version = ServerVersion {
            major: wire::parse_u32(row, 0, "server major version")?,
            minor: wire::parse_u32(row, 1, "server minor version")?,
            bugfix: wire::parse_u32(row, 2, "server bugfix version")?,
            build: wire::parse_u32(row, 3, "server build")?,
        };
        let encryption = wire::field_or_empty(row, 4).trim().parse().unwrap_or(0);
        let https_port = wire::field_or_empty(row, 5).trim().parse().ok().filter(|p| *p != 0);
        Ok(Self { version, encryption, https_port })
    }
}

/// `id;name;#dimensions;#cubes;status;type;token`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub id: DatabaseId,
    pub name: String,
    pub dimension_count: u32,
    pub cube_count: u32,
    pub status: u32,
    pub database_type: DatabaseType,
    pub token: u64,
}

impl DatabaseInfo {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: wire::parse_id(row, 0, "database id")?,
            name: wire::field(row, 1, "database name")?.to_string(),
            dimension_count: wire::parse_u32(row, 2, "database dimension count")?,
            cube_count: wire::parse_u32(row, 3, "database cube count")?,
            status: wire::parse_u32(row, 4, "database status")?,
            database_type: DatabaseType::from_code(wire::parse_u32(row, 5, "database type")?)?,
            token: wire::parse_u64(row, 6, "database token")?,
        })
    }
}

/// `id;name;#elements;max_level;max_indent;max_depth;type;attr_dim;attr_cube;rights_cube;token`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionInfo {
    pub id: DimensionId,
    pub name: String,
    pub element_count: u32,
    pub max_level: u32,
    pub max_indent: u32,
    pub max_depth: u32,
    pub dimension_type: DimensionType,
    pub attribute_dimension: Option<DimensionId>,
    pub attribute_cube: Option<CubeId>,
    pub rights_cube: Option<CubeId>,
    pub token: u64,
}

impl DimensionInfo {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: wire::parse_id(row, 0, "dimension id")?,
            name: wire::field(row, 1, "dimension name")?.to_string(),
            element_count: wire::parse_u32(row, 2, "dimension element count")?,
            max_level: wire::parse_u32(row, 3, "dimension max level")?,
            max_indent: wire::parse_u32(row, 4, "dimension max indent")?,
            max_depth: wire::parse_u32(row, 5, "dimension max depth")?,
            dimension_type: DimensionType::from_code(wire::parse_u32(row, 6, "dimension type")?)?,
            attribute_dimension: wire::optional_id(wire::field_or_empty(row, 7))?,
            attribute_cube: wire::optional_id(wire::field_or_empty(row, 8))?,
            rights_cube: wire::optional_id(wire::field_or_empty(row, 9))?,
            token: wire::parse_u64(row, 10, "dimension token")?,
        })
    }

    /// True when this dimension is linked to an attribute dimension and cube.
    pub fn has_attribute_link(&self) -> bool {
        self.attribute_dimension.is_some() && self.attribute_cube.is_some()
    }
}

/// `id;name;#dimensions;dimension_ids;#cells;#filled;status;type;cb_token`
///
/// The cell-change token is not part of the server's row. A `with_token`
/// request gets it appended as a tenth field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeInfo {
    pub id: CubeId,
    pub name: String,
    pub dimensions: Vec<DimensionId>,
    pub cell_count: u64,
    pub filled_cell_count: u64,
    pub status: u32,
    pub cube_type: CubeType,
    /// Bumped by structural changes (rules, conversion).
    pub cb_token: u64,
    /// Bumped by cell-value changes.
    pub cc_token: Option<u64>,
}

impl CubeInfo {
    pub fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: wire::parse_id(row, 0, "cube id")?,
            name: wire::field(row, 1, "cube name")?.to_string(),
            dimensions: wire::id_list(wire::field(row, 3, "cube dimensions")?)?,
            cell_count: wire::parse_count(row, 4, "cube cell count")?,
            filled_cell_count: wire::parse_count(row, 5, "cube filled cell count")?,
            status: wire::parse_u32(row, 6, "cube status")?,
            cube_type: CubeType::from_code(wire::parse_u32(row, 7, "cube type")?)?,
            cb_token: wire::parse_u64(row, 8, "cube token")?,
            cc_token: match wire::field_or_empty(row, 9).trim() {
                "" => None,
                _ => Some(wire::parse_u64(row, 9, "cube cell token")?),
            },
        })
    }

    /// Both tokens, as compared by the cube cache.
    pub fn tokens(&self) -> (u64, Option<u64>) {
        (self.cb_token, self.cc_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[&str]) -> Row {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_server_info() {
        let info = ServerInfo::from_row(&row(&["5", "1", "2", "5400", "0", "0"])).unwrap();
        assert_eq!(info.version, ServerVersion::new(5, 1, 2, 5400));
        assert_eq!(info.https_port, None);
    }

    #[test]
    fn test_dimension_info_without_attribute_link() {
        let info = DimensionInfo::from_row(&row(&[
            "3", "#_Products_", "2", "0", "0", "0", "2", "", "", "", "17",
        ]))
        .unwrap();
        assert_eq!(info.dimension_type, DimensionType::Attribute);
        assert_eq!(info.attribute_dimension, None);
        assert!(!info.has_attribute_link());
        assert_eq!(info.token, 17);
    }

    #[test]
    fn test_dimension_info_minus_one_means_none() {
        let info = DimensionInfo::from_row(&row(&[
            "1", "Products", "3", "1", "1", "1", "0", "-1", "-1", "", "4",
        ]))
        .unwrap();
        assert_eq!(info.attribute_cube, None);
    }

    #[test]
    fn test_cube_info() {
        let info = CubeInfo::from_row(&row(&[
            "0", "Sales", "2", "1,4", "12", "3", "1", "0", "9",
        ]))
        .unwrap();
        assert_eq!(info.dimensions, vec![DimensionId(1), DimensionId(4)]);
        assert_eq!(info.filled_cell_count, 3);
        assert_eq!(info.tokens(), (9, None));

        let info = CubeInfo::from_row(&row(&[
            "0", "Sales", "2", "1,4", "12", "3", "1", "0", "9", "14",
        ]))
        .unwrap();
        assert_eq!(info.tokens(), (9, Some(14)));
    }

    #[test]
    fn test_short_row_is_protocol_error() {
        let err = DatabaseInfo::from_row(&row(&["1", "Demo"])).unwrap_err();
        assert!(err.to_string().contains("database dimension count"));
    }
}
