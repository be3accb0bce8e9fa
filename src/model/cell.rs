//! Cells, cell paths, areas and the bulk-transfer contexts.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{CellType, CellValue, CellsExportType, ElementId, SplashMode};
use crate::{Error, Result};

/// Element-id coordinates of one cell, one id per cube dimension.
pub type CellPath = SmallVec<[ElementId; 8]>;

/// A cell value together with its coordinates.
///
/// Returned by point reads and bulk exports; never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub path: CellPath,
    pub value: CellValue,
    /// False when the server reported the cell as empty.
    pub exists: bool,
}

impl Cell {
    pub fn new(path: impl IntoIterator<Item = ElementId>, value: impl Into<CellValue>) -> Self {
        Self {
            path: path.into_iter().collect(),
            value: value.into(),
            exists: true,
        }
    }

    pub fn cell_type(&self) -> CellType {
        self.value.cell_type()
    }
}

/// Joins a path into its wire form `id,id,id`.
pub fn path_to_wire(path: &[ElementId]) -> String {
    let mut out = String::with_capacity(path.len() * 4);
    for (i, id) in path.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&id.to_string());
    }
    out
}

/// Parses `id,id,id` into a path.
pub fn path_from_wire(raw: &str) -> Result<CellPath> {
    if raw.trim().is_empty() {
        return Ok(CellPath::new());
    }
    raw.split(',').map(str::parse).collect()
}

// ============================================================================
// Area
// ============================================================================

/// A rectangular region of a cube: one element filter per dimension,
/// `None` meaning every element of that dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    filters: Vec<Option<Vec<ElementId>>>,
}

impl Area {
    /// The whole cube.
    pub fn all(dimensions: usize) -> Self {
        Self { filters: vec![None; dimensions] }
    }

    pub fn new(filters: Vec<Option<Vec<ElementId>>>) -> Self {
        Self { filters }
    }

    /// Restricts dimension `index` to the given elements.
    pub fn with(mut self, index: usize, elements: impl IntoIterator<Item = ElementId>) -> Self {
        if index >= self.filters.len() {
            self.filters.resize(index + 1, None);
        }
        self.filters[index] = Some(elements.into_iter().collect());
        self
    }

    pub fn dimension_count(&self) -> usize {
        self.filters.len()
    }

    pub fn filters(&self) -> &[Option<Vec<ElementId>>] {
        &self.filters
    }

    /// Checks the area against a cube with `dimensions` axes.
    pub fn validate(&self, dimensions: usize) -> Result<()> {
        if self.filters.len() != dimensions {
            return Err(Error::InvalidOperation(format!(
                "Area has {} dimensions, cube has {dimensions}",
                self.filters.len()
            )));
        }
        if let Some(pos) = self.filters.iter().position(|f| matches!(f, Some(ids) if ids.is_empty())) {
            return Err(Error::InvalidOperation(format!(
                "Area filter for dimension {pos} is empty"
            )));
        }
        Ok(())
    }

    /// Wire form: ids joined by `:` per dimension, `*` for all, dimensions joined by `,`.
    pub fn to_wire(&self) -> String {
        self.filters
            .iter()
            .map(|filter| match filter {
                None => "*".to_string(),
                Some(ids) => ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(":"),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn from_wire(raw: &str) -> Result<Self> {
        let filters = raw
            .split(',')
            .map(|part| {
                if part.trim() == "*" {
                    Ok(None)
                } else {
                    part.split(':').map(str::parse).collect::<Result<Vec<_>>>().map(Some)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filters })
    }
}

// ============================================================================
// Bulk contexts
// ============================================================================

/// Options for a paginated cell export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellExportContext {
    pub export_type: CellsExportType,
    /// Rows per page.
    pub block_size: usize,
    pub use_rules: bool,
    pub only_bases: bool,
    pub skip_empty: bool,
}

impl Default for CellExportContext {
    fn default() -> Self {
        Self {
            export_type: CellsExportType::Both,
            block_size: 10_000,
            use_rules: false,
            only_bases: false,
            skip_empty: true,
        }
    }
}

impl CellExportContext {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_rules(mut self, use_rules: bool) -> Self {
        self.use_rules = use_rules;
        self
    }
}

/// Options for a chunked cell load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellLoadContext {
    pub splash: SplashMode,
    /// Cells per request.
    pub block_size: usize,
    /// Add to the existing value instead of replacing it.
    pub add: bool,
    /// Route the write through the server's event processor.
    pub event_processor: bool,
}

impl Default for CellLoadContext {
    fn default() -> Self {
        Self {
            splash: SplashMode::Default,
            block_size: 10_000,
            add: false,
            event_processor: true,
        }
    }
}

impl CellLoadContext {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_splash(mut self, splash: SplashMode) -> Self {
        self.splash = splash;
        self
    }

    pub fn adding(mut self) -> Self {
        self.add = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<ElementId> {
        raw.iter().copied().map(ElementId).collect()
    }

    #[test]
    fn test_area_wire_form() {
        let area = Area::all(3).with(0, ids(&[1, 2])).with(2, ids(&[7]));
        assert_eq!(area.to_wire(), "1:2,*,7");
        assert_eq!(Area::from_wire("1:2,*,7").unwrap(), area);
    }

    #[test]
    fn test_area_validation() {
        assert!(Area::all(2).validate(2).is_ok());
        assert!(matches!(Area::all(2).validate(3), Err(Error::InvalidOperation(_))));
        let empty = Area::all(2).with(1, Vec::new());
        assert!(matches!(empty.validate(2), Err(Error::InvalidOperation(msg)) if msg.contains("dimension 1")));
    }

    #[test]
    fn test_path_wire_form() {
        let path: CellPath = ids(&[3, 0, 12]).into_iter().collect();
        assert_eq!(path_to_wire(&path), "3,0,12");
        assert_eq!(path_from_wire("3,0,12").unwrap(), path);
        assert!(path_from_wire("").unwrap().is_empty());
        assert!(path_from_wire("3,x").is_err());
    }
}
