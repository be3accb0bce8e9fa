//! # OLAP Model
//!
//! Plain values that cross every boundary: transport ↔ cache ↔ caller.
//!
//! Design rule: this module is pure data. It does no I/O and holds no locks or handles.
//! Live objects (`Database`, `Dimension`, `Element`, `Cube`) live in their
//! own modules and are built from these records.

pub mod ids;
pub mod types;
pub mod value;
pub mod cell;
pub mod info;
pub mod rule;
pub mod consolidation;

pub use ids::{CubeId, DatabaseId, DimensionId, ElementId, LockId, RuleId};
pub use types::{
    CellsExportType, CubeType, DatabaseType, DimensionType, ElementPermission, ElementType,
    SplashMode,
};
pub use value::{CellType, CellValue};
pub use cell::{Area, Cell, CellExportContext, CellLoadContext, CellPath};
pub use info::{CubeInfo, DatabaseInfo, DimensionInfo, ServerInfo, ServerVersion};
pub use rule::Rule;
pub use consolidation::Consolidation;
