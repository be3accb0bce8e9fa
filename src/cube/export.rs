//! Paginated cell export.
//!
//! The server answers an export request with up to `block_size` data rows
//! followed by a progress row `processed;total`. While the ratio is below
//! one, the next page is requested with the path of the last delivered cell
//! as the continuation point. There is no server-side cursor: the exporter
//! can only move forward, and a new scan starts from the first page.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::connection::Session;
use crate::model::cell::{path_from_wire, path_to_wire, Area};
use crate::model::{Cell, CellExportContext, CellPath, CubeId, DatabaseId};
use crate::transport::{ops, wire, Request, Row};
use crate::{Error, Result};

use super::value_from_row;

/// A lazy, single-pass sequence of cells.
///
/// Memory use is bounded by one page. After an error the exporter is
/// exhausted.
pub struct CellsExporter {
    session: Arc<Session>,
    database: DatabaseId,
    cube: CubeId,
    area: String,
    context: CellExportContext,
    buffer: VecDeque<Cell>,
    last_path: Option<CellPath>,
    finished: bool,
    pages: usize,
}

impl CellsExporter {
    /// Requests the first page.
    pub(crate) fn new(
        session: Arc<Session>,
        database: DatabaseId,
        cube: CubeId,
        area: &Area,
        context: CellExportContext,
    ) -> Result<Self> {
        if context.block_size == 0 {
            return Err(Error::InvalidOperation("Export block size must be positive".into()));
        }
        let mut exporter = Self {
            session,
            database,
            cube,
            area: area.to_wire(),
            context,
            buffer: VecDeque::new(),
            last_path: None,
            finished: false,
            pages: 0,
        };
        exporter.fetch_page()?;
        Ok(exporter)
    }

    /// Number of page requests sent so far.
    pub fn pages_requested(&self) -> usize {
        self.pages
    }

    fn page_request(&self) -> Request {
        let request = Request::new(ops::CELL_EXPORT)
            .param("database", self.database)
            .param("cube", self.cube)
            .param("area", &self.area)
            .param("blocksize", self.context.block_size)
            .param("type", self.context.export_type.code())
            .param("use_rules", u8::from(self.context.use_rules))
            .param("base_only", u8::from(self.context.only_bases))
            .param("skip_empty", u8::from(self.context.skip_empty));
        match &self.last_path {
            Some(path) => request.param("path", path_to_wire(path)),
            None => request,
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let rows = self.session.send(self.page_request())?;
        self.pages += 1;

        let mut progress = None;
        let mut delivered = 0;
        for row in &rows {
            if row.len() == 2 {
                progress = Some(progress_ratio(row)?);
            } else {
                self.buffer.push_back(cell_from_row(row)?);
                delivered += 1;
            }
        }

        let ratio = progress.ok_or_else(|| {
            Error::Protocol(format!("export page {} of cube {} has no progress row", self.pages, self.cube))
        })?;
        if ratio >= 1.0 {
            self.finished = true;
        } else if delivered == 0 {
            return Err(Error::Protocol(format!(
                "export of cube {} stalled at {:.0}% without delivering cells",
                self.cube,
                ratio * 100.0
            )));
        }
        tracing::trace!(cube = %self.cube, page = self.pages, delivered, ratio, "export page");
        Ok(())
    }
}

/// `processed;total`; an empty export reports `0;0`.
fn progress_ratio(row: &Row) -> Result<f64> {
    let processed = wire::parse_f64(row, 0, "export processed count")?;
    let total = wire::parse_f64(row, 1, "export total count")?;
    Ok(if total <= 0.0 { 1.0 } else { processed / total })
}

/// `type;exists;value;path`
fn cell_from_row(row: &Row) -> Result<Cell> {
    let (value, exists) = value_from_row(row)?;
    let path = path_from_wire(wire::field(row, 3, "cell path")?)?;
    Ok(Cell { path, value, exists })
}

impl Iterator for CellsExporter {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cell) = self.buffer.pop_front() {
                self.last_path = Some(cell.path.clone());
                return Some(Ok(cell));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

impl std::fmt::Debug for CellsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellsExporter")
            .field("cube", &self.cube)
            .field("area", &self.area)
            .field("pages", &self.pages)
            .field("finished", &self.finished)
            .finish()
    }
}
