//! Chunked cell writes.
//!
//! A load is split into blocks of at most `block_size` cells, one request
//! per block. Blocks are written in order and nothing is rolled back: when
//! block `k` fails, blocks `0..k` are already on the server.

use crate::connection::Session;
use crate::model::cell::path_to_wire;
use crate::model::{CellLoadContext, CellPath, CellValue, CubeId, DatabaseId};
use crate::transport::{ops, Request};
use crate::{Error, Result};

/// Checks the parallel arrays before anything is sent.
fn validate(
    dimension_count: usize,
    paths: &[CellPath],
    values: &[CellValue],
    context: &CellLoadContext,
    locked: &[CellPath],
) -> Result<()> {
    if paths.len() != values.len() {
        return Err(Error::InvalidOperation(format!(
            "{} paths but {} values",
            paths.len(),
            values.len()
        )));
    }
    if context.block_size == 0 {
        return Err(Error::InvalidOperation("Load block size must be positive".into()));
    }
    if let Some((i, path)) = paths.iter().chain(locked).enumerate().find(|(_, p)| p.len() != dimension_count) {
        return Err(Error::InvalidOperation(format!(
            "Path {i} has {} elements, cube has {dimension_count} dimensions",
            path.len()
        )));
    }
    Ok(())
}

fn block_request(
    database: DatabaseId,
    cube: CubeId,
    paths: &[CellPath],
    values: &[CellValue],
    context: &CellLoadContext,
    locked: &str,
) -> Request {
    let request = Request::new(ops::CELL_REPLACE_BULK)
        .param("database", database)
        .param("cube", cube)
        .param("paths", paths.iter().map(|p| path_to_wire(p)).collect::<Vec<_>>().join(":"))
        .param("values", values.iter().map(CellValue::to_wire).collect::<Vec<_>>().join(":"))
        .param("add", u8::from(context.add))
        .param("splash", context.splash.code())
        .param("event_processor", u8::from(context.event_processor));
    if locked.is_empty() {
        request
    } else {
        request.param("locked_paths", locked)
    }
}

/// Writes `values` at `paths`; returns the number of blocks sent.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_cells(
    session: &Session,
    database: DatabaseId,
    cube: CubeId,
    dimension_count: usize,
    paths: &[CellPath],
    values: &[CellValue],
    context: &CellLoadContext,
    locked: &[CellPath],
) -> Result<usize> {
    validate(dimension_count, paths, values, context, locked)?;
    let locked = locked.iter().map(|p| path_to_wire(p)).collect::<Vec<_>>().join(":");

    let mut blocks = 0;
    for (path_block, value_block) in paths.chunks(context.block_size).zip(values.chunks(context.block_size)) {
        let request = block_request(database, cube, path_block, value_block, context, &locked);
        if let Err(e) = session.send(request) {
            if blocks > 0 {
                tracing::warn!(
                    %cube,
                    committed_blocks = blocks,
                    committed_cells = blocks * context.block_size,
                    error = %e,
                    "cell load failed part way; earlier blocks stay written"
                );
            }
            return Err(e);
        }
        blocks += 1;
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::cell::path_from_wire;
    use crate::transport::wire;
    use crate::{Connection, Cube, ElementId, ElementType, MemoryTransport};
    use proptest::prelude::*;

    fn path(ids: &[u32]) -> CellPath {
        ids.iter().copied().map(ElementId).collect()
    }

    fn grid(transport: &MemoryTransport) -> (Connection, Cube) {
        let conn = Connection::open(transport.clone(), Default::default()).unwrap();
        let db = conn.add_database("Demo").unwrap();
        let rows = db.add_dimension("Rows").unwrap();
        let names: Vec<String> = (0..50).map(|i| format!("R{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        rows.add_elements(&refs, &vec![ElementType::Numeric; 50]).unwrap();
        let cols = db.add_dimension("Columns").unwrap();
        cols.add_elements(&["Amount", "Label"], &[ElementType::Numeric, ElementType::String]).unwrap();
        let cube = db.add_cube("Grid", &[rows, cols]).unwrap();
        (conn, cube)
    }

    #[test]
    fn test_validation_happens_before_any_request() {
        let transport = MemoryTransport::new();
        let (_conn, cube) = grid(&transport);
        transport.clear_log();
        let ctx = CellLoadContext::default();
        assert!(matches!(
            cube.load_cells(&[path(&[0, 0])], &[], &ctx, &[]),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            cube.load_cells(&[path(&[0])], &[CellValue::from(1.0)], &ctx, &[]),
            Err(Error::InvalidOperation(msg)) if msg.contains("Path 0")
        ));
        assert!(matches!(
            cube.load_cells(&[path(&[0, 0])], &[CellValue::from(1.0)], &ctx.clone().with_block_size(0), &[]),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(transport.count(ops::CELL_REPLACE_BULK), 0);
    }

    #[test]
    fn test_block_parameters() {
        let transport = MemoryTransport::new();
        let (_conn, cube) = grid(&transport);
        transport.clear_log();
        let ctx = CellLoadContext::default().with_splash(crate::SplashMode::Set).adding();
        cube.load_cells(
            &[path(&[0, 0]), path(&[1, 1])],
            &[CellValue::from(2.5), CellValue::from("a:b")],
            &ctx,
            &[path(&[3, 0])],
        )
        .unwrap();
        let requests = transport.requests_for(ops::CELL_REPLACE_BULK);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].get("paths"), Some("0,0:1,1"));
        assert_eq!(requests[0].get("values"), Some("2.5:\"a:b\""));
        assert_eq!(requests[0].get("add"), Some("1"));
        assert_eq!(requests[0].get("splash"), Some("3"));
        assert_eq!(requests[0].get("locked_paths"), Some("3,0"));
    }

    #[test]
    fn test_partial_failure_keeps_earlier_blocks() {
        let transport = MemoryTransport::new();
        let (_conn, cube) = grid(&transport);
        let paths: Vec<CellPath> = (0..4).map(|i| path(&[i, 0])).collect();
        let values: Vec<CellValue> = (0..4).map(|i| CellValue::from(i as f64 + 1.0)).collect();
        transport.fail_after(ops::CELL_REPLACE_BULK, 1, "disk full");
        let err = cube
            .load_cells(&paths, &values, &CellLoadContext::default().with_block_size(2), &[])
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(cube.number_of_filled_cells().unwrap(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_blocks_cover_input_in_order(m in 0usize..60, block in 1usize..12) {
            let transport = MemoryTransport::new();
            let (_conn, cube) = grid(&transport);
            let paths: Vec<CellPath> = (0..m as u32).map(|i| path(&[i % 50, i / 50])).collect();
            let values: Vec<CellValue> = (0..m).map(|i| CellValue::from(i as f64)).collect();
            transport.clear_log();
            cube.load_cells(&paths, &values, &CellLoadContext::default().with_block_size(block), &[]).unwrap();

            let requests = transport.requests_for(ops::CELL_REPLACE_BULK);
            prop_assert_eq!(requests.len(), m.div_ceil(block));
            let mut sent_paths = Vec::new();
            let mut sent_values = Vec::new();
            for request in &requests {
                let block_paths: Vec<CellPath> = request
                    .get("paths")
                    .unwrap()
                    .split(':')
                    .map(|p| path_from_wire(p).unwrap())
                    .collect();
                prop_assert!(block_paths.len() <= block);
                sent_paths.extend(block_paths);
                sent_values.extend(wire::split_quoted(request.get("values").unwrap(), ':'));
            }
            prop_assert_eq!(sent_paths, paths);
            let expected: Vec<String> = values.iter().map(CellValue::to_wire).collect();
            prop_assert_eq!(sent_values, expected);
        }
    }
}
