//! End-to-end tests for cell access: point reads, chunked loads, paged
//! exports, clearing, locks and rules.

use std::collections::BTreeMap;

use molap_rs::transport::{codes, ops};
use molap_rs::{
    Area, Cell, CellExportContext, CellLoadContext, CellPath, CellValue, CellsExportType, ClientConfig,
    Connection, Cube, Dimension, ElementType, Error, MemoryTransport, ServerVersion, SplashMode,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

// ============================================================================
// Helper: "Sales" over Products (Total = Bikes + Cars) x Regions
// (North, South and the string element Note).
// ============================================================================

fn sales(transport: &MemoryTransport) -> (Connection, Dimension, Dimension, Cube) {
    let conn = Connection::open(transport.clone(), ClientConfig::default()).unwrap();
    let db = conn.add_database("Demo").unwrap();
    let products = db.add_dimension("Products").unwrap();
    products.add_elements(&["Total", "Bikes", "Cars"], &[ElementType::Numeric; 3]).unwrap();
    let [total, bikes, cars] = ["Total", "Bikes", "Cars"].map(|n| products.element_by_name(n, false).unwrap().unwrap());
    products
        .update_consolidations(&[
            products.new_consolidation(&total, &bikes, 1.0).unwrap(),
            products.new_consolidation(&total, &cars, 1.0).unwrap(),
        ])
        .unwrap();
    let regions = db.add_dimension("Regions").unwrap();
    regions
        .add_elements(&["North", "South", "Note"], &[ElementType::Numeric, ElementType::Numeric, ElementType::String])
        .unwrap();
    let cube = db.add_cube("Sales", &[products.clone(), regions.clone()]).unwrap();
    (conn, products, regions, cube)
}

fn write(cube: &Cube, cells: &[(&str, &str, CellValue)]) {
    let paths: Vec<CellPath> = cells.iter().map(|(p, r, _)| cube.cell_path(&[*p, *r]).unwrap()).collect();
    let values: Vec<CellValue> = cells.iter().map(|(_, _, v)| v.clone()).collect();
    cube.load_cells(&paths, &values, &CellLoadContext::default(), &[]).unwrap();
}

fn export_all(cube: &Cube, context: CellExportContext) -> Vec<Cell> {
    let dimensions = cube.dimension_ids().len();
    cube.cells_exporter(&Area::all(dimensions), context)
        .unwrap()
        .collect::<molap_rs::Result<_>>()
        .unwrap()
}

// ============================================================================
// 1. Point reads
// ============================================================================

#[test]
fn test_point_read_by_elements_and_names() {
    let transport = MemoryTransport::new();
    let (_conn, products, regions, cube) = sales(&transport);
    write(&cube, &[("Bikes", "North", CellValue::from(10.0)), ("Bikes", "Note", CellValue::from("Red"))]);

    let bikes = products.element_by_name("Bikes", false).unwrap().unwrap();
    let north = regions.element_by_name("North", false).unwrap().unwrap();
    let cell = cube.cell(&[bikes.clone(), north]).unwrap();
    assert_eq!(cell.value, CellValue::from(10.0));
    assert!(cell.exists);

    let note = cube.cell_at(&cube.cell_path(&["Bikes", "Note"]).unwrap()).unwrap();
    assert_eq!(note.value, CellValue::from("Red"));

    let empty = cube.cell_at(&cube.cell_path(&["Cars", "Note"]).unwrap()).unwrap();
    assert!(!empty.exists);
    assert_eq!(empty.value, CellValue::from(""));
}

#[test]
fn test_point_read_rejects_swapped_elements() {
    let transport = MemoryTransport::new();
    let (_conn, products, regions, cube) = sales(&transport);
    let bikes = products.element_by_name("Bikes", false).unwrap().unwrap();
    let north = regions.element_by_name("North", false).unwrap().unwrap();
    transport.clear_log();
    assert!(matches!(cube.cell(&[north, bikes]), Err(Error::NotFound(_))));
    assert!(matches!(cube.cell_at(&[]), Err(Error::InvalidOperation(_))));
    assert_eq!(transport.count(ops::CELL_VALUE), 0);
}

// ============================================================================
// 2. Load modes
// ============================================================================

#[test]
fn test_adding_load_accumulates() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    let path = cube.cell_path(&["Cars", "South"]).unwrap();
    cube.load_cells(&[path.clone()], &[CellValue::from(10.0)], &CellLoadContext::default(), &[])
        .unwrap();
    cube.load_cells(&[path.clone()], &[CellValue::from(5.0)], &CellLoadContext::default().adding(), &[])
        .unwrap();
    assert_eq!(cube.cell_at(&path).unwrap().value, CellValue::from(15.0));
}

#[test]
fn test_consolidated_write_without_splashing_is_refused() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    let total = cube.cell_path(&["Total", "North"]).unwrap();
    let context = CellLoadContext::default().with_splash(SplashMode::None);
    let err = cube.load_cells(&[total], &[CellValue::from(1.0)], &context, &[]).unwrap_err();
    assert_eq!(err.code(), Some(codes::SPLASH_DISABLED));
    assert_eq!(cube.number_of_filled_cells().unwrap(), 0);
}

#[test]
fn test_interrupted_load_can_be_resumed() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    let paths: Vec<CellPath> = [["Bikes", "North"], ["Bikes", "South"], ["Cars", "North"], ["Cars", "South"]]
        .iter()
        .map(|p| cube.cell_path(p).unwrap())
        .collect();
    let values: Vec<CellValue> = (1..=4).map(|v| CellValue::from(v as f64)).collect();
    let context = CellLoadContext::default().with_block_size(2);

    transport.fail_after(ops::CELL_REPLACE_BULK, 1, "connection reset");
    assert!(matches!(cube.load_cells(&paths, &values, &context, &[]), Err(Error::Transport(_))));
    assert_eq!(cube.number_of_filled_cells().unwrap(), 2);

    cube.load_cells(&paths[2..], &values[2..], &context, &[]).unwrap();
    let exported: Vec<CellValue> = export_all(&cube, CellExportContext::default()).into_iter().map(|c| c.value).collect();
    assert_eq!(exported, values);
}

// ============================================================================
// 3. Exports
// ============================================================================

#[test]
fn test_export_filters_by_type_and_area() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    write(
        &cube,
        &[
            ("Bikes", "North", CellValue::from(10.0)),
            ("Cars", "South", CellValue::from(20.0)),
            ("Bikes", "Note", CellValue::from("Red")),
        ],
    );

    let strings = export_all(
        &cube,
        CellExportContext { export_type: CellsExportType::OnlyString, ..CellExportContext::default() },
    );
    assert_eq!(strings.len(), 1);
    assert_eq!(strings[0].value, CellValue::from("Red"));

    let numbers = export_all(
        &cube,
        CellExportContext { export_type: CellsExportType::OnlyNumeric, ..CellExportContext::default() },
    );
    assert_eq!(numbers.len(), 2);

    let north = cube.cell_path(&["Bikes", "North"]).unwrap()[1];
    let area = Area::all(2).with(1, [north]);
    let cells: Vec<Cell> = cube
        .cells_exporter(&area, CellExportContext::default())
        .unwrap()
        .collect::<molap_rs::Result<_>>()
        .unwrap();
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].value, CellValue::from(10.0));
}

#[test]
fn test_export_pages_follow_block_size() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    write(
        &cube,
        &[
            ("Bikes", "North", CellValue::from(1.0)),
            ("Bikes", "South", CellValue::from(2.0)),
            ("Cars", "North", CellValue::from(3.0)),
        ],
    );

    let mut exporter = cube.cells_exporter(&Area::all(2), CellExportContext::default().with_block_size(1)).unwrap();
    assert_eq!(exporter.pages_requested(), 1);
    assert_eq!(exporter.by_ref().count(), 3);
    assert_eq!(exporter.pages_requested(), 3);

    let mut single = cube.cells_exporter(&Area::all(2), CellExportContext::default()).unwrap();
    assert_eq!(single.by_ref().count(), 3);
    assert_eq!(single.pages_requested(), 1);
}

#[test]
fn test_export_area_must_match_cube() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    transport.clear_log();
    assert!(cube.cells_exporter(&Area::all(3), CellExportContext::default()).is_err());
    assert!(matches!(
        cube.cells_exporter(&Area::all(2), CellExportContext::default().with_block_size(0)),
        Err(Error::InvalidOperation(_))
    ));
    assert_eq!(transport.count(ops::CELL_EXPORT), 0);
}

// ============================================================================
// 4. Clearing and locks
// ============================================================================

#[test]
fn test_clear_one_column_then_everything() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    write(
        &cube,
        &[
            ("Bikes", "North", CellValue::from(1.0)),
            ("Bikes", "Note", CellValue::from("Red")),
            ("Cars", "Note", CellValue::from("Blue")),
        ],
    );

    let note = cube.cell_path(&["Bikes", "Note"]).unwrap()[1];
    cube.clear_cells(&Area::all(2).with(1, [note])).unwrap();
    assert_eq!(cube.number_of_filled_cells().unwrap(), 1);

    cube.clear().unwrap();
    assert!(export_all(&cube, CellExportContext::default()).is_empty());
}

#[test]
fn test_area_lock_commits_once() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    let bikes = cube.cell_path(&["Bikes", "North"]).unwrap()[0];
    let lock = cube.lock_area(&Area::all(2).with(0, [bikes])).unwrap();
    assert_eq!(transport.requests_for(ops::CUBE_LOCK)[0].get("area"), Some(format!("{bikes},*").as_str()));

    cube.commit_lock(lock).unwrap();
    assert_eq!(cube.commit_lock(lock).unwrap_err().code(), Some(codes::CUBE_LOCK_NOT_FOUND));
}

// ============================================================================
// 5. Rules and server capabilities
// ============================================================================

#[test]
fn test_rule_changes_move_the_structure_token() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    let cb = cube.cb_token().unwrap();
    let cc = cube.cc_token().unwrap();
    cube.add_rule("['North'] = 1", true, "", "").unwrap();
    assert_ne!(cube.cb_token().unwrap(), cb);
    assert_eq!(cube.cc_token().unwrap(), cc);
}

#[test]
fn test_invalid_rule_definition() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    assert_eq!(cube.parse_rule("nothing to assign").unwrap_err().code(), Some(codes::PARSING_RULE));
    assert_eq!(cube.add_rule("nothing to assign", true, "", "").unwrap_err().code(), Some(codes::PARSING_RULE));
    assert!(cube.rules().unwrap().is_empty());
}

#[test]
fn test_rule_removal_by_server_version() {
    for (version, calls) in [(ServerVersion::new(6, 0, 0, 1200), 1), (ServerVersion::new(5, 0, 0, 4000), 2)] {
        let transport = MemoryTransport::new().with_version(version);
        let (_conn, _products, _regions, cube) = sales(&transport);
        cube.add_rule("['North'] = 1", true, "", "").unwrap();
        cube.add_rule("['South'] = 2", true, "", "").unwrap();
        let rules = cube.rules().unwrap();

        transport.clear_log();
        cube.remove_rules(&rules).unwrap();
        assert_eq!(transport.count(ops::RULE_DESTROY), calls, "server {version:?}");
        assert!(cube.rules().unwrap().is_empty());
    }
}

#[test]
fn test_bulk_rule_call_lists_every_id() {
    let transport = MemoryTransport::new();
    let (_conn, _products, _regions, cube) = sales(&transport);
    cube.add_rule("['North'] = 1", false, "", "").unwrap();
    cube.add_rule("['South'] = 2", false, "", "").unwrap();
    let rules = cube.rules().unwrap();
    transport.clear_log();
    cube.activate_rules(&rules).unwrap();

    let calls = transport.requests_for(ops::RULE_MODIFY);
    assert_eq!(calls[0].get("rule"), Some(format!("{},{}", rules[0].id, rules[1].id).as_str()));
    assert_eq!(calls[0].get("activate"), Some("1"));
}

// ============================================================================
// 6. Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// An export returns exactly the numeric cells that were loaded,
    /// whatever the page size.
    #[test]
    fn prop_export_matches_load(
        writes in proptest::collection::btree_map(0usize..4, 1u32..1000, 0..=4),
        page in 1usize..4,
    ) {
        let transport = MemoryTransport::new();
        let (_conn, _products, _regions, cube) = sales(&transport);
        let grid = [["Bikes", "North"], ["Bikes", "South"], ["Cars", "North"], ["Cars", "South"]];

        let mut expected = BTreeMap::new();
        let mut paths = Vec::new();
        let mut values = Vec::new();
        for (slot, value) in &writes {
            let path = cube.cell_path(&grid[*slot]).unwrap();
            expected.insert(path.iter().map(|e| e.0).collect::<Vec<u32>>(), CellValue::from(f64::from(*value)));
            paths.push(path);
            values.push(CellValue::from(f64::from(*value)));
        }
        cube.load_cells(&paths, &values, &CellLoadContext::default(), &[]).unwrap();

        let exported: BTreeMap<Vec<u32>, CellValue> = export_all(&cube, CellExportContext::default().with_block_size(page))
            .into_iter()
            .map(|c| (c.path.iter().map(|e| e.0).collect(), c.value))
            .collect();
        prop_assert_eq!(exported, expected);
    }
}
