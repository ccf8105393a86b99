//! End-to-end table scenarios.

use std::time::Duration;
use tempfile::tempdir;

use super::column_set::{ColumnBinding, SmBinding};
use super::schema::{ColumnDesc, TableDesc};
use super::table::{CreateOptions, EndianChoice, LockMode, OpenMode, Table};
use crate::data::{Complex32, Complex64, DataType, Shape, Slicer, Value};
use crate::io::LockKind;
use crate::sm::SmType;
use crate::TableError;

fn all_scalar_types() -> Vec<(&'static str, DataType)> {
    vec![
        ("bool_c", DataType::Bool),
        ("u8_c", DataType::U8),
        ("i16_c", DataType::I16),
        ("i32_c", DataType::I32),
        ("i64_c", DataType::I64),
        ("f32_c", DataType::F32),
        ("f64_c", DataType::F64),
        ("c32_c", DataType::Complex32),
        ("c64_c", DataType::Complex64),
        ("str_c", DataType::Str),
    ]
}

fn row_values(i: u64) -> Vec<(&'static str, Value)> {
    vec![
        ("bool_c", Value::Bool(i % 2 == 0)),
        ("u8_c", Value::U8(10 + i as u8)),
        ("i16_c", Value::I16(i as i16 - 2)),
        ("i32_c", Value::I32(100 * i as i32)),
        ("i64_c", Value::I64(1_000_000_000 * i as i64)),
        ("f32_c", Value::F32(1.5 * i as f32)),
        ("f64_c", Value::F64(2.5 * i as f64)),
        ("c32_c", Value::C32(Complex32::new(i as f32, i as f32 + 1.0))),
        ("c64_c", Value::C64(Complex64::new(3.0 * i as f64, 4.0 * i as f64))),
        ("str_c", Value::Str(format!("row_{i}"))),
    ]
}

fn standard_table(dir: &std::path::Path, nrow: u64, endian: EndianChoice) -> Table {
    let mut desc = TableDesc::new();
    for (name, dtype) in all_scalar_types() {
        desc.add_column(ColumnDesc::scalar(name, dtype)).unwrap();
    }
    let cols: Vec<&str> = all_scalar_types().iter().map(|(n, _)| *n).collect();
    let bindings = vec![SmBinding::new(
        "SSM",
        SmType::Standard,
        serde_json::json!({"bucket_size": 4096}),
        &cols,
    )];
    let options = CreateOptions { endian, ..CreateOptions::default() };
    Table::create(dir, desc, bindings, nrow, &options).unwrap()
}

#[test]
fn test_standard_all_types_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_ssm");
    {
        let table = standard_table(&path, 5, EndianChoice::Native);
        for i in 0..5u64 {
            for (col, v) in row_values(i) {
                table.put_cell(col, i, &v).unwrap();
            }
        }
        table.flush(true, false).unwrap();
    }
    // Reopen read-only; every read matches what was written.
    let table = Table::open(&path, OpenMode::Old, LockMode::Auto).unwrap();
    assert!(!table.is_writable().unwrap());
    assert_eq!(table.row_count().unwrap(), 5);
    for i in 0..5u64 {
        for (col, want) in row_values(i) {
            assert_eq!(table.get_cell(col, i).unwrap(), want, "column {col} row {i}");
        }
    }
    // Writes on the read-only handle are refused.
    assert!(matches!(
        table.put_cell("i32_c", 0, &Value::I32(1)),
        Err(TableError::ReadOnly(_))
    ));
}

#[test]
fn test_endianness_independence() {
    let dir = tempdir().unwrap();
    let big = dir.path().join("t_big");
    let little = dir.path().join("t_little");
    for (path, endian) in [(&big, EndianChoice::Big), (&little, EndianChoice::Little)] {
        let table = standard_table(path, 5, endian);
        for i in 0..5u64 {
            for (col, v) in row_values(i) {
                table.put_cell(col, i, &v).unwrap();
            }
        }
        table.flush(true, false).unwrap();
    }
    let tb = Table::open(&big, OpenMode::Old, LockMode::Auto).unwrap();
    let tl = Table::open(&little, OpenMode::Old, LockMode::Auto).unwrap();
    assert_ne!(tb.endianness().unwrap(), tl.endianness().unwrap());
    for i in 0..5u64 {
        for (col, _) in all_scalar_types() {
            assert_eq!(
                tb.get_cell(col, i).unwrap(),
                tl.get_cell(col, i).unwrap(),
                "column {col} row {i}"
            );
        }
    }
}

#[test]
fn test_widening_promotion() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_promo");
    let table = standard_table(&path, 3, EndianChoice::Native);
    table.put_cell("i16_c", 1, &Value::I16(-300)).unwrap();
    table.put_cell("u8_c", 1, &Value::U8(200)).unwrap();
    table.put_cell("i32_c", 1, &Value::I32(123_456)).unwrap();
    table.put_cell("i64_c", 1, &Value::I64(5_000_000)).unwrap();
    table.put_cell("f32_c", 1, &Value::F32(0.5)).unwrap();
    table.put_cell("f64_c", 1, &Value::F64(-2.25)).unwrap();

    // Integer columns read into wider integers and into floats of any
    // width, fractional loss included.
    assert_eq!(
        table.get_cell_as("i16_c", 1, DataType::I32).unwrap(),
        Value::I32(-300)
    );
    assert_eq!(
        table.get_cell_as("i16_c", 1, DataType::F64).unwrap(),
        Value::F64(-300.0)
    );
    assert_eq!(
        table.get_cell_as("u8_c", 1, DataType::I64).unwrap(),
        Value::I64(200)
    );
    assert_eq!(
        table.get_cell_as("i32_c", 1, DataType::F32).unwrap(),
        Value::F32(123_456.0)
    );
    assert_eq!(
        table.get_cell_as("i64_c", 1, DataType::F32).unwrap(),
        Value::F32(5_000_000.0)
    );
    // Integer and real columns read into complex of any width with a
    // zero imaginary part.
    assert_eq!(
        table.get_cell_as("i64_c", 1, DataType::Complex32).unwrap(),
        Value::C32(Complex32::new(5_000_000.0, 0.0))
    );
    assert_eq!(
        table.get_cell_as("f64_c", 1, DataType::Complex32).unwrap(),
        Value::C32(Complex32::new(-2.25, 0.0))
    );
    assert_eq!(
        table.get_cell_as("f32_c", 1, DataType::Complex64).unwrap(),
        Value::C64(Complex64::new(0.5, 0.0))
    );
    // Narrowing and non-numeric promotions fail.
    assert!(matches!(
        table.get_cell_as("i64_c", 1, DataType::I32),
        Err(TableError::TypeMismatch(_))
    ));
    assert!(matches!(
        table.get_cell_as("f64_c", 1, DataType::F32),
        Err(TableError::TypeMismatch(_))
    ));
    assert!(matches!(
        table.get_cell_as("str_c", 1, DataType::F64),
        Err(TableError::TypeMismatch(_))
    ));
}

fn ism_table(path: &std::path::Path, nrow: u64, bucket_size: u32) -> Table {
    let mut desc = TableDesc::new();
    desc.add_column(ColumnDesc::scalar("val", DataType::I32)).unwrap();
    let bindings = vec![SmBinding::new(
        "ISM",
        SmType::Incremental,
        serde_json::json!({"bucket_size": bucket_size}),
        &["val"],
    )];
    Table::create(path, desc, bindings, nrow, &CreateOptions::default()).unwrap()
}

#[test]
fn test_incremental_equal_neighbor_collapse() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_ism_collapse");
    {
        let table = ism_table(&path, 30, 256);
        for i in 0..30u64 {
            let v = if i % 2 == 0 { 100 } else { 200 };
            table.put_cell("val", i, &Value::I32(v)).unwrap();
        }
        table.put_cell("val", 1, &Value::I32(100)).unwrap();
        table.put_cell("val", 5, &Value::I32(100)).unwrap();
        table.put_cell("val", 9, &Value::I32(100)).unwrap();
        table.flush(true, false).unwrap();
    }
    let table = Table::open(&path, OpenMode::Old, LockMode::Auto).unwrap();
    let got = table.get_column_range("val", 0, 30).unwrap();
    for (i, v) in got.iter().enumerate() {
        let expected = if i == 1 || i == 5 || i == 9 || i % 2 == 0 {
            100
        } else {
            200
        };
        assert_eq!(*v, Value::I32(expected), "row {i}");
    }
    // The leading run collapsed into one interval: 100,100,100,200,...
    assert_eq!(&got[..4], &[
        Value::I32(100),
        Value::I32(100),
        Value::I32(100),
        Value::I32(200)
    ]);
}

#[test]
fn test_incremental_bucket_split() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_ism_split");
    {
        let table = ism_table(&path, 100, 128);
        for i in 0..100u64 {
            table.put_cell("val", i, &Value::I32((7 * i + 3) as i32)).unwrap();
        }
        for i in 0..100u64 {
            assert_eq!(
                table.get_cell("val", i).unwrap(),
                Value::I32((7 * i + 3) as i32)
            );
        }
        table.flush(true, false).unwrap();
    }
    // Reopen and reverify, then rewrite an interior row.
    let table = Table::open(&path, OpenMode::Update, LockMode::Auto).unwrap();
    for i in 0..100u64 {
        assert_eq!(
            table.get_cell("val", i).unwrap(),
            Value::I32((7 * i + 3) as i32)
        );
    }
    table.put_cell("val", 50, &Value::I32(999)).unwrap();
    assert_eq!(table.get_cell("val", 50).unwrap(), Value::I32(999));
    assert_eq!(table.get_cell("val", 49).unwrap(), Value::I32(346));
    assert_eq!(table.get_cell("val", 51).unwrap(), Value::I32(360));
}

#[test]
fn test_tiled_column_slice() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_tsm");
    let cell = Shape::new(vec![15, 21]);
    {
        let mut desc = TableDesc::new();
        desc.add_column(ColumnDesc::array_fixed("data", DataType::I32, cell.clone()))
            .unwrap();
        let bindings = vec![SmBinding::new(
            "TSM",
            SmType::TiledColumn,
            serde_json::json!({"tile_shape": [4, 5]}),
            &["data"],
        )];
        let table =
            Table::create(&path, desc, bindings, 10, &CreateOptions::default()).unwrap();
        for i in 0..10u64 {
            let data: Vec<Value> = (0..cell.product())
                .map(|k| Value::I32((1000 * i + k) as i32))
                .collect();
            table.put_array_cell("data", i, &cell, &data).unwrap();
        }
        table.flush(true, false).unwrap();
    }
    let table = Table::open(&path, OpenMode::Old, LockMode::Auto).unwrap();
    let slicer = Slicer::new(vec![2, 3], vec![10, 15]);
    for i in 0..10u64 {
        let out = table.get_slice("data", i, &slicer).unwrap();
        let mut k = 0;
        for f in 0..15u64 {
            for c in 0..10u64 {
                let expected = (1000 * i + (c + 2) + (f + 3) * 15) as i32;
                assert_eq!(out[k], Value::I32(expected), "row {i} c {c} f {f}");
                k += 1;
            }
        }
    }
    // Values are identical after a cache clear; only statistics reset.
    let before = table.get_array_cell("data", 4).unwrap();
    table.clear_tile_caches("data").unwrap();
    let after = table.get_array_cell("data", 4).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_coordinator_column_lifecycle() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_colset");
    let mut desc = TableDesc::new();
    desc.add_column(ColumnDesc::scalar("A", DataType::I32)).unwrap();
    desc.add_column(ColumnDesc::scalar("B", DataType::F64)).unwrap();
    desc.add_column(ColumnDesc::scalar("C", DataType::I32)).unwrap();
    let bindings = vec![
        SmBinding::new("SSM_Shared", SmType::Standard, serde_json::json!({}), &["A", "B"]),
        SmBinding::new("ISM_Solo", SmType::Incremental, serde_json::json!({}), &["C"]),
    ];
    let table = Table::create(&path, desc, bindings, 4, &CreateOptions::default()).unwrap();
    for i in 0..4u64 {
        table.put_cell("A", i, &Value::I32(i as i32)).unwrap();
        table.put_cell("B", i, &Value::F64(i as f64 * 0.5)).unwrap();
        table.put_cell("C", i, &Value::I32(7)).unwrap();
    }

    // Removing A leaves SSM_Shared serving B alone.
    table.remove_column("A").unwrap();
    let info = table.data_manager_info().unwrap();
    let shared = info
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == "SSM_Shared")
        .unwrap();
    assert_eq!(shared["columns"], serde_json::json!(["B"]));
    assert!(matches!(
        table.get_cell("A", 0),
        Err(TableError::ColumnNotFound(_))
    ));
    for i in 0..4u64 {
        assert_eq!(table.get_cell("B", i).unwrap(), Value::F64(i as f64 * 0.5));
    }

    // Removing C (the sole tenant) destroys the whole instance.
    table.remove_column("C").unwrap();
    let info = table.data_manager_info().unwrap();
    assert!(info
        .as_array()
        .unwrap()
        .iter()
        .all(|m| m["name"] != "ISM_Solo"));

    // Rename B: reads follow the new name, the old one is gone.
    table.rename_column("B", "BB").unwrap();
    for i in 0..4u64 {
        assert_eq!(table.get_cell("BB", i).unwrap(), Value::F64(i as f64 * 0.5));
    }
    assert!(matches!(
        table.get_cell("B", 0),
        Err(TableError::ColumnNotFound(_))
    ));
}

#[test]
fn test_unique_manager_names() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_names");
    let mut desc = TableDesc::new();
    desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
    let table = Table::create(
        &path,
        desc,
        vec![SmBinding::new("SSM", SmType::Standard, serde_json::json!({}), &["a"])],
        2,
        &CreateOptions::default(),
    )
    .unwrap();

    // A second standard manager of the same requested base name gets a
    // suffixed unique name.
    table
        .add_column(
            ColumnDesc::scalar("b", DataType::I32),
            ColumnBinding::NewManager {
                sm_type: SmType::Incremental,
                name: "SSM_2".to_string(),
                spec: serde_json::json!({}),
            },
        )
        .unwrap();
    // Explicit duplicate is refused.
    let err = table.add_column(
        ColumnDesc::scalar("c", DataType::I32),
        ColumnBinding::NewManager {
            sm_type: SmType::Standard,
            name: "SSM".to_string(),
            spec: serde_json::json!({}),
        },
    );
    assert!(matches!(err, Err(TableError::Duplicate(_))));

    // Type routing creates a fresh incremental manager only when the
    // existing one cannot take more columns.
    table
        .add_column(
            ColumnDesc::scalar("c", DataType::I32),
            ColumnBinding::ToType(SmType::Incremental, serde_json::json!({})),
        )
        .unwrap();
    let info = table.data_manager_info().unwrap();
    let names: Vec<String> = info
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"SSM".to_string()));
    assert!(names.contains(&"SSM_2".to_string()));
    // The incremental manager cannot extend, so the type routing made
    // a new instance named after the type.
    assert!(names.iter().any(|n| n.starts_with("incremental")));
}

#[test]
fn test_add_remove_rows_through_table() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_rows");
    let mut desc = TableDesc::new();
    desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
    desc.add_column(ColumnDesc::scalar("b", DataType::Str)).unwrap();
    let table =
        Table::create(&path, desc, Vec::new(), 3, &CreateOptions::default()).unwrap();
    assert_eq!(table.row_count().unwrap(), 3);

    table.add_row(2, true).unwrap();
    assert_eq!(table.row_count().unwrap(), 5);
    // Fresh rows read as type defaults.
    assert_eq!(table.get_cell("a", 4).unwrap(), Value::I32(0));
    assert_eq!(table.get_cell("b", 4).unwrap(), Value::Str(String::new()));

    for i in 0..5u64 {
        table.put_cell("a", i, &Value::I32(i as i32 * 10)).unwrap();
    }
    table.remove_row(&[1, 3]).unwrap();
    assert_eq!(table.row_count().unwrap(), 3);
    let survivors = table.get_column_range("a", 0, 3).unwrap();
    assert_eq!(
        survivors,
        vec![Value::I32(0), Value::I32(20), Value::I32(40)]
    );
    assert!(matches!(
        table.get_cell("a", 3),
        Err(TableError::RowOutOfRange { .. })
    ));
}

#[test]
fn test_null_table_errors_name_operation() {
    let table = Table::null();
    let err = table.row_count().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("row_count"), "{msg}");
    assert!(msg.contains("Table object is empty"), "{msg}");

    for (op, err) in [
        ("put_cell", table.put_cell("x", 0, &Value::I32(0)).unwrap_err()),
        ("get_cell", table.get_cell("x", 0).unwrap_err()),
        ("flush", table.flush(false, false).unwrap_err()),
        ("add_row", table.add_row(1, true).unwrap_err()),
        ("remove_column", table.remove_column("x").unwrap_err()),
    ] {
        let msg = err.to_string();
        assert!(msg.contains(op), "{msg}");
        assert!(msg.contains("Table object is empty"), "{msg}");
    }
}

#[test]
fn test_table_cache_shares_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_cache");
    let mut desc = TableDesc::new();
    desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
    let t1 = Table::create(&path, desc, Vec::new(), 1, &CreateOptions::default()).unwrap();
    // A second open of the same path observes the same state without a
    // flush in between.
    let t2 = Table::open(&path, OpenMode::Update, LockMode::Auto).unwrap();
    t1.put_cell("a", 0, &Value::I32(99)).unwrap();
    assert_eq!(t2.get_cell("a", 0).unwrap(), Value::I32(99));
    t2.add_row(1, true).unwrap();
    assert_eq!(t1.row_count().unwrap(), 2);
}

#[test]
fn test_scratch_table_deleted_on_close() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_scratch");
    {
        let mut desc = TableDesc::new();
        desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
        let options = CreateOptions { scratch: true, ..CreateOptions::default() };
        let table = Table::create(&path, desc, Vec::new(), 1, &options).unwrap();
        table.put_cell("a", 0, &Value::I32(1)).unwrap();
        assert!(path.exists());
    }
    assert!(!path.exists());
}

#[test]
fn test_new_no_replace_refuses_existing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_nnr");
    let mut desc = TableDesc::new();
    desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
    {
        let _t = Table::create(&path, desc.clone(), Vec::new(), 0, &CreateOptions::default())
            .unwrap();
    }
    let options = CreateOptions { no_replace: true, ..CreateOptions::default() };
    assert!(matches!(
        Table::create(&path, desc, Vec::new(), 0, &options),
        Err(TableError::Duplicate(_))
    ));
}

#[test]
fn test_locking_modes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_lock");
    let mut desc = TableDesc::new();
    desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
    {
        let t = Table::create(&path, desc, Vec::new(), 1, &CreateOptions::default()).unwrap();
        t.flush(true, false).unwrap();
    }

    let t = Table::open(&path, OpenMode::Update, LockMode::UserNoRead).unwrap();
    assert!(!t.has_lock(LockKind::Read).unwrap());
    t.lock(LockKind::Write, Duration::ZERO).unwrap();
    assert!(t.has_lock(LockKind::Write).unwrap());
    assert!(t.has_lock(LockKind::Read).unwrap());
    t.unlock().unwrap();
    assert!(!t.has_lock(LockKind::Read).unwrap());
}

#[test]
fn test_keywords_and_info_persist() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_kw");
    {
        let mut desc = TableDesc::new();
        desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
        let table =
            Table::create(&path, desc, Vec::new(), 1, &CreateOptions::default()).unwrap();
        table.set_keyword("telescope", serde_json::json!("WSRT")).unwrap();
        table
            .set_column_keyword("a", "unit", serde_json::json!("Jy"))
            .unwrap();
        let mut info = super::info::TableInfo::new("Measurement", "test");
        info.add_readme_line("created by the keyword test");
        table.set_info(info).unwrap();
        table.flush(false, false).unwrap();
    }
    let table = Table::open(&path, OpenMode::Old, LockMode::Auto).unwrap();
    assert_eq!(
        table.keywords().unwrap().get("telescope").unwrap(),
        "WSRT"
    );
    assert_eq!(
        table.column_keywords("a").unwrap().get("unit").unwrap(),
        "Jy"
    );
    let info = table.info().unwrap();
    assert_eq!(info.table_type, "Measurement");
    assert_eq!(info.readme, vec!["created by the keyword test"]);
}

#[test]
fn test_actual_desc_reports_real_managers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_actual");
    let mut desc = TableDesc::new();
    desc.add_column(ColumnDesc::scalar("a", DataType::I32)).unwrap();
    // No binding given: the coordinator falls back to a standard
    // manager, and the actual description must say so.
    let table = Table::create(&path, desc, Vec::new(), 1, &CreateOptions::default()).unwrap();
    let actual = table.actual_table_desc().unwrap();
    let col = &actual["columns"][0];
    assert_eq!(col["name"], "a");
    assert_eq!(col["data_manager_type"], "standard");
}

#[test]
fn test_mixed_managers_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t_mixed");
    let cell = Shape::new(vec![3, 4]);
    {
        let mut desc = TableDesc::new();
        desc.add_column(ColumnDesc::scalar("scan", DataType::I32)).unwrap();
        desc.add_column(ColumnDesc::scalar("name", DataType::Str)).unwrap();
        desc.add_column(ColumnDesc::array_fixed("vis", DataType::Complex32, cell.clone()))
            .unwrap();
        let bindings = vec![
            SmBinding::new(
                "ISM",
                SmType::Incremental,
                serde_json::json!({"bucket_size": 512}),
                &["scan"],
            ),
            SmBinding::new(
                "TSM",
                SmType::TiledColumn,
                serde_json::json!({"tile_shape": [2, 2]}),
                &["vis"],
            ),
        ];
        let table =
            Table::create(&path, desc, bindings, 6, &CreateOptions::default()).unwrap();
        for i in 0..6u64 {
            // The scan number changes every third row, the natural
            // shape for the interval layout.
            table.put_cell("scan", i, &Value::I32((i / 3) as i32)).unwrap();
            table.put_cell("name", i, &Value::Str(format!("src_{i}"))).unwrap();
            let data: Vec<Value> = (0..cell.product())
                .map(|k| Value::C32(Complex32::new(i as f32, k as f32)))
                .collect();
            table.put_array_cell("vis", i, &cell, &data).unwrap();
        }
        table.flush(true, false).unwrap();
    }
    let table = Table::open(&path, OpenMode::Old, LockMode::Auto).unwrap();
    for i in 0..6u64 {
        assert_eq!(table.get_cell("scan", i).unwrap(), Value::I32((i / 3) as i32));
        assert_eq!(table.get_cell("name", i).unwrap(), Value::Str(format!("src_{i}")));
        let (shape, data) = table.get_array_cell("vis", i).unwrap();
        assert_eq!(shape, cell);
        for (k, v) in data.iter().enumerate() {
            assert_eq!(*v, Value::C32(Complex32::new(i as f32, k as f32)));
        }
    }
    // The unbound string column landed in a default standard manager.
    let actual = table.actual_table_desc().unwrap();
    let name_col = actual["columns"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["name"] == "name")
        .unwrap();
    assert_eq!(name_col["data_manager_type"], "standard");
}
