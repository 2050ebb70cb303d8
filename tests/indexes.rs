use heap_table::{
    Environment, Error, FixedIndexDef, IndexDef, Table, TableSchema, TableValueBuilder,
    TableValueReader,
};

fn schema() -> TableSchema {
    TableSchema::new("users", 4)
        .primary(IndexDef::by_column_range("by-name", 0, 1))
        .with_index(IndexDef::by_column_range("by-group", 1, 1))
        .with_fixed_index(FixedIndexDef::by_column("by-seq", 2))
}

fn user(name: &str, group: &str, seq: u64) -> TableValueBuilder {
    let mut builder = TableValueBuilder::new();
    builder.add(name);
    builder.add(group);
    builder.add(seq.to_le_bytes());
    builder
}

fn names(entries: Vec<heap_table::TableEntry>) -> Vec<String> {
    entries
        .into_iter()
        .map(|e| String::from_utf8(e.reader.column(0).expect("column").to_vec()).expect("utf8"))
        .collect()
}

#[test_log::test]
fn secondary_index_groups_duplicates_in_id_order() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    let id_a = table.insert(&mut user("a", "X", 1))?;
    let id_b = table.insert(&mut user("b", "X", 2))?;

    let found = table
        .seek_forward_from("by-group", b"X", false, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec![id_a, id_b], found.iter().map(|e| e.id).collect::<Vec<_>>());

    table.delete(id_a)?;

    let found = table
        .seek_forward_from("by-group", b"X", false, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(1, found.len());
    assert_eq!(b"b", &*found[0].reader.column(0)?);

    Ok(())
}

#[test_log::test]
fn secondary_seeks_honor_prefix_skip_and_direction() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    table.insert(&mut user("u1", "eng/backend", 1))?;
    table.insert(&mut user("u2", "eng/frontend", 2))?;
    table.insert(&mut user("u3", "eng/backend", 3))?;
    table.insert(&mut user("u4", "sales", 4))?;

    // bounded by prefix
    let found = table
        .seek_forward_from("by-group", b"eng/", true, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["u1", "u3", "u2"], names(found));

    // skip applies across groups
    let found = table
        .seek_forward_from("by-group", b"eng/", true, 2)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["u2"], names(found));

    // backward from the end
    let found = table
        .seek_backward_from("by-group", None, false)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["u4", "u2", "u3", "u1"], names(found));

    // backward with the upper bound excluded
    let found = table
        .seek_backward_from("by-group", Some(b"sales"), true)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["u2", "u3", "u1"], names(found));

    // seek-one
    let one = table.seek_one_forward_from("by-group", b"eng/c")?.expect("found");
    assert_eq!(b"u2", &*one.reader.column(0)?);

    Ok(())
}

#[test_log::test]
fn primary_seeks() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    for name in ["ada", "ben", "cleo", "dana"] {
        table.insert(&mut user(name, "g", fastrand(name)))?;
    }

    let found = table
        .seek_by_primary(b"b", false, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["ben", "cleo", "dana"], names(found));

    let found = table
        .seek_by_primary(b"", false, 2)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["cleo", "dana"], names(found));

    let found = table
        .seek_backward_by_primary(Some(b"cleo"), true)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["ben", "ada"], names(found));

    let one = table.seek_one_by_primary(b"c")?.expect("found");
    assert_eq!(b"cleo", &*one.reader.column(0)?);

    Ok(())
}

fn fastrand(seed: &str) -> u64 {
    seed.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01B3)
    })
}

#[test_log::test]
fn fixed_index_lookup_and_order() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    table.insert(&mut user("a", "g", 300))?;
    table.insert(&mut user("b", "g", 100))?;
    table.insert(&mut user("c", "g", 200))?;

    let found = table.read_by_fixed_index("by-seq", 200)?.expect("present");
    assert_eq!(b"c", &*found.reader.column(0)?);
    assert!(table.read_by_fixed_index("by-seq", 999)?.is_none());

    // numeric ordering, not lexicographic
    let found = table
        .seek_forward_by_fixed("by-seq", 0, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["b", "c", "a"], names(found));

    let found = table
        .seek_backward_by_fixed("by-seq", Some(300), true)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["c", "b"], names(found));

    Ok(())
}

#[test_log::test]
fn duplicate_fixed_index_key_is_rejected() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    table.insert(&mut user("a", "g", 7))?;

    let err = table.insert(&mut user("b", "g", 7)).expect_err("duplicate seq");
    assert!(matches!(err, Error::DuplicateKey { index } if index == "by-seq"));

    Ok(())
}

#[test_log::test]
fn update_moves_index_entries() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    let id = table.insert(&mut user("a", "old-group", 1))?;
    table.insert(&mut user("b", "old-group", 2))?;

    table.update(id, &mut user("a", "new-group", 10), false)?;

    let found = table
        .seek_forward_from("by-group", b"old-group", true, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["b"], names(found));

    let found = table
        .seek_forward_from("by-group", b"new-group", true, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["a"], names(found));

    assert!(table.read_by_fixed_index("by-seq", 1)?.is_none());
    assert!(table.read_by_fixed_index("by-seq", 10)?.is_some());

    Ok(())
}

#[test_log::test]
fn delete_forward_from_respects_limit_and_prefix() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    for i in 0..10u64 {
        table.insert(&mut user(&format!("u{i}"), &format!("grp-{}", i % 2), i))?;
    }

    // two rounds against the same group
    assert_eq!(3, table.delete_forward_from("by-group", b"grp-0", true, 3)?);
    assert_eq!(2, table.delete_forward_from("by-group", b"grp-0", true, 100)?);
    assert_eq!(0, table.delete_forward_from("by-group", b"grp-0", true, 100)?);

    assert_eq!(5, table.number_of_entries());

    let found = table
        .seek_forward_from("by-group", b"grp-1", true, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(5, found.len());

    Ok(())
}

#[test_log::test]
fn delete_backward_from_fixed_index() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    for i in 1..=8u64 {
        table.insert(&mut user(&format!("u{i}"), "g", i * 10))?;
    }

    // deletes 80, 70, 60
    assert_eq!(3, table.delete_backward_from("by-seq", 80, 3)?);
    // nothing above 55 besides what's gone
    assert_eq!(0, table.delete_backward_from("by-seq", 55, 0)?);
    // everything else, bounded by the table contents
    assert_eq!(5, table.delete_backward_from("by-seq", 55, 100)?);

    assert_eq!(0, table.number_of_entries());
    Ok(())
}

#[test_log::test]
fn delete_by_index_and_by_primary_prefix() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    for i in 0..6u64 {
        table.insert(&mut user(&format!("tmp/u{i}"), "g", i))?;
    }
    table.insert(&mut user("keep", "g", 100))?;

    assert!(table.delete_by_index("by-seq", 5)?);
    assert!(!table.delete_by_index("by-seq", 5)?);

    // aborts after seeing two entries
    let mut seen = 0;
    let mut observed = Vec::new();
    let finished = table.delete_by_primary_prefix(
        b"tmp/",
        Some(&mut |entry| {
            observed.push(entry.id);
            Ok(())
        }),
        Some(&mut |_| {
            seen += 1;
            seen > 2
        }),
    )?;
    assert!(!finished);
    assert_eq!(2, observed.len());

    // now drain the prefix completely
    let finished = table.delete_by_primary_prefix(b"tmp/", None, None)?;
    assert!(finished);

    assert_eq!(1, table.number_of_entries());
    assert!(table.read_by_key(b"keep")?.is_some());

    Ok(())
}

#[test_log::test]
fn custom_extractor_indexes_derived_values() -> heap_table::Result<()> {
    fn group_upper(reader: &TableValueReader) -> heap_table::Result<heap_table::Slice> {
        let group = reader.column(1)?;
        Ok(heap_table::Slice::from(group.to_ascii_uppercase()))
    }

    let schema = TableSchema::new("tagged", 5)
        .primary(IndexDef::by_column_range("by-name", 0, 1))
        .with_index(IndexDef::custom("by-group-upper", group_upper));

    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema)?;

    table.insert(&mut user("a", "mixed", 1))?;
    table.insert(&mut user("b", "MiXeD", 2))?;

    let found = table
        .seek_forward_from("by-group-upper", b"MIXED", true, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(2, found.len());

    Ok(())
}

#[test_log::test]
fn global_index_is_shared_across_tables() -> heap_table::Result<()> {
    fn collection_schema(name: &str) -> TableSchema {
        TableSchema::new(name, 6)
            .primary(IndexDef::by_column_range("by-name", 0, 1))
            .with_fixed_index(FixedIndexDef::by_column("all-seqs", 2).global())
    }

    let env = Environment::new();
    let tx = env.write_txn();

    let orders = Table::open(&tx, &collection_schema("orders"))?;
    let invoices = Table::open(&tx, &collection_schema("invoices"))?;

    orders.insert(&mut user("o1", "g", 1))?;
    invoices.insert(&mut user("i1", "g", 2))?;
    orders.insert(&mut user("o2", "g", 3))?;

    // the shared tree sees entries of both tables, in key order
    let found = orders
        .seek_forward_by_fixed("all-seqs", 0, 0)?
        .collect::<heap_table::Result<Vec<_>>>()?;
    assert_eq!(vec!["o1", "i1", "o2"], names(found));

    // a global-reads view can read but not write
    let view = Table::open_for_global_reads(&tx, &collection_schema("orders"))?;
    assert!(view.read_by_fixed_index("all-seqs", 2)?.is_some());

    let err = view.insert(&mut user("nope", "g", 9)).expect_err("read-only view");
    assert!(matches!(err, Error::ReadOnlyTable));

    Ok(())
}
