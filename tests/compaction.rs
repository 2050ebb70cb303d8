use heap_table::storage_id::is_overflow;
use heap_table::{Environment, IndexDef, Table, TableSchema, TableValueBuilder};

fn schema() -> TableSchema {
    TableSchema::new("events", 2).primary(IndexDef::by_column_range("by-key", 0, 1))
}

fn entry(key: &str, value: &[u8]) -> TableValueBuilder {
    let mut builder = TableValueBuilder::new();
    builder.add(key);
    builder.add(value);
    builder
}

#[test_log::test]
fn compaction_relocates_survivors() -> heap_table::Result<()> {
    use rand::seq::SliceRandom;

    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    // fill several sections
    let mut ids = Vec::new();
    for i in 0..1000u32 {
        let key = format!("key-{i:05}");
        ids.push((key, table.insert(&mut entry(&format!("key-{i:05}"), &[i as u8; 500]))?));
    }
    assert_eq!(1000, table.number_of_entries());

    // interleaved deletes (in random order) drive section densities below
    // the compaction threshold; deletion goes through the primary key since
    // compaction is free to relocate ids under our feet
    let mut doomed = ids
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 10 != 0)
        .map(|(_, (key, _))| key.clone())
        .collect::<Vec<_>>();
    doomed.shuffle(&mut rand::rng());
    for key in doomed {
        assert!(table.delete_by_key(key.as_bytes())?);
    }
    assert_eq!(100, table.number_of_entries());

    // every survivor is still reachable through its primary key, possibly
    // under a relocated id
    for (i, (key, _)) in ids.iter().enumerate() {
        let found = table.read_by_key(key.as_bytes())?;
        if i % 10 == 0 {
            let found = found.expect("survivor");
            assert_eq!(&[i as u8; 500][..], &*found.reader.column(1)?);
            assert!(!is_overflow(found.id));
        } else {
            assert!(found.is_none());
        }
    }

    let report = table.get_report(true)?;
    assert_eq!(100, report.number_of_entries);
    assert_eq!(100, report.indexes[0].entries);

    // the doomed sections are gone; the survivors live in a handful of
    // dense-enough sections
    assert!(report.sections.len() < 5, "sections: {:?}", report.sections);

    table.prepare_for_commit()?;
    tx.commit()?;
    Ok(())
}

#[test_log::test]
fn deleting_from_the_active_section_never_compacts() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    let a = table.insert(&mut entry("a", &[1; 100]))?;
    let b = table.insert(&mut entry("b", &[2; 100]))?;

    // density of the (active) section is now far below every threshold
    table.delete(a)?;
    table.delete(b)?;

    let report = table.get_report(true)?;
    assert_eq!(0, report.number_of_entries);
    assert_eq!(1, report.sections.len());
    assert_eq!("active", report.sections[0].state);

    // the section keeps serving allocations
    let id = table.insert(&mut entry("c", &[3; 100]))?;
    assert_eq!(b"c", &*table.read_by_key(b"c")?.expect("present").reader.column(0)?);
    assert!(!is_overflow(id));

    Ok(())
}

#[test_log::test]
fn moderately_empty_sections_become_candidates() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    // fill the first section completely so it gets retired
    let mut first_section_ids = Vec::new();
    loop {
        let i = first_section_ids.len();
        let id = table.insert(&mut entry(&format!("k-{i:05}"), &[9; 500]))?;

        let report = table.get_report(true)?;
        if report.sections.len() > 1 {
            break;
        }
        first_section_ids.push(id);
    }

    // delete roughly two thirds of the retired section: density lands in
    // the candidate window (0.15, 0.5]
    let to_delete = first_section_ids.len() * 2 / 3;
    for id in first_section_ids.iter().take(to_delete) {
        table.delete(*id)?;
    }

    let report = table.get_report(true)?;
    let candidates = report
        .sections
        .iter()
        .filter(|s| s.state == "candidate")
        .count();
    assert_eq!(1, candidates, "sections: {:?}", report.sections);

    Ok(())
}

#[test_log::test]
fn retired_candidates_are_reused_for_allocations() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    // retire section one, make it a candidate
    let mut ids = Vec::new();
    loop {
        let i = ids.len();
        let id = table.insert(&mut entry(&format!("k-{i:05}"), &[9; 500]))?;
        if table.get_report(true)?.sections.len() > 1 {
            break;
        }
        ids.push(id);
    }
    let candidate_window = ids.len() * 2 / 3;
    for id in ids.iter().take(candidate_window) {
        table.delete(*id)?;
    }

    // now exhaust the current active section too; the switch should promote
    // the candidate instead of growing the file
    let before = table.get_report(true)?;
    let mut i = 100_000;
    while table
        .get_report(true)?
        .sections
        .iter()
        .any(|s| s.state == "candidate")
    {
        table.insert(&mut entry(&format!("k-{i:05}"), &[7; 500]))?;
        i += 1;
    }

    let after = table.get_report(true)?;
    assert!(
        after.allocated_bytes <= before.allocated_bytes * 3,
        "section space should be reused, not only grown",
    );

    // everything is still readable
    for id in ids.iter().skip(candidate_window) {
        let reader = table.value_reader(*id)?;
        assert_eq!(&[9u8; 500][..], &*reader.column(1)?);
    }

    Ok(())
}

#[test_log::test]
fn sections_double_up_to_the_cap() -> heap_table::Result<()> {
    let env = Environment::new();
    let tx = env.write_txn();
    let table = Table::open(&tx, &schema())?;

    let mut i = 0u32;
    let mut max_pages = 0;
    // push through a few switches; each new section doubles
    while table.get_report(true)?.sections.len() < 4 {
        table.insert(&mut entry(&format!("k-{i:06}"), &[5; 1000]))?;
        i += 1;
    }

    for section in table.get_report(true)?.sections {
        assert!(section.pages <= heap_table::section::MAX_SECTION_PAGES);
        max_pages = max_pages.max(section.pages);
    }

    // 16 -> 32 -> 64 -> ...
    assert!(max_pages >= 64);

    Ok(())
}
