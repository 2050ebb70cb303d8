// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Table introspection.

use super::Table;
use crate::env::{PageNumber, PAGE_SIZE};
use crate::hash::EMPTY_DICTIONARY_HASH;
use crate::section::RawDataSection;
use crate::Result;

/// Per-section detail row.
#[derive(Debug)]
pub struct SectionReport {
    /// Header page number.
    pub page: PageNumber,
    /// Pages the section spans, header included.
    pub pages: u64,
    /// Live entries.
    pub entries: u64,
    /// Live bytes over capacity.
    pub density: f32,
    /// Which tracked set the section is in.
    pub state: &'static str,
    /// Whether the section carries a trained dictionary.
    pub has_dictionary: bool,
}

/// Per-index summary row.
#[derive(Debug)]
pub struct IndexReport {
    /// The index's name.
    pub name: String,
    /// `"primary"`, `"secondary"` or `"fixed"`.
    pub kind: &'static str,
    /// Number of entries the index addresses.
    pub entries: u64,
}

/// Snapshot of a table's shape.
#[derive(Debug)]
pub struct TableReport {
    /// Table name.
    pub name: String,
    /// Entry count.
    pub number_of_entries: u64,
    /// Pages held by overflow runs.
    pub overflow_pages: u64,
    /// Bytes allocated by sections and overflow runs.
    pub allocated_bytes: u64,
    /// Live bytes inside sections.
    pub used_bytes: u64,
    /// Section detail rows (only when details were requested).
    pub sections: Vec<SectionReport>,
    /// Index summary rows.
    pub indexes: Vec<IndexReport>,
}

impl Table<'_, '_> {
    /// Builds an introspection report. With `include_details`, per-section
    /// rows are collected too.
    pub fn get_report(&self, include_details: bool) -> Result<TableReport> {
        let mut report = TableReport {
            name: self.name().to_owned(),
            number_of_entries: self.number_of_entries(),
            overflow_pages: self.overflow_pages(),
            allocated_bytes: self.overflow_pages() * PAGE_SIZE as u64,
            used_bytes: 0,
            sections: Vec::new(),
            indexes: Vec::new(),
        };

        let mut sections: Vec<(PageNumber, &'static str)> = Vec::new();
        let active = self.state.borrow().active_section;
        if active != 0 {
            sections.push((active, "active"));
        }
        for item in self.inactive_sections()?.iter() {
            sections.push((item?.0, "inactive"));
        }
        for item in self.candidate_sections()?.iter() {
            sections.push((item?.0, "candidate"));
        }

        for (page, state) in sections {
            let section = RawDataSection::open(self.tx, page)?;
            report.allocated_bytes += section.total_pages()? * PAGE_SIZE as u64;
            report.used_bytes += section.live_bytes()?;

            if include_details {
                report.sections.push(SectionReport {
                    page,
                    pages: section.total_pages()?,
                    entries: section.number_of_entries()?,
                    density: section.density()?,
                    state,
                    has_dictionary: section.compression_dictionary_hash()?
                        != EMPTY_DICTIONARY_HASH,
                });
            }
        }

        let primary = self.schema.primary_index()?;
        report.indexes.push(IndexReport {
            name: primary.name().to_owned(),
            kind: "primary",
            entries: self.index_tree(primary)?.len()?,
        });

        for index in self.schema.indexes() {
            let tree = self.index_tree(index)?;

            let mut entries = 0;
            for item in tree.iter() {
                let (key, _) = item?;
                if let Some(nested) = self.nested_ids_tree(&tree, &key, false)? {
                    entries += nested.len()?;
                }
            }

            report.indexes.push(IndexReport {
                name: index.name().to_owned(),
                kind: "secondary",
                entries,
            });
        }

        for index in self.schema.fixed_indexes() {
            report.indexes.push(IndexReport {
                name: index.name().to_owned(),
                kind: "fixed",
                entries: self.fixed_index_tree(index)?.len()?,
            });
        }

        Ok(report)
    }
}
