// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use anyhow::Context;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use concord_node::snapshot::{self, SnapshotMeta};
use std::path::Path;

pub struct SnapshotSummary {
    pub meta: SnapshotMeta,
    /// `(table, rows)` in snapshot order.
    pub tables: Vec<(String, usize)>,
}

pub fn load(path: &Path) -> anyhow::Result<SnapshotSummary> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let (meta, tables) = snapshot::decode(&bytes).with_context(|| format!("decoding {}", path.display()))?;
    Ok(SnapshotSummary {
        meta,
        tables: tables.into_iter().map(|t| (t.table, t.rows.len())).collect(),
    })
}

pub fn run(path: &Path) -> anyhow::Result<()> {
    let summary = load(path)?;
    let meta = &summary.meta;

    println!("\nSnapshot {}", path.display());
    println!("--------------------");

    let mut header = Table::new();
    header
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Field", "Value"]);
    header.add_row(vec!["Version".to_string(), meta.version.to_string()]);
    header.add_row(vec!["Shard".to_string(), meta.shard_id.to_string()]);
    header.add_row(vec!["Replica".to_string(), meta.replica_id.to_string()]);
    header.add_row(vec!["Applied index".to_string(), meta.applied_index.to_string()]);
    header.add_row(vec![
        "Taken at".to_string(),
        chrono::DateTime::from_timestamp(meta.timestamp as i64, 0)
            .unwrap_or_default()
            .to_rfc3339(),
    ]);
    header.add_row(vec!["Body bytes".to_string(), meta.body_len.to_string()]);
    println!("{}", header);

    let mut tables = Table::new();
    tables
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Table", "Rows"]);
    for (name, rows) in &summary.tables {
        tables.add_row(vec![name.clone(), rows.to_string()]);
    }
    println!("{}", tables);
    Ok(())
}
