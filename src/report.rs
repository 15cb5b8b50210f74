//! Serializable probe results and the JSON report writer.

use std::cmp::Ordering;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::ProductSet;

/// One probed product, flattened for downstream persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockRecord {
    pub item_code: String,
    pub source_listing: String,
    pub rank: Option<u32>,
    pub max_quantity: Option<u32>,
    pub url: String,
}

/// Flatten a product set into records ordered by listing rank (unranked
/// entries last, ties broken by item code).
pub fn to_records(set: &ProductSet) -> Vec<StockRecord> {
    let mut records: Vec<StockRecord> = set
        .iter()
        .map(|p| StockRecord {
            item_code: p.key().code().to_string(),
            source_listing: p.key().source().to_string(),
            rank: p.rank().map(|r| r.get()),
            max_quantity: p.max_qty(),
            url: p.url(),
        })
        .collect();

    records.sort_by(|a, b| match (a.rank, b.rank) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.item_code.cmp(&b.item_code)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.item_code.cmp(&b.item_code),
    });
    records
}

/// Write the result set to a JSON file.
pub fn write_json(path: impl AsRef<Path>, set: &ProductSet) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(&to_records(set))
        .context("failed to serialize stock records")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    Ok(())
}
