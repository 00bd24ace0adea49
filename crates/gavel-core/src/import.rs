// Bulk player import from CSV (`name,role,base_price,set`).

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::auction::error::ValidationError;
use crate::auction::model::{Money, NewPlayer, NewSet, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("failed to read file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("no usable player rows")]
    Empty,
}

/// One parsed row; the set is still a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    pub name: String,
    pub role: Option<String>,
    pub base_price: Money,
    pub set: String,
}

#[derive(Debug, Deserialize)]
struct RawRow {
    name: String,
    #[serde(default)]
    role: Option<String>,
    base_price: String,
    set: String,
}

/// Parse player rows from any reader. Malformed rows (missing name or set,
/// non-numeric price) are skipped with a warning.
pub fn parse_players_csv<R: Read>(rdr: R) -> Result<Vec<ImportRow>, ImportError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(rdr);
    let mut rows = Vec::new();
    for (i, result) in reader.deserialize::<RawRow>().enumerate() {
        // Header is line 1.
        let line = i + 2;
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                warn!("skipping malformed import row {line}: {e}");
                continue;
            }
        };
        if raw.name.is_empty() || raw.set.is_empty() {
            warn!("skipping import row {line}: name and set are required");
            continue;
        }
        let Ok(base_price) = raw.base_price.replace([',', '_'], "").parse::<Money>() else {
            warn!(
                "skipping import row {line} ({}): invalid base price {:?}",
                raw.name, raw.base_price
            );
            continue;
        };
        rows.push(ImportRow {
            name: raw.name,
            role: raw.role.filter(|r| !r.is_empty()),
            base_price,
            set: raw.set,
        });
    }
    if rows.is_empty() {
        return Err(ImportError::Empty);
    }
    Ok(rows)
}

/// Parse a CSV file from disk.
pub fn load_players_csv(path: &Path) -> Result<Vec<ImportRow>, ImportError> {
    let file = File::open(path).map_err(|e| ImportError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_players_csv(file)
}

/// Sets named by `rows` that the snapshot does not have yet, in file order.
pub fn missing_sets(snapshot: &Snapshot, rows: &[ImportRow]) -> Vec<NewSet> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter(|row| snapshot.find_set(&row.set).is_none())
        .filter(|row| seen.insert(row.set.to_lowercase()))
        .map(|row| NewSet {
            name: row.set.clone(),
            order: None,
        })
        .collect()
}

/// Resolve set names against the snapshot.
pub fn to_new_players(
    snapshot: &Snapshot,
    rows: &[ImportRow],
) -> Result<Vec<NewPlayer>, ValidationError> {
    rows.iter()
        .map(|row| {
            let set = snapshot
                .find_set(&row.set)
                .ok_or_else(|| ValidationError::UnknownSet(row.set.clone()))?;
            Ok(NewPlayer {
                name: row.name.clone(),
                role: row.role.clone(),
                base_price: row.base_price,
                set_id: set.id.clone(),
            })
        })
        .collect()
}
