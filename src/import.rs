//! Bulk roster import from CSV.
//!
//! Rows are `employee_id, name, email, phone` in that order unless the first
//! row is a header naming the columns. Every row is upserted by email; a bad
//! row is counted and skipped.

use std::io::Cursor;

use csv::{ReaderBuilder, StringRecord, Trim};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_IMPORT_ROWS;
use crate::model::{ImportStats, UpsertOutcome, UserUpsert};

/// Column positions within a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    employee_id: Option<usize>,
    name: usize,
    email: usize,
    phone: Option<usize>,
}

const POSITIONAL: Layout = Layout {
    employee_id: Some(0),
    name: 1,
    email: 2,
    phone: Some(3),
};

/// Header layout if `record` looks like a header row, else `None`.
fn header_layout(record: &StringRecord) -> Option<Layout> {
    let names: Vec<String> = record
        .iter()
        .map(|h| h.to_ascii_lowercase().replace(['_', ' ', '-'], ""))
        .collect();
    let find = |wanted: &[&str]| names.iter().position(|n| wanted.contains(&n.as_str()));
    let email = find(&["email", "mail"])?;
    let name = find(&["name", "fullname"])?;
    Some(Layout {
        employee_id: find(&["employeeid", "employee"]),
        name,
        email,
        phone: find(&["phone", "phonenumber"]),
    })
}

fn cell(record: &StringRecord, index: Option<usize>) -> Option<String> {
    index
        .and_then(|i| record.get(i))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Engine {
    /// Upsert every row of a roster CSV. Only an oversized file is an
    /// error; malformed rows are tallied in `errors`.
    pub async fn import_users_csv(&self, data: &[u8]) -> Result<ImportStats, EngineError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(Cursor::new(data));

        let mut stats = ImportStats::default();
        let mut detected: Option<Layout> = None;
        let mut rows = Vec::new();
        for (index, result) in reader.records().enumerate() {
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("import row {index}: {e}");
                    stats.total += 1;
                    stats.errors += 1;
                    continue;
                }
            };
            if record.iter().all(str::is_empty) {
                continue;
            }
            // The first non-blank row is either a header or data.
            let layout = match detected {
                Some(l) => l,
                None => match header_layout(&record) {
                    Some(header) => {
                        detected = Some(header);
                        continue;
                    }
                    None => *detected.insert(POSITIONAL),
                },
            };
            rows.push((index, layout, record));
        }
        // Reject an oversized file before anything is written.
        if stats.total + rows.len() > MAX_IMPORT_ROWS {
            return Err(EngineError::LimitExceeded("too many rows in import"));
        }

        for (index, layout, record) in rows {
            stats.total += 1;
            let (Some(name), Some(email)) =
                (cell(&record, Some(layout.name)), cell(&record, Some(layout.email)))
            else {
                stats.errors += 1;
                continue;
            };
            let input = UserUpsert {
                id: Ulid::new(),
                employee_id: cell(&record, layout.employee_id),
                name,
                email,
                phone: cell(&record, layout.phone),
                verified: None,
            };
            match self.upsert_user(input).await {
                Ok(UpsertOutcome::Inserted(_)) => stats.inserted += 1,
                Ok(UpsertOutcome::Updated(_)) => stats.updated += 1,
                Err(e) => {
                    tracing::debug!("import row {index}: {e}");
                    stats.errors += 1;
                }
            }
        }

        tracing::info!(
            "roster import: {} rows, {} inserted, {} updated, {} errors",
            stats.total,
            stats.inserted,
            stats.updated,
            stats.errors
        );
        Ok(stats)
    }
}
