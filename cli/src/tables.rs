use optimizer::{Assignment, CapacityRow, PreferenceRow};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

/// An enumeration of errors that may occur while reading or writing the csv
/// tables
#[derive(Debug, Error)]
pub enum TableError {
    #[error("Table io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Csv(#[from] csv::Error),
    #[error("Preference table is missing required column {0}")]
    MissingColumn(&'static str),
    #[error("Expected preference columns preference_1 through preference_{expected}, found {found}")]
    PreferenceColumns { expected: u32, found: u32 },
}

#[derive(Debug, Deserialize)]
struct CapacityRecord {
    session_id: String,
    slot: String,
    capacity: u32,
}

#[derive(Debug, Serialize)]
struct AssignmentRecord<'a> {
    user_id: &'a str,
    slot: &'a str,
    assigned_session: &'a str,
}

/// Reads the user preference table.
///
/// Expects columns `user_id`, `slot` and `preference_1..preference_K`; an
/// empty preference cell means the user listed no choice at that rank and the
/// rank is skipped.
///
/// # Errors
/// `MissingColumn` / `PreferenceColumns` when the header does not match,
/// `Csv` for unreadable or malformed rows.
pub fn read_preference_rows(path: &Path, n_prefs: u32) -> Result<Vec<PreferenceRow>, TableError> {
    parse_preferences(csv::Reader::from_path(path)?, n_prefs)
}

/// Reads the session capacity table (`session_id`, `slot`, `capacity`).
///
/// # Errors
/// `Csv` for unreadable rows or a capacity that is not a non-negative
/// integer.
pub fn read_capacity_rows(path: &Path) -> Result<Vec<CapacityRow>, TableError> {
    parse_capacities(csv::Reader::from_path(path)?)
}

/// Writes the best assignment table, one row per (user, slot) pair in the
/// order the preference rows were declared.
pub fn write_assignment_rows(path: &Path, assignment: &Assignment) -> Result<(), TableError> {
    let mut writer = csv::Writer::from_path(path)?;
    write_assignments(&mut writer, assignment)?;
    writer.flush()?;
    Ok(())
}

fn parse_preferences<R: Read>(
    mut reader: csv::Reader<R>,
    n_prefs: u32,
) -> Result<Vec<PreferenceRow>, TableError> {
    let headers = reader.headers()?.clone();
    let column = |name: &'static str| {
        headers
            .iter()
            .position(|header| header == name)
            .ok_or(TableError::MissingColumn(name))
    };
    let user_col = column("user_id")?;
    let slot_col = column("slot")?;

    // preference_1..preference_K, K discovered from the header
    let mut pref_cols = Vec::new();
    for rank in 1u32.. {
        let name = format!("preference_{rank}");
        match headers.iter().position(|header| header == name) {
            Some(col) => pref_cols.push(col),
            None => break,
        }
    }
    if pref_cols.len() as u32 != n_prefs {
        return Err(TableError::PreferenceColumns {
            expected: n_prefs,
            found: pref_cols.len() as u32,
        });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut choices = Vec::new();
        for (i, &col) in pref_cols.iter().enumerate() {
            let cell = record.get(col).unwrap_or("").trim();
            if !cell.is_empty() {
                choices.push((i as u32 + 1, cell.to_string()));
            }
        }
        rows.push(PreferenceRow {
            user_id: record.get(user_col).unwrap_or("").trim().to_string(),
            slot: record.get(slot_col).unwrap_or("").trim().to_string(),
            choices,
        });
    }

    Ok(rows)
}

fn parse_capacities<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<CapacityRow>, TableError> {
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let record: CapacityRecord = record?;
        rows.push(CapacityRow {
            session_id: record.session_id,
            slot: record.slot,
            capacity: record.capacity,
        });
    }
    Ok(rows)
}

fn write_assignments<W: Write>(
    writer: &mut csv::Writer<W>,
    assignment: &Assignment,
) -> Result<(), TableError> {
    for entry in &assignment.entries {
        writer.serialize(AssignmentRecord {
            user_id: &entry.user_id,
            slot: &entry.slot,
            assigned_session: &entry.session,
        })?;
    }
    Ok(())
}
