//! Identity command implementation.

use rowsync_protocol::{generate_id, KeySchema, Row, RowId};

/// Runs the identity command.
pub fn run(key: &[String], row_json: &str) -> Result<RowId, Box<dyn std::error::Error>> {
    let schema = KeySchema::new(key.iter().cloned())?;
    let row: Row = serde_json::from_str(row_json)
        .map_err(|e| format!("row must be a JSON object of scalars: {e}"))?;
    Ok(generate_id(&row, &schema))
}
