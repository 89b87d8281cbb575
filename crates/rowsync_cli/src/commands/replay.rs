//! Replay command implementation.

use rowsync_engine::{LoadReport, MemoryBackend, TableConfig, TableStats, TableSync};
use rowsync_protocol::{Condition, KeySchema, Prefilter, Row};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const TABLE: &str = "replay";

/// Table settings for a replay.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Primary-key columns.
    pub key: Vec<String>,
    /// Conditions in `column:op:value` form.
    pub filters: Vec<String>,
    /// Prefilter in `column=value` form.
    pub prefilter: Option<String>,
    /// Rows per page during the initial load.
    pub page_size: u64,
}

/// A push line that could not be decoded.
#[derive(Debug, Serialize)]
pub struct MalformedLine {
    /// 1-based line number in the event log.
    pub line: usize,
    /// Decoder error.
    pub error: String,
}

/// Replay result.
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Initial load summary.
    pub load: LoadReport,
    /// Push lines read, excluding blank lines.
    pub events: usize,
    /// Lines that were rejected.
    pub malformed: Vec<MalformedLine>,
    /// Table counters after the replay.
    pub stats: TableStats,
    /// Mirrored rows, oldest first.
    pub rows: Vec<Row>,
}

/// Runs the replay command.
pub fn run(
    seed: &Path,
    events: &Path,
    options: &ReplayOptions,
) -> Result<ReplayReport, Box<dyn std::error::Error>> {
    let schema = KeySchema::new(options.key.iter().cloned())?;

    let mut config = TableConfig::new(TABLE, schema.clone()).with_page_size(options.page_size);
    for filter in &options.filters {
        config = config.filter(Condition::parse(filter)?);
    }
    if let Some(prefilter) = &options.prefilter {
        config = config.with_prefilter(Prefilter::parse(prefilter)?);
    }

    let seed_rows: Vec<Row> = serde_json::from_str(&fs::read_to_string(seed)?)
        .map_err(|e| format!("seed must be a JSON array of rows: {e}"))?;
    let log = fs::read_to_string(events)?;

    let backend = Arc::new(MemoryBackend::new(TABLE, schema));
    backend.seed(seed_rows);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let table: TableSync<Row, _> = TableSync::new(config, backend);
        let load = table.init().await?;

        let mut events = 0;
        let mut malformed = Vec::new();
        for (n, line) in log.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            events += 1;
            if let Err(e) = table.handle_push_payload(line.as_bytes()) {
                malformed.push(MalformedLine {
                    line: n + 1,
                    error: e.to_string(),
                });
            }
        }

        let rows = table.cache().snapshot().to_vec();
        let stats = table.stats();
        table.close();

        Ok::<_, Box<dyn std::error::Error>>(ReplayReport {
            load,
            events,
            malformed,
            stats,
            rows,
        })
    })
}

/// Prints a replay report.
pub fn print(report: &ReplayReport, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        _ => print_text_output(report)?,
    }
    Ok(())
}

fn print_text_output(report: &ReplayReport) -> Result<(), Box<dyn std::error::Error>> {
    println!("Replay");
    println!("======");
    println!(
        "Loaded:      {} of {} rows in {} pages{}",
        report.load.fetched,
        report.load.total,
        report.load.pages,
        if report.load.aborted { " (aborted)" } else { "" }
    );
    println!("Events:      {}", report.events);
    println!("  applied:   {}", report.stats.events_applied);
    println!("  removed:   {}", report.stats.events_removed);
    println!("  evicted:   {}", report.stats.events_evicted);
    println!("  malformed: {}", report.malformed.len());
    for bad in &report.malformed {
        println!("    line {}: {}", bad.line, bad.error);
    }
    println!();
    println!("Rows ({}):", report.rows.len());
    for row in &report.rows {
        println!("  {}", serde_json::to_string(row)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_protocol::Value;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn options() -> ReplayOptions {
        ReplayOptions {
            key: vec!["id".into()],
            filters: vec!["done:eq:false".into()],
            prefilter: None,
            page_size: 2,
        }
    }

    fn ids(report: &ReplayReport) -> Vec<i64> {
        report
            .rows
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_integer))
            .collect()
    }

    #[test]
    fn replays_events_over_seed() {
        let seed = file(
            r#"[{"id": 1, "done": false}, {"id": 2, "done": true}, {"id": 3, "done": false}]"#,
        );
        let events = file(concat!(
            r#"{"type": "insert", "row": {"id": 4, "done": false}, "timestamp": "t1"}"#,
            "\n",
            "\n",
            r#"{"type": "update", "row": {"id": 1, "done": true}, "timestamp": "t2"}"#,
            "\n",
            "not an event\n",
            r#"{"type": "delete", "row": {"id": 3, "done": false}}"#,
            "\n",
        ));

        let report = run(seed.path(), events.path(), &options()).unwrap();

        assert_eq!(report.load.total, 2);
        assert_eq!(report.load.pages, 1);
        assert_eq!(report.events, 4);
        assert_eq!(report.malformed.len(), 1);
        assert_eq!(report.malformed[0].line, 4);
        assert_eq!(ids(&report), vec![4]);
        assert_eq!(report.stats.events_evicted, 1);
        assert_eq!(report.stats.events_removed, 1);
    }

    #[test]
    fn prefilter_scopes_the_load() {
        let seed = file(r#"[{"id": 1, "list": 1, "done": false}, {"id": 2, "list": 2, "done": false}]"#);
        let events = file("");
        let options = ReplayOptions {
            prefilter: Some("list=2".into()),
            ..options()
        };

        let report = run(seed.path(), events.path(), &options).unwrap();
        assert_eq!(ids(&report), vec![2]);
    }

    #[test]
    fn invalid_filter_is_reported() {
        let seed = file("[]");
        let events = file("");
        let options = ReplayOptions {
            filters: vec!["done".into()],
            ..options()
        };
        assert!(run(seed.path(), events.path(), &options).is_err());
    }

    #[test]
    fn json_report_serializes() {
        let seed = file(r#"[{"id": 1, "done": false}]"#);
        let events = file("");
        let report = run(seed.path(), events.path(), &options()).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rows"][0]["id"], 1);
        assert_eq!(json["load"]["fetched"], 1);
        assert!(print(&report, "json").is_ok());
    }
}
