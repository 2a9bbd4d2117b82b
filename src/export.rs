//! CSV encoding of the consumption table.
//!
//! Columns are `day,building_id,consumptions`. The consumption vector is a
//! JSON array of 24 entries where a missing hour is `null`.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use thiserror::Error;
use tracing::info;

use crate::calendar::HOURS_PER_DAY;
use crate::pipeline::{ConsumptionTable, TableRow};
use crate::segment::DayVector;

pub const TABLE_HEADERS: [&str; 3] = ["day", "building_id", "consumptions"];
const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid output path: {0}")]
    InvalidPath(PathBuf),
    #[error("unexpected header {found:?}, expected {expected:?}")]
    UnexpectedHeader {
        found: Vec<String>,
        expected: Vec<String>,
    },
    #[error("record has {found} columns, expected {expected}")]
    InvalidRecordColumns { found: usize, expected: usize },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
    #[error("consumption vector has {found} entries, expected {expected}")]
    InvalidVectorLength { found: usize, expected: usize },
}

/// Destination for a finished table.
pub trait TableSink {
    fn write_table(&mut self, table: &ConsumptionTable) -> Result<(), ExportError>;
}

/// Writes the table to a CSV file, replacing it atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvTableSink {
    path: PathBuf,
}

impl CsvTableSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TableSink for CsvTableSink {
    fn write_table(&mut self, table: &ConsumptionTable) -> Result<(), ExportError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| ExportError::InvalidPath(self.path.clone()))?;
        let tmp_path = self.path.with_file_name(format!("{file_name}.tmp"));

        if let Err(err) = write_and_replace(&tmp_path, &self.path, table) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        info!(
            component = "export",
            event = "export.written",
            path = %self.path.display(),
            rows = table.len()
        );
        Ok(())
    }
}

fn write_and_replace(
    tmp_path: &Path,
    path: &Path,
    table: &ConsumptionTable,
) -> Result<(), ExportError> {
    {
        let file = fs::File::create(tmp_path)?;
        let file = write_table_csv(file, table)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Encodes `table` into `writer` and hands the writer back once flushed.
pub fn write_table_csv<W: Write>(writer: W, table: &ConsumptionTable) -> Result<W, ExportError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(TABLE_HEADERS)?;

    for row in table.rows() {
        let consumptions = serde_json::to_string(&row.consumptions)?;
        csv_writer.write_record([
            row.day.format(DAY_FORMAT).to_string(),
            row.building_id.to_string(),
            consumptions,
        ])?;
    }

    csv_writer.flush()?;
    csv_writer
        .into_inner()
        .map_err(|err| ExportError::Io(io::Error::new(err.error().kind(), err.error().to_string())))
}

pub fn read_table_csv<R: Read>(reader: R) -> Result<ConsumptionTable, ExportError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);

    let headers = csv_reader.headers()?;
    if headers.iter().ne(TABLE_HEADERS) {
        return Err(ExportError::UnexpectedHeader {
            found: headers.iter().map(str::to_string).collect(),
            expected: TABLE_HEADERS.iter().map(|h| h.to_string()).collect(),
        });
    }

    let mut rows = Vec::new();
    for record in csv_reader.records() {
        rows.push(parse_table_record(&record?)?);
    }
    Ok(ConsumptionTable::from_rows(rows))
}

pub fn read_table_file(path: &Path) -> Result<ConsumptionTable, ExportError> {
    read_table_csv(fs::File::open(path)?)
}

fn parse_table_record(record: &StringRecord) -> Result<TableRow, ExportError> {
    if record.len() != TABLE_HEADERS.len() {
        return Err(ExportError::InvalidRecordColumns {
            found: record.len(),
            expected: TABLE_HEADERS.len(),
        });
    }

    let raw_day = record.get(0).unwrap_or_default();
    let day = NaiveDate::parse_from_str(raw_day, DAY_FORMAT).map_err(|_| ExportError::ParseField {
        field: "day",
        value: raw_day.to_string(),
    })?;

    let raw_building = record.get(1).unwrap_or_default();
    let building_id = raw_building
        .parse::<i64>()
        .map_err(|_| ExportError::ParseField {
            field: "building_id",
            value: raw_building.to_string(),
        })?;

    let values: Vec<Option<f64>> = serde_json::from_str(record.get(2).unwrap_or_default())?;
    if values.len() != HOURS_PER_DAY {
        return Err(ExportError::InvalidVectorLength {
            found: values.len(),
            expected: HOURS_PER_DAY,
        });
    }
    let mut consumptions: DayVector = [None; HOURS_PER_DAY];
    consumptions.copy_from_slice(&values);

    Ok(TableRow {
        day,
        building_id,
        consumptions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use tempfile::tempdir;

    fn sample_table() -> ConsumptionTable {
        let mut consumptions = [Some(1.25); HOURS_PER_DAY];
        consumptions[0] = None;
        consumptions[7] = Some(0.1);
        consumptions[23] = None;
        ConsumptionTable::from_rows(vec![
            TableRow {
                day: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                building_id: 3,
                consumptions,
            },
            TableRow {
                day: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                building_id: 3,
                consumptions: [None; HOURS_PER_DAY],
            },
        ])
    }

    #[test]
    fn csv_keeps_missing_distinct_from_values() {
        let table = sample_table();
        let bytes = write_table_csv(Vec::new(), &table).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();

        assert!(text.starts_with("day,building_id,consumptions\n"));
        assert!(text.contains("2024-01-01,3,\"[null,1.25,"));

        let decoded = read_table_csv(bytes.as_slice()).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn every_data_line_has_the_row_shape() {
        let bytes = write_table_csv(Vec::new(), &sample_table()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let re = Regex::new(r#"^\d{4}-\d{2}-\d{2},\d+,"\[((null|[0-9.]+),){23}(null|[0-9.]+)\]"$"#)
            .unwrap();

        let lines: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert!(re.is_match(line), "unexpected row: {line}");
        }
    }

    #[test]
    fn sink_writes_file_atomically() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("out").join("raw_consumptions.csv");
        let mut sink = CsvTableSink::new(&path);

        sink.write_table(&sample_table()).unwrap();

        assert!(path.exists());
        assert!(!path.with_file_name("raw_consumptions.csv.tmp").exists());
        assert_eq!(read_table_file(&path).unwrap(), sample_table());
    }

    #[test]
    fn failed_replace_removes_tmp_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("raw_consumptions.csv");
        fs::create_dir_all(path.join("occupied")).unwrap();
        let mut sink = CsvTableSink::new(&path);

        let err = sink.write_table(&sample_table()).unwrap_err();

        assert!(matches!(err, ExportError::Io(_)));
        assert!(path.is_dir());
        assert!(!path.with_file_name("raw_consumptions.csv.tmp").exists());
    }

    #[test]
    fn reader_rejects_wrong_header_and_short_vectors() {
        let err = read_table_csv("date,id,values\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ExportError::UnexpectedHeader { .. }));

        let short = "day,building_id,consumptions\n2024-01-01,3,\"[1.0,null]\"\n";
        let err = read_table_csv(short.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ExportError::InvalidVectorLength {
                found: 2,
                expected: 24
            }
        ));

        let bad_day = "day,building_id,consumptions\n01/01/2024,3,\"[]\"\n";
        let err = read_table_csv(bad_day.as_bytes()).unwrap_err();
        assert!(matches!(err, ExportError::ParseField { field: "day", .. }));
    }
}
