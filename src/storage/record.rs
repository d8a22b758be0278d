//! On-disk record shapes.

use crate::config::StorageFormat;
use crate::data::{ProcessedSample, Vector3};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::debug;

/// Column order of delimited files.
pub const CSV_HEADER: [&str; 19] = [
    "timestamp",
    "acc_x",
    "acc_y",
    "acc_z",
    "acc_x_filtered",
    "acc_y_filtered",
    "acc_z_filtered",
    "vel_x",
    "vel_y",
    "vel_z",
    "disp_x",
    "disp_y",
    "disp_z",
    "disp_magnitude",
    "dominant_freq_x",
    "dominant_freq_y",
    "dominant_freq_z",
    "overall_dominant_freq",
    "rls_warmed_up",
];

/// One delimited row. Field order matches [`CSV_HEADER`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvRow {
    pub timestamp: DateTime<Utc>,
    pub acc_x: f64,
    pub acc_y: f64,
    pub acc_z: f64,
    pub acc_x_filtered: f64,
    pub acc_y_filtered: f64,
    pub acc_z_filtered: f64,
    pub vel_x: f64,
    pub vel_y: f64,
    pub vel_z: f64,
    pub disp_x: f64,
    pub disp_y: f64,
    pub disp_z: f64,
    pub disp_magnitude: f64,
    pub dominant_freq_x: f64,
    pub dominant_freq_y: f64,
    pub dominant_freq_z: f64,
    pub overall_dominant_freq: f64,
    pub rls_warmed_up: bool,
}

impl From<&ProcessedSample> for CsvRow {
    fn from(s: &ProcessedSample) -> Self {
        Self {
            timestamp: s.timestamp,
            acc_x: s.acc_raw.x,
            acc_y: s.acc_raw.y,
            acc_z: s.acc_raw.z,
            acc_x_filtered: s.acc_filtered.x,
            acc_y_filtered: s.acc_filtered.y,
            acc_z_filtered: s.acc_filtered.z,
            vel_x: s.velocity.x,
            vel_y: s.velocity.y,
            vel_z: s.velocity.z,
            disp_x: s.displacement.x,
            disp_y: s.displacement.y,
            disp_z: s.displacement.z,
            disp_magnitude: s.displacement_magnitude,
            dominant_freq_x: s.dominant_freq.x,
            dominant_freq_y: s.dominant_freq.y,
            dominant_freq_z: s.dominant_freq.z,
            overall_dominant_freq: s.overall_dominant_freq,
            rls_warmed_up: s.rls_warmed_up,
        }
    }
}

impl From<CsvRow> for ProcessedSample {
    fn from(r: CsvRow) -> Self {
        Self {
            timestamp: r.timestamp,
            acc_raw: Vector3::new(r.acc_x, r.acc_y, r.acc_z),
            acc_filtered: Vector3::new(r.acc_x_filtered, r.acc_y_filtered, r.acc_z_filtered),
            velocity: Vector3::new(r.vel_x, r.vel_y, r.vel_z),
            displacement: Vector3::new(r.disp_x, r.disp_y, r.disp_z),
            displacement_magnitude: r.disp_magnitude,
            dominant_freq: Vector3::new(r.dominant_freq_x, r.dominant_freq_y, r.dominant_freq_z),
            overall_dominant_freq: r.overall_dominant_freq,
            rls_warmed_up: r.rls_warmed_up,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccelerationRecord {
    pub raw: Vector3,
    pub filtered: Vector3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplacementRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyAnalysis {
    pub dominant_frequencies: Vector3,
    pub overall_dominant: f64,
}

/// Nested structured record, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRecord {
    pub timestamp: DateTime<Utc>,
    pub acceleration: AccelerationRecord,
    pub velocity: Vector3,
    pub displacement: DisplacementRecord,
    pub frequency_analysis: FrequencyAnalysis,
    pub rls_warmed_up: bool,
}

impl From<&ProcessedSample> for JsonRecord {
    fn from(s: &ProcessedSample) -> Self {
        Self {
            timestamp: s.timestamp,
            acceleration: AccelerationRecord {
                raw: s.acc_raw,
                filtered: s.acc_filtered,
            },
            velocity: s.velocity,
            displacement: DisplacementRecord {
                x: s.displacement.x,
                y: s.displacement.y,
                z: s.displacement.z,
                magnitude: s.displacement_magnitude,
            },
            frequency_analysis: FrequencyAnalysis {
                dominant_frequencies: s.dominant_freq,
                overall_dominant: s.overall_dominant_freq,
            },
            rls_warmed_up: s.rls_warmed_up,
        }
    }
}

impl From<JsonRecord> for ProcessedSample {
    fn from(r: JsonRecord) -> Self {
        Self {
            timestamp: r.timestamp,
            acc_raw: r.acceleration.raw,
            acc_filtered: r.acceleration.filtered,
            velocity: r.velocity,
            displacement: Vector3::new(r.displacement.x, r.displacement.y, r.displacement.z),
            displacement_magnitude: r.displacement.magnitude,
            dominant_freq: r.frequency_analysis.dominant_frequencies,
            overall_dominant_freq: r.frequency_analysis.overall_dominant,
            rls_warmed_up: r.rls_warmed_up,
        }
    }
}

/// Bytes written once at the top of a new file.
pub fn encode_preamble(format: StorageFormat) -> AppResult<Vec<u8>> {
    match format {
        StorageFormat::Json => Ok(Vec::new()),
        StorageFormat::Csv => csv_bytes(None),
    }
}

/// Encode one complete record, line terminator included.
pub fn encode_record(format: StorageFormat, sample: &ProcessedSample) -> AppResult<Vec<u8>> {
    match format {
        StorageFormat::Json => {
            let mut line = serde_json::to_vec(&JsonRecord::from(sample))?;
            line.push(b'\n');
            Ok(line)
        }
        StorageFormat::Csv => csv_bytes(Some(&CsvRow::from(sample))),
    }
}

/// The header line when `row` is `None`, otherwise the row.
#[cfg(feature = "storage_csv")]
fn csv_bytes(row: Option<&CsvRow>) -> AppResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(256));
    let written = match row {
        Some(row) => writer.serialize(row),
        None => writer.write_record(CSV_HEADER),
    };
    written.map_err(|e| DaqError::Serialization(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| DaqError::Serialization(e.to_string()))
}

#[cfg(not(feature = "storage_csv"))]
fn csv_bytes(_row: Option<&CsvRow>) -> AppResult<Vec<u8>> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

/// Read every record of a data file back.
pub fn read_records(path: &Path, format: StorageFormat) -> AppResult<Vec<ProcessedSample>> {
    read_file(path, format, false)
}

/// Read records up to the first malformed one, such as a line cut short by
/// a crash.
pub fn read_intact_records(path: &Path, format: StorageFormat) -> AppResult<Vec<ProcessedSample>> {
    read_file(path, format, true)
}

fn read_file(path: &Path, format: StorageFormat, stop_at_damage: bool) -> AppResult<Vec<ProcessedSample>> {
    let file = std::fs::File::open(path)
        .map_err(|e| DaqError::Storage(format!("open {}: {e}", path.display())))?;
    let mut out = Vec::new();
    let damage = match format {
        StorageFormat::Json => read_json(file, &mut out),
        StorageFormat::Csv => read_csv(file, &mut out)?,
    };
    match damage {
        Some(e) if stop_at_damage => {
            debug!(file = %path.display(), records = out.len(), error = %e, "Data file ends in a damaged record");
            Ok(out)
        }
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Appends records to `out`; returns the error that stopped reading, if any.
fn read_json(file: std::fs::File, out: &mut Vec<ProcessedSample>) -> Option<DaqError> {
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => return Some(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRecord>(&line) {
            Ok(record) => out.push(record.into()),
            Err(e) => return Some(e.into()),
        }
    }
    None
}

#[cfg(feature = "storage_csv")]
fn read_csv(file: std::fs::File, out: &mut Vec<ProcessedSample>) -> AppResult<Option<DaqError>> {
    let mut reader = csv::Reader::from_reader(file);
    for row in reader.deserialize::<CsvRow>() {
        match row {
            Ok(row) => out.push(row.into()),
            Err(e) => return Ok(Some(DaqError::Serialization(e.to_string()))),
        }
    }
    Ok(None)
}

#[cfg(not(feature = "storage_csv"))]
fn read_csv(_file: std::fs::File, _out: &mut Vec<ProcessedSample>) -> AppResult<Option<DaqError>> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProcessedSample {
        ProcessedSample {
            timestamp: "2024-06-15T13:45:30.125Z".parse().unwrap(),
            acc_raw: Vector3::new(9.8, 0.0, -0.1),
            acc_filtered: Vector3::new(9.7, 0.0, -0.1),
            velocity: Vector3::new(0.01, 0.02, 0.03),
            displacement: Vector3::new(0.001, 0.0, 0.0),
            displacement_magnitude: 0.001,
            dominant_freq: Vector3::new(1.5, 0.0, 3.0),
            overall_dominant_freq: 3.0,
            rls_warmed_up: true,
        }
    }

    #[test]
    fn json_record_is_nested() {
        let line = encode_record(StorageFormat::Json, &sample()).unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');
        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["acceleration"]["raw"]["x"], 9.8);
        assert_eq!(value["displacement"]["magnitude"], 0.001);
        assert_eq!(value["frequency_analysis"]["overall_dominant"], 3.0);
        assert_eq!(value["frequency_analysis"]["dominant_frequencies"]["z"], 3.0);
        assert_eq!(value["rls_warmed_up"], true);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_header_and_row_align() {
        let header = String::from_utf8(encode_preamble(StorageFormat::Csv).unwrap()).unwrap();
        assert_eq!(header.trim_end(), CSV_HEADER.join(","));
        let row = String::from_utf8(encode_record(StorageFormat::Csv, &sample()).unwrap()).unwrap();
        assert_eq!(row.trim_end().split(',').count(), CSV_HEADER.len());
        assert!(row.trim_end().ends_with("true"));
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn csv_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let mut bytes = encode_preamble(StorageFormat::Csv).unwrap();
        bytes.extend(encode_record(StorageFormat::Csv, &sample()).unwrap());
        std::fs::write(&path, bytes).unwrap();
        let records = read_records(&path, StorageFormat::Csv).unwrap();
        assert_eq!(records, vec![sample()]);
    }

    #[test]
    fn torn_last_line_is_tolerated_only_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        let mut bytes = encode_record(StorageFormat::Json, &sample()).unwrap();
        bytes.extend(encode_record(StorageFormat::Json, &sample()).unwrap());
        let torn = encode_record(StorageFormat::Json, &sample()).unwrap();
        bytes.extend(&torn[..torn.len() / 2]);
        std::fs::write(&path, bytes).unwrap();

        assert!(read_records(&path, StorageFormat::Json).is_err());
        assert_eq!(read_intact_records(&path, StorageFormat::Json).unwrap().len(), 2);
    }
}
