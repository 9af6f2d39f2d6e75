use chrono::DateTime;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::config::{validate_output_path, ExportConfig};
use crate::error::Result;
use crate::packet::CapturedPacket;

/// Records produced by one session or ingest pass, in arrival order
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: Vec<CapturedPacket>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CsvRow<'a> {
    source_address: &'a str,
    destination_address: &'a str,
    ip_version: u8,
    header_length: u8,
    total_length: u32,
    identification: u16,
    fragment_offset: u16,
    time_to_live: u8,
    transport_protocol_id: u8,
    transport: &'a str,
    source_port: Option<u16>,
    destination_port: Option<u16>,
    header_checksum: &'a str,
    payload_hex: &'a str,
    arrival_timestamp: String,
    session_elapsed: i64,
    is_attack: bool,
}

fn format_timestamp(micros: i64, format: &str) -> String {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(ts) => ts.format(format).to_string(),
        None => micros.to_string(),
    }
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: CapturedPacket) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CapturedPacket> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Hand every record to `f` in order, leaving the set empty
    pub fn drain_each<F: FnMut(CapturedPacket)>(&mut self, f: F) {
        self.records.drain(..).for_each(f);
    }

    pub fn into_vec(self) -> Vec<CapturedPacket> {
        self.records
    }

    pub fn attack_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_attack).count()
    }

    /// Write one CSV row per record, returning the number of rows
    pub fn write_csv<W: Write>(&self, writer: W, export: &ExportConfig) -> Result<usize> {
        export.validate()?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        for record in &self.records {
            csv_writer.serialize(CsvRow {
                source_address: &record.source_address,
                destination_address: &record.destination_address,
                ip_version: record.ip_version,
                header_length: record.header_length,
                total_length: record.total_length,
                identification: record.identification,
                fragment_offset: record.fragment_offset,
                time_to_live: record.time_to_live,
                transport_protocol_id: record.transport_protocol_id,
                transport: &record.transport,
                source_port: record.source_port,
                destination_port: record.destination_port,
                header_checksum: &record.header_checksum,
                payload_hex: &record.payload_hex,
                arrival_timestamp: format_timestamp(
                    record.arrival_timestamp,
                    &export.timestamp_format,
                ),
                session_elapsed: record.session_elapsed,
                is_attack: record.is_attack,
            })?;
        }

        csv_writer.flush()?;
        Ok(self.records.len())
    }

    pub fn save_csv(&self, path: &Path, export: &ExportConfig) -> Result<usize> {
        validate_output_path(path)?;
        let file = BufWriter::new(File::create(path)?);
        let rows = self.write_csv(file, export)?;
        info!("Wrote {} records to {}", rows, path.display());
        Ok(rows)
    }
}

impl Extend<CapturedPacket> for RecordSet {
    fn extend<T: IntoIterator<Item = CapturedPacket>>(&mut self, iter: T) {
        self.records.extend(iter);
    }
}

impl FromIterator<CapturedPacket> for RecordSet {
    fn from_iter<T: IntoIterator<Item = CapturedPacket>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a CapturedPacket;
    type IntoIter = std::slice::Iter<'a, CapturedPacket>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
