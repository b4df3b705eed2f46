//! Dataset reads from HDF5 resources through the service's `h5p` endpoint.

use anyhow::{Result, bail};
use serde::{Serialize, Serializer};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

use crate::client::Client;
use crate::record::{FieldType, FieldValue, Record, read_scalar};

/// Read every row of the dataset.
pub const ALL_ROWS: i64 = -1;

/// How the server should interpret the dataset values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Text = 0,
    Real = 1,
    Integer = 2,
    Dynamic = 3,
}

impl Serialize for ValueType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(*self as i32)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct H5Dataset {
    pub dataset: String,
    pub datatype: ValueType,
    pub col: i64,
    pub startrow: i64,
    pub numrows: i64,
}

impl H5Dataset {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            datatype: ValueType::Dynamic,
            col: 0,
            startrow: 0,
            numrows: ALL_ROWS,
        }
    }

    pub fn with_datatype(mut self, datatype: ValueType) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_rows(mut self, startrow: i64, numrows: i64) -> Self {
        self.startrow = startrow;
        self.numrows = numrows;
        self
    }

    pub fn with_col(mut self, col: i64) -> Self {
        self.col = col;
        self
    }
}

impl Client {
    /// Reads several datasets from one resource in a single request.
    ///
    /// Returns the values of each dataset keyed by dataset name.
    pub fn h5p(
        &self,
        datasets: &[H5Dataset],
        resource: &str,
        asset: &str,
    ) -> Result<HashMap<String, Vec<FieldValue>>> {
        if resource.trim().is_empty() {
            bail!("resource identifiers must be non-empty");
        }

        let rqst = json!({
            "asset": asset,
            "resource": resource,
            "datasets": datasets,
        });
        let rsps = self.source("h5p", &rqst, true)?.into_records()?;

        let mut results = HashMap::new();
        for rec in rsps.iter().filter(|r| r.rectype == "h5file") {
            let (name, values) = h5file_values(rec)?;
            debug!(dataset = %name, values = values.len(), "h5 dataset received");
            results.insert(name, values);
        }
        Ok(results)
    }

    /// Reads one dataset; an absent dataset yields no values.
    pub fn h5(&self, dataset: &str, resource: &str, asset: &str) -> Result<Vec<FieldValue>> {
        let mut values = self.h5p(&[H5Dataset::new(dataset)], resource, asset)?;
        Ok(values.remove(dataset).unwrap_or_default())
    }
}

fn h5file_values(rec: &Record) -> Result<(String, Vec<FieldValue>)> {
    let name = rec
        .get("dataset")
        .and_then(FieldValue::as_str)
        .unwrap_or_default()
        .to_string();
    let code = rec.get("datatype").and_then(FieldValue::as_i64).unwrap_or(-1);
    let size = rec.get("size").and_then(FieldValue::as_u64).unwrap_or(0) as usize;
    let data = rec
        .get("data")
        .and_then(FieldValue::to_bytes)
        .unwrap_or_default();
    Ok((name, decode_values(&data, code, size)?))
}

/// Interprets `size` bytes of `data` as little-endian values of the coded type.
pub fn decode_values(data: &[u8], code: i64, size: usize) -> Result<Vec<FieldValue>> {
    let Some(ft) = FieldType::from_code(code) else {
        bail!("unknown data type code {}", code);
    };
    let raw = &data[..size.min(data.len())];

    match ft {
        FieldType::Bitfield => bail!("BITFIELD values are not supported"),
        FieldType::String => {
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            Ok(vec![FieldValue::Text(
                String::from_utf8_lossy(&raw[..end]).into_owned(),
            )])
        }
        basic => {
            let width = basic.size().unwrap_or(1);
            Ok(raw
                .chunks_exact(width)
                .map(|b| read_scalar(&basic, b, true))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_with_partial_tail_are_truncated() {
        let mut data = Vec::new();
        data.extend_from_slice(&1.5f64.to_le_bytes());
        data.extend_from_slice(&(-2.0f64).to_le_bytes());
        data.extend_from_slice(&[0xff, 0xff]);

        let values = decode_values(&data, 10, data.len()).unwrap();
        assert_eq!(values, vec![FieldValue::Real(1.5), FieldValue::Real(-2.0)]);
    }

    #[test]
    fn size_limits_the_read() {
        let data = [1u8, 0, 2, 0, 3, 0];
        let values = decode_values(&data, 5, 4).unwrap();
        assert_eq!(values, vec![FieldValue::UInt(1), FieldValue::UInt(2)]);
    }

    #[test]
    fn unknown_codes_fail() {
        assert!(decode_values(&[0; 8], 42, 8).is_err());
        assert!(decode_values(&[0; 8], 8, 8).is_err());
    }

    #[test]
    fn dataset_request_defaults() {
        let ds = H5Dataset::new("ancillary_data/atlas_sdp_gps_epoch");
        assert_eq!(
            serde_json::to_value(&ds).unwrap(),
            json!({
                "dataset": "ancillary_data/atlas_sdp_gps_epoch",
                "datatype": 3,
                "col": 0,
                "startrow": 0,
                "numrows": -1
            })
        );
    }
}
