//! Shared message types
//!
//! Payloads that the dispatch core itself produces, as opposed to the
//! application messages it only routes.

use serde::{Deserialize, Serialize};

use crate::codec::Envelope;
use crate::constants::CMD_NODE_REPORT;
use crate::error::Result;

/// One named series in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub key: String,

    #[serde(default)]
    pub value: Vec<u64>,
}

/// Best-effort report sent to the reporting sink
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub records: Vec<ReportRecord>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, builder style.
    pub fn record(mut self, key: impl Into<String>, value: Vec<u64>) -> Self {
        self.records.push(ReportRecord {
            key: key.into(),
            value,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Wrap the report as a framed message with the report command id.
    pub fn to_envelope(&self, seq: u32) -> Result<Envelope> {
        Ok(Envelope::message(CMD_NODE_REPORT, seq, serde_json::to_value(self)?))
    }
}
