//! Time-series record schema.

use serde::{Deserialize, Serialize};

use crate::point::{PointId, PointValue};

/// One immutable observation as stored in the time-series store.
///
/// `timestamp` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesRecord {
    pub rtu: String,
    pub ioa: String,
    pub value: PointValue,
    #[serde(rename = "ASDU")]
    pub asdu: String,
    pub quality: String,
    pub timestamp: i64,
}

impl TimeSeriesRecord {
    /// Create a record with quality "good" stamped at `timestamp`.
    pub fn good(point: &PointId, value: PointValue, asdu: impl Into<String>, timestamp: i64) -> Self {
        Self {
            rtu: point.rtu().to_string(),
            ioa: point.ioa().to_string(),
            value,
            asdu: asdu.into(),
            quality: "good".to_string(),
            timestamp,
        }
    }

    /// The point this record belongs to.
    pub fn point_id(&self) -> PointId {
        PointId::new(self.rtu.clone(), self.ioa.clone())
    }
}
