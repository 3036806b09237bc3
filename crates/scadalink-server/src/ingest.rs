//! Device observation ingest.
//!
//! Observations reported by the device stack are written to the fast store
//! (which triggers push delivery through the keyspace feed) and appended to
//! the time-series store (which serves poll delivery and history).

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use scadalink_core::{PointId, PointValue, RtuAddress, TimeSeriesRecord};

use crate::backend::{FastStore, TimeSeriesStore};
use crate::error::StoreError;

/// A single value reported by an RTU.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub rtu: RtuAddress,
    pub ioa: String,
    pub value: PointValue,
    /// ASDU type identifier, e.g. `M_ME_NB_1`.
    pub asdu: String,
}

impl Observation {
    pub fn point_id(&self) -> PointId {
        PointId::new(self.rtu.to_string(), self.ioa.clone())
    }
}

pub struct Ingestor {
    fast: Arc<dyn FastStore>,
    timeseries: Arc<dyn TimeSeriesStore>,
}

impl Ingestor {
    pub fn new(fast: Arc<dyn FastStore>, timeseries: Arc<dyn TimeSeriesStore>) -> Self {
        Self { fast, timeseries }
    }

    /// Store one observation.
    pub async fn ingest(&self, observation: Observation) -> Result<(), StoreError> {
        let point = observation.point_id();
        trace!(point = %point, value = %observation.value.to_raw(), "Observation");

        // ASDU first: the value write is what wakes push subscribers.
        self.fast
            .set(&point.asdu_key(), &observation.asdu)
            .await?;
        self.fast
            .set(&point.value_key(), &observation.value.to_raw())
            .await?;

        let record = TimeSeriesRecord::good(
            &point,
            observation.value,
            observation.asdu,
            Utc::now().timestamp_millis(),
        );
        self.timeseries.append(record).await
    }

    /// Consume observations until the channel closes or `cancel` fires.
    pub async fn run(self, mut observations: mpsc::Receiver<Observation>, cancel: CancellationToken) {
        loop {
            let observation = tokio::select! {
                _ = cancel.cancelled() => break,
                o = observations.recv() => match o {
                    Some(o) => o,
                    None => break,
                },
            };
            let point = observation.point_id();
            if let Err(e) = self.ingest(observation).await {
                warn!(point = %point, error = %e, "Cannot store observation");
            }
        }
        info!("Ingest stopped");
    }
}
