/// Everything that leaves the core: readings, status events and their sinks
pub mod debounce;
pub mod emitter;
pub mod pipeline;

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use log::info;

use crate::error::SinkError;
use crate::models::{DecodedReading, LinkStatus, ScanStatus, StoredRecord};
use crate::utils::format_datetime;

pub use debounce::DebounceFilter;
pub use emitter::TelemetryEmitter;
pub use pipeline::ReadingPipeline;

/// Status changes and stored readings fanned out to listeners
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    ConnectionStatusChanged { address: String, status: LinkStatus },
    ScanStatusChanged(ScanStatus),
    DecodeFailed { address: String, error: String },
    ReadingStored(StoredRecord),
}

/// Downstream collaborator that persists and broadcasts what the core emits
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn store(&self, reading: &DecodedReading) -> Result<StoredRecord, SinkError>;

    async fn publish(&self, _event: &TelemetryEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink used when no database is configured: logs readings and numbers them
#[derive(Debug, Default)]
pub struct LogSink {
    next_id: AtomicI64,
}

#[async_trait]
impl TelemetrySink for LogSink {
    async fn store(&self, reading: &DecodedReading) -> Result<StoredRecord, SinkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "Reading #{} from {} at {}: {}",
            id,
            reading.device_address,
            format_datetime(&reading.observed_at),
            reading.measurement
        );
        Ok(StoredRecord {
            id,
            reading: reading.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Measurement;
    use time::OffsetDateTime;

    #[tokio::test]
    async fn log_sink_assigns_sequential_ids() {
        let sink = LogSink::default();
        let reading = DecodedReading {
            device_address: "AA:BB:CC:DD:EE:FF".to_string(),
            observed_at: OffsetDateTime::UNIX_EPOCH,
            measurement: Measurement::HeartRate { bpm: 61 },
        };

        let first = sink.store(&reading).await.unwrap();
        let second = sink.store(&reading).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(second.reading, reading);
    }
}
