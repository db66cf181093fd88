/// Fire-and-forget hand-off of readings and status events to the sink
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::{broadcast, mpsc};

use crate::models::DecodedReading;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

enum Job {
    Reading(DecodedReading),
    Status(TelemetryEvent),
}

/// Cloneable handle; every call enqueues and returns immediately
#[derive(Clone)]
pub struct TelemetryEmitter {
    jobs: mpsc::UnboundedSender<Job>,
    events: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryEmitter {
    /// Start the worker task that drains the queue into the sink
    pub fn spawn(sink: Arc<dyn TelemetrySink>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let worker_events = events.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let event = match job {
                    Job::Reading(reading) => match sink.store(&reading).await {
                        Ok(record) => TelemetryEvent::ReadingStored(record),
                        Err(e) => {
                            error!(
                                "Failed to store {} reading from {}: {}",
                                reading.kind(),
                                reading.device_address,
                                e
                            );
                            continue;
                        }
                    },
                    Job::Status(event) => event,
                };

                if let Err(e) = sink.publish(&event).await {
                    warn!("Failed to publish telemetry event: {}", e);
                }
                // No listeners is fine
                let _ = worker_events.send(event);
            }
            debug!("Telemetry emitter stopped");
        });

        Self { jobs, events }
    }

    /// Hand one accepted, de-duplicated reading downstream
    pub fn emit(&self, reading: DecodedReading) {
        if self.jobs.send(Job::Reading(reading)).is_err() {
            warn!("Telemetry worker is gone, dropping reading");
        }
    }

    pub fn emit_status(&self, event: TelemetryEvent) {
        if self.jobs.send(Job::Status(event)).is_err() {
            warn!("Telemetry worker is gone, dropping status event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LinkStatus, Measurement};
    use crate::testing::{wait_for_event, RecordingSink};
    use time::OffsetDateTime;

    fn reading(bpm: u16) -> DecodedReading {
        DecodedReading {
            device_address: "AA:BB:CC:DD:EE:FF".to_string(),
            observed_at: OffsetDateTime::UNIX_EPOCH,
            measurement: Measurement::HeartRate { bpm },
        }
    }

    #[tokio::test]
    async fn readings_are_stored_then_broadcast() {
        let sink = Arc::new(RecordingSink::default());
        let emitter = TelemetryEmitter::spawn(sink.clone());
        let mut events = emitter.subscribe();

        emitter.emit(reading(70));

        let event = wait_for_event(&mut events, |e| matches!(e, TelemetryEvent::ReadingStored(_))).await;
        match event {
            TelemetryEvent::ReadingStored(record) => assert_eq!(record.reading, reading(70)),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(sink.readings().await, vec![reading(70)]);
    }

    #[tokio::test]
    async fn sink_failures_do_not_stop_the_worker() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_next_store();
        let emitter = TelemetryEmitter::spawn(sink.clone());
        let mut events = emitter.subscribe();

        emitter.emit(reading(70));
        emitter.emit(reading(71));

        let event = wait_for_event(&mut events, |e| matches!(e, TelemetryEvent::ReadingStored(_))).await;
        match event {
            TelemetryEvent::ReadingStored(record) => assert_eq!(record.reading, reading(71)),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(sink.readings().await, vec![reading(71)]);
    }

    #[tokio::test]
    async fn status_events_reach_sink_and_listeners() {
        let sink = Arc::new(RecordingSink::default());
        let emitter = TelemetryEmitter::spawn(sink.clone());
        let mut events = emitter.subscribe();

        let status = TelemetryEvent::ConnectionStatusChanged {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            status: LinkStatus::Connected,
        };
        emitter.emit_status(status.clone());

        assert_eq!(events.recv().await.unwrap(), status);
        assert_eq!(sink.published().await, vec![status]);
    }
}
