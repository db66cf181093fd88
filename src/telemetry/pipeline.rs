/// Decode, debounce and emit: the path every notification takes
use log::{debug, warn};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::bluetooth::decoder;
use crate::models::RawNotification;
use crate::telemetry::{DebounceFilter, TelemetryEmitter, TelemetryEvent};

/// Handle for submitting notifications to the pipeline task
#[derive(Clone)]
pub struct ReadingPipeline {
    notifications: mpsc::UnboundedSender<RawNotification>,
}

impl ReadingPipeline {
    /// Start the task that owns the debounce filter
    pub fn spawn(window: Duration, sweep_every: Duration, emitter: TelemetryEmitter) -> Self {
        let (notifications, mut rx) = mpsc::unbounded_channel::<RawNotification>();

        tokio::spawn(async move {
            let mut filter = DebounceFilter::new(window);
            let mut sweep = interval(sweep_every);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    notification = rx.recv() => match notification {
                        Some(notification) => handle(&mut filter, &emitter, notification),
                        None => break,
                    },
                    _ = sweep.tick() => {
                        let evicted = filter.sweep(Instant::now());
                        if evicted > 0 {
                            debug!("Debounce sweep evicted {} entries, {} remain", evicted, filter.len());
                        }
                    }
                }
            }
            debug!("Reading pipeline stopped");
        });

        Self { notifications }
    }

    pub fn submit(&self, notification: RawNotification) {
        if self.notifications.send(notification).is_err() {
            warn!("Reading pipeline is gone, dropping notification");
        }
    }
}

fn handle(filter: &mut DebounceFilter, emitter: &TelemetryEmitter, notification: RawNotification) {
    let reading = match decoder::decode(&notification, OffsetDateTime::now_utc()) {
        Ok(reading) => reading,
        Err(e) => {
            warn!(
                "Dropping malformed notification from {} ({} bytes): {}",
                notification.device_address,
                notification.payload.len(),
                e
            );
            emitter.emit_status(TelemetryEvent::DecodeFailed {
                address: notification.device_address,
                error: e.to_string(),
            });
            return;
        }
    };

    let comparable = reading.measurement.comparable();
    if !filter.accept(&reading.device_address, reading.kind(), comparable) {
        debug!(
            "Suppressed repeated {} from {}",
            reading.measurement, reading.device_address
        );
        return;
    }

    emitter.emit(reading);
}
