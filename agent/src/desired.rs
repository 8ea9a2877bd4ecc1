use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::link::ReportedStateChannel;
use crate::metrics::{DESIRED_UPDATES_TOTAL, REPORT_FAILURES_TOTAL};
use crate::model::{parse_int, DeviceMetadata, ReportedProperties};
use crate::scheduler::IntervalControl;

pub const TELEMETRY_INTERVAL_KEY: &str = "TelemetryInterval";

/// Documents describing the device, shared between the session and the
/// status endpoint
#[derive(Debug, Clone)]
pub struct DeviceDocuments {
    pub metadata: Arc<Mutex<DeviceMetadata>>,
    pub reported: Arc<Mutex<ReportedProperties>>,
}

impl DeviceDocuments {
    pub fn new(metadata: DeviceMetadata, reported: ReportedProperties) -> Self {
        Self {
            metadata: Arc::new(Mutex::new(metadata)),
            reported: Arc::new(Mutex::new(reported)),
        }
    }

    pub fn reported(&self) -> ReportedProperties {
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn metadata(&self) -> DeviceMetadata {
        self.metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_telemetry_interval(&self, seconds: u64) {
        self.metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .device_properties
            .telemetry_interval = seconds;
        self.reported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .config
            .telemetry_interval = seconds;
    }
}

/// Applies desired-state deltas pushed by the cloud
pub struct DesiredStateListener {
    scheduler: Arc<dyn IntervalControl>,
    channel: Arc<dyn ReportedStateChannel>,
    documents: DeviceDocuments,
}

impl DesiredStateListener {
    pub fn new(
        scheduler: Arc<dyn IntervalControl>,
        channel: Arc<dyn ReportedStateChannel>,
        documents: DeviceDocuments,
    ) -> Self {
        Self {
            scheduler,
            channel,
            documents,
        }
    }

    /// Returns the accepted interval, or `None` when the delta carried no
    /// usable `TelemetryInterval`. An error means the interval was applied
    /// but reporting it back failed.
    pub async fn on_desired_property_change(&self, delta: &Value) -> Result<Option<u64>> {
        info!("Received new desired properties: {}", delta);

        let Some(seconds) = delta.get(TELEMETRY_INTERVAL_KEY).and_then(parse_int) else {
            debug!("No telemetry interval in desired delta");
            return Ok(None);
        };
        if seconds <= 0 {
            warn!("Ignoring non-positive telemetry interval {}", seconds);
            return Ok(None);
        }
        if !self.scheduler.reschedule(seconds) {
            warn!("Telemetry interval {} not applied", seconds);
            return Ok(None);
        }

        let seconds = seconds as u64;
        DESIRED_UPDATES_TOTAL.inc();
        self.documents.set_telemetry_interval(seconds);

        let reported = self.documents.reported();
        if let Err(e) = self.channel.report(&reported).await {
            REPORT_FAILURES_TOTAL.inc();
            return Err(e);
        }
        info!("Twin state reported");

        Ok(Some(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::model::SystemInfo;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct RecordingScheduler {
        calls: Mutex<Vec<i64>>,
    }

    impl IntervalControl for RecordingScheduler {
        fn reschedule(&self, seconds: i64) -> bool {
            self.calls.lock().unwrap().push(seconds);
            seconds > 0 && seconds <= crate::scheduler::MAX_INTERVAL_SECS as i64
        }

        fn interval(&self) -> u64 {
            self.calls.lock().unwrap().last().copied().unwrap_or(1) as u64
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        reports: Mutex<Vec<Value>>,
        fail: bool,
    }

    #[async_trait]
    impl ReportedStateChannel for RecordingChannel {
        async fn report(&self, reported: &ReportedProperties) -> Result<()> {
            if self.fail {
                return Err(Error::TwinStatus(500));
            }
            self.reports
                .lock()
                .unwrap()
                .push(serde_json::to_value(reported).unwrap());
            Ok(())
        }
    }

    fn documents() -> DeviceDocuments {
        DeviceDocuments::new(
            DeviceMetadata::new("pi-1", 1),
            ReportedProperties::new(1, SystemInfo::new("1.0".to_string()), BTreeMap::new()),
        )
    }

    fn listener(
        channel: RecordingChannel,
    ) -> (DesiredStateListener, Arc<RecordingScheduler>, Arc<RecordingChannel>, DeviceDocuments) {
        let scheduler = Arc::new(RecordingScheduler::default());
        let channel = Arc::new(channel);
        let documents = documents();
        let listener = DesiredStateListener::new(scheduler.clone(), channel.clone(), documents.clone());
        (listener, scheduler, channel, documents)
    }

    #[test]
    fn test_interval_applied_and_reported() {
        tokio_test::block_on(async {
            let (listener, scheduler, channel, documents) = listener(RecordingChannel::default());

            let applied = listener
                .on_desired_property_change(&json!({"TelemetryInterval": 30, "$version": 4}))
                .await
                .unwrap();

            assert_eq!(applied, Some(30));
            assert_eq!(*scheduler.calls.lock().unwrap(), vec![30]);

            let reports = channel.reports.lock().unwrap();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0]["Config"]["TelemetryInterval"], 30);
            assert_eq!(documents.metadata().device_properties.telemetry_interval, 30);
        });
    }

    #[test]
    fn test_empty_delta_is_ignored() {
        tokio_test::block_on(async {
            let (listener, scheduler, channel, _) = listener(RecordingChannel::default());

            assert_eq!(listener.on_desired_property_change(&json!({})).await.unwrap(), None);
            assert!(scheduler.calls.lock().unwrap().is_empty());
            assert!(channel.reports.lock().unwrap().is_empty());
        });
    }

    #[test]
    fn test_non_positive_and_invalid_are_ignored() {
        tokio_test::block_on(async {
            let (listener, scheduler, channel, documents) = listener(RecordingChannel::default());

            for delta in [
                json!({"TelemetryInterval": 0}),
                json!({"TelemetryInterval": -5}),
                json!({"TelemetryInterval": "soon"}),
                json!({"TelemetryInterval": null}),
            ] {
                assert_eq!(listener.on_desired_property_change(&delta).await.unwrap(), None);
            }

            assert!(scheduler.calls.lock().unwrap().is_empty());
            assert!(channel.reports.lock().unwrap().is_empty());
            assert_eq!(documents.reported().config.telemetry_interval, 1);
        });
    }

    #[test]
    fn test_rejected_interval_is_not_reported() {
        tokio_test::block_on(async {
            let (listener, _, channel, documents) = listener(RecordingChannel::default());

            let applied = listener
                .on_desired_property_change(&json!({"TelemetryInterval": 1e20}))
                .await
                .unwrap();

            assert_eq!(applied, None);
            assert!(channel.reports.lock().unwrap().is_empty());
            assert_eq!(documents.reported().config.telemetry_interval, 1);
            assert_eq!(documents.metadata().device_properties.telemetry_interval, 1);
        });
    }

    #[test]
    fn test_numeric_string_is_accepted() {
        tokio_test::block_on(async {
            let (listener, scheduler, _, _) = listener(RecordingChannel::default());

            let applied = listener
                .on_desired_property_change(&json!({"TelemetryInterval": "15"}))
                .await
                .unwrap();

            assert_eq!(applied, Some(15));
            assert_eq!(*scheduler.calls.lock().unwrap(), vec![15]);
        });
    }

    #[test]
    fn test_string_with_unit_suffix_is_accepted() {
        tokio_test::block_on(async {
            let (listener, scheduler, channel, _) = listener(RecordingChannel::default());

            let applied = listener
                .on_desired_property_change(&json!({"TelemetryInterval": "30s"}))
                .await
                .unwrap();

            assert_eq!(applied, Some(30));
            assert_eq!(*scheduler.calls.lock().unwrap(), vec![30]);
            assert_eq!(channel.reports.lock().unwrap()[0]["Config"]["TelemetryInterval"], 30);
        });
    }

    #[test]
    fn test_report_failure_is_returned_after_reschedule() {
        tokio_test::block_on(async {
            let (listener, scheduler, _, _) = listener(RecordingChannel {
                fail: true,
                ..Default::default()
            });

            let result = listener
                .on_desired_property_change(&json!({"TelemetryInterval": 10}))
                .await;

            assert!(result.is_err());
            assert_eq!(*scheduler.calls.lock().unwrap(), vec![10]);
        });
    }
}
