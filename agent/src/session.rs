use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::desired::{DesiredStateListener, DeviceDocuments};
use crate::device::Device;
use crate::errors::{Error, Result};
use crate::link::{CloudLink, LinkEvent, TelemetryUplink};
use crate::methods::{apply_firmware, FollowUp, MethodDispatchTable};
use crate::metrics::{REPORT_FAILURES_TOTAL, TELEMETRY_FAILURES_TOTAL, TELEMETRY_SENT_TOTAL};
use crate::model::{DeviceMetadata, ReportedProperties, SystemInfo, TelemetrySample};
use crate::scheduler::{IntervalControl, TelemetryScheduler};

type EmitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub device_id: String,
    pub telemetry_interval: u64,
    pub fatal_report_errors: bool,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Shutdown,
    TransportFailed,
    ReportFailed,
    /// Firmware was replaced; the process should terminate
    FirmwareUpdated,
}

/// One connected agent: telemetry timer, desired-state listener and method
/// table bound to a single link.
pub struct AgentSession<L: CloudLink + 'static> {
    options: SessionOptions,
    device: Arc<dyn Device>,
    link: Arc<L>,
    scheduler: Arc<TelemetryScheduler>,
    listener: DesiredStateListener,
    methods: MethodDispatchTable,
    documents: DeviceDocuments,
}

impl<L: CloudLink + 'static> AgentSession<L> {
    pub fn create(options: SessionOptions, device: Arc<dyn Device>, link: Arc<L>) -> Self {
        let methods = MethodDispatchTable::with_device(device.clone());
        let documents = DeviceDocuments::new(
            DeviceMetadata::new(&options.device_id, options.telemetry_interval),
            ReportedProperties::new(
                options.telemetry_interval,
                SystemInfo::new(device.firmware_version()),
                methods.supported_methods(),
            ),
        );
        let scheduler = Arc::new(TelemetryScheduler::new());
        let listener = DesiredStateListener::new(scheduler.clone(), link.clone(), documents.clone());

        Self {
            options,
            device,
            link,
            scheduler,
            listener,
            methods,
            documents,
        }
    }

    pub fn documents(&self) -> DeviceDocuments {
        self.documents.clone()
    }

    pub fn telemetry_interval(&self) -> u64 {
        self.scheduler.interval()
    }

    /// Send metadata, start telemetry and sync the twin. Fails only when a
    /// reported-state update fails and such failures are fatal.
    pub async fn start(&self) -> Result<()> {
        match serde_json::to_vec(&self.documents.metadata()) {
            Ok(payload) => {
                info!("Sending device metadata");
                if let Err(e) = self.link.send_event(payload).await {
                    error!("send metadata error: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize device metadata: {}", e),
        }

        self.scheduler
            .start(self.options.telemetry_interval, self.emitter());

        let twin = match self.link.get_twin().await {
            Ok(twin) => twin,
            Err(e) => {
                error!("Could not get device twin: {}", e);
                return Ok(());
            }
        };
        info!("Device twin created");

        if let Some(desired) = twin.get("desired") {
            self.apply_desired(desired).await?;
        }
        self.report().await
    }

    /// Consume link events until the session ends
    pub async fn run(&self, mut events: mpsc::Receiver<LinkEvent>) -> SessionExit {
        while let Some(event) = events.recv().await {
            if let Some(exit) = self.handle_event(event).await {
                return exit;
            }
        }

        info!("Link event channel closed");
        self.stop().await;
        SessionExit::Shutdown
    }

    pub async fn handle_event(&self, event: LinkEvent) -> Option<SessionExit> {
        match event {
            LinkEvent::DesiredProperties(delta) => {
                if self.apply_desired(&delta).await.is_err() {
                    self.stop().await;
                    return Some(SessionExit::ReportFailed);
                }
                None
            }
            LinkEvent::MethodCall {
                request_id,
                invocation,
            } => {
                let outcome = self.methods.dispatch(&invocation);

                match self.link.respond(&request_id, &outcome.result).await {
                    Ok(()) => info!(
                        "Response {} to method '{}' sent successfully",
                        outcome.result.status_code, invocation.method_name
                    ),
                    Err(e) => error!("An error occurred when sending a method response: {}", e),
                }

                if outcome.follow_up == FollowUp::ApplyFirmware {
                    apply_firmware(self.device.as_ref());
                    self.stop().await;
                    return Some(SessionExit::FirmwareUpdated);
                }
                None
            }
            LinkEvent::TransportError(e) => {
                error!("client error: {}", e);
                self.stop().await;
                Some(SessionExit::TransportFailed)
            }
        }
    }

    /// Stop telemetry and close the link. Safe to call more than once.
    pub async fn stop(&self) {
        self.scheduler.stop();
        if let Err(e) = self.link.close().await {
            error!("client.close error: {}", e);
        }
    }

    async fn apply_desired(&self, delta: &Value) -> Result<()> {
        match self.listener.on_desired_property_change(delta).await {
            Ok(_) => Ok(()),
            Err(e) => self.report_failed(e),
        }
    }

    async fn report(&self) -> Result<()> {
        match self.link.report(&self.documents.reported()).await {
            Ok(()) => {
                info!("Twin state reported");
                Ok(())
            }
            Err(e) => {
                REPORT_FAILURES_TOTAL.inc();
                self.report_failed(e)
            }
        }
    }

    fn report_failed(&self, e: Error) -> Result<()> {
        error!("Failed to report twin state: {}", e);
        if self.options.fatal_report_errors {
            Err(e)
        } else {
            Ok(())
        }
    }

    fn emitter(&self) -> impl FnMut() -> EmitFuture + Send + 'static {
        let device_id = self.options.device_id.clone();
        let device = self.device.clone();
        let link = self.link.clone();

        move || -> EmitFuture {
            let reading = device.read_sensors();
            let sample = TelemetrySample {
                device_id: device_id.clone(),
                temperature: reading.temperature,
                humidity: reading.humidity,
                timestamp: Utc::now(),
            };
            let link = link.clone();
            Box::pin(async move { send_sample(link.as_ref(), &sample).await })
        }
    }
}

/// Serialize and hand one sample to the uplink. Failures are logged only.
pub async fn send_sample(uplink: &dyn TelemetryUplink, sample: &TelemetrySample) {
    let payload = match serde_json::to_vec(sample) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize telemetry: {}", e);
            return;
        }
    };

    debug!(
        "Sending device event data at {}: {}",
        sample.timestamp,
        String::from_utf8_lossy(&payload)
    );
    match uplink.send_event(payload).await {
        Ok(()) => TELEMETRY_SENT_TOTAL.inc(),
        Err(e) => {
            TELEMETRY_FAILURES_TOTAL.inc();
            error!("send event error: {}", e);
        }
    }
}
