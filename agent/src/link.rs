use crate::errors::Result;
use crate::model::{MethodInvocation, MethodResult, ReportedProperties};
use async_trait::async_trait;
use serde_json::Value;

/// Outbound device-to-cloud messages
#[async_trait]
pub trait TelemetryUplink: Send + Sync {
    async fn send_event(&self, payload: Vec<u8>) -> Result<()>;
}

/// Where the reported half of the twin is patched
#[async_trait]
pub trait ReportedStateChannel: Send + Sync {
    async fn report(&self, reported: &ReportedProperties) -> Result<()>;
}

/// A connected cloud session as seen by the agent
#[async_trait]
pub trait CloudLink: TelemetryUplink + ReportedStateChannel {
    /// Fetch the full twin document
    async fn get_twin(&self) -> Result<Value>;

    async fn respond(&self, request_id: &str, result: &MethodResult) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Inbound events pushed by the link to the session
#[derive(Debug, Clone)]
pub enum LinkEvent {
    DesiredProperties(Value),
    MethodCall {
        request_id: String,
        invocation: MethodInvocation,
    },
    TransportError(String),
}
