use crate::config::AgentConfig;
use crate::errors::{Error, Result};
use crate::link::{CloudLink, LinkEvent, ReportedStateChannel, TelemetryUplink};
use crate::model::{MethodInvocation, MethodResult, ReportedProperties};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const API_VERSION: &str = "2021-04-12";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const METHOD_PREFIX: &str = "$iothub/methods/POST/";
const SUBSCRIPTIONS: [&str; 3] = [
    "$iothub/twin/res/#",
    "$iothub/twin/PATCH/properties/desired/#",
    "$iothub/methods/POST/#",
];

#[derive(Debug)]
struct TwinResponse {
    status: u16,
    body: Vec<u8>,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<TwinResponse>>>>;

/// Inbound topics the agent cares about
#[derive(Debug, PartialEq, Eq)]
enum Inbound<'a> {
    TwinResponse { status: u16, request_id: &'a str },
    Desired,
    Method { name: &'a str, request_id: &'a str },
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn parse_topic(topic: &str) -> Option<Inbound<'_>> {
    if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        let (status, query) = rest.split_once('/')?;
        return Some(Inbound::TwinResponse {
            status: status.parse().ok()?,
            request_id: query_param(query, "$rid")?,
        });
    }
    if topic.starts_with(DESIRED_PREFIX) {
        return Some(Inbound::Desired);
    }
    if let Some(rest) = topic.strip_prefix(METHOD_PREFIX) {
        let (name, query) = rest.split_once('/')?;
        return Some(Inbound::Method {
            name,
            request_id: query_param(query, "$rid")?,
        });
    }
    None
}

fn telemetry_topic(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

fn method_response_topic(status: u16, request_id: &str) -> String {
    format!("$iothub/methods/res/{}/?$rid={}", status, request_id)
}

/// [`CloudLink`] over an IoT-hub style MQTT topic layout
pub struct MqttLink {
    client: AsyncClient,
    device_id: String,
    pending: Pending,
    twin_timeout: Duration,
}

impl MqttLink {
    pub fn new(config: &AgentConfig) -> (Self, EventLoop) {
        let connection = &config.connection;
        info!(
            "Connecting to {}:{} as {}",
            connection.host_name, config.mqtt_port, connection.device_id
        );

        let mut mqtt_options = MqttOptions::new(
            connection.device_id.clone(),
            connection.host_name.clone(),
            config.mqtt_port,
        );
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options.set_credentials(
            format!(
                "{}/{}/?api-version={}",
                connection.host_name, connection.device_id, API_VERSION
            ),
            config.sas_token.clone().unwrap_or_default(),
        );
        if config.tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        // queued ahead of any twin request so responses are not missed
        subscribe_all(&client);

        let link = Self {
            client,
            device_id: connection.device_id.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            twin_timeout: config.twin_timeout,
        };
        (link, eventloop)
    }

    /// Drive the connection, forwarding inbound traffic to `tx`
    pub fn spawn_event_loop(
        &self,
        eventloop: EventLoop,
        tx: mpsc::Sender<LinkEvent>,
        max_errors: u32,
    ) -> JoinHandle<()> {
        tokio::spawn(run_event_loop(
            eventloop,
            self.client.clone(),
            self.pending.clone(),
            tx,
            max_errors,
        ))
    }

    async fn twin_request(&self, prefix: &str, body: Vec<u8>) -> Result<TwinResponse> {
        let request_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id.clone(), tx);

        let topic = format!("{}?$rid={}", prefix, request_id);
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, body)
            .await
        {
            lock(&self.pending).remove(&request_id);
            return Err(Error::Mqtt(e));
        }

        match tokio::time::timeout(self.twin_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                lock(&self.pending).remove(&request_id);
                Err(Error::Timeout("twin response"))
            }
        }
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<TwinResponse>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl TelemetryUplink for MqttLink {
    async fn send_event(&self, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(telemetry_topic(&self.device_id), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(Error::Mqtt)
    }
}

#[async_trait]
impl ReportedStateChannel for MqttLink {
    async fn report(&self, reported: &ReportedProperties) -> Result<()> {
        let body = serde_json::to_vec(reported)?;
        let response = self
            .twin_request("$iothub/twin/PATCH/properties/reported/", body)
            .await?;
        match response.status {
            200 | 204 => Ok(()),
            status => Err(Error::TwinStatus(status)),
        }
    }
}

#[async_trait]
impl CloudLink for MqttLink {
    async fn get_twin(&self) -> Result<Value> {
        let response = self.twin_request("$iothub/twin/GET/", Vec::new()).await?;
        if response.status != 200 {
            return Err(Error::TwinStatus(response.status));
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn respond(&self, request_id: &str, result: &MethodResult) -> Result<()> {
        let body = serde_json::to_vec(&result.body())?;
        self.client
            .publish(
                method_response_topic(result.status_code, request_id),
                QoS::AtLeastOnce,
                false,
                body,
            )
            .await
            .map_err(Error::Mqtt)
    }

    async fn close(&self) -> Result<()> {
        info!("Closing MQTT connection");
        self.client.disconnect().await.map_err(Error::Mqtt)
    }
}

fn subscribe_all(client: &AsyncClient) {
    for topic in SUBSCRIPTIONS {
        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
            error!("Failed to subscribe to {}: {}", topic, e);
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    pending: Pending,
    tx: mpsc::Sender<LinkEvent>,
    max_errors: u32,
) {
    let mut failures = 0u32;
    let mut connected_once = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                failures = 0;
                info!("Connected to hub");
                // clean sessions drop subscriptions on every reconnect
                if connected_once {
                    subscribe_all(&client);
                }
                connected_once = true;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                if !route_publish(&publish.topic, &publish.payload, &pending, &tx) {
                    info!("Session gone, stopping MQTT event loop");
                    return;
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                info!("MQTT disconnect requested");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                error!("MQTT error ({}/{}): {}", failures, max_errors, e);
                if failures >= max_errors {
                    let _ = tx.send(LinkEvent::TransportError(e.to_string())).await;
                    return;
                }
                // rumqttc reconnects on the next poll
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Dispatch one inbound publish. Returns false once the session has gone away.
/// Never waits on the session: when its queue is full the event is dropped so
/// twin responses behind it keep flowing.
fn route_publish(
    topic: &str,
    payload: &[u8],
    pending: &Pending,
    tx: &mpsc::Sender<LinkEvent>,
) -> bool {
    let event = match parse_topic(topic) {
        Some(Inbound::TwinResponse { status, request_id }) => {
            match lock(pending).remove(request_id) {
                Some(waiter) => {
                    let _ = waiter.send(TwinResponse {
                        status,
                        body: payload.to_vec(),
                    });
                }
                None => debug!("Unmatched twin response {}", request_id),
            }
            return true;
        }
        Some(Inbound::Desired) => match serde_json::from_slice::<Value>(payload) {
            Ok(delta) => LinkEvent::DesiredProperties(delta),
            Err(e) => {
                warn!("Malformed desired properties: {}", e);
                return true;
            }
        },
        Some(Inbound::Method { name, request_id }) => {
            let body = if payload.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(payload).unwrap_or_else(|e| {
                    warn!("Malformed payload for method '{}': {}", name, e);
                    Value::Null
                })
            };
            LinkEvent::MethodCall {
                request_id: request_id.to_string(),
                invocation: MethodInvocation::new(name, body),
            }
        }
        None => {
            debug!("Ignoring message on topic {}", topic);
            return true;
        }
    };

    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!("Session queue full, dropping {:?}", event);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;
    use serde_json::json;

    #[test]
    fn test_parse_twin_response() {
        assert_eq!(
            parse_topic("$iothub/twin/res/204/?$rid=abc&$version=3"),
            Some(Inbound::TwinResponse {
                status: 204,
                request_id: "abc"
            })
        );
    }

    #[test]
    fn test_parse_method_and_desired() {
        assert_eq!(
            parse_topic("$iothub/methods/POST/LightBlink/?$rid=7"),
            Some(Inbound::Method {
                name: "LightBlink",
                request_id: "7"
            })
        );
        assert_eq!(
            parse_topic("$iothub/twin/PATCH/properties/desired/?$version=12"),
            Some(Inbound::Desired)
        );
    }

    #[test]
    fn test_parse_unknown_topics() {
        assert_eq!(parse_topic("telemetry/dev-1"), None);
        assert_eq!(parse_topic("$iothub/twin/res/abc/?$rid=1"), None);
        assert_eq!(parse_topic("$iothub/methods/POST/LightBlink/"), None);
    }

    #[test]
    fn test_outbound_topics() {
        assert_eq!(telemetry_topic("pi-1"), "devices/pi-1/messages/events/");
        assert_eq!(method_response_topic(500, "9"), "$iothub/methods/res/500/?$rid=9");
    }

    #[test]
    fn test_route_method_call() {
        let pending: Pending = Arc::default();
        let (tx, mut rx) = mpsc::channel(4);

        let payload = serde_json::to_vec(&json!({"LightStatusValue": 1})).unwrap();
        assert!(route_publish("$iothub/methods/POST/ChangeLightStatus/?$rid=42", &payload, &pending, &tx));

        match rx.try_recv().unwrap() {
            LinkEvent::MethodCall { request_id, invocation } => {
                assert_eq!(request_id, "42");
                assert_eq!(invocation.method_name, "ChangeLightStatus");
                assert_eq!(invocation.payload["LightStatusValue"], 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_route_twin_response_completes_waiter() {
        let pending: Pending = Arc::default();
        let (tx, _rx) = mpsc::channel(4);
        let (waiter, mut response) = oneshot::channel();
        lock(&pending).insert("r1".to_string(), waiter);

        assert!(route_publish("$iothub/twin/res/200/?$rid=r1", b"{}", &pending, &tx));

        assert_eq!(response.try_recv().unwrap().status, 200);
        assert!(lock(&pending).is_empty());
    }

    #[test]
    fn test_route_reports_closed_session() {
        let pending: Pending = Arc::default();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        let delta = br#"{"TelemetryInterval": 5}"#;
        assert!(!route_publish("$iothub/twin/PATCH/properties/desired/?$version=2", delta, &pending, &tx));
    }

    #[test]
    fn test_full_session_queue_does_not_block_twin_responses() {
        let pending: Pending = Arc::default();
        let (tx, mut rx) = mpsc::channel(1);

        let delta = br#"{"TelemetryInterval": 5}"#;
        assert!(route_publish("$iothub/twin/PATCH/properties/desired/?$version=2", delta, &pending, &tx));
        // queue is now full; this one is dropped
        assert!(route_publish("$iothub/methods/POST/LightBlink/?$rid=8", b"", &pending, &tx));

        let (waiter, mut response) = oneshot::channel();
        lock(&pending).insert("r2".to_string(), waiter);
        assert!(route_publish("$iothub/twin/res/204/?$rid=r2", b"", &pending, &tx));
        assert_eq!(response.try_recv().unwrap().status, 204);

        assert!(matches!(rx.try_recv(), Ok(LinkEvent::DesiredProperties(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_twin_request_times_out() {
        // nothing polls the event loop, so no response can ever arrive
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("pi-1", "127.0.0.1", 1), 10);
        let link = MqttLink {
            client,
            device_id: "pi-1".to_string(),
            pending: Arc::default(),
            twin_timeout: Duration::from_secs(10),
        };

        let result = link.get_twin().await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(lock(&link.pending).is_empty());
    }

    #[tokio::test]
    async fn test_event_loop_gives_up_after_max_errors() {
        let args = Args::parse_from([
            "device-agent",
            "--connection-string",
            "HostName=127.0.0.1;DeviceId=pi-1",
            "--mqtt-port",
            "1",
            "--tls",
            "false",
        ]);
        let config = AgentConfig::try_from(&args).unwrap();
        let (link, eventloop) = MqttLink::new(&config);
        let (tx, mut rx) = mpsc::channel(4);

        let handle = link.spawn_event_loop(eventloop, tx, 2);
        tokio::time::timeout(Duration::from_secs(20), handle)
            .await
            .expect("event loop kept retrying")
            .unwrap();

        assert!(matches!(rx.recv().await, Some(LinkEvent::TransportError(_))));
        assert!(rx.recv().await.is_none());
    }
}
