//! Streaming backend (§4.8).
//!
//! A framed bidirectional WebSocket: the extension sends `{type, payload}`
//! envelopes, the server acks exactly two of them (`start_mission`,
//! `end_mission`). One writer task and one reader task per connection; a
//! single coordinator reconnects with exponential backoff (1s → 30s, up to
//! 10 dials) and replays the cached start-mission message on the first
//! successful redial. Non-uploadable — the server owns persistence.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};
use url::Url;

use crate::backend::StorageBackend;
use crate::domain::*;
use crate::error::RecorderError;
use crate::lifecycle::ShutdownSignal;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SEND_CHANNEL_CAPACITY: usize = 10_000;
const ACK_CHANNEL_CAPACITY: usize = 16;
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct AckEnvelope {
    #[serde(rename = "for")]
    for_type: String,
}

pub struct StreamingBackend {
    url: Url,
    ack_timeout: Duration,
    shutdown: ShutdownSignal,
    send_tx: mpsc::Sender<String>,
    shared_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    ack_tx: mpsc::Sender<AckEnvelope>,
    shared_ack_rx: Arc<Mutex<mpsc::Receiver<AckEnvelope>>>,
    reconnecting: Arc<AtomicBool>,
    cached_start_message: Arc<Mutex<Option<String>>>,
    marker_id_counter: Arc<AtomicI64>,
}

impl StreamingBackend {
    pub fn new(base_url: &str, secret: &str, ack_timeout: Duration, shutdown: ShutdownSignal) -> Result<Self, RecorderError> {
        let mut url = Url::parse(base_url)
            .map_err(|e| RecorderError::Configuration(format!("invalid streaming URL: {e}")))?;
        url.query_pairs_mut().append_pair("secret", secret);

        let (send_tx, send_rx) = mpsc::channel(SEND_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);

        Ok(Self {
            url,
            ack_timeout,
            shutdown,
            send_tx,
            shared_rx: Arc::new(Mutex::new(send_rx)),
            ack_tx,
            shared_ack_rx: Arc::new(Mutex::new(ack_rx)),
            reconnecting: Arc::new(AtomicBool::new(false)),
            cached_start_message: Arc::new(Mutex::new(None)),
            marker_id_counter: Arc::new(AtomicI64::new(0)),
        })
    }

    async fn dial(&self) -> Result<WsStream, RecorderError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| RecorderError::TransientBackend { backend: "streaming", source: e.into() })?;
        Ok(stream)
    }

    fn spawn_connection_tasks(&self, ws: WsStream) {
        let (sink, stream) = ws.split();
        spawn_writer(
            sink,
            self.shared_rx.clone(),
            self.shutdown.clone(),
            self.reconnect_trigger(),
        );
        spawn_reader(stream, self.ack_tx.clone(), self.shutdown.clone(), self.reconnect_trigger());
    }

    fn reconnect_trigger(&self) -> ReconnectTrigger {
        ReconnectTrigger {
            url: self.url.clone(),
            shutdown: self.shutdown.clone(),
            reconnecting: self.reconnecting.clone(),
            shared_rx: self.shared_rx.clone(),
            ack_tx: self.ack_tx.clone(),
            cached_start_message: self.cached_start_message.clone(),
        }
    }

    async fn send_envelope(&self, kind: &'static str, payload: serde_json::Value) -> Result<(), RecorderError> {
        let envelope = WireEnvelope { kind, payload };
        let serialised = serde_json::to_string(&envelope)
            .map_err(|e| RecorderError::TransientBackend { backend: "streaming", source: e.into() })?;
        // Non-blocking enqueue that drops with a warning when full.
        if self.send_tx.try_send(serialised).is_err() {
            warn!(kind, "streaming backend: send channel full, dropping envelope");
        }
        Ok(())
    }

    async fn wait_for_ack(&self, for_type: &'static str) -> Result<(), RecorderError> {
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        let mut rx = self.shared_ack_rx.lock().await;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RecorderError::AckTimeout {
                    envelope_type: for_type,
                    timeout_secs: self.ack_timeout.as_secs(),
                });
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(ack)) if ack.for_type == for_type => return Ok(()),
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(RecorderError::TransientBackend {
                        backend: "streaming",
                        source: anyhow::anyhow!("ack channel closed"),
                    })
                }
                Err(_) => {
                    return Err(RecorderError::AckTimeout {
                        envelope_type: for_type,
                        timeout_secs: self.ack_timeout.as_secs(),
                    })
                }
            }
        }
    }

    /// Assigns the next marker ID for this mission. Restarts at 1 after
    /// `end_mission` resets the counter.
    fn next_marker_id(&self) -> i64 {
        self.marker_id_counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

struct ReconnectTrigger {
    url: Url,
    shutdown: ShutdownSignal,
    reconnecting: Arc<AtomicBool>,
    shared_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    ack_tx: mpsc::Sender<AckEnvelope>,
    cached_start_message: Arc<Mutex<Option<String>>>,
}

impl ReconnectTrigger {
    /// Spawns the reconnect coordinator unless one is already running.
    fn fire(self) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(async move {
            let mut attempt = 0u32;
            let mut delay = INITIAL_BACKOFF;
            loop {
                if self.shutdown.is_shutdown() {
                    break;
                }
                attempt += 1;
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    error!("streaming backend: exhausted reconnect attempts, giving up");
                    break;
                }

                match tokio_tungstenite::connect_async(self.url.as_str()).await {
                    Ok((ws, _)) => {
                        info!(attempt, "streaming backend: reconnected");
                        let (mut sink, stream) = ws.split();

                        if let Some(start_message) = self.cached_start_message.lock().await.clone() {
                            if let Err(e) = sink.send(WsMessage::Text(start_message)).await {
                                warn!(error = %e, "streaming backend: failed to replay start_mission, retrying dial");
                                continue;
                            }
                        }

                        spawn_writer(sink, self.shared_rx.clone(), self.shutdown.clone(), self.fresh_trigger());
                        spawn_reader(stream, self.ack_tx.clone(), self.shutdown.clone(), self.fresh_trigger());
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, backoff = ?delay, "streaming backend: reconnect attempt failed");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(MAX_BACKOFF);
                    }
                }
            }
            self.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    fn fresh_trigger(&self) -> ReconnectTrigger {
        ReconnectTrigger {
            url: self.url.clone(),
            shutdown: self.shutdown.clone(),
            reconnecting: self.reconnecting.clone(),
            shared_rx: self.shared_rx.clone(),
            ack_tx: self.ack_tx.clone(),
            cached_start_message: self.cached_start_message.clone(),
        }
    }
}

fn spawn_writer(
    mut sink: futures_util::stream::SplitSink<WsStream, WsMessage>,
    shared_rx: Arc<Mutex<mpsc::Receiver<String>>>,
    mut shutdown: ShutdownSignal,
    reconnect: ReconnectTrigger,
) {
    tokio::spawn(async move {
        let mut rx = shared_rx.lock().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe_msg = rx.recv() => {
                    let Some(msg) = maybe_msg else { break };
                    let write = sink.send(WsMessage::Text(msg));
                    match tokio::time::timeout(WRITE_DEADLINE, write).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = %e, "streaming backend: write error, triggering reconnect");
                            reconnect.fire();
                            break;
                        }
                        Err(_) => {
                            error!("streaming backend: write deadline exceeded, triggering reconnect");
                            reconnect.fire();
                            break;
                        }
                    }
                }
            }
        }
    });
}

fn spawn_reader(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    ack_tx: mpsc::Sender<AckEnvelope>,
    mut shutdown: ShutdownSignal,
    reconnect: ReconnectTrigger,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match serde_json::from_str::<AckEnvelope>(&text) {
                                Ok(ack) => {
                                    let _ = ack_tx.try_send(ack);
                                }
                                Err(_) => {
                                    // Non-ack frames are diagnostic; log and discard.
                                    tracing::debug!(frame = %text, "streaming backend: non-ack frame");
                                }
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "streaming backend: read error, triggering reconnect");
                            reconnect.fire();
                            break;
                        }
                        None => {
                            error!("streaming backend: connection closed, triggering reconnect");
                            reconnect.fire();
                            break;
                        }
                    }
                }
            }
        }
    });
}

#[async_trait]
impl StorageBackend for StreamingBackend {
    async fn init(&self) -> Result<(), RecorderError> {
        let ws = self.dial().await.map_err(|e| {
            RecorderError::Configuration(format!("streaming backend failed to connect: {e}"))
        })?;
        self.spawn_connection_tasks(ws);
        Ok(())
    }

    async fn close(&self) -> Result<(), RecorderError> {
        Ok(())
    }

    async fn start_mission(&self, mission: Mission, world: World) -> Result<Mission, RecorderError> {
        let payload = serde_json::json!({ "mission": mission, "world": world });
        let envelope = WireEnvelope {
            kind: "start_mission",
            payload,
        };
        let serialised = serde_json::to_string(&envelope)
            .map_err(|e| RecorderError::TransientBackend { backend: "streaming", source: e.into() })?;
        *self.cached_start_message.lock().await = Some(serialised.clone());

        if self.send_tx.try_send(serialised).is_err() {
            warn!("streaming backend: send channel full while starting mission");
        }
        self.wait_for_ack("start_mission").await?;
        Ok(mission)
    }

    async fn end_mission(&self) -> Result<(), RecorderError> {
        self.send_envelope("end_mission", serde_json::Value::Null).await?;
        self.wait_for_ack("end_mission").await?;
        *self.cached_start_message.lock().await = None;
        self.marker_id_counter.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn add_soldier(&self, soldier: Soldier) -> Result<(), RecorderError> {
        self.send_envelope("add_soldier", serde_json::to_value(soldier).unwrap_or_default()).await
    }

    async fn add_vehicle(&self, vehicle: Vehicle) -> Result<(), RecorderError> {
        self.send_envelope("add_vehicle", serde_json::to_value(vehicle).unwrap_or_default()).await
    }

    async fn add_marker(&self, mut marker: Marker) -> Result<i64, RecorderError> {
        marker.marker_id = self.next_marker_id();
        self.send_envelope("add_marker", serde_json::to_value(&marker).unwrap_or_default())
            .await?;
        Ok(marker.marker_id)
    }

    async fn record_soldier_state(&self, state: SoldierState) -> Result<(), RecorderError> {
        self.send_envelope("soldier_state", serde_json::to_value(state).unwrap_or_default()).await
    }

    async fn record_vehicle_state(&self, state: VehicleState) -> Result<(), RecorderError> {
        self.send_envelope("vehicle_state", serde_json::to_value(state).unwrap_or_default()).await
    }

    async fn record_marker_state(&self, state: MarkerState) -> Result<(), RecorderError> {
        self.send_envelope("marker_state", serde_json::to_value(state).unwrap_or_default()).await
    }

    async fn delete_marker(&self, marker_id: i64, end_frame: i64) -> Result<(), RecorderError> {
        self.send_envelope(
            "delete_marker",
            serde_json::json!({ "markerId": marker_id, "endFrame": end_frame }),
        )
        .await
    }

    async fn record_fired_event(&self, event: FiredEvent) -> Result<(), RecorderError> {
        self.send_envelope("fired_event", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_projectile_event(&self, event: ProjectileEvent) -> Result<(), RecorderError> {
        self.send_envelope("projectile_event", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_general_event(&self, event: GeneralEvent) -> Result<(), RecorderError> {
        self.send_envelope("general_event", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_hit_event(&self, event: HitEvent) -> Result<(), RecorderError> {
        self.send_envelope("hit_event", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_kill_event(&self, event: KillEvent) -> Result<(), RecorderError> {
        self.send_envelope("kill_event", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_chat_event(&self, event: ChatEvent) -> Result<(), RecorderError> {
        self.send_envelope("chat_event", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_radio_event(&self, event: RadioEvent) -> Result<(), RecorderError> {
        self.send_envelope("radio_event", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_telemetry_event(&self, event: TelemetryEvent) -> Result<(), RecorderError> {
        self.send_envelope("telemetry", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_time_state(&self, state: TimeState) -> Result<(), RecorderError> {
        self.send_envelope("time_state", serde_json::to_value(state).unwrap_or_default()).await
    }

    async fn record_ace3_death_event(&self, event: Ace3DeathEvent) -> Result<(), RecorderError> {
        self.send_envelope("ace3_death", serde_json::to_value(event).unwrap_or_default()).await
    }

    async fn record_ace3_unconscious_event(&self, event: Ace3UnconsciousEvent) -> Result<(), RecorderError> {
        self.send_envelope("ace3_unconscious", serde_json::to_value(event).unwrap_or_default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serialises_with_type_and_payload_keys() {
        let envelope = WireEnvelope {
            kind: "start_mission",
            payload: serde_json::json!({ "mission": {"missionName": "Op Foo"} }),
        };
        let v: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(v["type"], "start_mission");
        assert_eq!(v["payload"]["mission"]["missionName"], "Op Foo");
    }

    #[test]
    fn ack_envelope_parses_for_field() {
        let ack: AckEnvelope = serde_json::from_str(r#"{"type":"ack","for":"start_mission"}"#).unwrap();
        assert_eq!(ack.for_type, "start_mission");
    }

    #[tokio::test]
    async fn marker_ids_restart_at_one_after_reset() {
        let (_handle, shutdown) = crate::lifecycle::shutdown_channel();
        let backend = StreamingBackend::new("ws://127.0.0.1:0/", "secret", Duration::from_secs(10), shutdown).unwrap();
        assert_eq!(backend.next_marker_id(), 1);
        assert_eq!(backend.next_marker_id(), 2);
        backend.marker_id_counter.store(0, Ordering::SeqCst);
        assert_eq!(backend.next_marker_id(), 1);
    }

    #[test]
    fn reconnect_flag_prevents_concurrent_fires() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!flag.swap(true, Ordering::SeqCst));
        // A second fire before the first clears it must observe `true`.
        assert!(flag.swap(true, Ordering::SeqCst));
    }
}
