//! Connection manager (C4): WebSocket dial, bounded exponential reconnect,
//! and the outbound buffer (C3) it drains on open.
//!
//! Dials out as a WebSocket client (rather than accepting inbound station
//! connections), with the send/receive pumps split into their own tasks
//! coordinated via `tokio::select!` against the shutdown signal.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::SupervisionUrlDistribution;
use crate::error::TransportError;
use crate::registry::OutboundBuffer;
use crate::support::ocpp_frame::OcppFrame;

pub const OCPP_SUBPROTOCOL_V16: &str = "ocpp1.6";

/// Close codes treated as normal; they do NOT trigger reconnection
/// (spec.md §4.3).
pub const NORMAL_CLOSE_CODES: [u16; 2] = [1000, 1005];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Delay = base · 2^retry + jitter, jitter ∈ [0, 0.2·base·2^retry), capped at `max`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Negative means unbounded.
    pub max_retries: i64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(120),
            max_retries: -1,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = 2u64.saturating_pow(retry.min(32));
        let base_delay = self.base.saturating_mul(exp as u32).min(self.max);
        let jitter_ceiling_ms = (base_delay.as_millis() as f64 * 0.2) as u64;
        let jitter_ms = if jitter_ceiling_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ceiling_ms)
        };
        (base_delay + Duration::from_millis(jitter_ms)).min(self.max)
    }

    pub fn retries_exhausted(&self, retry: u32) -> bool {
        self.max_retries >= 0 && retry as i64 >= self.max_retries
    }
}

/// Selects a supervision URL for a given retry/station index.
pub fn select_url<'a>(
    urls: &'a [String],
    distribution: SupervisionUrlDistribution,
    station_index: u32,
    retry: u32,
) -> Option<&'a str> {
    if urls.is_empty() {
        return None;
    }
    let idx = match distribution {
        SupervisionUrlDistribution::RoundRobin => retry as usize % urls.len(),
        SupervisionUrlDistribution::Random => rand::thread_rng().gen_range(0..urls.len()),
        SupervisionUrlDistribution::ChargingStationAffinity => {
            station_index as usize % urls.len()
        }
    };
    Some(urls[idx].as_str())
}

/// Events produced by the socket pumps, consumed by the station mailbox.
#[derive(Debug)]
pub enum ConnectionEvent {
    Frame(OcppFrame),
    MalformedFrame(String),
    Closed { code: Option<u16> },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns the reconnect state machine and the outbound buffer for one station.
pub struct ConnectionManager {
    state: ConnectionState,
    urls: Vec<String>,
    distribution: SupervisionUrlDistribution,
    station_index: u32,
    station_id: String,
    policy: ReconnectPolicy,
    retry: u32,
    buffer: OutboundBuffer,
    ws_tx: Option<mpsc::UnboundedSender<Message>>,
}

impl ConnectionManager {
    pub fn new(
        station_id: String,
        urls: Vec<String>,
        distribution: SupervisionUrlDistribution,
        station_index: u32,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            urls,
            distribution,
            station_index,
            station_id,
            policy,
            retry: 0,
            buffer: OutboundBuffer::new(),
            ws_tx: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.policy.delay_for(self.retry)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.policy.retries_exhausted(self.retry)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Dial the next supervision URL and, on success, spawn the read/write
    /// pumps. Returns the channel the station mailbox polls for inbound
    /// events.
    pub async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, TransportError> {
        self.state = ConnectionState::Connecting;
        let url = select_url(&self.urls, self.distribution, self.station_index, self.retry)
            .ok_or_else(|| TransportError::ConnectFailed("no supervision urls configured".into()))?;

        let full_url = format!("{}/{}", url.trim_end_matches('/'), self.station_id);
        let mut request = full_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, OCPP_SUBPROTOCOL_V16.parse().unwrap());

        let (ws_stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(OCPP_SUBPROTOCOL_V16) {
            warn!(
                station_id = self.station_id.as_str(),
                accepted,
                "supervision server did not accept ocpp1.6 subprotocol"
            );
        }

        info!(station_id = self.station_id.as_str(), url = full_url.as_str(), "connected");

        self.state = ConnectionState::Connected;
        self.retry = 0;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ws_tx, ws_rx) = mpsc::unbounded_channel::<Message>();
        self.ws_tx = Some(ws_tx);

        spawn_pumps(ws_stream, ws_rx, events_tx, self.station_id.clone());

        self.drain_buffer();

        Ok(events_rx)
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.ws_tx = None;
    }

    pub fn note_retry(&mut self) {
        self.retry = self.retry.saturating_add(1);
    }

    /// Send now if connected; otherwise park in the outbound buffer
    /// (spec.md §4.4 step 3).
    pub fn send_or_buffer(&mut self, frame: OcppFrame) {
        if self.state == ConnectionState::Connected {
            if let Some(tx) = &self.ws_tx {
                let text = frame.serialize();
                if tx.send(Message::Text(text)).is_err() {
                    self.mark_disconnected();
                    self.buffer.push_back(frame);
                }
                return;
            }
        }
        self.buffer.push_back(frame);
    }

    /// Drain the outbound buffer FIFO on connect (spec.md §3/§4.2).
    fn drain_buffer(&mut self) {
        while let Some(entry) = self.buffer.pop_front() {
            if let Some(tx) = &self.ws_tx {
                let text = entry.frame.serialize();
                if tx.send(Message::Text(text)).is_err() {
                    self.buffer.push_front(entry);
                    self.mark_disconnected();
                    break;
                }
            } else {
                self.buffer.push_front(entry);
                break;
            }
        }
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }
}

fn spawn_pumps(
    ws_stream: WsStream,
    mut ws_rx: mpsc::UnboundedReceiver<Message>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    station_id: String,
) {
    let (mut sink, mut stream) = ws_stream.split();

    let send_id = station_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = ws_rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                error!(station_id = send_id.as_str(), error = %e, "send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    debug!(station_id = station_id.as_str(), "<- {}", text);
                    match OcppFrame::parse(&text) {
                        Ok(frame) => {
                            if events_tx.send(ConnectionEvent::Frame(frame)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(station_id = station_id.as_str(), error = %e, "malformed frame");
                            if events_tx
                                .send(ConnectionEvent::MalformedFrame(e.to_string()))
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    let code = frame.map(|f| f.code.into());
                    let _ = events_tx.send(ConnectionEvent::Closed { code });
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Binary(data)) => {
                    warn!(
                        station_id = station_id.as_str(),
                        bytes = data.len(),
                        "binary message ignored"
                    );
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    error!(station_id = station_id.as_str(), error = %e, "websocket error");
                    let _ = events_tx.send(ConnectionEvent::Closed { code: None });
                    break;
                }
            }
        }
    });
}

/// `true` if a close code is one of the "normal" codes that must not
/// trigger reconnection (spec.md §4.3).
pub fn is_normal_close(code: Option<u16>) -> bool {
    code.map(|c| NORMAL_CLOSE_CODES.contains(&c)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_is_monotonic_within_cap() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            max_retries: -1,
        };
        let mut prev = Duration::ZERO;
        for retry in 0..8 {
            let delay = policy.delay_for(retry);
            // allow for jitter: delay must be >= the un-jittered floor of the previous retry
            let floor = policy.base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
            assert!(delay >= floor.min(policy.max) || retry == 0);
            assert!(delay <= policy.max);
            prev = delay;
        }
        let _ = prev;
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = ReconnectPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            max_retries: -1,
        };
        for retry in 0..20 {
            assert!(policy.delay_for(retry) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn negative_max_retries_is_unbounded() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(1),
            max_retries: -1,
        };
        assert!(!policy.retries_exhausted(1_000_000));
    }

    #[test]
    fn retries_exhausted_at_configured_ceiling() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(1),
            max_retries: 3,
        };
        assert!(!policy.retries_exhausted(2));
        assert!(policy.retries_exhausted(3));
    }

    #[test]
    fn normal_close_codes_suppress_reconnect() {
        assert!(is_normal_close(Some(1000)));
        assert!(is_normal_close(Some(1005)));
        assert!(!is_normal_close(Some(1006)));
        assert!(!is_normal_close(None));
    }

    #[test]
    fn round_robin_cycles_urls() {
        let urls = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            select_url(&urls, SupervisionUrlDistribution::RoundRobin, 0, 0),
            Some("a")
        );
        assert_eq!(
            select_url(&urls, SupervisionUrlDistribution::RoundRobin, 0, 1),
            Some("b")
        );
        assert_eq!(
            select_url(&urls, SupervisionUrlDistribution::RoundRobin, 0, 2),
            Some("a")
        );
    }

    #[test]
    fn affinity_is_index_mod_len() {
        let urls = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(
            select_url(&urls, SupervisionUrlDistribution::ChargingStationAffinity, 4, 0),
            Some("b")
        );
    }
}
