//! Duplex channel to the CSMS
//!
//! [`Transport`] owns one text-frame channel at a time. A [`Dialer`] produces
//! the channel; the WebSocket dialer is the production one and tests plug in
//! in-memory dialers. A background reader task forwards inbound frames into a
//! single queue that survives reconnects, so [`Transport::receive`] can be
//! awaited from one long-lived loop.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        handshake::client::Request,
        http::{header, Uri},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Outgoing half of a channel
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;

/// Incoming half of a channel
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// Channel failures. Never fatal: the next loop tick reconnects.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("channel closed")]
    Closed,
}

/// Opens a fresh channel to the CSMS
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<(FrameSink, FrameStream), ChannelError>;
}

/// WebSocket dialer speaking the `ocpp2.0.1` subprotocol
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> Result<(FrameSink, FrameStream), ChannelError> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|_| ChannelError::Connect(format!("invalid url {}", self.url)))?;

        let request = Request::builder()
            .uri(&self.url)
            .header(header::SEC_WEBSOCKET_PROTOCOL, OCPP_SUBPROTOCOL)
            .header(header::HOST, uri.host().unwrap_or("localhost"))
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(
                header::SEC_WEBSOCKET_KEY,
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| {
                error!("WebSocket connection failed: {}", e);
                ChannelError::Connect(e.to_string())
            })?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());

        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "CSMS did not accept OCPP 2.0.1 subprotocol, got: {:?}",
                accepted_protocol
            );
        }

        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx
            .sink_map_err(|e| ChannelError::Send(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, ChannelError>(Message::Text(text.into()))));

        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => Some(Err(ChannelError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Receive(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Connection bookkeeping shared with the reader task
#[derive(Debug, Default)]
struct LinkState {
    connected: AtomicBool,
    /// Set by [`Transport::close`]; blocks implicit reconnects until the next explicit connect
    suspended: AtomicBool,
    /// Bumped on every connect/close so a stale reader cannot clobber a newer link
    epoch: AtomicU64,
}

/// Reconnecting text-frame transport
pub struct Transport {
    dialer: Arc<dyn Dialer>,
    sink: Mutex<Option<FrameSink>>,
    connect_lock: Mutex<()>,
    state: Arc<LinkState>,
    inbound_tx: mpsc::UnboundedSender<Result<String, ChannelError>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Result<String, ChannelError>>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            dialer,
            sink: Mutex::new(None),
            connect_lock: Mutex::new(()),
            state: Arc::new(LinkState::default()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            reader: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Bumped by every successful dial and by [`close`](Self::close)
    pub fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::SeqCst)
    }

    /// Open the channel. Returns `true` when a channel is up afterwards.
    pub async fn connect(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        self.state.suspended.store(false, Ordering::SeqCst);

        if self.is_connected() {
            return true;
        }

        match self.dialer.dial().await {
            Ok((sink, stream)) => {
                let epoch = self.state.epoch.fetch_add(1, Ordering::SeqCst) + 1;

                if let Some(old) = self.reader.lock().take() {
                    old.abort();
                }
                *self.sink.lock().await = Some(sink);
                self.state.connected.store(true, Ordering::SeqCst);

                let handle = tokio::spawn(pump(
                    stream,
                    self.inbound_tx.clone(),
                    self.state.clone(),
                    epoch,
                ));
                *self.reader.lock() = Some(handle);

                info!("Channel connected");
                true
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                false
            }
        }
    }

    /// Send one text frame, reconnecting first if the channel was invalidated
    pub async fn send(&self, frame: String) -> Result<(), ChannelError> {
        if !self.is_connected() {
            if self.state.suspended.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            if !self.connect().await {
                return Err(ChannelError::Connect("reconnect failed".to_string()));
            }
        }

        let mut sink = self.sink.lock().await;
        let Some(tx) = sink.as_mut() else {
            return Err(ChannelError::Closed);
        };

        debug!("Sending: {}", frame);

        if let Err(e) = tx.send(frame).await {
            warn!("Send failed, invalidating channel: {}", e);
            *sink = None;
            self.state.connected.store(false, Ordering::SeqCst);
            return Err(e);
        }

        Ok(())
    }

    /// Next inbound frame. Yields `Err(Closed)` once per dropped channel.
    pub async fn receive(&self) -> Result<String, ChannelError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.unwrap_or(Err(ChannelError::Closed))
    }

    /// Close the channel and suspend implicit reconnects
    pub async fn close(&self) {
        self.state.suspended.store(true, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("Error while closing channel: {}", e);
            }
            info!("Channel closed");
        }
    }
}

async fn pump(
    mut stream: FrameStream,
    inbound: mpsc::UnboundedSender<Result<String, ChannelError>>,
    state: Arc<LinkState>,
    epoch: u64,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(text) => {
                debug!("Received: {}", text);
                if inbound.send(Ok(text)).is_err() {
                    return;
                }
            }
            Err(ChannelError::Closed) => break,
            Err(e) => {
                warn!("Receive error: {}", e);
                break;
            }
        }
    }

    if state.epoch.load(Ordering::SeqCst) == epoch {
        state.connected.store(false, Ordering::SeqCst);
        info!("Channel closed by peer");
        let _ = inbound.send(Err(ChannelError::Closed));
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Dialer over in-memory channels; the test plays the CSMS side.
    struct LoopbackDialer {
        dials: AtomicUsize,
        fail: AtomicBool,
        peers: mpsc::UnboundedSender<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>,
    }

    #[async_trait]
    impl Dialer for LoopbackDialer {
        async fn dial(&self) -> Result<(FrameSink, FrameStream), ChannelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChannelError::Connect("refused".into()));
            }
            let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
            let _ = self.peers.send((out_rx, in_tx));

            let sink = futures_util::sink::unfold(out_tx, |tx, frame: String| async move {
                tx.send(frame).map_err(|_| ChannelError::Closed)?;
                Ok::<_, ChannelError>(tx)
            });
            let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
                rx.recv().await.map(|frame| (Ok(frame), rx))
            });
            Ok((Box::pin(sink), Box::pin(stream)))
        }
    }

    fn loopback() -> (
        Arc<LoopbackDialer>,
        mpsc::UnboundedReceiver<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<String>)>,
    ) {
        let (peers, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(LoopbackDialer {
            dials: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            peers,
        });
        (dialer, rx)
    }

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:9000/ocpp", "station-001");
        assert_eq!(url, "ws://localhost:9000/ocpp/station-001");

        let url = build_ocpp_url("ws://localhost:9000/ocpp/", "station-001");
        assert_eq!(url, "ws://localhost:9000/ocpp/station-001");
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (dialer, mut peers) = loopback();
        let transport = Transport::new(dialer.clone());

        assert!(transport.connect().await);
        let (mut from_cp, to_cp) = peers.recv().await.unwrap();

        transport.send("[2,\"a\",\"Heartbeat\",{}]".into()).await.unwrap();
        assert_eq!(from_cp.recv().await.unwrap(), "[2,\"a\",\"Heartbeat\",{}]");

        to_cp.send("[3,\"a\",{}]".into()).unwrap();
        assert_eq!(transport.receive().await.unwrap(), "[3,\"a\",{}]");
    }

    #[tokio::test]
    async fn test_peer_close_invalidates_and_send_reconnects() {
        let (dialer, mut peers) = loopback();
        let transport = Transport::new(dialer.clone());

        assert!(transport.connect().await);
        let (_from_cp, to_cp) = peers.recv().await.unwrap();

        drop(to_cp);
        assert_eq!(transport.receive().await, Err(ChannelError::Closed));
        assert!(!transport.is_connected());

        let before = transport.epoch();
        transport.send("hello".into()).await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(transport.epoch(), before + 1);
        let (mut from_cp, _to_cp) = peers.recv().await.unwrap();
        assert_eq!(from_cp.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_failed_connect() {
        let (dialer, _peers) = loopback();
        dialer.fail.store(true, Ordering::SeqCst);
        let transport = Transport::new(dialer.clone());

        assert!(!transport.connect().await);
        assert!(matches!(
            transport.send("x".into()).await,
            Err(ChannelError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_close_suspends_reconnect() {
        let (dialer, mut peers) = loopback();
        let transport = Transport::new(dialer.clone());

        assert!(transport.connect().await);
        let _peer = peers.recv().await.unwrap();

        transport.close().await;
        assert!(!transport.is_connected());
        assert_eq!(transport.send("x".into()).await, Err(ChannelError::Closed));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        assert!(transport.connect().await);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }
}
