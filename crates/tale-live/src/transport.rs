//! Transport port for live sessions plus two adapters: WebSocket and in-memory channels.

use crate::error::{LiveError, LiveResult};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// One message on the live transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Write half. Only the session's writer task touches it.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> LiveResult<()>;
    async fn close(&mut self) -> LiveResult<()>;
}

/// Read half. `None` means the remote end went away.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<LiveResult<Frame>>;
}

pub type Halves = (Box<dyn FrameSink>, Box<dyn FrameSource>);

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open `url` offering `subprotocols` in order.
    async fn connect(&self, url: &str, subprotocols: &[String]) -> LiveResult<Halves>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, subprotocols: &[String]) -> LiveResult<Halves> {
        let mut request = url.into_client_request()?;
        let offered = HeaderValue::from_str(&subprotocols.join(", "))
            .map_err(|e| LiveError::Protocol(format!("invalid subprotocol header: {}", e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", offered);

        let (ws, response) = tokio_tungstenite::connect_async(request).await?;
        debug!(
            target: "tale::live",
            status = %response.status(),
            protocol = ?response.headers().get("Sec-WebSocket-Protocol"),
            "websocket open"
        );
        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsSource { stream })))
    }
}

struct WsSink {
    sink: SplitSink<Ws, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> LiveResult<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Close => Message::Close(None),
        };
        self.sink.send(message).await?;
        Ok(())
    }

    async fn close(&mut self) -> LiveResult<()> {
        self.sink.close().await?;
        Ok(())
    }
}

struct WsSource {
    stream: SplitStream<Ws>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<LiveResult<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            return Some(Ok(match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(bytes) => Frame::Binary(bytes),
                Message::Close(_) => Frame::Close,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }));
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory channels (headless runs and tests)
// ---------------------------------------------------------------------------

/// Connector backed by a pair of unbounded channels. Connects once.
pub struct ChannelConnector {
    ends: Mutex<Option<(mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<LiveResult<Frame>>)>>,
    seen: Arc<Mutex<Option<(String, Vec<String>)>>>,
}

/// The far side of a [`ChannelConnector`], standing in for the live server.
pub struct RemoteEnd {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<LiveResult<Frame>>,
    seen: Arc<Mutex<Option<(String, Vec<String>)>>>,
}

pub fn channel_transport() -> (ChannelConnector, RemoteEnd) {
    let (client_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, client_rx) = mpsc::unbounded_channel();
    let seen = Arc::new(Mutex::new(None));
    (
        ChannelConnector {
            ends: Mutex::new(Some((client_tx, client_rx))),
            seen: Arc::clone(&seen),
        },
        RemoteEnd {
            from_client,
            to_client,
            seen,
        },
    )
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, url: &str, subprotocols: &[String]) -> LiveResult<Halves> {
        let ends = self
            .ends
            .lock()
            .map_err(|_| LiveError::Transport("channel connector poisoned".to_string()))?
            .take();
        let (tx, rx) =
            ends.ok_or_else(|| LiveError::Transport("channel already connected".to_string()))?;
        if let Ok(mut seen) = self.seen.lock() {
            *seen = Some((url.to_string(), subprotocols.to_vec()));
        }
        Ok((Box::new(ChannelSink { tx }), Box::new(ChannelSource { rx })))
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> LiveResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| LiveError::Transport("remote end dropped".to_string()))
    }

    async fn close(&mut self) -> LiveResult<()> {
        let _ = self.tx.send(Frame::Close);
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<LiveResult<Frame>>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<LiveResult<Frame>> {
        self.rx.recv().await
    }
}

impl RemoteEnd {
    /// Next frame the client sent; `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Everything the client has sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Ok(Frame::Text(text.into()))).is_ok()
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.to_client.send(Ok(Frame::Binary(bytes))).is_ok()
    }

    pub fn send_close(&self) -> bool {
        self.to_client.send(Ok(Frame::Close)).is_ok()
    }

    /// Deliver a transport error to the client.
    pub fn fail(&self, error: LiveError) -> bool {
        self.to_client.send(Err(error)).is_ok()
    }

    /// URL and subprotocols the client connected with.
    pub fn handshake(&self) -> Option<(String, Vec<String>)> {
        self.seen.lock().ok().and_then(|s| s.clone())
    }
}
