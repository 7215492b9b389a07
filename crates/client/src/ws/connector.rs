//! Socket establishment seam.
//!
//! The channel only sees a [`Link`]: a sink and a stream of [`WireFrame`]s.
//! [`TungsteniteConnector`] opens a real WebSocket; the in-memory connector in
//! [`super::memory`] backs tests.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use cms_admin_shared::{NORMAL_CLOSURE, NORMAL_CLOSURE_REASON};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use reqwest::cookie::CookieStore;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Errors raised while establishing or using a socket. These never reach
/// channel callers; the channel turns them into an abnormal close.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid socket request: {0}")]
    Request(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Close frame contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn normal() -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: NORMAL_CLOSURE_REASON.to_string(),
        }
    }
}

/// The frames the channel cares about. Pings, pongs and binary frames are
/// handled or discarded by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Close(Option<CloseFrame>),
}

pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame, TransportError>> + Send>>;

/// An open socket.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Link { .. }")
    }
}

/// Opens sockets for the notification channel.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Link, TransportError>;
}

/// Real WebSocket connector.
///
/// When given the HTTP client's cookie jar, the session cookies ride along on
/// the upgrade request so the server can authenticate the socket.
#[derive(Default, Clone)]
pub struct TungsteniteConnector {
    cookies: Option<Arc<dyn CookieStore>>,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookies(mut self, cookies: Arc<dyn CookieStore>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    fn cookie_header(&self, url: &Url) -> Option<HeaderValue> {
        let jar = self.cookies.as_ref()?;
        // Cookies were stored against the http(s) origin.
        let mut http_url = url.clone();
        let scheme = if url.scheme() == "wss" { "https" } else { "http" };
        http_url.set_scheme(scheme).ok()?;
        let value = jar.cookies(&http_url)?;
        HeaderValue::from_bytes(value.as_bytes()).ok()
    }
}

impl std::fmt::Debug for TungsteniteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TungsteniteConnector")
            .field("cookies", &self.cookies.is_some())
            .finish()
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Link, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if let Some(cookie) = self.cookie_header(url) {
            request.headers_mut().insert(header::COOKIE, cookie);
        }

        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(into_message(frame))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text.to_string()))),
                Ok(Message::Close(frame)) => Some(Ok(WireFrame::Close(frame.map(|f| CloseFrame {
                    code: u16::from(f.code),
                    reason: f.reason.to_string(),
                })))),
                // Pong is handled automatically by tungstenite
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn into_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Close(frame) => Message::Close(frame.map(|f| WsCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.into(),
        })),
    }
}
