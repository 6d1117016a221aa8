//! Twitch chat session over a secure WebSocket.
//!
//! A [`SessionHandle`] is the stable, cloneable identity of one logical chat
//! session. The transport underneath it is replaced on every reconnect; holders
//! of the handle never observe the swap.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::common::error::{TransportError, TransportResult};
use crate::common::types::{normalize_channel, ChatAccount};
use crate::protocol::commands;

/// Twitch chat edge.
pub const TWITCH_CHAT_URL: &str = "wss://irc-ws.chat.twitch.tv:443/irc";

/// Deadline for chat messages, keepalive replies and handshake lines.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline for `JOIN`, which Twitch rate-limits more aggressively.
pub const JOIN_WRITE_DEADLINE: Duration = Duration::from_secs(120);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

/// One transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Close,
}

impl WireFrame {
    fn into_message(self) -> Message {
        match self {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Close => Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportResult<WireFrame>> + Send>>;

/// Both halves of one freshly dialed connection.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transports to the chat edge.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> TransportResult<Transport>;
}

/// Dials the Twitch chat edge over TLS WebSocket.
pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for WebSocketDialer {
    fn default() -> Self {
        Self::new(TWITCH_CHAT_URL)
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> TransportResult<Transport> {
        let dial_error = |message: String| TransportError::Dial {
            url: self.url.clone(),
            message,
        };

        let (ws, _response) = timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(self.url.as_str()))
            .await
            .map_err(|_| dial_error("handshake timed out".to_string()))?
            .map_err(|e| dial_error(e.to_string()))?;

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| TransportError::Write {
                message: e.to_string(),
            })
            .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(frame.into_message())));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text))),
                Ok(Message::Close(_)) => Some(Ok(WireFrame::Close)),
                // Control frames are answered by tungstenite itself.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Read {
                    message: e.to_string(),
                })),
            })
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Lifecycle of a logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    CapabilityNegotiated,
    Authenticated,
    Joined,
    Closing,
    Reconnecting,
}

/// Stable handle to one logical chat session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    account: ChatAccount,
    /// Writer of the current transport; `None` while disconnected.
    writer: Mutex<Option<FrameSink>>,
    /// Channel to (re)join after every connect.
    channel: StdMutex<Option<String>>,
    state: watch::Sender<SessionState>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("username", &self.inner.account.username)
            .field("channel", &self.joined_channel())
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn new(account: ChatAccount) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                account,
                writer: Mutex::new(None),
                channel: StdMutex::new(None),
                state,
            }),
        }
    }

    /// A session that joins `channel` as soon as it is connected.
    pub fn for_channel(account: ChatAccount, channel: &str) -> Self {
        let handle = Self::new(account);
        handle.set_channel(Some(normalize_channel(channel)));
        handle
    }

    pub fn username(&self) -> &str {
        &self.inner.account.username
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Channel this session is (or will be, after reconnect) joined to.
    pub fn joined_channel(&self) -> Option<String> {
        self.inner
            .channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether both handles refer to the same logical session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_channel(&self, channel: Option<String>) {
        *self.inner.channel.lock().unwrap_or_else(|e| e.into_inner()) = channel;
    }

    fn set_state(&self, state: SessionState) {
        self.inner.state.send_replace(state);
    }

    /// Open a fresh transport, negotiate capabilities and authenticate.
    ///
    /// On success the new writer replaces any previous one and the inbound
    /// stream is returned to the caller, which owns the receive loop.
    pub async fn connect(&self, dialer: &dyn Dialer) -> TransportResult<FrameStream> {
        self.set_state(SessionState::Connecting);
        let Transport { mut sink, stream } = dialer.dial().await?;

        write_with_deadline(&mut sink, commands::cap_req(), WRITE_DEADLINE).await?;
        self.set_state(SessionState::CapabilityNegotiated);

        write_with_deadline(&mut sink, commands::pass(&self.inner.account.token), WRITE_DEADLINE).await?;
        write_with_deadline(&mut sink, commands::nick(self.username()), WRITE_DEADLINE).await?;

        *self.inner.writer.lock().await = Some(sink);
        self.set_state(SessionState::Authenticated);
        info!(username = %self.username(), "Twitch chat session authenticated");

        Ok(stream)
    }

    /// Join `channel`. Not idempotent: a second call sends a second `JOIN`.
    pub async fn join(&self, channel: &str) -> TransportResult<()> {
        let channel = normalize_channel(channel);
        debug!(username = %self.username(), "JOIN #{}", channel);
        self.write_line(commands::join(&channel), JOIN_WRITE_DEADLINE).await?;
        self.set_channel(Some(channel));
        self.set_state(SessionState::Joined);
        Ok(())
    }

    /// Send a chat message to `channel`. No retry on failure.
    pub async fn send(&self, channel: &str, text: &str) -> TransportResult<()> {
        self.write_line(commands::privmsg(channel, text), WRITE_DEADLINE).await
    }

    /// Answer a keepalive using the server token verbatim.
    pub async fn pong(&self, server: &str) -> TransportResult<()> {
        self.write_line(commands::pong(server), WRITE_DEADLINE).await
    }

    /// Send a close frame and release the writer.
    pub async fn close(&self) -> TransportResult<()> {
        self.set_state(SessionState::Closing);
        let result = self.write_frame(WireFrame::Close, WRITE_DEADLINE).await;
        self.inner.writer.lock().await.take();
        result
    }

    /// Drop the dead transport's writer ahead of a reconnect.
    pub async fn detach(&self, reconnecting: bool) {
        self.inner.writer.lock().await.take();
        self.set_state(if reconnecting {
            SessionState::Reconnecting
        } else {
            SessionState::Disconnected
        });
    }

    async fn write_line(&self, line: String, deadline: Duration) -> TransportResult<()> {
        self.write_frame(WireFrame::Text(line), deadline).await
    }

    async fn write_frame(&self, frame: WireFrame, deadline: Duration) -> TransportResult<()> {
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
            sink.send(frame).await
        };

        timeout(deadline, write)
            .await
            .unwrap_or(Err(TransportError::WriteTimeout {
                seconds: deadline.as_secs(),
            }))
    }
}

async fn write_with_deadline(sink: &mut FrameSink, line: String, deadline: Duration) -> TransportResult<()> {
    timeout(deadline, sink.send(WireFrame::Text(line)))
        .await
        .unwrap_or(Err(TransportError::WriteTimeout {
            seconds: deadline.as_secs(),
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{expect_frame, transport_pair, ScriptedDialer};

    fn account() -> ChatAccount {
        ChatAccount::new("bridgebot", "tok123")
    }

    #[tokio::test]
    async fn test_connect_negotiates_and_authenticates() {
        let (transport, mut peer) = transport_pair();
        let dialer = ScriptedDialer::new(vec![transport]);
        let handle = SessionHandle::new(account());

        let _stream = handle.connect(&dialer).await.unwrap();

        expect_frame(&mut peer, "CAP REQ :twitch.tv/membership twitch.tv/tags\r\n").await;
        expect_frame(&mut peer, "PASS oauth:tok123\r\n").await;
        expect_frame(&mut peer, "NICK bridgebot\r\n").await;
        assert_eq!(handle.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_connect_fails_when_dial_fails() {
        let dialer = ScriptedDialer::new(Vec::new());
        let handle = SessionHandle::new(account());

        let result = handle.connect(&dialer).await;
        assert!(matches!(result, Err(TransportError::Dial { .. })));
    }

    #[tokio::test]
    async fn test_join_send_and_pong_frames() {
        let (transport, mut peer) = transport_pair();
        let dialer = ScriptedDialer::new(vec![transport]);
        let handle = SessionHandle::new(account());
        let _stream = handle.connect(&dialer).await.unwrap();
        peer.drain_handshake().await;

        handle.join("#Bar").await.unwrap();
        handle.send("bar", "hello: world").await.unwrap();
        handle.pong("tmi.twitch.tv").await.unwrap();

        expect_frame(&mut peer, "JOIN #bar\r\n").await;
        expect_frame(&mut peer, "PRIVMSG #bar :hello: world\r\n").await;
        expect_frame(&mut peer, "PONG :tmi.twitch.tv\r\n").await;
        assert_eq!(handle.joined_channel().as_deref(), Some("bar"));
        assert_eq!(handle.state(), SessionState::Joined);
    }

    #[tokio::test]
    async fn test_send_without_transport_is_not_connected() {
        let handle = SessionHandle::new(account());
        let result = handle.send("bar", "hi").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_sends_close_frame_and_releases_writer() {
        let (transport, mut peer) = transport_pair();
        let dialer = ScriptedDialer::new(vec![transport]);
        let handle = SessionHandle::new(account());
        let _stream = handle.connect(&dialer).await.unwrap();
        peer.drain_handshake().await;

        handle.close().await.unwrap();
        assert_eq!(peer.next_frame().await, Some(WireFrame::Close));
        assert!(matches!(handle.pong("x").await, Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_for_channel_presets_join_target() {
        let handle = SessionHandle::for_channel(account(), "#Bar");
        assert_eq!(handle.joined_channel().as_deref(), Some("bar"));
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_clones_share_identity() {
        let handle = SessionHandle::new(account());
        let other = handle.clone();
        assert!(handle.same_session(&other));
        assert!(!handle.same_session(&SessionHandle::new(account())));
    }
}
