//! Session supervision: receive loop, reconnection and cooperative shutdown.
//!
//! Each supervised session runs its own receive loop. Events are handed to the
//! [`EventHandler`] one at a time, so a slow handler stalls only this session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::error::TransportError;
use crate::common::reconnect::{ReconnectConfig, ReconnectState};
use crate::protocol::{parse, ChatEvent};
use crate::twitch::session::{Dialer, FrameStream, SessionHandle, WireFrame};

/// How long to wait for the peer to acknowledge our close frame.
pub const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Consumes parsed events from one session.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, session: &SessionHandle, event: ChatEvent);
}

/// Why a transport's receive loop ended.
#[derive(Debug)]
pub enum Disconnect {
    ClosedByPeer,
    EndOfStream,
    Failed(TransportError),
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::ClosedByPeer => write!(f, "closed by peer"),
            Disconnect::EndOfStream => write!(f, "stream ended"),
            Disconnect::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Keeps one logical session connected until its token is cancelled.
pub struct SessionSupervisor {
    handle: SessionHandle,
    dialer: Arc<dyn Dialer>,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
    reconnect: ReconnectConfig,
}

impl SessionSupervisor {
    pub fn new(
        handle: SessionHandle,
        dialer: Arc<dyn Dialer>,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handle,
            dialer,
            handler,
            cancel,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let username = self.handle.username().to_string();
        let mut reconnect = ReconnectState::new(self.reconnect.clone());

        loop {
            let delay = reconnect.next_delay();
            if !delay.is_zero() {
                info!(
                    username = %username,
                    attempt = reconnect.attempts(),
                    "Re-dialing in {:.1} seconds...",
                    delay.as_secs_f64()
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => break,
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let stream = match self.handle.connect(self.dialer.as_ref()).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(username = %username, "Failed to connect to Twitch chat: {}", e);
                    self.handle.detach(true).await;
                    continue;
                }
            };

            if let Some(channel) = self.handle.joined_channel() {
                if let Err(e) = self.handle.join(&channel).await {
                    error!(username = %username, channel = %channel, "Failed to join channel: {}", e);
                    self.handle.detach(true).await;
                    continue;
                }
                info!(username = %username, "Joined #{}", channel);
            }
            reconnect.reset();

            let (done_tx, mut done_rx) = oneshot::channel();
            let receiver = tokio::spawn(receive_loop(
                self.handle.clone(),
                stream,
                self.handler.clone(),
                done_tx,
            ));

            tokio::select! {
                reason = &mut done_rx => {
                    let reason = reason.unwrap_or(Disconnect::EndOfStream);
                    warn!(username = %username, "Twitch chat transport died ({}), reconnecting", reason);
                    self.handle.detach(true).await;
                }
                _ = self.cancel.cancelled() => {
                    self.shutdown(receiver, done_rx).await;
                    return;
                }
            }
        }

        self.handle.detach(false).await;
        info!(username = %username, "Session supervisor stopped");
    }

    /// Close handshake: send close, give the peer a moment to answer, then stop reading.
    async fn shutdown(&self, receiver: JoinHandle<()>, done_rx: oneshot::Receiver<Disconnect>) {
        let username = self.handle.username();
        info!(username = %username, "Closing Twitch chat session");

        if let Err(e) = self.handle.close().await {
            warn!(username = %username, "Failed to send close frame: {}", e);
        }
        match tokio::time::timeout(CLOSE_ACK_TIMEOUT, done_rx).await {
            Ok(_) => debug!(username = %username, "Peer acknowledged close"),
            Err(_) => debug!(username = %username, "No close acknowledgment within {:?}", CLOSE_ACK_TIMEOUT),
        }
        receiver.abort();
        self.handle.detach(false).await;
    }
}

async fn receive_loop(
    handle: SessionHandle,
    mut stream: FrameStream,
    handler: Arc<dyn EventHandler>,
    done: oneshot::Sender<Disconnect>,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(WireFrame::Text(text))) => {
                for line in text.lines().filter(|line| !line.is_empty()) {
                    debug!(username = %handle.username(), "recv: {}", line);
                    if let Some(event) = parse(line) {
                        handler.handle(&handle, event).await;
                    }
                }
            }
            Some(Ok(WireFrame::Close)) => break Disconnect::ClosedByPeer,
            Some(Err(e)) => break Disconnect::Failed(e),
            None => break Disconnect::EndOfStream,
        }
    };

    // The supervisor may already be gone during shutdown.
    let _ = done.send(reason);
}
