//! In-memory fakes for the bridge's collaborators. Test builds only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use zeroize::Zeroizing;

use crate::bridge::directory::{BotRecord, BridgedRecord, Directory, DirectorySnapshot, RealUserRecord};
use crate::common::error::{MatrixError, MatrixResult, PersistenceError, PersistenceResult, TransportError, TransportResult, TwitchApiError};
use crate::common::reconnect::ReconnectConfig;
use crate::common::types::{ChatAccount, Credential, Profile, RoomMapping};
use crate::matrix::RoomMessenger;
use crate::protocol::ChatEvent;
use crate::twitch::api::ProfileLookup;
use crate::twitch::login::{OAuthProvider, SessionOpener};
use crate::twitch::session::{Dialer, SessionHandle, Transport, WireFrame};
use crate::twitch::supervisor::EventHandler;

const WAIT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds, failing the test after a short while.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached within {:?}", WAIT);
}

pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        factor: 2.0,
    }
}

/// The chat server's end of an in-memory transport.
pub struct Peer {
    outbound: mpsc::UnboundedReceiver<WireFrame>,
    inbound: mpsc::UnboundedSender<TransportResult<WireFrame>>,
}

impl Peer {
    /// Next frame written by the session, or `None` after a timeout.
    pub async fn next_frame(&mut self) -> Option<WireFrame> {
        tokio::time::timeout(WAIT, self.outbound.next()).await.ok().flatten()
    }

    /// Consume CAP, PASS and NICK.
    pub async fn drain_handshake(&mut self) {
        for expected in ["CAP REQ ", "PASS ", "NICK "] {
            match self.next_frame().await {
                Some(WireFrame::Text(line)) if line.starts_with(expected) => {}
                other => panic!("expected {:?} line, got {:?}", expected.trim(), other),
            }
        }
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.unbounded_send(Ok(WireFrame::Text(text.to_string())));
    }

    pub fn push_close(&self) {
        let _ = self.inbound.unbounded_send(Ok(WireFrame::Close));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.inbound.unbounded_send(Err(TransportError::Read {
            message: message.to_string(),
        }));
    }
}

pub fn transport_pair() -> (Transport, Peer) {
    let (out_tx, out_rx) = mpsc::unbounded();
    let (in_tx, in_rx) = mpsc::unbounded();

    let sink = out_tx.sink_map_err(|e| TransportError::Write {
        message: e.to_string(),
    });
    let transport = Transport {
        sink: Box::pin(sink),
        stream: Box::pin(in_rx),
    };
    let peer = Peer {
        outbound: out_rx,
        inbound: in_tx,
    };
    (transport, peer)
}

pub async fn expect_frame(peer: &mut Peer, expected: &str) {
    assert_eq!(peer.next_frame().await, Some(WireFrame::Text(expected.to_string())));
}

/// Hands out prepared transports in order, then fails.
#[derive(Default)]
pub struct ScriptedDialer {
    transports: StdMutex<VecDeque<Transport>>,
    failures: AtomicUsize,
    dials: AtomicUsize,
}

impl ScriptedDialer {
    pub fn new(transports: Vec<Transport>) -> Self {
        Self {
            transports: StdMutex::new(transports.into()),
            ..Default::default()
        }
    }

    /// Fail the first `failures` dials before handing out transports.
    pub fn failing_first(failures: usize, transports: Vec<Transport>) -> Self {
        let dialer = Self::new(transports);
        dialer.failures.store(failures, Ordering::SeqCst);
        dialer
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(&self) -> TransportResult<Transport> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let dial_error = |message: &str| TransportError::Dial {
            url: "memory://chat".to_string(),
            message: message.to_string(),
        };

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(dial_error("scripted failure"));
        }
        self.transports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| dial_error("no scripted transport left"))
    }
}

#[derive(Default)]
pub struct RecordingHandler {
    events: StdMutex<Vec<ChatEvent>>,
}

impl RecordingHandler {
    pub async fn wait_for(&self, count: usize) -> Vec<ChatEvent> {
        wait_until(|| self.events.lock().unwrap().len() >= count).await;
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, _session: &SessionHandle, event: ChatEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Records every call as `"<op> <args...>"` and can be told to fail an op.
#[derive(Default)]
pub struct RecordingMessenger {
    calls: StdMutex<Vec<String>>,
    members: StdMutex<HashMap<String, HashSet<String>>>,
    failing: StdMutex<HashSet<&'static str>>,
    rooms: AtomicUsize,
}

impl RecordingMessenger {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{} ", op);
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn add_member(&self, room_id: &str, user_id: &str) {
        self.members
            .lock()
            .unwrap()
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    fn record(&self, op: &'static str, args: &[&str]) -> MatrixResult<()> {
        let mut call = op.to_string();
        for arg in args {
            call.push(' ');
            call.push_str(arg);
        }
        self.calls.lock().unwrap().push(call);

        if self.failing.lock().unwrap().contains(op) {
            return Err(MatrixError::Api {
                status: 500,
                body: "M_UNKNOWN".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RoomMessenger for RecordingMessenger {
    async fn create_room(&self, as_user: &Credential, name: &str, _preset: &str, _invite: &[String]) -> MatrixResult<String> {
        self.record("create_room", &[&as_user.user_id, name])?;
        let n = self.rooms.fetch_add(1, Ordering::SeqCst);
        Ok(format!("!dm{}:example.org", n))
    }

    async fn invite_user(&self, as_user: &Credential, room_id: &str, user_id: &str) -> MatrixResult<()> {
        self.record("invite_user", &[&as_user.user_id, room_id, user_id])
    }

    async fn send_notice(&self, as_user: &Credential, room_id: &str, body: &str) -> MatrixResult<String> {
        self.record("send_notice", &[&as_user.user_id, room_id, body])?;
        Ok("$notice".to_string())
    }

    async fn send_text(&self, as_user: &Credential, room_id: &str, body: &str) -> MatrixResult<String> {
        self.record("send_text", &[&as_user.user_id, room_id, body])?;
        Ok("$text".to_string())
    }

    async fn join_room(&self, as_user: &Credential, room_id: &str) -> MatrixResult<()> {
        self.record("join_room", &[&as_user.user_id, room_id])?;
        self.add_member(room_id, &as_user.user_id);
        Ok(())
    }

    async fn joined_members(&self, as_user: &Credential, room_id: &str) -> MatrixResult<HashSet<String>> {
        self.record("joined_members", &[&as_user.user_id, room_id])?;
        let members = self
            .members
            .lock()
            .unwrap()
            .get(room_id)
            .cloned()
            .unwrap_or_default();
        // Homeservers only show membership to members.
        if !members.contains(&as_user.user_id) {
            return Err(MatrixError::Api {
                status: 403,
                body: "M_FORBIDDEN".to_string(),
            });
        }
        Ok(members)
    }

    async fn register_user(&self, localpart: &str) -> MatrixResult<()> {
        self.record("register_user", &[localpart])
    }

    async fn set_display_name(&self, as_user: &Credential, display_name: &str) -> MatrixResult<()> {
        self.record("set_display_name", &[&as_user.user_id, display_name])
    }

    async fn set_avatar_url(&self, as_user: &Credential, content_uri: &str) -> MatrixResult<()> {
        self.record("set_avatar_url", &[&as_user.user_id, content_uri])
    }

    async fn upload_from_url(&self, as_user: &Credential, source: &str) -> MatrixResult<String> {
        self.record("upload_from_url", &[&as_user.user_id, source])?;
        Ok("mxc://example.org/avatar".to_string())
    }
}

/// Twitch users known to the fake Helix.
#[derive(Default)]
pub struct ScriptedProfiles {
    users: HashMap<String, Profile>,
    delay: Duration,
    fail_fetch: bool,
}

impl ScriptedProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, login: &str, display_name: &str, avatar_url: Option<&str>) -> Self {
        self.users.insert(
            login.to_lowercase(),
            Profile {
                display_name: display_name.to_string(),
                avatar_url: avatar_url.map(str::to_string),
            },
        );
        self
    }

    /// Slow down existence checks, widening the provisioning race window.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }
}

#[async_trait]
impl ProfileLookup for ScriptedProfiles {
    async fn user_exists(&self, login: &str) -> Result<bool, TwitchApiError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.users.contains_key(&login.to_lowercase()))
    }

    async fn fetch_profile(&self, login: &str) -> Result<Option<Profile>, TwitchApiError> {
        if self.fail_fetch {
            return Err(TwitchApiError::Api {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(self.users.get(&login.to_lowercase()).cloned())
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    snapshot: StdMutex<DirectorySnapshot>,
    fail_saves: AtomicBool,
}

impl MemoryDirectory {
    pub fn snapshot(&self) -> DirectorySnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    fn save(&self, change: impl FnOnce(&mut DirectorySnapshot)) -> PersistenceResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io {
                path: "memory".to_string(),
                source: std::io::Error::other("disk full"),
            });
        }
        change(&mut self.snapshot.lock().unwrap());
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn load(&self) -> PersistenceResult<DirectorySnapshot> {
        Ok(self.snapshot())
    }

    async fn save_room(&self, mapping: &RoomMapping) -> PersistenceResult<()> {
        self.save(|snapshot| snapshot.upsert_room(mapping))
    }

    async fn save_bridged(&self, record: &BridgedRecord) -> PersistenceResult<()> {
        self.save(|snapshot| snapshot.upsert_bridged(record))
    }

    async fn save_real_user(&self, record: &RealUserRecord) -> PersistenceResult<()> {
        self.save(|snapshot| snapshot.upsert_real_user(record))
    }

    async fn save_bot(&self, record: &BotRecord) -> PersistenceResult<()> {
        self.save(|snapshot| snapshot.bot = Some(record.clone()))
    }
}

/// OAuth provider that accepts any code for one fixed Twitch login.
pub struct FakeOAuth {
    login: String,
    fail_exchange: bool,
}

impl FakeOAuth {
    pub fn new(login: &str) -> Self {
        Self {
            login: login.to_string(),
            fail_exchange: false,
        }
    }

    pub fn failing_exchange(mut self) -> Self {
        self.fail_exchange = true;
        self
    }
}

#[async_trait]
impl OAuthProvider for FakeOAuth {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://auth.test/?state={}", state)
    }

    async fn exchange_code(&self, code: &str) -> Result<Zeroizing<String>, TwitchApiError> {
        if self.fail_exchange {
            return Err(TwitchApiError::Api {
                status: 400,
                body: "Invalid authorization code".to_string(),
            });
        }
        Ok(Zeroizing::new(format!("token-for-{}", code)))
    }

    async fn token_owner(&self, _http: &reqwest::Client, _token: &str) -> Result<String, TwitchApiError> {
        Ok(self.login.clone())
    }
}

/// Session opener that records requests instead of dialing.
#[derive(Default)]
pub struct RecordingOpener {
    opened: StdMutex<Vec<(String, String)>>,
    closed: StdMutex<Vec<(String, String)>>,
}

impl RecordingOpener {
    /// `(matrix user, twitch login)` pairs, in order.
    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().unwrap().clone()
    }

    /// `(matrix user, twitch login of the closed session)` pairs, in order.
    pub fn closed(&self) -> Vec<(String, String)> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionOpener for RecordingOpener {
    async fn open_user_session(&self, user_id: &str, account: ChatAccount) -> Option<SessionHandle> {
        self.opened
            .lock()
            .unwrap()
            .push((user_id.to_string(), account.username.clone()));
        Some(SessionHandle::new(account))
    }

    async fn close_user_session(&self, user_id: &str, handle: &SessionHandle) {
        self.closed
            .lock()
            .unwrap()
            .push((user_id.to_string(), handle.username().to_string()));
    }
}
