//! Persistent JSON-RPC session over a single WebSocket.
//!
//! One logical session serves the whole process: concurrent callers issue
//! [`Client::call`], responses are correlated back by request id through a
//! pending map of oneshot sinks, and two background tasks (read loop, ping
//! loop) keep the connection alive. When the read loop observes a wire
//! failure it reconnects with bounded exponential backoff and
//! re-authenticates through a direct path that never goes through the
//! pending map, since the read loop cannot wait on itself for an auth
//! response.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};
use tracing::{debug, info, warn};
use url::Url;

use super::codec::{Request, Response};
use crate::error::{ClientError, Result};

/// Fixed method used to authenticate the session.
const AUTH_METHOD: &str = "auth.login_with_api_key";

/// Default keepalive ping interval. The read deadline is twice this.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Shared {
    url: Url,
    api_key: String,
    tls_skip_verify: bool,
    ping_interval: Duration,
    /// Single-writer side of the socket. `None` while a reconnect is
    /// re-dialing; writes during that window fail as connection-closed.
    writer: Mutex<Option<WsSink>>,
    /// In-flight requests keyed by id. Never held across an await.
    pending: std::sync::Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl Shared {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Fail every in-flight request by dropping its response sink.
    fn fail_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing in-flight requests");
        }
    }

    /// Deliver an inbound response to its waiting caller, if any.
    /// Responses with an unknown or absent id are dropped silently.
    fn dispatch(&self, text: &str) {
        let response: Response = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(error) => {
                debug!(%error, "dropping undecodable frame");
                return;
            }
        };
        let Some(id) = response.id.as_deref().and_then(|id| id.parse::<u64>().ok()) else {
            debug!("dropping response without a usable id");
            return;
        };
        let sender = self.pending.lock().unwrap().remove(&id);
        match sender {
            Some(sender) => {
                let _ = sender.send(response);
            }
            None => debug!(id, "dropping response for unknown request id"),
        }
    }

    /// Serialize a frame onto the wire under the single write mutex.
    async fn write_frame(&self, message: Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => timeout(WRITE_TIMEOUT, sink.send(message))
                .await
                .map_err(|_| ClientError::Timeout("socket write"))?
                .map_err(ClientError::from),
            None => Err(ClientError::ConnectionClosed),
        }
    }
}

/// Removes the pending-map entry if the caller gives up (drop, timeout)
/// before a response is delivered.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.pending.lock().unwrap().remove(&self.id);
        }
    }
}

/// Handle to the appliance RPC session.
///
/// Cheap to clone; all clones share the one WebSocket connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Dial the appliance, authenticate, and start the background tasks.
    ///
    /// The API key is trimmed of surrounding whitespace before use. When the
    /// URL scheme is `wss` and `tls_skip_verify` is set, certificate
    /// verification is disabled.
    pub async fn connect(url: &str, api_key: &str, tls_skip_verify: bool) -> Result<Self> {
        Self::connect_with_ping_interval(url, api_key, tls_skip_verify, DEFAULT_PING_INTERVAL).await
    }

    /// [`Client::connect`] with an explicit keepalive interval.
    pub async fn connect_with_ping_interval(
        url: &str,
        api_key: &str,
        tls_skip_verify: bool,
        ping_interval: Duration,
    ) -> Result<Self> {
        let url = Url::parse(url)?;
        let (close_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            url,
            api_key: api_key.trim().to_string(),
            tls_skip_verify,
            ping_interval,
            writer: Mutex::new(None),
            pending: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            close_tx,
        });

        let (sink, source) = Self::dial_and_auth(&shared).await?;
        *shared.writer.lock().await = Some(sink);

        tokio::spawn(Self::read_loop(Arc::clone(&shared), source));
        tokio::spawn(Self::ping_loop(Arc::clone(&shared)));

        info!(url = %shared.url, "connected to appliance");
        Ok(Self { shared })
    }

    /// Issue a single RPC and await its correlated response.
    ///
    /// Exactly one of three things unblocks the call: the response arrives,
    /// the session closes (or the connection is torn down by a reconnect), or
    /// the caller gives up by dropping the future. The request is never
    /// retransmitted; a caller that needs retry semantics re-issues the call.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let id = self.shared.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id, tx);
        let guard = PendingGuard {
            shared: &self.shared,
            id,
            armed: true,
        };

        // A close may have raced the insert above; re-check so the entry
        // cannot outlive the session.
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let request = Request::new(id.to_string(), method, Some(params));
        let frame = serde_json::to_string(&request).map_err(ClientError::Encode)?;
        self.shared.write_frame(Message::Text(frame)).await?;

        match rx.await {
            Ok(response) => {
                guard.disarm();
                if let Some(error) = response.error {
                    return Err(ClientError::Rpc(error));
                }
                serde_json::from_value(response.result.unwrap_or(Value::Null))
                    .map_err(ClientError::Decode)
            }
            // Sink dropped: the session closed or a reconnect failed the
            // request. The pending entry is already gone.
            Err(_) => {
                guard.disarm();
                Err(ClientError::ConnectionClosed)
            }
        }
    }

    /// Whether [`Client::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Shut the session down. Idempotent; every pending call returns a
    /// connection-closed error.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.close_tx.send(true);
        self.shared.fail_pending();
        if let Some(mut sink) = self.shared.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        info!("session closed");
    }

    /// Dial the endpoint and authenticate on the fresh socket.
    async fn dial_and_auth(shared: &Arc<Shared>) -> Result<(WsSink, WsSource)> {
        let connector = if shared.url.scheme() == "wss" && shared.tls_skip_verify {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (stream, _) = timeout(
            HANDSHAKE_TIMEOUT,
            connect_async_tls_with_config(shared.url.as_str(), None, false, connector),
        )
        .await
        .map_err(|_| ClientError::Timeout("websocket handshake"))??;

        let (mut sink, mut source) = stream.split();
        Self::authenticate_direct(shared, &mut sink, &mut source).await?;
        Ok((sink, source))
    }

    /// Authenticate by writing the auth request and reading frames straight
    /// off the socket until the matching response arrives.
    ///
    /// This intentionally bypasses the pending map: during a reconnect the
    /// read loop is the caller, so routing the auth response through the read
    /// loop would deadlock.
    async fn authenticate_direct(
        shared: &Arc<Shared>,
        sink: &mut WsSink,
        source: &mut WsSource,
    ) -> Result<()> {
        let id = shared.allocate_id();
        let request = Request::new(
            id.to_string(),
            AUTH_METHOD,
            Some(vec![Value::String(shared.api_key.clone())]),
        );
        let frame = serde_json::to_string(&request).map_err(ClientError::Encode)?;
        sink.send(Message::Text(frame)).await?;

        let deadline = Instant::now() + AUTH_TIMEOUT;
        loop {
            let message = timeout_at(deadline, source.next())
                .await
                .map_err(|_| ClientError::Timeout("authentication response"))?
                .ok_or(ClientError::ConnectionClosed)??;
            match message {
                Message::Text(text) => {
                    let response: Response =
                        serde_json::from_str(&text).map_err(ClientError::Decode)?;
                    if response.id.as_deref() != Some(id.to_string().as_str()) {
                        continue;
                    }
                    if response.error.is_some() {
                        return Err(ClientError::AuthFailed);
                    }
                    return match response.result {
                        Some(Value::Bool(true)) => Ok(()),
                        _ => Err(ClientError::AuthFailed),
                    };
                }
                Message::Close(_) => return Err(ClientError::ConnectionClosed),
                _ => continue,
            }
        }
    }

    /// Background reader: delivers responses, enforces the read deadline,
    /// and owns reconnection.
    async fn read_loop(shared: Arc<Shared>, mut source: WsSource) {
        let read_deadline = shared.ping_interval * 2;
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            let failure = match timeout(read_deadline, source.next()).await {
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => {
                        shared.dispatch(&text);
                        continue;
                    }
                    // Any inbound frame refreshes liveness.
                    Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => continue,
                    Message::Ping(payload) => {
                        let _ = shared.write_frame(Message::Pong(payload)).await;
                        continue;
                    }
                    Message::Close(_) => "peer sent close".to_string(),
                },
                Ok(Some(Err(error))) => format!("read error: {}", error),
                Ok(None) => "stream ended".to_string(),
                Err(_) => "read deadline expired".to_string(),
            };

            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            warn!(reason = %failure, "connection lost");
            match Self::reconnect(&shared).await {
                Some(new_source) => source = new_source,
                None => return,
            }
        }
    }

    /// Re-establish the connection with bounded exponential backoff.
    ///
    /// Returns the new read half, or `None` when the session closed (or a
    /// concurrent reconnect already holds the flag).
    async fn reconnect(shared: &Arc<Shared>) -> Option<WsSource> {
        if shared.reconnecting.swap(true, Ordering::SeqCst) {
            return None;
        }

        shared.writer.lock().await.take();
        shared.fail_pending();

        loop {
            for attempt in 1..=RECONNECT_ATTEMPTS {
                if shared.closed.load(Ordering::SeqCst) {
                    shared.reconnecting.store(false, Ordering::SeqCst);
                    return None;
                }
                sleep(Self::backoff_delay(attempt)).await;
                match Self::dial_and_auth(shared).await {
                    Ok((sink, source)) => {
                        let mut writer = shared.writer.lock().await;
                        if shared.closed.load(Ordering::SeqCst) {
                            shared.reconnecting.store(false, Ordering::SeqCst);
                            return None;
                        }
                        *writer = Some(sink);
                        drop(writer);
                        shared.reconnecting.store(false, Ordering::SeqCst);
                        info!(attempt, "reconnected to appliance");
                        return Some(source);
                    }
                    Err(error) => {
                        warn!(attempt, %error, "reconnect attempt failed");
                    }
                }
            }
            warn!(
                cooldown_secs = RECONNECT_COOLDOWN.as_secs(),
                "reconnect attempts exhausted, cooling down"
            );
            sleep(RECONNECT_COOLDOWN).await;
        }
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let exponential = RECONNECT_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1));
        exponential.min(RECONNECT_MAX_DELAY)
    }

    /// Background keepalive: low-level ping frames at the configured
    /// interval, serialized through the same write mutex as requests.
    async fn ping_loop(shared: Arc<Shared>) {
        let mut close_rx = shared.close_tx.subscribe();
        let mut ticker = tokio::time::interval(shared.ping_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if shared.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Err(error) = shared.write_frame(Message::Ping(Vec::new())).await {
                        debug!(%error, "keepalive ping failed");
                    }
                }
                _ = close_rx.changed() => return,
            }
        }
    }
}
