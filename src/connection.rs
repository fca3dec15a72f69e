//! Connection manager: zero or one live streaming connection for the current user.
//!
//! ## Lifecycle
//! ```text
//! Disconnected ──connect(id)──▶ Connecting ──ok──▶ Open
//!      ▲                             │               │
//!      └────────── error ────────────┘               │
//!      └──────── server close / error / disconnect() ┘
//!
//! Disconnected ──retries exhausted (backoff policy only)──▶ Lost
//! ```
//!
//! A new connection is only opened after the previous one has been closed
//! and its reader task has finished. Recovery after a drop is driven by the
//! supervisor task (see [`ConnectionManager::spawn_supervisor`]) according
//! to the configured [`ReconnectPolicy`].

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelKey, ChannelRegistry, Subscription};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{ClientError, Result};
use crate::router::{MessageRouter, RouterStats};
use crate::token::{token_source_from_config, Identity, TokenSource};
use crate::transport::{stream_url, Connector, Transport, WsConnector};

/// How long a torn-down reader gets to close its socket before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Poll-mode supervisors escalate from `warn` to `error` after this many misses.
const NOISY_FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Reconnect attempts were exhausted. Only reachable under
    /// [`ReconnectPolicy::Backoff`]; cleared by the next explicit connect.
    Lost,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Lost => write!(f, "lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server ended the stream.
    Server,
    /// The transport reported an error.
    Error(String),
    /// We closed it: logout, identity change or shutdown.
    Client,
}

/// Lifecycle notifications, broadcast to every listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// First open for the current identity.
    Opened { user_id: String },
    /// Open again after a drop. Frames sent in between were missed.
    Reconnected { user_id: String },
    Closed { reason: CloseReason },
    Lost { attempts: u32 },
}

struct Reader {
    conn_id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Session {
    identity: Option<Identity>,
    reader: Option<Reader>,
    /// Set once a connection opened for the current identity.
    opened_once: bool,
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    router: MessageRouter,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    /// Bumped whenever the live reader changes; a reader only reports its own
    /// close while its epoch is current.
    epoch: AtomicU64,
    session: Mutex<Session>,
    /// Cancelled by every logout; a dial started before it gives up.
    logout: StdMutex<CancellationToken>,
    shutdown: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    /// Token that the next logout cancels. Taken before waiting on the session.
    fn logout_token(&self) -> CancellationToken {
        match self.logout.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Abandon every dial started so far.
    fn cancel_dials(&self) {
        let mut guard = match self.logout.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.cancel();
        *guard = CancellationToken::new();
    }

    fn emit(&self, event: ConnectionEvent) {
        // No listeners is fine.
        let _ = self.events_tx.send(event);
    }
}

/// Process-wide realtime connection. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_registry(config, connector, tokens, ChannelRegistry::new())
    }

    pub fn with_registry(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
        registry: ChannelRegistry,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                tokens,
                router: MessageRouter::new(registry),
                state_tx,
                events_tx,
                epoch: AtomicU64::new(0),
                session: Mutex::new(Session::default()),
                logout: StdMutex::new(CancellationToken::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// WebSocket connector and the token source named by `config`.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let tokens = token_source_from_config(&config)?;
        let connector = Arc::new(WsConnector::new(config.connect_timeout()));
        Ok(Self::new(config, connector, tokens))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        self.shared.router.registry()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.shared.router.stats()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events_tx.subscribe()
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.shared.session.lock().await.identity.clone()
    }

    pub fn subscribe<F>(&self, key: ChannelKey, callback: F) -> Subscription
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.registry().subscribe(key, callback)
    }

    pub fn unsubscribe(&self, key: &ChannelKey) -> bool {
        self.registry().unsubscribe(key)
    }

    /// Open a connection for `identity`, replacing any existing one.
    ///
    /// No-op when already open for the same identity. Fails with
    /// [`ClientError::ConnectCancelled`] when a logout lands before the
    /// socket is open.
    pub async fn connect(&self, identity: Identity) -> Result<()> {
        let logout = self.shared.logout_token();
        let mut session = self.shared.session.lock().await;
        if logout.is_cancelled() {
            return Err(ClientError::ConnectCancelled);
        }
        if session.identity.as_ref() == Some(&identity) && self.state() == ConnectionState::Open {
            return Ok(());
        }
        if session.identity.as_ref() != Some(&identity) {
            session.opened_once = false;
        }
        session.identity = Some(identity);
        self.open_locked(&mut session, &logout).await
    }

    /// Close the connection and forget the identity (logout).
    ///
    /// A dial in progress is abandoned rather than waited for.
    pub async fn disconnect(&self) {
        self.shared.cancel_dials();
        let mut session = self.shared.session.lock().await;
        // Stale epoch first: the reader can no longer report its own close.
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let was_open = self.state() == ConnectionState::Open;
        session.identity = None;
        session.opened_once = false;
        self.teardown_locked(&mut session).await;
        self.shared.set_state(ConnectionState::Disconnected);
        if was_open {
            info!("realtime connection closed on logout");
            self.shared.emit(ConnectionEvent::Closed { reason: CloseReason::Client });
        }
    }

    /// React to the authenticated user changing. `None` means logged out.
    ///
    /// Setting the identity that is already current does nothing; recovery of
    /// a dropped socket is the supervisor's job.
    pub async fn set_identity(&self, identity: Option<Identity>) -> Result<()> {
        match identity {
            None => {
                self.disconnect().await;
                Ok(())
            }
            Some(id) => {
                if self.identity().await.as_ref() == Some(&id) {
                    return Ok(());
                }
                self.connect(id).await
            }
        }
    }

    /// Reopen the connection for the current identity if it is not open.
    pub async fn reconnect(&self) -> Result<()> {
        let logout = self.shared.logout_token();
        let mut session = self.shared.session.lock().await;
        if session.identity.is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        self.open_locked(&mut session, &logout).await
    }

    /// Stop the supervisor and close the connection.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.disconnect().await;
    }

    async fn open_locked(&self, session: &mut Session, logout: &CancellationToken) -> Result<()> {
        let Some(identity) = session.identity.clone() else {
            return Err(ClientError::NotAuthenticated);
        };
        self.teardown_locked(session).await;

        let Some(token) = self.shared.tokens.access_token() else {
            self.shared.set_state(ConnectionState::Disconnected);
            warn!(user_id = %identity.user_id, "no access token, not connecting");
            return Err(ClientError::MissingToken);
        };
        let url = match stream_url(&self.shared.config.ws_url, &token) {
            Ok(url) => url,
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.shared.set_state(ConnectionState::Connecting);
        info!(user_id = %identity.user_id, ws_url = %self.shared.config.ws_url, "opening realtime connection");

        let dialed = tokio::select! {
            _ = logout.cancelled() => Err(ClientError::ConnectCancelled),
            result = self.shared.connector.connect(url) => result,
        };
        let transport = match dialed {
            Ok(t) => t,
            Err(ClientError::ConnectCancelled) => {
                self.shared.set_state(ConnectionState::Disconnected);
                info!(user_id = %identity.user_id, "connection attempt abandoned on logout");
                return Err(ClientError::ConnectCancelled);
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!(user_id = %identity.user_id, error = %e, "realtime connection failed");
                return Err(e);
            }
        };

        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let conn_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        self.shared.set_state(ConnectionState::Open);
        let event = if session.opened_once {
            ConnectionEvent::Reconnected { user_id: identity.user_id.clone() }
        } else {
            ConnectionEvent::Opened { user_id: identity.user_id.clone() }
        };
        session.opened_once = true;
        info!(%conn_id, user_id = %identity.user_id, "realtime connection open");
        self.shared.emit(event);

        let task = tokio::spawn(read_loop(
            Arc::clone(&self.shared),
            transport,
            cancel.clone(),
            epoch,
            conn_id,
        ));
        session.reader = Some(Reader { conn_id, cancel, task });
        Ok(())
    }

    /// Close the live connection, if any, and wait for its reader to finish.
    async fn teardown_locked(&self, session: &mut Session) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let Some(reader) = session.reader.take() else {
            return;
        };
        reader.cancel.cancel();
        let abort = reader.task.abort_handle();
        match tokio::time::timeout(CLOSE_GRACE, reader.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => warn!(conn_id = %reader.conn_id, error = %e, "reader task failed"),
            Err(_) => {
                warn!(conn_id = %reader.conn_id, "reader did not close in time, aborting");
                abort.abort();
            }
        }
        debug!(conn_id = %reader.conn_id, "previous connection torn down");
    }

    async fn needs_reconnect(&self) -> bool {
        let has_identity = self.shared.session.lock().await.identity.is_some();
        has_identity && self.state() == ConnectionState::Disconnected
    }

    async fn mark_lost(&self, attempts: u32) {
        let session = self.shared.session.lock().await;
        if session.identity.is_some() && self.state() == ConnectionState::Disconnected {
            self.shared.set_state(ConnectionState::Lost);
            error!(attempts, "realtime connection lost, giving up");
            self.shared.emit(ConnectionEvent::Lost { attempts });
        }
    }

    /// Spawn the task that keeps the connection alive.
    ///
    /// Stops on [`shutdown`](Self::shutdown) or when the handle is aborted.
    pub fn spawn_supervisor(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.shared.config.reconnect.clone() {
                ReconnectPolicy::Poll { interval_ms } => {
                    manager.supervise_poll(Duration::from_millis(interval_ms.max(1))).await
                }
                policy @ ReconnectPolicy::Backoff { .. } => manager.supervise_backoff(policy).await,
            }
        })
    }

    /// Every `period`, reopen the socket if the user is logged in and it is closed.
    async fn supervise_poll(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        let mut consecutive_failures: u32 = 0;
        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.needs_reconnect().await {
                continue;
            }
            info!("realtime connection closed, reconnecting");
            match self.reconnect().await {
                Ok(()) => consecutive_failures = 0,
                Err(ClientError::ConnectCancelled | ClientError::NotAuthenticated) => {}
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    if consecutive_failures >= NOISY_FAILURE_THRESHOLD {
                        error!(error = %e, consecutive_failures, "reconnect failed repeatedly, will retry next tick");
                    } else {
                        warn!(error = %e, "reconnect failed, will retry next tick");
                    }
                }
            }
        }
        debug!("poll supervisor stopped");
    }

    /// Reopen as soon as the socket drops, backing off between failures.
    async fn supervise_backoff(&self, policy: ReconnectPolicy) {
        let mut state_rx = self.watch_state();
        loop {
            let current = *state_rx.borrow_and_update();
            if current != ConnectionState::Disconnected || !self.needs_reconnect().await {
                tokio::select! {
                    _ = self.shared.shutdown.cancelled() => break,
                    changed = state_rx.changed() => if changed.is_err() { break },
                }
                continue;
            }

            let mut failures: u32 = 0;
            loop {
                if !policy.allows_retry(failures) {
                    self.mark_lost(failures).await;
                    break;
                }
                let delay = with_jitter(policy.delay_for(failures + 1));
                debug!(attempt = failures + 1, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                tokio::select! {
                    _ = self.shared.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if !self.needs_reconnect().await {
                    break;
                }
                match self.reconnect().await {
                    Ok(()) => break,
                    Err(ClientError::ConnectCancelled | ClientError::NotAuthenticated) => break,
                    Err(e) => {
                        failures += 1;
                        warn!(attempt = failures, error = %e, "reconnect attempt failed");
                    }
                }
            }
        }
        debug!("backoff supervisor stopped");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("ws_url", &self.shared.config.ws_url)
            .field("state", &self.state())
            .finish()
    }
}

/// Add up to 10% random jitter.
fn with_jitter(base: Duration) -> Duration {
    let max_extra = (base.as_millis() as u64) / 10;
    if max_extra == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=max_extra))
}

async fn read_loop(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    cancel: CancellationToken,
    epoch: u64,
    conn_id: Uuid,
) {
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = transport.close().await {
                    debug!(%conn_id, error = %e, "error while closing transport");
                }
                return;
            }
            frame = transport.next_frame() => match frame {
                Some(Ok(text)) => {
                    shared.router.dispatch(&text);
                }
                Some(Err(e)) => {
                    warn!(%conn_id, error = %e, "realtime connection error");
                    break CloseReason::Error(e.to_string());
                }
                None => {
                    info!(%conn_id, "realtime connection closed by server");
                    break CloseReason::Server;
                }
            }
        }
    };

    // Only report the close if no newer connection has taken over.
    let reported = shared.state_tx.send_if_modified(|state| {
        if shared.epoch.load(Ordering::SeqCst) == epoch && *state == ConnectionState::Open {
            *state = ConnectionState::Disconnected;
            true
        } else {
            false
        }
    });
    if reported {
        shared.emit(ConnectionEvent::Closed { reason });
    }
}
