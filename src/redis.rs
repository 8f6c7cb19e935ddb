//! Redis-backed event driver for distributed deployments.
//!
//! Events are double-written: appended to a per-topic durable list for
//! replayable, at-least-once delivery, and published on a live pub/sub
//! channel for real-time, at-most-once delivery. Consumers track their
//! progress through each durable list with a per-service position persisted
//! in Redis, so a restarted service resumes where it left off.
//!
//! Two connections are held: a command connection for publishing and data
//! commands, and a dedicated subscribe connection, because a connection
//! with active subscriptions cannot interleave arbitrary commands.
//!
//! All registry, subscription and position state is owned by a single
//! background task; the public methods talk to it over a command channel.
//!
//! # Keyspace
//!
//! - `durable:<topic>` — LPUSH list of JSON event records
//! - `live:<topic>` — pub/sub channel carrying the same JSON records
//! - `position:durable:<topic>:<service>` — last processed list index

use crate::bus::EventBusDriver;
use crate::config::RedisConfig;
use crate::error::{EventBusError, EventBusResult};
use crate::pattern;
use crate::retry::{with_retry, RetryConfig};
use crate::types::{now_ms, ConnectionState, DriverName, EventPayload, EventRecord, SharedHandler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;

const DURABLE_PREFIX: &str = "durable:";
const LIVE_PREFIX: &str = "live:";
const POSITION_PREFIX: &str = "position:";
const SCAN_COUNT: usize = 100;
const RECONNECT_CAP: Duration = Duration::from_millis(3000);

/// Requests handled by the driver task.
enum Command {
    Subscribe {
        pattern: String,
        handler: SharedHandler,
    },
    SubscribeDurable {
        pattern: String,
        handler: SharedHandler,
        done: oneshot::Sender<EventBusResult<()>>,
    },
    Off {
        pattern: String,
        handler: Option<SharedHandler>,
    },
    RemoveAll {
        pattern: Option<String>,
    },
    ListenerCount {
        pattern: String,
        reply: oneshot::Sender<usize>,
    },
    EventNames {
        reply: oneshot::Sender<Vec<String>>,
    },
    Connect {
        done: oneshot::Sender<EventBusResult<()>>,
    },
    Disconnect {
        done: oneshot::Sender<EventBusResult<()>>,
    },
}

/// Redis-backed event driver.
///
/// Cheap to share behind the facade; the heavy state lives in the driver
/// task spawned at construction.
pub struct RedisEventDriver {
    config: RedisConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    publish: Arc<RwLock<Option<ConnectionManager>>>,
}

impl std::fmt::Debug for RedisEventDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventDriver")
            .field("service_name", &self.config.service_name)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl RedisEventDriver {
    /// Create a new Redis event driver and spawn its background task.
    ///
    /// Must be called from within a Tokio runtime. No connection is opened
    /// until [`connect`](Self::connect).
    pub fn new(config: RedisConfig) -> EventBusResult<Self> {
        let client = Client::open(config.url()).map_err(connection_error)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let publish = Arc::new(RwLock::new(None));

        tracing::info!(service = %config.service_name, "redis event driver initialized");

        let task = DriverTask {
            config: config.clone(),
            client,
            publish: publish.clone(),
            state: state_tx,
            handlers: HashMap::new(),
            subscribed: HashSet::new(),
            positions: HashMap::new(),
            positions_loaded: false,
            pending_durable: Vec::new(),
            pubsub: None,
            reconnect_attempt: 0,
        };
        tokio::spawn(task.run(cmd_rx));

        Ok(Self {
            config,
            cmd_tx,
            state_rx,
            publish,
        })
    }

    /// Open the publish and subscribe connections.
    pub async fn connect(&self) -> EventBusResult<()> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { done })
            .map_err(|_| driver_closed())?;
        rx.await.map_err(|_| driver_closed())?
    }

    /// Close both connections.
    pub async fn disconnect(&self) -> EventBusResult<()> {
        let (done, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disconnect { done })
            .map_err(|_| driver_closed())?;
        rx.await.map_err(|_| driver_closed())?
    }

    /// Whether both connections are currently ready.
    pub fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Connected
    }

    /// Block until the connection pair reports ready.
    async fn wait_for_connection(&self) -> EventBusResult<()> {
        let mut state = self.state_rx.clone();
        if *state.borrow() != ConnectionState::Connected {
            tracing::warn!("waiting for connection...");
        }
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .map(|_| ())
            .map_err(|_| driver_closed())
    }

    async fn publish_connection(&self) -> EventBusResult<ConnectionManager> {
        self.publish
            .read()
            .await
            .clone()
            .ok_or_else(|| connection_error("publish connection not established"))
    }

    /// One emit attempt: durable append, optional trim, live publish.
    async fn try_emit(
        &self,
        durable_key: &str,
        live_channel: &str,
        message: &str,
    ) -> EventBusResult<()> {
        self.wait_for_connection().await?;
        let mut conn = self.publish_connection().await?;

        conn.lpush::<_, _, ()>(durable_key, message)
            .await
            .map_err(connection_error)?;

        if let Some(max) = self.config.max_log_entries.filter(|max| *max > 0) {
            conn.ltrim::<_, ()>(durable_key, 0, max as isize - 1)
                .await
                .map_err(connection_error)?;
        }

        conn.publish::<_, _, ()>(live_channel, message)
            .await
            .map_err(connection_error)?;

        Ok(())
    }
}

#[async_trait]
impl EventBusDriver for RedisEventDriver {
    fn name(&self) -> DriverName {
        DriverName::Redis
    }

    async fn emit(
        &self,
        event: &str,
        data: serde_json::Value,
        ttl_minutes: Option<u64>,
    ) -> EventBusResult<()> {
        let record = EventRecord::from(EventPayload::new(event, data, ttl_minutes));
        let message = serde_json::to_string(&record).map_err(|e| EventBusError::Serialization {
            driver: DriverName::Redis,
            message: e.to_string(),
        })?;

        let durable_key = format!("{DURABLE_PREFIX}{event}");
        let live_channel = format!("{LIVE_PREFIX}{event}");

        with_retry(&RetryConfig::default(), || {
            self.try_emit(&durable_key, &live_channel, &message)
        })
        .await
        .map_err(|e| EventBusError::Emit {
            driver: DriverName::Redis,
            event: event.to_string(),
            message: e.to_string(),
        })?;

        if let Some(minutes) = ttl_minutes {
            tracing::info!(event, ttl_minutes = minutes, "event saved to durable log and published live");
        } else {
            tracing::info!(event, "event saved to durable log and published live");
        }
        Ok(())
    }

    fn on(&self, pattern: &str, handler: SharedHandler) {
        let sent = self.cmd_tx.send(Command::Subscribe {
            pattern: pattern.to_string(),
            handler,
        });
        if sent.is_err() {
            tracing::error!(pattern, "driver task is gone, subscription dropped");
        }
    }

    fn on_durable(&self, pattern: &str, handler: SharedHandler) -> JoinHandle<EventBusResult<()>> {
        let (done, rx) = oneshot::channel();
        let sent = self.cmd_tx.send(Command::SubscribeDurable {
            pattern: pattern.to_string(),
            handler,
            done,
        });
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let result = match sent {
                Ok(()) => rx.await.unwrap_or_else(|_| Err(driver_closed())),
                Err(_) => Err(driver_closed()),
            };
            if let Err(e) = &result {
                tracing::error!(pattern, error = %e, "failed to set up durable subscription");
            }
            result
        })
    }

    fn off(&self, pattern: &str, handler: Option<&SharedHandler>) {
        let sent = self.cmd_tx.send(Command::Off {
            pattern: pattern.to_string(),
            handler: handler.cloned(),
        });
        if sent.is_err() {
            tracing::warn!(pattern, "driver task is gone, nothing to unsubscribe");
        }
    }

    fn remove_all_listeners(&self, pattern: Option<&str>) {
        let _ = self.cmd_tx.send(Command::RemoveAll {
            pattern: pattern.map(str::to_string),
        });
    }

    async fn listener_count(&self, pattern: &str) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ListenerCount {
                pattern: pattern.to_string(),
                reply,
            })
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn event_names(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::EventNames { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Owns every piece of mutable driver state and serializes access to it.
struct DriverTask {
    config: RedisConfig,
    client: Client,
    publish: Arc<RwLock<Option<ConnectionManager>>>,
    state: watch::Sender<ConnectionState>,
    /// Registered handlers, keyed by the caller's pattern.
    handlers: HashMap<String, Vec<SharedHandler>>,
    /// Patterns currently subscribed on the subscribe connection.
    subscribed: HashSet<String>,
    /// Last processed durable-list index per `durable:<topic>` key.
    positions: HashMap<String, i64>,
    positions_loaded: bool,
    /// Durable setups queued until the connection pair is ready.
    pending_durable: Vec<(String, SharedHandler, oneshot::Sender<EventBusResult<()>>)>,
    pubsub: Option<PubSub>,
    reconnect_attempt: u32,
}

enum Step {
    Message(Option<redis::Msg>),
    Command(Option<Command>),
}

impl DriverTask {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let state = *self.state.borrow();
            match state {
                ConnectionState::Connected => {
                    let step = match self.pubsub.as_mut() {
                        Some(pubsub) => {
                            let mut stream = pubsub.on_message();
                            tokio::select! {
                                msg = stream.next() => Step::Message(msg),
                                cmd = cmd_rx.recv() => Step::Command(cmd),
                            }
                        }
                        None => Step::Command(cmd_rx.recv().await),
                    };
                    match step {
                        Step::Message(Some(msg)) => self.deliver(msg),
                        Step::Message(None) => self.connection_lost("subscribe connection closed"),
                        Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                        Step::Command(None) => break,
                    }
                }
                ConnectionState::Reconnecting => {
                    let delay = reconnect_delay(self.reconnect_attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => self.try_reconnect().await,
                        cmd = cmd_rx.recv() => match cmd {
                            Some(cmd) => self.handle_command(cmd).await,
                            None => break,
                        },
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Connecting => {
                    match cmd_rx.recv().await {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("redis event driver task stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { pattern, handler } => {
                self.handlers
                    .entry(pattern.clone())
                    .or_default()
                    .push(handler);
                if *self.state.borrow() == ConnectionState::Connected {
                    self.subscribe_pattern(&pattern).await;
                }
                // Otherwise the pattern is picked up by the subscription
                // replay when the connection comes up.
            }
            Command::SubscribeDurable {
                pattern,
                handler,
                done,
            } => {
                if *self.state.borrow() == ConnectionState::Connected {
                    let result = self.setup_durable(&pattern, handler).await;
                    let _ = done.send(result);
                } else {
                    self.pending_durable.push((pattern, handler, done));
                }
            }
            Command::Off { pattern, handler } => {
                self.remove_handlers(&pattern, handler.as_ref()).await;
            }
            Command::RemoveAll {
                pattern: Some(pattern),
            } => {
                self.remove_handlers(&pattern, None).await;
            }
            Command::RemoveAll { pattern: None } => {
                let patterns: Vec<String> = self.handlers.keys().cloned().collect();
                for pattern in patterns {
                    self.unsubscribe_pattern(&pattern).await;
                }
                self.handlers.clear();
                self.subscribed.clear();
            }
            Command::ListenerCount { pattern, reply } => {
                let _ = reply.send(self.handlers.get(&pattern).map_or(0, Vec::len));
            }
            Command::EventNames { reply } => {
                let _ = reply.send(self.handlers.keys().cloned().collect());
            }
            Command::Connect { done } => {
                let result = self.do_connect().await;
                let _ = done.send(result);
            }
            Command::Disconnect { done } => {
                let result = self.do_disconnect().await;
                let _ = done.send(result);
            }
        }
    }

    /// Dispatch a live message to every handler whose pattern matches.
    fn deliver(&self, msg: redis::Msg) {
        let channel = msg.get_channel_name().to_string();
        let raw: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "failed to read message payload");
                return;
            }
        };
        let record: EventRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "failed to deserialize event");
                return;
            }
        };

        let topic = channel.strip_prefix(LIVE_PREFIX).unwrap_or(&channel);
        let payload = EventPayload::from(record);

        for (pattern, handlers) in &self.handlers {
            if pattern::matches(topic, pattern) {
                for handler in handlers {
                    if let Err(e) = handler.handle(&payload) {
                        tracing::error!(topic, pattern = %pattern, error = %e, "handler error");
                    }
                }
            }
        }
    }

    /// Run the durable setup sequence for one pattern.
    ///
    /// Only called while connected; callers that arrive earlier are queued.
    async fn setup_durable(
        &mut self,
        pattern: &str,
        handler: SharedHandler,
    ) -> EventBusResult<()> {
        if !self.positions_loaded {
            self.load_positions().await;
            self.positions_loaded = true;
        }

        self.read_past_events(pattern, &handler).await?;

        self.handlers
            .entry(pattern.to_string())
            .or_default()
            .push(handler);
        self.subscribe_pattern(pattern).await;

        tracing::info!(pattern, "durable subscription created");
        Ok(())
    }

    /// Load every persisted position for this service, once per process.
    async fn load_positions(&mut self) {
        let Some(mut conn) = self.command_connection().await else {
            tracing::error!("cannot load consumer positions, publish connection unavailable");
            return;
        };

        let glob = format!(
            "{POSITION_PREFIX}{DURABLE_PREFIX}*:{}",
            self.config.service_name
        );
        let keys = match scan_keys(&mut conn, &glob).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, "failed to load persisted positions");
                return;
            }
        };

        for key in keys {
            match conn.get::<_, Option<String>>(&key).await {
                Ok(Some(raw)) => {
                    let Some(durable_key) = position_durable_key(&key, &self.config.service_name)
                    else {
                        continue;
                    };
                    match raw.parse::<i64>() {
                        Ok(position) => {
                            tracing::debug!(
                                service = %self.config.service_name,
                                key = %durable_key,
                                position,
                                "loaded consumer position"
                            );
                            self.positions.insert(durable_key, position);
                        }
                        Err(_) => {
                            tracing::warn!(key = %key, value = %raw, "ignoring malformed position");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(key = %key, error = %e, "failed to read position"),
            }
        }

        tracing::debug!(
            service = %self.config.service_name,
            count = self.positions.len(),
            "loaded persisted consumer positions"
        );
    }

    /// Replay unread durable records for every log matching the pattern.
    ///
    /// A failure on one key is logged and does not block the others.
    async fn read_past_events(
        &mut self,
        pattern: &str,
        handler: &SharedHandler,
    ) -> EventBusResult<()> {
        let mut conn = self
            .command_connection()
            .await
            .ok_or_else(|| connection_error("publish connection not established"))?;

        // Wildcard patterns are expanded against actual keys; Redis glob
        // semantics apply here, so `*` crosses segment boundaries.
        let glob = format!("{DURABLE_PREFIX}{pattern}");
        let keys = match scan_keys(&mut conn, &glob).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(pattern, error = %e, "failed to enumerate durable logs");
                return Ok(());
            }
        };

        for key in keys {
            if let Err(e) = self.catch_up_key(&mut conn, &key, handler).await {
                tracing::error!(key = %key, error = %e, "failed to replay durable log");
            }
        }
        Ok(())
    }

    /// Deliver the unread records of one durable log, then persist the new
    /// position. The position write is not atomic with dispatch: a crash in
    /// between redelivers the batch on the next catch-up, so handlers must
    /// be idempotent.
    async fn catch_up_key(
        &mut self,
        conn: &mut ConnectionManager,
        key: &str,
        handler: &SharedHandler,
    ) -> EventBusResult<()> {
        let last_processed = self.positions.get(key).copied().unwrap_or(-1);
        let len: i64 = conn.llen(key).await.map_err(connection_error)?;

        let unread = unread_count(len, last_processed);
        if unread <= 0 {
            tracing::debug!(key = %key, position = last_processed, "no new durable records");
            return Ok(());
        }

        // LPUSH prepends, so the unread tail of the log sits at the head of
        // the list, newest first. Reverse to restore emission order.
        let mut rows: Vec<String> = conn
            .lrange(key, 0, (unread - 1) as isize)
            .await
            .map_err(connection_error)?;
        rows.reverse();

        tracing::debug!(key = %key, count = rows.len(), position = last_processed, "replaying durable records");

        let now = now_ms();
        for raw in &rows {
            match serde_json::from_str::<EventRecord>(raw) {
                Ok(record) => {
                    if record.is_expired(now) {
                        tracing::info!(
                            event = %record.event,
                            expired_at = %record.expires_at.map(format_ms).unwrap_or_default(),
                            "skipping expired durable record"
                        );
                        continue;
                    }
                    let payload = EventPayload::from(record);
                    if let Err(e) = handler.handle(&payload) {
                        tracing::error!(key = %key, event = %payload.name, error = %e, "handler error during replay");
                    }
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "skipping unreadable durable record");
                }
            }
        }

        let new_position = len - 1;
        self.positions.insert(key.to_string(), new_position);

        let position_key = format!("{POSITION_PREFIX}{key}:{}", self.config.service_name);
        if let Err(e) = conn
            .set::<_, _, ()>(&position_key, new_position.to_string())
            .await
        {
            tracing::error!(key = %position_key, error = %e, "failed to persist consumer position");
        } else {
            tracing::debug!(
                service = %self.config.service_name,
                key = %key,
                position = new_position,
                "persisted consumer position"
            );
        }

        Ok(())
    }

    /// Subscribe the live channel for a pattern on the subscribe connection.
    async fn subscribe_pattern(&mut self, pattern: &str) {
        if self.subscribed.contains(pattern) {
            tracing::debug!(pattern, "already subscribed, skipping");
            return;
        }
        let Some(pubsub) = self.pubsub.as_mut() else {
            return;
        };

        let channel = format!("{LIVE_PREFIX}{pattern}");
        let result = if pattern::is_wildcard(pattern) {
            pubsub.psubscribe(&channel).await
        } else {
            pubsub.subscribe(&channel).await
        };

        match result {
            Ok(()) => {
                self.subscribed.insert(pattern.to_string());
                tracing::debug!(pattern, "subscribed to live channel");
            }
            Err(e) => tracing::error!(pattern, error = %e, "failed to subscribe"),
        }
    }

    /// Best-effort unsubscribe; failures are logged and swallowed.
    async fn unsubscribe_pattern(&mut self, pattern: &str) {
        if !self.subscribed.remove(pattern) {
            return;
        }
        let Some(pubsub) = self.pubsub.as_mut() else {
            return;
        };

        let channel = format!("{LIVE_PREFIX}{pattern}");
        let result = if pattern::is_wildcard(pattern) {
            pubsub.punsubscribe(&channel).await
        } else {
            pubsub.unsubscribe(&channel).await
        };

        if let Err(e) = result {
            tracing::error!(pattern, error = %e, "failed to unsubscribe");
        }
    }

    async fn do_connect(&mut self) -> EventBusResult<()> {
        if *self.state.borrow() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        match self.open_connections().await {
            Ok(()) => {
                self.reconnect_attempt = 0;
                self.set_state(ConnectionState::Connected);
                self.on_connected().await;
                tracing::info!("connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open_connections(&mut self) -> EventBusResult<()> {
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(connection_error)?;
        let pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(connection_error)?
            .into_pubsub();

        *self.publish.write().await = Some(manager);
        self.pubsub = Some(pubsub);
        Ok(())
    }

    async fn do_disconnect(&mut self) -> EventBusResult<()> {
        self.pubsub = None;
        *self.publish.write().await = None;
        self.subscribed.clear();
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("disconnected");
        Ok(())
    }

    /// Entered once per outage; further loss signals are ignored while a
    /// reconnect is already in progress.
    fn connection_lost(&mut self, reason: &str) {
        if *self.state.borrow() == ConnectionState::Reconnecting {
            return;
        }
        tracing::error!(reason, "connection lost");
        self.pubsub = None;
        self.subscribed.clear();
        self.set_state(ConnectionState::Disconnected);
        self.reconnect_attempt = 1;
        self.set_state(ConnectionState::Reconnecting);
    }

    async fn try_reconnect(&mut self) {
        tracing::warn!(attempt = self.reconnect_attempt, "attempting to reconnect");
        match self.reopen().await {
            Ok(()) => {
                self.reconnect_attempt = 0;
                self.set_state(ConnectionState::Connected);
                self.on_connected().await;
                tracing::info!("reconnected");
            }
            Err(e) => {
                tracing::error!(attempt = self.reconnect_attempt, error = %e, "reconnect attempt failed");
                self.reconnect_attempt += 1;
            }
        }
    }

    /// Recreate the subscribe connection and confirm the command connection
    /// answers before the pair counts as ready again.
    async fn reopen(&mut self) -> EventBusResult<()> {
        let pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(connection_error)?
            .into_pubsub();

        let mut manager = match self.command_connection().await {
            Some(manager) => manager,
            None => {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(connection_error)?;
                *self.publish.write().await = Some(manager.clone());
                manager
            }
        };
        redis::cmd("PING")
            .query_async::<_, String>(&mut manager)
            .await
            .map_err(connection_error)?;

        self.pubsub = Some(pubsub);
        Ok(())
    }

    /// Runs on every transition into `Connected`: replays the subscription
    /// set on the fresh subscribe connection and drains queued durable
    /// setups.
    async fn on_connected(&mut self) {
        self.subscribed.clear();
        let patterns: Vec<String> = self.handlers.keys().cloned().collect();
        for pattern in patterns {
            self.subscribe_pattern(&pattern).await;
        }

        let pending = std::mem::take(&mut self.pending_durable);
        for (pattern, handler, done) in pending {
            let result = self.setup_durable(&pattern, handler).await;
            let _ = done.send(result);
        }
    }

    async fn remove_handlers(&mut self, pattern: &str, target: Option<&SharedHandler>) {
        let now_empty = match self.handlers.get_mut(pattern) {
            None => return,
            Some(handlers) => {
                match target {
                    Some(target) => handlers.retain(|candidate| !Arc::ptr_eq(candidate, target)),
                    None => handlers.clear(),
                }
                handlers.is_empty()
            }
        };
        if now_empty {
            self.handlers.remove(pattern);
            self.unsubscribe_pattern(pattern).await;
        }
    }

    async fn command_connection(&self) -> Option<ConnectionManager> {
        self.publish.read().await.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }
}

/// Enumerate keys matching a Redis glob with cursor-based SCAN.
async fn scan_keys(
    conn: &mut ConnectionManager,
    glob: &str,
) -> Result<Vec<String>, redis::RedisError> {
    let mut keys = Vec::new();
    let mut cursor: u64 = 0;
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(glob)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(keys)
}

/// Extract the durable key from `position:<durable key>:<service>`.
fn position_durable_key(position_key: &str, service_name: &str) -> Option<String> {
    let suffix = format!(":{service_name}");
    position_key
        .strip_prefix(POSITION_PREFIX)?
        .strip_suffix(suffix.as_str())
        .map(str::to_string)
}

/// Number of durable records not yet processed by this consumer.
fn unread_count(len: i64, last_processed: i64) -> i64 {
    len - (last_processed + 1)
}

/// Backoff before the given reconnect attempt.
fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_millis(u64::from(attempt) * 100).min(RECONNECT_CAP)
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

fn connection_error(e: impl std::fmt::Display) -> EventBusError {
    EventBusError::Connection {
        driver: DriverName::Redis,
        message: e.to_string(),
    }
}

fn driver_closed() -> EventBusError {
    EventBusError::DriverClosed {
        driver: DriverName::Redis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_parsing() {
        let _ = Client::open("redis://localhost:6379");
        let _ = Client::open("redis://:secret@localhost:6379/2");
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(
            format!("{DURABLE_PREFIX}orders.created"),
            "durable:orders.created"
        );
        assert_eq!(format!("{LIVE_PREFIX}orders.created"), "live:orders.created");
        assert_eq!(
            format!("{POSITION_PREFIX}durable:orders.created:billing"),
            "position:durable:orders.created:billing"
        );
    }

    #[test]
    fn test_position_key_round_trip() {
        assert_eq!(
            position_durable_key("position:durable:orders.created:billing", "billing").as_deref(),
            Some("durable:orders.created")
        );
        // Wrong service name does not parse.
        assert_eq!(
            position_durable_key("position:durable:orders.created:billing", "shipping"),
            None
        );
        assert_eq!(position_durable_key("durable:orders.created", "billing"), None);
    }

    #[test]
    fn test_unread_count() {
        // Fresh consumer sees the whole log.
        assert_eq!(unread_count(5, -1), 5);
        // Fully caught up.
        assert_eq!(unread_count(5, 4), 0);
        // Partially caught up.
        assert_eq!(unread_count(7, 4), 2);
        // A trimmed log never yields a negative batch.
        assert!(unread_count(3, 9) <= 0);
    }

    #[test]
    fn test_reconnect_backoff_schedule() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(reconnect_delay(5), Duration::from_millis(500));
        assert_eq!(reconnect_delay(30), Duration::from_millis(3000));
        // Capped thereafter.
        assert_eq!(reconnect_delay(500), Duration::from_millis(3000));
    }

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(0), "1970-01-01T00:00:00+00:00");
    }
}
