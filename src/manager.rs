// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the single long-lived connection to the broker and the one
//! channel maintained over it. The [`ConnectionManager`] drives an explicit
//! lifecycle state machine (`Disconnected -> Connecting -> Connected`, with
//! `Reconnecting` on failure) and recovers from connection loss on a fixed
//! interval with no retry ceiling.
//!
//! Close detection is event driven: the connection's error callback feeds a
//! lifecycle channel consumed by a background task, which tears the handles
//! down and schedules the next attempt. Callers invoking operations while the
//! manager is reconnecting receive `ChannelUnavailable` instead of blocking.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Fair dispatch: a consumer receives a new delivery only after settling its
/// current one, so load spreads across consumers instead of maximizing
/// single-consumer throughput.
const PREFETCH_COUNT: u16 = 1;

const CLOSE_REPLY_CODE: u16 = 200;

/// Lifecycle state of the manager.
///
/// The state is mutated only by the manager itself. `Connected` implies both
/// the connection and the channel handle are installed; `Disconnected` and
/// `Reconnecting` imply both are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Health classification for [`HealthStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Snapshot of the connection for a broader service health report.
///
/// Produced without side effects: no liveness probe is performed, the details
/// only echo the configured connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub exchange: String,
}

pub(crate) enum LifecycleEvent {
    ConnectionLost(String),
    Shutdown,
}

#[derive(Default)]
struct Inner {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

/// Manages the process-wide connection and channel to the broker.
///
/// Construct one instance during application startup and share it as an
/// `Arc<ConnectionManager>`; every call site then reuses the same network
/// session for declarations, publishes and subscriptions.
pub struct ConnectionManager {
    pub(crate) cfg: AmqpConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ManagerState>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    shutdown: AtomicBool,
    /// Serializes channel-level operations; the wire protocol is not safe for
    /// interleaved use of one channel from multiple tasks.
    pub(crate) ops: Mutex<()>,
}

impl ConnectionManager {
    /// Creates a new manager and spawns its lifecycle task.
    ///
    /// Must be called from within a tokio runtime. The manager starts in the
    /// `Disconnected` state; call [`connect`](Self::connect) before issuing
    /// topology, publish or consume operations.
    ///
    /// # Parameters
    /// * `cfg` - Broker address, credentials and policy settings
    ///
    /// # Returns
    /// An `Arc`-wrapped manager for process-wide sharing
    pub fn new(cfg: AmqpConfig) -> Arc<ConnectionManager> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ManagerState::Disconnected);

        let manager = Arc::new(ConnectionManager {
            cfg,
            inner: Mutex::new(Inner::default()),
            state_tx,
            events,
            shutdown: AtomicBool::new(false),
            ops: Mutex::new(()),
        });

        tokio::spawn(lifecycle_loop(Arc::downgrade(&manager), events_rx));

        manager
    }

    /// Establishes the connection and channel.
    ///
    /// A no-op when already `Connected` with a live channel, and when an
    /// attempt is already in flight (`Connecting`) - the in-progress flag
    /// guards against duplicate concurrent attempts, callers are not queued.
    /// When `Connected` but the channel has died, a fresh channel is opened on
    /// the existing connection. Otherwise a full session is established:
    /// transport connection, one channel with prefetch 1, optional confirm
    /// mode, the configured default exchange, and error observers on the
    /// connection and the channel.
    ///
    /// # Returns
    /// Ok(()) on success; `ConnectionError` when the transport cannot be
    /// established, in which case a reconnection attempt has been scheduled
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.shutdown.store(false, Ordering::SeqCst);
        self.connect_inner().await
    }

    /// Connection attempt without resetting the shutdown latch, so background
    /// retries cannot revive a manager that was explicitly disconnected.
    async fn connect_inner(&self) -> Result<(), AmqpError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut inner = self.inner.lock().await;
            match self.state() {
                ManagerState::Connecting => return Ok(()),
                ManagerState::Connected => {
                    if inner.channel.as_ref().is_some_and(|ch| ch.status().connected()) {
                        return Ok(());
                    }

                    // The channel died while the connection stayed up; reopen
                    // it in place rather than rebuilding the session.
                    let reopened = match inner.connection.as_ref() {
                        Some(conn) if conn.status().connected() => {
                            Some(self.setup_channel(conn).await?)
                        }
                        _ => None,
                    };
                    if let Some(channel) = reopened {
                        inner.channel = Some(channel);
                        info!("amqp channel reopened");
                        return Ok(());
                    }

                    self.state_tx.send_replace(ManagerState::Connecting);
                }
                _ => {
                    self.state_tx.send_replace(ManagerState::Connecting);
                }
            }
        }

        match self.open_session().await {
            Ok((connection, channel)) => {
                if self.shutdown.load(Ordering::SeqCst) {
                    // disconnect() raced with this attempt; drop the session
                    let _ = connection.close(CLOSE_REPLY_CODE, "shutting down").await;
                    return Ok(());
                }
                let mut inner = self.inner.lock().await;
                inner.connection = Some(connection);
                inner.channel = Some(channel);
                self.state_tx.send_replace(ManagerState::Connected);
                info!(
                    host = %self.cfg.host,
                    port = self.cfg.port,
                    vhost = %self.cfg.vhost,
                    "amqp connected"
                );
                Ok(())
            }
            Err(err) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.connection = None;
                    inner.channel = None;
                }
                self.state_tx.send_replace(ManagerState::Reconnecting);
                let _ = self
                    .events
                    .send(LifecycleEvent::ConnectionLost(err.to_string()));
                Err(err)
            }
        }
    }

    /// Closes the channel and the connection and stops reconnecting.
    ///
    /// Idempotent when already disconnected. Close failures are logged and
    /// re-raised; callers performing a graceful shutdown must handle them.
    pub async fn disconnect(&self) -> Result<(), AmqpError> {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.events.send(LifecycleEvent::Shutdown);

        let (connection, channel) = {
            let mut inner = self.inner.lock().await;
            (inner.connection.take(), inner.channel.take())
        };

        if connection.is_none() && channel.is_none() && self.state() == ManagerState::Disconnected {
            return Ok(());
        }

        self.state_tx.send_replace(ManagerState::Disconnected);

        if let Some(channel) = channel {
            if channel.status().connected() {
                channel
                    .close(CLOSE_REPLY_CODE, "shutting down")
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to close the channel");
                        AmqpError::ConnectionError(err.to_string())
                    })?;
            }
        }

        if let Some(connection) = connection {
            if connection.status().connected() {
                connection
                    .close(CLOSE_REPLY_CODE, "shutting down")
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to close the connection");
                        AmqpError::ConnectionError(err.to_string())
                    })?;
            }
        }

        info!("amqp disconnected");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state_tx.borrow()
    }

    /// True iff the manager is in the `Connected` state. No liveness probe is
    /// performed.
    pub fn is_connected(&self) -> bool {
        self.state() == ManagerState::Connected
    }

    /// Subscription point for lifecycle transitions.
    ///
    /// # Returns
    /// A watch receiver that yields every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ManagerState> {
        self.state_tx.subscribe()
    }

    /// Builds a side-effect-free health snapshot with the configured
    /// connection parameters.
    pub fn health_status(&self) -> HealthStatus {
        let status = if self.is_connected() {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };

        HealthStatus {
            status,
            host: self.cfg.host.clone(),
            port: self.cfg.port,
            vhost: self.cfg.vhost.clone(),
            exchange: self.cfg.exchange.clone(),
        }
    }

    /// Borrows the active channel for one operation.
    ///
    /// A channel that reports closed while the connection is still up is
    /// discarded here; subsequent calls keep failing with
    /// `ChannelUnavailable` until the connection-level close triggers a full
    /// reconnection or an explicit `connect` reopens a channel.
    pub(crate) async fn channel(&self) -> Result<Channel, AmqpError> {
        let mut inner = self.inner.lock().await;

        let Some(channel) = inner.channel.clone() else {
            return Err(AmqpError::ChannelUnavailable);
        };

        if !channel.status().connected() {
            warn!("channel reported closed, discarding the handle");
            inner.channel = None;
            return Err(AmqpError::ChannelUnavailable);
        }

        Ok(channel)
    }

    async fn open_session(&self) -> Result<(Connection, Channel), AmqpError> {
        debug!(host = %self.cfg.host, port = self.cfg.port, "creating amqp connection...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.connection_name.clone()));

        let connection = match Connection::connect(&self.cfg.uri(), options).await {
            Ok(conn) => conn,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
        };
        debug!("amqp connected");

        let events = self.events.clone();
        connection.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection reported an error");
            let _ = events.send(LifecycleEvent::ConnectionLost(err.to_string()));
        });

        let channel = self.setup_channel(&connection).await?;

        Ok((connection, channel))
    }

    async fn setup_channel(&self, connection: &Connection) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(ch) => ch,
            Err(err) => {
                error!(error = err.to_string(), "failure to create the channel");
                return Err(AmqpError::ChannelUnavailable);
            }
        };

        channel.on_error(|err| {
            warn!(error = err.to_string(), "amqp channel reported an error");
        });

        if let Err(err) = channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QosDeclarationError(err.to_string()));
        }

        if self.cfg.publisher_confirms {
            if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
                error!(error = err.to_string(), "failure to enable confirm mode");
                return Err(AmqpError::QosDeclarationError(err.to_string()));
            }
        }

        if let Err(err) = channel
            .exchange_declare(
                &self.cfg.exchange,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            error!(
                error = err.to_string(),
                name = %self.cfg.exchange,
                "failure to declare the default exchange"
            );
            return Err(AmqpError::DeclareExchangeError(self.cfg.exchange.clone()));
        }

        debug!("channel created");
        Ok(channel)
    }

    /// Handles a connection-lost notification.
    ///
    /// Returns true when a reconnection attempt should follow. Stale
    /// notifications (explicit shutdown, an attempt already in flight, or a
    /// close event from a session that has since been replaced) are dropped.
    async fn mark_connection_lost(&self, reason: &str) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }

        let mut inner = self.inner.lock().await;
        match self.state() {
            ManagerState::Disconnected | ManagerState::Connecting => false,
            ManagerState::Reconnecting => true,
            ManagerState::Connected => {
                if inner
                    .connection
                    .as_ref()
                    .is_some_and(|conn| conn.status().connected())
                {
                    false
                } else {
                    inner.connection = None;
                    inner.channel = None;
                    self.state_tx.send_replace(ManagerState::Reconnecting);
                    warn!(reason, "amqp connection lost, scheduling reconnection");
                    true
                }
            }
        }
    }
}

/// Consumes lifecycle events and drives reconnection.
///
/// Every connection loss schedules one attempt after the configured fixed
/// interval; a failed attempt re-enqueues the next event, so retries continue
/// unbounded at a constant rate. Attempt failures are logged and raised to no
/// one - nothing awaits a background reconnection.
async fn lifecycle_loop(
    manager: Weak<ConnectionManager>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    while let Some(event) = events.recv().await {
        let reason = match event {
            LifecycleEvent::Shutdown => continue,
            LifecycleEvent::ConnectionLost(reason) => reason,
        };

        let interval = {
            let Some(manager) = manager.upgrade() else { return };
            if !manager.mark_connection_lost(&reason).await {
                continue;
            }
            manager.cfg.reconnect_interval()
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            next = events.recv() => match next {
                None => return,
                Some(LifecycleEvent::Shutdown) => continue,
                Some(LifecycleEvent::ConnectionLost(_)) => {}
            }
        }

        let Some(manager) = manager.upgrade() else { return };
        if manager.shutdown.load(Ordering::SeqCst) {
            continue;
        }

        match manager.connect_inner().await {
            Ok(()) => info!("amqp reconnected"),
            Err(err) => warn!(error = err.to_string(), "reconnection attempt failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> AmqpConfig {
        AmqpConfig {
            host: "127.0.0.1".to_owned(),
            // nothing listens on port 1, so connection attempts fail fast
            port: 1,
            reconnect_interval_secs: 1,
            ..AmqpConfig::default()
        }
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let manager = ConnectionManager::new(test_config());

        assert_eq!(manager.state(), ManagerState::Disconnected);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn health_reports_unhealthy_with_connection_details() {
        let manager = ConnectionManager::new(test_config());

        let health = manager.health_status();

        assert_eq!(health.status, HealthState::Unhealthy);
        assert_eq!(health.host, "127.0.0.1");
        assert_eq!(health.port, 1);
        assert_eq!(health.vhost, "/");
        assert_eq!(health.exchange, "events");
    }

    #[tokio::test]
    async fn connect_is_a_no_op_while_an_attempt_is_in_flight() {
        let manager = ConnectionManager::new(test_config());
        manager.state_tx.send_replace(ManagerState::Connecting);

        // would fail against port 1 if the guard did not short-circuit
        assert_eq!(manager.connect().await, Ok(()));
        assert_eq!(manager.state(), ManagerState::Connecting);
    }

    #[tokio::test]
    async fn failed_connect_surfaces_the_error_and_enters_reconnecting() {
        let manager = ConnectionManager::new(test_config());

        let err = manager.connect().await.expect_err("no broker is listening");

        assert!(matches!(err, AmqpError::ConnectionError(_)));
        assert_eq!(manager.state(), ManagerState::Reconnecting);
        assert!(!manager.is_connected());

        manager.disconnect().await.expect("disconnect is clean");
        assert_eq!(manager.state(), ManagerState::Disconnected);
    }

    #[tokio::test]
    async fn connection_loss_transitions_to_reconnecting() {
        let manager = ConnectionManager::new(test_config());
        manager.state_tx.send_replace(ManagerState::Connected);

        manager
            .events
            .send(LifecycleEvent::ConnectionLost("simulated close".to_owned()))
            .expect("lifecycle task is alive");

        let mut state_rx = manager.subscribe_state();
        let reconnecting = timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| *state == ManagerState::Reconnecting),
        )
        .await;

        assert!(reconnecting.is_ok());
        assert!(!manager.is_connected());

        manager.disconnect().await.expect("disconnect is clean");
        assert_eq!(manager.state(), ManagerState::Disconnected);
    }

    #[tokio::test]
    async fn __diag_connection_loss() {
        eprintln!("DIAG: start");
        let manager = ConnectionManager::new(test_config());
        manager.state_tx.send_replace(ManagerState::Connected);
        eprintln!("DIAG: set connected");

        manager
            .events
            .send(LifecycleEvent::ConnectionLost("simulated close".to_owned()))
            .expect("lifecycle task is alive");
        eprintln!("DIAG: sent event");

        let mut state_rx = manager.subscribe_state();
        let reconnecting = timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| *state == ManagerState::Reconnecting),
        )
        .await;
        eprintln!("DIAG: wait_for returned is_ok={}", reconnecting.is_ok());

        eprintln!("DIAG: before disconnect, state={:?}", manager.state());
        match manager.inner.try_lock() {
            Ok(_g) => eprintln!("DIAG: inner is FREE before disconnect"),
            Err(_) => eprintln!("DIAG: inner is LOCKED before disconnect"),
        }
        // give the lifecycle task a few scheduler turns
        tokio::time::sleep(Duration::from_millis(50)).await;
        match manager.inner.try_lock() {
            Ok(_g) => eprintln!("DIAG: inner is FREE after yield"),
            Err(_) => eprintln!("DIAG: inner is LOCKED after yield"),
        }
        manager.disconnect().await.expect("disconnect is clean");
        eprintln!("DIAG: after disconnect, state={:?}", manager.state());
    }

    #[tokio::test]
    async fn close_events_are_ignored_after_explicit_shutdown() {
        let manager = ConnectionManager::new(test_config());
        manager.disconnect().await.expect("disconnect is clean");

        manager
            .events
            .send(LifecycleEvent::ConnectionLost("late close".to_owned()))
            .expect("lifecycle task is alive");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.state(), ManagerState::Disconnected);
    }

    #[tokio::test]
    async fn channel_is_unavailable_until_connected() {
        let manager = ConnectionManager::new(test_config());

        let err = manager.channel().await.expect_err("no channel yet");

        assert_eq!(err, AmqpError::ChannelUnavailable);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let manager = ConnectionManager::new(test_config());

        assert_eq!(manager.disconnect().await, Ok(()));
        assert_eq!(manager.disconnect().await, Ok(()));
        assert_eq!(manager.state(), ManagerState::Disconnected);
    }
}
