// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Lifecycle
//!
//! `ConnectionManager` owns the single broker connection of the process.
//!
//! State machine:
//! `Uninitialized -> Connecting -> Connected -> Recovering -> Connected`, and
//! `Closed` after `shutdown`. Connecting never gives up; attempts are spaced
//! with an exponential backoff bounded by the configured maximum.
//!
//! lapin reports connection failures through `on_error`. A supervisor task turns
//! those reports into a recovery pass: reconnect, let the `RecoveryListener`
//! re-declare the topology on the new connection, then publish the new
//! generation so consumers can re-attach. Channel creation waits for a running
//! recovery pass to finish.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch, RwLock},
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// AMQP reply code for a normal close
pub const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Recovering,
    Closed,
}

/// Connection state plus the number of completed recoveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

/// Hooks invoked by the supervisor while replacing a lost connection.
#[async_trait]
pub trait RecoveryListener: Send + Sync {
    /// Called on the new connection before it is handed out to callers.
    async fn topology_recovery_started(&self, connection: &Connection) -> Result<(), AmqpError>;

    /// Called once the new connection is published.
    async fn recovery_completed(&self) {}
}

pub struct ConnectionManager {
    cfg: RabbitMQConfigs,
    connection: RwLock<Option<Arc<Connection>>>,
    status: watch::Sender<ConnectionStatus>,
    listener: Option<Arc<dyn RecoveryListener>>,
}

impl ConnectionManager {
    pub fn new(cfg: RabbitMQConfigs, listener: Option<Arc<dyn RecoveryListener>>) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Uninitialized,
            generation: 0,
        });

        Arc::new(ConnectionManager {
            cfg,
            connection: RwLock::new(None),
            status,
            listener,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Receives every state change, used by consumers to re-attach after recovery.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Opens the connection, retrying until it succeeds, and starts supervising it.
    ///
    /// Attempts are spaced by the configured backoff. Once connected, a background
    /// task watches for connection failures and runs the recovery pass.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `NotConnected` when `shutdown` was called before
    ///   a connection could be made, `Ok` otherwise
    ///
    /// # Example
    /// ```ignore
    /// let manager = ConnectionManager::new(RabbitMQConfigs::from_env(), None);
    /// manager.start().await?;
    /// ```
    pub async fn start(self: &Arc<Self>) -> Result<(), AmqpError> {
        if !self.set_state(ConnectionState::Connecting) {
            return Err(AmqpError::NotConnected);
        }

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let Some(conn) = self.open(&errors_tx).await else {
            return Err(AmqpError::NotConnected);
        };

        *self.connection.write().await = Some(Arc::new(conn));
        if !self.set_state(ConnectionState::Connected) {
            self.shutdown().await;
            return Err(AmqpError::NotConnected);
        }
        info!("amqp connected");

        tokio::spawn(Arc::clone(self).supervise(errors_tx, errors_rx));

        Ok(())
    }

    /// Creates a new channel on the current connection.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        self.wait_ready().await?;

        let guard = self.connection.read().await;
        let Some(conn) = guard.as_ref() else {
            return Err(AmqpError::NotConnected);
        };

        debug!("creating amqp channel...");
        conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError
        })
    }

    /// Closes the connection and all its channels with reply code 200 `OK`.
    ///
    /// Errors raised while closing are discarded.
    pub async fn shutdown(&self) {
        info!("shutdown RabbitMQ connection");
        self.set_state(ConnectionState::Closed);

        if let Some(conn) = self.connection.write().await.take() {
            if let Err(err) = conn.close(REPLY_SUCCESS, "OK").await {
                debug!(error = err.to_string(), "ignoring error while closing connection");
            }
        }
    }

    /// Waits while a connection attempt or recovery pass is running.
    pub(crate) async fn wait_ready(&self) -> Result<(), AmqpError> {
        let mut status = self.subscribe();

        let ready = status
            .wait_for(|s| {
                !matches!(
                    s.state,
                    ConnectionState::Connecting | ConnectionState::Recovering
                )
            })
            .await
            .map_err(|_| AmqpError::NotConnected)?;

        match ready.state {
            ConnectionState::Connected => Ok(()),
            _ => Err(AmqpError::NotConnected),
        }
    }

    /// Applies a state change. Nothing leaves `Closed`.
    fn set_state(&self, state: ConnectionState) -> bool {
        self.status.send_if_modified(|s| {
            if s.state == ConnectionState::Closed && state != ConnectionState::Closed {
                return false;
            }
            s.state = state;
            true
        })
    }

    fn properties(&self) -> ConnectionProperties {
        ConnectionProperties::default()
            .with_connection_name(LongString::from(self.cfg.connection_name.clone()))
    }

    async fn open(&self, errors: &mpsc::UnboundedSender<lapin::Error>) -> Option<Connection> {
        let mut delay = self.cfg.initial_backoff();

        loop {
            if self.state() == ConnectionState::Closed {
                return None;
            }

            debug!("creating amqp connection...");
            match Connection::connect(&self.cfg.uri, self.properties()).await {
                Ok(conn) => {
                    let errors = errors.clone();
                    conn.on_error(move |err| {
                        let _ = errors.send(err);
                    });
                    return Some(conn);
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        retry_in_ms = delay.as_millis() as u64,
                        "failure to connect"
                    );
                    sleep(delay).await;
                    delay = next_backoff(delay, self.cfg.max_backoff());
                }
            }
        }
    }

    async fn supervise(
        self: Arc<Self>,
        errors_tx: mpsc::UnboundedSender<lapin::Error>,
        mut errors_rx: mpsc::UnboundedReceiver<lapin::Error>,
    ) {
        loop {
            let err = tokio::select! {
                err = errors_rx.recv() => match err {
                    Some(err) => err,
                    None => break,
                },
                _ = closed(self.subscribe()) => break,
            };

            let alive = self
                .connection
                .read()
                .await
                .as_ref()
                .is_some_and(|conn| conn.status().connected());
            if alive {
                debug!(error = err.to_string(), "ignoring error of a replaced connection");
                continue;
            }

            error!(error = err.to_string(), "connection lost, recovering");
            if !self.set_state(ConnectionState::Recovering) {
                break;
            }

            let Some(conn) = self.open(&errors_tx).await else {
                break;
            };
            let conn = Arc::new(conn);

            if let Some(listener) = &self.listener {
                self.recover_topology(listener.as_ref(), &conn).await;
            }

            *self.connection.write().await = Some(conn);
            let recovered = self.status.send_if_modified(|s| {
                if s.state == ConnectionState::Closed {
                    return false;
                }
                s.state = ConnectionState::Connected;
                s.generation += 1;
                true
            });
            if !recovered {
                self.shutdown().await;
                break;
            }
            info!(generation = self.status().generation, "amqp connection recovered");

            if let Some(listener) = &self.listener {
                listener.recovery_completed().await;
            }
        }

        debug!("connection supervisor stopped");
    }

    async fn recover_topology(&self, listener: &dyn RecoveryListener, conn: &Connection) {
        let mut delay = self.cfg.initial_backoff();

        loop {
            match listener.topology_recovery_started(conn).await {
                Ok(()) => return,
                Err(err)
                    if conn.status().connected() && self.state() != ConnectionState::Closed =>
                {
                    error!(error = err.to_string(), "failure to recover topology, retrying");
                    sleep(delay).await;
                    delay = next_backoff(delay, self.cfg.max_backoff());
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to recover topology");
                    return;
                }
            }
        }
    }
}

async fn closed(mut status: watch::Receiver<ConnectionStatus>) {
    let _ = status
        .wait_for(|s| s.state == ConnectionState::Closed)
        .await;
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
