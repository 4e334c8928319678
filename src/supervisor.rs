//! Connection supervision with bounded, jittered retries
//!
//! [`ConnectionSupervisor`] owns the link and is the only writer of the
//! [`ConnectionState`]. Observers read the state through a watch channel.

use crate::backoff::{BackoffError, BackoffPolicy, JitterSource, OsJitter};
use crate::observability::metrics;
use crate::transport::{
    Endpoint, EngineError, Link, SessionIdentity, TlsSettings, TransportError,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Connection state as seen by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { session_present: bool },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Everything needed to (re)establish a session
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub endpoint: Endpoint,
    pub tls: TlsSettings,
    pub identity: SessionIdentity,
    pub backoff: BackoffPolicy,
    pub connack_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection retries exhausted after {attempts} delayed retries: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("Backoff randomness unavailable after: {last_error}")]
    Randomness {
        last_error: String,
        #[source]
        source: rand::Error,
    },
}

/// Failure of a single connection attempt
#[derive(Debug, Error)]
enum AttemptError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("handshake: {0}")]
    Handshake(#[from] EngineError),
}

pub struct ConnectionSupervisor<L: Link> {
    link: L,
    settings: SupervisorSettings,
    jitter: Box<dyn JitterSource>,
    state_tx: watch::Sender<ConnectionState>,
    transport_open: bool,
}

impl<L: Link> ConnectionSupervisor<L> {
    pub fn new(link: L, settings: SupervisorSettings) -> Self {
        Self::with_jitter(link, settings, Box::new(OsJitter))
    }

    pub fn with_jitter(
        link: L,
        settings: SupervisorSettings,
        jitter: Box<dyn JitterSource>,
    ) -> Self {
        // The receiver is dropped; state changes must use send_replace
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link,
            settings,
            jitter,
            state_tx,
            transport_open: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Read-only view of the connection state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Connect, retrying failed attempts with backoff.
    ///
    /// Returns the broker's session-present flag. Every failed attempt, whether
    /// in the transport or in the handshake, consumes one retry.
    pub async fn connect_with_retries(
        &mut self,
        clean_session: bool,
    ) -> Result<bool, ConnectError> {
        let policy = self.settings.backoff;
        let mut backoff = policy.start();
        self.state_tx.send_replace(ConnectionState::Connecting);

        loop {
            metrics().connection_attempt();
            match self.attempt(clean_session).await {
                Ok(session_present) => {
                    metrics().connection_established();
                    self.state_tx
                        .send_replace(ConnectionState::Connected { session_present });
                    info!(
                        endpoint = %self.settings.endpoint,
                        client_id = %self.settings.identity.client_identifier,
                        clean_session,
                        session_present,
                        retries = backoff.attempts_done(),
                        "Broker session established"
                    );
                    return Ok(session_present);
                }
                Err(e) => {
                    metrics().connection_failed();
                    let last_error = e.to_string();
                    match policy.next_delay(&mut backoff, self.jitter.as_mut()) {
                        Ok(delay) => {
                            warn!(
                                endpoint = %self.settings.endpoint,
                                error = %last_error,
                                attempt = backoff.attempts_done(),
                                max_attempts = policy.max_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "Connection attempt failed, retrying after backoff"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        Err(BackoffError::Exhausted { attempts }) => {
                            error!(
                                endpoint = %self.settings.endpoint,
                                attempts,
                                error = %last_error,
                                "Connection retries exhausted"
                            );
                            self.state_tx.send_replace(ConnectionState::Disconnected);
                            return Err(ConnectError::Exhausted {
                                attempts,
                                last_error,
                            });
                        }
                        Err(BackoffError::Randomness(source)) => {
                            error!(error = %source, "Backoff jitter unavailable, giving up");
                            self.state_tx.send_replace(ConnectionState::Disconnected);
                            return Err(ConnectError::Randomness { last_error, source });
                        }
                    }
                }
            }
        }
    }

    async fn attempt(&mut self, clean_session: bool) -> Result<bool, AttemptError> {
        if self.transport_open {
            self.close_transport().await;
        }

        self.link
            .connect(&self.settings.endpoint, &self.settings.tls)
            .await?;
        self.transport_open = true;

        match self
            .link
            .handshake(
                &self.settings.identity,
                clean_session,
                self.settings.connack_timeout,
            )
            .await
        {
            Ok(session_present) => Ok(session_present),
            Err(e) => {
                // A failed handshake leaves a half-open link behind
                self.close_transport().await;
                Err(e.into())
            }
        }
    }

    /// Drop the link without a protocol DISCONNECT. Used after I/O failures.
    pub async fn teardown(&mut self) {
        if self.transport_open {
            self.close_transport().await;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        metrics().set_connected(false);
    }

    /// Orderly shutdown: DISCONNECT, then close the transport
    pub async fn disconnect(&mut self) -> Result<(), EngineError> {
        let result = if self.state().is_connected() {
            self.link.send_disconnect().await
        } else {
            Ok(())
        };
        if let Err(e) = &result {
            warn!(error = %e, "DISCONNECT could not be sent, closing transport anyway");
        }
        self.teardown().await;
        result
    }

    async fn close_transport(&mut self) {
        if let Err(e) = self.link.disconnect().await {
            debug!(error = %e, "Transport close reported an error");
        }
        self.transport_open = false;
    }
}
