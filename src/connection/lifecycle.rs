//! Connection lifecycle manager.
//!
//! Drives connect attempts, restores state on every new connection and
//! reconnects after a fatal connection error. Transitions are serialized by
//! one lock; an epoch counter lets a newer `connect()` or `disconnect()`
//! stop an attempt loop that is waiting between retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{ConnectionSlot, LiveConnection};
use crate::config::EmitterConfig;
use crate::correlation::CorrelationTable;
use crate::dispatch::Dispatcher;
use crate::emitter::Notifier;
use crate::error::{EmitterError, Result};
use crate::outbound::OutboundTracker;
use crate::queues::QueueTracker;
use crate::transport::{Connection, Transport, TransportError};

/// Owns the connection state machine.
pub struct Lifecycle {
    config: EmitterConfig,
    transport: Arc<dyn Transport>,
    slot: Arc<ConnectionSlot>,
    queues: Arc<QueueTracker>,
    outbound: Arc<OutboundTracker>,
    correlations: Arc<CorrelationTable>,
    dispatcher: Dispatcher,
    notifier: Notifier,
    transition: Mutex<()>,
    epoch: AtomicU64,
    generation: AtomicU64,
}

impl Lifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EmitterConfig,
        transport: Arc<dyn Transport>,
        slot: Arc<ConnectionSlot>,
        queues: Arc<QueueTracker>,
        outbound: Arc<OutboundTracker>,
        correlations: Arc<CorrelationTable>,
        dispatcher: Dispatcher,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            transport,
            slot,
            queues,
            outbound,
            correlations,
            dispatcher,
            notifier,
            transition: Mutex::new(()),
            epoch: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Connect, replacing any current connection.
    ///
    /// Retries every `reconnect_delay` until connected, until superseded by
    /// a newer `connect()`/`disconnect()`, or until `max_connect_attempts`
    /// consecutive failures.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut failures: u32 = 0;

        loop {
            if self.is_superseded(epoch) {
                return Err(EmitterError::Superseded);
            }
            match self.attempt(epoch).await {
                Ok(()) => return Ok(()),
                Err(EmitterError::Superseded) => return Err(EmitterError::Superseded),
                Err(e) => {
                    failures += 1;
                    debug!(attempt = failures, "Connect attempt failed");
                    self.notifier.error(e);

                    if let Some(max) = self.config.max_connect_attempts {
                        if failures >= max {
                            self.notifier.error(EmitterError::GaveUp { attempts: failures });
                            return Err(EmitterError::GaveUp { attempts: failures });
                        }
                    }
                    tokio::time::sleep(self.config.reconnect_delay()).await;
                }
            }
        }
    }

    /// Close the current connection, if any, and stop any attempt loop.
    pub async fn disconnect(&self, reason: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _transition = self.transition.lock().await;
        self.close_current(reason).await;
    }

    /// Stop retrying and close the connection in the background. Used when
    /// the owning emitter is dropped.
    pub fn abandon(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let Some(live) = self.slot.set_disconnected() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = live.connection.close().await {
                    debug!(error = %e, "Ignoring close error on shutdown");
                }
            });
        }
    }

    fn is_superseded(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn attempt(self: &Arc<Self>, epoch: u64) -> Result<()> {
        let _transition = self.transition.lock().await;
        if self.is_superseded(epoch) {
            return Err(EmitterError::Superseded);
        }

        self.close_current("reconnecting").await;
        self.slot.set_connecting();
        info!(exchange = %self.config.exchange, "Connecting to broker");

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let connection = match self.transport.open(&self.config.server, closed_tx).await {
            Ok(connection) => connection,
            Err(e) => {
                self.slot.set_disconnected();
                return Err(e.into());
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self.establish(&connection, generation).await {
            if let Err(close_err) = connection.close().await {
                debug!(error = %close_err, "Ignoring close error after failed setup");
            }
            self.slot.set_disconnected();
            return Err(e);
        }

        self.supervise(closed_rx, generation);
        self.outbound.flush();
        info!(generation, "Connection established");
        self.notifier.connected();
        Ok(())
    }

    /// Restore state on a fresh connection, then publish it as connected.
    async fn establish(&self, connection: &Arc<dyn Connection>, generation: u64) -> Result<()> {
        connection.declare_exchange(&self.config.exchange).await?;
        connection.consume_replies(self.correlations.clone()).await?;

        let live = LiveConnection {
            connection: Arc::clone(connection),
            generation,
        };
        self.outbound.replay_all(&live).await;
        self.queues
            .recreate_all(connection, |id| self.dispatcher.handler_for(id))
            .await?;

        self.slot.set_connected(live);
        Ok(())
    }

    /// Close the live connection and notify, if there is one.
    async fn close_current(&self, reason: &str) {
        let Some(live) = self.slot.set_disconnected() else {
            return;
        };
        // Remote-initiated closes make this fail routinely.
        if let Err(e) = live.connection.close().await {
            debug!(error = %e, "Ignoring close error");
        }
        self.notifier.disconnected(reason);
    }

    /// Watch for fatal errors on the connection of `generation`.
    fn supervise(self: &Arc<Self>, mut closed: mpsc::UnboundedReceiver<TransportError>, generation: u64) {
        let lifecycle = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(err) = closed.recv().await else {
                return;
            };
            if let Some(lifecycle) = lifecycle.upgrade() {
                lifecycle.on_connection_lost(err, generation).await;
            }
        });
    }

    fn on_connection_lost(
        self: Arc<Self>,
        err: TransportError,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let epoch = self.epoch.load(Ordering::SeqCst);
            {
                let _transition = self.transition.lock().await;
                if self.slot.generation() != Some(generation) {
                    debug!(generation, "Loss reported for a replaced connection");
                    return;
                }
                let reason = err.to_string();
                self.notifier.error(err.into());
                self.close_current(&reason).await;
            }

            tokio::time::sleep(self.config.reconnect_delay()).await;
            if self.is_superseded(epoch) {
                return;
            }
            match self.connect().await {
                Ok(()) => {}
                Err(EmitterError::Superseded) => debug!("Reconnect superseded"),
                Err(e) => warn!(error = %e, "Reconnect abandoned"),
            }
        })
    }
}
