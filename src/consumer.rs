//! Consumer facade wiring the pipeline together
//!
//! [`Consumer::start`] builds the transport, inbox, tracker, supervisor
//! and dispatch pool from a [`ConsumerConfig`] and runs them until
//! [`Consumer::shutdown`]. The caller supplies the message handler and
//! the dead-letter sink; everything else is owned by the pipeline.

use crate::ack::AckTracker;
use crate::config::ConsumerConfig;
use crate::dispatch::{DeadLetterSink, Dispatcher, MessageHandler};
use crate::error::{PipelineError, PipelineResult};
use crate::inbox::Inbox;
use crate::supervisor::{ConnectionState, Supervisor, SupervisorHandle};
use crate::transport::{MqttTransport, Transport};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// The supervisor stops on its own once the workers are gone; this only
// guards against it wedging inside the broker client.
const SUPERVISOR_STOP_GRACE: Duration = Duration::from_secs(5);

/// Outcome of a graceful shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every pipeline task finished inside the drain budget
    pub clean: bool,
    /// Messages still queued in the inbox, never dispatched
    pub inbox_remaining: usize,
    /// Deliveries that were never acknowledged; the broker redelivers
    /// them next session
    pub unacked: usize,
}

/// A running message-consumption pipeline
///
/// Dropping the consumer without calling [`Consumer::shutdown`] still
/// stops every task (the shutdown watch closes), but skips the graceful
/// drain and returns no report.
pub struct Consumer {
    supervisor: JoinHandle<()>,
    dispatcher: Dispatcher,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    fatal: Arc<StdMutex<Option<PipelineError>>>,
    inbox: Arc<Inbox>,
    tracker: Arc<AckTracker>,
    drain_timeout: Duration,
}

impl Consumer {
    /// Start the pipeline against the MQTT broker named in the config
    pub fn start(
        config: ConsumerConfig,
        handler: Arc<dyn MessageHandler>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> PipelineResult<Self> {
        let transport = MqttTransport::new(config.mqtt.clone())?;
        Self::start_with_transport(config, transport, handler, dead_letter)
    }

    /// Start the pipeline over a caller-supplied transport
    pub fn start_with_transport<T>(
        config: ConsumerConfig,
        transport: T,
        handler: Arc<dyn MessageHandler>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> PipelineResult<Self>
    where
        T: Transport + 'static,
    {
        let subscriptions = config.resolved_subscriptions()?;
        let inbox = Arc::new(Inbox::from_config(&config.inbox));
        let tracker = Arc::new(AckTracker::new());

        let (supervisor, handle) = Supervisor::new(
            transport,
            subscriptions,
            inbox.clone(),
            tracker.clone(),
            &config.reconnect,
        );
        let SupervisorHandle {
            ack_tx,
            state_rx,
            shutdown_tx,
            fatal,
        } = handle;

        // ack_tx moves into the workers; once they stop, the closed
        // channel tells the supervisor the drain is over
        let dispatcher = Dispatcher::spawn(
            &config.dispatch,
            inbox.clone(),
            tracker.clone(),
            handler,
            dead_letter,
            ack_tx,
            shutdown_tx.subscribe(),
        );
        let supervisor = tokio::spawn(supervisor.run());

        info!(
            workers = dispatcher.worker_count(),
            inbox_capacity = inbox.capacity(),
            "consumer pipeline started"
        );
        Ok(Self {
            supervisor,
            dispatcher,
            shutdown_tx,
            state_rx,
            fatal,
            inbox,
            tracker,
            drain_timeout: config.dispatch.drain_timeout(),
        })
    }

    /// Current state of the supervised connection
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Number of deliveries still awaiting acknowledgement
    pub fn pending_acks(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Fatal error that stopped the pipeline, if one occurred
    ///
    /// Set when the supervisor gives up after exhausting its reconnect
    /// attempts. Taking it leaves `None` behind.
    pub fn take_fatal(&self) -> Option<PipelineError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait until the connection state machine reaches its terminal state
    ///
    /// Returns on explicit shutdown or on a fatal error; check
    /// [`Consumer::take_fatal`] to tell the two apart.
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        while !state_rx.borrow_and_update().is_terminal() {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the pipeline and wait for in-flight handlers to finish
    ///
    /// New deliveries stop immediately; handlers already running get the
    /// configured drain budget to complete and send their final acks.
    pub async fn shutdown(self) -> DrainReport {
        info!("consumer shutdown requested");
        let _ = self.shutdown_tx.send(true);

        let clean = self.dispatcher.drain(self.drain_timeout).await;

        let mut supervisor = self.supervisor;
        if tokio::time::timeout(SUPERVISOR_STOP_GRACE, &mut supervisor)
            .await
            .is_err()
        {
            warn!("supervisor did not stop in time, aborting it");
            supervisor.abort();
        }

        let report = DrainReport {
            clean,
            inbox_remaining: self.inbox.len().await,
            unacked: self.tracker.pending_count(),
        };
        info!(
            clean = report.clean,
            inbox_remaining = report.inbox_remaining,
            unacked = report.unacked,
            "consumer shutdown complete"
        );
        report
    }
}
