//! Connection lifecycle supervision
//!
//! The supervisor owns the transport for the life of the pipeline. It
//! drives the connect and subscribe sequence, feeds received messages
//! into the inbox, services acknowledgement requests from the dispatch
//! workers, and on connection loss walks the backoff schedule until the
//! broker comes back or the attempt limit is reached. Workers never talk
//! to the transport directly; acknowledgements travel over a channel so
//! the transport keeps a single owner.

pub mod backoff;

use crate::ack::AckTracker;
use crate::config::ReconnectSection;
use crate::error::{PipelineError, TransportError};
use crate::inbox::{Inbox, PushOutcome};
use crate::message::{DeliveryTag, InboundMessage, TopicSubscription};
use crate::mqtt_span;
use crate::observability::metrics::METRICS;
use crate::transport::{Transport, TransportEvent};
use backoff::{Backoff, ReconnectDecision};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn, Instrument};

// Workers wait for each reply before sending the next request, so a
// small buffer is plenty.
const ACK_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle states of the supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection yet
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Session established and subscriptions in place
    Connected,
    /// Waiting out the backoff before the given attempt number
    Reconnecting(u32),
    /// Terminal: explicit shutdown or reconnect attempts exhausted
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Acknowledgement request sent by a dispatch worker
///
/// The supervisor performs the broker ack on the worker's behalf and
/// reports the result over the reply channel.
#[derive(Debug)]
pub struct AckRequest {
    pub tag: DeliveryTag,
    pub reply: oneshot::Sender<Result<(), TransportError>>,
}

/// Control handles for a running supervisor
pub struct SupervisorHandle {
    /// Sender side of the acknowledgement channel, cloned into workers
    pub ack_tx: mpsc::Sender<AckRequest>,
    /// Watch on the connection state machine
    pub state_rx: watch::Receiver<ConnectionState>,
    /// Set to true to request a graceful stop
    pub shutdown_tx: watch::Sender<bool>,
    /// Filled in when the supervisor stops on a fatal error
    pub fatal: Arc<StdMutex<Option<PipelineError>>>,
}

/// Drives one transport through connect, pump and reconnect cycles
pub struct Supervisor<T: Transport> {
    transport: T,
    subscriptions: Vec<TopicSubscription>,
    inbox: Arc<Inbox>,
    tracker: Arc<AckTracker>,
    backoff: Backoff,
    ack_rx: mpsc::Receiver<AckRequest>,
    shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ConnectionState>,
    fatal: Arc<StdMutex<Option<PipelineError>>>,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(
        transport: T,
        subscriptions: Vec<TopicSubscription>,
        inbox: Arc<Inbox>,
        tracker: Arc<AckTracker>,
        reconnect: &ReconnectSection,
    ) -> (Self, SupervisorHandle) {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let fatal = Arc::new(StdMutex::new(None));

        let supervisor = Self {
            transport,
            subscriptions,
            inbox,
            tracker,
            backoff: Backoff::new(reconnect),
            ack_rx,
            shutdown_rx,
            state_tx,
            fatal: fatal.clone(),
        };
        let handle = SupervisorHandle {
            ack_tx,
            state_rx,
            shutdown_tx,
            fatal,
        };
        (supervisor, handle)
    }

    /// Run until shutdown or a fatal error, then transition to Closed
    pub async fn run(mut self) {
        info!(
            subscriptions = self.subscriptions.len(),
            "connection supervisor started"
        );
        match self.supervise().await {
            Ok(()) => info!("connection supervisor stopped"),
            Err(fatal) => {
                error!(error = %fatal, "connection supervisor stopped on fatal error");
                *self
                    .fatal
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(fatal);
            }
        }
        self.set_state(ConnectionState::Closed);
        // Dropping self closes the ack channel, which unblocks any worker
        // still waiting on a reply
    }

    async fn supervise(&mut self) -> Result<(), PipelineError> {
        let mut first_connect = true;
        loop {
            if !self.establish(first_connect).await? {
                break;
            }
            first_connect = false;
            if !self.pump().await? {
                break;
            }
        }
        // Graceful stop: answer outstanding acknowledgements while the
        // connection is still up, then close it
        self.drain_acks().await;
        self.close_transport().await;
        Ok(())
    }

    /// Bring the connection up, walking the backoff schedule between
    /// attempts
    ///
    /// `immediate` skips the backoff wait before the first attempt, which
    /// is only right for the initial startup connect. Returns Ok(false)
    /// when shutdown was requested before a connection came up.
    async fn establish(&mut self, immediate: bool) -> Result<bool, PipelineError> {
        let mut immediate = immediate;
        loop {
            if !immediate {
                match self.backoff.next_decision(self.shutdown_requested()) {
                    ReconnectDecision::Proceed { attempt, delay } => {
                        self.set_state(ConnectionState::Reconnecting(attempt));
                        info!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "backing off before reconnect attempt"
                        );
                        if !self.backoff_wait(delay).await {
                            return Ok(false);
                        }
                    }
                    ReconnectDecision::AbortShutdownRequested => return Ok(false),
                    ReconnectDecision::AbortAttemptsExhausted => {
                        return Err(PipelineError::ReconnectAttemptsExhausted {
                            attempts: self.backoff.attempts(),
                        });
                    }
                }
            }
            immediate = false;
            if self.shutdown_requested() {
                return Ok(false);
            }

            self.set_state(ConnectionState::Connecting);
            METRICS.connection_attempt();
            let span = mqtt_span!(operation = "connect");
            match self.try_connect().instrument(span).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    return Ok(true);
                }
                Err(error) => {
                    METRICS.connection_failed();
                    warn!(error = %error, "connect attempt failed");
                }
            }
        }
    }

    /// Connect, subscribe, and reconcile delivery bookkeeping with the
    /// new epoch
    async fn try_connect(&mut self) -> Result<(), TransportError> {
        let epoch = self.transport.connect().await?;
        self.transport.subscribe(&self.subscriptions).await?;
        METRICS.connection_established(epoch);
        self.backoff.reset();

        let retired = self.tracker.begin_epoch(epoch);
        if !retired.is_empty() {
            info!(
                count = retired.len(),
                epoch, "expecting broker redelivery of unacknowledged messages"
            );
        }
        info!(
            epoch,
            subscriptions = self.subscriptions.len(),
            "connected and subscribed"
        );
        Ok(())
    }

    /// Feed transport events into the inbox and answer worker acks
    ///
    /// Returns Ok(true) when the connection dropped and a reconnect is
    /// due, Ok(false) on shutdown.
    async fn pump(&mut self) -> Result<bool, PipelineError> {
        enum Step {
            Event(TransportEvent),
            Ack(Option<AckRequest>),
            Shutdown(bool),
        }

        loop {
            let step = tokio::select! {
                changed = self.shutdown_rx.changed() => Step::Shutdown(changed.is_ok()),
                request = self.ack_rx.recv() => Step::Ack(request),
                event = self.transport.next_event() => Step::Event(event),
            };
            match step {
                Step::Event(TransportEvent::Message(message)) => {
                    self.tracker.track(&message);
                    if !self.deliver(message).await {
                        return Ok(false);
                    }
                }
                Step::Event(TransportEvent::Disconnected { reason }) => {
                    warn!(reason = %reason, "connection lost");
                    METRICS.connection_lost();
                    return Ok(true);
                }
                Step::Ack(Some(request)) => self.service_ack(request).await,
                Step::Ack(None) => {
                    warn!("acknowledgement channel closed, stopping supervisor");
                    return Ok(false);
                }
                Step::Shutdown(alive) => {
                    if !alive || self.shutdown_requested() {
                        info!("shutdown requested, stopping event pump");
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Push into the inbox, still answering ack requests while the push
    /// is blocked on a full queue
    ///
    /// Returns false when shutdown interrupts the wait; the message is
    /// dropped locally and redelivered by the broker next session.
    async fn deliver(&mut self, message: InboundMessage) -> bool {
        enum Wait {
            Done(PushOutcome),
            Ack(Option<AckRequest>),
            Shutdown(bool),
        }

        let inbox = self.inbox.clone();
        let push = inbox.push(message);
        tokio::pin!(push);

        loop {
            let wait = tokio::select! {
                outcome = &mut push => Wait::Done(outcome),
                request = self.ack_rx.recv() => Wait::Ack(request),
                changed = self.shutdown_rx.changed() => Wait::Shutdown(changed.is_ok()),
            };
            match wait {
                Wait::Done(PushOutcome::Stored) => return true,
                Wait::Done(PushOutcome::Displaced(old)) => {
                    warn!(
                        topic = %old.topic,
                        tag = %old.tag,
                        "inbox full, dropped oldest message"
                    );
                    self.tracker.discard(&old.topic, old.tag);
                    return true;
                }
                Wait::Ack(Some(request)) => self.service_ack(request).await,
                Wait::Ack(None) => return false,
                Wait::Shutdown(alive) => {
                    if !alive || self.shutdown_requested() {
                        return false;
                    }
                }
            }
        }
    }

    async fn service_ack(&mut self, request: AckRequest) {
        let result = if self.transport.is_connected() {
            self.transport.acknowledge(request.tag).await
        } else {
            Err(TransportError::connection_lost(
                "not connected, ack deferred to redelivery",
            ))
        };
        // The worker may have given up waiting; nothing to do then
        let _ = request.reply.send(result);
    }

    /// Sleep out a backoff delay while still answering ack requests
    ///
    /// Acks fail while disconnected; workers leave those entries pending
    /// for redelivery. Returns false when shutdown cancels the wait.
    async fn backoff_wait(&mut self, delay: Duration) -> bool {
        enum Wait {
            Elapsed,
            Ack(Option<AckRequest>),
            Shutdown(bool),
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let wait = tokio::select! {
                _ = &mut sleep => Wait::Elapsed,
                request = self.ack_rx.recv() => Wait::Ack(request),
                changed = self.shutdown_rx.changed() => Wait::Shutdown(changed.is_ok()),
            };
            match wait {
                Wait::Elapsed => return true,
                Wait::Ack(Some(request)) => self.service_ack(request).await,
                Wait::Ack(None) => return false,
                Wait::Shutdown(alive) => {
                    if !alive || self.shutdown_requested() {
                        info!("shutdown requested during backoff wait");
                        return false;
                    }
                }
            }
        }
    }

    /// Answer remaining ack requests until every worker is gone
    async fn drain_acks(&mut self) {
        debug!("draining acknowledgement requests");
        while let Some(request) = self.ack_rx.recv().await {
            self.service_ack(request).await;
        }
    }

    async fn close_transport(&mut self) {
        if let Err(error) = self.transport.disconnect().await {
            debug!(error = %error, "transport disconnect failed");
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        METRICS.set_consumer_state(state.name());
        debug!(state = %state, "connection state changed");
        let _ = self.state_tx.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Disconnected.name(), "disconnected");
        assert_eq!(ConnectionState::Connecting.name(), "connecting");
        assert_eq!(ConnectionState::Connected.name(), "connected");
        assert_eq!(ConnectionState::Reconnecting(3).name(), "reconnecting");
        assert_eq!(ConnectionState::Closed.name(), "closed");
    }

    #[test]
    fn test_only_closed_is_terminal() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::Reconnecting(1).is_terminal());
    }

    #[test]
    fn test_state_display_matches_name() {
        assert_eq!(ConnectionState::Reconnecting(2).to_string(), "reconnecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
