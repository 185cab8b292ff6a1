mod loopback;

use std::{fmt, future::Future, pin::Pin, sync::mpsc, thread};

use async_channel::Sender;
use chrono::{DateTime, Utc};
use stompmiru_core::{Result, headers::Headers};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

pub use loopback::{LOOPBACK_SCHEME, LoopbackBroker};

pub type ConnectionClosedFuture = Pin<Box<dyn Future<Output = Option<String>> + Send>>;

/// What the session controller hands to a transport when connecting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    pub server_url: String,
    pub headers: Headers,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub subscription_id: String,
    pub destination: Option<String>,
    pub headers: Headers,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

pub enum BrokerEvent {
    Connected(SessionHandle),
    ConnectionFailed(ConnectionError),
    ConnectionClosed(Option<String>),
    Subscribed {
        subscription_id: String,
        destination: String,
    },
    Unsubscribed {
        subscription_id: String,
    },
    SubscriptionFailed(String),
    MessageReceived(InboundMessage),
}

impl fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerEvent::Connected(_) => f.write_str("Connected"),
            BrokerEvent::ConnectionFailed(err) => {
                f.debug_tuple("ConnectionFailed").field(err).finish()
            }
            BrokerEvent::ConnectionClosed(reason) => {
                f.debug_tuple("ConnectionClosed").field(reason).finish()
            }
            BrokerEvent::Subscribed {
                subscription_id,
                destination,
            } => f
                .debug_struct("Subscribed")
                .field("subscription_id", subscription_id)
                .field("destination", destination)
                .finish(),
            BrokerEvent::Unsubscribed { subscription_id } => f
                .debug_struct("Unsubscribed")
                .field("subscription_id", subscription_id)
                .finish(),
            BrokerEvent::SubscriptionFailed(message) => {
                f.debug_tuple("SubscriptionFailed").field(message).finish()
            }
            BrokerEvent::MessageReceived(message) => {
                f.debug_tuple("MessageReceived").field(message).finish()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionError {
    pub user_message: String,
    pub detail: String,
}

impl ConnectionError {
    pub fn new(user_message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            f.write_str(&self.user_message)
        } else {
            write!(f, "{} ({})", self.user_message, self.detail)
        }
    }
}

/// Identifies one connection attempt. A fresh id is used for every
/// `spawn_session` call.
pub type AttemptId = u64;

/// A broker event stamped with the attempt whose session produced it.
#[derive(Debug)]
pub struct SessionEvent {
    pub attempt: AttemptId,
    pub event: BrokerEvent,
}

/// Sending side of the event channel, bound to one attempt.
#[derive(Clone)]
pub struct EventSender {
    attempt: AttemptId,
    tx: Sender<SessionEvent>,
}

impl EventSender {
    pub fn new(attempt: AttemptId, tx: Sender<SessionEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    fn stamp(&self, event: BrokerEvent) -> SessionEvent {
        SessionEvent {
            attempt: self.attempt,
            event,
        }
    }

    /// Hands the event back when nobody listens any more.
    async fn send(&self, event: BrokerEvent) -> std::result::Result<(), BrokerEvent> {
        self.tx
            .send(self.stamp(event))
            .await
            .map_err(|err| err.into_inner().event)
    }

    fn send_blocking(&self, event: BrokerEvent) {
        let _ = self.tx.send_blocking(self.stamp(event));
    }

    fn try_send(&self, event: BrokerEvent) -> bool {
        self.tx.try_send(self.stamp(event)).is_ok()
    }
}

/// Where adapters push inbound messages for a subscription.
#[derive(Clone)]
pub struct MessageSink {
    events: EventSender,
}

impl MessageSink {
    fn new(events: EventSender) -> Self {
        Self { events }
    }

    /// Returns false once the receiving side is gone.
    pub fn deliver(&self, message: InboundMessage) -> bool {
        self.events.try_send(BrokerEvent::MessageReceived(message))
    }
}

/// A messaging client speaking to one broker endpoint.
#[async_trait::async_trait]
pub trait BrokerAdapter: Send {
    async fn connect(
        &mut self,
    ) -> std::result::Result<Option<ConnectionClosedFuture>, ConnectionError>;
    async fn disconnect(&mut self);
    /// Returns the subscription id the broker knows the subscription by.
    async fn subscribe(
        &mut self,
        destination: String,
        headers: Headers,
        sink: MessageSink,
    ) -> Result<String>;
    async fn unsubscribe(&mut self, subscription_id: String) -> Result<()>;
}

/// Builds adapters for server URLs it understands.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        params: ConnectParams,
    ) -> std::result::Result<Box<dyn BrokerAdapter>, ConnectionError>;
}

/// Control side of a live session. Dropping it disconnects and waits until
/// the session has emitted its last event.
pub struct SessionHandle {
    commands: UnboundedSender<SessionCommand>,
    finished: Option<mpsc::Receiver<()>>,
}

impl SessionHandle {
    pub fn subscribe(&self, destination: String, headers: Headers) {
        let _ = self.commands.send(SessionCommand::Subscribe {
            destination,
            headers,
        });
    }

    pub fn unsubscribe(&self, subscription_id: String) {
        let _ = self
            .commands
            .send(SessionCommand::Unsubscribe { subscription_id });
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Disconnect);
    }

    /// Drops the handle without waiting; used on the session's own thread.
    fn release(mut self) {
        self.finished = None;
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(SessionCommand::Disconnect);
        if let Some(finished) = self.finished.take() {
            // Errors once the worker dropped its end.
            let _ = finished.recv();
        }
    }
}

enum SessionCommand {
    Subscribe {
        destination: String,
        headers: Headers,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Disconnect,
}

/// Runs the adapter on its own thread. The handshake outcome arrives as
/// `Connected` (carrying the [`SessionHandle`]) or `ConnectionFailed`, and
/// every event is stamped with `events.attempt()`.
pub fn spawn_session(adapter: Box<dyn BrokerAdapter>, events: EventSender) {
    thread::spawn(move || {
        let failure_events = events.clone();
        if let Err(err) = run_worker(adapter, events) {
            let failure =
                ConnectionError::new("Failed to start the broker session.", err.to_string());
            failure_events.send_blocking(BrokerEvent::ConnectionFailed(failure));
        }
    });
}

fn run_worker(mut adapter: Box<dyn BrokerAdapter>, events: EventSender) -> Result<()> {
    let (finished_tx, finished_rx) = mpsc::channel::<()>();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let attempt = events.attempt();

    runtime.block_on(async move {
        let closed = match adapter.connect().await {
            Ok(closed) => closed,
            Err(error) => {
                tracing::warn!(attempt, "Broker connection failed: {error}");
                let _ = events.send(BrokerEvent::ConnectionFailed(error)).await;
                return;
            }
        };

        let (command_tx, mut command_rx) = unbounded_channel::<SessionCommand>();
        let handle = SessionHandle {
            commands: command_tx,
            finished: Some(finished_rx),
        };
        if let Err(BrokerEvent::Connected(handle)) =
            events.send(BrokerEvent::Connected(handle)).await
        {
            handle.release();
            adapter.disconnect().await;
            return;
        }
        tracing::debug!(attempt, "Broker session established");

        if let Some(closed) = closed {
            spawn_connection_monitor(closed, events.clone());
        }
        process_commands(adapter.as_mut(), &mut command_rx, &events).await;
        adapter.disconnect().await;
    });

    drop(runtime);
    drop(finished_tx);
    Ok(())
}

fn spawn_connection_monitor(closed: ConnectionClosedFuture, events: EventSender) {
    tokio::spawn(async move {
        let reason = closed.await;
        tracing::info!(
            attempt = events.attempt(),
            "Broker connection closed: {reason:?}"
        );
        let _ = events.send(BrokerEvent::ConnectionClosed(reason)).await;
    });
}

async fn process_commands(
    adapter: &mut dyn BrokerAdapter,
    command_rx: &mut UnboundedReceiver<SessionCommand>,
    events: &EventSender,
) {
    while let Some(command) = command_rx.recv().await {
        let event = match command {
            SessionCommand::Subscribe {
                destination,
                headers,
            } => {
                let sink = MessageSink::new(events.clone());
                match adapter.subscribe(destination.clone(), headers, sink).await {
                    Ok(subscription_id) => BrokerEvent::Subscribed {
                        subscription_id,
                        destination,
                    },
                    Err(err) => BrokerEvent::SubscriptionFailed(format!(
                        "Failed to subscribe to {destination}: {err}"
                    )),
                }
            }
            SessionCommand::Unsubscribe { subscription_id } => {
                match adapter.unsubscribe(subscription_id.clone()).await {
                    Ok(()) => BrokerEvent::Unsubscribed { subscription_id },
                    Err(err) => BrokerEvent::SubscriptionFailed(format!(
                        "Failed to unsubscribe {subscription_id}: {err}"
                    )),
                }
            }
            SessionCommand::Disconnect => break,
        };
        let _ = events.send(event).await;
    }
}
