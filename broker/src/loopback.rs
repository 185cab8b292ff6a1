use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use stompmiru_core::{
    Result,
    headers::{Headers, SUBSCRIPTION_ID_HEADER},
};
use tokio::sync::oneshot;

use crate::{
    BrokerAdapter, ConnectParams, ConnectionClosedFuture, ConnectionError, InboundMessage,
    MessageSink, Transport,
};

pub const LOOPBACK_SCHEME: &str = "loopback";

/// In-process broker reachable through `loopback://` URLs. Messages are
/// injected with [`LoopbackBroker::publish`] and fanned out to every
/// subscription on the same destination.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    next_connection: u64,
    next_message: u64,
    connections: HashMap<u64, Connection>,
    required_headers: Vec<String>,
    last_connect_headers: Option<Headers>,
}

struct Connection {
    headers: Headers,
    subscriptions: Vec<Subscription>,
    closed_tx: Option<oneshot::Sender<Option<String>>>,
}

struct Subscription {
    id: String,
    destination: String,
    headers: Headers,
    sink: MessageSink,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses handshakes that do not carry `name`.
    pub fn require_header(&self, name: impl Into<String>) {
        self.state().required_headers.push(name.into());
    }

    /// Delivers `body` to every subscription on `destination`. Returns the
    /// number of subscriptions reached.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let mut state = self.state();
        state.next_message += 1;
        let message_id = format!("loopback-{}", state.next_message);
        let mut delivered = 0;
        for connection in state.connections.values() {
            for subscription in connection
                .subscriptions
                .iter()
                .filter(|sub| sub.destination == destination)
            {
                let mut headers = Headers::new();
                headers.insert("destination".into(), destination.to_string());
                headers.insert("message-id".into(), message_id.clone());
                headers.insert("subscription".into(), subscription.id.clone());
                let message = InboundMessage {
                    subscription_id: subscription.id.clone(),
                    destination: Some(destination.to_string()),
                    headers,
                    body: body.to_string(),
                    received_at: Utc::now(),
                };
                if subscription.sink.deliver(message) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Drops every connection from the broker side.
    pub fn close_connections(&self, reason: Option<String>) {
        let mut state = self.state();
        for (_, mut connection) in state.connections.drain() {
            if let Some(closed_tx) = connection.closed_tx.take() {
                let _ = closed_tx.send(reason.clone());
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn connect_headers(&self) -> Option<Headers> {
        self.state().last_connect_headers.clone()
    }

    /// CONNECT headers of every live connection, oldest first.
    pub fn live_connect_headers(&self) -> Vec<Headers> {
        let state = self.state();
        let mut live: Vec<(&u64, &Connection)> = state.connections.iter().collect();
        live.sort_by_key(|(id, _)| **id);
        live.into_iter()
            .map(|(_, connection)| connection.headers.clone())
            .collect()
    }

    /// `(destination, headers)` of every live subscription.
    pub fn subscriptions(&self) -> Vec<(String, Headers)> {
        self.state()
            .connections
            .values()
            .flat_map(|connection| connection.subscriptions.iter())
            .map(|sub| (sub.destination.clone(), sub.headers.clone()))
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for LoopbackBroker {
    fn open(
        &self,
        params: ConnectParams,
    ) -> std::result::Result<Box<dyn BrokerAdapter>, ConnectionError> {
        let url = params.server_url.trim();
        let supported = url
            .split_once("://")
            .is_some_and(|(scheme, _)| scheme.eq_ignore_ascii_case(LOOPBACK_SCHEME));
        if !supported {
            return Err(ConnectionError::new(
                "Only loopback:// endpoints are available in this build.",
                url,
            ));
        }
        Ok(Box::new(LoopbackAdapter {
            broker: self.clone(),
            params,
            connection: None,
            next_subscription: 0,
        }))
    }
}

struct LoopbackAdapter {
    broker: LoopbackBroker,
    params: ConnectParams,
    connection: Option<u64>,
    next_subscription: u64,
}

impl LoopbackAdapter {
    fn connection_id(&self) -> Result<u64> {
        match self.connection {
            Some(id) => Ok(id),
            None => bail!("Loopback client is not connected."),
        }
    }
}

#[async_trait]
impl BrokerAdapter for LoopbackAdapter {
    async fn connect(
        &mut self,
    ) -> std::result::Result<Option<ConnectionClosedFuture>, ConnectionError> {
        let (closed_tx, closed_rx) = oneshot::channel::<Option<String>>();
        {
            let mut state = self.broker.state();
            state.last_connect_headers = Some(self.params.headers.clone());
            if let Some(missing) = state
                .required_headers
                .iter()
                .find(|name| !self.params.headers.contains_key(name.as_str()))
            {
                return Err(ConnectionError::new(
                    "Access refused by broker.",
                    format!("missing `{missing}` header"),
                ));
            }
            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(
                id,
                Connection {
                    headers: self.params.headers.clone(),
                    subscriptions: Vec::new(),
                    closed_tx: Some(closed_tx),
                },
            );
            self.connection = Some(id);
        }
        let monitor = Box::pin(async move {
            match closed_rx.await {
                Ok(reason) => reason,
                // Sender dropped by a local disconnect: nothing to report.
                Err(_) => std::future::pending().await,
            }
        });
        Ok(Some(monitor))
    }

    async fn disconnect(&mut self) {
        if let Some(id) = self.connection.take() {
            self.broker.state().connections.remove(&id);
        }
    }

    async fn subscribe(
        &mut self,
        destination: String,
        headers: Headers,
        sink: MessageSink,
    ) -> Result<String> {
        let connection_id = self.connection_id()?;
        self.next_subscription += 1;
        let id = headers
            .get(SUBSCRIPTION_ID_HEADER)
            .cloned()
            .unwrap_or_else(|| format!("sub-{}", self.next_subscription));
        let mut state = self.broker.state();
        let Some(connection) = state.connections.get_mut(&connection_id) else {
            bail!("Loopback connection was closed.");
        };
        if connection.subscriptions.iter().any(|sub| sub.id == id) {
            bail!("Subscription id `{id}` is already in use.");
        }
        connection.subscriptions.push(Subscription {
            id: id.clone(),
            destination,
            headers,
            sink,
        });
        Ok(id)
    }

    async fn unsubscribe(&mut self, subscription_id: String) -> Result<()> {
        let connection_id = self.connection_id()?;
        let mut state = self.broker.state();
        if let Some(connection) = state.connections.get_mut(&connection_id) {
            connection
                .subscriptions
                .retain(|sub| sub.id != subscription_id);
        }
        Ok(())
    }
}
