use std::sync::Arc;

use async_channel::{Receiver, Sender};
use stompmiru_broker::{
    AttemptId, BrokerEvent, ConnectParams, EventSender, InboundMessage, SessionEvent,
    SessionHandle, Transport, spawn_session,
};
use stompmiru_core::{
    headers::{
        HeaderError, SUBSCRIPTION_ID_HEADER, ValidationError, build_auth_headers,
        build_subscription_headers, validate_field,
    },
    messages::MessageLog,
    profiles::{
        AuthField, FieldType, Profile, ProfileError, ProfileId, ProfileSet, SubscriptionField,
    },
};
use stompmiru_storage::{ConfigStore, KeyValueStore, LoadOutcome};

use crate::{
    activity::{ActivityLevel, ActivityLog},
    form::ProfileForm,
};

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("enter the server URL first")]
    EmptyServerUrl,
    #[error("enter the subscription destination first")]
    EmptyDestination,
    #[error("connect to the server first")]
    NotConnected,
    #[error("already connected or connecting; disconnect first")]
    AlreadyConnected,
    #[error("already subscribed to {0}; unsubscribe first")]
    AlreadySubscribed(String),
    #[error("there is no {kind} field #{position}")]
    NoSuchField { kind: &'static str, position: usize },
    #[error(transparent)]
    Headers(#[from] HeaderError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting(String),
    Connected(String),
    Error(String),
}

impl ConnectionStatus {
    pub fn label(&self) -> String {
        match self {
            ConnectionStatus::Disconnected => "Disconnected".into(),
            ConnectionStatus::Connecting(url) => format!("Connecting to {url}..."),
            ConnectionStatus::Connected(url) => format!("Connected to {url}"),
            ConnectionStatus::Error(message) => format!("Connection error: {message}"),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    status: ConnectionStatus,
    session: Option<SessionHandle>,
    last_error: Option<String>,
    /// Only events stamped with this attempt are applied.
    attempt: AttemptId,
}

impl ConnectionState {
    fn next_attempt(&mut self) -> AttemptId {
        self.attempt += 1;
        self.attempt
    }

    fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected(_)) && self.session.is_some()
    }

    fn is_busy(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connecting(_)) || self.session.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub id: String,
    pub destination: String,
    /// Set once the broker acknowledged the subscription.
    pub confirmed: bool,
}

/// Session controller: owns the profile store, the editor form, the broker
/// session and the message log. Every operator action is a method here.
pub struct Console<S> {
    store: ConfigStore<S>,
    form: ProfileForm,
    transport: Arc<dyn Transport>,
    connection: ConnectionState,
    subscription: Option<ActiveSubscription>,
    next_subscription: u64,
    messages: MessageLog,
    activity: ActivityLog,
    event_tx: Sender<SessionEvent>,
    event_rx: Receiver<SessionEvent>,
}

impl<S: KeyValueStore> Console<S> {
    pub fn new(store: ConfigStore<S>, transport: Arc<dyn Transport>) -> Self {
        let (event_tx, event_rx) = async_channel::unbounded();
        let form = ProfileForm::from_profile(store.active());
        let mut console = Self {
            store,
            form,
            transport,
            connection: ConnectionState::default(),
            subscription: None,
            next_subscription: 0,
            messages: MessageLog::new(),
            activity: ActivityLog::new(),
            event_tx,
            event_rx,
        };
        match console.store.outcome() {
            LoadOutcome::Migrated => console.log(
                ActivityLevel::Info,
                "Migrated profile from the old single-profile format",
            ),
            LoadOutcome::Recovered => console.log(
                ActivityLevel::Error,
                "Stored profiles could not be read, created a default profile",
            ),
            LoadOutcome::Loaded | LoadOutcome::Created => {}
        }
        console.log_loaded_profile();
        console.log(ActivityLevel::Info, "Console initialized");
        console
    }

    pub fn profiles(&self) -> &ProfileSet {
        self.store.profiles()
    }

    pub fn active_profile(&self) -> &Profile {
        self.store.active()
    }

    pub fn form(&self) -> &ProfileForm {
        &self.form
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.connection.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.connection.last_error.as_deref()
    }

    pub fn subscription(&self) -> Option<&ActiveSubscription> {
        self.subscription.as_ref()
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn event_receiver(&self) -> Receiver<SessionEvent> {
        self.event_rx.clone()
    }

    // Profiles

    pub fn new_profile(&mut self, name: &str) -> ProfileId {
        self.commit_form();
        let id = self.store.create(name);
        self.load_form();
        let message = format!("Created new profile: {}", self.store.active().name);
        self.log(ActivityLevel::Success, message);
        id
    }

    pub fn duplicate_profile(&mut self, name: &str) -> Result<ProfileId, ConsoleError> {
        self.commit_form();
        let source = self.store.profiles().active_id();
        let result = self.store.duplicate(source, name).map_err(ConsoleError::from);
        let id = self.report(result)?;
        self.load_form();
        let message = format!("Duplicated profile: {}", self.store.active().name);
        self.log(ActivityLevel::Success, message);
        Ok(id)
    }

    /// Deletes the active profile; another one becomes active.
    pub fn delete_profile(&mut self) -> Result<Profile, ConsoleError> {
        let id = self.store.profiles().active_id();
        let result = self.store.delete(id).map_err(ConsoleError::from);
        let removed = self.report(result)?;
        self.load_form();
        self.log(
            ActivityLevel::Warning,
            format!("Deleted profile: {}", removed.name),
        );
        self.log_loaded_profile();
        Ok(removed)
    }

    /// Commits pending edits to the current profile before switching.
    pub fn switch_profile(&mut self, id: ProfileId) -> Result<(), ConsoleError> {
        if !self.store.profiles().contains(id) {
            return self.report(Err(ProfileError::NotFound(id).into()));
        }
        if id == self.store.profiles().active_id() {
            return Ok(());
        }
        self.commit_form();
        self.store.switch_active(id);
        self.load_form();
        self.log_loaded_profile();
        Ok(())
    }

    pub fn rename_profile(&mut self, name: &str) -> Result<(), ConsoleError> {
        self.commit_form();
        let id = self.store.profiles().active_id();
        let result = self.store.rename(id, name).map_err(ConsoleError::from);
        self.report(result)?;
        let message = format!("Renamed profile to {}", self.store.active().name);
        self.log(ActivityLevel::Info, message);
        Ok(())
    }

    /// Drops the connection and every stored profile, then starts over with
    /// a fresh default profile.
    pub fn clear_all_profiles(&mut self) {
        self.disconnect();
        self.messages.clear();
        self.store.clear_all();
        self.load_form();
        self.log(ActivityLevel::Warning, "All profiles cleared");
        self.log_loaded_profile();
    }

    // Editor

    pub fn set_server_url(&mut self, url: &str) {
        self.form.server_url = url.to_string();
        self.commit_form();
    }

    pub fn set_destination(&mut self, destination: &str) {
        self.form.destination = destination.to_string();
        self.commit_form();
    }

    pub fn add_auth_field(&mut self, name: &str, value: &str) {
        self.form.auth_fields.push(AuthField::new(name, value));
        self.commit_form();
    }

    pub fn update_auth_field(
        &mut self,
        index: usize,
        name: &str,
        value: &str,
    ) -> Result<(), ConsoleError> {
        let Some(field) = self.form.auth_fields.get_mut(index) else {
            return self.report(Err(no_such_field("auth", index)));
        };
        field.name = name.to_string();
        field.value = value.to_string();
        self.commit_form();
        Ok(())
    }

    pub fn remove_auth_field(&mut self, index: usize) -> Result<AuthField, ConsoleError> {
        if index >= self.form.auth_fields.len() {
            return self.report(Err(no_such_field("auth", index)));
        }
        let removed = self.form.auth_fields.remove(index);
        self.commit_form();
        self.log(ActivityLevel::Info, "Auth field removed");
        Ok(removed)
    }

    pub fn add_field(&mut self, name: &str, field_type: FieldType, value: &str) {
        self.form
            .fields
            .push(SubscriptionField::new(name, field_type, value));
        self.check_field(self.form.fields.len() - 1);
        self.commit_form();
    }

    pub fn update_field(
        &mut self,
        index: usize,
        name: &str,
        field_type: FieldType,
        value: &str,
    ) -> Result<(), ConsoleError> {
        let Some(field) = self.form.fields.get_mut(index) else {
            return self.report(Err(no_such_field("subscription", index)));
        };
        *field = SubscriptionField::new(name, field_type, value);
        self.check_field(index);
        self.commit_form();
        Ok(())
    }

    pub fn remove_field(&mut self, index: usize) -> Result<SubscriptionField, ConsoleError> {
        if index >= self.form.fields.len() {
            return self.report(Err(no_such_field("subscription", index)));
        }
        let removed = self.form.fields.remove(index);
        self.commit_form();
        self.log(ActivityLevel::Info, "Field removed");
        Ok(removed)
    }

    // Session

    pub fn connect(&mut self) -> Result<(), ConsoleError> {
        if self.connection.is_busy() {
            return self.report(Err(ConsoleError::AlreadyConnected));
        }
        let server_url = self.form.server_url.trim().to_string();
        if server_url.is_empty() {
            return self.report(Err(ConsoleError::EmptyServerUrl));
        }
        let auth = match build_auth_headers(&self.form.auth_fields) {
            Ok(auth) => auth,
            Err(err) => return self.report(Err(err.into())),
        };
        for name in &auth.blank_values {
            self.log(
                ActivityLevel::Warning,
                format!("Auth header \"{name}\" has an empty value"),
            );
        }
        for (name, value) in &auth.headers {
            let shown = if value.is_empty() { "(empty)" } else { "***" };
            self.log(
                ActivityLevel::Info,
                format!("Auth header added: {name} = {shown}"),
            );
        }

        self.log(ActivityLevel::Info, format!("Connecting to {server_url}..."));
        let params = ConnectParams {
            server_url: server_url.clone(),
            headers: auth.headers,
        };
        let attempt = self.connection.next_attempt();
        match self.transport.open(params) {
            Ok(adapter) => {
                self.connection.status = ConnectionStatus::Connecting(server_url);
                self.connection.last_error = None;
                spawn_session(adapter, EventSender::new(attempt, self.event_tx.clone()));
            }
            Err(err) => {
                self.connection.status = ConnectionStatus::Error(err.user_message.clone());
                self.connection.last_error = Some(err.to_string());
                self.log(ActivityLevel::Error, format!("Connection error: {err}"));
            }
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        let was_active = self.connection.is_busy();
        // Anything still in flight for the old attempt is ignored from here on.
        self.connection.next_attempt();
        if let Some(session) = self.connection.session.take() {
            session.disconnect();
        }
        self.subscription = None;
        self.connection.status = ConnectionStatus::Disconnected;
        if was_active {
            self.log(ActivityLevel::Info, "Disconnected");
        }
    }

    pub fn subscribe(&mut self) -> Result<(), ConsoleError> {
        if !self.connection.is_connected() {
            return self.report(Err(ConsoleError::NotConnected));
        }
        if let Some(active) = &self.subscription {
            let destination = active.destination.clone();
            return self.report(Err(ConsoleError::AlreadySubscribed(destination)));
        }
        let destination = self.form.destination.trim().to_string();
        if destination.is_empty() {
            return self.report(Err(ConsoleError::EmptyDestination));
        }
        let mut headers = match build_subscription_headers(&destination, &self.form.fields) {
            Ok(headers) => headers,
            Err(err) => return self.report(Err(err.into())),
        };
        let id = match headers.get(SUBSCRIPTION_ID_HEADER) {
            Some(id) => id.clone(),
            None => {
                self.next_subscription += 1;
                let id = format!("sub-{}", self.next_subscription);
                headers.insert(SUBSCRIPTION_ID_HEADER.to_string(), id.clone());
                id
            }
        };

        self.log(ActivityLevel::Info, format!("Subscribing to: {destination}"));
        for (name, value) in &headers {
            self.log(ActivityLevel::Info, format!("Header: {name} = {value}"));
        }
        if let Some(session) = &self.connection.session {
            session.subscribe(destination.clone(), headers);
        }
        self.subscription = Some(ActiveSubscription {
            id,
            destination,
            confirmed: false,
        });
        Ok(())
    }

    /// Returns false when there was nothing to cancel.
    pub fn unsubscribe(&mut self) -> bool {
        let Some(subscription) = self.subscription.take() else {
            return false;
        };
        if let Some(session) = &self.connection.session {
            session.unsubscribe(subscription.id.clone());
        }
        self.log(
            ActivityLevel::Success,
            format!("Unsubscribed from {}", subscription.destination),
        );
        true
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.log(ActivityLevel::Info, "Messages cleared");
    }

    pub fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    pub fn handle_event(&mut self, SessionEvent { attempt, event }: SessionEvent) {
        if attempt != self.connection.attempt {
            // Dropping a stale `Connected` handle closes that session.
            tracing::debug!(attempt, "Ignoring event from an abandoned attempt: {event:?}");
            return;
        }
        match event {
            BrokerEvent::Connected(handle) => {
                let ConnectionStatus::Connecting(url) = &self.connection.status else {
                    // The operator gave up on this handshake already.
                    drop(handle);
                    return;
                };
                let url = url.clone();
                self.connection.status = ConnectionStatus::Connected(url.clone());
                self.connection.session = Some(handle);
                self.connection.last_error = None;
                self.log(ActivityLevel::Success, format!("Connected to {url}"));
            }
            BrokerEvent::ConnectionFailed(error) => {
                if !matches!(
                    self.connection.status,
                    ConnectionStatus::Connecting(_) | ConnectionStatus::Connected(_)
                ) {
                    tracing::debug!("Ignoring stale connection failure: {error}");
                    return;
                }
                self.connection.session = None;
                self.subscription = None;
                self.connection.status = ConnectionStatus::Error(error.user_message.clone());
                self.connection.last_error = Some(error.to_string());
                self.log(ActivityLevel::Error, format!("Connection error: {error}"));
            }
            BrokerEvent::ConnectionClosed(reason) => {
                if self.connection.session.take().is_none() {
                    return;
                }
                self.subscription = None;
                match reason {
                    // A close with a reason is a broker-reported failure.
                    Some(reason) => {
                        self.log(
                            ActivityLevel::Error,
                            format!("Disconnected from server: {reason}"),
                        );
                        self.connection.status = ConnectionStatus::Error(reason.clone());
                        self.connection.last_error = Some(reason);
                    }
                    None => {
                        self.connection.status = ConnectionStatus::Disconnected;
                        self.log(ActivityLevel::Warning, "Disconnected from server");
                    }
                }
            }
            BrokerEvent::Subscribed {
                subscription_id,
                destination,
            } => {
                let Some(active) = self
                    .subscription
                    .as_mut()
                    .filter(|sub| sub.id == subscription_id)
                else {
                    return;
                };
                active.confirmed = true;
                self.log(
                    ActivityLevel::Success,
                    format!("Subscribed to {destination}"),
                );
            }
            BrokerEvent::Unsubscribed { subscription_id } => {
                tracing::debug!("Broker confirmed unsubscribe of {subscription_id}");
            }
            BrokerEvent::SubscriptionFailed(message) => {
                if self.subscription.as_ref().is_some_and(|sub| !sub.confirmed) {
                    self.subscription = None;
                }
                self.log(ActivityLevel::Error, message);
            }
            BrokerEvent::MessageReceived(message) => self.record_message(message),
        }
    }

    fn record_message(&mut self, message: InboundMessage) {
        let current = self
            .subscription
            .as_ref()
            .is_some_and(|sub| sub.id == message.subscription_id);
        if !current {
            tracing::debug!(
                "Dropping message for inactive subscription {}",
                message.subscription_id
            );
            return;
        }
        let destination = message
            .destination
            .clone()
            .unwrap_or_else(|| "unknown".into());
        let message_id = message.headers.get("message-id").cloned();
        let sequence = self
            .messages
            .record(message.destination, &message.body, message.received_at)
            .sequence;
        let text = match message_id {
            Some(id) => format!("Message #{sequence} received at {destination} (id {id})"),
            None => format!("Message #{sequence} received at {destination}"),
        };
        self.log(ActivityLevel::Success, text);
    }

    fn check_field(&mut self, index: usize) {
        let Some(field) = self.form.fields.get(index) else {
            return;
        };
        if let Err(err) = validate_field(field) {
            self.log(ActivityLevel::Warning, format!("Invalid value: {err}"));
        }
    }

    /// Writes every form value into the active profile, replacing what was
    /// stored.
    fn commit_form(&mut self) {
        let profile = self.form.apply_to(self.store.active());
        if let Err(err) = self.store.update(profile) {
            self.log(ActivityLevel::Error, format!("Failed to save profile: {err}"));
        }
    }

    fn load_form(&mut self) {
        self.form = ProfileForm::from_profile(self.store.active());
    }

    fn log_loaded_profile(&mut self) {
        let message = format!("Loaded profile: {}", self.store.active().name);
        self.log(ActivityLevel::Info, message);
    }

    fn report<T>(&mut self, result: Result<T, ConsoleError>) -> Result<T, ConsoleError> {
        if let Err(err) = &result {
            self.log(ActivityLevel::Error, format!("Error: {err}"));
        }
        result
    }

    fn log(&mut self, level: ActivityLevel, message: impl Into<String>) {
        self.activity.push(level, message);
    }
}

fn no_such_field(kind: &'static str, index: usize) -> ConsoleError {
    ConsoleError::NoSuchField {
        kind,
        position: index + 1,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use stompmiru_broker::LoopbackBroker;
    use stompmiru_core::messages::MESSAGE_LOG_CAPACITY;
    use stompmiru_storage::MemoryKeyValueStore;

    use super::*;

    struct Harness {
        console: Console<MemoryKeyValueStore>,
        broker: LoopbackBroker,
        backend: MemoryKeyValueStore,
    }

    fn harness() -> Harness {
        let backend = MemoryKeyValueStore::new();
        let broker = LoopbackBroker::new();
        let store = ConfigStore::load(backend.clone());
        let mut console = Console::new(store, Arc::new(broker.clone()));
        console.set_server_url("loopback://test");
        console.update_auth_field(0, "login", "guest").unwrap();
        Harness {
            console,
            broker,
            backend,
        }
    }

    fn pump_until(
        console: &mut Console<MemoryKeyValueStore>,
        what: &str,
        done: impl Fn(&Console<MemoryKeyValueStore>) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            console.poll_events();
            if done(console) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn connected() -> Harness {
        let mut h = harness();
        h.console.connect().unwrap();
        assert!(matches!(h.console.status(), ConnectionStatus::Connecting(_)));
        pump_until(&mut h.console, "connection", |c| {
            matches!(c.status(), ConnectionStatus::Connected(_))
        });
        h
    }

    fn subscribed(destination: &str) -> Harness {
        let mut h = connected();
        h.console.set_destination(destination);
        h.console.subscribe().unwrap();
        pump_until(&mut h.console, "subscription", |c| {
            c.subscription().is_some_and(|sub| sub.confirmed)
        });
        h
    }

    #[test]
    fn connect_requires_a_named_auth_field() {
        let mut h = harness();
        while !h.console.form().auth_fields.is_empty() {
            h.console.remove_auth_field(0).unwrap();
        }
        assert!(matches!(
            h.console.connect(),
            Err(ConsoleError::Headers(HeaderError::NoAuthFields))
        ));

        h.console.add_auth_field("  ", "value");
        assert!(matches!(
            h.console.connect(),
            Err(ConsoleError::Headers(HeaderError::NoValidAuthHeaders))
        ));
        assert_eq!(h.console.status(), &ConnectionStatus::Disconnected);
        assert_eq!(h.broker.connection_count(), 0);
        assert!(h.console.activity().contains("authentication header"));
    }

    #[test]
    fn connect_requires_a_server_url() {
        let mut h = harness();
        h.console.set_server_url("   ");
        assert!(matches!(
            h.console.connect(),
            Err(ConsoleError::EmptyServerUrl)
        ));
    }

    #[test]
    fn auth_headers_are_passed_through_and_masked_in_log() {
        let mut h = harness();
        h.console.update_auth_field(1, "passcode", "s3cret").unwrap();
        h.console.connect().unwrap();
        pump_until(&mut h.console, "connection", |c| {
            matches!(c.status(), ConnectionStatus::Connected(_))
        });
        let headers = h.broker.connect_headers().unwrap();
        assert_eq!(headers["login"], "guest");
        assert_eq!(headers["passcode"], "s3cret");
        assert!(!h.console.activity().contains("s3cret"));
        assert!(h.console.activity().contains("passcode = ***"));
    }

    #[test]
    fn full_session_round_trip() {
        let mut h = connected();
        h.console.set_destination("/topic/orders/42");
        h.console.update_field(0, "count", FieldType::Number, "12.5").unwrap();
        h.console.update_field(1, "tags", FieldType::Array, "a, b ,,c").unwrap();
        h.console.subscribe().unwrap();
        pump_until(&mut h.console, "subscription", |c| {
            c.subscription().is_some_and(|sub| sub.confirmed)
        });

        let subscriptions = h.broker.subscriptions();
        assert_eq!(subscriptions.len(), 1);
        let (destination, headers) = &subscriptions[0];
        assert_eq!(destination, "/topic/orders/42");
        assert_eq!(headers["id"], "42");
        assert_eq!(headers["count"], "12.5");
        assert_eq!(headers["tags"], r#"["a","b","c"]"#);

        assert_eq!(h.broker.publish("/topic/orders/42", r#"{"total":3}"#), 1);
        pump_until(&mut h.console, "message", |c| c.messages().received() == 1);
        let message = h.console.messages().entries().next().unwrap();
        assert_eq!(message.body, "{\n  \"total\": 3\n}");
        assert_eq!(message.destination.as_deref(), Some("/topic/orders/42"));

        assert!(h.console.unsubscribe());
        assert!(!h.console.unsubscribe());
        h.console.disconnect();
        assert_eq!(h.console.status(), &ConnectionStatus::Disconnected);
        assert_eq!(h.broker.connection_count(), 0);
    }

    #[test]
    fn invalid_field_aborts_subscribe_without_sending() {
        let mut h = connected();
        h.console.set_destination("/topic/a");
        h.console.update_field(0, "ok", FieldType::String, "fine").unwrap();
        h.console.update_field(1, "count", FieldType::Number, "abc").unwrap();
        assert!(matches!(
            h.console.subscribe(),
            Err(ConsoleError::Validation(ValidationError::InvalidNumber { .. }))
        ));
        assert!(h.console.subscription().is_none());
        thread::sleep(Duration::from_millis(20));
        h.console.poll_events();
        assert!(h.broker.subscriptions().is_empty());
    }

    #[test]
    fn subscribe_requires_connection_and_destination() {
        let mut h = harness();
        assert!(matches!(h.console.subscribe(), Err(ConsoleError::NotConnected)));

        let mut h = connected();
        h.console.set_destination("  ");
        assert!(matches!(
            h.console.subscribe(),
            Err(ConsoleError::EmptyDestination)
        ));
    }

    #[test]
    fn destination_without_segment_gets_generated_id() {
        let mut h = connected();
        h.console.set_destination("/topic/");
        h.console.subscribe().unwrap();
        assert_eq!(h.console.subscription().unwrap().id, "sub-1");
        assert!(matches!(
            h.console.subscribe(),
            Err(ConsoleError::AlreadySubscribed(_))
        ));
    }

    #[test]
    fn message_log_keeps_the_latest_fifty() {
        let mut h = subscribed("/topic/feed");
        for n in 0..60 {
            h.broker.publish("/topic/feed", &format!("plain {n}"));
        }
        pump_until(&mut h.console, "sixty messages", |c| {
            c.messages().received() == 60
        });
        assert_eq!(h.console.messages().len(), MESSAGE_LOG_CAPACITY);
        let newest = h.console.messages().entries().next().unwrap();
        assert_eq!(newest.body, "plain 59");

        h.console.clear_messages();
        assert_eq!(h.console.messages().received(), 0);
    }

    #[test]
    fn refused_handshake_moves_to_error_and_can_retry() {
        let mut h = harness();
        h.broker.require_header("passcode");
        h.console.remove_auth_field(1).unwrap();
        h.console.connect().unwrap();
        pump_until(&mut h.console, "failure", |c| {
            matches!(c.status(), ConnectionStatus::Error(_))
        });
        assert!(h.console.last_error().unwrap().contains("passcode"));

        h.console.add_auth_field("passcode", "x");
        h.console.connect().unwrap();
        pump_until(&mut h.console, "connection", |c| {
            matches!(c.status(), ConnectionStatus::Connected(_))
        });
    }

    #[test]
    fn unsupported_url_reports_error_status() {
        let mut h = harness();
        h.console.set_server_url("ws://localhost:61614/stomp");
        h.console.connect().unwrap();
        assert!(matches!(h.console.status(), ConnectionStatus::Error(_)));
        assert!(h.console.connect().is_ok());
    }

    #[test]
    fn broker_close_drops_subscription() {
        let mut h = subscribed("/topic/x");
        h.broker.close_connections(Some("maintenance".into()));
        pump_until(&mut h.console, "close", |c| {
            matches!(c.status(), ConnectionStatus::Error(_))
        });
        assert!(h.console.subscription().is_none());
        assert_eq!(h.console.last_error(), Some("maintenance"));

        h.console.connect().unwrap();
        pump_until(&mut h.console, "reconnect", |c| {
            matches!(c.status(), ConnectionStatus::Connected(_))
        });
        h.broker.close_connections(None);
        pump_until(&mut h.console, "quiet close", |c| {
            c.status() == &ConnectionStatus::Disconnected
        });
    }

    #[test]
    fn disconnect_during_handshake_stays_disconnected() {
        let mut h = harness();
        h.console.connect().unwrap();
        h.console.disconnect();
        thread::sleep(Duration::from_millis(50));
        h.console.poll_events();
        assert_eq!(h.console.status(), &ConnectionStatus::Disconnected);
    }

    #[test]
    fn refused_attempt_abandoned_before_reconnect_is_ignored() {
        let mut h = harness();
        h.broker.require_header("passcode");
        h.console.remove_auth_field(1).unwrap();
        h.console.connect().unwrap();
        h.console.disconnect();
        // Let the refusal of the first attempt queue up unread.
        thread::sleep(Duration::from_millis(50));

        h.console.add_auth_field("passcode", "x");
        h.console.connect().unwrap();
        pump_until(&mut h.console, "connection", |c| {
            matches!(c.status(), ConnectionStatus::Connected(_))
        });
        thread::sleep(Duration::from_millis(20));
        h.console.poll_events();
        assert!(matches!(h.console.status(), ConnectionStatus::Connected(_)));
        assert_eq!(h.console.last_error(), None);
        assert_eq!(h.broker.connection_count(), 1);
    }

    #[test]
    fn session_from_abandoned_attempt_is_not_adopted() {
        let mut h = harness();
        h.console.set_server_url("loopback://first");
        h.console.connect().unwrap();
        h.console.disconnect();
        thread::sleep(Duration::from_millis(50));

        h.console.set_server_url("loopback://second");
        h.console.update_auth_field(0, "login", "second").unwrap();
        h.console.connect().unwrap();
        pump_until(&mut h.console, "connection", |c| {
            matches!(c.status(), ConnectionStatus::Connected(_))
        });
        pump_until(&mut h.console, "stale session teardown", |_| {
            h.broker.connection_count() == 1
        });
        assert_eq!(
            h.console.status(),
            &ConnectionStatus::Connected("loopback://second".into())
        );
        let live = h.broker.live_connect_headers();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0]["login"], "second");
    }

    #[test]
    fn edits_are_saved_as_full_overwrite() {
        let mut h = harness();
        h.console.remove_auth_field(1).unwrap();
        h.console.add_field("", FieldType::String, "draft");

        let reloaded = ConfigStore::load(h.backend.clone());
        let active = reloaded.active();
        assert_eq!(active.server_url, "loopback://test");
        assert_eq!(active.auth_fields, vec![AuthField::new("login", "guest")]);
        assert_eq!(active.fields.last().unwrap().value, "draft");
    }

    #[test]
    fn invalid_edits_warn_but_still_save() {
        let mut h = harness();
        h.console.add_field("flag", FieldType::Boolean, "yes");
        assert!(h.console.activity().contains("Invalid value"));
        assert_eq!(h.console.active_profile().fields.last().unwrap().value, "yes");
        assert_eq!(h.console.form().field_issues().len(), 1);
    }

    #[test]
    fn switching_profiles_keeps_each_profiles_edits() {
        let mut h = harness();
        let first = h.console.profiles().active_id();
        h.console.set_destination("/queue/first");
        let second = h.console.new_profile("second");
        assert_eq!(h.console.profiles().active_id(), second);
        assert_eq!(h.console.active_profile().name, "second");
        h.console.set_destination("/queue/second");

        h.console.switch_profile(first).unwrap();
        assert_eq!(h.console.form().destination, "/queue/first");
        h.console.switch_profile(second).unwrap();
        assert_eq!(h.console.form().destination, "/queue/second");
        assert!(h.console.switch_profile(ProfileId::new_v4()).is_err());
        assert_eq!(h.console.profiles().active_id(), second);
    }

    #[test]
    fn duplicate_copies_current_edits() {
        let mut h = harness();
        h.console.set_destination("/topic/dup");
        let copy = h.console.duplicate_profile("").unwrap();
        assert_eq!(h.console.profiles().active_id(), copy);
        assert_eq!(h.console.form().destination, "/topic/dup");
        assert!(h.console.active_profile().name.ends_with("(copy)"));
    }

    #[test]
    fn deleting_last_profile_is_refused() {
        let mut h = harness();
        assert!(matches!(
            h.console.delete_profile(),
            Err(ConsoleError::Profile(ProfileError::LastProfile))
        ));
        assert_eq!(h.console.profiles().len(), 1);

        let second = h.console.new_profile("b");
        let removed = h.console.delete_profile().unwrap();
        assert_eq!(removed.id, second);
        assert!(h.console.profiles().contains(h.console.profiles().active_id()));
    }

    #[test]
    fn rename_keeps_name_when_blank() {
        let mut h = harness();
        h.console.rename_profile("prod").unwrap();
        assert_eq!(h.console.active_profile().name, "prod");
        h.console.rename_profile("  ").unwrap();
        assert_eq!(h.console.active_profile().name, "prod");
    }

    #[test]
    fn clear_all_resets_everything() {
        let mut h = connected();
        h.console.new_profile("extra");
        h.console.clear_all_profiles();
        assert_eq!(h.console.profiles().len(), 1);
        assert_eq!(h.console.status(), &ConnectionStatus::Disconnected);
        assert_eq!(h.broker.connection_count(), 0);
        assert_eq!(
            h.console.form(),
            &ProfileForm::from_profile(h.console.active_profile())
        );
    }

    #[test]
    fn bad_field_index_is_reported() {
        let mut h = harness();
        let err = h.console.remove_field(9).unwrap_err();
        assert_eq!(err.to_string(), "there is no subscription field #10");
    }
}
