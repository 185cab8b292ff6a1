use std::collections::VecDeque;

use chrono::{DateTime, Utc};

pub const MESSAGE_LOG_CAPACITY: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sequence: u64,
    pub destination: Option<String>,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

/// Newest-first display list of inbound messages. The counter keeps counting
/// after old entries are evicted.
#[derive(Clone, Debug)]
pub struct MessageLog {
    entries: VecDeque<ReceivedMessage>,
    capacity: usize,
    received: u64,
    last_update: Option<DateTime<Utc>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::with_capacity(MESSAGE_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            received: 0,
            last_update: None,
        }
    }

    pub fn record(
        &mut self,
        destination: Option<String>,
        body: &str,
        received_at: DateTime<Utc>,
    ) -> &ReceivedMessage {
        self.received += 1;
        self.last_update = Some(received_at);
        self.entries.push_front(ReceivedMessage {
            sequence: self.received,
            destination,
            received_at,
            body: format_body(body),
        });
        self.entries.truncate(self.capacity);
        &self.entries[0]
    }

    pub fn entries(&self) -> impl Iterator<Item = &ReceivedMessage> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.received = 0;
        self.last_update = None;
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Pretty-prints JSON bodies; anything else is returned verbatim.
pub fn format_body(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| body.to_string()),
        Err(_) => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_capped_and_evicts_oldest() {
        let mut log = MessageLog::new();
        for n in 0..120 {
            log.record(None, &format!("msg {n}"), Utc::now());
        }
        assert_eq!(log.len(), MESSAGE_LOG_CAPACITY);
        assert_eq!(log.received(), 120);
        let newest = log.entries().next().unwrap();
        assert_eq!(newest.sequence, 120);
        assert_eq!(newest.body, "msg 119");
        let oldest = log.entries().last().unwrap();
        assert_eq!(oldest.sequence, 71);
    }

    #[test]
    fn clear_resets_counter() {
        let mut log = MessageLog::new();
        log.record(Some("/topic/a".into()), "x", Utc::now());
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.received(), 0);
        assert_eq!(log.last_update(), None);
        assert_eq!(log.record(None, "y", Utc::now()).sequence, 1);
    }

    #[test]
    fn bodies_are_pretty_printed_when_json() {
        assert_eq!(format_body(r#"{"a":1}"#), "{\n  \"a\": 1\n}");
        assert_eq!(format_body("plain text"), "plain text");
        assert_eq!(format_body(""), "");
    }
}
