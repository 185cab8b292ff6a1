use std::{collections::VecDeque, fmt};

use chrono::{DateTime, Local};

pub const ACTIVITY_LOG_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActivityLevel::Info => "info",
            ActivityLevel::Success => "success",
            ActivityLevel::Warning => "warning",
            ActivityLevel::Error => "error",
        })
    }
}

#[derive(Clone, Debug)]
pub struct ActivityEntry {
    pub seq: u64,
    pub at: DateTime<Local>,
    pub level: ActivityLevel,
    pub message: String,
}

/// Operator-facing event log, newest first.
#[derive(Debug)]
pub struct ActivityLog {
    entries: VecDeque<ActivityEntry>,
    next_seq: u64,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(ACTIVITY_LOG_CAPACITY),
            next_seq: 1,
        }
    }

    pub fn push(&mut self, level: ActivityLevel, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%level, "{message}");
        self.entries.push_front(ActivityEntry {
            seq: self.next_seq,
            at: Local::now(),
            level,
            message,
        });
        self.next_seq += 1;
        self.entries.truncate(ACTIVITY_LOG_CAPACITY);
    }

    pub fn entries(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.entries.iter()
    }

    /// Entries newer than `seq`, oldest first.
    pub fn since(&self, seq: u64) -> Vec<&ActivityEntry> {
        let mut newer: Vec<&ActivityEntry> =
            self.entries.iter().take_while(|e| e.seq > seq).collect();
        newer.reverse();
        newer
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(needle))
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}
